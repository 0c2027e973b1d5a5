#![forbid(unsafe_code)]

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use kickmux_domain::{Provider, RoomRegistration};
use serde::{Deserialize, Serialize};

use crate::EventKind;
use crate::protocol::{FrameError, InboundFrame, ProviderProtocol, SubscriptionKey};

pub const SEVENTV_EVENT_API_URL: &str = "wss://events.7tv.io/v3";

const OP_DISPATCH: u32 = 0;
const OP_HELLO: u32 = 1;
const OP_HEARTBEAT: u32 = 2;
const OP_RECONNECT: u32 = 4;
const OP_ACK: u32 = 5;
const OP_ERROR: u32 = 6;
const OP_END_OF_STREAM: u32 = 7;
const OP_SUBSCRIBE: u32 = 35;
const OP_UNSUBSCRIBE: u32 = 36;

/// Subscribable 7TV resource families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
	User,
	EmoteSet,
	Cosmetic,
	Entitlement,
}

impl Resource {
	/// Wildcard subscription type, e.g. `emote_set.*`.
	pub const fn pattern(self) -> &'static str {
		match self {
			Self::User => "user.*",
			Self::EmoteSet => "emote_set.*",
			Self::Cosmetic => "cosmetic.*",
			Self::Entitlement => "entitlement.*",
		}
	}
}

/// Subscription condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Condition {
	Object { object_id: String },
	Channel { platform: String, ctx: String, id: String },
}

impl Condition {
	pub fn object(id: impl Into<String>) -> Self {
		Self::Object { object_id: id.into() }
	}

	/// Events for a Kick channel, keyed by the broadcaster's Kick user id.
	pub fn kick_channel(user_id: impl Into<String>) -> Self {
		Self::Channel {
			platform: "KICK".to_string(),
			ctx: "channel".to_string(),
			id: user_id.into(),
		}
	}
}

impl fmt::Display for Condition {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Object { object_id } => f.write_str(object_id),
			Self::Channel { platform, ctx, id } => write!(f, "{platform}/{ctx}/{id}"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SevenTvTopic {
	pub resource: Resource,
	pub condition: Condition,
}

impl SevenTvTopic {
	pub fn key(&self) -> SubscriptionKey {
		SubscriptionKey::new(format!("{}:{}", self.resource.pattern(), self.condition))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DispatchType {
	#[serde(rename = "system.announcement")]
	SystemAnnouncement,
	#[serde(rename = "emote.create")]
	EmoteCreate,
	#[serde(rename = "emote.update")]
	EmoteUpdate,
	#[serde(rename = "emote.delete")]
	EmoteDelete,
	#[serde(rename = "emote_set.create")]
	EmoteSetCreate,
	#[serde(rename = "emote_set.update")]
	EmoteSetUpdate,
	#[serde(rename = "emote_set.delete")]
	EmoteSetDelete,
	#[serde(rename = "user.create")]
	UserCreate,
	#[serde(rename = "user.update")]
	UserUpdate,
	#[serde(rename = "user.delete")]
	UserDelete,
	#[serde(rename = "cosmetic.create")]
	CosmeticCreate,
	#[serde(rename = "cosmetic.update")]
	CosmeticUpdate,
	#[serde(rename = "cosmetic.delete")]
	CosmeticDelete,
	#[serde(rename = "entitlement.create")]
	EntitlementCreate,
	#[serde(rename = "entitlement.update")]
	EntitlementUpdate,
	#[serde(rename = "entitlement.delete")]
	EntitlementDelete,
	#[serde(other)]
	Unknown,
}

impl DispatchType {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::SystemAnnouncement => "system.announcement",
			Self::EmoteCreate => "emote.create",
			Self::EmoteUpdate => "emote.update",
			Self::EmoteDelete => "emote.delete",
			Self::EmoteSetCreate => "emote_set.create",
			Self::EmoteSetUpdate => "emote_set.update",
			Self::EmoteSetDelete => "emote_set.delete",
			Self::UserCreate => "user.create",
			Self::UserUpdate => "user.update",
			Self::UserDelete => "user.delete",
			Self::CosmeticCreate => "cosmetic.create",
			Self::CosmeticUpdate => "cosmetic.update",
			Self::CosmeticDelete => "cosmetic.delete",
			Self::EntitlementCreate => "entitlement.create",
			Self::EntitlementUpdate => "entitlement.update",
			Self::EntitlementDelete => "entitlement.delete",
			Self::Unknown => "unknown",
		}
	}

	/// Resource family with per-object subscriptions, if any.
	pub const fn object_resource(&self) -> Option<Resource> {
		match self {
			Self::EmoteSetCreate | Self::EmoteSetUpdate | Self::EmoteSetDelete => Some(Resource::EmoteSet),
			Self::UserCreate | Self::UserUpdate | Self::UserDelete => Some(Resource::User),
			_ => None,
		}
	}

	pub const fn is_emote_set(&self) -> bool {
		matches!(self, Self::EmoteSetCreate | Self::EmoteSetUpdate | Self::EmoteSetDelete)
	}
}

#[derive(Debug, Deserialize)]
struct Envelope {
	op: u32,
	#[serde(default)]
	d: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Dispatch {
	#[serde(rename = "type")]
	dispatch_type: DispatchType,
	#[serde(default)]
	body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Hello {
	session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
	#[serde(default)]
	message: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutgoingFrame<'a> {
	op: u32,
	t: u64,
	d: SubscriptionData<'a>,
}

#[derive(Debug, Serialize)]
struct SubscriptionData<'a> {
	#[serde(rename = "type")]
	subscription_type: &'a str,
	condition: &'a Condition,
}

fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

/// 7TV EventAPI v3: emote set, user and cosmetic updates.
#[derive(Debug, Clone)]
pub struct EventApiProtocol {
	url: String,
}

impl EventApiProtocol {
	pub fn new(url: impl Into<String>) -> Self {
		Self { url: url.into() }
	}

	fn encode(&self, op: u32, topic: &SevenTvTopic) -> anyhow::Result<String> {
		Ok(serde_json::to_string(&OutgoingFrame {
			op,
			t: now_ms(),
			d: SubscriptionData {
				subscription_type: topic.resource.pattern(),
				condition: &topic.condition,
			},
		})?)
	}
}

impl Default for EventApiProtocol {
	fn default() -> Self {
		Self::new(SEVENTV_EVENT_API_URL)
	}
}

impl ProviderProtocol for EventApiProtocol {
	type Topic = SevenTvTopic;

	fn provider(&self) -> Provider {
		Provider::SevenTv
	}

	fn url(&self) -> &str {
		&self.url
	}

	fn topic_key(&self, topic: &SevenTvTopic) -> SubscriptionKey {
		topic.key()
	}

	fn requires_auth(&self, _topic: &SevenTvTopic) -> bool {
		false
	}

	fn global_topics(&self) -> Vec<SevenTvTopic> {
		Vec::new()
	}

	fn room_topics(&self, room: &RoomRegistration) -> Vec<SevenTvTopic> {
		let channels = &room.channels;
		let mut topics = Vec::new();
		if let Some(user_id) = channels.seventv_user_id.as_deref() {
			topics.push(SevenTvTopic {
				resource: Resource::User,
				condition: Condition::object(user_id),
			});
		}
		if let Some(set_id) = channels.seventv_emote_set_id.as_deref() {
			topics.push(SevenTvTopic {
				resource: Resource::EmoteSet,
				condition: Condition::object(set_id),
			});
		}
		if let Some(kick_user_id) = channels.user_id.as_deref() {
			for resource in [Resource::Cosmetic, Resource::Entitlement] {
				topics.push(SevenTvTopic {
					resource,
					condition: Condition::kick_channel(kick_user_id),
				});
			}
		}
		topics
	}

	fn status_topics(&self, _room: &RoomRegistration) -> Vec<SevenTvTopic> {
		Vec::new()
	}

	fn encode_subscribe(&self, topic: &SevenTvTopic, _auth: Option<&str>) -> anyhow::Result<String> {
		self.encode(OP_SUBSCRIBE, topic)
	}

	fn encode_unsubscribe(&self, topic: &SevenTvTopic) -> anyhow::Result<String> {
		self.encode(OP_UNSUBSCRIBE, topic)
	}

	fn encode_pong(&self) -> Option<String> {
		None
	}

	fn decode(&self, text: &str) -> Result<InboundFrame, FrameError> {
		let envelope: Envelope = serde_json::from_str(text)?;
		let frame = match envelope.op {
			OP_DISPATCH => {
				let dispatch: Dispatch = serde_json::from_value(envelope.d)?;
				let object_id = dispatch.body.get("id").and_then(|id| id.as_str());
				// Cosmetics and entitlements are not keyed by object; deliver connection-wide.
				let route = match (dispatch.dispatch_type.object_resource(), object_id) {
					(Some(resource), Some(id)) => Some(
						SevenTvTopic {
							resource,
							condition: Condition::object(id),
						}
						.key(),
					),
					_ => None,
				};
				InboundFrame::Event {
					route,
					kind: EventKind::SevenTv(dispatch.dispatch_type),
					payload: dispatch.body,
				}
			}
			OP_HELLO => {
				let hello: Hello = serde_json::from_value(envelope.d)?;
				let session_id = hello.session_id.ok_or(FrameError::MissingField("session_id"))?;
				InboundFrame::Handshake { session_id }
			}
			OP_HEARTBEAT => InboundFrame::Heartbeat,
			OP_RECONNECT => InboundFrame::ReconnectRequested {
				reason: "server requested reconnect".to_string(),
			},
			OP_ACK => InboundFrame::SubscriptionAck { key: None },
			OP_ERROR => {
				let err: ErrorData = serde_json::from_value(envelope.d).unwrap_or(ErrorData { message: None });
				InboundFrame::ServerError {
					message: err.message.unwrap_or_else(|| "unknown error".to_string()),
				}
			}
			OP_END_OF_STREAM => InboundFrame::ReconnectRequested {
				reason: "end of stream".to_string(),
			},
			_ => InboundFrame::Ignored,
		};
		Ok(frame)
	}
}
