#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use kickmux_domain::{Provider, RoomId, RoomRegistration};
use serde::{Deserialize, Serialize};

use crate::EventKind;
use crate::protocol::{FrameError, InboundFrame, ProviderProtocol, SubscriptionKey};

pub const KICK_PUSHER_URL: &str =
	"wss://ws-us2.pusher.com/app/32cbd69e4b950bf97679?protocol=7&client=js&version=8.4.0-rc2&flash=false";

const EVENT_PREFIX: &str = "App\\Events\\";

/// Kick application event names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KickEvent {
	ChatMessage,
	MessageDeleted,
	UserBanned,
	UserUnbanned,
	PinnedMessageCreated,
	PinnedMessageDeleted,
	ChatroomUpdated,
	ChatroomClear,
	StreamerIsLive,
	StopStreamBroadcast,
	LivestreamUpdated,
	PollUpdate,
	PollDelete,
	Subscription,
	GiftedSubscriptions,
	StreamHost,
	Unknown(String),
}

impl KickEvent {
	/// Map a wire event name, with or without the `App\Events\` prefix.
	pub fn from_name(name: &str) -> Self {
		let name = name.strip_prefix(EVENT_PREFIX).unwrap_or(name);
		match name {
			"ChatMessageEvent" => Self::ChatMessage,
			"MessageDeletedEvent" => Self::MessageDeleted,
			"UserBannedEvent" => Self::UserBanned,
			"UserUnbannedEvent" => Self::UserUnbanned,
			"PinnedMessageCreatedEvent" => Self::PinnedMessageCreated,
			"PinnedMessageDeletedEvent" => Self::PinnedMessageDeleted,
			"ChatroomUpdatedEvent" => Self::ChatroomUpdated,
			"ChatroomClearEvent" => Self::ChatroomClear,
			"StreamerIsLive" => Self::StreamerIsLive,
			"StopStreamBroadcast" => Self::StopStreamBroadcast,
			"LivestreamUpdated" => Self::LivestreamUpdated,
			"PollUpdateEvent" => Self::PollUpdate,
			"PollDeleteEvent" => Self::PollDelete,
			"SubscriptionEvent" => Self::Subscription,
			"GiftedSubscriptionsEvent" => Self::GiftedSubscriptions,
			"StreamHostEvent" => Self::StreamHost,
			other => Self::Unknown(other.to_string()),
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			Self::ChatMessage => "ChatMessageEvent",
			Self::MessageDeleted => "MessageDeletedEvent",
			Self::UserBanned => "UserBannedEvent",
			Self::UserUnbanned => "UserUnbannedEvent",
			Self::PinnedMessageCreated => "PinnedMessageCreatedEvent",
			Self::PinnedMessageDeleted => "PinnedMessageDeletedEvent",
			Self::ChatroomUpdated => "ChatroomUpdatedEvent",
			Self::ChatroomClear => "ChatroomClearEvent",
			Self::StreamerIsLive => "StreamerIsLive",
			Self::StopStreamBroadcast => "StopStreamBroadcast",
			Self::LivestreamUpdated => "LivestreamUpdated",
			Self::PollUpdate => "PollUpdateEvent",
			Self::PollDelete => "PollDeleteEvent",
			Self::Subscription => "SubscriptionEvent",
			Self::GiftedSubscriptions => "GiftedSubscriptionsEvent",
			Self::StreamHost => "StreamHostEvent",
			Self::Unknown(name) => name,
		}
	}
}

impl fmt::Display for KickEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Pusher channel name reference, recovered from a channel string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRef {
	Chatroom(String),
	Channel(String),
	Livestream(String),
}

/// Parse `chatrooms.<id>[.v2]`, `rooms.<id>[.v2]`, `chatroom_<id>`,
/// `channel.<id>` and `private-livestream.<id>`.
pub fn parse_channel(channel: &str) -> Option<ChannelRef> {
	fn numeric(id: &str) -> Option<String> {
		(!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
	}

	if let Some(rest) = channel.strip_prefix("chatrooms.").or_else(|| channel.strip_prefix("rooms.")) {
		let id = rest.strip_suffix(".v2").unwrap_or(rest);
		return numeric(id).map(ChannelRef::Chatroom);
	}
	if let Some(id) = channel.strip_prefix("chatroom_") {
		return numeric(id).map(ChannelRef::Chatroom);
	}
	if let Some(id) = channel.strip_prefix("channel.") {
		return numeric(id).map(ChannelRef::Channel);
	}
	if let Some(id) = channel.strip_prefix("private-livestream.") {
		return numeric(id).map(ChannelRef::Livestream);
	}
	None
}

/// Kick chat over the Pusher websocket protocol.
#[derive(Debug, Clone)]
pub struct PusherProtocol {
	url: String,
	user_id: Option<String>,
}

impl PusherProtocol {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			user_id: None,
		}
	}

	/// Subscribe to the private user feed of the local identity.
	pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
		self.user_id = user_id.filter(|id| !id.trim().is_empty());
		self
	}
}

impl Default for PusherProtocol {
	fn default() -> Self {
		Self::new(KICK_PUSHER_URL)
	}
}

#[derive(Debug, Serialize)]
struct OutgoingFrame<'a, D: Serialize> {
	event: &'a str,
	data: D,
}

#[derive(Debug, Serialize)]
struct SubscribeData<'a> {
	auth: &'a str,
	channel: &'a str,
}

#[derive(Debug, Serialize)]
struct UnsubscribeData<'a> {
	channel: &'a str,
}

#[derive(Debug, Deserialize)]
struct Envelope {
	event: String,
	#[serde(default)]
	data: Option<serde_json::Value>,
	#[serde(default)]
	channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectionEstablished {
	socket_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PusherError {
	#[serde(default)]
	code: Option<u32>,
	#[serde(default)]
	message: Option<String>,
}

/// Pusher sends `data` as a JSON-encoded string; fall back to the raw value.
fn unwrap_data(data: Option<serde_json::Value>) -> serde_json::Value {
	match data {
		Some(serde_json::Value::String(s)) => {
			serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))
		}
		Some(value) => value,
		None => serde_json::Value::Null,
	}
}

impl ProviderProtocol for PusherProtocol {
	type Topic = String;

	fn provider(&self) -> Provider {
		Provider::Kick
	}

	fn url(&self) -> &str {
		&self.url
	}

	fn topic_key(&self, topic: &String) -> SubscriptionKey {
		SubscriptionKey::new(topic.clone())
	}

	fn requires_auth(&self, topic: &String) -> bool {
		topic.starts_with("private-")
	}

	fn global_topics(&self) -> Vec<String> {
		self.user_id
			.iter()
			.map(|id| format!("private-userfeed.{id}"))
			.collect()
	}

	fn room_topics(&self, room: &RoomRegistration) -> Vec<String> {
		let id = room.room_id.as_str();
		let mut topics = vec![format!("chatrooms.{id}.v2"), format!("chatroom_{id}")];
		if let Some(channel_id) = room.channels.channel_id.as_deref() {
			topics.push(format!("channel.{channel_id}"));
		}
		topics
	}

	fn status_topics(&self, room: &RoomRegistration) -> Vec<String> {
		match (room.is_live, room.channels.livestream_id.as_deref()) {
			(true, Some(livestream_id)) => vec![format!("private-livestream.{livestream_id}")],
			_ => Vec::new(),
		}
	}

	fn encode_subscribe(&self, topic: &String, auth: Option<&str>) -> anyhow::Result<String> {
		Ok(serde_json::to_string(&OutgoingFrame {
			event: "pusher:subscribe",
			data: SubscribeData {
				auth: auth.unwrap_or(""),
				channel: topic,
			},
		})?)
	}

	fn encode_unsubscribe(&self, topic: &String) -> anyhow::Result<String> {
		Ok(serde_json::to_string(&OutgoingFrame {
			event: "pusher:unsubscribe",
			data: UnsubscribeData { channel: topic },
		})?)
	}

	fn encode_pong(&self) -> Option<String> {
		Some(r#"{"event":"pusher:pong","data":{}}"#.to_string())
	}

	fn decode(&self, text: &str) -> Result<InboundFrame, FrameError> {
		let envelope: Envelope = serde_json::from_str(text)?;
		let data = unwrap_data(envelope.data);

		let frame = match envelope.event.as_str() {
			"pusher:connection_established" => {
				let established: ConnectionEstablished = serde_json::from_value(data)?;
				let session_id = established
					.socket_id
					.filter(|id| !id.is_empty())
					.ok_or(FrameError::MissingField("socket_id"))?;
				InboundFrame::Handshake { session_id }
			}
			"pusher_internal:subscription_succeeded" => InboundFrame::SubscriptionAck {
				key: envelope.channel.map(SubscriptionKey::new),
			},
			"pusher:ping" => InboundFrame::Ping,
			"pusher:pong" => InboundFrame::Heartbeat,
			"pusher:error" => {
				let err: PusherError = serde_json::from_value(data).unwrap_or(PusherError {
					code: None,
					message: None,
				});
				let message = err.message.unwrap_or_else(|| "unknown error".to_string());
				match err.code {
					// 4100-4299: reconnect (with or without backoff).
					Some(code) if (4100..4300).contains(&code) => InboundFrame::ReconnectRequested {
						reason: format!("pusher error {code}: {message}"),
					},
					Some(code) => InboundFrame::ServerError {
						message: format!("pusher error {code}: {message}"),
					},
					None => InboundFrame::ServerError { message },
				}
			}
			"pusher:subscription_error" => InboundFrame::ServerError {
				message: format!(
					"subscription error on {}: {}",
					envelope.channel.as_deref().unwrap_or("?"),
					data
				),
			},
			other if other.starts_with("pusher:") || other.starts_with("pusher_internal:") => InboundFrame::Ignored,
			other => InboundFrame::Event {
				route: envelope.channel.map(SubscriptionKey::new),
				kind: EventKind::Kick(KickEvent::from_name(other)),
				payload: data,
			},
		};
		Ok(frame)
	}

	fn room_for_key(&self, key: &SubscriptionKey, rooms: &BTreeMap<RoomId, RoomRegistration>) -> Option<RoomId> {
		match parse_channel(key.as_str())? {
			ChannelRef::Chatroom(id) => rooms.keys().find(|room_id| room_id.as_str() == id).cloned(),
			ChannelRef::Channel(id) => rooms
				.values()
				.find(|room| room.channels.channel_id.as_deref() == Some(id.as_str()))
				.map(|room| room.room_id.clone()),
			ChannelRef::Livestream(id) => rooms
				.values()
				.find(|room| room.channels.livestream_id.as_deref() == Some(id.as_str()))
				.map(|room| room.room_id.clone()),
		}
	}
}
