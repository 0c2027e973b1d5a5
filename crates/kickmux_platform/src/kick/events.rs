#![forbid(unsafe_code)]

//! Payload parsing for Kick application events.

use kickmux_domain::{ChatMessage, LiveStatus, PinnedMessage, ReplyRef, RoomId, Sender};
use serde::Deserialize;

use super::pusher::KickEvent;

/// Kick ids arrive as numbers or strings depending on the endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum FlexId {
	Num(u64),
	Str(String),
}

impl FlexId {
	pub(crate) fn into_string(self) -> String {
		match self {
			Self::Num(n) => n.to_string(),
			Self::Str(s) => s,
		}
	}
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMessage {
	id: FlexId,
	#[serde(default)]
	chatroom_id: Option<FlexId>,
	#[serde(default)]
	content: String,
	#[serde(default)]
	created_at: Option<String>,
	sender: WireSender,
	#[serde(default)]
	metadata: Option<WireMetadata>,
}

#[derive(Debug, Deserialize)]
struct WireSender {
	id: FlexId,
	username: String,
	#[serde(default)]
	slug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMetadata {
	#[serde(default)]
	original_sender: Option<WireOriginalSender>,
	#[serde(default)]
	original_message: Option<WireOriginalMessage>,
}

#[derive(Debug, Deserialize)]
struct WireOriginalSender {
	#[serde(default)]
	username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireOriginalMessage {
	id: FlexId,
	#[serde(default)]
	content: Option<String>,
}

impl WireMessage {
	pub(crate) fn into_message(self, fallback_room: &RoomId) -> ChatMessage {
		let room_id = self
			.chatroom_id
			.and_then(|id| RoomId::new(id.into_string()).ok())
			.unwrap_or_else(|| fallback_room.clone());

		let reply_to = self.metadata.and_then(|meta| {
			let original = meta.original_message?;
			Some(ReplyRef {
				message_id: original.id.into_string(),
				sender_username: meta.original_sender.and_then(|s| s.username),
				content: original.content,
			})
		});

		ChatMessage {
			id: self.id.into_string(),
			room_id,
			sender: Sender {
				id: self.sender.id.into_string(),
				username: self.sender.username,
				slug: self.sender.slug,
			},
			content: self.content,
			created_at: self.created_at,
			reply_to,
		}
	}
}

#[derive(Debug, Deserialize)]
pub(crate) struct WirePinned {
	message: WireMessage,
	#[serde(default)]
	duration: Option<FlexId>,
	#[serde(default, rename = "pinnedBy")]
	pinned_by: Option<WirePinnedBy>,
}

#[derive(Debug, Deserialize)]
struct WirePinnedBy {
	#[serde(default)]
	username: Option<String>,
}

impl WirePinned {
	pub(crate) fn into_pinned(self, room_id: &RoomId) -> PinnedMessage {
		PinnedMessage {
			message: self.message.into_message(room_id),
			pinned_by: self.pinned_by.and_then(|p| p.username),
			duration_secs: self.duration.and_then(|d| d.into_string().parse().ok()),
		}
	}
}

#[derive(Debug, Deserialize)]
struct LivestreamEnvelope {
	#[serde(default)]
	livestream: Option<WireLivestream>,
}

#[derive(Debug, Deserialize)]
struct WireLivestream {
	#[serde(default)]
	id: Option<FlexId>,
	#[serde(default)]
	session_title: Option<String>,
	#[serde(default)]
	viewers: Option<u64>,
}

pub fn parse_chat_message(room_id: &RoomId, payload: &serde_json::Value) -> Option<ChatMessage> {
	let wire = WireMessage::deserialize(payload).ok()?;
	Some(wire.into_message(room_id))
}

/// `Some(None)` for an unpin.
pub fn parse_pinned_change(
	kind: &KickEvent,
	room_id: &RoomId,
	payload: &serde_json::Value,
) -> Option<Option<PinnedMessage>> {
	match kind {
		KickEvent::PinnedMessageCreated => {
			let wire = WirePinned::deserialize(payload).ok()?;
			Some(Some(wire.into_pinned(room_id)))
		}
		KickEvent::PinnedMessageDeleted => Some(None),
		_ => None,
	}
}

pub fn parse_live_status(kind: &KickEvent, payload: &serde_json::Value) -> Option<LiveStatus> {
	match kind {
		KickEvent::StreamerIsLive | KickEvent::LivestreamUpdated => {
			let livestream = LivestreamEnvelope::deserialize(payload).ok()?.livestream;
			let (livestream_id, title, viewer_count) = match livestream {
				Some(ls) => (ls.id.map(FlexId::into_string), ls.session_title, ls.viewers),
				None => (None, None, None),
			};
			Some(LiveStatus::Live {
				livestream_id,
				title,
				viewer_count,
			})
		}
		KickEvent::StopStreamBroadcast => Some(LiveStatus::Offline),
		_ => None,
	}
}
