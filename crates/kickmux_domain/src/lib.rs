#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upstream providers with a persistent socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
	/// Kick chat (Pusher protocol).
	Kick,
	/// 7TV EventAPI (emotes and cosmetics).
	SevenTv,
}

impl Provider {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Provider::Kick => "kick",
			Provider::SevenTv => "7tv",
		}
	}
}

impl fmt::Display for Provider {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown provider: {0}")]
	UnknownProvider(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Provider {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"kick" => Ok(Provider::Kick),
			"7tv" | "seventv" | "seven_tv" => Ok(Provider::SevenTv),
			other => Err(ParseIdError::UnknownProvider(other.to_string())),
		}
	}
}

/// Room identifier (the Kick chatroom id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Provider-side identifiers used to derive subscription keys for a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomChannels {
	/// Kick channel id (`channel.<id>` events).
	#[serde(default)]
	pub channel_id: Option<String>,

	/// Kick user id of the broadcaster (7TV cosmetics condition).
	#[serde(default)]
	pub user_id: Option<String>,

	/// Current Kick livestream id, when live.
	#[serde(default)]
	pub livestream_id: Option<String>,

	#[serde(default)]
	pub seventv_user_id: Option<String>,

	#[serde(default)]
	pub seventv_emote_set_id: Option<String>,
}

/// A room as registered with the pooled connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRegistration {
	pub room_id: RoomId,

	/// Channel slug (`kick.com/<slug>`).
	pub slug: String,

	/// Admission priority and gate for status-dependent subscriptions.
	#[serde(default)]
	pub is_live: bool,

	#[serde(default)]
	pub channels: RoomChannels,
}

impl RoomRegistration {
	pub fn new(room_id: RoomId, slug: impl Into<String>) -> Self {
		Self {
			room_id,
			slug: slug.into(),
			is_live: false,
			channels: RoomChannels::default(),
		}
	}

	/// Apply a live status change. Returns true when anything changed.
	pub fn apply_live_status(&mut self, status: &LiveStatus) -> bool {
		let (is_live, livestream_id) = match status {
			LiveStatus::Live { livestream_id, .. } => (true, livestream_id.clone()),
			LiveStatus::Offline => (false, None),
		};

		let changed = self.is_live != is_live || self.channels.livestream_id != livestream_id;
		self.is_live = is_live;
		self.channels.livestream_id = livestream_id;
		changed
	}
}

/// Broadcast status of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LiveStatus {
	Live {
		#[serde(default)]
		livestream_id: Option<String>,
		#[serde(default)]
		title: Option<String>,
		#[serde(default)]
		viewer_count: Option<u64>,
	},
	Offline,
}

impl LiveStatus {
	pub fn is_live(&self) -> bool {
		matches!(self, Self::Live { .. })
	}
}

/// Room metadata returned alongside the live status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
	#[serde(default)]
	pub channel_id: Option<String>,
	#[serde(default)]
	pub user_id: Option<String>,
	#[serde(default)]
	pub category: Option<String>,
}

/// Result of a room info fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
	pub live_status: LiveStatus,
	pub metadata: RoomMetadata,
}

/// Source of an emote set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmoteSource {
	Kick,
	SevenTv,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emote {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub animated: bool,
	#[serde(default)]
	pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteSet {
	pub id: String,
	pub name: String,
	pub source: EmoteSource,

	/// Provider-side owner id (the 7TV user id for 7TV sets).
	#[serde(default)]
	pub owner_id: Option<String>,

	pub emotes: Vec<Emote>,
}

/// Chat message author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
	pub id: String,
	pub username: String,
	#[serde(default)]
	pub slug: Option<String>,
}

/// Reply preview attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
	pub message_id: String,
	#[serde(default)]
	pub sender_username: Option<String>,
	#[serde(default)]
	pub content: Option<String>,
}

/// Normalized chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub id: String,
	pub room_id: RoomId,
	pub sender: Sender,
	pub content: String,
	#[serde(default)]
	pub created_at: Option<String>,
	#[serde(default)]
	pub reply_to: Option<ReplyRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedMessage {
	pub message: ChatMessage,
	#[serde(default)]
	pub pinned_by: Option<String>,
	/// Pin duration in seconds, when the provider reports one.
	#[serde(default)]
	pub duration_secs: Option<u64>,
}

/// Backlog fetched when a room is hydrated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialMessages {
	#[serde(default)]
	pub pinned: Option<PinnedMessage>,
	#[serde(default)]
	pub messages: Vec<ChatMessage>,
}
