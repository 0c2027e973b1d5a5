#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use kickmux_domain::{Provider, RoomId, RoomRegistration};
use thiserror::Error;

use crate::EventKind;

/// Identifies one logical subscription on one physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
	pub fn new(key: impl Into<String>) -> Self {
		Self(key.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SubscriptionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
	/// Provider handshake; the connection is usable from here on.
	Handshake { session_id: String },
	SubscriptionAck { key: Option<SubscriptionKey> },
	Ping,
	Heartbeat,
	/// Server asked us to drop and re-open the socket.
	ReconnectRequested { reason: String },
	ServerError { message: String },
	Event {
		/// `None` for events not tied to a subscription.
		route: Option<SubscriptionKey>,
		kind: EventKind,
		payload: serde_json::Value,
	},
	/// Protocol frame with nothing to do.
	Ignored,
}

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("invalid json: {0}")]
	Json(#[from] serde_json::Error),
	#[error("missing field: {0}")]
	MissingField(&'static str),
}

/// Wire protocol of one upstream provider.
///
/// Pure: topic derivation and frame encoding/decoding only. Socket handling and
/// bookkeeping live in [`crate::PooledProviderConnection`].
pub trait ProviderProtocol: Send + Sync + 'static {
	type Topic: Clone + fmt::Debug + Send + Sync + 'static;

	fn provider(&self) -> Provider;

	fn url(&self) -> &str;

	fn topic_key(&self, topic: &Self::Topic) -> SubscriptionKey;

	/// Whether subscribing needs a signature for the current session.
	fn requires_auth(&self, topic: &Self::Topic) -> bool;

	/// Connection-wide subscriptions, made once per session.
	fn global_topics(&self) -> Vec<Self::Topic>;

	fn room_topics(&self, room: &RoomRegistration) -> Vec<Self::Topic>;

	/// Subscriptions that depend on the room's live status.
	fn status_topics(&self, room: &RoomRegistration) -> Vec<Self::Topic>;

	fn encode_subscribe(&self, topic: &Self::Topic, auth: Option<&str>) -> anyhow::Result<String>;

	fn encode_unsubscribe(&self, topic: &Self::Topic) -> anyhow::Result<String>;

	/// Reply to [`InboundFrame::Ping`], if the protocol has one.
	fn encode_pong(&self) -> Option<String>;

	fn decode(&self, text: &str) -> Result<InboundFrame, FrameError>;

	/// Recover the owning room of an event whose key is not tracked.
	fn room_for_key(&self, _key: &SubscriptionKey, _rooms: &BTreeMap<RoomId, RoomRegistration>) -> Option<RoomId> {
		None
	}
}
