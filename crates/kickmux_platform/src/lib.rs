#![forbid(unsafe_code)]

pub mod connection;
pub mod kick;
pub mod listeners;
pub mod protocol;
pub mod seventv;
pub mod transport;

use std::fmt;
use std::time::SystemTime;

use kickmux_domain::{Provider, RoomId};

pub use connection::{
	ChannelSigner, ConnectionError, ConnectionSnapshot, PooledProviderConnection, RoomConnection,
};
pub use listeners::{ChannelEvent, ConnectionEvent, Listeners};
pub use protocol::{InboundFrame, ProviderProtocol, SubscriptionKey};

use kick::KickEvent;
use seventv::DispatchType;

/// Lifecycle state of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
}

impl ConnectionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Disconnected => "disconnected",
			Self::Connecting => "connecting",
			Self::Connected => "connected",
		}
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Application event name, per provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
	Kick(KickEvent),
	SevenTv(DispatchType),
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Kick(ev) => write!(f, "kick:{}", ev.as_str()),
			Self::SevenTv(ty) => write!(f, "7tv:{}", ty.as_str()),
		}
	}
}

/// Routed inbound application event.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
	pub provider: Provider,

	/// `None` for connection-wide events.
	pub room_id: Option<RoomId>,

	pub kind: EventKind,

	pub payload: serde_json::Value,

	/// Local receipt timestamp (not for ordering).
	pub received_at: SystemTime,
}

/// Wrapper that redacts in logs.
#[derive(Clone, Default)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_is_redacted() {
		let secret = SecretString::new("hunter2");
		assert_eq!(format!("{secret}"), "<redacted>");
		assert!(!format!("{secret:?}").contains("hunter2"));
		assert_eq!(secret.expose(), "hunter2");
		assert!(SecretString::new("  ").is_empty());
	}

	#[test]
	fn event_kind_display() {
		assert_eq!(EventKind::Kick(KickEvent::ChatMessage).to_string(), "kick:ChatMessageEvent");
		assert_eq!(
			EventKind::SevenTv(DispatchType::EmoteSetUpdate).to_string(),
			"7tv:emote_set.update"
		);
	}
}
