#![forbid(unsafe_code)]

use std::time::Duration;

use kickmux_domain::{Provider, RoomId};
use tokio::sync::broadcast;

use crate::protocol::SubscriptionKey;
use crate::{ConnectionState, ProviderEvent};

const LISTENER_CAPACITY: usize = 8192;

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
	StateChanged {
		provider: Provider,
		state: ConnectionState,
	},
	ReconnectScheduled {
		provider: Provider,
		attempt: u32,
		delay: Duration,
	},
	/// Terminal close (explicit close or an emptied registry).
	Closed {
		provider: Provider,
	},
}

/// Subscription bookkeeping notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
	Subscribed {
		provider: Provider,
		key: SubscriptionKey,
	},
	Unsubscribed {
		provider: Provider,
		key: SubscriptionKey,
	},
	SubscriptionFailed {
		provider: Provider,
		room_id: Option<RoomId>,
		key: SubscriptionKey,
		reason: String,
	},
}

/// Per-category listener channels of one pooled connection.
///
/// Sends never block; a lagging receiver loses the oldest notifications.
#[derive(Debug, Clone)]
pub struct Listeners {
	connection: broadcast::Sender<ConnectionEvent>,
	message: broadcast::Sender<ProviderEvent>,
	channel: broadcast::Sender<ChannelEvent>,
}

impl Listeners {
	pub fn new() -> Self {
		Self::with_capacity(LISTENER_CAPACITY)
	}

	pub fn with_capacity(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		let (connection, _) = broadcast::channel(capacity);
		let (message, _) = broadcast::channel(capacity);
		let (channel, _) = broadcast::channel(capacity);
		Self {
			connection,
			message,
			channel,
		}
	}

	pub fn connection(&self) -> broadcast::Receiver<ConnectionEvent> {
		self.connection.subscribe()
	}

	pub fn messages(&self) -> broadcast::Receiver<ProviderEvent> {
		self.message.subscribe()
	}

	pub fn channels(&self) -> broadcast::Receiver<ChannelEvent> {
		self.channel.subscribe()
	}

	pub fn emit_connection(&self, event: ConnectionEvent) {
		let _ = self.connection.send(event);
	}

	pub fn emit_message(&self, event: ProviderEvent) {
		let _ = self.message.send(event);
	}

	pub fn emit_channel(&self, event: ChannelEvent) {
		let _ = self.channel.send(event);
	}
}

impl Default for Listeners {
	fn default() -> Self {
		Self::new()
	}
}
