#![forbid(unsafe_code)]

mod client;
mod events;
mod pusher;

#[cfg(test)]
mod tests;

use async_trait::async_trait;

pub use client::{KICK_BASE_URL, KickChannel, KickClient};
pub use events::{parse_chat_message, parse_live_status, parse_pinned_change};
pub use pusher::{ChannelRef, KICK_PUSHER_URL, KickEvent, PusherProtocol, parse_channel};

use crate::connection::{ChannelSigner, ConnectionConfig, PooledProviderConnection};

/// Pooled Kick chat connection.
pub type KickConnection = PooledProviderConnection<PusherProtocol>;

pub fn kick_connection(protocol: PusherProtocol, cfg: ConnectionConfig) -> KickConnection {
	PooledProviderConnection::new(protocol, cfg)
}

#[async_trait]
impl ChannelSigner for KickClient {
	async fn sign(&self, channel: &str, session_id: &str) -> anyhow::Result<String> {
		self.sign_channel(channel, session_id).await
	}
}
