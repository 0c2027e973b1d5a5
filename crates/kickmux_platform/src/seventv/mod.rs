#![forbid(unsafe_code)]

mod client;
mod event_api;


pub use client::{SEVENTV_API_URL, SevenTvClient};
pub use event_api::{Condition, DispatchType, EventApiProtocol, Resource, SEVENTV_EVENT_API_URL, SevenTvTopic};

use crate::connection::{ConnectionConfig, PooledProviderConnection};

/// Pooled 7TV EventAPI connection.
pub type SevenTvConnection = PooledProviderConnection<EventApiProtocol>;

pub fn seventv_connection(protocol: EventApiProtocol, cfg: ConnectionConfig) -> SevenTvConnection {
	PooledProviderConnection::new(protocol, cfg)
}
