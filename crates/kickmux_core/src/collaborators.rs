#![forbid(unsafe_code)]

use async_trait::async_trait;
use kickmux_domain::{ChatMessage, EmoteSet, InitialMessages, LiveStatus, PinnedMessage, RoomId, RoomInfo, RoomRegistration};
use kickmux_platform::ProviderEvent;

/// Per-room data fetched over HTTP during hydration.
#[async_trait]
pub trait RoomDataSource: Send + Sync {
	/// Kick and 7TV emote sets of one room.
	async fn fetch_room_emotes(&self, room: &RoomRegistration) -> anyhow::Result<Vec<EmoteSet>>;

	async fn fetch_global_emotes(&self) -> anyhow::Result<EmoteSet>;

	async fn fetch_room_info(&self, slug: &str) -> anyhow::Result<RoomInfo>;

	async fn fetch_initial_messages(&self, room: &RoomRegistration) -> anyhow::Result<InitialMessages>;
}

/// Receives room-level notifications from the orchestrator.
///
/// Calls are made from the event forwarding tasks and must not block.
pub trait RoomEventSink: Send + Sync {
	/// `None` when the pin was removed.
	fn on_pinned_message_changed(&self, _room_id: &RoomId, _pinned: Option<&PinnedMessage>) {}

	fn on_initial_messages(&self, _room_id: &RoomId, _messages: &[ChatMessage]) {}

	fn on_live_status_changed(&self, _room_id: &RoomId, _status: &LiveStatus) {}

	/// Every routed provider event, after the orchestrator's own handling.
	fn on_event(&self, _event: &ProviderEvent) {}
}
