#![forbid(unsafe_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use kickmux_domain::{EmoteSet, InitialMessages, RoomInfo, RoomRegistration};
use kickmux_platform::kick::KickClient;
use kickmux_platform::seventv::SevenTvClient;
use tracing::{info, warn};

use crate::collaborators::RoomDataSource;
use crate::config::RoomSettings;

/// [`RoomDataSource`] backed by the Kick and 7TV HTTP APIs.
#[derive(Debug, Clone)]
pub struct HttpRoomDataSource {
	kick: KickClient,
	seventv: SevenTvClient,
}

impl HttpRoomDataSource {
	pub fn new(kick: KickClient, seventv: SevenTvClient) -> Self {
		Self { kick, seventv }
	}
}

#[async_trait]
impl RoomDataSource for HttpRoomDataSource {
	/// Kick channel emotes plus the broadcaster's 7TV set. One failing source
	/// is tolerated.
	async fn fetch_room_emotes(&self, room: &RoomRegistration) -> anyhow::Result<Vec<EmoteSet>> {
		let seventv = async {
			match room.channels.user_id.as_deref() {
				Some(user_id) => self.seventv.kick_user_emote_set(user_id).await,
				None => Ok(None),
			}
		};
		let (kick, seventv) = tokio::join!(self.kick.fetch_emotes(&room.slug), seventv);

		let mut sets = Vec::new();
		let mut failures = 0;
		match kick {
			Ok(kick_sets) => sets.extend(kick_sets),
			Err(err) => {
				failures += 1;
				warn!(room = %room.room_id, error = %format!("{err:#}"), "kick emote fetch failed");
			}
		}
		match seventv {
			Ok(set) => sets.extend(set),
			Err(err) => {
				failures += 1;
				warn!(room = %room.room_id, error = %format!("{err:#}"), "7tv emote fetch failed");
			}
		}

		if failures == 2 {
			return Err(anyhow!("no emote source reachable for {}", room.slug));
		}
		Ok(sets)
	}

	async fn fetch_global_emotes(&self) -> anyhow::Result<EmoteSet> {
		self.seventv.global_emote_set().await
	}

	async fn fetch_room_info(&self, slug: &str) -> anyhow::Result<RoomInfo> {
		self.kick.room_info(slug).await
	}

	async fn fetch_initial_messages(&self, room: &RoomRegistration) -> anyhow::Result<InitialMessages> {
		self.kick.fetch_messages(room).await
	}
}

/// Turn configured rooms into registrations, resolving unknown chatroom ids by
/// slug. Rooms that fail to resolve are logged and skipped.
pub async fn resolve_rooms(client: &KickClient, rooms: &[RoomSettings]) -> Vec<RoomRegistration> {
	let mut resolved = Vec::with_capacity(rooms.len());
	for room in rooms {
		if let Some(registration) = room.registration() {
			resolved.push(registration);
			continue;
		}

		match client.resolve_room(&room.slug).await {
			Ok(registration) => {
				info!(slug = %room.slug, room = %registration.room_id, live = registration.is_live, "room resolved");
				resolved.push(registration);
			}
			Err(err) => warn!(slug = %room.slug, error = %format!("{err:#}"), "room resolution failed; skipping"),
		}
	}
	resolved
}
