#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use kickmux_domain::{
	Emote, EmoteSet, EmoteSource, InitialMessages, LiveStatus, RoomChannels, RoomId, RoomInfo, RoomMetadata,
	RoomRegistration,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::events::{FlexId, WireMessage, WirePinned};
use crate::SecretString;

pub const KICK_BASE_URL: &str = "https://kick.com";

const USER_AGENT: &str = concat!("kickmux/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct KickClient {
	base_url: String,
	access_token: SecretString,
	client: reqwest::Client,
}

impl KickClient {
	pub fn new(base_url: impl Into<String>, access_token: SecretString) -> Self {
		Self {
			base_url: base_url.into(),
			access_token,
			client: reqwest::Client::new(),
		}
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url.trim_end_matches('/'), path)
	}

	fn auth_header(&self) -> anyhow::Result<String> {
		if self.access_token.is_empty() {
			return Err(anyhow!("missing kick access token"));
		}
		Ok(format!("Bearer {}", self.access_token.expose().trim()))
	}

	async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String, what: &'static str) -> anyhow::Result<Option<T>> {
		let resp = self
			.client
			.get(url)
			.header("Accept", "application/json")
			.header("User-Agent", USER_AGENT)
			.send()
			.await
			.with_context(|| format!("kick {what}"))?;

		if resp.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}
		if !resp.status().is_success() {
			return Err(anyhow!("kick {what} failed: status={}", resp.status()));
		}

		let body = resp.json().await.with_context(|| format!("parse kick {what} response"))?;
		Ok(Some(body))
	}

	pub async fn fetch_channel(&self, slug: &str) -> anyhow::Result<Option<KickChannel>> {
		let url = self.url(&format!("/api/v2/channels/{}", urlencoding::encode(slug)));
		let Some(body) = self.get_json::<KickChannelResponse>(url, "get channel").await? else {
			return Ok(None);
		};
		body.into_channel(slug).map(Some)
	}

	/// Resolve a slug into a room registration carrying its channel ids.
	pub async fn resolve_room(&self, slug: &str) -> anyhow::Result<RoomRegistration> {
		let channel = self
			.fetch_channel(slug)
			.await?
			.ok_or_else(|| anyhow!("kick channel not found: {slug}"))?;
		Ok(channel.registration)
	}

	pub async fn room_info(&self, slug: &str) -> anyhow::Result<RoomInfo> {
		let channel = self
			.fetch_channel(slug)
			.await?
			.ok_or_else(|| anyhow!("kick channel not found: {slug}"))?;
		Ok(channel.info)
	}

	pub async fn fetch_emotes(&self, slug: &str) -> anyhow::Result<Vec<EmoteSet>> {
		let url = self.url(&format!("/emotes/{}", urlencoding::encode(slug)));
		let sets = self
			.get_json::<Vec<KickEmoteGroup>>(url, "get emotes")
			.await?
			.unwrap_or_default();
		Ok(sets.into_iter().map(KickEmoteGroup::into_set).collect())
	}

	pub async fn fetch_messages(&self, room: &RoomRegistration) -> anyhow::Result<InitialMessages> {
		let Some(channel_id) = room.channels.channel_id.as_deref() else {
			debug!(room = %room.room_id, "no channel id; skipping message backlog");
			return Ok(InitialMessages::default());
		};

		let url = self.url(&format!("/api/v2/channels/{}/messages", urlencoding::encode(channel_id)));
		let Some(body) = self.get_json::<KickMessagesResponse>(url, "get messages").await? else {
			return Ok(InitialMessages::default());
		};

		let room_id = &room.room_id;
		Ok(InitialMessages {
			pinned: body.data.pinned_message.map(|p| p.into_pinned(room_id)),
			messages: body.data.messages.into_iter().map(|m| m.into_message(room_id)).collect(),
		})
	}

	/// Sign a private channel subscription for a Pusher socket.
	pub async fn sign_channel(&self, channel: &str, socket_id: &str) -> anyhow::Result<String> {
		let body = BroadcastAuthRequest {
			socket_id,
			channel_name: channel,
		};
		let resp = self
			.client
			.post(self.url("/broadcasting/auth"))
			.header("Authorization", self.auth_header()?)
			.header("Accept", "application/json")
			.header("User-Agent", USER_AGENT)
			.json(&body)
			.send()
			.await
			.context("kick broadcasting auth")?;

		if !resp.status().is_success() {
			return Err(anyhow!("kick broadcasting auth failed: status={}", resp.status()));
		}

		let body: BroadcastAuthResponse = resp.json().await.context("parse kick broadcasting auth")?;
		Ok(body.auth)
	}
}

/// Channel lookup result.
#[derive(Debug, Clone)]
pub struct KickChannel {
	pub registration: RoomRegistration,
	pub info: RoomInfo,
}

#[derive(Debug, Serialize)]
struct BroadcastAuthRequest<'a> {
	socket_id: &'a str,
	channel_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct BroadcastAuthResponse {
	auth: String,
}

#[derive(Debug, Deserialize)]
struct KickChannelResponse {
	id: FlexId,
	#[serde(default)]
	user_id: Option<FlexId>,
	#[serde(default)]
	slug: Option<String>,
	chatroom: KickChatroom,
	#[serde(default)]
	livestream: Option<KickLivestream>,
	#[serde(default)]
	recent_categories: Vec<KickCategory>,
}

#[derive(Debug, Deserialize)]
struct KickChatroom {
	id: FlexId,
}

#[derive(Debug, Deserialize)]
struct KickLivestream {
	id: FlexId,
	#[serde(default)]
	session_title: Option<String>,
	#[serde(default)]
	viewer_count: Option<u64>,
	#[serde(default = "default_true")]
	is_live: bool,
}

#[derive(Debug, Deserialize)]
struct KickCategory {
	name: String,
}

fn default_true() -> bool {
	true
}

impl KickChannelResponse {
	fn into_channel(self, requested_slug: &str) -> anyhow::Result<KickChannel> {
		let channel_id = self.id.into_string();
		let user_id = self.user_id.map(FlexId::into_string);
		let slug = self.slug.unwrap_or_else(|| requested_slug.to_string());

		let live_status = match self.livestream.filter(|ls| ls.is_live) {
			Some(ls) => LiveStatus::Live {
				livestream_id: Some(ls.id.into_string()),
				title: ls.session_title,
				viewer_count: ls.viewer_count,
			},
			None => LiveStatus::Offline,
		};

		let room_id = RoomId::new(self.chatroom.id.into_string()).context("kick channel without chatroom id")?;
		let mut registration = RoomRegistration::new(room_id, slug);
		registration.channels = RoomChannels {
			channel_id: Some(channel_id.clone()),
			user_id: user_id.clone(),
			..RoomChannels::default()
		};
		registration.apply_live_status(&live_status);

		Ok(KickChannel {
			registration,
			info: RoomInfo {
				live_status,
				metadata: RoomMetadata {
					channel_id: Some(channel_id),
					user_id,
					category: self.recent_categories.into_iter().next().map(|c| c.name),
				},
			},
		})
	}
}

#[derive(Debug, Deserialize)]
struct KickEmoteGroup {
	#[serde(default)]
	id: Option<FlexId>,
	#[serde(default)]
	name: Option<String>,
	#[serde(default)]
	slug: Option<String>,
	#[serde(default)]
	user_id: Option<FlexId>,
	#[serde(default)]
	emotes: Vec<KickEmote>,
}

#[derive(Debug, Deserialize)]
struct KickEmote {
	id: FlexId,
	name: String,
	#[serde(default)]
	animated: bool,
}

impl KickEmoteGroup {
	fn into_set(self) -> EmoteSet {
		let owner_id = self.user_id.map(FlexId::into_string);
		EmoteSet {
			id: self.id.map(FlexId::into_string).unwrap_or_default(),
			name: self.name.or(self.slug).unwrap_or_default(),
			source: EmoteSource::Kick,
			emotes: self
				.emotes
				.into_iter()
				.map(|e| Emote {
					id: e.id.into_string(),
					name: e.name,
					animated: e.animated,
					owner: owner_id.clone(),
				})
				.collect(),
			owner_id,
		}
	}
}

#[derive(Debug, Deserialize)]
struct KickMessagesResponse {
	data: KickMessagesData,
}

#[derive(Debug, Deserialize)]
struct KickMessagesData {
	#[serde(default)]
	messages: Vec<WireMessage>,
	#[serde(default)]
	pinned_message: Option<WirePinned>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn channel_response_maps_to_registration() {
		let body: KickChannelResponse = serde_json::from_value(serde_json::json!({
			"id": 668,
			"user_id": 676,
			"slug": "xqc",
			"chatroom": { "id": 668 },
			"livestream": { "id": 5551, "session_title": "hi", "viewer_count": 10, "is_live": true },
			"recent_categories": [{ "name": "Just Chatting" }]
		}))
		.unwrap();

		let channel = body.into_channel("xqc").unwrap();
		assert_eq!(channel.registration.room_id.as_str(), "668");
		assert!(channel.registration.is_live);
		assert_eq!(channel.registration.channels.livestream_id.as_deref(), Some("5551"));
		assert_eq!(channel.registration.channels.user_id.as_deref(), Some("676"));
		assert_eq!(channel.info.metadata.category.as_deref(), Some("Just Chatting"));
	}

	#[test]
	fn offline_channel_has_no_livestream() {
		let body: KickChannelResponse = serde_json::from_value(serde_json::json!({
			"id": "12",
			"chatroom": { "id": "34" },
			"livestream": null
		}))
		.unwrap();

		let channel = body.into_channel("someone").unwrap();
		assert_eq!(channel.registration.slug, "someone");
		assert!(!channel.registration.is_live);
		assert_eq!(channel.info.live_status, LiveStatus::Offline);
	}
}
