#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use kickmux_domain::{Emote, EmoteSet, EmoteSource};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::info;

pub const SEVENTV_API_URL: &str = "https://7tv.io/v3";

#[derive(Debug, Clone)]
pub struct SevenTvClient {
	base_url: String,
	client: reqwest::Client,
}

impl SevenTvClient {
	pub fn new(base_url: impl Into<String>) -> Self {
		Self {
			base_url: base_url.into(),
			client: reqwest::Client::new(),
		}
	}

	async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, what: &'static str) -> anyhow::Result<Option<T>> {
		let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
		let resp = self
			.client
			.get(url)
			.header("Accept", "application/json")
			.send()
			.await
			.with_context(|| format!("7tv {what}"))?;

		if resp.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}
		if !resp.status().is_success() {
			return Err(anyhow!("7tv {what} failed: status={}", resp.status()));
		}

		let body = resp.json().await.with_context(|| format!("parse 7tv {what} response"))?;
		Ok(Some(body))
	}

	/// Active emote set of a Kick user. `None` when the user has no 7TV account.
	pub async fn kick_user_emote_set(&self, kick_user_id: &str) -> anyhow::Result<Option<EmoteSet>> {
		let path = format!("/users/kick/{}", urlencoding::encode(kick_user_id));
		let Some(conn) = self.get_json::<SevenTvUserConnection>(&path, "user connection").await? else {
			return Ok(None);
		};

		let owner_id = conn.user.map(|u| u.id);
		let set = conn.emote_set.map(|set| set.into_set(owner_id));
		if let Some(set) = set.as_ref() {
			info!(kick_user_id, set_id = %set.id, emote_count = set.emotes.len(), "7tv user emote set fetched");
		}
		Ok(set)
	}

	pub async fn global_emote_set(&self) -> anyhow::Result<EmoteSet> {
		let set = self
			.get_json::<SevenTvEmoteSet>("/emote-sets/global", "global emote set")
			.await?
			.ok_or_else(|| anyhow!("7tv global emote set not found"))?;
		Ok(set.into_set(None))
	}
}

#[derive(Debug, Deserialize)]
struct SevenTvUserConnection {
	#[serde(default)]
	emote_set: Option<SevenTvEmoteSet>,
	#[serde(default)]
	user: Option<SevenTvUser>,
}

#[derive(Debug, Deserialize)]
struct SevenTvUser {
	id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SevenTvEmoteSet {
	id: String,
	#[serde(default)]
	name: String,
	#[serde(default)]
	emotes: Vec<SevenTvActiveEmote>,
}

#[derive(Debug, Deserialize)]
struct SevenTvActiveEmote {
	id: String,
	name: String,
	#[serde(default)]
	data: Option<SevenTvEmoteData>,
}

#[derive(Debug, Deserialize)]
struct SevenTvEmoteData {
	#[serde(default)]
	animated: bool,
	#[serde(default)]
	owner: Option<SevenTvUser>,
}

impl SevenTvEmoteSet {
	pub(crate) fn into_set(self, owner_id: Option<String>) -> EmoteSet {
		EmoteSet {
			id: self.id,
			name: self.name,
			source: EmoteSource::SevenTv,
			owner_id,
			emotes: self
				.emotes
				.into_iter()
				.map(|e| {
					let (animated, owner) = match e.data {
						Some(data) => (data.animated, data.owner.map(|o| o.id)),
						None => (false, None),
					};
					Emote {
						id: e.id,
						name: e.name,
						animated,
						owner,
					}
				})
				.collect(),
		}
	}
}
