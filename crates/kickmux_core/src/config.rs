#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use kickmux_domain::{RoomId, RoomRegistration};
use kickmux_platform::SecretString;
use kickmux_platform::kick::{KICK_BASE_URL, KICK_PUSHER_URL};
use kickmux_platform::seventv::{SEVENTV_API_URL, SEVENTV_EVENT_API_URL};
use kickmux_util::backoff::ReconnectionPolicy;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::orchestrator::{OrchestratorConfig, StartupOptions};

/// Default config path: `~/.kickmux/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".kickmux").join("config.toml"))
}

/// Read `path` (a missing file means defaults) and apply `KICKMUX_*` overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<KickmuxConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_else(|| {
			debug!(path = %path.display(), "no config file; using defaults");
			FileConfig::default()
		});

	let mut cfg = KickmuxConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct KickmuxConfig {
	pub kick: KickSettings,
	pub seventv: SevenTvSettings,
	pub startup: StartupSettings,
	pub reconnect: ReconnectSettings,
	pub cache: CacheSettings,
	pub rooms: Vec<RoomSettings>,
}

#[derive(Debug, Clone)]
pub struct KickSettings {
	pub pusher_url: String,
	pub api_base_url: String,
	/// Bearer token for private channel signing.
	pub auth_token: Option<SecretString>,
	/// Logged-in user; enables the user feed subscription.
	pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SevenTvSettings {
	pub event_api_url: String,
	pub api_base_url: String,
}

#[derive(Debug, Clone)]
pub struct StartupSettings {
	pub batch_size: usize,
	pub stagger_delay: Duration,
	pub max_concurrent_fetches: usize,
	pub fetch_batch_delay: Duration,
	pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ReconnectSettings {
	pub base_delay: Duration,
	pub max_steps: u32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
	pub max_rooms: usize,
	pub messages_per_room: usize,
}

/// A configured room. Rooms without a `room_id` are resolved by slug at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSettings {
	pub slug: String,
	pub room_id: Option<String>,
	pub channel_id: Option<String>,
	pub user_id: Option<String>,
}

impl RoomSettings {
	pub fn from_slug(slug: impl Into<String>) -> Self {
		Self {
			slug: slug.into(),
			room_id: None,
			channel_id: None,
			user_id: None,
		}
	}

	/// Registration built from configured ids, when the chatroom id is known.
	pub fn registration(&self) -> Option<RoomRegistration> {
		let room_id = RoomId::new(self.room_id.clone()?).ok()?;
		let mut room = RoomRegistration::new(room_id, self.slug.clone());
		room.channels.channel_id = self.channel_id.clone();
		room.channels.user_id = self.user_id.clone();
		Some(room)
	}
}

impl KickmuxConfig {
	pub fn startup_options(&self) -> StartupOptions {
		StartupOptions {
			batch_size: self.startup.batch_size,
			stagger_delay: self.startup.stagger_delay,
			max_concurrent_fetches: self.startup.max_concurrent_fetches,
		}
	}

	pub fn orchestrator_config(&self) -> OrchestratorConfig {
		OrchestratorConfig {
			connect_timeout: self.startup.connect_timeout,
			fetch_batch_delay: self.startup.fetch_batch_delay,
			max_rooms_cached: self.cache.max_rooms,
			messages_per_room: self.cache.messages_per_room,
		}
	}

	pub fn reconnection_policy(&self) -> ReconnectionPolicy {
		ReconnectionPolicy::new(self.reconnect.base_delay, self.reconnect.max_steps)
	}

	/// Add a room by slug unless it is already configured.
	pub fn add_room_slug(&mut self, slug: &str) {
		let slug = slug.trim().to_ascii_lowercase();
		if slug.is_empty() || self.rooms.iter().any(|r| r.slug == slug) {
			return;
		}
		self.rooms.push(RoomSettings::from_slug(slug));
	}

	fn from_file(file: FileConfig) -> Self {
		let defaults = StartupOptions::default();
		let orchestrator = OrchestratorConfig::default();
		let policy = ReconnectionPolicy::default();

		let rooms = file
			.rooms
			.into_iter()
			.filter_map(|room| {
				let slug = room.slug.trim().to_ascii_lowercase();
				if slug.is_empty() {
					warn!("config: room entry without slug ignored");
					return None;
				}
				Some(RoomSettings {
					slug,
					room_id: non_empty(room.room_id),
					channel_id: non_empty(room.channel_id),
					user_id: non_empty(room.user_id),
				})
			})
			.collect();

		Self {
			kick: KickSettings {
				pusher_url: non_empty(file.kick.pusher_url).unwrap_or_else(|| KICK_PUSHER_URL.to_string()),
				api_base_url: non_empty(file.kick.api_base_url).unwrap_or_else(|| KICK_BASE_URL.to_string()),
				auth_token: non_empty(file.kick.auth_token).map(SecretString::new),
				user_id: non_empty(file.kick.user_id),
			},
			seventv: SevenTvSettings {
				event_api_url: non_empty(file.seventv.event_api_url)
					.unwrap_or_else(|| SEVENTV_EVENT_API_URL.to_string()),
				api_base_url: non_empty(file.seventv.api_base_url).unwrap_or_else(|| SEVENTV_API_URL.to_string()),
			},
			startup: StartupSettings {
				batch_size: file.startup.batch_size.filter(|v| *v > 0).unwrap_or(defaults.batch_size),
				stagger_delay: file
					.startup
					.stagger_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.stagger_delay),
				max_concurrent_fetches: file
					.startup
					.max_concurrent_fetches
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_concurrent_fetches),
				fetch_batch_delay: file
					.startup
					.fetch_batch_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(orchestrator.fetch_batch_delay),
				connect_timeout: file
					.startup
					.connect_timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(orchestrator.connect_timeout),
			},
			reconnect: ReconnectSettings {
				base_delay: file
					.reconnect
					.base_delay_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(policy.base()),
				max_steps: file.reconnect.max_steps.unwrap_or(policy.max_steps()),
			},
			cache: CacheSettings {
				max_rooms: file.cache.max_rooms.filter(|v| *v > 0).unwrap_or(orchestrator.max_rooms_cached),
				messages_per_room: file
					.cache
					.messages_per_room
					.filter(|v| *v > 0)
					.unwrap_or(orchestrator.messages_per_room),
			},
			rooms,
		}
	}
}

impl Default for KickmuxConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	kick: FileKickSettings,

	#[serde(default)]
	seventv: FileSevenTvSettings,

	#[serde(default)]
	startup: FileStartupSettings,

	#[serde(default)]
	reconnect: FileReconnectSettings,

	#[serde(default)]
	cache: FileCacheSettings,

	#[serde(default)]
	rooms: Vec<FileRoom>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileKickSettings {
	pusher_url: Option<String>,
	api_base_url: Option<String>,
	auth_token: Option<String>,
	user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSevenTvSettings {
	event_api_url: Option<String>,
	api_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStartupSettings {
	batch_size: Option<usize>,
	stagger_ms: Option<u64>,
	max_concurrent_fetches: Option<usize>,
	fetch_batch_delay_ms: Option<u64>,
	connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileReconnectSettings {
	base_delay_ms: Option<u64>,
	max_steps: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCacheSettings {
	max_rooms: Option<usize>,
	messages_per_room: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRoom {
	#[serde(default)]
	slug: String,
	room_id: Option<String>,
	channel_id: Option<String>,
	user_id: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut KickmuxConfig) {
	apply_env_overrides_with(cfg, |key| std::env::var(key).ok());
}

/// Apply `KICKMUX_*` overrides read through `lookup`.
pub(crate) fn apply_env_overrides_with(cfg: &mut KickmuxConfig, lookup: impl Fn(&str) -> Option<String>) {
	let string = |key: &str| non_empty(lookup(key));
	fn parsed<T: FromStr>(raw: Option<String>, key: &str) -> Option<T> {
		let raw = raw?;
		match raw.parse() {
			Ok(v) => Some(v),
			Err(_) => {
				warn!(key, value = %raw, "ignoring unparseable env override");
				None
			}
		}
	}

	if let Some(v) = string("KICKMUX_KICK_PUSHER_URL") {
		cfg.kick.pusher_url = v;
		info!("kick config: pusher_url overridden by env");
	}

	if let Some(v) = string("KICKMUX_KICK_API_URL") {
		cfg.kick.api_base_url = v;
		info!("kick config: api_base_url overridden by env");
	}

	if let Some(v) = string("KICKMUX_KICK_AUTH_TOKEN") {
		cfg.kick.auth_token = Some(SecretString::new(v));
		info!("kick auth: auth_token overridden by env");
	}

	if let Some(v) = string("KICKMUX_KICK_USER_ID") {
		cfg.kick.user_id = Some(v);
		info!("kick config: user_id overridden by env");
	}

	if let Some(v) = string("KICKMUX_SEVENTV_EVENT_API_URL") {
		cfg.seventv.event_api_url = v;
		info!("7tv config: event_api_url overridden by env");
	}

	if let Some(v) = string("KICKMUX_SEVENTV_API_URL") {
		cfg.seventv.api_base_url = v;
		info!("7tv config: api_base_url overridden by env");
	}

	if let Some(batch_size) = parsed::<usize>(string("KICKMUX_STARTUP_BATCH_SIZE"), "KICKMUX_STARTUP_BATCH_SIZE")
		&& batch_size > 0
	{
		cfg.startup.batch_size = batch_size;
		info!(batch_size, "startup config: batch_size overridden by env");
	}

	if let Some(stagger_ms) = parsed::<u64>(string("KICKMUX_STARTUP_STAGGER_MS"), "KICKMUX_STARTUP_STAGGER_MS") {
		cfg.startup.stagger_delay = Duration::from_millis(stagger_ms);
		info!(stagger_ms, "startup config: stagger_delay overridden by env");
	}

	if let Some(max_fetches) = parsed::<usize>(
		string("KICKMUX_STARTUP_MAX_CONCURRENT_FETCHES"),
		"KICKMUX_STARTUP_MAX_CONCURRENT_FETCHES",
	) && max_fetches > 0
	{
		cfg.startup.max_concurrent_fetches = max_fetches;
		info!(max_fetches, "startup config: max_concurrent_fetches overridden by env");
	}

	if let Some(delay_ms) = parsed::<u64>(
		string("KICKMUX_STARTUP_FETCH_BATCH_DELAY_MS"),
		"KICKMUX_STARTUP_FETCH_BATCH_DELAY_MS",
	) {
		cfg.startup.fetch_batch_delay = Duration::from_millis(delay_ms);
		info!(delay_ms, "startup config: fetch_batch_delay overridden by env");
	}

	if let Some(timeout_ms) = parsed::<u64>(
		string("KICKMUX_STARTUP_CONNECT_TIMEOUT_MS"),
		"KICKMUX_STARTUP_CONNECT_TIMEOUT_MS",
	) && timeout_ms > 0
	{
		cfg.startup.connect_timeout = Duration::from_millis(timeout_ms);
		info!(timeout_ms, "startup config: connect_timeout overridden by env");
	}

	if let Some(base_ms) = parsed::<u64>(
		string("KICKMUX_RECONNECT_BASE_DELAY_MS"),
		"KICKMUX_RECONNECT_BASE_DELAY_MS",
	) && base_ms > 0
	{
		cfg.reconnect.base_delay = Duration::from_millis(base_ms);
		info!(base_ms, "reconnect config: base_delay overridden by env");
	}

	if let Some(max_steps) = parsed::<u32>(string("KICKMUX_RECONNECT_MAX_STEPS"), "KICKMUX_RECONNECT_MAX_STEPS") {
		cfg.reconnect.max_steps = max_steps;
		info!(max_steps, "reconnect config: max_steps overridden by env");
	}

	if let Some(max_rooms) = parsed::<usize>(string("KICKMUX_CACHE_MAX_ROOMS"), "KICKMUX_CACHE_MAX_ROOMS")
		&& max_rooms > 0
	{
		cfg.cache.max_rooms = max_rooms;
		info!(max_rooms, "cache config: max_rooms overridden by env");
	}

	if let Some(per_room) = parsed::<usize>(
		string("KICKMUX_CACHE_MESSAGES_PER_ROOM"),
		"KICKMUX_CACHE_MESSAGES_PER_ROOM",
	) && per_room > 0
	{
		cfg.cache.messages_per_room = per_room;
		info!(per_room, "cache config: messages_per_room overridden by env");
	}

	if let Some(v) = string("KICKMUX_ROOMS") {
		let before = cfg.rooms.len();
		for slug in v.split(',') {
			cfg.add_room_slug(slug);
		}
		info!(added = cfg.rooms.len() - before, "rooms extended by env");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		move |key: &str| map.get(key).cloned()
	}

	#[test]
	fn defaults_without_file() {
		let cfg = KickmuxConfig::default();
		assert_eq!(cfg.kick.pusher_url, KICK_PUSHER_URL);
		assert_eq!(cfg.seventv.event_api_url, SEVENTV_EVENT_API_URL);
		assert!(cfg.kick.auth_token.is_none());
		assert_eq!(cfg.startup_options(), StartupOptions::default());
		assert_eq!(cfg.reconnection_policy(), ReconnectionPolicy::default());
		assert!(cfg.rooms.is_empty());
	}

	#[test]
	fn parses_full_file() {
		let file: FileConfig = toml::from_str(
			r#"
			[kick]
			auth_token = "  tok  "
			user_id = "42"

			[startup]
			batch_size = 2
			stagger_ms = 500
			connect_timeout_ms = 0

			[reconnect]
			base_delay_ms = 250
			max_steps = 4

			[cache]
			messages_per_room = 50

			[[rooms]]
			slug = "XQC"
			room_id = "668"
			channel_id = "676"

			[[rooms]]
			slug = "  "
			"#,
		)
		.unwrap();
		let cfg = KickmuxConfig::from_file(file);

		assert_eq!(cfg.kick.auth_token.as_ref().map(|t| t.expose()), Some("tok"));
		assert_eq!(cfg.kick.user_id.as_deref(), Some("42"));
		assert_eq!(cfg.startup.batch_size, 2);
		assert_eq!(cfg.startup.stagger_delay, Duration::from_millis(500));
		assert_eq!(cfg.startup.connect_timeout, OrchestratorConfig::default().connect_timeout);
		assert_eq!(cfg.reconnection_policy().max_delay(), Duration::from_millis(250 * 8));
		assert_eq!(cfg.orchestrator_config().messages_per_room, 50);

		assert_eq!(cfg.rooms.len(), 1);
		let room = cfg.rooms[0].registration().unwrap();
		assert_eq!(room.slug, "xqc");
		assert_eq!(room.room_id.as_str(), "668");
		assert_eq!(room.channels.channel_id.as_deref(), Some("676"));
	}

	#[test]
	fn env_overrides_apply_and_skip_garbage() {
		let mut cfg = KickmuxConfig::default();
		cfg.add_room_slug("xqc");

		apply_env_overrides_with(
			&mut cfg,
			env(&[
				("KICKMUX_KICK_AUTH_TOKEN", "secret"),
				("KICKMUX_STARTUP_BATCH_SIZE", "0"),
				("KICKMUX_STARTUP_STAGGER_MS", "abc"),
				("KICKMUX_RECONNECT_MAX_STEPS", "3"),
				("KICKMUX_ROOMS", "xqc, Adin ,,"),
			]),
		);

		assert_eq!(cfg.kick.auth_token.as_ref().map(|t| t.expose()), Some("secret"));
		assert_eq!(cfg.startup.batch_size, StartupOptions::default().batch_size);
		assert_eq!(cfg.startup.stagger_delay, StartupOptions::default().stagger_delay);
		assert_eq!(cfg.reconnect.max_steps, 3);
		let slugs: Vec<&str> = cfg.rooms.iter().map(|r| r.slug.as_str()).collect();
		assert_eq!(slugs, vec!["xqc", "adin"]);
		assert!(cfg.rooms[1].registration().is_none());
	}

	#[test]
	fn missing_file_is_defaults_and_bad_toml_errors() {
		let dir = tempfile::tempdir().unwrap();

		assert!(read_toml_if_exists(&dir.path().join("absent.toml")).unwrap().is_none());

		let bad = dir.path().join("bad.toml");
		fs::write(&bad, "[startup\nbatch_size = 1").unwrap();
		assert!(load_config_from_path(&bad).is_err());
	}
}
