#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use kickmux_core::{ConnectionOrchestrator, HttpRoomDataSource, RoomEventSink, config, resolve_rooms};
use kickmux_domain::{ChatMessage, LiveStatus, PinnedMessage, RoomId};
use kickmux_platform::ProviderEvent;
use kickmux_platform::connection::ConnectionConfig;
use kickmux_platform::kick::{KickClient, PusherProtocol, kick_connection};
use kickmux_platform::seventv::{EventApiProtocol, SevenTvClient, seventv_connection};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: kickmux [--config path] [--room slug]...\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.kickmux/config.toml)\n\
\t--room    Kick channel slug to join (repeatable)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config: Option<PathBuf>,
	rooms: Vec<String>,
}

fn parse_args() -> Args {
	let mut args = Args {
		config: None,
		rooms: Vec::new(),
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			"--room" | "-r" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--room must be a channel slug");
					usage_and_exit();
				}
				args.rooms.push(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,kickmux_core=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

/// Writes room notifications to the log.
struct LogSink;

impl RoomEventSink for LogSink {
	fn on_pinned_message_changed(&self, room_id: &RoomId, pinned: Option<&PinnedMessage>) {
		match pinned {
			Some(pin) => info!(room = %room_id, sender = %pin.message.sender.username, content = %pin.message.content, "message pinned"),
			None => info!(room = %room_id, "pin removed"),
		}
	}

	fn on_initial_messages(&self, room_id: &RoomId, messages: &[ChatMessage]) {
		info!(room = %room_id, count = messages.len(), "message backlog loaded");
	}

	fn on_live_status_changed(&self, room_id: &RoomId, status: &LiveStatus) {
		match status {
			LiveStatus::Live { title, viewer_count, .. } => {
				info!(room = %room_id, title = title.as_deref().unwrap_or(""), viewers = viewer_count.unwrap_or(0), "live");
			}
			LiveStatus::Offline => info!(room = %room_id, "offline"),
		}
	}

	fn on_event(&self, event: &ProviderEvent) {
		debug!(
			provider = %event.provider,
			room = event.room_id.as_ref().map(|r| r.as_str()).unwrap_or("-"),
			kind = %event.kind,
			"event"
		);
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let path = match args.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let mut cfg = config::load_config_from_path(&path)?;
	for slug in &args.rooms {
		cfg.add_room_slug(slug);
	}
	info!(path = %path.display(), rooms = cfg.rooms.len(), "config loaded");

	let kick_client = KickClient::new(cfg.kick.api_base_url.clone(), cfg.kick.auth_token.clone().unwrap_or_default());
	let seventv_client = SevenTvClient::new(cfg.seventv.api_base_url.clone());

	let policy = cfg.reconnection_policy();
	let mut chat_cfg = ConnectionConfig::new(policy);
	if cfg.kick.auth_token.is_some() {
		chat_cfg.signer = Some(Arc::new(kick_client.clone()));
	} else if cfg.kick.user_id.is_some() {
		warn!("kick user_id set without auth_token; user feed subscription will fail");
	}

	let chat = kick_connection(
		PusherProtocol::new(cfg.kick.pusher_url.clone()).with_user_id(cfg.kick.user_id.clone()),
		chat_cfg,
	);
	let cosmetics = seventv_connection(
		EventApiProtocol::new(cfg.seventv.event_api_url.clone()),
		ConnectionConfig::new(policy),
	);

	let rooms = resolve_rooms(&kick_client, &cfg.rooms).await;
	if rooms.is_empty() {
		warn!("no rooms to join; pass --room <slug> or add [[rooms]] to the config");
	}

	let orchestrator = ConnectionOrchestrator::new(
		Arc::new(chat),
		Arc::new(cosmetics),
		Arc::new(HttpRoomDataSource::new(kick_client, seventv_client)),
		Arc::new(LogSink),
		cfg.orchestrator_config(),
	);

	let report = orchestrator
		.initialize(rooms, cfg.startup_options())
		.await
		.context("start connections")?;
	info!(
		batches = report.admission_batches.len(),
		failed = report.failed.len(),
		"kickmux running; press ctrl-c to stop"
	);

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	let status = orchestrator.status().await;
	info!(
		admitted = status.rooms.admitted,
		chat = %status.chat.state,
		cosmetics = %status.cosmetics.state,
		"stopping"
	);
	orchestrator.shutdown().await;
	Ok(())
}
