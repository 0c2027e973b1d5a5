#![forbid(unsafe_code)]

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use kickmux_domain::{ChatMessage, EmoteSet, EmoteSource, LiveStatus, Provider, RoomId, RoomRegistration};
use kickmux_platform::kick::{KickEvent, parse_chat_message, parse_live_status, parse_pinned_change};
use kickmux_platform::{ConnectionError, ConnectionSnapshot, EventKind, ProviderEvent, RoomConnection};
use kickmux_util::batch;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{BoundedCache, RoomScopedCache};
use crate::collaborators::{RoomDataSource, RoomEventSink};

const GLOBAL_EMOTES_KEY: &str = "global";

#[derive(Debug, Error)]
pub enum OrchestratorError {
	#[error("connections not ready within {0:?}")]
	StartupTimeout(Duration),
	#[error("orchestrator is not running")]
	NotRunning,
	#[error("orchestrator has been shut down")]
	ShutDown,
	#[error("{provider} connection: {source}")]
	Connection {
		provider: Provider,
		#[source]
		source: ConnectionError,
	},
	#[error("room {room_id} admission failed on {provider}: {source}")]
	Admission {
		room_id: RoomId,
		provider: Provider,
		#[source]
		source: ConnectionError,
	},
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
	/// Budget for both connections to reach `Connected` during startup.
	pub connect_timeout: Duration,
	/// Pause between hydration batches.
	pub fetch_batch_delay: Duration,
	/// Rooms whose emotes and recent messages are cached.
	pub max_rooms_cached: usize,
	pub messages_per_room: usize,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		Self {
			connect_timeout: Duration::from_secs(15),
			fetch_batch_delay: Duration::from_millis(250),
			max_rooms_cached: 100,
			messages_per_room: 200,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupOptions {
	pub batch_size: usize,
	pub stagger_delay: Duration,
	pub max_concurrent_fetches: usize,
}

impl Default for StartupOptions {
	fn default() -> Self {
		Self {
			batch_size: 5,
			stagger_delay: Duration::from_secs(1),
			max_concurrent_fetches: 3,
		}
	}
}

/// What one `initialize` run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
	/// Room ids per admission batch, in admission order.
	pub admission_batches: Vec<Vec<RoomId>>,
	/// Stagger pauses taken between admission batches.
	pub admission_delays: usize,
	pub failed: Vec<RoomId>,
	pub hydration_batches: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
	/// Not yet accepted by both connections.
	Pending,
	Admitted,
	Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionCounts {
	pub pending: usize,
	pub admitted: usize,
	pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOccupancy {
	pub room_emotes: usize,
	pub room_emotes_capacity: usize,
	pub global_emotes: usize,
	pub message_rooms: usize,
	pub messages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorStatus {
	pub running: bool,
	pub chat: ConnectionSnapshot,
	pub cosmetics: ConnectionSnapshot,
	pub rooms: AdmissionCounts,
	pub caches: CacheOccupancy,
}

struct TrackedRoom {
	registration: RoomRegistration,
	admission: Admission,
}

/// Drives the Kick chat and 7TV cosmetics connections for a set of rooms.
///
/// Cloning is cheap and yields a handle to the same orchestrator.
#[derive(Clone)]
pub struct ConnectionOrchestrator {
	inner: Arc<Inner>,
}

struct Inner {
	chat: Arc<dyn RoomConnection>,
	cosmetics: Arc<dyn RoomConnection>,
	data: Arc<dyn RoomDataSource>,
	sink: Arc<dyn RoomEventSink>,
	cfg: OrchestratorConfig,

	running: AtomicBool,
	shutting_down: AtomicBool,
	rooms: Mutex<BTreeMap<RoomId, TrackedRoom>>,
	forwarders: Mutex<Vec<JoinHandle<()>>>,

	room_emotes: BoundedCache<RoomId, Arc<Vec<EmoteSet>>>,
	global_emotes: BoundedCache<&'static str, Arc<EmoteSet>>,
	recent_messages: RoomScopedCache<String, ChatMessage>,
}

impl ConnectionOrchestrator {
	pub fn new(
		chat: Arc<dyn RoomConnection>,
		cosmetics: Arc<dyn RoomConnection>,
		data: Arc<dyn RoomDataSource>,
		sink: Arc<dyn RoomEventSink>,
		cfg: OrchestratorConfig,
	) -> Self {
		let room_emotes = BoundedCache::new("room_emotes", cfg.max_rooms_cached);
		let recent_messages = RoomScopedCache::new("recent_messages", cfg.max_rooms_cached, cfg.messages_per_room);
		Self {
			inner: Arc::new(Inner {
				chat,
				cosmetics,
				data,
				sink,
				cfg,
				running: AtomicBool::new(false),
				shutting_down: AtomicBool::new(false),
				rooms: Mutex::new(BTreeMap::new()),
				forwarders: Mutex::new(Vec::new()),
				room_emotes,
				global_emotes: BoundedCache::new("global_emotes", 1),
				recent_messages,
			}),
		}
	}

	pub fn is_running(&self) -> bool {
		self.inner.running.load(Ordering::SeqCst)
	}

	/// Connect both providers, admit `rooms` in staggered batches and hydrate them.
	///
	/// Calling this while already running does nothing and returns an empty report.
	pub async fn initialize(
		&self,
		rooms: Vec<RoomRegistration>,
		opts: StartupOptions,
	) -> Result<StartupReport, OrchestratorError> {
		let inner = &self.inner;
		if inner.shutting_down.load(Ordering::SeqCst) {
			return Err(OrchestratorError::ShutDown);
		}
		if inner.running.swap(true, Ordering::SeqCst) {
			debug!("initialize called while running; ignoring");
			return Ok(StartupReport::default());
		}

		inner.spawn_forwarders();

		info!(rooms = rooms.len(), timeout = ?inner.cfg.connect_timeout, "connecting providers");
		let ready = tokio::time::timeout(inner.cfg.connect_timeout, async {
			tokio::try_join!(bring_up(inner.chat.as_ref()), bring_up(inner.cosmetics.as_ref()))
		})
		.await;

		let failure = match ready {
			Ok(Ok(_)) => None,
			Ok(Err(err)) => Some(err),
			Err(_) => Some(OrchestratorError::StartupTimeout(inner.cfg.connect_timeout)),
		};
		if let Some(err) = failure {
			warn!(error = %err, "startup failed; closing connections");
			// closed connections cannot be reopened
			inner.shutting_down.store(true, Ordering::SeqCst);
			inner.stop().await;
			return Err(err);
		}

		let mut report = StartupReport::default();
		inner.admit_all(rooms, &opts, &mut report).await;
		inner.hydrate_all(&opts, &mut report).await;

		info!(
			admitted = report.admission_batches.iter().map(Vec::len).sum::<usize>() - report.failed.len(),
			failed = report.failed.len(),
			batches = report.admission_batches.len(),
			"startup complete"
		);
		Ok(report)
	}

	/// Admit and hydrate one room right away.
	pub async fn add_room(&self, room: RoomRegistration) -> Result<(), OrchestratorError> {
		self.inner.ensure_running()?;
		let room_id = room.room_id.clone();
		self.inner.admit(room).await?;

		if let Some(room) = self.inner.registration(&room_id) {
			self.inner.hydrate(room).await;
		}
		Ok(())
	}

	/// Returns false when the room was not tracked.
	pub async fn remove_room(&self, room_id: &RoomId) -> Result<bool, OrchestratorError> {
		self.inner.ensure_running()?;
		let tracked = self.inner.rooms.lock().remove(room_id).is_some();

		let (chat, cosmetics) = tokio::join!(
			self.inner.chat.remove_room(room_id),
			self.inner.cosmetics.remove_room(room_id)
		);
		for (provider, result) in [(Provider::Kick, chat), (Provider::SevenTv, cosmetics)] {
			if let Err(err) = result {
				warn!(%provider, room = %room_id, error = %err, "remove room failed");
			}
		}

		self.inner.room_emotes.invalidate(room_id);
		self.inner.recent_messages.remove_room(room_id);
		if tracked {
			info!(room = %room_id, "room removed");
		}
		Ok(tracked)
	}

	pub async fn status(&self) -> OrchestratorStatus {
		let inner = &self.inner;
		let (chat, cosmetics) = tokio::join!(inner.chat.snapshot(), inner.cosmetics.snapshot());

		let mut rooms = AdmissionCounts::default();
		for tracked in inner.rooms.lock().values() {
			match tracked.admission {
				Admission::Pending => rooms.pending += 1,
				Admission::Admitted => rooms.admitted += 1,
				Admission::Failed => rooms.failed += 1,
			}
		}

		OrchestratorStatus {
			running: self.is_running(),
			chat,
			cosmetics,
			rooms,
			caches: CacheOccupancy {
				room_emotes: inner.room_emotes.len(),
				room_emotes_capacity: inner.room_emotes.capacity(),
				global_emotes: inner.global_emotes.len(),
				message_rooms: inner.recent_messages.rooms(),
				messages: inner.recent_messages.entries(),
			},
		}
	}

	/// Stop admitting, close both connections and stop forwarding events.
	pub async fn shutdown(&self) {
		if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
			return;
		}
		info!("shutting down");
		self.inner.stop().await;
	}

	pub fn admission(&self, room_id: &RoomId) -> Option<Admission> {
		self.inner.rooms.lock().get(room_id).map(|t| t.admission)
	}

	pub fn registration(&self, room_id: &RoomId) -> Option<RoomRegistration> {
		self.inner.registration(room_id)
	}

	pub fn room_emotes(&self, room_id: &RoomId) -> Option<Arc<Vec<EmoteSet>>> {
		self.inner.room_emotes.get(room_id)
	}

	pub fn global_emotes(&self) -> Option<Arc<EmoteSet>> {
		self.inner.global_emotes.get(&GLOBAL_EMOTES_KEY)
	}

	/// Recent chat messages of a room, oldest first.
	pub fn recent_messages(&self, room_id: &RoomId) -> Vec<ChatMessage> {
		self.inner.recent_messages.values(room_id)
	}
}

async fn bring_up(conn: &dyn RoomConnection) -> Result<(), OrchestratorError> {
	let provider = conn.provider();
	match conn.connect().await {
		Ok(()) => {}
		// A reconnect is already scheduled; keep waiting within the startup budget.
		Err(ConnectionError::Transport(err)) => {
			warn!(%provider, error = %format!("{err:#}"), "initial connect failed");
		}
		Err(source) => return Err(OrchestratorError::Connection { provider, source }),
	}

	conn.wait_connected()
		.await
		.map_err(|source| OrchestratorError::Connection { provider, source })?;
	info!(%provider, "provider connected");
	Ok(())
}

impl Inner {
	fn ensure_running(&self) -> Result<(), OrchestratorError> {
		if self.shutting_down.load(Ordering::SeqCst) {
			return Err(OrchestratorError::ShutDown);
		}
		if !self.running.load(Ordering::SeqCst) {
			return Err(OrchestratorError::NotRunning);
		}
		Ok(())
	}

	fn stopping(&self) -> bool {
		self.shutting_down.load(Ordering::SeqCst)
	}

	async fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
		tokio::join!(self.chat.close(), self.cosmetics.close());
		for handle in self.forwarders.lock().drain(..) {
			handle.abort();
		}
	}

	fn registration(&self, room_id: &RoomId) -> Option<RoomRegistration> {
		self.rooms.lock().get(room_id).map(|t| t.registration.clone())
	}

	fn is_tracked(&self, room_id: &RoomId) -> bool {
		self.rooms.lock().contains_key(room_id)
	}

	fn set_admission(&self, room: &RoomRegistration, admission: Admission) {
		let mut rooms = self.rooms.lock();
		match rooms.get_mut(&room.room_id) {
			Some(tracked) => tracked.admission = admission,
			None => {
				rooms.insert(
					room.room_id.clone(),
					TrackedRoom {
						registration: room.clone(),
						admission,
					},
				);
			}
		}
	}

	/// Apply `f` to a tracked registration. Returns the new registration when `f` changed it.
	fn update_registration(
		&self,
		room_id: &RoomId,
		f: impl FnOnce(&mut RoomRegistration) -> bool,
	) -> Option<RoomRegistration> {
		let mut rooms = self.rooms.lock();
		let tracked = rooms.get_mut(room_id)?;
		f(&mut tracked.registration).then(|| tracked.registration.clone())
	}

	/// Push a changed registration to both connections.
	async fn propagate(&self, room: RoomRegistration) {
		let room_id = room.room_id.clone();
		let (chat, cosmetics) = tokio::join!(self.chat.update_room(room.clone()), self.cosmetics.update_room(room));
		for (provider, result) in [(Provider::Kick, chat), (Provider::SevenTv, cosmetics)] {
			if let Err(err) = result {
				warn!(%provider, room = %room_id, error = %err, "room update failed");
			}
		}
	}

	fn spawn_forwarders(self: &Arc<Self>) {
		let mut handles = self.forwarders.lock();
		for conn in [&self.chat, &self.cosmetics] {
			let provider = conn.provider();
			let mut rx = conn.listeners().messages();
			let inner = Arc::clone(self);
			handles.push(tokio::spawn(async move {
				loop {
					match rx.recv().await {
						Ok(event) => inner.handle_event(event).await,
						Err(RecvError::Lagged(skipped)) => {
							warn!(%provider, skipped, "event forwarder lagged");
							metrics::counter!("kickmux_forwarder_lagged_events_total", "provider" => provider.as_str())
								.increment(skipped);
						}
						Err(RecvError::Closed) => break,
					}
				}
				debug!(%provider, "event forwarder stopped");
			}));
		}
	}

	async fn admit_all(&self, rooms: Vec<RoomRegistration>, opts: &StartupOptions, report: &mut StartupReport) {
		let ordered = batch::prioritize(rooms, |room| room.is_live);
		for room in &ordered {
			self.set_admission(room, Admission::Pending);
		}

		let batches = batch::partition(ordered, opts.batch_size);
		let total = batches.len();
		for (index, rooms) in batches.into_iter().enumerate() {
			if self.stopping() {
				info!(remaining = total - index, "shutdown requested; admission stopped");
				break;
			}

			let ids: Vec<RoomId> = rooms.iter().map(|r| r.room_id.clone()).collect();
			debug!(batch = index + 1, total, rooms = ids.len(), "admitting batch");
			let results = join_all(rooms.into_iter().map(|room| self.admit(room))).await;
			for (room_id, result) in ids.iter().zip(results) {
				if let Err(err) = result {
					warn!(room = %room_id, error = %err, "room admission failed");
					report.failed.push(room_id.clone());
				}
			}
			report.admission_batches.push(ids);

			if index + 1 < total && !self.stopping() {
				report.admission_delays += 1;
				tokio::time::sleep(opts.stagger_delay).await;
			}
		}
	}

	/// Track `room` as pending and return the registration to hand to the
	/// connections. Ids and live state already learned for a tracked room are kept.
	fn track_pending(&self, room: RoomRegistration) -> RoomRegistration {
		let mut rooms = self.rooms.lock();
		let room = match rooms.get(&room.room_id) {
			Some(tracked) => merge_known(room, &tracked.registration),
			None => room,
		};
		rooms.insert(
			room.room_id.clone(),
			TrackedRoom {
				registration: room.clone(),
				admission: Admission::Pending,
			},
		);
		room
	}

	/// Register a room on both connections, undoing a half-registration.
	async fn admit(&self, room: RoomRegistration) -> Result<(), OrchestratorError> {
		let room = self.track_pending(room);
		let room_id = room.room_id.clone();

		let (chat, cosmetics) = tokio::join!(self.chat.add_room(room.clone()), self.cosmetics.add_room(room.clone()));
		let failure = match (chat, cosmetics) {
			(Ok(()), Ok(())) => None,
			(Ok(()), Err(source)) => {
				if let Err(err) = self.chat.remove_room(&room_id).await {
					debug!(room = %room_id, error = %err, "chat rollback failed");
				}
				Some((Provider::SevenTv, source))
			}
			(Err(source), Ok(())) => {
				if let Err(err) = self.cosmetics.remove_room(&room_id).await {
					debug!(room = %room_id, error = %err, "cosmetics rollback failed");
				}
				Some((Provider::Kick, source))
			}
			(Err(source), Err(_)) => Some((Provider::Kick, source)),
		};

		match failure {
			None => {
				self.set_admission(&room, Admission::Admitted);
				debug!(room = %room_id, "room admitted");
				Ok(())
			}
			Some((provider, source)) => {
				self.set_admission(&room, Admission::Failed);
				Err(OrchestratorError::Admission {
					room_id,
					provider,
					source,
				})
			}
		}
	}

	async fn hydrate_all(&self, opts: &StartupOptions, report: &mut StartupReport) {
		if self.stopping() {
			return;
		}
		self.ensure_global_emotes().await;

		let admitted: Vec<RoomRegistration> = report
			.admission_batches
			.iter()
			.flatten()
			.filter(|id| !report.failed.contains(id))
			.filter_map(|id| self.registration(id))
			.collect();

		let batches = batch::partition(admitted, opts.max_concurrent_fetches);
		let total = batches.len();
		for (index, rooms) in batches.into_iter().enumerate() {
			if self.stopping() {
				break;
			}
			join_all(rooms.into_iter().map(|room| self.hydrate(room))).await;
			report.hydration_batches += 1;

			if index + 1 < total {
				tokio::time::sleep(self.cfg.fetch_batch_delay).await;
			}
		}
	}

	async fn ensure_global_emotes(&self) {
		let fetched = self
			.global_emotes
			.get_or_fetch(GLOBAL_EMOTES_KEY, || async { self.data.fetch_global_emotes().await.map(Arc::new) })
			.await;
		match fetched {
			Ok(set) => debug!(emotes = set.emotes.len(), "global emotes ready"),
			Err(err) => warn!(error = %err, "global emote fetch failed"),
		}
	}

	/// Fetch room info, emotes and the message backlog for one admitted room.
	async fn hydrate(&self, room: RoomRegistration) {
		let room_id = room.room_id.clone();

		let room = match self.data.fetch_room_info(&room.slug).await {
			Ok(info) => {
				let status = info.live_status.clone();
				let updated = self.update_registration(&room_id, |reg| {
					let mut changed = reg.apply_live_status(&status);
					changed |= fill(&mut reg.channels.channel_id, info.metadata.channel_id);
					changed |= fill(&mut reg.channels.user_id, info.metadata.user_id);
					changed
				});
				self.sink.on_live_status_changed(&room_id, &status);
				match updated {
					Some(room) => {
						self.propagate(room.clone()).await;
						room
					}
					None => room,
				}
			}
			Err(err) => {
				warn!(room = %room_id, error = %format!("{err:#}"), "room info fetch failed");
				room
			}
		};
		if !self.is_tracked(&room_id) {
			debug!(room = %room_id, "room removed during hydration");
			return;
		}

		let emotes = self
			.room_emotes
			.get_or_fetch(room_id.clone(), || async { self.data.fetch_room_emotes(&room).await.map(Arc::new) });
		let (emotes, backlog) = tokio::join!(emotes, self.data.fetch_initial_messages(&room));

		match emotes {
			Ok(sets) => {
				debug!(room = %room_id, sets = sets.len(), "room emotes ready");
				self.adopt_seventv_set(&room_id, &sets).await;
			}
			Err(err) => warn!(room = %room_id, error = %err, "room emote fetch failed"),
		}

		match backlog {
			Ok(_) if !self.is_tracked(&room_id) => {
				debug!(room = %room_id, "room removed during hydration; backlog dropped");
			}
			Ok(backlog) => {
				for message in &backlog.messages {
					self.recent_messages.insert(&room_id, message.id.clone(), message.clone());
				}
				self.sink.on_initial_messages(&room_id, &backlog.messages);
				if let Some(pinned) = backlog.pinned.as_ref() {
					self.sink.on_pinned_message_changed(&room_id, Some(pinned));
				}
			}
			Err(err) => warn!(room = %room_id, error = %format!("{err:#}"), "message backlog fetch failed"),
		}
	}

	/// Record the room's 7TV user and emote set ids so the cosmetics connection
	/// can subscribe to them.
	async fn adopt_seventv_set(&self, room_id: &RoomId, sets: &[EmoteSet]) {
		let Some(set) = sets.iter().find(|s| s.source == EmoteSource::SevenTv) else {
			return;
		};

		let updated = self.update_registration(room_id, |reg| {
			let mut changed = fill(&mut reg.channels.seventv_emote_set_id, Some(set.id.clone()));
			changed |= fill(&mut reg.channels.seventv_user_id, set.owner_id.clone());
			changed
		});
		if let Some(room) = updated {
			debug!(room = %room_id, set_id = %set.id, "7tv emote set linked");
			self.propagate(room).await;
		}
	}

	async fn handle_event(&self, event: ProviderEvent) {
		if let Some(room_id) = event.room_id.as_ref() {
			match &event.kind {
				EventKind::Kick(kind) => self.handle_kick_event(room_id, kind, &event.payload).await,
				EventKind::SevenTv(ty) if ty.is_emote_set() => {
					if self.room_emotes.invalidate(room_id) {
						debug!(room = %room_id, kind = %event.kind, "room emotes invalidated");
					}
				}
				EventKind::SevenTv(_) => {}
			}
		}
		self.sink.on_event(&event);
	}

	async fn handle_kick_event(&self, room_id: &RoomId, kind: &KickEvent, payload: &serde_json::Value) {
		if let Some(status) = parse_live_status(kind, payload) {
			self.apply_live_status(room_id, status).await;
			return;
		}

		if let Some(pinned) = parse_pinned_change(kind, room_id, payload) {
			self.sink.on_pinned_message_changed(room_id, pinned.as_ref());
			return;
		}

		if *kind == KickEvent::ChatMessage {
			match parse_chat_message(room_id, payload) {
				Some(message) => self.recent_messages.insert(room_id, message.id.clone(), message),
				None => debug!(room = %room_id, "unparseable chat message"),
			}
		}
	}

	async fn apply_live_status(&self, room_id: &RoomId, status: LiveStatus) {
		let Some(room) = self.update_registration(room_id, |reg| reg.apply_live_status(&status)) else {
			return;
		};

		info!(room = %room_id, live = status.is_live(), "live status changed");
		self.sink.on_live_status_changed(room_id, &status);
		match self.chat.update_room(room).await {
			Ok(_) => {}
			Err(err) => warn!(room = %room_id, error = %err, "chat room update failed"),
		}
	}
}

/// Fill the gaps in `room` from what is already `known` about it. Live state
/// comes from `known`, since it follows events the caller has not seen.
fn merge_known(mut room: RoomRegistration, known: &RoomRegistration) -> RoomRegistration {
	room.is_live = known.is_live;
	room.channels.livestream_id = known.channels.livestream_id.clone();

	let channels = &mut room.channels;
	let known = &known.channels;
	fill(&mut channels.channel_id, known.channel_id.clone());
	fill(&mut channels.user_id, known.user_id.clone());
	fill(&mut channels.seventv_user_id, known.seventv_user_id.clone());
	fill(&mut channels.seventv_emote_set_id, known.seventv_emote_set_id.clone());
	room
}

/// Set `slot` from `value` when it is still unknown.
fn fill(slot: &mut Option<String>, value: Option<String>) -> bool {
	match (slot.as_ref(), value) {
		(None, Some(value)) => {
			*slot = Some(value);
			true
		}
		_ => false,
	}
}
