#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use kickmux_domain::{
	ChatMessage, Emote, EmoteSet, EmoteSource, InitialMessages, LiveStatus, PinnedMessage, Provider, RoomId, RoomInfo,
	RoomMetadata, RoomRegistration, Sender,
};
use kickmux_platform::kick::KickEvent;
use kickmux_platform::seventv::DispatchType;
use kickmux_platform::{ConnectionError, ConnectionSnapshot, ConnectionState, EventKind, Listeners, ProviderEvent};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;

use super::*;

struct FakeConnection {
	provider: Provider,
	listeners: Listeners,
	state_tx: watch::Sender<ConnectionState>,
	reachable: bool,
	log: Mutex<FakeLog>,
}

#[derive(Default)]
struct FakeLog {
	rooms: BTreeMap<RoomId, RoomRegistration>,
	rejected: HashSet<RoomId>,
	added: Vec<(RoomId, Instant)>,
	removed: Vec<RoomId>,
	updates: Vec<RoomRegistration>,
	closed: bool,
}

impl FakeConnection {
	fn new(provider: Provider) -> Arc<Self> {
		Self::build(provider, true)
	}

	/// Never reaches `Connected`.
	fn unreachable(provider: Provider) -> Arc<Self> {
		Self::build(provider, false)
	}

	fn build(provider: Provider, reachable: bool) -> Arc<Self> {
		let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
		Arc::new(Self {
			provider,
			listeners: Listeners::new(),
			state_tx,
			reachable,
			log: Mutex::new(FakeLog::default()),
		})
	}

	fn reject(&self, room_id: &str) {
		self.log.lock().rejected.insert(id(room_id));
	}

	fn added(&self) -> Vec<(RoomId, Instant)> {
		self.log.lock().added.clone()
	}

	fn removed(&self) -> Vec<RoomId> {
		self.log.lock().removed.clone()
	}

	fn updates(&self) -> Vec<RoomRegistration> {
		self.log.lock().updates.clone()
	}

	fn closed(&self) -> bool {
		self.log.lock().closed
	}

	fn emit(&self, room_id: &str, kind: EventKind, payload: serde_json::Value) {
		self.listeners.emit_message(ProviderEvent {
			provider: self.provider,
			room_id: Some(id(room_id)),
			kind,
			payload,
			received_at: SystemTime::now(),
		});
	}
}

#[async_trait]
impl RoomConnection for FakeConnection {
	fn provider(&self) -> Provider {
		self.provider
	}

	fn state(&self) -> ConnectionState {
		*self.state_tx.borrow()
	}

	fn listeners(&self) -> &Listeners {
		&self.listeners
	}

	async fn connect(&self) -> Result<(), ConnectionError> {
		if self.log.lock().closed {
			return Err(ConnectionError::Closed);
		}
		if self.reachable {
			self.state_tx.send_replace(ConnectionState::Connected);
		} else {
			self.state_tx.send_replace(ConnectionState::Connecting);
		}
		Ok(())
	}

	async fn wait_connected(&self) -> Result<(), ConnectionError> {
		let mut rx = self.state_tx.subscribe();
		rx.wait_for(|state| *state == ConnectionState::Connected)
			.await
			.map(|_| ())
			.map_err(|_| ConnectionError::Closed)
	}

	async fn add_room(&self, room: RoomRegistration) -> Result<(), ConnectionError> {
		let mut log = self.log.lock();
		if log.closed {
			return Err(ConnectionError::Closed);
		}
		if log.rejected.contains(&room.room_id) {
			return Err(ConnectionError::Transport(anyhow::anyhow!("rejected")));
		}
		log.added.push((room.room_id.clone(), Instant::now()));
		log.rooms.insert(room.room_id.clone(), room);
		Ok(())
	}

	async fn update_room(&self, room: RoomRegistration) -> Result<bool, ConnectionError> {
		let mut log = self.log.lock();
		log.updates.push(room.clone());
		let known = log.rooms.contains_key(&room.room_id);
		if known {
			log.rooms.insert(room.room_id.clone(), room);
		}
		Ok(known)
	}

	async fn remove_room(&self, room_id: &RoomId) -> Result<bool, ConnectionError> {
		let mut log = self.log.lock();
		log.removed.push(room_id.clone());
		Ok(log.rooms.remove(room_id).is_some())
	}

	async fn close(&self) {
		self.log.lock().closed = true;
		self.state_tx.send_replace(ConnectionState::Disconnected);
	}

	async fn snapshot(&self) -> ConnectionSnapshot {
		ConnectionSnapshot {
			provider: self.provider,
			state: self.state(),
			rooms: self.log.lock().rooms.len(),
			subscriptions: 0,
			reconnect_attempt: 0,
			session_id: None,
		}
	}
}

#[derive(Default)]
struct FakeData {
	global_fetches: AtomicUsize,
	info_fetches: Mutex<Vec<String>>,
	/// When set, emote and backlog fetches wait until it turns true.
	gate: Mutex<Option<watch::Receiver<bool>>>,
	held: AtomicUsize,
}

impl FakeData {
	fn hold(&self) -> watch::Sender<bool> {
		let (tx, rx) = watch::channel(false);
		*self.gate.lock() = Some(rx);
		tx
	}

	async fn pass_gate(&self) {
		let gate = self.gate.lock().clone();
		if let Some(mut rx) = gate {
			self.held.fetch_add(1, Ordering::SeqCst);
			let _ = rx.wait_for(|open| *open).await;
		}
	}
}

#[async_trait]
impl RoomDataSource for FakeData {
	async fn fetch_room_emotes(&self, room: &RoomRegistration) -> anyhow::Result<Vec<EmoteSet>> {
		self.pass_gate().await;
		Ok(vec![
			EmoteSet {
				id: format!("kick-{}", room.slug),
				name: "channel".to_string(),
				source: EmoteSource::Kick,
				owner_id: None,
				emotes: vec![],
			},
			EmoteSet {
				id: format!("set-{}", room.slug),
				name: "7tv".to_string(),
				source: EmoteSource::SevenTv,
				owner_id: Some(format!("7tv-{}", room.slug)),
				emotes: vec![Emote {
					id: "e1".to_string(),
					name: "KEKW".to_string(),
					animated: false,
					owner: None,
				}],
			},
		])
	}

	async fn fetch_global_emotes(&self) -> anyhow::Result<EmoteSet> {
		self.global_fetches.fetch_add(1, Ordering::SeqCst);
		Ok(EmoteSet {
			id: "global".to_string(),
			name: "global".to_string(),
			source: EmoteSource::SevenTv,
			owner_id: None,
			emotes: vec![],
		})
	}

	async fn fetch_room_info(&self, slug: &str) -> anyhow::Result<RoomInfo> {
		self.info_fetches.lock().push(slug.to_string());
		Ok(RoomInfo {
			live_status: LiveStatus::Offline,
			metadata: RoomMetadata {
				channel_id: Some(format!("ch-{slug}")),
				user_id: Some(format!("user-{slug}")),
				category: None,
			},
		})
	}

	async fn fetch_initial_messages(&self, room: &RoomRegistration) -> anyhow::Result<InitialMessages> {
		self.pass_gate().await;
		let message = chat_message(&room.room_id, "m0", "backlog");
		Ok(InitialMessages {
			pinned: Some(PinnedMessage {
				message: message.clone(),
				pinned_by: Some("mod".to_string()),
				duration_secs: Some(60),
			}),
			messages: vec![message],
		})
	}
}

#[derive(Debug, Clone, PartialEq)]
enum SinkCall {
	Pinned(RoomId, Option<String>),
	Initial(RoomId, usize),
	Live(RoomId, bool),
	Event(RoomId, String),
}

#[derive(Default)]
struct RecordingSink {
	calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
	fn calls(&self) -> Vec<SinkCall> {
		self.calls.lock().clone()
	}

	fn events(&self) -> usize {
		self.calls
			.lock()
			.iter()
			.filter(|c| matches!(c, SinkCall::Event(..)))
			.count()
	}
}

impl RoomEventSink for RecordingSink {
	fn on_pinned_message_changed(&self, room_id: &RoomId, pinned: Option<&PinnedMessage>) {
		self.calls
			.lock()
			.push(SinkCall::Pinned(room_id.clone(), pinned.map(|p| p.message.id.clone())));
	}

	fn on_initial_messages(&self, room_id: &RoomId, messages: &[ChatMessage]) {
		self.calls.lock().push(SinkCall::Initial(room_id.clone(), messages.len()));
	}

	fn on_live_status_changed(&self, room_id: &RoomId, status: &LiveStatus) {
		self.calls.lock().push(SinkCall::Live(room_id.clone(), status.is_live()));
	}

	fn on_event(&self, event: &ProviderEvent) {
		let room_id = event.room_id.clone().unwrap_or_else(|| id("none"));
		self.calls.lock().push(SinkCall::Event(room_id, event.kind.to_string()));
	}
}

struct Harness {
	chat: Arc<FakeConnection>,
	cosmetics: Arc<FakeConnection>,
	data: Arc<FakeData>,
	sink: Arc<RecordingSink>,
	orchestrator: ConnectionOrchestrator,
}

fn harness_with(chat: Arc<FakeConnection>, cosmetics: Arc<FakeConnection>) -> Harness {
	let data = Arc::new(FakeData::default());
	let sink = Arc::new(RecordingSink::default());
	let cfg = OrchestratorConfig {
		connect_timeout: Duration::from_secs(2),
		fetch_batch_delay: Duration::from_millis(100),
		max_rooms_cached: 16,
		messages_per_room: 8,
	};
	let orchestrator = ConnectionOrchestrator::new(chat.clone(), cosmetics.clone(), data.clone(), sink.clone(), cfg);
	Harness {
		chat,
		cosmetics,
		data,
		sink,
		orchestrator,
	}
}

fn harness() -> Harness {
	harness_with(FakeConnection::new(Provider::Kick), FakeConnection::new(Provider::SevenTv))
}

fn id(value: &str) -> RoomId {
	RoomId::new(value).unwrap()
}

fn ids(values: &[&str]) -> Vec<RoomId> {
	values.iter().map(|v| id(v)).collect()
}

fn room(room_id: &str, live: bool) -> RoomRegistration {
	let mut room = RoomRegistration::new(id(room_id), room_id.to_lowercase());
	room.is_live = live;
	room
}

fn chat_message(room_id: &RoomId, message_id: &str, content: &str) -> ChatMessage {
	ChatMessage {
		id: message_id.to_string(),
		room_id: room_id.clone(),
		sender: Sender {
			id: "1".to_string(),
			username: "viewer".to_string(),
			slug: None,
		},
		content: content.to_string(),
		created_at: None,
		reply_to: None,
	}
}

fn opts(batch_size: usize, stagger_secs: u64) -> StartupOptions {
	StartupOptions {
		batch_size,
		stagger_delay: Duration::from_secs(stagger_secs),
		max_concurrent_fetches: 3,
	}
}

async fn wait_for_events(sink: &RecordingSink, count: usize) {
	tokio::time::timeout(Duration::from_secs(1), async {
		while sink.events() < count {
			tokio::task::yield_now().await;
		}
	})
	.await
	.unwrap();
}

#[tokio::test(start_paused = true)]
async fn live_rooms_are_admitted_first_in_staggered_batches() {
	let h = harness();
	let rooms = vec![room("A", true), room("B", false), room("C", true), room("D", false)];

	let started = Instant::now();
	let report = h.orchestrator.initialize(rooms, opts(2, 5)).await.unwrap();

	// Live-first is a stable sort: A stays ahead of C, B ahead of D.
	assert_eq!(report.admission_batches, vec![ids(&["A", "C"]), ids(&["B", "D"])]);
	assert_eq!(report.admission_delays, 1);
	assert!(report.failed.is_empty());
	assert_eq!(report.hydration_batches, 2);

	for conn in [&h.chat, &h.cosmetics] {
		let added = conn.added();
		assert_eq!(added.len(), 4);
		for (room_id, at) in added {
			let offset = at - started;
			if room_id == id("A") || room_id == id("C") {
				assert!(offset < Duration::from_secs(1), "{room_id} admitted at {offset:?}");
			} else {
				assert!(offset >= Duration::from_secs(5), "{room_id} admitted at {offset:?}");
			}
		}
	}

	let status = h.orchestrator.status().await;
	assert!(status.running);
	assert_eq!(status.rooms.admitted, 4);
	assert_eq!(status.chat.state, ConnectionState::Connected);
	assert_eq!(status.cosmetics.rooms, 4);
}

#[tokio::test(start_paused = true)]
async fn seven_rooms_in_batches_of_three() {
	let h = harness();
	let rooms: Vec<RoomRegistration> = (1..=7).map(|n| room(&n.to_string(), false)).collect();

	let report = h.orchestrator.initialize(rooms, opts(3, 1)).await.unwrap();

	let shape: Vec<usize> = report.admission_batches.iter().map(Vec::len).collect();
	assert_eq!(shape, vec![3, 3, 1]);
	assert_eq!(report.admission_delays, 2);
}

#[tokio::test(start_paused = true)]
async fn startup_timeout_closes_both_connections() {
	let h = harness_with(
		FakeConnection::new(Provider::Kick),
		FakeConnection::unreachable(Provider::SevenTv),
	);

	let err = h
		.orchestrator
		.initialize(vec![room("A", false)], opts(2, 1))
		.await
		.unwrap_err();

	assert!(matches!(err, OrchestratorError::StartupTimeout(_)));
	assert!(h.chat.closed());
	assert!(h.cosmetics.closed());
	assert!(h.chat.added().is_empty());
	assert!(!h.orchestrator.is_running());

	let again = h.orchestrator.initialize(vec![room("A", false)], opts(2, 1)).await;
	assert!(matches!(again, Err(OrchestratorError::ShutDown)));
}

#[tokio::test(start_paused = true)]
async fn half_admitted_room_is_rolled_back() {
	let h = harness();
	h.cosmetics.reject("B");

	let rooms = vec![room("A", false), room("B", false), room("C", false)];
	let report = h.orchestrator.initialize(rooms, opts(5, 1)).await.unwrap();

	assert_eq!(report.failed, ids(&["B"]));
	assert_eq!(h.chat.removed(), ids(&["B"]));
	assert_eq!(h.orchestrator.admission(&id("B")), Some(Admission::Failed));
	assert_eq!(h.orchestrator.admission(&id("A")), Some(Admission::Admitted));

	let status = h.orchestrator.status().await;
	assert_eq!(status.rooms.admitted, 2);
	assert_eq!(status.rooms.failed, 1);
	assert_eq!(status.chat.rooms, 2);

	// failed rooms are not hydrated
	assert!(!h.data.info_fetches.lock().contains(&"b".to_string()));
}

#[tokio::test(start_paused = true)]
async fn initialize_twice_is_a_no_op() {
	let h = harness();
	h.orchestrator.initialize(vec![room("A", false)], opts(2, 1)).await.unwrap();

	let second = h.orchestrator.initialize(vec![room("B", false)], opts(2, 1)).await.unwrap();
	assert_eq!(second, StartupReport::default());
	assert_eq!(h.chat.added().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_remaining_batches() {
	let h = harness();
	let rooms = vec![room("A", false), room("B", false), room("C", false), room("D", false)];

	let orchestrator = h.orchestrator.clone();
	let startup = tokio::spawn(async move { orchestrator.initialize(rooms, opts(2, 10)).await });

	tokio::time::sleep(Duration::from_secs(1)).await;
	h.orchestrator.shutdown().await;
	let report = startup.await.unwrap().unwrap();

	assert_eq!(report.admission_batches, vec![ids(&["A", "B"])]);
	assert_eq!(h.chat.added().len(), 2);
	assert!(h.chat.closed());
	assert!(h.cosmetics.closed());

	let err = h.orchestrator.add_room(room("E", false)).await.unwrap_err();
	assert!(matches!(err, OrchestratorError::ShutDown));
	h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn room_operations_require_running() {
	let h = harness();
	assert!(matches!(
		h.orchestrator.add_room(room("A", false)).await,
		Err(OrchestratorError::NotRunning)
	));
	assert!(matches!(
		h.orchestrator.remove_room(&id("A")).await,
		Err(OrchestratorError::NotRunning)
	));
}

#[tokio::test(start_paused = true)]
async fn hydration_fills_caches_and_links_seventv_ids() {
	let h = harness();
	h.orchestrator
		.initialize(vec![room("A", false), room("B", false)], opts(2, 1))
		.await
		.unwrap();

	assert_eq!(h.data.global_fetches.load(Ordering::SeqCst), 1);
	assert!(h.orchestrator.global_emotes().is_some());
	assert_eq!(h.orchestrator.room_emotes(&id("A")).map(|sets| sets.len()), Some(2));

	let a = h.orchestrator.registration(&id("A")).unwrap();
	assert_eq!(a.channels.channel_id.as_deref(), Some("ch-a"));
	assert_eq!(a.channels.user_id.as_deref(), Some("user-a"));
	assert_eq!(a.channels.seventv_emote_set_id.as_deref(), Some("set-a"));
	assert_eq!(a.channels.seventv_user_id.as_deref(), Some("7tv-a"));
	assert!(h.cosmetics.updates().iter().any(|r| *r == a));

	assert_eq!(h.orchestrator.recent_messages(&id("A")).len(), 1);
	let calls = h.sink.calls();
	assert!(calls.contains(&SinkCall::Initial(id("A"), 1)));
	assert!(calls.contains(&SinkCall::Pinned(id("B"), Some("m0".to_string()))));
	assert!(calls.contains(&SinkCall::Live(id("A"), false)));

	h.orchestrator.add_room(room("E", false)).await.unwrap();
	assert_eq!(h.data.global_fetches.load(Ordering::SeqCst), 1);
	assert!(h.orchestrator.room_emotes(&id("E")).is_some());
	assert_eq!(h.orchestrator.status().await.caches.room_emotes, 3);

	assert!(h.orchestrator.remove_room(&id("E")).await.unwrap());
	assert!(h.orchestrator.room_emotes(&id("E")).is_none());
	assert!(h.orchestrator.recent_messages(&id("E")).is_empty());
	assert!(!h.orchestrator.remove_room(&id("E")).await.unwrap());
}

#[tokio::test]
async fn forwarded_events_update_rooms_and_caches() {
	let h = harness();
	h.orchestrator
		.initialize(vec![room("A", false)], StartupOptions::default())
		.await
		.unwrap();
	let updates_before = h.chat.updates().len();

	h.chat.emit(
		"A",
		EventKind::Kick(KickEvent::StreamerIsLive),
		json!({"livestream": {"id": 99, "session_title": "hello"}}),
	);
	h.chat.emit(
		"A",
		EventKind::Kick(KickEvent::ChatMessage),
		json!({"id": "m1", "content": "hi", "sender": {"id": 5, "username": "viewer"}}),
	);
	h.chat.emit("A", EventKind::Kick(KickEvent::PinnedMessageDeleted), json!({}));
	h.cosmetics.emit(
		"A",
		EventKind::SevenTv(DispatchType::EmoteSetUpdate),
		json!({"id": "set-a"}),
	);
	wait_for_events(&h.sink, 4).await;

	let calls = h.sink.calls();
	assert!(calls.contains(&SinkCall::Live(id("A"), true)));
	assert!(calls.contains(&SinkCall::Pinned(id("A"), None)));
	assert!(calls.contains(&SinkCall::Event(id("A"), "kick:StreamerIsLive".to_string())));

	let updates = h.chat.updates();
	assert_eq!(updates.len(), updates_before + 1);
	let live = updates.last().unwrap();
	assert!(live.is_live);
	assert_eq!(live.channels.livestream_id.as_deref(), Some("99"));

	let recent = h.orchestrator.recent_messages(&id("A"));
	assert_eq!(recent.last().map(|m| m.id.as_str()), Some("m1"));
	assert!(h.orchestrator.room_emotes(&id("A")).is_none());
}

#[tokio::test(start_paused = true)]
async fn room_removed_mid_hydration_leaves_no_cache_entries() {
	let h = harness();
	h.orchestrator.initialize(vec![], opts(2, 1)).await.unwrap();

	let release = h.data.hold();
	let adding = tokio::spawn({
		let orchestrator = h.orchestrator.clone();
		async move { orchestrator.add_room(room("A", false)).await }
	});
	while h.data.held.load(Ordering::SeqCst) < 2 {
		tokio::task::yield_now().await;
	}

	assert!(h.orchestrator.remove_room(&id("A")).await.unwrap());
	release.send(true).unwrap();
	adding.await.unwrap().unwrap();

	assert!(h.orchestrator.room_emotes(&id("A")).is_none());
	assert!(h.orchestrator.recent_messages(&id("A")).is_empty());
	assert!(h.orchestrator.registration(&id("A")).is_none());
	assert!(!h.sink.calls().contains(&SinkCall::Initial(id("A"), 1)));

	let status = h.orchestrator.status().await;
	assert_eq!(status.caches.room_emotes, 0);
	assert_eq!(status.caches.message_rooms, 0);
}

#[tokio::test(start_paused = true)]
async fn emote_set_update_during_fetch_discards_the_fetched_sets() {
	let h = harness();
	h.orchestrator.initialize(vec![], opts(2, 1)).await.unwrap();

	let release = h.data.hold();
	let adding = tokio::spawn({
		let orchestrator = h.orchestrator.clone();
		async move { orchestrator.add_room(room("A", false)).await }
	});
	while h.data.held.load(Ordering::SeqCst) < 2 {
		tokio::task::yield_now().await;
	}

	h.cosmetics.emit(
		"A",
		EventKind::SevenTv(DispatchType::EmoteSetUpdate),
		json!({"id": "set-a"}),
	);
	wait_for_events(&h.sink, 1).await;

	release.send(true).unwrap();
	adding.await.unwrap().unwrap();

	assert!(h.orchestrator.room_emotes(&id("A")).is_none());
	// the room itself is still hydrated
	assert_eq!(h.orchestrator.recent_messages(&id("A")).len(), 1);
}
