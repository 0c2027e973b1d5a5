#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use anyhow::anyhow;
use async_trait::async_trait;
use kickmux_domain::{Provider, RoomId, RoomRegistration};
use kickmux_util::backoff::ReconnectionPolicy;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::listeners::{ChannelEvent, ConnectionEvent, Listeners};
use crate::protocol::{InboundFrame, ProviderProtocol, SubscriptionKey};
use crate::transport::{BoxFuture, OutboundFrame, SocketConnector, SocketEvent, SocketPair, websocket_connector};
use crate::{ConnectionState, EventKind, ProviderEvent};


#[derive(Debug, Error)]
pub enum ConnectionError {
	/// The connection was closed with [`PooledProviderConnection::close`].
	#[error("connection closed")]
	Closed,
	/// Opening the socket failed; a reconnect has been scheduled.
	#[error("transport error: {0:#}")]
	Transport(anyhow::Error),
}

/// Signs private channel subscriptions for a session.
#[async_trait]
pub trait ChannelSigner: Send + Sync {
	async fn sign(&self, channel: &str, session_id: &str) -> anyhow::Result<String>;
}

/// Point-in-time view of one pooled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
	pub provider: Provider,
	pub state: ConnectionState,
	pub rooms: usize,
	pub subscriptions: usize,
	pub reconnect_attempt: u32,
	pub session_id: Option<String>,
}

/// Object-safe face of a pooled connection.
#[async_trait]
pub trait RoomConnection: Send + Sync {
	fn provider(&self) -> Provider;

	fn state(&self) -> ConnectionState;

	fn listeners(&self) -> &Listeners;

	async fn connect(&self) -> Result<(), ConnectionError>;

	async fn wait_connected(&self) -> Result<(), ConnectionError>;

	async fn add_room(&self, room: RoomRegistration) -> Result<(), ConnectionError>;

	async fn update_room(&self, room: RoomRegistration) -> Result<bool, ConnectionError>;

	async fn remove_room(&self, room_id: &RoomId) -> Result<bool, ConnectionError>;

	async fn close(&self);

	async fn snapshot(&self) -> ConnectionSnapshot;
}

#[derive(Clone)]
pub struct ConnectionConfig {
	pub policy: ReconnectionPolicy,
	/// Overrides the websocket connector (tests).
	pub connector: Option<SocketConnector>,
	pub signer: Option<Arc<dyn ChannelSigner>>,
}

impl ConnectionConfig {
	pub fn new(policy: ReconnectionPolicy) -> Self {
		Self {
			policy,
			connector: None,
			signer: None,
		}
	}
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self::new(ReconnectionPolicy::default())
	}
}

/// One physical socket multiplexing the subscriptions of many rooms.
///
/// Cloning is cheap and yields a handle to the same connection.
pub struct PooledProviderConnection<P: ProviderProtocol> {
	shared: Arc<Shared<P>>,
}

impl<P: ProviderProtocol> Clone for PooledProviderConnection<P> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
		}
	}
}

struct Shared<P: ProviderProtocol> {
	protocol: P,
	connector: SocketConnector,
	policy: ReconnectionPolicy,
	signer: Option<Arc<dyn ChannelSigner>>,

	should_reconnect: AtomicBool,
	terminated: AtomicBool,
	reconnect_timer: parking_lot::Mutex<Option<JoinHandle<()>>>,
	state_tx: watch::Sender<ConnectionState>,
	listeners: Listeners,

	inner: Mutex<Inner<P::Topic>>,
}

/// Registry and subscription bookkeeping, always updated together.
struct Inner<T> {
	/// Bumped whenever the socket is replaced or torn down.
	generation: u64,
	socket: Option<mpsc::UnboundedSender<OutboundFrame>>,
	reader: Option<JoinHandle<()>>,
	/// Set by the handshake; `Some` iff connected.
	session_id: Option<String>,
	reconnect_attempt: u32,

	rooms: BTreeMap<RoomId, RoomRegistration>,
	/// Room-scoped keys a subscribe frame was sent for, with the rooms using them.
	subscribed: HashMap<SubscriptionKey, Subscription<T>>,
	/// Connection-wide keys a subscribe frame was sent for.
	globals: HashMap<SubscriptionKey, T>,
}

struct Subscription<T> {
	topic: T,
	owners: BTreeSet<RoomId>,
}

impl<T> Inner<T> {
	fn new() -> Self {
		Self {
			generation: 0,
			socket: None,
			reader: None,
			session_id: None,
			reconnect_attempt: 0,
			rooms: BTreeMap::new(),
			subscribed: HashMap::new(),
			globals: HashMap::new(),
		}
	}

	fn is_connected(&self) -> bool {
		self.socket.is_some() && self.session_id.is_some()
	}

	fn keys_owned_by(&self, room_id: &RoomId) -> Vec<SubscriptionKey> {
		self.subscribed
			.iter()
			.filter(|(_, sub)| sub.owners.contains(room_id))
			.map(|(key, _)| key.clone())
			.collect()
	}
}

impl<P: ProviderProtocol> PooledProviderConnection<P> {
	pub fn new(protocol: P, cfg: ConnectionConfig) -> Self {
		let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
		let connector = cfg.connector.unwrap_or_else(websocket_connector);
		Self {
			shared: Arc::new(Shared {
				protocol,
				connector,
				policy: cfg.policy,
				signer: cfg.signer,
				should_reconnect: AtomicBool::new(true),
				terminated: AtomicBool::new(false),
				reconnect_timer: parking_lot::Mutex::new(None),
				state_tx,
				listeners: Listeners::new(),
				inner: Mutex::new(Inner::new()),
			}),
		}
	}

	pub fn provider(&self) -> Provider {
		self.shared.protocol.provider()
	}

	pub fn state(&self) -> ConnectionState {
		*self.shared.state_tx.borrow()
	}

	pub fn listeners(&self) -> &Listeners {
		&self.shared.listeners
	}

	/// Watch the connection state.
	pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
		self.shared.state_tx.subscribe()
	}

	/// Whether a reconnect timer is armed.
	pub fn reconnect_pending(&self) -> bool {
		self.shared
			.reconnect_timer
			.lock()
			.as_ref()
			.is_some_and(|handle| !handle.is_finished())
	}

	/// Open the socket. No-op unless `Disconnected` with reconnects enabled.
	///
	/// Returns once the socket is open; the connection reaches `Connected` when
	/// the provider handshake arrives.
	pub async fn connect(&self) -> Result<(), ConnectionError> {
		connect_shared(Arc::clone(&self.shared)).await
	}

	/// Resolve once the connection is `Connected`.
	pub async fn wait_connected(&self) -> Result<(), ConnectionError> {
		let mut rx = self.shared.state_tx.subscribe();
		loop {
			if *rx.borrow_and_update() == ConnectionState::Connected {
				return Ok(());
			}
			if self.shared.terminated.load(Ordering::SeqCst) {
				return Err(ConnectionError::Closed);
			}
			if rx.changed().await.is_err() {
				return Err(ConnectionError::Closed);
			}
		}
	}

	/// Register a room and subscribe to its channels when connected.
	///
	/// Re-adding a registered room only reconciles changed metadata. Adding to a
	/// connection that closed itself after its last room left re-opens it.
	pub async fn add_room(&self, room: RoomRegistration) -> Result<(), ConnectionError> {
		let provider = self.provider();
		let rearm = {
			let mut inner = self.shared.inner.lock().await;
			if self.shared.terminated.load(Ordering::SeqCst) {
				return Err(ConnectionError::Closed);
			}

			let room_id = room.room_id.clone();
			if inner.rooms.get(&room_id) != Some(&room) {
				debug!(%provider, room = %room_id, "registering room");
				let desired = self.shared.desired_topics(&room);
				inner.rooms.insert(room_id.clone(), room);
				self.shared.reconcile_room(&mut inner, &room_id, desired).await;
			}

			!self.shared.should_reconnect.swap(true, Ordering::SeqCst)
		};

		if rearm {
			info!(%provider, "re-opening idle connection");
			if let Err(err) = self.connect().await {
				warn!(%provider, error = %err, "re-open failed");
			}
		}
		Ok(())
	}

	/// Replace a registered room's metadata. Returns false for unknown rooms.
	pub async fn update_room(&self, room: RoomRegistration) -> Result<bool, ConnectionError> {
		let mut inner = self.shared.inner.lock().await;
		if self.shared.terminated.load(Ordering::SeqCst) {
			return Err(ConnectionError::Closed);
		}

		let room_id = room.room_id.clone();
		match inner.rooms.get(&room_id) {
			None => return Ok(false),
			Some(existing) if *existing == room => return Ok(true),
			Some(_) => {}
		}

		let desired = self.shared.desired_topics(&room);
		inner.rooms.insert(room_id.clone(), room);
		self.shared.reconcile_room(&mut inner, &room_id, desired).await;
		Ok(true)
	}

	/// Drop a room and release its subscriptions. Returns false for unknown rooms.
	///
	/// Removing the last room closes the connection; a later `add_room` re-opens it.
	pub async fn remove_room(&self, room_id: &RoomId) -> Result<bool, ConnectionError> {
		let provider = self.provider();
		let mut inner = self.shared.inner.lock().await;
		if inner.rooms.remove(room_id).is_none() {
			return Ok(false);
		}

		debug!(%provider, room = %room_id, "unregistering room");
		for key in inner.keys_owned_by(room_id) {
			self.shared.release(&mut inner, &key, room_id);
		}

		if inner.rooms.is_empty() && !self.shared.terminated.load(Ordering::SeqCst) {
			info!(%provider, "no rooms left; closing connection");
			self.shared.should_reconnect.store(false, Ordering::SeqCst);
			self.shared.cancel_reconnect_timer();
			self.shared.teardown(&mut inner);
		}
		Ok(true)
	}

	/// Stop for good: cancel any pending reconnect, unsubscribe and close the socket.
	///
	/// Safe to call from any state, any number of times.
	pub async fn close(&self) {
		self.shared.should_reconnect.store(false, Ordering::SeqCst);
		self.shared.terminated.store(true, Ordering::SeqCst);
		self.shared.cancel_reconnect_timer();

		let mut inner = self.shared.inner.lock().await;
		self.shared.teardown(&mut inner);
		self.shared.state_tx.send_modify(|state| *state = ConnectionState::Disconnected);
	}

	pub async fn snapshot(&self) -> ConnectionSnapshot {
		let inner = self.shared.inner.lock().await;
		ConnectionSnapshot {
			provider: self.provider(),
			state: self.state(),
			rooms: inner.rooms.len(),
			subscriptions: inner.subscribed.len() + inner.globals.len(),
			reconnect_attempt: inner.reconnect_attempt,
			session_id: inner.session_id.clone(),
		}
	}

	/// Keys with an active subscription, sorted.
	pub async fn subscribed_keys(&self) -> Vec<SubscriptionKey> {
		let inner = self.shared.inner.lock().await;
		let mut keys: Vec<SubscriptionKey> = inner.subscribed.keys().chain(inner.globals.keys()).cloned().collect();
		keys.sort();
		keys
	}

	pub async fn room(&self, room_id: &RoomId) -> Option<RoomRegistration> {
		self.shared.inner.lock().await.rooms.get(room_id).cloned()
	}
}

#[async_trait]
impl<P: ProviderProtocol> RoomConnection for PooledProviderConnection<P> {
	fn provider(&self) -> Provider {
		PooledProviderConnection::provider(self)
	}

	fn state(&self) -> ConnectionState {
		PooledProviderConnection::state(self)
	}

	fn listeners(&self) -> &Listeners {
		PooledProviderConnection::listeners(self)
	}

	async fn connect(&self) -> Result<(), ConnectionError> {
		PooledProviderConnection::connect(self).await
	}

	async fn wait_connected(&self) -> Result<(), ConnectionError> {
		PooledProviderConnection::wait_connected(self).await
	}

	async fn add_room(&self, room: RoomRegistration) -> Result<(), ConnectionError> {
		PooledProviderConnection::add_room(self, room).await
	}

	async fn update_room(&self, room: RoomRegistration) -> Result<bool, ConnectionError> {
		PooledProviderConnection::update_room(self, room).await
	}

	async fn remove_room(&self, room_id: &RoomId) -> Result<bool, ConnectionError> {
		PooledProviderConnection::remove_room(self, room_id).await
	}

	async fn close(&self) {
		PooledProviderConnection::close(self).await
	}

	async fn snapshot(&self) -> ConnectionSnapshot {
		PooledProviderConnection::snapshot(self).await
	}
}

fn connect_boxed<P: ProviderProtocol>(shared: Arc<Shared<P>>) -> BoxFuture<'static, ()> {
	Box::pin(async move {
		let provider = shared.protocol.provider();
		if let Err(err) = connect_shared(shared).await {
			debug!(%provider, error = %err, "reconnect attempt failed");
		}
	})
}

async fn connect_shared<P: ProviderProtocol>(shared: Arc<Shared<P>>) -> Result<(), ConnectionError> {
	let provider = shared.protocol.provider();
	let generation = {
		let mut inner = shared.inner.lock().await;
		if !shared.should_reconnect.load(Ordering::SeqCst) || *shared.state_tx.borrow() != ConnectionState::Disconnected {
			return Ok(());
		}
		inner.generation += 1;
		shared.set_state(ConnectionState::Connecting);
		inner.generation
	};

	info!(%provider, url = %shared.protocol.url(), "connecting");
	let opened = (shared.connector)(shared.protocol.url().to_string()).await;

	let mut inner = shared.inner.lock().await;
	if inner.generation != generation || !shared.should_reconnect.load(Ordering::SeqCst) {
		// Closed or replaced while the socket was opening.
		if let Ok(SocketPair { outbound, .. }) = opened {
			let _ = outbound.send(OutboundFrame::Close);
		}
		return Ok(());
	}

	match opened {
		Ok(SocketPair { outbound, inbound }) => {
			debug!(%provider, generation, "socket open; awaiting handshake");
			inner.socket = Some(outbound);
			inner.reader = Some(tokio::spawn(read_loop(Arc::clone(&shared), generation, inbound)));
			Ok(())
		}
		Err(err) => {
			warn!(%provider, error = %err, "connect failed");
			shared.set_state(ConnectionState::Disconnected);
			shared.schedule_reconnect(&mut inner);
			Err(ConnectionError::Transport(err))
		}
	}
}

async fn read_loop<P: ProviderProtocol>(
	shared: Arc<Shared<P>>,
	generation: u64,
	mut inbound: mpsc::UnboundedReceiver<SocketEvent>,
) {
	let provider = shared.protocol.provider();
	while let Some(event) = inbound.recv().await {
		match event {
			SocketEvent::Text(text) => {
				if !shared.handle_text(generation, &text).await {
					return;
				}
			}
			SocketEvent::Closed(reason) => {
				info!(%provider, reason = reason.as_deref().unwrap_or(""), "socket closed by peer");
				shared.socket_down(generation, "closed by peer").await;
				return;
			}
			SocketEvent::Error(err) => {
				warn!(%provider, error = %err, "socket error");
				shared.socket_down(generation, "socket error").await;
				return;
			}
		}
	}
	shared.socket_down(generation, "socket stream ended").await;
}

impl<P: ProviderProtocol> Shared<P> {
	fn set_state(&self, state: ConnectionState) {
		let changed = self.state_tx.send_if_modified(|current| {
			if *current == state {
				false
			} else {
				*current = state;
				true
			}
		});
		if changed {
			let provider = self.protocol.provider();
			debug!(%provider, %state, "connection state changed");
			self.listeners
				.emit_connection(ConnectionEvent::StateChanged { provider, state });
		}
	}

	fn cancel_reconnect_timer(&self) {
		if let Some(handle) = self.reconnect_timer.lock().take() {
			handle.abort();
		}
	}

	fn desired_topics(&self, room: &RoomRegistration) -> Vec<P::Topic> {
		let mut topics = self.protocol.room_topics(room);
		topics.extend(self.protocol.status_topics(room));
		topics
	}

	fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner<P::Topic>) {
		if !self.should_reconnect.load(Ordering::SeqCst) {
			return;
		}

		let provider = self.protocol.provider();
		inner.reconnect_attempt = inner.reconnect_attempt.saturating_add(1);
		let attempt = inner.reconnect_attempt;
		let delay = self.policy.delay(attempt);

		info!(%provider, attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
		metrics::counter!("kickmux_connection_reconnects_total", "provider" => provider.as_str()).increment(1);
		self.listeners.emit_connection(ConnectionEvent::ReconnectScheduled {
			provider,
			attempt,
			delay,
		});

		let shared = Arc::clone(self);
		let mut slot = self.reconnect_timer.lock();
		if let Some(previous) = slot.take() {
			previous.abort();
		}
		*slot = Some(tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			// Detach our own handle so a concurrent close cannot abort the connect midway.
			drop(shared.reconnect_timer.lock().take());
			if !shared.should_reconnect.load(Ordering::SeqCst) {
				return;
			}
			connect_boxed(shared).await;
		}));
	}

	/// Returns false when the reader should stop.
	async fn handle_text(self: &Arc<Self>, generation: u64, text: &str) -> bool {
		let provider = self.protocol.provider();
		let frame = match self.protocol.decode(text) {
			Ok(frame) => frame,
			Err(err) => {
				warn!(%provider, error = %err, "dropping malformed frame");
				metrics::counter!("kickmux_connection_frames_dropped_total", "provider" => provider.as_str()).increment(1);
				return true;
			}
		};

		let mut inner = self.inner.lock().await;
		if inner.generation != generation {
			return false;
		}

		match frame {
			InboundFrame::Handshake { session_id } => self.on_handshake(&mut inner, session_id).await,
			InboundFrame::SubscriptionAck { key } => {
				debug!(%provider, key = key.as_ref().map(|k| k.as_str()).unwrap_or(""), "subscription acknowledged");
			}
			InboundFrame::Ping => {
				if let (Some(pong), Some(socket)) = (self.protocol.encode_pong(), inner.socket.as_ref()) {
					let _ = socket.send(OutboundFrame::Text(pong));
				}
			}
			InboundFrame::Heartbeat => {}
			InboundFrame::ReconnectRequested { reason } => {
				info!(%provider, %reason, "server requested reconnect");
				self.drop_socket(&mut inner, &reason);
				return false;
			}
			InboundFrame::ServerError { message } => {
				warn!(%provider, %message, "server error frame");
			}
			InboundFrame::Event { route, kind, payload } => self.route_event(&inner, route, kind, payload),
			InboundFrame::Ignored => {}
		}
		true
	}

	async fn on_handshake(self: &Arc<Self>, inner: &mut Inner<P::Topic>, session_id: String) {
		let provider = self.protocol.provider();
		info!(%provider, %session_id, rooms = inner.rooms.len(), "connection established");
		inner.session_id = Some(session_id);
		inner.reconnect_attempt = 0;
		self.set_state(ConnectionState::Connected);

		for topic in self.protocol.global_topics() {
			let key = self.protocol.topic_key(&topic);
			if inner.globals.contains_key(&key) {
				continue;
			}
			if self.send_subscribe(inner, &topic, None).await {
				inner.globals.insert(key, topic);
			}
		}

		let rooms: Vec<RoomRegistration> = inner.rooms.values().cloned().collect();
		for room in rooms {
			let desired = self.desired_topics(&room);
			self.reconcile_room(inner, &room.room_id, desired).await;
		}
	}

	fn route_event(&self, inner: &Inner<P::Topic>, route: Option<SubscriptionKey>, kind: EventKind, payload: serde_json::Value) {
		let provider = self.protocol.provider();
		let targets: Vec<Option<RoomId>> = match route {
			None => vec![None],
			Some(key) if inner.globals.contains_key(&key) => vec![None],
			Some(key) => match inner.subscribed.get(&key) {
				Some(sub) => sub.owners.iter().cloned().map(Some).collect(),
				None => match self.protocol.room_for_key(&key, &inner.rooms) {
					Some(room_id) => vec![Some(room_id)],
					None => {
						debug!(%provider, %key, %kind, "dropping event for untracked subscription");
						metrics::counter!("kickmux_connection_frames_dropped_total", "provider" => provider.as_str())
							.increment(1);
						return;
					}
				},
			},
		};

		let received_at = SystemTime::now();
		for room_id in targets {
			self.listeners.emit_message(ProviderEvent {
				provider,
				room_id,
				kind: kind.clone(),
				payload: payload.clone(),
				received_at,
			});
		}
	}

	/// Bring a room's subscriptions in line with `desired`.
	async fn reconcile_room(&self, inner: &mut Inner<P::Topic>, room_id: &RoomId, desired: Vec<P::Topic>) {
		let desired: Vec<(SubscriptionKey, P::Topic)> = desired
			.into_iter()
			.map(|topic| (self.protocol.topic_key(&topic), topic))
			.collect();

		let stale: Vec<SubscriptionKey> = {
			let wanted: HashSet<&SubscriptionKey> = desired.iter().map(|(key, _)| key).collect();
			inner
				.keys_owned_by(room_id)
				.into_iter()
				.filter(|key| !wanted.contains(key))
				.collect()
		};
		for key in stale {
			self.release(inner, &key, room_id);
		}

		if !inner.is_connected() {
			return;
		}

		for (key, topic) in desired {
			if let Some(sub) = inner.subscribed.get_mut(&key) {
				sub.owners.insert(room_id.clone());
				continue;
			}
			if self.send_subscribe(inner, &topic, Some(room_id)).await {
				inner.subscribed.insert(
					key,
					Subscription {
						topic,
						owners: BTreeSet::from([room_id.clone()]),
					},
				);
			}
		}
	}

	/// Drop `room_id`'s claim on `key`; unsubscribe once nobody uses it.
	fn release(&self, inner: &mut Inner<P::Topic>, key: &SubscriptionKey, room_id: &RoomId) {
		let Some(sub) = inner.subscribed.get_mut(key) else {
			return;
		};
		sub.owners.remove(room_id);
		if !sub.owners.is_empty() {
			return;
		}
		if let Some(sub) = inner.subscribed.remove(key) {
			self.send_unsubscribe(inner, key, &sub.topic);
		}
	}

	async fn send_subscribe(&self, inner: &Inner<P::Topic>, topic: &P::Topic, room_id: Option<&RoomId>) -> bool {
		let provider = self.protocol.provider();
		let key = self.protocol.topic_key(topic);
		let Some(socket) = inner.socket.as_ref() else {
			return false;
		};

		let auth = if self.protocol.requires_auth(topic) {
			match self.sign(&key, inner.session_id.as_deref()).await {
				Ok(auth) => Some(auth),
				Err(err) => {
					self.subscription_failed(room_id, &key, format!("{err:#}"));
					return false;
				}
			}
		} else {
			None
		};

		let frame = match self.protocol.encode_subscribe(topic, auth.as_deref()) {
			Ok(frame) => frame,
			Err(err) => {
				self.subscription_failed(room_id, &key, format!("{err:#}"));
				return false;
			}
		};

		if socket.send(OutboundFrame::Text(frame)).is_err() {
			debug!(%provider, %key, "socket gone before subscribe");
			return false;
		}

		debug!(%provider, %key, "subscribed");
		self.listeners
			.emit_channel(ChannelEvent::Subscribed { provider, key });
		true
	}

	fn send_unsubscribe(&self, inner: &Inner<P::Topic>, key: &SubscriptionKey, topic: &P::Topic) {
		let provider = self.protocol.provider();
		let Some(socket) = inner.socket.as_ref().filter(|_| inner.session_id.is_some()) else {
			return;
		};

		match self.protocol.encode_unsubscribe(topic) {
			Ok(frame) => {
				let _ = socket.send(OutboundFrame::Text(frame));
				debug!(%provider, %key, "unsubscribed");
				self.listeners.emit_channel(ChannelEvent::Unsubscribed {
					provider,
					key: key.clone(),
				});
			}
			Err(err) => warn!(%provider, %key, error = %err, "encode unsubscribe failed"),
		}
	}

	async fn sign(&self, key: &SubscriptionKey, session_id: Option<&str>) -> anyhow::Result<String> {
		let signer = self.signer.as_ref().ok_or_else(|| anyhow!("no channel signer configured"))?;
		let session_id = session_id.ok_or_else(|| anyhow!("no session id"))?;
		signer.sign(key.as_str(), session_id).await
	}

	fn subscription_failed(&self, room_id: Option<&RoomId>, key: &SubscriptionKey, reason: String) {
		let provider = self.protocol.provider();
		warn!(
			%provider,
			room = room_id.map(|r| r.as_str()).unwrap_or(""),
			%key,
			%reason,
			"subscription skipped"
		);
		metrics::counter!("kickmux_subscription_failures_total", "provider" => provider.as_str()).increment(1);
		self.listeners.emit_channel(ChannelEvent::SubscriptionFailed {
			provider,
			room_id: room_id.cloned(),
			key: key.clone(),
			reason,
		});
	}

	/// Unsubscribe everything still open, close the socket, reset bookkeeping.
	///
	/// Callers clear `should_reconnect` first; no reconnect is scheduled.
	fn teardown(&self, inner: &mut Inner<P::Topic>) {
		let provider = self.protocol.provider();
		let was_active = inner.socket.is_some() || *self.state_tx.borrow() != ConnectionState::Disconnected;

		let subscribed: Vec<(SubscriptionKey, P::Topic)> =
			inner.subscribed.drain().map(|(key, sub)| (key, sub.topic)).collect();
		let globals: Vec<(SubscriptionKey, P::Topic)> = inner.globals.drain().collect();
		for (key, topic) in subscribed.iter().chain(globals.iter()) {
			self.send_unsubscribe(inner, key, topic);
		}

		if let Some(socket) = inner.socket.take() {
			let _ = socket.send(OutboundFrame::Close);
		}
		if let Some(reader) = inner.reader.take() {
			reader.abort();
		}
		// The attempt counter only resets on a successful handshake.
		inner.session_id = None;
		inner.generation += 1;
		self.set_state(ConnectionState::Disconnected);

		if was_active {
			info!(%provider, "connection closed");
			self.listeners.emit_connection(ConnectionEvent::Closed { provider });
		}
	}

	async fn socket_down(self: &Arc<Self>, generation: u64, reason: &str) {
		let mut inner = self.inner.lock().await;
		if inner.generation != generation {
			return;
		}
		self.drop_socket(&mut inner, reason);
	}

	/// Lose the current socket (called from its reader) and schedule a reconnect.
	fn drop_socket(self: &Arc<Self>, inner: &mut Inner<P::Topic>, reason: &str) {
		let provider = self.protocol.provider();
		if let Some(socket) = inner.socket.take() {
			let _ = socket.send(OutboundFrame::Close);
		}
		// Our own handle; dropping detaches.
		inner.reader = None;
		inner.subscribed.clear();
		inner.globals.clear();
		inner.session_id = None;
		inner.generation += 1;

		warn!(%provider, reason, "connection lost");
		self.set_state(ConnectionState::Disconnected);
		self.schedule_reconnect(inner);
	}
}
