#![forbid(unsafe_code)]

mod room_scoped;


use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

pub use room_scoped::RoomScopedCache;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
	#[error("fetch failed: {0:#}")]
	Fetch(Arc<anyhow::Error>),
	/// The in-flight fetch was cancelled before producing a value.
	#[error("fetch abandoned")]
	Abandoned,
}

type FetchSlot<V> = Option<Result<V, CacheError>>;

/// Size-bounded map with single-flight loading.
///
/// Once the map grows past `max_size`, the oldest half of the entries (by
/// insertion) is dropped in one pass. This is not an LRU: reads do not
/// refresh an entry, re-inserting does.
pub struct BoundedCache<K, V> {
	name: &'static str,
	max_size: usize,
	state: Mutex<State<K, V>>,
}

struct State<K, V> {
	seq: u64,
	entries: HashMap<K, Entry<V>>,
	inflight: HashMap<K, Inflight<V>>,
}

struct Entry<V> {
	value: V,
	seq: u64,
}

enum Claim<V> {
	Cached(V),
	Wait(watch::Receiver<FetchSlot<V>>),
	Lead(u64, watch::Sender<FetchSlot<V>>),
}

struct Inflight<V> {
	id: u64,
	rx: watch::Receiver<FetchSlot<V>>,
	/// Invalidated mid-fetch; the result is handed out but not stored.
	stale: bool,
}

impl<K, V> BoundedCache<K, V>
where
	K: Eq + Hash + Clone,
	V: Clone,
{
	/// `max_size` is clamped to at least one entry.
	pub fn new(name: &'static str, max_size: usize) -> Self {
		Self {
			name,
			max_size: max_size.max(1),
			state: Mutex::new(State {
				seq: 0,
				entries: HashMap::new(),
				inflight: HashMap::new(),
			}),
		}
	}

	pub fn capacity(&self) -> usize {
		self.max_size
	}

	pub fn len(&self) -> usize {
		self.state.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn get(&self, key: &K) -> Option<V> {
		self.state.lock().entries.get(key).map(|e| e.value.clone())
	}

	pub fn contains_key(&self, key: &K) -> bool {
		self.state.lock().entries.contains_key(key)
	}

	pub fn insert(&self, key: K, value: V) {
		let mut state = self.state.lock();
		self.insert_locked(&mut state, key, value);
	}

	/// Sync counterpart of [`get_or_fetch`](Self::get_or_fetch).
	pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
		let mut state = self.state.lock();
		if let Some(entry) = state.entries.get(&key) {
			return entry.value.clone();
		}
		let value = make();
		self.insert_locked(&mut state, key, value.clone());
		value
	}

	pub fn remove(&self, key: &K) -> Option<V> {
		self.state.lock().entries.remove(key).map(|e| e.value)
	}

	/// Drop `key` and keep a fetch already running for it from storing its result.
	///
	/// Returns true when an entry or an in-flight fetch was affected.
	pub fn invalidate(&self, key: &K) -> bool {
		let mut state = self.state.lock();
		let removed = state.entries.remove(key).is_some();
		let marked = match state.inflight.get_mut(key) {
			Some(inflight) => {
				inflight.stale = true;
				true
			}
			None => false,
		};
		removed || marked
	}

	/// Values from oldest to newest insertion.
	pub fn values(&self) -> Vec<V> {
		let state = self.state.lock();
		let mut entries: Vec<&Entry<V>> = state.entries.values().collect();
		entries.sort_by_key(|e| e.seq);
		entries.into_iter().map(|e| e.value.clone()).collect()
	}

	/// Return the cached value or run `fetch` for it.
	///
	/// Concurrent callers for the same missing key share one fetch and all see
	/// its outcome. Failures are not cached.
	pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V, CacheError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = anyhow::Result<V>>,
	{
		let (id, tx) = match self.claim(&key) {
			Claim::Cached(value) => return Ok(value),
			Claim::Wait(rx) => return Self::wait(rx).await,
			Claim::Lead(id, tx) => (id, tx),
		};

		let mut guard = InflightGuard {
			cache: self,
			key: Some(key),
			id,
		};

		debug!(cache = self.name, "fetching missing entry");
		let result = fetch().await.map_err(|e| CacheError::Fetch(Arc::new(e)));

		if let Some(key) = guard.key.take() {
			let mut state = self.state.lock();
			let ours = state.inflight.get(&key).is_some_and(|f| f.id == id);
			let stale = ours && state.inflight.remove(&key).is_some_and(|f| f.stale);
			if stale {
				debug!(cache = self.name, "fetched entry invalidated; not storing");
			} else if let Ok(value) = &result {
				self.insert_locked(&mut state, key, value.clone());
			}
		}

		let _ = tx.send(Some(result.clone()));
		result
	}

	fn claim(&self, key: &K) -> Claim<V> {
		let mut state = self.state.lock();
		if let Some(entry) = state.entries.get(key) {
			return Claim::Cached(entry.value.clone());
		}
		if let Some(inflight) = state.inflight.get(key) {
			return Claim::Wait(inflight.rx.clone());
		}

		state.seq += 1;
		let id = state.seq;
		let (tx, rx) = watch::channel(None);
		state.inflight.insert(key.clone(), Inflight { id, rx, stale: false });
		Claim::Lead(id, tx)
	}

	async fn wait(mut rx: watch::Receiver<FetchSlot<V>>) -> Result<V, CacheError> {
		match rx.wait_for(Option::is_some).await {
			Ok(slot) => slot.clone().unwrap_or(Err(CacheError::Abandoned)),
			Err(_) => Err(CacheError::Abandoned),
		}
	}

	fn insert_locked(&self, state: &mut State<K, V>, key: K, value: V) {
		state.seq += 1;
		let seq = state.seq;
		state.entries.insert(key, Entry { value, seq });

		if state.entries.len() > self.max_size {
			let drop_count = state.entries.len() / 2;
			let mut by_age: Vec<(u64, K)> = state.entries.iter().map(|(k, e)| (e.seq, k.clone())).collect();
			by_age.sort_unstable_by_key(|(seq, _)| *seq);
			for (_, key) in by_age.into_iter().take(drop_count) {
				state.entries.remove(&key);
			}
			debug!(
				cache = self.name,
				dropped = drop_count,
				remaining = state.entries.len(),
				"cache trimmed"
			);
		}
	}
}

/// Clears the in-flight marker when the leading fetch is dropped mid-way.
struct InflightGuard<'a, K: Eq + Hash, V> {
	cache: &'a BoundedCache<K, V>,
	key: Option<K>,
	id: u64,
}

impl<K: Eq + Hash, V> Drop for InflightGuard<'_, K, V> {
	fn drop(&mut self) {
		if let Some(key) = self.key.take() {
			let mut state = self.cache.state.lock();
			if state.inflight.get(&key).is_some_and(|f| f.id == self.id) {
				state.inflight.remove(&key);
			}
		}
	}
}
