#![forbid(unsafe_code)]

use std::hash::Hash;
use std::sync::Arc;

use kickmux_domain::RoomId;

use super::BoundedCache;

/// Per-room bounded caches, themselves held in a bounded cache of rooms.
///
/// Trimming the outer cache drops whole rooms; each room trims its own entries.
pub struct RoomScopedCache<K, V> {
	rooms: BoundedCache<RoomId, Arc<BoundedCache<K, V>>>,
	name: &'static str,
	per_room: usize,
}

impl<K, V> RoomScopedCache<K, V>
where
	K: Eq + Hash + Clone,
	V: Clone,
{
	pub fn new(name: &'static str, max_rooms: usize, per_room: usize) -> Self {
		Self {
			rooms: BoundedCache::new(name, max_rooms),
			name,
			per_room,
		}
	}

	pub fn max_rooms(&self) -> usize {
		self.rooms.capacity()
	}

	pub fn per_room(&self) -> usize {
		self.per_room.max(1)
	}

	/// Rooms currently tracked.
	pub fn rooms(&self) -> usize {
		self.rooms.len()
	}

	pub fn entries(&self) -> usize {
		self.rooms.values().iter().map(|room| room.len()).sum()
	}

	/// Cache of one room, created on first use.
	pub fn room(&self, room_id: &RoomId) -> Arc<BoundedCache<K, V>> {
		self.rooms
			.get_or_insert_with(room_id.clone(), || Arc::new(BoundedCache::new(self.name, self.per_room)))
	}

	pub fn insert(&self, room_id: &RoomId, key: K, value: V) {
		self.room(room_id).insert(key, value);
	}

	pub fn get(&self, room_id: &RoomId, key: &K) -> Option<V> {
		self.rooms.get(room_id)?.get(key)
	}

	/// Entries of a room from oldest to newest; empty for untracked rooms.
	pub fn values(&self, room_id: &RoomId) -> Vec<V> {
		self.rooms.get(room_id).map(|room| room.values()).unwrap_or_default()
	}

	pub fn remove_room(&self, room_id: &RoomId) -> bool {
		self.rooms.remove(room_id).is_some()
	}
}
