#![forbid(unsafe_code)]

pub mod backoff {
	use std::time::Duration;

	/// Exponential reconnect delay with a capped exponent.
	///
	/// `delay(attempt) = base * 2^(min(attempt, max_steps) - 1)`. Stateless; the
	/// attempt counter belongs to the caller.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ReconnectionPolicy {
		base: Duration,
		max_steps: u32,
	}

	impl ReconnectionPolicy {
		pub const DEFAULT_BASE: Duration = Duration::from_secs(1);
		pub const DEFAULT_MAX_STEPS: u32 = 6;

		/// Largest supported exponent step (`2^31`).
		const STEP_LIMIT: u32 = 32;

		pub fn new(base: Duration, max_steps: u32) -> Self {
			Self {
				base,
				max_steps: max_steps.clamp(1, Self::STEP_LIMIT),
			}
		}

		pub fn base(&self) -> Duration {
			self.base
		}

		pub fn max_steps(&self) -> u32 {
			self.max_steps
		}

		/// Delay before reconnect attempt `attempt` (1-based; 0 is treated as 1).
		pub fn delay(&self, attempt: u32) -> Duration {
			let step = attempt.clamp(1, self.max_steps);
			let factor = 1u32 << (step - 1);
			self.base.saturating_mul(factor)
		}

		/// Upper bound of `delay`.
		pub fn max_delay(&self) -> Duration {
			self.delay(self.max_steps)
		}
	}

	impl Default for ReconnectionPolicy {
		fn default() -> Self {
			Self::new(Self::DEFAULT_BASE, Self::DEFAULT_MAX_STEPS)
		}
	}

}

pub mod batch {
	/// Stable sort with priority items first.
	pub fn prioritize<T>(mut items: Vec<T>, is_priority: impl Fn(&T) -> bool) -> Vec<T> {
		items.sort_by_key(|item| !is_priority(item));
		items
	}

	/// Split into consecutive batches of at most `size` items (`size` 0 is treated as 1).
	pub fn partition<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
		let size = size.max(1);
		let mut batches = Vec::with_capacity(items.len().div_ceil(size));
		let mut current = Vec::with_capacity(size);
		for item in items {
			current.push(item);
			if current.len() == size {
				batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
			}
		}
		if !current.is_empty() {
			batches.push(current);
		}
		batches
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn partition_shapes() {
			let sizes: Vec<usize> = partition((0..7).collect(), 3).iter().map(Vec::len).collect();
			assert_eq!(sizes, vec![3, 3, 1]);

			assert!(partition(Vec::<u8>::new(), 3).is_empty());
			assert_eq!(partition(vec![1, 2], 0), vec![vec![1], vec![2]]);
		}

		#[test]
		fn prioritize_is_stable() {
			let rooms = vec![("a", true), ("b", false), ("c", true), ("d", false)];
			let ordered: Vec<&str> = prioritize(rooms, |r| r.1).into_iter().map(|r| r.0).collect();
			assert_eq!(ordered, vec!["a", "c", "b", "d"]);
		}
	}
}
