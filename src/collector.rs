//! Bounded FIFO of retired segment addresses, freed after a minimum age.
//!
//! Mirrors this codebase's established pattern of coordinating a bounded
//! amount of in-flight work across threads behind an `antidote::Mutex`
//! rather than a channel, since eviction needs random access to the front
//! of the queue by age, not strict one-shot consume semantics.

use antidote::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::block::{Address, BlockPool};

/// Retires segment block chains on a delay, bounding how much memory a
/// stalled maintenance thread can leave pinned.
pub struct Collector {
	pool: Arc<BlockPool>,
	capacity: usize,
	delay: Duration,
	pending: Mutex<VecDeque<(Address, Instant)>>,
}

impl Collector {
	/// `capacity` bounds the FIFO (`Q` in the design); `delay` is the
	/// minimum age (`D`) an entry must reach before
	/// [`Self::free_collected_segments`] will free it.
	pub fn new(pool: Arc<BlockPool>, capacity: usize, delay: Duration) -> Collector {
		Collector {
			pool,
			capacity,
			delay,
			pending: Mutex::new(VecDeque::with_capacity(capacity)),
		}
	}

	/// Enqueues `addr` for later freeing. If the queue is already at
	/// capacity, the oldest pending entry is evicted and freed
	/// synchronously rather than growing without bound.
	pub fn collect_segment(&self, addr: Address) {
		let mut pending = self.pending.lock();
		if pending.len() >= self.capacity {
			if let Some((oldest, _)) = pending.pop_front() {
				self.free_chain(oldest);
			}
		}
		pending.push_back((addr, Instant::now()));
	}

	/// Frees every entry that has aged at least `delay`, stopping at the
	/// first one that hasn't — FIFO order guarantees age is monotonic
	/// front-to-back for a constant `delay`.
	pub fn free_collected_segments(&self) {
		let mut pending = self.pending.lock();
		while let Some(&(addr, enqueued)) = pending.front() {
			if enqueued.elapsed() < self.delay {
				break;
			}
			pending.pop_front();
			self.free_chain(addr);
		}
	}

	/// Number of addresses currently queued, awaiting free.
	pub fn pending_len(&self) -> usize {
		self.pending.lock().len()
	}

	fn free_chain(&self, addr: Address) {
		let mut addr = addr;
		loop {
			let next = self.pool.get_word(addr, 0);
			self.pool.free(addr);
			if next == 0 {
				break;
			}
			addr = next;
		}
	}
}
