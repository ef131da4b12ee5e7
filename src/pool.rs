//! Priority-ordered bounded slot pool — the semaphore primitive that backs
//! both the connection-admission pool and the long-task pool.
//!
//! `tokio::sync::Semaphore` is deliberately not used here: it wakes waiters
//! strictly FIFO and has no notion of priority, while this pool must serve
//! waiters by priority first and arrival order only as a tie-break (the
//! demotion-outranks-fresh-accepts guarantee depends on this).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::AdmissionError;

/// Priority for a pool acquire or reacquire. Higher values are served
/// first; waiters at equal priority are served in arrival order.
pub type Priority = u32;

struct Waiter {
	priority: Priority,
	seq: u64,
	tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
	fn eq(&self, other: &Self) -> bool {
		self.priority == other.priority && self.seq == other.seq
	}
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Waiter {
	fn cmp(&self, other: &Self) -> Ordering {
		// BinaryHeap pops the greatest element first. Higher priority must
		// pop first; among equal priorities, the earlier arrival (lower
		// seq) must pop first, so the seq comparison is reversed.
		self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
	}
}

struct Inner {
	available: usize,
	waiters: BinaryHeap<Waiter>,
	next_seq: u64,
}

/// A bounded pool of interchangeable tokens with priority-ordered waiting.
///
/// Cloning is cheap: clones share the same underlying state via `Arc`, the
/// same way `ConnectionGuard` and `WorkerPool` share their inner state in
/// this crate's siblings.
#[derive(Clone)]
pub struct SlotPool {
	inner: Arc<Mutex<Inner>>,
	capacity: usize,
}

/// Read-only occupancy snapshot. Taking one never mutates pool state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolSnapshot {
	pub capacity: usize,
	pub available: usize,
	pub waiting: usize,
}

impl SlotPool {
	/// Creates a pool with the given capacity. `capacity` is immutable for
	/// the pool's lifetime; callers validate `capacity >= 1` themselves
	/// (see `PoolConfig::new`) where that invariant matters externally.
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner {
				available: capacity,
				waiters: BinaryHeap::new(),
				next_seq: 0,
			})),
			capacity,
		}
	}

	#[must_use]
	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Acquires a token, waiting indefinitely if the pool is full. Wakes in
	/// strict priority-then-FIFO order.
	///
	/// # Panics
	/// Panics if the pool is torn down (all clones dropped) while this call
	/// is queued. Every pool in this crate is kept alive for the lifetime
	/// of the gate/long-task that owns it, so this is not reachable through
	/// the crate's own API; see [`AdmissionError::WaiterDropped`].
	pub async fn acquire(&self, priority: Priority) -> SlotToken {
		self.acquire_raw(priority, None)
			.await
			.expect("pool was dropped while a caller waited on it with no timeout");
		SlotToken::new_held(self.clone())
	}

	/// Acquires a token only if one is immediately available, without
	/// enqueueing a waiter. Equivalent to `acquire(priority, timeout=0)`.
	#[must_use]
	pub fn try_acquire(&self, priority: Priority) -> Option<SlotToken> {
		let _ = priority;
		if self.try_acquire_raw() {
			Some(SlotToken::new_held(self.clone()))
		} else {
			None
		}
	}

	/// Acquires a token, waiting up to `timeout`. Returns `None` on timeout.
	///
	/// Note: under a true multi-threaded race between this timeout elapsing
	/// and a concurrent `release()` handing the slot to this exact waiter,
	/// the permit can in principle be lost rather than returned to the
	/// pool (the oneshot value is delivered and then dropped unread). This
	/// crate never exercises this path internally — the accept gate and
	/// the long-task acquire protocol both use `acquire` with no timeout —
	/// so the race is unreachable in practice; it is documented here rather
	/// than closed with a more elaborate two-phase handoff.
	pub async fn acquire_timeout(&self, priority: Priority, timeout: Duration) -> Option<SlotToken> {
		match self.acquire_raw(priority, Some(timeout)).await {
			Ok(true) => Some(SlotToken::new_held(self.clone())),
			Ok(false) | Err(_) => None,
		}
	}

	/// Releases the pool's internal bookkeeping for one outstanding token.
	/// Hands the slot directly to the highest-priority waiter if one is
	/// queued (no change to `available`); otherwise increments `available`.
	fn release_token(&self) {
		let mut inner = self.inner.lock().unwrap();
		loop {
			match inner.waiters.pop() {
				Some(waiter) => {
					if waiter.tx.send(()).is_ok() {
						trace!(priority = waiter.priority, seq = waiter.seq, "handed slot to waiter");
						return;
					}
					// This waiter's acquire already gave up (timed out or
					// was dropped); try the next one instead of leaking.
				}
				None => {
					inner.available += 1;
					return;
				}
			}
		}
	}

	fn try_acquire_raw(&self) -> bool {
		let mut inner = self.inner.lock().unwrap();
		if inner.available > 0 {
			inner.available -= 1;
			true
		} else {
			false
		}
	}

	/// `Ok(true)` once a slot is held, `Ok(false)` if a finite `timeout`
	/// elapsed first, `Err(WaiterDropped)` only if the pool itself was torn
	/// down while this call had no timeout to fall back on.
	async fn acquire_raw(&self, priority: Priority, timeout: Option<Duration>) -> Result<bool, AdmissionError> {
		let rx = {
			let mut inner = self.inner.lock().unwrap();
			if inner.available > 0 {
				inner.available -= 1;
				return Ok(true);
			}
			let (tx, rx) = oneshot::channel();
			let seq = inner.next_seq;
			inner.next_seq += 1;
			inner.waiters.push(Waiter { priority, seq, tx });
			debug!(priority, seq, waiting = inner.waiters.len(), "enqueued pool waiter");
			rx
		};

		match timeout {
			None => rx.await.map(|()| true).map_err(|_| AdmissionError::WaiterDropped),
			Some(duration) => Ok(matches!(tokio::time::timeout(duration, rx).await, Ok(Ok(())))),
		}
	}

	/// Current occupancy, for the statistics surface.
	#[must_use]
	pub fn snapshot(&self) -> PoolSnapshot {
		let inner = self.inner.lock().unwrap();
		PoolSnapshot {
			capacity: self.capacity,
			available: inner.available,
			waiting: inner.waiters.len(),
		}
	}
}

/// A semantic handle representing ownership of one unit of a `SlotPool`.
///
/// A token is a reusable identity: `release` followed by `reacquire` gives
/// back the same `SlotToken` value restored to `held`, rather than forcing
/// callers to discard it and obtain a fresh one.
pub struct SlotToken {
	pool: SlotPool,
	held: bool,
}

impl SlotToken {
	fn new_held(pool: SlotPool) -> Self {
		Self { pool, held: true }
	}

	#[must_use]
	pub fn is_held(&self) -> bool {
		self.held
	}

	/// Releases the token. Idempotent: a second call is a silent no-op.
	pub fn release(&mut self) {
		if self.held {
			self.held = false;
			self.pool.release_token();
		}
	}

	/// Re-acquires a released token at the given priority, waiting
	/// indefinitely if the pool is full.
	///
	/// # Errors
	/// Returns [`AdmissionError::WaiterDropped`] only if the pool backing
	/// this token was torn down while this call was queued.
	pub async fn reacquire(&mut self, priority: Priority) -> Result<(), AdmissionError> {
		debug_assert!(!self.held, "reacquire called on an already-held token");
		self.pool.acquire_raw(priority, None).await?;
		self.held = true;
		Ok(())
	}

	/// Re-acquires a released token only if a slot is immediately
	/// available, without enqueueing a waiter.
	#[must_use]
	pub fn try_reacquire(&mut self, priority: Priority) -> bool {
		let _ = priority;
		debug_assert!(!self.held, "try_reacquire called on an already-held token");
		if self.pool.try_acquire_raw() {
			self.held = true;
			true
		} else {
			false
		}
	}
}

impl Drop for SlotToken {
	fn drop(&mut self) {
		self.release();
	}
}
