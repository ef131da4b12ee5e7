//! The promotion/demotion state machine (spec §4.3). This is the hard core
//! of the crate: swapping a connection slot for a long-task slot without a
//! window where the same request counts against both, and cancelling a
//! pending delayed promotion without racing a concurrent `stop`.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::connection::Connection;
use crate::pool::{Priority, SlotPool, SlotToken};

/// Priority used by the accept gate's own connection-pool acquire.
pub const PRIORITY_ACCEPT: Priority = 0;

/// Priority used by a long task's acquire from its delayed-start task. A
/// promoted long task waiting for a long-task slot has no urgency
/// advantage over its peers, so this matches `PRIORITY_ACCEPT`.
pub const PRIORITY_LONG_TASK_START: Priority = 0;

/// Priority used when re-acquiring a connection token on demotion. Must
/// exceed `PRIORITY_ACCEPT` so a demoting request is never starved by
/// unbounded fresh connection arrivals.
pub const PRIORITY_DEMOTE: Priority = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
	Idle,
	Pending,
	Promoted,
}

struct Inner {
	state: State,
	/// `Some` whenever the request's connection exposed a token at
	/// construction, regardless of whether that token is currently held or
	/// released. `None` only when the connection never had one.
	connection_token: Option<SlotToken>,
	long_task_token: Option<SlotToken>,
	/// Bumped on every `start`, and again by a `stop` that observes
	/// `Pending`. A delayed or immediate promotion in flight compares its
	/// captured generation against the current one after its acquire
	/// completes; a mismatch means a `stop` raced it, and the just-acquired
	/// token is released unused instead of being promoted.
	generation: u64,
}

/// Per-request promotion/demotion state machine. Holds at most one
/// borrowed connection token and at most one owned long-task token.
pub struct LongTask<C: Connection> {
	connection: Arc<C>,
	long_task_pool: SlotPool,
	start_delay: Duration,
	inner: Mutex<Inner>,
}

impl<C: Connection + 'static> LongTask<C> {
	/// Builds a long task bound to `connection`, discovering its
	/// connection-pool token (if any) and taking ownership of it for the
	/// request's lifetime.
	#[must_use]
	pub fn new(connection: Arc<C>, long_task_pool: SlotPool, start_delay: Duration) -> Arc<Self> {
		let connection_token = connection.take_connection_token();
		Arc::new(Self {
			connection,
			long_task_pool,
			start_delay,
			inner: Mutex::new(Inner { state: State::Idle, connection_token, long_task_token: None, generation: 0 }),
		})
	}

	/// `true` iff the task is `pending` or `promoted`.
	#[must_use]
	pub fn started(&self) -> bool {
		matches!(self.inner.lock().unwrap().state, State::Pending | State::Promoted)
	}

	/// Requests promotion. A no-op if already started. `delay = None` uses
	/// the task's configured default; `Some(Duration::ZERO)` promotes
	/// synchronously before returning.
	pub async fn start(self: &Arc<Self>, delay: Option<Duration>) {
		let delay = delay.unwrap_or(self.start_delay);
		let generation = {
			let mut inner = self.inner.lock().unwrap();
			if inner.state != State::Idle {
				return;
			}
			inner.state = State::Pending;
			inner.generation += 1;
			inner.generation
		};

		if delay.is_zero() {
			debug!("long task promoting immediately");
			self.clone().promote(generation, PRIORITY_LONG_TASK_START).await;
		} else {
			debug!(?delay, "long task scheduling delayed promotion");
			let this = self.clone();
			tokio::spawn(async move {
				tokio::time::sleep(delay).await;
				this.promote(generation, PRIORITY_LONG_TASK_START).await;
			});
		}
	}

	/// Runs `body` with the task started, stopping automatically (any
	/// exit: return, early error, or panic) when `body` completes. The
	/// scoped form of [`start`](Self::start).
	pub async fn start_scoped<F, Fut, T>(self: &Arc<Self>, delay: Option<Duration>, body: F) -> T
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = T>,
	{
		self.start(delay).await;
		let guard = StopOnExit { task: Some(self.clone()) };
		let result = body().await;
		guard.disarm_and_stop().await;
		result
	}

	/// Demotes (if `promoted`) or cancels (if `pending`) the task. A no-op
	/// if `idle`. `force` skips re-acquiring a connection token on
	/// demotion — the caller asserts the connection is terminal.
	pub async fn stop(self: &Arc<Self>, force: bool) {
		let long_task_token = {
			let mut inner = self.inner.lock().unwrap();
			match inner.state {
				State::Idle => return,
				State::Pending => {
					// Clears the flag the in-flight promotion checks on
					// wake; does not touch the pools directly.
					inner.generation += 1;
					inner.state = State::Idle;
					trace!("cancelled pending long task promotion");
					return;
				}
				State::Promoted => {
					inner.state = State::Idle;
					inner.long_task_token.take()
				}
			}
		};

		if let Some(mut token) = long_task_token {
			token.release();
			debug!(force, "long task demoted, long-task token released");
		}

		if !force {
			let mut connection_token = {
				let mut inner = self.inner.lock().unwrap();
				inner.connection_token.take()
			};
			if let Some(token) = connection_token.as_mut() {
				if token.reacquire(PRIORITY_DEMOTE).await.is_err() {
					trace!("connection pool torn down during demotion re-acquire");
				}
			}
			let mut inner = self.inner.lock().unwrap();
			inner.connection_token = connection_token;
		}
	}

	/// The acquire protocol shared by the immediate and delayed-start
	/// paths (spec §4.3's "Acquire protocol"). Runs the long-task pool
	/// acquire, then checks whether a concurrent `stop` invalidated this
	/// attempt before committing to `promoted`.
	async fn promote(self: Arc<Self>, generation: u64, priority: Priority) {
		let long_task_token = self.long_task_pool.acquire(priority).await;

		let mut inner = self.inner.lock().unwrap();
		if inner.generation != generation {
			// A `stop` raced this acquire and won: release what we just
			// acquired instead of leaking it. "Promote briefly then
			// demote", never a leak.
			drop(inner);
			drop(long_task_token);
			trace!("promotion cancelled by a racing stop, releasing acquired long-task token");
			return;
		}

		inner.state = State::Promoted;
		inner.long_task_token = Some(long_task_token);
		if let Some(token) = inner.connection_token.as_mut() {
			token.release();
		}
		drop(inner);

		// Mandatory per spec: a persistent connection surviving slot
		// hand-off would let a later request on the same connection run
		// with no slot at all.
		self.connection.set_persistent(false);
		debug!("long task promoted");
	}
}

/// Panic-safety net for [`LongTask::start_scoped`]: if `body` unwinds
/// before calling [`disarm_and_stop`](Self::disarm_and_stop), the guard's
/// `Drop` spawns a detached `stop(force=false)` so the task's slots are
/// never leaked by an abnormal exit.
struct StopOnExit<C: Connection + 'static> {
	task: Option<Arc<LongTask<C>>>,
}

impl<C: Connection + 'static> StopOnExit<C> {
	async fn disarm_and_stop(mut self) {
		if let Some(task) = self.task.take() {
			task.stop(false).await;
		}
	}
}

impl<C: Connection> Drop for StopOnExit<C> {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			tokio::spawn(async move {
				task.stop(false).await;
			});
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicBool, Ordering};

	use super::*;

	struct MockConnection {
		token: Mutex<Option<SlotToken>>,
		persistent: AtomicBool,
	}

	impl MockConnection {
		fn new(token: Option<SlotToken>) -> Arc<Self> {
			Arc::new(Self { token: Mutex::new(token), persistent: AtomicBool::new(true) })
		}
	}

	impl Connection for MockConnection {
		fn take_connection_token(&self) -> Option<SlotToken> {
			self.token.lock().unwrap().take()
		}

		fn set_persistent(&self, persistent: bool) {
			self.persistent.store(persistent, Ordering::SeqCst);
		}
	}

	#[tokio::test]
	async fn start_then_stop_returns_connection_token() {
		let conn_pool = SlotPool::new(1);
		let long_pool = SlotPool::new(4);
		let conn_token = conn_pool.acquire(PRIORITY_ACCEPT).await;
		let conn = MockConnection::new(Some(conn_token));

		let task = LongTask::new(conn.clone(), long_pool.clone(), Duration::from_millis(50));
		task.start(Some(Duration::ZERO)).await;

		assert!(task.started());
		assert_eq!(conn_pool.snapshot().available, 1);
		assert!(!conn.persistent.load(Ordering::SeqCst));
		assert_eq!(long_pool.snapshot().available, 3);

		task.stop(false).await;
		assert!(!task.started());
		assert_eq!(conn_pool.snapshot().available, 0);
		assert_eq!(long_pool.snapshot().available, 4);
	}

	#[tokio::test]
	async fn forced_stop_does_not_reacquire_connection_token() {
		let conn_pool = SlotPool::new(1);
		let long_pool = SlotPool::new(4);
		let conn_token = conn_pool.acquire(PRIORITY_ACCEPT).await;
		let conn = MockConnection::new(Some(conn_token));

		let task = LongTask::new(conn, long_pool.clone(), Duration::from_millis(50));
		task.start(Some(Duration::ZERO)).await;
		task.stop(true).await;

		assert_eq!(conn_pool.snapshot().available, 1);
		assert_eq!(long_pool.snapshot().available, 4);
	}

	#[tokio::test]
	async fn double_stop_is_idempotent() {
		let long_pool = SlotPool::new(4);
		let conn = MockConnection::new(None);
		let task = LongTask::new(conn, long_pool.clone(), Duration::from_millis(50));
		task.start(Some(Duration::ZERO)).await;
		task.stop(false).await;
		task.stop(false).await;
		assert_eq!(long_pool.snapshot().available, 4);
	}

	#[tokio::test(start_paused = true)]
	async fn delayed_promotion_cancelled_before_acquire_never_touches_long_task_pool() {
		let long_pool = SlotPool::new(4);
		let conn = MockConnection::new(None);
		let task = LongTask::new(conn, long_pool.clone(), Duration::from_millis(100));

		task.start(None).await;
		assert!(task.started());

		// Stop well before the delay elapses: the sleeping task must see
		// the cleared generation and never acquire.
		tokio::time::sleep(Duration::from_millis(10)).await;
		task.stop(false).await;
		assert!(!task.started());

		tokio::time::advance(Duration::from_millis(200)).await;
		assert_eq!(long_pool.snapshot().available, 4);
	}

	#[tokio::test(start_paused = true)]
	async fn delayed_promotion_completes_when_not_cancelled() {
		let long_pool = SlotPool::new(4);
		let conn = MockConnection::new(None);
		let task = LongTask::new(conn, long_pool.clone(), Duration::from_millis(100));

		task.start(None).await;
		tokio::time::advance(Duration::from_millis(150)).await;
		// Yield so the spawned promotion task observes the advanced clock.
		tokio::task::yield_now().await;

		assert!(task.started());
		assert_eq!(long_pool.snapshot().available, 3);
	}

	#[tokio::test]
	async fn start_scoped_stops_on_block_exit() {
		let long_pool = SlotPool::new(4);
		let conn = MockConnection::new(None);
		let task = LongTask::new(conn, long_pool.clone(), Duration::from_millis(50));

		let value = task.start_scoped(Some(Duration::ZERO), || async { 42 }).await;
		assert_eq!(value, 42);
		assert!(!task.started());
		assert_eq!(long_pool.snapshot().available, 4);
	}

	#[tokio::test]
	async fn start_is_a_noop_when_already_started() {
		let long_pool = SlotPool::new(4);
		let conn = MockConnection::new(None);
		let task = LongTask::new(conn, long_pool.clone(), Duration::from_millis(50));

		task.start(Some(Duration::ZERO)).await;
		task.start(Some(Duration::ZERO)).await;
		assert_eq!(long_pool.snapshot().available, 3);
	}
}
