//! Per-request lifecycle glue (spec §4.4): constructs a `LongTask` for each
//! inbound request, runs the handler with it installed as current, and
//! guarantees a terminal `stop(force=true)` on every exit path.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_core::Stream;

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::current;
use crate::long_task::LongTask;
use crate::pool::SlotPool;

/// Wraps request handling with long-task lifecycle management. Constructed
/// once per service and shared across requests.
pub struct RequestInterceptor {
	long_task_pool: SlotPool,
	start_delay: std::time::Duration,
	enabled: bool,
}

impl RequestInterceptor {
	#[must_use]
	pub fn new(config: &PoolConfig, long_task_pool: SlotPool) -> Self {
		Self { long_task_pool, start_delay: config.start_delay, enabled: !config.long_tasks_disabled() }
	}

	/// Runs `handler` for one request (spec §4.4 steps 1–2, 4).
	///
	/// If long tasks are disabled, `handler` runs unwrapped and this
	/// returns `None` for the task half of the result — there is no
	/// current task and no completion bookkeeping to do.
	///
	/// On `Ok`, the caller receives the long task alongside the response
	/// if it was started; wrap the response body in
	/// [`BodyCompletionGuard`] bound to that task to satisfy step 3. On
	/// `Err`, or if `handler` panics, `stop(force=true)` has already run
	/// by the time this returns (or by the time the panic finishes
	/// unwinding) and the error/panic propagates unchanged.
	pub async fn intercept<C, H, Fut, T, E>(&self, connection: Arc<C>, handler: H) -> Result<(T, Option<Arc<LongTask<C>>>), E>
	where
		C: Connection + 'static,
		H: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		if !self.enabled {
			return handler().await.map(|value| (value, None));
		}

		let task = LongTask::new(connection, self.long_task_pool.clone(), self.start_delay);
		let guard = TerminalStopGuard::new(task.clone());

		let result = current::with_current(&task, handler).await;
		guard.disarm();

		match result {
			Ok(value) => {
				let handle = if task.started() { Some(task) } else { None };
				Ok((value, handle))
			}
			Err(err) => {
				task.stop(true).await;
				Err(err)
			}
		}
	}
}

/// Catches a handler panic and runs `stop(force=true)` on unwind. Disarmed
/// once the handler has returned normally (`Ok` or `Err`); from that point
/// the `Err` branch or the body-completion guard owns the terminal stop.
struct TerminalStopGuard<C: Connection + 'static> {
	task: Option<Arc<LongTask<C>>>,
}

impl<C: Connection + 'static> TerminalStopGuard<C> {
	fn new(task: Arc<LongTask<C>>) -> Self {
		Self { task: Some(task) }
	}

	fn disarm(mut self) {
		self.task = None;
	}
}

impl<C: Connection> Drop for TerminalStopGuard<C> {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			tokio::spawn(async move {
				task.stop(true).await;
			});
		}
	}
}

/// Wraps a response body stream, running `stop(force=true)` exactly once
/// when the body closes — normal completion, abort, or error all route
/// through `Drop`, which is Rust's "invoked exactly once" primitive.
///
/// Requires `S: Unpin`: response bodies crossing this boundary are
/// typically already boxed/pinned by the transport, so this avoids pulling
/// in a pin-projection dependency for a pass-through wrapper.
pub struct BodyCompletionGuard<S, C: Connection + 'static> {
	inner: S,
	task: Mutex<Option<Arc<LongTask<C>>>>,
}

impl<S, C: Connection + 'static> BodyCompletionGuard<S, C> {
	pub fn new(inner: S, task: Arc<LongTask<C>>) -> Self {
		Self { inner, task: Mutex::new(Some(task)) }
	}

	fn finish(&mut self) {
		if let Some(task) = self.task.lock().unwrap().take() {
			tokio::spawn(async move {
				task.stop(true).await;
			});
		}
	}
}

impl<S: Stream + Unpin, C: Connection + 'static> Stream for BodyCompletionGuard<S, C> {
	type Item = S::Item;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let poll = Pin::new(&mut self.inner).poll_next(cx);
		if matches!(poll, Poll::Ready(None)) {
			self.finish();
		}
		poll
	}
}

impl<S, C: Connection + 'static> Drop for BodyCompletionGuard<S, C> {
	fn drop(&mut self) {
		self.finish();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;
	use std::time::Duration;

	use futures_core::Stream;

	use super::*;
	use crate::config::PoolConfig;
	use crate::pool::{SlotPool, SlotToken};

	struct MockConnection {
		token: Mutex<Option<SlotToken>>,
	}

	impl Connection for MockConnection {
		fn take_connection_token(&self) -> Option<SlotToken> {
			self.token.lock().unwrap().take()
		}
	}

	struct EmptyBody;

	impl Stream for EmptyBody {
		type Item = ();

		fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<()>> {
			Poll::Ready(None)
		}
	}

	#[tokio::test]
	async fn disabled_interceptor_passes_through() {
		let config = PoolConfig::new(1, 0).unwrap();
		let interceptor = RequestInterceptor::new(&config, SlotPool::new(0));
		let conn = Arc::new(MockConnection { token: Mutex::new(None) });

		let (value, task): (_, Option<Arc<LongTask<MockConnection>>>) =
			interceptor.intercept(conn, || async { Ok::<_, ()>(7) }).await.unwrap();
		assert_eq!(value, 7);
		assert!(task.is_none());
	}

	#[tokio::test]
	async fn handler_error_runs_forced_stop_and_propagates() {
		let config = PoolConfig::new(1, 4).unwrap();
		let conn_pool = SlotPool::new(1);
		let conn_token = conn_pool.acquire(0).await;
		let conn = Arc::new(MockConnection { token: Mutex::new(Some(conn_token)) });
		let interceptor = RequestInterceptor::new(&config, SlotPool::new(4));

		let result: Result<((), _), &str> = interceptor
			.intercept(conn, || async {
				current::current().unwrap().start(Some(Duration::ZERO)).await;
				Err("handler failed")
			})
			.await;

		assert_eq!(result.unwrap_err(), "handler failed");
		// force=true: the connection token was never re-acquired.
		assert_eq!(conn_pool.snapshot().available, 0);
	}

	#[tokio::test]
	async fn body_completion_guard_stops_on_stream_exhaustion() {
		let long_pool = SlotPool::new(4);
		let conn = Arc::new(MockConnection { token: Mutex::new(None) });
		let task = LongTask::new(conn, long_pool.clone(), Duration::from_millis(50));
		task.start(Some(Duration::ZERO)).await;
		assert_eq!(long_pool.snapshot().available, 3);

		let mut body = BodyCompletionGuard::new(EmptyBody, task.clone());
		let next = Pin::new(&mut body).poll_next(&mut Context::from_waker(&futures_noop_waker()));
		assert!(matches!(next, Poll::Ready(None)));

		// The stop was spawned; yield so it can run before asserting.
		tokio::task::yield_now().await;
		tokio::task::yield_now().await;
		assert_eq!(long_pool.snapshot().available, 4);
	}

	fn futures_noop_waker() -> std::task::Waker {
		use std::task::{RawWaker, RawWakerVTable, Waker};
		fn no_op(_: *const ()) {}
		fn clone(_: *const ()) -> RawWaker {
			RawWaker::new(std::ptr::null(), &VTABLE)
		}
		static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
		unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
	}
}
