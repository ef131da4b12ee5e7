//! Per-execution-context current-long-task storage (spec §4.3's
//! `current()`/`current=` and §9's "per-task slot, not a process-global").
//!
//! Backed by `tokio::task_local!`, whose `scope` future already provides
//! exactly the save-on-enter/restore-on-exit stack discipline spec §9
//! requires for nested `with` calls — no manual stack needed.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::long_task::LongTask;

/// Object-safe handle to a `LongTask<C>`, erasing the connection type so a
/// single task-local slot can hold any request's long task.
#[async_trait]
pub trait LongTaskHandle: Send + Sync {
	async fn start(&self, delay: Option<std::time::Duration>);
	async fn stop(&self, force: bool);
	fn started(&self) -> bool;
}

#[async_trait]
impl<C: Connection + 'static> LongTaskHandle for Arc<LongTask<C>> {
	async fn start(&self, delay: Option<std::time::Duration>) {
		LongTask::start(self, delay).await;
	}

	async fn stop(&self, force: bool) {
		LongTask::stop(self, force).await;
	}

	fn started(&self) -> bool {
		LongTask::started(self)
	}
}

tokio::task_local! {
	static CURRENT_LONG_TASK: Arc<dyn LongTaskHandle>;
}

/// Installs `task` as the current long task for the duration of `f`,
/// restoring whatever was current before on exit (including panics).
/// Nested calls from within `f` see `task` as current; once `f` returns,
/// the caller's own surrounding scope (if any) is current again.
pub async fn with_current<C, F, Fut, T>(task: &Arc<LongTask<C>>, f: F) -> T
where
	C: Connection + 'static,
	F: FnOnce() -> Fut,
	Fut: Future<Output = T>,
{
	let handle: Arc<dyn LongTaskHandle> = Arc::new(task.clone());
	CURRENT_LONG_TASK.scope(handle, f()).await
}

/// The long task bound to the calling execution context, if any. `None`
/// outside of a `with_current` scope (e.g. long tasks disabled, or called
/// from a context the interceptor never wrapped).
#[must_use]
pub fn current() -> Option<Arc<dyn LongTaskHandle>> {
	CURRENT_LONG_TASK.try_with(Clone::clone).ok()
}
