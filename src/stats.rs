//! Read-only observability surface (spec §4.5). Taking a snapshot never
//! mutates pool state.

use serde::{Deserialize, Serialize};

use crate::pool::{PoolSnapshot, SlotPool};

/// Combined occupancy of both pools at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
	pub connection_pool: PoolSnapshot,
	pub long_task_pool: PoolSnapshot,
}

impl Statistics {
	/// Takes the `statistics()` snapshot of spec §4.5/§6: occupancy of
	/// both pools at the moment of the call, with no effect on either.
	#[must_use]
	pub fn new(connection_pool: &SlotPool, long_task_pool: &SlotPool) -> Self {
		Self { connection_pool: connection_pool.snapshot(), long_task_pool: long_task_pool.snapshot() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn statistics_reflect_pool_occupancy() {
		let connections = SlotPool::new(2);
		let long_tasks = SlotPool::new(5);
		let _held = connections.acquire(0).await;

		let stats = Statistics::new(&connections, &long_tasks);

		assert_eq!(stats.connection_pool.available, 1);
		assert_eq!(stats.long_task_pool.available, 5);

		let json = serde_json::to_string(&stats).unwrap();
		let back: Statistics = serde_json::from_str(&json).unwrap();
		assert_eq!(stats, back);
	}
}
