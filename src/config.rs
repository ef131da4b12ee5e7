//! Pool configuration, injected at service construction. Loading this from
//! argv/env/a config file is a service-level concern and out of scope for
//! this crate; see `SPEC_FULL.md` §2.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AdmissionError;

/// Capacity and timing knobs for a connection/long-task admission
/// controller instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
	pub maximum_connections: usize,
	pub maximum_long_tasks: usize,
	#[serde(with = "duration_as_millis")]
	pub start_delay: Duration,
}

impl PoolConfig {
	pub const DEFAULT_MAXIMUM_CONNECTIONS: usize = 1;
	pub const DEFAULT_MAXIMUM_LONG_TASKS: usize = 10;
	pub const DEFAULT_START_DELAY: Duration = Duration::from_millis(100);

	/// Builds a config, validating `maximum_connections >= 1`.
	///
	/// `maximum_long_tasks` has no lower bound beyond `0`: a value of `0`
	/// is the specified way to disable long-task support entirely (the
	/// request interceptor becomes a transparent pass-through).
	///
	/// # Errors
	/// Returns [`AdmissionError::InvalidConfig`] if `maximum_connections == 0`.
	pub fn new(maximum_connections: usize, maximum_long_tasks: usize) -> Result<Self, AdmissionError> {
		if maximum_connections == 0 {
			return Err(AdmissionError::InvalidConfig("maximum_connections must be at least 1".to_string()));
		}
		Ok(Self {
			maximum_connections,
			maximum_long_tasks,
			start_delay: Self::DEFAULT_START_DELAY,
		})
	}

	#[must_use]
	pub fn with_start_delay(mut self, start_delay: Duration) -> Self {
		self.start_delay = start_delay;
		self
	}

	/// `true` when long-task support is disabled (`maximum_long_tasks == 0`).
	#[must_use]
	pub fn long_tasks_disabled(&self) -> bool {
		self.maximum_long_tasks == 0
	}
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self::new(Self::DEFAULT_MAXIMUM_CONNECTIONS, Self::DEFAULT_MAXIMUM_LONG_TASKS).expect("default config is always valid")
	}
}

mod duration_as_millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		#[allow(clippy::cast_possible_truncation)]
		serializer.serialize_u64(duration.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let millis = u64::deserialize(deserializer)?;
		Ok(Duration::from_millis(millis))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_matches_spec_defaults() {
		let config = PoolConfig::default();
		assert_eq!(config.maximum_connections, 1);
		assert_eq!(config.maximum_long_tasks, 10);
		assert_eq!(config.start_delay, Duration::from_millis(100));
	}

	#[test]
	fn zero_connections_is_rejected() {
		assert!(matches!(PoolConfig::new(0, 10), Err(AdmissionError::InvalidConfig(_))));
	}

	#[test]
	fn zero_long_tasks_is_allowed_and_flagged() {
		let config = PoolConfig::new(1, 0).unwrap();
		assert!(config.long_tasks_disabled());
	}

	#[test]
	fn round_trips_through_json() {
		let config = PoolConfig::new(4, 20).unwrap().with_start_delay(Duration::from_millis(250));
		let json = serde_json::to_string(&config).unwrap();
		let back: PoolConfig = serde_json::from_str(&json).unwrap();
		assert_eq!(config, back);
	}
}
