use thiserror::Error;

/// Errors surfaced by this crate's own API. Per spec, most "failure modes"
/// are not errors at all: a pool timeout is `Option::None`, a missing
/// connection token or `persistent` flag is silent local recovery, and a
/// handler exception propagates unchanged. `AdmissionError` exists only
/// for the handful of cases that are genuinely exceptional.
#[derive(Debug, Error)]
pub enum AdmissionError {
	#[error("invalid pool configuration: {0}")]
	InvalidConfig(String),

	#[error("slot pool waiter was dropped before a token could be delivered")]
	WaiterDropped,
}
