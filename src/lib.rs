//! A concurrency-admission controller for request-driven async servers
//! that mix CPU-bound and I/O-bound work on a fixed pool of execution
//! slots.
//!
//! Three resources coordinate:
//! - a small connection-admission pool gating inbound accepts
//! ([`accept::AcceptGate`]),
//! - a larger long-task pool gating concurrently promoted requests
//! ([`long_task::LongTask`]),
//! - and a per-request promotion state machine bridging the two.
//!
//! An application promotes a request it knows is about to block on I/O via
//! [`long_task::LongTask::start`], handing its connection slot back to the
//! accept path for the duration and counting instead against the larger
//! long-task pool. [`interceptor::RequestInterceptor`] wires the state
//! machine into a request lifecycle; [`current::current`] lets handler
//! code reach its own long task without it being threaded through
//! arguments.
//!
//! Out of scope: transport/TLS/HTTP framing, response body streaming
//! itself, process supervision, and the application handler.

pub mod accept;
pub mod config;
pub mod connection;
pub mod current;
pub mod error;
pub mod interceptor;
pub mod long_task;
pub mod pool;
pub mod stats;

pub use accept::{AcceptGate, AcceptedSocket, Listener};
pub use config::PoolConfig;
pub use connection::{Connection, Request};
pub use current::{current, with_current, LongTaskHandle};
pub use error::AdmissionError;
pub use interceptor::{BodyCompletionGuard, RequestInterceptor};
pub use long_task::{LongTask, PRIORITY_ACCEPT, PRIORITY_DEMOTE, PRIORITY_LONG_TASK_START};
pub use pool::{PoolSnapshot, Priority, SlotPool, SlotToken};
pub use stats::Statistics;
