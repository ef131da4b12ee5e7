//! The transport-facing trait surface. The transport itself (TLS, HTTP
//! framing, body streaming) is out of scope; these traits are the seam a
//! real transport implements to plug into the admission controller.

use std::sync::Arc;

use crate::pool::SlotToken;

/// A connection as seen by the core: something that may expose a borrowed
/// connection-pool token and a `persistent` flag.
///
/// Both accessors are best-effort. A connection with no token (e.g. one
/// never routed through an [`AcceptGate`](crate::accept::AcceptGate)) and a
/// connection that does not support `persistent` are equally valid; the
/// default `set_persistent` body is a silent no-op so implementers who
/// don't support connection reuse don't need to do anything at all.
pub trait Connection: Send + Sync {
	/// Takes the connection's pool token, if it has one, leaving `None` in
	/// its place. Used once, at long-task construction.
	fn take_connection_token(&self) -> Option<SlotToken>;

	/// Sets whether the server may reuse this connection for subsequent
	/// requests. Forced to `false` on promotion; ignored by connections
	/// that don't support reuse.
	fn set_persistent(&self, _persistent: bool) {}
}

/// A request as seen by the core: it carries a reference to its connection
/// and nothing else — the core never inspects headers or bodies.
///
/// `connection` returns an owned `Arc` rather than a borrow: a `LongTask`
/// may outlive the request's own stack frame (the delayed-start task is
/// spawned independently), so it needs shared ownership of the connection,
/// not a borrow tied to the request's lifetime.
pub trait Request: Send + Sync {
	type Conn: Connection;

	fn connection(&self) -> Arc<Self::Conn>;
}
