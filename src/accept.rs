//! The accept gate (spec §4.2): a front-door wrapper around a listener that
//! blocks accepts until a connection-pool token is available, and binds the
//! token's lifetime to the accepted socket.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::long_task::PRIORITY_ACCEPT;
use crate::pool::SlotPool;
use crate::pool::SlotToken;

/// The transport-level listener the accept gate drives. Implementations
/// own the real socket/epoll machinery; this crate only needs readiness
/// and a non-blocking accept.
#[async_trait]
pub trait Listener: Send + Sync {
	type Socket: Send + Sync;
	type Addr: Send;

	/// Waits until the listener has a connection ready to accept.
	async fn readable(&self);

	/// Attempts to accept without blocking. Implementations signal "no
	/// connection ready right now" with `io::ErrorKind::WouldBlock`.
	fn accept_non_blocking(&self) -> io::Result<(Self::Socket, Self::Addr)>;
}

/// The transport's native socket plus an owned connection-pool token.
///
/// `close` (via `Drop`, or called explicitly) releases the token exactly
/// once. If the token has already been extracted by a promoted long task,
/// close is a no-op — releasing an already-released token is idempotent by
/// construction (see [`SlotToken::release`]).
///
/// Unrecognised operations on the underlying socket are reached through
/// `Deref`/`DerefMut` rather than runtime-reflective dispatch — the
/// statically typed equivalent of spec.md §9's delegation note.
pub struct AcceptedSocket<S> {
	socket: S,
	token: Mutex<Option<SlotToken>>,
	persistent: std::sync::atomic::AtomicBool,
}

impl<S> AcceptedSocket<S> {
	pub fn new(socket: S, token: SlotToken) -> Self {
		Self {
			socket,
			token: Mutex::new(Some(token)),
			persistent: std::sync::atomic::AtomicBool::new(true),
		}
	}

	/// Releases the connection-pool token, if still held. Safe to call
	/// more than once or after the token has been extracted for promotion.
	pub fn close(&self) {
		if let Some(mut token) = self.token.lock().unwrap().take() {
			token.release();
			trace!("accepted socket closed, connection token released");
		}
	}

	#[must_use]
	pub fn persistent(&self) -> bool {
		self.persistent.load(std::sync::atomic::Ordering::SeqCst)
	}

	#[must_use]
	pub fn into_inner(self) -> S {
		self.socket
	}
}

impl<S> Deref for AcceptedSocket<S> {
	type Target = S;
	fn deref(&self) -> &S {
		&self.socket
	}
}

impl<S> DerefMut for AcceptedSocket<S> {
	fn deref_mut(&mut self) -> &mut S {
		&mut self.socket
	}
}

impl<S: Send + Sync> Connection for AcceptedSocket<S> {
	fn take_connection_token(&self) -> Option<SlotToken> {
		self.token.lock().unwrap().take()
	}

	fn set_persistent(&self, persistent: bool) {
		self.persistent.store(persistent, std::sync::atomic::Ordering::SeqCst);
	}
}

impl<S> Drop for AcceptedSocket<S> {
	fn drop(&mut self) {
		self.close();
	}
}

/// Wraps a [`Listener`], gating every accept on the connection-admission
/// pool.
pub struct AcceptGate<L: Listener> {
	listener: L,
	pool: SlotPool,
}

impl<L: Listener> AcceptGate<L> {
	pub fn new(listener: L, pool: SlotPool) -> Self {
		Self { listener, pool }
	}

	#[must_use]
	pub fn pool(&self) -> &SlotPool {
		&self.pool
	}

	/// Blocks until both a connection-pool token is acquired and a
	/// transport-level accept succeeds.
	///
	/// Holding the token across a *failed* non-blocking accept would
	/// deadlock the pool under thundering-herd listener wakeups, so a
	/// `WouldBlock` releases the token before the next iteration.
	pub async fn accept(&self) -> io::Result<(AcceptedSocket<L::Socket>, L::Addr)> {
		loop {
			self.listener.readable().await;
			let token = self.pool.acquire(PRIORITY_ACCEPT).await;

			match self.listener.accept_non_blocking() {
				Ok((socket, peer)) => {
					debug!("accepted connection, connection token bound");
					return Ok((AcceptedSocket::new(socket, token), peer));
				}
				Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
					drop(token);
					trace!("accept raced a thundering herd wakeup, released token and retrying");
					continue;
				}
				Err(err) => {
					drop(token);
					return Err(err);
				}
			}
		}
	}
}
