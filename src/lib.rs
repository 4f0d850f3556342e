//! termhub - shared terminal sessions over HTTP/WebSocket.
//!
//! One long-lived shell per session runs behind a pseudo-terminal; any
//! number of clients can attach, watch, and type concurrently. Each session
//! has exactly one broadcast reader draining the PTY, a byte-capped replay
//! buffer so late joiners catch up, independent bounded subscriber channels
//! (slow clients drop, never block), and a write lock serializing input.
//!
//! The engine ([`session::SessionRegistry`]) is transport-agnostic; the
//! [`api`] module exposes it over axum REST + WebSocket.

pub mod api;
pub mod buffer;
pub mod config;
pub mod fanout;
pub mod pty;
pub mod session;
pub mod workspace;
