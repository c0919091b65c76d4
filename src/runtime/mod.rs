//! Readiness-polling runtime for the echo server.
//!
//! - `listener`: hostname resolution and listening-socket acquisition
//! - `connection`: slab-backed registry of sockets under monitoring
//! - `event_loop`: the single-threaded multiplexing core
//! - `echo`: per-readiness-event read-and-reply handling

pub mod connection;
pub mod echo;
pub mod event_loop;
pub mod listener;

pub use event_loop::{EventLoop, ShutdownHandle};
pub use listener::acquire;
