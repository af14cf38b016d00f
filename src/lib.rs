//! Single-threaded cooperative event multiplexing, non-blocking streams,
//! subprocess spawning, and a pipelined PostgreSQL client.
//!
//! ## Usage
//!
//! ```no_run
//! use loomio::reactor::Reactor;
//! use loomio::stream;
//!
//! let reactor = Reactor::new().unwrap();
//! reactor.block_on(async {
//!     let listener = stream::tcp_listen("127.0.0.1:0", 16).unwrap();
//!     let addr = listener.local_addr().unwrap();
//!     println!("listening on {addr}");
//! });
//! ```
//!
//! `eventq` is the low-level demultiplexer (fd readiness, signals, child
//! exit, timers); `reactor` is the cooperative executor built on top of
//! it; `stream` is the buffered non-blocking byte-stream handle; `subproc`
//! spawns child processes with IPC-verified `exec`; `pg` is the pipelined,
//! non-blocking PostgreSQL client.

#[macro_use]
extern crate log;

#[macro_use]
mod macros;

mod sys;

pub mod config;
pub mod error;
pub mod eventq;
pub mod pg;
pub mod reactor;
pub mod stream;
pub mod subproc;

pub use config::Config;
pub use error::{Error, Result};
