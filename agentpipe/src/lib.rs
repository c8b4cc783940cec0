//! Buffered, non-blocking byte-stream pipes for single-threaded agents.
//!
//! An [`Endpoint`] moves raw bytes between a pair of queues and a local
//! transport (a Unix socket, or any adopted descriptor) without ever
//! blocking in steady state. Each direction is driven by a small state
//! machine that issues a non-blocking transfer, reports a wait handle while
//! the transfer is outstanding, and completes it on a later tick.
//! An [`EventLoop`] services a set of endpoints and sleeps in `poll(2)` on
//! the union of their wait handles.
//!
//! # Quick start
//!
//! ```no_run
//! use agentpipe::{Endpoint, WaitSet};
//!
//! let mut pipe = Endpoint::new();
//! pipe.connect_as_initiator("/tmp/agent.sock")?;
//! pipe.write(b"hello");
//!
//! let mut waits = WaitSet::new();
//! while pipe.bytes_to_send() > 0 && !pipe.is_closed() {
//!     waits.clear();
//!     if !pipe.service(&mut waits) {
//!         waits.wait(None)?;
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! There is no framing: higher layers own any protocol on top of the bytes.

mod config;
#[cfg(unix)]
mod endpoint;
mod error;
#[cfg(unix)]
mod event_loop;
#[cfg(unix)]
mod transport;
#[cfg(unix)]
mod worker;

pub use config::{
    DEFAULT_ACCEPT_TIMEOUT, DEFAULT_IO_SIZE, DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_TIMEOUT,
    PipeConfig,
};
#[cfg(unix)]
pub use endpoint::Endpoint;
pub use error::{Error, Result};
#[cfg(unix)]
pub use event_loop::{EventLoop, Handler, PipeId, WaitSet};
#[cfg(unix)]
pub use transport::{Direction, Interest, WaitHandle};
