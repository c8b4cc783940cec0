//! Single-threaded event loop over pipe endpoints.
//!
//! Each tick services every endpoint once. If anything happened the
//! handler runs and the loop ticks again right away; otherwise it blocks in
//! `poll(2)` on the wait handles the endpoints reported, bounded by the
//! optional poll interval.

use std::io;
use std::time::{Duration, Instant};

use crate::endpoint::Endpoint;
use crate::error::fatal;
use crate::transport::{self, WaitHandle};

/// Wait handles collected during one tick.
#[derive(Debug, Default, Clone)]
pub struct WaitSet {
    /// Handles of outstanding operations.
    handles: Vec<WaitHandle>,
}

impl WaitSet {
    /// Creates an empty set.
    pub const fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Adds a handle.
    pub fn push(&mut self, handle: WaitHandle) {
        self.handles.push(handle);
    }

    /// Removes every handle.
    pub fn clear(&mut self) {
        self.handles.clear();
    }

    /// Number of handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the set holds no handles.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Iterates over the handles.
    pub fn iter(&self) -> impl Iterator<Item = &WaitHandle> {
        self.handles.iter()
    }

    /// Blocks until any handle is signaled or `timeout` elapses.
    ///
    /// Returns the number of signaled handles (zero on timeout). An empty
    /// set sleeps for `timeout`; an empty set without a timeout could never
    /// wake and is rejected.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<usize> {
        if self.handles.is_empty() {
            let Some(timeout) = timeout else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "nothing to wait on",
                ));
            };
            std::thread::sleep(timeout);
            return Ok(0);
        }
        let mut fds: Vec<libc::pollfd> = self.handles.iter().map(WaitHandle::pollfd).collect();
        transport::poll(&mut fds, timeout)
    }
}

impl Extend<WaitHandle> for WaitSet {
    fn extend<I: IntoIterator<Item = WaitHandle>>(&mut self, iter: I) {
        self.handles.extend(iter);
    }
}

/// Index of an endpoint registered with an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(usize);

/// Callbacks driven by [`EventLoop::run`].
pub trait Handler {
    /// Called after a tick in which pipe `id` moved bytes or failed.
    fn on_pipe_io(&mut self, lp: &mut EventLoop, id: PipeId);

    /// Called when the poll interval elapses.
    fn on_poll_timeout(&mut self, lp: &mut EventLoop) {
        let _ = lp;
    }
}

/// Owns the endpoints and drives them until [`shutdown`](Self::shutdown).
#[derive(Debug, Default)]
pub struct EventLoop {
    /// Registered endpoints; removed slots stay `None` so ids are stable.
    pipes: Vec<Option<Endpoint>>,
    /// Wake-up period for [`Handler::on_poll_timeout`].
    poll_interval: Option<Duration>,
    /// Set by [`shutdown`](Self::shutdown).
    exiting: bool,
}

impl EventLoop {
    /// Creates a loop with no endpoints and no poll interval.
    pub const fn new() -> Self {
        Self {
            pipes: Vec::new(),
            poll_interval: None,
            exiting: false,
        }
    }

    /// Sets the period after which [`Handler::on_poll_timeout`] runs even
    /// if no I/O happened.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Registers an endpoint.
    pub fn add(&mut self, pipe: Endpoint) -> PipeId {
        self.pipes.push(Some(pipe));
        PipeId(self.pipes.len() - 1)
    }

    /// Unregisters an endpoint and hands it back.
    pub fn remove(&mut self, id: PipeId) -> Option<Endpoint> {
        self.pipes.get_mut(id.0).and_then(Option::take)
    }

    /// Borrows a registered endpoint.
    pub fn get(&self, id: PipeId) -> Option<&Endpoint> {
        self.pipes.get(id.0).and_then(Option::as_ref)
    }

    /// Mutably borrows a registered endpoint.
    pub fn get_mut(&mut self, id: PipeId) -> Option<&mut Endpoint> {
        self.pipes.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Makes [`run`](Self::run) return after the current tick.
    pub fn shutdown(&mut self) {
        self.exiting = true;
    }

    /// Whether [`shutdown`](Self::shutdown) was requested.
    pub const fn is_exiting(&self) -> bool {
        self.exiting
    }

    /// Runs until the handler calls [`shutdown`](Self::shutdown).
    ///
    /// Only `poll(2)` failures are returned. Having nothing to wait on and
    /// no poll interval is fatal: the loop could never wake up again.
    pub fn run<H: Handler>(&mut self, handler: &mut H) -> io::Result<()> {
        let mut waits = WaitSet::new();
        let mut last_timeout = Instant::now();
        while !self.exiting {
            waits.clear();
            let mut did_something = false;

            let mut idx = 0;
            while idx < self.pipes.len() {
                let moved = self.pipes[idx]
                    .as_mut()
                    .is_some_and(|pipe| pipe.service(&mut waits));
                if moved {
                    handler.on_pipe_io(self, PipeId(idx));
                    did_something = true;
                }
                idx += 1;
            }

            if let Some(interval) = self.poll_interval
                && last_timeout.elapsed() >= interval
            {
                handler.on_poll_timeout(self);
                last_timeout = Instant::now();
                did_something = true;
            }

            if did_something || self.exiting {
                continue;
            }

            let timeout = self
                .poll_interval
                .map(|interval| interval.saturating_sub(last_timeout.elapsed()));
            if waits.is_empty() && timeout.is_none() {
                fatal!("event loop has no outstanding I/O and no poll interval");
            }
            tracing::trace!(handles = waits.len(), ?timeout, "waiting");
            waits.wait(timeout)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::{Direction, PipeConfig};

    /// Echoes everything the server receives and collects what comes back
    /// to the client; stops once `expected` bytes returned.
    struct Echo {
        server: PipeId,
        client: PipeId,
        expected: usize,
        received: Vec<u8>,
        calls: usize,
    }

    impl Handler for Echo {
        fn on_pipe_io(&mut self, lp: &mut EventLoop, _id: PipeId) {
            self.calls += 1;
            let server = lp.get_mut(self.server).unwrap();
            let data = server.read_all();
            server.write(&data);
            let client = lp.get_mut(self.client).unwrap();
            self.received.extend_from_slice(&client.read_all());
            if self.received.len() >= self.expected {
                lp.shutdown();
            }
        }
    }

    #[test]
    fn echo_between_two_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");

        let mut server = Endpoint::with_config(PipeConfig::new().io_size(1024));
        server.bind(&path).unwrap();
        let mut client = Endpoint::new();
        client.connect_as_initiator(&path).unwrap();
        server.connect_as_acceptor();

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 199) as u8).collect();
        client.write(&payload);

        let mut lp = EventLoop::new();
        let server = lp.add(server);
        let client = lp.add(client);
        let mut echo = Echo {
            server,
            client,
            expected: payload.len(),
            received: Vec::new(),
            calls: 0,
        };
        lp.run(&mut echo).unwrap();

        assert!(echo.calls > 0);
        assert_eq!(echo.received, payload);
        assert_eq!(lp.get(client).unwrap().bytes_to_send(), 0);
    }

    /// Counts poll timeouts and stops after `limit`.
    struct Ticker {
        timeouts: usize,
        limit: usize,
    }

    impl Handler for Ticker {
        fn on_pipe_io(&mut self, _lp: &mut EventLoop, _id: PipeId) {}

        fn on_poll_timeout(&mut self, lp: &mut EventLoop) {
            self.timeouts += 1;
            if self.timeouts == self.limit {
                lp.shutdown();
            }
        }
    }

    #[test]
    fn poll_interval_fires_without_io() {
        let mut lp = EventLoop::new().with_poll_interval(Duration::from_millis(5));
        let mut ticker = Ticker {
            timeouts: 0,
            limit: 3,
        };
        let start = Instant::now();
        lp.run(&mut ticker).unwrap();
        assert_eq!(ticker.timeouts, 3);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn wait_set_wakes_on_readable_pipe() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let mut pipe = Endpoint::new();
        pipe.adopt(OwnedFd::from(ours), Direction::Read, "conin").unwrap();

        let mut waits = WaitSet::new();
        assert!(!pipe.service(&mut waits));
        assert_eq!(waits.len(), 1);
        assert_eq!(waits.wait(Some(Duration::ZERO)).unwrap(), 0);

        theirs.write_all(b"wake").unwrap();
        assert_eq!(waits.wait(Some(Duration::from_secs(5))).unwrap(), 1);
        waits.clear();
        assert!(pipe.service(&mut waits));
        assert_eq!(&pipe.read_all()[..], b"wake");
    }

    #[test]
    fn empty_wait_set_needs_a_timeout() {
        let waits = WaitSet::new();
        assert!(waits.wait(None).is_err());
        assert_eq!(waits.wait(Some(Duration::from_millis(1))).unwrap(), 0);
    }

    #[test]
    fn removed_pipes_keep_other_ids_stable() {
        let mut lp = EventLoop::new();
        let a = lp.add(Endpoint::new());
        let b = lp.add(Endpoint::new());
        assert!(lp.remove(a).is_some());
        assert!(lp.remove(a).is_none());
        assert!(lp.get(a).is_none());
        assert!(lp.get(b).is_some());
    }
}
