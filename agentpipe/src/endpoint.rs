//! Buffered, non-blocking pipe endpoint.
//!
//! An [`Endpoint`] owns an input queue, an output queue, and, while
//! connected, a transport with a [`Reader`] and/or [`Writer`] worker.
//! Producers append with [`Endpoint::write`]; consumers drain with
//! [`Endpoint::read`]. Bytes only move inside [`Endpoint::service`], which
//! the event loop calls once per tick.

use std::fs;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::config::PipeConfig;
use crate::error::{Error, Result, fatal};
use crate::event_loop::WaitSet;
use crate::transport::{self, Direction, FdTransport};
use crate::worker::{Queues, Reader, Worker, Writer};

/// Transport plus the workers for the directions enabled at connect time.
#[derive(Debug)]
struct Connection {
    /// Connected descriptor.
    io: FdTransport,
    /// Inbound worker.
    reader: Option<Worker<Reader>>,
    /// Outbound worker.
    writer: Option<Worker<Writer>>,
}

impl Connection {
    /// Cancels in-flight operations and waits for both drains, then frees
    /// the workers before the descriptor.
    fn shutdown(self) {
        let Self {
            mut io,
            mut reader,
            mut writer,
        } = self;
        io.cancel();
        if let Some(r) = reader.as_mut() {
            r.cancel_and_drain(&mut io);
        }
        if let Some(w) = writer.as_mut() {
            w.cancel_and_drain(&mut io);
        }
        drop(reader);
        drop(writer);
        drop(io);
    }
}

/// One side of a bidirectional byte-stream pipe.
///
/// Starts disconnected. Connect with [`connect_as_initiator`],
/// [`bind`] + [`connect_as_acceptor`], or [`adopt`]; tear down with
/// [`close`] (also run on drop).
///
/// [`connect_as_initiator`]: Self::connect_as_initiator
/// [`bind`]: Self::bind
/// [`connect_as_acceptor`]: Self::connect_as_acceptor
/// [`adopt`]: Self::adopt
/// [`close`]: Self::close
#[derive(Debug)]
pub struct Endpoint {
    /// Name given at the last connect, bind or adopt.
    name: String,
    /// Present while connected.
    conn: Option<Connection>,
    /// Listening socket and its path, between [`bind`](Self::bind) and
    /// accept.
    listener: Option<(UnixListener, PathBuf)>,
    /// Input and output byte queues.
    queues: Queues,
    /// Chunk size and timeouts.
    config: PipeConfig,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint {
    /// Creates a disconnected endpoint with the default configuration.
    pub fn new() -> Self {
        Self::with_config(PipeConfig::new())
    }

    /// Creates a disconnected endpoint.
    pub fn with_config(config: PipeConfig) -> Self {
        Self {
            name: String::new(),
            conn: None,
            listener: None,
            queues: Queues::new(config.read_buffer_size),
            config,
        }
    }

    /// Name given at the last connect, bind or adopt.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connects to an existing acceptor listening at `name`.
    ///
    /// On success the endpoint is full duplex. Fails if nobody listens.
    pub fn connect_as_initiator(&mut self, name: impl AsRef<Path>) -> Result<()> {
        self.assert_disconnected("connect_as_initiator");
        let path = name.as_ref();
        let shown = path.display().to_string();
        let stream = UnixStream::connect(path).map_err(|source| Error::Connect {
            name: shown.clone(),
            source,
        })?;
        tracing::debug!(name = %shown, "connected to acceptor");
        self.name = shown;
        self.attach(OwnedFd::from(stream), true, true)
    }

    /// Creates the listening side of a named endpoint at `name`.
    ///
    /// A stale socket file left at `name` is replaced; any other kind of
    /// file there is an error. Peers may connect as soon as this returns;
    /// [`connect_as_acceptor`](Self::connect_as_acceptor) picks them up.
    pub fn bind(&mut self, name: impl AsRef<Path>) -> Result<()> {
        self.assert_disconnected("bind");
        self.unbind();
        let path = name.as_ref();
        let shown = path.display().to_string();
        if let Err(source) = remove_stale_socket(path) {
            return Err(Error::Bind { name: shown, source });
        }
        let listener = UnixListener::bind(path).map_err(|source| Error::Bind {
            name: shown.clone(),
            source,
        })?;
        tracing::debug!(name = %shown, "listening");
        self.name = shown;
        self.listener = Some((listener, path.to_path_buf()));
        Ok(())
    }

    /// Drops the listening socket, if any, and removes its file.
    fn unbind(&mut self) {
        let Some((listener, path)) = self.listener.take() else {
            return;
        };
        drop(listener);
        if let Err(e) = fs::remove_file(&path) {
            tracing::debug!(path = %path.display(), error = %e, "failed to remove socket file");
        }
    }

    /// Blocks until a peer attaches to the bound listener.
    ///
    /// A peer that connected before this call is accepted immediately.
    /// Waiting longer than the accept timeout, or any accept failure,
    /// is fatal.
    pub fn connect_as_acceptor(&mut self) {
        self.assert_disconnected("connect_as_acceptor");
        let Some((listener, _)) = self.listener.as_ref() else {
            fatal!("connect_as_acceptor on {:?} without a bound listener", self.name);
        };
        let stream = match transport::accept(listener, self.config.accept_timeout) {
            Ok(stream) => stream,
            Err(e) => fatal!("error connecting data I/O pipe {:?}: {e}", self.name),
        };
        // Single connection per name.
        self.unbind();
        tracing::debug!(name = %self.name, "accepted peer");
        if let Err(e) = self.attach(OwnedFd::from(stream), true, true) {
            fatal!("error connecting data I/O pipe {:?}: {e}", self.name);
        }
    }

    /// Wraps an already-open handle as a half-duplex endpoint.
    ///
    /// Only the worker for `direction` is created.
    pub fn adopt(
        &mut self,
        handle: OwnedFd,
        direction: Direction,
        name: impl Into<String>,
    ) -> Result<()> {
        self.assert_disconnected("adopt");
        self.name = name.into();
        tracing::debug!(name = %self.name, ?direction, "adopted handle");
        self.attach(
            handle,
            direction == Direction::Read,
            direction == Direction::Write,
        )
    }

    /// Installs a connected descriptor and the requested workers.
    fn attach(&mut self, fd: OwnedFd, read: bool, write: bool) -> Result<()> {
        let io = FdTransport::new(fd)?;
        let io_size = self.config.io_size;
        self.conn = Some(Connection {
            io,
            reader: read.then(|| Worker::new(io_size)),
            writer: write.then(|| Worker::new(io_size)),
        });
        Ok(())
    }

    /// Connecting twice is a programmer error.
    fn assert_disconnected(&self, op: &str) {
        if self.conn.is_some() {
            fatal!("{op} on already-connected pipe {:?}", self.name);
        }
    }

    /// Queues `data` for sending. Never blocks and never refuses data;
    /// callers wanting backpressure check [`bytes_to_send`](Self::bytes_to_send).
    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        self.queues.output.extend_from_slice(data.as_ref());
    }

    /// Writes `data` synchronously, bypassing the output queue.
    ///
    /// Blocks until every byte is written or the write timeout elapses.
    /// Fatal if the endpoint has no writer, if a queued send is still
    /// outstanding, on timeout, or on any error.
    pub fn write_immediately(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        let timeout = self.config.write_timeout;
        let Some(conn) = self.conn.as_mut() else {
            fatal!("write_immediately on closed pipe {:?}", self.name);
        };
        match conn.writer.as_ref() {
            None => fatal!("write_immediately on pipe {:?} without a writer", self.name),
            Some(w) if w.is_pending() => fatal!(
                "write_immediately on pipe {:?} while a write is outstanding",
                self.name
            ),
            Some(_) => {}
        }
        match conn.io.write_blocking(data, timeout) {
            Ok(n) if n == data.len() => {}
            Ok(n) => fatal!(
                "error writing data to pipe {:?}: wrote {n} of {} bytes",
                self.name,
                data.len()
            ),
            Err(e) => fatal!("error writing data to pipe {:?}: {e}", self.name),
        }
    }

    /// Bytes queued plus bytes handed to an outstanding send.
    pub fn bytes_to_send(&self) -> usize {
        let in_flight = self
            .conn
            .as_ref()
            .and_then(|c| c.writer.as_ref())
            .map_or(0, Worker::pending_size);
        self.queues.output.len() + in_flight
    }

    /// Number of received bytes ready to read.
    pub fn bytes_available(&self) -> usize {
        self.queues.input.len()
    }

    /// Returns up to `max` buffered bytes without consuming them.
    pub fn peek(&self, max: usize) -> &[u8] {
        let n = max.min(self.queues.input.len());
        &self.queues.input[..n]
    }

    /// Copies buffered bytes into `buf` without consuming them.
    pub fn peek_into(&self, buf: &mut [u8]) -> usize {
        let src = self.peek(buf.len());
        buf[..src.len()].copy_from_slice(src);
        src.len()
    }

    /// Removes and returns up to `max` bytes from the front of the input.
    pub fn read(&mut self, max: usize) -> Bytes {
        let n = max.min(self.queues.input.len());
        self.queues.input.split_to(n).freeze()
    }

    /// Removes and returns all buffered input.
    pub fn read_all(&mut self) -> Bytes {
        self.queues.input.split().freeze()
    }

    /// Read-capacity limit.
    pub fn read_buffer_size(&self) -> usize {
        self.queues.read_capacity
    }

    /// Changes the read-capacity limit. Takes effect on the next tick.
    pub fn set_read_buffer_size(&mut self, bytes: usize) {
        self.queues.read_capacity = bytes;
    }

    /// Runs one non-blocking tick: the reader, then the writer.
    ///
    /// Wait handles of outstanding operations are pushed onto `waits`.
    /// Returns `true` if any bytes moved or if a transport error closed the
    /// endpoint during this tick; `false` when closed or idle.
    pub fn service(&mut self, waits: &mut WaitSet) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        let queues = &mut self.queues;

        let (read, read_handle) = match conn.reader.as_mut() {
            Some(r) => (r.advance(&mut conn.io, queues), r.wait_handle(&conn.io)),
            None => (Ok(0), None),
        };
        let (written, write_handle) = match conn.writer.as_mut() {
            Some(w) => (w.advance(&mut conn.io, queues), w.wait_handle(&conn.io)),
            None => (Ok(0), None),
        };

        match (read, written) {
            (Ok(r), Ok(w)) => {
                waits.extend(read_handle.into_iter().chain(write_handle));
                r > 0 || w > 0
            }
            (r, w) => {
                for err in [r.err(), w.err()].into_iter().flatten() {
                    tracing::debug!(name = %self.name, error = %err, "pipe I/O failed");
                }
                self.close();
                true
            }
        }
    }

    /// Cancels outstanding I/O, waits for it to drain, and releases the
    /// transport. Buffered input stays readable. No-op when closed.
    pub fn close(&mut self) {
        self.unbind();
        let Some(conn) = self.conn.take() else {
            return;
        };
        conn.shutdown();
        tracing::debug!(name = %self.name, "pipe closed");
    }

    /// Whether the endpoint has no connected transport.
    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Whether the outbound worker has a send outstanding.
    #[cfg(test)]
    fn write_pending(&self) -> bool {
        self.conn
            .as_ref()
            .and_then(|c| c.writer.as_ref())
            .is_some_and(Worker::is_pending)
    }

    /// Whether the inbound worker has a receive outstanding.
    #[cfg(test)]
    fn read_pending(&self) -> bool {
        self.conn
            .as_ref()
            .and_then(|c| c.reader.as_ref())
            .is_some_and(Worker::is_pending)
    }
}

/// Removes a socket file left over at `path`. Anything else is refused.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a socket",
        ));
    }
    fs::remove_file(path)?;
    tracing::debug!(path = %path.display(), "removed stale socket");
    Ok(())
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}
