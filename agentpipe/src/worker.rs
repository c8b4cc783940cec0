//! Per-direction transfer state machine.
//!
//! A [`Worker`] drives one direction of an endpoint. It is stepped by
//! [`Worker::advance`] once per event-loop tick and never blocks there.
//! Reading and writing share the same state machine and differ only in
//! their [`Policy`].

use std::fmt;
use std::io;
use std::marker::PhantomData;

use bytes::{Buf, BytesMut};

use crate::error::fatal;
use crate::transport::{Direction, FdTransport, IoStatus, WaitHandle};

/// The endpoint state a worker operates on.
#[derive(Debug)]
pub(crate) struct Queues {
    /// Received bytes not yet consumed.
    pub(crate) input: BytesMut,
    /// Bytes written by the producer and not yet issued.
    pub(crate) output: BytesMut,
    /// No receive is issued while `input` holds this many bytes.
    pub(crate) read_capacity: usize,
}

impl Queues {
    /// Empty queues with the given read-capacity limit.
    pub(crate) fn new(read_capacity: usize) -> Self {
        Self {
            input: BytesMut::new(),
            output: BytesMut::new(),
            read_capacity,
        }
    }
}

/// Direction-specific behaviour plugged into a [`Worker`].
pub(crate) trait Policy {
    /// Direction of the operations this policy issues.
    const DIRECTION: Direction;

    /// Decides whether another operation should be issued.
    ///
    /// Returns the operation size, after preparing `buf[..size]` when the
    /// operation sends data.
    fn should_issue(queues: &mut Queues, buf: &mut [u8]) -> Option<usize>;

    /// Size to re-poll an outstanding operation of `size` bytes with.
    /// Zero withdraws the operation.
    fn outstanding_len(_queues: &Queues, size: usize) -> usize {
        size
    }

    /// Handles a finished operation that moved `data.len()` of `issued`
    /// requested bytes.
    fn on_complete(queues: &mut Queues, data: &[u8], issued: usize);
}

/// Receives into the input queue while it has spare capacity.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Reader {}

impl Policy for Reader {
    const DIRECTION: Direction = Direction::Read;

    fn should_issue(queues: &mut Queues, buf: &mut [u8]) -> Option<usize> {
        let room = queues.read_capacity.saturating_sub(queues.input.len());
        (room > 0).then(|| room.min(buf.len()))
    }

    // The limit may have been lowered since the receive was issued.
    fn outstanding_len(queues: &Queues, size: usize) -> usize {
        size.min(queues.read_capacity.saturating_sub(queues.input.len()))
    }

    fn on_complete(queues: &mut Queues, data: &[u8], _issued: usize) {
        queues.input.extend_from_slice(data);
    }
}

/// Sends the output queue front to back, one chunk per operation.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Writer {}

impl Policy for Writer {
    const DIRECTION: Direction = Direction::Write;

    fn should_issue(queues: &mut Queues, buf: &mut [u8]) -> Option<usize> {
        if queues.output.is_empty() {
            return None;
        }
        let size = queues.output.len().min(buf.len());
        buf[..size].copy_from_slice(&queues.output[..size]);
        // Issued bytes leave the queue now, not at completion.
        queues.output.advance(size);
        Some(size)
    }

    fn on_complete(_queues: &mut Queues, data: &[u8], issued: usize) {
        if data.len() != issued {
            fatal!(
                "completion size mismatch: sent {} of {issued} bytes",
                data.len()
            );
        }
    }
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Nothing issued.
    Idle,
    /// One operation of `size` bytes is outstanding; the buffer is lent to
    /// the transport.
    Pending {
        /// Size of the outstanding operation.
        size: usize,
    },
    /// A transport error was reported; the endpoint tears down next.
    Failed,
}

/// Generic transfer worker, specialized by [`Reader`] or [`Writer`].
pub(crate) struct Worker<P> {
    /// Private transfer buffer. Never resized, and untouched by anyone but
    /// the transport while pending.
    buffer: Box<[u8]>,
    /// Current state.
    state: State,
    /// Direction policy.
    policy: PhantomData<P>,
}

impl<P> fmt::Debug for Worker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("capacity", &self.buffer.len())
            .field("state", &self.state)
            .finish()
    }
}

impl<P: Policy> Worker<P> {
    /// Creates an idle worker with a buffer of `io_size` bytes.
    pub(crate) fn new(io_size: usize) -> Self {
        Self {
            buffer: vec![0; io_size.max(1)].into_boxed_slice(),
            state: State::Idle,
            policy: PhantomData,
        }
    }

    /// Whether an operation is outstanding.
    pub(crate) const fn is_pending(&self) -> bool {
        matches!(self.state, State::Pending { .. })
    }

    /// Size of the outstanding operation, or zero.
    pub(crate) const fn pending_size(&self) -> usize {
        match self.state {
            State::Pending { size } => size,
            State::Idle | State::Failed => 0,
        }
    }

    /// Makes as much progress as possible without blocking.
    ///
    /// Returns the number of bytes moved, or the transport error that put
    /// the worker into the failed state.
    pub(crate) fn advance(&mut self, io: &mut FdTransport, queues: &mut Queues) -> io::Result<usize> {
        let mut progress = 0;
        match self.state {
            State::Failed => return Err(io::Error::other("transfer worker already failed")),
            State::Pending { size } => match P::outstanding_len(queues, size) {
                0 => {
                    io.withdraw(P::DIRECTION);
                    self.state = State::Idle;
                }
                len => match io.poll(P::DIRECTION, &mut self.buffer[..len]) {
                    Ok(IoStatus::Pending) => {
                        self.state = State::Pending { size: len };
                        return Ok(0);
                    }
                    Ok(IoStatus::Complete(n)) => {
                        self.state = State::Idle;
                        P::on_complete(queues, &self.buffer[..n], len);
                        progress += n;
                    }
                    Err(e) => {
                        self.state = State::Failed;
                        return Err(e);
                    }
                },
            },
            State::Idle => {}
        }

        // Keep issuing while operations finish synchronously.
        while let Some(size) = P::should_issue(queues, &mut self.buffer) {
            match io.start(P::DIRECTION, &mut self.buffer[..size]) {
                Ok(IoStatus::Complete(n)) => {
                    P::on_complete(queues, &self.buffer[..n], size);
                    progress += n;
                }
                Ok(IoStatus::Pending) => {
                    self.state = State::Pending { size };
                    return Ok(progress);
                }
                Err(e) => {
                    self.state = State::Failed;
                    return Err(e);
                }
            }
        }
        Ok(progress)
    }

    /// Handle to wait on, present only while an operation is outstanding.
    pub(crate) fn wait_handle(&self, io: &FdTransport) -> Option<WaitHandle> {
        self.is_pending().then(|| io.wait_handle(P::DIRECTION))
    }

    /// Waits for a canceled operation to be acknowledged.
    ///
    /// Must follow [`FdTransport::cancel`] and precede freeing the buffer.
    pub(crate) fn cancel_and_drain(&mut self, io: &mut FdTransport) {
        if self.is_pending() {
            io.wait_canceled(P::DIRECTION);
            self.state = State::Idle;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    fn transport() -> (FdTransport, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (FdTransport::new(OwnedFd::from(a)).unwrap(), b)
    }

    #[test]
    fn writer_drains_queue_in_chunks() {
        let (mut io, mut peer) = transport();
        let mut queues = Queues::new(1024);
        queues.output.extend_from_slice(b"hello, world");

        let mut writer = Worker::<Writer>::new(5);
        assert_eq!(writer.advance(&mut io, &mut queues).unwrap(), 12);
        assert!(!writer.is_pending());
        assert!(queues.output.is_empty());
        assert!(writer.wait_handle(&io).is_none());

        let mut got = [0u8; 12];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello, world");
    }

    #[test]
    fn idle_writer_reports_no_progress() {
        let (mut io, _peer) = transport();
        let mut queues = Queues::new(1024);
        let mut writer = Worker::<Writer>::new(64);
        assert_eq!(writer.advance(&mut io, &mut queues).unwrap(), 0);
        assert_eq!(writer.pending_size(), 0);
    }

    #[test]
    fn reader_pends_then_completes() {
        let (mut io, mut peer) = transport();
        let mut queues = Queues::new(1024);
        let mut reader = Worker::<Reader>::new(64);

        assert_eq!(reader.advance(&mut io, &mut queues).unwrap(), 0);
        assert!(reader.is_pending());
        assert!(reader.wait_handle(&io).is_some());

        peer.write_all(b"ping").unwrap();
        assert_eq!(reader.advance(&mut io, &mut queues).unwrap(), 4);
        assert_eq!(&queues.input[..], b"ping");
        // A fresh receive is outstanding again.
        assert!(reader.is_pending());
    }

    #[test]
    fn reader_respects_capacity() {
        let (mut io, mut peer) = transport();
        let mut queues = Queues::new(10);
        let mut reader = Worker::<Reader>::new(64);

        peer.write_all(&[1u8; 25]).unwrap();
        assert_eq!(reader.advance(&mut io, &mut queues).unwrap(), 10);
        assert_eq!(queues.input.len(), 10);
        assert!(!reader.is_pending());
        assert!(reader.wait_handle(&io).is_none());

        queues.input.advance(4);
        assert_eq!(reader.advance(&mut io, &mut queues).unwrap(), 4);
        assert_eq!(queues.input.len(), 10);
    }

    #[test]
    fn lowered_capacity_shrinks_outstanding_receive() {
        let (mut io, mut peer) = transport();
        let mut queues = Queues::new(64);
        let mut reader = Worker::<Reader>::new(64);
        assert_eq!(reader.advance(&mut io, &mut queues).unwrap(), 0);
        assert_eq!(reader.pending_size(), 64);

        queues.read_capacity = 10;
        peer.write_all(&[3u8; 1000]).unwrap();
        assert_eq!(reader.advance(&mut io, &mut queues).unwrap(), 10);
        assert_eq!(queues.input.len(), 10);
        assert!(!reader.is_pending());
    }

    #[test]
    fn full_queue_withdraws_outstanding_receive() {
        let (mut io, mut peer) = transport();
        let mut queues = Queues::new(64);
        let mut reader = Worker::<Reader>::new(64);
        assert_eq!(reader.advance(&mut io, &mut queues).unwrap(), 0);
        assert!(reader.is_pending());

        queues.read_capacity = 0;
        peer.write_all(b"later").unwrap();
        assert_eq!(reader.advance(&mut io, &mut queues).unwrap(), 0);
        assert!(!reader.is_pending());
        assert!(reader.wait_handle(&io).is_none());
        assert!(queues.input.is_empty());

        queues.read_capacity = 64;
        assert_eq!(reader.advance(&mut io, &mut queues).unwrap(), 5);
        assert_eq!(&queues.input[..], b"later");
    }

    #[test]
    fn pending_writer_counts_in_flight_bytes() {
        let (mut io, _peer) = transport();
        let mut queues = Queues::new(1024);
        queues.output.extend_from_slice(&vec![0u8; 8 * 1024 * 1024]);
        let mut writer = Worker::<Writer>::new(64 * 1024);

        writer.advance(&mut io, &mut queues).unwrap();
        assert!(writer.is_pending());
        assert_eq!(writer.pending_size(), 64 * 1024);
        assert!(writer.wait_handle(&io).is_some());

        io.cancel();
        writer.cancel_and_drain(&mut io);
        assert!(!writer.is_pending());
    }

    #[test]
    fn failure_is_sticky() {
        let (mut io, peer) = transport();
        let mut queues = Queues::new(1024);
        let mut reader = Worker::<Reader>::new(64);
        assert_eq!(reader.advance(&mut io, &mut queues).unwrap(), 0);

        drop(peer);
        assert!(reader.advance(&mut io, &mut queues).is_err());
        assert!(!reader.is_pending());
        assert!(reader.advance(&mut io, &mut queues).is_err());
    }

    #[test]
    #[should_panic(expected = "completion size mismatch")]
    fn short_completion_is_fatal() {
        let mut queues = Queues::new(16);
        Writer::on_complete(&mut queues, b"abc", 4);
    }
}
