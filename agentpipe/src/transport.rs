//! Non-blocking transfers on a Unix file descriptor.
//!
//! A worker hands [`FdTransport`] one operation per direction at a time.
//! The descriptor runs in `O_NONBLOCK` mode; a call that would block leaves
//! the operation outstanding, and [`FdTransport::poll`] retries it once the
//! descriptor is ready. A send is only reported complete after every byte
//! of the operation has been accepted, so partial writes stay pending.
//!
//! The caller passes the same buffer slice to [`FdTransport::start`] and to
//! every subsequent [`FdTransport::poll`] for that operation.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::{Duration, Instant};

/// Transfer direction of a worker or an adopted handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Direction {
    /// Bytes flow from the transport into the input queue.
    Read,
    /// Bytes flow from the output queue into the transport.
    Write,
}

impl Direction {
    /// Slot of this direction in per-direction tables.
    const fn index(self) -> usize {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }
}

/// Readiness a [`WaitHandle`] waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Interest {
    /// The descriptor has data (or a hangup) to report.
    Readable,
    /// The descriptor can accept more data.
    Writable,
}

/// Signal an event loop waits on before re-polling an outstanding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitHandle {
    /// Descriptor the operation is outstanding on.
    fd: RawFd,
    /// Readiness that lets the operation make progress.
    interest: Interest,
}

impl WaitHandle {
    /// Raw descriptor to wait on.
    pub const fn fd(&self) -> RawFd {
        self.fd
    }

    /// Readiness the handle waits for.
    pub const fn interest(&self) -> Interest {
        self.interest
    }

    /// Builds the `pollfd` entry for this handle.
    pub(crate) const fn pollfd(&self) -> libc::pollfd {
        let events = match self.interest {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
        };
        libc::pollfd {
            fd: self.fd,
            events,
            revents: 0,
        }
    }
}

/// Result of issuing or re-polling an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoStatus {
    /// The operation finished, moving this many bytes.
    Complete(usize),
    /// The operation is still outstanding.
    Pending,
}

/// Bookkeeping for one outstanding operation.
#[derive(Debug, Clone, Copy)]
struct Op {
    /// Bytes requested.
    len: usize,
    /// Bytes already sent (writes only).
    done: usize,
    /// Set by [`FdTransport::cancel`].
    canceled: bool,
}

/// Owned descriptor plus the state of at most one operation per direction.
#[derive(Debug)]
pub(crate) struct FdTransport {
    /// The descriptor, in non-blocking mode.
    file: File,
    /// Outstanding operation per [`Direction`].
    ops: [Option<Op>; 2],
    /// Status flags to put back on drop, if `new` changed them.
    ///
    /// `O_NONBLOCK` lives on the open file description, which duplicates
    /// of the descriptor (a dup'ed stdin, say) share with other processes.
    saved_flags: Option<libc::c_int>,
}

impl FdTransport {
    /// Takes ownership of `fd` and switches it to non-blocking mode.
    pub(crate) fn new(fd: OwnedFd) -> io::Result<Self> {
        let saved_flags = set_nonblocking(&fd)?;
        Ok(Self {
            file: File::from(fd),
            ops: [None, None],
            saved_flags,
        })
    }

    /// Issues a transfer of `buf.len()` bytes in direction `dir`.
    pub(crate) fn start(&mut self, dir: Direction, buf: &mut [u8]) -> io::Result<IoStatus> {
        debug_assert!(self.ops[dir.index()].is_none(), "{dir:?} already outstanding");
        self.ops[dir.index()] = Some(Op {
            len: buf.len(),
            done: 0,
            canceled: false,
        });
        self.poll(dir, buf)
    }

    /// Checks whether the outstanding operation in direction `dir` has
    /// finished, without blocking.
    pub(crate) fn poll(&mut self, dir: Direction, buf: &mut [u8]) -> io::Result<IoStatus> {
        let slot = dir.index();
        let Some(mut op) = self.ops[slot] else {
            return Err(io::Error::other("no outstanding operation"));
        };
        match dir {
            // A receive may be shortened between polls.
            Direction::Read => op.len = buf.len(),
            Direction::Write => debug_assert_eq!(op.len, buf.len()),
        }
        let status = match dir {
            Direction::Read => self.try_read(buf),
            Direction::Write => self.try_write(&mut op, buf),
        };
        match status {
            Ok(IoStatus::Pending) => self.ops[slot] = Some(op),
            Ok(IoStatus::Complete(_)) | Err(_) => self.ops[slot] = None,
        }
        status
    }

    /// One non-blocking receive. End of stream is a transport error.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<IoStatus> {
        loop {
            match (&self.file).read(buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "pipe closed by peer",
                    ));
                }
                Ok(n) => return Ok(IoStatus::Complete(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(IoStatus::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends as much of the remaining bytes of `op` as the descriptor takes.
    fn try_write(&self, op: &mut Op, buf: &[u8]) -> io::Result<IoStatus> {
        while op.done < op.len {
            match (&self.file).write(&buf[op.done..op.len]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => op.done += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(IoStatus::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(IoStatus::Complete(op.len))
    }

    /// Requests cancellation of every outstanding operation on the handle.
    pub(crate) fn cancel(&mut self) {
        for op in self.ops.iter_mut().flatten() {
            op.canceled = true;
        }
    }

    /// Blocks until the canceled operation in direction `dir` is
    /// acknowledged.
    ///
    /// Between polls the kernel holds no reference to the caller's buffer,
    /// so acknowledgement is immediate once [`cancel`](Self::cancel) ran.
    pub(crate) fn wait_canceled(&mut self, dir: Direction) {
        if let Some(op) = self.ops[dir.index()].take() {
            debug_assert!(op.canceled, "drain without cancel");
            tracing::trace!(?dir, len = op.len, sent = op.done, "canceled I/O drained");
        }
    }

    /// Cancels and drains the operation outstanding in direction `dir`
    /// alone, leaving the other direction running.
    pub(crate) fn withdraw(&mut self, dir: Direction) {
        if let Some(op) = self.ops[dir.index()].as_mut() {
            op.canceled = true;
        }
        self.wait_canceled(dir);
    }

    /// Wait handle for an operation outstanding in direction `dir`.
    pub(crate) fn wait_handle(&self, dir: Direction) -> WaitHandle {
        WaitHandle {
            fd: self.file.as_raw_fd(),
            interest: match dir {
                Direction::Read => Interest::Readable,
                Direction::Write => Interest::Writable,
            },
        }
    }

    /// Writes `data` synchronously, giving up after `timeout`.
    ///
    /// Returns the number of bytes written, which is short only on timeout.
    pub(crate) fn write_blocking(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;
        while written < data.len() {
            match (&self.file).write(&data[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero()
                        || !poll_one(self.file.as_raw_fd(), libc::POLLOUT, remaining)?
                    {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

impl Drop for FdTransport {
    fn drop(&mut self) {
        let Some(flags) = self.saved_flags else {
            return;
        };
        // SAFETY: fcntl(F_SETFL) on the descriptor `self.file` still owns.
        if unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_SETFL, flags) } == -1 {
            tracing::debug!(
                error = %io::Error::last_os_error(),
                "failed to restore descriptor flags"
            );
        }
    }
}

/// Waits up to `timeout` for a peer to connect to `listener`.
pub(crate) fn accept(listener: &UnixListener, timeout: Duration) -> io::Result<UnixStream> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _)) => return Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || !poll_one(listener.as_raw_fd(), libc::POLLIN, remaining)?
                {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no peer connected before the accept timeout",
                    ));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Waits for `events` on a single descriptor. Returns `false` on timeout.
fn poll_one(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let mut pfd = [libc::pollfd {
        fd,
        events,
        revents: 0,
    }];
    Ok(poll(&mut pfd, Some(timeout))? > 0)
}

/// Thin wrapper over `poll(2)` that retries on `EINTR`.
///
/// `None` waits indefinitely. Returns the number of ready descriptors.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout_ms = timeout.map_or(-1, |t| {
        // Round up so a sub-millisecond remainder still waits.
        let ms = t.as_micros().div_ceil(1000);
        libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
    });
    let nfds = libc::nfds_t::try_from(fds.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many wait handles"))?;
    loop {
        // SAFETY: `fds` is a valid, exclusively borrowed slice of `nfds` pollfd entries.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), nfds, timeout_ms) };
        if let Ok(ready) = usize::try_from(ret) {
            return Ok(ready);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Sets `O_NONBLOCK` on a descriptor.
///
/// Returns the previous status flags if they had to change.
fn set_nonblocking(fd: &OwnedFd) -> io::Result<Option<libc::c_int>> {
    // SAFETY: fcntl(F_GETFL) on a valid, owned descriptor.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(None);
    }
    // SAFETY: fcntl(F_SETFL) on a valid, owned descriptor.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(Some(flags))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn socket_pair() -> (FdTransport, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (FdTransport::new(OwnedFd::from(a)).unwrap(), b)
    }

    #[test]
    fn read_without_data_stays_pending() {
        let (mut io, mut peer) = socket_pair();
        let mut buf = [0u8; 16];

        assert_eq!(io.start(Direction::Read, &mut buf).unwrap(), IoStatus::Pending);
        assert_eq!(io.poll(Direction::Read, &mut buf).unwrap(), IoStatus::Pending);

        peer.write_all(b"abc").unwrap();
        assert_eq!(io.poll(Direction::Read, &mut buf).unwrap(), IoStatus::Complete(3));
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn peer_hangup_is_an_error() {
        let (mut io, peer) = socket_pair();
        let mut buf = [0u8; 16];
        assert_eq!(io.start(Direction::Read, &mut buf).unwrap(), IoStatus::Pending);

        drop(peer);
        let err = io.poll(Direction::Read, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn write_completes_only_with_every_byte() {
        let (mut io, mut peer) = socket_pair();
        let mut big = vec![7u8; 4 * 1024 * 1024];

        // The socket buffer cannot take 4 MiB at once.
        assert_eq!(io.start(Direction::Write, &mut big).unwrap(), IoStatus::Pending);

        let mut sink = vec![0u8; 64 * 1024];
        let mut drained = 0;
        let status = loop {
            peer.set_nonblocking(true).unwrap();
            while let Ok(n) = peer.read(&mut sink) {
                if n == 0 {
                    break;
                }
                drained += n;
            }
            match io.poll(Direction::Write, &mut big).unwrap() {
                IoStatus::Pending => {}
                done @ IoStatus::Complete(_) => break done,
            }
        };
        assert_eq!(status, IoStatus::Complete(big.len()));
        assert!(drained <= big.len());
    }

    #[test]
    fn wait_handle_tracks_direction() {
        let (io, _peer) = socket_pair();
        assert_eq!(io.wait_handle(Direction::Read).interest(), Interest::Readable);
        assert_eq!(io.wait_handle(Direction::Write).interest(), Interest::Writable);
        assert_eq!(io.wait_handle(Direction::Read).pollfd().events, libc::POLLIN);
    }

    #[test]
    fn cancel_then_drain_clears_the_operation() {
        let (mut io, _peer) = socket_pair();
        let mut buf = [0u8; 8];
        assert_eq!(io.start(Direction::Read, &mut buf).unwrap(), IoStatus::Pending);

        io.cancel();
        io.wait_canceled(Direction::Read);
        assert!(io.poll(Direction::Read, &mut buf).is_err());
    }

    fn is_nonblocking(fd: &impl AsRawFd) -> bool {
        // SAFETY: fcntl(F_GETFL) on a descriptor borrowed for the call.
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(flags, -1);
        flags & libc::O_NONBLOCK != 0
    }

    #[test]
    fn drop_restores_blocking_mode_of_shared_description() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let io = FdTransport::new(OwnedFd::from(ours.try_clone().unwrap())).unwrap();
        assert!(is_nonblocking(&ours));

        drop(io);
        assert!(!is_nonblocking(&ours));
    }

    #[test]
    fn drop_keeps_nonblocking_mode_it_found() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        drop(FdTransport::new(OwnedFd::from(ours.try_clone().unwrap())).unwrap());
        assert!(is_nonblocking(&ours));
    }

    #[test]
    fn shortened_receive_reads_no_more_than_asked() {
        let (mut io, mut peer) = socket_pair();
        let mut buf = [0u8; 16];
        assert_eq!(io.start(Direction::Read, &mut buf).unwrap(), IoStatus::Pending);

        peer.write_all(b"abcdefgh").unwrap();
        assert_eq!(io.poll(Direction::Read, &mut buf[..3]).unwrap(), IoStatus::Complete(3));
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn withdraw_leaves_the_other_direction() {
        let (mut io, _peer) = socket_pair();
        let mut rbuf = [0u8; 8];
        let mut wbuf = vec![1u8; 4 * 1024 * 1024];
        assert_eq!(io.start(Direction::Read, &mut rbuf).unwrap(), IoStatus::Pending);
        assert_eq!(io.start(Direction::Write, &mut wbuf).unwrap(), IoStatus::Pending);

        io.withdraw(Direction::Read);
        assert!(io.poll(Direction::Read, &mut rbuf).is_err());
        assert_eq!(io.poll(Direction::Write, &mut wbuf).unwrap(), IoStatus::Pending);
    }

    #[test]
    fn accept_times_out_without_peer() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("lonely.sock")).unwrap();
        let err = accept(&listener, Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn blocking_write_reports_bytes() {
        let (mut io, mut peer) = socket_pair();
        let n = io.write_blocking(b"urgent", Duration::from_secs(1)).unwrap();
        assert_eq!(n, 6);
        let mut buf = [0u8; 6];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"urgent");
    }
}
