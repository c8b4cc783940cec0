//! Endpoint tuning knobs.

use std::time::Duration;

/// Default read-capacity limit: no new receive is issued once this many
/// unread bytes are buffered.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default size of each worker's private transfer buffer.
pub const DEFAULT_IO_SIZE: usize = 64 * 1024;

/// Default bound on [`Endpoint::connect_as_acceptor`](crate::Endpoint::connect_as_acceptor).
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on [`Endpoint::write_immediately`](crate::Endpoint::write_immediately).
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a pipe [`Endpoint`](crate::Endpoint).
///
/// Defaults: 64 KiB read capacity, 64 KiB transfer chunks, 30 s accept
/// and synchronous-write timeouts.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use agentpipe::PipeConfig;
///
/// let config = PipeConfig::new()
///     .read_buffer_size(16 * 1024)
///     .accept_timeout(Duration::from_secs(5));
/// assert_eq!(config.read_buffer_size_value(), 16 * 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct PipeConfig {
    /// Read-capacity limit applied to the input queue.
    pub(crate) read_buffer_size: usize,
    /// Capacity of each worker's transfer buffer.
    pub(crate) io_size: usize,
    /// How long an acceptor waits for its peer.
    pub(crate) accept_timeout: Duration,
    /// How long a synchronous write may take.
    pub(crate) write_timeout: Duration,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeConfig {
    /// Creates a configuration with the default values.
    pub const fn new() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            io_size: DEFAULT_IO_SIZE,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Sets the initial read-capacity limit.
    pub const fn read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes;
        self
    }

    /// Sets the transfer chunk size. Zero is raised to one byte.
    pub const fn io_size(mut self, bytes: usize) -> Self {
        self.io_size = if bytes == 0 { 1 } else { bytes };
        self
    }

    /// Sets the accept timeout.
    pub const fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Sets the synchronous-write timeout.
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Returns the configured read-capacity limit.
    pub const fn read_buffer_size_value(&self) -> usize {
        self.read_buffer_size
    }

    /// Returns the configured transfer chunk size.
    pub const fn io_size_value(&self) -> usize {
        self.io_size
    }
}
