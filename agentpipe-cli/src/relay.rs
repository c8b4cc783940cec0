//! `agentpipe connect|listen` — shuttle bytes between stdio and a pipe.
//!
//! Stdin and stdout are adopted as half-duplex endpoints and driven by the
//! same event loop as the connection, so the relay never blocks on either
//! side. Each direction stops pulling input once its destination has a
//! full read buffer's worth of bytes still to send.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use agentpipe::{Direction, Endpoint, EventLoop, Handler, PipeConfig, PipeId};
use anyhow::{Context, Result};

/// Connects to `path` and relays stdio over it.
pub fn connect(path: &Path, config: PipeConfig) -> Result<()> {
    let mut conn = Endpoint::with_config(config);
    conn.connect_as_initiator(path)
        .with_context(|| format!("connecting to {}", path.display()))?;
    run_stdio(conn, config)
}

/// Waits for one peer on `path` and relays stdio over the connection.
pub fn listen(path: &Path, config: PipeConfig) -> Result<()> {
    let mut conn = Endpoint::with_config(config);
    conn.bind(path)
        .with_context(|| format!("listening on {}", path.display()))?;
    tracing::info!(path = %path.display(), "waiting for peer");
    conn.connect_as_acceptor();
    run_stdio(conn, config)
}

/// Relays between `conn` and this process's stdin/stdout.
fn run_stdio(conn: Endpoint, config: PipeConfig) -> Result<()> {
    let stdin = io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .context("duplicating stdin")?;
    let stdout = io::stdout()
        .as_fd()
        .try_clone_to_owned()
        .context("duplicating stdout")?;
    relay(conn, stdin, stdout, config)
}

/// Relays between `conn` and the `input`/`output` descriptors until either
/// side is done.
fn relay(conn: Endpoint, input: OwnedFd, output: OwnedFd, config: PipeConfig) -> Result<()> {
    let mut source = Endpoint::with_config(config);
    source
        .adopt(input, Direction::Read, "stdin")
        .context("adopting stdin")?;
    let mut sink = Endpoint::with_config(config);
    sink.adopt(output, Direction::Write, "stdout")
        .context("adopting stdout")?;

    let mut lp = EventLoop::new();
    let mut relay = Relay {
        conn: lp.add(conn),
        source: lp.add(source),
        sink: lp.add(sink),
        limit: config.read_buffer_size_value(),
    };
    lp.run(&mut relay).context("event loop")?;
    tracing::debug!("relay finished");
    Ok(())
}

/// Event-loop handler moving bytes source → conn and conn → sink.
struct Relay {
    conn: PipeId,
    source: PipeId,
    sink: PipeId,
    /// Most bytes allowed to wait in a destination's output queue.
    limit: usize,
}

impl Relay {
    /// Whether nothing more can be relayed.
    fn finished(&self, lp: &EventLoop) -> bool {
        let (Some(conn), Some(source), Some(sink)) =
            (lp.get(self.conn), lp.get(self.source), lp.get(self.sink))
        else {
            return true;
        };
        if sink.is_closed() {
            return true;
        }
        let flushed = sink.bytes_to_send() == 0;
        let peer_done = conn.is_closed() && conn.bytes_available() == 0;
        let input_done = source.is_closed() && source.bytes_available() == 0;
        flushed && (peer_done || (input_done && conn.bytes_to_send() == 0))
    }
}

impl Handler for Relay {
    fn on_pipe_io(&mut self, lp: &mut EventLoop, _id: PipeId) {
        forward(lp, self.source, self.conn, self.limit);
        forward(lp, self.conn, self.sink, self.limit);
        if self.finished(lp) {
            lp.shutdown();
        }
    }
}

/// Moves as many bytes from `from` to `to` as `to` has room for.
fn forward(lp: &mut EventLoop, from: PipeId, to: PipeId, limit: usize) {
    let room = match lp.get(to) {
        Some(dst) if !dst.is_closed() => limit.saturating_sub(dst.bytes_to_send()),
        _ => return,
    };
    if room == 0 {
        return;
    }
    let Some(data) = lp.get_mut(from).map(|src| src.read(room)) else {
        return;
    };
    if data.is_empty() {
        return;
    }
    tracing::trace!(bytes = data.len(), "forwarding");
    if let Some(dst) = lp.get_mut(to) {
        dst.write(&data);
    }
}
