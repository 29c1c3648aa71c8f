//! Per-connection session handling.
//!
//! Each client connection is driven by one task and three pieces of state:
//! - `EchoSession`: the protocol state machine (greeting, echo loop,
//!   termination).
//! - `LineBuffer`: newline framing over the raw byte stream, bounded by the
//!   configured maximum line length.
//! - `run`: the task body that reads the socket, feeds complete lines to the
//!   state machine, and writes replies.
//!
//! Errors on one session close only that session; the registry entry is
//! always removed on the way out.

use crate::registry::Registry;
use bytes::BytesMut;
use chrono::Local;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Suffix appended to every server-originated line.
const FROM_SERVER: &str = "(from SERVER)";

/// Exact phrase a client sends to end its session.
const TERMINATION_PHRASE: &str = "Good Bye!";

/// Current wall-clock time in the server's reply format.
pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Just accepted; the welcome line has not been sent yet.
    Greeting,
    /// Echo loop: every complete line gets a timestamped reply.
    Active,
    /// Terminal: the connection is being closed, no further events.
    Closing,
}

/// Reply produced by the state machine for one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Echo the line back; the session stays active.
    Echo(String),
    /// Farewell line; the session must be closed after sending it.
    Farewell(String),
}

/// The per-session protocol state machine.
///
/// Pure state: I/O is the caller's job, which keeps the transitions
/// directly testable.
pub struct EchoSession {
    state: SessionState,
}

impl EchoSession {
    /// Create a session in the initial greeting state.
    pub fn new() -> Self {
        Self {
            state: SessionState::Greeting,
        }
    }

    /// Current state, for assertions in tests.
    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Produce the welcome line and enter the echo loop.
    pub fn greet(&mut self) -> String {
        self.state = SessionState::Active;
        format!("{} - Welcome to My Echo Server.{FROM_SERVER}", timestamp())
    }

    /// Advance the state machine with one complete input line.
    ///
    /// Returns `None` once the session is closing (or before the greeting);
    /// no further events are processed.
    pub fn on_line(&mut self, line: &str) -> Option<Reply> {
        if self.state != SessionState::Active {
            return None;
        }

        if line == TERMINATION_PHRASE {
            self.state = SessionState::Closing;
            Some(Reply::Farewell(format!(
                "{} - Bye bye!{FROM_SERVER}",
                timestamp()
            )))
        } else {
            Some(Reply::Echo(format!("{} - {line}{FROM_SERVER}", timestamp())))
        }
    }
}

impl Default for EchoSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Line framing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineError {
    /// The buffered input exceeded the maximum line length without a newline.
    Overflow,
}

/// Buffers raw socket bytes and yields complete lines.
///
/// A partial line is held until its newline arrives; a session that never
/// sends one is bounded by `max_line` bytes. Trailing `\n` and an optional
/// preceding `\r` are stripped (telnet clients send CRLF).
pub struct LineBuffer {
    buf: BytesMut,
    max_line: usize,
}

impl LineBuffer {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            max_line,
        }
    }

    /// The underlying buffer, for the socket to read into.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Pop the next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Result<Option<String>, LineError> {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) if pos > self.max_line => Err(LineError::Overflow),
            Some(pos) => {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.ends_with(b"\r") {
                    line.truncate(line.len() - 1);
                }
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None if self.buf.len() > self.max_line => Err(LineError::Overflow),
            None => Ok(None),
        }
    }
}

/// What woke the session task up.
enum Event {
    /// Bytes read from the socket (0 = EOF).
    Read(usize),
    /// Operator force-disconnected this session.
    Disconnected,
    /// Server-wide shutdown.
    Shutdown,
}

/// Drive one client session to completion.
///
/// Registers the session, sends the welcome line, then echoes complete
/// lines until the client sends the termination phrase, disconnects, errs,
/// overflows the line buffer, or is closed by the operator. The registry
/// entry is removed on every exit path.
pub async fn run(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    max_line: usize,
    mut shutdown: watch::Receiver<()>,
) -> io::Result<()> {
    let ticket = registry.register(peer);
    let id = ticket.id;
    debug!(id, peer = %peer, "Session registered");

    let result = drive(
        &mut stream,
        id,
        peer,
        max_line,
        &ticket.closer,
        &mut shutdown,
    )
    .await;

    // Idempotent: a no-op if the operator already removed the entry
    registry.unregister(id);
    let _ = stream.shutdown().await;
    debug!(id, peer = %peer, "Session closed");
    result
}

async fn drive(
    stream: &mut TcpStream,
    id: u64,
    peer: SocketAddr,
    max_line: usize,
    closer: &tokio::sync::Notify,
    shutdown: &mut watch::Receiver<()>,
) -> io::Result<()> {
    let mut session = EchoSession::new();
    let mut lines = LineBuffer::new(max_line);

    write_line(stream, &session.greet()).await?;

    loop {
        let event = tokio::select! {
            res = stream.read_buf(lines.buf_mut()) => Event::Read(res?),
            _ = closer.notified() => Event::Disconnected,
            _ = shutdown.changed() => Event::Shutdown,
        };

        match event {
            Event::Read(0) => {
                trace!(id, "Connection closed by client");
                return Ok(());
            }
            Event::Read(_) => loop {
                match lines.next_line() {
                    Ok(Some(line)) => match session.on_line(&line) {
                        Some(Reply::Echo(reply)) => write_line(stream, &reply).await?,
                        Some(Reply::Farewell(reply)) => {
                            write_line(stream, &reply).await?;
                            trace!(id, "Session terminated by client");
                            return Ok(());
                        }
                        None => return Ok(()),
                    },
                    Ok(None) => break,
                    Err(LineError::Overflow) => {
                        // Close without a reply; the operator gets the log line
                        info!(
                            id,
                            peer = %peer,
                            max_line,
                            "Line exceeded maximum buffered length, closing session"
                        );
                        return Ok(());
                    }
                }
            },
            Event::Disconnected => {
                debug!(id, peer = %peer, "Session disconnected by operator");
                return Ok(());
            }
            Event::Shutdown => {
                debug!(id, "Session closing for server shutdown");
                return Ok(());
            }
        }
    }
}

async fn write_line(stream: &mut TcpStream, line: &str) -> io::Result<()> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await
}
