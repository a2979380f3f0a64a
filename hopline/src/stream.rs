//! Transport capability traits.
//!
//! Anything that can stand in for a plain TCP connection — a TLS-wrapped
//! socket, a test double — exposes the same capability set: write, read
//! pause/resume, close, and the `data` / `pause` / `close` events. Protocol
//! engines are written against these traits rather than
//! [`TcpConnection`](crate::tcp::TcpConnection) so the transports are
//! interchangeable.

use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use crate::event_loop::Loop;
use crate::events::ListenerId;

/// An established, push-based byte stream.
///
/// Streams start read-paused: call `pause(false)` once `data` listeners are
/// attached. Exactly one `close` event is emitted over the stream's
/// lifetime.
pub trait Stream {
    /// Queue bytes for transmission. Never blocks; the `pause` event is the
    /// backpressure signal when the queue crosses its high-water mark.
    fn write(&self, data: Bytes);

    /// Pause or resume the read side. While paused no `data` events are
    /// emitted and the kernel receive buffer is left to fill, pushing
    /// backpressure to the peer.
    fn pause(&self, paused: bool);

    /// Flush queued writes best-effort, then shut the stream down.
    fn close(&self);

    fn is_connected(&self) -> bool;

    /// Peer host as given at connect/accept time.
    fn host(&self) -> String;

    fn port(&self) -> u16;

    fn on_data(&self, listener: Box<dyn FnMut(Bytes)>) -> ListenerId;
    fn on_pause(&self, listener: Box<dyn FnMut(bool)>) -> ListenerId;
    /// The payload carries the socket error that tore the stream down, or
    /// `None` for an orderly close.
    fn on_close(&self, listener: Box<dyn FnMut(Option<CloseError>)>) -> ListenerId;

    fn remove_data_listener(&self, id: ListenerId);
    fn remove_pause_listener(&self, id: ListenerId);
    fn remove_close_listener(&self, id: ListenerId);
}

/// Detail attached to a `close` event when an OS error, rather than an
/// orderly shutdown, tore the stream down.
#[derive(Debug, Clone)]
pub struct CloseError {
    /// OS error code, when the failure came from a syscall.
    pub errno: Option<i32>,
    pub detail: String,
}

impl CloseError {
    pub(crate) fn from_io(err: &std::io::Error) -> CloseError {
        CloseError {
            errno: err.raw_os_error(),
            detail: err.to_string(),
        }
    }
}

impl std::fmt::Display for CloseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.detail)
    }
}

/// Kind of connection failure, mirroring the two syscall families that can
/// fail before a stream exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// A socket-level failure (refused, unreachable, timed out, ...).
    Socket,
    /// Host name resolution failed.
    Resolve,
}

/// Failure to establish a stream.
#[derive(Debug, Clone)]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    /// OS error code, when the failure came from a syscall.
    pub errno: Option<i32>,
    pub detail: String,
}

impl ConnectError {
    pub(crate) fn socket(errno: i32, detail: impl Into<String>) -> ConnectError {
        ConnectError {
            kind: ConnectErrorKind::Socket,
            errno: Some(errno),
            detail: detail.into(),
        }
    }

    pub(crate) fn resolve(detail: impl Into<String>) -> ConnectError {
        ConnectError {
            kind: ConnectErrorKind::Resolve,
            errno: None,
            detail: detail.into(),
        }
    }

    /// Whether this failure was a connect timeout.
    pub fn timed_out(&self) -> bool {
        self.errno == Some(libc::ETIMEDOUT)
    }
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ConnectErrorKind::Socket => write!(f, "socket error: {}", self.detail),
            ConnectErrorKind::Resolve => write!(f, "resolution error: {}", self.detail),
        }
    }
}

/// Dials streams. Plain TCP implements this; a TLS transport implements the
/// same contract over its handshaking connection.
pub trait Connector {
    /// Begin an asynchronous connect. Exactly one of `on_connect` /
    /// `on_error` is invoked, from a loop callback, never before this call
    /// returns.
    fn connect(
        &self,
        lp: &Loop,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        on_connect: Box<dyn FnOnce(Rc<dyn Stream>)>,
        on_error: Box<dyn FnOnce(ConnectError)>,
    );
}
