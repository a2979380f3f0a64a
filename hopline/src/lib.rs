//! hopline — evented I/O core for building HTTP/1.1 intermediaries.
//!
//! A single-threaded, readiness-based event loop (epoll / kqueue / poll)
//! with timed callbacks, plus a push-based non-blocking TCP transport with
//! explicit read pause/resume and write-side backpressure. The HTTP/1.1
//! engine lives in the companion `hopline-http` crate.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use hopline::{Loop, TcpServer};
//!
//! fn main() -> Result<(), hopline::Error> {
//!     let lp = Loop::new()?;
//!     let server = TcpServer::new(&lp, "127.0.0.1", 7878)?;
//!     server.on_connect(|conn| {
//!         let writer = conn.clone();
//!         conn.on_data(move |chunk| writer.write(chunk));
//!         conn.pause(false);
//!     });
//!     lp.run()
//! }
//! ```
//!
//! # Model
//!
//! Everything runs on one thread. Callbacks must not block; an operation
//! that would block registers interest with the loop and returns. Multiple
//! independent loops may coexist (one per thread); nothing here is `Send`.
//!
//! # Platform
//!
//! POSIX. Uses epoll on Linux, kqueue on macOS/BSD, and poll(2) elsewhere;
//! the poll backend is available everywhere via
//! [`Loop::with_portable_backend`].

pub(crate) mod sys;

pub mod config;
pub mod error;
pub mod event_loop;
pub mod events;
pub mod metrics;
pub mod poller;
pub mod stream;
pub mod tcp;
pub mod timer;

// ── Re-exports: loop ────────────────────────────────────────────────────

/// Loop configuration.
pub use config::Config;
/// Builder for [`Config`] with `build()` validation.
pub use config::ConfigBuilder;
/// Crate error type.
pub use error::Error;
/// The event loop handle.
pub use event_loop::Loop;
/// Readiness sink for registered fds.
pub use event_loop::EventSink;
/// The lazily-initialized loop for the current thread.
pub use event_loop::default_loop;
/// Cancellation handle for a scheduled callback.
pub use timer::TimeoutHandle;

// ── Re-exports: events ──────────────────────────────────────────────────

/// Typed listener list for one event kind.
pub use events::Event;
/// Token for removing a listener.
pub use events::ListenerId;

// ── Re-exports: readiness ───────────────────────────────────────────────

/// Watched event set for an fd.
pub use poller::Interest;
/// Reported event set for an fd.
pub use poller::Readiness;

// ── Re-exports: transport ───────────────────────────────────────────────

/// Socket-error detail carried by a `close` event.
pub use stream::CloseError;
/// Failure to establish a stream.
pub use stream::ConnectError;
/// Kind of connection failure.
pub use stream::ConnectErrorKind;
/// Dialer capability (TLS seam).
pub use stream::Connector;
/// Established-stream capability (TLS seam).
pub use stream::Stream;
/// An asynchronous TCP client.
pub use tcp::TcpClient;
/// An established TCP connection.
pub use tcp::TcpConnection;
/// Plain-TCP [`Connector`].
pub use tcp::TcpConnector;
/// An asynchronous TCP server.
pub use tcp::TcpServer;
