//! Streaming HTTP/1.1 for the hopline event loop.
//!
//! A push parser and frame serializer drive client and server exchanges
//! as event streams over hopline's TCP transport: no request or response
//! is ever buffered whole. The client pools idle connections per origin
//! and transparently retries idempotent requests that fail before any
//! response byte arrives; the server runs strictly serial exchanges per
//! connection with pipelined bytes held back.
//!
//! # Client
//!
//! ```rust,no_run
//! use hopline::Loop;
//! use hopline_http::HttpClient;
//!
//! fn main() -> Result<(), hopline::Error> {
//!     let lp = Loop::new()?;
//!     let client = HttpClient::new(&lp);
//!     let exchange = client.exchange();
//!     exchange.on_response_start(|(status, phrase, _headers)| {
//!         println!("{status} {phrase}");
//!     });
//!     exchange.on_response_body(|chunk| print!("{}", String::from_utf8_lossy(&chunk)));
//!     let lp2 = lp.clone();
//!     exchange.on_response_done(move |_trailers| lp2.stop());
//!     exchange.request_start("GET", "http://example.com/", vec![]);
//!     exchange.request_done(vec![]);
//!     lp.run()
//! }
//! ```
//!
//! # Server
//!
//! ```rust,no_run
//! use hopline::Loop;
//! use hopline_http::HttpServer;
//!
//! fn main() -> Result<(), hopline::Error> {
//!     let lp = Loop::new()?;
//!     let server = HttpServer::new(&lp, "127.0.0.1", 8000)?;
//!     server.on_exchange(|exchange| {
//!         let responder = exchange.clone();
//!         exchange.on_request_done(move |_trailers| {
//!             responder.response_start(200, "OK", vec![]);
//!             responder.response_body(&b"hello\n"[..]);
//!             responder.response_done(vec![]);
//!         });
//!     });
//!     lp.run()
//! }
//! ```

pub mod client;
pub mod error;
pub mod exchange;
pub mod headers;
pub mod message;
pub mod metrics;
pub(crate) mod pool;
pub mod server;
pub mod uri;

/// Pooled, retrying HTTP/1.1 client.
pub use client::HttpClient;
/// One request/response pair on a client.
pub use client::HttpClientExchange;
/// Terminal failure delivered through a client exchange's `error` event.
pub use error::ExchangeError;
/// Engine error kinds.
pub use error::HttpError;
/// Exchange lifecycle states.
pub use exchange::ExchangeState;
/// One header field.
pub use headers::Header;
/// An ordered header list.
pub use headers::Headers;
/// Header-list inspection utilities.
pub use headers::{get_header, header, header_dict, header_names};
/// Streaming message parser.
pub use message::MessageParser;
/// Parser output events.
pub use message::ParserEvent;
/// Parsed start line.
pub use message::StartLine;
/// HTTP version on the wire.
pub use message::Version;
/// HTTP/1.1 server.
pub use server::HttpServer;
/// One request/response pair on a server.
pub use server::HttpServerExchange;
/// Pool key.
pub use uri::Origin;
/// URI scheme.
pub use uri::Scheme;
/// URI splitting for the client.
pub use uri::parse_uri;
