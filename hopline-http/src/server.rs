//! The HTTP/1.1 server.
//!
//! [`HttpServer`] wraps a TCP server. Each accepted connection gets a
//! request parser; when a request's start line and headers arrive, the
//! server emits `exchange(HttpServerExchange)`. The handler subscribes to
//! `request_start` / `request_body` / `request_done` on the exchange and
//! answers with `response_start`, `response_body`, `response_done`.
//!
//! Exchanges on one connection are strictly serial: pipelined requests
//! are buffered (and the read side paused) until the previous response
//! completes. Keep-alive follows HTTP/1.1 defaults and honors
//! `Connection: close` in either direction; idle connections age out.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hopline::{Error, ListenerId, Loop, Stream, TcpConnection, TcpServer, TimeoutHandle};
use log::{debug, warn};

use crate::error::HttpError;
use crate::exchange::{ExchangeState, Step};
use crate::headers::{self, Headers};
use crate::message::{
    Delimiter, MessageParser, ParserEvent, StartLine, Version, serialize_chunk, serialize_head,
    serialize_last_chunk,
};
use crate::metrics;

/// An asynchronous HTTP/1.1 server.
///
/// Emits `exchange(HttpServerExchange)` for every request, plus `start`
/// and `stop`.
#[derive(Clone)]
pub struct HttpServer {
    inner: Rc<ServerInner>,
}

struct ServerInner {
    lp: Loop,
    tcp: TcpServer,
    idle_timeout: Cell<Option<Duration>>,
    exchange_ev: hopline::Event<HttpServerExchange>,
    start_ev: hopline::Event<()>,
    stop_ev: hopline::Event<()>,
}

impl HttpServer {
    /// Bind `host:port` and start serving on `lp`.
    pub fn new(lp: &Loop, host: &str, port: u16) -> Result<HttpServer, Error> {
        let tcp = TcpServer::new(lp, host, port)?;
        let inner = Rc::new(ServerInner {
            lp: lp.clone(),
            tcp: tcp.clone(),
            idle_timeout: Cell::new(Some(Duration::from_secs(60))),
            exchange_ev: hopline::Event::new(),
            start_ev: hopline::Event::new(),
            stop_ev: hopline::Event::new(),
        });
        {
            let server = inner.clone();
            tcp.on_connect(move |conn| ServerConn::attach(&server, conn));
        }
        {
            let emitter = inner.clone();
            lp.schedule(Duration::ZERO, move || emitter.start_ev.emit(()));
        }
        Ok(HttpServer { inner })
    }

    /// How long a connection may sit idle between exchanges.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.inner.idle_timeout.set(timeout);
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Error> {
        self.inner.tcp.local_addr()
    }

    /// Stop accepting connections. In-flight exchanges are unaffected.
    pub fn close(&self) {
        self.inner.tcp.close();
        self.inner.stop_ev.emit(());
        self.inner.exchange_ev.clear();
        self.inner.start_ev.clear();
        self.inner.stop_ev.clear();
    }

    pub fn on_exchange(&self, listener: impl FnMut(HttpServerExchange) + 'static) -> ListenerId {
        self.inner.exchange_ev.on(listener)
    }

    pub fn on_start(&self, listener: impl FnMut(()) + 'static) -> ListenerId {
        self.inner.start_ev.on(listener)
    }

    pub fn on_stop(&self, listener: impl FnMut(()) + 'static) -> ListenerId {
        self.inner.stop_ev.on(listener)
    }
}

/// Per-connection server state: the parser, the exchange in flight, and
/// any parsed-but-not-yet-surfaced pipelined events.
struct ServerConn {
    server: Rc<ServerInner>,
    stream: RefCell<Option<Rc<dyn Stream>>>,
    parser: RefCell<MessageParser>,
    pending: RefCell<VecDeque<ParserEvent>>,
    active: RefCell<Option<Rc<ServerExchangeInner>>>,
    idle_timer: RefCell<Option<TimeoutHandle>>,
    closed: Cell<bool>,
    errored: Cell<bool>,
    /// A response has begun on this connection (controls the error path).
    response_started: Cell<bool>,
    /// Reads paused while a pipelined request waits for the active one.
    held: Cell<bool>,
    /// Reads paused at the handler's request.
    user_paused: Cell<bool>,
}

impl ServerConn {
    fn attach(server: &Rc<ServerInner>, conn: TcpConnection) {
        let stream: Rc<dyn Stream> = Rc::new(conn);
        let sc = Rc::new(ServerConn {
            server: server.clone(),
            stream: RefCell::new(Some(stream.clone())),
            parser: RefCell::new(MessageParser::request()),
            pending: RefCell::new(VecDeque::new()),
            active: RefCell::new(None),
            idle_timer: RefCell::new(None),
            closed: Cell::new(false),
            errored: Cell::new(false),
            response_started: Cell::new(false),
            held: Cell::new(false),
            user_paused: Cell::new(false),
        });
        {
            let sc = sc.clone();
            stream.on_data(Box::new(move |chunk| ServerConn::handle_data(&sc, chunk)));
        }
        {
            let sc = sc.clone();
            stream.on_close(Box::new(move |reason| {
                if let Some(err) = reason {
                    debug!("server connection lost: {err}");
                }
                ServerConn::handle_closed(&sc);
            }));
        }
        {
            let sc = sc.clone();
            stream.on_pause(Box::new(move |paused| {
                // Write-side backpressure, relayed to the handler.
                let exchange = sc.active.borrow().clone();
                if let Some(exchange) = exchange {
                    exchange.pause_ev.emit(paused);
                }
            }));
        }
        ServerConn::arm_idle(&sc);
        stream.pause(false);
    }

    fn handle_data(this: &Rc<Self>, chunk: Bytes) {
        if this.closed.get() || this.errored.get() {
            return;
        }
        ServerConn::cancel_idle(this);
        let events = this.parser.borrow_mut().feed(&chunk);
        this.pending.borrow_mut().extend(events);
        ServerConn::drain(this);
    }

    fn drain(this: &Rc<Self>) {
        loop {
            if this.closed.get() || this.errored.get() {
                return;
            }
            // A pipelined request waits until the active exchange is done.
            {
                let pending = this.pending.borrow();
                let active = this.active.borrow();
                if active.is_some()
                    && matches!(pending.front(), Some(ParserEvent::Start { .. }))
                {
                    drop(pending);
                    drop(active);
                    ServerConn::hold(this, true);
                    return;
                }
            }
            let Some(event) = this.pending.borrow_mut().pop_front() else {
                break;
            };
            match event {
                ParserEvent::Start { line, headers } => {
                    let StartLine::Request {
                        method,
                        target,
                        version,
                    } = line
                    else {
                        continue;
                    };
                    if version == Version::Http11
                        && !headers::header_names(&headers).contains(b"host".as_slice())
                    {
                        ServerConn::handle_protocol_error(this, HttpError::HostRequired);
                        return;
                    }
                    let tokens = headers::connection_tokens(&headers);
                    let close = tokens.iter().any(|t| t == b"close");
                    let keep_alive = tokens.iter().any(|t| t == b"keep-alive");
                    let reusable =
                        !close && (version == Version::Http11 || keep_alive);

                    let exchange = Rc::new(ServerExchangeInner {
                        conn: RefCell::new(Some(this.clone())),
                        method,
                        target,
                        version,
                        req_headers: headers,
                        state: Cell::new(ExchangeState::RequestStarted),
                        delimiter: Cell::new(Delimiter::None),
                        reusable: Cell::new(reusable),
                        request_start_ev: hopline::Event::new(),
                        request_body_ev: hopline::Event::new(),
                        request_done_ev: hopline::Event::new(),
                        pause_ev: hopline::Event::new(),
                    });
                    *this.active.borrow_mut() = Some(exchange.clone());
                    metrics::SERVER_EXCHANGES.increment();
                    // Surface the exchange first so handlers can subscribe,
                    // then deliver request_start to those subscribers.
                    this.server.exchange_ev.emit(HttpServerExchange {
                        inner: exchange.clone(),
                    });
                    exchange.request_start_ev.emit((
                        exchange.method.clone(),
                        exchange.target.clone(),
                        exchange.req_headers.clone(),
                    ));
                }
                ParserEvent::Body(chunk) => {
                    let exchange = this.active.borrow().clone();
                    if let Some(exchange) = exchange {
                        if let Some(next) = exchange.state.get().advance(Step::ReqBody) {
                            exchange.state.set(next);
                        }
                        exchange.request_body_ev.emit(chunk);
                    }
                }
                ParserEvent::End { trailers } => {
                    let exchange = this.active.borrow().clone();
                    if let Some(exchange) = exchange {
                        if let Some(next) = exchange.state.get().advance(Step::ReqDone) {
                            exchange.state.set(next);
                        }
                        exchange.request_done_ev.emit(trailers);
                    }
                }
                ParserEvent::Error(err) => {
                    metrics::PROTOCOL_ERRORS.increment();
                    ServerConn::handle_protocol_error(this, err);
                    return;
                }
            }
        }

        // Nothing left held back; let bytes flow for whatever comes next
        // (including the active exchange's body).
        ServerConn::hold(this, false);
        if this.active.borrow().is_none() && this.pending.borrow().is_empty() {
            ServerConn::arm_idle(this);
        }
    }

    /// Called by the active exchange once its response is complete.
    fn exchange_finished(this: &Rc<Self>, reusable: bool) {
        this.active.borrow_mut().take();
        if this.closed.get() {
            return;
        }
        if !reusable {
            let stream = this.stream.borrow().clone();
            if let Some(stream) = stream {
                stream.close();
            }
            return;
        }
        // Surface the next pipelined request, if one is already parsed.
        ServerConn::drain(this);
    }

    fn handle_protocol_error(this: &Rc<Self>, err: HttpError) {
        this.errored.set(true);
        this.pending.borrow_mut().clear();
        this.active.borrow_mut().take();

        if this.response_started.get() {
            // Mid-response there is nothing safe left to say.
            debug!("protocol error mid-response, closing: {err}");
            let stream = this.stream.borrow().clone();
            if let Some(stream) = stream {
                stream.close();
            }
            return;
        }
        let (status, phrase) = err.server_status().unwrap_or((400, "Bad Request"));
        debug!("request rejected with {status}: {err}");
        let body = err.to_string();
        let mut out = BytesMut::new();
        serialize_head(
            &mut out,
            &format!("HTTP/1.1 {status} {phrase}"),
            &[
                headers::header("Content-Type", "text/plain"),
                headers::header("Content-Length", &body.len().to_string()),
                headers::header("Connection", "close"),
            ],
        );
        out.extend_from_slice(body.as_bytes());
        let stream = this.stream.borrow().clone();
        if let Some(stream) = stream {
            stream.write(out.freeze());
            stream.close();
        }
    }

    fn handle_closed(this: &Rc<Self>) {
        this.closed.set(true);
        this.pending.borrow_mut().clear();
        ServerConn::cancel_idle(this);
        if let Some(exchange) = this.active.borrow_mut().take() {
            exchange.conn.borrow_mut().take();
        }
        this.stream.borrow_mut().take();
    }

    fn hold(this: &Rc<Self>, held: bool) {
        if this.held.replace(held) != held {
            ServerConn::sync_pause(this);
        }
    }

    fn set_user_paused(this: &Rc<Self>, paused: bool) {
        if this.user_paused.replace(paused) != paused {
            ServerConn::sync_pause(this);
        }
    }

    fn sync_pause(this: &Rc<Self>) {
        if let Some(stream) = &*this.stream.borrow() {
            stream.pause(this.held.get() || this.user_paused.get());
        }
    }

    fn arm_idle(this: &Rc<Self>) {
        ServerConn::cancel_idle(this);
        let Some(timeout) = this.server.idle_timeout.get() else {
            return;
        };
        let sc = Rc::downgrade(this);
        let handle = this.server.lp.schedule(timeout, move || {
            if let Some(sc) = sc.upgrade()
                && !sc.closed.get()
                && sc.active.borrow().is_none()
            {
                debug!("closing idle server connection");
                let stream = sc.stream.borrow().clone();
                if let Some(stream) = stream {
                    stream.close();
                }
            }
        });
        *this.idle_timer.borrow_mut() = Some(handle);
    }

    fn cancel_idle(this: &Rc<Self>) {
        if let Some(handle) = this.idle_timer.borrow_mut().take() {
            handle.delete();
        }
    }

    fn write(&self, data: Bytes) {
        let stream = self.stream.borrow().clone();
        if let Some(stream) = stream {
            stream.write(data);
        }
    }
}

struct ServerExchangeInner {
    conn: RefCell<Option<Rc<ServerConn>>>,
    method: String,
    target: String,
    version: Version,
    req_headers: Headers,
    state: Cell<ExchangeState>,
    delimiter: Cell<Delimiter>,
    /// Both sides still allow keep-alive.
    reusable: Cell<bool>,
    request_start_ev: hopline::Event<(String, String, Headers)>,
    request_body_ev: hopline::Event<Bytes>,
    request_done_ev: hopline::Event<Headers>,
    pause_ev: hopline::Event<bool>,
}

/// A request/response interaction on an [`HttpServer`].
///
/// Emits `request_start(method, target, headers)`, `request_body(chunk)`,
/// `request_done(trailers)`, and `pause(bool)` for response backpressure.
#[derive(Clone)]
pub struct HttpServerExchange {
    inner: Rc<ServerExchangeInner>,
}

impl HttpServerExchange {
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.req_headers
    }

    pub fn state(&self) -> ExchangeState {
        self.inner.state.get()
    }

    pub fn on_request_start(
        &self,
        listener: impl FnMut((String, String, Headers)) + 'static,
    ) -> ListenerId {
        self.inner.request_start_ev.on(listener)
    }

    pub fn on_request_body(&self, listener: impl FnMut(Bytes) + 'static) -> ListenerId {
        self.inner.request_body_ev.on(listener)
    }

    pub fn on_request_done(&self, listener: impl FnMut(Headers) + 'static) -> ListenerId {
        self.inner.request_done_ev.on(listener)
    }

    /// Response-body backpressure: stop writing on `true`, resume on
    /// `false`.
    pub fn on_pause(&self, listener: impl FnMut(bool) + 'static) -> ListenerId {
        self.inner.pause_ev.on(listener)
    }

    /// Pause or resume delivery of `request_body` events.
    pub fn pause(&self, paused: bool) {
        if let Some(conn) = &*self.inner.conn.borrow() {
            ServerConn::set_user_paused(conn, paused);
        }
    }

    /// Begin the response. Must be called exactly once per exchange.
    ///
    /// Hop-by-hop headers are stripped; framing headers are chosen from
    /// the supplied `Content-Length` (counted), the request's HTTP version
    /// (chunked on 1.1), or connection close (1.0 without a length).
    pub fn response_start(&self, status: u16, phrase: &str, headers: Headers) {
        let inner = &self.inner;
        let Some(next) = inner.state.get().advance(Step::ResStart) else {
            warn!("response_start in state {:?} ignored", inner.state.get());
            return;
        };
        inner.state.set(next);

        let mut hdrs = headers::strip_hop_by_hop(&headers);
        let body_len = headers::get_header(&hdrs, "content-length")
            .first()
            .and_then(|v| std::str::from_utf8(v).ok()?.trim().parse::<u64>().ok());

        let delimiter = if body_len.is_some() {
            Delimiter::Counted
        } else if inner.version == Version::Http11 {
            hdrs.push(headers::header("Transfer-Encoding", "chunked"));
            Delimiter::Chunked
        } else {
            Delimiter::Close
        };
        inner.delimiter.set(delimiter);
        if delimiter == Delimiter::Close {
            inner.reusable.set(false);
        }
        if inner.reusable.get() {
            hdrs.push(headers::header("Connection", "keep-alive"));
        } else {
            hdrs.push(headers::header("Connection", "close"));
        }

        let mut out = BytesMut::new();
        serialize_head(&mut out, &format!("HTTP/1.1 {status} {phrase}"), &hdrs);
        if let Some(conn) = &*inner.conn.borrow() {
            conn.response_started.set(true);
            conn.write(out.freeze());
        }
    }

    /// Send part of the response body. May be called zero or more times.
    pub fn response_body(&self, chunk: impl Into<Bytes>) {
        let inner = &self.inner;
        let Some(next) = inner.state.get().advance(Step::ResBody) else {
            warn!("response_body in state {:?} ignored", inner.state.get());
            return;
        };
        inner.state.set(next);
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        let data = match inner.delimiter.get() {
            Delimiter::Chunked => {
                let mut out = BytesMut::new();
                serialize_chunk(&mut out, &chunk);
                out.freeze()
            }
            _ => chunk,
        };
        if let Some(conn) = &*inner.conn.borrow() {
            conn.write(data);
        }
    }

    /// Finish the response, with optional trailers (chunked only). Must be
    /// called exactly once per exchange.
    pub fn response_done(&self, trailers: Headers) {
        let inner = &self.inner;
        let Some(next) = inner.state.get().advance(Step::ResDone) else {
            warn!("response_done in state {:?} ignored", inner.state.get());
            return;
        };
        inner.state.set(next);

        let conn = inner.conn.borrow_mut().take();
        let Some(conn) = conn else {
            return;
        };
        match inner.delimiter.get() {
            Delimiter::Chunked => {
                let mut out = BytesMut::new();
                serialize_last_chunk(&mut out, &trailers);
                conn.write(out.freeze());
            }
            Delimiter::Close => {
                let stream = conn.stream.borrow().clone();
                if let Some(stream) = stream {
                    stream.close();
                }
            }
            Delimiter::Counted | Delimiter::None => {}
        }
        conn.response_started.set(false);
        ServerConn::exchange_finished(&conn, inner.reusable.get());

        inner.request_start_ev.clear();
        inner.request_body_ev.clear();
        inner.request_done_ev.clear();
        inner.pause_ev.clear();
    }
}
