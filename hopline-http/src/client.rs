//! The HTTP/1.1 client.
//!
//! [`HttpClient`] holds configuration, the connector pair (plain TCP plus
//! an optional TLS seam), and the shared idle-connection pool. Each
//! request/response runs as an [`HttpClientExchange`]: start the request,
//! stream the body, and listen for `response_start` / `response_body` /
//! `response_done` — or a single terminal `error`.
//!
//! Failures that occur before any response byte has arrived are retried
//! automatically for idempotent methods, up to the retry limit, after a
//! short delay; retries are invisible to the listener.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hopline::{
    CloseError, ConnectError, Connector, ListenerId, Loop, Stream, TcpConnector, TimeoutHandle,
};
use log::{debug, warn};

use crate::error::{ExchangeError, HttpError};
use crate::exchange::{ExchangeState, Step};
use crate::headers::{self, Headers};
use crate::message::{
    Delimiter, MessageParser, ParserEvent, StartLine, Version, serialize_chunk, serialize_head,
    serialize_last_chunk,
};
use crate::metrics;
use crate::pool::{Pool, SharedPool};
use crate::uri::{Origin, Scheme, SplitUri, parse_uri};

/// An asynchronous HTTP/1.1 client with connection pooling and retry.
#[derive(Clone)]
pub struct HttpClient {
    inner: Rc<ClientInner>,
}

pub(crate) struct ClientInner {
    lp: Loop,
    connect_timeout: Cell<Option<Duration>>,
    read_timeout: Cell<Option<Duration>>,
    idle_timeout: Cell<Option<Duration>>,
    retry_limit: Cell<u32>,
    retry_delay: Cell<Duration>,
    proxy: RefCell<Option<(String, u16)>>,
    pool: SharedPool,
    plain: Rc<dyn Connector>,
    secure: RefCell<Option<Rc<dyn Connector>>>,
}

impl HttpClient {
    pub fn new(lp: &Loop) -> HttpClient {
        let inner = Rc::new(ClientInner {
            lp: lp.clone(),
            connect_timeout: Cell::new(None),
            read_timeout: Cell::new(None),
            idle_timeout: Cell::new(Some(Duration::from_secs(60))),
            retry_limit: Cell::new(2),
            retry_delay: Cell::new(Duration::from_millis(500)),
            proxy: RefCell::new(None),
            pool: Pool::new(),
            plain: Rc::new(TcpConnector),
            secure: RefCell::new(None),
        });
        // Idle connections die with the loop.
        let pool = Rc::downgrade(&inner.pool);
        lp.on_stop(move |()| {
            if let Some(pool) = pool.upgrade() {
                Pool::close_idle(&pool);
            }
        });
        HttpClient { inner }
    }

    /// Timeout for establishing a connection. `None` waits on the OS.
    pub fn set_connect_timeout(&self, timeout: Option<Duration>) {
        self.inner.connect_timeout.set(timeout);
    }

    /// Timeout re-armed on every received byte. `None` disables it.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.inner.read_timeout.set(timeout);
    }

    /// How long an idle connection stays pooled. `None` disables pooling
    /// entirely.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.inner.idle_timeout.set(timeout);
    }

    /// Maximum automatic retries per exchange.
    pub fn set_retry_limit(&self, limit: u32) {
        self.inner.retry_limit.set(limit);
    }

    /// Delay before an automatic retry.
    pub fn set_retry_delay(&self, delay: Duration) {
        self.inner.retry_delay.set(delay);
    }

    /// Send every request through a next-hop proxy instead of dialing the
    /// request origin directly.
    pub fn set_proxy(&self, host: &str, port: u16) {
        *self.inner.proxy.borrow_mut() = Some((host.to_string(), port));
    }

    /// Install the connector used for `https` origins (the TLS seam).
    pub fn set_secure_connector(&self, connector: Rc<dyn Connector>) {
        *self.inner.secure.borrow_mut() = Some(connector);
    }

    /// Idle pooled connections across all origins (diagnostics).
    pub fn idle_connections(&self) -> usize {
        Pool::idle_total(&self.inner.pool)
    }

    /// Open connections for `origin`, pooled or in use (diagnostics).
    pub fn origin_connections(&self, origin: &Origin) -> usize {
        Pool::count(&self.inner.pool, origin)
    }

    /// Create a fresh exchange in the quiescent state.
    pub fn exchange(&self) -> HttpClientExchange {
        HttpClientExchange {
            inner: Rc::new(ExchangeInner {
                client: self.inner.clone(),
                state: Cell::new(ExchangeState::Quiescent),
                method: RefCell::new(String::new()),
                uri: RefCell::new(String::new()),
                user_headers: RefCell::new(Vec::new()),
                split: RefCell::new(None),
                pool_key: RefCell::new(None),
                stream: RefCell::new(None),
                listener_ids: Cell::new(None),
                parser: RefCell::new(MessageParser::response()),
                delimiter: Cell::new(Delimiter::None),
                req_started: Cell::new(false),
                unsent: RefCell::new(BytesMut::new()),
                sent_log: RefCell::new(BytesMut::new()),
                attempts: Cell::new(0),
                response_byte_seen: Cell::new(false),
                conn_reusable: Cell::new(false),
                read_timeout_ev: RefCell::new(None),
                finished: Cell::new(false),
                response_start_ev: hopline::Event::new(),
                response_body_ev: hopline::Event::new(),
                response_done_ev: hopline::Event::new(),
                error_ev: hopline::Event::new(),
                pause_ev: hopline::Event::new(),
            }),
        }
    }
}

/// One request/response pair on an [`HttpClient`].
#[derive(Clone)]
pub struct HttpClientExchange {
    inner: Rc<ExchangeInner>,
}

struct ExchangeInner {
    client: Rc<ClientInner>,
    state: Cell<ExchangeState>,
    method: RefCell<String>,
    uri: RefCell<String>,
    user_headers: RefCell<Headers>,
    split: RefCell<Option<SplitUri>>,
    /// Origin the connection is keyed and dialed by (the proxy's, when one
    /// is configured).
    pool_key: RefCell<Option<Origin>>,
    stream: RefCell<Option<Rc<dyn Stream>>>,
    listener_ids: Cell<Option<(ListenerId, ListenerId, ListenerId)>>,
    parser: RefCell<MessageParser>,
    delimiter: Cell<Delimiter>,
    req_started: Cell<bool>,
    /// Serialized output not yet handed to a connection.
    unsent: RefCell<BytesMut>,
    /// Everything serialized for this request, kept for idempotent
    /// re-submission.
    sent_log: RefCell<BytesMut>,
    attempts: Cell<u32>,
    response_byte_seen: Cell<bool>,
    conn_reusable: Cell<bool>,
    read_timeout_ev: RefCell<Option<TimeoutHandle>>,
    finished: Cell<bool>,
    response_start_ev: hopline::Event<(u16, String, Headers)>,
    response_body_ev: hopline::Event<Bytes>,
    response_done_ev: hopline::Event<Headers>,
    error_ev: hopline::Event<ExchangeError>,
    pause_ev: hopline::Event<bool>,
}

impl HttpClientExchange {
    /// Begin a request. The connection is drawn from the pool or dialed;
    /// the request line and headers are queued and transmitted once it is
    /// ready.
    pub fn request_start(&self, method: &str, uri: &str, headers: Headers) {
        let inner = &self.inner;
        let Some(next) = inner.state.get().advance(Step::ReqStart) else {
            warn!("request_start in state {:?} ignored", inner.state.get());
            return;
        };
        inner.state.set(next);
        metrics::CLIENT_EXCHANGES.increment();

        *inner.method.borrow_mut() = method.to_string();
        *inner.uri.borrow_mut() = uri.to_string();
        *inner.user_headers.borrow_mut() = headers;
        inner
            .parser
            .borrow_mut()
            .set_head_request(method == "HEAD");

        match parse_uri(uri) {
            Ok(split) => {
                let origin = match &*inner.client.proxy.borrow() {
                    Some((host, port)) => Origin {
                        scheme: Scheme::Http,
                        host: host.clone(),
                        port: *port,
                    },
                    None => split.origin.clone(),
                };
                *inner.split.borrow_mut() = Some(split);
                *inner.pool_key.borrow_mut() = Some(origin);
                ExchangeInner::start_attempt(inner);
            }
            Err(err) => {
                // Deferred so listeners attached right after this call
                // still see the event.
                let ex = inner.clone();
                inner
                    .client
                    .lp
                    .schedule(Duration::ZERO, move || ExchangeInner::emit_error(&ex, err));
            }
        }
    }

    /// Send part of the request body. May be called zero or more times
    /// between `request_start` and `request_done`.
    pub fn request_body(&self, chunk: impl Into<Bytes>) {
        let inner = &self.inner;
        let Some(next) = inner.state.get().advance(Step::ReqBody) else {
            warn!("request_body in state {:?} ignored", inner.state.get());
            return;
        };
        if !inner.req_started.get() {
            ExchangeInner::send_request_head(inner, true);
        }
        inner.state.set(next);
        let chunk = chunk.into();
        let mut out = BytesMut::new();
        match inner.delimiter.get() {
            Delimiter::Chunked => serialize_chunk(&mut out, &chunk),
            Delimiter::Counted => out.extend_from_slice(&chunk),
            Delimiter::None | Delimiter::Close => {
                warn!("request_body without a body delimiter ignored");
                return;
            }
        }
        ExchangeInner::output(inner, out.freeze());
    }

    /// Terminate the request, with optional trailers (chunked bodies
    /// only). Must be called exactly once per exchange.
    pub fn request_done(&self, trailers: Headers) {
        let inner = &self.inner;
        let Some(next) = inner.state.get().advance(Step::ReqDone) else {
            warn!("request_done in state {:?} ignored", inner.state.get());
            return;
        };
        if !inner.req_started.get() {
            ExchangeInner::send_request_head(inner, false);
        }
        inner.state.set(next);
        if inner.delimiter.get() == Delimiter::Chunked {
            let mut out = BytesMut::new();
            serialize_last_chunk(&mut out, &trailers);
            ExchangeInner::output(inner, out.freeze());
        }
    }

    /// Pause or resume delivery of `response_body` events.
    pub fn pause(&self, paused: bool) {
        if let Some(stream) = &*self.inner.stream.borrow() {
            stream.pause(paused);
        }
    }

    /// Abort the exchange: the read timeout is cancelled, the connection
    /// is closed rather than pooled, and no further events are emitted.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.finished.replace(true) {
            return;
        }
        inner.state.set(ExchangeState::Done);
        ExchangeInner::cancel_read_timeout(inner);
        ExchangeInner::discard_stream(inner);
        ExchangeInner::clear_events(inner);
    }

    pub fn state(&self) -> ExchangeState {
        self.inner.state.get()
    }

    /// Attempts made so far (0 until the first retry).
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.get()
    }

    pub fn on_response_start(
        &self,
        listener: impl FnMut((u16, String, Headers)) + 'static,
    ) -> ListenerId {
        self.inner.response_start_ev.on(listener)
    }

    pub fn on_response_body(&self, listener: impl FnMut(Bytes) + 'static) -> ListenerId {
        self.inner.response_body_ev.on(listener)
    }

    pub fn on_response_done(&self, listener: impl FnMut(Headers) + 'static) -> ListenerId {
        self.inner.response_done_ev.on(listener)
    }

    /// The terminal `error` event. At most one is emitted per exchange,
    /// always with `client_recoverable` false, and nothing follows it.
    pub fn on_error(&self, listener: impl FnMut(ExchangeError) + 'static) -> ListenerId {
        self.inner.error_ev.on(listener)
    }

    /// Request-body backpressure, relayed from the connection: stop
    /// sending on `true`, resume on `false`.
    pub fn on_pause(&self, listener: impl FnMut(bool) + 'static) -> ListenerId {
        self.inner.pause_ev.on(listener)
    }
}

impl ExchangeInner {
    fn start_attempt(this: &Rc<Self>) {
        let Some(origin) = this.pool_key.borrow().clone() else {
            return;
        };
        if let Some(stream) = Pool::checkout(&this.client.pool, &origin) {
            ExchangeInner::attach(this, stream);
            return;
        }

        let connector: Rc<dyn Connector> = match origin.scheme {
            Scheme::Http => this.client.plain.clone(),
            Scheme::Https => match &*this.client.secure.borrow() {
                Some(connector) => connector.clone(),
                None => {
                    let err = HttpError::Url("no TLS connector configured for https".into());
                    ExchangeInner::emit_error(this, err);
                    return;
                }
            },
        };
        Pool::note_dial(&this.client.pool, &origin);
        let on_connect = {
            let ex = this.clone();
            Box::new(move |stream: Rc<dyn Stream>| ExchangeInner::attach(&ex, stream))
        };
        let on_error = {
            let ex = this.clone();
            Box::new(move |err: ConnectError| ExchangeInner::handle_connect_error(&ex, err))
        };
        connector.connect(
            &this.client.lp,
            &origin.host,
            origin.port,
            this.client.connect_timeout.get(),
            on_connect,
            on_error,
        );
    }

    fn attach(this: &Rc<Self>, stream: Rc<dyn Stream>) {
        if this.finished.get() {
            // The exchange was aborted while the dial was in flight.
            stream.close();
            ExchangeInner::note_dead(this);
            return;
        }
        let data_id = {
            let ex = this.clone();
            stream.on_data(Box::new(move |chunk| ExchangeInner::handle_data(&ex, chunk)))
        };
        let close_id = {
            let ex = this.clone();
            stream.on_close(Box::new(move |reason| {
                ExchangeInner::handle_conn_closed(&ex, reason)
            }))
        };
        let pause_id = {
            let ex = this.clone();
            stream.on_pause(Box::new(move |paused| ex.pause_ev.emit(paused)))
        };
        this.listener_ids.set(Some((data_id, close_id, pause_id)));
        *this.stream.borrow_mut() = Some(stream.clone());

        ExchangeInner::set_read_timeout(this, "connect");
        let queued = this.unsent.borrow_mut().split().freeze();
        if !queued.is_empty() {
            stream.write(queued);
        }
        stream.pause(false);
    }

    fn handle_connect_error(this: &Rc<Self>, err: ConnectError) {
        if let Some(origin) = this.pool_key.borrow().clone() {
            Pool::note_dead(&this.client.pool, &origin);
        }
        let err = if err.timed_out() {
            HttpError::ConnectTimeout
        } else {
            HttpError::Connect(err.to_string())
        };
        ExchangeInner::handle_failure(this, err);
    }

    fn handle_data(this: &Rc<Self>, chunk: Bytes) {
        if this.finished.get() {
            return;
        }
        this.response_byte_seen.set(true);
        ExchangeInner::cancel_read_timeout(this);

        let events = this.parser.borrow_mut().feed(&chunk);
        ExchangeInner::process_events(this, events);

        if !this.finished.get() {
            let phase = match this.state.get() {
                ExchangeState::ResponseStarted => "start",
                ExchangeState::ResponseBody => "body",
                _ => "connect",
            };
            ExchangeInner::set_read_timeout(this, phase);
        }
    }

    fn process_events(this: &Rc<Self>, events: Vec<ParserEvent>) {
        for event in events {
            if this.finished.get() {
                return;
            }
            match event {
                ParserEvent::Start { line, headers } => {
                    let StartLine::Response {
                        version,
                        status,
                        phrase,
                    } = line
                    else {
                        continue;
                    };
                    let tokens = headers::connection_tokens(&headers);
                    let close = tokens.iter().any(|t| t == b"close");
                    let keep_alive = tokens.iter().any(|t| t == b"keep-alive");
                    this.conn_reusable.set(
                        !close && (version == Version::Http11 || keep_alive),
                    );
                    if let Some(next) = this.state.get().advance(Step::ResStart) {
                        this.state.set(next);
                    }
                    this.response_start_ev.emit((status, phrase, headers));
                }
                ParserEvent::Body(chunk) => {
                    if let Some(next) = this.state.get().advance(Step::ResBody) {
                        this.state.set(next);
                    }
                    this.response_body_ev.emit(chunk);
                }
                ParserEvent::End { trailers } => {
                    ExchangeInner::handle_response_end(this, trailers);
                }
                ParserEvent::Error(err) => {
                    metrics::PROTOCOL_ERRORS.increment();
                    ExchangeInner::handle_failure(this, err);
                }
            }
        }
    }

    fn handle_response_end(this: &Rc<Self>, trailers: Headers) {
        ExchangeInner::cancel_read_timeout(this);
        this.state.set(ExchangeState::Done);
        this.finished.set(true);

        ExchangeInner::detach_listeners(this);
        let stream = this.stream.borrow_mut().take();
        if let Some(stream) = stream {
            let clean = this.parser.borrow().is_clean();
            if this.conn_reusable.get() && stream.is_connected() && clean {
                if let Some(origin) = this.pool_key.borrow().clone() {
                    Pool::checkin(
                        &this.client.pool,
                        &this.client.lp,
                        origin,
                        stream,
                        this.client.idle_timeout.get(),
                    );
                }
            } else {
                stream.close();
                ExchangeInner::note_dead(this);
            }
        }

        this.response_done_ev.emit(trailers);
        ExchangeInner::clear_events(this);
    }

    fn handle_conn_closed(this: &Rc<Self>, reason: Option<CloseError>) {
        if this.finished.get() {
            return;
        }
        ExchangeInner::cancel_read_timeout(this);
        this.listener_ids.set(None);
        this.stream.borrow_mut().take();
        ExchangeInner::note_dead(this);

        if this.parser.borrow().is_eof_delimited() {
            // Close is how an unframed response ends.
            let events = this.parser.borrow_mut().finish();
            ExchangeInner::process_events(this, events);
            return;
        }
        if !this.response_byte_seen.get() {
            let detail = match &reason {
                Some(err) => {
                    format!("server closed the connection before the response: {err}")
                }
                None => "server closed the connection before the response".to_string(),
            };
            ExchangeInner::handle_failure(this, HttpError::Connect(detail));
        } else {
            ExchangeInner::handle_failure(
                this,
                HttpError::UpstreamClose(reason.map(|err| err.detail)),
            );
        }
    }

    fn handle_read_timeout(this: &Rc<Self>, phase: &'static str) {
        if this.finished.get() {
            return;
        }
        ExchangeInner::handle_failure(this, HttpError::ReadTimeout(phase));
    }

    /// Discard the connection and either schedule a retry or surface the
    /// error.
    fn handle_failure(this: &Rc<Self>, err: HttpError) {
        if this.finished.get() {
            return;
        }
        ExchangeInner::cancel_read_timeout(this);
        ExchangeInner::discard_stream(this);

        let method = this.method.borrow().clone();
        let retryable = err.retryable_kind()
            && !this.response_byte_seen.get()
            && headers::is_idempotent(&method)
            && this.attempts.get() < this.client.retry_limit.get();
        if retryable {
            this.attempts.set(this.attempts.get() + 1);
            metrics::CLIENT_RETRIES.increment();
            debug!(
                "retrying {method} {} (attempt {}): {err}",
                this.uri.borrow(),
                this.attempts.get()
            );
            let ex = this.clone();
            this.client
                .lp
                .schedule(this.client.retry_delay.get(), move || {
                    ExchangeInner::retry(&ex)
                });
        } else {
            ExchangeInner::emit_error(this, err);
        }
    }

    fn retry(this: &Rc<Self>) {
        if this.finished.get() {
            return;
        }
        let head_request = *this.method.borrow() == "HEAD";
        let mut parser = MessageParser::response();
        parser.set_head_request(head_request);
        *this.parser.borrow_mut() = parser;
        this.conn_reusable.set(false);
        this.response_byte_seen.set(false);
        // Re-submit everything serialized so far, including any body the
        // caller has already streamed.
        let log = this.sent_log.borrow().clone();
        *this.unsent.borrow_mut() = log;
        ExchangeInner::start_attempt(this);
    }

    fn emit_error(this: &Rc<Self>, err: HttpError) {
        if this.finished.replace(true) {
            return;
        }
        this.state.set(this.state.get().fail());
        metrics::CLIENT_ERRORS.increment();
        ExchangeInner::cancel_read_timeout(this);
        ExchangeInner::discard_stream(this);
        // Only unrecoverable failures reach a listener; anything the
        // client could still retry was retried before getting here.
        this.error_ev.emit(ExchangeError {
            error: err,
            client_recoverable: false,
        });
        ExchangeInner::clear_events(this);
    }

    // ── Request serialization ───────────────────────────────────────────

    /// Queue the request line and headers. Called lazily from the first
    /// `request_body` / `request_done` so the body delimiter is known.
    fn send_request_head(this: &Rc<Self>, has_body: bool) {
        this.req_started.set(true);
        let split = this.split.borrow();
        let Some(split) = split.as_ref() else {
            return;
        };
        let method = this.method.borrow();

        let mut hdrs: Headers = headers::strip_hop_by_hop(&this.user_headers.borrow())
            .into_iter()
            .filter(|(name, _)| !headers::name_is(name, "host"))
            .collect();
        hdrs.push(headers::header("Host", &split.authority));
        if this.client.idle_timeout.get().is_some() {
            hdrs.push(headers::header("Connection", "keep-alive"));
        } else {
            hdrs.push(headers::header("Connection", "close"));
        }

        let delimiter = if headers::header_names(&hdrs).contains(b"content-length".as_slice()) {
            Delimiter::Counted
        } else if has_body {
            hdrs.push(headers::header("Transfer-Encoding", "chunked"));
            Delimiter::Chunked
        } else {
            Delimiter::None
        };
        this.delimiter.set(delimiter);

        let mut out = BytesMut::new();
        serialize_head(
            &mut out,
            &format!("{} {} HTTP/1.1", method, split.target),
            &hdrs,
        );
        ExchangeInner::output(this, out.freeze());
    }

    fn output(this: &Rc<Self>, data: Bytes) {
        if data.is_empty() {
            return;
        }
        this.sent_log.borrow_mut().extend_from_slice(&data);
        let stream = this
            .stream
            .borrow()
            .as_ref()
            .filter(|s| s.is_connected())
            .cloned();
        match stream {
            Some(stream) => stream.write(data),
            None => this.unsent.borrow_mut().extend_from_slice(&data),
        }
    }

    // ── Housekeeping ────────────────────────────────────────────────────

    fn set_read_timeout(this: &Rc<Self>, phase: &'static str) {
        let Some(timeout) = this.client.read_timeout.get() else {
            return;
        };
        let ex = this.clone();
        let handle = this
            .client
            .lp
            .schedule(timeout, move || ExchangeInner::handle_read_timeout(&ex, phase));
        if let Some(old) = this.read_timeout_ev.borrow_mut().replace(handle) {
            old.delete();
        }
    }

    fn cancel_read_timeout(this: &Rc<Self>) {
        if let Some(handle) = this.read_timeout_ev.borrow_mut().take() {
            handle.delete();
        }
    }

    fn detach_listeners(this: &Rc<Self>) {
        if let Some((data_id, close_id, pause_id)) = this.listener_ids.take()
            && let Some(stream) = &*this.stream.borrow()
        {
            stream.remove_data_listener(data_id);
            stream.remove_close_listener(close_id);
            stream.remove_pause_listener(pause_id);
        }
    }

    fn discard_stream(this: &Rc<Self>) {
        ExchangeInner::detach_listeners(this);
        let stream = this.stream.borrow_mut().take();
        if let Some(stream) = stream {
            stream.close();
            ExchangeInner::note_dead(this);
        }
    }

    fn note_dead(this: &Rc<Self>) {
        if let Some(origin) = this.pool_key.borrow().clone() {
            Pool::note_dead(&this.client.pool, &origin);
        }
    }

    fn clear_events(this: &Rc<Self>) {
        this.response_start_ev.clear();
        this.response_body_ev.clear();
        this.response_done_ev.clear();
        this.error_ev.clear();
        this.pause_ev.clear();
    }
}
