//! Push-based asynchronous TCP.
//!
//! The network connection pushes data to you (the `data` event), and you
//! push data to it with [`TcpConnection::write`]. Connections start
//! read-paused so listeners can be attached before any data flows; call
//! `pause(false)` to begin receiving.
//!
//! Backpressure runs both ways: pausing the read side lets the kernel
//! receive buffer fill, which TCP relays to the peer; on the write side the
//! `pause` event fires with `true` when the outgoing queue crosses its
//! high-water mark and with `false` once it drains below the low-water
//! mark. The signal is advisory — writes past the mark still buffer.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::ToSocketAddrs;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace, warn};

use crate::error::Error;
use crate::event_loop::{EventSink, Loop};
use crate::events::{Event, ListenerId};
use crate::metrics;
use crate::poller::Interest;
use crate::stream::{CloseError, ConnectError, Connector, Stream};
use crate::sys;
use crate::timer::TimeoutHandle;

// Bounds on per-readiness-event work, so one busy fd cannot starve the
// rest of a tick.
const MAX_READS_PER_EVENT: usize = 4;
const MAX_WRITES_PER_EVENT: usize = 16;

/// Outgoing byte queue: a deque of chunks plus an offset into the front
/// chunk.
#[derive(Default)]
struct WriteQueue {
    chunks: VecDeque<Bytes>,
    head: usize,
    total: usize,
}

impl WriteQueue {
    fn push(&mut self, data: Bytes) {
        self.total += data.len();
        self.chunks.push_back(data);
    }

    fn front_slice(&self) -> Option<&[u8]> {
        self.chunks.front().map(|chunk| &chunk[self.head..])
    }

    /// Consume `n` bytes from the front chunk. `n` never exceeds the front
    /// slice length.
    fn advance(&mut self, n: usize) {
        self.total -= n;
        self.head += n;
        if let Some(front) = self.chunks.front()
            && self.head == front.len()
        {
            self.chunks.pop_front();
            self.head = 0;
        }
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn total(&self) -> usize {
        self.total
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.head = 0;
        self.total = 0;
    }
}

struct ConnInner {
    lp: Loop,
    fd: RawFd,
    host: String,
    port: u16,
    connected: Cell<bool>,
    read_paused: Cell<bool>,
    closing: Cell<bool>,
    closed: Cell<bool>,
    output_paused: Cell<bool>,
    out: RefCell<WriteQueue>,
    read_chunk_size: usize,
    high_water: usize,
    low_water: usize,
    data_ev: Event<Bytes>,
    pause_ev: Event<bool>,
    close_ev: Event<Option<CloseError>>,
}

impl ConnInner {
    fn interest(&self) -> Interest {
        Interest {
            readable: !self.read_paused.get(),
            writable: !self.out.borrow().is_empty(),
        }
    }

    fn sync_interest(&self) {
        if !self.closed.get() {
            self.lp.update_interest(self.fd, self.interest());
        }
    }

    fn write(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        if self.closed.get() || self.closing.get() {
            debug!("write to closed connection {}:{} dropped", self.host, self.port);
            return;
        }
        let total = {
            let mut out = self.out.borrow_mut();
            out.push(data);
            out.total()
        };
        if !self.output_paused.get() && total > self.high_water {
            self.output_paused.set(true);
            self.pause_ev.emit(true);
        }
        self.sync_interest();
    }

    fn pause(&self, paused: bool) {
        if self.closed.get() {
            return;
        }
        self.read_paused.set(paused);
        self.sync_interest();
    }

    fn close(&self) {
        if self.closed.get() || self.closing.get() {
            return;
        }
        self.read_paused.set(true);
        if self.out.borrow().is_empty() {
            self.finish_close(None);
        } else {
            // Flush pending writes first; the writable handler finishes the
            // close once the queue drains.
            self.closing.set(true);
            self.sync_interest();
        }
    }

    /// Peer closed or the connection failed: pending writes are discarded.
    /// `reason` carries the socket error when one caused the close.
    fn handle_close(&self, reason: Option<CloseError>) {
        if self.closed.get() {
            return;
        }
        self.out.borrow_mut().clear();
        self.finish_close(reason);
    }

    /// Query SO_ERROR for a detail, then tear down.
    fn close_with_socket_error(&self) {
        let reason = sys::take_socket_error(self.fd)
            .ok()
            .flatten()
            .map(|err| CloseError::from_io(&err));
        self.handle_close(reason);
    }

    fn finish_close(&self, reason: Option<CloseError>) {
        if self.closed.replace(true) {
            return;
        }
        self.connected.set(false);
        self.lp.unregister(self.fd);
        sys::close(self.fd);
        metrics::CONNECTIONS_CLOSED.increment();
        self.close_ev.emit(reason);
        // Listener closures may hold handles back to this connection; drop
        // them so no reference cycle survives the close.
        self.data_ev.clear();
        self.pause_ev.clear();
        self.close_ev.clear();
    }
}

impl EventSink for ConnInner {
    fn on_readable(&self) {
        if self.closed.get() || self.read_paused.get() {
            return;
        }
        for _ in 0..MAX_READS_PER_EVENT {
            let mut buf = vec![0u8; self.read_chunk_size];
            match sys::read(self.fd, &mut buf) {
                Ok(0) => {
                    self.handle_close(None);
                    return;
                }
                Ok(n) => {
                    buf.truncate(n);
                    metrics::BYTES_RECEIVED.add(n as u64);
                    self.data_ev.emit(Bytes::from(buf));
                    // A listener may have paused or closed us.
                    if self.closed.get() || self.read_paused.get() {
                        return;
                    }
                    if n < self.read_chunk_size {
                        return;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.handle_close(Some(CloseError::from_io(&err)));
                    return;
                }
            }
        }
    }

    fn on_writable(&self) {
        if self.closed.get() {
            return;
        }
        for _ in 0..MAX_WRITES_PER_EVENT {
            let result = {
                let out = self.out.borrow();
                match out.front_slice() {
                    None => break,
                    Some(slice) => sys::write(self.fd, slice),
                }
            };
            match result {
                Ok(0) => break,
                Ok(n) => {
                    self.out.borrow_mut().advance(n);
                    metrics::BYTES_SENT.add(n as u64);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.handle_close(Some(CloseError::from_io(&err)));
                    return;
                }
            }
        }

        if self.output_paused.get() && self.out.borrow().total() < self.low_water {
            self.output_paused.set(false);
            self.pause_ev.emit(false);
            if self.closed.get() {
                return;
            }
        }
        if self.out.borrow().is_empty() {
            if self.closing.get() {
                self.finish_close(None);
                return;
            }
            self.sync_interest();
        }
    }

    fn on_hangup(&self) {
        self.close_with_socket_error();
    }

    fn on_error(&self) {
        self.close_with_socket_error();
    }
}

/// An established TCP connection.
///
/// Emits `data(Bytes)`, `pause(bool)` and — exactly once over its lifetime
/// — `close(Option<CloseError>)`, whose payload names the socket error
/// when one caused the close. Cloning yields another handle to the same
/// connection.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Rc<ConnInner>,
}

impl TcpConnection {
    pub(crate) fn from_fd(lp: &Loop, fd: RawFd, host: String, port: u16) -> TcpConnection {
        let config = lp.config();
        if config.tcp_nodelay
            && let Err(err) = sys::set_nodelay(fd)
        {
            trace!("TCP_NODELAY on {host}:{port}: {err}");
        }
        let inner = Rc::new(ConnInner {
            lp: lp.clone(),
            fd,
            host,
            port,
            connected: Cell::new(true),
            read_paused: Cell::new(true),
            closing: Cell::new(false),
            closed: Cell::new(false),
            output_paused: Cell::new(false),
            out: RefCell::new(WriteQueue::default()),
            read_chunk_size: config.read_chunk_size,
            high_water: config.write_high_water,
            low_water: config.write_low_water,
            data_ev: Event::new(),
            pause_ev: Event::new(),
            close_ev: Event::new(),
        });
        lp.register(fd, Interest::NONE, inner.clone());
        TcpConnection { inner }
    }

    /// Queue `data` for transmission. Never blocks.
    pub fn write(&self, data: impl Into<Bytes>) {
        self.inner.write(data.into());
    }

    /// Pause (`true`) or resume (`false`) delivery of `data` events.
    /// Connections start paused.
    pub fn pause(&self, paused: bool) {
        self.inner.pause(paused);
    }

    /// Flush buffered writes best-effort, then close and emit `close`.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.get()
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Bytes currently queued for transmission.
    pub fn buffered(&self) -> usize {
        self.inner.out.borrow().total()
    }

    pub fn on_data(&self, listener: impl FnMut(Bytes) + 'static) -> ListenerId {
        self.inner.data_ev.on(listener)
    }

    pub fn on_pause(&self, listener: impl FnMut(bool) + 'static) -> ListenerId {
        self.inner.pause_ev.on(listener)
    }

    /// The listener receives the socket error that tore the connection
    /// down, or `None` for an orderly close.
    pub fn on_close(&self, listener: impl FnMut(Option<CloseError>) + 'static) -> ListenerId {
        self.inner.close_ev.on(listener)
    }

    pub fn remove_data_listener(&self, id: ListenerId) {
        self.inner.data_ev.remove(id);
    }

    pub fn remove_pause_listener(&self, id: ListenerId) {
        self.inner.pause_ev.remove(id);
    }

    pub fn remove_close_listener(&self, id: ListenerId) {
        self.inner.close_ev.remove(id);
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &format_args!("{}:{}", self.inner.host, self.inner.port))
            .field("connected", &self.inner.connected.get())
            .field("read_paused", &self.inner.read_paused.get())
            .field("buffered", &self.inner.out.borrow().total())
            .finish()
    }
}

impl Stream for TcpConnection {
    fn write(&self, data: Bytes) {
        self.inner.write(data);
    }

    fn pause(&self, paused: bool) {
        self.inner.pause(paused);
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.get()
    }

    fn host(&self) -> String {
        self.inner.host.clone()
    }

    fn port(&self) -> u16 {
        self.inner.port
    }

    fn on_data(&self, listener: Box<dyn FnMut(Bytes)>) -> ListenerId {
        self.inner.data_ev.on(listener)
    }

    fn on_pause(&self, listener: Box<dyn FnMut(bool)>) -> ListenerId {
        self.inner.pause_ev.on(listener)
    }

    fn on_close(&self, listener: Box<dyn FnMut(Option<CloseError>)>) -> ListenerId {
        self.inner.close_ev.on(listener)
    }

    fn remove_data_listener(&self, id: ListenerId) {
        self.inner.data_ev.remove(id);
    }

    fn remove_pause_listener(&self, id: ListenerId) {
        self.inner.pause_ev.remove(id);
    }

    fn remove_close_listener(&self, id: ListenerId) {
        self.inner.close_ev.remove(id);
    }
}

// ── Server ──────────────────────────────────────────────────────────────

struct ServerInner {
    lp: Loop,
    fd: RawFd,
    closed: Cell<bool>,
    connect_ev: Event<TcpConnection>,
    start_ev: Event<()>,
    stop_ev: Event<()>,
}

impl EventSink for ServerInner {
    fn on_readable(&self) {
        // Drain the whole accept queue; safe even for edge-triggered
        // backends.
        loop {
            if self.closed.get() {
                return;
            }
            match sys::accept(self.fd) {
                Ok(Some((fd, peer))) => {
                    metrics::CONNECTIONS_ACCEPTED.increment();
                    let conn = TcpConnection::from_fd(
                        &self.lp,
                        fd,
                        peer.ip().to_string(),
                        peer.port(),
                    );
                    self.connect_ev.emit(conn);
                }
                Ok(None) => return,
                Err(err) => {
                    warn!("accept failed: {err}");
                    return;
                }
            }
        }
    }
}

/// An asynchronous TCP server.
///
/// Emits `connect(TcpConnection)` for every accepted connection, `start`
/// once after a successful bind, and `stop` after [`close`](TcpServer::close).
#[derive(Clone)]
pub struct TcpServer {
    inner: Rc<ServerInner>,
}

impl TcpServer {
    /// Bind `host:port`, start listening, and register with the loop.
    pub fn new(lp: &Loop, host: &str, port: u16) -> Result<TcpServer, Error> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| Error::Resolve(format!("{host}:{port}")))?
            .next()
            .ok_or_else(|| Error::Resolve(format!("{host}:{port}")))?;
        let fd = sys::bind_listen(addr, lp.config().backlog)?;
        let inner = Rc::new(ServerInner {
            lp: lp.clone(),
            fd,
            closed: Cell::new(false),
            connect_ev: Event::new(),
            start_ev: Event::new(),
            stop_ev: Event::new(),
        });
        lp.register(fd, Interest::READABLE, inner.clone());
        let emitter = inner.clone();
        lp.schedule(Duration::ZERO, move || emitter.start_ev.emit(()));
        debug!("listening on {addr}");
        Ok(TcpServer { inner })
    }

    /// The bound address; useful after binding port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Error> {
        Ok(sys::local_addr(self.inner.fd)?)
    }

    /// Stop accepting and close the listening socket. In-flight connections
    /// are unaffected.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        self.inner.lp.unregister(self.inner.fd);
        sys::close(self.inner.fd);
        self.inner.stop_ev.emit(());
        self.inner.connect_ev.clear();
        self.inner.start_ev.clear();
        self.inner.stop_ev.clear();
    }

    pub fn on_connect(&self, listener: impl FnMut(TcpConnection) + 'static) -> ListenerId {
        self.inner.connect_ev.on(listener)
    }

    pub fn on_start(&self, listener: impl FnMut(()) + 'static) -> ListenerId {
        self.inner.start_ev.on(listener)
    }

    pub fn on_stop(&self, listener: impl FnMut(()) + 'static) -> ListenerId {
        self.inner.stop_ev.on(listener)
    }
}

// ── Client ──────────────────────────────────────────────────────────────

struct ClientInner {
    lp: Loop,
    fd: Cell<RawFd>,
    host: RefCell<String>,
    port: Cell<u16>,
    timeout_handle: RefCell<Option<TimeoutHandle>>,
    error_sent: Cell<bool>,
    finished: Cell<bool>,
    connect_ev: Event<TcpConnection>,
    error_ev: Event<ConnectError>,
}

impl ClientInner {
    fn cancel_timeout(&self) {
        if let Some(handle) = self.timeout_handle.borrow_mut().take() {
            handle.delete();
        }
    }

    fn fail(&self, err: ConnectError) {
        if self.error_sent.replace(true) || self.finished.get() {
            return;
        }
        self.cancel_timeout();
        metrics::CONNECT_FAILURES.increment();
        self.error_ev.emit(err);
        self.connect_ev.clear();
        self.error_ev.clear();
    }

    fn handle_connect(&self) {
        if self.finished.get() || self.error_sent.get() {
            return;
        }
        self.cancel_timeout();
        let fd = self.fd.get();
        self.lp.unregister(fd);
        match sys::take_socket_error(fd) {
            Ok(None) => {
                self.finished.set(true);
                metrics::CONNECTIONS_CONNECTED.increment();
                let conn = TcpConnection::from_fd(
                    &self.lp,
                    fd,
                    self.host.borrow().clone(),
                    self.port.get(),
                );
                self.connect_ev.emit(conn);
                self.connect_ev.clear();
                self.error_ev.clear();
            }
            Ok(Some(err)) | Err(err) => {
                sys::close(fd);
                self.fail(ConnectError::socket(
                    err.raw_os_error().unwrap_or(0),
                    err.to_string(),
                ));
            }
        }
    }

    fn handle_timeout(&self) {
        if self.finished.get() || self.error_sent.get() {
            return;
        }
        let fd = self.fd.get();
        self.lp.unregister(fd);
        sys::close(fd);
        self.fail(ConnectError::socket(
            libc::ETIMEDOUT,
            "connection timed out",
        ));
    }
}

impl EventSink for ClientInner {
    fn on_writable(&self) {
        self.handle_connect();
    }

    fn on_hangup(&self) {
        self.handle_connect();
    }

    fn on_error(&self) {
        self.handle_connect();
    }
}

/// An asynchronous TCP client performing a single connect.
///
/// Emits `connect(TcpConnection)` on success or `connect_error(ConnectError)`
/// on failure — exactly one of the two, always from a loop callback after
/// [`connect`](TcpClient::connect) returns.
#[derive(Clone)]
pub struct TcpClient {
    inner: Rc<ClientInner>,
}

impl TcpClient {
    pub fn new(lp: &Loop) -> TcpClient {
        TcpClient {
            inner: Rc::new(ClientInner {
                lp: lp.clone(),
                fd: Cell::new(-1),
                host: RefCell::new(String::new()),
                port: Cell::new(0),
                timeout_handle: RefCell::new(None),
                error_sent: Cell::new(false),
                finished: Cell::new(false),
                connect_ev: Event::new(),
                error_ev: Event::new(),
            }),
        }
    }

    /// Begin an asynchronous connect to `host:port`, with an optional
    /// overall timeout. Host resolution happens synchronously via the
    /// system resolver.
    pub fn connect(&self, host: &str, port: u16, timeout: Option<Duration>) {
        let inner = &self.inner;
        if inner.fd.get() >= 0 {
            warn!("TcpClient::connect called twice; ignoring");
            return;
        }
        *inner.host.borrow_mut() = host.to_string();
        inner.port.set(port);

        let addr = match (host, port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    self.defer_fail(ConnectError::resolve(format!("no addresses for {host}")));
                    return;
                }
            },
            Err(err) => {
                self.defer_fail(ConnectError::resolve(err.to_string()));
                return;
            }
        };

        let fd = match sys::stream_socket(addr) {
            Ok(fd) => fd,
            Err(err) => {
                self.defer_fail(ConnectError::socket(
                    err.raw_os_error().unwrap_or(0),
                    err.to_string(),
                ));
                return;
            }
        };
        if inner.lp.config().tcp_nodelay
            && let Err(err) = sys::set_nodelay(fd)
        {
            trace!("TCP_NODELAY on {host}:{port}: {err}");
        }

        match sys::start_connect(fd, addr) {
            // An immediately-completed connect still reports writable on
            // the next tick, so both cases wait for the loop.
            Ok(_) => {}
            Err(err) => {
                sys::close(fd);
                self.defer_fail(ConnectError::socket(
                    err.raw_os_error().unwrap_or(0),
                    err.to_string(),
                ));
                return;
            }
        }

        inner.fd.set(fd);
        inner.lp.register(fd, Interest::WRITABLE, inner.clone());
        if let Some(timeout) = timeout {
            let target = inner.clone();
            let handle = inner
                .lp
                .schedule(timeout, move || target.handle_timeout());
            *inner.timeout_handle.borrow_mut() = Some(handle);
        }
    }

    pub fn on_connect(&self, listener: impl FnMut(TcpConnection) + 'static) -> ListenerId {
        self.inner.connect_ev.on(listener)
    }

    pub fn on_connect_error(&self, listener: impl FnMut(ConnectError) + 'static) -> ListenerId {
        self.inner.error_ev.on(listener)
    }

    fn defer_fail(&self, err: ConnectError) {
        let inner = self.inner.clone();
        self.inner
            .lp
            .schedule(Duration::ZERO, move || inner.fail(err));
    }
}

/// [`Connector`] implementation dialing plain TCP.
#[derive(Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        lp: &Loop,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        on_connect: Box<dyn FnOnce(Rc<dyn Stream>)>,
        on_error: Box<dyn FnOnce(ConnectError)>,
    ) {
        let client = TcpClient::new(lp);
        let mut on_connect = Some(on_connect);
        client.on_connect(move |conn| {
            if let Some(f) = on_connect.take() {
                f(Rc::new(conn));
            }
        });
        let mut on_error = Some(on_error);
        client.on_connect_error(move |err| {
            if let Some(f) = on_error.take() {
                f(err);
            }
        });
        client.connect(host, port, timeout);
    }
}
