//! Server integration tests: raw TCP clients with exact wire control on
//! one side, `HttpServer` on the other, plus full client↔server round
//! trips — all on one loop.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use hopline::{ConfigBuilder, Loop, TcpClient, TcpConnection};
use hopline_http::{HttpClient, HttpServer};

fn test_loop() -> Loop {
    let config = ConfigBuilder::new()
        .precision(Duration::from_millis(5))
        .build()
        .unwrap();
    Loop::with_config(config).unwrap()
}

/// Connect a raw TCP client, send `request`, and collect everything the
/// server says until the connection closes or the loop stops.
struct RawClient {
    received: Rc<RefCell<Vec<u8>>>,
    closed: Rc<Cell<bool>>,
    // Held so the connection handle outlives the test body.
    _conn: Rc<RefCell<Option<TcpConnection>>>,
}

fn raw_client(lp: &Loop, port: u16, request: &'static [u8]) -> RawClient {
    let received = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(Cell::new(false));
    let conn_slot = Rc::new(RefCell::new(None));

    let client = TcpClient::new(lp);
    {
        let received = received.clone();
        let closed = closed.clone();
        let conn_slot = conn_slot.clone();
        client.on_connect(move |conn| {
            conn.write(Bytes::from_static(request));
            {
                let received = received.clone();
                conn.on_data(move |chunk| received.borrow_mut().extend_from_slice(&chunk));
            }
            {
                let closed = closed.clone();
                conn.on_close(move |_reason| closed.set(true));
            }
            conn.pause(false);
            *conn_slot.borrow_mut() = Some(conn);
        });
    }
    client.on_connect_error(|err| panic!("raw client connect failed: {err}"));
    client.connect("127.0.0.1", port, Some(Duration::from_secs(5)));

    RawClient {
        received,
        closed,
        _conn: conn_slot,
    }
}

/// Stop the loop shortly after `raw.closed` flips, or at the deadline.
fn stop_when_closed(lp: &Loop, raw: &RawClient, deadline: Duration) {
    fn tick(lp: Loop, closed: Rc<Cell<bool>>, remaining: i32) {
        if closed.get() || remaining <= 0 {
            lp.stop();
        } else {
            let next = lp.clone();
            lp.schedule(Duration::from_millis(10), move || {
                tick(next, closed, remaining - 1)
            });
        }
    }
    tick(lp.clone(), raw.closed.clone(), (deadline.as_millis() / 10) as i32);
}

/// An echo-ish server handler: answers every request with a chunked body
/// naming the method and target.
fn install_echo_handler(server: &HttpServer) {
    server.on_exchange(|exchange| {
        let responder = exchange.clone();
        exchange.on_request_done(move |_trailers| {
            let body = format!("{} {}", responder.method(), responder.target());
            responder.response_start(200, "OK", vec![]);
            responder.response_body(body.into_bytes());
            responder.response_done(vec![]);
        });
    });
}

#[test]
fn serves_a_simple_request() {
    let lp = test_loop();
    let server = HttpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();
    install_echo_handler(&server);

    let raw = raw_client(&lp, port, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    {
        // One request, keep-alive: nothing closes on its own, so stop once
        // the response has had time to arrive.
        let lp2 = lp.clone();
        lp.schedule(Duration::from_millis(150), move || lp2.stop());
    }

    lp.run().unwrap();

    let text = String::from_utf8(raw.received.borrow().clone()).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains("Transfer-Encoding: chunked"), "{text}");
    assert!(text.contains("GET /hello"), "{text}");
    assert!(text.ends_with("0\r\n\r\n"), "{text}");
    assert!(!raw.closed.get(), "keep-alive connection should stay open");
}

#[test]
fn pipelined_requests_are_answered_in_order() {
    let lp = test_loop();
    let server = HttpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();

    let surfaced = Rc::new(RefCell::new(Vec::new()));
    {
        let surfaced = surfaced.clone();
        server.on_exchange(move |exchange| {
            surfaced.borrow_mut().push(exchange.target().to_string());
            let responder = exchange.clone();
            exchange.on_request_done(move |_trailers| {
                let body = responder.target().to_string();
                responder.response_start(200, "OK", vec![]);
                responder.response_body(body.into_bytes());
                responder.response_done(vec![]);
            });
        });
    }

    // Both requests land in one segment; the second exchange must not
    // surface until the first response is done.
    let raw = raw_client(
        &lp,
        port,
        b"GET /one HTTP/1.1\r\nHost: x\r\n\r\nGET /two HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    {
        let lp2 = lp.clone();
        lp.schedule(Duration::from_millis(200), move || lp2.stop());
    }

    lp.run().unwrap();

    assert_eq!(*surfaced.borrow(), vec!["/one", "/two"]);
    let text = String::from_utf8(raw.received.borrow().clone()).unwrap();
    let one = text.find("/one").expect("first response missing");
    let two = text.find("/two").expect("second response missing");
    assert!(one < two, "responses out of order: {text}");
}

#[test]
fn chunked_not_last_is_rejected_with_400() {
    let lp = test_loop();
    let server = HttpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();
    install_echo_handler(&server);

    let raw = raw_client(
        &lp,
        port,
        b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nTransfer-Encoding: chunked, identity\r\n\r\nabc",
    );
    stop_when_closed(&lp, &raw, Duration::from_secs(2));

    lp.run().unwrap();

    let text = String::from_utf8(raw.received.borrow().clone()).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
    assert!(raw.closed.get(), "connection must close after an error");
}

#[test]
fn missing_host_is_rejected_with_400() {
    let lp = test_loop();
    let server = HttpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();
    install_echo_handler(&server);

    let raw = raw_client(&lp, port, b"GET / HTTP/1.1\r\n\r\n");
    stop_when_closed(&lp, &raw, Duration::from_secs(2));

    lp.run().unwrap();

    let text = String::from_utf8(raw.received.borrow().clone()).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
    assert!(raw.closed.get());
}

#[test]
fn unknown_transfer_coding_is_rejected_with_501() {
    let lp = test_loop();
    let server = HttpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();
    install_echo_handler(&server);

    let raw = raw_client(
        &lp,
        port,
        b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip\r\n\r\n",
    );
    stop_when_closed(&lp, &raw, Duration::from_secs(2));

    lp.run().unwrap();

    let text = String::from_utf8(raw.received.borrow().clone()).unwrap();
    assert!(text.starts_with("HTTP/1.1 501 Not Implemented\r\n"), "{text}");
}

#[test]
fn unsupported_version_is_rejected_with_505() {
    let lp = test_loop();
    let server = HttpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();
    install_echo_handler(&server);

    let raw = raw_client(&lp, port, b"GET / HTTP/2.0\r\nHost: x\r\n\r\n");
    stop_when_closed(&lp, &raw, Duration::from_secs(2));

    lp.run().unwrap();

    let text = String::from_utf8(raw.received.borrow().clone()).unwrap();
    assert!(
        text.starts_with("HTTP/1.1 505 HTTP Version Not Supported\r\n"),
        "{text}"
    );
}

#[test]
fn connection_close_is_honored() {
    let lp = test_loop();
    let server = HttpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();
    install_echo_handler(&server);

    let raw = raw_client(
        &lp,
        port,
        b"GET /bye HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );
    stop_when_closed(&lp, &raw, Duration::from_secs(2));

    lp.run().unwrap();

    let text = String::from_utf8(raw.received.borrow().clone()).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains("Connection: close"), "{text}");
    assert!(raw.closed.get(), "server must close after Connection: close");
}

#[test]
fn http10_response_is_close_delimited() {
    let lp = test_loop();
    let server = HttpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();
    install_echo_handler(&server);

    let raw = raw_client(&lp, port, b"GET /old HTTP/1.0\r\n\r\n");
    stop_when_closed(&lp, &raw, Duration::from_secs(2));

    lp.run().unwrap();

    let text = String::from_utf8(raw.received.borrow().clone()).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(!text.contains("Transfer-Encoding"), "{text}");
    assert!(text.ends_with("GET /old"), "{text}");
    assert!(raw.closed.get(), "1.0 response ends by closing");
}

#[test]
fn idle_connections_age_out() {
    let lp = test_loop();
    let server = HttpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();
    server.set_idle_timeout(Some(Duration::from_millis(100)));
    install_echo_handler(&server);

    // Connects but never sends a request.
    let raw = raw_client(&lp, port, b"");
    stop_when_closed(&lp, &raw, Duration::from_secs(2));

    lp.run().unwrap();

    assert!(raw.closed.get(), "idle connection should be closed");
    assert!(raw.received.borrow().is_empty());
}

#[test]
fn client_and_server_round_trip_with_body() {
    let lp = test_loop();
    let server = HttpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();

    let request_bodies = Rc::new(RefCell::new(Vec::new()));
    {
        let request_bodies = request_bodies.clone();
        server.on_exchange(move |exchange| {
            let collected = Rc::new(RefCell::new(Vec::new()));
            {
                let collected = collected.clone();
                exchange.on_request_body(move |chunk| {
                    collected.borrow_mut().extend_from_slice(&chunk);
                });
            }
            let responder = exchange.clone();
            let request_bodies = request_bodies.clone();
            exchange.on_request_done(move |_trailers| {
                let body = collected.borrow().clone();
                request_bodies.borrow_mut().push(body.clone());
                responder.response_start(
                    200,
                    "OK",
                    vec![hopline_http::header(
                        "Content-Length",
                        &body.len().to_string(),
                    )],
                );
                responder.response_body(body);
                responder.response_done(vec![]);
            });
        });
    }

    let client = HttpClient::new(&lp);
    let exchange = client.exchange();
    let response_body = Rc::new(RefCell::new(Vec::new()));
    {
        let response_body = response_body.clone();
        exchange.on_response_body(move |chunk| {
            response_body.borrow_mut().extend_from_slice(&chunk);
        });
    }
    {
        let lp2 = lp.clone();
        exchange.on_response_done(move |_trailers| lp2.stop());
    }
    exchange.on_error(|err| panic!("exchange failed: {err}"));

    exchange.request_start("PUT", &format!("http://127.0.0.1:{port}/upload"), vec![]);
    exchange.request_body(&b"streamed "[..]);
    exchange.request_body(&b"payload"[..]);
    exchange.request_done(vec![]);

    lp.run().unwrap();

    assert_eq!(*request_bodies.borrow(), vec![b"streamed payload".to_vec()]);
    assert_eq!(*response_body.borrow(), b"streamed payload");
}
