//! Client integration tests: exchanges against canned TCP servers, all on
//! one loop. The raw server gives each test exact control over the bytes
//! on the wire.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use hopline::{ConfigBuilder, Loop, TcpServer};
use hopline_http::{ExchangeError, HttpClient, HttpError};

fn test_loop() -> Loop {
    let config = ConfigBuilder::new()
        .precision(Duration::from_millis(5))
        .build()
        .unwrap();
    Loop::with_config(config).unwrap()
}

/// A TCP server that answers every data event with a canned byte string.
fn canned_server(
    lp: &Loop,
    response: &'static [u8],
    close_after: bool,
) -> (TcpServer, u16, Rc<Cell<usize>>) {
    let server = TcpServer::new(lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();
    let accepted = Rc::new(Cell::new(0usize));
    {
        let accepted = accepted.clone();
        server.on_connect(move |conn| {
            accepted.set(accepted.get() + 1);
            let writer = conn.clone();
            conn.on_data(move |_request| {
                writer.write(Bytes::from_static(response));
                if close_after {
                    writer.close();
                }
            });
            conn.pause(false);
        });
    }
    (server, port, accepted)
}

#[derive(Default)]
struct Observed {
    starts: Vec<(u16, String)>,
    body: Vec<u8>,
    done: bool,
    errors: Vec<ExchangeError>,
}

/// Wire an exchange's events into an `Observed`, stopping the loop when
/// the exchange reaches a terminal event.
fn observe(
    lp: &Loop,
    exchange: &hopline_http::HttpClientExchange,
    stop_on_terminal: bool,
) -> Rc<RefCell<Observed>> {
    let observed = Rc::new(RefCell::new(Observed::default()));
    {
        let observed = observed.clone();
        exchange.on_response_start(move |(status, phrase, _headers)| {
            observed.borrow_mut().starts.push((status, phrase));
        });
    }
    {
        let observed = observed.clone();
        exchange.on_response_body(move |chunk| {
            observed.borrow_mut().body.extend_from_slice(&chunk);
        });
    }
    {
        let observed = observed.clone();
        let lp = lp.clone();
        exchange.on_response_done(move |_trailers| {
            observed.borrow_mut().done = true;
            if stop_on_terminal {
                lp.stop();
            }
        });
    }
    {
        let observed = observed.clone();
        let lp = lp.clone();
        exchange.on_error(move |err| {
            observed.borrow_mut().errors.push(err);
            if stop_on_terminal {
                lp.stop();
            }
        });
    }
    observed
}

#[test]
fn chunked_get_round_trip() {
    let lp = test_loop();
    let (_server, port, _accepted) = canned_server(
        &lp,
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        false,
    );

    let client = HttpClient::new(&lp);
    let exchange = client.exchange();
    // The pool must hold the connection by the time response_done fires;
    // registered before `observe` so it runs before the stop listener
    // (stopping the loop drains the pool).
    let pooled_at_done = Rc::new(Cell::new(usize::MAX));
    {
        let client2 = client.clone();
        let pooled_at_done = pooled_at_done.clone();
        exchange.on_response_done(move |_trailers| {
            pooled_at_done.set(client2.idle_connections());
        });
    }
    let observed = observe(&lp, &exchange, true);
    exchange.request_start("GET", &format!("http://127.0.0.1:{port}/a"), vec![]);
    exchange.request_done(vec![]);

    lp.run().unwrap();

    let observed = observed.borrow();
    assert_eq!(observed.starts, vec![(200, "OK".to_string())]);
    assert_eq!(observed.body, b"hello");
    assert!(observed.done);
    assert!(observed.errors.is_empty());
    assert_eq!(pooled_at_done.get(), 1);
}

#[test]
fn content_length_framing_and_reuse() {
    let lp = test_loop();
    let (_server, port, accepted) = canned_server(
        &lp,
        b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc",
        false,
    );

    let client = HttpClient::new(&lp);
    let uri = format!("http://127.0.0.1:{port}/");
    let second_body = Rc::new(RefCell::new(Vec::new()));

    let first = client.exchange();
    let observed = observe(&lp, &first, false);
    {
        // Chain a second exchange off the first completion; it must reuse
        // the pooled connection.
        let lp2 = lp.clone();
        let client2 = client.clone();
        let uri2 = uri.clone();
        let second_body = second_body.clone();
        first.on_response_done(move |_trailers| {
            let second = client2.exchange();
            {
                let second_body = second_body.clone();
                second.on_response_body(move |chunk| {
                    second_body.borrow_mut().extend_from_slice(&chunk);
                });
            }
            {
                let lp = lp2.clone();
                second.on_response_done(move |_trailers| lp.stop());
            }
            second.on_error(|err| panic!("second exchange failed: {err}"));
            second.request_start("GET", &uri2, vec![]);
            second.request_done(vec![]);
        });
    }
    first.request_start("GET", &uri, vec![]);
    first.request_done(vec![]);

    lp.run().unwrap();

    assert_eq!(observed.borrow().body, b"abc");
    assert_eq!(*second_body.borrow(), b"abc");
    assert_eq!(accepted.get(), 1, "second exchange dialed a new connection");
}

#[test]
fn idempotent_request_retries_after_connect_failure() {
    let lp = test_loop();
    // A port with nothing listening on it, yet.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = HttpClient::new(&lp);
    client.set_retry_delay(Duration::from_millis(100));

    let exchange = client.exchange();
    let observed = observe(&lp, &exchange, true);
    exchange.request_start("GET", &format!("http://127.0.0.1:{port}/"), vec![]);
    exchange.request_done(vec![]);

    // Bring the origin up before the retry fires.
    let servers: Rc<RefCell<Vec<TcpServer>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let lp2 = lp.clone();
        let servers = servers.clone();
        lp.schedule(Duration::from_millis(20), move || {
            let server = TcpServer::new(&lp2, "127.0.0.1", port).unwrap();
            server.on_connect(|conn| {
                let writer = conn.clone();
                conn.on_data(move |_request| {
                    writer.write(&b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"[..]);
                });
                conn.pause(false);
            });
            servers.borrow_mut().push(server);
        });
    }

    lp.run().unwrap();

    let observed = observed.borrow();
    assert!(observed.errors.is_empty(), "retry should be invisible: {:?}", observed.errors);
    assert_eq!(observed.starts, vec![(200, "OK".to_string())]);
    assert_eq!(observed.body, b"ok");
    assert_eq!(exchange.attempts(), 1);
}

#[test]
fn non_idempotent_request_fails_without_retry() {
    let lp = test_loop();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = HttpClient::new(&lp);
    client.set_retry_delay(Duration::from_millis(50));

    let exchange = client.exchange();
    let observed = observe(&lp, &exchange, true);
    exchange.request_start("POST", &format!("http://127.0.0.1:{port}/submit"), vec![]);
    exchange.request_done(vec![]);

    lp.run().unwrap();

    let observed = observed.borrow();
    assert!(observed.starts.is_empty());
    assert_eq!(observed.errors.len(), 1);
    assert!(matches!(observed.errors[0].error, HttpError::Connect(_)));
    assert!(!observed.errors[0].client_recoverable);
    assert_eq!(exchange.attempts(), 0);
}

#[test]
fn pooled_connection_ages_out() {
    let lp = test_loop();
    let (_server, port, accepted) = canned_server(
        &lp,
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        false,
    );

    let client = HttpClient::new(&lp);
    client.set_idle_timeout(Some(Duration::from_millis(100)));
    let uri = format!("http://127.0.0.1:{port}/");

    let first = client.exchange();
    let _observed = observe(&lp, &first, false);
    first.request_start("GET", &uri, vec![]);
    first.request_done(vec![]);

    let pooled = Rc::new(Cell::new(usize::MAX));
    let after_expiry = Rc::new(Cell::new(usize::MAX));
    {
        let client2 = client.clone();
        let pooled = pooled.clone();
        lp.schedule(Duration::from_millis(60), move || {
            pooled.set(client2.idle_connections());
        });
    }
    {
        let lp2 = lp.clone();
        let client2 = client.clone();
        let after_expiry = after_expiry.clone();
        let uri2 = uri.clone();
        lp.schedule(Duration::from_millis(400), move || {
            after_expiry.set(client2.idle_connections());
            // A fresh request must dial a new connection.
            let second = client2.exchange();
            let lp = lp2.clone();
            second.on_response_done(move |_trailers| lp.stop());
            second.on_error(|err| panic!("second exchange failed: {err}"));
            second.request_start("GET", &uri2, vec![]);
            second.request_done(vec![]);
        });
    }

    lp.run().unwrap();

    assert_eq!(pooled.get(), 1, "connection should be pooled while fresh");
    assert_eq!(after_expiry.get(), 0, "idle timer should evict");
    assert_eq!(accepted.get(), 2, "new connection expected after eviction");
}

#[test]
fn upstream_close_mid_response_is_an_error() {
    let lp = test_loop();
    let (_server, port, _accepted) = canned_server(
        &lp,
        b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabcd",
        true,
    );

    let client = HttpClient::new(&lp);
    let exchange = client.exchange();
    let observed = observe(&lp, &exchange, true);
    exchange.request_start("GET", &format!("http://127.0.0.1:{port}/"), vec![]);
    exchange.request_done(vec![]);

    lp.run().unwrap();

    let observed = observed.borrow();
    assert_eq!(observed.starts.len(), 1);
    assert_eq!(observed.body, b"abcd");
    assert!(!observed.done, "no response_done after a truncated body");
    assert_eq!(observed.errors.len(), 1);
    assert!(matches!(observed.errors[0].error, HttpError::UpstreamClose(_)));
    assert!(!observed.errors[0].client_recoverable);
    assert_eq!(client.idle_connections(), 0);
}

#[test]
fn eof_delimited_response_completes_on_close() {
    let lp = test_loop();
    let (_server, port, _accepted) =
        canned_server(&lp, b"HTTP/1.1 200 OK\r\n\r\nuntil the end", true);

    let client = HttpClient::new(&lp);
    let exchange = client.exchange();
    let observed = observe(&lp, &exchange, true);
    exchange.request_start("GET", &format!("http://127.0.0.1:{port}/"), vec![]);
    exchange.request_done(vec![]);

    lp.run().unwrap();

    let observed = observed.borrow();
    assert_eq!(observed.body, b"until the end");
    assert!(observed.done);
    assert!(observed.errors.is_empty());
    // Close-delimited responses can never return to the pool.
    assert_eq!(client.idle_connections(), 0);
}

#[test]
fn read_timeout_fires_without_response() {
    let lp = test_loop();
    // Accepts and then stays silent.
    let server = TcpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();
    server.on_connect(|conn| conn.pause(false));

    let client = HttpClient::new(&lp);
    client.set_read_timeout(Some(Duration::from_millis(80)));

    let exchange = client.exchange();
    let observed = observe(&lp, &exchange, true);
    exchange.request_start("POST", &format!("http://127.0.0.1:{port}/"), vec![]);
    exchange.request_done(vec![]);

    lp.run().unwrap();

    let observed = observed.borrow();
    assert_eq!(observed.errors.len(), 1);
    assert!(matches!(observed.errors[0].error, HttpError::ReadTimeout(_)));
    assert!(!observed.errors[0].client_recoverable);
    assert!(observed.starts.is_empty());
}

#[test]
fn invalid_uri_is_reported_asynchronously() {
    let lp = test_loop();
    let client = HttpClient::new(&lp);

    let exchange = client.exchange();
    // Listeners attached after request_start must still see the error.
    exchange.request_start("GET", "ftp://example.com/", vec![]);
    let observed = observe(&lp, &exchange, true);
    exchange.request_done(vec![]);

    lp.run().unwrap();

    let observed = observed.borrow();
    assert_eq!(observed.errors.len(), 1);
    assert!(matches!(observed.errors[0].error, HttpError::Url(_)));
}
