//! Integration tests: the loop and TCP transport over real sockets.
//!
//! Some tests drive a loop in a background thread from a std `TcpStream`;
//! others run both ends of a connection on a single loop and stop it from
//! inside a callback.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use hopline::{ConfigBuilder, Loop, TcpClient, TcpServer};

fn test_loop() -> Loop {
    let config = ConfigBuilder::new()
        .precision(Duration::from_millis(5))
        .build()
        .unwrap();
    Loop::with_config(config).unwrap()
}

/// Poll `stop` from inside the loop so another thread can shut it down.
fn watchdog(lp: &Loop, stop: Arc<AtomicBool>) {
    fn tick(lp: Loop, stop: Arc<AtomicBool>) {
        if stop.load(Ordering::SeqCst) {
            lp.stop();
        } else {
            let next = lp.clone();
            lp.schedule(Duration::from_millis(5), move || tick(next, stop));
        }
    }
    tick(lp.clone(), stop);
}

fn start_echo_server(stop: Arc<AtomicBool>) -> (u16, thread::JoinHandle<()>) {
    let (port_tx, port_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let lp = test_loop();
        let server = TcpServer::new(&lp, "127.0.0.1", 0).unwrap();
        port_tx.send(server.local_addr().unwrap().port()).unwrap();
        server.on_connect(|conn| {
            let writer = conn.clone();
            conn.on_data(move |chunk| writer.write(chunk));
            conn.pause(false);
        });
        watchdog(&lp, stop);
        lp.run().unwrap();
    });
    (port_rx.recv().unwrap(), handle)
}

#[test]
fn echo_round_trip() {
    let stop = Arc::new(AtomicBool::new(false));
    let (port, handle) = start_echo_server(stop.clone());

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let msg = b"hello hopline";
    stream.write_all(msg).unwrap();

    let mut buf = vec![0u8; msg.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, msg);

    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap();
}

#[test]
fn echo_large_payload() {
    let stop = Arc::new(AtomicBool::new(false));
    let (port, handle) = start_echo_server(stop.clone());

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let msg: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let writer_msg = msg.clone();
    let mut writer_stream = stream.try_clone().unwrap();
    let writer = thread::spawn(move || {
        writer_stream.write_all(&writer_msg).unwrap();
    });

    let mut buf = vec![0u8; msg.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, msg);

    writer.join().unwrap();
    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap();
}

#[test]
fn close_emitted_exactly_once_on_peer_close() {
    let stop = Arc::new(AtomicBool::new(false));
    let (close_tx, close_rx) = mpsc::channel();
    let (port_tx, port_rx) = mpsc::channel();

    let stop2 = stop.clone();
    let handle = thread::spawn(move || {
        let lp = test_loop();
        let server = TcpServer::new(&lp, "127.0.0.1", 0).unwrap();
        port_tx.send(server.local_addr().unwrap().port()).unwrap();
        server.on_connect(move |conn| {
            let close_tx = close_tx.clone();
            conn.on_close(move |_reason| close_tx.send(()).unwrap());
            conn.pause(false);
        });
        watchdog(&lp, stop2);
        lp.run().unwrap();
    });

    let port = port_rx.recv().unwrap();
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    drop(stream);

    close_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no close event");
    assert!(
        close_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "close emitted more than once"
    );

    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap();
}

// Client and server on one loop; the test logic runs entirely in
// callbacks and stops the loop when done.
#[test]
fn client_connects_within_one_loop() {
    let lp = test_loop();
    let server = TcpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();

    server.on_connect(|conn| {
        let writer = conn.clone();
        conn.on_data(move |chunk| writer.write(chunk));
        conn.pause(false);
    });

    let received = Rc::new(RefCell::new(Vec::new()));
    let client = TcpClient::new(&lp);
    {
        let lp = lp.clone();
        let received = received.clone();
        client.on_connect(move |conn| {
            conn.write(&b"ping"[..]);
            let lp = lp.clone();
            let received = received.clone();
            conn.on_data(move |chunk| {
                received.borrow_mut().extend_from_slice(&chunk);
                if received.borrow().len() >= 4 {
                    lp.stop();
                }
            });
            conn.pause(false);
        });
    }
    client.on_connect_error(|err| panic!("connect failed: {err}"));
    client.connect("127.0.0.1", port, Some(Duration::from_secs(5)));

    lp.run().unwrap();
    assert_eq!(&*received.borrow(), b"ping");
}

#[test]
fn connect_to_dead_port_reports_error() {
    // Grab an ephemeral port, then release it so nothing is listening.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let lp = test_loop();
    let failed = Rc::new(Cell::new(false));

    let client = TcpClient::new(&lp);
    client.on_connect(|_conn| panic!("unexpected connect"));
    {
        let lp = lp.clone();
        let failed = failed.clone();
        client.on_connect_error(move |err| {
            assert_eq!(err.kind, hopline::ConnectErrorKind::Socket);
            failed.set(true);
            lp.stop();
        });
    }
    client.connect("127.0.0.1", port, Some(Duration::from_secs(5)));

    lp.run().unwrap();
    assert!(failed.get());
}

#[test]
fn resolve_failure_reports_error() {
    let lp = test_loop();
    let failed = Rc::new(Cell::new(false));

    let client = TcpClient::new(&lp);
    client.on_connect(|_conn| panic!("unexpected connect"));
    {
        let lp = lp.clone();
        let failed = failed.clone();
        client.on_connect_error(move |err| {
            assert_eq!(err.kind, hopline::ConnectErrorKind::Resolve);
            failed.set(true);
            lp.stop();
        });
    }
    client.connect("host.invalid.", 80, None);

    lp.run().unwrap();
    assert!(failed.get());
}

#[test]
fn write_backpressure_pauses_and_resumes() {
    let lp = test_loop();
    let server = TcpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();

    const TOTAL: usize = 1024 * 1024;

    let server_conn: Rc<RefCell<Option<hopline::TcpConnection>>> =
        Rc::new(RefCell::new(None));
    let received = Rc::new(Cell::new(0usize));

    {
        let server_conn = server_conn.clone();
        let received = received.clone();
        let lp2 = lp.clone();
        server.on_connect(move |conn| {
            // Leave the connection read-paused; the peer's writes must back
            // up until we resume below.
            let received = received.clone();
            let lp2 = lp2.clone();
            conn.on_data(move |chunk| {
                received.set(received.get() + chunk.len());
                if received.get() == TOTAL {
                    lp2.stop();
                }
            });
            *server_conn.borrow_mut() = Some(conn);
        });
    }

    let pauses = Rc::new(RefCell::new(Vec::new()));
    let client = TcpClient::new(&lp);
    {
        let pauses = pauses.clone();
        client.on_connect(move |conn| {
            let pauses2 = pauses.clone();
            conn.on_pause(move |paused| pauses2.borrow_mut().push(paused));
            let chunk = vec![7u8; 16 * 1024];
            for _ in 0..(TOTAL / chunk.len()) {
                conn.write(chunk.clone());
            }
        });
    }
    client.on_connect_error(|err| panic!("connect failed: {err}"));
    client.connect("127.0.0.1", port, Some(Duration::from_secs(5)));

    // Resume the server's read side shortly after the writes queue up.
    {
        let server_conn = server_conn.clone();
        lp.schedule(Duration::from_millis(100), move || {
            if let Some(conn) = server_conn.borrow().as_ref() {
                conn.pause(false);
            }
        });
    }

    lp.run().unwrap();

    assert_eq!(received.get(), TOTAL, "bytes were lost");
    let pauses = pauses.borrow();
    assert!(
        pauses.first() == Some(&true),
        "expected pause(true) after overfilling the queue: {pauses:?}"
    );
    assert!(
        pauses.contains(&false),
        "expected pause(false) after drain: {pauses:?}"
    );
}

#[test]
fn server_close_stops_accepting() {
    let lp = test_loop();
    let server = TcpServer::new(&lp, "127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();

    let stopped = Rc::new(Cell::new(false));
    {
        let stopped = stopped.clone();
        server.on_stop(move |()| stopped.set(true));
    }

    {
        let lp2 = lp.clone();
        let server = server.clone();
        lp.schedule(Duration::from_millis(10), move || {
            server.close();
            lp2.stop();
        });
    }

    lp.run().unwrap();
    assert!(stopped.get());
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
}
