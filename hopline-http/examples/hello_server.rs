//! Minimal HTTP server: `cargo run --example hello_server -- 8000`

use hopline::Loop;
use hopline_http::{HttpServer, header};

fn main() -> Result<(), hopline::Error> {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);

    let lp = Loop::new()?;
    let server = HttpServer::new(&lp, "127.0.0.1", port)?;
    println!("serving on http://127.0.0.1:{port}/");

    server.on_exchange(|exchange| {
        let responder = exchange.clone();
        exchange.on_request_done(move |_trailers| {
            let body = format!("you asked for {}\n", responder.target());
            responder.response_start(200, "OK", vec![header("Content-Type", "text/plain")]);
            responder.response_body(body.into_bytes());
            responder.response_done(vec![]);
        });
    });

    lp.run()
}
