//! Fetch a URL and print the response: `cargo run --example get -- http://example.com/`

use std::io::Write;
use std::time::Duration;

use hopline::Loop;
use hopline_http::HttpClient;

fn main() -> Result<(), hopline::Error> {
    let uri = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8000/".to_string());

    let lp = Loop::new()?;
    let client = HttpClient::new(&lp);
    client.set_connect_timeout(Some(Duration::from_secs(5)));
    client.set_read_timeout(Some(Duration::from_secs(10)));

    let exchange = client.exchange();
    exchange.on_response_start(|(status, phrase, headers)| {
        eprintln!("HTTP/1.1 {status} {phrase}");
        for (name, value) in &headers {
            eprintln!(
                "{}: {}",
                String::from_utf8_lossy(name),
                String::from_utf8_lossy(value)
            );
        }
        eprintln!();
    });
    exchange.on_response_body(|chunk| {
        std::io::stdout().write_all(&chunk).ok();
    });
    {
        let lp2 = lp.clone();
        exchange.on_response_done(move |_trailers| lp2.stop());
    }
    {
        let lp2 = lp.clone();
        exchange.on_error(move |err| {
            eprintln!("*** {err}");
            lp2.stop();
        });
    }

    exchange.request_start("GET", &uri, vec![]);
    exchange.request_done(vec![]);
    lp.run()
}
