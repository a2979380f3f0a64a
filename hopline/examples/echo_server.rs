//! TCP echo server: `cargo run --example echo_server -- 7878`

use hopline::{Loop, TcpServer};

fn main() -> Result<(), hopline::Error> {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(7878);

    let lp = Loop::new()?;
    let server = TcpServer::new(&lp, "127.0.0.1", port)?;
    println!("echoing on 127.0.0.1:{port} ({})", lp.backend_name());

    server.on_connect(|conn| {
        println!("+ {}:{}", conn.host(), conn.port());
        let writer = conn.clone();
        conn.on_data(move |chunk| writer.write(chunk));
        conn.on_close(|reason| match reason {
            Some(err) => println!("- closed: {err}"),
            None => println!("- closed"),
        });
        conn.pause(false);
    });

    lp.run()
}
