//! Simple TCP echo server
//!
//! The classical example for a networking library. It listens on a TCP
//! port, accepts any connections and sends everything that comes right
//! back to where it came from, spread over four worker loops.
//!
//! You specify the port on the command line (6666 by default). Try it with
//! `nc localhost 6666`.

use std::env::args;
use std::process::exit;

use hydra::{EventLoop, InetAddress, ServerOption, TcpServer};

fn run() -> hydra::Result<()> {
    let port = args()
        .nth(1)
        .map(|raw| match raw.parse() {
            Ok(port) => port,
            Err(e) => {
                eprintln!("Couldn't parse the port number: {}", e);
                exit(1);
            },
        })
        .unwrap_or(6666);

    let mut base = EventLoop::new()?;
    let mut server = TcpServer::new(
        &mut base,
        &InetAddress::any(port),
        "echo",
        ServerOption::ReuseAddr,
    )?;
    server.set_thread_num(4);
    server.set_connection_callback(|conn| {
        if conn.connected() {
            println!("{} is here", conn.peer_addr());
        } else {
            println!("{} left", conn.peer_addr());
        }
    });
    server.set_message_callback(|conn, buf, _time| {
        // Whatever came in goes right back out
        let data = buf.take_all();
        conn.send(&data);
    });
    server.start(&mut base);

    // And run until killed
    base.run();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();
    if let Err(e) = run() {
        eprintln!("{}", e);
        exit(1);
    }
}
