//! End-to-end echo scenarios against live servers.
//!
//! Each test runs a real server (base loop on a dedicated thread, plain
//! `std::net` clients from the test thread) on an ephemeral loopback port.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hydra::{EventLoop, InetAddress, LoopHandle, ServerOption, TcpServer};

/// Start a server on its own thread, configured by the closure (which runs
/// on the server thread, where the server lives). Returns the bound
/// address, the base loop's handle and the thread to join.
fn spawn_server<F>(
    threads: usize,
    configure: F,
) -> (InetAddress, Arc<LoopHandle>, thread::JoinHandle<()>)
where
    F: FnOnce(&mut TcpServer) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let server_thread = thread::spawn(move || {
        let mut base = EventLoop::new().unwrap();
        let mut server = TcpServer::new(
            &mut base,
            &InetAddress::loopback(0),
            "test",
            ServerOption::ReuseAddr,
        )
        .unwrap();
        server.set_thread_num(threads);
        configure(&mut server);
        server.start(&mut base);
        tx.send((server.listen_addr(), base.handle())).unwrap();
        base.run();
    });
    let (addr, handle) = rx.recv().unwrap();
    (addr, handle, server_thread)
}

fn connect(addr: InetAddress) -> TcpStream {
    let client = TcpStream::connect(SocketAddrV4::from(addr)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn echo_single_loop() {
    let received = Arc::new(AtomicUsize::new(0));
    let messages = Arc::new(AtomicUsize::new(0));
    let (addr, base, server_thread) = {
        let received = Arc::clone(&received);
        let messages = Arc::clone(&messages);
        spawn_server(0, move |server| {
            server.set_message_callback(move |conn, buf, _time| {
                messages.fetch_add(1, Ordering::SeqCst);
                received.fetch_add(buf.readable_bytes(), Ordering::SeqCst);
                let data = buf.take_all();
                conn.send(&data);
            });
        })
    };

    let mut client = connect(addr);
    client.write_all(b"hello").unwrap();
    let mut back = [0u8; 5];
    client.read_exact(&mut back).unwrap();
    assert_eq!(b"hello", &back);

    assert_eq!(5, received.load(Ordering::SeqCst));
    assert_eq!(1, messages.load(Ordering::SeqCst));

    drop(client);
    base.quit();
    server_thread.join().unwrap();
}

#[test]
fn echo_four_workers_round_robin() {
    let messages = Arc::new(AtomicUsize::new(0));
    let worker_threads = Arc::new(Mutex::new(HashSet::new()));
    let (addr, base, server_thread) = {
        let messages = Arc::clone(&messages);
        let worker_threads = Arc::clone(&worker_threads);
        spawn_server(4, move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    worker_threads
                        .lock()
                        .unwrap()
                        .insert(thread::current().id());
                }
            });
            server.set_message_callback(move |conn, buf, _time| {
                messages.fetch_add(1, Ordering::SeqCst);
                let data = buf.take_all();
                conn.send(&data);
            });
        })
    };

    let mut clients: Vec<TcpStream> = (0..8).map(|_| connect(addr)).collect();
    for client in &mut clients {
        client.write_all(b"ping").unwrap();
    }
    for client in &mut clients {
        let mut back = [0u8; 4];
        client.read_exact(&mut back).unwrap();
        assert_eq!(b"ping", &back);
    }

    // Eight connections, one message each, spread round robin over
    // exactly four worker threads
    assert_eq!(8, messages.load(Ordering::SeqCst));
    assert_eq!(4, worker_threads.lock().unwrap().len());

    drop(clients);
    base.quit();
    server_thread.join().unwrap();
}

#[test]
fn large_burst_in_one_shot() {
    const TOTAL: usize = 1_000_000;
    let received = Arc::new(AtomicUsize::new(0));
    let (addr, base, server_thread) = {
        let received = Arc::clone(&received);
        spawn_server(0, move |server| {
            server.set_message_callback(move |_conn, buf, _time| {
                received.fetch_add(buf.readable_bytes(), Ordering::SeqCst);
                buf.retrieve_all();
            });
        })
    };

    let payload = vec![0xabu8; TOTAL];
    let mut client = connect(addr);
    client.write_all(&payload).unwrap();

    // The default buffer is 1 KiB; a megabyte arriving through it leans on
    // the scatter-read overflow path, and every byte must still be counted
    // exactly once.
    wait_for("the whole burst to arrive", || {
        received.load(Ordering::SeqCst) >= TOTAL
    });
    assert_eq!(TOTAL, received.load(Ordering::SeqCst));

    drop(client);
    base.quit();
    server_thread.join().unwrap();
}
