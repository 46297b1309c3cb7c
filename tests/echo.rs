//! End-to-end tests against real loopback sockets, exercising the server
//! the way an application would: spawn it on a background thread, talk to
//! it with plain `std::net::TcpStream`, then ask the base loop to quit.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use reactorq::{EventLoop, PortOption, Server};

/// Builds and runs a server entirely on one freshly spawned thread, which
/// is the only thread ever allowed to call `EventLoop::run` for that
/// loop: the base loop's thread affinity is pinned to whichever thread
/// constructed it, exactly as for a worker loop.
fn start_echo_server(threads: usize) -> (Arc<Server>, std::net::SocketAddr, std::thread::JoinHandle<()>) {
    start_server_with(threads, |server| {
        server.set_message_callback(|conn, buf, _t| {
            let bytes = buf.retrieve_all_as_vec();
            conn.send(&bytes);
        });
    })
}

fn start_server_with<F>(threads: usize, configure: F) -> (Arc<Server>, std::net::SocketAddr, std::thread::JoinHandle<()>)
where
    F: FnOnce(&Arc<Server>) + Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();

    let handle = std::thread::spawn(move || {
        let base_loop = EventLoop::new().expect("base loop");
        let server = Server::new(
            base_loop.clone(),
            "127.0.0.1:0".parse().unwrap(),
            "TestEcho".to_string(),
            PortOption::NoReusePort,
        )
        .expect("bind");

        server.set_thread_num(threads);
        configure(&server);

        let listen_addr = server.local_addr().expect("bound address");
        server.start();

        tx.send((Arc::clone(&server), listen_addr)).expect("send back server handle");
        server.run();
    });

    let (server, listen_addr) = rx.recv().expect("server failed to start");
    (server, listen_addr, handle)
}

#[test]
fn echo_roundtrip_with_three_workers() {
    let (server, addr, handle) = start_echo_server(3);

    let barrier = Arc::new(Barrier::new(3));
    let mut clients = Vec::new();
    for _ in 0..3 {
        let barrier = Arc::clone(&barrier);
        clients.push(std::thread::spawn(move || {
            barrier.wait();
            let mut stream = TcpStream::connect(addr).expect("connect");
            stream.write_all(b"ping\n").expect("write");
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).expect("read");
            assert_eq!(&buf, b"ping\n");
        }));
    }
    for c in clients {
        c.join().unwrap();
    }

    server.base_loop().quit();
    handle.join().unwrap();
}

#[test]
fn half_close_drains_before_eof() {
    let (server, addr, handle) = start_echo_server(1);

    let mut stream = TcpStream::connect(addr).expect("connect");
    let payload = vec![b'x'; 4 * 1024 * 1024];
    stream.write_all(&payload).expect("write");
    stream.shutdown(std::net::Shutdown::Write).expect("client half-close");

    let mut received = Vec::new();
    stream.read_to_end(&mut received).expect("read to eof");
    assert_eq!(received.len(), payload.len());

    server.base_loop().quit();
    handle.join().unwrap();
}

#[test]
fn backpressure_high_water_mark_fires_once_per_crossing() {
    let fire_count = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&fire_count);

    let (server, addr, handle) = start_server_with(1, move |server| {
        server.set_connection_callback(move |conn| {
            if !conn.connected() {
                return;
            }
            let counted = Arc::clone(&counted);
            conn.set_high_water_mark_callback(
                move |_c, _n| {
                    counted.fetch_add(1, Ordering::SeqCst);
                },
                64 * 1024,
            );

            // Flood the connection with far more than the client will
            // ever read, from a thread other than the owning loop, to
            // exercise `send`'s cross-thread hop at the same time as the
            // backpressure threshold.
            let conn = Arc::clone(conn);
            std::thread::spawn(move || {
                let chunk = vec![0u8; 1024 * 1024];
                for _ in 0..32 {
                    conn.send(&chunk);
                }
            });
        });
    });

    // Connect but never read: the kernel socket buffer and then this
    // crate's own output buffer both back up.
    let stream = TcpStream::connect(addr).expect("connect");
    std::thread::sleep(std::time::Duration::from_millis(300));
    drop(stream);

    assert_eq!(fire_count.load(Ordering::SeqCst), 1);

    server.base_loop().quit();
    handle.join().unwrap();
}

#[test]
fn cross_thread_send_preserves_order_onto_worker_connection() {
    const COUNT: usize = 200;

    let (server, addr, handle) = start_server_with(1, |server| {
        // The connection lives on a worker loop; every `send` below is
        // issued from the base loop's own thread, so each one crosses
        // threads to reach the connection it targets.
        let base_loop = server.base_loop().clone();
        server.set_connection_callback(move |conn| {
            if !conn.connected() {
                return;
            }
            let conn = Arc::clone(conn);
            base_loop.run_in_loop(move || {
                for i in 0..COUNT {
                    conn.send(format!("{i}\n").as_bytes());
                }
            });
        });
    });

    let expected: String = (0..COUNT).map(|i| format!("{i}\n")).collect();
    let mut stream = TcpStream::connect(addr).expect("connect");
    let mut received = vec![0u8; expected.len()];
    stream.read_exact(&mut received).expect("read all bytes");
    assert_eq!(received, expected.as_bytes());

    server.base_loop().quit();
    handle.join().unwrap();
}

#[test]
fn foreign_thread_quit_unblocks_run() {
    let (server, _addr, handle) = start_echo_server(0);
    let base_loop = server.base_loop().clone();

    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        base_loop.quit();
    });

    handle.join().expect("run() must return once quit() is observed");
}

#[test]
fn accept_burst_distributes_round_robin_over_three_workers() {
    let (server, addr, handle) = start_echo_server(3);

    let mut streams = Vec::new();
    for _ in 0..9 {
        streams.push(TcpStream::connect(addr).expect("connect"));
    }
    for mut s in streams {
        s.write_all(b"hi").expect("write");
        let mut buf = [0u8; 2];
        s.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"hi");
    }

    server.base_loop().quit();
    handle.join().unwrap();
}
