//! Three-worker echo server, matching the end-to-end scenario the reactor
//! core is tested against: every byte a client sends comes straight back.

use std::sync::Arc;

use clap::Parser;
use reactorq::{EventLoop, PortOption, Server};

#[derive(Parser)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:7000")]
    listen: std::net::SocketAddr,

    /// Number of worker loops; 0 serves every connection on the base loop.
    #[arg(long, default_value_t = 3)]
    threads: usize,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let base_loop = EventLoop::new().expect("failed to create base EventLoop");
    let server = Server::new(base_loop.clone(), args.listen, "EchoServer".to_string(), PortOption::NoReusePort)
        .unwrap_or_else(|e| panic!("failed to bind {}: {e}", args.listen));

    server.set_thread_num(args.threads);
    server.set_connection_callback(|conn| {
        log::info!("{} {}", conn.name(), if conn.connected() { "UP" } else { "DOWN" });
    });
    server.set_message_callback(|conn, buf, _receive_time| {
        let echoed = buf.retrieve_all_as_vec();
        conn.send(&echoed);
    });

    log::info!("echo server listening on {}", args.listen);
    let _keep_alive: Arc<Server> = Arc::clone(&server);
    server.start();
    server.run();
}
