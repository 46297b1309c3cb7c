//! Owns the listening socket on the base loop and converts readability on
//! it into accepted connections.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket::Socket;

type NewConnectionCallback = Box<dyn Fn(Socket, SocketAddr) + Send + Sync>;

pub struct Acceptor {
    event_loop: EventLoop,
    socket: Socket,
    channel: Arc<Channel>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(event_loop: EventLoop, addr: SocketAddr, reuse_port: bool) -> std::io::Result<Arc<Acceptor>> {
        let socket = Socket::new_listener(addr, reuse_port)?;
        let channel = event_loop.new_channel(socket.as_raw_fd());
        event_loop.track_channel(&channel);

        let acceptor = Arc::new(Acceptor {
            event_loop,
            socket,
            channel,
            new_connection_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_receive_time| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        acceptor.channel.tie(&acceptor);

        Ok(acceptor)
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: Fn(Socket, SocketAddr) + Send + Sync + 'static,
    {
        *self.new_connection_cb.lock() = Some(Box::new(cb));
    }

    /// Starts accepting. Must run on the base loop.
    pub fn listen(&self) {
        self.channel.enable_reading();
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn handle_read(&self) {
        loop {
            match self.socket.accept() {
                Ok(Some((conn_socket, peer_addr))) => {
                    let cb = self.new_connection_cb.lock();
                    if let Some(cb) = cb.as_ref() {
                        cb(conn_socket, peer_addr);
                    }
                    // conn_socket dropped here if no callback is installed,
                    // closing the freshly accepted descriptor immediately.
                }
                Ok(None) => break,
                Err(e) => {
                    use std::io::ErrorKind::*;
                    match e.raw_os_error() {
                        Some(libc::EMFILE) | Some(libc::ENFILE) => {
                            log::error!("accept4 failed, out of file descriptors: {e}");
                        }
                        _ if matches!(e.kind(), Interrupted) => continue,
                        _ => log::warn!("accept4 failed: {e}"),
                    }
                    break;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}
