//! The per-client state machine: buffers, channel, user callbacks, and the
//! thread-affinity discipline that keeps all of it touched only by its
//! owning loop's thread.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket::Socket;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

pub type ConnectionCallback = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(&Arc<Connection>, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type HighWaterMarkCallback = Box<dyn Fn(&Arc<Connection>, usize) + Send + Sync>;
pub type CloseCallback = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;

struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

impl Default for Callbacks {
    fn default() -> Callbacks {
        Callbacks {
            connection: None,
            message: None,
            write_complete: None,
            high_water_mark: None,
            close: None,
        }
    }
}

struct Buffers {
    input: Buffer,
    output: Buffer,
}

/// A live (or recently-live) TCP connection.
///
/// Always reached through `Arc<Connection>`: the server's connection map
/// holds one strong reference, and the channel's `handle_event` dispatch
/// holds a second, temporary one (promoted from a weak tie) for the
/// duration of each callback batch.
pub struct Connection {
    name: String,
    event_loop: EventLoop,
    socket: Socket,
    channel: Arc<Channel>,
    state: AtomicU8,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    buffers: Mutex<Buffers>,
    callbacks: Mutex<Callbacks>,
    high_water_mark: AtomicUsize,
    self_ref: Weak<Connection>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        event_loop: EventLoop,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<Connection> {
        let channel = event_loop.new_channel(socket.as_raw_fd());
        event_loop.track_channel(&channel);

        let _ = socket.set_keepalive(true);

        let conn = Arc::new_cyclic(|weak| Connection {
            name,
            event_loop: event_loop.clone(),
            socket,
            channel: channel.clone(),
            state: AtomicU8::new(State::Connecting as u8),
            local_addr,
            peer_addr,
            buffers: Mutex::new(Buffers {
                input: Buffer::new(),
                output: Buffer::new(),
            }),
            callbacks: Mutex::new(Callbacks::default()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            self_ref: weak.clone(),
        });

        let weak = Arc::downgrade(&conn);
        channel.set_read_callback(move |receive_time| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(receive_time);
            }
        });
        let weak = Arc::downgrade(&conn);
        channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = Arc::downgrade(&conn);
        channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = Arc::downgrade(&conn);
        channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });
        channel.tie(&conn);

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> std::os::fd::RawFd {
        self.socket.as_raw_fd()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.callbacks.lock().connection = Some(Box::new(cb));
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<Connection>, &mut Buffer, Instant) + Send + Sync + 'static,
    {
        self.callbacks.lock().message = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.callbacks.lock().write_complete = Some(Box::new(cb));
    }

    pub fn set_high_water_mark_callback<F>(&self, cb: F, threshold: usize)
    where
        F: Fn(&Arc<Connection>, usize) + Send + Sync + 'static,
    {
        self.callbacks.lock().high_water_mark = Some(Box::new(cb));
        self.high_water_mark.store(threshold, Ordering::SeqCst);
    }

    pub(crate) fn set_close_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.callbacks.lock().close = Some(Box::new(cb));
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::SeqCst)
    }

    /// Recovers the `Arc` this connection is always reached through, for
    /// capturing in deferred closures. Only fails if called after every
    /// other strong reference has already been dropped.
    fn arc(&self) -> Arc<Connection> {
        self.self_ref.upgrade().expect("connection outlived its own Arc")
    }

    /// Called once, on the owning loop, when the connection is handed over
    /// by the server. Moves `Connecting -> Connected` and starts reading.
    pub(crate) fn connect_established(&self) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        debug_assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        self.channel.enable_reading();
        log::debug!("connection {} established", self.name);
        let arc = self.arc();
        if let Some(cb) = &self.callbacks.lock().connection {
            cb(&arc);
        }
    }

    /// Called once, on the owning loop, when the connection is being torn
    /// down for good.
    pub(crate) fn connect_destroyed(&self) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            let arc = self.arc();
            if let Some(cb) = &self.callbacks.lock().connection {
                cb(&arc);
            }
        }
        self.channel.remove();
    }

    /// Queues `data` for writing. Thread-safe: hops to the owning loop if
    /// called from elsewhere.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            log::warn!("connection {} is not connected, give up writing", self.name);
            return;
        }
        let owned = data.to_vec();
        let this = self.arc();
        self.event_loop.run_in_loop(move || this.send_in_loop(&owned));
    }

    fn send_in_loop(&self, data: &[u8]) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        if self.state() == State::Disconnected {
            log::warn!("connection {} disconnected, give up writing", self.name);
            return;
        }

        let mut written = 0usize;
        let mut fault = false;

        if !self.channel.is_writing() && self.buffers.lock().output.is_empty() {
            match self.socket_write(data) {
                Ok(n) => {
                    written = n;
                    if written == data.len() && self.callbacks.lock().write_complete.is_some() {
                        let this = self.arc();
                        self.event_loop.queue_in_loop(move || {
                            if let Some(cb) = this.callbacks.lock().write_complete.as_ref() {
                                cb(&this);
                            }
                        });
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        log::warn!("connection {} write failed: {e}", self.name);
                        fault = true;
                    } else {
                        log::error!("connection {} unexpected write error: {e}", self.name);
                    }
                }
            }
        }

        if !fault && written < data.len() {
            let remaining = &data[written..];
            let (old_readable, new_total) = {
                let mut buffers = self.buffers.lock();
                let old_readable = buffers.output.readable_bytes();
                buffers.output.append(remaining);
                (old_readable, buffers.output.readable_bytes())
            };

            let high_water_mark = self.high_water_mark();
            if old_readable < high_water_mark
                && new_total >= high_water_mark
                && self.callbacks.lock().high_water_mark.is_some()
            {
                let this = self.arc();
                self.event_loop.queue_in_loop(move || {
                    if let Some(cb) = this.callbacks.lock().high_water_mark.as_ref() {
                        cb(&this, new_total);
                    }
                });
            }

            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn socket_write(&self, data: &[u8]) -> std::io::Result<usize> {
        let n = syscall!(write(
            self.fd(),
            data.as_ptr() as *const libc::c_void,
            data.len()
        ))?;
        Ok(n as usize)
    }

    /// Requests a graceful half-close. Thread-safe.
    pub fn shutdown(&self) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let this = self.arc();
            self.event_loop.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        if !self.channel.is_writing() {
            let _ = self.socket.shutdown_write();
        }
        // else: still flushing the output buffer; `handle_write` will call
        // this again once it drains.
    }

    pub fn set_nodelay(&self, on: bool) -> std::io::Result<()> {
        self.socket.set_nodelay(on)
    }

    fn handle_read(&self, receive_time: Instant) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        let result = self.buffers.lock().input.read_fd(self.fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(_n) => {
                if let Some(cb) = self.callbacks.lock().message.as_ref() {
                    let arc = self.arc();
                    let mut buffers = self.buffers.lock();
                    cb(&arc, &mut buffers.input, receive_time);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::error!("connection {} read error: {e}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        if !self.channel.is_writing() {
            log::trace!("connection {} not writing, ignore write event", self.name);
            return;
        }

        let result = self.buffers.lock().output.write_fd(self.fd());
        match result {
            Ok(n) => {
                self.buffers.lock().output.retrieve(n);
                if self.buffers.lock().output.is_empty() {
                    self.channel.disable_writing();
                    if self.callbacks.lock().write_complete.is_some() {
                        let this = self.arc();
                        self.event_loop.queue_in_loop(move || {
                            if let Some(cb) = this.callbacks.lock().write_complete.as_ref() {
                                cb(&this);
                            }
                        });
                    }
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::error!("connection {} write error: {e}", self.name);
            }
        }
    }

    fn handle_close(&self) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        debug_assert!(matches!(self.state(), State::Connected | State::Disconnecting));
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        let arc = self.arc();
        if let Some(cb) = &self.callbacks.lock().connection {
            cb(&arc);
        }
        // The server's close callback is responsible for erasing this
        // connection from its map and deferring `connect_destroyed`.
        if let Some(cb) = &self.callbacks.lock().close {
            cb(&arc);
        }
    }

    fn handle_error(&self) {
        if let Ok(Some(err)) = self.socket.take_error() {
            log::error!("connection {} SO_ERROR: {err}", self.name);
        } else {
            log::error!("connection {} handle_error called with no pending error", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for s in [State::Connecting, State::Connected, State::Disconnecting, State::Disconnected] {
            assert_eq!(State::from_u8(s as u8), s);
        }
    }
}
