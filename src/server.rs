//! Ties the acceptor, the thread pool, and the connection map together
//! into the single type applications construct.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::Connection;
use crate::event_loop::EventLoop;
use crate::socket::Socket;
use crate::thread_pool::EventLoopThreadPool;

// Stored as `Arc<dyn Fn>` rather than `Connection`'s own `Box<dyn Fn>`
// callback types: the server installs the same callback on every
// connection it creates, so it needs a cheaply cloneable handle to hand
// out per connection rather than a single owned closure.
type ServerConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
type ServerMessageCallback = Arc<dyn Fn(&Arc<Connection>, &mut Buffer, Instant) + Send + Sync>;
type ServerWriteCompleteCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Whether a second process may bind the same port concurrently
/// (`SO_REUSEPORT`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PortOption {
    NoReusePort,
    ReusePort,
}

struct Callbacks {
    connection: Option<ServerConnectionCallback>,
    message: Option<ServerMessageCallback>,
    write_complete: Option<ServerWriteCompleteCallback>,
}

impl Default for Callbacks {
    fn default() -> Callbacks {
        Callbacks {
            connection: None,
            message: None,
            write_complete: None,
        }
    }
}

pub struct Server {
    base_loop: EventLoop,
    name: String,
    acceptor: Arc<Acceptor>,
    thread_pool: Mutex<EventLoopThreadPool>,
    connections: Mutex<std::collections::HashMap<String, Arc<Connection>>>,
    callbacks: Mutex<Callbacks>,
    next_conn_id: Mutex<u64>,
    started: AtomicBool,
    self_ref: Weak<Server>,
}

impl Server {
    pub fn new(
        base_loop: EventLoop,
        listen_addr: SocketAddr,
        name: String,
        port_option: PortOption,
    ) -> std::io::Result<Arc<Server>> {
        let reuse_port = port_option == PortOption::ReusePort;
        let acceptor = Acceptor::new(base_loop.clone(), listen_addr, reuse_port)?;
        let thread_pool = EventLoopThreadPool::new(base_loop.clone(), name.clone());

        let server = Arc::new_cyclic(|weak| Server {
            base_loop,
            name,
            acceptor,
            thread_pool: Mutex::new(thread_pool),
            connections: Mutex::new(std::collections::HashMap::new()),
            callbacks: Mutex::new(Callbacks::default()),
            next_conn_id: Mutex::new(0),
            started: AtomicBool::new(false),
            self_ref: weak.clone(),
        });

        let weak = Arc::downgrade(&server);
        server.acceptor.set_new_connection_callback(move |socket, peer_addr| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(socket, peer_addr);
            }
        });

        Ok(server)
    }

    pub fn set_thread_num(&self, n: usize) {
        self.thread_pool.lock().set_thread_num(n);
    }

    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.callbacks.lock().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<Connection>, &mut Buffer, Instant) + Send + Sync + 'static,
    {
        self.callbacks.lock().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    /// Recovers the `Arc` this server is always reached through, for
    /// capturing in deferred closures.
    fn arc(&self) -> Arc<Server> {
        self.self_ref.upgrade().expect("server outlived its own Arc")
    }

    /// Idempotent: spawns the worker threads and starts accepting. Safe to
    /// call more than once; only the first call has any effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let init_cb: Option<fn(&EventLoop)> = None;
        self.thread_pool.lock().start(init_cb);

        let acceptor = Arc::clone(&self.acceptor);
        self.base_loop.run_in_loop(move || acceptor.listen());
    }

    /// Runs the base loop's dispatch cycle. Returns once `base_loop.quit()`
    /// takes effect.
    pub fn run(&self) {
        self.base_loop.run();
    }

    pub fn base_loop(&self) -> &EventLoop {
        &self.base_loop
    }

    /// The address the listening socket is bound to. Available immediately
    /// after `Server::new`, since binding happens synchronously there.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    fn new_connection(&self, socket: Socket, peer_addr: SocketAddr) {
        debug_assert!(self.base_loop.is_in_loop_thread());
        let worker_loop = self.thread_pool.lock().get_next_loop();

        let conn_id = {
            let mut next = self.next_conn_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let local_addr = match socket.local_addr() {
            Ok(a) => a,
            Err(e) => {
                log::warn!("getsockname failed for new connection: {e}");
                return;
            }
        };
        let conn_name = format!("{}-{}:{}#{}", self.name, peer_addr.ip(), peer_addr.port(), conn_id);

        log::debug!("{} - new connection {conn_name} from {peer_addr}", self.name);

        let connection = Connection::new(worker_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);

        {
            let callbacks = self.callbacks.lock();
            if let Some(cb) = callbacks.connection.clone() {
                connection.set_connection_callback(move |c| cb(c));
            }
            if let Some(cb) = callbacks.message.clone() {
                connection.set_message_callback(move |c, buf, t| cb(c, buf, t));
            }
            if let Some(cb) = callbacks.write_complete.clone() {
                connection.set_write_complete_callback(move |c| cb(c));
            }
        }

        let this = self.arc();
        connection.set_close_callback(move |c| this.remove_connection(c));

        self.connections.lock().insert(conn_name, Arc::clone(&connection));

        worker_loop.run_in_loop(move || connection.connect_established());
    }

    /// Called from a worker loop when a connection has finished closing.
    /// Defers to the base loop to erase the map entry, matching the
    /// server's thread-affinity discipline over its connection map.
    fn remove_connection(&self, conn: &Arc<Connection>) {
        let this = self.arc();
        let conn = Arc::clone(conn);
        self.base_loop.run_in_loop(move || this.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &Arc<Connection>) {
        debug_assert!(self.base_loop.is_in_loop_thread());
        log::debug!("{} - removing connection {}", self.name, conn.name());
        self.connections.lock().remove(conn.name());
        let conn = Arc::clone(conn);
        // Deferred, not inline: the channel currently dispatching this
        // connection's close callback must unwind before the connection
        // (and its channel) is torn down.
        conn.event_loop().queue_in_loop(move || conn.connect_destroyed());
    }
}
