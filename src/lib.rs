//! A multi-reactor, non-blocking TCP server library for Linux.
//!
//! The reactor core is one [`EventLoop`](event_loop::EventLoop) per OS
//! thread, a [`Channel`](channel::Channel) binding each descriptor to its
//! interest mask and callbacks, and a level-triggered
//! [`epoll`](poller::Selector) multiplexer underneath. [`Server`] wires an
//! [`Acceptor`](acceptor::Acceptor) and a round-robin worker
//! [`EventLoopThreadPool`](thread_pool::EventLoopThreadPool) together so
//! that a caller only has to supply the four connection callbacks.
//!
//! ```no_run
//! use std::sync::Arc;
//! use reactorq::{EventLoop, PortOption, Server};
//!
//! let base_loop = EventLoop::new().expect("create base loop");
//! let server = Server::new(
//!     base_loop.clone(),
//!     "127.0.0.1:7000".parse().unwrap(),
//!     "EchoServer".to_string(),
//!     PortOption::NoReusePort,
//! )
//! .expect("bind listener");
//! server.set_thread_num(3);
//! server.set_message_callback(|conn, buf, _time| {
//!     let bytes = buf.retrieve_all_as_vec();
//!     conn.send(&bytes);
//! });
//! server.start();
//! # let _ = Arc::clone(&server);
//! // server.run(); // blocks the calling thread
//! ```

#[macro_use]
mod macros;

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod event_loop;
pub mod interest;
pub mod loop_thread;
pub mod poller;
pub mod server;
pub mod socket;
pub mod thread_pool;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::Channel;
pub use connection::{Connection, State as ConnectionState};
pub use event_loop::EventLoop;
pub use interest::Interest;
pub use loop_thread::LoopThread;
pub use server::{PortOption, Server};
pub use socket::Socket;
pub use thread_pool::EventLoopThreadPool;
