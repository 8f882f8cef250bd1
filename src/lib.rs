//! Hydra is a multi-reactor TCP networking library for Rust.
//!
//! # Motivation
//!
//! Why another networking library? Most of the ecosystem went the futures
//! way, and that's fine right up to the point where you want to know
//! exactly which thread touches which socket and when. Hydra goes with the
//! good old callback style over the classic "one loop per thread" design:
//! every connection is pinned to exactly one event loop, every loop owns
//! exactly one thread, and your callbacks run there, in order, with no
//! further synchronization to think about. Parallelism comes from running
//! several loops, not from sharing anything.
//!
//! The building blocks are the usual suspects. An [`EventLoop`] owns a
//! poller (epoll underneath, level-triggered by default) and dispatches
//! per-descriptor [`Channel`]s. A [`Buffer`] collects bytes on both sides
//! of a connection with cheap prepend headroom for length prefixes. A
//! [`TcpServer`] listens on a base loop and deals connections to a pool of
//! worker loops round robin.
//!
//! # Threading
//!
//! The rule is simple: whatever belongs to a loop is touched only on that
//! loop's thread. Other threads talk to a loop through its [`LoopHandle`]
//! (and to a connection through its [`ConnectionHandle`]); the work is
//! queued and the loop is woken through an eventfd, so it runs within one
//! poll cycle. Inside callbacks you already are on the right thread and
//! operate on the connection directly.
//!
//! # Example
//!
//! ```no_run
//! use hydra::{EventLoop, InetAddress, ServerOption, TcpServer};
//!
//! fn main() -> hydra::error::Result<()> {
//!     let mut base = EventLoop::new()?;
//!     let mut server = TcpServer::new(
//!         &mut base,
//!         &InetAddress::any(7),
//!         "echo",
//!         ServerOption::ReuseAddr,
//!     )?;
//!     server.set_thread_num(4);
//!     server.set_message_callback(|conn, buf, _time| {
//!         let data = buf.take_all();
//!         conn.send(&data);
//!     });
//!     server.start(&mut base);
//!     base.run();
//!     Ok(())
//! }
//! ```
//!
//! # Status
//!
//! Linux only (epoll and eventfd are baked in; a kqueue backend would slot
//! behind the same poller interface, but nobody has needed it yet). TLS,
//! UDP and anything above a byte stream are out of scope on purpose.

pub mod error;

mod acceptor;
mod addr;
mod buffer;
mod channel;
mod connection;
mod event_loop;
mod loop_thread;
mod poller;
mod server;
mod sockets;
mod timestamp;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use addr::InetAddress;
pub use buffer::Buffer;
pub use channel::{Channel, EventCallback, PollState, ReadCallback, SharedChannel};
pub use connection::{
    ConnState, ConnectionCallback, ConnectionHandle, HighWaterMarkCallback, MessageCallback,
    SharedConnection, TcpConnection, WriteCompleteCallback,
};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use loop_thread::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use poller::{Poller, Trigger};
pub use server::{ServerOption, TcpServer};
pub use sockets::Socket;
pub use timestamp::Timestamp;
