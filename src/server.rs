//! The TCP server.
//!
//! A [`TcpServer`] glues an [`Acceptor`](crate::acceptor::Acceptor) on the
//! base loop to a pool of worker loops. Each accepted connection gets
//! dealt to a worker round robin, built on that worker's thread, anchored
//! there and wired with the server's callbacks. The server keeps only a
//! name -> loop map for its own bookkeeping; the connections themselves
//! belong to their loops.
//!
//! The server is confined to the base loop's thread (construction, the
//! setters and `start` all happen there). The connection removal hook is
//! the one part that runs on worker threads, which is why the bookkeeping
//! map sits behind a mutex.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{info, warn};

use crate::acceptor::Acceptor;
use crate::addr::InetAddress;
use crate::buffer::Buffer;
use crate::timestamp::Timestamp;
use crate::connection::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
use crate::error::{fatal, Result};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::loop_thread::{EventLoopThreadPool, ThreadInitCallback};

/// Socket-option policy for the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOption {
    /// `SO_REUSEADDR` only (always on).
    ReuseAddr,
    /// `SO_REUSEADDR` plus `SO_REUSEPORT`, for running several binders.
    ReusePortReuseAddr,
}

// The part of the server the callbacks hang on to.
struct ServerInner {
    name: String,
    ip_port: String,
    next_conn_id: AtomicU64,
    // name -> the loop the connection lives on
    connections: Mutex<HashMap<String, Arc<LoopHandle>>>,
}

/// A multi-reactor TCP server.
pub struct TcpServer {
    base: Arc<LoopHandle>,
    acceptor: Rc<RefCell<Acceptor>>,
    pool: Rc<RefCell<EventLoopThreadPool>>,
    inner: Arc<ServerInner>,
    started: bool,
    thread_init: Option<ThreadInitCallback>,
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_cb: Option<(HighWaterMarkCallback, usize)>,
}

impl TcpServer {
    /// A server bound to `listen_addr`, not yet listening.
    ///
    /// Must be created on the base loop's thread; binding port 0 is fine,
    /// [`listen_addr`](TcpServer::listen_addr) reports the real port.
    pub fn new(
        base_loop: &mut EventLoop,
        listen_addr: &InetAddress,
        name: impl Into<String>,
        option: ServerOption,
    ) -> Result<TcpServer> {
        base_loop.assert_in_loop_thread();
        let name = name.into();
        let acceptor = Acceptor::new(
            base_loop,
            listen_addr,
            option == ServerOption::ReusePortReuseAddr,
        )?;
        let ip_port = acceptor.borrow().addr().ip_port();
        let pool = EventLoopThreadPool::new(base_loop.handle(), format!("{}-worker", name));
        Ok(TcpServer {
            base: base_loop.handle(),
            acceptor,
            pool: Rc::new(RefCell::new(pool)),
            inner: Arc::new(ServerInner {
                name,
                ip_port,
                next_conn_id: AtomicU64::new(0),
                connections: Mutex::new(HashMap::new()),
            }),
            started: false,
            thread_init: None,
            connection_cb: None,
            message_cb: None,
            write_complete_cb: None,
            high_water_cb: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bound address as `ip:port`.
    pub fn ip_port(&self) -> String {
        self.inner.ip_port.clone()
    }

    /// The bound address.
    pub fn listen_addr(&self) -> InetAddress {
        self.acceptor.borrow().addr()
    }

    /// The handle of the base loop the server was built on.
    pub fn base_loop(&self) -> Arc<LoopHandle> {
        Arc::clone(&self.base)
    }

    /// How many worker loops to run. Zero means all connections share the
    /// base loop. Must be called before [`start`](TcpServer::start).
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.pool.borrow_mut().set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&mut self, cb: impl Fn(&mut TcpConnection) + Send + Sync + 'static) {
        self.connection_cb = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &mut self,
        cb: impl Fn(&mut TcpConnection, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        self.message_cb = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(&mut self, cb: impl Fn(&mut TcpConnection) + Send + Sync + 'static) {
        self.write_complete_cb = Some(Arc::new(cb));
    }

    /// See [`TcpConnection::set_high_water_mark_callback`]; applied to
    /// every connection this server accepts.
    pub fn set_high_water_mark_callback(
        &mut self,
        cb: impl Fn(&mut TcpConnection, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.high_water_cb = Some((Arc::new(cb), mark));
    }

    /// Run on each worker thread right after its loop is built.
    pub fn set_thread_init_callback(&mut self, cb: impl Fn(&mut EventLoop) + Send + Sync + 'static) {
        self.thread_init = Some(Arc::new(cb));
    }

    /// Spin up the workers and start listening.
    pub fn start(&mut self, base_loop: &mut EventLoop) {
        base_loop.assert_in_loop_thread();
        if self.started {
            fatal!(server = %self.inner.name, "server started twice");
        }
        self.started = true;
        self.pool.borrow_mut().start(base_loop, self.thread_init.clone());

        let inner = Arc::clone(&self.inner);
        let pool = Rc::clone(&self.pool);
        let connection_cb = self.connection_cb.clone();
        let message_cb = self.message_cb.clone();
        let write_complete_cb = self.write_complete_cb.clone();
        let high_water_cb = self.high_water_cb.clone();
        let close_cb = Self::make_close_callback(&self.inner);

        self.acceptor
            .borrow_mut()
            .set_new_connection_callback(move |fd, peer| {
                // Base loop thread: name the connection, pick its loop and
                // ship the rest of the construction over there.
                let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
                let conn_name = format!("{}-{}#{}", inner.name, inner.ip_port, id);
                let conn_loop = pool.borrow_mut().get_next_loop();
                info!(server = %inner.name, conn = %conn_name, peer = %peer, "new connection");
                inner
                    .connections
                    .lock()
                    .unwrap()
                    .insert(conn_name.clone(), Arc::clone(&conn_loop));

                let connection_cb = connection_cb.clone();
                let message_cb = message_cb.clone();
                let write_complete_cb = write_complete_cb.clone();
                let high_water_cb = high_water_cb.clone();
                let close_cb = close_cb.clone();
                let task_name = conn_name.clone();
                let queued = conn_loop.queue_in_loop(move |lp| {
                    let conn = TcpConnection::new(lp.handle(), task_name.clone(), fd, peer);
                    {
                        let mut c = conn.borrow_mut();
                        if let Some(cb) = connection_cb {
                            c.set_connection_callback(cb);
                        }
                        if let Some(cb) = message_cb {
                            c.set_message_callback(cb);
                        }
                        if let Some(cb) = write_complete_cb {
                            c.set_write_complete_callback(cb);
                        }
                        if let Some((cb, mark)) = high_water_cb {
                            c.set_high_water_mark_callback(cb, mark);
                        }
                        c.set_close_callback(close_cb);
                    }
                    let anchor: Rc<dyn Any> = Rc::clone(&conn) as Rc<dyn Any>;
                    lp.retain(task_name, anchor);
                    TcpConnection::establish(&conn, lp);
                });
                if queued.is_err() {
                    warn!(conn = %conn_name, "target loop is gone, dropping the connection");
                    inner.connections.lock().unwrap().remove(&conn_name);
                }
            });

        Acceptor::listen(&self.acceptor, base_loop);
        info!(server = %self.inner.name, addr = %self.inner.ip_port, "server started");
    }

    // The hook a dying connection calls (on its own loop thread): forget
    // it in the books and queue the final teardown on its loop.
    fn make_close_callback(inner: &Arc<ServerInner>) -> CloseCallback {
        let weak_inner: Weak<ServerInner> = Arc::downgrade(inner);
        Arc::new(move |conn_name: &str| {
            let Some(inner) = weak_inner.upgrade() else {
                return;
            };
            let conn_loop = inner.connections.lock().unwrap().remove(conn_name);
            info!(server = %inner.name, conn = conn_name, "removing connection");
            if let Some(conn_loop) = conn_loop {
                let conn_name = conn_name.to_string();
                let _ = conn_loop.queue_in_loop(move |lp| {
                    if let Some(any) = lp.release(&conn_name) {
                        if let Ok(conn) = any.downcast::<RefCell<TcpConnection>>() {
                            TcpConnection::destroy(&conn, lp);
                        }
                    }
                });
            }
        })
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // Send every surviving connection its teardown; the worker loops
        // are still alive here, they stop when the pool drops after us.
        let connections = std::mem::take(&mut *self.inner.connections.lock().unwrap());
        for (conn_name, conn_loop) in connections {
            let _ = conn_loop.queue_in_loop(move |lp| {
                if let Some(any) = lp.release(&conn_name) {
                    if let Ok(conn) = any.downcast::<RefCell<TcpConnection>>() {
                        TcpConnection::destroy(&conn, lp);
                    }
                }
            });
        }
    }
}
