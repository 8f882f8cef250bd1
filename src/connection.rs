//! One established TCP connection.
//!
//! A [`TcpConnection`] bundles the socket, its channel, the receive and
//! send buffers and the user callbacks. It lives on exactly one loop and
//! is shared there as an `Rc`; the loop keeps it anchored under its name
//! for as long as it's alive (see
//! [`EventLoop::retain`](crate::EventLoop::retain)).
//!
//! Inside callbacks, user code gets `&mut TcpConnection` and calls
//! [`send`](TcpConnection::send), [`shutdown`](TcpConnection::shutdown)
//! and friends directly. Outside the loop thread there's
//! [`ConnectionHandle`], a `Send` face that routes everything through the
//! owning loop's task queue, so buffers and interest masks are only ever
//! touched on the loop thread.
//!
//! The state machine is small: `Connecting` until the loop picks the
//! connection up, `Connected` during normal life, `Disconnecting` once the
//! local side asked to go (the write half closes when the send buffer
//! drains), `Disconnected` when it's over. Peer half-close shows up as a
//! read of zero bytes and takes the close path.

use std::any::Any;
use std::cell::RefCell;
use std::mem;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use tracing::{debug, error, info, trace, warn};

use crate::addr::InetAddress;
use crate::buffer::Buffer;
use crate::channel::{Channel, SharedChannel};
use crate::error::Result;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sockets::Socket;
use crate::timestamp::Timestamp;

/// Where a connection stands in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Accepted, not yet picked up by its loop.
    Connecting = 0,
    /// Up and running.
    Connected = 1,
    /// Local side asked to close; flushing what's left.
    Disconnecting = 2,
    /// Over.
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(raw: u8) -> ConnState {
        match raw {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// Fired when a connection comes up and again when it goes down; look at
/// [`TcpConnection::connected`] to tell which.
pub type ConnectionCallback = Arc<dyn Fn(&mut TcpConnection) + Send + Sync>;
/// Fired when bytes arrived; the buffer holds everything not yet consumed.
pub type MessageCallback = Arc<dyn Fn(&mut TcpConnection, &mut Buffer, Timestamp) + Send + Sync>;
/// Fired when the send buffer drained completely.
pub type WriteCompleteCallback = Arc<dyn Fn(&mut TcpConnection) + Send + Sync>;
/// Fired once each time the queued send bytes cross the high-water mark
/// upwards; gets the queued size.
pub type HighWaterMarkCallback = Arc<dyn Fn(&mut TcpConnection, usize) + Send + Sync>;
// The server's hook for taking a dying connection out of its books; gets
// the connection name.
pub(crate) type CloseCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A connection as shared on its loop thread.
pub type SharedConnection = Rc<RefCell<TcpConnection>>;

const DEFAULT_HIGH_WATER: usize = 64 * 1024 * 1024;

/// Find a connection anchored on the loop under its name.
pub(crate) fn retained_connection(event_loop: &EventLoop, name: &str) -> Option<SharedConnection> {
    event_loop
        .retained(name)
        .and_then(|any| any.downcast::<RefCell<TcpConnection>>().ok())
}

/// An established TCP connection: socket + channel + buffers + callbacks.
pub struct TcpConnection {
    name: String,
    handle: Arc<LoopHandle>,
    state: Arc<AtomicU8>,
    socket: Socket,
    channel: SharedChannel,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    input: Buffer,
    output: Buffer,
    high_water_mark: usize,
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_cb: Option<HighWaterMarkCallback>,
    close_cb: Option<CloseCallback>,
    context: Option<Box<dyn Any>>,
}

impl TcpConnection {
    /// Wrap an accepted socket. The connection starts in `Connecting`;
    /// [`establish`](TcpConnection::establish) brings it to life once the
    /// callbacks are installed and the loop retains it.
    pub(crate) fn new(
        handle: Arc<LoopHandle>,
        name: String,
        fd: OwnedFd,
        peer_addr: InetAddress,
    ) -> SharedConnection {
        let socket = Socket::from_owned(fd);
        socket.set_keep_alive(true);
        let local_addr = socket.local_addr();
        let channel = Channel::new(socket.fd());
        let conn = Rc::new(RefCell::new(TcpConnection {
            name: name.clone(),
            handle,
            state: Arc::new(AtomicU8::new(ConnState::Connecting as u8)),
            socket,
            channel: Rc::clone(&channel),
            local_addr,
            peer_addr,
            input: Buffer::new(),
            output: Buffer::new(),
            high_water_mark: DEFAULT_HIGH_WATER,
            connection_cb: None,
            message_cb: None,
            write_complete_cb: None,
            high_water_cb: None,
            close_cb: None,
            context: None,
        }));

        {
            let mut ch = channel.borrow_mut();
            let weak = Rc::downgrade(&conn);
            ch.set_read_callback(move |lp, time| {
                if let Some(conn) = weak.upgrade() {
                    TcpConnection::handle_read(&conn, lp, time);
                }
            });
            let weak = Rc::downgrade(&conn);
            ch.set_write_callback(move |lp| {
                if let Some(conn) = weak.upgrade() {
                    TcpConnection::handle_write(&conn, lp);
                }
            });
            let weak = Rc::downgrade(&conn);
            ch.set_close_callback(move |lp| {
                if let Some(conn) = weak.upgrade() {
                    TcpConnection::handle_close(&conn, lp);
                }
            });
            let weak = Rc::downgrade(&conn);
            ch.set_error_callback(move |lp| {
                if let Some(conn) = weak.upgrade() {
                    TcpConnection::handle_error(&conn);
                }
            });
        }
        debug!(conn = %name, peer = %peer_addr, "connection created");
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddress {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Stash any user value on the connection.
    pub fn set_context(&mut self, context: Box<dyn Any>) {
        self.context = Some(context);
    }

    pub fn context(&self) -> Option<&dyn Any> {
        self.context.as_deref()
    }

    pub fn context_mut(&mut self) -> Option<&mut dyn Any> {
        self.context.as_deref_mut()
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        self.socket.set_tcp_nodelay(on);
    }

    pub fn set_connection_callback(&mut self, cb: ConnectionCallback) {
        self.connection_cb = Some(cb);
    }

    pub fn set_message_callback(&mut self, cb: MessageCallback) {
        self.message_cb = Some(cb);
    }

    pub fn set_write_complete_callback(&mut self, cb: WriteCompleteCallback) {
        self.write_complete_cb = Some(cb);
    }

    /// Install the high-water callback and the mark it watches.
    ///
    /// The callback fires once per upward crossing, evaluated when a send
    /// queues bytes; it does not re-fire while the level stays above the
    /// mark.
    pub fn set_high_water_mark_callback(&mut self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_cb = Some(cb);
        self.high_water_mark = mark;
    }

    pub(crate) fn set_close_callback(&mut self, cb: CloseCallback) {
        self.close_cb = Some(cb);
    }

    /// A `Send` face of this connection for other threads.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
            handle: Arc::clone(&self.handle),
        }
    }

    /// Send bytes down the connection.
    ///
    /// Tries the socket directly when nothing is queued yet; whatever
    /// doesn't fit goes to the send buffer and write interest is arranged
    /// through the task queue. Only callable on the loop thread (which is
    /// where all `&mut TcpConnection` access happens); other threads go
    /// through [`ConnectionHandle::send`].
    pub fn send(&mut self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            warn!(conn = %self.name, "send on a disconnected connection, dropping");
            return;
        }
        let mut written = 0;
        if !self.channel.borrow().is_writing() && self.output.readable_bytes() == 0 {
            // Nothing queued; often the whole thing fits in one go
            match self.socket.write(data) {
                Ok(n) => {
                    written = n;
                    if written == data.len() {
                        self.queue_write_complete();
                        return;
                    }
                },
                Err(Errno::EAGAIN) => (),
                Err(errno) => {
                    error!(conn = %self.name, errno = %errno, "send failed");
                    if errno == Errno::EPIPE || errno == Errno::ECONNRESET {
                        // The close will come through the channel shortly
                        return;
                    }
                },
            }
        }

        let remaining = &data[written..];
        let queued = self.output.readable_bytes();
        if queued + remaining.len() >= self.high_water_mark && queued < self.high_water_mark {
            self.queue_high_water(queued + remaining.len());
        }
        self.output.append(remaining);
        self.ensure_writing();
    }

    /// Close the write half once the send buffer drains; reads keep
    /// working until the peer closes too.
    pub fn shutdown(&mut self) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let name = self.name.clone();
            let _ = self.handle.queue_in_loop(move |lp| {
                if let Some(conn) = retained_connection(lp, &name) {
                    TcpConnection::shutdown_in_loop(&conn);
                }
            });
        }
    }

    /// Tear the connection down without waiting for pending writes.
    pub fn force_close(&mut self) {
        if matches!(self.state(), ConnState::Connected | ConnState::Disconnecting) {
            self.set_state(ConnState::Disconnecting);
            let name = self.name.clone();
            let _ = self.handle.queue_in_loop(move |lp| {
                if let Some(conn) = retained_connection(lp, &name) {
                    TcpConnection::handle_close(&conn, lp);
                }
            });
        }
    }

    // Arrange for write interest, through the queue so it can't collide
    // with a dispatch that's borrowing us right now.
    fn ensure_writing(&self) {
        if self.channel.borrow().is_writing() {
            return;
        }
        let name = self.name.clone();
        let _ = self.handle.queue_in_loop(move |lp| {
            if let Some(conn) = retained_connection(lp, &name) {
                let (channel, state) = {
                    let conn = conn.borrow();
                    (Rc::clone(&conn.channel), conn.state())
                };
                if state != ConnState::Disconnected && !channel.borrow().is_writing() {
                    Channel::enable_writing(&channel, lp);
                }
            }
        });
    }

    fn queue_write_complete(&self) {
        let Some(cb) = self.write_complete_cb.clone() else {
            return;
        };
        let name = self.name.clone();
        let _ = self.handle.queue_in_loop(move |lp| {
            if let Some(conn) = retained_connection(lp, &name) {
                cb(&mut conn.borrow_mut());
            }
        });
    }

    fn queue_high_water(&self, queued: usize) {
        warn!(conn = %self.name, queued, mark = self.high_water_mark, "send buffer over the high-water mark");
        let Some(cb) = self.high_water_cb.clone() else {
            return;
        };
        let name = self.name.clone();
        let _ = self.handle.queue_in_loop(move |lp| {
            if let Some(conn) = retained_connection(lp, &name) {
                cb(&mut conn.borrow_mut(), queued);
            }
        });
    }

    /// Bring the connection to life on its loop. Enables reading, ties the
    /// channel to us and tells the user.
    pub(crate) fn establish(this: &SharedConnection, event_loop: &mut EventLoop) {
        event_loop.assert_in_loop_thread();
        let channel = {
            let conn = this.borrow();
            assert_eq!(ConnState::Connecting, conn.state());
            conn.set_state(ConnState::Connected);
            let owner: Rc<dyn Any> = Rc::clone(this) as Rc<dyn Any>;
            conn.channel.borrow_mut().tie(&owner);
            Rc::clone(&conn.channel)
        };
        Channel::enable_reading(&channel, event_loop);
        info!(conn = %this.borrow().name, peer = %this.borrow().peer_addr, "connection up");
        Self::run_connection_callback(this);
    }

    /// The last act, on the loop: detach the channel from the poller and
    /// notify the user if nobody did yet (the force-closed path).
    pub(crate) fn destroy(this: &SharedConnection, event_loop: &mut EventLoop) {
        event_loop.assert_in_loop_thread();
        let channel = {
            let conn = this.borrow();
            if conn.state() == ConnState::Connected {
                conn.set_state(ConnState::Disconnected);
                Some(Rc::clone(&conn.channel))
            } else {
                None
            }
        };
        if let Some(channel) = channel {
            Channel::disable_all(&channel, event_loop);
            Self::run_connection_callback(this);
        }
        let channel = Rc::clone(&this.borrow().channel);
        Channel::remove(&channel, event_loop);
        info!(conn = %this.borrow().name, "connection destroyed");
    }

    fn run_connection_callback(this: &SharedConnection) {
        let cb = this.borrow().connection_cb.clone();
        match cb {
            Some(cb) => cb(&mut this.borrow_mut()),
            None => {
                let conn = this.borrow();
                info!(conn = %conn.name, up = conn.connected(), "connection state (no callback installed)");
            },
        }
    }

    fn handle_read(this: &SharedConnection, event_loop: &mut EventLoop, receive_time: Timestamp) {
        event_loop.assert_in_loop_thread();
        let read = {
            let conn = &mut *this.borrow_mut();
            if conn.state() == ConnState::Disconnected {
                return;
            }
            conn.input.read_fd(conn.socket.fd())
        };
        match read {
            Ok(0) => Self::handle_close(this, event_loop),
            Ok(n) => {
                trace!(conn = %this.borrow().name, bytes = n, "read");
                Self::run_message_callback(this, receive_time);
            },
            // Spurious readiness; the next event will try again
            Err(Errno::EAGAIN) => (),
            Err(errno) => {
                error!(conn = %this.borrow().name, errno = %errno, "read failed");
                Self::handle_error(this);
            },
        }
    }

    fn run_message_callback(this: &SharedConnection, receive_time: Timestamp) {
        let cb = this.borrow().message_cb.clone();
        let conn = &mut *this.borrow_mut();
        match cb {
            Some(cb) => {
                // Lend the input buffer out for the callback, then put it
                // back; whatever the callback didn't consume stays for the
                // next round (partial protocol messages).
                let mut input = mem::replace(&mut conn.input, Buffer::stolen());
                cb(conn, &mut input, receive_time);
                conn.input = input;
            },
            None => {
                let dropped = conn.input.readable_bytes();
                conn.input.retrieve_all();
                trace!(conn = %conn.name, dropped, "no message callback, discarding input");
            },
        }
    }

    fn handle_write(this: &SharedConnection, event_loop: &mut EventLoop) {
        event_loop.assert_in_loop_thread();
        let (drained, channel) = {
            let conn = &mut *this.borrow_mut();
            let channel = Rc::clone(&conn.channel);
            if !channel.borrow().is_writing() {
                // Interest went away while the event was in flight
                trace!(conn = %conn.name, "write event without write interest");
                return;
            }
            match conn.output.write_fd(conn.socket.fd()) {
                Ok(n) => {
                    conn.output.retrieve(n);
                    (conn.output.readable_bytes() == 0, channel)
                },
                Err(Errno::EAGAIN) => (false, channel),
                Err(errno) => {
                    error!(conn = %conn.name, errno = %errno, "write failed");
                    (false, channel)
                },
            }
        };
        if drained {
            Channel::disable_writing(&channel, event_loop);
            {
                let conn = this.borrow();
                conn.queue_write_complete();
            }
            if this.borrow().state() == ConnState::Disconnecting {
                Self::shutdown_in_loop(this);
            }
        }
    }

    fn shutdown_in_loop(this: &SharedConnection) {
        let conn = this.borrow();
        if !conn.channel.borrow().is_writing() {
            // Everything flushed; the peer gets its EOF now
            conn.socket.shutdown_write();
        }
        // Otherwise handle_write finishes the job once the buffer drains
    }

    fn handle_close(this: &SharedConnection, event_loop: &mut EventLoop) {
        event_loop.assert_in_loop_thread();
        let (channel, close_cb, name) = {
            let conn = this.borrow();
            match conn.state() {
                ConnState::Connected | ConnState::Disconnecting => (),
                // A second close path in the same batch finds nothing to do
                _ => {
                    debug!(conn = %conn.name, "close on an already dead connection");
                    return;
                },
            }
            info!(conn = %conn.name, state = ?conn.state(), "connection closing");
            conn.set_state(ConnState::Disconnected);
            (
                Rc::clone(&conn.channel),
                conn.close_cb.clone(),
                conn.name.clone(),
            )
        };
        Channel::disable_all(&channel, event_loop);
        Self::run_connection_callback(this);
        match close_cb {
            Some(cb) => cb(&name),
            // Nobody manages us; finish the teardown directly
            None => Self::destroy(this, event_loop),
        }
    }

    fn handle_error(this: &SharedConnection) {
        let conn = this.borrow();
        error!(conn = %conn.name, error = ?conn.socket.take_error(), "connection error");
    }
}

/// A `Send + Sync` reference to a connection living on some loop.
///
/// Everything routes through the owning loop's task queue, so the
/// connection's buffers and interest masks stay single-threaded. The
/// handle may outlive the connection; operations on a dead one are quietly
/// dropped (the bytes had nowhere to go anyway), operations on a dead
/// *loop* report [`LoopGone`](crate::error::Error::LoopGone).
#[derive(Clone)]
pub struct ConnectionHandle {
    name: String,
    state: Arc<AtomicU8>,
    handle: Arc<LoopHandle>,
}

impl ConnectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connected(&self) -> bool {
        ConnState::from_u8(self.state.load(Ordering::Acquire)) == ConnState::Connected
    }

    /// Send bytes from any thread.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        let data = data.into();
        let name = self.name.clone();
        self.handle.queue_in_loop(move |lp| {
            match retained_connection(lp, &name) {
                Some(conn) => conn.borrow_mut().send(&data),
                None => debug!(conn = %name, "send to a connection that is gone"),
            }
        })
    }

    /// Close the write half once pending sends drain.
    pub fn shutdown(&self) -> Result<()> {
        let name = self.name.clone();
        self.handle.queue_in_loop(move |lp| {
            if let Some(conn) = retained_connection(lp, &name) {
                conn.borrow_mut().shutdown();
            }
        })
    }

    /// Tear the connection down without flushing.
    pub fn force_close(&self) -> Result<()> {
        let name = self.name.clone();
        self.handle.queue_in_loop(move |lp| {
            if let Some(conn) = retained_connection(lp, &name) {
                conn.borrow_mut().force_close();
            }
        })
    }
}
