//! Accepting new connections.
//!
//! The acceptor owns the listening socket and its channel and turns
//! readable events into `accept4` calls, handing each accepted descriptor
//! to a callback. It accepts in a loop until the kernel says there's
//! nothing left, so one readiness event drains the whole backlog.
//!
//! The one interesting bit is running out of file descriptors: `accept`
//! then fails with EMFILE but the connection stays in the backlog, keeping
//! the listening socket readable forever. The classic way out is to hold a
//! spare descriptor in reserve, close it, accept the connection into the
//! freed slot, close that too, and re-arm the spare.

use std::cell::RefCell;
use std::mem;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use nix::errno::Errno;
use tracing::{error, info};

use crate::addr::InetAddress;
use crate::channel::{Channel, SharedChannel};
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::sockets::{self, Socket};

/// Called once per accepted connection, on the acceptor's loop thread.
pub type NewConnectionCallback = Box<dyn FnMut(OwnedFd, InetAddress)>;

/// The listening side of a server.
pub struct Acceptor {
    socket: Socket,
    channel: SharedChannel,
    addr: InetAddress,
    idle_fd: Option<OwnedFd>,
    listening: bool,
    new_connection: Option<NewConnectionCallback>,
}

impl Acceptor {
    /// A bound (but not yet listening) acceptor.
    ///
    /// `SO_REUSEADDR` is always set; `SO_REUSEPORT` on request. Binding
    /// port 0 works; ask [`addr`](Acceptor::addr) for the real port.
    pub fn new(
        event_loop: &mut EventLoop,
        listen_addr: &InetAddress,
        reuse_port: bool,
    ) -> Result<Rc<RefCell<Acceptor>>> {
        event_loop.assert_in_loop_thread();
        let socket = Socket::nonblocking()?;
        socket.set_reuse_addr(true);
        if reuse_port {
            socket.set_reuse_port(true);
        }
        socket.bind_addr(listen_addr);
        let addr = socket.local_addr();
        let channel = Channel::new(socket.fd());
        let acceptor = Rc::new(RefCell::new(Acceptor {
            socket,
            channel: Rc::clone(&channel),
            addr,
            idle_fd: Some(sockets::open_idle_fd()),
            listening: false,
            new_connection: None,
        }));
        let weak = Rc::downgrade(&acceptor);
        channel.borrow_mut().set_read_callback(move |lp, _time| {
            if let Some(acceptor) = weak.upgrade() {
                Acceptor::handle_read(&acceptor, lp);
            }
        });
        Ok(acceptor)
    }

    pub fn set_new_connection_callback(
        &mut self,
        cb: impl FnMut(OwnedFd, InetAddress) + 'static,
    ) {
        self.new_connection = Some(Box::new(cb));
    }

    /// The actually bound address.
    pub fn addr(&self) -> InetAddress {
        self.addr
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    /// Start listening and watching for readability.
    pub fn listen(this: &Rc<RefCell<Acceptor>>, event_loop: &mut EventLoop) {
        event_loop.assert_in_loop_thread();
        let channel = {
            let mut acceptor = this.borrow_mut();
            acceptor.listening = true;
            acceptor.socket.listen();
            Rc::clone(&acceptor.channel)
        };
        Channel::enable_reading(&channel, event_loop);
        info!(addr = %this.borrow().addr, "listening");
    }

    fn handle_read(this: &Rc<RefCell<Acceptor>>, event_loop: &mut EventLoop) {
        event_loop.assert_in_loop_thread();
        loop {
            let accepted = this.borrow().socket.accept();
            match accepted {
                Ok((fd, peer)) => {
                    let cb = this.borrow_mut().new_connection.take();
                    match cb {
                        Some(mut cb) => {
                            cb(fd, peer);
                            let mut acceptor = this.borrow_mut();
                            if acceptor.new_connection.is_none() {
                                acceptor.new_connection = Some(cb);
                            }
                        },
                        // Nobody wants it; dropping the fd closes it
                        None => info!(%peer, "no connection callback, refusing"),
                    }
                },
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) | Err(Errno::ECONNABORTED) => continue,
                Err(Errno::EMFILE) => Self::drain_one_over_limit(this),
                Err(errno) => {
                    error!(errno = %errno, "accept failed");
                    break;
                },
            }
        }
    }

    // Out of descriptors. Burn the spare to make room, accept the pending
    // connection, close it right away and re-arm the spare. The peer gets
    // a clean close instead of a connection hanging in the backlog.
    fn drain_one_over_limit(this: &Rc<RefCell<Acceptor>>) {
        error!("out of file descriptors, shedding one connection");
        let mut acceptor = this.borrow_mut();
        mem::drop(acceptor.idle_fd.take());
        match acceptor.socket.accept() {
            Ok((fd, peer)) => {
                info!(%peer, "shed a connection over the fd limit");
                mem::drop(fd);
            },
            Err(errno) => error!(errno = %errno, "accept for shedding failed"),
        }
        acceptor.idle_fd = Some(sockets::open_idle_fd());
    }
}
