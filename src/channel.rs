//! Per-descriptor event handles.
//!
//! A [`Channel`] binds one file descriptor to the callbacks interested in
//! it. It does not own the descriptor and never touches it; it only keeps
//! the interest mask, the mask of events the poller last saw, and the
//! routing logic from the latter to the right callback.
//!
//! Channels are confined to their loop's thread and shared there as
//! [`SharedChannel`]. Because a callback is allowed to reconfigure (or tear
//! down) its own channel, dispatch never holds a borrow across a callback:
//! the callback is taken out of its slot for the call and put back
//! afterwards. Taking it out also locks the slot against recursion, which
//! is exactly what we want.

use std::any::Any;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use tracing::{trace, warn};

use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

/// Callback for readable events; gets the poll timestamp of the batch.
pub type ReadCallback = Box<dyn FnMut(&mut EventLoop, Timestamp)>;
/// Callback for the remaining event kinds.
pub type EventCallback = Box<dyn FnMut(&mut EventLoop)>;

/// A channel as shared within its loop thread.
pub type SharedChannel = Rc<RefCell<Channel>>;

/// Where the channel currently stands with the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Never registered (or fully removed again).
    New,
    /// Registered and live in the kernel.
    Added,
    /// Known to the poller's map, but deregistered from the kernel because
    /// the interest mask went empty.
    Deleted,
}

pub(crate) const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;

const IN: u32 = libc::EPOLLIN as u32;
const PRI: u32 = libc::EPOLLPRI as u32;
const OUT: u32 = libc::EPOLLOUT as u32;
const HUP: u32 = libc::EPOLLHUP as u32;
const RDHUP: u32 = libc::EPOLLRDHUP as u32;
const ERR: u32 = libc::EPOLLERR as u32;

/// A per-fd event handle: interest mask plus callbacks.
pub struct Channel {
    fd: RawFd,
    events: u32,
    revents: u32,
    state: PollState,
    tie: Option<Weak<dyn Any>>,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl Channel {
    /// A channel for the given descriptor, with no interest and no
    /// callbacks yet. It enters the poller on the first interest change.
    pub fn new(fd: RawFd) -> SharedChannel {
        Rc::new(RefCell::new(Channel {
            fd,
            events: 0,
            revents: 0,
            state: PollState::New,
            tie: None,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> u32 {
        self.events
    }

    /// The poller writes the received mask here before dispatch.
    pub fn set_revents(&mut self, revents: u32) {
        self.revents = revents;
    }

    pub fn revents(&self) -> u32 {
        self.revents
    }

    pub(crate) fn state(&self) -> PollState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: PollState) {
        self.state = state;
    }

    #[cfg(test)]
    pub(crate) fn set_events(&mut self, events: u32) {
        self.events = events;
    }

    pub fn is_none_event(&self) -> bool {
        self.events == 0
    }

    pub fn is_reading(&self) -> bool {
        self.events & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events & WRITE_EVENT != 0
    }

    pub fn set_read_callback(&mut self, cb: impl FnMut(&mut EventLoop, Timestamp) + 'static) {
        self.read_cb = Some(Box::new(cb));
    }

    pub fn set_write_callback(&mut self, cb: impl FnMut(&mut EventLoop) + 'static) {
        self.write_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback(&mut self, cb: impl FnMut(&mut EventLoop) + 'static) {
        self.close_cb = Some(Box::new(cb));
    }

    pub fn set_error_callback(&mut self, cb: impl FnMut(&mut EventLoop) + 'static) {
        self.error_cb = Some(Box::new(cb));
    }

    /// Record a weak back-reference to the object logically owning this
    /// channel (typically a connection).
    ///
    /// While tied, dispatch first upgrades the reference and holds the
    /// strong copy across the callbacks; when the owner is already gone,
    /// dispatch is suppressed entirely. That is what keeps callbacks from
    /// running against a connection torn down earlier in the same batch.
    pub fn tie(&mut self, owner: &Rc<dyn Any>) {
        self.tie = Some(Rc::downgrade(owner));
    }

    pub fn enable_reading(this: &SharedChannel, event_loop: &mut EventLoop) {
        this.borrow_mut().events |= READ_EVENT;
        event_loop.update_channel(this);
    }

    pub fn disable_reading(this: &SharedChannel, event_loop: &mut EventLoop) {
        this.borrow_mut().events &= !READ_EVENT;
        event_loop.update_channel(this);
    }

    pub fn enable_writing(this: &SharedChannel, event_loop: &mut EventLoop) {
        this.borrow_mut().events |= WRITE_EVENT;
        event_loop.update_channel(this);
    }

    pub fn disable_writing(this: &SharedChannel, event_loop: &mut EventLoop) {
        this.borrow_mut().events &= !WRITE_EVENT;
        event_loop.update_channel(this);
    }

    pub fn disable_all(this: &SharedChannel, event_loop: &mut EventLoop) {
        this.borrow_mut().events = 0;
        event_loop.update_channel(this);
    }

    /// Take the channel out of the poller for good. The interest mask must
    /// already be empty.
    pub fn remove(this: &SharedChannel, event_loop: &mut EventLoop) {
        assert!(this.borrow().is_none_event());
        event_loop.remove_channel(this);
    }

    /// Route the received events to the callbacks.
    ///
    /// The order is fixed: hangup without pending input closes, errors
    /// report, readable kinds (input, urgent data, peer half-close) read,
    /// writability writes. At most one path may actually close the owner;
    /// the close path disables the channel, so the branches after it find
    /// nothing left to do.
    pub fn handle_event(this: &SharedChannel, event_loop: &mut EventLoop, receive_time: Timestamp) {
        let tie = this.borrow().tie.clone();
        match tie {
            Some(tie) => {
                // Hold the owner alive across the callbacks
                if let Some(_owner) = tie.upgrade() {
                    Self::dispatch(this, event_loop, receive_time);
                } else {
                    trace!(fd = this.borrow().fd, "owner is gone, suppressing dispatch");
                }
            },
            None => Self::dispatch(this, event_loop, receive_time),
        }
    }

    fn dispatch(this: &SharedChannel, event_loop: &mut EventLoop, receive_time: Timestamp) {
        let (fd, revents) = {
            let ch = this.borrow();
            (ch.fd, ch.revents)
        };
        trace!(fd, revents, "dispatching events");
        if revents & HUP != 0 && revents & IN == 0 {
            warn!(fd, "peer hung up");
            Self::invoke(this, event_loop, |ch| &mut ch.close_cb);
        }
        if revents & ERR != 0 {
            Self::invoke(this, event_loop, |ch| &mut ch.error_cb);
        }
        if revents & (IN | PRI | RDHUP) != 0 {
            Self::invoke_read(this, event_loop, receive_time);
        }
        if revents & OUT != 0 {
            Self::invoke(this, event_loop, |ch| &mut ch.write_cb);
        }
    }

    // Take the callback out, call it without holding any borrow, put it
    // back unless the callback installed a replacement meanwhile.
    fn invoke(
        this: &SharedChannel,
        event_loop: &mut EventLoop,
        slot: fn(&mut Channel) -> &mut Option<EventCallback>,
    ) {
        let cb = slot(&mut *this.borrow_mut()).take();
        if let Some(mut cb) = cb {
            cb(event_loop);
            let mut ch = this.borrow_mut();
            let slot = slot(&mut *ch);
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    fn invoke_read(this: &SharedChannel, event_loop: &mut EventLoop, receive_time: Timestamp) {
        let cb = this.borrow_mut().read_cb.take();
        if let Some(mut cb) = cb {
            cb(event_loop, receive_time);
            let mut ch = this.borrow_mut();
            if ch.read_cb.is_none() {
                ch.read_cb = Some(cb);
            }
        }
    }
}
