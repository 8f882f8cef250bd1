//! The readiness backend.
//!
//! A [`Poller`] owns one epoll instance, the map of channels registered on
//! it and a scratch array for the events the kernel hands back. There are
//! exactly two useful flavours of readiness notification in practice, so
//! instead of an inheritance tree of backends there's a single
//! implementation with a [`Trigger`] tag picked at construction.
//!
//! The registration protocol is a small state machine per channel (see
//! [`PollState`]): a channel the kernel has never seen gets an ADD, an
//! added channel whose interest went empty gets a DEL but stays in the map
//! (it tends to come back), and removal proper erases it everywhere.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use libc::c_int;
use nix::errno::Errno;
use tracing::{error, trace};

use crate::channel::{PollState, SharedChannel};
use crate::error::{fatal, Result};
use crate::timestamp::Timestamp;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// How the kernel should report readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Report as long as the condition holds. The default; forgiving to
    /// callbacks that don't drain everything in one go.
    Level,
    /// Report only on changes. Fewer wakeups, stricter contract.
    Edge,
}

fn empty_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}

/// The epoll wrapper one event loop owns.
pub struct Poller {
    epoll: OwnedFd,
    trigger: Trigger,
    channels: HashMap<RawFd, SharedChannel>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new(trigger: Trigger) -> Result<Poller> {
        // SAFETY: plain syscall, we own the resulting fd
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Errno::last().into());
        }
        Ok(Poller {
            // SAFETY: just created, ours
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            trigger,
            channels: HashMap::new(),
            events: vec![empty_event(); INIT_EVENT_LIST_SIZE],
        })
    }

    /// Wait up to `timeout_ms` for readiness and append every ready channel
    /// to `active`, with its received-event mask filled in.
    ///
    /// Returns the timestamp taken right after the wait; the loop passes it
    /// to the read callbacks as the receive time. An interrupted wait is
    /// retried silently; an actual error is logged and yields an empty
    /// batch. A wait that fills the whole scratch array doubles it for the
    /// next round.
    pub fn poll(&mut self, timeout_ms: i32, active: &mut Vec<SharedChannel>) -> Timestamp {
        loop {
            // SAFETY: the pointer and length describe our live scratch array
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    self.events.len() as c_int,
                    timeout_ms,
                )
            };
            let now = Timestamp::now();
            if n < 0 {
                let errno = Errno::last();
                if errno == Errno::EINTR {
                    // A signal; nothing happened, wait again
                    continue;
                }
                error!(errno = %errno, "epoll_wait failed");
                return now;
            }
            let n = n as usize;
            if n == 0 {
                trace!("nothing happened");
                return now;
            }
            trace!(count = n, "events happened");
            self.fill_active(n, active);
            if n == self.events.len() {
                // The kernel may have had more to say than we had room for
                self.events.resize(n * 2, empty_event());
            }
            return now;
        }
    }

    fn fill_active(&self, n: usize, active: &mut Vec<SharedChannel>) {
        for ev in &self.events[..n] {
            let fd = ev.u64 as RawFd;
            let channel = self
                .channels
                .get(&fd)
                .expect("kernel reported an fd the poller doesn't know");
            debug_assert_eq!(PollState::Added, channel.borrow().state());
            channel.borrow_mut().set_revents(ev.events);
            active.push(Rc::clone(channel));
        }
    }

    /// Bring the kernel's view of the channel in sync with its interest
    /// mask, moving it through the registration state machine.
    pub fn update_channel(&mut self, channel: &SharedChannel) {
        let (fd, state, none_event) = {
            let ch = channel.borrow();
            (ch.fd(), ch.state(), ch.is_none_event())
        };
        trace!(fd, ?state, "updating channel");
        match state {
            PollState::New | PollState::Deleted => {
                if state == PollState::New {
                    assert!(!self.channels.contains_key(&fd));
                    self.channels.insert(fd, Rc::clone(channel));
                } else {
                    // Coming back after an empty-interest spell
                    assert!(self
                        .channels
                        .get(&fd)
                        .map_or(false, |c| Rc::ptr_eq(c, channel)));
                }
                channel.borrow_mut().set_state(PollState::Added);
                self.update(libc::EPOLL_CTL_ADD, channel);
            },
            PollState::Added => {
                if none_event {
                    // Keep the map entry; only the kernel forgets it
                    self.update(libc::EPOLL_CTL_DEL, channel);
                    channel.borrow_mut().set_state(PollState::Deleted);
                } else {
                    self.update(libc::EPOLL_CTL_MOD, channel);
                }
            },
        }
    }

    /// Erase the channel from the poller entirely.
    ///
    /// Calling it again for an already-removed channel is a no-op (no
    /// kernel syscall either).
    pub fn remove_channel(&mut self, channel: &SharedChannel) {
        let (fd, state) = {
            let ch = channel.borrow();
            debug_assert!(ch.is_none_event());
            (ch.fd(), ch.state())
        };
        trace!(fd, "removing channel");
        if self.channels.remove(&fd).is_none() {
            return;
        }
        if state == PollState::Added {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.borrow_mut().set_state(PollState::New);
    }

    /// Is this exact channel (not merely its fd) registered here?
    pub fn has_channel(&self, channel: &SharedChannel) -> bool {
        self.channels
            .get(&channel.borrow().fd())
            .map_or(false, |c| Rc::ptr_eq(c, channel))
    }

    fn update(&self, op: c_int, channel: &SharedChannel) {
        let (fd, mut events) = {
            let ch = channel.borrow();
            (ch.fd(), ch.events())
        };
        if self.trigger == Trigger::Edge {
            events |= libc::EPOLLET as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: ev is a live struct and fd a real descriptor
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            let errno = Errno::last();
            if op == libc::EPOLL_CTL_ADD {
                // Failing to add is a bug in the caller, not a runtime
                // condition anyone can recover from
                fatal!(fd, errno = %errno, "epoll_ctl(ADD) failed");
            }
            error!(fd, op, errno = %errno, "epoll_ctl failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use crate::channel::{Channel, READ_EVENT};

    use super::*;

    fn os_pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(0, unsafe { libc::pipe(fds.as_mut_ptr()) });
        // SAFETY: freshly created fds, owned by nobody else
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn feed(fd: &OwnedFd) {
        let byte = [0u8; 1];
        let n = unsafe {
            libc::write(fd.as_raw_fd(), byte.as_ptr() as *const libc::c_void, 1)
        };
        assert_eq!(1, n);
    }

    #[test]
    fn registration_state_machine() {
        let mut poller = Poller::new(Trigger::Level).unwrap();
        let (r, w) = os_pipe();
        let channel = Channel::new(r.as_raw_fd());
        channel.borrow_mut().set_events(READ_EVENT);

        // New -> Added
        poller.update_channel(&channel);
        assert_eq!(PollState::Added, channel.borrow().state());
        assert!(poller.has_channel(&channel));

        // Readiness is delivered while added
        feed(&w);
        let mut active = Vec::new();
        poller.poll(0, &mut active);
        assert_eq!(1, active.len());
        assert!(Rc::ptr_eq(&active[0], &channel));
        assert_ne!(0, channel.borrow().revents() & READ_EVENT);

        // Empty interest -> Deleted; the kernel stops reporting, the map
        // still knows the channel
        channel.borrow_mut().set_events(0);
        poller.update_channel(&channel);
        assert_eq!(PollState::Deleted, channel.borrow().state());
        assert!(poller.has_channel(&channel));

        active.clear();
        poller.poll(0, &mut active);
        assert!(active.is_empty());

        // Re-enabling brings the events back
        channel.borrow_mut().set_events(READ_EVENT);
        poller.update_channel(&channel);
        assert_eq!(PollState::Added, channel.borrow().state());
        active.clear();
        poller.poll(0, &mut active);
        assert_eq!(1, active.len());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut poller = Poller::new(Trigger::Level).unwrap();
        let (r, _w) = os_pipe();
        let channel = Channel::new(r.as_raw_fd());
        channel.borrow_mut().set_events(READ_EVENT);
        poller.update_channel(&channel);

        channel.borrow_mut().set_events(0);
        poller.remove_channel(&channel);
        assert_eq!(PollState::New, channel.borrow().state());
        assert!(!poller.has_channel(&channel));

        // Second removal finds nothing to do
        poller.remove_channel(&channel);
        assert_eq!(PollState::New, channel.borrow().state());
    }

    #[test]
    fn edge_trigger_reports_once() {
        let mut poller = Poller::new(Trigger::Edge).unwrap();
        let (r, w) = os_pipe();
        let channel = Channel::new(r.as_raw_fd());
        channel.borrow_mut().set_events(READ_EVENT);
        poller.update_channel(&channel);

        feed(&w);
        let mut active = Vec::new();
        poller.poll(0, &mut active);
        assert_eq!(1, active.len());

        // Nothing read, but edge triggering stays silent until a new write
        active.clear();
        poller.poll(0, &mut active);
        assert!(active.is_empty());

        feed(&w);
        active.clear();
        poller.poll(0, &mut active);
        assert_eq!(1, active.len());
    }
}
