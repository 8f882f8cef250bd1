//! The event loop itself.
//!
//! One [`EventLoop`] per thread, one thread per `EventLoop`. The loop owns
//! a [`Poller`](crate::Poller), dispatches ready channels and then
//! drains a queue of tasks other threads have posted. Everything the loop
//! owns (channels, buffers, the objects it retains) is confined to its
//! thread; the loop type itself is deliberately not `Send`, so it can never
//! wander off the thread that built it.
//!
//! For the rest of the world there is [`LoopHandle`]: a cheap, cloneable,
//! thread-safe face of the loop. Handles can queue tasks, ask for a quit
//! and nothing else; the tasks themselves then run on the loop's thread
//! with the full `&mut EventLoop` at hand. This split is the whole
//! threading model of the library: if you hold `&mut EventLoop`, you are
//! the loop thread; if you hold a handle, you go through the queue.
//!
//! The queue is woken through an eventfd that the loop watches like any
//! other channel. A self-pipe would do on systems without eventfd, but
//! this library is Linux-bound anyway.

use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use nix::errno::Errno;
use tracing::{error, info, trace};

use crate::channel::{Channel, SharedChannel};
use crate::error::{fatal, Error, Result};
use crate::poller::{Poller, Trigger};

/// How long one poll may block, in milliseconds.
///
/// Quit requests and queued tasks normally interrupt the wait through the
/// wakeup fd; the ceiling merely bounds the damage if a wakeup is lost.
const POLL_TIME_MS: i32 = 10_000;

/// A task submitted to a loop from outside.
pub type Task = Box<dyn FnOnce(&mut EventLoop) + Send>;

thread_local! {
    // Which loop claimed this thread, if any. Catches the bug of two loops
    // on one thread before it turns into cross-thread state corruption.
    static CURRENT_LOOP: Cell<Option<u64>> = const { Cell::new(None) };
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// The thread-safe face of an [`EventLoop`].
///
/// Cloned freely (it sits behind an `Arc`) and safe to keep long after the
/// loop is gone; operations on a dead loop report [`Error::LoopGone`].
pub struct LoopHandle {
    id: u64,
    thread: ThreadId,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
    alive: AtomicBool,
    wakeup_fd: OwnedFd,
}

impl LoopHandle {
    /// Is the calling thread the one the loop lives on?
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// An identifier of the loop, for logs and diagnostics.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a task for the loop to run on its own thread.
    ///
    /// Tasks from one submitting thread run in submission order, after the
    /// event dispatch of the iteration that picks them up. The loop is
    /// woken when the submitter is a foreign thread, or when the loop is
    /// just now running earlier tasks and would otherwise not re-check the
    /// queue before going back to sleep.
    pub fn queue_in_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) -> Result<()> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(Error::LoopGone);
        }
        self.pending.lock().unwrap().push(Box::new(task));
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
        Ok(())
    }

    /// Run a task on the loop's thread.
    ///
    /// From a foreign thread, queueing is the only option, so this is
    /// [`queue_in_loop`](LoopHandle::queue_in_loop) by another name. Code
    /// that already runs on the loop's thread holds `&mut EventLoop` and
    /// should call [`EventLoop::run_in_loop`] instead, which doesn't take
    /// the detour through the queue.
    pub fn run_in_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) -> Result<()> {
        self.queue_in_loop(task)
    }

    /// Ask the loop to stop once the current iteration finishes.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        // SAFETY: writes 8 bytes from a live u64 to our own eventfd
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!(loop_id = self.id, bytes = n, "wakeup write came up short");
        }
    }

    fn drain_wakeup(&self) {
        let mut counter: u64 = 0;
        // SAFETY: reads 8 bytes into a live u64 from our own eventfd
        let n = unsafe {
            libc::read(
                self.wakeup_fd.as_raw_fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!(loop_id = self.id, bytes = n, "wakeup read came up short");
        }
    }
}

/// A single-threaded dispatcher over a poller.
///
/// See the [module docs](self) for the threading model. Construction claims
/// the current thread; the loop asserts every mutation happens there.
pub struct EventLoop {
    handle: Arc<LoopHandle>,
    poller: Poller,
    active: Vec<SharedChannel>,
    active_fds: Vec<RawFd>,
    wakeup_channel: SharedChannel,
    current_active: Option<RawFd>,
    dispatching: bool,
    looping: bool,
    // Objects that live on this loop and are kept alive by it, keyed by
    // name. Outsiders refer to them by the key, through the task queue.
    anchors: HashMap<String, Rc<dyn Any>>,
}

impl EventLoop {
    /// A loop with the default (level-triggered) poller.
    pub fn new() -> Result<EventLoop> {
        EventLoop::with_trigger(Trigger::Level)
    }

    /// A loop with an explicitly chosen readiness flavour.
    pub fn with_trigger(trigger: Trigger) -> Result<EventLoop> {
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let poller = Poller::new(trigger)?;
        // SAFETY: plain eventfd(2), we own the result
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(Errno::last().into());
        }
        // SAFETY: just created, ours
        let wakeup_fd = unsafe { OwnedFd::from_raw_fd(wakeup_fd) };

        CURRENT_LOOP.with(|current| {
            if let Some(other) = current.get() {
                fatal!(loop_id = id, other, "two event loops on one thread");
            }
            current.set(Some(id));
        });

        let handle = Arc::new(LoopHandle {
            id,
            thread: thread::current().id(),
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            wakeup_fd,
        });
        let wakeup_channel = Channel::new(handle.wakeup_fd.as_raw_fd());
        {
            let handle = Arc::clone(&handle);
            wakeup_channel
                .borrow_mut()
                .set_read_callback(move |_lp, _time| handle.drain_wakeup());
        }

        let mut event_loop = EventLoop {
            handle,
            poller,
            active: Vec::new(),
            active_fds: Vec::new(),
            wakeup_channel: Rc::clone(&wakeup_channel),
            current_active: None,
            dispatching: false,
            looping: false,
            anchors: HashMap::new(),
        };
        Channel::enable_reading(&wakeup_channel, &mut event_loop);
        info!(loop_id = id, "event loop created");
        Ok(event_loop)
    }

    /// The thread-safe face of this loop.
    pub fn handle(&self) -> Arc<LoopHandle> {
        Arc::clone(&self.handle)
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.handle.is_in_loop_thread()
    }

    /// Die loudly when called off the owner thread. All the mutating entry
    /// points go through this.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            fatal!(loop_id = self.handle.id, "event loop touched from a foreign thread");
        }
    }

    /// Run a task right here, right now.
    ///
    /// Holding `&mut EventLoop` already proves the caller is on the owner
    /// thread (the loop never leaves it), so this is a direct call. The
    /// cross-thread counterpart is [`LoopHandle::queue_in_loop`].
    pub fn run_in_loop(&mut self, task: impl FnOnce(&mut EventLoop)) {
        task(self)
    }

    /// Keep an object alive on this loop under a key.
    ///
    /// The loop owns what lives on it; outside threads hold the key and
    /// reach the object through queued tasks.
    pub fn retain(&mut self, key: impl Into<String>, object: Rc<dyn Any>) {
        self.assert_in_loop_thread();
        self.anchors.insert(key.into(), object);
    }

    /// Drop the anchor, returning the object for a last goodbye.
    pub fn release(&mut self, key: &str) -> Option<Rc<dyn Any>> {
        self.assert_in_loop_thread();
        self.anchors.remove(key)
    }

    /// Borrow an anchored object by key.
    pub fn retained(&self, key: &str) -> Option<Rc<dyn Any>> {
        self.anchors.get(key).cloned()
    }

    /// The dispatch loop. Blocks until [`LoopHandle::quit`].
    ///
    /// Each iteration polls (10 s ceiling), dispatches the ready channels
    /// in the order the poller reported them, then drains the task queue.
    pub fn run(&mut self) {
        self.assert_in_loop_thread();
        assert!(!self.looping);
        self.looping = true;
        info!(loop_id = self.handle.id, "event loop start looping");

        while !self.handle.quit.load(Ordering::Acquire) {
            self.active.clear();
            let receive_time = self.poller.poll(POLL_TIME_MS, &mut self.active);

            // Take the batch out so dispatch can borrow the loop. The
            // allocation goes back afterwards; the scratch list is reused
            // across iterations.
            let batch = mem::take(&mut self.active);
            self.active_fds.clear();
            self.active_fds.extend(batch.iter().map(|ch| ch.borrow().fd()));
            self.dispatching = true;
            for channel in &batch {
                self.current_active = Some(channel.borrow().fd());
                Channel::handle_event(channel, self, receive_time);
            }
            self.current_active = None;
            self.dispatching = false;
            self.active = batch;

            self.pending_run();
        }

        info!(loop_id = self.handle.id, "event loop stop looping");
        self.looping = false;
    }

    /// Forward an interest change to the poller. Owner thread only.
    pub fn update_channel(&mut self, channel: &SharedChannel) {
        self.assert_in_loop_thread();
        self.poller.update_channel(channel);
    }

    /// Take a channel out of the poller. Owner thread only.
    ///
    /// During dispatch this is only sane for the channel currently being
    /// dispatched (a connection closing itself) or for one that isn't in
    /// the current batch at all; anything else would mean dispatching a
    /// channel somebody just pulled the rug from under.
    pub fn remove_channel(&mut self, channel: &SharedChannel) {
        self.assert_in_loop_thread();
        if self.dispatching {
            let fd = channel.borrow().fd();
            assert!(self.current_active == Some(fd) || !self.active_fds.contains(&fd));
        }
        self.poller.remove_channel(channel);
    }

    pub fn has_channel(&mut self, channel: &SharedChannel) -> bool {
        self.assert_in_loop_thread();
        self.poller.has_channel(channel)
    }

    fn pending_run(&mut self) {
        self.handle.calling_pending.store(true, Ordering::Release);
        // Swap the queue out and run outside the lock: the tasks may queue
        // more work without deadlocking, and submitters never wait on our
        // callbacks.
        let tasks = mem::take(&mut *self.handle.pending.lock().unwrap());
        let count = tasks.len();
        for task in tasks {
            task(self);
        }
        if count > 0 {
            trace!(loop_id = self.handle.id, count, "ran pending tasks");
        }
        self.handle.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.handle.alive.store(false, Ordering::Release);
        let wakeup_channel = Rc::clone(&self.wakeup_channel);
        Channel::disable_all(&wakeup_channel, self);
        Channel::remove(&wakeup_channel, self);
        CURRENT_LOOP.with(|current| current.set(None));
        info!(loop_id = self.handle.id, "event loop destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn run_in_loop_is_direct() {
        let mut event_loop = EventLoop::new().unwrap();
        let mut ran = false;
        event_loop.run_in_loop(|_lp| ran = true);
        assert!(ran);
    }

    #[test]
    fn quit_from_another_thread() {
        let (tx, rx) = mpsc::channel();
        let child = thread::spawn(move || {
            let mut event_loop = EventLoop::new().unwrap();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run();
        });
        let handle = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        handle.quit();
        child.join().unwrap();
    }

    #[test]
    fn queued_tasks_run_in_order_on_the_loop_thread() {
        let (tx, rx) = mpsc::channel();
        let child = thread::spawn(move || {
            let mut event_loop = EventLoop::new().unwrap();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run();
        });
        let handle = rx.recv().unwrap();

        let (order_tx, order_rx) = mpsc::channel();
        for i in 0..5 {
            let order_tx = order_tx.clone();
            handle
                .queue_in_loop(move |lp| {
                    assert!(lp.is_in_loop_thread());
                    order_tx.send((i, thread::current().id())).unwrap();
                })
                .unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(order_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        // FIFO from a single submitter, all on the same (loop) thread
        assert_eq!(vec![0, 1, 2, 3, 4], seen.iter().map(|(i, _)| *i).collect::<Vec<_>>());
        let loop_thread = seen[0].1;
        assert!(seen.iter().all(|(_, t)| *t == loop_thread));
        assert_ne!(thread::current().id(), loop_thread);

        handle.quit();
        child.join().unwrap();
    }

    #[test]
    fn tasks_queued_during_drain_still_run() {
        let (tx, rx) = mpsc::channel();
        let child = thread::spawn(move || {
            let mut event_loop = EventLoop::new().unwrap();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run();
        });
        let handle = rx.recv().unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        {
            let done_tx = done_tx.clone();
            handle
                .queue_in_loop(move |lp| {
                    // Re-enqueue from inside the drain; the loop must not
                    // sleep a full poll timeout before running it.
                    let inner = lp.handle();
                    let done_tx = done_tx.clone();
                    inner
                        .queue_in_loop(move |_lp| done_tx.send(()).unwrap())
                        .unwrap();
                })
                .unwrap();
        }
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("requeued task never ran");

        handle.quit();
        child.join().unwrap();
    }

    #[test]
    fn dead_loop_reports_gone() {
        let handle = {
            let event_loop = EventLoop::new().unwrap();
            event_loop.handle()
        };
        match handle.queue_in_loop(|_lp| ()) {
            Err(Error::LoopGone) => (),
            other => panic!("expected LoopGone, got {:?}", other),
        }
    }

    #[test]
    fn anchors_keep_and_release() {
        let mut event_loop = EventLoop::new().unwrap();
        let value: Rc<dyn Any> = Rc::new(42u32);
        event_loop.retain("answer", value);
        let back = event_loop.retained("answer").unwrap();
        assert_eq!(42, *back.downcast::<u32>().unwrap());
        assert!(event_loop.release("answer").is_some());
        assert!(event_loop.retained("answer").is_none());
    }
}
