//! Hosting event loops on dedicated threads.
//!
//! An [`EventLoopThread`] spawns one thread, builds an
//! [`EventLoop`](crate::EventLoop) there and hands the caller the loop's
//! handle once the loop exists. The [`EventLoopThreadPool`] manages a row
//! of those and deals new connections to them round robin. The pool never
//! owns the base loop, only its handle; the base loop belongs to whoever
//! created it.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::error::fatal;
use crate::event_loop::{EventLoop, LoopHandle};

/// Run on each child thread right after its loop is built, before the loop
/// starts looping. Handy for per-thread setup (affinity, metrics, names in
/// external systems).
pub type ThreadInitCallback = Arc<dyn Fn(&mut EventLoop) + Send + Sync>;

/// One thread, one loop.
pub struct EventLoopThread {
    name: String,
    handle: Option<Arc<LoopHandle>>,
    thread: Option<JoinHandle<()>>,
    init: Option<ThreadInitCallback>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> EventLoopThread {
        EventLoopThread {
            name: name.into(),
            handle: None,
            thread: None,
            init,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the thread and wait until its loop is up.
    ///
    /// Returns the child loop's handle. May be called once.
    pub fn start_loop(&mut self) -> Arc<LoopHandle> {
        assert!(self.thread.is_none());
        let (tx, rx) = mpsc::sync_channel(1);
        let init = self.init.take();
        let name = self.name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(e) => {
                        // Dropping tx is the failure signal; the parent dies on it
                        error!(thread = %name, error = %e, "can't create the event loop");
                        return;
                    },
                };
                if let Some(init) = init {
                    init(&mut event_loop);
                }
                let _ = tx.send(event_loop.handle());
                event_loop.run();
                info!(thread = %name, "event loop thread finished");
            });
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => fatal!(name = %self.name, error = %e, "can't spawn an event loop thread"),
        };
        let handle = match rx.recv() {
            Ok(handle) => handle,
            Err(_) => fatal!(name = %self.name, "event loop thread died during startup"),
        };
        self.thread = Some(thread);
        self.handle = Some(Arc::clone(&handle));
        handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(name = %self.name, "event loop thread panicked");
            }
        }
    }
}

/// A round-robin pool of worker loops.
///
/// With zero workers everything runs on the base loop; with more, each
/// request for a loop advances a cursor modulo the worker count. Confined
/// to the base loop's thread, like the server that drives it.
pub struct EventLoopThreadPool {
    base: Arc<LoopHandle>,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<LoopHandle>>,
}

impl EventLoopThreadPool {
    pub fn new(base: Arc<LoopHandle>, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// How many worker threads to run. Must be set before `start`.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started);
        self.num_threads = num_threads;
    }

    /// Spawn the workers (running `init` on each child thread first). With
    /// zero workers, `init` runs on the base loop instead.
    pub fn start(&mut self, base_loop: &mut EventLoop, init: Option<ThreadInitCallback>) {
        assert!(!self.started);
        base_loop.assert_in_loop_thread();
        self.started = true;
        for i in 0..self.num_threads {
            let mut thread = EventLoopThread::new(format!("{}{}", self.name, i), init.clone());
            self.loops.push(thread.start_loop());
            self.threads.push(thread);
        }
        if self.num_threads == 0 {
            if let Some(init) = init {
                init(base_loop);
            }
        }
    }

    /// The loop the next connection should live on.
    ///
    /// The base loop when there are no workers, otherwise round robin over
    /// the workers.
    pub fn get_next_loop(&mut self) -> Arc<LoopHandle> {
        assert!(self.started);
        if self.loops.is_empty() {
            return Arc::clone(&self.base);
        }
        let handle = Arc::clone(&self.loops[self.next]);
        self.next = (self.next + 1) % self.loops.len();
        handle
    }

    /// All the loops connections can land on (the base loop when there are
    /// no workers).
    pub fn get_all_loops(&self) -> Vec<Arc<LoopHandle>> {
        if self.loops.is_empty() {
            vec![Arc::clone(&self.base)]
        } else {
            self.loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn start_loop_runs_elsewhere() {
        let mut loop_thread = EventLoopThread::new("test-loop", None);
        let handle = loop_thread.start_loop();
        let (tx, rx) = mpsc::channel();
        handle
            .queue_in_loop(move |_lp| tx.send(thread::current().id()).unwrap())
            .unwrap();
        let loop_thread = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(thread::current().id(), loop_thread);
        // Drop joins the thread
    }

    #[test]
    fn init_runs_on_the_child_first() {
        let (tx, rx) = mpsc::channel();
        let init: ThreadInitCallback = {
            let tx = std::sync::Mutex::new(tx);
            Arc::new(move |lp| {
                let _ = tx.lock().unwrap().send(lp.id());
            })
        };
        let mut loop_thread = EventLoopThread::new("test-init", Some(init));
        let handle = loop_thread.start_loop();
        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(handle.id(), seen);
    }

    #[test]
    fn round_robin_cycles() {
        let mut base = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(base.handle(), "pool-test");
        pool.set_thread_num(2);
        pool.start(&mut base, None);

        let first = pool.get_next_loop();
        let second = pool.get_next_loop();
        let third = pool.get_next_loop();
        let fourth = pool.get_next_loop();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        assert!(Arc::ptr_eq(&second, &fourth));
        assert_eq!(2, pool.get_all_loops().len());
    }

    #[test]
    fn no_workers_means_base() {
        let mut base = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(base.handle(), "pool-base");
        pool.start(&mut base, None);
        let handle = pool.get_next_loop();
        assert!(Arc::ptr_eq(&handle, &pool.base));
    }
}
