//! Single-threaded cooperative event loop.

use crate::channel::Channel;
use crate::poller::Poller;
use mio::{Token, Waker};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{error, trace, warn};

/// Reserved token for the cross-thread wake-up descriptor.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Upper bound on a single blocking wait. Cross-thread wake-ups cut it
/// shorter; this only floors how long a completely idle loop can go without
/// surfacing.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce() + Send>;

/// A single-threaded cooperative scheduler over a readiness poller.
///
/// The loop is pinned to the thread that calls [`run`](EventLoop::run); all
/// channel registry mutation and poller calls happen on that thread. Other
/// threads hand work to the loop with [`queue_in_loop`](EventLoop::queue_in_loop),
/// which wakes the loop out of its blocking wait.
///
/// The channel registry holds weak references only. The strong references
/// live with each channel's owner; a channel whose owner dropped simply
/// vanishes from the registry on the next dispatch or mutation.
pub struct EventLoop {
    poller: Mutex<Poller>,
    waker: Waker,
    pending: Mutex<Vec<Task>>,
    channels: Mutex<HashMap<Token, Weak<Channel>>>,
    owner: OnceLock<ThreadId>,
    running: AtomicBool,
}

impl EventLoop {
    pub fn new() -> io::Result<Arc<EventLoop>> {
        let poller = Poller::new()?;
        let waker = Waker::new(poller.registry(), WAKE_TOKEN)?;
        Ok(Arc::new(EventLoop {
            poller: Mutex::new(poller),
            waker,
            pending: Mutex::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
            owner: OnceLock::new(),
            running: AtomicBool::new(true),
        }))
    }

    /// Whether the calling thread is the one the loop is bound to. Before
    /// `run` has been called this is false for every thread.
    pub fn is_owner_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    /// Runs the loop until [`stop`](EventLoop::stop) is called. The invoking
    /// thread becomes the owner; a second `run` from a different thread is
    /// rejected.
    pub fn run(&self) {
        if self.owner.set(thread::current().id()).is_err() && !self.is_owner_thread() {
            error!("event loop is already bound to another thread");
            return;
        }

        while self.running.load(Ordering::Acquire) {
            self.run_pending_tasks();

            let events = {
                let mut poller = self.poller.lock().unwrap();
                poller.wait(Some(POLL_TIMEOUT))
            };
            let events = match events {
                Ok(events) => events,
                Err(e) => {
                    error!(error = %e, "poller wait failed");
                    continue;
                }
            };

            for (token, ready) in events {
                if token == WAKE_TOKEN {
                    // The waker resets itself; the wake-up only had to
                    // interrupt the wait.
                    continue;
                }
                let channel = self.channels.lock().unwrap().get(&token).cloned();
                match channel.and_then(|weak| weak.upgrade()) {
                    Some(channel) => channel.handle_ready(ready),
                    None => trace!(token = token.0, "channel expired, skipping event"),
                }
            }

            // Favor low latency for work queued by the callbacks above.
            self.run_pending_tasks();
        }

        self.run_pending_tasks();
        trace!("event loop exited");
    }

    /// Flags shutdown and wakes the loop. Safe from any thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wakeup();
    }

    /// Runs `task` immediately when called on the owner thread, otherwise
    /// queues it.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_owner_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Unconditionally queues `task` for the owner thread and wakes the loop.
    ///
    /// Tasks queued from one thread run in that thread's queueing order; no
    /// order is guaranteed across producer threads.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.lock().unwrap().push(Box::new(task));
        self.wakeup();
    }

    /// Applies the channel's current interest mask to the poller. Must run on
    /// the owner thread; channels route here through their own update path.
    pub fn update_channel(&self, channel: &Arc<Channel>) {
        debug_assert!(self.is_owner_thread());
        let fd = channel.fd();
        let token = Token(fd as usize);

        match channel.poll_interest() {
            None => {
                self.channels.lock().unwrap().remove(&token);
                if channel.is_registered() {
                    channel.mark_registered(false);
                    if let Err(e) = self.poller.lock().unwrap().delete(fd) {
                        warn!(fd, error = %e, "poller delete failed");
                    }
                }
            }
            Some(interest) => {
                if channel.is_registered() {
                    if let Err(e) = self.poller.lock().unwrap().modify(fd, token, interest) {
                        error!(fd, error = %e, "poller modify failed");
                    }
                } else {
                    match self.poller.lock().unwrap().add(fd, token, interest) {
                        Ok(()) => {
                            channel.mark_registered(true);
                            self.channels
                                .lock()
                                .unwrap()
                                .insert(token, Arc::downgrade(channel));
                        }
                        Err(e) => error!(fd, error = %e, "poller add failed"),
                    }
                }
            }
        }
    }

    /// Removes the channel from the poller and the registry.
    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        self.channels.lock().unwrap().remove(&Token(fd as usize));
        if channel.is_registered() {
            channel.mark_registered(false);
            if let Err(e) = self.poller.lock().unwrap().delete(fd) {
                warn!(fd, error = %e, "poller delete failed");
            }
        }
    }

    fn wakeup(&self) {
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "wake-up write failed");
        }
    }

    fn run_pending_tasks(&self) {
        let tasks = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
    }
}
