//! Per-descriptor readiness channel.

use crate::event_loop::EventLoop;
use crate::ready::Ready;
use mio::Interest;
use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

const INTEREST_READ: u8 = 0b01;
const INTEREST_WRITE: u8 = 0b10;

type Callback = Arc<dyn Fn(Ready) + Send + Sync>;

/// The binding of a descriptor, its current interest mask, and a readiness
/// callback, registered with exactly one event loop.
///
/// A channel does not own its descriptor and performs no I/O itself; it only
/// forwards delivered readiness to the callback. The owner (a connection, an
/// acceptor) is responsible for closing the descriptor after disabling the
/// channel on the loop thread.
///
/// Every mutation of the interest mask is synchronized to the owning loop:
/// directly when called on the loop thread, otherwise through a queued task
/// that keeps the channel alive until it runs.
pub struct Channel {
    weak_self: Weak<Channel>,
    event_loop: Arc<EventLoop>,
    fd: RawFd,
    interest: AtomicU8,
    registered: AtomicBool,
    callback: Mutex<Option<Callback>>,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    /// Creates a channel with an empty interest mask.
    pub fn new(event_loop: Arc<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|weak_self| Channel {
            weak_self: weak_self.clone(),
            event_loop,
            fd,
            interest: AtomicU8::new(0),
            registered: AtomicBool::new(false),
            callback: Mutex::new(None),
            tie: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(Ready) + Send + Sync + 'static,
    {
        *self.callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Ties the channel to its owner. Once tied, readiness dispatch upgrades
    /// the weak reference and silently drops the event when the owner is
    /// gone; the upgraded reference is held for the duration of the callback.
    pub fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(owner);
    }

    /// Arms read interest. Peer-half-close notification comes with it.
    pub fn enable_read(&self) {
        self.interest.fetch_or(INTEREST_READ, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_write(&self) {
        self.interest.fetch_or(INTEREST_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_write(&self) {
        self.interest.fetch_and(!INTEREST_WRITE, Ordering::AcqRel);
        self.update();
    }

    /// Clears the entire mask, deregistering the descriptor from the loop.
    pub fn disable_all(&self) {
        self.interest.store(0, Ordering::Release);
        self.update();
    }

    pub fn is_reading(&self) -> bool {
        self.interest.load(Ordering::Acquire) & INTEREST_READ != 0
    }

    pub fn is_writing(&self) -> bool {
        self.interest.load(Ordering::Acquire) & INTEREST_WRITE != 0
    }

    /// The mask to hand to the poller, or `None` when nothing is armed.
    pub(crate) fn poll_interest(&self) -> Option<Interest> {
        let bits = self.interest.load(Ordering::Acquire);
        match (bits & INTEREST_READ != 0, bits & INTEREST_WRITE != 0) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn mark_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }

    fn update(&self) {
        let channel = match self.weak_self.upgrade() {
            Some(channel) => channel,
            None => return,
        };
        let event_loop = Arc::clone(&self.event_loop);
        self.event_loop
            .run_in_loop(move || event_loop.update_channel(&channel));
    }

    /// Invoked by the loop with the delivered readiness for this descriptor.
    pub(crate) fn handle_ready(&self, ready: Ready) {
        let _guard = {
            let tie = self.tie.lock().unwrap();
            match tie.as_ref() {
                Some(weak) => match weak.upgrade() {
                    Some(owner) => Some(owner),
                    // Owner destroyed; the event is stale.
                    None => return,
                },
                None => None,
            }
        };

        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(ready);
        }
    }
}
