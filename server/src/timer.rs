//! Deferred-task timer.
//!
//! A min-heap of scheduled tasks behind a mutex and condition variable. One
//! dispatcher thread pops due tasks and hands them to a small channel-fed
//! worker pool, so slow callbacks never delay the schedule. The reactor core
//! does not depend on this; it exists for application-level deferred work.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub type TaskId = u64;

type TimerCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Copy)]
enum Repeat {
    Once,
    Periodic,
    Bounded(u32),
}

struct TimerTask {
    id: TaskId,
    deadline: Instant,
    interval: Duration,
    repeat: Repeat,
    callback: TimerCallback,
}

impl PartialEq for TimerTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerTask {}

impl PartialOrd for TimerTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerTask {
    // Reversed so the earliest deadline sits at the top of the heap.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct TimerShared {
    queue: Mutex<BinaryHeap<TimerTask>>,
    cancelled: Mutex<HashSet<TaskId>>,
    cvar: Condvar,
    running: AtomicBool,
    next_id: AtomicU64,
}

/// Scheduler for single-shot, periodic, and bounded-repeat tasks.
pub struct Timer {
    shared: Arc<TimerShared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    work_tx: Mutex<Option<Sender<TimerCallback>>>,
}

impl Timer {
    pub fn new() -> Timer {
        Timer {
            shared: Arc::new(TimerShared {
                queue: Mutex::new(BinaryHeap::new()),
                cancelled: Mutex::new(HashSet::new()),
                cvar: Condvar::new(),
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
            dispatcher: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            work_tx: Mutex::new(None),
        }
    }

    /// Starts the dispatcher and `worker_count` executor threads.
    /// Idempotent.
    pub fn start(&self, worker_count: usize) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let (tx, rx) = mpsc::channel::<TimerCallback>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = self.workers.lock().unwrap();
        for i in 0..worker_count.max(1) {
            let rx = Arc::clone(&rx);
            workers.push(
                thread::Builder::new()
                    .name(format!("timer-worker-{}", i))
                    .spawn(move || run_worker(rx))
                    .expect("failed to spawn timer worker thread"),
            );
        }
        *self.work_tx.lock().unwrap() = Some(tx);

        let shared = Arc::clone(&self.shared);
        let work_tx = self.work_tx.lock().unwrap().clone();
        *self.dispatcher.lock().unwrap() = Some(
            thread::Builder::new()
                .name("timer-dispatch".to_string())
                .spawn(move || dispatch_loop(shared, work_tx))
                .expect("failed to spawn timer dispatch thread"),
        );
        debug!(workers = worker_count.max(1), "timer started");
    }

    /// Stops the dispatcher, drains the workers, and joins everything.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Taking the queue lock first means the dispatcher is either parked
        // in a wait (and sees the notify) or will re-check the running flag.
        {
            let _queue = self.shared.queue.lock().unwrap();
            self.shared.cvar.notify_all();
        }
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }

        // Dropping the sender ends the worker receive loops.
        self.work_tx.lock().unwrap().take();
        let workers = {
            let mut workers = self.workers.lock().unwrap();
            std::mem::take(&mut *workers)
        };
        for handle in workers {
            let _ = handle.join();
        }

        self.shared.queue.lock().unwrap().clear();
        self.shared.cancelled.lock().unwrap().clear();
        debug!("timer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Runs `callback` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, callback: F) -> Option<TaskId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule(delay, Repeat::Once, callback)
    }

    /// Runs `callback` every `interval` until cancelled.
    pub fn schedule_periodic<F>(&self, interval: Duration, callback: F) -> Option<TaskId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule(interval, Repeat::Periodic, callback)
    }

    /// Runs `callback` every `interval`, `count` times in total.
    pub fn schedule_repeat<F>(&self, interval: Duration, count: u32, callback: F) -> Option<TaskId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if count == 0 {
            return None;
        }
        self.schedule(interval, Repeat::Bounded(count), callback)
    }

    /// Cancels a scheduled task. Returns whether this call cancelled it.
    pub fn cancel(&self, id: TaskId) -> bool {
        let known = {
            let queue = self.shared.queue.lock().unwrap();
            queue.iter().any(|task| task.id == id)
        };
        if !known {
            return false;
        }
        self.shared.cancelled.lock().unwrap().insert(id)
    }

    fn schedule<F>(&self, interval: Duration, repeat: Repeat, callback: F) -> Option<TaskId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if interval.is_zero() || !self.is_running() {
            return None;
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let task = TimerTask {
            id,
            deadline: Instant::now() + interval,
            interval,
            repeat,
            callback: Arc::new(callback),
        };
        self.shared.queue.lock().unwrap().push(task);
        self.shared.cvar.notify_all();
        Some(id)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(shared: Arc<TimerShared>, work_tx: Option<Sender<TimerCallback>>) {
    let mut queue = shared.queue.lock().unwrap();
    while shared.running.load(Ordering::Acquire) {
        let now = Instant::now();
        let due_in = queue.peek().map(|task| {
            if task.deadline > now {
                Some(task.deadline - now)
            } else {
                None
            }
        });

        match due_in {
            // Empty queue: sleep until something is scheduled.
            None => {
                queue = shared.cvar.wait(queue).unwrap();
            }
            // Head not due yet: sleep until its deadline or a new head.
            Some(Some(wait)) => {
                let (guard, _timeout) = shared.cvar.wait_timeout(queue, wait).unwrap();
                queue = guard;
            }
            // Head is due: pop, hand off, reschedule repeats.
            Some(None) => {
                let task = match queue.pop() {
                    Some(task) => task,
                    None => continue,
                };
                if shared.cancelled.lock().unwrap().remove(&task.id) {
                    continue;
                }
                if let Some(tx) = work_tx.as_ref() {
                    let _ = tx.send(Arc::clone(&task.callback));
                }
                match task.repeat {
                    Repeat::Once => {}
                    Repeat::Periodic => queue.push(TimerTask {
                        deadline: task.deadline + task.interval,
                        ..task
                    }),
                    Repeat::Bounded(remaining) if remaining > 1 => queue.push(TimerTask {
                        deadline: task.deadline + task.interval,
                        repeat: Repeat::Bounded(remaining - 1),
                        ..task
                    }),
                    Repeat::Bounded(_) => {}
                }
            }
        }
    }
}

fn run_worker(rx: Arc<Mutex<Receiver<TimerCallback>>>) {
    loop {
        let callback = {
            let receiver = rx.lock().unwrap();
            receiver.recv()
        };
        match callback {
            Ok(callback) => {
                if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                    warn!("timer callback panicked");
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_schedule_once_fires() {
        let timer = Timer::new();
        timer.start(1);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        timer
            .schedule_once(Duration::from_millis(20), move || {
                tx.lock().unwrap().send(()).unwrap();
            })
            .expect("scheduled");

        rx.recv_timeout(Duration::from_secs(2)).expect("fired");
        timer.stop();
    }

    #[test]
    fn test_cancel_prevents_execution() {
        let timer = Timer::new();
        timer.start(1);

        let fired = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&fired);
        let id = timer
            .schedule_once(Duration::from_millis(100), move || {
                probe.fetch_add(1, Ordering::SeqCst);
            })
            .expect("scheduled");

        assert!(timer.cancel(id));
        assert!(!timer.cancel(id));
        thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.stop();
    }

    #[test]
    fn test_bounded_repeat_count() {
        let timer = Timer::new();
        timer.start(1);

        let fired = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&fired);
        timer
            .schedule_repeat(Duration::from_millis(20), 3, move || {
                probe.fetch_add(1, Ordering::SeqCst);
            })
            .expect("scheduled");

        thread::sleep(Duration::from_millis(400));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        timer.stop();
    }

    #[test]
    fn test_periodic_fires_until_stop() {
        let timer = Timer::new();
        timer.start(2);

        let fired = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&fired);
        timer
            .schedule_periodic(Duration::from_millis(20), move || {
                probe.fetch_add(1, Ordering::SeqCst);
            })
            .expect("scheduled");

        thread::sleep(Duration::from_millis(200));
        timer.stop();
        assert!(fired.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_rejects_when_stopped() {
        let timer = Timer::new();
        assert!(timer
            .schedule_once(Duration::from_millis(10), || {})
            .is_none());
    }
}
