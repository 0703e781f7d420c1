//! Idle-connection timeout management over a time-bucket wheel.
//!
//! The wheel has W slots stepped by a tick interval I. A connection due to
//! expire after timeout T sits in slot `(current + T/I) mod W` with
//! `rounds_remaining = (T/I - 1) / W` full revolutions still to go; activity
//! re-slots the entry in O(1) expected time. A ticker thread advances the
//! wheel, compensating its sleep for processing time, and a cleanup thread
//! scrubs entries whose connection has gone away.

use crate::connection::TcpConnection;
use crate::metrics::IDLE_TIMEOUTS;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_WHEEL_SIZE: usize = 60;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

pub type TimeoutCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

struct IdleEntry {
    conn: Weak<TcpConnection>,
    fd: RawFd,
    slot: AtomicUsize,
    rounds_remaining: AtomicU64,
    last_activity: Mutex<Instant>,
}

#[derive(Default)]
struct WheelSlot {
    entries: Mutex<Vec<Arc<IdleEntry>>>,
}

/// Tracks last-activity per connection and delivers quiet connections to the
/// timeout callback. Lock order is always map-then-slot, and never two slot
/// locks at once.
pub struct IdleManager {
    weak_self: Weak<IdleManager>,
    timeout_ms: AtomicU64,
    tick_interval_ms: u64,
    wheel: Vec<WheelSlot>,
    current_slot: AtomicUsize,
    connections: Mutex<HashMap<RawFd, Arc<IdleEntry>>>,
    timeout_cb: Mutex<Option<TimeoutCallback>>,
    running: AtomicBool,
    shutdown: (Mutex<bool>, Condvar),
    ticker: Mutex<Option<JoinHandle<()>>>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
    total: AtomicUsize,
}

impl IdleManager {
    pub fn new(idle_timeout_ms: u64, wheel_size: usize, tick_interval_ms: u64) -> Arc<IdleManager> {
        let idle_timeout_ms = if idle_timeout_ms == 0 {
            DEFAULT_IDLE_TIMEOUT_MS
        } else {
            idle_timeout_ms
        };
        let wheel_size = if wheel_size == 0 {
            DEFAULT_WHEEL_SIZE
        } else {
            wheel_size
        };
        let tick_interval_ms = if tick_interval_ms == 0 {
            DEFAULT_TICK_INTERVAL_MS
        } else {
            tick_interval_ms
        };

        info!(
            timeout_ms = idle_timeout_ms,
            wheel_size, tick_interval_ms, "idle manager created"
        );
        Arc::new_cyclic(|weak_self| IdleManager {
            weak_self: weak_self.clone(),
            timeout_ms: AtomicU64::new(idle_timeout_ms),
            tick_interval_ms,
            wheel: (0..wheel_size).map(|_| WheelSlot::default()).collect(),
            current_slot: AtomicUsize::new(0),
            connections: Mutex::new(HashMap::new()),
            timeout_cb: Mutex::new(None),
            running: AtomicBool::new(false),
            shutdown: (Mutex::new(false), Condvar::new()),
            ticker: Mutex::new(None),
            cleaner: Mutex::new(None),
            total: AtomicUsize::new(0),
        })
    }

    pub fn set_timeout_callback<F>(&self, callback: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        *self.timeout_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Starts the ticker and cleanup threads. Idempotent.
    pub fn start(&self) {
        let this = match self.weak_self.upgrade() {
            Some(this) => this,
            None => return,
        };
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.shutdown.0.lock().unwrap() = false;

        let manager = Arc::clone(&this);
        *self.ticker.lock().unwrap() = Some(
            thread::Builder::new()
                .name("idle-wheel".to_string())
                .spawn(move || manager.wheel_loop())
                .expect("failed to spawn idle wheel thread"),
        );

        let manager = this;
        *self.cleaner.lock().unwrap() = Some(
            thread::Builder::new()
                .name("idle-cleanup".to_string())
                .spawn(move || manager.cleanup_loop())
                .expect("failed to spawn idle cleanup thread"),
        );

        info!("idle manager started");
    }

    /// Stops both threads, joins them, and forgets all tracked connections.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let (lock, cvar) = &self.shutdown;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.cleaner.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.connections.lock().unwrap().clear();
        for slot in &self.wheel {
            slot.entries.lock().unwrap().clear();
        }
        self.total.store(0, Ordering::Release);
        info!("idle manager stopped");
    }

    fn ticks_per_timeout(&self) -> u64 {
        (self.timeout_ms.load(Ordering::Relaxed) / self.tick_interval_ms).max(1)
    }

    /// The slot and full-revolution count for an entry expiring one timeout
    /// from now. A timeout that is an exact multiple of the wheel size wraps
    /// onto the slot the ticker visits next; that visit is not a full
    /// revolution, so the round count excludes it.
    fn placement(&self) -> (usize, u64) {
        let ticks = self.ticks_per_timeout();
        let wheel_len = self.wheel.len();
        let slot = (self.current_slot.load(Ordering::Acquire) + ticks as usize) % wheel_len;
        let rounds = (ticks - 1) / wheel_len as u64;
        (slot, rounds)
    }

    pub fn add_connection(&self, conn: &Arc<TcpConnection>) {
        let fd = conn.fd();
        let (slot, rounds) = self.placement();
        let entry = Arc::new(IdleEntry {
            conn: Arc::downgrade(conn),
            fd,
            slot: AtomicUsize::new(slot),
            rounds_remaining: AtomicU64::new(rounds),
            last_activity: Mutex::new(Instant::now()),
        });

        let mut connections = self.connections.lock().unwrap();
        if connections.contains_key(&fd) {
            warn!(fd, "connection already tracked by idle manager");
            return;
        }
        connections.insert(fd, Arc::clone(&entry));
        self.total.fetch_add(1, Ordering::Relaxed);
        self.wheel[slot].entries.lock().unwrap().push(entry);
    }

    /// Stamps fresh activity and moves the entry toward the new expiry slot.
    pub fn update_activity(&self, fd: RawFd) {
        let entry = self.connections.lock().unwrap().get(&fd).cloned();
        let entry = match entry {
            Some(entry) => entry,
            None => return,
        };
        *entry.last_activity.lock().unwrap() = Instant::now();
        self.reslot(&entry);
    }

    fn reslot(&self, entry: &Arc<IdleEntry>) {
        let (target, rounds) = self.placement();
        entry.rounds_remaining.store(rounds, Ordering::Release);

        let old = entry.slot.load(Ordering::Acquire);
        if target == old {
            return;
        }
        // Remove under the old slot's lock before touching the new slot.
        {
            let mut entries = self.wheel[old].entries.lock().unwrap();
            entries.retain(|e| !Arc::ptr_eq(e, entry));
        }
        entry.slot.store(target, Ordering::Release);
        self.wheel[target].entries.lock().unwrap().push(Arc::clone(entry));
    }

    /// Stops tracking `fd`. Slot lists are scrubbed lazily by the ticker and
    /// the cleanup pass.
    pub fn remove_connection(&self, fd: RawFd) {
        if self.connections.lock().unwrap().remove(&fd).is_some() {
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Connections whose quiet period already exceeds the timeout.
    pub fn idle_connection_count(&self) -> usize {
        let timeout = Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed));
        let now = Instant::now();
        self.connections
            .lock()
            .unwrap()
            .values()
            .filter(|entry| now.duration_since(*entry.last_activity.lock().unwrap()) >= timeout)
            .count()
    }

    /// Applies a new timeout; the floor of 1 s is enforced here as well.
    pub fn set_idle_timeout(&self, idle_timeout_ms: u64) {
        self.timeout_ms
            .store(idle_timeout_ms.max(1000), Ordering::Release);
        info!(timeout_ms = idle_timeout_ms.max(1000), "idle timeout changed");
    }

    /// Treats every tracked connection as freshly active.
    pub fn reset_all(&self) {
        let entries: Vec<Arc<IdleEntry>> =
            self.connections.lock().unwrap().values().cloned().collect();
        let now = Instant::now();
        for entry in entries {
            *entry.last_activity.lock().unwrap() = now;
            self.reslot(&entry);
        }
    }

    fn wheel_loop(&self) {
        debug!("time wheel loop started");
        let tick = Duration::from_millis(self.tick_interval_ms);

        loop {
            let started = Instant::now();
            self.process_current_slot();
            let next = (self.current_slot.load(Ordering::Acquire) + 1) % self.wheel.len();
            self.current_slot.store(next, Ordering::Release);

            // Compensate for processing time so cadence stays close to the
            // tick interval.
            let wait = tick.saturating_sub(started.elapsed());
            let (lock, cvar) = &self.shutdown;
            let mut stop = lock.lock().unwrap();
            if *stop {
                break;
            }
            let result = cvar.wait_timeout(stop, wait).unwrap();
            stop = result.0;
            if *stop {
                break;
            }
        }
        debug!("time wheel loop stopped");
    }

    fn process_current_slot(&self) {
        let slot_index = self.current_slot.load(Ordering::Acquire);
        let timeout = Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed));
        let now = Instant::now();
        let mut expired = Vec::new();

        {
            let mut entries = self.wheel[slot_index].entries.lock().unwrap();
            entries.retain(|entry| {
                let rounds = entry.rounds_remaining.load(Ordering::Acquire);
                if rounds > 0 {
                    entry.rounds_remaining.store(rounds - 1, Ordering::Release);
                    return true;
                }
                let idle_for = now.duration_since(*entry.last_activity.lock().unwrap());
                if idle_for >= timeout {
                    expired.push(Arc::clone(entry));
                    false
                } else {
                    true
                }
            });
        }

        if expired.is_empty() {
            return;
        }
        let callback = self.timeout_cb.lock().unwrap().clone();
        for entry in expired {
            if self.connections.lock().unwrap().remove(&entry.fd).is_some() {
                self.total.fetch_sub(1, Ordering::Relaxed);
            }
            let conn = match entry.conn.upgrade() {
                Some(conn) => conn,
                None => continue,
            };
            IDLE_TIMEOUTS.increment();
            info!(fd = entry.fd, "connection idle timeout");
            if let Some(callback) = callback.as_ref() {
                // A panicking callback must not stop the wheel.
                if panic::catch_unwind(AssertUnwindSafe(|| callback(&conn))).is_err() {
                    warn!(fd = entry.fd, "idle timeout callback panicked");
                }
            }
        }
    }

    fn cleanup_loop(&self) {
        loop {
            let (lock, cvar) = &self.shutdown;
            let stop = lock.lock().unwrap();
            if *stop {
                break;
            }
            let (stop, _timeout) = cvar.wait_timeout(stop, CLEANUP_INTERVAL).unwrap();
            let stopped = *stop;
            drop(stop);
            if stopped {
                break;
            }
            self.cleanup_closed();
        }
    }

    /// Drops map entries whose connection is gone or no longer connected,
    /// then scrubs dangling references out of every slot list.
    fn cleanup_closed(&self) {
        let stale: Vec<RawFd> = self
            .connections
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| match entry.conn.upgrade() {
                Some(conn) => !conn.is_connected(),
                None => true,
            })
            .map(|(fd, _)| *fd)
            .collect();

        for fd in &stale {
            self.remove_connection(*fd);
        }

        {
            let connections = self.connections.lock().unwrap();
            for slot in &self.wheel {
                slot.entries
                    .lock()
                    .unwrap()
                    .retain(|entry| connections.contains_key(&entry.fd));
            }
        }

        if !stale.is_empty() {
            debug!(count = stale.len(), "cleaned up closed connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use io_reactor::{BufferPool, EventLoop};
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn test_zero_parameters_fall_back_to_defaults() {
        let manager = IdleManager::new(0, 0, 0);
        assert_eq!(manager.wheel.len(), DEFAULT_WHEEL_SIZE);
        assert_eq!(manager.timeout_ms.load(Ordering::Relaxed), DEFAULT_IDLE_TIMEOUT_MS);
        assert_eq!(manager.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
    }

    #[test]
    fn test_timeout_floor() {
        let manager = IdleManager::new(5000, 60, 1000);
        manager.set_idle_timeout(10);
        assert_eq!(manager.timeout_ms.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn test_ticks_per_timeout() {
        let manager = IdleManager::new(2000, 60, 1000);
        assert_eq!(manager.ticks_per_timeout(), 2);
        manager.set_idle_timeout(300_000);
        assert_eq!(manager.ticks_per_timeout(), 300);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let manager = IdleManager::new(2000, 8, 100);
        manager.start();
        manager.start();
        manager.stop();
        manager.stop();
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_placement_below_one_revolution() {
        let manager = IdleManager::new(2000, 60, 1000);
        let (slot, rounds) = manager.placement();
        assert_eq!(slot, 2);
        assert_eq!(rounds, 0);
    }

    #[test]
    fn test_placement_at_default_parameters() {
        // 300 ticks on a 60-slot wheel wraps onto the insertion slot. Five
        // visits reach the entry before the timeout elapses: four burn a
        // round each, the fifth runs the last-activity check.
        let manager = IdleManager::new(DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_WHEEL_SIZE, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(manager.ticks_per_timeout(), 300);
        let (slot, rounds) = manager.placement();
        assert_eq!(slot, 0);
        assert_eq!(rounds, 4);
    }

    #[test]
    fn test_placement_at_one_revolution() {
        let manager = IdleManager::new(8000, 8, 1000);
        let (slot, rounds) = manager.placement();
        assert_eq!(slot, 0);
        assert_eq!(rounds, 0);
    }

    fn tracked_connection() -> (Arc<TcpConnection>, TcpStream) {
        let event_loop = EventLoop::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let pool = Arc::new(BufferPool::with_defaults());
        (TcpConnection::new(event_loop, accepted, peer, &pool), client)
    }

    #[test]
    fn test_expiry_when_timeout_is_exact_wheel_multiple() {
        // ticks_per_timeout equals the wheel size, the case where the slot
        // wraps onto the one the ticker visits next. Expiry must land within
        // one tick past the timeout, not a revolution later.
        let manager = IdleManager::new(2000, 4, 500);
        let fired: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let probe = Arc::clone(&fired);
        manager.set_timeout_callback(move |_conn| {
            *probe.lock().unwrap() = Some(Instant::now());
        });
        manager.start();

        let (conn, _client) = tracked_connection();
        let added = Instant::now();
        manager.add_connection(&conn);

        let deadline = Instant::now() + Duration::from_secs(6);
        let fired_at = loop {
            if let Some(at) = *fired.lock().unwrap() {
                break at;
            }
            assert!(Instant::now() < deadline, "idle timeout never fired");
            thread::sleep(Duration::from_millis(20));
        };
        manager.stop();

        let elapsed = fired_at - added;
        assert!(
            elapsed >= Duration::from_millis(2000),
            "fired early: {:?}",
            elapsed
        );
        // One tick of slack past the timeout, plus scheduling headroom; an
        // extra revolution would land at four seconds.
        assert!(
            elapsed <= Duration::from_millis(3400),
            "fired late: {:?}",
            elapsed
        );
    }
}
