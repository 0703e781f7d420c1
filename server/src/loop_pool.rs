//! Worker event-loop pool with round-robin dispatch.

use io_reactor::EventLoop;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Spawns N worker threads, each running one event loop, and hands loops out
/// round-robin. With zero workers the base loop serves as the sole worker.
pub struct EventLoopThreadPool {
    name: String,
    base_loop: Arc<EventLoop>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
    started: AtomicBool,
}

impl EventLoopThreadPool {
    pub fn new(name: impl Into<String>, base_loop: Arc<EventLoop>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            name: name.into(),
            base_loop,
            loops: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns `count` named worker threads. Idempotent.
    pub fn start(&self, count: usize) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!(name = %self.name, "loop pool already started");
            return Ok(());
        }

        let mut loops = self.loops.lock().unwrap();
        let mut handles = self.handles.lock().unwrap();
        for i in 0..count {
            let event_loop = EventLoop::new()?;
            let worker = Arc::clone(&event_loop);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || worker.run())?;
            loops.push(event_loop);
            handles.push(handle);
        }

        info!(name = %self.name, workers = count, "loop pool started");
        Ok(())
    }

    /// Round-robin over the workers; the base loop when there are none.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        Arc::clone(&loops[index])
    }

    pub fn loop_count(&self) -> usize {
        self.loops.lock().unwrap().len()
    }

    /// Stops every worker loop and joins the threads. Idempotent.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }

        let loops: Vec<Arc<EventLoop>> = self.loops.lock().unwrap().clone();
        for event_loop in &loops {
            event_loop.stop();
        }

        let handles = {
            let mut handles = self.handles.lock().unwrap();
            std::mem::take(&mut *handles)
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!(name = %self.name, "worker thread panicked");
            }
        }

        self.loops.lock().unwrap().clear();
        info!(name = %self.name, "loop pool stopped");
    }
}

impl Drop for EventLoopThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}
