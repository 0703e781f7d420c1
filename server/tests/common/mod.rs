//! Shared harness for server integration tests.

use io_reactor::EventLoop;
use server::config::{Config, LoggingConfig};
use server::TcpServer;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub struct ServerHarness {
    pub base_loop: Arc<EventLoop>,
    pub server: Arc<TcpServer>,
    handle: Option<JoinHandle<()>>,
}

impl ServerHarness {
    /// Runs the base loop on its own thread and starts the server.
    pub fn start(base_loop: Arc<EventLoop>, server: Arc<TcpServer>) -> ServerHarness {
        let runner = Arc::clone(&base_loop);
        let handle = thread::Builder::new()
            .name("base-loop".to_string())
            .spawn(move || runner.run())
            .expect("spawn base loop thread");
        server.start().expect("server start");
        ServerHarness {
            base_loop,
            server,
            handle: Some(handle),
        }
    }

    pub fn shutdown(mut self) {
        self.server.stop();
        self.base_loop.stop();
        if let Some(handle) = self.handle.take() {
            handle.join().expect("base loop join");
        }
    }
}

pub fn test_config(name: &str, port: u16, io_threads: usize) -> Config {
    Config {
        name: name.to_string(),
        listen_ip: "127.0.0.1".to_string(),
        port,
        io_thread_count: Some(io_threads),
        idle_timeout_ms: 300_000,
        idle_timeout_enabled: false,
        pool_max_bytes: io_reactor::DEFAULT_MAX_POOL_BYTES,
        logging: LoggingConfig::default(),
    }
}

/// Polls `predicate` until it holds or `timeout` elapses.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
