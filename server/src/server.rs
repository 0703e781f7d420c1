//! TCP server composition: acceptor, worker loops, connection registry, and
//! the server-level callback wrappers.

use crate::acceptor::Acceptor;
use crate::config::Config;
use crate::connection::TcpConnection;
use crate::error::ServerError;
use crate::idle::{IdleManager, DEFAULT_TICK_INTERVAL_MS, DEFAULT_WHEEL_SIZE};
use crate::loop_pool::EventLoopThreadPool;
use io_reactor::{BufferPool, EventLoop, InputBuffer};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{error, info, warn};

type ConnectedCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut InputBuffer) + Send + Sync>;
type RawDataCallback = Arc<dyn Fn(&Arc<TcpConnection>, &[u8]) + Send + Sync>;
type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// A reactor-pattern TCP server.
///
/// The base loop (run by the caller) hosts the acceptor; N worker loops host
/// the connections. User callbacks are installed before [`start`](Self::start)
/// and always run behind server-level wrappers that update idle tracking,
/// maintain the registry, and shield the framework from unwinding user code.
pub struct TcpServer {
    weak_self: Weak<TcpServer>,
    name: String,
    listen_ip: Ipv4Addr,
    port: u16,
    io_threads: usize,
    base_loop: Arc<EventLoop>,
    pool: EventLoopThreadPool,
    buffer_pool: Arc<BufferPool>,
    connections: Mutex<HashMap<RawFd, Arc<TcpConnection>>>,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
    idle_manager: Mutex<Option<Arc<IdleManager>>>,
    idle_enabled: AtomicBool,
    idle_timeout_ms: AtomicU64,
    started: AtomicBool,
    on_connected: Mutex<Option<ConnectedCallback>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_raw_data: Mutex<Option<RawDataCallback>>,
    on_closed: Mutex<Option<CloseCallback>>,
}

impl TcpServer {
    /// Validates the configuration and builds the (not yet started) server.
    pub fn new(base_loop: Arc<EventLoop>, config: &Config) -> Result<Arc<TcpServer>, ServerError> {
        config.validate()?;
        let listen_ip = config.parsed_listen_ip()?;

        let server = Arc::new_cyclic(|weak_self| TcpServer {
            weak_self: weak_self.clone(),
            name: config.name.clone(),
            listen_ip,
            port: config.port,
            io_threads: config.io_threads(),
            pool: EventLoopThreadPool::new(format!("{}-io", config.name), Arc::clone(&base_loop)),
            base_loop,
            buffer_pool: Arc::new(BufferPool::new(config.pool_max_bytes)),
            connections: Mutex::new(HashMap::new()),
            acceptor: Mutex::new(None),
            idle_manager: Mutex::new(None),
            idle_enabled: AtomicBool::new(config.idle_timeout_enabled),
            idle_timeout_ms: AtomicU64::new(config.idle_timeout_ms),
            started: AtomicBool::new(false),
            on_connected: Mutex::new(None),
            on_message: Mutex::new(None),
            on_raw_data: Mutex::new(None),
            on_closed: Mutex::new(None),
        });

        info!(
            name = %server.name,
            addr = %format!("{}:{}", server.listen_ip, server.port),
            io_threads = server.io_threads,
            "server created"
        );
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Called on a worker loop immediately after the channel is armed.
    pub fn set_connected_callback<F>(&self, callback: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        *self.on_connected.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Called with bytes available; the callback consumes via `pop`.
    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&Arc<TcpConnection>, &mut InputBuffer) + Send + Sync + 'static,
    {
        *self.on_message.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Convenience view over the same bytes the message callback sees.
    pub fn set_raw_data_callback<F>(&self, callback: F)
    where
        F: Fn(&Arc<TcpConnection>, &[u8]) + Send + Sync + 'static,
    {
        *self.on_raw_data.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Called exactly once per connection, after teardown completes.
    pub fn set_closed_callback<F>(&self, callback: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        *self.on_closed.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Starts the idle manager (when enabled), the worker loops, and the
    /// acceptor. Idempotent.
    pub fn start(&self) -> Result<(), ServerError> {
        let this = match self.weak_self.upgrade() {
            Some(this) => this,
            None => return Ok(()),
        };
        if self.started.swap(true, Ordering::AcqRel) {
            warn!(name = %self.name, "start called but server already started");
            return Ok(());
        }

        if self.idle_enabled.load(Ordering::Acquire) {
            self.ensure_idle_manager();
        }

        self.pool
            .start(self.io_threads)
            .map_err(ServerError::WorkerStart)?;

        let acceptor =
            Acceptor::new(&this, Arc::clone(&self.base_loop), self.listen_ip, self.port)?;
        acceptor.listen();
        *self.acceptor.lock().unwrap() = Some(acceptor);

        info!(
            name = %self.name,
            addr = %format!("{}:{}", self.listen_ip, self.port),
            idle = self.idle_enabled.load(Ordering::Acquire),
            "server started"
        );
        Ok(())
    }

    /// Stops the idle manager, drops the acceptor, shuts down every tracked
    /// connection, and joins the worker loops. Idempotent.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.name, "server stopping");

        if let Some(manager) = self.idle_manager.lock().unwrap().take() {
            manager.stop();
        }

        if let Some(acceptor) = self.acceptor.lock().unwrap().take() {
            acceptor.close();
        }

        let connections: Vec<Arc<TcpConnection>> = {
            let mut map = self.connections.lock().unwrap();
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.shutdown();
        }

        self.pool.stop();
        info!(name = %self.name, "server stopped");
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn idle_connection_count(&self) -> usize {
        match self.idle_manager.lock().unwrap().as_ref() {
            Some(manager) => manager.idle_connection_count(),
            None => 0,
        }
    }

    /// Applies a new idle timeout; values below one second are clamped.
    pub fn set_idle_timeout(&self, timeout_ms: u64) {
        let timeout_ms = timeout_ms.max(1000);
        self.idle_timeout_ms.store(timeout_ms, Ordering::Release);
        if let Some(manager) = self.idle_manager.lock().unwrap().as_ref() {
            manager.set_idle_timeout(timeout_ms);
        }
    }

    /// Enables or disables idle timeout management at runtime.
    pub fn enable_idle_timeout(&self, enable: bool) {
        if self.idle_enabled.swap(enable, Ordering::AcqRel) == enable {
            return;
        }
        if enable {
            self.ensure_idle_manager();
        } else if let Some(manager) = self.idle_manager.lock().unwrap().take() {
            manager.stop();
        }
        info!(name = %self.name, enable, "idle timeout toggled");
    }

    /// Marks a connection as active in the idle manager.
    pub fn update_connection_activity(&self, conn: &Arc<TcpConnection>) {
        if let Some(manager) = self.idle_manager.lock().unwrap().clone() {
            manager.update_activity(conn.fd());
        }
    }

    fn ensure_idle_manager(&self) {
        let mut guard = self.idle_manager.lock().unwrap();
        if guard.is_none() {
            let manager = IdleManager::new(
                self.idle_timeout_ms.load(Ordering::Acquire),
                DEFAULT_WHEEL_SIZE,
                DEFAULT_TICK_INTERVAL_MS,
            );
            let server = self.weak_self.clone();
            manager.set_timeout_callback(move |conn| {
                if let Some(server) = server.upgrade() {
                    server.on_idle_timeout(conn);
                }
            });
            *guard = Some(manager);
        }
        if self.started.load(Ordering::Acquire) {
            if let Some(manager) = guard.as_ref() {
                manager.start();
            }
        }
    }

    fn on_idle_timeout(&self, conn: &Arc<TcpConnection>) {
        info!(
            name = %self.name,
            fd = conn.fd(),
            peer = %conn.peer_endpoint(),
            "closing idle connection"
        );
        conn.shutdown();
    }

    // --- acceptor-facing internals ---

    pub(crate) fn next_loop(&self) -> Arc<EventLoop> {
        self.pool.next_loop()
    }

    pub(crate) fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Installs the server-level wrappers as the connection's callbacks.
    pub(crate) fn install_callbacks(&self, conn: &Arc<TcpConnection>) {
        let server = self.weak_self.clone();
        conn.set_connected_callback(move |conn| {
            if let Some(server) = server.upgrade() {
                server.handle_connected(conn);
            }
        });

        let server = self.weak_self.clone();
        conn.set_message_callback(move |conn, input| {
            if let Some(server) = server.upgrade() {
                server.handle_message(conn, input);
            }
        });

        let server = self.weak_self.clone();
        conn.set_close_callback(move |conn| {
            if let Some(server) = server.upgrade() {
                server.handle_closed(conn);
            }
        });
    }

    pub(crate) fn add_connection(&self, conn: Arc<TcpConnection>) {
        let fd = conn.fd();
        {
            let mut map = self.connections.lock().unwrap();
            if map.contains_key(&fd) {
                warn!(name = %self.name, fd, "connection already registered");
                return;
            }
            map.insert(fd, Arc::clone(&conn));
        }
        if let Some(manager) = self.idle_manager.lock().unwrap().clone() {
            manager.add_connection(&conn);
        }
    }

    // --- server-level callback wrappers ---

    fn handle_connected(&self, conn: &Arc<TcpConnection>) {
        let callback = self.on_connected.lock().unwrap().clone();
        if let Some(callback) = callback {
            self.shielded("connected", || callback(conn));
        }
    }

    fn handle_message(&self, conn: &Arc<TcpConnection>, input: &mut InputBuffer) {
        if let Some(manager) = self.idle_manager.lock().unwrap().clone() {
            manager.update_activity(conn.fd());
        }

        let raw_callback = self.on_raw_data.lock().unwrap().clone();
        if let Some(callback) = raw_callback {
            let bytes = input.bytes();
            if !bytes.is_empty() {
                self.shielded("raw_data", || callback(conn, bytes));
            }
        }

        let callback = self.on_message.lock().unwrap().clone();
        if let Some(callback) = callback {
            self.shielded("message", || callback(conn, input));
        }
    }

    fn handle_closed(&self, conn: &Arc<TcpConnection>) {
        let fd = conn.fd();
        self.connections.lock().unwrap().remove(&fd);
        if let Some(manager) = self.idle_manager.lock().unwrap().clone() {
            manager.remove_connection(fd);
        }

        let callback = self.on_closed.lock().unwrap().clone();
        if let Some(callback) = callback {
            self.shielded("closed", || callback(conn));
        }
    }

    /// User callbacks never unwind into the framework.
    fn shielded<F: FnOnce()>(&self, which: &str, f: F) {
        if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(name = %self.name, callback = which, "user callback panicked");
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}
