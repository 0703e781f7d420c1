//! Per-connection state machine and buffered I/O.
//!
//! A connection lives inside exactly one worker loop once established. All
//! buffer, callback, and interest-mask mutation happens on that loop's
//! thread; the thread-safe surface is [`TcpConnection::send`],
//! [`TcpConnection::shutdown`], and the read-only queries.

use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, CONNECTIONS_ACTIVE};
use io_reactor::{BufferPool, Channel, EventLoop, InputBuffer, OutputBuffer, Ready};
use std::any::Any;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace, warn};

/// Connection lifecycle states. Transitions form a DAG:
/// Connecting -> Connected -> Disconnecting -> Disconnected, with
/// Connecting -> Disconnected permitted on early failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

pub type ConnectedCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut InputBuffer) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// A single accepted TCP connection.
pub struct TcpConnection {
    weak_self: Weak<TcpConnection>,
    event_loop: Arc<EventLoop>,
    fd: RawFd,
    peer: SocketAddr,
    socket: Mutex<Option<TcpStream>>,
    channel: Mutex<Option<Arc<Channel>>>,
    pool: Arc<BufferPool>,
    input: Mutex<InputBuffer>,
    output: Mutex<OutputBuffer>,
    state: AtomicU8,
    connected_cb: Mutex<Option<ConnectedCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    /// Wraps an accepted, non-blocking socket. The connection stays in
    /// `Connecting` until [`connect_established`](Self::connect_established)
    /// runs on the worker loop.
    pub fn new(
        event_loop: Arc<EventLoop>,
        socket: TcpStream,
        peer: SocketAddr,
        pool: &Arc<BufferPool>,
    ) -> Arc<TcpConnection> {
        let fd = socket.as_raw_fd();
        Arc::new_cyclic(|weak_self| TcpConnection {
            weak_self: weak_self.clone(),
            event_loop,
            fd,
            peer,
            socket: Mutex::new(Some(socket)),
            channel: Mutex::new(None),
            pool: Arc::clone(pool),
            input: Mutex::new(InputBuffer::new(Arc::clone(pool))),
            output: Mutex::new(OutputBuffer::new(Arc::clone(pool))),
            state: AtomicU8::new(ConnState::Connecting as u8),
            connected_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// The peer endpoint rendered as `"<IPv4>:<port>"`.
    pub fn peer_endpoint(&self) -> String {
        self.peer.to_string()
    }

    pub fn set_connected_callback<F>(&self, callback: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        *self.connected_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&Arc<TcpConnection>, &mut InputBuffer) + Send + Sync + 'static,
    {
        *self.message_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        *self.close_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    /// A strong handle to self; `None` once the last owner dropped.
    fn strong_self(&self) -> Option<Arc<TcpConnection>> {
        self.weak_self.upgrade()
    }

    /// Completes establishment on the worker loop: arms the channel, flips
    /// the state to `Connected`, and fires the connected callback.
    pub fn connect_established(&self) {
        let this = match self.strong_self() {
            Some(this) => this,
            None => return,
        };

        let channel = Channel::new(Arc::clone(&self.event_loop), self.fd);
        let weak = self.weak_self.clone();
        channel.set_callback(move |ready| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_event(ready);
            }
        });
        let tie: Weak<dyn Any + Send + Sync> = self.weak_self.clone();
        channel.tie(tie);

        *self.channel.lock().unwrap() = Some(Arc::clone(&channel));
        channel.enable_read();
        self.state
            .store(ConnState::Connected as u8, Ordering::Release);
        trace!(fd = self.fd, peer = %self.peer, "connection established");

        let callback = self.connected_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&this);
        }
    }

    fn handle_event(&self, ready: Ready) {
        if ready.is_error() || (ready.is_read_closed() && ready.is_write_closed()) {
            self.handle_close();
            return;
        }
        if ready.is_read_closed() {
            // Peer half-closed. Anything already buffered in the kernel is
            // drained first; the EOF read then collapses to a close in the
            // same dispatch.
            if ready.is_readable() {
                self.handle_read();
            } else {
                self.handle_close();
            }
            return;
        }
        if ready.is_readable() {
            self.handle_read();
        }
        if ready.is_writable() {
            self.handle_write();
        }
    }

    /// Edge-triggered: keeps reading until would-block. Each successful read
    /// hands the buffer to the message callback, which consumes via `pop`.
    fn handle_read(&self) {
        let this = match self.strong_self() {
            Some(this) => this,
            None => return,
        };
        loop {
            let result = {
                let mut input = self.input.lock().unwrap();
                let socket = self.socket.lock().unwrap();
                match socket.as_ref() {
                    Some(stream) => {
                        let mut reader: &TcpStream = stream;
                        input.read_from(&mut reader)
                    }
                    None => return,
                }
            };
            match result {
                Ok(0) => {
                    self.handle_close();
                    return;
                }
                Ok(n) => {
                    BYTES_RECEIVED.add(n as u64);
                    let callback = self.message_cb.lock().unwrap().clone();
                    if let Some(callback) = callback {
                        // The buffer is loaned out of its mutex for the
                        // callback; no lock is held across user code.
                        let mut loaned = {
                            let mut input = self.input.lock().unwrap();
                            std::mem::replace(
                                &mut *input,
                                InputBuffer::new(Arc::clone(&self.pool)),
                            )
                        };
                        callback(&this, &mut loaned);
                        *self.input.lock().unwrap() = loaned;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(fd = self.fd, error = %e, "read failed");
                    self.handle_close();
                    return;
                }
            }
        }
    }

    /// Drains the output buffer to the descriptor. Once empty, write
    /// interest is dropped and a pending half-close completes.
    fn handle_write(&self) {
        loop {
            let result = {
                let mut output = self.output.lock().unwrap();
                if output.is_empty() {
                    break;
                }
                let socket = self.socket.lock().unwrap();
                match socket.as_ref() {
                    Some(stream) => {
                        let mut writer: &TcpStream = stream;
                        output.write_to(&mut writer)
                    }
                    None => return,
                }
            };
            match result {
                Ok(0) => return,
                Ok(n) => {
                    BYTES_SENT.add(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(fd = self.fd, error = %e, "write failed");
                    self.handle_close();
                    return;
                }
            }
        }

        let channel = self.channel.lock().unwrap().clone();
        if let Some(channel) = channel {
            channel.disable_write();
        }
        if self.state() == ConnState::Disconnecting {
            self.shutdown_write();
        }
    }

    /// At-most-once teardown: only the transition into `Disconnected`
    /// disables the channel, fires the close callback, and closes the
    /// descriptor.
    fn handle_close(&self) {
        let previous = ConnState::from_u8(
            self.state
                .swap(ConnState::Disconnected as u8, Ordering::AcqRel),
        );
        if previous == ConnState::Disconnected {
            return;
        }
        debug!(fd = self.fd, peer = %self.peer, "closing connection");

        if let Some(channel) = self.channel.lock().unwrap().take() {
            channel.disable_all();
        }

        let callback = self.close_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            if let Some(this) = self.strong_self() {
                callback(&this);
            }
        }

        // The kernel descriptor is closed exactly once, here.
        let socket = self.socket.lock().unwrap().take();
        drop(socket);
        CONNECTIONS_ACTIVE.decrement();
    }

    /// Queues `data` for delivery. Thread-safe; cross-thread calls copy the
    /// payload. Returns whether the send was accepted, not whether it
    /// reached the peer.
    pub fn send(&self, data: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.event_loop.is_owner_thread() {
            self.send_in_loop(data);
        } else {
            let conn = match self.strong_self() {
                Some(conn) => conn,
                None => return false,
            };
            let owned = data.to_vec();
            self.event_loop
                .queue_in_loop(move || conn.send_in_loop(&owned));
        }
        true
    }

    /// Worker-loop half of `send`: a direct write when nothing is queued,
    /// with the unwritten tail parked in the output buffer.
    fn send_in_loop(&self, data: &[u8]) {
        if !self.is_connected() {
            return;
        }

        let mut written = 0;
        let mut output = self.output.lock().unwrap();
        if output.is_empty() {
            let direct = {
                let socket = self.socket.lock().unwrap();
                match socket.as_ref() {
                    Some(stream) => write_retrying(stream, data),
                    None => return,
                }
            };
            match direct {
                Ok(n) => written = n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    drop(output);
                    warn!(fd = self.fd, error = %e, "direct write failed");
                    self.handle_close();
                    return;
                }
            }
        }
        if written > 0 {
            BYTES_SENT.add(written as u64);
        }
        if written == data.len() {
            return;
        }

        if let Err(e) = output.append(&data[written..]) {
            drop(output);
            warn!(fd = self.fd, error = %e, "output buffer rejected write");
            self.handle_close();
            return;
        }
        drop(output);

        let channel = self.channel.lock().unwrap().clone();
        if let Some(channel) = channel {
            channel.enable_write();
        }
    }

    /// Cooperative shutdown: flips to `Disconnecting` on the worker loop and
    /// half-closes the write side once the output buffer drains. Idempotent.
    pub fn shutdown(&self) {
        if !self.is_connected() {
            return;
        }
        let conn = match self.strong_self() {
            Some(conn) => conn,
            None => return,
        };
        self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
    }

    fn shutdown_in_loop(&self) {
        if self
            .state
            .compare_exchange(
                ConnState::Connected as u8,
                ConnState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        if self.output.lock().unwrap().is_empty() {
            self.shutdown_write();
        }
    }

    fn shutdown_write(&self) {
        let socket = self.socket.lock().unwrap();
        if let Some(stream) = socket.as_ref() {
            if let Err(e) = stream.shutdown(Shutdown::Write) {
                warn!(fd = self.fd, error = %e, "write-side shutdown failed");
            }
        }
    }
}

fn write_retrying(stream: &TcpStream, data: &[u8]) -> io::Result<usize> {
    let mut writer: &TcpStream = stream;
    loop {
        match writer.write(data) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
