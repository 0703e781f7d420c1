//! Listening socket and accept loop.

use crate::connection::TcpConnection;
use crate::error::ServerError;
use crate::metrics::{ACCEPT_ERRORS, CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE, FD_EXHAUSTED_RESCUES};
use crate::server::TcpServer;
use io_reactor::{Channel, EventLoop};
use socket2::{Domain, Protocol, Socket, Type};
use std::fs::File;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{error, info, warn};

const BACKLOG: i32 = 1024;

/// Owns the listening socket and its channel on the base loop.
///
/// One descriptor is held open against `/dev/null` so that an
/// EMFILE/ENFILE condition can be cleared: the reserved descriptor is
/// closed, the pending connection accepted and immediately dropped, and the
/// reserve reopened. Without this the listener's readable edge would stay
/// latched with no way to make progress.
pub struct Acceptor {
    weak_self: Weak<Acceptor>,
    server: Weak<TcpServer>,
    event_loop: Arc<EventLoop>,
    listener: TcpListener,
    channel: Arc<Channel>,
    rescue_fd: Mutex<Option<File>>,
    listening: AtomicBool,
    addr: SocketAddrV4,
}

impl Acceptor {
    pub fn new(
        server: &Arc<TcpServer>,
        event_loop: Arc<EventLoop>,
        ip: Ipv4Addr,
        port: u16,
    ) -> Result<Arc<Acceptor>, ServerError> {
        let addr = SocketAddrV4::new(ip, port);
        let listener = build_listener(addr).map_err(ServerError::SocketSetup)?;
        let rescue = File::open("/dev/null").map_err(ServerError::SocketSetup)?;

        let channel = Channel::new(Arc::clone(&event_loop), listener.as_raw_fd());
        let acceptor = Arc::new_cyclic(|weak_self| Acceptor {
            weak_self: weak_self.clone(),
            server: Arc::downgrade(server),
            event_loop,
            listener,
            channel: Arc::clone(&channel),
            rescue_fd: Mutex::new(Some(rescue)),
            listening: AtomicBool::new(false),
            addr,
        });

        let weak = Arc::downgrade(&acceptor);
        channel.set_callback(move |ready| {
            if let Some(acceptor) = weak.upgrade() {
                if ready.is_readable() || ready.is_read_closed() || ready.is_error() {
                    acceptor.accept_pending();
                }
            }
        });

        info!(fd = acceptor.listener.as_raw_fd(), addr = %addr, "acceptor created");
        Ok(acceptor)
    }

    /// Registers read interest on the base loop. Idempotent.
    pub fn listen(&self) {
        if self.listening.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel.enable_read();
        info!(addr = %self.addr, "listening");
    }

    /// Deregisters the listener on the loop thread. The listening socket
    /// closes once the queued task (and with it the last reference) drops.
    pub fn close(&self) {
        let acceptor = match self.weak_self.upgrade() {
            Some(acceptor) => acceptor,
            None => return,
        };
        self.event_loop.run_in_loop(move || {
            acceptor.channel.disable_all();
        });
    }

    /// Accept loop, invoked on the base loop when the listener is readable.
    /// Edge-triggered: drains until would-block.
    fn accept_pending(&self) {
        let server = match self.server.upgrade() {
            Some(server) => server,
            None => return,
        };

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.dispatch(&server, stream, peer),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_fd_exhausted(&e) => self.rescue_one(),
                Err(e) => {
                    ACCEPT_ERRORS.increment();
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// EMFILE/ENFILE: free the reserved descriptor, accept-and-drop the
    /// pending connection, restore the reserve. The loop continues so the
    /// readable edge is still drained to completion.
    fn rescue_one(&self) {
        FD_EXHAUSTED_RESCUES.increment();
        warn!("file descriptor limit reached, shedding one pending connection");

        let mut rescue = self.rescue_fd.lock().unwrap();
        rescue.take();
        unsafe {
            let fd = libc::accept(
                self.listener.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            );
            if fd >= 0 {
                libc::close(fd);
            }
        }
        match File::open("/dev/null") {
            Ok(file) => *rescue = Some(file),
            Err(e) => error!(error = %e, "failed to restore rescue descriptor"),
        }
    }

    fn dispatch(&self, server: &Arc<TcpServer>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(peer = %peer, error = %e, "set_nonblocking failed, dropping connection");
            return;
        }
        CONNECTIONS_ACCEPTED.increment();
        CONNECTIONS_ACTIVE.increment();

        let worker = server.next_loop();
        let conn = TcpConnection::new(Arc::clone(&worker), stream, peer, server.buffer_pool());
        server.install_callbacks(&conn);

        let established = Arc::clone(&conn);
        worker.queue_in_loop(move || established.connect_established());
        server.add_connection(conn);
    }
}

fn is_fd_exhausted(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

/// Non-blocking CLOEXEC listener with SO_REUSEADDR and SO_REUSEPORT.
fn build_listener(addr: SocketAddrV4) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    // SO_REUSEPORT so multiple processes can share the endpoint.
    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_listener() {
        let listener =
            build_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).expect("build listener");
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() != 0);

        // Non-blocking accept on an idle listener must not hang.
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_fd_exhausted_classification() {
        assert!(is_fd_exhausted(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_fd_exhausted(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_fd_exhausted(&io::Error::from_raw_os_error(libc::EAGAIN)));
    }
}
