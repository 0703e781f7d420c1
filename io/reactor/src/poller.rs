//! Readiness notifier over mio's `Poll` (epoll on Linux, kqueue on macOS).

use crate::ready::Ready;
use mio::unix::SourceFd;
use mio::{Events, Interest, Registry, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const INITIAL_EVENT_CAPACITY: usize = 1024;

/// Thin wrapper over the OS readiness API.
///
/// Registration is keyed by token; the token is returned unchanged with each
/// readiness event. All registrations are edge-triggered, and peer-half-close
/// notification is armed implicitly with read interest.
pub struct Poller {
    poll: mio::Poll,
    events: Events,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            poll: mio::Poll::new()?,
            events: Events::with_capacity(INITIAL_EVENT_CAPACITY),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn add(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
    }

    pub fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Block until readiness is delivered or `timeout` elapses.
    ///
    /// Retries transparently when interrupted by a signal. When the event
    /// slice comes back full, its capacity is doubled before the next call
    /// because more events may be pending in the kernel.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, Ready)>> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let ready: Vec<(Token, Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), Ready::from_event(event)))
            .collect();

        if ready.len() == self.events.capacity() {
            self.events = Events::with_capacity(self.events.capacity() * 2);
        }

        Ok(ready)
    }
}
