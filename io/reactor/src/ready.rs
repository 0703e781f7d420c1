//! Readiness flags delivered to channel callbacks.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// A set of readiness flags for one descriptor.
///
/// Built from the poller's raw events. `READ_CLOSED` corresponds to the
/// peer half-closing its write direction (`EPOLLRDHUP`); it is delivered
/// whenever read interest is armed, without being requested separately.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0000_0001);
    pub const WRITABLE: Ready = Ready(0b0000_0010);
    pub const READ_CLOSED: Ready = Ready(0b0000_0100);
    pub const WRITE_CLOSED: Ready = Ready(0b0000_1000);
    pub const ERROR: Ready = Ready(0b0001_0000);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Ready::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Ready::WRITABLE)
    }

    pub fn is_read_closed(self) -> bool {
        self.contains(Ready::READ_CLOSED)
    }

    pub fn is_write_closed(self) -> bool {
        self.contains(Ready::WRITE_CLOSED)
    }

    pub fn is_error(self) -> bool {
        self.contains(Ready::ERROR)
    }

    pub(crate) fn from_event(event: &mio::event::Event) -> Ready {
        let mut ready = Ready::EMPTY;
        if event.is_readable() {
            ready |= Ready::READABLE;
        }
        if event.is_writable() {
            ready |= Ready::WRITABLE;
        }
        if event.is_read_closed() {
            ready |= Ready::READ_CLOSED;
        }
        if event.is_write_closed() {
            ready |= Ready::WRITE_CLOSED;
        }
        if event.is_error() {
            ready |= Ready::ERROR;
        }
        ready
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.is_readable() {
            set.entry(&"READABLE");
        }
        if self.is_writable() {
            set.entry(&"WRITABLE");
        }
        if self.is_read_closed() {
            set.entry(&"READ_CLOSED");
        }
        if self.is_write_closed() {
            set.entry(&"WRITE_CLOSED");
        }
        if self.is_error() {
            set.entry(&"ERROR");
        }
        set.finish()
    }
}
