//! Readiness flags decoupled from the OS facility.
//!
//! `mio` only lets us express read/write interest at registration time, and
//! reports edge-triggered events. Sessions instead keep their own
//! [`Readiness`]: sticky `event` bits accumulated from the poller and
//! `interest` bits toggled as buffers fill and drain. I/O is attempted for
//! the intersection of the two, and an `event` bit is only cleared when the
//! descriptor reports `WouldBlock`, which is what guarantees a future edge.

use std::{
    fmt,
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not},
};

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Ready(pub u16);

impl Ready {
    pub const EMPTY: Ready = Ready(0b0000);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const ERROR: Ready = Ready(0b0100);
    pub const HUP: Ready = Ready(0b1000);
    pub const ALL: Ready = Ready(0b1111);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub fn is_hup(&self) -> bool {
        self.0 & Self::HUP.0 != 0
    }

    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    pub fn contains(&self, other: Ready) -> bool {
        self.0 & other.0 == other.0
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

impl BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

impl BitAndAssign for Ready {
    fn bitand_assign(&mut self, rhs: Ready) {
        self.0 &= rhs.0;
    }
}

impl Not for Ready {
    type Output = Ready;

    fn not(self) -> Ready {
        Ready(!self.0 & Self::ALL.0)
    }
}

impl From<&mio::event::Event> for Ready {
    fn from(event: &mio::event::Event) -> Self {
        let mut ready = Ready::EMPTY;
        if event.is_readable() {
            ready.insert(Ready::READABLE);
        }
        if event.is_writable() {
            ready.insert(Ready::WRITABLE);
        }
        if event.is_error() {
            ready.insert(Ready::ERROR);
        }
        if event.is_read_closed() || event.is_write_closed() {
            ready.insert(Ready::HUP);
        }
        ready
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut flags = String::with_capacity(4);
        flags.push(if self.is_readable() { 'R' } else { '-' });
        flags.push(if self.is_writable() { 'W' } else { '-' });
        flags.push(if self.is_error() { 'E' } else { '-' });
        flags.push(if self.is_hup() { 'H' } else { '-' });
        write!(f, "{flags}")
    }
}

/// Interest and event bookkeeping for one registered descriptor.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// the directions the owner is currently willing to act on
    pub interest: Ready,
    /// sticky events received from the poller, cleared on `WouldBlock`
    pub event: Ready,
}

impl Readiness {
    pub fn new() -> Readiness {
        Readiness {
            interest: Ready::EMPTY,
            event: Ready::EMPTY,
        }
    }

    /// the directions that can make progress right now
    pub fn filter_interest(&self) -> Ready {
        self.interest & self.event
    }

    pub fn reset(&mut self) {
        self.interest = Ready::EMPTY;
        self.event = Ready::EMPTY;
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Readiness {{ interest: {:?}, event: {:?} }}",
            self.interest, self.event
        )
    }
}
