//! Event flag set.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bitmask describing what a registration waits for, and what a firing
/// delivered. Buffered-I/O status flags share the same set so event
/// callbacks receive one coherent mask.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFlags(u16);

impl EventFlags {
    pub const NONE: Self = Self(0);

    /// A timeout expired.
    pub const TIMEOUT: Self = Self(0x0001);
    /// The fd became readable.
    pub const READ: Self = Self(0x0002);
    /// The fd became writable.
    pub const WRITE: Self = Self(0x0004);
    /// A posix signal was delivered.
    pub const SIGNAL: Self = Self(0x0008);
    /// Keep the registration armed after it fires.
    pub const PERSIST: Self = Self(0x0010);
    /// Edge-triggered readiness.
    pub const EDGE: Self = Self(0x0020);
    /// Accepted for source compatibility; this implementation frees
    /// handlers deterministically and needs no deferred finalizer.
    pub const FINALIZE: Self = Self(0x0040);
    /// The peer closed its end.
    pub const CLOSED: Self = Self(0x0080);

    // buffered-I/O status flags
    /// Clean end of stream.
    pub const EOF: Self = Self(0x0100);
    /// Unrecoverable socket or protocol failure.
    pub const ERROR: Self = Self(0x0200);
    /// An asynchronous connect completed.
    pub const CONNECTED: Self = Self(0x0400);
    /// Status refers to the read direction.
    pub const READING: Self = Self(0x0800);
    /// Status refers to the write direction.
    pub const WRITING: Self = Self(0x1000);

    #[inline]
    pub const fn bits(self) -> u16 { self.0 }

    #[inline]
    pub const fn from_bits(bits: u16) -> Self { Self(bits) }

    #[inline]
    pub const fn is_empty(self) -> bool { self.0 == 0 }

    /// All bits of `other` present.
    #[inline]
    pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

    /// Any bit of `other` present.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool { self.0 & other.0 != 0 }

    #[inline]
    pub const fn without(self, other: Self) -> Self { Self(self.0 & !other.0) }
}

impl BitOr for EventFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
}

impl BitOrAssign for EventFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0 }
}

impl BitAnd for EventFlags {
    type Output = Self;

    #[inline]
    fn bitand(self, rhs: Self) -> Self { Self(self.0 & rhs.0) }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u16, &str); 13] = [
            (0x0001, "TIMEOUT"),
            (0x0002, "READ"),
            (0x0004, "WRITE"),
            (0x0008, "SIGNAL"),
            (0x0010, "PERSIST"),
            (0x0020, "EDGE"),
            (0x0040, "FINALIZE"),
            (0x0080, "CLOSED"),
            (0x0100, "EOF"),
            (0x0200, "ERROR"),
            (0x0400, "CONNECTED"),
            (0x0800, "READING"),
            (0x1000, "WRITING"),
        ];

        if self.is_empty() {
            return write!(f, "NONE");
        }

        let mut first = true;
        for (bit, name) in NAMES {
            if self.0 & bit != 0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}
