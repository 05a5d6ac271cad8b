//! Replicated entries and their circular version counters.

use std::fmt;
use std::ops::{BitAnd, BitOr};

use crate::value::{Value, ValueType};

/// Sentinel id for an entry that has not yet been assigned one by the
/// server. Never valid on the wire except in a client's first
/// `EntryAssign` for a locally created entry.
pub const UNASSIGNED_ID: u32 = 0xffff;

/// 16-bit circular sequence number.
///
/// Ordering is circular: `a` is newer than `b` iff `(a - b) mod 65536`
/// lies in `(0, 32768)`. This tolerates wraparound after 65536 updates
/// to the same entry and is the sole tie-break between concurrent
/// updates to one name from different origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeqNum(u16);

impl SeqNum {
    /// Create from a raw wire value.
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// The raw wire value.
    pub const fn value(self) -> u16 {
        self.0
    }

    /// Circular strictly-newer comparison.
    pub fn newer_than(self, other: SeqNum) -> bool {
        let diff = self.0.wrapping_sub(other.0);
        diff != 0 && diff < 0x8000
    }

    /// Advance by one, wrapping at 65536.
    pub fn bump(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-entry flag bits. Bit 0 marks the entry as persistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags(u8);

impl EntryFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Entry survives restarts via the persistence file.
    pub const PERSISTENT: Self = Self(0x01);

    /// Create from a raw wire byte.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// The raw wire byte.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether the persistent bit is set.
    pub fn is_persistent(self) -> bool {
        self.0 & Self::PERSISTENT.0 != 0
    }
}

impl BitOr for EntryFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for EntryFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// A named, typed, versioned value replicated between peers.
///
/// Within one storage instance there is at most one live entry per name.
/// Ids are dense indexes assigned by the server and reused after
/// deletion.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub value: Value,
    pub id: u32,
    pub seq_num: SeqNum,
    pub flags: EntryFlags,
    /// Whether the entry was created by local API rather than a peer.
    pub local: bool,
}

impl Entry {
    /// Create a fresh, locally originated entry with no id assigned.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            id: UNASSIGNED_ID,
            seq_num: SeqNum::default(),
            flags: EntryFlags::NONE,
            local: true,
        }
    }
}

/// Read-only description of an entry, produced on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub name: String,
    pub ty: ValueType,
    pub flags: EntryFlags,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_seq_num_basic_ordering() {
        assert!(SeqNum::new(2).newer_than(SeqNum::new(1)));
        assert!(!SeqNum::new(1).newer_than(SeqNum::new(2)));
        assert!(!SeqNum::new(7).newer_than(SeqNum::new(7)));
    }

    #[test]
    fn test_seq_num_wraparound() {
        // (5 - 65530) mod 65536 = 11, so 5 is newer than 65530.
        assert!(SeqNum::new(5).newer_than(SeqNum::new(65530)));
        assert!(!SeqNum::new(65530).newer_than(SeqNum::new(5)));
    }

    #[test]
    fn test_seq_num_halfway_is_not_newer() {
        // exactly 32768 apart: neither side wins
        assert!(!SeqNum::new(0x8000).newer_than(SeqNum::new(0)));
        assert!(!SeqNum::new(0).newer_than(SeqNum::new(0x8000)));
    }

    #[test]
    fn test_seq_num_bump_wraps() {
        let mut s = SeqNum::new(0xffff);
        s.bump();
        assert_eq!(s.value(), 0);
    }

    #[test]
    fn test_entry_flags_persistent() {
        assert!(EntryFlags::PERSISTENT.is_persistent());
        assert!(!EntryFlags::NONE.is_persistent());
        assert!((EntryFlags::NONE | EntryFlags::PERSISTENT).is_persistent());
    }

    proptest! {
        #[test]
        fn prop_seq_num_antisymmetric(a: u16, b: u16) {
            let (sa, sb) = (SeqNum::new(a), SeqNum::new(b));
            // at most one direction can be strictly newer
            prop_assert!(!(sa.newer_than(sb) && sb.newer_than(sa)));
        }

        #[test]
        fn prop_seq_num_bump_is_newer(a: u16) {
            let old = SeqNum::new(a);
            let mut new = old;
            new.bump();
            prop_assert!(new.newer_than(old));
        }
    }
}
