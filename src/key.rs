//! # Fixed-Size Tree Keys
//!
//! Every item in the tree is addressed by a 16-byte key compared as an
//! unsigned big-endian integer, which for a byte array is plain
//! lexicographic order. The all-ones key is reserved as the maximum-key
//! sentinel: it terminates the right spine of every parent level so an
//! insert of any real key never has to update an ancestor separator.
//!
//! Keys are `zerocopy`-transparent and unaligned, so item headers embed them
//! directly and parent blocks compare them in place without deserializing.
//!
//! `successor()` saturates at [`Key::MAX`] instead of wrapping. Iteration
//! relies on this: the resume key derived from a right-spine separator must
//! never travel backwards.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::KEY_SIZE;

/// A fixed-size key ordered bytewise (big-endian integer order).
#[repr(transparent)]
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromBytes, IntoBytes, Immutable,
    KnownLayout, Unaligned,
)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// The smallest key.
    pub const MIN: Key = Key([0x00; KEY_SIZE]);

    /// The maximum-key sentinel. Real items must use keys strictly below it.
    pub const MAX: Key = Key([0xff; KEY_SIZE]);

    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Embeds a u64 in the low eight bytes, preserving numeric order.
    pub fn from_u64(v: u64) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        bytes[KEY_SIZE - 8..].copy_from_slice(&v.to_be_bytes());
        Self(bytes)
    }

    /// Recovers the low eight bytes as a u64.
    pub fn to_u64(&self) -> u64 {
        let mut low = [0u8; 8];
        low.copy_from_slice(&self.0[KEY_SIZE - 8..]);
        u64::from_be_bytes(low)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_max(&self) -> bool {
        *self == Self::MAX
    }

    /// The next key in order, saturating at [`Key::MAX`].
    pub fn successor(&self) -> Key {
        let mut bytes = self.0;
        for b in bytes.iter_mut().rev() {
            if *b == 0xff {
                *b = 0;
            } else {
                *b += 1;
                return Key(bytes);
            }
        }
        Key::MAX
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}
