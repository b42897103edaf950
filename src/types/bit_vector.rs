/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Fixed-length bit vector with a canonical byte encoding.
//!
//! `BitVector`s record which validators have voted in a [`VoteSet`](crate::consensus::vote_set),
//! which parts of a [`PartSet`](super::part_set::PartSet) have been received, and travel inside
//! [`VoteSetBits`](crate::messages::PeerStateMessage) messages during catch-up gossip.
//!
//! The byte encoding packs bits most-significant-bit first within each byte: bit 0 of the vector
//! is bit 7 of byte 0. The final byte is zero-padded.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

/// A fixed-length sequence of bits. The length is set at construction and never changes.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BitVector {
    bits: u32,
    elems: Vec<bool>,
}

impl BitVector {
    /// Create a new `BitVector` of length `bits`, with every bit cleared.
    pub fn new(bits: u32) -> Self {
        Self {
            bits,
            elems: vec![false; bits as usize],
        }
    }

    /// Get the number of bits in this `BitVector`.
    pub const fn len(&self) -> u32 {
        self.bits
    }

    /// Whether this `BitVector` has length 0.
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Get the bit at `index`, or `false` if `index` is out of range.
    pub fn get(&self, index: u32) -> bool {
        self.elems.get(index as usize).copied().unwrap_or(false)
    }

    /// Set the bit at `index` to `value`. Returns `false` if `index` is out of range.
    pub fn set(&mut self, index: u32, value: bool) -> bool {
        match self.elems.get_mut(index as usize) {
            Some(elem) => {
                *elem = value;
                true
            }
            None => false,
        }
    }

    /// Count the set bits in this `BitVector`.
    pub fn count_ones(&self) -> u32 {
        self.elems.iter().filter(|elem| **elem).count() as u32
    }

    /// Pack this `BitVector` into bytes, most-significant-bit first within each byte.
    ///
    /// The output has `(bits + 7) / 8` bytes, and the unused low bits of the final byte are zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; ((self.bits + 7) / 8) as usize];
        for (index, elem) in self.elems.iter().enumerate() {
            if *elem {
                bytes[index / 8] |= 1 << (7 - (index % 8));
            }
        }
        bytes
    }

    /// Unpack a `BitVector` of length `bits` from `bytes`.
    ///
    /// Returns `None` if `bytes` is not exactly `(bits + 7) / 8` bytes long, or if any padding
    /// bit in the final byte is set.
    pub fn from_bytes(bits: u32, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ((bits + 7) / 8) as usize {
            return None;
        }
        let mut bit_vector = Self::new(bits);
        for index in 0..(bytes.len() * 8) as u32 {
            let set = bytes[(index / 8) as usize] & (1 << (7 - (index % 8))) != 0;
            if index < bits {
                bit_vector.elems[index as usize] = set;
            } else if set {
                return None;
            }
        }
        Some(bit_vector)
    }
}

impl Display for BitVector {
    /// Render each bit as `x` (set) or `_` (cleared), in index order.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for elem in &self.elems {
            f.write_str(if *elem { "x" } else { "_" })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_is_big_endian_within_byte() {
        let mut bit_vector = BitVector::new(5);
        bit_vector.set(3, true);
        assert_eq!(bit_vector.to_bytes(), vec![0x10]);
    }

    #[test]
    fn byte_round_trip() {
        let mut bit_vector = BitVector::new(12);
        bit_vector.set(0, true);
        bit_vector.set(7, true);
        bit_vector.set(11, true);
        let bytes = bit_vector.to_bytes();
        assert_eq!(bytes.len(), 2);
        assert_eq!(BitVector::from_bytes(12, &bytes), Some(bit_vector));
    }

    #[test]
    fn rejects_set_padding_bits() {
        assert!(BitVector::from_bytes(5, &[0x01]).is_none());
        assert!(BitVector::from_bytes(5, &[0xF8]).is_some());
    }

    #[test]
    fn rejects_wrong_byte_length() {
        assert!(BitVector::from_bytes(9, &[0x00]).is_none());
        assert!(BitVector::from_bytes(8, &[0x00, 0x00]).is_none());
    }

    #[test]
    fn out_of_range_accesses() {
        let mut bit_vector = BitVector::new(3);
        assert!(!bit_vector.set(3, true));
        assert!(!bit_vector.get(3));
    }

    #[test]
    fn canonical_string() {
        let mut bit_vector = BitVector::new(4);
        bit_vector.set(1, true);
        assert_eq!(bit_vector.to_string(), "_x__");
    }
}
