/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Part sets: a block's bytes, chunked for gossip with per-chunk Merkle proofs.
//!
//! A proposer encodes its block, splits the encoding into fixed-size parts, and announces the
//! [`PartSetHeader`] (part count and Merkle root) inside the proposal's [`BlockId`]. Receivers
//! rebuild the part set chunk by chunk, verifying each part's proof against the announced root,
//! so a single bad part is rejected immediately instead of corrupting the whole download.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::merkle::{proofs_from_byte_slices, Proof, ProofError};

use super::bit_vector::BitVector;
use super::block::{Block, PartSetHeader};

/// One chunk of a block's encoded bytes, with the proof of its place in the part set.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub proof: Proof,
}

/// A (possibly still incomplete) set of block parts.
#[derive(Clone)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    received: BitVector,
    count: u32,
    byte_size: u64,
}

impl PartSet {
    /// Split `data` into parts of at most `part_size` bytes and build the proofs over them.
    pub fn from_data(data: &[u8], part_size: u32) -> Self {
        let chunks: Vec<&[u8]> = data.chunks(part_size as usize).collect();
        let (root, proofs) = proofs_from_byte_slices(&chunks);
        let total = chunks.len() as u32;
        let parts: Vec<Option<Part>> = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(index, (bytes, proof))| {
                Some(Part {
                    index: index as u32,
                    bytes: bytes.to_vec(),
                    proof,
                })
            })
            .collect();
        let mut received = BitVector::new(total);
        for index in 0..total {
            received.set(index, true);
        }
        Self {
            header: PartSetHeader { total, hash: root },
            parts,
            received,
            count: total,
            byte_size: data.len() as u64,
        }
    }

    /// Encode `block` and split it into parts.
    pub fn from_block(block: &Block, part_size: u32) -> Self {
        Self::from_data(&block.try_to_vec().unwrap(), part_size)
    }

    /// Create an empty `PartSet` expecting the parts announced by `header`. Used by receivers
    /// that learned the header from a proposal and have yet to receive any part.
    pub fn from_header(header: PartSetHeader) -> Self {
        Self {
            parts: vec![None; header.total as usize],
            received: BitVector::new(header.total),
            count: 0,
            byte_size: 0,
            header,
        }
    }

    pub fn header(&self) -> &PartSetHeader {
        &self.header
    }

    /// Whether this part set is the one announced by `header`.
    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.header == *header
    }

    pub fn total(&self) -> u32 {
        self.header.total
    }

    /// How many parts have been received so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    /// Add a received part.
    ///
    /// Returns `Ok(true)` if the part was new, `Ok(false)` if it was already present, and an
    /// error if its index is out of range or its proof does not verify against the header's root.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        if part.index >= self.header.total {
            return Err(PartSetError::IndexOutOfRange {
                index: part.index,
                total: self.header.total,
            });
        }
        if self.parts[part.index as usize].is_some() {
            return Ok(false);
        }
        if part.proof.index != part.index as u64 || part.proof.total != self.header.total as u64 {
            return Err(PartSetError::ProofPositionMismatch { index: part.index });
        }
        part.proof
            .verify(&self.header.hash, &part.bytes)
            .map_err(PartSetError::InvalidProof)?;

        self.received.set(part.index, true);
        self.count += 1;
        self.byte_size += part.bytes.len() as u64;
        let index = part.index as usize;
        self.parts[index] = Some(part);
        Ok(true)
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize)?.as_ref()
    }

    /// Iterate over the parts received so far, in index order.
    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter_map(|part| part.as_ref())
    }

    /// Which part indices have been received.
    pub fn bit_vector(&self) -> BitVector {
        self.received.clone()
    }

    /// Reassemble and decode the block, once all parts are present.
    pub fn to_block(&self) -> Result<Block, PartSetError> {
        if !self.is_complete() {
            return Err(PartSetError::Incomplete {
                count: self.count,
                total: self.header.total,
            });
        }
        let mut bytes = Vec::with_capacity(self.byte_size as usize);
        for part in self.parts.iter() {
            // Safety: is_complete checked above.
            bytes.extend_from_slice(&part.as_ref().unwrap().bytes);
        }
        Block::deserialize(&mut bytes.as_slice()).map_err(PartSetError::DecodeBlock)
    }
}

/// Ways in which receiving or assembling block parts can fail.
#[derive(Debug)]
pub enum PartSetError {
    IndexOutOfRange { index: u32, total: u32 },
    ProofPositionMismatch { index: u32 },
    InvalidProof(ProofError),
    Incomplete { count: u32, total: u32 },
    DecodeBlock(std::io::Error),
}

impl Display for PartSetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PartSetError::IndexOutOfRange { index, total } => {
                write!(f, "part index {} out of range (total {})", index, total)
            }
            PartSetError::ProofPositionMismatch { index } => {
                write!(f, "proof of part {} is for a different position", index)
            }
            PartSetError::InvalidProof(source) => write!(f, "invalid part proof: {}", source),
            PartSetError::Incomplete { count, total } => {
                write!(f, "part set incomplete: {} of {} parts", count, total)
            }
            PartSetError::DecodeBlock(source) => {
                write!(f, "failed to decode block from parts: {}", source)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index % 251) as u8).collect()
    }

    #[test]
    fn data_survives_chunking_and_reassembly() {
        let data = sample_data(1000);
        let sent = PartSet::from_data(&data, 64);
        assert_eq!(sent.total(), 16);
        assert!(sent.is_complete());

        let mut receiving = PartSet::from_header(*sent.header());
        assert!(!receiving.is_complete());
        for part in sent.parts() {
            assert!(receiving.add_part(part.clone()).unwrap());
        }
        assert!(receiving.is_complete());
        assert_eq!(receiving.byte_size(), data.len() as u64);

        let mut assembled = Vec::new();
        for part in receiving.parts() {
            assembled.extend_from_slice(&part.bytes);
        }
        assert_eq!(assembled, data);
    }

    #[test]
    fn duplicate_parts_are_ignored() {
        let sent = PartSet::from_data(&sample_data(100), 64);
        let mut receiving = PartSet::from_header(*sent.header());
        let part = sent.get_part(0).unwrap().clone();
        assert!(receiving.add_part(part.clone()).unwrap());
        assert!(!receiving.add_part(part).unwrap());
        assert_eq!(receiving.count(), 1);
    }

    #[test]
    fn tampered_part_is_rejected() {
        let sent = PartSet::from_data(&sample_data(200), 64);
        let mut receiving = PartSet::from_header(*sent.header());
        let mut part = sent.get_part(1).unwrap().clone();
        part.bytes[0] ^= 0xFF;
        assert!(matches!(
            receiving.add_part(part),
            Err(PartSetError::InvalidProof(_))
        ));
        assert_eq!(receiving.count(), 0);
    }

    #[test]
    fn out_of_range_part_is_rejected() {
        let sent = PartSet::from_data(&sample_data(100), 64);
        let mut receiving = PartSet::from_header(*sent.header());
        let mut part = sent.get_part(0).unwrap().clone();
        part.index = 99;
        assert!(matches!(
            receiving.add_part(part),
            Err(PartSetError::IndexOutOfRange { .. })
        ));
    }
}
