/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or small integers, and do not have any major "active"
//! behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign, Sub},
    time::{SystemTime, UNIX_EPOCH},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Human-readable string that uniquely identifies a blockchain.
///
/// Every block, vote, and proposal produced for the same blockchain carries the same `ChainId`.
/// Sign-bytes include the chain ID, so signatures produced for one chain never verify on another.
#[derive(Clone, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct ChainId(String);

impl ChainId {
    /// Create a new `ChainId` wrapping `string`.
    pub fn new(string: impl Into<String>) -> Self {
        Self(string.into())
    }

    /// Get the inner `str` of this `ChainId`.
    pub fn str(&self) -> &str {
        &self.0
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Height of a block in the chain.
///
/// Starts at the genesis document's `initial_height` (at least 1) and increases by 1 with every
/// committed block. A `last_block_height` of 0 means no block has been committed yet.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Height(u64);

impl Height {
    /// Create a new `Height` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `Height`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for Height {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl AddAssign<u64> for Height {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

impl Add<u64> for Height {
    type Output = Height;
    fn add(self, rhs: u64) -> Self::Output {
        Height::new(self.0.add(rhs))
    }
}

impl Sub<u64> for Height {
    type Output = Height;
    fn sub(self, rhs: u64) -> Self::Output {
        Height::new(self.0 - rhs)
    }
}

/// Round number within a height.
///
/// Rounds start at 0 at every height and increase by 1 every time the validators fail to commit a
/// block in the current round. The inner value is an `i32` because several fields (`pol_round`,
/// `locked_round`, `valid_round`, `commit_round`) use -1 as a "no round" sentinel.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Round(i32);

impl Round {
    /// The "no round" sentinel, -1.
    pub const NONE: Round = Round(-1);

    /// Create a new `Round` with an `int` inner value.
    pub const fn new(int: i32) -> Self {
        Self(int)
    }

    /// Get the inner `i32` value of this `Round`.
    pub const fn int(&self) -> i32 {
        self.0
    }

    /// Whether this `Round` is the "no round" sentinel.
    pub const fn is_none(&self) -> bool {
        self.0 == -1
    }
}

impl Display for Round {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl AddAssign<i32> for Round {
    fn add_assign(&mut self, rhs: i32) {
        self.0.add_assign(rhs)
    }
}

impl Add<i32> for Round {
    type Output = Round;
    fn add(self, rhs: i32) -> Self::Output {
        Round::new(self.0.add(rhs))
    }
}

/// Point in time, as a number of milliseconds since the Unix Epoch.
///
/// Block and vote times use `Timestamp` rather than [`SystemTime`] so that they have a canonical
/// Borsh encoding for sign-bytes and block hashes.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new `Timestamp` with an inner value of `millis` milliseconds since the Unix Epoch.
    pub const fn new(millis: i64) -> Self {
        Self(millis)
    }

    /// Get the current time as a `Timestamp`.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(since_epoch.as_millis() as i64)
    }

    /// The zero `Timestamp` (the Unix Epoch itself).
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Get the inner `i64` milliseconds value of this `Timestamp`.
    pub const fn millis(&self) -> i64 {
        self.0
    }

    /// Get this `Timestamp` shifted forward by `millis` milliseconds.
    pub const fn add_millis(&self, millis: i64) -> Self {
        Self(self.0 + millis)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// 20-byte account address of a validator, derived from its Ed25519 public key by taking the
/// first 20 bytes of the key's SHA256 hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Address([u8; 20]);

impl Address {
    /// Create a new `Address` wrapping `bytes`.
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 20]` value of this `Address`.
    pub const fn bytes(&self) -> [u8; 20] {
        self.0
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 32-byte cryptographic hash.
///
/// Within this crate, `CryptoHash`-es are always SHA256 hashes: Merkle roots, block hashes, part
/// hashes, and validator set hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The all-zeroes `CryptoHash`, used as the hash inside a "nil"
    /// [`BlockId`](super::block::BlockId).
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Whether this `CryptoHash` is all zeroes.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ed25519 digital signature.
///
/// Produced and verified using the [`ed25519_dalek`] crate.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Weight of a specific validator's votes in consensus decisions.
///
/// The higher the power, the more weight the validator's votes have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct Power(u64);

impl Power {
    /// Create a new `Power` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `Power`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Sum of the [`Power`]s of a subset of the validators in a
/// [`ValidatorSet`](super::validators::ValidatorSet).
///
/// The inner type that this newtype wraps around is `u128`, which is bigger than the inner `u64`
/// that `Power` wraps around. This is so that summing up large `Power`s does not cause
/// `TotalPower`'s inner value to overflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct TotalPower(u128);

impl TotalPower {
    /// Create a new `TotalPower` wrapping `int`.
    pub(crate) const fn new(int: u128) -> Self {
        Self(int)
    }

    /// The zero `TotalPower`.
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Get the inner `u128` value of this `TotalPower`.
    pub const fn int(&self) -> u128 {
        self.0
    }
}

impl AddAssign<Power> for TotalPower {
    fn add_assign(&mut self, rhs: Power) {
        self.0.add_assign(rhs.0 as u128)
    }
}

/// Network-level identifier of a peer, opaque to the consensus core.
///
/// Peers are tracked only to bound catch-up vote gossip and to record +2/3 claims; the transport
/// that assigns these identifiers is outside this crate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Create a new `PeerId` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `PeerId`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single transaction, as an opaque byte string interpreted only by the
/// [`App`](crate::app::App).
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct Transaction(Vec<u8>);

impl Transaction {
    /// Create a new `Transaction` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the inner `Vec<u8>` of this `Transaction`.
    pub const fn bytes(&self) -> &Vec<u8> {
        &self.0
    }

    /// Get the length in bytes of this `Transaction`.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this `Transaction` is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
