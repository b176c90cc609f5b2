// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An oblivious stack: a linked list laid into a Path ORAM.
//!
//! Each node stores its value and a pointer to its predecessor; the
//! client keeps only the head pointer. Node ids are handed out
//! sequentially from the head, so the stack manages them without the
//! ORAM's id generator.

use crate::{
    bytes::{take, FixedLayout},
    crypto::EncryptionKey,
    path_oram::{Block, BlockPointer, OramOptions, PathOram},
    OdsError,
};
use rand::{CryptoRng, Rng};

/// Encoded length of one stack node: the value plus the `next` pointer.
const NODE_LEN: usize = 12;

#[derive(Clone, Copy, Debug, Default)]
struct Node {
    value: u32,
    /// The node pushed just before this one.
    next: BlockPointer,
}

impl FixedLayout for Node {
    const BYTE_LEN: usize = NODE_LEN;

    fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.value.to_le_bytes());
        self.next.encode_into(&mut out[4..12]);
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut buf = buf;
        Self {
            value: u32::decode_from(take(&mut buf, 4)),
            next: BlockPointer::decode_from(buf),
        }
    }
}

/// An oblivious LIFO stack of `u32` values.
///
/// Popping from an empty stack returns the reserved value `0` after an
/// indistinguishable dummy access. Pushing above capacity is a caller
/// error and asserts.
#[derive(Debug)]
pub struct OStack {
    capacity: usize,
    size: usize,
    oram: PathOram<NODE_LEN>,
    head: BlockPointer,
}

impl OStack {
    /// Returns an empty stack of the given power-of-two capacity.
    pub fn new(capacity: usize) -> Result<Self, OdsError> {
        Ok(Self {
            capacity,
            size: 0,
            oram: PathOram::new(capacity, OramOptions::default())?,
            head: BlockPointer::null(),
        })
    }

    /// The stack capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of values currently stored.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Total bucket-level path operations performed so far.
    pub fn memory_access_count(&self) -> u64 {
        self.oram.memory_access_count()
    }

    /// Total encrypted bytes traversed so far.
    pub fn memory_bytes_moved_total(&self) -> u64 {
        self.oram.memory_bytes_moved_total()
    }

    /// Pushes a value onto the stack.
    pub fn push<R: Rng + CryptoRng>(
        &mut self,
        value: u32,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        assert!(self.size < self.capacity);
        self.size += 1;

        let new_head = BlockPointer::new(self.head.id + 1, self.oram.generate_position(rng));
        let node = Node {
            value,
            next: self.head,
        };
        self.head = new_head;

        let mut encoded = [0u8; NODE_LEN];
        node.encode_into(&mut encoded);
        self.oram
            .insert(Block::new(self.head.position, self.head.id, encoded), enc_key, rng)
    }

    /// Pops the most recently pushed value, or returns `0` if the stack is
    /// empty.
    pub fn pop<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<u32, OdsError> {
        if self.head.is_null() {
            self.oram.dummy_access(enc_key, rng)?;
            return Ok(0);
        }

        self.size -= 1;
        let block = self.oram.read_and_remove(
            Block::query(self.head.position, self.head.id),
            enc_key,
            rng,
        )?;
        let node = Node::decode_from(&block.value);
        self.head = node.next;
        Ok(node.value)
    }

    /// Returns the top value without removing it, or `0` if the stack is
    /// empty.
    pub fn peek<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<u32, OdsError> {
        if self.head.is_null() {
            self.oram.dummy_access(enc_key, rng)?;
            return Ok(0);
        }

        let block = self
            .oram
            .read(Block::query(self.head.position, self.head.id), enc_key, rng)?;
        // The read re-tagged the node; follow it.
        self.head.position = block.position;
        Ok(Node::decode_from(&block.value).value)
    }

    /// Initializes every ORAM bucket to an encrypted all-dummy bucket.
    pub fn fill_with_dummies<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        self.oram.fill_with_dummies(enc_key, rng)
    }
}
