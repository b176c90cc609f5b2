// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An oblivious queue: a linked list laid into a Path ORAM.
//!
//! Each node's `next` pointer names its *newer* neighbour, so an enqueue
//! writes the new node into the slot the previous head pointer reserved.
//! The ORAM may be shared with other queues through a reference-counted
//! handle; its lifetime is that of the longest-holding container.

use crate::{
    bytes::{take, FixedLayout},
    crypto::EncryptionKey,
    path_oram::{Block, BlockPointer, OramOptions, PathOram},
    OdsError,
};
use rand::{CryptoRng, Rng};
use std::cell::RefCell;
use std::rc::Rc;

/// Encoded length of one queue node: the value plus the `next` pointer.
const NODE_LEN: usize = 12;

/// The ORAM a queue stores its nodes in, shareable between containers.
pub type SharedOram = Rc<RefCell<PathOram<NODE_LEN>>>;

#[derive(Clone, Copy, Debug, Default)]
struct Node {
    value: u32,
    /// The node enqueued just after this one.
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

/// An oblivious FIFO queue of `u32` values.
///
/// Dequeueing from an empty queue returns the reserved value `0` after an
/// indistinguishable dummy access. Enqueueing above capacity is a caller
/// error and asserts.
#[derive(Debug)]
pub struct OQueue {
    capacity: usize,
    size: usize,
    oram: SharedOram,
    /// Where the next enqueued element will be written.
    head: BlockPointer,
    /// Where the next dequeued element will be read from.
    tail: BlockPointer,
}

impl OQueue {
    /// Returns an empty queue of the given power-of-two capacity, backed
    /// by its own ORAM.
    pub fn new<R: Rng + CryptoRng>(capacity: usize, rng: &mut R) -> Result<Self, OdsError> {
        let oram = Rc::new(RefCell::new(PathOram::new(
            capacity,
            OramOptions {
                id_generator: true,
                ..Default::default()
            },
        )?));
        Self::with_shared_oram(capacity, oram, rng)
    }

    /// Returns an empty queue of the given capacity backed by an existing
    /// (possibly shared) ORAM. The queue's capacity must not exceed the
    /// ORAM's.
    pub fn with_shared_oram<R: Rng + CryptoRng>(
        capacity: usize,
        oram: SharedOram,
        rng: &mut R,
    ) -> Result<Self, OdsError> {
        assert!(capacity <= oram.borrow().capacity());
        let head = {
            let mut oram = oram.borrow_mut();
            BlockPointer::new(oram.next_id(), oram.generate_position(rng))
        };
        Ok(Self {
            capacity,
            size: 0,
            oram,
            head,
            tail: head,
        })
    }

    /// The queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of values currently stored.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Total bucket-level path operations performed so far by the backing
    /// ORAM (shared queues observe each other's accesses).
    pub fn memory_access_count(&self) -> u64 {
        self.oram.borrow().memory_access_count()
    }

    /// Total encrypted bytes traversed so far by the backing ORAM.
    pub fn memory_bytes_moved_total(&self) -> u64 {
        self.oram.borrow().memory_bytes_moved_total()
    }

    /// Enqueues a value at the back of the queue.
    pub fn enqueue<R: Rng + CryptoRng>(
        &mut self,
        value: u32,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        assert!(self.size < self.capacity);
        let mut oram = self.oram.borrow_mut();
        assert!(oram.size() < oram.capacity());

        let new_head = BlockPointer::new(oram.next_id(), oram.generate_position(rng));
        let node = Node {
            value,
            next: new_head,
        };
        let mut encoded = [0u8; NODE_LEN];
        node.encode_into(&mut encoded);
        oram.insert(
            Block::new(self.head.position, self.head.id, encoded),
            enc_key,
            rng,
        )?;
        drop(oram);

        self.head = new_head;
        self.size += 1;
        Ok(())
    }

    /// Dequeues the oldest value, or returns `0` if the queue is empty.
    pub fn dequeue<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<u32, OdsError> {
        if self.size == 0 {
            self.oram.borrow_mut().dummy_access(enc_key, rng)?;
            return Ok(0);
        }

        assert!(self.tail.id != 0 && self.tail.position != 0);
        let mut oram = self.oram.borrow_mut();
        let block = oram.read_and_remove(
            Block::query(self.tail.position, self.tail.id),
            enc_key,
            rng,
        )?;
        oram.add_freed_id(self.tail.id);
        drop(oram);

        let node = Node::decode_from(&block.value);
        self.size -= 1;
        self.tail = node.next;
        Ok(node.value)
    }

    /// Initializes every ORAM bucket to an encrypted all-dummy bucket.
    pub fn fill_with_dummies<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        self.oram.borrow_mut().fill_with_dummies(enc_key, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn setup(seed: u64) -> (EncryptionKey, StdRng) {
        let mut rng = StdRng::seed_from_u64(seed);
        let enc_key = EncryptionKey::generate(&mut rng);
        (enc_key, rng)
    }

    #[test]
    fn test_fifo_order() {
        let (enc_key, mut rng) = setup(0);
        let mut queue = OQueue::new(4, &mut rng).unwrap();
        queue.fill_with_dummies(&enc_key, &mut rng).unwrap();

        queue.enqueue(1, &enc_key, &mut rng).unwrap();
        queue.enqueue(2, &enc_key, &mut rng).unwrap();
        queue.enqueue(3, &enc_key, &mut rng).unwrap();

        assert_eq!(queue.dequeue(&enc_key, &mut rng).unwrap(), 1);
        assert_eq!(queue.dequeue(&enc_key, &mut rng).unwrap(), 2);
        queue.enqueue(4, &enc_key, &mut rng).unwrap();
        assert_eq!(queue.dequeue(&enc_key, &mut rng).unwrap(), 3);
        assert_eq!(queue.dequeue(&enc_key, &mut rng).unwrap(), 4);
        assert_eq!(queue.dequeue(&enc_key, &mut rng).unwrap(), 0);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_two_queues_share_one_oram() {
        let (enc_key, mut rng) = setup(1);
        let oram: SharedOram = Rc::new(RefCell::new(
            PathOram::new(
                8,
                OramOptions {
                    id_generator: true,
                    ..Default::default()
                },
            )
            .unwrap(),
        ));

        let mut first = OQueue::with_shared_oram(4, Rc::clone(&oram), &mut rng).unwrap();
        let mut second = OQueue::with_shared_oram(4, Rc::clone(&oram), &mut rng).unwrap();

        first.enqueue(10, &enc_key, &mut rng).unwrap();
        second.enqueue(20, &enc_key, &mut rng).unwrap();
        first.enqueue(11, &enc_key, &mut rng).unwrap();
        second.enqueue(21, &enc_key, &mut rng).unwrap();

        assert_eq!(first.dequeue(&enc_key, &mut rng).unwrap(), 10);
        assert_eq!(second.dequeue(&enc_key, &mut rng).unwrap(), 20);
        assert_eq!(first.dequeue(&enc_key, &mut rng).unwrap(), 11);
        assert_eq!(second.dequeue(&enc_key, &mut rng).unwrap(), 21);
    }

    #[test]
    fn test_empty_dequeue_costs_the_same_as_a_real_dequeue() {
        let (enc_key, mut rng) = setup(2);
        let mut queue = OQueue::new(4, &mut rng).unwrap();

        queue.enqueue(5, &enc_key, &mut rng).unwrap();
        let before = queue.memory_access_count();
        queue.dequeue(&enc_key, &mut rng).unwrap();
        let real_cost = queue.memory_access_count() - before;

        let before = queue.memory_access_count();
        queue.dequeue(&enc_key, &mut rng).unwrap();
        assert_eq!(queue.memory_access_count() - before, real_cost);
    }

    #[test]
    fn test_wrap_around_reuses_freed_ids() {
        let (enc_key, mut rng) = setup(3);
        let mut queue = OQueue::new(2, &mut rng).unwrap();

        for round in 0..10u32 {
            queue.enqueue(round + 1, &enc_key, &mut rng).unwrap();
            assert_eq!(queue.dequeue(&enc_key, &mut rng).unwrap(), round + 1);
        }
        assert_eq!(queue.size(), 0);
    }
}
