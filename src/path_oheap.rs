// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An implementation of an oblivious min-heap over a Path ORAM-style
//! bucket tree.
//!
//! Unlike the block store, the heap keeps the leaf level as buckets
//! (`2N - 1` buckets for capacity `N`, `Z = 3`), and each bucket carries a
//! `min_block` augmentation: the minimum-keyed real block in its subtree.
//! `find_min` therefore costs a single root read; `extract_min` and
//! `insert` touch two root-to-leaf paths so that every operation reaches
//! the root from both of its subtrees and the augmentation can be repaired
//! with sibling reads only.

use crate::{
    bytes::{take, FixedLayout},
    crypto::{self, EncryptionKey},
    path_oram::EncryptedBucket,
    tree, OdsError, Position,
};
use rand::{CryptoRng, Rng};

/// Blocks per heap bucket ("Z"). The heap uses the tighter setting of 3.
pub const BLOCKS_PER_BUCKET: usize = 3;

/// A heap element: a priority `key`, a payload `value`, and the leaf tag
/// routing it through the tree. A block with `position == 0` is a dummy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    /// The leaf the block is currently routed to; `0` marks a dummy.
    pub position: Position,
    /// The priority; `find_min`/`extract_min` order by this.
    pub key: u32,
    /// The payload.
    pub value: u32,
}

impl Block {
    /// Creates a block from its parts.
    pub fn new(position: Position, key: u32, value: u32) -> Self {
        Self {
            position,
            key,
            value,
        }
    }

    /// Creates a dummy block.
    pub fn dummy() -> Self {
        Self {
            position: 0,
            key: 0,
            value: 0,
        }
    }

    /// Whether this block is a dummy.
    pub fn is_dummy(&self) -> bool {
        self.position == 0
    }
}

impl FixedLayout for Block {
    const BYTE_LEN: usize = 12;

    fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.position.to_le_bytes());
        out[4..8].copy_from_slice(&self.key.to_le_bytes());
        out[8..12].copy_from_slice(&self.value.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut buf = buf;
        Self {
            position: u32::decode_from(take(&mut buf, 4)),
            key: u32::decode_from(take(&mut buf, 4)),
            value: u32::decode_from(take(&mut buf, 4)),
        }
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::dummy()
    }
}

/// A heap bucket: [`BLOCKS_PER_BUCKET`] blocks plus the subtree-minimum
/// augmentation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Bucket {
    pub(crate) blocks: [Block; BLOCKS_PER_BUCKET],
    /// The minimum-keyed real block in the subtree rooted here.
    pub(crate) min_block: Block,
}

impl Bucket {
    /// Builds a bucket whose `min_block` starts from the already-combined
    /// minimum of its children and is then folded with its own blocks.
    fn with_children_min(blocks: [Block; BLOCKS_PER_BUCKET], children_min: Block) -> Self {
        let mut bucket = Self {
            blocks,
            min_block: children_min,
        };
        bucket.update_min();
        bucket
    }

    fn update_min(&mut self) {
        for block in &self.blocks {
            if !block.is_dummy()
                && (self.min_block.is_dummy() || block.key < self.min_block.key)
            {
                self.min_block = *block;
            }
        }
    }
}

impl FixedLayout for Bucket {
    const BYTE_LEN: usize = (BLOCKS_PER_BUCKET + 1) * Block::BYTE_LEN;

    fn encode_into(&self, out: &mut [u8]) {
        for (block, chunk) in self.blocks.iter().zip(out.chunks_mut(Block::BYTE_LEN)) {
            block.encode_into(chunk);
        }
        self.min_block
            .encode_into(&mut out[BLOCKS_PER_BUCKET * Block::BYTE_LEN..]);
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut bucket = Self::default();
        for (block, chunk) in bucket.blocks.iter_mut().zip(buf.chunks(Block::BYTE_LEN)) {
            *block = Block::decode_from(chunk);
        }
        bucket.min_block = Block::decode_from(&buf[BLOCKS_PER_BUCKET * Block::BYTE_LEN..]);
        bucket
    }
}

/// An oblivious min-heap on a tree of encrypted, min-augmented buckets.
///
/// Positions are 1-based leaf tags in `[1, N]`; the capacity `N` must be a
/// power of two. `N = 1` degenerates to a single bucket plus the stash.
#[derive(Debug)]
pub struct OHeap {
    capacity: usize,
    size: usize,
    depth: u32,
    buckets: Vec<Option<EncryptedBucket>>,
    stash: Vec<Block>,
    memory_access_count: u64,
    memory_bytes_moved_total: u64,
}

impl OHeap {
    pub(crate) const ENCRYPTED_BUCKET_LEN: usize =
        crypto::ciphertext_len(Bucket::BYTE_LEN) + crypto::DIGEST_SIZE;

    /// Returns an empty heap of the given power-of-two capacity.
    pub fn new(capacity: usize) -> Result<Self, OdsError> {
        if !capacity.is_power_of_two() {
            return Err(OdsError::InvalidConfiguration);
        }
        log::info!("OHeap::new(capacity = {capacity})");

        Ok(Self {
            capacity,
            size: 0,
            depth: capacity.ilog2(),
            buckets: vec![None; 2 * capacity - 1],
            stash: Vec::new(),
            memory_access_count: 0,
            memory_bytes_moved_total: 0,
        })
    }

    /// The heap capacity in blocks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of real blocks currently stored.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Total bucket-level path and sweep operations performed so far.
    pub fn memory_access_count(&self) -> u64 {
        self.memory_access_count
    }

    /// Total encrypted bytes traversed so far.
    pub fn memory_bytes_moved_total(&self) -> u64 {
        self.memory_bytes_moved_total
    }

    /// Returns the minimum-keyed block without removing it, or a dummy if
    /// the heap is empty.
    ///
    /// The read itself touches only the root; with `pad` set (the default
    /// choice for external callers) a dummy access follows so the
    /// operation's pattern mirrors a full insert or extract.
    pub fn find_min<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
        pad: bool,
    ) -> Result<Block, OdsError> {
        let res = self.peek_min(enc_key)?;
        if pad {
            self.dummy_access(enc_key, rng, false)?;
        }
        Ok(res)
    }

    /// Removes and returns the minimum-keyed block, or a dummy if the heap
    /// is empty (still performing a full dummy access).
    pub fn extract_min<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Block, OdsError> {
        let min_block = self.peek_min(enc_key)?;
        if min_block.is_dummy() {
            self.dummy_access(enc_key, rng, false)?;
            return Ok(min_block);
        }

        // The second path must reach the root from the other subtree.
        let second = self.second_position(min_block.position, rng);

        let found = self.read_path(&min_block, true, enc_key)?;
        if found.is_dummy() {
            // The minimum lived in the stash rather than on its path.
            if let Some(i) = self.stash.iter().position(|b| *b == min_block) {
                self.stash.remove(i);
            }
        }
        self.update_min_and_evict(min_block.position, enc_key, rng)?;

        self.read_path(&Block::new(second, 0, 0), false, enc_key)?;
        self.update_min_and_evict(second, enc_key, rng)?;

        self.size -= 1;
        Ok(min_block)
    }

    /// Inserts a block; its position is re-tagged with a fresh random leaf.
    pub fn insert<R: Rng + CryptoRng>(
        &mut self,
        block: Block,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        // A leading root read keeps all operations indistinguishable.
        self.peek_min(enc_key)?;

        let mut block = block;
        block.position = self.generate_position(rng);
        let (first, second) = self.path_pair(rng);
        self.stash.push(block);

        self.read_path(&Block::new(first, 0, 0), false, enc_key)?;
        self.update_min_and_evict(first, enc_key, rng)?;
        self.read_path(&Block::new(second, 0, 0), false, enc_key)?;
        self.update_min_and_evict(second, enc_key, rng)?;

        self.size += 1;
        Ok(())
    }

    /// Performs an access with the same pattern as an insert. Skips the
    /// leading root read when the caller has already performed one.
    pub fn dummy_access<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
        with_find_min: bool,
    ) -> Result<(), OdsError> {
        if with_find_min {
            self.peek_min(enc_key)?;
        }
        let (first, second) = self.path_pair(rng);
        self.read_path(&Block::new(first, 0, 0), false, enc_key)?;
        self.update_min_and_evict(first, enc_key, rng)?;
        self.read_path(&Block::new(second, 0, 0), false, enc_key)?;
        self.update_min_and_evict(second, enc_key, rng)?;
        Ok(())
    }

    /// Initializes every bucket to an encrypted all-dummy bucket.
    /// Should only be called right after allocation.
    pub fn fill_with_dummies<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        self.memory_access_count += 1;
        self.memory_bytes_moved_total +=
            (self.buckets.len() * Self::ENCRYPTED_BUCKET_LEN) as u64;
        let empty = Bucket::default();
        for slot in &mut self.buckets {
            *slot = Some(EncryptedBucket::seal(&empty, enc_key, rng)?);
        }
        Ok(())
    }

    /// Draws a uniformly random position in `[1, N]`.
    fn generate_position<R: Rng + CryptoRng>(&self, rng: &mut R) -> Position {
        rng.gen_range(1..=self.capacity as Position)
    }

    /// Draws a left+right pair of eviction leaves straddling the root's
    /// children: one from `[1, N/2]`, one from `[N/2 + 1, N]`.
    fn path_pair<R: Rng + CryptoRng>(&self, rng: &mut R) -> (Position, Position) {
        let half = (self.capacity >> 1) as Position;
        let first = 1 + ((self.generate_position(rng) - 1) >> 1);
        let second = 1 + (((self.generate_position(rng) - 1) >> 1) | half);
        (first, second)
    }

    /// Draws a leaf in the half of the tree not containing `pos`, so both
    /// paths reach the root from different subtrees.
    fn second_position<R: Rng + CryptoRng>(&self, pos: Position, rng: &mut R) -> Position {
        let half = (self.capacity >> 1) as Position;
        let base = (half & (pos - 1)) ^ half;
        (base | ((self.generate_position(rng) - 1) >> 1)) + 1
    }

    fn open_bucket(&self, index: usize, enc_key: &EncryptionKey) -> Result<Bucket, OdsError> {
        match &self.buckets[index] {
            Some(encrypted) => encrypted.open(enc_key),
            None => Ok(Bucket::default()),
        }
    }

    /// One root-bucket read returning the current minimum, folded with any
    /// stash-resident blocks.
    fn peek_min(&mut self, enc_key: &EncryptionKey) -> Result<Block, OdsError> {
        self.memory_access_count += 1;
        self.memory_bytes_moved_total += Self::ENCRYPTED_BUCKET_LEN as u64;
        // No re-encryption: the root is not modified here.
        let mut res = self.open_bucket(0, enc_key)?.min_block;
        for block in &self.stash {
            if res.is_dummy() || block.key < res.key {
                res = *block;
            }
        }
        Ok(res)
    }

    /// Walks the path for the query's position, moving every real block
    /// into the stash. With `return_if_found`, the first block equal to
    /// `query` is removed and returned instead. Duplicates are allowed.
    fn read_path(
        &mut self,
        query: &Block,
        return_if_found: bool,
        enc_key: &EncryptionKey,
    ) -> Result<Block, OdsError> {
        let path = tree::path_indices(self.capacity, self.depth, query.position, false);
        self.memory_access_count += 1;
        self.memory_bytes_moved_total += (path.len() * Self::ENCRYPTED_BUCKET_LEN) as u64;

        let mut res = Block::dummy();
        let mut found = false;
        for index in path {
            let bucket = self.open_bucket(index, enc_key)?;
            for block in bucket.blocks {
                if !found && return_if_found && block == *query {
                    res = block;
                    found = true;
                } else if !block.is_dummy() {
                    self.stash.push(block);
                }
            }
        }
        Ok(res)
    }

    /// Evicts stash blocks onto the path to `pos` (leaf to root) and
    /// repairs the min augmentation along it.
    ///
    /// Each rewritten bucket's `min_block` combines its own blocks with a
    /// running carry of the on-path child's min and the off-path sibling's
    /// stored min, which together cover the whole subtree.
    fn update_min_and_evict<R: Rng + CryptoRng>(
        &mut self,
        pos: Position,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        let path = tree::path_indices(self.capacity, self.depth, pos, false);
        self.memory_access_count += 1;
        self.memory_bytes_moved_total += (path.len() * Self::ENCRYPTED_BUCKET_LEN) as u64;

        let mut taken = vec![false; self.stash.len()];
        let mut children_min = Block::dummy();
        for (path_step, &index) in path.iter().enumerate() {
            let level = self.depth - path_step as u32;
            let mut blocks = [Block::dummy(); BLOCKS_PER_BUCKET];
            let mut slot = 0;

            for (i, block) in self.stash.iter().enumerate() {
                if slot >= BLOCKS_PER_BUCKET {
                    break;
                }
                if taken[i] {
                    continue;
                }
                if tree::node_at_level(self.capacity, self.depth, block.position, level, false)
                    == index
                {
                    blocks[slot] = *block;
                    slot += 1;
                    taken[i] = true;
                }
            }

            let bucket = Bucket::with_children_min(blocks, children_min);
            self.buckets[index] = Some(EncryptedBucket::seal(&bucket, enc_key, rng)?);

            let current_min = bucket.min_block;
            let sibling_min = self.sibling_min(index, enc_key)?;
            children_min = if !sibling_min.is_dummy()
                && (current_min.is_dummy() || sibling_min.key < current_min.key)
            {
                sibling_min
            } else {
                current_min
            };
        }

        let mut i = 0;
        self.stash.retain(|_| {
            let keep = !taken[i];
            i += 1;
            keep
        });
        Ok(())
    }

    /// The stored min of the sibling bucket, read but not modified.
    fn sibling_min(&mut self, index: usize, enc_key: &EncryptionKey) -> Result<Block, OdsError> {
        if index == 0 {
            return Ok(Block::dummy());
        }

        // Siblings come along with the path fetch; count bytes only.
        self.memory_bytes_moved_total += Self::ENCRYPTED_BUCKET_LEN as u64;

        let sibling = if index % 2 == 1 { index + 1 } else { index - 1 };
        Ok(self.open_bucket(sibling, enc_key)?.min_block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;
    use rand::{rngs::StdRng, SeedableRng};

    fn setup(seed: u64) -> (EncryptionKey, StdRng) {
        let mut rng = StdRng::seed_from_u64(seed);
        let enc_key = EncryptionKey::generate(&mut rng);
        (enc_key, rng)
    }

    #[test]
    fn test_insert_find_extract_sequence() {
        let (enc_key, mut rng) = setup(0);
        let mut heap = OHeap::new(4).unwrap();
        heap.fill_with_dummies(&enc_key, &mut rng).unwrap();

        heap.insert(Block::new(0, 5, 50), &enc_key, &mut rng).unwrap();
        heap.insert(Block::new(0, 2, 20), &enc_key, &mut rng).unwrap();
        heap.insert(Block::new(0, 9, 90), &enc_key, &mut rng).unwrap();
        assert_eq!(heap.size(), 3);

        let min = heap.find_min(&enc_key, &mut rng, true).unwrap();
        assert_eq!((min.key, min.value), (2, 20));

        let extracted = heap.extract_min(&enc_key, &mut rng).unwrap();
        assert_eq!((extracted.key, extracted.value), (2, 20));
        assert_eq!(heap.size(), 2);

        let min = heap.find_min(&enc_key, &mut rng, true).unwrap();
        assert_eq!((min.key, min.value), (5, 50));
        assert_eq!(heap.size(), 2);
    }

    #[test]
    fn test_extract_on_empty_heap() {
        let (enc_key, mut rng) = setup(1);
        let mut heap = OHeap::new(4).unwrap();

        let before = heap.memory_access_count();
        let extracted = heap.extract_min(&enc_key, &mut rng).unwrap();
        assert!(extracted.is_dummy());
        assert_eq!(heap.size(), 0);
        // Full dummy access: root read plus two path pairs.
        assert_eq!(heap.memory_access_count() - before, 5);
    }

    #[test]
    fn test_extracts_come_out_sorted() {
        let (enc_key, mut rng) = setup(2);
        let mut heap = OHeap::new(16).unwrap();
        heap.fill_with_dummies(&enc_key, &mut rng).unwrap();

        let keys = [12u32, 3, 7, 15, 1, 9, 4, 11, 2, 8];
        for &key in &keys {
            heap.insert(Block::new(0, key, key * 10), &enc_key, &mut rng)
                .unwrap();
        }

        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        for &expected in &sorted {
            let block = heap.extract_min(&enc_key, &mut rng).unwrap();
            assert_eq!(block.key, expected);
            assert_eq!(block.value, expected * 10);
        }
        assert_eq!(heap.size(), 0);
        assert!(heap
            .extract_min(&enc_key, &mut rng)
            .unwrap()
            .is_dummy());
    }

    #[test]
    fn test_duplicate_keys() {
        let (enc_key, mut rng) = setup(3);
        let mut heap = OHeap::new(8).unwrap();

        heap.insert(Block::new(0, 4, 1), &enc_key, &mut rng).unwrap();
        heap.insert(Block::new(0, 4, 2), &enc_key, &mut rng).unwrap();

        let first = heap.extract_min(&enc_key, &mut rng).unwrap();
        let second = heap.extract_min(&enc_key, &mut rng).unwrap();
        assert_eq!(first.key, 4);
        assert_eq!(second.key, 4);
        assert_ne!(first.value, second.value);
        assert_eq!(heap.size(), 0);
    }

    #[test]
    fn test_access_count_is_oblivious() {
        // Insert, extract, padded find-min and a full dummy access all
        // perform the same number of memory accesses.
        let (enc_key, mut rng) = setup(4);
        let mut heap = OHeap::new(8).unwrap();

        let count_of = |heap: &mut OHeap, rng: &mut StdRng, op: &dyn Fn(&mut OHeap, &mut StdRng)| {
            let before = heap.memory_access_count();
            op(heap, rng);
            heap.memory_access_count() - before
        };

        let insert_cost = count_of(&mut heap, &mut rng, &|h, r| {
            h.insert(Block::new(0, 1, 1), &enc_key, r).unwrap();
        });
        let find_cost = count_of(&mut heap, &mut rng, &|h, r| {
            h.find_min(&enc_key, r, true).unwrap();
        });
        let extract_cost = count_of(&mut heap, &mut rng, &|h, r| {
            h.extract_min(&enc_key, r).unwrap();
        });
        let dummy_cost = count_of(&mut heap, &mut rng, &|h, r| {
            h.dummy_access(&enc_key, r, true).unwrap();
        });

        assert_eq!(insert_cost, find_cost);
        assert_eq!(insert_cost, extract_cost);
        assert_eq!(insert_cost, dummy_cost);
    }

    /// The stored `min_block` of every initialized bucket equals the
    /// minimum-keyed block physically present in its subtree.
    fn check_min_augmentation(heap: &OHeap, enc_key: &EncryptionKey) {
        fn subtree_min(
            buckets: &[Option<Bucket>],
            index: usize,
        ) -> Option<Block> {
            if index >= buckets.len() {
                return None;
            }
            let mut min: Option<Block> = None;
            let mut consider = |candidate: Block| {
                if !candidate.is_dummy()
                    && min.map_or(true, |m| candidate.key < m.key)
                {
                    min = Some(candidate);
                }
            };
            if let Some(bucket) = &buckets[index] {
                for block in bucket.blocks {
                    consider(block);
                }
            }
            if let Some(left) = subtree_min(buckets, 2 * index + 1) {
                consider(left);
            }
            if let Some(right) = subtree_min(buckets, 2 * index + 2) {
                consider(right);
            }
            min
        }

        let decrypted: Vec<Option<Bucket>> = heap
            .buckets
            .iter()
            .map(|slot| slot.as_ref().map(|eb| eb.open(enc_key).unwrap()))
            .collect();

        for (index, bucket) in decrypted.iter().enumerate() {
            if let Some(bucket) = bucket {
                match subtree_min(&decrypted, index) {
                    Some(min) => assert_eq!(bucket.min_block.key, min.key, "bucket {index}"),
                    None => assert!(bucket.min_block.is_dummy(), "bucket {index}"),
                }
            }
        }
    }

    #[test]
    fn test_min_augmentation_invariant() {
        let (enc_key, mut rng) = setup(5);
        let mut heap = OHeap::new(8).unwrap();
        heap.fill_with_dummies(&enc_key, &mut rng).unwrap();

        for key in [6u32, 1, 8, 3, 7, 2] {
            heap.insert(Block::new(0, key, key), &enc_key, &mut rng)
                .unwrap();
            check_min_augmentation(&heap, &enc_key);
        }
        for _ in 0..4 {
            heap.extract_min(&enc_key, &mut rng).unwrap();
            check_min_augmentation(&heap, &enc_key);
        }
    }

    #[test]
    fn test_single_element_capacity() {
        let (enc_key, mut rng) = setup(6);
        let mut heap = OHeap::new(1).unwrap();

        heap.insert(Block::new(0, 3, 30), &enc_key, &mut rng).unwrap();
        let min = heap.find_min(&enc_key, &mut rng, true).unwrap();
        assert_eq!((min.key, min.value), (3, 30));
        let extracted = heap.extract_min(&enc_key, &mut rng).unwrap();
        assert_eq!((extracted.key, extracted.value), (3, 30));
        assert_eq!(heap.size(), 0);
    }
}
