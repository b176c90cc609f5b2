// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An implementation of Path ORAM: an oblivious keyed block store on a
//! binary tree of encrypted buckets.
//!
//! Every access reads one root-to-leaf path into the client-side stash and
//! writes it back re-encrypted under fresh IVs, so the server observes a
//! sequence of path accesses whose shape depends only on the tree depth
//! and the operation kind.

use crate::{
    bytes::{take, FixedLayout},
    crypto::{self, EncryptionKey},
    tree, BlockId, OdsError, Position, ValueSize,
};
use rand::{CryptoRng, Rng};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

/// The parameter "Z" from the Path ORAM literature: blocks per bucket.
/// Here we adopt the conservative setting of 4.
pub const BLOCKS_PER_BUCKET: usize = 4;

/// Encoded length of a block's `(position, id)` header.
pub(crate) const BLOCK_HEADER_LEN: usize = 8;

/// A Path ORAM block: a fixed-length byte value plus its client-space `id`
/// and the leaf tag (`position`) routing it through the tree.
///
/// A block with `id == 0` is a dummy and carries no information.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Block<const L: ValueSize> {
    /// The leaf the block is currently routed to.
    pub position: Position,
    /// The client-space identifier; `0` marks a dummy.
    pub id: BlockId,
    /// The fixed-length payload.
    pub value: [u8; L],
}

impl<const L: ValueSize> Block<L> {
    /// Creates a block from its parts.
    pub fn new(position: Position, id: BlockId, value: [u8; L]) -> Self {
        Self {
            position,
            id,
            value,
        }
    }

    /// Creates a query block: `(position, id)` with a zeroed value.
    pub fn query(position: Position, id: BlockId) -> Self {
        Self {
            position,
            id,
            value: [0; L],
        }
    }

    /// Creates a dummy block.
    pub fn dummy() -> Self {
        Self {
            position: 0,
            id: 0,
            value: [0; L],
        }
    }

    /// Whether this block is a dummy.
    pub fn is_dummy(&self) -> bool {
        self.id == 0
    }
}

impl<const L: ValueSize> std::fmt::Debug for Block<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_dummy() {
            write!(f, "Block::Dummy")
        } else {
            f.debug_struct("Block")
                .field("position", &self.position)
                .field("id", &self.id)
                .field("value", &self.value)
                .finish()
        }
    }
}

impl<const L: ValueSize> FixedLayout for Block<L> {
    const BYTE_LEN: usize = BLOCK_HEADER_LEN + L;

    fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.position.to_le_bytes());
        out[4..8].copy_from_slice(&self.id.to_le_bytes());
        out[8..].copy_from_slice(&self.value);
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut buf = buf;
        let position = u32::decode_from(take(&mut buf, 4));
        let id = u32::decode_from(take(&mut buf, 4));
        let mut value = [0u8; L];
        value.copy_from_slice(buf);
        Self {
            position,
            id,
            value,
        }
    }
}

/// A reference to a block living in an ORAM: its id plus the leaf tag it
/// was last written under.
///
/// The position half goes stale whenever the target block is accessed;
/// holders must adopt the fresh tag the access hands back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockPointer {
    /// The target block's id; `0` marks a null pointer.
    pub id: BlockId,
    /// The leaf the target block was last tagged with.
    pub position: Position,
}

impl BlockPointer {
    /// Creates a pointer from its parts.
    pub fn new(id: BlockId, position: Position) -> Self {
        Self { id, position }
    }

    /// The null pointer.
    pub fn null() -> Self {
        Self { id: 0, position: 0 }
    }

    /// Whether this pointer refers to nothing.
    pub fn is_null(&self) -> bool {
        self.id == 0
    }
}

impl FixedLayout for BlockPointer {
    const BYTE_LEN: usize = 8;

    fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..8].copy_from_slice(&self.position.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut buf = buf;
        Self {
            id: u32::decode_from(take(&mut buf, 4)),
            position: u32::decode_from(take(&mut buf, 4)),
        }
    }
}

/// A Path ORAM bucket: a fixed array of [`BLOCKS_PER_BUCKET`] blocks,
/// padded with dummies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bucket<const L: ValueSize> {
    pub(crate) blocks: [Block<L>; BLOCKS_PER_BUCKET],
}

impl<const L: ValueSize> Default for Bucket<L> {
    fn default() -> Self {
        Self {
            blocks: [Block::dummy(); BLOCKS_PER_BUCKET],
        }
    }
}

impl<const L: ValueSize> FixedLayout for Bucket<L> {
    const BYTE_LEN: usize = BLOCKS_PER_BUCKET * Block::<L>::BYTE_LEN;

    fn encode_into(&self, out: &mut [u8]) {
        for (block, chunk) in self.blocks.iter().zip(out.chunks_mut(Block::<L>::BYTE_LEN)) {
            block.encode_into(chunk);
        }
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut bucket = Self::default();
        for (block, chunk) in bucket
            .blocks
            .iter_mut()
            .zip(buf.chunks(Block::<L>::BYTE_LEN))
        {
            *block = Block::decode_from(chunk);
        }
        bucket
    }
}

/// A bucket as the server stores it: an AES-CBC ciphertext with its IV
/// appended, plus a SHA-256 digest of the ciphertext.
///
/// Generic over the plaintext bucket layout so the heap's augmented
/// buckets seal the same way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct EncryptedBucket {
    pub(crate) ciphertext: Vec<u8>,
    pub(crate) digest: [u8; crypto::DIGEST_SIZE],
}

impl EncryptedBucket {
    pub(crate) fn seal<T: FixedLayout, R: Rng + CryptoRng>(
        bucket: &T,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Self, OdsError> {
        let ciphertext = crypto::encrypt(&bucket.encode(), enc_key, rng)?;
        let digest = crypto::hash(&ciphertext);
        Ok(Self { ciphertext, digest })
    }

    pub(crate) fn open<T: FixedLayout>(&self, enc_key: &EncryptionKey) -> Result<T, OdsError> {
        let expected = crypto::hash(&self.ciphertext);
        if !bool::from(self.digest.ct_eq(&expected)) {
            return Err(OdsError::Integrity);
        }
        let plaintext = crypto::decrypt(&self.ciphertext, enc_key)?;
        if plaintext.len() != T::BYTE_LEN {
            return Err(OdsError::Crypto);
        }
        Ok(T::decode_from(&plaintext))
    }
}

/// Construction options for [`PathOram`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OramOptions {
    /// Track `id -> position` internally so callers need not remember
    /// where their blocks live.
    pub position_map: bool,
    /// Hand out unique block ids, recycling freed ones.
    pub id_generator: bool,
}

/// An oblivious keyed block store over a binary tree of encrypted buckets.
///
/// Positions are 1-based leaf tags in `[1, N]`; the capacity `N` must be a
/// power of two. The tree stores `max(1, N - 1)` buckets (the leaf level
/// is collapsed into its parents).
#[derive(Debug)]
pub struct PathOram<const L: ValueSize> {
    capacity: usize,
    size: usize,
    depth: u32,
    buckets: Vec<Option<EncryptedBucket>>,
    stash: Vec<Block<L>>,
    options: OramOptions,
    position_map: BTreeMap<BlockId, Position>,
    next_fresh_id: BlockId,
    freed_ids: Vec<BlockId>,
    memory_access_count: u64,
    memory_bytes_moved_total: u64,
}

impl<const L: ValueSize> PathOram<L> {
    /// Byte length of one server-side encrypted bucket.
    pub(crate) const ENCRYPTED_BUCKET_LEN: usize =
        crypto::ciphertext_len(Bucket::<L>::BYTE_LEN) + crypto::DIGEST_SIZE;

    /// Returns an empty ORAM of the given power-of-two capacity.
    pub fn new(capacity: usize, options: OramOptions) -> Result<Self, OdsError> {
        if !capacity.is_power_of_two() {
            return Err(OdsError::InvalidConfiguration);
        }
        log::info!("PathOram::new(capacity = {capacity}, value_len = {L})");

        Ok(Self {
            capacity,
            size: 0,
            depth: capacity.ilog2().saturating_sub(1),
            buckets: vec![None; capacity.saturating_sub(1).max(1)],
            stash: Vec::new(),
            options,
            position_map: BTreeMap::new(),
            next_fresh_id: 1,
            freed_ids: Vec::new(),
            memory_access_count: 0,
            memory_bytes_moved_total: 0,
        })
    }

    /// Builds an ORAM already holding `blocks`.
    ///
    /// In position-map mode each block is re-tagged and tracked; otherwise
    /// the provided positions are used as-is.
    pub fn with_items<R: Rng + CryptoRng>(
        capacity: usize,
        blocks: Vec<Block<L>>,
        options: OramOptions,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Self, OdsError> {
        let mut oram = Self::new(capacity, options)?;
        oram.size = blocks.len();

        let mut should_evict = vec![false; capacity];
        for mut block in blocks {
            if oram.options.position_map {
                block.position = oram.generate_position(rng);
                oram.position_map.insert(block.id, block.position);
            }
            should_evict[block.position as usize - 1] = true;
            oram.stash.push(block);
        }

        for pos in 1..=capacity as Position {
            if should_evict[pos as usize - 1] {
                // Read the path first so nothing already evicted is lost.
                oram.read_path(&Block::query(pos, 0), enc_key)?;
                oram.evict(pos, enc_key, rng)?;
            }
        }
        Ok(oram)
    }

    /// The ORAM capacity in blocks.
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

    /// Draws a uniformly random position in `[1, N]`.
    pub fn generate_position<R: Rng + CryptoRng>(&self, rng: &mut R) -> Position {
        rng.gen_range(1..=self.capacity as Position)
    }

    /// Removes and returns the block matching the query's `(position, id)`,
    /// or a dummy if it is not present.
    ///
    /// In position-map mode the query's position is ignored and looked up
    /// internally; a miss performs an indistinguishable dummy access.
    pub fn read_and_remove<R: Rng + CryptoRng>(
        &mut self,
        query: Block<L>,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Block<L>, OdsError> {
        let mut query = query;
        if self.options.position_map {
            match self.position_map.remove(&query.id) {
                Some(pos) => query.position = pos,
                None => {
                    self.dummy_access(enc_key, rng)?;
                    return Ok(Block::dummy());
                }
            }
        }

        let mut res = self.read_path(&query, enc_key)?;
        // The requested block may have been resident in the stash instead
        // of on the path; remove it from there too.
        let mut i = 0;
        while i < self.stash.len() {
            if self.stash[i].position == query.position && self.stash[i].id == query.id {
                res = self.stash.swap_remove(i);
            } else {
                i += 1;
            }
        }
        self.evict(query.position, enc_key, rng)?;

        if !res.is_dummy() {
            self.size -= 1;
        }
        Ok(res)
    }

    /// Returns the block matching the query's `(position, id)` while
    /// retaining it, re-tagged with a fresh random position.
    ///
    /// The returned block carries the new position; callers tracking
    /// positions themselves must adopt it.
    pub fn read<R: Rng + CryptoRng>(
        &mut self,
        query: Block<L>,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Block<L>, OdsError> {
        let mut query = query;
        if self.options.position_map {
            match self.position_map.get(&query.id) {
                Some(&pos) => query.position = pos,
                None => {
                    self.dummy_access(enc_key, rng)?;
                    return Ok(Block::dummy());
                }
            }
        }

        let path_hit = self.read_path(&query, enc_key)?;
        if !path_hit.is_dummy() {
            self.stash.push(path_hit);
        }

        // Re-tag before evicting. Eviction still walks the old leaf's
        // path; the freshly tagged block can only settle on levels the old
        // and new paths share.
        let new_position = self.generate_position(rng);
        let mut res = Block::dummy();
        for block in &mut self.stash {
            if block.position == query.position && block.id == query.id {
                block.position = new_position;
                res = *block;
            }
        }
        if !res.is_dummy() && self.options.position_map {
            self.position_map.insert(query.id, new_position);
        }

        self.evict(query.position, enc_key, rng)?;
        Ok(res)
    }

    /// Inserts a block that must not already be present.
    ///
    /// In position-map mode the block is re-tagged with a fresh position
    /// and tracked internally; otherwise `block.position` is used.
    pub fn insert<R: Rng + CryptoRng>(
        &mut self,
        block: Block<L>,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        let mut block = block;
        if self.options.position_map {
            block.position = self.generate_position(rng);
            self.position_map.insert(block.id, block.position);
        }

        // The evicted path shouldn't deterministically be the block's own.
        let write_pos = self.generate_position(rng);
        self.read_path(&Block::query(write_pos, 0), enc_key)?;
        self.stash.push(block);
        self.evict(write_pos, enc_key, rng)?;
        self.size += 1;
        Ok(())
    }

    /// Performs an access indistinguishable from a real one.
    pub fn dummy_access<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        let query = Block::query(self.generate_position(rng), 0);
        self.read_path(&query, enc_key)?;
        self.evict(query.position, enc_key, rng)?;
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
        let empty = Bucket::<L>::default();
        for slot in &mut self.buckets {
            *slot = Some(EncryptedBucket::seal(&empty, enc_key, rng)?);
        }
        Ok(())
    }

    /// Decrypts the whole tree and returns every real block, stash
    /// included. Debug and test helper.
    pub fn decrypt_all(&mut self, enc_key: &EncryptionKey) -> Result<Vec<Block<L>>, OdsError> {
        self.memory_access_count += 1;
        self.memory_bytes_moved_total +=
            (self.buckets.len() * Self::ENCRYPTED_BUCKET_LEN) as u64;

        let mut res = self.stash.clone();
        for slot in &self.buckets {
            if let Some(encrypted) = slot {
                let bucket: Bucket<L> = encrypted.open(enc_key)?;
                for block in bucket.blocks {
                    if !block.is_dummy() {
                        res.push(block);
                    }
                }
            }
        }
        Ok(res)
    }

    /// Hands out a fresh block id, preferring recycled ones.
    /// Only valid in id-generator mode.
    pub fn next_id(&mut self) -> BlockId {
        assert!(self.options.id_generator);
        if let Some(id) = self.freed_ids.pop() {
            return id;
        }
        let id = self.next_fresh_id;
        self.next_fresh_id += 1;
        id
    }

    /// Returns a no-longer-used id to the generator.
    /// Only valid in id-generator mode.
    pub fn add_freed_id(&mut self, id: BlockId) {
        assert!(self.options.id_generator);
        if id == self.next_fresh_id - 1 {
            self.next_fresh_id -= 1;
        } else {
            self.freed_ids.push(id);
        }
    }

    fn open_bucket(&self, index: usize, enc_key: &EncryptionKey) -> Result<Bucket<L>, OdsError> {
        match &self.buckets[index] {
            Some(encrypted) => encrypted.open(enc_key),
            // Never written: decodes to an all-dummy bucket.
            None => Ok(Bucket::default()),
        }
    }

    /// Walks the path for the query's position, moving every real block
    /// into the stash except a block matching the query's id, which is
    /// returned.
    fn read_path(&mut self, query: &Block<L>, enc_key: &EncryptionKey) -> Result<Block<L>, OdsError> {
        let path = tree::path_indices(self.capacity, self.depth, query.position, true);
        self.memory_access_count += 1;
        self.memory_bytes_moved_total += (path.len() * Self::ENCRYPTED_BUCKET_LEN) as u64;

        let mut res = Block::dummy();
        for index in path {
            log::debug!("Path read -- bucket {index}");
            let bucket = self.open_bucket(index, enc_key)?;
            for block in bucket.blocks {
                if block.id == query.id {
                    res = block;
                } else if !block.is_dummy() {
                    self.stash.push(block);
                }
            }
        }
        Ok(res)
    }

    /// Greedily packs stash blocks onto the path to `pos`, leaf to root,
    /// re-encrypting every bucket on it under a fresh IV.
    ///
    /// Takes the position as input: the evicted path may differ from the
    /// path just read.
    fn evict<R: Rng + CryptoRng>(
        &mut self,
        pos: Position,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        let path = tree::path_indices(self.capacity, self.depth, pos, true);
        self.memory_access_count += 1;
        self.memory_bytes_moved_total += (path.len() * Self::ENCRYPTED_BUCKET_LEN) as u64;

        let mut taken = vec![false; self.stash.len()];
        for (path_step, &index) in path.iter().enumerate() {
            let level = self.depth - path_step as u32;
            let mut bucket = Bucket::default();
            let mut slot = 0;

            for (i, block) in self.stash.iter().enumerate() {
                if slot >= BLOCKS_PER_BUCKET {
                    break;
                }
                if taken[i] {
                    continue;
                }
                if tree::node_at_level(self.capacity, self.depth, block.position, level, true)
                    == index
                {
                    bucket.blocks[slot] = *block;
                    slot += 1;
                    taken[i] = true;
                }
            }

            log::debug!("Evict -- bucket {index}");
            self.buckets[index] = Some(EncryptedBucket::seal(&bucket, enc_key, rng)?);
        }

        let mut i = 0;
        self.stash.retain(|_| {
            let keep = !taken[i];
            i += 1;
            keep
        });
        Ok(())
    }
}
