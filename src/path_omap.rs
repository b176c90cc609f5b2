// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An oblivious map: an AVL tree whose nodes live in a Path ORAM.
//!
//! Every operation runs in three phases: a recursive tree walk that pulls
//! the nodes it touches into a write-back cache (each pull is one ORAM
//! `read_and_remove`), an AVL rebalance that rewrites cached nodes only,
//! and a `finalize` that re-tags every cached node with a fresh position,
//! writes all of them back, and pads both the read and the write side up
//! to a fixed budget. The ORAM access count per operation is therefore
//! `2 * pad_val` regardless of the key, the tree shape, or whether the
//! key exists, so clients leak nothing beyond the invocation rate.

use crate::{
    bytes::{take, FixedLayout},
    crypto::EncryptionKey,
    path_oram::{Block, BlockPointer, OramOptions, PathOram},
    BlockId, OdsError, Position,
};
use rand::{CryptoRng, Rng};
use std::collections::BTreeMap;

/// The map's key type. `0` is a valid key only for internal sentinels;
/// clients should use keys `>= 1`.
pub type MapKey = u32;

/// The map's value type. `0` is the reserved "absent" value: reads of
/// missing keys return it, and storing it is indistinguishable from
/// absence.
pub type MapVal = u32;

/// Encoded length of one AVL node.
const NODE_LEN: usize = 28;

/// An AVL node as stored inside an ORAM block value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Node {
    key: MapKey,
    val: MapVal,
    left: BlockPointer,
    right: BlockPointer,
    height: u32,
}

impl Node {
    fn leaf(key: MapKey, val: MapVal) -> Self {
        Self {
            key,
            val,
            left: BlockPointer::null(),
            right: BlockPointer::null(),
            height: 1,
        }
    }
}

impl FixedLayout for Node {
    const BYTE_LEN: usize = NODE_LEN;

    fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.key.to_le_bytes());
        out[4..8].copy_from_slice(&self.val.to_le_bytes());
        self.left.encode_into(&mut out[8..16]);
        self.right.encode_into(&mut out[16..24]);
        out[24..28].copy_from_slice(&self.height.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut buf = buf;
        Self {
            key: u32::decode_from(take(&mut buf, 4)),
            val: u32::decode_from(take(&mut buf, 4)),
            left: BlockPointer::decode_from(take(&mut buf, 8)),
            right: BlockPointer::decode_from(take(&mut buf, 8)),
            height: u32::decode_from(buf),
        }
    }
}

/// An oblivious key-value map with AVL balancing.
///
/// Capacity `N` must be a power of two. Re-entrancy is not supported: the
/// per-operation cache and the delete latch assume one operation at a
/// time.
#[derive(Debug)]
pub struct OMap {
    capacity: usize,
    size: usize,
    /// Bound on successor searches, from the AVL height bound.
    max_depth: u32,
    /// Fixed per-phase ORAM access budget.
    pad_val: u64,
    oram: PathOram<NODE_LEN>,
    root: BlockPointer,
    accesses_before_finalize: u64,
    cache: BTreeMap<BlockId, Node>,
    delete_res: MapVal,
    delete_successful: bool,
}

impl OMap {
    /// Returns an empty map of the given power-of-two capacity.
    pub fn new(capacity: usize) -> Result<Self, OdsError> {
        let log_n = (capacity as f64).log2();
        Ok(Self {
            capacity,
            size: 0,
            max_depth: (1.44 * log_n).ceil() as u32,
            pad_val: (1.44 * 3.0 * log_n).ceil() as u64,
            oram: PathOram::new(
                capacity,
                OramOptions {
                    id_generator: true,
                    ..Default::default()
                },
            )?,
            root: BlockPointer::null(),
            accesses_before_finalize: 0,
            cache: BTreeMap::new(),
            delete_res: 0,
            delete_successful: false,
        })
    }

    /// Builds a map already holding `items`.
    pub fn with_items<R: Rng + CryptoRng>(
        capacity: usize,
        items: Vec<(MapKey, MapVal)>,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Self, OdsError> {
        let mut map = Self::new(capacity)?;
        for (key, val) in items {
            map.insert(key, val, enc_key, rng)?;
        }
        Ok(map)
    }

    /// The map capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of keys currently stored.
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

    /// Inserts `key -> val`, replacing the value if the key is present.
    pub fn insert<R: Rng + CryptoRng>(
        &mut self,
        key: MapKey,
        val: MapVal,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        let replacement = self.insert_at(key, val, self.root, enc_key, rng)?;
        self.root = replacement;
        self.finalize(enc_key, rng)
    }

    /// Returns the value stored under `key`, or `0` if absent.
    pub fn read<R: Rng + CryptoRng>(
        &mut self,
        key: MapKey,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<MapVal, OdsError> {
        let found = self.find_at(key, self.root, enc_key, rng)?;
        let mut res = 0;
        if !found.is_null() {
            if let Some(node) = self.cache.get(&found.id) {
                res = node.val;
            }
        }
        self.finalize(enc_key, rng)?;
        Ok(res)
    }

    /// Removes `key` and returns its value, or `0` if it was absent.
    pub fn read_and_remove<R: Rng + CryptoRng>(
        &mut self,
        key: MapKey,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<MapVal, OdsError> {
        let replacement = self.delete_at(key, self.root, enc_key, rng)?;
        self.root = replacement;

        let mut res = 0;
        if self.delete_successful {
            self.size -= 1;
            res = self.delete_res;
            self.delete_res = 0;
            self.delete_successful = false;
        }
        self.finalize(enc_key, rng)?;
        Ok(res)
    }

    /// Removes the root's key and returns the pair. On an empty map this
    /// returns `(0, 0)` after a fully padded access.
    pub fn take_one<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(MapKey, MapVal), OdsError> {
        let root_node = self.fetch(self.root, enc_key, rng)?;
        let key = root_node.key;
        let val = self.read_and_remove(key, enc_key, rng)?;
        Ok((key, val))
    }

    /// Depth-first enumeration of all pairs. Debug and test helper; still
    /// goes through `finalize`.
    pub fn decrypt_all<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Vec<(MapKey, MapVal)>, OdsError> {
        let mut res = Vec::new();
        self.decrypt_all_at(self.root, &mut res, enc_key, rng)?;
        self.finalize(enc_key, rng)?;
        Ok(res)
    }

    /// Initializes every ORAM bucket to an encrypted all-dummy bucket.
    pub fn fill_with_dummies<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        self.oram.fill_with_dummies(enc_key, rng)
    }

    /// Pulls the node behind `bp` into the cache (one ORAM access on a
    /// cache miss) and returns a copy. A null pointer yields the empty
    /// sentinel node.
    ///
    /// The fetch is a `read_and_remove`: deleting is no dearer than
    /// reading when every cached node gets written back at finalize.
    fn fetch<R: Rng + CryptoRng>(
        &mut self,
        bp: BlockPointer,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Node, OdsError> {
        if bp.is_null() {
            return Ok(Node::default());
        }

        if let Some(node) = self.cache.get(&bp.id) {
            return Ok(*node);
        }

        assert!(bp.position != 0);
        self.accesses_before_finalize += 1;
        let block = self
            .oram
            .read_and_remove(Block::query(bp.position, bp.id), enc_key, rng)?;
        let node = Node::decode_from(&block.value);
        self.cache.insert(bp.id, node);
        Ok(node)
    }

    fn height_of<R: Rng + CryptoRng>(
        &mut self,
        bp: BlockPointer,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<u32, OdsError> {
        if bp.is_null() {
            return Ok(0);
        }
        Ok(self.fetch(bp, enc_key, rng)?.height)
    }

    fn balance_factor<R: Rng + CryptoRng>(
        &mut self,
        bp: BlockPointer,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<i32, OdsError> {
        let node = self.fetch(bp, enc_key, rng)?;
        let l_height = self.height_of(node.left, enc_key, rng)?;
        let r_height = self.height_of(node.right, enc_key, rng)?;
        Ok(r_height as i32 - l_height as i32)
    }

    fn insert_at<R: Rng + CryptoRng>(
        &mut self,
        key: MapKey,
        val: MapVal,
        root_bp: BlockPointer,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<BlockPointer, OdsError> {
        if root_bp.is_null() {
            let id = self.oram.next_id();
            self.cache.insert(id, Node::leaf(key, val));
            self.size += 1;
            return Ok(BlockPointer::new(id, 0));
        }

        let mut node = self.fetch(root_bp, enc_key, rng)?;

        if key == node.key {
            node.val = val;
            self.cache.insert(root_bp.id, node);
            return Ok(root_bp);
        }

        if key < node.key {
            let replacement = self.insert_at(key, val, node.left, enc_key, rng)?;
            node.left = replacement;
        } else {
            let replacement = self.insert_at(key, val, node.right, enc_key, rng)?;
            node.right = replacement;
        }

        let l_height = self.height_of(node.left, enc_key, rng)?;
        let r_height = self.height_of(node.right, enc_key, rng)?;
        node.height = l_height.max(r_height) + 1;
        self.cache.insert(root_bp.id, node);

        self.balance(root_bp, enc_key, rng)
    }

    fn delete_at<R: Rng + CryptoRng>(
        &mut self,
        key: MapKey,
        root_bp: BlockPointer,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<BlockPointer, OdsError> {
        if root_bp.is_null() {
            // Empty subtree.
            return Ok(root_bp);
        }

        let node = self.fetch(root_bp, enc_key, rng)?;

        if key < node.key {
            let replacement = self.delete_at(key, node.left, enc_key, rng)?;
            if let Some(cached) = self.cache.get_mut(&root_bp.id) {
                cached.left = replacement;
            }
            return self.balance(root_bp, enc_key, rng);
        }
        if key > node.key {
            let replacement = self.delete_at(key, node.right, enc_key, rng)?;
            if let Some(cached) = self.cache.get_mut(&root_bp.id) {
                cached.right = replacement;
            }
            return self.balance(root_bp, enc_key, rng);
        }

        // key == node.key. The latch stays untouched on the inner delete of
        // a successor: the actual node had two children.
        if !self.delete_successful {
            self.delete_res = node.val;
            self.delete_successful = true;
        }

        let has_left = !node.left.is_null();
        let has_right = !node.right.is_null();

        if !has_left && !has_right {
            self.cache.remove(&root_bp.id);
            self.oram.add_freed_id(root_bp.id);
            return Ok(BlockPointer::null());
        }
        if has_left && !has_right {
            self.cache.remove(&root_bp.id);
            self.oram.add_freed_id(root_bp.id);
            return Ok(node.left);
        }
        if !has_left && has_right {
            self.cache.remove(&root_bp.id);
            self.oram.add_freed_id(root_bp.id);
            return Ok(node.right);
        }

        // Two children: find the in-order successor, bounded by the AVL
        // height.
        let mut it = node.right;
        let mut successor = Node::default();
        for _ in 0..self.max_depth {
            successor = self.fetch(it, enc_key, rng)?;
            if successor.left.is_null() {
                break;
            }
            it = successor.left;
        }

        // Copy the successor's pair into this node, then delete the
        // successor from the right subtree; its rebalancing may cascade up.
        if let Some(cached) = self.cache.get_mut(&root_bp.id) {
            cached.key = successor.key;
            cached.val = successor.val;
        }
        let new_right = self.delete_at(successor.key, node.right, enc_key, rng)?;
        if let Some(cached) = self.cache.get_mut(&root_bp.id) {
            cached.right = new_right;
        }
        self.balance(root_bp, enc_key, rng)
    }

    fn find_at<R: Rng + CryptoRng>(
        &mut self,
        key: MapKey,
        root_bp: BlockPointer,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<BlockPointer, OdsError> {
        if root_bp.is_null() {
            // Not found.
            return Ok(root_bp);
        }
        let node = self.fetch(root_bp, enc_key, rng)?;
        if key == node.key {
            return Ok(root_bp);
        }
        if key < node.key {
            return self.find_at(key, node.left, enc_key, rng);
        }
        self.find_at(key, node.right, enc_key, rng)
    }

    fn balance<R: Rng + CryptoRng>(
        &mut self,
        root_bp: BlockPointer,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<BlockPointer, OdsError> {
        let bf = self.balance_factor(root_bp, enc_key, rng)?;
        if (-1..=1).contains(&bf) {
            // No rebalance necessary.
            return Ok(root_bp);
        }

        let node = self.fetch(root_bp, enc_key, rng)?;
        if bf < -1 {
            // Left-heavy.
            let l_bf = self.balance_factor(node.left, enc_key, rng)?;
            if l_bf > 0 {
                // left-right
                let new_left = self.rotate_left(node.left, enc_key, rng)?;
                if let Some(cached) = self.cache.get_mut(&root_bp.id) {
                    cached.left = new_left;
                }
            }
            return self.rotate_right(root_bp, enc_key, rng);
        }

        // Right-heavy.
        let r_bf = self.balance_factor(node.right, enc_key, rng)?;
        if r_bf < 0 {
            // right-left
            let new_right = self.rotate_right(node.right, enc_key, rng)?;
            if let Some(cached) = self.cache.get_mut(&root_bp.id) {
                cached.right = new_right;
            }
        }
        self.rotate_left(root_bp, enc_key, rng)
    }

    fn rotate_left<R: Rng + CryptoRng>(
        &mut self,
        root_bp: BlockPointer,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<BlockPointer, OdsError> {
        let parent = self.fetch(root_bp, enc_key, rng)?;
        let rc = self.fetch(parent.right, enc_key, rng)?;
        let lc = self.fetch(parent.left, enc_key, rng)?;
        let rrc = self.fetch(rc.right, enc_key, rng)?;
        let rlc = self.fetch(rc.left, enc_key, rng)?;

        let new_left = Node {
            key: parent.key,
            val: parent.val,
            left: parent.left,
            right: rc.left,
            height: 1 + lc.height.max(rlc.height),
        };
        let new_parent = Node {
            key: rc.key,
            val: rc.val,
            left: root_bp,
            right: rc.right,
            height: 1 + new_left.height.max(rrc.height),
        };
        let new_parent_bp = parent.right;

        self.cache.insert(new_parent_bp.id, new_parent);
        self.cache.insert(root_bp.id, new_left);
        Ok(new_parent_bp)
    }

    fn rotate_right<R: Rng + CryptoRng>(
        &mut self,
        root_bp: BlockPointer,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<BlockPointer, OdsError> {
        let parent = self.fetch(root_bp, enc_key, rng)?;
        let rc = self.fetch(parent.right, enc_key, rng)?;
        let lc = self.fetch(parent.left, enc_key, rng)?;
        let lrc = self.fetch(lc.right, enc_key, rng)?;
        let llc = self.fetch(lc.left, enc_key, rng)?;

        let new_right = Node {
            key: parent.key,
            val: parent.val,
            left: lc.right,
            right: parent.right,
            height: 1 + lrc.height.max(rc.height),
        };
        let new_parent = Node {
            key: lc.key,
            val: lc.val,
            left: lc.left,
            right: root_bp,
            height: 1 + llc.height.max(new_right.height),
        };
        let new_parent_bp = parent.left;

        self.cache.insert(new_parent_bp.id, new_parent);
        self.cache.insert(root_bp.id, new_right);
        Ok(new_parent_bp)
    }

    /// Pads the read side up to `pad_val`, writes every cached node back
    /// under a fresh position (rewriting child pointers to match), pads
    /// the write side, and empties the cache.
    fn finalize<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        // Pad reads.
        let mut reads_done = self.accesses_before_finalize;
        while reads_done < self.pad_val {
            self.oram.dummy_access(enc_key, rng)?;
            reads_done += 1;
        }
        self.accesses_before_finalize = 0;

        // Draw fresh positions for every cached node.
        let mut new_positions: BTreeMap<BlockId, Position> = BTreeMap::new();
        for &id in self.cache.keys() {
            new_positions.insert(id, self.oram.generate_position(rng));
        }
        if let Some(&pos) = new_positions.get(&self.root.id) {
            self.root.position = pos;
        }

        // Rewrite child pointer positions and write everything back.
        for (&id, node) in &self.cache {
            let mut node = *node;
            if let Some(&pos) = new_positions.get(&node.left.id) {
                node.left.position = pos;
            }
            if let Some(&pos) = new_positions.get(&node.right.id) {
                node.right.position = pos;
            }
            let mut encoded = [0u8; NODE_LEN];
            node.encode_into(&mut encoded);
            self.oram
                .insert(Block::new(new_positions[&id], id, encoded), enc_key, rng)?;
        }

        // Pad writes.
        let mut writes_done = self.cache.len() as u64;
        self.cache.clear();
        while writes_done < self.pad_val {
            self.oram.dummy_access(enc_key, rng)?;
            writes_done += 1;
        }
        Ok(())
    }

    fn decrypt_all_at<R: Rng + CryptoRng>(
        &mut self,
        root_bp: BlockPointer,
        out: &mut Vec<(MapKey, MapVal)>,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        if root_bp.is_null() {
            return Ok(());
        }
        let node = self.fetch(root_bp, enc_key, rng)?;
        out.push((node.key, node.val));
        self.decrypt_all_at(node.left, out, enc_key, rng)?;
        self.decrypt_all_at(node.right, out, enc_key, rng)
    }
}
