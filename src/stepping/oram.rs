// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A growable ORAM over two static Path ORAMs.
//!
//! Ids are addresses in `[1, capacity]`. The smaller substructure holds
//! the ids not yet migrated; `sub_oram_index` routes each id by range, and
//! every operation touches both substructures (one really, one with a
//! dummy) so the observable pattern depends only on the capacity.

use super::is_power_of_two;
use crate::{
    crypto::EncryptionKey,
    path_oram::{self, OramOptions, PathOram},
    BlockId, OdsError, ValueSize,
};
use rand::{CryptoRng, Rng};

/// An id-value pair handed back by the growable ORAM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block<const L: ValueSize> {
    /// The address; `0` marks "not found".
    pub id: BlockId,
    /// The payload.
    pub value: [u8; L],
}

impl<const L: ValueSize> Block<L> {
    /// Creates a block from its parts.
    pub fn new(id: BlockId, value: [u8; L]) -> Self {
        Self { id, value }
    }

    /// The "not found" sentinel.
    pub fn dummy() -> Self {
        Self {
            id: 0,
            value: [0; L],
        }
    }

    /// Whether this block is the "not found" sentinel.
    pub fn is_dummy(&self) -> bool {
        self.id == 0
    }
}

/// A growable oblivious block store addressed by ids in `[1, capacity]`.
#[derive(Debug, Default)]
pub struct ORam<const L: ValueSize> {
    capacity: usize,
    size: usize,
    subs: [Option<Box<PathOram<L>>>; 2],
    memory_access_count: u64,
    memory_bytes_moved_total: u64,
}

impl<const L: ValueSize> ORam<L> {
    const OPTIONS: OramOptions = OramOptions {
        position_map: true,
        id_generator: false,
    };

    /// Returns an empty ORAM of capacity zero; the first `grow` brings it
    /// to capacity one.
    pub fn new() -> Self {
        Self {
            capacity: 0,
            size: 0,
            subs: [None, None],
            memory_access_count: 0,
            memory_bytes_moved_total: 0,
        }
    }

    /// Starts at capacity `2^power_of_two` with both substructures
    /// allocated. Only implemented for benchmarks: the size is taken to be
    /// the full capacity.
    pub fn starting_at_power_of_two(power_of_two: u32) -> Result<Self, OdsError> {
        let capacity = 1usize << power_of_two;
        Ok(Self {
            capacity,
            size: capacity,
            subs: [
                Some(Box::new(PathOram::new(capacity, Self::OPTIONS)?)),
                Some(Box::new(PathOram::new(capacity * 2, Self::OPTIONS)?)),
            ],
            memory_access_count: 0,
            memory_bytes_moved_total: 0,
        })
    }

    /// The externally visible capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of blocks currently stored.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Total bucket-level path operations performed so far.
    pub fn memory_access_count(&self) -> u64 {
        self.memory_access_count
    }

    /// Total encrypted bytes traversed so far.
    pub fn memory_bytes_moved_total(&self) -> u64 {
        self.memory_bytes_moved_total
    }

    /// Advances the capacity by one, migrating one block from the smaller
    /// substructure into the larger (or dummying both sides).
    pub fn grow<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        if self.capacity == 0 {
            self.subs[1] = Some(Box::new(PathOram::new(1, Self::OPTIONS)?));
            self.capacity += 1;
            return Ok(());
        }

        if is_power_of_two(self.capacity) {
            // Promote: the old larger half becomes the smaller one.
            self.subs[0] = self.subs[1].take();
            self.subs[1] = Some(Box::new(PathOram::new(2 * self.capacity, Self::OPTIONS)?));
        }

        let smaller_capacity = self.smaller().capacity();
        let move_id = (self.capacity % smaller_capacity) as BlockId + 1;

        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();

        let moved = self
            .smaller()
            .read_and_remove(path_oram::Block::query(0, move_id), enc_key, rng)?;
        if moved.is_dummy() {
            self.larger().dummy_access(enc_key, rng)?;
        } else {
            self.larger()
                .insert(path_oram::Block::new(0, moved.id, moved.value), enc_key, rng)?;
        }

        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;
        self.capacity += 1;
        Ok(())
    }

    /// Removes and returns the block at `id`, or the sentinel if nothing
    /// is stored there.
    pub fn read_and_remove<R: Rng + CryptoRng>(
        &mut self,
        id: BlockId,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Block<L>, OdsError> {
        assert!(1 <= id && id as usize <= self.capacity);
        let index = self.sub_oram_index(id);
        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();

        let mut res = Block::dummy();
        for i in 0..2 {
            if self.skip_smaller_side(i) {
                continue;
            }
            let sub = self.subs[i].as_mut().expect("substructure must exist");
            if i == index {
                let block = sub.read_and_remove(path_oram::Block::query(0, id), enc_key, rng)?;
                res = Block::new(block.id, block.value);
            } else {
                sub.dummy_access(enc_key, rng)?;
            }
        }

        if !res.is_dummy() {
            self.size -= 1;
        }
        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;
        Ok(res)
    }

    /// Returns the block at `id` while retaining it, or the sentinel.
    pub fn read<R: Rng + CryptoRng>(
        &mut self,
        id: BlockId,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Block<L>, OdsError> {
        assert!(1 <= id && id as usize <= self.capacity);
        let index = self.sub_oram_index(id);
        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();

        let mut res = Block::dummy();
        for i in 0..2 {
            if self.skip_smaller_side(i) {
                continue;
            }
            let sub = self.subs[i].as_mut().expect("substructure must exist");
            if i == index {
                let block = sub.read(path_oram::Block::query(0, id), enc_key, rng)?;
                res = Block::new(block.id, block.value);
            } else {
                sub.dummy_access(enc_key, rng)?;
            }
        }

        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;
        Ok(res)
    }

    /// Stores a value under `id`, which must not already be present.
    pub fn insert<R: Rng + CryptoRng>(
        &mut self,
        id: BlockId,
        value: [u8; L],
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        assert!(1 <= id && id as usize <= self.capacity);
        let index = self.sub_oram_index(id);
        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();

        for i in 0..2 {
            if self.subs[i].is_none() {
                continue;
            }
            let sub = self.subs[i].as_mut().expect("substructure must exist");
            if i == index {
                sub.insert(path_oram::Block::new(0, id, value), enc_key, rng)?;
            } else {
                sub.dummy_access(enc_key, rng)?;
            }
        }

        self.size += 1;
        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;
        Ok(())
    }

    /// Which substructure `id` currently lives in: the smaller half keeps
    /// the not-yet-migrated id range.
    fn sub_oram_index(&self, id: BlockId) -> usize {
        assert!(1 <= id && id as usize <= self.capacity);
        if self.capacity == 1 {
            return 1;
        }
        let smaller_capacity = self.subs[0]
            .as_ref()
            .map_or(0, |sub| sub.capacity());
        if id as usize > smaller_capacity || id as usize <= self.capacity - smaller_capacity {
            1
        } else {
            0
        }
    }

    /// Reads and removals skip the smaller side when it is absent or known
    /// to be empty (capacity at an exact power of two).
    fn skip_smaller_side(&self, i: usize) -> bool {
        i == 0 && (self.subs[0].is_none() || is_power_of_two(self.capacity))
    }

    fn smaller(&mut self) -> &mut PathOram<L> {
        self.subs[0].as_mut().expect("smaller substructure must exist")
    }

    fn larger(&mut self) -> &mut PathOram<L> {
        self.subs[1].as_mut().expect("larger substructure must exist")
    }

    fn sub_access_sum(&self) -> u64 {
        self.subs
            .iter()
            .flatten()
            .map(|sub| sub.memory_access_count())
            .sum()
    }

    fn sub_bytes_sum(&self) -> u64 {
        self.subs
            .iter()
            .flatten()
            .map(|sub| sub.memory_bytes_moved_total())
            .sum()
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
    fn test_grow_from_zero_and_fill() {
        let (enc_key, mut rng) = setup(0);
        let mut oram = ORam::<4>::new();
        assert_eq!(oram.capacity(), 0);

        for _ in 0..6 {
            oram.grow(&enc_key, &mut rng).unwrap();
        }
        assert_eq!(oram.capacity(), 6);

        for id in 1..=6u32 {
            oram.insert(id, [id as u8; 4], &enc_key, &mut rng).unwrap();
        }
        assert_eq!(oram.size(), 6);

        for id in 1..=6u32 {
            let block = oram.read(id, &enc_key, &mut rng).unwrap();
            assert_eq!(block.id, id);
            assert_eq!(block.value, [id as u8; 4]);
        }
    }

    #[test]
    fn test_blocks_survive_growth_migration() {
        let (enc_key, mut rng) = setup(1);
        let mut oram = ORam::<4>::new();

        for _ in 0..2 {
            oram.grow(&enc_key, &mut rng).unwrap();
        }
        oram.insert(1, [0xAA; 4], &enc_key, &mut rng).unwrap();
        oram.insert(2, [0xBB; 4], &enc_key, &mut rng).unwrap();

        // Growing to 8 migrates both blocks across a promote boundary.
        for _ in 0..6 {
            oram.grow(&enc_key, &mut rng).unwrap();
        }
        assert_eq!(oram.capacity(), 8);

        assert_eq!(oram.read(1, &enc_key, &mut rng).unwrap().value, [0xAA; 4]);
        assert_eq!(oram.read(2, &enc_key, &mut rng).unwrap().value, [0xBB; 4]);

        let removed = oram.read_and_remove(1, &enc_key, &mut rng).unwrap();
        assert_eq!(removed.value, [0xAA; 4]);
        assert_eq!(oram.size(), 1);
        assert!(oram.read(1, &enc_key, &mut rng).unwrap().is_dummy());
    }

    #[test]
    fn test_access_count_depends_only_on_capacity() {
        let (enc_key, mut rng) = setup(2);
        let mut oram = ORam::<4>::new();
        for _ in 0..6 {
            oram.grow(&enc_key, &mut rng).unwrap();
        }
        oram.insert(3, [1; 4], &enc_key, &mut rng).unwrap();

        let before = oram.memory_access_count();
        oram.read(3, &enc_key, &mut rng).unwrap();
        let present_cost = oram.memory_access_count() - before;

        let before = oram.memory_access_count();
        oram.read(5, &enc_key, &mut rng).unwrap();
        assert_eq!(oram.memory_access_count() - before, present_cost);

        // Ids routed to different substructures cost the same too.
        let before = oram.memory_access_count();
        oram.read(2, &enc_key, &mut rng).unwrap();
        assert_eq!(oram.memory_access_count() - before, present_cost);
    }

    #[test]
    fn test_benchmark_constructor() {
        let oram = ORam::<4>::starting_at_power_of_two(3).unwrap();
        assert_eq!(oram.capacity(), 8);
        assert_eq!(oram.size(), 8);
    }
}
