// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A growable oblivious min-heap over two static Path OHeaps.
//!
//! Migration uses `extract_min`, the heap's only destructive read. Every
//! operation touches both substructures (really on one side, with a
//! dummy of matching cost on the other), so which side held the minimum
//! never shows in the access pattern.

use super::is_power_of_two;
use crate::{
    crypto::EncryptionKey,
    path_oheap::{Block, OHeap as PathOHeap},
    OdsError,
};
use rand::{CryptoRng, Rng};

/// A growable oblivious min-heap.
#[derive(Debug, Default)]
pub struct OHeap {
    capacity: usize,
    size: usize,
    subs: [Option<Box<PathOHeap>>; 2],
    memory_access_count: u64,
    memory_bytes_moved_total: u64,
}

impl OHeap {
    /// Returns an empty heap of capacity zero; the first `grow` brings it
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
                Some(Box::new(PathOHeap::new(capacity)?)),
                Some(Box::new(PathOHeap::new(capacity * 2)?)),
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
            self.subs[1] = Some(Box::new(PathOHeap::new(1)?));
            self.capacity += 1;
            return Ok(());
        }

        if is_power_of_two(self.capacity) {
            self.subs[0] = self.subs[1].take();
            self.subs[1] = Some(Box::new(PathOHeap::new(2 * self.capacity)?));
        }

        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();

        let moved = self.smaller().extract_min(enc_key, rng)?;
        if moved.is_dummy() {
            self.larger().dummy_access(enc_key, rng, true)?;
        } else {
            self.larger()
                .insert(Block::new(0, moved.key, moved.value), enc_key, rng)?;
        }

        self.capacity += 1;
        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;
        Ok(())
    }

    /// Retreats the capacity by one, migrating up to two blocks from the
    /// larger substructure back into the smaller. Both transfers always
    /// run so the step's pattern is a constant function of the capacity.
    pub fn shrink<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        if self.capacity == 0 {
            return Ok(());
        }
        assert!(self.capacity > self.size);

        if self.capacity == 1 {
            self.subs = [None, None];
            self.capacity = 0;
            return Ok(());
        }

        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();

        for _ in 0..2 {
            let mut moved = Block::dummy();
            let has_room = {
                let smaller = self.smaller();
                smaller.size() < smaller.capacity()
            };
            if has_room {
                moved = self.larger().extract_min(enc_key, rng)?;
            } else {
                self.larger().dummy_access(enc_key, rng, true)?;
            }
            if moved.is_dummy() {
                self.smaller().dummy_access(enc_key, rng, true)?;
            } else {
                self.smaller()
                    .insert(Block::new(0, moved.key, moved.value), enc_key, rng)?;
            }
        }

        self.capacity -= 1;
        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;

        if is_power_of_two(self.capacity) {
            self.subs[1] = self.subs[0].take();
            let smaller_capacity = self.capacity / 2;
            if smaller_capacity > 0 {
                self.subs[0] = Some(Box::new(PathOHeap::new(smaller_capacity)?));
            } else {
                self.subs[0] = None;
            }
        }
        Ok(())
    }

    /// Inserts a block; new blocks always land in the larger substructure.
    pub fn insert<R: Rng + CryptoRng>(
        &mut self,
        block: Block,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        assert!(self.size < self.capacity);
        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();

        self.larger().insert(block, enc_key, rng)?;
        if self.subs[0].is_some() {
            self.smaller().dummy_access(enc_key, rng, true)?;
        }

        self.size += 1;
        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;
        Ok(())
    }

    /// Returns the minimum-keyed block across both substructures without
    /// removing it, or a dummy if the heap is empty.
    pub fn find_min<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
        pad: bool,
    ) -> Result<Block, OdsError> {
        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();

        let mut res = Block::dummy();
        for i in 0..2 {
            if let Some(sub) = self.subs[i].as_mut() {
                let candidate = sub.find_min(enc_key, rng, pad)?;
                if !candidate.is_dummy() && (res.is_dummy() || candidate.key < res.key) {
                    res = candidate;
                }
            }
        }

        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;
        Ok(res)
    }

    /// Removes and returns the minimum-keyed block, or a dummy if the heap
    /// is empty. The side that loses the comparison performs a dummy
    /// access of matching cost.
    pub fn extract_min<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Block, OdsError> {
        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();

        // Unpadded root reads on both sides decide the winner.
        let mut minima = [Block::dummy(), Block::dummy()];
        for i in 0..2 {
            if let Some(sub) = self.subs[i].as_mut() {
                minima[i] = sub.find_min(enc_key, rng, false)?;
            }
        }
        let winner = match (minima[0].is_dummy(), minima[1].is_dummy()) {
            (true, true) => None,
            (false, true) => Some(0),
            (true, false) => Some(1),
            (false, false) => Some(usize::from(minima[1].key < minima[0].key)),
        };

        let mut res = Block::dummy();
        for i in 0..2 {
            if let Some(sub) = self.subs[i].as_mut() {
                if winner == Some(i) {
                    res = sub.extract_min(enc_key, rng)?;
                } else {
                    sub.dummy_access(enc_key, rng, true)?;
                }
            }
        }

        if !res.is_dummy() {
            self.size -= 1;
        }
        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;
        Ok(res)
    }

    fn smaller(&mut self) -> &mut PathOHeap {
        self.subs[0].as_mut().expect("smaller substructure must exist")
    }

    fn larger(&mut self) -> &mut PathOHeap {
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

    fn grown_to(capacity: usize, enc_key: &EncryptionKey, rng: &mut StdRng) -> OHeap {
        let mut heap = OHeap::new();
        for _ in 0..capacity {
            heap.grow(enc_key, rng).unwrap();
        }
        heap
    }

    #[test]
    fn test_min_tracks_across_substructures() {
        let (enc_key, mut rng) = setup(0);
        let mut heap = grown_to(4, &enc_key, &mut rng);

        heap.insert(Block::new(0, 8, 80), &enc_key, &mut rng).unwrap();
        heap.insert(Block::new(0, 3, 30), &enc_key, &mut rng).unwrap();

        // Growing past the boundary splits the blocks across both halves.
        for _ in 0..2 {
            heap.grow(&enc_key, &mut rng).unwrap();
        }
        heap.insert(Block::new(0, 5, 50), &enc_key, &mut rng).unwrap();
        assert_eq!(heap.size(), 3);

        let min = heap.find_min(&enc_key, &mut rng, true).unwrap();
        assert_eq!((min.key, min.value), (3, 30));

        let extracted = heap.extract_min(&enc_key, &mut rng).unwrap();
        assert_eq!((extracted.key, extracted.value), (3, 30));
        let extracted = heap.extract_min(&enc_key, &mut rng).unwrap();
        assert_eq!((extracted.key, extracted.value), (5, 50));
        let extracted = heap.extract_min(&enc_key, &mut rng).unwrap();
        assert_eq!((extracted.key, extracted.value), (8, 80));
        assert_eq!(heap.size(), 0);
        assert!(heap.extract_min(&enc_key, &mut rng).unwrap().is_dummy());
    }

    #[test]
    fn test_shrink_migrates_blocks_back() {
        let (enc_key, mut rng) = setup(1);
        let mut heap = grown_to(6, &enc_key, &mut rng);

        for key in [9u32, 2, 7] {
            heap.insert(Block::new(0, key, key), &enc_key, &mut rng)
                .unwrap();
        }

        for _ in 0..2 {
            heap.shrink(&enc_key, &mut rng).unwrap();
        }
        assert_eq!(heap.capacity(), 4);

        for expected in [2u32, 7, 9] {
            let block = heap.extract_min(&enc_key, &mut rng).unwrap();
            assert_eq!(block.key, expected);
        }
    }

    #[test]
    fn test_extract_cost_hides_the_winning_side() {
        let (enc_key, mut rng) = setup(2);
        let mut heap = grown_to(6, &enc_key, &mut rng);

        for key in [10u32, 20, 30] {
            heap.insert(Block::new(0, key, key), &enc_key, &mut rng)
                .unwrap();
        }
        // Growing across the power-of-two boundary migrates only the
        // minimum, leaving blocks in both substructures.
        for _ in 0..3 {
            heap.grow(&enc_key, &mut rng).unwrap();
        }
        assert_eq!(heap.capacity(), 9);

        let before = heap.memory_access_count();
        let first = heap.extract_min(&enc_key, &mut rng).unwrap();
        let first_cost = heap.memory_access_count() - before;

        let before = heap.memory_access_count();
        let second = heap.extract_min(&enc_key, &mut rng).unwrap();
        let second_cost = heap.memory_access_count() - before;

        // The two extractions won on different sides, at identical cost.
        assert_eq!(first.key, 10);
        assert_eq!(second.key, 20);
        assert_eq!(first_cost, second_cost);
    }

    #[test]
    fn test_shrink_to_zero_and_regrow() {
        let (enc_key, mut rng) = setup(3);
        let mut heap = grown_to(2, &enc_key, &mut rng);

        heap.insert(Block::new(0, 1, 1), &enc_key, &mut rng).unwrap();
        assert_eq!(heap.extract_min(&enc_key, &mut rng).unwrap().key, 1);

        for _ in 0..2 {
            heap.shrink(&enc_key, &mut rng).unwrap();
        }
        assert_eq!(heap.capacity(), 0);

        heap.grow(&enc_key, &mut rng).unwrap();
        heap.insert(Block::new(0, 6, 60), &enc_key, &mut rng).unwrap();
        let min = heap.find_min(&enc_key, &mut rng, true).unwrap();
        assert_eq!((min.key, min.value), (6, 60));
    }

    #[test]
    fn test_benchmark_constructor() {
        let heap = OHeap::starting_at_power_of_two(2).unwrap();
        assert_eq!(heap.capacity(), 4);
    }
}
