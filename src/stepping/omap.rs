// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A growable oblivious map over two static Path-AVL maps.
//!
//! Entries with value `0` are not supported: `take_one`'s `(0, 0)` result
//! is the "nothing to move" sentinel during migration, consistent with
//! `read` returning `0` for missing keys.

use super::is_power_of_two;
use crate::{
    crypto::EncryptionKey,
    path_omap::{MapKey, MapVal, OMap as PathOMap},
    OdsError,
};
use rand::{CryptoRng, Rng};

/// A growable oblivious key-value map.
#[derive(Debug, Default)]
pub struct OMap {
    capacity: usize,
    size: usize,
    subs: [Option<Box<PathOMap>>; 2],
    memory_access_count: u64,
    memory_bytes_moved_total: u64,
}

impl OMap {
    /// Returns an empty map of capacity zero; the first `grow` brings it
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
                Some(Box::new(PathOMap::new(capacity)?)),
                Some(Box::new(PathOMap::new(capacity * 2)?)),
            ],
            memory_access_count: 0,
            memory_bytes_moved_total: 0,
        })
    }

    /// The externally visible capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of keys currently stored.
    pub fn size(&self) -> usize {
        debug_assert_eq!(self.size, self.total_size_of_subs());
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

    /// Advances the capacity by one, migrating one entry from the smaller
    /// substructure into the larger (or dummying both sides).
    pub fn grow<R: Rng + CryptoRng>(
        &mut self,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        if self.capacity == 0 {
            self.subs[1] = Some(Box::new(PathOMap::new(1)?));
            self.capacity += 1;
            return Ok(());
        }

        if is_power_of_two(self.capacity) {
            self.subs[0] = self.subs[1].take();
            self.subs[1] = Some(Box::new(PathOMap::new(2 * self.capacity)?));
        }

        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();

        let (key, val) = self.smaller().take_one(enc_key, rng)?;
        if key == 0 && val == 0 {
            // Nothing left to migrate.
            self.larger().read(0, enc_key, rng)?;
        } else {
            self.larger().insert(key, val, enc_key, rng)?;
        }

        self.capacity += 1;
        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;
        Ok(())
    }

    /// Retreats the capacity by one, migrating up to two entries from the
    /// larger substructure back into the smaller.
    ///
    /// The loop always performs both transfers even when the smaller half
    /// is already full (both sides then see dummy reads): a shrink step's
    /// pattern must be a constant function of the capacity.
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
            let mut moved = (0, 0);
            let has_room = {
                let smaller = self.smaller();
                smaller.size() < smaller.capacity()
            };
            if has_room {
                moved = self.larger().take_one(enc_key, rng)?;
            } else {
                self.larger().read(0, enc_key, rng)?;
            }
            if moved == (0, 0) {
                self.smaller().read(0, enc_key, rng)?;
            } else {
                self.smaller().insert(moved.0, moved.1, enc_key, rng)?;
            }
        }

        self.capacity -= 1;
        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;

        if is_power_of_two(self.capacity) {
            // The larger half is drained; the smaller one takes its place.
            self.subs[1] = self.subs[0].take();
            let smaller_capacity = self.capacity / 2;
            if smaller_capacity > 0 {
                self.subs[0] = Some(Box::new(PathOMap::new(smaller_capacity)?));
            } else {
                self.subs[0] = None;
            }
        }
        Ok(())
    }

    /// Inserts `key -> val`, replacing the value if the key is present.
    pub fn insert<R: Rng + CryptoRng>(
        &mut self,
        key: MapKey,
        val: MapVal,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OdsError> {
        assert!(self.size < self.capacity);
        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();
        let pre_size = self.total_size_of_subs();

        // Dislodge the key from the smaller half so it lives in exactly
        // one substructure, then insert into the larger.
        if self.subs[0].is_some() {
            self.smaller().read_and_remove(key, enc_key, rng)?;
        }
        self.larger().insert(key, val, enc_key, rng)?;

        if self.total_size_of_subs() > pre_size {
            self.size += 1;
        }
        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;
        Ok(())
    }

    /// Returns the value stored under `key`, or `0` if absent.
    pub fn read<R: Rng + CryptoRng>(
        &mut self,
        key: MapKey,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<MapVal, OdsError> {
        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();

        let mut res = 0;
        for i in 0..2 {
            if self.skip_smaller_side(i) {
                continue;
            }
            let sub = self.subs[i].as_mut().expect("substructure must exist");
            // At most one substructure holds the key.
            res |= sub.read(key, enc_key, rng)?;
        }

        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;
        Ok(res)
    }

    /// Removes `key` and returns its value, or `0` if it was absent.
    pub fn read_and_remove<R: Rng + CryptoRng>(
        &mut self,
        key: MapKey,
        enc_key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<MapVal, OdsError> {
        let start_accesses = self.sub_access_sum();
        let start_bytes = self.sub_bytes_sum();
        let pre_size = self.total_size_of_subs();

        let mut res = 0;
        for i in 0..2 {
            if self.skip_smaller_side(i) {
                continue;
            }
            let sub = self.subs[i].as_mut().expect("substructure must exist");
            res |= sub.read_and_remove(key, enc_key, rng)?;
        }

        if self.total_size_of_subs() < pre_size {
            self.size -= 1;
        }
        self.memory_access_count += self.sub_access_sum() - start_accesses;
        self.memory_bytes_moved_total += self.sub_bytes_sum() - start_bytes;
        Ok(res)
    }

    /// Queries skip the smaller side when it is absent or known to be
    /// empty (capacity at an exact power of two).
    fn skip_smaller_side(&self, i: usize) -> bool {
        i == 0 && (self.subs[0].is_none() || is_power_of_two(self.capacity))
    }

    fn smaller(&mut self) -> &mut PathOMap {
        self.subs[0].as_mut().expect("smaller substructure must exist")
    }

    fn larger(&mut self) -> &mut PathOMap {
        self.subs[1].as_mut().expect("larger substructure must exist")
    }

    fn total_size_of_subs(&self) -> usize {
        self.subs.iter().flatten().map(|sub| sub.size()).sum()
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
