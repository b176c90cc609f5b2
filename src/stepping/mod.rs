// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Growable ("stepping") variants of the static structures.
//!
//! A stepping container holds up to two static substructures with
//! capacities `2^k` and `2^(k+1)` and realises every capacity in between
//! by migrating one element per `grow` step (two per `shrink` step) from
//! the smaller into the larger. Each step performs a fixed number of
//! static-structure operations, dummying the side that has no work, so
//! the access pattern is a function of the public capacity only.

mod oheap;
mod omap;
mod oram;

pub use oheap::OHeap;
pub use omap::OMap;
pub use oram::{Block, ORam};

pub(crate) fn is_power_of_two(x: usize) -> bool {
    x & (x.wrapping_sub(1)) == 0
}

#[cfg(test)]
mod tests {
    use super::is_power_of_two;

    #[test]
    fn test_is_power_of_two() {
        // Zero counts as a power of two here: it marks the empty state.
        assert!(is_power_of_two(0));
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(2));
        assert!(is_power_of_two(64));
        assert!(!is_power_of_two(3));
        assert!(!is_power_of_two(6));
        assert!(!is_power_of_two(96));
    }
}
