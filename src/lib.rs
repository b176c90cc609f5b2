// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An implementation of oblivious data structures.
//!
//! The crate provides encrypted, access-pattern-hiding containers suitable
//! for outsourcing state to untrusted storage: a Path ORAM block store
//! ([`path_oram::PathOram`]), an AVL map ([`path_omap::OMap`]), a min-heap
//! ([`path_oheap::OHeap`]), a stack ([`ostack::OStack`]) and a queue
//! ([`oqueue::OQueue`]) laid over it, plus growable "stepping" variants of
//! the ORAM, map and heap in [`stepping`].
//!
//! The client holds a symmetric [`crypto::EncryptionKey`]; the server-side
//! state consists only of freshly re-encrypted bucket ciphertexts whose
//! access pattern is a function of the tree depth and the operation kind,
//! never of the keys involved.

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

pub mod bytes;
pub mod crypto;
pub mod oqueue;
pub mod ostack;
pub mod path_oheap;
pub mod path_omap;
pub mod path_oram;
pub mod stepping;
pub(crate) mod tree;

/// The leaf tag routing a block to a root-to-leaf path. Valid tags are
/// 1-based (`1..=N`); `0` marks a dummy block.
pub type Position = u32;

/// A client-space block identifier. `0` marks a dummy block.
pub type BlockId = u32;

/// The numeric type used to specify the byte length of ORAM block values.
pub type ValueSize = usize;

/// Errors produced by the oblivious data structures.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum OdsError {
    /// The requested configuration is unsupported (e.g. a capacity that is
    /// not a power of two).
    InvalidConfiguration,
    /// The underlying cipher or hash primitive failed.
    Crypto,
    /// A ciphertext is too short to carry an IV.
    MalformedCiphertext,
    /// A stored bucket's digest did not match its ciphertext: the server
    /// tampered with memory.
    Integrity,
}

impl std::fmt::Display for OdsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OdsError::InvalidConfiguration => write!(f, "invalid configuration"),
            OdsError::Crypto => write!(f, "cryptographic primitive failure"),
            OdsError::MalformedCiphertext => write!(f, "malformed ciphertext"),
            OdsError::Integrity => write!(f, "bucket integrity check failed"),
        }
    }
}

impl std::error::Error for OdsError {}
