// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The symmetric crypto facade used to protect bucket contents.
//!
//! Buckets are encrypted with AES-256-CBC under a fresh random IV per
//! write; the IV travels appended to the ciphertext. A SHA-256 digest of
//! each ciphertext is stored next to it and doubles as a tamper check.
//! Any cipher with random nonces and a MAC-equivalent digest satisfies
//! this contract; the implementation here is interchangeable.

use crate::OdsError;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{CryptoRng, Rng};
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Byte length of an encryption key.
pub const KEY_SIZE: usize = 32;
/// Byte length of an initialization vector.
pub const IV_SIZE: usize = 16;
/// Byte length of a ciphertext digest.
pub const DIGEST_SIZE: usize = 32;
/// Block size of the underlying cipher.
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// A 256-bit symmetric encryption key held by the client.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generates a uniformly random key.
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// Generates a uniformly random IV.
pub fn generate_iv<R: Rng + CryptoRng>(rng: &mut R) -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rng.fill_bytes(&mut iv);
    iv
}

/// The ciphertext length produced by [`encrypt`] for a plaintext of
/// `plaintext_len` bytes: the PKCS#7-padded CBC output plus the trailing IV.
pub const fn ciphertext_len(plaintext_len: usize) -> usize {
    ((plaintext_len + CIPHER_BLOCK_SIZE) / CIPHER_BLOCK_SIZE) * CIPHER_BLOCK_SIZE + IV_SIZE
}

/// Computes the SHA-256 digest of `data`.
pub fn hash(data: &[u8]) -> [u8; DIGEST_SIZE] {
    Sha256::digest(data).into()
}

/// Encrypts `plaintext` under a fresh random IV.
///
/// The output layout is `CBC(plaintext) || IV`, so two encryptions of the
/// same plaintext differ byte-for-byte with overwhelming probability.
pub fn encrypt<R: Rng + CryptoRng>(
    plaintext: &[u8],
    key: &EncryptionKey,
    rng: &mut R,
) -> Result<Vec<u8>, OdsError> {
    let iv = generate_iv(rng);
    let mut ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    ciphertext.extend_from_slice(&iv);
    debug_assert_eq!(ciphertext.len(), ciphertext_len(plaintext.len()));
    Ok(ciphertext)
}

/// Decrypts a ciphertext produced by [`encrypt`], reading the IV from its
/// final [`IV_SIZE`] bytes.
pub fn decrypt(ciphertext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, OdsError> {
    if ciphertext.len() < IV_SIZE + CIPHER_BLOCK_SIZE {
        return Err(OdsError::MalformedCiphertext);
    }
    let (body, iv) = ciphertext.split_at(ciphertext.len() - IV_SIZE);
    let iv: [u8; IV_SIZE] = iv.try_into().map_err(|_| OdsError::MalformedCiphertext)?;
    Aes256CbcDec::new(key.as_bytes().into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(body)
        .map_err(|_| OdsError::Crypto)
}
