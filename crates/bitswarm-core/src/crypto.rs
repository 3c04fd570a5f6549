//! Hashing primitives for Bitswarm.
//!
//! Every content identifier is a BLAKE3 digest of the block bytes. Peer
//! identities are BLAKE3 digests of random seed material.

use rand::RngCore;

/// Multihash code for BLAKE3-256.
pub const BLAKE3_CODE: u64 = 0x1e;

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 32;

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// 32 bytes of fresh randomness, run through BLAKE3.
pub fn random_digest() -> [u8; 32] {
    let mut seed = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut seed);
    hash(&seed)
}
