//! Content identifiers and blocks.
//!
//! A `ContentId` names a block by the BLAKE3 digest of its bytes plus a
//! codec tag describing how the bytes are interpreted. Identifiers are
//! compared and ordered by their encoded form, so they can key sorted maps
//! and sets directly.
//!
//! Encoded layout:
//!
//! ```text
//! version (1 byte) | codec (uvarint) | hash code (uvarint) | digest len (uvarint) | digest
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::crypto::{self, BLAKE3_CODE, DIGEST_LEN};
use crate::varint::{decode_uvarint, encode_uvarint};
use crate::wire::WireError;

/// The only CID version Bitswarm produces or accepts.
pub const CID_VERSION: u8 = 1;

// ── Codec ─────────────────────────────────────────────────────────────────────

/// How the bytes of a block are to be interpreted by higher layers.
///
/// The exchange layer never looks inside a block; the codec only matters
/// because it is part of the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u64)]
pub enum Codec {
    /// Opaque bytes.
    Raw = 0x55,
    /// Protobuf-encoded DAG node.
    DagProtobuf = 0x70,
    /// CBOR-encoded DAG node.
    DagCbor = 0x71,
}

impl TryFrom<u64> for Codec {
    type Error = WireError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0x55 => Ok(Codec::Raw),
            0x70 => Ok(Codec::DagProtobuf),
            0x71 => Ok(Codec::DagCbor),
            other => Err(WireError::UnknownCodec(other)),
        }
    }
}

impl From<Codec> for u64 {
    fn from(c: Codec) -> u64 {
        c as u64
    }
}

// ── ContentId ─────────────────────────────────────────────────────────────────

/// Immutable content identifier: {digest, codec, version}.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId {
    version: u8,
    codec: Codec,
    digest: [u8; 32],
}

impl ContentId {
    /// Build an identifier from an already-computed digest.
    pub fn new(codec: Codec, digest: [u8; 32]) -> Self {
        Self {
            version: CID_VERSION,
            codec,
            digest,
        }
    }

    /// Hash `data` and return its identifier.
    pub fn for_data(codec: Codec, data: &[u8]) -> Self {
        Self::new(codec, crypto::hash(data))
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// The prefix needed to recompute this identifier from block data.
    pub fn prefix(&self) -> CidPrefix {
        CidPrefix {
            version: self.version,
            codec: self.codec,
        }
    }

    /// Encoded bytes. This is the canonical form for equality and ordering.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + DIGEST_LEN);
        out.push(self.version);
        encode_uvarint(self.codec.into(), &mut out);
        encode_uvarint(BLAKE3_CODE, &mut out);
        encode_uvarint(DIGEST_LEN as u64, &mut out);
        out.extend_from_slice(&self.digest);
        out
    }

    /// Parse an encoded identifier. The whole slice must be consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let (version, rest) = bytes.split_first().ok_or(WireError::Truncated)?;
        if *version != CID_VERSION {
            return Err(WireError::UnsupportedCidVersion(*version));
        }

        let (codec, used) = decode_uvarint(rest)?;
        let rest = &rest[used..];
        let codec = Codec::try_from(codec)?;

        let (hash_code, used) = decode_uvarint(rest)?;
        let rest = &rest[used..];
        if hash_code != BLAKE3_CODE {
            return Err(WireError::UnknownHash(hash_code));
        }

        let (len, used) = decode_uvarint(rest)?;
        let rest = &rest[used..];
        if len != DIGEST_LEN as u64 || rest.len() != DIGEST_LEN {
            return Err(WireError::InvalidCid("digest length mismatch"));
        }

        let mut digest = [0u8; 32];
        digest.copy_from_slice(rest);
        Ok(Self::new(codec, digest))
    }

    /// First eight hex characters of the digest, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.digest[..4])
    }
}

impl Ord for ContentId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl PartialOrd for ContentId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({self})")
    }
}

impl FromStr for ContentId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| WireError::InvalidCid("not hex"))?;
        Self::from_bytes(&bytes)
    }
}

// ── Prefix ────────────────────────────────────────────────────────────────────

/// Everything in a CID except the digest.
///
/// Blocks travel on the wire as (prefix, data); the receiver recomputes the
/// identifier rather than trusting one supplied by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidPrefix {
    pub version: u8,
    pub codec: Codec,
}

impl CidPrefix {
    /// Hash `data` under this prefix.
    pub fn sum(&self, data: &[u8]) -> ContentId {
        ContentId {
            version: self.version,
            codec: self.codec,
            digest: crypto::hash(data),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6);
        out.push(self.version);
        encode_uvarint(self.codec.into(), &mut out);
        encode_uvarint(BLAKE3_CODE, &mut out);
        encode_uvarint(DIGEST_LEN as u64, &mut out);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let (version, rest) = bytes.split_first().ok_or(WireError::Truncated)?;
        if *version != CID_VERSION {
            return Err(WireError::UnsupportedCidVersion(*version));
        }
        let (codec, used) = decode_uvarint(rest)?;
        let rest = &rest[used..];
        let codec = Codec::try_from(codec)?;
        let (hash_code, used) = decode_uvarint(rest)?;
        if hash_code != BLAKE3_CODE {
            return Err(WireError::UnknownHash(hash_code));
        }
        let (len, used_len) = decode_uvarint(&rest[used..])?;
        if len != DIGEST_LEN as u64 || rest.len() != used + used_len {
            return Err(WireError::InvalidCid("malformed prefix"));
        }
        Ok(Self {
            version: *version,
            codec,
        })
    }
}

// ── Block ─────────────────────────────────────────────────────────────────────

/// An immutable block: identifier plus raw bytes.
///
/// The exchange layer assumes `cid == hash(data)`. Block stores check it on
/// ingest via [`Block::verify`].
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    cid: ContentId,
    data: Bytes,
}

impl Block {
    /// Hash `data` and wrap it as a block.
    pub fn new(codec: Codec, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            cid: ContentId::for_data(codec, &data),
            data,
        }
    }

    /// Pair data with a known identifier without rehashing.
    pub fn with_cid(cid: ContentId, data: impl Into<Bytes>) -> Self {
        Self {
            cid,
            data: data.into(),
        }
    }

    pub fn cid(&self) -> &ContentId {
        &self.cid
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when the identifier matches the data.
    pub fn verify(&self) -> bool {
        self.cid.prefix().sum(&self.data) == self.cid
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("cid", &self.cid)
            .field("len", &self.data.len())
            .finish()
    }
}
