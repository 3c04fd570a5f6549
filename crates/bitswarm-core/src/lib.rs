//! bitswarm-core — shared types, wire format, and configuration.
//! All other Bitswarm crates depend on this one.

pub mod cid;
pub mod config;
pub mod crypto;
pub mod message;
pub mod peer;
pub mod varint;
pub mod wire;

pub use cid::{Block, CidPrefix, Codec, ContentId};
pub use message::{Message, Presence, WantEntry, WantType};
pub use peer::PeerId;
