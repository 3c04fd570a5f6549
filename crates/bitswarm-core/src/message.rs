//! Want-list messages, the unit of exchange between peers.
//!
//! A single message can carry both sides of the protocol at once: wants
//! (and cancels) the sender is asking for, plus blocks, HAVEs, and
//! DONT_HAVEs it is answering with.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cid::{Block, CidPrefix, ContentId};
use crate::wire::{WireError, MAX_BLOCK_SIZE};

/// Whether a want asks for the block itself or only whether the peer has it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WantType {
    Have,
    Block,
}

/// One want-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantEntry {
    pub cid: ContentId,
    /// Higher is more urgent.
    pub priority: i32,
    pub want_type: WantType,
    /// Withdraws an earlier want for the same CID.
    pub cancel: bool,
    /// The sender wants an explicit DONT_HAVE if the block is absent.
    pub send_dont_have: bool,
}

/// A block presence announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Have,
    DontHave,
}

/// A want-list message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    wantlist: Vec<WantEntry>,
    blocks: Vec<Block>,
    presences: BTreeMap<ContentId, Presence>,
    pending_bytes: i32,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask whether the receiver has each CID. Priorities descend from
    /// `i32::MAX` in list order.
    pub fn want_haves(cids: &[ContentId]) -> Self {
        let mut msg = Self::new();
        for (priority, cid) in descending_priorities(cids) {
            msg.add_entry(*cid, priority, WantType::Have, false);
        }
        msg
    }

    /// Ask for the blocks themselves, with DONT_HAVE requested for misses.
    pub fn want_blocks(cids: &[ContentId]) -> Self {
        let mut msg = Self::new();
        for (priority, cid) in descending_priorities(cids) {
            msg.add_entry(*cid, priority, WantType::Block, true);
        }
        msg
    }

    /// Add a want. Returns true if this created a new entry rather than
    /// merging into an existing one.
    pub fn add_entry(
        &mut self,
        cid: ContentId,
        priority: i32,
        want_type: WantType,
        send_dont_have: bool,
    ) -> bool {
        self.merge_entry(WantEntry {
            cid,
            priority,
            want_type,
            cancel: false,
            send_dont_have,
        })
    }

    /// Add a CANCEL for `cid`.
    pub fn cancel(&mut self, cid: ContentId) -> bool {
        self.merge_entry(WantEntry {
            cid,
            priority: 0,
            want_type: WantType::Block,
            cancel: true,
            send_dont_have: false,
        })
    }

    fn merge_entry(&mut self, entry: WantEntry) -> bool {
        let Some(existing) = self.wantlist.iter_mut().find(|e| e.cid == entry.cid) else {
            self.wantlist.push(entry);
            return true;
        };

        if existing.want_type == entry.want_type {
            existing.priority = entry.priority;
        }
        // cancel and send_dont_have only ever flip on
        existing.cancel |= entry.cancel;
        existing.send_dont_have |= entry.send_dont_have;
        if entry.want_type == WantType::Block {
            existing.want_type = WantType::Block;
        }
        false
    }

    /// Drop any want-list entry for `cid`.
    pub fn remove(&mut self, cid: &ContentId) {
        self.wantlist.retain(|e| e.cid != *cid);
    }

    /// Attach a block. Supersedes any HAVE/DONT_HAVE for the same CID.
    pub fn add_block(&mut self, block: Block) {
        self.presences.remove(block.cid());
        if !self.blocks.iter().any(|b| b.cid() == block.cid()) {
            self.blocks.push(block);
        }
    }

    pub fn add_have(&mut self, cid: ContentId) {
        self.add_presence(cid, Presence::Have);
    }

    pub fn add_dont_have(&mut self, cid: ContentId) {
        self.add_presence(cid, Presence::DontHave);
    }

    fn add_presence(&mut self, cid: ContentId, presence: Presence) {
        if self.blocks.iter().any(|b| *b.cid() == cid) {
            return;
        }
        self.presences.insert(cid, presence);
    }

    pub fn set_pending_bytes(&mut self, pending: i32) {
        self.pending_bytes = pending;
    }

    pub fn wantlist(&self) -> &[WantEntry] {
        &self.wantlist
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn haves(&self) -> Vec<ContentId> {
        self.presences_of(Presence::Have)
    }

    pub fn dont_haves(&self) -> Vec<ContentId> {
        self.presences_of(Presence::DontHave)
    }

    fn presences_of(&self, kind: Presence) -> Vec<ContentId> {
        self.presences
            .iter()
            .filter(|(_, p)| **p == kind)
            .map(|(cid, _)| *cid)
            .collect()
    }

    pub fn pending_bytes(&self) -> i32 {
        self.pending_bytes
    }

    /// True when the message carries nothing worth sending.
    pub fn is_empty(&self) -> bool {
        self.wantlist.is_empty() && self.blocks.is_empty() && self.presences.is_empty()
    }

    /// Serialize to a payload body (unframed).
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let wire = WireMessage {
            wantlist: self
                .wantlist
                .iter()
                .map(|e| WireEntry {
                    block: e.cid.to_bytes(),
                    priority: e.priority,
                    want_type: e.want_type,
                    cancel: e.cancel,
                    send_dont_have: e.send_dont_have,
                })
                .collect(),
            payload: self
                .blocks
                .iter()
                .map(|b| WireBlock {
                    prefix: b.cid().prefix().to_bytes(),
                    data: b.data().to_vec(),
                })
                .collect(),
            presences: self
                .presences
                .iter()
                .map(|(cid, kind)| WirePresence {
                    cid: cid.to_bytes(),
                    kind: *kind,
                })
                .collect(),
            pending_bytes: self.pending_bytes,
        };
        serde_json::to_vec(&wire).map_err(|e| WireError::Payload(e.to_string()))
    }

    /// Parse a payload body. Block identifiers are recomputed from the data.
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let wire: WireMessage =
            serde_json::from_slice(body).map_err(|e| WireError::Payload(e.to_string()))?;

        let mut msg = Message::new();
        for entry in wire.wantlist {
            msg.merge_entry(WantEntry {
                cid: ContentId::from_bytes(&entry.block)?,
                priority: entry.priority,
                want_type: entry.want_type,
                cancel: entry.cancel,
                send_dont_have: entry.send_dont_have,
            });
        }
        for block in wire.payload {
            if block.data.len() > MAX_BLOCK_SIZE {
                return Err(WireError::BlockTooLarge(block.data.len()));
            }
            let prefix = CidPrefix::from_bytes(&block.prefix)?;
            let cid = prefix.sum(&block.data);
            msg.add_block(Block::with_cid(cid, block.data));
        }
        for presence in wire.presences {
            let cid = ContentId::from_bytes(&presence.cid)?;
            msg.add_presence(cid, presence.kind);
        }
        msg.pending_bytes = wire.pending_bytes;
        Ok(msg)
    }
}

fn descending_priorities(cids: &[ContentId]) -> impl Iterator<Item = (i32, &ContentId)> {
    cids.iter()
        .enumerate()
        .map(|(i, cid)| (i32::MAX.saturating_sub(i as i32), cid))
}

// ── Payload encoding ──────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(default)]
    wantlist: Vec<WireEntry>,
    #[serde(default)]
    payload: Vec<WireBlock>,
    #[serde(default)]
    presences: Vec<WirePresence>,
    #[serde(default)]
    pending_bytes: i32,
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    #[serde(with = "hex_bytes")]
    block: Vec<u8>,
    priority: i32,
    want_type: WantType,
    #[serde(default)]
    cancel: bool,
    #[serde(default)]
    send_dont_have: bool,
}

#[derive(Serialize, Deserialize)]
struct WireBlock {
    #[serde(with = "hex_bytes")]
    prefix: Vec<u8>,
    #[serde(with = "hex_bytes")]
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WirePresence {
    #[serde(with = "hex_bytes")]
    cid: Vec<u8>,
    #[serde(rename = "type")]
    kind: Presence,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
