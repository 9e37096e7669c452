//! NIP-01 event model.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::secp256k1::{Message, Secp256k1, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::signer::{Signer, SignerError};

/// Errors raised while building or validating events.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("kind must be set")]
    MissingKind,

    #[error("pubkey must be set")]
    MissingPubkey,

    #[error("event id does not match content hash")]
    InvalidId,

    #[error("invalid public key: {0}")]
    InvalidPubkey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A signed event as exchanged with relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `key`.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(key))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}

/// An event that has not been signed yet. The id is already computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    /// Attach a hex signature.
    pub fn into_signed(self, sig: String) -> Event {
        Event {
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// An event together with the relays it was seen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub event: Event,
    pub relays: BTreeSet<String>,
}

impl TaggedEvent {
    pub fn new(event: Event, relay: Option<&str>) -> Self {
        Self {
            event,
            relays: relay.map(str::to_string).into_iter().collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.event.id
    }

    /// Merge provenance from another copy of the same event.
    pub fn merge_relays(&mut self, other: &TaggedEvent) -> bool {
        let before = self.relays.len();
        self.relays.extend(other.relays.iter().cloned());
        self.relays.len() != before
    }
}

impl From<Event> for TaggedEvent {
    fn from(event: Event) -> Self {
        Self::new(event, None)
    }
}

/// Compute the NIP-01 event id.
pub fn get_event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String, Nip01Error> {
    let payload = serde_json::to_string(&json!([0, pubkey, created_at, kind, tags, content]))?;
    Ok(hex::encode(Sha256::digest(payload.as_bytes())))
}

/// Check that the id matches the content and that the BIP-340 signature is valid.
pub fn verify_event(event: &Event) -> Result<(), Nip01Error> {
    let id = get_event_hash(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    )?;
    if id != event.id {
        return Err(Nip01Error::InvalidId);
    }

    let digest: [u8; 32] = hex::decode(&id)
        .map_err(|_| Nip01Error::InvalidId)?
        .try_into()
        .map_err(|_| Nip01Error::InvalidId)?;
    let pubkey_bytes =
        hex::decode(&event.pubkey).map_err(|e| Nip01Error::InvalidPubkey(e.to_string()))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| Nip01Error::InvalidPubkey(e.to_string()))?;
    let sig_bytes =
        hex::decode(&event.sig).map_err(|e| Nip01Error::InvalidSignature(e.to_string()))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| Nip01Error::InvalidSignature(e.to_string()))?;

    Secp256k1::verification_only()
        .verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
        .map_err(|e| Nip01Error::InvalidSignature(e.to_string()))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Builder for new events.
#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    kind: Option<u16>,
    content: Option<String>,
    created_at: Option<u64>,
    pubkey: Option<String>,
    tags: Vec<Vec<String>>,
}

impl EventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn pubkey(mut self, pubkey: impl Into<String>) -> Self {
        self.pubkey = Some(pubkey.into());
        self
    }

    /// Add a tag. Exact duplicates of an existing tag are ignored.
    pub fn tag<I, S>(mut self, tag: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tag: Vec<String> = tag.into_iter().map(Into::into).collect();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn tags(&self) -> &[Vec<String>] {
        &self.tags
    }

    /// Produce the unsigned event with its id. Tags are ordered by name.
    pub fn build(self) -> Result<UnsignedEvent, Nip01Error> {
        let kind = self.kind.ok_or(Nip01Error::MissingKind)?;
        let pubkey = self.pubkey.ok_or(Nip01Error::MissingPubkey)?;
        let created_at = self.created_at.unwrap_or_else(unix_now);
        let content = self.content.unwrap_or_default();
        let mut tags = self.tags;
        tags.sort_by(|a, b| a.first().cmp(&b.first()));

        let id = get_event_hash(&pubkey, created_at, kind, &tags, &content)?;
        Ok(UnsignedEvent {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
        })
    }

    /// Take the pubkey from the signer, build and sign.
    pub async fn build_and_sign(self, signer: &dyn Signer) -> Result<Event, SignerError> {
        let pubkey = signer.get_public_key().await?;
        let unsigned = self.pubkey(pubkey).build()?;
        signer.sign(unsigned).await
    }
}
