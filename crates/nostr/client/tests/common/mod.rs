//! In-memory relays and a local signer shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bitcoin::secp256k1::{Keypair, Message, Secp256k1};
use nostr::{
    Event, EventBuilder, Filter, Negentropy, NegentropyStorageVector, Signer, SignerError,
    UnsignedEvent, event_matches_filter, normalize_relay_url,
};
use nostr_client::{ChannelPeer, ChannelTransport};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long a test waits for a single frame.
pub const FRAME_WAIT: Duration = Duration::from_secs(5);

/// BIP-340 signer over a fixed secret key.
pub struct LocalSigner {
    keypair: Keypair,
}

impl LocalSigner {
    pub fn new(secret: [u8; 32]) -> Result<Self> {
        let keypair = Keypair::from_seckey_slice(&Secp256k1::new(), &secret)?;
        Ok(Self { keypair })
    }

    pub fn public_key(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    fn sign_unsigned(&self, event: UnsignedEvent) -> Result<Event, SignerError> {
        let digest: [u8; 32] = hex::decode(&event.id)
            .map_err(|e| SignerError::Crypto(e.to_string()))?
            .try_into()
            .map_err(|_| SignerError::Crypto("event id is not 32 bytes".to_string()))?;
        let sig = Secp256k1::new()
            .sign_schnorr_no_aux_rand(&Message::from_digest(digest), &self.keypair);
        Ok(event.into_signed(hex::encode(sig.serialize())))
    }

    /// Signed event with no tags.
    pub fn note(&self, kind: u16, created_at: u64, content: &str) -> Result<Event> {
        let unsigned = EventBuilder::new()
            .kind(kind)
            .created_at(created_at)
            .content(content)
            .pubkey(self.public_key())
            .build()?;
        Ok(self.sign_unsigned(unsigned)?)
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn get_public_key(&self) -> Result<String, SignerError> {
        Ok(self.public_key())
    }

    async fn sign(&self, event: UnsignedEvent) -> Result<Event, SignerError> {
        self.sign_unsigned(event)
    }

    async fn encrypt(&self, _plaintext: &str, _counterparty: &str) -> Result<String, SignerError> {
        Err(SignerError::Unsupported("encrypt"))
    }

    async fn decrypt(&self, _ciphertext: &str, _counterparty: &str) -> Result<String, SignerError> {
        Err(SignerError::Unsupported("decrypt"))
    }
}

/// What every fake relay supports.
#[derive(Debug, Clone, Default)]
pub struct RelayBehavior {
    pub negentropy: bool,
    /// Sent as `["AUTH", challenge]` right after a client connects.
    pub auth_challenge: Option<String>,
    /// Relays that take every frame and never answer.
    pub silent: Vec<String>,
}

/// A frame a client wrote to a fake relay.
#[derive(Debug, Clone)]
pub struct Frame {
    pub relay: String,
    pub value: Value,
}

type Stores = Arc<Mutex<HashMap<String, Vec<Event>>>>;

/// Relays behind a [`ChannelTransport`]. Each address has its own store.
pub struct FakeNetwork {
    pub transport: Arc<ChannelTransport>,
    stores: Stores,
    frames: mpsc::UnboundedReceiver<Frame>,
}

impl FakeNetwork {
    pub fn start(behavior: RelayBehavior) -> Self {
        let (transport, mut accepted) = ChannelTransport::new();
        let stores: Stores = Arc::default();
        let (frames_tx, frames) = mpsc::unbounded_channel();

        let shared = Arc::clone(&stores);
        tokio::spawn(async move {
            while let Some(peer) = accepted.recv().await {
                let stores = Arc::clone(&shared);
                let behavior = behavior.clone();
                let frames_tx = frames_tx.clone();
                tokio::spawn(async move {
                    let _ = serve(peer, stores, behavior, frames_tx).await;
                });
            }
        });

        Self {
            transport: Arc::new(transport),
            stores,
            frames,
        }
    }

    /// Add events to the store of `relay`.
    pub fn seed(&self, relay: &str, events: impl IntoIterator<Item = Event>) {
        lock_stores(&self.stores)
            .entry(store_key(relay))
            .or_default()
            .extend(events);
    }

    pub fn stored(&self, relay: &str) -> Vec<Event> {
        lock_stores(&self.stores)
            .get(&store_key(relay))
            .cloned()
            .unwrap_or_default()
    }

    /// Next frame with the given verb, skipping others.
    pub async fn next_frame(&mut self, verb: &str) -> Result<Frame> {
        let frames = &mut self.frames;
        timeout(FRAME_WAIT, async {
            while let Some(frame) = frames.recv().await {
                if frame.value[0] == verb {
                    return Some(frame);
                }
            }
            None
        })
        .await
        .with_context(|| format!("no {verb} frame arrived"))?
        .ok_or_else(|| anyhow!("relay network stopped"))
    }

    /// Next frame with the given verb sent to `relay`.
    pub async fn next_frame_to(&mut self, relay: &str, verb: &str) -> Result<Frame> {
        let relay = store_key(relay);
        loop {
            let frame = self.next_frame(verb).await?;
            if frame.relay == relay {
                return Ok(frame);
            }
        }
    }
}

fn store_key(relay: &str) -> String {
    normalize_relay_url(relay).unwrap_or_else(|| relay.to_string())
}

fn lock_stores(stores: &Stores) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Event>>> {
    stores.lock().unwrap_or_else(PoisonError::into_inner)
}

fn matching(stores: &Stores, relay: &str, filters: &[Filter]) -> Vec<Event> {
    lock_stores(stores)
        .get(relay)
        .map(|events| {
            events
                .iter()
                .filter(|event| filters.iter().any(|filter| event_matches_filter(event, filter)))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn parse_filters(value: &Value) -> Vec<Filter> {
    match value {
        Value::Array(many) => many
            .iter()
            .filter_map(|f| serde_json::from_value(f.clone()).ok())
            .collect(),
        one => serde_json::from_value::<Filter>(one.clone())
            .into_iter()
            .collect(),
    }
}

fn responder(events: &[Event]) -> Result<Negentropy> {
    let mut storage = NegentropyStorageVector::with_capacity(events.len());
    for event in events {
        let id: [u8; 32] = hex::decode(&event.id)?
            .try_into()
            .map_err(|_| anyhow!("event id is not 32 bytes"))?;
        storage.insert(event.created_at, id)?;
    }
    storage.seal()?;
    Ok(Negentropy::new(storage, None)?)
}

fn neg_reply(session: &mut Negentropy, payload: &Value) -> Result<String> {
    let bytes = hex::decode(payload.as_str().unwrap_or_default())?;
    let reply = session
        .reconcile(&bytes)?
        .output
        .ok_or_else(|| anyhow!("responder has nothing to say"))?;
    Ok(hex::encode(reply))
}

async fn serve(
    mut peer: ChannelPeer,
    stores: Stores,
    behavior: RelayBehavior,
    frames: mpsc::UnboundedSender<Frame>,
) -> Result<()> {
    let relay = store_key(&peer.address);
    let silent = behavior.silent.iter().any(|address| store_key(address) == relay);
    if let Some(challenge) = &behavior.auth_challenge {
        peer.send_json(&json!(["AUTH", challenge]));
    }

    let mut sessions: HashMap<String, Negentropy> = HashMap::new();
    while let Some(value) = peer.recv_json().await {
        let _ = frames.send(Frame {
            relay: relay.clone(),
            value: value.clone(),
        });
        if silent {
            continue;
        }
        let sub = value[1].clone();
        match value[0].as_str() {
            Some("REQ") => {
                let filters: Vec<Filter> = value
                    .as_array()
                    .map(|frame| frame.iter().skip(2).flat_map(parse_filters).collect())
                    .unwrap_or_default();
                for event in matching(&stores, &relay, &filters) {
                    peer.send_json(&json!(["EVENT", sub, event]));
                }
                peer.send_json(&json!(["EOSE", sub]));
            }
            Some("EVENT") => {
                let event: Event = serde_json::from_value(sub)?;
                let id = event.id.clone();
                lock_stores(&stores).entry(relay.clone()).or_default().push(event);
                peer.send_json(&json!(["OK", id, true, ""]));
            }
            Some("NEG-OPEN") => {
                let Some(id) = sub.as_str().map(str::to_string) else {
                    continue;
                };
                if !behavior.negentropy {
                    peer.send_json(&json!(["NEG-ERR", id, "blocked: negentropy disabled"]));
                    continue;
                }
                let local = matching(&stores, &relay, &parse_filters(&value[2]));
                let mut session = responder(&local)?;
                let reply = neg_reply(&mut session, &value[3])?;
                peer.send_json(&json!(["NEG-MSG", id, reply]));
                sessions.insert(id, session);
            }
            Some("NEG-MSG") => {
                let Some(id) = sub.as_str() else {
                    continue;
                };
                if let Some(session) = sessions.get_mut(id) {
                    let reply = neg_reply(session, &value[2])?;
                    peer.send_json(&json!(["NEG-MSG", id, reply]));
                }
            }
            Some("NEG-CLOSE") => {
                if let Some(id) = sub.as_str() {
                    sessions.remove(id);
                }
            }
            _ => {}
        }
    }
    Ok(())
}
