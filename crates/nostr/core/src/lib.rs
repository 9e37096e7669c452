//! Nostr protocol primitives for the relay query engine.
//!
//! - `nip01`: event model, id hashing, signature checks, event builder
//! - `filter`: sparse query descriptors and client-side matching
//! - `optimizer`: filter algebra (expand, merge, diff, compress)
//! - `nip77`: negentropy range-based set reconciliation
//! - `relay_url`: relay address normalization
//! - `signer`: the signing capability consumed by the client

pub mod filter;
pub mod nip01;
pub mod nip77;
pub mod optimizer;
pub mod relay_url;
pub mod signer;

pub use filter::{Filter, FilterError, FlatFilter, TagKey, event_matches_filter, trim_filters};
pub use nip01::{
    Event, EventBuilder, Nip01Error, TaggedEvent, UnsignedEvent, get_event_hash, verify_event,
};
pub use nip77::{
    Bound, EventId, Item, Negentropy, NegentropyMessage, NegentropyStorageVector, Nip77Error,
    PROTOCOL_VERSION_1, Range, RangeMode, RangePayload, Reconciled, TIMESTAMP_INFINITY,
    calculate_fingerprint,
};
pub use optimizer::{
    DefaultOptimizer, Optimizer, compress, distance, expand_filter, filter_includes, flat_merge,
    get_diff, merge_similar,
};
pub use relay_url::normalize_relay_url;
pub use signer::{Signer, SignerError, decrypt_content};
