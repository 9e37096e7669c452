//! NIP-77: Negentropy Syncing
//!
//! Range-Based Set Reconciliation between a client and a relay. Both sides
//! hold a sorted set of `(created_at, id)` items; they exchange fingerprints of
//! ranges, split the ranges whose fingerprints disagree and finally swap id
//! lists for small ranges. Only ids cross the wire, never full events.
//!
//! Internal module boundaries:
//! - `error`: protocol error and result types
//! - `codec`: varint codec and a byte cursor
//! - `model`: bounds, ranges, messages and fingerprints
//! - `storage`: sealed sorted item vector
//! - `reconciliation`: the initiator/responder state machine
//!
//! ```text
//! Client                                  Relay
//!   |  NEG-OPEN (filter, initiate()) ----> |
//!   | <---- NEG-MSG (reconcile output)     |
//!   |  NEG-MSG (reconcile output) -------> |
//!   |  ...until the client has no output...|
//!   |  NEG-CLOSE ------------------------> |
//! ```
//!
//! References:
//! - NIP-77: <https://github.com/nostr-protocol/nips/blob/master/77.md>
//! - Negentropy Protocol: <https://github.com/hoytech/negentropy>

mod codec;
mod error;
mod model;
mod reconciliation;
mod storage;

pub use codec::{decode_varint, encode_varint};
pub use error::{Nip77Error, Result};
pub use model::{
    Bound, EventId, FINGERPRINT_SIZE, ID_SIZE, Item, NegentropyMessage, PROTOCOL_VERSION_1, Range,
    RangeMode, RangePayload, TIMESTAMP_INFINITY, calculate_fingerprint,
};
pub use reconciliation::{MIN_FRAME_SIZE_LIMIT, Negentropy, Reconciled};
pub use storage::NegentropyStorageVector;

#[cfg(test)]
mod tests;
