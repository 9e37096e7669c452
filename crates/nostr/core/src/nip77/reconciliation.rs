use std::collections::HashSet;

use tracing::debug;

use super::error::{Nip77Error, Result};
use super::model::{
    Bound, EventId, ID_SIZE, MessageWriter, NegentropyMessage, PROTOCOL_VERSION_1, Range,
    RangePayload,
};
use super::storage::NegentropyStorageVector;

/// Ranges with fewer items than this are sent as id lists.
const BUCKETS: usize = 16;

/// Bytes kept free below the frame size limit.
const FRAME_HEADROOM: usize = 200;

/// Upper bound on the encoded size of a range header (bound, mode, count).
const RANGE_OVERHEAD: usize = 64;

pub const MIN_FRAME_SIZE_LIMIT: usize = 4096;

/// Result of one reconciliation step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Next message to send. `None` means the initiator is done.
    pub output: Option<Vec<u8>>,
    /// Ids we hold that the other side lacks (initiator only).
    pub have: Vec<EventId>,
    /// Ids the other side holds that we lack (initiator only).
    pub need: Vec<EventId>,
}

/// One side of a negentropy session over a sealed storage vector.
#[derive(Debug)]
pub struct Negentropy {
    storage: NegentropyStorageVector,
    frame_size_limit: Option<usize>,
    is_initiator: bool,
}

impl Negentropy {
    pub fn new(storage: NegentropyStorageVector, frame_size_limit: Option<usize>) -> Result<Self> {
        if !storage.is_sealed() {
            return Err(Nip77Error::NotSealed);
        }
        if let Some(limit) = frame_size_limit
            && limit < MIN_FRAME_SIZE_LIMIT
        {
            return Err(Nip77Error::FrameSizeLimitTooSmall(limit));
        }
        Ok(Self {
            storage,
            frame_size_limit,
            is_initiator: false,
        })
    }

    pub fn storage(&self) -> &NegentropyStorageVector {
        &self.storage
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Produce the opening message and take the initiator role.
    pub fn initiate(&mut self) -> Result<Vec<u8>> {
        if self.is_initiator {
            return Err(Nip77Error::AlreadyInitiated);
        }
        self.is_initiator = true;

        let mut out = MessageWriter::new(PROTOCOL_VERSION_1);
        self.split_range(0, self.storage.len(), &Bound::infinity(), &mut out)?;
        Ok(out.into_bytes())
    }

    /// Process a message from the other side.
    pub fn reconcile(&mut self, query: &[u8]) -> Result<Reconciled> {
        let message = match NegentropyMessage::decode(query) {
            Ok(message) => message,
            Err(Nip77Error::UnsupportedProtocolVersion(version)) if !self.is_initiator => {
                debug!(version, "unsupported negentropy version requested");
                return Ok(Reconciled {
                    output: Some(vec![PROTOCOL_VERSION_1]),
                    ..Reconciled::default()
                });
            }
            Err(e) => return Err(e),
        };

        let size = self.storage.len();
        let mut out = MessageWriter::new(PROTOCOL_VERSION_1);
        let mut result = Reconciled::default();

        let mut prev_bound = Bound::zero();
        let mut prev_index = 0;
        // Index matching the last bound actually written to `out`.
        let mut committed_index = 0;
        let mut skip = false;

        for range in &message.ranges {
            let checkpoint = out.checkpoint();
            let lower = prev_index;
            let mut upper = self
                .storage
                .find_lower_bound(prev_index, size, &range.upper_bound)?;
            let mut truncated = false;

            match &range.payload {
                RangePayload::Skip => skip = true,
                RangePayload::Fingerprint(theirs) => {
                    if *theirs == self.storage.fingerprint(lower, upper)? {
                        skip = true;
                    } else {
                        flush_skip(&mut out, &mut skip, &prev_bound);
                        self.split_range(lower, upper, &range.upper_bound, &mut out)?;
                    }
                }
                RangePayload::IdList(their_ids) => {
                    let ours = self.storage.slice(lower, upper)?;
                    if self.is_initiator {
                        let theirs: HashSet<&EventId> = their_ids.iter().collect();
                        let mine: HashSet<&EventId> = ours.iter().map(|item| &item.id).collect();
                        result.have.extend(
                            ours.iter()
                                .filter(|item| !theirs.contains(&item.id))
                                .map(|item| item.id),
                        );
                        result
                            .need
                            .extend(their_ids.iter().filter(|id| !mine.contains(id)).copied());
                        skip = true;
                    } else {
                        flush_skip(&mut out, &mut skip, &prev_bound);
                        let mut response = Vec::with_capacity(ours.len());
                        let mut end_bound = range.upper_bound.clone();
                        for (offset, item) in ours.iter().enumerate() {
                            let projected =
                                out.len() + (response.len() + 1) * ID_SIZE + RANGE_OVERHEAD;
                            if self.exceeded(projected) {
                                end_bound = Bound {
                                    timestamp: item.timestamp,
                                    id_prefix: item.id.to_vec(),
                                };
                                upper = lower + offset;
                                truncated = true;
                                break;
                            }
                            response.push(item.id);
                        }
                        out.write_range(&Range::id_list(end_bound, response));
                    }
                }
            }

            if truncated {
                committed_index = upper;
                self.write_remainder(committed_index, &mut out)?;
                break;
            }

            if self.exceeded(out.len()) {
                out.rollback(checkpoint);
                self.write_remainder(committed_index, &mut out)?;
                break;
            }

            if !skip {
                committed_index = upper;
            }
            prev_index = upper;
            prev_bound = range.upper_bound.clone();
        }

        let bytes = out.into_bytes();
        if self.is_initiator && bytes.len() == 1 {
            result.output = None;
        } else {
            result.output = Some(bytes);
        }
        Ok(result)
    }

    fn exceeded(&self, len: usize) -> bool {
        self.frame_size_limit
            .is_some_and(|limit| len > limit.saturating_sub(FRAME_HEADROOM))
    }

    /// Close the message with one fingerprint covering everything from `from` on.
    fn write_remainder(&self, from: usize, out: &mut MessageWriter) -> Result<()> {
        let fingerprint = self.storage.fingerprint(from, self.storage.len())?;
        out.write_range(&Range::fingerprint(Bound::infinity(), fingerprint));
        Ok(())
    }

    fn split_range(
        &self,
        lower: usize,
        upper: usize,
        upper_bound: &Bound,
        out: &mut MessageWriter,
    ) -> Result<()> {
        let items = self.storage.slice(lower, upper)?;
        let count = items.len();

        if count < BUCKETS * 2 {
            let ids = items.iter().map(|item| item.id).collect();
            out.write_range(&Range::id_list(upper_bound.clone(), ids));
            return Ok(());
        }

        let per_bucket = count / BUCKETS;
        let with_extra = count % BUCKETS;
        let mut curr = 0;
        for bucket in 0..BUCKETS {
            let bucket_size = per_bucket + usize::from(bucket < with_extra);
            let fingerprint = self
                .storage
                .fingerprint(lower + curr, lower + curr + bucket_size)?;
            curr += bucket_size;

            let next_bound = match (items.get(curr.wrapping_sub(1)), items.get(curr)) {
                (Some(prev), Some(next)) if curr < count => Bound::minimal(prev, next),
                _ => upper_bound.clone(),
            };
            out.write_range(&Range::fingerprint(next_bound, fingerprint));
        }
        Ok(())
    }
}

fn flush_skip(out: &mut MessageWriter, skip: &mut bool, bound: &Bound) {
    if *skip {
        *skip = false;
        out.write_range(&Range::skip(bound.clone()));
    }
}
