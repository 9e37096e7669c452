use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use super::*;

fn id(n: u32) -> EventId {
    Sha256::digest(n.to_le_bytes()).into()
}

fn storage(items: impl IntoIterator<Item = (u64, EventId)>) -> Result<NegentropyStorageVector> {
    let mut storage = NegentropyStorageVector::new();
    for (timestamp, id) in items {
        storage.insert(timestamp, id)?;
    }
    storage.seal()?;
    Ok(storage)
}

struct SyncOutcome {
    have: BTreeSet<EventId>,
    need: BTreeSet<EventId>,
    rounds: usize,
}

/// Drive an initiator and a responder against each other until the initiator is done.
fn run_sync(
    client: NegentropyStorageVector,
    relay: NegentropyStorageVector,
    frame_size_limit: Option<usize>,
) -> Result<SyncOutcome> {
    let mut initiator = Negentropy::new(client, frame_size_limit)?;
    let mut responder = Negentropy::new(relay, frame_size_limit)?;

    let mut outcome = SyncOutcome {
        have: BTreeSet::new(),
        need: BTreeSet::new(),
        rounds: 0,
    };
    let mut msg = initiator.initiate()?;
    loop {
        if let Some(limit) = frame_size_limit {
            assert!(msg.len() <= limit, "initiator frame {} > {limit}", msg.len());
        }
        let reply = responder
            .reconcile(&msg)?
            .output
            .ok_or(Nip77Error::EmptyMessage)?;
        if let Some(limit) = frame_size_limit {
            assert!(reply.len() <= limit, "responder frame {} > {limit}", reply.len());
        }

        let step = initiator.reconcile(&reply)?;
        outcome.have.extend(step.have);
        outcome.need.extend(step.need);
        outcome.rounds += 1;
        assert!(outcome.rounds < 100, "sync did not terminate");

        match step.output {
            Some(next) => msg = next,
            None => return Ok(outcome),
        }
    }
}

#[test]
fn test_varint_encoding() {
    assert_eq!(encode_varint(0), vec![0]);
    assert_eq!(encode_varint(127), vec![127]);
    assert_eq!(encode_varint(128), vec![0x81, 0x00]);
    assert_eq!(encode_varint(300), vec![0x82, 0x2C]);
    assert_eq!(encode_varint(u64::MAX).len(), 10);
}

#[test]
fn test_varint_roundtrip() -> Result<()> {
    for value in [0, 1, 127, 128, 255, 16383, 16384, u64::MAX / 2, u64::MAX] {
        let encoded = encode_varint(value);
        let (decoded, len) = decode_varint(&encoded)?;
        assert_eq!(decoded, value);
        assert_eq!(len, encoded.len());
    }
    Ok(())
}

#[test]
fn test_varint_decode_errors() {
    struct Case {
        name: &'static str,
        input: Vec<u8>,
    }
    let cases = [
        Case {
            name: "empty",
            input: vec![],
        },
        Case {
            name: "incomplete",
            input: vec![0x81, 0x80],
        },
        Case {
            name: "overflow",
            input: vec![0xFF; 11],
        },
    ];
    for case in cases {
        assert!(
            matches!(decode_varint(&case.input), Err(Nip77Error::VarintDecode(_))),
            "{}",
            case.name
        );
    }
}

#[test]
fn test_varint_ignores_trailing_bytes() -> Result<()> {
    let (value, len) = decode_varint(&[0x82, 0x2C, 0xFF, 0xFF])?;
    assert_eq!((value, len), (300, 2));
    Ok(())
}

#[test]
fn test_fingerprint_is_order_independent_and_counts() {
    let a = id(1);
    let b = id(2);
    assert_eq!(calculate_fingerprint(&[a, b]), calculate_fingerprint(&[b, a]));
    assert_ne!(calculate_fingerprint(&[a]), calculate_fingerprint(&[a, a]));
    assert_ne!(
        calculate_fingerprint(std::iter::empty()),
        calculate_fingerprint(&[[0u8; 32]])
    );
}

#[test]
fn test_fingerprint_sum_wraps() {
    // 0xff.. + 0x01 wraps to zero, with a count of two.
    let mut one = [0u8; 32];
    one[0] = 1;
    let max = [0xFF; 32];
    let zero = [0u8; 32];
    assert_eq!(
        calculate_fingerprint(&[max, one]),
        calculate_fingerprint(&[zero, zero])
    );
}

#[test]
fn test_message_roundtrip_with_delta_timestamps() -> Result<()> {
    let msg = NegentropyMessage::new(vec![
        Range::skip(Bound::from_timestamp(100)),
        Range::fingerprint(Bound::new(150, vec![0xAB, 0xCD])?, [0x11; 16]),
        Range::id_list(Bound::infinity(), vec![id(1), id(2)]),
    ]);
    let encoded = msg.encode();
    assert_eq!(encoded[0], PROTOCOL_VERSION_1);
    // Timestamp delta + 1, empty prefix, skip mode.
    assert_eq!(&encoded[1..4], &[101, 0, 0]);

    let decoded = NegentropyMessage::decode_hex(&msg.encode_hex())?;
    assert_eq!(decoded, msg);
    Ok(())
}

#[test]
fn test_message_version_checks() {
    assert!(matches!(
        NegentropyMessage::decode(&[]),
        Err(Nip77Error::EmptyMessage)
    ));
    assert!(matches!(
        NegentropyMessage::decode(&[0x42]),
        Err(Nip77Error::InvalidProtocolVersion(0x42))
    ));
    assert!(matches!(
        NegentropyMessage::decode(&[0x62]),
        Err(Nip77Error::UnsupportedProtocolVersion(0x62))
    ));
}

#[test]
fn test_message_rejects_bad_mode_and_truncation() {
    assert!(matches!(
        NegentropyMessage::decode(&[PROTOCOL_VERSION_1, 0, 0, 7]),
        Err(Nip77Error::InvalidMode(7))
    ));
    assert!(matches!(
        NegentropyMessage::decode(&[PROTOCOL_VERSION_1, 0, 0, 1, 0xAA]),
        Err(Nip77Error::InvalidRange(_))
    ));
    assert!(matches!(
        NegentropyMessage::decode(&[PROTOCOL_VERSION_1, 0, 33]),
        Err(Nip77Error::InvalidBound(_))
    ));
}

#[test]
fn test_minimal_bound() {
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a[..3].copy_from_slice(&[1, 2, 3]);
    b[..3].copy_from_slice(&[1, 2, 4]);

    let same_ts = Bound::minimal(&Item::new(10, a), &Item::new(10, b));
    assert_eq!(same_ts.timestamp, 10);
    assert_eq!(same_ts.id_prefix, vec![1, 2, 4]);

    let different_ts = Bound::minimal(&Item::new(10, a), &Item::new(11, b));
    assert_eq!(different_ts, Bound::from_timestamp(11));
}

#[test]
fn test_storage_seal_and_lower_bound() -> Result<()> {
    let mut storage = NegentropyStorageVector::new();
    storage.insert(300, [3; 32])?;
    storage.insert(100, [2; 32])?;
    storage.insert(100, [1; 32])?;
    assert!(matches!(storage.slice(0, 1), Err(Nip77Error::NotSealed)));
    storage.seal()?;
    assert!(matches!(storage.insert(1, [0; 32]), Err(Nip77Error::AlreadySealed)));

    assert_eq!(storage.get(0), Some(&Item::new(100, [1; 32])));
    assert_eq!(storage.get(2), Some(&Item::new(300, [3; 32])));

    assert_eq!(storage.find_lower_bound(0, 3, &Bound::from_timestamp(100))?, 0);
    assert_eq!(storage.find_lower_bound(0, 3, &Bound::new(100, vec![2])?)?, 1);
    assert_eq!(storage.find_lower_bound(0, 3, &Bound::from_timestamp(101))?, 2);
    assert_eq!(storage.find_lower_bound(1, 3, &Bound::zero())?, 1);
    assert_eq!(storage.find_lower_bound(0, 3, &Bound::infinity())?, 3);
    Ok(())
}

#[test]
fn test_storage_rejects_duplicates() -> Result<()> {
    let mut storage = NegentropyStorageVector::new();
    storage.insert(1, [9; 32])?;
    storage.insert(1, [9; 32])?;
    assert!(matches!(storage.seal(), Err(Nip77Error::DuplicateItem)));
    Ok(())
}

#[test]
fn test_negentropy_requires_sealed_storage_and_sane_limit() -> Result<()> {
    assert!(matches!(
        Negentropy::new(NegentropyStorageVector::new(), None),
        Err(Nip77Error::NotSealed)
    ));
    assert!(matches!(
        Negentropy::new(storage([])?, Some(1024)),
        Err(Nip77Error::FrameSizeLimitTooSmall(1024))
    ));
    let mut neg = Negentropy::new(storage([])?, None)?;
    neg.initiate()?;
    assert!(matches!(neg.initiate(), Err(Nip77Error::AlreadyInitiated)));
    Ok(())
}

#[test]
fn test_initiate_small_set_sends_id_list() -> Result<()> {
    let mut neg = Negentropy::new(storage((0..5).map(|i| (u64::from(i), id(i))))?, None)?;
    let msg = NegentropyMessage::decode(&neg.initiate()?)?;
    assert_eq!(msg.ranges.len(), 1);
    assert_eq!(msg.ranges[0].upper_bound, Bound::infinity());
    assert!(matches!(&msg.ranges[0].payload, RangePayload::IdList(ids) if ids.len() == 5));
    Ok(())
}

#[test]
fn test_initiate_large_set_splits_into_buckets() -> Result<()> {
    let mut neg = Negentropy::new(storage((0..100).map(|i| (u64::from(i), id(i))))?, None)?;
    let msg = NegentropyMessage::decode(&neg.initiate()?)?;
    assert_eq!(msg.ranges.len(), 16);
    assert!(
        msg.ranges
            .iter()
            .all(|r| r.payload.mode() == RangeMode::Fingerprint)
    );
    assert_eq!(msg.ranges[15].upper_bound, Bound::infinity());
    // 100 = 6 * 16 + 4, so the first four buckets hold seven items.
    assert_eq!(msg.ranges[0].upper_bound, Bound::from_timestamp(7));
    Ok(())
}

#[test]
fn test_identical_sets_finish_in_one_round() -> Result<()> {
    let items: Vec<_> = (0..200).map(|i| (u64::from(i) * 10, id(i))).collect();
    let outcome = run_sync(storage(items.clone())?, storage(items)?, None)?;
    assert!(outcome.have.is_empty());
    assert!(outcome.need.is_empty());
    assert_eq!(outcome.rounds, 1);
    Ok(())
}

// Wire vectors worked out by hand from the reference protocol: delta
// timestamps (0 = infinity), mode 0/1/2 for skip/fingerprint/id list, and
// fingerprints as SHA-256(sum of ids mod 2^256 LE || varint count)[..16].
const EMPTY_INITIATE: &str = "6100000200";
const EMPTY_FINGERPRINT: &str = "7f9c9e31ac8256ca2f258583df262dbc";
const SINGLE_INITIATE: &str =
    "6100000201df3f619804a92fdb4057192dc43dd748ea778adc52bc498ce80524c014b81119";
const BUCKETED_INITIATE: [&str; 17] = [
    "61",
    "03000136b4ee031947510d28b5cdfb72582b9e",
    "0300012220ef3cccc38abce3a2fb8a85b09f6d",
    "030001bc25afdff8ed791449f9f75fb9167302",
    "030001ed056fd132bb70e6c71639459f077494",
    "030001169e8e49f432917cf84dc5fbfa92e6fe",
    "030001d44074107179c2acefe9fc97b3a1a13d",
    "03000148b294b312e53c2a987108e7b13d1c9e",
    "030001d544184253f6b36229b1b8417a93414f",
    "03000146811e83f11ece5df0f1b6d6d221751f",
    "030001ca5930a4eec0e861491427231a03d3e2",
    "0300013303daf2ac02892e51f8ca2504ccd2c5",
    "030001ab6eb2f15d6175c17c1aecc4930b47be",
    "030001cc990df95ab615ba3cf5da94241c7a90",
    "030001d42c52aa18fc06c2134f15a48c423c92",
    "0300018727c1d70b09eb20ba6dd9af53d890a9",
    "000001957e2fae56251f919b01d68a7e50b88a",
];

#[test]
fn test_initiate_matches_reference_wire_format() -> Result<()> {
    let mut empty = Negentropy::new(storage([])?, None)?;
    assert_eq!(hex::encode(empty.initiate()?), EMPTY_INITIATE);

    let mut single = Negentropy::new(storage([(1_678_011_277, id(0))])?, None)?;
    assert_eq!(hex::encode(single.initiate()?), SINGLE_INITIATE);

    // 32 items at timestamps 0..32: sixteen buckets of two, bounded by the
    // next bucket's timestamp (delta 2, encoded as 3).
    let mut bucketed = Negentropy::new(storage((0..32).map(|i| (u64::from(i), id(i))))?, None)?;
    assert_eq!(hex::encode(bucketed.initiate()?), BUCKETED_INITIATE.concat());
    Ok(())
}

#[test]
fn test_fingerprint_of_empty_set_matches_reference() {
    assert_eq!(
        hex::encode(calculate_fingerprint(std::iter::empty())),
        EMPTY_FINGERPRINT
    );
}

#[test]
fn test_relay_has_three_extra_events() -> Result<()> {
    let client: Vec<_> = (0..100).map(|i| (1_000 + u64::from(i), id(i))).collect();
    let mut relay = client.clone();
    let extra = [(1_050, id(500)), (1_200, id(501)), (999, id(502))];
    relay.extend(extra);

    let outcome = run_sync(storage(client)?, storage(relay)?, None)?;
    assert!(outcome.have.is_empty());
    assert_eq!(
        outcome.need,
        extra.iter().map(|(_, id)| *id).collect::<BTreeSet<_>>()
    );
    Ok(())
}

#[test]
fn test_both_sides_missing_events() -> Result<()> {
    let shared: Vec<_> = (0..1_000).map(|i| (u64::from(i / 3), id(i))).collect();
    let mut client = shared.clone();
    let mut relay = shared;
    client.extend((2_000..2_040).map(|i| (u64::from(i % 400), id(i))));
    relay.extend((3_000..3_025).map(|i| (u64::from(i % 500), id(i))));

    let outcome = run_sync(storage(client)?, storage(relay)?, None)?;
    assert_eq!(outcome.have, (2_000..2_040).map(id).collect());
    assert_eq!(outcome.need, (3_000..3_025).map(id).collect());
    Ok(())
}

#[test]
fn test_empty_client_downloads_everything() -> Result<()> {
    let relay: Vec<_> = (0..50).map(|i| (u64::from(i), id(i))).collect();
    let outcome = run_sync(storage([])?, storage(relay)?, None)?;
    assert_eq!(outcome.need.len(), 50);
    assert!(outcome.have.is_empty());
    Ok(())
}

#[test]
fn test_frame_size_limit_spreads_over_rounds() -> Result<()> {
    let relay: Vec<_> = (0..2_000).map(|i| (u64::from(i), id(i))).collect();
    let client: Vec<_> = (0..2_000)
        .filter(|i| i % 7 != 0)
        .map(|i| (u64::from(i), id(i)))
        .collect();

    let limited = run_sync(storage(client.clone())?, storage(relay.clone())?, Some(4_096))?;
    let unlimited = run_sync(storage(client)?, storage(relay)?, None)?;

    let expected: BTreeSet<EventId> = (0..2_000).filter(|i| i % 7 == 0).map(id).collect();
    assert_eq!(limited.need, expected);
    assert_eq!(unlimited.need, expected);
    assert!(limited.rounds > unlimited.rounds);
    Ok(())
}

#[test]
fn test_frame_size_limit_on_bulk_download() -> Result<()> {
    let relay: Vec<_> = (0..1_000).map(|i| (u64::from(i), id(i))).collect();
    let outcome = run_sync(storage([])?, storage(relay)?, Some(4_096))?;
    assert_eq!(outcome.need, (0..1_000).map(id).collect());
    Ok(())
}

#[test]
fn test_responder_answers_unsupported_version_with_its_own() -> Result<()> {
    let mut responder = Negentropy::new(storage([])?, None)?;
    let reply = responder.reconcile(&[0x62])?;
    assert_eq!(reply.output, Some(vec![PROTOCOL_VERSION_1]));

    let mut initiator = Negentropy::new(storage([])?, None)?;
    initiator.initiate()?;
    assert!(matches!(
        initiator.reconcile(&[0x62]),
        Err(Nip77Error::UnsupportedProtocolVersion(0x62))
    ));
    Ok(())
}
