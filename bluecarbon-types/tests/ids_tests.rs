use bluecarbon_types::{EntityId, QueueItemId, RequestId};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;
use std::str::FromStr;

// ── EntityId ──────────────────────────────────────────────────────

#[test]
fn entity_id_numeric_and_string_forms_are_equal() {
    let a = EntityId::from_json(&json!(7)).unwrap();
    let b = EntityId::from_json(&json!("7")).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_str(), "7");
}

#[test]
fn entity_id_from_payload_reads_id_field() {
    let payload = json!({"id": "proj-1", "name": "Mangrove"});
    assert_eq!(EntityId::from_payload(&payload), Some(EntityId::from("proj-1")));
}

#[test]
fn entity_id_from_payload_missing_or_invalid() {
    assert!(EntityId::from_payload(&json!({"name": "x"})).is_none());
    assert!(EntityId::from_payload(&json!({"id": null})).is_none());
    assert!(EntityId::from_payload(&json!({"id": ""})).is_none());
    assert!(EntityId::from_payload(&json!({"id": [1]})).is_none());
    assert!(EntityId::from_payload(&json!([1, 2])).is_none());
}

#[test]
fn entity_id_serializes_as_plain_string() {
    let id = EntityId::from(42u64);
    assert_eq!(serde_json::to_string(&id).unwrap(), "\"42\"");
    let parsed: EntityId = serde_json::from_str("\"42\"").unwrap();
    assert_eq!(parsed, id);
}

#[test]
fn entity_id_hash_and_eq() {
    let mut set = HashSet::new();
    set.insert(EntityId::new("a"));
    set.insert(EntityId::new("a"));
    set.insert(EntityId::new("b"));
    assert_eq!(set.len(), 2);
}

// ── QueueItemId ───────────────────────────────────────────────────

#[test]
fn queue_item_id_next_is_monotonic() {
    let id = QueueItemId::new(9);
    assert_eq!(id.next().get(), 10);
    assert!(id.next() > id);
}

#[test]
fn queue_item_id_key_is_fixed_width() {
    assert_eq!(QueueItemId::new(3).to_key(), "00000000000000000003");
    assert_eq!(QueueItemId::new(3).to_key().len(), 20);
}

#[test]
fn queue_item_id_parse() {
    assert_eq!(QueueItemId::from_str("12").unwrap(), QueueItemId::new(12));
    assert_eq!(QueueItemId::from_str(" 12 ").unwrap(), QueueItemId::new(12));
    assert!(QueueItemId::from_str("twelve").is_err());
}

proptest! {
    /// Lexical order of store keys matches numeric order of ids.
    #[test]
    fn queue_item_key_order_matches_id_order(a in 0u64..u64::MAX / 2, b in 0u64..u64::MAX / 2) {
        let (ka, kb) = (QueueItemId::new(a).to_key(), QueueItemId::new(b).to_key());
        prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
    }
}

// ── RequestId ─────────────────────────────────────────────────────

#[test]
fn request_id_is_unique() {
    let a = RequestId::new();
    let b = RequestId::new();
    assert_ne!(a, b);
}

#[test]
fn request_id_display_roundtrip() {
    let id = RequestId::new();
    let parsed = RequestId::from_str(&id.to_string()).unwrap();
    assert_eq!(parsed, id);
}

#[test]
fn request_id_parse_invalid() {
    assert!(RequestId::from_str("not-a-uuid").is_err());
}
