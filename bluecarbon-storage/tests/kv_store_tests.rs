use bluecarbon_storage::{KvOp, KvStore, MemoryStore, SqliteStore};

/// Runs the same behavioural checks against every store implementation.
fn stores() -> Vec<(&'static str, Box<dyn KvStore>)> {
    vec![
        ("memory", Box::new(MemoryStore::new())),
        ("sqlite", Box::new(SqliteStore::open_in_memory().unwrap())),
    ]
}

// ── Basic operations ────────────────────────────────────────────

#[test]
fn get_missing_key_is_none() {
    for (name, store) in stores() {
        assert_eq!(store.get("ns", "nope").unwrap(), None, "{name}");
    }
}

#[test]
fn set_then_get() {
    for (name, store) in stores() {
        store.set("ns", "k", "v1").unwrap();
        assert_eq!(store.get("ns", "k").unwrap().as_deref(), Some("v1"), "{name}");
    }
}

#[test]
fn set_overwrites() {
    for (name, store) in stores() {
        store.set("ns", "k", "v1").unwrap();
        store.set("ns", "k", "v2").unwrap();
        assert_eq!(store.get("ns", "k").unwrap().as_deref(), Some("v2"), "{name}");
        assert_eq!(store.list_keys("ns").unwrap().len(), 1, "{name}");
    }
}

#[test]
fn delete_reports_existence() {
    for (name, store) in stores() {
        store.set("ns", "k", "v").unwrap();
        assert!(store.delete("ns", "k").unwrap(), "{name}");
        assert!(!store.delete("ns", "k").unwrap(), "{name}");
        assert_eq!(store.get("ns", "k").unwrap(), None, "{name}");
    }
}

#[test]
fn namespaces_are_isolated() {
    for (name, store) in stores() {
        store.set("queue", "k", "a").unwrap();
        store.set("cache", "k", "b").unwrap();
        assert_eq!(store.get("queue", "k").unwrap().as_deref(), Some("a"), "{name}");
        assert_eq!(store.get("cache", "k").unwrap().as_deref(), Some("b"), "{name}");
        store.delete("queue", "k").unwrap();
        assert_eq!(store.get("cache", "k").unwrap().as_deref(), Some("b"), "{name}");
    }
}

#[test]
fn list_keys_is_sorted() {
    for (name, store) in stores() {
        store.set("ns", "item:0003", "c").unwrap();
        store.set("ns", "item:0001", "a").unwrap();
        store.set("ns", "item:0002", "b").unwrap();
        assert_eq!(
            store.list_keys("ns").unwrap(),
            vec!["item:0001", "item:0002", "item:0003"],
            "{name}"
        );
        assert!(store.list_keys("other").unwrap().is_empty(), "{name}");
    }
}

// ── Batches ─────────────────────────────────────────────────────

#[test]
fn batch_applies_all_ops_in_order() {
    for (name, store) in stores() {
        store.set("ns", "old", "x").unwrap();
        store
            .apply_batch(
                "ns",
                &[
                    KvOp::set("a", "1"),
                    KvOp::set("b", "2"),
                    KvOp::delete("old"),
                    KvOp::set("a", "3"),
                ],
            )
            .unwrap();
        assert_eq!(store.get("ns", "a").unwrap().as_deref(), Some("3"), "{name}");
        assert_eq!(store.get("ns", "b").unwrap().as_deref(), Some("2"), "{name}");
        assert_eq!(store.get("ns", "old").unwrap(), None, "{name}");
    }
}

#[test]
fn empty_batch_is_noop() {
    for (name, store) in stores() {
        store.apply_batch("ns", &[]).unwrap();
        assert!(store.list_keys("ns").unwrap().is_empty(), "{name}");
    }
}

// ── Durability ──────────────────────────────────────────────────

#[test]
fn sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("sync.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        store
            .apply_batch("queue", &[KvOp::set("item:1", "{}"), KvOp::set("index", "[1]")])
            .unwrap();
    }

    let reopened = SqliteStore::open(&path).unwrap();
    assert_eq!(reopened.get("queue", "index").unwrap().as_deref(), Some("[1]"));
    assert_eq!(reopened.list_keys("queue").unwrap(), vec!["index", "item:1"]);
}

#[test]
fn memory_store_clones_share_data() {
    let store = MemoryStore::new();
    let clone = store.clone();
    store.set("ns", "k", "v").unwrap();
    assert_eq!(clone.get("ns", "k").unwrap().as_deref(), Some("v"));
    assert_eq!(clone.len("ns"), 1);
    assert!(clone.is_empty("other"));
}
