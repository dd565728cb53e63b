//! Crash-consistency checks against a file-backed database.

use blum_store::{Database, RecordStore, StoreOp, TransactionOutcome};

const NS: &str = "durable";

#[test]
fn committed_writes_survive_abrupt_drop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blum.db");

    {
        let store = RecordStore::new(Database::open(&path).unwrap());
        let v1 = store.put(NS, "a", b"one", 0).unwrap();
        let _ = store.put(NS, "a", b"two", v1).unwrap();
        let _ = store.put(NS, "b", &[0u8; 4096], 0).unwrap();
        // Leak the connection so no close or checkpoint runs, as after a kill.
        std::mem::forget(store);
    }

    let reopened = RecordStore::new(Database::open(&path).unwrap());
    let a = reopened.get(NS, "a").unwrap().unwrap();
    assert_eq!(a.value, b"two");
    assert_eq!(a.version, 2);
    assert_eq!(reopened.get(NS, "b").unwrap().unwrap().value.len(), 4096);
}

#[test]
fn rolled_back_batch_is_invisible_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blum.db");

    {
        let store = RecordStore::new(Database::open(&path).unwrap());
        let _ = store.put(NS, "guard", b"g", 0).unwrap();
        let outcome = store
            .transaction(&[
                StoreOp::Put {
                    namespace: NS.into(),
                    key: "partial".into(),
                    value: b"should not persist".to_vec(),
                    expected_version: 0,
                },
                StoreOp::Put {
                    namespace: NS.into(),
                    key: "guard".into(),
                    value: b"clobber".to_vec(),
                    expected_version: 5,
                },
            ])
            .unwrap();
        assert!(matches!(outcome, TransactionOutcome::RolledBack { .. }));
        std::mem::forget(store);
    }

    let reopened = RecordStore::new(Database::open(&path).unwrap());
    assert!(reopened.get(NS, "partial").unwrap().is_none());
    assert_eq!(reopened.get(NS, "guard").unwrap().unwrap().value, b"g");
}

#[test]
fn checkpoint_then_reopen_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blum.db");

    let store = RecordStore::new(Database::open(&path).unwrap());
    let _ = store.put(NS, "k", b"v", 0).unwrap();
    store.database().checkpoint().unwrap();
    drop(store);

    let reopened = RecordStore::new(Database::open(&path).unwrap());
    assert_eq!(reopened.keys(NS).unwrap(), vec!["k"]);
}
