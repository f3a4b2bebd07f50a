//! Cross-session lock transfer via serialize/deserialize.

use std::time::Duration;

use leasehold::{InMemoryLockStore, LockError, LockStore, Session};

#[tokio::test]
async fn serialized_lock_hands_off_between_sessions() {
    let store = InMemoryLockStore::new("T1");
    let source = Session::new(store.clone());
    let target = Session::new(store.clone());

    let original = source.create_lock("L");
    original.acquire().await.unwrap();
    let blob = original.serialize().await.unwrap();

    // serialize detached the source handle; its refresher is out of the way
    assert!(!original.is_held());

    let adopted = target.deserialize_lock(&blob).await.unwrap();
    assert!(adopted.is_held());
    assert_eq!(adopted.name(), "L");
    assert_eq!(adopted.lease_duration(), Duration::from_secs(20));

    // adoption rotated the token again, so the same blob cannot be redeemed
    // a second time
    let second = target.deserialize_lock(&blob).await;
    assert!(matches!(second, Err(LockError::AlreadyInUse { .. })));

    adopted.release().await.unwrap();
    assert!(store.get("L").await.unwrap().is_none());

    source.close().await;
    target.close().await;
}

#[tokio::test]
async fn round_trip_preserves_name_and_lease() {
    let store = InMemoryLockStore::new("T1");
    let source = Session::new(store.clone());
    let target = Session::new(store.clone());

    let original = source.create_lock("L");
    original.acquire().await.unwrap();
    let serialized_version = store.get("L").await.unwrap().unwrap().version_number;

    let blob = original.serialize().await.unwrap();
    let adopted = target.deserialize_lock(&blob).await.unwrap();

    assert_eq!(adopted.name(), original.name());
    assert_eq!(adopted.lease_duration(), original.lease_duration());

    // fresh version on the store, not the one the source held
    let record = store.get("L").await.unwrap().unwrap();
    assert_ne!(record.version_number, serialized_version);

    adopted.release().await.unwrap();
    source.close().await;
    target.close().await;
}

#[tokio::test]
async fn deserialize_on_wrong_table_is_rejected() {
    let store1 = InMemoryLockStore::new("T1");
    let store2 = InMemoryLockStore::new("T2");
    let source = Session::new(store1);
    let target = Session::new(store2);

    let original = source.create_lock("L");
    original.acquire().await.unwrap();
    let blob = original.serialize().await.unwrap();

    let result = target.deserialize_lock(&blob).await;
    assert!(matches!(result, Err(LockError::WrongTable { .. })));

    source.close().await;
    target.close().await;
}

#[tokio::test]
async fn malformed_blobs_are_rejected() {
    let session = Session::new(InMemoryLockStore::new("T"));

    for blob in ["not json", r#"{"table":"T"}"#, "[]", "42"] {
        let result = session.deserialize_lock(blob).await;
        assert!(
            matches!(result, Err(LockError::MalformedToken { .. })),
            "blob {blob:?} should be rejected"
        );
    }

    session.close().await;
}

#[tokio::test]
async fn source_release_after_handoff_leaves_record_alone() {
    let store = InMemoryLockStore::new("T1");
    let source = Session::new(store.clone());
    let target = Session::new(store.clone());

    let original = source.create_lock("L");
    original.acquire().await.unwrap();
    let blob = original.serialize().await.unwrap();
    let adopted = target.deserialize_lock(&blob).await.unwrap();

    // the source is transferred: release must not touch the adopted record
    original.release().await.unwrap();
    assert!(store.get("L").await.unwrap().is_some());
    assert!(adopted.is_held());

    adopted.release().await.unwrap();
    source.close().await;
    target.close().await;
}

#[tokio::test(start_paused = true)]
async fn stale_blob_after_steal_is_already_in_use() {
    let store = InMemoryLockStore::new("T1");
    let source = Session::new(store.clone());
    let target = Session::new(store.clone());

    let original = source.create_lock_with(
        "L",
        leasehold::LockConfig {
            lease_secs: 2,
            auto_refresh: false,
            ..leasehold::LockConfig::default()
        },
    );
    original.acquire().await.unwrap();
    let blob = original.serialize().await.unwrap();

    // nobody redeems the blob within the lease window; a rival steals
    tokio::time::sleep(Duration::from_secs(2)).await;
    let thief = source.create_lock("L");
    thief.acquire().await.unwrap();

    let result = target.deserialize_lock(&blob).await;
    assert!(matches!(result, Err(LockError::AlreadyInUse { .. })));

    thief.release().await.unwrap();
    source.close().await;
    target.close().await;
}
