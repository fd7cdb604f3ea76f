//! Durability over the RocksDB store.

use std::sync::Arc;

use logos_sync::{
    BranchId, Change, DocumentSession, EngineConfig, OfflineQueue, RocksStore, StoreConfig,
    SyncConfig, SyncEngine,
};
use serde_json::json;
use tempfile::tempdir;
use uuid::Uuid;

fn store(path: &std::path::Path) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

#[test]
fn test_session_survives_restart() {
    let dir = tempdir().unwrap();
    let doc = Uuid::new_v4();

    let (digest, version, head, feature) = {
        let store = store(dir.path());
        let mut s = DocumentSession::open(doc, store.clone(), SyncConfig::for_testing()).unwrap();
        let a = Change::insert("alice", 0, "body", 0, "persisted");
        s.apply_local_change(a.clone()).unwrap();
        s.apply_remote_change(Change::modify("bob", 1, "meta", json!({"v": 1})))
            .unwrap();
        let commit = s.commit(&[a.id], "first", "alice").unwrap();
        let feature = s.create_branch("feature", &commit.id).unwrap();

        let meta = store.load_metadata(doc).unwrap();
        assert_eq!(meta.entry_count, 2);
        assert_eq!(meta.commit_count, 1);

        let digest = s.document().unwrap().digest();
        (digest, s.version().unwrap(), commit.id, feature)
    };

    let store = store(dir.path());
    assert_eq!(store.list_documents().unwrap(), vec![doc]);
    let mut s = DocumentSession::open(doc, store, SyncConfig::for_testing()).unwrap();
    assert!(!s.is_poisoned());
    assert_eq!(s.document().unwrap().digest(), digest);
    assert_eq!(s.version().unwrap(), version);
    assert_eq!(s.branch(BranchId::main()).unwrap().head, Some(head.clone()));
    assert_eq!(s.branch_by_name("feature").unwrap().id, feature);
    assert_eq!(s.uncommitted(BranchId::main()).unwrap().len(), 1);

    // the feature branch materializes from its commit only
    assert_eq!(s.document_at(feature).unwrap().text("body"), Some("persisted"));
    assert_eq!(s.document_at(feature).unwrap().value("meta"), None);
}

#[tokio::test]
async fn test_offline_queue_survives_restart() {
    let dir = tempdir().unwrap();
    let doc = Uuid::new_v4();
    let first = Change::insert("carol", 0, "body", 0, "a");
    let second = Change::insert("carol", 1, "body", 1, "b");
    {
        let store = store(dir.path());
        let mut queue = OfflineQueue::durable("carol", 8, store).unwrap();
        queue.enqueue(doc, first.clone()).unwrap();
        queue.enqueue(doc, second.clone()).unwrap();
    }

    let store = store(dir.path());
    let mut queue = OfflineQueue::durable("carol", 8, store.clone()).unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.peek().unwrap().change, first);

    let engine = SyncEngine::new(store.clone(), EngineConfig::for_testing());
    let replay = engine.replay_offline(&mut queue).await.unwrap();
    assert_eq!(replay.requeued, 0);
    assert_eq!(replay.outcomes[0].1.applied.len(), 2);
    assert!(queue.is_empty());
    assert_eq!(engine.document(doc).await.unwrap().text("body"), Some("ab"));

    // draining is durable too
    let reopened = OfflineQueue::durable("carol", 8, store).unwrap();
    assert!(reopened.is_empty());
}
