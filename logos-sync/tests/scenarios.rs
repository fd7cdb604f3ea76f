//! End-to-end collaboration scenarios.

use std::sync::Arc;

use logos_sync::protocol::MessageKind;
use logos_sync::{
    BranchId, Change, DocumentSession, EngineConfig, Envelope, Integrated, MemoryStore,
    MergeResult, OfflineQueue, Resolution, Side, StrategyKind, SyncConfig, SyncEngine, SyncError,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn session() -> DocumentSession {
    DocumentSession::open(
        Uuid::new_v4(),
        Arc::new(MemoryStore::new()),
        SyncConfig::for_testing(),
    )
    .unwrap()
}

fn engine() -> SyncEngine {
    SyncEngine::new(Arc::new(MemoryStore::new()), EngineConfig::for_testing())
}

// ─── Scenario A ───────────────────────────────────────────────────────

#[test]
fn test_same_offset_inserts_order_by_timestamp_then_author() {
    let alice = Change::insert("alice", 1, "body", 1, "X").with_timestamp(100);
    let bob = Change::insert("bob", 1, "body", 1, "Y").with_timestamp(200);

    let mut forward = session();
    forward
        .apply_local_change(Change::insert("seed", 0, "body", 0, "ab"))
        .unwrap();
    assert!(matches!(
        forward.apply_remote_change(alice.clone()).unwrap(),
        Integrated::Applied(_)
    ));
    assert!(matches!(
        forward.apply_remote_change(bob.clone()).unwrap(),
        Integrated::Applied(_)
    ));

    let mut backward = session();
    backward
        .apply_local_change(Change::insert("seed", 0, "body", 0, "ab"))
        .unwrap();
    backward.apply_remote_change(bob).unwrap();
    backward.apply_remote_change(alice).unwrap();

    assert_eq!(forward.document().unwrap().text("body"), Some("aXYb"));
    assert_eq!(backward.document().unwrap().text("body"), Some("aXYb"));
}

#[test]
fn test_same_timestamp_inserts_tie_break_on_author() {
    let mut s = session();
    s.apply_local_change(Change::insert("seed", 0, "body", 0, "--"))
        .unwrap();
    s.apply_remote_change(Change::insert("zoe", 1, "body", 1, "Z").with_timestamp(500))
        .unwrap();
    s.apply_remote_change(Change::insert("adam", 1, "body", 1, "A").with_timestamp(500))
        .unwrap();
    assert_eq!(s.document().unwrap().text("body"), Some("-AZ-"));
}

// ─── Scenario B ───────────────────────────────────────────────────────

#[test]
fn test_concurrent_field_modify_resolves_to_later_write() {
    let alice = Change::modify("alice", 0, "status", json!("draft")).with_timestamp(100);
    let bob = Change::modify("bob", 0, "status", json!("final")).with_timestamp(300);

    // as one batch: alice applies, bob's write collides with it
    let mut batch = session();
    let outcome = batch.sync_batch(vec![bob.clone(), alice.clone()]).unwrap();
    assert_eq!(outcome.applied.len(), 1);
    assert_eq!(outcome.applied[0].id, alice.id);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].conflict.change_a.id, bob.id);
    assert_eq!(batch.document().unwrap().value("status"), Some(&json!("final")));

    let mut s = session();
    s.apply_remote_change(alice).unwrap();
    let out = s.apply_remote_change(bob.clone()).unwrap();
    let Integrated::Resolved {
        conflict,
        resolution,
        effect,
    } = out
    else {
        panic!("expected an automatic resolution");
    };
    assert_eq!(conflict.change_a.id, bob.id);
    assert_eq!(resolution, Resolution::Chose(Side::A));
    assert_eq!(s.document().unwrap().value("status"), Some(&json!("final")));

    let record = effect.resolves.as_ref().unwrap();
    assert_eq!(record.conflict, conflict.id);
    assert_eq!(record.winner, Some(bob.id));
    assert_eq!(record.strategy, StrategyKind::LastWriteWins);

    // the synthetic change is the logged effect of bob's entry
    let entry = s.log().find(&bob.id).unwrap();
    assert_eq!(entry.effect.as_ref(), Some(&effect));
    assert_eq!(entry.disposition.as_str(), "resolved");
}

#[test]
fn test_late_arrival_of_older_write_keeps_newer_value() {
    let mut s = session();
    s.apply_remote_change(Change::modify("bob", 0, "status", json!("final")).with_timestamp(300))
        .unwrap();
    let out = s
        .apply_remote_change(Change::modify("alice", 0, "status", json!("draft")).with_timestamp(100))
        .unwrap();
    assert!(matches!(
        out,
        Integrated::Resolved {
            resolution: Resolution::Chose(Side::B),
            ..
        }
    ));
    assert_eq!(s.document().unwrap().value("status"), Some(&json!("final")));
}

// ─── Scenario C ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_diverged_branches_merge_without_conflicts() {
    let engine = engine();
    let doc = Uuid::new_v4();

    let seed = Change::insert("alice", 0, "body", 0, "Hello");
    engine.apply_local_change(doc, seed.clone()).await.unwrap();
    let c1 = engine.commit(doc, vec![seed.id], "C1", "alice").await.unwrap();
    let feature = engine.create_branch(doc, "feature", c1.id.clone()).await.unwrap();

    let on_main = Change::insert("alice", 1, "body", 5, " world");
    engine.apply_local_change(doc, on_main.clone()).await.unwrap();
    let main_head = engine
        .commit(doc, vec![on_main.id], "main edit", "alice")
        .await
        .unwrap();

    engine.switch_branch(doc, feature).await.unwrap();
    let on_feature = Change::modify("bob", 1, "title", json!("Greeting"));
    engine.apply_local_change(doc, on_feature.clone()).await.unwrap();
    let feature_head = engine
        .commit(doc, vec![on_feature.id], "feature edit", "bob")
        .await
        .unwrap();
    engine.switch_branch(doc, BranchId::main()).await.unwrap();

    let mut rx = engine.subscribe(doc, "observer").await;
    let result = engine
        .merge(
            doc,
            feature,
            BranchId::main(),
            StrategyKind::Manual,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let MergeResult::Merged { commit, conflicts } = result else {
        panic!("expected a merge commit");
    };
    assert!(conflicts.is_empty());
    assert_eq!(commit.parent_ids, vec![main_head.id, feature_head.id]);
    assert_eq!(commit.message, "Merge branch 'feature' into 'main'");

    let merged = engine.document(doc).await.unwrap();
    assert_eq!(merged.text("body"), Some("Hello world"));
    assert_eq!(merged.value("title"), Some(&json!("Greeting")));

    // the merged change is broadcast before the commit
    let mut kinds = Vec::new();
    while let Ok(bytes) = rx.try_recv() {
        kinds.push(Envelope::decode(&bytes).unwrap().kind);
    }
    assert_eq!(kinds, vec![MessageKind::Change, MessageKind::Commit]);
}

// ─── Scenario D ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_offline_replay_rejects_stale_and_holds_dependents() {
    let engine = engine();
    let quiet = Uuid::new_v4();
    let busy = Uuid::new_v4();

    engine
        .apply_local_change(quiet, Change::insert("alice", 0, "body", 0, "hello"))
        .await
        .unwrap();
    engine
        .apply_local_change(busy, Change::insert("alice", 0, "body", 0, "x"))
        .await
        .unwrap();

    // carol goes offline at version 1 on both documents
    let c1 = Change::insert("carol", 1, "body", 5, " a").with_timestamp(10);
    let c2 = Change::insert("carol", 2, "body", 7, " b").with_timestamp(20);
    let c3 = Change::insert("carol", 1, "body", 0, "[").with_timestamp(30);
    let c4 = Change::insert("carol", 2, "body", 1, "c")
        .with_timestamp(40)
        .depending_on([c3.id]);
    let c5 = Change::insert("carol", 3, "body", 2, "]")
        .with_timestamp(50)
        .depending_on([c4.id]);

    let mut queue = OfflineQueue::new("carol", 16);
    queue.enqueue(quiet, c1.clone()).unwrap();
    queue.enqueue(quiet, c2.clone()).unwrap();
    queue.enqueue(busy, c3.clone()).unwrap();
    queue.enqueue(busy, c4.clone()).unwrap();
    queue.enqueue(busy, c5.clone()).unwrap();

    // meanwhile the busy document moves well past the staleness window
    for i in 1..12 {
        engine
            .apply_local_change(busy, Change::insert("alice", i, "body", 0, "x"))
            .await
            .unwrap();
    }

    let replay = engine.replay_offline(&mut queue).await.unwrap();
    assert_eq!(replay.outcomes.len(), 2);

    let (doc, first) = &replay.outcomes[0];
    assert_eq!(*doc, quiet);
    let applied: Vec<_> = first.applied.iter().map(|c| c.id).collect();
    assert_eq!(applied, vec![c1.id, c2.id]);
    assert_eq!(
        engine.document(quiet).await.unwrap().text("body"),
        Some("hello a b")
    );

    let (doc, second) = &replay.outcomes[1];
    assert_eq!(*doc, busy);
    assert!(second.applied.is_empty());
    assert_eq!(second.rejected.len(), 1);
    assert_eq!(second.rejected[0].change.id, c3.id);
    assert!(matches!(
        second.rejected[0].reason,
        SyncError::StaleBaseVersion { base: 1, current: 12, .. }
    ));
    let held: Vec<_> = second.held.iter().map(|h| h.change.id).collect();
    assert_eq!(held, vec![c4.id, c5.id]);
    assert_eq!(second.held[0].waiting_on, vec![c3.id]);

    // held changes wait at the head of the queue, in authoring order
    assert_eq!(replay.requeued, 2);
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.peek().unwrap().change.id, c4.id);
    assert_eq!(engine.version(busy).await.unwrap(), 12);
}
