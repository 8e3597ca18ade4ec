//! Contract tests for the work-item store semantics, driven against the
//! in-memory store with a hand-cranked clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mailroom::testing::InMemoryStore;
use mailroom::{
    Clock, EnqueueResult, JoinStore, ManualClock, NewWorkItem, OwnerToken, WorkItemId,
    WorkItemStatus, WorkItemStore,
};

fn store_with_clock() -> (Arc<InMemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    (store, clock)
}

async fn enqueue_one(store: &InMemoryStore, topic: &str) -> WorkItemId {
    match store.enqueue(NewWorkItem::new(topic, "{}")).await.unwrap() {
        EnqueueResult::Created(id) => id,
        EnqueueResult::Duplicate(_) => panic!("fresh enqueue reported duplicate"),
    }
}

#[tokio::test]
async fn enqueue_validates_topic() {
    let (store, _) = store_with_clock();
    assert!(store.enqueue(NewWorkItem::new("", "{}")).await.is_err());
    assert!(store
        .enqueue(NewWorkItem::new("t".repeat(256), "{}"))
        .await
        .is_err());
}

#[tokio::test]
async fn enqueue_with_supplied_id_dedups() {
    let (store, _) = store_with_clock();
    let id = WorkItemId::new("event-42");

    let first = store
        .enqueue(NewWorkItem::new("inbound.order", "{}").id(id.clone()))
        .await
        .unwrap();
    assert!(first.is_created());

    let second = store
        .enqueue(NewWorkItem::new("inbound.order", "{}").id(id.clone()))
        .await
        .unwrap();
    assert_eq!(second, EnqueueResult::Duplicate(id));
    assert_eq!(store.all_items().len(), 1);
}

#[tokio::test]
async fn claim_orders_by_created_on_and_respects_batch_size() {
    let (store, clock) = store_with_clock();

    let first = enqueue_one(&store, "email.send").await;
    clock.advance(chrono::Duration::seconds(1));
    let second = enqueue_one(&store, "email.send").await;
    clock.advance(chrono::Duration::seconds(1));
    let _third = enqueue_one(&store, "email.send").await;

    let owner = OwnerToken::mint();
    let claimed = store
        .claim(&owner, Duration::from_secs(30), 2)
        .await
        .unwrap();
    assert_eq!(claimed, vec![first, second]);
}

#[tokio::test]
async fn claim_skips_future_due_items() {
    let (store, clock) = store_with_clock();
    let now = clock.now();

    let due_later = store
        .enqueue(NewWorkItem::new("email.send", "{}").due_on(now + chrono::Duration::seconds(60)))
        .await
        .unwrap()
        .item_id()
        .clone();
    // Due in the past behaves exactly like no due time.
    let due_past = store
        .enqueue(NewWorkItem::new("email.send", "{}").due_on(now - chrono::Duration::seconds(60)))
        .await
        .unwrap()
        .item_id()
        .clone();

    let owner = OwnerToken::mint();
    let claimed = store
        .claim(&owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    assert_eq!(claimed, vec![due_past.clone()]);
    store.ack(&owner, "worker-1", &[due_past]).await.unwrap();

    clock.advance(chrono::Duration::seconds(61));
    let claimed = store
        .claim(&OwnerToken::mint(), Duration::from_secs(30), 10)
        .await
        .unwrap();
    assert_eq!(claimed, vec![due_later]);
}

// P1: concurrent claims by distinct owners return disjoint id sets.
#[tokio::test]
async fn concurrent_claims_are_disjoint() {
    let (store, _) = store_with_clock();
    for _ in 0..50 {
        enqueue_one(&store, "email.send").await;
    }

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .claim(&OwnerToken::mint(), Duration::from_secs(30), 20)
                .await
                .unwrap()
        }));
    }

    let mut seen = std::collections::HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "item claimed by two owners");
        }
    }
    assert_eq!(seen.len(), 50);
}

// P2 + ack: the rightful owner finishes the row; P4: acking twice is
// indistinguishable from acking once.
#[tokio::test]
async fn ack_is_owner_fenced_and_idempotent() {
    let (store, _) = store_with_clock();
    let id = enqueue_one(&store, "email.send").await;

    let owner = OwnerToken::mint();
    let claimed = store
        .claim(&owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    assert_eq!(claimed, vec![id.clone()]);

    store.ack(&owner, "worker-1", &[id.clone()]).await.unwrap();
    let item = store.get(&id).await.unwrap();
    assert_eq!(item.status, WorkItemStatus::Done);
    assert!(item.processed_on.is_some());
    assert_eq!(item.processed_by.as_deref(), Some("worker-1"));
    assert!(item.owner_token.is_none());
    assert!(item.locked_until.is_none());

    // Second ack: same terminal state, nothing disturbed.
    store.ack(&owner, "worker-9", &[id.clone()]).await.unwrap();
    let again = store.get(&id).await.unwrap();
    assert_eq!(again.status, WorkItemStatus::Done);
    assert_eq!(again.processed_by.as_deref(), Some("worker-1"));
}

// P3: a wrong-token Ack/Abandon/Fail leaves the row untouched.
#[tokio::test]
async fn mutations_with_stale_token_are_noops() {
    let (store, _) = store_with_clock();
    let id = enqueue_one(&store, "email.send").await;

    let owner = OwnerToken::mint();
    store
        .claim(&owner, Duration::from_secs(30), 10)
        .await
        .unwrap();

    let intruder = OwnerToken::mint();
    store.ack(&intruder, "thief", &[id.clone()]).await.unwrap();
    store
        .abandon(&intruder, &[id.clone()], Some("stolen"), None)
        .await
        .unwrap();
    store
        .fail(&intruder, "thief", &[id.clone()], "stolen")
        .await
        .unwrap();

    let item = store.get(&id).await.unwrap();
    assert_eq!(item.status, WorkItemStatus::Processing);
    assert_eq!(item.owner_token, Some(owner.as_uuid()));
    assert_eq!(item.attempt_count, 0);
    assert!(item.last_error.is_none());
}

// P5: abandon returns the row to Ready with exactly one more attempt.
#[tokio::test]
async fn abandon_resets_to_ready_with_delay() {
    let (store, clock) = store_with_clock();
    let id = enqueue_one(&store, "email.send").await;

    let owner = OwnerToken::mint();
    store
        .claim(&owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    store
        .abandon(
            &owner,
            &[id.clone()],
            Some("boom"),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let item = store.get(&id).await.unwrap();
    assert_eq!(item.status, WorkItemStatus::Ready);
    assert_eq!(item.attempt_count, 1);
    assert!(item.owner_token.is_none());
    assert!(item.locked_until.is_none());
    assert_eq!(item.last_error.as_deref(), Some("boom"));
    assert_eq!(item.due_on, Some(clock.now() + chrono::Duration::seconds(5)));

    // Not claimable until the delay passes.
    assert!(store
        .claim(&OwnerToken::mint(), Duration::from_secs(30), 10)
        .await
        .unwrap()
        .is_empty());
    clock.advance(chrono::Duration::seconds(6));
    assert_eq!(
        store
            .claim(&OwnerToken::mint(), Duration::from_secs(30), 10)
            .await
            .unwrap(),
        vec![id]
    );
}

#[tokio::test]
async fn fail_dead_letters_with_reason_and_marker() {
    let (store, _) = store_with_clock();
    let id = enqueue_one(&store, "email.send").await;

    let owner = OwnerToken::mint();
    store
        .claim(&owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    store
        .fail(&owner, "worker-1", &[id.clone()], "poison payload")
        .await
        .unwrap();

    let item = store.get(&id).await.unwrap();
    assert_eq!(item.status, WorkItemStatus::Dead);
    assert_eq!(item.last_error.as_deref(), Some("poison payload"));
    assert_eq!(item.processed_by.as_deref(), Some("worker-1:FAILED"));

    // Dead rows are never claimed.
    assert!(store
        .claim(&OwnerToken::mint(), Duration::from_secs(30), 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn revive_returns_dead_rows_to_ready() {
    let (store, clock) = store_with_clock();
    let id = enqueue_one(&store, "email.send").await;

    let owner = OwnerToken::mint();
    store
        .claim(&owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    store
        .fail(&owner, "worker-1", &[id.clone()], "poison payload")
        .await
        .unwrap();
    let failed_attempts = store.get(&id).await.unwrap().attempt_count;

    store
        .revive(&[id.clone()], None, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    let item = store.get(&id).await.unwrap();
    assert_eq!(item.status, WorkItemStatus::Ready);
    assert_eq!(item.attempt_count, failed_attempts);
    // The original reason survives unless a new one is supplied.
    assert_eq!(item.last_error.as_deref(), Some("poison payload"));
    assert_eq!(
        item.due_on,
        Some(clock.now() + chrono::Duration::seconds(10))
    );

    // Revive on a non-dead row is a no-op.
    let ready_id = enqueue_one(&store, "email.send").await;
    store
        .revive(&[ready_id.clone()], Some("nope"), None)
        .await
        .unwrap();
    assert!(store.get(&ready_id).await.unwrap().last_error.is_none());
}

// P6: an expired lease is reaped and the item is claimable again, with no
// attempt charged.
#[tokio::test]
async fn reap_releases_expired_leases_without_counting_attempts() {
    let (store, clock) = store_with_clock();
    let id = enqueue_one(&store, "email.send").await;

    let owner = OwnerToken::mint();
    store
        .claim(&owner, Duration::from_secs(1), 10)
        .await
        .unwrap();

    // Lease still live: nothing to reap.
    assert_eq!(store.reap_expired().await.unwrap(), 0);

    clock.advance(chrono::Duration::milliseconds(1500));
    assert_eq!(store.reap_expired().await.unwrap(), 1);

    let item = store.get(&id).await.unwrap();
    assert_eq!(item.status, WorkItemStatus::Ready);
    assert_eq!(item.attempt_count, 0);
    assert!(item.owner_token.is_none());

    let second_owner = OwnerToken::mint();
    assert_eq!(
        store
            .claim(&second_owner, Duration::from_secs(30), 10)
            .await
            .unwrap(),
        vec![id]
    );
}

#[tokio::test]
async fn extend_lease_pushes_the_deadline_for_the_owner_only() {
    let (store, clock) = store_with_clock();
    let id = enqueue_one(&store, "email.send").await;

    let owner = OwnerToken::mint();
    store
        .claim(&owner, Duration::from_secs(10), 10)
        .await
        .unwrap();

    clock.advance(chrono::Duration::seconds(8));
    store
        .extend_lease(&owner, &[id.clone()], Duration::from_secs(10))
        .await
        .unwrap();

    // The old deadline would have expired here; the beat moved it out.
    clock.advance(chrono::Duration::seconds(5));
    assert_eq!(store.reap_expired().await.unwrap(), 0);
    assert_eq!(
        store.get(&id).await.unwrap().locked_until,
        Some(clock.now() + chrono::Duration::seconds(5))
    );

    // A stranger's beat does nothing.
    let before = store.get(&id).await.unwrap().locked_until;
    store
        .extend_lease(&OwnerToken::mint(), &[id.clone()], Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(store.get(&id).await.unwrap().locked_until, before);
}

#[tokio::test]
async fn expired_lease_is_claimable_even_without_reap() {
    let (store, clock) = store_with_clock();
    let id = enqueue_one(&store, "email.send").await;

    store
        .claim(&OwnerToken::mint(), Duration::from_secs(1), 10)
        .await
        .unwrap();
    clock.advance(chrono::Duration::seconds(2));

    // Claim eligibility includes expired-lease Processing rows directly.
    let second = OwnerToken::mint();
    assert_eq!(
        store
            .claim(&second, Duration::from_secs(30), 10)
            .await
            .unwrap(),
        vec![id.clone()]
    );
    let item = store.get(&id).await.unwrap();
    assert_eq!(item.owner_token, Some(second.as_uuid()));
}

#[tokio::test]
async fn cleanup_deletes_only_old_terminal_rows() {
    let (store, clock) = store_with_clock();

    let done = enqueue_one(&store, "email.send").await;
    let dead = enqueue_one(&store, "email.send").await;
    let ready = enqueue_one(&store, "email.send").await;

    let owner = OwnerToken::mint();
    store
        .claim(&owner, Duration::from_secs(30), 2)
        .await
        .unwrap();
    store.ack(&owner, "worker-1", &[done.clone()]).await.unwrap();
    store
        .fail(&owner, "worker-1", &[dead.clone()], "x")
        .await
        .unwrap();

    // Inside the retention window: nothing deleted.
    assert_eq!(store.cleanup(Duration::from_secs(3600)).await.unwrap(), 0);

    clock.advance(chrono::Duration::seconds(7200));
    assert_eq!(store.cleanup(Duration::from_secs(3600)).await.unwrap(), 2);

    assert!(store.get(&done).await.is_err());
    assert!(store.get(&dead).await.is_err());
    assert!(store.get(&ready).await.is_ok());
}

// P8: join counters are monotonic, clamped, and idempotent per member.
#[tokio::test]
async fn join_counters_count_each_member_once() {
    let (store, _) = store_with_clock();

    let join_id = store.create_join("tenant-1", 2, None).await.unwrap();
    let a = WorkItemId::new("a");
    let b = WorkItemId::new("b");
    store.attach(join_id, &a).await.unwrap();
    store.attach(join_id, &a).await.unwrap(); // attach is idempotent
    store.attach(join_id, &b).await.unwrap();

    assert!(store.increment_completed(join_id, &a).await.unwrap());
    assert!(!store.increment_completed(join_id, &a).await.unwrap());
    // A member already counted as completed cannot be recounted as failed.
    assert!(!store.increment_failed(join_id, &a).await.unwrap());

    assert!(store.increment_failed(join_id, &b).await.unwrap());

    let join = store.get_join(join_id).await.unwrap();
    assert_eq!(join.completed_steps, 1);
    assert_eq!(join.failed_steps, 1);
    assert!(join.is_settled());
    assert!(join.completed_steps + join.failed_steps <= join.expected_steps);
}

#[tokio::test]
async fn ack_and_fail_report_to_joins_automatically() {
    let (store, _) = store_with_clock();

    let join_id = store.create_join("tenant-1", 3, Some("{}")).await.unwrap();
    let ids: Vec<WorkItemId> = {
        let mut out = Vec::new();
        for _ in 0..3 {
            out.push(enqueue_one(&store, "etl.step").await);
        }
        out
    };
    for id in &ids {
        store.attach(join_id, id).await.unwrap();
    }

    let owner = OwnerToken::mint();
    store
        .claim(&owner, Duration::from_secs(30), 10)
        .await
        .unwrap();

    store
        .ack(&owner, "worker-1", &ids[0..2])
        .await
        .unwrap();
    store
        .fail(&owner, "worker-1", &[ids[2].clone()], "boom")
        .await
        .unwrap();

    let join = store.get_join(join_id).await.unwrap();
    assert_eq!(join.completed_steps, 2);
    assert_eq!(join.failed_steps, 1);

    // Members carry the terminal counted-state.
    let members = store.get_members(join_id).await.unwrap();
    assert_eq!(members.len(), 3);
    assert!(members.iter().all(|m| m.state.is_counted()));
}

#[tokio::test]
async fn join_counters_clamp_at_expected_steps() {
    let (store, _) = store_with_clock();

    // More members than expected steps: counters stop at the cap.
    let join_id = store.create_join("tenant-1", 2, None).await.unwrap();
    for name in ["a", "b", "c"] {
        store.attach(join_id, &WorkItemId::new(name)).await.unwrap();
    }
    for name in ["a", "b", "c"] {
        store
            .increment_completed(join_id, &WorkItemId::new(name))
            .await
            .unwrap();
    }

    let join = store.get_join(join_id).await.unwrap();
    assert_eq!(join.completed_steps, 2);
    assert!(join.completed_steps + join.failed_steps <= join.expected_steps);
}

#[tokio::test]
async fn create_join_rejects_non_positive_expected_steps() {
    let (store, _) = store_with_clock();
    assert!(store.create_join("tenant-1", 0, None).await.is_err());
    assert!(store.create_join("tenant-1", -1, None).await.is_err());
}
