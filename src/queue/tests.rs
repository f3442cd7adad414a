use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use super::*;
use crate::queue::clock::ManualClock;
use crate::storage::MemoryStore;

const LEASE_SECS: u64 = 600;
const MAX_ATTEMPTS: u32 = 3;

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn setup() -> (Arc<TaskQueue>, Arc<MemoryStore>, ManualClock) {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::at(start_time());
    let queue = TaskQueue::with_clock(
        store.clone(),
        Arc::new(clock.clone()),
        LEASE_SECS,
        MAX_ATTEMPTS,
    );
    (Arc::new(queue), store, clock)
}

fn test_job(id: &str, duration: Option<f64>) -> Job {
    Job {
        id: id.to_string(),
        payload: entry::payload_path(id, "m4a"),
        duration_secs: duration,
        language: Some("zh".to_string()),
        title: Some(format!("video {id}")),
        created_at: start_time(),
    }
}

#[tokio::test]
async fn test_enqueue_twice_is_already_exists() {
    let (queue, store, _clock) = setup();
    queue.enqueue(&test_job("v1", None), b"media").await.unwrap();

    let err = queue
        .enqueue(&test_job("v1", None), b"media")
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::AlreadyExists(id) if id == "v1"));
    assert_eq!(store.list(entry::PENDING).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_enqueue_rejects_bad_ids() {
    let (queue, _store, _clock) = setup();
    let mut job = test_job("v1", None);
    job.id = "has space".to_string();
    let err = queue.enqueue(&job, b"media").await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidId(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_claim_is_exclusive_under_contention() {
    let (queue, store, _clock) = setup();
    queue
        .enqueue(&test_job("solo", None), b"media")
        .await
        .unwrap();

    // independent queue handles, as if each claimer were its own process
    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let queue = TaskQueue::new(store, LEASE_SECS, MAX_ATTEMPTS);
            queue
                .claim(&format!("worker-{i}"), ClaimSelector::Oldest)
                .await
                .unwrap()
        }));
    }

    let mut won = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            won += 1;
        }
    }
    assert_eq!(won, 1);
    assert_eq!(store.list(entry::PENDING).await.unwrap().len(), 0);
    assert_eq!(store.list(entry::CLAIMED).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_lease_expiry_gates_reclaim() {
    let (queue, _store, clock) = setup();
    queue.enqueue(&test_job("v1", None), b"media").await.unwrap();

    let first = queue.claim("alpha", ClaimSelector::Oldest).await.unwrap();
    assert!(first.is_some());

    // just inside the lease: nothing to steal
    clock.advance(Duration::seconds(LEASE_SECS as i64));
    assert!(queue
        .claim("beta", ClaimSelector::Oldest)
        .await
        .unwrap()
        .is_none());

    // past it: the sweep requeues and beta picks it up
    clock.advance(Duration::seconds(1));
    let second = queue
        .claim("beta", ClaimSelector::Oldest)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.job.id, "v1");
    assert_eq!(second.worker, "beta");
    assert_eq!(second.name.attempts, 2);
}

#[tokio::test]
async fn test_stale_complete_is_not_owned() {
    let (queue, _store, clock) = setup();
    queue.enqueue(&test_job("v1", None), b"media").await.unwrap();

    let stale = queue
        .claim("alpha", ClaimSelector::Oldest)
        .await
        .unwrap()
        .unwrap();
    clock.advance(Duration::seconds(LEASE_SECS as i64 + 1));
    let fresh = queue.claim("beta", ClaimSelector::Oldest).await.unwrap();
    assert!(fresh.is_some());

    let result_ref = queue.put_result(&stale, b"late text").await.unwrap();
    let err = queue.complete(&stale, &result_ref).await.unwrap_err();
    assert!(matches!(err, QueueError::NotOwned(id) if id == "v1"));

    // beta's claim is untouched
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.completed, 0);

    // and the stale fail path reports the same thing
    let err = queue.fail(&stale, "boom").await.unwrap_err();
    assert!(matches!(err, QueueError::NotOwned(_)));
}

#[tokio::test]
async fn test_complete_validates_result_ref() {
    let (queue, _store, _clock) = setup();
    queue.enqueue(&test_job("v1", None), b"media").await.unwrap();
    let claim = queue
        .claim("alpha", ClaimSelector::Oldest)
        .await
        .unwrap()
        .unwrap();

    let err = queue.complete(&claim, "texts/other.txt").await.unwrap_err();
    assert!(matches!(err, QueueError::ResultMismatch { .. }));
}

#[tokio::test]
async fn test_failures_requeue_then_dead_letter() {
    let (queue, _store, _clock) = setup();
    queue.enqueue(&test_job("v1", None), b"media").await.unwrap();

    for attempt in 1..=MAX_ATTEMPTS {
        let claim = queue
            .claim("alpha", ClaimSelector::Oldest)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.name.attempts, attempt);
        let outcome = queue.fail(&claim, "engine exploded").await.unwrap();
        if attempt < MAX_ATTEMPTS {
            assert_eq!(outcome, FailOutcome::Requeued);
        } else {
            assert_eq!(outcome, FailOutcome::Dead);
        }
    }

    assert!(queue
        .claim("alpha", ClaimSelector::Oldest)
        .await
        .unwrap()
        .is_none());
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_crash_loop_dead_letters_via_sweep() {
    let (queue, _store, clock) = setup();
    queue.enqueue(&test_job("v1", None), b"media").await.unwrap();

    // claim and walk away, three times over
    for _ in 0..MAX_ATTEMPTS {
        let claimed = queue.claim("alpha", ClaimSelector::Oldest).await.unwrap();
        assert!(claimed.is_some());
        clock.advance(Duration::seconds(LEASE_SECS as i64 + 1));
    }

    // the final sweep runs inside this claim call
    assert!(queue
        .claim("alpha", ClaimSelector::Oldest)
        .await
        .unwrap()
        .is_none());
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.claimed, 0);
}

#[tokio::test]
async fn test_dead_entry_does_not_block_reenqueue() {
    let (queue, _store, _clock) = setup();
    queue.enqueue(&test_job("v1", None), b"media").await.unwrap();
    for _ in 0..MAX_ATTEMPTS {
        let claim = queue
            .claim("alpha", ClaimSelector::Oldest)
            .await
            .unwrap()
            .unwrap();
        queue.fail(&claim, "no luck").await.unwrap();
    }

    queue.enqueue(&test_job("v1", None), b"media").await.unwrap();
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.dead, 1);
}

#[tokio::test]
async fn test_selector_under_skips_long_media() {
    let (queue, _store, _clock) = setup();
    queue
        .enqueue(&test_job("long", Some(3000.0)), b"media")
        .await
        .unwrap();
    queue
        .enqueue(&test_job("short", Some(120.0)), b"media")
        .await
        .unwrap();

    let claim = queue
        .claim("small-box", ClaimSelector::Under(600.0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claim.job.id, "short");

    // only the long one is left and it stays off limits
    assert!(queue
        .claim("small-box", ClaimSelector::Under(600.0))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_selector_prefer_over_takes_long_media_first() {
    let (queue, _store, _clock) = setup();
    queue
        .enqueue(&test_job("short", Some(120.0)), b"media")
        .await
        .unwrap();
    queue
        .enqueue(&test_job("long", Some(3000.0)), b"media")
        .await
        .unwrap();

    let first = queue
        .claim("big-box", ClaimSelector::PreferOver(600.0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.job.id, "long");

    // falls back to whatever is left
    let second = queue
        .claim("big-box", ClaimSelector::PreferOver(600.0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.job.id, "short");
}

#[tokio::test]
async fn test_unknown_duration_counts_as_short() {
    let (queue, _store, _clock) = setup();
    queue.enqueue(&test_job("v1", None), b"media").await.unwrap();

    let claim = queue
        .claim("small-box", ClaimSelector::Under(600.0))
        .await
        .unwrap();
    assert!(claim.is_some());
}

#[tokio::test]
async fn test_drain_is_idempotent() {
    let (queue, _store, _clock) = setup();
    for id in ["v1", "v2"] {
        queue.enqueue(&test_job(id, None), b"media").await.unwrap();
        let claim = queue
            .claim("alpha", ClaimSelector::Oldest)
            .await
            .unwrap()
            .unwrap();
        let result_ref = queue.put_result(&claim, b"text").await.unwrap();
        queue.complete(&claim, &result_ref).await.unwrap();
    }

    let ready = queue.completed().await.unwrap();
    assert_eq!(ready.len(), 2);
    for entry in &ready {
        queue.remove(entry).await.unwrap();
    }

    assert!(queue.completed().await.unwrap().is_empty());
    // a second removal pass is a no-op
    for entry in &ready {
        queue.remove(entry).await.unwrap();
    }
}

#[tokio::test]
async fn test_end_to_end_transcript_flow() {
    let (queue, _store, _clock) = setup();
    queue
        .enqueue(&test_job("v1", Some(42.0)), b"fake-media")
        .await
        .unwrap();

    let claim = queue
        .claim("remote", ClaimSelector::Oldest)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(queue.fetch_payload(&claim.job).await.unwrap(), b"fake-media");

    let result_ref = queue.put_result(&claim, b"hello").await.unwrap();
    queue.complete(&claim, &result_ref).await.unwrap();

    let ready = queue.completed().await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].job.id, "v1");
    assert_eq!(queue.fetch_result("v1").await.unwrap(), b"hello");

    queue.remove(&ready[0]).await.unwrap();
    assert!(queue.completed().await.unwrap().is_empty());
    assert!(queue.fetch_result("v1").await.is_err());

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending + stats.claimed + stats.completed + stats.dead, 0);
}

#[tokio::test]
async fn test_gc_sweeps_unreferenced_blobs() {
    let (queue, store, _clock) = setup();
    queue.enqueue(&test_job("live", None), b"media").await.unwrap();
    store.put("audio/orphan.m4a", b"stale").await.unwrap();
    store.put("texts/orphan.txt", b"stale").await.unwrap();

    let stats = queue.gc().await.unwrap();
    assert_eq!(stats.payloads, 1);
    assert_eq!(stats.results, 1);

    // the live payload is untouched
    assert!(store.get("audio/live.m4a").await.is_ok());
    assert!(store.get("audio/orphan.m4a").await.is_err());
}

#[tokio::test]
async fn test_probe_round_trips_and_cleans_up() {
    let (queue, store, _clock) = setup();
    queue.probe().await.unwrap();
    assert!(store.list(entry::HEALTH).await.unwrap().is_empty());
}
