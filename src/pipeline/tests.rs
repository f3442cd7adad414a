use std::sync::Arc;

use chrono::Utc;

use super::*;
use crate::queue::{entry, ClaimSelector, Job, TaskQueue};
use crate::sink::{DirSink, TranscriptSink};
use crate::storage::MemoryStore;
use crate::summarize::{FixedProvider, Multiplexer, ReducePolicy};
use crate::transcribe::FixedTranscriber;

fn queue() -> Arc<TaskQueue> {
    Arc::new(TaskQueue::new(Arc::new(MemoryStore::new()), 600, 2))
}

fn job(id: &str) -> Job {
    Job {
        id: id.to_string(),
        payload: entry::payload_path(id, "m4a"),
        duration_secs: Some(30.0),
        language: None,
        title: Some(format!("video {id}")),
        created_at: Utc::now(),
    }
}

fn mux_of(provider: FixedProvider) -> Arc<Multiplexer> {
    Arc::new(Multiplexer::new(vec![Arc::new(provider)], 5, 0, ReducePolicy::FirstOk).unwrap())
}

#[tokio::test]
async fn test_worker_completes_a_job() {
    let queue = queue();
    queue.enqueue(&job("v1"), b"media bytes").await.unwrap();

    let worker = RelayWorker::new(
        queue.clone(),
        Arc::new(FixedTranscriber::ok("the text")),
        "w1",
    );
    assert!(worker.poll_once().await.unwrap());

    let done = queue.completed().await.unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].job.id, "v1");
    assert_eq!(queue.fetch_result("v1").await.unwrap(), b"the text");

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.claimed, 0);
}

#[tokio::test]
async fn test_worker_idles_on_empty_queue() {
    let worker = RelayWorker::new(queue(), Arc::new(FixedTranscriber::ok("x")), "w1");
    assert!(!worker.poll_once().await.unwrap());
}

#[tokio::test]
async fn test_engine_failures_requeue_then_dead_letter() {
    // budget of 2 attempts
    let queue = queue();
    queue.enqueue(&job("bad"), b"media").await.unwrap();
    let worker = RelayWorker::new(
        queue.clone(),
        Arc::new(FixedTranscriber::failing("corrupt input")),
        "w1",
    );

    assert_eq!(
        worker.poll_outcome().await.unwrap(),
        PollOutcome::Requeued("bad".to_string())
    );
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 1, "first failure goes back to pending");

    assert_eq!(
        worker.poll_outcome().await.unwrap(),
        PollOutcome::Dead("bad".to_string())
    );
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.dead, 1, "second failure exhausts the budget");
}

#[tokio::test]
async fn test_worker_selector_filters_claims() {
    let queue = queue();
    let mut long = job("long");
    long.duration_secs = Some(7200.0);
    queue.enqueue(&long, b"media").await.unwrap();

    let worker = RelayWorker::new(queue.clone(), Arc::new(FixedTranscriber::ok("x")), "w1")
        .with_selector(ClaimSelector::Under(600.0));
    assert!(
        !worker.poll_once().await.unwrap(),
        "long media is not for this box"
    );
    assert_eq!(queue.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_drain_collects_to_sink() {
    let queue = queue();
    queue.enqueue(&job("v1"), b"media").await.unwrap();
    let worker = RelayWorker::new(
        queue.clone(),
        Arc::new(FixedTranscriber::ok("full transcript")),
        "w1",
    );
    assert!(worker.poll_once().await.unwrap());

    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(DirSink::new(dir.path()));
    let drain = DrainRunner::new(queue.clone(), sink.clone())
        .with_multiplexer(mux_of(FixedProvider::ok("mock", "tl;dr")));

    assert_eq!(drain.drain_once().await.unwrap(), 1);

    assert_eq!(sink.read_transcript("v1").await.unwrap(), "full transcript");
    let body = tokio::fs::read_to_string(dir.path().join("v1.summary.txt"))
        .await
        .unwrap();
    assert!(body.contains("tl;dr"));

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 0);
    assert!(queue.fetch_result("v1").await.is_err(), "blobs went with the entry");

    assert_eq!(drain.drain_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_drain_delivers_even_when_summarizer_is_down() {
    let queue = queue();
    queue.enqueue(&job("v1"), b"media").await.unwrap();
    let worker = RelayWorker::new(
        queue.clone(),
        Arc::new(FixedTranscriber::ok("text")),
        "w1",
    );
    assert!(worker.poll_once().await.unwrap());

    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(DirSink::new(dir.path()));
    let drain = DrainRunner::new(queue.clone(), sink.clone())
        .with_multiplexer(mux_of(FixedProvider::failing("dead")));

    assert_eq!(drain.drain_once().await.unwrap(), 1);
    assert_eq!(sink.read_transcript("v1").await.unwrap(), "text");
    assert!(
        tokio::fs::metadata(dir.path().join("v1.summary.txt"))
            .await
            .is_err(),
        "no summary when every provider fails"
    );
    assert_eq!(queue.stats().await.unwrap().completed, 0);
}

#[tokio::test]
async fn test_resummarize_backfills_missing_summaries() {
    let dir = tempfile::tempdir().unwrap();
    let sink = DirSink::new(dir.path());
    sink.deliver(&job("v1"), "the transcript", None)
        .await
        .unwrap();

    let mux = mux_of(FixedProvider::ok("mock", "late summary"));
    assert_eq!(resummarize(&sink, &mux).await.unwrap(), 1);

    assert!(sink.missing_summaries().await.unwrap().is_empty());
    let body = tokio::fs::read_to_string(dir.path().join("v1.summary.txt"))
        .await
        .unwrap();
    assert_eq!(body, "late summary");

    // nothing left to repair
    assert_eq!(resummarize(&sink, &mux).await.unwrap(), 0);
}
