use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::queue::{QueueError, TaskQueue};
use crate::sink::{DirSink, TranscriptSink};
use crate::storage::StorageError;
use crate::summarize::Multiplexer;

/// Client-side collector: moves finished transcripts out of the queue,
/// summarizes them, and hands both to the sink.
pub struct DrainRunner {
    queue: Arc<TaskQueue>,
    sink: Arc<dyn TranscriptSink>,
    mux: Option<Arc<Multiplexer>>,
    interval: Duration,
}

impl DrainRunner {
    pub fn new(queue: Arc<TaskQueue>, sink: Arc<dyn TranscriptSink>) -> Self {
        Self {
            queue,
            sink,
            mux: None,
            interval: Duration::from_secs(60),
        }
    }

    pub fn with_multiplexer(mut self, mux: Arc<Multiplexer>) -> Self {
        self.mux = Some(mux);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(&self) {
        info!("drain started, polling every {:?}", self.interval);
        loop {
            match self.drain_once().await {
                Ok(n) if n > 0 => continue,
                Ok(_) => sleep(self.interval).await,
                Err(e) => {
                    error!("drain pass failed: {:#}", e);
                    sleep(self.interval).await;
                }
            }
        }
    }

    /// One pass over everything completed. Returns how many entries
    /// were collected.
    pub async fn drain_once(&self) -> Result<usize> {
        let ready = self.queue.completed().await?;
        let mut collected = 0;

        for entry in ready {
            let bytes = match self.queue.fetch_result(&entry.job.id).await {
                Ok(b) => b,
                Err(QueueError::Storage(StorageError::NotFound(path))) => {
                    warn!(
                        "completed entry {} has no transcript at {}, skipping",
                        entry.job.id, path
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let transcript = match String::from_utf8(bytes) {
                Ok(t) => t,
                Err(_) => {
                    warn!("transcript for {} is not utf-8, skipping", entry.job.id);
                    continue;
                }
            };

            // a dead summarizer must never hold transcripts hostage
            let summary = match &self.mux {
                Some(mux) => match mux.summarize(&transcript).await {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!("summarization of {} failed: {}", entry.job.id, e);
                        None
                    }
                },
                None => None,
            };

            self.sink
                .deliver(&entry.job, &transcript, summary.as_ref())
                .await?;
            self.queue.remove(&entry).await?;
            collected += 1;
            info!("collected {}", entry.job.id);
        }

        Ok(collected)
    }
}

/// Repair pass for transcripts that were delivered without a summary.
/// Works off the sink directory, not the queue, so it still applies
/// long after the entries are gone.
pub async fn resummarize(sink: &DirSink, mux: &Multiplexer) -> Result<usize> {
    let mut repaired = 0;
    for id in sink.missing_summaries().await? {
        let transcript = sink.read_transcript(&id).await?;
        match mux.summarize(&transcript).await {
            Ok(summary) => {
                sink.write_summary(&id, &summary.text).await?;
                repaired += 1;
                info!("backfilled summary for {id}");
            }
            Err(e) => warn!("still cannot summarize {id}: {e}"),
        }
    }
    Ok(repaired)
}
