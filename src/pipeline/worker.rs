use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::queue::{Claim, ClaimSelector, FailOutcome, QueueError, TaskQueue};
use crate::transcribe::Transcriber;

/// What one poll did, for single-shot callers that want to exit with
/// a status that reflects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Empty,
    Completed(String),
    Requeued(String),
    Dead(String),
}

/// Pulls pending media off the queue, runs the engine, publishes the
/// transcript. Any number of these can share one queue root.
pub struct RelayWorker {
    queue: Arc<TaskQueue>,
    engine: Arc<dyn Transcriber>,
    name: String,
    selector: ClaimSelector,
    interval: Duration,
}

impl RelayWorker {
    pub fn new(queue: Arc<TaskQueue>, engine: Arc<dyn Transcriber>, name: &str) -> Self {
        Self {
            queue,
            engine,
            name: name.to_string(),
            selector: ClaimSelector::default(),
            interval: Duration::from_secs(30),
        }
    }

    pub fn with_selector(mut self, selector: ClaimSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(&self) {
        info!(
            "worker {} started, engine {}, polling every {:?}",
            self.name,
            self.engine.name(),
            self.interval
        );
        loop {
            match self.poll_once().await {
                Ok(true) => continue,
                Ok(false) => sleep(self.interval).await,
                Err(e) => {
                    error!("worker {}: {:#}", self.name, e);
                    let pause = if e
                        .downcast_ref::<QueueError>()
                        .map_or(false, QueueError::is_transient)
                    {
                        self.interval
                    } else {
                        Duration::from_millis(100)
                    };
                    sleep(pause).await;
                }
            }
        }
    }

    /// One poll. `Ok(true)` means an entry was handled, success or not,
    /// and the next one should be tried right away; `Ok(false)` means
    /// the queue had nothing for us.
    pub async fn poll_once(&self) -> Result<bool> {
        Ok(self.poll_outcome().await? != PollOutcome::Empty)
    }

    pub async fn poll_outcome(&self) -> Result<PollOutcome> {
        let claim = match self.queue.claim(&self.name, self.selector).await? {
            Some(claim) => claim,
            None => return Ok(PollOutcome::Empty),
        };
        let id = claim.job.id.clone();

        info!("transcribing {} (attempt {})", id, claim.name.attempts);
        match self.process(&claim).await {
            Ok(result_ref) => match self.queue.complete(&claim, &result_ref).await {
                Ok(()) => {
                    info!("completed {id}");
                    Ok(PollOutcome::Completed(id))
                }
                Err(QueueError::NotOwned(_)) => {
                    warn!("{id} finished after its lease expired, leaving it to the next holder");
                    Ok(PollOutcome::Requeued(id))
                }
                Err(e) => Err(e.into()),
            },
            Err(e) => {
                // storage blips leave the claim alone, the lease
                // sweeper will requeue it with the attempt intact
                if e.downcast_ref::<QueueError>()
                    .map_or(false, QueueError::is_transient)
                {
                    return Err(e);
                }
                error!("transcription of {id} failed: {:#}", e);
                match self.queue.fail(&claim, &format!("{e:#}")).await {
                    Ok(FailOutcome::Requeued) => Ok(PollOutcome::Requeued(id)),
                    Ok(FailOutcome::Dead) => {
                        warn!("{id} exhausted its attempt budget");
                        Ok(PollOutcome::Dead(id))
                    }
                    Err(QueueError::NotOwned(_)) => {
                        warn!("{id} was swept while we were failing it");
                        Ok(PollOutcome::Requeued(id))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn process(&self, claim: &Claim) -> Result<String> {
        let media = self.queue.fetch_payload(&claim.job).await?;

        // the engine wants a real file with the right extension
        let scratch = tempfile::tempdir()?;
        let ext = claim
            .job
            .payload
            .rsplit_once('.')
            .map(|(_, e)| e)
            .unwrap_or("bin");
        let media_path = scratch.path().join(format!("{}.{}", claim.job.id, ext));
        tokio::fs::write(&media_path, &media).await?;

        let text = self
            .engine
            .transcribe(&media_path, claim.job.language.as_deref())
            .await?;
        let result_ref = self.queue.put_result(claim, text.as_bytes()).await?;
        Ok(result_ref)
    }
}
