use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::storage::{BlobStore, StorageError};

pub mod clock;
pub mod entry;

#[cfg(test)]
mod tests;

pub use clock::{Clock, SystemClock};
pub use entry::{EntryName, Job};

use entry::{CLAIMED, COMPLETED, DEAD, PENDING};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} is already queued")]
    AlreadyExists(String),
    #[error("claim on job {0} is no longer held")]
    NotOwned(String),
    #[error("invalid identifier {0:?}")]
    InvalidId(String),
    #[error("result {path:?} is not where job {id} publishes")]
    ResultMismatch { id: String, path: String },
    #[error("unrecognized queue entry name {0:?}")]
    BadEntryName(String),
    #[error("entry body codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl QueueError {
    /// Worth a pause-and-retry rather than giving up.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Storage(e) if e.is_transient())
    }
}

/// Which pending entry a worker takes first. `Under` refuses media
/// longer than the limit, for boxes that cannot keep up with long
/// recordings; `PreferOver` takes the long ones first and falls back
/// to the rest. Unknown durations count as short.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimSelector {
    #[default]
    Oldest,
    Under(f64),
    PreferOver(f64),
}

/// A held entry. Everything `complete` and `fail` need to name the
/// claimed blob exactly.
#[derive(Debug, Clone)]
pub struct Claim {
    pub job: Job,
    /// stamp is the claim time, attempts counts this attempt
    pub name: EntryName,
    pub worker: String,
}

impl Claim {
    fn blob_path(&self) -> String {
        format!("{CLAIMED}/{}", self.name.encode_claimed(&self.worker))
    }
}

#[derive(Debug, Clone)]
pub struct CompletedEntry {
    pub name: EntryName,
    pub job: Job,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued,
    Dead,
}

#[derive(Debug, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub claimed: usize,
    pub completed: usize,
    pub dead: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct GcStats {
    pub payloads: usize,
    pub results: usize,
}

/// The queue protocol over a shared blob store. Every state change is
/// one exclusive rename, so any number of workers and drains can point
/// at the same root with no coordinator.
pub struct TaskQueue {
    store: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    lease: Duration,
    max_attempts: u32,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn BlobStore>, lease_secs: u64, max_attempts: u32) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), lease_secs, max_attempts)
    }

    pub fn with_clock(
        store: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        lease_secs: u64,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            clock,
            lease: Duration::seconds(lease_secs as i64),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Create the namespaces on a fresh store root.
    pub async fn init(&self) -> Result<(), QueueError> {
        for ns in [
            PENDING,
            CLAIMED,
            COMPLETED,
            DEAD,
            entry::PAYLOADS,
            entry::RESULTS,
        ] {
            self.store.ensure_prefix(ns).await?;
        }
        Ok(())
    }

    /// Queue a job together with its media payload. Fails with
    /// `AlreadyExists` while the id is in pending, claimed or
    /// completed; dead entries do not block a re-drive.
    pub async fn enqueue(&self, job: &Job, payload: &[u8]) -> Result<(), QueueError> {
        entry::validate_id(&job.id)?;
        let body = serde_json::to_vec(job)?;

        for ns in [PENDING, COMPLETED] {
            for raw in self.store.list(ns).await? {
                if let Ok(parsed) = EntryName::decode(&raw) {
                    if parsed.id == job.id {
                        return Err(QueueError::AlreadyExists(job.id.clone()));
                    }
                }
            }
        }
        for raw in self.store.list(CLAIMED).await? {
            if let Ok((parsed, _)) = EntryName::decode_claimed(&raw) {
                if parsed.id == job.id {
                    return Err(QueueError::AlreadyExists(job.id.clone()));
                }
            }
        }

        // media first so a claimed entry always finds its payload
        self.store.put(&job.payload, payload).await?;
        let name = EntryName {
            stamp: self.clock.now(),
            attempts: 0,
            id: job.id.clone(),
        };
        self.store
            .put(&format!("{PENDING}/{}", name.encode()), &body)
            .await?;
        info!("enqueued job {} ({} media bytes)", job.id, payload.len());
        Ok(())
    }

    /// Take the next workable entry after sweeping expired leases.
    /// `Ok(None)` means nothing claimable right now. Losing a rename
    /// race moves on to the next candidate instead of failing.
    pub async fn claim(
        &self,
        worker: &str,
        selector: ClaimSelector,
    ) -> Result<Option<Claim>, QueueError> {
        entry::validate_worker(worker)?;
        self.sweep_expired().await?;

        let mut names = self.store.list(PENDING).await?;
        names.sort();

        let mut candidates = Vec::new();
        for raw in names {
            let parsed = match EntryName::decode(&raw) {
                Ok(p) => p,
                Err(_) => {
                    warn!("skipping unrecognized pending entry {raw:?}");
                    continue;
                }
            };
            let body = match self.store.get(&format!("{PENDING}/{raw}")).await {
                Ok(b) => b,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let job: Job = match serde_json::from_slice(&body) {
                Ok(j) => j,
                Err(e) => {
                    warn!("pending entry {raw:?} has an unreadable body: {e}");
                    continue;
                }
            };
            candidates.push((raw, parsed, job));
        }

        for (raw, parsed, job) in order_candidates(candidates, selector) {
            let claimed = EntryName {
                stamp: self.clock.now(),
                attempts: parsed.attempts + 1,
                id: parsed.id.clone(),
            };
            let from = format!("{PENDING}/{raw}");
            let to = format!("{CLAIMED}/{}", claimed.encode_claimed(worker));
            match self.store.rename(&from, &to).await {
                Ok(()) => {
                    info!(
                        "{worker} claimed job {} (attempt {}/{})",
                        job.id, claimed.attempts, self.max_attempts
                    );
                    return Ok(Some(Claim {
                        job,
                        name: claimed,
                        worker: worker.to_string(),
                    }));
                }
                // somebody else moved it first
                Err(StorageError::NotFound(_)) | Err(StorageError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Media bytes for a claimed job.
    pub async fn fetch_payload(&self, job: &Job) -> Result<Vec<u8>, QueueError> {
        Ok(self.store.get(&job.payload).await?)
    }

    /// Store the transcript for a held claim and mint the reference
    /// `complete` expects.
    pub async fn put_result(&self, claim: &Claim, text: &[u8]) -> Result<String, QueueError> {
        let path = entry::result_path(&claim.job.id);
        self.store.put(&path, text).await?;
        Ok(path)
    }

    /// Publish a finished job. The move only succeeds while the claim
    /// is still held; a swept lease surfaces as `NotOwned`.
    pub async fn complete(&self, claim: &Claim, result_ref: &str) -> Result<(), QueueError> {
        let expected = entry::result_path(&claim.job.id);
        if result_ref != expected {
            return Err(QueueError::ResultMismatch {
                id: claim.job.id.clone(),
                path: result_ref.to_string(),
            });
        }
        let done = EntryName {
            stamp: self.clock.now(),
            attempts: claim.name.attempts,
            id: claim.job.id.clone(),
        };
        let to = format!("{COMPLETED}/{}", done.encode());
        match self.store.rename(&claim.blob_path(), &to).await {
            Ok(()) => {
                info!(
                    "job {} completed on attempt {}",
                    claim.job.id, claim.name.attempts
                );
                Ok(())
            }
            Err(StorageError::NotFound(_)) => Err(QueueError::NotOwned(claim.job.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Report a failed attempt. Requeues, or dead-letters once the
    /// attempt budget is spent. The reason goes to the log only; entry
    /// bodies never change after enqueue.
    pub async fn fail(&self, claim: &Claim, reason: &str) -> Result<FailOutcome, QueueError> {
        let next = EntryName {
            stamp: self.clock.now(),
            attempts: claim.name.attempts,
            id: claim.job.id.clone(),
        };
        let (to, outcome) = if claim.name.attempts >= self.max_attempts {
            (format!("{DEAD}/{}", next.encode()), FailOutcome::Dead)
        } else {
            (format!("{PENDING}/{}", next.encode()), FailOutcome::Requeued)
        };
        match self.store.rename(&claim.blob_path(), &to).await {
            Ok(()) => {
                match outcome {
                    FailOutcome::Dead => error!(
                        "job {} dead after {} attempts: {reason}",
                        claim.job.id, claim.name.attempts
                    ),
                    FailOutcome::Requeued => warn!(
                        "job {} attempt {} failed, requeued: {reason}",
                        claim.job.id, claim.name.attempts
                    ),
                }
                Ok(outcome)
            }
            Err(StorageError::NotFound(_)) => Err(QueueError::NotOwned(claim.job.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Completed entries ready to collect, oldest first. Entries that
    /// vanish mid-read were collected by another drain and are skipped.
    pub async fn completed(&self) -> Result<Vec<CompletedEntry>, QueueError> {
        let mut names = self.store.list(COMPLETED).await?;
        names.sort();

        let mut out = Vec::new();
        for raw in names {
            let name = match EntryName::decode(&raw) {
                Ok(n) => n,
                Err(_) => {
                    warn!("skipping unrecognized completed entry {raw:?}");
                    continue;
                }
            };
            let body = match self.store.get(&format!("{COMPLETED}/{raw}")).await {
                Ok(b) => b,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice(&body) {
                Ok(job) => out.push(CompletedEntry { name, job }),
                Err(e) => warn!("completed entry {raw:?} has an unreadable body: {e}"),
            }
        }
        Ok(out)
    }

    /// Transcript bytes for a completed job.
    pub async fn fetch_result(&self, job_id: &str) -> Result<Vec<u8>, QueueError> {
        Ok(self.store.get(&entry::result_path(job_id)).await?)
    }

    /// Drop a collected entry and the blobs it owns. Safe to repeat:
    /// deleting what is already gone succeeds.
    pub async fn remove(&self, entry: &CompletedEntry) -> Result<(), QueueError> {
        // entry first, so a crash strands orphan blobs for gc instead
        // of a completed entry pointing at nothing
        self.store
            .delete(&format!("{COMPLETED}/{}", entry.name.encode()))
            .await?;
        self.store.delete(&entry::result_path(&entry.job.id)).await?;
        self.store.delete(&entry.job.payload).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            pending: self.store.list(PENDING).await?.len(),
            claimed: self.store.list(CLAIMED).await?.len(),
            completed: self.store.list(COMPLETED).await?.len(),
            dead: self.store.list(DEAD).await?.len(),
        })
    }

    /// Delete media and transcript blobs no entry references any more.
    /// Meant for quiet periods: an enqueue racing the sweep can lose
    /// its freshly uploaded payload.
    pub async fn gc(&self) -> Result<GcStats, QueueError> {
        let mut live = HashSet::new();
        for ns in [PENDING, COMPLETED, DEAD] {
            for raw in self.store.list(ns).await? {
                if let Ok(name) = EntryName::decode(&raw) {
                    live.insert(name.id);
                }
            }
        }
        for raw in self.store.list(CLAIMED).await? {
            if let Ok((name, _)) = EntryName::decode_claimed(&raw) {
                live.insert(name.id);
            }
        }

        let mut stats = GcStats::default();
        for raw in self.store.list(entry::PAYLOADS).await? {
            let id = raw.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(&raw);
            if !live.contains(id) {
                self.store
                    .delete(&format!("{}/{raw}", entry::PAYLOADS))
                    .await?;
                stats.payloads += 1;
            }
        }
        for raw in self.store.list(entry::RESULTS).await? {
            let id = raw.strip_suffix(".txt").unwrap_or(&raw);
            if !live.contains(id) {
                self.store
                    .delete(&format!("{}/{raw}", entry::RESULTS))
                    .await?;
                stats.results += 1;
            }
        }
        info!(
            "gc removed {} payloads and {} transcripts",
            stats.payloads, stats.results
        );
        Ok(stats)
    }

    /// End-to-end round trip against the store, for availability
    /// checks before anything joins the queue.
    pub async fn probe(&self) -> Result<(), QueueError> {
        let path = format!("{}/{}.txt", entry::HEALTH, Uuid::new_v4());
        let stamp = self.clock.now().to_rfc3339();
        self.store.ensure_prefix(entry::HEALTH).await?;
        self.store.put(&path, stamp.as_bytes()).await?;
        let back = self.store.get(&path).await?;
        self.store.delete(&path).await?;
        if back != stamp.as_bytes() {
            return Err(QueueError::Storage(StorageError::Protocol(
                "probe read back different bytes".into(),
            )));
        }
        Ok(())
    }

    /// Move expired leases back to pending, or to dead once the
    /// attempt budget is spent. A crashed worker and a failing worker
    /// burn the same budget.
    async fn sweep_expired(&self) -> Result<(), QueueError> {
        let now = self.clock.now();
        for raw in self.store.list(CLAIMED).await? {
            let (parsed, holder) = match EntryName::decode_claimed(&raw) {
                Ok(v) => v,
                Err(_) => {
                    warn!("skipping unrecognized claimed entry {raw:?}");
                    continue;
                }
            };
            if now - parsed.stamp <= self.lease {
                continue;
            }
            let from = format!("{CLAIMED}/{raw}");
            let next = EntryName {
                stamp: now,
                attempts: parsed.attempts,
                id: parsed.id.clone(),
            };
            if parsed.attempts >= self.max_attempts {
                if self
                    .transition(&from, &format!("{DEAD}/{}", next.encode()))
                    .await?
                {
                    error!(
                        "job {} lease from {holder} expired on final attempt {}, dead-lettered",
                        parsed.id, parsed.attempts
                    );
                }
            } else if self
                .transition(&from, &format!("{PENDING}/{}", next.encode()))
                .await?
            {
                warn!(
                    "job {} lease from {holder} expired, requeued after attempt {}",
                    parsed.id, parsed.attempts
                );
            }
        }
        Ok(())
    }

    // one atomic transition; false means somebody else moved it first
    async fn transition(&self, from: &str, to: &str) -> Result<bool, QueueError> {
        match self.store.rename(from, to).await {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound(_)) | Err(StorageError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

type Candidate = (String, EntryName, Job);

fn order_candidates(candidates: Vec<Candidate>, selector: ClaimSelector) -> Vec<Candidate> {
    match selector {
        ClaimSelector::Oldest => candidates,
        ClaimSelector::Under(limit) => candidates
            .into_iter()
            .filter(|(_, _, job)| job.duration_secs.map_or(true, |d| d <= limit))
            .collect(),
        ClaimSelector::PreferOver(limit) => {
            let (over, rest): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|(_, _, job)| job.duration_secs.map_or(false, |d| d > limit));
            over.into_iter().chain(rest).collect()
        }
    }
}
