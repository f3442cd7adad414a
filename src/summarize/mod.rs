use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub mod provider;
pub mod registry;

pub use provider::{ProviderError, SummaryProvider};
pub use registry::ProviderConfig;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("no providers configured")]
    NoProviders,
    #[error("duplicate provider name {0:?}")]
    DuplicateProvider(String),
    #[error("all {} providers failed", .0.len())]
    AllProvidersFailed(Vec<SummaryResult>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Ok,
    Error,
    Timeout,
}

/// What one provider did with one transcript.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryResult {
    pub provider: String,
    pub status: DispatchStatus,
    pub text: Option<String>,
    pub detail: Option<String>,
    pub latency_ms: u64,
}

/// The reduced outcome plus the full per-provider record for logs.
#[derive(Debug, Clone)]
pub struct Summary {
    pub text: String,
    pub sources: Vec<String>,
    pub results: Vec<SummaryResult>,
}

/// How multiple successful answers collapse into one text. `FirstOk`
/// takes the first success in configured priority order; `MergeAll`
/// keeps every success under a per-provider heading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReducePolicy {
    #[default]
    FirstOk,
    MergeAll,
}

struct Slot {
    provider: Arc<dyn SummaryProvider>,
    limiter: Option<Arc<DirectRateLimiter>>,
}

/// Fans one transcript out to every configured provider at once. Each
/// backend has its own pacing and its own timeout; one of them being
/// slow, dead or misconfigured never touches the others.
pub struct Multiplexer {
    slots: Vec<Slot>,
    timeout: Duration,
    retries: u32,
    policy: ReducePolicy,
}

impl Multiplexer {
    pub fn new(
        providers: Vec<Arc<dyn SummaryProvider>>,
        timeout_secs: u64,
        retries: u32,
        policy: ReducePolicy,
    ) -> Result<Self, SummarizeError> {
        if providers.is_empty() {
            return Err(SummarizeError::NoProviders);
        }
        let mut seen = HashSet::new();
        for p in &providers {
            if !seen.insert(p.name().to_string()) {
                return Err(SummarizeError::DuplicateProvider(p.name().to_string()));
            }
        }
        let slots = providers
            .into_iter()
            .map(|provider| {
                let limiter = Duration::try_from_secs_f64(provider.min_interval())
                    .ok()
                    .and_then(Quota::with_period)
                    .map(|quota| Arc::new(RateLimiter::direct(quota)));
                Slot { provider, limiter }
            })
            .collect();
        Ok(Self {
            slots,
            timeout: Duration::from_secs(timeout_secs),
            retries,
            policy,
        })
    }

    pub fn from_configs(
        configs: &[ProviderConfig],
        timeout_secs: u64,
        retries: u32,
        policy: ReducePolicy,
    ) -> Result<Self, SummarizeError> {
        Self::new(registry::build(configs), timeout_secs, retries, policy)
    }

    /// Summarize through every provider and reduce per policy. Fails
    /// only when nobody produced a usable answer.
    pub async fn summarize(&self, transcript: &str) -> Result<Summary, SummarizeError> {
        let results = self.dispatch_all(transcript).await;
        self.reduce(results)
    }

    /// One tiny round trip per provider, reporting who answers. The
    /// availability check runs this before anything enters the queue.
    pub async fn check(&self) -> Vec<SummaryResult> {
        self.dispatch_all("Reply with the single word: ok").await
    }

    async fn dispatch_all(&self, transcript: &str) -> Vec<SummaryResult> {
        let mut set = JoinSet::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            let provider = slot.provider.clone();
            let limiter = slot.limiter.clone();
            let transcript = transcript.to_string();
            let timeout = self.timeout;
            let retries = self.retries;
            set.spawn(async move {
                (
                    idx,
                    dispatch_with_retry(provider, limiter, &transcript, timeout, retries).await,
                )
            });
        }

        // collect in slot order so reduction sees configured priority,
        // not completion order
        let mut by_slot: Vec<Option<SummaryResult>> = vec![None; self.slots.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => by_slot[idx] = Some(result),
                Err(e) => warn!("summary dispatch task failed to join: {e}"),
            }
        }
        by_slot.into_iter().flatten().collect()
    }

    fn reduce(&self, results: Vec<SummaryResult>) -> Result<Summary, SummarizeError> {
        match self.policy {
            ReducePolicy::FirstOk => {
                for r in &results {
                    if r.status == DispatchStatus::Ok {
                        if let Some(text) = &r.text {
                            return Ok(Summary {
                                text: text.clone(),
                                sources: vec![r.provider.clone()],
                                results,
                            });
                        }
                    }
                }
                Err(SummarizeError::AllProvidersFailed(results))
            }
            ReducePolicy::MergeAll => {
                let mut sections = Vec::new();
                let mut sources = Vec::new();
                for r in &results {
                    if r.status == DispatchStatus::Ok {
                        if let Some(text) = &r.text {
                            sections.push(format!("## {}\n\n{}", r.provider, text.trim()));
                            sources.push(r.provider.clone());
                        }
                    }
                }
                if sections.is_empty() {
                    return Err(SummarizeError::AllProvidersFailed(results));
                }
                Ok(Summary {
                    text: sections.join("\n\n"),
                    sources,
                    results,
                })
            }
        }
    }
}

async fn dispatch_with_retry(
    provider: Arc<dyn SummaryProvider>,
    limiter: Option<Arc<DirectRateLimiter>>,
    transcript: &str,
    timeout: Duration,
    retries: u32,
) -> SummaryResult {
    let started = Instant::now();
    let mut attempt = 0;
    let err = loop {
        // pacing wait happens outside the dispatch timeout
        if let Some(limiter) = &limiter {
            limiter.until_ready().await;
        }
        attempt += 1;
        let outcome = match tokio::time::timeout(timeout, provider.dispatch(transcript)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::Timeout),
        };
        match outcome {
            Ok(text) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                debug!("{} answered in {latency_ms}ms", provider.name());
                return SummaryResult {
                    provider: provider.name().to_string(),
                    status: DispatchStatus::Ok,
                    text: Some(text),
                    detail: None,
                    latency_ms,
                };
            }
            Err(e) if e.is_retryable() && attempt <= retries => {
                warn!("{} attempt {attempt} failed ({e}), retrying", provider.name());
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt - 1).min(8))).await;
            }
            Err(e) => break e,
        }
    };

    let status = if matches!(err, ProviderError::Timeout) {
        DispatchStatus::Timeout
    } else {
        DispatchStatus::Error
    };
    warn!("{} gave up after {attempt} attempts: {err}", provider.name());
    SummaryResult {
        provider: provider.name().to_string(),
        status,
        text: None,
        detail: Some(err.to_string()),
        latency_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
pub use fixed::FixedProvider;
