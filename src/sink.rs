use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::queue::Job;
use crate::summarize::Summary;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink io: {0}")]
    Io(#[from] std::io::Error),
}

/// Where finished work lands on the client side.
#[async_trait]
pub trait TranscriptSink: Send + Sync + 'static {
    async fn deliver(
        &self,
        job: &Job,
        transcript: &str,
        summary: Option<&Summary>,
    ) -> Result<(), SinkError>;
}

/// Plain directory layout: `{id}.txt` for the transcript and
/// `{id}.summary.txt` for the summary. Redelivery overwrites the same
/// files, which is what keeps the drain safe to re-run.
pub struct DirSink {
    dir: PathBuf,
}

impl DirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn transcript_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.txt"))
    }

    fn summary_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.summary.txt"))
    }

    pub async fn read_transcript(&self, id: &str) -> Result<String, SinkError> {
        Ok(fs::read_to_string(self.transcript_path(id)).await?)
    }

    pub async fn write_summary(&self, id: &str, text: &str) -> Result<(), SinkError> {
        fs::write(self.summary_path(id), text).await?;
        Ok(())
    }

    /// Ids that got a transcript but never a summary, usually because
    /// every provider was down when the drain ran.
    pub async fn missing_summaries(&self) -> Result<Vec<String>, SinkError> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(ent) = entries.next_entry().await? {
            let name = ent.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            let id = match name.strip_suffix(".txt") {
                Some(i) => i,
                None => continue,
            };
            // summaries themselves end in .txt
            if id.ends_with(".summary") {
                continue;
            }
            if fs::metadata(self.summary_path(id)).await.is_err() {
                out.push(id.to_string());
            }
        }
        out.sort();
        Ok(out)
    }
}

#[async_trait]
impl TranscriptSink for DirSink {
    async fn deliver(
        &self,
        job: &Job,
        transcript: &str,
        summary: Option<&Summary>,
    ) -> Result<(), SinkError> {
        fs::create_dir_all(&self.dir).await?;
        fs::write(self.transcript_path(&job.id), transcript).await?;
        if let Some(summary) = summary {
            let mut body = String::new();
            if let Some(title) = &job.title {
                body.push_str(&format!("# {title}\n\n"));
            }
            body.push_str(&summary.text);
            fs::write(self.summary_path(&job.id), body).await?;
        }
        info!("delivered {} to {}", job.id, self.dir.display());
        Ok(())
    }
}
