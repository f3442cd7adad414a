use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

mod command;

pub use command::CommandTranscriber;

#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("could not launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("engine exited with status {status:?}: {detail}")]
    Engine { status: Option<i32>, detail: String },
    #[error("engine produced no transcript at {}", .0.display())]
    NoOutput(PathBuf),
    #[error("transcript io: {0}")]
    Io(#[from] std::io::Error),
}

/// Speech-to-text backend. Works on a local media file because the
/// engines we shell out to want one.
#[async_trait]
pub trait Transcriber: Send + Sync + 'static {
    async fn transcribe(
        &self,
        media: &Path,
        language: Option<&str>,
    ) -> Result<String, TranscribeError>;

    /// Name for logs.
    fn name(&self) -> &str;
}

#[cfg(test)]
pub use fixed::FixedTranscriber;
