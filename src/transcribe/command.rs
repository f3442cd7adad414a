use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{TranscribeError, Transcriber};

/// Shells out to a whisper-style CLI: the engine gets the media path
/// plus `--model/--output_format/--output_dir`, writes `{stem}.txt`
/// into a scratch directory, and we read that back. Both openai-whisper
/// and whisper-ctranslate2 speak this argument convention.
pub struct CommandTranscriber {
    program: String,
    model: String,
    extra_args: Vec<String>,
}

impl CommandTranscriber {
    pub fn new(program: &str, model: &str, extra_args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            model: model.to_string(),
            extra_args,
        }
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(
        &self,
        media: &Path,
        language: Option<&str>,
    ) -> Result<String, TranscribeError> {
        let out_dir = tempfile::tempdir()?;

        let mut cmd = Command::new(&self.program);
        cmd.arg(media)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_format")
            .arg("txt")
            .arg("--output_dir")
            .arg(out_dir.path());
        if let Some(lang) = language {
            cmd.arg("--language").arg(lang);
        }
        for arg in &self.extra_args {
            cmd.arg(arg);
        }
        cmd.stdin(Stdio::null());

        info!("running {} on {}", self.program, media.display());
        let output = cmd
            .output()
            .await
            .map_err(|source| TranscribeError::Launch {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscribeError::Engine {
                status: output.status.code(),
                detail: stderr.chars().take(2000).collect(),
            });
        }

        let stem = media
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| TranscribeError::NoOutput(media.to_path_buf()))?;
        let text_path = out_dir.path().join(format!("{stem}.txt"));
        let text = tokio::fs::read_to_string(&text_path)
            .await
            .map_err(|_| TranscribeError::NoOutput(text_path.clone()))?;

        debug!("engine produced {} chars", text.len());
        Ok(text.trim().to_string())
    }

    fn name(&self) -> &str {
        &self.program
    }
}
