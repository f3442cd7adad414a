pub mod config;
pub mod pipeline;
pub mod queue;
pub mod sink;
pub mod storage;
pub mod summarize;
pub mod transcribe;
pub mod utils;

/// Build stamp from `git describe`, for the startup banner.
pub const GIT_HASH: &str = env!("GIT_HASH");
