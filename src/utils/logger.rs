use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Console plus a daily-rolled file under `dir`. The returned guard
/// flushes the file writer; keep it alive for the life of the process.
pub fn init(dir: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(dir)?;
    let file = tracing_appender::rolling::daily(dir, "stt-relay.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    Ok(guard)
}
