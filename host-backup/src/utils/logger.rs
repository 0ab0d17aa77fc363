//! Logging configuration using tracing.
//!
//! The console layer writes to stderr. When a run log file is supplied, a
//! second plain-text layer writes every event at or above the file level
//! into it as events arrive.

use std::fs::File;
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Run log sink: the open file and the level it records at.
pub struct RunLogSink {
    pub file: File,
    pub level: String,
}

/// Filter for a plain level name; the name itself when it is not one.
fn level_filter(level: &str) -> Result<EnvFilter, String> {
    level
        .parse::<LevelFilter>()
        .map(|filter| EnvFilter::new(filter.to_string()))
        .map_err(|_| level.to_string())
}

/// Plain-text layer writing into the run log file.
///
/// Also returns the configured level when it had to be replaced by `info`.
pub fn run_log_layer<S>(sink: RunLogSink) -> (impl Layer<S> + Send + Sync + 'static, Option<String>)
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    let (filter, rejected) = match level_filter(&sink.level) {
        Ok(filter) => (filter, None),
        Err(level) => (EnvFilter::new("info"), Some(level)),
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(sink.file))
        .with_filter(filter);

    (layer, rejected)
}

/// Initialize logging with the specified console level and optional run log.
pub fn init(level: &str, run_log: Option<RunLogSink>) -> anyhow::Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| level_filter(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let mut rejected = None;
    let file = run_log.map(|sink| {
        let (layer, bad_level) = run_log_layer::<Registry>(sink);
        rejected = bad_level;
        layer
    });

    tracing_subscriber::registry()
        .with(file)
        .with(console)
        .try_init()?;

    if let Some(level) = rejected {
        tracing::warn!("Unknown log level '{}' in configuration; using 'info'", level);
    }

    Ok(())
}
