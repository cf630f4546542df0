use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. Safe to call more than once;
/// later calls return an error that callers usually ignore with `.ok()`.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))
}
