use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Initialize tracing for binaries and tests embedding the client core.
///
/// Filter resolution order: `THREADBRIDGE_LOG_FILTER`, then `RUST_LOG`, then
/// the default. Safe to call more than once; later calls are no-ops.
pub fn init_logging() -> anyhow::Result<()> {
    let filter = std::env::var("THREADBRIDGE_LOG_FILTER")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init();

    // Already-initialized is fine (tests call this repeatedly).
    if result.is_ok() {
        tracing::debug!(
            component = "logging",
            event = "logging.initialized",
        );
    }
    Ok(())
}
