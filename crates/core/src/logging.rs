use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

const DEFAULT_FILTER: &str = "info";

fn build_env_filter_from(blobshift_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new(DEFAULT_FILTER);

    if let Some(v) = blobshift_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var("BLOBSHIFT_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// Installs a JSON tracing subscriber writing to stderr. Later calls are no-ops.
pub fn init_logging() {
    TRACING_INIT.get_or_init(|| {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(std::io::stderr);

        let subscriber = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(layer);
        let _ = subscriber.try_init();
    });
}
