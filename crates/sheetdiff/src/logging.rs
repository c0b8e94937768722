//! Process-wide logging setup.
//!
//! The library emits through both `log` macros and `tracing` spans; the
//! `log` records are bridged into the tracing subscriber so one filter
//! (`RUST_LOG`) governs everything.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "sheetdiff=info";

/// Installs the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init_tracing(json: bool) {
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };

    if result.is_err() {
        log::debug!("Tracing subscriber already installed");
    }
}
