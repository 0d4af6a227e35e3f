//! Log output setup.

use std::fmt;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Local wall-clock timestamps, second resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTimestamp;

impl FormatTime for LocalTimestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", chrono::Local::now().format(TIMESTAMP_FORMAT))
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `level`; `verbose` still lifts the default to
/// debug when `RUST_LOG` asks for less.
pub fn init(level: &str, verbose: bool) {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    tracing_subscriber::fmt()
        .with_env_filter(build_filter(env.as_deref(), level, verbose))
        .with_timer(LocalTimestamp)
        .with_target(false)
        .init();
}

fn build_filter(env: Option<&str>, level: &str, verbose: bool) -> EnvFilter {
    let filter = env
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let below_debug = filter
        .max_level_hint()
        .map_or(true, |hint| hint < LevelFilter::DEBUG);
    if verbose && below_debug {
        filter.add_directive(LevelFilter::DEBUG.into())
    } else {
        filter
    }
}
