use std::io::{self, IsTerminal};

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

/// RFC3339 UTC timer. Example output: `2026-07-27T10:20:30Z`.
#[derive(Clone, Debug, Default)]
struct ChronoRfc3339Utc;

impl FormatTime for ChronoRfc3339Utc {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        w.write_str(&now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
    }
}

/// Installs the process-wide subscriber. `RUST_LOG` controls the global
/// level (default `info`); request-handler spans in `sync_http_api` default
/// to `debug` unless `RUST_LOG` already mentions that target.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sync_http_api=debug"));

    tracing_subscriber::fmt()
        .with_timer(ChronoRfc3339Utc)
        .with_level(true)
        .with_target(true)
        .with_ansi(io::stdout().is_terminal())
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .with_env_filter(filter)
        .finish()
        .try_init()
        .ok();
}
