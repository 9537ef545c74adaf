//! Tracing setup for the backfill job. `LOG_JSON` switches to machine-readable
//! output, `LOG_PERF` adds span-close timings.

use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use crate::env::get_env_bool;

fn flag(key: &str) -> bool {
    get_env_bool(key).unwrap_or(false)
}

pub fn init() {
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());

    let builder = if flag("LOG_PERF") {
        builder.with_span_events(FmtSpan::CLOSE)
    } else {
        builder
    };

    if flag("LOG_JSON") {
        builder.json().init();
    } else {
        builder.init();
    };
}
