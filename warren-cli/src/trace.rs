//! Tracing subscriber initialization (spec §10.5).

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, filter::Directive, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a single process-wide subscriber: `RUST_LOG`-style env filter
/// layered over a human-readable writer, defaulting to `default_directive`
/// for any target the environment doesn't mention. `RUST_LOG` always wins
/// over the configured default when both are present.
pub fn init_tracing(default_directive: impl Into<Directive>) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(default_directive.into())
                .from_env_lossy(),
        )
        .init();
}

/// Parses a config/CLI `log_level` string (`trace`/`debug`/`info`/`warn`/
/// `error`) into a default directive, falling back to `info` for anything
/// unrecognized rather than failing startup over a logging knob.
#[must_use]
pub fn level_from_str(level: &str) -> LevelFilter {
    level.parse().unwrap_or(LevelFilter::INFO)
}
