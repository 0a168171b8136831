// SPDX-License-Identifier: Apache-2.0

//! Thin structured-logging façade over `tracing`, so call sites write
//! `ledger_logger::info!(block_id = %id, "committed block")` instead of
//! depending on `tracing` directly. Keeping one place to change the
//! logging backend is the only reason this crate exists.

pub mod prelude {
    pub use tracing::{debug, error, info, trace, warn};
}

use serde::Serialize;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Output format for the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Compact
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Installs the global `tracing` subscriber. Call once at process startup;
/// a second call is a no-op (mirrors `tracing`'s own idempotence guard).
pub fn init(format: LogFormat, default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Compact => subscriber.compact().try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
    // Re-initializing (e.g. in tests that each call init()) is expected; only
    // surface genuinely unexpected failures.
    if let Err(err) = result {
        tracing::debug!("logger already initialized: {err}");
    }
}

/// Structured event fields shared across the core's subsystems, attached to
/// log lines the way the teacher attaches `block_id`/`round` to every
/// consensus log line.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerEvent<'a> {
    pub block_id: Option<&'a str>,
    pub batch_id: Option<&'a str>,
    pub chain_head: Option<&'a str>,
}
