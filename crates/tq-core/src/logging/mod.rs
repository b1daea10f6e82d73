//! Structured logging for telq.
//!
//! Two output modes, both on stderr:
//! - Human-readable console output for interactive use
//! - Machine-parseable JSONL for hosts that ship logs elsewhere
//!
//! stdout is reserved for command payloads. Event properties and user ids
//! are never logged; records carry ids and counts only.

pub mod config;

pub use config::{LogConfig, LogFormat, LogLevel, ENV_LOG, ENV_LOG_FORMAT};

use std::io::IsTerminal;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose records the default filter lets through.
const TQ_TARGETS: [&str; 5] = ["tq_core", "tq_queue", "tq_config", "tq_redact", "tq"];

fn default_filter(level: LogLevel) -> EnvFilter {
    let directives = TQ_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::new(directives)
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `config.level` when set. Returns false if a
/// subscriber was already installed (tests, embedding hosts); that is not
/// an error.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config.level));

    let result = match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(use_ansi);

            if config.timestamps {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer)
                    .try_init()
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer.without_time())
                    .try_init()
            }
        }
        LogFormat::Jsonl => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.is_ok()
}
