//! Log level and format resolution.
//!
//! Precedence, lowest first: built-in defaults, `RUST_LOG`, `TQ_LOG` /
//! `TQ_LOG_FORMAT`, CLI flags. The pipeline `debug` flag can only raise
//! verbosity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const ENV_LOG: &str = "TQ_LOG";
pub const ENV_LOG_FORMAT: &str = "TQ_LOG_FORMAT";

/// Where log records go and how they look. Always stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    /// One JSON object per record.
    Jsonl,
}

const FORMAT_NAMES: &[(&str, LogFormat)] = &[
    ("human", LogFormat::Human),
    ("pretty", LogFormat::Human),
    ("jsonl", LogFormat::Jsonl),
    ("json", LogFormat::Jsonl),
];

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Human => "human",
            LogFormat::Jsonl => "jsonl",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lookup_name(FORMAT_NAMES, s).ok_or_else(|| format!("unknown log format: {}", s))
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verbosity, most verbose first so `Ord` reads as "noisier than".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

const LEVEL_NAMES: &[(&str, LogLevel)] = &[
    ("trace", LogLevel::Trace),
    ("debug", LogLevel::Debug),
    ("info", LogLevel::Info),
    ("warn", LogLevel::Warn),
    ("warning", LogLevel::Warn),
    ("error", LogLevel::Error),
    ("off", LogLevel::Off),
    ("quiet", LogLevel::Off),
];

impl LogLevel {
    /// Directive spelling understood by `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lookup_name(LEVEL_NAMES, s).ok_or_else(|| format!("unknown log level: {}", s))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn lookup_name<T: Copy>(table: &[(&str, T)], raw: &str) -> Option<T> {
    let raw = raw.trim();
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(raw))
        .map(|(_, value)| *value)
}

/// Noisiest level named anywhere in a `RUST_LOG` value.
///
/// Directives may be bare (`debug`) or targeted (`tq_queue=trace`); span
/// filters and unknown words are ignored.
fn noisiest_directive(rust_log: &str) -> Option<LogLevel> {
    rust_log
        .split(',')
        .filter_map(|directive| {
            let level = directive.rsplit('=').next()?;
            level.parse::<LogLevel>().ok()
        })
        .min()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Prefix human records with a timestamp.
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: LogFormat::Human,
            level: LogLevel::Info,
            timestamps: true,
        }
    }
}

impl LogConfig {
    pub fn from_env(cli_level: Option<LogLevel>, cli_format: Option<LogFormat>) -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), cli_level, cli_format)
    }

    /// Resolve against an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F, cli_level: Option<LogLevel>, cli_format: Option<LogFormat>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_level = lookup(ENV_LOG)
            .and_then(|v| v.parse().ok())
            .or_else(|| lookup("RUST_LOG").as_deref().and_then(noisiest_directive));
        let env_format = lookup(ENV_LOG_FORMAT).and_then(|v| v.parse().ok());

        let defaults = LogConfig::default();
        LogConfig {
            level: cli_level.or(env_level).unwrap_or(defaults.level),
            format: cli_format.or(env_format).unwrap_or(defaults.format),
            ..defaults
        }
    }

    /// Apply the pipeline `debug` flag.
    pub fn with_debug_flag(mut self, debug: bool) -> Self {
        if debug {
            self.level = self.level.min(LogLevel::Debug);
        }
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_names_parse_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Jsonl);
        assert_eq!(" Warning ".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("quiet".parse::<LogLevel>().unwrap(), LogLevel::Off);
        assert!("xml".parse::<LogFormat>().is_err());
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_display_roundtrips_through_parse() {
        for (_, level) in LEVEL_NAMES {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), *level);
        }
    }

    #[test]
    fn test_rust_log_takes_noisiest_directive() {
        assert_eq!(noisiest_directive("warn,tq_queue=trace"), Some(LogLevel::Trace));
        assert_eq!(noisiest_directive("tq_core=debug"), Some(LogLevel::Debug));
        assert_eq!(noisiest_directive("tq_core[span]"), None);
    }

    #[test]
    fn test_tq_log_beats_rust_log() {
        let config = LogConfig::from_lookup(
            vars(&[(ENV_LOG, "error"), ("RUST_LOG", "trace")]),
            None,
            None,
        );
        assert_eq!(config.level, LogLevel::Error);

        let config = LogConfig::from_lookup(vars(&[("RUST_LOG", "tq_core=debug")]), None, None);
        assert_eq!(config.level, LogLevel::Debug);
    }

    #[test]
    fn test_cli_beats_env() {
        let config = LogConfig::from_lookup(
            vars(&[(ENV_LOG, "error"), (ENV_LOG_FORMAT, "jsonl")]),
            Some(LogLevel::Trace),
            Some(LogFormat::Human),
        );
        assert_eq!(config.level, LogLevel::Trace);
        assert_eq!(config.format, LogFormat::Human);
    }

    #[test]
    fn test_debug_flag_only_raises_verbosity() {
        assert_eq!(LogConfig::default().with_debug_flag(true).level, LogLevel::Debug);
        let trace = LogConfig::default().with_level(LogLevel::Trace).with_debug_flag(true);
        assert_eq!(trace.level, LogLevel::Trace);
        assert_eq!(LogConfig::default().with_debug_flag(false).level, LogLevel::Info);
    }
}
