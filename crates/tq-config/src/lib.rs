//! telq configuration loading and validation.
//!
//! This crate provides:
//! - The typed [`PipelineConfig`] with serde defaults for every field
//! - Config resolution (CLI → env → XDG → defaults)
//! - Semantic validation with stable error codes

pub mod pipeline;
pub mod resolve;
pub mod validate;

pub use pipeline::PipelineConfig;
pub use resolve::{resolve_config_path, resolve_data_dir, ConfigSource, ResolvedPath};
pub use validate::{validate_pipeline, ValidationError, ValidationResult};

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1";
