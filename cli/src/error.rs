//! CLI error types

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("missing env var: {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// CLI-specific result type
pub type Result<T> = std::result::Result<T, CliError>;
