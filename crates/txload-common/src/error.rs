//! Error types shared across the txload workspace

use thiserror::Error;

/// Result type alias for txload operations
pub type Result<T> = std::result::Result<T, TxloadError>;

/// Main error type for cross-crate concerns
#[derive(Error, Debug)]
pub enum TxloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid terminal folder '{0}': expected TERMINAL/FOLDER")]
    InvalidFolder(String),
}
