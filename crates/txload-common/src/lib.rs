//! txload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging setup, and error handling for the txload workspace.
//!
//! - **Error Handling**: [`TxloadError`] and the [`Result`] alias
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`]
//! - **Types**: terminal folder topology shared by configuration and the pipeline
//!
//! # Example
//!
//! ```no_run
//! use txload_common::types::TerminalFolder;
//!
//! let folders = TerminalFolder::parse_list("T01/main,T02/main", "/requests", "/responses")?;
//! assert_eq!(folders[0].source_tag(), "T01/main");
//! # Ok::<(), txload_common::TxloadError>(())
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, TxloadError};
