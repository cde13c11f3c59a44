//! txload Server Library
//!
//! Periodic ETL service moving POS terminal transaction exports from an FTP
//! transfer server into PostgreSQL.
//!
//! # Overview
//!
//! - **Schema**: [`schema::SchemaRegistry`] describes every destination table
//! - **Decoding**: [`decode::decode`] turns one positional line into a typed record
//! - **Dispatch**: [`dispatch::Dispatcher`] routes transaction type codes to tables
//! - **Reading**: [`reader::ExportReader`] parses a whole export file
//! - **Transport**: [`transport::SessionPool`] hands out pooled FTP sessions
//! - **Loading**: [`loader::BatchLoader`] upserts one file per transaction with retry
//! - **Orchestration**: [`orchestrator::EtlOrchestrator`] drives a complete run
//! - **Service**: [`server`] exposes health, last run and shutdown over HTTP
//!
//! # Pipeline
//!
//! Every run clears stale requests, asks each terminal folder for a fresh
//! export, waits, then downloads every export without a processed marker.
//! Exports are decoded, written in one transaction per file and marked
//! processed only after the commit.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use txload_server::{dispatch::Dispatcher, reader::ExportReader, schema::SchemaRegistry};
//!
//! let dispatcher = Dispatcher::new(Arc::new(SchemaRegistry::builtin()))?;
//! let reader = ExportReader::new(Arc::new(dispatcher));
//! let parsed = reader.parse_path("export.txt".as_ref(), "T01/main")?;
//! println!("{} records", parsed.record_count());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod loader;
pub mod orchestrator;
pub mod pool;
pub mod reader;
pub mod schema;
pub mod server;
pub mod stats;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use error::{AppError, DecodeError};
pub use orchestrator::{EtlOrchestrator, OrchestratorConfig};
pub use stats::RunReport;
