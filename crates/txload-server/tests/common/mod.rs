//! Shared helpers for txload integration tests
//!
//! - [`RecordingStore`]: in-memory [`RecordStore`] with injectable failures
//! - [`Harness`]: orchestrator wired to a [`MemoryTransport`] tree
//! - fixture loading from `tests/fixtures`

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use txload_common::types::TerminalFolder;
use txload_server::dispatch::Dispatcher;
use txload_server::loader::{BatchLoader, RetryPolicy};
use txload_server::orchestrator::{EtlOrchestrator, OrchestratorConfig, DEFAULT_PROCESSED_SUFFIX};
use txload_server::reader::ExportReader;
use txload_server::schema::SchemaRegistry;
use txload_server::store::{FileTables, RecordStore};
use txload_server::transport::memory::MemorySession;
use txload_server::transport::{MemoryTransport, SessionPool};

pub const REQUEST_ROOT: &str = "/requests";
pub const RESPONSE_ROOT: &str = "/responses";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("txload_server=debug")
        .with_test_writer()
        .try_init();
}

/// Contents of `tests/fixtures/{name}`
pub fn fixture(name: &str) -> Vec<u8> {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|e| panic!("fixture {}: {}", path.display(), e))
}

pub fn folders(list: &str) -> Vec<TerminalFolder> {
    TerminalFolder::parse_list(list, REQUEST_ROOT, RESPONSE_ROOT).unwrap()
}

/// Store that keeps every committed file in memory
#[derive(Default)]
pub struct RecordingStore {
    committed: Mutex<Vec<FileTables>>,
    failures: Mutex<VecDeque<sqlx::Error>>,
    calls: Mutex<u32>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next upsert calls with `errors`, in order
    pub fn fail_with(&self, errors: impl IntoIterator<Item = sqlx::Error>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn committed(&self) -> Vec<FileTables> {
        self.committed.lock().unwrap().clone()
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    /// Committed rows of `table` across every file
    pub fn rows(&self, table: &str) -> usize {
        self.committed
            .lock()
            .unwrap()
            .iter()
            .filter_map(|file| file.get(table))
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl RecordStore for RecordingStore {
    async fn upsert_file(&self, tables: &FileTables) -> Result<u64, sqlx::Error> {
        *self.calls.lock().unwrap() += 1;
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.committed.lock().unwrap().push(tables.clone());
        Ok(tables.values().map(|rows| rows.len() as u64).sum())
    }
}

pub fn deadlock() -> sqlx::Error {
    sqlx::Error::Protocol("deadlock detected".to_string())
}

/// Orchestrator over an in-memory transfer server
pub struct Harness {
    pub transport: MemoryTransport,
    pub store: Arc<RecordingStore>,
    pub sessions: Arc<SessionPool<MemorySession>>,
    pub orchestrator: EtlOrchestrator<MemorySession, RecordingStore>,
}

impl Harness {
    pub async fn new(transport: MemoryTransport, topology: &str) -> Self {
        Self::with_config(transport, config(topology)).await
    }

    pub async fn with_config(transport: MemoryTransport, config: OrchestratorConfig) -> Self {
        let store = Arc::new(RecordingStore::new());
        let sessions = SessionPool::connect(&transport, 2).await.unwrap();
        let registry = Arc::new(SchemaRegistry::builtin());
        let reader = Arc::new(ExportReader::new(Arc::new(Dispatcher::new(registry).unwrap())));
        let loader = Arc::new(BatchLoader::new(store.clone(), retry_policy()));

        let orchestrator = EtlOrchestrator::new(config, sessions.clone(), reader, loader);
        Self {
            transport,
            store,
            sessions,
            orchestrator,
        }
    }
}

pub fn config(topology: &str) -> OrchestratorConfig {
    OrchestratorConfig {
        folders: folders(topology),
        processed_suffix: DEFAULT_PROCESSED_SUFFIX.to_string(),
        worker_pool_size: 4,
        request_delay: Duration::from_secs(60),
        request_lookback_days: 1,
        error_sample_limit: 5,
    }
}

pub fn retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
    }
}
