//! Resilient per-file loader
//!
//! Wraps a [`RecordStore`] with retry on transient conflicts. The whole file
//! transaction is retried; partial progress is never kept.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{FileTables, RecordStore};

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;

/// SQLSTATE serialization_failure
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE deadlock_detected
pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("Cancelled while waiting to retry")]
    Cancelled,
}

/// Exponential backoff settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Outcome of one successful file load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub records: u64,
    pub rows_affected: u64,
    pub tables: usize,
    pub attempts: u32,
}

/// Loads one file's tables with retry
pub struct BatchLoader<S: RecordStore> {
    store: Arc<S>,
    policy: RetryPolicy,
}

impl<S: RecordStore> BatchLoader<S> {
    pub fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Write every table of one file in a single retried transaction.
    ///
    /// A file with no rows does not touch the store.
    pub async fn load_file(
        &self,
        cancel: &CancellationToken,
        tables: &FileTables,
    ) -> Result<LoadSummary, LoadError> {
        let records: u64 = tables.values().map(|rows| rows.len() as u64).sum();
        if records == 0 {
            return Ok(LoadSummary::default());
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.store.upsert_file(tables).await {
                Ok(rows_affected) => {
                    debug!(records, rows_affected, attempt, "File committed");
                    return Ok(LoadSummary {
                        records,
                        rows_affected,
                        tables: tables.values().filter(|rows| !rows.is_empty()).count(),
                        attempts: attempt,
                    });
                },
                Err(e) if is_retryable(Some(&e)) => {
                    if attempt >= max_attempts {
                        return Err(LoadError::RetriesExhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }

                    let backoff = self.policy.delay_for(attempt);
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient database conflict, retrying"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LoadError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                },
                Err(e) => return Err(LoadError::Database(e)),
            }
        }
    }
}

/// Whether a failed transaction is worth retrying.
///
/// Walks the source chain looking for a serialization failure or deadlock,
/// either by SQLSTATE or by message.
pub fn is_retryable(err: Option<&(dyn StdError + 'static)>) -> bool {
    let mut current = err;
    while let Some(e) = current {
        if let Some(sqlx::Error::Database(db)) = e.downcast_ref::<sqlx::Error>() {
            if db.code().is_some_and(|code| is_retryable_code(&code)) {
                return true;
            }
        }

        let message = e.to_string().to_lowercase();
        if message.contains("deadlock") || message.contains("serialization") {
            return true;
        }

        current = e.source();
    }
    false
}

pub fn is_retryable_code(code: &str) -> bool {
    code == SQLSTATE_SERIALIZATION_FAILURE || code == SQLSTATE_DEADLOCK_DETECTED
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::decode::decode;
    use crate::schema::SchemaRegistry;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct Plain(&'static str);

    #[derive(Debug, Error)]
    #[error("load failed")]
    struct Wrapper(#[source] Plain);

    /// Store that fails with queued errors before succeeding
    #[derive(Default)]
    struct ScriptedStore {
        failures: Mutex<Vec<sqlx::Error>>,
        calls: Mutex<u32>,
    }

    impl ScriptedStore {
        fn failing_with(failures: Vec<sqlx::Error>) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl RecordStore for ScriptedStore {
        async fn upsert_file(&self, tables: &FileTables) -> Result<u64, sqlx::Error> {
            *self.calls.lock().unwrap() += 1;
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(tables.values().map(|r| r.len() as u64).sum())
            } else {
                Err(failures.remove(0))
            }
        }
    }

    /// Server-side error carrying a SQLSTATE, shaped like what Postgres returns
    #[derive(Debug, Error)]
    #[error("{message}")]
    struct SqlState {
        code: &'static str,
        message: &'static str,
    }

    impl sqlx::error::DatabaseError for SqlState {
        fn message(&self) -> &str {
            self.message
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(self.code.into())
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            match self.code {
                "23505" => sqlx::error::ErrorKind::UniqueViolation,
                _ => sqlx::error::ErrorKind::Other,
            }
        }
    }

    fn db_error(code: &'static str, message: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(SqlState { code, message }))
    }

    fn serialization_failure() -> sqlx::Error {
        db_error("40001", "could not serialize access due to concurrent update")
    }

    fn deadlock() -> sqlx::Error {
        sqlx::Error::Protocol("deadlock detected".to_string())
    }

    fn one_file() -> FileTables {
        let schema = SchemaRegistry::builtin().lookup("tx_cash_in").unwrap();
        let fields = ["1", "01.12.2024", "10:00:00", "50", "001", "1", "0", "", "5"];
        let mut tables = FileTables::new();
        tables.insert(schema.name, vec![decode(schema, &fields, "T01/main").record]);
        tables
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn test_is_retryable() {
        assert!(!is_retryable(None));
        assert!(is_retryable(Some(&Plain("ERROR: Deadlock detected"))));
        assert!(is_retryable(Some(&Plain("could not serialize access due to SERIALIZATION failure"))));
        assert!(!is_retryable(Some(&Plain("unique violation"))));
        assert!(is_retryable(Some(&Wrapper(Plain("deadlock")))));
        assert!(is_retryable(Some(&deadlock())));
        assert!(!is_retryable(Some(&sqlx::Error::RowNotFound)));
    }

    #[test]
    fn test_retryable_codes() {
        assert!(is_retryable_code("40001"));
        assert!(is_retryable_code("40P01"));
        assert!(!is_retryable_code("23505"));
    }

    #[test]
    fn test_is_retryable_by_sqlstate() {
        // Neither message mentions deadlock or serialization
        assert!(is_retryable(Some(&serialization_failure())));
        assert!(is_retryable(Some(&db_error(
            "40P01",
            "process 4242 waits for ShareLock on transaction 777; blocked by process 4343"
        ))));
        assert!(!is_retryable(Some(&db_error(
            "23505",
            "duplicate key value violates unique constraint \"tx_payment_pkey\""
        ))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sqlstate_failure_is_retried() {
        let store = Arc::new(ScriptedStore::failing_with(vec![serialization_failure()]));
        let loader = BatchLoader::new(store.clone(), policy(3));

        let summary = loader.load_file(&CancellationToken::new(), &one_file()).await.unwrap();
        assert_eq!(summary.attempts, 2);
        assert_eq!(store.calls(), 2);

        let store = Arc::new(ScriptedStore::failing_with(vec![db_error("23505", "duplicate key value")]));
        let loader = BatchLoader::new(store.clone(), policy(3));

        let err = loader.load_file(&CancellationToken::new(), &one_file()).await.unwrap_err();
        assert!(matches!(err, LoadError::Database(sqlx::Error::Database(_))));
        assert_eq!(store.calls(), 1);
    }

    #[test]
    fn test_delay_for() {
        let p = policy(5);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(60), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_empty_file_skips_store() {
        let store = Arc::new(ScriptedStore::default());
        let loader = BatchLoader::new(store.clone(), policy(3));

        let mut tables = FileTables::new();
        tables.insert("tx_cash_in", Vec::new());
        let summary = loader.load_file(&CancellationToken::new(), &tables).await.unwrap();

        assert_eq!(summary, LoadSummary::default());
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_commits() {
        let store = Arc::new(ScriptedStore::failing_with(vec![deadlock(), deadlock()]));
        let loader = BatchLoader::new(store.clone(), policy(5));

        let started = tokio::time::Instant::now();
        let summary = loader.load_file(&CancellationToken::new(), &one_file()).await.unwrap();

        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.records, 1);
        assert_eq!(store.calls(), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(310), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let store = Arc::new(ScriptedStore::failing_with((0..5).map(|_| deadlock()).collect()));
        let loader = BatchLoader::new(store.clone(), policy(3));

        let err = loader.load_file(&CancellationToken::new(), &one_file()).await.unwrap_err();
        assert!(matches!(err, LoadError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let store = Arc::new(ScriptedStore::failing_with(vec![sqlx::Error::RowNotFound]));
        let loader = BatchLoader::new(store.clone(), policy(5));

        let err = loader.load_file(&CancellationToken::new(), &one_file()).await.unwrap_err();
        assert!(matches!(err, LoadError::Database(sqlx::Error::RowNotFound)));
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let store = Arc::new(ScriptedStore::failing_with(vec![deadlock()]));
        let loader = BatchLoader::new(store.clone(), policy(5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = loader.load_file(&cancel, &one_file()).await.unwrap_err();
        assert!(matches!(err, LoadError::Cancelled));
        assert_eq!(store.calls(), 1);
    }
}
