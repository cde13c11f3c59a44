//! Run statistics
//!
//! Workers report into one shared [`RunStats`]. Counters, per-table record
//! counts and the error log sit behind separate locks so that a worker
//! recording an error never waits on one updating a table count.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Default number of error samples kept per run
pub const DEFAULT_ERROR_SAMPLE_LIMIT: usize = 5;

/// Pipeline step an error happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ClearRequest,
    IssueRequest,
    CleanupMarkers,
    List,
    Submit,
    Download,
    Decode,
    Load,
    Mark,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ClearRequest => "clear_request",
            Stage::IssueRequest => "issue_request",
            Stage::CleanupMarkers => "cleanup_markers",
            Stage::List => "list",
            Stage::Submit => "submit",
            Stage::Download => "download",
            Stage::Decode => "decode",
            Stage::Load => "load",
            Stage::Mark => "mark",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub requests_cleared: u64,
    pub requests_issued: u64,
    pub markers_removed: u64,
    pub folders_scanned: u64,
    pub files_found: u64,
    pub files_processed: u64,
    /// Files whose header was already marked processed
    pub files_skipped: u64,
    pub files_failed: u64,
    pub records_loaded: u64,
    pub coerced_fields: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorSample {
    pub stage: Stage,
    pub file: Option<String>,
    pub path: Option<String>,
    pub message: String,
}

#[derive(Debug, Default)]
struct ErrorLog {
    by_stage: BTreeMap<Stage, u64>,
    samples: Vec<ErrorSample>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared accumulator for one run
#[derive(Debug)]
pub struct RunStats {
    sample_limit: usize,
    counters: Mutex<Counters>,
    tables: Mutex<BTreeMap<String, u64>>,
    errors: Mutex<ErrorLog>,
}

impl RunStats {
    pub fn new(sample_limit: usize) -> Self {
        Self {
            sample_limit,
            counters: Mutex::new(Counters::default()),
            tables: Mutex::new(BTreeMap::new()),
            errors: Mutex::new(ErrorLog::default()),
        }
    }

    /// Apply `f` to the counters under their lock
    pub fn count(&self, f: impl FnOnce(&mut Counters)) {
        f(&mut lock(&self.counters));
    }

    pub fn add_table_records(&self, table: &str, records: u64) {
        *lock(&self.tables).entry(table.to_string()).or_default() += records;
    }

    /// Count an error and keep it as a sample while below the limit
    pub fn record_error(
        &self,
        stage: Stage,
        file: Option<&str>,
        path: Option<&str>,
        message: impl Into<String>,
    ) {
        self.count(|c| c.errors += 1);

        let mut errors = lock(&self.errors);
        *errors.by_stage.entry(stage).or_default() += 1;
        if errors.samples.len() < self.sample_limit {
            errors.samples.push(ErrorSample {
                stage,
                file: file.map(str::to_string),
                path: path.map(str::to_string),
                message: message.into(),
            });
        }
    }

    pub fn counters(&self) -> Counters {
        *lock(&self.counters)
    }

    pub fn records_by_table(&self) -> BTreeMap<String, u64> {
        lock(&self.tables).clone()
    }

    /// Freeze the statistics into a report
    pub fn report(&self, run: RunInfo, cancelled: bool) -> RunReport {
        let finished_at = Utc::now();
        let errors = lock(&self.errors);

        RunReport {
            run_id: run.run_id,
            run_date: run.run_date,
            started_at: run.started_at,
            finished_at,
            duration_ms: (finished_at - run.started_at).num_milliseconds().max(0) as u64,
            cancelled,
            counters: self.counters(),
            records_by_table: self.records_by_table(),
            errors_by_stage: errors.by_stage.clone(),
            error_samples: errors.samples.clone(),
        }
    }
}

/// Identity of a run
#[derive(Debug, Clone, Copy)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
}

impl RunInfo {
    pub fn start(run_date: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            run_date,
            started_at: Utc::now(),
        }
    }
}

/// Outcome of one orchestrator run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub cancelled: bool,
    pub counters: Counters,
    pub records_by_table: BTreeMap<String, u64>,
    pub errors_by_stage: BTreeMap<Stage, u64>,
    pub error_samples: Vec<ErrorSample>,
}
