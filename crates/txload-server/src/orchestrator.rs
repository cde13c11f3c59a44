//! ETL run orchestration
//!
//! One run walks a fixed sequence of steps:
//!
//! 1. clear outbound requests left over from the previous run
//! 2. issue a fresh request into every terminal folder
//! 3. wait for the terminals to answer (cancellable)
//! 4. remove processed markers whose export has disappeared
//! 5. list every response folder for unprocessed exports
//! 6. process each export on the worker pool: download, decode, load, mark
//! 7. aggregate everything into a [`RunReport`]
//!
//! Steps 1-4 are best effort: failures are logged and counted and the run
//! carries on. A file is marked processed only after its records committed,
//! so a crash between the two reloads the file on the next run and the upsert
//! converges to the same rows.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use txload_common::types::{TerminalFolder, REQUEST_FILE_NAME};

use crate::decode::DATE_FORMAT;
use crate::loader::BatchLoader;
use crate::pool::WorkerPool;
use crate::reader::ExportReader;
use crate::stats::{RunInfo, RunReport, RunStats, Stage};
use crate::store::RecordStore;
use crate::transport::{SessionPool, TransportError, TransportSession};

/// Suffix appended to an export's name to mark it processed
pub const DEFAULT_PROCESSED_SUFFIX: &str = ".processed";

/// Suffix of a marker while it is being uploaded
pub const TEMP_SUFFIX: &str = ".tmp";

pub const DEFAULT_REQUEST_DELAY_SECS: u64 = 60;
pub const DEFAULT_REQUEST_LOOKBACK_DAYS: u64 = 1;

/// Command understood by the terminals' export agent
pub const REQUEST_COMMAND: &str = "$$$TRANSACTIONSBYDATERANGE";

/// Listing entries that are never exports
const NON_DATA_NAMES: &[&str] = &[REQUEST_FILE_NAME, ".", ".."];

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub folders: Vec<TerminalFolder>,
    pub processed_suffix: String,
    /// `<= 0` uses the worker pool default
    pub worker_pool_size: i64,
    pub request_delay: Duration,
    pub request_lookback_days: u64,
    pub error_sample_limit: usize,
}

/// Body of the request file asking for exports between `date - lookback_days` and `date`
pub fn request_line(date: NaiveDate, lookback_days: u64) -> String {
    let from = date.checked_sub_days(Days::new(lookback_days)).unwrap_or(date);
    format!(
        "{} {}; {}\r\n",
        REQUEST_COMMAND,
        from.format(DATE_FORMAT),
        date.format(DATE_FORMAT)
    )
}

fn is_marker(name: &str, suffix: &str) -> bool {
    name.ends_with(suffix) || name.ends_with(&format!("{}{}", suffix, TEMP_SUFFIX))
}

/// Exports in `names` that have no processed marker twin.
///
/// Markers, marker uploads and the non-data names are never returned. Input
/// order is kept.
pub fn unprocessed_files(names: &[String], suffix: &str) -> Vec<String> {
    let present: HashSet<&str> = names.iter().map(String::as_str).collect();

    names
        .iter()
        .filter(|name| !NON_DATA_NAMES.contains(&name.as_str()))
        .filter(|name| !is_marker(name, suffix))
        .filter(|name| !present.contains(format!("{}{}", name, suffix).as_str()))
        .cloned()
        .collect()
}

/// Markers in `names` whose export is gone, plus abandoned marker uploads
pub fn stale_markers(names: &[String], suffix: &str) -> Vec<String> {
    let present: HashSet<&str> = names.iter().map(String::as_str).collect();
    let temp_suffix = format!("{}{}", suffix, TEMP_SUFFIX);

    names
        .iter()
        .filter(|name| {
            if name.ends_with(&temp_suffix) {
                return true;
            }
            match name.strip_suffix(suffix) {
                Some(data) => !data.is_empty() && !present.contains(data),
                None => false,
            }
        })
        .cloned()
        .collect()
}

/// Drives complete ETL runs
pub struct EtlOrchestrator<T: TransportSession, S: RecordStore> {
    config: OrchestratorConfig,
    sessions: Arc<SessionPool<T>>,
    reader: Arc<ExportReader>,
    loader: Arc<BatchLoader<S>>,
}

impl<T: TransportSession, S: RecordStore> EtlOrchestrator<T, S> {
    pub fn new(
        config: OrchestratorConfig,
        sessions: Arc<SessionPool<T>>,
        reader: Arc<ExportReader>,
        loader: Arc<BatchLoader<S>>,
    ) -> Self {
        Self {
            config,
            sessions,
            reader,
            loader,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Execute one run for `date`. Always returns a report.
    pub async fn run(&self, cancel: &CancellationToken, date: NaiveDate) -> RunReport {
        let run = RunInfo::start(date);
        let span = info_span!("etl_run", run_id = %run.run_id, date = %date);

        async move {
            let stats = Arc::new(RunStats::new(self.config.error_sample_limit));
            info!(folders = self.config.folders.len(), "ETL run started");

            self.clear_requests(&stats).await;
            self.issue_requests(&stats, date).await;

            info!(delay_secs = self.config.request_delay.as_secs(), "Waiting for terminals to export");
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Run cancelled while waiting for exports");
                    return stats.report(run, true);
                }
                _ = tokio::time::sleep(self.config.request_delay) => {}
            }

            self.remove_stale_markers(&stats).await;
            let files = self.scan_folders(&stats).await;
            self.process_files(cancel, &stats, files).await;

            let report = stats.report(run, cancel.is_cancelled());
            info!(
                files_found = report.counters.files_found,
                files_processed = report.counters.files_processed,
                files_skipped = report.counters.files_skipped,
                files_failed = report.counters.files_failed,
                records_loaded = report.counters.records_loaded,
                errors = report.counters.errors,
                duration_ms = report.duration_ms,
                "ETL run finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn clear_requests(&self, stats: &RunStats) {
        debug!("Clearing outbound requests");
        for folder in &self.config.folders {
            let dir = folder.request_path.clone();
            let names = match self.sessions.with_session(move |s| async move { s.list(&dir).await }.boxed()).await {
                Ok(names) => names,
                Err(TransportError::NotFound(_)) => {
                    debug!(folder = %folder.source_tag(), "No request folder to clear");
                    continue;
                },
                Err(e) => {
                    warn!(folder = %folder.source_tag(), error = %e, "Failed to list request folder");
                    stats.record_error(Stage::ClearRequest, None, Some(&folder.request_path), e.to_string());
                    continue;
                },
            };
            if !names.iter().any(|n| n == REQUEST_FILE_NAME) {
                continue;
            }

            let path = folder.request_file();
            let target = path.clone();
            match self.sessions.with_session(move |s| async move { s.delete(&target).await }.boxed()).await {
                Ok(()) => stats.count(|c| c.requests_cleared += 1),
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to clear request");
                    stats.record_error(Stage::ClearRequest, Some(REQUEST_FILE_NAME), Some(&path), e.to_string());
                },
            }
        }
    }

    async fn issue_requests(&self, stats: &RunStats, date: NaiveDate) {
        let line = request_line(date, self.config.request_lookback_days);
        info!(request = %line.trim_end(), "Issuing export requests");

        for folder in &self.config.folders {
            let dir = folder.request_path.clone();
            let path = folder.request_file();
            let target = path.clone();
            let body = line.clone().into_bytes();

            let result = self
                .sessions
                .with_session(move |s| {
                    async move {
                        s.make_dir(&dir).await?;
                        s.store(&target, body).await
                    }
                    .boxed()
                })
                .await;

            match result {
                Ok(()) => stats.count(|c| c.requests_issued += 1),
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to issue request");
                    stats.record_error(Stage::IssueRequest, Some(REQUEST_FILE_NAME), Some(&path), e.to_string());
                },
            }
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>, TransportError> {
        let dir = dir.to_string();
        self.sessions
            .with_session(move |s| async move { s.list(&dir).await }.boxed())
            .await
    }

    async fn remove_stale_markers(&self, stats: &RunStats) {
        let suffix = &self.config.processed_suffix;

        for folder in &self.config.folders {
            let names = match self.list(&folder.response_path).await {
                Ok(names) => names,
                Err(TransportError::NotFound(_)) => {
                    debug!(folder = %folder.source_tag(), "No response folder to clean");
                    continue;
                },
                Err(e) => {
                    warn!(folder = %folder.source_tag(), error = %e, "Failed to list folder for marker cleanup");
                    stats.record_error(Stage::CleanupMarkers, None, Some(&folder.response_path), e.to_string());
                    continue;
                },
            };

            for marker in stale_markers(&names, suffix) {
                let path = folder.response_file(&marker);
                let target = path.clone();
                match self.sessions.with_session(move |s| async move { s.delete(&target).await }.boxed()).await {
                    Ok(()) => {
                        debug!(path = %path, "Removed stale marker");
                        stats.count(|c| c.markers_removed += 1);
                    },
                    Err(e) => {
                        warn!(path = %path, error = %e, "Failed to remove stale marker");
                        stats.record_error(Stage::CleanupMarkers, Some(&marker), Some(&path), e.to_string());
                    },
                }
            }
        }
    }

    async fn scan_folders(&self, stats: &RunStats) -> Vec<(TerminalFolder, String)> {
        let mut files = Vec::new();

        for folder in &self.config.folders {
            match self.list(&folder.response_path).await {
                Ok(names) => {
                    let pending = unprocessed_files(&names, &self.config.processed_suffix);
                    info!(folder = %folder.source_tag(), entries = names.len(), pending = pending.len(), "Scanned folder");
                    stats.count(|c| {
                        c.folders_scanned += 1;
                        c.files_found += pending.len() as u64;
                    });
                    files.extend(pending.into_iter().map(|name| (folder.clone(), name)));
                },
                Err(e) => {
                    warn!(folder = %folder.source_tag(), error = %e, "Failed to list response folder");
                    stats.record_error(Stage::List, None, Some(&folder.response_path), e.to_string());
                },
            }
        }

        files
    }

    async fn process_files(
        &self,
        cancel: &CancellationToken,
        stats: &Arc<RunStats>,
        files: Vec<(TerminalFolder, String)>,
    ) {
        let mut workers = WorkerPool::new(self.config.worker_pool_size);
        info!(files = files.len(), workers = workers.size(), sessions = self.sessions.size(), "Processing exports");

        for (folder, name) in files {
            let task = FileTask {
                path: folder.response_file(&name),
                source_tag: folder.source_tag(),
                name,
                suffix: self.config.processed_suffix.clone(),
                sessions: self.sessions.clone(),
                reader: self.reader.clone(),
                loader: self.loader.clone(),
                stats: stats.clone(),
                cancel: cancel.clone(),
            };
            let (name, path) = (task.name.clone(), task.path.clone());

            if let Err(e) = workers.submit(cancel, task.run()).await {
                warn!(path = %path, error = %e, "File not submitted");
                stats.record_error(Stage::Submit, Some(&name), Some(&path), e.to_string());
            }
        }

        workers.wait().await;
    }
}

/// Everything one worker needs to process one export
struct FileTask<T: TransportSession, S: RecordStore> {
    name: String,
    path: String,
    source_tag: String,
    suffix: String,
    sessions: Arc<SessionPool<T>>,
    reader: Arc<ExportReader>,
    loader: Arc<BatchLoader<S>>,
    stats: Arc<RunStats>,
    cancel: CancellationToken,
}

impl<T: TransportSession, S: RecordStore> FileTask<T, S> {
    async fn run(self) {
        let span = info_span!("file", path = %self.path);
        self.process().instrument(span).await
    }

    async fn process(self) {
        let target = self.path.clone();
        let bytes = match self
            .sessions
            .with_session(move |s| async move { s.retrieve(&target).await }.boxed())
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(Stage::Download, e.to_string()),
        };
        debug!(bytes = bytes.len(), "Downloaded export");

        let reader = self.reader.clone();
        let source_tag = self.source_tag.clone();
        let parsed = match tokio::task::spawn_blocking(move || reader.parse_bytes(&bytes, &source_tag)).await {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(e)) => return self.fail(Stage::Decode, e.to_string()),
            Err(e) => return self.fail(Stage::Decode, format!("decode task failed: {}", e)),
        };

        let coerced = parsed.coerced_field_count() as u64;
        if coerced > 0 {
            warn!(lines = parsed.diagnostics.len(), fields = coerced, "Coerced unparsable fields to zero");
            for line in &parsed.diagnostics {
                for field in &line.fields {
                    debug!(line = line.line, table = line.table, "{}", field);
                }
            }
            self.stats.count(|c| c.coerced_fields += coerced);
        }

        if parsed.header.processed {
            info!("Export already processed, marking");
        } else {
            match self.loader.load_file(&self.cancel, &parsed.tables).await {
                Ok(summary) => {
                    info!(records = summary.records, tables = summary.tables, attempts = summary.attempts, "Export loaded");
                    self.stats.count(|c| c.records_loaded += summary.records);
                    for (table, rows) in &parsed.tables {
                        self.stats.add_table_records(table, rows.len() as u64);
                    }
                },
                Err(e) => return self.fail(Stage::Load, e.to_string()),
            }
        }

        if let Err(e) = self.mark().await {
            return self.fail(Stage::Mark, e.to_string());
        }

        if parsed.header.processed {
            self.stats.count(|c| c.files_skipped += 1);
        } else {
            self.stats.count(|c| c.files_processed += 1);
        }
    }

    /// Upload `{name}{suffix}.tmp` and rename it into place
    async fn mark(&self) -> Result<(), TransportError> {
        let marker = format!("{}{}", self.path, self.suffix);
        let temp = format!("{}{}", marker, TEMP_SUFFIX);

        self.sessions
            .with_session(move |s| {
                async move {
                    s.store(&temp, Vec::new()).await?;
                    s.rename(&temp, &marker).await
                }
                .boxed()
            })
            .await
    }

    fn fail(&self, stage: Stage, message: String) {
        warn!(stage = %stage, error = %message, "Export failed");
        self.stats.count(|c| c.files_failed += 1);
        self.stats.record_error(stage, Some(&self.name), Some(&self.path), message);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unprocessed_files_with_marker_twin() {
        let pending = unprocessed_files(&names(&["a.txt", "a.txt.marker", "b.txt"]), ".marker");
        assert_eq!(pending, vec!["b.txt"]);
    }

    #[test]
    fn test_unprocessed_files_excludes_non_data_names() {
        let listing = names(&[".", "..", "request.txt", "c.txt", "c.txt.processed.tmp", "d.txt"]);
        let pending = unprocessed_files(&listing, DEFAULT_PROCESSED_SUFFIX);
        assert_eq!(pending, vec!["c.txt", "d.txt"]);
    }

    #[test]
    fn test_stale_markers() {
        let listing = names(&[
            "a.txt",
            "a.txt.processed",
            "gone.txt.processed",
            "b.txt.processed.tmp",
            "c.txt",
        ]);
        let stale = stale_markers(&listing, DEFAULT_PROCESSED_SUFFIX);
        assert_eq!(stale, vec!["gone.txt.processed", "b.txt.processed.tmp"]);
    }

    #[test]
    fn test_request_line() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 1).unwrap();
        assert_eq!(
            request_line(date, 1),
            "$$$TRANSACTIONSBYDATERANGE 30.11.2024; 01.12.2024\r\n"
        );
        assert_eq!(
            request_line(date, 0),
            "$$$TRANSACTIONSBYDATERANGE 01.12.2024; 01.12.2024\r\n"
        );
    }
}
