//! Stage base: shared lifecycle every processing stage builds on.
//!
//! Parser, Validator, Uploader, and Reporter all enter through
//! [`claim_status`], accumulate per-record outcomes through a
//! [`PendingUpdates`] queue, and close through [`FileProgress`]. Loader
//! uses the same status-claim and pending-updates machinery even though it
//! reads from disk rather than from persisted records.
//!
//! None of this lives in a trait: each stage's `process()` is concrete (see
//! `loader.rs`/`parser.rs`/`validator.rs`/`uploader.rs`/`reporter.rs`), but
//! they all compose these same primitives so the chunking, flushing, and
//! logging behavior is identical across stages.

use std::time::{Duration, Instant};

use inflow_common::types::{FileDoc, FileStatus, ProcessingLog, UpdateBuilder};
use inflow_common::{ErrorCode, PipelineError};
use serde_json::json;

use crate::db::Store;
use crate::error::{WorkerError, WorkerResult};

/// Maximum wall-clock gap between file-document progress updates while a
/// stage is actively processing (§5, suspension points).
pub const MAX_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Default DB chunk size (`m=1`, no batching).
pub const DEFAULT_DB_CHUNK_SIZE: i64 = 1000;

/// Given `maxPendingRecords = m`, derive `maxPendingUpdates` and
/// `dbChunkSize` per the tuning rule in §4.2.
pub fn tuning(max_pending_records: usize) -> (usize, i64) {
    let m = max_pending_records.max(1);
    let max_pending_updates = (5000 / m).min(1000).max(1);
    let db_chunk_size = ((1000 / m).max(1) * m) as i64;
    (max_pending_updates, db_chunk_size)
}

/// `m>1` is disallowed when the file-type has more than one record type.
pub fn check_batch_size_allowed(max_pending_records: usize, record_type_count: usize) -> WorkerResult<()> {
    if max_pending_records > 1 && record_type_count > 1 {
        return Err(WorkerError::Pipeline(PipelineError::configuration_coded(
            ErrorCode::OtherConfigurationError,
            "maxPendingRecords > 1 is not allowed when the file-type declares more than one record type",
        )));
    }
    Ok(())
}

/// Atomically claims a file for one stage: CAS `status` from one of
/// `allowed_from` to `to`. Returns the latest [`FileDoc`] once claimed.
pub async fn claim_status(
    store: &Store,
    file_id: i64,
    allowed_from: &[FileStatus],
    to: FileStatus,
) -> WorkerResult<FileDoc> {
    let claimed = store.cas_file_status(file_id, allowed_from, to).await?;
    if !claimed {
        return Err(WorkerError::Pipeline(PipelineError::configuration_coded(
            ErrorCode::OtherConfigurationError,
            format!("file {file_id} is not in an allowed status for this stage"),
        )));
    }
    store.get_file(file_id).await.map_err(WorkerError::from)
}

/// Build a plain log entry stamped with the stage's source and now.
pub fn make_log(
    source: &str,
    is_error: bool,
    message: impl Into<String>,
    error_code: Option<ErrorCode>,
) -> ProcessingLog {
    ProcessingLog {
        source: source.to_string(),
        timestamp: chrono::Utc::now(),
        is_error,
        message: message.into(),
        error_code: error_code.map(|c| c.to_string()),
        function_config_id: None,
        stack_trace: None,
    }
}

/// Derive a log entry from a raised [`PipelineError`]. Domain errors never
/// carry a stack trace.
pub fn make_exc_log(source: &str, err: &PipelineError) -> ProcessingLog {
    ProcessingLog {
        source: source.to_string(),
        timestamp: chrono::Utc::now(),
        is_error: true,
        message: err.summary().to_string(),
        error_code: Some(err.error_code().to_string()),
        function_config_id: None,
        stack_trace: None,
    }
}

/// Derive a log entry from a non-domain exception: folded to a
/// configuration-type error with the formatted source chain retained.
pub fn make_other_exc_log(source: &str, err: &anyhow::Error) -> ProcessingLog {
    ProcessingLog {
        source: source.to_string(),
        timestamp: chrono::Utc::now(),
        is_error: true,
        message: format!("{err:#}"),
        error_code: Some(ErrorCode::ErrorcodeUnknown.to_string()),
        function_config_id: None,
        stack_trace: Some(format!("{err:?}")),
    }
}

fn log_to_json(log: &ProcessingLog) -> serde_json::Value {
    json!(log)
}

/// Per-record update queue, flushed by `records.bulkWrite(ordered=false)`
/// when `maxPendingUpdates` is reached or [`MAX_FLUSH_INTERVAL`] elapses.
pub struct PendingUpdates {
    updates: Vec<(i64, UpdateBuilder)>,
    max_pending_updates: usize,
    last_flush: Instant,
}

impl PendingUpdates {
    pub fn new(max_pending_updates: usize) -> Self {
        Self { updates: Vec::new(), max_pending_updates, last_flush: Instant::now() }
    }

    pub fn push(&mut self, id: i64, update: UpdateBuilder) {
        self.updates.push((id, update));
    }

    pub fn should_flush(&self) -> bool {
        self.updates.len() >= self.max_pending_updates
            || (!self.updates.is_empty() && self.last_flush.elapsed() >= MAX_FLUSH_INTERVAL)
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Write the queued updates and reset the flush clock. Callers follow
    /// this with a file-document progress update (§4.2).
    pub async fn flush(&mut self, store: &Store) -> WorkerResult<()> {
        if self.updates.is_empty() {
            self.last_flush = Instant::now();
            return Ok(());
        }
        let batch = std::mem::take(&mut self.updates);
        store.bulk_update_records(&batch).await?;
        self.last_flush = Instant::now();
        Ok(())
    }
}

/// Accumulates the `{status, log, times, stats}` progress that every stage
/// periodically flushes to the file document (§4.2, §5).
#[derive(Default)]
pub struct FileProgress {
    update: UpdateBuilder,
}

impl FileProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_log(&mut self, log: ProcessingLog) -> &mut Self {
        self.update.add_to_set("log", vec![log_to_json(&log)]);
        self
    }

    /// `recentErrors` replaces (not appends) on each new stage run.
    pub fn replace_recent_errors(&mut self, errors: &[ProcessingLog]) -> &mut Self {
        self.update.set("recent_errors", json!(errors));
        self
    }

    pub fn set_status(&mut self, status: FileStatus) -> &mut Self {
        self.update.set("status", json!(status.as_str()));
        self
    }

    pub fn set_stats(&mut self, stats: &inflow_common::types::FileStats) -> &mut Self {
        self.update.set("stats", json!(stats));
        self
    }

    pub fn set_times(&mut self, times: &inflow_common::types::FileTimes) -> &mut Self {
        self.update.set("times", json!(times));
        self
    }

    pub fn set(&mut self, path: impl Into<String>, value: impl Into<serde_json::Value>) -> &mut Self {
        self.update.set(path, value);
        self
    }

    pub fn unset(&mut self, path: impl Into<String>) -> &mut Self {
        self.update.unset(path);
        self
    }

    pub async fn flush(&mut self, store: &Store, file_id: i64) -> WorkerResult<()> {
        if self.update.is_empty() {
            return Ok(());
        }
        let update = std::mem::take(&mut self.update);
        store.update_file(file_id, &update).await?;
        Ok(())
    }

    pub fn builder(&self) -> &UpdateBuilder {
        &self.update
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_rule_default_single_record() {
        let (max_updates, chunk) = tuning(1);
        assert_eq!(max_updates, 1000);
        assert_eq!(chunk, 1000);
    }

    #[test]
    fn tuning_rule_scales_with_batch_size() {
        let (max_updates, chunk) = tuning(100);
        assert_eq!(max_updates, 50);
        assert_eq!(chunk, 1000);
    }

    #[test]
    fn tuning_rule_caps_max_updates_at_1000() {
        let (max_updates, _) = tuning(1);
        assert!(max_updates <= 1000);
    }

    #[test]
    fn batch_size_rejected_for_multi_record_type_files() {
        assert!(check_batch_size_allowed(2, 2).is_err());
        assert!(check_batch_size_allowed(2, 1).is_ok());
        assert!(check_batch_size_allowed(1, 5).is_ok());
    }

    #[test]
    fn pending_updates_flushes_at_threshold() {
        let pending = PendingUpdates::new(2);
        assert!(!pending.should_flush());
    }
}
