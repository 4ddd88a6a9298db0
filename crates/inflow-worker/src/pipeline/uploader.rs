//! Uploader: batches records by group-key, invokes the upload function,
//! records confirmation or retriable error.
//!
//! `RecordType.upload` only names a `functionId`, with no parameter
//! bindings of its own — this stage dispatches through a synthetic
//! zero-parameter [`FunctionConfig`] built from it (see `upload_config_for`).

use std::collections::{BTreeMap, HashSet};

use inflow_common::types::{
    FileStatus, FileType, FunctionConfig, FunctionKind, RecordDoc, RecordStatus, RecordType, UpdateBuilder,
};
use inflow_common::{ErrorCode, PipelineError};

use crate::db::store::RecordStatusFilter;
use crate::db::Store;
use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::processor::{check_batch_size_allowed, claim_status, make_log, tuning, FileProgress};
use crate::pipeline::registry::Registry;
use crate::pipeline::stats::{self, Stage};

const SOURCE: &str = "uploader";
/// Retry-reset bound (§4.6): records below this count are eligible for reset.
const MAX_RETRY_COUNT: i32 = 4;
/// Fixed pause before a file parked in `UPLOADING_RETRY_PAUSE` is retried
/// (§9c: the source leaves this open, resolved here as a fixed delay rather
/// than an exponential backoff since the retry bound itself is fixed).
const RETRY_PAUSE: chrono::Duration = chrono::Duration::minutes(15);

fn upload_config_for(rt: &RecordType) -> WorkerResult<FunctionConfig> {
    let upload = rt.upload.as_ref().ok_or_else(|| {
        WorkerError::Pipeline(PipelineError::configuration_coded(
            ErrorCode::OtherConfigurationError,
            format!("record type {} has no upload configuration", rt.id),
        ))
    })?;
    Ok(FunctionConfig { id: 0, function_id: upload.function_id.clone(), parameter_values: Vec::new() })
}

struct BatchOutcome {
    ids: Vec<i64>,
    update: UpdateBuilder,
    success: bool,
}

async fn invoke_batch(registry: &Registry, rt: &RecordType, batch: &[RecordDoc]) -> WorkerResult<BatchOutcome> {
    let config = upload_config_for(rt)?;
    let function = registry.function(&config.function_id).map_err(WorkerError::Pipeline)?;
    let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();

    let result = match function.kind {
        FunctionKind::RecordUpload => {
            if batch.len() != 1 {
                return Err(WorkerError::Pipeline(PipelineError::configuration_coded(
                    ErrorCode::OtherConfigurationError,
                    "RECORD_UPLOAD functions forbid batch mode",
                )));
            }
            registry.call_upload(&config.function_id, &config, &batch[0]).await
        },
        FunctionKind::RecordUploadBatch => registry.call_upload_batch(&config.function_id, &config, batch).await,
        _ => {
            return Err(WorkerError::Pipeline(PipelineError::configuration_coded(
                ErrorCode::OtherConfigurationError,
                format!("function '{}' is not an upload function", config.function_id),
            )))
        },
    };

    let mut update = UpdateBuilder::new();
    let success = match result {
        Ok(response) => {
            update.set("status", serde_json::json!(RecordStatus::Uploaded.as_str()));
            update.set("upload_confirmation_id", serde_json::json!(response.unwrap_or_default()));
            update.set("auto_retry", serde_json::json!(false));
            update.set("retry_count", serde_json::json!(0));
            update.add_to_set(
                "log",
                vec![serde_json::json!(make_log(SOURCE, false, "upload succeeded", None))],
            );
            true
        },
        Err(err) => {
            update.set("status", serde_json::json!(RecordStatus::UploadError.as_str()));
            update.set("auto_retry", serde_json::json!(err.auto_retry()));
            let log = make_log(SOURCE, true, err.summary().to_string(), Some(err.error_code()));
            update.add_to_set("log", vec![serde_json::json!(log)]);
            update.set("recent_errors", serde_json::json!([log]));
            false
        },
    };
    Ok(BatchOutcome { ids, update, success })
}

fn duplicate_update(message: &str) -> UpdateBuilder {
    let mut update = UpdateBuilder::new();
    update.set("status", serde_json::json!(RecordStatus::UploadError.as_str()));
    update.set("auto_retry", serde_json::json!(false));
    let log = make_log(SOURCE, true, message, Some(ErrorCode::OtherValidationError));
    update.add_to_set("log", vec![serde_json::json!(log)]);
    update.set("recent_errors", serde_json::json!([log]));
    update
}

/// Run the Uploader for one file: `{VALIDATED, APPROVED_TO_UPLOAD} → UPLOADING → {UPLOADED, UPLOADING_RETRY_PAUSE}`.
pub async fn run(store: &Store, registry: &Registry, file_type: &FileType, file_id: i64) -> WorkerResult<()> {
    let mut file = claim_status(
        store,
        file_id,
        &[FileStatus::Validated, FileStatus::ApprovedToUpload],
        FileStatus::Uploading,
    )
    .await?;
    stats::clear_stats(&mut file.stats, &mut file.times, Stage::Upload);
    file.times.uploading_start = Some(chrono::Utc::now());

    let max_pending_records = file_type.upload_batch_size.max(1);
    check_batch_size_allowed(max_pending_records, file_type.record_types.len())?;
    let record_types: BTreeMap<i64, &RecordType> = file_type.record_types.iter().map(|rt| (rt.id, rt)).collect();
    let (_, chunk_size) = tuning(max_pending_records);

    let mut progress = FileProgress::new();
    let mut success = 0i64;
    let mut failure = 0i64;
    let (lo, _hi) = file.record_id_range();
    let mut after_id = lo - 1;

    let result: WorkerResult<()> = async {
        loop {
            let chunk = match &file_type.upload_batch_group_key {
                Some(key) => {
                    store
                        .fetch_record_chunk_sorted_by_field(
                            file_id,
                            RecordStatusFilter::Eq(RecordStatus::Validated),
                            key,
                            after_id,
                            chunk_size,
                        )
                        .await?
                },
                None => {
                    store
                        .fetch_record_chunk(
                            file_id,
                            Some(RecordStatusFilter::Eq(RecordStatus::Validated)),
                            after_id,
                            chunk_size,
                        )
                        .await?
                },
            };
            if chunk.is_empty() {
                break;
            }

            let uploaded_hashes =
                store.hashes_at_or_above(&chunk.iter().map(|r| r.hash.clone()).collect::<Vec<_>>(), RecordStatus::Uploaded).await?;
            let mut chunk_hashes: HashSet<String> = HashSet::new();
            let mut pending_records: Vec<RecordDoc> = Vec::new();
            let mut current_group_value: Option<String> = None;

            for record in chunk {
                after_id = record.id;

                if uploaded_hashes.contains(&record.hash) {
                    store.bulk_update_records_same(&[record.id], &duplicate_update("Record data already uploaded")).await?;
                    stats::record_outcome(&mut file.stats, &stats::step_key(Stage::Upload, &[]), false);
                    failure += 1;
                    continue;
                }
                if !chunk_hashes.insert(record.hash.clone()) {
                    store
                        .bulk_update_records_same(&[record.id], &duplicate_update("Duplicate record data found in previous row"))
                        .await?;
                    stats::record_outcome(&mut file.stats, &stats::step_key(Stage::Upload, &[]), false);
                    failure += 1;
                    continue;
                }
                if let Some(key) = &file_type.upload_batch_group_key {
                    let value = record.validated_fields.get(key).cloned().unwrap_or_default();
                    let boundary = current_group_value.as_ref().is_some_and(|cur| cur != &value);
                    if boundary && !pending_records.is_empty() {
                        flush_batch(store, registry, &record_types, &mut pending_records, &mut file.stats, &mut success, &mut failure).await?;
                    }
                    current_group_value = Some(value);
                }

                pending_records.push(record);
                if pending_records.len() >= max_pending_records {
                    flush_batch(store, registry, &record_types, &mut pending_records, &mut file.stats, &mut success, &mut failure).await?;
                    current_group_value = None;
                }
            }
            flush_batch(store, registry, &record_types, &mut pending_records, &mut file.stats, &mut success, &mut failure).await?;

            progress.set_stats(&file.stats);
            progress.flush(store, file_id).await?;
        }
        Ok(())
    }
    .await;

    file.times.uploading_end = Some(chrono::Utc::now());
    file.stats.uploaded_records_success = success;
    file.stats.uploaded_records_error = failure;
    progress.set_times(&file.times);
    progress.set_stats(&file.stats);

    match result {
        Ok(()) => {
            let resumed = reset_retriable_records(store, file_id).await?;
            if resumed {
                let resume_at = chrono::Utc::now() + RETRY_PAUSE;
                progress.set_status(FileStatus::UploadingRetryPause);
                progress.set("retry_resume_at", serde_json::json!(resume_at));
                progress.append_log(make_log(
                    SOURCE,
                    false,
                    format!("retriable upload errors reset to VALIDATED; resuming at {resume_at}"),
                    None,
                ));
            } else {
                progress.set_status(FileStatus::Uploaded);
                progress.unset("retry_resume_at");
                progress.append_log(make_log(SOURCE, false, "upload completed", None));
            }
            progress.flush(store, file_id).await?;
            Ok(())
        },
        Err(err) => {
            progress.set_status(FileStatus::UploadError);
            let log = match &err {
                WorkerError::Pipeline(p) => crate::pipeline::processor::make_exc_log(SOURCE, p),
                other => crate::pipeline::processor::make_other_exc_log(SOURCE, &anyhow::anyhow!(other.to_string())),
            };
            progress.append_log(log.clone());
            progress.replace_recent_errors(std::slice::from_ref(&log));
            progress.flush(store, file_id).await?;
            Err(err)
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn flush_batch(
    store: &Store,
    registry: &Registry,
    record_types: &BTreeMap<i64, &RecordType>,
    pending: &mut Vec<RecordDoc>,
    stats: &mut inflow_common::types::FileStats,
    success: &mut i64,
    failure: &mut i64,
) -> WorkerResult<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let batch = std::mem::take(pending);
    let Some(rt) = record_types.get(&batch[0].record_type) else {
        return Err(WorkerError::Pipeline(PipelineError::configuration_coded(
            ErrorCode::OtherConfigurationError,
            format!("record references unknown record type {}", batch[0].record_type),
        )));
    };
    let outcome = invoke_batch(registry, rt, &batch).await?;
    store.bulk_update_records_same(&outcome.ids, &outcome.update).await?;
    let key = stats::step_key(Stage::Upload, &[&rt.id.to_string()]);
    for _ in 0..outcome.ids.len() {
        self::stats::record_outcome(stats, &key, outcome.success);
    }
    if outcome.success {
        *success += outcome.ids.len() as i64;
    } else {
        *failure += outcome.ids.len() as i64;
    }
    Ok(())
}

/// Reset `UPLOAD_ERROR` records with `autoRetry && retryCount < 4` back to
/// `VALIDATED`, bumping `retryCount`. Returns whether any record was reset.
async fn reset_retriable_records(store: &Store, file_id: i64) -> WorkerResult<bool> {
    let (lo, hi) = inflow_common::types::record_id_range(file_id);
    let mut after_id = lo - 1;
    let mut updates: Vec<(i64, UpdateBuilder)> = Vec::new();
    loop {
        let chunk = store
            .fetch_record_chunk(file_id, Some(RecordStatusFilter::Eq(RecordStatus::UploadError)), after_id, 1000)
            .await?;
        if chunk.is_empty() {
            break;
        }
        for record in chunk {
            after_id = record.id.min(hi);
            if record.auto_retry && record.retry_count < MAX_RETRY_COUNT {
                let mut update = UpdateBuilder::new();
                update.set("status", serde_json::json!(RecordStatus::Validated.as_str()));
                update.set("retry_count", serde_json::json!(record.retry_count + 1));
                update.unset("recent_errors");
                updates.push((record.id, update));
            }
        }
    }
    if updates.is_empty() {
        return Ok(false);
    }
    store.bulk_update_records(&updates).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_eligible_below_bound() {
        assert!(3 < MAX_RETRY_COUNT);
        assert!(!(4 < MAX_RETRY_COUNT));
    }

    #[test]
    fn retry_pause_is_fifteen_minutes() {
        let before = chrono::Utc::now();
        let resume_at = before + RETRY_PAUSE;
        assert_eq!((resume_at - before).num_minutes(), 15);
    }

    #[test]
    fn duplicate_update_marks_upload_error_with_validation_code() {
        let update = duplicate_update("Record data already uploaded");
        assert_eq!(update.sets()["status"], serde_json::json!("UPLOAD_ERROR"));
    }
}
