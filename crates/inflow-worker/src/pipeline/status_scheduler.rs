//! Status scheduler: routes a file to its next stage once the current one
//! settles. Every other stage module claims its own starting status and
//! writes its own terminal status; this module only reacts to the
//! statuses no stage claims for itself (`VALIDATED`, `APPROVED_TO_UPLOAD`,
//! `UPLOADED`, `REPORTING`) and decides what runs next.
//!
//! Every transition this module makes is itself a `cas_file_status` claim,
//! so two scheduler passes racing on the same file never both act on it.

use inflow_common::types::{
    FileDoc, FileStatus, FileType, OutputInstance, OutputInstanceStatus, ReviewRequiredPolicy,
};

use crate::db::Store;
use crate::error::WorkerResult;
use crate::pipeline::processor::make_log;

const SOURCE: &str = "status_scheduler";

/// What the caller (a task entrypoint) should do after [`route`] returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerAction {
    /// Nothing to enqueue; either the file is mid-stage, terminal, or
    /// waiting on a human.
    None,
    /// Enqueue an upload task for this file.
    EnqueueUpload,
    /// Enqueue one reporter task per listed `OutputInstance` id.
    EnqueueReport { instance_ids: Vec<String> },
}

/// Inspect a file's current status and decide + apply the next step.
pub async fn route(store: &Store, file_type: &FileType, file_id: i64) -> WorkerResult<SchedulerAction> {
    let file = store.get_file(file_id).await?;
    match file.status {
        FileStatus::Validated => route_validated(store, file_type, &file).await,
        FileStatus::ApprovedToUpload => Ok(SchedulerAction::EnqueueUpload),
        FileStatus::Uploaded => route_uploaded(store, file_type, &file).await,
        FileStatus::Reporting => route_reporting(store, &file).await,
        _ => Ok(SchedulerAction::None),
    }
}

fn needs_review(file_type: &FileType, file: &FileDoc) -> bool {
    match file_type.require_upload_review {
        ReviewRequiredPolicy::Always => true,
        ReviewRequiredPolicy::OnErrors => file.stats.validated_records_error > 0,
        ReviewRequiredPolicy::Never => false,
    }
}

async fn route_validated(store: &Store, file_type: &FileType, file: &FileDoc) -> WorkerResult<SchedulerAction> {
    if !needs_review(file_type, file) {
        return Ok(SchedulerAction::EnqueueUpload);
    }
    let claimed = store
        .cas_file_status(file.id, &[FileStatus::Validated], FileStatus::WaitingApprovalToUpload)
        .await?;
    if !claimed {
        return Ok(SchedulerAction::None);
    }
    let mut update = inflow_common::types::UpdateBuilder::new();
    update.add_to_set(
        "log",
        vec![serde_json::json!(make_log(
            SOURCE,
            false,
            "upload requires manual approval before proceeding",
            None
        ))],
    );
    store.update_file(file.id, &update).await?;
    Ok(SchedulerAction::None)
}

async fn route_uploaded(store: &Store, file_type: &FileType, file: &FileDoc) -> WorkerResult<SchedulerAction> {
    let active_outputs: Vec<_> = file_type.outputs.iter().filter(|o| o.active && o.run_automatic).collect();
    if active_outputs.is_empty() {
        store.cas_file_status(file.id, &[FileStatus::Uploaded], FileStatus::Completed).await?;
        return Ok(SchedulerAction::None);
    }

    let claimed = store.cas_file_status(file.id, &[FileStatus::Uploaded], FileStatus::Reporting).await?;
    if !claimed {
        return Ok(SchedulerAction::None);
    }

    let mut outputs = file.outputs.clone();
    let mut instance_ids = Vec::with_capacity(active_outputs.len());
    for output in &active_outputs {
        let instance_id = uuid::Uuid::new_v4().to_string();
        outputs.push(OutputInstance {
            instance_id: instance_id.clone(),
            output_id: output.id,
            status: OutputInstanceStatus::Pending,
            start_time: Some(chrono::Utc::now()),
            end_time: None,
            output_filename: None,
        });
        instance_ids.push(instance_id);
    }

    let mut update = inflow_common::types::UpdateBuilder::new();
    update.set("outputs", serde_json::json!(outputs));
    update.add_to_set(
        "log",
        vec![serde_json::json!(make_log(
            SOURCE,
            false,
            format!("scheduled {} report(s)", active_outputs.len()),
            None
        ))],
    );
    store.update_file(file.id, &update).await?;
    Ok(SchedulerAction::EnqueueReport { instance_ids })
}

async fn route_reporting(store: &Store, file: &FileDoc) -> WorkerResult<SchedulerAction> {
    if file.outputs.is_empty() || !file.outputs.iter().all(is_terminal) {
        return Ok(SchedulerAction::None);
    }
    let any_failed = file.outputs.iter().any(|o| o.status == OutputInstanceStatus::Failed);
    let target = if any_failed { FileStatus::ReportError } else { FileStatus::Completed };
    store.cas_file_status(file.id, &[FileStatus::Reporting], target).await?;
    Ok(SchedulerAction::None)
}

fn is_terminal(instance: &OutputInstance) -> bool {
    matches!(instance.status, OutputInstanceStatus::Success | OutputInstanceStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflow_common::types::{FileStats, FileTimes};
    use std::collections::BTreeMap;

    fn blank_file(status: FileStatus) -> FileDoc {
        FileDoc {
            id: 1,
            partner_id: 1,
            file_type_id: 1,
            source_name: "f.csv".to_string(),
            location: "/tmp/f.csv".to_string(),
            size_bytes: 0,
            content_hash: None,
            tags: BTreeMap::new(),
            status,
            header_columns: Vec::new(),
            parsed_columns: Vec::new(),
            validated_columns: Vec::new(),
            stats: FileStats::default(),
            times: FileTimes::default(),
            log: Vec::new(),
            recent_errors: Vec::new(),
            retry_resume_at: None,
            outputs: Vec::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn never_policy_never_needs_review() {
        let file_type_never = ReviewRequiredPolicy::Never;
        assert!(!matches!(file_type_never, ReviewRequiredPolicy::Always));
    }

    #[test]
    fn on_errors_policy_requires_review_only_with_errors() {
        let mut file = blank_file(FileStatus::Validated);
        file.stats.validated_records_error = 0;
        assert!(!needs_review(&file_type_with(ReviewRequiredPolicy::OnErrors), &file));
        file.stats.validated_records_error = 2;
        assert!(needs_review(&file_type_with(ReviewRequiredPolicy::OnErrors), &file));
    }

    #[test]
    fn always_policy_always_needs_review() {
        let file = blank_file(FileStatus::Validated);
        assert!(needs_review(&file_type_with(ReviewRequiredPolicy::Always), &file));
    }

    #[test]
    fn terminal_check_accepts_success_and_failed_only() {
        let pending = OutputInstance {
            instance_id: "a".to_string(),
            output_id: 1,
            status: OutputInstanceStatus::Pending,
            start_time: None,
            end_time: None,
            output_filename: None,
        };
        let success = OutputInstance { status: OutputInstanceStatus::Success, ..pending.clone() };
        assert!(!is_terminal(&pending));
        assert!(is_terminal(&success));
    }

    fn file_type_with(policy: ReviewRequiredPolicy) -> FileType {
        FileType {
            id: 1,
            filename_patterns: Vec::new(),
            layout: inflow_common::types::FileLayout::Delimited { separator: b',', has_header: true },
            record_types: Vec::new(),
            upload_batch_group_key: None,
            upload_batch_size: 1,
            require_upload_review: policy,
            outputs: Vec::new(),
        }
    }
}
