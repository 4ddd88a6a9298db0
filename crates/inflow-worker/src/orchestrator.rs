//! Stage dispatch loop.
//!
//! §1/§5 name an external at-least-once task queue (broker + worker loop)
//! as out of scope: "the concrete set of ... the task-queue implementation
//! (broker and worker loop)" is an operational concern of the deployment,
//! not of this pipeline. What this module provides instead is the same
//! direct-dispatch shape the teacher's own ingestion orchestrator uses for
//! its single background job ("bypasses apalis job queue for simplicity —
//! just runs directly in background task"): an in-process task channel
//! fed by (a) a periodic catch-up scan over persisted file status (the
//! durability story from §1 — any stage may resume from the last recorded
//! state after a restart) and (b) each stage handler enqueueing its own
//! follow-on task. `apalis`/`apalis-postgres` remain in the dependency
//! stack for a deployment that wants to swap this channel for a real
//! broker; see DESIGN.md.
//!
//! Concurrency matches §5: parallelism is across files, never within one
//! file's stage chain — a file's next task is only enqueued after its
//! current stage's `run()` returns, so two chunks of the same file are
//! never in flight together.

use std::sync::Arc;
use std::time::Duration;

use inflow_common::types::FileStatus;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::db::Store;
use crate::error::WorkerResult;
use crate::pipeline::registry::Registry;
use crate::pipeline::{loader, parser, reporter, status_scheduler, uploader, validator};

/// One unit of stage work, addressed by file (and, for reports, output
/// instance) id.
#[derive(Debug, Clone)]
pub enum Task {
    Load(i64),
    Parse(i64),
    Validate(i64),
    Upload(i64),
    Report { file_id: i64, instance_id: String },
    /// Re-inspect a file that just settled into a status the scheduler
    /// owns (`VALIDATED`, `APPROVED_TO_UPLOAD`, `UPLOADED`, `REPORTING`).
    Schedule(i64),
}

/// How often the orchestrator re-scans persisted file status for work a
/// crashed or cold-started worker needs to pick back up.
const CATCH_UP_INTERVAL: Duration = Duration::from_secs(30);
const CATCH_UP_BATCH: i64 = 200;
const QUEUE_CAPACITY: usize = 4096;

pub struct Orchestrator {
    store: Store,
    registry: Arc<Registry>,
    files_root: std::path::PathBuf,
}

impl Orchestrator {
    pub fn new(store: Store, registry: Arc<Registry>, files_root: std::path::PathBuf) -> Self {
        Self { store, registry, files_root }
    }

    /// Run until the process is asked to shut down. Spawns the catch-up
    /// scanner alongside the dispatch loop; both share one task channel.
    pub async fn run(self, shutdown: tokio::sync::watch::Receiver<bool>) -> WorkerResult<()> {
        let (tx, rx) = mpsc::channel::<Task>(QUEUE_CAPACITY);

        let scan_store = self.store.clone();
        let scan_tx = tx.clone();
        let mut scan_shutdown = shutdown.clone();
        let scanner = tokio::spawn(async move {
            loop {
                if let Err(err) = catch_up_scan(&scan_store, &scan_tx).await {
                    error!(error = %err, "catch-up scan failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(CATCH_UP_INTERVAL) => {},
                    _ = scan_shutdown.changed() => {
                        if *scan_shutdown.borrow() {
                            break;
                        }
                    },
                }
            }
        });

        self.dispatch_loop(rx, tx, shutdown).await;
        scanner.abort();
        Ok(())
    }

    async fn dispatch_loop(
        &self,
        mut rx: mpsc::Receiver<Task>,
        tx: mpsc::Sender<Task>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                task = rx.recv() => {
                    let Some(task) = task else { break };
                    let store = self.store.clone();
                    let registry = self.registry.clone();
                    let files_root = self.files_root.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_task(&store, &registry, &files_root, task.clone(), &tx).await {
                            warn!(?task, error = %err, "stage task failed");
                        }
                    });
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },
            }
        }
    }
}

/// Scan persisted file status for work nobody has in flight: files sitting
/// in `NEW`/`LOADED`/`PARSED` start their next stage; files in the statuses
/// the scheduler owns get re-routed in case the last scheduler pass was
/// interrupted before it enqueued its follow-on task; files parked in
/// `UPLOADING_RETRY_PAUSE` are re-enqueued once `retry_resume_at` has passed
/// (§9c's fixed 15-minute pause).
async fn catch_up_scan(store: &Store, tx: &mpsc::Sender<Task>) -> WorkerResult<()> {
    let direct = [
        (FileStatus::New, Task::Load as fn(i64) -> Task),
        (FileStatus::Loaded, Task::Parse as fn(i64) -> Task),
        (FileStatus::Parsed, Task::Validate as fn(i64) -> Task),
    ];
    for (status, make_task) in direct {
        for file in store.list_files_by_status(&[status], CATCH_UP_BATCH).await? {
            let _ = tx.send(make_task(file.id)).await;
        }
    }

    let scheduled = [
        FileStatus::Validated,
        FileStatus::ApprovedToUpload,
        FileStatus::Uploaded,
        FileStatus::Reporting,
    ];
    for file in store.list_files_by_status(&scheduled, CATCH_UP_BATCH).await? {
        let _ = tx.send(Task::Schedule(file.id)).await;
    }

    let retry_paused = store.list_files_by_status(&[FileStatus::UploadingRetryPause], CATCH_UP_BATCH).await?;
    let now = chrono::Utc::now();
    for file in retry_paused {
        let due = file.retry_resume_at.is_none_or(|resume_at| resume_at <= now);
        if due {
            let _ = tx.send(Task::Upload(file.id)).await;
        }
    }

    Ok(())
}

async fn handle_task(
    store: &Store,
    registry: &Registry,
    files_root: &std::path::Path,
    task: Task,
    tx: &mpsc::Sender<Task>,
) -> WorkerResult<()> {
    match task {
        Task::Load(file_id) => {
            let (partner, file_type) = load_context(store, file_id).await?;
            loader::run(store, &partner, &file_type, file_id).await?;
            let _ = tx.send(Task::Parse(file_id)).await;
        },
        Task::Parse(file_id) => {
            let (_, file_type) = load_context(store, file_id).await?;
            parser::run(store, &file_type, file_id).await?;
            let _ = tx.send(Task::Validate(file_id)).await;
        },
        Task::Validate(file_id) => {
            let (_, file_type) = load_context(store, file_id).await?;
            validator::run(store, registry, &file_type, file_id).await?;
            let _ = tx.send(Task::Schedule(file_id)).await;
        },
        Task::Upload(file_id) => {
            let (_, file_type) = load_context(store, file_id).await?;
            uploader::run(store, registry, &file_type, file_id).await?;
            let _ = tx.send(Task::Schedule(file_id)).await;
        },
        Task::Report { file_id, instance_id } => {
            let (partner, file_type) = load_context(store, file_id).await?;
            reporter::run(store, files_root, &partner, &file_type, file_id, &instance_id).await?;
            let _ = tx.send(Task::Schedule(file_id)).await;
        },
        Task::Schedule(file_id) => {
            let (_, file_type) = load_context(store, file_id).await?;
            match status_scheduler::route(store, &file_type, file_id).await? {
                status_scheduler::SchedulerAction::None => {},
                status_scheduler::SchedulerAction::EnqueueUpload => {
                    let _ = tx.send(Task::Upload(file_id)).await;
                },
                status_scheduler::SchedulerAction::EnqueueReport { instance_ids } => {
                    for instance_id in instance_ids {
                        let _ = tx.send(Task::Report { file_id, instance_id }).await;
                    }
                },
            }
        },
    }
    Ok(())
}

async fn load_context(
    store: &Store,
    file_id: i64,
) -> WorkerResult<(inflow_common::types::Partner, inflow_common::types::FileType)> {
    let file = store.get_file(file_id).await?;
    let partner = store.get_partner(file.partner_id).await?;
    let file_type = store.get_file_type(file.file_type_id).await?;
    Ok((partner, file_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_pause_gates_on_resume_time() {
        let now = chrono::Utc::now();
        let not_due: Option<chrono::DateTime<chrono::Utc>> = Some(now + chrono::Duration::minutes(10));
        let due: Option<chrono::DateTime<chrono::Utc>> = Some(now - chrono::Duration::minutes(1));
        assert!(!not_due.is_none_or(|resume_at| resume_at <= now));
        assert!(due.is_none_or(|resume_at| resume_at <= now));
        assert!(None::<chrono::DateTime<chrono::Utc>>.is_none_or(|resume_at| resume_at <= now));
    }
}
