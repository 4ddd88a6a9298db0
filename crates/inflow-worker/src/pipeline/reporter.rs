//! Reporter: streams filtered records to a CSV output according to one
//! `Output` config and the `OutputInstance` tracking this run of it.
//!
//! Unlike the other stages this one does not claim a file status — the
//! scheduler has already moved the file to `REPORTING` and may have
//! scheduled several reporter tasks in parallel, one per active output.
//! Each task only ever touches its own `OutputInstance` entry.

use std::collections::HashSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use inflow_common::types::{
    FileDoc, FileType, OutputConfig, OutputInstance, OutputInstanceStatus, Partner, ProcessingLog, RecordDoc,
};
use inflow_common::{ErrorCode, PipelineError};
use regex::Regex;

use crate::db::Store;
use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::processor::{make_exc_log, make_log};
use crate::pipeline::stats::{self, Stage};

const SOURCE: &str = "reporter";
const FETCH_CHUNK_SIZE: i64 = 1000;
const KNOWN_TOKENS: &[&str] = &["NOW_TS", "NOW_TS_HEX", "ORIG_FILE_STEM"];

/// Run the Reporter for one `(file, output, instance)` triple. Never
/// changes `File.status`; only the matching `OutputInstance` and the
/// file's `log`/`recentErrors`/step stat are updated.
pub async fn run(
    store: &Store,
    files_root: &Path,
    partner: &Partner,
    file_type: &FileType,
    file_id: i64,
    instance_id: &str,
) -> WorkerResult<()> {
    let file = store.get_file(file_id).await?;
    let instance = file
        .outputs
        .iter()
        .find(|o| o.instance_id == instance_id)
        .cloned()
        .ok_or_else(|| {
            WorkerError::Pipeline(PipelineError::configuration_coded(
                ErrorCode::OtherConfigurationError,
                format!("file {file_id} has no output instance '{instance_id}'"),
            ))
        })?;
    let output = file_type
        .outputs
        .iter()
        .find(|o| o.id == instance.output_id)
        .ok_or_else(|| {
            WorkerError::Pipeline(PipelineError::configuration_coded(
                ErrorCode::OtherConfigurationError,
                format!("file type {} has no output {}", file_type.id, instance.output_id),
            ))
        })?;

    let step_key = stats::step_key(Stage::Report, &[instance_id]);
    let outcome = write_report(store, files_root, partner, &file, output, instance_id).await;

    let (closed_instance, log, recent_errors, step) = match outcome {
        Ok((filename, success, failure)) => {
            let mut closed = instance.clone();
            closed.status = OutputInstanceStatus::Success;
            closed.end_time = Some(chrono::Utc::now());
            closed.output_filename = Some(filename);
            let log = make_log(SOURCE, false, "report completed", None);
            (
                closed,
                log,
                Vec::new(),
                inflow_common::types::StepStat { input: success + failure, success, failure },
            )
        },
        Err(err) => {
            let mut closed = instance.clone();
            closed.status = OutputInstanceStatus::Failed;
            closed.end_time = Some(chrono::Utc::now());
            let log = match &err {
                WorkerError::Pipeline(p) => make_exc_log(SOURCE, p),
                other => crate::pipeline::processor::make_other_exc_log(SOURCE, &anyhow::anyhow!(other.to_string())),
            };
            (closed, log.clone(), vec![log], inflow_common::types::StepStat { input: 0, success: 0, failure: 0 })
        },
    };

    store
        .apply_report_outcome(file_id, &closed_instance, &log, &recent_errors, &step_key, &step)
        .await?;

    match outcome {
        Ok(_) => Ok(()),
        Err(err) => Err(err),
    }
}

async fn write_report(
    store: &Store,
    files_root: &Path,
    partner: &Partner,
    file: &FileDoc,
    output: &OutputConfig,
    instance_id: &str,
) -> WorkerResult<(String, i64, i64)> {
    let relative = render_path(&output.path_template, file)?;
    let path = files_root.join(&partner.outgoing_directory).join(&relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            WorkerError::Pipeline(PipelineError::configuration_coded(
                ErrorCode::OtherConfigurationError,
                format!("cannot create report directory {}: {e}", parent.display()),
            ))
        })?;
    }

    let columns = build_columns(output, file);
    let handle = std::fs::File::create(&path).map_err(|e| {
        WorkerError::Pipeline(PipelineError::configuration_coded(
            ErrorCode::OtherConfigurationError,
            format!("cannot create report file {}: {e}", path.display()),
        ))
    })?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(handle);

    if output.write_header {
        writer
            .write_record(columns.iter().map(|c| c.header.as_str()))
            .map_err(|e| report_io_error(instance_id, &e))?;
    }

    let status_filter = (!output.record_statuses.is_empty()).then(|| output.record_statuses.clone());
    let failed_configs: HashSet<i64> = output.failed_function_configs.iter().copied().collect();

    let mut success = 0i64;
    let mut failure = 0i64;
    let (lo, hi) = file.record_id_range();
    let mut after_id = lo - 1;

    loop {
        let chunk = store.fetch_record_chunk(file.id, None, after_id, FETCH_CHUNK_SIZE).await?;
        if chunk.is_empty() {
            break;
        }
        for record in &chunk {
            after_id = record.id.min(hi);
            if record.is_header() {
                continue;
            }
            if let Some(statuses) = &status_filter {
                if !statuses.contains(&record.status) {
                    continue;
                }
            }
            if !failed_configs.is_empty() && !matches_failed_config(record, &failed_configs) {
                continue;
            }
            let row: Vec<String> = columns.iter().map(|c| c.render(record)).collect();
            match writer.write_record(&row) {
                Ok(()) => success += 1,
                Err(_) => failure += 1,
            }
        }
    }
    writer.flush().map_err(|e| report_io_error(instance_id, &e))?;

    Ok((path.to_string_lossy().into_owned(), success, failure))
}

fn report_io_error(instance_id: &str, err: &impl std::fmt::Display) -> WorkerError {
    WorkerError::Pipeline(PipelineError::configuration_coded(
        ErrorCode::OtherConfigurationError,
        format!("report instance '{instance_id}' failed to write a row: {err}"),
    ))
}

fn matches_failed_config(record: &RecordDoc, failed_configs: &HashSet<i64>) -> bool {
    record
        .recent_errors
        .iter()
        .any(|e: &ProcessingLog| e.function_config_id.is_some_and(|id| failed_configs.contains(&id)))
}

enum ColumnKind {
    RawInput(usize),
    Errors,
}

struct ReportColumn {
    header: String,
    kind: ColumnKind,
}

impl ReportColumn {
    fn render(&self, record: &RecordDoc) -> String {
        match self.kind {
            ColumnKind::RawInput(i) => record.raw_columns.as_ref().and_then(|c| c.get(i)).cloned().unwrap_or_default(),
            ColumnKind::Errors => {
                record.recent_errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>().join(", ")
            },
        }
    }
}

fn build_columns(output: &OutputConfig, file: &FileDoc) -> Vec<ReportColumn> {
    let mut columns = Vec::new();
    if output.duplicate_input_fields {
        for (i, name) in file.header_columns.iter().enumerate() {
            columns.push(ReportColumn { header: name.clone(), kind: ColumnKind::RawInput(i) });
        }
    }
    if output.include_recent_errors {
        columns.push(ReportColumn { header: "Errors".to_string(), kind: ColumnKind::Errors });
    }
    columns
}

/// Resolve `{NOW_TS}` / `{NOW_TS_HEX}` / `{ORIG_FILE_STEM}` tokens in a
/// path template. An empty template defaults to
/// `${sanitized_name}-${NOW_TS_HEX}.csv`. Any other `{TOKEN}` is an error.
fn render_path(template: &str, file: &FileDoc) -> WorkerResult<PathBuf> {
    let now_ts = chrono::Utc::now().timestamp();
    let stem = Path::new(&file.source_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.source_name.clone());
    let sanitized = sanitize(&stem);

    let rendered = if template.is_empty() {
        format!("{sanitized}-{now_ts:x}.csv")
    } else {
        let token_re = Regex::new(r"\{([A-Z_]+)\}").expect("static pattern");
        for caps in token_re.captures_iter(template) {
            let token = &caps[1];
            if !KNOWN_TOKENS.contains(&token) {
                return Err(WorkerError::Pipeline(PipelineError::configuration_coded(
                    ErrorCode::OtherConfigurationError,
                    format!("unknown report path token '{{{token}}}'"),
                )));
            }
        }
        template
            .replace("{NOW_TS}", &now_ts.to_string())
            .replace("{NOW_TS_HEX}", &format!("{now_ts:x}"))
            .replace("{ORIG_FILE_STEM}", &stem)
    };

    Ok(PathBuf::from(rendered.trim_start_matches('/')))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use inflow_common::types::{FileStats, FileStatus, FileTimes, OutputInstanceStatus};
    use std::collections::BTreeMap;

    fn blank_file() -> FileDoc {
        FileDoc {
            id: 7,
            partner_id: 1,
            file_type_id: 1,
            source_name: "incoming/partner-data.TXT".to_string(),
            location: "/tmp/partner-data.TXT".to_string(),
            size_bytes: 0,
            content_hash: None,
            tags: BTreeMap::new(),
            status: FileStatus::Reporting,
            header_columns: vec!["ID".to_string(), "COL_2".to_string()],
            parsed_columns: Vec::new(),
            validated_columns: Vec::new(),
            stats: FileStats::default(),
            times: FileTimes::default(),
            log: Vec::new(),
            recent_errors: Vec::new(),
            retry_resume_at: None,
            outputs: vec![OutputInstance {
                instance_id: "abc".to_string(),
                output_id: 1,
                status: OutputInstanceStatus::Pending,
                start_time: None,
                end_time: None,
                output_filename: None,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn empty_template_defaults_to_sanitized_stem_plus_hex_ts() {
        let file = blank_file();
        let path = render_path("", &file).unwrap();
        let name = path.to_string_lossy().into_owned();
        assert!(name.starts_with("partner-data-"));
        assert!(name.ends_with(".csv"));
    }

    #[test]
    fn known_tokens_are_substituted() {
        let file = blank_file();
        let path = render_path("reports/{ORIG_FILE_STEM}-{NOW_TS_HEX}.csv", &file).unwrap();
        assert!(path.to_string_lossy().starts_with("reports/partner-data-"));
    }

    #[test]
    fn unknown_token_is_an_error() {
        let file = blank_file();
        assert!(render_path("{NOT_A_TOKEN}.csv", &file).is_err());
    }

    #[test]
    fn leading_slash_is_stripped() {
        let file = blank_file();
        let path = render_path("/abs/report.csv", &file).unwrap();
        assert_eq!(path, PathBuf::from("abs/report.csv"));
    }

    #[test]
    fn duplicate_input_fields_prepends_header_columns() {
        let file = blank_file();
        let output = OutputConfig {
            id: 1,
            name: "out".to_string(),
            active: true,
            run_automatic: true,
            path_template: String::new(),
            duplicate_input_fields: true,
            include_recent_errors: true,
            write_header: true,
            record_statuses: Vec::new(),
            failed_function_configs: Vec::new(),
        };
        let columns = build_columns(&output, &file);
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].header, "ID");
        assert_eq!(columns[1].header, "COL_2");
        assert_eq!(columns[2].header, "Errors");
    }

    #[test]
    fn errors_column_joins_recent_error_messages() {
        let record = RecordDoc {
            id: 1,
            file_id: 7,
            raw_line: None,
            raw_columns: Some(vec!["1".to_string(), "x".to_string()]),
            hash: "h".to_string(),
            record_type: 1,
            status: inflow_common::types::RecordStatus::ValidationError,
            parsed_fields: BTreeMap::new(),
            validated_fields: BTreeMap::new(),
            shared_key: None,
            upload_confirmation_id: None,
            auto_retry: false,
            retry_count: 0,
            log: Vec::new(),
            recent_errors: vec![
                make_log(SOURCE, true, "bad id", None),
                make_log(SOURCE, true, "bad col2", None),
            ],
        };
        let column = ReportColumn { header: "Errors".to_string(), kind: ColumnKind::Errors };
        assert_eq!(column.render(&record), "bad id, bad col2");
    }
}
