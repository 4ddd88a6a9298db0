//! Loader: reads the on-disk file, produces and inserts record documents.
//!
//! The file-copier that scans partner drop directories and creates the
//! initial `NEW` file document is out of scope (§1); this stage assumes
//! `File.location` already names a readable path on disk.

use std::collections::BTreeMap;
use std::io::Read;

use inflow_common::types::{
    record_id, FieldPosition, FileLayout, FileStatus, FileType, Partner, RecordDoc, RecordStatus,
    RecordType, HEADER_RECORD_TYPE,
};
use inflow_common::{ErrorCode, PipelineError};
use regex::Regex;

use crate::db::Store;
use crate::error::WorkerResult;
use crate::pipeline::hash::{hash_raw_columns, hash_raw_line};
use crate::pipeline::processor::{claim_status, make_log, tuning, FileProgress};
use crate::pipeline::stats::Stage;

const SOURCE: &str = "loader";
const SNIFF_WINDOW: usize = 8192;

/// Run the Loader for one file: `NEW → LOADING → {LOADED, LOAD_ERROR}`.
pub async fn run(
    store: &Store,
    partner: &Partner,
    file_type: &FileType,
    file_id: i64,
) -> WorkerResult<()> {
    let mut file = claim_status(store, file_id, &[FileStatus::New], FileStatus::Loading).await?;

    let mut progress = FileProgress::new();
    progress.set("header_columns", serde_json::json!(Vec::<String>::new()));
    progress.set_times(&{
        let mut t = file.times.clone();
        t.loading_start = Some(chrono::Utc::now());
        t
    });
    file.header_columns.clear();
    file.times.loading_start = Some(chrono::Utc::now());

    store.delete_records_in_range(file_id).await?;

    let result = load_body(store, partner, file_type, &mut file, &mut progress).await;

    match result {
        Ok(()) => {
            file.times.loading_end = Some(chrono::Utc::now());
            progress.set_times(&file.times);
            progress.set_stats(&file.stats);
            progress.set("header_columns", serde_json::json!(file.header_columns));
            progress.set_status(FileStatus::Loaded);
            progress.append_log(make_log(SOURCE, false, "load completed", None));
            progress.flush(store, file_id).await?;
            Ok(())
        },
        Err(err) => {
            file.times.loading_end = Some(chrono::Utc::now());
            progress.set_times(&file.times);
            progress.set_status(FileStatus::LoadError);
            let log = match &err {
                crate::error::WorkerError::Pipeline(p) => {
                    crate::pipeline::processor::make_exc_log(SOURCE, p)
                },
                other => crate::pipeline::processor::make_other_exc_log(
                    SOURCE,
                    &anyhow::anyhow!(other.to_string()),
                ),
            };
            progress.append_log(log.clone());
            progress.replace_recent_errors(std::slice::from_ref(&log));
            progress.flush(store, file_id).await?;
            Err(err)
        },
    }
}

async fn load_body(
    store: &Store,
    partner: &Partner,
    file_type: &FileType,
    file: &mut inflow_common::types::FileDoc,
    progress: &mut FileProgress,
) -> WorkerResult<()> {
    let path = std::path::Path::new(&file.location);
    let mut raw = String::new();
    std::fs::File::open(path)
        .map_err(|e| {
            crate::error::WorkerError::Pipeline(PipelineError::configuration_coded(
                ErrorCode::OtherConfigurationError,
                format!("cannot open {}: {e}", path.display()),
            ))
        })?
        .read_to_string(&mut raw)
        .map_err(|e| {
            crate::error::WorkerError::Pipeline(PipelineError::configuration(format!(
                "io error reading {}: {e}",
                path.display()
            )))
        })?;
    let raw = normalize_newlines(&raw);

    let (max_pending_updates, _) = tuning(1);
    let mut pending_records: Vec<RecordDoc> = Vec::new();
    let mut line_number: i64 = 0;
    let mut success = 0i64;
    let mut failure = 0i64;

    match &file_type.layout {
        FileLayout::Delimited { separator, has_header } => {
            let sniffed = sniff(&raw, SNIFF_WINDOW, *separator);
            if sniffed.has_header != *has_header {
                return Err(crate::error::WorkerError::Pipeline(PipelineError::configuration_coded(
                    ErrorCode::OtherConfigurationError,
                    format!(
                        "sniffed header presence ({}) does not match FileType.hasHeader ({})",
                        sniffed.has_header, has_header
                    ),
                )));
            }
            if sniffed.delimiter != *separator {
                tracing::warn!(
                    file_id = file.id,
                    sniffed = %(sniffed.delimiter as char),
                    configured = %(*separator as char),
                    "sniffed delimiter differs from configured separator; using configured",
                );
            }

            let mut reader = csv::ReaderBuilder::new()
                .delimiter(*separator)
                .has_headers(false)
                .flexible(true)
                .from_reader(raw.as_bytes());

            let mut rows = reader.records();
            if *has_header {
                let header = rows.next().transpose().map_err(|e| {
                    crate::error::WorkerError::Pipeline(PipelineError::configuration(format!(
                        "failed to read header row: {e}"
                    )))
                })?;
                let Some(header) = header else {
                    return Err(crate::error::WorkerError::Pipeline(PipelineError::configuration(
                        "file declares a header but contains no rows",
                    )));
                };
                line_number += 1;
                if file_type.record_types.len() != 1 {
                    return Err(crate::error::WorkerError::Pipeline(PipelineError::configuration_coded(
                        ErrorCode::OtherConfigurationError,
                        "a header file must declare exactly one record type",
                    )));
                }
                let columns: Vec<String> = header.iter().map(str::to_string).collect();
                let record_type = &file_type.record_types[0];
                for field in &record_type.fields {
                    if let FieldPosition::HeaderColumn { name } = &field.position {
                        if !columns.iter().any(|c| c == name) {
                            return Err(crate::error::WorkerError::Pipeline(
                                PipelineError::configuration_coded(
                                    ErrorCode::OtherConfigurationError,
                                    format!("header column '{name}' declared by field '{}' is missing from the file", field.name),
                                ),
                            ));
                        }
                    }
                }
                file.header_columns = columns.clone();
                pending_records.push(RecordDoc {
                    id: record_id(file.id, line_number),
                    file_id: file.id,
                    raw_line: None,
                    raw_columns: Some(columns.clone()),
                    hash: hash_raw_columns(&columns),
                    record_type: HEADER_RECORD_TYPE,
                    status: RecordStatus::Loaded,
                    parsed_fields: BTreeMap::new(),
                    validated_fields: BTreeMap::new(),
                    shared_key: None,
                    upload_confirmation_id: None,
                    auto_retry: false,
                    retry_count: 0,
                    log: Vec::new(),
                    recent_errors: Vec::new(),
                });
            }

            for row in rows {
                let row = row.map_err(|e| {
                    crate::error::WorkerError::Pipeline(PipelineError::configuration(format!(
                        "malformed delimited row at line {}: {e}",
                        line_number + 1
                    )))
                })?;
                line_number += 1;
                let columns: Vec<String> = row.iter().map(str::to_string).collect();
                let joined = columns.join(",");
                let record = build_record(file.id, line_number, &file_type.record_types, &joined, None, Some(columns));
                if record.status == RecordStatus::Loaded {
                    success += 1;
                } else {
                    failure += 1;
                }
                pending_records.push(record);
                if pending_records.len() >= max_pending_updates {
                    flush_records(store, &mut pending_records).await?;
                }
            }
        },
        FileLayout::FixedWidth => {
            for line in raw.split('\n') {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                line_number += 1;
                let record = build_record(
                    file.id,
                    line_number,
                    &file_type.record_types,
                    trimmed,
                    Some(trimmed.to_string()),
                    None,
                );
                if record.status == RecordStatus::Loaded {
                    success += 1;
                } else {
                    failure += 1;
                }
                pending_records.push(record);
                if pending_records.len() >= max_pending_updates {
                    flush_records(store, &mut pending_records).await?;
                }
            }
        },
    }

    flush_records(store, &mut pending_records).await?;

    file.stats.total_rows = line_number;
    file.stats.loaded_records_success = success;
    file.stats.loaded_records_error = failure;
    file.stats.steps.insert(
        Stage::Load.prefix().to_string(),
        inflow_common::types::StepStat { input: success + failure, success, failure },
    );

    let _ = partner;
    Ok(())
}

fn build_record(
    file_id: i64,
    line_number: i64,
    record_types: &[RecordType],
    joined_for_match: &str,
    raw_line: Option<String>,
    raw_columns: Option<Vec<String>>,
) -> RecordDoc {
    let hash = match &raw_columns {
        Some(cols) => hash_raw_columns(cols),
        None => hash_raw_line(raw_line.as_deref().unwrap_or_default()),
    };
    let matched = select_record_type(record_types, joined_for_match);
    let (status, log) = match matched {
        Some(_) => (RecordStatus::Loaded, None),
        None => (
            RecordStatus::LoadError,
            Some(make_log(
                SOURCE,
                true,
                format!("no record type matches row {line_number}"),
                Some(ErrorCode::OtherConfigurationError),
            )),
        ),
    };
    RecordDoc {
        id: record_id(file_id, line_number),
        file_id,
        raw_line,
        raw_columns,
        hash,
        record_type: matched.map(|rt| rt.id).unwrap_or(HEADER_RECORD_TYPE),
        status,
        parsed_fields: BTreeMap::new(),
        validated_fields: BTreeMap::new(),
        shared_key: None,
        upload_confirmation_id: None,
        auto_retry: false,
        retry_count: 0,
        log: log.clone().into_iter().collect(),
        recent_errors: log.into_iter().collect(),
    }
}

fn select_record_type<'a>(record_types: &'a [RecordType], joined: &str) -> Option<&'a RecordType> {
    if record_types.len() == 1 {
        return record_types.first();
    }
    record_types.iter().find(|rt| {
        rt.record_matches.iter().any(|pattern| {
            Regex::new(pattern).ok().map(|re| fullmatch(&re, joined)).unwrap_or(false)
        })
    })
}

fn fullmatch(re: &Regex, text: &str) -> bool {
    re.find(text).map(|m| m.start() == 0 && m.end() == text.len()).unwrap_or(false)
}

async fn flush_records(store: &Store, pending: &mut Vec<RecordDoc>) -> WorkerResult<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let batch = std::mem::take(pending);
    store.insert_records(&batch).await?;
    Ok(())
}

fn normalize_newlines(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

struct SniffResult {
    delimiter: u8,
    has_header: bool,
}

/// Sniff delimiter and header presence from the first `window` bytes.
/// §9(a): when sniffed and configured delimiter disagree, log and proceed
/// using the configured one; this function only reports what it observed.
fn sniff(raw: &str, window: usize, configured_delimiter: u8) -> SniffResult {
    let sample: String = raw.chars().take(window).collect();
    let delimiter = sniff_delimiter(&sample, configured_delimiter);
    let lines: Vec<Vec<String>> = sample
        .lines()
        .take(20)
        .map(|line| line.split(delimiter as char).map(str::to_string).collect())
        .collect();
    let has_header = sniff_has_header(&lines);
    SniffResult { delimiter, has_header }
}

fn sniff_delimiter(sample: &str, fallback: u8) -> u8 {
    const CANDIDATES: [u8; 4] = [b',', b';', b'\t', b'|'];
    let lines: Vec<&str> = sample.lines().take(10).filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        return fallback;
    }
    let mut best = fallback;
    let mut best_score = -1i64;
    for &candidate in &CANDIDATES {
        let counts: Vec<usize> =
            lines.iter().map(|l| l.bytes().filter(|&b| b == candidate).count()).collect();
        let first = counts[0];
        if first > 0 && counts.iter().all(|&c| c == first) {
            let score = first as i64;
            if score > best_score {
                best_score = score;
                best = candidate;
            }
        }
    }
    best
}

/// Simplified form of Python's `csv.Sniffer.has_header`: for each column,
/// votes for "header present" when the first row's value looks non-numeric
/// while the same column is consistently numeric in the remaining sample
/// rows, and votes against when the opposite holds.
fn sniff_has_header(lines: &[Vec<String>]) -> bool {
    if lines.len() < 2 {
        return false;
    }
    let header = &lines[0];
    let rest = &lines[1..];
    let mut votes = 0i32;
    for (col_idx, field) in header.iter().enumerate() {
        let header_numeric = field.trim().parse::<f64>().is_ok();
        let rest_values: Vec<&str> =
            rest.iter().filter_map(|row| row.get(col_idx).map(String::as_str)).collect();
        if rest_values.is_empty() {
            continue;
        }
        let rest_numeric_count = rest_values.iter().filter(|v| v.trim().parse::<f64>().is_ok()).count();
        if header_numeric && rest_numeric_count > 0 {
            votes -= 1;
        } else if !header_numeric && rest_numeric_count == rest_values.len() {
            votes += 1;
        }
    }
    votes > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_type(id: i64, patterns: &[&str]) -> RecordType {
        RecordType {
            id,
            record_matches: patterns.iter().map(|s| s.to_string()).collect(),
            fields: Vec::new(),
            record_validations: Vec::new(),
            upload: None,
            success_check: None,
        }
    }

    #[test]
    fn single_record_type_is_always_selected() {
        let types = vec![record_type(1, &[])];
        assert_eq!(select_record_type(&types, "anything").unwrap().id, 1);
    }

    #[test]
    fn first_matching_pattern_wins_in_declaration_order() {
        let types = vec![record_type(1, &["^A.*$"]), record_type(2, &["^A.*$"])];
        assert_eq!(select_record_type(&types, "ABC").unwrap().id, 1);
    }

    #[test]
    fn no_match_returns_none() {
        let types = vec![record_type(1, &["^Z.*$"]), record_type(2, &["^Y.*$"])];
        assert!(select_record_type(&types, "ABC").is_none());
    }

    #[test]
    fn sniff_delimiter_prefers_most_consistent_candidate() {
        let sample = "a,b,c\n1,2,3\n4,5,6\n";
        assert_eq!(sniff_delimiter(sample, b','), b',');
    }

    #[test]
    fn sniff_has_header_detects_text_over_numeric_columns() {
        let lines = vec![
            vec!["ID".to_string(), "VALUE".to_string()],
            vec!["1".to_string(), "10".to_string()],
            vec!["2".to_string(), "20".to_string()],
        ];
        assert!(sniff_has_header(&lines));
    }

    #[test]
    fn sniff_has_header_false_for_uniform_numeric_data() {
        let lines = vec![
            vec!["1".to_string(), "2".to_string()],
            vec!["3".to_string(), "4".to_string()],
        ];
        assert!(!sniff_has_header(&lines));
    }

    #[test]
    fn build_record_assigns_load_error_when_no_record_type_matches() {
        let types = vec![record_type(1, &["^ZZZ$"])];
        let record = build_record(7, 3, &types, "ABC", None, Some(vec!["ABC".to_string()]));
        assert_eq!(record.status, RecordStatus::LoadError);
        assert_eq!(record.recent_errors.len(), 1);
    }

    #[test]
    fn record_id_embeds_file_and_line() {
        let record = build_record(
            7,
            3,
            &[record_type(1, &[])],
            "x",
            None,
            Some(vec!["x".to_string()]),
        );
        assert_eq!(record.id, (7i64 << 32) | 3);
    }
}
