//! Parser: maps raw cells to named fields per record type.
//!
//! Builds one [`RecordTypePlan`] per record type at stage setup, then
//! applies it to every `LOADED` record in the file's range. The HEADER
//! record (if any) passes through untouched — it already populated
//! `File.headerColumns` during Load.

use std::collections::BTreeMap;
use std::ops::Range;

use inflow_common::types::{FieldPosition, FileLayout, FileStatus, FileType, RecordStatus, RecordType};
use inflow_common::{ErrorCode, PipelineError};

use crate::db::store::RecordStatusFilter;
use crate::db::Store;
use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::processor::{claim_status, make_log, tuning, FileProgress, PendingUpdates};
use crate::pipeline::stats::{self, Stage};

const SOURCE: &str = "parser";

/// How a record type's raw representation maps onto named fields.
enum FieldMap {
    /// Index-aligned: `fieldnames[i]` names the field at raw-column `i`.
    Indexed(Vec<Option<String>>),
    /// Fixed-width: 0-based half-open char ranges, in field declaration order.
    CharRanges(Vec<(String, Range<usize>)>),
}

struct RecordTypePlan {
    field_map: FieldMap,
    shared_keys: Vec<String>,
}

fn build_plans(file_type: &FileType, header_columns: &[String]) -> BTreeMap<i64, RecordTypePlan> {
    file_type
        .record_types
        .iter()
        .map(|rt| (rt.id, build_plan(rt, &file_type.layout, header_columns)))
        .collect()
}

fn build_plan(rt: &RecordType, layout: &FileLayout, header_columns: &[String]) -> RecordTypePlan {
    let shared_keys =
        rt.fields.iter().filter(|f| f.active && f.is_shared_key).map(|f| f.name.clone()).collect();

    let field_map = match layout {
        FileLayout::Delimited { has_header: true, .. } => {
            let mut fieldnames: Vec<Option<String>> = vec![None; header_columns.len()];
            for field in rt.fields.iter().filter(|f| f.active) {
                if let FieldPosition::HeaderColumn { name } = &field.position {
                    if let Some(idx) = header_columns.iter().position(|c| c == name) {
                        fieldnames[idx] = Some(field.name.clone());
                    }
                }
            }
            FieldMap::Indexed(fieldnames)
        },
        FileLayout::Delimited { has_header: false, .. } => {
            let max_index = rt
                .fields
                .iter()
                .filter(|f| f.active)
                .filter_map(|f| match &f.position {
                    FieldPosition::ColumnIndex { index } => Some(*index),
                    _ => None,
                })
                .max();
            // §4.4: sized `max(columnIndex)+1`, not `max(columnIndex)`.
            let mut fieldnames: Vec<Option<String>> = vec![None; max_index.map(|m| m + 1).unwrap_or(0)];
            for field in rt.fields.iter().filter(|f| f.active) {
                if let FieldPosition::ColumnIndex { index } = &field.position {
                    fieldnames[*index] = Some(field.name.clone());
                }
            }
            FieldMap::Indexed(fieldnames)
        },
        FileLayout::FixedWidth => {
            let ranges = rt
                .fields
                .iter()
                .filter(|f| f.active)
                .filter_map(|f| match &f.position {
                    // 1-based inclusive -> 0-based half-open.
                    FieldPosition::CharRange { start, end } => Some((f.name.clone(), (*start - 1)..*end)),
                    _ => None,
                })
                .collect();
            FieldMap::CharRanges(ranges)
        },
    };

    RecordTypePlan { field_map, shared_keys }
}

fn parsed_columns(file_type: &FileType) -> Vec<String> {
    let mut seen = Vec::new();
    for rt in &file_type.record_types {
        for field in rt.fields.iter().filter(|f| f.active) {
            if !seen.contains(&field.name) {
                seen.push(field.name.clone());
            }
        }
    }
    seen
}

/// Outcome of parsing one record: either the populated fields plus optional
/// shared key, or a record-level parse error.
struct ParseOutcome {
    parsed_fields: BTreeMap<String, String>,
    shared_key: Option<String>,
    error: Option<String>,
}

fn parse_record(plan: &RecordTypePlan, raw_columns: Option<&[String]>, raw_line: Option<&str>) -> ParseOutcome {
    let parsed_fields = match &plan.field_map {
        FieldMap::Indexed(fieldnames) => {
            let Some(raw) = raw_columns else {
                return ParseOutcome {
                    parsed_fields: BTreeMap::new(),
                    shared_key: None,
                    error: Some("delimited record has no rawColumns".to_string()),
                };
            };
            if raw.len() < fieldnames.len() {
                return ParseOutcome {
                    parsed_fields: BTreeMap::new(),
                    shared_key: None,
                    error: Some(format!(
                        "row has {} columns, expected at least {}",
                        raw.len(),
                        fieldnames.len()
                    )),
                };
            }
            fieldnames
                .iter()
                .zip(raw.iter())
                .filter_map(|(name, value)| name.clone().map(|n| (n, value.clone())))
                .collect()
        },
        FieldMap::CharRanges(ranges) => {
            let Some(line) = raw_line else {
                return ParseOutcome {
                    parsed_fields: BTreeMap::new(),
                    shared_key: None,
                    error: Some("fixed-width record has no rawLine".to_string()),
                };
            };
            let chars: Vec<char> = line.chars().collect();
            if let Some((name, _)) = ranges.iter().find(|(_, r)| r.end > chars.len()) {
                return ParseOutcome {
                    parsed_fields: BTreeMap::new(),
                    shared_key: None,
                    error: Some(format!("line too short to extract field '{name}'")),
                };
            }
            ranges
                .iter()
                .map(|(name, range)| {
                    let value: String = chars[range.clone()].iter().collect::<String>().trim().to_string();
                    (name.clone(), value)
                })
                .collect()
        },
    };

    let shared_key = if plan.shared_keys.is_empty() {
        None
    } else {
        Some(
            plan.shared_keys
                .iter()
                .filter_map(|k| parsed_fields.get(k).cloned())
                .collect::<Vec<_>>()
                .join("++"),
        )
    };

    ParseOutcome { parsed_fields, shared_key, error: None }
}

/// Run the Parser for one file: `LOADED → PARSING → {PARSED, PARSE_ERROR}`.
pub async fn run(store: &Store, file_type: &FileType, file_id: i64) -> WorkerResult<()> {
    let mut file = claim_status(store, file_id, &[FileStatus::Loaded], FileStatus::Parsing).await?;
    stats::clear_stats(&mut file.stats, &mut file.times, Stage::Parse);
    file.times.parsing_start = Some(chrono::Utc::now());

    let plans = build_plans(file_type, &file.header_columns);
    let (max_pending_updates, chunk_size) = tuning(1);
    let mut pending = PendingUpdates::new(max_pending_updates);
    let mut progress = FileProgress::new();

    let mut success = 0i64;
    let mut failure = 0i64;
    let (lo, _hi) = file.record_id_range();
    let mut after_id = lo - 1;

    let result: WorkerResult<()> = async {
        loop {
            let chunk = store
                .fetch_record_chunk(
                    file_id,
                    Some(RecordStatusFilter::Eq(RecordStatus::Loaded)),
                    after_id,
                    chunk_size,
                )
                .await?;
            if chunk.is_empty() {
                break;
            }
            for record in &chunk {
                after_id = record.id;
                if record.is_header() {
                    continue;
                }
                let Some(plan) = plans.get(&record.record_type) else {
                    return Err(WorkerError::Pipeline(PipelineError::configuration_coded(
                        ErrorCode::OtherConfigurationError,
                        format!("record {} references unknown record type {}", record.id, record.record_type),
                    )));
                };
                let outcome = parse_record(plan, record.raw_columns.as_deref(), record.raw_line.as_deref());
                let mut update = inflow_common::types::UpdateBuilder::new();
                update.set("parsed_fields", serde_json::json!(outcome.parsed_fields));
                match outcome.shared_key {
                    Some(key) => {
                        update.set("shared_key", serde_json::json!(key));
                    },
                    None => {
                        update.unset("shared_key");
                    },
                }
                let key = stats::step_key(Stage::Parse, &[&record.record_type.to_string()]);
                if let Some(message) = outcome.error {
                    update.set("status", serde_json::json!(RecordStatus::ParseError.as_str()));
                    let log = make_log(SOURCE, true, message, Some(ErrorCode::OtherConfigurationError));
                    update.add_to_set("log", vec![serde_json::json!(log)]);
                    update.set("recent_errors", serde_json::json!([log]));
                    failure += 1;
                    stats::record_outcome(&mut file.stats, &key, false);
                } else {
                    update.set("status", serde_json::json!(RecordStatus::Parsed.as_str()));
                    success += 1;
                    stats::record_outcome(&mut file.stats, &key, true);
                }
                pending.push(record.id, update);
                if pending.should_flush() {
                    pending.flush(store).await?;
                    progress.set_stats(&file.stats);
                    progress.flush(store, file_id).await?;
                }
            }
        }
        pending.flush(store).await?;
        Ok(())
    }
    .await;

    file.times.parsing_end = Some(chrono::Utc::now());
    file.stats.parsed_records_success = success;
    file.stats.parsed_records_error = failure;
    progress.set_times(&file.times);
    progress.set_stats(&file.stats);
    progress.set("parsed_columns", serde_json::json!(parsed_columns(file_type)));

    match result {
        Ok(()) => {
            progress.set_status(FileStatus::Parsed);
            progress.append_log(make_log(SOURCE, false, "parse completed", None));
            progress.flush(store, file_id).await?;
            Ok(())
        },
        Err(err) => {
            progress.set_status(FileStatus::ParseError);
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

#[cfg(test)]
mod tests {
    use super::*;
    use inflow_common::types::{FieldType, FunctionDatatype};

    fn field(name: &str, position: FieldPosition, shared: bool) -> FieldType {
        FieldType {
            id: 1,
            name: name.to_string(),
            position,
            active: true,
            validations: Vec::new(),
            is_shared_key: shared,
            output_datatype: FunctionDatatype::String,
            output_ephemeral: false,
        }
    }

    fn record_type(fields: Vec<FieldType>) -> RecordType {
        RecordType {
            id: 1001,
            record_matches: Vec::new(),
            fields,
            record_validations: Vec::new(),
            upload: None,
            success_check: None,
        }
    }

    #[test]
    fn columnindex_plan_sizes_to_max_plus_one() {
        let rt = record_type(vec![
            field("id", FieldPosition::ColumnIndex { index: 0 }, false),
            field("c3", FieldPosition::ColumnIndex { index: 2 }, false),
        ]);
        let plan = build_plan(&rt, &FileLayout::Delimited { separator: b',', has_header: false }, &[]);
        match plan.field_map {
            FieldMap::Indexed(names) => {
                assert_eq!(names.len(), 3);
                assert_eq!(names[0].as_deref(), Some("id"));
                assert_eq!(names[1], None);
                assert_eq!(names[2].as_deref(), Some("c3"));
            },
            _ => panic!("expected indexed field map"),
        }
    }

    #[test]
    fn short_row_is_a_parse_error() {
        let rt = record_type(vec![
            field("id", FieldPosition::ColumnIndex { index: 0 }, false),
            field("c2", FieldPosition::ColumnIndex { index: 1 }, false),
            field("c3", FieldPosition::ColumnIndex { index: 2 }, false),
        ]);
        let plan = build_plan(&rt, &FileLayout::Delimited { separator: b',', has_header: false }, &[]);
        let raw = vec!["a".to_string(), "b".to_string()];
        let outcome = parse_record(&plan, Some(&raw), None);
        assert!(outcome.error.is_some());
        assert!(outcome.parsed_fields.is_empty());
    }

    #[test]
    fn fixed_width_char_ranges_are_trimmed() {
        let rt = record_type(vec![
            field("a", FieldPosition::CharRange { start: 1, end: 5 }, false),
            field("b", FieldPosition::CharRange { start: 6, end: 10 }, false),
        ]);
        let plan = build_plan(&rt, &FileLayout::FixedWidth, &[]);
        let outcome = parse_record(&plan, None, Some("ab   cd   "));
        assert_eq!(outcome.parsed_fields.get("a").unwrap(), "ab");
        assert_eq!(outcome.parsed_fields.get("b").unwrap(), "cd");
    }

    #[test]
    fn shared_key_joins_with_double_plus() {
        let rt = record_type(vec![
            field("a", FieldPosition::ColumnIndex { index: 0 }, true),
            field("b", FieldPosition::ColumnIndex { index: 1 }, true),
        ]);
        let plan = build_plan(&rt, &FileLayout::Delimited { separator: b',', has_header: false }, &[]);
        let raw = vec!["x".to_string(), "y".to_string()];
        let outcome = parse_record(&plan, Some(&raw), None);
        assert_eq!(outcome.shared_key.as_deref(), Some("x++y"));
    }

    #[test]
    fn header_plan_maps_by_column_name() {
        let rt = record_type(vec![field("id", FieldPosition::HeaderColumn { name: "ID".to_string() }, false)]);
        let headers = vec!["ID".to_string(), "COL_2".to_string()];
        let plan = build_plan(&rt, &FileLayout::Delimited { separator: b',', has_header: true }, &headers);
        match plan.field_map {
            FieldMap::Indexed(names) => {
                assert_eq!(names[0].as_deref(), Some("id"));
                assert_eq!(names[1], None);
            },
            _ => panic!("expected indexed field map"),
        }
    }
}
