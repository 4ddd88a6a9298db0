//! Validator: runs field- and record-level functions, writes validated fields.

use std::collections::{BTreeMap, HashSet};

use inflow_common::types::{FieldType, FileStatus, FileType, FunctionConfig, FunctionDatatype, RecordStatus, RecordType};
use inflow_common::{ErrorCode, PipelineError};

use crate::db::store::RecordStatusFilter;
use crate::db::Store;
use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::processor::{claim_status, make_log, tuning, FileProgress, PendingUpdates};
use crate::pipeline::registry::Registry;
use crate::pipeline::stats::{self, Stage};

const SOURCE: &str = "validator";

struct RecordTypeValidation<'a> {
    rt: &'a RecordType,
    field_validations: BTreeMap<&'a str, &'a [FunctionConfig]>,
}

fn build_lookup(file_type: &FileType) -> BTreeMap<i64, RecordTypeValidation<'_>> {
    file_type
        .record_types
        .iter()
        .map(|rt| {
            let field_validations =
                rt.fields.iter().filter(|f| f.active).map(|f| (f.name.as_str(), f.validations.as_slice())).collect();
            (rt.id, RecordTypeValidation { rt, field_validations })
        })
        .collect()
}

fn coerce_output(value: &str, datatype: FunctionDatatype) -> Result<String, PipelineError> {
    match datatype {
        FunctionDatatype::String => Ok(value.to_string()),
        FunctionDatatype::Integer => value.parse::<i64>().map(|v| v.to_string()).map_err(|e| {
            PipelineError::validation_coded(
                ErrorCode::OtherValidationError,
                format!("'{value}' is not a valid integer output: {e}"),
            )
        }),
        FunctionDatatype::Float => value.parse::<f64>().map(|v| v.to_string()).map_err(|e| {
            PipelineError::validation_coded(
                ErrorCode::OtherValidationError,
                format!("'{value}' is not a valid float output: {e}"),
            )
        }),
        FunctionDatatype::Boolean => Ok(if value.eq_ignore_ascii_case("true") { "true" } else { "false" }.to_string()),
        FunctionDatatype::Enum => Ok(value.to_ascii_uppercase()),
        FunctionDatatype::Dict => {
            let parsed: serde_json::Value = serde_json::from_str(value).map_err(|e| {
                PipelineError::validation_coded(ErrorCode::OtherValidationError, format!("not valid JSON: {e}"))
            })?;
            serde_json::to_string(&parsed).map_err(|e| {
                PipelineError::validation_coded(ErrorCode::OtherValidationError, format!("cannot re-encode JSON: {e}"))
            })
        },
    }
}

struct FieldOutcome {
    field_id: i64,
    config_id: i64,
    ok: bool,
}

struct ValidateOutcome {
    validated_fields: BTreeMap<String, String>,
    errors: Vec<inflow_common::types::ProcessingLog>,
    field_outcomes: Vec<FieldOutcome>,
}

fn validate_record(
    registry: &Registry,
    rtv: &RecordTypeValidation<'_>,
    parsed_fields: &BTreeMap<String, String>,
) -> ValidateOutcome {
    let mut working: BTreeMap<String, String> = parsed_fields.clone();
    let mut errors = Vec::new();
    let mut field_outcomes = Vec::new();

    for (field_name, original_value) in parsed_fields.iter() {
        let Some(validations) = rtv.field_validations.get(field_name.as_str()) else {
            continue;
        };
        let field_id = rtv.rt.fields.iter().find(|f| &f.name == field_name).map(|f| f.id).unwrap_or(0);
        let mut value = original_value.clone();
        for config in validations.iter() {
            match registry.call_field(&config.function_id, config, &value) {
                Ok(new_value) => {
                    value = new_value;
                    field_outcomes.push(FieldOutcome { field_id, config_id: config.id, ok: true });
                },
                Err(err) => {
                    field_outcomes.push(FieldOutcome { field_id, config_id: config.id, ok: false });
                    errors.push(make_log(
                        SOURCE,
                        true,
                        format!("field '{field_name}': {}", err.summary()),
                        Some(err.error_code()),
                    ));
                    // original value retained; stop further validations on this field.
                    value = original_value.clone();
                    break;
                },
            }
        }
        working.insert(field_name.clone(), value);
    }

    if errors.is_empty() {
        for config in &rtv.rt.record_validations {
            match registry.call_record(&config.function_id, config, &working) {
                Ok(Some(new_map)) => working = new_map,
                Ok(None) => {},
                Err(err) => {
                    errors.push(make_log(SOURCE, true, err.summary().to_string(), Some(err.error_code())));
                    break;
                },
            }
        }
    }

    let mut validated_fields = BTreeMap::new();
    for (name, value) in working.iter() {
        if let Some(field_type) = rtv.rt.fields.iter().find(|f: &&FieldType| &f.name == name) {
            if field_type.output_ephemeral {
                continue;
            }
            match coerce_output(value, field_type.output_datatype) {
                Ok(coerced) => {
                    validated_fields.insert(name.clone(), coerced);
                },
                Err(err) => {
                    errors.push(make_log(SOURCE, true, err.summary().to_string(), Some(err.error_code())));
                    validated_fields.insert(name.clone(), value.clone());
                },
            }
        } else {
            validated_fields.insert(name.clone(), value.clone());
        }
    }

    ValidateOutcome { validated_fields, errors, field_outcomes }
}

/// Run the Validator for one file: `PARSED → VALIDATING → {VALIDATED, VALIDATE_ERROR}`.
pub async fn run(store: &Store, registry: &Registry, file_type: &FileType, file_id: i64) -> WorkerResult<()> {
    let mut file = claim_status(store, file_id, &[FileStatus::Parsed], FileStatus::Validating).await?;
    stats::clear_stats(&mut file.stats, &mut file.times, Stage::Validate);
    file.times.validating_start = Some(chrono::Utc::now());

    let lookup = build_lookup(file_type);
    let (max_pending_updates, chunk_size) = tuning(1);
    let mut pending = PendingUpdates::new(max_pending_updates);
    let mut progress = FileProgress::new();

    let mut success = 0i64;
    let mut failure = 0i64;
    let (lo, _hi) = file.record_id_range();
    let mut after_id = lo - 1;
    let mut validated_columns: Vec<String> = Vec::new();
    let mut seen_columns: HashSet<String> = HashSet::new();

    let result: WorkerResult<()> = async {
        loop {
            let chunk = store
                .fetch_record_chunk(
                    file_id,
                    Some(RecordStatusFilter::Eq(RecordStatus::Parsed)),
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
                let Some(rtv) = lookup.get(&record.record_type) else {
                    return Err(WorkerError::Pipeline(PipelineError::configuration_coded(
                        ErrorCode::OtherConfigurationError,
                        format!("record {} references unknown record type {}", record.id, record.record_type),
                    )));
                };
                let outcome = validate_record(registry, rtv, &record.parsed_fields);

                for column in outcome.validated_fields.keys() {
                    if seen_columns.insert(column.clone()) {
                        validated_columns.push(column.clone());
                    }
                }

                for fo in &outcome.field_outcomes {
                    let key = stats::step_key(Stage::Validate, &[
                        &record.record_type.to_string(),
                        &fo.field_id.to_string(),
                        &fo.config_id.to_string(),
                    ]);
                    stats::record_outcome(&mut file.stats, &key, fo.ok);
                }

                let mut update = inflow_common::types::UpdateBuilder::new();
                update.set("validated_fields", serde_json::json!(outcome.validated_fields));
                if outcome.errors.is_empty() {
                    update.set("status", serde_json::json!(RecordStatus::Validated.as_str()));
                    success += 1;
                } else {
                    update.set("status", serde_json::json!(RecordStatus::ValidationError.as_str()));
                    update.add_to_set(
                        "log",
                        outcome.errors.iter().map(|l| serde_json::json!(l)).collect(),
                    );
                    update.set("recent_errors", serde_json::json!(outcome.errors));
                    failure += 1;
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

    file.times.validating_end = Some(chrono::Utc::now());
    file.stats.validated_records_success = success;
    file.stats.validated_records_error = failure;
    progress.set_times(&file.times);
    progress.set_stats(&file.stats);
    progress.set("validated_columns", serde_json::json!(validated_columns));

    match result {
        Ok(()) => {
            progress.set_status(FileStatus::Validated);
            progress.append_log(make_log(SOURCE, false, "validation completed", None));
            progress.flush(store, file_id).await?;
            Ok(())
        },
        Err(err) => {
            progress.set_status(FileStatus::ValidateError);
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
    use inflow_common::types::{FieldPosition, FunctionKind, FunctionParameter, FunctionSource};
    use crate::pipeline::registry::NativeRegistry;
    use sqlx::postgres::PgPoolOptions;

    fn field(id: i64, name: &str, ephemeral: bool, validations: Vec<FunctionConfig>) -> FieldType {
        FieldType {
            id,
            name: name.to_string(),
            position: FieldPosition::ColumnIndex { index: 0 },
            active: true,
            validations,
            is_shared_key: false,
            output_datatype: FunctionDatatype::String,
            output_ephemeral: ephemeral,
        }
    }

    fn not_empty_function() -> inflow_common::types::Function {
        inflow_common::types::Function {
            id: "notEmpty".to_string(),
            kind: FunctionKind::FieldValidation,
            source: FunctionSource::Native { symbol: "notEmpty".to_string() },
            parameters: Vec::<FunctionParameter>::new(),
            fields_in: Vec::new(),
            fields_out: Vec::new(),
            deprecated: false,
        }
    }

    fn registry() -> Registry {
        let pool = PgPoolOptions::new().connect_lazy("postgres://localhost/inflow_test").unwrap();
        Registry::new(NativeRegistry::builtin(), vec![not_empty_function()], pool)
    }

    #[test]
    fn failing_field_validation_retains_original_value_and_marks_error() {
        let cfg = FunctionConfig { id: 7, function_id: "notEmpty".to_string(), parameter_values: Vec::new() };
        let rt = RecordType {
            id: 1001,
            record_matches: Vec::new(),
            fields: vec![field(42, "id", false, vec![cfg])],
            record_validations: Vec::new(),
            upload: None,
            success_check: None,
        };
        let field_validations = rt.fields.iter().map(|f| (f.name.as_str(), f.validations.as_slice())).collect();
        let rtv = RecordTypeValidation { rt: &rt, field_validations };
        let mut parsed = BTreeMap::new();
        parsed.insert("id".to_string(), "".to_string());
        let outcome = validate_record(&registry(), &rtv, &parsed);
        assert_eq!(outcome.validated_fields.get("id").unwrap(), "");
        assert_eq!(outcome.errors.len(), 1);
    }

    #[test]
    fn ephemeral_fields_are_dropped_from_validated_fields() {
        let rt = RecordType {
            id: 1001,
            record_matches: Vec::new(),
            fields: vec![field(1, "scratch", true, Vec::new())],
            record_validations: Vec::new(),
            upload: None,
            success_check: None,
        };
        let field_validations = rt.fields.iter().map(|f| (f.name.as_str(), f.validations.as_slice())).collect();
        let rtv = RecordTypeValidation { rt: &rt, field_validations };
        let mut parsed = BTreeMap::new();
        parsed.insert("scratch".to_string(), "x".to_string());
        let outcome = validate_record(&registry(), &rtv, &parsed);
        assert!(outcome.validated_fields.is_empty());
    }

    #[test]
    fn integer_coercion_round_trips_canonical_form() {
        assert_eq!(coerce_output("007", FunctionDatatype::Integer).unwrap(), "7");
        assert!(coerce_output("abc", FunctionDatatype::Integer).is_err());
    }

    #[test]
    fn boolean_coercion_is_case_insensitive() {
        assert_eq!(coerce_output("True", FunctionDatatype::Boolean).unwrap(), "true");
        assert_eq!(coerce_output("nope", FunctionDatatype::Boolean).unwrap(), "false");
    }
}
