//! Step-stat bookkeeping shared by every stage.
//!
//! A step stat lives at `File.stats.steps[key]`, where `key` joins the
//! stage's prefix with whatever record-type/field/function-config ids the
//! call site supplies (`"VALIDATE:1001:42:7"`). Each observed outcome
//! increments `input`, then exactly one of `success`/`failure`.

use inflow_common::types::{FileStats, FileTimes, StepStat};

/// One of the five processing stages, identified by its step-stat prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Parse,
    Validate,
    Upload,
    Report,
}

impl Stage {
    pub fn prefix(&self) -> &'static str {
        match self {
            Stage::Load => "LOAD",
            Stage::Parse => "PARSE",
            Stage::Validate => "VALIDATE",
            Stage::Upload => "UPLOAD",
            Stage::Report => "REPORT",
        }
    }
}

/// Build a step-stat key from a stage and zero or more qualifying ids.
pub fn step_key(stage: Stage, parts: &[&str]) -> String {
    if parts.is_empty() {
        stage.prefix().to_string()
    } else {
        format!("{}:{}", stage.prefix(), parts.join(":"))
    }
}

/// Record one observed outcome against a step-stat counter, creating it on
/// first use.
pub fn record_outcome(stats: &mut FileStats, key: &str, success: bool) {
    let step = stats.steps.entry(key.to_string()).or_insert_with(StepStat::default);
    step.input += 1;
    if success {
        step.success += 1;
    } else {
        step.failure += 1;
    }
}

/// Cascade table: re-running a stage invalidates every downstream stage's
/// counters and timings, since their inputs are about to be rebuilt.
fn cascade(from: Stage) -> &'static [Stage] {
    match from {
        Stage::Load => &[Stage::Load, Stage::Parse, Stage::Validate, Stage::Upload],
        Stage::Parse => &[Stage::Parse, Stage::Validate, Stage::Upload],
        Stage::Validate => &[Stage::Validate, Stage::Upload],
        Stage::Upload => &[Stage::Upload],
        Stage::Report => &[],
    }
}

/// Clear all step counters, timings, and aggregate totals for `from` and
/// every stage downstream of it, ahead of re-running `from`.
pub fn clear_stats(stats: &mut FileStats, times: &mut FileTimes, from: Stage) {
    let cleared = cascade(from);
    let prefixes: Vec<&str> = cleared.iter().map(|s| s.prefix()).collect();
    stats
        .steps
        .retain(|key, _| !prefixes.iter().any(|p| key == p || key.starts_with(&format!("{p}:"))));

    for stage in cleared {
        match stage {
            Stage::Load => {
                stats.total_rows = 0;
                stats.loaded_records_success = 0;
                stats.loaded_records_error = 0;
                times.loading_start = None;
                times.loading_end = None;
            },
            Stage::Parse => {
                stats.parsed_records_success = 0;
                stats.parsed_records_error = 0;
                times.parsing_start = None;
                times.parsing_end = None;
            },
            Stage::Validate => {
                stats.validated_records_success = 0;
                stats.validated_records_error = 0;
                times.validating_start = None;
                times.validating_end = None;
            },
            Stage::Upload => {
                stats.uploaded_records_success = 0;
                stats.uploaded_records_error = 0;
                times.uploading_start = None;
                times.uploading_end = None;
            },
            Stage::Report => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_key_joins_parts_with_colon() {
        assert_eq!(step_key(Stage::Validate, &["1001", "42", "7"]), "VALIDATE:1001:42:7");
        assert_eq!(step_key(Stage::Load, &[]), "LOAD");
    }

    #[test]
    fn record_outcome_increments_input_and_one_bucket() {
        let mut stats = FileStats::default();
        record_outcome(&mut stats, "VALIDATE:1001", true);
        record_outcome(&mut stats, "VALIDATE:1001", false);
        let step = &stats.steps["VALIDATE:1001"];
        assert_eq!(step.input, 2);
        assert_eq!(step.success, 1);
        assert_eq!(step.failure, 1);
    }

    #[test]
    fn clearing_parse_cascades_into_validate_and_upload_but_not_load() {
        let mut stats = FileStats::default();
        let mut times = FileTimes::default();
        stats.loaded_records_success = 5;
        stats.parsed_records_success = 3;
        stats.validated_records_success = 2;
        stats.uploaded_records_success = 1;
        record_outcome(&mut stats, "LOAD", true);
        record_outcome(&mut stats, "PARSE", true);
        record_outcome(&mut stats, "VALIDATE:1001", true);
        record_outcome(&mut stats, "UPLOAD", true);

        clear_stats(&mut stats, &mut times, Stage::Parse);

        assert_eq!(stats.loaded_records_success, 5);
        assert_eq!(stats.parsed_records_success, 0);
        assert_eq!(stats.validated_records_success, 0);
        assert_eq!(stats.uploaded_records_success, 0);
        assert!(stats.steps.contains_key("LOAD"));
        assert!(!stats.steps.contains_key("PARSE"));
        assert!(!stats.steps.contains_key("VALIDATE:1001"));
        assert!(!stats.steps.contains_key("UPLOAD"));
    }
}
