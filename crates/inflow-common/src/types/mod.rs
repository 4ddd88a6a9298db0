//! Domain entities for the file-ingestion pipeline.
//!
//! These are plain value types. Stages never mutate a `FileDoc`/`RecordDoc`
//! in place and diff it later; instead each stage builds an [`UpdateBuilder`]
//! describing exactly which field paths to `$set`/`$unset`/`$addToSet`,
//! and the document-store adapter applies it.

pub mod update;

pub use update::UpdateBuilder;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Checksum algorithm used for on-disk file integrity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

// ============================================================================
// Administrative entities (Partner / FileType / RecordType / FieldType)
// ============================================================================

/// Tenant that owns incoming files. Immutable from the pipeline's view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partner {
    pub id: i64,
    pub display_name: String,
    pub active: bool,
    pub tags: BTreeMap<String, String>,
    pub file_type_ids: Vec<i64>,
    pub outgoing_directory: String,
}

/// Review-required policy controlling whether Upload needs manual approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewRequiredPolicy {
    Never,
    OnErrors,
    Always,
}

/// Separator/layout description for one kind of incoming file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileLayout {
    Delimited { separator: u8, has_header: bool },
    FixedWidth,
}

/// One output report a file-type can produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub run_automatic: bool,
    /// Path template: root is `${FILES}/${partner.outgoing_directory}/${rendered}`.
    pub path_template: String,
    pub duplicate_input_fields: bool,
    pub include_recent_errors: bool,
    pub write_header: bool,
    /// Restrict to records in these statuses; empty means no restriction.
    pub record_statuses: Vec<RecordStatus>,
    /// Restrict to records with a recent error from one of these function configs.
    pub failed_function_configs: Vec<i64>,
}

/// Schema and behavior for one kind of incoming file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileType {
    pub id: i64,
    /// Filename-matching regex patterns.
    pub filename_patterns: Vec<String>,
    pub layout: FileLayout,
    pub record_types: Vec<RecordType>,
    pub upload_batch_group_key: Option<String>,
    pub upload_batch_size: usize,
    pub require_upload_review: ReviewRequiredPolicy,
    pub outputs: Vec<OutputConfig>,
}

impl FileType {
    pub fn has_header(&self) -> bool {
        matches!(self.layout, FileLayout::Delimited { has_header: true, .. })
    }

    pub fn delimited_separator(&self) -> Option<u8> {
        match self.layout {
            FileLayout::Delimited { separator, .. } => Some(separator),
            FileLayout::FixedWidth => None,
        }
    }

    pub fn record_type(&self, id: i64) -> Option<&RecordType> {
        self.record_types.iter().find(|rt| rt.id == id)
    }
}

/// Binding of a [`Function`] to a `FieldType`/`RecordType`, with parameter
/// values encoded as strings in the function's declared parameter order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub id: i64,
    pub function_id: String,
    pub parameter_values: Vec<String>,
}

/// Schema for one row kind; selected by regex against the raw line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordType {
    pub id: i64,
    pub record_matches: Vec<String>,
    pub fields: Vec<FieldType>,
    pub record_validations: Vec<FunctionConfig>,
    pub upload: Option<UploadConfig>,
    pub success_check: Option<FunctionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub function_id: String,
}

/// One named field within a `RecordType`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldType {
    pub id: i64,
    pub name: String,
    pub position: FieldPosition,
    pub active: bool,
    pub validations: Vec<FunctionConfig>,
    pub is_shared_key: bool,
    pub output_datatype: FunctionDatatype,
    /// Dropped from `validatedFields` after coercion.
    pub output_ephemeral: bool,
}

/// How a field's raw value is located within a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldPosition {
    HeaderColumn { name: String },
    ColumnIndex { index: usize },
    /// 1-based inclusive character range.
    CharRange { start: usize, end: usize },
}

/// Kind of a registered [`Function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionKind {
    FieldValidation,
    RecordValidation,
    RecordUpload,
    RecordUploadBatch,
}

/// Where a function's logic lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FunctionSource {
    Native { symbol: String },
    Sql { statement: String },
}

/// Parameter/output datatype for function parameters and field coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionDatatype {
    String,
    Integer,
    Float,
    Boolean,
    Enum,
    Dict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionParameter {
    pub name: String,
    pub datatype: FunctionDatatype,
    /// Declared values for `Enum` datatype, uppercased.
    pub enum_values: Vec<String>,
}

/// Reusable callable registered with the Function Registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub kind: FunctionKind,
    pub source: FunctionSource,
    pub parameters: Vec<FunctionParameter>,
    pub fields_in: Vec<String>,
    pub fields_out: Vec<String>,
    pub deprecated: bool,
}

// ============================================================================
// File & Record statuses
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    New,
    Loading,
    Loaded,
    LoadError,
    Parsing,
    Parsed,
    ParseError,
    Validating,
    Validated,
    ValidateError,
    WaitingApprovalToUpload,
    ApprovedToUpload,
    Uploading,
    Uploaded,
    UploadError,
    UploadingRetryPause,
    Reporting,
    ReportError,
    Completed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::New => "NEW",
            FileStatus::Loading => "LOADING",
            FileStatus::Loaded => "LOADED",
            FileStatus::LoadError => "LOAD_ERROR",
            FileStatus::Parsing => "PARSING",
            FileStatus::Parsed => "PARSED",
            FileStatus::ParseError => "PARSE_ERROR",
            FileStatus::Validating => "VALIDATING",
            FileStatus::Validated => "VALIDATED",
            FileStatus::ValidateError => "VALIDATE_ERROR",
            FileStatus::WaitingApprovalToUpload => "WAITING_APPROVAL_TO_UPLOAD",
            FileStatus::ApprovedToUpload => "APPROVED_TO_UPLOAD",
            FileStatus::Uploading => "UPLOADING",
            FileStatus::Uploaded => "UPLOADED",
            FileStatus::UploadError => "UPLOAD_ERROR",
            FileStatus::UploadingRetryPause => "UPLOADING_RETRY_PAUSE",
            FileStatus::Reporting => "REPORTING",
            FileStatus::ReportError => "REPORT_ERROR",
            FileStatus::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "NEW" => FileStatus::New,
            "LOADING" => FileStatus::Loading,
            "LOADED" => FileStatus::Loaded,
            "LOAD_ERROR" => FileStatus::LoadError,
            "PARSING" => FileStatus::Parsing,
            "PARSED" => FileStatus::Parsed,
            "PARSE_ERROR" => FileStatus::ParseError,
            "VALIDATING" => FileStatus::Validating,
            "VALIDATED" => FileStatus::Validated,
            "VALIDATE_ERROR" => FileStatus::ValidateError,
            "WAITING_APPROVAL_TO_UPLOAD" => FileStatus::WaitingApprovalToUpload,
            "APPROVED_TO_UPLOAD" => FileStatus::ApprovedToUpload,
            "UPLOADING" => FileStatus::Uploading,
            "UPLOADED" => FileStatus::Uploaded,
            "UPLOAD_ERROR" => FileStatus::UploadError,
            "UPLOADING_RETRY_PAUSE" => FileStatus::UploadingRetryPause,
            "REPORTING" => FileStatus::Reporting,
            "REPORT_ERROR" => FileStatus::ReportError,
            "COMPLETED" => FileStatus::Completed,
            other => return Err(format!("unknown file status: {other}")),
        })
    }
}

/// Record statuses, ordered from least to most advanced:
/// `LOAD_ERROR < LOADED < PARSE_ERROR < PARSED < VALIDATION_ERROR < VALIDATED < UPLOAD_ERROR < UPLOADED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    LoadError,
    Loaded,
    ParseError,
    Parsed,
    ValidationError,
    Validated,
    UploadError,
    Uploaded,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::LoadError => "LOAD_ERROR",
            RecordStatus::Loaded => "LOADED",
            RecordStatus::ParseError => "PARSE_ERROR",
            RecordStatus::Parsed => "PARSED",
            RecordStatus::ValidationError => "VALIDATION_ERROR",
            RecordStatus::Validated => "VALIDATED",
            RecordStatus::UploadError => "UPLOAD_ERROR",
            RecordStatus::Uploaded => "UPLOADED",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "LOAD_ERROR" => RecordStatus::LoadError,
            "LOADED" => RecordStatus::Loaded,
            "PARSE_ERROR" => RecordStatus::ParseError,
            "PARSED" => RecordStatus::Parsed,
            "VALIDATION_ERROR" => RecordStatus::ValidationError,
            "VALIDATED" => RecordStatus::Validated,
            "UPLOAD_ERROR" => RecordStatus::UploadError,
            "UPLOADED" => RecordStatus::Uploaded,
            other => return Err(format!("unknown record status: {other}")),
        })
    }
}

/// Marker `recordType` value for the one synthetic header row per file.
pub const HEADER_RECORD_TYPE: i64 = -1;

// ============================================================================
// Logs
// ============================================================================

/// One append-only (`log`) or replace-on-stage (`recentErrors`) entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLog {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub is_error: bool,
    pub message: String,
    pub error_code: Option<String>,
    pub function_config_id: Option<i64>,
    pub stack_trace: Option<String>,
}

// ============================================================================
// Files & Records
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepStat {
    pub input: i64,
    pub success: i64,
    pub failure: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileStats {
    pub total_rows: i64,
    pub loaded_records_success: i64,
    pub loaded_records_error: i64,
    pub parsed_records_success: i64,
    pub parsed_records_error: i64,
    pub validated_records_success: i64,
    pub validated_records_error: i64,
    pub uploaded_records_success: i64,
    pub uploaded_records_error: i64,
    pub reported_records_success: i64,
    pub reported_records_error: i64,
    /// Keyed by `stagePrefix[:recordTypeId[:fieldId[:functionConfigId]]]`.
    pub steps: BTreeMap<String, StepStat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileTimes {
    pub loading_start: Option<DateTime<Utc>>,
    pub loading_end: Option<DateTime<Utc>>,
    pub parsing_start: Option<DateTime<Utc>>,
    pub parsing_end: Option<DateTime<Utc>>,
    pub validating_start: Option<DateTime<Utc>>,
    pub validating_end: Option<DateTime<Utc>>,
    pub uploading_start: Option<DateTime<Utc>>,
    pub uploading_end: Option<DateTime<Utc>>,
    pub reporting_start: Option<DateTime<Utc>>,
    pub reporting_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputInstanceStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// Ephemeral id + timing for one run of one `OutputConfig` against a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputInstance {
    pub instance_id: String,
    pub output_id: i64,
    pub status: OutputInstanceStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub output_filename: Option<String>,
}

/// One ingested file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDoc {
    pub id: i64,
    pub partner_id: i64,
    pub file_type_id: i64,
    pub source_name: String,
    pub location: String,
    pub size_bytes: i64,
    pub content_hash: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub status: FileStatus,
    pub header_columns: Vec<String>,
    pub parsed_columns: Vec<String>,
    pub validated_columns: Vec<String>,
    pub stats: FileStats,
    pub times: FileTimes,
    pub log: Vec<ProcessingLog>,
    pub recent_errors: Vec<ProcessingLog>,
    pub outputs: Vec<OutputInstance>,
    /// Set when `status == UPLOADING_RETRY_PAUSE`; the catch-up scan leaves
    /// the file alone until this time has passed (§9c's fixed 15-minute
    /// pause before a retriable upload batch is retried).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_resume_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileDoc {
    /// Canonical `_id` range for this file's records: `[id<<32, (id<<32)+2^32-1]`.
    pub fn record_id_range(&self) -> (i64, i64) {
        record_id_range(self.id)
    }
}

/// Canonical record-range filter bounds.
pub fn record_id_range(file_id: i64) -> (i64, i64) {
    let base = file_id << 32;
    (base, base + 0xFFFF_FFFFi64)
}

pub fn record_id(file_id: i64, line_number: i64) -> i64 {
    (file_id << 32) | (line_number & 0xFFFF_FFFF)
}

pub fn line_number_of(record_id: i64) -> i64 {
    record_id & 0xFFFF_FFFF
}

pub fn file_id_of(record_id: i64) -> i64 {
    record_id >> 32
}

/// One row of one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordDoc {
    pub id: i64,
    pub file_id: i64,
    pub raw_line: Option<String>,
    pub raw_columns: Option<Vec<String>>,
    pub hash: String,
    /// `RecordType` id, or `HEADER_RECORD_TYPE` for the synthetic header row.
    pub record_type: i64,
    pub status: RecordStatus,
    pub parsed_fields: BTreeMap<String, String>,
    pub validated_fields: BTreeMap<String, String>,
    pub shared_key: Option<String>,
    pub upload_confirmation_id: Option<String>,
    pub auto_retry: bool,
    pub retry_count: i32,
    pub log: Vec<ProcessingLog>,
    pub recent_errors: Vec<ProcessingLog>,
}

impl RecordDoc {
    pub fn line_number(&self) -> i64 {
        line_number_of(self.id)
    }

    pub fn is_header(&self) -> bool {
        self.record_type == HEADER_RECORD_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_roundtrips_file_and_line() {
        let id = record_id(42, 7);
        assert_eq!(file_id_of(id), 42);
        assert_eq!(line_number_of(id), 7);
    }

    #[test]
    fn record_id_range_is_contiguous_32_bits() {
        let (lo, hi) = record_id_range(3);
        assert_eq!(lo, 3i64 << 32);
        assert_eq!(hi - lo, 0xFFFF_FFFF);
    }

    #[test]
    fn record_status_ordering_matches_spec() {
        assert!(RecordStatus::LoadError < RecordStatus::Loaded);
        assert!(RecordStatus::Loaded < RecordStatus::ParseError);
        assert!(RecordStatus::ParseError < RecordStatus::Parsed);
        assert!(RecordStatus::Parsed < RecordStatus::ValidationError);
        assert!(RecordStatus::ValidationError < RecordStatus::Validated);
        assert!(RecordStatus::Validated < RecordStatus::UploadError);
        assert!(RecordStatus::UploadError < RecordStatus::Uploaded);
    }

    #[test]
    fn file_status_round_trips_through_str() {
        for s in ["NEW", "LOADING", "UPLOADING_RETRY_PAUSE", "COMPLETED"] {
            let parsed: FileStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
    }
}
