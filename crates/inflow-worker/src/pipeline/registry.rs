//! Function Registry & Dispatcher.
//!
//! Maps a [`Function`] id to a typed handler variant and invokes it with
//! parameters coerced from their string-encoded [`FunctionConfig`] values
//! per the function's declared parameter datatypes. The concrete set of
//! built-in validator/uploader symbols is an operational concern of the
//! deployment, not of the dispatcher itself; [`NativeRegistry::builtin`]
//! registers a small illustrative set exercised by the stage tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use inflow_common::types::{Function, FunctionConfig, FunctionDatatype, FunctionSource};
use inflow_common::types::RecordDoc;
use inflow_common::{ErrorCode, PipelineError, Result};
use serde_json::Value;
use sqlx::PgPool;

/// One coerced parameter value, ready to hand to a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum CoercedValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Enum(String),
    Dict(Value),
}

impl CoercedValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CoercedValue::Str(s) | CoercedValue::Enum(s) => Some(s),
            _ => None,
        }
    }
}

/// Coerce one raw string parameter per its declared datatype.
pub fn coerce_param(raw: &str, datatype: FunctionDatatype, enum_values: &[String]) -> Result<CoercedValue> {
    Ok(match datatype {
        FunctionDatatype::String => CoercedValue::Str(raw.to_string()),
        FunctionDatatype::Integer => CoercedValue::Int(raw.parse::<i64>().map_err(|e| {
            PipelineError::configuration_coded(
                ErrorCode::OtherConfigurationError,
                format!("parameter '{raw}' is not a valid integer: {e}"),
            )
        })?),
        FunctionDatatype::Float => CoercedValue::Float(raw.parse::<f64>().map_err(|e| {
            PipelineError::configuration_coded(
                ErrorCode::OtherConfigurationError,
                format!("parameter '{raw}' is not a valid float: {e}"),
            )
        })?),
        FunctionDatatype::Boolean => CoercedValue::Bool(raw.to_ascii_uppercase() == "TRUE"),
        FunctionDatatype::Enum => {
            let upper = raw.to_ascii_uppercase();
            let matched = enum_values.iter().find(|v| v.eq_ignore_ascii_case(&upper)).ok_or_else(|| {
                PipelineError::configuration_coded(
                    ErrorCode::OtherConfigurationError,
                    format!("'{raw}' is not one of the declared enum values {enum_values:?}"),
                )
            })?;
            CoercedValue::Enum(matched.clone())
        },
        FunctionDatatype::Dict => {
            let parsed: Value = serde_json::from_str(raw).map_err(|e| {
                PipelineError::configuration_coded(
                    ErrorCode::OtherConfigurationError,
                    format!("parameter is not valid JSON: {e}"),
                )
            })?;
            CoercedValue::Dict(parsed)
        },
    })
}

fn coerce_params(function: &Function, config: &FunctionConfig) -> Result<Vec<CoercedValue>> {
    if config.parameter_values.len() != function.parameters.len() {
        return Err(PipelineError::configuration_coded(
            ErrorCode::OtherConfigurationError,
            format!(
                "function '{}' expects {} parameters, config '{}' supplied {}",
                function.id,
                function.parameters.len(),
                config.id,
                config.parameter_values.len()
            ),
        ));
    }
    function
        .parameters
        .iter()
        .zip(config.parameter_values.iter())
        .map(|(param, raw)| coerce_param(raw, param.datatype, &param.enum_values))
        .collect()
}

pub type FieldFn = fn(&str, &[CoercedValue]) -> Result<String>;
pub type RecordFn = fn(&BTreeMap<String, String>, &[CoercedValue]) -> Result<Option<BTreeMap<String, String>>>;

#[async_trait]
pub trait UploadFn: Send + Sync {
    async fn call(&self, record: &RecordDoc, params: &[CoercedValue]) -> Result<Option<String>>;
}

#[async_trait]
pub trait UploadBatchFn: Send + Sync {
    async fn call(&self, records: &[RecordDoc], params: &[CoercedValue]) -> Result<Option<String>>;
}

/// Native (in-process) handler table, keyed by the symbol name in
/// `FunctionSource::Native`.
#[derive(Clone, Default)]
pub struct NativeRegistry {
    field_fns: HashMap<String, FieldFn>,
    record_fns: HashMap<String, RecordFn>,
    upload_fns: HashMap<String, Arc<dyn UploadFn>>,
    upload_batch_fns: HashMap<String, Arc<dyn UploadBatchFn>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_field_fn(&mut self, symbol: impl Into<String>, f: FieldFn) -> &mut Self {
        self.field_fns.insert(symbol.into(), f);
        self
    }

    pub fn register_record_fn(&mut self, symbol: impl Into<String>, f: RecordFn) -> &mut Self {
        self.record_fns.insert(symbol.into(), f);
        self
    }

    pub fn register_upload_fn(&mut self, symbol: impl Into<String>, f: Arc<dyn UploadFn>) -> &mut Self {
        self.upload_fns.insert(symbol.into(), f);
        self
    }

    pub fn register_upload_batch_fn(
        &mut self,
        symbol: impl Into<String>,
        f: Arc<dyn UploadBatchFn>,
    ) -> &mut Self {
        self.upload_batch_fns.insert(symbol.into(), f);
        self
    }

    /// A small set of illustrative field/record validators matching the
    /// scenarios this pipeline is tested against.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_field_fn("notEmpty", not_empty);
        registry.register_field_fn("isHex", is_hex);
        registry.register_field_fn("toUpper", to_upper);
        registry
    }
}

fn not_empty(value: &str, _params: &[CoercedValue]) -> Result<String> {
    if value.is_empty() {
        return Err(PipelineError::validation_coded(
            ErrorCode::OtherValidationError,
            "value must not be empty",
        ));
    }
    Ok(value.to_string())
}

fn is_hex(value: &str, _params: &[CoercedValue]) -> Result<String> {
    if value.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(value.to_string())
    } else {
        Err(PipelineError::validation_coded(ErrorCode::OtherValidationError, format!("'{value}' is not hex")))
    }
}

fn to_upper(value: &str, _params: &[CoercedValue]) -> Result<String> {
    Ok(value.to_ascii_uppercase())
}

/// Looks up registered [`Function`]s and dispatches to their handler,
/// coercing parameters first.
pub struct Registry {
    native: NativeRegistry,
    functions: HashMap<String, Function>,
    pool: PgPool,
}

impl Registry {
    pub fn new(native: NativeRegistry, functions: Vec<Function>, pool: PgPool) -> Self {
        let functions = functions.into_iter().map(|f| (f.id.clone(), f)).collect();
        Self { native, functions, pool }
    }

    pub fn function(&self, id: &str) -> Result<&Function> {
        self.functions.get(id).ok_or_else(|| {
            PipelineError::configuration_coded(
                ErrorCode::OtherConfigurationError,
                format!("no registered function '{id}'"),
            )
        })
    }

    pub fn call_field(&self, function_id: &str, config: &FunctionConfig, value: &str) -> Result<String> {
        let function = self.function(function_id)?;
        let params = coerce_params(function, config)?;
        match &function.source {
            FunctionSource::Native { symbol } => {
                let handler = self.native.field_fns.get(symbol).ok_or_else(|| missing_symbol(symbol))?;
                handler(value, &params)
            },
            FunctionSource::Sql { .. } => Err(sql_unsupported(function_id)),
        }
    }

    pub fn call_record(
        &self,
        function_id: &str,
        config: &FunctionConfig,
        fields: &BTreeMap<String, String>,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let function = self.function(function_id)?;
        let params = coerce_params(function, config)?;
        match &function.source {
            FunctionSource::Native { symbol } => {
                let handler = self.native.record_fns.get(symbol).ok_or_else(|| missing_symbol(symbol))?;
                handler(fields, &params)
            },
            FunctionSource::Sql { .. } => Err(sql_unsupported(function_id)),
        }
    }

    pub async fn call_upload(
        &self,
        function_id: &str,
        config: &FunctionConfig,
        record: &RecordDoc,
    ) -> Result<Option<String>> {
        let function = self.function(function_id)?;
        let params = coerce_params(function, config)?;
        match &function.source {
            FunctionSource::Native { symbol } => {
                let handler = self.native.upload_fns.get(symbol).ok_or_else(|| missing_symbol(symbol))?;
                handler.call(record, &params).await
            },
            FunctionSource::Sql { .. } => Err(sql_unsupported(function_id)),
        }
    }

    pub async fn call_upload_batch(
        &self,
        function_id: &str,
        config: &FunctionConfig,
        records: &[RecordDoc],
    ) -> Result<Option<String>> {
        let function = self.function(function_id)?;
        let params = coerce_params(function, config)?;
        match &function.source {
            FunctionSource::Native { symbol } => {
                let handler =
                    self.native.upload_batch_fns.get(symbol).ok_or_else(|| missing_symbol(symbol))?;
                handler.call(records, &params).await
            },
            FunctionSource::Sql { .. } => Err(sql_unsupported(function_id)),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn missing_symbol(symbol: &str) -> PipelineError {
    PipelineError::configuration_coded(
        ErrorCode::OtherConfigurationError,
        format!("no native handler registered for symbol '{symbol}'"),
    )
}

fn sql_unsupported(function_id: &str) -> PipelineError {
    PipelineError::configuration_coded(
        ErrorCode::OtherConfigurationError,
        format!("function '{function_id}' declares a sql source; sql dispatch is not wired in this deployment"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_integer_float_boolean() {
        assert_eq!(
            coerce_param("3", FunctionDatatype::Integer, &[]).unwrap(),
            CoercedValue::Int(3)
        );
        assert_eq!(
            coerce_param("2.5", FunctionDatatype::Float, &[]).unwrap(),
            CoercedValue::Float(2.5)
        );
        for truthy in ["true", "TRUE", "True"] {
            assert_eq!(
                coerce_param(truthy, FunctionDatatype::Boolean, &[]).unwrap(),
                CoercedValue::Bool(true)
            );
        }
        assert_eq!(
            coerce_param("nope", FunctionDatatype::Boolean, &[]).unwrap(),
            CoercedValue::Bool(false)
        );
    }

    #[test]
    fn coerce_enum_matches_case_insensitively() {
        let enum_values = vec!["RED".to_string(), "BLUE".to_string()];
        let coerced = coerce_param("red", FunctionDatatype::Enum, &enum_values).unwrap();
        assert_eq!(coerced, CoercedValue::Enum("RED".to_string()));
    }

    #[test]
    fn coerce_enum_rejects_unknown_value() {
        let enum_values = vec!["RED".to_string()];
        assert!(coerce_param("green", FunctionDatatype::Enum, &enum_values).is_err());
    }

    #[test]
    fn not_empty_rejects_blank_value() {
        assert!(not_empty("", &[]).is_err());
        assert_eq!(not_empty("x", &[]).unwrap(), "x");
    }

    #[test]
    fn is_hex_accepts_only_hex_digits() {
        assert!(is_hex("deadBEEF0", &[]).is_ok());
        assert!(is_hex("not-hex", &[]).is_err());
    }
}
