//! Top-level error type for task entrypoints.
//!
//! Layers the infrastructure-level [`DbError`](crate::db::DbError) (pool
//! exhaustion, bad connection string — never reaches a `File`/`Record`
//! document) underneath the domain [`PipelineError`] taxonomy (spec §7.1).
//! A task entrypoint (§1.1/§13) returns this type; the queue adapter decides
//! whether an infrastructure error should be left for at-least-once
//! redelivery.

use inflow_common::PipelineError;
use thiserror::Error;

use crate::db::DbError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("infrastructure error: {0}")]
    Infrastructure(#[from] DbError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;
