//! Inflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared domain types, error taxonomy, and utilities for the Inflow
//! ingestion pipeline workspace.
//!
//! # Overview
//!
//! - **Domain model** ([`types`]): `Partner`, `FileType`, `RecordType`,
//!   `FieldType`, `Function`, `FileDoc`, `RecordDoc`, and the tracked-update
//!   builder used by every pipeline stage.
//! - **Error taxonomy** ([`error`]): the three domain error kinds
//!   (`ConfigurationError`, `ValidationError`, `ExecutionError`) every stage
//!   raises.
//! - **Checksums** ([`checksum`]): file-level integrity verification.
//! - **Logging** ([`logging`]): structured `tracing` setup shared by the
//!   worker binary.

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{ErrorCode, PipelineError, Result};
