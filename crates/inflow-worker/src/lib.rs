//! Worker library for the partner file-ingestion pipeline.
#![recursion_limit = "256"]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::manual_div_ceil)]
#![allow(clippy::redundant_closure)]
#![allow(clippy::manual_range_contains)]
#![allow(clippy::unnecessary_map_or)]
#![allow(clippy::useless_format)]
#![allow(clippy::should_implement_trait)]
#![allow(clippy::new_without_default)]
#![allow(clippy::impl_trait_in_params)]
#![allow(clippy::unnecessary_lazy_evaluations)]
#![allow(clippy::redundant_field_names)]
#![allow(clippy::needless_borrow)]
#![allow(clippy::manual_clamp)]
#![allow(clippy::map_clone)]
#![allow(clippy::option_map_or_none)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::get_first)]
#![allow(clippy::host_endian_bytes)]
#![allow(clippy::io_other_error)]
#![allow(clippy::type_complexity)]
//!
//! Ingests partner files through five stages — Load, Parse, Validate,
//! Upload, Report — each driven off a `File`/`Record` status stored as a
//! JSONB document in Postgres (see [`db::store::Store`]). An in-process
//! [`orchestrator::Orchestrator`] dispatches stage work and recovers it
//! after a restart by re-scanning persisted status; see DESIGN.md for why
//! that replaces a broker-backed task queue.
//!
//! See `main.rs` for how `config`, `db` and `orchestrator` are wired
//! together into the worker binary.

pub mod config;
pub mod db;
pub mod error;
pub mod orchestrator;
pub mod pipeline;

pub use error::{WorkerError, WorkerResult};
