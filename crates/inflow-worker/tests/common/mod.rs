//! Test utilities for inflow-worker integration tests using testcontainers.
//!
//! Spins up a disposable Postgres container, runs the workspace migrations
//! against it, and exposes a `Store` plus raw-insert helpers for the
//! administrative entities (`partners`/`file_types`/`functions`) this
//! pipeline reads but never writes itself (§1: the admin cache is an
//! out-of-scope external collaborator, so tests seed it directly).

use anyhow::{Context, Result};
use inflow_common::types::{FileDoc, Function, Partner};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;

pub struct TestPostgres {
    #[allow(dead_code)]
    container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default().start().await.context("failed to start postgres container")?;
        let host = container.get_host().await.context("failed to get container host")?;
        let port = container.get_host_port_ipv4(5432.tcp()).await.context("failed to get container port")?;
        let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await
            .context("failed to connect to postgres container")?;

        sqlx::migrate!("../../migrations").run(&pool).await.context("failed to run migrations")?;

        Ok(Self { container, pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn store(&self) -> inflow_worker::db::Store {
        inflow_worker::db::Store::new(self.pool.clone())
    }

    pub async fn seed_partner(&self, partner: &Partner) -> Result<()> {
        let doc = serde_json::to_value(partner)?;
        sqlx::query("INSERT INTO partners (id, doc) VALUES ($1, $2)")
            .bind(partner.id)
            .bind(doc)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn seed_file_type(&self, file_type: &inflow_common::types::FileType) -> Result<()> {
        let doc = serde_json::to_value(file_type)?;
        sqlx::query("INSERT INTO file_types (id, doc) VALUES ($1, $2)")
            .bind(file_type.id)
            .bind(doc)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn seed_function(&self, function: &Function) -> Result<()> {
        let doc = serde_json::to_value(function)?;
        sqlx::query("INSERT INTO functions (id, doc) VALUES ($1, $2)")
            .bind(&function.id)
            .bind(doc)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn seed_file(&self, file: &FileDoc) -> Result<()> {
        self.store().insert_file(file).await.context("failed to insert file")?;
        Ok(())
    }
}

pub fn blank_file(id: i64, partner_id: i64, file_type_id: i64, location: String) -> FileDoc {
    use inflow_common::types::{FileStats, FileStatus, FileTimes};
    use std::collections::BTreeMap;

    FileDoc {
        id,
        partner_id,
        file_type_id,
        source_name: location.rsplit('/').next().unwrap_or(&location).to_string(),
        location,
        size_bytes: 0,
        content_hash: None,
        tags: BTreeMap::new(),
        status: FileStatus::New,
        header_columns: Vec::new(),
        parsed_columns: Vec::new(),
        validated_columns: Vec::new(),
        stats: FileStats::default(),
        times: FileTimes::default(),
        log: Vec::new(),
        recent_errors: Vec::new(),
        outputs: Vec::new(),
        retry_resume_at: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}
