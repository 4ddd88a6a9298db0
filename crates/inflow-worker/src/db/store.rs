//! Postgres/JSONB-backed implementation of the document-store interface.
//!
//! Each logical collection (`files`, `records`, `counters`, `partners`,
//! `functions`, `copylog`, `apilog`) is one table: an indexed integer/text id
//! plus whatever columns the engine needs for range scans and status
//! filters, and a `doc` JSONB column holding the rest of the entity. A
//! whole `FileDoc`/`RecordDoc` round-trips through `doc` via `serde_json`;
//! the indexed columns (`status`, `status_rank`, `file_id`, `hash`, …) are
//! kept in sync on every write so SQL can filter without reaching into
//! JSONB.
//!
//! Partial updates ($set/$unset/$addToSet) are resolved by fetching the
//! current document, applying the [`UpdateBuilder`] in memory, and writing
//! the merged document back whole inside one transaction. This keeps the
//! merge logic in one place instead of compiling dynamic `jsonb_set` paths
//! per call, at the cost of a read before every write — acceptable here
//! since the status CAS already guarantees only one writer per file.

use inflow_common::types::{
    FileDoc, FileStatus, FileType, Function, OutputInstance, Partner, ProcessingLog, RecordDoc, RecordStatus,
    StepStat, UpdateBuilder,
};
use serde_json::Value;
use sqlx::{PgPool, Row};

use super::{DbError, DbResult};

/// How a chunk fetch filters on `Record.status`.
#[derive(Debug, Clone, Copy)]
pub enum RecordStatusFilter {
    /// `status == s`.
    Eq(RecordStatus),
    /// `status >= s`, using declaration order (`LOAD_ERROR < LOADED < …`).
    Gte(RecordStatus),
}

fn status_rank(status: RecordStatus) -> i16 {
    status as i16
}

/// Handle onto the document store, backed by one connection pool.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // counters
    // ------------------------------------------------------------------

    /// Atomically allocate the next value of a named monotonic counter.
    pub async fn next_id(&self, counter: &str) -> DbResult<i64> {
        let row = sqlx::query(
            "INSERT INTO counters (id, value) VALUES ($1, 1) \
             ON CONFLICT (id) DO UPDATE SET value = counters.value + 1 \
             RETURNING value",
        )
        .bind(counter)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("value")?)
    }

    // ------------------------------------------------------------------
    // files
    // ------------------------------------------------------------------

    pub async fn insert_file(&self, file: &FileDoc) -> DbResult<()> {
        let doc = serde_json::to_value(file).map_err(|e| DbError::config(e.to_string()))?;
        sqlx::query(
            "INSERT INTO files (id, partner_id, file_type_id, status, doc, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(file.id)
        .bind(file.partner_id)
        .bind(file.file_type_id)
        .bind(file.status.as_str())
        .bind(doc)
        .bind(file.created_at)
        .bind(file.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_file(&self, id: i64) -> DbResult<FileDoc> {
        let row = sqlx::query("SELECT doc FROM files WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("file", &id.to_string()))?;
        decode_doc(row.try_get("doc")?)
    }

    /// List files currently in one of `statuses`, oldest-updated first, for
    /// the orchestrator's post-restart catch-up scan (§5: a cancelled
    /// in-progress stage leaves the file exactly where it was, from which
    /// administrative action -- here, the next scan -- may resume it).
    pub async fn list_files_by_status(&self, statuses: &[FileStatus], limit: i64) -> DbResult<Vec<FileDoc>> {
        let statuses: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(
            "SELECT doc FROM files WHERE status = ANY($1) ORDER BY updated_at ASC LIMIT $2",
        )
        .bind(&statuses)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|r| decode_doc(r.try_get("doc")?)).collect()
    }

    /// Atomically move `File.status` from one of `allowed_from` to `to`.
    ///
    /// Returns `true` if the transition was applied. A caller observing
    /// `false` must not touch any of the file's records.
    pub async fn cas_file_status(
        &self,
        id: i64,
        allowed_from: &[FileStatus],
        to: FileStatus,
    ) -> DbResult<bool> {
        let allowed: Vec<&'static str> = allowed_from.iter().map(|s| s.as_str()).collect();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT doc FROM files WHERE id = $1 AND status = ANY($2) FOR UPDATE")
            .bind(id)
            .bind(&allowed)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let mut doc: Value = row.try_get("doc")?;
        doc["status"] = Value::String(to.as_str().to_string());
        let now = chrono::Utc::now();
        doc["updated_at"] = serde_json::to_value(now).map_err(|e| DbError::config(e.to_string()))?;
        sqlx::query("UPDATE files SET status = $1, doc = $2, updated_at = $3 WHERE id = $4")
            .bind(to.as_str())
            .bind(&doc)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Apply a tracked update against one file's document.
    pub async fn update_file(&self, id: i64, update: &UpdateBuilder) -> DbResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT doc FROM files WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::not_found("file", &id.to_string()))?;
        let mut doc: Value = row.try_get("doc")?;
        apply_update(&mut doc, update);
        let status = doc
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("NEW")
            .to_string();
        sqlx::query("UPDATE files SET status = $1, doc = $2, updated_at = now() WHERE id = $3")
            .bind(&status)
            .bind(&doc)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Apply the Reporter's closing update: replace one `OutputInstance` in
    /// place within `outputs`, append one log entry, replace
    /// `recentErrors`, and set one `stats.steps` entry — all under the same
    /// row lock, so two reporters running concurrently for different
    /// outputs of the same file never clobber each other's `outputs` entry
    /// or step counter. This folds what the spec describes as two separate
    /// bulk-write updates (worked around a positional-array-update
    /// limitation in the source store) into the one whole-document merge
    /// this adapter already uses everywhere else.
    pub async fn apply_report_outcome(
        &self,
        file_id: i64,
        instance: &OutputInstance,
        log: &ProcessingLog,
        recent_errors: &[ProcessingLog],
        step_key: &str,
        step: &StepStat,
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT doc FROM files WHERE id = $1 FOR UPDATE")
            .bind(file_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::not_found("file", &file_id.to_string()))?;
        let mut doc: Value = row.try_get("doc")?;

        let instance_value =
            serde_json::to_value(instance).map_err(|e| DbError::config(e.to_string()))?;
        let outputs = doc
            .get_mut("outputs")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| DbError::config("file document has no outputs array"))?;
        let slot = outputs
            .iter_mut()
            .find(|o| o.get("instance_id").and_then(Value::as_str) == Some(instance.instance_id.as_str()))
            .ok_or_else(|| DbError::not_found("output instance", &instance.instance_id))?;
        *slot = instance_value;

        let log_array = ensure_array(&mut doc, "log");
        let log_value = serde_json::to_value(log).map_err(|e| DbError::config(e.to_string()))?;
        if !log_array.contains(&log_value) {
            log_array.push(log_value);
        }
        set_path(
            &mut doc,
            "recent_errors",
            serde_json::to_value(recent_errors).map_err(|e| DbError::config(e.to_string()))?,
        );
        set_path(
            &mut doc,
            &format!("stats.steps.{step_key}"),
            serde_json::to_value(step).map_err(|e| DbError::config(e.to_string()))?,
        );

        sqlx::query("UPDATE files SET doc = $1, updated_at = now() WHERE id = $2")
            .bind(&doc)
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // records
    // ------------------------------------------------------------------

    /// Delete every record in a file's key range. Used by the Loader before
    /// it re-populates the file from scratch.
    pub async fn delete_records_in_range(&self, file_id: i64) -> DbResult<u64> {
        let (lo, hi) = inflow_common::types::record_id_range(file_id);
        let result = sqlx::query("DELETE FROM records WHERE id BETWEEN $1 AND $2")
            .bind(lo)
            .bind(hi)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Unordered bulk insert. A single bad row does not abort the others;
    /// callers that need that guarantee should pre-validate before calling.
    pub async fn insert_records(&self, records: &[RecordDoc]) -> DbResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            let doc =
                serde_json::to_value(record).map_err(|e| DbError::config(e.to_string()))?;
            sqlx::query(
                "INSERT INTO records (id, file_id, line_num, status, status_rank, hash, doc) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(record.id)
            .bind(record.file_id)
            .bind(record.line_number())
            .bind(record.status.as_str())
            .bind(status_rank(record.status))
            .bind(&record.hash)
            .bind(doc)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Fetch up to `limit` records in a file's range with `id > after_id`,
    /// ordered ascending by id — the cursor the stage base chunks over.
    pub async fn fetch_record_chunk(
        &self,
        file_id: i64,
        status: Option<RecordStatusFilter>,
        after_id: i64,
        limit: i64,
    ) -> DbResult<Vec<RecordDoc>> {
        let (lo, hi) = inflow_common::types::record_id_range(file_id);
        let lo = lo.max(after_id + 1);
        let rows = match status {
            None => {
                sqlx::query("SELECT doc FROM records WHERE id BETWEEN $1 AND $2 ORDER BY id ASC LIMIT $3")
                    .bind(lo)
                    .bind(hi)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            },
            Some(RecordStatusFilter::Eq(s)) => {
                sqlx::query(
                    "SELECT doc FROM records WHERE id BETWEEN $1 AND $2 AND status = $3 \
                     ORDER BY id ASC LIMIT $4",
                )
                .bind(lo)
                .bind(hi)
                .bind(s.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            },
            Some(RecordStatusFilter::Gte(s)) => {
                sqlx::query(
                    "SELECT doc FROM records WHERE id BETWEEN $1 AND $2 AND status_rank >= $3 \
                     ORDER BY id ASC LIMIT $4",
                )
                .bind(lo)
                .bind(hi)
                .bind(status_rank(s))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            },
        };
        rows.into_iter().map(|r| decode_doc(r.try_get("doc")?)).collect()
    }

    /// Fetch a chunk sorted ascending by a `validatedFields` entry instead
    /// of by id — the Uploader's group-key ordering.
    pub async fn fetch_record_chunk_sorted_by_field(
        &self,
        file_id: i64,
        status: RecordStatusFilter,
        field: &str,
        after_id: i64,
        limit: i64,
    ) -> DbResult<Vec<RecordDoc>> {
        if !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') || field.is_empty() {
            return Err(DbError::config(format!("invalid group-key field name: {field}")));
        }
        let (lo, hi) = inflow_common::types::record_id_range(file_id);
        let lo = lo.max(after_id + 1);
        let rank_clause = match status {
            RecordStatusFilter::Eq(s) => ("status = $3", s.as_str().to_string()),
            RecordStatusFilter::Gte(s) => ("status_rank >= $3", status_rank(s).to_string()),
        };
        let sql = format!(
            "SELECT doc FROM records WHERE id BETWEEN $1 AND $2 AND {} \
             ORDER BY doc #>> '{{validated_fields,{field}}}' ASC, id ASC LIMIT $4",
            rank_clause.0
        );
        let rows = sqlx::query(&sql)
            .bind(lo)
            .bind(hi)
            .bind(&rank_clause.1)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|r| decode_doc(r.try_get("doc")?)).collect()
    }

    /// Unordered bulk write of per-record tracked updates.
    pub async fn bulk_update_records(&self, updates: &[(i64, UpdateBuilder)]) -> DbResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (id, update) in updates {
            if update.is_empty() {
                continue;
            }
            let row = sqlx::query("SELECT doc FROM records WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| DbError::not_found("record", &id.to_string()))?;
            let mut doc: Value = row.try_get("doc")?;
            apply_update(&mut doc, update);
            let status = doc
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("LOADED")
                .to_string();
            let rank = status.parse::<RecordStatus>().map(status_rank).unwrap_or(0);
            sqlx::query(
                "UPDATE records SET status = $1, status_rank = $2, doc = $3 WHERE id = $4",
            )
            .bind(&status)
            .bind(rank)
            .bind(&doc)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Same update applied to every id in `ids` — the Uploader's
    /// representative-record fan-out.
    pub async fn bulk_update_records_same(
        &self,
        ids: &[i64],
        update: &UpdateBuilder,
    ) -> DbResult<()> {
        let batch: Vec<(i64, UpdateBuilder)> =
            ids.iter().map(|id| (*id, update.clone())).collect();
        self.bulk_update_records(&batch).await
    }

    /// Hashes already `>= min_status` anywhere in the store (any file),
    /// used by the Uploader's cross-chunk duplicate check.
    pub async fn hashes_at_or_above(
        &self,
        hashes: &[String],
        min_status: RecordStatus,
    ) -> DbResult<std::collections::HashSet<String>> {
        if hashes.is_empty() {
            return Ok(Default::default());
        }
        let rows = sqlx::query(
            "SELECT DISTINCT hash FROM records WHERE hash = ANY($1) AND status_rank >= $2",
        )
        .bind(hashes)
        .bind(status_rank(min_status))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| Ok(r.try_get::<String, _>("hash")?))
            .collect()
    }

    // ------------------------------------------------------------------
    // administrative entity cache (partners / functions)
    // ------------------------------------------------------------------

    pub async fn get_partner(&self, id: i64) -> DbResult<Partner> {
        let row = sqlx::query("SELECT doc FROM partners WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("partner", &id.to_string()))?;
        decode_doc(row.try_get("doc")?)
    }

    pub async fn get_file_type(&self, id: i64) -> DbResult<FileType> {
        let row = sqlx::query("SELECT doc FROM file_types WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("file_type", &id.to_string()))?;
        decode_doc(row.try_get("doc")?)
    }

    pub async fn get_function(&self, id: &str) -> DbResult<Function> {
        let row = sqlx::query("SELECT doc FROM functions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("function", id))?;
        decode_doc(row.try_get("doc")?)
    }

    pub async fn load_all_functions(&self) -> DbResult<Vec<Function>> {
        let rows = sqlx::query("SELECT doc FROM functions").fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| decode_doc(r.try_get("doc")?)).collect()
    }

    // ------------------------------------------------------------------
    // apilog / copylog
    // ------------------------------------------------------------------

    /// Insert one `apilog` row, returning its id for error propagation.
    pub async fn insert_apilog(&self, entry: &Value) -> DbResult<i64> {
        let row = sqlx::query("INSERT INTO apilog (doc) VALUES ($1) RETURNING id")
            .bind(entry)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn insert_copylog(&self, file_id: i64, entry: &Value) -> DbResult<()> {
        sqlx::query("INSERT INTO copylog (file_id, doc) VALUES ($1, $2)")
            .bind(file_id)
            .bind(entry)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn decode_doc<T: serde::de::DeserializeOwned>(value: Value) -> DbResult<T> {
    serde_json::from_value(value).map_err(|e| DbError::config(e.to_string()))
}

/// Apply one tracked update onto a whole-document `Value` in place.
///
/// Dot-separated paths address nested objects, creating intermediate
/// objects as needed. `$addToSet` treats the addressed value as a JSON
/// array and appends values not already present, by structural equality.
fn apply_update(doc: &mut Value, update: &UpdateBuilder) {
    for (path, value) in update.sets() {
        set_path(doc, path, value.clone());
    }
    for path in update.unsets() {
        unset_path(doc, path);
    }
    for (path, values) in update.add_to_sets() {
        let array = ensure_array(doc, path);
        for value in values {
            if !array.contains(value) {
                array.push(value.clone());
            }
        }
    }
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut cursor = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            cursor
                .as_object_mut()
                .expect("update target must be a JSON object")
                .insert(segment.to_string(), value);
            return;
        }
        cursor = cursor
            .as_object_mut()
            .expect("update target must be a JSON object")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
}

fn unset_path(doc: &mut Value, path: &str) {
    let mut cursor = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            if let Some(obj) = cursor.as_object_mut() {
                obj.remove(segment);
            }
            return;
        }
        match cursor.get_mut(segment) {
            Some(next) => cursor = next,
            None => return,
        }
    }
}

fn ensure_array<'a>(doc: &'a mut Value, path: &str) -> &'a mut Vec<Value> {
    let mut cursor = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            let entry = cursor
                .as_object_mut()
                .expect("update target must be a JSON object")
                .entry(segment.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            return entry.as_array_mut().expect("addToSet target must be a JSON array");
        }
        cursor = cursor
            .as_object_mut()
            .expect("update target must be a JSON object")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    unreachable!("path must contain at least one segment")
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflow_common::types::UpdateBuilder;
    use serde_json::json;

    #[test]
    fn set_creates_nested_objects() {
        let mut doc = json!({});
        let mut update = UpdateBuilder::new();
        update.set("stats.loadedRecordsSuccess", json!(3));
        apply_update(&mut doc, &update);
        assert_eq!(doc["stats"]["loadedRecordsSuccess"], json!(3));
    }

    #[test]
    fn unset_removes_existing_key() {
        let mut doc = json!({ "a": { "b": 1, "c": 2 } });
        let mut update = UpdateBuilder::new();
        update.unset("a.b");
        apply_update(&mut doc, &update);
        assert_eq!(doc["a"], json!({ "c": 2 }));
    }

    #[test]
    fn add_to_set_is_idempotent() {
        let mut doc = json!({ "log": [] });
        let mut update = UpdateBuilder::new();
        update.add_to_set("log", vec![json!("x"), json!("x"), json!("y")]);
        apply_update(&mut doc, &update);
        assert_eq!(doc["log"], json!(["x", "y"]));
    }
}
