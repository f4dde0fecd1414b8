// Lockbox — Key Rotation Coordinator
//
// An offline batch consumer of the credential tables: walks rows whose
// key id no longer matches the wrapper's active key, opens each sealed
// field under its old key and re-seals under the current one. Each row
// is committed in its own transaction together with the run checkpoint,
// guarded by `key_id = <stale>` so a concurrent ordinary writer (which
// always seals under the current key) turns the rotation write into a
// no-op instead of a race.
//
// Rotation is a storage-representation change: it never touches the
// `version` column, so it cannot manufacture conflicts for concurrent
// logical edits. At most one record's plaintext is held in memory at a
// time, and it zeroizes on drop.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};
use uuid::Uuid;

use crate::crypto::{self, Aad, SealedField};
use crate::kms::Wrapper;
use crate::store::{Database, StoreError, VariantTable, VARIANT_TABLES};

use super::RotationError;

// ─── Run State Machine ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::InProgress => "in_progress",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "in_progress" => RunState::InProgress,
            "completed" => RunState::Completed,
            "failed" => RunState::Failed,
            _ => RunState::Pending,
        }
    }
}

/// A persisted rotation run. `checkpoint` is the last processed
/// public id; resuming continues strictly after it.
#[derive(Debug, Clone)]
pub struct RotationRun {
    pub id: Uuid,
    pub store_id: Uuid,
    pub state: RunState,
    pub checkpoint: Option<String>,
    pub error: Option<String>,
    pub create_time: chrono::DateTime<Utc>,
    pub update_time: chrono::DateTime<Utc>,
}

/// Result of processing one row boundary.
#[derive(Debug)]
pub enum StepOutcome {
    /// One stale row was re-wrapped (or skipped as already current).
    Rotated(Uuid),
    /// No stale rows remain; the run is complete.
    Complete,
}

/// Result of driving a run to a stopping point.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Cancelled at a row boundary; the run stays in progress and
    /// resumes from its checkpoint.
    Cancelled,
}

// ─── Coordinator ─────────────────────────────────────────────────────────────

pub struct RotationCoordinator<'a> {
    db: &'a Database,
    wrapper: &'a dyn Wrapper,
}

impl<'a> RotationCoordinator<'a> {
    pub fn new(db: &'a Database, wrapper: &'a dyn Wrapper) -> Self {
        Self { db, wrapper }
    }

    fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RotationRun> {
        let id_str: String = row.get(0)?;
        let store_id_str: String = row.get(1)?;
        let state_str: String = row.get(2)?;
        let checkpoint: Option<String> = row.get(3)?;
        let error: Option<String> = row.get(4)?;
        let create_time_str: String = row.get(5)?;
        let update_time_str: String = row.get(6)?;

        let parse_uuid = |s: &str| {
            Uuid::parse_str(s).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        };

        let create_time = chrono::DateTime::parse_from_rfc3339(&create_time_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let update_time = chrono::DateTime::parse_from_rfc3339(&update_time_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(RotationRun {
            id: parse_uuid(&id_str)?,
            store_id: parse_uuid(&store_id_str)?,
            state: RunState::parse(&state_str),
            checkpoint,
            error,
            create_time,
            update_time,
        })
    }

    pub fn load_run(&self, run_id: &Uuid) -> Result<RotationRun, RotationError> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, store_id, state, checkpoint, error, create_time, update_time
             FROM rotation_run WHERE id = ?1",
        )?;
        stmt.query_row(params![run_id.to_string()], Self::row_to_run)
            .optional()?
            .ok_or(RotationError::RunNotFound(*run_id))
    }

    /// The most recently created run for a store, finished or not.
    pub fn latest_run(&self, store_id: &Uuid) -> Result<Option<RotationRun>, RotationError> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, store_id, state, checkpoint, error, create_time, update_time
             FROM rotation_run WHERE store_id = ?1
             ORDER BY create_time DESC, id DESC LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![store_id.to_string()], Self::row_to_run)
            .optional()?)
    }

    fn unfinished_run(&self, store_id: &Uuid) -> Result<Option<RotationRun>, RotationError> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, store_id, state, checkpoint, error, create_time, update_time
             FROM rotation_run WHERE store_id = ?1 AND state != 'completed'
             ORDER BY create_time ASC LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![store_id.to_string()], Self::row_to_run)
            .optional()?)
    }

    fn stale_count(&self, store_id: &Uuid, current_key_id: &str) -> Result<i64, RotationError> {
        let mut total = 0i64;
        for table in &VARIANT_TABLES {
            let count: i64 = self.db.conn().query_row(
                &format!(
                    "SELECT count(*) FROM {} WHERE store_id = ?1 AND key_id != ?2",
                    table.table
                ),
                params![store_id.to_string(), current_key_id],
                |row| row.get(0),
            )?;
            total += count;
        }
        Ok(total)
    }

    /// Detect staleness for a store and create a pending run for it.
    /// Returns the existing run instead if one is still unfinished, and
    /// `None` when every row already reports the active key.
    pub fn plan(&self, store_id: &Uuid) -> Result<Option<RotationRun>, RotationError> {
        let exists: Option<i64> = self
            .db
            .conn()
            .query_row(
                "SELECT 1 FROM credential_store WHERE public_id = ?1",
                params![store_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(RotationError::StoreNotFound(*store_id));
        }

        if let Some(run) = self.unfinished_run(store_id)? {
            tracing::debug!(run_id = %run.id, store_id = %store_id, "Resuming unfinished rotation run");
            return Ok(Some(run));
        }

        let current = self.wrapper.current_key_id();
        let stale = self.stale_count(store_id, &current)?;
        if stale == 0 {
            return Ok(None);
        }

        let run_id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        self.db.conn().execute(
            "INSERT INTO rotation_run (id, store_id, state, create_time, update_time)
             VALUES (?1, ?2, 'pending', ?3, ?3)",
            params![run_id.to_string(), store_id.to_string(), now],
        )?;

        self.db.log_access(
            store_id,
            "rotation_planned",
            "engine",
            Some(&format!("run {}, {} stale row(s)", run_id, stale)),
        )?;
        tracing::info!(
            run_id = %run_id,
            store_id = %store_id,
            stale_rows = stale,
            "Rotation run planned"
        );

        self.load_run(&run_id).map(Some)
    }

    fn set_state(
        &self,
        run_id: &Uuid,
        state: RunState,
        error: Option<&str>,
    ) -> Result<(), RotationError> {
        let now = Utc::now().to_rfc3339();
        self.db.conn().execute(
            "UPDATE rotation_run SET state = ?1, error = ?2, update_time = ?3 WHERE id = ?4",
            params![state.as_str(), error, now, run_id.to_string()],
        )?;
        Ok(())
    }

    /// The next stale row strictly after the checkpoint, in ascending
    /// public id order across all credential tables of the store.
    fn next_stale_row(
        &self,
        store_id: &Uuid,
        current_key_id: &str,
        checkpoint: Option<&str>,
    ) -> Result<Option<(&'static VariantTable, String)>, RotationError> {
        let after = checkpoint.unwrap_or("");
        let mut next: Option<(&'static VariantTable, String)> = None;

        for table in &VARIANT_TABLES {
            let candidate: Option<String> = self
                .db
                .conn()
                .query_row(
                    &format!(
                        "SELECT public_id FROM {}
                         WHERE store_id = ?1 AND key_id != ?2 AND public_id > ?3
                         ORDER BY public_id ASC LIMIT 1",
                        table.table
                    ),
                    params![store_id.to_string(), current_key_id, after],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id) = candidate {
                match &next {
                    Some((_, best)) if *best <= id => {}
                    _ => next = Some((table, id)),
                }
            }
        }
        Ok(next)
    }

    /// Re-wrap one row: open every sealed field under the row's old key,
    /// seal under the current key, and commit the replacement together
    /// with the advanced checkpoint. The `version` column is untouched.
    fn rotate_row(
        &self,
        run_id: &Uuid,
        store_id: &Uuid,
        table: &VariantTable,
        row_id: &str,
    ) -> Result<(), RotationError> {
        let select_cols: Vec<String> = std::iter::once("key_id".to_string())
            .chain(table.columns.iter().flat_map(|c| {
                [c.ciphertext_col.to_string(), c.hmac_col.to_string()]
            }))
            .collect();

        let row: Option<(String, Vec<Option<Vec<u8>>>)> = self
            .db
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE public_id = ?1",
                    select_cols.join(", "),
                    table.table
                ),
                params![row_id],
                |row| {
                    let key_id: String = row.get(0)?;
                    let mut blobs = Vec::with_capacity(table.columns.len() * 2);
                    for i in 0..table.columns.len() * 2 {
                        blobs.push(row.get::<_, Option<Vec<u8>>>(1 + i)?);
                    }
                    Ok((key_id, blobs))
                },
            )
            .optional()?;

        let (old_key_id, blobs) = match row {
            Some(row) => row,
            // Deleted underneath us; nothing to re-wrap.
            None => return self.advance_checkpoint(run_id, row_id),
        };

        let current_key_id = self.wrapper.current_key_id();
        if old_key_id == current_key_id {
            // A concurrent writer already brought the row forward.
            return self.advance_checkpoint(run_id, row_id);
        }

        let row_uuid = Uuid::parse_str(row_id).map_err(|_| {
            RotationError::Store(StoreError::NotFound {
                kind: "credential",
                id: row_id.to_string(),
            })
        })?;

        // Re-seal present fields; one record's plaintext at a time.
        let mut new_seals: Vec<Option<SealedField>> = Vec::with_capacity(table.columns.len());
        for (i, col) in table.columns.iter().enumerate() {
            let ciphertext = blobs[i * 2].as_ref();
            let hmac = blobs[i * 2 + 1].as_ref();
            match (ciphertext, hmac) {
                (Some(ciphertext), Some(hmac)) => {
                    let sealed = SealedField {
                        ciphertext: ciphertext.clone(),
                        hmac: hmac.clone(),
                        key_id: old_key_id.clone(),
                    };
                    let aad = Aad::new(store_id, &row_uuid, col.field);
                    let plaintext = crypto::open(self.wrapper, &sealed, &aad)?;
                    new_seals.push(Some(crypto::seal(self.wrapper, &plaintext, &aad)?));
                }
                _ => new_seals.push(None),
            }
        }

        // The mandatory column is always present and carries the row key id.
        let new_key_id = new_seals
            .iter()
            .flatten()
            .next()
            .map(|s| s.key_id.clone())
            .unwrap_or(current_key_id);

        let mut sets = vec!["key_id = ?1".to_string()];
        let mut values: Vec<Value> = vec![Value::from(new_key_id)];
        let mut idx = 2;
        for (col, sealed) in table.columns.iter().zip(&new_seals) {
            if let Some(sealed) = sealed {
                sets.push(format!("{} = ?{}", col.ciphertext_col, idx));
                values.push(Value::Blob(sealed.ciphertext.clone()));
                idx += 1;
                sets.push(format!("{} = ?{}", col.hmac_col, idx));
                values.push(Value::Blob(sealed.hmac.clone()));
                idx += 1;
            }
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE public_id = ?{} AND key_id = ?{}",
            table.table,
            sets.join(", "),
            idx,
            idx + 1
        );
        values.push(Value::from(row_id.to_string()));
        values.push(Value::from(old_key_id));

        let tx = self.db.conn().unchecked_transaction()?;
        // Guarded by the old key id: if a writer re-sealed the row since
        // we read it, this update matches nothing and the row keeps the
        // writer's (already current) representation.
        tx.execute(&sql, params_from_iter(values))?;
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE rotation_run SET checkpoint = ?1, update_time = ?2 WHERE id = ?3",
            params![row_id, now, run_id.to_string()],
        )?;
        tx.commit()?;

        tracing::debug!(
            run_id = %run_id,
            credential_id = %row_id,
            table = table.table,
            "Row re-wrapped under current key"
        );
        Ok(())
    }

    fn advance_checkpoint(&self, run_id: &Uuid, row_id: &str) -> Result<(), RotationError> {
        let now = Utc::now().to_rfc3339();
        self.db.conn().execute(
            "UPDATE rotation_run SET checkpoint = ?1, update_time = ?2 WHERE id = ?3",
            params![row_id, now, run_id.to_string()],
        )?;
        Ok(())
    }

    /// Process the next row boundary of a run. Transitions the run to
    /// `InProgress` on first use and to `Completed` once no stale rows
    /// remain. An encryption failure (e.g. the old key is no longer
    /// resolvable) marks the run `Failed`; rows already rotated are kept
    /// and a retry resumes from the checkpoint.
    pub fn step(&self, run_id: &Uuid) -> Result<StepOutcome, RotationError> {
        let run = self.load_run(run_id)?;
        if run.state == RunState::Completed {
            return Ok(StepOutcome::Complete);
        }
        if run.state != RunState::InProgress {
            self.set_state(run_id, RunState::InProgress, None)?;
        }

        let current_key_id = self.wrapper.current_key_id();
        let next = self.next_stale_row(&run.store_id, &current_key_id, run.checkpoint.as_deref())?;

        let (table, row_id) = match next {
            Some(next) => next,
            None => {
                self.set_state(run_id, RunState::Completed, None)?;
                self.db.log_access(
                    &run.store_id,
                    "rotation_completed",
                    "engine",
                    Some(&format!("run {}", run_id)),
                )?;
                tracing::info!(run_id = %run_id, store_id = %run.store_id, "Rotation run completed");
                return Ok(StepOutcome::Complete);
            }
        };

        match self.rotate_row(run_id, &run.store_id, table, &row_id) {
            Ok(()) => {
                let rotated = Uuid::parse_str(&row_id).unwrap_or_default();
                Ok(StepOutcome::Rotated(rotated))
            }
            Err(err) => {
                if let RotationError::Kms(ref kms_err) = err {
                    self.set_state(run_id, RunState::Failed, Some(&kms_err.to_string()))?;
                    tracing::error!(
                        run_id = %run_id,
                        credential_id = %row_id,
                        error = %kms_err,
                        "Rotation run halted; progress up to checkpoint is kept"
                    );
                }
                Err(err)
            }
        }
    }

    /// Drive a run until it completes or `cancel` is observed at a row
    /// boundary. Never cancels mid-row.
    pub fn run(&self, run_id: &Uuid, cancel: &AtomicBool) -> Result<RunOutcome, RotationError> {
        loop {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!(run_id = %run_id, "Rotation run cancelled at row boundary");
                return Ok(RunOutcome::Cancelled);
            }
            match self.step(run_id)? {
                StepOutcome::Complete => return Ok(RunOutcome::Completed),
                StepOutcome::Rotated(_) => {}
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
