// Lockbox — Database Management
//
// Opens and initializes the SQLite database backing the engine. Secret
// columns only ever hold sealed bytes, so the file itself carries no
// plaintext; at-rest protection is the per-field envelope encryption.
// Column names are the stable wire names and must not be renamed.

use rusqlite::Connection;

use super::StoreError;

/// Wrapper around the engine's SQLite connection.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database for testing.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StoreError> {
        // Cascade from stores to credentials relies on FK enforcement,
        // which SQLite leaves off per-connection by default.
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.run_migrations()
    }

    /// Get a reference to the underlying connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Write an entry to the audit log. The log has no FK constraint, so
    /// it can reference deleted entities for a tamper-evident history.
    pub fn log_access(
        &self,
        entity_id: &uuid::Uuid,
        action: &str,
        actor: &str,
        details: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO audit_log (entity_id, action, actor, timestamp, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![entity_id.to_string(), action, actor, now, details],
        )?;

        tracing::debug!(
            entity_id = %entity_id,
            action = %action,
            actor = %actor,
            "Audit log entry recorded"
        );

        Ok(())
    }

    /// Run schema migrations to create or update tables.
    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS credential_store (
                public_id    TEXT PRIMARY KEY,
                create_time  TEXT NOT NULL,
                update_time  TEXT NOT NULL,
                name         TEXT,
                description  TEXT,
                project_id   TEXT NOT NULL,
                version      INTEGER NOT NULL DEFAULT 1,
                UNIQUE (project_id, name)
            );

            CREATE TABLE IF NOT EXISTS credential_username_password (
                public_id      TEXT PRIMARY KEY,
                create_time    TEXT NOT NULL,
                update_time    TEXT NOT NULL,
                name           TEXT,
                description    TEXT,
                store_id       TEXT NOT NULL
                    REFERENCES credential_store(public_id) ON DELETE CASCADE,
                version        INTEGER NOT NULL DEFAULT 1,
                username       TEXT NOT NULL,
                ct_password    BLOB NOT NULL,
                password_hmac  BLOB NOT NULL,
                key_id         TEXT NOT NULL,
                UNIQUE (store_id, name)
            );

            CREATE TABLE IF NOT EXISTS credential_ssh_private_key (
                public_id                         TEXT PRIMARY KEY,
                create_time                       TEXT NOT NULL,
                update_time                       TEXT NOT NULL,
                name                              TEXT,
                description                       TEXT,
                store_id                          TEXT NOT NULL
                    REFERENCES credential_store(public_id) ON DELETE CASCADE,
                version                           INTEGER NOT NULL DEFAULT 1,
                username                          TEXT NOT NULL,
                private_key_encrypted             BLOB NOT NULL,
                private_key_hmac                  BLOB NOT NULL,
                key_id                            TEXT NOT NULL,
                private_key_passphrase_encrypted  BLOB,
                private_key_passphrase_hmac       BLOB,
                UNIQUE (store_id, name)
            );

            CREATE TABLE IF NOT EXISTS credential_json (
                public_id         TEXT PRIMARY KEY,
                create_time       TEXT NOT NULL,
                update_time       TEXT NOT NULL,
                name              TEXT,
                description       TEXT,
                store_id          TEXT NOT NULL
                    REFERENCES credential_store(public_id) ON DELETE CASCADE,
                version           INTEGER NOT NULL DEFAULT 1,
                object_encrypted  BLOB NOT NULL,
                object_hmac       BLOB NOT NULL,
                key_id            TEXT NOT NULL,
                UNIQUE (store_id, name)
            );

            CREATE TABLE IF NOT EXISTS rotation_run (
                id           TEXT PRIMARY KEY,
                store_id     TEXT NOT NULL
                    REFERENCES credential_store(public_id) ON DELETE CASCADE,
                state        TEXT NOT NULL DEFAULT 'pending',
                checkpoint   TEXT,
                error        TEXT,
                create_time  TEXT NOT NULL,
                update_time  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id   TEXT NOT NULL,
                action      TEXT NOT NULL,
                actor       TEXT NOT NULL,
                timestamp   TEXT NOT NULL,
                details     TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_audit_entity
                ON audit_log(entity_id);

            CREATE INDEX IF NOT EXISTS idx_credential_up_store
                ON credential_username_password(store_id);

            CREATE INDEX IF NOT EXISTS idx_credential_ssh_store
                ON credential_ssh_private_key(store_id);

            CREATE INDEX IF NOT EXISTS idx_credential_json_store
                ON credential_json(store_id);

            CREATE INDEX IF NOT EXISTS idx_rotation_run_store
                ON rotation_run(store_id);
            ",
        )?;

        tracing::debug!("Database migrations completed successfully");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_succeeds() {
        let db = Database::open_in_memory();
        assert!(db.is_ok(), "Should be able to open an in-memory database");
    }

    #[test]
    fn test_schema_migration_creates_tables() {
        let db = Database::open_in_memory().unwrap();

        for table in [
            "credential_store",
            "credential_username_password",
            "credential_ssh_private_key",
            "credential_json",
            "rotation_run",
            "audit_log",
        ] {
            let count: i64 = db
                .conn()
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "{} table should exist", table);
        }
    }

    #[test]
    fn test_schema_migration_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        assert!(
            db.run_migrations().is_ok(),
            "Migrations should be idempotent"
        );
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("lockbox.db");

        let result = Database::open(&db_path);
        assert!(result.is_ok(), "Should open an on-disk database");
        assert!(db_path.exists());
    }

    #[test]
    fn test_foreign_keys_are_enforced() {
        let db = Database::open_in_memory().unwrap();

        // Inserting a credential referencing a nonexistent store must fail.
        let result = db.conn().execute(
            "INSERT INTO credential_json
                (public_id, create_time, update_time, store_id, object_encrypted, object_hmac, key_id)
             VALUES ('c1', 't', 't', 'missing-store', x'00', x'00', 'k1')",
            [],
        );
        assert!(result.is_err(), "FK violation must be rejected");
    }

    #[test]
    fn test_unique_name_allows_multiple_unnamed_rows() {
        let db = Database::open_in_memory().unwrap();

        for id in ["s1", "s2"] {
            db.conn()
                .execute(
                    "INSERT INTO credential_store
                        (public_id, create_time, update_time, project_id)
                     VALUES (?1, 't', 't', 'p1')",
                    [id],
                )
                .unwrap();
        }

        let count: i64 = db
            .conn()
            .query_row("SELECT count(*) FROM credential_store", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2, "NULL names must not collide under the unique index");
    }
}
