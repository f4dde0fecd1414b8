// Lockbox — Credential Store Registry
//
// Lifecycle of the parent `CredentialStore` entities: scope, naming,
// versioning. Deleting a store cascades to its credentials in the same
// transaction. Mutations are guarded by the optimistic version counter;
// a mismatch is reported as a conflict, never retried internally.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::db::Database;
use super::models::{CredentialStore, CredentialStoreChanges};
use super::StoreError;

const STORE_KIND: &str = "credential store";

pub struct CredentialStoreRegistry<'a> {
    db: &'a Database,
}

impl<'a> CredentialStoreRegistry<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Parse a credential store row from the database.
    fn row_to_store(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialStore> {
        let id_str: String = row.get(0)?;
        let create_time_str: String = row.get(1)?;
        let update_time_str: String = row.get(2)?;
        let name: Option<String> = row.get(3)?;
        let description: Option<String> = row.get(4)?;
        let project_id: String = row.get(5)?;
        let version: i64 = row.get(6)?;

        let public_id = Uuid::parse_str(&id_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        let create_time = chrono::DateTime::parse_from_rfc3339(&create_time_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let update_time = chrono::DateTime::parse_from_rfc3339(&update_time_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(CredentialStore {
            public_id,
            create_time,
            update_time,
            name,
            description,
            project_id,
            version: version as u32,
        })
    }

    fn name_in_use(
        &self,
        project_id: &str,
        name: &str,
        exclude: Option<&Uuid>,
    ) -> Result<bool, StoreError> {
        let count: i64 = match exclude {
            Some(id) => self.db.conn().query_row(
                "SELECT count(*) FROM credential_store
                 WHERE project_id = ?1 AND name = ?2 AND public_id != ?3",
                params![project_id, name, id.to_string()],
                |row| row.get(0),
            )?,
            None => self.db.conn().query_row(
                "SELECT count(*) FROM credential_store WHERE project_id = ?1 AND name = ?2",
                params![project_id, name],
                |row| row.get(0),
            )?,
        };
        Ok(count > 0)
    }

    /// Create a credential store in the given project scope.
    pub fn create(
        &self,
        project_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<CredentialStore, StoreError> {
        if project_id.is_empty() {
            return Err(StoreError::missing("project_id"));
        }
        if let Some(name) = name {
            if name.is_empty() {
                return Err(StoreError::Validation {
                    field: "name",
                    reason: "must be non-empty when set".to_string(),
                });
            }
            if self.name_in_use(project_id, name, None)? {
                return Err(StoreError::DuplicateName {
                    name: name.to_string(),
                    scope: format!("project {}", project_id),
                });
            }
        }

        let public_id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();

        self.db.conn().execute(
            "INSERT INTO credential_store
                (public_id, create_time, update_time, name, description, project_id, version)
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, 1)",
            params![public_id.to_string(), now, name, description, project_id],
        )?;

        self.db.log_access(&public_id, "created", "engine", None)?;

        tracing::info!(
            store_id = %public_id,
            project_id = %project_id,
            "Credential store created"
        );

        self.read(&public_id)
    }

    /// Get a credential store by id.
    pub fn read(&self, public_id: &Uuid) -> Result<CredentialStore, StoreError> {
        let mut stmt = self.db.conn().prepare(
            "SELECT public_id, create_time, update_time, name, description, project_id, version
             FROM credential_store WHERE public_id = ?1",
        )?;

        stmt.query_row(params![public_id.to_string()], Self::row_to_store)
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                kind: STORE_KIND,
                id: public_id.to_string(),
            })
    }

    /// List the stores in a project — a finite snapshot as of call time.
    pub fn list(&self, project_id: &str) -> Result<Vec<CredentialStore>, StoreError> {
        let mut stmt = self.db.conn().prepare(
            "SELECT public_id, create_time, update_time, name, description, project_id, version
             FROM credential_store WHERE project_id = ?1 ORDER BY create_time DESC",
        )?;

        let rows = stmt.query_map(params![project_id], Self::row_to_store)?;

        let mut stores = Vec::new();
        for row in rows {
            stores.push(row?);
        }
        Ok(stores)
    }

    /// Update name/description, guarded by the version counter.
    pub fn update(
        &self,
        public_id: &Uuid,
        expected_version: u32,
        changes: CredentialStoreChanges,
    ) -> Result<CredentialStore, StoreError> {
        let current = self.read(public_id)?;

        let name = match changes.name {
            Some(name) => name,
            None => current.name.clone(),
        };
        let description = match changes.description {
            Some(description) => description,
            None => current.description.clone(),
        };

        if let Some(ref name) = name {
            if name.is_empty() {
                return Err(StoreError::Validation {
                    field: "name",
                    reason: "must be non-empty when set".to_string(),
                });
            }
            if current.name.as_deref() != Some(name.as_str())
                && self.name_in_use(&current.project_id, name, Some(public_id))?
            {
                return Err(StoreError::DuplicateName {
                    name: name.clone(),
                    scope: format!("project {}", current.project_id),
                });
            }
        }

        let now = Utc::now().to_rfc3339();
        let affected = self.db.conn().execute(
            "UPDATE credential_store
             SET name = ?1, description = ?2, update_time = ?3, version = version + 1
             WHERE public_id = ?4 AND version = ?5",
            params![
                name,
                description,
                now,
                public_id.to_string(),
                expected_version
            ],
        )?;

        if affected == 0 {
            // The row exists (read above), so the version moved under us.
            return Err(StoreError::Conflict {
                id: public_id.to_string(),
                expected_version,
            });
        }

        self.db.log_access(public_id, "updated", "engine", None)?;
        self.read(public_id)
    }

    /// Version-checked delete. Owned credentials are removed in the same
    /// transaction through the schema-level cascade.
    pub fn delete(&self, public_id: &Uuid, expected_version: u32) -> Result<(), StoreError> {
        // Confirm existence first so a missing row is NotFound, not Conflict.
        self.read(public_id)?;

        let children: i64 = self.db.conn().query_row(
            "SELECT (SELECT count(*) FROM credential_username_password WHERE store_id = ?1)
                  + (SELECT count(*) FROM credential_ssh_private_key WHERE store_id = ?1)
                  + (SELECT count(*) FROM credential_json WHERE store_id = ?1)",
            params![public_id.to_string()],
            |row| row.get(0),
        )?;

        let affected = self.db.conn().execute(
            "DELETE FROM credential_store WHERE public_id = ?1 AND version = ?2",
            params![public_id.to_string(), expected_version],
        )?;

        if affected == 0 {
            return Err(StoreError::Conflict {
                id: public_id.to_string(),
                expected_version,
            });
        }

        self.db.log_access(
            public_id,
            "deleted",
            "engine",
            Some(&format!("cascaded {} credential(s)", children)),
        )?;

        tracing::info!(
            store_id = %public_id,
            cascaded = children,
            "Credential store deleted"
        );

        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_store_starts_at_version_one() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);

        let store = registry
            .create("p1", Some("prod-db"), Some("production database creds"))
            .unwrap();

        assert_eq!(store.version, 1);
        assert_eq!(store.project_id, "p1");
        assert_eq!(store.name.as_deref(), Some("prod-db"));
        assert_eq!(store.description.as_deref(), Some("production database creds"));
    }

    #[test]
    fn test_create_rejects_empty_project() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);

        let err = registry.create("", None, None).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation { field: "project_id", .. }
        ));
    }

    #[test]
    fn test_duplicate_name_within_project_rejected() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);

        registry.create("p1", Some("shared"), None).unwrap();
        let err = registry.create("p1", Some("shared"), None).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName { .. }));

        // Same name in a different project is fine.
        assert!(registry.create("p2", Some("shared"), None).is_ok());
    }

    #[test]
    fn test_multiple_unnamed_stores_allowed() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);

        registry.create("p1", None, None).unwrap();
        registry.create("p1", None, None).unwrap();
        assert_eq!(registry.list("p1").unwrap().len(), 2);
    }

    #[test]
    fn test_read_missing_store_is_not_found() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);

        let err = registry.read(&Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_update_bumps_version_by_exactly_one() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);
        let store = registry.create("p1", Some("old"), None).unwrap();

        let updated = registry
            .update(
                &store.public_id,
                1,
                CredentialStoreChanges {
                    name: Some(Some("new".to_string())),
                    description: Some(Some("renamed".to_string())),
                },
            )
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.name.as_deref(), Some("new"));
        assert_eq!(updated.description.as_deref(), Some("renamed"));
    }

    #[test]
    fn test_update_with_stale_version_conflicts() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);
        let store = registry.create("p1", Some("s"), None).unwrap();

        registry
            .update(&store.public_id, 1, CredentialStoreChanges::default())
            .unwrap();

        // A second writer holding the old version loses.
        let err = registry
            .update(&store.public_id, 1, CredentialStoreChanges::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // After re-reading, the retry succeeds.
        let fresh = registry.read(&store.public_id).unwrap();
        assert!(registry
            .update(&store.public_id, fresh.version, CredentialStoreChanges::default())
            .is_ok());
    }

    #[test]
    fn test_update_clears_optional_fields() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);
        let store = registry.create("p1", Some("s"), Some("d")).unwrap();

        let updated = registry
            .update(
                &store.public_id,
                1,
                CredentialStoreChanges {
                    name: Some(None),
                    description: Some(None),
                },
            )
            .unwrap();

        assert!(updated.name.is_none());
        assert!(updated.description.is_none());
    }

    #[test]
    fn test_update_to_taken_name_rejected() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);
        registry.create("p1", Some("taken"), None).unwrap();
        let store = registry.create("p1", Some("mine"), None).unwrap();

        let err = registry
            .update(
                &store.public_id,
                1,
                CredentialStoreChanges {
                    name: Some(Some("taken".to_string())),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName { .. }));
    }

    #[test]
    fn test_delete_with_stale_version_conflicts() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);
        let store = registry.create("p1", None, None).unwrap();

        let err = registry.delete(&store.public_id, 99).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        registry.delete(&store.public_id, 1).unwrap();
        assert!(matches!(
            registry.read(&store.public_id),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_cascades_to_credentials() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);
        let store = registry.create("p1", None, None).unwrap();

        db.conn()
            .execute(
                "INSERT INTO credential_json
                    (public_id, create_time, update_time, store_id, object_encrypted, object_hmac, key_id)
                 VALUES (?1, 't', 't', ?2, x'00', x'00', 'k1')",
                params![Uuid::new_v4().to_string(), store.public_id.to_string()],
            )
            .unwrap();

        registry.delete(&store.public_id, 1).unwrap();

        let remaining: i64 = db
            .conn()
            .query_row("SELECT count(*) FROM credential_json", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0, "store deletion must cascade to credentials");
    }

    #[test]
    fn test_list_is_scoped_to_project() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);

        registry.create("p1", Some("a"), None).unwrap();
        registry.create("p1", Some("b"), None).unwrap();
        registry.create("p2", Some("c"), None).unwrap();

        let p1 = registry.list("p1").unwrap();
        assert_eq!(p1.len(), 2);
        assert!(p1.iter().all(|s| s.project_id == "p1"));
        assert!(registry.list("p3").unwrap().is_empty());
    }

    #[test]
    fn test_mutations_are_audited() {
        let db = setup();
        let registry = CredentialStoreRegistry::new(&db);
        let store = registry.create("p1", Some("s"), None).unwrap();
        registry
            .update(&store.public_id, 1, CredentialStoreChanges::default())
            .unwrap();
        registry.delete(&store.public_id, 2).unwrap();

        let count: i64 = db
            .conn()
            .query_row(
                "SELECT count(*) FROM audit_log WHERE entity_id = ?1",
                params![store.public_id.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3, "created + updated + deleted audit entries");
    }
}
