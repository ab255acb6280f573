use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use sellkit_core::{
    Clock, Field, OfferId, PersistenceError, PersistencePort, Scope, StorageKey, SystemClock,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;
const GLOBAL_OFFER_KEY: &str = "";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS durable_entries (
  offer_key TEXT NOT NULL,
  field TEXT NOT NULL CHECK (field IN ('session_id','session_created_at','purchased','seen_at')),
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (offer_key, field),
  CHECK ((field IN ('session_id','session_created_at')) = (offer_key = ''))
);

CREATE TABLE IF NOT EXISTS ephemeral_entries (
  offer_key TEXT NOT NULL CHECK (offer_key <> ''),
  field TEXT NOT NULL CHECK (field IN ('impression','purchase_token')),
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (offer_key, field)
);

CREATE INDEX IF NOT EXISTS idx_durable_entries_field ON durable_entries(field);
";

/// `SQLite` implementation of both persistence scopes for one device profile.
///
/// The ephemeral table stands in for per-tab session storage and is emptied by
/// [`SqliteStore::end_browsing_session`].
/// Rows are stamped with `updated_at` from the store's [`Clock`], the system clock unless
/// replaced with [`SqliteStore::set_clock`].
pub struct SqliteStore {
    conn: Connection,
    clock: Box<dyn Clock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub unreadable_entries: usize,
    pub schema_status: SchemaStatus,
}

/// One stored value as shown by `sk store dump`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredEntry {
    pub scope: Scope,
    pub key: String,
    pub field: Field,
    pub offer_id: Option<OfferId>,
    pub value: String,
    pub updated_at: String,
}

impl SqliteStore {
    /// Open a SQLite-backed offer store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, clock: Box::new(SystemClock) })
    }

    /// Stamp subsequent writes with `clock` instead of the system clock.
    pub fn set_clock(&mut self, clock: impl Clock + 'static) {
        self.clock = Box::new(clock);
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1, self.clock.now())?;
            tx.commit().context("failed to commit migration v1")?;
            version = 1;
            tracing::info!(version, "applied offer store migration");
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// List every stored value, durable scope first.
    ///
    /// # Errors
    /// Returns an error when the entry tables cannot be read.
    pub fn entries(&self) -> Result<Vec<StoredEntry>> {
        let mut entries = Vec::new();
        for scope in [Scope::Durable, Scope::Ephemeral] {
            let mut stmt = self
                .conn
                .prepare(&format!(
                    "SELECT offer_key, field, value, updated_at FROM {} ORDER BY offer_key ASC, field ASC",
                    table_name(scope)
                ))
                .with_context(|| format!("failed to prepare {} entry listing", scope.as_str()))?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            for row in rows {
                let (offer_key, field, value, updated_at) = row?;
                let key = decode_key(&offer_key, &field)?;
                entries.push(StoredEntry {
                    scope,
                    key: key.to_string(),
                    field: key.field(),
                    offer_id: key.offer().cloned(),
                    value,
                    updated_at,
                });
            }
        }
        Ok(entries)
    }

    /// Drop the ephemeral scope, as the end of a browsing session would. Returns the number of
    /// removed entries.
    ///
    /// # Errors
    /// Returns an error when the ephemeral table cannot be cleared.
    pub fn end_browsing_session(&mut self) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM ephemeral_entries", [])
            .context("failed to clear ephemeral entries")?;
        tracing::debug!(removed, "browsing session ended");
        Ok(removed)
    }

    /// Write a `SQLite` backup of the store to `out_file`.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore database contents from a backup file, then migrate forward.
    ///
    /// # Errors
    /// Returns an error when the backup is missing, restore fails, or migration fails.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| format!("failed to restore sqlite backup from {}", in_file.display()))?;
        self.migrate()
    }

    /// Run quick-check, key decoding and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let unreadable_entries = if schema_status.current_version >= 1 {
            self.count_unreadable_entries()?
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            unreadable_entries,
            schema_status,
        })
    }

    fn count_unreadable_entries(&self) -> Result<usize> {
        let mut unreadable = 0;
        for scope in [Scope::Durable, Scope::Ephemeral] {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT offer_key, field FROM {}", table_name(scope)))
                .with_context(|| format!("failed to scan {} entries", scope.as_str()))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (offer_key, field) = row?;
                if decode_key(&offer_key, &field).is_err() {
                    unreadable += 1;
                }
            }
        }
        Ok(unreadable)
    }

    fn read_value(&self, key: &StorageKey) -> Result<Option<String>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT value FROM {} WHERE offer_key = ?1 AND field = ?2",
                    table_name(key.scope())
                ),
                params![offer_key(key), key.field().as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read {key}"))
    }

    fn write_value(&self, key: &StorageKey, value: &str) -> Result<()> {
        let now = rfc3339(self.clock.now())?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {}(offer_key, field, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(offer_key, field) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    table_name(key.scope())
                ),
                params![offer_key(key), key.field().as_str(), value, now],
            )
            .with_context(|| format!("failed to write {key}"))?;
        Ok(())
    }

    fn delete_value(&self, key: &StorageKey) -> Result<()> {
        self.conn
            .execute(
                &format!("DELETE FROM {} WHERE offer_key = ?1 AND field = ?2", table_name(key.scope())),
                params![offer_key(key), key.field().as_str()],
            )
            .with_context(|| format!("failed to remove {key}"))?;
        Ok(())
    }
}

impl PersistencePort for SqliteStore {
    fn get(&self, key: &StorageKey) -> Result<Option<String>, PersistenceError> {
        self.read_value(key).map_err(to_persistence_error)
    }

    fn set(&mut self, key: &StorageKey, value: &str) -> Result<(), PersistenceError> {
        self.write_value(key, value).map_err(to_persistence_error)
    }

    fn remove(&mut self, key: &StorageKey) -> Result<(), PersistenceError> {
        self.delete_value(key).map_err(to_persistence_error)
    }
}

fn to_persistence_error(err: anyhow::Error) -> PersistenceError {
    PersistenceError(format!("{err:#}"))
}

fn table_name(scope: Scope) -> &'static str {
    match scope {
        Scope::Durable => "durable_entries",
        Scope::Ephemeral => "ephemeral_entries",
    }
}

fn offer_key(key: &StorageKey) -> &str {
    key.offer().map_or(GLOBAL_OFFER_KEY, OfferId::as_str)
}

fn decode_key(offer_key: &str, field: &str) -> Result<StorageKey> {
    let field = Field::parse(field).ok_or_else(|| anyhow!("unknown stored field: {field}"))?;
    let offer = if offer_key == GLOBAL_OFFER_KEY {
        None
    } else {
        Some(OfferId::parse(offer_key).with_context(|| format!("invalid stored offer key: {offer_key}"))?)
    };
    StorageKey::from_parts(field, offer)
        .ok_or_else(|| anyhow!("field {} stored under mismatched offer key {offer_key:?}", field.as_str()))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_exists(conn, "durable_entries")? && table_exists(conn, "ephemeral_entries")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64, applied_at: OffsetDateTime) -> Result<()> {
    let now = rfc3339(applied_at)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use sellkit_core::{IdentityManager, ManualClock, MemoryPersistence};
    use time::Duration;
    use ulid::Ulid;

    use super::*;

    fn offer(raw: &str) -> Result<OfferId> {
        OfferId::parse(raw).map_err(|err| anyhow!("{err}"))
    }

    fn migrated() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    // Test IDs: TDB-001
    #[test]
    fn fresh_database_reports_pending_migration_then_migrates() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        assert!(!after.inferred_from_legacy);
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn schema_checks_reject_scope_and_offer_mismatches() -> Result<()> {
        let store = migrated()?;
        let global_with_offer = store.conn.execute(
            "INSERT INTO durable_entries(offer_key, field, value, updated_at) VALUES ('o1', 'session_id', 'x', 'now')",
            [],
        );
        assert!(global_with_offer.is_err());

        let ephemeral_field_in_durable = store.conn.execute(
            "INSERT INTO durable_entries(offer_key, field, value, updated_at) VALUES ('o1', 'impression', 'true', 'now')",
            [],
        );
        assert!(ephemeral_field_in_durable.is_err());

        let ephemeral_without_offer = store.conn.execute(
            "INSERT INTO ephemeral_entries(offer_key, field, value, updated_at) VALUES ('', 'impression', 'true', 'now')",
            [],
        );
        assert!(ephemeral_without_offer.is_err());
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn port_routes_keys_to_their_scope_and_upserts() -> Result<()> {
        let mut store = migrated()?;
        let id = offer("offer-1")?;

        store.set_flag(&StorageKey::purchased(&id))?;
        store.set(&StorageKey::purchase_token(&id), "pt_first")?;
        store.set(&StorageKey::purchase_token(&id), "pt_second")?;
        assert!(store.get_flag(&StorageKey::purchased(&id))?);
        assert_eq!(store.get(&StorageKey::purchase_token(&id))?.as_deref(), Some("pt_second"));

        let entries = store.entries()?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].scope, Scope::Durable);
        assert_eq!(entries[0].key, "mysellkit_purchased_offer-1");
        assert_eq!(entries[1].scope, Scope::Ephemeral);
        assert_eq!(entries[1].offer_id.as_ref(), Some(&id));

        store.remove(&StorageKey::purchase_token(&id))?;
        assert_eq!(store.get(&StorageKey::purchase_token(&id))?, None);
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn ending_browsing_session_keeps_durable_state() -> Result<()> {
        let mut store = migrated()?;
        let id = offer("offer-2")?;
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(19_000);
        let session = IdentityManager::new(false).session_id(&mut store, now)?;
        store.set_timestamp(&StorageKey::seen_at(&id), now)?;
        store.set_flag(&StorageKey::impression(&id))?;

        assert_eq!(store.end_browsing_session()?, 1);
        assert!(!store.get_flag(&StorageKey::impression(&id))?);
        assert_eq!(store.get_timestamp(&StorageKey::seen_at(&id))?, Some(now));
        let reloaded = IdentityManager::new(false).session_id(&mut store, now + Duration::hours(1))?;
        assert_eq!(reloaded, session);
        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn sqlite_store_matches_memory_store_behaviour() -> Result<()> {
        let mut sqlite = migrated()?;
        let mut memory = MemoryPersistence::new();
        let id = offer("offer-3")?;
        let keys = [
            StorageKey::session_id(),
            StorageKey::purchased(&id),
            StorageKey::seen_at(&id),
            StorageKey::impression(&id),
            StorageKey::purchase_token(&id),
        ];
        for (index, key) in keys.iter().enumerate() {
            let value = format!("value-{index}");
            sqlite.set(key, &value)?;
            memory.set(key, &value)?;
        }
        sqlite.remove(&keys[2])?;
        memory.remove(&keys[2])?;
        for key in &keys {
            assert_eq!(sqlite.get(key)?, memory.get(key)?, "mismatch for {key}");
        }
        Ok(())
    }

    // Test IDs: TDB-006
    #[test]
    fn integrity_check_reports_clean_database_and_unreadable_rows() -> Result<()> {
        let store = migrated()?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert_eq!(report.unreadable_entries, 0);
        assert_eq!(report.schema_status.current_version, 1);

        store.conn.execute(
            "INSERT INTO durable_entries(offer_key, field, value, updated_at) VALUES ('has space', 'purchased', 'true', 'now')",
            [],
        )?;
        assert_eq!(store.integrity_check()?.unreadable_entries, 1);
        assert!(store.entries().is_err());
        Ok(())
    }

    // Test IDs: TDB-007
    #[test]
    fn unmigrated_tables_are_inferred_and_adopted() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("sellkit-legacy-{}.sqlite3", Ulid::new()));
        {
            let store = SqliteStore::open(&db_path)?;
            store.conn.execute_batch(MIGRATION_001_SQL)?;
        }

        let mut store = SqliteStore::open(&db_path)?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.inferred_from_legacy);

        store.set_flag(&StorageKey::purchased(&offer("legacy")?))?;
        store.migrate()?;
        assert!(store.get_flag(&StorageKey::purchased(&offer("legacy")?))?);
        assert!(!store.schema_status()?.inferred_from_legacy);
        drop(store);

        let backup_path = db_path.with_extension("backup.sqlite3");
        SqliteStore::open(&db_path)?.backup_database(&backup_path)?;
        let mut restored = SqliteStore::open(Path::new(":memory:"))?;
        restored.restore_database(&backup_path)?;
        assert!(restored.get_flag(&StorageKey::purchased(&offer("legacy")?))?);
        assert_eq!(restored.schema_status()?.current_version, LATEST_SCHEMA_VERSION);
        drop(restored);

        for path in [db_path.clone(), backup_path] {
            for suffix in ["", "-wal", "-shm"] {
                let candidate = std::path::PathBuf::from(format!("{}{}", path.display(), suffix));
                if candidate.exists() {
                    fs::remove_file(&candidate).with_context(|| {
                        format!("failed to cleanup sqlite file {}", candidate.display())
                    })?;
                }
            }
        }
        Ok(())
    }

    // Test IDs: TDB-008
    #[test]
    fn writes_are_stamped_from_the_store_clock() -> Result<()> {
        let start = OffsetDateTime::UNIX_EPOCH + Duration::days(20_000);
        let clock = ManualClock::new(start);
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.set_clock(clock.clone());
        store.migrate()?;

        let applied_at: String = store.conn.query_row(
            "SELECT applied_at FROM schema_migrations WHERE version = 1",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(applied_at, rfc3339(start)?);

        let id = offer("offer-8")?;
        store.set_flag(&StorageKey::purchased(&id))?;
        assert_eq!(store.entries()?[0].updated_at, rfc3339(start)?);

        clock.advance(Duration::minutes(5));
        store.set_timestamp(&StorageKey::seen_at(&id), clock.now())?;
        let entries = store.entries()?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].field, Field::Purchased);
        assert_eq!(entries[0].updated_at, rfc3339(start)?);
        assert_eq!(entries[1].field, Field::SeenAt);
        assert_eq!(entries[1].updated_at, rfc3339(start + Duration::minutes(5))?);
        Ok(())
    }
}
