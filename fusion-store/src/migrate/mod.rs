//! Ordered, checksum-verified, lock-coordinated schema migrations.
//!
//! The registry lives in two tables: `schema_migrations` (one row per applied
//! version) and `migration_lock` (single-row advisory lock). Each migration
//! applies inside its own transaction; a failure rolls that transaction back
//! and leaves the registry untouched.

mod file;

pub use file::{checksum, generate, load_dir, parse_file, MigrationFile, ROLLBACK_MARKER};

use std::path::PathBuf;
use std::time::Instant;

use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement, TransactionTrait};
use tracing::{info, instrument, warn};

use fusion_core::{time::now_millis, StoreError, StoreResult};

use crate::postgres::map_db_err;

/// A lock held longer than this is considered abandoned and force-released
/// once.
const STALE_LOCK_MS: i64 = 10 * 60 * 1000;

/// One row of `schema_migrations`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    /// Applied version.
    pub version: i64,
    /// Name recorded at apply time.
    pub name: String,
    /// Description recorded at apply time.
    pub description: String,
    /// Checksum recorded at apply time.
    pub checksum: String,
    /// When it was applied, milliseconds since epoch.
    pub applied_at: i64,
    /// How long the apply took.
    pub execution_time_ms: i64,
    /// Who applied it.
    pub applied_by: String,
}

/// Outcome of [`Migrator::check_integrity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    /// No issues found.
    pub healthy: bool,
    /// Highest applied version, if any.
    pub current_version: Option<i64>,
    /// Human-readable findings.
    pub issues: Vec<String>,
}

/// Applies ordered SQL-file migrations to the truth store.
#[derive(Debug)]
pub struct Migrator {
    db: DatabaseConnection,
    dir: PathBuf,
    applied_by: String,
}

impl Migrator {
    /// A migrator reading files from `dir`.
    pub fn new(db: DatabaseConnection, dir: impl Into<PathBuf>, applied_by: impl Into<String>) -> Self {
        Self {
            db,
            dir: dir.into(),
            applied_by: applied_by.into(),
        }
    }

    /// Idempotently create the registry tables.
    pub async fn initialize(&self) -> StoreResult<()> {
        self.db
            .execute_unprepared(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                     version BIGINT PRIMARY KEY,
                     name TEXT NOT NULL,
                     description TEXT NOT NULL DEFAULT '',
                     checksum TEXT NOT NULL,
                     applied_at BIGINT NOT NULL,
                     execution_time_ms BIGINT NOT NULL,
                     applied_by TEXT NOT NULL
                 )",
            )
            .await
            .map_err(map_db_err)?;
        self.db
            .execute_unprepared(
                "CREATE TABLE IF NOT EXISTS migration_lock (
                     id INTEGER PRIMARY KEY CHECK (id = 1),
                     locked_at BIGINT NOT NULL,
                     locked_by TEXT NOT NULL,
                     process_id BIGINT NOT NULL
                 )",
            )
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    /// Apply every pending migration in version order.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn migrate(&self) -> StoreResult<u32> {
        self.initialize().await?;
        self.acquire_lock().await?;
        let outcome = self.migrate_locked().await;
        // Best effort; a failed release leaves a stale lock that the next
        // run reclaims after the staleness window.
        if let Err(err) = self.release_lock().await {
            warn!(%err, "failed to release migration lock");
        }
        outcome
    }

    async fn migrate_locked(&self) -> StoreResult<u32> {
        let files = load_dir(&self.dir)?;
        let applied = self.applied_migrations().await?;

        // A checksum mismatch between disk and registry is fatal here.
        if let Some(issue) = checksum_issues(&files, &applied).into_iter().next() {
            return Err(StoreError::Migration(issue));
        }

        let mut count = 0u32;
        for file in files
            .iter()
            .filter(|f| !applied.iter().any(|a| a.version == f.version))
        {
            let started = Instant::now();
            let txn = self.db.begin().await.map_err(map_db_err)?;
            if let Err(err) = txn.execute_unprepared(&file.up).await {
                txn.rollback().await.map_err(map_db_err)?;
                return Err(StoreError::Migration(format!(
                    "migration {} failed: {}",
                    file.version,
                    err
                )));
            }
            let elapsed_ms = started.elapsed().as_millis() as i64;
            txn.execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "INSERT INTO schema_migrations \
                 (version, name, description, checksum, applied_at, execution_time_ms, applied_by) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                [
                    file.version.into(),
                    file.name.clone().into(),
                    file.description.clone().into(),
                    file.checksum.clone().into(),
                    now_millis().into(),
                    elapsed_ms.into(),
                    self.applied_by.clone().into(),
                ],
            ))
            .await
            .map_err(map_db_err)?;
            txn.commit().await.map_err(map_db_err)?;
            info!(version = file.version, name = %file.name, elapsed_ms, "applied migration");
            count += 1;
        }
        Ok(count)
    }

    /// Roll back every applied migration above `target_version`, newest
    /// first, each in its own transaction.
    #[instrument(skip(self))]
    pub async fn rollback(&self, target_version: i64) -> StoreResult<u32> {
        self.initialize().await?;
        self.acquire_lock().await?;
        let outcome = self.rollback_locked(target_version).await;
        if let Err(err) = self.release_lock().await {
            warn!(%err, "failed to release migration lock");
        }
        outcome
    }

    async fn rollback_locked(&self, target_version: i64) -> StoreResult<u32> {
        let files = load_dir(&self.dir)?;
        let mut applied = self.applied_migrations().await?;
        applied.sort_by_key(|a| std::cmp::Reverse(a.version));

        let mut count = 0u32;
        for record in applied.iter().filter(|a| a.version > target_version) {
            let file = files
                .iter()
                .find(|f| f.version == record.version)
                .ok_or_else(|| {
                    StoreError::Migration(format!(
                        "no migration file for applied version {}",
                        record.version
                    ))
                })?;
            let txn = self.db.begin().await.map_err(map_db_err)?;
            if !file.down.is_empty() {
                if let Err(err) = txn.execute_unprepared(&file.down).await {
                    txn.rollback().await.map_err(map_db_err)?;
                    return Err(StoreError::Migration(format!(
                        "rollback of {} failed: {}",
                        file.version,
                        err
                    )));
                }
            }
            txn.execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "DELETE FROM schema_migrations WHERE version = $1",
                [record.version.into()],
            ))
            .await
            .map_err(map_db_err)?;
            txn.commit().await.map_err(map_db_err)?;
            info!(version = file.version, "rolled back migration");
            count += 1;
        }
        Ok(count)
    }

    /// Compare disk against the registry. Checksum mismatches and version
    /// gaps are advisory here; `migrate` treats mismatches as fatal.
    pub async fn check_integrity(&self) -> StoreResult<IntegrityReport> {
        self.initialize().await?;
        let files = load_dir(&self.dir)?;
        let applied = self.applied_migrations().await?;
        Ok(integrity_report(&files, &applied))
    }

    /// Emit a template file with a fresh timestamp version.
    pub fn generate(&self, name: &str, description: &str) -> StoreResult<PathBuf> {
        generate(&self.dir, name, description)
    }

    async fn applied_migrations(&self) -> StoreResult<Vec<AppliedMigration>> {
        let rows = self
            .db
            .query_all(Statement::from_string(
                DbBackend::Postgres,
                "SELECT version, name, description, checksum, applied_at, \
                 execution_time_ms, applied_by \
                 FROM schema_migrations ORDER BY version"
                    .to_string(),
            ))
            .await
            .map_err(map_db_err)?;
        rows.into_iter()
            .map(|row| {
                Ok(AppliedMigration {
                    version: row.try_get("", "version").map_err(map_db_err)?,
                    name: row.try_get("", "name").map_err(map_db_err)?,
                    description: row.try_get("", "description").map_err(map_db_err)?,
                    checksum: row.try_get("", "checksum").map_err(map_db_err)?,
                    applied_at: row.try_get("", "applied_at").map_err(map_db_err)?,
                    execution_time_ms: row
                        .try_get("", "execution_time_ms")
                        .map_err(map_db_err)?,
                    applied_by: row.try_get("", "applied_by").map_err(map_db_err)?,
                })
            })
            .collect()
    }

    async fn acquire_lock(&self) -> StoreResult<()> {
        let pid = std::process::id() as i64;
        if self.try_insert_lock(pid).await? {
            return Ok(());
        }
        // Check for a stale holder and force-release once.
        let row = self
            .db
            .query_one(Statement::from_string(
                DbBackend::Postgres,
                "SELECT locked_at, locked_by FROM migration_lock WHERE id = 1".to_string(),
            ))
            .await
            .map_err(map_db_err)?;
        if let Some(row) = row {
            let locked_at: i64 = row.try_get("", "locked_at").map_err(map_db_err)?;
            let locked_by: String = row.try_get("", "locked_by").map_err(map_db_err)?;
            if now_millis() - locked_at > STALE_LOCK_MS {
                warn!(locked_by, locked_at, "force-releasing stale migration lock");
                self.db
                    .execute(Statement::from_sql_and_values(
                        DbBackend::Postgres,
                        "DELETE FROM migration_lock WHERE id = 1 AND locked_at = $1",
                        [locked_at.into()],
                    ))
                    .await
                    .map_err(map_db_err)?;
                if self.try_insert_lock(pid).await? {
                    return Ok(());
                }
            }
            return Err(StoreError::Migration(format!(
                "migration lock held by {locked_by} since {locked_at}"
            )));
        }
        // The holder released between our insert and select; one more try.
        if self.try_insert_lock(pid).await? {
            return Ok(());
        }
        Err(StoreError::Migration("could not acquire migration lock".into()))
    }

    async fn try_insert_lock(&self, pid: i64) -> StoreResult<bool> {
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "INSERT INTO migration_lock (id, locked_at, locked_by, process_id) \
                 VALUES (1, $1, $2, $3) ON CONFLICT (id) DO NOTHING",
                [
                    now_millis().into(),
                    self.applied_by.clone().into(),
                    pid.into(),
                ],
            ))
            .await
            .map_err(map_db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self) -> StoreResult<()> {
        self.db
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "DELETE FROM migration_lock WHERE id = 1 AND locked_by = $1",
                [self.applied_by.clone().into()],
            ))
            .await
            .map_err(map_db_err)?;
        Ok(())
    }
}

fn checksum_issues(files: &[MigrationFile], applied: &[AppliedMigration]) -> Vec<String> {
    let mut issues = Vec::new();
    for record in applied {
        if let Some(file) = files.iter().find(|f| f.version == record.version) {
            if file.checksum != record.checksum {
                issues.push(format!("checksum mismatch for {}", record.version));
            }
        }
    }
    issues
}

/// Pure integrity evaluation over the parsed files and the registry rows.
pub fn integrity_report(files: &[MigrationFile], applied: &[AppliedMigration]) -> IntegrityReport {
    let mut issues = checksum_issues(files, applied);
    let current_version = applied.iter().map(|a| a.version).max();
    if let Some(max) = current_version {
        for file in files.iter().filter(|f| f.version < max) {
            if !applied.iter().any(|a| a.version == file.version) {
                issues.push(format!(
                    "gap: version {} is not applied but {} is",
                    file.version, max
                ));
            }
        }
    }
    IntegrityReport {
        healthy: issues.is_empty(),
        current_version,
        issues,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn file(version: i64, checksum: &str) -> MigrationFile {
        MigrationFile {
            version,
            name: format!("m{version}"),
            description: String::new(),
            up: "SELECT 1;".into(),
            down: String::new(),
            checksum: checksum.into(),
            path: PathBuf::from(format!("{version}_m{version}.sql")),
        }
    }

    fn applied(version: i64, checksum: &str) -> AppliedMigration {
        AppliedMigration {
            version,
            name: format!("m{version}"),
            description: String::new(),
            checksum: checksum.into(),
            applied_at: 0,
            execution_time_ms: 1,
            applied_by: "test".into(),
        }
    }

    #[test]
    fn detects_checksum_mismatch() {
        let files = vec![file(1, "aa"), file(2, "bb"), file(3, "cc")];
        let rows = vec![applied(1, "aa"), applied(2, "bb"), applied(3, "tampered")];
        let report = integrity_report(&files, &rows);
        assert!(!report.healthy);
        assert_eq!(report.current_version, Some(3));
        assert_eq!(report.issues, vec!["checksum mismatch for 3".to_string()]);
    }

    #[test]
    fn detects_gaps_below_max() {
        let files = vec![file(1, "aa"), file(2, "bb"), file(3, "cc")];
        let rows = vec![applied(1, "aa"), applied(3, "cc")];
        let report = integrity_report(&files, &rows);
        assert!(!report.healthy);
        assert_eq!(
            report.issues,
            vec!["gap: version 2 is not applied but 3 is".to_string()]
        );
    }

    #[test]
    fn healthy_when_registry_matches_disk() {
        let files = vec![file(1, "aa"), file(2, "bb")];
        let rows = vec![applied(1, "aa"), applied(2, "bb")];
        let report = integrity_report(&files, &rows);
        assert!(report.healthy);
        assert_eq!(report.current_version, Some(2));
        assert!(report.issues.is_empty());
    }

    #[test]
    fn unapplied_tail_is_not_a_gap() {
        // A pending migration above the max applied version is normal.
        let files = vec![file(1, "aa"), file(2, "bb")];
        let rows = vec![applied(1, "aa")];
        let report = integrity_report(&files, &rows);
        assert!(report.healthy);
    }
}
