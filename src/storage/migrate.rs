//! Versioned schema migrations on top of `sqlx::migrate`
//!
//! The built-in set under `migrations/sqlite` is compiled into the binary with
//! `sqlx::migrate!`; operators can append more reversible `NNNN_name.up.sql` /
//! `.down.sql` pairs from `storage.migrations_path`. sqlx records applied
//! versions in `_sqlx_migrations`. A single row in `schema_lock` keeps two
//! processes from migrating the same database at once.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use sqlx::SqlitePool;
use sqlx::error::BoxDynError;
use sqlx::migrate::{Migrate, MigrateError, Migration, MigrationSource};
use tracing::{info, instrument, warn};

use crate::config::StorageConfig;
use crate::error::{Error, ErrorKind, Result};

static BUILTIN: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Locks older than this are assumed to belong to a crashed process
const STALE_LOCK_NANOS: i64 = 10 * 60 * 1_000_000_000;

const LOCK_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_lock (
        id        INTEGER PRIMARY KEY NOT NULL CHECK (id = 1),
        owner     TEXT NOT NULL,
        locked_at INTEGER NOT NULL
    );
"#;

fn migrate_error(op: &'static str, err: MigrateError) -> Error {
    match err {
        MigrateError::Execute(e) => Error::from_sqlx(op, e),
        other => Error::internal(op, other.to_string()).with_source(other),
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Already-resolved migrations handed back to sqlx
#[derive(Debug)]
struct MigrationSet(Vec<Migration>);

impl<'s> MigrationSource<'s> for MigrationSet {
    fn resolve(self) -> BoxFuture<'s, std::result::Result<Vec<Migration>, BoxDynError>> {
        Box::pin(async move { Ok(self.0) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationTarget {
    Latest,
    /// Schema exactly at this version; 0 reverts everything
    Version(i64),
    /// This many versions below the newest migration the build knows
    Rollback(u32),
}

impl MigrationTarget {
    pub fn from_config(config: &StorageConfig) -> Self {
        if config.rollback_steps > 0 {
            MigrationTarget::Rollback(config.rollback_steps)
        } else if let Some(version) = config.target_version {
            MigrationTarget::Version(version.into())
        } else {
            MigrationTarget::Latest
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from: i64,
    pub to: i64,
    pub applied: Vec<i64>,
    pub reverted: Vec<i64>,
}

pub struct Migrator {
    migrations: Vec<Migration>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("versions", &self.versions())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl Migrator {
    pub fn new(mut migrations: Vec<Migration>) -> Result<Self> {
        const OP: &str = "migrate.new";

        migrations.sort_by_key(|m| (m.version, m.migration_type.is_down_migration()));
        let mut seen = BTreeSet::new();
        for migration in migrations.iter().filter(|m| !m.migration_type.is_down_migration()) {
            if !seen.insert(migration.version) {
                return Err(Error::invalid_config(
                    OP,
                    format!("duplicate migration version {}", migration.version),
                ));
            }
        }
        if seen.first().is_some_and(|v| *v <= 0) {
            return Err(Error::invalid_config(OP, "migration versions start at 1"));
        }

        Ok(Self {
            migrations,
            lock_timeout: Duration::from_secs(30),
        })
    }

    /// The schema shipped with this build
    pub fn embedded() -> Result<Self> {
        Self::new(BUILTIN.iter().cloned().collect())
    }

    /// Built-in migrations plus any found in `migrations_path`
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        let mut migrations: Vec<Migration> = BUILTIN.iter().cloned().collect();
        if let Some(dir) = &config.migrations_path {
            let extra = sqlx::migrate::Migrator::new(dir.as_path())
                .await
                .map_err(|e| migrate_error("migrate.load_dir", e))?;
            info!("loaded {} extra migrations from {}", extra.iter().count() / 2, dir.display());
            migrations.extend(extra.iter().cloned());
        }
        Self::new(migrations)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Up-migration versions in order
    pub fn versions(&self) -> Vec<i64> {
        self.migrations
            .iter()
            .filter(|m| !m.migration_type.is_down_migration())
            .map(|m| m.version)
            .collect()
    }

    pub fn latest_version(&self) -> i64 {
        self.versions().last().copied().unwrap_or(0)
    }

    /// Schema version `target` resolves to; `None` means everything
    pub fn resolve(&self, target: MigrationTarget) -> Result<Option<i64>> {
        const OP: &str = "migrate.resolve";

        let versions = self.versions();
        match target {
            MigrationTarget::Latest => Ok(None),
            MigrationTarget::Version(0) => Ok(Some(0)),
            MigrationTarget::Version(version) if versions.contains(&version) => Ok(Some(version)),
            MigrationTarget::Version(version) => Err(Error::invalid_config(
                OP,
                format!("unknown target migration {version}"),
            )),
            MigrationTarget::Rollback(steps) => {
                let steps = steps as usize;
                if steps > versions.len() {
                    return Err(Error::invalid_config(
                        OP,
                        format!("cannot roll back {steps} steps, only {} migrations known", versions.len()),
                    ));
                }
                Ok(Some(match versions.len() - steps {
                    0 => 0,
                    keep => versions[keep - 1],
                }))
            }
        }
    }

    async fn sqlx_migrator(&self, up_to: Option<i64>) -> Result<sqlx::migrate::Migrator> {
        let migrations = self
            .migrations
            .iter()
            .filter(|m| up_to.is_none_or(|limit| m.version <= limit))
            .cloned()
            .collect();
        let mut migrator = sqlx::migrate::Migrator::new(MigrationSet(migrations))
            .await
            .map_err(|e| migrate_error("migrate.build", e))?;
        if up_to.is_some() {
            migrator.set_ignore_missing(true);
        }
        Ok(migrator)
    }

    /// Versions sqlx has recorded as applied
    pub async fn applied_versions(&self, pool: &SqlitePool) -> Result<BTreeSet<i64>> {
        const OP: &str = "migrate.applied_versions";

        let mut conn = pool.acquire().await.map_err(|e| Error::from_sqlx(OP, e))?;
        conn.ensure_migrations_table()
            .await
            .map_err(|e| migrate_error(OP, e))?;
        let applied = conn
            .list_applied_migrations()
            .await
            .map_err(|e| migrate_error(OP, e))?;
        Ok(applied.into_iter().map(|m| m.version).collect())
    }

    /// Bring the database to `target` under the cooperative lock
    ///
    /// Every target resolves to a fixed schema version, so running the same
    /// target again is a no-op.
    #[instrument(skip_all, fields(?target))]
    pub async fn run(&self, pool: &SqlitePool, target: MigrationTarget) -> Result<MigrationReport> {
        let up_to = self.resolve(target)?;

        sqlx::raw_sql(LOCK_TABLE)
            .execute(pool)
            .await
            .map_err(|e| Error::from_sqlx("migrate.bootstrap", e))?;

        let owner = uuid::Uuid::new_v4().to_string();
        self.acquire_lock(pool, &owner).await?;

        let result = self.run_locked(pool, up_to).await;

        if let Err(e) = release_lock(pool, &owner).await {
            warn!("failed to release migration lock: {e}");
        }
        result
    }

    async fn run_locked(&self, pool: &SqlitePool, up_to: Option<i64>) -> Result<MigrationReport> {
        let before = self.applied_versions(pool).await?;
        if let Some(unknown) = before.iter().find(|v| **v > self.latest_version()) {
            warn!("database is at migration {unknown}, newer than this build");
        }

        if let Some(target) = up_to {
            if before.iter().any(|v| *v > target) {
                info!("reverting schema to version {target}");
                self.sqlx_migrator(None)
                    .await?
                    .undo(pool, target)
                    .await
                    .map_err(|e| migrate_error("migrate.undo", e))?;
            }
        }
        self.sqlx_migrator(up_to)
            .await?
            .run(pool)
            .await
            .map_err(|e| migrate_error("migrate.run", e))?;

        let after = self.applied_versions(pool).await?;
        let report = MigrationReport {
            from: before.last().copied().unwrap_or(0),
            to: after.last().copied().unwrap_or(0),
            applied: after.difference(&before).copied().collect(),
            reverted: before.difference(&after).copied().collect(),
        };
        if report.applied.is_empty() && report.reverted.is_empty() {
            info!("schema is up to date at version {}", report.to);
        } else {
            info!("schema migrated from {} to {}", report.from, report.to);
        }
        Ok(report)
    }

    async fn acquire_lock(&self, pool: &SqlitePool, owner: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            let inserted = sqlx::query("INSERT INTO schema_lock (id, owner, locked_at) VALUES (1, ?, ?)")
                .bind(owner)
                .bind(now_nanos())
                .execute(pool)
                .await;

            match inserted {
                Ok(_) => return Ok(()),
                Err(e) => {
                    let err = Error::from_sqlx("migrate.lock", e);
                    if err.kind() != ErrorKind::Conflict {
                        return Err(err);
                    }
                }
            }

            let holder: Option<(String, i64)> =
                sqlx::query_as("SELECT owner, locked_at FROM schema_lock WHERE id = 1")
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| Error::from_sqlx("migrate.lock", e))?;
            if let Some((holder, locked_at)) = holder {
                if now_nanos().saturating_sub(locked_at) > STALE_LOCK_NANOS {
                    warn!("breaking stale migration lock held by {holder}");
                    release_lock(pool, &holder).await?;
                    continue;
                }
            }

            if started.elapsed() > self.lock_timeout {
                return Err(Error::new(
                    ErrorKind::Conflict,
                    "migrate.lock",
                    "another process is migrating this database",
                ));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

async fn release_lock(pool: &SqlitePool, owner: &str) -> Result<()> {
    sqlx::query("DELETE FROM schema_lock WHERE id = 1 AND owner = ?")
        .bind(owner)
        .execute(pool)
        .await
        .map_err(|e| Error::from_sqlx("migrate.unlock", e))?;
    Ok(())
}
