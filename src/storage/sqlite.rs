//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers are not blocked while the ingestion path writes
//! - **Connection pooling**: sqlx pool sized from `storage.max_connections`
//! - **Migrations**: Versioned schema applied on connect when `auto_migrate` is set
//! - **Statement cache**: Fixed statements are built once and kept prepared
//!
//! ## Limitations
//!
//! - **Concurrency**: One writer at a time; cleanup runs in small batches so
//!   ingestion is never locked out for long
//! - **Distributed**: Single-machine only

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::backend::{
    CONSTRAINED_CLEANUP_BATCH, CleanupSummary, DEFAULT_CLEANUP_BATCH, IpChangeSummary, Page,
    QueryParams, SortOrder, StorageBackend,
};
use super::cache::StatementCache;
use super::migrate::{MigrationReport, MigrationTarget, Migrator};
use super::query::{Dialect, Order, QueryBuilder, SqlValue};
use super::schema::{
    AGENT_COLUMNS, IP_CHANGE_COLUMNS, METRIC_COLUMNS, decode_addrs, encode_addrs, from_nanos,
    summarize_changes, to_nanos,
};
use super::stats::{QueryStats, StorageStats};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::types::{AgentInfo, AgentStatus, IpChange, MetricsEnvelope};

const DIALECT: Dialect = Dialect::Sqlite;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_args(mut query: SqliteQuery<'_>, args: Vec<SqlValue>) -> SqliteQuery<'_> {
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Real(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Bool(v) => query.bind(v),
        };
    }
    query
}

fn is_memory_dsn(dsn: &str) -> bool {
    dsn == ":memory:" || dsn.starts_with("sqlite::memory:") || dsn.contains("mode=memory")
}

/// SQLite storage backend
pub struct SqliteBackend {
    pool: SqlitePool,
    dsn: String,
    cache: StatementCache,
    stats: QueryStats,
    query_timeout: Duration,
    batch_size: usize,
    batch_pause: Duration,
}

impl SqliteBackend {
    /// Open (or create) a database file with default settings and migrate it
    ///
    /// ```no_run
    /// # use wameter::storage::sqlite::SqliteBackend;
    /// # async fn example() -> wameter::Result<()> {
    /// let backend = SqliteBackend::new("./wameter.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(db_path: impl AsRef<std::path::Path>) -> Result<Self> {
        let config = StorageConfig {
            dsn: db_path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        };
        Self::connect(&config).await
    }

    /// Build the pool from configuration, then migrate when `auto_migrate` is set
    #[instrument(skip_all, fields(dsn = %config.dsn))]
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        const OP: &str = "sqlite.connect";

        let memory = is_memory_dsn(&config.dsn);
        let options = if memory {
            SqliteConnectOptions::from_str("sqlite::memory:")
        } else if config.dsn.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(&config.dsn)
        } else {
            Ok(SqliteConnectOptions::new().filename(&config.dsn))
        }
        .map_err(|e| Error::invalid_config(OP, "invalid sqlite dsn").with_source(e))?
        .create_if_missing(true)
        .journal_mode(if memory {
            SqliteJournalMode::Memory
        } else {
            SqliteJournalMode::Wal
        })
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30));

        // Every connection to `:memory:` is a separate database, so pin one.
        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(config.query_timeout);
        pool_options = if memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options
                .max_connections(config.max_connections)
                .min_connections(config.max_idle_conns.min(config.max_connections))
                .max_lifetime(config.conn_max_lifetime)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?;
        info!("SQLite connection pool created");

        let batch_size = config.max_batch_size.unwrap_or(if memory {
            CONSTRAINED_CLEANUP_BATCH
        } else {
            DEFAULT_CLEANUP_BATCH
        });

        let backend = Self {
            pool,
            dsn: config.dsn.clone(),
            cache: StatementCache::new(config.statement_cache),
            stats: QueryStats::new(config.enable_metrics, config.slow_query_time),
            query_timeout: config.query_timeout,
            batch_size,
            batch_pause: config.batch_pause,
        };

        if config.auto_migrate {
            let migrator = Migrator::from_config(config).await?;
            backend
                .migrate(&migrator, MigrationTarget::from_config(config))
                .await?;
        }

        Ok(backend)
    }

    pub async fn migrate(&self, migrator: &Migrator, target: MigrationTarget) -> Result<MigrationReport> {
        migrator.run(&self.pool, target).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    /// Rows deleted per cleanup batch
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn statement(&self, key: &'static str, build: impl FnOnce() -> String) -> Arc<str> {
        self.cache.get_or_prepare(key, build)
    }

    fn cached<'q>(&self, sql: &'q str) -> SqliteQuery<'q> {
        sqlx::query(sql).persistent(self.cache.enabled())
    }

    fn decode_agent(row: &SqliteRow) -> Result<AgentInfo> {
        const OP: &str = "agents.decode";
        let status: String = row.try_get("status").map_err(|e| Error::from_sqlx(OP, e))?;
        let port: Option<i64> = row.try_get("port").map_err(|e| Error::from_sqlx(OP, e))?;
        Ok(AgentInfo {
            id: row.try_get("id").map_err(|e| Error::from_sqlx(OP, e))?,
            hostname: row.try_get("hostname").map_err(|e| Error::from_sqlx(OP, e))?,
            version: row.try_get("version").map_err(|e| Error::from_sqlx(OP, e))?,
            status: status.parse()?,
            last_seen: from_nanos(row.try_get("last_seen").map_err(|e| Error::from_sqlx(OP, e))?),
            registered_at: from_nanos(
                row.try_get("registered_at")
                    .map_err(|e| Error::from_sqlx(OP, e))?,
            ),
            updated_at: from_nanos(row.try_get("updated_at").map_err(|e| Error::from_sqlx(OP, e))?),
            port: port.and_then(|p| u16::try_from(p).ok()),
        })
    }

    fn decode_envelope(row: &SqliteRow) -> Result<MetricsEnvelope> {
        const OP: &str = "metrics.decode";
        let data: String = row.try_get("data").map_err(|e| Error::from_sqlx(OP, e))?;
        let created_at: i64 = row.try_get("created_at").map_err(|e| Error::from_sqlx(OP, e))?;
        let mut envelope: MetricsEnvelope = serde_json::from_str(&data).map_err(|e| {
            Error::internal(OP, "stored envelope is not valid JSON").with_source(e)
        })?;
        envelope.created_at = Some(from_nanos(created_at));
        Ok(envelope)
    }

    fn decode_ip_change(row: &SqliteRow) -> Result<IpChange> {
        const OP: &str = "ip_changes.decode";
        let get_text = |column: &str| -> Result<String> {
            row.try_get(column).map_err(|e| Error::from_sqlx(OP, e))
        };
        let get_int = |column: &str| -> Result<i64> {
            row.try_get(column).map_err(|e| Error::from_sqlx(OP, e))
        };
        Ok(IpChange {
            agent_id: get_text("agent_id")?,
            interface_name: get_text("interface_name")?,
            version: get_text("version")?.parse()?,
            is_external: get_int("is_external")? != 0,
            old_addrs: decode_addrs(&get_text("old_addrs")?)?,
            new_addrs: decode_addrs(&get_text("new_addrs")?)?,
            action: get_text("action")?.parse()?,
            reason: get_text("reason")?,
            timestamp: from_nanos(get_int("timestamp")?),
            created_at: Some(from_nanos(get_int("created_at")?)),
        })
    }

    fn metric_args(envelope: &MetricsEnvelope, created_at: i64) -> Result<Vec<SqlValue>> {
        const OP: &str = "metrics.save";
        let mut stored = envelope.clone();
        stored.created_at = None;
        Ok(vec![
            SqlValue::Text(envelope.agent_id.clone()),
            SqlValue::Int(to_nanos(OP, &envelope.timestamp)?),
            SqlValue::Int(to_nanos(OP, &envelope.collected_at)?),
            SqlValue::Int(to_nanos(OP, &envelope.reported_at)?),
            SqlValue::Text(serde_json::to_string(&stored)?),
            SqlValue::Int(created_at),
        ])
    }

    fn insert_metric_sql(&self) -> Arc<str> {
        self.statement("metrics.insert", || {
            QueryBuilder::insert(DIALECT, "metrics", METRIC_COLUMNS).build().sql
        })
    }

    fn insert_ip_change_sql(&self) -> Arc<str> {
        self.statement("ip_changes.insert", || {
            QueryBuilder::insert(DIALECT, "ip_changes", IP_CHANGE_COLUMNS)
                .build()
                .sql
        })
    }

    fn ip_change_args(agent_id: &str, change: &IpChange, created_at: i64) -> Result<Vec<SqlValue>> {
        const OP: &str = "ip_changes.save";
        change.validate()?;
        Ok(vec![
            SqlValue::Text(agent_id.to_string()),
            SqlValue::Text(change.interface_name.clone()),
            SqlValue::Text(change.version.as_str().to_string()),
            SqlValue::Bool(change.is_external),
            SqlValue::Text(encode_addrs(&change.old_addrs)?),
            SqlValue::Text(encode_addrs(&change.new_addrs)?),
            SqlValue::Text(change.action.as_str().to_string()),
            SqlValue::Text(change.reason.clone()),
            SqlValue::Int(to_nanos(OP, &change.timestamp)?),
            SqlValue::Int(created_at),
        ])
    }

    async fn fetch_ip_changes(&self, op: &'static str, query: QueryBuilder) -> Result<Vec<IpChange>> {
        let built = query.build();
        let rows = bind_args(sqlx::query(&built.sql), built.args)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::from_sqlx(op, e))?;
        rows.iter().map(Self::decode_ip_change).collect()
    }

    fn ip_change_select(agent_id: &str) -> QueryBuilder {
        let mut columns = vec!["id"];
        columns.extend_from_slice(IP_CHANGE_COLUMNS);
        QueryBuilder::select(DIALECT, "ip_changes", &columns).where_eq("agent_id", agent_id)
    }
}

fn now_nanos(op: &'static str) -> Result<i64> {
    to_nanos(op, &Utc::now())
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn driver(&self) -> &'static str {
        "sqlite"
    }

    #[instrument(skip(self, agent), fields(agent_id = %agent.id))]
    async fn register_or_update_agent(&self, agent: &AgentInfo) -> Result<()> {
        const OP: &str = "agents.upsert";
        let sql = self.statement(OP, || {
            QueryBuilder::insert(DIALECT, "agents", AGENT_COLUMNS)
                .on_conflict_update(
                    &["id"],
                    &["hostname", "version", "status", "port", "last_seen", "updated_at"],
                )
                .build()
                .sql
        });

        self.stats
            .observe(OP, self.query_timeout, async {
                self.cached(&sql)
                    .bind(&agent.id)
                    .bind(&agent.hostname)
                    .bind(&agent.version)
                    .bind(agent.status.as_str())
                    .bind(agent.port.map(i64::from))
                    .bind(to_nanos(OP, &agent.last_seen)?)
                    .bind(to_nanos(OP, &agent.registered_at)?)
                    .bind(to_nanos(OP, &agent.updated_at)?)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| Error::from_sqlx(OP, e))?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn update_agent_status(&self, id: &str, status: AgentStatus, now: DateTime<Utc>) -> Result<()> {
        const OP: &str = "agents.update_status";
        let sql = if status == AgentStatus::Online {
            self.statement("agents.update_status_seen", || {
                QueryBuilder::update(DIALECT, "agents")
                    .set("status", SqlValue::Null)
                    .set("last_seen", SqlValue::Null)
                    .set("updated_at", SqlValue::Null)
                    .where_eq("id", SqlValue::Null)
                    .build()
                    .sql
            })
        } else {
            self.statement(OP, || {
                QueryBuilder::update(DIALECT, "agents")
                    .set("status", SqlValue::Null)
                    .set("updated_at", SqlValue::Null)
                    .where_eq("id", SqlValue::Null)
                    .build()
                    .sql
            })
        };

        self.stats
            .observe(OP, self.query_timeout, async {
                let now = to_nanos(OP, &now)?;
                let mut query = self.cached(&sql).bind(status.as_str());
                if status == AgentStatus::Online {
                    query = query.bind(now);
                }
                let result = query
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| Error::from_sqlx(OP, e))?;
                if result.rows_affected() == 0 {
                    return Err(Error::not_found(OP, format!("agent '{id}' not found")));
                }
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get_agent(&self, id: &str) -> Result<AgentInfo> {
        const OP: &str = "agents.get";
        let sql = self.statement(OP, || {
            QueryBuilder::select(DIALECT, "agents", AGENT_COLUMNS)
                .where_eq("id", SqlValue::Null)
                .build()
                .sql
        });

        self.stats
            .observe(OP, self.query_timeout, async {
                let row = self
                    .cached(&sql)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| Error::from_sqlx(OP, e))?
                    .ok_or_else(|| Error::not_found(OP, format!("agent '{id}' not found")))?;
                Self::decode_agent(&row)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn list_agents(&self, page: Option<Page>) -> Result<Vec<AgentInfo>> {
        const OP: &str = "agents.list";
        let mut query = QueryBuilder::select(DIALECT, "agents", AGENT_COLUMNS)
            .order_by("hostname", Order::Asc)
            .order_by("id", Order::Asc);
        if let Some(page) = page {
            query = query.limit(page.limit as u64).offset(page.offset as u64);
        }
        let built = query.build();

        self.stats
            .observe(OP, self.query_timeout, async {
                let rows = bind_args(sqlx::query(&built.sql), built.args.clone())
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| Error::from_sqlx(OP, e))?;
                rows.iter().map(Self::decode_agent).collect()
            })
            .await
    }

    #[instrument(skip(self))]
    async fn delete_agent(&self, id: &str) -> Result<()> {
        const OP: &str = "agents.delete";

        self.stats
            .observe(OP, self.query_timeout, async {
                let mut tx = self.pool.begin().await.map_err(|e| Error::from_sqlx(OP, e))?;
                for (table, column) in [("metrics", "agent_id"), ("ip_changes", "agent_id")] {
                    let built = QueryBuilder::delete(DIALECT, table).where_eq(column, id).build();
                    bind_args(sqlx::query(&built.sql), built.args)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| Error::from_sqlx(OP, e))?;
                }
                let built = QueryBuilder::delete(DIALECT, "agents").where_eq("id", id).build();
                let deleted = bind_args(sqlx::query(&built.sql), built.args)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Error::from_sqlx(OP, e))?;
                if deleted.rows_affected() == 0 {
                    // Dropping `tx` rolls back the child deletes.
                    return Err(Error::not_found(OP, format!("agent '{id}' not found")));
                }
                tx.commit().await.map_err(|e| Error::from_sqlx(OP, e))?;
                info!(agent_id = id, "agent deleted");
                Ok(())
            })
            .await
    }

    #[instrument(skip(self, envelope), fields(agent_id = %envelope.agent_id))]
    async fn save_metrics(&self, envelope: &MetricsEnvelope) -> Result<()> {
        const OP: &str = "metrics.save";
        let sql = self.insert_metric_sql();
        let args = Self::metric_args(envelope, now_nanos(OP)?)?;

        self.stats
            .observe(OP, self.query_timeout, async {
                bind_args(self.cached(&sql), args)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| Error::from_sqlx(OP, e))?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self, envelopes), fields(count = envelopes.len()))]
    async fn save_metrics_batch(&self, envelopes: &[MetricsEnvelope]) -> Result<()> {
        const OP: &str = "metrics.save_batch";
        if envelopes.is_empty() {
            return Ok(());
        }

        let sql = self.insert_metric_sql();
        let created_at = now_nanos(OP)?;
        let rows = envelopes
            .iter()
            .map(|e| Self::metric_args(e, created_at))
            .collect::<Result<Vec<_>>>()?;

        self.stats
            .observe(OP, self.query_timeout, async {
                let mut tx = self.pool.begin().await.map_err(|e| Error::from_sqlx(OP, e))?;
                for args in rows {
                    bind_args(self.cached(&sql), args)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| Error::from_sqlx(OP, e))?;
                }
                tx.commit().await.map_err(|e| Error::from_sqlx(OP, e))?;
                debug!("batch insert complete");
                Ok(())
            })
            .await
    }

    #[instrument(skip(self, envelopes), fields(count = envelopes.len()))]
    async fn save_reports(&self, envelopes: &[MetricsEnvelope]) -> Result<()> {
        const OP: &str = "reports.save";
        if envelopes.is_empty() {
            return Ok(());
        }

        let metric_sql = self.insert_metric_sql();
        let change_sql = self.insert_ip_change_sql();
        let created_at = now_nanos(OP)?;
        let rows = envelopes
            .iter()
            .map(|envelope| {
                let changes = envelope
                    .payload
                    .ip_changes
                    .iter()
                    .map(|change| Self::ip_change_args(&envelope.agent_id, change, created_at))
                    .collect::<Result<Vec<_>>>()?;
                Ok((Self::metric_args(envelope, created_at)?, changes))
            })
            .collect::<Result<Vec<_>>>()?;

        self.stats
            .observe(OP, self.query_timeout, async {
                let mut tx = self.pool.begin().await.map_err(|e| Error::from_sqlx(OP, e))?;
                for (metric, changes) in rows {
                    bind_args(self.cached(&metric_sql), metric)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| Error::from_sqlx(OP, e))?;
                    for args in changes {
                        bind_args(self.cached(&change_sql), args)
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| Error::from_sqlx(OP, e))?;
                    }
                }
                tx.commit().await.map_err(|e| Error::from_sqlx(OP, e))?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn query_metrics(&self, params: &QueryParams) -> Result<Vec<MetricsEnvelope>> {
        const OP: &str = "metrics.query";

        let mut query = QueryBuilder::select(DIALECT, "metrics", &["data", "created_at"]);
        if !params.agent_ids.is_empty() {
            query = query.where_in("agent_id", params.agent_ids.iter().map(String::as_str));
        }
        if let Some(start) = &params.start {
            query = query.where_op("timestamp", ">=", to_nanos(OP, start)?);
        }
        if let Some(end) = &params.end {
            query = query.where_op("timestamp", "<=", to_nanos(OP, end)?);
        }
        let order = match params.order {
            SortOrder::Asc => Order::Asc,
            SortOrder::Desc => Order::Desc,
        };
        let built = query
            .order_by(params.order_by.column(), order)
            .order_by("id", order)
            .limit(params.effective_limit() as u64)
            .offset(params.offset as u64)
            .build();

        self.stats
            .observe(OP, self.query_timeout, async {
                let rows = bind_args(sqlx::query(&built.sql), built.args.clone())
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| Error::from_sqlx(OP, e))?;
                debug!("query returned {} envelopes", rows.len());
                rows.iter().map(Self::decode_envelope).collect()
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get_latest_metrics(&self, agent_id: &str) -> Result<MetricsEnvelope> {
        const OP: &str = "metrics.latest";
        let sql = self.statement(OP, || {
            QueryBuilder::select(DIALECT, "metrics", &["data", "created_at"])
                .where_eq("agent_id", SqlValue::Null)
                .order_by("timestamp", Order::Desc)
                .order_by("id", Order::Desc)
                .limit(1)
                .build()
                .sql
        });

        self.stats
            .observe(OP, self.query_timeout, async {
                let row = self
                    .cached(&sql)
                    .bind(agent_id)
                    .bind(1_i64)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| Error::from_sqlx(OP, e))?
                    .ok_or_else(|| {
                        Error::not_found(OP, format!("no metrics for agent '{agent_id}'"))
                    })?;
                Self::decode_envelope(&row)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get_previous_metrics(
        &self,
        agent_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<MetricsEnvelope>> {
        const OP: &str = "metrics.previous";
        let sql = self.statement(OP, || {
            QueryBuilder::select(DIALECT, "metrics", &["data", "created_at"])
                .where_eq("agent_id", SqlValue::Null)
                .where_op("collected_at", "<", SqlValue::Null)
                .order_by("collected_at", Order::Desc)
                .order_by("id", Order::Desc)
                .limit(1)
                .build()
                .sql
        });

        self.stats
            .observe(OP, self.query_timeout, async {
                let row = self
                    .cached(&sql)
                    .bind(agent_id)
                    .bind(to_nanos(OP, &before)?)
                    .bind(1_i64)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| Error::from_sqlx(OP, e))?;
                row.as_ref().map(Self::decode_envelope).transpose()
            })
            .await
    }

    #[instrument(skip(self, change), fields(interface = %change.interface_name))]
    async fn save_ip_change(&self, agent_id: &str, change: &IpChange) -> Result<()> {
        const OP: &str = "ip_changes.save";
        let sql = self.insert_ip_change_sql();
        let args = Self::ip_change_args(agent_id, change, now_nanos(OP)?)?;

        self.stats
            .observe(OP, self.query_timeout, async {
                bind_args(self.cached(&sql), args)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| Error::from_sqlx(OP, e))?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get_recent_ip_changes(&self, agent_id: &str, since: DateTime<Utc>) -> Result<Vec<IpChange>> {
        const OP: &str = "ip_changes.recent";
        let query = Self::ip_change_select(agent_id)
            .where_op("timestamp", ">=", to_nanos(OP, &since)?)
            .order_by("timestamp", Order::Desc)
            .order_by("id", Order::Desc);

        self.stats
            .observe(OP, self.query_timeout, self.fetch_ip_changes(OP, query))
            .await
    }

    #[instrument(skip(self))]
    async fn get_interface_changes(
        &self,
        agent_id: &str,
        interface: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IpChange>> {
        const OP: &str = "ip_changes.interface";
        let query = Self::ip_change_select(agent_id)
            .where_eq("interface_name", interface)
            .where_op("timestamp", ">=", to_nanos(OP, &since)?)
            .order_by("timestamp", Order::Desc)
            .order_by("id", Order::Desc);

        self.stats
            .observe(OP, self.query_timeout, self.fetch_ip_changes(OP, query))
            .await
    }

    #[instrument(skip(self))]
    async fn get_ip_change_summary(&self, agent_id: &str) -> Result<IpChangeSummary> {
        const OP: &str = "ip_changes.summary";
        let query = Self::ip_change_select(agent_id)
            .order_by("timestamp", Order::Desc)
            .order_by("id", Order::Desc);

        let changes = self
            .stats
            .observe(OP, self.query_timeout, self.fetch_ip_changes(OP, query))
            .await?;
        Ok(summarize_changes(agent_id, &changes))
    }

    #[instrument(skip(self), fields(batch_size = self.batch_size))]
    async fn cleanup(&self, before: DateTime<Utc>, cancel: &CancellationToken) -> Result<CleanupSummary> {
        const OP: &str = "metrics.cleanup";
        let sql = self.statement(OP, || {
            let inner = QueryBuilder::select(DIALECT, "metrics", &["id"])
                .where_op("timestamp", "<", SqlValue::Null)
                .order_by("timestamp", Order::Asc)
                .limit(1)
                .build();
            QueryBuilder::delete(DIALECT, "metrics")
                .where_raw(&format!("id IN ({})", inner.sql), inner.args)
                .build()
                .sql
        });

        let cutoff = to_nanos(OP, &before)?;
        let mut summary = CleanupSummary::default();

        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let deleted = self
                .stats
                .observe(OP, self.query_timeout, async {
                    let result = self
                        .cached(&sql)
                        .bind(cutoff)
                        .bind(self.batch_size as i64)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| Error::from_sqlx(OP, e))?;
                    Ok(result.rows_affected() as usize)
                })
                .await?;

            if deleted == 0 {
                break;
            }
            summary.deleted += deleted as u64;
            summary.batches += 1;
            summary.largest_batch = summary.largest_batch.max(deleted);
            debug!(deleted, batch = summary.batches, "cleanup batch committed");

            if deleted < self.batch_size {
                break;
            }
            // Let writers waiting on the lock in.
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.batch_pause) => {}
            }
        }

        info!(
            deleted = summary.deleted,
            batches = summary.batches,
            cancelled = summary.cancelled,
            "metrics cleanup before {before} complete"
        );
        Ok(summary)
    }

    async fn ping(&self) -> Result<()> {
        const OP: &str = "ping";
        self.stats
            .observe(OP, self.query_timeout, async {
                sqlx::query("SELECT 1")
                    .execute(&self.pool)
                    .await
                    .map_err(|e| Error::from_sqlx(OP, e))?;
                Ok(())
            })
            .await
    }

    async fn close(&self) -> Result<()> {
        let drained = self.cache.drain();
        self.pool.close().await;
        info!(drained, "SQLite backend closed");
        Ok(())
    }

    fn stats(&self) -> StorageStats {
        let mut stats = self.stats.snapshot(self.driver());
        stats.cache_hits = self.cache.hits();
        stats.cache_misses = self.cache.misses();
        stats.cached_statements = self.cache.len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{ChangeAction, IpVersion};
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    async fn memory_backend() -> SqliteBackend {
        let config = StorageConfig {
            dsn: ":memory:".to_string(),
            ..Default::default()
        };
        SqliteBackend::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn fresh_database_lists_no_agents() {
        let backend = memory_backend().await;
        let agents = backend.list_agents(None).await.unwrap();
        assert!(agents.is_empty());
        assert_eq!(backend.batch_size(), CONSTRAINED_CLEANUP_BATCH);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let backend = memory_backend().await;
        let agent = AgentInfo::new("A1", "h1", Utc::now());
        backend.register_or_update_agent(&agent).await.unwrap();
        backend.register_or_update_agent(&agent).await.unwrap();

        let agents = backend.list_agents(None).await.unwrap();
        assert_eq!(agents, vec![agent]);
    }

    #[tokio::test]
    async fn list_is_ordered_by_hostname() {
        let backend = memory_backend().await;
        let now = Utc::now();
        for (id, host) in [("c", "zeta"), ("a", "alpha"), ("b", "mid")] {
            backend
                .register_or_update_agent(&AgentInfo::new(id, host, now))
                .await
                .unwrap();
        }
        let hosts: Vec<String> = backend
            .list_agents(None)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.hostname)
            .collect();
        assert_eq!(hosts, vec!["alpha", "mid", "zeta"]);

        let page = backend
            .list_agents(Some(Page { limit: 1, offset: 1 }))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].hostname, "mid");
    }

    #[tokio::test]
    async fn status_update_requires_existing_agent() {
        let backend = memory_backend().await;
        let err = backend
            .update_agent_status("ghost", AgentStatus::Offline, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn offline_keeps_last_seen() {
        let backend = memory_backend().await;
        let seen = Utc::now() - ChronoDuration::minutes(10);
        backend
            .register_or_update_agent(&AgentInfo::new("A1", "h1", seen))
            .await
            .unwrap();
        let now = Utc::now();
        backend
            .update_agent_status("A1", AgentStatus::Offline, now)
            .await
            .unwrap();
        let agent = backend.get_agent("A1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        assert_eq!(agent.last_seen, seen);
        assert_eq!(agent.updated_at, now);
    }

    #[tokio::test]
    async fn latest_metrics_not_found_before_first_report() {
        let backend = memory_backend().await;
        let err = backend.get_latest_metrics("A1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn previous_metrics_is_strictly_earlier() {
        let backend = memory_backend().await;
        let t0 = Utc::now() - ChronoDuration::seconds(10);
        let t1 = t0 + ChronoDuration::seconds(5);
        backend.save_metrics(&MetricsEnvelope::new("A1", "h1", t0)).await.unwrap();
        backend.save_metrics(&MetricsEnvelope::new("A1", "h1", t1)).await.unwrap();

        let prev = backend.get_previous_metrics("A1", t1).await.unwrap().unwrap();
        assert_eq!(prev.collected_at, t0);
        assert!(backend.get_previous_metrics("A1", t0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_cascades() {
        let backend = memory_backend().await;
        let now = Utc::now();
        backend
            .register_or_update_agent(&AgentInfo::new("A1", "h1", now))
            .await
            .unwrap();
        backend.save_metrics(&MetricsEnvelope::new("A1", "h1", now)).await.unwrap();
        backend
            .save_ip_change(
                "A1",
                &IpChange {
                    agent_id: "A1".into(),
                    interface_name: "eth0".into(),
                    version: IpVersion::Ipv4,
                    is_external: false,
                    old_addrs: vec![],
                    new_addrs: vec!["10.0.0.1".into()],
                    action: ChangeAction::Add,
                    reason: String::new(),
                    timestamp: now,
                    created_at: None,
                },
            )
            .await
            .unwrap();

        backend.delete_agent("A1").await.unwrap();
        assert_eq!(backend.get_agent("A1").await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            backend.get_latest_metrics("A1").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(backend
            .get_recent_ip_changes("A1", now - ChronoDuration::hours(1))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(backend.delete_agent("A1").await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn failed_ip_change_rolls_back_reports() {
        let backend = memory_backend().await;
        sqlx::raw_sql(
            "CREATE TRIGGER reject_ip_changes BEFORE INSERT ON ip_changes \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .execute(backend.pool())
        .await
        .unwrap();

        let now = Utc::now();
        let plain = MetricsEnvelope::new("A1", "h1", now);
        let mut with_change = MetricsEnvelope::new("A2", "h2", now);
        with_change.payload.ip_changes.push(IpChange {
            agent_id: String::new(),
            interface_name: "eth0".into(),
            version: IpVersion::Ipv4,
            is_external: false,
            old_addrs: vec![],
            new_addrs: vec!["10.0.0.1".into()],
            action: ChangeAction::Add,
            reason: String::new(),
            timestamp: now,
            created_at: None,
        });

        assert!(backend.save_reports(&[plain, with_change]).await.is_err());
        for agent in ["A1", "A2"] {
            assert_eq!(
                backend.get_latest_metrics(agent).await.unwrap_err().kind(),
                ErrorKind::NotFound
            );
        }
    }

    #[tokio::test]
    async fn cleanup_stops_when_cancelled() {
        let backend = memory_backend().await;
        let now = Utc::now();
        for days in 1..=3 {
            backend
                .save_metrics(&MetricsEnvelope::new("A1", "h1", now - ChronoDuration::days(days)))
                .await
                .unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = backend.cleanup(now, &cancel).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.deleted, 0);

        let summary = backend.cleanup(now, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.deleted, 3);
    }

    #[tokio::test]
    async fn statement_cache_is_used_and_drained() {
        let backend = memory_backend().await;
        let agent = AgentInfo::new("A1", "h1", Utc::now());
        for _ in 0..3 {
            backend.register_or_update_agent(&agent).await.unwrap();
        }
        let stats = backend.stats();
        assert!(stats.cache_hits >= 2);
        assert!(stats.query_count >= 3);

        backend.close().await.unwrap();
        assert_eq!(backend.stats().cached_statements, 0);
    }

    #[tokio::test]
    async fn reopening_a_file_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wameter.db");
        {
            let backend = SqliteBackend::new(&path).await.unwrap();
            backend
                .register_or_update_agent(&AgentInfo::new("A1", "h1", Utc::now()))
                .await
                .unwrap();
            backend.close().await.unwrap();
        }
        let backend = SqliteBackend::new(&path).await.unwrap();
        assert_eq!(backend.list_agents(None).await.unwrap().len(), 1);
    }
}
