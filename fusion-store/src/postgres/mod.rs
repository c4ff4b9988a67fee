//! Postgres truth provider.
//!
//! Strongly consistent and the only backend offering ACID transactions.
//! Leasing runs as a single `UPDATE … RETURNING` with `FOR UPDATE SKIP
//! LOCKED` so concurrent workers never claim the same relay.

pub(crate) mod entity;

use std::time::Duration;

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    DatabaseTransaction, DbBackend, DbErr, EntityTrait, FromQueryResult, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Statement, TransactionTrait,
};
use tracing::{debug, instrument, warn};

use fusion_core::{
    time::now_millis, ChainState, CircuitBreakerState, MetricsSnapshot, Relay, RelayAttempt,
    RelayStatus, StoreError, StoreResult,
};

use crate::{
    CleanupReport, PostgresConfig, RelayFilter, RelayStore, RetentionPolicy, StoreStats,
    StoreTransaction,
};

use entity::{breaker, chain_state, relay, relay_attempt, snapshot};

const DEFAULT_LIST_LIMIT: u64 = 500;

/// Statuses a worker may lease. Includes `expired` so refunds interrupted by
/// a crash are resumed.
const LEASABLE_STATUSES: &str = "'pending','routing','executing','confirming','expired'";

const TERMINAL_STATUSES: &str = "'completed','failed','expired','refunded'";

/// The truth store.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    db: DatabaseConnection,
}

impl PostgresStore {
    /// Connect with the configured pool bounds.
    #[instrument(skip_all, fields(url = %redact_url(&config.url)))]
    pub async fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        let mut options = ConnectOptions::new(config.url.clone());
        options
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.acquire_timeout_secs));
        let db = Database::connect(options).await.map_err(map_db_err)?;
        Ok(Self { db })
    }

    /// Wrap an already-established connection (tests, migrator).
    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Access the underlying connection for the migrator and archiver.
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

pub(crate) fn map_db_err(err: DbErr) -> StoreError {
    match &err {
        DbErr::ConnectionAcquire | DbErr::Conn(_) => StoreError::Transient(err.to_string()),
        DbErr::Exec(inner) | DbErr::Query(inner) => {
            let text = inner.to_string();
            if text.contains("duplicate key") || text.contains("violates") {
                StoreError::Constraint(text)
            } else if text.contains("does not exist") {
                StoreError::Schema(text)
            } else {
                StoreError::Transient(text)
            }
        }
        _ => StoreError::Transient(err.to_string()),
    }
}

fn redact_url(url: &str) -> String {
    match url.split_once('@') {
        Some((_, tail)) => format!("postgres://…@{tail}"),
        None => url.to_string(),
    }
}

async fn upsert_relay<C: ConnectionTrait>(conn: &C, input: &Relay) -> StoreResult<()> {
    let mut record = input.clone();
    record.updated_at = record.updated_at.max(now_millis());
    let model = relay::active_model(&record)?;
    relay::Entity::insert(model)
        .on_conflict(
            OnConflict::column(relay::Column::Id)
                .update_columns([
                    relay::Column::Status,
                    relay::Column::Route,
                    relay::Column::UpdatedAt,
                    relay::Column::RetryCount,
                    relay::Column::LastError,
                    relay::Column::Metadata,
                ])
                .to_owned(),
        )
        .exec(conn)
        .await
        .map_err(map_db_err)?;
    Ok(())
}

async fn upsert_attempt<C: ConnectionTrait>(conn: &C, attempt: &RelayAttempt) -> StoreResult<()> {
    let model = relay_attempt::active_model(attempt);
    relay_attempt::Entity::insert(model)
        .on_conflict(
            OnConflict::column(relay_attempt::Column::Id)
                .update_columns([
                    relay_attempt::Column::Status,
                    relay_attempt::Column::CompletedAt,
                    relay_attempt::Column::TxHash,
                    relay_attempt::Column::ErrorMessage,
                    relay_attempt::Column::GasUsed,
                    relay_attempt::Column::Metadata,
                ])
                .to_owned(),
        )
        .exec(conn)
        .await
        .map_err(map_db_err)?;
    Ok(())
}

#[async_trait]
impl RelayStore for PostgresStore {
    async fn save_relay(&self, input: &Relay) -> StoreResult<()> {
        upsert_relay(&self.db, input).await
    }

    async fn get_relay(&self, id: &str) -> StoreResult<Option<Relay>> {
        let found = relay::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(map_db_err)?;
        found.map(relay::Model::into_domain).transpose()
    }

    async fn list_relays(&self, filter: &RelayFilter) -> StoreResult<Vec<Relay>> {
        let mut query = relay::Entity::find();
        if let Some(status) = filter.status {
            query = query.filter(relay::Column::Status.eq(status.to_string()));
        }
        if let Some(after) = filter.created_after {
            query = query.filter(relay::Column::CreatedAt.gte(after));
        }
        if let Some(before) = filter.created_before {
            query = query.filter(relay::Column::CreatedAt.lt(before));
        }
        let rows = query
            .order_by_desc(relay::Column::CreatedAt)
            .limit(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .all(&self.db)
            .await
            .map_err(map_db_err)?;
        rows.into_iter().map(relay::Model::into_domain).collect()
    }

    async fn delete_relay(&self, id: &str) -> StoreResult<()> {
        relay::Entity::delete_by_id(id.to_string())
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn save_attempt(&self, attempt: &RelayAttempt) -> StoreResult<()> {
        upsert_attempt(&self.db, attempt).await
    }

    async fn list_attempts(&self, relay_id: &str) -> StoreResult<Vec<RelayAttempt>> {
        let rows = relay_attempt::Entity::find()
            .filter(relay_attempt::Column::RelayId.eq(relay_id))
            .order_by_asc(relay_attempt::Column::AttemptNumber)
            .all(&self.db)
            .await
            .map_err(map_db_err)?;
        rows.into_iter()
            .map(relay_attempt::Model::into_domain)
            .collect()
    }

    async fn next_attempt_number(&self, relay_id: &str) -> StoreResult<u32> {
        let row = self
            .db
            .query_one(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "SELECT COALESCE(MAX(attempt_number), 0)::BIGINT AS max_attempt \
                 FROM relay_attempts WHERE relay_id = $1",
                [relay_id.into()],
            ))
            .await
            .map_err(map_db_err)?;
        let max: i64 = match row {
            Some(row) => row
                .try_get("", "max_attempt")
                .map_err(map_db_err)?,
            None => 0,
        };
        Ok(max.max(0) as u32 + 1)
    }

    async fn save_chain_state(&self, state: &ChainState) -> StoreResult<()> {
        let model = chain_state::active_model(state);
        chain_state::Entity::insert(model)
            .on_conflict(
                OnConflict::column(chain_state::Column::ChainId)
                    .update_columns([
                        chain_state::Column::LastProcessedBlock,
                        chain_state::Column::LastProcessedHeight,
                        chain_state::Column::Status,
                        chain_state::Column::LastUpdated,
                        chain_state::Column::ErrorCount,
                        chain_state::Column::LastError,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_chain_state(&self, chain_id: &str) -> StoreResult<Option<ChainState>> {
        let found = chain_state::Entity::find_by_id(chain_id.to_string())
            .one(&self.db)
            .await
            .map_err(map_db_err)?;
        found.map(chain_state::Model::into_domain).transpose()
    }

    async fn list_chain_states(&self) -> StoreResult<Vec<ChainState>> {
        let rows = chain_state::Entity::find()
            .all(&self.db)
            .await
            .map_err(map_db_err)?;
        rows.into_iter()
            .map(chain_state::Model::into_domain)
            .collect()
    }

    async fn save_breaker(&self, state: &CircuitBreakerState) -> StoreResult<()> {
        let model = breaker::active_model(state);
        breaker::Entity::insert(model)
            .on_conflict(
                OnConflict::column(breaker::Column::Name)
                    .update_columns([
                        breaker::Column::State,
                        breaker::Column::Failures,
                        breaker::Column::Successes,
                        breaker::Column::LastFailureTime,
                        breaker::Column::LastSuccessTime,
                        breaker::Column::NextAttempt,
                        breaker::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_breaker(&self, name: &str) -> StoreResult<Option<CircuitBreakerState>> {
        let found = breaker::Entity::find_by_id(name.to_string())
            .one(&self.db)
            .await
            .map_err(map_db_err)?;
        found.map(breaker::Model::into_domain).transpose()
    }

    async fn list_breakers(&self) -> StoreResult<Vec<CircuitBreakerState>> {
        let rows = breaker::Entity::find()
            .all(&self.db)
            .await
            .map_err(map_db_err)?;
        rows.into_iter().map(breaker::Model::into_domain).collect()
    }

    async fn save_snapshot(&self, input: &MetricsSnapshot) -> StoreResult<()> {
        let model = snapshot::active_model(input);
        snapshot::Entity::insert(model)
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn latest_snapshot(&self) -> StoreResult<Option<MetricsSnapshot>> {
        let found = snapshot::Entity::find()
            .order_by_desc(snapshot::Column::Timestamp)
            .one(&self.db)
            .await
            .map_err(map_db_err)?;
        found.map(snapshot::Model::into_domain).transpose()
    }

    async fn snapshots_in_range(
        &self,
        from_millis: i64,
        to_millis: i64,
    ) -> StoreResult<Vec<MetricsSnapshot>> {
        let rows = snapshot::Entity::find()
            .filter(snapshot::Column::Timestamp.gte(from_millis))
            .filter(snapshot::Column::Timestamp.lt(to_millis))
            .order_by_asc(snapshot::Column::Timestamp)
            .all(&self.db)
            .await
            .map_err(map_db_err)?;
        rows.into_iter().map(snapshot::Model::into_domain).collect()
    }

    async fn lease_next_ready(&self, worker: &str, ttl: Duration) -> StoreResult<Option<Relay>> {
        let now = now_millis();
        let expiry = now + ttl.as_millis() as i64;
        let sql = format!(
            "UPDATE pending_relays \
             SET lease_owner = $1, lease_expiry = $2 \
             WHERE id = ( \
                 SELECT id FROM pending_relays \
                 WHERE status IN ({LEASABLE_STATUSES}) \
                   AND (lease_expiry IS NULL OR lease_expiry < $3) \
                 ORDER BY created_at \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING *"
        );
        let row = self
            .db
            .query_one(Statement::from_sql_and_values(
                DbBackend::Postgres,
                &sql,
                [worker.into(), expiry.into(), now.into()],
            ))
            .await
            .map_err(map_db_err)?;
        match row {
            Some(row) => {
                let model = relay::Model::from_query_result(&row, "").map_err(map_db_err)?;
                debug!(relay_id = %model.id, worker, "leased relay");
                Ok(Some(model.into_domain()?))
            }
            None => Ok(None),
        }
    }

    async fn heartbeat_lease(
        &self,
        relay_id: &str,
        worker: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = now_millis();
        let expiry = now + ttl.as_millis() as i64;
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "UPDATE pending_relays SET lease_expiry = $1 \
                 WHERE id = $2 AND lease_owner = $3 AND lease_expiry >= $4",
                [expiry.into(), relay_id.into(), worker.into(), now.into()],
            ))
            .await
            .map_err(map_db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, relay_id: &str, worker: &str) -> StoreResult<()> {
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "UPDATE pending_relays SET lease_owner = NULL, lease_expiry = NULL \
                 WHERE id = $1 AND lease_owner = $2",
                [relay_id.into(), worker.into()],
            ))
            .await
            .map_err(map_db_err)?;
        if result.rows_affected() == 0 {
            warn!(relay_id, worker, "release of a lease not held by this worker");
        }
        Ok(())
    }

    async fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let txn = self.db.begin().await.map_err(map_db_err)?;
        Ok(Box::new(PostgresTransaction { txn }))
    }

    async fn cleanup(&self, retention: &RetentionPolicy) -> StoreResult<CleanupReport> {
        let now = now_millis();
        let relay_cutoff = now - retention.relay_retention.as_millis() as i64;
        let snapshot_cutoff = now - retention.snapshot_retention.as_millis() as i64;

        // Attempts go with their relay by cascade; count them up front so the
        // report is accurate.
        let attempts_sql = format!(
            "SELECT COUNT(*) AS doomed FROM relay_attempts a \
             JOIN pending_relays r ON r.id = a.relay_id \
             WHERE r.status IN ({TERMINAL_STATUSES}) AND r.updated_at < $1"
        );
        let attempts_deleted: i64 = match self
            .db
            .query_one(Statement::from_sql_and_values(
                DbBackend::Postgres,
                &attempts_sql,
                [relay_cutoff.into()],
            ))
            .await
            .map_err(map_db_err)?
        {
            Some(row) => row.try_get("", "doomed").map_err(map_db_err)?,
            None => 0,
        };

        let relays_sql = format!(
            "DELETE FROM pending_relays \
             WHERE status IN ({TERMINAL_STATUSES}) AND updated_at < $1"
        );
        let relays = self
            .db
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                &relays_sql,
                [relay_cutoff.into()],
            ))
            .await
            .map_err(map_db_err)?;

        let snapshots = snapshot::Entity::delete_many()
            .filter(snapshot::Column::Timestamp.lt(snapshot_cutoff))
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;

        Ok(CleanupReport {
            relays_deleted: relays.rows_affected(),
            attempts_deleted: attempts_deleted.max(0) as u64,
            snapshots_deleted: snapshots.rows_affected,
        })
    }

    async fn vacuum(&self) -> StoreResult<()> {
        self.db
            .execute_unprepared("VACUUM (ANALYZE)")
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.db
            .query_one(Statement::from_string(
                DbBackend::Postgres,
                "SELECT 1".to_string(),
            ))
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let mut stats = StoreStats {
            provider: "postgres",
            ..Default::default()
        };
        let rows = self
            .db
            .query_all(Statement::from_string(
                DbBackend::Postgres,
                "SELECT status, COUNT(*) AS total FROM pending_relays GROUP BY status".to_string(),
            ))
            .await
            .map_err(map_db_err)?;
        for row in rows {
            let status_text: String = row.try_get("", "status").map_err(map_db_err)?;
            let total: i64 = row.try_get("", "total").map_err(map_db_err)?;
            if let Ok(status) = status_text.parse::<RelayStatus>() {
                stats.relays_by_status.insert(status, total.max(0) as u64);
            }
        }
        stats.attempts_total = relay_attempt::Entity::find()
            .count(&self.db)
            .await
            .map_err(map_db_err)? as u64;
        Ok(stats)
    }
}

/// ACID write set over one Postgres transaction.
pub struct PostgresTransaction {
    txn: DatabaseTransaction,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn save_relay(&mut self, input: &Relay) -> StoreResult<()> {
        upsert_relay(&self.txn, input).await
    }

    async fn save_attempt(&mut self, attempt: &RelayAttempt) -> StoreResult<()> {
        upsert_attempt(&self.txn, attempt).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.txn.commit().await.map_err(map_db_err)
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.txn.rollback().await.map_err(map_db_err)
    }
}
