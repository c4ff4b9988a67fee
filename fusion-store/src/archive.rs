//! Retention-driven archival against the truth store.
//!
//! Policies are table-parameterized, including the primary-key column, so a
//! table keyed by something other than `id` archives just as well. The due
//! times come from a real cron expression.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement};
use tracing::{info, instrument};

use fusion_core::{time::now_millis, StoreError, StoreResult};

/// Statuses that may leave the hot tables.
const TERMINAL_STATUSES: &str = "'completed','failed','expired','refunded'";

/// What to archive from one table.
#[derive(Debug, Clone)]
pub struct ArchivalPolicy {
    /// Table to prune.
    pub table: String,
    /// Primary-key column; not assumed to be `id`.
    pub primary_key: String,
    /// Millisecond-epoch column the retention window applies to.
    pub timestamp_column: String,
    /// How long rows are kept.
    pub retention: Duration,
    /// Restrict deletion to terminal statuses; guards the relay table.
    pub terminal_only: bool,
}

/// The default policy set for the normative schema.
pub fn default_policies(relay_retention: Duration, snapshot_retention: Duration) -> Vec<ArchivalPolicy> {
    vec![
        ArchivalPolicy {
            table: "pending_relays".into(),
            primary_key: "id".into(),
            timestamp_column: "updated_at".into(),
            retention: relay_retention,
            terminal_only: true,
        },
        ArchivalPolicy {
            table: "metrics_snapshots".into(),
            primary_key: "id".into(),
            timestamp_column: "timestamp".into(),
            retention: snapshot_retention,
            terminal_only: false,
        },
    ]
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Runs archival policies against the truth store.
#[derive(Debug)]
pub struct Archiver {
    db: DatabaseConnection,
    policies: Vec<ArchivalPolicy>,
}

impl Archiver {
    /// Build an archiver; every policy identifier is validated up front so a
    /// bad config fails at boot rather than at 3am.
    pub fn new(db: DatabaseConnection, policies: Vec<ArchivalPolicy>) -> StoreResult<Self> {
        for policy in &policies {
            for name in [&policy.table, &policy.primary_key, &policy.timestamp_column] {
                if !valid_identifier(name) {
                    return Err(StoreError::Schema(format!(
                        "invalid identifier `{name}` in archival policy"
                    )));
                }
            }
        }
        Ok(Self { db, policies })
    }

    /// Execute every policy once. Returns total rows removed.
    #[instrument(skip(self))]
    pub async fn run(&self) -> StoreResult<u64> {
        let now = now_millis();
        let mut total = 0u64;
        for policy in &self.policies {
            let cutoff = now - policy.retention.as_millis() as i64;
            let guard = if policy.terminal_only {
                format!(" AND status IN ({TERMINAL_STATUSES})")
            } else {
                String::new()
            };
            let sql = format!(
                "DELETE FROM {table} WHERE {pk} IN ( \
                     SELECT {pk} FROM {table} WHERE {ts} < $1{guard} \
                 )",
                table = policy.table,
                pk = policy.primary_key,
                ts = policy.timestamp_column,
            );
            let result = self
                .db
                .execute(Statement::from_sql_and_values(
                    DbBackend::Postgres,
                    &sql,
                    [cutoff.into()],
                ))
                .await
                .map_err(crate::postgres::map_db_err)?;
            if result.rows_affected() > 0 {
                info!(
                    table = %policy.table,
                    removed = result.rows_affected(),
                    "archival pass removed rows"
                );
            }
            total += result.rows_affected();
        }
        Ok(total)
    }
}

/// Parse a cron expression, rejecting garbage at boot.
pub fn parse_schedule(expression: &str) -> StoreResult<cron::Schedule> {
    cron::Schedule::from_str(expression)
        .map_err(|err| StoreError::Schema(format!("bad cron expression `{expression}`: {err}")))
}

/// Time until the schedule next fires, from now.
pub fn until_next_fire(schedule: &cron::Schedule) -> Option<Duration> {
    let next = schedule.upcoming(Utc).next()?;
    (next - Utc::now()).to_std().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identifier_validation() {
        assert!(valid_identifier("pending_relays"));
        assert!(valid_identifier("updated_at"));
        assert!(!valid_identifier("1bad"));
        assert!(!valid_identifier("drop table; --"));
        assert!(!valid_identifier(""));
    }

    #[test]
    fn cron_expression_round_trip() {
        // Every day at 03:30.
        let schedule = parse_schedule("0 30 3 * * * *").unwrap();
        let wait = until_next_fire(&schedule).unwrap();
        assert!(wait <= Duration::from_secs(86_400));
    }

    #[test]
    fn bad_cron_expression_is_rejected() {
        assert!(parse_schedule("every day at three").is_err());
    }
}
