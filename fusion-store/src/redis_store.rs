//! Redis cache provider.
//!
//! Low latency, relaxed durability. Every record is materialized as a full
//! JSON value on the write side, so a cache write never depends on reading
//! what is already there inside a transaction. Index sets are maintained per
//! status; terminal relays, attempt lists and metrics snapshots carry TTLs.
//!
//! The "transaction" offered here is a command pipeline: all staged commands
//! are sent atomically or discarded together, but there is no isolation and
//! no reads inside the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Pipeline, Script};
use strum::IntoEnumIterator;
use tracing::{debug, instrument, warn};

use fusion_core::{
    time::now_millis, ChainState, CircuitBreakerState, MetricsSnapshot, Relay, RelayAttempt,
    RelayStatus, StoreError, StoreResult,
};

use crate::{
    CacheConfig, CacheCounters, CleanupReport, EntityClass, RedisConfig, RelayFilter, RelayStore,
    RetentionPolicy, StoreStats, StoreTransaction,
};

pub(crate) fn map_redis_err(err: redis::RedisError) -> StoreError {
    StoreError::Transient(err.to_string())
}

/// Key layout shared by the cache provider and the hybrid reconciler.
#[derive(Clone, Debug)]
pub(crate) struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn relay(&self, id: &str) -> String {
        format!("{}relay:{id}", self.prefix)
    }

    pub fn pending_index(&self) -> String {
        format!("{}relay:pending", self.prefix)
    }

    pub fn status_index(&self, status: RelayStatus) -> String {
        format!("{}relay:status:{status}", self.prefix)
    }

    pub fn attempts(&self, relay_id: &str) -> String {
        format!("{}relay:{relay_id}:attempts", self.prefix)
    }

    pub fn attempt_seq(&self, relay_id: &str) -> String {
        format!("{}relay:{relay_id}:attempt_seq", self.prefix)
    }

    pub fn lease(&self, relay_id: &str) -> String {
        format!("{}relay:{relay_id}:lease", self.prefix)
    }

    pub fn chain(&self, chain_id: &str) -> String {
        format!("{}chain:{chain_id}", self.prefix)
    }

    pub fn breaker(&self, name: &str) -> String {
        format!("{}circuit:{name}", self.prefix)
    }

    pub fn metrics(&self, id: &str) -> String {
        format!("{}metrics:{id}", self.prefix)
    }

    pub fn metrics_latest(&self) -> String {
        format!("{}metrics:latest", self.prefix)
    }

    pub fn metrics_timeline(&self) -> String {
        format!("{}metrics:timeline", self.prefix)
    }
}

/// The cache store.
pub struct RedisStore {
    manager: ConnectionManager,
    keys: KeySpace,
    cache: CacheConfig,
    counters: CacheCounters,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.keys.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect through a reconnecting connection manager.
    #[instrument(skip_all)]
    pub async fn connect(config: &RedisConfig, cache: &CacheConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(map_redis_err)?;
        let manager = client
            .get_tokio_connection_manager()
            .await
            .map_err(map_redis_err)?;
        Ok(Self {
            manager,
            keys: KeySpace::new(&cache.key_prefix),
            cache: cache.clone(),
            counters: CacheCounters::default(),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Stage the full write set for one relay onto `pipe`: value, status
    /// index maintenance and TTL handling.
    fn stage_relay(
        &self,
        pipe: &mut Pipeline,
        prev_status: Option<RelayStatus>,
        relay: &Relay,
        json: &str,
    ) {
        let key = self.keys.relay(&relay.id);
        if relay.status.is_terminal() {
            pipe.set_ex(&key, json, self.cache.terminal_relay_ttl_secs as usize)
                .ignore();
            pipe.srem(self.keys.pending_index(), &relay.id).ignore();
        } else {
            pipe.set(&key, json).ignore();
            pipe.sadd(self.keys.pending_index(), &relay.id).ignore();
        }
        if let Some(prev) = prev_status {
            if prev != relay.status {
                pipe.srem(self.keys.status_index(prev), &relay.id).ignore();
            }
        }
        pipe.sadd(self.keys.status_index(relay.status), &relay.id)
            .ignore();
    }

    async fn read_relay(&self, id: &str) -> StoreResult<Option<Relay>> {
        let mut con = self.conn();
        let raw: Option<String> = con
            .get(self.keys.relay(id))
            .await
            .map_err(map_redis_err)?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn read_active_attempts(&self, relay_id: &str) -> StoreResult<Vec<RelayAttempt>> {
        let mut con = self.conn();
        let raw: Option<String> = con
            .get(self.keys.attempts(relay_id))
            .await
            .map_err(map_redis_err)?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl RelayStore for RedisStore {
    async fn save_relay(&self, input: &Relay) -> StoreResult<()> {
        let mut record = input.clone();
        record.updated_at = record.updated_at.max(now_millis());
        let prev_status = self.read_relay(&record.id).await?.map(|r| r.status);
        let json = serde_json::to_string(&record)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.stage_relay(&mut pipe, prev_status, &record, &json);
        pipe.query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn get_relay(&self, id: &str) -> StoreResult<Option<Relay>> {
        let found = self.read_relay(id).await?;
        if found.is_some() {
            self.counters.hit(EntityClass::Relay);
        } else {
            self.counters.miss(EntityClass::Relay);
        }
        Ok(found)
    }

    async fn list_relays(&self, filter: &RelayFilter) -> StoreResult<Vec<Relay>> {
        // Without a status filter the active index is the answer; terminal
        // relays age out of the cache by TTL and are not enumerable here.
        let mut con = self.conn();
        let ids: Vec<String> = match filter.status {
            Some(status) => con
                .smembers(self.keys.status_index(status))
                .await
                .map_err(map_redis_err)?,
            None => con
                .smembers(self.keys.pending_index())
                .await
                .map_err(map_redis_err)?,
        };
        let mut relays = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(relay) = self.read_relay(&id).await? {
                let after_ok = filter.created_after.map_or(true, |t| relay.created_at >= t);
                let before_ok = filter.created_before.map_or(true, |t| relay.created_at < t);
                if after_ok && before_ok {
                    relays.push(relay);
                }
            }
        }
        relays.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            relays.truncate(limit as usize);
        }
        Ok(relays)
    }

    async fn delete_relay(&self, id: &str) -> StoreResult<()> {
        let prev = self.read_relay(id).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(self.keys.relay(id)).ignore();
        pipe.del(self.keys.attempts(id)).ignore();
        pipe.del(self.keys.attempt_seq(id)).ignore();
        pipe.srem(self.keys.pending_index(), id).ignore();
        if let Some(prev) = prev {
            pipe.srem(self.keys.status_index(prev.status), id).ignore();
        } else {
            for status in RelayStatus::iter() {
                pipe.srem(self.keys.status_index(status), id).ignore();
            }
        }
        pipe.query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn save_attempt(&self, attempt: &RelayAttempt) -> StoreResult<()> {
        // Only live attempts are cached; settled ones drop out of the list.
        let mut attempts = self.read_active_attempts(&attempt.relay_id).await?;
        attempts.retain(|a| a.id != attempt.id);
        if !attempt.status.is_settled() {
            attempts.push(attempt.clone());
            attempts.sort_by_key(|a| a.attempt_number);
        }
        let mut con = self.conn();
        if attempts.is_empty() {
            con.del::<_, ()>(self.keys.attempts(&attempt.relay_id))
                .await
                .map_err(map_redis_err)?;
        } else {
            let json = serde_json::to_string(&attempts)?;
            con.set_ex::<_, _, ()>(
                self.keys.attempts(&attempt.relay_id),
                json,
                self.cache.attempt_ttl_secs as usize,
            )
            .await
            .map_err(map_redis_err)?;
        }
        Ok(())
    }

    async fn list_attempts(&self, relay_id: &str) -> StoreResult<Vec<RelayAttempt>> {
        // Cache-only deployments retain live attempts, not history.
        let attempts = self.read_active_attempts(relay_id).await?;
        if attempts.is_empty() {
            self.counters.miss(EntityClass::Attempt);
        } else {
            self.counters.hit(EntityClass::Attempt);
        }
        Ok(attempts)
    }

    async fn next_attempt_number(&self, relay_id: &str) -> StoreResult<u32> {
        let mut con = self.conn();
        let next: i64 = con
            .incr(self.keys.attempt_seq(relay_id), 1)
            .await
            .map_err(map_redis_err)?;
        Ok(next.max(1) as u32)
    }

    async fn save_chain_state(&self, state: &ChainState) -> StoreResult<()> {
        let json = serde_json::to_string(state)?;
        let mut con = self.conn();
        con.set::<_, _, ()>(self.keys.chain(&state.chain_id), json)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn get_chain_state(&self, chain_id: &str) -> StoreResult<Option<ChainState>> {
        let mut con = self.conn();
        let raw: Option<String> = con
            .get(self.keys.chain(chain_id))
            .await
            .map_err(map_redis_err)?;
        if raw.is_some() {
            self.counters.hit(EntityClass::ChainState);
        } else {
            self.counters.miss(EntityClass::ChainState);
        }
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn list_chain_states(&self) -> StoreResult<Vec<ChainState>> {
        // Chain ids are few and stable; scan by pattern.
        let mut con = self.conn();
        let pattern = format!("{}*", self.keys.chain(""));
        let keys: Vec<String> = con.keys(pattern).await.map_err(map_redis_err)?;
        let mut states = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = con.get(&key).await.map_err(map_redis_err)?;
            if let Some(json) = raw {
                states.push(serde_json::from_str(&json)?);
            }
        }
        Ok(states)
    }

    async fn save_breaker(&self, state: &CircuitBreakerState) -> StoreResult<()> {
        let json = serde_json::to_string(state)?;
        let mut con = self.conn();
        con.set::<_, _, ()>(self.keys.breaker(&state.name), json)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn get_breaker(&self, name: &str) -> StoreResult<Option<CircuitBreakerState>> {
        let mut con = self.conn();
        let raw: Option<String> = con
            .get(self.keys.breaker(name))
            .await
            .map_err(map_redis_err)?;
        if raw.is_some() {
            self.counters.hit(EntityClass::Breaker);
        } else {
            self.counters.miss(EntityClass::Breaker);
        }
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn list_breakers(&self) -> StoreResult<Vec<CircuitBreakerState>> {
        let mut con = self.conn();
        let pattern = format!("{}*", self.keys.breaker(""));
        let keys: Vec<String> = con.keys(pattern).await.map_err(map_redis_err)?;
        let mut breakers = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = con.get(&key).await.map_err(map_redis_err)?;
            if let Some(json) = raw {
                breakers.push(serde_json::from_str(&json)?);
            }
        }
        Ok(breakers)
    }

    async fn save_snapshot(&self, snapshot: &MetricsSnapshot) -> StoreResult<()> {
        let json = serde_json::to_string(snapshot)?;
        let ttl = self.cache.metrics_ttl_secs as usize;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set_ex(self.keys.metrics(&snapshot.id), &json, ttl)
            .ignore();
        pipe.set_ex(self.keys.metrics_latest(), &json, ttl).ignore();
        pipe.zadd(
            self.keys.metrics_timeline(),
            &snapshot.id,
            snapshot.timestamp,
        )
        .ignore();
        pipe.query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn latest_snapshot(&self) -> StoreResult<Option<MetricsSnapshot>> {
        let mut con = self.conn();
        let raw: Option<String> = con
            .get(self.keys.metrics_latest())
            .await
            .map_err(map_redis_err)?;
        if raw.is_some() {
            self.counters.hit(EntityClass::Snapshot);
        } else {
            self.counters.miss(EntityClass::Snapshot);
        }
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn snapshots_in_range(
        &self,
        from_millis: i64,
        to_millis: i64,
    ) -> StoreResult<Vec<MetricsSnapshot>> {
        // Range queries belong to the truth store; in a cache-only
        // deployment the timeline index is the best available answer.
        let mut con = self.conn();
        let ids: Vec<String> = con
            .zrangebyscore(
                self.keys.metrics_timeline(),
                from_millis,
                to_millis - 1,
            )
            .await
            .map_err(map_redis_err)?;
        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = con
                .get(self.keys.metrics(&id))
                .await
                .map_err(map_redis_err)?;
            if let Some(json) = raw {
                snapshots.push(serde_json::from_str(&json)?);
            }
        }
        Ok(snapshots)
    }

    async fn lease_next_ready(&self, worker: &str, ttl: Duration) -> StoreResult<Option<Relay>> {
        let mut con = self.conn();
        let ids: Vec<String> = con
            .smembers(self.keys.pending_index())
            .await
            .map_err(map_redis_err)?;
        for id in ids {
            let claimed: Option<String> = redis::cmd("SET")
                .arg(self.keys.lease(&id))
                .arg(worker)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut con)
                .await
                .map_err(map_redis_err)?;
            if claimed.is_none() {
                continue;
            }
            match self.read_relay(&id).await? {
                Some(relay) if relay.status.is_active() || relay.status == RelayStatus::Expired => {
                    debug!(relay_id = %id, worker, "leased relay from cache index");
                    return Ok(Some(relay));
                }
                _ => {
                    // Stale index entry; release the claim and move on.
                    con.del::<_, ()>(self.keys.lease(&id))
                        .await
                        .map_err(map_redis_err)?;
                }
            }
        }
        Ok(None)
    }

    async fn heartbeat_lease(
        &self,
        relay_id: &str,
        worker: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let script = Script::new(
            r"if redis.call('get', KEYS[1]) == ARGV[1] then
                  return redis.call('pexpire', KEYS[1], ARGV[2])
              else
                  return 0
              end",
        );
        let extended: i64 = script
            .key(self.keys.lease(relay_id))
            .arg(worker)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(extended == 1)
    }

    async fn release_lease(&self, relay_id: &str, worker: &str) -> StoreResult<()> {
        let script = Script::new(
            r"if redis.call('get', KEYS[1]) == ARGV[1] then
                  return redis.call('del', KEYS[1])
              else
                  return 0
              end",
        );
        let released: i64 = script
            .key(self.keys.lease(relay_id))
            .arg(worker)
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        if released == 0 {
            warn!(relay_id, worker, "release of a lease not held by this worker");
        }
        Ok(())
    }

    async fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(RedisTransaction {
            store: RedisStore {
                manager: self.manager.clone(),
                keys: self.keys.clone(),
                cache: self.cache.clone(),
                counters: CacheCounters::default(),
            },
            pipe: {
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe
            },
        }))
    }

    async fn cleanup(&self, retention: &RetentionPolicy) -> StoreResult<CleanupReport> {
        let now = now_millis();
        let relay_cutoff = now - retention.relay_retention.as_millis() as i64;
        let snapshot_cutoff = now - retention.snapshot_retention.as_millis() as i64;
        let mut report = CleanupReport::default();
        let mut con = self.conn();

        for status in RelayStatus::iter().filter(|s| s.is_terminal()) {
            let ids: Vec<String> = con
                .smembers(self.keys.status_index(status))
                .await
                .map_err(map_redis_err)?;
            for id in ids {
                match self.read_relay(&id).await? {
                    Some(relay) if relay.updated_at < relay_cutoff => {
                        self.delete_relay(&id).await?;
                        report.relays_deleted += 1;
                    }
                    Some(_) => {}
                    // Value expired by TTL; drop the dangling index entry.
                    None => {
                        con.srem::<_, _, ()>(self.keys.status_index(status), &id)
                            .await
                            .map_err(map_redis_err)?;
                    }
                }
            }
        }

        let stale_ids: Vec<String> = con
            .zrangebyscore(self.keys.metrics_timeline(), i64::MIN, snapshot_cutoff)
            .await
            .map_err(map_redis_err)?;
        for id in &stale_ids {
            con.del::<_, ()>(self.keys.metrics(id))
                .await
                .map_err(map_redis_err)?;
        }
        con.zrembyscore::<_, _, _, ()>(self.keys.metrics_timeline(), i64::MIN, snapshot_cutoff)
            .await
            .map_err(map_redis_err)?;
        report.snapshots_deleted = stale_ids.len() as u64;
        Ok(report)
    }

    async fn vacuum(&self) -> StoreResult<()> {
        // Redis reclaims expired keys on its own; nothing to do.
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let pong: String = redis::cmd("PING")
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Transient(format!("unexpected PING reply: {pong}")))
        }
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let mut stats = StoreStats {
            provider: "redis",
            ..Default::default()
        };
        let mut con = self.conn();
        for status in RelayStatus::iter() {
            let count: u64 = con
                .scard(self.keys.status_index(status))
                .await
                .map_err(map_redis_err)?;
            if count > 0 {
                stats.relays_by_status.insert(status, count);
            }
        }
        for class in EntityClass::all() {
            stats.cache.insert(class.label(), self.counters.rate(class));
        }
        Ok(stats)
    }
}

/// Pipeline-backed write set: atomic batching, no isolation.
pub struct RedisTransaction {
    store: RedisStore,
    pipe: Pipeline,
}

#[async_trait]
impl StoreTransaction for RedisTransaction {
    async fn save_relay(&mut self, input: &Relay) -> StoreResult<()> {
        let mut record = input.clone();
        record.updated_at = record.updated_at.max(now_millis());
        // The previous status is read outside the pipeline; between this read
        // and the commit another writer may interleave. Documented relaxation.
        let prev_status = self.store.read_relay(&record.id).await?.map(|r| r.status);
        let json = serde_json::to_string(&record)?;
        self.store
            .stage_relay(&mut self.pipe, prev_status, &record, &json);
        Ok(())
    }

    async fn save_attempt(&mut self, attempt: &RelayAttempt) -> StoreResult<()> {
        let mut attempts = self.store.read_active_attempts(&attempt.relay_id).await?;
        attempts.retain(|a| a.id != attempt.id);
        if !attempt.status.is_settled() {
            attempts.push(attempt.clone());
            attempts.sort_by_key(|a| a.attempt_number);
        }
        let key = self.store.keys.attempts(&attempt.relay_id);
        if attempts.is_empty() {
            self.pipe.del(key).ignore();
        } else {
            let json = serde_json::to_string(&attempts)?;
            self.pipe
                .set_ex(key, json, self.store.cache.attempt_ttl_secs as usize)
                .ignore();
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.pipe
            .query_async::<_, ()>(&mut self.store.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        // Nothing was sent; dropping the pipeline discards the write set.
        Ok(())
    }
}
