use sea_orm::entity::prelude::*;

use fusion_core::{MetricsSnapshot, StoreResult};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "metrics_snapshots")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub timestamp: i64,
    pub relays_total: i64,
    pub relays_active: i64,
    pub relays_completed: i64,
    pub relays_failed: i64,
    pub relays_refunded: i64,
    pub chain_states: Json,
    pub breaker_states: Json,
    pub cache_hit_rate: Option<f64>,
    pub system_health: f64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_domain(self) -> StoreResult<MetricsSnapshot> {
        Ok(MetricsSnapshot {
            id: self.id,
            timestamp: self.timestamp,
            relays_total: self.relays_total.max(0) as u64,
            relays_active: self.relays_active.max(0) as u64,
            relays_completed: self.relays_completed.max(0) as u64,
            relays_failed: self.relays_failed.max(0) as u64,
            relays_refunded: self.relays_refunded.max(0) as u64,
            chain_states: self.chain_states,
            breaker_states: self.breaker_states,
            cache_hit_rate: self.cache_hit_rate,
            system_health: self.system_health,
        })
    }
}

pub fn active_model(snapshot: &MetricsSnapshot) -> ActiveModel {
    use sea_orm::ActiveValue::Set;
    ActiveModel {
        id: Set(snapshot.id.clone()),
        timestamp: Set(snapshot.timestamp),
        relays_total: Set(snapshot.relays_total as i64),
        relays_active: Set(snapshot.relays_active as i64),
        relays_completed: Set(snapshot.relays_completed as i64),
        relays_failed: Set(snapshot.relays_failed as i64),
        relays_refunded: Set(snapshot.relays_refunded as i64),
        chain_states: Set(snapshot.chain_states.clone()),
        breaker_states: Set(snapshot.breaker_states.clone()),
        cache_hit_rate: Set(snapshot.cache_hit_rate),
        system_health: Set(snapshot.system_health),
    }
}
