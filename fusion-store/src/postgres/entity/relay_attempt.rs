use sea_orm::entity::prelude::*;

use fusion_core::{AttemptAction, AttemptStatus, RelayAttempt, StoreError, StoreResult};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "relay_attempts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub relay_id: String,
    pub attempt_number: i32,
    pub action: String,
    pub status: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub tx_hash: Option<String>,
    pub error_message: Option<String>,
    pub gas_used: Option<i64>,
    pub metadata: Option<Json>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::relay::Entity",
        from = "Column::RelayId",
        to = "super::relay::Column::Id"
    )]
    Relay,
}

impl Related<super::relay::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Relay.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_domain(self) -> StoreResult<RelayAttempt> {
        let action: AttemptAction = self
            .action
            .parse()
            .map_err(|_| StoreError::Schema(format!("unknown attempt action `{}`", self.action)))?;
        let status: AttemptStatus = self
            .status
            .parse()
            .map_err(|_| StoreError::Schema(format!("unknown attempt status `{}`", self.status)))?;
        Ok(RelayAttempt {
            id: self.id,
            relay_id: self.relay_id,
            attempt_number: self.attempt_number.max(0) as u32,
            action,
            status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            tx_hash: self.tx_hash,
            error_message: self.error_message,
            gas_used: self.gas_used.map(|g| g.max(0) as u64),
            metadata: self.metadata,
        })
    }
}

pub fn active_model(attempt: &RelayAttempt) -> ActiveModel {
    use sea_orm::ActiveValue::Set;
    ActiveModel {
        id: Set(attempt.id.clone()),
        relay_id: Set(attempt.relay_id.clone()),
        attempt_number: Set(attempt.attempt_number as i32),
        action: Set(attempt.action.to_string()),
        status: Set(attempt.status.to_string()),
        started_at: Set(attempt.started_at),
        completed_at: Set(attempt.completed_at),
        tx_hash: Set(attempt.tx_hash.clone()),
        error_message: Set(attempt.error_message.clone()),
        gas_used: Set(attempt.gas_used.map(|g| g as i64)),
        metadata: Set(attempt.metadata.clone()),
    }
}
