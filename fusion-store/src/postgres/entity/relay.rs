use sea_orm::entity::prelude::*;

use fusion_core::{Relay, RelayStatus, StoreError, StoreResult};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "pending_relays")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub source_chain: String,
    pub target_chain: String,
    pub htlc_id: String,
    pub sender: String,
    pub recipient: String,
    pub amount: String,
    pub token: String,
    pub hashlock: String,
    pub timelock: i64,
    pub route: Json,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub metadata: Option<Json>,
    // Worker leasing; not part of the wire-visible entity.
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::relay_attempt::Entity")]
    Attempts,
}

impl Related<super::relay_attempt::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Attempts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_domain(self) -> StoreResult<Relay> {
        let status: RelayStatus = self
            .status
            .parse()
            .map_err(|_| StoreError::Schema(format!("unknown relay status `{}`", self.status)))?;
        Ok(Relay {
            id: self.id,
            source_chain: self.source_chain,
            target_chain: self.target_chain,
            htlc_id: self.htlc_id,
            sender: self.sender,
            recipient: self.recipient,
            amount: self.amount,
            token: self.token,
            hashlock: self.hashlock,
            timelock: self.timelock,
            route: serde_json::from_value(self.route)?,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            retry_count: self.retry_count.max(0) as u32,
            last_error: self.last_error,
            metadata: self.metadata.unwrap_or(serde_json::Value::Null),
        })
    }
}

pub fn active_model(relay: &Relay) -> StoreResult<ActiveModel> {
    use sea_orm::ActiveValue::Set;
    Ok(ActiveModel {
        id: Set(relay.id.clone()),
        source_chain: Set(relay.source_chain.clone()),
        target_chain: Set(relay.target_chain.clone()),
        htlc_id: Set(relay.htlc_id.clone()),
        sender: Set(relay.sender.clone()),
        recipient: Set(relay.recipient.clone()),
        amount: Set(relay.amount.clone()),
        token: Set(relay.token.clone()),
        hashlock: Set(relay.hashlock.clone()),
        timelock: Set(relay.timelock),
        route: Set(serde_json::to_value(&relay.route)?),
        status: Set(relay.status.to_string()),
        created_at: Set(relay.created_at),
        updated_at: Set(relay.updated_at),
        retry_count: Set(relay.retry_count as i32),
        last_error: Set(relay.last_error.clone()),
        metadata: Set(match &relay.metadata {
            serde_json::Value::Null => None,
            other => Some(other.clone()),
        }),
        // Lease columns are owned by the leasing statements, never by saves.
        lease_owner: sea_orm::ActiveValue::NotSet,
        lease_expiry: sea_orm::ActiveValue::NotSet,
    })
}
