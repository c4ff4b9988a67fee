use sea_orm::entity::prelude::*;

use fusion_core::{ChainState, ChainStatus, StoreError, StoreResult};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "chain_states")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub chain_id: String,
    pub last_processed_block: i64,
    pub last_processed_height: i64,
    pub status: String,
    pub last_updated: i64,
    pub error_count: i32,
    pub last_error: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_domain(self) -> StoreResult<ChainState> {
        let status: ChainStatus = self
            .status
            .parse()
            .map_err(|_| StoreError::Schema(format!("unknown chain status `{}`", self.status)))?;
        Ok(ChainState {
            chain_id: self.chain_id,
            last_processed_block: self.last_processed_block.max(0) as u64,
            last_processed_height: self.last_processed_height.max(0) as u64,
            status,
            last_updated: self.last_updated,
            error_count: self.error_count.max(0) as u32,
            last_error: self.last_error,
        })
    }
}

pub fn active_model(state: &ChainState) -> ActiveModel {
    use sea_orm::ActiveValue::Set;
    ActiveModel {
        chain_id: Set(state.chain_id.clone()),
        last_processed_block: Set(state.last_processed_block as i64),
        last_processed_height: Set(state.last_processed_height as i64),
        status: Set(state.status.to_string()),
        last_updated: Set(state.last_updated),
        error_count: Set(state.error_count as i32),
        last_error: Set(state.last_error.clone()),
    }
}
