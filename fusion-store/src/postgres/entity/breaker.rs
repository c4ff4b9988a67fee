use sea_orm::entity::prelude::*;

use fusion_core::{CircuitBreakerState, CircuitState, StoreError, StoreResult};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "circuit_breaker_states")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub name: String,
    pub state: String,
    pub failures: i32,
    pub successes: i32,
    pub last_failure_time: Option<i64>,
    pub last_success_time: Option<i64>,
    pub next_attempt: Option<i64>,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_domain(self) -> StoreResult<CircuitBreakerState> {
        let state: CircuitState = self
            .state
            .parse()
            .map_err(|_| StoreError::Schema(format!("unknown breaker state `{}`", self.state)))?;
        Ok(CircuitBreakerState {
            name: self.name,
            state,
            failures: self.failures.max(0) as u32,
            successes: self.successes.max(0) as u32,
            last_failure_time: self.last_failure_time,
            last_success_time: self.last_success_time,
            next_attempt: self.next_attempt,
            updated_at: self.updated_at,
        })
    }
}

pub fn active_model(state: &CircuitBreakerState) -> ActiveModel {
    use sea_orm::ActiveValue::Set;
    ActiveModel {
        name: Set(state.name.clone()),
        state: Set(state.state.to_string()),
        failures: Set(state.failures as i32),
        successes: Set(state.successes as i32),
        last_failure_time: Set(state.last_failure_time),
        last_success_time: Set(state.last_success_time),
        next_attempt: Set(state.next_attempt),
        updated_at: Set(state.updated_at),
    }
}
