//! sea-orm entities mirroring the normative truth schema. The authoritative
//! DDL lives in `migrations/`; these models must stay in lock-step with it.

pub mod breaker;
pub mod chain_state;
pub mod relay;
pub mod relay_attempt;
pub mod snapshot;
