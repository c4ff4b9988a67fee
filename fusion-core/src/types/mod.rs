pub use attempt::*;
pub use breaker::*;
pub use chain_state::*;
pub use relay::*;
pub use snapshot::*;

mod attempt;
mod breaker;
mod chain_state;
mod relay;
mod snapshot;
