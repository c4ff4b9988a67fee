//! Test support for the fusion relayer workspace: an in-memory store
//! provider, a fault-injecting store wrapper, and a scripted chain client.

mod memory_store;
mod mock_chain;

pub use memory_store::{FaultyStore, MemoryStore};
pub use mock_chain::{ChainOp, MockChainClient};

use fusion_core::{Relay, RouteHop};

/// A plausible relay fixture with a one-hop route and a far-away timelock.
pub fn sample_relay(id: &str, timelock: i64) -> Relay {
    Relay::new(
        id,
        "ethereum",
        "osmosis-1",
        format!("htlc-{id}"),
        "0xa11ce",
        "osmo1b0b",
        "1500000",
        "uosmo",
        "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
        timelock,
        vec![RouteHop {
            from_chain: "ethereum".into(),
            to_chain: "osmosis-1".into(),
            channel: None,
        }],
    )
}
