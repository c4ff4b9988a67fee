//! Relayer entry point.

use eyre::Result;

use fusion_base::agent_main;
use relayer::Relayer;

#[tokio::main]
async fn main() -> Result<()> {
    agent_main::<Relayer>().await
}
