use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Report, Result};
use futures_util::future::select_all;
use tokio::task::JoinHandle;
use tracing::{info_span, instrument::Instrumented, Instrument};

use crate::{metrics::CoreMetrics, settings::LoadableFromSettings, settings::Settings};

/// A fundamental agent which does not make any assumptions about the tools
/// which are used.
#[async_trait]
pub trait BaseAgent: Send + Sync + Debug {
    /// The agent's name.
    const AGENT_NAME: &'static str;

    /// The settings object for this agent.
    type Settings: LoadableFromSettings;

    /// Instantiate the agent from the standard settings object.
    async fn from_settings(settings: Self::Settings, metrics: Arc<CoreMetrics>) -> Result<Self>
    where
        Self: Sized;

    /// Start running this agent.
    #[allow(clippy::async_yields_async)]
    async fn run(self) -> Instrumented<JoinHandle<Result<()>>>;
}

/// Call this from `main` to fully initialize and run the agent for its
/// entire lifecycle. Installs the report handler, starts tracing and the
/// metrics server, then hands control to the agent.
pub async fn agent_main<A: BaseAgent>() -> Result<()> {
    color_eyre::install()?;

    let settings = A::Settings::load()?;
    let core_settings: &Settings = settings.as_ref();
    core_settings.tracing.start_tracing()?;

    let metrics = Arc::new(CoreMetrics::new(
        A::AGENT_NAME,
        Some(core_settings.metrics_port),
        prometheus::Registry::new(),
    )?);
    let _metrics_server = Arc::clone(&metrics).run_http_server();

    let agent = A::from_settings(settings, metrics).await?;
    agent.run().await.await?
}

/// Utility to run multiple tasks and shutdown if any one task ends.
#[allow(clippy::unit_arg, unused_must_use)]
pub fn run_all(
    tasks: Vec<Instrumented<JoinHandle<Result<(), Report>>>>,
) -> Instrumented<JoinHandle<Result<()>>> {
    debug_assert!(!tasks.is_empty(), "No tasks submitted");
    let span = info_span!("run_all");
    tokio::spawn(async move {
        let (res, _, remaining) = select_all(tasks).await;

        for task in remaining.into_iter() {
            crate::cancel_task!(task);
        }

        res?
    })
    .instrument(span)
}
