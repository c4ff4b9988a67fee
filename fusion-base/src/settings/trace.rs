use serde::Deserialize;
use tracing_subscriber::filter::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-oriented single-line output.
    #[default]
    Pretty,
    /// Newline-delimited JSON for collectors.
    Json,
}

/// Tracing configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TracingConfig {
    /// Filter directives, `RUST_LOG` syntax. Defaults to `info`.
    #[serde(default)]
    pub level: Option<String>,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl TracingConfig {
    /// Install the global subscriber. Call exactly once, from `agent_main`.
    pub fn start_tracing(&self) -> eyre::Result<()> {
        let filter = match &self.level {
            Some(directives) => EnvFilter::try_new(directives)?,
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        };
        match self.format {
            LogFormat::Pretty => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .try_init()
                    .map_err(|err| eyre::eyre!("failed to init tracing: {err}"))?;
            }
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .try_init()
                    .map_err(|err| eyre::eyre!("failed to init tracing: {err}"))?;
            }
        }
        Ok(())
    }
}
