use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use tokio::task::JoinHandle;
use tracing::{info, info_span, instrument::Instrumented, Instrument};

use fusion_base::settings::Settings;
use fusion_base::{
    run_all, BaseAgent, BreakerConfig, BreakerRegistry, CoreMetrics, ThrottledExecutor,
};
use fusion_store::archive::{default_policies, Archiver};
use fusion_store::migrate::Migrator;
use fusion_store::{HybridStore, PostgresStore, RedisStore, RelayStore, StoreMode};

use crate::chains::build_gateways;
use crate::engine::{EngineMetrics, RelayEngine};
use crate::monitor::{spawn_archival, PerformanceMonitor};
use crate::settings::RelayerSettings;

/// The relayer agent.
pub struct Relayer {
    settings: Settings,
    metrics: Arc<CoreMetrics>,
    store: Arc<dyn RelayStore>,
    archiver: Option<Archiver>,
    throttler: ThrottledExecutor,
    breakers: Arc<BreakerRegistry>,
    engine: Arc<RelayEngine>,
}

impl std::fmt::Debug for Relayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relayer")
            .field("chains", &self.settings.chains.keys().collect::<Vec<_>>())
            .field("store_mode", &self.settings.store.mode)
            .finish_non_exhaustive()
    }
}

impl Relayer {
    /// The engine, for embedders feeding relays in directly.
    pub fn engine(&self) -> Arc<RelayEngine> {
        Arc::clone(&self.engine)
    }

    async fn build_store(
        settings: &Settings,
    ) -> Result<(Arc<dyn RelayStore>, Option<PostgresStore>)> {
        let store_cfg = &settings.store;
        Ok(match store_cfg.mode {
            StoreMode::Postgres => {
                let pg = PostgresStore::connect(store_cfg.postgres_required()?).await?;
                (Arc::new(pg.clone()) as Arc<dyn RelayStore>, Some(pg))
            }
            StoreMode::Redis => {
                let cache =
                    RedisStore::connect(store_cfg.redis_required()?, &store_cfg.cache).await?;
                (Arc::new(cache) as Arc<dyn RelayStore>, None)
            }
            StoreMode::Hybrid => {
                let pg = PostgresStore::connect(store_cfg.postgres_required()?).await?;
                let cache =
                    RedisStore::connect(store_cfg.redis_required()?, &store_cfg.cache).await?;
                let hybrid = HybridStore::new(Arc::new(pg.clone()), Arc::new(cache));
                (Arc::new(hybrid) as Arc<dyn RelayStore>, Some(pg))
            }
        })
    }
}

#[async_trait]
impl BaseAgent for Relayer {
    const AGENT_NAME: &'static str = "relayer";

    type Settings = RelayerSettings;

    async fn from_settings(settings: Self::Settings, metrics: Arc<CoreMetrics>) -> Result<Self> {
        let base: Settings = settings.as_ref().clone();
        let (store, pg) = Self::build_store(&base).await?;

        // Bring the truth schema up before anything touches it.
        let archiver = match &pg {
            Some(pg) => {
                let applied_by = format!("{}@{}", Self::AGENT_NAME, std::process::id());
                let dir = &base.store.postgres_required()?.migrations_dir;
                let migrator = Migrator::new(pg.connection().clone(), dir, applied_by);
                let applied = migrator.migrate().await?;
                info!(applied, "schema migrations applied");
                Some(Archiver::new(
                    pg.connection().clone(),
                    default_policies(
                        std::time::Duration::from_secs(base.archival.relay_retention_secs),
                        std::time::Duration::from_secs(base.archival.snapshot_retention_secs),
                    ),
                )?)
            }
            None => None,
        };

        let throttler = ThrottledExecutor::new(base.throttle);
        let breakers = Arc::new(BreakerRegistry::new(
            Arc::clone(&store),
            BreakerConfig::default(),
        ));
        let gateways = build_gateways(&base, &throttler, &breakers)?;
        let engine = Arc::new(RelayEngine::new(
            Arc::clone(&store),
            gateways,
            &base,
            EngineMetrics::new(&metrics),
        ));

        Ok(Self {
            settings: base,
            metrics,
            store,
            archiver,
            throttler,
            breakers,
            engine,
        })
    }

    async fn run(self) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("relayer");
        let mut tasks = Arc::clone(&self.engine).spawn_workers();

        for gateway in self.engine.gateways.values() {
            tasks.push(gateway.pool().spawn_health_checks());
        }

        if self.settings.monitor.enabled {
            let monitor = PerformanceMonitor::new(
                Arc::clone(&self.store),
                Arc::clone(&self.engine),
                self.throttler.clone(),
                Arc::clone(&self.breakers),
                Arc::clone(&self.metrics),
                self.settings.monitor.clone(),
            );
            tasks.push(monitor.spawn());
        }

        if self.settings.archival.enabled {
            match spawn_archival(
                Arc::clone(&self.store),
                self.archiver,
                self.settings.archival.clone(),
            ) {
                Ok(task) => tasks.push(task),
                Err(err) => return tokio::spawn(async move { Err(err) }).instrument(span),
            }
        }

        run_all(tasks)
    }
}
