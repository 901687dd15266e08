//! Wiring of the engine components.
//!
//! [`Engine::start`] connects to Postgres, Redis and NATS and builds the
//! orchestrator, executor, launcher and scheduler on top of them.
//! [`Engine::run`] then consumes node tasks and polls schedules until the
//! shutdown token is cancelled, and returns once every in-flight task,
//! dispatch and poll has finished.

use crate::config::EngineConfig;
use crate::db::{
    PgRunRepository, PgScheduleRepository, PgTriggerWatchRepository, PgWorkflowRepository,
};
use crate::error::StartupError;
use runwright_core::Result;
use runwright_scheduler::Scheduler;
use runwright_trigger::{EventPoller, EventSource, PollerConfig};
use runwright_workflow::task::NODE_EXECUTION_ROUTING_KEY;
use runwright_workflow::{
    DistributedLock, Executor, HandlerRegistry, LockedLauncher, NatsTaskQueue, Orchestrator,
    RedisCache, SharedCache, TaskHandler, TaskQueue,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A running engine process.
pub struct Engine {
    pool: PgPool,
    cache: Arc<dyn SharedCache>,
    queue: Arc<NatsTaskQueue>,
    queue_name: String,
    executor: Arc<Executor>,
    launcher: Arc<LockedLauncher>,
    scheduler: Arc<Scheduler>,
    poller_config: PollerConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Engine {
    /// Connects to the backing services and builds the components.
    ///
    /// `registry` holds the node handlers; register provider-backed actions
    /// (email, calendar) on it before starting.
    ///
    /// # Errors
    ///
    /// Returns an error if a backing service is unreachable or the schema
    /// migrations fail.
    pub async fn start(config: EngineConfig, registry: HandlerRegistry) -> Result<Self, StartupError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| StartupError::Database {
                details: e.to_string(),
            })?;

        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StartupError::Migrations {
                details: e.to_string(),
            })?;

        let cache: Arc<dyn SharedCache> = Arc::new(
            RedisCache::connect(&config.redis_url)
                .await
                .map_err(|e| StartupError::Cache {
                    details: e.to_string(),
                })?,
        );

        let queue = Arc::new(
            NatsTaskQueue::connect(&config.nats.queue_config())
                .await
                .map_err(|e| StartupError::Queue {
                    details: e.to_string(),
                })?,
        );

        let graphs = Arc::new(PgWorkflowRepository::new(pool.clone()));
        let runs = Arc::new(PgRunRepository::new(pool.clone()));
        let registry = Arc::new(registry);

        let orchestrator = Arc::new(
            Orchestrator::new(
                graphs.clone(),
                runs.clone(),
                queue.clone(),
                cache.clone(),
                registry.clone(),
            )
            .with_running_set_ttl(config.locks.running_set_ttl()),
        );
        let executor = Arc::new(Executor::new(
            graphs,
            runs,
            queue.clone(),
            cache.clone(),
            registry,
        ));
        let launcher = Arc::new(LockedLauncher::new(
            orchestrator,
            DistributedLock::new(cache.clone()),
            config.locks.run_lock_ttl(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(PgScheduleRepository::new(pool.clone())),
            launcher.clone(),
            config.scheduler.scheduler_config(),
        ));

        Ok(Self {
            pool,
            cache,
            queue,
            queue_name: config.nats.queue.clone(),
            executor,
            launcher,
            scheduler,
            poller_config: config.pollers.poller_config(&config.locks),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Token that stops the engine when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Repository for saving and loading workflows.
    #[must_use]
    pub fn workflows(&self) -> PgWorkflowRepository {
        PgWorkflowRepository::new(self.pool.clone())
    }

    /// Starts polling the watches served by `source`.
    ///
    /// The poller runs until shutdown and is drained with the other
    /// components.
    pub fn spawn_poller(&self, source: Arc<dyn EventSource>) {
        let kind = source.kind();
        let poller = EventPoller::new(
            Arc::new(PgTriggerWatchRepository::new(self.pool.clone())),
            source,
            self.launcher.clone(),
            DistributedLock::new(self.cache.clone()),
            self.poller_config,
        );
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move { poller.run(shutdown).await });
        tracing::info!(kind = kind.as_str(), "Event poller spawned");
    }

    /// Runs until the shutdown token is cancelled, then drains.
    pub async fn run(self) {
        let handler: Arc<dyn TaskHandler> = self.executor.clone();
        let queue = self.queue.clone();
        let queue_name = self.queue_name.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let bindings = [NODE_EXECUTION_ROUTING_KEY.to_string()];
            if let Err(e) = queue
                .subscribe(&queue_name, &bindings, handler, shutdown.clone())
                .await
            {
                tracing::error!(error = %e, "Task consumer stopped; shutting down");
            }
            shutdown.cancel();
        });

        let scheduler = self.scheduler.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move { scheduler.run(shutdown).await });

        tracing::info!(queue = %self.queue_name, "Engine running");
        self.shutdown.cancelled().await;

        tracing::info!("Shutting down, draining in-flight work");
        self.tasks.close();
        self.tasks.wait().await;
        self.pool.close().await;
        tracing::info!("Engine stopped");
    }
}
