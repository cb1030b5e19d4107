use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use console::style;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ServeFlags, apply_serve_flags};
use crate::config::AppConfig;
use crate::core::lifecycle::{LifecycleComponent, LifecycleManager};
use crate::core::orchestrator::{Orchestrator, OrchestratorSettings, RunnerRegistry};
use crate::core::store;
use crate::core::terminal::{self, GuideSection};
use crate::interfaces::web::{ApiServer, ApiServerConfig};
use crate::logging;

/// Extra time on top of the cancel grace for workers to record their final
/// transition.
const SCHEDULER_DRAIN_SLACK: Duration = Duration::from_secs(5);

/// Runs the scheduler loop between start and shutdown.
struct SchedulerComponent {
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerComponent {
    fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }
}

#[async_trait]
impl LifecycleComponent for SchedulerComponent {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn on_init(&mut self) -> Result<()> {
        let failed = self
            .orchestrator
            .recover_interrupted()
            .await
            .context("crash recovery failed")?;
        if failed > 0 {
            warn!("Failed {} run(s) interrupted by a previous process", failed);
        }
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let orchestrator = self.orchestrator.clone();
        self.handle = Some(tokio::spawn(
            orchestrator.run_scheduler(self.shutdown.clone()),
        ));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.shutdown.cancel();
        let budget = self.orchestrator.settings().cancel_grace + SCHEDULER_DRAIN_SLACK;
        if let Some(handle) = self.handle.take()
            && tokio::time::timeout(budget, handle).await.is_err()
        {
            warn!("Scheduler did not drain within {:?}", budget);
        }
        Ok(())
    }
}

pub async fn run_serve(flags: &ServeFlags) -> Result<()> {
    let mut config = AppConfig::load(flags.config.as_deref())?;
    apply_serve_flags(&mut config, flags);
    let log_tx = logging::init_tracing(&config.logging, false);

    info!("Starting agent-core {}", env!("CARGO_PKG_VERSION"));
    let store = store::connect(&config.db)
        .await
        .context("could not open the database")?;

    let runners = RunnerRegistry::from_config(&config.runner);
    let settings = OrchestratorSettings::from_config(&config);
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), runners, settings));

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(Mutex::new(SchedulerComponent::new(
        orchestrator.clone(),
    ))));
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(ApiServerConfig {
        orchestrator: orchestrator.clone(),
        log_tx,
        api_host: config.server.host.clone(),
        api_port: config.server.port,
    }))));

    if let Err(e) = lifecycle.start().await {
        lifecycle.shutdown().await;
        store.close().await;
        return Err(e);
    }

    terminal::print_banner();
    GuideSection::new("agent-core")
        .status(
            "API",
            &format!(
                "{}",
                style(format!(
                    "http://{}:{}",
                    config.server.host, config.server.port
                ))
                .underlined()
                .cyan()
            ),
        )
        .status("Database", store.dialect().as_str())
        .status(
            "Slots",
            &config.runtime.max_concurrent_runs.to_string(),
        )
        .blank()
        .status(
            "Press Ctrl+C to stop.",
            &format!("{}", style("Ctrl+C").bold().yellow()),
        )
        .print();
    println!();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down agent-core...");
    lifecycle.shutdown().await;
    store.close().await;
    terminal::print_goodbye();
    Ok(())
}
