mod error;
mod handlers;
mod router;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::Orchestrator;
use crate::core::tools::{ToolExecutor, ToolRegistry};

pub(crate) use router::build_api_router;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) orchestrator: Arc<Orchestrator>,
    pub(crate) tools: ToolExecutor,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) log_tx: broadcast::Sender<String>,
    pub(crate) api_port: u16,
}

impl AppState {
    pub(crate) fn new(
        orchestrator: Arc<Orchestrator>,
        log_tx: broadcast::Sender<String>,
        api_port: u16,
    ) -> Self {
        Self {
            tools: ToolExecutor::new(orchestrator.clone()),
            orchestrator,
            registry: Arc::new(ToolRegistry::with_builtin()),
            log_tx,
            api_port,
        }
    }
}

pub struct ApiServerConfig {
    pub orchestrator: Arc<Orchestrator>,
    pub log_tx: broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
}

/// The HTTP surface as a lifecycle component: bound on start, drained on
/// shutdown.
pub struct ApiServer {
    config: ApiServerConfig,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| {
        match msg {
            Ok(log) => Ok(Event::default().data(log)), // SSE properly encodes this
            Err(_) => Ok(Event::default().data("Log stream lagged")),
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    fn name(&self) -> &'static str {
        "api server"
    }

    async fn on_init(&mut self) -> Result<()> {
        info!("API server initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.config.api_host, self.config.api_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind API server to {}", addr))?;

        let state = AppState::new(
            self.config.orchestrator.clone(),
            self.config.log_tx.clone(),
            self.config.api_port,
        );
        let app = build_api_router(state);
        let shutdown = self.shutdown.clone();

        self.handle = Some(tokio::spawn(async move {
            info!("API server running at http://{addr}");
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!("API server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API server shutting down...");
        self.shutdown.cancel();
        // Open SSE streams never finish on their own.
        if let Some(handle) = self.handle.take()
            && tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err()
        {
            warn!("API server did not drain within {:?}", DRAIN_TIMEOUT);
        }
        Ok(())
    }
}
