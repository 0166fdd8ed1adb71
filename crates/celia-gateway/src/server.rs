use std::sync::Arc;

use axum::Router;
use celia_agents::{Assistant, MessageEnhancer};
use celia_channels::Connector;
use celia_common::{Error, Result};
use celia_config::GatewayConfig;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::router::build_router;
use crate::state::AppState;

/// Webhook server that hands connector messages to the assistant.
pub struct MessageGateway {
    state: AppState,
}

impl MessageGateway {
    pub fn new(
        config: GatewayConfig,
        assistant: Arc<Assistant>,
        enhancer: Option<Arc<dyn MessageEnhancer>>,
    ) -> Self {
        Self {
            state: AppState::new(config, assistant, enhancer),
        }
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.state.history_limit = history_limit;
        self
    }

    pub fn register_connector(&mut self, connector: Arc<dyn Connector>) -> Result<()> {
        self.state.connectors.register(connector)
    }

    pub fn connectors(&self) -> Vec<&str> {
        self.state.connectors.list()
    }

    /// The complete HTTP surface, without binding a listener.
    pub fn router(self) -> Router {
        build_router(Arc::new(self.state))
    }

    /// Bind, register webhooks, and serve until Ctrl-C or SIGTERM. Connectors
    /// are shut down before returning.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let webhook_url = self.state.config.webhook_url.clone();

        let state = Arc::new(self.state);
        let app = build_router(Arc::clone(&state));

        let listener = TcpListener::bind(&addr).await?;
        info!("Celia gateway listening on {}", addr);

        state.spawn_session_cleanup();

        match webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => state.connectors.startup_all(url).await?,
            None if state.connectors.is_empty() => {}
            None => warn!("WEBHOOK_URL is not set, connectors will not receive updates"),
        }

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        state.connectors.shutdown_all().await;
        info!("Celia gateway stopped");

        served.map_err(|e| Error::Gateway(format!("server error: {e}")))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(e) => {
                warn!("failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received, shutting down");
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
