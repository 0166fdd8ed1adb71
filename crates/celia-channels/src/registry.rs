use std::sync::Arc;

use celia_common::{Error, Result};
use tracing::{info, warn};

use crate::traits::{Connector, ConnectorStatus, OnMessageFn};

/// Connectors registered with the gateway, in registration order.
pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Adds a connector. A second connector with the same name is rejected.
    pub fn register(&mut self, connector: Arc<dyn Connector>) -> Result<()> {
        let name = connector.name().to_string();
        if self.get(&name).is_some() {
            return Err(Error::Channel(format!(
                "connector '{name}' is already registered"
            )));
        }
        info!("registered connector: {}", name);
        self.connectors.push(connector);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Connector>> {
        self.connectors.iter().find(|c| c.name() == name)
    }

    pub fn list(&self) -> Vec<&str> {
        self.connectors.iter().map(|c| c.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn statuses(&self) -> Vec<(String, ConnectorStatus)> {
        self.connectors
            .iter()
            .map(|c| (c.name().to_string(), c.status()))
            .collect()
    }

    /// All connector webhook routes merged into one router.
    pub fn router(&self, on_message: OnMessageFn) -> axum::Router {
        self.connectors
            .iter()
            .fold(axum::Router::new(), |router, connector| {
                router.merge(connector.router(Arc::clone(&on_message)))
            })
    }

    pub async fn startup_all(&self, webhook_url: &str) -> Result<()> {
        for connector in &self.connectors {
            info!("starting connector: {}", connector.name());
            connector.startup(webhook_url).await?;
        }
        Ok(())
    }

    /// Shuts every connector down, logging failures instead of stopping early.
    pub async fn shutdown_all(&self) {
        for connector in &self.connectors {
            info!("shutting down connector: {}", connector.name());
            if let Err(e) = connector.shutdown().await {
                warn!("connector {} shutdown failed: {e}", connector.name());
            }
        }
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::routing::get;
    use celia_common::OutboundMessage;
    use std::sync::Mutex;

    struct FakeConnector {
        name: &'static str,
        fail_shutdown: bool,
        status: Mutex<ConnectorStatus>,
    }

    impl FakeConnector {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                fail_shutdown: false,
                status: Mutex::new(ConnectorStatus::Disconnected),
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        fn name(&self) -> &str {
            self.name
        }

        fn display_name(&self) -> &str {
            self.name
        }

        fn router(&self, _on_message: OnMessageFn) -> axum::Router {
            axum::Router::new().route(&format!("/{}/webhook", self.name), get(|| async { "ok" }))
        }

        async fn startup(&self, _webhook_url: &str) -> Result<()> {
            *self.status.lock().unwrap() = ConnectorStatus::Connected;
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            *self.status.lock().unwrap() = ConnectorStatus::Disconnected;
            if self.fail_shutdown {
                return Err(Error::Channel("boom".into()));
            }
            Ok(())
        }

        async fn send_message(&self, _chat_id: &str, _message: &OutboundMessage) -> Result<()> {
            Ok(())
        }

        fn status(&self) -> ConnectorStatus {
            self.status.lock().unwrap().clone()
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(FakeConnector::new("telegram"))).unwrap();
        assert!(registry.register(Arc::new(FakeConnector::new("telegram"))).is_err());
        assert_eq!(registry.list(), vec!["telegram"]);
    }

    #[tokio::test]
    async fn lifecycle_updates_statuses_and_survives_shutdown_errors() {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(FakeConnector::new("a"))).unwrap();
        registry
            .register(Arc::new(FakeConnector {
                fail_shutdown: true,
                ..FakeConnector::new("b")
            }))
            .unwrap();

        registry.startup_all("https://example.test").await.unwrap();
        assert!(
            registry
                .statuses()
                .iter()
                .all(|(_, s)| *s == ConnectorStatus::Connected)
        );

        registry.shutdown_all().await;
        assert!(
            registry
                .statuses()
                .iter()
                .all(|(_, s)| *s == ConnectorStatus::Disconnected)
        );
    }
}
