use std::sync::Arc;

use async_trait::async_trait;
use nostr_events::{Filter, SignedEvent};
use tracing::info;

use crate::memory::InMemoryRelayService;
use crate::publish::PublishOutcome;
use crate::state::{ConnectionState, StateListener, StateListenerHandle};
use crate::subscription::SubscriptionCallbacks;
use crate::{PoolConfig, PoolError, RelayBackend, RelayPool};

/// Relay access as seen by the rest of the application.
///
/// [`RelayPool`] talks to real relays; [`InMemoryRelayService`] keeps
/// everything local. Pick one with [`build_service`].
#[async_trait]
pub trait RelayService: Send + Sync {
    async fn connect(&self) -> Result<(), PoolError>;

    fn disconnect(&self);

    fn subscribe(
        &self,
        id: &str,
        filters: Vec<Filter>,
        callbacks: SubscriptionCallbacks,
    ) -> Result<(), PoolError>;

    fn unsubscribe(&self, id: &str);

    async fn get_events(&self, filters: Vec<Filter>) -> Result<Vec<SignedEvent>, PoolError>;

    async fn publish(&self, event: &SignedEvent) -> PublishOutcome;

    fn state(&self) -> ConnectionState;

    fn add_state_listener(&self, listener: StateListener) -> StateListenerHandle;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

#[async_trait]
impl RelayService for RelayPool {
    async fn connect(&self) -> Result<(), PoolError> {
        RelayPool::connect(self).await
    }

    fn disconnect(&self) {
        RelayPool::disconnect(self)
    }

    fn subscribe(
        &self,
        id: &str,
        filters: Vec<Filter>,
        callbacks: SubscriptionCallbacks,
    ) -> Result<(), PoolError> {
        RelayPool::subscribe(self, id, filters, callbacks)
    }

    fn unsubscribe(&self, id: &str) {
        RelayPool::unsubscribe(self, id)
    }

    async fn get_events(&self, filters: Vec<Filter>) -> Result<Vec<SignedEvent>, PoolError> {
        RelayPool::get_events(self, filters).await
    }

    async fn publish(&self, event: &SignedEvent) -> PublishOutcome {
        RelayPool::publish(self, event).await
    }

    fn state(&self) -> ConnectionState {
        RelayPool::state(self)
    }

    fn add_state_listener(&self, listener: StateListener) -> StateListenerHandle {
        self.add_shared_listener(listener)
    }

    fn backend(&self) -> &'static str {
        "network"
    }
}

#[async_trait]
impl RelayService for InMemoryRelayService {
    async fn connect(&self) -> Result<(), PoolError> {
        InMemoryRelayService::connect(self);
        Ok(())
    }

    fn disconnect(&self) {
        InMemoryRelayService::disconnect(self)
    }

    fn subscribe(
        &self,
        id: &str,
        filters: Vec<Filter>,
        callbacks: SubscriptionCallbacks,
    ) -> Result<(), PoolError> {
        InMemoryRelayService::subscribe(self, id, filters, callbacks)
    }

    fn unsubscribe(&self, id: &str) {
        InMemoryRelayService::unsubscribe(self, id)
    }

    async fn get_events(&self, filters: Vec<Filter>) -> Result<Vec<SignedEvent>, PoolError> {
        InMemoryRelayService::get_events(self, filters)
    }

    async fn publish(&self, event: &SignedEvent) -> PublishOutcome {
        InMemoryRelayService::publish(self, event)
    }

    fn state(&self) -> ConnectionState {
        InMemoryRelayService::state(self)
    }

    fn add_state_listener(&self, listener: StateListener) -> StateListenerHandle {
        InMemoryRelayService::add_state_listener(self, listener)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Build the service selected by `config.backend`.
pub fn build_service(config: PoolConfig) -> Result<Arc<dyn RelayService>, PoolError> {
    let service: Arc<dyn RelayService> = match config.backend {
        RelayBackend::Network => Arc::new(RelayPool::with_websockets(config)?),
        RelayBackend::InMemory => Arc::new(InMemoryRelayService::new(config)?),
    };
    info!(backend = service.backend(), "Built relay service");
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_service_picks_backend() {
        let memory = build_service(
            PoolConfig::new(["wss://a.example"]).with_backend(RelayBackend::InMemory),
        )
        .unwrap();
        assert_eq!(memory.backend(), "memory");

        let network = build_service(PoolConfig::new(["wss://a.example"])).unwrap();
        assert_eq!(network.backend(), "network");
    }

    #[test]
    fn test_build_service_rejects_bad_urls() {
        let result = build_service(PoolConfig::new(["ftp://a.example"]));
        assert!(matches!(result, Err(PoolError::InvalidUrl { .. })));
    }
}
