//! Connection lifecycle of the relay pool.
//!
//! `connect()` races the primary relays under `primary_timeout` and returns
//! on the first success; the remaining attempts keep running in a background
//! task. If every primary fails, a sweep over all relays runs under
//! `fallback_timeout`. Each `connect()`/`disconnect()` bumps a generation so
//! results from superseded attempts are dropped instead of installed.
//! Relays with an attempt still in flight are tracked so `publish()` can
//! wait for them.
//!
//! Lock order: `subscriptions` before `links`, broadcaster state before
//! `links`. No lock is held across an await or while user callbacks run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::message::{ClientMessage, RelayMessage};
use crate::publish::PendingOks;
use crate::state::{
    lock, ConnectionState, ConnectionStatus, StateBroadcaster, StateListener, StateListenerHandle,
};
use crate::subscription::SubscriptionRegistry;
use crate::transport::{RelayLink, RelayTransport, WebSocketTransport};
use crate::{PoolConfig, PoolError, RelayUrl};

pub(crate) const LOST_ALL_RELAYS: &str = "lost connection to all relays";

type ConnectAttempt = BoxFuture<'static, (RelayUrl, Result<RelayLink, PoolError>)>;

/// Handle to a set of relay connections. Cheap to clone; all clones share
/// the same connections, subscriptions and state.
#[derive(Clone)]
pub struct RelayPool {
    pub(crate) inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) relays: Vec<RelayUrl>,
    transport: Arc<dyn RelayTransport>,
    pub(crate) broadcaster: Arc<StateBroadcaster>,
    links: Mutex<Links>,
    pub(crate) subscriptions: Mutex<SubscriptionRegistry>,
    pub(crate) pending_oks: Mutex<PendingOks>,
    background: Mutex<Vec<JoinHandle<()>>>,
    // Signalled whenever a connection attempt finishes or links are reset.
    link_changes: Notify,
}

#[derive(Default)]
struct Links {
    generation: u64,
    live: HashMap<RelayUrl, LiveLink>,
    /// In-flight connection attempts of the current generation, per relay.
    connecting: HashMap<RelayUrl, usize>,
}

/// Where a relay stands for an outgoing message.
enum LinkStatus {
    Live(mpsc::UnboundedSender<ClientMessage>),
    Connecting,
    Down,
}

struct LiveLink {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    reader: JoinHandle<()>,
    generation: u64,
}

impl RelayPool {
    /// Build a pool over `transport`. Relay urls are validated here.
    pub fn new(config: PoolConfig, transport: Arc<dyn RelayTransport>) -> Result<Self, PoolError> {
        let relays = config.relay_urls()?;
        let broadcaster = StateBroadcaster::new(ConnectionState::new(relays.clone()));

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                relays,
                transport,
                broadcaster,
                links: Mutex::new(Links::default()),
                subscriptions: Mutex::new(SubscriptionRegistry::default()),
                pending_oks: Mutex::new(PendingOks::default()),
                background: Mutex::new(Vec::new()),
                link_changes: Notify::new(),
            }),
        })
    }

    /// Build a pool that talks WebSocket to real relays.
    pub fn with_websockets(config: PoolConfig) -> Result<Self, PoolError> {
        Self::new(config, Arc::new(WebSocketTransport))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Configured relays in priority order.
    pub fn relays(&self) -> &[RelayUrl] {
        &self.inner.relays
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.broadcaster.snapshot()
    }

    /// Register a state listener. It is invoked immediately with the current
    /// state and then on every transition. Transitions the listener itself
    /// causes (such as calling `disconnect`) are delivered after it returns.
    pub fn add_state_listener(
        &self,
        listener: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> StateListenerHandle {
        self.inner.broadcaster.add_listener(Arc::new(listener))
    }

    pub(crate) fn add_shared_listener(&self, listener: StateListener) -> StateListenerHandle {
        self.inner.broadcaster.add_listener(listener)
    }

    /// Connect to the configured relays.
    ///
    /// Returns once at least one relay is connected. Fails with
    /// [`PoolError::NoRelaysReachable`] only when every relay failed.
    pub async fn connect(&self) -> Result<(), PoolError> {
        let generation = self.reset();
        let relays = self.inner.relays.clone();

        if relays.is_empty() {
            let message = PoolError::NoRelaysConfigured.to_string();
            self.inner.broadcaster.update(|s| {
                s.status = ConnectionStatus::Error;
                s.connected_relays.clear();
                s.last_error = Some(message);
            });
            return Err(PoolError::NoRelaysConfigured);
        }

        self.inner.broadcaster.update(|s| {
            s.status = ConnectionStatus::Connecting;
            s.connected_relays.clear();
            s.relay_errors.clear();
            s.last_error = None;
        });

        let config = &self.inner.config;
        let split = config.primary_relays.clamp(1, relays.len());
        let (primary, secondary) = relays.split_at(split);
        info!(
            relays = relays.len(),
            primary = split,
            generation,
            "Connecting to relay pool"
        );

        let mut attempts: FuturesUnordered<ConnectAttempt> = primary
            .iter()
            .map(|url| self.attempt(generation, url.clone(), config.primary_timeout))
            .collect();
        if self.first_success(generation, &mut attempts).await {
            attempts.extend(
                secondary
                    .iter()
                    .map(|url| self.attempt(generation, url.clone(), config.fallback_timeout)),
            );
            self.continue_in_background(generation, attempts);
            return Ok(());
        }
        if !self.is_current(generation) {
            return Err(PoolError::Superseded);
        }

        warn!(
            relays = relays.len(),
            "No primary relay reachable, trying all relays"
        );
        let mut sweep: FuturesUnordered<ConnectAttempt> = relays
            .iter()
            .map(|url| self.attempt(generation, url.clone(), config.fallback_timeout))
            .collect();
        if self.first_success(generation, &mut sweep).await {
            self.continue_in_background(generation, sweep);
            return Ok(());
        }
        if !self.is_current(generation) {
            return Err(PoolError::Superseded);
        }

        let message = self.failure_summary();
        warn!(error = %message, "Failed to connect to any relay");
        self.inner.broadcaster.update(|s| {
            s.status = ConnectionStatus::Error;
            s.connected_relays.clear();
            s.last_error = Some(message.clone());
        });
        Err(PoolError::NoRelaysReachable(message))
    }

    /// Close every link and cancel every subscription. Safe to call more
    /// than once.
    pub fn disconnect(&self) {
        let cancelled = self.cancel_subscriptions();
        self.reset();
        self.inner.broadcaster.update(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.connected_relays.clear();
            s.last_error = None;
        });
        info!(subscriptions = cancelled, "Disconnected from relay pool");
    }

    /// Outbound channels of live links, in configured order.
    pub(crate) fn connected_links(&self) -> Vec<(RelayUrl, mpsc::UnboundedSender<ClientMessage>)> {
        let links = lock(&self.inner.links);
        self.inner
            .relays
            .iter()
            .filter_map(|url| {
                links
                    .live
                    .get(url)
                    .map(|link| (url.clone(), link.outbound.clone()))
            })
            .collect()
    }

    fn link_status(&self, url: &RelayUrl) -> LinkStatus {
        let links = lock(&self.inner.links);
        if let Some(link) = links.live.get(url) {
            LinkStatus::Live(link.outbound.clone())
        } else if links.connecting.contains_key(url) {
            LinkStatus::Connecting
        } else {
            LinkStatus::Down
        }
    }

    /// Wait until `url` has a live link, or until no attempt for it is left.
    pub(crate) async fn wait_for_link(
        &self,
        url: &RelayUrl,
    ) -> Option<mpsc::UnboundedSender<ClientMessage>> {
        loop {
            // Registered before the check so a change in between is not missed.
            let changed = self.inner.link_changes.notified();
            match self.link_status(url) {
                LinkStatus::Live(outbound) => return Some(outbound),
                LinkStatus::Down => return None,
                LinkStatus::Connecting => changed.await,
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.inner.links).generation == generation
    }

    fn is_live(&self, url: &RelayUrl, generation: u64) -> bool {
        let links = lock(&self.inner.links);
        links.generation == generation
            && links
                .live
                .get(url)
                .is_some_and(|link| link.generation == generation)
    }

    /// Drop all links and background work; returns the new generation.
    fn reset(&self) -> u64 {
        let (generation, dropped) = {
            let mut links = lock(&self.inner.links);
            links.generation += 1;
            links.connecting.clear();
            let dropped: Vec<(RelayUrl, LiveLink)> = links.live.drain().collect();
            (links.generation, dropped)
        };
        self.inner.link_changes.notify_waiters();

        for handle in lock(&self.inner.background).drain(..) {
            handle.abort();
        }
        for (url, link) in dropped {
            link.reader.abort();
            debug!(relay = %url, "Closed relay link");
            self.release_relay(&url);
        }
        lock(&self.inner.pending_oks).clear();
        generation
    }

    fn attempt(&self, generation: u64, url: RelayUrl, limit: Duration) -> ConnectAttempt {
        {
            let mut links = lock(&self.inner.links);
            if links.generation == generation {
                *links.connecting.entry(url.clone()).or_default() += 1;
            }
        }
        let transport = self.inner.transport.clone();
        async move {
            debug!(relay = %url, timeout_ms = limit.as_millis() as u64, "Opening relay connection");
            let result = match timeout(limit, transport.open(&url)).await {
                Ok(result) => result,
                Err(_) => Err(PoolError::Timeout(limit)),
            };
            (url, result)
        }
        .boxed()
    }

    async fn first_success(
        &self,
        generation: u64,
        attempts: &mut FuturesUnordered<ConnectAttempt>,
    ) -> bool {
        while let Some((url, result)) = attempts.next().await {
            if self.register_attempt(generation, url, result) {
                return true;
            }
            if !self.is_current(generation) {
                return false;
            }
        }
        false
    }

    fn continue_in_background(&self, generation: u64, mut attempts: FuturesUnordered<ConnectAttempt>) {
        if attempts.is_empty() || !self.is_current(generation) {
            return;
        }
        let pool = self.clone();
        let handle = tokio::spawn(async move {
            while let Some((url, result)) = attempts.next().await {
                pool.register_attempt(generation, url, result);
            }
            debug!(generation, "Background relay connections finished");
        });
        lock(&self.inner.background).push(handle);
    }

    /// Record one attempt's result. True when a link was installed.
    fn register_attempt(
        &self,
        generation: u64,
        url: RelayUrl,
        result: Result<RelayLink, PoolError>,
    ) -> bool {
        let installed = match result {
            Ok(link) => self.install(generation, url.clone(), link),
            Err(err) => {
                warn!(relay = %url, error = %err, "Relay connection failed");
                self.inner.broadcaster.update(|s| {
                    if self.is_current(generation) {
                        s.relay_errors.insert(url.clone(), err.to_string());
                    }
                });
                false
            }
        };
        self.finish_attempt(generation, &url);
        installed
    }

    fn finish_attempt(&self, generation: u64, url: &RelayUrl) {
        {
            let mut links = lock(&self.inner.links);
            if links.generation != generation {
                return;
            }
            if let Some(count) = links.connecting.get_mut(url) {
                *count -= 1;
                if *count == 0 {
                    links.connecting.remove(url);
                }
            }
        }
        self.inner.link_changes.notify_waiters();
    }

    fn install(&self, generation: u64, url: RelayUrl, link: RelayLink) -> bool {
        let RelayLink { outbound, inbound } = link;
        {
            let mut links = lock(&self.inner.links);
            if links.generation != generation {
                debug!(relay = %url, "Discarding connection from superseded attempt");
                return false;
            }
            let reader = tokio::spawn(read_relay(
                Arc::downgrade(&self.inner),
                url.clone(),
                generation,
                inbound,
            ));
            let previous = links.live.insert(
                url.clone(),
                LiveLink {
                    outbound: outbound.clone(),
                    reader,
                    generation,
                },
            );
            if let Some(previous) = previous {
                previous.reader.abort();
            }
        }

        let resubscribed = self.resubscribe(&url, &outbound);
        let installed = self.inner.broadcaster.update(|s| {
            if !self.is_live(&url, generation) {
                return false;
            }
            s.mark_connected(&url);
            s.relay_errors.remove(&url);
            s.status = ConnectionStatus::Connected;
            s.last_error = None;
            true
        });
        if installed {
            info!(relay = %url, subscriptions = resubscribed, "Connected to relay");
        }
        installed
    }

    pub(crate) fn handle_message(&self, url: &RelayUrl, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.dispatch_event(url, &subscription_id, event),
            RelayMessage::Eose { subscription_id } => {
                debug!(relay = %url, subscription_id = %subscription_id, "EOSE");
                self.mark_eose(url, &subscription_id);
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                warn!(
                    relay = %url,
                    subscription_id = %subscription_id,
                    reason = %message,
                    "Relay closed subscription"
                );
                self.mark_eose(url, &subscription_id);
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => self.resolve_ok(url, &event_id, accepted, message),
            RelayMessage::Notice { message } => {
                info!(relay = %url, notice = %message, "Relay notice");
            }
        }
    }

    fn handle_link_closed(&self, url: &RelayUrl, generation: u64) {
        let removed = {
            let mut links = lock(&self.inner.links);
            match links.live.get(url) {
                Some(link) if link.generation == generation => links.live.remove(url),
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }

        warn!(relay = %url, "Relay connection closed");
        self.release_relay(url);
        self.fail_pending(url);
        self.inner.broadcaster.update(|s| {
            s.mark_disconnected(url);
            s.relay_errors
                .insert(url.clone(), "connection closed".to_string());
            if s.connected_relays.is_empty() && s.status == ConnectionStatus::Connected {
                s.status = ConnectionStatus::Error;
                s.last_error = Some(LOST_ALL_RELAYS.to_string());
            }
        });
    }

    fn failure_summary(&self) -> String {
        let state = self.state();
        let details: Vec<String> = self
            .inner
            .relays
            .iter()
            .map(|url| match state.relay_errors.get(url) {
                Some(reason) => format!("{} ({})", url, reason),
                None => format!("{} (no response)", url),
            })
            .collect();
        format!(
            "unable to connect to any of {} relays: {}",
            self.inner.relays.len(),
            details.join("; ")
        )
    }
}

async fn read_relay(
    pool: Weak<PoolInner>,
    url: RelayUrl,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<RelayMessage>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(inner) = pool.upgrade() else {
            return;
        };
        RelayPool { inner }.handle_message(&url, message);
    }
    if let Some(inner) = pool.upgrade() {
        RelayPool { inner }.handle_link_closed(&url, generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRelay, MockTransport};

    const A: &str = "wss://a.example";
    const B: &str = "wss://b.example";
    const C: &str = "wss://c.example";

    fn fast_config(relays: &[&str]) -> PoolConfig {
        PoolConfig {
            primary_timeout: Duration::from_millis(200),
            fallback_timeout: Duration::from_millis(300),
            eose_timeout: Duration::from_millis(300),
            publish_timeout: Duration::from_millis(300),
            ..PoolConfig::new(relays.iter().copied())
        }
    }

    #[tokio::test]
    async fn test_connect_returns_after_primary() {
        let transport = MockTransport::new()
            .with_relay(A, MockRelay::new())
            .with_relay(B, MockRelay::new().with_connect_delay(Duration::from_millis(100)));
        let pool = RelayPool::new(fast_config(&[A, B]), Arc::new(transport)).unwrap();

        pool.connect().await.unwrap();
        let state = pool.state();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.connected_relays.len(), 1);
        assert!(state.is_primary_connected());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(pool.state().connected_relays.len(), 2);
    }

    #[tokio::test]
    async fn test_fallback_sweep_when_primary_fails() {
        let transport = MockTransport::new()
            .with_relay(A, MockRelay::unreachable("refused"))
            .with_relay(B, MockRelay::new());
        let pool = RelayPool::new(fast_config(&[A, B]), Arc::new(transport.clone())).unwrap();

        pool.connect().await.unwrap();
        let state = pool.state();
        assert_eq!(state.connected_relays, vec![RelayUrl::parse(B).unwrap()]);
        assert!(!state.is_primary_connected());
        assert!(state.relay_errors.contains_key(&RelayUrl::parse(A).unwrap()));
        assert_eq!(transport.open_count(B), 1);
    }

    #[tokio::test]
    async fn test_no_relays_configured() {
        let pool = RelayPool::new(fast_config(&[]), Arc::new(MockTransport::new())).unwrap();
        let err = pool.connect().await.unwrap_err();
        assert!(matches!(err, PoolError::NoRelaysConfigured));
        assert_eq!(pool.state().status, ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = MockTransport::new().with_relay(A, MockRelay::new());
        let pool = RelayPool::new(fast_config(&[A]), Arc::new(transport)).unwrap();
        pool.connect().await.unwrap();

        pool.disconnect();
        pool.disconnect();
        let state = pool.state();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(state.connected_relays.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_background_attempts() {
        let transport = MockTransport::new()
            .with_relay(A, MockRelay::new())
            .with_relay(B, MockRelay::new().with_connect_delay(Duration::from_millis(150)));
        let pool = RelayPool::new(fast_config(&[A, B]), Arc::new(transport.clone())).unwrap();

        pool.connect().await.unwrap();
        pool.disconnect();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let state = pool.state();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(state.connected_relays.is_empty());
    }

    #[tokio::test]
    async fn test_losing_every_relay_sets_error() {
        let transport = MockTransport::new().with_relay(A, MockRelay::new());
        let pool = RelayPool::new(fast_config(&[A]), Arc::new(transport.clone())).unwrap();
        pool.connect().await.unwrap();

        transport.drop_connections(A);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let state = pool.state();
        assert_eq!(state.status, ConnectionStatus::Error);
        assert_eq!(state.last_error.as_deref(), Some(LOST_ALL_RELAYS));
        assert!(state.connected_relays.is_empty());
    }
}
