//! In-memory relay service.
//!
//! Keeps events in a local store and answers subscriptions from it. Used for
//! offline runs and tests that do not care about relay behavior.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nostr_events::{matches_any, Filter, SignedEvent};
use tracing::{debug, info};

use crate::publish::{PublishOutcome, RelayRejection};
use crate::state::{
    lock, run_isolated, ConnectionState, ConnectionStatus, StateBroadcaster, StateListener,
    StateListenerHandle,
};
use crate::subscription::SubscriptionCallbacks;
use crate::{PoolConfig, PoolError, RelayUrl};

/// Stored events matching any of `filters`. Each filter contributes its
/// newest matches up to its `limit`; an event is returned once.
pub fn select_events(store: &[SignedEvent], filters: &[Filter]) -> Vec<SignedEvent> {
    let mut seen = HashSet::new();
    let mut selected = Vec::new();

    for filter in filters {
        let mut matching: Vec<&SignedEvent> = store.iter().filter(|e| filter.matches(e)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        for event in matching {
            if seen.insert(event.id.clone()) {
                selected.push(event.clone());
            }
        }
    }
    selected
}

struct LocalSubscription {
    filters: Vec<Filter>,
    callbacks: SubscriptionCallbacks,
    active: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct InMemoryRelayService {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    relays: Vec<RelayUrl>,
    broadcaster: Arc<StateBroadcaster>,
    store: Mutex<Vec<SignedEvent>>,
    subscriptions: Mutex<HashMap<String, LocalSubscription>>,
}

impl InMemoryRelayService {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let relays = config.relay_urls()?;
        Ok(Self {
            inner: Arc::new(MemoryInner {
                broadcaster: StateBroadcaster::new(ConnectionState::new(relays.clone())),
                relays,
                store: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Add events to the store without notifying subscribers.
    pub fn seed(&self, events: impl IntoIterator<Item = SignedEvent>) {
        let mut store = lock(&self.inner.store);
        for event in events {
            if !store.iter().any(|e| e.id == event.id) {
                store.push(event);
            }
        }
    }

    pub fn stored(&self) -> Vec<SignedEvent> {
        lock(&self.inner.store).clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.broadcaster.snapshot()
    }

    pub fn add_state_listener(&self, listener: StateListener) -> StateListenerHandle {
        self.inner.broadcaster.add_listener(listener)
    }

    pub fn connect(&self) {
        let relays = self.inner.relays.clone();
        self.inner.broadcaster.update(|s| {
            s.status = ConnectionStatus::Connected;
            s.connected_relays = relays;
            s.relay_errors.clear();
            s.last_error = None;
        });
        info!(backend = "memory", "Relay service ready");
    }

    pub fn disconnect(&self) {
        let cancelled: Vec<LocalSubscription> = lock(&self.inner.subscriptions)
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for sub in &cancelled {
            sub.active.store(false, Ordering::Release);
        }
        self.inner.broadcaster.update(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.connected_relays.clear();
            s.last_error = None;
        });
    }

    pub fn subscribe(
        &self,
        id: &str,
        filters: Vec<Filter>,
        callbacks: SubscriptionCallbacks,
    ) -> Result<(), PoolError> {
        if filters.is_empty() {
            return Err(PoolError::InvalidRequest(
                "subscription requires at least one filter".to_string(),
            ));
        }
        self.unsubscribe(id);

        let active = Arc::new(AtomicBool::new(true));
        let backlog = select_events(&lock(&self.inner.store), &filters);
        lock(&self.inner.subscriptions).insert(
            id.to_string(),
            LocalSubscription {
                filters,
                callbacks: callbacks.clone(),
                active: active.clone(),
            },
        );

        for event in backlog {
            if !active.load(Ordering::Acquire) {
                return Ok(());
            }
            let on_event = callbacks.on_event.clone();
            run_isolated("event callback", move || on_event(event));
        }
        if let Some(on_eose) = &callbacks.on_eose {
            if active.load(Ordering::Acquire) {
                run_isolated("eose callback", || on_eose());
            }
        }
        debug!(subscription_id = %id, backend = "memory", "Opened subscription");
        Ok(())
    }

    pub fn unsubscribe(&self, id: &str) {
        if let Some(sub) = lock(&self.inner.subscriptions).remove(id) {
            sub.active.store(false, Ordering::Release);
        }
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.subscriptions).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get_events(&self, filters: Vec<Filter>) -> Result<Vec<SignedEvent>, PoolError> {
        if filters.is_empty() {
            return Err(PoolError::InvalidRequest(
                "query requires at least one filter".to_string(),
            ));
        }
        Ok(select_events(&lock(&self.inner.store), &filters))
    }

    /// Store `event` and deliver it to matching subscriptions. Every
    /// configured relay reports the same result.
    pub fn publish(&self, event: &SignedEvent) -> PublishOutcome {
        if let Err(e) = event.verify() {
            return PublishOutcome {
                event_id: event.id.clone(),
                accepted: Vec::new(),
                rejected: self
                    .inner
                    .relays
                    .iter()
                    .map(|relay| RelayRejection {
                        relay: relay.clone(),
                        reason: format!("invalid: {}", e),
                    })
                    .collect(),
            };
        }

        let is_new = {
            let mut store = lock(&self.inner.store);
            let is_new = !store.iter().any(|e| e.id == event.id);
            if is_new {
                store.push(event.clone());
            }
            is_new
        };

        if is_new {
            let targets: Vec<_> = lock(&self.inner.subscriptions)
                .values()
                .filter(|sub| matches_any(&sub.filters, event))
                .map(|sub| (sub.callbacks.on_event.clone(), sub.active.clone()))
                .collect();
            for (on_event, active) in targets {
                if active.load(Ordering::Acquire) {
                    let event = event.clone();
                    run_isolated("event callback", move || on_event(event));
                }
            }
        }

        PublishOutcome {
            event_id: event.id.clone(),
            accepted: self.inner.relays.clone(),
            rejected: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_events::{SigningKey, UnsignedEvent};

    fn note(key: &SigningKey, created_at: u64) -> SignedEvent {
        UnsignedEvent::new(key.public_key_hex(), 1, format!("note {}", created_at))
            .with_created_at(created_at)
            .sign(key)
            .unwrap()
    }

    #[test]
    fn test_select_events_newest_first_with_limit() {
        let key = SigningKey::generate();
        let store = vec![note(&key, 10), note(&key, 30), note(&key, 20)];
        let selected = select_events(&store, &[Filter::new().kind(1).limit(2)]);
        let times: Vec<u64> = selected.iter().map(|e| e.created_at).collect();
        assert_eq!(times, vec![30, 20]);
    }

    #[test]
    fn test_select_events_unions_filters_once() {
        let key = SigningKey::generate();
        let store = vec![note(&key, 10)];
        let selected = select_events(&store, &[Filter::new().kind(1), Filter::new().since(5)]);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_publish_delivers_live_and_stores() {
        let service = InMemoryRelayService::new(PoolConfig::new(["wss://a.example"])).unwrap();
        service.connect();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        service
            .subscribe(
                "feed",
                vec![Filter::new().kind(1)],
                SubscriptionCallbacks::new(move |e| sink.lock().unwrap().push(e)),
            )
            .unwrap();

        let key = SigningKey::generate();
        let event = note(&key, 42);
        let outcome = service.publish(&event);
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(*received.lock().unwrap(), vec![event.clone()]);
        assert_eq!(service.get_events(vec![Filter::new()]).unwrap(), vec![event]);
    }

    #[test]
    fn test_publish_rejects_forged_event() {
        let service = InMemoryRelayService::new(PoolConfig::new(["wss://a.example"])).unwrap();
        let key = SigningKey::generate();
        let mut event = note(&key, 1);
        event.content.push('!');

        let outcome = service.publish(&event);
        assert!(!outcome.is_accepted());
        assert!(service.stored().is_empty());
    }

    #[test]
    fn test_subscribe_replays_backlog_then_eose() {
        let service = InMemoryRelayService::new(PoolConfig::new(["wss://a.example"])).unwrap();
        let key = SigningKey::generate();
        service.seed([note(&key, 1), note(&key, 2)]);

        let log = Arc::new(Mutex::new(Vec::new()));
        let events = log.clone();
        let eose = log.clone();
        service
            .subscribe(
                "feed",
                vec![Filter::new()],
                SubscriptionCallbacks::new(move |e| events.lock().unwrap().push(e.created_at.to_string()))
                    .on_eose(move || eose.lock().unwrap().push("eose".to_string())),
            )
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["2", "1", "eose"]);
    }
}
