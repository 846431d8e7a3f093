//! Subscription multiplexing across relays.
//!
//! Callers name subscriptions with their own ids; each registration gets a
//! fresh random wire id so frames from a replaced or closed subscription can
//! never reach the new one. EOSE is aggregated: `on_eose` fires once, when
//! every relay the REQ went to has sent EOSE, closed the subscription or
//! dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nostr_events::{matches_any, Filter, SignedEvent};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::message::ClientMessage;
use crate::state::{lock, run_isolated};
use crate::{PoolError, RelayPool, RelayUrl};

pub type EventCallback = Arc<dyn Fn(SignedEvent) + Send + Sync>;
pub type EoseCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks attached to a subscription.
#[derive(Clone)]
pub struct SubscriptionCallbacks {
    pub(crate) on_event: EventCallback,
    pub(crate) on_eose: Option<EoseCallback>,
}

impl SubscriptionCallbacks {
    pub fn new(on_event: impl Fn(SignedEvent) + Send + Sync + 'static) -> Self {
        Self {
            on_event: Arc::new(on_event),
            on_eose: None,
        }
    }

    pub fn on_eose(mut self, on_eose: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_eose = Some(Arc::new(on_eose));
        self
    }
}

pub(crate) struct ActiveSubscription {
    id: String,
    wire_id: String,
    filters: Vec<Filter>,
    callbacks: SubscriptionCallbacks,
    active: Arc<AtomicBool>,
    pending_eose: HashSet<RelayUrl>,
    eose_sent: bool,
}

impl ActiveSubscription {
    /// Drop `url` from the EOSE wait set. Returns the callback to fire when
    /// this completes the aggregate EOSE.
    fn settle(&mut self, url: &RelayUrl) -> Option<(Option<EoseCallback>, Arc<AtomicBool>)> {
        self.pending_eose.remove(url);
        if self.pending_eose.is_empty() && !self.eose_sent {
            self.eose_sent = true;
            return Some((self.callbacks.on_eose.clone(), self.active.clone()));
        }
        None
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    by_wire: HashMap<String, ActiveSubscription>,
    wire_ids: HashMap<String, String>,
}

impl SubscriptionRegistry {
    fn insert(&mut self, subscription: ActiveSubscription) {
        self.wire_ids
            .insert(subscription.id.clone(), subscription.wire_id.clone());
        self.by_wire
            .insert(subscription.wire_id.clone(), subscription);
    }

    fn remove(&mut self, id: &str) -> Option<ActiveSubscription> {
        let wire_id = self.wire_ids.remove(id)?;
        self.by_wire.remove(&wire_id)
    }

    fn drain(&mut self) -> Vec<ActiveSubscription> {
        self.wire_ids.clear();
        self.by_wire.drain().map(|(_, sub)| sub).collect()
    }
}

/// Random wire-level subscription id.
pub fn generate_subscription_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

impl RelayPool {
    /// Open (or replace) subscription `id` on every connected relay.
    ///
    /// `on_event` runs once per matching event per relay, so the same event
    /// may arrive from several relays. `on_eose` runs once all queried
    /// relays have finished sending stored events, or right away when no
    /// relay is connected.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        filters: Vec<Filter>,
        callbacks: SubscriptionCallbacks,
    ) -> Result<(), PoolError> {
        let id = id.into();
        if id.is_empty() {
            return Err(PoolError::InvalidRequest(
                "subscription id must not be empty".to_string(),
            ));
        }
        if filters.is_empty() {
            return Err(PoolError::InvalidRequest(
                "subscription requires at least one filter".to_string(),
            ));
        }

        self.unsubscribe(&id);

        let wire_id = generate_subscription_id();
        let (links, fire_now) = {
            let mut registry = lock(&self.inner.subscriptions);
            let links = self.connected_links();
            let pending_eose: HashSet<RelayUrl> = links.iter().map(|(url, _)| url.clone()).collect();
            let fire_now = pending_eose.is_empty();
            registry.insert(ActiveSubscription {
                id: id.clone(),
                wire_id: wire_id.clone(),
                filters: filters.clone(),
                callbacks: callbacks.clone(),
                active: Arc::new(AtomicBool::new(true)),
                pending_eose,
                eose_sent: fire_now,
            });
            (links, fire_now)
        };

        let relays = links.len();
        for (url, outbound) in links {
            let req = ClientMessage::Req {
                subscription_id: wire_id.clone(),
                filters: filters.clone(),
            };
            if outbound.send(req).is_err() {
                warn!(relay = %url, subscription_id = %id, "Relay link closed before REQ");
                self.settle_relay(&url, &wire_id);
            }
        }

        info!(
            subscription_id = %id,
            wire_id = %wire_id,
            relays,
            filters = filters.len(),
            "Opened subscription"
        );

        if fire_now {
            if let Some(on_eose) = &callbacks.on_eose {
                run_isolated("eose callback", || on_eose());
            }
        }
        Ok(())
    }

    /// Close subscription `id`. Unknown ids are ignored. Events still in
    /// flight for it are dropped.
    pub fn unsubscribe(&self, id: &str) {
        let Some(subscription) = lock(&self.inner.subscriptions).remove(id) else {
            return;
        };
        subscription.active.store(false, Ordering::Release);
        self.send_close(&subscription.wire_id);
        debug!(subscription_id = %id, wire_id = %subscription.wire_id, "Closed subscription");
    }

    /// Caller ids of open subscriptions.
    pub fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.subscriptions)
            .wire_ids
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Fetch stored events matching `filters`.
    ///
    /// Resolves on aggregate EOSE or after `eose_timeout`, whichever comes
    /// first, with duplicates (same id from several relays) removed.
    pub async fn get_events(&self, filters: Vec<Filter>) -> Result<Vec<SignedEvent>, PoolError> {
        let id = format!("fetch-{}", generate_subscription_id());
        let collected = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(Notify::new());

        let sink = collected.clone();
        let signal = finished.clone();
        let callbacks = SubscriptionCallbacks::new(move |event| lock(&sink).push(event))
            .on_eose(move || signal.notify_one());
        self.subscribe(id.clone(), filters, callbacks)?;

        let limit = self.inner.config.eose_timeout;
        if timeout(limit, finished.notified()).await.is_err() {
            warn!(
                subscription_id = %id,
                timeout_ms = limit.as_millis() as u64,
                "EOSE timeout, returning partial results"
            );
        }
        self.unsubscribe(&id);

        let events = std::mem::take(&mut *lock(&collected));
        Ok(dedup_events(events))
    }

    pub(crate) fn dispatch_event(&self, url: &RelayUrl, wire_id: &str, event: SignedEvent) {
        if self.inner.config.verify_events {
            if let Err(e) = event.verify() {
                debug!(relay = %url, event_id = %event.id, "Dropping invalid event: {}", e);
                return;
            }
        }

        let target = {
            let registry = lock(&self.inner.subscriptions);
            match registry.by_wire.get(wire_id) {
                Some(sub) if matches_any(&sub.filters, &event) => {
                    Some((sub.callbacks.on_event.clone(), sub.active.clone()))
                }
                Some(_) => {
                    debug!(relay = %url, event_id = %event.id, "Dropping event outside filters");
                    None
                }
                None => {
                    debug!(relay = %url, wire_id, "Dropping event for closed subscription");
                    None
                }
            }
        };

        if let Some((on_event, active)) = target {
            if active.load(Ordering::Acquire) {
                run_isolated("event callback", || on_event(event));
            }
        }
    }

    pub(crate) fn mark_eose(&self, url: &RelayUrl, wire_id: &str) {
        self.settle_relay(url, wire_id);
    }

    /// `url` will not answer any open subscription anymore.
    pub(crate) fn release_relay(&self, url: &RelayUrl) {
        let ready: Vec<_> = lock(&self.inner.subscriptions)
            .by_wire
            .values_mut()
            .filter_map(|sub| sub.settle(url))
            .collect();
        for (on_eose, active) in ready {
            fire_eose(on_eose, &active);
        }
    }

    /// Detach every subscription and send CLOSE for each. Returns how many
    /// were open.
    pub(crate) fn cancel_subscriptions(&self) -> usize {
        let cancelled = lock(&self.inner.subscriptions).drain();
        for subscription in &cancelled {
            subscription.active.store(false, Ordering::Release);
            self.send_close(&subscription.wire_id);
        }
        cancelled.len()
    }

    /// Send open subscriptions to a newly connected relay. Returns how many
    /// REQs went out.
    pub(crate) fn resubscribe(
        &self,
        url: &RelayUrl,
        outbound: &tokio::sync::mpsc::UnboundedSender<ClientMessage>,
    ) -> usize {
        let requests: Vec<ClientMessage> = {
            let mut registry = lock(&self.inner.subscriptions);
            registry
                .by_wire
                .values_mut()
                .map(|sub| {
                    if !sub.eose_sent {
                        sub.pending_eose.insert(url.clone());
                    }
                    ClientMessage::Req {
                        subscription_id: sub.wire_id.clone(),
                        filters: sub.filters.clone(),
                    }
                })
                .collect()
        };

        let count = requests.len();
        for req in requests {
            if outbound.send(req).is_err() {
                break;
            }
        }
        count
    }

    fn settle_relay(&self, url: &RelayUrl, wire_id: &str) {
        let ready = lock(&self.inner.subscriptions)
            .by_wire
            .get_mut(wire_id)
            .and_then(|sub| sub.settle(url));
        if let Some((on_eose, active)) = ready {
            fire_eose(on_eose, &active);
        }
    }

    fn send_close(&self, wire_id: &str) {
        for (_, outbound) in self.connected_links() {
            let _ = outbound.send(ClientMessage::Close {
                subscription_id: wire_id.to_string(),
            });
        }
    }
}

fn fire_eose(on_eose: Option<EoseCallback>, active: &AtomicBool) {
    if let Some(on_eose) = on_eose {
        if active.load(Ordering::Acquire) {
            run_isolated("eose callback", || on_eose());
        }
    }
}

/// Remove repeated ids, keeping the first occurrence.
pub fn dedup_events(events: Vec<SignedEvent>) -> Vec<SignedEvent> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|event| seen.insert(event.id.clone()))
        .collect()
}
