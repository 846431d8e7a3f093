//! Scripted in-process relays for tests and offline runs.
//!
//! Each [`MockRelay`] describes how one endpoint behaves: how it connects,
//! how it answers EVENT frames and whether it ever sends EOSE. The
//! [`MockTransport`] serves any number of them and records every frame it
//! receives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nostr_events::{matches_any, Filter, SignedEvent};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::memory::select_events;
use crate::message::{ClientMessage, RelayMessage};
use crate::state::lock;
use crate::transport::{RelayLink, RelayTransport};
use crate::{PoolError, RelayUrl};

#[derive(Debug, Clone)]
enum ConnectBehavior {
    Immediate,
    Delay(Duration),
    Fail(String),
    Hang,
}

#[derive(Debug, Clone)]
enum PublishBehavior {
    Accept,
    Reject(String),
    Ignore,
}

/// Behavior script for one mock relay. The default accepts connections and
/// events, stores what it accepts and answers every REQ with EOSE.
#[derive(Debug, Clone)]
pub struct MockRelay {
    connect: ConnectBehavior,
    publish: PublishBehavior,
    send_eose: bool,
    events: Vec<SignedEvent>,
}

impl Default for MockRelay {
    fn default() -> Self {
        Self {
            connect: ConnectBehavior::Immediate,
            publish: PublishBehavior::Accept,
            send_eose: true,
            events: Vec::new(),
        }
    }
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load stored events served to REQs.
    pub fn with_events(mut self, events: Vec<SignedEvent>) -> Self {
        self.events = events;
        self
    }

    /// Answer every EVENT with `OK false`.
    pub fn rejecting(mut self, reason: impl Into<String>) -> Self {
        self.publish = PublishBehavior::Reject(reason.into());
        self
    }

    /// Never answer EVENT frames.
    pub fn ignoring_publish(mut self) -> Self {
        self.publish = PublishBehavior::Ignore;
        self
    }

    /// Serve stored events but never send EOSE.
    pub fn without_eose(mut self) -> Self {
        self.send_eose = false;
        self
    }

    /// Connects, then never answers anything.
    pub fn silent() -> Self {
        Self::new().ignoring_publish().without_eose()
    }

    /// Connection attempts fail right away.
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            connect: ConnectBehavior::Fail(reason.into()),
            ..Self::default()
        }
    }

    /// Connection attempts never complete.
    pub fn hanging() -> Self {
        Self {
            connect: ConnectBehavior::Hang,
            ..Self::default()
        }
    }

    /// Connection completes after `delay`.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect = ConnectBehavior::Delay(delay);
        self
    }
}

struct MockLink {
    incoming: mpsc::UnboundedSender<RelayMessage>,
    subscriptions: Arc<Mutex<HashMap<String, Vec<Filter>>>>,
    shutdown: Arc<Notify>,
}

struct RelayRecord {
    script: MockRelay,
    store: Vec<SignedEvent>,
    received: Vec<ClientMessage>,
    opens: usize,
    links: Vec<MockLink>,
}

type Relays = Arc<Mutex<HashMap<String, RelayRecord>>>;

/// [`RelayTransport`] serving scripted relays.
#[derive(Clone, Default)]
pub struct MockTransport {
    relays: Relays,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relay(self, url: &str, relay: MockRelay) -> Self {
        self.set_relay(url, relay);
        self
    }

    /// Install or replace the script for `url`. Live links keep running with
    /// the old script; new connections use the new one.
    pub fn set_relay(&self, url: &str, relay: MockRelay) {
        let mut relays = lock(&self.relays);
        let store = relay.events.clone();
        match relays.get_mut(&key(url)) {
            Some(record) => {
                record.script = relay;
                record.store = store;
            }
            None => {
                relays.insert(
                    key(url),
                    RelayRecord {
                        script: relay,
                        store,
                        received: Vec::new(),
                        opens: 0,
                        links: Vec::new(),
                    },
                );
            }
        }
    }

    /// Number of connection attempts made against `url`.
    pub fn open_count(&self, url: &str) -> usize {
        lock(&self.relays).get(&key(url)).map_or(0, |r| r.opens)
    }

    /// Every frame `url` received, in order.
    pub fn received(&self, url: &str) -> Vec<ClientMessage> {
        lock(&self.relays)
            .get(&key(url))
            .map(|r| r.received.clone())
            .unwrap_or_default()
    }

    /// Subscription ids of the REQ frames `url` received.
    pub fn requests(&self, url: &str) -> Vec<String> {
        self.received(url)
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Req {
                    subscription_id, ..
                } => Some(subscription_id),
                _ => None,
            })
            .collect()
    }

    /// Subscription ids `url` currently considers open.
    pub fn open_subscriptions(&self, url: &str) -> Vec<String> {
        lock(&self.relays)
            .get(&key(url))
            .map(|r| {
                r.links
                    .iter()
                    .flat_map(|link| lock(&link.subscriptions).keys().cloned().collect::<Vec<_>>())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Events `url` has stored.
    pub fn stored(&self, url: &str) -> Vec<SignedEvent> {
        lock(&self.relays)
            .get(&key(url))
            .map(|r| r.store.clone())
            .unwrap_or_default()
    }

    /// Push `event` to every open subscription on `url` whose filters match.
    pub fn emit(&self, url: &str, event: &SignedEvent) {
        if let Some(record) = lock(&self.relays).get(&key(url)) {
            broadcast(&record.links, event);
        }
    }

    /// Send an arbitrary frame on every live link of `url`.
    pub fn send_raw(&self, url: &str, message: RelayMessage) {
        if let Some(record) = lock(&self.relays).get(&key(url)) {
            for link in &record.links {
                let _ = link.incoming.send(message.clone());
            }
        }
    }

    /// Close every live link of `url` from the relay side.
    pub fn drop_connections(&self, url: &str) {
        let links = lock(&self.relays)
            .get_mut(&key(url))
            .map(|r| std::mem::take(&mut r.links))
            .unwrap_or_default();
        for link in links {
            link.shutdown.notify_one();
        }
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    async fn open(&self, url: &RelayUrl) -> Result<RelayLink, PoolError> {
        let script = {
            let mut relays = lock(&self.relays);
            let record = relays
                .get_mut(url.as_str())
                .ok_or_else(|| PoolError::Connection(format!("unknown mock relay {}", url)))?;
            record.opens += 1;
            record.script.clone()
        };

        match &script.connect {
            ConnectBehavior::Immediate => {}
            ConnectBehavior::Delay(delay) => tokio::time::sleep(*delay).await,
            ConnectBehavior::Fail(reason) => return Err(PoolError::Connection(reason.clone())),
            ConnectBehavior::Hang => futures::future::pending::<()>().await,
        }

        let (outbound, outgoing) = mpsc::unbounded_channel();
        let (incoming, inbound) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(Notify::new());

        if let Some(record) = lock(&self.relays).get_mut(url.as_str()) {
            record.links.push(MockLink {
                incoming: incoming.clone(),
                subscriptions: subscriptions.clone(),
                shutdown: shutdown.clone(),
            });
        }

        tokio::spawn(serve(
            self.relays.clone(),
            url.as_str().to_string(),
            script,
            outgoing,
            incoming,
            subscriptions,
            shutdown,
        ));

        Ok(RelayLink { outbound, inbound })
    }
}

async fn serve(
    relays: Relays,
    url: String,
    script: MockRelay,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    incoming: mpsc::UnboundedSender<RelayMessage>,
    subscriptions: Arc<Mutex<HashMap<String, Vec<Filter>>>>,
    shutdown: Arc<Notify>,
) {
    loop {
        let message = tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = shutdown.notified() => break,
        };
        handle_frame(&relays, &url, &script, &incoming, &subscriptions, message);
    }
    if let Some(record) = lock(&relays).get_mut(&url) {
        record
            .links
            .retain(|link| !Arc::ptr_eq(&link.shutdown, &shutdown));
    }
    debug!(relay = %url, "Mock relay link finished");
}

fn handle_frame(
    relays: &Relays,
    url: &str,
    script: &MockRelay,
    incoming: &mpsc::UnboundedSender<RelayMessage>,
    subscriptions: &Mutex<HashMap<String, Vec<Filter>>>,
    message: ClientMessage,
) {
    let mut relays = lock(relays);
    let Some(record) = relays.get_mut(url) else {
        return;
    };
    record.received.push(message.clone());

    match message {
        ClientMessage::Req {
            subscription_id,
            filters,
        } => {
            for event in select_events(&record.store, &filters) {
                let _ = incoming.send(RelayMessage::Event {
                    subscription_id: subscription_id.clone(),
                    event,
                });
            }
            if script.send_eose {
                let _ = incoming.send(RelayMessage::Eose {
                    subscription_id: subscription_id.clone(),
                });
            }
            lock(subscriptions).insert(subscription_id, filters);
        }
        ClientMessage::Close { subscription_id } => {
            lock(subscriptions).remove(&subscription_id);
        }
        ClientMessage::Event(event) => match &script.publish {
            PublishBehavior::Accept => {
                let _ = incoming.send(RelayMessage::Ok {
                    event_id: event.id.clone(),
                    accepted: true,
                    message: String::new(),
                });
                if !record.store.iter().any(|stored| stored.id == event.id) {
                    record.store.push(event.clone());
                    broadcast(&record.links, &event);
                }
            }
            PublishBehavior::Reject(reason) => {
                let _ = incoming.send(RelayMessage::Ok {
                    event_id: event.id,
                    accepted: false,
                    message: reason.clone(),
                });
            }
            PublishBehavior::Ignore => {}
        },
    }
}

fn broadcast(links: &[MockLink], event: &SignedEvent) {
    for link in links {
        for (subscription_id, filters) in lock(&link.subscriptions).iter() {
            if matches_any(filters, event) {
                let _ = link.incoming.send(RelayMessage::Event {
                    subscription_id: subscription_id.clone(),
                    event: event.clone(),
                });
            }
        }
    }
}

fn key(url: &str) -> String {
    RelayUrl::parse(url)
        .map(String::from)
        .unwrap_or_else(|_| url.to_string())
}
