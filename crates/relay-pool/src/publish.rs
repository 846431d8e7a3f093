//! Publishing with per-relay acknowledgement.

use std::collections::HashMap;

use futures::future::join_all;
use nostr_events::SignedEvent;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::message::ClientMessage;
use crate::state::lock;
use crate::{PoolError, RelayPool, RelayUrl};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayRejection {
    pub relay: RelayUrl,
    pub reason: String,
}

/// Per-relay result of one publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    pub event_id: String,
    /// Relays that answered `OK true`, in configured order.
    pub accepted: Vec<RelayUrl>,
    pub rejected: Vec<RelayRejection>,
}

impl PublishOutcome {
    /// True when at least one relay accepted the event.
    pub fn is_accepted(&self) -> bool {
        !self.accepted.is_empty()
    }

    pub fn rejection_summary(&self) -> String {
        self.rejected
            .iter()
            .map(|r| format!("{}: {}", r.relay, r.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug)]
pub(crate) struct OkReply {
    accepted: bool,
    message: String,
}

/// Waiters for `OK` frames keyed by relay and event id.
pub(crate) type PendingOks = HashMap<(RelayUrl, String), Vec<oneshot::Sender<OkReply>>>;

impl RelayPool {
    /// Send `event` to every configured relay and collect each relay's
    /// answer.
    ///
    /// A relay whose connection attempt is still in flight is waited for.
    /// Relays that are down, reject the event, close, or do not answer
    /// within `publish_timeout` (connection wait included) end up in
    /// `rejected`. Never fails; an empty `accepted` list is a valid outcome.
    pub async fn publish(&self, event: &SignedEvent) -> PublishOutcome {
        let limit = self.inner.config.publish_timeout;
        let deadline = Instant::now() + limit;

        let attempts = self.inner.relays.iter().map(|url| async move {
            let result = self.publish_to(url, event, deadline).await;
            (url.clone(), result)
        });
        let results = join_all(attempts).await;

        let mut outcome = PublishOutcome {
            event_id: event.id.clone(),
            accepted: Vec::new(),
            rejected: Vec::new(),
        };
        for (relay, result) in results {
            match result {
                Ok(()) => outcome.accepted.push(relay),
                Err(reason) => {
                    debug!(relay = %relay, event_id = %event.id, reason = %reason, "Relay rejected event");
                    outcome.rejected.push(RelayRejection { relay, reason });
                }
            }
        }

        if outcome.is_accepted() {
            info!(
                event_id = %event.id,
                kind = event.kind,
                accepted = outcome.accepted.len(),
                rejected = outcome.rejected.len(),
                "Published event"
            );
        } else {
            warn!(
                event_id = %event.id,
                kind = event.kind,
                "No relay accepted event: {}",
                outcome.rejection_summary()
            );
        }
        outcome
    }

    async fn publish_to(
        &self,
        url: &RelayUrl,
        event: &SignedEvent,
        deadline: Instant,
    ) -> Result<(), String> {
        let limit = self.inner.config.publish_timeout;
        let outbound = match timeout_at(deadline, self.wait_for_link(url)).await {
            Ok(Some(outbound)) => outbound,
            Ok(None) => return Err(PoolError::NotConnected(url.clone()).to_string()),
            Err(_) => {
                debug!(relay = %url, "Relay still connecting at publish deadline");
                return Err(PoolError::Timeout(limit).to_string());
            }
        };

        let key = (url.clone(), event.id.clone());
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.inner.pending_oks)
            .entry(key.clone())
            .or_default()
            .push(reply_tx);

        if outbound.send(ClientMessage::Event(event.clone())).is_err() {
            self.prune_pending(&key);
            return Err("connection closed".to_string());
        }

        match timeout_at(deadline, reply_rx).await {
            Ok(Ok(reply)) if reply.accepted => Ok(()),
            Ok(Ok(reply)) if reply.message.is_empty() => Err("rejected".to_string()),
            Ok(Ok(reply)) => Err(reply.message),
            Ok(Err(_)) => Err("connection closed before acknowledgement".to_string()),
            Err(_) => {
                self.prune_pending(&key);
                Err(PoolError::Timeout(limit).to_string())
            }
        }
    }

    pub(crate) fn resolve_ok(&self, url: &RelayUrl, event_id: &str, accepted: bool, message: String) {
        let waiters = lock(&self.inner.pending_oks).remove(&(url.clone(), event_id.to_string()));
        match waiters {
            Some(waiters) => {
                for waiter in waiters {
                    let _ = waiter.send(OkReply {
                        accepted,
                        message: message.clone(),
                    });
                }
            }
            None => debug!(relay = %url, event_id, "Unsolicited OK"),
        }
    }

    /// Fail every publish waiting on `url`.
    pub(crate) fn fail_pending(&self, url: &RelayUrl) {
        lock(&self.inner.pending_oks).retain(|(relay, _), _| relay != url);
    }

    // Drop waiters whose receiver is gone.
    fn prune_pending(&self, key: &(RelayUrl, String)) {
        let mut pending = lock(&self.inner.pending_oks);
        if let Some(waiters) = pending.get_mut(key) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                pending.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::mock::{MockRelay, MockTransport};
    use crate::PoolConfig;
    use nostr_events::{SigningKey, UnsignedEvent};

    const A: &str = "wss://a.example";
    const B: &str = "wss://b.example";

    fn note() -> SignedEvent {
        let key = SigningKey::generate();
        UnsignedEvent::new(key.public_key_hex(), 1, "hello")
            .sign(&key)
            .unwrap()
    }

    #[tokio::test]
    async fn test_not_connected_relays_are_rejected() {
        let pool = RelayPool::new(PoolConfig::new([A, B]), Arc::new(MockTransport::new())).unwrap();
        let event = note();
        let outcome = pool.publish(&event).await;

        assert_eq!(outcome.event_id, event.id);
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.rejected.len(), 2);
        assert!(outcome.rejected[0].reason.contains("not connected"));
    }

    #[tokio::test]
    async fn test_rejection_reason_is_kept() {
        let transport = MockTransport::new().with_relay(A, MockRelay::new().rejecting("blocked: spam"));
        let pool = RelayPool::new(PoolConfig::new([A]), Arc::new(transport)).unwrap();
        pool.connect().await.unwrap();

        let outcome = pool.publish(&note()).await;
        assert_eq!(
            outcome.rejected,
            vec![RelayRejection {
                relay: RelayUrl::parse(A).unwrap(),
                reason: "blocked: spam".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_silent_relay_times_out() {
        let transport = MockTransport::new().with_relay(A, MockRelay::silent());
        let config = PoolConfig {
            publish_timeout: Duration::from_millis(100),
            ..PoolConfig::new([A])
        };
        let pool = RelayPool::new(config, Arc::new(transport)).unwrap();
        pool.connect().await.unwrap();

        let outcome = pool.publish(&note()).await;
        assert!(!outcome.is_accepted());
        assert!(outcome.rejected[0].reason.contains("timed out"));
        assert!(lock(&pool.inner.pending_oks).is_empty());
    }

    #[tokio::test]
    async fn test_relay_drop_fails_pending_publish() {
        let transport = MockTransport::new().with_relay(A, MockRelay::silent());
        let config = PoolConfig {
            publish_timeout: Duration::from_secs(5),
            ..PoolConfig::new([A])
        };
        let pool = RelayPool::new(config, Arc::new(transport.clone())).unwrap();
        pool.connect().await.unwrap();

        let dropper = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            dropper.drop_connections(A);
        });

        let started = std::time::Instant::now();
        let outcome = pool.publish(&note()).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(outcome.rejected[0].reason.contains("connection closed"));
    }
}
