//! Multi-relay Nostr connection pool.
//!
//! # Architecture
//!
//! ```text
//! RelayPool ──(RelayTransport::open)──► RelayLink per relay
//!    │                                     │ outbound: ClientMessage
//!    │                                     ▼
//!    │                              WebSocketTransport / MockTransport
//!    │                                     │ inbound: RelayMessage
//!    ▼                                     ▼
//! StateBroadcaster ◄── reader task ──► subscriptions / pending OKs
//! ```
//!
//! - `connect()` returns as soon as one relay is up; the rest join in the
//!   background.
//! - `subscribe()` multiplexes one logical subscription over every connected
//!   relay and aggregates EOSE.
//! - `publish()` reports which relays accepted an event.
//! - [`RelayService`] abstracts over the network pool and the
//!   [`InMemoryRelayService`].
//!
//! # Example
//!
//! ```no_run
//! use nostr_events::Filter;
//! use relay_pool::{PoolConfig, RelayPool, SubscriptionCallbacks};
//!
//! # async fn example() -> Result<(), relay_pool::PoolError> {
//! let pool = RelayPool::with_websockets(PoolConfig::default())?;
//! pool.connect().await?;
//!
//! pool.subscribe(
//!     "notes",
//!     vec![Filter::new().kind(1).limit(20)],
//!     SubscriptionCallbacks::new(|event| println!("{}", event.content)),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod endpoint;
pub mod error;
pub mod memory;
pub mod message;
pub mod mock;
pub mod pool;
pub mod publish;
pub mod service;
pub mod state;
pub mod subscription;
pub mod transport;

pub use config::{parse_relays, PoolConfig, RelayBackend, DEFAULT_RELAYS};
pub use endpoint::RelayUrl;
pub use error::PoolError;
pub use memory::InMemoryRelayService;
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use mock::{MockRelay, MockTransport};
pub use pool::RelayPool;
pub use publish::{PublishOutcome, RelayRejection};
pub use service::{build_service, RelayService};
pub use state::{
    ConnectionState, ConnectionStatus, StateBroadcaster, StateListener, StateListenerHandle,
};
pub use subscription::{generate_subscription_id, SubscriptionCallbacks};
pub use transport::{RelayLink, RelayTransport, WebSocketTransport};

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
