//! Connection state and its broadcaster.
//!
//! Listeners are called synchronously, in registration order, with a
//! snapshot taken after the transition was fully applied. Transitions are
//! queued in the order they were applied and delivered one at a time: every
//! listener sees transition N before any sees N+1. A listener may trigger
//! further transitions (for example `disconnect()` on `Error`); those are
//! delivered after the current one finishes.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tracing::error;

use crate::RelayUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Snapshot of pool connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Configured relays, in priority order.
    pub relays: Vec<RelayUrl>,
    /// Relays with a live link, in configured order.
    pub connected_relays: Vec<RelayUrl>,
    /// Most recent failure per relay.
    pub relay_errors: BTreeMap<RelayUrl, String>,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn new(relays: Vec<RelayUrl>) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            relays,
            connected_relays: Vec::new(),
            relay_errors: BTreeMap::new(),
            last_error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn is_relay_connected(&self, url: &RelayUrl) -> bool {
        self.connected_relays.contains(url)
    }

    /// True when the highest-priority relay has a live link.
    pub fn is_primary_connected(&self) -> bool {
        self.relays
            .first()
            .is_some_and(|primary| self.connected_relays.contains(primary))
    }

    /// One-line description, e.g. `2 of 3 relays connected (primary: yes)`.
    pub fn summary(&self) -> String {
        match self.status {
            ConnectionStatus::Disconnected => "disconnected".to_string(),
            ConnectionStatus::Connecting => {
                format!("connecting to {} relays", self.relays.len())
            }
            ConnectionStatus::Connected => format!(
                "{} of {} relays connected (primary: {})",
                self.connected_relays.len(),
                self.relays.len(),
                if self.is_primary_connected() { "yes" } else { "no" }
            ),
            ConnectionStatus::Error => format!(
                "error: {}",
                self.last_error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    pub(crate) fn mark_connected(&mut self, url: &RelayUrl) {
        if self.connected_relays.contains(url) {
            return;
        }
        self.connected_relays.push(url.clone());
        let order = &self.relays;
        self.connected_relays
            .sort_by_key(|r| order.iter().position(|c| c == r).unwrap_or(usize::MAX));
    }

    pub(crate) fn mark_disconnected(&mut self, url: &RelayUrl) -> bool {
        let before = self.connected_relays.len();
        self.connected_relays.retain(|r| r != url);
        before != self.connected_relays.len()
    }
}

pub type StateListener = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

enum Notice {
    /// A transition, for every registered listener.
    Changed(ConnectionState),
    /// Registration replay for one new listener.
    Registered(u64, StateListener, ConnectionState),
}

#[derive(Default)]
struct Dispatch {
    queue: VecDeque<Notice>,
    // Set while some caller is draining `queue`.
    active: bool,
}

/// Holds the current [`ConnectionState`] and fans transitions out to
/// listeners.
pub struct StateBroadcaster {
    state: Mutex<ConnectionState>,
    listeners: Mutex<Vec<(u64, StateListener)>>,
    next_listener: AtomicU64,
    // Lock order: `dispatch` before `state`.
    dispatch: Mutex<Dispatch>,
}

impl StateBroadcaster {
    pub fn new(initial: ConnectionState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(initial),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            dispatch: Mutex::new(Dispatch::default()),
        })
    }

    pub fn snapshot(&self) -> ConnectionState {
        lock(&self.state).clone()
    }

    /// Apply `change` and notify listeners if the state actually changed.
    ///
    /// When called from inside a listener, or while another thread is
    /// delivering, the notification is queued and delivered by that caller.
    pub fn update<R>(&self, change: impl FnOnce(&mut ConnectionState) -> R) -> R {
        let result = {
            let mut dispatch = lock(&self.dispatch);
            let mut state = lock(&self.state);
            let before = state.clone();
            let result = change(&mut state);
            if *state != before {
                dispatch.queue.push_back(Notice::Changed(state.clone()));
            }
            result
        };
        self.deliver();
        result
    }

    /// Register a listener. It is called once with the current snapshot
    /// before any later transition.
    pub fn add_listener(self: &Arc<Self>, listener: StateListener) -> StateListenerHandle {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        {
            let mut dispatch = lock(&self.dispatch);
            let snapshot = lock(&self.state).clone();
            dispatch
                .queue
                .push_back(Notice::Registered(id, listener, snapshot));
        }
        self.deliver();

        StateListenerHandle {
            id,
            broadcaster: Arc::downgrade(self),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn remove_listener(&self, id: u64) {
        lock(&self.dispatch)
            .queue
            .retain(|notice| !matches!(notice, Notice::Registered(queued, ..) if *queued == id));
        lock(&self.listeners).retain(|(listener_id, _)| *listener_id != id);
    }

    // Drain the queue unless another caller already is.
    fn deliver(&self) {
        {
            let mut dispatch = lock(&self.dispatch);
            if dispatch.active || dispatch.queue.is_empty() {
                return;
            }
            dispatch.active = true;
        }

        loop {
            let notice = {
                let mut dispatch = lock(&self.dispatch);
                match dispatch.queue.pop_front() {
                    Some(notice) => notice,
                    None => {
                        dispatch.active = false;
                        return;
                    }
                }
            };

            match notice {
                Notice::Changed(snapshot) => {
                    let listeners: Vec<StateListener> = lock(&self.listeners)
                        .iter()
                        .map(|(_, listener)| listener.clone())
                        .collect();
                    for listener in listeners {
                        call_listener(&listener, &snapshot);
                    }
                }
                Notice::Registered(id, listener, snapshot) => {
                    lock(&self.listeners).push((id, listener.clone()));
                    call_listener(&listener, &snapshot);
                }
            }
        }
    }
}

/// Returned by `add_state_listener`. Dropping it keeps the listener
/// registered; call [`unsubscribe`](Self::unsubscribe) to detach.
#[derive(Debug)]
pub struct StateListenerHandle {
    id: u64,
    broadcaster: Weak<StateBroadcaster>,
}

impl StateListenerHandle {
    pub fn unsubscribe(self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.remove_listener(self.id);
        }
    }
}

fn call_listener(listener: &StateListener, state: &ConnectionState) {
    run_isolated("state listener", || listener(state));
}

/// Run a user callback, logging instead of unwinding if it panics.
pub(crate) fn run_isolated(what: &str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!(callback = what, "Callback panicked; continuing");
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
