//! Connectivity monitoring
//!
//! [`NetworkMonitor`] turns the platform's connectivity signal into
//! online/offline transition events. Clones share one state, so every
//! subscriber in the process observes the same transitions.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Network connectivity state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkState {
    /// Connected to network
    Online,

    /// Disconnected from network
    Offline,
}

impl NetworkState {
    /// Map a platform boolean to a state
    pub fn from_online(online: bool) -> Self {
        if online {
            NetworkState::Online
        } else {
            NetworkState::Offline
        }
    }

    /// Whether this is [`NetworkState::Online`]
    pub fn is_online(self) -> bool {
        self == NetworkState::Online
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkState::Online => write!(f, "online"),
            NetworkState::Offline => write!(f, "offline"),
        }
    }
}

/// Shared connectivity state with transition notifications
#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<Mutex<NetworkState>>,
    events: broadcast::Sender<NetworkState>,
}

impl NetworkMonitor {
    /// Default event buffer per subscriber
    pub const DEFAULT_BUFFER: usize = 64;

    /// Create a monitor seeded with the platform's current connectivity
    pub fn new(initial: NetworkState) -> Self {
        Self::with_buffer(initial, Self::DEFAULT_BUFFER)
    }

    /// Create a monitor with a custom event buffer size
    pub fn with_buffer(initial: NetworkState, buffer: usize) -> Self {
        let (events, _rx) = broadcast::channel(buffer.max(1));
        Self { state: Arc::new(Mutex::new(initial)), events }
    }

    /// Current connectivity state
    pub fn state(&self) -> NetworkState {
        *self.state.lock()
    }

    /// Whether the platform currently reports connectivity
    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Subscribe to transition events
    ///
    /// Only transitions are delivered; repeated reports of the same state are
    /// swallowed.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkState> {
        self.events.subscribe()
    }

    /// Feed a platform connectivity reading
    ///
    /// Returns `true` when the reading changed the state and an event was
    /// emitted.
    pub fn report(&self, online: bool) -> bool {
        let next = NetworkState::from_online(online);

        // Held across send so concurrent reporters emit in state order
        let mut current = self.state.lock();
        if *current == next {
            return false;
        }
        *current = next;
        tracing::info!(state = %next, "network state changed");
        let _ = self.events.send(next);
        true
    }

    /// Follow a platform connectivity signal until its sender is dropped
    pub fn follow(&self, mut signal: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let initial = *signal.borrow_and_update();
            monitor.report(initial);

            while signal.changed().await.is_ok() {
                let online = *signal.borrow_and_update();
                monitor.report(online);
            }
            tracing::debug!("connectivity signal closed");
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkState::Offline)
    }
}
