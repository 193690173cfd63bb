//! Network reachability as reported by the host platform.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::info;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

impl ConnectivityEvent {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityEvent::Online)
    }
}

/// Shared handle: clones observe and drive the same state.
///
/// The platform pushes changes through [`ConnectivityMonitor::set_online`]; only actual
/// transitions are broadcast.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    online: AtomicBool,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                online: AtomicBool::new(initially_online),
                events,
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Returns `true` when the call changed the state.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.inner.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return false;
        }
        let event = if online {
            ConnectivityEvent::Online
        } else {
            ConnectivityEvent::Offline
        };
        info!(online, "connectivity changed");
        let _ = self.inner.events.send(event);
        true
    }

    pub fn subscribe(&self) -> ConnectivityEvents {
        ConnectivityEvents {
            rx: self.inner.events.subscribe(),
            monitor: self.clone(),
        }
    }
}

/// Receiver for transitions. A receiver that falls behind gets the current state instead of
/// the events it missed.
pub struct ConnectivityEvents {
    rx: broadcast::Receiver<ConnectivityEvent>,
    monitor: ConnectivityMonitor,
}

impl ConnectivityEvents {
    pub async fn recv(&mut self) -> ConnectivityEvent {
        match self.rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => self.current(),
            // The sender lives inside `monitor`, so the channel cannot close while we hold it.
            Err(broadcast::error::RecvError::Closed) => self.current(),
        }
    }

    fn current(&self) -> ConnectivityEvent {
        if self.monitor.is_online() {
            ConnectivityEvent::Online
        } else {
            ConnectivityEvent::Offline
        }
    }
}
