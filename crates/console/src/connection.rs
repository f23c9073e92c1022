//! Connection lifecycle state and the topic → reconciler routing table.
//!
//! The manager never talks to rumqttc directly: it publishes and subscribes
//! through the [`Bus`] trait and is told about lifecycle changes by the
//! driver in [`crate::bus`]. Reconcilers receive it by `Arc` at construction.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::envelope::{decode, Envelope};

// ---------------------------------------------------------------------------
// Bus abstraction
// ---------------------------------------------------------------------------

/// Outbound half of the message bus. All operations use QoS 1.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<()>;
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
    Reconnected,
    Closed,
    Error,
}

impl ConnectionStatus {
    /// Commands and config are only published while live.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Reconnected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnected => "reconnected",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A decoded envelope together with the topic it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub topic: String,
    pub envelope: Envelope,
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ConnectionManager {
    bus: Arc<dyn Bus>,
    status: watch::Sender<ConnectionStatus>,
    /// Written by register/deregister, read by resubscribe and dispatch.
    routes: RwLock<HashMap<String, InboundSender>>,
}

impl ConnectionManager {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            bus,
            status,
            routes: RwLock::new(HashMap::new()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Record a lifecycle transition and notify every watcher, even when the
    /// status is unchanged (a repeated error must invalidate again).
    pub fn set_status(&self, next: ConnectionStatus) {
        let prev = self.status.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "connection status changed");
        }
    }

    /// Apply a transition. Entering a live state resubscribes every
    /// registered topic on its own task, returned so callers can wait on it.
    pub fn on_lifecycle(self: &Arc<Self>, next: ConnectionStatus) -> Option<JoinHandle<usize>> {
        self.set_status(next);
        next.is_live().then(|| {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.resubscribe_all().await })
        })
    }

    /// Issue one subscribe per registered topic. Returns how many succeeded;
    /// failures are left for the next reconnect or refresh.
    pub async fn resubscribe_all(&self) -> usize {
        let topics = self.topics();
        let mut ok = 0;
        for topic in &topics {
            match self.bus.subscribe(topic).await {
                Ok(()) => ok += 1,
                Err(e) => warn!(topic = %topic, "subscribe failed: {e:#}"),
            }
        }
        debug!(subscribed = ok, registered = topics.len(), "resubscribe done");
        ok
    }

    /// Re-issue every subscription on demand, which also refetches retained
    /// values. Does nothing unless the connection is live.
    pub async fn refresh(&self) -> usize {
        let status = self.status();
        if !status.is_live() {
            warn!(%status, "refresh skipped: connection not live");
            return 0;
        }
        self.resubscribe_all().await
    }

    /// Route `topics` to `queue`. Topics registered while live are subscribed
    /// straight away; otherwise they wait for the next connect.
    pub async fn register(&self, topics: &[String], queue: InboundSender) {
        {
            let mut routes = self.routes.write();
            for topic in topics {
                routes.insert(topic.clone(), queue.clone());
            }
        }

        if self.status().is_live() {
            for topic in topics {
                if let Err(e) = self.bus.subscribe(topic).await {
                    warn!(topic = %topic, "subscribe failed: {e:#}");
                }
            }
        }
    }

    pub fn deregister(&self, topics: &[String]) {
        let mut routes = self.routes.write();
        for topic in topics {
            routes.remove(topic);
        }
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Decode and forward one inbound publish. Unregistered topics are
    /// ignored without decoding; undecodable payloads are dropped with a
    /// warning. Returns whether the envelope was queued.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(queue) = self.routes.read().get(topic).cloned() else {
            return false;
        };

        let envelope = match decode(topic, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %topic, "dropping message: {e}");
                return false;
            }
        };

        let inbound = Inbound {
            topic: topic.to_string(),
            envelope,
        };
        if queue.send(inbound).is_err() {
            debug!(topic = %topic, "reconciler gone, message dropped");
            return false;
        }
        true
    }

    /// Publish at QoS 1 on behalf of a reconciler.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.bus
            .publish(topic, payload, retain)
            .await
            .with_context(|| format!("publish to {topic} failed"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
