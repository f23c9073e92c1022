use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::connection::ConnectionStatus;
use crate::reconciler::{DeviceChannel, Delivery};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub connection: ConnectionStatus,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connection,
    Command,
    Config,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub connection: ConnectionStatus,
    pub devices: Vec<DeviceChannel>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            connection: ConnectionStatus::Disconnected,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a connection lifecycle transition.
    pub fn record_connection(&mut self, status: ConnectionStatus) {
        if self.connection == status && status != ConnectionStatus::Error {
            return;
        }
        self.connection = status;
        self.push_event(EventKind::Connection, format!("mqtt {status}"));
    }

    /// Record an operator command and whether it reached the bus.
    pub fn record_command(&mut self, device: &str, state: &str, delivery: Delivery) {
        let detail = match delivery {
            Delivery::Published => format!("{device} set {state}"),
            Delivery::Skipped => format!("{device} set {state} (not sent: offline)"),
        };
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_config(&mut self, device: &str, config_type: &str, delivery: Delivery) {
        let detail = match delivery {
            Delivery::Published => format!("{device} {config_type} updated"),
            Delivery::Skipped => format!("{device} {config_type} not sent: offline"),
        };
        self.push_event(EventKind::Config, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest event first.
    pub fn to_status(&self, devices: Vec<DeviceChannel>) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            connection: self.connection,
            devices,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
