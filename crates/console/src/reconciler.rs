//! Per-instance device state and the task that keeps it in sync with the bus.
//!
//! [`DeviceChannel`] is the plain reconciled view with the update rules for
//! each message kind. [`Reconciler`] owns one channel behind a `watch`
//! sender, registers the instance's four topics with the
//! [`ConnectionManager`], and applies inbound envelopes on its own task so a
//! slow device never holds up dispatch for the others.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Limits;
use crate::connection::{ConnectionManager, ConnectionStatus, Inbound};
use crate::envelope::{
    encode, ConfigPayload, Envelope, HealthReport, Payload, Position, StatusReport, SwitchState,
    WeightControl,
};
use crate::topic::{topic_for, DeviceInstance, MessageKind};

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub weight: Option<f64>,
    pub weight_change: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub ip_address: Option<String>,
    pub active: Option<bool>,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightSettings {
    pub target_weight_change: f64,
    pub tolerance_weight: f64,
    pub tolerance_duration_ms: f64,
    pub weight_read_interval_ms: f64,
}

impl WeightSettings {
    fn merge(&mut self, update: &WeightControl) {
        if let Some(v) = update.target_weight_change {
            self.target_weight_change = v;
        }
        if let Some(v) = update.tolerance_weight {
            self.tolerance_weight = v;
        }
        if let Some(v) = update.tolerance_duration_ms {
            self.tolerance_duration_ms = v;
        }
        if let Some(v) = update.weight_read_interval_ms {
            self.weight_read_interval_ms = v;
        }
    }

    fn to_payload(self) -> WeightControl {
        WeightControl {
            target_weight_change: Some(self.target_weight_change),
            tolerance_weight: Some(self.tolerance_weight),
            tolerance_duration_ms: Some(self.tolerance_duration_ms),
            weight_read_interval_ms: Some(self.weight_read_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Minutes.
    pub heartbeat_interval: f64,
    pub weight_control: WeightSettings,
}

impl DeviceConfig {
    pub fn defaults(limits: &Limits) -> Self {
        Self {
            heartbeat_interval: limits.heartbeat_interval.default,
            weight_control: WeightSettings {
                target_weight_change: limits.target_weight_change.default,
                tolerance_weight: limits.tolerance_weight.default,
                tolerance_duration_ms: limits.tolerance_duration_ms.default,
                weight_read_interval_ms: limits.weight_read_interval_ms.default,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CommandRecord {
    pub position: Position,
    pub at: DateTime<Utc>,
}

/// Reconciled view of one device instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceChannel {
    #[serde(flatten)]
    pub instance: DeviceInstance,
    pub weight_control_enabled: bool,
    pub switch_state: SwitchState,
    pub last_status_at: Option<DateTime<Utc>>,
    pub last_health_at: Option<DateTime<Utc>>,
    pub telemetry: Telemetry,
    pub health: Health,
    pub config: DeviceConfig,
    pub last_command: Option<CommandRecord>,
    /// Device-side timestamps of the last applied status and health
    /// reports; ordering only compares these.
    #[serde(skip)]
    status_clock: Option<DateTime<Utc>>,
    #[serde(skip)]
    health_clock: Option<DateTime<Utc>>,
}

/// True only when both timestamps are known and `incoming` is older.
fn is_stale(incoming: Option<DateTime<Utc>>, last: Option<DateTime<Utc>>) -> bool {
    matches!((incoming, last), (Some(incoming), Some(last)) if incoming < last)
}

impl DeviceChannel {
    pub fn new(instance: DeviceInstance, limits: &Limits) -> Self {
        Self {
            instance,
            weight_control_enabled: false,
            switch_state: SwitchState::Unknown,
            last_status_at: None,
            last_health_at: None,
            telemetry: Telemetry::default(),
            health: Health::default(),
            config: DeviceConfig::defaults(limits),
            last_command: None,
            status_clock: None,
            health_clock: None,
        }
    }

    /// Apply one inbound envelope. Returns whether anything changed.
    ///
    /// Envelopes whose kind does not belong on `topic` are ignored, as are
    /// status and health reports older than the last one applied. Reports
    /// without a device timestamp are always applied and stamped with their
    /// arrival time.
    pub fn on_envelope(&mut self, topic: &str, envelope: &Envelope) -> bool {
        if topic != topic_for(&self.instance, envelope.kind()) {
            debug!(topic, kind = %envelope.kind(), "envelope kind does not match topic");
            return false;
        }
        let before = self.clone();
        let at = envelope.timestamp;

        match &envelope.payload {
            Payload::Control(position) => self.apply_control(*position, at),
            Payload::Status(report) => self.apply_status(report, at),
            Payload::Config(config) => self.apply_config(config),
            Payload::Health(report) => self.apply_health(report, at),
        }

        *self != before
    }

    /// Forget the confirmed switch state until the next status report.
    pub fn invalidate(&mut self) {
        self.switch_state = SwitchState::Unknown;
    }

    fn apply_control(&mut self, position: Position, at: Option<DateTime<Utc>>) {
        if is_stale(at, self.last_command.map(|c| c.at)) {
            return;
        }
        self.last_command = Some(CommandRecord {
            position,
            at: at.unwrap_or_else(Utc::now),
        });
    }

    fn apply_status(&mut self, report: &StatusReport, at: Option<DateTime<Utc>>) {
        if is_stale(at, self.status_clock) {
            debug!(device = %self.instance, ?at, "stale status ignored");
            return;
        }
        self.switch_state = report.state;
        self.telemetry.weight = report.weight;
        self.telemetry.weight_change = report.weight_change;
        if let Some(reason) = &report.reason {
            self.telemetry.reason = reason.clone();
        }
        if at.is_some() {
            self.status_clock = at;
        }
        self.last_status_at = Some(at.unwrap_or_else(Utc::now));
    }

    fn apply_health(&mut self, report: &HealthReport, at: Option<DateTime<Utc>>) {
        if is_stale(at, self.health_clock) {
            debug!(device = %self.instance, ?at, "stale health ignored");
            return;
        }
        if let Some(ip) = &report.ip_address {
            self.health.ip_address = Some(ip.clone());
        }
        if let Some(active) = report.active {
            self.health.active = Some(active);
        }
        self.health.weight = report.weight;
        if at.is_some() {
            self.health_clock = at;
        }
        self.last_health_at = Some(at.unwrap_or_else(Utc::now));
    }

    /// Config is applied in arrival order; unset fields keep their value.
    fn apply_config(&mut self, config: &ConfigPayload) {
        match config {
            ConfigPayload::HeartbeatInterval { heartbeat_interval } => {
                self.config.heartbeat_interval = *heartbeat_interval;
            }
            ConfigPayload::WeightControl(update) => self.config.weight_control.merge(update),
        }
    }

    /// Clamp `update` and merge it over the current config, producing the
    /// complete object for that config type.
    pub fn prepare_config(&self, update: &ConfigPayload, limits: &Limits) -> ConfigPayload {
        match update {
            ConfigPayload::HeartbeatInterval { heartbeat_interval } => {
                ConfigPayload::HeartbeatInterval {
                    heartbeat_interval: limits.heartbeat_interval.clamp(*heartbeat_interval),
                }
            }
            ConfigPayload::WeightControl(update) => {
                let clamped = WeightControl {
                    target_weight_change: update
                        .target_weight_change
                        .map(|v| limits.target_weight_change.clamp(v)),
                    tolerance_weight: update
                        .tolerance_weight
                        .map(|v| limits.tolerance_weight.clamp(v)),
                    tolerance_duration_ms: update
                        .tolerance_duration_ms
                        .map(|v| limits.tolerance_duration_ms.clamp(v)),
                    weight_read_interval_ms: update
                        .weight_read_interval_ms
                        .map(|v| limits.weight_read_interval_ms.clamp(v)),
                };
                let mut merged = self.config.weight_control;
                merged.merge(&clamped);
                ConfigPayload::WeightControl(merged.to_payload())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciler handle
// ---------------------------------------------------------------------------

/// Outcome of an outbound command or config change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Published,
    /// Connection not live; nothing was sent.
    Skipped,
}

pub struct Reconciler {
    instance: DeviceInstance,
    topics: Vec<String>,
    limits: Limits,
    manager: Arc<ConnectionManager>,
    state: Arc<watch::Sender<DeviceChannel>>,
    task: JoinHandle<()>,
}

impl Reconciler {
    /// Create the channel, register its topics and start applying inbound
    /// envelopes.
    pub async fn spawn(
        instance: DeviceInstance,
        manager: Arc<ConnectionManager>,
        limits: Limits,
        weight_control_enabled: bool,
    ) -> Self {
        let mut channel = DeviceChannel::new(instance.clone(), &limits);
        channel.weight_control_enabled = weight_control_enabled;
        let (state, _) = watch::channel(channel);
        let state = Arc::new(state);

        let topics: Vec<String> = MessageKind::ALL
            .iter()
            .map(|kind| topic_for(&instance, *kind))
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let status = manager.watch_status();
        let task = tokio::spawn(run(rx, status, Arc::clone(&state)));
        manager.register(&topics, tx).await;

        Self {
            instance,
            topics,
            limits,
            manager,
            state,
            task,
        }
    }

    pub fn instance(&self) -> &DeviceInstance {
        &self.instance
    }

    /// Snapshot of the current view.
    pub fn view(&self) -> DeviceChannel {
        self.state.borrow().clone()
    }

    /// Follow view changes.
    pub fn subscribe(&self) -> watch::Receiver<DeviceChannel> {
        self.state.subscribe()
    }

    /// Invalidate the switch state, then publish a retained `control`
    /// envelope if the connection is live.
    pub async fn send_command(&self, desired: Position) -> Result<Delivery> {
        let sent_at = Utc::now();
        let envelope = Envelope::new(Payload::Control(desired), sent_at);
        self.state.send_modify(DeviceChannel::invalidate);

        let status = self.manager.status();
        if !status.is_live() {
            info!(device = %self.instance, %status, "command not sent: connection not live");
            return Ok(Delivery::Skipped);
        }

        let bytes = encode(&envelope).context("encode control envelope")?;
        self.manager
            .publish(&topic_for(&self.instance, MessageKind::Control), bytes, true)
            .await?;
        self.state.send_modify(|ch| {
            ch.last_command = Some(CommandRecord {
                position: desired,
                at: envelope.timestamp.unwrap_or(sent_at),
            });
        });
        info!(device = %self.instance, ?desired, "command published");
        Ok(Delivery::Published)
    }

    /// Clamp, merge and publish the full config for `update`'s type,
    /// retained. The local config only changes once the publish succeeds.
    pub async fn send_config(&self, update: ConfigPayload) -> Result<Delivery> {
        let status = self.manager.status();
        if !status.is_live() {
            info!(device = %self.instance, %status, "config not sent: connection not live");
            return Ok(Delivery::Skipped);
        }

        let full = self.state.borrow().prepare_config(&update, &self.limits);
        let envelope = Envelope::now(Payload::Config(full.clone()));
        let bytes = encode(&envelope).context("encode config envelope")?;
        self.manager
            .publish(&topic_for(&self.instance, MessageKind::Config), bytes, true)
            .await?;
        self.state.send_modify(|ch| ch.apply_config(&full));
        info!(device = %self.instance, "config published");
        Ok(Delivery::Published)
    }

    /// Stop routing this instance's topics and end its task.
    pub fn close(&self) {
        self.manager.deregister(&self.topics);
        self.task.abort();
    }
}

async fn run(
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    mut status: watch::Receiver<ConnectionStatus>,
    state: Arc<watch::Sender<DeviceChannel>>,
) {
    status.borrow_and_update();
    loop {
        tokio::select! {
            msg = inbound.recv() => {
                let Some(Inbound { topic, envelope }) = msg else {
                    break;
                };
                state.send_if_modified(|ch| ch.on_envelope(&topic, &envelope));
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                if *status.borrow_and_update() == ConnectionStatus::Error {
                    state.send_modify(DeviceChannel::invalidate);
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
