//! Topic addressing: `{device_id}/{instance}/{kind}`.
//!
//! Topics are the only addressing mechanism on the bus. A device group
//! (e.g. `esp32-DEE3`) owns one or more 1-based instances, and every
//! instance owns exactly four topics, one per [`MessageKind`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Control,
    Status,
    Config,
    Health,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::Control,
        MessageKind::Status,
        MessageKind::Config,
        MessageKind::Health,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Control => "control",
            MessageKind::Status => "status",
            MessageKind::Config => "config",
            MessageKind::Health => "health",
        }
    }

    /// Infer the kind from the trailing segment of a topic string.
    pub fn from_topic(topic: &str) -> Option<Self> {
        topic.rsplit('/').next().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => Ok(MessageKind::Control),
            "status" => Ok(MessageKind::Status),
            "config" => Ok(MessageKind::Config),
            "health" => Ok(MessageKind::Health),
            other => Err(format!("unknown message kind '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Device instances
// ---------------------------------------------------------------------------

/// One addressable actuator: a device group plus its 1-based instance index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInstance {
    pub device_id: String,
    pub index: u32,
}

impl DeviceInstance {
    pub fn new(device_id: impl Into<String>, index: u32) -> Self {
        Self {
            device_id: device_id.into(),
            index,
        }
    }

    /// The `{device_id}/{index}` prefix shared by all four topics.
    pub fn key(&self) -> String {
        format!("{}/{}", self.device_id, self.index)
    }
}

impl fmt::Display for DeviceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.index)
    }
}

/// Build the topic for one instance and message kind.
pub fn topic_for(instance: &DeviceInstance, kind: MessageKind) -> String {
    format!("{}/{}/{}", instance.device_id, instance.index, kind)
}

/// Split `{device_id}/{index}/{kind}` back into its parts.
///
/// The device id may not be empty or contain `/`, and the index must be a
/// positive integer.
pub fn parse_topic(topic: &str) -> Option<(DeviceInstance, MessageKind)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 3 || parts[0].is_empty() {
        return None;
    }
    let index: u32 = parts[1].parse().ok()?;
    if index == 0 {
        return None;
    }
    let kind: MessageKind = parts[2].parse().ok()?;
    Some((DeviceInstance::new(parts[0], index), kind))
}

/// Expand a `device_id -> instance count` map into every instance, in
/// device-id order then index order.
pub fn expand_instances(devices: &BTreeMap<String, u32>) -> Vec<DeviceInstance> {
    devices
        .iter()
        .flat_map(|(device_id, count)| (1..=*count).map(move |i| DeviceInstance::new(device_id, i)))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
