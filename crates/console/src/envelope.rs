//! Typed message envelopes and their JSON wire codec.
//!
//! On the wire every message is `{"type", "message", "timestamp"}`; the
//! firmware reads those keys, so `encode` always writes them. `decode` also
//! accepts `kind` / `payload` as spellings of the same two fields.
//!
//! Decoding is forgiving at the field level: a malformed optional field is
//! dropped rather than failing the whole message. Only a missing kind or an
//! unusable body is an error. Devices without a synced clock send
//! `"timestamp":"unknown"`, which decodes to an envelope with no timestamp.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::topic::MessageKind;

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// Commanded actuator position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Position {
    Low,
    High,
}

impl From<bool> for Position {
    fn from(on: bool) -> Self {
        if on {
            Position::High
        } else {
            Position::Low
        }
    }
}

/// Reported (or assumed) switch state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwitchState {
    Low,
    High,
    #[default]
    Unknown,
}

impl SwitchState {
    fn from_wire(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => SwitchState::High,
            "LOW" => SwitchState::Low,
            _ => SwitchState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: SwitchState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_change: Option<f64>,
    /// Outer `None`: field absent. `Some(None)`: explicitly cleared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Option<String>>,
}

impl StatusReport {
    pub fn new(state: SwitchState) -> Self {
        Self {
            state,
            weight: None,
            weight_change: None,
            reason: None,
        }
    }
}

/// Weight-control tuning. Every field is independently optional; an unset
/// field never overwrites a previously known value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightControl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_weight_change: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance_duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_read_interval_ms: Option<f64>,
}

/// Device configuration, one variant per `configType`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "configType", rename_all = "camelCase")]
pub enum ConfigPayload {
    /// Heartbeat period in minutes.
    #[serde(rename_all = "camelCase")]
    HeartbeatInterval { heartbeat_interval: f64 },
    WeightControl(WeightControl),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Control(Position),
    Status(StatusReport),
    Config(ConfigPayload),
    Health(HealthReport),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Control(_) => MessageKind::Control,
            Payload::Status(_) => MessageKind::Status,
            Payload::Config(_) => MessageKind::Config,
            Payload::Health(_) => MessageKind::Health,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// What devices put in `timestamp` before their clock is set.
const UNKNOWN_TIMESTAMP: &str = "unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// `None` when the sender's clock was not set.
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Payload,
}

impl Envelope {
    /// Timestamps are kept at millisecond precision, the precision of the wire.
    pub fn new(payload: Payload, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp.trunc_subsecs(3)),
            payload,
        }
    }

    pub fn now(payload: Payload) -> Self {
        Self::new(payload, Utc::now())
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("cannot determine message kind (topic '{0}')")]
    UnknownKind(String),
    #[error("invalid {kind} payload: {reason}")]
    Payload { kind: MessageKind, reason: String },
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    kind: MessageKind,
    message: &'a Payload,
    timestamp: String,
}

/// Serialize an envelope. Field order is fixed, so equal envelopes always
/// produce identical bytes.
pub fn encode(envelope: &Envelope) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&WireEnvelope {
        kind: envelope.kind(),
        message: &envelope.payload,
        timestamp: envelope.timestamp.map_or_else(
            || UNKNOWN_TIMESTAMP.to_string(),
            |t| t.to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
    })
}

/// Parse an envelope received on `topic`.
///
/// The explicit `type`/`kind` field is authoritative. Senders that omit it
/// are handled by inferring the kind from the last topic segment.
pub fn decode(topic: &str, raw: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(raw)?;
    let Value::Object(obj) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let kind = match explicit_kind(&obj) {
        Some(kind) => kind,
        // Compatibility shim for legacy senders without a kind field.
        None => MessageKind::from_topic(topic)
            .ok_or_else(|| DecodeError::UnknownKind(topic.to_string()))?,
    };

    let timestamp = obj
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    let body = obj
        .get("message")
        .or_else(|| obj.get("payload"))
        .unwrap_or(&Value::Null);

    let payload = match kind {
        MessageKind::Control => Payload::Control(decode_control(body)?),
        MessageKind::Status => Payload::Status(decode_status(body)?),
        MessageKind::Config => Payload::Config(decode_config(body)?),
        MessageKind::Health => Payload::Health(decode_health(body)?),
    };

    Ok(Envelope { timestamp, payload })
}

fn explicit_kind(obj: &Map<String, Value>) -> Option<MessageKind> {
    ["type", "kind"]
        .iter()
        .find_map(|key| obj.get(*key)?.as_str()?.parse().ok())
}

fn payload_err(kind: MessageKind, reason: impl Into<String>) -> DecodeError {
    DecodeError::Payload {
        kind,
        reason: reason.into(),
    }
}

fn decode_control(body: &Value) -> Result<Position, DecodeError> {
    let s = body
        .as_str()
        .ok_or_else(|| payload_err(MessageKind::Control, "expected a string"))?;
    // ON/OFF is what the aircon firmware has always sent.
    match s.trim().to_ascii_uppercase().as_str() {
        "HIGH" | "ON" => Ok(Position::High),
        "LOW" | "OFF" => Ok(Position::Low),
        other => Err(payload_err(
            MessageKind::Control,
            format!("unknown position '{other}'"),
        )),
    }
}

fn decode_status(body: &Value) -> Result<StatusReport, DecodeError> {
    // Older valve firmware publishes the bare state string.
    if let Some(s) = body.as_str() {
        return Ok(StatusReport::new(SwitchState::from_wire(s)));
    }
    let obj = body
        .as_object()
        .ok_or_else(|| payload_err(MessageKind::Status, "expected an object"))?;

    let state = obj
        .get("state")
        .and_then(Value::as_str)
        .map(SwitchState::from_wire)
        .unwrap_or_default();

    let reason = match obj.get("reason") {
        None => None,
        Some(Value::Null) => Some(None),
        Some(Value::String(s)) if s.is_empty() => Some(None),
        Some(Value::String(s)) => Some(Some(s.clone())),
        Some(_) => None,
    };

    Ok(StatusReport {
        state,
        weight: obj.get("weight").and_then(Value::as_f64),
        weight_change: obj.get("weightChange").and_then(Value::as_f64),
        reason,
    })
}

fn decode_config(body: &Value) -> Result<ConfigPayload, DecodeError> {
    let obj = body
        .as_object()
        .ok_or_else(|| payload_err(MessageKind::Config, "expected an object"))?;
    let number = |key: &str| obj.get(key).and_then(Value::as_f64);

    match obj.get("configType").and_then(Value::as_str) {
        Some("heartbeatInterval") => {
            let heartbeat_interval = number("heartbeatInterval").ok_or_else(|| {
                payload_err(MessageKind::Config, "heartbeatInterval is not a number")
            })?;
            Ok(ConfigPayload::HeartbeatInterval { heartbeat_interval })
        }
        Some("weightControl") => Ok(ConfigPayload::WeightControl(WeightControl {
            target_weight_change: number("targetWeightChange"),
            tolerance_weight: number("toleranceWeight"),
            tolerance_duration_ms: number("toleranceDurationMs"),
            weight_read_interval_ms: number("weightReadIntervalMs"),
        })),
        Some(other) => Err(payload_err(
            MessageKind::Config,
            format!("unknown configType '{other}'"),
        )),
        None => Err(payload_err(MessageKind::Config, "missing configType")),
    }
}

fn decode_health(body: &Value) -> Result<HealthReport, DecodeError> {
    let obj = body
        .as_object()
        .ok_or_else(|| payload_err(MessageKind::Health, "expected an object"))?;
    Ok(HealthReport {
        ip_address: obj
            .get("ipAddress")
            .and_then(Value::as_str)
            .map(str::to_string),
        active: obj.get("active").and_then(Value::as_bool),
        weight: obj.get("weight").and_then(Value::as_f64),
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t1() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap()
    }

    fn decode_str(topic: &str, json: &str) -> Result<Envelope, DecodeError> {
        decode(topic, json.as_bytes())
    }

    // -- encode/decode ---------------------------------------------------------

    #[test]
    fn every_kind_survives_encode_decode() {
        let samples = vec![
            Payload::Control(Position::High),
            Payload::Status(StatusReport {
                state: SwitchState::High,
                weight: Some(812.3),
                weight_change: Some(-4.1),
                reason: Some(Some("target reached".into())),
            }),
            Payload::Config(ConfigPayload::HeartbeatInterval {
                heartbeat_interval: 2.5,
            }),
            Payload::Config(ConfigPayload::WeightControl(WeightControl {
                target_weight_change: Some(40.0),
                tolerance_weight: None,
                tolerance_duration_ms: Some(15000.0),
                weight_read_interval_ms: None,
            })),
            Payload::Health(HealthReport {
                ip_address: Some("192.168.1.40".into()),
                active: Some(true),
                weight: Some(790.0),
            }),
        ];

        for payload in samples {
            let env = Envelope::new(payload, t1());
            let bytes = encode(&env).unwrap();
            let topic = format!("esp32-DEE3/1/{}", env.kind());
            assert_eq!(decode(&topic, &bytes).unwrap(), env);
        }
    }

    #[test]
    fn encode_uses_firmware_field_names() {
        let env = Envelope::new(Payload::Control(Position::Low), t1());
        let json: Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(json["type"], "control");
        assert_eq!(json["message"], "LOW");
        assert_eq!(json["timestamp"], "2025-06-01T08:30:00.000Z");
    }

    #[test]
    fn encode_is_deterministic() {
        let env = Envelope::new(
            Payload::Config(ConfigPayload::WeightControl(WeightControl {
                target_weight_change: Some(1.0),
                tolerance_weight: Some(2.0),
                tolerance_duration_ms: Some(3.0),
                weight_read_interval_ms: Some(4.0),
            })),
            t1(),
        );
        assert_eq!(encode(&env).unwrap(), encode(&env.clone()).unwrap());
        let text = String::from_utf8(encode(&env).unwrap()).unwrap();
        assert!(text.contains(r#""configType":"weightControl""#), "{text}");
    }

    #[test]
    fn envelope_new_truncates_to_millis() {
        let precise = t1() + chrono::Duration::nanoseconds(1_234_567);
        let env = Envelope::new(Payload::Control(Position::High), precise);
        assert_eq!(env.timestamp, Some(t1() + chrono::Duration::milliseconds(1)));
    }

    // -- kind resolution -------------------------------------------------------

    #[test]
    fn missing_kind_falls_back_to_topic() {
        let env = decode_str(
            "irrigation/1/status",
            r#"{"message":{"state":"HIGH"},"timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap();
        assert_eq!(env.kind(), MessageKind::Status);
    }

    #[test]
    fn explicit_kind_wins_over_topic() {
        let env = decode_str(
            "irrigation/1/status",
            r#"{"type":"health","message":{"active":true},"timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap();
        assert_eq!(env.kind(), MessageKind::Health);
    }

    #[test]
    fn kind_and_payload_spellings_accepted() {
        let env = decode_str(
            "x",
            r#"{"kind":"control","payload":"HIGH","timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap();
        assert_eq!(env.payload, Payload::Control(Position::High));
    }

    #[test]
    fn unresolvable_kind_is_an_error() {
        let err = decode_str(
            "irrigation/1/set",
            r#"{"message":"HIGH","timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::UnknownKind(_)));
    }

    #[test]
    fn unrecognised_explicit_kind_falls_back_to_topic() {
        let env = decode_str(
            "irrigation/1/control",
            r#"{"type":"bogus","message":"LOW","timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap();
        assert_eq!(env.payload, Payload::Control(Position::Low));
    }

    // -- envelope-level errors --------------------------------------------------

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            decode_str("irrigation/1/status", "{not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn non_object_is_an_error() {
        assert!(matches!(
            decode_str("irrigation/1/status", "[1,2]"),
            Err(DecodeError::NotAnObject)
        ));
    }

    // -- timestamps ------------------------------------------------------------

    #[test]
    fn unsynced_clock_timestamp_still_decodes() {
        let env = decode_str(
            "esp32-DEE3/1/status",
            r#"{"type":"status","message":{"state":"HIGH"},"timestamp":"unknown"}"#,
        )
        .unwrap();
        assert_eq!(env.timestamp, None);
        assert_eq!(
            env.payload,
            Payload::Status(StatusReport::new(SwitchState::High))
        );
    }

    #[test]
    fn missing_or_garbled_timestamp_decodes_without_one() {
        let missing = decode_str("aircon/1/control", r#"{"message":"ON"}"#).unwrap();
        assert_eq!(missing.timestamp, None);
        assert_eq!(missing.payload, Payload::Control(Position::High));

        let garbled =
            decode_str("aircon/1/control", r#"{"message":"OFF","timestamp":12345}"#).unwrap();
        assert_eq!(garbled.timestamp, None);
    }

    #[test]
    fn envelope_without_timestamp_encodes_unknown() {
        let env = Envelope {
            timestamp: None,
            payload: Payload::Control(Position::Low),
        };
        let json: Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(json["timestamp"], "unknown");
        assert_eq!(decode("esp32-DEE3/1/control", &encode(&env).unwrap()).unwrap(), env);
    }

    #[test]
    fn offset_timestamps_are_normalised_to_utc() {
        let env = decode_str(
            "irrigation/1/control",
            r#"{"type":"control","message":"HIGH","timestamp":"2025-06-01T16:30:00+08:00"}"#,
        )
        .unwrap();
        assert_eq!(env.timestamp, Some(t1()));
    }

    // -- control ---------------------------------------------------------------

    #[test]
    fn control_accepts_legacy_on_off() {
        let on = decode_str(
            "aircon/1/control",
            r#"{"message":"ON","timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap();
        assert_eq!(on.payload, Payload::Control(Position::High));

        let off = decode_str(
            "aircon/1/control",
            r#"{"message":"off","timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap();
        assert_eq!(off.payload, Payload::Control(Position::Low));
    }

    #[test]
    fn control_rejects_unknown_position() {
        let err = decode_str(
            "aircon/1/control",
            r#"{"message":"TOGGLE","timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::Payload { .. }));
    }

    // -- status ----------------------------------------------------------------

    #[test]
    fn status_unknown_state_maps_to_unknown() {
        let env = decode_str(
            "v/1/status",
            r#"{"type":"status","message":{"state":"OPENING"},"timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap();
        let Payload::Status(s) = env.payload else {
            panic!("expected status");
        };
        assert_eq!(s.state, SwitchState::Unknown);
    }

    #[test]
    fn status_non_numeric_weight_is_none() {
        let env = decode_str(
            "v/1/status",
            r#"{"type":"status","message":{"state":"LOW","weight":"n/a","weightChange":null},"timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap();
        let Payload::Status(s) = env.payload else {
            panic!("expected status");
        };
        assert_eq!(s.state, SwitchState::Low);
        assert_eq!(s.weight, None);
        assert_eq!(s.weight_change, None);
    }

    #[test]
    fn status_reason_is_tri_state() {
        let absent = decode_status(&serde_json::json!({"state": "LOW"})).unwrap();
        assert_eq!(absent.reason, None);

        let cleared = decode_status(&serde_json::json!({"state": "LOW", "reason": null})).unwrap();
        assert_eq!(cleared.reason, Some(None));

        let empty = decode_status(&serde_json::json!({"state": "LOW", "reason": ""})).unwrap();
        assert_eq!(empty.reason, Some(None));

        let set = decode_status(&serde_json::json!({"state": "LOW", "reason": "timeout"})).unwrap();
        assert_eq!(set.reason, Some(Some("timeout".to_string())));
    }

    #[test]
    fn status_bare_string_is_accepted() {
        let env = decode_str(
            "irrigation/1/status",
            r#"{"message":"HIGH","timestamp":"2025-06-01T08:30:00.000Z"}"#,
        )
        .unwrap();
        assert_eq!(
            env.payload,
            Payload::Status(StatusReport::new(SwitchState::High))
        );
    }

    // -- config ----------------------------------------------------------------

    #[test]
    fn config_weight_control_ignores_malformed_fields() {
        let env = decode_str(
            "v/1/config",
            r#"{"type":"config","message":{"configType":"weightControl","targetWeightChange":25,"toleranceWeight":"heavy"},"timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap();
        assert_eq!(
            env.payload,
            Payload::Config(ConfigPayload::WeightControl(WeightControl {
                target_weight_change: Some(25.0),
                ..WeightControl::default()
            }))
        );
    }

    #[test]
    fn config_unknown_type_is_an_error() {
        let err = decode_str(
            "v/1/config",
            r#"{"type":"config","message":{"configType":"duration","duration":3000},"timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::Payload { .. }));
    }

    #[test]
    fn config_heartbeat_requires_number() {
        let err = decode_str(
            "v/1/config",
            r#"{"type":"config","message":{"configType":"heartbeatInterval","heartbeatInterval":"5"},"timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::Payload { .. }));
    }

    // -- health ----------------------------------------------------------------

    #[test]
    fn health_partial_fields() {
        let env = decode_str(
            "v/1/health",
            r#"{"type":"health","message":{"ipAddress":"10.0.0.7","active":"yes"},"timestamp":"2025-06-01T08:30:00Z"}"#,
        )
        .unwrap();
        assert_eq!(
            env.payload,
            Payload::Health(HealthReport {
                ip_address: Some("10.0.0.7".into()),
                active: None,
                weight: None,
            })
        );
    }
}
