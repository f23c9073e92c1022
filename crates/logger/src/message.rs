//! Topic → event-type mapping and the records the logger persists.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Topic map
// ---------------------------------------------------------------------------

/// Ordered `filter → event_type` entries. Exact matches win over wildcard
/// filters; among wildcards the first configured entry wins.
#[derive(Debug, Clone, Default)]
pub struct TopicMap {
    entries: Vec<(String, String)>,
}

impl TopicMap {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        let mut deduped: Vec<(String, String)> = Vec::with_capacity(entries.len());
        for (filter, event_type) in entries {
            match deduped.iter_mut().find(|(f, _)| *f == filter) {
                Some(existing) => existing.1 = event_type,
                None => deduped.push((filter, event_type)),
            }
        }
        Self { entries: deduped }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Filters to subscribe to.
    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(f, _)| f.as_str())
    }

    pub fn event_type_for(&self, topic: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(f, _)| f == topic)
            .or_else(|| self.entries.iter().find(|(f, _)| topic_matches(f, topic)))
            .map(|(_, e)| e.as_str())
    }
}

/// MQTT filter matching: `+` matches one level, a trailing `#` matches the
/// parent level and everything below it.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// `#` only as the whole last level, `+` only as a whole level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == levels.len() - 1,
        "+" => true,
        other => !other.contains(['#', '+']),
    })
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Idempotency key; `None` means every delivery is a new row.
    pub id: Option<String>,
    pub event_type: String,
    pub topic: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl EventRecord {
    /// Decode an inbound publish. Anything that is not valid JSON is
    /// rejected; any JSON value is accepted as a payload.
    pub fn decode(
        topic: &str,
        raw: &[u8],
        event_type: &str,
        received_at: DateTime<Utc>,
    ) -> serde_json::Result<Self> {
        let payload: Value = serde_json::from_slice(raw)?;
        Ok(Self {
            id: record_id(&payload),
            event_type: event_type.to_string(),
            topic: topic.to_string(),
            payload,
            received_at,
        })
    }

    pub fn received_at_text(&self) -> String {
        self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Top-level `recordId`, falling back to `id`. Numbers are accepted and
/// stored in their decimal form; empty strings are ignored.
pub fn record_id(payload: &Value) -> Option<String> {
    ["recordId", "id"].iter().find_map(|key| match payload.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map() -> TopicMap {
        TopicMap::new(vec![
            ("esp32-DEE3/+/status".into(), "irrigation".into()),
            ("esp32-aircon-015C/#".into(), "aircon".into()),
            ("esp32-DEE3/1/status".into(), "valve-one".into()),
        ])
    }

    // -- topic_matches ---------------------------------------------------------

    #[test]
    fn exact_filter_matches_only_itself() {
        assert!(topic_matches("a/1/status", "a/1/status"));
        assert!(!topic_matches("a/1/status", "a/1/health"));
        assert!(!topic_matches("a/1/status", "a/1/status/x"));
        assert!(!topic_matches("a/1/status", "a/1"));
    }

    #[test]
    fn plus_matches_one_level() {
        assert!(topic_matches("a/+/status", "a/7/status"));
        assert!(!topic_matches("a/+/status", "a/7/8/status"));
        assert!(!topic_matches("a/+", "a"));
    }

    #[test]
    fn hash_matches_parent_and_below() {
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("a/#", "a/1/status"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("a/#", "b/1"));
    }

    #[test]
    fn filter_validation() {
        assert!(is_valid_filter("a/+/status"));
        assert!(is_valid_filter("a/#"));
        assert!(is_valid_filter("#"));
        assert!(!is_valid_filter(""));
        assert!(!is_valid_filter("a/#/status"));
        assert!(!is_valid_filter("a/b+/status"));
        assert!(!is_valid_filter("a/st#"));
    }

    // -- TopicMap --------------------------------------------------------------

    #[test]
    fn exact_entry_wins_over_wildcard() {
        let m = map();
        assert_eq!(m.event_type_for("esp32-DEE3/1/status"), Some("valve-one"));
        assert_eq!(m.event_type_for("esp32-DEE3/2/status"), Some("irrigation"));
        assert_eq!(m.event_type_for("esp32-aircon-015C/1/control"), Some("aircon"));
        assert_eq!(m.event_type_for("other/1/status"), None);
    }

    #[test]
    fn duplicate_filters_keep_last_event_type() {
        let m = TopicMap::new(vec![
            ("a/1/status".into(), "first".into()),
            ("a/1/status".into(), "second".into()),
        ]);
        assert_eq!(m.entries().len(), 1);
        assert_eq!(m.event_type_for("a/1/status"), Some("second"));
    }

    // -- record_id -------------------------------------------------------------

    #[test]
    fn record_id_prefers_record_id_field() {
        assert_eq!(
            record_id(&json!({"recordId": "r-1", "id": "abc"})),
            Some("r-1".into())
        );
        assert_eq!(record_id(&json!({"id": "abc"})), Some("abc".into()));
        assert_eq!(record_id(&json!({"id": 42})), Some("42".into()));
    }

    #[test]
    fn record_id_absent_or_unusable() {
        assert_eq!(record_id(&json!({"state": "HIGH"})), None);
        assert_eq!(record_id(&json!({"id": ""})), None);
        assert_eq!(record_id(&json!({"id": null})), None);
        assert_eq!(record_id(&json!(["abc"])), None);
    }

    // -- decode ----------------------------------------------------------------

    #[test]
    fn decode_keeps_payload_and_id() {
        let now = Utc::now();
        let raw = br#"{"id":"abc","type":"status","message":{"state":"LOW"}}"#;
        let rec = EventRecord::decode("esp32-DEE3/1/status", raw, "irrigation", now).unwrap();
        assert_eq!(rec.id.as_deref(), Some("abc"));
        assert_eq!(rec.event_type, "irrigation");
        assert_eq!(rec.payload["message"]["state"], "LOW");
        assert_eq!(rec.received_at, now);
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(EventRecord::decode("t", b"{oops", "irrigation", Utc::now()).is_err());
    }
}
