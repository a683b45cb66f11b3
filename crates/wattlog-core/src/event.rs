//! Decoding and validation of control-loop events.
//!
//! The producer writes one JSON object per file. Decoding enforces only the
//! structural minimum (a keyed record with a non-empty `event_id`); every
//! other field is extracted defensively so a single odd payload can never
//! abort the ingestion pass.

use crate::error::{Error, Result};
use serde_json::Value;

/// Denormalized copies of the `decision.*` payload fields.
///
/// Stored as their own columns so the dashboard can query the decision
/// outcome without parsing `data_json`. Missing or wrongly-typed fields
/// become `None`, never an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionColumns {
    pub export_costs: Option<bool>,
    pub want_pct: Option<i64>,
    pub want_enabled: Option<i64>,
    pub reason: Option<String>,
}

/// One decoded telemetry/decision sample, ready for the pipeline.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    /// Producer-assigned natural key, globally unique.
    pub event_id: String,

    /// Milliseconds since epoch; ingestion time substituted when the
    /// producer omitted it.
    pub ts_epoch_ms: i64,

    /// Opaque display timestamps.
    pub ts_utc: Option<String>,
    pub ts_local: Option<String>,

    /// Provenance metadata, opaque.
    pub host: Option<String>,
    pub pid: Option<i64>,
    pub loop_no: Option<i64>,

    /// Extracted decision columns.
    pub decision: DecisionColumns,

    /// The full original payload.
    pub payload: Value,
}

impl DecodedEvent {
    /// Decode raw file bytes into a structured event.
    ///
    /// `ingested_at_ms` is substituted for `ts_epoch_ms` when the producer
    /// omitted it (or sent it with the wrong type).
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not valid JSON, the root is not an
    /// object, or `event_id` is absent/empty. All of these are classified as
    /// malformed input (see [`Error::is_malformed_input`]).
    pub fn decode(raw: &[u8], ingested_at_ms: i64) -> Result<Self> {
        let value: Value = serde_json::from_slice(raw)?;

        let obj = value.as_object().ok_or(Error::NotAnObject)?;

        let event_id = obj
            .get("event_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(Error::MissingEventId)?
            .to_string();

        let ts_epoch_ms = obj
            .get("ts_epoch_ms")
            .and_then(Value::as_i64)
            .unwrap_or(ingested_at_ms);

        let decision = obj
            .get("decision")
            .and_then(Value::as_object)
            .map(|d| DecisionColumns {
                export_costs: d.get("export_costs").and_then(as_loose_bool),
                want_pct: d.get("want_pct").and_then(as_loose_int),
                want_enabled: d.get("want_enabled").and_then(as_loose_int),
                reason: d
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .unwrap_or_default();

        Ok(Self {
            event_id,
            ts_epoch_ms,
            ts_utc: get_string(obj, "ts_utc"),
            ts_local: get_string(obj, "ts_local"),
            host: get_string(obj, "host"),
            pid: obj.get("pid").and_then(as_loose_int),
            loop_no: obj.get("loop").and_then(as_loose_int),
            decision,
            payload: value,
        })
    }

    /// Serialize the full payload compactly for storage.
    ///
    /// Key order is whatever the producer sent; the string round-trips
    /// losslessly until retention slims the row.
    pub fn payload_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}

fn get_string(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Accept JSON booleans and numbers (non-zero = true) for flag fields.
///
/// The producer has historically emitted both `true` and `1` here.
fn as_loose_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0).or_else(|| n.as_f64().map(|f| f != 0.0)),
        _ => None,
    }
}

/// Accept integers directly and truncate floats; everything else is `None`.
fn as_loose_int(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> Vec<u8> {
        json!({
            "event_id": "ev-20250806-120000-001",
            "ts_epoch_ms": 1754480400000i64,
            "ts_utc": "2025-08-06T12:00:00Z",
            "ts_local": "2025-08-06 14:00:00",
            "host": "solarpi",
            "pid": 4242,
            "loop": 17,
            "decision": {
                "export_costs": true,
                "want_pct": 30,
                "want_enabled": 1,
                "reason": "price below threshold"
            },
            "sources": { "et": { "pv_est_w": 3120, "gen_w": 2980 } }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_decode_full_event() {
        let event = DecodedEvent::decode(&sample_event(), 0).unwrap();

        assert_eq!(event.event_id, "ev-20250806-120000-001");
        assert_eq!(event.ts_epoch_ms, 1754480400000);
        assert_eq!(event.host.as_deref(), Some("solarpi"));
        assert_eq!(event.pid, Some(4242));
        assert_eq!(event.loop_no, Some(17));
        assert_eq!(event.decision.export_costs, Some(true));
        assert_eq!(event.decision.want_pct, Some(30));
        assert_eq!(event.decision.want_enabled, Some(1));
        assert_eq!(
            event.decision.reason.as_deref(),
            Some("price below threshold")
        );
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        let result = DecodedEvent::decode(b"not json", 0);
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[test]
    fn test_decode_rejects_non_object_root() {
        let result = DecodedEvent::decode(b"[1, 2, 3]", 0);
        assert!(matches!(result, Err(Error::NotAnObject)));
    }

    #[test]
    fn test_decode_rejects_missing_event_id() {
        let raw = json!({"not_an_event": true}).to_string();
        let result = DecodedEvent::decode(raw.as_bytes(), 0);
        assert!(matches!(result, Err(Error::MissingEventId)));
    }

    #[test]
    fn test_decode_rejects_empty_event_id() {
        let raw = json!({"event_id": ""}).to_string();
        let result = DecodedEvent::decode(raw.as_bytes(), 0);
        assert!(matches!(result, Err(Error::MissingEventId)));
    }

    #[test]
    fn test_missing_timestamp_substitutes_ingestion_time() {
        let raw = json!({"event_id": "ev-1"}).to_string();
        let event = DecodedEvent::decode(raw.as_bytes(), 1754480400123).unwrap();
        assert_eq!(event.ts_epoch_ms, 1754480400123);
    }

    #[test]
    fn test_wrongly_typed_fields_become_null() {
        let raw = json!({
            "event_id": "ev-2",
            "pid": "not-a-number",
            "loop": [1],
            "decision": {
                "export_costs": "yes",
                "want_pct": {"nested": true},
                "reason": 42
            }
        })
        .to_string();

        let event = DecodedEvent::decode(raw.as_bytes(), 0).unwrap();
        assert_eq!(event.pid, None);
        assert_eq!(event.loop_no, None);
        assert_eq!(event.decision.export_costs, None);
        assert_eq!(event.decision.want_pct, None);
        assert_eq!(event.decision.reason, None);
    }

    #[test]
    fn test_numeric_flags_coerce() {
        let raw = json!({
            "event_id": "ev-3",
            "decision": { "export_costs": 1, "want_pct": 30.9 }
        })
        .to_string();

        let event = DecodedEvent::decode(raw.as_bytes(), 0).unwrap();
        assert_eq!(event.decision.export_costs, Some(true));
        assert_eq!(event.decision.want_pct, Some(30));
    }

    #[test]
    fn test_payload_round_trips() {
        let event = DecodedEvent::decode(&sample_event(), 0).unwrap();
        let stored = event.payload_json().unwrap();
        let reparsed: Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(reparsed, event.payload);
    }
}
