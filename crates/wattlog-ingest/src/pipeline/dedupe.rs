//! Near-duplicate suppression for telemetry events.
//!
//! Telemetry arrives far more often than it meaningfully changes; inserting
//! every sample would grow the store without bound. The [`Deduplicator`]
//! computes a **signature** — an order-stable serialization of a curated,
//! quantized subset of the event's fields — and skips an incoming event when
//! its signature equals the signature of the most recently *inserted* event
//! and the force interval has not yet elapsed.
//!
//! # Signature Rules
//!
//! - Volatile fields (timestamps, pid, loop counter, host, free-text reason)
//!   never participate: they change every sample regardless of content.
//! - The decision outcome and the write attempt/outcome always participate:
//!   an attempted inverter write is never silently collapsed away.
//! - Numeric fields are quantized to a step before comparison (separate steps
//!   for watts, price cents, and state-of-charge percent) so sub-step jitter
//!   does not defeat deduplication. The raw value is what gets stored.
//! - Three fidelity modes widen the field set progressively:
//!   `decision_only` ⊂ `decision` (adds battery state of charge) ⊂
//!   `telemetry` (adds quantized per-source power/temperature, meter, wifi).
//!
//! # Restart
//!
//! The deduplicator holds no persistent state of its own. On startup it
//! re-derives the last signature from the newest stored row, so pre- and
//! post-restart signatures stay comparable as long as the construction rules
//! above are unchanged.

use crate::error::Result;
use crate::pipeline::store::EventStore;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Fixed quantization step for temperatures (°C).
const TEMP_STEP_C: f64 = 1.0;

/// Fixed quantization step for wifi signal strength (dBm).
const WIFI_STEP_DBM: f64 = 5.0;

/// Which field subset participates in the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FidelityMode {
    /// Decision outcome, actuation, and coarse price/limit state only.
    DecisionOnly,
    /// Adds battery state of charge.
    #[default]
    Decision,
    /// Adds quantized power/temperature/wifi/meter fields from all sources.
    Telemetry,
}

impl FidelityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DecisionOnly => "decision_only",
            Self::Decision => "decision",
            Self::Telemetry => "telemetry",
        }
    }
}

impl std::str::FromStr for FidelityMode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "decision_only" => Ok(Self::DecisionOnly),
            "decision" => Ok(Self::Decision),
            "telemetry" => Ok(Self::Telemetry),
            _ => Err(()),
        }
    }
}

/// Rounding granularity applied to numeric fields before comparison.
#[derive(Debug, Clone, Copy)]
pub struct QuantizeSteps {
    /// Step for power values in watts.
    pub power_w: f64,
    /// Step for price values in currency cents.
    pub price_cents: f64,
    /// Step for battery state of charge in percent.
    pub soc_pct: f64,
}

impl Default for QuantizeSteps {
    fn default() -> Self {
        Self {
            power_w: 10.0,
            price_cents: 1.0,
            soc_pct: 1.0,
        }
    }
}

/// Configuration for the deduplicator.
#[derive(Debug, Clone)]
pub struct DedupeConfig {
    /// Master switch; disabled means every decoded event inserts.
    pub enabled: bool,

    /// Field subset participating in the signature.
    pub mode: FidelityMode,

    /// A heartbeat row is written whenever this much time has passed since
    /// the last insert, even with an unchanged signature.
    /// Default: 300 000 ms (5 minutes)
    pub force_interval_ms: i64,

    /// Quantization steps.
    pub steps: QuantizeSteps,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: FidelityMode::default(),
            force_interval_ms: 300_000,
            steps: QuantizeSteps::default(),
        }
    }
}

/// Outcome of a dedupe check for one incoming event.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupeDecision {
    /// Insert the event. Carries the already-computed signature so the
    /// caller can record it after the store commit without recomputing.
    Insert { signature: Option<String> },
    /// Informationally identical to the last inserted event within the
    /// force interval; the source file is still disposed of as handled.
    Skip,
}

/// The last inserted event's signature state.
#[derive(Debug, Clone)]
struct LastInsert {
    signature: String,
    at_epoch_ms: i64,
}

/// Signature-based near-duplicate suppressor.
pub struct Deduplicator {
    config: DedupeConfig,
    last: Option<LastInsert>,
}

impl Deduplicator {
    pub fn new(config: DedupeConfig) -> Self {
        Self { config, last: None }
    }

    /// Re-derive the last-signature state from the newest stored row.
    ///
    /// Called once at startup. An empty store leaves no prior signature, so
    /// the first event is always inserted regardless of mode.
    pub fn rehydrate(&mut self, store: &EventStore) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        match store.latest()? {
            Some(row) => match serde_json::from_str::<Value>(&row.data_json) {
                Ok(payload) => {
                    let signature = self.signature(&payload);
                    info!(
                        "Rehydrated dedupe state from row {} (mode={})",
                        row.id,
                        self.config.mode.as_str()
                    );
                    self.last = Some(LastInsert {
                        signature,
                        at_epoch_ms: row.ts_epoch_ms.unwrap_or(0),
                    });
                }
                Err(e) => {
                    warn!("Latest row {} has unparseable payload: {}", row.id, e);
                }
            },
            None => {
                debug!("Store is empty, no dedupe state to rehydrate");
            }
        }

        Ok(())
    }

    /// Decide whether an incoming event should be inserted or skipped.
    ///
    /// `now_ms` is the incoming event's timeline position (its
    /// `ts_epoch_ms`, which is the ingestion time when the producer omitted
    /// one); elapsed time is measured on that axis so the decision survives
    /// a restart unchanged.
    pub fn check(&self, payload: &Value, now_ms: i64) -> DedupeDecision {
        if !self.config.enabled {
            return DedupeDecision::Insert { signature: None };
        }

        let signature = self.signature(payload);

        if let Some(last) = &self.last {
            let elapsed = now_ms.saturating_sub(last.at_epoch_ms);
            if last.signature == signature && elapsed < self.config.force_interval_ms {
                return DedupeDecision::Skip;
            }
        }

        DedupeDecision::Insert {
            signature: Some(signature),
        }
    }

    /// Record a committed insert so subsequent checks compare against it.
    pub fn record_insert(&mut self, signature: Option<String>, at_epoch_ms: i64) {
        if let Some(signature) = signature {
            self.last = Some(LastInsert {
                signature,
                at_epoch_ms,
            });
        }
    }

    /// Compute the signature for a payload at the configured fidelity.
    ///
    /// The result is the compact JSON serialization of a sorted field map,
    /// so it is stable across producer key ordering.
    pub fn signature(&self, payload: &Value) -> String {
        let steps = &self.config.steps;
        let mut fields: BTreeMap<String, Value> = BTreeMap::new();

        // Core decision outcome, every mode
        put_raw(&mut fields, payload, "decision.export_costs");
        put_raw(&mut fields, payload, "decision.want_pct");
        put_raw(&mut fields, payload, "decision.want_enabled");
        put_quantized(&mut fields, payload, "decision.target_w", steps.power_w);
        put_quantized(
            &mut fields,
            payload,
            "decision.threshold_cents_kwh",
            steps.price_cents,
        );
        put_quantized(
            &mut fields,
            payload,
            "price.export_cents_kwh",
            steps.price_cents,
        );

        // Write attempt/outcome, every mode: an attempted actuation must
        // never be collapsed into the previous row.
        put_raw(&mut fields, payload, "write.attempted");
        put_raw(&mut fields, payload, "write.ok");

        if self.config.mode >= FidelityMode::Decision {
            put_quantized(&mut fields, payload, "battery.soc_pct", steps.soc_pct);
        }

        if self.config.mode >= FidelityMode::Telemetry {
            if let Some(sources) = lookup(payload, "sources").and_then(Value::as_object) {
                for (name, source) in sources {
                    for key in ["pv_est_w", "gen_w", "feed_w"] {
                        put_quantized_at(
                            &mut fields,
                            source.get(key),
                            format!("sources.{name}.{key}"),
                            steps.power_w,
                        );
                    }
                    put_quantized_at(
                        &mut fields,
                        source.get("temp_c"),
                        format!("sources.{name}.temp_c"),
                        TEMP_STEP_C,
                    );
                }
            }
            put_quantized(&mut fields, payload, "meter.power_w", steps.power_w);
            put_quantized(&mut fields, payload, "wifi.rssi", WIFI_STEP_DBM);
        }

        // BTreeMap serializes in key order, so this is canonical.
        serde_json::to_string(&fields).unwrap_or_default()
    }
}

/// Round to the nearest step multiple, ties to the even multiple.
///
/// Ties-to-even keeps values exactly halfway between multiples from
/// alternating buckets with their lower neighbor: with a 10 W step, 101 and
/// 105 both land on 100.
fn quantize(value: f64, step: f64) -> f64 {
    if step > 0.0 && value.is_finite() {
        (value / step).round_ties_even() * step
    } else {
        value
    }
}

/// Resolve a dotted path inside the payload.
fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    Some(current)
}

/// Include a field verbatim (booleans, small integers).
fn put_raw(fields: &mut BTreeMap<String, Value>, payload: &Value, path: &str) {
    if let Some(value) = lookup(payload, path) {
        fields.insert(path.to_string(), value.clone());
    }
}

/// Include a numeric field after quantization; non-numeric values are
/// ignored rather than poisoning the signature.
fn put_quantized(fields: &mut BTreeMap<String, Value>, payload: &Value, path: &str, step: f64) {
    put_quantized_at(fields, lookup(payload, path), path.to_string(), step);
}

fn put_quantized_at(
    fields: &mut BTreeMap<String, Value>,
    value: Option<&Value>,
    name: String,
    step: f64,
) {
    if let Some(v) = value.and_then(Value::as_f64) {
        fields.insert(name, Value::from(quantize(v, step)));
    }
}
