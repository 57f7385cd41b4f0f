//! Projections of the stored snapshot served over HTTP.
//!
//! Both projections work on deep copies; the stored document is never
//! modified.

use serde_json::Value;

use crate::store::Snapshot;

/// Top-level key holding the patient document.
pub const PATIENT_DATA_KEY: &str = "patientData";

/// Reading sequences converted from mg/dL to mmol/L on the full endpoint.
const CONVERTED_SEQUENCES: [&str; 2] = ["sgs", "meterData"];

/// Keys stripped from the patient document by the `nohistory` endpoint.
const HISTORY_KEYS: [&str; 4] = ["sgs", "markers", "limits", "notificationHistory"];

const MGDL_PER_MMOLL: f64 = 18.0;

/// Converts a glucose value from mg/dL to mmol/L, rounded to one decimal.
///
/// Rounds the exact quotient half-to-even, so `4.5` gives `0.2`.
pub fn mgdl_to_mmoll(value: f64) -> f64 {
    let mmoll = value / MGDL_PER_MMOLL;
    format!("{mmoll:.1}").parse().unwrap_or(mmoll)
}

/// Rewrites the numeric `value` field of every object entry in `entries`.
fn convert_entries(entries: &mut Value) {
    let Some(entries) = entries.as_array_mut() else {
        return;
    };

    for entry in entries.iter_mut().filter_map(Value::as_object_mut) {
        let converted = entry
            .get("value")
            .and_then(Value::as_f64)
            .map(mgdl_to_mmoll);
        if let Some(mmoll) = converted {
            entry.insert("value".to_string(), Value::from(mmoll));
        }
    }
}

/// Whether a JSON value holds anything: null, false, zero and empty
/// strings/arrays/objects do not.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Full snapshot with `sgs` and `meterData` values in mmol/L.
///
/// Returns `null` when no snapshot is stored.
pub fn full_snapshot(snapshot: Option<&Snapshot>) -> Value {
    let mut data = snapshot.cloned().unwrap_or(Value::Null);

    if is_truthy(&data) {
        if let Some(patient) = data
            .get_mut(PATIENT_DATA_KEY)
            .and_then(Value::as_object_mut)
        {
            for key in CONVERTED_SEQUENCES {
                if let Some(entries) = patient.get_mut(key) {
                    convert_entries(entries);
                }
            }
        }
    }

    data
}

/// Patient document without history sequences.
///
/// An empty store yields the JSON string `""`, distinct from any document.
/// A snapshot without `patientData` yields `null`.
pub fn essential_data(snapshot: Option<&Snapshot>) -> Value {
    let Some(snapshot) = snapshot else {
        return Value::String(String::new());
    };

    let mut data = snapshot
        .get(PATIENT_DATA_KEY)
        .cloned()
        .unwrap_or(Value::Null);

    if let Some(patient) = data.as_object_mut() {
        for key in HISTORY_KEYS {
            patient.remove(key);
        }
    }

    // No-op while `sgs` is in HISTORY_KEYS.
    if is_truthy(&data) {
        if let Some(entries) = data.as_object_mut().and_then(|p| p.get_mut("sgs")) {
            convert_entries(entries);
        }
    }

    data
}
