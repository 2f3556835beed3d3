//! Timestamp, identifier and envelope helpers shared by the engine and CLI.

use crate::core::error::GovernanceError;
use serde_json::Value as JsonValue;
use ulid::Ulid;

const ENVELOPE_VERSION: &str = "1.0.0";

/// Unix-epoch seconds with a `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

/// Fresh ULID used for conference ids, log entry ids and audit events.
pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Command response envelope printed by `--format json` surfaces.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": ENVELOPE_VERSION,
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}

/// Envelope for a rejected or failed command, carrying the error code.
pub fn error_envelope(cmd: &str, err: &GovernanceError) -> JsonValue {
    let mut extra = serde_json::json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    if let (Some(rule), Some(obj)) = (err.rule(), extra.as_object_mut()) {
        obj.insert("rule".to_string(), JsonValue::from(rule.code()));
    }
    let status = if err.is_rejection() { "rejected" } else { "error" };
    command_envelope(cmd, status, extra)
}
