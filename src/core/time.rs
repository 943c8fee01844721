//! Timestamps, event ids and the CLI response envelope.

use serde_json::Value as JsonValue;
use ulid::Ulid;

/// Seconds since the unix epoch.
pub fn now_epoch_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    format!("{}Z", now_epoch_secs())
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Version of the CLI response envelope layout.
pub const ENVELOPE_VERSION: &str = "charter.envelope.v1";

/// Response envelope for every CLI command.
///
/// `instance` is set for commands that target one instance; `extra` object
/// fields are merged in at the top level.
pub fn command_envelope(
    cmd: &str,
    instance: Option<&str>,
    status: &str,
    extra: JsonValue,
) -> JsonValue {
    let mut base = serde_json::Map::new();
    base.insert("envelope_version".into(), ENVELOPE_VERSION.into());
    base.insert("charter_version".into(), env!("CARGO_PKG_VERSION").into());
    base.insert("ts".into(), now_epoch_z().into());
    base.insert("event_id".into(), new_event_id().into());
    base.insert("cmd".into(), cmd.into());
    if let Some(id) = instance {
        base.insert("instance_id".into(), id.into());
    }
    base.insert("status".into(), status.into());
    if let JsonValue::Object(extra) = extra {
        base.extend(extra);
    }
    JsonValue::Object(base)
}
