//! Device identity and registration metadata

use crate::storage::{keys, StorageAdapter};
use serde::{Deserialize, Serialize};

/// Generate a random UUID v4
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The user/device pair entitlements are attributed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub user_id: String,
    pub device_id: String,
}

/// Resolve the device id: explicit override, then stored value, then a fresh
/// UUID persisted for next launch.
pub fn ensure_device_id(storage: &dyn StorageAdapter, explicit: Option<String>) -> String {
    if let Some(id) = explicit {
        storage.set(keys::DEVICE_ID, &id);
        return id;
    }
    if let Some(id) = storage.get(keys::DEVICE_ID) {
        return id;
    }
    let id = generate_uuid();
    storage.set(keys::DEVICE_ID, &id);
    id
}

/// Resolve the user id: explicit value from the app, then stored value (a
/// previous registration response), then the device id.
pub fn ensure_user_id(storage: &dyn StorageAdapter, explicit: Option<String>, device_id: &str) -> String {
    if let Some(id) = explicit {
        storage.set(keys::USER_ID, &id);
        return id;
    }
    storage
        .get(keys::USER_ID)
        .unwrap_or_else(|| device_id.to_string())
}

/// The first time this install was seen, epoch milliseconds. Persisted on
/// first call.
pub fn first_seen(storage: &dyn StorageAdapter, now_ms: i64) -> i64 {
    if let Some(raw) = storage.get(keys::FIRST_SEEN) {
        if let Ok(ts) = raw.parse() {
            return ts;
        }
    }
    storage.set(keys::FIRST_SEEN, &now_ms.to_string());
    now_ms
}

/// Environment metadata sent with registration
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub locale: String,
    pub device_family: String,
    pub device_model: String,
    pub os_version: String,
    pub time_zone: String,
    pub app_version: String,
    pub sandbox: bool,
}

impl DeviceInfo {
    /// Collect what the process can know about its environment without
    /// platform bindings. The host app overrides fields it knows better.
    pub fn collect(app_version: Option<String>, sandbox: bool) -> Self {
        Self {
            locale: std::env::var("LANG").unwrap_or_else(|_| "en_US".to_string()),
            device_family: std::env::consts::FAMILY.to_string(),
            device_model: std::env::consts::ARCH.to_string(),
            os_version: std::env::consts::OS.to_string(),
            time_zone: std::env::var("TZ").unwrap_or_else(|_| "UTC".to_string()),
            app_version: app_version.unwrap_or_else(|| "unknown".to_string()),
            sandbox,
        }
    }
}
