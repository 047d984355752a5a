//! Client configuration and tuning constants

use crate::storage::StorageAdapter;
use std::sync::Arc;
use std::time::Duration;

/// Default ledger authority URL
pub const DEFAULT_BASE_URL: &str = "https://api.checkstand.app";

/// Secondary host used after repeated name-resolution failures
pub const DEFAULT_FAILOVER_URL: &str = "https://api.checkstand.com";

/// Connect/read timeout for most ledger calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Extended read timeout for purchase validation
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed delay between transient-failure retry attempts
pub const RETRY_DELAY: Duration = Duration::from_millis(1_000);

/// Extended delay before the single 429 retry
pub const RATE_LIMIT_DELAY: Duration = Duration::from_millis(5_000);

/// Attempt ceiling for transient failures on one call
pub const ATTEMPT_CEILING: u32 = 3;

/// Consecutive name-resolution failures before switching hosts
pub const DNS_FAILOVER_THRESHOLD: u32 = 2;

/// Delay between billing-service connection attempts
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Per-call catalog retry ceiling
pub const CATALOG_RETRY_CEILING: u32 = 3;

/// Lifetime catalog retry ceiling across the whole process
pub const CATALOG_LIFETIME_RETRY_CEILING: u32 = 100;

/// The platform auto-refunds purchases not acknowledged within this window.
pub const ACK_DEADLINE: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Activity window granted to a fallback-synthesized entitlement before it
/// must be revalidated.
pub const TEMPORARY_ENTITLEMENT_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Configuration options for the Checkstand client
#[derive(Clone, Default)]
pub struct CheckstandOptions {
    /// Ledger authority URL (default: [`DEFAULT_BASE_URL`])
    pub base_url: Option<String>,
    /// Secondary host for failover (default: [`DEFAULT_FAILOVER_URL`])
    pub failover_url: Option<String>,
    /// Custom storage adapter (default: in-memory)
    pub storage: Option<Arc<dyn StorageAdapter>>,
    /// Override device ID (default: generated and persisted)
    pub device_id: Option<String>,
    /// Your own user identifier, if the app has one
    pub user_id: Option<String>,
    /// Product IDs that should be consumed rather than acknowledged
    pub consumable_product_ids: Vec<String>,
    /// Observer mode: purchases are reported but the app drives billing itself
    pub observer_mode: bool,
    /// Bundled catalog snapshot (JSON) served while the ledger is unreachable
    pub fallback_snapshot: Option<String>,
    /// Sandbox flag forwarded on registration
    pub sandbox: bool,
    /// App version forwarded on registration
    pub app_version: Option<String>,
}

impl std::fmt::Debug for CheckstandOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckstandOptions")
            .field("base_url", &self.base_url)
            .field("failover_url", &self.failover_url)
            .field("storage", &"<storage>")
            .field("device_id", &self.device_id)
            .field("user_id", &self.user_id)
            .field("consumable_product_ids", &self.consumable_product_ids)
            .field("observer_mode", &self.observer_mode)
            .field("sandbox", &self.sandbox)
            .finish()
    }
}
