//! The Checkstand client: one session object wiring every component

use crate::api::{ProductMetadata, PurchaseSubmission, RegistrationRequest};
use crate::billing::{BillingService, PurchaseUpdate};
use crate::catalog::{CatalogLoader, ProductLoadingState};
use crate::config::{CheckstandOptions, DEFAULT_BASE_URL, DEFAULT_FAILOVER_URL};
use crate::device::{self, DeviceIdentity, DeviceInfo};
use crate::error::{CheckstandError, Result};
use crate::fallback::FallbackCache;
use crate::processor::{PurchaseIntent, PurchaseProcessor};
use crate::storage::{self, keys, MemoryStorage, StorageAdapter};
use crate::store::StoreConnector;
use crate::sync::SyncCoordinator;
use crate::transport::{LedgerApi, RetryingTransport};
use crate::types::{
    CheckstandListener, EntitlementSnapshot, ProductDefinition, PurchaseResult, ReplacementMode,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use url::Url;

/// Checkstand SDK client.
///
/// One `Checkstand` is constructed at SDK start and injected wherever the app
/// needs purchases; there is no global state. The billing service and its
/// purchase-update channel come from the platform side of the integration.
///
/// # Example
/// ```rust,ignore
/// use checkstand::{Checkstand, CheckstandOptions};
///
/// let (updates_tx, updates_rx) = tokio::sync::mpsc::unbounded_channel();
/// let billing = platform_billing(updates_tx);
/// let sdk = Checkstand::new("your-api-key", billing, updates_rx, Default::default())?;
///
/// sdk.load_catalog().await?;
/// let result = sdk.purchase("premium_monthly", Some("offer-token")).await?;
/// ```
pub struct Checkstand {
    identity: DeviceIdentity,
    observer_mode: bool,
    storage: Arc<dyn StorageAdapter>,
    connector: Arc<StoreConnector>,
    ledger: Arc<dyn LedgerApi>,
    fallback: Arc<FallbackCache>,
    catalog: Arc<CatalogLoader>,
    processor: PurchaseProcessor,
    sync: SyncCoordinator,
    device_info: DeviceInfo,
    listeners: Mutex<Vec<Arc<dyn CheckstandListener>>>,
    registered: Mutex<bool>,
}

impl Checkstand {
    /// Create a new Checkstand client.
    ///
    /// # Arguments
    /// * `api_key` - ledger authority API key
    /// * `billing` - the platform billing service binding
    /// * `updates` - the channel the platform delivers purchase updates on
    /// * `options` - optional configuration
    pub fn new(
        api_key: &str,
        billing: Arc<dyn BillingService>,
        updates: mpsc::UnboundedReceiver<PurchaseUpdate>,
        options: CheckstandOptions,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(CheckstandError::validation("api_key is required"));
        }

        let storage: Arc<dyn StorageAdapter> = options
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let device_id = device::ensure_device_id(storage.as_ref(), options.device_id);
        let user_id = device::ensure_user_id(storage.as_ref(), options.user_id, &device_id);
        let identity = DeviceIdentity { user_id, device_id };

        let primary = parse_url(options.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;
        let failover = parse_url(
            options
                .failover_url
                .as_deref()
                .unwrap_or(DEFAULT_FAILOVER_URL),
        )?;

        let fallback = Arc::new(FallbackCache::new(
            options.fallback_snapshot,
            storage.clone(),
        ));
        let ledger: Arc<dyn LedgerApi> = Arc::new(RetryingTransport::new(
            api_key.to_string(),
            primary,
            failover,
            fallback.clone(),
        )?);

        Ok(Self::with_ledger(
            billing,
            ledger,
            fallback,
            storage,
            identity,
            updates,
            options.consumable_product_ids,
            options.observer_mode,
            DeviceInfo::collect(options.app_version, options.sandbox),
        ))
    }

    /// Assemble the client around an explicit ledger implementation. Exposed
    /// for integrations and tests that bring their own transport.
    #[allow(clippy::too_many_arguments)]
    pub fn with_ledger(
        billing: Arc<dyn BillingService>,
        ledger: Arc<dyn LedgerApi>,
        fallback: Arc<FallbackCache>,
        storage: Arc<dyn StorageAdapter>,
        identity: DeviceIdentity,
        updates: mpsc::UnboundedReceiver<PurchaseUpdate>,
        consumable_product_ids: Vec<String>,
        observer_mode: bool,
        device_info: DeviceInfo,
    ) -> Self {
        let connector = Arc::new(StoreConnector::new(billing));
        let catalog = Arc::new(CatalogLoader::new(connector.clone()));
        let processor = PurchaseProcessor::new(
            connector.clone(),
            ledger.clone(),
            fallback.clone(),
            storage.clone(),
            identity.clone(),
            consumable_product_ids,
            observer_mode,
            updates,
        );
        let sync = SyncCoordinator::new(
            connector.clone(),
            ledger.clone(),
            fallback.clone(),
            storage.clone(),
            catalog.clone(),
            identity.clone(),
        );

        Self {
            identity,
            observer_mode,
            storage,
            connector,
            ledger,
            fallback,
            catalog,
            processor,
            sync,
            device_info,
            listeners: Mutex::new(Vec::new()),
            registered: Mutex::new(false),
        }
    }

    // ==================== Registration ====================

    /// Register this device with the ledger authority, refreshing the cached
    /// entitlement snapshot. Idempotent: after one success it only re-runs to
    /// leave fallback mode.
    pub async fn register(&self) -> Result<EntitlementSnapshot> {
        if *self.registered.lock().unwrap_or_else(PoisonError::into_inner)
            && !self.fallback.is_active()
        {
            return Ok(self.entitlements());
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let request = RegistrationRequest {
            user_id: self.identity.user_id.clone(),
            device_id: self.identity.device_id.clone(),
            locale: self.device_info.locale.clone(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            app_version: self.device_info.app_version.clone(),
            device_family: self.device_info.device_family.clone(),
            device_model: self.device_info.device_model.clone(),
            os_version: self.device_info.os_version.clone(),
            time_zone: self.device_info.time_zone.clone(),
            is_sandbox: self.device_info.sandbox,
            install_time: now_ms,
            first_seen: device::first_seen(self.storage.as_ref(), now_ms),
        };

        match self.ledger.register(&request).await {
            Ok(customer) => {
                self.storage.set(keys::USER_ID, &customer.user_id);
                let snapshot = customer.into_snapshot(&self.identity.device_id, now_ms);
                storage::set_json(self.storage.as_ref(), keys::ENTITLEMENTS, &snapshot);
                *self.registered.lock().unwrap_or_else(PoisonError::into_inner) = true;

                // A real round trip succeeded: leave fallback mode and send
                // staged purchases for genuine validation.
                let snapshot = self.revalidate_staged(snapshot, now_ms).await;
                self.notify_entitlements(&snapshot);
                Ok(snapshot)
            }
            Err(err) => {
                if self.fallback.is_active() {
                    // Degraded but available: catalog from the bundled
                    // snapshot, entitlements from cache.
                    self.load_fallback_catalog().await;
                    return Ok(self.entitlements());
                }
                Err(err)
            }
        }
    }

    /// Resubmit purchases staged during fallback. Failure keeps the prior
    /// snapshot; those purchases simply stay staged on the next activation.
    async fn revalidate_staged(
        &self,
        snapshot: EntitlementSnapshot,
        now_ms: i64,
    ) -> EntitlementSnapshot {
        let staged = self.fallback.deactivate();
        if staged.is_empty() {
            return snapshot;
        }
        tracing::info!(count = staged.len(), "revalidating purchases staged during fallback");
        let submission = PurchaseSubmission {
            user_id: self.identity.user_id.clone(),
            device_id: self.identity.device_id.clone(),
            purchases: staged.clone(),
            observer_mode: self.observer_mode,
        };
        match self.ledger.submit_purchases(&submission).await {
            Ok(customer) => {
                let validated = customer.into_snapshot(&self.identity.device_id, now_ms);
                storage::set_json(self.storage.as_ref(), keys::ENTITLEMENTS, &validated);
                validated
            }
            Err(err) => {
                tracing::warn!(error = %err, "staged revalidation failed, keeping prior snapshot");
                for item in staged {
                    self.fallback.stage(item);
                }
                snapshot
            }
        }
    }

    async fn load_fallback_catalog(&self) {
        let ids: Vec<String> = self
            .fallback
            .product_ids()
            .into_iter()
            .map(|p: ProductMetadata| p.product_id)
            .collect();
        if ids.is_empty() {
            return;
        }
        let state = self.catalog.load(&ids).await;
        self.notify_catalog(&state);
    }

    // ==================== Catalog ====================

    /// Fetch the product list from the ledger authority (or the fallback
    /// snapshot) and load full definitions from the platform billing service.
    pub async fn load_catalog(&self) -> Result<ProductLoadingState> {
        let ids: Vec<String> = if self.fallback.is_active() {
            self.fallback
                .product_ids()
                .into_iter()
                .map(|p| p.product_id)
                .collect()
        } else {
            self.ledger
                .fetch_products()
                .await?
                .into_iter()
                .map(|p| p.product_id)
                .collect()
        };

        let state = self.catalog.load_with_retry(&ids).await;
        self.notify_catalog(&state);
        Ok(state)
    }

    /// Products visible right now: live, cached, or fallback - never empty
    /// unless nothing has ever loaded.
    pub fn products(&self) -> Vec<ProductDefinition> {
        self.catalog.visible_products()
    }

    /// The catalog state machine, for callers that drive retries themselves.
    pub fn catalog(&self) -> &CatalogLoader {
        &self.catalog
    }

    // ==================== Purchases ====================

    /// Initiate a purchase-intent for a loaded product. The completion
    /// callback contract always resolves this future - success, typed error,
    /// or cancellation.
    pub async fn purchase(
        &self,
        product_id: &str,
        offer_token: Option<&str>,
    ) -> Result<PurchaseResult> {
        self.purchase_with(product_id, offer_token, None, None, None, None)
            .await
    }

    /// Purchase with full control: replacement of an existing subscription
    /// and paywall/placement linkage ids carried to the ledger.
    pub async fn purchase_with(
        &self,
        product_id: &str,
        offer_token: Option<&str>,
        old_token: Option<&str>,
        replacement_mode: Option<ReplacementMode>,
        paywall_id: Option<&str>,
        placement_id: Option<&str>,
    ) -> Result<PurchaseResult> {
        let product = self
            .products()
            .into_iter()
            .find(|p| p.product_id == product_id)
            .ok_or_else(|| {
                CheckstandError::validation(format!("product {} is not loaded", product_id))
            })?;

        let intent = PurchaseIntent {
            product,
            offer_token: offer_token.map(str::to_string),
            old_token: old_token.map(str::to_string),
            replacement_mode,
            paywall_id: paywall_id.map(str::to_string),
            placement_id: placement_id.map(str::to_string),
        };
        let result = self.processor.purchase(intent).await?;
        self.notify_entitlements(&result.snapshot);
        Ok(result)
    }

    /// Restore the full purchase history and synchronize it with the ledger
    /// authority. Queues behind any sync session already running.
    pub async fn restore_purchases(&self) -> Result<EntitlementSnapshot> {
        let snapshot = self.sync.restore(self.observer_mode).await?;
        self.notify_entitlements(&snapshot);
        Ok(snapshot)
    }

    // ==================== Entitlements ====================

    /// The last known entitlement snapshot (possibly cached or temporary).
    pub fn entitlements(&self) -> EntitlementSnapshot {
        storage::get_json(self.storage.as_ref(), keys::ENTITLEMENTS).unwrap_or_default()
    }

    /// Whether any subscription is active right now.
    pub fn has_active_subscription(&self) -> bool {
        self.entitlements()
            .has_active_subscription(chrono::Utc::now().timestamp_millis())
    }

    /// Whether fallback mode is currently active.
    pub fn is_fallback_active(&self) -> bool {
        self.fallback.is_active()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Direct access to the billing connector, for hosts that need to signal
    /// service loss.
    pub fn connector(&self) -> &StoreConnector {
        &self.connector
    }

    // ==================== Listeners ====================

    /// Register a catalog/entitlement change listener.
    pub fn add_listener(&self, listener: Arc<dyn CheckstandListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn notify_catalog(&self, state: &ProductLoadingState) {
        // Deliver each terminal value to the listener fan-out at most once.
        if !self.catalog.mark_responded() {
            return;
        }
        let products = state.visible_products();
        for listener in self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            listener.catalog_updated(products);
        }
    }

    fn notify_entitlements(&self, snapshot: &EntitlementSnapshot) {
        for listener in self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            listener.entitlements_updated(snapshot);
        }
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| CheckstandError::validation(format!("invalid url {}: {}", raw, e)))
}

impl std::fmt::Debug for Checkstand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkstand")
            .field("identity", &self.identity)
            .field("observer_mode", &self.observer_mode)
            .field("fallback_active", &self.fallback.is_active())
            .finish()
    }
}
