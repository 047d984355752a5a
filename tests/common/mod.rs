//! Test utilities and fixtures for Checkstand integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use checkstand::api::{
    ApiSubscription, CustomerResponse, ProductMetadata, PurchaseSubmission, RegistrationRequest,
};
use checkstand::client::Checkstand;
use checkstand::device::{DeviceIdentity, DeviceInfo};
use checkstand::error::{CheckstandError, Result};
use checkstand::fallback::FallbackCache;
use checkstand::{
    BillingResponseCode, BillingService, HistoryRecord, LedgerApi, MemoryStorage,
    PlatformPurchase, ProductDefinition, ProductKind, PurchaseParams, PurchaseState,
    PurchaseUpdate, StorageAdapter,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A scripted platform billing service.
pub struct MockBilling {
    /// Product definitions served per category
    pub products: Mutex<Vec<ProductDefinition>>,
    /// Purchase history served per category
    pub history: Mutex<Vec<HistoryRecord>>,
    /// Update pushed onto the purchase channel when a purchase launches
    pub launch_update: Mutex<Option<PurchaseUpdate>>,
    pub updates_tx: mpsc::UnboundedSender<PurchaseUpdate>,
    /// Fail the first N connection attempts
    pub connect_failures: AtomicU32,
    pub connect_calls: AtomicU32,
    pub detail_queries: AtomicU32,
    pub ack_error: Mutex<Option<BillingResponseCode>>,
    pub acknowledged: Mutex<Vec<String>>,
    pub consumed: Mutex<Vec<String>>,
}

impl MockBilling {
    pub fn new(updates_tx: mpsc::UnboundedSender<PurchaseUpdate>) -> Self {
        Self {
            products: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            launch_update: Mutex::new(None),
            updates_tx,
            connect_failures: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            detail_queries: AtomicU32::new(0),
            ack_error: Mutex::new(None),
            acknowledged: Mutex::new(Vec::new()),
            consumed: Mutex::new(Vec::new()),
        }
    }

    pub fn add_product(&self, product: ProductDefinition) {
        self.products.lock().unwrap().push(product);
    }

    pub fn add_history(&self, record: HistoryRecord) {
        self.history.lock().unwrap().push(record);
    }

    /// Script the update delivered when the next purchase flow launches.
    pub fn script_purchase(&self, update: PurchaseUpdate) {
        *self.launch_update.lock().unwrap() = Some(update);
    }
}

#[async_trait]
impl BillingService for MockBilling {
    async fn start_connection(&self) -> std::result::Result<(), BillingResponseCode> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.connect_failures.load(Ordering::SeqCst) > 0 {
            self.connect_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(BillingResponseCode::ServiceDisconnected);
        }
        Ok(())
    }

    async fn query_product_details(
        &self,
        ids: &[String],
        kind: ProductKind,
    ) -> std::result::Result<Vec<ProductDefinition>, BillingResponseCode> {
        self.detail_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .products
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.kind == kind && ids.contains(&p.product_id))
            .cloned()
            .collect())
    }

    async fn launch_purchase(&self, _params: &PurchaseParams) -> BillingResponseCode {
        match self.launch_update.lock().unwrap().take() {
            Some(update) => {
                let _ = self.updates_tx.send(update);
                BillingResponseCode::Ok
            }
            None => BillingResponseCode::Error,
        }
    }

    async fn acknowledge(&self, token: &str) -> std::result::Result<(), BillingResponseCode> {
        if let Some(code) = *self.ack_error.lock().unwrap() {
            return Err(code);
        }
        self.acknowledged.lock().unwrap().push(token.to_string());
        Ok(())
    }

    async fn consume(&self, token: &str) -> std::result::Result<(), BillingResponseCode> {
        self.consumed.lock().unwrap().push(token.to_string());
        Ok(())
    }

    async fn query_purchase_history(
        &self,
        kind: ProductKind,
    ) -> std::result::Result<Vec<HistoryRecord>, BillingResponseCode> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect())
    }
}

/// A scripted ledger authority.
///
/// Mirrors the transport contract: a failed registration activates the
/// fallback cache it was built with.
pub struct MockLedger {
    pub fallback: Mutex<Option<Arc<FallbackCache>>>,
    pub fail_register: Mutex<bool>,
    pub fail_submit: Mutex<bool>,
    /// Subscriptions the ledger reports as owned: (product_id, expires_at)
    pub owned_subscriptions: Mutex<Vec<(String, i64)>>,
    pub product_metadata: Mutex<Vec<ProductMetadata>>,
    pub register_calls: AtomicU32,
    /// Token lists of every submission received
    pub submissions: Mutex<Vec<Vec<String>>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            fallback: Mutex::new(None),
            fail_register: Mutex::new(false),
            fail_submit: Mutex::new(false),
            owned_subscriptions: Mutex::new(Vec::new()),
            product_metadata: Mutex::new(Vec::new()),
            register_calls: AtomicU32::new(0),
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fail_register(&self, fail: bool) {
        *self.fail_register.lock().unwrap() = fail;
    }

    pub fn set_fail_submit(&self, fail: bool) {
        *self.fail_submit.lock().unwrap() = fail;
    }

    pub fn own_subscription(&self, product_id: &str, expires_at: i64) {
        self.owned_subscriptions
            .lock()
            .unwrap()
            .push((product_id.to_string(), expires_at));
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    fn customer(&self) -> CustomerResponse {
        CustomerResponse {
            user_id: "ledger-user".to_string(),
            subscriptions: self
                .owned_subscriptions
                .lock()
                .unwrap()
                .iter()
                .map(|(id, exp)| ApiSubscription {
                    product_id: id.clone(),
                    expires_at: Some(*exp),
                    is_active: true,
                })
                .collect(),
            purchases: Vec::new(),
        }
    }
}

#[async_trait]
impl LedgerApi for MockLedger {
    async fn register(&self, _req: &RegistrationRequest) -> Result<CustomerResponse> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_register.lock().unwrap() {
            if let Some(fallback) = self.fallback.lock().unwrap().as_ref() {
                fallback.activate();
            }
            return Err(CheckstandError::transient("ledger unreachable"));
        }
        Ok(self.customer())
    }

    async fn submit_purchases(&self, req: &PurchaseSubmission) -> Result<CustomerResponse> {
        if *self.fail_submit.lock().unwrap() {
            return Err(CheckstandError::transient("ledger unreachable"));
        }
        let tokens: Vec<String> = req
            .purchases
            .iter()
            .map(|p| p.purchase_token.clone())
            .collect();
        for token in &tokens {
            // Anything the ledger confirms becomes an owned subscription so
            // later snapshots reflect it.
            let product = req
                .purchases
                .iter()
                .find(|p| &p.purchase_token == token)
                .map(|p| p.product_id.clone())
                .unwrap_or_default();
            let mut owned = self.owned_subscriptions.lock().unwrap();
            if !owned.iter().any(|(id, _)| *id == product) {
                owned.push((product, i64::MAX));
            }
        }
        self.submissions.lock().unwrap().push(tokens);
        Ok(self.customer())
    }

    async fn fetch_products(&self) -> Result<Vec<ProductMetadata>> {
        Ok(self.product_metadata.lock().unwrap().clone())
    }
}

/// Everything a test needs in one place.
pub struct Harness {
    pub sdk: Checkstand,
    pub billing: Arc<MockBilling>,
    pub ledger: Arc<MockLedger>,
    pub storage: Arc<MemoryStorage>,
}

pub struct HarnessOptions {
    pub consumable_product_ids: Vec<String>,
    pub observer_mode: bool,
    pub fallback_snapshot: Option<String>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            consumable_product_ids: Vec::new(),
            observer_mode: false,
            fallback_snapshot: None,
        }
    }
}

pub fn setup(options: HarnessOptions) -> Harness {
    setup_with_storage(options, Arc::new(MemoryStorage::new()))
}

/// Build a harness over existing storage, to simulate a process restart.
pub fn setup_with_storage(options: HarnessOptions, storage: Arc<MemoryStorage>) -> Harness {
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let billing = Arc::new(MockBilling::new(updates_tx));
    let ledger = Arc::new(MockLedger::new());

    let fallback = Arc::new(FallbackCache::new(
        options.fallback_snapshot,
        storage.clone() as Arc<dyn StorageAdapter>,
    ));
    *ledger.fallback.lock().unwrap() = Some(fallback.clone());

    let identity = DeviceIdentity {
        user_id: "test-user".to_string(),
        device_id: "test-device".to_string(),
    };

    let sdk = Checkstand::with_ledger(
        billing.clone(),
        ledger.clone(),
        fallback,
        storage.clone(),
        identity,
        updates_rx,
        options.consumable_product_ids,
        options.observer_mode,
        DeviceInfo::collect(Some("1.0.0-test".to_string()), true),
    );

    Harness {
        sdk,
        billing,
        ledger,
        storage,
    }
}

// ==================== Fixtures ====================

pub fn product(id: &str, kind: ProductKind) -> ProductDefinition {
    ProductDefinition {
        product_id: id.to_string(),
        kind,
        title: Some(format!("Product {}", id)),
        price: Some("$4.99".to_string()),
        price_amount_micros: Some(4_990_000),
        price_currency_code: Some("USD".to_string()),
        billing_period: match kind {
            ProductKind::Subscription => Some("P1M".to_string()),
            ProductKind::OneTime => None,
        },
        offers: Vec::new(),
    }
}

pub fn metadata(id: &str, kind: ProductKind) -> ProductMetadata {
    ProductMetadata {
        product_id: id.to_string(),
        kind,
    }
}

pub fn history(token: &str, product_id: &str, kind: ProductKind) -> HistoryRecord {
    HistoryRecord {
        token: token.to_string(),
        product_id: product_id.to_string(),
        kind,
        purchased_at: 1_000,
    }
}

pub fn purchased_update(token: &str, product_id: &str) -> PurchaseUpdate {
    PurchaseUpdate {
        code: BillingResponseCode::Ok,
        purchases: vec![PlatformPurchase {
            token: token.to_string(),
            product_ids: vec![product_id.to_string()],
            state: PurchaseState::Purchased,
            order_id: Some(format!("order-{}", token)),
            is_acknowledged: false,
            purchased_at: 2_000,
        }],
    }
}

pub fn canceled_update() -> PurchaseUpdate {
    PurchaseUpdate {
        code: BillingResponseCode::UserCanceled,
        purchases: Vec::new(),
    }
}

pub fn fallback_bundle() -> String {
    serde_json::to_string(&vec![
        metadata("premium", ProductKind::Subscription),
        metadata("coins", ProductKind::OneTime),
    ])
    .unwrap()
}

/// Register both kinds of a product with the ledger metadata and the platform
/// catalog so `load_catalog` can resolve it.
pub fn seed_product(harness: &Harness, id: &str, kind: ProductKind) {
    harness.ledger.product_metadata.lock().unwrap().push(metadata(id, kind));
    harness.billing.add_product(product(id, kind));
}
