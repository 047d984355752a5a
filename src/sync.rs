//! Restore/sync: reconciling platform purchase history with the ledger

use crate::api::{PurchaseItem, PurchaseSubmission};
use crate::billing::HistoryRecord;
use crate::catalog::CatalogLoader;
use crate::device::DeviceIdentity;
use crate::error::Result;
use crate::fallback::FallbackCache;
use crate::storage::{self, keys, StorageAdapter};
use crate::store::StoreConnector;
use crate::transport::LedgerApi;
use crate::types::{EntitlementSnapshot, ProductDefinition, ProductKind};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Restores purchase history from the platform, deduplicates against
/// previously-submitted tokens, and submits the delta to the ledger authority.
///
/// Restore/sync cycles are mutually exclusive: concurrent calls queue behind
/// the session mutex.
pub struct SyncCoordinator {
    connector: Arc<StoreConnector>,
    ledger: Arc<dyn LedgerApi>,
    fallback: Arc<FallbackCache>,
    storage: Arc<dyn StorageAdapter>,
    catalog: Arc<CatalogLoader>,
    identity: DeviceIdentity,
    session: AsyncMutex<()>,
}

impl SyncCoordinator {
    pub fn new(
        connector: Arc<StoreConnector>,
        ledger: Arc<dyn LedgerApi>,
        fallback: Arc<FallbackCache>,
        storage: Arc<dyn StorageAdapter>,
        catalog: Arc<CatalogLoader>,
        identity: DeviceIdentity,
    ) -> Self {
        Self {
            connector,
            ledger,
            fallback,
            storage,
            catalog,
            identity,
            session: AsyncMutex::new(()),
        }
    }

    // The submitted-token set lives in storage, not in memory: the purchase
    // flow extends it too, and both sides must see each other's writes.
    fn submitted_tokens(&self) -> HashSet<String> {
        storage::get_json(self.storage.as_ref(), keys::SUBMITTED_TOKENS).unwrap_or_default()
    }

    /// Run one restore/sync session.
    ///
    /// Queries the full purchase history for both product categories
    /// concurrently, resolves product definitions for each record, and
    /// submits anything not yet confirmed by the ledger. With `observer_mode`
    /// and no new history, the network round trip is skipped entirely and the
    /// cached snapshot is returned.
    pub async fn restore(&self, observer_mode: bool) -> Result<EntitlementSnapshot> {
        let _session = self.session.lock().await;

        let (subs, one_time) = tokio::join!(
            self.connector.query_purchase_history(ProductKind::Subscription),
            self.connector.query_purchase_history(ProductKind::OneTime),
        );
        let mut history = subs?;
        history.extend(one_time?);

        let products = self.resolve_products(&history).await?;

        let submitted = self.submitted_tokens();
        let delta: Vec<&HistoryRecord> =
            history.iter().filter(|r| !submitted.contains(&r.token)).collect();

        if delta.is_empty() && observer_mode {
            tracing::debug!("no unsubmitted purchases, already synchronized");
            return Ok(self.cached_snapshot());
        }

        let items: Vec<PurchaseItem> = history
            .iter()
            .map(|record| history_item(record, products.get(record.product_id.as_str())))
            .collect();
        let delta_tokens: Vec<String> = delta.iter().map(|r| r.token.clone()).collect();

        if self.fallback.is_active() {
            // No real validation is possible; stage the delta and serve the
            // best snapshot we have.
            for item in items
                .iter()
                .filter(|i| delta_tokens.contains(&i.purchase_token))
            {
                self.fallback.stage(item.clone());
            }
            return Ok(self.cached_snapshot());
        }

        let submission = PurchaseSubmission {
            user_id: self.identity.user_id.clone(),
            device_id: self.identity.device_id.clone(),
            purchases: items,
            observer_mode,
        };
        let customer = self.ledger.submit_purchases(&submission).await?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let snapshot = customer.into_snapshot(&self.identity.device_id, now_ms);
        storage::set_json(self.storage.as_ref(), keys::ENTITLEMENTS, &snapshot);

        // Only extend the dedup set once the round trip succeeded; a failed
        // submission leaves its tokens eligible for the next session. Re-read
        // before writing so tokens recorded by a concurrent purchase flow are
        // kept, not clobbered.
        let mut submitted = self.submitted_tokens();
        submitted.extend(delta_tokens);
        storage::set_json(self.storage.as_ref(), keys::SUBMITTED_TOKENS, &submitted);

        Ok(snapshot)
    }

    /// Resolve a product definition for every historical record. Records with
    /// no match in the loaded catalog are fetched in one batched lookup per
    /// product category.
    async fn resolve_products(
        &self,
        history: &[HistoryRecord],
    ) -> Result<HashMap<String, ProductDefinition>> {
        let mut products: HashMap<String, ProductDefinition> = self
            .catalog
            .visible_products()
            .into_iter()
            .map(|p| (p.product_id.clone(), p))
            .collect();

        let mut missing_subs: Vec<String> = Vec::new();
        let mut missing_one_time: Vec<String> = Vec::new();
        for record in history {
            if products.contains_key(&record.product_id) {
                continue;
            }
            let bucket = match record.kind {
                ProductKind::Subscription => &mut missing_subs,
                ProductKind::OneTime => &mut missing_one_time,
            };
            if !bucket.contains(&record.product_id) {
                bucket.push(record.product_id.clone());
            }
        }

        if !missing_subs.is_empty() {
            for product in self
                .connector
                .query_product_details(&missing_subs, ProductKind::Subscription)
                .await?
            {
                products.insert(product.product_id.clone(), product);
            }
        }
        if !missing_one_time.is_empty() {
            for product in self
                .connector
                .query_product_details(&missing_one_time, ProductKind::OneTime)
                .await?
            {
                products.insert(product.product_id.clone(), product);
            }
        }

        Ok(products)
    }

    fn cached_snapshot(&self) -> EntitlementSnapshot {
        storage::get_json(self.storage.as_ref(), keys::ENTITLEMENTS).unwrap_or_default()
    }
}

/// Build a submission item from a history record, enriched with the product
/// definition when one resolved.
fn history_item(record: &HistoryRecord, product: Option<&ProductDefinition>) -> PurchaseItem {
    PurchaseItem {
        order_id: None,
        product_id: record.product_id.clone(),
        purchase_token: record.token.clone(),
        kind: record.kind,
        price_currency_code: product.and_then(|p| p.price_currency_code.clone()),
        price_amount_micros: product.and_then(|p| p.price_amount_micros),
        subscription_period: product.and_then(|p| p.billing_period.clone()),
        paywall_id: None,
        placement_id: None,
        purchase_time: record.purchased_at,
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("identity", &self.identity)
            .field("submitted_tokens", &self.submitted_tokens().len())
            .finish()
    }
}
