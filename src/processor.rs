//! Drives one purchase through acknowledge/consume and ledger validation

use crate::api::{PurchaseItem, PurchaseSubmission};
use crate::billing::{
    PlatformPurchase, PurchaseParams, PurchaseState, PurchaseUpdate, BillingResponseCode,
};
use crate::device::DeviceIdentity;
use crate::error::{CheckstandError, Result};
use crate::fallback::FallbackCache;
use crate::storage::{self, keys, StorageAdapter};
use crate::store::StoreConnector;
use crate::transport::LedgerApi;
use crate::types::{
    AckState, EntitlementSnapshot, ProductDefinition, ProductKind, PurchaseRecord, PurchaseResult,
    ReplacementMode,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, oneshot};

/// What to purchase, resolved against the loaded catalog
#[derive(Debug, Clone)]
pub struct PurchaseIntent {
    pub product: ProductDefinition,
    pub offer_token: Option<String>,
    pub old_token: Option<String>,
    pub replacement_mode: Option<ReplacementMode>,
    pub paywall_id: Option<String>,
    pub placement_id: Option<String>,
}

/// Processes platform purchase updates: routes each purchased token through
/// acknowledge or consume, then submits it to the ledger authority.
///
/// The completion callback slot is single-use per flow: installed immediately
/// before the purchase launches and cleared the instant it fires, so a stale
/// callback can never leak into an unrelated concurrent flow.
pub struct PurchaseProcessor {
    connector: Arc<StoreConnector>,
    ledger: Arc<dyn LedgerApi>,
    fallback: Arc<FallbackCache>,
    storage: Arc<dyn StorageAdapter>,
    identity: DeviceIdentity,
    consumable_ids: HashSet<String>,
    observer_mode: bool,
    updates: AsyncMutex<mpsc::UnboundedReceiver<PurchaseUpdate>>,
    slot: Mutex<Option<oneshot::Sender<Result<PurchaseResult>>>>,
}

impl PurchaseProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Arc<StoreConnector>,
        ledger: Arc<dyn LedgerApi>,
        fallback: Arc<FallbackCache>,
        storage: Arc<dyn StorageAdapter>,
        identity: DeviceIdentity,
        consumable_ids: Vec<String>,
        observer_mode: bool,
        updates: mpsc::UnboundedReceiver<PurchaseUpdate>,
    ) -> Self {
        Self {
            connector,
            ledger,
            fallback,
            storage,
            identity,
            consumable_ids: consumable_ids.into_iter().collect(),
            observer_mode,
            updates: AsyncMutex::new(updates),
            slot: Mutex::new(None),
        }
    }

    /// Run one purchase flow to completion: launch the platform UI, then
    /// process updates from the purchase channel until the completion
    /// callback has fired. The callback always fires - success, typed error,
    /// or cancellation.
    pub async fn purchase(&self, intent: PurchaseIntent) -> Result<PurchaseResult> {
        let rx = self.install_slot()?;

        let params = PurchaseParams {
            product_id: intent.product.product_id.clone(),
            kind: intent.product.kind,
            offer_token: intent.offer_token.clone(),
            old_token: intent.old_token.clone(),
            replacement_mode: intent.replacement_mode,
        };
        if let Err(err) = self.connector.purchase(&params).await {
            self.fire(Err(err));
        }

        // Updates are consumed by one flow at a time; the receiver lock also
        // serializes overlapping purchase() callers behind the slot check.
        while self.slot_occupied() {
            let update = {
                let mut updates = self.updates.lock().await;
                updates.recv().await
            };
            match update {
                Some(update) => self.handle_update(&intent, update).await,
                None => {
                    self.fire(Err(CheckstandError::Connection(
                        "purchase update channel closed".into(),
                    )));
                }
            }
        }

        rx.await.unwrap_or(Err(CheckstandError::Connection(
            "purchase flow ended without a result".into(),
        )))
    }

    /// Handle one event from the purchase-update channel.
    async fn handle_update(&self, intent: &PurchaseIntent, update: PurchaseUpdate) {
        match update.code {
            BillingResponseCode::Ok => {
                for purchase in update.purchases {
                    if purchase.state != PurchaseState::Purchased {
                        tracing::debug!(token = %purchase.token, "ignoring non-purchased update");
                        continue;
                    }
                    let result = self.complete_purchase(intent, &purchase).await;
                    self.fire(result);
                }
            }
            BillingResponseCode::UserCanceled => {
                self.fire(Err(CheckstandError::UserCanceled));
            }
            code => {
                self.fire(Err(CheckstandError::billing(code, "purchase flow failed")));
            }
        }
    }

    /// Acknowledge or consume a purchased token, then validate it with the
    /// ledger authority. Completion failures surface exactly once and are not
    /// re-attempted here; the platform redelivers unacknowledged purchases.
    async fn complete_purchase(
        &self,
        intent: &PurchaseIntent,
        purchase: &PlatformPurchase,
    ) -> Result<PurchaseResult> {
        let mut record = PurchaseRecord {
            token: purchase.token.clone(),
            product_id: intent.product.product_id.clone(),
            kind: intent.product.kind,
            ack_state: AckState::Unacknowledged,
            order_id: purchase.order_id.clone(),
            purchased_at: purchase.purchased_at,
        };

        record.ack_state = self.fulfill_completion(&record, purchase).await?;

        let item = purchase_item(intent, &record);
        let snapshot = self.validate_with_ledger(&record, item).await?;
        Ok(PurchaseResult {
            purchase: record,
            snapshot,
        })
    }

    /// The billing contract: subscriptions and non-consumable one-time
    /// products are acknowledged, configured consumables are consumed.
    async fn fulfill_completion(
        &self,
        record: &PurchaseRecord,
        purchase: &PlatformPurchase,
    ) -> Result<AckState> {
        match record.kind {
            ProductKind::Subscription => {
                if purchase.is_acknowledged {
                    return Ok(AckState::Acknowledged);
                }
                self.connector
                    .acknowledge(&record.token, record.purchased_at)
                    .await?;
                Ok(AckState::Acknowledged)
            }
            ProductKind::OneTime => {
                if self.consumable_ids.contains(&record.product_id) {
                    self.connector
                        .consume(&record.token, record.purchased_at)
                        .await?;
                    Ok(AckState::Consumed)
                } else {
                    if purchase.is_acknowledged {
                        return Ok(AckState::Acknowledged);
                    }
                    self.connector
                        .acknowledge(&record.token, record.purchased_at)
                        .await?;
                    Ok(AckState::Acknowledged)
                }
            }
        }
    }

    /// Submit one purchase for ledger validation. While fallback is active
    /// (or the ledger is found unreachable here), the purchase is staged and
    /// a bounded temporary entitlement is returned instead of failing.
    async fn validate_with_ledger(
        &self,
        record: &PurchaseRecord,
        item: PurchaseItem,
    ) -> Result<EntitlementSnapshot> {
        let now_ms = chrono::Utc::now().timestamp_millis();

        if self.fallback.is_active() {
            self.fallback.stage(item);
            return Ok(self.fallback.synthesize_snapshot(&self.identity, record, now_ms));
        }

        let submission = PurchaseSubmission {
            user_id: self.identity.user_id.clone(),
            device_id: self.identity.device_id.clone(),
            purchases: vec![item.clone()],
            observer_mode: self.observer_mode,
        };
        match self.ledger.submit_purchases(&submission).await {
            Ok(customer) => {
                let snapshot = customer.into_snapshot(&self.identity.device_id, now_ms);
                storage::set_json(self.storage.as_ref(), keys::ENTITLEMENTS, &snapshot);
                self.remember_submitted(&record.token);
                Ok(snapshot)
            }
            Err(err) if err.is_retriable() => {
                // The intent survives ledger unreachability as a temporary
                // entitlement, revalidated when connectivity returns.
                tracing::warn!(error = %err, "ledger unreachable, staging purchase for later validation");
                self.fallback.activate();
                self.fallback.stage(item);
                Ok(self.fallback.synthesize_snapshot(&self.identity, record, now_ms))
            }
            Err(err) => Err(err),
        }
    }

    fn remember_submitted(&self, token: &str) {
        let mut submitted: HashSet<String> =
            storage::get_json(self.storage.as_ref(), keys::SUBMITTED_TOKENS).unwrap_or_default();
        if submitted.insert(token.to_string()) {
            storage::set_json(self.storage.as_ref(), keys::SUBMITTED_TOKENS, &submitted);
        }
    }

    /// Install the single-use completion slot. Fails when another flow is
    /// already active so two purchases can't share a callback.
    fn install_slot(&self) -> Result<oneshot::Receiver<Result<PurchaseResult>>> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(CheckstandError::validation(
                "a purchase flow is already in progress",
            ));
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        Ok(rx)
    }

    fn slot_occupied(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Fire the completion callback, clearing the slot in the same step.
    /// Later calls for the same flow find the slot empty and do nothing.
    fn fire(&self, result: Result<PurchaseResult>) {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!("completion slot already fired, dropping duplicate result"),
        }
    }
}

/// Build the ledger submission item for a purchase, carrying currency, price
/// and period metadata from the offer when one was selected.
pub fn purchase_item(intent: &PurchaseIntent, record: &PurchaseRecord) -> PurchaseItem {
    let phase = intent
        .offer_token
        .as_deref()
        .and_then(|token| intent.product.offer(token))
        .and_then(|offer| offer.pricing_phases.last());

    PurchaseItem {
        order_id: record.order_id.clone(),
        product_id: record.product_id.clone(),
        purchase_token: record.token.clone(),
        kind: record.kind,
        price_currency_code: phase
            .map(|p| p.price_currency_code.clone())
            .or_else(|| intent.product.price_currency_code.clone()),
        price_amount_micros: phase
            .map(|p| p.price_amount_micros)
            .or(intent.product.price_amount_micros),
        subscription_period: phase
            .map(|p| p.billing_period.clone())
            .or_else(|| intent.product.billing_period.clone()),
        paywall_id: intent.paywall_id.clone(),
        placement_id: intent.placement_id.clone(),
        purchase_time: record.purchased_at,
    }
}

impl std::fmt::Debug for PurchaseProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchaseProcessor")
            .field("identity", &self.identity)
            .field("observer_mode", &self.observer_mode)
            .field("flow_active", &self.slot_occupied())
            .finish()
    }
}
