//! Fallback mode: bundled catalog and staged entitlements while the ledger
//! authority is unreachable

use crate::api::{ProductMetadata, PurchaseItem};
use crate::config::TEMPORARY_ENTITLEMENT_WINDOW;
use crate::device::DeviceIdentity;
use crate::storage::{self, keys, StorageAdapter};
use crate::types::{
    EntitlementSnapshot, NonRenewingPurchase, ProductKind, PurchaseRecord, Subscription,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Local snapshot of catalog + entitlements used when the ledger authority is
/// unreachable.
///
/// Once activated, fallback stays active until a real registration round trip
/// succeeds. Purchases completed meanwhile are staged as temporary
/// entitlements and resubmitted for genuine validation on deactivation.
pub struct FallbackCache {
    bundle: Option<String>,
    storage: Arc<dyn StorageAdapter>,
    active: AtomicBool,
    products: Mutex<Vec<ProductMetadata>>,
    staged: Mutex<Vec<PurchaseItem>>,
}

impl FallbackCache {
    pub fn new(bundle: Option<String>, storage: Arc<dyn StorageAdapter>) -> Self {
        // Staged purchases survive a restart; an earlier run may have died
        // while fallback was active.
        let staged: Vec<PurchaseItem> =
            storage::get_json(storage.as_ref(), keys::STAGED_PURCHASES).unwrap_or_default();
        Self {
            bundle,
            storage,
            active: AtomicBool::new(false),
            products: Mutex::new(Vec::new()),
            staged: Mutex::new(staged),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Activate fallback mode, parsing the bundled catalog snapshot.
    ///
    /// Returns `false` when already active (or no bundle was provided), so the
    /// caller knows whether this call did the switch.
    pub fn activate(&self) -> bool {
        let Some(bundle) = self.bundle.as_deref() else {
            tracing::warn!("ledger unreachable and no fallback snapshot bundled");
            return false;
        };
        if self.active.swap(true, Ordering::AcqRel) {
            return false;
        }

        let products: Vec<ProductMetadata> = serde_json::from_str(bundle).unwrap_or_default();
        tracing::warn!(
            products = products.len(),
            "entering fallback mode with bundled catalog"
        );
        *self.products.lock().unwrap_or_else(PoisonError::into_inner) = products;
        true
    }

    /// Product ids from the bundled snapshot, for platform detail lookup.
    pub fn product_ids(&self) -> Vec<ProductMetadata> {
        self.products
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stage a purchase completed during fallback for later real validation.
    pub fn stage(&self, item: PurchaseItem) {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        if staged.iter().any(|p| p.purchase_token == item.purchase_token) {
            return;
        }
        staged.push(item);
        storage::set_json(self.storage.as_ref(), keys::STAGED_PURCHASES, &*staged);
    }

    pub fn staged_count(&self) -> usize {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Synthesize a temporary entitlement for a purchase completed while the
    /// ledger is unreachable. Its activity window is bounded; real validation
    /// supersedes it.
    pub fn synthesize_snapshot(
        &self,
        identity: &DeviceIdentity,
        purchase: &PurchaseRecord,
        now_ms: i64,
    ) -> EntitlementSnapshot {
        let mut snapshot = EntitlementSnapshot {
            user_id: identity.user_id.clone(),
            device_id: identity.device_id.clone(),
            subscriptions: Vec::new(),
            non_renewing: Vec::new(),
            fetched_at: now_ms,
        };
        match purchase.kind {
            ProductKind::Subscription => snapshot.subscriptions.push(Subscription {
                product_id: purchase.product_id.clone(),
                expires_at: Some(now_ms + TEMPORARY_ENTITLEMENT_WINDOW.as_millis() as i64),
                is_active: true,
                is_temporary: true,
            }),
            ProductKind::OneTime => snapshot.non_renewing.push(NonRenewingPurchase {
                product_id: purchase.product_id.clone(),
                purchased_at: purchase.purchased_at,
                is_temporary: true,
            }),
        }
        snapshot
    }

    /// Leave fallback mode after a successful registration round trip,
    /// draining the staged purchases so the caller can resubmit them.
    ///
    /// Staged purchases are drained whether or not fallback mode was active:
    /// a purchase can be staged without activation when no snapshot bundle is
    /// configured, and it must still be resubmitted eventually.
    pub fn deactivate(&self) -> Vec<PurchaseItem> {
        if self.active.swap(false, Ordering::AcqRel) {
            tracing::info!("leaving fallback mode");
            self.products
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        if staged.is_empty() {
            return Vec::new();
        }
        let drained = std::mem::take(&mut *staged);
        self.storage.remove(keys::STAGED_PURCHASES);
        drained
    }
}

impl std::fmt::Debug for FallbackCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackCache")
            .field("active", &self.is_active())
            .field("staged", &self.staged_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::AckState;

    fn bundle() -> String {
        r#"[
            {"product_id": "premium", "kind": "subscription"},
            {"product_id": "coins", "kind": "one_time"}
        ]"#
        .to_string()
    }

    fn item(token: &str) -> PurchaseItem {
        PurchaseItem {
            order_id: None,
            product_id: "premium".into(),
            purchase_token: token.into(),
            kind: ProductKind::Subscription,
            price_currency_code: None,
            price_amount_micros: None,
            subscription_period: None,
            paywall_id: None,
            placement_id: None,
            purchase_time: 1,
        }
    }

    #[test]
    fn test_activate_once() {
        let cache = FallbackCache::new(Some(bundle()), Arc::new(MemoryStorage::new()));
        assert!(!cache.is_active());
        assert!(cache.activate());
        assert!(cache.is_active());
        // Second activation is a no-op.
        assert!(!cache.activate());
        assert_eq!(cache.product_ids().len(), 2);
    }

    #[test]
    fn test_activate_without_bundle() {
        let cache = FallbackCache::new(None, Arc::new(MemoryStorage::new()));
        assert!(!cache.activate());
        assert!(!cache.is_active());
    }

    #[test]
    fn test_stage_dedup_and_drain() {
        let cache = FallbackCache::new(Some(bundle()), Arc::new(MemoryStorage::new()));
        cache.activate();
        cache.stage(item("t1"));
        cache.stage(item("t1"));
        cache.stage(item("t2"));
        assert_eq!(cache.staged_count(), 2);

        let drained = cache.deactivate();
        assert_eq!(drained.len(), 2);
        assert!(!cache.is_active());
        // Draining twice yields nothing.
        assert!(cache.deactivate().is_empty());
    }

    #[test]
    fn test_staged_without_activation_still_drains() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = FallbackCache::new(None, storage.clone());
        assert!(!cache.activate());
        cache.stage(item("t1"));
        assert_eq!(cache.staged_count(), 1);

        let drained = cache.deactivate();
        assert_eq!(drained.len(), 1);
        assert_eq!(cache.staged_count(), 0);
        assert!(storage.get(keys::STAGED_PURCHASES).is_none());
    }

    #[test]
    fn test_staged_survive_restart() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let cache = FallbackCache::new(Some(bundle()), storage.clone());
            cache.activate();
            cache.stage(item("t1"));
        }
        let revived = FallbackCache::new(Some(bundle()), storage);
        assert_eq!(revived.staged_count(), 1);
    }

    #[test]
    fn test_temporary_entitlement_window() {
        let cache = FallbackCache::new(Some(bundle()), Arc::new(MemoryStorage::new()));
        cache.activate();
        let identity = DeviceIdentity {
            user_id: "u1".into(),
            device_id: "d1".into(),
        };
        let purchase = PurchaseRecord {
            token: "t1".into(),
            product_id: "premium".into(),
            kind: ProductKind::Subscription,
            ack_state: AckState::Acknowledged,
            order_id: None,
            purchased_at: 1_000,
        };
        let snapshot = cache.synthesize_snapshot(&identity, &purchase, 1_000);
        let sub = &snapshot.subscriptions[0];
        assert!(sub.is_temporary);
        assert_eq!(
            sub.expires_at,
            Some(1_000 + TEMPORARY_ENTITLEMENT_WINDOW.as_millis() as i64)
        );
        assert!(sub.is_live(1_001));
    }
}
