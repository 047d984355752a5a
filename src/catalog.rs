//! Product catalog loading, mediated by a bounded-retry state machine

use crate::billing::BillingResponseCode;
use crate::config::{CATALOG_LIFETIME_RETRY_CEILING, CATALOG_RETRY_CEILING};
use crate::error::CheckstandError;
use crate::store::StoreConnector;
use crate::types::{ProductDefinition, ProductKind};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Merge a freshly loaded batch into the known product set, keyed by product
/// id: a new entry replaces the old entry with the same id, all other entries
/// are retained. The catalog never shrinks on a partial load.
pub fn merge_products(
    mut existing: Vec<ProductDefinition>,
    batch: Vec<ProductDefinition>,
) -> Vec<ProductDefinition> {
    for product in batch {
        match existing.iter_mut().find(|p| p.product_id == product.product_id) {
            Some(slot) => *slot = product,
            None => existing.push(product),
        }
    }
    existing
}

/// Catalog loading state. The four variants are mutually exclusive.
#[derive(Debug, Clone, PartialEq)]
pub enum ProductLoadingState {
    /// No load attempted yet
    Idle,
    /// A load attempt is in flight; the last-known products stay visible
    Loading {
        current_retry: u32,
        total_retry: u32,
        previous: Vec<ProductDefinition>,
    },
    /// Terminal: catalog current as of the last load
    Success {
        products: Vec<ProductDefinition>,
        load_time_ms: u64,
        responded: bool,
    },
    /// Terminal: catalog degraded to the last-known snapshot
    Failed {
        code: BillingResponseCode,
        cached: Vec<ProductDefinition>,
        current_retry: u32,
        total_retry: u32,
        responded: bool,
    },
}

impl ProductLoadingState {
    /// Products visible to callers in this state: the best snapshot available,
    /// never emptied by a failure.
    pub fn visible_products(&self) -> &[ProductDefinition] {
        match self {
            Self::Idle => &[],
            Self::Loading { previous, .. } => previous,
            Self::Success { products, .. } => products,
            Self::Failed { cached, .. } => cached,
        }
    }

    /// Whether a failed load is worth retrying: the code must be transient,
    /// nothing may be cached, and both retry counters must be under their
    /// ceilings.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Failed {
                code,
                cached,
                current_retry,
                total_retry,
                ..
            } => {
                code.is_transient()
                    && cached.is_empty()
                    && *current_retry < CATALOG_RETRY_CEILING
                    && *total_retry < CATALOG_LIFETIME_RETRY_CEILING
            }
            _ => false,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Failed { .. })
    }
}

/// Loads product definitions from the platform billing service, merging each
/// successful batch into the carried-forward set.
pub struct CatalogLoader {
    connector: Arc<StoreConnector>,
    state: Mutex<ProductLoadingState>,
    // Monotonic across the process lifetime; seeds total_retry when a load
    // starts from Idle or Success.
    lifetime_retries: AtomicU32,
}

impl CatalogLoader {
    pub fn new(connector: Arc<StoreConnector>) -> Self {
        Self {
            connector,
            state: Mutex::new(ProductLoadingState::Idle),
            lifetime_retries: AtomicU32::new(0),
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> ProductLoadingState {
        self.lock().clone()
    }

    /// Products visible right now, whatever the state.
    pub fn visible_products(&self) -> Vec<ProductDefinition> {
        self.lock().visible_products().to_vec()
    }

    /// Drop everything and return to `Idle`. The only way the visible catalog
    /// shrinks.
    pub fn reset(&self) {
        *self.lock() = ProductLoadingState::Idle;
    }

    /// Load product definitions for the given ids, querying both product
    /// categories concurrently and merging the joined result into the
    /// carried-forward set.
    ///
    /// Failures are captured in the returned state rather than thrown; retry
    /// decisions belong to the caller via [`ProductLoadingState::is_retriable`].
    pub async fn load(&self, ids: &[String]) -> ProductLoadingState {
        self.begin_loading();
        let started = Instant::now();

        let (subs, one_time) = tokio::join!(
            self.connector
                .query_product_details(ids, ProductKind::Subscription),
            self.connector.query_product_details(ids, ProductKind::OneTime),
        );

        match (subs, one_time) {
            (Ok(mut batch), Ok(more)) => {
                batch.extend(more);
                self.complete(batch, started.elapsed().as_millis() as u64)
            }
            (Err(err), _) | (_, Err(err)) => {
                let code = match &err {
                    CheckstandError::Billing { code, .. } => *code,
                    _ => BillingResponseCode::ServiceUnavailable,
                };
                self.fail(code)
            }
        }
    }

    /// Keep loading until success, a non-retriable failure, or the retry
    /// budget runs out.
    pub async fn load_with_retry(&self, ids: &[String]) -> ProductLoadingState {
        let mut state = self.load(ids).await;
        while state.is_retriable() {
            tracing::debug!("catalog load failed with a transient code, retrying");
            state = self.load(ids).await;
        }
        state
    }

    /// Begin a load: `Idle`/`Success` start with a zeroed per-call counter,
    /// `Failed` carries its counters forward incremented.
    fn begin_loading(&self) {
        let mut state = self.lock();
        let (current_retry, total_retry, previous) = match &*state {
            ProductLoadingState::Idle => (0, self.lifetime_retries.load(Ordering::Relaxed), Vec::new()),
            ProductLoadingState::Success { products, .. } => (
                0,
                self.lifetime_retries.load(Ordering::Relaxed),
                products.clone(),
            ),
            ProductLoadingState::Failed {
                cached,
                current_retry,
                ..
            } => {
                let total = self.lifetime_retries.fetch_add(1, Ordering::Relaxed) + 1;
                (current_retry + 1, total, cached.clone())
            }
            ProductLoadingState::Loading {
                current_retry,
                total_retry,
                previous,
            } => (*current_retry, *total_retry, previous.clone()),
        };
        *state = ProductLoadingState::Loading {
            current_retry,
            total_retry,
            previous,
        };
    }

    /// `Loading -> Success`, merging the fetched batch into the carried
    /// forward set.
    fn complete(&self, batch: Vec<ProductDefinition>, load_time_ms: u64) -> ProductLoadingState {
        let mut state = self.lock();
        let previous = match &*state {
            ProductLoadingState::Loading { previous, .. } => previous.clone(),
            other => other.visible_products().to_vec(),
        };
        *state = ProductLoadingState::Success {
            products: merge_products(previous, batch),
            load_time_ms,
            responded: false,
        };
        state.clone()
    }

    /// `Loading -> Failed`, keeping the products that were visible before.
    fn fail(&self, code: BillingResponseCode) -> ProductLoadingState {
        let mut state = self.lock();
        let (cached, current_retry, total_retry) = match &*state {
            ProductLoadingState::Loading {
                previous,
                current_retry,
                total_retry,
            } => (previous.clone(), *current_retry, *total_retry),
            other => (other.visible_products().to_vec(), 0, 0),
        };
        tracing::warn!(?code, cached = cached.len(), "catalog load failed");
        *state = ProductLoadingState::Failed {
            code,
            cached,
            current_retry,
            total_retry,
            responded: false,
        };
        state.clone()
    }

    /// Undo one provisional retry count while a load is in flight. Used when
    /// the caller counted a retry it then decided not to perform. Counters
    /// floor at zero; no-op outside `Loading`.
    pub fn rollback_retry_counters(&self) {
        let mut state = self.lock();
        if let ProductLoadingState::Loading {
            current_retry,
            total_retry,
            ..
        } = &mut *state
        {
            *current_retry = current_retry.saturating_sub(1);
            *total_retry = total_retry.saturating_sub(1);
            let _ = self.lifetime_retries.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |v| Some(v.saturating_sub(1)),
            );
        }
    }

    /// Consume the single delivery slot of the current terminal state.
    ///
    /// Returns `true` exactly once per terminal value: the first observer gets
    /// `true` ("not yet responded"), everyone after gets `false`. No-op
    /// (returning `false`) outside terminal states.
    pub fn mark_responded(&self) -> bool {
        let mut state = self.lock();
        if !state.is_terminal() {
            return false;
        }
        match &mut *state {
            ProductLoadingState::Success { responded, .. }
            | ProductLoadingState::Failed { responded, .. } => {
                let first = !*responded;
                *responded = true;
                first
            }
            _ => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProductLoadingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CatalogLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogLoader")
            .field("state", &self.lock().clone())
            .finish()
    }
}
