//! Connection lifecycle and completion calls for the platform billing service

use crate::billing::{BillingService, HistoryRecord, PurchaseParams};
use crate::config::{ACK_DEADLINE, CONNECT_RETRY_DELAY};
use crate::error::{CheckstandError, Result};
use crate::types::{ProductDefinition, ProductKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;

/// Connection lifecycle of the billing service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Manages the billing-service connection and exposes the async
/// catalog/purchase/acknowledge/consume primitives.
///
/// The connection is established lazily on first use. `connect` retries with a
/// fixed delay until the platform reports ready; callers bound it by
/// cancelling their own scope.
pub struct StoreConnector {
    service: Arc<dyn BillingService>,
    state: Mutex<ConnectionState>,
    // Guards the connect-or-reuse decision so concurrent callers don't race
    // two service starts.
    connect_lock: AsyncMutex<()>,
    // One async mutex per purchase token; acknowledge/consume for a token is
    // strictly serialized.
    completion_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl StoreConnector {
    pub fn new(service: Arc<dyn BillingService>) -> Self {
        Self {
            service,
            state: Mutex::new(ConnectionState::Disconnected),
            connect_lock: AsyncMutex::new(()),
            completion_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Notify the connector that the platform dropped the service connection.
    /// The next call reconnects lazily.
    pub fn on_service_disconnected(&self) {
        tracing::warn!("billing service disconnected");
        self.set_state(ConnectionState::Disconnected);
    }

    /// Idempotent connect. Returns immediately when already connected,
    /// otherwise retries the service start with a fixed delay until the
    /// platform reports ready.
    pub async fn connect(&self) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        // A concurrent caller may have finished connecting while we waited.
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        loop {
            match self.service.start_connection().await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    tracing::debug!("billing service connected");
                    return Ok(());
                }
                Err(code) => {
                    tracing::debug!(?code, "billing service not ready, retrying");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Query product definitions for the given ids.
    pub async fn query_product_details(
        &self,
        ids: &[String],
        kind: ProductKind,
    ) -> Result<Vec<ProductDefinition>> {
        self.connect().await?;
        self.service
            .query_product_details(ids, kind)
            .await
            .map_err(|code| CheckstandError::billing(code, "product details query failed"))
    }

    /// Launch the platform purchase UI. The outcome is delivered on the
    /// purchase-update channel, not returned here.
    pub async fn purchase(&self, params: &PurchaseParams) -> Result<()> {
        self.connect().await?;
        let code = self.service.launch_purchase(params).await;
        if code == crate::billing::BillingResponseCode::Ok {
            Ok(())
        } else {
            Err(CheckstandError::billing(code, "could not launch purchase flow"))
        }
    }

    /// Acknowledge a purchase token. Serialized per token.
    pub async fn acknowledge(&self, token: &str, purchased_at: i64) -> Result<()> {
        self.connect().await?;
        let lock = self.completion_lock(token);
        let _guard = lock.lock().await;
        self.warn_if_near_deadline(token, purchased_at);
        self.service
            .acknowledge(token)
            .await
            .map_err(|code| CheckstandError::billing(code, "acknowledge failed"))
    }

    /// Consume a purchase token. Serialized per token.
    pub async fn consume(&self, token: &str, purchased_at: i64) -> Result<()> {
        self.connect().await?;
        let lock = self.completion_lock(token);
        let _guard = lock.lock().await;
        self.warn_if_near_deadline(token, purchased_at);
        self.service
            .consume(token)
            .await
            .map_err(|code| CheckstandError::billing(code, "consume failed"))
    }

    /// Full purchase history for one product category.
    pub async fn query_purchase_history(&self, kind: ProductKind) -> Result<Vec<HistoryRecord>> {
        self.connect().await?;
        self.service
            .query_purchase_history(kind)
            .await
            .map_err(|code| CheckstandError::billing(code, "purchase history query failed"))
    }

    fn completion_lock(&self, token: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .completion_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(token.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    // The platform auto-refunds and revokes purchases not acknowledged within
    // ACK_DEADLINE of purchase.
    fn warn_if_near_deadline(&self, token: &str, purchased_at: i64) {
        let age_ms = chrono::Utc::now().timestamp_millis() - purchased_at;
        if age_ms > ACK_DEADLINE.as_millis() as i64 {
            tracing::warn!(
                token,
                age_ms,
                "completing a purchase past the platform refund deadline"
            );
        }
    }
}

impl std::fmt::Debug for StoreConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConnector")
            .field("state", &self.state())
            .finish()
    }
}
