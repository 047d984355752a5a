//! Platform billing service interface

use crate::types::{ProductDefinition, ProductKind, ReplacementMode};
use async_trait::async_trait;

/// Response codes reported by the platform billing service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingResponseCode {
    Ok,
    UserCanceled,
    ServiceUnavailable,
    ServiceTimeout,
    ServiceDisconnected,
    BillingUnavailable,
    ItemUnavailable,
    ItemAlreadyOwned,
    ItemNotOwned,
    DeveloperError,
    FeatureNotSupported,
    NetworkError,
    Error,
}

impl BillingResponseCode {
    /// Codes worth retrying: the service may come back on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable
                | Self::ServiceTimeout
                | Self::ServiceDisconnected
                | Self::BillingUnavailable
                | Self::Error
        )
    }
}

/// State of a purchase as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseState {
    Purchased,
    Pending,
    Unspecified,
}

/// A purchase as the platform reports it on the update channel
#[derive(Debug, Clone)]
pub struct PlatformPurchase {
    pub token: String,
    pub product_ids: Vec<String>,
    pub state: PurchaseState,
    pub order_id: Option<String>,
    pub is_acknowledged: bool,
    /// Epoch milliseconds
    pub purchased_at: i64,
}

/// One event on the purchase-update channel: the outcome of a launched
/// purchase flow, or a platform redelivery of pending purchases.
#[derive(Debug, Clone)]
pub struct PurchaseUpdate {
    pub code: BillingResponseCode,
    pub purchases: Vec<PlatformPurchase>,
}

/// Parameters for launching the platform purchase UI
#[derive(Debug, Clone)]
pub struct PurchaseParams {
    pub product_id: String,
    pub kind: ProductKind,
    pub offer_token: Option<String>,
    /// Token of the subscription being replaced, for upgrades/downgrades
    pub old_token: Option<String>,
    pub replacement_mode: Option<ReplacementMode>,
}

/// A record from the platform's purchase history
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub token: String,
    pub product_id: String,
    pub kind: ProductKind,
    pub purchased_at: i64,
}

/// The platform billing service.
///
/// Purchase outcomes are not return values: `launch_purchase` only starts the
/// platform UI, and the result arrives later on the purchase-update channel
/// the connector was constructed with.
#[async_trait]
pub trait BillingService: Send + Sync {
    /// Start (or restart) the service connection. Returns `Ok` once the
    /// platform reports ready.
    async fn start_connection(&self) -> Result<(), BillingResponseCode>;

    async fn query_product_details(
        &self,
        ids: &[String],
        kind: ProductKind,
    ) -> Result<Vec<ProductDefinition>, BillingResponseCode>;

    /// Launch the platform purchase UI. A non-`Ok` code means the flow could
    /// not start; otherwise the outcome arrives on the update channel.
    async fn launch_purchase(&self, params: &PurchaseParams) -> BillingResponseCode;

    async fn acknowledge(&self, token: &str) -> Result<(), BillingResponseCode>;

    async fn consume(&self, token: &str) -> Result<(), BillingResponseCode>;

    async fn query_purchase_history(
        &self,
        kind: ProductKind,
    ) -> Result<Vec<HistoryRecord>, BillingResponseCode>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_codes() {
        assert!(BillingResponseCode::ServiceUnavailable.is_transient());
        assert!(BillingResponseCode::ServiceTimeout.is_transient());
        assert!(BillingResponseCode::ServiceDisconnected.is_transient());
        assert!(BillingResponseCode::BillingUnavailable.is_transient());
        assert!(BillingResponseCode::Error.is_transient());

        assert!(!BillingResponseCode::UserCanceled.is_transient());
        assert!(!BillingResponseCode::ItemUnavailable.is_transient());
        assert!(!BillingResponseCode::DeveloperError.is_transient());
        assert!(!BillingResponseCode::FeatureNotSupported.is_transient());
    }
}
