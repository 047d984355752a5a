//! Wire types for the ledger authority HTTP API

use crate::types::{EntitlementSnapshot, NonRenewingPurchase, ProductKind, Subscription};
use serde::{Deserialize, Serialize};

/// Every ledger response wraps its payload in this envelope.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub data: EnvelopeData<T>,
}

#[derive(Debug, Deserialize)]
pub struct EnvelopeData<T> {
    pub results: Option<T>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

/// Debug message carried on non-2xx responses
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    pub message: Option<String>,
    pub details: Option<String>,
}

/// `POST /v1/customers`
#[derive(Debug, Serialize)]
pub struct RegistrationRequest {
    pub user_id: String,
    pub device_id: String,
    pub locale: String,
    pub sdk_version: String,
    pub app_version: String,
    pub device_family: String,
    pub device_model: String,
    pub os_version: String,
    pub time_zone: String,
    pub is_sandbox: bool,
    /// Epoch milliseconds
    pub install_time: i64,
    /// Epoch milliseconds
    pub first_seen: i64,
}

/// Customer payload returned by registration and purchase submission
#[derive(Debug, Deserialize)]
pub struct CustomerResponse {
    pub user_id: String,
    #[serde(default)]
    pub subscriptions: Vec<ApiSubscription>,
    #[serde(default)]
    pub purchases: Vec<ApiNonRenewing>,
}

#[derive(Debug, Deserialize)]
pub struct ApiSubscription {
    pub product_id: String,
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
pub struct ApiNonRenewing {
    pub product_id: String,
    pub purchased_at: i64,
}

impl CustomerResponse {
    /// Build the local snapshot. Everything the ledger returns is real, so
    /// nothing here is temporary.
    pub fn into_snapshot(self, device_id: &str, now_ms: i64) -> EntitlementSnapshot {
        EntitlementSnapshot {
            user_id: self.user_id,
            device_id: device_id.to_string(),
            subscriptions: self
                .subscriptions
                .into_iter()
                .map(|s| Subscription {
                    product_id: s.product_id,
                    expires_at: s.expires_at,
                    is_active: s.is_active,
                    is_temporary: false,
                })
                .collect(),
            non_renewing: self
                .purchases
                .into_iter()
                .map(|p| NonRenewingPurchase {
                    product_id: p.product_id,
                    purchased_at: p.purchased_at,
                    is_temporary: false,
                })
                .collect(),
            fetched_at: now_ms,
        }
    }
}

/// One purchase in a `POST /v1/subscriptions` submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseItem {
    pub order_id: Option<String>,
    pub product_id: String,
    pub purchase_token: String,
    pub kind: ProductKind,
    pub price_currency_code: Option<String>,
    pub price_amount_micros: Option<i64>,
    pub subscription_period: Option<String>,
    pub paywall_id: Option<String>,
    pub placement_id: Option<String>,
    /// Epoch milliseconds
    pub purchase_time: i64,
}

/// `POST /v1/subscriptions`
#[derive(Debug, Serialize)]
pub struct PurchaseSubmission {
    pub user_id: String,
    pub device_id: String,
    pub purchases: Vec<PurchaseItem>,
    pub observer_mode: bool,
}

/// Product metadata from `GET /v2/products`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductMetadata {
    pub product_id: String,
    pub kind: ProductKind,
}
