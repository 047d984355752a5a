//! Domain types for the Checkstand SDK

use serde::{Deserialize, Serialize};

/// Product category on the platform billing service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    /// Auto-renewing subscription
    Subscription,
    /// One-time purchase (consumable or entitlement)
    OneTime,
}

impl std::fmt::Display for ProductKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscription => write!(f, "subs"),
            Self::OneTime => write!(f, "inapp"),
        }
    }
}

/// Acknowledgment lifecycle of a purchase token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    Unacknowledged,
    Acknowledged,
    Consumed,
}

/// A purchase as recorded locally, pending or past ledger confirmation.
///
/// Retained until the ledger authority confirms it, or indefinitely if it
/// never does, so a later restore can resubmit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    /// Opaque token issued by the platform billing service
    pub token: String,
    pub product_id: String,
    pub kind: ProductKind,
    pub ack_state: AckState,
    /// Platform order identifier, when the platform reports one
    pub order_id: Option<String>,
    /// Purchase timestamp, epoch milliseconds
    pub purchased_at: i64,
}

/// One phase of an offer's pricing schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingPhase {
    pub price_amount_micros: i64,
    pub price_currency_code: String,
    /// ISO-8601 period, e.g. "P1M"
    pub billing_period: String,
    /// Number of cycles this phase repeats; 0 means infinite
    pub billing_cycle_count: u32,
}

/// A purchase offer attached to a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub offer_token: String,
    pub base_plan_id: String,
    pub tags: Vec<String>,
    pub pricing_phases: Vec<PricingPhase>,
}

/// Product definition loaded from the platform billing service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDefinition {
    pub product_id: String,
    pub kind: ProductKind,
    pub title: Option<String>,
    /// Formatted one-time price, when the product has one
    pub price: Option<String>,
    pub price_amount_micros: Option<i64>,
    pub price_currency_code: Option<String>,
    /// ISO-8601 billing period for subscriptions
    pub billing_period: Option<String>,
    pub offers: Vec<Offer>,
}

impl ProductDefinition {
    /// Find an offer by its token.
    pub fn offer(&self, offer_token: &str) -> Option<&Offer> {
        self.offers.iter().find(|o| o.offer_token == offer_token)
    }
}

/// How an existing subscription is replaced when upgrading or downgrading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementMode {
    WithTimeProration,
    ChargeProratedPrice,
    WithoutProration,
    ChargeFullPrice,
    Deferred,
}

/// A subscription as confirmed by the ledger authority (or synthesized
/// temporarily during fallback).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub product_id: String,
    /// Expiration, epoch milliseconds; `None` means the ledger reported no end
    pub expires_at: Option<i64>,
    pub is_active: bool,
    /// Set when synthesized locally during fallback mode, pending real
    /// validation by the ledger authority
    pub is_temporary: bool,
}

impl Subscription {
    /// Active now, honoring the bounded window of temporary entitlements.
    pub fn is_live(&self, now_ms: i64) -> bool {
        if !self.is_active {
            return false;
        }
        match self.expires_at {
            Some(exp) => exp > now_ms,
            None => true,
        }
    }
}

/// A non-renewing purchase as confirmed by the ledger authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonRenewingPurchase {
    pub product_id: String,
    pub purchased_at: i64,
    pub is_temporary: bool,
}

/// The set of entitlements attributed to a user/device pair.
///
/// Replaced wholesale on each successful ledger sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitlementSnapshot {
    pub user_id: String,
    pub device_id: String,
    pub subscriptions: Vec<Subscription>,
    pub non_renewing: Vec<NonRenewingPurchase>,
    /// When this snapshot was produced, epoch milliseconds
    pub fetched_at: i64,
}

impl EntitlementSnapshot {
    /// Whether any subscription is currently active.
    pub fn has_active_subscription(&self, now_ms: i64) -> bool {
        self.subscriptions.iter().any(|s| s.is_live(now_ms))
    }

    /// Look up a subscription by product id.
    pub fn subscription(&self, product_id: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.product_id == product_id)
    }

    /// Whether any entitlement in this snapshot is temporary.
    pub fn has_temporary(&self) -> bool {
        self.subscriptions.iter().any(|s| s.is_temporary)
            || self.non_renewing.iter().any(|p| p.is_temporary)
    }
}

/// Result delivered through a purchase completion callback
#[derive(Debug, Clone)]
pub struct PurchaseResult {
    pub purchase: PurchaseRecord,
    pub snapshot: EntitlementSnapshot,
}

/// Catalog and entitlement change notifications.
///
/// All methods have empty defaults so listeners implement only what they need.
pub trait CheckstandListener: Send + Sync {
    fn catalog_updated(&self, _products: &[ProductDefinition]) {}
    fn entitlements_updated(&self, _snapshot: &EntitlementSnapshot) {}
}
