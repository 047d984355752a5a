//! # Checkstand SDK
//!
//! Client-side purchase reconciliation engine for a mobile commerce SDK. It
//! reconciles purchases recorded by the platform billing service with the
//! remote ledger authority, fulfills the platform's mandatory
//! acknowledge/consume obligations, and keeps a local product catalog and
//! entitlement snapshot usable when connectivity is degraded.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use checkstand::{Checkstand, CheckstandOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // The platform side of the integration provides the billing binding
//!     // and pushes purchase updates into the channel.
//!     let (updates_tx, updates_rx) = tokio::sync::mpsc::unbounded_channel();
//!     let billing = my_platform_billing(updates_tx);
//!
//!     let sdk = Checkstand::new("your-api-key", billing, updates_rx, CheckstandOptions {
//!         consumable_product_ids: vec!["coin_pack".into()],
//!         ..Default::default()
//!     })?;
//!
//!     sdk.register().await?;
//!     sdk.load_catalog().await?;
//!
//!     let result = sdk.purchase("premium_monthly", None).await?;
//!     println!("purchased: {:?}", result.purchase.product_id);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Degraded operation
//!
//! When the ledger authority is unreachable, the SDK keeps serving the best
//! snapshot it has: the catalog degrades to the last-known (or bundled) set,
//! and purchases completed meanwhile become bounded *temporary* entitlements,
//! resubmitted for real validation once connectivity returns.

pub mod api;
pub mod billing;
pub mod catalog;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod fallback;
pub mod processor;
pub mod storage;
pub mod store;
pub mod sync;
pub mod transport;
pub mod types;

// Main client
pub use client::Checkstand;
pub use config::{CheckstandOptions, DEFAULT_BASE_URL, DEFAULT_FAILOVER_URL};

// Error types
pub use error::{CheckstandError, ErrorCode, Result};

// Platform billing seam
pub use billing::{
    BillingResponseCode, BillingService, HistoryRecord, PlatformPurchase, PurchaseParams,
    PurchaseState, PurchaseUpdate,
};

// Storage
pub use storage::{FileStorage, MemoryStorage, StorageAdapter};

// Domain types
pub use types::{
    AckState, CheckstandListener, EntitlementSnapshot, NonRenewingPurchase, Offer, PricingPhase,
    ProductDefinition, ProductKind, PurchaseRecord, PurchaseResult, ReplacementMode, Subscription,
};

// State machines and components
pub use catalog::{CatalogLoader, ProductLoadingState};
pub use fallback::FallbackCache;
pub use store::{ConnectionState, StoreConnector};
pub use transport::{LedgerApi, RetryingTransport};
