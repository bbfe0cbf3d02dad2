//! Cached, authenticated view of a Polymarket CLOB trading account.
//!
//! Readers get the current account snapshot synchronously and never wait on
//! the network; refreshes run in the background or on demand and are
//! coalesced so the venue sees one batch of calls at a time.
//!
//! ## Modules
//!
//! - `config`: Configuration loading and validation
//! - `credentials`: API credential acquisition, caching and revocation
//! - `positions`: Positions and realized P&L from fills
//! - `cache`: TTL snapshot cache with single-flight refresh
//! - `activity`: Recent activity context
//! - `service`: Component graph and provider context

pub mod activity;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod positions;
pub mod service;

pub use activity::{ActivityContext, ActivityCursor, ActivityState, ActivityType};
pub use cache::{AccountSnapshot, AccountStateCache, BalanceView, Balances, SnapshotSummary};
pub use config::AccountConfig;
pub use credentials::{CachedCredentials, CredentialSource, CredentialStore};
pub use error::{AccountError, AccountResult};
pub use positions::{Fill, Position, calculate_positions};
pub use service::{AccountService, ProviderContext};
