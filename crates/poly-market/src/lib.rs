//! Polymarket CLOB integration library.
//!
//! - Request authentication (L1 wallet signatures, L2 HMAC)
//! - Authenticated REST client for account endpoints
//! - Websocket connection manager with subscription replay
//!
//! Used by `poly-account` to keep per-wallet account state warm.

pub mod auth;
pub mod rest;
pub mod types;
pub mod ws;

pub use auth::WalletSigner;
pub use rest::{ClobRestClient, RestConfig, VenueClient, VenueError, endpoints};
pub use types::{
    ApiCreds, ApiKeyMeta, ApiKeysResponse, BalanceAllowance, BalanceAllowanceParams, OpenOrder,
    TradeEntry,
};
pub use ws::{
    ConnectionState, CredentialProvider, SubscriptionKey, SubscriptionRequest, SubscriptionStatus,
    WebsocketConnectionManager, WebsocketSubscription, WsConfig, WsError, WsEvent, WsStatus,
};
