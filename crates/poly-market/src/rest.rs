//! REST client for the authenticated Polymarket CLOB account endpoints.
//!
//! `VenueClient` is the seam the account cache and credential store depend
//! on; `ClobRestClient` is the live implementation over `reqwest`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::{WalletSigner, l2_headers};
use crate::types::{
    ApiCreds, ApiErrorBody, ApiKeysResponse, BalanceAllowance, BalanceAllowanceParams, Listing,
    OpenOrder, Page, ScoringResponse, TradeEntry,
};

/// Polymarket CLOB endpoints and chain constants.
pub mod endpoints {
    /// Production CLOB REST API.
    pub const CLOB_REST: &str = "https://clob.polymarket.com";
    /// Production CLOB WebSocket (channel path appended by the caller).
    pub const CLOB_WS: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/";
    /// Polygon mainnet chain ID.
    pub const CHAIN_ID: u64 = 137;
    /// USDC has 6 decimals.
    pub const USDC_DECIMALS: u32 = 6;
    /// Default page size for listings.
    pub const DEFAULT_PAGE_LIMIT: u32 = 100;
    /// Largest page size the venue accepts.
    pub const MAX_PAGE_LIMIT: u32 = 500;
    /// First cursor of a paginated listing.
    pub const INITIAL_CURSOR: &str = "MA==";

    pub const DERIVE_API_KEY: &str = "/auth/derive-api-key";
    pub const API_KEY: &str = "/auth/api-key";
    pub const API_KEYS: &str = "/auth/api-keys";
    pub const BALANCE_ALLOWANCE: &str = "/balance-allowance";
    pub const ORDERS: &str = "/data/orders";
    pub const TRADES: &str = "/data/trades";
    pub const ORDERS_SCORING: &str = "/orders-scoring";
}

/// Errors from venue REST calls.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("API credentials unavailable")]
    MissingCredentials,

    #[error("Request timed out")]
    Timeout,
}

impl VenueError {
    fn from_reqwest(context: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            VenueError::Timeout
        } else {
            VenueError::Connection(format!("{context}: {e}"))
        }
    }
}

/// Account-facing venue operations.
///
/// Every call may be slow or fail; callers decide how to degrade.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Wallet address the client authenticates as.
    fn address(&self) -> String;

    /// Re-derive the deterministic API credentials for this wallet.
    async fn derive_api_key(&self) -> Result<ApiCreds, VenueError>;

    /// Create a fresh set of API credentials.
    async fn create_api_key(&self) -> Result<ApiCreds, VenueError>;

    /// Revoke the given credentials on the venue.
    async fn revoke_api_key(&self, creds: &ApiCreds) -> Result<(), VenueError>;

    async fn get_api_keys(&self, creds: &ApiCreds) -> Result<ApiKeysResponse, VenueError>;

    async fn get_balance_allowance(
        &self,
        creds: &ApiCreds,
        params: &BalanceAllowanceParams,
    ) -> Result<BalanceAllowance, VenueError>;

    async fn get_open_orders(&self, creds: &ApiCreds) -> Result<Vec<OpenOrder>, VenueError>;

    /// Fills, newest first, following cursors for at most `max_pages`.
    async fn get_trades(
        &self,
        creds: &ApiCreds,
        page_limit: u32,
        max_pages: u32,
    ) -> Result<Vec<TradeEntry>, VenueError>;

    /// Reward-scoring flag per order id.
    async fn get_order_scoring(
        &self,
        creds: &ApiCreds,
        order_ids: &[String],
    ) -> Result<HashMap<String, bool>, VenueError>;
}

/// Configuration for the REST client.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// CLOB REST base URL.
    pub base_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Chain used in the L1 signing domain.
    pub chain_id: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: endpoints::CLOB_REST.to_string(),
            request_timeout: Duration::from_secs(30),
            chain_id: endpoints::CHAIN_ID,
        }
    }
}

/// Live venue client.
#[derive(Debug, Clone)]
pub struct ClobRestClient {
    config: RestConfig,
    client: Client,
    wallet: WalletSigner,
    address: String,
}

impl ClobRestClient {
    /// Create a client for the wallet behind `private_key_hex`.
    pub fn new(config: RestConfig, private_key_hex: &str) -> Result<Self, VenueError> {
        let wallet = WalletSigner::from_private_key(private_key_hex, config.chain_id)?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| VenueError::Connection(format!("Failed to build HTTP client: {e}")))?;
        let address = wallet.address().to_string();

        info!(address = %address, base_url = %config.base_url, "Initialized CLOB REST client");

        Ok(Self {
            config,
            client,
            wallet,
            address,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Send a prepared request and decode the JSON body.
    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<T, VenueError> {
        let response = request
            .send()
            .await
            .map_err(|e| VenueError::from_reqwest(path, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| VenueError::from_reqwest("Failed to read response", e))?;

        if !status.is_success() {
            let body = match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(err) => err.error.or(err.message).unwrap_or(body),
                Err(_) => body,
            };
            return Err(VenueError::Http {
                status: status.as_u16(),
                body,
            });
        }

        // DELETE endpoints may answer with an empty body
        let body = if body.trim().is_empty() { "null" } else { body.as_str() };
        serde_json::from_str(body).map_err(|e| VenueError::Parse(format!("{path}: {e} - {body}")))
    }

    async fn l1_request<T: DeserializeOwned>(&self, method: Method, path: &str) -> Result<T, VenueError> {
        let headers = self.wallet.l1_headers(Utc::now().timestamp(), 0)?;
        let mut request = self.client.request(method, self.url(path));
        for (name, value) in headers {
            request = request.header(name, value);
        }
        self.execute(request, path).await
    }

    async fn l2_request<T: DeserializeOwned>(
        &self,
        creds: &ApiCreds,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<String>,
    ) -> Result<T, VenueError> {
        let headers = l2_headers(
            &self.address,
            creds,
            Utc::now().timestamp(),
            method.as_str(),
            path,
            body.as_deref(),
        )?;

        let mut request = self.client.request(method, self.url(path));
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        self.execute(request, path).await
    }

    /// Walk a cursor-paginated listing. Rows that fail to decode are skipped.
    async fn paginate<T: DeserializeOwned>(
        &self,
        creds: &ApiCreds,
        path: &str,
        page_limit: u32,
        max_pages: u32,
    ) -> Result<Vec<T>, VenueError> {
        let page_limit = page_limit.clamp(1, endpoints::MAX_PAGE_LIMIT);
        let mut cursor = endpoints::INITIAL_CURSOR.to_string();
        let mut items = Vec::new();

        for page_index in 0..max_pages.max(1) {
            let query = [
                ("next_cursor", cursor.clone()),
                ("limit", page_limit.to_string()),
            ];
            let listing: Listing<serde_json::Value> = self
                .l2_request(creds, Method::GET, path, &query, None)
                .await?;
            let page: Page<serde_json::Value> = listing.into_page();
            let more = page.has_more();
            let received = page.data.len();
            items.extend(page.data.into_iter().filter_map(|row| parse_row(path, row)));

            debug!(path, page = page_index, received, total = items.len(), "Fetched page");

            match page.next_cursor {
                Some(next) if more && received > 0 => cursor = next,
                _ => break,
            }
        }

        Ok(items)
    }
}

/// Decode one listing row, dropping it with a warning when malformed.
fn parse_row<T: DeserializeOwned>(path: &str, row: serde_json::Value) -> Option<T> {
    match serde_json::from_value(row) {
        Ok(item) => Some(item),
        Err(e) => {
            warn!(path, error = %e, "Skipping malformed listing row");
            None
        }
    }
}

#[async_trait]
impl VenueClient for ClobRestClient {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn derive_api_key(&self) -> Result<ApiCreds, VenueError> {
        let creds: ApiCreds = self.l1_request(Method::GET, endpoints::DERIVE_API_KEY).await?;
        if !creds.is_complete() {
            return Err(VenueError::Parse("derived credentials incomplete".to_string()));
        }
        Ok(creds)
    }

    async fn create_api_key(&self) -> Result<ApiCreds, VenueError> {
        let creds: ApiCreds = self.l1_request(Method::POST, endpoints::API_KEY).await?;
        if !creds.is_complete() {
            return Err(VenueError::Parse("created credentials incomplete".to_string()));
        }
        info!(address = %self.address, "Created new CLOB API key");
        Ok(creds)
    }

    async fn revoke_api_key(&self, creds: &ApiCreds) -> Result<(), VenueError> {
        let _: serde_json::Value = self
            .l2_request(creds, Method::DELETE, endpoints::API_KEY, &[], None)
            .await?;
        Ok(())
    }

    async fn get_api_keys(&self, creds: &ApiCreds) -> Result<ApiKeysResponse, VenueError> {
        self.l2_request(creds, Method::GET, endpoints::API_KEYS, &[], None)
            .await
    }

    async fn get_balance_allowance(
        &self,
        creds: &ApiCreds,
        params: &BalanceAllowanceParams,
    ) -> Result<BalanceAllowance, VenueError> {
        let mut query = vec![("asset_type", params.asset_type.to_string())];
        if let Some(token_id) = &params.token_id {
            query.push(("token_id", token_id.clone()));
        }
        self.l2_request(creds, Method::GET, endpoints::BALANCE_ALLOWANCE, &query, None)
            .await
    }

    async fn get_open_orders(&self, creds: &ApiCreds) -> Result<Vec<OpenOrder>, VenueError> {
        self.paginate(creds, endpoints::ORDERS, endpoints::DEFAULT_PAGE_LIMIT, 10)
            .await
    }

    async fn get_trades(
        &self,
        creds: &ApiCreds,
        page_limit: u32,
        max_pages: u32,
    ) -> Result<Vec<TradeEntry>, VenueError> {
        self.paginate(creds, endpoints::TRADES, page_limit, max_pages)
            .await
    }

    async fn get_order_scoring(
        &self,
        creds: &ApiCreds,
        order_ids: &[String],
    ) -> Result<HashMap<String, bool>, VenueError> {
        if order_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let body = serde_json::to_string(order_ids)
            .map_err(|e| VenueError::Parse(format!("Failed to encode order ids: {e}")))?;
        let response: ScoringResponse = self
            .l2_request(creds, Method::POST, endpoints::ORDERS_SCORING, &[], Some(body))
            .await?;
        let map = response.into_map();
        if map.len() < order_ids.len() {
            warn!(requested = order_ids.len(), returned = map.len(), "Partial scoring response");
        }
        Ok(map)
    }
}
