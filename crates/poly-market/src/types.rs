//! Shared types for Polymarket CLOB integration.
//!
//! Data structures for REST responses, request parameters and websocket
//! frames. Venue responses are inconsistent about field names and about
//! numbers vs. strings, so most fields are optional and lenient.

use std::collections::HashMap;

use poly_common::{AssetType, Channel, Side};
use serde::{Deserialize, Deserializer, Serialize};

/// Accept a JSON string or number and keep it as a string.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// L2 API credentials issued by the CLOB.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCreds {
    #[serde(alias = "apiKey", alias = "api_key")]
    pub key: String,
    pub secret: String,
    pub passphrase: String,
}

impl ApiCreds {
    pub fn new(key: impl Into<String>, secret: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
        }
    }

    /// All three parts present and non-blank.
    pub fn is_complete(&self) -> bool {
        !self.key.trim().is_empty()
            && !self.secret.trim().is_empty()
            && !self.passphrase.trim().is_empty()
    }
}

impl std::fmt::Debug for ApiCreds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCreds")
            .field("key", &self.key)
            .field("secret", &"[REDACTED]")
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

/// Query parameters for `/balance-allowance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceAllowanceParams {
    pub asset_type: AssetType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
}

impl BalanceAllowanceParams {
    pub fn collateral() -> Self {
        Self {
            asset_type: AssetType::Collateral,
            token_id: None,
        }
    }

    pub fn conditional(token_id: impl Into<String>) -> Self {
        Self {
            asset_type: AssetType::Conditional,
            token_id: Some(token_id.into()),
        }
    }
}

/// Balance and allowance, as raw venue strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceAllowance {
    #[serde(default, deserialize_with = "string_or_number")]
    pub balance: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub allowance: Option<String>,
}

/// An open order as reported by `/data/orders`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    #[serde(alias = "order_id")]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub maker_address: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default, alias = "token_id")]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub original_size: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub size_matched: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub price: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub expiration: Option<String>,
}

/// A fill as reported by `/data/trades`. Listing rows decode one at a time;
/// a row missing `id` or `side` is dropped on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEntry {
    #[serde(alias = "trade_id")]
    pub id: String,
    #[serde(default)]
    pub taker_order_id: Option<String>,
    #[serde(default, alias = "market_id")]
    pub market: String,
    #[serde(default, alias = "token_id")]
    pub asset_id: String,
    pub side: Side,
    #[serde(default, deserialize_with = "string_or_number")]
    pub size: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub fee_rate_bps: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Unix seconds of the match.
    #[serde(default, alias = "timestamp", deserialize_with = "string_or_number")]
    pub match_time: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub last_update: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub maker_address: Option<String>,
    #[serde(default, alias = "tx_hash")]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub trader_side: Option<String>,
}

impl TradeEntry {
    /// Match time as unix seconds, if parseable.
    pub fn match_time_secs(&self) -> Option<i64> {
        self.match_time.as_deref()?.trim().parse::<i64>().ok()
    }
}

/// Cursor value the venue returns on the last page.
pub const END_CURSOR: &str = "LTE=";

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub count: Option<u32>,
}

impl<T> Page<T> {
    /// Whether another page should be requested.
    pub fn has_more(&self) -> bool {
        matches!(self.next_cursor.as_deref(), Some(c) if !c.is_empty() && c != END_CURSOR)
    }
}

/// Listing endpoints return either a bare array or a page object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Listing<T> {
    Page(Page<T>),
    Items(Vec<T>),
}

impl<T> Listing<T> {
    pub fn into_page(self) -> Page<T> {
        match self {
            Listing::Page(p) => p,
            Listing::Items(data) => Page {
                data,
                next_cursor: None,
                limit: None,
                count: None,
            },
        }
    }
}

/// Metadata for one API key on the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyMeta {
    #[serde(alias = "key", alias = "apiKey")]
    pub key_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, rename = "type")]
    pub key_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub last_used_at: Option<String>,
    #[serde(default)]
    pub is_cert_whitelisted: Option<bool>,
}

impl ApiKeyMeta {
    pub fn from_id(key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            label: None,
            key_type: None,
            status: None,
            created_at: None,
            last_used_at: None,
            is_cert_whitelisted: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ApiKeyEntry {
    Id(String),
    Detailed(ApiKeyMeta),
}

fn api_key_list<'de, D>(deserializer: D) -> Result<Vec<ApiKeyMeta>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Option::<Vec<ApiKeyEntry>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            ApiKeyEntry::Id(id) => ApiKeyMeta::from_id(id),
            ApiKeyEntry::Detailed(meta) => meta,
        })
        .collect())
}

/// `/auth/api-keys` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApiKeysResponse {
    #[serde(default, alias = "apiKeys", deserialize_with = "api_key_list")]
    pub api_keys: Vec<ApiKeyMeta>,
    #[serde(default, alias = "certRequired")]
    pub cert_required: Option<bool>,
}

/// `/order-scoring` response; older deployments nest the map under `scoring`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScoringResponse {
    Nested { scoring: HashMap<String, bool> },
    Flat(HashMap<String, bool>),
}

impl ScoringResponse {
    pub fn into_map(self) -> HashMap<String, bool> {
        match self {
            ScoringResponse::Nested { scoring } => scoring,
            ScoringResponse::Flat(map) => map,
        }
    }
}

/// Error body returned on non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub error: Option<String>,
    pub message: Option<String>,
}

/// Credentials embedded in authenticated websocket subscriptions.
#[derive(Clone, Serialize)]
pub struct WsAuth {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl From<&ApiCreds> for WsAuth {
    fn from(creds: &ApiCreds) -> Self {
        Self {
            api_key: creds.key.clone(),
            secret: creds.secret.clone(),
            passphrase: creds.passphrase.clone(),
        }
    }
}

impl std::fmt::Debug for WsAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsAuth")
            .field("api_key", &self.api_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Subscribe / unsubscribe operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionOp {
    Subscribe,
    Unsubscribe,
}

/// Outbound subscription frame.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionFrame {
    #[serde(rename = "type")]
    pub op: SubscriptionOp,
    pub channel: Channel,
    pub assets_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<WsAuth>,
}

/// Minimal envelope used to route inbound frames.
#[derive(Debug, Deserialize)]
pub struct GenericMessage {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_creds_aliases() {
        let json = r#"{"apiKey":"k-1","secret":"c2VjcmV0","passphrase":"pp"}"#;
        let creds: ApiCreds = serde_json::from_str(json).unwrap();
        assert_eq!(creds.key, "k-1");
        assert!(creds.is_complete());

        let json = r#"{"api_key":"k-2","secret":"s","passphrase":"p"}"#;
        let creds: ApiCreds = serde_json::from_str(json).unwrap();
        assert_eq!(creds.key, "k-2");
    }

    #[test]
    fn test_api_creds_debug_redacts() {
        let creds = ApiCreds::new("key", "topsecret", "hunter2");
        let debug = format!("{creds:?}");
        assert!(!debug.contains("topsecret"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_balance_allowance_numbers_or_strings() {
        let b: BalanceAllowance =
            serde_json::from_str(r#"{"balance":"1500000","allowance":2000000}"#).unwrap();
        assert_eq!(b.balance.as_deref(), Some("1500000"));
        assert_eq!(b.allowance.as_deref(), Some("2000000"));

        let b: BalanceAllowance = serde_json::from_str(r#"{"balance":"0"}"#).unwrap();
        assert!(b.allowance.is_none());
    }

    #[test]
    fn test_balance_params_query_shape() {
        let q = serde_json::to_value(BalanceAllowanceParams::collateral()).unwrap();
        assert_eq!(q, serde_json::json!({"asset_type": "COLLATERAL"}));

        let q = serde_json::to_value(BalanceAllowanceParams::conditional("123")).unwrap();
        assert_eq!(
            q,
            serde_json::json!({"asset_type": "CONDITIONAL", "token_id": "123"})
        );
    }

    #[test]
    fn test_trade_entry_parsing() {
        let json = r#"{
            "id": "t-1",
            "taker_order_id": "o-1",
            "market": "0xcond",
            "asset_id": "tok",
            "side": "BUY",
            "size": "10",
            "price": "0.40",
            "status": "CONFIRMED",
            "match_time": "1704067200",
            "maker_address": "0xmaker"
        }"#;
        let trade: TradeEntry = serde_json::from_str(json).unwrap();
        assert_eq!(trade.side, Side::Buy);
        assert_eq!(trade.size.as_deref(), Some("10"));
        assert_eq!(trade.match_time_secs(), Some(1_704_067_200));
    }

    #[test]
    fn test_listing_accepts_array_or_page() {
        let listing: Listing<OpenOrder> =
            serde_json::from_str(r#"[{"id":"a"},{"order_id":"b"}]"#).unwrap();
        let page = listing.into_page();
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[1].id, "b");
        assert!(!page.has_more());

        let listing: Listing<OpenOrder> =
            serde_json::from_str(r#"{"data":[{"id":"a"}],"next_cursor":"MTAw"}"#).unwrap();
        assert!(listing.into_page().has_more());

        let listing: Listing<OpenOrder> =
            serde_json::from_str(r#"{"data":[],"next_cursor":"LTE="}"#).unwrap();
        assert!(!listing.into_page().has_more());
    }

    #[test]
    fn test_api_keys_response_shapes() {
        let resp: ApiKeysResponse =
            serde_json::from_str(r#"{"apiKeys":["k1","k2"],"cert_required":false}"#).unwrap();
        assert_eq!(resp.api_keys.len(), 2);
        assert_eq!(resp.api_keys[0].key_id, "k1");
        assert_eq!(resp.cert_required, Some(false));

        let resp: ApiKeysResponse = serde_json::from_str(
            r#"{"api_keys":[{"key_id":"k3","label":"bot","status":"active"}]}"#,
        )
        .unwrap();
        assert_eq!(resp.api_keys[0].label.as_deref(), Some("bot"));
        assert!(resp.cert_required.is_none());
    }

    #[test]
    fn test_scoring_response_shapes() {
        let nested: ScoringResponse =
            serde_json::from_str(r#"{"scoring":{"o1":true}}"#).unwrap();
        assert_eq!(nested.into_map().get("o1"), Some(&true));

        let flat: ScoringResponse = serde_json::from_str(r#"{"o1":false,"o2":true}"#).unwrap();
        assert_eq!(flat.into_map().len(), 2);
    }

    #[test]
    fn test_subscription_frame_serialization() {
        let frame = SubscriptionFrame {
            op: SubscriptionOp::Subscribe,
            channel: Channel::Book,
            assets_ids: vec!["token1".to_string(), "token2".to_string()],
            auth: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"subscribe\""));
        assert!(json.contains("\"channel\":\"book\""));
        assert!(json.contains("\"assets_ids\""));
        assert!(!json.contains("auth"));

        let frame = SubscriptionFrame {
            op: SubscriptionOp::Unsubscribe,
            channel: Channel::User,
            assets_ids: vec![],
            auth: Some(WsAuth::from(&ApiCreds::new("k", "s", "p"))),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"unsubscribe\""));
        assert!(json.contains("\"apiKey\":\"k\""));
    }
}
