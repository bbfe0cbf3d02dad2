//! Shared types for the Polymarket account service.
//!
//! Prices and quantities elsewhere in the workspace are `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Order / fill side as reported by the CLOB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    #[serde(alias = "buy", alias = "Buy")]
    Buy,
    #[serde(alias = "sell", alias = "Sell")]
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Asset class for balance/allowance queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssetType {
    /// USDC collateral.
    Collateral,
    /// Outcome (conditional) tokens.
    Conditional,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Collateral => "COLLATERAL",
            AssetType::Conditional => "CONDITIONAL",
        }
    }
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Streaming channel names accepted by the CLOB websocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Book,
    Price,
    Trade,
    Ticker,
    User,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Book,
        Channel::Price,
        Channel::Trade,
        Channel::Ticker,
        Channel::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Book => "book",
            Channel::Price => "price",
            Channel::Trade => "trade",
            Channel::Ticker => "ticker",
            Channel::User => "user",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown channel: {s}"))
    }
}
