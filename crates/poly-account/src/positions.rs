//! Net positions and realized P&L from a fill stream.
//!
//! Pure functions, no I/O. Fills are replayed per instrument in the order
//! given. A fill against an open position first closes up to the open size
//! (realizing P&L against the average entry), and any remainder opens a new
//! position in the fill's direction at the fill price.

use std::collections::HashMap;
use std::str::FromStr;

use poly_common::Side;
use poly_market::TradeEntry;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Decimal places kept on published positions.
pub const POSITION_DP: u32 = 6;

/// One execution, already parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub instrument_id: String,
    pub market: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

impl Fill {
    pub fn new(
        instrument_id: impl Into<String>,
        market: impl Into<String>,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            market: market.into(),
            side,
            price,
            size,
        }
    }

    /// Parse a venue trade. Returns `None` when price or size is missing or
    /// not a number.
    pub fn from_trade(trade: &TradeEntry) -> Option<Self> {
        let price = Decimal::from_str(trade.price.as_deref()?.trim()).ok()?;
        let size = Decimal::from_str(trade.size.as_deref()?.trim()).ok()?;
        Some(Self::new(
            trade.asset_id.clone(),
            trade.market.clone(),
            trade.side,
            price,
            size,
        ))
    }
}

/// Net holding in one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub instrument_id: String,
    pub market: String,
    /// Signed size: positive is long.
    pub size: Decimal,
    /// Cost basis of the open size.
    pub average_price: Decimal,
    pub realized_pnl: Decimal,
}

impl Position {
    pub fn side(&self) -> Side {
        if self.size.is_sign_negative() {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    /// P&L of the open size at `mark`. Sign-correct for shorts.
    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        format_dp((mark - self.average_price) * self.size)
    }
}

/// Round to six places and pin the scale so the string form always carries
/// six digits.
fn format_dp(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(POSITION_DP, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(POSITION_DP);
    rounded
}

#[derive(Debug, Default)]
struct Running {
    market: String,
    size: Decimal,
    average_price: Decimal,
    realized_pnl: Decimal,
}

impl Running {
    /// Apply one fill. Returns `None`, leaving the state untouched, when the
    /// arithmetic overflows.
    fn apply(&self, side: Side, price: Decimal, qty: Decimal) -> Option<Running> {
        match side {
            Side::Buy if self.size >= Decimal::ZERO => self.extend(price, qty, Decimal::ONE),
            Side::Sell if self.size <= Decimal::ZERO => self.extend(price, qty, Decimal::NEGATIVE_ONE),
            Side::Buy => {
                // Covering a short
                let close = self.size.abs().min(qty);
                let pnl = (self.average_price - price).checked_mul(close)?;
                self.close(pnl, price, qty - close, Decimal::ONE, qty)
            }
            Side::Sell => {
                // Selling down a long
                let close = self.size.min(qty);
                let pnl = (price - self.average_price).checked_mul(close)?;
                self.close(pnl, price, qty - close, Decimal::NEGATIVE_ONE, qty)
            }
        }
    }

    /// Realize `pnl` on the closed part; any `remaining` opens in
    /// `direction` at `price`.
    fn close(
        &self,
        pnl: Decimal,
        price: Decimal,
        remaining: Decimal,
        direction: Decimal,
        qty: Decimal,
    ) -> Option<Running> {
        let realized_pnl = self.realized_pnl.checked_add(pnl)?;
        let (size, average_price) = if remaining > Decimal::ZERO {
            (remaining * direction, price)
        } else {
            (self.size.checked_add(qty * direction)?, self.average_price)
        };
        Some(Running {
            market: self.market.clone(),
            size,
            average_price,
            realized_pnl,
        })
    }

    /// Open or extend in `direction` (+1 long, -1 short) at a weighted
    /// average entry.
    fn extend(&self, price: Decimal, qty: Decimal, direction: Decimal) -> Option<Running> {
        let open = self.size.abs();
        let total = open.checked_add(qty)?;
        let cost = self
            .average_price
            .checked_mul(open)?
            .checked_add(price.checked_mul(qty)?)?;
        Some(Running {
            market: self.market.clone(),
            size: self.size.checked_add(qty * direction)?,
            average_price: cost.checked_div(total)?,
            realized_pnl: self.realized_pnl,
        })
    }
}

/// Reconstruct positions from fills in trade order.
///
/// Fills with non-positive price or size, without an instrument or market,
/// or whose values overflow the arithmetic, are ignored. Instruments that net to zero are omitted. Output
/// follows first appearance of each instrument.
pub fn calculate_positions(fills: &[Fill]) -> Vec<Position> {
    let mut order: Vec<&str> = Vec::new();
    let mut running: HashMap<&str, Running> = HashMap::new();

    for fill in fills {
        if fill.price <= Decimal::ZERO || fill.size <= Decimal::ZERO {
            continue;
        }
        if fill.instrument_id.is_empty() || fill.market.is_empty() {
            continue;
        }

        let entry = running.entry(fill.instrument_id.as_str()).or_insert_with(|| {
            order.push(fill.instrument_id.as_str());
            Running {
                market: fill.market.clone(),
                ..Default::default()
            }
        });
        match entry.apply(fill.side, fill.price, fill.size) {
            Some(next) => *entry = next,
            None => warn!(
                instrument = %fill.instrument_id,
                price = %fill.price,
                size = %fill.size,
                "Skipping fill that overflows position math"
            ),
        }
    }

    order
        .into_iter()
        .filter_map(|id| {
            let state = running.remove(id)?;
            if state.size.is_zero() {
                return None;
            }
            Some(Position {
                instrument_id: id.to_string(),
                market: state.market,
                size: format_dp(state.size),
                average_price: format_dp(state.average_price),
                realized_pnl: format_dp(state.realized_pnl),
            })
        })
        .collect()
}

/// Parse venue trades and reconstruct positions. Unparseable trades are
/// skipped.
pub fn positions_from_trades<'a, I>(trades: I) -> Vec<Position>
where
    I: IntoIterator<Item = &'a TradeEntry>,
{
    let fills: Vec<Fill> = trades.into_iter().filter_map(Fill::from_trade).collect();
    calculate_positions(&fills)
}
