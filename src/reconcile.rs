//! Rebuilds round-trip trades from the raw fills a terminal reports.
//!
//! Fills are grouped by position. Within a position the earliest opening fill
//! is the entry leg and the earliest closing fill is the exit leg; profit is
//! summed across every fill so that partial closes land in one trade. Output
//! depends only on the set of fills, never on the order they arrived in.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;
use tradesync_gateway::{DealEvent, DealRole, DealSide};

const PRECIOUS_METALS: [&str; 4] = ["XAU", "XAG", "XPT", "XPD"];
const UNKNOWN_PAIR: &str = "UNKNOWN";

#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedTrade {
    pub ticket: String,
    pub pair: String,
    /// Side of the entry fill.
    pub direction: Option<DealSide>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pips: f64,
    pub profit_dollar: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub duration_minutes: Option<i64>,
    pub is_win: bool,
    /// No closing fill was seen; the exit leg mirrors the last entry fill.
    pub is_open: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reconciliation {
    /// Sorted by ticket.
    pub trades: Vec<ReconstructedTrade>,
    /// Positions whose only fills in the window were closing ones.
    pub orphaned_exits: usize,
    /// Positions with neither an opening nor a closing fill.
    pub unclassified_positions: usize,
}

impl Reconciliation {
    /// Entry time of the oldest position still open. A checkpoint past this
    /// point would hide the position's closing fill from the next window.
    pub fn earliest_open_entry(&self) -> Option<DateTime<Utc>> {
        self.trades
            .iter()
            .filter(|trade| trade.is_open)
            .map(|trade| trade.entry_time)
            .min()
    }
}

/// Pips per unit of price for `symbol`.
pub fn pip_multiplier(symbol: &str) -> f64 {
    let symbol = symbol.to_ascii_uppercase();

    if symbol.contains("JPY") || PRECIOUS_METALS.iter().any(|metal| symbol.starts_with(metal)) {
        100.0
    } else {
        10_000.0
    }
}

fn signed_pips(entry_price: f64, exit_price: f64, multiplier: f64, profit: f64) -> f64 {
    let magnitude = ((exit_price - entry_price).abs() * multiplier * 10.0).round() / 10.0;
    // A loss keeps its sign even when the distance rounds to zero.
    if profit < 0.0 { -magnitude } else { magnitude }
}

pub fn reconcile(deals: &[DealEvent]) -> Reconciliation {
    let mut positions: BTreeMap<&str, Vec<&DealEvent>> = BTreeMap::new();

    for deal in deals.iter().filter(|deal| !deal.role.is_cash_adjustment()) {
        if let Some(position_id) = deal.position_id.as_deref() {
            positions.entry(position_id).or_default().push(deal);
        }
    }

    let mut reconciliation = Reconciliation::default();

    for (ticket, mut fills) in positions {
        fills.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));

        match rebuild_position(ticket, &fills) {
            Some(trade) => reconciliation.trades.push(trade),
            None if fills.iter().any(|fill| fill.role == DealRole::Exit) => {
                debug!(ticket, fills = fills.len(), "Position opened before the window, skipping");
                reconciliation.orphaned_exits += 1;
            }
            None => {
                debug!(ticket, fills = fills.len(), "Position has no opening or closing fill, skipping");
                reconciliation.unclassified_positions += 1;
            }
        }
    }

    reconciliation
}

fn rebuild_position(ticket: &str, fills: &[&DealEvent]) -> Option<ReconstructedTrade> {
    let entry = fills.iter().find(|fill| fill.role == DealRole::Entry)?;
    let exit = fills.iter().find(|fill| fill.role == DealRole::Exit);

    let (exit_leg, is_open) = match exit {
        Some(exit) => (exit, false),
        None => (fills.iter().rev().find(|fill| fill.role == DealRole::Entry)?, true),
    };

    let profit: f64 = fills.iter().map(|fill| fill.net_profit()).sum();

    let pair = entry
        .symbol
        .as_deref()
        .or_else(|| fills.iter().find_map(|fill| fill.symbol.as_deref()))
        .unwrap_or(UNKNOWN_PAIR)
        .to_string();

    let pips = signed_pips(entry.price, exit_leg.price, pip_multiplier(&pair), profit);
    let duration_minutes = (!is_open).then(|| (exit_leg.time - entry.time).num_minutes());

    Some(ReconstructedTrade {
        ticket: ticket.to_string(),
        pair,
        direction: entry.side,
        entry_price: entry.price,
        exit_price: exit_leg.price,
        pips,
        profit_dollar: profit,
        entry_time: entry.time,
        exit_time: exit_leg.time,
        duration_minutes,
        is_win: profit > 0.0,
        is_open,
    })
}
