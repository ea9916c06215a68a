use chrono::{DateTime, Duration, Utc};
use tradesync_gateway::{HistoryState, SyncWindow};

pub const FULL_LOOKBACK_DAYS: i64 = 730;

/// Picks the history window for a run. Accounts with nothing in the ledger
/// get the full lookback; others resume from their checkpoint.
pub fn select_window(
    now: DateTime<Utc>,
    checkpoint: Option<DateTime<Utc>>,
    has_trades: bool,
    lookback_days: i64,
) -> (SyncWindow, HistoryState) {
    let history = if has_trades || checkpoint.is_some() {
        HistoryState::Established
    } else {
        HistoryState::Fresh
    };

    let full_start = Duration::try_days(lookback_days.max(0))
        .and_then(|lookback| now.checked_sub_signed(lookback))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let start = match checkpoint {
        Some(checkpoint) if has_trades => checkpoint.min(now),
        _ => full_start,
    };

    (SyncWindow { start, end: now }, history)
}
