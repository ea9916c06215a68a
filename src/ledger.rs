use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

use crate::error::PersistenceError;
use crate::reconcile::ReconstructedTrade;

pub async fn existing_tickets(
    pool: &SqlitePool,
    account_id: i64,
) -> Result<HashSet<String>, PersistenceError> {
    let tickets: Vec<String> = sqlx::query_scalar("SELECT ticket FROM trades WHERE account_id = ?1")
        .bind(account_id)
        .fetch_all(pool)
        .await?;

    Ok(tickets.into_iter().collect())
}

/// Tickets of positions stored while still open.
pub async fn open_tickets(
    pool: &SqlitePool,
    account_id: i64,
) -> Result<HashSet<String>, PersistenceError> {
    let tickets: Vec<String> =
        sqlx::query_scalar("SELECT ticket FROM trades WHERE account_id = ?1 AND is_open = TRUE")
            .bind(account_id)
            .fetch_all(pool)
            .await?;

    Ok(tickets.into_iter().collect())
}

pub async fn count_trades(pool: &SqlitePool, account_id: i64) -> Result<i64, PersistenceError> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM trades WHERE account_id = ?1")
        .bind(account_id)
        .fetch_one(pool)
        .await?;

    Ok(count)
}

/// Inserts `trades` in one transaction; either all rows land or none do.
pub async fn insert_batch(
    pool: &SqlitePool,
    account_id: i64,
    trades: &[ReconstructedTrade],
) -> Result<usize, PersistenceError> {
    let mut sql_tx = pool.begin().await?;

    for trade in trades {
        sqlx::query(
            r"
            INSERT INTO trades (
                account_id, ticket, pair, direction, entry_price, exit_price, pips,
                profit_dollar, entry_time, exit_time, duration_minutes, is_win, is_open
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ",
        )
        .bind(account_id)
        .bind(&trade.ticket)
        .bind(&trade.pair)
        .bind(trade.direction.map(|side| side.as_str()))
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.pips)
        .bind(trade.profit_dollar)
        .bind(trade.entry_time)
        .bind(trade.exit_time)
        .bind(trade.duration_minutes)
        .bind(trade.is_win)
        .bind(trade.is_open)
        .execute(sql_tx.as_mut())
        .await?;
    }

    sql_tx.commit().await?;
    Ok(trades.len())
}

/// Overwrites rows stored as open with their latest reconstruction, in one
/// transaction. Rows already closed are left alone. Returns rows changed.
pub async fn replace_open_batch(
    pool: &SqlitePool,
    account_id: i64,
    trades: &[ReconstructedTrade],
) -> Result<usize, PersistenceError> {
    let mut sql_tx = pool.begin().await?;
    let mut replaced = 0;

    for trade in trades {
        let result = sqlx::query(
            r"
            UPDATE trades
            SET pair = ?3, direction = ?4, entry_price = ?5, exit_price = ?6, pips = ?7,
                profit_dollar = ?8, entry_time = ?9, exit_time = ?10, duration_minutes = ?11,
                is_win = ?12, is_open = ?13
            WHERE account_id = ?1 AND ticket = ?2 AND is_open = TRUE
            ",
        )
        .bind(account_id)
        .bind(&trade.ticket)
        .bind(&trade.pair)
        .bind(trade.direction.map(|side| side.as_str()))
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.pips)
        .bind(trade.profit_dollar)
        .bind(trade.entry_time)
        .bind(trade.exit_time)
        .bind(trade.duration_minutes)
        .bind(trade.is_win)
        .bind(trade.is_open)
        .execute(sql_tx.as_mut())
        .await?;

        replaced += usize::try_from(result.rows_affected()).unwrap_or(usize::MAX);
    }

    sql_tx.commit().await?;
    Ok(replaced)
}

/// Ledger rows for an account, ordered by entry time.
pub async fn load_trades(
    pool: &SqlitePool,
    account_id: i64,
) -> Result<Vec<ReconstructedTrade>, PersistenceError> {
    let rows = sqlx::query(
        r"
        SELECT ticket, pair, direction, entry_price, exit_price, pips, profit_dollar,
               entry_time, exit_time, duration_minutes, is_win, is_open
        FROM trades
        WHERE account_id = ?1
        ORDER BY entry_time, ticket
        ",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let direction = row
                .try_get::<Option<String>, _>("direction")?
                .map(|side| {
                    side.parse()
                        .map_err(|_| PersistenceError::InvalidDirection(side.clone()))
                })
                .transpose()?;

            Ok(ReconstructedTrade {
                ticket: row.try_get("ticket")?,
                pair: row.try_get("pair")?,
                direction,
                entry_price: row.try_get("entry_price")?,
                exit_price: row.try_get("exit_price")?,
                pips: row.try_get("pips")?,
                profit_dollar: row.try_get("profit_dollar")?,
                entry_time: row.try_get("entry_time")?,
                exit_time: row.try_get("exit_time")?,
                duration_minutes: row.try_get("duration_minutes")?,
                is_win: row.try_get("is_win")?,
                is_open: row.try_get("is_open")?,
            })
        })
        .collect()
}
