use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use std::str::FromStr;

use super::pool::DbPool;
use super::CandleStore;
use crate::candle::{Candle, Interval};
use crate::error::HubError;

/// SQLite-backed candle store. Queries run on the blocking pool so the async
/// workers never wait on disk.
#[derive(Clone)]
pub struct SqliteCandleStore {
    pool: DbPool,
}

impl SqliteCandleStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, HubError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, HubError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Insert (or replace) a batch of candles in one transaction.
pub fn insert_candles(
    conn: &mut Connection,
    interval: Interval,
    candles: &[Candle],
) -> Result<usize, HubError> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT OR REPLACE INTO {} (exchange, symbol, epoch, open, high, low, close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            interval.table_name()
        ))?;
        for c in candles {
            stmt.execute(params![
                c.exchange,
                c.pair,
                c.epoch,
                c.open.to_string(),
                c.high.to_string(),
                c.low.to_string(),
                c.close.to_string(),
                c.volume.to_string(),
            ])?;
        }
    }
    tx.commit()?;
    Ok(candles.len())
}

/// Count bars with `start <= epoch < end`.
pub fn count_candles(
    conn: &Connection,
    interval: Interval,
    exchange: &str,
    symbol: &str,
    start: i64,
    end: i64,
) -> Result<u64, HubError> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {}
             WHERE exchange = ?1 AND symbol = ?2 AND epoch >= ?3 AND epoch < ?4",
            interval.table_name()
        ),
        params![exchange, symbol, start, end],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

/// Fetch up to `limit` bars with `cursor <= epoch < end`, oldest first.
pub fn fetch_range(
    conn: &Connection,
    interval: Interval,
    exchange: &str,
    symbol: &str,
    cursor: i64,
    end: i64,
    limit: usize,
) -> Result<Vec<Candle>, HubError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT epoch, open, high, low, close, volume
         FROM {}
         WHERE exchange = ?1 AND symbol = ?2 AND epoch >= ?3 AND epoch < ?4
         ORDER BY epoch ASC
         LIMIT ?5",
        interval.table_name()
    ))?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt
        .query_map(params![exchange, symbol, cursor, end, limit], |row| {
            Ok(Candle {
                epoch: row.get(0)?,
                pair: symbol.to_string(),
                exchange: exchange.to_string(),
                open: decimal_col(row, 1)?,
                high: decimal_col(row, 2)?,
                low: decimal_col(row, 3)?,
                close: decimal_col(row, 4)?,
                volume: decimal_col(row, 5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn insert_many(&self, interval: Interval, candles: Vec<Candle>) -> Result<usize, HubError> {
        if candles.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| insert_candles(conn, interval, &candles))
            .await
    }

    async fn count(
        &self,
        interval: Interval,
        exchange: &str,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, HubError> {
        let (exchange, symbol) = (exchange.to_string(), symbol.to_string());
        let (start, end) = (start.timestamp(), end.timestamp());
        self.with_conn(move |conn| count_candles(conn, interval, &exchange, &symbol, start, end))
            .await
    }

    async fn get_range(
        &self,
        interval: Interval,
        exchange: &str,
        symbol: &str,
        cursor: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>, HubError> {
        let (exchange, symbol) = (exchange.to_string(), symbol.to_string());
        let (cursor, end) = (cursor.timestamp(), end.timestamp());
        self.with_conn(move |conn| {
            fetch_range(conn, interval, &exchange, &symbol, cursor, end, limit)
        })
        .await
    }
}
