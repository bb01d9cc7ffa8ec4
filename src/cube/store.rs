//! Persistence for the materialized cube rows.
//!
//! The `trend_cube` table is owned exclusively by this crate. One row holds
//! the aggregate of one (tenant, period, dimension tuple) slice; slices with
//! no transactions have no row at all, so absence always means zero.
//!
//! Writes go through [replace_bucket]: a null-safe delete of the keyed row
//! followed by an insert when the slice is non-empty. Callers are expected
//! to wrap related bucket writes in one SQL transaction so readers never
//! observe a half-applied correction.

use rusqlite::{
    Connection, OptionalExtension, Row, params, params_from_iter, types::Value,
};
use serde::Serialize;
use time::{Date, OffsetDateTime};

use crate::{
    Error,
    db::{DatabaseID, MapRow},
    ledger::{DimensionKey, DimensionSlice, TransactionType},
    period::{Period, PeriodType},
    tenant::TenantId,
};

/// One materialized aggregate row.
#[derive(Clone, Debug, PartialEq)]
pub struct CubeRow {
    /// The tenant the row belongs to.
    pub tenant: TenantId,
    /// The stored granularity of the row (weekly or monthly).
    pub period_type: PeriodType,
    /// The calendar bounds of the row's period.
    pub period: Period,
    /// The transaction type of the row's slice.
    pub transaction_type: TransactionType,
    /// The category of the slice, or `None` for uncategorized.
    pub category_id: Option<DatabaseID>,
    /// The category display name as it was when the row was last written.
    ///
    /// Renaming a category later does not relabel historical rows; this is a
    /// deliberate "name as of write time" snapshot.
    pub category_name: Option<String>,
    /// The account of the slice.
    pub account_id: DatabaseID,
    /// The account display name as it was when the row was last written.
    pub account_name: Option<String>,
    /// Whether the slice covers recurring transactions.
    pub recurring: bool,
    /// The signed sum of the slice's ledger amounts.
    pub total_amount: f64,
    /// The number of ledger transactions in the slice. Always positive:
    /// empty slices are deleted, not stored as zeros.
    pub transaction_count: i64,
    /// When the row was first written.
    pub created_at: OffsetDateTime,
    /// When the row was last recomputed.
    pub updated_at: OffsetDateTime,
}

impl CubeRow {
    /// The dimension tuple of the row.
    pub fn key(&self) -> DimensionKey {
        DimensionKey {
            transaction_type: self.transaction_type,
            category_id: self.category_id,
            account_id: self.account_id,
            recurring: self.recurring,
        }
    }
}

impl MapRow for CubeRow {
    type ReturnType = Self;

    fn map_row_with_offset(row: &Row, offset: usize) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            tenant: TenantId::new(row.get(offset)?),
            period_type: row.get(offset + 1)?,
            period: Period {
                start: row.get(offset + 2)?,
                end: row.get(offset + 3)?,
            },
            transaction_type: row.get(offset + 4)?,
            category_id: row.get(offset + 5)?,
            category_name: row.get(offset + 6)?,
            account_id: row.get(offset + 7)?,
            account_name: row.get(offset + 8)?,
            recurring: row.get(offset + 9)?,
            total_amount: row.get(offset + 10)?,
            transaction_count: row.get(offset + 11)?,
            created_at: row.get(offset + 12)?,
            updated_at: row.get(offset + 13)?,
        })
    }
}

const CUBE_COLUMNS: &str =
    "tenant_id, period_type, period_start, period_end, transaction_type, category_id, \
     category_name, account_id, account_name, is_recurring, total_amount, transaction_count, \
     created_at, updated_at";

/// Create the cube table if it does not already exist.
///
/// Uniqueness over the full dimension tuple is enforced with an expression
/// index because SQLite treats NULL category IDs as distinct in a plain
/// UNIQUE constraint.
///
/// # Errors
/// Returns an error if the table could not be created.
pub fn create_cube_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS trend_cube (
            id INTEGER PRIMARY KEY,
            tenant_id INTEGER NOT NULL,
            period_type TEXT NOT NULL,
            period_start TEXT NOT NULL,
            period_end TEXT NOT NULL,
            transaction_type TEXT NOT NULL,
            category_id INTEGER,
            category_name TEXT,
            account_id INTEGER NOT NULL,
            account_name TEXT,
            is_recurring INTEGER NOT NULL,
            total_amount REAL NOT NULL,
            transaction_count INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
            )",
        (),
    )?;

    connection.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_trend_cube_bucket
            ON trend_cube (tenant_id, period_type, period_start, transaction_type,
                           IFNULL(category_id, -1), account_id, is_recurring)",
        (),
    )?;

    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_trend_cube_tenant_range
            ON trend_cube (tenant_id, period_type, period_start)",
        (),
    )?;

    Ok(())
}

/// The effect one [replace_bucket] call had on the table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum BucketWrite {
    /// A row was inserted or rewritten.
    Written,
    /// An existing row was removed because the slice is now empty.
    Removed,
    /// The slice is empty and no row existed.
    Noop,
}

/// Replace the cube row for one (period, dimension tuple) bucket with the
/// freshly recomputed `slice`.
///
/// An empty slice deletes the row rather than storing a zero. The original
/// `created_at` survives a rewrite; `updated_at` is refreshed.
///
/// Callers must wrap this in an SQL transaction together with any sibling
/// bucket writes that belong to the same logical mutation.
pub(crate) fn replace_bucket(
    tenant: TenantId,
    period_type: PeriodType,
    period: Period,
    slice: &DimensionSlice,
    connection: &Connection,
) -> Result<BucketWrite, Error> {
    const KEY_CLAUSE: &str = "tenant_id = ?1 AND period_type = ?2 AND period_start = ?3
         AND transaction_type = ?4 AND category_id IS ?5
         AND account_id = ?6 AND is_recurring = ?7";

    let created_at: Option<OffsetDateTime> = connection
        .query_row(
            &format!("SELECT created_at FROM trend_cube WHERE {KEY_CLAUSE}"),
            params![
                tenant.as_i64(),
                period_type,
                period.start,
                slice.key.transaction_type,
                slice.key.category_id,
                slice.key.account_id,
                slice.key.recurring,
            ],
            |row| row.get(0),
        )
        .optional()?;

    let removed = connection.execute(
        &format!("DELETE FROM trend_cube WHERE {KEY_CLAUSE}"),
        params![
            tenant.as_i64(),
            period_type,
            period.start,
            slice.key.transaction_type,
            slice.key.category_id,
            slice.key.account_id,
            slice.key.recurring,
        ],
    )?;

    if slice.transaction_count == 0 {
        return Ok(if removed > 0 {
            BucketWrite::Removed
        } else {
            BucketWrite::Noop
        });
    }

    let now = OffsetDateTime::now_utc();
    connection.execute(
        &format!(
            "INSERT INTO trend_cube ({CUBE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            tenant.as_i64(),
            period_type,
            period.start,
            period.end,
            slice.key.transaction_type,
            slice.key.category_id,
            slice.category_name,
            slice.key.account_id,
            slice.account_name,
            slice.key.recurring,
            slice.total_amount,
            slice.transaction_count,
            created_at.unwrap_or(now),
            now,
        ],
    )?;

    Ok(BucketWrite::Written)
}

/// Delete every cube row for the tenant's period of the given granularity.
///
/// Returns the number of rows removed.
pub(crate) fn delete_period_rows(
    tenant: TenantId,
    period_type: PeriodType,
    period_start: Date,
    connection: &Connection,
) -> Result<usize, Error> {
    connection
        .execute(
            "DELETE FROM trend_cube
             WHERE tenant_id = ?1 AND period_type = ?2 AND period_start = ?3",
            params![tenant.as_i64(), period_type, period_start],
        )
        .map_err(|error| error.into())
}

/// Delete every cube row for the tenant whose period starts strictly before
/// `cutoff`. Returns the number of rows removed.
pub(crate) fn delete_rows_before(
    tenant: TenantId,
    cutoff: Date,
    connection: &Connection,
) -> Result<usize, Error> {
    connection
        .execute(
            "DELETE FROM trend_cube WHERE tenant_id = ?1 AND period_start < ?2",
            params![tenant.as_i64(), cutoff],
        )
        .map_err(|error| error.into())
}

/// Delete every cube row for the tenant. Returns the number of rows removed.
pub(crate) fn delete_all_rows(tenant: TenantId, connection: &Connection) -> Result<usize, Error> {
    connection
        .execute(
            "DELETE FROM trend_cube WHERE tenant_id = ?1",
            params![tenant.as_i64()],
        )
        .map_err(|error| error.into())
}

/// Selects stored cube rows for one tenant and granularity.
pub(crate) struct CubeRowQuery {
    /// The stored granularity to read.
    pub period_type: PeriodType,
    /// Include rows whose period overlaps `[start, end]`.
    pub start: Date,
    /// See `start`.
    pub end: Date,
    /// Only include rows with this transaction type.
    pub transaction_type: Option<TransactionType>,
    /// Only include rows with this category.
    pub category_id: Option<DatabaseID>,
    /// Only include rows for this account.
    pub account_id: Option<DatabaseID>,
    /// Only include rows with this recurring flag.
    pub recurring: Option<bool>,
}

impl CubeRowQuery {
    /// A query over the period range with no dimension filters.
    pub fn range(period_type: PeriodType, start: Date, end: Date) -> Self {
        Self {
            period_type,
            start,
            end,
            transaction_type: None,
            category_id: None,
            account_id: None,
            recurring: None,
        }
    }
}

/// Query stored cube rows, ordered by period start ascending and then by the
/// dimension tuple for a deterministic order within one period.
pub(crate) fn query_rows(
    tenant: TenantId,
    query: CubeRowQuery,
    connection: &Connection,
) -> Result<Vec<CubeRow>, Error> {
    let mut where_clause_parts = vec![
        "tenant_id = ?1".to_string(),
        "period_type = ?2".to_string(),
        "period_end >= ?3".to_string(),
        "period_start <= ?4".to_string(),
    ];
    let mut query_parameters = vec![
        Value::Integer(tenant.as_i64()),
        Value::Text(query.period_type.as_str().to_string()),
        Value::Text(query.start.to_string()),
        Value::Text(query.end.to_string()),
    ];

    if let Some(transaction_type) = query.transaction_type {
        where_clause_parts.push(format!("transaction_type = ?{}", query_parameters.len() + 1));
        query_parameters.push(Value::Text(transaction_type.as_str().to_string()));
    }

    if let Some(category_id) = query.category_id {
        where_clause_parts.push(format!("category_id = ?{}", query_parameters.len() + 1));
        query_parameters.push(Value::Integer(category_id));
    }

    if let Some(account_id) = query.account_id {
        where_clause_parts.push(format!("account_id = ?{}", query_parameters.len() + 1));
        query_parameters.push(Value::Integer(account_id));
    }

    if let Some(recurring) = query.recurring {
        where_clause_parts.push(format!("is_recurring = ?{}", query_parameters.len() + 1));
        query_parameters.push(Value::Integer(recurring as i64));
    }

    let query_string = format!(
        "SELECT {CUBE_COLUMNS} FROM trend_cube
         WHERE {}
         ORDER BY period_start ASC, transaction_type ASC, category_id ASC,
                  account_id ASC, is_recurring ASC",
        where_clause_parts.join(" AND ")
    );

    connection
        .prepare(&query_string)?
        .query_map(params_from_iter(query_parameters.iter()), CubeRow::map_row)?
        .map(|row| row.map_err(Error::SqlError))
        .collect()
}

/// Summary statistics of the tenant's cube coverage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CubeStats {
    /// Total number of cube rows for the tenant.
    pub total_records: i64,
    /// Number of weekly rows.
    pub weekly_records: i64,
    /// Number of monthly rows.
    pub monthly_records: i64,
    /// The earliest period start and latest period end with any coverage,
    /// or `None` when the cube is empty for the tenant.
    pub date_range: Option<(Date, Date)>,
}

/// Report how much cube coverage the tenant currently has.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error.
pub fn get_cube_stats(tenant: TenantId, connection: &Connection) -> Result<CubeStats, Error> {
    connection
        .query_row(
            "SELECT COUNT(*),
                    SUM(CASE WHEN period_type = 'WEEKLY' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN period_type = 'MONTHLY' THEN 1 ELSE 0 END),
                    MIN(period_start),
                    MAX(period_end)
             FROM trend_cube WHERE tenant_id = ?1",
            params![tenant.as_i64()],
            |row| {
                let earliest: Option<Date> = row.get(3)?;
                let latest: Option<Date> = row.get(4)?;

                Ok(CubeStats {
                    total_records: row.get(0)?,
                    weekly_records: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    monthly_records: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    date_range: earliest.zip(latest),
                })
            },
        )
        .map_err(|error| error.into())
}
