//! Serves trend queries from the materialized rows.
//!
//! Weekly and monthly trends are a straight filtered read of the cube table.
//! Quarterly and yearly trends are derived by folding the stored monthly
//! rows into calendar quarter/year buckets per dimension tuple; nothing is
//! ever recomputed from the ledger on the read path.
//!
//! Missing periods are simply absent from the result: zero-filling a chart's
//! x-axis is a presentation concern, not this engine's.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::Serialize;
use time::Date;

use crate::{
    Error,
    cube::store::{CubeRow, CubeRowQuery, query_rows},
    db::DatabaseID,
    ledger::{DimensionKey, TransactionType},
    period::{Period, PeriodType},
    tenant::TenantId,
};

/// A trend query over one granularity and date range.
#[derive(Clone, Debug, PartialEq)]
pub struct TrendQuery {
    /// The granularity to report at. Weekly and monthly are read directly;
    /// quarterly and yearly are derived from the monthly rows.
    pub period_type: PeriodType,
    /// The start of the date range (inclusive).
    pub start_date: Date,
    /// The end of the date range (inclusive).
    pub end_date: Date,
    /// Only include slices with this transaction type.
    pub transaction_type: Option<TransactionType>,
    /// Only include slices with this category.
    pub category_id: Option<DatabaseID>,
    /// Only include slices for this account.
    pub account_id: Option<DatabaseID>,
    /// Only include slices with this recurring flag.
    pub recurring: Option<bool>,
}

impl TrendQuery {
    /// A query over `[start_date, end_date]` with no dimension filters.
    pub fn new(period_type: PeriodType, start_date: Date, end_date: Date) -> Self {
        Self {
            period_type,
            start_date,
            end_date,
            transaction_type: None,
            category_id: None,
            account_id: None,
            recurring: None,
        }
    }
}

/// One aggregate row in a trend query result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrendRow {
    /// The granularity of the row.
    pub period_type: PeriodType,
    /// The first day of the row's period.
    pub period_start: Date,
    /// The last day of the row's period (inclusive).
    pub period_end: Date,
    /// The transaction type of the slice.
    pub transaction_type: TransactionType,
    /// The category of the slice, or `None` for uncategorized.
    pub category_id: Option<DatabaseID>,
    /// The category display name snapshot.
    pub category_name: Option<String>,
    /// The account of the slice.
    pub account_id: DatabaseID,
    /// The account display name snapshot.
    pub account_name: Option<String>,
    /// Whether the slice covers recurring transactions.
    pub recurring: bool,
    /// The signed sum of the slice's ledger amounts.
    pub total_amount: f64,
    /// The number of ledger transactions in the slice.
    pub transaction_count: i64,
}

impl TrendRow {
    fn from_cube_row(row: CubeRow) -> Self {
        Self {
            period_type: row.period_type,
            period_start: row.period.start,
            period_end: row.period.end,
            transaction_type: row.transaction_type,
            category_id: row.category_id,
            category_name: row.category_name,
            account_id: row.account_id,
            account_name: row.account_name,
            recurring: row.recurring,
            total_amount: row.total_amount,
            transaction_count: row.transaction_count,
        }
    }
}

/// Query aggregate trend rows for a tenant, ordered by period start
/// ascending (and by dimension tuple within one period).
///
/// Rows at the edges of the range reflect whatever ledger coverage exists;
/// a quarter with only one populated month reports that month's totals
/// against the full quarter's calendar bounds.
///
/// # Errors
/// This function will return a:
/// - [Error::InvalidDateRange] if `start_date` is later than `end_date`,
/// - or [Error::SqlError] if there is an unexpected SQL error.
pub fn get_trends(
    tenant: TenantId,
    query: &TrendQuery,
    connection: &Connection,
) -> Result<Vec<TrendRow>, Error> {
    if query.start_date > query.end_date {
        return Err(Error::InvalidDateRange {
            start: query.start_date,
            end: query.end_date,
        });
    }

    let read_granularity = match query.period_type {
        PeriodType::Weekly | PeriodType::Monthly => query.period_type,
        // Derived granularities are folded from the monthly rows.
        PeriodType::Quarterly | PeriodType::Yearly => PeriodType::Monthly,
    };

    let rows = query_rows(
        tenant,
        CubeRowQuery {
            period_type: read_granularity,
            start: query.start_date,
            end: query.end_date,
            transaction_type: query.transaction_type,
            category_id: query.category_id,
            account_id: query.account_id,
            recurring: query.recurring,
        },
        connection,
    )?;

    match query.period_type {
        PeriodType::Weekly | PeriodType::Monthly => {
            Ok(rows.into_iter().map(TrendRow::from_cube_row).collect())
        }
        PeriodType::Quarterly => Ok(roll_up(rows, PeriodType::Quarterly, Period::quarter_of)),
        PeriodType::Yearly => Ok(roll_up(rows, PeriodType::Yearly, Period::year_of)),
    }
}

/// Fold monthly rows into derived-period buckets per dimension tuple.
///
/// The rows arrive ordered by period start ascending, so the name snapshots
/// kept for each bucket are those of the latest contributing month.
fn roll_up(
    monthly_rows: Vec<CubeRow>,
    period_type: PeriodType,
    period_of: fn(Date) -> Period,
) -> Vec<TrendRow> {
    let mut buckets: BTreeMap<(Date, DimensionKey), TrendRow> = BTreeMap::new();

    for row in monthly_rows {
        let period = period_of(row.period.start);

        buckets
            .entry((period.start, row.key()))
            .and_modify(|bucket| {
                bucket.total_amount += row.total_amount;
                bucket.transaction_count += row.transaction_count;
                bucket.category_name = row.category_name.clone();
                bucket.account_name = row.account_name.clone();
            })
            .or_insert_with(|| TrendRow {
                period_type,
                period_start: period.start,
                period_end: period.end,
                transaction_type: row.transaction_type,
                category_id: row.category_id,
                category_name: row.category_name.clone(),
                account_id: row.account_id,
                account_name: row.account_name.clone(),
                recurring: row.recurring,
                total_amount: row.total_amount,
                transaction_count: row.transaction_count,
            });
    }

    buckets.into_values().collect()
}
