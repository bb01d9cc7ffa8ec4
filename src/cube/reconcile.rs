//! Detects and purges cube rows that no longer reflect the ledger.
//!
//! This module is the single home for the drift tooling that tends to get
//! reinvented per incident: stale-row cleanup after bulk ledger deletion,
//! and cube-versus-ledger diffing. [verify] only ever *reports* drift —
//! auto-correcting here would mask whatever bug in the update path caused
//! the drift in the first place. Repair is an explicit, separate step: a
//! scoped populate, or re-running the updater for the affected buckets.

use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use time::Date;

use crate::{
    Error,
    cube::store::{CubeRowQuery, delete_all_rows, delete_rows_before, query_rows},
    ledger::{DimensionKey, aggregate_period, earliest_transaction_date},
    period::{Period, PeriodType, STORED_PERIOD_TYPES, periods_covering},
    tenant::TenantId,
};

/// Amounts closer than this are considered equal when diffing the cube
/// against the ledger.
const AMOUNT_EPSILON: f64 = 1e-6;

/// One (period, dimension tuple) bucket where the cube and the ledger
/// disagree.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Discrepancy {
    /// The granularity of the bucket.
    pub period_type: PeriodType,
    /// The calendar bounds of the bucket.
    pub period: Period,
    /// The dimension tuple of the bucket.
    pub key: DimensionKey,
    /// The amount stored in the cube; zero when the cube has no row.
    pub cube_amount: f64,
    /// The amount a direct ledger aggregation yields.
    pub ledger_amount: f64,
    /// The count stored in the cube; zero when the cube has no row.
    pub cube_count: i64,
    /// The count a direct ledger aggregation yields.
    pub ledger_count: i64,
}

/// Delete every cube row whose period starts before the tenant's earliest
/// ledger transaction.
///
/// This is the cleanup step after old transactions are bulk-deleted, e.g.
/// when a demo tenant is re-seeded with a later start date. A weekly row
/// whose period merely *straddles* the new earliest date is also removed;
/// the caller is responsible for running a populate over the uncovered
/// range afterwards if coverage there is still wanted.
///
/// Returns the number of rows removed. A tenant with an empty ledger has
/// every cube row removed.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error.
pub fn purge_stale(tenant: TenantId, connection: &Connection) -> Result<usize, Error> {
    let removed = match earliest_transaction_date(tenant, connection)? {
        Some(earliest) => delete_rows_before(tenant, earliest, connection)?,
        None => delete_all_rows(tenant, connection)?,
    };

    tracing::info!("purged {} stale cube row(s) for tenant {}", removed, tenant);

    Ok(removed)
}

/// Diff the cube against a direct ledger aggregation over a date window.
///
/// Every weekly and monthly period intersecting `[period_start, period_end]`
/// is checked: each dimension tuple present on either side is compared, and
/// every mismatch is returned (a missing side reports zero amount and
/// count). Nothing is corrected here; a non-empty result means some
/// mutation path failed to notify the updater and should be treated as a
/// defect signal.
///
/// # Errors
/// This function will return a:
/// - [Error::InvalidDateRange] if `period_start` is later than `period_end`,
/// - or [Error::SqlError] if there is an unexpected SQL error.
pub fn verify(
    tenant: TenantId,
    period_start: Date,
    period_end: Date,
    connection: &Connection,
) -> Result<Vec<Discrepancy>, Error> {
    if period_start > period_end {
        return Err(Error::InvalidDateRange {
            start: period_start,
            end: period_end,
        });
    }

    let mut discrepancies = Vec::new();

    for period_type in STORED_PERIOD_TYPES {
        for period in periods_covering(period_start, period_end, period_type) {
            compare_period(tenant, period_type, period, connection, &mut discrepancies)?;
        }
    }

    if discrepancies.is_empty() {
        tracing::info!(
            "cube verified clean for tenant {} over {} to {}",
            tenant,
            period_start,
            period_end
        );
    } else {
        tracing::warn!(
            "found {} cube discrepancies for tenant {} over {} to {}",
            discrepancies.len(),
            tenant,
            period_start,
            period_end
        );
    }

    Ok(discrepancies)
}

fn compare_period(
    tenant: TenantId,
    period_type: PeriodType,
    period: Period,
    connection: &Connection,
    discrepancies: &mut Vec<Discrepancy>,
) -> Result<(), Error> {
    let mut ledger_side: BTreeMap<DimensionKey, (f64, i64)> = BTreeMap::new();
    for slice in aggregate_period(tenant, period, connection)? {
        ledger_side.insert(slice.key, (slice.total_amount, slice.transaction_count));
    }

    let mut cube_side: BTreeMap<DimensionKey, (f64, i64)> = BTreeMap::new();
    for row in query_rows(
        tenant,
        CubeRowQuery::range(period_type, period.start, period.start),
        connection,
    )? {
        cube_side.insert(row.key(), (row.total_amount, row.transaction_count));
    }

    let keys: std::collections::BTreeSet<DimensionKey> =
        ledger_side.keys().chain(cube_side.keys()).copied().collect();

    for key in keys {
        let (ledger_amount, ledger_count) = ledger_side.get(&key).copied().unwrap_or((0.0, 0));
        let (cube_amount, cube_count) = cube_side.get(&key).copied().unwrap_or((0.0, 0));

        if (cube_amount - ledger_amount).abs() > AMOUNT_EPSILON || cube_count != ledger_count {
            tracing::warn!(
                "cube drift for tenant {} in {} period starting {}: \
                 cube {:.2}/{} vs ledger {:.2}/{}",
                tenant,
                period_type,
                period.start,
                cube_amount,
                cube_count,
                ledger_amount,
                ledger_count
            );

            discrepancies.push(Discrepancy {
                period_type,
                period,
                key,
                cube_amount,
                ledger_amount,
                cube_count,
                ledger_count,
            });
        }
    }

    Ok(())
}
