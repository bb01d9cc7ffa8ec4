//! Bulk (re)build of cube rows from the ledger.
//!
//! Used to bootstrap the cube for a tenant, to backfill after downtime, and
//! to rebuild a range after bulk ledger surgery. Periods are committed in
//! batches so a failure or cancellation part-way through loses nothing that
//! was already committed: each committed period is independently
//! self-consistent, and the caller can simply retry for the remaining range.

use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Serialize;
use time::{Date, OffsetDateTime};

use crate::{
    Error,
    cube::store::{BucketWrite, delete_period_rows, replace_bucket},
    ledger::{aggregate_period, earliest_transaction_date},
    period::{Period, PeriodType, STORED_PERIOD_TYPES, periods_covering},
    tenant::TenantId,
};

/// How many periods are recomputed per write transaction when no explicit
/// batch size is given.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Options controlling a [populate] run.
#[derive(Clone, Debug, PartialEq)]
pub struct PopulateOptions {
    /// The start of the range to rebuild. Defaults to the tenant's earliest
    /// ledger transaction date.
    pub start_date: Option<Date>,
    /// The end of the range to rebuild. Defaults to today.
    pub end_date: Option<Date>,
    /// When set, each period's existing rows are deleted before the period
    /// is rebuilt, which also removes rows for dimension tuples that no
    /// longer appear in the ledger. When unset, only the tuples currently
    /// present in the ledger are rewritten (the retry-friendly mode).
    pub clear_existing: bool,
    /// How many periods to commit per write transaction.
    pub batch_size: usize,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            clear_existing: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// What a [populate] run did.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PopulateSummary {
    /// The number of (granularity, period) pairs recomputed.
    pub periods_processed: usize,
    /// The number of cube rows written.
    pub records_created: usize,
    /// Wall-clock duration of the run.
    pub time_elapsed: Duration,
}

/// Rebuild the tenant's weekly and monthly cube rows for a date range.
///
/// Both granularities are always computed. Each period is rebuilt from a
/// fresh ledger aggregation and committed with its batch; re-running over an
/// unchanged ledger yields an identical row set, so a partially failed run
/// can be retried as-is.
///
/// # Errors
/// This function will return a:
/// - [Error::EmptyLedger] if no range was given and the tenant has no
///   transactions,
/// - [Error::InvalidDateRange] if the effective range is inverted,
/// - or [Error::SqlError] if there is an unexpected SQL error. Periods
///   committed before the error remain valid and queryable.
pub fn populate(
    tenant: TenantId,
    options: PopulateOptions,
    connection: &Connection,
) -> Result<PopulateSummary, Error> {
    let started = Instant::now();

    let start = match options.start_date {
        Some(date) => date,
        None => earliest_transaction_date(tenant, connection)?
            .ok_or(Error::EmptyLedger(tenant))?,
    };
    let end = options
        .end_date
        .unwrap_or_else(|| OffsetDateTime::now_utc().date());

    if start > end {
        return Err(Error::InvalidDateRange { start, end });
    }

    let periods: Vec<(PeriodType, Period)> = STORED_PERIOD_TYPES
        .into_iter()
        .flat_map(|period_type| {
            periods_covering(start, end, period_type)
                .into_iter()
                .map(move |period| (period_type, period))
        })
        .collect();

    let mut periods_processed = 0;
    let mut records_created = 0;

    for batch in periods.chunks(options.batch_size.max(1)) {
        let sql_transaction = connection.unchecked_transaction()?;

        for &(period_type, period) in batch {
            if options.clear_existing {
                delete_period_rows(tenant, period_type, period.start, &sql_transaction)?;
            }

            for slice in aggregate_period(tenant, period, &sql_transaction)? {
                let outcome =
                    replace_bucket(tenant, period_type, period, &slice, &sql_transaction)?;

                if outcome == BucketWrite::Written {
                    records_created += 1;
                }
            }

            periods_processed += 1;
        }

        sql_transaction.commit()?;
        tracing::debug!(
            "committed a batch of {} period(s) for tenant {}",
            batch.len(),
            tenant
        );
    }

    let summary = PopulateSummary {
        periods_processed,
        records_created,
        time_elapsed: started.elapsed(),
    };

    tracing::info!(
        "populated {} period(s) with {} cube row(s) for tenant {} in {:?}",
        summary.periods_processed,
        summary.records_created,
        tenant,
        summary.time_elapsed
    );

    Ok(summary)
}

#[cfg(test)]
mod populate_tests {
    use time::macros::date;

    use crate::{
        Error,
        cube::store::{CubeRow, CubeRowQuery, query_rows},
        ledger::{
            create_account, create_category, delete_transaction,
            test_fixtures::{expense, insert, test_connection},
        },
        period::PeriodType,
        tenant::TenantId,
    };

    use super::{PopulateOptions, populate};

    fn august_options() -> PopulateOptions {
        PopulateOptions {
            start_date: Some(date!(2024 - 08 - 01)),
            end_date: Some(date!(2024 - 08 - 31)),
            ..Default::default()
        }
    }

    /// Strip the write timestamps so row sets can be compared across runs.
    fn row_fingerprints(rows: &[CubeRow]) -> Vec<(PeriodType, String, String, f64, i64)> {
        rows.iter()
            .map(|row| {
                (
                    row.period_type,
                    row.period.start.to_string(),
                    format!("{:?}", row.key()),
                    row.total_amount,
                    row.transaction_count,
                )
            })
            .collect()
    }

    #[test]
    fn populate_worked_august_example() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        let groceries = create_category(tenant, "Groceries", &connection).unwrap();
        let rent = create_category(tenant, "Rent", &connection).unwrap();
        insert(
            tenant,
            expense(date!(2024 - 08 - 03), -40.0, Some(groceries), checking, false),
            &connection,
        );
        insert(
            tenant,
            expense(date!(2024 - 08 - 01), -788.76, Some(rent), checking, true),
            &connection,
        );

        let summary = populate(tenant, august_options(), &connection).unwrap();

        // Aug 2024 intersects 5 ISO weeks and 1 month.
        assert_eq!(summary.periods_processed, 6);

        let monthly = query_rows(
            tenant,
            CubeRowQuery::range(PeriodType::Monthly, date!(2024 - 08 - 01), date!(2024 - 08 - 31)),
            &connection,
        )
        .unwrap();

        assert_eq!(monthly.len(), 2);
        let rent_row = monthly.iter().find(|row| row.recurring).unwrap();
        let groceries_row = monthly.iter().find(|row| !row.recurring).unwrap();
        assert_eq!(rent_row.total_amount, -788.76);
        assert_eq!(rent_row.transaction_count, 1);
        assert_eq!(rent_row.category_name.as_deref(), Some("Rent"));
        assert_eq!(groceries_row.total_amount, -40.0);
        assert_eq!(groceries_row.transaction_count, 1);
        assert_eq!(groceries_row.account_name.as_deref(), Some("Checking"));
    }

    #[test]
    fn populate_is_idempotent() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        insert(
            tenant,
            expense(date!(2024 - 08 - 03), -40.0, None, checking, false),
            &connection,
        );
        insert(
            tenant,
            expense(date!(2024 - 08 - 20), -25.0, None, checking, true),
            &connection,
        );

        populate(tenant, august_options(), &connection).unwrap();
        let first_run: Vec<_> = [PeriodType::Weekly, PeriodType::Monthly]
            .into_iter()
            .flat_map(|period_type| {
                query_rows(
                    tenant,
                    CubeRowQuery::range(period_type, date!(2024 - 07 - 01), date!(2024 - 09 - 30)),
                    &connection,
                )
                .unwrap()
            })
            .collect();

        populate(tenant, august_options(), &connection).unwrap();
        let second_run: Vec<_> = [PeriodType::Weekly, PeriodType::Monthly]
            .into_iter()
            .flat_map(|period_type| {
                query_rows(
                    tenant,
                    CubeRowQuery::range(period_type, date!(2024 - 07 - 01), date!(2024 - 09 - 30)),
                    &connection,
                )
                .unwrap()
            })
            .collect();

        assert_eq!(row_fingerprints(&first_run), row_fingerprints(&second_run));
    }

    #[test]
    fn populate_defaults_range_to_ledger_history() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        insert(
            tenant,
            expense(date!(2024 - 05 - 10), -15.0, None, checking, false),
            &connection,
        );

        let summary = populate(tenant, PopulateOptions::default(), &connection).unwrap();

        assert!(summary.periods_processed > 0);
        let monthly = query_rows(
            tenant,
            CubeRowQuery::range(PeriodType::Monthly, date!(2024 - 05 - 01), date!(2024 - 05 - 31)),
            &connection,
        )
        .unwrap();
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].total_amount, -15.0);
    }

    #[test]
    fn populate_without_range_fails_for_empty_ledger() {
        let connection = test_connection();
        let tenant = TenantId::new(1);

        let result = populate(tenant, PopulateOptions::default(), &connection);

        assert_eq!(result, Err(Error::EmptyLedger(tenant)));
    }

    #[test]
    fn populate_rejects_inverted_range() {
        let connection = test_connection();

        let result = populate(
            TenantId::new(1),
            PopulateOptions {
                start_date: Some(date!(2024 - 08 - 31)),
                end_date: Some(date!(2024 - 08 - 01)),
                ..Default::default()
            },
            &connection,
        );

        assert_eq!(
            result,
            Err(Error::InvalidDateRange {
                start: date!(2024 - 08 - 31),
                end: date!(2024 - 08 - 01),
            })
        );
    }

    #[test]
    fn populate_only_touches_requested_range() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        insert(
            tenant,
            expense(date!(2024 - 02 - 10), -10.0, None, checking, false),
            &connection,
        );
        insert(
            tenant,
            expense(date!(2024 - 05 - 10), -20.0, None, checking, false),
            &connection,
        );

        populate(
            tenant,
            PopulateOptions {
                start_date: Some(date!(2024 - 02 - 01)),
                end_date: Some(date!(2024 - 02 - 29)),
                ..Default::default()
            },
            &connection,
        )
        .unwrap();

        let may_rows = query_rows(
            tenant,
            CubeRowQuery::range(PeriodType::Monthly, date!(2024 - 05 - 01), date!(2024 - 05 - 31)),
            &connection,
        )
        .unwrap();
        assert!(may_rows.is_empty());
    }

    #[test]
    fn clear_existing_removes_tuples_gone_from_the_ledger() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        let groceries = create_category(tenant, "Groceries", &connection).unwrap();
        let (id, _) = insert(
            tenant,
            expense(date!(2024 - 08 - 03), -40.0, Some(groceries), checking, false),
            &connection,
        );
        insert(
            tenant,
            expense(date!(2024 - 08 - 10), -10.0, None, checking, false),
            &connection,
        );
        populate(tenant, august_options(), &connection).unwrap();

        // Mutate the ledger without notifying the updater, then rebuild.
        delete_transaction(tenant, id, &connection).unwrap();
        populate(
            tenant,
            PopulateOptions {
                clear_existing: true,
                ..august_options()
            },
            &connection,
        )
        .unwrap();

        let monthly = query_rows(
            tenant,
            CubeRowQuery::range(PeriodType::Monthly, date!(2024 - 08 - 01), date!(2024 - 08 - 31)),
            &connection,
        )
        .unwrap();
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].category_id, None);
    }

    #[test]
    fn plain_populate_leaves_stale_tuples_in_place() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        let groceries = create_category(tenant, "Groceries", &connection).unwrap();
        let (id, _) = insert(
            tenant,
            expense(date!(2024 - 08 - 03), -40.0, Some(groceries), checking, false),
            &connection,
        );
        populate(tenant, august_options(), &connection).unwrap();

        delete_transaction(tenant, id, &connection).unwrap();
        populate(tenant, august_options(), &connection).unwrap();

        // The groceries tuple no longer exists in the ledger, but without
        // clear_existing the stale row survives for the reconciler to find.
        let monthly = query_rows(
            tenant,
            CubeRowQuery::range(PeriodType::Monthly, date!(2024 - 08 - 01), date!(2024 - 08 - 31)),
            &connection,
        )
        .unwrap();
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].category_id, Some(groceries));
    }

    #[test]
    fn batch_size_does_not_change_the_result() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        for day in [date!(2024 - 06 - 05), date!(2024 - 07 - 15), date!(2024 - 08 - 25)] {
            insert(tenant, expense(day, -30.0, None, checking, false), &connection);
        }
        let range = PopulateOptions {
            start_date: Some(date!(2024 - 06 - 01)),
            end_date: Some(date!(2024 - 08 - 31)),
            ..Default::default()
        };

        populate(tenant, range.clone(), &connection).unwrap();
        let default_batches: Vec<_> = query_rows(
            tenant,
            CubeRowQuery::range(PeriodType::Monthly, date!(2024 - 06 - 01), date!(2024 - 08 - 31)),
            &connection,
        )
        .unwrap();

        populate(
            tenant,
            PopulateOptions {
                batch_size: 1,
                clear_existing: true,
                ..range
            },
            &connection,
        )
        .unwrap();
        let single_batches: Vec<_> = query_rows(
            tenant,
            CubeRowQuery::range(PeriodType::Monthly, date!(2024 - 06 - 01), date!(2024 - 08 - 31)),
            &connection,
        )
        .unwrap();

        assert_eq!(
            row_fingerprints(&default_batches),
            row_fingerprints(&single_batches)
        );
    }
}
