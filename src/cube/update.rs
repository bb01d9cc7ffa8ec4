//! Keeps the cube hot as the ledger is mutated.
//!
//! The application's mutation path calls [apply_change] (or [apply_changes]
//! for bulk edits) in the same logical unit of work as the ledger write.
//! Every affected bucket is recomputed from the ledger slice it represents,
//! never adjusted with increment/decrement arithmetic: a recompute converges
//! to the correct value regardless of how concurrent or out-of-order
//! mutations interleave, while a delta bakes any earlier drift in forever.

use std::collections::BTreeSet;

use rusqlite::Connection;

use crate::{
    Error,
    cube::store::{BucketWrite, replace_bucket},
    ledger::{
        DimensionKey, DimensionSlice, LedgerChange, account_name, aggregate_slice, category_name,
    },
    period::{Period, PeriodType},
    tenant::TenantId,
};

/// Recompute the cube buckets affected by one ledger mutation.
///
/// For an edit that moved the transaction between buckets, both the old and
/// the new bucket are recomputed and written in one SQL transaction, so a
/// concurrent reader never sees only one side of the move.
///
/// Returns the number of buckets recomputed.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error; no
/// bucket write is applied in that case.
pub fn apply_change(
    tenant: TenantId,
    change: &LedgerChange,
    connection: &Connection,
) -> Result<usize, Error> {
    apply_changes(tenant, std::slice::from_ref(change), connection)
}

/// Recompute the cube buckets affected by a batch of ledger mutations.
///
/// The distinct (period, dimension tuple) buckets across all changes are
/// collected first and each is recomputed exactly once, so a bulk edit
/// touching a thousand transactions in one month costs a handful of bucket
/// recomputes rather than a thousand.
///
/// Returns the number of distinct buckets recomputed.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error; no
/// bucket write is applied in that case.
pub fn apply_changes(
    tenant: TenantId,
    changes: &[LedgerChange],
    connection: &Connection,
) -> Result<usize, Error> {
    let mut buckets: BTreeSet<(PeriodType, Period, DimensionKey)> = BTreeSet::new();

    for change in changes {
        for facts in change.facts() {
            buckets.insert((PeriodType::Weekly, Period::week_of(facts.date), facts.key()));
            buckets.insert((PeriodType::Monthly, Period::month_of(facts.date), facts.key()));
        }
    }

    if buckets.is_empty() {
        return Ok(0);
    }

    let sql_transaction = connection.unchecked_transaction()?;

    for &(period_type, period, key) in &buckets {
        recompute_bucket(tenant, period_type, period, key, &sql_transaction)?;
    }

    sql_transaction.commit()?;

    tracing::debug!(
        "recomputed {} bucket(s) for {} ledger change(s) for tenant {}",
        buckets.len(),
        changes.len(),
        tenant
    );

    Ok(buckets.len())
}

/// Re-derive one bucket from its ledger slice and store the result.
fn recompute_bucket(
    tenant: TenantId,
    period_type: PeriodType,
    period: Period,
    key: DimensionKey,
    connection: &Connection,
) -> Result<BucketWrite, Error> {
    let (total_amount, transaction_count) = aggregate_slice(tenant, period, key, connection)?;

    // Name snapshots are only needed when a row will actually be written.
    let (category_name, account_name) = if transaction_count > 0 {
        let category = match key.category_id {
            Some(id) => category_name(id, connection)?,
            None => None,
        };

        (category, account_name(key.account_id, connection)?)
    } else {
        (None, None)
    };

    replace_bucket(
        tenant,
        period_type,
        period,
        &DimensionSlice {
            key,
            category_name,
            account_name,
            total_amount,
            transaction_count,
        },
        connection,
    )
}

#[cfg(test)]
mod update_tests {
    use time::macros::date;

    use crate::{
        cube::{
            populate::{PopulateOptions, populate},
            store::{CubeRow, CubeRowQuery, query_rows, replace_bucket},
        },
        ledger::{
            DimensionSlice, create_account, create_category, create_transaction,
            delete_transaction, delete_transactions_before,
            test_fixtures::{expense, insert, test_connection},
            update_transaction,
        },
        period::{Period, PeriodType},
        tenant::TenantId,
    };

    use super::{apply_change, apply_changes};

    fn monthly_rows(tenant: TenantId, month: Period, connection: &rusqlite::Connection) -> Vec<CubeRow> {
        query_rows(
            tenant,
            CubeRowQuery::range(PeriodType::Monthly, month.start, month.end),
            connection,
        )
        .unwrap()
    }

    #[test]
    fn create_builds_week_and_month_buckets() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();

        let (_, change) = create_transaction(
            tenant,
            expense(date!(2024 - 08 - 14), -40.0, None, checking, false),
            &connection,
        )
        .unwrap();
        let recomputed = apply_change(tenant, &change, &connection).unwrap();

        assert_eq!(recomputed, 2);
        let monthly = monthly_rows(tenant, Period::month_of(date!(2024 - 08 - 01)), &connection);
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].total_amount, -40.0);
        let weekly = query_rows(
            tenant,
            CubeRowQuery::range(PeriodType::Weekly, date!(2024 - 08 - 12), date!(2024 - 08 - 18)),
            &connection,
        )
        .unwrap();
        assert_eq!(weekly.len(), 1);
        assert_eq!(weekly[0].transaction_count, 1);
    }

    #[test]
    fn moved_transaction_corrects_both_buckets() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        let groceries = create_category(tenant, "Groceries", &connection).unwrap();
        let dining = create_category(tenant, "Dining", &connection).unwrap();

        // A second groceries expense keeps the February bucket alive after
        // the move so the decrease is observable.
        let (_, change) = insert(
            tenant,
            expense(date!(2024 - 02 - 20), -55.0, Some(groceries), checking, false),
            &connection,
        );
        apply_change(tenant, &change, &connection).unwrap();
        let (id, change) = insert(
            tenant,
            expense(date!(2024 - 02 - 10), -100.0, Some(groceries), checking, false),
            &connection,
        );
        apply_change(tenant, &change, &connection).unwrap();

        let february = Period::month_of(date!(2024 - 02 - 01));
        let before = monthly_rows(tenant, february, &connection);
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].total_amount, -155.0);
        assert_eq!(before[0].transaction_count, 2);

        let change = update_transaction(
            tenant,
            id,
            expense(date!(2024 - 03 - 05), -100.0, Some(dining), checking, false),
            &connection,
        )
        .unwrap();
        apply_change(tenant, &change, &connection).unwrap();

        let after = monthly_rows(tenant, february, &connection);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].total_amount, -55.0);
        assert_eq!(after[0].transaction_count, 1);

        let march = monthly_rows(tenant, Period::month_of(date!(2024 - 03 - 01)), &connection);
        assert_eq!(march.len(), 1);
        assert_eq!(march[0].category_id, Some(dining));
        assert_eq!(march[0].total_amount, -100.0);
        assert_eq!(march[0].transaction_count, 1);
    }

    #[test]
    fn deleting_the_last_transaction_removes_the_bucket() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        let (id, change) = insert(
            tenant,
            expense(date!(2024 - 08 - 14), -40.0, None, checking, false),
            &connection,
        );
        apply_change(tenant, &change, &connection).unwrap();

        let change = delete_transaction(tenant, id, &connection).unwrap();
        apply_change(tenant, &change, &connection).unwrap();

        let monthly = monthly_rows(tenant, Period::month_of(date!(2024 - 08 - 01)), &connection);
        assert!(monthly.is_empty(), "empty buckets must be deleted, not zeroed");
    }

    #[test]
    fn bulk_changes_recompute_each_distinct_bucket_once() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        // Three transactions in the same ISO week and month, same tuple:
        // two distinct buckets in total.
        let changes: Vec<_> = [date!(2024 - 08 - 13), date!(2024 - 08 - 14), date!(2024 - 08 - 15)]
            .into_iter()
            .map(|day| insert(tenant, expense(day, -10.0, None, checking, false), &connection).1)
            .collect();

        let recomputed = apply_changes(tenant, &changes, &connection).unwrap();

        assert_eq!(recomputed, 2);
        let monthly = monthly_rows(tenant, Period::month_of(date!(2024 - 08 - 01)), &connection);
        assert_eq!(monthly[0].total_amount, -30.0);
        assert_eq!(monthly[0].transaction_count, 3);
    }

    #[test]
    fn bulk_delete_changes_flow_through_the_updater() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        for day in [date!(2024 - 01 - 10), date!(2024 - 02 - 10), date!(2024 - 06 - 10)] {
            let (_, change) = insert(
                tenant,
                expense(day, -10.0, None, checking, false),
                &connection,
            );
            apply_change(tenant, &change, &connection).unwrap();
        }

        let changes =
            delete_transactions_before(tenant, date!(2024 - 06 - 01), &connection).unwrap();
        apply_changes(tenant, &changes, &connection).unwrap();

        assert!(monthly_rows(tenant, Period::month_of(date!(2024 - 01 - 01)), &connection).is_empty());
        assert!(monthly_rows(tenant, Period::month_of(date!(2024 - 02 - 01)), &connection).is_empty());
        let june = monthly_rows(tenant, Period::month_of(date!(2024 - 06 - 01)), &connection);
        assert_eq!(june.len(), 1);
    }

    #[test]
    fn apply_changes_with_no_changes_is_a_noop() {
        let connection = test_connection();

        let recomputed = apply_changes(TenantId::new(1), &[], &connection).unwrap();

        assert_eq!(recomputed, 0);
    }

    #[test]
    fn recompute_repairs_pre_existing_drift() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        let (_, change) = insert(
            tenant,
            expense(date!(2024 - 08 - 14), -40.0, None, checking, false),
            &connection,
        );
        apply_change(tenant, &change, &connection).unwrap();

        // Corrupt the monthly bucket behind the updater's back.
        let august = Period::month_of(date!(2024 - 08 - 01));
        let mut drifted = monthly_rows(tenant, august, &connection)[0].clone();
        drifted.total_amount = -9999.0;
        replace_bucket(
            tenant,
            PeriodType::Monthly,
            august,
            &DimensionSlice {
                key: drifted.key(),
                category_name: drifted.category_name.clone(),
                account_name: drifted.account_name.clone(),
                total_amount: drifted.total_amount,
                transaction_count: drifted.transaction_count,
            },
            &connection,
        )
        .unwrap();

        // Any mutation touching the bucket re-derives it from the ledger.
        let (_, change) = insert(
            tenant,
            expense(date!(2024 - 08 - 20), -10.0, None, checking, false),
            &connection,
        );
        apply_change(tenant, &change, &connection).unwrap();

        let repaired = monthly_rows(tenant, august, &connection);
        assert_eq!(repaired[0].total_amount, -50.0);
        assert_eq!(repaired[0].transaction_count, 2);
    }

    #[test]
    fn updater_and_populator_agree_on_bucket_boundaries() {
        let connection = test_connection();
        let tenant = TenantId::new(1);
        let checking = create_account(tenant, "Checking", &connection).unwrap();
        // Sep 1 2024 is a Sunday: its ISO week starts in August.
        let (_, change) = insert(
            tenant,
            expense(date!(2024 - 09 - 01), -70.0, None, checking, false),
            &connection,
        );
        apply_change(tenant, &change, &connection).unwrap();
        let incremental = query_rows(
            tenant,
            CubeRowQuery::range(PeriodType::Weekly, date!(2024 - 08 - 26), date!(2024 - 09 - 01)),
            &connection,
        )
        .unwrap();

        populate(
            tenant,
            PopulateOptions {
                start_date: Some(date!(2024 - 09 - 01)),
                end_date: Some(date!(2024 - 09 - 30)),
                clear_existing: true,
                ..Default::default()
            },
            &connection,
        )
        .unwrap();
        let populated = query_rows(
            tenant,
            CubeRowQuery::range(PeriodType::Weekly, date!(2024 - 08 - 26), date!(2024 - 09 - 01)),
            &connection,
        )
        .unwrap();

        assert_eq!(incremental.len(), 1);
        assert_eq!(populated.len(), 1);
        assert_eq!(incremental[0].period, populated[0].period);
        assert_eq!(incremental[0].total_amount, populated[0].total_amount);
    }
}
