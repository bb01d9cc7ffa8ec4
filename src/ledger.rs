//! The transaction ledger, the system of record the cube aggregates over.
//!
//! The ledger tables are owned by the surrounding application: the cube only
//! ever reads them. This module defines the ledger-side models, the aggregate
//! queries the cube consumes, and the change notifications
//! ([LedgerChange]) that the application's mutation path hands to the
//! incremental updater. The mutation helpers here are the thin write path
//! used by tests, demo seeding and the maintenance CLI; each returns the
//! change record the caller is expected to forward to the updater.

use rusqlite::{
    Connection, OptionalExtension, Row, params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};
use time::Date;

use crate::{
    Error,
    db::{DatabaseID, MapRow},
    period::Period,
    tenant::TenantId,
};

/// The direction of money movement a transaction records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    /// Money earned.
    Income,
    /// Money spent.
    Expense,
    /// Money moved between the tenant's own accounts.
    Transfer,
}

impl TransactionType {
    /// The TEXT encoding used in the ledger and cube tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Income => "INCOME",
            TransactionType::Expense => "EXPENSE",
            TransactionType::Transfer => "TRANSFER",
        }
    }
}

impl Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.to_ascii_uppercase().as_str() {
            "INCOME" => Ok(TransactionType::Income),
            "EXPENSE" => Ok(TransactionType::Expense),
            "TRANSFER" => Ok(TransactionType::Transfer),
            _ => Err(Error::InvalidTransactionType(text.to_owned())),
        }
    }
}

impl ToSql for TransactionType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for TransactionType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}

/// The dimension tuple one cube row aggregates over.
///
/// A null category matches only a null category, so an uncategorized slice is
/// a bucket of its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DimensionKey {
    /// The transaction type of the slice.
    pub transaction_type: TransactionType,
    /// The category of the slice, or `None` for uncategorized transactions.
    pub category_id: Option<DatabaseID>,
    /// The account of the slice.
    pub account_id: DatabaseID,
    /// Whether the slice covers recurring transactions.
    pub recurring: bool,
}

/// The dimension-relevant values of one ledger transaction.
///
/// This is what the ledger's change notifications carry: enough to identify
/// every bucket the transaction contributes to, before and after a mutation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransactionFacts {
    /// When the transaction happened.
    pub date: Date,
    /// The signed amount; negative values are money spent.
    pub amount: f64,
    /// The direction of money movement.
    pub transaction_type: TransactionType,
    /// The category, or `None` for uncategorized.
    pub category_id: Option<DatabaseID>,
    /// The account the transaction happened on.
    pub account_id: DatabaseID,
    /// Whether the transaction is a recurring one.
    pub recurring: bool,
}

impl TransactionFacts {
    /// The dimension tuple these facts fall into.
    pub fn key(&self) -> DimensionKey {
        DimensionKey {
            transaction_type: self.transaction_type,
            category_id: self.category_id,
            account_id: self.account_id,
            recurring: self.recurring,
        }
    }
}

/// A change notification for one ledger transaction.
///
/// Emitted by the ledger's mutation path (including bulk operations, one
/// change per affected row) and consumed by
/// [apply_changes](crate::cube::update::apply_changes). If some mutation
/// class fails to emit these, the cube drifts until
/// [verify](crate::cube::reconcile::verify) catches it; drift is a defect
/// signal, never silently tolerated.
#[derive(Clone, Debug, PartialEq)]
pub enum LedgerChange {
    /// A transaction was inserted.
    Created(TransactionFacts),
    /// A transaction was edited; both the old and new values are carried so
    /// the updater can correct both affected buckets.
    Updated {
        /// The dimension values before the edit.
        before: TransactionFacts,
        /// The dimension values after the edit.
        after: TransactionFacts,
    },
    /// A transaction was removed.
    Deleted(TransactionFacts),
}

impl LedgerChange {
    /// Every facts value referenced by this change, old then new.
    pub fn facts(&self) -> Vec<&TransactionFacts> {
        match self {
            LedgerChange::Created(facts) | LedgerChange::Deleted(facts) => vec![facts],
            LedgerChange::Updated { before, after } => vec![before, after],
        }
    }
}

/// A transaction row in the ledger.
#[derive(Clone, Debug, PartialEq)]
pub struct LedgerTransaction {
    /// The ID of the transaction.
    pub id: DatabaseID,
    /// The tenant the transaction belongs to.
    pub tenant: TenantId,
    /// The dimension-relevant values of the transaction.
    pub facts: TransactionFacts,
    /// A text description of what the transaction was for.
    pub description: String,
}

impl MapRow for LedgerTransaction {
    type ReturnType = Self;

    fn map_row_with_offset(row: &Row, offset: usize) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(offset)?,
            tenant: TenantId::new(row.get(offset + 1)?),
            facts: TransactionFacts {
                account_id: row.get(offset + 2)?,
                category_id: row.get(offset + 3)?,
                date: row.get(offset + 4)?,
                amount: row.get(offset + 5)?,
                transaction_type: row.get(offset + 6)?,
                recurring: row.get(offset + 7)?,
            },
            description: row.get(offset + 8)?,
        })
    }
}

const TRANSACTION_COLUMNS: &str =
    "id, tenant_id, account_id, category_id, date, amount, transaction_type, is_recurring, \
     description";

/// The values needed to insert or rewrite one ledger transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTransaction {
    /// When the transaction happened.
    pub date: Date,
    /// The signed amount.
    pub amount: f64,
    /// The direction of money movement.
    pub transaction_type: TransactionType,
    /// The category, or `None` for uncategorized.
    pub category_id: Option<DatabaseID>,
    /// The account the transaction happened on.
    pub account_id: DatabaseID,
    /// Whether the transaction is a recurring one.
    pub recurring: bool,
    /// A text description of what the transaction was for.
    pub description: String,
}

impl NewTransaction {
    fn facts(&self) -> TransactionFacts {
        TransactionFacts {
            date: self.date,
            amount: self.amount,
            transaction_type: self.transaction_type,
            category_id: self.category_id,
            account_id: self.account_id,
            recurring: self.recurring,
        }
    }
}

/// Create the ledger tables if they do not already exist.
///
/// # Errors
/// Returns an error if a table could not be created.
pub fn create_ledger_tables(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS category (
            id INTEGER PRIMARY KEY,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL
            )",
        (),
    )?;

    connection.execute(
        "CREATE TABLE IF NOT EXISTS account (
            id INTEGER PRIMARY KEY,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL
            )",
        (),
    )?;

    connection.execute(
        "CREATE TABLE IF NOT EXISTS \"transaction\" (
            id INTEGER PRIMARY KEY,
            tenant_id INTEGER NOT NULL,
            account_id INTEGER NOT NULL,
            category_id INTEGER,
            date TEXT NOT NULL,
            amount REAL NOT NULL,
            transaction_type TEXT NOT NULL,
            is_recurring INTEGER NOT NULL DEFAULT 0,
            description TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(account_id) REFERENCES account(id),
            FOREIGN KEY(category_id) REFERENCES category(id)
                ON UPDATE CASCADE ON DELETE SET NULL
            )",
        (),
    )?;

    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_transaction_tenant_date
            ON \"transaction\" (tenant_id, date)",
        (),
    )?;

    Ok(())
}

/// Create a category for `tenant` and return its ID.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error.
pub fn create_category(
    tenant: TenantId,
    name: &str,
    connection: &Connection,
) -> Result<DatabaseID, Error> {
    connection
        .prepare("INSERT INTO category (tenant_id, name) VALUES (?1, ?2) RETURNING id")?
        .query_row(params![tenant.as_i64(), name], |row| row.get(0))
        .map_err(|error| error.into())
}

/// Create an account for `tenant` and return its ID.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error.
pub fn create_account(
    tenant: TenantId,
    name: &str,
    connection: &Connection,
) -> Result<DatabaseID, Error> {
    connection
        .prepare("INSERT INTO account (tenant_id, name) VALUES (?1, ?2) RETURNING id")?
        .query_row(params![tenant.as_i64(), name], |row| row.get(0))
        .map_err(|error| error.into())
}

/// Insert a transaction into the ledger.
///
/// Returns the stored transaction and the change record to forward to
/// [apply_change](crate::cube::update::apply_change).
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error.
pub fn create_transaction(
    tenant: TenantId,
    new: NewTransaction,
    connection: &Connection,
) -> Result<(LedgerTransaction, LedgerChange), Error> {
    let transaction = connection
        .prepare(&format!(
            "INSERT INTO \"transaction\"
                (tenant_id, account_id, category_id, date, amount, transaction_type,
                 is_recurring, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             RETURNING {TRANSACTION_COLUMNS}"
        ))?
        .query_row(
            params![
                tenant.as_i64(),
                new.account_id,
                new.category_id,
                new.date,
                new.amount,
                new.transaction_type,
                new.recurring,
                new.description,
            ],
            LedgerTransaction::map_row,
        )?;

    let change = LedgerChange::Created(transaction.facts);

    Ok((transaction, change))
}

/// Rewrite an existing transaction with the values in `new`.
///
/// Returns the change record carrying both the old and new dimension values.
///
/// # Errors
/// This function will return a:
/// - [Error::NotFound] if `id` does not refer to a transaction owned by
///   `tenant`,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn update_transaction(
    tenant: TenantId,
    id: DatabaseID,
    new: NewTransaction,
    connection: &Connection,
) -> Result<LedgerChange, Error> {
    let before = connection
        .prepare(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM \"transaction\"
             WHERE id = ?1 AND tenant_id = ?2"
        ))?
        .query_row(params![id, tenant.as_i64()], LedgerTransaction::map_row)?
        .facts;

    connection.execute(
        "UPDATE \"transaction\"
         SET account_id = ?1, category_id = ?2, date = ?3, amount = ?4,
             transaction_type = ?5, is_recurring = ?6, description = ?7
         WHERE id = ?8 AND tenant_id = ?9",
        params![
            new.account_id,
            new.category_id,
            new.date,
            new.amount,
            new.transaction_type,
            new.recurring,
            new.description,
            id,
            tenant.as_i64(),
        ],
    )?;

    Ok(LedgerChange::Updated {
        before,
        after: new.facts(),
    })
}

/// Remove a transaction from the ledger.
///
/// # Errors
/// This function will return a:
/// - [Error::NotFound] if `id` does not refer to a transaction owned by
///   `tenant`,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn delete_transaction(
    tenant: TenantId,
    id: DatabaseID,
    connection: &Connection,
) -> Result<LedgerChange, Error> {
    let transaction = connection
        .prepare(&format!(
            "DELETE FROM \"transaction\" WHERE id = ?1 AND tenant_id = ?2
             RETURNING {TRANSACTION_COLUMNS}"
        ))?
        .query_row(params![id, tenant.as_i64()], LedgerTransaction::map_row)?;

    Ok(LedgerChange::Deleted(transaction.facts))
}

/// Remove every transaction for `tenant` dated strictly before `cutoff`.
///
/// This is the bulk path behind re-seeding a tenant with a later start date.
/// One change record is returned per removed row; hand the whole batch to
/// [apply_changes](crate::cube::update::apply_changes) so each affected
/// bucket is recomputed exactly once.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error.
pub fn delete_transactions_before(
    tenant: TenantId,
    cutoff: Date,
    connection: &Connection,
) -> Result<Vec<LedgerChange>, Error> {
    connection
        .prepare(&format!(
            "DELETE FROM \"transaction\" WHERE tenant_id = ?1 AND date < ?2
             RETURNING {TRANSACTION_COLUMNS}"
        ))?
        .query_map(params![tenant.as_i64(), cutoff], LedgerTransaction::map_row)?
        .map(|row| {
            row.map(|transaction| LedgerChange::Deleted(transaction.facts))
                .map_err(Error::SqlError)
        })
        .collect()
}

/// The date of the tenant's oldest ledger transaction, or `None` when the
/// tenant has no transactions.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error.
pub fn earliest_transaction_date(
    tenant: TenantId,
    connection: &Connection,
) -> Result<Option<Date>, Error> {
    connection
        .query_row(
            "SELECT MIN(date) FROM \"transaction\" WHERE tenant_id = ?1",
            params![tenant.as_i64()],
            |row| row.get(0),
        )
        .map_err(|error| error.into())
}

/// One dimension slice of a period's ledger activity, with the category and
/// account display names as they are right now.
#[derive(Clone, Debug, PartialEq)]
pub struct DimensionSlice {
    /// The dimension tuple of the slice.
    pub key: DimensionKey,
    /// The current category name, if the slice has a live category.
    pub category_name: Option<String>,
    /// The current account name, if the account still exists.
    pub account_name: Option<String>,
    /// The signed sum of the slice's amounts.
    pub total_amount: f64,
    /// The number of transactions in the slice.
    pub transaction_count: i64,
}

/// Aggregate one period of the tenant's ledger, grouped by dimension tuple.
///
/// Only slices with at least one transaction are returned; an empty period
/// yields an empty list.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error.
pub fn aggregate_period(
    tenant: TenantId,
    period: Period,
    connection: &Connection,
) -> Result<Vec<DimensionSlice>, Error> {
    connection
        .prepare(
            "SELECT t.transaction_type, t.category_id, c.name, t.account_id, a.name,
                    t.is_recurring, SUM(t.amount), COUNT(*)
             FROM \"transaction\" t
             LEFT JOIN category c ON c.id = t.category_id
             LEFT JOIN account a ON a.id = t.account_id
             WHERE t.tenant_id = ?1 AND t.date BETWEEN ?2 AND ?3
             GROUP BY t.transaction_type, t.category_id, t.account_id, t.is_recurring
             ORDER BY t.transaction_type, t.category_id, t.account_id, t.is_recurring",
        )?
        .query_map(params![tenant.as_i64(), period.start, period.end], |row| {
            Ok(DimensionSlice {
                key: DimensionKey {
                    transaction_type: row.get(0)?,
                    category_id: row.get(1)?,
                    account_id: row.get(3)?,
                    recurring: row.get(5)?,
                },
                category_name: row.get(2)?,
                account_name: row.get(4)?,
                total_amount: row.get(6)?,
                transaction_count: row.get(7)?,
            })
        })?
        .map(|slice| slice.map_err(Error::SqlError))
        .collect()
}

/// Aggregate one exact (period, dimension tuple) slice of the tenant's
/// ledger, returning the signed sum and row count.
///
/// A null category matches only transactions with a null category.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error.
pub fn aggregate_slice(
    tenant: TenantId,
    period: Period,
    key: DimensionKey,
    connection: &Connection,
) -> Result<(f64, i64), Error> {
    connection
        .query_row(
            "SELECT IFNULL(SUM(amount), 0.0), COUNT(*)
             FROM \"transaction\"
             WHERE tenant_id = ?1 AND date BETWEEN ?2 AND ?3
               AND transaction_type = ?4 AND category_id IS ?5
               AND account_id = ?6 AND is_recurring = ?7",
            params![
                tenant.as_i64(),
                period.start,
                period.end,
                key.transaction_type,
                key.category_id,
                key.account_id,
                key.recurring,
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|error| error.into())
}

/// The current display name of a category, or `None` if it has been deleted.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error.
pub fn category_name(
    id: DatabaseID,
    connection: &Connection,
) -> Result<Option<String>, Error> {
    connection
        .query_row("SELECT name FROM category WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|error| error.into())
}

/// The current display name of an account, or `None` if it has been deleted.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error.
pub fn account_name(id: DatabaseID, connection: &Connection) -> Result<Option<String>, Error> {
    connection
        .query_row("SELECT name FROM account WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|error| error.into())
}
