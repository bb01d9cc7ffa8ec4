//! Trendcube maintains a materialized aggregation cube over a financial
//! transaction ledger.
//!
//! Weekly and monthly summaries are pre-computed per (tenant, period,
//! transaction type, category, account, recurring) slice so that trend
//! queries never rescan the full transaction history. Quarterly and yearly
//! figures are derived from the stored monthly rows at read time.
//!
//! The ledger itself is owned by the surrounding application and is only
//! read here; the cube table is owned exclusively by this crate. Every
//! bucket write re-derives its value from the ledger slice it represents
//! rather than applying increments to a stored number, which keeps
//! concurrent and out-of-order mutations convergent.

#![warn(missing_docs)]

use time::Date;

pub mod cube;
pub mod db;
pub mod ledger;
pub mod period;
pub mod tenant;

pub use cube::populate::{PopulateOptions, PopulateSummary, populate};
pub use cube::query::{TrendQuery, TrendRow, get_trends};
pub use cube::reconcile::{Discrepancy, purge_stale, verify};
pub use cube::store::{CubeStats, get_cube_stats};
pub use cube::update::{apply_change, apply_changes};
pub use db::initialize as initialize_db;
pub use period::{Period, PeriodType};
pub use tenant::TenantId;

/// The errors that may occur while maintaining or querying the cube.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// The requested resource was not found.
    ///
    /// Internally, this error may occur when a query returns no rows.
    #[error("the requested resource could not be found")]
    NotFound,

    /// A populate call was given no explicit date range and the tenant has
    /// no ledger transactions to derive one from.
    #[error("tenant {0} has no ledger transactions to derive a date range from")]
    EmptyLedger(TenantId),

    /// A date range was given whose start is later than its end.
    #[error("invalid date range: {start} is later than {end}")]
    InvalidDateRange {
        /// The start of the offending range.
        start: Date,
        /// The end of the offending range.
        end: Date,
    },

    /// A stored transaction type column held text that is not one of
    /// `INCOME`, `EXPENSE` or `TRANSFER`.
    #[error("\"{0}\" is not a valid transaction type")]
    InvalidTransactionType(String),

    /// A stored period type column held text that is not one of the
    /// recognised granularities.
    #[error("\"{0}\" is not a valid period type")]
    InvalidPeriodType(String),

    /// An unhandled/unexpected SQL error.
    #[error("an unexpected SQL error occurred: {0}")]
    SqlError(rusqlite::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
            error => {
                tracing::error!("an unhandled SQL error occurred: {}", error);
                Error::SqlError(error)
            }
        }
    }
}
