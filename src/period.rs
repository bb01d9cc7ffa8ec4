//! Calendar-aligned time buckets.
//!
//! The cube stores weekly and monthly rows and derives quarterly and yearly
//! figures on read. One calendar convention is applied everywhere: weeks are
//! ISO-8601 weeks (Monday through Sunday) and months, quarters and years are
//! calendar-aligned. A transaction dated exactly on a period boundary belongs
//! to the period starting on that date. The populator and the incremental
//! updater both bucket dates through this module, so the two can never
//! disagree about which period a transaction falls in.

use std::{fmt::Display, str::FromStr};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, util::days_in_year_month};

use crate::Error;

/// The granularity of a time bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeriodType {
    /// An ISO-8601 week, Monday through Sunday. Stored in the cube.
    Weekly,
    /// A calendar month. Stored in the cube.
    Monthly,
    /// A calendar quarter. Derived from monthly rows at read time.
    Quarterly,
    /// A calendar year. Derived from monthly rows at read time.
    Yearly,
}

/// The granularities that are materialized in the cube table.
pub const STORED_PERIOD_TYPES: [PeriodType; 2] = [PeriodType::Weekly, PeriodType::Monthly];

impl PeriodType {
    /// The TEXT encoding used in the cube table.
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Weekly => "WEEKLY",
            PeriodType::Monthly => "MONTHLY",
            PeriodType::Quarterly => "QUARTERLY",
            PeriodType::Yearly => "YEARLY",
        }
    }

    /// Whether rows of this granularity are materialized rather than derived.
    pub fn is_stored(&self) -> bool {
        matches!(self, PeriodType::Weekly | PeriodType::Monthly)
    }
}

impl Display for PeriodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodType {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.to_ascii_uppercase().as_str() {
            "WEEKLY" => Ok(PeriodType::Weekly),
            "MONTHLY" => Ok(PeriodType::Monthly),
            "QUARTERLY" => Ok(PeriodType::Quarterly),
            "YEARLY" => Ok(PeriodType::Yearly),
            _ => Err(Error::InvalidPeriodType(text.to_owned())),
        }
    }
}

impl ToSql for PeriodType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for PeriodType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}

/// One calendar-aligned time bucket with inclusive bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    /// The first day of the period.
    pub start: Date,
    /// The last day of the period (inclusive).
    pub end: Date,
}

impl Period {
    /// The ISO week (Monday through Sunday) containing `date`.
    pub fn week_of(date: Date) -> Self {
        let start = date - Duration::days(date.weekday().number_days_from_monday() as i64);

        Self {
            start,
            end: start + Duration::days(6),
        }
    }

    /// The calendar month containing `date`.
    pub fn month_of(date: Date) -> Self {
        let last_day = days_in_year_month(date.year(), date.month());

        Self {
            start: date.replace_day(1).expect("day 1 is valid in every month"),
            end: date
                .replace_day(last_day)
                .expect("last day reported by days_in_year_month is valid"),
        }
    }

    /// The calendar quarter containing `date`.
    pub fn quarter_of(date: Date) -> Self {
        let first_month = match u8::from(date.month()) {
            1..=3 => Month::January,
            4..=6 => Month::April,
            7..=9 => Month::July,
            _ => Month::October,
        };
        let last_month = first_month.nth_next(2);

        Self {
            start: Date::from_calendar_date(date.year(), first_month, 1)
                .expect("day 1 is valid in every month"),
            end: Date::from_calendar_date(
                date.year(),
                last_month,
                days_in_year_month(date.year(), last_month),
            )
            .expect("last day reported by days_in_year_month is valid"),
        }
    }

    /// The calendar year containing `date`.
    pub fn year_of(date: Date) -> Self {
        Self {
            start: Date::from_calendar_date(date.year(), Month::January, 1)
                .expect("January 1 is valid in every year"),
            end: Date::from_calendar_date(date.year(), Month::December, 31)
                .expect("December 31 is valid in every year"),
        }
    }

    /// The period of the given granularity containing `date`.
    pub fn containing(period_type: PeriodType, date: Date) -> Self {
        match period_type {
            PeriodType::Weekly => Self::week_of(date),
            PeriodType::Monthly => Self::month_of(date),
            PeriodType::Quarterly => Self::quarter_of(date),
            PeriodType::Yearly => Self::year_of(date),
        }
    }

    /// Whether `date` falls within this period.
    pub fn contains(&self, date: Date) -> bool {
        self.start <= date && date <= self.end
    }
}

/// The ascending list of periods of the given granularity that intersect the
/// inclusive range `[start, end]`.
///
/// The first and last periods may extend beyond the requested range since
/// periods are always calendar-aligned.
pub fn periods_covering(start: Date, end: Date, period_type: PeriodType) -> Vec<Period> {
    let mut periods = Vec::new();
    let mut period = Period::containing(period_type, start);

    while period.start <= end {
        periods.push(period);

        period = match period.end.next_day() {
            Some(next_start) => Period::containing(period_type, next_start),
            None => break,
        };
    }

    periods
}
