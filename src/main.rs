//! Maintenance CLI for the trends cube.
//!
//! This is the ops surface that used to exist as a pile of one-off scripts:
//! populate/rebuild, trend queries, coverage stats, stale-row purging and
//! cube-versus-ledger verification, plus a demo seeder. Every command takes
//! the tenant explicitly; there is no implied default tenant.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rusqlite::Connection;
use time::{Date, Duration, OffsetDateTime, macros::format_description};
use tracing_subscriber::{Layer, filter, layer::SubscriberExt, util::SubscriberInitExt};

use trendcube::{
    Error, PeriodType, PopulateOptions, TenantId, TrendQuery, TrendRow, get_cube_stats,
    get_trends, initialize_db,
    cube::populate::DEFAULT_BATCH_SIZE,
    ledger::{NewTransaction, TransactionType, create_account, create_category,
             create_transaction},
    populate, purge_stale, verify,
};

#[derive(Parser)]
#[command(name = "trendcube", about = "Maintain and query the financial trends cube")]
struct Cli {
    /// Path to the SQLite database holding the ledger and cube tables.
    #[arg(long, default_value = "trendcube.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rebuild weekly and monthly cube rows from the ledger.
    Populate {
        /// The tenant to populate for.
        tenant: i64,
        /// Start of the range (defaults to the tenant's earliest transaction).
        #[arg(long, value_parser = parse_date)]
        start_date: Option<Date>,
        /// End of the range (defaults to today).
        #[arg(long, value_parser = parse_date)]
        end_date: Option<Date>,
        /// Delete each period's existing rows before rebuilding it.
        #[arg(long)]
        clear_existing: bool,
        /// Periods committed per write transaction.
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },
    /// Query aggregate trend rows.
    Trends {
        /// The tenant to query.
        tenant: i64,
        /// WEEKLY, MONTHLY, QUARTERLY or YEARLY.
        #[arg(value_parser = parse_period_type)]
        period_type: PeriodType,
        #[arg(value_parser = parse_date)]
        start_date: Date,
        #[arg(value_parser = parse_date)]
        end_date: Date,
        /// Only include this transaction type (INCOME, EXPENSE, TRANSFER).
        #[arg(long, value_parser = parse_transaction_type)]
        transaction_type: Option<TransactionType>,
        /// Only include this category.
        #[arg(long)]
        category_id: Option<i64>,
        /// Only include this account.
        #[arg(long)]
        account_id: Option<i64>,
        /// Only include recurring (true) or non-recurring (false) slices.
        #[arg(long)]
        recurring: Option<bool>,
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Report how much cube coverage a tenant has.
    Stats {
        /// The tenant to report on.
        tenant: i64,
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Delete cube rows older than the tenant's earliest ledger transaction.
    PurgeStale {
        /// The tenant to purge for.
        tenant: i64,
    },
    /// Diff the cube against a direct ledger aggregation.
    Verify {
        /// The tenant to verify.
        tenant: i64,
        #[arg(value_parser = parse_date)]
        start_date: Date,
        #[arg(value_parser = parse_date)]
        end_date: Date,
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Seed a small demo ledger for a tenant and populate its cube.
    SeedDemo {
        /// The tenant to seed.
        tenant: i64,
    },
}

fn parse_date(text: &str) -> Result<Date, String> {
    Date::parse(text, format_description!("[year]-[month]-[day]"))
        .map_err(|error| format!("expected a YYYY-MM-DD date: {error}"))
}

fn parse_period_type(text: &str) -> Result<PeriodType, String> {
    text.parse().map_err(|error: Error| error.to_string())
}

fn parse_transaction_type(text: &str) -> Result<TransactionType, String> {
    text.parse().map_err(|error: Error| error.to_string())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                filter::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| filter::EnvFilter::new("info")),
            ),
        )
        .init();

    let cli = Cli::parse();

    let connection = Connection::open(&cli.db)?;
    initialize_db(&connection)?;

    match cli.command {
        Command::Populate {
            tenant,
            start_date,
            end_date,
            clear_existing,
            batch_size,
        } => {
            let summary = populate(
                TenantId::new(tenant),
                PopulateOptions {
                    start_date,
                    end_date,
                    clear_existing,
                    batch_size,
                },
                &connection,
            )?;

            println!(
                "processed {} period(s), wrote {} row(s) in {:?}",
                summary.periods_processed, summary.records_created, summary.time_elapsed
            );
        }
        Command::Trends {
            tenant,
            period_type,
            start_date,
            end_date,
            transaction_type,
            category_id,
            account_id,
            recurring,
            json,
        } => {
            let rows = get_trends(
                TenantId::new(tenant),
                &TrendQuery {
                    period_type,
                    start_date,
                    end_date,
                    transaction_type,
                    category_id,
                    account_id,
                    recurring,
                },
                &connection,
            )?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&rows).expect("trend rows serialize as JSON")
                );
            } else {
                for row in &rows {
                    print_trend_row(row);
                }
                println!("{} row(s)", rows.len());
            }
        }
        Command::Stats { tenant, json } => {
            let stats = get_cube_stats(TenantId::new(tenant), &connection)?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&stats).expect("cube stats serialize as JSON")
                );
            } else {
                println!(
                    "{} row(s) total ({} weekly, {} monthly)",
                    stats.total_records, stats.weekly_records, stats.monthly_records
                );
                match stats.date_range {
                    Some((earliest, latest)) => println!("coverage {earliest} to {latest}"),
                    None => println!("no cube coverage"),
                }
            }
        }
        Command::PurgeStale { tenant } => {
            let removed = purge_stale(TenantId::new(tenant), &connection)?;
            println!("removed {removed} stale row(s)");
        }
        Command::Verify {
            tenant,
            start_date,
            end_date,
            json,
        } => {
            let discrepancies = verify(TenantId::new(tenant), start_date, end_date, &connection)?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&discrepancies)
                        .expect("discrepancies serialize as JSON")
                );
            } else if discrepancies.is_empty() {
                println!("cube is consistent with the ledger");
            } else {
                for discrepancy in &discrepancies {
                    println!(
                        "{} {}: cube {:.2}/{} vs ledger {:.2}/{} for {:?}",
                        discrepancy.period_type,
                        discrepancy.period.start,
                        discrepancy.cube_amount,
                        discrepancy.cube_count,
                        discrepancy.ledger_amount,
                        discrepancy.ledger_count,
                        discrepancy.key,
                    );
                }
                println!("{} discrepancies", discrepancies.len());
            }
        }
        Command::SeedDemo { tenant } => {
            let summary = seed_demo(TenantId::new(tenant), &connection)?;
            println!(
                "seeded demo ledger; processed {} period(s), wrote {} row(s)",
                summary.periods_processed, summary.records_created
            );
        }
    }

    Ok(())
}

fn print_trend_row(row: &TrendRow) {
    println!(
        "{} to {} {} {} {} {} {:>10.2} ({})",
        row.period_start,
        row.period_end,
        row.transaction_type,
        row.category_name.as_deref().unwrap_or("(uncategorized)"),
        row.account_name.as_deref().unwrap_or("(unknown account)"),
        if row.recurring { "recurring" } else { "one-off" },
        row.total_amount,
        row.transaction_count
    );
}

/// A few months of groceries, rent and salary for demo dashboards.
fn seed_demo(
    tenant: TenantId,
    connection: &Connection,
) -> Result<trendcube::PopulateSummary, Error> {
    let checking = create_account(tenant, "Checking", connection)?;
    let savings = create_account(tenant, "Savings", connection)?;
    let groceries = create_category(tenant, "Groceries", connection)?;
    let rent = create_category(tenant, "Rent", connection)?;
    let salary = create_category(tenant, "Salary", connection)?;

    let today = OffsetDateTime::now_utc().date();

    for months_ago in 0..6i64 {
        let anchor = today - Duration::days(30 * months_ago);

        let entries = [
            NewTransaction {
                date: anchor,
                amount: -120.50,
                transaction_type: TransactionType::Expense,
                category_id: Some(groceries),
                account_id: checking,
                recurring: false,
                description: "Weekly shop".to_owned(),
            },
            NewTransaction {
                date: anchor,
                amount: -788.76,
                transaction_type: TransactionType::Expense,
                category_id: Some(rent),
                account_id: checking,
                recurring: true,
                description: "Rent".to_owned(),
            },
            NewTransaction {
                date: anchor,
                amount: 3200.00,
                transaction_type: TransactionType::Income,
                category_id: Some(salary),
                account_id: checking,
                recurring: true,
                description: "Salary".to_owned(),
            },
            NewTransaction {
                date: anchor,
                amount: 250.00,
                transaction_type: TransactionType::Transfer,
                category_id: None,
                account_id: savings,
                recurring: true,
                description: "Savings transfer".to_owned(),
            },
        ];

        for entry in entries {
            create_transaction(tenant, entry, connection)?;
        }
    }

    populate(tenant, PopulateOptions::default(), connection)
}
