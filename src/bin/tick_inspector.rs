//! Tick Inspector CLI
//!
//! Runs the two query surfaces against a recorded tick database.
//!
//! Usage:
//!   cargo run --bin tick_inspector -- --db data/live_ticks.db snapshot --ids NSE_FO|101,NSE_FO|102 --start "2026-08-27T09:00:00Z" --end "2026-08-27T09:30:00Z"
//!   cargo run --bin tick_inspector -- --db data/live_ticks.db range --id NSE_FO|101 --field ltp --minutes 15
//!   cargo run --bin tick_inspector -- --db data/live_ticks.db list

use anyhow::{bail, Context, Result};
use chainfeed_backend::{
    models::{FieldName, TimeWindow},
    query::{range::range, snapshot::snapshot},
    store::tick_store::TickStore,
};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::collections::HashSet;

#[derive(Parser, Debug)]
#[command(name = "tick_inspector")]
#[command(about = "Query a recorded option tick database")]
struct Args {
    /// Path to SQLite tick database
    #[arg(long, env = "DB_PATH")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Latest observation per instrument within a window
    Snapshot {
        /// Comma-separated instrument ids
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,

        /// Window start (RFC 3339)
        #[arg(long)]
        start: DateTime<Utc>,

        /// Window end (RFC 3339)
        #[arg(long)]
        end: DateTime<Utc>,
    },
    /// Ordered series of one field for one instrument
    Range {
        /// Instrument id
        #[arg(long)]
        id: String,

        /// Field: ltp, cp, oi, iv, delta, gamma, vega, theta, change_pct
        #[arg(long)]
        field: String,

        /// Window start (RFC 3339); pairs with --end
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// Window end (RFC 3339)
        #[arg(long)]
        end: Option<DateTime<Utc>>,

        /// Last N minutes instead of an explicit window (0 = whole session)
        #[arg(long)]
        minutes: Option<u32>,

        /// Reference date for --minutes (defaults to today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// List instruments present in the store
    List,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let store = TickStore::open(&args.db)?;

    match args.command {
        Command::Snapshot { ids, start, end } => {
            let id_set: HashSet<String> = ids.into_iter().collect();
            let rows = snapshot(
                &store,
                &id_set,
                start.timestamp_micros(),
                end.timestamp_micros(),
            )?;

            if rows.is_empty() {
                println!("no data in range");
                return Ok(());
            }

            let mut sorted: Vec<_> = rows.into_iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            println!(
                "{:<24} {:>12} {:>10} {:>8} {:>10} {:>8} {:>8} {:>8} {:>8} {:>8}",
                "instrument", "ltp", "chg%", "oi", "iv", "delta", "gamma", "vega", "theta", "ts"
            );
            for (id, row) in sorted {
                let t = &row.tick;
                println!(
                    "{:<24} {:>12.2} {:>9.2}% {:>8.0} {:>10.4} {:>8.4} {:>8.4} {:>8.4} {:>8.4} {}",
                    id,
                    t.last_price,
                    row.change_pct,
                    t.open_interest,
                    t.implied_vol,
                    t.delta,
                    t.gamma,
                    t.vega,
                    t.theta,
                    format_ts(t.ts),
                );
            }
        }
        Command::Range {
            id,
            field,
            start,
            end,
            minutes,
            date,
        } => {
            let field = FieldName::parse(&field)
                .with_context(|| format!("unknown field '{}'", field))?;

            let window = match (start, end, minutes) {
                (Some(s), Some(e), None) => TimeWindow::Absolute {
                    start_us: s.timestamp_micros(),
                    end_us: e.timestamp_micros(),
                },
                (None, None, Some(m)) => TimeWindow::LastMinutes {
                    minutes: m,
                    reference_date: date.unwrap_or_else(|| Utc::now().date_naive()),
                },
                _ => bail!("use either --start/--end or --minutes"),
            };

            let series = range(&store, &id, field, window)?;
            if series.is_empty() {
                println!("no data in range");
                return Ok(());
            }
            for (ts, value) in series {
                println!("{} {:>14.4}", format_ts(ts), value);
            }
        }
        Command::List => {
            let ids = store.instrument_ids()?;
            println!("{} instruments, {} rows", ids.len(), store.len());
            for id in ids {
                println!("{}", id);
            }
        }
    }

    Ok(())
}

fn format_ts(ts_us: i64) -> String {
    match DateTime::<Utc>::from_timestamp_micros(ts_us) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => ts_us.to_string(),
    }
}
