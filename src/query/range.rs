//! Range Query Engine
//!
//! Ordered (timestamp, value) series for one instrument and one field,
//! driving charts. Windows are absolute or minutes-relative; see
//! `TimeWindow::resolve` for the past-date anchoring rule.

use crate::models::{change_pct, FieldName, TimeWindow};
use crate::store::tick_store::TickStore;
use anyhow::Result;
use chrono::{DateTime, Utc};

/// Time-ordered series of one field within the window. An empty result is a
/// successful "no data in range", distinguishable from a query error.
pub fn range(
    store: &TickStore,
    instrument_id: &str,
    field: FieldName,
    window: TimeWindow,
) -> Result<Vec<(i64, f64)>> {
    range_at(store, instrument_id, field, window, Utc::now())
}

/// Like [`range`] but with an explicit "now" (tests, replays).
pub fn range_at(
    store: &TickStore,
    instrument_id: &str,
    field: FieldName,
    window: TimeWindow,
    now: DateTime<Utc>,
) -> Result<Vec<(i64, f64)>> {
    let (start_us, end_us) = window.resolve(now).map_err(anyhow::Error::from)?;

    match field.column() {
        Some(column) => Ok(store.series_in_window(instrument_id, column, start_us, end_us)?),
        // Derived field: computed per row at read time, same divide-by-zero
        // guard as the snapshot projection.
        None => {
            let rows = store.ltpc_in_window(instrument_id, start_us, end_us)?;
            Ok(rows
                .into_iter()
                .map(|(ts, ltp, cp)| (ts, change_pct(ltp, cp)))
                .collect())
        }
    }
}
