//! Snapshot Query Engine
//!
//! "Latest observation per instrument within a window", computed by the
//! store's (instrument_id, ts) index in one bulk statement rather than a
//! per-instrument scan or an in-process latest-value cache.

use crate::models::{QueryError, Tick};
use crate::store::tick_store::TickStore;
use anyhow::Result;
use std::collections::{HashMap, HashSet};

/// One snapshot row: the max-ts observation plus the derived change.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub tick: Tick,
    pub change_pct: f64,
}

/// Latest observation per requested instrument within inclusive
/// [start_us, end_us]. Instruments without an observation in the window are
/// absent from the map; an empty id set returns an empty map without
/// touching the store.
pub fn snapshot(
    store: &TickStore,
    instrument_ids: &HashSet<String>,
    start_us: i64,
    end_us: i64,
) -> Result<HashMap<String, SnapshotRow>> {
    if start_us > end_us {
        return Err(QueryError::InvalidWindow { start_us, end_us }.into());
    }
    if instrument_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let ids: Vec<String> = instrument_ids.iter().cloned().collect();
    let rows = store.latest_in_window(&ids, start_us, end_us)?;

    let mut out = HashMap::with_capacity(rows.len());
    for tick in rows {
        let change_pct = tick.change_pct();
        out.insert(tick.instrument_id.clone(), SnapshotRow { tick, change_pct });
    }
    Ok(out)
}
