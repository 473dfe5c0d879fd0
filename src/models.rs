use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Nominal trading session bounds used to anchor minutes-relative windows
/// for historical dates (timestamps are stored as UTC microseconds).
pub fn session_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 15, 0).expect("valid session open")
}

pub fn session_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).expect("valid session close")
}

/// One persisted market observation for a single option contract.
///
/// Immutable once written; the store is append-only. `ts` is microseconds
/// since the Unix epoch so observations for one instrument total-order at
/// sub-second resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub instrument_id: String,
    /// Ingestion timestamp, microseconds since Unix epoch.
    pub ts: i64,
    pub last_price: f64,
    pub prev_close: f64,
    pub open_interest: f64,
    pub implied_vol: f64,
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
}

impl Tick {
    /// Percentage change derived from last price against previous close.
    ///
    /// Defined as 0.0 when prev_close is 0 (avoids division by zero; policy,
    /// not a mathematical identity).
    #[inline]
    pub fn change_pct(&self) -> f64 {
        change_pct(self.last_price, self.prev_close)
    }
}

#[inline]
pub fn change_pct(last_price: f64, prev_close: f64) -> f64 {
    if prev_close == 0.0 || !prev_close.is_finite() {
        0.0
    } else {
        (last_price - prev_close) / prev_close * 100.0
    }
}

/// Queryable fields of a stored tick. `ChangePct` is derived at read time,
/// never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    LastPrice,
    PrevClose,
    OpenInterest,
    ImpliedVol,
    Delta,
    Gamma,
    Vega,
    Theta,
    ChangePct,
}

impl FieldName {
    /// Column name in the ticks table. `ChangePct` has no column of its own.
    pub fn column(&self) -> Option<&'static str> {
        match self {
            FieldName::LastPrice => Some("last_price"),
            FieldName::PrevClose => Some("prev_close"),
            FieldName::OpenInterest => Some("open_interest"),
            FieldName::ImpliedVol => Some("implied_vol"),
            FieldName::Delta => Some("delta"),
            FieldName::Gamma => Some("gamma"),
            FieldName::Vega => Some("vega"),
            FieldName::Theta => Some("theta"),
            FieldName::ChangePct => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldName::LastPrice => "last_price",
            FieldName::PrevClose => "prev_close",
            FieldName::OpenInterest => "open_interest",
            FieldName::ImpliedVol => "implied_vol",
            FieldName::Delta => "delta",
            FieldName::Gamma => "gamma",
            FieldName::Vega => "vega",
            FieldName::Theta => "theta",
            FieldName::ChangePct => "change_pct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "last_price" | "ltp" => Some(FieldName::LastPrice),
            "prev_close" | "cp" => Some(FieldName::PrevClose),
            "open_interest" | "oi" => Some(FieldName::OpenInterest),
            "implied_vol" | "iv" => Some(FieldName::ImpliedVol),
            "delta" => Some(FieldName::Delta),
            "gamma" => Some(FieldName::Gamma),
            "vega" => Some(FieldName::Vega),
            "theta" => Some(FieldName::Theta),
            "change_pct" => Some(FieldName::ChangePct),
            _ => None,
        }
    }
}

/// Time window for range queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeWindow {
    /// Explicit inclusive [start, end], microseconds since Unix epoch.
    Absolute { start_us: i64, end_us: i64 },
    /// Last `minutes` relative to a reference instant. When `reference_date`
    /// is the current date the reference is "now"; for past dates it is the
    /// nominal session close of that date. `minutes = 0` means the whole
    /// session.
    LastMinutes {
        minutes: u32,
        reference_date: NaiveDate,
    },
}

impl TimeWindow {
    /// Resolve to inclusive [start_us, end_us] against `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<(i64, i64), QueryError> {
        match *self {
            TimeWindow::Absolute { start_us, end_us } => {
                if start_us > end_us {
                    return Err(QueryError::InvalidWindow { start_us, end_us });
                }
                Ok((start_us, end_us))
            }
            TimeWindow::LastMinutes {
                minutes,
                reference_date,
            } => {
                // Anchoring a historical date at wall-clock "now" would put
                // the whole window after the data; past dates anchor at the
                // nominal session close instead.
                let end = if reference_date == now.date_naive() {
                    now.naive_utc()
                } else {
                    reference_date.and_time(session_close())
                };
                let start = if minutes == 0 {
                    reference_date.and_time(session_open())
                } else {
                    end - chrono::Duration::minutes(i64::from(minutes))
                };
                let start_us = start.and_utc().timestamp_micros();
                let end_us = end.and_utc().timestamp_micros();
                if start_us > end_us {
                    return Err(QueryError::InvalidWindow { start_us, end_us });
                }
                Ok((start_us, end_us))
            }
        }
    }
}

/// Malformed query arguments. Surfaced synchronously to the caller; an empty
/// result set is Ok, never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    InvalidWindow { start_us: i64, end_us: i64 },
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidWindow { start_us, end_us } => {
                write!(f, "invalid window: start {} > end {}", start_us, end_us)
            }
        }
    }
}

impl std::error::Error for QueryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_change_pct_zero_prev_close() {
        assert_eq!(change_pct(100.0, 0.0), 0.0);
        assert_eq!(change_pct(-50.0, 0.0), 0.0);
        assert_eq!(change_pct(0.0, 0.0), 0.0);
    }

    #[test]
    fn test_change_pct_basic() {
        let pct = change_pct(102.0, 95.0);
        assert!((pct - 7.368421052631579).abs() < 1e-9);
    }

    #[test]
    fn test_absolute_window_rejects_inverted() {
        let w = TimeWindow::Absolute {
            start_us: 10,
            end_us: 5,
        };
        assert!(matches!(
            w.resolve(Utc::now()),
            Err(QueryError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn test_last_minutes_today_anchors_at_now() {
        let now = Utc.with_ymd_and_hms(2026, 8, 27, 9, 20, 0).unwrap();
        let w = TimeWindow::LastMinutes {
            minutes: 5,
            reference_date: now.date_naive(),
        };
        let (start, end) = w.resolve(now).unwrap();
        assert_eq!(end, now.timestamp_micros());
        assert_eq!(end - start, 5 * 60 * 1_000_000);
    }

    #[test]
    fn test_last_minutes_past_date_anchors_at_session_close() {
        let now = Utc.with_ymd_and_hms(2026, 8, 27, 9, 20, 0).unwrap();
        let past = NaiveDate::from_ymd_opt(2026, 8, 20).unwrap();
        let w = TimeWindow::LastMinutes {
            minutes: 15,
            reference_date: past,
        };
        let (start, end) = w.resolve(now).unwrap();
        let close = past.and_time(session_close()).and_utc().timestamp_micros();
        assert_eq!(end, close);
        assert_eq!(end - start, 15 * 60 * 1_000_000);
    }

    #[test]
    fn test_last_minutes_zero_means_whole_session() {
        let now = Utc.with_ymd_and_hms(2026, 8, 27, 12, 0, 0).unwrap();
        let w = TimeWindow::LastMinutes {
            minutes: 0,
            reference_date: now.date_naive(),
        };
        let (start, end) = w.resolve(now).unwrap();
        let open = now
            .date_naive()
            .and_time(session_open())
            .and_utc()
            .timestamp_micros();
        assert_eq!(start, open);
        assert_eq!(end, now.timestamp_micros());
    }
}
