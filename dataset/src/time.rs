use crate::error::DatasetError;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use polars::prelude::*;

/// Epoch values below this are interpreted as milliseconds and scaled to
/// microseconds; values at or above it are already microseconds.
/// 1e13 ms is year 2286, 1e13 us is year 1970 + 115 days.
pub const EPOCH_MILLIS_CUTOFF: i64 = 10_000_000_000_000;

const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Whole microseconds of an interval.
pub fn interval_micros(interval: TimeDelta) -> i64 {
    interval.num_microseconds().unwrap_or(i64::MAX)
}

/// Interval as a polars duration string, e.g. `600000000us` for 10 minutes.
pub fn duration_string(interval: TimeDelta) -> String {
    format!("{}us", interval_micros(interval))
}

/// Interval as a `Duration(us)` literal, usable in datetime arithmetic.
pub fn duration_lit(interval: TimeDelta) -> Expr {
    lit(interval_micros(interval)).cast(DataType::Duration(TimeUnit::Microseconds))
}

/// Number of whole intervals in a day, rounded down.
pub fn intervals_per_day(interval: TimeDelta) -> i64 {
    MICROS_PER_DAY / interval_micros(interval).max(1)
}

/// Days of a lookback interval, rounded up to cover partial days.
pub fn ceil_days(interval: TimeDelta) -> i64 {
    let seconds = interval.num_seconds();
    (seconds + 86_399) / 86_400
}

/// Bucket-end label: a value at `t` maps to `truncate(t, every) + every`,
/// so a bucket timestamp is the earliest instant its content is knowable.
pub fn bucket_end(time: Expr, every: TimeDelta) -> Expr {
    time.dt().truncate(lit(duration_string(every))) + duration_lit(every)
}

/// Normalizes raw integer epochs to `Datetime(us)`. Millisecond feeds are
/// detected by the fixed cutoff and scaled by 1000.
pub fn epoch_micros(epoch: Expr) -> Expr {
    let epoch = epoch.cast(DataType::Int64);
    when(epoch.clone().lt(lit(EPOCH_MILLIS_CUTOFF)))
        .then(epoch.clone() * lit(1000i64))
        .otherwise(epoch)
        .cast(DataType::Datetime(TimeUnit::Microseconds, None))
}

/// Physical `Date32` (days since epoch) back to a chrono date.
pub fn date_from_days(days: i32) -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date") + TimeDelta::days(days as i64)
}

/// Midnight at the start of `date`.
pub fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// One-column `date` frame, used for exact partition-membership joins.
pub fn dates_frame(dates: &[NaiveDate]) -> Result<LazyFrame, DatasetError> {
    let df = df!("date" => dates.to_vec())?;
    Ok(df.lazy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_round_trips() {
        assert_eq!(interval_micros(TimeDelta::minutes(10)), 600_000_000);
        assert_eq!(duration_string(TimeDelta::hours(1)), "3600000000us");
        assert_eq!(intervals_per_day(TimeDelta::minutes(10)), 144);
    }

    #[test]
    fn ceil_days_covers_partial_days() {
        assert_eq!(ceil_days(TimeDelta::days(7)), 7);
        assert_eq!(ceil_days(TimeDelta::hours(25)), 2);
        assert_eq!(ceil_days(TimeDelta::minutes(10)), 1);
    }

    #[test]
    fn date_from_days_is_epoch_based() {
        assert_eq!(
            date_from_days(0),
            NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
        );
        assert_eq!(
            date_from_days(19_723),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        );
    }
}
