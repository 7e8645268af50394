/*!
 * @file datetime.rs
 * @brief Calendar-aware date arithmetic for `$dateAdd`/`$dateSubtract`/`$dateDiff`
 *
 * Built on `chrono`, following checked arithmetic with saturating fallback
 * rather than panicking on overflow — a pipeline should never abort because
 * a date stage walked off the edge of the representable range.
 */

use bson::DateTime as BsonDateTime;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl DateUnit {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "millisecond" => DateUnit::Millisecond,
            "second" => DateUnit::Second,
            "minute" => DateUnit::Minute,
            "hour" => DateUnit::Hour,
            "day" => DateUnit::Day,
            "week" => DateUnit::Week,
            "month" => DateUnit::Month,
            "quarter" => DateUnit::Quarter,
            "year" => DateUnit::Year,
            _ => return None,
        })
    }
}

fn to_chrono(dt: BsonDateTime) -> DateTime<Utc> {
    dt.to_chrono()
}

fn from_chrono(dt: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_chrono(dt)
}

fn saturate(dt: Option<DateTime<Utc>>) -> DateTime<Utc> {
    dt.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Clamps a day-of-month to the last valid day of the target month, the
/// rule MongoDB applies when `$dateAdd` with a month/quarter/year unit
/// would otherwise land on a day that month doesn't have (e.g. Jan 31 + 1
/// month becomes Feb 28/29, not Mar 3).
fn add_months(dt: DateTime<Utc>, months: i32) -> DateTime<Utc> {
    let total_months = dt.year() as i64 * 12 + (dt.month() as i64 - 1) + months as i64;
    let year = (total_months.div_euclid(12)) as i32;
    let month = (total_months.rem_euclid(12)) as u32 + 1;

    let last_day = last_day_of_month(year, month);
    let day = dt.day().min(last_day);

    let naive_date = NaiveDate::from_ymd_opt(year, month, day);
    match naive_date {
        Some(d) => {
            let naive_dt = d.and_hms_nano_opt(dt.hour(), dt.minute(), dt.second(), dt.nanosecond());
            match naive_dt {
                Some(ndt) => Utc.from_utc_datetime(&ndt),
                None => DateTime::<Utc>::MAX_UTC,
            }
        }
        None => DateTime::<Utc>::MAX_UTC,
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .map(|d| d.pred_opt().unwrap().day())
        .unwrap_or(28)
}

/// Adds `amount` units of `unit` to `dt`, honoring calendar rules for
/// month/quarter/year and fixed-duration rules otherwise.
pub fn date_add(dt: BsonDateTime, unit: DateUnit, amount: i64) -> BsonDateTime {
    let chrono_dt = to_chrono(dt);
    let result = match unit {
        DateUnit::Millisecond => saturate(chrono_dt.checked_add_signed(Duration::milliseconds(amount))),
        DateUnit::Second => saturate(chrono_dt.checked_add_signed(Duration::seconds(amount))),
        DateUnit::Minute => saturate(chrono_dt.checked_add_signed(Duration::minutes(amount))),
        DateUnit::Hour => saturate(chrono_dt.checked_add_signed(Duration::hours(amount))),
        DateUnit::Day => saturate(chrono_dt.checked_add_signed(Duration::days(amount))),
        DateUnit::Week => saturate(chrono_dt.checked_add_signed(Duration::weeks(amount))),
        DateUnit::Month => add_months(chrono_dt, amount as i32),
        DateUnit::Quarter => add_months(chrono_dt, amount as i32 * 3),
        DateUnit::Year => add_months(chrono_dt, amount as i32 * 12),
    };
    from_chrono(result)
}

pub fn date_subtract(dt: BsonDateTime, unit: DateUnit, amount: i64) -> BsonDateTime {
    date_add(dt, unit, -amount)
}

/// Difference `end - start` expressed as a whole number of `unit`s. Fixed
/// units divide elapsed milliseconds; month/quarter/year count calendar
/// boundaries crossed, truncating toward zero.
pub fn date_diff(start: BsonDateTime, end: BsonDateTime, unit: DateUnit) -> i64 {
    let (s, e) = (to_chrono(start), to_chrono(end));
    let millis = (e - s).num_milliseconds();

    match unit {
        DateUnit::Millisecond => millis,
        DateUnit::Second => millis / 1_000,
        DateUnit::Minute => millis / 60_000,
        DateUnit::Hour => millis / 3_600_000,
        DateUnit::Day => millis / 86_400_000,
        DateUnit::Week => millis / (86_400_000 * 7),
        DateUnit::Month => month_diff(s, e),
        DateUnit::Quarter => month_diff(s, e) / 3,
        DateUnit::Year => month_diff(s, e) / 12,
    }
}

fn month_diff(s: DateTime<Utc>, e: DateTime<Utc>) -> i64 {
    let months = (e.year() as i64 * 12 + e.month() as i64 - 1) - (s.year() as i64 * 12 + s.month() as i64 - 1);
    if e.day() < s.day() && months > 0 {
        months - 1
    } else if e.day() > s.day() && months < 0 {
        months + 1
    } else {
        months
    }
}

pub fn year_of(dt: BsonDateTime) -> i32 {
    to_chrono(dt).year()
}

pub fn month_of(dt: BsonDateTime) -> u32 {
    to_chrono(dt).month()
}

pub fn day_of_month(dt: BsonDateTime) -> u32 {
    to_chrono(dt).day()
}

pub fn day_of_week(dt: BsonDateTime) -> u32 {
    // MongoDB's $dayOfWeek: Sunday = 1 ... Saturday = 7.
    to_chrono(dt).weekday().num_days_from_sunday() + 1
}

pub fn day_of_year(dt: BsonDateTime) -> u32 {
    to_chrono(dt).ordinal()
}

pub fn hour_of(dt: BsonDateTime) -> u32 {
    to_chrono(dt).hour()
}

pub fn minute_of(dt: BsonDateTime) -> u32 {
    to_chrono(dt).minute()
}

pub fn second_of(dt: BsonDateTime) -> u32 {
    to_chrono(dt).second()
}

pub fn millisecond_of(dt: BsonDateTime) -> u32 {
    to_chrono(dt).timestamp_subsec_millis()
}

pub fn week_of(dt: BsonDateTime) -> u32 {
    to_chrono(dt).iso_week().week()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(y: i32, m: u32, d: u32) -> BsonDateTime {
        let naive = NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap();
        from_chrono(Utc.from_utc_datetime(&naive))
    }

    #[test]
    fn month_overflow_clamps_to_last_day() {
        let jan31 = mk(2024, 1, 31);
        let result = date_add(jan31, DateUnit::Month, 1);
        assert_eq!(year_of(result), 2024);
        assert_eq!(month_of(result), 2);
        assert_eq!(day_of_month(result), 29); // 2024 is a leap year
    }

    #[test]
    fn year_diff_truncates_toward_zero() {
        let start = mk(2020, 6, 15);
        let end = mk(2023, 6, 10);
        assert_eq!(date_diff(start, end, DateUnit::Year), 2);
    }

    #[test]
    fn day_diff_matches_elapsed_milliseconds() {
        let start = mk(2024, 1, 1);
        let end = mk(2024, 1, 11);
        assert_eq!(date_diff(start, end, DateUnit::Day), 10);
    }
}
