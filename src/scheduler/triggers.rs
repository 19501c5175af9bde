use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

use crate::scheduler::registry::{Frequency, TimeConfig};

/// Compute the next fire time strictly after `after` for the given
/// frequency and time configuration. All times are UTC. Returns None only
/// for a Custom frequency with no usable interval.
pub fn next_fire(
    frequency: Frequency,
    time_config: &TimeConfig,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let minute = time_config.minute.min(59);

    match frequency {
        Frequency::Hourly => {
            let candidate = after
                .with_minute(minute)?
                .with_second(0)?
                .with_nanosecond(0)?;
            if candidate > after {
                Some(candidate)
            } else {
                Some(candidate + Duration::hours(1))
            }
        }

        Frequency::Daily => {
            let hour = time_config.hour.unwrap_or(0).min(23);
            let candidate = after
                .with_hour(hour)?
                .with_minute(minute)?
                .with_second(0)?
                .with_nanosecond(0)?;
            if candidate > after {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(1))
            }
        }

        Frequency::Weekly => {
            let hour = time_config.hour.unwrap_or(0).min(23);
            // 0 = Monday, matching chrono's num_days_from_monday.
            let target_weekday = time_config.weekday.unwrap_or(0).min(6);

            let base = after
                .with_hour(hour)?
                .with_minute(minute)?
                .with_second(0)?
                .with_nanosecond(0)?;

            let current_weekday = after.weekday().num_days_from_monday();
            let days_ahead =
                (target_weekday as i64 - current_weekday as i64).rem_euclid(7);

            let candidate = base + Duration::days(days_ahead);
            if candidate > after {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(7))
            }
        }

        Frequency::Monthly => {
            let hour = time_config.hour.unwrap_or(0).min(23);
            let day = time_config.day_of_month.unwrap_or(1).max(1);

            let candidate =
                month_candidate(after.year(), after.month(), day, hour, minute)?;
            if candidate > after {
                Some(candidate)
            } else {
                let (year, month) = if after.month() == 12 {
                    (after.year() + 1, 1)
                } else {
                    (after.year(), after.month() + 1)
                };
                month_candidate(year, month, day, hour, minute)
            }
        }

        Frequency::Custom => {
            let interval = time_config.interval_minutes.filter(|m| *m > 0)?;
            Some(after + Duration::minutes(interval as i64))
        }
    }
}

/// Build a fire time within the given month, clamping the requested day to
/// the month's length (so "day 31" fires on Feb 28).
fn month_candidate(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Utc>> {
    let last_day = days_in_month(year, month)?;
    let date = NaiveDate::from_ymd_opt(year, month, day.min(last_day))?;
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1)?;
    Some(first_of_next.pred_opt()?.day())
}
