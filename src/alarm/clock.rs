use chrono::{DateTime, Datelike, Days, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use tracing::warn;

use crate::alarm::model::{Alarm, AlarmError};

/// Upper bound on consecutive days probed when the alarm time falls into a
/// DST gap.
const MAX_DAY_PROBE: u64 = 7;

/// Next instant at which `alarm` rings, relative to `anchor`.
///
/// The candidate is `anchor`'s local date at `hour:minute:00`, moved one
/// day forward unless the alarm's time of day is strictly ahead of the
/// anchor's hour and minute. Seconds of the anchor never take part in the
/// comparison. A local time that does not exist (spring-forward gap) moves
/// to the next day on which it does; an ambiguous one (fall-back) resolves
/// to its earlier instance.
pub fn next_trigger_instant<Tz>(
    alarm: &Alarm,
    anchor: &DateTime<Tz>,
) -> Result<DateTime<Tz>, AlarmError>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let time_local = NaiveTime::from_hms_opt(alarm.hour(), alarm.minute(), 0).ok_or(
        AlarmError::InvalidConfiguration {
            hour: alarm.hour(),
            minute: alarm.minute(),
        },
    )?;
    let first_day = if alarm.is_ahead_of(anchor.hour(), anchor.minute()) {
        0
    } else {
        1
    };

    let timezone = anchor.timezone();
    for day_offset in first_day..first_day + MAX_DAY_PROBE {
        let Some(date) = anchor.date_naive().checked_add_days(Days::new(day_offset)) else {
            break;
        };
        match resolve_local_datetime(&timezone, date.and_time(time_local)) {
            Some(candidate) => return Ok(candidate),
            None => warn!(
                alarm = %alarm,
                date = %date,
                "alarm time does not exist on this date, moving to the next day"
            ),
        }
    }

    Err(AlarmError::NoOccurrence {
        alarm: *alarm,
        anchor: anchor.naive_local().to_string(),
    })
}

fn resolve_local_datetime<Tz>(timezone: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(first, _second) => Some(first),
        LocalResult::None => None,
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimeDisplayMode {
    Hour24,
    Hour12,
}

pub fn format_trigger<Tz: TimeZone>(trigger: Option<&DateTime<Tz>>, mode: TimeDisplayMode) -> String {
    match trigger {
        Some(dt) => match mode {
            TimeDisplayMode::Hour24 => format!(
                "{:04}-{:02}-{:02} {:02}:{:02}",
                dt.year(),
                dt.month(),
                dt.day(),
                dt.hour(),
                dt.minute()
            ),
            TimeDisplayMode::Hour12 => {
                let (is_pm, hour12) = dt.hour12();
                let meridiem = if is_pm { "PM" } else { "AM" };
                format!(
                    "{:04}-{:02}-{:02} {}:{:02} {}",
                    dt.year(),
                    dt.month(),
                    dt.day(),
                    hour12,
                    dt.minute(),
                    meridiem
                )
            }
        },
        None => "-".to_string(),
    }
}
