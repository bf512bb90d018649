use chrono::Utc;

const SECOND: u64 = 1000;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const YEAR: u64 = 365 * DAY;

/// Current wall-clock time as Unix milliseconds. All timestamps carried on
/// the wire and stored in the database use this unit.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Returns the timestamp `days` days before now, in Unix milliseconds.
pub fn millis_before_days(days: u64) -> u64 {
    now_millis().saturating_sub(days * DAY)
}

pub fn format_time(time: u64) -> String {
    if time == 0 {
        return String::from("never");
    }
    let now = now_millis();
    let (duration, style) = if now > time {
        (now.saturating_sub(time), "ago")
    } else {
        (time.saturating_sub(now), "left")
    };

    let unit: &str;
    let value: u64;
    if duration < MINUTE {
        unit = "s";
        if duration < 30 * SECOND {
            return String::from("now");
        }
        value = duration / SECOND;
    } else if duration < HOUR {
        unit = "m";
        value = duration / MINUTE;
    } else if duration < DAY {
        unit = "h";
        value = duration / HOUR;
    } else if duration < YEAR {
        unit = "d";
        value = duration / DAY;
    } else {
        unit = "y";
        value = duration / YEAR;
    }

    format!("{value}{unit} {style}")
}
