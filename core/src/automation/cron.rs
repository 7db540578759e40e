//! 5-field cron subset: minute, hour, day-of-month, month, day-of-week.
//!
//! Each field accepts `*`, integers, `a-b` ranges, `a,b,c` lists and `*/n`
//! steps. Evaluation is in local time, matching the user's mental model of
//! "9am". Day-of-week 0 and 7 both mean Sunday. All five fields must match
//! (field-wise conjunction).

use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Datelike;
use chrono::Duration;
use chrono::Local;
use chrono::Timelike;

const LOOKBACK_LIMIT_DAYS: i64 = 366;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: BTreeSet<u8>,
    hour: BTreeSet<u8>,
    day_of_month: BTreeSet<u8>,
    month: BTreeSet<u8>,
    day_of_week: BTreeSet<u8>,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                fields.len()
            ));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, false).map_err(|e| format!("minute: {e}"))?,
            hour: parse_field(fields[1], 0, 23, false).map_err(|e| format!("hour: {e}"))?,
            day_of_month: parse_field(fields[2], 1, 31, false)
                .map_err(|e| format!("day-of-month: {e}"))?,
            month: parse_field(fields[3], 1, 12, false).map_err(|e| format!("month: {e}"))?,
            day_of_week: parse_field(fields[4], 0, 7, true)
                .map_err(|e| format!("day-of-week: {e}"))?,
        })
    }

    pub fn matches(&self, date: DateTime<Local>) -> bool {
        self.matches_parts(
            date.minute() as u8,
            date.hour() as u8,
            date.day() as u8,
            date.month() as u8,
            date.weekday().num_days_from_sunday() as u8,
        )
    }

    pub(crate) fn matches_parts(
        &self,
        minute: u8,
        hour: u8,
        day_of_month: u8,
        month: u8,
        day_of_week: u8,
    ) -> bool {
        self.minute.contains(&minute)
            && self.hour.contains(&hour)
            && self.day_of_month.contains(&day_of_month)
            && self.month.contains(&month)
            && self.day_of_week.contains(&day_of_week)
    }

    /// Latest matching minute strictly before `before`, within the lookback
    /// window.
    pub fn last_match(&self, before: DateTime<Local>) -> Option<DateTime<Local>> {
        let mut cursor = truncate_to_minute(before) - Duration::minutes(1);
        let floor = before - Duration::days(LOOKBACK_LIMIT_DAYS);
        while cursor > floor {
            if self.matches(cursor) {
                return Some(cursor);
            }
            cursor -= Duration::minutes(1);
        }
        None
    }

    /// Earliest matching minute strictly after `after`, within a year.
    pub fn next_match(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        let mut cursor = truncate_to_minute(after) + Duration::minutes(1);
        let ceiling = after + Duration::days(LOOKBACK_LIMIT_DAYS);
        while cursor < ceiling {
            if self.matches(cursor) {
                return Some(cursor);
            }
            cursor += Duration::minutes(1);
        }
        None
    }
}

fn truncate_to_minute(dt: DateTime<Local>) -> DateTime<Local> {
    dt.with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

fn parse_field(
    field: &str,
    min: u8,
    max: u8,
    seven_is_zero: bool,
) -> Result<BTreeSet<u8>, String> {
    let mut allowed = BTreeSet::new();
    for term in field.split(',') {
        if term.is_empty() {
            return Err("empty list term".to_string());
        }
        let (range, step) = match term.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| format!("invalid step `{step}`"))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (range, step)
            }
            None => (term, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u8 = a.parse().map_err(|_| format!("invalid number `{a}`"))?;
            let b: u8 = b.parse().map_err(|_| format!("invalid number `{b}`"))?;
            if a > b {
                return Err(format!("descending range `{range}`"));
            }
            (a, b)
        } else {
            let v: u8 = range
                .parse()
                .map_err(|_| format!("invalid number `{range}`"))?;
            (v, v)
        };

        if start < min || end > max {
            return Err(format!("value out of range {min}-{max}: `{term}`"));
        }
        let mut v = start;
        while v <= end {
            allowed.insert(if seven_is_zero && v == 7 { 0 } else { v });
            if v.checked_add(step).is_none() {
                break;
            }
            v += step;
        }
    }
    Ok(allowed)
}

/// `None` when the expression is valid, otherwise the parse error.
pub fn validate_cron(expr: &str) -> Option<String> {
    CronExpr::parse(expr).err()
}

pub fn matches_cron(expr: &str, date: DateTime<Local>) -> bool {
    CronExpr::parse(expr)
        .map(|cron| cron.matches(date))
        .unwrap_or(false)
}

pub fn last_cron_match(expr: &str, before: DateTime<Local>) -> Option<DateTime<Local>> {
    CronExpr::parse(expr).ok()?.last_match(before)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use chrono::TimeZone;

    fn parts(expr: &str) -> CronExpr {
        CronExpr::parse(expr).unwrap()
    }

    #[test]
    fn validates_field_count_and_ranges() {
        assert!(validate_cron("0 9 * * *").is_none());
        assert!(validate_cron("*/5 * * * 1-5").is_none());
        assert!(validate_cron("0 9 * *").is_some());
        assert!(validate_cron("60 * * * *").is_some());
        assert!(validate_cron("* 24 * * *").is_some());
        assert!(validate_cron("* * 0 * *").is_some());
        assert!(validate_cron("* * * 13 *").is_some());
        assert!(validate_cron("*/0 * * * *").is_some());
        assert!(validate_cron("5-1 * * * *").is_some());
        assert!(validate_cron("a * * * *").is_some());
    }

    #[test]
    fn wildcard_matches_every_minute() {
        let cron = parts("* * * * *");
        assert!(cron.matches_parts(0, 0, 1, 1, 0));
        assert!(cron.matches_parts(59, 23, 31, 12, 6));
    }

    #[test]
    fn fixed_time_matches_exactly() {
        let cron = parts("30 9 15 6 *");
        assert!(cron.matches_parts(30, 9, 15, 6, 0));
        assert!(!cron.matches_parts(31, 9, 15, 6, 0));
        assert!(!cron.matches_parts(30, 10, 15, 6, 0));
    }

    #[test]
    fn steps_lists_and_ranges() {
        let cron = parts("*/15 8-10 1,15 * 1-5");
        for minute in [0, 15, 30, 45] {
            assert!(cron.matches_parts(minute, 9, 15, 3, 3));
        }
        assert!(!cron.matches_parts(10, 9, 15, 3, 3));
        assert!(!cron.matches_parts(0, 7, 15, 3, 3));
        assert!(!cron.matches_parts(0, 9, 2, 3, 3));
        // saturday excluded by 1-5
        assert!(!cron.matches_parts(0, 9, 15, 3, 6));
    }

    #[test]
    fn day_of_week_seven_is_sunday() {
        let cron = parts("0 0 * * 7");
        assert!(cron.matches_parts(0, 0, 1, 1, 0));
        let cron = parts("0 0 * * 0");
        assert!(cron.matches_parts(0, 0, 1, 1, 0));
    }

    #[test]
    fn last_and_next_match_walk_minutes() {
        let cron = parts("0 9 * * *");
        let now = Local.with_ymd_and_hms(2025, 6, 15, 12, 30, 0).unwrap();
        let last = cron.last_match(now).unwrap();
        assert_eq!(last, Local.with_ymd_and_hms(2025, 6, 15, 9, 0, 0).unwrap());
        let next = cron.next_match(now).unwrap();
        assert_eq!(next, Local.with_ymd_and_hms(2025, 6, 16, 9, 0, 0).unwrap());
    }

    #[test]
    fn last_match_is_strictly_before() {
        let cron = parts("0 9 * * *");
        let at = Local.with_ymd_and_hms(2025, 6, 15, 9, 0, 0).unwrap();
        let last = cron.last_match(at).unwrap();
        assert_eq!(last, Local.with_ymd_and_hms(2025, 6, 14, 9, 0, 0).unwrap());
    }
}
