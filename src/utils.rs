use crate::error::{Result, TreasuryError};
use chrono::{Datelike, Duration, Months, NaiveDate};

/// First day of the calendar month containing `date`.
///
/// Monthly series in this crate are keyed by month start.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.day0() as i64)
}

/// Start of the following month; `None` past the last representable month.
pub fn next_month(date: NaiveDate) -> Option<NaiveDate> {
    month_start(date).checked_add_months(Months::new(1))
}

pub fn prev_month(date: NaiveDate) -> Option<NaiveDate> {
    month_start(date).checked_sub_months(Months::new(1))
}

pub fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    next_month(date)
        .and_then(|next| next.pred_opt())
        .unwrap_or(NaiveDate::MAX)
}

pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Every month start from `start` to `end`, both inclusive.
///
/// Returns an empty vector when `end` precedes `start`.
pub fn month_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut months = Vec::new();
    let last = month_start(end);
    let mut current = Some(month_start(start));
    while let Some(month) = current.filter(|m| *m <= last) {
        months.push(month);
        current = next_month(month);
    }
    months
}

/// Parses "YYYY-MM" into the first day of that month.
pub fn parse_month(period: &str) -> Result<NaiveDate> {
    let start_str = format!("{}-01", period.trim());
    NaiveDate::parse_from_str(&start_str, "%Y-%m-%d").map_err(|_| {
        TreasuryError::DateError(format!(
            "Invalid month format: {}. Expected YYYY-MM",
            period
        ))
    })
}

/// Parses the dates the cash-flow feed delivers: "YYYY-MM-DD" or "YYYY-MM".
pub fn parse_entry_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").or_else(|_| parse_month(trimmed))
}

/// Relative change of `current` against `reference`, 0 when there is no reference.
pub fn relative_change(current: f64, reference: f64) -> f64 {
    if reference == 0.0 {
        0.0
    } else {
        (current - reference) / reference.abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_start_and_end() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 17).unwrap();
        assert_eq!(month_start(date), NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(
            last_day_of_month(date),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            last_day_of_month(NaiveDate::from_ymd_opt(2023, 4, 3).unwrap()),
            NaiveDate::from_ymd_opt(2023, 4, 30).unwrap()
        );
    }

    #[test]
    fn test_next_and_prev_month_wrap_years() {
        let dec = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
        assert_eq!(next_month(dec), NaiveDate::from_ymd_opt(2024, 1, 1));

        let jan = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(prev_month(jan), NaiveDate::from_ymd_opt(2023, 12, 1));
    }

    #[test]
    fn test_month_helpers_at_calendar_edges() {
        assert_eq!(next_month(NaiveDate::MAX), None);
        assert_eq!(prev_month(NaiveDate::MIN), None);
        assert_eq!(last_day_of_month(NaiveDate::MAX), NaiveDate::MAX);

        let last_month = month_start(NaiveDate::MAX);
        let previous = prev_month(last_month).unwrap();
        assert_eq!(month_range(previous, NaiveDate::MAX), vec![previous, last_month]);
    }

    #[test]
    fn test_month_range_fills_gaps() {
        let start = NaiveDate::from_ymd_opt(2023, 11, 20).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 2, 3).unwrap();
        let months = month_range(start, end);
        assert_eq!(months.len(), 4);
        assert_eq!(months[0], NaiveDate::from_ymd_opt(2023, 11, 1).unwrap());
        assert_eq!(months[3], NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(months_between(start, end), 3);

        assert!(month_range(end, start).is_empty());
    }

    #[test]
    fn test_parse_entry_date() {
        assert_eq!(
            parse_entry_date("2024-03-12").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 12).unwrap()
        );
        assert_eq!(
            parse_entry_date("2024-03").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
        assert!(parse_entry_date("12/03/2024").is_err());
        assert!(parse_month("2024-13").is_err());
    }

    #[test]
    fn test_relative_change() {
        assert!((relative_change(110.0, 100.0) - 0.1).abs() < 1e-9);
        assert!((relative_change(-50.0, -100.0) - 0.5).abs() < 1e-9);
        assert_eq!(relative_change(10.0, 0.0), 0.0);
    }
}
