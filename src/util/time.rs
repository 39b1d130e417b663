use chrono::{DateTime, NaiveDate};

/// Oldest publication date (inclusive) still considered recent.
///
/// The window is compared on calendar dates, not instants: an item published
/// any time on the cutoff day passes the filter.
#[must_use]
pub(crate) fn recency_cutoff(today: NaiveDate, window_days: u32) -> NaiveDate {
    today
        .checked_sub_days(chrono::Days::new(u64::from(window_days)))
        .unwrap_or(NaiveDate::MIN)
}

#[must_use]
pub(crate) fn is_within_window(published: NaiveDate, today: NaiveDate, window_days: u32) -> bool {
    published >= recency_cutoff(today, window_days)
}

/// Parses a publication date as reported by the scraper.
///
/// Accepts plain calendar dates (`2026-08-21`) and RFC 3339 timestamps,
/// which some sources emit instead. Anything else is `None`.
#[must_use]
pub(crate) fn parse_published_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.date_naive())
}
