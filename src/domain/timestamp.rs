use std::cmp::Ordering;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub fn now_utc_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

pub fn format_rfc3339(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .expect("RFC3339 formatting for UTC timestamp should never fail")
}

pub fn parse_rfc3339(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339).ok()
}

pub fn normalize_datetime(value: Option<&str>) -> Option<String> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }
    parse_rfc3339(raw).map(format_rfc3339)
}

/// Accepts a full RFC3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_date_bound(raw: &str) -> Option<OffsetDateTime> {
    if let Some(parsed) = parse_rfc3339(raw) {
        return Some(parsed);
    }
    let format = time::format_description::parse("[year]-[month]-[day]").ok()?;
    let date = time::Date::parse(raw.trim(), &format).ok()?;
    Some(date.midnight().assume_utc())
}

/// Orders two stored timestamps. Unparseable values sort before parseable
/// ones and fall back to string order among themselves.
pub fn compare(left: &str, right: &str) -> Ordering {
    match (parse_rfc3339(left), parse_rfc3339(right)) {
        (Some(l), Some(r)) => l.cmp(&r),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => left.cmp(right),
    }
}

/// Returns `candidate` unless it would move time backwards relative to
/// `floor`, in which case `floor` is kept.
pub fn not_before(floor: &str, candidate: String) -> String {
    if compare(&candidate, floor) == Ordering::Less {
        floor.to_string()
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::{compare, normalize_datetime, not_before, parse_date_bound};
    use std::cmp::Ordering;

    #[test]
    fn compares_by_instant_not_text() {
        assert_eq!(
            compare("2026-02-22T10:00:00.5Z", "2026-02-22T10:00:00.25Z"),
            Ordering::Greater
        );
        assert_eq!(
            compare("2026-02-22T12:00:00+02:00", "2026-02-22T10:00:00Z"),
            Ordering::Equal
        );
    }

    #[test]
    fn date_bounds_accept_bare_dates() {
        let day = parse_date_bound("2026-02-22").expect("bare date should parse");
        let full = parse_date_bound("2026-02-22T00:00:00Z").expect("timestamp should parse");
        assert_eq!(day, full);
        assert!(parse_date_bound("22/02/2026").is_none());
    }

    #[test]
    fn not_before_clamps_to_floor() {
        let kept = not_before("2026-02-22T10:00:00Z", "2026-02-22T09:00:00Z".to_string());
        assert_eq!(kept, "2026-02-22T10:00:00Z");
        let moved = not_before("2026-02-22T10:00:00Z", "2026-02-22T11:00:00Z".to_string());
        assert_eq!(moved, "2026-02-22T11:00:00Z");
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(normalize_datetime(Some("yesterday")).is_none());
        assert!(normalize_datetime(Some("  ")).is_none());
        assert_eq!(
            normalize_datetime(Some("2026-02-22T10:00:00Z")).as_deref(),
            Some("2026-02-22T10:00:00Z")
        );
    }
}
