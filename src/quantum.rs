use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};

/// Time granularities a field records, expressed as a subset of "YMDH" in
/// that order. An empty quantum means no time views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeQuantum(String);

impl TimeQuantum {
    pub fn parse(s: &str) -> DbResult<TimeQuantum> {
        let order = "YMDH";
        let mut last = None;
        for ch in s.chars() {
            let idx = order
                .find(ch)
                .ok_or_else(|| DbError::InvalidTimeQuantum(s.to_string()))?;
            if let Some(prev) = last {
                if idx <= prev {
                    return Err(DbError::InvalidTimeQuantum(s.to_string()));
                }
            }
            last = Some(idx);
        }
        Ok(TimeQuantum(s.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn has(&self, unit: char) -> bool {
        self.0.contains(unit)
    }
}

fn view_suffix(t: DateTime<Utc>, unit: char) -> String {
    match unit {
        'Y' => t.format("%Y").to_string(),
        'M' => t.format("%Y%m").to_string(),
        'D' => t.format("%Y%m%d").to_string(),
        _ => t.format("%Y%m%d%H").to_string(),
    }
}

/// View names a timestamped write lands in, one per enabled granularity.
pub fn views_by_time(base: &str, t: DateTime<Utc>, q: &TimeQuantum) -> Vec<String> {
    "YMDH"
        .chars()
        .filter(|&unit| q.has(unit))
        .map(|unit| format!("{}_{}", base, view_suffix(t, unit)))
        .collect()
}

/// The minimal set of views covering `[from, to)`, greedily emitting the
/// largest enabled granularity that fits at each step.
pub fn views_by_time_range(
    base: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    q: &TimeQuantum,
) -> Vec<String> {
    let mut views = Vec::new();
    let mut t = from;
    while t < to {
        let (name, next) = next_view(base, t, to, q);
        match next {
            Some(next) if next > t => {
                if let Some(name) = name {
                    views.push(name);
                }
                t = next;
            }
            _ => break,
        }
    }
    views
}

/// Pick the coarsest enabled unit aligned at `t` that ends by `to`.
fn next_view(
    base: &str,
    t: DateTime<Utc>,
    to: DateTime<Utc>,
    q: &TimeQuantum,
) -> (Option<String>, Option<DateTime<Utc>>) {
    if q.has('Y') && t.month() == 1 && t.day() == 1 && t.hour() == 0 {
        if let Some(end) = Utc.with_ymd_and_hms(t.year() + 1, 1, 1, 0, 0, 0).single() {
            if end <= to {
                return (Some(format!("{}_{}", base, view_suffix(t, 'Y'))), Some(end));
            }
        }
    }
    if q.has('M') && t.day() == 1 && t.hour() == 0 {
        let (y, m) = if t.month() == 12 {
            (t.year() + 1, 1)
        } else {
            (t.year(), t.month() + 1)
        };
        if let Some(end) = Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single() {
            if end <= to {
                return (Some(format!("{}_{}", base, view_suffix(t, 'M'))), Some(end));
            }
        }
    }
    if q.has('D') && t.hour() == 0 {
        let end = t + Duration::days(1);
        if end <= to {
            return (Some(format!("{}_{}", base, view_suffix(t, 'D'))), Some(end));
        }
    }
    if q.has('H') {
        let end = t + Duration::hours(1);
        if end <= to {
            return (Some(format!("{}_{}", base, view_suffix(t, 'H'))), Some(end));
        }
        // Partial trailing hour: nothing finer to emit.
        return (None, Some(to));
    }
    // No unit fits; advance to the end without emitting.
    (None, Some(to))
}

/// Parse a PQL timestamp. Accepts `YYYY-MM-DDTHH:MM` and `YYYY-MM-DD`.
pub fn parse_timestamp(s: &str) -> DbResult<DateTime<Utc>> {
    if let Ok(t) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M") {
        return Ok(t.and_utc());
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(t.and_utc());
        }
    }
    Err(DbError::InvalidQuery(format!("bad timestamp '{}'", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    #[test]
    fn test_parse_quantum() {
        assert!(TimeQuantum::parse("").unwrap().is_empty());
        assert_eq!(TimeQuantum::parse("YMDH").unwrap().as_str(), "YMDH");
        assert_eq!(TimeQuantum::parse("MD").unwrap().as_str(), "MD");
        assert!(TimeQuantum::parse("X").is_err());
        assert!(TimeQuantum::parse("MY").is_err());
        assert!(TimeQuantum::parse("YY").is_err());
    }

    #[test]
    fn test_views_by_time() {
        let q = TimeQuantum::parse("YMDH").unwrap();
        let views = views_by_time("standard", ts("2016-01-02T03:00"), &q);
        assert_eq!(
            views,
            vec![
                "standard_2016",
                "standard_201601",
                "standard_20160102",
                "standard_2016010203",
            ]
        );

        let q = TimeQuantum::parse("D").unwrap();
        let views = views_by_time("standard", ts("2016-01-02T03:00"), &q);
        assert_eq!(views, vec!["standard_20160102"]);
    }

    #[test]
    fn test_views_by_time_range_days() {
        let q = TimeQuantum::parse("D").unwrap();
        let views = views_by_time_range("standard", ts("2016-01-01"), ts("2016-01-04"), &q);
        assert_eq!(
            views,
            vec!["standard_20160101", "standard_20160102", "standard_20160103"]
        );
    }

    #[test]
    fn test_views_by_time_range_mixed_granularity() {
        let q = TimeQuantum::parse("YMDH").unwrap();
        // Dec 31 2015 through Feb 1 2016: one day, one month, one day.
        let views = views_by_time_range("standard", ts("2015-12-31"), ts("2016-02-02"), &q);
        assert_eq!(
            views,
            vec![
                "standard_20151231",
                "standard_201601",
                "standard_20160201",
            ]
        );
    }

    #[test]
    fn test_views_by_time_range_whole_year() {
        let q = TimeQuantum::parse("YMDH").unwrap();
        let views = views_by_time_range("standard", ts("2016-01-01"), ts("2017-01-01"), &q);
        assert_eq!(views, vec!["standard_2016"]);
    }

    #[test]
    fn test_parse_timestamp() {
        assert!(parse_timestamp("2016-01-01T00:00").is_ok());
        assert!(parse_timestamp("2016-01-01").is_ok());
        assert!(parse_timestamp("not-a-time").is_err());
    }
}
