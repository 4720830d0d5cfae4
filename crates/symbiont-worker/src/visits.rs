//! Page-visit ingestion for the content-script context.
//!
//! A content script reports one JSON object per line on stdin:
//!
//! ```text
//! {"url": "https://docs.example/guide", "dwellMs": 4200}
//! ```
//!
//! [`VisitTracker`] folds each report into the behavior record for its URL.
//! The caller hands the updated record to the write debouncer, so a burst of
//! reports for one page reaches storage as a single write.

use std::collections::HashMap;

use serde::Deserialize;
use symbiont_types::BehaviorRecord;

/// One page-visit report.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    /// The visited page.
    pub url: String,
    /// Foreground time spent on the page during this visit.
    #[serde(default)]
    pub dwell_ms: u64,
}

impl Visit {
    /// Parse one input line; blank lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Result<Self, serde_json::Error>> {
        let line = line.trim();
        (!line.is_empty()).then(|| serde_json::from_str(line))
    }
}

/// Behavior records accumulated from visits seen by this context.
#[derive(Debug, Default)]
pub struct VisitTracker {
    records: HashMap<String, BehaviorRecord>,
}

impl VisitTracker {
    /// Seed the tracker with a record already known to storage.
    pub fn seed(&mut self, record: BehaviorRecord) {
        self.records.insert(record.url.clone(), record);
    }

    /// Whether a record for `url` is already tracked.
    pub fn knows(&self, url: &str) -> bool {
        self.records.contains_key(url)
    }

    /// Fold `visit` into its record and return the updated record.
    pub fn record(&mut self, visit: Visit) -> &BehaviorRecord {
        let record = self
            .records
            .entry(visit.url)
            .and_modify(|record| record.record_visit(visit.dwell_ms))
            .or_insert_with_key(|url| {
                let mut record = BehaviorRecord::first_visit(url.clone());
                record.total_time_ms = visit.dwell_ms;
                record
            });
        record
    }

    /// Number of distinct URLs tracked.
    pub fn tracked(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_reports_and_skips_blank_lines() {
        assert!(Visit::parse_line("   ").is_none());
        let visit = Visit::parse_line(r#"{"url": "https://a.example/", "dwellMs": 1500}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            visit,
            Visit {
                url: String::from("https://a.example/"),
                dwell_ms: 1_500,
            }
        );
        let bare = Visit::parse_line(r#"{"url": "https://b.example/"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(bare.dwell_ms, 0);
        assert!(Visit::parse_line("not json").unwrap().is_err());
    }

    #[test]
    fn repeated_visits_accumulate() {
        let mut tracker = VisitTracker::default();
        let url = "https://docs.example/guide";
        for dwell_ms in [1_000, 2_000, 500] {
            tracker.record(Visit {
                url: url.to_owned(),
                dwell_ms,
            });
        }
        let record = tracker.record(Visit {
            url: url.to_owned(),
            dwell_ms: 0,
        });
        assert_eq!(record.visits, 4);
        assert_eq!(record.total_time_ms, 3_500);
        assert_eq!(record.domain, "docs.example");
        assert_eq!(tracker.tracked(), 1);
    }

    #[test]
    fn seeded_records_continue_counting() {
        let mut tracker = VisitTracker::default();
        let mut known = BehaviorRecord::first_visit("https://news.example/");
        known.visits = 10;
        known.total_time_ms = 60_000;
        tracker.seed(known);
        assert!(tracker.knows("https://news.example/"));

        let record = tracker.record(Visit {
            url: String::from("https://news.example/"),
            dwell_ms: 5_000,
        });
        assert_eq!((record.visits, record.total_time_ms), (11, 65_000));
    }
}
