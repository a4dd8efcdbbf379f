//! Folds raw open events into one report row per (sender, recipient).

use crate::classifier::{strip_label, OpenClassifier};
use crate::events::OpenEvent;
use crate::signals::{DeviceSet, SignalExtractor};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Report page size.
pub const REPORT_PAGE_SIZE: usize = 100;

/// All raw opens for one sender/recipient pair. Identifiers are compared
/// case-insensitively and kept in lower case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenGroup {
    pub sender: String,
    pub recipient: String,
    pub first_sent: DateTime<Utc>,
    pub first_opened: DateTime<Utc>,
    /// Stored user-agent text per open, ordered by open time then text.
    pub user_agents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub sender: String,
    pub recipient: String,
    pub first_sent: DateTime<Utc>,
    pub first_opened: DateTime<Utc>,
    pub real_opens: usize,
    pub devices: DeviceSet,
}

/// ASCII-only case folding, matching SQLite `lower()` in the store's page query.
pub fn group_key(sender: &str, recipient: &str) -> (String, String) {
    (sender.to_ascii_lowercase(), recipient.to_ascii_lowercase())
}

/// Group raw events. Output is independent of input order.
pub fn group_opens<I>(events: I) -> Vec<OpenGroup>
where
    I: IntoIterator<Item = OpenEvent>,
{
    struct Acc {
        first_sent: DateTime<Utc>,
        first_opened: DateTime<Utc>,
        opens: Vec<(DateTime<Utc>, String)>,
    }

    let mut groups: HashMap<(String, String), Acc> = HashMap::new();
    for event in events {
        let key = group_key(&event.sender, &event.recipient);
        let acc = groups.entry(key).or_insert_with(|| Acc {
            first_sent: event.sent_at,
            first_opened: event.opened_at,
            opens: Vec::new(),
        });
        acc.first_sent = acc.first_sent.min(event.sent_at);
        acc.first_opened = acc.first_opened.min(event.opened_at);
        acc.opens.push((event.opened_at, event.user_agent));
    }

    let mut result: Vec<OpenGroup> = groups
        .into_iter()
        .map(|((sender, recipient), mut acc)| {
            acc.opens.sort();
            OpenGroup {
                sender,
                recipient,
                first_sent: acc.first_sent,
                first_opened: acc.first_opened,
                user_agents: acc.opens.into_iter().map(|(_, ua)| ua).collect(),
            }
        })
        .collect();
    result.sort_by(|a, b| {
        newest_first(
            (a.first_opened, a.sender.as_str(), a.recipient.as_str()),
            (b.first_opened, b.sender.as_str(), b.recipient.as_str()),
        )
    });
    result
}

/// Descending by first open; ties broken by sender then recipient.
fn newest_first(a: (DateTime<Utc>, &str, &str), b: (DateTime<Utc>, &str, &str)) -> Ordering {
    b.0.cmp(&a.0)
        .then_with(|| a.1.cmp(b.1))
        .then_with(|| a.2.cmp(b.2))
}

pub struct EventAggregator<'a> {
    classifier: &'a OpenClassifier,
}

impl<'a> EventAggregator<'a> {
    pub fn new(classifier: &'a OpenClassifier) -> Self {
        Self { classifier }
    }

    pub fn summarize(&self, group: &OpenGroup) -> ReportRow {
        let trusted: Vec<&str> = group
            .user_agents
            .iter()
            .map(String::as_str)
            .filter(|ua| self.classifier.is_trustworthy(ua))
            .collect();
        let devices = SignalExtractor::device_set(trusted.iter().map(|ua| strip_label(ua)));
        ReportRow {
            sender: group.sender.clone(),
            recipient: group.recipient.clone(),
            first_sent: group.first_sent,
            first_opened: group.first_opened,
            real_opens: trusted.len(),
            devices,
        }
    }

    /// One page of the report: most recent first open first, at most
    /// [`REPORT_PAGE_SIZE`] rows.
    pub fn report(&self, groups: &[OpenGroup]) -> Vec<ReportRow> {
        let mut rows: Vec<ReportRow> = groups.iter().map(|g| self.summarize(g)).collect();
        rows.sort_by(|a, b| {
            newest_first(
                (a.first_opened, a.sender.as_str(), a.recipient.as_str()),
                (b.first_opened, b.sender.as_str(), b.recipient.as_str()),
            )
        });
        rows.truncate(REPORT_PAGE_SIZE);
        rows
    }

    pub fn report_from_events<I>(&self, events: I) -> Vec<ReportRow>
    where
        I: IntoIterator<Item = OpenEvent>,
    {
        self.report(&group_opens(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{append_label, OpenLabel};
    use crate::config::HeuristicConfig;
    use crate::signals::DeviceClass;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 Mobile/15E148 Safari/604.1";
    const ANDROID: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 Chrome/120.0.0.0 Mobile Safari/537.36";
    const WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36";

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 15, 0, 0).unwrap()
    }

    fn open(sender: &str, recipient: &str, sent: i64, opened: i64, ua: &str) -> OpenEvent {
        OpenEvent::new(
            sender,
            recipient,
            base() + Duration::seconds(sent),
            base() + Duration::seconds(opened),
            "203.0.113.9",
            ua,
        )
    }

    fn classifier() -> OpenClassifier {
        OpenClassifier::from_config(&HeuristicConfig::default()).unwrap()
    }

    #[test]
    fn test_group_takes_minimums_and_counts_trusted() {
        let c = classifier();
        let events = vec![
            open("a@x.com", "b@y.com", 0, 120, IPHONE),
            open("a@x.com", "B@Y.com", -30, 300, "curl/8.0"),
            open("A@x.com", "b@y.com", 10, 60, ANDROID),
            open("a@x.com", "b@y.com", 0, 90, IPHONE),
        ];
        let rows = EventAggregator::new(&c).report_from_events(events);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.sender, "a@x.com");
        assert_eq!(row.recipient, "b@y.com");
        assert_eq!(row.first_sent, base() - Duration::seconds(30));
        assert_eq!(row.first_opened, base() + Duration::seconds(60));
        assert_eq!(row.real_opens, 3);
        assert_eq!(
            row.devices.as_slice(),
            &[DeviceClass::Android, DeviceClass::Ios]
        );
    }

    #[test]
    fn test_devices_only_from_trusted_opens() {
        let c = classifier();
        let events = vec![
            open("a@x.com", "b@y.com", 0, 60, WINDOWS),
            open("a@x.com", "b@y.com", 0, 61, "python-requests/2.31 (Linux)"),
        ];
        let rows = EventAggregator::new(&c).report_from_events(events);
        assert_eq!(rows[0].real_opens, 1);
        assert_eq!(rows[0].devices.to_string(), "Windows");
    }

    #[test]
    fn test_labelled_rows_are_reclassified_from_raw_text() {
        let c = classifier();
        let same_party = append_label(
            WINDOWS,
            &OpenLabel::Suspicious(vec![crate::suspicion::SuspicionCondition::SameParty]),
        );
        let empty = append_label(
            "",
            &OpenLabel::Suspicious(vec![crate::suspicion::SuspicionCondition::EmptyUserAgent]),
        );
        let events = vec![
            open("a@x.com", "a@x.com", 0, 10, &same_party),
            open("a@x.com", "a@x.com", 0, 11, &empty),
        ];
        let rows = EventAggregator::new(&c).report_from_events(events);
        assert_eq!(rows[0].real_opens, 1);
        assert_eq!(rows[0].devices.to_string(), "Windows");
    }

    #[test]
    fn test_group_with_no_trusted_opens_still_listed() {
        let c = classifier();
        let rows =
            EventAggregator::new(&c).report_from_events(vec![open("a@x.com", "b@y.com", 0, 5, "")]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].real_opens, 0);
        assert!(rows[0].devices.is_empty());
    }

    #[test]
    fn test_report_is_sorted_and_capped() {
        let c = classifier();
        let events: Vec<OpenEvent> = (0..150)
            .map(|i| open(&format!("s{i}@x.com"), "r@y.com", 0, i * 10, WINDOWS))
            .collect();
        let rows = EventAggregator::new(&c).report_from_events(events);
        assert_eq!(rows.len(), REPORT_PAGE_SIZE);
        assert_eq!(rows[0].sender, "s149@x.com");
        assert!(rows
            .windows(2)
            .all(|pair| pair[0].first_opened >= pair[1].first_opened));
        assert_eq!(rows[REPORT_PAGE_SIZE - 1].sender, "s50@x.com");
    }

    fn arb_event() -> impl Strategy<Value = OpenEvent> {
        let senders = prop::sample::select(vec!["a@x.com", "A@X.com", "c@z.org"]);
        let recipients = prop::sample::select(vec!["b@y.com", "d@w.net"]);
        let agents = prop::sample::select(vec![IPHONE, ANDROID, WINDOWS, "curl/8.0", ""]);
        (senders, recipients, -60i64..600, 0i64..3600, agents)
            .prop_map(|(s, r, sent, opened, ua)| open(s, r, sent, opened, ua))
    }

    proptest! {
        #[test]
        fn report_ignores_insertion_order(
            (events, shuffled) in prop::collection::vec(arb_event(), 0..40)
                .prop_flat_map(|events| {
                    let shuffled = Just(events.clone()).prop_shuffle();
                    (Just(events), shuffled)
                })
        ) {
            let c = classifier();
            let aggregator = EventAggregator::new(&c);
            prop_assert_eq!(
                aggregator.report_from_events(events),
                aggregator.report_from_events(shuffled)
            );
        }
    }
}
