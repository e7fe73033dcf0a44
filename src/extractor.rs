//! Turns decoded log lines into break-in attempts and ban events for one
//! report month.
//!
//! Syslog timestamps have one second resolution and no year, and sshd often
//! logs several rejections per second. Attempts are keyed by timestamp, so a
//! colliding key is moved forward one second at a time (wrapping 59 -> 0
//! inside the minute) until a free slot is found.

use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, Timelike};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::matcher::{LineMatcher, LogKind};
use crate::models::{AttemptDetails, BanEvent, BreakinAttempt};

/// The calendar month being reported on (the one before "today")
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportMonth {
    first_day: NaiveDate,
}

impl ReportMonth {
    /// The month preceding `today`
    pub fn preceding(today: NaiveDate) -> Self {
        Self {
            first_day: first_of_previous_month(today),
        }
    }

    /// The month preceding the local date
    pub fn current() -> Self {
        Self::preceding(Local::now().date_naive())
    }

    pub fn first_day(&self) -> NaiveDate {
        self.first_day
    }

    pub fn year(&self) -> i32 {
        self.first_day.year()
    }

    pub fn month(&self) -> u32 {
        self.first_day.month()
    }

    /// "Jan", "Feb", ... as printed by syslog
    pub fn abbreviation(&self) -> String {
        self.first_day.format("%b").to_string()
    }

    /// Files last modified before this instant cannot hold lines from the
    /// report month: midnight on the first day of the month before it.
    pub fn retention_cutoff(&self) -> NaiveDateTime {
        first_of_previous_month(self.first_day).and_time(chrono::NaiveTime::MIN)
    }
}

fn first_of_previous_month(date: NaiveDate) -> NaiveDate {
    let last_of_previous = date - Duration::days(i64::from(date.day()));
    last_of_previous - Duration::days(i64::from(last_of_previous.day()) - 1)
}

/// Attempts and bans collected over every file of a run
#[derive(Debug, Default, Clone)]
pub struct EventAccumulator {
    attempts: BTreeMap<NaiveDateTime, AttemptDetails>,
    bans: BTreeSet<BanEvent>,
}

impl EventAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an attempt under the first free timestamp at or after `timestamp`.
    /// Returns the key actually used.
    pub fn insert_attempt(
        &mut self,
        timestamp: NaiveDateTime,
        details: AttemptDetails,
    ) -> NaiveDateTime {
        let key = self.free_attempt_slot(timestamp);
        self.attempts.insert(key, details);
        key
    }

    fn free_attempt_slot(&self, timestamp: NaiveDateTime) -> NaiveDateTime {
        if !self.attempts.contains_key(&timestamp) {
            return timestamp;
        }

        let minute_start = timestamp - Duration::seconds(i64::from(timestamp.second()));
        let mut second = timestamp.second();
        for _ in 0..59 {
            second = (second + 1) % 60;
            let candidate = minute_start + Duration::seconds(i64::from(second));
            if !self.attempts.contains_key(&candidate) {
                return candidate;
            }
        }

        // Every second of that minute is taken
        let mut candidate = minute_start + Duration::minutes(1);
        while self.attempts.contains_key(&candidate) {
            candidate += Duration::seconds(1);
        }
        candidate
    }

    /// Returns false if the same ban was already collected
    pub fn insert_ban(&mut self, ban: BanEvent) -> bool {
        self.bans.insert(ban)
    }

    pub fn attempts(&self) -> &BTreeMap<NaiveDateTime, AttemptDetails> {
        &self.attempts
    }

    pub fn bans(&self) -> &BTreeSet<BanEvent> {
        &self.bans
    }

    /// Attempts in timestamp order
    pub fn breakin_attempts(&self) -> impl Iterator<Item = BreakinAttempt> + '_ {
        self.attempts.iter().map(|(ts, details)| BreakinAttempt {
            timestamp: *ts,
            source_ip: details.source_ip.clone(),
            username: details.username.clone(),
        })
    }

    /// Distinct addresses that made at least one attempt
    pub fn attempt_ips(&self) -> BTreeSet<String> {
        self.attempts
            .values()
            .map(|d| d.source_ip.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty() && self.bans.is_empty()
    }
}

/// Drives the line matcher over a source and filters to the report month
pub struct EventExtractor {
    matcher: LineMatcher,
    month: ReportMonth,
}

impl EventExtractor {
    pub fn new(matcher: LineMatcher, month: ReportMonth) -> Self {
        Self { matcher, month }
    }

    /// Feed one source's lines into `acc`. Returns the number of events accepted.
    pub fn extract<I, S>(&self, lines: I, kind: LogKind, acc: &mut EventAccumulator) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut accepted = 0;
        for line in lines {
            let line = line.as_ref();
            let hit = match kind {
                LogKind::Auth => self.extract_attempt(line, acc),
                LogKind::Ban => self.extract_ban(line, acc),
            };
            if hit {
                accepted += 1;
            }
        }
        accepted
    }

    fn extract_attempt(&self, line: &str, acc: &mut EventAccumulator) -> bool {
        let Some(m) = self.matcher.match_auth(line) else {
            return false;
        };

        if m.month_abbreviation() != self.month.abbreviation() {
            return false;
        }

        let timestamp = match m.timestamp(self.month.year()) {
            Ok(ts) => ts,
            Err(e) => {
                warn!("Skipping auth line: {}", e);
                return false;
            }
        };

        let key = acc.insert_attempt(
            timestamp,
            AttemptDetails {
                source_ip: m.ip.to_string(),
                username: m.username.map(str::to_string),
            },
        );
        if key != timestamp {
            debug!(
                "{:?} attempt from {} at {} stored as {}",
                m.grammar, m.ip, timestamp, key
            );
        }
        true
    }

    fn extract_ban(&self, line: &str, acc: &mut EventAccumulator) -> bool {
        let Some(m) = self.matcher.match_ban(line) else {
            return false;
        };

        let timestamp = match m.timestamp() {
            Ok(ts) => ts,
            Err(e) => {
                warn!("Skipping ban line: {}", e);
                return false;
            }
        };

        // Month only, the year is not compared
        if timestamp.month() != self.month.month() {
            return false;
        }

        acc.insert_ban(BanEvent {
            timestamp,
            source_ip: m.ip.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn june_extractor() -> EventExtractor {
        EventExtractor::new(LineMatcher::new().unwrap(), ReportMonth::preceding(date(2024, 7, 16)))
    }

    #[test]
    fn test_report_month() {
        let month = ReportMonth::preceding(date(2024, 7, 16));
        assert_eq!(month.first_day(), date(2024, 6, 1));
        assert_eq!(month.abbreviation(), "Jun");
        assert_eq!(month.retention_cutoff(), ts("2024-05-01 00:00:00"));
    }

    #[test]
    fn test_report_month_year_boundary() {
        let month = ReportMonth::preceding(date(2025, 1, 1));
        assert_eq!(month.first_day(), date(2024, 12, 1));
        assert_eq!(month.year(), 2024);
        assert_eq!(month.retention_cutoff(), ts("2024-11-01 00:00:00"));

        let month = ReportMonth::preceding(date(2024, 3, 31));
        assert_eq!(month.first_day(), date(2024, 2, 1));
        assert_eq!(month.retention_cutoff(), ts("2024-01-01 00:00:00"));
    }

    #[test]
    fn test_attempt_year_from_report_month() {
        let extractor = EventExtractor::new(
            LineMatcher::new().unwrap(),
            ReportMonth::preceding(date(2025, 1, 3)),
        );
        let mut acc = EventAccumulator::new();
        extractor.extract(
            ["Dec 31 23:59:59 host sshd[1]: Invalid user a from 1.2.3.4"],
            LogKind::Auth,
            &mut acc,
        );
        assert!(acc.attempts().contains_key(&ts("2024-12-31 23:59:59")));
    }

    #[test]
    fn test_month_filter() {
        let extractor = june_extractor();
        let mut acc = EventAccumulator::new();
        let lines = [
            "Jun 10 12:40:05 host sshd[1]: Invalid user admin from 61.174.51.217",
            "May 31 23:59:59 host sshd[1]: Invalid user admin from 61.174.51.218",
            "Jul  1 00:00:00 host sshd[1]: User root from 61.174.51.219 not allowed because none",
        ];

        assert_eq!(extractor.extract(lines, LogKind::Auth, &mut acc), 1);
        let ips = acc.attempt_ips();
        assert_eq!(ips.len(), 1);
        assert!(ips.contains("61.174.51.217"));
    }

    #[test]
    fn test_collisions_get_distinct_keys() {
        let extractor = june_extractor();
        let mut acc = EventAccumulator::new();
        let lines: Vec<String> = (0..5)
            .map(|i| format!("Jun 10 12:40:05 host sshd[1]: Invalid user u{} from 10.0.0.1", i))
            .collect();

        assert_eq!(extractor.extract(&lines, LogKind::Auth, &mut acc), 5);
        let keys: Vec<_> = acc.attempts().keys().copied().collect();
        assert_eq!(
            keys,
            vec![
                ts("2024-06-10 12:40:05"),
                ts("2024-06-10 12:40:06"),
                ts("2024-06-10 12:40:07"),
                ts("2024-06-10 12:40:08"),
                ts("2024-06-10 12:40:09"),
            ]
        );
        assert_eq!(
            acc.attempts()[&ts("2024-06-10 12:40:09")].username.as_deref(),
            Some("u4")
        );
    }

    #[test]
    fn test_collision_wraps_inside_minute() {
        let mut acc = EventAccumulator::new();
        let details = || AttemptDetails {
            source_ip: "10.0.0.1".to_string(),
            username: None,
        };

        acc.insert_attempt(ts("2024-06-10 12:40:58"), details());
        acc.insert_attempt(ts("2024-06-10 12:40:59"), details());
        let key = acc.insert_attempt(ts("2024-06-10 12:40:58"), details());

        assert_eq!(key, ts("2024-06-10 12:40:00"));
        assert_eq!(acc.attempts().len(), 3);
    }

    #[test]
    fn test_full_minute_never_drops_events() {
        let mut acc = EventAccumulator::new();
        for _ in 0..61 {
            acc.insert_attempt(
                ts("2024-06-10 12:40:30"),
                AttemptDetails {
                    source_ip: "10.0.0.1".to_string(),
                    username: Some("root".to_string()),
                },
            );
        }

        assert_eq!(acc.attempts().len(), 61);
        assert!(acc.attempts().contains_key(&ts("2024-06-10 12:41:00")));
    }

    #[test]
    fn test_accumulates_across_calls() {
        let extractor = june_extractor();
        let mut acc = EventAccumulator::new();
        let line = ["Jun 10 12:40:05 host sshd[1]: Invalid user admin from 10.0.0.1"];

        extractor.extract(line, LogKind::Auth, &mut acc);
        extractor.extract(line, LogKind::Auth, &mut acc);

        assert_eq!(acc.attempts().len(), 2);
    }

    #[test]
    fn test_bad_timestamp_skips_line_only() {
        let extractor = june_extractor();
        let mut acc = EventAccumulator::new();
        let lines = [
            "Jun 31 12:40:05 host sshd[1]: Invalid user admin from 10.0.0.1",
            "Jun 30 12:40:05 host sshd[1]: Invalid user admin from 10.0.0.2",
        ];

        assert_eq!(extractor.extract(lines, LogKind::Auth, &mut acc), 1);
        assert!(acc.attempt_ips().contains("10.0.0.2"));
    }

    #[test]
    fn test_ban_extraction() {
        let extractor = june_extractor();
        let mut acc = EventAccumulator::new();
        let lines = [
            "2024-06-10 12:40:07,363 fail2ban.actions: WARNING [ssh] Ban 61.174.51.217",
            "2024-06-10 12:40:07,900 fail2ban.actions: WARNING [ssh] Ban 61.174.51.218",
            "2024-05-30 12:40:07,363 fail2ban.actions: WARNING [ssh] Ban 61.174.51.219",
            // Month only: another year's June is still accepted
            "2023-06-01 00:00:00,001 fail2ban.actions: WARNING [ssh] Ban 61.174.51.220",
        ];

        assert_eq!(extractor.extract(lines, LogKind::Ban, &mut acc), 3);
        let ips: Vec<_> = acc.bans().iter().map(|b| b.source_ip.as_str()).collect();
        assert!(ips.contains(&"61.174.51.217"));
        assert!(ips.contains(&"61.174.51.218"));
        assert!(ips.contains(&"61.174.51.220"));
        assert!(acc.attempts().is_empty());
    }

    #[test]
    fn test_kinds_do_not_cross() {
        let extractor = june_extractor();
        let mut acc = EventAccumulator::new();

        extractor.extract(
            ["2024-06-10 12:40:07,363 fail2ban.actions: WARNING [ssh] Ban 1.2.3.4"],
            LogKind::Auth,
            &mut acc,
        );
        extractor.extract(
            ["Jun 10 12:40:05 host sshd[1]: Invalid user admin from 1.2.3.4"],
            LogKind::Ban,
            &mut acc,
        );

        assert!(acc.is_empty());
    }
}
