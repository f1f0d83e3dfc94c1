//! Occupancy history for one world, stored as `session.json` next to it.

use crate::iso_millis;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub username: String,
    #[serde(with = "iso_millis")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "startTimestamp")]
    pub start_epoch_millis: i64,
    #[serde(
        default,
        with = "iso_millis::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "endTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub end_epoch_millis: Option<i64>,
    /// Milliseconds between start and end, set when the entry is closed.
    #[serde(rename = "duration", default, skip_serializing_if = "Option::is_none")]
    pub duration_millis: Option<i64>,
}

impl SessionEntry {
    fn open(username: &str, now: DateTime<Utc>) -> Self {
        SessionEntry {
            username: username.to_string(),
            start_time: now,
            start_epoch_millis: now.timestamp_millis(),
            end_time: None,
            end_epoch_millis: None,
            duration_millis: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    fn close_at(&mut self, end: DateTime<Utc>) -> i64 {
        let end_millis = end.timestamp_millis();
        let duration = (end_millis - self.start_epoch_millis).max(0);

        self.end_time = Some(end);
        self.end_epoch_millis = Some(end_millis);
        self.duration_millis = Some(duration);
        duration
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionLedger {
    #[serde(with = "iso_millis")]
    pub last_played: DateTime<Utc>,
    #[serde(rename = "lastPlayedTimestamp")]
    pub last_played_epoch_millis: i64,
    pub username: String,
    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatistics {
    #[serde(rename = "totalPlaytime")]
    pub total_playtime_millis: i64,
    pub session_count: usize,
    pub sessions: Vec<SessionEntry>,
}

impl SessionLedger {
    pub fn new(username: &str, now: DateTime<Utc>) -> Self {
        SessionLedger {
            last_played: now,
            last_played_epoch_millis: now.timestamp_millis(),
            username: username.to_string(),
            sessions: Vec::new(),
        }
    }

    pub fn from_json(content: &str) -> Result<Self, crate::FormatError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_json(&self) -> Result<String, crate::FormatError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Appends a new open entry and marks the ledger as played now.
    ///
    /// A previous entry that was never closed (the host went away without a
    /// clean stop) is closed with zero duration first, so at most one entry
    /// is open at any time. Returns `true` when such an entry was found.
    pub fn open(&mut self, username: &str, now: DateTime<Utc>) -> bool {
        let mut abandoned = false;
        if let Some(last) = self.sessions.last_mut() {
            if last.is_open() {
                let start = last.start_time;
                last.close_at(start);
                abandoned = true;
            }
        }

        self.sessions.push(SessionEntry::open(username, now));
        self.touch(username, now);
        abandoned
    }

    /// Closes the most recent entry if it is still open and returns its
    /// duration. An already closed entry is left untouched; only the
    /// `lastPlayed` fields and the username are refreshed.
    pub fn close(&mut self, username: &str, now: DateTime<Utc>) -> Option<i64> {
        let closed = match self.sessions.last_mut() {
            Some(last) if last.is_open() => Some(last.close_at(now)),
            _ => None,
        };

        self.touch(username, now);
        closed
    }

    pub fn open_entry(&self) -> Option<&SessionEntry> {
        self.sessions.last().filter(|entry| entry.is_open())
    }

    pub fn statistics(&self) -> ServerStatistics {
        ServerStatistics {
            total_playtime_millis: self
                .sessions
                .iter()
                .map(|entry| entry.duration_millis.unwrap_or(0))
                .sum(),
            session_count: self.sessions.len(),
            sessions: self.sessions.clone(),
        }
    }

    fn touch(&mut self, username: &str, now: DateTime<Utc>) {
        self.last_played = now;
        self.last_played_epoch_millis = now.timestamp_millis();
        self.username = username.to_string();
    }
}

/// `<minutes>m <seconds>s`
pub fn format_duration(millis: i64) -> String {
    let millis = millis.max(0);
    format!("{}m {}s", millis / 60_000, (millis % 60_000) / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 20, minute, 0).unwrap()
    }

    #[test]
    fn test_open_appends_entry_and_touches_last_played() {
        let mut ledger = SessionLedger::new("alex", at(0));
        let abandoned = ledger.open("sam", at(5));

        assert!(!abandoned);
        assert_eq!(ledger.sessions.len(), 1);
        assert_eq!(ledger.username, "sam");
        assert_eq!(ledger.last_played, at(5));
        assert_eq!(ledger.last_played_epoch_millis, at(5).timestamp_millis());
        assert!(ledger.open_entry().is_some());
    }

    #[test]
    fn test_close_computes_duration() {
        let mut ledger = SessionLedger::new("alex", at(0));
        ledger.open("alex", at(0));

        let duration = ledger.close("alex", at(30));

        assert_eq!(duration, Some(30 * 60 * 1000));
        let entry = &ledger.sessions[0];
        assert_eq!(entry.end_time, Some(at(30)));
        assert_eq!(entry.end_epoch_millis, Some(at(30).timestamp_millis()));
        assert!(ledger.open_entry().is_none());
    }

    #[test]
    fn test_close_twice_keeps_duration_but_refreshes_last_played() {
        let mut ledger = SessionLedger::new("alex", at(0));
        ledger.open("alex", at(0));
        ledger.close("alex", at(10));

        let second = ledger.close("sam", at(40));

        assert_eq!(second, None);
        assert_eq!(ledger.sessions[0].duration_millis, Some(10 * 60 * 1000));
        assert_eq!(ledger.sessions[0].end_time, Some(at(10)));
        assert_eq!(ledger.last_played, at(40));
        assert_eq!(ledger.username, "sam");
    }

    #[test]
    fn test_open_closes_abandoned_entry() {
        let mut ledger = SessionLedger::new("alex", at(0));
        ledger.open("alex", at(0));

        let abandoned = ledger.open("sam", at(50));

        assert!(abandoned);
        assert_eq!(ledger.sessions.len(), 2);
        assert_eq!(ledger.sessions[0].duration_millis, Some(0));
        assert!(ledger.sessions[1].is_open());
    }

    #[test]
    fn test_statistics_ignores_open_entries() {
        let mut ledger = SessionLedger::new("alex", at(0));
        ledger.open("alex", at(0));
        ledger.close("alex", at(20));
        ledger.open("sam", at(30));
        ledger.close("sam", at(45));
        ledger.open("alex", at(50));

        let stats = ledger.statistics();

        assert_eq!(stats.session_count, 3);
        assert_eq!(stats.total_playtime_millis, 35 * 60 * 1000);
    }

    #[test]
    fn test_json_field_names() {
        let mut ledger = SessionLedger::new("alex", at(0));
        ledger.open("alex", at(0));
        ledger.close("alex", at(0) + Duration::seconds(90));
        ledger.open("sam", at(10));

        let value: serde_json::Value = serde_json::from_str(&ledger.to_json().unwrap()).unwrap();

        assert_eq!(value["lastPlayedTimestamp"], at(10).timestamp_millis());
        assert_eq!(value["sessions"][0]["duration"], 90_000);
        assert_eq!(value["sessions"][0]["startTime"], "2024-05-10T20:00:00.000Z");
        assert!(value["sessions"][1].get("endTime").is_none());
        assert!(value["sessions"][1].get("duration").is_none());
    }

    #[test]
    fn test_parse_ledger_written_elsewhere() {
        let json = r#"{
            "lastPlayed": "2024-05-10T21:00:00.000Z",
            "lastPlayedTimestamp": 1715374800000,
            "username": "sam",
            "sessions": [
                { "username": "sam", "startTime": "2024-05-10T20:00:00.000Z", "startTimestamp": 1715371200000,
                  "endTime": "2024-05-10T21:00:00.000Z", "endTimestamp": 1715374800000, "duration": 3600000 }
            ]
        }"#;

        let ledger = SessionLedger::from_json(json).unwrap();

        assert_eq!(ledger.last_played_epoch_millis, 1_715_374_800_000);
        assert_eq!(ledger.statistics().total_playtime_millis, 3_600_000);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0m 0s");
        assert_eq!(format_duration(61_500), "1m 1s");
        assert_eq!(format_duration(3_600_000), "60m 0s");
    }
}
