use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod layout;
pub mod session;
pub mod staleness;

pub use layout::{classify, ServerKind, WorldLayout};
pub use session::{format_duration, ServerStatistics, SessionEntry, SessionLedger};
pub use staleness::should_pull;

pub const LOCK_FILE_NAME: &str = "server.lock";
pub const SESSION_FILE_NAME: &str = "session.json";
pub const DEFAULT_PREFIX: &str = "pass_the_host";

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("invalid server id {0:?}")]
    InvalidServerId(String),
    #[error("missing or empty field `{0}`")]
    MissingField(&'static str),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Identity of one world. Used verbatim as a local directory name and as a
/// storage key segment, so it can never contain a path separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Result<Self, FormatError> {
        let id = id.into();
        let valid = !id.trim().is_empty()
            && id != "."
            && id != ".."
            && !id
                .chars()
                .any(|c| matches!(c, '/' | '\\' | ':') || c.is_control());

        if valid {
            Ok(ServerId(id))
        } else {
            Err(FormatError::InvalidServerId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerId {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServerId::new(s)
    }
}

impl AsRef<str> for ServerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Occupancy record, stored as `server.lock`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Lock {
    #[serde(rename = "username")]
    pub owner: String,
    #[serde(rename = "startedAt", with = "iso_millis")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "timestamp")]
    pub epoch_millis: i64,
}

// Older lock files may omit `timestamp`; `startedAt` is authoritative then.
#[derive(Deserialize)]
struct RawLock {
    username: Option<String>,
    #[serde(rename = "startedAt")]
    started_at: Option<String>,
    timestamp: Option<i64>,
}

impl Lock {
    /// `now` is truncated to the millisecond precision the file stores.
    pub fn new(owner: impl Into<String>, now: DateTime<Utc>) -> Self {
        let now = now.trunc_subsecs(3);
        Lock {
            owner: owner.into(),
            started_at: now,
            epoch_millis: now.timestamp_millis(),
        }
    }

    pub fn from_json(content: &str) -> Result<Self, FormatError> {
        let raw: RawLock = serde_json::from_str(content)?;

        let owner = raw
            .username
            .filter(|u| !u.trim().is_empty())
            .ok_or(FormatError::MissingField("username"))?;
        let started_at = raw
            .started_at
            .as_deref()
            .and_then(iso_millis::parse)
            .ok_or(FormatError::MissingField("startedAt"))?;

        Ok(Lock {
            owner,
            epoch_millis: raw.timestamp.unwrap_or(started_at.timestamp_millis()),
            started_at,
        })
    }

    pub fn to_json(&self) -> Result<String, FormatError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub percent: u8,
    pub transferred: String,
    pub total: String,
}

impl TransferProgress {
    pub fn started() -> Self {
        TransferProgress {
            percent: 0,
            transferred: "0 B".to_string(),
            total: "0 B".to_string(),
        }
    }

    pub fn complete() -> Self {
        TransferProgress {
            percent: 100,
            transferred: "Complete".to_string(),
            total: "Complete".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub kind: ServerKind,
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {})",
            self.name,
            self.kind,
            self.version.as_deref().unwrap_or("Unknown")
        )
    }
}

/// Formats a byte count the way the sync tool prints its stats.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.3} {}", value, UNITS[unit])
}

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(time: &DateTime<Utc>) -> String {
        time.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(text: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {:?}", text)))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            time: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match time {
                Some(time) => super::serialize(time, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let text: Option<String> = Option::deserialize(deserializer)?;
            match text {
                Some(text) => super::parse(&text)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {:?}", text))),
                None => Ok(None),
            }
        }
    }
}
