//! Shared data types for cadence-scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::SchedulerError;

// ---------------------------------------------------------------------------
// JobId / LogId
// ---------------------------------------------------------------------------

/// Opaque identifier for a scheduled job.
///
/// A thin wrapper around a UUID string so the internal representation can
/// change without breaking callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh random job ID (UUIDv4).
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a single execution log. Same representation as [`JobId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogId(pub String);

impl LogId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for LogId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Frequency
// ---------------------------------------------------------------------------

/// Base unit of a recurrence rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Frequency {
    Yearly,
    Monthly,
    Weekly,
    Daily,
    Hourly,
    Minutely,
    Secondly,
}

impl Frequency {
    pub const ALL: [Frequency; 7] = [
        Frequency::Yearly,
        Frequency::Monthly,
        Frequency::Weekly,
        Frequency::Daily,
        Frequency::Hourly,
        Frequency::Minutely,
        Frequency::Secondly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Yearly => "YEARLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Daily => "DAILY",
            Frequency::Hourly => "HOURLY",
            Frequency::Minutely => "MINUTELY",
            Frequency::Secondly => "SECONDLY",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Frequency {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Frequency::ALL
            .into_iter()
            .find(|freq| freq.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SchedulerError::UnknownFrequency(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Run state derived from a job's `disabled` and `is_running` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Never selected as due; `next_run` is empty.
    Disabled,
    /// Enabled and waiting for its `next_run`.
    Idle,
    /// An execution is in flight.
    Running,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Disabled => "disabled",
            JobState::Idle => "idle",
            JobState::Running => "running",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Someone who receives a job's output after every run that produced any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub full_name: String,
    pub email: String,
}

impl Subscriber {
    pub fn new(full_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            email: email.into(),
        }
    }

    /// Contact address in mailbox form: `"Full Name" <email>`.
    pub fn address(&self) -> String {
        format!("\"{}\" <{}>", self.full_name, self.email)
    }
}

impl std::str::FromStr for Subscriber {
    type Err = String;

    /// Accepts `Full Name <email>` or a bare `email`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match (s.find('<'), s.rfind('>')) {
            (Some(open), Some(close)) if open < close => {
                let name = s[..open].trim().trim_matches('"').trim();
                let email = s[open + 1..close].trim();
                if email.is_empty() {
                    return Err(format!("missing email in subscriber: {s}"));
                }
                Ok(Subscriber::new(name, email))
            }
            (None, None) if s.contains('@') => Ok(Subscriber::new("", s)),
            _ => Err(format!("invalid subscriber: {s}")),
        }
    }
}
