use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Open,
        Status::InProgress,
        Status::Blocked,
        Status::Closed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Open => "open",
            Status::InProgress => "in_progress",
            Status::Blocked => "blocked",
            Status::Closed => "closed",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Status::Closed
    }

    /// `closed` is terminal; reopening means filing a new issue with a
    /// `related` edge back to the old one.
    pub fn can_transition_to(self, next: Status) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self == next || next == Status::Closed {
            return true;
        }

        matches!(
            (self, next),
            (Status::Open, Status::InProgress)
                | (Status::Open, Status::Blocked)
                | (Status::InProgress, Status::Blocked)
                | (Status::Blocked, Status::Open)
                | (Status::Blocked, Status::InProgress)
        )
    }

    pub fn validate_transition(self, next: Status) -> Result<(), InvalidStatusTransition> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(InvalidStatusTransition {
            from: self,
            to: next,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        let status = match normalized.as_str() {
            "open" | "todo" => Status::Open,
            "in_progress" | "wip" | "doing" => Status::InProgress,
            "blocked" => Status::Blocked,
            "closed" | "done" => Status::Closed,
            _ => {
                return Err(ParseStatusError {
                    value: value.to_string(),
                });
            }
        };

        Ok(status)
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Status::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "invalid status '{value}': expected one of open, in_progress, blocked, closed"
)]
pub struct ParseStatusError {
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition: {from} -> {to}")]
pub struct InvalidStatusTransition {
    pub from: Status,
    pub to: Status,
}
