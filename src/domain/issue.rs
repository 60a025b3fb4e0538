use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::status::Status;

pub const MIN_PRIORITY: u8 = 0;
pub const MAX_PRIORITY: u8 = 3;
pub const DEFAULT_PRIORITY: u8 = 2;
pub const DEFAULT_ISSUE_TYPE: &str = "task";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyType {
    Blocks,
    Related,
    ParentChild,
    DiscoveredFrom,
}

impl DependencyType {
    pub const ALL: [DependencyType; 4] = [
        DependencyType::Blocks,
        DependencyType::Related,
        DependencyType::ParentChild,
        DependencyType::DiscoveredFrom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DependencyType::Blocks => "blocks",
            DependencyType::Related => "related",
            DependencyType::ParentChild => "parent-child",
            DependencyType::DiscoveredFrom => "discovered-from",
        }
    }

    /// Only `blocks` edges feed readiness and the acyclicity invariant.
    pub fn is_blocking(self) -> bool {
        self == DependencyType::Blocks
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = ParseDependencyTypeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "blocks" | "blocked-by" => Ok(DependencyType::Blocks),
            "related" => Ok(DependencyType::Related),
            "parent-child" | "parent" => Ok(DependencyType::ParentChild),
            "discovered-from" => Ok(DependencyType::DiscoveredFrom),
            _ => Err(ParseDependencyTypeError {
                value: value.to_string(),
            }),
        }
    }
}

impl Serialize for DependencyType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DependencyType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DependencyType::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "invalid dependency type '{value}': expected one of \
     blocks, related, parent-child, discovered-from"
)]
pub struct ParseDependencyTypeError {
    value: String,
}

/// Outgoing edge stored on the `from` side: the owning issue depends on `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub to: String,
    #[serde(rename = "type")]
    pub dep_type: DependencyType,
    pub created_at: String,
}

impl Dependency {
    pub fn key(&self) -> (&str, DependencyType) {
        (&self.to, self.dep_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: Status,
    pub priority: u8,
    #[serde(rename = "type")]
    pub issue_type: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_at: Option<String>,
}

impl Issue {
    pub fn is_closed(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Live issues are neither tombstoned nor closed.
    pub fn is_open(&self) -> bool {
        !self.is_closed() && !self.is_deleted()
    }

    pub fn blockers(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|dep| dep.dep_type.is_blocking())
            .map(|dep| dep.to.as_str())
    }

    pub fn has_dependency(&self, to: &str, dep_type: DependencyType) -> bool {
        self.dependencies
            .iter()
            .any(|dep| dep.to == to && dep.dep_type == dep_type)
    }

    /// Keeps `dependencies` in a canonical order so snapshots compare and
    /// encode deterministically. Types order by their wire name, matching the
    /// cache's `ORDER BY to_id, dep_type`.
    pub fn normalize(&mut self) {
        self.dependencies.sort_by(|a, b| {
            a.to.cmp(&b.to)
                .then_with(|| a.dep_type.as_str().cmp(b.dep_type.as_str()))
        });
        self.dependencies
            .dedup_by(|a, b| a.to == b.to && a.dep_type == b.dep_type);
    }
}

pub fn normalize_label(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

pub fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::str::FromStr;

    use super::{Dependency, DependencyType, Issue};
    use crate::domain::Status;

    fn sample() -> Issue {
        Issue {
            id: "bd-a1b2".to_string(),
            title: "Write the cache".to_string(),
            description: None,
            status: Status::Open,
            priority: 1,
            issue_type: "task".to_string(),
            labels: BTreeSet::new(),
            assignee: None,
            parent: None,
            created_at: "2026-02-22T10:00:00Z".to_string(),
            updated_at: "2026-02-22T10:00:00Z".to_string(),
            close_reason: None,
            closed_at: None,
            deleted_at: None,
            revision: 1,
            dependencies: Vec::new(),
            history_digest: None,
            compacted_at: None,
        }
    }

    #[test]
    fn parses_dependency_type_spellings() {
        assert_eq!(
            DependencyType::from_str("parent_child").unwrap(),
            DependencyType::ParentChild
        );
        assert_eq!(
            DependencyType::from_str("Discovered-From").unwrap(),
            DependencyType::DiscoveredFrom
        );
        assert!(DependencyType::from_str("duplicates").is_err());
    }

    #[test]
    fn json_uses_type_key_and_omits_empty_options() {
        let value = serde_json::to_value(sample()).expect("issue should serialize");
        assert_eq!(value["type"], "task");
        assert_eq!(value["status"], "open");
        assert!(value.get("description").is_none());
        assert!(value.get("close_reason").is_none());
    }

    #[test]
    fn normalize_sorts_and_dedups_dependencies() {
        let mut issue = sample();
        let dep = |to: &str, dep_type| Dependency {
            to: to.to_string(),
            dep_type,
            created_at: "2026-02-22T10:00:00Z".to_string(),
        };
        issue.dependencies = vec![
            dep("bd-zz", DependencyType::Related),
            dep("bd-aa", DependencyType::Blocks),
            dep("bd-zz", DependencyType::Related),
        ];
        issue.normalize();
        assert_eq!(issue.dependencies.len(), 2);
        assert_eq!(issue.dependencies[0].to, "bd-aa");
        assert_eq!(issue.blockers().collect::<Vec<_>>(), vec!["bd-aa"]);
    }

    #[test]
    fn normalize_orders_types_by_wire_name() {
        let mut issue = sample();
        let dep = |dep_type| Dependency {
            to: "bd-p".to_string(),
            dep_type,
            created_at: "2026-02-22T10:00:00Z".to_string(),
        };
        issue.dependencies = vec![
            dep(DependencyType::ParentChild),
            dep(DependencyType::DiscoveredFrom),
            dep(DependencyType::Blocks),
        ];
        issue.normalize();
        let types = issue
            .dependencies
            .iter()
            .map(|dep| dep.dep_type.as_str())
            .collect::<Vec<_>>();
        assert_eq!(types, vec!["blocks", "discovered-from", "parent-child"]);
    }
}
