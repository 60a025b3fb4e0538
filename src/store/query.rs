use std::fmt;
use std::str::FromStr;

use time::OffsetDateTime;

use crate::cancel::{CancelToken, Cancelled};
use crate::config::QuerySettings;
use crate::db::IssueRowFilter;
use crate::domain::issue::MAX_PRIORITY;
use crate::domain::timestamp::{compare, parse_rfc3339};
use crate::domain::{Issue, Status};

const CANCEL_CHECK_INTERVAL: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortMode {
    /// Most urgent first (0 = critical), then oldest.
    #[default]
    Priority,
    Oldest,
    Hybrid,
}

impl SortMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SortMode::Priority => "priority",
            SortMode::Oldest => "oldest",
            SortMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "priority" => Ok(SortMode::Priority),
            "oldest" => Ok(SortMode::Oldest),
            "hybrid" => Ok(SortMode::Hybrid),
            other => Err(format!(
                "invalid sort '{other}': expected one of priority, oldest, hybrid"
            )),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IssueQuery {
    pub statuses: Vec<Status>,
    pub priority: Option<u8>,
    pub issue_type: Option<String>,
    pub labels: Vec<String>,
    pub assignee: Option<String>,
    pub created_after: Option<OffsetDateTime>,
    pub created_before: Option<OffsetDateTime>,
    pub updated_after: Option<OffsetDateTime>,
    pub updated_before: Option<OffsetDateTime>,
    /// Closed issues are hidden unless asked for here or by a status filter.
    pub include_closed: bool,
    pub include_deleted: bool,
    pub sort: SortMode,
    pub limit: Option<usize>,
}

impl IssueQuery {
    pub fn row_filter(&self) -> IssueRowFilter {
        let statuses = if self.statuses.is_empty() && !self.include_closed {
            Status::ALL
                .into_iter()
                .filter(|status| !status.is_terminal())
                .collect()
        } else {
            self.statuses.clone()
        };

        IssueRowFilter {
            statuses,
            priority: self.priority,
            issue_type: self.issue_type.clone(),
            assignee: self.assignee.clone(),
            labels: self.labels.clone(),
            include_deleted: self.include_deleted,
        }
    }

    fn matches_dates(&self, issue: &Issue) -> bool {
        within(&issue.created_at, self.created_after, self.created_before)
            && within(&issue.updated_at, self.updated_after, self.updated_before)
    }

    pub fn without_limit(&self) -> Self {
        Self {
            limit: None,
            ..self.clone()
        }
    }
}

fn within(raw: &str, after: Option<OffsetDateTime>, before: Option<OffsetDateTime>) -> bool {
    if after.is_none() && before.is_none() {
        return true;
    }
    let Some(value) = parse_rfc3339(raw) else {
        return false;
    };
    after.map_or(true, |bound| value >= bound) && before.map_or(true, |bound| value < bound)
}

/// Applies the Rust-side filters, sort and limit to rows from the cache.
pub fn apply(
    rows: Vec<Issue>,
    query: &IssueQuery,
    weights: &QuerySettings,
    cancel: &CancelToken,
) -> Result<Vec<Issue>, Cancelled> {
    let mut issues = Vec::with_capacity(rows.len());
    for (index, issue) in rows.into_iter().enumerate() {
        if index % CANCEL_CHECK_INTERVAL == 0 {
            cancel.check()?;
        }
        if query.matches_dates(&issue) {
            issues.push(issue);
        }
    }

    sort_issues(&mut issues, query.sort, weights, OffsetDateTime::now_utc());
    cancel.check()?;
    if let Some(limit) = query.limit {
        issues.truncate(limit);
    }
    Ok(issues)
}

pub fn sort_issues(
    issues: &mut [Issue],
    mode: SortMode,
    weights: &QuerySettings,
    now: OffsetDateTime,
) {
    match mode {
        SortMode::Priority => issues.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| compare(&a.created_at, &b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        }),
        SortMode::Oldest => issues.sort_by(|a, b| {
            compare(&a.created_at, &b.created_at).then_with(|| a.id.cmp(&b.id))
        }),
        SortMode::Hybrid => {
            let ages = issues
                .iter()
                .map(|issue| age_seconds(issue, now))
                .collect::<Vec<_>>();
            let max_age = ages.iter().copied().fold(0.0_f64, f64::max);
            let mut scored = issues
                .iter()
                .cloned()
                .zip(ages)
                .map(|(issue, age)| {
                    let score = hybrid_score(issue.priority, age, max_age, weights);
                    (score, issue)
                })
                .collect::<Vec<_>>();
            scored.sort_by(|(left_score, left), (right_score, right)| {
                right_score
                    .total_cmp(left_score)
                    .then_with(|| left.id.cmp(&right.id))
            });
            for (slot, (_, issue)) in issues.iter_mut().zip(scored) {
                *slot = issue;
            }
        }
    }
}

fn age_seconds(issue: &Issue, now: OffsetDateTime) -> f64 {
    parse_rfc3339(&issue.created_at)
        .map(|created| (now - created).as_seconds_f64().max(0.0))
        .unwrap_or(0.0)
}

/// Weighted blend of normalized urgency (priority 0 scores 1.0) and
/// normalized age (oldest in the set scores 1.0).
pub fn hybrid_score(priority: u8, age: f64, max_age: f64, weights: &QuerySettings) -> f64 {
    let max_priority = f64::from(MAX_PRIORITY);
    let urgency = (max_priority - f64::from(priority.min(MAX_PRIORITY))) / max_priority;
    let normalized_age = if max_age > 0.0 { age / max_age } else { 0.0 };
    weights.priority_weight * urgency + weights.age_weight * normalized_age
}
