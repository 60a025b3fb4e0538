use std::io::{self, IsTerminal};

use serde::Serialize;

use crate::app::{CycleReport, EventsView, IssueDetail};
use crate::compact::{CompactReport, CompactSummary};
use crate::doctor::{DoctorReport, DoctorStatus};
use crate::domain::{Issue, Status};
use crate::graph::{BlockedIssue, TreeNode};
use crate::init::InitReport;
use crate::presence::HealthReport;
use crate::sync::{ReconcileSummary, SyncReport, SyncStatus};

/// `{issues: [...], total: N}`, the list shape every command shares.
#[derive(Debug, Serialize)]
pub struct IssueList<'a, T: Serialize> {
    pub issues: &'a [T],
    pub total: usize,
}

impl<'a, T: Serialize> IssueList<'a, T> {
    pub fn new(issues: &'a [T]) -> Self {
        Self {
            issues,
            total: issues.len(),
        }
    }
}

pub fn print_json(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).expect("json serialization should work")
    );
}

pub fn print_issue_line(verb: &str, issue: &Issue) {
    let palette = Palette::auto();
    println!(
        "{verb} {} {} {}",
        palette.id(&issue.id),
        palette.status(issue.status),
        issue.title
    );
}

pub fn print_issue_detail(detail: &IssueDetail) {
    let palette = Palette::auto();
    let issue = &detail.issue;
    println!(
        "{} {} {}",
        palette.id(&issue.id),
        palette.status(issue.status),
        palette.heading(&issue.title)
    );
    println!(
        "  priority P{}  type {}  rev {}",
        issue.priority, issue.issue_type, issue.revision
    );
    if let Some(assignee) = &issue.assignee {
        println!("  assignee {assignee}");
    }
    if let Some(parent) = &issue.parent {
        println!("  parent {}", palette.id(parent));
    }
    if !issue.labels.is_empty() {
        let labels = issue.labels.iter().cloned().collect::<Vec<_>>();
        println!("  {}", palette.labels(&format!("#{}", labels.join(" #"))));
    }
    println!(
        "  {}",
        palette.dim(&format!(
            "created {}  updated {}",
            issue.created_at, issue.updated_at
        ))
    );
    if let Some(reason) = &issue.close_reason {
        println!("  closed: {reason}");
    }
    if let Some(deleted_at) = &issue.deleted_at {
        println!("  {}", palette.warn(&format!("deleted {deleted_at}")));
    }
    if let Some(digest) = &issue.history_digest {
        println!("  {}", palette.dim(&format!("history: {digest}")));
    }
    if let Some(description) = &issue.description {
        println!();
        for line in description.lines() {
            println!("  {line}");
        }
    }
    if !issue.dependencies.is_empty() {
        println!();
        println!("  depends on:");
        for dep in &issue.dependencies {
            println!("    {} {}", palette.dim(dep.dep_type.as_str()), palette.id(&dep.to));
        }
    }
    if !detail.open_blockers.is_empty() {
        println!(
            "  {}",
            palette.warn(&format!("blocked by {}", detail.open_blockers.join(", ")))
        );
    }
    if !detail.dependents.is_empty() {
        println!("  dependents: {}", detail.dependents.join(", "));
    }
    if let Some(conflict) = &detail.conflict {
        println!("  {}", palette.fail(&format!("sync conflict: {conflict}")));
    }
}

pub fn print_issue_list(heading: &str, issues: &[Issue]) {
    let palette = Palette::auto();
    println!("{}", palette.heading(heading));
    if issues.is_empty() {
        println!("{}", palette.dim("no issues matched"));
        return;
    }
    for issue in issues {
        println!("{}", format_issue_row(issue, &palette));
    }
    println!("{}", palette.dim(&format!("{} issue(s)", issues.len())));
}

fn format_issue_row(issue: &Issue, palette: &Palette) -> String {
    let mut line = format!(
        "{} {} P{} {}",
        palette.id(&issue.id),
        palette.status(issue.status),
        issue.priority,
        issue.title
    );
    line.push(' ');
    line.push_str(&palette.type_label(&issue.issue_type));
    if let Some(assignee) = &issue.assignee {
        line.push_str(&format!(" @{assignee}"));
    }
    if !issue.labels.is_empty() {
        let labels = issue.labels.iter().cloned().collect::<Vec<_>>();
        line.push(' ');
        line.push_str(&palette.labels(&format!("#{}", labels.join(" #"))));
    }
    line
}

pub fn print_blocked(blocked: &[BlockedIssue]) {
    let palette = Palette::auto();
    println!("{}", palette.heading("Blocked"));
    if blocked.is_empty() {
        println!("{}", palette.dim("nothing is blocked"));
        return;
    }
    for entry in blocked {
        println!("{}", format_issue_row(&entry.issue, &palette));
        for blocker in &entry.blockers {
            println!(
                "  {} {} {} {}",
                palette.dim("waits on"),
                palette.id(&blocker.id),
                palette.status(blocker.status),
                blocker.title
            );
        }
    }
    println!("{}", palette.dim(&format!("{} issue(s)", blocked.len())));
}

pub fn print_tree(root: &TreeNode) {
    let palette = Palette::auto();
    let mut lines = Vec::new();
    render_tree(root, 0, &palette, &mut lines);
    for line in lines {
        println!("{line}");
    }
}

fn render_tree(node: &TreeNode, depth: usize, palette: &Palette, out: &mut Vec<String>) {
    let indent = if depth == 0 {
        String::new()
    } else {
        palette.dim(&format!("{}↳ ", "  ".repeat(depth - 1)))
    };
    let mut line = if node.missing {
        format!("{indent}{} {}", palette.id(&node.id), palette.warn("(missing)"))
    } else {
        format!(
            "{indent}{} {} {}",
            palette.id(&node.id),
            palette.status(node.status),
            node.title
        )
    };
    if node.quarantined {
        line.push_str(&format!(" {}", palette.warn("(quarantined)")));
    }
    if node.cycle {
        line.push_str(&format!(" {}", palette.fail("(cycle)")));
    }
    if node.truncated {
        line.push_str(&format!(" {}", palette.dim("...")));
    }
    out.push(line);
    for child in &node.children {
        render_tree(child, depth + 1, palette, out);
    }
}

pub fn print_cycles(report: &CycleReport) {
    let palette = Palette::auto();
    if report.cycles.is_empty() {
        println!("{}", palette.pass("no active cycles"));
    }
    for cycle in &report.cycles {
        println!("{} {}", palette.fail("cycle:"), cycle.join(" -> "));
    }
    for edge in &report.quarantined {
        println!(
            "{} {} -> {}",
            palette.warn("quarantined:"),
            edge.from,
            edge.to
        );
    }
}

pub fn print_reconcile(summary: &ReconcileSummary) {
    let palette = Palette::auto();
    println!(
        "imported {}  updated {}  unchanged {}  removed {}  ({} records, {} corrupt)",
        summary.imported,
        summary.updated,
        summary.unchanged,
        summary.removed,
        summary.records_read,
        summary.corrupt_lines
    );
    for resolution in &summary.resolutions {
        let mut detail = Vec::new();
        if !resolution.lww_fields.is_empty() {
            detail.push(format!("last writer wins on {}", resolution.lww_fields.join(",")));
        }
        if !resolution.union_fields.is_empty() {
            detail.push(format!("merged {}", resolution.union_fields.join(",")));
        }
        println!(
            "  {} {} rev {}: {}",
            palette.pass("resolved"),
            palette.id(&resolution.id),
            resolution.revision,
            detail.join("; ")
        );
    }
    for conflict in &summary.conflicts {
        println!(
            "  {} {}: {}",
            palette.fail("conflict"),
            palette.id(&conflict.id),
            conflict.reason
        );
    }
    for edge in &summary.quarantined {
        println!(
            "  {} {} -> {}",
            palette.warn("quarantined"),
            edge.from,
            edge.to
        );
    }
}

pub fn print_sync(report: &SyncReport) {
    if let Some(flush) = &report.flush {
        println!("flushed {} record(s) for {} issue(s)", flush.records, flush.issues);
    }
    if let Some(commit) = &report.commit {
        println!("commit: {}", commit.detail);
    }
    if let Some(pull) = &report.pull {
        println!("pull: {}", pull.detail);
    }
    if let Some(summary) = &report.reconcile {
        print_reconcile(summary);
    }
    if let Some(push) = &report.push {
        println!("push: {}", push.detail);
    }
}

pub fn print_sync_status(status: &SyncStatus) {
    println!("pending records: {}", status.pending_records);
    if let Some(oldest) = &status.oldest_pending_at {
        println!("oldest pending: {oldest}");
    }
    println!(
        "last flush: {}",
        status.last_flush_at.as_deref().unwrap_or("never")
    );
    println!(
        "last import: {}",
        status.last_import_at.as_deref().unwrap_or("never")
    );
    if status.log_changed {
        println!("issues.log changed since the last import");
    }
    if !status.conflicts.is_empty() {
        println!("conflicts: {}", status.conflicts.join(", "));
    }
}

pub fn print_compact_report(report: &CompactReport) {
    let palette = Palette::auto();
    println!(
        "{}",
        palette.heading(&format!(
            "Compaction candidates (closed before {})",
            report.cutoff
        ))
    );
    for candidate in &report.candidates {
        println!(
            "{} {} {}",
            palette.id(&candidate.id),
            candidate.title,
            palette.dim(&format!("{} record(s)", candidate.log_records))
        );
    }
    for skipped in &report.skipped {
        println!(
            "{} {} {}",
            palette.dim("kept"),
            palette.id(&skipped.id),
            palette.dim(&format!("blocks {}", skipped.open_dependents.join(", ")))
        );
    }
    println!(
        "{}",
        palette.dim(&format!(
            "{} candidate(s), {} of {} log record(s) reclaimable",
            report.candidates.len(),
            report.reclaimable_records,
            report.log_records
        ))
    );
}

pub fn print_compact_summary(summary: &CompactSummary) {
    println!(
        "compacted {} issue(s): {} -> {} log record(s)",
        summary.compacted.len(),
        summary.records_before,
        summary.records_after
    );
}

pub fn print_doctor(report: &DoctorReport) {
    let palette = Palette::auto();
    for check in &report.checks {
        let status = match check.status {
            DoctorStatus::Pass => palette.pass("pass"),
            DoctorStatus::Warn => palette.warn("warn"),
            DoctorStatus::Fail => palette.fail("FAIL"),
        };
        println!("[{status}] {}: {}", check.name, check.detail);
    }
    for fix in &report.fixes {
        println!("{} {fix}", palette.pass("fixed:"));
    }
}

pub fn print_events(view: &EventsView) {
    let palette = Palette::auto();
    if view.truncated {
        println!("{}", palette.warn("older events were dropped from the buffer"));
    }
    for event in &view.events {
        println!(
            "{:>6} {} {} {} {}{}",
            event.seq,
            palette.dim(&event.at),
            event.op.as_str(),
            palette.id(&event.issue_id),
            event.title,
            event
                .actor
                .as_deref()
                .map(|actor| format!(" @{actor}"))
                .unwrap_or_default()
        );
    }
    println!("{}", palette.dim(&format!("next: --since {}", view.next_seq)));
}

pub fn print_init(report: &InitReport) {
    println!("initialized {}", report.beads_dir.display());
    if !report.added_rules.is_empty() {
        println!("  git rules: {}", report.added_rules.join(", "));
    }
}

pub fn print_health(report: &HealthReport) {
    println!(
        "presence daemon pid {} at {} (protocol v{}, up {}s)",
        report.pid, report.address, report.version, report.uptime_secs
    );
    println!(
        "  {} buffered event(s), last seq {}, {} flush(es)",
        report.buffered_events, report.last_seq, report.flushes
    );
    if let Some(err) = &report.last_flush_error {
        println!("  last flush error: {err}");
    }
}

struct Palette {
    enabled: bool,
}

impl Palette {
    fn auto() -> Self {
        let enabled = std::env::var_os("NO_COLOR").is_none() && io::stdout().is_terminal();
        Self { enabled }
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    fn heading(&self, text: &str) -> String {
        self.paint("1;36", text)
    }

    fn dim(&self, text: &str) -> String {
        self.paint("2", text)
    }

    fn id(&self, text: &str) -> String {
        self.paint("1;94", text)
    }

    fn status(&self, status: Status) -> String {
        let upper = status.as_str().to_ascii_uppercase();
        self.paint(status_color_code(status), &format!("[{upper}]"))
    }

    fn type_label(&self, issue_type: &str) -> String {
        self.paint("35", &format!("({issue_type})"))
    }

    fn labels(&self, text: &str) -> String {
        self.paint("90", text)
    }

    fn pass(&self, text: &str) -> String {
        self.paint("32", text)
    }

    fn warn(&self, text: &str) -> String {
        self.paint("33", text)
    }

    fn fail(&self, text: &str) -> String {
        self.paint("1;31", text)
    }
}

fn status_color_code(status: Status) -> &'static str {
    match status {
        Status::Open => "36",
        Status::InProgress => "33",
        Status::Blocked => "31",
        Status::Closed => "32",
    }
}
