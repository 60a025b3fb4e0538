use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;

use super::{
    GitCli, GitError, GitOutcome, GitPlumbing, GitStep, SyncEngine, SyncError, SyncPlan,
};
use crate::codec::{self, LogFile, LogRecord, RecordOp};
use crate::db;
use crate::domain::{Dependency, DependencyType, Issue, Status};
use crate::store::{IssuePatch, IssueStore, NewIssue, StoreOptions};

fn open_store(dir: &tempfile::TempDir) -> IssueStore {
    IssueStore::open(
        &dir.path().join("cache").join("beads.sqlite"),
        &dir.path().join("locks").join("write.lock"),
        StoreOptions {
            actor: Some("tester".to_string()),
            ..StoreOptions::default()
        },
    )
    .expect("store should open")
}

fn engine<'a>(store: &'a IssueStore, dir: &tempfile::TempDir) -> SyncEngine<'a> {
    SyncEngine::new(store, LogFile::in_dir(dir.path()))
}

fn create(store: &IssueStore, title: &str) -> Issue {
    store
        .create(NewIssue {
            title: title.to_string(),
            ..NewIssue::default()
        })
        .expect("create should succeed")
}

fn snapshot(id: &str, revision: u64, updated_at: &str, edit: impl FnOnce(&mut Issue)) -> Issue {
    let mut issue = Issue {
        id: id.to_string(),
        title: format!("Issue {id}"),
        description: None,
        status: Status::Open,
        priority: 2,
        issue_type: "task".to_string(),
        labels: BTreeSet::new(),
        assignee: None,
        parent: None,
        created_at: "2026-03-01T00:00:00Z".to_string(),
        updated_at: updated_at.to_string(),
        close_reason: None,
        closed_at: None,
        deleted_at: None,
        revision,
        dependencies: Vec::new(),
        history_digest: None,
        compacted_at: None,
    };
    edit(&mut issue);
    issue
}

fn line(issue: &Issue, agent: &str) -> String {
    codec::encode(&LogRecord::new(
        RecordOp::Update,
        issue.clone(),
        Some(agent.to_string()),
    ))
    .expect("record should encode")
}

fn write_log(dir: &tempfile::TempDir, lines: &[String]) {
    LogFile::in_dir(dir.path())
        .append(lines)
        .expect("log should be writable");
}

#[test]
fn flush_appends_pending_records_and_drains_the_queue() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let sync = engine(&store, &dir);
    let issue = create(&store, "First");
    store
        .update(
            &issue.id,
            &IssuePatch {
                priority: Some(0),
                ..IssuePatch::default()
            },
        )
        .expect("update should succeed");

    let summary = sync.flush().expect("flush should succeed");
    assert_eq!(summary.records, 2);
    assert_eq!(summary.issues, 1);
    assert_eq!(store.pending_count().expect("count"), 0);

    let contents = sync.log().read().expect("log should read");
    assert_eq!(contents.records.len(), 2);
    assert_eq!(contents.records[1].rev, 2);
    assert_eq!(contents.records[1].agent.as_deref(), Some("tester"));

    let again = sync.flush().expect("second flush should succeed");
    assert_eq!(again.records, 0);
    assert_eq!(sync.log().read().expect("log").records.len(), 2);
    assert!(!sync.needs_import().expect("digest check"));
}

#[test]
fn reconcile_after_flush_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let sync = engine(&store, &dir);
    create(&store, "One");
    create(&store, "Two");
    sync.flush().expect("flush should succeed");

    let before = store.all_issues(true).expect("issues");
    let first = sync.reconcile().expect("reconcile should succeed");
    assert_eq!(first.unchanged, 2);
    assert_eq!(first.imported + first.updated + first.removed, 0);

    let second = sync.reconcile().expect("reconcile should succeed");
    assert_eq!(second, first);
    assert_eq!(store.all_issues(true).expect("issues"), before);
}

#[test]
fn mixed_edge_types_to_one_target_reconcile_unchanged() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let sync = engine(&store, &dir);
    let parent = create(&store, "Epic");
    store
        .create(NewIssue {
            title: "Child".to_string(),
            parent: Some(parent.id.clone()),
            discovered_from: Some(parent.id.clone()),
            ..NewIssue::default()
        })
        .expect("create child");
    sync.flush().expect("flush should succeed");
    let lines_before = LogFile::in_dir(dir.path())
        .raw_lines()
        .expect("raw lines")
        .len();

    for _ in 0..2 {
        let summary = sync.reconcile().expect("reconcile should succeed");
        assert_eq!(summary.unchanged, 2);
        assert_eq!(summary.imported + summary.updated + summary.removed, 0);
    }
    assert_eq!(store.pending_count().expect("pending"), 0);
    let lines_after = LogFile::in_dir(dir.path())
        .raw_lines()
        .expect("raw lines")
        .len();
    assert_eq!(lines_after, lines_before);
}

#[test]
fn concatenated_logs_from_two_clones_import_everything() {
    let a_dir = tempfile::tempdir().expect("tempdir should be creatable");
    let b_dir = tempfile::tempdir().expect("tempdir should be creatable");
    let c_dir = tempfile::tempdir().expect("tempdir should be creatable");

    let a = open_store(&a_dir);
    create(&a, "From clone A");
    engine(&a, &a_dir).flush().expect("flush A");
    let b = open_store(&b_dir);
    create(&b, "From clone B");
    create(&b, "Also from clone B");
    engine(&b, &b_dir).flush().expect("flush B");

    let mut combined = std::fs::read_to_string(a_dir.path().join(codec::LOG_FILE)).expect("log A");
    combined.push_str(&std::fs::read_to_string(b_dir.path().join(codec::LOG_FILE)).expect("log B"));
    std::fs::write(c_dir.path().join(codec::LOG_FILE), combined).expect("combined log");

    let c = open_store(&c_dir);
    let summary = engine(&c, &c_dir).reconcile().expect("reconcile should succeed");
    assert_eq!(summary.imported, 3);
    assert!(summary.conflicts.is_empty());
    let titles = c
        .all_issues(false)
        .expect("issues")
        .into_iter()
        .map(|issue| issue.title)
        .collect::<BTreeSet<_>>();
    assert!(titles.contains("From clone A"));
    assert!(titles.contains("Also from clone B"));
}

#[test]
fn same_revision_priority_edits_resolve_by_last_writer() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let base = snapshot("bd-p1", 1, "2026-03-01T00:00:00Z", |_| {});
    let from_a = snapshot("bd-p1", 2, "2026-03-01T10:00:00Z", |i| i.priority = 0);
    let from_b = snapshot("bd-p1", 2, "2026-03-01T11:00:00Z", |i| i.priority = 3);
    write_log(
        &dir,
        &[line(&base, "agent-a"), line(&from_a, "agent-a"), line(&from_b, "agent-b")],
    );

    let store = open_store(&dir);
    let sync = engine(&store, &dir);
    let summary = sync.reconcile().expect("reconcile should succeed");
    assert!(summary.conflicts.is_empty());
    assert_eq!(summary.resolutions.len(), 1);
    let resolution = &summary.resolutions[0];
    assert_eq!(resolution.id, "bd-p1");
    assert_eq!(resolution.lww_fields, vec!["priority"]);
    assert_eq!(resolution.winner_agent.as_deref(), Some("agent-b"));
    assert_eq!(resolution.revision, 3);

    let merged = store.get("bd-p1").expect("merged issue");
    assert_eq!(merged.priority, 3);
    assert_eq!(merged.revision, 3);
    assert_eq!(store.pending_count().expect("count"), 1);

    sync.flush().expect("flush should succeed");
    let settled = sync.reconcile().expect("reconcile should succeed");
    assert!(settled.resolutions.is_empty());
    assert_eq!(settled.unchanged, 1);
    assert!(!sync.needs_import().expect("digest check"));
}

#[test]
fn unflushed_local_edit_merges_with_remote_revision() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let sync = engine(&store, &dir);
    let original = create(&store, "Shared");
    sync.flush().expect("flush should succeed");

    store
        .update(
            &original.id,
            &IssuePatch {
                title: Some("Local title".to_string()),
                ..IssuePatch::default()
            },
        )
        .expect("local update");
    let mut remote = original.clone();
    remote.revision = 2;
    remote.priority = 0;
    write_log(&dir, &[line(&remote, "agent-remote")]);

    let summary = sync.reconcile().expect("reconcile should succeed");
    assert_eq!(summary.resolutions.len(), 1);
    let fields = &summary.resolutions[0].union_fields;
    assert!(fields.contains(&"title"));
    assert!(fields.contains(&"priority"));

    let merged = store.get(&original.id).expect("merged issue");
    assert_eq!(merged.title, "Local title");
    assert_eq!(merged.priority, 0);
    assert_eq!(merged.revision, 3);
    assert_eq!(store.pending_count().expect("count"), 2);

    let again = sync.reconcile().expect("reconcile should succeed");
    assert!(again.resolutions.is_empty());
    assert_eq!(store.get(&original.id).expect("issue").revision, 3);
}

#[test]
fn terminal_status_race_is_flagged_while_others_import() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let base = snapshot("bd-t1", 1, "2026-03-01T00:00:00Z", |_| {});
    let closed = snapshot("bd-t1", 2, "2026-03-02T00:00:00Z", |i| {
        i.status = Status::Closed;
        i.close_reason = Some("done".to_string());
        i.closed_at = Some("2026-03-02T00:00:00Z".to_string());
    });
    let started = snapshot("bd-t1", 2, "2026-03-03T00:00:00Z", |i| {
        i.status = Status::InProgress;
    });
    let bystander = snapshot("bd-t2", 1, "2026-03-01T00:00:00Z", |_| {});
    write_log(
        &dir,
        &[
            line(&base, "agent-a"),
            line(&closed, "agent-a"),
            line(&started, "agent-b"),
            line(&bystander, "agent-a"),
        ],
    );

    let store = open_store(&dir);
    let summary = engine(&store, &dir).reconcile().expect("reconcile should succeed");
    assert_eq!(summary.conflict_ids(), vec!["bd-t1".to_string()]);
    assert_eq!(summary.imported, 1);

    let provisional = store.get("bd-t1").expect("flagged issue keeps a value");
    assert_eq!(provisional.status, Status::InProgress);
    assert!(store.get("bd-t2").is_ok());
    let conflicts = store.conflicts().expect("conflicts");
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].reason.contains("closed"));
}

#[test]
fn corrupt_lines_are_skipped() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let good = snapshot("bd-ok", 1, "2026-03-01T00:00:00Z", |_| {});
    write_log(
        &dir,
        &[
            "<<<<<<< HEAD".to_string(),
            line(&good, "agent-a"),
            "{not json".to_string(),
        ],
    );

    let store = open_store(&dir);
    let summary = engine(&store, &dir).reconcile().expect("reconcile should succeed");
    assert_eq!(summary.corrupt_lines, 2);
    assert_eq!(summary.records_read, 1);
    assert_eq!(summary.imported, 1);
}

#[test]
fn cache_only_issues_without_pending_records_are_removed() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let sync = engine(&store, &dir);
    let kept = create(&store, "Kept");
    sync.flush().expect("flush should succeed");

    let ghost = snapshot("bd-ghost", 1, "2026-03-01T00:00:00Z", |_| {});
    db::upsert_issue(store.conn(), &ghost).expect("ghost row");
    let unflushed = create(&store, "Not flushed yet");

    let summary = sync.reconcile().expect("reconcile should succeed");
    assert_eq!(summary.removed, 1);
    assert!(store.find("bd-ghost").expect("lookup").is_none());
    assert!(store.find(&kept.id).expect("lookup").is_some());
    assert!(store.find(&unflushed.id).expect("lookup").is_some());
}

#[test]
fn cycles_arriving_through_the_log_are_quarantined() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let blocks = |to: &str, at: &str| Dependency {
        to: to.to_string(),
        dep_type: DependencyType::Blocks,
        created_at: at.to_string(),
    };
    let x = snapshot("bd-x", 1, "2026-03-01T00:00:00Z", |i| {
        i.dependencies.push(blocks("bd-y", "2026-03-01T00:00:00Z"));
    });
    let y = snapshot("bd-y", 1, "2026-03-02T00:00:00Z", |i| {
        i.dependencies.push(blocks("bd-x", "2026-03-02T00:00:00Z"));
    });
    write_log(&dir, &[line(&x, "agent-a"), line(&y, "agent-b")]);

    let store = open_store(&dir);
    let summary = engine(&store, &dir).reconcile().expect("reconcile should succeed");
    assert_eq!(summary.cycles.len(), 1);
    assert_eq!(summary.quarantined.len(), 1);
    assert_eq!(summary.quarantined[0].from, "bd-y");

    let quarantined = db::list_edges(store.conn())
        .expect("edges")
        .into_iter()
        .filter(|edge| edge.quarantined)
        .count();
    assert_eq!(quarantined, 1);
}

#[test]
fn imported_child_ids_advance_the_counter() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let parent = snapshot("bd-par", 1, "2026-03-01T00:00:00Z", |_| {});
    let child = snapshot("bd-par.3", 1, "2026-03-01T00:00:00Z", |i| {
        i.parent = Some("bd-par".to_string());
    });
    write_log(&dir, &[line(&parent, "agent-a"), line(&child, "agent-a")]);

    let store = open_store(&dir);
    engine(&store, &dir).reconcile().expect("reconcile should succeed");
    let next = store
        .create(NewIssue {
            title: "Next child".to_string(),
            parent: Some("bd-par".to_string()),
            ..NewIssue::default()
        })
        .expect("child create");
    assert_eq!(next.id, "bd-par.4");
}

#[test]
fn auto_import_runs_only_when_the_log_moved() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let sync = engine(&store, &dir);
    assert!(!sync.needs_import().expect("no log yet"));
    assert!(sync.auto_import().expect("auto import").is_none());

    let issue = snapshot("bd-new", 1, "2026-03-01T00:00:00Z", |_| {});
    write_log(&dir, &[line(&issue, "agent-a")]);
    assert!(sync.needs_import().expect("digest check"));

    let summary = sync
        .auto_import()
        .expect("auto import")
        .expect("changed log should import");
    assert_eq!(summary.imported, 1);
    assert!(!sync.needs_import().expect("digest check"));
    assert!(sync.status().expect("status").conflicts.is_empty());
}

#[derive(Default)]
struct ScriptedGit {
    calls: RefCell<Vec<&'static str>>,
    fail_pull_with: Option<&'static str>,
    fail_push_with: Option<&'static str>,
}

impl ScriptedGit {
    fn outcome(&self, call: &'static str, failure: Option<&'static str>) -> GitOutcome {
        self.calls.borrow_mut().push(call);
        GitOutcome {
            success: failure.is_none(),
            working_copy_time: None,
            detail: failure.unwrap_or("ok").to_string(),
        }
    }
}

impl GitPlumbing for ScriptedGit {
    fn commit(&self, _paths: &[&Path], _message: &str) -> Result<GitOutcome, GitError> {
        Ok(self.outcome("commit", None))
    }

    fn pull(&self) -> Result<GitOutcome, GitError> {
        Ok(self.outcome("pull", self.fail_pull_with))
    }

    fn push(&self) -> Result<GitOutcome, GitError> {
        Ok(self.outcome("push", self.fail_push_with))
    }

    fn status(&self, _paths: &[&Path]) -> Result<GitOutcome, GitError> {
        Ok(self.outcome("status", None))
    }
}

#[test]
fn pipeline_runs_stages_in_order_and_tolerates_missing_remote() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    create(&store, "Pipeline");
    let git = ScriptedGit {
        fail_pull_with: Some("There is no tracking information for the current branch."),
        ..ScriptedGit::default()
    };

    let report = engine(&store, &dir)
        .run(&SyncPlan::default(), &git)
        .expect("sync should succeed without a remote");
    assert_eq!(*git.calls.borrow(), vec!["commit", "pull", "push"]);
    assert_eq!(report.flush.expect("flush ran").records, 1);
    assert!(report.reconcile.is_some());
}

#[test]
fn rejected_push_stops_the_pipeline() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    create(&store, "Rejected");
    let git = ScriptedGit {
        fail_push_with: Some("! [rejected] main -> main (fetch first)"),
        ..ScriptedGit::default()
    };

    let err = engine(&store, &dir)
        .run(&SyncPlan::default(), &git)
        .expect_err("rejected push should fail");
    assert!(matches!(
        err,
        SyncError::GitStepFailed {
            step: GitStep::Push,
            ..
        }
    ));
    assert_eq!(store.pending_count().expect("count"), 0);
}

fn run_git(root: &Path, args: &[&str]) {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .expect("git command should run");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn init_repo(root: &Path) {
    run_git(root, &["init"]);
    run_git(root, &["config", "user.email", "beads@example.com"]);
    run_git(root, &["config", "user.name", "Beads Test"]);
    std::fs::write(root.join("README.md"), "# test\n").expect("readme should be writable");
    run_git(root, &["add", "README.md"]);
    run_git(root, &["commit", "-m", "init"]);
    run_git(root, &["branch", "-M", "main"]);
}

#[test]
fn git_backed_sync_commits_and_pushes_the_log() {
    let remote = tempfile::tempdir().expect("tempdir should be creatable");
    let work = tempfile::tempdir().expect("tempdir should be creatable");
    run_git(remote.path(), &["init", "--bare"]);
    init_repo(work.path());
    run_git(
        work.path(),
        &["remote", "add", "origin", &remote.path().display().to_string()],
    );
    run_git(work.path(), &["push", "-u", "origin", "main"]);

    let beads_dir = work.path().join(".beads");
    let store = IssueStore::open(
        &beads_dir.join("cache").join("beads.sqlite"),
        &beads_dir.join("locks").join("write.lock"),
        StoreOptions::default(),
    )
    .expect("store should open");
    store
        .create(NewIssue {
            title: "Tracked in git".to_string(),
            ..NewIssue::default()
        })
        .expect("create");

    let git = GitCli::new(work.path());
    let sync = SyncEngine::new(&store, LogFile::in_dir(&beads_dir));
    let report = sync
        .run(&SyncPlan::default(), &git)
        .expect("sync should succeed");
    assert!(report.commit.expect("commit ran").success);
    assert!(report.push.expect("push ran").success);

    let status = git
        .status(&[sync.log().path()])
        .expect("status should run");
    assert!(status.success);
    assert!(status.detail.is_empty());
    assert!(status.working_copy_time.is_some());

    let nothing = git
        .commit(&[sync.log().path()], "noop")
        .expect("commit should run");
    assert_eq!(nothing.detail, "nothing to commit");
}
