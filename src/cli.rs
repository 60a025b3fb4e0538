use std::path::PathBuf;

use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::{Args, Parser, Subcommand};

use crate::domain::{DependencyType, Status};
use crate::store::SortMode;

fn cli_styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::BrightYellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightGreen.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::BrightMagenta.on_default())
}

#[derive(Debug, Parser)]
#[command(name = "bd")]
#[command(bin_name = "bd")]
#[command(version)]
#[command(about = "A git-native, dependency-aware issue tracker for agents")]
#[command(styles = cli_styles())]
pub struct Cli {
    #[arg(long, global = true, help = "Render machine-readable JSON.")]
    pub json: bool,

    #[arg(
        short = 'C',
        long,
        env = "BEADS_REPO_ROOT",
        global = true,
        help = "Repository root that contains .beads/ (default: nearest ancestor)."
    )]
    pub repo_root: Option<PathBuf>,

    #[arg(
        long,
        env = "BEADS_DB",
        global = true,
        help = "Path to the local SQLite cache (default: .beads/cache/beads.sqlite)."
    )]
    pub db: Option<PathBuf>,

    #[arg(
        long,
        env = "BEADS_ACTOR",
        global = true,
        help = "Agent or user name recorded on mutations."
    )]
    pub actor: Option<String>,

    #[arg(
        long = "timeout-ms",
        global = true,
        help = "Deadline for list, ready, blocked and dep cycles scans."
    )]
    pub timeout_ms: Option<u64>,

    #[arg(
        long = "no-daemon",
        env = "BEADS_NO_DAEMON",
        global = true,
        help = "Never contact or start the presence daemon."
    )]
    pub no_daemon: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Create .beads/ with config, empty log and git rules.")]
    Init(InitArgs),
    #[command(about = "Create a new issue.")]
    Create(CreateArgs),
    #[command(about = "Update issue fields.")]
    Update(UpdateArgs),
    #[command(about = "Close an issue with a reason.")]
    Close(CloseArgs),
    #[command(about = "Tombstone an issue and its children.")]
    Delete(IdArgs),
    #[command(about = "Show one issue.")]
    Show(IdArgs),
    #[command(about = "List issues with filters.", alias = "ls")]
    List(ListArgs),
    #[command(about = "List open issues with no open blockers.")]
    Ready(FilterArgs),
    #[command(about = "List open issues waiting on open blockers.")]
    Blocked(FilterArgs),
    #[command(about = "Manage dependency edges.")]
    Dep(DepArgs),
    #[command(about = "Flush, commit, pull, import and push issues.log.")]
    Sync(SyncArgs),
    #[command(about = "Fold old closed issues into summarized records.")]
    Compact(CompactArgs),
    #[command(about = "Check cache, log, lock and daemon health.")]
    Doctor(DoctorArgs),
    #[command(about = "Show recent mutations from other agents.")]
    Events(EventsArgs),
    #[command(about = "Control the presence daemon.")]
    Daemon(DaemonArgs),
}

impl Commands {
    /// Commands that write and therefore benefit from a running daemon.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Commands::Create(_)
                | Commands::Update(_)
                | Commands::Close(_)
                | Commands::Delete(_)
                | Commands::Dep(DepArgs {
                    command: DepSubcommands::Add(_) | DepSubcommands::Remove(_)
                })
        )
    }
}

#[derive(Debug, Args)]
pub struct InitArgs {
    #[arg(short = 'p', long, help = "Namespace tag for new ids (default: bd).")]
    pub prefix: Option<String>,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(help = "Issue id.")]
    pub id: String,
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[arg(help = "Issue title.")]
    pub title: String,

    #[arg(short = 'd', long, help = "Description text.")]
    pub description: Option<String>,

    #[arg(short = 'p', long, help = "Priority 0 (critical) to 3 (low).")]
    pub priority: Option<u8>,

    #[arg(short = 't', long = "type", help = "Issue type, e.g. bug, task, feature, epic.")]
    pub issue_type: Option<String>,

    #[arg(short = 'l', long = "label", help = "Label (repeatable).")]
    pub labels: Vec<String>,

    #[arg(short = 'a', long, help = "Assignee.")]
    pub assignee: Option<String>,

    #[arg(long, help = "Parent issue; the new id becomes <parent>.<n>.")]
    pub parent: Option<String>,

    #[arg(long = "blocked-by", help = "Issue this one waits on (repeatable).")]
    pub blocked_by: Vec<String>,

    #[arg(long = "discovered-from", help = "Issue whose work surfaced this one.")]
    pub discovered_from: Option<String>,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[arg(help = "Issue id.")]
    pub id: String,

    #[arg(long, help = "Set title.")]
    pub title: Option<String>,

    #[arg(short = 'd', long, help = "Set description; empty clears it.")]
    pub description: Option<String>,

    #[arg(short = 'p', long, help = "Set priority (0-3).")]
    pub priority: Option<u8>,

    #[arg(short = 't', long = "type", help = "Set issue type.")]
    pub issue_type: Option<String>,

    #[arg(short = 's', long, help = "Set status: open, in_progress or blocked.")]
    pub status: Option<Status>,

    #[arg(short = 'a', long, help = "Set assignee; empty clears it.")]
    pub assignee: Option<String>,

    #[arg(long = "add-label", help = "Add label (repeatable).")]
    pub add_labels: Vec<String>,

    #[arg(long = "remove-label", help = "Remove label (repeatable).")]
    pub remove_labels: Vec<String>,
}

#[derive(Debug, Args)]
pub struct CloseArgs {
    #[arg(help = "Issue id.")]
    pub id: String,

    #[arg(short = 'r', long, help = "Why the issue is closed.")]
    pub reason: String,
}

#[derive(Debug, Args)]
pub struct FilterArgs {
    #[arg(short = 'p', long, help = "Filter by priority.")]
    pub priority: Option<u8>,

    #[arg(short = 't', long = "type", help = "Filter by issue type.")]
    pub issue_type: Option<String>,

    #[arg(short = 'l', long = "label", help = "Require label (repeatable).")]
    pub labels: Vec<String>,

    #[arg(short = 'a', long, help = "Filter by assignee.")]
    pub assignee: Option<String>,

    #[arg(long, default_value_t = SortMode::Priority, help = "Sort: priority, oldest or hybrid.")]
    pub sort: SortMode,

    #[arg(short = 'n', long, help = "Maximum number of issues.")]
    pub limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub filter: FilterArgs,

    #[arg(short = 's', long = "status", help = "Filter by status (repeatable).")]
    pub statuses: Vec<Status>,

    #[arg(long, help = "Include closed issues.")]
    pub all: bool,

    #[arg(long = "include-deleted", help = "Include tombstoned issues.")]
    pub include_deleted: bool,

    #[arg(long = "created-after", help = "Created at or after (RFC3339 or YYYY-MM-DD).")]
    pub created_after: Option<String>,

    #[arg(long = "created-before", help = "Created before (RFC3339 or YYYY-MM-DD).")]
    pub created_before: Option<String>,

    #[arg(long = "updated-after", help = "Updated at or after (RFC3339 or YYYY-MM-DD).")]
    pub updated_after: Option<String>,

    #[arg(long = "updated-before", help = "Updated before (RFC3339 or YYYY-MM-DD).")]
    pub updated_before: Option<String>,
}

#[derive(Debug, Args)]
pub struct DepArgs {
    #[command(subcommand)]
    pub command: DepSubcommands,
}

#[derive(Debug, Subcommand)]
pub enum DepSubcommands {
    #[command(about = "Record that <from> depends on <to>.")]
    Add(DepEdgeArgs),
    #[command(about = "Remove <from> -> <to> edges.")]
    Remove(DepRemoveArgs),
    #[command(about = "Show what an issue waits on, or what waits on it.")]
    Tree(DepTreeArgs),
    #[command(about = "Scan the blocks graph for cycles.")]
    Cycles,
}

#[derive(Debug, Args)]
pub struct DepEdgeArgs {
    #[arg(help = "Dependent issue id.")]
    pub from: String,

    #[arg(help = "Issue it depends on.")]
    pub to: String,

    #[arg(
        short = 't',
        long = "type",
        default_value_t = DependencyType::Blocks,
        help = "blocks, related, parent-child or discovered-from."
    )]
    pub dep_type: DependencyType,
}

#[derive(Debug, Args)]
pub struct DepRemoveArgs {
    #[arg(help = "Dependent issue id.")]
    pub from: String,

    #[arg(help = "Issue it depends on.")]
    pub to: String,

    #[arg(short = 't', long = "type", help = "Only remove edges of this type.")]
    pub dep_type: Option<DependencyType>,
}

#[derive(Debug, Args)]
pub struct DepTreeArgs {
    #[arg(help = "Root issue id.")]
    pub id: String,

    #[arg(long, default_value_t = 10, help = "Maximum depth.")]
    pub depth: usize,

    #[arg(long, help = "Show dependents instead of blockers.")]
    pub reverse: bool,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    #[arg(
        long = "flush-only",
        conflicts_with = "import_only",
        help = "Only write pending records to issues.log."
    )]
    pub flush_only: bool,

    #[arg(long = "import-only", help = "Only reconcile the cache from issues.log.")]
    pub import_only: bool,

    #[arg(
        long,
        conflicts_with_all = ["flush_only", "import_only"],
        help = "git add + commit issues.log."
    )]
    pub commit: bool,

    #[arg(
        long,
        conflicts_with_all = ["flush_only", "import_only"],
        help = "git pull before importing."
    )]
    pub pull: bool,

    #[arg(
        long,
        conflicts_with_all = ["flush_only", "import_only"],
        help = "git push after importing."
    )]
    pub push: bool,

    #[arg(short = 'm', long, help = "Commit message.")]
    pub message: Option<String>,

    #[arg(
        long,
        conflicts_with_all = ["flush_only", "import_only", "commit", "pull", "push"],
        help = "Report queue and import state without syncing."
    )]
    pub status: bool,
}

#[derive(Debug, Args)]
pub struct CompactArgs {
    #[arg(long = "dry-run", help = "Report candidates without rewriting the log.")]
    pub dry_run: bool,

    #[arg(long = "older-than", help = "Age threshold in days (default from config).")]
    pub older_than: Option<i64>,
}

#[derive(Debug, Args)]
pub struct DoctorArgs {
    #[arg(long, help = "Repair stale locks, git rules and unflushed records.")]
    pub fix: bool,
}

#[derive(Debug, Args)]
pub struct EventsArgs {
    #[arg(long, default_value_t = 0, help = "Only events after this sequence number.")]
    pub since: u64,

    #[arg(short = 'n', long, default_value_t = 100, help = "Maximum number of events.")]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct DaemonArgs {
    #[command(subcommand)]
    pub command: DaemonSubcommands,
}

#[derive(Debug, Subcommand)]
pub enum DaemonSubcommands {
    #[command(about = "Serve in the foreground.")]
    Run,
    #[command(about = "Start detached unless one is already running.")]
    Start,
    #[command(about = "Report daemon health; exits 5 when unavailable.")]
    Status,
    #[command(about = "Ask the daemon to flush and exit.")]
    Stop,
}
