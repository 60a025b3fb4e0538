mod app;
mod cancel;
mod cli;
mod codec;
mod compact;
mod config;
mod db;
mod doctor;
mod domain;
mod graph;
mod id;
mod init;
mod locks;
mod output;
mod presence;
mod store;
mod sync;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use app::{App, AppError, AppOptions, BeadsPaths, DaemonMode};
use cancel::CancelToken;
use cli::{Cli, Commands, DaemonSubcommands, DepSubcommands, FilterArgs, ListArgs, SyncArgs};
use domain::timestamp::parse_date_bound;
use graph::TreeDirection;
use output::IssueList;
use store::{IssuePatch, IssueQuery, NewIssue};
use sync::{SyncError, SyncPlan};

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let json = cli.json;
    if let Err(err) = run(cli) {
        if json {
            output::print_json(&json!({
                "error": err.to_string(),
                "exit_code": err.exit_code(),
            }));
        } else {
            eprintln!("error: {}", err);
        }
        std::process::exit(err.exit_code());
    }
}

/// Logs go to stderr, filtered by `BEADS_LOG`, then `RUST_LOG`, then `warn`.
fn init_tracing() {
    let filter = std::env::var("BEADS_LOG")
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn resolve_paths(cli: &Cli) -> Result<BeadsPaths, AppError> {
    let db = cli.db.as_deref();
    Ok(match &cli.repo_root {
        Some(root) => BeadsPaths::new(root, db),
        None => BeadsPaths::discover(&std::env::current_dir()?, db),
    })
}

fn run(cli: Cli) -> Result<(), AppError> {
    let paths = resolve_paths(&cli)?;
    let json = cli.json;

    match &cli.command {
        Commands::Init(args) => {
            let report = App::init(&paths, args.prefix.as_deref())?;
            if json {
                output::print_json(&report);
            } else {
                output::print_init(&report);
            }
            return Ok(());
        }
        Commands::Daemon(args) => return run_daemon_command(&paths, &cli, &args.command),
        _ => {}
    }

    let daemon = if cli.no_daemon {
        DaemonMode::Off
    } else if cli.command.is_mutation() {
        DaemonMode::AutoStart
    } else {
        DaemonMode::Connect
    };
    let app = App::open(
        paths,
        AppOptions {
            actor: cli.actor.clone(),
            daemon,
        },
    )?;
    let cancel = CancelToken::from_timeout_ms(cli.timeout_ms);

    match cli.command {
        Commands::Init(_) | Commands::Daemon(_) => {}
        Commands::Create(args) => {
            let issue = app.create(NewIssue {
                title: args.title,
                description: args.description,
                priority: args.priority,
                issue_type: args.issue_type,
                labels: args.labels,
                assignee: args.assignee,
                parent: args.parent,
                blocked_by: args.blocked_by,
                discovered_from: args.discovered_from,
            })?;
            if json {
                output::print_json(&issue);
            } else {
                output::print_issue_line("created", &issue);
            }
        }
        Commands::Update(args) => {
            let patch = IssuePatch {
                title: args.title,
                description: args.description,
                priority: args.priority,
                issue_type: args.issue_type,
                status: args.status,
                assignee: args.assignee,
                add_labels: args.add_labels,
                remove_labels: args.remove_labels,
            };
            let issue = app.update(&args.id, &patch)?;
            if json {
                output::print_json(&issue);
            } else {
                output::print_issue_line("updated", &issue);
            }
        }
        Commands::Close(args) => {
            let issue = app.close(&args.id, &args.reason)?;
            if json {
                output::print_json(&issue);
            } else {
                output::print_issue_line("closed", &issue);
            }
        }
        Commands::Delete(args) => {
            let deleted = app.delete(&args.id)?;
            if json {
                output::print_json(&IssueList::new(&deleted));
            } else {
                for issue in &deleted {
                    output::print_issue_line("deleted", issue);
                }
            }
        }
        Commands::Show(args) => {
            let detail = app.show(&args.id)?;
            if json {
                output::print_json(&detail);
            } else {
                output::print_issue_detail(&detail);
            }
        }
        Commands::List(args) => {
            let issues = app.list(&list_query(&args)?, &cancel)?;
            if json {
                output::print_json(&IssueList::new(&issues));
            } else {
                output::print_issue_list("Issues", &issues);
            }
        }
        Commands::Ready(args) => {
            let issues = app.ready(&filter_query(&args), &cancel)?;
            if json {
                output::print_json(&IssueList::new(&issues));
            } else {
                output::print_issue_list("Ready", &issues);
            }
        }
        Commands::Blocked(args) => {
            let blocked = app.blocked(&filter_query(&args), &cancel)?;
            if json {
                output::print_json(&IssueList::new(&blocked));
            } else {
                output::print_blocked(&blocked);
            }
        }
        Commands::Dep(args) => match args.command {
            DepSubcommands::Add(edge) => {
                let issue = app.add_dependency(&edge.from, &edge.to, edge.dep_type)?;
                if json {
                    output::print_json(&issue);
                } else {
                    println!("{} now depends on {} ({})", issue.id, edge.to, edge.dep_type);
                }
            }
            DepSubcommands::Remove(edge) => {
                let issue = app.remove_dependency(&edge.from, &edge.to, edge.dep_type)?;
                if json {
                    output::print_json(&issue);
                } else {
                    println!("{} no longer depends on {}", issue.id, edge.to);
                }
            }
            DepSubcommands::Tree(tree) => {
                let direction = if tree.reverse {
                    TreeDirection::Dependents
                } else {
                    TreeDirection::Blockers
                };
                let root = app.dependency_tree(&tree.id, tree.depth, direction)?;
                if json {
                    output::print_json(&root);
                } else {
                    output::print_tree(&root);
                }
            }
            DepSubcommands::Cycles => {
                let report = app.cycles(&cancel)?;
                if json {
                    output::print_json(&report);
                } else {
                    output::print_cycles(&report);
                }
            }
        },
        Commands::Sync(args) => run_sync(&app, &args, json)?,
        Commands::Compact(args) => {
            if args.dry_run {
                let report = app.compact_analyze(args.older_than)?;
                if json {
                    output::print_json(&report);
                } else {
                    output::print_compact_report(&report);
                }
            } else {
                let summary = app.compact(args.older_than)?;
                if json {
                    output::print_json(&summary);
                } else {
                    output::print_compact_summary(&summary);
                }
            }
        }
        Commands::Doctor(args) => {
            let report = app.doctor(args.fix)?;
            if json {
                output::print_json(&report);
            } else {
                output::print_doctor(&report);
            }
            if report.failure_count() > 0 {
                std::process::exit(1);
            }
        }
        Commands::Events(args) => {
            let view = app.events(args.since, args.limit)?;
            if json {
                output::print_json(&view);
            } else {
                output::print_events(&view);
            }
        }
    }
    Ok(())
}

fn run_sync(app: &App, args: &SyncArgs, json: bool) -> Result<(), AppError> {
    if args.status {
        let status = app.sync_status()?;
        if json {
            output::print_json(&status);
        } else {
            output::print_sync_status(&status);
        }
        return Ok(());
    }

    let explicit_git = args.commit || args.pull || args.push;
    let mut plan = if args.flush_only {
        SyncPlan::flush_only()
    } else if args.import_only {
        SyncPlan::import_only()
    } else if explicit_git {
        SyncPlan {
            commit: args.commit,
            pull: args.pull,
            push: args.push,
            ..SyncPlan::default()
        }
    } else {
        SyncPlan::default()
    };
    if let Some(message) = &args.message {
        plan.message = message.clone();
    }

    let report = app.sync(plan, explicit_git)?;
    if json {
        output::print_json(&report);
    } else {
        output::print_sync(&report);
    }
    let conflicts = report
        .reconcile
        .as_ref()
        .map(|summary| summary.conflict_ids())
        .unwrap_or_default();
    if !conflicts.is_empty() {
        return Err(SyncError::Conflicts { ids: conflicts }.into());
    }
    Ok(())
}

fn run_daemon_command(
    paths: &BeadsPaths,
    cli: &Cli,
    command: &DaemonSubcommands,
) -> Result<(), AppError> {
    if !paths.is_initialized() {
        return Err(AppError::Validation(
            "no .beads directory; run `bd init` first".to_string(),
        ));
    }
    match command {
        DaemonSubcommands::Run => app::run_daemon(paths, cli.actor.clone()),
        DaemonSubcommands::Start => {
            let report = app::start_daemon(paths)?;
            if cli.json {
                output::print_json(&report);
            } else {
                output::print_health(&report);
                println!("  log: {}", app::daemon_log_path(paths).display());
            }
            Ok(())
        }
        DaemonSubcommands::Status => {
            let report = app::daemon_status(paths)?;
            if cli.json {
                output::print_json(&report);
            } else {
                output::print_health(&report);
            }
            Ok(())
        }
        DaemonSubcommands::Stop => {
            let report = app::stop_daemon(paths)?;
            if cli.json {
                output::print_json(&json!({ "stopped": report.pid }));
            } else {
                println!("stopped presence daemon pid {}", report.pid);
            }
            Ok(())
        }
    }
}

fn filter_query(args: &FilterArgs) -> IssueQuery {
    IssueQuery {
        priority: args.priority,
        issue_type: args.issue_type.clone(),
        labels: args.labels.clone(),
        assignee: args.assignee.clone(),
        sort: args.sort,
        limit: args.limit,
        ..IssueQuery::default()
    }
}

fn list_query(args: &ListArgs) -> Result<IssueQuery, AppError> {
    Ok(IssueQuery {
        statuses: args.statuses.clone(),
        include_closed: args.all,
        include_deleted: args.include_deleted,
        created_after: date_bound("--created-after", args.created_after.as_deref())?,
        created_before: date_bound("--created-before", args.created_before.as_deref())?,
        updated_after: date_bound("--updated-after", args.updated_after.as_deref())?,
        updated_before: date_bound("--updated-before", args.updated_before.as_deref())?,
        ..filter_query(&args.filter)
    })
}

fn date_bound(flag: &str, raw: Option<&str>) -> Result<Option<time::OffsetDateTime>, AppError> {
    raw.map(|value| {
        parse_date_bound(value).ok_or_else(|| {
            AppError::Validation(format!(
                "{flag} expects RFC3339 or YYYY-MM-DD, got '{value}'"
            ))
        })
    })
    .transpose()
}
