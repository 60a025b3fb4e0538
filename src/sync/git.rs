use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde::Serialize;

/// Result of one git step. Failures are reported, not raised: the sync
/// pipeline decides whether a failed step is fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitOutcome {
    pub success: bool,
    /// Commit time of `HEAD` after the step, when the repository has one.
    pub working_copy_time: Option<String>,
    pub detail: String,
}

impl GitOutcome {
    fn ok(detail: impl Into<String>, working_copy_time: Option<String>) -> Self {
        Self {
            success: true,
            working_copy_time,
            detail: detail.into(),
        }
    }

    fn failed(detail: impl Into<String>, working_copy_time: Option<String>) -> Self {
        Self {
            success: false,
            working_copy_time,
            detail: detail.into(),
        }
    }

    pub fn is_missing_remote(&self) -> bool {
        let lower = self.detail.to_ascii_lowercase();
        lower.contains("no such remote")
            || lower.contains("no remote repository specified")
            || lower.contains("no configured push destination")
            || lower.contains("there is no tracking information")
            || lower.contains("could not read from remote repository")
            || lower.contains("does not appear to be a git repository")
    }

    pub fn is_non_fast_forward(&self) -> bool {
        let lower = self.detail.to_ascii_lowercase();
        lower.contains("non-fast-forward")
            || lower.contains("fetch first")
            || lower.contains("rejected")
    }
}

/// The version-control surface sync needs. Everything else about git stays
/// out of the engine.
pub trait GitPlumbing {
    fn commit(&self, paths: &[&Path], message: &str) -> Result<GitOutcome, GitError>;
    fn pull(&self) -> Result<GitOutcome, GitError>;
    fn push(&self) -> Result<GitOutcome, GitError>;
    fn status(&self, paths: &[&Path]) -> Result<GitOutcome, GitError>;
}

#[derive(Debug)]
pub enum GitError {
    Unavailable,
    Io(std::io::Error),
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl fmt::Display for GitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitError::Unavailable => write!(f, "git CLI is not installed"),
            GitError::Io(err) => write!(f, "I/O error running git: {}", err),
            GitError::CommandFailed {
                command,
                code,
                stderr,
            } => write!(
                f,
                "git command failed (code {:?}): {} ({})",
                code, command, stderr
            ),
        }
    }
}

impl Error for GitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GitError::Io(err) => Some(err),
            GitError::Unavailable | GitError::CommandFailed { .. } => None,
        }
    }
}

/// Drives the `git` binary in `repo_root`.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo_root: PathBuf,
}

impl GitCli {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Walks up from `start` to the enclosing work tree, if any.
    pub fn discover(start: &Path) -> Option<Self> {
        let output = Command::new("git")
            .arg("-C")
            .arg(start)
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root.is_empty() {
            None
        } else {
            Some(Self::new(root))
        }
    }

    fn head_time(&self) -> Option<String> {
        let output = self
            .run_allow_failure(vec![
                "log".to_string(),
                "-1".to_string(),
                "--format=%cI".to_string(),
            ])
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!value.is_empty()).then_some(value)
    }

    fn has_staged_changes(&self, paths: &[String]) -> Result<bool, GitError> {
        let mut args = vec![
            "diff".to_string(),
            "--cached".to_string(),
            "--quiet".to_string(),
            "--".to_string(),
        ];
        args.extend(paths.iter().cloned());
        let output = self.run_allow_failure(args.clone())?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(GitError::CommandFailed {
                command: display_command(&self.repo_root, &args),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    fn outcome(&self, args: Vec<String>) -> Result<GitOutcome, GitError> {
        let output = self.run_allow_failure(args)?;
        let detail = combined_output(&output);
        if output.status.success() {
            Ok(GitOutcome::ok(detail, self.head_time()))
        } else {
            Ok(GitOutcome::failed(detail, self.head_time()))
        }
    }

    fn run_allow_failure(&self, args: Vec<String>) -> Result<Output, GitError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo_root).args(&args);
        tracing::debug!(command = %display_command(&self.repo_root, &args), "git");
        cmd.output().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                GitError::Unavailable
            } else {
                GitError::Io(err)
            }
        })
    }

    fn pathspecs(&self, paths: &[&Path]) -> Vec<String> {
        paths
            .iter()
            .map(|path| {
                path.strip_prefix(&self.repo_root)
                    .unwrap_or(path)
                    .to_string_lossy()
                    .to_string()
            })
            .collect()
    }
}

impl GitPlumbing for GitCli {
    fn commit(&self, paths: &[&Path], message: &str) -> Result<GitOutcome, GitError> {
        let specs = self.pathspecs(paths);
        let mut add = vec!["add".to_string(), "-f".to_string(), "--".to_string()];
        add.extend(specs.iter().cloned());
        let added = self.run_allow_failure(add)?;
        if !added.status.success() {
            return Ok(GitOutcome::failed(combined_output(&added), self.head_time()));
        }
        if !self.has_staged_changes(&specs)? {
            return Ok(GitOutcome::ok("nothing to commit", self.head_time()));
        }

        let mut args = vec![
            "commit".to_string(),
            "--no-gpg-sign".to_string(),
            "--no-verify".to_string(),
            "-m".to_string(),
            message.to_string(),
            "--".to_string(),
        ];
        args.extend(specs);
        self.outcome(args)
    }

    fn pull(&self) -> Result<GitOutcome, GitError> {
        self.outcome(vec![
            "pull".to_string(),
            "--no-rebase".to_string(),
            "--no-edit".to_string(),
        ])
    }

    fn push(&self) -> Result<GitOutcome, GitError> {
        self.outcome(vec!["push".to_string(), "--no-verify".to_string()])
    }

    fn status(&self, paths: &[&Path]) -> Result<GitOutcome, GitError> {
        let mut args = vec![
            "status".to_string(),
            "--porcelain".to_string(),
            "--".to_string(),
        ];
        args.extend(self.pathspecs(paths));
        self.outcome(args)
    }
}

fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut text = stdout.trim().to_string();
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim());
    }
    text
}

fn display_command(cwd: &Path, args: &[String]) -> String {
    format!("git -C {} {}", cwd.display(), args.join(" "))
}
