use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::codec::LOG_FILE;
use crate::config::{Config, ConfigError, CONFIG_FILE};

pub const BEADS_DIR: &str = ".beads";
pub const GITIGNORE_FILE: &str = ".gitignore";
pub const GITATTRIBUTES_FILE: &str = ".gitattributes";

/// Local-only state under `.beads/` that must never be committed.
pub const IGNORE_RULES: [&str; 4] = ["cache/", "locks/", "daemon.pid", "daemon.log"];

/// Lets `git pull` concatenate diverged logs instead of stopping on a
/// textual conflict; reconcile sorts the result out.
pub const ATTRIBUTE_RULES: [&str; 1] = ["issues.log merge=union"];

#[derive(Debug, Error)]
pub enum InitError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InitReport {
    pub beads_dir: PathBuf,
    pub created_config: bool,
    pub created_log: bool,
    pub added_rules: Vec<String>,
}

/// Creates `.beads/` with its config, empty log and git metadata files.
/// Existing files are left alone, so running it twice is harmless.
pub fn init_beads_dir(beads_dir: &Path, prefix: Option<&str>) -> Result<InitReport, InitError> {
    std::fs::create_dir_all(beads_dir)?;

    let config_path = beads_dir.join(CONFIG_FILE);
    let created_config = !config_path.exists();
    if created_config {
        let mut config = Config::default();
        if let Some(prefix) = prefix {
            config.id.prefix = prefix.trim().to_string();
        }
        config.validate()?;
        std::fs::write(&config_path, config.to_toml()?)?;
    } else if let Some(prefix) = prefix {
        let existing = Config::load(beads_dir)?;
        if existing.id.prefix != prefix.trim() {
            return Err(ConfigError::Invalid(format!(
                "already initialized with prefix '{}'",
                existing.id.prefix
            ))
            .into());
        }
    }

    let log_path = beads_dir.join(LOG_FILE);
    let created_log = !log_path.exists();
    if created_log {
        std::fs::File::create(&log_path)?;
    }

    let added_rules = ensure_git_files(beads_dir)?
        .into_iter()
        .map(str::to_string)
        .collect();
    info!(path = %beads_dir.display(), created_config, created_log, "initialized beads directory");
    Ok(InitReport {
        beads_dir: beads_dir.to_path_buf(),
        created_config,
        created_log,
        added_rules,
    })
}

/// Appends whatever ignore and attribute rules are missing. Returns the
/// rules that were added.
pub fn ensure_git_files(beads_dir: &Path) -> io::Result<Vec<&'static str>> {
    let mut added = ensure_rules(&beads_dir.join(GITIGNORE_FILE), &IGNORE_RULES)?;
    added.extend(ensure_rules(
        &beads_dir.join(GITATTRIBUTES_FILE),
        &ATTRIBUTE_RULES,
    )?);
    Ok(added)
}

pub fn missing_rules(path: &Path, rules: &[&'static str]) -> io::Result<Vec<&'static str>> {
    let contents = read_or_empty(path)?;
    Ok(rules
        .iter()
        .copied()
        .filter(|rule| !contains_rule(&contents, rule))
        .collect())
}

fn ensure_rules(path: &Path, rules: &[&'static str]) -> io::Result<Vec<&'static str>> {
    let contents = read_or_empty(path)?;
    let missing: Vec<&'static str> = rules
        .iter()
        .copied()
        .filter(|rule| !contains_rule(&contents, rule))
        .collect();
    if missing.is_empty() {
        return Ok(missing);
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if !contents.is_empty() && !contents.ends_with('\n') {
        writeln!(file)?;
    }
    for rule in &missing {
        writeln!(file, "{rule}")?;
    }
    Ok(missing)
}

fn read_or_empty(path: &Path) -> io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err),
    }
}

fn contains_rule(contents: &str, rule: &str) -> bool {
    let wanted = rule.trim_start_matches('/');
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.is_empty())
        .any(|line| line.trim_start_matches('/') == wanted)
}

#[cfg(test)]
mod tests {
    use super::{
        ensure_git_files, init_beads_dir, missing_rules, GITATTRIBUTES_FILE, GITIGNORE_FILE,
        IGNORE_RULES,
    };
    use crate::codec::LOG_FILE;
    use crate::config::{Config, CONFIG_FILE};

    #[test]
    fn init_writes_expected_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let beads = dir.path().join(".beads");
        let report = init_beads_dir(&beads, Some("proj")).expect("init should succeed");

        assert!(report.created_config);
        assert!(report.created_log);
        assert_eq!(report.added_rules.len(), 5);
        assert_eq!(
            std::fs::read_to_string(beads.join(LOG_FILE)).expect("log should exist"),
            ""
        );
        let config = Config::load(&beads).expect("config should parse");
        assert_eq!(config.id.prefix, "proj");
        let gitignore =
            std::fs::read_to_string(beads.join(GITIGNORE_FILE)).expect("gitignore should exist");
        for rule in IGNORE_RULES {
            assert!(gitignore.lines().any(|line| line == rule), "missing {rule}");
        }
        let attributes = std::fs::read_to_string(beads.join(GITATTRIBUTES_FILE))
            .expect("gitattributes should exist");
        assert!(attributes.contains("issues.log merge=union"));
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let beads = dir.path().join(".beads");
        init_beads_dir(&beads, None).expect("first init");
        std::fs::write(beads.join(LOG_FILE), "{}\n").expect("log should be writable");

        let again = init_beads_dir(&beads, None).expect("second init");
        assert!(!again.created_config);
        assert!(!again.created_log);
        assert!(again.added_rules.is_empty());
        assert_eq!(
            std::fs::read_to_string(beads.join(LOG_FILE)).expect("log should exist"),
            "{}\n"
        );
    }

    #[test]
    fn init_rejects_a_different_prefix_on_existing_config() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let beads = dir.path().join(".beads");
        init_beads_dir(&beads, Some("one")).expect("first init");
        let err = init_beads_dir(&beads, Some("two")).expect_err("prefix change should fail");
        assert!(err.to_string().contains("'one'"));
        assert!(beads.join(CONFIG_FILE).exists());
    }

    #[test]
    fn ensure_git_files_keeps_user_rules_and_appends_missing_ones() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        std::fs::write(dir.path().join(GITIGNORE_FILE), "# mine\n/cache/\nscratch").expect("seed");

        let added = ensure_git_files(dir.path()).expect("ensure should succeed");
        assert!(!added.contains(&"cache/"));
        assert!(added.contains(&"locks/"));

        let gitignore =
            std::fs::read_to_string(dir.path().join(GITIGNORE_FILE)).expect("read gitignore");
        assert!(gitignore.starts_with("# mine\n/cache/\nscratch\n"));
        assert!(missing_rules(&dir.path().join(GITIGNORE_FILE), &IGNORE_RULES)
            .expect("read rules")
            .is_empty());
    }
}
