use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::domain::issue::MAX_PRIORITY;
use crate::domain::Issue;

pub const LOG_FILE: &str = "issues.log";
pub const LOG_FORMAT_VERSION: u32 = 1;

const CONFLICT_MARKERS: [&str; 4] = ["<<<<<<<", "=======", ">>>>>>>", "|||||||"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOp {
    Create,
    Update,
    Close,
    Delete,
    Dependency,
    Merge,
    Compact,
    #[serde(other)]
    Unknown,
}

impl RecordOp {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordOp::Create => "create",
            RecordOp::Update => "update",
            RecordOp::Close => "close",
            RecordOp::Delete => "delete",
            RecordOp::Dependency => "dependency",
            RecordOp::Merge => "merge",
            RecordOp::Compact => "compact",
            RecordOp::Unknown => "unknown",
        }
    }
}

/// One line of `issues.log`: a whole-issue snapshot at revision `rev`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "v")]
    pub format: u32,
    pub id: String,
    pub rev: u64,
    pub op: RecordOp,
    pub at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub issue: Issue,
}

impl LogRecord {
    pub fn new(op: RecordOp, issue: Issue, agent: Option<String>) -> Self {
        Self {
            format: LOG_FORMAT_VERSION,
            id: issue.id.clone(),
            rev: issue.revision,
            op,
            at: issue.updated_at.clone(),
            agent,
            issue,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error on issue log: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize log record: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("malformed log record: {0}")]
    Malformed(String),
}

pub fn encode(record: &LogRecord) -> Result<String, CodecError> {
    let line = serde_json::to_string(record).map_err(CodecError::Serialize)?;
    Ok(line)
}

/// Decodes one line. Unknown fields are ignored; structurally valid JSON that
/// breaks record invariants is still rejected.
pub fn decode(line: &str) -> Result<LogRecord, CodecError> {
    let trimmed = line.trim();
    if CONFLICT_MARKERS
        .iter()
        .any(|marker| trimmed.starts_with(marker))
    {
        return Err(CodecError::Malformed("git conflict marker".to_string()));
    }

    let record: LogRecord =
        serde_json::from_str(trimmed).map_err(|err| CodecError::Malformed(err.to_string()))?;

    if record.format > LOG_FORMAT_VERSION {
        return Err(CodecError::Malformed(format!(
            "log format v{} is newer than supported v{LOG_FORMAT_VERSION}",
            record.format
        )));
    }
    if record.id.trim().is_empty() {
        return Err(CodecError::Malformed("empty id".to_string()));
    }
    if record.id != record.issue.id {
        return Err(CodecError::Malformed(format!(
            "record id '{}' does not match snapshot id '{}'",
            record.id, record.issue.id
        )));
    }
    if record.rev == 0 || record.rev != record.issue.revision {
        return Err(CodecError::Malformed(format!(
            "record rev {} does not match snapshot revision {}",
            record.rev, record.issue.revision
        )));
    }
    if record.issue.title.trim().is_empty() {
        return Err(CodecError::Malformed("empty title".to_string()));
    }
    if record.issue.priority > MAX_PRIORITY {
        return Err(CodecError::Malformed(format!(
            "priority {} out of range",
            record.issue.priority
        )));
    }
    if record.issue.is_closed()
        && record
            .issue
            .close_reason
            .as_deref()
            .map_or(true, |reason| reason.trim().is_empty())
    {
        return Err(CodecError::Malformed(
            "closed snapshot without a close reason".to_string(),
        ));
    }
    Ok(record)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptLine {
    pub line_number: usize,
    pub reason: String,
    pub raw: String,
}

#[derive(Debug, Clone, Default)]
pub struct LogContents {
    pub records: Vec<LogRecord>,
    pub corrupt: Vec<CorruptLine>,
}

/// Handle on the authoritative append-only log file.
#[derive(Debug, Clone)]
pub struct LogFile {
    path: PathBuf,
}

impl LogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(beads_dir: &Path) -> Self {
        Self::new(beads_dir.join(LOG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Appends already-encoded lines and fsyncs. A file left without a
    /// trailing newline (e.g. by a merge tool) gets one first.
    pub fn append(&self, lines: &[String]) -> Result<usize, CodecError> {
        if lines.is_empty() {
            return Ok(0);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        if needs_leading_newline(&mut file)? {
            file.write_all(b"\n")?;
        }

        let mut buffer = String::new();
        for line in lines {
            buffer.push_str(line.trim_end_matches('\n'));
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes())?;
        file.sync_all()?;
        Ok(lines.len())
    }

    /// Reads every line, collecting corrupt ones instead of failing.
    pub fn read(&self) -> Result<LogContents, CodecError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LogContents::default())
            }
            Err(err) => return Err(CodecError::Io(err)),
        };

        let mut contents = LogContents::default();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match decode(line) {
                Ok(record) => contents.records.push(record),
                Err(err) => {
                    warn!(line = index + 1, error = %err, "skipping corrupt log line");
                    contents.corrupt.push(CorruptLine {
                        line_number: index + 1,
                        reason: err.to_string(),
                        raw: line.to_string(),
                    });
                }
            }
        }
        Ok(contents)
    }

    /// Non-blank lines exactly as stored, for rewrites that must keep fields
    /// this version does not know about.
    pub fn raw_lines(&self) -> Result<Vec<String>, CodecError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(CodecError::Io(err)),
        }
    }

    /// Replaces the whole file atomically via a sibling temp file.
    pub fn rewrite(&self, lines: &[String]) -> Result<(), CodecError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("log.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for line in lines {
                tmp.write_all(line.trim_end_matches('\n').as_bytes())?;
                tmp.write_all(b"\n")?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// SHA-256 of the file bytes, `None` when the log does not exist yet.
    pub fn digest(&self) -> Result<Option<String>, CodecError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(format!("{:x}", Sha256::digest(&bytes)))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CodecError::Io(err)),
        }
    }
}

fn needs_leading_newline(file: &mut File) -> Result<bool, std::io::Error> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{
        decode, encode, CodecError, LogFile, LogRecord, RecordOp, LOG_FORMAT_VERSION,
    };
    use crate::domain::{Dependency, DependencyType, Issue, Status};

    fn snapshot(id: &str, revision: u64) -> Issue {
        Issue {
            id: id.to_string(),
            title: "Ship the codec".to_string(),
            description: Some("multi\nline \"quoted\" body".to_string()),
            status: Status::InProgress,
            priority: 1,
            issue_type: "feature".to_string(),
            labels: BTreeSet::from(["codec".to_string(), "log".to_string()]),
            assignee: Some("agent-7".to_string()),
            parent: None,
            created_at: "2026-02-22T10:00:00Z".to_string(),
            updated_at: "2026-02-22T11:00:00Z".to_string(),
            close_reason: None,
            closed_at: None,
            deleted_at: None,
            revision,
            dependencies: vec![Dependency {
                to: "bd-0001".to_string(),
                dep_type: DependencyType::Blocks,
                created_at: "2026-02-22T10:30:00Z".to_string(),
            }],
            history_digest: None,
            compacted_at: None,
        }
    }

    #[test]
    fn encoded_record_is_a_single_line_and_decodes_back() {
        let record = LogRecord::new(
            RecordOp::Update,
            snapshot("bd-a1b2", 3),
            Some("agent-7".into()),
        );
        let line = encode(&record).expect("record should encode");
        assert!(!line.contains('\n'));
        assert_eq!(decode(&line).expect("line should decode"), record);
    }

    #[test]
    fn decode_tolerates_unknown_fields_and_ops() {
        let record = LogRecord::new(RecordOp::Create, snapshot("bd-a1b2", 1), None);
        let mut value = serde_json::to_value(&record).expect("record should serialize");
        value["future_field"] = serde_json::json!({"nested": true});
        value["issue"]["estimate"] = serde_json::json!(5);
        value["op"] = serde_json::json!("split");
        let decoded = decode(&value.to_string()).expect("unknown fields should be ignored");
        assert_eq!(decoded.op, RecordOp::Unknown);
        assert_eq!(decoded.issue, record.issue);
    }

    #[test]
    fn decode_rejects_inconsistent_records() {
        let mut record = LogRecord::new(RecordOp::Update, snapshot("bd-a1b2", 2), None);
        record.rev = 5;
        let line = encode(&record).expect("record should encode");
        assert!(decode(&line).is_err());
        assert!(decode("{not json").is_err());
        assert!(decode("<<<<<<< HEAD").is_err());
    }

    #[test]
    fn decode_rejects_newer_formats_and_reasonless_closes() {
        let mut record = LogRecord::new(RecordOp::Create, snapshot("bd-a1b2", 1), None);
        record.format = LOG_FORMAT_VERSION + 1;
        let line = encode(&record).expect("record should encode");
        assert!(matches!(decode(&line), Err(CodecError::Malformed(_))));

        let mut issue = snapshot("bd-a1b2", 2);
        issue.status = Status::Closed;
        issue.closed_at = Some(issue.updated_at.clone());
        let line = encode(&LogRecord::new(RecordOp::Close, issue.clone(), None))
            .expect("record should encode");
        assert!(matches!(decode(&line), Err(CodecError::Malformed(_))));

        issue.close_reason = Some("shipped".to_string());
        let line = encode(&LogRecord::new(RecordOp::Close, issue, None))
            .expect("record should encode");
        assert!(decode(&line).is_ok());
    }

    #[test]
    fn read_skips_corrupt_lines_and_keeps_going() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let log = LogFile::in_dir(dir.path());
        let first = encode(&LogRecord::new(RecordOp::Create, snapshot("bd-a", 1), None))
            .expect("encode");
        let second = encode(&LogRecord::new(RecordOp::Create, snapshot("bd-b", 1), None))
            .expect("encode");
        log.append(&[first, "garbage".to_string(), second])
            .expect("append should work");

        let contents = log.read().expect("read should work");
        assert_eq!(contents.records.len(), 2);
        assert_eq!(contents.corrupt.len(), 1);
        assert_eq!(contents.corrupt[0].line_number, 2);
        assert_eq!(contents.corrupt[0].raw, "garbage");
    }

    #[test]
    fn append_repairs_missing_trailing_newline() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let log = LogFile::in_dir(dir.path());
        let first = encode(&LogRecord::new(RecordOp::Create, snapshot("bd-a", 1), None))
            .expect("encode");
        std::fs::write(log.path(), &first).expect("seed without newline");
        let second = encode(&LogRecord::new(RecordOp::Create, snapshot("bd-b", 1), None))
            .expect("encode");
        log.append(&[second]).expect("append should work");

        let contents = log.read().expect("read should work");
        assert_eq!(contents.records.len(), 2);
        assert!(contents.corrupt.is_empty());
    }

    #[test]
    fn rewrite_replaces_contents_and_changes_digest() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let log = LogFile::in_dir(dir.path());
        assert_eq!(log.digest().expect("digest"), None);
        log.append(&["one".to_string()]).expect("append");
        let before = log.digest().expect("digest");
        log.rewrite(&["two".to_string()]).expect("rewrite");
        let after = log.digest().expect("digest");
        assert_ne!(before, after);
        assert_eq!(
            std::fs::read_to_string(log.path()).expect("log should read"),
            "two\n"
        );
    }
}
