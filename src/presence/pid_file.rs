use std::fs;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const PID_FILE: &str = "daemon.pid";

/// Contents of `.beads/daemon.pid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonInfo {
    pub pid: u32,
    pub port: u16,
    pub host: String,
    pub version: u32,
}

impl DaemonInfo {
    pub fn address(&self) -> io::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid daemon address"))
    }
}

/// Address file for the running daemon, in a simple `KEY=value` format:
/// ```text
/// PID=12345
/// PORT=40123
/// HOST=127.0.0.1
/// VERSION=1
/// ```
#[derive(Debug, Clone)]
pub struct DaemonPidFile {
    path: PathBuf,
}

impl DaemonPidFile {
    pub fn new(beads_dir: &Path) -> Self {
        Self {
            path: beads_dir.join(PID_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn write(&self, info: &DaemonInfo) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = format!(
            "PID={}\nPORT={}\nHOST={}\nVERSION={}\n",
            info.pid, info.port, info.host, info.version
        );
        let mut file = fs::File::create(&self.path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn read(&self) -> io::Result<Option<DaemonInfo>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(parse_contents(&contents)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

fn parse_contents(contents: &str) -> io::Result<DaemonInfo> {
    let mut pid = None;
    let mut port = None;
    let mut host = None;
    let mut version = None;

    for line in contents.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "PID" => pid = Some(value.parse().map_err(|_| invalid("invalid PID value"))?),
            "PORT" => port = Some(value.parse().map_err(|_| invalid("invalid PORT value"))?),
            "HOST" => host = Some(value.to_string()),
            "VERSION" => {
                version = Some(value.parse().map_err(|_| invalid("invalid VERSION value"))?)
            }
            _ => {}
        }
    }

    Ok(DaemonInfo {
        pid: pid.ok_or_else(|| invalid("missing PID field"))?,
        port: port.ok_or_else(|| invalid("missing PORT field"))?,
        host: host.ok_or_else(|| invalid("missing HOST field"))?,
        // Files written before versioning count as version 0, i.e. stale.
        version: version.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::{DaemonInfo, DaemonPidFile};

    fn sample() -> DaemonInfo {
        DaemonInfo {
            pid: 4242,
            port: 40123,
            host: "127.0.0.1".to_string(),
            version: 1,
        }
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let file = DaemonPidFile::new(dir.path());
        assert_eq!(file.read().expect("read"), None);

        file.write(&sample()).expect("write");
        let info = file.read().expect("read").expect("info");
        assert_eq!(info, sample());
        assert_eq!(info.address().expect("address").port(), 40123);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let file = DaemonPidFile::new(dir.path());
        file.write(&sample()).expect("write");
        file.delete().expect("delete");
        file.delete().expect("second delete");
        assert!(!file.exists());
    }

    #[test]
    fn missing_fields_are_invalid_data() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let file = DaemonPidFile::new(dir.path());
        std::fs::write(file.path(), "PID=1\nHOST=127.0.0.1\n").expect("write");
        let err = file.read().expect_err("missing port");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn unversioned_file_reads_as_version_zero() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let file = DaemonPidFile::new(dir.path());
        std::fs::write(file.path(), "PID=1\nPORT=9\nHOST=127.0.0.1\nEXTRA=x\n").expect("write");
        assert_eq!(file.read().expect("read").expect("info").version, 0);
    }
}
