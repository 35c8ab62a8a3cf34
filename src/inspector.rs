//! Process identity resolution by reading the kernel's per-process
//! pseudo-filesystem. Every result here is a snapshot — callers must assume
//! the real process may have exited or re-exec'd between calls.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::InspectError;

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Injectable capability so the controller's state machine can be
/// unit-tested without a real `/proc`.
pub trait ProcessInspector: Send + Sync {
    fn path(&self, pid: i32) -> Result<PathBuf, InspectError>;
    fn parent(&self, pid: i32) -> Result<i32, InspectError>;
    fn hash(&self, path: &Path) -> Result<[u8; 32], InspectError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcFsInspector;

impl ProcessInspector for ProcFsInspector {
    fn path(&self, pid: i32) -> Result<PathBuf, InspectError> {
        let link = format!("/proc/{pid}/exe");
        std::fs::read_link(&link).map_err(|_| InspectError::NoExePath(pid))
    }

    fn parent(&self, pid: i32) -> Result<i32, InspectError> {
        let stat_path = format!("/proc/{pid}/stat");
        let contents =
            std::fs::read_to_string(&stat_path).map_err(|_| InspectError::NoStat(pid))?;
        parse_ppid(&contents).ok_or(InspectError::MalformedStat(pid))
    }

    fn hash(&self, path: &Path) -> Result<[u8; 32], InspectError> {
        hash_file_streaming(path)
    }
}

/// `/proc/<pid>/stat` field 2 is `(comm)`, which may itself contain spaces
/// and parentheses, so it cannot be parsed by a naive positional whitespace
/// split. The safe parse scans for the *last* `)` in the line — the comm
/// field can contain
/// `)` but never one that is followed by more `)`-containing fields before
/// the numeric fields start — then splits the remainder on whitespace.
fn parse_ppid(stat_line: &str) -> Option<i32> {
    let close = stat_line.rfind(')')?;
    let rest = stat_line.get(close + 1..)?;
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?; // field 3: state
    let ppid = fields.next()?; // field 4: parent pid
    ppid.parse().ok()
}

fn hash_file_streaming(path: &Path) -> Result<[u8; 32], InspectError> {
    let mut file = File::open(path).map_err(|source| InspectError::Hash {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).map_err(|source| InspectError::Hash {
            path: path.to_path_buf(),
            source,
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_comm() {
        let line = "4242 (cat) S 1 4242 4242 0 -1 4194560 100 0 0 0 0 0 0 0 20 0 1 0";
        assert_eq!(parse_ppid(line), Some(1));
    }

    #[test]
    fn parses_comm_with_spaces_and_parens() {
        let line = "4242 (my cool (app)) R 1000 4242 4242 0 -1 4194304 1 0 0 0 0 0 0 0 20 0 1 0";
        assert_eq!(parse_ppid(line), Some(1000));
    }

    #[test]
    fn malformed_stat_returns_none() {
        assert_eq!(parse_ppid("not a stat line"), None);
    }

    #[test]
    fn hashes_file_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"hello world").unwrap();

        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(b"hello world");
            let out: [u8; 32] = hasher.finalize().into();
            out
        };

        assert_eq!(hash_file_streaming(&path).unwrap(), expected);
    }

    #[test]
    fn hashing_missing_file_is_an_error() {
        let missing = Path::new("/nonexistent/definitely/not-here");
        assert!(hash_file_streaming(missing).is_err());
    }
}
