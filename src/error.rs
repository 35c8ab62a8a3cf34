//! Typed errors per subsystem. The controller is the only place that maps
//! these to state-machine transitions; everywhere else they just
//! propagate.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum EventSourceError {
    #[error("missing capability to open the kernel event channel: {0}")]
    PermissionDenied(std::io::Error),
    #[error("failed to bind kernel event channel: {0}")]
    Bind(std::io::Error),
    #[error("failed to send subscription message: {0}")]
    Send(std::io::Error),
    #[error("recv on kernel event channel failed: {0}")]
    Recv(std::io::Error),
}

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("process {0} has no readable /proc/<pid>/exe (exited?)")]
    NoExePath(i32),
    #[error("process {0} has no readable /proc/<pid>/stat")]
    NoStat(i32),
    #[error("/proc/{0}/stat has an unparsable layout")]
    MalformedStat(i32),
    #[error("failed to hash {path}: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
    #[error("read deadline expired")]
    DeadlineExpired,
}

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("failed to set no_new_privs: {0}")]
    NoNewPrivs(std::io::Error),
    #[error("failed to drop capabilities: {0}")]
    Caps(#[from] caps::errors::CapsError),
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    EventSource(#[from] EventSourceError),
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
    #[error("failed to bind arbitration socket at {path}: {source}")]
    SocketBind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
