//! Daemon configuration: a JSON file plus a small set of environment
//! overrides layered on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::canonicalize;

const ENV_SOCKET_PATH: &str = "APPLOCK_DAEMON_SOCKET_PATH";
const DEFAULT_CONFIG_PATH: &str = "/etc/applock-daemon/config.json";
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/applock-daemon.sock";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuiConfig {
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(flatten, default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default, rename = "protectedApps")]
    protected_apps: Vec<PathBuf>,
    #[serde(default)]
    verbose: bool,
    #[serde(default)]
    gui: GuiConfig,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    socket_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Already-canonicalised allow-list; the Protection Policy can compare
    /// by exact string equality without re-resolving symlinks per lookup.
    pub protected_apps: Vec<PathBuf>,
    pub verbose: bool,
    pub gui: GuiConfig,
    pub auth: AuthConfig,
    pub socket_path: PathBuf,
    pub shutdown_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            protected_apps: Vec::new(),
            verbose: false,
            gui: GuiConfig::default(),
            auth: AuthConfig::default(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or `DEFAULT_CONFIG_PATH` if `path`
    /// is `None` and that default exists, or built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            }
        };

        let mut config = match candidate {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };

        if let Ok(socket) = std::env::var(ENV_SOCKET_PATH) {
            config.socket_path = PathBuf::from(socket);
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let protected_apps = raw
            .protected_apps
            .iter()
            .map(|p| canonicalize(p).unwrap_or_else(|_| p.clone()))
            .collect();

        Ok(Config {
            protected_apps,
            verbose: raw.verbose,
            gui: raw.gui,
            auth: raw.auth,
            socket_path: raw
                .socket_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            shutdown_deadline: Duration::from_secs(10),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_canonicalises_protected_apps() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real-cat");
        std::fs::write(&target, b"").unwrap();
        let link = dir.path().join("cat-link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let cfg_path = dir.path().join("config.json");
        let mut f = std::fs::File::create(&cfg_path).unwrap();
        write!(
            f,
            r#"{{"protectedApps":["{}"],"verbose":true}}"#,
            link.display()
        )
        .unwrap();

        let config = Config::load(Some(&cfg_path)).unwrap();
        assert!(config.verbose);
        assert_eq!(config.protected_apps, vec![canonicalize(&target).unwrap()]);
    }

    #[test]
    fn missing_file_falls_back_to_defaults_when_path_not_given() {
        // No default config path exists in the test sandbox.
        let config = Config::load(None).unwrap();
        assert!(config.protected_apps.is_empty());
    }
}
