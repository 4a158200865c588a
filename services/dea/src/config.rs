//! Configuration for the DEA.
//!
//! Scalar settings come from `DEA_*` environment variables. Runtime
//! definitions are structured and live in a TOML file named by
//! `DEA_RUNTIMES_FILE`:
//!
//! ```toml
//! [runtimes.ruby18]
//! executable = "ruby"
//! version = "1\\.8\\.7"
//! additional_checks = ["-e", "puts :true"]
//!
//! [runtimes.ruby18.environment]
//! RUBYOPT = "-rubygems"
//!
//! [runtimes.ruby18.debug_env.suspend]
//! RUBY_DEBUG_WAIT = "1"
//! ```

use std::collections::BTreeMap;
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dea_id::NodeId;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading configuration. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("failed to read runtimes file {path}: {source}")]
    RuntimesFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse runtimes file {path}: {source}")]
    RuntimesParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no runtimes configured")]
    NoRuntimes,
}

/// One runtime as declared in the runtimes file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RuntimeDefinition {
    /// Executable name or path; bare names are resolved on `PATH`.
    pub executable: String,
    /// Regex the version probe output must match.
    pub version: String,
    #[serde(default = "default_version_flag")]
    pub version_flag: String,
    /// Extra arguments whose invocation must print `true`.
    #[serde(default)]
    pub additional_checks: Option<Vec<String>>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Debug-mode overlays keyed by debug mode name.
    #[serde(default)]
    pub debug_env: BTreeMap<String, BTreeMap<String, String>>,
}

fn default_version_flag() -> String {
    "-v".to_string()
}

#[derive(Debug, Deserialize)]
struct RuntimesFile {
    #[serde(default)]
    runtimes: BTreeMap<String, RuntimeDefinition>,
}

/// DEA configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this node on the bus.
    pub node_id: NodeId,

    /// Root of `staged/`, `apps/` and `db/`.
    pub base_dir: PathBuf,

    /// Address advertised to routers and in status replies.
    pub host: String,

    /// Node memory limit for admission, in MB.
    pub max_memory_mb: u64,

    pub multi_tenant: bool,

    /// Maximum number of admitted instances.
    pub max_clients: u64,

    /// Enforce per-instance memory and disk quotas in the monitor sweep.
    pub secure: bool,

    pub enforce_ulimit: bool,

    /// Keep instance directories and the staged cache on disk.
    pub disable_dir_cleanup: bool,

    /// Always download droplets over HTTP, ignoring the shared filesystem.
    pub force_http_sharing: bool,

    pub heartbeat_interval: Duration,

    /// Port of the directory server, advertised in hello and find replies.
    pub filer_port: u16,

    /// Credentials for the directory server, if any.
    pub filer_credentials: Option<(String, String)>,

    /// Location of the instance snapshot.
    pub snapshot_file: PathBuf,

    /// Delay between evacuation notices and shutdown.
    pub evacuation_delay: Duration,

    /// Upper bound on waiting for instances to stop during shutdown.
    pub shutdown_timeout: Duration,

    pub runtimes: BTreeMap<String, RuntimeDefinition>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_id = match lookup("DEA_NODE_ID") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "DEA_NODE_ID",
                value: raw,
            })?,
            None => NodeId::new(),
        };

        let base_dir = PathBuf::from(
            lookup("DEA_BASE_DIR").unwrap_or_else(|| "/var/vcap/dea".to_string()),
        );

        let host = match lookup("DEA_HOST") {
            Some(host) => host,
            None => {
                let route = lookup("DEA_LOCAL_ROUTE").unwrap_or_else(|| "198.41.0.4".to_string());
                local_ip(&route).unwrap_or_else(|| "127.0.0.1".to_string())
            }
        };

        let multi_tenant = parse_or(&lookup, "DEA_MULTI_TENANT", true)?;
        let default_clients = if multi_tenant { 1024 } else { 1 };

        let filer_credentials = match (lookup("DEA_FILER_USER"), lookup("DEA_FILER_PASSWORD")) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        };

        let snapshot_file = lookup("DEA_SNAPSHOT_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("db").join("applications.json"));

        let heartbeat_ms: u64 = parse_or(&lookup, "DEA_HEARTBEAT_INTERVAL_MS", 10_000)?;
        if heartbeat_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DEA_HEARTBEAT_INTERVAL_MS",
                value: heartbeat_ms.to_string(),
            });
        }

        let runtimes = match lookup("DEA_RUNTIMES_FILE") {
            Some(path) => load_runtimes(Path::new(&path))?,
            None => return Err(ConfigError::Missing("DEA_RUNTIMES_FILE")),
        };

        Ok(Self {
            node_id,
            base_dir,
            host,
            max_memory_mb: parse_or(&lookup, "DEA_MAX_MEMORY_MB", 2048)?,
            multi_tenant,
            max_clients: parse_or(&lookup, "DEA_MAX_CLIENTS", default_clients)?,
            secure: parse_or(&lookup, "DEA_SECURE", false)?,
            enforce_ulimit: parse_or(&lookup, "DEA_ENFORCE_ULIMIT", false)?,
            disable_dir_cleanup: parse_or(&lookup, "DEA_DISABLE_DIR_CLEANUP", false)?,
            force_http_sharing: parse_or(&lookup, "DEA_FORCE_HTTP_SHARING", false)?,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            filer_port: parse_or(&lookup, "DEA_FILER_PORT", 12345)?,
            filer_credentials,
            snapshot_file,
            evacuation_delay: Duration::from_secs(parse_or(
                &lookup,
                "DEA_EVACUATION_DELAY_SECS",
                30,
            )?),
            shutdown_timeout: Duration::from_secs(parse_or(
                &lookup,
                "DEA_SHUTDOWN_TIMEOUT_SECS",
                30,
            )?),
            runtimes,
        })
    }

    pub fn staged_dir(&self) -> PathBuf {
        self.base_dir.join("staged")
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.base_dir.join("apps")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }
}

/// Parse runtime definitions from a TOML file.
pub fn load_runtimes(path: &Path) -> Result<BTreeMap<String, RuntimeDefinition>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::RuntimesFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_runtimes(&raw).map_err(|e| match e {
        ConfigError::RuntimesParse { source, .. } => ConfigError::RuntimesParse {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

fn parse_runtimes(raw: &str) -> Result<BTreeMap<String, RuntimeDefinition>, ConfigError> {
    let file: RuntimesFile = toml::from_str(raw).map_err(|source| ConfigError::RuntimesParse {
        path: PathBuf::new(),
        source,
    })?;
    if file.runtimes.is_empty() {
        return Err(ConfigError::NoRuntimes);
    }
    Ok(file.runtimes)
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

/// Address of the interface that routes towards `route`.
///
/// Connecting a UDP socket sends nothing; it only selects the source address.
fn local_ip(route: &str) -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect((route, 1)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const RUNTIMES: &str = r#"
[runtimes.sh]
executable = "sh"
version = ".*"
additional_checks = ["-c", "echo true"]

[runtimes.sh.environment]
LANG = "C"

[runtimes.sh.debug_env.run]
SH_DEBUG = "1"
"#;

    fn runtimes_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RUNTIMES.as_bytes()).unwrap();
        file
    }

    fn lookup(vars: HashMap<&'static str, String>) -> impl Fn(&str) -> Option<String> {
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let file = runtimes_file();
        let vars = HashMap::from([
            ("DEA_RUNTIMES_FILE", file.path().display().to_string()),
            ("DEA_HOST", "10.1.2.3".to_string()),
        ]);
        let config = Config::from_lookup(lookup(vars)).unwrap();

        assert_eq!(config.base_dir, PathBuf::from("/var/vcap/dea"));
        assert_eq!(config.max_memory_mb, 2048);
        assert_eq!(config.max_clients, 1024);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(
            config.snapshot_file,
            PathBuf::from("/var/vcap/dea/db/applications.json")
        );
        assert_eq!(config.host, "10.1.2.3");

        let sh = &config.runtimes["sh"];
        assert_eq!(sh.version_flag, "-v");
        assert_eq!(sh.environment["LANG"], "C");
        assert_eq!(sh.debug_env["run"]["SH_DEBUG"], "1");
    }

    #[test]
    fn test_single_tenant_defaults_to_one_client() {
        let file = runtimes_file();
        let vars = HashMap::from([
            ("DEA_RUNTIMES_FILE", file.path().display().to_string()),
            ("DEA_MULTI_TENANT", "false".to_string()),
        ]);
        let config = Config::from_lookup(lookup(vars)).unwrap();
        assert_eq!(config.max_clients, 1);
    }

    #[test]
    fn test_invalid_number_is_fatal() {
        let file = runtimes_file();
        let vars = HashMap::from([
            ("DEA_RUNTIMES_FILE", file.path().display().to_string()),
            ("DEA_MAX_MEMORY_MB", "lots".to_string()),
        ]);
        let err = Config::from_lookup(lookup(vars)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "DEA_MAX_MEMORY_MB",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_heartbeat_interval_is_rejected() {
        let file = runtimes_file();
        let vars = HashMap::from([
            ("DEA_RUNTIMES_FILE", file.path().display().to_string()),
            ("DEA_HEARTBEAT_INTERVAL_MS", "0".to_string()),
        ]);
        let err = Config::from_lookup(lookup(vars)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "DEA_HEARTBEAT_INTERVAL_MS",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_runtimes_file_is_fatal() {
        let err = Config::from_lookup(lookup(HashMap::new())).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DEA_RUNTIMES_FILE")));
    }

    #[test]
    fn test_empty_runtimes_is_fatal() {
        assert!(matches!(
            parse_runtimes("[runtimes]\n"),
            Err(ConfigError::NoRuntimes)
        ));
    }
}
