//! Settings for both daemons.
//!
//! The server is configured from CLI flags plus `-S key=value` advanced
//! settings; the agent reads the cluster's flat key-value configuration
//! tree (`quorum.device.*`, `totem.cluster_name`, …) from a file and
//! derives its intervals from the quorum-device timeout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use arbiter_proto::{DecisionAlgorithm, TieBreaker, TlsSupported};

/// Default server port.
pub const DEFAULT_PORT: u16 = 5403;

/// Smallest accepted send/receive size limit.
const MIN_RECEIVE_SEND_SIZE: usize = 16;
/// Smallest accepted send-buffer count.
const MIN_SEND_BUFFERS: usize = 2;

/// Server tunables; every field can be overridden via `-S`.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Lower bound on a client's heartbeat interval, ms.
    pub heartbeat_interval_min: u32,
    /// Upper bound on a client's heartbeat interval, ms.
    pub heartbeat_interval_max: u32,
    /// Whether the dead-peer sweep runs at all.
    pub dpd_enabled: bool,
    /// Dead-peer sweep period, ms.
    pub dpd_interval: u32,
    /// Listen backlog.
    pub listen_backlog: u32,
    /// Cap on queued outbound frames per client.
    pub max_client_send_buffers: usize,
    /// Largest frame the server will send.
    pub max_client_send_size: usize,
    /// Largest frame the server will accept.
    pub max_client_receive_size: usize,
    /// Maximum simultaneous clients; zero means unlimited.
    pub max_clients: usize,
    /// PID/lock file enforcing a single instance.
    pub lock_file: PathBuf,
    /// Server certificate chain (PEM).
    pub tls_cert_file: PathBuf,
    /// Server private key (PEM).
    pub tls_key_file: PathBuf,
    /// CA bundle used to verify client certificates (PEM).
    pub tls_ca_file: PathBuf,
    /// Whether the unconditional-ACK test algorithm may be negotiated.
    pub test_algorithm_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            heartbeat_interval_min: 1_000,
            heartbeat_interval_max: 2 * 60 * 1_000,
            dpd_enabled: true,
            dpd_interval: 10_000,
            listen_backlog: 10,
            max_client_send_buffers: 32,
            max_client_send_size: 1 << 15,
            max_client_receive_size: 1 << 15,
            max_clients: 0,
            lock_file: PathBuf::from("/var/run/arbiterd/arbiterd.pid"),
            tls_cert_file: PathBuf::from("/etc/arbiterd/tls/cert.pem"),
            tls_key_file: PathBuf::from("/etc/arbiterd/tls/key.pem"),
            tls_ca_file: PathBuf::from("/etc/arbiterd/tls/ca.pem"),
            test_algorithm_enabled: false,
        }
    }
}

/// An advanced setting that could not be applied.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// No such setting.
    #[error("unknown advanced setting {0:?}")]
    UnknownKey(String),
    /// Value failed to parse or violated the setting's minimum.
    #[error("invalid value {value:?} for advanced setting {key:?}")]
    InvalidValue {
        /// Setting name.
        key: String,
        /// Offending value.
        value: String,
    },
}

impl ServerSettings {
    /// Apply one `key=value` advanced setting.
    pub fn apply_advanced(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let invalid = || SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "heartbeat_interval_min" => {
                self.heartbeat_interval_min = parse_min(value, 1).ok_or_else(invalid)?;
            }
            "heartbeat_interval_max" => {
                self.heartbeat_interval_max = parse_min(value, 1).ok_or_else(invalid)?;
            }
            "dpd_enabled" => self.dpd_enabled = parse_bool(value).ok_or_else(invalid)?,
            "dpd_interval" => self.dpd_interval = parse_min(value, 1).ok_or_else(invalid)?,
            "listen_backlog" => self.listen_backlog = parse_min(value, 1).ok_or_else(invalid)?,
            "max_client_send_buffers" => {
                self.max_client_send_buffers =
                    parse_min(value, MIN_SEND_BUFFERS as u32).ok_or_else(invalid)? as usize;
            }
            "max_client_send_size" => {
                self.max_client_send_size =
                    parse_min(value, MIN_RECEIVE_SEND_SIZE as u32).ok_or_else(invalid)? as usize;
            }
            "max_client_receive_size" => {
                self.max_client_receive_size =
                    parse_min(value, MIN_RECEIVE_SEND_SIZE as u32).ok_or_else(invalid)? as usize;
            }
            "lock_file" => self.lock_file = PathBuf::from(value),
            "tls_cert_file" => self.tls_cert_file = PathBuf::from(value),
            "tls_key_file" => self.tls_key_file = PathBuf::from(value),
            "tls_ca_file" => self.tls_ca_file = PathBuf::from(value),
            "test_algorithm_enabled" => {
                self.test_algorithm_enabled = parse_bool(value).ok_or_else(invalid)?;
            }
            _ => return Err(SettingsError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Apply a `key=value,key=value,…` list as given to `-S`.
    pub fn apply_advanced_list(&mut self, list: &str) -> Result<(), SettingsError> {
        for item in list.split(',').filter(|item| !item.is_empty()) {
            let (key, value) = item.split_once('=').ok_or_else(|| {
                SettingsError::InvalidValue {
                    key: item.to_string(),
                    value: String::new(),
                }
            })?;
            self.apply_advanced(key, value)?;
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "on" | "1" | "yes" | "true" => Some(true),
        "off" | "0" | "no" | "false" => Some(false),
        _ => None,
    }
}

fn parse_min(value: &str, min: u32) -> Option<u32> {
    value.parse::<u32>().ok().filter(|parsed| *parsed >= min)
}

/// How the heuristics executor behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeuristicsMode {
    /// No probes; result is always undefined.
    #[default]
    Disabled,
    /// Probes run on membership changes and on a regular interval.
    Enabled,
    /// Probes run only on membership changes.
    Sync,
}

/// One configured probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicsExec {
    /// Name taken from the `exec_<name>` configuration key.
    pub name: String,
    /// Shell command to run.
    pub command: String,
}

/// Heuristics executor settings.
#[derive(Debug, Clone, Default)]
pub struct HeuristicsSettings {
    /// Operating mode.
    pub mode: HeuristicsMode,
    /// Per-run budget for membership-change runs, ms.
    pub timeout: u32,
    /// Per-run budget for the run right after connecting, ms.
    pub sync_timeout: u32,
    /// Period of regular re-runs, ms.
    pub interval: u32,
    /// The probes themselves.
    pub execs: Vec<HeuristicsExec>,
}

/// Fully derived agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Cluster this node belongs to (`totem.cluster_name`).
    pub cluster_name: String,
    /// This node's id (`runtime.votequorum.this_node_id`).
    pub node_id: u32,
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// TLS policy offered to the server.
    pub tls: TlsSupported,
    /// Decision algorithm to request.
    pub algorithm: DecisionAlgorithm,
    /// Cluster-wide tie breaker.
    pub tie_breaker: TieBreaker,
    /// 0 = any address family, 4 or 6 to force one.
    pub force_ip_version: u8,
    /// Whether `quorum.wait_for_all` is enabled locally.
    pub wait_for_all: bool,
    /// Heartbeat interval, ms (0.8 × quorum-device timeout, clamped).
    pub heartbeat_interval: u32,
    /// Heartbeat interval during sync, ms.
    pub sync_heartbeat_interval: u32,
    /// Cast-vote tick, ms (0.5 × quorum-device timeout).
    pub cast_vote_timer_interval: u32,
    /// Connect-plus-handshake budget, ms.
    pub connect_timeout: u32,
    /// Smallest request size the server must accept.
    pub min_send_size: usize,
    /// Largest reply this agent can ever be asked to buffer.
    pub max_receive_size: usize,
    /// Cap on queued outbound frames.
    pub max_send_buffers: usize,
    /// Heuristics executor settings.
    pub heuristics: HeuristicsSettings,
    /// Name the server's certificate must present.
    pub tls_server_name: String,
    /// CA bundle used to verify the server (PEM).
    pub tls_ca_file: Option<PathBuf>,
    /// Client certificate chain (PEM), when the server demands one.
    pub tls_cert_file: Option<PathBuf>,
    /// Client private key (PEM).
    pub tls_key_file: Option<PathBuf>,
}

/// Agent configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// The file was unreadable or not parseable.
    #[error("can't read configuration: {0}")]
    Read(#[from] config::ConfigError),
    /// A present key carried an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl AgentConfig {
    /// Read and derive the agent configuration from a file holding the
    /// cluster's flat key tree.
    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        let cfg = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        let model = cfg
            .get_string("quorum.device.model")
            .map_err(|_| ConfigLoadError::Invalid("quorum.device.model is not set".into()))?;
        if model != "net" {
            return Err(ConfigLoadError::Invalid(format!(
                "unsupported quorum device model {:?}",
                model
            )));
        }

        let cluster_name = cfg
            .get_string("totem.cluster_name")
            .map_err(|_| ConfigLoadError::Invalid("totem.cluster_name is not set".into()))?;
        let node_id = get_u32(&cfg, "runtime.votequorum.this_node_id")?
            .ok_or_else(|| {
                ConfigLoadError::Invalid("runtime.votequorum.this_node_id is not set".into())
            })?;
        if node_id == 0 {
            return Err(ConfigLoadError::Invalid("node id must be nonzero".into()));
        }
        let host = cfg
            .get_string("quorum.device.net.host")
            .map_err(|_| ConfigLoadError::Invalid("quorum.device.net.host is not set".into()))?;

        let port = match get_u32(&cfg, "quorum.device.net.port")? {
            None => DEFAULT_PORT,
            Some(port @ 1..=65535) => port as u16,
            Some(other) => {
                return Err(ConfigLoadError::Invalid(format!("invalid port {}", other)))
            }
        };

        let tls = match cfg.get_string("quorum.device.net.tls").ok().as_deref() {
            None | Some("on") => TlsSupported::Supported,
            Some("off") => TlsSupported::Unsupported,
            Some("required") => TlsSupported::Required,
            Some(other) => {
                return Err(ConfigLoadError::Invalid(format!(
                    "invalid tls mode {:?}",
                    other
                )))
            }
        };

        let algorithm = match cfg.get_string("quorum.device.net.algorithm").ok() {
            None => DecisionAlgorithm::Ffsplit,
            Some(name) => name.parse().map_err(ConfigLoadError::Invalid)?,
        };

        let tie_breaker = match cfg.get_string("quorum.device.net.tie_breaker").ok() {
            None => TieBreaker::Lowest,
            Some(text) => text.parse().map_err(ConfigLoadError::Invalid)?,
        };

        let force_ip_version = match get_u32(&cfg, "quorum.device.net.force_ip_version")? {
            None | Some(0) => 0,
            Some(4) => 4,
            Some(6) => 6,
            Some(other) => {
                return Err(ConfigLoadError::Invalid(format!(
                    "invalid force_ip_version {}",
                    other
                )))
            }
        };

        let timeout = get_u32(&cfg, "quorum.device.timeout")?.unwrap_or(10_000);
        let sync_timeout = get_u32(&cfg, "quorum.device.sync_timeout")?.unwrap_or(30_000);

        let cast_vote_timer_interval = timeout / 2;
        let heartbeat_interval = (timeout as u64 * 8 / 10).clamp(1_000, 2 * 60 * 1_000) as u32;
        let sync_heartbeat_interval =
            (sync_timeout as u64 * 8 / 10).clamp(1_000, 2 * 60 * 1_000) as u32;

        let connect_timeout = match get_u32(&cfg, "quorum.device.net.connect_timeout")? {
            None => heartbeat_interval,
            Some(value @ 1_000..=120_000) => value,
            Some(other) => {
                return Err(ConfigLoadError::Invalid(format!(
                    "connect_timeout {} outside [1000, 120000]",
                    other
                )))
            }
        };

        let heuristics = load_heuristics(&cfg, heartbeat_interval, sync_heartbeat_interval)?;

        let tls_server_name = cfg
            .get_string("quorum.device.net.tls_server_name")
            .unwrap_or_else(|_| host.clone());

        Ok(AgentConfig {
            cluster_name,
            node_id,
            host,
            port,
            tls,
            algorithm,
            tie_breaker,
            force_ip_version,
            wait_for_all: get_u32(&cfg, "quorum.wait_for_all")?.unwrap_or(0) != 0,
            heartbeat_interval,
            sync_heartbeat_interval,
            cast_vote_timer_interval,
            connect_timeout,
            min_send_size: 1 << 15,
            max_receive_size: 1 << 24,
            max_send_buffers: 10,
            heuristics,
            tls_server_name,
            tls_ca_file: get_path(&cfg, "quorum.device.net.tls_ca_file"),
            tls_cert_file: get_path(&cfg, "quorum.device.net.tls_cert_file"),
            tls_key_file: get_path(&cfg, "quorum.device.net.tls_key_file"),
        })
    }

    /// Connect-plus-handshake budget as a [`Duration`].
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout as u64)
    }
}

fn load_heuristics(
    cfg: &config::Config,
    heartbeat_interval: u32,
    sync_heartbeat_interval: u32,
) -> Result<HeuristicsSettings, ConfigLoadError> {
    let mode = match cfg.get_string("quorum.device.heuristics.mode").ok().as_deref() {
        None | Some("off") => HeuristicsMode::Disabled,
        Some("on") => HeuristicsMode::Enabled,
        Some("sync") => HeuristicsMode::Sync,
        Some(other) => {
            return Err(ConfigLoadError::Invalid(format!(
                "invalid heuristics mode {:?}",
                other
            )))
        }
    };

    let timeout =
        get_u32(cfg, "quorum.device.heuristics.timeout")?.unwrap_or(heartbeat_interval / 2);
    let sync_timeout = get_u32(cfg, "quorum.device.heuristics.sync_timeout")?
        .unwrap_or(sync_heartbeat_interval / 2);
    let interval =
        get_u32(cfg, "quorum.device.heuristics.interval")?.unwrap_or(heartbeat_interval * 3);

    let mut execs = Vec::new();
    if let Ok(table) = cfg.get_table("quorum.device.heuristics") {
        for (key, value) in table {
            if let Some(name) = key.strip_prefix("exec_") {
                let command = value
                    .into_string()
                    .map_err(|_| ConfigLoadError::Invalid(format!("exec_{} is not a string", name)))?;
                execs.push(HeuristicsExec {
                    name: name.to_string(),
                    command,
                });
            }
        }
    }
    execs.sort_by(|a, b| a.name.cmp(&b.name));

    if mode != HeuristicsMode::Disabled && execs.is_empty() {
        return Err(ConfigLoadError::Invalid(
            "heuristics are enabled but no exec_ commands are configured".into(),
        ));
    }

    Ok(HeuristicsSettings {
        mode,
        timeout,
        sync_timeout,
        interval,
        execs,
    })
}

fn get_u32(cfg: &config::Config, key: &str) -> Result<Option<u32>, ConfigLoadError> {
    match cfg.get_int(key) {
        Ok(value) => u32::try_from(value)
            .map(Some)
            .map_err(|_| ConfigLoadError::Invalid(format!("{} is out of range", key))),
        Err(_) => Ok(None),
    }
}

fn get_path(cfg: &config::Config, key: &str) -> Option<PathBuf> {
    cfg.get_string(key).ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const BASE: &str = r#"
[totem]
cluster_name = "alpha"

[runtime.votequorum]
this_node_id = 1

[quorum.device]
model = "net"
timeout = 10000

[quorum.device.net]
host = "arbiter.example.net"
"#;

    #[test]
    fn derives_intervals_from_timeout() {
        let file = write_config(BASE);
        let cfg = AgentConfig::load(file.path()).unwrap();

        assert_eq!(cfg.cluster_name, "alpha");
        assert_eq!(cfg.node_id, 1);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.cast_vote_timer_interval, 5_000);
        assert_eq!(cfg.heartbeat_interval, 8_000);
        assert_eq!(cfg.connect_timeout, 8_000);
        assert_eq!(cfg.algorithm, DecisionAlgorithm::Ffsplit);
        assert_eq!(cfg.tie_breaker, TieBreaker::Lowest);
        assert_eq!(cfg.tls, TlsSupported::Supported);
        assert_eq!(cfg.heuristics.mode, HeuristicsMode::Disabled);
    }

    #[test]
    fn heartbeat_is_clamped() {
        let body = BASE.replace("timeout = 10000", "timeout = 500");
        let file = write_config(&body);
        let cfg = AgentConfig::load(file.path()).unwrap();
        assert_eq!(cfg.heartbeat_interval, 1_000);
    }

    #[test]
    fn rejects_non_net_model() {
        let body = BASE.replace("model = \"net\"", "model = \"disk\"");
        let file = write_config(&body);
        assert!(AgentConfig::load(file.path()).is_err());
    }

    #[test]
    fn parses_algorithm_and_tie_breaker() {
        let body = format!(
            "{}algorithm = \"lms\"\ntie_breaker = \"2\"\ntls = \"off\"\n",
            BASE
        );
        let file = write_config(&body);
        let cfg = AgentConfig::load(file.path()).unwrap();
        assert_eq!(cfg.algorithm, DecisionAlgorithm::Lms);
        assert_eq!(cfg.tie_breaker, TieBreaker::NodeId(2));
        assert_eq!(cfg.tls, TlsSupported::Unsupported);
    }

    #[test]
    fn heuristics_execs_are_collected() {
        let body = format!(
            "{}\n[quorum.device.heuristics]\nmode = \"on\"\nexec_ping = \"ping -c1 gw\"\nexec_disk = \"test -w /\"\n",
            BASE
        );
        let file = write_config(&body);
        let cfg = AgentConfig::load(file.path()).unwrap();
        assert_eq!(cfg.heuristics.mode, HeuristicsMode::Enabled);
        let names: Vec<_> = cfg.heuristics.execs.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["disk", "ping"]);
    }

    #[test]
    fn enabled_heuristics_require_execs() {
        let body = format!("{}\n[quorum.device.heuristics]\nmode = \"on\"\n", BASE);
        let file = write_config(&body);
        assert!(AgentConfig::load(file.path()).is_err());
    }

    #[test]
    fn advanced_settings_parse_and_validate() {
        let mut settings = ServerSettings::default();
        settings
            .apply_advanced_list("dpd_interval=5000,max_client_send_buffers=8,dpd_enabled=off")
            .unwrap();
        assert_eq!(settings.dpd_interval, 5_000);
        assert_eq!(settings.max_client_send_buffers, 8);
        assert!(!settings.dpd_enabled);

        assert!(settings.apply_advanced("max_client_send_buffers", "1").is_err());
        assert!(settings.apply_advanced("no_such_setting", "1").is_err());
    }
}
