//! Capture settings.
//!
//! Each value comes from the command line if given, else from the stored
//! config table, else from the built-in default.

use xiqueer_storage::{Database, Result};

/// Host serving the timetable endpoint.
pub const DEFAULT_TARGET_HOST: &str = "jw.xxgc.edu.cn";

/// Path fragment identifying the weekly timetable request.
pub const DEFAULT_TARGET_PATH: &str = "/jwweb//wap/mycourseschedule.aspx";

/// The app's own API host, which misbehaves over IPv6.
pub const XIQUEER_API_HOST: &str = "api.xiqueer.com";

/// Config key for the target host.
pub const KEY_TARGET_HOST: &str = "capture.target_host";
/// Config key for the target path fragment.
pub const KEY_TARGET_PATH: &str = "capture.target_path";
/// Config key for the IPv4-only host list.
pub const KEY_FORCE_IPV4_HOSTS: &str = "capture.force_ipv4_hosts";
/// Config key for the listening port.
pub const KEY_PORT: &str = "capture.port";

/// Every config key the capture host reads.
pub const KNOWN_KEYS: [&str; 4] = [KEY_TARGET_HOST, KEY_TARGET_PATH, KEY_FORCE_IPV4_HOSTS, KEY_PORT];

/// What to capture and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub target_host: String,
    pub target_path_part: String,
    pub force_ipv4_hosts: Vec<String>,
    /// 0 lets the OS pick a free port.
    pub bind_port: u16,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            target_host: DEFAULT_TARGET_HOST.to_string(),
            target_path_part: DEFAULT_TARGET_PATH.to_string(),
            force_ipv4_hosts: vec![DEFAULT_TARGET_HOST.to_string(), XIQUEER_API_HOST.to_string()],
            bind_port: 0,
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub target_host: Option<String>,
    pub target_path_part: Option<String>,
    pub force_ipv4_hosts: Vec<String>,
    pub bind_port: Option<u16>,
}

impl CaptureSettings {
    /// Stored settings over defaults.
    pub fn load(db: &Database) -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            target_host: db.get_config_or(KEY_TARGET_HOST, defaults.target_host)?,
            target_path_part: db.get_config_or(KEY_TARGET_PATH, defaults.target_path_part)?,
            force_ipv4_hosts: db.get_config_or(KEY_FORCE_IPV4_HOSTS, defaults.force_ipv4_hosts)?,
            bind_port: db.get_config_or(KEY_PORT, defaults.bind_port)?,
        })
    }

    /// Command-line values over whatever is already set.
    pub fn with_overrides(mut self, overrides: SettingsOverrides) -> Self {
        if let Some(host) = overrides.target_host {
            self.target_host = host;
        }
        if let Some(path) = overrides.target_path_part {
            self.target_path_part = path;
        }
        if !overrides.force_ipv4_hosts.is_empty() {
            self.force_ipv4_hosts = overrides.force_ipv4_hosts;
        }
        if let Some(port) = overrides.bind_port {
            self.bind_port = port;
        }
        self
    }
}

/// Interprets a command-line config value: JSON if it parses, else a string.
pub fn parse_config_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
