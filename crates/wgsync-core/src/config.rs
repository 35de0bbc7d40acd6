use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use wgsync_types::{GlobalSetting, ServerInterface};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wgsync/wgsync.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for environment variable {var}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: PathBuf,
    /// `name:cidr[,cidr...][;name:cidr...]`
    pub subnet_ranges: String,
    pub template_path: Option<PathBuf>,
    pub server: ServerDefaults,
    pub settings: SettingsDefaults,
    pub client: ClientDefaults,
}

/// Server interface written on first boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerDefaults {
    pub addresses: Vec<String>,
    pub listen_port: u16,
    pub post_up: String,
    pub post_down: String,
}

/// Global settings written on first boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsDefaults {
    pub endpoint_address: String,
    pub dns_servers: Vec<String>,
    pub mtu: u32,
    pub persistent_keepalive: u32,
    pub firewall_mark: String,
    pub table: String,
    pub config_file_path: String,
}

/// Values a new client gets when the caller leaves them out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientDefaults {
    pub allowed_ips: Vec<String>,
    pub extra_allowed_ips: Vec<String>,
    pub use_server_dns: bool,
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./db"),
            subnet_ranges: String::new(),
            template_path: None,
            server: ServerDefaults::default(),
            settings: SettingsDefaults::default(),
            client: ClientDefaults::default(),
        }
    }
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            addresses: vec!["10.252.1.0/24".into()],
            listen_port: 51820,
            post_up: String::new(),
            post_down: String::new(),
        }
    }
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        Self {
            endpoint_address: String::new(),
            dns_servers: vec!["1.1.1.1".into()],
            mtu: 1450,
            persistent_keepalive: 15,
            firewall_mark: "0xca6c".into(),
            table: "auto".into(),
            config_file_path: "/etc/wireguard/wg0.conf".into(),
        }
    }
}

impl Default for ClientDefaults {
    fn default() -> Self {
        Self {
            allowed_ips: vec!["0.0.0.0/0".into()],
            extra_allowed_ips: vec![],
            use_server_dns: true,
            enabled: true,
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

impl Config {
    /// Read the TOML file at `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading config");

        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })?;
                info!(path = %path.display(), "loaded config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// [`Config::load`] followed by the process environment overrides.
    pub async fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path).await?;
        config.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Override fields from variables returned by `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |var: &'static str| lookup(var).map(|v| (var, v));

        if let Some((_, v)) = get("WGSYNC_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some((_, v)) = get("SUBNET_RANGES") {
            self.subnet_ranges = v;
        }
        if let Some((_, v)) = get("WG_CONF_TEMPLATE") {
            self.template_path = (!v.trim().is_empty()).then(|| PathBuf::from(v));
        }

        if let Some((_, v)) = get("WGSYNC_SERVER_INTERFACE_ADDRESSES") {
            self.server.addresses = split_list(&v);
        }
        if let Some((var, v)) = get("WGSYNC_SERVER_LISTEN_PORT") {
            self.server.listen_port = parse_num(var, &v)?;
        }
        if let Some((_, v)) = get("WGSYNC_SERVER_POST_UP_SCRIPT") {
            self.server.post_up = v;
        }
        if let Some((_, v)) = get("WGSYNC_SERVER_POST_DOWN_SCRIPT") {
            self.server.post_down = v;
        }

        if let Some((_, v)) = get("WGSYNC_ENDPOINT_ADDRESS") {
            self.settings.endpoint_address = v.trim().to_string();
        }
        if let Some((_, v)) = get("WGSYNC_DNS") {
            self.settings.dns_servers = split_list(&v);
        }
        if let Some((var, v)) = get("WGSYNC_MTU") {
            self.settings.mtu = parse_num(var, &v)?;
        }
        if let Some((var, v)) = get("WGSYNC_PERSISTENT_KEEPALIVE") {
            self.settings.persistent_keepalive = parse_num(var, &v)?;
        }
        if let Some((_, v)) = get("WGSYNC_FIREWALL_MARK") {
            self.settings.firewall_mark = v.trim().to_string();
        }
        if let Some((_, v)) = get("WGSYNC_TABLE") {
            self.settings.table = v.trim().to_string();
        }
        if let Some((_, v)) = get("WGSYNC_CONFIG_FILE_PATH") {
            self.settings.config_file_path = v.trim().to_string();
        }

        if let Some((_, v)) = get("WGSYNC_DEFAULT_CLIENT_ALLOWED_IPS") {
            self.client.allowed_ips = split_list(&v);
        }
        if let Some((_, v)) = get("WGSYNC_DEFAULT_CLIENT_EXTRA_ALLOWED_IPS") {
            self.client.extra_allowed_ips = split_list(&v);
        }
        if let Some((var, v)) = get("WGSYNC_DEFAULT_CLIENT_USE_SERVER_DNS") {
            self.client.use_server_dns = parse_bool(var, &v)?;
        }
        if let Some((var, v)) = get("WGSYNC_DEFAULT_CLIENT_ENABLE_AFTER_CREATION") {
            self.client.enabled = parse_bool(var, &v)?;
        }

        Ok(())
    }

    pub fn server_interface(&self) -> ServerInterface {
        ServerInterface {
            addresses: self.server.addresses.clone(),
            listen_port: self.server.listen_port,
            post_up: self.server.post_up.clone(),
            post_down: self.server.post_down.clone(),
            updated_at: Utc::now(),
        }
    }

    pub fn global_settings(&self) -> GlobalSetting {
        let s = &self.settings;
        GlobalSetting {
            endpoint_address: s.endpoint_address.clone(),
            dns_servers: s.dns_servers.clone(),
            mtu: s.mtu,
            persistent_keepalive: s.persistent_keepalive,
            firewall_mark: s.firewall_mark.clone(),
            table: s.table.clone(),
            config_file_path: s.config_file_path.clone(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn parse_empty_file() {
        let parsed: Config = toml::from_str("").unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn parse_partial_file() {
        let parsed: Config = toml::from_str(
            r#"
            db_path = "/var/lib/wgsync"
            subnet_ranges = "lab:10.252.1.0/28"

            [server]
            listen_port = 51000

            [settings]
            mtu = 0
            "#,
        )
        .unwrap();
        assert_eq!(parsed.db_path, PathBuf::from("/var/lib/wgsync"));
        assert_eq!(parsed.server.listen_port, 51000);
        assert_eq!(parsed.server.addresses, vec!["10.252.1.0/24"]);
        assert_eq!(parsed.settings.mtu, 0);
        assert_eq!(parsed.settings.persistent_keepalive, 15);
        assert!(parsed.client.enabled);
    }

    #[test]
    fn env_overrides_fields() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("WGSYNC_SERVER_INTERFACE_ADDRESSES", "10.0.0.1/24, fd00::1/64"),
                ("WGSYNC_DNS", "9.9.9.9,,149.112.112.112"),
                ("WGSYNC_MTU", "1420"),
                ("WGSYNC_ENDPOINT_ADDRESS", " vpn.example.com:443 "),
                ("WGSYNC_DEFAULT_CLIENT_USE_SERVER_DNS", "false"),
                ("WG_CONF_TEMPLATE", "/etc/wgsync/wg.conf.hbs"),
            ]))
            .unwrap();

        assert_eq!(config.server.addresses, vec!["10.0.0.1/24", "fd00::1/64"]);
        assert_eq!(config.settings.dns_servers, vec!["9.9.9.9", "149.112.112.112"]);
        assert_eq!(config.settings.mtu, 1420);
        assert_eq!(config.settings.endpoint_address, "vpn.example.com:443");
        assert!(!config.client.use_server_dns);
        assert_eq!(
            config.template_path.as_deref(),
            Some(Path::new("/etc/wgsync/wg.conf.hbs"))
        );
    }

    #[test]
    fn no_overrides_keeps_defaults() {
        let mut config = Config::default();
        config.apply_overrides(|_| None).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test_case("WGSYNC_SERVER_LISTEN_PORT", "70000" ; "port out of range")]
    #[test_case("WGSYNC_MTU", "big" ; "mtu not a number")]
    #[test_case("WGSYNC_DEFAULT_CLIENT_ENABLE_AFTER_CREATION", "maybe" ; "bad bool")]
    fn invalid_env_rejected(var: &str, value: &str) {
        let mut config = Config::default();
        let err = config.apply_overrides(lookup(&[(var, value)])).unwrap_err();
        match err {
            ConfigError::InvalidEnv { var: got, .. } => assert_eq!(got, var),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml")).await.unwrap();
        assert_eq!(config, Config::default());
    }

    #[tokio::test]
    async fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wgsync.toml");
        tokio::fs::write(&path, "server = 3").await.unwrap();
        let err = Config::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
