//! Server configuration
//!
//! Settings are read from a TOML file. Every key is optional; anything left
//! out keeps the value from [`ServerConfig::default`]. The binary applies its
//! command line overrides on top of the loaded file.

use crate::error::{Result, ServerError};
use log::info;
use serde::Deserialize;
use shared::rsa::{DEFAULT_MODULUS, DEFAULT_PRIVATE_EXPONENT};
use shared::RsaKey;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address every service port binds to
    pub ip: IpAddr,
    pub login_port: u16,
    pub game_port: u16,
    pub admin_port: u16,

    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,

    /// Frames per second a connection may send before it is closed; 0 disables the limit
    pub max_packets_per_second: u32,
    /// Deferred sends tolerated while a write is outstanding
    pub max_pending_writes: u32,
    pub force_close_slow_connection: bool,

    pub accept_window_ms: u64,
    pub accept_max_per_window: u32,
    pub accept_block_ms: u64,

    /// Failed logins tolerated per address and protocol; 0 disables tracking
    pub login_tries: u32,
    pub retry_timeout_ms: u64,
    pub login_timeout_ms: u64,

    pub rsa_modulus: String,
    pub rsa_private_exponent: String,

    pub client_version_min: u16,
    pub client_version_max: u16,

    pub admin_enabled: bool,
    pub admin_require_login: bool,
    pub admin_require_encryption: bool,
    pub admin_password: String,
    pub admin_allow_local_only: bool,
    pub handshake_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::from([127, 0, 0, 1]),
            login_port: 7171,
            game_port: 7172,
            admin_port: 7171,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            max_packets_per_second: 25,
            max_pending_writes: 100,
            force_close_slow_connection: true,
            accept_window_ms: 1000,
            accept_max_per_window: 10,
            accept_block_ms: 10_000,
            login_tries: 10,
            retry_timeout_ms: 5000,
            login_timeout_ms: 60_000,
            rsa_modulus: DEFAULT_MODULUS.to_string(),
            rsa_private_exponent: DEFAULT_PRIVATE_EXPONENT.to_string(),
            client_version_min: 860,
            client_version_max: 860,
            admin_enabled: false,
            admin_require_login: true,
            admin_require_encryption: false,
            admin_password: String::new(),
            admin_allow_local_only: true,
            handshake_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Reads and validates a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml(&text).map_err(|e| match e {
            ServerError::ConfigParse { source, .. } => ServerError::ConfigParse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: ServerConfig =
            toml::from_str(text).map_err(|source| ServerError::ConfigParse {
                path: "<inline>".to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks relations between fields that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.client_version_min > self.client_version_max {
            return Err(ServerError::InvalidConfig(format!(
                "client_version_min {} is above client_version_max {}",
                self.client_version_min, self.client_version_max
            )));
        }
        if self.read_timeout_secs == 0 || self.write_timeout_secs == 0 {
            return Err(ServerError::InvalidConfig(
                "socket timeouts must be at least one second".to_string(),
            ));
        }
        if self.accept_window_ms == 0 {
            return Err(ServerError::InvalidConfig(
                "accept_window_ms must be positive".to_string(),
            ));
        }
        if self.admin_enabled && self.admin_require_login && self.admin_password.is_empty() {
            return Err(ServerError::InvalidConfig(
                "admin login is required but admin_password is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn accepts_version(&self, version: u16) -> bool {
        (self.client_version_min..=self.client_version_max).contains(&version)
    }

    pub fn rsa_key(&self) -> Result<RsaKey> {
        Ok(RsaKey::from_decimal(
            &self.rsa_modulus,
            &self.rsa_private_exponent,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.login_port, 7171);
        assert_eq!(config.game_port, 7172);
        assert_eq!(config.max_pending_writes, 100);
        assert!(config.accepts_version(860));
        assert!(!config.accepts_version(854));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            game_port = 9000
            max_packets_per_second = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.game_port, 9000);
        assert_eq!(config.max_packets_per_second, 0);
        assert_eq!(config.login_port, 7171);
        assert_eq!(config.read_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ip = \"0.0.0.0\"\nlogin_tries = 3").unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.ip, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(config.login_tries, 3);
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "game_port = \"not a number\"").unwrap();

        match ServerConfig::load(file.path()) {
            Err(ServerError::ConfigParse { path, .. }) => {
                assert_eq!(path, file.path().display().to_string())
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_inverted_version_window() {
        let result = ServerConfig::from_toml("client_version_min = 870\nclient_version_max = 860");
        assert!(matches!(result, Err(ServerError::InvalidConfig(_))));
    }

    #[test]
    fn test_rsa_key_from_defaults() {
        let key = ServerConfig::default().rsa_key().unwrap();
        assert!(key.has_private_key());
    }
}
