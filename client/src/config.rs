use anyhow::{bail, Result};
use krypton_misc::code;
use krypton_misc::config::{expandenv, CommonConfig, PathSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    /// Server address, "host:port".
    #[serde(default = "ClientConfig::default_server")]
    pub server: String,

    /// Stable identifier for this device. Generated once when absent.
    #[serde(default)]
    pub device_id: String,

    /// Human-readable device name shown to siblings.
    #[serde(default = "ClientConfig::default_device_name")]
    pub device_name: String,

    #[serde(default = "ClientConfig::default_platform")]
    pub platform: String,

    #[serde(default = "ClientConfig::default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default = "ClientConfig::default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "ClientConfig::default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default)]
    pub tls: ClientTlsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: Self::default_server(),
            device_id: String::new(),
            device_name: Self::default_device_name(),
            platform: Self::default_platform(),
            heartbeat_secs: Self::default_heartbeat_secs(),
            max_reconnect_attempts: Self::default_max_reconnect_attempts(),
            reconnect_delay_ms: Self::default_reconnect_delay_ms(),
            tls: ClientTlsConfig::default(),
        }
    }
}

impl CommonConfig for ClientConfig {
    fn complete(&mut self, ps: &PathSet) -> Result<()> {
        if self.server.is_empty() {
            bail!("server is required");
        }
        if self.device_id.is_empty() {
            self.device_id = code::base64_encode(code::random_bytes(9));
        }
        if self.device_name.is_empty() {
            bail!("device_name is required");
        }
        if self.heartbeat_secs == 0 {
            bail!("heartbeat_secs must be greater than 0");
        }
        if self.reconnect_delay_ms == 0 {
            bail!("reconnect_delay_ms must be greater than 0");
        }
        self.tls.complete(ps)?;
        Ok(())
    }
}

impl ClientConfig {
    fn default_server() -> String {
        String::from("127.0.0.1:6789")
    }

    fn default_device_name() -> String {
        String::from("krypton-device")
    }

    fn default_platform() -> String {
        String::from(std::env::consts::OS)
    }

    fn default_heartbeat_secs() -> u64 {
        30
    }

    fn default_max_reconnect_attempts() -> u32 {
        3
    }

    fn default_reconnect_delay_ms() -> u64 {
        5000
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ClientTlsConfig {
    /// Request a TLS upgrade after the server hello.
    #[serde(default)]
    pub enable: bool,

    /// Trust anchor for the server certificate (PEM). Required unless
    /// certificate validation is disabled.
    #[serde(default)]
    pub ca_path: String,

    /// Accept any server certificate. Development only; never enable
    /// this against untrusted networks.
    #[serde(default)]
    pub danger_accept_invalid_certs: bool,
}

impl CommonConfig for ClientTlsConfig {
    fn complete(&mut self, _ps: &PathSet) -> Result<()> {
        if !self.enable {
            return Ok(());
        }
        self.ca_path = expandenv("ca_path", &self.ca_path)?;
        if self.ca_path.is_empty() && !self.danger_accept_invalid_certs {
            bail!("tls requires ca_path unless certificate validation is disabled");
        }
        Ok(())
    }
}
