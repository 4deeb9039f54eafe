use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

pub const DEFAULT_UPLOAD_BUFFER_SIZE: usize = 256 * 1024;
pub const DEFAULT_DOWNLOAD_BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address the passive data listeners bind to.
    pub listen: String,
    /// Banner text sent on greeting and after REIN.
    pub motd: String,
    pub pasv_port_min: u16,
    pub pasv_port_max: u16,
    pub upload_buffer_size: Option<usize>,
    pub download_buffer_size: Option<usize>,
    /// Upper bound on waiting for the data connection, unbounded when absent.
    pub data_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: String::from("0.0.0.0"),
            motd: String::from("rouilleftpd ready."),
            pasv_port_min: 50000,
            pasv_port_max: 50100,
            upload_buffer_size: Some(DEFAULT_UPLOAD_BUFFER_SIZE),
            download_buffer_size: Some(DEFAULT_DOWNLOAD_BUFFER_SIZE),
            data_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<IpAddr> {
        self.listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.listen))
    }

    pub fn data_timeout(&self) -> Option<Duration> {
        self.data_timeout_secs.map(Duration::from_secs)
    }

    pub fn upload_buffer_size(&self) -> usize {
        self.upload_buffer_size.unwrap_or(DEFAULT_UPLOAD_BUFFER_SIZE)
    }

    pub fn download_buffer_size(&self) -> usize {
        self.download_buffer_size
            .unwrap_or(DEFAULT_DOWNLOAD_BUFFER_SIZE)
    }

    /// The 220 reply carrying the banner.
    pub fn motd_reply(&self) -> String {
        format!("220 {}\r\n", self.motd)
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        Self::from_toml(&config_str)
            .with_context(|| format!("Failed to parse configuration file: {}", path))
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(config_str)?;

        // Set defaults if not specified
        if config.server.upload_buffer_size.is_none() {
            config.server.upload_buffer_size = Some(DEFAULT_UPLOAD_BUFFER_SIZE);
        }
        if config.server.download_buffer_size.is_none() {
            config.server.download_buffer_size = Some(DEFAULT_DOWNLOAD_BUFFER_SIZE);
        }

        if config.server.pasv_port_min > config.server.pasv_port_max {
            anyhow::bail!(
                "pasv_port_min ({}) is greater than pasv_port_max ({})",
                config.server.pasv_port_min,
                config.server.pasv_port_max
            );
        }

        Ok(config)
    }
}
