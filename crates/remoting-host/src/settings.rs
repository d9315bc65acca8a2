//! Command line and configuration file handling

use crate::objects::DEMO_OBJECTS;
use anyhow::{Context, Result};
use clap::Parser;
use remoting::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "remoting-host", about = "Publish demo objects over TCP and HTTP")]
pub struct Cli {
    /// Path to a JSON configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to bind both listeners to.
    #[arg(long)]
    pub host: Option<String>,

    /// Port of the binary TCP listener.
    #[arg(long)]
    pub tcp_port: Option<u16>,

    /// Port of the HTTP listener.
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Do not start the HTTP listener.
    #[arg(long)]
    pub no_http: bool,

    /// Release the leases a connection created when it closes.
    #[arg(long)]
    pub release_leases: bool,

    /// Demo objects to publish, all of them when omitted.
    #[arg(long = "object", value_name = "NAME")]
    pub objects: Vec<String>,
}

/// Contents of the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Listener and connection settings
    pub server: ServerConfig,
    /// Serve HTTP next to TCP
    pub http: bool,
    /// Demo objects to publish
    pub objects: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            http: true,
            objects: DEMO_OBJECTS.iter().map(|name| name.to_string()).collect(),
        }
    }
}

impl HostConfig {
    /// Read a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Configuration from the file named on the command line, with flags on top
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(host) = &cli.host {
            config.server = config.server.with_host(host.clone());
        }
        if let Some(port) = cli.tcp_port {
            config.server = config.server.with_tcp_port(port);
        }
        if let Some(port) = cli.http_port {
            config.server = config.server.with_http_port(port);
        }
        if cli.release_leases {
            config.server = config.server.with_release_leases_on_disconnect(true);
        }
        if cli.no_http {
            config.http = false;
        }
        if !cli.objects.is_empty() {
            config.objects = cli.objects.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_publish_everything() {
        let cli = Cli::try_parse_from(["remoting-host"]).unwrap();
        let config = HostConfig::from_cli(&cli).unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.objects.len(), DEMO_OBJECTS.len());
        assert!(config.http);
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "server": {{ "host": "0.0.0.0", "tcp_port": 7000, "http_port": 7001 }}, "objects": ["echo"] }}"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let cli = Cli::try_parse_from([
            "remoting-host",
            "--config",
            path,
            "--tcp-port",
            "7100",
            "--release-leases",
        ])
        .unwrap();
        let config = HostConfig::from_cli(&cli).unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.tcp_port, 7100);
        assert_eq!(config.server.http_port, 7001);
        assert!(config.server.release_leases_on_disconnect);
        assert_eq!(config.objects, vec!["echo".to_string()]);
    }

    #[test]
    fn test_object_flags_replace_list() {
        let cli = Cli::try_parse_from(["remoting-host", "--object", "notifier", "--object", "echo", "--no-http"])
            .unwrap();
        let config = HostConfig::from_cli(&cli).unwrap();
        assert_eq!(config.objects, vec!["notifier".to_string(), "echo".to_string()]);
        assert!(!config.http);
    }

    #[test]
    fn test_bad_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = HostConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid config file"));

        assert!(HostConfig::load(Path::new("/nonexistent/remoting.json")).is_err());
    }
}
