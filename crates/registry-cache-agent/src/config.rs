//! Agent command line and resolved configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use registry_cache_common::names::host;

use crate::agent::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Parser)]
#[command(name = "registry-cache-agent")]
#[command(
    about = "Keeps the registry mirror configuration of a node's container runtime in sync",
    long_about = None
)]
pub struct AgentCli {
    /// Rendered mirror fragment to apply
    #[arg(long, env = "AGENT_INPUT_FILE")]
    pub input: PathBuf,

    /// Mount point of the host root filesystem
    #[arg(long, env = "AGENT_HOST_ROOT", default_value = host::HOST_ROOT)]
    pub host_root: PathBuf,

    /// Directory containerd imports fragments from, as seen on the host
    #[arg(long, env = "AGENT_IMPORTS_DIR", default_value = host::IMPORTS_DIR)]
    pub imports_dir: String,

    /// containerd base configuration, as seen on the host
    #[arg(long, env = "AGENT_RUNTIME_CONFIG", default_value = host::RUNTIME_CONFIG)]
    pub runtime_config: String,

    /// systemd unit restarted after a change
    #[arg(long, env = "AGENT_RUNTIME_SERVICE", default_value = host::RUNTIME_SERVICE)]
    pub runtime_service: String,

    /// Seconds between two cycles
    #[arg(long, env = "AGENT_INTERVAL_SECS", default_value_t = 60)]
    pub interval_secs: u64,

    /// Bound for one runtime restart
    #[arg(long, env = "AGENT_RESTART_TIMEOUT_SECS", default_value_t = 60)]
    pub restart_timeout_secs: u64,

    #[arg(long, env = "AGENT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Validated agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub input: PathBuf,
    pub host_root: PathBuf,
    pub imports_dir: String,
    pub runtime_config: String,
    pub runtime_service: String,
    pub interval: Duration,
    pub restart_timeout: Duration,
    fragment_name: String,
}

impl AgentConfig {
    pub fn from_cli(cli: &AgentCli) -> Result<Self, AgentError> {
        if cli.interval_secs == 0 {
            return Err(AgentError::ZeroInterval);
        }
        let fragment_name = cli
            .input
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AgentError::InputName(cli.input.clone()))?
            .to_string();

        Ok(Self {
            input: cli.input.clone(),
            host_root: cli.host_root.clone(),
            imports_dir: cli.imports_dir.trim_end_matches('/').to_string(),
            runtime_config: cli.runtime_config.clone(),
            runtime_service: cli.runtime_service.clone(),
            interval: Duration::from_secs(cli.interval_secs),
            restart_timeout: Duration::from_secs(cli.restart_timeout_secs),
            fragment_name,
        })
    }

    /// Path inside the agent container of a host path
    pub fn host_path(&self, path: &str) -> PathBuf {
        self.host_root.join(path.trim_start_matches('/'))
    }

    pub fn imports_dir_on_host(&self) -> PathBuf {
        self.host_path(&self.imports_dir)
    }

    /// Applied fragment, named like the input file
    pub fn fragment_path(&self) -> PathBuf {
        self.imports_dir_on_host().join(&self.fragment_name)
    }

    pub fn runtime_config_on_host(&self) -> PathBuf {
        self.host_path(&self.runtime_config)
    }

    /// Import entry containerd needs to pick up the fragment
    pub fn imports_glob(&self) -> String {
        format!("{}/*.toml", self.imports_dir)
    }

    pub fn input(&self) -> &Path {
        &self.input
    }
}
