use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Runtime configuration. Every field has a default so an empty file (or
/// no file at all) is valid; environment variables override the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bind: String,
    pub default_session: String,
    /// Interpreter used for local runs and under the local launcher.
    pub python: String,
    pub stage_dir: PathBuf,
    pub ranks: usize,
    pub exec_timeout_secs: Option<u64>,
    pub cluster: ClusterConfig,
    pub ssh: SshConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStrategy {
    /// Simulate the ranks locally through the MPI launcher.
    Local,
    /// Launch on the node set from the master node over ssh.
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub strategy: ClusterStrategy,
    pub launcher_path: Option<PathBuf>,
    pub launcher_name: String,
    pub nodes: Vec<String>,
    pub master: Option<String>,
    pub remote_dir: String,
    pub remote_python: String,
    pub remote_launcher: String,
    pub push_parallelism: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub bin: PathBuf,
    pub user: Option<String>,
    pub key_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub separator: String,
    pub backends: Vec<BackendSpec>,
}

/// One transformation backend, tried in list order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum BackendSpec {
    Gemini {
        model: String,
        #[serde(default = "default_gemini_endpoint")]
        endpoint: String,
        #[serde(default = "default_gemini_key_env")]
        api_key_env: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Http {
        endpoint: String,
        #[serde(default)]
        bearer_env: Option<String>,
        #[serde(default)]
        headers: std::collections::BTreeMap<String, String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

fn default_gemini_endpoint() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_gemini_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            default_session: "default".to_string(),
            python: "python3".to_string(),
            stage_dir: env::temp_dir().join("fastproc"),
            ranks: 4,
            exec_timeout_secs: None,
            cluster: ClusterConfig::default(),
            ssh: SshConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            strategy: ClusterStrategy::Local,
            launcher_path: None,
            launcher_name: "mpiexec".to_string(),
            nodes: Vec::new(),
            master: None,
            remote_dir: "/tmp".to_string(),
            remote_python: "python3".to_string(),
            remote_launcher: "mpirun".to_string(),
            push_parallelism: 4,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("ssh"),
            user: None,
            key_path: None,
            port: None,
            connect_timeout_secs: 30,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let gemini = |model: &str| BackendSpec::Gemini {
            model: model.to_string(),
            endpoint: default_gemini_endpoint(),
            api_key_env: default_gemini_key_env(),
            timeout_secs: Some(120),
        };
        Self {
            separator: "###SPLIT###".to_string(),
            backends: vec![gemini("gemini-1.5-pro"), gemini("gemini-2.5-flash")],
        }
    }
}

impl ClusterConfig {
    /// Node that hosts the remote launcher: explicit master, else the first node.
    pub fn master_node(&self) -> Option<&str> {
        self.master
            .as_deref()
            .or_else(|| self.nodes.first().map(String::as_str))
    }
}

impl Config {
    /// Load from an optional YAML file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        Self::from_yaml(&text)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_str("FASTPROC_BIND") {
            self.bind = v;
        }
        if let Some(v) = env_str("FASTPROC_PYTHON") {
            self.python = v;
        }
        if let Some(v) = env_str("FASTPROC_STAGE_DIR") {
            self.stage_dir = PathBuf::from(v);
        }
        if let Some(v) = env_str("FASTPROC_RANKS") {
            self.ranks = parse_positive("FASTPROC_RANKS", &v)? as usize;
        }
        if let Some(v) = env_str("FASTPROC_EXEC_TIMEOUT_SECS") {
            self.exec_timeout_secs = Some(parse_positive("FASTPROC_EXEC_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = env_str("FASTPROC_CLUSTER_STRATEGY") {
            self.cluster.strategy = match v.trim().to_lowercase().as_str() {
                "local" => ClusterStrategy::Local,
                "remote" => ClusterStrategy::Remote,
                other => {
                    return Err(anyhow!(
                        "invalid FASTPROC_CLUSTER_STRATEGY: '{other}' (expected local or remote)"
                    ))
                }
            };
        }
        if let Some(v) = env_str("FASTPROC_LAUNCHER_PATH") {
            self.cluster.launcher_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_str("FASTPROC_LAUNCHER") {
            self.cluster.launcher_name = v;
        }
        if let Some(v) = env_str("FASTPROC_NODES") {
            self.cluster.nodes = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = env_str("FASTPROC_MASTER") {
            self.cluster.master = Some(v);
        }
        if let Some(v) = env_str("FASTPROC_SSH_BIN") {
            self.ssh.bin = PathBuf::from(v);
        }
        if let Some(v) = env_str("FASTPROC_SSH_USER") {
            self.ssh.user = Some(v);
        }
        if let Some(v) = env_str("FASTPROC_SSH_KEY") {
            self.ssh.key_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ranks == 0 {
            return Err(anyhow!("ranks must be >= 1"));
        }
        if self.cluster.push_parallelism == 0 {
            return Err(anyhow!("cluster.push_parallelism must be >= 1"));
        }
        if self.ssh.connect_timeout_secs == 0 {
            return Err(anyhow!("ssh.connect_timeout_secs must be >= 1"));
        }
        if self.default_session.trim().is_empty() {
            return Err(anyhow!("default_session must not be empty"));
        }
        if self.gateway.separator.trim().is_empty() {
            return Err(anyhow!("gateway.separator must not be empty"));
        }
        if self.cluster.strategy == ClusterStrategy::Remote && self.cluster.master_node().is_none()
        {
            return Err(anyhow!(
                "cluster.strategy 'remote' requires cluster.nodes or cluster.master"
            ));
        }
        Ok(())
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_positive(key: &str, raw: &str) -> Result<u64> {
    let parsed: u64 = raw
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid {key}: '{raw}' (must be a positive integer)"))?;
    if parsed == 0 {
        return Err(anyhow!("invalid {key}: '{raw}' (must be a positive integer)"));
    }
    Ok(parsed)
}
