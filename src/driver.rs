use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{ClusterStrategy, Config};
use crate::error::RemoteError;
use crate::process::{self, Captured};
use crate::remote::{shell_quote, RemoteShell};
use crate::response::Mode;
use crate::staging::StagedArtifact;

/// Why a run did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunFailure {
    /// The local process could not be started.
    Spawn(String),
    /// The process (local or remote) ran and exited unsuccessfully.
    Exit { code: Option<i32> },
    /// The remote session could not be established.
    Transport(String),
    TimedOut { secs: u64 },
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFailure::Spawn(msg) => write!(f, "failed to start process: {msg}"),
            RunFailure::Exit { code: Some(code) } => write!(f, "exit status {code}"),
            RunFailure::Exit { code: None } => write!(f, "terminated by signal"),
            RunFailure::Transport(msg) => write!(f, "remote transport failure: {msg}"),
            RunFailure::TimedOut { secs } => write!(f, "timed out after {secs}s"),
        }
    }
}

/// Captured output of one job plus its failure, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub output: String,
    pub failure: Option<RunFailure>,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    fn from_captured(cap: Captured, timeout: Option<Duration>) -> Self {
        let failure = if cap.timed_out {
            Some(RunFailure::TimedOut {
                secs: timeout.map(|t| t.as_secs()).unwrap_or_default(),
            })
        } else if cap.code != Some(0) {
            Some(RunFailure::Exit { code: cap.code })
        } else {
            None
        };
        Self {
            output: cap.output,
            failure,
        }
    }
}

/// Launches staged artifacts: one local process, the local MPI launcher,
/// or the remote launcher on the master node.
pub struct ExecutionDriver {
    python: String,
    ranks: usize,
    timeout: Option<Duration>,
    strategy: ClusterStrategy,
    launcher_path: Option<PathBuf>,
    launcher_name: String,
    nodes: Vec<String>,
    master: Option<String>,
    remote_python: String,
    remote_launcher: String,
    shell: Arc<dyn RemoteShell>,
}

impl ExecutionDriver {
    pub fn new(cfg: &Config, shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            python: cfg.python.clone(),
            ranks: cfg.ranks,
            timeout: cfg.exec_timeout_secs.map(Duration::from_secs),
            strategy: cfg.cluster.strategy,
            launcher_path: cfg.cluster.launcher_path.clone(),
            launcher_name: cfg.cluster.launcher_name.clone(),
            nodes: cfg.cluster.nodes.clone(),
            master: cfg.cluster.master_node().map(str::to_string),
            remote_python: cfg.cluster.remote_python.clone(),
            remote_launcher: cfg.cluster.remote_launcher.clone(),
            shell,
        }
    }

    pub fn strategy(&self) -> ClusterStrategy {
        self.strategy
    }

    pub fn master(&self) -> Option<&str> {
        self.master.as_deref()
    }

    /// Launcher binary: the configured full path when it exists, else the
    /// bare name resolved through `PATH`.
    pub fn launcher(&self) -> PathBuf {
        match &self.launcher_path {
            Some(path) if path.is_file() => path.clone(),
            _ => PathBuf::from(&self.launcher_name),
        }
    }

    /// Run `artifact` for `mode` and wait for it. Never errors: every
    /// failure is folded into the outcome.
    pub fn run(&self, mode: Mode, artifact: &StagedArtifact) -> RunOutcome {
        let outcome = match (mode, self.strategy) {
            (Mode::Single, _) => self.run_single(&artifact.local_path),
            (_, ClusterStrategy::Local) => self.run_local_ranks(&artifact.local_path),
            (_, ClusterStrategy::Remote) => self.run_remote(artifact),
        };

        match &outcome.failure {
            None => info!(%mode, digest = %artifact.digest, "job finished"),
            Some(failure) => warn!(%mode, digest = %artifact.digest, %failure, "job failed"),
        }
        outcome
    }

    pub fn single_command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.arg(path);
        cmd
    }

    pub fn local_ranks_command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(self.launcher());
        cmd.arg("-n")
            .arg(self.ranks.to_string())
            .arg(&self.python)
            .arg(path);
        cmd
    }

    /// Command line executed on the master node.
    pub fn remote_command(&self, remote_path: &str) -> String {
        let hosts = self
            .nodes
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let hosts = if hosts.is_empty() {
            self.master.clone().unwrap_or_default()
        } else {
            hosts
        };
        format!(
            "{} -np {} --host {} --oversubscribe {} {}",
            shell_quote(&self.remote_launcher),
            self.ranks,
            shell_quote(&hosts),
            shell_quote(&self.remote_python),
            shell_quote(remote_path),
        )
    }

    fn run_single(&self, path: &Path) -> RunOutcome {
        self.run_local(self.single_command(path))
    }

    fn run_local_ranks(&self, path: &Path) -> RunOutcome {
        self.run_local(self.local_ranks_command(path))
    }

    fn run_local(&self, mut cmd: Command) -> RunOutcome {
        let program = cmd.get_program().to_string_lossy().into_owned();
        info!(program = %program, "launching local process");
        match process::run_captured(&mut cmd, None, self.timeout) {
            Ok(cap) => RunOutcome::from_captured(cap, self.timeout),
            Err(err) => RunOutcome {
                output: String::new(),
                failure: Some(RunFailure::Spawn(format!("{program}: {err}"))),
            },
        }
    }

    fn run_remote(&self, artifact: &StagedArtifact) -> RunOutcome {
        let Some(master) = self.master.as_deref() else {
            return RunOutcome {
                output: String::new(),
                failure: Some(RunFailure::Transport(
                    "no master node configured".to_string(),
                )),
            };
        };
        let Some(remote_path) = artifact.remote_path.as_deref() else {
            return RunOutcome {
                output: String::new(),
                failure: Some(RunFailure::Transport(
                    "artifact was not staged on the cluster".to_string(),
                )),
            };
        };

        // Materialize on the master first; it runs the launcher even when it
        // is not part of the node set.
        if let Err(err) = self
            .shell
            .write_file(master, remote_path, artifact.code.as_bytes())
        {
            return Self::remote_failure(master, err);
        }

        let command = self.remote_command(remote_path);
        info!(master, command = %command, "launching remote job");
        match self.shell.exec(master, &command, None) {
            Ok(cap) => RunOutcome::from_captured(cap, None),
            Err(err) => Self::remote_failure(master, err),
        }
    }

    fn remote_failure(master: &str, err: RemoteError) -> RunOutcome {
        match err {
            RemoteError::Transport { message, .. } => RunOutcome {
                output: String::new(),
                failure: Some(RunFailure::Transport(format!("{master}: {message}"))),
            },
            RemoteError::Command { code, output, .. } => RunOutcome {
                output,
                failure: Some(RunFailure::Exit { code }),
            },
        }
    }
}
