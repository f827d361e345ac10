use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::config::Config;
use crate::error::StagingError;
use crate::fanout;
use crate::policy;
use crate::remote::RemoteShell;
use crate::store::Variant;

/// Where a job will execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Local(Variant),
    Cluster,
}

/// An artifact written to its execution location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub variant: Variant,
    pub local_path: PathBuf,
    /// Path on every cluster node, when pushed.
    pub remote_path: Option<String>,
    /// sha256 of `code`.
    pub digest: String,
    pub code: String,
}

/// Result of pushing an artifact to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutcome {
    pub node: String,
    pub result: Result<(), String>,
}

impl NodeOutcome {
    pub fn ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Completion signal of a background cluster push.
#[derive(Debug)]
pub struct StagingHandle {
    handle: JoinHandle<Vec<NodeOutcome>>,
}

impl StagingHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the push is done and return per-node outcomes.
    pub fn wait(self) -> Vec<NodeOutcome> {
        self.handle.join().unwrap_or_else(|_| {
            warn!("background cluster push panicked");
            Vec::new()
        })
    }
}

/// Per-session lock guarding a session's artifact files.
pub type SessionLock = Arc<Mutex<()>>;

/// Acquire `lock`, recovering from poisoning.
pub fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    match lock.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct Stager {
    stage_dir: PathBuf,
    default_session: String,
    nodes: Vec<String>,
    remote_dir: String,
    push_parallelism: usize,
    shell: Arc<dyn RemoteShell>,
    locks: Arc<Mutex<HashMap<String, SessionLock>>>,
}

impl Stager {
    pub fn new(cfg: &Config, shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            stage_dir: cfg.stage_dir.clone(),
            default_session: cfg.default_session.clone(),
            nodes: cfg.cluster.nodes.clone(),
            remote_dir: cfg.cluster.remote_dir.clone(),
            push_parallelism: cfg.cluster.push_parallelism,
            shell,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Lock shared by every session whose artifacts land on the same files.
    ///
    /// Hold it from staging until the staged artifact has finished running;
    /// the files are overwritten in place.
    pub fn session_lock(&self, session: &str) -> SessionLock {
        let key = self.file_name(session, Variant::Cluster);
        let mut locks = match self.locks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(key).or_default())
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Deterministic artifact file name for a session and variant.
    pub fn file_name(&self, session: &str, variant: Variant) -> String {
        let base = format!("job_{variant}.py");
        if session == self.default_session {
            base
        } else {
            format!("{}_{base}", safe_component(session))
        }
    }

    pub fn local_path(&self, session: &str, variant: Variant) -> PathBuf {
        self.stage_dir.join(self.file_name(session, variant))
    }

    pub fn remote_path(&self, session: &str) -> String {
        format!(
            "{}/{}",
            self.remote_dir.trim_end_matches('/'),
            self.file_name(session, Variant::Cluster)
        )
    }

    /// Stage according to `topology`. Local writes are fatal on failure;
    /// the cluster push is best effort and only logged.
    pub fn stage(
        &self,
        topology: Topology,
        session: &str,
        code: &str,
    ) -> Result<StagedArtifact, StagingError> {
        match topology {
            Topology::Local(variant) => self.stage_local(session, variant, code),
            Topology::Cluster => {
                let mut artifact = self.stage_local(session, Variant::Cluster, code)?;
                self.push_cluster(session, code);
                artifact.remote_path = Some(self.remote_path(session));
                Ok(artifact)
            }
        }
    }

    /// Overwrite the local artifact for `session`/`variant`.
    pub fn stage_local(
        &self,
        session: &str,
        variant: Variant,
        code: &str,
    ) -> Result<StagedArtifact, StagingError> {
        fs::create_dir_all(&self.stage_dir).map_err(|source| StagingError::CreateDir {
            path: self.stage_dir.display().to_string(),
            source,
        })?;

        let path = self.local_path(session, variant);
        write_file(&path, code)?;

        let digest = policy::digest_code(code);
        info!(session, %variant, path = %path.display(), %digest, "staged artifact locally");

        Ok(StagedArtifact {
            variant,
            local_path: path,
            remote_path: None,
            digest,
            code: code.to_string(),
        })
    }

    /// Push the cluster artifact to every node. Never fails as a whole.
    pub fn push_cluster(&self, session: &str, code: &str) -> Vec<NodeOutcome> {
        if self.nodes.is_empty() {
            return Vec::new();
        }

        let remote_path = self.remote_path(session);
        let bytes: Arc<[u8]> = Arc::from(code.as_bytes());
        let shell = Arc::clone(&self.shell);
        let path = remote_path.clone();

        let outcomes = fanout::fan_out(self.push_parallelism, self.nodes.clone(), move |node| {
            let result = shell
                .write_file(&node, &path, &bytes)
                .map_err(|err| err.to_string());
            NodeOutcome { node, result }
        })
        .unwrap_or_else(|err| {
            warn!(error = %err, "cluster push aborted");
            self.nodes
                .iter()
                .map(|node| NodeOutcome {
                    node: node.clone(),
                    result: Err(format!("push aborted: {err}")),
                })
                .collect()
        });

        for outcome in &outcomes {
            match &outcome.result {
                Ok(()) => info!(node = %outcome.node, path = %remote_path, "pushed artifact"),
                Err(err) => warn!(node = %outcome.node, path = %remote_path, error = %err, "artifact push failed"),
            }
        }
        outcomes
    }

    /// Run `push_cluster` on a background thread under the session lock.
    pub fn spawn_cluster_push(&self, session: &str, code: &str) -> StagingHandle {
        let stager = self.clone();
        let lock = self.session_lock(session);
        let session = session.to_string();
        let code = code.to_string();
        StagingHandle {
            handle: thread::spawn(move || {
                let _guard = hold(&lock);
                stager.push_cluster(&session, &code)
            }),
        }
    }
}

fn write_file(path: &Path, code: &str) -> Result<(), StagingError> {
    fs::write(path, code.as_bytes()).map_err(|source| StagingError::Write {
        path: path.display().to_string(),
        source,
    })
}

/// Reduce a session id to characters safe in a file name.
fn safe_component(session: &str) -> String {
    let cleaned: String = session
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
