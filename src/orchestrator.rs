use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

use crate::config::{ClusterStrategy, Config};
use crate::driver::ExecutionDriver;
use crate::error::OrchestratorError;
use crate::gateway::Transformer;
use crate::policy::Policy;
use crate::remote::RemoteShell;
use crate::response::{ExecutionResult, Mode, OptimizeResponse, Status};
use crate::staging::{self, StagedArtifact, Stager, StagingHandle, Topology};
use crate::store::{ArtifactStore, Variant};

/// One submission as received from the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default, rename = "onlyOptimize")]
    pub only_optimize: bool,
    #[serde(default)]
    pub session: Option<String>,
}

/// What a `/deploy` call produced.
#[derive(Debug)]
pub enum DeployOutcome {
    Optimized(Optimized),
    Executed(ExecutionResult),
}

/// Result of the optimize phase. `staging` completes once the cluster
/// variant has been pushed to every node; callers may drop it.
#[derive(Debug)]
pub struct Optimized {
    pub response: OptimizeResponse,
    pub staging: StagingHandle,
}

pub struct Orchestrator {
    store: ArtifactStore,
    gateway: Arc<dyn Transformer>,
    stager: Stager,
    driver: ExecutionDriver,
    default_session: String,
    ranks: usize,
}

impl Orchestrator {
    pub fn new(
        cfg: &Config,
        store: ArtifactStore,
        gateway: Arc<dyn Transformer>,
        shell: Arc<dyn RemoteShell>,
    ) -> Self {
        Self {
            store,
            gateway,
            stager: Stager::new(cfg, Arc::clone(&shell)),
            driver: ExecutionDriver::new(cfg, shell),
            default_session: cfg.default_session.clone(),
            ranks: cfg.ranks,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn default_session(&self) -> &str {
        &self.default_session
    }

    /// Requested session id, or the default one when absent or blank.
    pub fn session_id<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        match requested.map(str::trim) {
            Some(s) if !s.is_empty() => s,
            _ => &self.default_session,
        }
    }

    /// Entry point for `/deploy`.
    pub fn deploy(&self, req: &JobRequest) -> Result<DeployOutcome, OrchestratorError> {
        let session = self.session_id(req.session.as_deref());
        if req.only_optimize {
            return self.optimize(session, &req.code).map(DeployOutcome::Optimized);
        }
        let mode = req.mode.ok_or_else(|| {
            OrchestratorError::BadRequest(
                "mode is required unless onlyOptimize is set".to_string(),
            )
        })?;
        let code = (!req.code.trim().is_empty()).then_some(req.code.as_str());
        self.run(session, mode, code).map(DeployOutcome::Executed)
    }

    /// Optimize phase: one dual-variant transformation, both variants stored,
    /// the single variant staged inline and the cluster push started in the
    /// background.
    pub fn optimize(&self, session: &str, source: &str) -> Result<Optimized, OrchestratorError> {
        let span = info_span!("optimize", session);
        let _guard = span.enter();

        if source.trim().is_empty() {
            return Err(OrchestratorError::BadRequest(
                "code must not be empty".to_string(),
            ));
        }

        let pair = self.gateway.transform_dual(source, self.ranks)?;

        let lock = self.stager.session_lock(session);
        let staging = {
            let _session = staging::hold(&lock);
            self.stager.stage_local(session, Variant::Single, &pair.single)?;
            self.stager.stage_local(session, Variant::Cluster, &pair.cluster)?;
            self.store.put_pair(session, pair.single.clone(), pair.cluster.clone());
            // Starts once the guard is released.
            self.stager.spawn_cluster_push(session, &pair.cluster)
        };
        info!(nodes = self.stager.nodes().len(), "optimize stored both variants");

        Ok(Optimized {
            response: OptimizeResponse {
                status: Status::Success,
                optimized_code: pair.cluster,
                single_code: pair.single,
            },
            staging,
        })
    }

    /// Run phase. `single` and `cluster_run_only` execute `code` verbatim,
    /// or the stored variant when no code is given; `cluster` always
    /// transforms `code` first.
    ///
    /// Jobs on one session are serialized from staging through execution,
    /// so the reported code is always the code that ran.
    pub fn run(
        &self,
        session: &str,
        mode: Mode,
        code: Option<&str>,
    ) -> Result<ExecutionResult, OrchestratorError> {
        let span = info_span!("job", session, %mode);
        let _guard = span.enter();

        let transformed = if mode.transforms() {
            let source = code.ok_or_else(|| {
                OrchestratorError::BadRequest(format!("mode '{mode}' requires code"))
            })?;
            Some(
                self.gateway
                    .transform(source, &Policy::Cluster { ranks: self.ranks })?,
            )
        } else {
            None
        };

        let lock = self.stager.session_lock(session);
        let _session = staging::hold(&lock);

        let final_code = match transformed {
            Some(c) => c,
            None => match code {
                Some(c) => c.to_string(),
                None => self.stored(session, mode.variant())?,
            },
        };

        let artifact = self.stage_for_run(session, mode, &final_code)?;
        self.store.put(session, mode.variant(), final_code);

        let outcome = self.driver.run(mode, &artifact);
        Ok(ExecutionResult::from_run(mode, artifact.code, outcome))
    }

    fn stored(&self, session: &str, variant: Variant) -> Result<String, OrchestratorError> {
        self.store
            .get_variant(session, variant)
            .ok_or_else(|| OrchestratorError::NoArtifact {
                session: session.to_string(),
                variant,
            })
    }

    /// Stage synchronously right before execution so a background push from
    /// the optimize phase never has to be complete.
    fn stage_for_run(
        &self,
        session: &str,
        mode: Mode,
        code: &str,
    ) -> Result<StagedArtifact, OrchestratorError> {
        let topology = if mode == Mode::Single || self.driver.strategy() == ClusterStrategy::Local
        {
            Topology::Local(mode.variant())
        } else {
            Topology::Cluster
        };
        Ok(self.stager.stage(topology, session, code)?)
    }
}
