use thiserror::Error;

use crate::store::Variant;

/// Failures of the transformation gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no transformation backends configured")]
    NoBackends,

    #[error("all {attempts} transformation backend(s) failed; last error from '{backend}': {last}")]
    Exhausted {
        attempts: usize,
        backend: String,
        last: String,
    },

    #[error("partition error: {0}")]
    Partition(String),
}

/// Failures while writing an artifact to its execution location.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("failed to create staging directory '{path}': {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write artifact '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of the secure remote shell.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The session could not be established (refused, auth, timeout).
    #[error("remote transport to '{host}' failed: {message}")]
    Transport { host: String, message: String },

    /// The session was established but the command itself failed.
    #[error("remote command on '{host}' exited with status {code:?}: {output}")]
    Command {
        host: String,
        code: Option<i32>,
        output: String,
    },
}

/// Request-level failures. Every variant fails the HTTP call; execution
/// failures are not represented here.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("no {variant} artifact stored for session '{session}'; run optimize first or supply code")]
    NoArtifact { session: String, variant: Variant },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Staging(#[from] StagingError),
}

impl OrchestratorError {
    pub fn http_status(&self) -> u16 {
        match self {
            OrchestratorError::BadRequest(_) => 400,
            OrchestratorError::NoArtifact { .. } => 404,
            OrchestratorError::Gateway(_) => 502,
            OrchestratorError::Staging(_) => 500,
        }
    }
}
