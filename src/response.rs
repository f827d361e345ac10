use std::fmt;

use serde::{Deserialize, Serialize};

use crate::driver::RunOutcome;
use crate::error::OrchestratorError;
use crate::store::Variant;

/// Requested execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Single,
    Cluster,
    ClusterRunOnly,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Single => "single",
            Mode::Cluster => "cluster",
            Mode::ClusterRunOnly => "cluster_run_only",
        }
    }

    /// Session variant this mode reads and writes.
    pub fn variant(&self) -> Variant {
        match self {
            Mode::Single => Variant::Single,
            Mode::Cluster | Mode::ClusterRunOnly => Variant::Cluster,
        }
    }

    /// Whether this mode calls the transformation gateway.
    pub fn transforms(&self) -> bool {
        matches!(self, Mode::Cluster)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

/// Outward result of an executed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: Status,
    pub mode: Mode,
    /// Exactly the code that was staged and executed.
    pub optimized_code: String,
    pub output: String,
}

impl ExecutionResult {
    pub fn from_run(mode: Mode, final_code: String, outcome: RunOutcome) -> Self {
        let (status, output) = match &outcome.failure {
            None => (Status::Success, outcome.output),
            Some(failure) => (
                Status::Failure,
                format!("Error: {failure}\nOutput: {}", outcome.output),
            ),
        };
        Self {
            status,
            mode,
            optimized_code: final_code,
            output,
        }
    }
}

/// Acknowledgment of the optimize phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeResponse {
    pub status: Status,
    /// Cluster variant.
    pub optimized_code: String,
    pub single_code: String,
}

/// Body of the split-phase run endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponse {
    pub status: Status,
    pub output: String,
}

impl From<ExecutionResult> for RunResponse {
    fn from(r: ExecutionResult) -> Self {
        Self {
            status: r.status,
            output: r.output,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl From<&OrchestratorError> for ErrorBody {
    fn from(err: &OrchestratorError) -> Self {
        // Carry the full cause chain so callers can diagnose without logs.
        let mut error = err.to_string();
        let mut cur = std::error::Error::source(err);
        while let Some(cause) = cur {
            let text = cause.to_string();
            if !error.contains(&text) {
                error.push_str(": ");
                error.push_str(&text);
            }
            cur = cause.source();
        }
        Self { error }
    }
}
