//! `fastproc` job orchestrator library.
//!
//! Accepts a code submission, optionally rewrites it into a multi-rank
//! variant through the transformation gateway (`gateway`), stages the
//! artifact (`staging`) and runs it locally or across the node set
//! (`driver`, `remote`). Results are normalized by `response`; the
//! `orchestrator` ties the pieces together and `server` exposes them over
//! HTTP.
//!
//! Invariants:
//! - the code reported back is byte-identical to the code that was staged
//! - `single` never calls the gateway, `cluster` always does once
//! - `cluster_run_only` executes an artifact verbatim
//! - execution failures are reported in the payload, not as request failures

pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod orchestrator;
pub mod policy;
pub mod process;
pub mod remote;
pub mod response;
pub mod sanitize;
pub mod server;
pub mod staging;
pub mod store;
