use std::io::{Cursor, Read};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, error, info, warn};

use crate::error::OrchestratorError;
use crate::orchestrator::{DeployOutcome, JobRequest, Optimized, Orchestrator};
use crate::response::{ErrorBody, Mode, RunResponse};

const MAX_REQUEST_BYTES: usize = 5 * 1024 * 1024;

const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "POST, GET, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
];

/// Body of `POST /api/optimize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeRequest {
    pub input: String,
    #[serde(default)]
    pub session: Option<String>,
}

type HttpResponse = Response<Cursor<Vec<u8>>>;

/// Bind `bind_addr` and serve until the listener fails.
pub fn run_server(bind_addr: &str, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let server = Server::http(bind_addr)
        .map_err(|err| anyhow!("failed to bind server at {bind_addr}: {err}"))?;
    info!(bind = bind_addr, "listening");
    serve(server, orchestrator);
    Ok(())
}

/// Accept loop. Every request is handled on its own thread; there is no
/// queue and no admission control.
pub fn serve(server: Server, orchestrator: Arc<Orchestrator>) {
    for request in server.incoming_requests() {
        let orchestrator = Arc::clone(&orchestrator);
        thread::spawn(move || {
            let method = request.method().clone();
            let url = request.url().to_string();
            if let Err(err) = handle(&orchestrator, request) {
                error!(%method, %url, error = %err, "failed to send response");
            }
        });
    }
}

fn handle(orchestrator: &Orchestrator, mut request: Request) -> std::io::Result<()> {
    let method = request.method().clone();
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or_default().to_string();
    debug!(%method, path = %path, "request");

    if method == Method::Options {
        return request.respond(with_cors(Response::from_data(Vec::new()).with_status_code(204)));
    }

    let response = match (method, path.as_str()) {
        (Method::Get, "/health") => json_response(
            200,
            &serde_json::json!({
                "ok": true,
                "sessions": orchestrator.store().sessions().len(),
            }),
        ),
        (Method::Post, "/deploy") => match read_json::<JobRequest>(&mut request) {
            Ok(req) => deploy(orchestrator, &req),
            Err(resp) => resp,
        },
        (Method::Post, "/api/optimize") => match read_json::<OptimizeRequest>(&mut request) {
            Ok(req) => optimize(orchestrator, &req),
            Err(resp) => resp,
        },
        (Method::Post, "/api/run/single") => run_stored(orchestrator, Mode::Single),
        (Method::Post, "/api/run/cluster") => run_stored(orchestrator, Mode::ClusterRunOnly),
        _ => json_response(404, &ErrorBody {
            error: format!("no route for {path}"),
        }),
    };
    request.respond(response)
}

fn deploy(orchestrator: &Orchestrator, req: &JobRequest) -> HttpResponse {
    match orchestrator.deploy(req) {
        Ok(DeployOutcome::Optimized(optimized)) => optimized_response(optimized),
        Ok(DeployOutcome::Executed(result)) => json_response(200, &result),
        Err(err) => error_response(&err),
    }
}

fn optimize(orchestrator: &Orchestrator, req: &OptimizeRequest) -> HttpResponse {
    let session = orchestrator.session_id(req.session.as_deref());
    match orchestrator.optimize(session, &req.input) {
        Ok(optimized) => optimized_response(optimized),
        Err(err) => error_response(&err),
    }
}

/// Acknowledge the optimize phase without waiting for the cluster push;
/// the stager logs its per-node outcomes.
fn optimized_response(optimized: Optimized) -> HttpResponse {
    if !optimized.staging.is_finished() {
        debug!("cluster push still running in background");
    }
    json_response(200, &optimized.response)
}

fn run_stored(orchestrator: &Orchestrator, mode: Mode) -> HttpResponse {
    match orchestrator.run(orchestrator.default_session(), mode, None) {
        Ok(result) => json_response(200, &RunResponse::from(result)),
        Err(err) => error_response(&err),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(request: &mut Request) -> Result<T, HttpResponse> {
    let mut body: Vec<u8> = Vec::new();
    if let Err(err) = request
        .as_reader()
        .take((MAX_REQUEST_BYTES + 1) as u64)
        .read_to_end(&mut body)
    {
        return Err(json_response(400, &ErrorBody {
            error: format!("failed to read request body: {err}"),
        }));
    }
    if body.len() > MAX_REQUEST_BYTES {
        return Err(json_response(413, &ErrorBody {
            error: "request payload exceeds 5 MiB limit".to_string(),
        }));
    }
    serde_json::from_slice(&body).map_err(|err| {
        json_response(400, &ErrorBody {
            error: format!("invalid request body: {err}"),
        })
    })
}

fn error_response(err: &OrchestratorError) -> HttpResponse {
    let status = err.http_status();
    warn!(status, error = %err, "request failed");
    json_response(status, &ErrorBody::from(err))
}

fn json_response<T: Serialize>(code: u16, body: &T) -> HttpResponse {
    let (code, bytes) = match serde_json::to_vec(body) {
        Ok(bytes) => (code, bytes),
        Err(err) => (
            500,
            format!("{{\"error\":\"failed to encode response: {err}\"}}").into_bytes(),
        ),
    };
    let mut response = Response::from_data(bytes).with_status_code(code);
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response = response.with_header(header);
    }
    with_cors(response)
}

fn with_cors(mut response: HttpResponse) -> HttpResponse {
    for (name, value) in CORS_HEADERS {
        if let Ok(header) = Header::from_bytes(name, value) {
            response = response.with_header(header);
        }
    }
    response
}
