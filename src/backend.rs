use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use crate::config::BackendSpec;
use crate::process;

/// One text-generation backend behind the transformation gateway.
pub trait Backend: Send + Sync {
    /// Label used in logs and aggregated errors.
    fn name(&self) -> &str;

    fn generate(&self, prompt: &str) -> Result<String>;
}

pub fn build_backend(spec: &BackendSpec) -> Result<Box<dyn Backend>> {
    match spec {
        BackendSpec::Gemini {
            model,
            endpoint,
            api_key_env,
            timeout_secs,
        } => Ok(Box::new(GeminiBackend {
            model: model.clone(),
            endpoint: endpoint.clone(),
            api_key_env: api_key_env.clone(),
            timeout_secs: *timeout_secs,
        })),
        BackendSpec::Http {
            endpoint,
            bearer_env,
            headers,
            timeout_secs,
        } => Ok(Box::new(HttpBackend {
            endpoint: endpoint.clone(),
            bearer_env: bearer_env.clone(),
            headers: headers.clone(),
            timeout_secs: *timeout_secs,
        })),
        BackendSpec::Command {
            program,
            args,
            timeout_secs,
        } => {
            if program.as_os_str().is_empty() {
                return Err(anyhow!("command backend requires a program"));
            }
            Ok(Box::new(CommandBackend {
                label: program.display().to_string(),
                program: program.clone(),
                args: args.clone(),
                timeout_secs: *timeout_secs,
            }))
        }
    }
}

fn http_client(timeout_secs: Option<u64>) -> Result<reqwest::blocking::Client> {
    let mut builder = reqwest::blocking::Client::builder();
    if let Some(secs) = timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    builder.build().context("failed to build http client")
}

fn error_snippet(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(200) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    }
}

/// Google Generative Language `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiBackend {
    pub model: String,
    endpoint: String,
    api_key_env: String,
    timeout_secs: Option<u64>,
}

impl Backend for GeminiBackend {
    fn name(&self) -> &str {
        &self.model
    }

    fn generate(&self, prompt: &str) -> Result<String> {
        let key = env::var(&self.api_key_env)
            .map_err(|_| anyhow!("missing required api key env var '{}'", self.api_key_env))?;
        let client = http_client(self.timeout_secs)?;

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        );
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        let resp = client
            .post(url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .with_context(|| format!("gemini request for model '{}' failed", self.model))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            return Err(anyhow!(
                "gemini returned non-200 status {status}: {}",
                error_snippet(&text)
            ));
        }

        let json: Value = resp
            .json()
            .context("gemini response was not valid JSON")?;
        candidate_text(&json)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("gemini response has no candidate text"))
    }
}

fn candidate_text(json: &Value) -> Option<&str> {
    json.get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()
}

/// Generic JSON endpoint: `{ "prompt": .. }` in, `{ "output": .. }` out.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    endpoint: String,
    bearer_env: Option<String>,
    headers: BTreeMap<String, String>,
    timeout_secs: Option<u64>,
}

impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.endpoint
    }

    fn generate(&self, prompt: &str) -> Result<String> {
        let client = http_client(self.timeout_secs)?;
        let mut req = client
            .post(&self.endpoint)
            .header("Content-Type", "application/json");

        for (k, v) in self.headers.iter() {
            req = req.header(k, v);
        }

        if let Some(var) = &self.bearer_env {
            let token =
                env::var(var).map_err(|_| anyhow!("missing required auth env var '{var}'"))?;
            req = req.bearer_auth(token);
        }

        let resp = req
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .context("http backend request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            return Err(anyhow!(
                "http backend returned non-200 status {status}: {}",
                error_snippet(&text)
            ));
        }

        let json: Value = resp
            .json()
            .context("http backend response was not valid JSON")?;
        json.get("output")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("http backend response missing 'output' field"))
    }
}

/// Local CLI (e.g. `ollama run <model>`) that reads the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    label: String,
    program: PathBuf,
    args: Vec<String>,
    timeout_secs: Option<u64>,
}

impl Backend for CommandBackend {
    fn name(&self) -> &str {
        &self.label
    }

    fn generate(&self, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        let cap = process::run_captured(
            &mut cmd,
            Some(prompt.as_bytes()),
            self.timeout_secs.map(Duration::from_secs),
        )
        .with_context(|| format!("failed to spawn '{}'", self.program.display()))?;

        if cap.timed_out {
            return Err(anyhow!(
                "'{}' timed out after {}s",
                self.label,
                self.timeout_secs.unwrap_or_default()
            ));
        }
        if !cap.success() {
            return Err(anyhow!(
                "'{}' failed (exit={:?}): {}",
                self.label,
                cap.code,
                error_snippet(&cap.output)
            ));
        }
        Ok(cap.output)
    }
}
