use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::backend::{self, Backend};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::policy::{self, Policy};
use crate::sanitize;

/// Single-core and cluster variants produced by one dual-variant call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantPair {
    pub single: String,
    pub cluster: String,
}

/// Boundary to the external code-transformation service.
pub trait Transformer: Send + Sync {
    /// Rewrite `source` under `policy`, returning sanitized code.
    fn transform(&self, source: &str, policy: &Policy) -> Result<String, GatewayError>;

    /// Produce both variants from a single call.
    fn transform_dual(&self, source: &str, ranks: usize) -> Result<VariantPair, GatewayError>;
}

/// Ordered fallback over configured backends.
pub struct Gateway {
    backends: Vec<Box<dyn Backend>>,
    separator: String,
}

impl Gateway {
    pub fn new(backends: Vec<Box<dyn Backend>>, separator: impl Into<String>) -> Self {
        Self {
            backends,
            separator: separator.into(),
        }
    }

    pub fn from_config(cfg: &GatewayConfig) -> Result<Self> {
        let backends = cfg
            .backends
            .iter()
            .enumerate()
            .map(|(idx, spec)| {
                backend::build_backend(spec)
                    .with_context(|| format!("failed to build gateway backend #{idx}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(backends, cfg.separator.clone()))
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Try each backend in order until `accept` takes its reply.
    ///
    /// `accept` sees every attempt, including backend errors. A rejected
    /// reply moves on to the next backend; nothing from a failed attempt is
    /// carried forward.
    fn attempt<T>(
        &self,
        prompt: &str,
        mut accept: impl FnMut(Result<String>) -> Result<T, String>,
    ) -> Result<T, GatewayError> {
        if self.backends.is_empty() {
            return Err(GatewayError::NoBackends);
        }

        let prompt_hash = policy::hash_prompt(prompt);
        let mut last: Option<(String, String)> = None;

        for backend in &self.backends {
            debug!(backend = backend.name(), prompt = %prompt_hash, "calling transformation backend");
            match accept(backend.generate(prompt)) {
                Ok(value) => {
                    info!(backend = backend.name(), prompt = %prompt_hash, "transformation succeeded");
                    return Ok(value);
                }
                Err(reason) => {
                    warn!(backend = backend.name(), %reason, "transformation backend failed");
                    last = Some((backend.name().to_string(), reason));
                }
            }
        }

        let (backend, last) = last.unwrap_or_default();
        Err(GatewayError::Exhausted {
            attempts: self.backends.len(),
            backend,
            last,
        })
    }
}

impl Transformer for Gateway {
    fn transform(&self, source: &str, policy: &Policy) -> Result<String, GatewayError> {
        let prompt = policy.render(source);
        self.attempt(&prompt, |reply| {
            let raw = reply.map_err(|err| format!("{err:#}"))?;
            let code = sanitize::strip_fences(&raw);
            if code.is_empty() {
                Err("empty response after sanitization".to_string())
            } else {
                Ok(code)
            }
        })
    }

    fn transform_dual(&self, source: &str, ranks: usize) -> Result<VariantPair, GatewayError> {
        let policy = Policy::Dual {
            ranks,
            separator: self.separator.clone(),
        };
        let prompt = policy.render(source);

        // An empty or undelimited reply advances to the next backend; if the
        // last attempt failed to partition, that is the error reported.
        let mut partition: Option<GatewayError> = None;
        let result = self.attempt(&prompt, |reply| {
            partition = None;
            let raw = reply.map_err(|err| format!("{err:#}"))?;
            if sanitize::strip_fences(&raw).is_empty() {
                return Err("empty response after sanitization".to_string());
            }
            match sanitize::split_variants(&raw, &self.separator) {
                Ok((single, cluster)) => Ok(VariantPair { single, cluster }),
                Err(err) => {
                    let reason = err.to_string();
                    partition = Some(err);
                    Err(reason)
                }
            }
        });

        match (result, partition) {
            (Ok(pair), _) => Ok(pair),
            (Err(_), Some(err)) => Err(err),
            (Err(err), None) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        name: String,
        reply: Result<String, String>,
        calls: Arc<AtomicUsize>,
    }

    impl Backend for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(|e| anyhow!(e))
        }
    }

    fn scripted(
        name: &str,
        reply: Result<&str, &str>,
        calls: &Arc<AtomicUsize>,
    ) -> Box<dyn Backend> {
        Box::new(Scripted {
            name: name.to_string(),
            reply: reply.map(str::to_string).map_err(str::to_string),
            calls: Arc::clone(calls),
        })
    }

    #[test]
    fn first_successful_backend_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gw = Gateway::new(
            vec![
                scripted("a", Ok("```python\nprint(1)\n```"), &calls),
                scripted("b", Ok("print(2)"), &calls),
            ],
            "###SPLIT###",
        );
        let code = gw.transform("src", &Policy::Cluster { ranks: 4 }).unwrap();
        assert_eq!(code, "print(1)");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_response_falls_through_to_next_backend() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gw = Gateway::new(
            vec![
                scripted("a", Ok("```\n```"), &calls),
                scripted("b", Err("boom"), &calls),
                scripted("c", Ok("print(3)"), &calls),
            ],
            "###SPLIT###",
        );
        let code = gw.transform("src", &Policy::Cluster { ranks: 4 }).unwrap();
        assert_eq!(code, "print(3)");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhaustion_reports_last_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gw = Gateway::new(
            vec![
                scripted("pro", Err("rate limited"), &calls),
                scripted("flash", Err("model overloaded"), &calls),
            ],
            "###SPLIT###",
        );
        let err = gw.transform("src", &Policy::Cluster { ranks: 4 }).unwrap_err();
        match &err {
            GatewayError::Exhausted {
                attempts,
                backend,
                last,
            } => {
                assert_eq!(*attempts, 2);
                assert_eq!(backend, "flash");
                assert!(last.contains("model overloaded"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn no_backends_is_an_error() {
        let gw = Gateway::new(Vec::new(), "###SPLIT###");
        assert!(matches!(
            gw.transform("src", &Policy::Cluster { ranks: 1 }),
            Err(GatewayError::NoBackends)
        ));
    }

    #[test]
    fn dual_without_separator_is_partition_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gw = Gateway::new(
            vec![scripted("a", Ok("print('only one')"), &calls)],
            "###SPLIT###",
        );
        let err = gw.transform_dual("src", 4).unwrap_err();
        assert!(matches!(err, GatewayError::Partition(_)), "{err}");
    }

    #[test]
    fn dual_partition_failure_tries_next_backend() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gw = Gateway::new(
            vec![
                scripted("a", Ok("print('only one')"), &calls),
                scripted("b", Ok("print('s')\n###SPLIT###\nprint('c')"), &calls),
            ],
            "###SPLIT###",
        );
        let pair = gw.transform_dual("src", 4).unwrap();
        assert_eq!(pair.single, "print('s')");
        assert_eq!(pair.cluster, "print('c')");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dual_reports_exhaustion_when_last_backend_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gw = Gateway::new(
            vec![
                scripted("a", Ok("no separator here"), &calls),
                scripted("b", Err("unreachable"), &calls),
            ],
            "###SPLIT###",
        );
        let err = gw.transform_dual("src", 4).unwrap_err();
        assert!(matches!(err, GatewayError::Exhausted { .. }), "{err}");
    }
}
