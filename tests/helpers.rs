#![allow(dead_code)]

use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use fastproc::config::Config;
use fastproc::error::GatewayError;
use fastproc::gateway::{Transformer, VariantPair};
use fastproc::policy::Policy;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> MutexGuard<'static, ()> {
    match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(g) => g,
        // A test that panicked while holding the lock must not wedge the rest.
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RAII guard for test-only env var mutation, serialized by a global lock.
#[must_use]
pub struct EnvVarGuard {
    entries: Vec<(String, Option<OsString>)>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvVarGuard {
    pub fn set(key: &str, value: &str) -> Self {
        Self::set_many(&[(key, value)])
    }

    pub fn set_many(pairs: &[(&str, &str)]) -> Self {
        let lock = env_lock();
        let mut entries = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            entries.push((key.to_string(), env::var_os(key)));
            // Serialized by ENV_LOCK.
            unsafe {
                env::set_var(key, value);
            }
        }
        Self {
            entries,
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        for (key, old) in self.entries.iter() {
            unsafe {
                match old {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

pub fn unique_test_temp_dir(prefix: &str) -> PathBuf {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = env::temp_dir().join(format!(
        "fastproc-{prefix}-{}-{nanos}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    fs::create_dir_all(&dir).expect("create test temp dir");
    dir
}

pub fn write_executable(path: &Path, contents: &str) -> io::Result<()> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

/// Config that runs artifacts with `sh` and stages under `dir`.
pub fn local_config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.python = "sh".to_string();
    cfg.stage_dir = dir.join("stage");
    cfg.gateway.backends = Vec::new();
    cfg
}

/// Stand-in for `mpiexec -n <N> <python> <path>`: reports the rank count
/// and runs the artifact once.
pub fn mock_local_launcher(dir: &Path) -> PathBuf {
    let bin = dir.join("mock_mpiexec.sh");
    write_executable(
        &bin,
        r#"#!/bin/sh
set -eu
if [ "${1:-}" != "-n" ]; then
  echo "expected -n, got '${1:-}'" 1>&2
  exit 2
fi
echo "ranks=$2"
shift 2
exec "$@"
"#,
    )
    .expect("write mock launcher");
    bin
}

/// Stand-in for `mpirun -np N --host h1,h2 --oversubscribe <python> <path>`.
pub fn mock_remote_launcher(dir: &Path) -> PathBuf {
    let bin = dir.join("mock_mpirun.sh");
    write_executable(
        &bin,
        r#"#!/bin/sh
set -eu
echo "launch $*"
while [ $# -gt 0 ] && [ "$1" != "--oversubscribe" ]; do
  shift
done
shift
exec "$@"
"#,
    )
    .expect("write mock remote launcher");
    bin
}

/// Stand-in for the OpenSSH client: runs the command locally, logs
/// `<host> <command>` to `ssh.log`, and fails with 255 for hosts whose
/// name contains `down`.
pub fn mock_ssh(dir: &Path) -> PathBuf {
    let bin = dir.join("mock_ssh.sh");
    let log = dir.join("ssh.log");
    let script = format!(
        r#"#!/bin/sh
host=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o|-i|-p) shift 2 ;;
    --) shift; break ;;
    *) host="$1"; shift ;;
  esac
done
case "$host" in
  *down*)
    echo "ssh: connect to host $host port 22: Connection refused" 1>&2
    exit 255
    ;;
esac
echo "$host $1" >> '{}'
exec sh -c "$1"
"#,
        log.display()
    );
    write_executable(&bin, &script).expect("write mock ssh");
    bin
}

pub fn ssh_log(dir: &Path) -> String {
    fs::read_to_string(dir.join("ssh.log")).unwrap_or_default()
}

/// Transformer double that counts calls and returns canned code.
pub struct StubGateway {
    pub calls: Arc<AtomicUsize>,
    cluster: Result<String, String>,
    dual: Result<(String, String), String>,
}

impl StubGateway {
    pub fn new(cluster: &str, single: &str) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            cluster: Ok(cluster.to_string()),
            dual: Ok((single.to_string(), cluster.to_string())),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            cluster: Err(reason.to_string()),
            dual: Err(reason.to_string()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn exhausted(reason: &str) -> GatewayError {
        GatewayError::Exhausted {
            attempts: 1,
            backend: "stub".to_string(),
            last: reason.to_string(),
        }
    }
}

impl Transformer for StubGateway {
    fn transform(&self, _source: &str, _policy: &Policy) -> Result<String, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cluster.clone().map_err(|r| Self::exhausted(&r))
    }

    fn transform_dual(&self, _source: &str, _ranks: usize) -> Result<VariantPair, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.dual
            .clone()
            .map(|(single, cluster)| VariantPair { single, cluster })
            .map_err(|r| Self::exhausted(&r))
    }
}
