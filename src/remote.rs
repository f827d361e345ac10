use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use crate::config::SshConfig;
use crate::error::RemoteError;
use crate::process::{self, Captured};

/// ssh reserves exit status 255 for its own (transport-level) failures.
///
/// A remote command that itself exits 255 is indistinguishable from a
/// failed connection and is reported as `RemoteError::Transport`; the
/// captured output is kept in the message either way.
const SSH_TRANSPORT_STATUS: i32 = 255;

/// Secure remote shell: run a command on a host, capturing combined output.
pub trait RemoteShell: Send + Sync {
    /// `Err` only for transport faults; a command that ran and exited
    /// non-zero comes back as `Ok` with its exit code.
    fn exec(&self, host: &str, command: &str, stdin: Option<&[u8]>)
        -> Result<Captured, RemoteError>;

    /// Write `contents` to `path` on `host`, byte for byte.
    fn write_file(&self, host: &str, path: &str, contents: &[u8]) -> Result<(), RemoteError> {
        let command = format!("cat > {}", shell_quote(path));
        let cap = self.exec(host, &command, Some(contents))?;
        if cap.success() {
            Ok(())
        } else {
            Err(RemoteError::Command {
                host: host.to_string(),
                code: cap.code,
                output: cap.output.trim().to_string(),
            })
        }
    }
}

/// `RemoteShell` backed by the system OpenSSH client.
///
/// Runs non-interactively (`BatchMode`), so credentials are limited to
/// keys: the configured identity file or the agent.
#[derive(Debug, Clone)]
pub struct SshShell {
    bin: PathBuf,
    user: Option<String>,
    key_path: Option<PathBuf>,
    port: Option<u16>,
    connect_timeout_secs: u64,
}

impl SshShell {
    pub fn from_config(cfg: &SshConfig) -> Self {
        Self {
            bin: cfg.bin.clone(),
            user: cfg.user.clone(),
            key_path: cfg.key_path.clone(),
            port: cfg.port,
            connect_timeout_secs: cfg.connect_timeout_secs,
        }
    }

    fn destination(&self, host: &str) -> String {
        match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    /// Full argument vector passed to the ssh binary.
    pub fn args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(key) = &self.key_path {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.destination(host));
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

impl RemoteShell for SshShell {
    fn exec(
        &self,
        host: &str,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<Captured, RemoteError> {
        debug!(host, command, "ssh exec");
        let mut cmd = Command::new(&self.bin);
        cmd.args(self.args(host, command));

        let cap = process::run_captured(&mut cmd, stdin, None).map_err(|err| {
            RemoteError::Transport {
                host: host.to_string(),
                message: format!("failed to spawn '{}': {err}", self.bin.display()),
            }
        })?;

        if cap.code == Some(SSH_TRANSPORT_STATUS) {
            return Err(RemoteError::Transport {
                host: host.to_string(),
                message: cap.output.trim().to_string(),
            });
        }
        Ok(cap)
    }
}

/// Quote `s` for a POSIX shell as a single word.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:,=@".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
