use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Output of a finished child process.
#[derive(Debug, Clone)]
pub struct Captured {
    /// stdout followed by stderr.
    pub output: String,
    /// `None` when the process was killed by a signal or timed out.
    pub code: Option<i32>,
    pub timed_out: bool,
}

impl Captured {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }
}

/// Spawn `cmd`, optionally feed `stdin`, and wait for it to exit.
///
/// stdout and stderr are drained on their own threads so a chatty child
/// cannot block on a full pipe. On unix the child leads its own process
/// group, and with a `timeout` the whole group is killed once it elapses
/// (launchers and `sh -c` wrappers leave descendants holding the pipes).
/// The child is always reaped before returning.
pub fn run_captured(
    cmd: &mut Command,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> io::Result<Captured> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_handle = thread::spawn(move || drain(stdout));
    let err_handle = thread::spawn(move || drain(stderr));

    if let Some(bytes) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            // A child that exits without reading stdin closes the pipe; that
            // is its business, the exit status tells the rest.
            match pipe.write_all(bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Err(e) => {
                    reap(&mut child);
                    return Err(e);
                }
            }
            drop(pipe);
        }
    }

    let (status, timed_out) = match wait(&mut child, timeout) {
        Ok(v) => v,
        Err(e) => {
            reap(&mut child);
            return Err(e);
        }
    };

    let out_buf = join(out_handle, "stdout")?;
    let err_buf = join(err_handle, "stderr")?;

    let mut output = String::from_utf8_lossy(&out_buf).into_owned();
    output.push_str(&String::from_utf8_lossy(&err_buf));

    Ok(Captured {
        output,
        code: if timed_out { None } else { status.and_then(|s| s.code()) },
        timed_out,
    })
}

fn drain<R: Read>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut r) = pipe {
        r.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

fn join(handle: thread::JoinHandle<io::Result<Vec<u8>>>, name: &str) -> io::Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, format!("{name} reader thread panicked")))?
}

fn wait(child: &mut Child, timeout: Option<Duration>) -> io::Result<(Option<ExitStatus>, bool)> {
    let Some(timeout) = timeout else {
        return Ok((Some(child.wait()?), false));
    };

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((Some(status), false));
        }
        if start.elapsed() >= timeout {
            reap(child);
            return Ok((None, true));
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn reap(child: &mut Child) {
    kill_group(child);
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // Still unreaped here, so the group id cannot have been reused.
    if killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL).is_err() {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_then_stderr() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err 1>&2; exit 3");
        let cap = run_captured(&mut cmd, None, None).unwrap();
        assert_eq!(cap.output, "out\nerr\n");
        assert_eq!(cap.code, Some(3));
        assert!(!cap.success());
    }

    #[test]
    fn feeds_stdin() {
        let mut cmd = Command::new("cat");
        let cap = run_captured(&mut cmd, Some(b"hello\n"), None).unwrap();
        assert!(cap.success());
        assert_eq!(cap.output, "hello\n");
    }

    #[test]
    fn timeout_kills_the_child() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exec sleep 5");
        let start = Instant::now();
        let cap = run_captured(&mut cmd, None, Some(Duration::from_millis(100))).unwrap();
        assert!(cap.timed_out);
        assert!(cap.code.is_none());
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_kills_descendants_holding_the_pipes() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 3; echo done");
        let start = Instant::now();
        let cap = run_captured(&mut cmd, None, Some(Duration::from_millis(200))).unwrap();
        assert!(cap.timed_out);
        assert!(!cap.output.contains("done"));
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let mut cmd = Command::new("/definitely/not/a/binary");
        assert!(run_captured(&mut cmd, None, None).is_err());
    }
}
