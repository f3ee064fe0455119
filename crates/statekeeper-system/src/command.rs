//! Spawns host binaries (`zfs`, `zpool`, `smbstatus`, `smbcontrol`) with a
//! per-class timeout and captures their output.

use statekeeper_core::error::{StatekeeperError, StatekeeperResult};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Which timeout budget a command runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Queries; short budget so a hung pool does not stall every plan.
    Read,
    /// Anything that changes the host.
    Mutation,
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    path: PathBuf,
    read_timeout: Duration,
    mutation_timeout: Duration,
}

#[derive(Debug)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stderr if present, otherwise stdout; used in error messages.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

impl CommandRunner {
    pub fn new(path: PathBuf, read_timeout: Duration, mutation_timeout: Duration) -> Self {
        Self {
            path,
            read_timeout,
            mutation_timeout,
        }
    }

    /// Wrap an explicitly configured binary; it must exist.
    pub fn with_path(
        path: PathBuf,
        read_timeout: Duration,
        mutation_timeout: Duration,
    ) -> StatekeeperResult<Self> {
        if !path.exists() {
            return Err(StatekeeperError::InvalidConfig(format!(
                "binary not found at {}",
                path.display()
            )));
        }
        Ok(Self::new(path, read_timeout, mutation_timeout))
    }

    /// First existing entry of `candidates`, if any.
    pub fn discover(
        candidates: &[&str],
        read_timeout: Duration,
        mutation_timeout: Duration,
    ) -> Option<Self> {
        candidates
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
            .map(|p| Self::new(p.to_path_buf(), read_timeout, mutation_timeout))
    }

    pub fn binary(&self) -> &Path {
        &self.path
    }

    fn timeout_for(&self, class: CommandClass) -> Duration {
        match class {
            CommandClass::Read => self.read_timeout,
            CommandClass::Mutation => self.mutation_timeout,
        }
    }

    pub fn run(&self, class: CommandClass, args: &[&str]) -> StatekeeperResult<Output> {
        let mut child = Command::new(&self.path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, self.timeout_for(class), args, stdout_pipe, stderr_pipe)
    }

    /// Like `run`, but a non-zero exit becomes a `Provider` error.
    pub fn run_checked(&self, class: CommandClass, args: &[&str]) -> StatekeeperResult<Output> {
        let out = self.run(class, args)?;
        if !out.success() {
            return Err(classify_cli_error(&self.path, args, &out));
        }
        Ok(out)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        timeout: Duration,
        args: &[&str],
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> StatekeeperResult<Output> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(StatekeeperError::Provider(format!(
                "{} {} timed out after {:?}",
                self.path.display(),
                args.join(" "),
                timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| StatekeeperError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| StatekeeperError::Provider("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<StatekeeperResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> StatekeeperResult<String> {
        let mut buf = Vec::new();
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buf)?;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

/// Turn a failed invocation into a `Provider` error that names what went wrong.
pub(crate) fn classify_cli_error(binary: &Path, args: &[&str], output: &Output) -> StatekeeperError {
    let diagnostic = output.diagnostic();
    let lower = diagnostic.to_ascii_lowercase();
    let invocation = format!("{} {}", binary.display(), args.join(" "));

    if lower.contains("dataset does not exist") {
        return StatekeeperError::Provider(format!(
            "{invocation} reported missing dataset: {diagnostic}"
        ));
    }
    if lower.contains("no such pool") || lower.contains("pool does not exist") {
        return StatekeeperError::Provider(format!(
            "{invocation} reported missing pool: {diagnostic}"
        ));
    }

    StatekeeperError::Provider(format!(
        "{invocation} exited with code {}: {}",
        output.status,
        if diagnostic.is_empty() {
            "no additional output"
        } else {
            diagnostic
        }
    ))
}
