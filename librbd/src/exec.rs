//! Process execution behind an injectable trait.
//!
//! All kernel and cluster tools (`rbd`, `rados`, `blkid`, `mkfs`, `mount`,
//! `umount`, `findmnt`) are invoked through [`CommandRunner`] so the lifecycle
//! logic can be exercised against a fake host in tests.

use std::fmt;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::debug;

/// A command line plus extra environment.
///
/// The environment is never included in the [`Display`](fmt::Display)
/// rendering, so credentials passed through it stay out of logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `-1` when the process was killed by a signal.
    pub code: i32,
    /// Stdout with surrounding spaces and newlines trimmed.
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Stderr if non-empty, otherwise the exit code, for error messages.
    pub fn reason(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {}", self.code)
        } else {
            stderr.to_owned()
        }
    }
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `cmd` to completion.
    ///
    /// `Err` means the process could not be spawned; a non-zero exit is
    /// reported through [`CommandOutput::code`].
    async fn run(&self, cmd: &Cmd) -> std::io::Result<CommandOutput>;
}

/// [`CommandRunner`] that spawns real processes with `tokio::process`.
///
/// Children are killed when the future is dropped, so a step that times out
/// does not leave a stray tool running.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, cmd: &Cmd) -> std::io::Result<CommandOutput> {
        debug!(cmd = %cmd, "sh");
        let output = tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let out = CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout)
                .trim_matches(|c| c == ' ' || c == '\n')
                .to_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !out.success() {
            debug!(cmd = %cmd, code = out.code, stderr = %out.stderr.trim(), "command failed");
        }
        Ok(out)
    }
}
