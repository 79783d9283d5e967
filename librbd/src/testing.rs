//! Test doubles for the command runner.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::exec::{Cmd, CommandOutput, CommandRunner};

/// Whether `needle` (whitespace separated words) appears as consecutive
/// arguments of `cmd`.
fn has_args(cmd: &Cmd, needle: &str) -> bool {
    let words: Vec<&str> = needle.split_whitespace().collect();
    if words.is_empty() {
        return true;
    }
    cmd.args
        .windows(words.len())
        .any(|w| w.iter().zip(&words).all(|(a, b)| a == b))
}

struct Response {
    program: String,
    pattern: String,
    out: CommandOutput,
    used: bool,
}

/// Replays canned outputs.
///
/// A response matches a call when the program is the same and the pattern
/// words appear in the arguments. When several responses match, the oldest is
/// consumed; the last matching response is kept and repeats until a new one
/// for the same pattern is queued. Unscripted calls exit with 127.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<Vec<Response>>,
    calls: Mutex<Vec<Cmd>>,
}

impl ScriptedRunner {
    pub fn respond(&self, program: &str, pattern: &str, code: i32, stdout: &str) {
        let mut responses = self.responses.lock();
        responses.retain(|r| !(r.used && r.program == program && r.pattern == pattern));
        responses.push(Response {
            program: program.to_owned(),
            pattern: pattern.to_owned(),
            out: CommandOutput {
                code,
                stdout: stdout.trim().to_owned(),
                stderr: if code == 0 {
                    String::new()
                } else {
                    format!("{program} failed")
                },
            },
            used: false,
        });
    }

    pub fn calls(&self) -> Vec<Cmd> {
        self.calls.lock().clone()
    }

    pub fn last_call(&self) -> Cmd {
        self.calls.lock().last().cloned().expect("no calls recorded")
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, cmd: &Cmd) -> std::io::Result<CommandOutput> {
        self.calls.lock().push(cmd.clone());
        let mut responses = self.responses.lock();
        let matching: Vec<usize> = responses
            .iter()
            .enumerate()
            .filter(|(_, r)| r.program == cmd.program && has_args(cmd, &r.pattern))
            .map(|(i, _)| i)
            .collect();
        let out = match matching.as_slice() {
            [] => CommandOutput {
                code: 127,
                stdout: String::new(),
                stderr: format!("unscripted: {cmd}"),
            },
            [only] => {
                responses[*only].used = true;
                responses[*only].out.clone()
            }
            [first, ..] => responses.remove(*first).out,
        };
        Ok(out)
    }
}

#[derive(Default)]
struct HostState {
    /// Filesystem type per device.
    filesystems: HashMap<PathBuf, String>,
    /// Mount point to source device.
    mounts: HashMap<PathBuf, PathBuf>,
    /// Programs that fail their next N invocations.
    failures: HashMap<String, usize>,
    /// Programs that never return.
    hangs: Vec<String>,
    calls: HashMap<String, usize>,
}

/// A stateful fake of the local filesystem tools (`blkid`, `mkfs`, `mount`,
/// `umount`, `findmnt`).
///
/// Clones share state, so a test can keep a handle while the driver owns
/// another.
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` invocations of `program` fail.
    pub fn fail(&self, program: &str, times: usize) {
        self.state.lock().failures.insert(program.to_owned(), times);
    }

    /// Make every later invocation of `program` hang.
    pub fn hang(&self, program: &str) {
        self.state.lock().hangs.push(program.to_owned());
    }

    /// How many times `program` was invoked.
    pub fn calls(&self, program: &str) -> usize {
        self.state.lock().calls.get(program).copied().unwrap_or(0)
    }

    pub fn is_mounted(&self, mount_point: &std::path::Path) -> bool {
        self.state.lock().mounts.contains_key(mount_point)
    }

    pub fn filesystem(&self, device: &std::path::Path) -> Option<String> {
        self.state.lock().filesystems.get(device).cloned()
    }

    /// Put a filesystem on `device`, as if it had been formatted elsewhere.
    pub fn format(&self, device: &str, fs_type: &str) {
        self.state
            .lock()
            .filesystems
            .insert(PathBuf::from(device), fs_type.to_owned());
    }

    /// Mount something at `mount_point` behind the driver's back.
    pub fn mount_foreign(&self, source: &str, mount_point: &std::path::Path) {
        self.state
            .lock()
            .mounts
            .insert(mount_point.to_owned(), PathBuf::from(source));
    }

    /// Lose every mount.
    pub fn reboot(&self) {
        self.state.lock().mounts.clear();
    }

    fn execute(state: &mut HostState, cmd: &Cmd) -> CommandOutput {
        let ok = |stdout: String| CommandOutput {
            code: 0,
            stdout,
            stderr: String::new(),
        };
        let fail = |code: i32, stderr: &str| CommandOutput {
            code,
            stdout: String::new(),
            stderr: stderr.to_owned(),
        };
        let last = cmd.args.last().map(PathBuf::from).unwrap_or_default();

        match cmd.program.as_str() {
            "findmnt" => match state.mounts.get(&last) {
                Some(source) => ok(source.display().to_string()),
                None => fail(1, ""),
            },
            "blkid" => match state.filesystems.get(&last) {
                Some(fs) => ok(fs.clone()),
                None => fail(2, ""),
            },
            "mkfs" => {
                let fs = cmd.args.get(1).cloned().unwrap_or_default();
                state.filesystems.insert(last, fs);
                ok(String::new())
            }
            "mount" => {
                let device = PathBuf::from(&cmd.args[cmd.args.len() - 2]);
                if state.mounts.contains_key(&last) {
                    return fail(32, "mount point busy");
                }
                if !state.filesystems.contains_key(&device) {
                    return fail(32, "wrong fs type, bad option, bad superblock");
                }
                state.mounts.insert(last, device);
                ok(String::new())
            }
            "umount" => match state.mounts.remove(&last) {
                Some(_) => ok(String::new()),
                None => fail(32, "not mounted"),
            },
            other => fail(127, &format!("{other}: command not found")),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, cmd: &Cmd) -> std::io::Result<CommandOutput> {
        let hang = {
            let mut state = self.state.lock();
            *state.calls.entry(cmd.program.clone()).or_default() += 1;
            state.hangs.contains(&cmd.program)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        let left = state.failures.get(&cmd.program).copied().unwrap_or(0);
        if left > 0 {
            state.failures.insert(cmd.program.clone(), left - 1);
            return Ok(CommandOutput {
                code: 1,
                stdout: String::new(),
                stderr: format!("{}: injected failure", cmd.program),
            });
        }
        Ok(Self::execute(&mut state, cmd))
    }
}
