// External process execution for Exliar GPU
//
// Every probe that shells out (lspci, vendor diagnostic tools, pct, bootloader
// refresh commands) goes through a CommandRunner so it can be bounded by a
// timeout and replaced with canned output in tests.

use std::cell::RefCell;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::ProbeError;

/// Default upper bound for a single probe
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default upper bound for bootloader regeneration (update-grub,
/// proxmox-boot-tool refresh)
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(600);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A command to execute, with its deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shell-like rendering used for logs and dry runs
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self { status: Some(0), stdout: stdout.to_string(), stderr: String::new() }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self { status: Some(code), stdout: String::new(), stderr: stderr.to_string() }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs external commands
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProbeError>;
}

/// Runner backed by real child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        SystemRunner
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProbeError> {
        debug!(command = %spec.display(), timeout = ?spec.timeout, "Running command");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ProbeError::NotFound(spec.program.clone()),
                _ => ProbeError::Spawn { program: spec.program.clone(), source: e },
            })?;

        // Pipes are drained on helper threads so a chatty child cannot block on
        // a full pipe while we wait for it.
        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let status = wait_with_deadline(&mut child, spec)?;

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        Ok(CommandOutput { status, stdout, stderr })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_with_deadline(child: &mut Child, spec: &CommandSpec) -> Result<Option<i32>, ProbeError> {
    let deadline = Instant::now() + spec.timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status.code()),
            Ok(None) if Instant::now() >= deadline => {
                warn!(command = %spec.display(), "Command timed out, killing it");
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProbeError::TimedOut {
                    program: spec.program.clone(),
                    timeout: spec.timeout,
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                return Err(ProbeError::Spawn { program: spec.program.clone(), source: e });
            }
        }
    }
}

/// Canned response for a [`ScriptedRunner`] entry
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Output(CommandOutput),
    Missing,
    Timeout,
}

/// Runner that replays canned responses instead of spawning processes.
///
/// Entries match on program name and an argument prefix; the first matching
/// entry wins. Unmatched commands behave as if the program is not installed.
/// Every invocation is recorded so callers can assert on what ran.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    entries: Vec<(String, Vec<String>, ScriptedResponse)>,
    calls: RefCell<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, program: &str, args_prefix: &[&str], response: ScriptedResponse) -> Self {
        self.entries.push((
            program.to_string(),
            args_prefix.iter().map(|a| a.to_string()).collect(),
            response,
        ));
        self
    }

    pub fn stdout(self, program: &str, args_prefix: &[&str], stdout: &str) -> Self {
        self.respond(program, args_prefix, ScriptedResponse::Output(CommandOutput::ok(stdout)))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(CommandSpec::display).collect()
    }

    /// Recorded invocations with their deadlines
    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProbeError> {
        self.calls.borrow_mut().push(spec.clone());
        let entry = self.entries.iter().find(|(program, prefix, _)| {
            *program == spec.program && spec.args.starts_with(prefix)
        });
        match entry.map(|(_, _, response)| response) {
            Some(ScriptedResponse::Output(output)) => Ok(output.clone()),
            Some(ScriptedResponse::Timeout) => Err(ProbeError::TimedOut {
                program: spec.program.clone(),
                timeout: spec.timeout,
            }),
            Some(ScriptedResponse::Missing) | None => Err(ProbeError::NotFound(spec.program.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_runner_reports_missing_program() {
        let spec = CommandSpec::new("exliar-definitely-not-a-real-binary", &[]);
        match SystemRunner::new().run(&spec) {
            Err(ProbeError::NotFound(name)) => assert_eq!(name, "exliar-definitely-not-a-real-binary"),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn system_runner_kills_hung_process() {
        let spec = CommandSpec::new("sleep", &["5"]).with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let result = SystemRunner::new().run(&spec);
        assert!(matches!(result, Err(ProbeError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn system_runner_captures_stdout_and_status() {
        let spec = CommandSpec::new("sh", &["-c", "echo hello; exit 4"]);
        let output = SystemRunner::new().run(&spec).unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.status, Some(4));
        assert!(!output.success());
    }

    #[test]
    fn scripted_runner_matches_argument_prefix() {
        let runner = ScriptedRunner::new()
            .stdout("nvidia-smi", &["-L"], "GPU 0: Tesla")
            .respond("nvidia-smi", &[], ScriptedResponse::Timeout);

        let listed = runner.run(&CommandSpec::new("nvidia-smi", &["-L"])).unwrap();
        assert_eq!(listed.stdout, "GPU 0: Tesla");

        let other = runner.run(&CommandSpec::new("nvidia-smi", &["-q"]));
        assert!(matches!(other, Err(ProbeError::TimedOut { .. })));

        let missing = runner.run(&CommandSpec::new("rocminfo", &[]));
        assert!(matches!(missing, Err(ProbeError::NotFound(_))));

        assert_eq!(runner.calls(), vec!["nvidia-smi -L", "nvidia-smi -q", "rocminfo"]);
    }
}
