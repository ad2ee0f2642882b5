//! Host side of the worker transport
//!
//! [`WorkerProxy`] owns one worker process. It starts the worker on the
//! first call, sends one request at a time and blocks for the matching
//! response. Any transport failure (broken pipe, early end of stream,
//! undecodable response) kills the worker and quarantines the proxy: every
//! later call fails with the captured diagnostic until [`WorkerProxy::reset`].

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use symdex_core::protocol::{read_message, write_message, Operation, Request, Response};
use symdex_core::{Occurrence, Result, SymdexError};
use tracing::{debug, info, warn};

/// Worker stderr lines kept for diagnostics
pub const STDERR_TAIL_LINES: usize = 200;

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// How to launch a worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn spawn(&self) -> Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SymdexError::WorkerSpawn {
                program: self.program.clone(),
                message: e.to_string(),
            })
    }
}

/// A live worker process and its pipes
struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr_thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn start(command: &WorkerCommand, tail: StderrTail) -> Result<Self> {
        let mut child = command.spawn()?;
        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SymdexError::WorkerSpawn {
                program: command.program.clone(),
                message: "worker pipes unavailable".to_string(),
            });
        };

        // Drain stderr continuously so a chatty worker never blocks on a full pipe
        let stderr_thread = std::thread::Builder::new()
            .name("symdex-worker-stderr".to_string())
            .spawn(move || drain_stderr(stderr, tail));
        let stderr_thread = match stderr_thread {
            Ok(handle) => handle,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SymdexError::WorkerSpawn {
                    program: command.program.clone(),
                    message: format!("cannot start stderr reader: {}", e),
                });
            }
        };

        info!(program = %command.program.display(), pid = child.id(), "worker started");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr_thread: Some(stderr_thread),
        })
    }

    /// One request/response round trip
    fn exchange(&mut self, request: &Request) -> Result<Response> {
        write_message(&mut self.stdin, request)?;
        read_message(&mut self.stdout)?.ok_or_else(|| SymdexError::WorkerCrash {
            diagnostic: "worker closed its output".to_string(),
        })
    }

    /// Close the pipes and reap the process; with `kill`, terminate it first.
    /// Returns once the stderr reader has drained everything.
    fn stop(self, kill: bool) -> Option<ExitStatus> {
        let Worker {
            mut child,
            stdin,
            stdout,
            stderr_thread,
        } = self;
        if kill {
            let _ = child.kill();
        }
        drop(stdin);
        drop(stdout);
        let status = child.wait().ok();
        if let Some(handle) = stderr_thread {
            let _ = handle.join();
        }
        debug!(?status, "worker stopped");
        status
    }
}

fn drain_stderr(stderr: impl std::io::Read, tail: StderrTail) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
        debug!(target: "symdex_worker", "{}", line);
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

enum ProxyState {
    Idle,
    Running(Worker),
    Quarantined(String),
}

/// Blocking client for one worker process
pub struct WorkerProxy {
    command: WorkerCommand,
    state: ProxyState,
    /// Databases the running worker has attached
    databases: Option<Vec<PathBuf>>,
    stderr_tail: StderrTail,
}

impl WorkerProxy {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::with_command(WorkerCommand::new(program))
    }

    pub fn with_command(command: WorkerCommand) -> Self {
        Self {
            command,
            state: ProxyState::Idle,
            databases: None,
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ProxyState::Running(_))
    }

    pub fn is_quarantined(&self) -> bool {
        matches!(self.state, ProxyState::Quarantined(_))
    }

    /// Diagnostic captured when the proxy was quarantined
    pub fn diagnostic(&self) -> Option<&str> {
        match &self.state {
            ProxyState::Quarantined(diagnostic) => Some(diagnostic),
            _ => None,
        }
    }

    /// Leave quarantine (or stop a live worker). The next call starts a fresh worker.
    pub fn reset(&mut self) {
        if let ProxyState::Running(worker) = std::mem::replace(&mut self.state, ProxyState::Idle) {
            worker.stop(false);
        }
        self.databases = None;
        if let Ok(mut tail) = self.stderr_tail.lock() {
            tail.clear();
        }
    }

    fn worker(&mut self) -> Result<&mut Worker> {
        match &self.state {
            ProxyState::Quarantined(diagnostic) => {
                return Err(SymdexError::Quarantined {
                    diagnostic: diagnostic.clone(),
                })
            }
            ProxyState::Idle => {
                if let Ok(mut tail) = self.stderr_tail.lock() {
                    tail.clear();
                }
                let worker = Worker::start(&self.command, Arc::clone(&self.stderr_tail))?;
                self.state = ProxyState::Running(worker);
            }
            ProxyState::Running(_) => {}
        }
        match &mut self.state {
            ProxyState::Running(worker) => Ok(worker),
            _ => Err(SymdexError::WorkerCrash {
                diagnostic: "worker is not running".to_string(),
            }),
        }
    }

    /// Send `request` and wait for its result
    pub fn call(&mut self, request: &Request) -> Result<Value> {
        let exchanged = self.worker()?.exchange(request);
        let response = match exchanged {
            Ok(response) => response,
            Err(err) if err.is_connection_fatal() || matches!(err, SymdexError::Io(_)) => {
                return Err(self.quarantine(err))
            }
            Err(err) => return Err(err),
        };
        match response.into_result() {
            // The worker could not read what we sent: the stream is out of step
            Err(err @ SymdexError::ProtocolCorruption(_)) => Err(self.quarantine(err)),
            other => other,
        }
    }

    /// `call`, decoding the result; a result of the wrong shape is corruption
    fn call_typed<T: DeserializeOwned>(&mut self, request: &Request) -> Result<T> {
        let value = self.call(request)?;
        serde_json::from_value(value).map_err(|e| {
            self.quarantine(SymdexError::ProtocolCorruption(format!(
                "unexpected result for {}: {}",
                request.op, e
            )))
        })
    }

    fn quarantine(&mut self, cause: SymdexError) -> SymdexError {
        let status = match std::mem::replace(&mut self.state, ProxyState::Idle) {
            ProxyState::Running(worker) => worker.stop(true),
            _ => None,
        };

        let mut diagnostic = match &cause {
            SymdexError::ProtocolCorruption(detail) => detail.clone(),
            SymdexError::WorkerCrash { diagnostic } => diagnostic.clone(),
            other => other.to_string(),
        };
        if let Some(status) = status {
            diagnostic.push_str(&format!(" (worker {})", status));
        }
        if let Ok(tail) = self.stderr_tail.lock() {
            if !tail.is_empty() {
                diagnostic.push_str("\nworker stderr:\n");
                diagnostic.push_str(&tail.iter().cloned().collect::<Vec<_>>().join("\n"));
            }
        }

        warn!("worker connection quarantined: {}", cause);
        self.state = ProxyState::Quarantined(diagnostic.clone());
        self.databases = None;
        match cause {
            SymdexError::ProtocolCorruption(_) => SymdexError::ProtocolCorruption(diagnostic),
            _ => SymdexError::WorkerCrash { diagnostic },
        }
    }

    /// Attach `paths` (primary first). Skipped when the running worker
    /// already has exactly these paths attached. A store that cannot be
    /// opened stops the worker, so the next call starts clean.
    pub fn set_databases(&mut self, paths: &[PathBuf]) -> Result<()> {
        if self.is_running() && self.databases.as_deref() == Some(paths) {
            debug!("databases unchanged, skipping set_databases");
            return Ok(());
        }

        self.databases = None;
        let request = Request::new(Operation::SetDatabases, vec![serde_json::to_value(paths)?]);
        match self.call(&request) {
            Ok(_) => {
                self.databases = Some(paths.to_vec());
                Ok(())
            }
            Err(err @ SymdexError::StoreOpen { .. }) => {
                if let ProxyState::Running(worker) =
                    std::mem::replace(&mut self.state, ProxyState::Idle)
                {
                    worker.stop(false);
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub fn begin_file_processing(&mut self, dbi: usize) -> Result<()> {
        self.call(&Request::new(Operation::BeginFileProcessing, vec![json!(dbi)]))?;
        Ok(())
    }

    /// Close the sweep on `dbi`. Returns the number of files removed.
    pub fn end_file_processing(&mut self, dbi: usize, prune: bool) -> Result<usize> {
        let request = Request::new(Operation::EndFileProcessing, vec![json!(dbi)])
            .with_kwarg("prune", json!(prune));
        self.call_typed(&request)
    }

    /// Returns whether the file's symbols were re-extracted
    pub fn process_file(&mut self, dbi: usize, path: &Path, force: bool) -> Result<bool> {
        let mut request = Request::new(
            Operation::ProcessFile,
            vec![json!(dbi), serde_json::to_value(path)?],
        );
        if force {
            request = request.with_kwarg("force", json!(true));
        }
        self.call_typed(&request)
    }

    pub fn query_occurrences(&mut self, symbol: &str) -> Result<Vec<Occurrence>> {
        self.call_typed(&Request::new(Operation::QueryOccurrences, vec![json!(symbol)]))
    }

    pub fn query_members(&mut self, package: &str, prefix: &str) -> Result<Vec<String>> {
        self.call_typed(&Request::new(
            Operation::QueryMembers,
            vec![json!(package), json!(prefix)],
        ))
    }

    pub fn query_packages(&mut self, prefix: &str) -> Result<Vec<String>> {
        self.call_typed(&Request::new(Operation::QueryPackages, vec![json!(prefix)]))
    }

    pub fn commit(&mut self) -> Result<()> {
        self.call(&Request::new(Operation::Commit, vec![]))?;
        Ok(())
    }
}

impl Drop for WorkerProxy {
    fn drop(&mut self) {
        // Closing stdin ends the worker's loop; wait so no zombie is left behind
        if let ProxyState::Running(worker) = std::mem::replace(&mut self.state, ProxyState::Idle) {
            worker.stop(false);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> WorkerProxy {
        WorkerProxy::with_command(WorkerCommand::new("sh").arg("-c").arg(script))
    }

    const OK_NULL: &str = r#"{"v":1,"result":{"ok":null}}"#;

    #[test]
    fn test_spawn_failure_is_not_quarantine() {
        let dir = TempDir::new().unwrap();
        let mut proxy = WorkerProxy::new(dir.path().join("no-such-worker"));
        let err = proxy.commit().unwrap_err();
        assert!(matches!(err, SymdexError::WorkerSpawn { .. }));
        assert!(!proxy.is_quarantined());
        assert!(!proxy.is_running());
    }

    #[test]
    fn test_crash_quarantines_with_stderr() {
        let mut proxy = sh("echo 'fatal: disk on fire' >&2; exit 3");
        let err = proxy.commit().unwrap_err();
        assert!(matches!(err, SymdexError::WorkerCrash { .. }));
        assert!(err.to_string().contains("disk on fire"));
        assert!(proxy.is_quarantined());

        // Later calls fail fast with the same diagnostic
        match proxy.query_packages("") {
            Err(SymdexError::Quarantined { diagnostic }) => {
                assert!(diagnostic.contains("disk on fire"));
                assert!(diagnostic.contains("exit status: 3"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_garbage_response_is_corruption() {
        let mut proxy = sh("read line; echo 'this is not json'");
        let err = proxy.commit().unwrap_err();
        assert!(matches!(err, SymdexError::ProtocolCorruption(_)));
        assert!(proxy.is_quarantined());
        assert!(matches!(
            proxy.commit(),
            Err(SymdexError::Quarantined { .. })
        ));
    }

    #[test]
    fn test_wrong_result_shape_is_corruption() {
        let mut proxy = sh(&format!("while read line; do echo '{}'; done", OK_NULL));
        // null is not a bool
        let err = proxy
            .process_file(0, Path::new("/tmp/x.py"), false)
            .unwrap_err();
        assert!(matches!(err, SymdexError::ProtocolCorruption(_)));
        assert!(proxy.is_quarantined());
    }

    #[test]
    fn test_reset_leaves_quarantine() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("started");
        // Crashes on its first life, answers on the second
        let script = format!(
            "if [ -e '{m}' ]; then while read line; do echo '{ok}'; done; else touch '{m}'; exit 1; fi",
            m = marker.display(),
            ok = OK_NULL
        );
        let mut proxy = sh(&script);
        assert!(proxy.commit().is_err());
        assert!(proxy.is_quarantined());

        proxy.reset();
        assert!(!proxy.is_quarantined());
        proxy.commit().unwrap();
        assert!(proxy.is_running());
    }

    #[test]
    fn test_set_databases_skips_repeat() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("requests.log");
        let script = format!(
            "while read line; do echo \"$line\" >> '{}'; echo '{}'; done",
            log.display(),
            OK_NULL
        );
        let mut proxy = sh(&script);
        let first = vec![dir.path().join("a.db")];
        let second = vec![dir.path().join("b.db"), dir.path().join("a.db")];

        proxy.set_databases(&first).unwrap();
        proxy.set_databases(&first).unwrap();
        proxy.set_databases(&second).unwrap();
        proxy.set_databases(&second).unwrap();
        proxy.commit().unwrap();

        let sent = std::fs::read_to_string(&log).unwrap();
        let ops: Vec<String> = sent
            .lines()
            .map(|line| serde_json::from_str::<Request>(line).unwrap().op)
            .collect();
        assert_eq!(ops, vec!["set_databases", "set_databases", "commit"]);

        // A fresh worker always gets the paths again
        proxy.reset();
        proxy.set_databases(&second).unwrap();
        let sent = std::fs::read_to_string(&log).unwrap();
        assert_eq!(sent.lines().count(), 4);
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let mut proxy = sh("i=0; while [ $i -lt 500 ]; do echo \"line $i\" >&2; i=$((i+1)); done; exit 1");
        let err = proxy.commit().unwrap_err();
        let diagnostic = err.to_string();
        assert!(diagnostic.contains("line 499"));
        assert!(!diagnostic.contains("line 299\n"));
        assert!(diagnostic.contains("line 300"));
    }
}
