use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind, Result};
use crate::orchestrator::Outcome;
use crate::output::{OutputTail, sanitize_line};

const POLL: Duration = Duration::from_millis(50);
const TAIL_LINES: usize = 40;
/// Output silence after the child exits that ends collection.
const EXIT_DRAIN: Duration = Duration::from_millis(200);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub enum ExecEvent {
    ComponentStarted {
        name: String,
    },
    ComponentLog {
        name: String,
        line: String,
    },
    AttemptFailed {
        name: String,
        attempt: u32,
        max_attempts: u32,
        kind: ErrorKind,
        error: String,
    },
    ComponentFinished {
        name: String,
        outcome: Outcome,
        attempts: u32,
        elapsed_ms: u128,
    },
    RunDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Line-oriented progress on stdout, with a summary block at the end.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    by_outcome: BTreeMap<&'static str, usize>,
    failed: Vec<String>,
    log_lines: usize,
    attempts: u32,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let mut summary = None::<String>;
        match ev {
            ExecEvent::ComponentStarted { name } => {
                if let Ok(mut s) = self.state.lock() {
                    s.started_at.get_or_insert_with(Instant::now);
                }
                println!("RUN: {name}");
            }
            ExecEvent::ComponentLog { name, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines = s.log_lines.saturating_add(1);
                }
                println!("[{name}] {line}");
            }
            ExecEvent::AttemptFailed {
                name,
                attempt,
                max_attempts,
                kind,
                error,
            } => {
                println!(
                    "RETRY: {name} attempt {attempt}/{max_attempts} failed ({}): {error}",
                    kind.as_str()
                );
            }
            ExecEvent::ComponentFinished {
                name,
                outcome,
                attempts,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    *s.by_outcome.entry(outcome.label()).or_default() += 1;
                    s.attempts = s.attempts.saturating_add(attempts);
                    if outcome.is_failure() {
                        s.failed.push(name.clone());
                    }
                }
                match &outcome {
                    Outcome::Skipped => println!("SKIP: {name} (already satisfied)"),
                    Outcome::Adopted => println!("DONE: {name} (adopted existing install)"),
                    Outcome::Disabled => println!("SKIP: {name} (disabled)"),
                    Outcome::Applied => {
                        println!("DONE: {name} ({elapsed_ms}ms, {attempts} attempt(s))")
                    }
                    Outcome::WouldApply { reason } => println!("PLAN: {name} would apply ({reason})"),
                    Outcome::Failed { kind, reason } => println!(
                        "FAIL: {name} ({elapsed_ms}ms, {attempts} attempt(s), {}) {reason}",
                        kind.as_str()
                    ),
                    Outcome::DependencyFailed { dependency } => {
                        println!("SKIP: {name} (dependency '{dependency}' failed)")
                    }
                    Outcome::Cancelled => println!("CANCEL: {name}"),
                }
            }
            ExecEvent::RunDone { ok, error } => {
                if let Ok(mut s) = self.state.lock() {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    let mut out = String::from("SUMMARY:\n");
                    out.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                    let counts = s
                        .by_outcome
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(" ");
                    out.push_str(&format!("  components: {counts}\n"));
                    out.push_str(&format!("  attempts: {}\n", s.attempts));
                    out.push_str(&format!("  logs: {}\n", s.log_lines));
                    out.push_str(&format!(
                        "  elapsed: {}\n",
                        format_elapsed_hms(wall.as_secs())
                    ));
                    if !s.failed.is_empty() {
                        let mut failed = s.failed.clone();
                        failed.sort();
                        failed.dedup();
                        out.push_str(&format!("  failed: {}\n", failed.join(", ")));
                    }
                    if let Some(e) = error.as_deref() {
                        out.push_str(&format!("  error: {e}\n"));
                    }
                    summary = Some(out);
                    *s = StdoutSinkState::default();
                }
            }
        }
        if let Some(summary) = summary {
            print!("{summary}");
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Keeps every event; used by tests and by callers that render their own report.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ExecEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn logs_for(&self, component: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                ExecEvent::ComponentLog { name, line } if name == component => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl ExecSink for MemorySink {
    fn emit(&self, ev: ExecEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(ev);
        }
    }
}

/// Result of a subprocess that ran to completion.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub tail: OutputTail,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub cancel: Arc<AtomicBool>,
    pub sink: Arc<dyn ExecSink>,
    pub current_component: Option<String>,
    pub timeout: Duration,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            cancel: Arc::new(AtomicBool::new(false)),
            sink,
            current_component: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || crate::signal::interrupted()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn set_component(&mut self, name: impl Into<String>, timeout: Duration) {
        self.current_component = Some(name.into());
        self.timeout = timeout;
    }

    pub fn log(&self, msg: &str) {
        let name = self
            .current_component
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::ComponentLog {
            name,
            line: msg.to_string(),
        });
    }

    /// Run a subprocess to completion under the context's timeout.
    ///
    /// Output lines are sanitized, forwarded to the sink, and the last lines
    /// kept in the returned tail. A non-zero exit is returned as `Ok`; the
    /// caller decides what it means. Spawn failures, timeouts and
    /// cancellation are errors, and the latter two kill the child's process
    /// group.
    pub fn run_cmd(&self, cmd: Command) -> Result<CmdOutput> {
        self.run_cmd_observed(cmd, |_| {})
    }

    /// [`run_cmd`](Self::run_cmd), also handing every output line to
    /// `observe` as it arrives.
    pub fn run_cmd_observed(
        &self,
        mut cmd: Command,
        mut observe: impl FnMut(&str),
    ) -> Result<CmdOutput> {
        if self.cancelled() {
            return Err(Error::cancelled());
        }
        tracing::debug!(component = ?self.current_component, command = ?cmd, "spawning");

        // Own process group so a timeout can take down the whole subtree.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let program = cmd.get_program().to_string_lossy().into_owned();
        let mut child = cmd
            // A child in its own process group that reads the TTY would be stopped by SIGTTIN.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::not_found(format!("command not found: {program}"))
                } else {
                    Error::transient(format!("failed to spawn {program}: {e}"))
                }
            })?;
        let pgid = child.id();

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        let deadline = Instant::now() + self.timeout;
        let mut tail = OutputTail::new(TAIL_LINES);
        let mut stop: Option<Error> = None;
        let mut status: Option<ExitStatus> = None;
        // Set once the child has exited; reset by every line read after that.
        let mut quiet_since: Option<Instant> = None;

        // Pump output until both streams close, or until they go quiet after
        // the child exits: a background process it started may hold them open.
        loop {
            if quiet_since.is_none() {
                if let Some(e) = self.interruption(deadline, &program) {
                    stop = Some(e);
                    break;
                }
                match child.try_wait() {
                    Ok(Some(s)) => {
                        status = Some(s);
                        quiet_since = Some(Instant::now());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        stop = Some(Error::transient(format!("wait failed: {e}")));
                        break;
                    }
                }
            }
            let now = Instant::now();
            let wait = match quiet_since {
                Some(t) => {
                    let left = (t + EXIT_DRAIN).saturating_duration_since(now);
                    if left.is_zero() || now >= deadline {
                        break;
                    }
                    left.min(POLL)
                }
                None => deadline.saturating_duration_since(now).min(POLL),
            };
            match rx.recv_timeout(wait) {
                Ok(line) => {
                    let line = sanitize_line(&line);
                    if line.is_empty() {
                        continue;
                    }
                    self.log(&line);
                    observe(&line);
                    tail.push(line);
                    if quiet_since.is_some() {
                        quiet_since = Some(Instant::now());
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Streams can close before the process exits (daemonizing children).
        while stop.is_none() && status.is_none() {
            match child.try_wait() {
                Ok(Some(s)) => status = Some(s),
                Ok(None) => {
                    if let Some(e) = self.interruption(deadline, &program) {
                        stop = Some(e);
                        break;
                    }
                    std::thread::sleep(POLL);
                }
                Err(e) => stop = Some(Error::transient(format!("wait failed: {e}"))),
            }
        }

        if let Some(e) = stop {
            kill_pgroup(pgid, false);
            kill_pgroup(pgid, true);
            let _ = child.wait();
            return Err(e);
        }

        match status {
            Some(status) => Ok(CmdOutput { status, tail }),
            None => Err(Error::transient(format!("{program}: no exit status"))),
        }
    }

    fn interruption(&self, deadline: Instant, program: &str) -> Option<Error> {
        if self.cancelled() {
            return Some(Error::cancelled());
        }
        if Instant::now() >= deadline {
            return Some(Error::timeout(format!(
                "{program} timed out after {}s",
                self.timeout.as_secs()
            )));
        }
        None
    }
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}

pub fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
