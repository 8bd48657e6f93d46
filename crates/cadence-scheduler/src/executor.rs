//! Running a [`CommandSpec`] and capturing what it printed.
//!
//! [`Executor::execute`] never fails. Whatever goes wrong (an unknown
//! internal command, an `Err` or a panic from one, a program that cannot be
//! spawned, a non-zero exit) ends up rendered into the captured stderr with
//! `success = false`.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, Once};

use cadence_core::config::ExecutorConfig;
use tracing::{debug, warn};

use crate::command::CommandSpec;
use crate::truncate::{capture_text, clip_middle};

/// Serializes internal command executions across the whole process.
static INTERNAL_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    /// Set while this thread runs an internal command under `catch_unwind`.
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    /// Location and stack of the last panic caught while `CAPTURING`.
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Wrap the process panic hook once. Panics raised inside an internal
/// command are recorded for the job's error report instead of printed;
/// every other panic goes to the previous hook unchanged.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !CAPTURING.with(Cell::get) {
                previous(info);
                return;
            }
            let location = info
                .location()
                .map(|l| format!("panicked at {l}"))
                .unwrap_or_else(|| "panicked".to_string());
            let trace = format!(
                "{location}\n\nStack backtrace:\n{}",
                Backtrace::force_capture()
            );
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
        }));
    });
}

/// Per-call output buffers handed to an internal command.
///
/// Both fields implement [`std::fmt::Write`], so commands can use
/// `writeln!(out.stdout, ...)?`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// An operation invocable by name from a job's `command` field.
pub trait InternalCommand: Send + Sync {
    fn run(
        &self,
        args: &[String],
        kwargs: &BTreeMap<String, String>,
        out: &mut CommandOutput,
    ) -> anyhow::Result<()>;
}

impl<F> InternalCommand for F
where
    F: Fn(&[String], &BTreeMap<String, String>, &mut CommandOutput) -> anyhow::Result<()>
        + Send
        + Sync,
{
    fn run(
        &self,
        args: &[String],
        kwargs: &BTreeMap<String, String>,
        out: &mut CommandOutput,
    ) -> anyhow::Result<()> {
        self(args, kwargs, out)
    }
}

/// Name → internal command lookup table.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn InternalCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, command: F)
    where
        F: Fn(&[String], &BTreeMap<String, String>, &mut CommandOutput) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.register_command(name, command);
    }

    pub fn register_command(
        &mut self,
        name: impl Into<String>,
        command: impl InternalCommand + 'static,
    ) {
        self.commands.insert(name.into(), Arc::new(command));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn InternalCommand>> {
        self.commands.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

/// Result of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl ExecOutcome {
    /// True when the command produced any output at all.
    pub fn has_output(&self) -> bool {
        !self.stdout.is_empty() || !self.stderr.is_empty()
    }
}

/// Render the fixed error report appended to stderr for a failed execution.
pub fn error_report(message: impl fmt::Display, detail: impl fmt::Display) -> String {
    format!("*** Error while running job: {message}\n\n{detail}\n")
}

/// Render the diagnostic appended to stderr when a process exits non-zero.
///
/// Termination by signal `N` is reported as return code `-N`.
pub fn return_code_note(code: i32) -> String {
    format!("\n\n*** Process ended with return code {code}\n\n")
}

pub struct Executor {
    shell: String,
    max_output_chars: usize,
    registry: CommandRegistry,
}

impl Executor {
    pub fn new(config: &ExecutorConfig, registry: CommandRegistry) -> Self {
        Self {
            shell: config.shell.clone(),
            max_output_chars: config.max_output_chars,
            registry,
        }
    }

    /// Run `spec` to completion, blocking the calling thread.
    pub fn execute(&self, spec: &CommandSpec) -> ExecOutcome {
        match spec {
            CommandSpec::Internal { name, args, kwargs } => self.run_internal(name, args, kwargs),
            CommandSpec::Shell { script } => {
                let mut cmd = Command::new(&self.shell);
                cmd.arg("-c").arg(script);
                self.run_process(&self.shell, cmd)
            }
            CommandSpec::Process { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                self.run_process(program, cmd)
            }
        }
    }

    fn run_internal(
        &self,
        name: &str,
        args: &[String],
        kwargs: &BTreeMap<String, String>,
    ) -> ExecOutcome {
        let Some(command) = self.registry.get(name) else {
            warn!(command = %name, "unknown internal command");
            return ExecOutcome {
                stdout: String::new(),
                stderr: error_report(
                    format!("Unknown command: {name}"),
                    format!("registered commands: {}", self.registry.names().join(", ")),
                ),
                success: false,
            };
        };

        install_panic_hook();
        let mut out = CommandOutput::default();
        let result = {
            // a panicking command is caught below, so the lock is never poisoned by one
            let _guard = INTERNAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            debug!(command = %name, "dispatching internal command");
            CAPTURING.with(|c| c.set(true));
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| command.run(args, kwargs, &mut out)));
            CAPTURING.with(|c| c.set(false));
            result
        };
        let panic_trace = PANIC_TRACE.with(|slot| slot.borrow_mut().take());

        let CommandOutput { stdout, mut stderr } = out;
        let success = match result {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                stderr.push_str(&error_report(&err, error_detail(&err)));
                false
            }
            Err(payload) => {
                let mut detail = panic_message(payload.as_ref());
                if let Some(trace) = panic_trace {
                    detail.push_str("\n\n");
                    detail.push_str(&trace);
                }
                stderr.push_str(&error_report(format!("command '{name}' panicked"), detail));
                false
            }
        };
        ExecOutcome {
            stdout: clip_middle(&stdout, self.max_output_chars),
            stderr: clip_middle(&stderr, self.max_output_chars),
            success,
        }
    }

    fn run_process(&self, program: &str, mut cmd: Command) -> ExecOutcome {
        debug!(%program, "spawning process");
        let output = match cmd.stdin(Stdio::null()).output() {
            Ok(output) => output,
            Err(err) => {
                warn!(%program, error = %err, "failed to spawn process");
                return ExecOutcome {
                    stdout: String::new(),
                    stderr: error_report(format!("failed to start '{program}'"), &err),
                    success: false,
                };
            }
        };

        let stdout = capture_text(&output.stdout, self.max_output_chars);
        let mut stderr = capture_text(&output.stderr, self.max_output_chars);
        let success = output.status.success();
        if !success {
            stderr.push_str(&return_code_note(exit_code(output.status)));
        }
        ExecOutcome {
            stdout,
            stderr,
            success,
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("shell", &self.shell)
            .field("max_output_chars", &self.max_output_chars)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Cause chain plus a stack trace. anyhow only captures one when
/// `RUST_BACKTRACE` asks for it; otherwise the trace is taken here.
fn error_detail(err: &anyhow::Error) -> String {
    match err.backtrace().status() {
        BacktraceStatus::Captured => format!("{err:?}"),
        _ => format!(
            "{err:?}\n\nStack backtrace:\n{}",
            Backtrace::force_capture()
        ),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
