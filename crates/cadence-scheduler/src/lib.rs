//! `cadence-scheduler`: scheduling, running and logging of recurring jobs.
//!
//! # Overview
//!
//! A [`Job`] pairs a command with a recurrence rule ([`Frequency`] plus a
//! compact parameter string). The outer driver asks a [`JobRepository`] for
//! due jobs and calls [`Job::run`] on each; the run marks the job running,
//! executes its [`CommandSpec`] through the [`Executor`], restores it to idle,
//! advances the schedule and, when the command printed anything, writes a
//! [`Log`] and notifies subscribers.
//!
//! # Run states
//!
//! | State      | Meaning                                              |
//! |------------|------------------------------------------------------|
//! | `Disabled` | Never due; `next_run` is always empty                |
//! | `Idle`     | Waiting for `next_run`                               |
//! | `Running`  | An execution is in flight (persisted before it starts) |
//!
//! # Command modes
//!
//! | Mode       | Source fields                       | Execution                   |
//! |------------|-------------------------------------|-----------------------------|
//! | `Internal` | `command` + `args`                  | [`CommandRegistry`] lookup  |
//! | `Shell`    | `shell_command` + `run_in_shell`    | `<shell> -c <escaped line>` |
//! | `Process`  | `shell_command`                     | argv split by shell quoting |

pub mod command;
pub mod error;
pub mod executor;
pub mod job;
pub mod log;
pub mod notify;
pub mod recurrence;
pub mod repository;
pub mod truncate;
pub mod types;

pub use command::CommandSpec;
pub use error::{NotifyError, Result, SchedulerError};
pub use executor::{CommandOutput, CommandRegistry, ExecOutcome, Executor, InternalCommand};
pub use job::{Job, RunContext, RunReport};
pub use log::Log;
pub use notify::{Notifier, TracingNotifier};
pub use recurrence::{next_after, ParameterSet, RecurrenceRule};
pub use repository::{JobRepository, LogRepository, MemoryStore};
pub use types::{Frequency, JobId, JobState, LogId, Subscriber};
