//! The job aggregate and its run orchestration.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::CommandSpec;
use crate::error::Result;
use crate::executor::{error_report, ExecOutcome, Executor};
use crate::log::Log;
use crate::notify::Notifier;
use crate::recurrence::{ParameterSet, RecurrenceRule};
use crate::repository::{JobRepository, LogRepository};
use crate::types::{Frequency, JobId, JobState, Subscriber};

/// A recurring command with its schedule and run state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub frequency: Frequency,
    /// Recurrence parameters, e.g. `interval:15` or `byhour:9;byminute:0,30`.
    pub params: Option<String>,
    /// Internal command name. Mutually exclusive with `shell_command`.
    pub command: String,
    pub shell_command: String,
    pub run_in_shell: bool,
    /// Whitespace-separated tokens; `key=value` tokens are keyword arguments
    /// for internal commands.
    pub args: String,
    pub disabled: bool,
    pub next_run: Option<DateTime<Utc>>,
    /// Start of the most recent execution that updated the schedule.
    pub last_run: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub last_run_successful: bool,
    pub subscribers: Vec<Subscriber>,
}

/// Collaborators needed by [`Job::run`].
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub jobs: &'a dyn JobRepository,
    pub logs: &'a dyn LogRepository,
    pub notifier: &'a dyn Notifier,
    pub executor: &'a Executor,
}

impl<'a> RunContext<'a> {
    pub fn new(
        jobs: &'a dyn JobRepository,
        logs: &'a dyn LogRepository,
        notifier: &'a dyn Notifier,
        executor: &'a Executor,
    ) -> Self {
        Self {
            jobs,
            logs,
            notifier,
            executor,
        }
    }
}

/// What one call to [`Job::run`] did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_date: DateTime<Utc>,
    pub success: bool,
    /// Present only when the command printed something.
    pub log: Option<Log>,
    /// Schedule after the run (unchanged when the schedule was not persisted).
    pub next_run: Option<DateTime<Utc>>,
}

impl Job {
    /// A new enabled job with no command and no schedule yet.
    pub fn new(name: impl Into<String>, frequency: Frequency) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            frequency,
            params: None,
            command: String::new(),
            shell_command: String::new(),
            run_in_shell: false,
            args: String::new(),
            disabled: false,
            next_run: None,
            last_run: None,
            is_running: false,
            last_run_successful: true,
            subscribers: Vec::new(),
        }
    }

    pub fn state(&self) -> JobState {
        if self.is_running {
            JobState::Running
        } else if self.disabled {
            JobState::Disabled
        } else {
            JobState::Idle
        }
    }

    /// Whether the driver should pick this job up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.disabled && !self.is_running && self.next_run.is_some_and(|next| next <= now)
    }

    /// Disabling clears `next_run`; re-enabling leaves it for the next save
    /// to compute.
    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
        if disabled {
            self.next_run = None;
        }
    }

    /// Recurrence rule anchored at `dtstart`.
    pub fn rule(&self, dtstart: DateTime<Utc>) -> Result<RecurrenceRule> {
        let params = ParameterSet::parse(self.params.as_deref().unwrap_or_default())?;
        RecurrenceRule::new(self.frequency, &params, dtstart)
    }

    /// What to execute, validated. The only place a [`CommandSpec`] is built.
    pub fn command_spec(&self) -> Result<CommandSpec> {
        CommandSpec::build(&self.command, &self.shell_command, self.run_in_shell, &self.args)
    }

    /// Normalise the schedule before a write.
    ///
    /// A disabled job never keeps a `next_run`. An enabled job without one
    /// gets the first occurrence after `last_run`, with `last_run` defaulting
    /// to `now`.
    pub fn prepare_save(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.disabled {
            self.next_run = None;
            return Ok(());
        }
        let last_run = *self.last_run.get_or_insert(now);
        if self.next_run.is_none() {
            self.next_run = self.rule(last_run)?.after(last_run);
        }
        Ok(())
    }

    /// [`prepare_save`](Self::prepare_save) followed by a repository write.
    pub fn persist(&mut self, jobs: &dyn JobRepository, now: DateTime<Utc>) -> Result<()> {
        self.prepare_save(now)?;
        jobs.save(self)
    }

    /// Execute the job once.
    ///
    /// With `persist_schedule` the run also advances `last_run` and
    /// `next_run`; without it only the run flags change. Command failures are
    /// recorded in the outcome and the log, never returned. Errors are
    /// configuration problems (raised before anything is persisted) or
    /// repository failures.
    pub fn run(&mut self, ctx: &RunContext<'_>, persist_schedule: bool) -> Result<RunReport> {
        let spec = self.command_spec()?;
        let run_date = Utc::now().trunc_subsecs(0);
        let rule = if persist_schedule {
            Some(self.rule(run_date)?)
        } else {
            None
        };

        info!(job_id = %self.id, name = %self.name, command = %spec, "job started");
        let idle = self.clone();
        self.is_running = true;
        if let Err(e) = self.persist(ctx.jobs, run_date) {
            *self = idle;
            return Err(e);
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| ctx.executor.execute(&spec)))
            .unwrap_or_else(|_| ExecOutcome {
                stdout: String::new(),
                stderr: error_report("executor panicked", &spec),
                success: false,
            });

        self.is_running = false;
        self.last_run_successful = outcome.success;
        self.persist(ctx.jobs, run_date)?;

        if let Some(rule) = rule {
            self.last_run = Some(run_date);
            self.next_run = rule.after(run_date);
            self.persist(ctx.jobs, run_date)?;
            debug!(job_id = %self.id, next_run = ?self.next_run, "schedule advanced");
        }

        if outcome.success {
            info!(job_id = %self.id, name = %self.name, "job finished");
        } else {
            warn!(job_id = %self.id, name = %self.name, "job failed");
        }

        let log = if outcome.has_output() {
            let log = Log::new(
                self.id.clone(),
                run_date,
                outcome.stdout,
                outcome.stderr,
                self.last_run_successful,
            );
            ctx.logs.create(&log)?;
            self.notify_subscribers(ctx.notifier, &log);
            Some(log)
        } else {
            None
        };

        Ok(RunReport {
            run_date,
            success: self.last_run_successful,
            log,
            next_run: self.next_run,
        })
    }

    fn notify_subscribers(&self, notifier: &dyn Notifier, log: &Log) {
        if self.subscribers.is_empty() {
            return;
        }
        let recipients: Vec<String> = self.subscribers.iter().map(Subscriber::address).collect();
        if let Err(e) = notifier.notify(&recipients, &log.subject(&self.name), &log.body()) {
            warn!(job_id = %self.id, error = %e, "failed to notify subscribers");
        }
    }

    /// Human-readable time until the next run, relative to `now`.
    pub fn time_until(&self, now: DateTime<Utc>) -> String {
        if self.disabled {
            return "never (disabled)".to_string();
        }
        let Some(next_run) = self.next_run else {
            return "never".to_string();
        };
        let secs = (next_run - now).num_seconds();
        if next_run < now {
            "due".to_string()
        } else if secs < 60 {
            plural(secs, "second")
        } else {
            coarse_duration(secs)
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.disabled {
            write!(f, "{} - disabled", self.name)
        } else {
            write!(f, "{} - {}", self.name, self.time_until(Utc::now()))
        }
    }
}

const UNITS: [(i64, &str); 6] = [
    (60 * 60 * 24 * 365, "year"),
    (60 * 60 * 24 * 30, "month"),
    (60 * 60 * 24 * 7, "week"),
    (60 * 60 * 24, "day"),
    (60 * 60, "hour"),
    (60, "minute"),
];

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("{n} {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

/// Largest non-zero unit plus the next smaller one when non-zero.
fn coarse_duration(secs: i64) -> String {
    let Some(i) = UNITS.iter().position(|(size, _)| secs / size > 0) else {
        return plural(0, "minute");
    };
    let (size, unit) = UNITS[i];
    let count = secs / size;
    let mut out = plural(count, unit);
    if let Some(&(next_size, next_unit)) = UNITS.get(i + 1) {
        let rest = (secs - count * size) / next_size;
        if rest > 0 {
            out.push_str(", ");
            out.push_str(&plural(rest, next_unit));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn state_follows_flags() {
        let mut job = Job::new("j", Frequency::Daily);
        assert_eq!(job.state(), JobState::Idle);
        job.is_running = true;
        assert_eq!(job.state(), JobState::Running);
        job.is_running = false;
        job.set_disabled(true);
        assert_eq!(job.state(), JobState::Disabled);
    }

    #[test]
    fn disabled_job_saves_without_next_run() {
        let mut job = Job::new("j", Frequency::Daily);
        job.next_run = Some(at(12, 0, 0));
        job.disabled = true;
        job.prepare_save(at(10, 0, 0)).unwrap();
        assert_eq!(job.next_run, None);
    }

    #[test]
    fn enabled_job_without_next_run_gets_one() {
        let mut job = Job::new("j", Frequency::Hourly);
        job.prepare_save(at(10, 30, 0)).unwrap();
        assert_eq!(job.last_run, Some(at(10, 30, 0)));
        assert_eq!(job.next_run, Some(at(11, 30, 0)));
    }

    #[test]
    fn explicit_next_run_is_kept() {
        let mut job = Job::new("j", Frequency::Hourly);
        job.next_run = Some(at(23, 0, 0));
        job.prepare_save(at(10, 0, 0)).unwrap();
        assert_eq!(job.next_run, Some(at(23, 0, 0)));
    }

    #[test]
    fn re_enabling_recomputes_from_last_run() {
        let mut job = Job::new("j", Frequency::Minutely);
        job.params = Some("interval:5".to_string());
        job.last_run = Some(at(9, 0, 0));
        job.set_disabled(true);
        job.prepare_save(at(9, 1, 0)).unwrap();
        assert_eq!(job.next_run, None);

        job.set_disabled(false);
        job.prepare_save(at(9, 2, 0)).unwrap();
        assert_eq!(job.next_run, Some(at(9, 5, 0)));
    }

    #[test]
    fn bad_params_fail_the_save() {
        let mut job = Job::new("j", Frequency::Daily);
        job.params = Some("byhour:x".to_string());
        assert!(job.prepare_save(at(0, 0, 0)).is_err());
    }

    #[test]
    fn is_due_checks_all_flags() {
        let now = at(12, 0, 0);
        let mut job = Job::new("j", Frequency::Daily);
        assert!(!job.is_due(now));
        job.next_run = Some(now);
        assert!(job.is_due(now));
        job.is_running = true;
        assert!(!job.is_due(now));
        job.is_running = false;
        job.disabled = true;
        assert!(!job.is_due(now));
    }

    #[test]
    fn time_until_strings() {
        let now = at(12, 0, 0);
        let mut job = Job::new("j", Frequency::Daily);
        assert_eq!(job.time_until(now), "never");

        job.next_run = Some(now - Duration::seconds(1));
        assert_eq!(job.time_until(now), "due");

        job.next_run = Some(now + Duration::seconds(30));
        assert_eq!(job.time_until(now), "30 seconds");

        job.next_run = Some(now + Duration::seconds(1));
        assert_eq!(job.time_until(now), "1 second");

        job.next_run = Some(now + Duration::minutes(1));
        assert_eq!(job.time_until(now), "1 minute");

        job.next_run = Some(now + Duration::hours(2) + Duration::minutes(5));
        assert_eq!(job.time_until(now), "2 hours, 5 minutes");

        job.next_run = Some(now + Duration::days(1) + Duration::hours(3));
        assert_eq!(job.time_until(now), "1 day, 3 hours");

        job.next_run = Some(now + Duration::days(15));
        assert_eq!(job.time_until(now), "2 weeks, 1 day");

        job.next_run = Some(now + Duration::days(400));
        assert_eq!(job.time_until(now), "1 year, 1 month");

        job.set_disabled(true);
        assert_eq!(job.time_until(now), "never (disabled)");
    }

    #[test]
    fn display_names_job() {
        let mut job = Job::new("nightly backup", Frequency::Daily);
        job.next_run = Some(Utc::now() - Duration::hours(1));
        assert_eq!(job.to_string(), "nightly backup - due");
        job.set_disabled(true);
        assert_eq!(job.to_string(), "nightly backup - disabled");
    }

    #[test]
    fn command_spec_validates_choice() {
        let mut job = Job::new("j", Frequency::Daily);
        assert!(job.command_spec().is_err());
        job.command = "echo".to_string();
        assert!(job.command_spec().unwrap().is_internal());
    }
}
