// End-to-end runs of a Job against the in-memory repository.

use std::fmt::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cadence_core::config::ExecutorConfig;
use cadence_scheduler::{
    CommandRegistry, Executor, Frequency, Job, JobId, JobRepository, LogRepository, MemoryStore,
    Notifier, NotifyError, RunContext, SchedulerError, Subscriber,
};
use chrono::{DateTime, Duration, Utc};

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(Vec<String>, String, String)>>,
    fail: bool,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipients.to_vec(), subject.to_string(), body.to_string()));
        if self.fail {
            Err(NotifyError::Transport("smtp down".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Refuses every write.
struct ReadOnlyJobs;

impl JobRepository for ReadOnlyJobs {
    fn due_jobs(&self, _now: DateTime<Utc>) -> cadence_scheduler::Result<Vec<Job>> {
        Ok(Vec::new())
    }
    fn save(&self, _job: &Job) -> cadence_scheduler::Result<()> {
        Err(SchedulerError::Storage("read-only".to_string()))
    }
    fn get(&self, _id: &JobId) -> cadence_scheduler::Result<Option<Job>> {
        Ok(None)
    }
    fn list(&self) -> cadence_scheduler::Result<Vec<Job>> {
        Ok(Vec::new())
    }
    fn delete(&self, id: &JobId) -> cadence_scheduler::Result<()> {
        Err(SchedulerError::JobNotFound { id: id.to_string() })
    }
}

fn shell_job(name: &str, shell_command: &str, args: &str) -> Job {
    let mut job = Job::new(name, Frequency::Daily);
    job.shell_command = shell_command.to_string();
    job.args = args.to_string();
    job
}

fn executor(registry: CommandRegistry) -> Executor {
    Executor::new(&ExecutorConfig::default(), registry)
}

#[test]
fn echo_hello_succeeds_and_logs() {
    let store = MemoryStore::new();
    let notifier = RecordingNotifier::default();
    let exec = executor(CommandRegistry::new());
    let ctx = RunContext::new(&store, &store, &notifier, &exec);

    let mut job = shell_job("greet", "echo", "hello");
    job.persist(&store, Utc::now()).unwrap();

    let report = job.run(&ctx, true).unwrap();
    assert!(report.success);

    let logs = store.for_job(&job.id).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].stdout, "hello\n");
    assert_eq!(logs[0].stderr, "");
    assert!(logs[0].success);

    let saved = store.get(&job.id).unwrap().unwrap();
    assert!(!saved.is_running);
    assert!(saved.last_run_successful);
    assert_eq!(saved.last_run, Some(report.run_date));
    assert!(saved.next_run.unwrap() > report.run_date);
}

#[test]
fn false_fails_with_return_code() {
    let store = MemoryStore::new();
    let notifier = RecordingNotifier::default();
    let exec = executor(CommandRegistry::new());
    let ctx = RunContext::new(&store, &store, &notifier, &exec);

    let mut job = shell_job("fail", "false", "");
    let report = job.run(&ctx, true).unwrap();
    assert!(!report.success);

    let log = report.log.expect("diagnostic output is logged");
    assert!(!log.success);
    assert!(log.stderr.contains("*** Process ended with return code 1"));
    assert!(!store.get(&job.id).unwrap().unwrap().last_run_successful);
}

#[test]
fn unknown_internal_command_is_captured() {
    let store = MemoryStore::new();
    let notifier = RecordingNotifier::default();
    let exec = executor(CommandRegistry::new());
    let ctx = RunContext::new(&store, &store, &notifier, &exec);

    let mut job = Job::new("missing", Frequency::Daily);
    job.command = "does_not_exist".to_string();

    let report = job.run(&ctx, true).unwrap();
    assert!(!report.success);
    let log = report.log.unwrap();
    assert!(log
        .stderr
        .starts_with("*** Error while running job: Unknown command: does_not_exist"));
    assert_eq!(store.for_job(&job.id).unwrap().len(), 1);
}

#[test]
fn job_is_marked_running_during_dispatch() {
    let store = Arc::new(MemoryStore::new());
    let notifier = RecordingNotifier::default();

    let mut job = Job::new("inspect", Frequency::Hourly);
    job.command = "inspect".to_string();
    job.args = "ping mode=check".to_string();
    job.persist(store.as_ref(), Utc::now()).unwrap();

    let mut registry = CommandRegistry::new();
    let observer = Arc::clone(&store);
    let job_id = job.id.clone();
    registry.register("inspect", move |args, kwargs, out| {
        let seen = observer
            .get(&job_id)?
            .ok_or_else(|| anyhow::anyhow!("job vanished"))?;
        writeln!(out.stdout, "running={} {:?} {:?}", seen.is_running, args, kwargs)?;
        Ok(())
    });
    let exec = executor(registry);
    let ctx = RunContext::new(store.as_ref(), store.as_ref(), &notifier, &exec);

    assert!(!store.get(&job.id).unwrap().unwrap().is_running);
    let report = job.run(&ctx, true).unwrap();

    let log = report.log.unwrap();
    assert!(log.stdout.starts_with("running=true"), "{}", log.stdout);
    assert!(log.stdout.contains("[\"ping\"]"));
    assert!(log.stdout.contains("\"mode\": \"check\""));
    assert!(!store.get(&job.id).unwrap().unwrap().is_running);
    assert!(!job.is_running);
}

#[test]
fn panicking_command_still_returns_to_idle() {
    let store = MemoryStore::new();
    let notifier = RecordingNotifier::default();
    let mut registry = CommandRegistry::new();
    registry.register("explode", |_, _, _| panic!("wires crossed"));
    let exec = executor(registry);
    let ctx = RunContext::new(&store, &store, &notifier, &exec);

    let mut job = Job::new("explode", Frequency::Daily);
    job.command = "explode".to_string();
    let report = job.run(&ctx, true).unwrap();

    assert!(!report.success);
    let saved = store.get(&job.id).unwrap().unwrap();
    assert!(!saved.is_running);
    assert!(!saved.last_run_successful);
    assert!(report.log.unwrap().stderr.contains("wires crossed"));
}

#[test]
fn silent_command_writes_no_log() {
    let store = MemoryStore::new();
    let notifier = RecordingNotifier::default();
    let exec = executor(CommandRegistry::new());
    let ctx = RunContext::new(&store, &store, &notifier, &exec);

    let mut job = shell_job("quiet", "true", "");
    job.subscribers
        .push(Subscriber::new("Ada", "ada@example.com"));
    let report = job.run(&ctx, true).unwrap();

    assert!(report.success);
    assert!(report.log.is_none());
    assert!(store.for_job(&job.id).unwrap().is_empty());
    assert!(notifier.sent.lock().unwrap().is_empty());
}

#[test]
fn subscribers_are_notified_with_log_contents() {
    let store = MemoryStore::new();
    let notifier = RecordingNotifier::default();
    let exec = executor(CommandRegistry::new());
    let ctx = RunContext::new(&store, &store, &notifier, &exec);

    let mut job = shell_job("report", "echo", "done");
    job.subscribers
        .push(Subscriber::new("Ada Lovelace", "ada@example.com"));
    let report = job.run(&ctx, true).unwrap();

    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (recipients, subject, body) = &sent[0];
    assert_eq!(
        recipients,
        &vec!["\"Ada Lovelace\" <ada@example.com>".to_string()]
    );
    assert_eq!(
        subject,
        &format!("report - {}", report.run_date.format("%Y-%m-%d %H:%M:%S"))
    );
    assert_eq!(body, "Output:\ndone\n\nError output:\n");
}

#[test]
fn notification_failure_keeps_the_log() {
    let store = MemoryStore::new();
    let notifier = RecordingNotifier {
        fail: true,
        ..Default::default()
    };
    let exec = executor(CommandRegistry::new());
    let ctx = RunContext::new(&store, &store, &notifier, &exec);

    let mut job = shell_job("report", "echo", "done");
    job.subscribers
        .push(Subscriber::new("Ada", "ada@example.com"));

    assert!(job.run(&ctx, true).is_ok());
    assert_eq!(store.for_job(&job.id).unwrap().len(), 1);
}

#[test]
fn minutely_interval_schedules_five_minutes_out() {
    let store = MemoryStore::new();
    let notifier = RecordingNotifier::default();
    let exec = executor(CommandRegistry::new());
    let ctx = RunContext::new(&store, &store, &notifier, &exec);

    let mut job = shell_job("tick", "true", "");
    job.frequency = Frequency::Minutely;
    job.params = Some("interval:5".to_string());

    let report = job.run(&ctx, true).unwrap();
    let last_run = job.last_run.unwrap();
    assert_eq!(last_run, report.run_date);
    assert_eq!(job.next_run, Some(last_run + Duration::minutes(5)));
}

#[test]
fn run_without_schedule_leaves_dates_alone() {
    let store = MemoryStore::new();
    let notifier = RecordingNotifier::default();
    let exec = executor(CommandRegistry::new());
    let ctx = RunContext::new(&store, &store, &notifier, &exec);

    let mut job = shell_job("manual", "true", "");
    let planned = Utc::now() + Duration::days(3);
    job.last_run = Some(Utc::now() - Duration::days(1));
    job.next_run = Some(planned);
    let before = job.last_run;

    let report = job.run(&ctx, false).unwrap();
    assert_eq!(report.next_run, Some(planned));
    assert_eq!(job.last_run, before);
    assert_eq!(store.get(&job.id).unwrap().unwrap().next_run, Some(planned));
}

#[test]
fn invalid_command_is_rejected_before_marking_running() {
    let store = MemoryStore::new();
    let notifier = RecordingNotifier::default();
    let exec = executor(CommandRegistry::new());
    let ctx = RunContext::new(&store, &store, &notifier, &exec);

    let mut job = shell_job("both", "echo", "");
    job.command = "echo".to_string();
    assert!(matches!(
        job.run(&ctx, true),
        Err(SchedulerError::InvalidCommand(_))
    ));

    let mut unbalanced = shell_job("quote", "echo 'oops", "");
    assert!(unbalanced.run(&ctx, true).is_err());

    assert!(store.list().unwrap().is_empty());
    assert!(!job.is_running);
}

#[test]
fn failed_running_save_executes_nothing() {
    let logs = MemoryStore::new();
    let notifier = RecordingNotifier::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut registry = CommandRegistry::new();
    registry.register("count", move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let exec = executor(registry);
    let ctx = RunContext::new(&ReadOnlyJobs, &logs, &notifier, &exec);

    let mut job = Job::new("count", Frequency::Daily);
    job.command = "count".to_string();
    let before = job.clone();

    assert!(matches!(
        job.run(&ctx, true),
        Err(SchedulerError::Storage(_))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    // no half-applied schedule left behind on the in-memory job
    assert_eq!(job, before);
    assert_eq!(job.next_run, None);
}

#[test]
fn disabled_job_run_manually_keeps_no_schedule() {
    let store = MemoryStore::new();
    let notifier = RecordingNotifier::default();
    let exec = executor(CommandRegistry::new());
    let ctx = RunContext::new(&store, &store, &notifier, &exec);

    let mut job = shell_job("off", "true", "");
    job.set_disabled(true);
    job.run(&ctx, true).unwrap();

    let saved = store.get(&job.id).unwrap().unwrap();
    assert!(saved.disabled);
    assert_eq!(saved.next_run, None);
    assert!(store
        .due_jobs(Utc::now() + Duration::days(365))
        .unwrap()
        .is_empty());
}
