// Job runs persisted through SQLite, including across reopen.

use cadence_core::config::ExecutorConfig;
use cadence_scheduler::{
    CommandRegistry, Executor, Frequency, Job, JobRepository, LogRepository, RunContext,
    TracingNotifier,
};
use cadence_store::SqliteStore;
use chrono::{Duration, Utc};

#[test]
fn run_persists_state_and_log_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("cadence.db");

    let mut job = Job::new("greet", Frequency::Minutely);
    job.params = Some("interval:5".to_string());
    job.shell_command = "echo".to_string();
    job.args = "hello".to_string();

    let report = {
        let store = SqliteStore::open(&db_path).unwrap();
        let notifier = TracingNotifier::new("cadence <cadence@localhost>");
        let exec = Executor::new(&ExecutorConfig::default(), CommandRegistry::new());
        let ctx = RunContext::new(&store, &store, &notifier, &exec);
        job.persist(&store, Utc::now()).unwrap();
        job.run(&ctx, true).unwrap()
    };

    let store = SqliteStore::open(&db_path).unwrap();
    let saved = store.get(&job.id).unwrap().unwrap();
    assert!(!saved.is_running);
    assert!(saved.last_run_successful);
    assert_eq!(saved.last_run, Some(report.run_date));
    assert_eq!(saved.next_run, Some(report.run_date + Duration::minutes(5)));

    let logs = store.for_job(&job.id).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].stdout, "hello\n");
    assert_eq!(logs[0].run_date, report.run_date);

    // not due until five minutes have passed
    assert!(store.due_jobs(report.run_date).unwrap().is_empty());
    let due = store
        .due_jobs(report.run_date + Duration::minutes(5))
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, job.id);
}

#[test]
fn running_job_is_not_due() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut job = Job::new("stuck", Frequency::Hourly);
    job.shell_command = "true".to_string();
    job.next_run = Some(Utc::now() - Duration::minutes(1));
    job.is_running = true;
    store.save(&job).unwrap();

    assert!(store.due_jobs(Utc::now()).unwrap().is_empty());

    job.is_running = false;
    store.save(&job).unwrap();
    assert_eq!(store.due_jobs(Utc::now()).unwrap().len(), 1);
}
