use std::sync::Arc;
use std::time::Duration;

use cadence_core::CadenceConfig;
use cadence_scheduler::{Executor, JobRepository, RunContext, TracingNotifier};
use cadence_store::SqliteStore;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::builtins;

/// Everything a run needs, shared between the loop and its blocking ticks.
pub struct Services {
    pub store: SqliteStore,
    pub executor: Executor,
    pub notifier: TracingNotifier,
}

impl Services {
    pub fn new(config: &CadenceConfig, store: SqliteStore) -> Self {
        Self {
            store,
            executor: Executor::new(&config.executor, builtins::registry()),
            notifier: TracingNotifier::new(config.notify.sender.clone()),
        }
    }

    pub fn context(&self) -> RunContext<'_> {
        RunContext::new(&self.store, &self.store, &self.notifier, &self.executor)
    }
}

/// Run every job that is due now, one after another. Returns how many ran.
///
/// A job whose run fails (bad configuration, storage fault) is logged and
/// skipped; the rest of the batch still runs.
pub fn tick(services: &Services) -> anyhow::Result<usize> {
    let due = services.store.due_jobs(Utc::now())?;
    if due.is_empty() {
        return Ok(0);
    }
    debug!(count = due.len(), "due jobs");

    let ctx = services.context();
    let mut ran = 0;
    for mut job in due {
        match job.run(&ctx, true) {
            Ok(_) => ran += 1,
            Err(e) => error!(job_id = %job.id, name = %job.name, error = %e, "job run failed"),
        }
    }
    Ok(ran)
}

/// Poll every `poll_interval` until `shutdown` broadcasts `true`.
pub async fn run_loop(
    services: Arc<Services>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = poll_interval.as_secs(), "driver started");

    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let services = Arc::clone(&services);
                match tokio::task::spawn_blocking(move || tick(&services)).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(ran)) => info!(ran, "tick complete"),
                    Ok(Err(e)) => error!("driver tick error: {e}"),
                    Err(e) => error!("driver tick task failed: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("driver shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_scheduler::{Frequency, Job, LogRepository};
    use chrono::Duration as ChronoDuration;

    fn services() -> Services {
        Services::new(
            &CadenceConfig::default(),
            SqliteStore::open_in_memory().unwrap(),
        )
    }

    #[test]
    fn tick_runs_due_jobs_and_skips_broken_ones() {
        let services = services();

        let mut good = Job::new("good", Frequency::Daily);
        good.command = "echo".to_string();
        good.args = "hi".to_string();
        good.next_run = Some(Utc::now() - ChronoDuration::minutes(1));
        services.store.save(&good).unwrap();

        let mut broken = Job::new("broken", Frequency::Daily);
        broken.next_run = Some(Utc::now() - ChronoDuration::minutes(2));
        services.store.save(&broken).unwrap();

        assert_eq!(tick(&services).unwrap(), 1);

        let logs = services.store.for_job(&good.id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].stdout, "hi\n");

        // good is rescheduled a day out, broken keeps failing at entry
        assert_eq!(tick(&services).unwrap(), 0);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let services = Arc::new(services());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(services, Duration::from_secs(3600), rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop exits")
            .unwrap();
    }
}
