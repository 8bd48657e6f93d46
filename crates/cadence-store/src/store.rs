//! [`SqliteStore`]: the job and log repositories backed by one SQLite file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use cadence_scheduler::{
    Frequency, Job, JobId, JobRepository, Log, LogId, LogRepository, SchedulerError, Subscriber,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::db::init_db;
use crate::error::{Result, StoreError};

const JOB_COLUMNS: &str = "id, name, frequency, params, command, shell_command, run_in_shell,
     args, disabled, next_run, last_run, is_running, last_run_successful, subscribers";

/// Jobs and logs in one SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "job store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn query_jobs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let jobs = stmt
            .query_map(params, job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn upsert_job(&self, job: &Job) -> Result<()> {
        let subscribers = serde_json::to_string(&job.subscribers)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs
                (id, name, frequency, params, command, shell_command, run_in_shell,
                 args, disabled, next_run, last_run, is_running, last_run_successful, subscribers)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                frequency = excluded.frequency,
                params = excluded.params,
                command = excluded.command,
                shell_command = excluded.shell_command,
                run_in_shell = excluded.run_in_shell,
                args = excluded.args,
                disabled = excluded.disabled,
                next_run = excluded.next_run,
                last_run = excluded.last_run,
                is_running = excluded.is_running,
                last_run_successful = excluded.last_run_successful,
                subscribers = excluded.subscribers",
            params![
                job.id.as_str(),
                job.name,
                job.frequency.as_str(),
                job.params,
                job.command,
                job.shell_command,
                job.run_in_shell,
                job.args,
                job.disabled,
                job.next_run.map(timestamp),
                job.last_run.map(timestamp),
                job.is_running,
                job.last_run_successful,
                subscribers,
            ],
        )?;
        debug!(job_id = %job.id, is_running = job.is_running, "job saved");
        Ok(())
    }

    fn delete_job(&self, id: &JobId) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [id.as_str()])?;
        Ok(n > 0)
    }

    fn insert_log(&self, log: &Log) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO logs (id, job_id, run_date, stdout, stderr, success)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                log.id.as_str(),
                log.job_id.as_str(),
                timestamp(log.run_date),
                log.stdout,
                log.stderr,
                log.success,
            ],
        )?;
        Ok(())
    }

    fn logs_for(&self, job_id: &JobId) -> Result<Vec<Log>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, job_id, run_date, stdout, stderr, success FROM logs
             WHERE job_id = ?1 ORDER BY run_date DESC",
        )?;
        let logs = stmt
            .query_map([job_id.as_str()], |row| {
                Ok(Log {
                    id: LogId::from(row.get::<_, String>(0)?),
                    job_id: JobId::from(row.get::<_, String>(1)?),
                    run_date: parse_timestamp(row, 2)?,
                    stdout: row.get(3)?,
                    stderr: row.get(4)?,
                    success: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }
}

impl JobRepository for SqliteStore {
    fn due_jobs(&self, now: DateTime<Utc>) -> cadence_scheduler::Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE next_run IS NOT NULL AND next_run <= ?1
               AND disabled = 0 AND is_running = 0
             ORDER BY disabled, next_run"
        );
        Ok(self.query_jobs(&sql, [timestamp(now)])?)
    }

    fn save(&self, job: &Job) -> cadence_scheduler::Result<()> {
        Ok(self.upsert_job(job)?)
    }

    fn get(&self, id: &JobId) -> cadence_scheduler::Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let conn = self.conn()?;
        let job = conn
            .query_row(&sql, [id.as_str()], job_from_row)
            .optional()
            .map_err(StoreError::from)?;
        Ok(job)
    }

    fn list(&self) -> cadence_scheduler::Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             ORDER BY disabled, next_run IS NULL, next_run, name"
        );
        Ok(self.query_jobs(&sql, [])?)
    }

    fn delete(&self, id: &JobId) -> cadence_scheduler::Result<()> {
        if !self.delete_job(id)? {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }
}

impl LogRepository for SqliteStore {
    fn create(&self, log: &Log) -> cadence_scheduler::Result<()> {
        Ok(self.insert_log(log)?)
    }

    fn for_job(&self, job_id: &JobId) -> cadence_scheduler::Result<Vec<Log>> {
        Ok(self.logs_for(job_id)?)
    }
}

/// Fixed-width UTC timestamp: `2024-01-15T09:30:00.000000Z`.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => parse_timestamp(row, idx).map(Some),
        None => Ok(None),
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let frequency: Frequency = row
        .get::<_, String>(2)?
        .parse()
        .map_err(|e: SchedulerError| conversion_error(2, e))?;
    let subscribers: Vec<Subscriber> = serde_json::from_str(&row.get::<_, String>(13)?)
        .map_err(|e| conversion_error(13, e))?;

    Ok(Job {
        id: JobId::from(row.get::<_, String>(0)?),
        name: row.get(1)?,
        frequency,
        params: row.get(3)?,
        command: row.get(4)?,
        shell_command: row.get(5)?,
        run_in_shell: row.get(6)?,
        args: row.get(7)?,
        disabled: row.get(8)?,
        next_run: parse_optional_timestamp(row, 9)?,
        last_run: parse_optional_timestamp(row, 10)?,
        is_running: row.get(11)?,
        last_run_successful: row.get(12)?,
        subscribers,
    })
}
