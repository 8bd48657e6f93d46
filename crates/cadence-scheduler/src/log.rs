//! Per-run output records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{JobId, LogId};

/// Immutable record of one execution that produced output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub id: LogId,
    /// Owning job. Logs do not keep the job itself alive.
    pub job_id: JobId,
    pub run_date: DateTime<Utc>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl Log {
    pub fn new(
        job_id: JobId,
        run_date: DateTime<Utc>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            id: LogId::new(),
            job_id,
            run_date,
            stdout: stdout.into(),
            stderr: stderr.into(),
            success,
        }
    }

    /// Notification subject: `<job name> - <run date>`.
    pub fn subject(&self, job_name: &str) -> String {
        format!("{} - {}", job_name, self.run_date.format("%Y-%m-%d %H:%M:%S"))
    }

    /// Notification body carrying both captured streams.
    pub fn body(&self) -> String {
        format!("Output:\n{}\nError output:\n{}", self.stdout, self.stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn subject_and_body_format() {
        let run_date = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 0).unwrap();
        let log = Log::new(JobId::from("j1"), run_date, "hello\n", "", true);
        assert_eq!(log.subject("backup"), "backup - 2024-03-09 07:05:00");
        assert_eq!(log.body(), "Output:\nhello\n\nError output:\n");
    }
}
