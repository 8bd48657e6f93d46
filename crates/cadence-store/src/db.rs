//! Schema setup.

use rusqlite::Connection;

use crate::error::Result;

/// Initialise the job and log schema in `conn`. Idempotent.
///
/// Timestamps are stored as fixed-width RFC 3339 UTC text (microsecond
/// precision), so comparing the strings compares the instants.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                  TEXT    NOT NULL PRIMARY KEY,
            name                TEXT    NOT NULL,
            frequency           TEXT    NOT NULL,   -- YEARLY .. SECONDLY
            params              TEXT,               -- key:v1,v2;key2:v3 or NULL
            command             TEXT    NOT NULL DEFAULT '',
            shell_command       TEXT    NOT NULL DEFAULT '',
            run_in_shell        INTEGER NOT NULL DEFAULT 0,
            args                TEXT    NOT NULL DEFAULT '',
            disabled            INTEGER NOT NULL DEFAULT 0,
            next_run            TEXT,
            last_run            TEXT,
            is_running          INTEGER NOT NULL DEFAULT 0,
            last_run_successful INTEGER NOT NULL DEFAULT 1,
            subscribers         TEXT    NOT NULL DEFAULT '[]'   -- JSON array
        ) STRICT;

        -- due-job polling: WHERE disabled = 0 AND next_run <= ?
        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (disabled, next_run);

        CREATE TABLE IF NOT EXISTS logs (
            id       TEXT    NOT NULL PRIMARY KEY,
            job_id   TEXT    NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            run_date TEXT    NOT NULL,
            stdout   TEXT    NOT NULL DEFAULT '',
            stderr   TEXT    NOT NULL DEFAULT '',
            success  INTEGER NOT NULL DEFAULT 1
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_logs_job ON logs (job_id, run_date);
        ",
    )?;
    Ok(())
}
