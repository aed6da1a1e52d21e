use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::models::{Phase, StepDisposition, StepRecord};

/// Step outcomes of every run on this machine, kept across reboots so the
/// whole multi-phase history can be read back.
#[derive(Debug)]
pub struct RunJournal {
    path: PathBuf,
    max_rows: usize,
}

impl RunJournal {
    pub fn open(path: PathBuf) -> Result<Self> {
        let journal = Self {
            path,
            max_rows: 5_000,
        };
        journal.init()?;
        Ok(journal)
    }

    pub fn append(&self, record: &StepRecord) -> Result<()> {
        let conn = self.open_connection()?;
        conn.execute(
            "INSERT INTO steps (run_id, phase, step, disposition, detail, timestamp_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.run_id,
                record.phase.as_flag(),
                record.step,
                disposition_label(record.disposition),
                record.detail,
                record.timestamp_utc
            ],
        )
        .context("failed inserting step into run journal")?;
        self.prune_if_needed(&conn)?;
        Ok(())
    }

    /// Most recent records first.
    pub fn recent(&self, limit: usize) -> Result<Vec<StepRecord>> {
        let conn = self.open_connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, phase, step, disposition, detail, timestamp_utc
                 FROM steps ORDER BY id DESC LIMIT ?1",
            )
            .context("failed preparing journal query")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("failed querying journal rows")?;

        let mut output = Vec::new();
        for row in rows {
            let Ok((run_id, phase, step, disposition, detail, timestamp_utc)) = row else {
                continue;
            };
            let Ok(phase) = phase.parse::<Phase>() else {
                continue;
            };
            let Some(disposition) = parse_disposition(&disposition) else {
                continue;
            };
            output.push(StepRecord {
                run_id,
                phase,
                step,
                disposition,
                detail,
                timestamp_utc,
            });
        }
        Ok(output)
    }

    fn init(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed creating journal directory {}", parent.display())
            })?;
        }

        let conn = self.open_connection()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                step TEXT NOT NULL,
                disposition TEXT NOT NULL,
                detail TEXT NOT NULL,
                timestamp_utc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id);
            ",
        )
        .context("failed initializing run journal schema")?;
        Ok(())
    }

    fn open_connection(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .with_context(|| format!("failed opening run journal {}", self.path.display()))
    }

    fn prune_if_needed(&self, conn: &Connection) -> Result<()> {
        let total: i64 = conn
            .query_row("SELECT COUNT(1) FROM steps", [], |row| row.get(0))
            .context("failed counting journal rows")?;
        if total <= self.max_rows as i64 {
            return Ok(());
        }

        let to_delete = total - self.max_rows as i64;
        conn.execute(
            "DELETE FROM steps WHERE id IN (SELECT id FROM steps ORDER BY id ASC LIMIT ?1)",
            params![to_delete],
        )
        .context("failed pruning run journal")?;
        Ok(())
    }
}

fn disposition_label(disposition: StepDisposition) -> &'static str {
    match disposition {
        StepDisposition::Succeeded => "succeeded",
        StepDisposition::Warned => "warned",
        StepDisposition::Fatal => "fatal",
    }
}

fn parse_disposition(value: &str) -> Option<StepDisposition> {
    match value {
        "succeeded" => Some(StepDisposition::Succeeded),
        "warned" => Some(StepDisposition::Warned),
        "fatal" => Some(StepDisposition::Fatal),
        _ => None,
    }
}
