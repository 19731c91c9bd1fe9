//! Append-only SQLite record of runs and the trials executed within them.
//!
//! The layout of the two tables is shared with every earlier benchmarking run, so
//! columns are never renamed or added. Opening a database whose tables have a
//! different shape fails with [`StoreError::IncompatibleSchema`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params, types::Type};
use uuid::Uuid;

use crate::core::domain::{NewTrialResult, Run, RunId, TrialResult};

const RUN_COLUMNS: [&str; 5] = ["id", "run_when", "impl", "game", "version"];
const RESULT_COLUMNS: [&str; 9] = [
    "run_id",
    "passed",
    "exitstatus",
    "cmd",
    "level",
    "output",
    "cputime",
    "walltime",
    "memusage",
];

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS run (
        id TEXT PRIMARY KEY,
        run_when TEXT NOT NULL,
        impl TEXT NOT NULL,
        game TEXT NOT NULL,
        version TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS result (
        run_id TEXT NOT NULL,
        passed INTEGER NOT NULL,
        exitstatus INTEGER NOT NULL,
        cmd TEXT NOT NULL,
        level INTEGER,
        output TEXT NOT NULL,
        cputime REAL NOT NULL,
        walltime REAL NOT NULL,
        memusage INTEGER NOT NULL
    );
";

const RESULT_SELECT: &str = "SELECT run_id, passed, exitstatus, cmd, level, output, \
    cputime, walltime, memusage FROM result";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("table {table:?} has columns {found:?}, expected {expected:?}")]
    IncompatibleSchema {
        table: &'static str,
        found: Vec<String>,
        expected: Vec<&'static str>,
    },
}

#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens the database at `path`, creating the file and the tables if needed.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        check_columns(&conn, "run", &RUN_COLUMNS)?;
        check_columns(&conn, "result", &RESULT_COLUMNS)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("Store schema ready");

        Ok(Self { conn })
    }

    pub fn add_run(
        &self,
        run_when: DateTime<Utc>,
        implementation: &str,
        game: &str,
        version: &str,
    ) -> Result<RunId, StoreError> {
        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO run (id, run_when, impl, game, version) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.to_string(), run_when, implementation, game, version],
        )?;
        tracing::debug!(%id, implementation, game, version, "Run registered");

        Ok(id)
    }

    pub fn add_result(&self, result: &NewTrialResult) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO result (run_id, passed, exitstatus, cmd, level, output, cputime, walltime, memusage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                result.run_id.to_string(),
                result.passed,
                result.exit_status,
                result.cmd,
                result.level,
                result.output,
                result.cpu_time,
                result.wall_time,
                result.mem_usage,
            ],
        )?;

        Ok(())
    }

    /// All runs in insertion order.
    pub fn runs(&self) -> Result<Vec<Run>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, run_when, impl, game, version FROM run ORDER BY rowid")?;
        let runs = stmt
            .query_map([], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(runs)
    }

    #[cfg(test)]
    pub fn run(&self, id: RunId) -> Result<Option<Run>, StoreError> {
        use rusqlite::OptionalExtension;

        let run = self
            .conn
            .query_row(
                "SELECT id, run_when, impl, game, version FROM run WHERE id = ?1",
                params![id.to_string()],
                run_from_row,
            )
            .optional()?;

        Ok(run)
    }

    /// Every trial of a run, in the order it was executed.
    #[cfg(test)]
    pub fn results(&self, run_id: RunId) -> Result<Vec<TrialResult>, StoreError> {
        self.query_results(
            &format!("{RESULT_SELECT} WHERE run_id = ?1 ORDER BY rowid"),
            run_id,
        )
    }

    /// Run-phase trials of a run, highest level first, execution order within a level.
    pub fn level_results_desc(&self, run_id: RunId) -> Result<Vec<TrialResult>, StoreError> {
        self.query_results(
            &format!(
                "{RESULT_SELECT} WHERE run_id = ?1 AND level IS NOT NULL ORDER BY level DESC, rowid"
            ),
            run_id,
        )
    }

    fn query_results(&self, sql: &str, run_id: RunId) -> Result<Vec<TrialResult>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt
            .query_map(params![run_id.to_string()], result_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(results)
    }
}

fn check_columns(
    conn: &Connection,
    table: &'static str,
    expected: &[&'static str],
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let found = stmt
        .query_map([], |row| row.get::<_, String>("name"))?
        .collect::<Result<Vec<_>, _>>()?;

    // A missing table gets created afterwards.
    if found.is_empty() || found == expected {
        return Ok(());
    }

    Err(StoreError::IncompatibleSchema {
        table,
        found,
        expected: expected.to_vec(),
    })
}

fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: uuid_column(row, 0)?,
        run_when: row.get(1)?,
        implementation: row.get(2)?,
        game: row.get(3)?,
        version: row.get(4)?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<TrialResult> {
    Ok(TrialResult {
        run_id: uuid_column(row, 0)?,
        passed: row.get(1)?,
        exit_status: row.get(2)?,
        cmd: row.get(3)?,
        level: row.get(4)?,
        output: row.get(5)?,
        cpu_time: row.get(6)?,
        wall_time: row.get(7)?,
        mem_usage: row.get(8)?,
    })
}
