use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// One input-size tier of a game.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Level {
    pub args: String,
    /// Expected stdout. `None` means the level passes on exit status zero.
    pub result: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Game {
    pub name: String,
    pub description: String,
    pub levels: Vec<Level>,
}

impl Game {
    /// Index of the level used for leaderboard comparison.
    pub fn last_level(&self) -> Option<u32> {
        self.levels.len().checked_sub(1).map(|idx| idx as u32)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Implementation {
    pub name: String,
    pub executable: String,
    pub language: String,
    pub version: String,
    /// `None` means the source is copied verbatim to the output path.
    pub build: Option<String>,
    pub run: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceProgram {
    pub path: PathBuf,
    pub game: String,
    pub languages: BTreeSet<String>,
    pub vars: HashMap<String, String>,
}

impl SourceProgram {
    pub fn supports(&self, implementation: &Implementation) -> bool {
        self.languages.contains(&implementation.language)
    }
}

/// Immutable set of games and implementations, built once at startup.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    pub games: BTreeMap<String, Game>,
    pub implementations: BTreeMap<String, Implementation>,
}

impl Registry {
    pub fn game(&self, name: &str) -> Option<&Game> {
        self.games.get(name)
    }

    pub fn implementation(&self, name: &str) -> Option<&Implementation> {
        self.implementations.get(name)
    }
}

pub type RunId = Uuid;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Run {
    pub id: RunId,
    pub run_when: DateTime<Utc>,
    #[serde(rename = "impl")]
    pub implementation: String,
    pub game: String,
    pub version: String,
}

/// A trial as written by the executor, before it gets a place in the store.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTrialResult {
    pub run_id: RunId,
    pub passed: bool,
    pub exit_status: i32,
    pub cmd: String,
    /// `None` for the build step.
    pub level: Option<u32>,
    pub output: String,
    pub cpu_time: f64,
    pub wall_time: f64,
    pub mem_usage: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrialResult {
    pub run_id: RunId,
    pub passed: bool,
    #[serde(rename = "exitstatus")]
    pub exit_status: i32,
    pub cmd: String,
    pub level: Option<u32>,
    pub output: String,
    #[serde(rename = "cputime")]
    pub cpu_time: f64,
    #[serde(rename = "walltime")]
    pub wall_time: f64,
    #[serde(rename = "memusage")]
    pub mem_usage: i64,
}

impl From<NewTrialResult> for TrialResult {
    fn from(result: NewTrialResult) -> Self {
        Self {
            run_id: result.run_id,
            passed: result.passed,
            exit_status: result.exit_status,
            cmd: result.cmd,
            level: result.level,
            output: result.output,
            cpu_time: result.cpu_time,
            wall_time: result.wall_time,
            mem_usage: result.mem_usage,
        }
    }
}
