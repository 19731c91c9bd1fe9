use std::borrow::Cow;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::{
    constants::{MAX_REPETITIONS, WORKDIR_PREFIX},
    core::{
        domain::{Game, Implementation, Level, NewTrialResult, RunId, SourceProgram},
        template::{self, TemplateError, Vars},
        traits::runner::{ProcessOutput, ProcessRunner, SpawnError},
    },
    store::{Store, StoreError},
};

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("failed to create working directory: {0}")]
    Workdir(#[source] std::io::Error),
    #[error("failed to copy {path:?} into the working directory: {source}")]
    Copy {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BenchError {
    /// Store failures end the whole sweep; everything else only ends the episode.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BenchError::Store(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpisodeSummary {
    pub run_id: RunId,
    pub built: bool,
    pub trials: usize,
    /// Levels whose every recorded repetition passed.
    pub levels_passed: usize,
}

/// Executes build/run/verify episodes and records every command in the store.
#[derive(Debug)]
pub struct Bench<'s> {
    runner: Arc<dyn ProcessRunner>,
    store: &'s Store,
    repetitions: usize,
}

impl<'s> Bench<'s> {
    pub fn new(runner: Arc<dyn ProcessRunner>, store: &'s Store) -> Self {
        Self {
            runner,
            store,
            repetitions: MAX_REPETITIONS,
        }
    }

    /// Repetitions per level, clamped to `1..=MAX_REPETITIONS`.
    pub fn with_repetitions(mut self, repetitions: usize) -> Self {
        self.repetitions = repetitions.clamp(1, MAX_REPETITIONS);
        self
    }

    #[tracing::instrument(
        skip_all,
        fields(
            implementation = %implementation.name,
            game = %game.name,
            source = %source.path.display(),
        )
    )]
    pub async fn run(
        &self,
        implementation: &Implementation,
        game: &Game,
        source: &SourceProgram,
    ) -> Result<EpisodeSummary, BenchError> {
        // Removed on drop, whichever way this function returns.
        let workdir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir()
            .map_err(BenchError::Workdir)?;
        let output = workdir
            .path()
            .join(source.path.file_name().unwrap_or(OsStr::new("program")));

        let version = self.version(implementation).await?;
        let run_id = self
            .store
            .add_run(Utc::now(), &implementation.name, &game.name, &version)?;
        let mut summary = EpisodeSummary {
            run_id,
            built: false,
            trials: 0,
            levels_passed: 0,
        };

        let vars = episode_vars(implementation, source, &output);

        let built = self
            .build(implementation, source, &output, &vars, &mut summary)
            .await?;
        summary.built = built;
        if !built {
            tracing::warn!("Build failed, skipping all levels");
            return Ok(summary);
        }

        for (idx, level) in game.levels.iter().enumerate() {
            if self
                .run_level(implementation, idx as u32, level, &vars, &mut summary)
                .await?
            {
                summary.levels_passed += 1;
            }
        }

        tracing::info!(
            trials = summary.trials,
            levels_passed = summary.levels_passed,
            levels = game.levels.len(),
            "Episode finished"
        );
        Ok(summary)
    }

    async fn version(&self, implementation: &Implementation) -> Result<String, BenchError> {
        let vars = Vars::from([("executable".to_string(), implementation.executable.clone())]);
        let cmd = template::resolve(&implementation.version, &vars)?;
        let out = self.runner.run(&cmd).await?;
        if !out.success() {
            tracing::warn!(status = out.status, %cmd, "Version command failed");
        }

        Ok(out.stdout_lossy().trim().to_string())
    }

    async fn build(
        &self,
        implementation: &Implementation,
        source: &SourceProgram,
        output: &Path,
        vars: &Vars,
        summary: &mut EpisodeSummary,
    ) -> Result<bool, BenchError> {
        let Some(build) = &implementation.build else {
            tokio::fs::copy(&source.path, output)
                .await
                .map_err(|source_err| BenchError::Copy {
                    path: source.path.clone(),
                    source: source_err,
                })?;
            return Ok(true);
        };

        let cmd = template::resolve(build, vars)?;
        tracing::debug!(%cmd, "Building");
        let out = self.runner.run(&cmd).await?;
        let passed = out.success();
        self.record(summary, None, cmd, &out, passed)?;

        Ok(passed)
    }

    /// Returns whether every repetition of the level passed.
    async fn run_level(
        &self,
        implementation: &Implementation,
        idx: u32,
        level: &Level,
        vars: &Vars,
        summary: &mut EpisodeSummary,
    ) -> Result<bool, BenchError> {
        let mut vars = vars.clone();
        vars.insert("args".to_string(), level.args.clone());
        let cmd = template::resolve(&implementation.run, &vars)?;

        let mut all_passed = true;
        for repetition in 0..self.repetitions {
            tracing::debug!(level = idx, repetition, %cmd, "Running");
            let out = self.runner.run(&cmd).await?;
            let passed = verify(level, &out);
            all_passed &= passed;
            tracing::info!(
                level = idx,
                repetition,
                passed,
                status = out.status,
                cpu_time = out.cpu_time.as_secs_f64(),
                "Trial finished"
            );
            self.record(summary, Some(idx), cmd.clone(), &out, passed)?;

            if !out.success() {
                break;
            }
        }

        Ok(all_passed)
    }

    fn record(
        &self,
        summary: &mut EpisodeSummary,
        level: Option<u32>,
        cmd: String,
        out: &ProcessOutput,
        passed: bool,
    ) -> Result<(), StoreError> {
        self.store.add_result(&NewTrialResult {
            run_id: summary.run_id,
            passed,
            exit_status: out.status,
            cmd,
            level,
            output: out.stdout_lossy(),
            cpu_time: out.cpu_time.as_secs_f64(),
            wall_time: out.wall_time.as_secs_f64(),
            mem_usage: out.peak_memory,
        })?;
        summary.trials += 1;

        Ok(())
    }
}

/// A level with an expected result passes on matching output alone, otherwise on exit status.
pub fn verify(level: &Level, out: &ProcessOutput) -> bool {
    match &level.result {
        Some(expected) => expected.trim() == out.stdout_lossy().trim(),
        None => out.success(),
    }
}

fn episode_vars(implementation: &Implementation, source: &SourceProgram, output: &Path) -> Vars {
    let mut vars = source.vars.clone();
    vars.insert(
        "executable".to_string(),
        implementation.executable.clone(),
    );
    vars.insert("source".to_string(), quoted(&source.path));
    vars.insert("output".to_string(), quoted(output));
    vars
}

/// Paths end up inside a command line that is split with shell rules.
fn quoted(path: &Path) -> String {
    let text = path.display().to_string();
    shlex::try_quote(&text)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| text.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::runner::MockProcessRunner;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        source: SourceProgram,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sh");
        std::fs::write(&path, "# GAME=echo\n# LANG=sh\necho \"$1\"\n").unwrap();

        Fixture {
            source: SourceProgram {
                path,
                game: "echo".to_string(),
                languages: BTreeSet::from(["sh".to_string()]),
                vars: HashMap::from([("FLAGS".to_string(), "-O2".to_string())]),
            },
            _dir: dir,
        }
    }

    fn interpreter() -> Implementation {
        Implementation {
            name: "dash".to_string(),
            executable: "sh".to_string(),
            language: "sh".to_string(),
            version: "{executable} --version".to_string(),
            build: None,
            run: "{executable} {output} {args}".to_string(),
        }
    }

    fn compiler() -> Implementation {
        Implementation {
            name: "gcc".to_string(),
            executable: "gcc".to_string(),
            language: "sh".to_string(),
            version: "{executable} --version".to_string(),
            build: Some("{executable} {FLAGS} -o {output} {source}".to_string()),
            run: "{output} {args}".to_string(),
        }
    }

    fn game(levels: Vec<Level>) -> Game {
        Game {
            name: "echo".to_string(),
            description: "prints its argument".to_string(),
            levels,
        }
    }

    fn level(args: &str, result: Option<&str>) -> Level {
        Level {
            args: args.to_string(),
            result: result.map(str::to_string),
        }
    }

    fn output(status: i32, stdout: &str) -> ProcessOutput {
        ProcessOutput {
            status,
            stdout: stdout.as_bytes().to_vec(),
            cpu_time: Duration::from_millis(10),
            wall_time: Duration::from_millis(12),
            peak_memory: 1024,
        }
    }

    fn expect_version(runner: &mut MockProcessRunner, cmd: &'static str) {
        runner
            .expect_run()
            .withf(move |c| c == cmd)
            .times(1)
            .returning(|_| Ok(output(0, "13.2.0\n")));
    }

    #[tokio::test]
    async fn test_no_build_template_copies_source() {
        let fx = fixture();
        let store = Store::open_in_memory().unwrap();
        let mut runner = MockProcessRunner::new();
        expect_version(&mut runner, "sh --version");
        runner
            .expect_run()
            .withf(|c| c.starts_with("sh ") && c.ends_with("echo.sh 5"))
            .times(MAX_REPETITIONS)
            .returning(|_| Ok(output(0, "5\n")));

        let bench = Bench::new(Arc::new(runner), &store);
        let summary = bench
            .run(&interpreter(), &game(vec![level("5", Some("5\n"))]), &fx.source)
            .await
            .unwrap();

        assert!(summary.built);
        assert_eq!(summary.levels_passed, 1);
        let results = store.results(summary.run_id).unwrap();
        assert_eq!(results.len(), MAX_REPETITIONS);
        assert!(results.iter().all(|r| r.passed && r.exit_status == 0));
        assert!(results.iter().all(|r| r.level == Some(0)));
        assert_eq!(store.run(summary.run_id).unwrap().unwrap().version, "13.2.0");
    }

    #[tokio::test]
    async fn test_single_repetition() {
        let fx = fixture();
        let store = Store::open_in_memory().unwrap();
        let mut runner = MockProcessRunner::new();
        expect_version(&mut runner, "sh --version");
        runner
            .expect_run()
            .times(1)
            .returning(|_| Ok(output(0, "5")));

        let bench = Bench::new(Arc::new(runner), &store).with_repetitions(1);
        let summary = bench
            .run(&interpreter(), &game(vec![level("5", Some("5\n"))]), &fx.source)
            .await
            .unwrap();

        let results = store.results(summary.run_id).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
    }

    #[tokio::test]
    async fn test_build_failure_skips_levels() {
        let fx = fixture();
        let store = Store::open_in_memory().unwrap();
        let mut runner = MockProcessRunner::new();
        expect_version(&mut runner, "gcc --version");
        runner
            .expect_run()
            .withf(|c| c.starts_with("gcc -O2 -o "))
            .times(1)
            .returning(|_| Ok(output(2, "error: expected ';'\n")));

        let bench = Bench::new(Arc::new(runner), &store);
        let summary = bench
            .run(&compiler(), &game(vec![level("5", None)]), &fx.source)
            .await
            .unwrap();

        assert!(!summary.built);
        let results = store.results(summary.run_id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].level, None);
        assert!(!results[0].passed);
        assert_eq!(results[0].exit_status, 2);
        assert_eq!(results[0].output, "error: expected ';'\n");
    }

    #[tokio::test]
    async fn test_failing_level_does_not_stop_later_levels() {
        let fx = fixture();
        let store = Store::open_in_memory().unwrap();
        let mut runner = MockProcessRunner::new();
        expect_version(&mut runner, "gcc --version");
        runner
            .expect_run()
            .withf(|c| c.starts_with("gcc "))
            .times(1)
            .returning(|_| Ok(output(0, "")));
        runner
            .expect_run()
            .withf(|c| c.ends_with(" small"))
            .times(1)
            .returning(|_| Ok(output(1, "")));
        runner
            .expect_run()
            .withf(|c| c.ends_with(" large"))
            .times(MAX_REPETITIONS)
            .returning(|_| Ok(output(0, "")));

        let bench = Bench::new(Arc::new(runner), &store);
        let summary = bench
            .run(
                &compiler(),
                &game(vec![level("small", None), level("large", None)]),
                &fx.source,
            )
            .await
            .unwrap();

        let results = store.results(summary.run_id).unwrap();
        assert_eq!(results.len(), 1 + 1 + MAX_REPETITIONS);
        let first_level: Vec<_> = results.iter().filter(|r| r.level == Some(0)).collect();
        assert_eq!(first_level.len(), 1);
        assert!(!first_level[0].passed);
        assert_eq!(
            results.iter().filter(|r| r.level == Some(1) && r.passed).count(),
            MAX_REPETITIONS
        );
        assert_eq!(summary.levels_passed, 1);
    }

    #[tokio::test]
    async fn test_output_mismatch_keeps_repeating() {
        let fx = fixture();
        let store = Store::open_in_memory().unwrap();
        let mut runner = MockProcessRunner::new();
        expect_version(&mut runner, "sh --version");
        runner
            .expect_run()
            .times(MAX_REPETITIONS)
            .returning(|_| Ok(output(0, "6\n")));

        let bench = Bench::new(Arc::new(runner), &store);
        let summary = bench
            .run(&interpreter(), &game(vec![level("5", Some("5"))]), &fx.source)
            .await
            .unwrap();

        let results = store.results(summary.run_id).unwrap();
        assert_eq!(results.len(), MAX_REPETITIONS);
        assert!(results.iter().all(|r| !r.passed));
        assert_eq!(summary.levels_passed, 0);
    }

    #[tokio::test]
    async fn test_matching_output_passes_despite_exit_status() {
        let fx = fixture();
        let store = Store::open_in_memory().unwrap();
        let mut runner = MockProcessRunner::new();
        expect_version(&mut runner, "sh --version");
        runner
            .expect_run()
            .times(1)
            .returning(|_| Ok(output(3, "  5\n")));

        let bench = Bench::new(Arc::new(runner), &store);
        let summary = bench
            .run(&interpreter(), &game(vec![level("5", Some("5"))]), &fx.source)
            .await
            .unwrap();

        let results = store.results(summary.run_id).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
        assert_eq!(results[0].exit_status, 3);
    }

    #[tokio::test]
    async fn test_spawn_failure_keeps_recorded_trials() {
        let fx = fixture();
        let store = Store::open_in_memory().unwrap();
        let mut runner = MockProcessRunner::new();
        expect_version(&mut runner, "gcc --version");
        runner
            .expect_run()
            .withf(|c| c.starts_with("gcc "))
            .times(1)
            .returning(|_| Ok(output(0, "")));
        runner.expect_run().times(1).returning(|c| {
            Err(SpawnError::Start {
                program: c.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });

        let bench = Bench::new(Arc::new(runner), &store);
        let err = bench
            .run(&compiler(), &game(vec![level("5", None)]), &fx.source)
            .await
            .unwrap_err();

        assert!(matches!(err, BenchError::Spawn(SpawnError::Start { .. })));
        assert!(!err.is_fatal());
        let runs = store.runs().unwrap();
        assert_eq!(runs.len(), 1);
        let results = store.results(runs[0].id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].level, None);
    }

    #[tokio::test]
    async fn test_version_spawn_failure_creates_no_run() {
        let fx = fixture();
        let store = Store::open_in_memory().unwrap();
        let mut runner = MockProcessRunner::new();
        runner.expect_run().times(1).returning(|c| {
            Err(SpawnError::Start {
                program: c.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });

        let bench = Bench::new(Arc::new(runner), &store);
        let result = bench
            .run(&compiler(), &game(vec![level("5", None)]), &fx.source)
            .await;

        assert!(matches!(result, Err(BenchError::Spawn(_))));
        assert!(store.runs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_workdir_removed_on_every_path() {
        let fx = fixture();
        let store = Store::open_in_memory().unwrap();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut runner = MockProcessRunner::new();
        expect_version(&mut runner, "gcc --version");
        let captured = seen.clone();
        runner
            .expect_run()
            .times(1)
            .returning(move |c| {
                captured.lock().unwrap().push(c.to_string());
                Ok(output(1, ""))
            });

        let bench = Bench::new(Arc::new(runner), &store);
        bench
            .run(&compiler(), &game(vec![level("5", None)]), &fx.source)
            .await
            .unwrap();

        let cmd = seen.lock().unwrap()[0].clone();
        let words = template::split(&cmd).unwrap();
        let output_path = PathBuf::from(&words[3]);
        assert_eq!(output_path.file_name().unwrap(), "echo.sh");
        assert!(!output_path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_malformed_run_template() {
        let fx = fixture();
        let store = Store::open_in_memory().unwrap();
        let mut runner = MockProcessRunner::new();
        expect_version(&mut runner, "sh --version");

        let implementation = Implementation {
            run: "{output {args}".to_string(),
            ..interpreter()
        };
        let bench = Bench::new(Arc::new(runner), &store);
        let result = bench
            .run(&implementation, &game(vec![level("5", None)]), &fx.source)
            .await;

        assert!(matches!(result, Err(BenchError::Template(_))));
    }

    #[test]
    fn test_verify() {
        let expected = level("5", Some("5\n"));
        let no_expected = level("5", None);

        assert!(verify(&expected, &output(0, "5")));
        assert!(verify(&expected, &output(1, "\n5  ")));
        assert!(!verify(&expected, &output(0, "55")));
        assert!(verify(&no_expected, &output(0, "anything")));
        assert!(!verify(&no_expected, &output(2, "")));
    }
}
