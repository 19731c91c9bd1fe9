use std::time::Duration;

use crate::core::template::TemplateError;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessOutput {
    /// Exit code, or the negated signal number for a killed process.
    pub status: i32,
    /// Standard output with standard error interleaved into it.
    pub stdout: Vec<u8>,
    /// User plus system time of the child.
    pub cpu_time: Duration,
    pub wall_time: Duration,
    /// `ru_maxrss` as reported by the platform (KiB on Linux, bytes on macOS).
    pub peak_memory: i64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("failed to start {program:?}: {source}")]
    Start {
        program: String,
        source: std::io::Error,
    },
    #[error("failed to collect {program:?}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ProcessRunner: std::fmt::Debug + Send + Sync {
    /// Runs one resolved command line to completion. An empty line is a no-op success.
    async fn run(&self, cmd: &str) -> Result<ProcessOutput, SpawnError>;
}
