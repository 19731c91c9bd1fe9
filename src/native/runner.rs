use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::core::{
    template,
    traits::runner::{ProcessOutput, ProcessRunner, SpawnError},
};

/// Runs commands directly on the host and reads their accounting from `wait4(2)`.
///
/// Every command leads its own process group. When the leader exits, whatever is
/// left of the group is killed, so background children cannot hold the output
/// pipe open past the command.
#[derive(Clone, Debug, Default)]
pub struct NativeRunner {
    timeout: Option<Duration>,
}

impl NativeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kills commands still running after `timeout`. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl ProcessRunner for NativeRunner {
    #[tracing::instrument(skip(self))]
    async fn run(&self, cmd: &str) -> Result<ProcessOutput, SpawnError> {
        let argv = template::split(cmd)?;
        let Some((program, args)) = argv.split_first() else {
            return Ok(ProcessOutput::default());
        };

        let Spawned {
            group,
            mut stdout,
            started,
        } = Spawned::start(program, args).map_err(|source| SpawnError::Start {
            program: program.clone(),
            source,
        })?;

        let reader = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf)
        });
        let mut waiter = tokio::task::spawn_blocking({
            let group = Arc::clone(&group);
            move || {
                let waited = group.wait();
                waited.map(|(status, usage)| (status, usage, started.elapsed()))
            }
        });

        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut waiter).await {
                Ok(waited) => waited,
                Err(_) => {
                    tracing::warn!(pid = group.leader, ?limit, "Command timed out, killing it");
                    group.kill();
                    waiter.await
                }
            },
            None => waiter.await,
        };

        let wait_error = |source| SpawnError::Wait {
            program: program.clone(),
            source,
        };
        let (raw_status, usage, wall_time) = waited
            .map_err(io::Error::other)
            .and_then(|waited| waited)
            .map_err(wait_error)?;
        let stdout = reader
            .await
            .map_err(io::Error::other)
            .and_then(|read| read)
            .map_err(wait_error)?;

        let status = ExitStatus::from_raw(raw_status);
        let output = ProcessOutput {
            status: status
                .code()
                .or_else(|| status.signal().map(|signal| -signal))
                .unwrap_or(-1),
            stdout,
            cpu_time: timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime),
            wall_time,
            peak_memory: usage.ru_maxrss as i64,
        };

        tracing::debug!(
            status = output.status,
            cpu_time = ?output.cpu_time,
            wall_time = ?output.wall_time,
            peak_memory = output.peak_memory,
            "Command finished"
        );
        Ok(output)
    }
}

struct Spawned {
    group: Arc<ProcessGroup>,
    stdout: File,
    started: Instant,
}

impl Spawned {
    fn start(program: &str, args: &[String]) -> io::Result<Self> {
        let (reader, writer) = pipe()?;
        let writer_err = writer.try_clone()?;

        let mut command = Command::new(program);
        command
            .args(args)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_err));

        let started = Instant::now();
        let child = command.spawn()?;
        // The command keeps the write ends open until dropped; reading would never see EOF.
        drop(command);

        Ok(Self {
            group: Arc::new(ProcessGroup::new(child.id() as libc::pid_t)),
            stdout: File::from(reader),
            started,
        })
    }
}

/// The process group led by a spawned command.
///
/// The leader is reaped only while `reaped` is locked, and signals are sent only
/// while it is locked and still false. An unreaped leader keeps its pid, so the
/// group id can never name an unrelated group.
#[derive(Debug)]
struct ProcessGroup {
    leader: libc::pid_t,
    reaped: Mutex<bool>,
}

impl ProcessGroup {
    fn new(leader: libc::pid_t) -> Self {
        Self {
            leader,
            reaped: Mutex::new(false),
        }
    }

    fn kill(&self) {
        let reaped = self.reaped.lock().unwrap_or_else(PoisonError::into_inner);
        if !*reaped {
            unsafe { libc::kill(-self.leader, libc::SIGKILL) };
        }
    }

    /// Blocks until the leader exits, kills the rest of the group, then reaps the leader.
    fn wait(&self) -> io::Result<(libc::c_int, libc::rusage)> {
        wait_exited(self.leader)?;

        let mut reaped = self.reaped.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe { libc::kill(-self.leader, libc::SIGKILL) };
        let waited = wait4(self.leader)?;
        *reaped = true;

        Ok(waited)
    }
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    for fd in fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }

    // SAFETY: both descriptors were just returned by pipe(2) and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Waits for `pid` to exit but leaves it as a zombie.
fn wait_exited(pid: libc::pid_t) -> io::Result<()> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };

    loop {
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if ret == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Reaps exactly `pid` and returns its raw wait status with its own resource usage.
fn wait4(pid: libc::pid_t) -> io::Result<(libc::c_int, libc::rusage)> {
    let mut status: libc::c_int = 0;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if ret == pid {
            return Ok((status, usage));
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::new(tv.tv_sec as u64, (tv.tv_usec as u32) * 1_000)
}
