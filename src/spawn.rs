//! Process spawning seams and the direct command spawner.
//!
//! The pool never forks application code itself; it asks a [`Spawner`] for a
//! ready worker and gets back an OS handle plus a connected control channel.
//! Preloader-style spawners keep warm state between spawns and report an
//! idle lifetime so the garbage collector can retire them.

use crate::channel::MessageChannel;
use crate::error::{PoolError, Result};
use crate::options::PoolOptions;
use crate::pool::now_usec;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

/// OS-level handle to one spawned application process.
///
/// Abstracts signalling and reaping so tests can stand in workers that are
/// not real processes.
pub trait AppProcess: Send {
    /// The advertised process id.
    fn pid(&self) -> i32;

    /// Non-blocking exit check. Returns true once the process is gone.
    fn try_wait(&mut self) -> Result<bool>;

    /// Ask the process to stop (SIGTERM or equivalent).
    fn terminate(&mut self) -> Result<()>;

    /// Force the process down and reap it.
    fn kill(&mut self) -> Result<()>;
}

/// What a spawner hands back: the OS handle and the control channel the
/// pool uses for session checkout and shutdown.
pub struct SpawnedWorker {
    pub process: Box<dyn AppProcess>,
    pub channel: MessageChannel,
}

impl std::fmt::Debug for SpawnedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedWorker")
            .field("pid", &self.process.pid())
            .field("channel", &self.channel)
            .finish()
    }
}

/// Spawns workers for one group.
///
/// `cleanable`/`last_used`/`cleanup` describe the spawner's own warm state:
/// a preloader that forks workers cheaply has an idle lifetime of its own,
/// while a direct spawner keeps nothing and is never cleanable.
pub trait Spawner: Send + Sync {
    /// Spawn one worker. Blocks until the worker's control channel is
    /// connected. `secret` is the group's connect secret; the worker must
    /// present it back on every session checkout.
    fn spawn(&self, options: &PoolOptions, secret: &str) -> Result<SpawnedWorker>;

    /// Whether the spawner holds warm state that can be released.
    fn cleanable(&self) -> bool {
        false
    }

    /// Wall-clock microseconds of the last spawn, for idle accounting.
    fn last_used(&self) -> u64;

    /// Release warm state. A later spawn transparently rebuilds it.
    fn cleanup(&self) {}

    /// Pid of the process doing the actual forking. For a direct spawner
    /// that is the pool process itself.
    fn server_pid(&self) -> i32 {
        std::process::id() as i32
    }
}

/// Builds one [`Spawner`] per group.
pub trait SpawnerFactory: Send + Sync {
    fn create(&self, options: &PoolOptions) -> Box<dyn Spawner>;
}

/// Real child process handle backed by `std::process::Child`.
pub struct ChildProcess {
    child: Child,
    reaped: bool,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }
}

impl AppProcess for ChildProcess {
    fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    fn try_wait(&mut self) -> Result<bool> {
        if self.reaped {
            return Ok(true);
        }
        match self.child.try_wait()? {
            Some(status) => {
                tracing::debug!(pid = self.pid(), %status, "Worker process exited");
                self.reaped = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        kill(Pid::from_raw(self.pid()), Signal::SIGTERM)
            .map_err(|e| PoolError::Io(std::io::Error::from_raw_os_error(e as i32)))
    }

    fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        self.child.kill()?;
        self.child.wait()?;
        self.reaped = true;
        Ok(())
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Spawner that runs the application's start command directly, one process
/// per spawn. The worker receives its control socket as stdin.
pub struct CommandSpawner {
    last_used: AtomicU64,
}

impl CommandSpawner {
    pub fn new() -> Self {
        Self {
            last_used: AtomicU64::new(now_usec()),
        }
    }
}

impl Default for CommandSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl Spawner for CommandSpawner {
    fn spawn(&self, options: &PoolOptions, secret: &str) -> Result<SpawnedWorker> {
        self.last_used.store(now_usec(), Ordering::Relaxed);

        if options.start_command.is_empty() {
            return Err(PoolError::spawn(format!(
                "application {} has no start command",
                options.app_root
            )));
        }

        let (parent_end, child_end) = UnixStream::pair()?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(&options.start_command);
        cmd.current_dir(&options.app_root);
        cmd.stdin(Stdio::from(OwnedFd::from(child_end)));
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.env("PROCPOOL_CONNECT_SECRET", secret);
        cmd.env("PROCPOOL_APP_TYPE", &options.app_type);
        if let Some(env) = &options.environment {
            cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        apply_identity(&mut cmd, &options.user, &options.group)?;

        let mut child = cmd.spawn().map_err(|e| PoolError::Spawn {
            message: format!("could not execute {:?}: {}", options.start_command, e),
            error_page: None,
        })?;

        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name(format!("worker-{}-stderr", pid))
                .spawn(move || forward_worker_stderr(pid, stderr))
                .ok(); // stderr forwarding is best-effort
        }

        tracing::info!(
            pid,
            app_root = %options.app_root,
            app_group = %options.app_group_name,
            "Spawned application process"
        );

        Ok(SpawnedWorker {
            process: Box::new(ChildProcess::new(child)),
            channel: MessageChannel::new(parent_end),
        })
    }

    fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }
}

/// Factory producing one [`CommandSpawner`] per group.
pub struct CommandSpawnerFactory;

impl SpawnerFactory for CommandSpawnerFactory {
    fn create(&self, _options: &PoolOptions) -> Box<dyn Spawner> {
        Box::new(CommandSpawner::new())
    }
}

/// Resolve `user`/`group` names and apply them to the command. Empty names
/// mean "inherit the pool's identity".
fn apply_identity(cmd: &mut Command, user: &str, group: &str) -> Result<()> {
    use std::os::unix::process::CommandExt;

    if !group.is_empty() {
        let resolved = nix::unistd::Group::from_name(group)
            .map_err(|e| PoolError::spawn(format!("cannot look up group {}: {}", group, e)))?
            .ok_or_else(|| PoolError::spawn(format!("no such group: {}", group)))?;
        cmd.gid(resolved.gid.as_raw());
    }
    if !user.is_empty() {
        let resolved = nix::unistd::User::from_name(user)
            .map_err(|e| PoolError::spawn(format!("cannot look up user {}: {}", user, e)))?
            .ok_or_else(|| PoolError::spawn(format!("no such user: {}", user)))?;
        cmd.uid(resolved.uid.as_raw());
    }
    Ok(())
}

/// Forward a worker's stderr lines through tracing.
fn forward_worker_stderr(pid: u32, stderr: std::process::ChildStderr) {
    let reader = BufReader::new(stderr);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break, // pipe closed
        };
        if line.trim().is_empty() {
            continue;
        }
        if line.to_lowercase().contains("error") {
            tracing::warn!(worker_pid = pid, "{}", line);
        } else {
            tracing::debug!(worker_pid = pid, "{}", line);
        }
    }
}
