//! Handle for one live application worker.

use crate::channel::MessageChannel;
use crate::pool::now_usec;
use crate::spawn::{AppProcess, SpawnedWorker};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long a worker gets to exit after the shutdown message before the
/// signal ladder starts.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Worker lifecycle. Only `Alive` workers may host new sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifeCycle {
    Spawning,
    Alive,
    ShuttingDown,
    Dead,
}

/// One spawned worker as the pool sees it.
///
/// Scalar bookkeeping (sessions, last_used, lifecycle) is mutated only under
/// the pool lock. The control channel sits behind its own mutex so session
/// checkout I/O can run after the pool lock has been released.
pub(crate) struct Process {
    pub pid: i32,
    pub handle: Box<dyn AppProcess>,
    pub control: Arc<Mutex<MessageChannel>>,
    pub concurrency: u32,
    pub sessions: u32,
    pub last_used: u64,
    pub session_id_counter: u32,
    pub life: LifeCycle,
    pub spawned_at: u64,
    /// Attach order within the group, the final selection tie-break.
    pub insert_seq: u64,
    /// Marked by a cap reduction: this worker is over-budget and drains
    /// out instead of being killed mid-request. The capacity check counts
    /// these separately until they detach.
    pub cap_excess: bool,
}

impl Process {
    pub fn new(worker: SpawnedWorker, concurrency: u32) -> Self {
        let now = now_usec();
        Self {
            pid: worker.process.pid(),
            handle: worker.process,
            control: Arc::new(Mutex::new(worker.channel)),
            concurrency,
            sessions: 0,
            last_used: now,
            session_id_counter: 0,
            life: LifeCycle::Spawning,
            spawned_at: now,
            insert_seq: 0,
            cap_excess: false,
        }
    }

    /// Whether another session would exceed the worker's concurrency.
    /// `concurrency == 0` means unlimited.
    pub fn at_full_capacity(&self) -> bool {
        self.concurrency != 0 && self.sessions >= self.concurrency
    }

    /// 0 when idle; otherwise the raw session count. Only ever compared,
    /// never interpreted.
    pub fn busyness(&self) -> u32 {
        self.sessions
    }

    /// Reserve one session slot and hand out its id. Caller holds the pool
    /// lock; the actual checkout I/O happens later via the cloned control
    /// channel.
    pub fn reserve_session(&mut self) -> u32 {
        let id = self.session_id_counter;
        self.session_id_counter = self.session_id_counter.wrapping_add(1);
        self.sessions += 1;
        id
    }

    /// Drop one session slot. Returns true when the worker is now idle.
    pub fn release_session(&mut self) -> bool {
        debug_assert!(self.sessions > 0, "session counter underflow");
        self.sessions = self.sessions.saturating_sub(1);
        self.last_used = now_usec();
        self.sessions == 0
    }

    /// Tear the worker down: polite shutdown message, a grace period to
    /// exit, then SIGTERM, then SIGKILL. Consumes the handle; runs outside
    /// the pool lock.
    pub fn shutdown(mut self) {
        self.life = LifeCycle::ShuttingDown;

        if let Ok(mut channel) = self.control.lock() {
            let _ = channel.set_write_timeout(Some(Duration::from_secs(1)));
            if let Err(e) = channel.write_vec(&["shutdown"]) {
                tracing::debug!(pid = self.pid, error = %e, "Shutdown message not delivered");
            }
            channel.close();
        }

        if self.reap_within(SHUTDOWN_GRACE) {
            self.life = LifeCycle::Dead;
            tracing::debug!(pid = self.pid, "Worker exited after shutdown message");
            return;
        }

        let _ = self.handle.terminate();
        if self.reap_within(Duration::from_millis(200)) {
            self.life = LifeCycle::Dead;
            return;
        }

        tracing::warn!(pid = self.pid, "Worker ignored SIGTERM, killing");
        if let Err(e) = self.handle.kill() {
            tracing::warn!(pid = self.pid, error = %e, "Could not kill worker");
        }
        self.life = LifeCycle::Dead;
    }

    fn reap_within(&mut self, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        loop {
            match self.handle.try_wait() {
                Ok(true) => return true,
                Ok(false) => {}
                Err(_) => return true, // nothing left to reap
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// One line for the pool snapshot.
    pub fn describe(&self, role: &str, now: u64) -> String {
        let idle = now.saturating_sub(self.last_used) / 1_000_000;
        let uptime = now.saturating_sub(self.spawned_at) / 1_000_000;
        format!(
            "    pid {:<8} {:<10} {:?}  sessions={} uptime={}s idle={}s",
            self.pid, role, self.life, self.sessions, uptime, idle
        )
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("sessions", &self.sessions)
            .field("concurrency", &self.concurrency)
            .field("life", &self.life)
            .finish()
    }
}
