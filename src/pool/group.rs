//! Workers and pending requests for one application identity.
//!
//! A group owns three process lists. `enabled` workers serve new sessions;
//! `disabling` workers drain and are detached once idle; `disabled` workers
//! are kept warm but excluded from selection. Admission decisions that need
//! pool-wide context (caps, spawn scheduling) live in the pool core; this
//! module provides the primitives they compose.

use crate::channel::MessageChannel;
use crate::options::PoolOptions;
use crate::pool::process::{LifeCycle, Process};
use crate::pool::{Actions, Waiter};
use crate::spawn::Spawner;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Which list a worker currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Enabled,
    Disabling,
    Disabled,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Enabled => "enabled",
            Role::Disabling => "disabling",
            Role::Disabled => "disabled",
        }
    }
}

/// Everything needed to finish a session checkout once the pool lock has
/// been released: the worker's control channel and the group secret.
pub(crate) struct CheckoutSpec {
    pub app_root: String,
    pub app_group: String,
    pub pid: i32,
    pub session_id: u32,
    pub control: Arc<Mutex<MessageChannel>>,
    pub secret: String,
}

pub(crate) struct Group {
    pub name: String,
    pub app_root: String,
    pub options: PoolOptions,
    pub secret: String,
    pub spawner: Arc<dyn Spawner>,

    pub enabled: Vec<Process>,
    pub disabling: Vec<Process>,
    pub disabled: Vec<Process>,
    pub enabled_count: u32,
    pub disabling_count: u32,
    pub disabled_count: u32,

    /// Spawns in flight; they hold pool capacity before a worker exists.
    pub spawning: u32,
    pub get_waitlist: VecDeque<Waiter>,
    pub destroying: bool,
    next_insert_seq: u64,
}

impl Group {
    pub fn new(options: PoolOptions, secret: String, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            name: options.app_group_name.clone(),
            app_root: options.app_root.clone(),
            secret,
            spawner,
            options,
            enabled: Vec::new(),
            disabling: Vec::new(),
            disabled: Vec::new(),
            enabled_count: 0,
            disabling_count: 0,
            disabled_count: 0,
            spawning: 0,
            get_waitlist: VecDeque::new(),
            destroying: false,
            next_insert_seq: 0,
        }
    }

    /// Total workers owned by this group, regardless of role.
    pub fn process_count(&self) -> u32 {
        self.enabled_count + self.disabling_count + self.disabled_count
    }

    /// Worker slots this group has committed pool-wide, including spawns
    /// that have not produced a worker yet.
    pub fn committed(&self) -> u32 {
        self.process_count() + self.spawning
    }

    /// Whether the group may start another spawn under its own cap.
    /// A cap of 0 (group and pool default both unset) means unlimited.
    pub fn below_group_cap(&self, pool_max_per_app: u32) -> bool {
        let cap = self.options.effective_max_processes(pool_max_per_app);
        cap == 0 || self.spawning + self.enabled_count < cap
    }

    /// Whether any enabled worker could host another session right now.
    pub fn has_spare_capacity(&self) -> bool {
        self.enabled
            .iter()
            .any(|p| p.life == LifeCycle::Alive && !p.at_full_capacity())
    }

    /// Reserve a session on the best available worker, if any.
    ///
    /// Selection is deterministic: fewest sessions first, then least
    /// recently used, then attach order.
    pub fn try_checkout(&mut self) -> Option<CheckoutSpec> {
        let process = self
            .enabled
            .iter_mut()
            .filter(|p| p.life == LifeCycle::Alive && !p.at_full_capacity())
            .min_by_key(|p| (p.busyness(), p.last_used, p.insert_seq))?;

        let session_id = process.reserve_session();
        Some(CheckoutSpec {
            app_root: self.app_root.clone(),
            app_group: self.name.clone(),
            pid: process.pid,
            session_id,
            control: process.control.clone(),
            secret: self.secret.clone(),
        })
    }

    /// Add a freshly spawned worker to the serving list.
    pub fn attach(&mut self, mut process: Process) {
        process.life = LifeCycle::Alive;
        process.insert_seq = self.next_insert_seq;
        self.next_insert_seq += 1;
        self.enabled.push(process);
        self.enabled_count += 1;
    }

    /// Remove a worker from whichever list holds it and queue its shutdown
    /// to run after the pool lock drops. Returns false if the pid is not
    /// ours.
    pub fn detach(&mut self, pid: i32, actions: &mut Actions) -> bool {
        let removed = Self::remove_from(&mut self.enabled, &mut self.enabled_count, pid)
            .or_else(|| Self::remove_from(&mut self.disabling, &mut self.disabling_count, pid))
            .or_else(|| Self::remove_from(&mut self.disabled, &mut self.disabled_count, pid));
        match removed {
            Some(process) => {
                tracing::debug!(
                    pid,
                    group = %self.name,
                    sessions = process.sessions,
                    "Detaching worker"
                );
                actions.push(Box::new(move || process.shutdown()));
                true
            }
            None => false,
        }
    }

    /// Detach every worker in the group.
    pub fn detach_all(&mut self, actions: &mut Actions) {
        let pids: Vec<i32> = self.all_processes().map(|p| p.pid).collect();
        for pid in pids {
            self.detach(pid, actions);
        }
    }

    /// Move an enabled worker to the draining list. It keeps serving its
    /// current sessions but takes no new ones; once idle it is detached by
    /// the release path.
    pub fn mark_disabling(&mut self, pid: i32) -> bool {
        if let Some(process) = Self::remove_from(&mut self.enabled, &mut self.enabled_count, pid) {
            self.disabling.push(process);
            self.disabling_count += 1;
            true
        } else {
            false
        }
    }

    /// Move an enabled worker to the warm reserve.
    pub fn mark_disabled(&mut self, pid: i32) -> bool {
        if let Some(process) = Self::remove_from(&mut self.enabled, &mut self.enabled_count, pid) {
            self.disabled.push(process);
            self.disabled_count += 1;
            true
        } else {
            false
        }
    }

    /// Bring a reserved worker back into service.
    pub fn re_enable(&mut self, pid: i32) -> bool {
        if let Some(process) = Self::remove_from(&mut self.disabled, &mut self.disabled_count, pid)
        {
            self.attach(process);
            true
        } else {
            false
        }
    }

    /// Push a reserved worker into the draining list; it detaches once its
    /// outstanding sessions finish.
    pub fn retire_disabled(&mut self, pid: i32) -> bool {
        if let Some(process) = Self::remove_from(&mut self.disabled, &mut self.disabled_count, pid)
        {
            self.disabling.push(process);
            self.disabling_count += 1;
            true
        } else {
            false
        }
    }

    pub fn find_process_mut(&mut self, pid: i32) -> Option<(&mut Process, Role)> {
        if let Some(p) = self.enabled.iter_mut().find(|p| p.pid == pid) {
            return Some((p, Role::Enabled));
        }
        if let Some(p) = self.disabling.iter_mut().find(|p| p.pid == pid) {
            return Some((p, Role::Disabling));
        }
        if let Some(p) = self.disabled.iter_mut().find(|p| p.pid == pid) {
            return Some((p, Role::Disabled));
        }
        None
    }

    pub fn all_processes(&self) -> impl Iterator<Item = &Process> {
        self.enabled
            .iter()
            .chain(self.disabling.iter())
            .chain(self.disabled.iter())
    }

    /// Append a pending request.
    pub fn queue_waiter(&mut self, waiter: Waiter) {
        tracing::debug!(group = %self.name, waiter = waiter.id, "Queueing request");
        self.get_waitlist.push_back(waiter);
    }

    /// Pull out every waiter whose deadline has passed.
    pub fn take_expired_waiters(&mut self, now: u64) -> Vec<Waiter> {
        let mut expired = Vec::new();
        let mut keep = VecDeque::with_capacity(self.get_waitlist.len());
        for waiter in self.get_waitlist.drain(..) {
            if waiter.deadline <= now {
                expired.push(waiter);
            } else {
                keep.push_back(waiter);
            }
        }
        self.get_waitlist = keep;
        expired
    }

    /// Drain the whole waitlist, e.g. to fail it.
    pub fn take_all_waiters(&mut self) -> Vec<Waiter> {
        self.get_waitlist.drain(..).collect()
    }

    /// Restart in place: current workers drain out, fresh options take
    /// effect, and the pool core spawns replacements. The waitlist is kept;
    /// queued requests are served by the replacements.
    pub fn restart(&mut self, fresh_options: PoolOptions, actions: &mut Actions) {
        tracing::info!(group = %self.name, "Restarting group");
        let pids: Vec<(i32, u32)> = self.enabled.iter().map(|p| (p.pid, p.sessions)).collect();
        for (pid, sessions) in pids {
            if sessions == 0 {
                self.detach(pid, actions);
            } else {
                self.mark_disabling(pid);
            }
        }
        self.options = fresh_options;
    }

    /// Shut the preloader down. A later spawn rebuilds it transparently.
    pub fn cleanup_spawner(&mut self, actions: &mut Actions) {
        let spawner = self.spawner.clone();
        let name = self.name.clone();
        actions.push(Box::new(move || {
            tracing::debug!(group = %name, "Cleaning up idle spawner");
            spawner.cleanup();
        }));
    }

    /// Per-group block of the pool snapshot.
    pub fn describe(&self, now: u64) -> String {
        let mut out = format!(
            "  group {} (enabled={} disabling={} disabled={} spawning={} queued={})\n",
            self.name,
            self.enabled_count,
            self.disabling_count,
            self.disabled_count,
            self.spawning,
            self.get_waitlist.len()
        );
        for p in &self.enabled {
            out.push_str(&p.describe(Role::Enabled.as_str(), now));
            out.push('\n');
        }
        for p in &self.disabling {
            out.push_str(&p.describe(Role::Disabling.as_str(), now));
            out.push('\n');
        }
        for p in &self.disabled {
            out.push_str(&p.describe(Role::Disabled.as_str(), now));
            out.push('\n');
        }
        out
    }

    fn remove_from(list: &mut Vec<Process>, count: &mut u32, pid: i32) -> Option<Process> {
        let idx = list.iter().position(|p| p.pid == pid)?;
        *count -= 1;
        Some(list.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::spawn::{AppProcess, SpawnedWorker, Spawner};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeApp {
        pid: i32,
        alive: Arc<AtomicBool>,
    }

    impl AppProcess for FakeApp {
        fn pid(&self) -> i32 {
            self.pid
        }
        fn try_wait(&mut self) -> Result<bool> {
            Ok(!self.alive.load(Ordering::Relaxed))
        }
        fn terminate(&mut self) -> Result<()> {
            self.alive.store(false, Ordering::Relaxed);
            Ok(())
        }
        fn kill(&mut self) -> Result<()> {
            self.alive.store(false, Ordering::Relaxed);
            Ok(())
        }
    }

    struct NullSpawner;

    impl Spawner for NullSpawner {
        fn spawn(&self, _options: &PoolOptions, _secret: &str) -> Result<SpawnedWorker> {
            unreachable!("group unit tests attach processes directly")
        }
        fn last_used(&self) -> u64 {
            0
        }
    }

    fn group(concurrency: u32) -> Group {
        let mut options = PoolOptions::new("/srv/app");
        options.concurrency = concurrency;
        Group::new(options, "secret".into(), Arc::new(NullSpawner))
    }

    fn fake_process(pid: i32, concurrency: u32) -> Process {
        let (channel, _peer) = MessageChannel::pair().unwrap();
        std::mem::forget(_peer);
        Process::new(
            SpawnedWorker {
                process: Box::new(FakeApp {
                    pid,
                    alive: Arc::new(AtomicBool::new(true)),
                }),
                channel,
            },
            concurrency,
        )
    }

    #[test]
    fn test_selection_prefers_fewest_sessions() {
        let mut g = group(4);
        g.attach(fake_process(1, 4));
        g.attach(fake_process(2, 4));

        // Load pid 1 with a session; the next checkout must pick pid 2.
        let first = g.try_checkout().unwrap();
        assert_eq!(first.pid, 1);
        let second = g.try_checkout().unwrap();
        assert_eq!(second.pid, 2);
    }

    #[test]
    fn test_selection_tie_breaks_by_last_used_then_order() {
        let mut g = group(4);
        g.attach(fake_process(1, 4));
        g.attach(fake_process(2, 4));
        g.attach(fake_process(3, 4));

        // Make pid 2 the least recently used.
        {
            let (p, _) = g.find_process_mut(2).unwrap();
            p.last_used = 1;
        }
        assert_eq!(g.try_checkout().unwrap().pid, 2);

        // pids 1 and 3 now tie on sessions and differ only in attach order
        // once their last_used matches.
        {
            let (p1, _) = g.find_process_mut(1).unwrap();
            p1.last_used = 7;
        }
        {
            let (p3, _) = g.find_process_mut(3).unwrap();
            p3.last_used = 7;
        }
        assert_eq!(g.try_checkout().unwrap().pid, 1);
    }

    #[test]
    fn test_full_workers_not_selected() {
        let mut g = group(1);
        g.attach(fake_process(1, 1));
        assert!(g.try_checkout().is_some());
        assert!(g.try_checkout().is_none());
    }

    #[test]
    fn test_disabling_workers_not_selected() {
        let mut g = group(1);
        g.attach(fake_process(1, 1));
        assert!(g.mark_disabling(1));
        assert!(g.try_checkout().is_none());
        assert_eq!(g.enabled_count, 0);
        assert_eq!(g.disabling_count, 1);
        assert_eq!(g.process_count(), 1);
    }

    #[test]
    fn test_disabled_roundtrip() {
        let mut g = group(1);
        g.attach(fake_process(1, 1));
        assert!(g.mark_disabled(1));
        assert!(g.try_checkout().is_none());
        assert!(g.re_enable(1));
        assert!(g.try_checkout().is_some());
    }

    #[test]
    fn test_retire_disabled_moves_to_draining() {
        let mut g = group(1);
        g.attach(fake_process(1, 1));
        assert!(g.mark_disabled(1));
        assert!(g.retire_disabled(1));
        assert_eq!(g.disabled_count, 0);
        assert_eq!(g.disabling_count, 1);
        assert!(!g.retire_disabled(1));
    }

    #[test]
    fn test_detach_runs_shutdown_outside_caller() {
        let mut g = group(1);
        g.attach(fake_process(1, 1));
        let mut actions: Actions = Vec::new();
        assert!(g.detach(1, &mut actions));
        assert_eq!(g.process_count(), 0);
        assert_eq!(actions.len(), 1);
        for action in actions {
            action();
        }
    }

    #[test]
    fn test_expired_waiters_preserve_fifo_of_rest() {
        let mut g = group(1);
        g.queue_waiter(Waiter::for_test(1, 100));
        g.queue_waiter(Waiter::for_test(2, 5));
        g.queue_waiter(Waiter::for_test(3, 100));

        let expired = g.take_expired_waiters(50);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, 2);
        let rest: Vec<u64> = g.get_waitlist.iter().map(|w| w.id).collect();
        assert_eq!(rest, vec![1, 3]);
    }

    #[test]
    fn test_restart_drains_busy_and_detaches_idle() {
        let mut g = group(2);
        g.attach(fake_process(1, 2));
        g.attach(fake_process(2, 2));
        // pid 1 is busy, pid 2 idle.
        {
            let (p, _) = g.find_process_mut(1).unwrap();
            p.reserve_session();
        }

        let mut actions: Actions = Vec::new();
        g.restart(PoolOptions::new("/srv/app"), &mut actions);

        assert_eq!(g.enabled_count, 0);
        assert_eq!(g.disabling_count, 1);
        assert_eq!(actions.len(), 1); // idle pid 2 detached immediately
        for action in actions {
            action();
        }
    }
}
