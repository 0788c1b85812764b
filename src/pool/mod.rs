//! The pool core: caps, registry, waitlists, and lifecycle orchestration.
//!
//! One coarse mutex serializes every structural mutation; condition
//! variables cover the garbage collector's sleep. Work that performs I/O
//! (worker shutdown, session checkout, request completions) is collected
//! while the lock is held and executed strictly after it is released.
//!
//! # Structure
//!
//! ```text
//!               ┌──────────────┐
//!               │     Pool     │  caps, registry, global waitlist
//!               └──────┬───────┘
//!        ┌─────────────┼─────────────┐
//!  ┌─────▼─────┐ ┌─────▼─────┐ ┌─────▼─────┐
//!  │SuperGroup │ │SuperGroup │ │SuperGroup │   one per app root
//!  └─────┬─────┘ └───────────┘ └───────────┘
//!  ┌─────▼─────┐
//!  │   Group   │  workers + waitlist for one app identity
//!  └─────┬─────┘
//!  ┌─────▼─────┐
//!  │  Process  │  sessions, concurrency, last_used
//!  └───────────┘
//! ```
//!
//! Ownership is strictly top-down; sessions and spawn threads refer back to
//! the pool through a weak handle plus names, never owning pointers, so no
//! reference cycles form.

pub(crate) mod gc;
pub(crate) mod group;
pub(crate) mod process;
pub(crate) mod session;
pub(crate) mod supergroup;

pub use session::Session;

use crate::error::{PoolError, Result};
use crate::options::PoolOptions;
use crate::spawn::SpawnerFactory;
use group::{CheckoutSpec, Group};
use process::Process;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use supergroup::SuperGroup;
use uuid::Uuid;

/// Wall clock in microseconds. All idle accounting uses this scale.
pub(crate) fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Deferred worker shutdowns, executed after the pool lock is released.
pub(crate) type Actions = Vec<Box<dyn FnOnce() + Send>>;

/// Completion sink of one `get` request.
pub(crate) type WaiterSink = Box<dyn FnOnce(Result<Session>) + Send>;

/// One queued `get` request.
pub(crate) struct Waiter {
    pub id: u64,
    pub options: PoolOptions,
    /// Wall-clock µs after which the request fails with `Busy`.
    pub deadline: u64,
    /// Times this request has been re-admitted from the global waitlist.
    pub retries: u32,
    pub sink: WaiterSink,
}

impl Waiter {
    #[cfg(test)]
    pub(crate) fn for_test(id: u64, deadline: u64) -> Self {
        Self {
            id,
            options: PoolOptions::new("/test"),
            deadline,
            retries: 0,
            sink: Box::new(|_| {}),
        }
    }
}

/// Work to perform once the pool lock has been released.
#[derive(Default)]
struct Unlocked {
    actions: Actions,
    completions: Vec<Completion>,
}

enum Completion {
    Fulfill { sink: WaiterSink, spec: CheckoutSpec },
    Fail { sink: WaiterSink, error: PoolError },
}

impl Unlocked {
    fn fulfill(&mut self, sink: WaiterSink, spec: CheckoutSpec) {
        self.completions.push(Completion::Fulfill { sink, spec });
    }

    fn fail(&mut self, waiter: Waiter, error: PoolError) {
        self.completions.push(Completion::Fail {
            sink: waiter.sink,
            error,
        });
    }

    fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.completions.is_empty()
    }
}

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on workers across all groups.
    pub max: u32,
    /// Default per-group worker cap when the request does not set one.
    /// 0 = unlimited.
    pub max_per_app: u32,
    /// Idle lifetime of a worker before the garbage collector retires it.
    /// Zero disables worker collection entirely.
    pub max_idle_time: Duration,
    /// Default deadline for blocking `get` calls.
    pub get_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 6,
            max_per_app: 0,
            max_idle_time: Duration::from_secs(120),
            get_timeout: Duration::from_secs(60),
        }
    }
}

pub(crate) struct PoolInner {
    pub max: u32,
    pub max_per_app: u32,
    /// µs; 0 = workers are never garbage collected.
    pub max_idle_time: u64,
    pub super_groups: BTreeMap<String, SuperGroup>,
    pub get_waitlist: VecDeque<Waiter>,
    pub next_waiter_id: u64,
    pub destroyed: bool,
}

impl PoolInner {
    /// Workers plus in-flight spawns, pool-wide.
    fn committed(&self) -> u32 {
        self.super_groups.values().map(|sg| sg.committed()).sum()
    }

    /// Workers a cap reduction marked as over-budget; they drain out
    /// through the disabling lists instead of dying mid-request.
    fn excess_draining(&self) -> u32 {
        self.super_groups
            .values()
            .flat_map(|sg| sg.groups.iter())
            .flat_map(|g| g.disabling.iter())
            .filter(|p| p.cap_excess)
            .count() as u32
    }

    fn process_count(&self) -> u32 {
        self.super_groups
            .values()
            .map(|sg| sg.process_count())
            .sum()
    }

    fn find_group_mut(&mut self, app_root: &str, group_name: &str) -> Option<&mut Group> {
        self.super_groups
            .get_mut(app_root)
            .and_then(|sg| sg.find_group_mut(group_name))
    }

    /// Structural sanity, checked at the boundary of every public
    /// operation in debug builds.
    fn verify_invariants(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        let mut seen_pids = std::collections::HashSet::new();
        for sg in self.super_groups.values() {
            for g in &sg.groups {
                debug_assert_eq!(
                    g.enabled_count as usize,
                    g.enabled.len(),
                    "enabled counter out of sync in {}",
                    g.name
                );
                debug_assert_eq!(
                    g.disabling_count as usize,
                    g.disabling.len(),
                    "disabling counter out of sync in {}",
                    g.name
                );
                debug_assert_eq!(
                    g.disabled_count as usize,
                    g.disabled.len(),
                    "disabled counter out of sync in {}",
                    g.name
                );
                for p in g.all_processes() {
                    debug_assert!(
                        seen_pids.insert(p.pid),
                        "worker {} appears in more than one list",
                        p.pid
                    );
                }
                if !g.get_waitlist.is_empty() {
                    debug_assert!(
                        g.spawning > 0
                            || self.committed() >= self.max
                            || !g.below_group_cap(self.max_per_app),
                        "group {} has waiters but could serve or spawn",
                        g.name
                    );
                }
            }
        }
        let spawning_total: u32 = self
            .super_groups
            .values()
            .flat_map(|sg| sg.groups.iter())
            .map(|g| g.spawning)
            .sum();
        // Capacity: the full worker sum (every role plus in-flight
        // spawns) stays under the cap. The one exception is a cap lowered
        // under live traffic: the over-budget workers drain out through
        // the disabling lists, counted by `excess_draining`, and a spawn
        // already in flight is shed when it lands.
        debug_assert!(
            spawning_total > 0 || self.committed() <= self.max + self.excess_draining(),
            "worker total exceeds the pool cap"
        );
        for waiter in &self.get_waitlist {
            let spare = self
                .super_groups
                .get(&waiter.options.app_root)
                .and_then(|sg| {
                    sg.groups
                        .iter()
                        .find(|g| g.name == waiter.options.app_group_name)
                })
                .map(|g| g.has_spare_capacity())
                .unwrap_or(false);
            debug_assert!(
                !spare,
                "pool-level waiter {} has a group with spare capacity",
                waiter.id
            );
        }
    }
}

/// The application pool: a supervisor over worker processes that hands out
/// request sessions. Construct with [`Pool::new`]; share via `Arc`.
pub struct Pool {
    inner: Mutex<PoolInner>,
    gc_cond: Condvar,
    gc_stop: AtomicBool,
    gc_thread: Mutex<Option<JoinHandle<()>>>,
    spawner_factory: Arc<dyn SpawnerFactory>,
    get_timeout: Duration,
    self_ref: Weak<Pool>,
}

impl Pool {
    /// Build a pool and start its garbage collector thread.
    pub fn new(config: PoolConfig, spawner_factory: Arc<dyn SpawnerFactory>) -> Arc<Self> {
        let pool = Arc::new_cyclic(|self_ref| Self {
            inner: Mutex::new(PoolInner {
                max: config.max,
                max_per_app: config.max_per_app,
                max_idle_time: config.max_idle_time.as_micros() as u64,
                super_groups: BTreeMap::new(),
                get_waitlist: VecDeque::new(),
                next_waiter_id: 0,
                destroyed: false,
            }),
            gc_cond: Condvar::new(),
            gc_stop: AtomicBool::new(false),
            gc_thread: Mutex::new(None),
            spawner_factory,
            get_timeout: config.get_timeout,
            self_ref: self_ref.clone(),
        });

        let handle = std::thread::Builder::new()
            .name("pool-gc".to_string())
            .spawn({
                let pool = pool.clone();
                move || gc::garbage_collect_loop(pool)
            })
            .expect("failed to spawn garbage collector thread");
        *pool.gc_thread.lock().expect("gc thread slot poisoned") = Some(handle);

        pool
    }

    fn lock_inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("pool mutex poisoned")
    }

    /// Check out a session, waiting up to the pool's default deadline.
    pub fn get(&self, options: &PoolOptions) -> Result<Session> {
        self.get_with_timeout(options, self.get_timeout)
    }

    /// Check out a session, waiting up to `timeout` for capacity.
    pub fn get_with_timeout(&self, options: &PoolOptions, timeout: Duration) -> Result<Session> {
        let (tx, rx) = mpsc::sync_channel(1);
        let id = self.async_get(options, timeout, move |result| {
            let _ = tx.send(result);
        });

        // A little slack past the pool-side deadline so a pool-delivered
        // Busy wins the race against our own cancellation.
        match rx.recv_timeout(timeout + Duration::from_millis(100)) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                if self.cancel_waiter(options, id) {
                    Err(PoolError::Busy(
                        "timed out waiting for an application worker".into(),
                    ))
                } else {
                    // Fulfilment raced the cancellation; the result is on
                    // its way.
                    rx.recv()
                        .map_err(|_| PoolError::Runtime("pool dropped the request".into()))?
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(PoolError::Runtime("pool dropped the request".into()))
            }
        }
    }

    /// Non-blocking checkout. The callback runs inline when the fast path
    /// succeeds, otherwise on whichever pool thread completes the request.
    /// Returns the waiter id, usable with [`Pool::cancel_waiter`].
    pub fn async_get(
        &self,
        options: &PoolOptions,
        timeout: Duration,
        callback: impl FnOnce(Result<Session>) + Send + 'static,
    ) -> u64 {
        let mut out = Unlocked::default();
        let id;
        {
            let mut inner = self.lock_inner();
            inner.verify_invariants();
            id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            let waiter = Waiter {
                id,
                options: options.clone(),
                deadline: now_usec().saturating_add(timeout.as_micros() as u64),
                retries: 0,
                sink: Box::new(callback),
            };
            self.dispatch_locked(&mut inner, waiter, &mut out);
            inner.verify_invariants();
        }
        self.run_unlocked(out);
        id
    }

    /// Remove a queued request. Returns false when the request is no
    /// longer queued (already fulfilled, failed, or never queued).
    pub fn cancel_waiter(&self, options: &PoolOptions, id: u64) -> bool {
        let mut inner = self.lock_inner();
        if let Some(pos) = inner.get_waitlist.iter().position(|w| w.id == id) {
            inner.get_waitlist.remove(pos);
            return true;
        }
        if let Some(group) =
            inner.find_group_mut(&options.app_root, &options.app_group_name)
        {
            if let Some(pos) = group.get_waitlist.iter().position(|w| w.id == id) {
                group.get_waitlist.remove(pos);
                return true;
            }
        }
        false
    }

    /// Detach every worker in every group and fail all queued requests
    /// with `Busy`. Returns once the detached workers have shut down.
    pub fn clear(&self) {
        let mut out = Unlocked::default();
        {
            let mut inner = self.lock_inner();
            inner.verify_invariants();
            let mut supergroups = std::mem::take(&mut inner.super_groups);
            for sg in supergroups.values_mut() {
                for waiter in sg.destroy(&mut out.actions) {
                    out.fail(waiter, PoolError::Busy("the pool is being cleared".into()));
                }
            }
            let orphaned: Vec<Waiter> = inner.get_waitlist.drain(..).collect();
            for waiter in orphaned {
                out.fail(waiter, PoolError::Busy("the pool is being cleared".into()));
            }
            inner.verify_invariants();
        }
        tracing::info!("Clearing pool");
        self.run_unlocked(out);
    }

    /// Raise or lower the pool-wide worker cap.
    pub fn set_max(&self, max: u32) {
        let mut out = Unlocked::default();
        {
            let mut inner = self.lock_inner();
            inner.verify_invariants();
            let old = inner.max;
            inner.max = max;
            tracing::info!(old, new = max, "Pool cap changed");
            if max > old {
                self.redispatch_pool_waitlist(&mut inner, &mut out);
            } else if max < old {
                self.shed_excess_workers(&mut inner, &mut out);
            }
            inner.verify_invariants();
        }
        self.run_unlocked(out);
        self.wakeup_garbage_collector();
    }

    /// Change the default per-group cap.
    pub fn set_max_per_app(&self, max_per_app: u32) {
        let mut out = Unlocked::default();
        {
            let mut inner = self.lock_inner();
            inner.verify_invariants();
            inner.max_per_app = max_per_app;
            // A raised cap may unblock queued requests.
            self.rebalance(&mut inner, &mut out);
            inner.verify_invariants();
        }
        self.run_unlocked(out);
    }

    /// Change the idle lifetime for workers. Zero disables collection.
    pub fn set_max_idle_time(&self, max_idle_time: Duration) {
        {
            let mut inner = self.lock_inner();
            inner.max_idle_time = max_idle_time.as_micros() as u64;
        }
        self.wakeup_garbage_collector();
    }

    /// Take a worker out of rotation but keep it warm. Outstanding
    /// sessions finish normally; no new ones are accepted until the
    /// worker is enabled again. Returns false for an unknown pid.
    pub fn disable_process(&self, pid: i32) -> bool {
        let mut out = Unlocked::default();
        let mut disabled = false;
        {
            let mut inner = self.lock_inner();
            inner.verify_invariants();
            'search: for sg in inner.super_groups.values_mut() {
                for group in &mut sg.groups {
                    if group.mark_disabled(pid) {
                        tracing::info!(pid, group = %group.name, "Worker disabled");
                        disabled = true;
                        break 'search;
                    }
                }
            }
            if disabled {
                // The group lost serving capacity; replacements may be due.
                self.rebalance(&mut inner, &mut out);
            }
            inner.verify_invariants();
        }
        self.run_unlocked(out);
        disabled
    }

    /// Bring a reserved worker back into rotation and hand queued
    /// requests its spare capacity. Returns false for an unknown pid.
    pub fn enable_process(&self, pid: i32) -> bool {
        let mut out = Unlocked::default();
        let mut enabled = false;
        {
            let mut inner = self.lock_inner();
            inner.verify_invariants();
            'search: for sg in inner.super_groups.values_mut() {
                for group in &mut sg.groups {
                    if group.re_enable(pid) {
                        tracing::info!(pid, group = %group.name, "Worker enabled");
                        Self::drain_group(group, &mut out);
                        enabled = true;
                        break 'search;
                    }
                }
            }
            if enabled {
                self.redispatch_pool_waitlist(&mut inner, &mut out);
            }
            inner.verify_invariants();
        }
        self.run_unlocked(out);
        enabled
    }

    /// Number of workers with at least one outstanding session.
    pub fn get_active(&self) -> u32 {
        let inner = self.lock_inner();
        inner
            .super_groups
            .values()
            .flat_map(|sg| sg.groups.iter())
            .flat_map(|g| g.all_processes())
            .filter(|p| p.sessions > 0)
            .count() as u32
    }

    /// Total workers in the pool, across all roles.
    pub fn get_count(&self) -> u32 {
        self.lock_inner().process_count()
    }

    /// Pid of the process that performs the actual spawning.
    pub fn spawn_server_pid(&self) -> i32 {
        let inner = self.lock_inner();
        inner
            .super_groups
            .values()
            .flat_map(|sg| sg.groups.iter())
            .next()
            .map(|g| g.spawner.server_pid())
            .unwrap_or_else(|| std::process::id() as i32)
    }

    /// Human-readable snapshot of every supergroup, group and worker.
    pub fn inspect(&self) -> String {
        let inner = self.lock_inner();
        let now = now_usec();
        let mut out = format!(
            "pool: max={} max_per_app={} workers={} queued={}\n",
            inner.max,
            inner.max_per_app,
            inner.process_count(),
            inner.get_waitlist.len()
        );
        for sg in inner.super_groups.values() {
            out.push_str(&sg.describe(now));
        }
        out
    }

    /// Restart every group under an app root with fresh options: current
    /// workers drain out while replacements spawn immediately.
    pub fn restart(&self, fresh_options: &PoolOptions) {
        let mut out = Unlocked::default();
        {
            let mut inner = self.lock_inner();
            inner.verify_invariants();
            let max = inner.max;
            let max_per_app = inner.max_per_app;
            let mut committed = inner.committed();
            if let Some(sg) = inner.super_groups.get_mut(&fresh_options.app_root) {
                sg.restart(fresh_options, &mut out.actions);
                for group in &mut sg.groups {
                    let demand =
                        (group.get_waitlist.len() as u32).max(group.options.min_processes);
                    while group.spawning < demand
                        && committed < max
                        && group.below_group_cap(max_per_app)
                    {
                        self.start_spawn(group);
                        committed += 1;
                    }
                }
            }
            inner.verify_invariants();
        }
        self.run_unlocked(out);
    }

    /// Shorten the garbage collector's current sleep.
    pub fn wakeup_garbage_collector(&self) {
        self.gc_cond.notify_all();
    }

    /// Stop the garbage collector and detach every worker. The pool is
    /// unusable afterwards; `get` fails with `Busy`.
    pub fn shutdown(&self) {
        {
            let mut inner = self.lock_inner();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
        }
        self.gc_stop.store(true, Ordering::Relaxed);
        self.gc_cond.notify_all();
        let handle = self
            .gc_thread
            .lock()
            .expect("gc thread slot poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.clear();
    }

    pub(crate) fn gc_should_stop(&self) -> bool {
        self.gc_stop.load(Ordering::Relaxed)
    }

    // ---- internals; every method below runs with the pool lock held ----

    /// Admission: serve, spawn-and-queue, queue on the group, or queue on
    /// the pool, in that order of preference.
    fn dispatch_locked(&self, inner: &mut PoolInner, waiter: Waiter, out: &mut Unlocked) {
        if inner.destroyed {
            out.fail(waiter, PoolError::Busy("the pool is shutting down".into()));
            return;
        }
        if waiter.deadline <= now_usec() {
            out.fail(
                waiter,
                PoolError::Busy("request deadline elapsed before admission".into()),
            );
            return;
        }

        let max = inner.max;
        let max_per_app = inner.max_per_app;
        let mut committed = inner.committed();

        // Split borrows: the supergroup registry and the global waitlist
        // are touched independently below.
        let PoolInner {
            super_groups,
            get_waitlist,
            ..
        } = &mut *inner;

        let sg = super_groups
            .entry(waiter.options.app_root.clone())
            .or_insert_with(|| {
                tracing::debug!(app_root = %waiter.options.app_root, "New supergroup");
                SuperGroup::new(waiter.options.app_root.clone())
            });

        if sg.find_group_mut(&waiter.options.app_group_name).is_none() {
            let secret = Uuid::new_v4().simple().to_string();
            let spawner: Arc<dyn crate::spawn::Spawner> =
                Arc::from(self.spawner_factory.create(&waiter.options));
            let group = Group::new(waiter.options.clone(), secret, spawner);
            tracing::info!(group = %group.name, "New application group");
            let group = sg.add_group(group);
            // Bring the group up to its configured floor right away.
            while group.spawning < group.options.min_processes
                && committed < max
                && group.below_group_cap(max_per_app)
            {
                self.start_spawn(group);
                committed += 1;
            }
        }

        let group = sg
            .find_group_mut(&waiter.options.app_group_name)
            .expect("group was just ensured");

        if group.destroying {
            out.fail(waiter, PoolError::Busy("application is shutting down".into()));
            return;
        }

        if let Some(spec) = group.try_checkout() {
            out.fulfill(waiter.sink, spec);
            return;
        }

        let group_cap_ok = group.below_group_cap(max_per_app);
        let pool_cap_ok = committed < max;

        if group_cap_ok && pool_cap_ok {
            group.queue_waiter(waiter);
            if group.spawning < group.get_waitlist.len() as u32 {
                self.start_spawn(group);
            }
        } else if !group_cap_ok {
            // The group is at its own limit; a released session or a
            // retired sibling will serve this.
            group.queue_waiter(waiter);
        } else {
            // Pool-wide capacity is exhausted; park globally until a
            // worker retires or the cap is raised.
            tracing::debug!(waiter = waiter.id, "Pool at capacity, parking request");
            get_waitlist.push_back(waiter);
        }
    }

    /// Begin one spawn for the group. The worker attaches (or the failure
    /// propagates) via [`Pool::spawn_complete`] on a helper thread.
    fn start_spawn(&self, group: &mut Group) {
        group.spawning += 1;
        let pool = self.self_ref.clone();
        let options = group.options.clone();
        let secret = group.secret.clone();
        let spawner = group.spawner.clone();
        let app_root = group.app_root.clone();
        let group_name = group.name.clone();
        tracing::debug!(group = %group_name, in_flight = group.spawning, "Starting spawn");

        std::thread::Builder::new()
            .name("pool-spawn".to_string())
            .spawn(move || {
                let result = spawner.spawn(&options, &secret);
                match pool.upgrade() {
                    Some(pool) => pool.spawn_complete(&app_root, &group_name, result),
                    None => {
                        // Pool is gone; do not leak a fresh worker.
                        if let Ok(worker) = result {
                            Process::new(worker, options.concurrency).shutdown();
                        }
                    }
                }
            })
            .expect("failed to spawn worker-spawn thread");
    }

    /// Runs on the spawn helper thread once the spawner returns.
    fn spawn_complete(
        &self,
        app_root: &str,
        group_name: &str,
        result: Result<crate::spawn::SpawnedWorker>,
    ) {
        let mut out = Unlocked::default();
        {
            let mut inner = self.lock_inner();
            let group = match inner.find_group_mut(app_root, group_name) {
                Some(group) => group,
                None => {
                    // The group was cleared while we were spawning.
                    if let Ok(worker) = result {
                        let concurrency = 1;
                        let process = Process::new(worker, concurrency);
                        out.actions.push(Box::new(move || process.shutdown()));
                    }
                    inner.verify_invariants();
                    drop(inner);
                    self.run_unlocked(out);
                    return;
                }
            };

            group.spawning -= 1;
            match result {
                Ok(worker) => {
                    let process = Process::new(worker, group.options.concurrency);
                    tracing::info!(
                        group = %group.name,
                        pid = process.pid,
                        "Worker attached"
                    );
                    if group.destroying {
                        out.actions.push(Box::new(move || process.shutdown()));
                    } else {
                        group.attach(process);
                        Self::drain_group(group, &mut out);
                    }
                }
                Err(e) => {
                    tracing::warn!(group = %group.name, error = %e, "Spawn failed");
                    // Requests can only wait for another enabled worker or
                    // another in-flight spawn; with neither, fail them all.
                    if group.enabled_count == 0 && group.spawning == 0 {
                        for waiter in group.take_all_waiters() {
                            out.fail(waiter, clone_spawn_error(&e));
                        }
                    }
                }
            }
            self.rebalance(&mut inner, &mut out);
            // A cap lowered while this spawn was in flight takes effect
            // now that the worker has landed.
            if inner.committed() > inner.max + inner.excess_draining() {
                self.shed_excess_workers(&mut inner, &mut out);
            }
            inner.verify_invariants();
        }
        self.run_unlocked(out);
    }

    /// Called by [`Session`] on drop: lower the worker's session counter
    /// and hand the freed slot to the longest-waiting request.
    pub(crate) fn release_session(&self, app_root: &str, app_group: &str, pid: i32) {
        let mut out = Unlocked::default();
        {
            let mut inner = self.lock_inner();
            let Some(group) = inner.find_group_mut(app_root, app_group) else {
                // The worker was cleared while the session was out.
                return;
            };
            let Some((process, role)) = group.find_process_mut(pid) else {
                return;
            };
            let now_idle = process.release_session();
            tracing::trace!(pid, group = %app_group, now_idle, "Session released");

            if role == group::Role::Disabling && now_idle {
                group.detach(pid, &mut out.actions);
            } else {
                Self::drain_group(group, &mut out);
            }
            self.rebalance(&mut inner, &mut out);
            inner.verify_invariants();
        }
        self.run_unlocked(out);
    }

    /// Undo a checkout whose worker I/O failed, and detach the worker: a
    /// control channel that cannot produce sessions is not coming back.
    fn checkout_failed(&self, spec: &CheckoutSpec) {
        let mut out = Unlocked::default();
        {
            let mut inner = self.lock_inner();
            if let Some(group) = inner.find_group_mut(&spec.app_root, &spec.app_group) {
                if let Some((process, _)) = group.find_process_mut(spec.pid) {
                    process.release_session();
                }
                group.detach(spec.pid, &mut out.actions);
            }
            self.rebalance(&mut inner, &mut out);
            inner.verify_invariants();
        }
        self.run_unlocked(out);
    }

    /// FIFO-serve a group's waitlist while any worker has a spare slot,
    /// failing expired entries along the way.
    fn drain_group(group: &mut Group, out: &mut Unlocked) {
        for waiter in group.take_expired_waiters(now_usec()) {
            out.fail(
                waiter,
                PoolError::Busy("request deadline elapsed in queue".into()),
            );
        }
        while !group.get_waitlist.is_empty() {
            match group.try_checkout() {
                Some(spec) => {
                    let waiter = group
                        .get_waitlist
                        .pop_front()
                        .expect("waitlist emptied under the pool lock");
                    out.fulfill(waiter.sink, spec);
                }
                None => break,
            }
        }
    }

    /// Re-examine every waitlist after a capacity change: serve what can
    /// be served, start spawns the caps now allow, re-dispatch pool-level
    /// waiters.
    fn rebalance(&self, inner: &mut PoolInner, out: &mut Unlocked) {
        let max = inner.max;
        let max_per_app = inner.max_per_app;
        let mut committed = inner.committed();

        for sg in inner.super_groups.values_mut() {
            for group in &mut sg.groups {
                if group.get_waitlist.is_empty() || group.destroying {
                    continue;
                }
                Self::drain_group(group, out);
                while group.spawning < group.get_waitlist.len() as u32
                    && committed < max
                    && group.below_group_cap(max_per_app)
                {
                    self.start_spawn(group);
                    committed += 1;
                }
            }
        }

        self.redispatch_pool_waitlist(inner, out);
    }

    /// Give every globally parked request another pass through admission.
    fn redispatch_pool_waitlist(&self, inner: &mut PoolInner, out: &mut Unlocked) {
        if inner.get_waitlist.is_empty() {
            return;
        }
        let parked: Vec<Waiter> = inner.get_waitlist.drain(..).collect();
        for mut waiter in parked {
            // The deadline bounds how long this can go on; the counter is
            // for diagnostics.
            waiter.retries += 1;
            tracing::trace!(waiter = waiter.id, retries = waiter.retries, "Re-admitting");
            self.dispatch_locked(inner, waiter, out);
        }
    }

    /// After a cap reduction: bring the worker total back under the cap.
    /// Idle workers are detached outright, warm reserve first; busy ones
    /// are marked as draining excess and detach on their last release.
    fn shed_excess_workers(&self, inner: &mut PoolInner, out: &mut Unlocked) {
        let max = inner.max;
        let mut effective = inner.committed() - inner.excess_draining();
        if effective <= max {
            return;
        }
        'groups: for sg in inner.super_groups.values_mut() {
            for group in &mut sg.groups {
                loop {
                    if effective <= max {
                        break 'groups;
                    }
                    if let Some(pid) = oldest_idle(&group.disabled) {
                        group.detach(pid, &mut out.actions);
                    } else if let Some(pid) = oldest_idle(&group.enabled) {
                        group.detach(pid, &mut out.actions);
                    } else if let Some(pid) = group.enabled.first().map(|p| p.pid) {
                        group.mark_disabling(pid);
                        if let Some((process, _)) = group.find_process_mut(pid) {
                            process.cap_excess = true;
                        }
                    } else if let Some(pid) = group.disabled.first().map(|p| p.pid) {
                        group.retire_disabled(pid);
                        if let Some((process, _)) = group.find_process_mut(pid) {
                            process.cap_excess = true;
                        }
                    } else {
                        break; // group exhausted, try the next one
                    }
                    effective -= 1;
                }
            }
        }
    }

    /// Execute deferred work. Never called with the pool lock held.
    fn run_unlocked(&self, out: Unlocked) {
        if out.is_empty() {
            return;
        }
        for action in out.actions {
            action();
        }
        for completion in out.completions {
            match completion {
                Completion::Fulfill { sink, spec } => {
                    let result = self.perform_checkout(spec);
                    sink(result);
                }
                Completion::Fail { sink, error } => sink(Err(error)),
            }
        }
    }

    /// The I/O half of a checkout: ask the worker for a fresh session
    /// channel over its control socket.
    fn perform_checkout(&self, spec: CheckoutSpec) -> Result<Session> {
        let io = (|| -> Result<std::os::fd::OwnedFd> {
            let mut channel = spec
                .control
                .lock()
                .map_err(|_| PoolError::Runtime("worker control channel poisoned".into()))?;
            channel.set_read_timeout(Some(Duration::from_secs(30)))?;
            channel.set_write_timeout(Some(Duration::from_secs(30)))?;
            channel.write_vec(&["spawn", spec.secret.as_str()])?;
            channel.recv_fd()
        })();

        match io {
            Ok(fd) => Ok(Session::new(
                self.self_ref.clone(),
                spec.app_root.clone(),
                spec.app_group.clone(),
                spec.pid,
                spec.session_id,
                fd,
            )),
            Err(e) => {
                tracing::warn!(pid = spec.pid, error = %e, "Session checkout failed");
                self.checkout_failed(&spec);
                Err(e)
            }
        }
    }
}

fn oldest_idle(list: &[Process]) -> Option<i32> {
    list.iter()
        .filter(|p| p.sessions == 0)
        .min_by_key(|p| p.last_used)
        .map(|p| p.pid)
}

fn clone_spawn_error(e: &PoolError) -> PoolError {
    match e {
        PoolError::Spawn {
            message,
            error_page,
        } => PoolError::Spawn {
            message: message.clone(),
            error_page: error_page.clone(),
        },
        other => PoolError::spawn(other.to_string()),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;

    fn options_for(root: &str, max_processes: u32, concurrency: u32) -> PoolOptions {
        let mut options = PoolOptions::new(root);
        options.max_processes = max_processes;
        options.concurrency = concurrency;
        options
    }

    #[test]
    fn test_cold_get_spawns_one_worker() {
        let (pool, _factory) = test_pool(4, 2);
        let options = options_for("/a", 2, 1);

        let session = pool.get(&options).expect("cold get");
        assert!(session.stream().is_some());
        assert_eq!(pool.get_count(), 1);
        assert_eq!(pool.get_active(), 1);

        drop(session);
        assert_eq!(pool.get_active(), 0);
        assert_eq!(pool.get_count(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_fast_path_stacks_sessions_up_to_concurrency() {
        let (pool, factory) = test_pool(4, 2);
        let options = options_for("/a", 2, 2);

        let s1 = pool.get(&options).unwrap();
        let s2 = pool.get(&options).unwrap();
        // The worker had a spare concurrency slot, so no second spawn.
        assert_eq!(pool.get_count(), 1);
        assert_eq!(s1.pid(), s2.pid());
        assert_eq!(factory.template.spawn_count.load(Ordering::Relaxed), 1);

        // A third session exceeds concurrency=2 and forces a new worker.
        let s3 = pool.get(&options).unwrap();
        assert_eq!(pool.get_count(), 2);
        assert_ne!(s3.pid(), s1.pid());
        drop((s1, s2, s3));
        pool.shutdown();
    }

    #[test]
    fn test_saturation_queues_then_release_dispatches() {
        let (pool, _factory) = test_pool(4, 2);
        let options = options_for("/a", 2, 1);

        let s1 = pool.get(&options).unwrap();
        let s2 = pool.get(&options).unwrap();
        assert_eq!(pool.get_active(), 2);

        // Third request has nowhere to go: both workers are at their
        // concurrency cap and the group is at maxProcesses.
        let waiter = std::thread::spawn({
            let pool = pool.clone();
            let options = options.clone();
            move || pool.get_with_timeout(&options, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.get_count(), 2);

        let released_pid = s1.pid();
        drop(s1);
        let s3 = waiter.join().unwrap().expect("queued get served");
        assert_eq!(s3.pid(), released_pid);
        assert_eq!(pool.get_active(), 2);

        drop(s2);
        drop(s3);
        pool.shutdown();
    }

    #[test]
    fn test_spawn_failure_fails_get_and_pool_recovers() {
        let (pool, factory) = test_pool(4, 2);
        let options = options_for("/a", 2, 1);

        factory.template.fail_spawns.store(true, Ordering::Relaxed);
        let err = pool.get(&options).unwrap_err();
        assert!(matches!(err, PoolError::Spawn { .. }));
        assert_eq!(pool.get_count(), 0);

        factory.template.fail_spawns.store(false, Ordering::Relaxed);
        let session = pool.get(&options).expect("retry after spawn failure");
        assert_eq!(pool.get_count(), 1);
        drop(session);
        pool.shutdown();
    }

    #[test]
    fn test_get_times_out_busy_when_saturated() {
        let (pool, _factory) = test_pool(1, 1);
        let options = options_for("/a", 1, 1);

        let _busy = pool.get(&options).unwrap();
        let err = pool
            .get_with_timeout(&options, Duration::from_millis(150))
            .unwrap_err();
        assert!(matches!(err, PoolError::Busy(_)));
        pool.shutdown();
    }

    #[test]
    fn test_global_cap_parks_other_apps() {
        let (pool, _factory) = test_pool(1, 0);
        let a = options_for("/a", 0, 1);
        let b = options_for("/b", 0, 1);

        let held = pool.get(&a).unwrap();
        assert_eq!(pool.get_count(), 1);

        // /b cannot spawn: the pool cap is exhausted by /a.
        let waiter = std::thread::spawn({
            let pool = pool.clone();
            let b = b.clone();
            move || pool.get_with_timeout(&b, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.get_count(), 1);

        // Releasing /a's only session doesn't retire the worker, but
        // raising the cap lets /b in.
        pool.set_max(2);
        let session = waiter.join().unwrap().expect("parked get served");
        assert_eq!(pool.get_count(), 2);
        drop(session);
        drop(held);
        pool.shutdown();
    }

    #[test]
    fn test_clear_fails_queued_waiters_busy() {
        let (pool, _factory) = test_pool(1, 1);
        let options = options_for("/a", 1, 1);

        let held = pool.get(&options).unwrap();
        let waiter = std::thread::spawn({
            let pool = pool.clone();
            let options = options.clone();
            move || pool.get_with_timeout(&options, Duration::from_secs(10))
        });
        std::thread::sleep(Duration::from_millis(100));

        pool.clear();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, PoolError::Busy(_)));
        assert_eq!(pool.get_count(), 0);

        // The cleared pool serves fresh requests again.
        drop(held);
        let session = pool.get(&options).expect("get after clear");
        drop(session);
        pool.shutdown();
    }

    #[test]
    fn test_set_max_lower_sheds_idle_workers() {
        let (pool, _factory) = test_pool(4, 0);
        let options = options_for("/a", 3, 1);

        let s1 = pool.get(&options).unwrap();
        let s2 = pool.get(&options).unwrap();
        let s3 = pool.get(&options).unwrap();
        assert_eq!(pool.get_count(), 3);
        drop(s1);
        drop(s2);
        drop(s3);

        pool.set_max(1);
        // Idle workers are detached synchronously by set_max.
        assert_eq!(pool.get_count(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_disable_and_enable_process() {
        let (pool, _factory) = test_pool(4, 0);
        let options = options_for("/a", 2, 1);

        let s1 = pool.get(&options).unwrap();
        let first_pid = s1.pid();
        drop(s1);

        assert!(pool.disable_process(first_pid));
        assert!(!pool.disable_process(first_pid)); // no longer enabled
        assert!(!pool.disable_process(999_999));

        // The reserved worker is skipped; a fresh one serves instead.
        let s2 = pool.get(&options).unwrap();
        assert_ne!(s2.pid(), first_pid);
        assert_eq!(pool.get_count(), 2);

        // Re-enabled, the warm worker takes the next session again.
        assert!(pool.enable_process(first_pid));
        let s3 = pool.get(&options).unwrap();
        assert_eq!(s3.pid(), first_pid);
        drop((s2, s3));
        pool.shutdown();
    }

    #[test]
    fn test_set_max_lower_evicts_warm_reserve_first() {
        let (pool, _factory) = test_pool(4, 0);
        let options = options_for("/a", 3, 1);

        let s1 = pool.get(&options).unwrap();
        let s2 = pool.get(&options).unwrap();
        let s3 = pool.get(&options).unwrap();
        let reserved_pid = s1.pid();
        drop((s1, s2, s3));

        assert!(pool.disable_process(reserved_pid));
        assert_eq!(pool.get_count(), 3);

        pool.set_max(2);
        // The idle reserve goes first; the enabled workers survive.
        assert_eq!(pool.get_count(), 2);
        assert!(pool.inspect().contains("disabled=0"));
        pool.shutdown();
    }

    #[test]
    fn test_set_max_lower_drains_busy_workers() {
        let (pool, _factory) = test_pool(4, 0);
        let options = options_for("/a", 2, 1);

        let s1 = pool.get(&options).unwrap();
        let s2 = pool.get(&options).unwrap();

        pool.set_max(1);
        // Nothing dies mid-request; one busy worker is marked to drain.
        assert_eq!(pool.get_count(), 2);
        assert_eq!(pool.get_active(), 2);

        drop(s1);
        drop(s2);
        // The draining worker detached on its last release.
        assert_eq!(pool.get_count(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_min_processes_prespawns() {
        let (pool, _factory) = test_pool(4, 0);
        let mut options = options_for("/a", 3, 1);
        options.min_processes = 2;

        let session = pool.get(&options).unwrap();
        // One worker serves the request; the floor brings up a second.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.get_count() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.get_count(), 2);
        drop(session);
        pool.shutdown();
    }

    #[test]
    fn test_session_stream_is_duplex() {
        let (pool, _factory) = test_pool(2, 0);
        let options = options_for("/a", 0, 1);

        let mut session = pool.get(&options).unwrap();
        let fd = session.take_stream().expect("stream present");
        let mut stream = std::os::unix::net::UnixStream::from(fd);
        use std::io::{Read, Write};
        stream.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello"); // stub workers echo
        drop(stream);
        drop(session);
        pool.shutdown();
    }

    #[test]
    fn test_inspect_mentions_groups_and_workers() {
        let (pool, _factory) = test_pool(2, 0);
        let options = options_for("/a", 0, 1);
        let session = pool.get(&options).unwrap();

        let snapshot = pool.inspect();
        assert!(snapshot.contains("supergroup /a"));
        assert!(snapshot.contains("group /a"));
        assert!(snapshot.contains(&format!("pid {:<8}", session.pid())));
        drop(session);
        pool.shutdown();
    }

    #[test]
    fn test_async_get_callback_inline_on_fast_path() {
        let (pool, _factory) = test_pool(2, 0);
        let options = options_for("/a", 0, 2);
        let warm = pool.get(&options).unwrap();

        let delivered = Arc::new(AtomicBool::new(false));
        pool.async_get(&options, Duration::from_secs(1), {
            let delivered = delivered.clone();
            move |result| {
                assert!(result.is_ok());
                delivered.store(true, Ordering::Relaxed);
            }
        });
        // Fast path: the worker had a spare slot, so the callback already
        // ran on this thread.
        assert!(delivered.load(Ordering::Relaxed));
        drop(warm);
        pool.shutdown();
    }

    #[test]
    fn test_restart_replaces_workers() {
        let (pool, _factory) = test_pool(4, 0);
        let mut options = options_for("/a", 2, 1);
        options.min_processes = 1;

        let session = pool.get(&options).unwrap();
        let old_pid = session.pid();

        pool.restart(&options);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.get_count() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        // The busy worker is draining; the replacement serves new gets.
        let fresh = pool.get(&options).unwrap();
        assert_ne!(fresh.pid(), old_pid);

        // Once its session finishes, the old worker disappears.
        drop(session);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.get_count() > 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.get_count(), 1);
        drop(fresh);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent_and_rejects_gets() {
        let (pool, _factory) = test_pool(2, 0);
        pool.shutdown();
        pool.shutdown();
        let err = pool.get(&options_for("/a", 0, 1)).unwrap_err();
        assert!(matches!(err, PoolError::Busy(_)));
    }
}
