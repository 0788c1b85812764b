//! Background collection of idle workers and idle preloaders.
//!
//! One dedicated thread sleeps on the pool's condition variable, wakes on a
//! computed deadline (or early, when limits change), retires whatever has
//! been idle past its lifetime, and goes back to sleep until the next
//! candidate becomes eligible. Detach work runs after the pool lock drops.

use super::{now_usec, Actions, Pool, Unlocked};
use crate::pool::group::Group;
use std::sync::Arc;
use std::time::Duration;

/// Delay before the first collection after pool startup.
const INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Sleep cap when worker collection is disabled and nothing is pending.
const IDLE_SLEEP: Duration = Duration::from_secs(10 * 60);

struct GcState {
    now: u64,
    /// Earliest future instant any retained candidate becomes eligible.
    /// 0 = no candidate.
    next_run: u64,
    actions: Actions,
}

impl GcState {
    fn note_candidate(&mut self, eligible_at: u64) {
        if self.next_run == 0 || eligible_at < self.next_run {
            self.next_run = eligible_at;
        }
    }
}

/// Thread body. Exits only when the pool shuts down.
pub(crate) fn garbage_collect_loop(pool: Arc<Pool>) {
    tracing::debug!("Garbage collector started");
    {
        let guard = pool.lock_inner();
        let _ = pool
            .gc_cond
            .wait_timeout(guard, INITIAL_DELAY)
            .expect("pool mutex poisoned");
    }
    while !pool.gc_should_stop() {
        let sleep = real_garbage_collect(&pool);
        let guard = pool.lock_inner();
        if pool.gc_should_stop() {
            break;
        }
        let _ = pool
            .gc_cond
            .wait_timeout(guard, sleep)
            .expect("pool mutex poisoned");
    }
    tracing::debug!("Garbage collector stopped");
}

/// One collection pass. Returns how long to sleep until the next one.
fn real_garbage_collect(pool: &Pool) -> Duration {
    let mut state = GcState {
        now: now_usec(),
        next_run: 0,
        actions: Vec::new(),
    };

    let max_idle_time;
    let mut out = Unlocked::default();
    {
        let mut inner = pool.lock_inner();
        inner.verify_invariants();
        max_idle_time = inner.max_idle_time;

        for sg in inner.super_groups.values_mut() {
            for group in &mut sg.groups {
                if max_idle_time > 0 {
                    collect_idle_workers(&mut state, group, max_idle_time);
                }
                maybe_clean_preloader(&mut state, group);
            }
        }

        // Retired workers freed capacity; parked requests get it first.
        let detached_any = !state.actions.is_empty();
        out.actions = std::mem::take(&mut state.actions);
        if detached_any {
            pool.rebalance(&mut inner, &mut out);
        }
        inner.verify_invariants();
    }

    let sleep = if state.next_run == 0 || state.next_run <= state.now {
        if max_idle_time == 0 {
            IDLE_SLEEP
        } else {
            Duration::from_micros(max_idle_time)
        }
    } else {
        Duration::from_micros(state.next_run - state.now)
    };
    tracing::debug!(
        detached = out.actions.len(),
        sleep_secs = sleep.as_secs_f64(),
        "Garbage collection pass done"
    );

    pool.run_unlocked(out);
    sleep
}

/// Retire workers idle past `max_idle_time`, oldest first, re-checking the
/// group's floor before each detach so it is never undershot.
fn collect_idle_workers(state: &mut GcState, group: &mut Group, max_idle_time: u64) {
    let min_processes = group.options.min_processes;

    let mut idle: Vec<(u64, i32)> = group
        .enabled
        .iter()
        .filter(|p| p.sessions == 0)
        .map(|p| (p.last_used, p.pid))
        .collect();
    idle.sort_unstable();

    for (last_used, pid) in idle {
        let eligible_at = last_used + max_idle_time;
        if state.now >= eligible_at && group.enabled_count > min_processes {
            tracing::debug!(pid, group = %group.name, "Garbage collecting idle worker");
            group.detach(pid, &mut state.actions);
        } else {
            state.note_candidate(eligible_at);
        }
    }
}

/// Retire the group's preloader once it has idled past its own lifetime.
/// A lifetime of zero pins the preloader, independent of worker collection.
fn maybe_clean_preloader(state: &mut GcState, group: &mut Group) {
    if !group.spawner.cleanable() || group.options.max_preloader_idle_time == 0 {
        return;
    }
    let eligible_at =
        group.spawner.last_used() + group.options.max_preloader_idle_time as u64 * 1_000_000;
    if state.now >= eligible_at {
        group.cleanup_spawner(&mut state.actions);
    } else {
        state.note_candidate(eligible_at);
    }
}
