//! A set of groups sharing one application root.
//!
//! Routing resolves an app root to a supergroup first, then picks the group
//! matching the request's group name. Most supergroups hold exactly one
//! group; deployment variants (same root, different environment) add more.

use crate::options::PoolOptions;
use crate::pool::group::Group;
use crate::pool::Actions;

/// Supergroup lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuperGroupState {
    Initializing,
    Ready,
    Restarting,
    Destroying,
    Destroyed,
}

pub(crate) struct SuperGroup {
    pub name: String,
    pub groups: Vec<Group>,
    pub state: SuperGroupState,
}

impl SuperGroup {
    pub fn new(name: String) -> Self {
        Self {
            name,
            groups: Vec::new(),
            state: SuperGroupState::Initializing,
        }
    }

    /// Find the group serving `app_group_name`.
    pub fn find_group_mut(&mut self, app_group_name: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.name == app_group_name)
    }

    pub fn add_group(&mut self, group: Group) -> &mut Group {
        self.groups.push(group);
        self.state = SuperGroupState::Ready;
        self.groups.last_mut().unwrap()
    }

    /// Total worker slots committed by all member groups.
    pub fn committed(&self) -> u32 {
        self.groups.iter().map(|g| g.committed()).sum()
    }

    pub fn process_count(&self) -> u32 {
        self.groups.iter().map(|g| g.process_count()).sum()
    }

    /// Restart every member group with fresh options. Waitlists stay put
    /// and are served by the replacement workers the pool core spawns.
    pub fn restart(&mut self, fresh_options: &PoolOptions, actions: &mut Actions) {
        self.state = SuperGroupState::Restarting;
        for group in &mut self.groups {
            let mut options = fresh_options.clone();
            options.app_group_name = group.name.clone();
            group.restart(options, actions);
        }
        self.state = SuperGroupState::Ready;
    }

    /// Begin teardown: fail queued requests and drain the workers.
    pub fn destroy(&mut self, actions: &mut Actions) -> Vec<crate::pool::Waiter> {
        self.state = SuperGroupState::Destroying;
        let mut orphaned = Vec::new();
        for group in &mut self.groups {
            group.destroying = true;
            orphaned.extend(group.take_all_waiters());
            group.detach_all(actions);
        }
        self.state = SuperGroupState::Destroyed;
        orphaned
    }

    /// Per-supergroup block of the pool snapshot.
    pub fn describe(&self, now: u64) -> String {
        let mut out = format!("supergroup {} [{:?}]\n", self.name, self.state);
        for group in &self.groups {
            out.push_str(&group.describe(now));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::spawn::{SpawnedWorker, Spawner};
    use std::sync::Arc;

    struct NullSpawner;

    impl Spawner for NullSpawner {
        fn spawn(&self, _options: &PoolOptions, _secret: &str) -> Result<SpawnedWorker> {
            unreachable!("supergroup unit tests never spawn")
        }
        fn last_used(&self) -> u64 {
            0
        }
    }

    fn make_group(root: &str, name: &str) -> Group {
        let mut options = PoolOptions::new(root);
        options.app_group_name = name.to_string();
        Group::new(options, "secret".into(), Arc::new(NullSpawner))
    }

    #[test]
    fn test_routing_by_group_name() {
        let mut sg = SuperGroup::new("/srv/app".into());
        assert_eq!(sg.state, SuperGroupState::Initializing);
        sg.add_group(make_group("/srv/app", "/srv/app"));
        sg.add_group(make_group("/srv/app", "/srv/app#staging"));
        assert_eq!(sg.state, SuperGroupState::Ready);

        assert!(sg.find_group_mut("/srv/app").is_some());
        assert!(sg.find_group_mut("/srv/app#staging").is_some());
        assert!(sg.find_group_mut("/srv/other").is_none());
    }

    #[test]
    fn test_destroy_orphans_waitlist() {
        let mut sg = SuperGroup::new("/srv/app".into());
        sg.add_group(make_group("/srv/app", "/srv/app"));
        sg.find_group_mut("/srv/app")
            .unwrap()
            .queue_waiter(crate::pool::Waiter::for_test(9, u64::MAX));

        let mut actions: Actions = Vec::new();
        let orphaned = sg.destroy(&mut actions);
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].id, 9);
        assert_eq!(sg.state, SuperGroupState::Destroyed);
    }
}
