use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::PoolError;
use crate::group::{Group, GroupLink};
use crate::options::Options;
use crate::pool::{Action, GetCallback, GetWaiter, PoolCore, PoolShared};

/// Lifecycle of a super group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuperGroupState {
    Initializing,
    Ready,
    Restarting,
    Destroying,
    Destroyed,
}

/// A namespace of one or more groups under one logical application.
///
/// Simple deployments have exactly one component and therefore one
/// group; multi-component applications route by component name.
pub(crate) struct SuperGroup {
    pub name: String,
    pub secret: String,
    pub state: SuperGroupState,
    pub groups: Vec<Group>,
    pub get_waitlist: VecDeque<GetWaiter>,
}

impl SuperGroup {
    pub fn new(name: String, secret: String) -> SuperGroup {
        SuperGroup {
            name,
            secret,
            state: SuperGroupState::Initializing,
            groups: Vec::new(),
            get_waitlist: VecDeque::new(),
        }
    }

    /// Builds the component groups and becomes ready.
    ///
    /// The component set is derived from the options; plain applications
    /// get a single "default" component.
    pub fn initialize(&mut self, options: &Options, shared: &Arc<PoolShared>) {
        debug_assert!(self.state == SuperGroupState::Initializing);
        let component = component_name(options);
        let link = Arc::new(GroupLink {
            super_group: self.name.clone(),
            component: component.to_string(),
            name: format!("{}#{}", self.name, component),
        });
        let secret = shared.random.ascii_string(43);
        let spawner = shared.spawner_factory.create(options);
        self.groups
            .push(Group::new(link, secret, options.clone(), spawner));
        self.state = SuperGroupState::Ready;
    }

    pub fn group_by_link_mut(&mut self, link: &Arc<GroupLink>) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| Arc::ptr_eq(&g.link, link))
    }

    /// Picks the group serving the given options.  Plain applications
    /// always land on the single default component.
    fn route_mut(&mut self, options: &Options) -> Option<&mut Group> {
        let component = component_name(options);
        self.groups
            .iter_mut()
            .find(|g| g.link.component == component)
    }

    pub fn get(
        &mut self,
        options: Options,
        callback: GetCallback,
        core: &mut PoolCore,
        shared: &Arc<PoolShared>,
        actions: &mut Vec<Action>,
    ) {
        match self.state {
            SuperGroupState::Destroying | SuperGroupState::Destroyed => {
                actions.push(Box::new(move || {
                    callback(Err(PoolError::super_group_gone()))
                }));
            }
            SuperGroupState::Initializing | SuperGroupState::Restarting => {
                self.get_waitlist.push_back(GetWaiter { options, callback });
            }
            SuperGroupState::Ready => match self.route_mut(&options) {
                Some(group) => {
                    group.restart_if_needed(core, shared, actions);
                    group.get(&options, callback, core, shared, actions);
                }
                None => {
                    actions.push(Box::new(move || callback(Err(PoolError::group_gone()))));
                }
            },
        }
    }

    /// Restarts every component group and re-routes queued requests.
    pub fn restart(
        &mut self,
        core: &mut PoolCore,
        shared: &Arc<PoolShared>,
        actions: &mut Vec<Action>,
    ) {
        if self.state != SuperGroupState::Ready {
            return;
        }
        self.state = SuperGroupState::Restarting;
        for group in self.groups.iter_mut() {
            if !group.restarting {
                let options = group.options.clone();
                group.restart(&options, core, shared, actions);
            }
        }
        // The component set is unchanged, so routing can resume at once;
        // the groups themselves finish restarting asynchronously.
        self.state = SuperGroupState::Ready;
        let waiters: Vec<GetWaiter> = self.get_waitlist.drain(..).collect();
        for waiter in waiters {
            self.get(waiter.options, waiter.callback, core, shared, actions);
        }
    }

    /// Tears the super group down; every queued or future request fails.
    pub fn destroy(&mut self, core: &mut PoolCore, actions: &mut Vec<Action>) {
        self.state = SuperGroupState::Destroying;
        for group in self.groups.iter_mut() {
            group.set_spawning_off(core);
            group.detach_all(core, actions);
            group.assign_exception_to_get_waiters(PoolError::super_group_gone(), actions);
        }
        while let Some(waiter) = self.get_waitlist.pop_front() {
            let callback = waiter.callback;
            actions.push(Box::new(move || {
                callback(Err(PoolError::super_group_gone()))
            }));
        }
        self.state = SuperGroupState::Destroyed;
    }

    pub fn process_count(&self) -> usize {
        self.groups.iter().map(|g| g.process_count()).sum()
    }
}

/// The component an options value routes to.  Multi-component routing
/// keys off the application type; everything maps to one component for
/// now.
fn component_name(_options: &Options) -> &'static str {
    "default"
}
