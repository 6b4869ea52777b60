use std::collections::VecDeque;
use std::convert::TryFrom;
use std::fs;
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::channel::MessageChannel;
use crate::error::PoolError;
use crate::options::Options;
use crate::pool::{self, Action, GetCallback, GetWaiter, PoolCore, PoolShared};
use crate::pqueue::PriorityQueue;
use crate::process::{EnableState, Process};
use crate::session::Session;
use crate::spawn::Spawner;

const OOBW_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of asking a process to leave the rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableResult {
    /// The process is disabled; the callback fired (or will, deferred).
    Success,
    /// The process is draining; the callback fires once it goes idle.
    Deferred,
    /// The process was already disabled.
    Noop,
    /// The process went away before the disable could complete.
    Canceled,
    /// Bookkeeping did not match the process state.
    Error,
}

pub type DisableCallback = Box<dyn FnOnce(DisableResult) + Send>;

struct DisableWaiter {
    process: Arc<Process>,
    callback: DisableCallback,
}

/// Stable identity of a group, held by sessions, callbacks and helper
/// threads across lock gaps.  After re-locking, holders resolve the
/// group by name and compare links by pointer; a mismatch means the
/// group was destroyed and the operation silently aborts.
pub struct GroupLink {
    pub(crate) super_group: String,
    pub(crate) component: String,
    pub(crate) name: String,
}

/// A pool of interchangeable worker processes for one application
/// component.
///
/// All state here is guarded by the pool's one coarse lock; methods
/// taking `&mut self` are only reachable through it.
pub(crate) struct Group {
    pub link: Arc<GroupLink>,
    pub secret: String,
    pub options: Options,
    pub spawner: Arc<dyn Spawner>,
    pqueue: PriorityQueue<Arc<Process>>,
    pub enabled_processes: Vec<Arc<Process>>,
    pub disabling_processes: Vec<Arc<Process>>,
    pub disabled_processes: Vec<Arc<Process>>,
    pub get_waitlist: VecDeque<GetWaiter>,
    disable_waitlist: Vec<DisableWaiter>,
    pub spawning: bool,
    pub restarting: bool,
    restart_file: PathBuf,
    always_restart_file: PathBuf,
    observed_restart_mtime: Option<SystemTime>,
}

impl Group {
    pub fn new(
        link: Arc<GroupLink>,
        secret: String,
        options: Options,
        spawner: Arc<dyn Spawner>,
    ) -> Group {
        let restart_file = options.restart_file_path();
        let always_restart_file = options.always_restart_file_path();
        let observed_restart_mtime = file_mtime(&always_restart_file);
        Group {
            link,
            secret,
            options,
            spawner,
            pqueue: PriorityQueue::new(),
            enabled_processes: Vec::new(),
            disabling_processes: Vec::new(),
            disabled_processes: Vec::new(),
            get_waitlist: VecDeque::new(),
            disable_waitlist: Vec::new(),
            spawning: false,
            restarting: false,
            restart_file,
            always_restart_file,
            observed_restart_mtime,
        }
    }

    pub fn process_count(&self) -> usize {
        self.enabled_processes.len() + self.disabling_processes.len() + self.disabled_processes.len()
    }

    pub fn at_max_processes(&self) -> bool {
        self.options.max_processes > 0
            && self.process_count() >= self.options.max_processes as usize
    }

    fn top_at_full_capacity(&self) -> bool {
        self.pqueue.top().map_or(true, |p| p.at_full_capacity())
    }

    pub fn should_spawn(&self, core: &PoolCore) -> bool {
        !self.spawning
            && !self.restarting
            && (self.enabled_processes.is_empty() || self.top_at_full_capacity())
            && !self.at_max_processes()
            && !core.at_full_capacity()
    }

    fn set_spawning(&mut self, core: &mut PoolCore, value: bool) {
        if self.spawning != value {
            self.spawning = value;
            if value {
                core.spawning_groups += 1;
            } else {
                core.spawning_groups -= 1;
            }
        }
    }

    pub fn set_spawning_off(&mut self, core: &mut PoolCore) {
        self.set_spawning(core, false);
    }

    /// The fundamental request entry.  The callback fires exactly once,
    /// with a session or an error, always outside the lock.
    pub fn get(
        &mut self,
        options: &Options,
        callback: GetCallback,
        core: &mut PoolCore,
        shared: &Arc<PoolShared>,
        actions: &mut Vec<Action>,
    ) {
        self.options = options.clone();
        if self.restarting || self.enabled_processes.is_empty() || self.top_at_full_capacity() {
            self.get_waitlist.push_back(GetWaiter {
                options: options.clone(),
                callback,
            });
            if self.should_spawn(core) {
                self.spawn(core, shared);
            }
        } else if let Some(session) = self.new_session(shared) {
            actions.push(Box::new(move || callback(Ok(session))));
        }
        self.verify_invariants(core);
    }

    /// Leases the least-loaded process.  Returns `None` when every
    /// enabled process is at full capacity.
    fn new_session(&mut self, shared: &Arc<PoolShared>) -> Option<Session> {
        let process = match self.pqueue.top() {
            Some(p) if !p.at_full_capacity() => p.clone(),
            _ => return None,
        };
        let (socket_index, connection) = match process.open_session_slot() {
            Ok(rv) => rv,
            Err(_) => return None,
        };
        if let Some(handle) = process.pq_handle() {
            self.pqueue.update_key(handle, process.utilization());
        }
        Some(Session::new(
            Arc::downgrade(shared),
            self.link.clone(),
            process,
            socket_index,
            connection,
        ))
    }

    /// Re-establishes the group's invariants after a session ends.
    pub fn on_session_close(
        &mut self,
        process: &Arc<Process>,
        socket_index: usize,
        core: &mut PoolCore,
        shared: &Arc<PoolShared>,
        actions: &mut Vec<Action>,
    ) {
        log::trace!("session closed for process {}", process.inspect());
        process.session_closed(socket_index);
        debug_assert!(matches!(
            process.enable_state(),
            EnableState::Enabled | EnableState::Disabling
        ));
        if process.enable_state() == EnableState::Enabled {
            if let Some(handle) = process.pq_handle() {
                self.pqueue.update_key(handle, process.utilization());
            }
        }

        self.async_oobw_request_if_needed(process, core, shared, actions);
        if process.enable_state() == EnableState::Disabled {
            return;
        }

        let max_requests_reached = self.options.max_requests > 0
            && process.processed() >= self.options.max_requests;
        if !self.get_waitlist.is_empty() && !max_requests_reached {
            // Clients are waiting for exactly the capacity that just
            // became available.
            self.assign_sessions_to_get_waiters(core, shared, actions);
        } else if process.enable_state() == EnableState::Enabled
            && (!core.get_waitlist.is_empty() || max_requests_reached)
        {
            if !core.get_waitlist.is_empty() {
                log::debug!(
                    "process {} is no longer at full capacity; detaching it \
                     in order to make room in the pool",
                    process.inspect()
                );
            } else {
                log::debug!(
                    "process {} has reached its maximum number of requests ({}); detaching it",
                    process.inspect(),
                    self.options.max_requests
                );
            }
            self.detach_process(process, core, shared, actions);
        } else if process.enable_state() == EnableState::Disabling
            && process.utilization() == 0
            && !self.enabled_processes.is_empty()
        {
            // A draining process that just went idle; finish disabling it.
            remove_process(&mut self.disabling_processes, process);
            process.set_enable_state(EnableState::Disabled);
            self.disabled_processes.push(process.clone());
            self.resolve_disable_waiters(process, DisableResult::Success, actions);
        }
        self.verify_invariants(core);
    }

    /// Hands newly available capacity to parked get requests, FIFO.
    pub fn assign_sessions_to_get_waiters(
        &mut self,
        core: &mut PoolCore,
        shared: &Arc<PoolShared>,
        actions: &mut Vec<Action>,
    ) {
        while !self.get_waitlist.is_empty() {
            if self.top_at_full_capacity() {
                break;
            }
            let session = match self.new_session(shared) {
                Some(session) => session,
                None => break,
            };
            if let Some(waiter) = self.get_waitlist.pop_front() {
                let callback = waiter.callback;
                actions.push(Box::new(move || callback(Ok(session))));
            }
        }
        if !self.get_waitlist.is_empty() && self.should_spawn(core) {
            self.spawn(core, shared);
        }
    }

    pub fn assign_exception_to_get_waiters(
        &mut self,
        err: PoolError,
        actions: &mut Vec<Action>,
    ) {
        while let Some(waiter) = self.get_waitlist.pop_front() {
            let callback = waiter.callback;
            let err = err.clone();
            actions.push(Box::new(move || callback(Err(err))));
        }
    }

    /// Inserts a freshly spawned process into the rotation.
    pub fn attach(&mut self, process: Arc<Process>, core: &mut PoolCore) {
        process.set_group_link(self.link.clone());
        process.set_enable_state(EnableState::Enabled);
        let handle = self.pqueue.push(process.utilization(), process.clone());
        process.set_pq_handle(Some(handle));
        self.enabled_processes.push(process);
        core.process_count += 1;
    }

    /// Removes a process from all routing structures and marks it
    /// detached.  Idempotent; returns whether this call removed it.
    pub fn detach_process(
        &mut self,
        process: &Arc<Process>,
        core: &mut PoolCore,
        shared: &Arc<PoolShared>,
        actions: &mut Vec<Action>,
    ) -> bool {
        if !process.detach() {
            return false;
        }
        match process.enable_state() {
            EnableState::Enabled => {
                remove_process(&mut self.enabled_processes, process);
                if let Some(handle) = process.pq_handle() {
                    self.pqueue.remove(handle);
                }
                process.set_pq_handle(None);
            }
            EnableState::Disabling => {
                remove_process(&mut self.disabling_processes, process);
                self.resolve_disable_waiters(process, DisableResult::Canceled, actions);
            }
            EnableState::Disabled => {
                remove_process(&mut self.disabled_processes, process);
            }
        }
        core.process_count -= 1;
        core.drain_requested = true;
        log::debug!("process {} detached from pool", process.inspect());
        // Never leave waiters behind with nothing to run on.
        if !self.get_waitlist.is_empty() && self.should_spawn(core) {
            self.spawn(core, shared);
        }
        true
    }

    /// Detaches every process; used by restart and destruction.
    pub fn detach_all(&mut self, core: &mut PoolCore, actions: &mut Vec<Action>) {
        let all: Vec<Arc<Process>> = self
            .enabled_processes
            .drain(..)
            .chain(self.disabling_processes.drain(..))
            .chain(self.disabled_processes.drain(..))
            .collect();
        for process in &all {
            if process.detach() {
                core.process_count -= 1;
            }
            if let Some(handle) = process.pq_handle() {
                self.pqueue.remove(handle);
            }
            process.set_pq_handle(None);
        }
        let waiters: Vec<DisableWaiter> = self.disable_waitlist.drain(..).collect();
        for waiter in waiters {
            let callback = waiter.callback;
            actions.push(Box::new(move || callback(DisableResult::Canceled)));
        }
        core.drain_requested = true;
        // Reaping happens outside the lock.
        actions.push(Box::new(move || drop(all)));
    }

    /// Puts every draining process back into the rotation.  Used when a
    /// spawn failure leaves the group with nothing enabled.
    pub fn enable_all_disabling_processes(&mut self, actions: &mut Vec<Action>) {
        while let Some(process) = self.disabling_processes.pop() {
            process.set_enable_state(EnableState::Enabled);
            let handle = self.pqueue.push(process.utilization(), process.clone());
            process.set_pq_handle(Some(handle));
            self.resolve_disable_waiters(&process, DisableResult::Canceled, actions);
            self.enabled_processes.push(process);
        }
    }

    pub fn disable(
        &mut self,
        process: &Arc<Process>,
        callback: DisableCallback,
        core: &mut PoolCore,
        shared: &Arc<PoolShared>,
        actions: &mut Vec<Action>,
    ) -> DisableResult {
        if process.detached() {
            return DisableResult::Canceled;
        }
        match process.enable_state() {
            EnableState::Disabled => DisableResult::Noop,
            EnableState::Disabling => {
                self.disable_waitlist.push(DisableWaiter {
                    process: process.clone(),
                    callback,
                });
                DisableResult::Deferred
            }
            EnableState::Enabled => {
                if !remove_process(&mut self.enabled_processes, process) {
                    return DisableResult::Error;
                }
                if let Some(handle) = process.pq_handle() {
                    self.pqueue.remove(handle);
                }
                process.set_pq_handle(None);
                if process.sessions() == 0 {
                    process.set_enable_state(EnableState::Disabled);
                    self.disabled_processes.push(process.clone());
                    actions.push(Box::new(move || callback(DisableResult::Success)));
                    DisableResult::Success
                } else {
                    process.set_enable_state(EnableState::Disabling);
                    self.disabling_processes.push(process.clone());
                    self.disable_waitlist.push(DisableWaiter {
                        process: process.clone(),
                        callback,
                    });
                    if !self.get_waitlist.is_empty() && self.should_spawn(core) {
                        self.spawn(core, shared);
                    }
                    DisableResult::Deferred
                }
            }
        }
    }

    pub fn enable(
        &mut self,
        process: &Arc<Process>,
        core: &mut PoolCore,
        shared: &Arc<PoolShared>,
        actions: &mut Vec<Action>,
    ) {
        match process.enable_state() {
            EnableState::Enabled => {}
            EnableState::Disabling => {
                remove_process(&mut self.disabling_processes, process);
                self.resolve_disable_waiters(process, DisableResult::Canceled, actions);
                self.promote_to_enabled(process);
            }
            EnableState::Disabled => {
                remove_process(&mut self.disabled_processes, process);
                self.promote_to_enabled(process);
            }
        }
        if !self.get_waitlist.is_empty() {
            self.assign_sessions_to_get_waiters(core, shared, actions);
        }
    }

    fn promote_to_enabled(&mut self, process: &Arc<Process>) {
        process.set_enable_state(EnableState::Enabled);
        let handle = self.pqueue.push(process.utilization(), process.clone());
        process.set_pq_handle(Some(handle));
        self.enabled_processes.push(process.clone());
    }

    fn resolve_disable_waiters(
        &mut self,
        process: &Arc<Process>,
        result: DisableResult,
        actions: &mut Vec<Action>,
    ) {
        let mut i = 0;
        while i < self.disable_waitlist.len() {
            if Arc::ptr_eq(&self.disable_waitlist[i].process, process) {
                let waiter = self.disable_waitlist.remove(i);
                let callback = waiter.callback;
                actions.push(Box::new(move || callback(result)));
            } else {
                i += 1;
            }
        }
    }

    /// Starts the spawn loop thread.  At most one runs per group.
    pub fn spawn(&mut self, core: &mut PoolCore, shared: &Arc<PoolShared>) {
        debug_assert!(!self.spawning && !self.restarting);
        let pool = Arc::downgrade(shared);
        let link = self.link.clone();
        let spawner = self.spawner.clone();
        let options = self.options.clone();
        self.set_spawning(core, true);
        let name = format!("spawn loop: group {}", self.link.name);
        let started = shared
            .interruptable_threads
            .spawn(name, move || spawn_loop(pool, link, spawner, options));
        if started.is_err() {
            log::error!("could not start spawn thread for group {}", self.link.name);
            self.set_spawning(core, false);
        }
    }

    /// Tears down every current process and rebuilds the spawner.
    ///
    /// Queued and future `get`s wait on the wait list until the restart
    /// finishes and fresh workers come up.
    pub fn restart(
        &mut self,
        options: &Options,
        core: &mut PoolCore,
        shared: &Arc<PoolShared>,
        actions: &mut Vec<Action>,
    ) {
        debug_assert!(!self.restarting);
        log::debug!("restarting group {}", self.link.name);
        self.set_spawning(core, false);
        self.restarting = true;
        self.detach_all(core, actions);
        let pool = Arc::downgrade(shared);
        let link = self.link.clone();
        let options = options.clone();
        let name = format!("group restarter: {}", self.link.name);
        let started = shared
            .non_interruptable_threads
            .spawn(name, move || finalize_restart(pool, link, options));
        if started.is_err() {
            log::error!(
                "could not start restart thread for group {}",
                self.link.name
            );
            self.restarting = false;
        }
    }

    /// Checks the restart trigger files and restarts when they fired.
    pub fn restart_if_needed(
        &mut self,
        core: &mut PoolCore,
        shared: &Arc<PoolShared>,
        actions: &mut Vec<Action>,
    ) {
        if self.restarting {
            return;
        }
        let mut needed = false;
        if fs::metadata(&self.restart_file).is_ok() {
            // One-shot trigger: consumed by deleting it.
            fs::remove_file(&self.restart_file).ok();
            needed = true;
        }
        let mtime = file_mtime(&self.always_restart_file);
        if mtime != self.observed_restart_mtime {
            self.observed_restart_mtime = mtime;
            if mtime.is_some() {
                needed = true;
            }
        }
        if needed {
            let options = self.options.clone();
            self.restart(&options, core, shared, actions);
        }
    }

    pub(crate) fn reset_options(&mut self, options: Options) {
        self.restart_file = options.restart_file_path();
        self.always_restart_file = options.always_restart_file_path();
        self.observed_restart_mtime = file_mtime(&self.always_restart_file);
        self.options = options;
    }

    /// Walks a process toward its out-of-band maintenance window: take
    /// it off the rotation, wait for its sessions to finish, then fire
    /// the probe thread.
    pub fn async_oobw_request_if_needed(
        &mut self,
        process: &Arc<Process>,
        core: &mut PoolCore,
        shared: &Arc<PoolShared>,
        actions: &mut Vec<Action>,
    ) {
        if process.detached() || !process.oobw_requested() {
            return;
        }

        if process.enable_state() == EnableState::Enabled {
            // Disabling can complete asynchronously, so the callback
            // re-enters this method once the process has drained.
            let pool = Arc::downgrade(shared);
            let link = self.link.clone();
            let target = process.clone();
            let callback: DisableCallback = Box::new(move |result| {
                if result == DisableResult::Success || result == DisableResult::Canceled {
                    pool::lock_and_oobw_check(&pool, &link, &target);
                }
            });
            match self.disable(process, callback, core, shared, actions) {
                // The scheduled callback re-enters this method, so the
                // probe is fired exactly once.
                DisableResult::Deferred | DisableResult::Success => return,
                _ => {}
            }
        }

        if process.enable_state() != EnableState::Disabled {
            return;
        }
        if process.sessions() > 0 {
            return;
        }

        let pool = Arc::downgrade(shared);
        let link = self.link.clone();
        let target = process.clone();
        let name = format!("oobw request thread for process {}", process.pid());
        let started = shared
            .interruptable_threads
            .spawn(name, move || oobw_probe(pool, link, target));
        if started.is_err() {
            log::error!(
                "could not start oobw thread for process {}",
                process.inspect()
            );
        }
    }

    pub fn check_invariants(&self, core: &PoolCore) -> Result<(), PoolError> {
        if self.enabled_processes.len() != self.pqueue.len()
            || self.enabled_processes.is_empty() != self.pqueue.is_empty()
        {
            return Err(PoolError::invariant(format!(
                "group {}: enabled list and priority queue disagree",
                self.link.name
            )));
        }
        for process in self.enabled_processes.iter() {
            let queued = process
                .pq_handle()
                .and_then(|handle| self.pqueue.get(handle))
                .map_or(false, |p| Arc::ptr_eq(p, process));
            if !queued {
                return Err(PoolError::invariant(format!(
                    "group {}: process {} lost its priority queue handle",
                    self.link.name,
                    process.inspect()
                )));
            }
        }
        for (list, state) in [
            (&self.enabled_processes, EnableState::Enabled),
            (&self.disabling_processes, EnableState::Disabling),
            (&self.disabled_processes, EnableState::Disabled),
        ]
        .iter()
        {
            for process in list.iter() {
                if process.enable_state() != *state || process.detached() {
                    return Err(PoolError::invariant(format!(
                        "group {}: process {} is in the wrong routing list",
                        self.link.name,
                        process.inspect()
                    )));
                }
            }
        }
        if !self.get_waitlist.is_empty()
            && !self.spawning
            && !self.restarting
            && !self.enabled_processes.is_empty()
            && !self.enabled_processes.iter().all(|p| p.at_full_capacity())
        {
            return Err(PoolError::invariant(format!(
                "group {}: get waiters parked despite free capacity",
                self.link.name
            )));
        }
        if self.enabled_processes.is_empty()
            && !self.disabling_processes.is_empty()
            && !self.get_waitlist.is_empty()
            && !(self.spawning || self.restarting || core.at_full_capacity() || self.at_max_processes())
        {
            return Err(PoolError::invariant(format!(
                "group {}: waiters present with only draining processes and no spawn under way",
                self.link.name
            )));
        }
        Ok(())
    }

    fn verify_invariants(&self, core: &PoolCore) {
        if let Err(err) = self.check_invariants(core) {
            log::error!("{}", err);
            debug_assert!(false, "{}", err);
        }
    }
}

fn remove_process(list: &mut Vec<Arc<Process>>, process: &Arc<Process>) -> bool {
    match list.iter().position(|p| Arc::ptr_eq(p, process)) {
        Some(index) => {
            list.remove(index);
            true
        }
        None => false,
    }
}

fn file_mtime(path: &PathBuf) -> Option<SystemTime> {
    fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

/// Body of the spawn thread.  Spawns outside the lock, attaches under
/// it, and keeps going until the group is satisfied, the pool is full,
/// or a restart takes over.
pub(crate) fn spawn_loop(
    pool: Weak<PoolShared>,
    link: Arc<GroupLink>,
    spawner: Arc<dyn Spawner>,
    options: Options,
) {
    loop {
        let result = spawner.spawn(&options);

        let shared = match pool.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        shared.note_spawn_loop_iteration();
        if shared.interruptable_threads.interrupted() {
            return;
        }

        let done = pool::with_group(&shared, &link, move |group, core, shared, actions| {
            if group.restarting || !group.spawning {
                // A restart (or shutdown) took over while we were
                // spawning; whatever we produced is discarded.
                log::debug!("spawn loop aborted for group {}", group.link.name);
                return true;
            }

            let mut done = false;
            match result {
                Ok(process) => {
                    group.attach(Arc::new(process), core);
                    if group.get_waitlist.is_empty() {
                        core.drain_requested = true;
                    } else {
                        group.assign_sessions_to_get_waiters(core, shared, actions);
                    }
                    log::debug!(
                        "new process count for group {} = {}, remaining get waiters = {}",
                        group.link.name,
                        group.enabled_processes.len(),
                        group.get_waitlist.len()
                    );
                }
                Err(err) => {
                    log::error!(
                        "could not spawn process for group {}: {}",
                        group.link.name,
                        err
                    );
                    if group.enabled_processes.is_empty() {
                        group.enable_all_disabling_processes(actions);
                    }
                    group.assign_exception_to_get_waiters(err, actions);
                    core.drain_requested = true;
                    done = true;
                }
            }

            // Evaluate the continuation condition without counting this
            // thread's own capacity slot.
            group.set_spawning(core, false);
            done = done
                || (group.enabled_processes.len() >= group.options.min_processes as usize
                    && group.get_waitlist.is_empty())
                || group.at_max_processes()
                || core.at_full_capacity()
                || group.restarting;
            if !done {
                group.set_spawning(core, true);
            }
            group.verify_invariants(core);
            if done {
                log::debug!("spawn loop done for group {}", group.link.name);
            } else {
                log::debug!("continue spawning for group {}", group.link.name);
            }
            done
        });

        match done {
            Some(false) => continue,
            _ => return,
        }
    }
}

/// Completes a restart: builds a fresh spawner outside the lock, swaps
/// it in, and kicks off spawning if anyone is waiting.  Runs on the
/// non-interruptable thread group.
pub(crate) fn finalize_restart(pool: Weak<PoolShared>, link: Arc<GroupLink>, options: Options) {
    let shared = match pool.upgrade() {
        Some(shared) => shared,
        None => return,
    };
    let new_spawner = shared.spawner_factory.create(&options);

    let old_spawner = pool::with_group(&shared, &link, move |group, core, shared, _actions| {
        debug_assert!(group.restarting);
        group.reset_options(options);
        let old_spawner = std::mem::replace(&mut group.spawner, new_spawner);
        group.restarting = false;
        if !group.get_waitlist.is_empty() {
            group.spawn(core, shared);
        }
        log::debug!("restart of group {} done", group.link.name);
        group.verify_invariants(core);
        old_spawner
    });
    // The old spawner is dropped here, outside the lock.
    drop(old_spawner);
}

/// Body of the out-of-band work probe thread: sends one OOBW request
/// over a fresh connection, waits for a reply, then puts the process
/// back into the rotation.  Errors are logged and swallowed.
pub(crate) fn oobw_probe(pool: Weak<PoolShared>, link: Arc<GroupLink>, process: Arc<Process>) {
    let shared = match pool.upgrade() {
        Some(shared) => shared,
        None => return,
    };

    let ready = pool::with_group(&shared, &link, |_group, _core, _shared, _actions| {
        !process.detached()
            && process.oobw_requested()
            && process.sessions() == 0
            && process.enable_state() == EnableState::Disabled
    });
    if ready != Some(true) {
        return;
    }

    if let Err(err) = send_oobw_request(&process) {
        log::error!(
            "out-of-band work request to process {} failed: {}",
            process.inspect(),
            err
        );
    }

    let target = process.clone();
    pool::with_group(&shared, &link, move |group, core, shared, actions| {
        target.set_oobw_requested(false);
        if target.detached() {
            return;
        }
        group.enable(&target, core, shared, actions);
        group.verify_invariants(core);
    });
}

fn send_oobw_request(process: &Arc<Process>) -> Result<(), PoolError> {
    let socket = &process.sockets()[process.best_socket_index()];
    // The connection is deliberately not recycled: the response body is
    // discarded unread, so the stream is unusable afterwards.
    let connection = socket.connect()?;
    let channel = MessageChannel::from_stream(connection.stream);

    let mut payload = Vec::new();
    for field in [
        "REQUEST_METHOD",
        "OOBW",
        "PASSENGER_CONNECT_PASSWORD",
        process.connect_password(),
    ]
    .iter()
    {
        payload.extend_from_slice(field.as_bytes());
        payload.push(b'\0');
    }
    channel.write_scalar(&payload)?;

    // We do not care what the reply is, only that one arrived.
    wait_until_readable(&channel, OOBW_TIMEOUT)
}

fn wait_until_readable(channel: &MessageChannel, timeout: Duration) -> Result<(), PoolError> {
    let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let fd = unsafe { BorrowedFd::borrow_raw(channel.as_raw_fd()) };
    loop {
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let timeout = PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX);
        match poll(&mut fds, timeout) {
            Ok(0) => return Err(PoolError::timeout()),
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => return Err(PoolError::io_read(err.into())),
        }
    }
}
