use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;

use crate::error::PoolError;
use crate::group::{DisableCallback, DisableResult, Group, GroupLink};
use crate::options::Options;
use crate::process::Process;
use crate::random::RandomGenerator;
use crate::session::Session;
use crate::spawn::SpawnerFactory;
use crate::supergroup::SuperGroup;
use crate::threads::ThreadGroup;

/// A side effect collected under the lock and run after it is released.
///
/// No user callback ever fires under the pool lock; every locked
/// section gathers its callbacks into a `Vec<Action>` and the caller
/// runs them once the lock is gone.
pub(crate) type Action = Box<dyn FnOnce() + Send>;

pub(crate) fn run_all_actions(actions: Vec<Action>) {
    for action in actions {
        action();
    }
}

/// How `Pool::get` reports back: exactly once, with a session or an
/// error, never under the pool lock.
pub type GetCallback = Box<dyn FnOnce(Result<Session, PoolError>) + Send>;

/// A parked get request.
pub(crate) struct GetWaiter {
    pub options: Options,
    pub callback: GetCallback,
}

/// The pool-wide bookkeeping that group code needs while the lock is
/// held: capacity counters and the pool-level wait list.
pub(crate) struct PoolCore {
    pub max: usize,
    pub max_idle_time: Duration,
    pub process_count: usize,
    /// Groups with a spawn loop running; each holds one capacity slot.
    pub spawning_groups: usize,
    /// Requests that could not be served because the pool was full and
    /// no new group could be grown.
    pub get_waitlist: VecDeque<GetWaiter>,
    /// Set when capacity may have been freed; the lock holder drains
    /// the pool wait list before releasing.
    pub drain_requested: bool,
}

impl PoolCore {
    pub fn at_full_capacity(&self) -> bool {
        self.process_count + self.spawning_groups >= self.max
    }
}

pub(crate) struct PoolState {
    pub super_groups: HashMap<String, SuperGroup>,
    pub core: PoolCore,
}

/// Everything behind the pool handle; shared with helper threads.
pub(crate) struct PoolShared {
    pub syncher: Mutex<PoolState>,
    pub spawner_factory: Arc<dyn SpawnerFactory>,
    pub random: Arc<RandomGenerator>,
    pub interruptable_threads: ThreadGroup,
    pub non_interruptable_threads: ThreadGroup,
    spawn_loop_iterations: AtomicUsize,
    destroyed: AtomicBool,
}

impl PoolShared {
    pub fn note_spawn_loop_iteration(&self) {
        self.spawn_loop_iterations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Re-locks the pool and runs `f` on the group identified by `link`,
/// then drains the pool wait list if anything requested it and runs the
/// collected actions outside the lock.
///
/// Returns `None` without calling `f` when the group no longer exists;
/// callbacks and helper threads silently abort in that case.
pub(crate) fn with_group<R, F>(
    shared: &Arc<PoolShared>,
    link: &Arc<GroupLink>,
    f: F,
) -> Option<R>
where
    F: FnOnce(&mut Group, &mut PoolCore, &Arc<PoolShared>, &mut Vec<Action>) -> R,
{
    let mut f = Some(f);
    let mut actions = Vec::new();
    let rv = {
        let mut guard = shared.syncher.lock().unwrap();
        let state = &mut *guard;
        let PoolState {
            ref mut super_groups,
            ref mut core,
        } = *state;
        let group = super_groups
            .get_mut(&link.super_group)
            .and_then(|sg| sg.group_by_link_mut(link));
        match group {
            Some(group) => {
                let f = f.take().unwrap();
                let rv = f(group, core, shared, &mut actions);
                if state.core.drain_requested {
                    drain_pool_waitlist(state, shared, &mut actions);
                }
                Some(rv)
            }
            None => None,
        }
    };
    // An unused `f` is dropped here, outside the lock.
    drop(f);
    run_all_actions(actions);
    rv
}

/// Looks up or creates the super group for `options` and hands the
/// request to it.
fn route_get(
    state: &mut PoolState,
    shared: &Arc<PoolShared>,
    options: Options,
    callback: GetCallback,
    actions: &mut Vec<Action>,
) {
    let name = options.app_root.clone();
    if !state.super_groups.contains_key(&name) {
        if state.core.at_full_capacity() && !try_free_capacity(state, shared, actions) {
            log::debug!(
                "pool is at full capacity; queuing get request for '{}'",
                name
            );
            state
                .core
                .get_waitlist
                .push_back(GetWaiter { options, callback });
            return;
        }
        let secret = shared.random.ascii_string(43);
        let mut super_group = SuperGroup::new(name.clone(), secret);
        super_group.initialize(&options, shared);
        state.super_groups.insert(name.clone(), super_group);
    }

    let PoolState {
        ref mut super_groups,
        ref mut core,
    } = *state;
    match super_groups.get_mut(&name) {
        Some(super_group) => super_group.get(options, callback, core, shared, actions),
        None => actions.push(Box::new(move || {
            callback(Err(PoolError::super_group_gone()))
        })),
    }
}

/// Admits parked pool-level waiters while capacity allows.
pub(crate) fn drain_pool_waitlist(
    state: &mut PoolState,
    shared: &Arc<PoolShared>,
    actions: &mut Vec<Action>,
) {
    state.core.drain_requested = false;
    while let Some(waiter) = state.core.get_waitlist.pop_front() {
        let exists = state.super_groups.contains_key(&waiter.options.app_root);
        if !exists && state.core.at_full_capacity() {
            state.core.get_waitlist.push_front(waiter);
            break;
        }
        route_get(state, shared, waiter.options, waiter.callback, actions);
    }
}

/// Frees one capacity slot by detaching an idle enabled process from
/// the group with the greatest spare capacity, i.e. the lowest average
/// utilization among groups that have an idle worker to give up.
/// Returns whether a slot was freed.
fn try_free_capacity(
    state: &mut PoolState,
    shared: &Arc<PoolShared>,
    actions: &mut Vec<Action>,
) -> bool {
    let mut victim: Option<(Arc<GroupLink>, Arc<Process>)> = None;
    let mut best_utilization = u64::MAX;
    for super_group in state.super_groups.values() {
        for group in super_group.groups.iter() {
            if group.restarting {
                continue;
            }
            let idle = group
                .enabled_processes
                .iter()
                .find(|p| p.sessions() == 0)
                .cloned();
            let process = match idle {
                Some(process) => process,
                None => continue,
            };
            let total: u64 = group
                .enabled_processes
                .iter()
                .map(|p| p.utilization())
                .sum();
            let utilization = total / group.enabled_processes.len() as u64;
            if utilization < best_utilization {
                best_utilization = utilization;
                victim = Some((group.link.clone(), process));
            }
        }
    }
    let (link, process) = match victim {
        Some(victim) => victim,
        None => return false,
    };
    log::debug!(
        "detaching idle process {} to free capacity",
        process.inspect()
    );
    let PoolState {
        ref mut super_groups,
        ref mut core,
    } = *state;
    match super_groups
        .get_mut(&link.super_group)
        .and_then(|sg| sg.group_by_link_mut(&link))
    {
        Some(group) => group.detach_process(&process, core, shared, actions),
        None => false,
    }
}

/// Entry point for `Session::close`.
pub(crate) fn on_session_close(
    pool: &Weak<PoolShared>,
    link: &Arc<GroupLink>,
    process: &Arc<Process>,
    socket_index: usize,
) {
    let shared = match pool.upgrade() {
        Some(shared) => shared,
        None => return,
    };
    with_group(&shared, link, |group, core, shared, actions| {
        if process.detached() {
            return;
        }
        group.on_session_close(process, socket_index, core, shared, actions);
    });
}

/// Entry point for `Session::request_oobw`.
pub(crate) fn on_request_oobw(
    pool: &Weak<PoolShared>,
    link: &Arc<GroupLink>,
    process: &Arc<Process>,
) {
    let shared = match pool.upgrade() {
        Some(shared) => shared,
        None => return,
    };
    with_group(&shared, link, |_group, _core, _shared, _actions| {
        if !process.detached() {
            process.set_oobw_requested(true);
        }
    });
}

/// Re-enters the out-of-band work state walk after a deferred disable
/// completed.
pub(crate) fn lock_and_oobw_check(
    pool: &Weak<PoolShared>,
    link: &Arc<GroupLink>,
    process: &Arc<Process>,
) {
    let shared = match pool.upgrade() {
        Some(shared) => shared,
        None => return,
    };
    with_group(&shared, link, |group, core, shared, actions| {
        if !process.detached() {
            group.async_oobw_request_if_needed(process, core, shared, actions);
        }
    });
}

/// The application process pool.
///
/// Hosts a fleet of worker processes per application, spawns them on
/// demand through the configured [`SpawnerFactory`], routes each `get`
/// to the least-loaded worker and enforces the per-group and global
/// capacity limits.
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Creates a builder to customize pool creation.
    pub fn builder(spawner_factory: Arc<dyn SpawnerFactory>) -> PoolBuilder {
        PoolBuilder::new(spawner_factory)
    }

    /// Asks for a session on the application described by `options`.
    ///
    /// The callback is invoked exactly once, with a session or an
    /// error, asynchronously and never under any pool-internal lock.
    pub fn get(&self, options: &Options, callback: GetCallback) {
        let mut actions = Vec::new();
        {
            let mut guard = self.shared.syncher.lock().unwrap();
            let state = &mut *guard;
            if self.shared.destroyed.load(Ordering::SeqCst) {
                actions.push(Box::new(move || {
                    callback(Err(PoolError::super_group_gone()))
                }) as Action);
            } else {
                route_get(state, &self.shared, options.clone(), callback, &mut actions);
                if state.core.drain_requested {
                    drain_pool_waitlist(state, &self.shared, &mut actions);
                }
            }
        }
        run_all_actions(actions);
    }

    /// Blocking variant of [`Pool::get`].
    pub fn get_sync(&self, options: &Options, timeout: Duration) -> Result<Session, PoolError> {
        let (tx, rx) = mpsc::channel();
        self.get(
            options,
            Box::new(move |result| {
                tx.send(result).ok();
            }),
        );
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(PoolError::timeout()),
        }
    }

    /// Restarts all groups of the named application.  Returns whether
    /// the application was known.
    pub fn restart(&self, app_root: &str) -> bool {
        let mut actions = Vec::new();
        let known = {
            let mut guard = self.shared.syncher.lock().unwrap();
            let state = &mut *guard;
            let PoolState {
                ref mut super_groups,
                ref mut core,
            } = *state;
            let known = match super_groups.get_mut(app_root) {
                Some(super_group) => {
                    super_group.restart(core, &self.shared, &mut actions);
                    true
                }
                None => false,
            };
            if state.core.drain_requested {
                drain_pool_waitlist(state, &self.shared, &mut actions);
            }
            known
        };
        run_all_actions(actions);
        known
    }

    /// Detaches a process from its group; it serves out its open
    /// sessions and is then reaped.  Idempotent; returns whether this
    /// call removed it.
    pub fn detach_process(&self, process: &Arc<Process>) -> bool {
        let link = match process.group_link() {
            Some(link) => link,
            None => return false,
        };
        with_group(&self.shared, &link, |group, core, shared, actions| {
            group.detach_process(process, core, shared, actions)
        })
        .unwrap_or(false)
    }

    /// Like [`Pool::detach_process`], but reports the outcome through a
    /// callback that runs outside the lock.
    pub fn detach_process_async(
        &self,
        process: &Arc<Process>,
        callback: Box<dyn FnOnce(bool) + Send>,
    ) {
        let mut callback = Some(callback);
        if let Some(link) = process.group_link() {
            with_group(&self.shared, &link, |group, core, shared, actions| {
                let removed = group.detach_process(process, core, shared, actions);
                if let Some(callback) = callback.take() {
                    actions.push(Box::new(move || callback(removed)) as Action);
                }
            });
        }
        if let Some(callback) = callback.take() {
            callback(false);
        }
    }

    /// Takes a process out of the rotation.  See [`DisableResult`].
    pub fn disable_process(
        &self,
        process: &Arc<Process>,
        callback: DisableCallback,
    ) -> DisableResult {
        let link = match process.group_link() {
            Some(link) => link,
            None => return DisableResult::Canceled,
        };
        with_group(&self.shared, &link, |group, core, shared, actions| {
            group.disable(process, callback, core, shared, actions)
        })
        .unwrap_or(DisableResult::Canceled)
    }

    /// Puts a disabled or draining process back into the rotation.
    pub fn enable_process(&self, process: &Arc<Process>) {
        let link = match process.group_link() {
            Some(link) => link,
            None => return,
        };
        with_group(&self.shared, &link, |group, core, shared, actions| {
            if !process.detached() {
                group.enable(process, core, shared, actions);
            }
        });
    }

    /// Detaches enabled processes that have been idle longer than the
    /// configured `max_idle_time`, never shrinking a group below its
    /// `min_processes`.  Returns how many were detached.
    ///
    /// The pool owns no timer; embedders call this from theirs.
    pub fn cleanup_idle(&self) -> usize {
        let mut victims: Vec<(Arc<GroupLink>, Arc<Process>)> = Vec::new();
        {
            let guard = self.shared.syncher.lock().unwrap();
            let max_idle_time = guard.core.max_idle_time;
            for super_group in guard.super_groups.values() {
                for group in super_group.groups.iter() {
                    if group.restarting {
                        continue;
                    }
                    let min = group.options.min_processes as usize;
                    let mut spare = group.process_count().saturating_sub(min);
                    for process in group.enabled_processes.iter() {
                        if spare == 0 {
                            break;
                        }
                        if process.sessions() == 0
                            && process.idle_since().elapsed() >= max_idle_time
                        {
                            victims.push((group.link.clone(), process.clone()));
                            spare -= 1;
                        }
                    }
                }
            }
        }
        let mut detached = 0;
        for (link, process) in victims {
            let removed = with_group(&self.shared, &link, |group, core, shared, actions| {
                if group.process_count() > group.options.min_processes as usize
                    && process.sessions() == 0
                {
                    group.detach_process(&process, core, shared, actions)
                } else {
                    false
                }
            });
            if removed == Some(true) {
                detached += 1;
            }
        }
        detached
    }

    /// Total processes currently attached, across all groups.
    pub fn process_count(&self) -> usize {
        self.shared.syncher.lock().unwrap().core.process_count
    }

    pub fn at_full_capacity(&self) -> bool {
        self.shared.syncher.lock().unwrap().core.at_full_capacity()
    }

    /// How many spawn loop iterations have completed; test
    /// instrumentation.
    pub fn spawn_loop_iterations(&self) -> usize {
        self.shared.spawn_loop_iterations.load(Ordering::SeqCst)
    }

    /// A structured point-in-time view of the pool, for operators.
    pub fn snapshot(&self) -> PoolSnapshot {
        let guard = self.shared.syncher.lock().unwrap();
        let mut super_groups: Vec<SuperGroupSnapshot> = guard
            .super_groups
            .values()
            .map(|sg| SuperGroupSnapshot {
                name: sg.name.clone(),
                secret: sg.secret.clone(),
                state: format!("{:?}", sg.state),
                groups: sg
                    .groups
                    .iter()
                    .map(|group| GroupSnapshot {
                        name: group.link.name.clone(),
                        secret: group.secret.clone(),
                        enabled_count: group.enabled_processes.len(),
                        disabling_count: group.disabling_processes.len(),
                        disabled_count: group.disabled_processes.len(),
                        spawning: group.spawning,
                        restarting: group.restarting,
                        get_wait_count: group.get_waitlist.len(),
                        processes: group
                            .enabled_processes
                            .iter()
                            .chain(group.disabling_processes.iter())
                            .chain(group.disabled_processes.iter())
                            .map(|process| ProcessSnapshot {
                                pid: process.pid(),
                                gupid: process.gupid().to_string(),
                                sessions: process.sessions(),
                                processed: process.processed(),
                                enabled: format!("{:?}", process.enable_state()),
                                utilization: process.utilization(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        super_groups.sort_by(|a, b| a.name.cmp(&b.name));
        PoolSnapshot {
            max: guard.core.max,
            process_count: guard.core.process_count,
            spawning_groups: guard.core.spawning_groups,
            get_wait_count: guard.core.get_waitlist.len(),
            super_groups,
        }
    }

    /// Renders the snapshot as a human-readable operator summary.
    pub fn inspect(&self) -> String {
        use std::fmt::Write;

        let snapshot = self.snapshot();
        let mut out = String::new();
        writeln!(
            out,
            "capacity: {}/{} (spawning: {}), queued on pool: {}",
            snapshot.process_count, snapshot.max, snapshot.spawning_groups, snapshot.get_wait_count
        )
        .ok();
        for super_group in &snapshot.super_groups {
            writeln!(out, "{} (state={}):", super_group.name, super_group.state).ok();
            for group in &super_group.groups {
                writeln!(
                    out,
                    "  group {}: enabled={} disabling={} disabled={} spawning={} restarting={} waiting={}",
                    group.name,
                    group.enabled_count,
                    group.disabling_count,
                    group.disabled_count,
                    group.spawning,
                    group.restarting,
                    group.get_wait_count
                )
                .ok();
                for process in &group.processes {
                    writeln!(
                        out,
                        "    pid={} gupid={} sessions={} processed={} state={}",
                        process.pid,
                        process.gupid,
                        process.sessions,
                        process.processed,
                        process.enabled
                    )
                    .ok();
                }
            }
        }
        out
    }

    /// The snapshot as JSON, for admin endpoints.
    #[cfg(feature = "json")]
    pub fn inspect_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    /// Checks every quantified invariant the scheduler maintains.
    /// Intended for tests and debug tooling.
    pub fn verify_invariants(&self) -> Result<(), PoolError> {
        let guard = self.shared.syncher.lock().unwrap();
        let mut total = 0;
        for super_group in guard.super_groups.values() {
            for group in super_group.groups.iter() {
                group.check_invariants(&guard.core)?;
            }
            total += super_group.process_count();
        }
        if total != guard.core.process_count {
            return Err(PoolError::invariant(format!(
                "pool process count {} does not match group totals {}",
                guard.core.process_count, total
            )));
        }
        if !guard.core.get_waitlist.is_empty() && !guard.core.at_full_capacity() {
            return Err(PoolError::invariant(
                "pool-level waiters parked below full capacity",
            ));
        }
        Ok(())
    }

    /// Shuts the pool down: interrupts spawners, detaches every
    /// process, fails queued waiters and joins the helper threads.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.interruptable_threads.interrupt_all();

        let mut actions = Vec::new();
        let spawners = {
            let mut guard = self.shared.syncher.lock().unwrap();
            let state = &mut *guard;
            let mut spawners = Vec::new();
            let names: Vec<String> = state.super_groups.keys().cloned().collect();
            for name in names {
                if let Some(mut super_group) = state.super_groups.remove(&name) {
                    for group in super_group.groups.iter() {
                        spawners.push(group.spawner.clone());
                    }
                    super_group.destroy(&mut state.core, &mut actions);
                }
            }
            while let Some(waiter) = state.core.get_waitlist.pop_front() {
                let callback = waiter.callback;
                actions.push(Box::new(move || {
                    callback(Err(PoolError::super_group_gone()))
                }) as Action);
            }
            spawners
        };
        for spawner in &spawners {
            spawner.interrupt();
        }
        run_all_actions(actions);

        self.shared.interruptable_threads.join_all();
        self.shared.non_interruptable_threads.join_all();
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Utility to configure a pool.
pub struct PoolBuilder {
    max: usize,
    max_idle_time: Duration,
    spawner_factory: Arc<dyn SpawnerFactory>,
    random: Option<Arc<RandomGenerator>>,
}

impl PoolBuilder {
    fn new(spawner_factory: Arc<dyn SpawnerFactory>) -> PoolBuilder {
        PoolBuilder {
            max: 6,
            max_idle_time: Duration::from_secs(5 * 60),
            spawner_factory,
            random: None,
        }
    }

    /// Global cap on worker processes across all groups.
    pub fn max(mut self, max: usize) -> PoolBuilder {
        self.max = max;
        self
    }

    /// Idle time after which `cleanup_idle` retires a worker.
    pub fn max_idle_time(mut self, max_idle_time: Duration) -> PoolBuilder {
        self.max_idle_time = max_idle_time;
        self
    }

    /// Shares a random generator with the rest of the embedding server.
    pub fn random_generator(mut self, random: Arc<RandomGenerator>) -> PoolBuilder {
        self.random = Some(random);
        self
    }

    /// Creates the pool.
    pub fn build(self) -> Pool {
        Pool {
            shared: Arc::new(PoolShared {
                syncher: Mutex::new(PoolState {
                    super_groups: HashMap::new(),
                    core: PoolCore {
                        max: self.max,
                        max_idle_time: self.max_idle_time,
                        process_count: 0,
                        spawning_groups: 0,
                        get_waitlist: VecDeque::new(),
                        drain_requested: false,
                    },
                }),
                spawner_factory: self.spawner_factory,
                random: self.random.unwrap_or_else(|| Arc::new(RandomGenerator::new())),
                interruptable_threads: ThreadGroup::new(),
                non_interruptable_threads: ThreadGroup::new(),
                spawn_loop_iterations: AtomicUsize::new(0),
                destroyed: AtomicBool::new(false),
            }),
        }
    }
}

/// Point-in-time view of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub max: usize,
    pub process_count: usize,
    pub spawning_groups: usize,
    pub get_wait_count: usize,
    pub super_groups: Vec<SuperGroupSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuperGroupSnapshot {
    pub name: String,
    /// Admin token for this application's internal endpoints.
    pub secret: String,
    pub state: String,
    pub groups: Vec<GroupSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    /// Admin token for this group's internal endpoints.
    pub secret: String,
    pub enabled_count: usize,
    pub disabling_count: usize,
    pub disabled_count: usize,
    pub spawning: bool,
    pub restarting: bool,
    pub get_wait_count: usize,
    pub processes: Vec<ProcessSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub gupid: String,
    pub sessions: u32,
    pub processed: u64,
    pub enabled: String,
    pub utilization: u64,
}
