//! The central task database.
//!
//! One mutex guards the task set; a condition variable is broadcast on
//! every successful mutation so the scheduler's level-triggered scan in
//! [`crate::main`] wakes up. Spawning is delegated through a handler so the
//! scheduling rules can be exercised without creating processes.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::error::{Error, Result};
use crate::feature_hooks;
use crate::task::{Task, TaskDep, TaskState, DEP_NAME_PROVIDED};

/// Selects which command chain a dispatched worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Start,
    Stop,
}

/// Called under the database lock for every task that became startable.
/// Expected to hand the task to a detached worker and return quickly.
pub type SpawnHandler =
    Box<dyn Fn(&Arc<TaskDb>, &str, DispatchMode) -> Result<()> + Send + Sync>;

struct DbInner {
    tasks: Vec<Task>,
    spawn_inhibit: bool,
}

pub struct TaskDb {
    inner: Mutex<DbInner>,
    changed: Condvar,
    spawn_handler: SpawnHandler,
}

impl TaskDb {
    pub fn new(spawn_handler: SpawnHandler) -> Arc<TaskDb> {
        Arc::new(TaskDb {
            inner: Mutex::new(DbInner {
                tasks: Vec::new(),
                spawn_inhibit: false,
            }),
            changed: Condvar::new(),
            spawn_handler,
        })
    }

    fn lock(&self) -> MutexGuard<'_, DbInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a task. An existing task of the same name is replaced only
    /// with `overwrite`; otherwise the insert fails with a conflict.
    pub fn insert(&self, task: Task, overwrite: bool) -> Result<()> {
        task.validate()?;
        let name = task.name.clone();
        {
            let mut inner = self.lock();
            match inner.tasks.iter_mut().find(|t| t.name == task.name) {
                Some(slot) => {
                    if !overwrite {
                        return Err(Error::Conflict(format!(
                            "task '{}' already exists",
                            task.name
                        )));
                    }
                    *slot = task;
                }
                None => inner.tasks.push(task),
            }
            self.changed.notify_all();
        }
        feature_hooks::task_added(&name);
        Ok(())
    }

    /// Insert-or-replace.
    pub fn update(&self, task: Task) -> Result<()> {
        self.insert(task, true)
    }

    /// Remove every occurrence of `dep` from `target`'s dependency set, or
    /// from every task when no target is given.
    pub fn fulfill_dep(&self, dep: &TaskDep, target: Option<&str>) -> Result<()> {
        let mut inner = self.lock();
        for t in inner.tasks.iter_mut() {
            if let Some(name) = target {
                if t.name != name {
                    continue;
                }
            }
            let before = t.deps.len();
            t.deps.retain(|d| d != dep);
            if t.deps.len() != before {
                debug!("removed fulfilled dependency '{}' from '{}'", dep, t.name);
            }
        }
        self.changed.notify_all();
        Ok(())
    }

    /// Add `dep` to a single task's dependency set; a no-op if already
    /// present.
    pub fn add_dep_to_task(&self, dep: &TaskDep, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let t = find_task(&mut inner, name)?;
        if !t.deps.contains(dep) {
            t.deps.push(dep.clone());
        }
        Ok(())
    }

    /// Remove every occurrence of `dep` from a single task's dependency
    /// set.
    pub fn remove_dep_from_task(&self, dep: &TaskDep, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let t = find_task(&mut inner, name)?;
        t.deps.retain(|d| d != dep);
        self.changed.notify_all();
        Ok(())
    }

    /// Record a state transition, stamping timestamps and maintaining the
    /// failure counter.
    pub fn set_task_state(&self, name: &str, state: TaskState, notified: bool) -> Result<()> {
        let stamp = Instant::now();
        {
            let mut inner = self.lock();
            let t = find_task(&mut inner, name)?;
            t.state = state;
            t.notified = notified;
            match state {
                TaskState::Running => t.start_time = Some(stamp),
                TaskState::Done => {
                    t.fail_count = 0;
                    t.end_time = Some(stamp);
                }
                TaskState::Failed => {
                    t.fail_count += 1;
                    t.end_time = Some(stamp);
                }
                TaskState::Loaded | TaskState::Starting => {}
            }
            self.changed.notify_all();
        }
        match state {
            TaskState::Failed => error!(target: "task-failed", "task '{}' failed", name),
            TaskState::Done => info!(target: "task-exited", "task '{}' done", name),
            TaskState::Running => info!(target: "task-started", "task '{}' running", name),
            _ => debug!("task '{}' is now {}", name, state.as_str()),
        }
        Ok(())
    }

    pub fn get_task_state(&self, name: &str) -> Result<(TaskState, bool)> {
        let mut inner = self.lock();
        let t = find_task(&mut inner, name)?;
        Ok((t.state, t.notified))
    }

    pub fn set_task_pid(&self, name: &str, pid: Option<libc::pid_t>) -> Result<()> {
        let mut inner = self.lock();
        let t = find_task(&mut inner, name)?;
        t.pid = pid;
        Ok(())
    }

    pub fn get_task_pid(&self, name: &str) -> Result<Option<libc::pid_t>> {
        let mut inner = self.lock();
        let t = find_task(&mut inner, name)?;
        Ok(t.pid)
    }

    pub fn get_task_state_and_pid(
        &self,
        name: &str,
    ) -> Result<(TaskState, bool, Option<libc::pid_t>)> {
        let mut inner = self.lock();
        let t = find_task(&mut inner, name)?;
        Ok((t.state, t.notified, t.pid))
    }

    /// Run a closure on the in-database task while holding the lock. Keep
    /// the critical section short.
    pub fn with_task<R>(&self, name: &str, f: impl FnOnce(&mut Task) -> R) -> Result<R> {
        let mut inner = self.lock();
        let t = find_task(&mut inner, name)?;
        Ok(f(t))
    }

    /// Deep copy of a task for use outside the lock.
    pub fn snapshot_task(&self, name: &str) -> Result<Task> {
        let mut inner = self.lock();
        Ok(find_task(&mut inner, name)?.clone())
    }

    /// For every `(feature, state)` the provider declares: a match with the
    /// reached state fulfills `(@provided, feature)` database-wide and runs
    /// the feature's activation hook; a mismatch runs its deactivation
    /// hook.
    pub fn provide_feature(&self, provider: &Task, state: TaskState, notified: bool) -> Result<()> {
        for prv in &provider.provides {
            if prv.state == state && prv.notified == notified {
                let dep = TaskDep::new(DEP_NAME_PROVIDED, &prv.feature);
                self.fulfill_dep(&dep, None)?;
                debug!("fulfilled feature dependency '{}'", dep);
                feature_hooks::start(&prv.feature);
            } else {
                feature_hooks::stop(&prv.feature);
            }
        }
        Ok(())
    }

    pub fn provide_feature_by_name(
        &self,
        name: &str,
        state: TaskState,
        notified: bool,
    ) -> Result<()> {
        let provider = self.snapshot_task(name)?;
        self.provide_feature(&provider, state, notified)
    }

    /// Suppress or re-allow task spawning; clearing the flag wakes the
    /// scheduler.
    pub fn set_spawn_inhibit(&self, inhibit: bool) {
        let mut inner = self.lock();
        if inner.spawn_inhibit != inhibit {
            inner.spawn_inhibit = inhibit;
            if !inhibit {
                self.changed.notify_all();
            }
        }
    }

    pub fn spawn_inhibited(&self) -> bool {
        self.lock().spawn_inhibit
    }

    /// Dispatch every startable task, in insertion order.
    ///
    /// A task is startable when its dependency set is empty, it is neither
    /// starting nor running, and it either has not finished yet or is
    /// eligible for respawn. Returns without starting anything while
    /// spawning is inhibited.
    pub fn spawn_ready(self: &Arc<Self>, mode: DispatchMode) -> Result<()> {
        let mut inner = self.lock();
        if inner.spawn_inhibit {
            return Ok(());
        }
        let ready: Vec<String> = inner
            .tasks
            .iter()
            .filter(|t| task_is_ready(t))
            .map(|t| t.name.clone())
            .collect();
        for name in ready {
            debug!("task '{}' ready to spawn", name);
            if let Some(t) = inner.tasks.iter_mut().find(|t| t.name == name) {
                t.state = TaskState::Starting;
            }
            if let Err(e) = (self.spawn_handler)(self, &name, mode) {
                error!("could not dispatch task '{}': {}", name, e);
                if let Some(t) = inner.tasks.iter_mut().find(|t| t.name == name) {
                    t.state = TaskState::Loaded;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Snapshot of all task names, in insertion order.
    pub fn export_task_names(&self) -> Vec<String> {
        self.lock().tasks.iter().map(|t| t.name.clone()).collect()
    }

    /// Block until the database changes (or a spurious wakeup occurs).
    pub fn wait_for_change(&self) {
        let inner = self.lock();
        let _unused = self
            .changed
            .wait(inner)
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Timed variant of [`TaskDb::wait_for_change`] for callers that poll.
    pub fn wait_for_change_timeout(&self, timeout: Duration) {
        let inner = self.lock();
        let _unused = self
            .changed
            .wait_timeout(inner, timeout)
            .unwrap_or_else(|e| e.into_inner());
    }
}

fn find_task<'a>(inner: &'a mut DbInner, name: &str) -> Result<&'a mut Task> {
    inner
        .tasks
        .iter_mut()
        .find(|t| t.name == name)
        .ok_or_else(|| Error::NotFound(format!("task '{}'", name)))
}

fn task_is_ready(t: &Task) -> bool {
    if !t.deps.is_empty() {
        return false;
    }
    if matches!(t.state, TaskState::Starting | TaskState::Running) {
        return false;
    }
    if matches!(t.state, TaskState::Done | TaskState::Failed) {
        if !t.respawn() || t.inhibit_respawn {
            return false;
        }
        if t.max_retries != -1 && t.fail_count > t.max_retries {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recording_db() -> (Arc<TaskDb>, Arc<StdMutex<Vec<String>>>) {
        let spawned = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::clone(&spawned);
        let db = TaskDb::new(Box::new(move |_db, name, _mode| {
            log.lock().unwrap().push(name.to_string());
            Ok(())
        }));
        (db, spawned)
    }

    fn simple_task(name: &str) -> Task {
        let mut t = Task::new(name);
        t.cmds
            .push(crate::task::TaskCmd::new(vec!["/bin/true".into()]).unwrap());
        t
    }

    #[test]
    fn duplicate_insert_conflicts_without_overwrite() {
        let (db, _) = recording_db();
        db.insert(simple_task("a"), false).unwrap();
        assert!(matches!(
            db.insert(simple_task("a"), false),
            Err(Error::Conflict(_))
        ));
        db.insert(simple_task("a"), true).unwrap();
        assert_eq!(db.export_task_names(), vec!["a"]);
    }

    #[test]
    fn fulfill_removes_every_occurrence() {
        let (db, _) = recording_db();
        let dep = TaskDep::new("x", "wait");
        let mut t = simple_task("a");
        t.deps = vec![dep.clone(), dep.clone(), TaskDep::new("y", "wait")];
        db.insert(t, false).unwrap();
        let mut u = simple_task("b");
        u.deps = vec![dep.clone()];
        db.insert(u, false).unwrap();

        db.fulfill_dep(&dep, None).unwrap();
        assert_eq!(db.with_task("a", |t| t.deps.len()).unwrap(), 1);
        assert_eq!(db.with_task("b", |t| t.deps.len()).unwrap(), 0);
    }

    #[test]
    fn targeted_fulfill_leaves_other_tasks_alone() {
        let (db, _) = recording_db();
        let dep = TaskDep::new("x", "wait");
        for name in &["a", "b"] {
            let mut t = simple_task(name);
            t.deps = vec![dep.clone()];
            db.insert(t, false).unwrap();
        }
        db.fulfill_dep(&dep, Some("a")).unwrap();
        assert_eq!(db.with_task("a", |t| t.deps.len()).unwrap(), 0);
        assert_eq!(db.with_task("b", |t| t.deps.len()).unwrap(), 1);
    }

    #[test]
    fn add_dep_is_idempotent_and_enable_disable_round_trips() {
        let (db, _) = recording_db();
        let mut t = simple_task("e");
        t.deps = vec![TaskDep::new("other", "wait")];
        db.insert(t, false).unwrap();
        let before = db.with_task("e", |t| t.deps.clone()).unwrap();

        let gate = TaskDep::ctl_enable();
        db.add_dep_to_task(&gate, "e").unwrap();
        db.add_dep_to_task(&gate, "e").unwrap();
        let gated = db.with_task("e", |t| t.deps.clone()).unwrap();
        assert_eq!(
            gated.iter().filter(|d| **d == gate).count(),
            1,
            "disable applied twice leaves exactly one gating dep"
        );

        db.remove_dep_from_task(&gate, "e").unwrap();
        assert_eq!(db.with_task("e", |t| t.deps.clone()).unwrap(), before);
        // Removing an absent dependency is a successful no-op.
        db.remove_dep_from_task(&gate, "e").unwrap();
    }

    #[test]
    fn state_transitions_maintain_fail_count() {
        let (db, _) = recording_db();
        db.insert(simple_task("t"), false).unwrap();
        db.set_task_state("t", TaskState::Failed, false).unwrap();
        db.set_task_state("t", TaskState::Failed, false).unwrap();
        assert_eq!(db.with_task("t", |t| t.fail_count).unwrap(), 2);
        db.set_task_state("t", TaskState::Done, false).unwrap();
        assert_eq!(db.with_task("t", |t| t.fail_count).unwrap(), 0);
    }

    #[test]
    fn spawn_ready_dispatches_in_insertion_order_and_marks_starting() {
        let (db, spawned) = recording_db();
        db.insert(simple_task("one"), false).unwrap();
        db.insert(simple_task("two"), false).unwrap();
        let mut gated = simple_task("gated");
        gated.deps = vec![TaskDep::new("one", "wait")];
        db.insert(gated, false).unwrap();

        db.spawn_ready(DispatchMode::Start).unwrap();
        assert_eq!(*spawned.lock().unwrap(), vec!["one", "two"]);
        assert_eq!(
            db.get_task_state("one").unwrap().0,
            TaskState::Starting
        );

        // A second scan must not re-dispatch tasks already starting.
        db.spawn_ready(DispatchMode::Start).unwrap();
        assert_eq!(spawned.lock().unwrap().len(), 2);
    }

    #[test]
    fn spawn_inhibit_blocks_dispatch() {
        let (db, spawned) = recording_db();
        db.insert(simple_task("t"), false).unwrap();
        db.set_spawn_inhibit(true);
        db.spawn_ready(DispatchMode::Start).unwrap();
        assert!(spawned.lock().unwrap().is_empty());
        db.set_spawn_inhibit(false);
        db.spawn_ready(DispatchMode::Start).unwrap();
        assert_eq!(spawned.lock().unwrap().len(), 1);
    }

    #[test]
    fn respawn_policy_limits_reselection() {
        let (db, spawned) = recording_db();
        let mut t = simple_task("r");
        t.opts.set(crate::task::TaskOpts::RESPAWN, true);
        t.max_retries = 2;
        db.insert(t, false).unwrap();

        for expected_spawns in 1..=3 {
            db.spawn_ready(DispatchMode::Start).unwrap();
            assert_eq!(spawned.lock().unwrap().len(), expected_spawns);
            db.set_task_state("r", TaskState::Failed, false).unwrap();
        }
        assert_eq!(db.with_task("r", |t| t.fail_count).unwrap(), 3);

        // fail_count exceeded max_retries, no further respawn.
        db.spawn_ready(DispatchMode::Start).unwrap();
        assert_eq!(spawned.lock().unwrap().len(), 3);
    }

    #[test]
    fn inhibit_respawn_overrides_policy() {
        let (db, spawned) = recording_db();
        let mut t = simple_task("r");
        t.opts.set(crate::task::TaskOpts::RESPAWN, true);
        db.insert(t, false).unwrap();
        db.set_task_state("r", TaskState::Done, false).unwrap();
        db.with_task("r", |t| t.inhibit_respawn = true).unwrap();
        db.spawn_ready(DispatchMode::Start).unwrap();
        assert!(spawned.lock().unwrap().is_empty());
    }

    #[test]
    fn provides_fulfill_provided_deps() {
        let (db, _) = recording_db();
        let mut provider = simple_task("net");
        provider.provides = vec![crate::task::TaskProv {
            feature: "online".into(),
            state: TaskState::Running,
            notified: false,
        }];
        db.insert(provider, false).unwrap();

        let mut consumer = simple_task("app");
        consumer.deps = vec![TaskDep::new(DEP_NAME_PROVIDED, "online")];
        db.insert(consumer, false).unwrap();

        db.provide_feature_by_name("net", TaskState::Running, false)
            .unwrap();
        assert_eq!(db.with_task("app", |t| t.deps.len()).unwrap(), 0);

        // A different state does not fulfill.
        let mut consumer2 = simple_task("app2");
        consumer2.deps = vec![TaskDep::new(DEP_NAME_PROVIDED, "online")];
        db.insert(consumer2, false).unwrap();
        db.provide_feature_by_name("net", TaskState::Done, false)
            .unwrap();
        assert_eq!(db.with_task("app2", |t| t.deps.len()).unwrap(), 1);
    }

    #[test]
    fn inserted_task_round_trips_except_lifecycle_fields() {
        let (db, _) = recording_db();
        let mut t = simple_task("rt");
        t.deps = vec![TaskDep::new("a", "wait")];
        t.env.set("K", "v");
        t.max_retries = 5;
        db.insert(t.clone(), false).unwrap();

        db.set_task_state("rt", TaskState::Failed, false).unwrap();
        let copy = db.snapshot_task("rt").unwrap();
        assert_eq!(copy.name, t.name);
        assert_eq!(copy.cmds, t.cmds);
        assert_eq!(copy.deps, t.deps);
        assert_eq!(copy.env, t.env);
        assert_eq!(copy.max_retries, t.max_retries);
        // Lifecycle fields are owned by the database.
        assert_eq!(copy.state, TaskState::Failed);
        assert_eq!(copy.fail_count, 1);
    }

    #[test]
    fn lookups_on_unknown_names_fail() {
        let (db, _) = recording_db();
        assert!(matches!(
            db.get_task_state("ghost"),
            Err(Error::NotFound(_))
        ));
        assert!(db.snapshot_task("ghost").is_err());
    }
}
