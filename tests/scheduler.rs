//! End-to-end scheduling scenarios with the real process dispatcher.
//!
//! These tests drive the same level-triggered loop the daemon runs: scan
//! for startable tasks, dispatch them, wait on the change condition. The
//! spawned commands are real processes (`/bin/true`, `/bin/false`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use rinit::dispatch;
use rinit::task::{Task, TaskCmd, TaskDep, TaskOpts, TaskState};
use rinit::task_db::{DispatchMode, TaskDb};

fn dispatcher_db() -> Arc<TaskDb> {
    TaskDb::new(dispatch::spawn_handler())
}

fn task_with_cmd(name: &str, argv: &[&str]) -> Task {
    let mut t = Task::new(name);
    t.cmds
        .push(TaskCmd::new(argv.iter().map(|a| a.to_string()).collect()).unwrap());
    t
}

/// Run scheduler scans until `pred` holds or the deadline passes.
fn drive_until(db: &Arc<TaskDb>, timeout: Duration, pred: impl Fn(&Arc<TaskDb>) -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        db.spawn_ready(DispatchMode::Start).unwrap();
        if pred(db) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        db.wait_for_change_timeout(Duration::from_millis(50));
    }
}

#[test]
fn single_task_runs_to_done() {
    let db = dispatcher_db();
    db.insert(task_with_cmd("t1", &["/bin/true"]), false).unwrap();

    // A watcher task holding (t1, spawn) and (t1, wait) observes the
    // fulfillment of both events.
    let mut watcher = task_with_cmd("watcher", &["/bin/true"]);
    watcher.deps = vec![TaskDep::new("t1", "spawn"), TaskDep::new("t1", "wait")];
    db.insert(watcher, false).unwrap();

    assert!(drive_until(&db, Duration::from_secs(10), |db| {
        db.get_task_state("t1").unwrap().0 == TaskState::Done
    }));
    assert_eq!(db.get_task_pid("t1").unwrap(), None);

    assert!(drive_until(&db, Duration::from_secs(10), |db| {
        db.with_task("watcher", |t| t.deps.is_empty()).unwrap()
    }));
}

#[test]
fn dependency_chain_orders_execution() {
    let db = dispatcher_db();
    db.insert(task_with_cmd("first", &["/bin/true"]), false)
        .unwrap();
    let mut second = task_with_cmd("second", &["/bin/true"]);
    second.deps = vec![TaskDep::new("first", "wait")];
    db.insert(second, false).unwrap();

    // Before any scan, the gated task must not be startable.
    assert_eq!(db.get_task_state("second").unwrap().0, TaskState::Loaded);

    assert!(drive_until(&db, Duration::from_secs(10), |db| {
        db.get_task_state("second").unwrap().0 == TaskState::Done
    }));
    assert_eq!(db.get_task_state("first").unwrap().0, TaskState::Done);
}

#[test]
fn meta_task_completes_once_deps_are_fulfilled() {
    let db = dispatcher_db();
    db.insert(task_with_cmd("worker", &["/bin/true"]), false)
        .unwrap();
    let mut meta = Task::new("milestone");
    meta.deps = vec![TaskDep::new("worker", "wait")];
    db.insert(meta, false).unwrap();

    assert!(drive_until(&db, Duration::from_secs(10), |db| {
        db.get_task_state("milestone").unwrap().0 == TaskState::Done
    }));
    assert_eq!(db.get_task_pid("milestone").unwrap(), None);
}

#[test]
fn failing_task_respawns_up_to_the_cap() {
    let db = dispatcher_db();
    let mut t = task_with_cmd("flaky", &["/bin/false"]);
    t.opts.set(TaskOpts::RESPAWN, true);
    t.max_retries = 2;
    db.insert(t, false).unwrap();

    // Three failures (initial + two retries), then the scheduler stops
    // re-selecting the task.
    assert!(drive_until(&db, Duration::from_secs(15), |db| {
        db.with_task("flaky", |t| t.fail_count).unwrap() >= 3
    }));

    // Let any in-flight scan settle, then verify no further respawn.
    std::thread::sleep(Duration::from_millis(200));
    db.spawn_ready(DispatchMode::Start).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(db.with_task("flaky", |t| t.fail_count).unwrap(), 3);
    assert_eq!(db.get_task_state("flaky").unwrap().0, TaskState::Failed);
    assert_eq!(db.get_task_pid("flaky").unwrap(), None);
}

#[test]
fn failure_fulfills_fail_event() {
    let db = dispatcher_db();
    db.insert(task_with_cmd("doomed", &["/bin/false"]), false)
        .unwrap();
    let mut cleanup = task_with_cmd("cleanup", &["/bin/true"]);
    cleanup.deps = vec![TaskDep::new("doomed", "fail")];
    db.insert(cleanup, false).unwrap();

    assert!(drive_until(&db, Duration::from_secs(10), |db| {
        db.get_task_state("cleanup").unwrap().0 == TaskState::Done
    }));
}

#[test]
fn gated_task_stays_loaded_until_enabled() {
    let db = dispatcher_db();
    let mut gated = task_with_cmd("gated", &["/bin/true"]);
    gated.deps = vec![TaskDep::ctl_enable()];
    db.insert(gated, false).unwrap();

    assert!(!drive_until(&db, Duration::from_millis(300), |db| {
        db.get_task_state("gated").unwrap().0 != TaskState::Loaded
    }));

    db.remove_dep_from_task(&TaskDep::ctl_enable(), "gated")
        .unwrap();
    assert!(drive_until(&db, Duration::from_secs(10), |db| {
        db.get_task_state("gated").unwrap().0 == TaskState::Done
    }));
}

#[test]
fn provided_feature_unblocks_consumer() {
    let db = dispatcher_db();
    let mut provider = task_with_cmd("netd", &["/bin/true"]);
    provider.provides = vec![rinit::task::TaskProv {
        feature: "network".into(),
        state: TaskState::Done,
        notified: false,
    }];
    db.insert(provider, false).unwrap();

    let mut consumer = task_with_cmd("app", &["/bin/true"]);
    consumer.deps = vec![TaskDep::new("@provided", "network")];
    db.insert(consumer, false).unwrap();

    assert!(drive_until(&db, Duration::from_secs(10), |db| {
        db.get_task_state("app").unwrap().0 == TaskState::Done
    }));
}

#[test]
fn stop_commands_see_the_recorded_pid() {
    let db = dispatcher_db();
    let mut t = Task::new("svc");
    t.stop_cmds
        .push(TaskCmd::new(vec!["/bin/true".into(), "${TASK_PID}".into()]).unwrap());
    t.deps = vec![TaskDep::new("never", "wait")];
    db.insert(t, false).unwrap();
    db.set_task_pid("svc", Some(4321)).unwrap();

    // Dispatch the stop chain directly; it runs `/bin/true 4321`.
    dispatch::dispatch(Arc::clone(&db), "svc".to_string(), DispatchMode::Stop).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while db.get_task_state("svc").unwrap().0 != TaskState::Done {
        assert!(Instant::now() < deadline, "stop chain did not finish");
        db.wait_for_change_timeout(Duration::from_millis(50));
    }
}
