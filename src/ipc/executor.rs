//! Server-side execution of runtime commands against the task database.
//!
//! Every handler checks its argument count exactly and answers with an
//! `R_*` response; failures carry a one-line reason after `RES_ERR`. The
//! requesting connection is answered before long-running effects complete
//! (shutdown runs detached).

use std::path::Path;
use std::sync::Arc;

use log::debug;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::reader::ConfigEntry;
use crate::config::{self, task_file};
use crate::dispatch;
use crate::error::Result;
use crate::global_opts;
use crate::ipc::command::{Op, OpCode, RtCommand};
use crate::shutdown::{self, ShutdownOp};
use crate::task::{TaskDep, TaskState, EVENT_NOTIFY_SUFFIX, EVENT_SPAWN, EVENT_WAIT};
use crate::task_db::TaskDb;
use crate::version;

const WRONG_ARG_COUNT: &str = "Wrong number of arguments.";

/// Execute a parsed request and produce the response to send back.
pub fn execute(db: &Arc<TaskDb>, cmd: &RtCommand) -> RtCommand {
    let op = match cmd.op {
        OpCode::Request(op) => op,
        OpCode::Response(op) => {
            return RtCommand::err_response(op, "Received a response code as a request.")
        }
    };
    debug!("executing runtime command {:?} {:?}", op, cmd.args);
    match op {
        Op::AddTask => exec_add_task(db, &cmd.args),
        Op::AddSeries => exec_add_series(db, &cmd.args),
        Op::Enable => exec_enable(db, &cmd.args),
        Op::Disable => exec_disable(db, &cmd.args),
        Op::Stop => exec_signal(db, &cmd.args, Op::Stop, Signal::SIGTERM),
        Op::Kill => exec_signal(db, &cmd.args, Op::Kill, Signal::SIGKILL),
        Op::Restart => exec_restart(db, &cmd.args),
        Op::Notify => exec_notify(db, &cmd.args),
        Op::Status => exec_status(db, &cmd.args),
        Op::TaskList => exec_task_list(db, &cmd.args),
        Op::Shutdown => exec_shutdown(db, &cmd.args),
        Op::GetVer => exec_get_ver(&cmd.args),
    }
}

/// Rewrite the `DEPENDS` entries of a parsed task file according to the
/// ADDTASK dependency-override argument: `@unchanged` keeps the file as-is,
/// `@empty` (or an empty string) strips all dependencies, anything else
/// replaces them with the given list.
fn override_depends(entries: &mut Vec<ConfigEntry>, force_deps: &str) {
    if force_deps == "@unchanged" {
        return;
    }
    if force_deps == "@empty" || force_deps.is_empty() {
        for e in entries.iter_mut() {
            if e.key == "DEPENDS" {
                e.val.clear();
            }
        }
        return;
    }
    let mut first = true;
    for e in entries.iter_mut() {
        if e.key == "DEPENDS" {
            if first {
                e.val = force_deps.to_string();
                first = false;
            } else {
                e.val.clear();
            }
        }
    }
    if first {
        entries.push(ConfigEntry {
            key: "DEPENDS".to_string(),
            val: force_deps.to_string(),
        });
    }
}

fn exec_add_task(db: &Arc<TaskDb>, args: &[String]) -> RtCommand {
    if args.len() != 3 {
        return RtCommand::err_response(Op::AddTask, WRONG_ARG_COUNT);
    }
    let mut entries = match config::parse_file(Path::new(&args[0])) {
        Ok(e) => e,
        Err(_) => return RtCommand::err_response(Op::AddTask, "Could not parse given config."),
    };
    debug!("file '{}' loaded", args[0]);
    override_depends(&mut entries, &args[2]);

    let task = match task_file::task_from_entries(&entries) {
        Ok(t) => t,
        Err(_) => return RtCommand::err_response(Op::AddTask, "Could not create task from config."),
    };
    let overwrite = args[1] == "true";
    match db.insert(task, overwrite) {
        Ok(()) => RtCommand::ok_response(Op::AddTask, Vec::new()),
        Err(_) => RtCommand::err_response(Op::AddTask, "Could not insert new task into TaskDB."),
    }
}

fn add_series(db: &Arc<TaskDb>, path: &Path, overwrite: bool) -> Result<()> {
    global_opts::lock().tasks = None;
    let series = config::load_series(path)?;
    for file in series.paths() {
        let task = task_file::task_from_file(&file)?;
        log::info!("file '{}' loaded", file.display());
        db.insert(task, overwrite)?;
    }
    Ok(())
}

fn exec_add_series(db: &Arc<TaskDb>, args: &[String]) -> RtCommand {
    if args.len() != 2 {
        return RtCommand::err_response(Op::AddSeries, WRONG_ARG_COUNT);
    }
    let path = Path::new(&args[0]);
    if !path.is_absolute() {
        return RtCommand::err_response(Op::AddSeries, "Path to series file must be absolute.");
    }
    let overwrite = args[1] == "true";

    // No task may start while the new series is partially loaded; the
    // single change-broadcast happens when the inhibit is lifted.
    db.set_spawn_inhibit(true);
    let result = add_series(db, path, overwrite);
    db.set_spawn_inhibit(false);
    match result {
        Ok(()) => RtCommand::ok_response(Op::AddSeries, Vec::new()),
        Err(e) => RtCommand::err_response(Op::AddSeries, &e.reason()),
    }
}

fn exec_enable(db: &Arc<TaskDb>, args: &[String]) -> RtCommand {
    if args.len() != 1 {
        return RtCommand::err_response(Op::Enable, WRONG_ARG_COUNT);
    }
    match db.remove_dep_from_task(&TaskDep::ctl_enable(), &args[0]) {
        Ok(()) => RtCommand::ok_response(Op::Enable, Vec::new()),
        Err(e) => RtCommand::err_response(Op::Enable, &e.reason()),
    }
}

fn exec_disable(db: &Arc<TaskDb>, args: &[String]) -> RtCommand {
    if args.len() != 1 {
        return RtCommand::err_response(Op::Disable, WRONG_ARG_COUNT);
    }
    match db.add_dep_to_task(&TaskDep::ctl_enable(), &args[0]) {
        Ok(()) => RtCommand::ok_response(Op::Disable, Vec::new()),
        Err(e) => RtCommand::err_response(Op::Disable, &e.reason()),
    }
}

fn exec_signal(db: &Arc<TaskDb>, args: &[String], op: Op, signal: Signal) -> RtCommand {
    if args.len() != 1 {
        return RtCommand::err_response(op, WRONG_ARG_COUNT);
    }
    // Between looking up the PID and the kill, no dispatcher may reap the
    // child, or the PID could be reused by an unrelated process.
    dispatch::set_wait_inhibit(true);
    let res = (|| {
        let pid = db
            .get_task_pid(&args[0])
            .map_err(|e| e.reason())?
            .filter(|p| *p > 0)
            .ok_or_else(|| "No PID registered for task.".to_string())?;
        kill(Pid::from_raw(pid), signal).map_err(|e| format!("Could not signal process: {}", e))
    })();
    dispatch::set_wait_inhibit(false);
    match res {
        Ok(()) => RtCommand::ok_response(op, Vec::new()),
        Err(reason) => RtCommand::err_response(op, &reason),
    }
}

fn exec_restart(db: &Arc<TaskDb>, args: &[String]) -> RtCommand {
    if args.len() != 1 {
        return RtCommand::err_response(Op::Restart, WRONG_ARG_COUNT);
    }
    let state = match db.get_task_state(&args[0]) {
        Ok((state, _)) => state,
        Err(e) => return RtCommand::err_response(Op::Restart, &e.reason()),
    };
    if !matches!(state, TaskState::Done | TaskState::Failed) {
        return RtCommand::err_response(Op::Restart, "Task is not either DONE or FAILED.");
    }
    match db.set_task_state(&args[0], TaskState::Loaded, false) {
        Ok(()) => RtCommand::ok_response(Op::Restart, Vec::new()),
        Err(e) => RtCommand::err_response(Op::Restart, &e.reason()),
    }
}

fn exec_notify(db: &Arc<TaskDb>, args: &[String]) -> RtCommand {
    if args.len() < 2 {
        return RtCommand::err_response(Op::Notify, WRONG_ARG_COUNT);
    }
    let name = &args[0];

    let mut main_pid: Option<libc::pid_t> = None;
    let mut ready = false;
    let mut stopping = false;
    for kv in &args[1..] {
        let (key, val) = match kv.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        match key {
            "MAINPID" => main_pid = val.parse().ok().filter(|p| *p > 0),
            "READY" => ready = val.parse::<i64>().map(|v| v > 0).unwrap_or(false),
            "STOPPING" => stopping = val.parse::<i64>().map(|v| v > 0).unwrap_or(false),
            _ => {}
        }
    }

    if let Some(pid) = main_pid {
        if db.set_task_pid(name, Some(pid)).is_err() {
            return RtCommand::err_response(Op::Notify, "Could not set main PID of task.");
        }
    }

    if ready {
        if let Err(res) = apply_notified_state(db, name, TaskState::Running, EVENT_SPAWN) {
            return res;
        }
    }
    if stopping {
        if let Err(res) = apply_notified_state(db, name, TaskState::Done, EVENT_WAIT) {
            return res;
        }
    }
    RtCommand::ok_response(Op::Notify, Vec::new())
}

fn apply_notified_state(
    db: &Arc<TaskDb>,
    name: &str,
    state: TaskState,
    event: &str,
) -> std::result::Result<(), RtCommand> {
    let err = |reason: &str| Err(RtCommand::err_response(Op::Notify, reason));
    if db.set_task_state(name, state, true).is_err() {
        return err("Could not set task state.");
    }
    let dep = TaskDep::new(name, &format!("{}{}", event, EVENT_NOTIFY_SUFFIX));
    if db.fulfill_dep(&dep, None).is_err() {
        return err("Could not fulfill dependency.");
    }
    if db.provide_feature_by_name(name, state, true).is_err() {
        return err("Could not provide features of notified task.");
    }
    Ok(())
}

fn exec_status(db: &Arc<TaskDb>, args: &[String]) -> RtCommand {
    if args.len() != 1 {
        return RtCommand::err_response(Op::Status, WRONG_ARG_COUNT);
    }
    match db.get_task_state_and_pid(&args[0]) {
        Ok((state, notified, pid)) => RtCommand::ok_response(
            Op::Status,
            vec![
                state.as_str().to_string(),
                if notified { "yes" } else { "no" }.to_string(),
                pid.unwrap_or(-1).to_string(),
            ],
        ),
        Err(e) => RtCommand::err_response(Op::Status, &e.reason()),
    }
}

fn exec_task_list(db: &Arc<TaskDb>, args: &[String]) -> RtCommand {
    if !args.is_empty() {
        return RtCommand::err_response(Op::TaskList, WRONG_ARG_COUNT);
    }
    RtCommand::ok_response(Op::TaskList, db.export_task_names())
}

fn exec_shutdown(db: &Arc<TaskDb>, args: &[String]) -> RtCommand {
    if args.len() != 1 {
        return RtCommand::err_response(Op::Shutdown, WRONG_ARG_COUNT);
    }
    let op = match ShutdownOp::parse(&args[0]) {
        Ok(op) => op,
        Err(_) => return RtCommand::err_response(Op::Shutdown, "Invalid argument."),
    };
    match shutdown::spawn_shutdown(Arc::clone(db), op) {
        Ok(()) => RtCommand::ok_response(Op::Shutdown, Vec::new()),
        Err(_) => RtCommand::err_response(Op::Shutdown, "Could not start shutdown thread."),
    }
}

fn exec_get_ver(args: &[String]) -> RtCommand {
    if !args.is_empty() {
        return RtCommand::err_response(Op::GetVer, WRONG_ARG_COUNT);
    }
    RtCommand::ok_response(
        Op::GetVer,
        vec![
            version::MAJOR.to_string(),
            version::MINOR.to_string(),
            version::MICRO.to_string(),
            version::BUILD_ID.to_string(),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::command::{RES_ERR, RES_OK};
    use crate::task::{Task, TaskCmd};

    fn test_db() -> Arc<TaskDb> {
        TaskDb::new(Box::new(|_, _, _| Ok(())))
    }

    fn insert_simple(db: &Arc<TaskDb>, name: &str) {
        let mut t = Task::new(name);
        t.cmds
            .push(TaskCmd::new(vec!["/bin/true".into()]).unwrap());
        db.insert(t, false).unwrap();
    }

    fn run(db: &Arc<TaskDb>, op: Op, args: &[&str]) -> RtCommand {
        execute(
            db,
            &RtCommand::request(op, args.iter().map(|a| a.to_string()).collect()),
        )
    }

    #[test]
    fn argument_counts_are_checked_exactly() {
        let db = test_db();
        for (op, args) in &[
            (Op::AddTask, vec!["a", "b"]),
            (Op::Enable, vec![]),
            (Op::Disable, vec!["a", "b"]),
            (Op::Stop, vec![]),
            (Op::Restart, vec!["a", "b"]),
            (Op::Status, vec![]),
            (Op::TaskList, vec!["extra"]),
            (Op::Shutdown, vec![]),
            (Op::GetVer, vec!["extra"]),
            (Op::Notify, vec!["task"]),
        ] {
            let res = run(&db, *op, args);
            assert_eq!(res.args[0], RES_ERR, "{:?}", op);
            assert_eq!(res.args[1], WRONG_ARG_COUNT, "{:?}", op);
        }
    }

    #[test]
    fn enable_disable_round_trip_via_commands() {
        let db = test_db();
        insert_simple(&db, "e");
        let before = db.with_task("e", |t| t.deps.clone()).unwrap();

        assert_eq!(run(&db, Op::Disable, &["e"]).args[0], RES_OK);
        assert_eq!(run(&db, Op::Disable, &["e"]).args[0], RES_OK);
        let gate = TaskDep::ctl_enable();
        assert_eq!(
            db.with_task("e", |t| t.deps.iter().filter(|d| **d == gate).count())
                .unwrap(),
            1
        );

        assert_eq!(run(&db, Op::Enable, &["e"]).args[0], RES_OK);
        assert_eq!(db.with_task("e", |t| t.deps.clone()).unwrap(), before);
        // Enabling an already-enabled task succeeds as a no-op.
        assert_eq!(run(&db, Op::Enable, &["e"]).args[0], RES_OK);
    }

    #[test]
    fn restart_requires_finished_task() {
        let db = test_db();
        insert_simple(&db, "t");
        let res = run(&db, Op::Restart, &["t"]);
        assert_eq!(res.args[0], RES_ERR);

        db.set_task_state("t", TaskState::Failed, false).unwrap();
        assert_eq!(run(&db, Op::Restart, &["t"]).args[0], RES_OK);
        assert_eq!(db.get_task_state("t").unwrap().0, TaskState::Loaded);
    }

    #[test]
    fn notify_sets_pid_state_and_fulfills_notify_event() {
        let db = test_db();
        insert_simple(&db, "n");
        let mut waiter = Task::new("w");
        waiter
            .cmds
            .push(TaskCmd::new(vec!["/bin/true".into()]).unwrap());
        waiter.deps.push(TaskDep::new("n", "spawn-notify"));
        db.insert(waiter, false).unwrap();

        let res = run(&db, Op::Notify, &["n", "MAINPID=42", "READY=1"]);
        assert_eq!(res.args[0], RES_OK);

        let (state, notified, pid) = db.get_task_state_and_pid("n").unwrap();
        assert_eq!(state, TaskState::Running);
        assert!(notified);
        assert_eq!(pid, Some(42));
        assert_eq!(db.with_task("w", |t| t.deps.len()).unwrap(), 0);
    }

    #[test]
    fn notify_stopping_marks_done() {
        let db = test_db();
        insert_simple(&db, "n");
        let res = run(&db, Op::Notify, &["n", "STOPPING=1"]);
        assert_eq!(res.args[0], RES_OK);
        let (state, notified, _) = db.get_task_state_and_pid("n").unwrap();
        assert_eq!(state, TaskState::Done);
        assert!(notified);
    }

    #[test]
    fn status_reports_state_and_pid() {
        let db = test_db();
        insert_simple(&db, "s");
        db.set_task_state("s", TaskState::Running, false).unwrap();
        db.set_task_pid("s", Some(1234)).unwrap();
        let res = run(&db, Op::Status, &["s"]);
        assert_eq!(res.args, vec!["RES_OK", "running", "no", "1234"]);

        let res = run(&db, Op::Status, &["ghost"]);
        assert_eq!(res.args[0], RES_ERR);
    }

    #[test]
    fn task_list_snapshots_names() {
        let db = test_db();
        insert_simple(&db, "a");
        insert_simple(&db, "b");
        let res = run(&db, Op::TaskList, &[]);
        assert_eq!(res.args, vec!["RES_OK", "a", "b"]);
    }

    #[test]
    fn get_ver_reports_version_fields() {
        let db = test_db();
        let res = run(&db, Op::GetVer, &[]);
        assert_eq!(res.args[0], RES_OK);
        assert_eq!(res.args.len(), 5);
        assert_eq!(res.args[1], version::MAJOR);
    }

    #[test]
    fn add_task_with_dependency_override() {
        let db = test_db();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.task");
        std::fs::write(&path, "NAME = t\nCOMMAND = /bin/true\nDEPENDS = a:wait\n").unwrap();
        let path_str = path.display().to_string();

        let res = run(&db, Op::AddTask, &[&path_str, "false", "@unchanged"]);
        assert_eq!(res.args[0], RES_OK);
        assert_eq!(db.with_task("t", |t| t.deps.len()).unwrap(), 1);

        // Same name again without overwrite fails.
        let res = run(&db, Op::AddTask, &[&path_str, "false", "@unchanged"]);
        assert_eq!(res.args[0], RES_ERR);

        // Overwrite with stripped dependencies.
        let res = run(&db, Op::AddTask, &[&path_str, "true", "@empty"]);
        assert_eq!(res.args[0], RES_OK);
        assert_eq!(db.with_task("t", |t| t.deps.len()).unwrap(), 0);

        // Overwrite with replaced dependencies.
        let res = run(&db, Op::AddTask, &[&path_str, "true", "x:wait y:fail"]);
        assert_eq!(res.args[0], RES_OK);
        assert_eq!(db.with_task("t", |t| t.deps.len()).unwrap(), 2);
    }

    #[test]
    fn shutdown_validates_operation() {
        let db = test_db();
        let res = run(&db, Op::Shutdown, &["halt"]);
        assert_eq!(res.args[0], RES_ERR);
        assert_eq!(res.args[1], "Invalid argument.");
    }
}
