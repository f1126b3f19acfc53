//! Hooks for external collaborators interested in task lifecycle events.
//!
//! Collaborators (event loggers, event-filter backends) register a
//! [`FeatureHook`]; the task database calls the hooks when a task is added
//! and when a provided feature is activated or deactivated by a state
//! transition. The core itself registers nothing.

use std::sync::{Arc, Mutex};

use log::debug;

pub trait FeatureHook: Send + Sync {
    /// A task was inserted into the database.
    fn task_added(&self, _name: &str) {}
    /// A provided feature became active.
    fn feature_start(&self, _feature: &str) {}
    /// A provider transitioned to a state that does not provide the
    /// feature.
    fn feature_stop(&self, _feature: &str) {}
}

lazy_static::lazy_static! {
    static ref HOOKS: Mutex<Vec<Arc<dyn FeatureHook>>> = Mutex::new(Vec::new());
}

pub fn register(hook: Arc<dyn FeatureHook>) {
    HOOKS.lock().unwrap_or_else(|e| e.into_inner()).push(hook);
}

fn snapshot() -> Vec<Arc<dyn FeatureHook>> {
    HOOKS.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

pub fn task_added(name: &str) {
    debug!("running hooks for added task '{}'", name);
    for hook in snapshot() {
        hook.task_added(name);
    }
}

pub fn start(feature: &str) {
    for hook in snapshot() {
        hook.feature_start(feature);
    }
}

pub fn stop(feature: &str) {
    for hook in snapshot() {
        hook.feature_stop(feature);
    }
}
