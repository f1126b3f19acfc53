//! Auto-growing pool of detached worker threads.
//!
//! Workers report busy/idle transitions; a watchdog thread observes the
//! availability condition variable and grows the pool by its initial size
//! whenever 90% or more of the workers are busy, so a burst of connections
//! never starves the accept loop.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, error};

use crate::error::{Error, Result};

pub const DEFAULT_INITIAL_SIZE: usize = 8;

/// Pool size at and below which availability counts as "dry".
fn dry_threshold(pool_size: usize) -> usize {
    pool_size / 10
}

struct PoolState {
    available: usize,
    pool_size: usize,
    increment: usize,
}

pub struct ThreadPool {
    state: Mutex<PoolState>,
    avail_changed: Condvar,
    worker: Box<dyn Fn(&ThreadPool) + Send + Sync>,
}

impl ThreadPool {
    /// Start a pool of `initial_size` workers (0 selects the default),
    /// each running `worker`, plus the watchdog.
    pub fn start(
        initial_size: usize,
        worker: impl Fn(&ThreadPool) + Send + Sync + 'static,
    ) -> Result<Arc<ThreadPool>> {
        let initial_size = if initial_size == 0 {
            DEFAULT_INITIAL_SIZE
        } else {
            initial_size
        };
        let pool = Arc::new(ThreadPool {
            state: Mutex::new(PoolState {
                available: 0,
                pool_size: 0,
                increment: initial_size,
            }),
            avail_changed: Condvar::new(),
            worker: Box::new(worker),
        });

        let wd = Arc::clone(&pool);
        thread::Builder::new()
            .name("pool-watchdog".into())
            .spawn(move || wd.watchdog())
            .map_err(|e| Error::Resource(format!("could not start pool watchdog: {}", e)))?;

        pool.grow(initial_size)?;
        debug!("created {} worker threads", initial_size);
        Ok(pool)
    }

    /// Grow the pool to `new_size` workers; must be larger than the current
    /// size.
    fn grow(self: &Arc<Self>, new_size: usize) -> Result<()> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if new_size <= st.pool_size {
            return Err(Error::InvalidArgument(format!(
                "new pool size {} not larger than current {}",
                new_size, st.pool_size
            )));
        }
        for idx in st.pool_size..new_size {
            let pool = Arc::clone(self);
            thread::Builder::new()
                .name(format!("pool-worker-{}", idx))
                .spawn(move || (pool.worker)(&pool))
                .map_err(|e| Error::Resource(format!("could not create pool thread: {}", e)))?;
            st.pool_size += 1;
            st.available += 1;
        }
        Ok(())
    }

    /// Called by a worker when it starts handling a connection.
    pub fn busy(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.available = st.available.saturating_sub(1);
        if st.available <= dry_threshold(st.pool_size) {
            self.avail_changed.notify_one();
        }
    }

    /// Called by a worker when it goes back to waiting for connections.
    pub fn idle(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.available += 1;
    }

    /// Current `(available, pool_size)` counts.
    pub fn counts(&self) -> (usize, usize) {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (st.available, st.pool_size)
    }

    fn watchdog(self: Arc<Self>) {
        debug!("dry pool watchdog started");
        loop {
            let (grow_to, dry) = {
                let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
                // The timeout covers a notification slipping in before the
                // watchdog reaches the wait.
                let (st, _timeout) = self
                    .avail_changed
                    .wait_timeout(st, std::time::Duration::from_millis(500))
                    .unwrap_or_else(|e| e.into_inner());
                (
                    st.pool_size + st.increment,
                    st.available <= dry_threshold(st.pool_size),
                )
            };
            if dry {
                if let Err(e) = self.grow(grow_to) {
                    error!("could not grow thread pool: {}", e);
                }
            }
        }
    }
}
