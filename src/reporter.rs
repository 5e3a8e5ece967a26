//! Background thread that prints a report every few seconds while the program
//! runs.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::config::ShutdownPolicy;

/// Something the reporting thread can sample.
pub trait Report: Sync {
    fn reporting_enabled(&self) -> bool;
    fn report(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReporterState {
    Running,
    Stopped,
}

#[derive(Default)]
struct Shared {
    stop_requested: Mutex<bool>,
    wake: Condvar,
    finished: AtomicBool,
}

pub struct Reporter {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Reporter {
    /// Start reporting on `target` every `interval`.  After each wait the
    /// thread exits if a stop was requested or `target` no longer wants
    /// reports.
    pub fn spawn<T: Report + 'static>(target: &'static T, interval: Duration) -> io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("malloc_tally".to_string())
            .spawn(move || {
                run(&thread_shared, target, interval);
                thread_shared.finished.store(true, Ordering::SeqCst);
            })?;
        Ok(Reporter {
            shared,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> ReporterState {
        if self.shared.finished.load(Ordering::SeqCst) {
            ReporterState::Stopped
        } else {
            ReporterState::Running
        }
    }

    /// Ask the thread to exit at its next wake-up, and wake it now.
    pub fn stop(&self) {
        let mut stop = self
            .shared
            .stop_requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *stop = true;
        self.shared.wake.notify_all();
    }

    /// Stop the thread and, depending on `policy`, wait for it or let it go.
    pub fn retire(mut self, policy: ShutdownPolicy) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            match policy {
                ShutdownPolicy::Join => {
                    let _ = handle.join();
                }
                ShutdownPolicy::Detach => drop(handle),
            }
        }
    }
}

fn run<T: Report>(shared: &Shared, target: &T, interval: Duration) {
    loop {
        let stop = {
            let guard = shared
                .stop_requested
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let (guard, _) = shared
                .wake
                .wait_timeout_while(guard, interval, |stop| !*stop)
                .unwrap_or_else(PoisonError::into_inner);
            *guard
        };
        if stop || !target.reporting_enabled() {
            return;
        }
        target.report();
    }
}
