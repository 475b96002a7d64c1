use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{CommErr, Result};

/// The states of a built strategy, the uninitialized state belongs to `Communicator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initialized,
    Running,
    Stopped,
}

/// Start/stop bookkeeping shared by both strategies.
///
/// Owns the running flag every background loop polls at its iteration
/// boundaries, and the handles of the threads those loops run on.
#[derive(Debug)]
pub struct Lifecycle {
    name: &'static str,
    running: Arc<AtomicBool>,
    bell: Arc<Doorbell>,
    state: Mutex<State>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Lifecycle {
    /// Creates a new `Lifecycle` in the `Initialized` state.
    ///
    /// # Arguments
    /// * `name` - The owning strategy's name, used in logs and thread names.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Arc::new(AtomicBool::new(false)),
            bell: Arc::new(Doorbell::default()),
            state: Mutex::new(State::Initialized),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Moves into the `Running` state and raises the running flag.
    ///
    /// A lifecycle halted by a failing task still counts as `Running` until its
    /// threads are joined, so they are joined here before restarting.
    ///
    /// # Returns
    /// `false` if it was already running, in which case nothing changes.
    pub fn begin(&self) -> bool {
        let mut state = self.state.lock();

        if *state == State::Running {
            if self.is_running() {
                warn!("{} communicator is already running, do nothing", self.name);
                return false;
            }

            warn!("{} communicator was halted by a failure, restarting", self.name);
            self.join_all();
        }

        info!("{} communicator start", self.name);
        self.running.store(true, Ordering::Release);
        *state = State::Running;
        true
    }

    /// Runs `task` on a new named thread.
    ///
    /// If `task` fails the error is logged, the running flag is cleared and every
    /// parked loop is woken, so the whole communicator winds down.
    pub fn spawn<F>(&self, role: &str, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let thread_name = format!("{}-{role}", self.name);
        let running = Arc::clone(&self.running);
        let bell = Arc::clone(&self.bell);

        let handle = thread::Builder::new().name(thread_name.clone()).spawn({
            let thread_name = thread_name.clone();
            move || {
                info!("{thread_name} thread start");

                if let Err(e) = task() {
                    error!(thread = thread_name.as_str(); "{e}, halting communicator");
                    running.store(false, Ordering::Release);
                    bell.ring();
                }

                info!("communicator stopped, {thread_name} thread exit");
            }
        });

        match handle {
            Ok(handle) => self.threads.lock().push(handle),
            Err(e) => {
                let e = CommErr::Config(format!("can't spawn {thread_name}: {e}"));
                error!("{e}, halting communicator");
                self.halt();
            }
        }
    }

    /// Clears the running flag and joins every spawned thread.
    ///
    /// Threads finish their current iteration, in-flight tasks are never
    /// interrupted. Calling it again, or before `begin`, does nothing.
    pub fn stop(&self) {
        let mut state = self.state.lock();

        if *state != State::Running {
            debug!("{} communicator is not running, do nothing", self.name);
            return;
        }

        info!("{} communicator stop", self.name);
        self.halt();
        self.join_all();

        *state = State::Stopped;
        info!("{} communicator stop done", self.name);
    }

    fn join_all(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());

        for handle in threads {
            let thread_name = handle.thread().name().unwrap_or("unnamed").to_string();
            debug!("joining {thread_name} thread");

            if handle.join().is_err() {
                error!("{thread_name} thread panicked");
            }
        }
    }

    /// Lowers the running flag without joining anything.
    fn halt(&self) {
        self.running.store(false, Ordering::Release);
        self.bell.ring();
    }

    /// Wakes loops parked in `park`.
    pub fn wake(&self) {
        self.bell.ring();
    }

    /// Parks the calling loop until `wake` is called or `timeout` elapses.
    pub fn park(&self, timeout: Duration) {
        self.bell.wait(timeout);
    }
}

/// A resettable wake up signal.
#[derive(Debug, Default)]
struct Doorbell {
    rung: Mutex<bool>,
    cv: Condvar,
}

impl Doorbell {
    fn ring(&self) {
        *self.rung.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let mut rung = self.rung.lock();

        if !*rung {
            self.cv.wait_for(&mut rung, timeout);
        }

        *rung = false;
    }
}
