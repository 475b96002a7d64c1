use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, RwLock};

use super::Transport;
use crate::{
    error::{CommErr, Result},
    variable::Variable,
};

/// A push observed by an `InMemoryTransport`.
#[derive(Debug, Clone, PartialEq)]
pub struct PushRecord {
    pub trainer_id: usize,
    pub endpoint: String,
    pub name: String,
    pub payload: Variable,
}

/// An in-process stand-in for a set of parameter servers.
///
/// Pushes are recorded, never applied. Pulls are served from values seeded with
/// `seed`, so callers decide what the "server" holds at every point. Useful for
/// tests and single-process simulations.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    pushes: Mutex<Vec<PushRecord>>,
    pushed: Condvar,
    pulls: Mutex<Vec<(String, String)>>,
    remote: RwLock<HashMap<(String, String), Variable>>,
    failure: RwLock<Option<String>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `value` the remote value of `name` at `endpoint`.
    pub fn seed(&self, endpoint: &str, name: &str, value: Variable) {
        self.remote
            .write()
            .insert((endpoint.to_string(), name.to_string()), value);
    }

    /// Makes every following rpc fail with `detail`.
    pub fn fail_with(&self, detail: &str) {
        *self.failure.write() = Some(detail.to_string());
    }

    /// Returns every push observed so far, in completion order.
    pub fn pushes(&self) -> Vec<PushRecord> {
        self.pushes.lock().clone()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().len()
    }

    /// Returns every `(endpoint, name)` pulled so far.
    pub fn pulls(&self) -> Vec<(String, String)> {
        self.pulls.lock().clone()
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.lock().len()
    }

    /// Blocks until at least `count` pushes were observed.
    ///
    /// # Returns
    /// `false` if `timeout` elapsed first.
    pub fn wait_for_pushes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pushes = self.pushes.lock();

        while pushes.len() < count {
            if self.pushed.wait_until(&mut pushes, deadline).timed_out() {
                return pushes.len() >= count;
            }
        }

        true
    }

    fn check_failure(&self, endpoint: &str, name: &str) -> Result<()> {
        match self.failure.read().as_deref() {
            Some(detail) => Err(CommErr::transport(endpoint, name, detail)),
            None => Ok(()),
        }
    }
}

impl Transport for InMemoryTransport {
    async fn push(&self, trainer_id: usize, endpoint: &str, name: &str, payload: Variable) -> Result<()> {
        self.check_failure(endpoint, name)?;

        self.pushes.lock().push(PushRecord {
            trainer_id,
            endpoint: endpoint.to_string(),
            name: name.to_string(),
            payload,
        });
        self.pushed.notify_all();

        Ok(())
    }

    async fn pull(&self, _trainer_id: usize, endpoint: &str, name: &str) -> Result<Variable> {
        self.check_failure(endpoint, name)?;

        self.pulls
            .lock()
            .push((endpoint.to_string(), name.to_string()));

        self.remote
            .read()
            .get(&(endpoint.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| CommErr::transport(endpoint, name, "no such remote variable"))
    }
}
