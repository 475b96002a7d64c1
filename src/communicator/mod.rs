mod asynchronous;
mod geo;
mod lifecycle;

pub use asynchronous::{AsyncCommunicator, SendCounter};
pub use geo::{GeoCommunicator, PARAM_INIT, SparseIdsMap};
pub use lifecycle::{Lifecycle, State};

use std::sync::Arc;

use log::{info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{
    config::{CommunicatorConfig, StrategySpec},
    error::{CommErr, Result},
    transport::Transport,
    variable::VariableStore,
};

/// A gradient synchronization strategy.
///
/// Implementations own their background threads, `start` and `stop` drive them.
pub trait Strategy: Send + Sync {
    /// Should start the background loops, a no-op while running.
    fn start(&self);

    /// Should stop and join every background loop, a no-op unless running.
    fn stop(&self);

    /// Should hand the current value of `name` in `store` over for sending.
    ///
    /// # Arguments
    /// * `name` - The variable to send.
    /// * `store` - The store holding its current value.
    fn send(&self, name: &str, store: &VariableStore) -> Result<()>;

    /// Should record the sparse rows the index tensors in `ids` touched.
    ///
    /// # Arguments
    /// * `ids` - The names of the index tensors in `store`.
    /// * `tables` - The sparse variable each index tensor looks up.
    /// * `store` - The store holding the index tensors.
    fn send_ids(&self, ids: &[&str], tables: &[&str], store: &VariableStore) -> Result<()>;

    /// Should run a receive round if one is due.
    fn recv(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// The entry point of the training loop.
///
/// Starts uninitialized, `init` picks and builds the strategy exactly once.
#[derive(Default)]
pub struct Communicator {
    strategy: Option<Box<dyn Strategy>>,
}

impl Communicator {
    /// Creates a new uninitialized `Communicator`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the strategy described by `spec`.
    ///
    /// # Arguments
    /// * `config` - The communicator's options.
    /// * `spec` - The strategy and the variables it communicates.
    /// * `store` - Where pulled values are written for the async strategy, the
    ///   training values for the geo strategy.
    /// * `transport` - The rpc transport.
    ///
    /// # Returns
    /// A `Config` error if it was already initialized or the configuration is invalid.
    pub fn init<T>(
        &mut self,
        config: CommunicatorConfig,
        spec: StrategySpec,
        store: Arc<VariableStore>,
        transport: Arc<T>,
    ) -> Result<()>
    where
        T: Transport + Send + Sync + 'static,
    {
        if self.strategy.is_some() {
            return Err(CommErr::Config("communicator is already initialized".into()));
        }

        let strategy: Box<dyn Strategy> = match spec {
            StrategySpec::Async { send, recv } => {
                info!(send = send.len(), recv = recv.len(); "init async communicator");
                Box::new(AsyncCommunicator::new(config, &send, &recv, store, transport)?)
            }
            StrategySpec::Geo { vars } => {
                info!(vars = vars.len(); "init geo communicator");
                Box::new(GeoCommunicator::new(config, &vars, store, transport)?)
            }
        };

        self.strategy = Some(strategy);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.strategy.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.strategy.as_ref().is_some_and(|s| s.is_running())
    }

    pub fn start(&self) {
        match &self.strategy {
            Some(strategy) => strategy.start(),
            None => warn!("communicator is not inited, do nothing"),
        }
    }

    pub fn stop(&self) {
        match &self.strategy {
            Some(strategy) => strategy.stop(),
            None => warn!("communicator is not inited, do nothing"),
        }
    }

    /// Hands `name` over to the strategy, see `Strategy::send`.
    pub fn send(&self, name: &str, store: &VariableStore) -> Result<()> {
        self.strategy()?.send(name, store)
    }

    /// Records touched sparse rows, see `Strategy::send_ids`.
    pub fn send_ids(&self, ids: &[&str], tables: &[&str], store: &VariableStore) -> Result<()> {
        self.strategy()?.send_ids(ids, tables, store)
    }

    pub fn recv(&self) -> Result<()> {
        self.strategy()?.recv()
    }

    fn strategy(&self) -> Result<&dyn Strategy> {
        self.strategy
            .as_deref()
            .ok_or_else(|| CommErr::Config("communicator is not initialized".into()))
    }
}

/// Builds a pool of `size` threads named after `prefix`.
fn thread_pool(size: usize, prefix: &'static str) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(size)
        .thread_name(move |i| format!("{prefix}-{i}"))
        .build()
        .map_err(|e| CommErr::Config(format!("can't build {prefix} thread pool: {e}")))
}
