use std::{num::NonZeroUsize, time::Duration};

use log::info;
use serde::Deserialize;

use crate::error::{CommErr, Result};

/// Tunables shared by both communication strategies.
///
/// Every field has a default, so a config file only needs to name the options
/// it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommunicatorConfig {
    /// Capacity of every per-variable send queue.
    pub send_queue_size: usize,
    /// Threads in each of the send and receive pools.
    pub thread_pool_size: usize,
    /// Maximum amount of queued snapshots merged into a single send.
    pub max_merge_var_num: usize,
    /// Polling intervals a drain waits on an empty queue before giving up.
    pub send_wait_times: usize,
    /// Length of one polling interval, in milliseconds.
    pub poll_interval_ms: u64,
    /// Receive from a dedicated thread instead of the send loop.
    pub independent_recv_thread: bool,
    /// Merged sends that must complete before a receive round is due.
    pub min_send_grad_num_before_recv: usize,
    /// Skip every rpc, the rest of the machinery still runs.
    pub fake_rpc: bool,
    /// Queue and merge sparse gradients instead of sending them on the spot.
    pub merge_sparse_grad: bool,
    /// Amount of row buckets merged in parallel for sparse gradients.
    pub merge_sparse_bucket: usize,
    /// Fallback for the merge-add flag of variables that leave it unset.
    pub is_sgd_optimizer: bool,
    /// Id-maps accumulated by the geo strategy before a flush.
    pub geo_need_push_nums: usize,
    /// Amount of trainers, the geo delta is scaled by its inverse.
    pub trainers: usize,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            send_queue_size: 20,
            thread_pool_size: 5,
            max_merge_var_num: 20,
            send_wait_times: 5,
            poll_interval_ms: 10,
            independent_recv_thread: true,
            min_send_grad_num_before_recv: 20,
            fake_rpc: false,
            merge_sparse_grad: true,
            merge_sparse_bucket: 2000,
            is_sgd_optimizer: true,
            geo_need_push_nums: 100,
            trainers: 1,
        }
    }
}

impl CommunicatorConfig {
    /// Parses and validates a json encoded configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every size-like option is usable.
    ///
    /// # Returns
    /// A `Config` error naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("send_queue_size", self.send_queue_size),
            ("thread_pool_size", self.thread_pool_size),
            ("max_merge_var_num", self.max_merge_var_num),
            ("send_wait_times", self.send_wait_times),
            ("merge_sparse_bucket", self.merge_sparse_bucket),
            ("geo_need_push_nums", self.geo_need_push_nums),
            ("trainers", self.trainers),
        ];

        match sizes.into_iter().find(|(_, size)| *size == 0) {
            Some((option, _)) => Err(CommErr::Config(format!("{option} must be greater than zero"))),
            None => Ok(()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn queue_capacity(&self) -> Result<NonZeroUsize> {
        non_zero("send_queue_size", self.send_queue_size)
    }

    pub(crate) fn geo_capacity(&self) -> Result<NonZeroUsize> {
        non_zero("geo_need_push_nums", self.geo_need_push_nums)
    }

    /// Logs every option, called once per initialization.
    pub(crate) fn log(&self) {
        info!(
            send_queue_size = self.send_queue_size,
            thread_pool_size = self.thread_pool_size,
            max_merge_var_num = self.max_merge_var_num,
            send_wait_times = self.send_wait_times,
            poll_interval_ms = self.poll_interval_ms,
            independent_recv_thread = self.independent_recv_thread,
            min_send_grad_num_before_recv = self.min_send_grad_num_before_recv,
            fake_rpc = self.fake_rpc,
            merge_sparse_grad = self.merge_sparse_grad,
            merge_sparse_bucket = self.merge_sparse_bucket,
            is_sgd_optimizer = self.is_sgd_optimizer,
            geo_need_push_nums = self.geo_need_push_nums,
            trainers = self.trainers;
            "communicator config"
        );
    }
}

fn non_zero(option: &str, value: usize) -> Result<NonZeroUsize> {
    NonZeroUsize::new(value)
        .ok_or_else(|| CommErr::Config(format!("{option} must be greater than zero")))
}

/// Where and how a single variable is communicated.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VarSpec {
    /// The variable's name in the local store.
    pub name: String,
    /// The remote name of every split, one per endpoint.
    pub split_names: Vec<String>,
    /// The endpoint serving every split.
    pub endpoints: Vec<String>,
    /// Rows held by every split, may be empty for single split variables.
    #[serde(default)]
    pub sections: Vec<usize>,
    #[serde(default)]
    pub trainer_id: usize,
    /// Sum merged snapshots instead of averaging them, unset falls back to
    /// `CommunicatorConfig::is_sgd_optimizer`.
    #[serde(default)]
    pub merge_add: Option<bool>,
    /// Whether the variable is a sparse table, only read by the geo strategy.
    #[serde(default)]
    pub is_sparse: bool,
}

/// The strategy to build and the variables it communicates.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StrategySpec {
    /// Merge and push gradients continuously, pull parameters periodically.
    Async {
        #[serde(default)]
        send: Vec<VarSpec>,
        #[serde(default)]
        recv: Vec<VarSpec>,
    },
    /// Push accumulated parameter deltas every few steps.
    Geo { vars: Vec<VarSpec> },
}

impl StrategySpec {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
