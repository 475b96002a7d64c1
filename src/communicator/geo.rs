use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use log::{debug, info, trace, warn};
use ndarray::Array2;
use parking_lot::Mutex;
use rayon::{ThreadPool, prelude::*};

use super::{Strategy, lifecycle::Lifecycle, thread_pool};
use crate::{
    config::{CommunicatorConfig, VarSpec},
    context::{RpcContext, RpcContextMap},
    error::{CommErr, Result},
    merge,
    queue::BlockingQueue,
    transport::{self, Transport},
    variable::{SelectedRows, Variable, VariableStore},
};

/// The name `send` expects to bootstrap the geo snapshots.
pub const PARAM_INIT: &str = "param_init";

const DELTA_SUFFIX: &str = ".delta";

/// The rows touched during one step, per sparse variable and split.
pub type SparseIdsMap = HashMap<String, Vec<HashSet<usize>>>;

/// One unit of flush work, every sparse split is flushed on its own.
#[derive(Debug, Clone, Copy)]
enum FlushTask<'a> {
    Dense(&'a str),
    Sparse(&'a str, usize),
}

/// Pushes parameter deltas every `geo_need_push_nums` steps.
///
/// Keeps three snapshots per tracked variable next to the caller's training
/// values: `old`, the last value known to match the server, `delta`, the last
/// increment pushed, and a mirror of the last value pulled. Sparse variables
/// only ever push the rows touched since the previous flush.
pub struct GeoCommunicator<T: Transport> {
    shared: Arc<Shared<T>>,
}

struct Shared<T: Transport> {
    config: CommunicatorConfig,
    /// Tracked variables and whether they are sparse.
    vars: BTreeMap<String, bool>,
    send_ctx: RpcContextMap,
    recv_ctx: RpcContextMap,
    training: Arc<VariableStore>,
    old: VariableStore,
    delta: VariableStore,
    pserver: VariableStore,
    ids_queue: BlockingQueue<SparseIdsMap>,
    /// Id maps accumulated towards the next flush, kept when a cycle gives up.
    pending: Mutex<Vec<SparseIdsMap>>,
    pool: Option<ThreadPool>,
    transport: Arc<T>,
    flushes: AtomicUsize,
    lifecycle: Lifecycle,
}

impl<T> GeoCommunicator<T>
where
    T: Transport + Send + Sync + 'static,
{
    /// Creates a new `GeoCommunicator`.
    ///
    /// # Arguments
    /// * `config` - The communicator's options.
    /// * `vars` - The parameters to keep in sync.
    /// * `training` - The store holding the trainer's current parameter values.
    /// * `transport` - The rpc transport.
    ///
    /// # Returns
    /// A `Config` error if the options or any variable entry are invalid.
    pub fn new(
        config: CommunicatorConfig,
        vars: &[VarSpec],
        training: Arc<VariableStore>,
        transport: Arc<T>,
    ) -> Result<Self> {
        config.validate()?;
        config.log();

        let recv_ctx = RpcContextMap::build(vars, config.is_sgd_optimizer)?;

        let mut send_ctx = RpcContextMap::default();
        for (name, ctx) in recv_ctx.iter() {
            send_ctx.insert(name, ctx.with_suffix(DELTA_SUFFIX));
        }

        let vars: BTreeMap<_, _> = vars
            .iter()
            .map(|spec| (spec.name.clone(), spec.is_sparse))
            .collect();

        let pool = if vars.is_empty() {
            warn!("no variable needs to be synchronized, will not start the send thread");
            None
        } else {
            Some(thread_pool(config.thread_pool_size, "geo-send")?)
        };

        info!(
            vars = vars.len(),
            trainers = config.trainers,
            need_push = config.geo_need_push_nums;
            "geo communicator init"
        );

        let shared = Shared {
            ids_queue: BlockingQueue::new(config.geo_capacity()?),
            config,
            vars,
            send_ctx,
            recv_ctx,
            training,
            old: VariableStore::new(),
            delta: VariableStore::new(),
            pserver: VariableStore::new(),
            pending: Mutex::new(Vec::new()),
            pool,
            transport,
            flushes: AtomicUsize::new(0),
            lifecycle: Lifecycle::new("geo"),
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// The amount of completed flush cycles.
    pub fn flush_count(&self) -> usize {
        self.shared.flushes.load(Ordering::Relaxed)
    }

    /// Id maps accumulated but not flushed yet, queued ones included.
    pub fn pending_steps(&self) -> usize {
        self.shared.pending.lock().len() + self.shared.ids_queue.len()
    }

    /// The last value known to match the server.
    pub fn old_value(&self, name: &str) -> Result<Variable> {
        self.shared.old.snapshot(name)
    }

    /// The last pulled value, stored under split names for sparse variables.
    pub fn server_value(&self, name: &str) -> Result<Variable> {
        self.shared.pserver.snapshot(name)
    }

    /// The last delta pushed, stored under the pushed name.
    pub fn delta_value(&self, name: &str) -> Result<Variable> {
        self.shared.delta.snapshot(name)
    }
}

impl<T> Strategy for GeoCommunicator<T>
where
    T: Transport + Send + Sync + 'static,
{
    fn start(&self) {
        let lifecycle = &self.shared.lifecycle;
        if !lifecycle.begin() {
            return;
        }

        if self.shared.pool.is_some() {
            let shared = Arc::clone(&self.shared);
            lifecycle.spawn("send", move || shared.send_loop());
        }
    }

    fn stop(&self) {
        self.shared.lifecycle.stop();
    }

    /// Only `param_init` means something to the geo strategy, it seeds `old`
    /// and the server mirror from the training values. Gradients are never sent.
    fn send(&self, name: &str, _store: &VariableStore) -> Result<()> {
        if name != PARAM_INIT {
            debug!("geo communicator ignores send of {name}");
            return Ok(());
        }

        self.shared.param_init()
    }

    /// Records which rows of every table the lookups in `ids` touched.
    ///
    /// # Arguments
    /// * `ids` - The names of the index tensors in `store`.
    /// * `tables` - The sparse variable each index tensor looks up.
    /// * `store` - The store holding the index tensors.
    fn send_ids(&self, ids: &[&str], tables: &[&str], store: &VariableStore) -> Result<()> {
        if ids.len() != tables.len() {
            return Err(CommErr::Config(format!(
                "{} index tensors for {} tables",
                ids.len(),
                tables.len()
            )));
        }

        let started = Instant::now();
        let mut step = SparseIdsMap::new();

        for (&ids_name, &table) in ids.iter().zip(tables) {
            let ctx = self.shared.recv_ctx.get(table)?;
            let splits = step
                .entry(table.to_string())
                .or_insert_with(|| vec![HashSet::new(); ctx.splits()]);

            let handle = store.get(ids_name)?;
            let guard = handle.read();

            for &id in guard.as_ids(ids_name)? {
                let (split, _) = ctx.locate(id)?;
                splits[split].insert(id);
            }
        }

        trace!(queued = self.shared.ids_queue.len(); "enqueue ids of {} tables", step.len());
        self.shared.ids_queue.push(step);
        self.shared.lifecycle.wake();

        debug!(
            elapsed_us = started.elapsed().as_micros() as u64;
            "ids of {} tables recorded",
            tables.len()
        );

        Ok(())
    }

    /// Pulls happen inside every flush, there's nothing to do here.
    fn recv(&self) -> Result<()> {
        trace!("geo communicator receives while flushing, nothing to do");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.lifecycle.is_running()
    }
}

impl<T: Transport> Drop for GeoCommunicator<T> {
    fn drop(&mut self) {
        self.shared.lifecycle.stop();
    }
}

impl<T> Shared<T>
where
    T: Transport + Send + Sync + 'static,
{
    fn param_init(&self) -> Result<()> {
        for (name, &sparse) in &self.vars {
            let training = self.training.snapshot(name)?;
            let dense = training.as_dense(name)?;

            let mirror = if sparse {
                Variable::Sparse(SelectedRows::empty(dense.nrows(), dense.ncols()))
            } else {
                training.clone()
            };

            self.pserver.set(name, mirror);
            self.old.set(name, training);
        }

        info!("geo params of {} variables initialized", self.vars.len());
        Ok(())
    }

    fn send_loop(&self) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        let need = self.config.geo_need_push_nums;
        let interval = self.config.poll_interval();

        while self.lifecycle.is_running() {
            let mut waits = 0;

            while self.pending.lock().len() < need && waits < self.config.send_wait_times {
                match self.ids_queue.pop_timeout(interval) {
                    Some(step) => {
                        waits = 0;
                        self.pending.lock().push(step);
                    }
                    None => waits += 1,
                }

                if !self.lifecycle.is_running() {
                    return Ok(());
                }
            }

            let batch = {
                let mut pending = self.pending.lock();
                if pending.len() < need {
                    trace!(pending = pending.len(); "not enough steps to flush");
                    continue;
                }

                std::mem::take(&mut *pending)
            };

            self.flush(pool, &batch)?;
        }

        Ok(())
    }

    /// Runs one flush cycle over every tracked variable.
    fn flush(&self, pool: &ThreadPool, batch: &[SparseIdsMap]) -> Result<()> {
        let started = Instant::now();

        let mut tasks = Vec::new();
        for (name, &sparse) in &self.vars {
            if sparse {
                let splits = self.recv_ctx.get(name)?.splits();
                tasks.extend((0..splits).map(|split| FlushTask::Sparse(name, split)));
            } else {
                tasks.push(FlushTask::Dense(name));
            }
        }

        pool.install(|| {
            tasks.par_iter().try_for_each(|task| match *task {
                FlushTask::Dense(name) => self.flush_dense(name),
                FlushTask::Sparse(name, split) => self.flush_sparse(name, split, batch),
            })
        })?;

        let flushes = self.flushes.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            steps = batch.len(),
            tasks = tasks.len(),
            elapsed_us = started.elapsed().as_micros() as u64;
            "flush {flushes} done"
        );

        Ok(())
    }

    fn flush_dense(&self, name: &str) -> Result<()> {
        let started = Instant::now();
        let training = self.training.get(name)?;
        let old = self.old.get(name)?;

        let delta = {
            let training = training.read();
            let mut old = old.write();
            merge::advance_dense(name, training.as_dense(name)?, old.as_dense_mut(name)?, self.config.trainers)?
        };

        let send_ctx = self.send_ctx.get(name)?;
        let delta = Variable::Dense(delta);
        self.delta.set(send_ctx.var_name(), delta.clone());

        if self.config.fake_rpc {
            return Ok(());
        }

        transport::send_var(&*self.transport, send_ctx, &delta)?;
        let sent_at = Instant::now();

        let server = transport::recv_var(&*self.transport, self.recv_ctx.get(name)?)?;
        {
            let mut training = training.write();
            let mut old = old.write();
            merge::reconcile_dense(
                name,
                training.as_dense_mut(name)?,
                old.as_dense_mut(name)?,
                server.as_dense(name)?,
            )?;
        }
        self.pserver.set(name, server);

        debug!(
            send_us = (sent_at - started).as_micros() as u64,
            recv_us = sent_at.elapsed().as_micros() as u64;
            "dense {name} flushed"
        );

        Ok(())
    }

    fn flush_sparse(&self, name: &str, split: usize, batch: &[SparseIdsMap]) -> Result<()> {
        let started = Instant::now();
        let recv_ctx = self.recv_ctx.get(name)?;
        let send_ctx = self.send_ctx.get(name)?;
        let ids = merge_ids(batch, name, split);

        let training = self.training.get(name)?;
        let old = self.old.get(name)?;

        let payload = {
            let training = training.read();
            let mut old = old.write();
            let training = training.as_dense(name)?;
            let old = old.as_dense_mut(name)?;
            self.sparse_delta(recv_ctx, split, &ids, training, old)?
        };

        let payload = Variable::Sparse(payload);
        self.delta.set(&send_ctx.split_names()[split], payload.clone());

        if self.config.fake_rpc {
            return Ok(());
        }

        transport::push_split(&*self.transport, send_ctx, split, payload)?;
        let sent_at = Instant::now();

        let server = transport::pull_split(&*self.transport, recv_ctx, split)?;
        {
            let rows = server.as_sparse(name)?;
            let start = recv_ctx.split_start(split);
            let mut training = training.write();
            let mut old = old.write();
            let training = training.as_dense_mut(name)?;
            let old = old.as_dense_mut(name)?;

            for (local, row) in rows.iter() {
                let abs = start + local;
                check_row(name, abs, training)?;
                check_row(name, abs, old)?;
                merge::reconcile_row(training.row_mut(abs), old.row_mut(abs), row);
            }
        }
        self.pserver.set(&recv_ctx.split_names()[split], server);

        debug!(
            rows = ids.len(),
            send_us = (sent_at - started).as_micros() as u64,
            recv_us = sent_at.elapsed().as_micros() as u64;
            "sparse {name} split {split} flushed"
        );

        Ok(())
    }

    /// Advances the touched rows of `old` and packs their deltas, addressed by
    /// split-local offsets.
    fn sparse_delta(
        &self,
        ctx: &RpcContext,
        split: usize,
        ids: &BTreeSet<usize>,
        training: &Array2<f32>,
        old: &mut Array2<f32>,
    ) -> Result<SelectedRows> {
        let width = training.ncols();
        let start = ctx.split_start(split);
        let height = ctx
            .sections()
            .get(split)
            .copied()
            .unwrap_or(training.nrows());

        let mut rows = Vec::with_capacity(ids.len());
        let mut values = Vec::with_capacity(ids.len() * width);

        for &id in ids {
            check_row(ctx.var_name(), id, training)?;
            check_row(ctx.var_name(), id, old)?;
            let delta = merge::advance_row(training.row(id), old.row_mut(id), self.config.trainers);

            rows.push(id - start);
            values.extend(delta.iter().copied());
        }

        let value = Array2::from_shape_vec((rows.len(), width), values)?;
        SelectedRows::new(height, rows, value)
    }
}

/// Unions the rows of `split` of `name` touched across `batch`.
fn merge_ids(batch: &[SparseIdsMap], name: &str, split: usize) -> BTreeSet<usize> {
    batch
        .iter()
        .filter_map(|step| step.get(name))
        .filter_map(|splits| splits.get(split))
        .flatten()
        .copied()
        .collect()
}

fn check_row(name: &str, row: usize, value: &Array2<f32>) -> Result<()> {
    if row >= value.nrows() {
        return Err(CommErr::RowOutOfRange {
            name: name.to_string(),
            row,
            height: value.nrows(),
        });
    }

    Ok(())
}
