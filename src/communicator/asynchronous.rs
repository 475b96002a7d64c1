use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use log::{debug, info, trace, warn};
use rayon::{ThreadPool, prelude::*};

use super::{Strategy, lifecycle::Lifecycle, thread_pool};
use crate::{
    config::{CommunicatorConfig, VarSpec},
    context::{RpcContext, RpcContextMap},
    error::{CommErr, Result},
    merge,
    queue::BlockingQueue,
    transport::{self, Transport},
    variable::{Variable, VariableStore},
};

/// Counts the merged sends of the first registered variable since the last receive.
pub type SendCounter = AtomicUsize;

/// Continuously merges and pushes gradients, pulling parameters every few sends.
///
/// Training threads hand gradients over through `send`, a background send loop
/// drains the per-variable queues, merges every batch and pushes it. Parameters
/// are pulled back once enough merged sends went out, either by the send loop
/// itself or by an independent receive loop.
pub struct AsyncCommunicator<T: Transport> {
    shared: Arc<Shared<T>>,
}

struct Shared<T: Transport> {
    config: CommunicatorConfig,
    send_ctx: RpcContextMap,
    recv_ctx: RpcContextMap,
    queues: BTreeMap<String, BlockingQueue<Variable>>,
    send_pool: Option<ThreadPool>,
    recv_pool: Option<ThreadPool>,
    recv_store: Arc<VariableStore>,
    transport: Arc<T>,
    /// Accessed with relaxed ordering: in independent receive mode it's the only
    /// link between both loops, a receive round may or may not observe the
    /// pushes counted right before it.
    sent: SendCounter,
    lifecycle: Lifecycle,
}

impl<T> AsyncCommunicator<T>
where
    T: Transport + Send + Sync + 'static,
{
    /// Creates a new `AsyncCommunicator`.
    ///
    /// # Arguments
    /// * `config` - The communicator's options.
    /// * `send` - The variables to merge and push.
    /// * `recv` - The variables to pull.
    /// * `recv_store` - Where pulled variables are written.
    /// * `transport` - The rpc transport.
    ///
    /// # Returns
    /// A `Config` error if the options or any variable entry are invalid.
    pub fn new(
        config: CommunicatorConfig,
        send: &[VarSpec],
        recv: &[VarSpec],
        recv_store: Arc<VariableStore>,
        transport: Arc<T>,
    ) -> Result<Self> {
        config.validate()?;
        config.log();

        let send_ctx = RpcContextMap::build(send, config.is_sgd_optimizer)?;
        let recv_ctx = RpcContextMap::build(recv, config.is_sgd_optimizer)?;

        if send_ctx.is_empty() && recv_ctx.is_empty() {
            warn!("no variable needs to be sent or received");
        }

        let (queues, send_pool) = if send_ctx.is_empty() {
            info!("nothing needs to be sent, will not start the send thread");
            (BTreeMap::new(), None)
        } else {
            let capacity = config.queue_capacity()?;
            let queues = send_ctx
                .names()
                .map(|name| (name.to_string(), BlockingQueue::new(capacity)))
                .collect();

            (queues, Some(thread_pool(config.thread_pool_size, "async-send")?))
        };

        let recv_pool = if recv_ctx.is_empty() {
            info!("nothing needs to be received, will not start the receive thread");
            None
        } else {
            Some(thread_pool(config.thread_pool_size, "async-recv")?)
        };

        let shared = Shared {
            config,
            send_ctx,
            recv_ctx,
            queues,
            send_pool,
            recv_pool,
            recv_store,
            transport,
            sent: SendCounter::new(0),
            lifecycle: Lifecycle::new("async"),
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// The amount of merged sends counted since the last receive round.
    pub fn sent_count(&self) -> usize {
        self.shared.sent.load(Ordering::Relaxed)
    }

    /// The amount of snapshots waiting in the queue of `name`.
    pub fn queued(&self, name: &str) -> Result<usize> {
        self.shared.queue(name).map(BlockingQueue::len)
    }

    /// Pulls every registered receive variable right away, a no-op unless running.
    pub fn recv_all(&self) -> Result<()> {
        self.shared.recv_all()
    }
}

impl<T> Strategy for AsyncCommunicator<T>
where
    T: Transport + Send + Sync + 'static,
{
    fn start(&self) {
        let lifecycle = &self.shared.lifecycle;
        if !lifecycle.begin() {
            return;
        }

        if self.shared.send_pool.is_some() {
            let shared = Arc::clone(&self.shared);
            lifecycle.spawn("send", move || shared.send_loop());
        }

        if self.shared.config.independent_recv_thread && self.shared.recv_pool.is_some() {
            let shared = Arc::clone(&self.shared);
            lifecycle.spawn("recv", move || shared.recv_loop());
        }
    }

    fn stop(&self) {
        self.shared.lifecycle.stop();
    }

    /// Hands the current value of `name` in `store` over to the send loop.
    ///
    /// Sparse gradients skip the queue when sparse merging is disabled and are
    /// pushed on the caller's thread. Otherwise a snapshot is queued, blocking
    /// while the variable's queue is full.
    fn send(&self, name: &str, store: &VariableStore) -> Result<()> {
        let shared = &self.shared;
        let ctx = shared.send_ctx.get(name)?;
        let var = store.snapshot(name)?;

        if let Variable::Ids(_) = var {
            return Err(CommErr::shape(name, "index tensors can't be sent as gradients"));
        }

        if var.is_sparse() && !shared.config.merge_sparse_grad {
            trace!("sending {name} without merging");
            return shared.transmit(ctx, &var);
        }

        let queue = shared.queue(name)?;
        trace!(queued = queue.len(); "enqueue {name}");
        queue.push(var);
        shared.lifecycle.wake();

        Ok(())
    }

    /// The async strategy doesn't track ids.
    fn send_ids(&self, _ids: &[&str], tables: &[&str], _store: &VariableStore) -> Result<()> {
        trace!("async communicator ignores ids of {} tables", tables.len());
        Ok(())
    }

    /// Runs a receive check, a no-op when receives have their own thread.
    fn recv(&self) -> Result<()> {
        if self.shared.config.independent_recv_thread {
            return Ok(());
        }

        self.shared.recv_if_due().map(|_| ())
    }

    fn is_running(&self) -> bool {
        self.shared.lifecycle.is_running()
    }
}

impl<T: Transport> Drop for AsyncCommunicator<T> {
    fn drop(&mut self) {
        self.shared.lifecycle.stop();
    }
}

impl<T> Shared<T>
where
    T: Transport + Send + Sync + 'static,
{
    fn queue(&self, name: &str) -> Result<&BlockingQueue<Variable>> {
        self.queues
            .get(name)
            .ok_or_else(|| CommErr::MissingVariable(name.to_string()))
    }

    fn transmit(&self, ctx: &RpcContext, var: &Variable) -> Result<()> {
        if self.config.fake_rpc {
            return Ok(());
        }

        transport::send_var(&*self.transport, ctx, var)
    }

    fn send_loop(&self) -> Result<()> {
        let Some(pool) = &self.send_pool else {
            return Ok(());
        };

        while self.lifecycle.is_running() {
            let started = Instant::now();

            let pending: Vec<_> = self
                .queues
                .iter()
                .filter(|(_, queue)| !queue.is_empty())
                .collect();

            pool.install(|| {
                pending
                    .par_iter()
                    .try_for_each(|(name, queue)| self.merge_and_send(name, queue))
            })?;

            if !pending.is_empty() {
                debug!(
                    vars = pending.len(),
                    elapsed_us = started.elapsed().as_micros() as u64;
                    "send round done"
                );
            }

            let received = if self.config.independent_recv_thread {
                false
            } else {
                self.recv_if_due()?
            };

            if pending.is_empty() && !received {
                self.lifecycle.park(self.config.poll_interval());
            }
        }

        Ok(())
    }

    /// Drains, merges and pushes one variable's queue.
    fn merge_and_send(&self, name: &str, queue: &BlockingQueue<Variable>) -> Result<()> {
        let ctx = self.send_ctx.get(name)?;
        let max = self.config.max_merge_var_num;
        let interval = self.config.poll_interval();

        let mut vars = Vec::with_capacity(max);
        let mut waits = 0;

        while vars.len() < max {
            match queue.pop_timeout(interval) {
                Some(var) => {
                    waits = 0;
                    vars.push(var);
                }
                None => {
                    waits += 1;
                    trace!(waits = waits; "{name} queue ran dry");

                    if waits >= self.config.send_wait_times {
                        break;
                    }
                }
            }
        }

        if vars.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let merged = merge::merge_vars(name, &vars, ctx.merge_add(), self.config.merge_sparse_bucket)?;
        let merged_at = Instant::now();

        self.transmit(ctx, &merged)?;

        debug!(
            merged = vars.len(),
            merge_us = (merged_at - started).as_micros() as u64,
            send_us = merged_at.elapsed().as_micros() as u64;
            "merge and send {name}"
        );

        if self.send_ctx.names().next() == Some(name) {
            self.sent.fetch_add(1, Ordering::Relaxed);
            self.lifecycle.wake();
        }

        Ok(())
    }

    fn recv_loop(&self) -> Result<()> {
        while self.lifecycle.is_running() {
            if !self.recv_if_due()? {
                self.lifecycle.park(self.config.poll_interval());
            }
        }

        Ok(())
    }

    /// Pulls every receive variable if enough merged sends went out.
    ///
    /// # Returns
    /// Whether a receive round ran.
    fn recv_if_due(&self) -> Result<bool> {
        let sent = self.sent.load(Ordering::Relaxed);
        if sent <= self.config.min_send_grad_num_before_recv {
            return Ok(false);
        }

        debug!("current sent count {sent}");
        self.recv_all()?;
        self.sent.store(0, Ordering::Relaxed);
        Ok(true)
    }

    fn recv_all(&self) -> Result<()> {
        let Some(pool) = &self.recv_pool else {
            return Ok(());
        };

        if !self.lifecycle.is_running() {
            return Ok(());
        }

        let started = Instant::now();
        let contexts: Vec<_> = self.recv_ctx.iter().map(|(_, ctx)| ctx).collect();

        pool.install(|| {
            contexts.par_iter().try_for_each(|ctx| -> Result<()> {
                trace!("recv {}", ctx.var_name());
                if self.config.fake_rpc {
                    return Ok(());
                }

                let value = transport::recv_var(&*self.transport, ctx)?;
                self.recv_store.set(ctx.var_name(), value);
                Ok(())
            })
        })?;

        debug!(
            vars = contexts.len(),
            elapsed_us = started.elapsed().as_micros() as u64;
            "recv round done"
        );

        Ok(())
    }
}
