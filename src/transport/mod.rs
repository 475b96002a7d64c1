mod memory;
mod split;

pub use memory::{InMemoryTransport, PushRecord};
pub use split::{assemble_var, pull_split, push_split, recv_var, send_var, split_var};

use crate::{error::Result, variable::Variable};

/// The rpc collaborator moving variables to and from parameter servers.
///
/// Both primitives hand back a future acting as the completion token, the
/// communicator awaits it on one of its own threads. Retrying is up to the
/// implementation, any error reaching the communicator is fatal.
#[allow(unused)]
#[trait_variant::make(Transport: Send)]
pub trait LocalTransport: Sync {
    /// Should push `payload` to `endpoint`, where it's stored as `name`.
    ///
    /// # Arguments
    /// * `trainer_id` - The pushing trainer.
    /// * `endpoint` - The parameter server's address.
    /// * `name` - The remote variable name.
    /// * `payload` - The value to push.
    async fn push(&self, trainer_id: usize, endpoint: &str, name: &str, payload: Variable) -> Result<()>;

    /// Should pull the remote variable `name` from `endpoint`.
    ///
    /// # Arguments
    /// * `trainer_id` - The pulling trainer.
    /// * `endpoint` - The parameter server's address.
    /// * `name` - The remote variable name.
    async fn pull(&self, trainer_id: usize, endpoint: &str, name: &str) -> Result<Variable>;
}
