//! Gradient synchronization between data-parallel trainers and parameter servers.
//!
//! A [`Communicator`] is built once per trainer from a [`CommunicatorConfig`] and a
//! [`StrategySpec`], then fed from the training loop:
//! * the async strategy merges queued gradients and pushes them continuously,
//!   pulling parameters back every few sends.
//! * the geo strategy tracks local drift and pushes parameter deltas every few
//!   steps, reconciling with the server's value after every push.

pub mod communicator;
pub mod config;
pub mod context;
pub mod error;
pub mod merge;
pub mod queue;
pub mod transport;
pub mod variable;

pub use communicator::{AsyncCommunicator, Communicator, GeoCommunicator, Strategy};
pub use config::{CommunicatorConfig, StrategySpec, VarSpec};
pub use context::{RpcContext, RpcContextMap};
pub use error::{CommErr, Result};
pub use queue::BlockingQueue;
pub use transport::{InMemoryTransport, Transport};
pub use variable::{SelectedRows, Variable, VariableStore};
