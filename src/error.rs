use std::{error::Error, fmt};

use ndarray::ShapeError;

/// The communicator's result type.
pub type Result<T> = std::result::Result<T, CommErr>;

/// Failures raised while building, feeding or running a communicator.
///
/// Every variant is treated as fatal by the strategies: training can't go on
/// without synchronized parameters, so nothing here is retried locally.
#[derive(Debug)]
pub enum CommErr {
    /// Malformed or inconsistent configuration, detected at initialization.
    Config(String),
    /// A referenced variable is absent from a store or has no registered context.
    MissingVariable(String),
    /// A failure surfaced by the rpc transport.
    Transport {
        endpoint: String,
        name: String,
        detail: String,
    },
    /// Incompatible buffers inside the merge or delta algebra.
    ShapeMismatch { name: String, detail: String },
    /// A sparse row id outside every split range of its variable.
    RowOutOfRange { name: String, row: usize, height: usize },
}

impl CommErr {
    /// Shorthand for building a `ShapeMismatch` error.
    pub fn shape(name: &str, detail: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            name: name.to_string(),
            detail: detail.into(),
        }
    }

    /// Shorthand for building a `Transport` error.
    pub fn transport(endpoint: &str, name: &str, detail: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.to_string(),
            name: name.to_string(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for CommErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommErr::Config(msg) => write!(f, "invalid config: {msg}"),
            CommErr::MissingVariable(name) => write!(f, "missing variable: {name}"),
            CommErr::Transport {
                endpoint,
                name,
                detail,
            } => write!(f, "transport error on {endpoint} for {name}: {detail}"),
            CommErr::ShapeMismatch { name, detail } => {
                write!(f, "shape mismatch for {name}: {detail}")
            }
            CommErr::RowOutOfRange { name, row, height } => {
                write!(f, "row {row} of {name} is out of range, height is {height}")
            }
        }
    }
}

impl Error for CommErr {}

impl From<serde_json::Error> for CommErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<ShapeError> for CommErr {
    fn from(value: ShapeError) -> Self {
        Self::ShapeMismatch {
            name: String::from("<ndarray>"),
            detail: value.to_string(),
        }
    }
}
