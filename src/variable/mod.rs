mod selected_rows;
mod store;

use ndarray::{Array1, Array2, Axis};

use crate::error::{CommErr, Result};

pub use selected_rows::SelectedRows;
pub use store::VariableStore;

/// A named tensor moved between trainers and parameter servers.
#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    /// A full `rows x width` tensor.
    Dense(Array2<f32>),
    /// A sparse subset of rows of a taller tensor.
    Sparse(SelectedRows),
    /// Lookup indices, the row ids a training step touched in some sparse table.
    Ids(Vec<usize>),
}

impl Variable {
    /// Wraps a flat vector as a dense column, one element per row.
    pub fn dense_vec(values: Vec<f32>) -> Self {
        Self::Dense(Array1::from(values).insert_axis(Axis(1)))
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse(_))
    }

    /// A short name for the kind of tensor held, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dense(_) => "dense",
            Self::Sparse(_) => "sparse",
            Self::Ids(_) => "ids",
        }
    }

    /// Borrows the dense tensor.
    ///
    /// # Arguments
    /// * `name` - The variable's name, only used to build the error.
    ///
    /// # Returns
    /// A `ShapeMismatch` if the variable isn't dense.
    pub fn as_dense(&self, name: &str) -> Result<&Array2<f32>> {
        match self {
            Self::Dense(value) => Ok(value),
            other => Err(unexpected_kind(name, "dense", other)),
        }
    }

    /// Mutably borrows the dense tensor, see `as_dense`.
    pub fn as_dense_mut(&mut self, name: &str) -> Result<&mut Array2<f32>> {
        match self {
            Self::Dense(value) => Ok(value),
            other => Err(unexpected_kind(name, "dense", other)),
        }
    }

    pub fn as_sparse(&self, name: &str) -> Result<&SelectedRows> {
        match self {
            Self::Sparse(value) => Ok(value),
            other => Err(unexpected_kind(name, "sparse", other)),
        }
    }

    pub fn as_ids(&self, name: &str) -> Result<&[usize]> {
        match self {
            Self::Ids(ids) => Ok(ids),
            other => Err(unexpected_kind(name, "ids", other)),
        }
    }
}

fn unexpected_kind(name: &str, expected: &str, got: &Variable) -> CommErr {
    CommErr::shape(name, format!("expected a {expected} variable, got {}", got.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_vec_is_a_column() {
        let var = Variable::dense_vec(vec![1.0, 2.0, 3.0]);
        let dense = var.as_dense("w").unwrap();

        assert_eq!(dense.dim(), (3, 1));
        assert_eq!(dense.iter().copied().collect::<Vec<_>>(), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn accessors_reject_other_kinds() {
        let var = Variable::Ids(vec![1, 2]);

        assert!(var.as_dense("ids").is_err());
        assert!(var.as_sparse("ids").is_err());
        assert_eq!(var.as_ids("ids").unwrap(), [1, 2]);
    }
}
