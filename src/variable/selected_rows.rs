use ndarray::{Array2, ArrayView1, Axis};

use crate::error::{CommErr, Result};

/// A sparse tensor holding only some rows of a `height` x `width` matrix.
///
/// `value` stores the row vectors in the same order as `rows`, so the i-th row
/// of `value` belongs to row id `rows[i]`. The same id may appear more than once,
/// consumers that care about uniqueness go through `merge`.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedRows {
    height: usize,
    rows: Vec<usize>,
    value: Array2<f32>,
}

impl SelectedRows {
    /// Creates a new `SelectedRows`.
    ///
    /// # Arguments
    /// * `height` - The declared total amount of rows of the full tensor.
    /// * `rows` - The row ids present in this tensor.
    /// * `value` - One row vector per row id.
    ///
    /// # Returns
    /// A `ShapeMismatch` if `rows` and `value` disagree in length, or a
    /// `RowOutOfRange` if any row id isn't below `height`.
    pub fn new(height: usize, rows: Vec<usize>, value: Array2<f32>) -> Result<Self> {
        if rows.len() != value.nrows() {
            return Err(CommErr::shape(
                "selected_rows",
                format!("{} row ids for {} row vectors", rows.len(), value.nrows()),
            ));
        }

        if let Some(&row) = rows.iter().find(|&&row| row >= height) {
            return Err(CommErr::RowOutOfRange {
                name: String::from("selected_rows"),
                row,
                height,
            });
        }

        Ok(Self {
            height,
            rows,
            value,
        })
    }

    /// Creates an empty `SelectedRows` of the given height and row width.
    pub fn empty(height: usize, width: usize) -> Self {
        Self {
            height,
            rows: Vec::new(),
            value: Array2::zeros((0, width)),
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn value(&self) -> &Array2<f32> {
        &self.value
    }

    /// The length of every row vector.
    pub fn width(&self) -> usize {
        self.value.ncols()
    }

    /// The amount of stored rows, duplicates included.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the row vector stored at position `idx`, not at row id `idx`.
    pub fn row_at(&self, idx: usize) -> ArrayView1<'_, f32> {
        self.value.index_axis(Axis(0), idx)
    }

    /// Iterates `(row id, row vector)` pairs in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, ArrayView1<'_, f32>)> {
        self.rows.iter().copied().zip(self.value.outer_iter())
    }

    /// Looks up the first stored vector for row id `row`.
    pub fn find(&self, row: usize) -> Option<ArrayView1<'_, f32>> {
        self.rows
            .iter()
            .position(|&r| r == row)
            .map(|idx| self.row_at(idx))
    }
}
