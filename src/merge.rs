//! Merge and delta algebra.
//!
//! Merges turn a batch of queued snapshots of one variable into a single payload.
//! Deltas implement the geo bookkeeping between the `training`, `old` and server
//! values of a parameter.

use std::collections::{BTreeMap, btree_map::Entry};

use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1};
use rayon::prelude::*;

use crate::{
    error::{CommErr, Result},
    variable::{SelectedRows, Variable},
};

/// Merges a batch of snapshots of the variable `name`.
///
/// # Arguments
/// * `name` - The variable's name, for errors.
/// * `vars` - The snapshots, all dense or all sparse.
/// * `merge_add` - Sum dense snapshots if set, average them otherwise. Sparse
///   snapshots are always summed.
/// * `buckets` - Amount of row buckets merged in parallel for sparse snapshots.
///
/// # Returns
/// A `ShapeMismatch` error for an empty batch, mixed kinds or incompatible shapes.
pub fn merge_vars(name: &str, vars: &[Variable], merge_add: bool, buckets: usize) -> Result<Variable> {
    let Some(first) = vars.first() else {
        return Err(CommErr::shape(name, "nothing to merge"));
    };

    let average = !merge_add;

    match first {
        Variable::Dense(_) => {
            let dense = vars
                .iter()
                .map(|var| var.as_dense(name))
                .collect::<Result<Vec<_>>>()?;

            merge_dense(name, &dense, average).map(Variable::Dense)
        }
        Variable::Sparse(_) => {
            let sparse = vars
                .iter()
                .map(|var| var.as_sparse(name))
                .collect::<Result<Vec<_>>>()?;

            merge_sparse(name, &sparse, buckets).map(Variable::Sparse)
        }
        Variable::Ids(_) => Err(CommErr::shape(name, "index tensors can't be merged")),
    }
}

/// Elementwise sum, or average, of equally shaped buffers.
pub fn merge_dense(name: &str, vars: &[&Array2<f32>], average: bool) -> Result<Array2<f32>> {
    let (first, rest) = vars
        .split_first()
        .ok_or_else(|| CommErr::shape(name, "nothing to merge"))?;

    let mut out = (*first).clone();
    for var in rest {
        if var.dim() != out.dim() {
            return Err(CommErr::shape(
                name,
                format!("can't merge {:?} into {:?}", var.dim(), out.dim()),
            ));
        }

        out += *var;
    }

    if average {
        out /= vars.len() as f32;
    }

    Ok(out)
}

/// Union-by-row-id of sparse snapshots, summing the rows that share an id.
///
/// Rows are partitioned by `id % buckets` and the buckets are merged in parallel,
/// the output lists ids bucket by bucket.
pub fn merge_sparse(name: &str, vars: &[&SelectedRows], buckets: usize) -> Result<SelectedRows> {
    let first = vars
        .first()
        .ok_or_else(|| CommErr::shape(name, "nothing to merge"))?;

    let (height, width) = (first.height(), first.width());
    if let Some(var) = vars
        .iter()
        .find(|var| var.height() != height || var.width() != width)
    {
        return Err(CommErr::shape(
            name,
            format!(
                "can't merge rows of height {} width {} with height {height} width {width}",
                var.height(),
                var.width()
            ),
        ));
    }

    let total = vars.iter().map(|var| var.len()).sum::<usize>();
    let buckets = buckets.clamp(1, total.max(1));

    let mut partitions = vec![Vec::new(); buckets];
    for (i, var) in vars.iter().enumerate() {
        for (pos, &row) in var.rows().iter().enumerate() {
            partitions[row % buckets].push((i, pos));
        }
    }

    let merged: Vec<Vec<(usize, Array1<f32>)>> = partitions
        .into_par_iter()
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut acc = BTreeMap::new();

            for (i, pos) in part {
                let row = vars[i].rows()[pos];
                let value = vars[i].row_at(pos);

                match acc.entry(row) {
                    Entry::Vacant(entry) => {
                        entry.insert(value.to_owned());
                    }
                    Entry::Occupied(mut entry) => *entry.get_mut() += &value,
                }
            }

            acc.into_iter().collect()
        })
        .collect();

    let rows_len = merged.iter().map(Vec::len).sum();
    let mut rows = Vec::with_capacity(rows_len);
    let mut values = Vec::with_capacity(rows_len * width);

    for (row, value) in merged.into_iter().flatten() {
        rows.push(row);
        values.extend(value.iter().copied());
    }

    let value = Array2::from_shape_vec((rows.len(), width), values)?;
    SelectedRows::new(height, rows, value)
}

/// Computes the geo delta of a dense parameter and advances `old` by it.
///
/// `delta = (training - old) / trainers`, then `old += delta`.
pub fn advance_dense(
    name: &str,
    training: &Array2<f32>,
    old: &mut Array2<f32>,
    trainers: usize,
) -> Result<Array2<f32>> {
    if training.dim() != old.dim() {
        return Err(CommErr::shape(
            name,
            format!("training {:?} vs old {:?}", training.dim(), old.dim()),
        ));
    }

    let delta = (training - &*old) / trainers as f32;
    *old += &delta;
    Ok(delta)
}

/// Folds the server's value of a dense parameter back into the local copies.
///
/// `training += server - old`, then `old = server`. `old` must still hold the
/// value it had before the pull.
pub fn reconcile_dense(
    name: &str,
    training: &mut Array2<f32>,
    old: &mut Array2<f32>,
    server: &Array2<f32>,
) -> Result<()> {
    if training.dim() != server.dim() || old.dim() != server.dim() {
        return Err(CommErr::shape(
            name,
            format!(
                "training {:?}, old {:?} and server {:?} differ",
                training.dim(),
                old.dim(),
                server.dim()
            ),
        ));
    }

    *training += &(server - &*old);
    old.assign(server);
    Ok(())
}

/// The row-wise counterpart of `advance_dense`.
pub fn advance_row(
    training: ArrayView1<'_, f32>,
    mut old: ArrayViewMut1<'_, f32>,
    trainers: usize,
) -> Array1<f32> {
    let delta = (&training - &old) / trainers as f32;
    old += &delta;
    delta
}

/// The row-wise counterpart of `reconcile_dense`.
pub fn reconcile_row(
    mut training: ArrayViewMut1<'_, f32>,
    mut old: ArrayViewMut1<'_, f32>,
    server: ArrayView1<'_, f32>,
) {
    training += &(&server - &old);
    old.assign(&server);
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::seq::SliceRandom;

    use super::*;

    fn sparse(height: usize, rows: Vec<usize>, value: Array2<f32>) -> SelectedRows {
        SelectedRows::new(height, rows, value).unwrap()
    }

    fn by_row(rows: &SelectedRows) -> BTreeMap<usize, Vec<f32>> {
        rows.iter().map(|(row, value)| (row, value.to_vec())).collect()
    }

    #[test]
    fn dense_average_ignores_arrival_order() {
        let mut inputs = vec![
            Variable::dense_vec(vec![1.0, 2.0]),
            Variable::dense_vec(vec![3.0, 4.0]),
            Variable::dense_vec(vec![5.0, 0.0]),
            Variable::dense_vec(vec![-1.0, 2.0]),
        ];
        let expected = Variable::dense_vec(vec![2.0, 2.0]);

        let mut rng = rand::rng();
        for _ in 0..10 {
            inputs.shuffle(&mut rng);
            assert_eq!(merge_vars("w", &inputs, false, 1).unwrap(), expected);
        }
    }

    #[test]
    fn dense_merge_add_sums() {
        let inputs = [
            Variable::dense_vec(vec![1.0, 2.0]),
            Variable::dense_vec(vec![3.0, 4.0]),
        ];

        let merged = merge_vars("w", &inputs, true, 1).unwrap();
        assert_eq!(merged, Variable::dense_vec(vec![4.0, 6.0]));
    }

    #[test]
    fn dense_merge_rejects_shape_mismatch() {
        let inputs = [
            Variable::dense_vec(vec![1.0, 2.0]),
            Variable::dense_vec(vec![3.0]),
        ];

        assert!(matches!(
            merge_vars("w", &inputs, true, 1),
            Err(CommErr::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn sparse_merge_is_union_with_per_row_sums() {
        let a = sparse(10, vec![1, 4], array![[1.0, 1.0], [4.0, 4.0]]);
        let b = sparse(10, vec![4, 7, 1], array![[0.5, 0.5], [7.0, 7.0], [2.0, 2.0]]);
        let c = sparse(10, vec![9], array![[9.0, 9.0]]);

        for buckets in [1, 2, 3, 2000] {
            let merged = merge_sparse("emb", &[&a, &b, &c], buckets).unwrap();
            let rows = by_row(&merged);

            assert_eq!(merged.len(), 4, "buckets = {buckets}");
            assert_eq!(merged.height(), 10);
            assert_eq!(rows[&1], [3.0, 3.0]);
            assert_eq!(rows[&4], [4.5, 4.5]);
            assert_eq!(rows[&7], [7.0, 7.0]);
            assert_eq!(rows[&9], [9.0, 9.0]);
        }
    }

    #[test]
    fn sparse_merge_sums_duplicates_inside_one_snapshot() {
        let a = sparse(5, vec![2, 2], array![[1.0], [2.0]]);

        let merged = merge_sparse("emb", &[&a], 4).unwrap();
        assert_eq!(merged.rows(), [2]);
        assert_eq!(merged.value(), &array![[3.0]]);
    }

    #[test]
    fn sparse_rows_are_summed_even_without_merge_add() {
        let a = sparse(5, vec![3, 0], array![[4.0], [1.0]]);
        let b = sparse(5, vec![3], array![[2.0]]);

        let merged = merge_vars(
            "emb",
            &[Variable::Sparse(a), Variable::Sparse(b)],
            false,
            4,
        )
        .unwrap();
        let rows = by_row(merged.as_sparse("emb").unwrap());

        assert_eq!(rows[&3], [6.0]);
        assert_eq!(rows[&0], [1.0]);
    }

    #[test]
    fn merging_mixed_kinds_fails() {
        let inputs = [
            Variable::dense_vec(vec![1.0]),
            Variable::Sparse(SelectedRows::empty(1, 1)),
        ];

        assert!(merge_vars("w", &inputs, true, 1).is_err());
        assert!(merge_vars("w", &[], true, 1).is_err());
    }

    #[test]
    fn dense_delta_advances_old() {
        let training = array![[3.0], [5.0]];
        let mut old = array![[1.0], [1.0]];

        let delta = advance_dense("w", &training, &mut old, 2).unwrap();

        assert_eq!(delta, array![[1.0], [2.0]]);
        assert_eq!(old, array![[2.0], [3.0]]);
    }

    #[test]
    fn reconcile_applies_remote_drift() {
        let mut training = array![[3.0]];
        let mut old = array![[2.0]];
        let server = array![[10.0]];

        reconcile_dense("w", &mut training, &mut old, &server).unwrap();

        assert_eq!(training, array![[11.0]]);
        assert_eq!(old, server);
    }

    #[test]
    fn row_delta_and_reconcile() {
        let mut training = array![4.0, 4.0];
        let mut old = array![2.0, 0.0];

        let delta = advance_row(training.view(), old.view_mut(), 2);
        assert_eq!(delta, array![1.0, 2.0]);
        assert_eq!(old, array![3.0, 2.0]);

        let server = array![5.0, 5.0];
        reconcile_row(training.view_mut(), old.view_mut(), server.view());
        assert_eq!(training, array![6.0, 7.0]);
        assert_eq!(old, server);
    }
}
