use futures::{executor, future};
use log::trace;
use ndarray::{Axis, concatenate, s};

use super::Transport;
use crate::{
    context::RpcContext,
    error::{CommErr, Result},
    variable::{SelectedRows, Variable},
};

/// Cuts `value` into one payload per split of `ctx`.
///
/// Dense values are cut row-wise by the context's sections. Sparse values are
/// partitioned by the absolute row boundaries, every row id is rewritten as an
/// offset inside its split and every part takes its section as height.
///
/// # Returns
/// A `ShapeMismatch` if `value` doesn't have as many rows as the sections add
/// up to, or a `RowOutOfRange` for sparse rows outside every split.
pub fn split_var(ctx: &RpcContext, value: &Variable) -> Result<Vec<Variable>> {
    let name = ctx.var_name();

    if ctx.sections().is_empty() {
        return Ok(vec![value.clone()]);
    }

    let height = ctx.split_start(ctx.splits());

    match value {
        Variable::Dense(dense) => {
            if dense.nrows() != height {
                return Err(CommErr::shape(
                    name,
                    format!("{} rows for sections adding up to {height}", dense.nrows()),
                ));
            }

            let parts = ctx
                .boundaries()
                .windows(2)
                .map(|w| Variable::Dense(dense.slice(s![w[0]..w[1], ..]).to_owned()))
                .collect();

            Ok(parts)
        }
        Variable::Sparse(sparse) => {
            if sparse.height() != height {
                return Err(CommErr::shape(
                    name,
                    format!("height {} for sections adding up to {height}", sparse.height()),
                ));
            }

            let mut rows = vec![Vec::new(); ctx.splits()];
            let mut positions = vec![Vec::new(); ctx.splits()];

            for (pos, &row) in sparse.rows().iter().enumerate() {
                let (split, local) = ctx.locate(row)?;
                rows[split].push(local);
                positions[split].push(pos);
            }

            rows.into_iter()
                .zip(positions)
                .zip(ctx.sections())
                .map(|((rows, positions), &section)| {
                    let value = sparse.value().select(Axis(0), &positions);
                    SelectedRows::new(section, rows, value).map(Variable::Sparse)
                })
                .collect()
        }
        Variable::Ids(_) => Err(CommErr::shape(name, "index tensors are never transmitted")),
    }
}

/// Joins the per-split parts pulled for `ctx` back into a single variable.
///
/// The inverse of `split_var`: dense parts are concatenated row-wise and sparse
/// row offsets are translated back into absolute row ids.
pub fn assemble_var(ctx: &RpcContext, mut parts: Vec<Variable>) -> Result<Variable> {
    let name = ctx.var_name();

    if parts.len() != ctx.splits() {
        return Err(CommErr::shape(
            name,
            format!("{} parts for {} splits", parts.len(), ctx.splits()),
        ));
    }

    if parts.len() == 1 && ctx.sections().is_empty() {
        return parts
            .pop()
            .ok_or_else(|| CommErr::MissingVariable(name.to_string()));
    }

    match parts.first() {
        Some(Variable::Sparse(_)) => {
            let mut rows = Vec::new();
            let mut views = Vec::with_capacity(parts.len());

            for (split, part) in parts.iter().enumerate() {
                let part = part.as_sparse(name)?;
                let start = ctx.split_start(split);

                rows.extend(part.rows().iter().map(|row| row + start));
                views.push(part.value().view());
            }

            let value = concatenate(Axis(0), &views)?;
            SelectedRows::new(ctx.split_start(ctx.splits()), rows, value).map(Variable::Sparse)
        }
        _ => {
            let views = parts
                .iter()
                .map(|part| part.as_dense(name).map(|dense| dense.view()))
                .collect::<Result<Vec<_>>>()?;

            Ok(Variable::Dense(concatenate(Axis(0), &views)?))
        }
    }
}

/// Pushes every split of `value` to its endpoint, then waits for all of them.
pub fn send_var<T: Transport>(transport: &T, ctx: &RpcContext, value: &Variable) -> Result<()> {
    let parts = split_var(ctx, value)?;

    let pushes = parts.into_iter().enumerate().map(|(split, part)| {
        trace!(split = split; "pushing {}", ctx.split_names()[split]);
        transport.push(
            ctx.trainer_id(),
            &ctx.endpoints()[split],
            &ctx.split_names()[split],
            part,
        )
    });

    executor::block_on(future::try_join_all(pushes))?;
    Ok(())
}

/// Pulls every split of `ctx` and assembles them.
pub fn recv_var<T: Transport>(transport: &T, ctx: &RpcContext) -> Result<Variable> {
    let pulls = ctx
        .endpoints()
        .iter()
        .zip(ctx.split_names())
        .map(|(endpoint, split)| transport.pull(ctx.trainer_id(), endpoint, split));

    let parts = executor::block_on(future::try_join_all(pulls))?;
    assemble_var(ctx, parts)
}

/// Pushes `payload` as the single split `split` of `ctx`.
pub fn push_split<T: Transport>(
    transport: &T,
    ctx: &RpcContext,
    split: usize,
    payload: Variable,
) -> Result<()> {
    let (endpoint, name) = split_target(ctx, split)?;
    executor::block_on(transport.push(ctx.trainer_id(), endpoint, name, payload))
}

/// Pulls the single split `split` of `ctx`, untranslated.
pub fn pull_split<T: Transport>(transport: &T, ctx: &RpcContext, split: usize) -> Result<Variable> {
    let (endpoint, name) = split_target(ctx, split)?;
    executor::block_on(transport.pull(ctx.trainer_id(), endpoint, name))
}

fn split_target(ctx: &RpcContext, split: usize) -> Result<(&str, &str)> {
    match (ctx.endpoints().get(split), ctx.split_names().get(split)) {
        (Some(endpoint), Some(name)) => Ok((endpoint.as_str(), name.as_str())),
        _ => Err(CommErr::MissingVariable(format!(
            "{} split {split}",
            ctx.var_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::{config::VarSpec, transport::InMemoryTransport};

    fn ctx(name: &str, sections: Vec<usize>) -> RpcContext {
        let splits = sections.len().max(1);
        let spec = VarSpec {
            name: name.to_string(),
            split_names: (0..splits).map(|i| format!("{name}.block{i}")).collect(),
            endpoints: (0..splits).map(|i| format!("ps{i}")).collect(),
            sections,
            trainer_id: 0,
            merge_add: None,
            is_sparse: false,
        };

        RpcContext::from_spec(&spec, false).unwrap()
    }

    #[test]
    fn dense_values_are_cut_by_sections() {
        let ctx = ctx("w", vec![1, 2]);
        let value = Variable::Dense(array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]);

        let parts = split_var(&ctx, &value).unwrap();

        assert_eq!(parts[0], Variable::Dense(array![[1.0, 1.0]]));
        assert_eq!(parts[1], Variable::Dense(array![[2.0, 2.0], [3.0, 3.0]]));
        assert_eq!(assemble_var(&ctx, parts).unwrap(), value);
    }

    #[test]
    fn sparse_rows_move_to_split_local_offsets() {
        let ctx = ctx("emb", vec![100, 100]);
        let value = SelectedRows::new(200, vec![5, 150, 100], array![[5.0], [150.0], [100.0]]).unwrap();

        let parts = split_var(&ctx, &Variable::Sparse(value)).unwrap();
        let first = parts[0].as_sparse("emb").unwrap();
        let second = parts[1].as_sparse("emb").unwrap();

        assert_eq!(first.rows(), [5]);
        assert_eq!(first.height(), 100);
        assert_eq!(second.rows(), [50, 0]);
        assert_eq!(second.value(), &array![[150.0], [100.0]]);

        let joined = assemble_var(&ctx, parts).unwrap();
        let joined = joined.as_sparse("emb").unwrap();
        assert_eq!(joined.rows(), [5, 150, 100]);
        assert_eq!(joined.height(), 200);
    }

    #[test]
    fn rejects_values_not_matching_sections() {
        let ctx = ctx("w", vec![1, 2]);
        let value = Variable::dense_vec(vec![1.0, 2.0]);

        assert!(matches!(split_var(&ctx, &value), Err(CommErr::ShapeMismatch { .. })));
    }

    #[test]
    fn send_and_recv_go_through_every_endpoint() {
        let transport = InMemoryTransport::new();
        let ctx = ctx("w", vec![1, 1]);

        send_var(&transport, &ctx, &Variable::dense_vec(vec![1.0, 2.0])).unwrap();

        let pushes = transport.pushes();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0].endpoint, "ps0");
        assert_eq!(pushes[1].name, "w.block1");
        assert_eq!(pushes[1].payload, Variable::dense_vec(vec![2.0]));

        transport.seed("ps0", "w.block0", Variable::dense_vec(vec![7.0]));
        transport.seed("ps1", "w.block1", Variable::dense_vec(vec![8.0]));
        assert_eq!(recv_var(&transport, &ctx).unwrap(), Variable::dense_vec(vec![7.0, 8.0]));
    }

    #[test]
    fn recv_surfaces_transport_errors() {
        let transport = InMemoryTransport::new();
        let ctx = ctx("w", vec![]);

        assert!(matches!(recv_var(&transport, &ctx), Err(CommErr::Transport { .. })));
    }
}
