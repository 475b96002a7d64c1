use std::collections::{BTreeMap, btree_map};

use crate::{
    config::VarSpec,
    error::{CommErr, Result},
};

/// The destination of one variable: how it's split and where every split goes.
///
/// Built once at initialization and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcContext {
    var_name: String,
    split_names: Vec<String>,
    endpoints: Vec<String>,
    sections: Vec<usize>,
    boundaries: Vec<usize>,
    trainer_id: usize,
    merge_add: bool,
    is_sparse: bool,
}

impl RpcContext {
    /// Creates a new `RpcContext` out of its configuration entry.
    ///
    /// # Arguments
    /// * `spec` - The variable's configuration entry.
    /// * `default_merge_add` - The merge-add flag used when `spec` leaves it unset.
    ///
    /// # Returns
    /// A `Config` error if the entry is inconsistent.
    pub fn from_spec(spec: &VarSpec, default_merge_add: bool) -> Result<Self> {
        let invalid = |detail: &str| CommErr::Config(format!("variable {}: {detail}", spec.name));

        if spec.name.is_empty() {
            return Err(CommErr::Config(String::from("variable with an empty name")));
        }

        if spec.split_names.is_empty() {
            return Err(invalid("no splits"));
        }

        if spec.split_names.len() != spec.endpoints.len() {
            return Err(invalid(&format!(
                "{} splits for {} endpoints",
                spec.split_names.len(),
                spec.endpoints.len()
            )));
        }

        if !spec.sections.is_empty() && spec.sections.len() != spec.split_names.len() {
            return Err(invalid(&format!(
                "{} sections for {} splits",
                spec.sections.len(),
                spec.split_names.len()
            )));
        }

        if spec.sections.is_empty() && spec.split_names.len() > 1 {
            return Err(invalid("multiple splits need row sections"));
        }

        if spec.sections.contains(&0) {
            return Err(invalid("empty row section"));
        }

        Ok(Self {
            var_name: spec.name.clone(),
            split_names: spec.split_names.clone(),
            endpoints: spec.endpoints.clone(),
            boundaries: to_boundaries(&spec.sections),
            sections: spec.sections.clone(),
            trainer_id: spec.trainer_id,
            merge_add: spec.merge_add.unwrap_or(default_merge_add),
            is_sparse: spec.is_sparse,
        })
    }

    /// Returns a copy of this context with `suffix` appended to the variable
    /// name and to every split name.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            var_name: format!("{}{suffix}", self.var_name),
            split_names: self
                .split_names
                .iter()
                .map(|split| format!("{split}{suffix}"))
                .collect(),
            ..self.clone()
        }
    }

    pub fn var_name(&self) -> &str {
        &self.var_name
    }

    pub fn split_names(&self) -> &[String] {
        &self.split_names
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Rows per split, empty for unsectioned single split variables.
    pub fn sections(&self) -> &[usize] {
        &self.sections
    }

    /// Absolute row boundaries, split `k` covers `boundaries[k]..boundaries[k + 1]`.
    pub fn boundaries(&self) -> &[usize] {
        &self.boundaries
    }

    pub fn trainer_id(&self) -> usize {
        self.trainer_id
    }

    pub fn merge_add(&self) -> bool {
        self.merge_add
    }

    pub fn is_sparse(&self) -> bool {
        self.is_sparse
    }

    pub fn splits(&self) -> usize {
        self.split_names.len()
    }

    /// The first absolute row held by `split`.
    pub fn split_start(&self, split: usize) -> usize {
        self.boundaries.get(split).copied().unwrap_or(0)
    }

    /// Locates the split holding the absolute row `row`.
    ///
    /// # Returns
    /// The split index and the row's offset inside that split, or a `RowOutOfRange`
    /// error if no split covers it. Unsectioned variables map every row to split 0.
    pub fn locate(&self, row: usize) -> Result<(usize, usize)> {
        if self.boundaries.is_empty() {
            return Ok((0, row));
        }

        let split = section_index(&self.boundaries, row).ok_or_else(|| CommErr::RowOutOfRange {
            name: self.var_name.clone(),
            row,
            height: self.boundaries.last().copied().unwrap_or(0),
        })?;

        Ok((split, row - self.boundaries[split]))
    }
}

/// Turns per-split row counts into absolute row boundaries.
///
/// `[100, 100]` becomes `[0, 100, 200]`, an empty input stays empty.
pub fn to_boundaries(sections: &[usize]) -> Vec<usize> {
    if sections.is_empty() {
        return Vec::new();
    }

    let mut boundaries = Vec::with_capacity(sections.len() + 1);
    boundaries.push(0);

    let mut acc = 0;
    for section in sections {
        acc += section;
        boundaries.push(acc);
    }

    boundaries
}

/// Finds the unique `k` with `boundaries[k] <= row < boundaries[k + 1]`.
///
/// `boundaries` must be monotonically increasing.
pub fn section_index(boundaries: &[usize], row: usize) -> Option<usize> {
    let end = *boundaries.last()?;
    if row >= end {
        return None;
    }

    Some(boundaries.partition_point(|&b| b <= row) - 1)
}

/// The destination registry, one context per communicated variable.
///
/// Iteration follows variable name order, which is also what the async strategy
/// uses to pick the variable that drives the send counter.
#[derive(Debug, Clone, Default)]
pub struct RpcContextMap {
    contexts: BTreeMap<String, RpcContext>,
}

impl RpcContextMap {
    /// Builds the registry out of the variables' configuration entries.
    ///
    /// # Returns
    /// A `Config` error for inconsistent or duplicated entries.
    pub fn build(specs: &[VarSpec], default_merge_add: bool) -> Result<Self> {
        let mut contexts = BTreeMap::new();

        for spec in specs {
            let ctx = RpcContext::from_spec(spec, default_merge_add)?;
            if contexts.insert(spec.name.clone(), ctx).is_some() {
                return Err(CommErr::Config(format!("duplicated variable {}", spec.name)));
            }
        }

        Ok(Self { contexts })
    }

    /// Registers `ctx` under `name`, which may differ from the context's own
    /// variable name.
    pub(crate) fn insert(&mut self, name: &str, ctx: RpcContext) {
        self.contexts.insert(name.to_string(), ctx);
    }

    pub fn get(&self, name: &str) -> Result<&RpcContext> {
        self.contexts
            .get(name)
            .ok_or_else(|| CommErr::MissingVariable(name.to_string()))
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, RpcContext> {
        self.contexts.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.contexts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, splits: usize, sections: Vec<usize>) -> VarSpec {
        VarSpec {
            name: name.to_string(),
            split_names: (0..splits).map(|i| format!("{name}.block{i}")).collect(),
            endpoints: (0..splits).map(|i| format!("127.0.0.1:{}", 6000 + i)).collect(),
            sections,
            trainer_id: 0,
            merge_add: None,
            is_sparse: false,
        }
    }

    #[test]
    fn boundaries_are_prefix_sums() {
        assert_eq!(to_boundaries(&[100, 100]), [0, 100, 200]);
        assert_eq!(to_boundaries(&[3, 1, 2]), [0, 3, 4, 6]);
        assert!(to_boundaries(&[]).is_empty());
    }

    #[test]
    fn locate_translates_rows_including_exact_boundaries() {
        let ctx = RpcContext::from_spec(&spec("emb", 2, vec![100, 100]), false).unwrap();

        assert_eq!(ctx.locate(0).unwrap(), (0, 0));
        assert_eq!(ctx.locate(5).unwrap(), (0, 5));
        assert_eq!(ctx.locate(99).unwrap(), (0, 99));
        assert_eq!(ctx.locate(100).unwrap(), (1, 0));
        assert_eq!(ctx.locate(150).unwrap(), (1, 50));
        assert_eq!(ctx.locate(199).unwrap(), (1, 99));
        assert!(matches!(
            ctx.locate(200),
            Err(CommErr::RowOutOfRange { row: 200, height: 200, .. })
        ));
    }

    #[test]
    fn unsectioned_variables_have_a_single_split() {
        let ctx = RpcContext::from_spec(&spec("w", 1, vec![]), true).unwrap();

        assert_eq!(ctx.locate(12345).unwrap(), (0, 12345));
        assert!(ctx.merge_add());
    }

    #[test]
    fn rejects_inconsistent_entries() {
        let mut bad = spec("w", 2, vec![10, 10]);
        bad.endpoints.pop();
        assert!(RpcContext::from_spec(&bad, false).is_err());

        assert!(RpcContext::from_spec(&spec("w", 2, vec![]), false).is_err());
        assert!(RpcContext::from_spec(&spec("w", 2, vec![10]), false).is_err());
        assert!(RpcContext::from_spec(&spec("w", 2, vec![10, 0]), false).is_err());
        assert!(RpcContext::from_spec(&spec("w", 0, vec![]), false).is_err());
    }

    #[test]
    fn registry_rejects_duplicates_and_sorts_by_name() {
        let dup = [spec("w", 1, vec![]), spec("w", 1, vec![])];
        assert!(matches!(RpcContextMap::build(&dup, false), Err(CommErr::Config(_))));

        let map = RpcContextMap::build(&[spec("b", 1, vec![]), spec("a", 1, vec![])], false).unwrap();
        assert_eq!(map.names().collect::<Vec<_>>(), ["a", "b"]);
        assert!(matches!(map.get("c"), Err(CommErr::MissingVariable(_))));
    }

    #[test]
    fn suffix_renames_variable_and_splits() {
        let ctx = RpcContext::from_spec(&spec("emb", 2, vec![5, 5]), false).unwrap();
        let delta = ctx.with_suffix(".delta");

        assert_eq!(delta.var_name(), "emb.delta");
        assert_eq!(delta.split_names(), ["emb.block0.delta", "emb.block1.delta"]);
        assert_eq!(delta.boundaries(), ctx.boundaries());
    }
}
