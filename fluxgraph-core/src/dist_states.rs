//! Descriptors of how a tensor is laid out across a device group.
//!
//! A [`DistributedStates`] maps each *state dimension* to a degree: `-2`
//! ([`PARTIAL`]) means every device holds an addend of the full value, `-1`
//! ([`DUPLICATE`]) means replicas, and `d >= 0` means the tensor is split
//! evenly along axis `d`. The `order` lists state dimensions from outermost to
//! innermost; a device index is decomposed against it like a mixed-radix
//! number, innermost dimension varying fastest.

use std::collections::{BTreeMap, HashMap};

use crate::{bail_not_implemented, bail_value, Result};

pub const PARTIAL: i32 = -2;
pub const DUPLICATE: i32 = -1;

/// An axis-aligned box inside a tensor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    pub offset: Vec<usize>,
    pub size: Vec<usize>,
}

impl Region {
    pub fn full(shape: &[usize]) -> Self {
        Self {
            offset: vec![0; shape.len()],
            size: shape.to_vec(),
        }
    }

    pub fn numel(&self) -> usize {
        self.size.iter().product()
    }

    pub fn intersect(&self, other: &Region) -> Option<Region> {
        if self.offset.len() != other.offset.len() {
            return None;
        }
        let mut offset = Vec::with_capacity(self.offset.len());
        let mut size = Vec::with_capacity(self.offset.len());
        for d in 0..self.offset.len() {
            let lo = self.offset[d].max(other.offset[d]);
            let hi = (self.offset[d] + self.size[d]).min(other.offset[d] + other.size[d]);
            if hi <= lo {
                return None;
            }
            offset.push(lo);
            size.push(hi - lo);
        }
        Some(Region { offset, size })
    }

    /// `self.offset - origin`, for expressing a box in another box's frame.
    pub fn offset_from(&self, origin: &[usize]) -> Vec<usize> {
        self.offset.iter().zip(origin).map(|(o, b)| o - b).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DistributedStates {
    device_num: usize,
    states: BTreeMap<i32, usize>,
    order: Vec<i32>,
    zero: bool,
}

impl Default for DistributedStates {
    fn default() -> Self {
        Self::trivial()
    }
}

impl DistributedStates {
    /// Build and normalize a descriptor. Degree-1 entries are dropped; an empty
    /// `order` defaults to ascending state dimensions.
    pub fn new(
        device_num: usize,
        states: impl IntoIterator<Item = (i32, usize)>,
        order: Vec<i32>,
        zero: bool,
    ) -> Result<Self> {
        let mut map = BTreeMap::new();
        for (dim, n) in states {
            if dim < PARTIAL {
                bail_value!("invalid state dimension {dim}");
            }
            if n == 0 {
                bail_value!("state dimension {dim} has degree 0");
            }
            if n > 1 && map.insert(dim, n).is_some() {
                bail_value!("state dimension {dim} given twice");
            }
        }
        let product: usize = map.values().product();
        if product != device_num {
            bail_value!("states {map:?} describe {product} devices, expected {device_num}");
        }
        let order = if order.is_empty() {
            map.keys().copied().collect()
        } else {
            let order: Vec<i32> = order.into_iter().filter(|d| map.contains_key(d)).collect();
            let mut sorted = order.clone();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() != order.len() || sorted.len() != map.len() {
                bail_value!("order {order:?} is not a permutation of state dims {map:?}");
            }
            order
        };
        Ok(Self {
            device_num,
            states: map,
            order,
            zero,
        })
    }

    /// One device, no partitioning.
    pub fn trivial() -> Self {
        Self {
            device_num: 1,
            states: BTreeMap::new(),
            order: Vec::new(),
            zero: false,
        }
    }

    pub fn duplicate(n: usize) -> Self {
        Self::single_state(n, DUPLICATE)
    }

    pub fn split(n: usize, dim: usize) -> Self {
        Self::single_state(n, dim as i32)
    }

    pub fn partial(n: usize) -> Self {
        Self::single_state(n, PARTIAL)
    }

    fn single_state(n: usize, dim: i32) -> Self {
        let mut states = BTreeMap::new();
        let mut order = Vec::new();
        if n > 1 {
            states.insert(dim, n);
            order.push(dim);
        }
        Self {
            device_num: n.max(1),
            states,
            order,
            zero: false,
        }
    }

    pub fn with_zero(mut self, zero: bool) -> Self {
        self.zero = zero;
        self
    }

    pub fn device_num(&self) -> usize {
        self.device_num
    }

    pub fn states(&self) -> &BTreeMap<i32, usize> {
        &self.states
    }

    pub fn order(&self) -> &[i32] {
        &self.order
    }

    pub fn zero(&self) -> bool {
        self.zero
    }

    /// Degree along `dim`, 1 when absent.
    pub fn get_dim(&self, dim: i32) -> usize {
        self.states.get(&dim).copied().unwrap_or(1)
    }

    pub fn is_trivial(&self) -> bool {
        self.states.is_empty()
    }

    pub fn is_pure_duplicate(&self) -> bool {
        self.states.keys().all(|d| *d == DUPLICATE)
    }

    pub fn has_partial(&self) -> bool {
        self.states.contains_key(&PARTIAL)
    }

    pub fn is_split(&self, axis: usize) -> bool {
        self.get_dim(axis as i32) > 1
    }

    pub fn split_dims(&self) -> Vec<usize> {
        self.states
            .keys()
            .filter(|d| **d >= 0)
            .map(|d| *d as usize)
            .collect()
    }

    /// Same layout, same equality, ignoring the ZeRO flag.
    pub fn same_layout(&self, other: &DistributedStates) -> bool {
        self.device_num == other.device_num
            && self.states == other.states
            && self.order == other.order
    }

    /// Coordinate of `device_index` along every state dimension.
    pub fn state_index(&self, device_index: usize) -> BTreeMap<i32, usize> {
        let mut idx = device_index;
        let mut out = BTreeMap::new();
        for dim in self.order.iter().rev() {
            let n = self.states[dim];
            out.insert(*dim, idx % n);
            idx /= n;
        }
        out
    }

    pub fn partial_index(&self, device_index: usize) -> usize {
        self.state_index(device_index)
            .get(&PARTIAL)
            .copied()
            .unwrap_or(0)
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if let Some(d) = self.split_dims().into_iter().find(|d| *d >= rank) {
            bail_value!("states {self:?} split dimension {d} of a rank-{rank} tensor");
        }
        Ok(())
    }

    pub fn local_shape(&self, global: &[usize]) -> Result<Vec<usize>> {
        self.check_rank(global.len())?;
        let mut local = global.to_vec();
        for (d, g) in local.iter_mut().enumerate() {
            let n = self.get_dim(d as i32);
            if *g % n != 0 {
                bail_value!("dimension {d} of size {g} cannot be split {n} ways");
            }
            *g /= n;
        }
        Ok(local)
    }

    /// The box of the global tensor held by the device at `device_index`.
    pub fn local_region(&self, global: &[usize], device_index: usize) -> Result<Region> {
        let size = self.local_shape(global)?;
        let idx = self.state_index(device_index);
        let offset = size
            .iter()
            .enumerate()
            .map(|(d, s)| idx.get(&(d as i32)).copied().unwrap_or(0) * s)
            .collect();
        Ok(Region { offset, size })
    }

    /// Relabel state dimensions through `map` (unmapped dims keep their key).
    /// Dimensions landing on the same key merge, which requires them to be
    /// adjacent in the order.
    pub fn remap(&self, map: &HashMap<i32, i32>) -> Result<Self> {
        let target = |d: &i32| map.get(d).copied().unwrap_or(*d);
        let mut order: Vec<i32> = Vec::with_capacity(self.order.len());
        let mut states: BTreeMap<i32, usize> = BTreeMap::new();
        for d in &self.order {
            let t = target(d);
            let n = self.states[d];
            if order.last() == Some(&t) {
                *states.entry(t).or_insert(1) *= n;
                continue;
            }
            if states.contains_key(&t) {
                bail_value!(
                    "cannot merge non-adjacent state dims onto {t} in order {:?}",
                    self.order
                );
            }
            order.push(t);
            states.insert(t, n);
        }
        Ok(Self {
            device_num: self.device_num,
            states,
            order,
            zero: self.zero,
        })
    }

    /// The layout after the partial addends have been reduced: partial
    /// coordinates become replicas.
    pub fn reduce_partial(&self) -> Result<Self> {
        self.remap(&HashMap::from([(PARTIAL, DUPLICATE)]))
    }
}

/// Per-pipeline states of one strategy. `hetero_dim` names the state dimension
/// the pipelines jointly extend when their layouts are merged into one.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DistributedStatesUnion {
    states: Vec<DistributedStates>,
    hetero_dim: Option<i32>,
}

impl DistributedStatesUnion {
    pub fn new(states: Vec<DistributedStates>, hetero_dim: Option<i32>) -> Result<Self> {
        if states.is_empty() {
            bail_value!("a distributed states union needs at least one entry");
        }
        if states.len() > 1 && hetero_dim.is_none() {
            bail_value!("{} pipelines given without a hetero dimension", states.len());
        }
        Ok(Self { states, hetero_dim })
    }

    pub fn single(ds: DistributedStates) -> Self {
        Self {
            states: vec![ds],
            hetero_dim: None,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, hetero_id: usize) -> Option<&DistributedStates> {
        self.states.get(hetero_id)
    }

    pub fn hetero_dim(&self) -> Option<i32> {
        self.hetero_dim
    }

    /// One descriptor over the concatenation of all pipeline device groups.
    /// The pipeline index becomes the outermost coordinate of `hetero_dim`.
    pub fn merged(&self) -> Result<DistributedStates> {
        let first = match self.states.as_slice() {
            [] => bail_value!("empty distributed states union"),
            [only] => return Ok(only.clone()),
            [first, ..] => first,
        };
        if self.states.iter().any(|ds| !ds.same_layout(first)) {
            bail_not_implemented!("merging heterogeneous per-pipeline layouts {:?}", self.states);
        }
        let Some(dim) = self.hetero_dim else {
            bail_value!("cannot merge pipelines without a hetero dimension");
        };
        let k = self.states.len();
        let mut states = first.states.clone();
        *states.entry(dim).or_insert(1) *= k;
        let mut order = first.order.clone();
        match order.iter().position(|d| *d == dim) {
            None => order.insert(0, dim),
            Some(0) => {}
            Some(_) => bail_value!(
                "hetero dimension {dim} must be outermost in order {:?}",
                first.order
            ),
        }
        Ok(DistributedStates {
            device_num: first.device_num * k,
            states,
            order,
            zero: first.zero,
        })
    }
}

/// Distributed states unions indexed by strategy id.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DistributedStatesHierarchy(Vec<DistributedStatesUnion>);

impl DistributedStatesHierarchy {
    pub fn new(unions: Vec<DistributedStatesUnion>) -> Self {
        Self(unions)
    }

    pub fn uniform(ds: DistributedStates, num_strategies: usize) -> Self {
        Self(vec![DistributedStatesUnion::single(ds); num_strategies])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, strategy_id: usize) -> Option<&DistributedStatesUnion> {
        self.0.get(strategy_id)
    }

    pub fn push(&mut self, union: DistributedStatesUnion) {
        self.0.push(union)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_index_decomposes_against_order() {
        let ds = DistributedStates::new(4, [(0, 2), (DUPLICATE, 2)], vec![0, DUPLICATE], false)
            .unwrap();
        assert_eq!(ds.state_index(1), BTreeMap::from([(0, 0), (DUPLICATE, 1)]));
        assert_eq!(ds.state_index(2), BTreeMap::from([(0, 1), (DUPLICATE, 0)]));

        let r = ds.local_region(&[8, 3], 3).unwrap();
        assert_eq!(r.offset, vec![4, 0]);
        assert_eq!(r.size, vec![4, 3]);
    }

    #[test]
    fn construction_is_validated() {
        assert!(DistributedStates::new(4, [(0, 2)], vec![], false).is_err());
        assert!(DistributedStates::new(2, [(0, 2)], vec![1], false).is_err());
        let ds = DistributedStates::new(2, [(0, 2), (1, 1)], vec![1, 0], false).unwrap();
        assert_eq!(ds.order(), &[0]);
        assert!(DistributedStates::split(2, 0).local_shape(&[3]).is_err());
        assert!(DistributedStates::split(2, 2).local_shape(&[4, 4]).is_err());
    }

    #[test]
    fn remap_merges_adjacent_dims_only() {
        let ds = DistributedStates::new(4, [(0, 2), (1, 2)], vec![0, 1], false).unwrap();
        let merged = ds
            .remap(&HashMap::from([(0, PARTIAL), (1, PARTIAL)]))
            .unwrap();
        assert_eq!(merged, DistributedStates::partial(4));

        let ds = DistributedStates::new(8, [(0, 2), (DUPLICATE, 2), (1, 2)], vec![0, DUPLICATE, 1], false)
            .unwrap();
        assert!(ds.remap(&HashMap::from([(0, PARTIAL), (1, PARTIAL)])).is_err());
        assert_eq!(
            DistributedStates::partial(2).reduce_partial().unwrap(),
            DistributedStates::duplicate(2)
        );
    }

    #[test]
    fn union_merge_puts_pipelines_outermost() {
        let u = DistributedStatesUnion::new(
            vec![DistributedStates::split(2, 1), DistributedStates::split(2, 1)],
            Some(DUPLICATE),
        )
        .unwrap();
        let m = u.merged().unwrap();
        assert_eq!(m.device_num(), 4);
        assert_eq!(m.order(), &[DUPLICATE, 1]);
        assert_eq!(m.state_index(3), BTreeMap::from([(DUPLICATE, 1), (1, 1)]));
    }
}
