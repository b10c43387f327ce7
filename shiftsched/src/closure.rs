use crate::helpe::*;
use crate::bits::BitRow;
use crate::scc::undirected_components;

/// Position of an op relative to others, seen from the start of a
/// schedule.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IsFirst {
    No,
    Maybe,
    Yes,
}

/// Position of an op relative to others, seen from the end of a
/// schedule.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IsFinal {
    No,
    Maybe,
    Yes,
}

/// Selects ops by their relation to a reference op:
///
/// - `(IsFirst::Yes, a)` keeps every `b` which is before `a` in all schedules,
/// - `(IsFirst::No, a)` keeps every `b` which is after `a` in all schedules,
/// - `(IsFirst::Maybe, a)` keeps every `b != a` which can go either way.
pub type Filter = (IsFirst, OpAddress);

/// Bounds on the number of schedule steps spanned by a group of ops,
/// both ends included.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DurationBound {
    pub low:    usize,
    pub high:   usize,
}

impl DurationBound {
    /// The span is the same in every schedule.
    #[inline(always)]
    pub fn is_fixed(&self) -> bool { self.low == self.high }
}

/// One weakly connected component of the graph, with rows sized to the
/// component alone.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Component {
    // Local index -> global address, ascending.
    ops:    Vec<OpAddress>,
    // fwd[t] has bit f set iff f is before t in every schedule.
    fwd:    Vec<BitRow>,
    // bwd[t] has bit f set iff f is after t in every schedule.
    bwd:    Vec<BitRow>,
}

/// Row `dst |= row src`, without cloning.
#[inline(always)]
fn or_rows(rows: &mut [BitRow], src: usize, dst: usize) {
    debug_assert_ne!(src, dst);
    if src < dst {
        let (lo, hi) = rows.split_at_mut(dst);
        hi[0].or_assign(&lo[src]);
    } else {
        let (lo, hi) = rows.split_at_mut(src);
        lo[dst].or_assign(&hi[0]);
    }
}

/// Kahn's algorithm over `outs`, ORing each node's row into its
/// successors'. Row `t` ends up holding all nodes which reach `t`.
fn propagate(outs: &[Vec<usize>]) -> ShiftResult<Vec<BitRow>> {
    let n = outs.len();
    let mut n_pending = vec![0usize; n];
    for o in outs.iter().flatten() {
        n_pending[*o] += 1;
    }
    let mut rows = vec![BitRow::zeros(n); n];
    let mut ready: Vec<usize> = (0..n).filter(|&i| n_pending[i] == 0).collect();
    let mut n_done = 0;
    while let Some(v) = ready.pop() {
        n_done += 1;
        for &o in &outs[v] {
            or_rows(&mut rows, v, o);
            rows[o].set(v);
            n_pending[o] -= 1;
            if n_pending[o] == 0 {
                ready.push(o);
            }
        }
    }
    if n_done != n {
        return Err(ShiftError::NotSchedulable(format!(
            "only {} of {} ops in a component could be ordered", n_done, n
        )));
    }

    Ok(rows)
}

/// Inserts `from -> to` into `rows`, where `rows[t]` holds the ops
/// recorded before `t`.
fn insert_constraint(rows: &mut [BitRow], from: usize, to: usize) {
    if rows[to].get(from) {
        return;
    }
    let record = |rows: &mut [BitRow], f: usize, t: usize| {
        rows[t].set(f);
        if f != t {
            or_rows(rows, f, t);
        }
    };
    record(rows, from, to);
    for post in 0..rows.len() {
        if post != to && rows[post].get(to) && !rows[post].get(from) {
            record(rows, from, post);
        }
    }
}

impl Component {
    fn build(ops: Vec<OpAddress>, edges: &Edges, op_to_local: &[usize]) -> ShiftResult<Self> {
        let n = ops.len();
        let mut outs: Vec<Vec<usize>> = vec![vec![]; n];
        let mut ins: Vec<Vec<usize>> = vec![vec![]; n];
        for (l, op) in ops.iter().enumerate() {
            for to in &edges[op.0] {
                let t = op_to_local[to.0];
                outs[l].push(t);
                ins[t].push(l);
            }
        }
        let fwd = propagate(&outs)?;
        let bwd = propagate(&ins)?;

        Ok(Self { ops, fwd, bwd })
    }

    #[inline(always)]
    fn n(&self) -> usize { self.ops.len() }
}

/// The reachability oracle.
///
/// After construction, `constrained(a, b)` (is `a` before `b` in every
/// schedule?) is a single bit test. Storage is quadratic in the size of
/// each weakly connected component rather than in the size of the whole
/// graph: a graph made of many small independent pieces costs little.
///
/// The closure is a snapshot. If the graph's edges change, either
/// call [TransitiveClosure::update] with the new edges or build a new
/// one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitiveClosure {
    n_ops:          usize,
    edges:          Edges,
    op_to_comp:     Vec<usize>,
    op_to_local:    Vec<usize>,
    comps:          Vec<Component>,
}

impl TransitiveClosure {
    pub fn new(edges: &Edges) -> ShiftResult<Self> {
        let n_ops = edges.len();
        for to in edges.iter().flatten() {
            if to.0 >= n_ops {
                return Err(ShiftError::InvalidOp { address: *to, n_ops });
            }
        }
        let mut edges = edges.clone();
        edges.iter_mut().for_each(|e| {
            e.sort_unstable();
            e.dedup();
        });
        let adj: Vec<Vec<usize>> = edges.iter()
            .map(|outs| outs.iter().map(|o| o.0).collect())
            .collect();
        let groups = undirected_components(n_ops, &adj);

        let mut op_to_comp = vec![0; n_ops];
        let mut op_to_local = vec![0; n_ops];
        for (ci, group) in groups.iter().enumerate() {
            for (l, &op) in group.iter().enumerate() {
                op_to_comp[op] = ci;
                op_to_local[op] = l;
            }
        }
        let comps = groups.into_par_iter()
            .map(|g| Component::build(g.into_iter().map(OpAddress).collect(), &edges, &op_to_local))
            .collect::<ShiftResult<Vec<Component>>>()?;

        Ok(Self {
            n_ops,
            edges,
            op_to_comp,
            op_to_local,
            comps,
        })
    }

    pub fn from_graph(g: &Graph) -> ShiftResult<Self> {
        Self::new(&g.get_forward_edges())
    }

    #[inline(always)]
    pub fn n_ops(&self) -> usize { self.n_ops }

    #[inline(always)]
    pub fn n_components(&self) -> usize { self.comps.len() }

    /// Number of bits held by all rows, both directions.
    pub fn n_bits(&self) -> usize {
        self.comps.iter().map(|c| 2 * c.n() * c.n()).sum()
    }

    #[inline(always)]
    fn locate(&self, a: OpAddress) -> (usize, usize) {
        (self.op_to_comp[a.0], self.op_to_local[a.0])
    }

    /// `from` is before `to` in every schedule.
    #[inline(always)]
    pub fn constrained(&self, from: OpAddress, to: OpAddress) -> bool {
        let (cf, lf) = self.locate(from);
        let (ct, lt) = self.locate(to);
        cf == ct && self.comps[ct].fwd[lt].get(lf)
    }

    /// `a` and `b` are distinct and there are schedules with `a` before
    /// `b` as well as schedules with `b` before `a`.
    #[inline(always)]
    pub fn unconstrained(&self, a: OpAddress, b: OpAddress) -> bool {
        a != b && !self.constrained(a, b) && !self.constrained(b, a)
    }

    /// The mask of component `ci` after applying `filters`.
    fn mask(&self, ci: usize, filters: &[Filter]) -> BitRow {
        let comp = &self.comps[ci];
        let mut mask = BitRow::ones(comp.n());
        for &(kind, op) in filters {
            let (oc, ol) = self.locate(op);
            if oc != ci {
                if kind != IsFirst::Maybe {
                    mask.clear_all();
                }
                continue;
            }
            match kind {
                IsFirst::Yes    => mask.and_assign(&comp.fwd[ol]),
                IsFirst::No     => mask.and_assign(&comp.bwd[ol]),
                IsFirst::Maybe  => {
                    mask.and_not_assign(&comp.fwd[ol]);
                    mask.and_not_assign(&comp.bwd[ol]);
                    mask.clear(ol);
                }
            }
        }

        mask
    }

    /// Components which can hold ops passing `filters`.
    fn candidate_components(&self, filters: &[Filter]) -> Vec<usize> {
        match filters.iter().find(|(k, _)| *k != IsFirst::Maybe) {
            Some(&(_, op))  => vec![self.op_to_comp[op.0]],
            None            => (0..self.comps.len()).collect(),
        }
    }

    /// Ops passing every filter, ascending. No filters means all ops.
    pub fn get(&self, filters: &[Filter]) -> Vec<OpAddress> {
        let mut res: Vec<OpAddress> = self.candidate_components(filters)
            .into_iter()
            .flat_map(|ci| {
                let mask = self.mask(ci, filters);
                mask.iter_ones()
                    .map(|l| self.comps[ci].ops[l])
                    .collect::<Vec<_>>()
            })
            .collect();
        res.sort_unstable();

        res
    }

    /// The size of the intersection of `filters`, that is the size of
    /// `get(filters)`.
    pub fn n_intersection(&self, filters: &[Filter]) -> usize {
        self.candidate_components(filters)
            .into_iter()
            .map(|ci| self.mask(ci, filters).count_ones())
            .sum()
    }

    #[inline(always)]
    pub fn n(&self, filters: &[Filter]) -> usize {
        self.n_intersection(filters)
    }

    /// Ops passing at least one of the groups of filters.
    pub fn op_union(&self, groups: &[Vec<Filter>]) -> Vec<OpAddress> {
        groups.iter()
            .flat_map(|fs| self.get(fs))
            .sorted()
            .dedup()
            .collect()
    }

    /// `get(&[(r, id)])` is identical for all `ids`.
    pub fn same(&self, r: IsFirst, ids: &[OpAddress]) -> bool {
        match ids.split_first() {
            None                => true,
            Some((id0, rest))   => {
                let soln0 = self.get(&[(r, *id0)]);
                rest.iter().all(|id| self.get(&[(r, *id)]) == soln0)
            }
        }
    }

    pub fn get_unconstrained(&self, a: OpAddress) -> Vec<OpAddress> {
        self.get(&[(IsFirst::Maybe, a)])
    }

    pub fn get_post(&self, a: OpAddress) -> Vec<OpAddress> {
        self.get(&[(IsFirst::No, a)])
    }

    pub fn get_unconstrained_post(&self, a: OpAddress, b: OpAddress) -> Vec<OpAddress> {
        self.get(&[(IsFirst::Maybe, a), (IsFirst::No, b)])
    }

    pub fn same_unconstrained(&self, a: OpAddress, b: OpAddress) -> bool {
        self.same(IsFirst::Maybe, &[a, b])
    }

    /// Number of ops after both `a` and `b` in every schedule.
    pub fn n_post_post(&self, a: OpAddress, b: OpAddress) -> usize {
        self.n(&[(IsFirst::No, a), (IsFirst::No, b)])
    }

    /// Lowest schedule index `id` can take.
    #[inline(always)]
    pub fn earliest(&self, id: OpAddress) -> usize {
        let (c, l) = self.locate(id);
        self.comps[c].fwd[l].count_ones()
    }

    /// Highest schedule index `id` can take.
    #[inline(always)]
    pub fn latest(&self, id: OpAddress) -> usize {
        let (c, l) = self.locate(id);
        self.n_ops - self.comps[c].bwd[l].count_ones() - 1
    }

    /// No op which can go either side of `id` can be scheduled earlier
    /// than `id` can.
    pub fn as_early_as_all_unconstrained(&self, id: OpAddress) -> bool {
        let e = self.earliest(id);
        self.get_unconstrained(id)
            .into_iter()
            .all(|x| self.earliest(x) >= e)
    }

    /// For each op of `ids`, whether it is first and whether it is final
    /// among `ids`, over all schedules.
    pub fn get_extremum_statuses(&self, ids: &[OpAddress]) -> Vec<(IsFirst, IsFinal)> {
        ids.iter()
            .map(|&id0| {
                let (mut first, mut last) = (IsFirst::Yes, IsFinal::Yes);
                for &id1 in ids {
                    if id1 == id0 {
                    } else if self.constrained(id0, id1) {
                        last = IsFinal::No;
                    } else if self.constrained(id1, id0) {
                        first = IsFirst::No;
                    } else {
                        if first != IsFirst::No { first = IsFirst::Maybe; }
                        if last != IsFinal::No { last = IsFinal::Maybe; }
                    }
                }

                (first, last)
            })
            .collect()
    }

    /// Alias of [TransitiveClosure::get_extremum_statuses].
    pub fn get_relative_positions(&self, ids: &[OpAddress]) -> Vec<(IsFirst, IsFinal)> {
        self.get_extremum_statuses(ids)
    }

    /// Whether `a` is first and whether it is final among `subset`.
    pub fn get_extremum_status(&self, a: OpAddress, subset: &[OpAddress]) -> (IsFirst, IsFinal) {
        let mut first = IsFirst::Yes;
        for &b in subset.iter().filter(|&&b| b != a) {
            if !self.constrained(a, b) {
                first = IsFirst::Maybe;
            }
            if self.constrained(b, a) {
                first = IsFirst::No;
                break;
            }
        }
        let mut last = IsFinal::Yes;
        for &b in subset.iter().filter(|&&b| b != a) {
            if !self.constrained(b, a) {
                last = IsFinal::Maybe;
            }
            if self.constrained(a, b) {
                last = IsFinal::No;
                break;
            }
        }

        (first, last)
    }

    /// Bounds on the span of `ops`. Only defined when some op of `ops`
    /// is always first and some op always final; otherwise `None`.
    pub fn get_duration_bound(&self, ops: &[OpAddress]) -> Option<DurationBound> {
        let statuses = self.get_extremum_statuses(ops);
        let first = ops.iter().zip(statuses.iter()).find(|(_, s)| s.0 == IsFirst::Yes)?.0;
        let last = ops.iter().zip(statuses.iter()).find(|(_, s)| s.1 == IsFinal::Yes)?.0;
        if first == last {
            return Some(DurationBound { low: 1, high: 1 });
        }
        let between = self.n(&[(IsFirst::No, *first), (IsFirst::Yes, *last)]);
        let low = between + 2;
        let high = (self.latest(*last) + 1) - self.earliest(*first);

        Some(DurationBound { low, high })
    }

    /// For each op, those of its outs (per `edges`) which are implied
    /// by another path.
    pub fn get_redundants(&self, edges: &Edges) -> Edges {
        let mut ins: Edges = vec![vec![]; edges.len()];
        for (from, outs) in edges.iter().enumerate() {
            for to in outs {
                ins[to.0].push(OpAddress(from));
            }
        }
        edges.iter()
            .enumerate()
            .map(|(from, outs)| {
                let from = OpAddress(from);
                outs.iter()
                    .copied()
                    .filter(|&to| {
                        ins[to.0].iter().any(|&to_prime| {
                            to_prime != from && self.constrained(from, to_prime)
                        })
                    })
                    .collect()
            })
            .collect()
    }

    pub fn get_flattened_redundants(&self, edges: &Edges) -> Vec<(OpAddress, OpAddress)> {
        self.get_redundants(edges)
            .into_iter()
            .enumerate()
            .flat_map(|(from, tos)| tos.into_iter().map(move |to| (OpAddress(from), to)))
            .collect()
    }

    /// Adds `new_edges` to the closure. Edges within a component are
    /// inserted in place; an edge joining two components triggers a
    /// rebuild. On error the closure is left as it was.
    pub fn update(&mut self, new_edges: &Edges) -> ShiftResult<()> {
        if new_edges.len() != self.n_ops {
            return Err(ShiftError::InvalidArgument(format!(
                "Expected edges for {} ops, got {}", self.n_ops, new_edges.len()
            )));
        }
        for to in new_edges.iter().flatten() {
            if to.0 >= self.n_ops {
                return Err(ShiftError::InvalidOp { address: *to, n_ops: self.n_ops });
            }
        }
        let mut staged = self.clone();
        staged.insert_edges(new_edges)?;
        *self = staged;

        Ok(())
    }

    fn insert_edges(&mut self, new_edges: &Edges) -> ShiftResult<()> {
        let mut crosses = false;
        for (from, outs) in new_edges.iter().enumerate() {
            for &to in outs {
                crosses |= self.op_to_comp[from] != self.op_to_comp[to.0];
                crate::op::insert_sorted(&mut self.edges[from], to);
            }
        }
        if crosses {
            *self = Self::new(&self.edges)?;
            return Ok(());
        }
        for (from, outs) in new_edges.iter().enumerate() {
            for &to in outs {
                let (c, lf) = self.locate(OpAddress(from));
                let lt = self.op_to_local[to.0];
                let comp = &mut self.comps[c];
                insert_constraint(&mut comp.fwd, lf, lt);
                insert_constraint(&mut comp.bwd, lt, lf);
                if comp.fwd[lf].get(lf) || from == to.0 {
                    return Err(ShiftError::NotSchedulable(format!(
                        "constraint {} -> {} closes a cycle", from, to
                    )));
                }
            }
        }

        Ok(())
    }

    /// Rebuilds from scratch with the stored edges.
    pub fn bidirectional_propagate(&mut self) -> ShiftResult<()> {
        *self = Self::new(&self.edges)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(n: usize, raw: &[(usize, usize)]) -> Edges {
        let mut e = vec![vec![]; n];
        for &(a, b) in raw {
            e[a].push(OpAddress(b));
        }
        e
    }

    //    0
    //   / \
    //  1   2     4 -> 5
    //   \ /
    //    3
    fn diamond_and_pair() -> TransitiveClosure {
        TransitiveClosure::new(&edges(6, &[(0, 1), (0, 2), (1, 3), (2, 3), (4, 5)])).unwrap()
    }

    #[test]
    fn basic_queries() {
        let tc = diamond_and_pair();
        let o = OpAddress;
        assert_eq!(tc.n_components(), 2);
        assert!(tc.constrained(o(0), o(3)));
        assert!(!tc.constrained(o(3), o(0)));
        assert!(tc.unconstrained(o(1), o(2)));
        assert!(tc.unconstrained(o(0), o(4)));
        assert!(!tc.unconstrained(o(1), o(1)));
        assert_eq!(tc.earliest(o(3)), 3);
        assert_eq!(tc.latest(o(0)), 6 - 3 - 1);
        assert_eq!(tc.latest(o(5)), 5);
        assert_eq!(tc.earliest(o(5)), 1);
    }

    #[test]
    fn filters() {
        let tc = diamond_and_pair();
        let o = OpAddress;
        assert_eq!(tc.get(&[(IsFirst::Yes, o(3))]), ops_of(&[0, 1, 2]));
        assert_eq!(tc.get(&[(IsFirst::No, o(0))]), ops_of(&[1, 2, 3]));
        assert_eq!(tc.get_unconstrained(o(1)), ops_of(&[2, 4, 5]));
        assert_eq!(tc.get(&[(IsFirst::No, o(0)), (IsFirst::Maybe, o(1))]), ops_of(&[2]));
        assert_eq!(tc.get(&[(IsFirst::No, o(0)), (IsFirst::Yes, o(5))]), vec![]);
        assert_eq!(tc.n(&[]), 6);
        assert_eq!(tc.n_post_post(o(1), o(2)), 1);
        assert!(tc.same_unconstrained(o(1), o(1)));
        assert!(!tc.same_unconstrained(o(1), o(2)));
        assert_eq!(tc.op_union(&[vec![(IsFirst::Yes, o(1))], vec![(IsFirst::No, o(4))]]),
            ops_of(&[0, 5]));
    }

    #[test]
    fn extremum_statuses() {
        let tc = diamond_and_pair();
        let o = OpAddress;
        let s = tc.get_extremum_statuses(&ops_of(&[0, 1, 2]));
        assert_eq!(s[0], (IsFirst::Yes, IsFinal::No));
        assert_eq!(s[1], (IsFirst::No, IsFinal::Maybe));
        assert_eq!(tc.get_extremum_status(o(1), &ops_of(&[0, 1, 2])), s[1]);
        assert_eq!(tc.get_extremum_status(o(1), &ops_of(&[1, 2])), (IsFirst::Maybe, IsFinal::Maybe));
    }

    #[test]
    fn duration_bounds() {
        // 0 -> 1 -> 2, and 3 unconstrained: the span of {0, 2} is 3 or 4.
        let tc = TransitiveClosure::new(&edges(4, &[(0, 1), (1, 2)])).unwrap();
        let b = tc.get_duration_bound(&ops_of(&[0, 2])).unwrap();
        assert_eq!(b, DurationBound { low: 3, high: 4 });
        assert!(!b.is_fixed());
        // With 3 hanging off 1 as well, nothing can squeeze between 0 and 2 but 1 and 3.
        let tc = TransitiveClosure::new(&edges(4, &[(0, 1), (1, 2), (0, 3), (3, 2)])).unwrap();
        assert!(tc.get_duration_bound(&ops_of(&[0, 2])).unwrap().is_fixed());
        assert!(tc.get_duration_bound(&ops_of(&[1, 3])).is_none());
    }

    #[test]
    fn redundants() {
        let e = edges(3, &[(0, 1), (1, 2), (0, 2)]);
        let tc = TransitiveClosure::new(&e).unwrap();
        assert_eq!(tc.get_flattened_redundants(&e), vec![(OpAddress(0), OpAddress(2))]);
    }

    #[test]
    fn cycles_are_rejected() {
        assert!(matches!(TransitiveClosure::new(&edges(3, &[(0, 1), (1, 2), (2, 1)])),
            Err(ShiftError::NotSchedulable(_))));
    }

    #[test]
    fn incremental_update_matches_rebuild() {
        let mut tc = diamond_and_pair();
        // Within a component.
        tc.update(&edges(6, &[(1, 2)])).unwrap();
        let rebuilt = TransitiveClosure::new(&edges(6, &[(0, 1), (0, 2), (1, 3), (2, 3), (4, 5), (1, 2)])).unwrap();
        assert_eq!(tc, rebuilt);
        // Across components.
        tc.update(&edges(6, &[(3, 4)])).unwrap();
        assert!(tc.constrained(OpAddress(0), OpAddress(5)));
        assert_eq!(tc.n_components(), 1);
        assert!(tc.update(&edges(6, &[(5, 0)])).is_err());
    }

    #[test]
    fn failed_updates_change_nothing() {
        let mut tc = diamond_and_pair();
        let before = tc.clone();
        // 1 -> 2 is fine on its own, 3 -> 0 closes a cycle.
        assert!(matches!(tc.update(&edges(6, &[(1, 2), (3, 0)])), Err(ShiftError::NotSchedulable(_))));
        assert_eq!(tc, before);
        assert!(tc.update(&edges(6, &[(1, 9)])).is_err());
        assert_eq!(tc, before);
        assert!(tc.unconstrained(OpAddress(1), OpAddress(2)));
    }
}
