use crate::helpe::*;
use crate::analyze::is_schedulable;

#[inline(always)]
fn min_w(a: AllocWeight, b: AllocWeight) -> AllocWeight {
    if b < a { b } else { a }
}

#[inline(always)]
fn max_w(a: AllocWeight, b: AllocWeight) -> AllocWeight {
    if b > a { b } else { a }
}

/// Accumulates into `[lower, upper]` the range of change in liveness
/// caused by scheduling an op which touches an alloc of weight `w`,
/// given where the op sits among the alloc's ops.
#[inline(always)]
pub(crate) fn update_from_first_final(
    lower:  &mut AllocWeight,
    upper:  &mut AllocWeight,
    w:      AllocWeight,
    status: (IsFirst, IsFinal),
) {
    match status.0 {
        IsFirst::Yes    => { *lower += w; *upper += w; },
        IsFirst::Maybe  => { *upper += w; },
        IsFirst::No     => {},
    }
    match status.1 {
        IsFinal::Yes    => { *lower -= w; *upper -= w; },
        IsFinal::Maybe  => { *lower -= w; },
        IsFinal::No     => {},
    }
}

/// Per-op bounds on the change in liveness its scheduling causes,
/// over all valid schedules.
pub(crate) fn liveness_change_bounds(
    g:  &Graph,
    tc: &TransitiveClosure,
) -> (Vec<AllocWeight>, Vec<AllocWeight>) {
    let mut lower = vec![AllocWeight::zero(); g.n_ops()];
    let mut upper = vec![AllocWeight::zero(); g.n_ops()];
    for alloc in g.allocs().iter().filter(|a| a.n_ops() > 0) {
        let statuses = tc.get_extremum_statuses(alloc.ops());
        for (&op, status) in alloc.ops().iter().zip(statuses) {
            update_from_first_final(&mut lower[op.0], &mut upper[op.0], alloc.weight(), status);
        }
    }

    (lower, upper)
}

/// Depth-first walk over the outs of `a`, `a` included, entering only
/// ops which pass `filter`. The ops reached come back in an order
/// compatible with the constraints between them.
pub(crate) fn filtered_schedule<F>(g: &Graph, a: OpAddress, filter: F) -> Vec<OpAddress>
where F: Fn(OpAddress) -> bool {
    let mut reached = vec![];
    let mut seen = HashSet::from([a]);
    let mut to_process = vec![a];
    while let Some(nxt) = to_process.pop() {
        if filter(nxt) {
            reached.push(nxt);
            for &out in g.get_op(nxt).outs() {
                if seen.insert(out) {
                    to_process.push(out);
                }
            }
        }
    }

    // Kahn over the induced subgraph.
    let inside = reached.iter().copied().collect::<HashSet<_>>();
    let mut n_ins = reached.iter()
        .map(|&x| (x, g.get_op(x).ins().iter().filter(|i| inside.contains(i)).count()))
        .collect::<HashMap<_, _>>();
    let mut ready = reached.iter()
        .copied()
        .filter(|x| n_ins[x] == 0)
        .sorted()
        .rev()
        .collect::<Vec<_>>();
    let mut res = Vec::with_capacity(reached.len());
    while let Some(x) = ready.pop() {
        res.push(x);
        for out in g.get_op(x).outs().iter().filter(|o| inside.contains(o)) {
            if let Some(c) = n_ins.get_mut(out) {
                *c -= 1;
                if *c == 0 {
                    ready.push(*out);
                }
            }
        }
    }

    res
}

#[inline(always)]
fn is_linked(g: &Graph, a: OpAddress) -> bool {
    let op = g.get_op(a);
    op.has_fwd_link() || op.has_bwd_link()
}

/// Inserts the new ones among `constraints` into `g`, except those
/// which would leave no schedule honouring every constraint and link.
/// Returns how many went in.
fn insert_schedulable(g: &mut Graph, constraints: &[(OpAddress, OpAddress)]) -> ShiftResult<usize> {
    let fresh = constraints.iter()
        .copied()
        .filter(|&(from, to)| !g.get_op(from).has_out(to))
        .unique()
        .collect::<Vec<_>>();
    let before = g.clone();
    g.insert_constraints(&fresh)?;
    if is_schedulable(g) {
        return Ok(fresh.len());
    }

    *g = before;
    let mut n_inserted = 0;
    for (from, to) in fresh {
        g.insert_constraint(from, to)?;
        if is_schedulable(g) {
            n_inserted += 1;
        } else {
            g.remove_constraint(from, to)?;
        }
    }

    Ok(n_inserted)
}

/// Inserts links and constraints which cannot exclude every optimal
/// schedule. Each pass reports whether it changed the graph.
///
/// `lower` and `upper` must be the result of [liveness_change_bounds]
/// on the same graph and closure.
pub struct TransitiveClosureConstrainer<'a> {
    graph:  &'a mut Graph,
    tc:     &'a TransitiveClosure,
    lower:  &'a [AllocWeight],
    upper:  &'a [AllocWeight],
}

impl<'a> TransitiveClosureConstrainer<'a> {
    pub fn new(
        graph:  &'a mut Graph,
        tc:     &'a TransitiveClosure,
        lower:  &'a [AllocWeight],
        upper:  &'a [AllocWeight],
    ) -> Self {
        Self {
            graph,
            tc,
            lower,
            upper,
        }
    }

    /// A tight pair whose second op frees at least as much as the
    /// first can possibly allocate is linked.
    pub fn link_tight_drops(&mut self) -> ShiftResult<bool> {
        let mut new_links = vec![];
        for (before, after) in self.graph.get_tight_pairs() {
            if self.upper[after.0] <= self.lower[before.0]
                && !self.graph.get_op(before).has_fwd_link()
                && !self.graph.get_op(after).has_bwd_link() {
                new_links.push((before, after));
            }
        }
        for &(before, after) in &new_links {
            self.graph.insert_link(before, after)?;
        }
        debug!(n = new_links.len(), "link_tight_drops");

        Ok(!new_links.is_empty())
    }

    /// A tight pair is linked when no op that could go between them
    /// has a range of liveness change overlapping theirs.
    pub fn link_close_tight_pairs(&mut self) -> ShiftResult<bool> {
        let mut new_links = vec![];
        for (before, after) in self.graph.get_tight_pairs() {
            if self.graph.get_op(before).has_fwd_link() {
                continue;
            }
            let l = min_w(self.lower[before.0], self.lower[after.0]);
            let u = max_w(self.upper[before.0], self.upper[after.0]);
            let can_tie = self.tc.get_unconstrained(before)
                .into_iter()
                .all(|x| !(l < self.upper[x.0] && self.lower[x.0] < u));
            if can_tie {
                new_links.push((before, after));
            }
        }
        for &(before, after) in &new_links {
            self.graph.insert_link(before, after)?;
        }
        debug!(n = new_links.len(), "link_close_tight_pairs");

        Ok(!new_links.is_empty())
    }

    /// Within groups of ops with identical ins: if `a` never increases
    /// liveness by more than `b` (and whatever `b` drags along)
    /// decreases it, `a` and its qualifying successors go before `b`.
    ///
    /// Linked ops cannot move on their own and are left out.
    pub fn constrain_weight_separated_groups(&mut self) -> ShiftResult<bool> {
        let mut processed = vec![false; self.graph.n_ops()];
        let mut new_constraints = vec![];
        for op in (0..self.graph.n_ops()).map(OpAddress) {
            if processed[op.0] {
                continue;
            }
            let identical_ins = self.graph.get_identical_ins(op);
            for id in &identical_ins {
                processed[id.0] = true;
            }
            if identical_ins.len() >= 2 {
                self.process_weight_separated_identical_ins(&identical_ins, &mut new_constraints);
            }
        }
        let n = insert_schedulable(self.graph, &new_constraints)?;
        debug!(n, n_proposed = new_constraints.len(), "constrain_weight_separated_groups");

        Ok(n > 0)
    }

    fn process_weight_separated_identical_ins(
        &self,
        identical_ins:      &[OpAddress],
        new_constraints:    &mut Vec<(OpAddress, OpAddress)>,
    ) {
        for &a in identical_ins {
            for &b in identical_ins {
                if a == b || !(self.upper[a.0] <= self.lower[b.0]) {
                    continue;
                }
                if is_linked(&*self.graph, a) || is_linked(&*self.graph, b) {
                    continue;
                }

                // Everything reachable from b without passing an op
                // which must follow a.
                let mut post_bs = vec![];
                let mut seen = HashSet::from([b]);
                let mut to_process = vec![b];
                while let Some(nxt) = to_process.pop() {
                    if !self.tc.constrained(a, nxt) {
                        post_bs.push(nxt);
                        for &out in self.graph.get_op(nxt).outs() {
                            if seen.insert(out) {
                                to_process.push(out);
                            }
                        }
                    }
                }
                let lb = post_bs.iter()
                    .fold(self.lower[b.0], |acc, pb| min_w(acc, self.lower[pb.0]));

                if self.upper[a.0] <= lb {
                    let n_post_both = self.tc.n_post_post(a, b);
                    let candidates = filtered_schedule(&*self.graph, a, |x| {
                        self.upper[x.0] <= lb && self.tc.n_post_post(b, x) == n_post_both
                    });
                    if a < b || candidates.iter().any(|c| self.upper[c.0] < lb) {
                        for &a_prime in &candidates {
                            if a_prime != b
                                && !self.tc.constrained(b, a_prime)
                                && !is_linked(&*self.graph, a_prime) {
                                new_constraints.push((a_prime, b));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Two tight chains hanging off identical ins and feeding identical
    /// outs are zipped together, the one with the lower running
    /// liveness change first. Chains holding linked ops are left out.
    pub fn constrain_parallel_chains(&mut self) -> ShiftResult<bool> {
        let g = &*self.graph;
        let mut new_constraints = vec![];
        for a in (0..g.n_ops()).map(OpAddress) {
            let identical_ins = g.get_identical_ins(a);
            if identical_ins.len() <= 1 {
                continue;
            }
            let a_chain = g.tight_chain_from(a);
            let a_outs = g.get_op(*a_chain.last().unwrap_or(&a)).outs();
            for &b in identical_ins.iter().filter(|&&b| b != a) {
                let b_chain = g.tight_chain_from(b);
                let b_outs = g.get_op(*b_chain.last().unwrap_or(&b)).outs();
                if !(a_outs == b_outs && a_chain.len() >= b_chain.len()) {
                    continue;
                }
                if a_chain.iter().chain(b_chain.iter()).any(|&x| is_linked(g, x)) {
                    continue;
                }

                let mut can_insert = true;
                let mut running_upp = AllocWeight::zero();
                let mut running_low = AllocWeight::zero();
                for (&ai, &bi) in a_chain.iter().zip(b_chain.iter()) {
                    let mut upp_a = self.upper[ai.0];
                    let mut low_b = self.lower[bi.0];

                    // Allocs shared by both steps move in lockstep.
                    for &alloc in g.get_op(bi).allocs().iter().filter(|&&x| g.get_op(ai).has_alloc(x)) {
                        let alloc = g.get_alloc(alloc);
                        let neg_w = -alloc.weight();
                        let mut dummy = AllocWeight::zero();
                        update_from_first_final(
                            &mut dummy, &mut upp_a, neg_w, self.tc.get_extremum_status(ai, alloc.ops())
                        );
                        update_from_first_final(
                            &mut low_b, &mut dummy, neg_w, self.tc.get_extremum_status(bi, alloc.ops())
                        );
                    }

                    running_upp += upp_a;
                    running_low += low_b;
                    if !(running_upp < running_low || (running_upp == running_low && ai < bi)) {
                        can_insert = false;
                        break;
                    }
                }

                if can_insert {
                    for (&ai, &bi) in a_chain.iter().zip(b_chain.iter()) {
                        if !g.get_op(ai).has_out(bi) {
                            new_constraints.push((ai, bi));
                        }
                    }
                }
            }
        }
        let n = insert_schedulable(self.graph, &new_constraints)?;
        debug!(n, n_proposed = new_constraints.len(), "constrain_parallel_chains");

        Ok(n > 0)
    }

    /// Constraints into the middle of a link chain are moved to its
    /// head, constraints out of the middle to its tail. The set of
    /// valid schedules does not change.
    pub fn slide_links(&mut self) -> ShiftResult<bool> {
        let mut changed = false;
        for chain in self.graph.get_link_chains() {
            let (head, tail) = (chain[0], chain[chain.len() - 1]);
            for (i, &id) in chain.iter().enumerate() {
                if i != chain.len() - 1 {
                    let fwd = self.graph.get_op(id).fwd_link();
                    let outs = self.graph.get_op(id).outs().to_vec();
                    for out in outs.into_iter().filter(|&o| Some(o) != fwd) {
                        self.graph.remove_constraint(id, out)?;
                        if !chain.contains(&out) {
                            self.graph.insert_constraint(tail, out)?;
                        }
                        changed = true;
                    }
                }
                if i != 0 {
                    let bwd = self.graph.get_op(id).bwd_link();
                    let ins = self.graph.get_op(id).ins().to_vec();
                    for inn in ins.into_iter().filter(|&o| Some(o) != bwd) {
                        self.graph.remove_constraint(inn, id)?;
                        if !chain.contains(&inn) {
                            self.graph.insert_constraint(inn, head)?;
                        }
                        changed = true;
                    }
                }
            }
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<F>(g: &mut Graph, pass: F) -> bool
    where F: FnOnce(&mut TransitiveClosureConstrainer) -> ShiftResult<bool> {
        let tc = TransitiveClosure::from_graph(g).unwrap();
        let (lower, upper) = liveness_change_bounds(g, &tc);
        let mut c = TransitiveClosureConstrainer::new(g, &tc, &lower, &upper);
        pass(&mut c).unwrap()
    }

    #[test]
    fn first_final_bounds() {
        let w = AllocWeight::from(2.0);
        let (mut l, mut u) = (AllocWeight::zero(), AllocWeight::zero());
        update_from_first_final(&mut l, &mut u, w, (IsFirst::Yes, IsFinal::No));
        assert_eq!((l, u), (w, w));
        let (mut l, mut u) = (AllocWeight::zero(), AllocWeight::zero());
        update_from_first_final(&mut l, &mut u, w, (IsFirst::Maybe, IsFinal::Maybe));
        assert_eq!((l, u), (-w, w));
        let (mut l, mut u) = (AllocWeight::zero(), AllocWeight::zero());
        update_from_first_final(&mut l, &mut u, w, (IsFirst::No, IsFinal::Yes));
        assert_eq!((l, u), (-w, -w));
    }

    #[test]
    fn filtered_is_topological() {
        // 0 -> {1, 2}, 2 -> 1, 1 -> 3, 3 is filtered out.
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c", "d"]);
        g.insert_constraints(&[(o[0], o[1]), (o[0], o[2]), (o[2], o[1]), (o[1], o[3])]).unwrap();
        let s = filtered_schedule(&g, o[0], |x| x != o[3]);
        assert_eq!(s, vec![o[0], o[2], o[1]]);
    }

    /// Two chains a0 -> a1 -> a2 and b0 -> b1 -> b2 off a common root.
    /// Op a_i frees alloc x_{i - 1} and creates x_i (same for b).
    fn two_drops(w: [f64; 3]) -> Graph {
        let mut g = Graph::new();
        let root = g.insert_op("root");
        for prefix in ["a", "b"] {
            let ops = (0..3).map(|i| g.insert_op(&format!("{}{}", prefix, i))).collect::<Vec<_>>();
            g.insert_constraint(root, ops[0]).unwrap();
            let mut prev = root;
            for (i, &op) in ops.iter().enumerate() {
                if i > 0 {
                    g.insert_constraint(ops[i - 1], op).unwrap();
                }
                let x = g.insert_alloc(w[i]);
                g.insert_op_allocs(&[prev, op], x).unwrap();
                prev = op;
            }
        }

        g
    }

    #[test]
    fn tight_drops() {
        // a0 => a1 becomes a link iff 2 * w1 >= w0 + w2, and a1 => a2
        // iff w1 <= 2 * w2.
        let mut g = two_drops([1.0, 5.0, 2.0]);
        assert!(run(&mut g, |c| c.link_tight_drops()));
        assert_eq!(g.get_link_chains().len(), 2);

        let mut g = two_drops([10.0, 3.0, 1.0]);
        run(&mut g, |c| c.link_tight_drops());
        assert_eq!(g.n_links(), 0);
    }

    #[test]
    fn close_tight_pairs_need_isolation() {
        // A single chain with nothing beside it: every tight pair links.
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c"]);
        g.insert_constraints(&[(o[0], o[1]), (o[1], o[2])]).unwrap();
        let x = g.insert_alloc(1.0);
        g.insert_op_allocs(&o, x).unwrap();
        assert!(run(&mut g, |c| c.link_close_tight_pairs()));
        assert_eq!(g.get_link_chains(), vec![o.clone()]);
    }

    #[test]
    fn weight_separated() {
        // root -> {a, b}. a creates 1 and b frees 4: b first.
        let mut g = Graph::new();
        let o = g.insert_ops(&["root", "a", "b", "end"]);
        g.insert_constraints(&[(o[0], o[1]), (o[0], o[2]), (o[1], o[3]), (o[2], o[3])]).unwrap();
        let small = g.insert_alloc(1.0);
        g.insert_op_allocs(&[o[1], o[3]], small).unwrap();
        let big = g.insert_alloc(4.0);
        g.insert_op_allocs(&[o[0], o[2]], big).unwrap();
        assert!(run(&mut g, |c| c.constrain_weight_separated_groups()));
        assert!(g.get_op(o[2]).has_out(o[1]));
        assert!(!g.get_op(o[1]).has_out(o[2]));
    }

    #[test]
    fn parallel_chains_zip() {
        // root -> a0 -> a1 -> end and root -> b0 -> b1 -> end, all
        // weightless: chains zip with the lower addresses first.
        let mut g = Graph::new();
        let o = g.insert_ops(&["root", "a0", "a1", "b0", "b1", "end"]);
        g.insert_constraints(&[
            (o[0], o[1]), (o[1], o[2]), (o[2], o[5]),
            (o[0], o[3]), (o[3], o[4]), (o[4], o[5]),
        ]).unwrap();
        assert!(run(&mut g, |c| c.constrain_parallel_chains()));
        assert!(g.get_op(o[1]).has_out(o[3]));
        assert!(g.get_op(o[2]).has_out(o[4]));
        assert!(!g.get_op(o[3]).has_out(o[1]));
        assert!(TransitiveClosure::from_graph(&g).is_ok());
    }

    /// 0 -> {1, 3} and 2 -> {1, 3}, with 2 => 1 linked.
    fn linked_pair() -> Graph {
        let mut g = Graph::new();
        let o = g.insert_ops(&["0", "1", "2", "3"]);
        g.insert_constraints(&[(o[0], o[1]), (o[0], o[3]), (o[2], o[3])]).unwrap();
        g.insert_link(o[2], o[1]).unwrap();
        for (ops, w) in [(vec![o[0], o[1], o[3]], 7.0), (vec![o[1], o[2]], 5.0), (vec![o[1]], 4.0), (vec![o[1], o[3]], 9.0)] {
            let a = g.insert_alloc(w);
            g.insert_op_allocs(&ops, a).unwrap();
        }
        g
    }

    #[test]
    fn linked_graphs_stay_schedulable() {
        let mut g = linked_pair();
        run(&mut g, |c| c.constrain_weight_separated_groups());
        assert!(is_schedulable(&g));

        let mut g = linked_pair();
        run(&mut g, |c| c.constrain_parallel_chains());
        assert!(is_schedulable(&g));
    }

    #[test]
    fn unschedulable_constraints_are_dropped() {
        // a => b, so c cannot go between them.
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c"]);
        g.insert_link(o[0], o[1]).unwrap();
        let n = insert_schedulable(&mut g, &[(o[0], o[1]), (o[0], o[2]), (o[2], o[1]), (o[0], o[2])]).unwrap();
        assert_eq!(n, 1);
        assert!(g.get_op(o[0]).has_out(o[2]));
        assert!(!g.get_op(o[2]).has_out(o[1]));
        assert!(is_schedulable(&g));
    }

    #[test]
    fn slide() {
        // x -> b where a => b => c is a link chain, b -> y.
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c", "x", "y"]);
        g.insert_link(o[0], o[1]).unwrap();
        g.insert_link(o[1], o[2]).unwrap();
        g.insert_constraints(&[(o[3], o[1]), (o[1], o[4]), (o[0], o[2])]).unwrap();
        assert!(run(&mut g, |c| c.slide_links()));
        assert!(g.get_op(o[3]).has_out(o[0]));
        assert!(!g.get_op(o[3]).has_out(o[1]));
        assert!(g.get_op(o[2]).has_out(o[4]));
        assert!(!g.get_op(o[1]).has_out(o[4]));
        assert!(!g.get_op(o[0]).has_out(o[2]));
        assert!(!run(&mut g, |c| c.slide_links()));
    }
}
