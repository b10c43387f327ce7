use crate::helpe::*;

/// Graph rewrites which shrink the problem without changing the
/// difference in total liveness between any two schedules.
///
/// Every pass returns whether it changed anything.
pub struct AllocSimplifier;

impl AllocSimplifier {
    /// Allocs sharing the exact same set of ops are merged into the
    /// lowest addressed one, which inherits the sum of their weights.
    pub fn combine_allocs_with_common_ops(g: &mut Graph) -> ShiftResult<bool> {
        let n = g.n_allocs();
        let mut to_merge: Vec<Vec<AllocAddress>> = vec![vec![]; n];
        for a in (0..n).map(AllocAddress) {
            let ops = g.get_alloc(a).ops();
            let group = match ops.first() {
                None        => a,
                Some(op)    => {
                    g.get_op(*op).allocs()
                        .iter()
                        .copied()
                        .find(|&other| other < a && g.get_alloc(other).ops() == ops)
                        .unwrap_or(a)
                }
            };
            to_merge[group.0].push(a);
        }

        let mut changed = false;
        for group in to_merge.iter().filter(|grp| grp.len() > 1) {
            if g.get_alloc(group[0]).n_ops() == 0 {
                continue;
            }
            changed = true;
            let mut combined = g.get_alloc(group[0]).weight();
            for &other in &group[1..] {
                combined += g.get_alloc(other).weight();
                g.disconnect_alloc(other)?;
            }
            g.update_weight(group[0], combined)?;
        }

        Ok(changed)
    }

    pub fn disconnect_allocs_with_one_op(g: &mut Graph) -> ShiftResult<bool> {
        let singles = g.allocs().iter()
            .filter(|a| a.n_ops() == 1)
            .map(|a| a.address())
            .collect::<Vec<_>>();
        for &a in &singles {
            g.disconnect_alloc(a)?;
        }

        Ok(!singles.is_empty())
    }

    pub fn disconnect_allocs_with_zero_weight(g: &mut Graph) -> ShiftResult<bool> {
        let zeros = g.allocs().iter()
            .filter(|a| a.n_ops() > 0 && a.weight() == AllocWeight::zero())
            .map(|a| a.address())
            .collect::<Vec<_>>();
        for &a in &zeros {
            g.disconnect_alloc(a)?;
        }

        Ok(!zeros.is_empty())
    }

    /// Drops, from each alloc, the ops which are neither first nor
    /// final among the alloc's ops in any schedule.
    pub fn disconnect_inbetweener_allocs(g: &mut Graph, tc: &TransitiveClosure) -> ShiftResult<bool> {
        let mut changed = false;
        for a in (0..g.n_allocs()).map(AllocAddress) {
            let ops = g.get_alloc(a).ops().to_vec();
            let statuses = tc.get_extremum_statuses(&ops);
            let (remove, keep): (Vec<(OpAddress, _)>, Vec<(OpAddress, _)>) = ops.into_iter()
                .zip(statuses)
                .partition(|(_, s)| *s == (IsFirst::No, IsFinal::No));
            if !remove.is_empty() {
                changed = true;
                let keep = keep.into_iter().map(|(o, _)| o).collect::<Vec<_>>();
                let remove = remove.into_iter().map(|(o, _)| o).collect::<Vec<_>>();
                g.update(a, &keep, &remove)?;
            }
        }

        Ok(changed)
    }

    /// Allocs whose span is the same in every schedule add a constant
    /// to the total liveness; they are dropped.
    pub fn disconnect_fixed_duration_allocs(g: &mut Graph, tc: &TransitiveClosure) -> ShiftResult<bool> {
        let fixed = g.allocs().iter()
            .filter(|a| a.n_ops() > 0)
            .filter(|a| tc.get_duration_bound(a.ops()).is_some_and(|b| b.is_fixed()))
            .map(|a| a.address())
            .collect::<Vec<_>>();
        for &a in &fixed {
            g.disconnect_alloc(a)?;
        }

        Ok(!fixed.is_empty())
    }

    /// If an op always starts one alloc and always ends another of the
    /// same weight, the two behave like a single alloc which runs
    /// through the op. The second is folded into the first.
    pub fn connect_contiguous_allocs(g: &mut Graph, tc: &TransitiveClosure) -> ShiftResult<bool> {
        let mut changed = false;
        for op in (0..g.n_ops()).map(OpAddress) {
            let mut first_wrt = vec![];
            let mut final_wrt = vec![];
            for &a in g.get_op(op).allocs() {
                let (first, last) = tc.get_extremum_status(op, g.get_alloc(a).ops());
                if first == IsFirst::Yes {
                    first_wrt.push(a);
                }
                if last == IsFinal::Yes {
                    final_wrt.push(a);
                }
            }

            let mut to_merge: Vec<(AllocAddress, AllocAddress)> = vec![];
            let present = |m: &[(AllocAddress, AllocAddress)], a: AllocAddress| {
                m.iter().any(|&(x, y)| x == a || y == a)
            };
            for &a0 in &first_wrt {
                for &a1 in &final_wrt {
                    let same_weight = g.get_alloc(a0).weight() - g.get_alloc(a1).weight() == AllocWeight::zero();
                    if same_weight && !present(&to_merge, a0) && !present(&to_merge, a1) {
                        to_merge.push((a0, a1));
                    }
                }
            }

            if !to_merge.is_empty() {
                changed = true;
                for (a0, a1) in to_merge {
                    if a0 != a1 {
                        let moved = g.get_alloc(a1).ops().to_vec();
                        g.insert_op_allocs(&moved, a0)?;
                    }
                    g.disconnect_alloc(a1)?;
                }
            }
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tc(g: &Graph) -> TransitiveClosure {
        TransitiveClosure::from_graph(g).unwrap()
    }

    #[test]
    fn combine() {
        // Three allocs on {a, b}, one on {a}.
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b"]);
        g.insert_constraint(o[0], o[1]).unwrap();
        for w in [1.0, 1.0, 2.0] {
            let a = g.insert_alloc(w);
            g.insert_op_allocs(&o, a).unwrap();
        }
        let lone = g.insert_alloc(5.0);
        g.insert_op_alloc(o[0], lone).unwrap();
        assert!(AllocSimplifier::combine_allocs_with_common_ops(&mut g).unwrap());
        assert_eq!(g.get_alloc(AllocAddress(0)).weight(), AllocWeight::from(4.0));
        assert_eq!(g.get_alloc(AllocAddress(1)).n_ops(), 0);
        assert_eq!(g.get_alloc(AllocAddress(2)).n_ops(), 0);
        assert_eq!(g.get_alloc(lone).n_ops(), 1);
        assert!(!AllocSimplifier::combine_allocs_with_common_ops(&mut g).unwrap());
    }

    #[test]
    fn one_op_and_zero_weight() {
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c", "d"]);
        let a = g.insert_alloc(1.0);
        let b = g.insert_alloc(1.0);
        let c = g.insert_alloc(0.0);
        g.insert_op_alloc(o[0], a).unwrap();
        g.insert_op_allocs(&o[1..2], b).unwrap();
        g.insert_op_allocs(&o, c).unwrap();
        assert!(AllocSimplifier::disconnect_allocs_with_one_op(&mut g).unwrap());
        assert_eq!(g.get_alloc(a).n_ops(), 0);
        assert_eq!(g.get_alloc(b).n_ops(), 0);
        assert_eq!(g.get_alloc(c).n_ops(), 4);
        assert!(AllocSimplifier::disconnect_allocs_with_zero_weight(&mut g).unwrap());
        assert_eq!(g.get_alloc(c).n_ops(), 0);
        assert!(g.ops().iter().all(|op| op.n_allocs() == 0));
    }

    #[test]
    fn inbetweeners() {
        // Diamond a -> {b, c} -> d with one alloc on all four: only
        // the ends matter.
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c", "d"]);
        g.insert_constraints(&[(o[0], o[1]), (o[0], o[2]), (o[1], o[3]), (o[2], o[3])]).unwrap();
        let w = g.insert_alloc(3.0);
        g.insert_op_allocs(&o, w).unwrap();
        let t = tc(&g);
        assert!(AllocSimplifier::disconnect_inbetweener_allocs(&mut g, &t).unwrap());
        assert_eq!(g.get_alloc(w).ops(), &[o[0], o[3]]);
        assert_eq!(g.get_op(o[1]).n_allocs(), 0);
    }

    #[test]
    fn fixed_duration() {
        // {a, x} -> b -> c. {b, c} always spans 2 steps, x may land
        // between a and c, and {a, x} has no definite first op.
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c", "x"]);
        g.insert_constraints(&[(o[0], o[1]), (o[3], o[1]), (o[1], o[2])]).unwrap();
        let bc = g.insert_alloc(1.0);
        let ac = g.insert_alloc(1.0);
        let ax = g.insert_alloc(1.0);
        g.insert_op_allocs(&[o[1], o[2]], bc).unwrap();
        g.insert_op_allocs(&[o[0], o[2]], ac).unwrap();
        g.insert_op_allocs(&[o[0], o[3]], ax).unwrap();
        let t = tc(&g);
        assert!(AllocSimplifier::disconnect_fixed_duration_allocs(&mut g, &t).unwrap());
        assert_eq!(g.get_alloc(bc).n_ops(), 0);
        assert_eq!(g.get_alloc(ac).n_ops(), 2);
        assert_eq!(g.get_alloc(ax).n_ops(), 2);
    }

    #[test]
    fn contiguous_chain() {
        // A chain of 10 ops, alloc i on {i, i + 1}, all the same weight:
        // everything folds into a single alloc.
        let mut g = Graph::new();
        let o = (0..10).map(|i| g.insert_op(&format!("op{}", i))).collect::<Vec<_>>();
        for i in 0..9 {
            g.insert_constraint(o[i], o[i + 1]).unwrap();
            let a = g.insert_alloc(7.0);
            g.insert_op_allocs(&[o[i], o[i + 1]], a).unwrap();
        }
        let t = tc(&g);
        while AllocSimplifier::connect_contiguous_allocs(&mut g, &t).unwrap() {}
        let live = g.allocs().iter().filter(|a| a.n_ops() > 0).collect::<Vec<_>>();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].n_ops(), 10);
    }

    #[test]
    fn contiguous_needs_equal_weights() {
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c"]);
        g.insert_constraints(&[(o[0], o[1]), (o[1], o[2])]).unwrap();
        let x = g.insert_alloc(1.0);
        let y = g.insert_alloc(2.0);
        g.insert_op_allocs(&[o[0], o[1]], x).unwrap();
        g.insert_op_allocs(&[o[1], o[2]], y).unwrap();
        let t = tc(&g);
        assert!(!AllocSimplifier::connect_contiguous_allocs(&mut g, &t).unwrap());
    }
}
