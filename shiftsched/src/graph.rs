use std::cmp::Ordering;
use std::hash::{DefaultHasher, Hasher};

use crate::helpe::*;
use crate::scc::{tarjan, undirected_components};

/// The scheduling problem: ops, allocs, the precedence constraints
/// between ops and the links which force pairs of ops to be adjacent.
///
/// A [Graph] is mutated only while being built and by the
/// simplification passes of [crate::algo]. Everything downstream
/// (closures, schedules) is derived from an immutable snapshot.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    ops:    Vec<Op>,
    allocs: Vec<Alloc>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn n_ops(&self) -> usize { self.ops.len() }
    #[inline(always)]
    pub fn n_allocs(&self) -> usize { self.allocs.len() }
    #[inline(always)]
    pub fn ops(&self) -> &[Op] { &self.ops }
    #[inline(always)]
    pub fn allocs(&self) -> &[Alloc] { &self.allocs }

    /// Panics on an invalid address. Use [Graph::check_op] first if
    /// the address comes from outside.
    #[inline(always)]
    pub fn get_op(&self, a: OpAddress) -> &Op { &self.ops[a.0] }
    #[inline(always)]
    pub fn get_alloc(&self, a: AllocAddress) -> &Alloc { &self.allocs[a.0] }

    pub fn check_op(&self, address: OpAddress) -> ShiftResult<()> {
        if address.0 >= self.n_ops() {
            return Err(ShiftError::InvalidOp { address, n_ops: self.n_ops() });
        }

        Ok(())
    }

    pub fn check_alloc(&self, address: AllocAddress) -> ShiftResult<()> {
        if address.0 >= self.n_allocs() {
            return Err(ShiftError::InvalidAlloc { address, n_allocs: self.n_allocs() });
        }

        Ok(())
    }

    //---START BUILD API---
    pub fn insert_op(&mut self, debug_name: &str) -> OpAddress {
        let address = OpAddress(self.ops.len());
        self.ops.push(Op::new(address, debug_name));

        address
    }

    pub fn insert_ops<S: AsRef<str>>(&mut self, names: &[S]) -> Vec<OpAddress> {
        names.iter()
            .map(|n| self.insert_op(n.as_ref()))
            .collect()
    }

    pub fn insert_alloc(&mut self, weight: impl Into<AllocWeight>) -> AllocAddress {
        let address = AllocAddress(self.allocs.len());
        self.allocs.push(Alloc::new(address, weight.into()));

        address
    }

    pub fn insert_op_alloc(&mut self, op: OpAddress, alloc: AllocAddress) -> ShiftResult<()> {
        self.check_op(op)?;
        self.check_alloc(alloc)?;
        self.ops[op.0].insert_alloc(alloc);
        self.allocs[alloc.0].insert_op(op);

        Ok(())
    }

    pub fn insert_op_allocs(&mut self, ops: &[OpAddress], alloc: AllocAddress) -> ShiftResult<()> {
        for &op in ops {
            self.insert_op_alloc(op, alloc)?;
        }

        Ok(())
    }

    /// `from` must come before `to` in every schedule. Inserting the
    /// same constraint twice is a no-op.
    pub fn insert_constraint(&mut self, from: OpAddress, to: OpAddress) -> ShiftResult<()> {
        self.check_op(from)?;
        self.check_op(to)?;
        if from == to {
            return Err(ShiftError::SelfConstraint(from));
        }
        if self.ops[from.0].insert_out(to) {
            self.ops[to.0].insert_in(from);
        }

        Ok(())
    }

    pub fn insert_constraints(&mut self, pairs: &[(OpAddress, OpAddress)]) -> ShiftResult<()> {
        for &(from, to) in pairs {
            self.insert_constraint(from, to)?;
        }

        Ok(())
    }

    /// `after` must come *immediately* after `before`. Implies the
    /// constraint `before -> after`.
    ///
    /// A link clashing with an existing one, or closing a cycle of
    /// links, is refused and leaves the graph untouched.
    pub fn insert_link(&mut self, before: OpAddress, after: OpAddress) -> ShiftResult<()> {
        self.check_op(before)?;
        self.check_op(after)?;
        if before == after {
            return Err(ShiftError::SelfConstraint(before));
        }
        let conflict = |message: String| Err(ShiftError::LinkConflict { before, after, message });
        if let Some(x) = self.ops[before.0].fwd_link {
            if x != after {
                return conflict(format!("{} is already linked forward to {}", before, x));
            }
        }
        if let Some(x) = self.ops[after.0].bwd_link {
            if x != before {
                return conflict(format!("{} is already linked backward to {}", after, x));
            }
        }
        let mut current = after;
        while let Some(nxt) = self.ops[current.0].fwd_link {
            if nxt == before {
                return conflict(format!("{} is already linked, through a chain, to {}", after, before));
            }
            current = nxt;
        }

        self.insert_constraint(before, after)?;
        self.ops[before.0].fwd_link = Some(after);
        self.ops[after.0].bwd_link = Some(before);

        Ok(())
    }

    /// Partitions ops into consecutive bins by inserting a barrier op
    /// between every two neighbouring bins. Barriers are chained, so
    /// all ops of bin `i` run before all ops of bin `i + 1`.
    pub fn insert_bin_constraints(
        &mut self,
        bins:   &[OpChain],
        prefix: &str,
    ) -> ShiftResult<Vec<OpAddress>> {
        let mut prev = self.insert_op(&format!("{}0", prefix));
        let mut barriers = vec![prev];
        for i in 1..bins.len() {
            let op = self.insert_op(&format!("{}{}", prefix, i));
            for &b in &bins[i - 1] {
                self.insert_constraint(b, op)?;
            }
            for &a in &bins[i] {
                self.insert_constraint(op, a)?;
            }
            self.insert_constraint(prev, op)?;
            barriers.push(op);
            prev = op;
        }

        Ok(barriers)
    }

    /// One alloc of weight `w` per pair: pulls the two ops of each pair
    /// towards each other.
    pub fn insert_attractions(
        &mut self,
        pairs:  &[(OpAddress, OpAddress)],
        w:      AllocWeight,
    ) -> ShiftResult<()> {
        for &(a, b) in pairs {
            let alloc = self.insert_alloc(w);
            self.insert_op_allocs(&[a, b], alloc)?;
        }

        Ok(())
    }

    /// Pulls ops with higher priorities towards the start of the
    /// schedule. Each distinct priority gets a weight `step * rank` in
    /// slot `relative_lexico`. An attractor op holding a new alloc of
    /// that weight is inserted before all current input ops, and the
    /// prioritised op joins the alloc.
    pub fn insert_start_attractors(
        &mut self,
        ops:                &[OpAddress],
        priorities:         &[f64],
        relative_lexico:    i64,
        step:               f64,
    ) -> ShiftResult<()> {
        if ops.len() != priorities.len() {
            return Err(ShiftError::InvalidArgument(format!(
                "Number of ops ({}) is not the same as the number of priorities ({})",
                ops.len(), priorities.len()
            )));
        }
        let inputs = self.get_input_ops();
        let unique = priorities.iter()
            .copied()
            .sorted_by(|a, b| a.total_cmp(b))
            .dedup()
            .collect::<Vec<f64>>();
        if unique.len() <= 1 {
            return Ok(());
        }
        let rank_weight = |p: f64| -> AllocWeight {
            let rank = unique.iter().position(|&u| u == p).unwrap_or(0);
            AllocWeight::new(step * rank as f64, relative_lexico)
        };

        let mut attractors = vec![];
        for (&op, &p) in ops.iter().zip(priorities.iter()) {
            self.check_op(op)?;
            let w = rank_weight(p);
            if w != AllocWeight::zero() {
                let alloc = self.insert_alloc(w);
                let name = format!("priorityAttractor_{}_{}", self.ops[op.0].debug_name, w);
                let attractor = self.insert_op(&name);
                self.insert_op_alloc(attractor, alloc)?;
                self.insert_op_alloc(op, alloc)?;
                attractors.push(attractor);
            }
        }
        for (&a, &b) in attractors.iter().tuple_windows() {
            self.insert_constraint(a, b)?;
        }
        if let Some(&last) = attractors.last() {
            for x in inputs {
                self.insert_constraint(last, x)?;
            }
        }

        Ok(())
    }
    //---END BUILD API---

    //---START EDITS---
    pub fn remove_constraint(&mut self, from: OpAddress, to: OpAddress) -> ShiftResult<()> {
        self.check_op(from)?;
        self.check_op(to)?;
        if self.ops[from.0].fwd_link == Some(to) {
            return Err(ShiftError::LinkConflict {
                before:     from,
                after:      to,
                message:    String::from("cannot remove the constraint underlying a link"),
            });
        }
        self.ops[from.0].remove_out(to);
        self.ops[to.0].remove_in(from);

        Ok(())
    }

    /// Detaches `alloc` from all of its ops. The alloc itself stays,
    /// so no address is invalidated.
    pub fn disconnect_alloc(&mut self, alloc: AllocAddress) -> ShiftResult<()> {
        self.check_alloc(alloc)?;
        let ops = std::mem::take(&mut self.allocs[alloc.0].ops);
        for op in ops {
            self.ops[op.0].remove_alloc(alloc);
        }

        Ok(())
    }

    /// Adds the ops of `keep` to `alloc` and removes those of `remove`.
    pub fn update(
        &mut self,
        alloc:  AllocAddress,
        keep:   &[OpAddress],
        remove: &[OpAddress],
    ) -> ShiftResult<()> {
        self.check_alloc(alloc)?;
        for &op in remove {
            self.check_op(op)?;
            self.ops[op.0].remove_alloc(alloc);
            self.allocs[alloc.0].remove_op(op);
        }
        self.insert_op_allocs(keep, alloc)
    }

    pub fn update_weight(&mut self, alloc: AllocAddress, w: AllocWeight) -> ShiftResult<()> {
        self.check_alloc(alloc)?;
        self.allocs[alloc.0].weight = w;

        Ok(())
    }
    //---END EDITS---

    //---START QUERIES---
    pub fn get_forward_edges(&self) -> Edges {
        self.ops.iter()
            .map(|op| op.outs.clone())
            .collect()
    }

    pub fn get_input_ops(&self) -> Vec<OpAddress> {
        self.ops.iter()
            .filter(|op| op.ins.is_empty())
            .map(|op| op.address)
            .collect()
    }

    /// All ops whose set of ins is exactly that of `a`, `a` included.
    pub fn get_identical_ins(&self, a: OpAddress) -> Vec<OpAddress> {
        let ins = &self.ops[a.0].ins;
        match ins.first() {
            None        => self.get_input_ops(),
            Some(&in0)  => {
                self.ops[in0.0].outs.iter()
                    .copied()
                    .filter(|out| self.ops[out.0].ins == *ins)
                    .collect()
            }
        }
    }

    pub fn n_constraints(&self) -> usize {
        self.ops.iter().map(|op| op.outs.len()).sum()
    }

    pub fn n_links(&self) -> usize {
        self.ops.iter().filter(|op| op.fwd_link.is_some()).count()
    }

    pub fn get_ops_with_fwd_links(&self) -> Vec<OpAddress> {
        self.ops.iter()
            .filter(|op| op.fwd_link.is_some())
            .map(|op| op.address)
            .collect()
    }

    pub fn get_fwd_links(&self) -> Vec<(OpAddress, OpAddress)> {
        self.ops.iter()
            .filter_map(|op| op.fwd_link.map(|to| (op.address, to)))
            .collect()
    }

    /// Maximal chains of linked ops. Every chain has at least 2 ops.
    pub fn get_link_chains(&self) -> Vec<OpChain> {
        let mut res = vec![];
        for op in self.ops.iter().filter(|op| op.fwd_link.is_some() && op.bwd_link.is_none()) {
            let mut chain = vec![op.address];
            let mut current = op.address;
            while let Some(nxt) = self.ops[current.0].fwd_link {
                chain.push(nxt);
                current = nxt;
            }
            res.push(chain);
        }

        res
    }

    /// Pairs `(a, b)` where `b` is the only out of `a` and `a` the only
    /// in of `b`: whatever the schedule, nothing is gained by putting
    /// anything between them.
    pub fn get_tight_pairs(&self) -> Vec<(OpAddress, OpAddress)> {
        self.ops.iter()
            .filter_map(|op| self.tight_successor(op.address).map(|b| (op.address, b)))
            .collect()
    }

    #[inline(always)]
    fn tight_successor(&self, a: OpAddress) -> Option<OpAddress> {
        let op = &self.ops[a.0];
        if op.outs.len() == 1 && self.ops[op.outs[0].0].ins.len() == 1 {
            Some(op.outs[0])
        } else { None }
    }

    #[inline(always)]
    fn tight_predecessor(&self, b: OpAddress) -> Option<OpAddress> {
        let op = &self.ops[b.0];
        if op.ins.len() == 1 && self.ops[op.ins[0].0].outs.len() == 1 {
            Some(op.ins[0])
        } else { None }
    }

    /// The longest chain of tight pairs starting at `a`.
    pub fn tight_chain_from(&self, a: OpAddress) -> OpChain {
        let mut chain = vec![a];
        let mut current = a;
        while let Some(nxt) = self.tight_successor(current) {
            chain.push(nxt);
            current = nxt;
        }

        chain
    }

    /// Maximal tight chains, each with at least 2 ops.
    pub fn get_tight_chains(&self) -> Vec<OpChain> {
        self.ops.iter()
            .map(|op| op.address)
            .filter(|&a| self.tight_successor(a).is_some() && self.tight_predecessor(a).is_none())
            .map(|a| self.tight_chain_from(a))
            .collect()
    }

    /// Ops connected through shared allocs end up in the same
    /// partition. Ops with no allocs are partitions of their own.
    pub fn get_alloc_partitioned(&self) -> Vec<OpChain> {
        let mut adj: Vec<Vec<usize>> = vec![vec![]; self.n_ops()];
        for alloc in &self.allocs {
            for (a, b) in alloc.ops.iter().tuple_windows() {
                adj[a.0].push(b.0);
            }
        }

        undirected_components(self.n_ops(), &adj)
            .into_iter()
            .map(|c| c.into_iter().map(OpAddress).collect())
            .collect()
    }

    /// Like [Graph::get_alloc_partitioned], but partitions which are
    /// mutually constrained are merged, and the resulting bins are in
    /// an order compatible with every constraint.
    pub fn get_alloc_partitioned_bins(&self) -> Vec<OpChain> {
        let parts = self.get_alloc_partitioned();
        let mut op_to_part = vec![0; self.n_ops()];
        for (pi, part) in parts.iter().enumerate() {
            for op in part {
                op_to_part[op.0] = pi;
            }
        }
        let mut super_edges: Vec<Vec<usize>> = vec![vec![]; parts.len()];
        for op in &self.ops {
            for out in &op.outs {
                let (p0, p1) = (op_to_part[op.address.0], op_to_part[out.0]);
                if p0 != p1 {
                    super_edges[p0].push(p1);
                }
            }
        }
        super_edges.iter_mut().for_each(|e| {
            e.sort_unstable();
            e.dedup();
        });

        tarjan(&super_edges)
            .into_iter()
            .map(|scc| {
                scc.into_iter()
                    .flat_map(|pi| parts[pi].iter().copied())
                    .sorted()
                    .collect()
            })
            .collect()
    }

    /// Edges of `self` which are absent from `rhs`.
    pub fn constraint_diff(&self, rhs: &Graph) -> ShiftResult<Edges> {
        if self.n_ops() != rhs.n_ops() {
            return Err(ShiftError::InvalidArgument(format!(
                "Cannot diff graphs with {} and {} ops", self.n_ops(), rhs.n_ops()
            )));
        }
        let res = self.ops.iter()
            .zip(rhs.ops.iter())
            .map(|(l, r)| {
                l.outs.iter()
                    .copied()
                    .filter(|o| !r.has_out(*o))
                    .collect()
            })
            .collect();

        Ok(res)
    }
    //---END QUERIES---

    //---START MERGING---
    /// Builds a child graph in which each chain of `chains` becomes a
    /// single op. Chain ops take the lowest child addresses, in the
    /// order of `chains`; every other op follows in ascending order.
    ///
    /// Returns the child and, for each child op, its parents.
    pub fn get_merged(&self, chains: &[OpChain]) -> ShiftResult<(Graph, Vec<OpChain>)> {
        let mut parent_to_child: Vec<Option<OpAddress>> = vec![None; self.n_ops()];
        let mut child_to_parents: Vec<OpChain> = vec![];
        for chain in chains {
            let child = OpAddress(child_to_parents.len());
            for &p in chain {
                self.check_op(p)?;
                if parent_to_child[p.0].is_some() {
                    return Err(ShiftError::DuplicateAddress(p));
                }
                parent_to_child[p.0] = Some(child);
            }
            child_to_parents.push(chain.clone());
        }
        for op in &self.ops {
            if parent_to_child[op.address.0].is_none() {
                parent_to_child[op.address.0] = Some(OpAddress(child_to_parents.len()));
                child_to_parents.push(vec![op.address]);
            }
        }
        let p2c = |p: OpAddress| parent_to_child[p.0].unwrap_or_default();

        let mut child = Graph::new();
        for parents in &child_to_parents {
            if parents.len() == 1 {
                child.insert_op(&self.ops[parents[0].0].debug_name);
            } else {
                let name = format!(
                    "({})",
                    parents.iter().map(|p| self.ops[p.0].debug_name.as_str()).join(" ")
                );
                child.insert_op(&name);
            }
        }
        for alloc in &self.allocs {
            let a = child.insert_alloc(alloc.weight);
            for &op in &alloc.ops {
                child.insert_op_alloc(p2c(op), a)?;
            }
        }
        for (ci, parents) in child_to_parents.iter().enumerate() {
            let c = OpAddress(ci);
            for p in parents {
                for &out in &self.ops[p.0].outs {
                    if p2c(out) != c {
                        child.insert_constraint(c, p2c(out))?;
                    }
                }
            }
        }
        for (from, to) in self.get_fwd_links() {
            if p2c(from) != p2c(to) {
                child.insert_link(p2c(from), p2c(to))?;
            }
        }

        Ok((child, child_to_parents))
    }

    /// Every link chain collapses into a single op.
    pub fn get_link_merged(&self) -> ShiftResult<(Graph, Vec<OpChain>)> {
        self.get_merged(&self.get_link_chains())
    }

    /// Every tight chain collapses into a single op.
    pub fn get_tight_merged(&self) -> ShiftResult<(Graph, Vec<OpChain>)> {
        self.get_merged(&self.get_tight_chains())
    }
    //---END MERGING---

    //---START COMPARISON---
    pub fn equal_to(&self, rhs: &Graph, include_names: bool) -> bool {
        self.cmp_with(rhs, include_names) == Ordering::Equal
    }

    pub fn less_than(&self, rhs: &Graph, include_names: bool) -> bool {
        self.cmp_with(rhs, include_names) == Ordering::Less
    }

    /// A total order over graphs. Weights are compared bit-exactly.
    pub fn cmp_with(&self, rhs: &Graph, include_names: bool) -> Ordering {
        self.n_ops().cmp(&rhs.n_ops())
            .then(self.n_allocs().cmp(&rhs.n_allocs()))
            .then_with(|| {
                self.ops.iter()
                    .zip(rhs.ops.iter())
                    .map(|(l, r)| {
                        let names = if include_names {
                            l.debug_name.cmp(&r.debug_name)
                        } else { Ordering::Equal };
                        l.nameless_key().cmp(&r.nameless_key()).then(names)
                    })
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| {
                self.allocs.iter()
                    .zip(rhs.allocs.iter())
                    .map(|(l, r)| {
                        (l.address, l.weight.to_bits(), &l.ops)
                            .cmp(&(r.address, r.weight.to_bits(), &r.ops))
                    })
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            })
    }

    pub fn hash_with<H: Hasher>(&self, state: &mut H, include_names: bool) {
        self.n_ops().hash(state);
        for op in &self.ops {
            op.nameless_key().hash(state);
            if include_names {
                op.debug_name.hash(state);
            }
        }
        for alloc in &self.allocs {
            (alloc.address, alloc.weight.to_bits(), &alloc.ops).hash(state);
        }
    }

    /// Hash which is invariant to debug names.
    pub fn nameless_hash(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.hash_with(&mut h, false);

        h.finish()
    }
    //---END COMPARISON---
}

impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        self.equal_to(other, true)
    }
}

impl Eq for Graph {}

impl Hash for Graph {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_with(state, true);
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph with {} ops and {} allocs", self.n_ops(), self.n_allocs())?;
        for op in &self.ops {
            write!(f, "  {:>5} {:<24} outs=[{}] allocs=[{}]",
                op.address.0,
                op.debug_name,
                op.outs.iter().join(","),
                op.allocs.iter().join(","),
            )?;
            if let Some(l) = op.fwd_link {
                write!(f, " link->{}", l)?;
            }
            writeln!(f)?;
        }
        for alloc in &self.allocs {
            writeln!(f, "  alloc {:>3} weight={} ops=[{}]",
                alloc.address, alloc.weight, alloc.ops.iter().join(","))?;
        }

        Ok(())
    }
}
