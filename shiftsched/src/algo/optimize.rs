use crate::helpe::*;
use crate::scc::{scc_summary, strongly_connected_components};
use super::{
    simplify::AllocSimplifier,
    constrain::{
        TransitiveClosureConstrainer,
        liveness_change_bounds,
    },
};

/// The individual graph rewrites available to the optimizer.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Serialize, Deserialize)]
pub enum TransitiveClosureOptim {
    SlideLinks,
    LinkTightDrops,
    LinkCloseTightPairs,
    ConstrainWeightSeparatedGroups,
    ConstrainParallelChains,
    CombineAllocsWithCommonOps,
    DisconnectAllocsWithOneOp,
    DisconnectAllocsWithZeroWeight,
    DisconnectInbetweenerAllocs,
    DisconnectFixedDurationAllocs,
    ConnectContiguousAllocs,
}

impl fmt::Display for TransitiveClosureOptim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Which rewrites run before scheduling, and for how many rounds.
///
/// Every rewrite keeps at least one schedule of minimal total liveness
/// in the solution space.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct TransitiveClosureOptimizations {
    pub link_tight_drops:                   bool,
    pub link_close_tight_pairs:             bool,
    pub constrain_weight_separated_groups:  bool,
    pub constrain_parallel_chains:          bool,
    pub combine_allocs_with_common_ops:     bool,
    pub disconnect_allocs_with_one_op:      bool,
    pub disconnect_allocs_with_zero_weight: bool,
    pub disconnect_inbetweener_allocs:      bool,
    pub disconnect_fixed_duration_allocs:   bool,
    pub connect_contiguous_allocs:          bool,
    pub max_iterations:                     usize,
}

impl TransitiveClosureOptimizations {
    fn all(on: bool) -> Self {
        Self {
            link_tight_drops:                   on,
            link_close_tight_pairs:             on,
            constrain_weight_separated_groups:  on,
            constrain_parallel_chains:          on,
            combine_allocs_with_common_ops:     on,
            disconnect_allocs_with_one_op:      on,
            disconnect_allocs_with_zero_weight: on,
            disconnect_inbetweener_allocs:      on,
            disconnect_fixed_duration_allocs:   on,
            connect_contiguous_allocs:          on,
            max_iterations:                     usize::MAX,
        }
    }

    pub fn all_on() -> Self { Self::all(true) }

    pub fn all_off() -> Self { Self::all(false) }

    pub fn with_link_tight_drops(mut self, on: bool) -> Self {
        self.link_tight_drops = on;
        self
    }

    pub fn with_link_close_tight_pairs(mut self, on: bool) -> Self {
        self.link_close_tight_pairs = on;
        self
    }

    pub fn with_constrain_weight_separated_groups(mut self, on: bool) -> Self {
        self.constrain_weight_separated_groups = on;
        self
    }

    pub fn with_constrain_parallel_chains(mut self, on: bool) -> Self {
        self.constrain_parallel_chains = on;
        self
    }

    pub fn with_combine_allocs_with_common_ops(mut self, on: bool) -> Self {
        self.combine_allocs_with_common_ops = on;
        self
    }

    pub fn with_disconnect_allocs_with_one_op(mut self, on: bool) -> Self {
        self.disconnect_allocs_with_one_op = on;
        self
    }

    pub fn with_disconnect_allocs_with_zero_weight(mut self, on: bool) -> Self {
        self.disconnect_allocs_with_zero_weight = on;
        self
    }

    pub fn with_disconnect_inbetweener_allocs(mut self, on: bool) -> Self {
        self.disconnect_inbetweener_allocs = on;
        self
    }

    pub fn with_disconnect_fixed_duration_allocs(mut self, on: bool) -> Self {
        self.disconnect_fixed_duration_allocs = on;
        self
    }

    pub fn with_connect_contiguous_allocs(mut self, on: bool) -> Self {
        self.connect_contiguous_allocs = on;
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    /// The rewrites to run, in order. Sliding links is implied by any
    /// other rewrite and always goes last.
    pub fn enabled(&self) -> Vec<TransitiveClosureOptim> {
        use TransitiveClosureOptim::*;
        let mut res = [
            (self.link_tight_drops,                     LinkTightDrops),
            (self.link_close_tight_pairs,               LinkCloseTightPairs),
            (self.constrain_weight_separated_groups,    ConstrainWeightSeparatedGroups),
            (self.constrain_parallel_chains,            ConstrainParallelChains),
            (self.combine_allocs_with_common_ops,       CombineAllocsWithCommonOps),
            (self.disconnect_allocs_with_one_op,        DisconnectAllocsWithOneOp),
            (self.disconnect_allocs_with_zero_weight,   DisconnectAllocsWithZeroWeight),
            (self.disconnect_inbetweener_allocs,        DisconnectInbetweenerAllocs),
            (self.disconnect_fixed_duration_allocs,     DisconnectFixedDurationAllocs),
            (self.connect_contiguous_allocs,            ConnectContiguousAllocs),
        ].into_iter()
            .filter_map(|(on, o)| on.then_some(o))
            .collect::<Vec<_>>();
        if !res.is_empty() {
            res.push(SlideLinks);
        }

        res
    }
}

impl Default for TransitiveClosureOptimizations {
    fn default() -> Self { Self::all_on() }
}

impl PartialEq for TransitiveClosureOptimizations {
    fn eq(&self, rhs: &Self) -> bool {
        self.enabled() == rhs.enabled()
    }
}

impl fmt::Display for TransitiveClosureOptimizations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] (max {} rounds)", self.enabled().iter().join(", "), self.max_iterations)
    }
}

/// Drives the rewrites in rounds over one graph, keeping a closure
/// and the per-op liveness change bounds in sync with it.
struct TransitiveClosureOptimizer<'a> {
    graph:  &'a mut Graph,
    tc:     TransitiveClosure,
    lower:  Vec<AllocWeight>,
    upper:  Vec<AllocWeight>,
}

impl<'a> TransitiveClosureOptimizer<'a> {
    /// Fails with the cyclic components listed if `graph` has a cycle.
    fn new(graph: &'a mut Graph) -> ShiftResult<Self> {
        let edges = graph.get_forward_edges();
        if strongly_connected_components(&edges).len() != graph.n_ops() {
            return Err(ShiftError::NotSchedulable(format!(
                "there is a cycle in the graph.\n{}",
                scc_summary(&edges, |o| graph.get_op(o).debug_name().to_string())
            )));
        }
        let tc = TransitiveClosure::new(&edges)?;
        let mut res = Self {
            graph,
            tc,
            lower:  vec![],
            upper:  vec![],
        };
        res.finalize()?;

        Ok(res)
    }

    fn finalize(&mut self) -> ShiftResult<()> {
        let redundants = self.tc.get_flattened_redundants(&self.graph.get_forward_edges());
        let mut n_removed = 0;
        for (from, to) in redundants {
            if self.graph.get_op(from).fwd_link() != Some(to) {
                self.graph.remove_constraint(from, to)?;
                n_removed += 1;
            }
        }
        debug!(n_removed, "redundant constraints removed");
        (self.lower, self.upper) = liveness_change_bounds(self.graph, &self.tc);

        Ok(())
    }

    fn refresh(&mut self, prev_edges: &Graph) -> ShiftResult<()> {
        let diff = self.graph.constraint_diff(prev_edges)?;
        let n_new = diff.iter().map(|d| d.len()).sum::<usize>();
        if n_new < self.graph.n_ops() / 10 {
            debug!(n_new, "updating closure");
            self.tc.update(&diff)?;
        } else {
            debug!(n_new, "rebuilding closure");
            self.tc = TransitiveClosure::from_graph(self.graph)?;
        }

        self.finalize()
    }

    #[inline(always)]
    fn constrainer(&mut self) -> TransitiveClosureConstrainer<'_> {
        TransitiveClosureConstrainer::new(self.graph, &self.tc, &self.lower, &self.upper)
    }

    fn apply(&mut self, optim: TransitiveClosureOptim) -> ShiftResult<bool> {
        use TransitiveClosureOptim::*;
        match optim {
            SlideLinks                      => self.constrainer().slide_links(),
            LinkTightDrops                  => self.constrainer().link_tight_drops(),
            LinkCloseTightPairs             => self.constrainer().link_close_tight_pairs(),
            ConstrainWeightSeparatedGroups  => self.constrainer().constrain_weight_separated_groups(),
            ConstrainParallelChains         => self.constrainer().constrain_parallel_chains(),
            CombineAllocsWithCommonOps      => AllocSimplifier::combine_allocs_with_common_ops(self.graph),
            DisconnectAllocsWithOneOp       => AllocSimplifier::disconnect_allocs_with_one_op(self.graph),
            DisconnectAllocsWithZeroWeight  => AllocSimplifier::disconnect_allocs_with_zero_weight(self.graph),
            DisconnectInbetweenerAllocs     => AllocSimplifier::disconnect_inbetweener_allocs(self.graph, &self.tc),
            DisconnectFixedDurationAllocs   => AllocSimplifier::disconnect_fixed_duration_allocs(self.graph, &self.tc),
            ConnectContiguousAllocs         => AllocSimplifier::connect_contiguous_allocs(self.graph, &self.tc),
        }
    }
}

/// Runs the enabled rewrites of `tcos` on `graph` until a round with
/// every rewrite changes nothing, or `tcos.max_iterations` rounds ran.
///
/// A rewrite which changed the graph runs again next round. When no
/// rewrite (or a single one) changed anything, the next round runs
/// them all.
pub fn optimize(graph: &mut Graph, tcos: &TransitiveClosureOptimizations) -> ShiftResult<()> {
    let all_to_run = tcos.enabled();
    if all_to_run.is_empty() {
        return Ok(());
    }
    let _span = info_span!("optimize").entered();
    let start = Instant::now();
    let (n_constraints, n_links) = (graph.n_constraints(), graph.n_links());

    let mut optimizer = TransitiveClosureOptimizer::new(graph)?;
    let mut next_round = all_to_run.clone();
    let mut iteration = 0;
    let mut changed = true;
    while changed && iteration < tcos.max_iterations {
        let this_round = std::mem::take(&mut next_round);
        debug!(iteration, round = %this_round.iter().join(", "), "optimization round");
        let snapshot = optimizer.graph.clone();
        for &optim in &this_round {
            if optimizer.apply(optim)? {
                next_round.push(optim);
            }
        }

        if next_round.is_empty() {
            if this_round.len() == all_to_run.len() {
                changed = false;
            } else {
                next_round = all_to_run.clone();
            }
        }
        if next_round.len() == 1 {
            next_round = all_to_run.clone();
        }
        iteration += 1;
        if changed && iteration < tcos.max_iterations {
            optimizer.refresh(&snapshot)?;
        }
    }

    info!(
        rounds = iteration,
        constraints_before = n_constraints,
        constraints_after = optimizer.graph.n_constraints(),
        links_before = n_links,
        links_after = optimizer.graph.n_links(),
        elapsed_us = start.elapsed().as_micros() as u64,
        "graph optimized"
    );

    Ok(())
}
