use rand::{rngs::StdRng, SeedableRng, seq::SliceRandom};

use crate::helpe::*;
use crate::weight::N_SLOTS;
use crate::kahn::kahn;
use super::{
    RotationOutcome,
    Settings,
    optimize::optimize,
};

/// First position of `v` (sorted) holding a value `>= x`.
#[inline(always)]
fn lower_bound(v: &[ScheduleIndex], x: isize) -> usize {
    v.partition_point(|&y| (y as isize) < x)
}

/// Sorted union of `f(i)` for `i` in `[start, end)`.
fn in_range<T, F>(start: isize, end: isize, f: F) -> Vec<T>
where
    T: Copy + Ord,
    F: Fn(usize) -> Vec<T>,
{
    (start.max(0)..end)
        .flat_map(|i| f(i as usize))
        .sorted_unstable()
        .dedup()
        .collect()
}

/// Moving the block `[start0, start0 + n_to_shift)` so that it begins at
/// `start1`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ScheduleChange {
    pub start0:     isize,
    pub start1:     isize,
    pub n_to_shift: isize,
}

impl ScheduleChange {
    /// The same permutation expressed as a forward move.
    #[inline(always)]
    fn canonical(&self) -> Self {
        if self.start1 < self.start0 {
            Self {
                start0:     self.start1,
                start1:     self.start1 + self.n_to_shift,
                n_to_shift: self.start0 - self.start1,
            }
        } else { *self }
    }
}

/// A proposed shift and the change in total liveness it brings.
#[derive(Copy, Clone, PartialEq, Debug)]
struct ShiftAndCost {
    shift:  isize,
    cost:   AllocWeight,
}

#[derive(Copy, Clone, Debug, Default)]
struct RippleRecord {
    entry_time:     isize,
    entry_weight:   AllocWeight,
    incr_weight:    AllocWeight,
    live:           bool,
}

/// A [Graph] together with one of its schedules and every index the
/// rotation search needs to evaluate moves quickly.
///
/// The graph held is the one actually scheduled: the rewrites enabled
/// in [Settings::tcos] have been applied to it.
#[derive(Debug, Clone)]
pub struct ScheduledGraph {
    graph:              Graph,
    sch_to_op:          Vec<OpAddress>,
    op_to_sch:          Vec<ScheduleIndex>,
    // Sorted schedule indices of the ops of each alloc
    alloc_to_sch:       Vec<Vec<ScheduleIndex>>,
    sch_to_allocs:      Vec<Vec<AllocAddress>>,
    // Sorted schedule indices of the ins (outs) of each op
    op_to_in_sch:       Vec<Vec<ScheduleIndex>>,
    op_to_out_sch:      Vec<Vec<ScheduleIndex>>,
    sch_to_liveness:    Option<Vec<AllocWeight>>,
    // How far the window starting at each index can move
    n_can_fwd:          Vec<isize>,
    n_can_bwd:          Vec<isize>,
    susceptible:        Vec<bool>,
    from_cache:         bool,
    outcome:            RotationOutcome,
}

impl ScheduledGraph {
    /// The full pipeline: graph rewrites, an initial Kahn schedule and
    /// then rotations until `settings.rotation_termination` fires.
    pub fn new(mut graph: Graph, settings: &Settings) -> ShiftResult<Self> {
        let start = Instant::now();
        info!(
            n_ops = graph.n_ops(),
            n_allocs = graph.n_allocs(),
            n_constraints = graph.n_constraints(),
            "scheduling graph"
        );

        optimize(&mut graph, &settings.tcos)?;

        let schedule = {
            let _span = info_span!("kahn").entered();
            let t = Instant::now();
            let s = kahn(&graph, &settings.kahn_decider, settings.seed, ErrorIfCycle::Yes)?;
            info!(
                tie_breaker = %settings.kahn_decider.tie_breaker,
                elapsed_us = t.elapsed().as_micros() as u64,
                "initial schedule ready"
            );
            s
        };

        let mut res = Self::from_schedule(graph, schedule)?;
        res.greedy_rotate(settings)?;
        info!(elapsed_us = start.elapsed().as_micros() as u64, "scheduling complete");

        Ok(res)
    }

    /// Wraps an existing schedule of `graph`, which is checked for
    /// validity. No rewriting and no rotation happen.
    pub fn from_schedule(graph: Graph, schedule: Vec<OpAddress>) -> ShiftResult<Self> {
        let n_ops = graph.n_ops();
        if schedule.len() != n_ops {
            return Err(ShiftError::InvalidArgument(format!(
                "Schedule has {} entries, the graph has {} ops", schedule.len(), n_ops
            )));
        }
        let mut op_to_sch = vec![usize::MAX; n_ops];
        for (i, &op) in schedule.iter().enumerate() {
            graph.check_op(op)?;
            if op_to_sch[op.0] != usize::MAX {
                return Err(ShiftError::DuplicateAddress(op));
            }
            op_to_sch[op.0] = i;
        }

        let mut res = Self {
            sch_to_allocs:      schedule.iter().map(|&op| graph.get_op(op).allocs().to_vec()).collect(),
            alloc_to_sch:       vec![vec![]; graph.n_allocs()],
            op_to_in_sch:       vec![vec![]; n_ops],
            op_to_out_sch:      vec![vec![]; n_ops],
            sch_to_liveness:    None,
            n_can_fwd:          vec![],
            n_can_bwd:          vec![],
            susceptible:        vec![],
            from_cache:         false,
            outcome:            RotationOutcome::NotRun,
            sch_to_op:          schedule,
            op_to_sch,
            graph,
        };
        for a in (0..res.graph.n_allocs()).map(AllocAddress) {
            res.set_alloc_to_sch(a);
        }
        for op in (0..n_ops).map(OpAddress) {
            res.set_op_to_in_sch(op);
            res.set_op_to_out_sch(op);
        }
        res.assert_correctness()?;
        res.set_sch_to_liveness();
        res.set_can_can(1);

        Ok(res)
    }

    pub(crate) fn mark_from_cache(&mut self) { self.from_cache = true; }

    //---START QUERIES---
    #[inline(always)]
    pub fn n_ops(&self) -> usize { self.graph.n_ops() }

    pub fn get_graph(&self) -> &Graph { &self.graph }

    pub fn get_schedule(&self) -> &[OpAddress] { &self.sch_to_op }

    #[inline(always)]
    fn check_index(&self, i: ScheduleIndex) -> ShiftResult<()> {
        if i >= self.n_ops() {
            return Err(ShiftError::InvalidArgument(format!(
                "Schedule index {} is out of range, there are only {} ops", i, self.n_ops()
            )));
        }

        Ok(())
    }

    pub fn schedule_to_op(&self, i: ScheduleIndex) -> ShiftResult<OpAddress> {
        self.check_index(i)?;
        Ok(self.sch_to_op[i])
    }

    pub fn op_to_schedule(&self, a: OpAddress) -> ShiftResult<ScheduleIndex> {
        self.graph.check_op(a)?;
        Ok(self.op_to_sch[a.0])
    }

    /// Sorted schedule indices of the ops of `a`.
    pub fn alloc_to_schedule(&self, a: AllocAddress) -> &[ScheduleIndex] { &self.alloc_to_sch[a.0] }

    pub fn schedule_to_allocs(&self, i: ScheduleIndex) -> &[AllocAddress] { &self.sch_to_allocs[i] }

    pub fn is_from_cache(&self) -> bool { self.from_cache }

    pub fn rotation_outcome(&self) -> RotationOutcome { self.outcome }

    /// The ops of `subset`, in the order they are scheduled.
    pub fn get_sub_schedule(&self, subset: &[OpAddress]) -> ShiftResult<Vec<OpAddress>> {
        let mut at: Vec<Option<OpAddress>> = vec![None; self.n_ops()];
        for &op in subset {
            self.graph.check_op(op)?;
            let slot = &mut at[self.op_to_sch[op.0]];
            if slot.is_some() {
                return Err(ShiftError::DuplicateAddress(op));
            }
            *slot = Some(op);
        }

        Ok(at.into_iter().flatten().collect())
    }

    pub fn schedule_to_liveness(&self, i: ScheduleIndex) -> ShiftResult<AllocWeight> {
        self.check_index(i)?;
        self.sch_to_liveness.as_ref()
            .ok_or(ShiftError::NotReady("liveness"))
            .map(|l| l[i])
    }

    pub fn get_liveness(&self) -> ShiftResult<&[AllocWeight]> {
        self.sch_to_liveness.as_deref().ok_or(ShiftError::NotReady("liveness"))
    }

    pub fn get_max_liveness(&self) -> ShiftResult<AllocWeight> {
        Ok(self.get_liveness()?
            .iter()
            .fold(AllocWeight::zero(), |acc, &l| if l > acc { l } else { acc }))
    }

    pub fn get_sum_liveness(&self) -> ShiftResult<AllocWeight> {
        Ok(self.get_liveness()?.iter().copied().sum())
    }

    /// One row per schedule index: name, schedule indices of ins and
    /// outs, `+` when linked forward, allocs and liveness.
    pub fn get_liveness_string(&self) -> String {
        let fmt_list = |v: &[usize]| format!("({})", v.iter().join(","));
        let headers = ["Index", "Name", "Ins", "LinkTo", "Outs", "Allocs", "Liveness"];
        let rows = (0..self.n_ops())
            .map(|i| {
                let op = self.graph.get_op(self.sch_to_op[i]);
                [
                    i.to_string(),
                    op.debug_name().to_string(),
                    fmt_list(&self.op_to_in_sch[op.address().0]),
                    String::from(if op.has_fwd_link() { "+" } else { " " }),
                    fmt_list(&self.op_to_out_sch[op.address().0]),
                    format!("({})", self.sch_to_allocs[i].iter().join(",")),
                    self.sch_to_liveness.as_ref().map_or(String::from("?"), |l| l[i].to_string()),
                ]
            })
            .collect::<Vec<_>>();
        let widths = (0..headers.len())
            .map(|c| rows.iter().map(|r| r[c].len()).chain([headers[c].len()]).max().unwrap_or(0))
            .collect::<Vec<_>>();

        let mut res = String::new();
        let mut push_row = |cells: &[String]| {
            for (cell, w) in cells.iter().zip(widths.iter()) {
                res.push_str(&format!("{:<width$}  ", cell, width = w));
            }
            res.push('\n');
        };
        push_row(&headers.map(String::from));
        push_row(&widths.iter().map(|&w| "-".repeat(w)).collect::<Vec<_>>());
        for r in &rows {
            push_row(r);
        }

        res
    }
    //---END QUERIES---

    //---START INDEX MAINTENANCE---
    fn set_op_to_in_sch(&mut self, op: OpAddress) {
        let mut v = self.graph.get_op(op).ins().iter().map(|i| self.op_to_sch[i.0]).collect::<Vec<_>>();
        v.sort_unstable();
        self.op_to_in_sch[op.0] = v;
    }

    fn set_op_to_out_sch(&mut self, op: OpAddress) {
        let mut v = self.graph.get_op(op).outs().iter().map(|o| self.op_to_sch[o.0]).collect::<Vec<_>>();
        v.sort_unstable();
        self.op_to_out_sch[op.0] = v;
    }

    fn set_alloc_to_sch(&mut self, a: AllocAddress) {
        let mut v = self.graph.get_alloc(a).ops().iter().map(|o| self.op_to_sch[o.0]).collect::<Vec<_>>();
        v.sort_unstable();
        self.alloc_to_sch[a.0] = v;
    }

    fn set_sch_to_liveness(&mut self) {
        let n = self.n_ops();
        let mut delta = vec![AllocWeight::zero(); n + 1];
        for (a, sch) in self.alloc_to_sch.iter().enumerate().filter(|(_, s)| !s.is_empty()) {
            let w = self.graph.get_alloc(AllocAddress(a)).weight();
            delta[sch[0]] += w;
            delta[sch[sch.len() - 1] + 1] -= w;
        }
        let mut running = AllocWeight::zero();
        self.sch_to_liveness = Some(
            delta[..n].iter()
                .map(|&d| {
                    running += d;
                    running
                })
                .collect()
        );
    }

    /// Largest schedule index below `start` of an in of the window
    /// `[start, start + n)`, or `-1`.
    fn last_producer(&self, start: isize, n: isize) -> isize {
        let mut lower = -1;
        for i in start..start + n {
            let ins = &self.op_to_in_sch[self.sch_to_op[i as usize].0];
            let x = lower_bound(ins, start);
            if x != 0 {
                lower = lower.max(ins[x - 1] as isize);
            }
        }

        lower
    }

    /// Smallest schedule index at or after `start + n` of an out of the
    /// window `[start, start + n)`, or the number of ops.
    fn first_consumer(&self, start: isize, n: isize) -> isize {
        let mut upper = self.n_ops() as isize;
        for i in start..start + n {
            let outs = &self.op_to_out_sch[self.sch_to_op[i as usize].0];
            let x = lower_bound(outs, start + n);
            if x != outs.len() {
                upper = upper.min(outs[x] as isize);
            }
        }

        upper
    }

    fn set_can_can(&mut self, n: isize) {
        let n_starts = (self.n_ops() as isize - n + 1).max(0);
        self.n_can_bwd = (0..n_starts).map(|i| i - self.last_producer(i, n) - 1).collect();
        self.n_can_fwd = (0..n_starts).map(|i| self.first_consumer(i, n) - i - n).collect();
    }

    /// Moves the reach tables from windows of `old_n` to windows of
    /// `n`. Growing by one is done in place.
    fn update_can_can(&mut self, old_n: isize, n: isize) {
        if n - old_n != 1 {
            self.set_can_can(n);
            return;
        }
        if !self.n_can_fwd.is_empty() {
            self.n_can_fwd.pop();
            self.n_can_bwd.pop();
        }
        let n_ops = self.n_ops() as isize;
        for i in 0..(n_ops - n + 1).max(0) {
            let iu = i as usize;
            let first = self.sch_to_op[iu];
            let last = self.sch_to_op[(i + n - 1) as usize];

            let ins = &self.op_to_in_sch[last.0];
            let x = lower_bound(ins, i);
            if x != 0 {
                self.n_can_bwd[iu] = self.n_can_bwd[iu].min(i - 1 - ins[x - 1] as isize);
            }

            if i == n_ops - n {
                self.n_can_fwd[iu] = 0;
            } else {
                self.n_can_fwd[iu] = self.n_can_fwd[iu + 1];
                let outs = &self.op_to_out_sch[first.0];
                let x = lower_bound(outs, i + n);
                if x != outs.len() {
                    self.n_can_fwd[iu] = self.n_can_fwd[iu].min(outs[x] as isize - (i + n));
                }
            }
        }
    }

    fn alloc_addresses(&self, start: isize, end: isize) -> Vec<AllocAddress> {
        in_range(start, end, |i| self.sch_to_allocs[i].clone())
    }

    fn all_ins_in_range(&self, start: isize, end: isize) -> Vec<OpAddress> {
        in_range(start, end, |i| self.graph.get_op(self.sch_to_op[i]).ins().to_vec())
    }

    fn all_outs_in_range(&self, start: isize, end: isize) -> Vec<OpAddress> {
        in_range(start, end, |i| self.graph.get_op(self.sch_to_op[i]).outs().to_vec())
    }
    //---END INDEX MAINTENANCE---

    /// Checks every index against the schedule, and the schedule
    /// against every constraint and link.
    pub fn assert_correctness(&self) -> ShiftResult<()> {
        let broken = |what: String| Err(ShiftError::InvalidArgument(what));
        for (i, op) in self.sch_to_op.iter().enumerate() {
            if self.op_to_sch[op.0] != i {
                return broken(format!("schedule index {} and op {} disagree", i, op));
            }
        }
        for op in self.graph.ops() {
            let at = self.op_to_sch[op.address().0];
            for inn in op.ins() {
                if self.op_to_sch[inn.0] >= at {
                    return broken(format!(
                        "op {} is scheduled at {}, but its in {} is at {}",
                        op.address(), at, inn, self.op_to_sch[inn.0]
                    ));
                }
                if self.op_to_in_sch[op.address().0].binary_search(&self.op_to_sch[inn.0]).is_err() {
                    return broken(format!("stale in schedule of op {}", op.address()));
                }
            }
            for out in op.outs() {
                if self.op_to_out_sch[op.address().0].binary_search(&self.op_to_sch[out.0]).is_err() {
                    return broken(format!("stale out schedule of op {}", op.address()));
                }
            }
            if let Some(l) = op.fwd_link() {
                if self.op_to_sch[l.0] != at + 1 {
                    return broken(format!("link {} => {} is not satisfied", op.address(), l));
                }
            }
        }

        Ok(())
    }

    //---START COSTS---
    /// The change in liveness of `a` if the block `[start0, start0 +
    /// n)` moves to `start1`.
    fn shift_cost(&self, start0: isize, start1: isize, n: isize, a: AllocAddress) -> AllocWeight {
        let (start0, start1, n) = if start1 < start0 {
            (start1, start1 + n, start0 - start1)
        } else { (start0, start1, n) };

        // . . . . x x x x x o o o , , , ,
        //         x0        o0    o1
        let x0 = start0;
        let o0 = start0 + n;
        let o1 = start1 + n;
        let fwd_shift = (start1 - start0) as f64;
        let bwd_shift = n as f64;

        let w = self.graph.get_alloc(a).weight();
        let indices = &self.alloc_to_sch[a.0];
        let a0 = indices[0] as isize;
        let a1 = indices[indices.len() - 1] as isize;

        // Where {a0, a1} fall among pre (.), x, o and post (,).
        if a1 < x0 || o1 <= a0 || (a0 < x0 && o1 <= a1) {
            AllocWeight::zero()
        } else if (x0 <= a0 && a1 < o0) || (o0 <= a0 && a1 < o1) {
            AllocWeight::zero()
        } else if a0 < x0 && x0 <= a1 && a1 < o0 {
            w * fwd_shift
        } else if o0 <= a0 && a0 < o1 && o1 <= a1 {
            w * bwd_shift
        } else {
            // .o, xo and x, all have at least one index at or after o0.
            let first_post_x = lower_bound(indices, o0);
            let at_first_post_x = indices[first_post_x] as isize;
            let last_pre_o = indices[first_post_x - 1] as isize;
            if a0 < x0 {
                if last_pre_o < x0 {
                    w * -bwd_shift
                } else {
                    w * (((last_pre_o - x0 + o1 - o0) - (a1 - x0)) as f64)
                }
            } else if a1 < o1 {
                let before = a1 - a0 + 1;
                let after = o1 - x0 - (at_first_post_x - last_pre_o) + 1;
                w * ((after - before) as f64)
            } else if at_first_post_x < o1 {
                w * (((a0 - x0) - (at_first_post_x - o0)) as f64)
            } else {
                w * -fwd_shift
            }
        }
    }

    /// Costs of moving the block `[start0, start0 + n)` by 1, 2, ...
    /// positions in the direction `sign`, each computed from the last.
    fn ripple_costs(
        &self,
        scratch:    &mut [RippleRecord],
        start0:     isize,
        n:          isize,
        sign:       isize,
        n_costs:    isize,
        dir_offset: isize,
    ) -> Vec<AllocWeight> {
        let bound_end = n_costs + sign * start0 + 1;
        let mut costs = Vec::with_capacity(n_costs.max(0) as usize);
        let mut w = AllocWeight::zero();
        let mut to_increment = AllocWeight::zero();
        let mut touched = vec![];

        let (x0, o0) = (start0, start0 + n);
        for a in self.alloc_addresses(x0, o0) {
            let indices = &self.alloc_to_sch[a.0];
            let first_x = lower_bound(indices, x0);
            let first_o = first_x + lower_bound(&indices[first_x..], o0);
            let is_pre = (first_x != 0) as isize;
            let is_post = (first_o != indices.len()) as isize;
            let w_incr = self.graph.get_alloc(a).weight() * ((sign * (is_pre - is_post)) as f64);
            touched.push(a);
            scratch[a.0] = RippleRecord {
                entry_time:     start0,
                entry_weight:   AllocWeight::zero(),
                incr_weight:    w_incr,
                live:           true,
            };
            to_increment += w_incr;
        }

        let mut start1 = start0 + sign;
        while sign * start1 < bound_end {
            let entering = &self.sch_to_allocs[(start1 + dir_offset) as usize];
            for a in entering.iter().filter(|a| scratch[a.0].live) {
                let r = scratch[a.0];
                w -= r.entry_weight;
                w -= r.incr_weight * ((sign * (start1 - r.entry_time) - 1) as f64);
                to_increment -= r.incr_weight;
            }
            w += to_increment;

            for &a in entering {
                let part = self.shift_cost(start0, start1, n, a);
                let indices = &self.alloc_to_sch[a.0];
                let extremum = if sign == -1 { indices[0] } else { indices[indices.len() - 1] } as isize;
                let post0 = lower_bound(indices, start0);
                let new_incr = if post0 != indices.len()
                    && (indices[post0] as isize) - start0 < n
                    && extremum == start1 + dir_offset {
                    self.graph.get_alloc(a).weight()
                } else { AllocWeight::zero() };

                if !scratch[a.0].live {
                    touched.push(a);
                }
                scratch[a.0] = RippleRecord {
                    entry_time:     start1,
                    entry_weight:   part,
                    incr_weight:    new_incr,
                    live:           true,
                };
                w += part;
                to_increment += new_incr;
            }

            costs.push(w);
            start1 += sign;
        }

        for a in touched {
            scratch[a.0].live = false;
        }

        costs
    }

    /// Whether moving `[start0, start0 + n)` to `start1` keeps every
    /// link chain whole.
    #[inline(always)]
    fn is_link_preserving(&self, start0: isize, start1: isize, n: isize) -> bool {
        let x0 = start0;
        let o0 = start0 + n;
        let o1 = start1 + n;
        let op_at = |i: isize| self.graph.get_op(self.sch_to_op[i as usize]);

        !(op_at(x0).has_bwd_link()
            || op_at(o0 - 1).has_fwd_link()
            || op_at(o0).has_bwd_link()
            || op_at(o1 - 1).has_fwd_link())
    }

    fn best_shift_ripple(&self, scratch: &mut [RippleRecord], start: isize, n: isize) -> ShiftAndCost {
        let mut best = ShiftAndCost { shift: 0, cost: AllocWeight::zero() };
        let iu = start as usize;

        // Moves of fewer than n positions are moves of the neighbouring
        // block, considered at a smaller window size.
        if self.n_can_bwd[iu] >= n {
            let last_producer = start - self.n_can_bwd[iu] - 1;
            let costs = self.ripple_costs(scratch, start, n, -1, start - last_producer - 1, 0);
            for proposed in last_producer + 1..start {
                let cost = costs[(start - 1 - proposed) as usize];
                if cost < best.cost && self.is_link_preserving(proposed, proposed + n, start - proposed) {
                    best = ShiftAndCost { shift: proposed - start, cost };
                }
            }
        }

        if self.n_can_fwd[iu] >= n {
            let first_consumer = start + self.n_can_fwd[iu] + n;
            let costs = self.ripple_costs(scratch, start, n, 1, first_consumer - n - start, n - 1);
            for (i, &cost) in costs.iter().enumerate() {
                let shift = i as isize + 1;
                if cost < best.cost && self.is_link_preserving(start, start + shift, n) {
                    best = ShiftAndCost { shift, cost };
                }
            }
        }

        best
    }

    /// Sum over allocs of weight times span, for schedule `o2s`.
    fn total_liveness(&self, o2s: &[ScheduleIndex]) -> AllocWeight {
        self.graph.allocs().iter()
            .filter(|a| a.n_ops() > 0)
            .map(|a| {
                let (lo, hi) = a.ops().iter()
                    .map(|o| o2s[o.0])
                    .fold((usize::MAX, 0), |(lo, hi), s| (lo.min(s), hi.max(s)));
                a.weight() * ((hi - lo + 1) as f64)
            })
            .sum()
    }

    fn best_shift_simple(&self, start0: isize, n: isize) -> ShiftAndCost {
        let iu = start0 as usize;
        let current = self.total_liveness(&self.op_to_sch);
        let mut best_total = current;
        let mut best_shift = 0;

        let s0 = if self.n_can_bwd[iu] < n { start0 } else { self.last_producer(start0, n) + 1 };
        let s1 = if self.n_can_fwd[iu] < n { start0 } else { self.first_consumer(start0, n) - n + 1 };
        for start1 in s0..s1 {
            let change = ScheduleChange { start0, start1, n_to_shift: n }.canonical();
            let (x0, o0, o1) = (
                change.start0 as usize,
                (change.start0 + change.n_to_shift) as usize,
                (change.start1 + change.n_to_shift) as usize,
            );
            let mut new_sch_to_op = self.sch_to_op.clone();
            new_sch_to_op[x0..o1].rotate_left(o0 - x0);
            let mut new_op_to_sch = vec![0; self.n_ops()];
            for (i, op) in new_sch_to_op.iter().enumerate() {
                new_op_to_sch[op.0] = i;
            }

            let total = self.total_liveness(&new_op_to_sch);
            if total < best_total
                && self.is_link_preserving(change.start0, change.start1, change.n_to_shift) {
                best_total = total;
                best_shift = start1 - start0;
            }
        }

        ShiftAndCost { shift: best_shift, cost: best_total - current }
    }

    fn confirm_shift_and_cost(&self, start0: isize, n: isize, found: ShiftAndCost) -> ShiftResult<()> {
        let simple = self.best_shift_simple(start0, n);
        let close = (simple.cost - found.cost).l1() <= 1e-6 * (1.0 + simple.cost.l1());
        if simple.shift != found.shift || !close {
            return Err(ShiftError::InvalidArgument(format!(
                "Incremental and full rotation costs disagree for start {} and window {}: \
                 ({}, {}) vs ({}, {}). Current state:\n{}",
                start0, n, found.shift, found.cost, simple.shift, simple.cost, self.get_liveness_string()
            )));
        }

        Ok(())
    }
    //---END COSTS---

    //---START MOVES---
    /// Marks ops of `[a, b)` with ins before `a` or outs at or after
    /// `b`, together with those neighbours.
    fn update_susceptible(&mut self, a: isize, b: isize) {
        if self.susceptible.is_empty() {
            return;
        }
        for i in a..b {
            let op = self.sch_to_op[i as usize];
            for inn in self.graph.get_op(op).ins() {
                if (self.op_to_sch[inn.0] as isize) < a {
                    self.susceptible[inn.0] = true;
                    self.susceptible[op.0] = true;
                }
            }
            for out in self.graph.get_op(op).outs() {
                if (self.op_to_sch[out.0] as isize) >= b {
                    self.susceptible[out.0] = true;
                    self.susceptible[op.0] = true;
                }
            }
        }
    }

    fn apply_change(&mut self, change: ScheduleChange) {
        let n2s = change.n_to_shift;
        let canon = change.canonical();
        let x0 = canon.start0;
        let o0 = canon.start0 + canon.n_to_shift;
        let o1 = canon.start1 + canon.n_to_shift;
        let touched_allocs = self.alloc_addresses(x0, o1);

        self.update_susceptible(x0, o0);
        self.update_susceptible(o0, o1);

        let (xu, ou, o1u) = (x0 as usize, o0 as usize, o1 as usize);
        self.sch_to_op[xu..o1u].rotate_left(ou - xu);
        for i in xu..o1u {
            self.op_to_sch[self.sch_to_op[i].0] = i;
        }
        for &a in &touched_allocs {
            self.set_alloc_to_sch(a);
        }
        self.sch_to_allocs[xu..o1u].rotate_left(ou - xu);

        let consumers = self.all_outs_in_range(x0, o1);
        let producers = self.all_ins_in_range(x0, o1);
        for &c in &consumers {
            self.set_op_to_in_sch(c);
        }
        for &p in &producers {
            self.set_op_to_out_sch(p);
        }

        let n_ops = self.n_ops() as isize;

        let start_fwd = producers.iter()
            .fold(x0, |acc, p| acc.min(self.op_to_sch[p.0] as isize));
        let start_fwd = (start_fwd - (n2s + 1)).max(0);
        let end_fwd = o1.min(n_ops - n2s + 1);
        for i in start_fwd..end_fwd {
            self.n_can_fwd[i as usize] = self.first_consumer(i, n2s) - i - n2s;
        }

        let end_bwd = consumers.iter()
            .fold(o1, |acc, c| acc.max(self.op_to_sch[c.0] as isize + 1));
        let start_bwd = (x0 - (n2s + 1)).max(0);
        let end_bwd = end_bwd.min(n_ops - n2s + 1);
        for i in start_bwd..end_bwd {
            self.n_can_bwd[i as usize] = i - self.last_producer(i, n2s) - 1;
        }
    }
    //---END MOVES---

    /// Hill climbing over block moves. Every committed move strictly
    /// lowers the total liveness.
    ///
    /// Windows of size 1 are tried first. A round without any move
    /// since the last reset grows the window by 1; a round without any
    /// move after some progress drops it back to 1.
    fn greedy_rotate(&mut self, settings: &Settings) -> ShiftResult<()> {
        let _span = info_span!("rotate").entered();
        let rt = settings.rotation_termination;
        let algo = settings.rotation_algo;
        let debug_on = settings.debug_mode == DebugMode::On;
        debug!(?algo, debug_mode = ?settings.debug_mode, seed = settings.seed, %rt, "rotation settings");

        let n_ops = self.n_ops() as isize;
        let mut rng = StdRng::seed_from_u64(settings.seed);
        let mut all_ops = (0..self.n_ops()).map(OpAddress).collect::<Vec<_>>();
        all_ops.shuffle(&mut rng);
        let mut scratch = vec![RippleRecord::default(); self.graph.n_allocs()];

        let mut n_to_shift: isize = 1;
        let mut go_on = !rt.is_pre_start();
        self.outcome = if go_on { RotationOutcome::Converged } else { RotationOutcome::NotRun };
        go_on &= n_ops > 0;
        let mut n_changes_total: i64 = 0;
        let mut n_rounds: u64 = 0;
        let mut n_resets: u64 = 0;
        let mut no_change_since_start = true;
        let mut time_total = 0.0;

        let init_sum = self.get_sum_liveness()?;
        let init_max = self.get_max_liveness()?;
        let mut total_delta = AllocWeight::zero();
        self.susceptible = vec![true; self.n_ops()];

        while go_on {
            n_rounds += 1;
            let n = self.n_ops();
            let susceptible_now = std::mem::replace(&mut self.susceptible, vec![false; n]);
            let round_start = Instant::now();
            let mut n_changes_round: i64 = 0;

            for &op0 in &all_ops {
                let start0 = self.op_to_sch[op0.0] as isize;
                if start0 > n_ops - n_to_shift {
                    continue;
                }
                let op1 = self.sch_to_op[(start0 + n_to_shift - 1) as usize];
                if self.graph.get_op(op0).has_bwd_link() || self.graph.get_op(op1).has_fwd_link() {
                    continue;
                }
                let window = &self.sch_to_op[start0 as usize..(start0 + n_to_shift) as usize];
                if window.iter().all(|o| !susceptible_now[o.0]) {
                    continue;
                }

                let best = match algo {
                    RotationAlgo::Ripple => self.best_shift_ripple(&mut scratch, start0, n_to_shift),
                    RotationAlgo::Simple => self.best_shift_simple(start0, n_to_shift),
                };
                if debug_on {
                    self.confirm_shift_and_cost(start0, n_to_shift, best)?;
                }
                if best.cost < AllocWeight::zero() {
                    let change = ScheduleChange {
                        start0,
                        start1:     start0 + best.shift,
                        n_to_shift,
                    };
                    trace!(?change, cost = %best.cost, "rotation");
                    self.apply_change(change);
                    if debug_on {
                        self.assert_correctness()?;
                    }
                    n_changes_round += 1;
                    total_delta += best.cost;
                }
            }

            n_changes_total += n_changes_round;
            no_change_since_start = no_change_since_start && n_changes_round == 0;
            time_total += round_start.elapsed().as_secs_f64();
            if time_total > rt.max_seconds {
                self.outcome = RotationOutcome::TimeBudgetExhausted;
                go_on = false;
            } else if n_changes_total >= rt.max_rotations {
                self.outcome = RotationOutcome::IterationBudgetExhausted;
                go_on = false;
            }

            let old_n = n_to_shift;
            if no_change_since_start {
                n_to_shift += 1;
                self.susceptible = vec![true; self.n_ops()];
            } else if n_changes_round == 0 {
                n_to_shift = 1;
                no_change_since_start = true;
                n_resets += 1;
                self.susceptible = vec![true; self.n_ops()];
            }
            debug!(round = n_rounds, changes = n_changes_round, window = old_n, next_window = n_to_shift, "rotation round");
            if old_n != n_to_shift {
                self.update_can_can(old_n, n_to_shift);
            }

            if no_change_since_start {
                let n_to_consider = self.n_can_fwd.iter()
                    .zip(self.n_can_bwd.iter())
                    .filter(|(&f, &b)| f > n_to_shift || b > n_to_shift)
                    .count();
                if n_to_consider == 0 {
                    self.outcome = RotationOutcome::Converged;
                    go_on = false;
                }
            }
        }

        self.set_sch_to_liveness();
        let final_sum = self.get_sum_liveness()?;
        let final_max = self.get_max_liveness()?;

        let abs_err = (final_sum - init_sum - total_delta).absolute();
        for i in 0..N_SLOTS {
            let rel = abs_err.slots()[i] / (1.0 + total_delta.slots()[i].abs());
            if rel > 1e-5 {
                return Err(ShiftError::InvalidArgument(format!(
                    "Accumulated rotation improvements ({}) do not match the change in summed liveness ({})",
                    total_delta, final_sum - init_sum
                )));
            }
        }

        info!(
            rounds = n_rounds,
            rotations = n_changes_total,
            resets = n_resets,
            outcome = %self.outcome,
            init_sum = %init_sum,
            final_sum = %final_sum,
            init_max = %init_max,
            final_max = %final_max,
            "rotation complete"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{RotationTermination, optimize::TransitiveClosureOptimizations};

    fn settings(algo: RotationAlgo, debug_mode: DebugMode) -> Settings {
        Settings {
            tcos:           TransitiveClosureOptimizations::all_off(),
            rotation_algo:  algo,
            debug_mode,
            ..Settings::default()
        }
    }

    /// Ops 0..n in a chain of constraints, plus a free op with one big
    /// alloc shared with the chain's end.
    fn chain_and_loner() -> Graph {
        let mut g = Graph::new();
        let o = g.insert_ops(&["c0", "c1", "c2", "c3", "c4", "free"]);
        for i in 0..4 {
            g.insert_constraint(o[i], o[i + 1]).unwrap();
        }
        let big = g.insert_alloc(10.0);
        g.insert_op_allocs(&[o[4], o[5]], big).unwrap();
        g
    }

    #[test]
    fn shift_costs_match_full_recomputation() {
        let g = chain_and_loner();
        let sg = ScheduledGraph::from_schedule(g, ops_of(&[5, 0, 1, 2, 3, 4])).unwrap();
        let before = sg.get_sum_liveness().unwrap();
        // Move "free" from the front to the back.
        let cost = sg.shift_cost(0, 5, 1, AllocAddress(0));
        let mut moved = sg.clone();
        moved.apply_change(ScheduleChange { start0: 0, start1: 5, n_to_shift: 1 });
        moved.set_sch_to_liveness();
        assert_eq!(moved.get_schedule(), &ops_of(&[0, 1, 2, 3, 4, 5])[..]);
        assert_eq!(moved.get_sum_liveness().unwrap() - before, cost);
        assert_eq!(cost, AllocWeight::from(-40.0));
    }

    #[test]
    fn rotation_finds_the_loner_a_home() {
        for algo in [RotationAlgo::Simple, RotationAlgo::Ripple] {
            let s = Settings {
                kahn_decider: KahnDecider::with_priorities(
                    KahnTieBreaker::Fifo, vec![(OpAddress(5), 1.0)]
                ),
                ..settings(algo, DebugMode::On)
            };
            let sg = ScheduledGraph::new(chain_and_loner(), &s).unwrap();
            // Right before or right after c4 are equally good.
            let (free, c4) = (sg.op_to_schedule(OpAddress(5)).unwrap(), sg.op_to_schedule(OpAddress(4)).unwrap());
            assert_eq!(free.abs_diff(c4), 1);
            assert_eq!(sg.get_sum_liveness().unwrap(), AllocWeight::from(20.0));
            assert_eq!(sg.get_max_liveness().unwrap(), AllocWeight::from(10.0));
            assert_eq!(sg.rotation_outcome(), RotationOutcome::Converged);
        }
    }

    #[test]
    fn pre_start_keeps_kahn() {
        let s = Settings {
            kahn_decider: KahnDecider::with_priorities(
                KahnTieBreaker::Fifo, vec![(OpAddress(5), 1.0)]
            ),
            rotation_termination: RotationTermination::pre_start(),
            ..settings(RotationAlgo::Ripple, DebugMode::Off)
        };
        let sg = ScheduledGraph::new(chain_and_loner(), &s).unwrap();
        assert_eq!(sg.schedule_to_op(0).unwrap(), OpAddress(5));
        assert_eq!(sg.get_sum_liveness().unwrap(), AllocWeight::from(60.0));
        assert_eq!(sg.rotation_outcome(), RotationOutcome::NotRun);
    }

    #[test]
    fn budgets_end_the_rotation() {
        let loner_first = |rt: RotationTermination| Settings {
            kahn_decider: KahnDecider::with_priorities(
                KahnTieBreaker::Fifo, vec![(OpAddress(5), 1.0)]
            ),
            rotation_termination: rt,
            ..settings(RotationAlgo::Ripple, DebugMode::Off)
        };

        // The first round already moves the loner, so neither budget
        // can survive it.
        let sg = ScheduledGraph::new(chain_and_loner(), &loner_first(RotationTermination::new(f64::MAX, 1))).unwrap();
        assert_eq!(sg.rotation_outcome(), RotationOutcome::IterationBudgetExhausted);
        assert!(sg.get_sum_liveness().unwrap() < AllocWeight::from(60.0));

        let sg = ScheduledGraph::new(chain_and_loner(), &loner_first(RotationTermination::new(1e-12, i64::MAX))).unwrap();
        assert_eq!(sg.rotation_outcome(), RotationOutcome::TimeBudgetExhausted);

        let sg = ScheduledGraph::from_schedule(chain_and_loner(), ops_of(&[0, 1, 2, 3, 4, 5])).unwrap();
        assert_eq!(sg.rotation_outcome(), RotationOutcome::NotRun);
        let sg = ScheduledGraph::new(Graph::new(), &Settings::default()).unwrap();
        assert_eq!(sg.rotation_outcome(), RotationOutcome::Converged);
    }

    #[test]
    fn out_of_range_queries() {
        let sg = ScheduledGraph::from_schedule(chain_and_loner(), ops_of(&[0, 1, 2, 3, 4, 5])).unwrap();
        assert_eq!(sg.schedule_to_op(5).unwrap(), OpAddress(5));
        assert_eq!(sg.op_to_schedule(OpAddress(3)).unwrap(), 3);
        assert_eq!(sg.schedule_to_liveness(5).unwrap(), AllocWeight::from(10.0));
        assert!(matches!(sg.schedule_to_op(6), Err(ShiftError::InvalidArgument(_))));
        assert!(matches!(sg.schedule_to_liveness(6), Err(ShiftError::InvalidArgument(_))));
        assert!(matches!(
            sg.op_to_schedule(OpAddress(6)),
            Err(ShiftError::InvalidOp { n_ops: 6, .. })
        ));
    }

    #[test]
    fn links_are_never_split() {
        // a => b linked, c free and sharing a heavy alloc with a.
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c", "d"]);
        g.insert_link(o[0], o[1]).unwrap();
        g.insert_constraint(o[1], o[3]).unwrap();
        let heavy = g.insert_alloc(5.0);
        g.insert_op_allocs(&[o[0], o[2]], heavy).unwrap();
        let light = g.insert_alloc(1.0);
        g.insert_op_allocs(&[o[1], o[3]], light).unwrap();
        for algo in [RotationAlgo::Simple, RotationAlgo::Ripple] {
            let sg = ScheduledGraph::new(g.clone(), &settings(algo, DebugMode::On)).unwrap();
            assert_eq!(sg.op_to_schedule(o[1]).unwrap(), sg.op_to_schedule(o[0]).unwrap() + 1);
            sg.assert_correctness().unwrap();
        }
    }

    #[test]
    fn sub_schedules() {
        let g = chain_and_loner();
        let sg = ScheduledGraph::from_schedule(g, ops_of(&[0, 5, 1, 2, 3, 4])).unwrap();
        assert_eq!(sg.get_sub_schedule(&ops_of(&[4, 5, 0])).unwrap(), ops_of(&[0, 5, 4]));
        assert!(sg.get_sub_schedule(&[]).unwrap().is_empty());
        assert!(matches!(
            sg.get_sub_schedule(&ops_of(&[1, 1])),
            Err(ShiftError::DuplicateAddress(OpAddress(1)))
        ));
        assert!(matches!(
            sg.get_sub_schedule(&ops_of(&[6])),
            Err(ShiftError::InvalidOp { n_ops: 6, .. })
        ));
    }

    #[test]
    fn invalid_schedules_are_refused() {
        assert!(ScheduledGraph::from_schedule(chain_and_loner(), ops_of(&[1, 0, 2, 3, 4, 5])).is_err());
        assert!(ScheduledGraph::from_schedule(chain_and_loner(), ops_of(&[0, 1, 2])).is_err());
        assert!(matches!(
            ScheduledGraph::from_schedule(chain_and_loner(), ops_of(&[0, 0, 1, 2, 3, 4])),
            Err(ShiftError::DuplicateAddress(_))
        ));
    }

    #[test]
    fn liveness_table() {
        let g = chain_and_loner();
        let sg = ScheduledGraph::from_schedule(g, ops_of(&[0, 1, 2, 3, 4, 5])).unwrap();
        let s = sg.get_liveness_string();
        assert!(s.starts_with("Index"));
        assert!(s.contains("Liveness"));
        assert!(s.contains("free"));
        assert_eq!(s.lines().count(), 2 + 6);
    }

    #[test]
    fn empty_graph() {
        let sg = ScheduledGraph::new(Graph::new(), &Settings::default()).unwrap();
        assert!(sg.get_schedule().is_empty());
        assert_eq!(sg.get_sum_liveness().unwrap(), AllocWeight::zero());
    }
}
