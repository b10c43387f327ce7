use std::str::FromStr;

use rand::{rngs::StdRng, SeedableRng, seq::SliceRandom};

use crate::helpe::*;
use crate::scc::scc_summary;

/// How Kahn's algorithm picks the next op when several are ready.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Hash, Serialize, Deserialize)]
pub enum KahnTieBreaker {
    /// A seeded, uniform draw among the ready ops of highest priority
    Random,
    /// The ready op whose scheduling increases liveness the least
    Greedy,
    /// The most recently readied op (the ready list is used as a stack)
    Fifo,
}

impl Default for KahnTieBreaker {
    fn default() -> Self { KahnTieBreaker::Greedy }
}

impl fmt::Display for KahnTieBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KahnTieBreaker::Random  => "Random",
            KahnTieBreaker::Greedy  => "Greedy",
            KahnTieBreaker::Fifo    => "Fifo",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for KahnTieBreaker {
    type Err = ShiftError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random"    => Ok(KahnTieBreaker::Random),
            "greedy"    => Ok(KahnTieBreaker::Greedy),
            "fifo"      => Ok(KahnTieBreaker::Fifo),
            _           => Err(ShiftError::InvalidArgument(format!(
                "Invalid KahnTieBreaker '{}', expected one of Random, Greedy, Fifo", s
            ))),
        }
    }
}

/// Whether a partial Kahn schedule is an error.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum ErrorIfCycle {
    Yes,
    No,
}

/// The tie-breaker together with optional per-op priorities. Among
/// ready ops only those with the highest priority are candidates; ops
/// without an explicit priority have priority `0.0`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KahnDecider {
    pub tie_breaker:    KahnTieBreaker,
    #[serde(default)]
    pub priorities:     Vec<(OpAddress, f64)>,
}

impl KahnDecider {
    pub fn new(tie_breaker: KahnTieBreaker) -> Self {
        Self {
            tie_breaker,
            priorities: vec![],
        }
    }

    pub fn with_priorities(tie_breaker: KahnTieBreaker, priorities: Vec<(OpAddress, f64)>) -> Self {
        Self {
            tie_breaker,
            priorities,
        }
    }

    /// One priority per op.
    pub fn sparse_priorities(&self, n_ops: usize) -> ShiftResult<Vec<f64>> {
        let mut res = vec![0.0; n_ops];
        for &(op, p) in &self.priorities {
            if op.0 >= n_ops {
                return Err(ShiftError::InvalidOp { address: op, n_ops });
            }
            res[op.0] = p;
        }

        Ok(res)
    }
}

//---START READY STACKS---
trait ReadyStack {
    fn push(&mut self, node: usize);
    fn pop(&mut self) -> Option<usize>;
}

/// Index of the highest priority entry, nearest the back on ties.
#[inline(always)]
fn back_most_max(ready: &[usize], priorities: &[f64]) -> usize {
    let mut best = 0;
    for i in 1..ready.len() {
        if priorities[ready[i]] >= priorities[ready[best]] {
            best = i;
        }
    }

    best
}

struct FiloStack<'a> {
    ready:      Vec<usize>,
    priorities: Option<&'a [f64]>,
}

impl ReadyStack for FiloStack<'_> {
    fn push(&mut self, node: usize) { self.ready.push(node); }
    fn pop(&mut self) -> Option<usize> {
        if self.ready.is_empty() { return None; }
        match self.priorities {
            None    => self.ready.pop(),
            Some(p) => {
                let best = back_most_max(&self.ready, p);
                Some(self.ready.remove(best))
            }
        }
    }
}

struct RandomStack<'a> {
    ready:      Vec<usize>,
    priorities: Option<&'a [f64]>,
    rng:        StdRng,
    // Whether `ready` is currently in a random order.
    shuffled:   bool,
}

impl ReadyStack for RandomStack<'_> {
    fn push(&mut self, node: usize) {
        self.ready.push(node);
        self.shuffled = false;
    }
    fn pop(&mut self) -> Option<usize> {
        if self.ready.is_empty() { return None; }
        if !self.shuffled {
            self.ready.shuffle(&mut self.rng);
            self.shuffled = true;
        }
        match self.priorities {
            None    => self.ready.pop(),
            Some(p) => {
                let best = back_most_max(&self.ready, p);
                Some(self.ready.remove(best))
            }
        }
    }
}

struct GreedyStack<'a> {
    ready:          Vec<usize>,
    priorities:     Option<&'a [f64]>,
    weights:        Vec<AllocWeight>,
    node_allocs:    Vec<Vec<usize>>,
    // Number of unscheduled nodes per alloc.
    outstanding:    Vec<usize>,
    live:           Vec<bool>,
}

impl<'a> GreedyStack<'a> {
    fn new(n: usize, priorities: Option<&'a [f64]>, allocs: &[(AllocWeight, Vec<usize>)]) -> Self {
        let mut node_allocs = vec![vec![]; n];
        for (a, (_, nodes)) in allocs.iter().enumerate() {
            for &node in nodes {
                node_allocs[node].push(a);
            }
        }

        Self {
            ready:          vec![],
            priorities,
            weights:        allocs.iter().map(|(w, _)| *w).collect(),
            node_allocs,
            outstanding:    allocs.iter().map(|(_, nodes)| nodes.len()).collect(),
            live:           vec![false; allocs.len()],
        }
    }

    /// Change in liveness if `node` were scheduled next.
    fn delta_live(&self, node: usize) -> AllocWeight {
        let mut delta = AllocWeight::zero();
        for &a in &self.node_allocs[node] {
            if self.outstanding[a] == 1 {
                delta -= self.weights[a];
            }
            if !self.live[a] {
                delta += self.weights[a];
            }
        }

        delta
    }

    fn best(&self) -> usize {
        let deltas = self.ready.iter()
            .map(|&node| self.delta_live(node))
            .collect::<Vec<_>>();
        let mut best = 0;
        match self.priorities {
            None    => {
                for i in 1..self.ready.len() {
                    if deltas[i] <= deltas[best] {
                        best = i;
                    }
                }
            },
            Some(p) => {
                for i in 1..self.ready.len() {
                    let (pi, pb) = (p[self.ready[i]], p[self.ready[best]]);
                    let better = if pi != pb { pi > pb } else { deltas[i] < deltas[best] };
                    if better {
                        best = i;
                    }
                }
            }
        }

        best
    }
}

impl ReadyStack for GreedyStack<'_> {
    fn push(&mut self, node: usize) { self.ready.push(node); }
    fn pop(&mut self) -> Option<usize> {
        if self.ready.is_empty() { return None; }
        let node = self.ready.remove(self.best());
        for &a in &self.node_allocs[node] {
            self.live[a] = true;
            self.outstanding[a] -= 1;
        }

        Some(node)
    }
}
//---END READY STACKS---

fn stack_based_kahn<S: ReadyStack>(outs: &[Vec<usize>], ready: &mut S) -> Vec<usize> {
    let n = outs.len();
    let mut n_pending = vec![0usize; n];
    for &o in outs.iter().flatten() {
        n_pending[o] += 1;
    }
    for i in 0..n {
        if n_pending[i] == 0 {
            ready.push(i);
        }
    }
    let mut schedule = Vec::with_capacity(n);
    while let Some(nxt) = ready.pop() {
        schedule.push(nxt);
        for &to in &outs[nxt] {
            n_pending[to] -= 1;
            if n_pending[to] == 0 {
                ready.push(to);
            }
        }
    }

    schedule
}

/// A linkless scheduling problem over dense node indices.
struct Problem<'a> {
    outs:       &'a [Vec<usize>],
    priorities: Option<&'a [f64]>,
    allocs:     &'a [(AllocWeight, Vec<usize>)],
}

fn linkless(p: &Problem, tie_breaker: KahnTieBreaker, seed: u64) -> Vec<usize> {
    match tie_breaker {
        KahnTieBreaker::Fifo    => {
            let mut s = FiloStack { ready: vec![], priorities: p.priorities };
            stack_based_kahn(p.outs, &mut s)
        },
        KahnTieBreaker::Random  => {
            let mut s = RandomStack {
                ready:      vec![],
                priorities: p.priorities,
                rng:        StdRng::seed_from_u64(seed),
                shuffled:   false,
            };
            stack_based_kahn(p.outs, &mut s)
        },
        KahnTieBreaker::Greedy  => {
            let mut s = GreedyStack::new(p.outs.len(), p.priorities, p.allocs);
            stack_based_kahn(p.outs, &mut s)
        },
    }
}

/// Maps a graph onto the graph in which every link chain is one node.
///
/// Ops on a cycle of links (which [Graph::insert_link] refuses to
/// build) share one extra node with a self edge, so that Kahn never
/// schedules them nor anything after them.
struct LinkMap {
    to_compressed:  Vec<usize>,
    to_expanded:    Vec<Vec<usize>>,
    trapped:        Option<usize>,
}

impl LinkMap {
    fn new(n: usize, fwd_links: &[Option<usize>], has_bwd: &[bool]) -> Self {
        let mut to_compressed = vec![usize::MAX; n];
        let mut to_expanded: Vec<Vec<usize>> = vec![];
        for node in (0..n).filter(|&i| !has_bwd[i]) {
            let current = to_expanded.len();
            let mut chain = vec![node];
            to_compressed[node] = current;
            let mut star = node;
            while let Some(nxt) = fwd_links[star] {
                chain.push(nxt);
                to_compressed[nxt] = current;
                star = nxt;
            }
            to_expanded.push(chain);
        }

        let cyclic = (0..n).filter(|&i| to_compressed[i] == usize::MAX).collect::<Vec<_>>();
        let trapped = if cyclic.is_empty() { None } else {
            let current = to_expanded.len();
            for &node in &cyclic {
                to_compressed[node] = current;
            }
            to_expanded.push(cyclic);
            Some(current)
        };

        Self { to_compressed, to_expanded, trapped }
    }

    fn edges(&self, outs: &[Vec<usize>]) -> Vec<Vec<usize>> {
        let mut res: Vec<Vec<usize>> = vec![vec![]; self.to_expanded.len()];
        for (n0, tos) in outs.iter().enumerate() {
            let c0 = self.to_compressed[n0];
            for &n1 in tos {
                let c1 = self.to_compressed[n1];
                if c1 != c0 && !res[c0].contains(&c1) {
                    res[c0].push(c1);
                }
            }
        }
        if let Some(t) = self.trapped {
            res[t].push(t);
        }

        res
    }

    /// Mean priority of each chain's explicitly prioritised members.
    fn priorities(&self, explicit: &[(OpAddress, f64)]) -> Vec<f64> {
        let mut sums = vec![(0.0, 0usize); self.to_expanded.len()];
        for &(op, p) in explicit {
            let c = self.to_compressed[op.0];
            sums[c].0 += p;
            sums[c].1 += 1;
        }
        sums.into_iter()
            .map(|(s, k)| if k == 0 { 0.0 } else { s / k as f64 })
            .collect()
    }

    fn allocs(&self, allocs: &[(AllocWeight, Vec<usize>)]) -> Vec<(AllocWeight, Vec<usize>)> {
        allocs.iter()
            .map(|(w, nodes)| {
                let compressed = nodes.iter()
                    .map(|&n| self.to_compressed[n])
                    .sorted_unstable()
                    .dedup()
                    .collect();
                (*w, compressed)
            })
            .collect()
    }

    fn expand(&self, compressed: &[usize]) -> Vec<usize> {
        compressed.iter()
            .flat_map(|&c| self.to_expanded[c].iter().copied())
            .collect()
    }
}

/// Builds one valid schedule of `g` with Kahn's algorithm. Linked
/// chains are scheduled as single units.
///
/// With [ErrorIfCycle::No] a cycle results in a partial schedule, and
/// it is up to the caller to compare its length against `g.n_ops()`.
pub fn kahn(
    g:          &Graph,
    decider:    &KahnDecider,
    seed:       u64,
    eic:        ErrorIfCycle,
) -> ShiftResult<Vec<OpAddress>> {
    let n = g.n_ops();
    let outs: Vec<Vec<usize>> = g.ops().iter()
        .map(|op| op.outs().iter().map(|o| o.0).collect())
        .collect();
    let allocs: Vec<(AllocWeight, Vec<usize>)> = g.allocs().iter()
        .map(|a| (a.weight(), a.ops().iter().map(|o| o.0).collect()))
        .collect();
    let dense = decider.sparse_priorities(n)?;
    let priorities = if decider.priorities.is_empty() { None } else { Some(&dense[..]) };

    let linkless_problem = Problem {
        outs:       &outs,
        priorities,
        allocs:     &allocs,
    };
    let n_links = g.n_links();
    let schedule = if n_links > 0 {
        let fwd_links: Vec<Option<usize>> = g.ops().iter().map(|op| op.fwd_link().map(|x| x.0)).collect();
        let has_bwd: Vec<bool> = g.ops().iter().map(|op| op.has_bwd_link()).collect();
        let lm = LinkMap::new(n, &fwd_links, &has_bwd);
        let c_outs = lm.edges(&outs);
        let c_dense = lm.priorities(&decider.priorities);
        let c_allocs = lm.allocs(&allocs);
        let compressed = Problem {
            outs:       &c_outs,
            priorities: priorities.map(|_| &c_dense[..]),
            allocs:     &c_allocs,
        };
        lm.expand(&linkless(&compressed, decider.tie_breaker, seed))
    } else {
        linkless(&linkless_problem, decider.tie_breaker, seed)
    };

    if eic == ErrorIfCycle::Yes && schedule.len() != n {
        let mut summary = format!(
            "The graph has {} priorities set, and it has {} links. ",
            decider.priorities.len(), n_links
        );
        if n_links > 0 {
            let n_without = linkless(&linkless_problem, decider.tie_breaker, seed).len();
            summary.push_str(&format!(
                "With all links removed (ignored), {} of the {} ops are scheduled. ", n_without, n
            ));
            if n_without == n {
                summary.push_str("This suggests that the links are the cause of the cycle.");
            }
        } else {
            summary.push_str(&scc_summary(&g.get_forward_edges(), |o| g.get_op(o).debug_name().to_string()));
        }
        return Err(ShiftError::Cycle {
            scheduled:  schedule.len(),
            total:      n,
            summary,
        });
    }

    Ok(schedule.into_iter().map(OpAddress).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    // root -> {2..11} -> tail, with allocs pulling the middle ops
    // closest to 5.1 towards the root.
    fn fan() -> Graph {
        let mut g = Graph::new();
        let root = g.insert_op("root");
        let tail = g.insert_op("tail");
        for i in 2..12 {
            let nxt = g.insert_op(&format!("op{}", i));
            g.insert_constraint(root, nxt).unwrap();
            g.insert_constraint(nxt, tail).unwrap();
            let w = g.insert_alloc(100.0 - (i as f64 - 5.1).abs());
            g.insert_op_allocs(&[root, nxt], w).unwrap();
        }
        g
    }

    fn raw(s: &[OpAddress]) -> Vec<usize> {
        s.iter().map(|o| o.0).collect()
    }

    #[test]
    fn greedy_frees_heaviest_first() {
        let s = kahn(&fan(), &KahnDecider::new(KahnTieBreaker::Greedy), 0, ErrorIfCycle::Yes).unwrap();
        assert_eq!(raw(&s), vec![0, 5, 6, 4, 7, 3, 8, 2, 9, 10, 11, 1]);
    }

    #[test]
    fn fifo_is_a_stack() {
        let s = kahn(&fan(), &KahnDecider::new(KahnTieBreaker::Fifo), 0, ErrorIfCycle::Yes).unwrap();
        assert_eq!(raw(&s), vec![0, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn priorities_dominate_random() {
        let ps = vec![(OpAddress(2), 10.0), (OpAddress(4), 9.0), (OpAddress(6), 8.0), (OpAddress(8), 7.0)];
        for seed in 0..5 {
            let d = KahnDecider::with_priorities(KahnTieBreaker::Random, ps.clone());
            let s = kahn(&fan(), &d, seed, ErrorIfCycle::Yes).unwrap();
            assert_eq!(raw(&s[..5]), vec![0, 2, 4, 6, 8]);
            assert_eq!(s.len(), 12);
        }
    }

    #[test]
    fn random_is_reproducible() {
        let d = KahnDecider::new(KahnTieBreaker::Random);
        let a = kahn(&fan(), &d, 1011, ErrorIfCycle::Yes).unwrap();
        let b = kahn(&fan(), &d, 1011, ErrorIfCycle::Yes).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn links_are_contiguous() {
        let mut g = fan();
        g.insert_link(OpAddress(3), OpAddress(9)).unwrap();
        g.insert_link(OpAddress(0), OpAddress(11)).unwrap();
        for tb in [KahnTieBreaker::Fifo, KahnTieBreaker::Greedy, KahnTieBreaker::Random] {
            let s = kahn(&g, &KahnDecider::new(tb), 3, ErrorIfCycle::Yes).unwrap();
            let pos = |x: usize| s.iter().position(|o| o.0 == x).unwrap();
            assert_eq!(pos(9), pos(3) + 1);
            assert_eq!(pos(11), 1);
        }
    }

    #[test]
    fn cycles() {
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c"]);
        g.insert_constraints(&[(o[0], o[1]), (o[1], o[2]), (o[2], o[1])]).unwrap();
        let d = KahnDecider::new(KahnTieBreaker::Fifo);
        assert_eq!(kahn(&g, &d, 0, ErrorIfCycle::No).unwrap(), vec![o[0]]);
        match kahn(&g, &d, 0, ErrorIfCycle::Yes) {
            Err(ShiftError::Cycle { scheduled, total, summary }) => {
                assert_eq!((scheduled, total), (1, 3));
                assert!(summary.contains("b(1), c(2)"));
            },
            other => panic!("Expected a cycle error, got {:?}", other),
        }
    }

    #[test]
    fn crossed_links_are_a_cycle() {
        // Links 0 -> 1 and 1 -> 3 with 0 -> 2 -> 3: 2 cannot fit anywhere.
        let mut g = Graph::new();
        let o = g.insert_ops(&["0", "1", "2", "3"]);
        g.insert_link(o[0], o[1]).unwrap();
        g.insert_link(o[1], o[3]).unwrap();
        g.insert_constraints(&[(o[0], o[2]), (o[2], o[3])]).unwrap();
        let err = kahn(&g, &KahnDecider::default(), 0, ErrorIfCycle::Yes).unwrap_err();
        assert!(err.to_string().contains("links are the cause"));
    }

    #[test]
    fn link_loops_are_never_scheduled() {
        // 0 => 1 => 2 => 0, with 2 -> 3 and 4 free.
        let fwd = vec![Some(1), Some(2), Some(0), None, None];
        let has_bwd = vec![true, true, true, false, false];
        let lm = LinkMap::new(5, &fwd, &has_bwd);
        assert_eq!(lm.trapped, Some(2));
        assert_eq!(lm.to_expanded[2], vec![0, 1, 2]);
        let outs = vec![vec![1], vec![2], vec![0, 3], vec![], vec![]];
        let c_outs = lm.edges(&outs);
        assert!(c_outs[2].contains(&2) && c_outs[2].contains(&0));
        let c_allocs = lm.allocs(&[]);
        let p = Problem { outs: &c_outs, priorities: None, allocs: &c_allocs };
        for tb in [KahnTieBreaker::Fifo, KahnTieBreaker::Greedy, KahnTieBreaker::Random] {
            assert_eq!(lm.expand(&linkless(&p, tb, 0)), vec![4]);
        }
    }

    #[test]
    fn closing_a_link_loop_is_refused() {
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c"]);
        g.insert_link(o[0], o[1]).unwrap();
        g.insert_constraint(o[2], o[0]).unwrap();
        assert!(g.insert_link(o[1], o[0]).is_err());
        let s = kahn(&g, &KahnDecider::default(), 0, ErrorIfCycle::Yes).unwrap();
        assert_eq!(s, vec![o[2], o[0], o[1]]);
        assert!(crate::analyze::is_schedulable(&g));
    }

    #[test]
    fn tie_breaker_strings() {
        assert_eq!("GREEDY".parse::<KahnTieBreaker>().unwrap(), KahnTieBreaker::Greedy);
        assert_eq!("fifo".parse::<KahnTieBreaker>().unwrap(), KahnTieBreaker::Fifo);
        assert!("bogus".parse::<KahnTieBreaker>().is_err());
        assert_eq!(KahnTieBreaker::Random.to_string(), "Random");
        assert!(KahnDecider::with_priorities(KahnTieBreaker::Fifo, vec![(OpAddress(4), 1.0)])
            .sparse_priorities(3).is_err());
    }
}
