use crate::helpe::*;
use crate::kahn::kahn;

/// Realizes if `g` has at least one schedule respecting all of its
/// constraints and links.
///
/// A cycle of constraints makes a graph unschedulable, and so do links
/// which can not all hold at once, e.g. links `0 => 1` and `1 => 3` in
/// the diamond `0 -> {1, 2} -> 3`.
pub fn is_schedulable(g: &Graph) -> bool {
    match kahn(g, &KahnDecider::default(), 0, ErrorIfCycle::No) {
        Ok(s)   => s.len() == g.n_ops(),
        Err(_)  => false,
    }
}

/// Realizes if `g` has exactly one schedule.
///
/// With every link chain seen as a single node, that is the case iff
/// every two nodes adjacent in some schedule are joined by a
/// constraint.
pub fn has_unique_schedule(g: &Graph) -> bool {
    let s = match kahn(g, &KahnDecider::default(), 0, ErrorIfCycle::No) {
        Ok(s) if s.len() == g.n_ops()   => s,
        _                               => return false,
    };
    let head = |mut op: OpAddress| {
        while let Some(prev) = g.get_op(op).bwd_link() {
            op = prev;
        }
        op
    };
    let chain_from = |h: OpAddress| {
        std::iter::successors(Some(h), move |&op| g.get_op(op).fwd_link())
    };

    s.iter()
        .tuple_windows()
        .all(|(&a, &b)| {
            if g.get_op(a).fwd_link() == Some(b) {
                return true;
            }
            let hb = head(b);
            chain_from(head(a)).any(|x| g.get_op(x).outs().iter().any(|&y| head(y) == hb))
        })
}

/// Size of a scheduling problem, as reported by the command line tools.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphStats {
    pub n_ops:          usize,
    pub n_allocs:       usize,
    // Allocs with at least one op
    pub n_live_allocs:  usize,
    pub n_constraints:  usize,
    pub n_links:        usize,
    pub n_link_chains:  usize,
    pub n_partitions:   usize,
    pub total_weight:   AllocWeight,
}

impl GraphStats {
    pub fn new(g: &Graph) -> Self {
        let live = g.allocs().iter().filter(|a| a.n_ops() > 0);
        Self {
            n_ops:          g.n_ops(),
            n_allocs:       g.n_allocs(),
            n_live_allocs:  live.clone().count(),
            n_constraints:  g.n_constraints(),
            n_links:        g.n_links(),
            n_link_chains:  g.get_link_chains().len(),
            n_partitions:   g.get_alloc_partitioned().len(),
            total_weight:   live.map(|a| a.weight()).sum(),
        }
    }
}

impl fmt::Display for GraphStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f,
            "{} ops, {} allocs ({} live, total weight {}), {} constraints, {} links in {} chains, {} partitions",
            self.n_ops, self.n_allocs, self.n_live_allocs, self.total_weight,
            self.n_constraints, self.n_links, self.n_link_chains, self.n_partitions,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> (Graph, Vec<OpAddress>) {
        let mut g = Graph::new();
        let o = g.insert_ops(&["0", "1", "2", "3"]);
        g.insert_constraints(&[(o[0], o[1]), (o[0], o[2]), (o[1], o[3]), (o[2], o[3])]).unwrap();
        (g, o)
    }

    #[test]
    fn crossing_links() {
        let (mut g, o) = diamond();
        assert!(is_schedulable(&g));
        g.insert_link(o[0], o[1]).unwrap();
        g.insert_link(o[1], o[3]).unwrap();
        assert!(!is_schedulable(&g));

        let (mut g, o) = diamond();
        g.insert_link(o[0], o[1]).unwrap();
        g.insert_link(o[2], o[3]).unwrap();
        assert!(is_schedulable(&g));
        assert!(has_unique_schedule(&g));
    }

    #[test]
    fn links_can_fix_the_order() {
        // 0 -> {1, 2} -> 3 with link 0 => 1: 2 cannot go between them.
        let (mut g, o) = diamond();
        g.insert_link(o[0], o[1]).unwrap();
        assert!(has_unique_schedule(&g));

        // Two chains ordered by one constraint between their heads.
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c", "d"]);
        g.insert_link(o[0], o[1]).unwrap();
        g.insert_link(o[2], o[3]).unwrap();
        assert!(!has_unique_schedule(&g));
        g.insert_constraint(o[0], o[2]).unwrap();
        assert!(has_unique_schedule(&g));
    }

    #[test]
    fn cycles() {
        let mut g = Graph::new();
        let o = g.insert_ops(&["a", "b", "c"]);
        g.insert_constraints(&[(o[0], o[1]), (o[1], o[2]), (o[2], o[0])]).unwrap();
        assert!(!is_schedulable(&g));
        assert!(!has_unique_schedule(&g));
    }

    #[test]
    fn uniqueness() {
        let (g, _) = diamond();
        assert!(!has_unique_schedule(&g));
        let mut chain = Graph::new();
        let o = chain.insert_ops(&["a", "b", "c"]);
        chain.insert_constraints(&[(o[0], o[1]), (o[1], o[2])]).unwrap();
        assert!(has_unique_schedule(&chain));
        assert!(has_unique_schedule(&Graph::new()));
    }

    #[test]
    fn stats() {
        let (mut g, o) = diamond();
        g.insert_link(o[0], o[1]).unwrap();
        let a = g.insert_alloc(2.0);
        g.insert_op_allocs(&[o[1], o[2]], a).unwrap();
        g.insert_alloc(5.0);
        let s = GraphStats::new(&g);
        assert_eq!(s.n_ops, 4);
        assert_eq!(s.n_allocs, 2);
        assert_eq!(s.n_live_allocs, 1);
        assert_eq!(s.n_constraints, 4);
        assert_eq!(s.n_links, 1);
        assert_eq!(s.n_partitions, 3);
        assert_eq!(s.total_weight, AllocWeight::from(2.0));
        assert!(s.to_string().starts_with("4 ops"));
    }
}
