use proptest::prelude::*;

use shiftsched::*;
use shiftsched::{
    algo::{RotationTermination, ScheduledGraph, Settings, TransitiveClosureOptimizations},
    kahn::kahn,
};

type RawAllocs = Vec<(u32, Vec<usize>)>;

fn build(n: usize, edges: &[(usize, usize)], allocs: &RawAllocs) -> Graph {
    let mut g = Graph::new();
    for i in 0..n {
        g.insert_op(&format!("p{}", i));
    }
    for &(a, b) in edges {
        match a.cmp(&b) {
            std::cmp::Ordering::Less    => g.insert_constraint(OpAddress(a), OpAddress(b)).unwrap(),
            std::cmp::Ordering::Greater => g.insert_constraint(OpAddress(b), OpAddress(a)).unwrap(),
            std::cmp::Ordering::Equal   => {},
        }
    }
    for (w, ops) in allocs {
        let a = g.insert_alloc(*w as f64);
        g.insert_op_allocs(&ops_of(ops), a).unwrap();
    }
    g
}

prop_compose! {
    fn dag()(n in 1usize..14)
            (edges in prop::collection::vec((0..n, 0..n), 0..3 * n),
             allocs in prop::collection::vec((0u32..12, prop::collection::vec(0..n, 1..5)), 0..n + 2),
             n in Just(n)) -> Graph {
        build(n, &edges, &allocs)
    }
}

/// A DAG plus links along a subset of consecutive pairs of one of its
/// schedules, so that it stays schedulable.
prop_compose! {
    fn linked_dag()(g in dag())
                   (links in prop::collection::vec(any::<bool>(), g.n_ops()),
                    seed in any::<u64>(),
                    g in Just(g)) -> Graph {
        let s = kahn(&g, &KahnDecider::new(KahnTieBreaker::Random), seed, ErrorIfCycle::Yes).unwrap();
        let mut g = g;
        for (w, &on) in s.windows(2).zip(links.iter()) {
            if on {
                g.insert_link(w[0], w[1]).unwrap();
            }
        }
        g
    }
}

fn assert_valid(g: &Graph, s: &[OpAddress]) -> Result<(), TestCaseError> {
    prop_assert_eq!(s.len(), g.n_ops());
    let mut at = vec![usize::MAX; g.n_ops()];
    for (i, op) in s.iter().enumerate() {
        prop_assert_eq!(at[op.0], usize::MAX);
        at[op.0] = i;
    }
    for op in g.ops() {
        for out in op.outs() {
            prop_assert!(at[op.address().0] < at[out.0]);
        }
        if let Some(l) = op.fwd_link() {
            prop_assert_eq!(at[l.0], at[op.address().0] + 1);
        }
    }

    Ok(())
}

fn tie_breaker() -> impl Strategy<Value = KahnTieBreaker> {
    prop_oneof![
        Just(KahnTieBreaker::Random),
        Just(KahnTieBreaker::Greedy),
        Just(KahnTieBreaker::Fifo),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn closure_trichotomy(g in dag()) {
        let tc = TransitiveClosure::from_graph(&g).unwrap();
        for a in (0..g.n_ops()).map(OpAddress) {
            for b in (0..g.n_ops()).map(OpAddress).filter(|&b| b != a) {
                let n_true = [tc.constrained(a, b), tc.constrained(b, a), tc.unconstrained(a, b)]
                    .iter()
                    .filter(|&&x| x)
                    .count();
                prop_assert_eq!(n_true, 1);
            }
        }
    }

    #[test]
    fn redundant_edges_change_nothing(g in dag()) {
        let tc = TransitiveClosure::from_graph(&g).unwrap();
        let mut pruned = g.clone();
        for (from, to) in tc.get_flattened_redundants(&g.get_forward_edges()) {
            pruned.remove_constraint(from, to).unwrap();
        }
        let tc2 = TransitiveClosure::from_graph(&pruned).unwrap();
        for a in (0..g.n_ops()).map(OpAddress) {
            for b in (0..g.n_ops()).map(OpAddress) {
                prop_assert_eq!(tc.constrained(a, b), tc2.constrained(a, b));
            }
        }
    }

    #[test]
    fn kahn_positions_are_within_bounds(g in linked_dag(), tb in tie_breaker(), seed in any::<u64>()) {
        let s = kahn(&g, &KahnDecider::new(tb), seed, ErrorIfCycle::Yes).unwrap();
        assert_valid(&g, &s)?;
        let tc = TransitiveClosure::from_graph(&g).unwrap();
        for (i, &op) in s.iter().enumerate() {
            prop_assert!(tc.earliest(op) <= i && i <= tc.latest(op));
        }
    }

    #[test]
    fn rotation_is_monotonic(g in linked_dag(), seed in 0u64..1000) {
        let base = Settings {
            kahn_decider:   KahnDecider::new(KahnTieBreaker::Random),
            tcos:           TransitiveClosureOptimizations::all_off(),
            seed,
            ..Settings::default()
        };
        let initial = ScheduledGraph::new(g.clone(), &Settings {
            rotation_termination:   RotationTermination::pre_start(),
            ..base.clone()
        }).unwrap();
        let rotated = ScheduledGraph::new(g.clone(), &Settings {
            debug_mode: DebugMode::On,
            ..base
        }).unwrap();
        assert_valid(&g, rotated.get_schedule())?;
        prop_assert!(rotated.get_sum_liveness().unwrap() <= initial.get_sum_liveness().unwrap());
    }

    #[test]
    fn optimized_schedules_are_valid(g in linked_dag(), tb in tie_breaker()) {
        let s = Settings {
            kahn_decider:   KahnDecider::new(tb),
            ..Settings::default()
        };
        let sg = ScheduledGraph::new(g.clone(), &s).unwrap();
        assert_valid(&g, sg.get_schedule())?;
    }
}
