use std::cell::RefCell;

use crate::helpe::*;
use crate::algo::RotationTermination;

/// Storage for schedules of graphs already solved.
///
/// Lookups ignore op names: a graph matches when its ops, allocs,
/// weights, constraints and links are identical address for address.
pub trait ScheduleCache {
    /// A schedule of a graph equal to `graph`, solved under `rt`.
    fn find_exact_start(&self, graph: &Graph, rt: &RotationTermination) -> Option<Vec<OpAddress>>;

    fn write_exact_start(&self, graph: Graph, rt: &RotationTermination, schedule: Vec<OpAddress>);
}

type CacheKey = (u64, (u64, i64));

/// A [ScheduleCache] living in memory, keyed by the name-free hash of
/// the graph and the termination policy. Hash collisions are resolved
/// by full comparison.
#[derive(Default, Debug)]
pub struct InMemoryScheduleCache {
    entries:    RefCell<IndexMap<CacheKey, Vec<(Graph, Vec<OpAddress>)>>>,
    n_hits:     RefCell<usize>,
    n_misses:   RefCell<usize>,
    n_writes:   RefCell<usize>,
}

impl InMemoryScheduleCache {
    pub fn new() -> Self { Self::default() }

    #[inline(always)]
    fn key(graph: &Graph, rt: &RotationTermination) -> CacheKey {
        (graph.nameless_hash(), rt.to_bits())
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn n_hits(&self) -> usize { *self.n_hits.borrow() }

    pub fn n_misses(&self) -> usize { *self.n_misses.borrow() }

    pub fn n_writes(&self) -> usize { *self.n_writes.borrow() }
}

impl ScheduleCache for InMemoryScheduleCache {
    fn find_exact_start(&self, graph: &Graph, rt: &RotationTermination) -> Option<Vec<OpAddress>> {
        let found = self.entries.borrow()
            .get(&Self::key(graph, rt))
            .and_then(|bucket| {
                bucket.iter()
                    .find(|(g, _)| g.equal_to(graph, false))
                    .map(|(_, s)| s.clone())
            });
        match found {
            Some(_) => *self.n_hits.borrow_mut() += 1,
            None    => *self.n_misses.borrow_mut() += 1,
        }
        trace!(hit = found.is_some(), "cache lookup");

        found
    }

    fn write_exact_start(&self, graph: Graph, rt: &RotationTermination, schedule: Vec<OpAddress>) {
        let key = Self::key(&graph, rt);
        let mut entries = self.entries.borrow_mut();
        let bucket = entries.entry(key).or_default();
        match bucket.iter_mut().find(|(g, _)| g.equal_to(&graph, false)) {
            Some(entry) => entry.1 = schedule,
            None        => bucket.push((graph, schedule)),
        }
        *self.n_writes.borrow_mut() += 1;
    }
}
