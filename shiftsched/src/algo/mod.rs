pub mod simplify;
pub mod constrain;
pub mod optimize;
pub mod rotation;

use crate::{
    helpe::*,
    cache::ScheduleCache,
};
pub use self::{
    optimize::{TransitiveClosureOptim, TransitiveClosureOptimizations, optimize},
    rotation::{ScheduledGraph, ScheduleChange},
    simplify::AllocSimplifier,
};

/// When the rotation search stops: whichever of the two budgets runs
/// out first. Both are checked between rounds only.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RotationTermination {
    pub max_seconds:    f64,
    pub max_rotations:  i64,
}

impl RotationTermination {
    pub fn new(max_seconds: f64, max_rotations: i64) -> Self {
        Self {
            max_seconds,
            max_rotations,
        }
    }

    /// No rotation at all: the initial Kahn schedule is returned.
    pub fn pre_start() -> Self { Self::new(0.0, 0) }

    pub fn n_hours(n: f64) -> Self { Self::new(n * 3600.0, i64::MAX) }

    pub fn is_pre_start(&self) -> bool {
        self.max_seconds <= 0.0 || self.max_rotations <= 0
    }

    /// Bit-exact key, for caching.
    pub fn to_bits(&self) -> (u64, i64) {
        (self.max_seconds.to_bits(), self.max_rotations)
    }
}

impl Default for RotationTermination {
    fn default() -> Self { Self::new(f64::MAX, i64::MAX) }
}

impl fmt::Display for RotationTermination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(max_seconds={}, max_rotations={})", self.max_seconds, self.max_rotations)
    }
}

/// How the rotation search of a [ScheduledGraph] ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RotationOutcome {
    /// No rotation ran: the policy was [RotationTermination::pre_start],
    /// or the schedule was handed over as is.
    NotRun,
    /// No window of any size had a strictly improving move left.
    Converged,
    TimeBudgetExhausted,
    IterationBudgetExhausted,
}

impl fmt::Display for RotationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RotationOutcome::NotRun                     => "not run",
            RotationOutcome::Converged                  => "converged",
            RotationOutcome::TimeBudgetExhausted        => "time budget exhausted",
            RotationOutcome::IterationBudgetExhausted   => "iteration budget exhausted",
        };
        write!(f, "{}", s)
    }
}

/// Every knob of the scheduling pipeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub kahn_decider:           KahnDecider,
    pub tcos:                   TransitiveClosureOptimizations,
    pub rotation_termination:   RotationTermination,
    pub rotation_algo:          RotationAlgo,
    pub seed:                   u64,
    pub debug_mode:             DebugMode,
}

impl Settings {
    pub fn new(kahn_decider: KahnDecider, rotation_termination: RotationTermination) -> Self {
        Self {
            kahn_decider,
            rotation_termination,
            ..Self::default()
        }
    }
}

/// Finds a schedule of `graph` with low total liveness.
///
/// The returned [ScheduledGraph] owns the graph as rewritten by the
/// enabled optimizations; its schedule is valid for `graph` as well.
pub fn schedule(graph: Graph, settings: &Settings) -> ShiftResult<ScheduledGraph> {
    ScheduledGraph::new(graph, settings)
}

/// Like [schedule], but first asks `reader` for a schedule of an
/// identical graph (names aside) solved under the same termination
/// policy. On a hit nothing is solved: the cached schedule is wrapped
/// as is. On a miss the graph is solved and, if there is a `writer`,
/// the result is stored in it.
pub fn from_cache(
    graph:      Graph,
    settings:   &Settings,
    reader:     Option<&dyn ScheduleCache>,
    writer:     Option<&dyn ScheduleCache>,
) -> ShiftResult<ScheduledGraph> {
    let rt = &settings.rotation_termination;
    if let Some(cached) = reader.and_then(|r| r.find_exact_start(&graph, rt)) {
        info!(n_ops = graph.n_ops(), "schedule found in cache");
        let mut res = ScheduledGraph::from_schedule(graph, cached)?;
        res.mark_from_cache();
        return Ok(res);
    }

    let original = writer.map(|_| graph.clone());
    let res = ScheduledGraph::new(graph, settings)?;
    if let (Some(w), Some(g)) = (writer, original) {
        debug!(n_ops = g.n_ops(), "writing schedule to cache");
        w.write_exact_start(g, rt, res.get_schedule().to_vec());
    }

    Ok(res)
}
