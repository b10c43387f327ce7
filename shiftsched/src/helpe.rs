pub use std::{
    io::{BufReader, BufWriter, Read, Write},
    collections::{HashMap, HashSet, BTreeSet, BTreeMap, VecDeque},
    path::PathBuf,
    hash::Hash,
    fmt,
    time::Instant,
};
pub use thiserror::Error;
pub use itertools::Itertools;
pub use rayon::prelude::*;
pub use indexmap::IndexMap;
pub use clap::{Parser, ValueEnum};
pub use serde::{Deserialize, Serialize};
pub use tracing::{debug, info, info_span, trace, warn};

pub use crate::{Op, Alloc,
    weight::AllocWeight,
    graph::Graph,
    closure::{TransitiveClosure, IsFirst, IsFinal, Filter, DurationBound},
    kahn::{KahnDecider, KahnTieBreaker, ErrorIfCycle},
};

/// Position of an op in a schedule. `0` is the first op to run.
pub type ScheduleIndex = usize;

/// Forward edges of a graph: entry `i` holds the ops which must
/// come after op `i`.
pub type Edges = Vec<Vec<OpAddress>>;

/// A group of ops, usually either a chain or a partition.
pub type OpChain = Vec<OpAddress>;

/// Dense identifier of an op. Ops are never renumbered while a
/// [Graph] is alive; merging produces a brand new [Graph].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpAddress(pub usize);

/// Dense identifier of an alloc. Kept distinct from [OpAddress] so
/// the two can never be mixed up.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocAddress(pub usize);

impl OpAddress {
    #[inline(always)]
    pub fn get(self) -> usize { self.0 }
}

impl AllocAddress {
    #[inline(always)]
    pub fn get(self) -> usize { self.0 }
}

impl fmt::Display for OpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AllocAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wraps plain indices into [OpAddress]es. Handy in tests and parsers.
#[inline(always)]
pub fn ops_of(raw: &[usize]) -> Vec<OpAddress> {
    raw.iter().map(|&x| OpAddress(x)).collect()
}

#[derive(Error, Debug)]
/// Everything that can go wrong while building, analysing or
/// scheduling a [Graph].
pub enum ShiftError {
    #[error("Invalid OpAddress {address}, there are only {n_ops} ops")]
    InvalidOp {
        address:    OpAddress,
        n_ops:      usize,
    },
    #[error("Invalid AllocAddress {address}, there are only {n_allocs} allocs")]
    InvalidAlloc {
        address:    AllocAddress,
        n_allocs:   usize,
    },
    #[error("Op {0} cannot be constrained to come before itself")]
    SelfConstraint(OpAddress),
    #[error("Op {0} appears more than once in the query")]
    DuplicateAddress(OpAddress),
    #[error("Cannot link {before} -> {after}: {message}")]
    LinkConflict {
        before:     OpAddress,
        after:      OpAddress,
        message:    String,
    },
    #[error("Only {scheduled} of {total} ops were scheduled, the graph is not schedulable\n{summary}")]
    Cycle {
        scheduled:  usize,
        total:      usize,
        summary:    String,
    },
    #[error("Graph is not schedulable: {0}")]
    NotSchedulable(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0} has not been computed yet")]
    NotReady(&'static str),
    #[error("{0}")]
    InvalidArgument(String),
}

pub type ShiftResult<T> = Result<T, ShiftError>;

/// Defines the interface for reading graphs.
///
/// The crate ships a JSON reader ([crate::serial::JsonGraphParser]).
/// Users may plug their own formats by implementing this trait.
pub trait GraphGen {
    fn new(path: PathBuf) -> Self;
    /// Either a graph is successfully returned, or the reason
    /// it could not be built.
    fn read_graph(&self) -> ShiftResult<Graph>;
}

pub fn read_from_path<T>(file_path: PathBuf) -> ShiftResult<Graph>
where T: GraphGen {
    let parser = T::new(file_path);
    parser.read_graph()
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Hash, Serialize, Deserialize)]
pub enum RotationAlgo {
    /// Recompute every candidate rotation cost from scratch
    Simple,
    /// Sweep candidate rotations, updating costs incrementally
    Ripple,
}

impl Default for RotationAlgo {
    fn default() -> Self { RotationAlgo::Ripple }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Hash, Serialize, Deserialize)]
pub enum DebugMode {
    /// Cross-check incremental state after every change (slow)
    On,
    Off,
}

impl Default for DebugMode {
    fn default() -> Self { DebugMode::Off }
}

/// Output of the command line tools.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum OutputKind {
    /// Only the schedule, one op per line
    Schedule,
    /// A table with per-step liveness
    Table,
    /// The schedule and liveness summary as JSON
    Json,
}
