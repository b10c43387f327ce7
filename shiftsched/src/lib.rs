//! Welcome to `shiftsched`!
//!
//! A memory-aware topological scheduler: given a DAG of ops, each
//! touching some allocs, find a linear schedule which respects every
//! constraint and link while keeping the amount of simultaneously live
//! memory low.

mod op;
mod bits;
mod scc;

pub mod weight;
pub mod graph;
pub mod closure;
pub mod kahn;
pub mod serial;
pub mod cache;
pub mod analyze;
pub mod algo;
pub mod helpe;

pub use crate::helpe::*;
pub use crate::scc::{connected_components, strongly_connected_components, scc_summary};

/// A schedulable unit of work: one node of the DAG.
///
/// The precedence constraints of an op are stored on both of their
/// ends: if `a` must come before `b`, then `b` is in `a.outs` and `a`
/// is in `b.ins`. All three address vectors are kept sorted and free of
/// duplicates at all times.
///
/// > ***ATTENTION:*** Links are *stronger* than constraints. If
/// > `a.fwd_link == Some(b)` then `b` sits at the schedule index right
/// > after `a` in every returned schedule. A link always implies the
/// > constraint `a -> b`, which is inserted along with it.
#[derive(Debug, Clone)]
pub struct Op {
    pub(crate) address:     OpAddress,
    pub(crate) ins:         Vec<OpAddress>,
    pub(crate) outs:        Vec<OpAddress>,
    pub(crate) allocs:      Vec<AllocAddress>,
    pub(crate) fwd_link:    Option<OpAddress>,
    pub(crate) bwd_link:    Option<OpAddress>,
    // Only used for reporting; never part of the graph's identity
    // when comparing without names.
    pub(crate) debug_name:  String,
}

/// A memory region which is live from the first to the last of its
/// ops, both ends included.
#[derive(Debug, Clone, PartialEq)]
pub struct Alloc {
    pub(crate) address: AllocAddress,
    pub(crate) weight:  AllocWeight,
    pub(crate) ops:     Vec<OpAddress>,
}
