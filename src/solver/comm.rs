//! Communication backend abstraction for SPMD solves.
//!
//! Every rank runs the same two-level loop in lockstep. Convergence
//! decisions are taken on globally reduced norms so that all ranks branch
//! the same way; this trait supplies those reductions.

/// Abstraction over inter-process communication.
///
/// Implementations: `SingleProcessComm` (no-op), `MpiComm` (via mpi crate).
pub trait CommunicationBackend: Send + Sync {
    /// Sum a local scalar across all ranks.
    fn all_reduce_sum(&self, local: f64) -> f64;

    /// Max of a local scalar across all ranks.
    fn all_reduce_max(&self, local: f64) -> f64;

    /// Min of a local integer across all ranks. Used to reach a common
    /// verdict when a local decision (a linear-solve failure) must be
    /// shared.
    fn all_reduce_min_i32(&self, local: i32) -> i32;

    /// This process's rank.
    fn rank(&self) -> usize;

    /// Total number of ranks.
    fn num_ranks(&self) -> usize;
}

/// No-op communication backend for a single process.
pub struct SingleProcessComm;

impl CommunicationBackend for SingleProcessComm {
    fn all_reduce_sum(&self, local: f64) -> f64 {
        local
    }

    fn all_reduce_max(&self, local: f64) -> f64 {
        local
    }

    fn all_reduce_min_i32(&self, local: i32) -> i32 {
        local
    }

    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }
}
