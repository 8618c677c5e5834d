//! MPI communication backend for SPMD two-level solves.
//!
//! Requires the `distributed` feature flag and an MPI installation. The
//! caller must initialize MPI before constructing `MpiComm`:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let comm = MpiComm::new();
//! ```

use super::comm::CommunicationBackend;
use mpi::collective::SystemOperation;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

/// Wraps the MPI world communicator.
pub struct MpiComm;

impl MpiComm {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MpiComm {
    fn default() -> Self {
        Self::new()
    }
}

impl CommunicationBackend for MpiComm {
    fn all_reduce_sum(&self, local: f64) -> f64 {
        let world = SimpleCommunicator::world();
        let mut global = 0.0f64;
        world.all_reduce_into(&local, &mut global, SystemOperation::sum());
        global
    }

    fn all_reduce_max(&self, local: f64) -> f64 {
        let world = SimpleCommunicator::world();
        let mut global = 0.0f64;
        world.all_reduce_into(&local, &mut global, SystemOperation::max());
        global
    }

    fn all_reduce_min_i32(&self, local: i32) -> i32 {
        let world = SimpleCommunicator::world();
        let mut global = 0i32;
        world.all_reduce_into(&local, &mut global, SystemOperation::min());
        global
    }

    fn rank(&self) -> usize {
        SimpleCommunicator::world().rank() as usize
    }

    fn num_ranks(&self) -> usize {
        SimpleCommunicator::world().size() as usize
    }
}
