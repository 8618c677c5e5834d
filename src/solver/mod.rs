//! Linear and nonlinear solvers.

pub mod comm;
#[cfg(feature = "distributed")]
pub mod comm_mpi;
pub mod newton;
pub mod nonlinear;
pub mod sparse_direct;
pub mod trust_region;

use crate::error::Result;
use crate::sparse::CsrMatrix;

use newton::DampedNewton;
use nonlinear::NonlinearSolver;
use trust_region::TrustRegion;

/// A solver for linear systems Ax = b.
pub trait LinearSolver {
    fn solve(&self, a: &CsrMatrix, b: &[f64]) -> Result<Vec<f64>>;
}

/// Nonlinear backend choice, fixed when a solver is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverKind {
    #[default]
    DampedNewton,
    TrustRegion,
}

impl SolverKind {
    /// `NOX=1` selects the trust-region backend.
    pub fn from_nox_flag(nox: bool) -> Self {
        if nox {
            SolverKind::TrustRegion
        } else {
            SolverKind::DampedNewton
        }
    }

    pub fn build(self) -> Box<dyn NonlinearSolver> {
        match self {
            SolverKind::DampedNewton => Box::new(DampedNewton::new()),
            SolverKind::TrustRegion => Box::new(TrustRegion::new()),
        }
    }
}
