//! Coupling-term extraction between the circuit and the device sub-problems.
//!
//! For every (sub-problem, interface node) pair the loader writes the
//! derivative of the device residual with respect to the interface voltage
//! into the right-hand side, one linear solve against the device-only
//! Jacobian turns it into a sensitivity direction, and the loader folds that
//! direction into its reduced conductance model.

use std::time::Instant;

use crate::error::Result;
use crate::loader::{CouplingMode, Loader};
use crate::solver::nonlinear::NonlinearSolver;
use crate::stats::SolveStatistics;
use crate::system::LinearSystem;

/// Saves the right-hand side and coupling mode on entry and puts both back
/// when dropped, whichever way the extraction exits.
pub struct CouplingScope<'a> {
    system: &'a mut LinearSystem,
    mode: &'a mut CouplingMode,
    saved_rhs: Vec<f64>,
    saved_mode: CouplingMode,
}

impl<'a> CouplingScope<'a> {
    pub fn enter(
        system: &'a mut LinearSystem,
        mode: &'a mut CouplingMode,
        temporary: CouplingMode,
    ) -> Self {
        let saved_rhs = system.rhs().to_vec();
        let saved_mode = *mode;
        *mode = temporary;
        Self {
            system,
            mode,
            saved_rhs,
            saved_mode,
        }
    }

    pub fn system(&mut self) -> &mut LinearSystem {
        &mut *self.system
    }

    pub fn mode(&self) -> CouplingMode {
        *self.mode
    }
}

impl Drop for CouplingScope<'_> {
    fn drop(&mut self) {
        self.system.rhs_mut().copy_from_slice(&self.saved_rhs);
        *self.mode = self.saved_mode;
    }
}

/// Run one extraction pass over `layout` (interface-node count per
/// sub-problem). Returns false if any auxiliary linear solve failed; the
/// pairs that did solve still update the loader.
pub fn extract(
    layout: &[usize],
    loader: &mut dyn Loader,
    solver: &mut dyn NonlinearSolver,
    system: &mut LinearSystem,
    mode: &mut CouplingMode,
    stats: &mut SolveStatistics,
) -> Result<bool> {
    let _span = tracing::debug_span!("coupling_extraction").entered();
    let mut scope = CouplingScope::enter(system, mode, CouplingMode::Inner);
    let mut all_ok = true;

    let t = Instant::now();
    loader.load_jacobian(scope.mode(), scope.system())?;
    stats.jacobian_load_time += t.elapsed();
    stats.jacobian_loads += 1;

    for (sub, &count) in layout.iter().enumerate() {
        for iface in 0..count {
            let sys = scope.system();
            sys.rhs_mut().fill(0.0);
            loader.load_coupling_rhs(sub, iface, sys.rhs_mut())?;

            let t = Instant::now();
            let ok = solver.solve_linear_system(sys);
            stats.linear_solve_time += t.elapsed();
            stats.linear_solves += 1;

            if !ok {
                stats.failed_linear_solves += 1;
                all_ok = false;
                tracing::warn!(sub, iface, "coupling solve failed, keeping previous terms");
                continue;
            }
            loader.calc_coupling_terms(sub, iface, sys.newton())?;
        }
    }

    Ok(all_ok)
}
