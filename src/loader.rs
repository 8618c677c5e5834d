//! Contracts between the two-level solver and the rest of the simulator.
//!
//! The `Loader` assembles residuals and Jacobians for whichever part of the
//! coupled problem the current `CouplingMode` selects. `AnalysisInterface`
//! tells the solver where the enclosing analysis stands, and `OutputSink`
//! receives homotopy progress.

use std::fmt;

use crate::error::Result;
use crate::system::LinearSystem;

/// Which part of the coupled problem a load assembles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CouplingMode {
    /// Circuit and devices together.
    #[default]
    Full,
    /// Device interiors only; circuit unknowns held fixed.
    Inner,
    /// Circuit only; devices replaced by their extracted coupling terms.
    Outer,
}

impl fmt::Display for CouplingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CouplingMode::Full => "FULL_PROBLEM",
            CouplingMode::Inner => "INNER_PROBLEM",
            CouplingMode::Outer => "OUTER_PROBLEM",
        };
        f.write_str(name)
    }
}

/// Enclosing analysis kind, forwarded to the sub-solvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalysisMode {
    #[default]
    DcOp,
    DcSweep,
    Transient,
}

impl AnalysisMode {
    /// Numeric code as used by option files and logs.
    pub fn code(self) -> i32 {
        match self {
            AnalysisMode::DcOp => 0,
            AnalysisMode::DcSweep => 1,
            AnalysisMode::Transient => 2,
        }
    }
}

/// Time-integration method code for a DC operating point.
pub const TIME_INT_DC_OP: i32 = 0;

/// Snapshot of the time integrator's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeIntInfo {
    pub double_dcop_enabled: bool,
    pub time_int_mode: i32,
    pub double_dcop_step: usize,
}

impl TimeIntInfo {
    /// First pass of a two-pass DC operating point: the coupling terms do
    /// not exist yet, so only a full-problem solve makes sense.
    pub fn is_first_dcop(&self) -> bool {
        self.double_dcop_enabled
            && self.time_int_mode == TIME_INT_DC_OP
            && self.double_dcop_step == 0
    }
}

/// Assembles the coupled problem into a `LinearSystem`.
///
/// Loads read `system.solution()` and write `system.rhs_mut()` (negated
/// residual), the Jacobian and the voltage-limiting vector.
pub trait Loader {
    /// Assemble the negated residual for `mode` at the current solution.
    fn load_residual(&mut self, mode: CouplingMode, system: &mut LinearSystem) -> Result<()>;

    /// Assemble the Jacobian for `mode` at the current solution.
    fn load_jacobian(&mut self, mode: CouplingMode, system: &mut LinearSystem) -> Result<()>;

    /// Switch sub-problems to ramped boundary conditions. Returns the number
    /// of steps the devices suggest for the ramp.
    fn enable_pde_continuation(&mut self) -> usize;

    /// Restore full boundary conditions after a ramp.
    fn disable_pde_continuation(&mut self);

    /// Set a named scalar parameter. `pdealpha` drives the boundary ramp.
    fn set_param(&mut self, name: &str, value: f64) -> Result<()>;

    /// Read a named scalar parameter, `None` if the loader does not know it.
    fn get_param(&self, name: &str) -> Option<f64>;

    /// Interface-node count per sub-problem.
    fn num_interface_nodes(&self) -> Vec<usize>;

    /// Write the sensitivity of sub-problem `sub` to interface node `iface`
    /// into `rhs` (already zeroed).
    fn load_coupling_rhs(&mut self, sub: usize, iface: usize, rhs: &mut [f64]) -> Result<()>;

    /// Turn the solved direction for `(sub, iface)` into coupling terms.
    fn calc_coupling_terms(&mut self, sub: usize, iface: usize, direction: &[f64]) -> Result<()>;

    /// Diagnostic dump of the current device state.
    fn output(&self);
}

pub trait AnalysisInterface {
    fn time_int_info(&self) -> TimeIntInfo;
}

/// Receives one record per accepted homotopy step.
pub trait OutputSink {
    fn output_homotopy(&mut self, names: &[String], values: &[f64], solution: &[f64]) -> Result<()>;
}

impl<T: OutputSink + ?Sized> OutputSink for Box<T> {
    fn output_homotopy(
        &mut self,
        names: &[String],
        values: &[f64],
        solution: &[f64],
    ) -> Result<()> {
        (**self).output_homotopy(names, values, solution)
    }
}

/// Fixed analysis state. Enough for a standalone operating point.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticAnalysis {
    pub info: TimeIntInfo,
}

impl AnalysisInterface for StaticAnalysis {
    fn time_int_info(&self) -> TimeIntInfo {
        self.info
    }
}

/// Sink that drops homotopy output.
#[derive(Debug, Default)]
pub struct NullOutput;

impl OutputSink for NullOutput {
    fn output_homotopy(
        &mut self,
        _names: &[String],
        _values: &[f64],
        _solution: &[f64],
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_dcop_requires_all_three_conditions() {
        let first = TimeIntInfo {
            double_dcop_enabled: true,
            time_int_mode: TIME_INT_DC_OP,
            double_dcop_step: 0,
        };
        assert!(first.is_first_dcop());
        assert!(!TimeIntInfo { double_dcop_step: 1, ..first }.is_first_dcop());
        assert!(!TimeIntInfo { double_dcop_enabled: false, ..first }.is_first_dcop());
        assert!(!TimeIntInfo { time_int_mode: 1, ..first }.is_first_dcop());
    }

    #[test]
    fn coupling_mode_names() {
        assert_eq!(CouplingMode::Inner.to_string(), "INNER_PROBLEM");
        assert_eq!(CouplingMode::default(), CouplingMode::Full);
    }
}
