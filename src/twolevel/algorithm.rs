//! The six decoupling strategies.
//!
//! Each variant is one method on the orchestrator; `run_variant` is the
//! dispatch table. Shared sub-steps (stats folding, step logging, first-step
//! handling) live on the orchestrator itself.

use std::fmt;

use crate::error::Result;
use crate::loader::{AnalysisInterface, CouplingMode, Loader, OutputSink};
use crate::solver::nonlinear::{NlsContext, SolveStatus};
use crate::solver::SolverKind;

use super::homotopy;
use super::TwoLevelNewton;

/// Strategy selected by `ALGORITHM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlgorithmVariant {
    /// Plain Newton on the full problem.
    #[default]
    Full,
    /// Inner solve to convergence, then one full Newton step, repeated.
    Nested,
    /// `Nested` with continuation on the inner solve.
    NestedContinuation,
    /// Inner solve with continuation, coupling extraction, then one
    /// circuit-only Newton step, repeated.
    DecoupledCircuit,
    /// Whole-problem homotopy over the `CONPARAM` list.
    Homotopy,
    /// Full problem through the inner solver.
    FullViaInner,
}

impl AlgorithmVariant {
    pub fn from_number(n: i64) -> Option<Self> {
        match n {
            0 => Some(AlgorithmVariant::Full),
            1 => Some(AlgorithmVariant::Nested),
            2 => Some(AlgorithmVariant::NestedContinuation),
            3 => Some(AlgorithmVariant::DecoupledCircuit),
            4 => Some(AlgorithmVariant::Homotopy),
            5 => Some(AlgorithmVariant::FullViaInner),
            _ => None,
        }
    }

    pub fn number(self) -> i64 {
        match self {
            AlgorithmVariant::Full => 0,
            AlgorithmVariant::Nested => 1,
            AlgorithmVariant::NestedContinuation => 2,
            AlgorithmVariant::DecoupledCircuit => 3,
            AlgorithmVariant::Homotopy => 4,
            AlgorithmVariant::FullViaInner => 5,
        }
    }

    /// DC algorithm number; anything outside 0..=5 falls back to `Full`.
    pub fn resolve(n: i64) -> Self {
        Self::from_number(n).unwrap_or_else(|| {
            tracing::warn!(algorithm = n, "two-level algorithm out of range, using 0");
            AlgorithmVariant::Full
        })
    }

    /// Transient algorithm number; only 0..=3 are allowed there.
    pub fn resolve_transient(n: i64) -> Self {
        match n {
            0..=3 => Self::resolve(n),
            _ => {
                tracing::warn!(
                    algorithm = n,
                    "transient two-level algorithm out of range, using 0"
                );
                AlgorithmVariant::Full
            }
        }
    }
}

impl fmt::Display for AlgorithmVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl<L: Loader, A: AnalysisInterface, O: OutputSink> TwoLevelNewton<L, A, O> {
    pub(super) fn run_variant(
        &mut self,
        variant: AlgorithmVariant,
        first_dcop: bool,
    ) -> Result<SolveStatus> {
        let _span = tracing::debug_span!("algorithm", variant = variant.number()).entered();
        match variant {
            AlgorithmVariant::Full => self.full(first_dcop),
            AlgorithmVariant::Nested => self.nested(),
            AlgorithmVariant::NestedContinuation => self.nested_continuation(),
            AlgorithmVariant::DecoupledCircuit => self.decoupled_circuit(),
            AlgorithmVariant::Homotopy => self.homotopy(),
            AlgorithmVariant::FullViaInner => self.full_via_inner(),
        }
    }

    /// Variant 0.
    fn full(&mut self, first_dcop: bool) -> Result<SolveStatus> {
        self.mode = CouplingMode::Full;
        let status = self.outer_solve()?;

        if status.converged() && !first_dcop && !self.extract_coupling()? {
            tracing::warn!("coupling terms after full solve are partly stale");
        }

        // Leave a consistent full-problem load for whoever reads it next.
        self.mode = CouplingMode::Full;
        self.reload_jacobian()?;
        Ok(status)
    }

    /// Variant 1.
    fn nested(&mut self) -> Result<SolveStatus> {
        let mut status = SolveStatus::FAILED;
        self.pass_outer = false;

        for step in 0..self.options.max_outer_steps {
            self.mode = CouplingMode::Inner;
            let inner = self.inner_solve()?;
            self.print_step_info(step, inner);
            if !inner.converged() {
                tracing::debug!(status = inner.code(), "inner solve failed, giving up");
                break;
            }

            self.mode = CouplingMode::Full;
            status = self.outer_step(step == 0)?;
            self.pass_outer = true;
            self.print_step_info(step, status);

            if status.converged() {
                break;
            }
        }
        Ok(status)
    }

    /// Variant 2. No voltage-limiting gate, unlike variant 3.
    fn nested_continuation(&mut self) -> Result<SolveStatus> {
        self.pass_outer = false;

        self.mode = CouplingMode::Full;
        let mut status = self.outer_step(true)?;
        self.print_step_info(0, status);
        let mut status_full = status.converged();

        if !status_full {
            for step in 1..=self.options.max_outer_steps {
                let inner = self.solve_inner_problem()?;
                self.print_step_info(step, inner);
                if !inner.converged() && self.options.inner_fail_fatal {
                    tracing::debug!(status = inner.code(), "inner solve failed, giving up");
                    break;
                }

                self.mode = CouplingMode::Full;
                status = self.outer_step(false)?;
                self.pass_outer = true;
                self.print_step_info(step, status);

                if inner.converged() && status.converged() {
                    status_full = true;
                    break;
                }
            }
        }

        Ok(verdict(status, status_full))
    }

    /// Variant 3.
    fn decoupled_circuit(&mut self) -> Result<SolveStatus> {
        let mut status = SolveStatus::FAILED;
        let mut status_full = false;
        self.pass_outer = false;

        for step in 0..self.options.max_outer_steps {
            let inner = self.solve_inner_problem()?;
            self.print_step_info(step, inner);
            if !inner.converged() && self.options.inner_fail_fatal {
                tracing::debug!(status = inner.code(), "inner solve failed, giving up");
                break;
            }

            if !self.extract_coupling()? {
                tracing::warn!(step, "outer step uses partly stale coupling terms");
            }

            self.mode = CouplingMode::Outer;
            status = self.outer_step(step == 0)?;
            self.pass_outer = self.options.outer_kind == SolverKind::TrustRegion;
            self.print_step_info(step, status);

            let limiting = self.system.norm_2(self.system.voltage_limiting());
            let limiting_ok = limiting <= self.options.voltage_limit_tol;
            tracing::debug!(
                limiting,
                tol = self.options.voltage_limit_tol,
                "voltage limiting norm"
            );

            if status.converged() && inner.converged() && limiting_ok {
                status_full = true;
                break;
            }
        }

        let mut enforced = None;
        if self.options.full_newton_enforce && status_full {
            self.mode = CouplingMode::Full;
            let full = self.outer_solve()?;
            self.print_step_info(self.outer.num_iterations(), full);
            enforced = Some(full);
        }

        if !self.extract_coupling()? {
            tracing::warn!("final coupling terms are partly stale");
        }

        Ok(match enforced {
            Some(full) => full,
            None => verdict(status, status_full),
        })
    }

    /// Variant 4.
    fn homotopy(&mut self) -> Result<SolveStatus> {
        self.mode = CouplingMode::Full;
        if self.homotopy_finals.is_none() {
            let finals = homotopy::capture_finals(&self.loader, &self.options.continuation_params);
            self.homotopy_finals = Some(finals);
        }
        let finals = self.homotopy_finals.as_deref().unwrap_or(&[]);
        let suggested = self.active_max_cont_steps();

        let mut run = homotopy::ParameterHomotopy::new(
            &self.options.continuation_params,
            finals,
            &mut self.loader,
            &mut self.system,
            self.outer.as_mut(),
            &mut self.output,
            &mut self.outer_stats,
        );
        run.run(&self.options.step_control, suggested)
    }

    /// Variant 5.
    fn full_via_inner(&mut self) -> Result<SolveStatus> {
        self.mode = CouplingMode::Full;
        let mut ctx = NlsContext::new(&mut self.loader, &mut self.system, self.mode);
        let status = self.inner.solve(&mut ctx, None)?;
        self.inner_stats += self.inner.statistics();
        Ok(status)
    }
}

/// A loop that never reached full convergence reports failure even if its
/// last step happened to succeed.
fn verdict(status: SolveStatus, status_full: bool) -> SolveStatus {
    if status_full || !status.converged() {
        status
    } else {
        SolveStatus::FAILED
    }
}
