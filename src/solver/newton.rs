//! Damped Newton-Raphson backend.
//!
//! Each step loads the Jacobian at the current solution, solves for the
//! full Newton update and applies it, optionally halving the step until the
//! residual max norm decreases. Convergence needs both a small weighted-RMS
//! update and a small residual.

use crate::error::Result;
use crate::loader::AnalysisMode;
use crate::options::OptionBlock;
use crate::stats::SolveStatistics;
use crate::system::LinearSystem;

use super::nonlinear::{
    natural_continuation, NlsContext, NonlinearSolver, ReturnCodes, SearchMethod, SolveStatus,
    SolverCore, StepOutcome, WarmStart,
};
use super::sparse_direct::SparseLuSolver;
use super::LinearSolver;

/// Step halvings tried by the backtracking search.
const MAX_BACKTRACKS: usize = 10;

/// Sufficient-decrease constant for backtracking.
const ARMIJO_C: f64 = 1e-4;

pub struct DampedNewton {
    core: SolverCore,
}

impl Default for DampedNewton {
    fn default() -> Self {
        Self::new()
    }
}

impl DampedNewton {
    pub fn new() -> Self {
        Self::with_linear_solver(Box::new(SparseLuSolver::new()))
    }

    pub fn with_linear_solver(linear: Box<dyn LinearSolver>) -> Self {
        Self {
            core: SolverCore::new(linear),
        }
    }

    /// One Newton step from a residual already loaded at the current solution.
    fn step(&mut self, ctx: &mut NlsContext<'_>) -> Result<StepOutcome> {
        let _span = tracing::debug_span!("newton_iter", iter = self.core.iterations).entered();

        self.core.load_jacobian(ctx)?;
        if !self.core.solve_direction(ctx.system) {
            return Ok(StepOutcome::Failed(SolveStatus(self.core.codes.inner_solve_failed)));
        }

        let x0 = ctx.system.solution().to_vec();
        let dx = ctx.system.newton().to_vec();
        let norm_old = self.core.residual_norm;
        let search = self.core.active_params().search_method;

        let mut lambda = 1.0;
        let mut norm = self.apply_update(ctx, &x0, &dx, lambda)?;
        if search == SearchMethod::Backtrack {
            let mut tries = 0;
            while !(norm.is_finite() && norm <= (1.0 - ARMIJO_C * lambda) * norm_old)
                && tries < MAX_BACKTRACKS
            {
                lambda *= 0.5;
                tries += 1;
                norm = self.apply_update(ctx, &x0, &dx, lambda)?;
            }
            tracing::trace!(lambda, tries, "backtracking done");
        }

        let scaled: Vec<f64> = dx.iter().map(|d| lambda * d).collect();
        let wrms = self.core.update_wrms(ctx.system, &scaled);
        self.core.last_step_norm = ctx.system.norm_2(&scaled);
        self.core.iterations += 1;
        tracing::debug!(wrms, residual = norm, lambda, "newton step");

        Ok(self.core.step_outcome(wrms, norm))
    }

    /// Set x = x0 + lambda * dx and reload the residual.
    fn apply_update(
        &mut self,
        ctx: &mut NlsContext<'_>,
        x0: &[f64],
        dx: &[f64],
        lambda: f64,
    ) -> Result<f64> {
        for ((x, &a), &d) in ctx.system.solution_mut().iter_mut().zip(x0).zip(dx) {
            *x = a + lambda * d;
        }
        self.core.load_residual(ctx)
    }

    fn newton_loop(&mut self, ctx: &mut NlsContext<'_>) -> Result<SolveStatus> {
        self.core.begin_call(true);
        let norm0 = self.core.load_residual(ctx)?;
        if let Some(status) = self.core.initial_status(norm0) {
            return Ok(status);
        }

        let max_steps = self.core.active_params().max_steps;
        for _ in 0..max_steps {
            match self.step(ctx)? {
                StepOutcome::Converged => {
                    tracing::debug!(
                        iterations = self.core.iterations,
                        mode = %ctx.mode,
                        "Newton converged"
                    );
                    return Ok(SolveStatus(self.core.codes.normal_convergence));
                }
                StepOutcome::Failed(status) => return Ok(status),
                StepOutcome::Continue => {}
            }
        }
        Ok(self.core.exhausted_status())
    }

    fn step_status(&self, outcome: StepOutcome) -> SolveStatus {
        match outcome {
            StepOutcome::Converged => SolveStatus(self.core.codes.normal_convergence),
            StepOutcome::Continue => SolveStatus(self.core.codes.too_many_steps),
            StepOutcome::Failed(status) => status,
        }
    }
}

impl NonlinearSolver for DampedNewton {
    fn name(&self) -> &'static str {
        "damped-newton"
    }

    fn initialize_all(&mut self) -> Result<()> {
        self.core.begin_call(true);
        self.core.last_step_norm = 0.0;
        Ok(())
    }

    fn set_options(&mut self, block: &OptionBlock) -> Result<()> {
        self.core.params.apply(block)
    }

    fn set_tran_options(&mut self, block: &OptionBlock) -> Result<()> {
        self.core.tran_params.apply(block)
    }

    fn set_loca_options(&mut self, block: &OptionBlock) -> Result<()> {
        self.core.loca.apply(block)
    }

    fn set_return_codes(&mut self, codes: ReturnCodes) {
        self.core.codes = codes;
    }

    fn return_codes(&self) -> ReturnCodes {
        self.core.codes
    }

    fn set_analysis_mode(&mut self, mode: AnalysisMode) {
        self.core.analysis_mode = mode;
    }

    fn solve(
        &mut self,
        ctx: &mut NlsContext<'_>,
        passing: Option<&dyn NonlinearSolver>,
    ) -> Result<SolveStatus> {
        if let Some(p) = passing {
            tracing::trace!(from = p.name(), "damped Newton ignores warm start");
        }
        let loca = self.core.loca.clone();
        let mut total = SolveStatistics::default();
        let status = natural_continuation(&loca, ctx, |ctx| {
            let status = self.newton_loop(ctx);
            total += &self.core.stats;
            status
        })?;
        self.core.stats = total;
        Ok(status)
    }

    fn take_first_solve_step(
        &mut self,
        ctx: &mut NlsContext<'_>,
        other: Option<&dyn NonlinearSolver>,
    ) -> Result<SolveStatus> {
        if let Some(o) = other {
            tracing::trace!(from = o.name(), "first step after other solver");
        }
        self.core.begin_call(true);
        let norm0 = self.core.load_residual(ctx)?;
        if !norm0.is_finite() {
            return Ok(SolveStatus(self.core.codes.nan_fail));
        }
        let outcome = self.step(ctx)?;
        Ok(self.step_status(outcome))
    }

    fn take_one_solve_step(&mut self, ctx: &mut NlsContext<'_>) -> Result<SolveStatus> {
        self.core.begin_call(false);
        let norm0 = self.core.load_residual(ctx)?;
        if !norm0.is_finite() {
            return Ok(SolveStatus(self.core.codes.nan_fail));
        }
        let outcome = self.step(ctx)?;
        Ok(self.step_status(outcome))
    }

    fn solve_linear_system(&mut self, system: &mut LinearSystem) -> bool {
        self.core.linear_solve(system)
    }

    fn statistics(&self) -> &SolveStatistics {
        &self.core.stats
    }

    fn num_iterations(&self) -> usize {
        self.core.iterations
    }

    fn max_norm_f(&self) -> f64 {
        self.core.max_norm_f
    }

    fn max_norm_f_index(&self) -> Option<usize> {
        self.core.max_norm_f_index
    }

    fn warm_start(&self) -> WarmStart {
        self.core.warm_start()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Result as CrateResult;
    use crate::loader::{CouplingMode, Loader};
    use crate::options::Param;
    use crate::sparse::CsrMatrix;
    use approx::assert_abs_diff_eq;

    /// Scalar equation x^2 - c = 0, enough to exercise the iteration.
    pub(crate) struct Square {
        pub c: f64,
    }

    impl Loader for Square {
        fn load_residual(
            &mut self,
            _mode: CouplingMode,
            system: &mut LinearSystem,
        ) -> CrateResult<()> {
            let x = system.solution()[0];
            system.rhs_mut()[0] = -(x * x - self.c);
            Ok(())
        }
        fn load_jacobian(
            &mut self,
            _mode: CouplingMode,
            system: &mut LinearSystem,
        ) -> CrateResult<()> {
            let x = system.solution()[0];
            system.set_jacobian(CsrMatrix::from_triplets(1, 1, &[(0, 0, 2.0 * x)]));
            Ok(())
        }
        fn enable_pde_continuation(&mut self) -> usize {
            1
        }
        fn disable_pde_continuation(&mut self) {}
        fn set_param(&mut self, name: &str, value: f64) -> CrateResult<()> {
            if name == "C" {
                self.c = value;
            }
            Ok(())
        }
        fn get_param(&self, name: &str) -> Option<f64> {
            (name == "C").then_some(self.c)
        }
        fn num_interface_nodes(&self) -> Vec<usize> {
            Vec::new()
        }
        fn load_coupling_rhs(
            &mut self,
            _sub: usize,
            _iface: usize,
            _rhs: &mut [f64],
        ) -> CrateResult<()> {
            Ok(())
        }
        fn calc_coupling_terms(
            &mut self,
            _sub: usize,
            _iface: usize,
            _direction: &[f64],
        ) -> CrateResult<()> {
            Ok(())
        }
        fn output(&self) {}
    }

    #[test]
    fn converges_on_square_root() {
        let mut loader = Square { c: 4.0 };
        let mut system = LinearSystem::new(1);
        system.solution_mut()[0] = 1.0;
        let mut nls = DampedNewton::new();
        nls.set_options(&OptionBlock::new("NONLIN").with(Param::number("RHSTOL", 1e-12)))
            .expect("options");
        let mut ctx = NlsContext::new(&mut loader, &mut system, CouplingMode::Full);
        let status = nls.solve(&mut ctx, None).expect("solve");
        assert_eq!(status, SolveStatus(2));
        assert_abs_diff_eq!(system.solution()[0], 2.0, epsilon = 1e-8);
        let stats = nls.statistics();
        assert_eq!(stats.residual_loads, stats.jacobian_loads + 1);
        assert_eq!(stats.linear_solves, stats.jacobian_loads);
        assert!(nls.num_iterations() > 0);
    }

    #[test]
    fn already_solved_is_norm_too_small() {
        let mut loader = Square { c: 4.0 };
        let mut system = LinearSystem::new(1);
        system.solution_mut()[0] = 2.0;
        let mut nls = DampedNewton::new();
        let mut ctx = NlsContext::new(&mut loader, &mut system, CouplingMode::Full);
        assert_eq!(nls.solve(&mut ctx, None).expect("solve"), SolveStatus(1));
        assert_eq!(nls.statistics().linear_solves, 0);
    }

    #[test]
    fn singular_jacobian_reports_inner_solve_failed() {
        let mut loader = Square { c: 4.0 };
        let mut system = LinearSystem::new(1);
        let mut nls = DampedNewton::new();
        let mut ctx = NlsContext::new(&mut loader, &mut system, CouplingMode::Full);
        assert_eq!(nls.solve(&mut ctx, None).expect("solve"), SolveStatus(-5));
        assert_eq!(nls.statistics().failed_linear_solves, 1);
    }

    #[test]
    fn step_budget_exhausted() {
        let mut loader = Square { c: 4.0 };
        let mut system = LinearSystem::new(1);
        system.solution_mut()[0] = 100.0;
        let mut nls = DampedNewton::new();
        nls.set_options(&OptionBlock::new("NONLIN").with(Param::number("MAXSTEP", 2.0)))
            .expect("options");
        let mut ctx = NlsContext::new(&mut loader, &mut system, CouplingMode::Full);
        assert_eq!(nls.solve(&mut ctx, None).expect("solve"), SolveStatus(-1));
        assert_eq!(nls.num_iterations(), 2);
    }

    #[test]
    fn transient_mode_uses_transient_options() {
        let mut loader = Square { c: 4.0 };
        let mut system = LinearSystem::new(1);
        system.solution_mut()[0] = 100.0;
        let mut nls = DampedNewton::new();
        nls.set_tran_options(&OptionBlock::new("NONLIN-TRAN").with(Param::number("MAXSTEP", 1.0)))
            .expect("options");
        nls.set_analysis_mode(AnalysisMode::Transient);
        let mut ctx = NlsContext::new(&mut loader, &mut system, CouplingMode::Full);
        assert!(!nls.solve(&mut ctx, None).expect("solve").converged());
        assert_eq!(nls.num_iterations(), 1);
    }

    #[test]
    fn single_steps_reach_convergence() {
        let mut loader = Square { c: 9.0 };
        let mut system = LinearSystem::new(1);
        system.solution_mut()[0] = 2.0;
        let mut nls = DampedNewton::new();
        let mut ctx = NlsContext::new(&mut loader, &mut system, CouplingMode::Full);
        let mut status = nls.take_first_solve_step(&mut ctx, None).expect("step");
        let mut steps = 1;
        while !status.converged() && steps < 20 {
            status = nls.take_one_solve_step(&mut ctx).expect("step");
            steps += 1;
        }
        assert_eq!(status, SolveStatus(2));
        assert_eq!(nls.num_iterations(), steps);
        assert_abs_diff_eq!(system.solution()[0], 3.0, epsilon = 1e-8);
    }

    #[test]
    fn natural_continuation_walks_the_parameter() {
        let mut loader = Square { c: 1.0 };
        let mut system = LinearSystem::new(1);
        system.solution_mut()[0] = 1.0;
        let mut nls = DampedNewton::new();
        nls.set_loca_options(
            &OptionBlock::new("LOCA")
                .with(Param::text("CONPARAM", "C"))
                .with(Param::number("INITIALVALUE", 1.0))
                .with(Param::number("MAXVALUE", 16.0))
                .with(Param::number("MAXSTEPS", 5.0)),
        )
        .expect("options");
        let mut ctx = NlsContext::new(&mut loader, &mut system, CouplingMode::Full);
        assert!(nls.solve(&mut ctx, None).expect("solve").converged());
        assert_abs_diff_eq!(system.solution()[0], 4.0, epsilon = 1e-8);
        assert_eq!(loader.c, 16.0);
    }
}
