//! Dogleg trust-region backend.
//!
//! Minimises `0.5 * ||F||^2` by combining the Newton step with the Cauchy
//! (steepest-descent) step inside a radius that grows on good agreement
//! between predicted and actual reduction and shrinks otherwise. Selected
//! with `NOX=1`; a solver passed in as `passing`/`other` seeds the radius
//! with its last step length.

use crate::error::Result;
use crate::loader::AnalysisMode;
use crate::options::OptionBlock;
use crate::stats::SolveStatistics;
use crate::system::LinearSystem;

use super::nonlinear::{
    natural_continuation, NlsContext, NonlinearSolver, ReturnCodes, SolveStatus, SolverCore,
    StepOutcome, WarmStart,
};
use super::sparse_direct::SparseLuSolver;
use super::LinearSolver;

const MIN_RADIUS: f64 = 1e-12;
const MAX_RADIUS: f64 = 1e6;
/// Reduction ratio below which a trial step is rejected.
const ACCEPT_RATIO: f64 = 1e-4;

pub struct TrustRegion {
    core: SolverCore,
    radius: f64,
}

impl Default for TrustRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustRegion {
    pub fn new() -> Self {
        Self::with_linear_solver(Box::new(SparseLuSolver::new()))
    }

    pub fn with_linear_solver(linear: Box<dyn LinearSolver>) -> Self {
        let core = SolverCore::new(linear);
        let radius = core.params.trust_radius;
        Self { core, radius }
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    fn reset_radius(&mut self, seed: Option<&dyn NonlinearSolver>) {
        self.radius = self.core.active_params().trust_radius;
        if let Some(other) = seed {
            let hint = other.warm_start().last_step_norm;
            if hint > MIN_RADIUS {
                self.radius = hint.min(MAX_RADIUS);
                tracing::trace!(from = other.name(), radius = self.radius, "trust radius seeded");
            }
        }
    }

    /// One trial step from a residual already loaded at the current solution.
    fn step(&mut self, ctx: &mut NlsContext<'_>) -> Result<StepOutcome> {
        let _span = tracing::debug_span!("dogleg_iter", iter = self.core.iterations).entered();
        self.core.iterations += 1;

        self.core.load_jacobian(ctx)?;
        let newton_ok = self.core.solve_direction(ctx.system);

        let rhs = ctx.system.rhs().to_vec();
        let f_old = 0.5 * ctx.system.dot(&rhs, &rhs);
        if f_old == 0.0 {
            // Already an exact root.
            self.core.last_step_norm = 0.0;
            return Ok(self.core.step_outcome(0.0, 0.0));
        }

        // Steepest descent of 0.5||F||^2 is -J^T F = J^T rhs.
        let grad: Vec<f64> = ctx.system.jacobian().spmv_transpose(&rhs);
        let j_grad = ctx.system.jacobian().spmv(&grad);
        let gg = ctx.system.dot(&grad, &grad);
        let jgjg = ctx.system.dot(&j_grad, &j_grad);
        if gg == 0.0 || jgjg == 0.0 {
            return Ok(StepOutcome::Failed(SolveStatus(self.core.codes.stalled)));
        }
        let cauchy: Vec<f64> = grad.iter().map(|g| g * gg / jgjg).collect();

        let d = if newton_ok {
            let newton = ctx.system.newton().to_vec();
            self.dogleg(ctx.system, &cauchy, &newton)
        } else {
            let len = ctx.system.norm_2(&cauchy);
            let scale = if len > self.radius { self.radius / len } else { 1.0 };
            cauchy.iter().map(|c| c * scale).collect()
        };
        let d_norm = ctx.system.norm_2(&d);

        // Model: 0.5||J d - rhs||^2
        let jd = ctx.system.jacobian().spmv(&d);
        let model: Vec<f64> = jd.iter().zip(&rhs).map(|(a, b)| a - b).collect();
        let predicted = f_old - 0.5 * ctx.system.dot(&model, &model);

        let saved = ctx.system.snapshot();
        for (x, dx) in ctx.system.solution_mut().iter_mut().zip(&d) {
            *x += dx;
        }
        let norm_new = self.core.load_residual(ctx)?;
        let f_new = 0.5 * ctx.system.dot(ctx.system.rhs(), ctx.system.rhs());
        let rho = if predicted > 0.0 { (f_old - f_new) / predicted } else { -1.0 };

        if !(rho >= ACCEPT_RATIO && f_new.is_finite()) {
            ctx.system.restore(&saved);
            self.core.residual_norm = ctx.system.norm_inf(ctx.system.rhs());
            self.radius = 0.25 * d_norm.min(self.radius);
            tracing::debug!(rho, radius = self.radius, "trust-region step rejected");
            if self.radius < MIN_RADIUS {
                return Ok(StepOutcome::Failed(SolveStatus(self.core.codes.stalled)));
            }
            return Ok(StepOutcome::Continue);
        }

        if rho < 0.25 {
            self.radius = 0.25 * d_norm;
        } else if rho > 0.75 && d_norm >= 0.99 * self.radius {
            self.radius = (2.0 * self.radius).min(MAX_RADIUS);
        }
        self.radius = self.radius.max(MIN_RADIUS);

        let wrms = self.core.update_wrms(ctx.system, &d);
        self.core.last_step_norm = d_norm;
        tracing::debug!(wrms, residual = norm_new, rho, radius = self.radius, "trust-region step");
        Ok(self.core.step_outcome(wrms, norm_new))
    }

    /// Point on the dogleg path at the current radius.
    fn dogleg(&self, system: &LinearSystem, cauchy: &[f64], newton: &[f64]) -> Vec<f64> {
        let newton_len = system.norm_2(newton);
        if newton_len <= self.radius {
            return newton.to_vec();
        }
        let cauchy_len = system.norm_2(cauchy);
        if cauchy_len >= self.radius {
            return cauchy.iter().map(|c| c * self.radius / cauchy_len).collect();
        }
        // ||c + tau (n - c)|| = radius
        let diff: Vec<f64> = newton.iter().zip(cauchy).map(|(n, c)| n - c).collect();
        let a = system.dot(&diff, &diff);
        let b = 2.0 * system.dot(cauchy, &diff);
        let c = cauchy_len * cauchy_len - self.radius * self.radius;
        let tau = (-b + (b * b - 4.0 * a * c).max(0.0).sqrt()) / (2.0 * a);
        cauchy.iter().zip(&diff).map(|(c, d)| c + tau * d).collect()
    }

    fn dogleg_loop(&mut self, ctx: &mut NlsContext<'_>) -> Result<SolveStatus> {
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
                        "trust region converged"
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

impl NonlinearSolver for TrustRegion {
    fn name(&self) -> &'static str {
        "trust-region"
    }

    fn initialize_all(&mut self) -> Result<()> {
        self.core.begin_call(true);
        self.core.last_step_norm = 0.0;
        self.radius = self.core.active_params().trust_radius;
        Ok(())
    }

    fn set_options(&mut self, block: &OptionBlock) -> Result<()> {
        self.core.params.apply(block)?;
        self.radius = self.core.active_params().trust_radius;
        Ok(())
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
        self.reset_radius(passing);
        let loca = self.core.loca.clone();
        let mut total = SolveStatistics::default();
        let status = natural_continuation(&loca, ctx, |ctx| {
            let status = self.dogleg_loop(ctx);
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
        self.reset_radius(other);
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
mod tests {
    use super::*;
    use crate::loader::CouplingMode;
    use crate::solver::newton::tests::Square;
    use crate::options::Param;
    use crate::solver::newton::DampedNewton;
    use approx::assert_abs_diff_eq;

    #[test]
    fn converges_from_far_start() {
        let mut loader = Square { c: 2.0 };
        let mut system = LinearSystem::new(1);
        system.solution_mut()[0] = 50.0;
        let mut nls = TrustRegion::new();
        let block = OptionBlock::new("NONLIN")
            .with(Param::number("RHSTOL", 1e-12))
            .with(Param::number("MAXSTEP", 50.0));
        nls.set_options(&block).expect("options");
        let mut ctx = NlsContext::new(&mut loader, &mut system, CouplingMode::Full);
        let status = nls.solve(&mut ctx, None).expect("solve");
        assert_eq!(status, SolveStatus(2));
        assert_abs_diff_eq!(system.solution()[0], 2.0f64.sqrt(), epsilon = 1e-8);
    }

    #[test]
    fn radius_never_exceeded_on_first_step() {
        let mut loader = Square { c: 2.0 };
        let mut system = LinearSystem::new(1);
        system.solution_mut()[0] = 50.0;
        let mut nls = TrustRegion::new();
        let mut ctx = NlsContext::new(&mut loader, &mut system, CouplingMode::Full);
        let status = nls.take_first_solve_step(&mut ctx, None).expect("step");
        assert!(!status.converged());
        assert!((system.solution()[0] - 50.0).abs() <= 1.0 + 1e-12);
    }

    #[test]
    fn radius_seeded_from_passing_solver() {
        let mut loader = Square { c: 4.0 };
        let mut system = LinearSystem::new(1);
        system.solution_mut()[0] = 1.0;
        let mut newton = DampedNewton::new();
        {
            let mut ctx = NlsContext::new(&mut loader, &mut system, CouplingMode::Full);
            newton.solve(&mut ctx, None).expect("solve");
        }
        let hint = newton.warm_start().last_step_norm;
        assert!(hint > 0.0);

        let mut tr = TrustRegion::new();
        tr.reset_radius(Some(&newton as &dyn NonlinearSolver));
        assert_abs_diff_eq!(tr.radius(), hint);
    }
}
