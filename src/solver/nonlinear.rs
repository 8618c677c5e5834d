//! Nonlinear solver capability used by the two-level orchestrator.
//!
//! A `NonlinearSolver` drives the loader through Newton-type iterations on
//! whichever part of the coupled problem its `NlsContext` selects. Two
//! backends implement it (`DampedNewton`, `TrustRegion`); both share the
//! bookkeeping in `SolverCore`.

use std::fmt;
use std::time::Instant;

use crate::error::Result;
use crate::loader::{AnalysisMode, CouplingMode, Loader};
use crate::options::OptionBlock;
use crate::stats::SolveStatistics;
use crate::system::{max_abs_index, LinearSystem};

use super::LinearSolver;

/// Status codes a backend reports. Positive means converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnCodes {
    pub norm_too_small: i32,
    pub normal_convergence: i32,
    pub near_convergence: i32,
    pub small_update: i32,
    pub too_many_steps: i32,
    pub update_too_big: i32,
    pub stalled: i32,
    pub wrms_exact_zero: i32,
    pub inner_solve_failed: i32,
    pub nan_fail: i32,
}

impl Default for ReturnCodes {
    fn default() -> Self {
        Self {
            norm_too_small: 1,
            normal_convergence: 2,
            near_convergence: 3,
            small_update: 4,
            too_many_steps: -1,
            update_too_big: -2,
            stalled: -3,
            wrms_exact_zero: -4,
            inner_solve_failed: -5,
            nan_fail: -6,
        }
    }
}

/// Integer result of a solve or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolveStatus(pub i32);

impl SolveStatus {
    /// Generic failure; also the value a loop reports before its first step.
    pub const FAILED: SolveStatus = SolveStatus(-1);

    pub fn converged(self) -> bool {
        self.0 > 0
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a solver works on during one call.
pub struct NlsContext<'a> {
    pub loader: &'a mut dyn Loader,
    pub system: &'a mut LinearSystem,
    pub mode: CouplingMode,
}

impl<'a> NlsContext<'a> {
    pub fn new(
        loader: &'a mut dyn Loader,
        system: &'a mut LinearSystem,
        mode: CouplingMode,
    ) -> Self {
        Self { loader, system, mode }
    }
}

/// Hint one solver leaves for the next, passed via `passing`/`other`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WarmStart {
    /// Euclidean length of the last accepted update.
    pub last_step_norm: f64,
    pub iterations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMethod {
    #[default]
    Full,
    Backtrack,
}

/// Newton iteration settings, from the `NONLIN` family of option blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct NewtonParams {
    pub max_steps: usize,
    /// Max-norm residual tolerance.
    pub rhs_tol: f64,
    /// Absolute floor of the update weights.
    pub abs_tol: f64,
    pub rel_tol: f64,
    /// Weighted-RMS update tolerance.
    pub delta_x_tol: f64,
    pub search_method: SearchMethod,
    /// Initial trust-region radius.
    pub trust_radius: f64,
}

impl Default for NewtonParams {
    fn default() -> Self {
        Self {
            max_steps: 200,
            rhs_tol: 1e-6,
            abs_tol: 1e-6,
            rel_tol: 1e-3,
            delta_x_tol: 1.0,
            search_method: SearchMethod::Full,
            trust_radius: 1.0,
        }
    }
}

impl NewtonParams {
    /// Apply recognised tags; unknown ones are logged and ignored.
    pub fn apply(&mut self, block: &OptionBlock) -> Result<()> {
        for p in &block.params {
            match p.tag.as_str() {
                "MAXSTEP" => self.max_steps = p.expect_int()?.max(1) as usize,
                "RHSTOL" => self.rhs_tol = p.expect_f64()?,
                "ABSTOL" => self.abs_tol = p.expect_f64()?,
                "RELTOL" => self.rel_tol = p.expect_f64()?,
                "DELTAXTOL" => self.delta_x_tol = p.expect_f64()?,
                "SEARCHMETHOD" => {
                    self.search_method = if p.expect_int()? == 0 {
                        SearchMethod::Full
                    } else {
                        SearchMethod::Backtrack
                    }
                }
                "TRUSTRADIUS" => self.trust_radius = p.expect_f64()?,
                "NOX" => {}
                other => tracing::warn!(
                    block = %block.name,
                    tag = other,
                    "ignoring unknown nonlinear option"
                ),
            }
        }
        Ok(())
    }
}

/// Natural-parameter continuation run inside a backend's `solve`.
#[derive(Debug, Clone, PartialEq)]
pub struct LocaParams {
    pub parameter: Option<String>,
    pub initial: f64,
    pub target: f64,
    pub steps: usize,
}

impl Default for LocaParams {
    fn default() -> Self {
        Self {
            parameter: None,
            initial: 0.0,
            target: 1.0,
            steps: 10,
        }
    }
}

impl LocaParams {
    pub fn apply(&mut self, block: &OptionBlock) -> Result<()> {
        for p in &block.params {
            match p.tag.as_str() {
                "CONPARAM" => {
                    self.parameter = Some(match p.as_str() {
                        Some(s) => s.to_string(),
                        None => p.expect_f64()?.to_string(),
                    })
                }
                "INITIALVALUE" => self.initial = p.expect_f64()?,
                "MAXVALUE" => self.target = p.expect_f64()?,
                "MAXSTEPS" => self.steps = p.expect_int()?.max(1) as usize,
                other => tracing::warn!(
                    block = %block.name,
                    tag = other,
                    "ignoring unknown continuation option"
                ),
            }
        }
        Ok(())
    }
}

/// A Newton-type solver over a loader and a linear system.
///
/// Statistics describe the most recent call only: every entry point
/// resets them.
pub trait NonlinearSolver {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn initialize_all(&mut self) -> Result<()>;

    fn set_options(&mut self, block: &OptionBlock) -> Result<()>;

    /// Options used while the analysis mode is transient.
    fn set_tran_options(&mut self, block: &OptionBlock) -> Result<()>;

    fn set_loca_options(&mut self, block: &OptionBlock) -> Result<()>;

    fn set_return_codes(&mut self, codes: ReturnCodes);

    fn return_codes(&self) -> ReturnCodes;

    fn set_analysis_mode(&mut self, mode: AnalysisMode);

    /// Iterate to convergence or exhaustion. `passing` is the solver that
    /// ran last, if its state is a useful starting point.
    fn solve(
        &mut self,
        ctx: &mut NlsContext<'_>,
        passing: Option<&dyn NonlinearSolver>,
    ) -> Result<SolveStatus>;

    /// Start a fresh iteration and take a single step.
    fn take_first_solve_step(
        &mut self,
        ctx: &mut NlsContext<'_>,
        other: Option<&dyn NonlinearSolver>,
    ) -> Result<SolveStatus>;

    /// Take one more step of the iteration begun by `take_first_solve_step`.
    fn take_one_solve_step(&mut self, ctx: &mut NlsContext<'_>) -> Result<SolveStatus>;

    /// Solve `J newton = rhs` with the currently loaded Jacobian. Returns
    /// false if the linear solver failed.
    fn solve_linear_system(&mut self, system: &mut LinearSystem) -> bool;

    fn statistics(&self) -> &SolveStatistics;

    fn num_iterations(&self) -> usize;

    fn max_norm_f(&self) -> f64;

    fn max_norm_f_index(&self) -> Option<usize>;

    fn warm_start(&self) -> WarmStart;
}

/// Outcome of one Newton-type step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Converged,
    Continue,
    Failed(SolveStatus),
}

/// State and helpers common to both backends.
pub struct SolverCore {
    pub params: NewtonParams,
    pub tran_params: NewtonParams,
    pub loca: LocaParams,
    pub codes: ReturnCodes,
    pub stats: SolveStatistics,
    pub analysis_mode: AnalysisMode,
    pub iterations: usize,
    pub max_norm_f: f64,
    pub max_norm_f_index: Option<usize>,
    pub residual_norm: f64,
    pub last_step_norm: f64,
    linear: Box<dyn LinearSolver>,
}

impl SolverCore {
    pub fn new(linear: Box<dyn LinearSolver>) -> Self {
        Self {
            params: NewtonParams::default(),
            tran_params: NewtonParams::default(),
            loca: LocaParams::default(),
            codes: ReturnCodes::default(),
            stats: SolveStatistics::default(),
            analysis_mode: AnalysisMode::default(),
            iterations: 0,
            max_norm_f: 0.0,
            max_norm_f_index: None,
            residual_norm: f64::INFINITY,
            last_step_norm: 0.0,
            linear,
        }
    }

    pub fn active_params(&self) -> &NewtonParams {
        match self.analysis_mode {
            AnalysisMode::Transient => &self.tran_params,
            _ => &self.params,
        }
    }

    /// Reset per-call figures. `fresh` also restarts the iteration count.
    pub fn begin_call(&mut self, fresh: bool) {
        self.stats.zero();
        if fresh {
            self.iterations = 0;
            self.max_norm_f = 0.0;
            self.max_norm_f_index = None;
        }
    }

    /// Load the residual at the current solution and return its max norm.
    pub fn load_residual(&mut self, ctx: &mut NlsContext<'_>) -> Result<f64> {
        let t = Instant::now();
        ctx.loader.load_residual(ctx.mode, ctx.system)?;
        self.stats.residual_load_time += t.elapsed();
        self.stats.residual_loads += 1;

        let norm = ctx.system.norm_inf(ctx.system.rhs());
        self.residual_norm = norm;
        self.max_norm_f = norm;
        self.max_norm_f_index = max_abs_index(ctx.system.rhs());
        Ok(norm)
    }

    pub fn load_jacobian(&mut self, ctx: &mut NlsContext<'_>) -> Result<()> {
        let t = Instant::now();
        ctx.loader.load_jacobian(ctx.mode, ctx.system)?;
        self.stats.jacobian_load_time += t.elapsed();
        self.stats.jacobian_loads += 1;
        Ok(())
    }

    /// Solve for the Newton direction, recording the work in `self.stats`.
    pub fn solve_direction(&mut self, system: &mut LinearSystem) -> bool {
        let t = Instant::now();
        let ok = self.linear_solve(system);
        self.stats.linear_solve_time += t.elapsed();
        self.stats.linear_solves += 1;
        self.stats.jacobian_factorizations += 1;
        self.stats.total_linear_iterations += 1;
        if !ok {
            self.stats.failed_linear_solves += 1;
        }
        ok
    }

    /// Bare linear solve into the Newton vector. All ranks agree on the
    /// verdict.
    pub fn linear_solve(&self, system: &mut LinearSystem) -> bool {
        let (a, b, out) = system.split_for_solve();
        let local_ok = match self.linear.solve(a, b) {
            Ok(x) => {
                out.copy_from_slice(&x);
                1
            }
            Err(e) => {
                tracing::debug!(?e, "linear solve failed");
                out.fill(0.0);
                0
            }
        };
        system.comm().all_reduce_min_i32(local_ok) == 1
    }

    /// Weighted RMS of `step` against the current solution.
    pub fn update_wrms(&self, system: &LinearSystem, step: &[f64]) -> f64 {
        let params = self.active_params();
        let local: f64 = step
            .iter()
            .zip(system.solution())
            .map(|(dx, x)| {
                let w = params.rel_tol * x.abs() + params.abs_tol;
                (dx / w).powi(2)
            })
            .sum();
        let n = system.global_size().max(1.0);
        (system.comm().all_reduce_sum(local) / n).sqrt()
    }

    /// Convergence test after an accepted step.
    pub fn step_outcome(&self, wrms: f64, residual_norm: f64) -> StepOutcome {
        if !wrms.is_finite() || !residual_norm.is_finite() {
            return StepOutcome::Failed(SolveStatus(self.codes.nan_fail));
        }
        let params = self.active_params();
        if wrms <= params.delta_x_tol && residual_norm <= params.rhs_tol {
            StepOutcome::Converged
        } else {
            StepOutcome::Continue
        }
    }

    /// Status for an initial residual that needs no iteration at all.
    pub fn initial_status(&self, norm: f64) -> Option<SolveStatus> {
        if !norm.is_finite() {
            Some(SolveStatus(self.codes.nan_fail))
        } else if norm <= self.active_params().rhs_tol * NORM_TOO_SMALL_FACTOR {
            Some(SolveStatus(self.codes.norm_too_small))
        } else {
            None
        }
    }

    /// Status once the step budget is spent.
    pub fn exhausted_status(&self) -> SolveStatus {
        if self.residual_norm <= NEAR_CONVERGENCE_FACTOR * self.active_params().rhs_tol {
            SolveStatus(self.codes.near_convergence)
        } else {
            SolveStatus(self.codes.too_many_steps)
        }
    }

    pub fn warm_start(&self) -> WarmStart {
        WarmStart {
            last_step_norm: self.last_step_norm,
            iterations: self.iterations,
        }
    }
}

/// Initial residuals below `rhs_tol` times this are already solved.
const NORM_TOO_SMALL_FACTOR: f64 = 1e-3;

/// Exhausted runs within this multiple of `rhs_tol` count as nearly converged.
const NEAR_CONVERGENCE_FACTOR: f64 = 10.0;

/// March the LOCA parameter from its initial to its target value in equal
/// steps, solving at each. Without a parameter this is a single solve.
pub(crate) fn natural_continuation<F>(
    loca: &LocaParams,
    ctx: &mut NlsContext<'_>,
    mut solve: F,
) -> Result<SolveStatus>
where
    F: FnMut(&mut NlsContext<'_>) -> Result<SolveStatus>,
{
    let Some(name) = loca.parameter.as_deref() else {
        return solve(ctx);
    };

    let steps = loca.steps.max(1);
    let mut status = SolveStatus::FAILED;
    for k in 0..=steps {
        let value = loca.initial + (loca.target - loca.initial) * k as f64 / steps as f64;
        ctx.loader.set_param(name, value)?;
        status = solve(ctx)?;
        tracing::debug!(parameter = name, value, status = status.0, "natural continuation step");
        if !status.converged() {
            break;
        }
    }
    Ok(status)
}
