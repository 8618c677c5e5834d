//! Two-level Newton orchestration.
//!
//! `TwoLevelNewton` owns an outer and an inner nonlinear solver and
//! sequences them over a coupled circuit/device problem according to the
//! configured `AlgorithmVariant`. The outer solver works on the full problem
//! (or on the circuit alone, with the devices reduced to extracted coupling
//! terms); the inner solver works on the device interiors with the circuit
//! held fixed.

pub mod algorithm;
pub mod config;
pub mod continuation;
pub mod coupling;
pub mod homotopy;

use std::time::Instant;

use crate::error::{Result, TwoLevelError};
use crate::loader::{AnalysisInterface, AnalysisMode, CouplingMode, Loader, OutputSink};
use crate::solver::nonlinear::{NlsContext, NonlinearSolver, SolveStatus};
use crate::stats::SolveStatistics;
use crate::system::LinearSystem;

pub use algorithm::AlgorithmVariant;
pub use config::{ContinuationType, SolverConfig, TwoLevelOptions};
pub use continuation::{ContinuationParams, ContinuationState, Ramp};

use continuation::ContinuationProblem;

/// Parameter the loader ramps for the device boundary condition.
pub const BOUNDARY_PARAM: &str = "pdealpha";

/// Return codes the inner solver reports; near-convergence counts as failure.
const INNER_NEAR_CONVERGENCE: i32 = -3;

pub struct TwoLevelNewton<L, A, O> {
    options: TwoLevelOptions,
    outer: Box<dyn NonlinearSolver>,
    inner: Box<dyn NonlinearSolver>,
    loader: L,
    analysis: A,
    output: O,
    system: LinearSystem,
    mode: CouplingMode,
    analysis_mode: AnalysisMode,
    /// Interface-node count per sub-problem, queried on the first solve.
    interface_nodes: Option<Vec<usize>>,
    inner_stats: SolveStatistics,
    outer_stats: SolveStatistics,
    continuation_called_before: bool,
    /// Hand the outer solver to the next inner solve.
    pass_outer: bool,
    homotopy_finals: Option<Vec<f64>>,
    extractions: usize,
    initialized: bool,
}

impl<L: Loader, A: AnalysisInterface, O: OutputSink> TwoLevelNewton<L, A, O> {
    /// Build both sub-solvers from the backend choice in `config` and hand
    /// them their option blocks.
    pub fn new(
        config: SolverConfig,
        loader: L,
        analysis: A,
        output: O,
        system: LinearSystem,
    ) -> Result<Self> {
        let outer = config.two_level.outer_kind.build();
        let inner = config.two_level.inner_kind.build();
        Self::with_solvers(config, outer, inner, loader, analysis, output, system)
    }

    /// Like `new`, with caller-supplied sub-solvers.
    pub fn with_solvers(
        config: SolverConfig,
        mut outer: Box<dyn NonlinearSolver>,
        mut inner: Box<dyn NonlinearSolver>,
        loader: L,
        analysis: A,
        output: O,
        system: LinearSystem,
    ) -> Result<Self> {
        outer.set_options(&config.outer)?;
        outer.set_tran_options(&config.outer_tran)?;
        outer.set_loca_options(&config.outer_loca)?;
        inner.set_options(&config.inner)?;
        inner.set_tran_options(&config.inner_tran)?;
        inner.set_loca_options(&config.inner_loca)?;

        tracing::debug!(
            outer = outer.name(),
            inner = inner.name(),
            algorithm = config.two_level.algorithm.number(),
            "two-level solver built"
        );

        Ok(Self {
            options: config.two_level,
            outer,
            inner,
            loader,
            analysis,
            output,
            system,
            mode: CouplingMode::Full,
            analysis_mode: AnalysisMode::DcOp,
            interface_nodes: None,
            inner_stats: SolveStatistics::new(),
            outer_stats: SolveStatistics::new(),
            continuation_called_before: false,
            pass_outer: false,
            homotopy_finals: None,
            extractions: 0,
            initialized: false,
        })
    }

    pub fn initialize_all(&mut self) -> Result<()> {
        self.outer.initialize_all()?;
        self.inner.initialize_all()?;

        let mut codes = self.inner.return_codes();
        codes.near_convergence = INNER_NEAR_CONVERGENCE;
        self.inner.set_return_codes(codes);

        self.initialized = true;
        Ok(())
    }

    pub fn set_analysis_mode(&mut self, mode: AnalysisMode) {
        self.analysis_mode = mode;
        self.outer.set_analysis_mode(mode);
        self.inner.set_analysis_mode(mode);
    }

    /// Run one two-level solve with the configured algorithm.
    ///
    /// Convergence failures come back as a non-positive status. With
    /// `EXITWITHFAILURE` set they become `TotalSolveFailure` after the
    /// loader's diagnostic dump.
    pub fn solve(&mut self) -> Result<SolveStatus> {
        if !self.initialized {
            return Err(TwoLevelError::NotInitialized);
        }
        self.inner_stats.zero();
        self.outer_stats.zero();

        let first_dcop = self.analysis.time_int_info().is_first_dcop();
        let variant = if first_dcop {
            AlgorithmVariant::Full
        } else {
            self.active_algorithm()
        };

        if self.interface_nodes.is_none() {
            let layout = self.loader.num_interface_nodes();
            tracing::debug!(sub_problems = layout.len(), "interface nodes set up");
            self.interface_nodes = Some(layout);
        }

        let _span =
            tracing::info_span!("two_level_solve", algorithm = variant.number(), first_dcop)
                .entered();
        let status = self.run_variant(variant, first_dcop)?;

        if self.options.exit_with_failure && !status.converged() {
            if self.system.comm().num_ranks() == 1 {
                self.loader.output();
            }
            tracing::error!(
                status = status.code(),
                "two-level Newton algorithm failed to converge"
            );
            return Err(TwoLevelError::TotalSolveFailure { status: status.code() });
        }
        Ok(status)
    }

    /// Algorithm for the current analysis mode, as configured.
    fn active_algorithm(&self) -> AlgorithmVariant {
        match self.analysis_mode {
            AnalysisMode::Transient => self.options.tran_algorithm,
            _ => self.options.algorithm,
        }
    }

    fn active_max_cont_steps(&self) -> usize {
        match self.analysis_mode {
            AnalysisMode::Transient => self.options.tran_max_cont_steps,
            _ => self.options.max_cont_steps,
        }
    }

    /// Statistics of the last `solve`, inner and outer loops combined.
    pub fn statistics(&self) -> SolveStatistics {
        self.inner_stats.merged(&self.outer_stats)
    }

    pub fn inner_statistics(&self) -> &SolveStatistics {
        &self.inner_stats
    }

    pub fn outer_statistics(&self) -> &SolveStatistics {
        &self.outer_stats
    }

    pub fn max_norm_f(&self) -> f64 {
        self.inner.max_norm_f() + self.outer.max_norm_f()
    }

    pub fn max_norm_f_index(&self) -> Option<usize> {
        self.inner.max_norm_f_index()
    }

    pub fn mode(&self) -> CouplingMode {
        self.mode
    }

    pub fn options(&self) -> &TwoLevelOptions {
        &self.options
    }

    /// Coupling-extraction passes run over the orchestrator's lifetime.
    pub fn extractions(&self) -> usize {
        self.extractions
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut L {
        &mut self.loader
    }

    pub fn analysis_mut(&mut self) -> &mut A {
        &mut self.analysis
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn system(&self) -> &LinearSystem {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut LinearSystem {
        &mut self.system
    }

    fn print_step_info(&self, step: usize, status: SolveStatus) {
        tracing::info!(step, status = status.code(), mode = %self.mode, "2LNiter");
    }

    /// Solve the device interiors the way `CONTINUATIONFLAG` asks.
    fn solve_inner_problem(&mut self) -> Result<SolveStatus> {
        self.mode = CouplingMode::Inner;
        match self.options.continuation {
            ContinuationType::Plain => self.inner_solve(),
            ContinuationType::BoundaryRamp => self.boundary_ramp(),
            ContinuationType::Loca => self.loca_loop(),
        }
    }

    /// One inner solve in the current mode, stats folded.
    fn inner_solve(&mut self) -> Result<SolveStatus> {
        let passing = if self.pass_outer { Some(self.outer.as_ref()) } else { None };
        let mut ctx = NlsContext::new(&mut self.loader, &mut self.system, self.mode);
        let status = self.inner.solve(&mut ctx, passing)?;
        self.inner_stats += self.inner.statistics();
        Ok(status)
    }

    /// One outer solve in the current mode, stats folded.
    fn outer_solve(&mut self) -> Result<SolveStatus> {
        let mut ctx = NlsContext::new(&mut self.loader, &mut self.system, self.mode);
        let status = self.outer.solve(&mut ctx, None)?;
        self.outer_stats += self.outer.statistics();
        Ok(status)
    }

    /// One outer Newton step. The first one of a loop restarts the outer
    /// iteration, seeded from the inner solver.
    fn outer_step(&mut self, first: bool) -> Result<SolveStatus> {
        let mut ctx = NlsContext::new(&mut self.loader, &mut self.system, self.mode);
        let status = if first {
            self.outer.take_first_solve_step(&mut ctx, Some(self.inner.as_ref()))?
        } else {
            self.outer.take_one_solve_step(&mut ctx)?
        };
        self.outer_stats += self.outer.statistics();
        Ok(status)
    }

    /// Adaptive ramp of the device boundary condition from 0 to 1.
    fn boundary_ramp(&mut self) -> Result<SolveStatus> {
        let suggested = self.loader.enable_pde_continuation().max(1);
        let ramp = Ramp::with_suggestion(0.0, 1.0, suggested, self.continuation_called_before);
        self.continuation_called_before = true;

        let passing = if self.pass_outer { Some(self.outer.as_ref()) } else { None };
        let mut problem = BoundaryRamp {
            loader: &mut self.loader,
            system: &mut self.system,
            solver: self.inner.as_mut(),
            passing,
            stats: &mut self.inner_stats,
        };
        let outcome = continuation::run(&ramp, &self.options.step_control, &mut problem);
        self.loader.disable_pde_continuation();
        let outcome = outcome?;

        tracing::debug!(
            steps = outcome.state.step_index,
            failures = outcome.state.total_failure_count,
            status = outcome.status.code(),
            "boundary continuation done"
        );
        Ok(outcome.status)
    }

    /// Inner solve under the inner solver's own continuation settings.
    fn loca_loop(&mut self) -> Result<SolveStatus> {
        self.loader.enable_pde_continuation();
        let status = self.inner_solve();
        self.loader.disable_pde_continuation();
        status
    }

    /// Jacobian load issued by the orchestrator itself, counted as outer work.
    fn reload_jacobian(&mut self) -> Result<()> {
        let t = Instant::now();
        self.loader.load_jacobian(self.mode, &mut self.system)?;
        self.outer_stats.jacobian_load_time += t.elapsed();
        self.outer_stats.jacobian_loads += 1;
        Ok(())
    }

    /// One coupling-extraction pass over all interface nodes.
    fn extract_coupling(&mut self) -> Result<bool> {
        let layout = self.interface_nodes.as_deref().unwrap_or(&[]);
        self.extractions += 1;
        coupling::extract(
            layout,
            &mut self.loader,
            self.outer.as_mut(),
            &mut self.system,
            &mut self.mode,
            &mut self.outer_stats,
        )
    }
}

/// The inner solve under a `pdealpha` ramp.
struct BoundaryRamp<'a> {
    loader: &'a mut dyn Loader,
    system: &'a mut LinearSystem,
    solver: &'a mut dyn NonlinearSolver,
    passing: Option<&'a dyn NonlinearSolver>,
    stats: &'a mut SolveStatistics,
}

impl ContinuationProblem for BoundaryRamp<'_> {
    fn system(&mut self) -> &mut LinearSystem {
        &mut *self.system
    }

    fn apply(&mut self, value: f64) -> Result<()> {
        self.loader.set_param(BOUNDARY_PARAM, value)
    }

    fn solve(&mut self) -> Result<SolveStatus> {
        let mut ctx = NlsContext::new(&mut *self.loader, &mut *self.system, CouplingMode::Inner);
        let status = self.solver.solve(&mut ctx, self.passing)?;
        *self.stats += self.solver.statistics();
        Ok(status)
    }

    fn accepted(&mut self, state: &ContinuationState) -> Result<()> {
        tracing::debug!(
            alpha = state.previous_alpha,
            step = state.step_index,
            "boundary step accepted"
        );
        Ok(())
    }
}
