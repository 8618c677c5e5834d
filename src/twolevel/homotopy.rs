//! Whole-problem homotopy over named parameters.
//!
//! Every parameter is first set to zero. Then, in declared order, each one
//! is ramped from zero to its final value with full-problem solves, and
//! every accepted step is reported to the output sink along with the
//! current value of all parameters.

use crate::error::Result;
use crate::loader::{CouplingMode, Loader, OutputSink};
use crate::solver::nonlinear::{NlsContext, NonlinearSolver, SolveStatus};
use crate::stats::SolveStatistics;
use crate::system::LinearSystem;

use super::continuation::{self, ContinuationParams, ContinuationProblem, ContinuationState, Ramp};

/// Final value assumed for a parameter the loader cannot report.
const FALLBACK_FINAL: f64 = 1.0;

/// Read each parameter's target value from the loader.
pub fn capture_finals(loader: &dyn Loader, names: &[String]) -> Vec<f64> {
    names
        .iter()
        .map(|name| {
            loader.get_param(name).unwrap_or_else(|| {
                tracing::warn!(
                    parameter = %name,
                    "no final value for homotopy parameter, using 1.0"
                );
                FALLBACK_FINAL
            })
        })
        .collect()
}

pub struct ParameterHomotopy<'a> {
    names: &'a [String],
    finals: &'a [f64],
    values: Vec<f64>,
    index: usize,
    loader: &'a mut dyn Loader,
    system: &'a mut LinearSystem,
    solver: &'a mut dyn NonlinearSolver,
    output: &'a mut dyn OutputSink,
    stats: &'a mut SolveStatistics,
}

impl<'a> ParameterHomotopy<'a> {
    pub fn new(
        names: &'a [String],
        finals: &'a [f64],
        loader: &'a mut dyn Loader,
        system: &'a mut LinearSystem,
        solver: &'a mut dyn NonlinearSolver,
        output: &'a mut dyn OutputSink,
        stats: &'a mut SolveStatistics,
    ) -> Self {
        Self {
            names,
            finals,
            values: vec![0.0; names.len()],
            index: 0,
            loader,
            system,
            solver,
            output,
            stats,
        }
    }

    /// Ramp every parameter in turn. The first parameter that cannot reach
    /// its final value ends the homotopy with that failure.
    pub fn run(
        &mut self,
        params: &ContinuationParams,
        suggested_steps: usize,
    ) -> Result<SolveStatus> {
        if self.names.is_empty() {
            tracing::warn!("homotopy requested without continuation parameters, solving directly");
            return self.solve();
        }

        for name in self.names {
            self.loader.set_param(name, 0.0)?;
        }
        self.values.fill(0.0);

        let mut status = SolveStatus::FAILED;
        for index in 0..self.names.len() {
            self.index = index;
            let target = self.finals.get(index).copied().unwrap_or(FALLBACK_FINAL);
            let _span =
                tracing::debug_span!("homotopy", parameter = %self.names[index], target).entered();

            let ramp = Ramp::with_suggestion(0.0, target, suggested_steps, false);
            let outcome = continuation::run(&ramp, params, self)?;
            status = outcome.status;

            tracing::info!(
                parameter = %self.names[index],
                reached = outcome.state.previous_alpha,
                steps = outcome.state.step_index,
                failures = outcome.state.total_failure_count,
                "homotopy parameter done"
            );
            if !outcome.converged() {
                break;
            }
        }
        Ok(status)
    }
}

impl ContinuationProblem for ParameterHomotopy<'_> {
    fn system(&mut self) -> &mut LinearSystem {
        &mut *self.system
    }

    fn apply(&mut self, value: f64) -> Result<()> {
        self.values[self.index] = value;
        self.loader.set_param(&self.names[self.index], value)
    }

    fn solve(&mut self) -> Result<SolveStatus> {
        let mut ctx = NlsContext::new(&mut *self.loader, &mut *self.system, CouplingMode::Full);
        let status = self.solver.solve(&mut ctx, None)?;
        *self.stats += self.solver.statistics();
        Ok(status)
    }

    fn accepted(&mut self, _state: &ContinuationState) -> Result<()> {
        self.output.output_homotopy(self.names, &self.values, self.system.solution())
    }
}
