//! Solver work counters for `--stats` output.
//!
//! Each nonlinear backend keeps one `SolveStatistics` for the call in
//! progress and resets it at every entry point. The two-level orchestrator
//! folds those per-call figures into its own inner and outer buckets, so a
//! report always covers exactly one top-level solve.

use std::ops::AddAssign;
use std::time::Duration;

/// Counters and timings accumulated over one solve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveStatistics {
    pub residual_loads: usize,
    pub jacobian_loads: usize,
    pub linear_solves: usize,
    pub failed_linear_solves: usize,
    pub jacobian_factorizations: usize,
    pub total_linear_iterations: usize,
    pub linear_solve_time: Duration,
    pub residual_load_time: Duration,
    pub jacobian_load_time: Duration,
}

impl SolveStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every counter and timing to zero.
    pub fn zero(&mut self) {
        *self = Self::default();
    }

    /// Element-wise sum of two reports.
    pub fn merged(&self, other: &SolveStatistics) -> SolveStatistics {
        let mut out = self.clone();
        out += other;
        out
    }

    /// Print the stats table to stderr.
    pub fn display(&self, title: &str) {
        eprintln!();
        eprintln!("=== {} ===", title);
        eprintln!("  Residual loads:         {}", self.residual_loads);
        eprintln!("    Load time:            {:>8.3}s", self.residual_load_time.as_secs_f64());
        eprintln!("  Jacobian loads:         {}", self.jacobian_loads);
        eprintln!("    Load time:            {:>8.3}s", self.jacobian_load_time.as_secs_f64());
        eprintln!("  Linear solves:          {}", self.linear_solves);
        if self.failed_linear_solves > 0 {
            eprintln!("    Failed:               {}", self.failed_linear_solves);
        }
        eprintln!("    Factorizations:       {}", self.jacobian_factorizations);
        eprintln!("    Linear iterations:    {}", self.total_linear_iterations);
        eprintln!("    Solve time:           {:>8.3}s", self.linear_solve_time.as_secs_f64());
    }
}

impl AddAssign<&SolveStatistics> for SolveStatistics {
    fn add_assign(&mut self, rhs: &SolveStatistics) {
        self.residual_loads += rhs.residual_loads;
        self.jacobian_loads += rhs.jacobian_loads;
        self.linear_solves += rhs.linear_solves;
        self.failed_linear_solves += rhs.failed_linear_solves;
        self.jacobian_factorizations += rhs.jacobian_factorizations;
        self.total_linear_iterations += rhs.total_linear_iterations;
        self.linear_solve_time += rhs.linear_solve_time;
        self.residual_load_time += rhs.residual_load_time;
        self.jacobian_load_time += rhs.jacobian_load_time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_sums_every_field() {
        let a = SolveStatistics {
            residual_loads: 3,
            jacobian_loads: 2,
            linear_solves: 2,
            failed_linear_solves: 1,
            jacobian_factorizations: 2,
            total_linear_iterations: 2,
            linear_solve_time: Duration::from_millis(5),
            residual_load_time: Duration::from_millis(1),
            jacobian_load_time: Duration::from_millis(2),
        };
        let b = SolveStatistics {
            residual_loads: 1,
            linear_solves: 4,
            linear_solve_time: Duration::from_millis(3),
            ..Default::default()
        };
        let m = a.merged(&b);
        assert_eq!(m.residual_loads, 4);
        assert_eq!(m.jacobian_loads, 2);
        assert_eq!(m.linear_solves, 6);
        assert_eq!(m.failed_linear_solves, 1);
        assert_eq!(m.linear_solve_time, Duration::from_millis(8));
    }

    #[test]
    fn zero_clears_everything() {
        let mut s = SolveStatistics {
            residual_loads: 7,
            linear_solve_time: Duration::from_secs(1),
            ..Default::default()
        };
        s.zero();
        assert_eq!(s, SolveStatistics::default());
    }
}
