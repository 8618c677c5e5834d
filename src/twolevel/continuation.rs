//! Adaptive-step parameter continuation with rollback.
//!
//! Ramps one scalar from a start value to a target. Every attempt snapshots
//! the solution and right-hand side, applies the candidate value and
//! solves. A success accepts the value and grows the step (only if the step
//! went through on its first attempt); a failure restores the snapshot
//! bit-for-bit and retries closer to the last accepted value.
//!
//! Used for the device boundary-condition ramp (`pdealpha`) and for the
//! named-parameter homotopy.

use crate::error::{Result, TwoLevelError};
use crate::solver::nonlinear::SolveStatus;
use crate::system::LinearSystem;

/// Step-size control.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContinuationParams {
    pub increase: f64,
    pub decrease: f64,
    /// Cap on solve attempts for one ramp.
    pub max_attempts: usize,
}

impl Default for ContinuationParams {
    fn default() -> Self {
        Self {
            increase: 1.5,
            decrease: 0.2,
            max_attempts: 1000,
        }
    }
}

/// One ramp request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
    pub start: f64,
    pub target: f64,
    /// Initial step size.
    pub step: f64,
    pub suggested_steps: usize,
    /// The start value is already solved: begin one step in.
    pub warm_start: bool,
}

impl Ramp {
    /// Ramp that covers the interval in `suggested_steps` equal steps.
    pub fn with_suggestion(
        start: f64,
        target: f64,
        suggested_steps: usize,
        warm_start: bool,
    ) -> Self {
        let suggested_steps = suggested_steps.max(1);
        Self {
            start,
            target,
            step: (target - start) / suggested_steps as f64,
            suggested_steps,
            warm_start,
        }
    }

    /// True once `value` has reached the target from the start side.
    fn reached(&self, value: f64) -> bool {
        if self.target >= self.start {
            value >= self.target
        } else {
            value <= self.target
        }
    }

    fn overshoots(&self, value: f64) -> bool {
        if self.target >= self.start {
            value > self.target
        } else {
            value < self.target
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContinuationState {
    pub current_alpha: f64,
    pub previous_alpha: f64,
    pub step_size_estimate: f64,
    /// Failures since the last accepted value.
    pub failure_count: usize,
    pub total_failure_count: usize,
    /// Accepted values so far.
    pub step_index: usize,
    pub max_suggested_steps: usize,
    pub attempts: usize,
}

impl ContinuationState {
    /// Remaining steps at the current step size.
    pub fn estimated_remaining(&self, target: f64) -> f64 {
        if self.step_size_estimate == 0.0 {
            1.0
        } else {
            (target - self.current_alpha) / self.step_size_estimate
        }
    }
}

/// What a ramp drives.
pub trait ContinuationProblem {
    /// System whose solution and right-hand side are snapshotted.
    fn system(&mut self) -> &mut LinearSystem;

    /// Apply a candidate parameter value.
    fn apply(&mut self, value: f64) -> Result<()>;

    fn solve(&mut self) -> Result<SolveStatus>;

    /// Called after each accepted value.
    fn accepted(&mut self, state: &ContinuationState) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationOutcome {
    /// Status of the last solve attempt.
    pub status: SolveStatus,
    pub state: ContinuationState,
    /// Accepted values in order.
    pub accepted: Vec<f64>,
}

impl ContinuationOutcome {
    pub fn converged(&self) -> bool {
        self.status.converged()
    }
}

/// Run one ramp to completion, to an unrecoverable failure, or to the
/// attempt cap.
///
/// A negative remaining-step estimate means the step arithmetic is broken
/// and is returned as `TwoLevelError::ContinuationEstimate`.
pub fn run(
    ramp: &Ramp,
    params: &ContinuationParams,
    problem: &mut dyn ContinuationProblem,
) -> Result<ContinuationOutcome> {
    let mut state = ContinuationState {
        current_alpha: ramp.start,
        previous_alpha: ramp.start,
        step_size_estimate: ramp.step,
        max_suggested_steps: ramp.suggested_steps,
        ..Default::default()
    };
    if ramp.warm_start {
        state.current_alpha = ramp.start + state.step_size_estimate;
    }

    let mut accepted = Vec::new();
    let mut status = SolveStatus::FAILED;

    loop {
        let remaining = state.estimated_remaining(ramp.target);
        tracing::debug!(
            step = state.step_index + 1,
            remaining = remaining.floor() + 1.0,
            current = state.current_alpha,
            previous = state.previous_alpha,
            step_size = state.step_size_estimate,
            "continuation step"
        );
        if remaining < 0.0 {
            tracing::error!(
                current = state.current_alpha,
                step_size = state.step_size_estimate,
                "continuation step estimate broken"
            );
            return Err(TwoLevelError::ContinuationEstimate {
                current: state.current_alpha,
                step: state.step_size_estimate,
                remaining,
            });
        }

        if state.attempts >= params.max_attempts {
            tracing::warn!(
                attempts = state.attempts,
                reached = state.previous_alpha,
                target = ramp.target,
                "continuation gave up"
            );
            // Short of the target, a converged last attempt is still a failed ramp.
            if status.converged() {
                status = SolveStatus::FAILED;
            }
            break;
        }
        state.attempts += 1;

        let saved = problem.system().snapshot();
        problem.apply(state.current_alpha)?;
        status = problem.solve()?;

        if status.converged() {
            if state.failure_count == 0 {
                state.step_size_estimate *= params.increase;
            }
            state.failure_count = 0;

            state.previous_alpha = state.current_alpha;
            state.current_alpha += state.step_size_estimate;
            if ramp.overshoots(state.current_alpha) {
                state.current_alpha = ramp.target;
                state.step_size_estimate = ramp.target - state.previous_alpha;
            }

            state.step_index += 1;
            accepted.push(state.previous_alpha);
            problem.accepted(&state)?;

            if ramp.reached(state.previous_alpha) {
                break;
            }
        } else {
            state.step_size_estimate *= params.decrease;
            problem.system().restore(&saved);
            state.failure_count += 1;
            state.total_failure_count += 1;
            state.current_alpha = state.previous_alpha + state.step_size_estimate;
            tracing::debug!(
                status = status.code(),
                retry = state.current_alpha,
                failures = state.failure_count,
                "continuation step failed, backing off"
            );
        }
    }

    tracing::debug!(
        accepted = state.step_index,
        failures = state.total_failure_count,
        reached = state.previous_alpha,
        "continuation finished"
    );

    Ok(ContinuationOutcome {
        status,
        state,
        accepted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Fails whenever the applied value is in `fail_at` (matched to 1e-12)
    /// or exceeds `max_ok`; otherwise "solves" by writing the value into
    /// the solution.
    struct Scripted {
        system: LinearSystem,
        value: f64,
        fail_at: Vec<f64>,
        max_ok: f64,
        applied: Vec<f64>,
        pre_apply_solutions: Vec<Vec<f64>>,
        reports: usize,
    }

    impl Scripted {
        fn new() -> Self {
            let mut system = LinearSystem::new(3);
            system.solution_mut().copy_from_slice(&[0.1, 0.2, 0.3]);
            Self {
                system,
                value: 0.0,
                fail_at: Vec::new(),
                max_ok: f64::INFINITY,
                applied: Vec::new(),
                pre_apply_solutions: Vec::new(),
                reports: 0,
            }
        }
    }

    impl ContinuationProblem for Scripted {
        fn system(&mut self) -> &mut LinearSystem {
            &mut self.system
        }
        fn apply(&mut self, value: f64) -> Result<()> {
            self.pre_apply_solutions.push(self.system.solution().to_vec());
            self.applied.push(value);
            self.value = value;
            Ok(())
        }
        fn solve(&mut self) -> Result<SolveStatus> {
            // Scribble over the solution either way.
            let v = self.value;
            for x in self.system.solution_mut() {
                *x = v * 7.0 + 1.0 / 3.0;
            }
            let fail = v > self.max_ok || self.fail_at.iter().any(|f| (f - v).abs() < 1e-12);
            Ok(if fail { SolveStatus(-3) } else { SolveStatus(2) })
        }
        fn accepted(&mut self, _state: &ContinuationState) -> Result<()> {
            self.reports += 1;
            Ok(())
        }
    }

    #[test]
    fn cold_ramp_is_monotone_and_ends_at_target() {
        let mut p = Scripted::new();
        let ramp = Ramp::with_suggestion(0.0, 1.0, 4, false);
        let out = run(&ramp, &ContinuationParams::default(), &mut p).expect("run");
        assert!(out.converged());
        assert_eq!(out.accepted[0], 0.0);
        assert!(out.accepted.windows(2).all(|w| w[0] <= w[1]));
        assert_abs_diff_eq!(*out.accepted.last().unwrap(), 1.0, epsilon = 1e-12);
        assert_eq!(p.reports, out.accepted.len());
        // 0, 0.375, 0.9375, 1.0
        assert_eq!(out.accepted.len(), 4);
    }

    #[test]
    fn warm_ramp_starts_one_step_in() {
        let mut p = Scripted::new();
        let ramp = Ramp::with_suggestion(0.0, 1.0, 4, true);
        let params = ContinuationParams {
            increase: 1.0,
            ..Default::default()
        };
        let out = run(&ramp, &params, &mut p).expect("run");
        assert_eq!(p.applied, vec![0.25, 0.5, 0.75, 1.0]);
        assert_eq!(out.accepted, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn failure_backs_off_from_last_accepted_value() {
        let mut p = Scripted::new();
        p.fail_at = vec![0.5];
        let ramp = Ramp::with_suggestion(0.0, 1.0, 2, true);
        let out = run(&ramp, &ContinuationParams::default(), &mut p).expect("run");
        assert_eq!(p.applied[0], 0.5);
        // previous alpha 0 + 0.2 * 0.5
        assert_abs_diff_eq!(p.applied[1], 0.1, epsilon = 1e-15);
        assert!(out.converged());
        assert_eq!(out.state.total_failure_count, 1);
        assert!(p.applied.iter().all(|&a| a <= 1.0));
        assert_abs_diff_eq!(*out.accepted.last().unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn rollback_restores_exact_bits() {
        let mut p = Scripted::new();
        p.fail_at = vec![0.5];
        let before = p.system.solution().to_vec();
        let before_rhs = p.system.rhs().to_vec();
        let ramp = Ramp::with_suggestion(0.0, 1.0, 2, true);
        let params = ContinuationParams {
            max_attempts: 1,
            ..Default::default()
        };
        let out = run(&ramp, &params, &mut p).expect("run");
        assert!(!out.converged());
        let after: Vec<u64> = p.system.solution().iter().map(|x| x.to_bits()).collect();
        let expect: Vec<u64> = before.iter().map(|x| x.to_bits()).collect();
        assert_eq!(after, expect);
        assert_eq!(p.system.rhs(), &before_rhs[..]);
    }

    #[test]
    fn retry_sees_the_pre_step_solution() {
        let mut p = Scripted::new();
        p.fail_at = vec![0.5];
        let ramp = Ramp::with_suggestion(0.0, 1.0, 2, true);
        run(&ramp, &ContinuationParams::default(), &mut p).expect("run");
        assert_eq!(p.pre_apply_solutions[0], p.pre_apply_solutions[1]);
    }

    #[test]
    fn step_grows_only_after_clean_steps() {
        let mut p = Scripted::new();
        p.fail_at = vec![0.5];
        let ramp = Ramp::with_suggestion(0.0, 1.0, 2, true);
        run(&ramp, &ContinuationParams::default(), &mut p).expect("run");
        // 0.5 fails, 0.1 succeeds after a failure (no growth), next is 0.2
        assert_abs_diff_eq!(p.applied[2], 0.2, epsilon = 1e-15);
        // clean step: 0.1 * 1.5 grows the next increment
        assert_abs_diff_eq!(p.applied[3], 0.35, epsilon = 1e-12);
    }

    #[test]
    fn oversized_step_is_fatal() {
        let mut p = Scripted::new();
        // First step twice the remaining interval.
        let ramp = Ramp {
            start: 0.0,
            target: 1.0,
            step: 2.0,
            suggested_steps: 1,
            warm_start: true,
        };
        let err = run(&ramp, &ContinuationParams::default(), &mut p).expect_err("must be fatal");
        assert!(matches!(err, TwoLevelError::ContinuationEstimate { .. }));
        assert!(err.is_fatal());
        assert!(p.applied.is_empty());
    }

    #[test]
    fn attempt_cap_returns_last_failure() {
        let mut p = Scripted::new();
        p.max_ok = 0.0;
        let ramp = Ramp::with_suggestion(0.0, 1.0, 1, true);
        let params = ContinuationParams {
            max_attempts: 5,
            ..Default::default()
        };
        let out = run(&ramp, &params, &mut p).expect("cap is not fatal");
        assert_eq!(out.status, SolveStatus(-3));
        assert_eq!(p.applied.len(), 5);
        assert_eq!(out.state.total_failure_count, 5);
    }

    #[test]
    fn attempt_cap_short_of_target_is_a_failure() {
        let mut p = Scripted::new();
        let ramp = Ramp::with_suggestion(0.0, 1.0, 10, false);
        let params = ContinuationParams {
            increase: 1.0,
            max_attempts: 3,
            ..Default::default()
        };
        let out = run(&ramp, &params, &mut p).expect("cap is not fatal");
        assert_eq!(out.accepted.len(), 3);
        assert_abs_diff_eq!(out.state.previous_alpha, 0.2, epsilon = 1e-12);
        assert!(!out.converged());
        assert_eq!(out.status, SolveStatus::FAILED);
    }

    #[test]
    fn negative_target_ramps_downward() {
        let mut p = Scripted::new();
        let ramp = Ramp::with_suggestion(0.0, -2.0, 4, false);
        let params = ContinuationParams {
            increase: 1.0,
            ..Default::default()
        };
        let out = run(&ramp, &params, &mut p).expect("run");
        assert_eq!(out.accepted, vec![0.0, -0.5, -1.0, -1.5, -2.0]);
    }
}
