//! Option-block binding for the two-level solver.
//!
//! Routes each `.options` block to the orchestrator or to one of the two
//! sub-solvers:
//!
//! | block                  | consumer                                      |
//! |------------------------|-----------------------------------------------|
//! | `NONLIN`               | outer solver; `MAXSTEP`, `NOX` also read here |
//! | `NONLIN-TRAN`          | outer solver, transient                       |
//! | `NONLIN-TWOLEVEL`      | orchestrator; unknown keys to inner solver    |
//! | `NONLIN-TWOLEVEL-TRAN` | orchestrator; unknown keys to inner, transient|
//! | `LOCA`                 | outer solver continuation                     |
//! | `TWOLEVEL-LOCA`        | inner solver continuation                     |

use crate::error::{Result, TwoLevelError};
use crate::options::{OptionBlock, Param};
use crate::solver::SolverKind;

use super::algorithm::AlgorithmVariant;
use super::continuation::ContinuationParams;

/// How the inner sub-problem is solved inside variants 2 and 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContinuationType {
    /// Straight inner solve.
    Plain,
    /// Adaptive `pdealpha` ramp.
    #[default]
    BoundaryRamp,
    /// Inner solver's own natural-parameter continuation.
    Loca,
}

impl ContinuationType {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => ContinuationType::BoundaryRamp,
            2 => ContinuationType::Loca,
            _ => ContinuationType::Plain,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TwoLevelOptions {
    pub algorithm: AlgorithmVariant,
    pub tran_algorithm: AlgorithmVariant,
    /// Outer iteration budget for variants 1-3.
    pub max_outer_steps: usize,
    /// Homotopy steps per parameter.
    pub max_cont_steps: usize,
    pub tran_max_cont_steps: usize,
    pub continuation: ContinuationType,
    pub inner_fail_fatal: bool,
    pub exit_with_failure: bool,
    pub full_newton_enforce: bool,
    pub voltage_limit_tol: f64,
    /// Homotopy parameters, in ramp order.
    pub continuation_params: Vec<String>,
    pub step_control: ContinuationParams,
    pub outer_kind: SolverKind,
    pub inner_kind: SolverKind,
}

impl Default for TwoLevelOptions {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmVariant::DecoupledCircuit,
            tran_algorithm: AlgorithmVariant::Full,
            max_outer_steps: 20,
            max_cont_steps: 10,
            tran_max_cont_steps: 10,
            continuation: ContinuationType::BoundaryRamp,
            inner_fail_fatal: true,
            exit_with_failure: false,
            full_newton_enforce: true,
            voltage_limit_tol: 1.0e-6,
            continuation_params: Vec::new(),
            step_control: ContinuationParams::default(),
            outer_kind: SolverKind::DampedNewton,
            inner_kind: SolverKind::DampedNewton,
        }
    }
}

impl TwoLevelOptions {
    /// Read the keys of `NONLIN` that concern the orchestrator. The whole
    /// block still goes to the outer solver.
    pub fn apply_nonlin(&mut self, block: &OptionBlock) -> Result<()> {
        if let Some(p) = block.get("MAXSTEP") {
            self.max_outer_steps = p.expect_int()?.max(1) as usize;
        }
        if let Some(p) = block.get("NOX") {
            self.outer_kind = SolverKind::from_nox_flag(p.expect_bool()?);
        }
        Ok(())
    }

    /// Consume `NONLIN-TWOLEVEL`. Returns the keys meant for the inner solver.
    pub fn apply_two_level(&mut self, block: &OptionBlock) -> Result<OptionBlock> {
        let mut forwarded = OptionBlock::new("NONLIN");
        for p in &block.params {
            match p.tag.as_str() {
                "ALGORITHM" => self.algorithm = AlgorithmVariant::resolve(p.expect_int()?),
                "NOX" => self.inner_kind = SolverKind::from_nox_flag(p.expect_bool()?),
                "MAXCONTSTEPS" => self.max_cont_steps = p.expect_int()?.max(1) as usize,
                "CONTINUATIONFLAG" => {
                    self.continuation = ContinuationType::from_code(p.expect_int()?)
                }
                "INNERFAIL" => self.inner_fail_fatal = p.expect_bool()?,
                "EXITWITHFAILURE" => self.exit_with_failure = p.expect_bool()?,
                "FULLNEWTONENFORCE" => self.full_newton_enforce = p.expect_bool()?,
                "CONPARAM" => self.continuation_params.push(param_name(p)?),
                "VOLTLIMTOL" => self.voltage_limit_tol = p.expect_f64()?,
                "CONTINCREASE" => {
                    self.step_control.increase = bounded(p, |v| v >= 1.0, "at least 1")?
                }
                "CONTDECREASE" => {
                    self.step_control.decrease = bounded(p, |v| v > 0.0 && v < 1.0, "in (0, 1)")?
                }
                "MAXCONTATTEMPTS" => {
                    let n = p.expect_int()?;
                    if n < 1 {
                        return Err(TwoLevelError::Config(format!(
                            "MAXCONTATTEMPTS must be at least 1, got {n}"
                        )));
                    }
                    self.step_control.max_attempts = n as usize;
                }
                _ => forwarded.push(p.clone()),
            }
        }
        Ok(forwarded)
    }

    /// Consume `NONLIN-TWOLEVEL-TRAN`. Returns the keys meant for the inner
    /// solver's transient options.
    pub fn apply_two_level_tran(&mut self, block: &OptionBlock) -> Result<OptionBlock> {
        let mut forwarded = OptionBlock::new("NONLIN-TRAN");
        for p in &block.params {
            match p.tag.as_str() {
                "ALGORITHM" => {
                    self.tran_algorithm = AlgorithmVariant::resolve_transient(p.expect_int()?)
                }
                "MAXCONTSTEPS" => self.tran_max_cont_steps = p.expect_int()?.max(1) as usize,
                _ => forwarded.push(p.clone()),
            }
        }
        Ok(forwarded)
    }
}

/// Numeric option that must satisfy `ok`; NaN never does.
fn bounded(p: &Param, ok: impl Fn(f64) -> bool, want: &str) -> Result<f64> {
    let v = p.expect_f64()?;
    if !ok(v) {
        return Err(TwoLevelError::Config(format!("{} must be {want}, got {v}", p.tag)));
    }
    Ok(v)
}

fn param_name(p: &Param) -> Result<String> {
    match p.as_str() {
        Some(s) => Ok(s.to_string()),
        None => Ok(p.expect_f64()?.to_string()),
    }
}

/// All option blocks, sorted by consumer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SolverConfig {
    pub two_level: TwoLevelOptions,
    pub outer: OptionBlock,
    pub outer_tran: OptionBlock,
    pub outer_loca: OptionBlock,
    pub inner: OptionBlock,
    pub inner_tran: OptionBlock,
    pub inner_loca: OptionBlock,
}

impl SolverConfig {
    pub fn from_blocks(blocks: &[OptionBlock]) -> Result<Self> {
        let mut config = SolverConfig {
            outer: OptionBlock::new("NONLIN"),
            outer_tran: OptionBlock::new("NONLIN-TRAN"),
            outer_loca: OptionBlock::new("LOCA"),
            inner: OptionBlock::new("NONLIN"),
            inner_tran: OptionBlock::new("NONLIN-TRAN"),
            inner_loca: OptionBlock::new("LOCA"),
            ..Default::default()
        };

        for block in blocks {
            match block.name.as_str() {
                "NONLIN" => {
                    config.two_level.apply_nonlin(block)?;
                    config.outer.params.extend(block.params.iter().cloned());
                }
                "NONLIN-TRAN" => config.outer_tran.params.extend(block.params.iter().cloned()),
                "NONLIN-TWOLEVEL" => {
                    let fwd = config.two_level.apply_two_level(block)?;
                    config.inner.params.extend(fwd.params);
                }
                "NONLIN-TWOLEVEL-TRAN" => {
                    let fwd = config.two_level.apply_two_level_tran(block)?;
                    config.inner_tran.params.extend(fwd.params);
                }
                "LOCA" => config.outer_loca.params.extend(block.params.iter().cloned()),
                "TWOLEVEL-LOCA" => config.inner_loca.params.extend(block.params.iter().cloned()),
                other => {
                    tracing::debug!(block = other, "option block not used by the two-level solver")
                }
            }
        }
        Ok(config)
    }
}
