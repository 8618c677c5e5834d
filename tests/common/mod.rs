//! Scripted collaborators for driving the orchestrator deterministically.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use twolevel::error::Result;
use twolevel::loader::{AnalysisMode, CouplingMode, Loader, OutputSink, StaticAnalysis, TimeIntInfo};
use twolevel::options::{self, OptionBlock};
use twolevel::solver::nonlinear::{NlsContext, NonlinearSolver, ReturnCodes, SolveStatus, WarmStart};
use twolevel::sparse::CsrMatrix;
use twolevel::stats::SolveStatistics;
use twolevel::system::LinearSystem;
use twolevel::twolevel::{SolverConfig, TwoLevelNewton};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Solve(CouplingMode),
    FirstStep(CouplingMode),
    Step(CouplingMode),
    LinearSolve,
}

/// Sub-solver that replays scripted status codes. Each call reports one
/// residual load and one linear solve.
#[derive(Default)]
pub struct Script {
    pub solves: VecDeque<i32>,
    pub steps: VecDeque<i32>,
    /// Used once a queue runs dry.
    pub default_solve: i32,
    pub default_step: i32,
    pub calls: Vec<Call>,
    pub codes: Option<ReturnCodes>,
    /// `solve_linear_system` reports failure.
    pub linear_fails: bool,
}

pub struct ScriptedSolver {
    pub name: &'static str,
    pub script: Rc<RefCell<Script>>,
    stats: SolveStatistics,
    codes: ReturnCodes,
}

impl ScriptedSolver {
    pub fn new(name: &'static str, script: Script) -> (Self, Rc<RefCell<Script>>) {
        let shared = Rc::new(RefCell::new(script));
        (
            Self {
                name,
                script: shared.clone(),
                stats: SolveStatistics::default(),
                codes: ReturnCodes::default(),
            },
            shared,
        )
    }

    fn one_call(&mut self) {
        self.stats.zero();
        self.stats.residual_loads = 1;
        self.stats.jacobian_loads = 1;
        self.stats.linear_solves = 1;
    }
}

impl NonlinearSolver for ScriptedSolver {
    fn name(&self) -> &'static str {
        self.name
    }
    fn initialize_all(&mut self) -> Result<()> {
        Ok(())
    }
    fn set_options(&mut self, _block: &OptionBlock) -> Result<()> {
        Ok(())
    }
    fn set_tran_options(&mut self, _block: &OptionBlock) -> Result<()> {
        Ok(())
    }
    fn set_loca_options(&mut self, _block: &OptionBlock) -> Result<()> {
        Ok(())
    }
    fn set_return_codes(&mut self, codes: ReturnCodes) {
        self.codes = codes;
        self.script.borrow_mut().codes = Some(codes);
    }
    fn return_codes(&self) -> ReturnCodes {
        self.codes
    }
    fn set_analysis_mode(&mut self, _mode: AnalysisMode) {}

    fn solve(
        &mut self,
        ctx: &mut NlsContext<'_>,
        _passing: Option<&dyn NonlinearSolver>,
    ) -> Result<SolveStatus> {
        self.one_call();
        let mut s = self.script.borrow_mut();
        s.calls.push(Call::Solve(ctx.mode));
        let code = s.solves.pop_front().unwrap_or(s.default_solve);
        Ok(SolveStatus(code))
    }

    fn take_first_solve_step(
        &mut self,
        ctx: &mut NlsContext<'_>,
        _other: Option<&dyn NonlinearSolver>,
    ) -> Result<SolveStatus> {
        self.one_call();
        let mut s = self.script.borrow_mut();
        s.calls.push(Call::FirstStep(ctx.mode));
        let code = s.steps.pop_front().unwrap_or(s.default_step);
        Ok(SolveStatus(code))
    }

    fn take_one_solve_step(&mut self, ctx: &mut NlsContext<'_>) -> Result<SolveStatus> {
        self.one_call();
        let mut s = self.script.borrow_mut();
        s.calls.push(Call::Step(ctx.mode));
        let code = s.steps.pop_front().unwrap_or(s.default_step);
        Ok(SolveStatus(code))
    }

    fn solve_linear_system(&mut self, system: &mut LinearSystem) -> bool {
        let mut s = self.script.borrow_mut();
        s.calls.push(Call::LinearSolve);
        system.newton_mut().fill(0.0);
        !s.linear_fails
    }

    fn statistics(&self) -> &SolveStatistics {
        &self.stats
    }
    fn num_iterations(&self) -> usize {
        1
    }
    fn max_norm_f(&self) -> f64 {
        0.0
    }
    fn max_norm_f_index(&self) -> Option<usize> {
        None
    }
    fn warm_start(&self) -> WarmStart {
        WarmStart::default()
    }
}

/// Loader that only records what it is asked to do.
#[derive(Default)]
pub struct Recording {
    pub interface_nodes: Vec<usize>,
    pub suggested_steps: usize,
    pub params: HashMap<String, f64>,
    pub set_params: Vec<(String, f64)>,
    pub jacobian_loads: Vec<CouplingMode>,
    pub coupling_rhs: usize,
    pub coupling_terms: usize,
    pub enables: usize,
    pub disables: usize,
    pub outputs: std::cell::Cell<usize>,
}

impl Loader for Recording {
    fn load_residual(&mut self, _mode: CouplingMode, _system: &mut LinearSystem) -> Result<()> {
        Ok(())
    }
    fn load_jacobian(&mut self, mode: CouplingMode, system: &mut LinearSystem) -> Result<()> {
        self.jacobian_loads.push(mode);
        let n = system.size();
        let diag: Vec<(usize, usize, f64)> = (0..n).map(|i| (i, i, 1.0)).collect();
        system.set_jacobian(CsrMatrix::from_triplets(n, n, &diag));
        Ok(())
    }
    fn enable_pde_continuation(&mut self) -> usize {
        self.enables += 1;
        self.suggested_steps
    }
    fn disable_pde_continuation(&mut self) {
        self.disables += 1;
    }
    fn set_param(&mut self, name: &str, value: f64) -> Result<()> {
        self.set_params.push((name.to_string(), value));
        self.params.insert(name.to_string(), value);
        Ok(())
    }
    fn get_param(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }
    fn num_interface_nodes(&self) -> Vec<usize> {
        self.interface_nodes.clone()
    }
    fn load_coupling_rhs(&mut self, _sub: usize, _iface: usize, rhs: &mut [f64]) -> Result<()> {
        self.coupling_rhs += 1;
        rhs[0] = 1.0;
        Ok(())
    }
    fn calc_coupling_terms(
        &mut self,
        _sub: usize,
        _iface: usize,
        _direction: &[f64],
    ) -> Result<()> {
        self.coupling_terms += 1;
        Ok(())
    }
    fn output(&self) {
        self.outputs.set(self.outputs.get() + 1);
    }
}

impl Recording {
    pub fn values_of(&self, name: &str) -> Vec<f64> {
        self.set_params
            .iter()
            .filter(|(n, _)| n == name)
            .map(|&(_, v)| v)
            .collect()
    }
}

/// Homotopy rows, shared with the test after the sink moves into the solver.
#[derive(Clone, Default)]
pub struct SharedRows(pub Rc<RefCell<Vec<Vec<f64>>>>);

impl OutputSink for SharedRows {
    fn output_homotopy(
        &mut self,
        _names: &[String],
        values: &[f64],
        _solution: &[f64],
    ) -> Result<()> {
        self.0.borrow_mut().push(values.to_vec());
        Ok(())
    }
}

pub type Harness = TwoLevelNewton<Recording, StaticAnalysis, SharedRows>;

pub struct Built {
    pub solver: Harness,
    pub outer: Rc<RefCell<Script>>,
    pub inner: Rc<RefCell<Script>>,
    pub rows: SharedRows,
}

/// Initialized orchestrator over scripted solvers and a recording loader.
pub fn build(
    options_src: &str,
    outer: Script,
    inner: Script,
    loader: Recording,
    info: TimeIntInfo,
) -> Built {
    let mut built = build_uninit(options_src, outer, inner, loader, info);
    built.solver.initialize_all().expect("init");
    built
}

pub fn build_uninit(
    options_src: &str,
    outer: Script,
    inner: Script,
    loader: Recording,
    info: TimeIntInfo,
) -> Built {
    let blocks = options::parse(options_src).expect("options");
    let config = SolverConfig::from_blocks(&blocks).expect("config");
    let (outer_solver, outer_script) = ScriptedSolver::new("outer", outer);
    let (inner_solver, inner_script) = ScriptedSolver::new("inner", inner);
    let rows = SharedRows::default();
    let solver = TwoLevelNewton::with_solvers(
        config,
        Box::new(outer_solver),
        Box::new(inner_solver),
        loader,
        StaticAnalysis { info },
        rows.clone(),
        LinearSystem::new(3),
    )
    .expect("build");
    Built {
        solver,
        outer: outer_script,
        inner: inner_script,
        rows,
    }
}

pub fn dc() -> TimeIntInfo {
    TimeIntInfo::default()
}

pub fn outer_calls(built: &Built) -> Vec<Call> {
    built.outer.borrow().calls.clone()
}

pub fn inner_calls(built: &Built) -> Vec<Call> {
    built.inner.borrow().calls.clone()
}

/// Loader with one device of one interface node.
pub fn one_device() -> Recording {
    Recording {
        interface_nodes: vec![1],
        suggested_steps: 1,
        ..Default::default()
    }
}

/// Script whose every call returns `code`.
pub fn always(code: i32) -> Script {
    Script {
        default_solve: code,
        default_step: code,
        ..Default::default()
    }
}
