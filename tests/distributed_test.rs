//! Two-level solves over the MPI communication backend.
//!
//! These tests require MPI and the `distributed` feature flag.
//! Run with: mpirun -n 1 cargo test --features distributed --test distributed_test
//!
//! Without MPI installed, these tests are excluded from the default build.

#![cfg(feature = "distributed")]

use twolevel::loader::{NullOutput, StaticAnalysis};
use twolevel::model::{ProblemConfig, TwoLevelModel, NODE_A};
use twolevel::options;
use twolevel::solver::comm::CommunicationBackend;
use twolevel::solver::comm_mpi::MpiComm;
use twolevel::system::LinearSystem;
use twolevel::twolevel::{SolverConfig, TwoLevelNewton};

const PROBLEM: &str = r#"
[circuit]
vs = 5.0
r = 1000.0

[[device]]
name = "D1"
area = 1e-3
cells = 10
"#;

#[test]
fn decoupled_circuit_single_rank() {
    // A single MPI rank exercises every reduction in the degenerate case.
    let _universe = mpi::initialize().expect("MPI init failed");
    let comm = MpiComm::new();
    assert_eq!(comm.num_ranks(), 1);
    assert_eq!(comm.all_reduce_min_i32(1), 1);

    let problem = ProblemConfig::from_toml(PROBLEM).expect("problem");
    let model = TwoLevelModel::new(&problem).expect("model");
    let system = LinearSystem::with_comm(model.size(), Box::new(comm));
    let blocks = options::parse(".options NONLIN-TWOLEVEL ALGORITHM=3").expect("options");
    let config = SolverConfig::from_blocks(&blocks).expect("config");

    let analysis = StaticAnalysis::default();
    let mut solver =
        TwoLevelNewton::new(config, model, analysis, NullOutput, system).expect("solver");
    solver.initialize_all().expect("init");
    let status = solver.solve().expect("solve failed");

    assert!(status.converged(), "status {}", status);
    let v_a = solver.system().solution()[NODE_A];
    assert!((v_a - 2.5).abs() < 1e-6, "V(a)={}, expected 2.5", v_a);
}
