//! The linear system shared by the loader and every nonlinear solver.
//!
//! Holds the Jacobian, the residual (stored negated, as the right-hand
//! side), the solution, the last Newton direction and the voltage-limiting
//! correction vector. Norms are reduced across ranks so that SPMD runs take
//! identical branches.

use crate::solver::comm::{CommunicationBackend, SingleProcessComm};
use crate::sparse::CsrMatrix;

/// Solution and right-hand side captured before a trial step.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedState {
    pub solution: Vec<f64>,
    pub rhs: Vec<f64>,
}

pub struct LinearSystem {
    jacobian: CsrMatrix,
    rhs: Vec<f64>,
    solution: Vec<f64>,
    newton: Vec<f64>,
    voltage_limiting: Vec<f64>,
    comm: Box<dyn CommunicationBackend>,
}

impl LinearSystem {
    /// A zero-initialised system of `size` local unknowns on a single process.
    pub fn new(size: usize) -> Self {
        Self::with_comm(size, Box::new(SingleProcessComm))
    }

    pub fn with_comm(size: usize, comm: Box<dyn CommunicationBackend>) -> Self {
        Self {
            jacobian: CsrMatrix::new(size, size),
            rhs: vec![0.0; size],
            solution: vec![0.0; size],
            newton: vec![0.0; size],
            voltage_limiting: vec![0.0; size],
            comm,
        }
    }

    /// Number of locally owned unknowns.
    pub fn size(&self) -> usize {
        self.solution.len()
    }

    /// Fresh zero vector with the local layout.
    pub fn create_vector(&self) -> Vec<f64> {
        vec![0.0; self.size()]
    }

    pub fn comm(&self) -> &dyn CommunicationBackend {
        self.comm.as_ref()
    }

    pub fn jacobian(&self) -> &CsrMatrix {
        &self.jacobian
    }

    pub fn set_jacobian(&mut self, jacobian: CsrMatrix) {
        self.jacobian = jacobian;
    }

    pub fn rhs(&self) -> &[f64] {
        &self.rhs
    }

    pub fn rhs_mut(&mut self) -> &mut [f64] {
        &mut self.rhs
    }

    pub fn solution(&self) -> &[f64] {
        &self.solution
    }

    pub fn solution_mut(&mut self) -> &mut [f64] {
        &mut self.solution
    }

    pub fn newton(&self) -> &[f64] {
        &self.newton
    }

    pub fn newton_mut(&mut self) -> &mut [f64] {
        &mut self.newton
    }

    pub fn voltage_limiting(&self) -> &[f64] {
        &self.voltage_limiting
    }

    pub fn voltage_limiting_mut(&mut self) -> &mut [f64] {
        &mut self.voltage_limiting
    }

    /// Jacobian and right-hand side together, for linear solves that read
    /// one while writing the Newton vector.
    pub fn split_for_solve(&mut self) -> (&CsrMatrix, &[f64], &mut [f64]) {
        (&self.jacobian, &self.rhs, &mut self.newton)
    }

    /// Global Euclidean norm.
    pub fn norm_2(&self, v: &[f64]) -> f64 {
        let local: f64 = v.iter().map(|x| x * x).sum();
        self.comm.all_reduce_sum(local).sqrt()
    }

    /// Global max norm.
    pub fn norm_inf(&self, v: &[f64]) -> f64 {
        let local = v.iter().fold(0.0f64, |m, x| m.max(x.abs()));
        self.comm.all_reduce_max(local)
    }

    /// Global dot product.
    pub fn dot(&self, a: &[f64], b: &[f64]) -> f64 {
        let local: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        self.comm.all_reduce_sum(local)
    }

    /// Global unknown count.
    pub fn global_size(&self) -> f64 {
        self.comm.all_reduce_sum(self.size() as f64)
    }

    pub fn snapshot(&self) -> SavedState {
        SavedState {
            solution: self.solution.clone(),
            rhs: self.rhs.clone(),
        }
    }

    pub fn restore(&mut self, saved: &SavedState) {
        self.solution.copy_from_slice(&saved.solution);
        self.rhs.copy_from_slice(&saved.rhs);
    }
}

/// Local index of the largest-magnitude entry, if any.
pub fn max_abs_index(v: &[f64]) -> Option<usize> {
    v.iter()
        .enumerate()
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map(|(i, _)| i)
}
