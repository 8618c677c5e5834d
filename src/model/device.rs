//! One-dimensional nonlinear conduction device.
//!
//! `cells` interior unknowns on a bar of length `length` between node `a`
//! (left) and ground (right). Conductivity is k(u) = k0 * exp(beta * u),
//! evaluated at the midpoint of each segment. The left boundary value is
//! `anchor + alpha * (v_a - anchor)`, which lets the boundary be ramped
//! from the last converged voltage toward the present one.

use super::config::DeviceConfig;

/// Reduced model of the device seen from the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CouplingTerms {
    /// Terminal current at extraction time.
    pub current: f64,
    /// Node voltage at extraction time.
    pub voltage: f64,
    /// dI/dv_a with the interior re-solved.
    pub conductance: f64,
}

impl CouplingTerms {
    pub fn current_at(&self, v_a: f64) -> f64 {
        self.current + self.conductance * (v_a - self.voltage)
    }
}

/// Segment flux and its derivatives with respect to both ends.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Flux {
    value: f64,
    d_left: f64,
    d_right: f64,
}

/// Terminal current at node `a` and its derivatives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Terminal {
    pub current: f64,
    /// Through the boundary value, so already scaled by alpha.
    pub d_va: f64,
    pub d_first: f64,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    length: f64,
    area: f64,
    pub k0: f64,
    pub beta: f64,
    cells: usize,
    max_bc_step: f64,
    /// Index of the first interior unknown.
    offset: usize,
    /// Boundary value the interior was last in equilibrium with.
    anchor: f64,
    pub coupling: CouplingTerms,
}

impl Device {
    pub fn new(config: &DeviceConfig, offset: usize) -> Self {
        Self {
            name: config.name.clone(),
            length: config.length,
            area: config.area,
            k0: config.k0,
            beta: config.beta,
            cells: config.cells,
            max_bc_step: config.max_bc_step,
            offset,
            anchor: 0.0,
            coupling: CouplingTerms::default(),
        }
    }

    pub fn cells(&self) -> usize {
        self.cells
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn anchor(&self) -> f64 {
        self.anchor
    }

    fn spacing(&self) -> f64 {
        self.length / (self.cells + 1) as f64
    }

    pub fn boundary(&self, v_a: f64, alpha: f64) -> f64 {
        self.anchor + alpha * (v_a - self.anchor)
    }

    /// Boundary ramp steps needed to reach `v_a` from the anchor.
    pub fn suggested_steps(&self, v_a: f64) -> usize {
        ((v_a - self.anchor).abs() / self.max_bc_step).ceil() as usize
    }

    /// Settle the anchor on the boundary value reached under `alpha`.
    pub fn settle(&mut self, v_a: f64, alpha: f64) {
        self.anchor = self.boundary(v_a, alpha);
    }

    /// Value at grid point `j` in 0..=cells+1.
    fn at(&self, x: &[f64], j: usize, b0: f64) -> f64 {
        if j == 0 {
            b0
        } else if j > self.cells {
            0.0
        } else {
            x[self.offset + j - 1]
        }
    }

    fn flux(&self, left: f64, right: f64) -> Flux {
        let h = self.spacing();
        let m = 0.5 * (left + right);
        let k = self.k0 * (self.beta * m).clamp(-80.0, 80.0).exp();
        let dk = self.beta * k;
        let du = left - right;
        Flux {
            value: k * du / h,
            d_left: (0.5 * dk * du + k) / h,
            d_right: (0.5 * dk * du - k) / h,
        }
    }

    pub fn terminal(&self, x: &[f64], v_a: f64, alpha: f64) -> Terminal {
        let b0 = self.boundary(v_a, alpha);
        let f0 = self.flux(b0, self.at(x, 1, b0));
        Terminal {
            current: self.area * f0.value,
            d_va: self.area * f0.d_left * alpha,
            d_first: self.area * f0.d_right,
        }
    }

    /// Write the negated interior residuals (net flux into each point) into
    /// `rhs`.
    pub fn load_residual(&self, x: &[f64], v_a: f64, alpha: f64, rhs: &mut [f64]) {
        let b0 = self.boundary(v_a, alpha);
        for i in 1..=self.cells {
            let fl = self.flux(self.at(x, i - 1, b0), self.at(x, i, b0));
            let fr = self.flux(self.at(x, i, b0), self.at(x, i + 1, b0));
            rhs[self.offset + i - 1] = -(fl.value - fr.value);
        }
    }

    /// Jacobian rows of the interior. With `circuit_column` set, the first
    /// row also gets its entry against node `a`.
    pub fn load_jacobian(
        &self,
        x: &[f64],
        v_a: f64,
        alpha: f64,
        circuit_column: Option<usize>,
        triplets: &mut Vec<(usize, usize, f64)>,
    ) {
        let b0 = self.boundary(v_a, alpha);
        for i in 1..=self.cells {
            let row = self.offset + i - 1;
            let fl = self.flux(self.at(x, i - 1, b0), self.at(x, i, b0));
            let fr = self.flux(self.at(x, i, b0), self.at(x, i + 1, b0));

            triplets.push((row, row, fl.d_right - fr.d_left));
            if i > 1 {
                triplets.push((row, row - 1, fl.d_left));
            } else if let Some(col) = circuit_column {
                triplets.push((row, col, fl.d_left * alpha));
            }
            if i < self.cells {
                triplets.push((row, row + 1, -fr.d_right));
            }
        }
    }

    /// Identity rows for the interior, used when the circuit is solved alone.
    pub fn load_identity(&self, triplets: &mut Vec<(usize, usize, f64)>, rhs: Option<&mut [f64]>) {
        for row in self.offset..self.offset + self.cells {
            triplets.push((row, row, 1.0));
        }
        if let Some(rhs) = rhs {
            rhs[self.offset..self.offset + self.cells].fill(0.0);
        }
    }

    /// Derivative of the interior residual with respect to `v_a`.
    pub fn load_coupling_rhs(&self, x: &[f64], v_a: f64, alpha: f64, rhs: &mut [f64]) {
        let b0 = self.boundary(v_a, alpha);
        let f0 = self.flux(b0, self.at(x, 1, b0));
        rhs[self.offset] = f0.d_left * alpha;
    }

    /// Finish the chain rule with `direction = J_inner^-1 * dR/dv_a`.
    pub fn calc_coupling_terms(&mut self, x: &[f64], v_a: f64, alpha: f64, direction: &[f64]) {
        let t = self.terminal(x, v_a, alpha);
        self.coupling = CouplingTerms {
            current: t.current,
            voltage: v_a,
            conductance: t.d_va - t.d_first * direction[self.offset],
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config(beta: f64, cells: usize) -> DeviceConfig {
        DeviceConfig {
            name: "D1".into(),
            length: 2.0,
            area: 0.5,
            k0: 3.0,
            beta,
            cells,
            max_bc_step: 0.25,
        }
    }

    #[test]
    fn linear_profile_has_zero_residual() {
        let d = Device::new(&config(0.0, 3), 1);
        let v = 4.0;
        // u_j = v * (1 - j / 4)
        let x = [v, 3.0, 2.0, 1.0];
        let mut rhs = vec![9.0; 4];
        d.load_residual(&x, v, 1.0, &mut rhs);
        for r in &rhs[1..] {
            assert_relative_eq!(*r, 0.0, epsilon = 1e-12);
        }
        let t = d.terminal(&x, v, 1.0);
        // A * k0 * v / L
        assert_relative_eq!(t.current, 0.5 * 3.0 * 4.0 / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let d = Device::new(&config(0.7, 3), 1);
        let x = vec![1.3, 0.9, 0.4, 0.2];
        let v_a = x[0];
        let mut triplets = Vec::new();
        d.load_jacobian(&x, v_a, 1.0, Some(0), &mut triplets);

        let residual = |x: &[f64]| {
            let mut r = vec![0.0; 4];
            d.load_residual(x, x[0], 1.0, &mut r);
            r.iter().map(|v| -v).collect::<Vec<_>>()
        };
        let eps = 1e-7;
        let base = residual(&x);
        for col in 0..4 {
            let mut xp = x.clone();
            xp[col] += eps;
            let pert = residual(&xp);
            for row in 1..4 {
                let fd = (pert[row] - base[row]) / eps;
                let analytic: f64 = triplets
                    .iter()
                    .filter(|&&(r, c, _)| r == row && c == col)
                    .map(|&(_, _, v)| v)
                    .sum();
                assert_relative_eq!(analytic, fd, epsilon = 1e-5, max_relative = 1e-5);
            }
        }
    }

    #[test]
    fn ramp_boundary_and_anchor() {
        let mut d = Device::new(&config(0.0, 2), 1);
        assert_eq!(d.suggested_steps(1.0), 4);
        assert_eq!(d.boundary(1.0, 0.5), 0.5);
        d.settle(1.0, 0.5);
        assert_eq!(d.anchor(), 0.5);
        assert_eq!(d.boundary(1.0, 1.0), 1.0);
        assert_eq!(d.suggested_steps(1.0), 2);
    }

    #[test]
    fn coupling_current_is_linear_in_voltage() {
        let terms = CouplingTerms {
            current: 1.0,
            voltage: 2.0,
            conductance: 0.5,
        };
        assert_relative_eq!(terms.current_at(4.0), 2.0);
    }
}
