//! Junction diode from node `a` to ground with SPICE voltage limiting.

use super::config::DiodeConfig;

/// Thermal voltage at 300 K.
const VT_300K: f64 = 0.02585;

/// Minimum conductance across the junction.
const GMIN: f64 = 1e-12;

/// SPICE3f5 pnjlim: logarithmic damping of large forward-bias steps.
pub fn pnjlim(vnew: f64, vold: f64, vt: f64, vcrit: f64) -> f64 {
    if vnew > vcrit && (vnew - vold).abs() > vt + vt {
        if vold > 0.0 {
            let arg = 1.0 + (vnew - vold) / vt;
            if arg > 0.0 {
                vold + vt * arg.ln()
            } else {
                vcrit
            }
        } else {
            vt * (vnew / vt).ln()
        }
    } else {
        vnew
    }
}

/// Companion values at one junction voltage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiodeLoad {
    /// Current linearised back to the unlimited voltage.
    pub current: f64,
    pub conductance: f64,
    /// `g * (v_limited - v)`; zero when no limiting took place.
    pub limiting: f64,
}

#[derive(Debug, Clone)]
pub struct Diode {
    is: f64,
    n_vt: f64,
    vcrit: f64,
    v_last: f64,
    g_last: f64,
}

impl Diode {
    pub fn new(config: &DiodeConfig) -> Self {
        let n_vt = config.n * VT_300K;
        Self {
            is: config.is,
            n_vt,
            vcrit: n_vt * (n_vt / (std::f64::consts::SQRT_2 * config.is)).ln(),
            v_last: 0.0,
            g_last: GMIN,
        }
    }

    /// Evaluate at `v`, limiting against the previous evaluation.
    pub fn eval(&mut self, v: f64) -> DiodeLoad {
        let v_lim = pnjlim(v, self.v_last, self.n_vt, self.vcrit);
        self.v_last = v_lim;

        let e = (v_lim / self.n_vt).clamp(-80.0, 80.0).exp();
        let i = self.is * (e - 1.0) + GMIN * v_lim;
        let g = self.is * e / self.n_vt + GMIN;
        self.g_last = g;

        DiodeLoad {
            current: i + g * (v - v_lim),
            conductance: g,
            limiting: g * (v_lim - v),
        }
    }

    /// Conductance from the last `eval`.
    pub fn conductance(&self) -> f64 {
        self.g_last
    }
}
