//! Reference coupled problem: a circuit node driving 1-D devices.
//!
//! Source `VS` feeds node `a` through resistor `R`. At `a` sit an optional
//! junction diode and any number of 1-D conduction devices, each of which is
//! one sub-problem with a single interface node (`a` itself).
//!
//! Unknown 0 is the voltage of `a`; the interior unknowns of each device
//! follow in declaration order.

pub mod config;
pub mod device;
pub mod diode;

use crate::error::{Result, TwoLevelError};
use crate::loader::{CouplingMode, Loader};
use crate::sparse::CsrMatrix;
use crate::system::LinearSystem;
use crate::twolevel::BOUNDARY_PARAM;

pub use config::{CircuitConfig, DeviceConfig, DiodeConfig, ProblemConfig};
use device::Device;
use diode::Diode;

/// Row and column of the circuit node.
pub const NODE_A: usize = 0;

pub struct TwoLevelModel {
    vs: f64,
    r: f64,
    diode: Option<Diode>,
    devices: Vec<Device>,
    alpha: f64,
    continuation_active: bool,
    size: usize,
    /// Terminal currents from the last residual load, for diagnostics.
    last_currents: Vec<f64>,
    /// Solution at the last load; coupling extraction works at this point.
    state: Vec<f64>,
}

impl TwoLevelModel {
    pub fn new(config: &ProblemConfig) -> Result<Self> {
        config.validate()?;
        let mut offset = 1;
        let mut devices = Vec::with_capacity(config.devices.len());
        for dev in &config.devices {
            devices.push(Device::new(dev, offset));
            offset += dev.cells;
        }
        Ok(Self {
            vs: config.circuit.vs,
            r: config.circuit.r,
            diode: config.diode.as_ref().map(Diode::new),
            last_currents: vec![0.0; devices.len()],
            devices,
            alpha: 1.0,
            continuation_active: false,
            size: offset,
            state: vec![0.0; offset],
        })
    }

    /// Number of unknowns.
    pub fn size(&self) -> usize {
        self.size
    }

    /// A zeroed system of the right size.
    pub fn new_system(&self) -> LinearSystem {
        LinearSystem::new(self.size)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Names of the unknowns, in solution order.
    pub fn unknown_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.size);
        names.push("V(a)".to_string());
        for dev in &self.devices {
            for j in 1..=dev.cells() {
                names.push(format!("{}[{}]", dev.name, j));
            }
        }
        names
    }

    /// Device terminal currents at `x` with the boundary fully applied.
    pub fn terminal_currents(&self, x: &[f64]) -> Vec<f64> {
        self.devices
            .iter()
            .map(|d| d.terminal(x, x[NODE_A], 1.0).current)
            .collect()
    }

    fn device_mut(&mut self, name: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.name.eq_ignore_ascii_case(name))
    }

    fn device(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name.eq_ignore_ascii_case(name))
    }

    fn last_va(&self) -> f64 {
        self.state[NODE_A]
    }

    fn check_size(&self, system: &LinearSystem) -> Result<()> {
        if system.size() != self.size {
            return Err(TwoLevelError::Loader(format!(
                "system has {} unknowns, model needs {}",
                system.size(),
                self.size
            )));
        }
        Ok(())
    }
}

impl Loader for TwoLevelModel {
    fn load_residual(&mut self, mode: CouplingMode, system: &mut LinearSystem) -> Result<()> {
        self.check_size(system)?;
        let x = system.solution().to_vec();
        let v_a = x[NODE_A];
        let alpha = self.alpha;
        let rhs = system.rhs_mut();

        match mode {
            CouplingMode::Inner => {
                rhs[NODE_A] = 0.0;
                for dev in &self.devices {
                    dev.load_residual(&x, v_a, alpha, rhs);
                }
            }
            CouplingMode::Full | CouplingMode::Outer => {
                let mut f = (v_a - self.vs) / self.r;
                let mut limiting = 0.0;
                if let Some(diode) = self.diode.as_mut() {
                    let load = diode.eval(v_a);
                    f += load.current;
                    limiting = load.limiting;
                }
                for (k, dev) in self.devices.iter().enumerate() {
                    let i = if mode == CouplingMode::Full {
                        dev.load_residual(&x, v_a, alpha, rhs);
                        dev.terminal(&x, v_a, alpha).current
                    } else {
                        rhs[dev.offset()..dev.offset() + dev.cells()].fill(0.0);
                        dev.coupling.current_at(v_a)
                    };
                    self.last_currents[k] = i;
                    f += i;
                }
                rhs[NODE_A] = -f;
                system.voltage_limiting_mut().fill(0.0);
                system.voltage_limiting_mut()[NODE_A] = limiting;
            }
        }
        self.state = x;
        Ok(())
    }

    fn load_jacobian(&mut self, mode: CouplingMode, system: &mut LinearSystem) -> Result<()> {
        self.check_size(system)?;
        let x = system.solution();
        let v_a = x[NODE_A];
        let alpha = self.alpha;
        let mut triplets = Vec::new();

        match mode {
            CouplingMode::Inner => {
                triplets.push((NODE_A, NODE_A, 1.0));
                for dev in &self.devices {
                    dev.load_jacobian(x, v_a, alpha, None, &mut triplets);
                }
            }
            CouplingMode::Full => {
                let mut g = 1.0 / self.r + self.diode.as_ref().map_or(0.0, Diode::conductance);
                for dev in &self.devices {
                    let t = dev.terminal(x, v_a, alpha);
                    g += t.d_va;
                    triplets.push((NODE_A, dev.offset(), t.d_first));
                    dev.load_jacobian(x, v_a, alpha, Some(NODE_A), &mut triplets);
                }
                triplets.push((NODE_A, NODE_A, g));
            }
            CouplingMode::Outer => {
                let mut g = 1.0 / self.r + self.diode.as_ref().map_or(0.0, Diode::conductance);
                for dev in &self.devices {
                    g += dev.coupling.conductance;
                    dev.load_identity(&mut triplets, None);
                }
                triplets.push((NODE_A, NODE_A, g));
            }
        }

        self.state.copy_from_slice(x);
        system.set_jacobian(CsrMatrix::from_triplets(self.size, self.size, &triplets));
        Ok(())
    }

    fn enable_pde_continuation(&mut self) -> usize {
        self.continuation_active = true;
        self.alpha = 0.0;
        let v_a = self.last_va();
        self.devices
            .iter()
            .map(|d| d.suggested_steps(v_a))
            .max()
            .unwrap_or(1)
            .max(1)
    }

    fn disable_pde_continuation(&mut self) {
        let v_a = self.last_va();
        let alpha = self.alpha;
        for dev in &mut self.devices {
            dev.settle(v_a, alpha);
        }
        self.alpha = 1.0;
        self.continuation_active = false;
    }

    fn set_param(&mut self, name: &str, value: f64) -> Result<()> {
        if name.eq_ignore_ascii_case("VS") {
            self.vs = value;
            return Ok(());
        }
        if name.eq_ignore_ascii_case(BOUNDARY_PARAM) {
            if self.continuation_active {
                self.alpha = value;
            } else {
                tracing::debug!(value, "boundary ramp inactive, ignoring pdealpha");
            }
            return Ok(());
        }
        if let Some((dev, field)) = name.split_once(':') {
            if let Some(d) = self.device_mut(dev) {
                match field.to_ascii_uppercase().as_str() {
                    "BETA" => d.beta = value,
                    "K0" => d.k0 = value,
                    _ => {
                        return Err(TwoLevelError::Loader(format!(
                            "unknown device parameter {name}"
                        )))
                    }
                }
                return Ok(());
            }
        }
        Err(TwoLevelError::Loader(format!("unknown parameter {name}")))
    }

    fn get_param(&self, name: &str) -> Option<f64> {
        if name.eq_ignore_ascii_case("VS") {
            return Some(self.vs);
        }
        if name.eq_ignore_ascii_case(BOUNDARY_PARAM) {
            return Some(self.alpha);
        }
        let (dev, field) = name.split_once(':')?;
        let d = self.device(dev)?;
        match field.to_ascii_uppercase().as_str() {
            "BETA" => Some(d.beta),
            "K0" => Some(d.k0),
            _ => None,
        }
    }

    fn num_interface_nodes(&self) -> Vec<usize> {
        vec![1; self.devices.len()]
    }

    fn load_coupling_rhs(&mut self, sub: usize, iface: usize, rhs: &mut [f64]) -> Result<()> {
        let dev = self
            .devices
            .get(sub)
            .ok_or_else(|| TwoLevelError::Loader(format!("no sub-problem {sub}")))?;
        if iface != 0 {
            return Err(TwoLevelError::Loader(format!(
                "device {} has one interface node, asked for {iface}",
                dev.name
            )));
        }
        // Extraction always sees the fully applied boundary.
        dev.load_coupling_rhs(&self.state, self.state[NODE_A], 1.0, rhs);
        Ok(())
    }

    fn calc_coupling_terms(&mut self, sub: usize, iface: usize, direction: &[f64]) -> Result<()> {
        if iface != 0 {
            return Err(TwoLevelError::Loader(format!("sub-problem {sub} has one interface node")));
        }
        let dev = self
            .devices
            .get_mut(sub)
            .ok_or_else(|| TwoLevelError::Loader(format!("no sub-problem {sub}")))?;
        dev.calc_coupling_terms(&self.state, self.state[NODE_A], 1.0, direction);
        tracing::debug!(
            device = %dev.name,
            current = dev.coupling.current,
            conductance = dev.coupling.conductance,
            "coupling terms"
        );
        Ok(())
    }

    fn output(&self) {
        tracing::info!(vs = self.vs, v_a = self.last_va(), alpha = self.alpha, "model state");
        for (dev, i) in self.devices.iter().zip(&self.last_currents) {
            tracing::info!(
                device = %dev.name,
                current = i,
                anchor = dev.anchor(),
                conductance = dev.coupling.conductance,
                "device state"
            );
        }
    }
}
