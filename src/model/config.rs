//! TOML description of the reference problem.
//!
//! ```toml
//! [circuit]
//! vs = 5.0
//! r = 1000.0
//!
//! [diode]
//! is = 1e-14
//! n = 1.0
//!
//! [[device]]
//! name = "D1"
//! length = 1.0
//! area = 1e-3
//! k0 = 1.0
//! beta = 0.5
//! cells = 20
//! ```

use serde::Deserialize;

use crate::error::{Result, TwoLevelError};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProblemConfig {
    pub circuit: CircuitConfig,
    pub diode: Option<DiodeConfig>,
    #[serde(rename = "device", default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CircuitConfig {
    /// Source voltage.
    pub vs: f64,
    /// Series resistance between the source and node `a`.
    pub r: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DiodeConfig {
    #[serde(default = "default_is")]
    pub is: f64,
    #[serde(default = "default_n")]
    pub n: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default = "default_one")]
    pub length: f64,
    #[serde(default = "default_one")]
    pub area: f64,
    #[serde(default = "default_one")]
    pub k0: f64,
    #[serde(default)]
    pub beta: f64,
    #[serde(default = "default_cells")]
    pub cells: usize,
    /// Largest boundary-voltage change per continuation step.
    #[serde(default = "default_bc_step")]
    pub max_bc_step: f64,
}

fn default_is() -> f64 {
    1e-14
}

fn default_n() -> f64 {
    1.0
}

fn default_one() -> f64 {
    1.0
}

fn default_cells() -> usize {
    10
}

fn default_bc_step() -> f64 {
    0.5
}

impl ProblemConfig {
    pub fn from_toml(src: &str) -> Result<Self> {
        let config: ProblemConfig =
            toml::from_str(src).map_err(|e| TwoLevelError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.circuit.r > 0.0) {
            return Err(TwoLevelError::Config(format!(
                "circuit resistance must be positive, got {}",
                self.circuit.r
            )));
        }
        if let Some(d) = &self.diode {
            if !(d.is > 0.0 && d.n > 0.0) {
                return Err(TwoLevelError::Config("diode IS and N must be positive".into()));
            }
        }
        for (i, dev) in self.devices.iter().enumerate() {
            if dev.cells == 0 {
                return Err(TwoLevelError::Config(format!("device {} has no cells", dev.name)));
            }
            if !(dev.length > 0.0 && dev.area > 0.0 && dev.k0 > 0.0 && dev.max_bc_step > 0.0) {
                return Err(TwoLevelError::Config(format!(
                    "device {}: length, area, k0 and max_bc_step must be positive",
                    dev.name
                )));
            }
            if self.devices[..i].iter().any(|d| d.name.eq_ignore_ascii_case(&dev.name)) {
                return Err(TwoLevelError::Config(format!("duplicate device name {}", dev.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_defaults() {
        let src = r#"
[circuit]
vs = 5.0
r = 1e3

[diode]

[[device]]
name = "D1"
beta = 0.5

[[device]]
name = "D2"
cells = 4
"#;
        let c = ProblemConfig::from_toml(src).expect("parse");
        assert_eq!(c.circuit.vs, 5.0);
        assert_eq!(c.diode.as_ref().map(|d| d.is), Some(1e-14));
        assert_eq!(c.devices.len(), 2);
        assert_eq!(c.devices[0].cells, 10);
        assert_eq!(c.devices[0].beta, 0.5);
        assert_eq!(c.devices[1].cells, 4);
        assert_eq!(c.devices[1].max_bc_step, 0.5);
    }

    #[test]
    fn rejects_bad_values() {
        let zero_cells = "[circuit]\nvs = 1.0\nr = 1.0\n[[device]]\nname = \"D\"\ncells = 0\n";
        assert!(matches!(ProblemConfig::from_toml(zero_cells), Err(TwoLevelError::Config(_))));

        let dup = "[circuit]\nvs = 1.0\nr = 1.0\n\
                   [[device]]\nname = \"d\"\n\
                   [[device]]\nname = \"D\"\n";
        assert!(ProblemConfig::from_toml(dup).is_err());

        assert!(matches!(
            ProblemConfig::from_toml("[circuit]\nvs = 1.0\n"),
            Err(TwoLevelError::Parse(_))
        ));
    }
}
