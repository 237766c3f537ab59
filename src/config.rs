//! Run configuration, read from TOML
//!
//! ```toml
//! [machine]
//! step_limit = 5000000
//! delay_ms = 0
//! register_overrides = [{ register = 7, value = 25734 }]
//!
//! [input]
//! script = ["take tablet", "use tablet"]
//!
//! [trace]
//! path = "trace.txt"
//!
//! [transform]
//! multiplier = 5249
//! increment = 12345
//! modulus = 32768
//! ```

use crate::decoder::TableTransform;
use crate::vm::VirtualMachine;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub machine: MachineConfig,
    pub input: InputConfig,
    pub trace: TraceConfig,
    pub transform: TransformConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MachineConfig {
    /// Stop after this many instructions. None runs forever.
    pub step_limit: Option<u64>,
    /// Milliseconds between instructions
    pub delay_ms: u64,
    /// Register values to set before the first instruction
    pub register_overrides: Vec<RegisterOverride>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RegisterOverride {
    pub register: u8,
    pub value: u16,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct InputConfig {
    /// Lines fed to the machine before reading stdin
    pub script: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TraceConfig {
    pub path: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransformConfig {
    pub multiplier: u16,
    pub increment: u16,
    pub modulus: u32,
}

impl Default for TransformConfig {
    fn default() -> Self {
        let t = TableTransform::default();
        TransformConfig {
            multiplier: t.multiplier(),
            increment: t.increment(),
            modulus: t.modulus(),
        }
    }
}

impl TransformConfig {
    pub fn build(&self) -> Result<TableTransform, String> {
        TableTransform::new(self.multiplier, self.increment, self.modulus).map_err(|e| e.to_string())
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        let config: Config =
            toml::from_str(text).map_err(|e| format!("Invalid configuration: {}", e))?;
        for o in &config.machine.register_overrides {
            if o.register > 7 {
                return Err(format!("No register R{} to override", o.register));
            }
            if o.value > 0x7fff {
                return Err(format!("Override value {} for R{} is not 15-bit", o.value, o.register));
            }
        }
        config.transform.build()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| format!("Cannot read config '{}': {}", path.display(), e))?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, String> {
        toml::to_string(self).map_err(|e| format!("Cannot serialise configuration: {}", e))
    }

    /// Apply register overrides to a freshly loaded machine
    pub fn prepare(&self, vm: &mut VirtualMachine) -> Result<(), String> {
        for o in &self.machine.register_overrides {
            vm.set_register(o.register as usize, o.value)?;
            info!("R{} = {:04x}", o.register, o.value);
        }
        Ok(())
    }
}
