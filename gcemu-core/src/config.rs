// Core configuration persistence
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cpu::memory::DEFAULT_RAM_SIZE;
use crate::error::{CoreError, Result};

/// Engine the dispatcher uses for code without breakpoints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoreMode {
    Interpreter,
    #[default]
    Jit,
}

/// Handling of the `OE` bit on XO-form arithmetic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Leave XER OV/SO untouched and log the instruction.
    #[default]
    Ignore,
    /// Set OV (and sticky SO) as the architecture defines.
    Architectural,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JitConfig {
    /// Longest block the analyzer forms, in instructions.
    pub max_block_instructions: usize,
    /// Host registers available for caching guest GPRs.
    pub host_registers: usize,
    /// Merge adjacent reads of both time-base halves.
    pub merge_timebase_reads: bool,
    /// Route integer ALU instructions through the interpreter.
    pub integer_off: bool,
    /// Route loads and stores through the interpreter.
    pub load_store_off: bool,
    /// Route SPR, MSR and CR-register moves through the interpreter.
    pub system_registers_off: bool,
    /// Route branches through the interpreter.
    pub branch_off: bool,
}

/// Largest host register budget the backend accepts.
pub const MAX_HOST_REGISTERS: usize = 11;

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            max_block_instructions: 64,
            host_registers: 6,
            merge_timebase_reads: true,
            integer_off: false,
            load_store_off: false,
            system_registers_off: false,
            branch_off: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoreConfig {
    pub mode: CoreMode,
    pub overflow_policy: OverflowPolicy,
    pub ram_size: u32,
    pub jit: JitConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            mode: CoreMode::default(),
            overflow_policy: OverflowPolicy::default(),
            ram_size: DEFAULT_RAM_SIZE,
            jit: JitConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: CoreConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.jit.max_block_instructions == 0 {
            return Err(CoreError::config("jit.max_block_instructions must be at least 1"));
        }
        if self.jit.host_registers == 0 || self.jit.host_registers > MAX_HOST_REGISTERS {
            return Err(CoreError::config(format!(
                "jit.host_registers must be between 1 and {}",
                MAX_HOST_REGISTERS
            )));
        }
        if self.ram_size == 0 || self.ram_size % 0x4000 != 0 || self.ram_size > 0x4000_0000 {
            return Err(CoreError::config(
                "ram_size must be a non-zero multiple of 16KiB no larger than 1GiB",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{ "mode": "interpreter", "jit": { "host_registers": 2 } }"#)
                .unwrap();
        assert_eq!(config.mode, CoreMode::Interpreter);
        assert_eq!(config.jit.host_registers, 2);
        assert_eq!(config.jit.max_block_instructions, 64);
        assert_eq!(config.overflow_policy, OverflowPolicy::Ignore);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_empty_register_budget() {
        let mut config = CoreConfig::default();
        config.jit.host_registers = 0;
        assert!(config.validate().is_err());
    }
}
