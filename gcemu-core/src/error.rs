//! Error Handling
//!
//! Host-level failures of the execution core, built with `thiserror`.
//!
//! Guest-architected exceptions (traps, DSI, ISI, syscalls, interrupts) are
//! *not* errors: they are recorded in the guest state and delivered by the
//! exception dispatcher. Everything in this module means the emulator itself
//! reached a state it cannot continue from, and is always surfaced to the
//! caller.
//!
//! # Error Categories
//! - **Code generation errors**: the JIT produced IR the backend cannot lower
//! - **Register exhaustion**: an instruction needs more host registers than
//!   the cache has; the emitter recovers by falling back to the interpreter
//! - **Host faults**: lowered host code hit an undefined host operation
//! - **Stale blocks**: a block handle outlived the code it referenced
//! - **Configuration / save-state errors**: bad input from the embedder

use std::fmt;

use thiserror::Error;

use crate::cpu::memory::MemoryError;

/// Guest location an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestLocation {
    pub address: u32,
    pub instruction: Option<u32>,
}

impl GuestLocation {
    pub fn new(address: u32, instruction: Option<u32>) -> Self {
        Self { address, instruction }
    }

    pub fn at(address: u32) -> Self {
        Self { address, instruction: None }
    }
}

impl fmt::Display for GuestLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.address)?;
        if let Some(raw) = self.instruction {
            write!(f, " (instruction 0x{:08X})", raw)?;
        }
        Ok(())
    }
}

/// Execution core error types.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The JIT emitted IR that violates a backend invariant
    /// (unbound label, register outside the host file, etc.).
    #[error("Code generation error at {location}: {message}\nSuggestion: {suggestion}")]
    CodeGen {
        message: String,
        location: GuestLocation,
        suggestion: String,
    },

    /// Every host register is locked by the instruction being emitted.
    #[error("No unlocked host register left for r{gpr} at {location}")]
    RegistersExhausted { gpr: u8, location: GuestLocation },

    /// Host code reached an operation that is undefined on the host machine.
    #[error("Host fault in block {location}: {message}")]
    HostFault {
        message: String,
        location: GuestLocation,
    },

    /// A block handle refers to a cache slot that was invalidated or reused.
    #[error("Stale block handle for 0x{address:08X} (generation {generation})")]
    StaleBlock { address: u32, generation: u64 },

    /// Invalid configuration value.
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Save state could not be produced or restored.
    #[error("Save state error: {message}")]
    SaveState { message: String },

    /// The embedder accessed guest memory outside the mapped range.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a code generation error with context.
    #[cold]
    pub fn codegen(message: impl Into<String>, location: GuestLocation) -> Self {
        Self::CodeGen {
            message: message.into(),
            location,
            suggestion: "Disable the affected instruction group in the JIT configuration to route it through the interpreter.".to_string(),
        }
    }

    /// Create a host fault error with context.
    #[cold]
    pub fn host_fault(message: impl Into<String>, location: GuestLocation) -> Self {
        Self::HostFault {
            message: message.into(),
            location,
        }
    }

    #[cold]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    #[cold]
    pub fn save_state(message: impl Into<String>) -> Self {
        Self::SaveState { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
