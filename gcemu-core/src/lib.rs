//! GameCube CPU Execution Core
//!
//! Integer execution core for the Gekko PowerPC CPU: a reference
//! interpreter and a block JIT that must agree bit-for-bit on every piece of
//! architected state.
//!
//! # Architecture
//! - **cpu**: guest register file, packed condition-register encoding,
//!   exception dispatch, time base and the memory service interface
//! - **decoder**: instruction fields and the opcode tables
//! - **interpreter**: one-instruction-at-a-time reference semantics
//! - **jit**: block analysis, IR emission, register caching, lowering to
//!   host code and the block cache with self-modifying-code invalidation
//! - **session**: scheduler-facing dispatcher, debugger and save states
//!
//! # Example
//! ```rust,no_run
//! use gcemu_core::{CoreConfig, Session};
//!
//! let mut session = Session::new(CoreConfig::default())?;
//! session.load_program(0x8000_3100, &[0x3860_002A, 0x4800_0000])?;
//! session.state_mut().set_pc(0x8000_3100);
//! session.run(16)?;
//! assert_eq!(session.state().gpr[3], 42);
//! # Ok::<(), gcemu_core::CoreError>(())
//! ```

pub mod config;
pub mod cpu;
pub mod decoder;
pub mod error;
pub mod interpreter;
pub mod jit;
pub mod session;

pub use config::{CoreConfig, CoreMode, JitConfig, OverflowPolicy};
pub use error::{CoreError, Result};
pub use session::Session;
