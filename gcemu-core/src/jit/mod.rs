//! Block JIT
//!
//! Compiles guest blocks to host code and runs them.
//!
//! # Pipeline
//! 1. [`analysis`]: form the block and its register usage
//! 2. [`emitter`]: emit IR instruction by instruction through the GPR cache
//! 3. [`backend`]: lower the IR to [`HostCode`](backend::HostCode)
//! 4. [`cache`]: keep the block until a guest write overlaps it
//!
//! Compiled blocks must leave guest state exactly as the interpreter would
//! after the same instructions.

pub mod analysis;
pub mod backend;
pub mod cache;
pub mod emitter;
pub mod ir;
pub mod regcache;

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::{CoreConfig, JitConfig, OverflowPolicy};
use crate::cpu::memory::GuestMemory;
use crate::cpu::state::CpuState;
use crate::cpu::ExecContext;
use crate::error::Result;
use backend::{Backend, BlockRun, ThreadedBackend};
use cache::{BlockCache, BlockHandle, CompiledBlock};
use emitter::BlockCompiler;

/// Counters for compiled-code activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JitStats {
    pub blocks_compiled: u64,
    pub blocks_run: u64,
    pub instructions_run: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fallbacks_emitted: u64,
    pub invalidations: u64,
}

pub struct Jit {
    config: JitConfig,
    overflow_policy: OverflowPolicy,
    backend: Box<dyn Backend>,
    cache: BlockCache,
    stats: JitStats,
}

impl Jit {
    pub fn new(config: &CoreConfig) -> Self {
        Self::with_backend(config, Box::new(ThreadedBackend))
    }

    pub fn with_backend(config: &CoreConfig, backend: Box<dyn Backend>) -> Self {
        Self {
            config: config.jit.clone(),
            overflow_policy: config.overflow_policy,
            backend,
            cache: BlockCache::new(),
            stats: JitStats::default(),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Compile the block at `address`. `None` if its first instruction
    /// cannot be fetched.
    pub fn compile(
        &mut self,
        memory: &dyn GuestMemory,
        address: u32,
        breakpoints: &BTreeSet<u32>,
    ) -> Result<Option<BlockHandle>> {
        let Some(plan) =
            analysis::analyze(memory, address, self.config.max_block_instructions, breakpoints)
        else {
            return Ok(None);
        };
        let ir = BlockCompiler::new(&self.config, self.overflow_policy, &plan).compile()?;
        let code = self.backend.lower(&ir)?;
        let fallbacks = ir.fallback_count() as u32;

        log::debug!(
            "compiled 0x{:08X}: {} instructions, {} host ops, {} fallbacks",
            address,
            ir.guest_instructions,
            code.len(),
            fallbacks
        );
        self.stats.blocks_compiled += 1;
        self.stats.fallbacks_emitted += u64::from(fallbacks);
        let epoch = self.cache.flushes();
        Ok(Some(self.cache.insert(CompiledBlock {
            address,
            end: ir.end,
            guest_instructions: ir.guest_instructions,
            fallbacks,
            gprs_read: plan.gprs_read,
            gprs_written: plan.gprs_written,
            resident_at_exit: ir.resident_at_exit,
            epoch,
            code,
        })))
    }

    /// Find the block starting at `address`, counting the hit or miss.
    pub fn lookup(&mut self, address: u32) -> Option<BlockHandle> {
        let handle = self.cache.lookup(address);
        if handle.is_some() {
            self.stats.cache_hits += 1;
        } else {
            self.stats.cache_misses += 1;
        }
        handle
    }

    /// Run a compiled block. Guest writes it performs are left in
    /// `ctx.code_writes` for the caller to invalidate.
    pub fn run(
        &mut self,
        handle: BlockHandle,
        cpu: &mut CpuState,
        ctx: &mut ExecContext<'_>,
    ) -> Result<BlockRun> {
        let block = self.cache.get(handle)?;
        let run = block.code.run(cpu, ctx)?;
        self.stats.blocks_run += 1;
        self.stats.instructions_run += u64::from(run.instructions);
        Ok(run)
    }

    /// Drop every block overlapping the written range.
    pub fn invalidate_range(&mut self, address: u32, len: u32) -> usize {
        let removed = self.cache.invalidate_range(address, len);
        self.stats.invalidations += removed as u64;
        removed
    }

    pub fn clear_cache(&mut self) {
        log::debug!("flushing {} compiled blocks", self.cache.len());
        self.cache.clear();
    }
}

impl std::fmt::Debug for Jit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jit")
            .field("backend", &self.backend.name())
            .field("blocks", &self.cache.len())
            .field("stats", &self.stats)
            .finish()
    }
}
