//! Emulation Session
//!
//! Owns the guest CPU state and everything both engines borrow while they
//! run: guest memory, the time base, the scheduler's tick counter, the
//! exception dispatcher and the JIT. The session is the scheduler-facing
//! dispatch loop and the debugger interface.
//!
//! # Exception Boundaries
//! Both engines reach the dispatcher at the same logical points:
//! - after a synchronous exception, which is delivered immediately
//! - after an `mtmsr` that enabled EE with external exceptions pending,
//!   where external exceptions are delivered
//! - after every other block-ending instruction and at the end of a run,
//!   where exceptions are merged and delivered only if a device requested
//!   a check through the [`ExceptionSignal`]
//!
//! A compiled block that stops without a block-ending instruction (length
//! limit, breakpoint, a store into its own code) does not check, matching
//! the interpreter running the same instructions.
//!
//! # Save States
//! `save_state` captures the CPU state and the time-base value. The payload
//! is JSON compressed with zstd, behind a four-byte magic and a CRC-32 of
//! the compressed bytes. Guest memory belongs to the memory service and is
//! not part of the image.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{CoreConfig, CoreMode};
use crate::cpu::exceptions::{DispatchState, ExceptionDispatcher, ExceptionKind, ExceptionSignal};
use crate::cpu::memory::{FlatMemory, GuestMemory};
use crate::cpu::scheduler::{CycleSource, Scheduler};
use crate::cpu::state::{spr, CpuState};
use crate::cpu::timebase::TimeBase;
use crate::cpu::{CodeWrite, ExecContext};
use crate::error::{CoreError, Result};
use crate::interpreter::{Interpreter, StepOutcome};
use crate::jit::backend::{BlockExit, BlockRun};
use crate::jit::cache::BlockHandle;
use crate::jit::{Jit, JitStats};

const SAVE_MAGIC: &[u8; 4] = b"GCEU";
const SAVE_VERSION: u32 = 1;
const SAVE_HEADER_LEN: usize = 8;
const ZSTD_LEVEL: i32 = 3;

/// Why a run returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    BudgetExhausted,
    /// Execution reached a breakpoint; the instruction there has not run.
    Breakpoint(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub instructions: u64,
    pub cycles: u64,
    /// Compiled blocks executed.
    pub blocks: u64,
    /// Exceptions delivered.
    pub exceptions: u64,
    pub stop: StopReason,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            instructions: 0,
            cycles: 0,
            blocks: 0,
            exceptions: 0,
            stop: StopReason::BudgetExhausted,
        }
    }
}

/// Register and dispatcher view for the debugger.
#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
    pub pc: u32,
    pub npc: u32,
    pub gpr: [u32; 32],
    pub cr: u32,
    pub xer: u32,
    pub msr: u32,
    pub lr: u32,
    pub ctr: u32,
    pub srr0: u32,
    pub srr1: u32,
    pub pending_exceptions: u32,
    pub dispatch: DispatchState,
    pub last_exception: Option<ExceptionKind>,
    pub timebase: u64,
    pub ticks: u64,
    pub instructions: u64,
    pub compiled_blocks: usize,
    pub jit: JitStats,
}

/// Summary of one compiled block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub address: u32,
    pub end: u32,
    pub instructions: u32,
    pub fallbacks: u32,
    pub host_ops: usize,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BlockStatus {
    NotCompiled,
    /// A compiled block covers the address.
    Compiled(BlockInfo),
}

#[derive(Serialize, Deserialize)]
struct SaveImage {
    version: u32,
    cpu: CpuState,
    timebase: u64,
    instructions: u64,
}

pub struct Session {
    config: CoreConfig,
    state: CpuState,
    memory: Box<dyn GuestMemory>,
    jit: Jit,
    timebase: TimeBase,
    scheduler: Scheduler,
    dispatcher: ExceptionDispatcher,
    signal: ExceptionSignal,
    breakpoints: BTreeSet<u32>,
}

impl Session {
    /// Session over flat RAM of `config.ram_size` bytes.
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        let memory = Box::new(FlatMemory::new(config.ram_size));
        Self::with_memory(config, memory)
    }

    pub fn with_memory(config: CoreConfig, memory: Box<dyn GuestMemory>) -> Result<Self> {
        config.validate()?;
        log::info!(
            "session: mode {:?}, {} host registers, blocks up to {} instructions",
            config.mode,
            config.jit.host_registers,
            config.jit.max_block_instructions
        );
        Ok(Self {
            jit: Jit::new(&config),
            config,
            state: CpuState::new(),
            memory,
            timebase: TimeBase::new(),
            scheduler: Scheduler::new(),
            dispatcher: ExceptionDispatcher::new(),
            signal: ExceptionSignal::new(),
            breakpoints: BTreeSet::new(),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn state(&self) -> &CpuState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    pub fn memory(&self) -> &dyn GuestMemory {
        &*self.memory
    }

    pub fn jit_stats(&self) -> JitStats {
        self.jit.stats()
    }

    pub fn ticks(&self) -> u64 {
        self.scheduler.ticks()
    }

    pub fn instructions(&self) -> u64 {
        self.scheduler.instructions()
    }

    /// Current 64-bit time-base value.
    pub fn timebase(&self) -> u64 {
        self.timebase.read_both(self.scheduler.ticks())
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.dispatcher.state()
    }

    /// Handle devices use to post exceptions from any thread.
    pub fn exception_signal(&self) -> ExceptionSignal {
        self.signal.clone()
    }

    /// Switch engines. Compiled code is dropped.
    pub fn set_mode(&mut self, mode: CoreMode) {
        if self.config.mode != mode {
            log::info!("switching to {:?}", mode);
            self.config.mode = mode;
            self.jit.clear_cache();
        }
    }

    // ---- guest memory ----

    /// Write big-endian instruction words starting at `address`.
    pub fn load_program(&mut self, address: u32, words: &[u32]) -> Result<()> {
        for (i, word) in words.iter().enumerate() {
            self.memory
                .write_u32(address.wrapping_add(4 * i as u32), *word)?;
        }
        self.jit.invalidate_range(address, (words.len() * 4) as u32);
        Ok(())
    }

    pub fn write_memory(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        self.memory.write_bytes(address, bytes)?;
        self.jit.invalidate_range(address, bytes.len() as u32);
        Ok(())
    }

    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<()> {
        self.memory.write_u32(address, value)?;
        self.jit.invalidate_range(address, 4);
        Ok(())
    }

    // ---- dispatch ----

    /// Run at least `budget` instructions with the configured engine
    /// (compiled blocks always run to their exit), stopping early at a
    /// breakpoint. A breakpoint at the starting PC is stepped over so
    /// repeated calls make progress.
    pub fn run(&mut self, budget: u64) -> Result<RunSummary> {
        let mut summary = RunSummary::new();
        if budget > 0 && self.breakpoints.contains(&self.state.pc) {
            self.interpret_one(&mut summary);
        }

        while summary.instructions < budget {
            let pc = self.state.pc;
            if self.breakpoints.contains(&pc) {
                log::debug!("breakpoint hit at 0x{:08X}", pc);
                summary.stop = StopReason::Breakpoint(pc);
                break;
            }
            match self.config.mode {
                CoreMode::Interpreter => self.interpret_one(&mut summary),
                CoreMode::Jit => {
                    let handle = match self.jit.lookup(pc) {
                        Some(handle) => Some(handle),
                        None => self.compile(pc)?,
                    };
                    match handle {
                        Some(handle) => self.run_block(handle, &mut summary)?,
                        // unfetchable; the interpreter raises the ISI
                        None => self.interpret_one(&mut summary),
                    }
                }
            }
        }

        if summary.stop == StopReason::BudgetExhausted {
            self.boundary_check(&mut summary);
        }
        Ok(summary)
    }

    /// Interpret exactly `count` instructions, ignoring breakpoints.
    pub fn run_interpreted(&mut self, count: u64) -> RunSummary {
        let mut summary = RunSummary::new();
        for _ in 0..count {
            self.interpret_one(&mut summary);
        }
        self.boundary_check(&mut summary);
        summary
    }

    /// Execute one instruction through the interpreter.
    pub fn step(&mut self) -> RunSummary {
        let mut summary = RunSummary::new();
        self.interpret_one(&mut summary);
        summary
    }

    /// Compile the block at `address`. `None` if nothing can be fetched
    /// there.
    pub fn compile(&mut self, address: u32) -> Result<Option<BlockHandle>> {
        self.jit
            .compile(&*self.memory, address, &self.breakpoints)
    }

    /// Run one compiled block and handle its exit.
    pub fn run_compiled(&mut self, handle: BlockHandle) -> Result<RunSummary> {
        let mut summary = RunSummary::new();
        self.run_block(handle, &mut summary)?;
        Ok(summary)
    }

    fn interpret_one(&mut self, summary: &mut RunSummary) {
        let mut ctx = ExecContext::new(
            &mut *self.memory,
            &mut self.timebase,
            &self.signal,
            self.scheduler.ticks(),
            self.config.overflow_policy,
        );
        let (outcome, decoded) = Interpreter::step(&mut self.state, &mut ctx);
        let writes = std::mem::take(&mut ctx.code_writes);

        let cycles = decoded.map_or(1, |decoded| decoded.info().cycles);
        self.scheduler.advance(u64::from(cycles), 1);
        summary.instructions += 1;
        summary.cycles += u64::from(cycles);
        self.apply_code_writes(&writes);

        match outcome {
            StepOutcome::Continue => {}
            StepOutcome::Exception => self.deliver_sync(summary),
            StepOutcome::Branch | StepOutcome::EndBlock => self.boundary_check(summary),
            StepOutcome::ExceptionCheck => self.external_check(summary),
        }
    }

    fn run_block(&mut self, handle: BlockHandle, summary: &mut RunSummary) -> Result<()> {
        let mut ctx = ExecContext::new(
            &mut *self.memory,
            &mut self.timebase,
            &self.signal,
            self.scheduler.ticks(),
            self.config.overflow_policy,
        );
        let run: BlockRun = self.jit.run(handle, &mut self.state, &mut ctx)?;
        let writes = std::mem::take(&mut ctx.code_writes);

        self.scheduler
            .advance(u64::from(run.cycles), u64::from(run.instructions));
        summary.instructions += u64::from(run.instructions);
        summary.cycles += u64::from(run.cycles);
        summary.blocks += 1;
        self.apply_code_writes(&writes);

        match run.exit {
            BlockExit::Fallthrough(_) => {}
            BlockExit::Exception => self.deliver_sync(summary),
            BlockExit::Jump(_) => self.boundary_check(summary),
            BlockExit::ExceptionCheck(_) => self.external_check(summary),
        }
        Ok(())
    }

    fn apply_code_writes(&mut self, writes: &[CodeWrite]) {
        for write in writes {
            self.jit.invalidate_range(write.address, write.len);
        }
    }

    fn deliver_sync(&mut self, summary: &mut RunSummary) {
        if self.dispatcher.check_exceptions(&mut self.state).is_some() {
            summary.exceptions += 1;
        }
    }

    fn boundary_check(&mut self, summary: &mut RunSummary) {
        if !self.signal.is_check_requested() {
            return;
        }
        self.dispatcher.poll(&mut self.state, &self.signal);
        if self.dispatcher.check_exceptions(&mut self.state).is_some() {
            summary.exceptions += 1;
        }
    }

    fn external_check(&mut self, summary: &mut RunSummary) {
        self.dispatcher.poll(&mut self.state, &self.signal);
        if self
            .dispatcher
            .check_external_exceptions(&mut self.state)
            .is_some()
        {
            summary.exceptions += 1;
        }
    }

    // ---- debugger ----

    /// Blocks covering `address` are dropped so the next run stops there.
    pub fn add_breakpoint(&mut self, address: u32) {
        if self.breakpoints.insert(address) {
            self.jit.invalidate_range(address, 4);
        }
    }

    pub fn remove_breakpoint(&mut self, address: u32) -> bool {
        let removed = self.breakpoints.remove(&address);
        if removed {
            // blocks that were cut short in front of it
            self.jit.invalidate_range(address.wrapping_sub(4), 4);
        }
        removed
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = u32> + '_ {
        self.breakpoints.iter().copied()
    }

    pub fn snapshot(&self) -> DebugSnapshot {
        let ticks = self.scheduler.ticks();
        DebugSnapshot {
            pc: self.state.pc,
            npc: self.state.npc,
            gpr: self.state.gpr,
            cr: self.state.cr.get(),
            xer: self.state.xer(),
            msr: self.state.msr,
            lr: self.state.spr[spr::LR],
            ctr: self.state.spr[spr::CTR],
            srr0: self.state.spr[spr::SRR0],
            srr1: self.state.spr[spr::SRR1],
            pending_exceptions: self.state.exceptions.bits(),
            dispatch: self.dispatcher.state(),
            last_exception: self.dispatcher.last_delivered(),
            timebase: self.timebase.read_both(ticks),
            ticks,
            instructions: self.scheduler.instructions(),
            compiled_blocks: self.jit.cache().len(),
            jit: self.jit.stats(),
        }
    }

    pub fn block_status(&self, address: u32) -> BlockStatus {
        match self.jit.cache().block_containing(address) {
            Some(block) => BlockStatus::Compiled(BlockInfo {
                address: block.address,
                end: block.end,
                instructions: block.guest_instructions,
                fallbacks: block.fallbacks,
                host_ops: block.code.len(),
                epoch: block.epoch,
            }),
            None => BlockStatus::NotCompiled,
        }
    }

    /// Every compiled block, by address.
    pub fn blocks(&self) -> Vec<BlockInfo> {
        let mut blocks: Vec<BlockInfo> = self
            .jit
            .cache()
            .iter()
            .map(|block| BlockInfo {
                address: block.address,
                end: block.end,
                instructions: block.guest_instructions,
                fallbacks: block.fallbacks,
                host_ops: block.code.len(),
                epoch: block.epoch,
            })
            .collect();
        blocks.sort_by_key(|block| block.address);
        blocks
    }

    // ---- save states ----

    pub fn save_state(&self) -> Result<Vec<u8>> {
        let image = SaveImage {
            version: SAVE_VERSION,
            cpu: self.state.clone(),
            timebase: self.timebase(),
            instructions: self.scheduler.instructions(),
        };
        let json = serde_json::to_vec(&image)?;
        let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)?;

        let mut out = Vec::with_capacity(SAVE_HEADER_LEN + compressed.len());
        out.extend_from_slice(SAVE_MAGIC);
        out.extend_from_slice(&crc32fast::hash(&compressed).to_le_bytes());
        out.extend_from_slice(&compressed);
        log::debug!(
            "save state: {} bytes of JSON, {} compressed",
            json.len(),
            compressed.len()
        );
        Ok(out)
    }

    /// Restore CPU state. The time base resumes from the saved value and
    /// all compiled code is dropped.
    pub fn load_state(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < SAVE_HEADER_LEN || &data[..4] != SAVE_MAGIC {
            return Err(CoreError::save_state("not a save state image"));
        }
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&data[4..SAVE_HEADER_LEN]);
        let payload = &data[SAVE_HEADER_LEN..];
        let actual = crc32fast::hash(payload);
        if u32::from_le_bytes(crc) != actual {
            return Err(CoreError::save_state(format!(
                "checksum mismatch (stored 0x{:08X}, computed 0x{:08X})",
                u32::from_le_bytes(crc),
                actual
            )));
        }

        let json = zstd::decode_all(payload)?;
        let image: SaveImage = serde_json::from_slice(&json)?;
        if image.version != SAVE_VERSION {
            return Err(CoreError::save_state(format!(
                "unsupported version {} (expected {})",
                image.version, SAVE_VERSION
            )));
        }
        if image.cpu.spr.len() != spr::COUNT {
            return Err(CoreError::save_state(format!(
                "SPR file has {} entries, expected {}",
                image.cpu.spr.len(),
                spr::COUNT
            )));
        }

        self.state = image.cpu;
        self.timebase.rebase(image.timebase, self.scheduler.ticks());
        self.dispatcher = ExceptionDispatcher::new();
        self.jit.clear_cache();
        log::info!(
            "loaded save state at 0x{:08X} ({} instructions when saved)",
            self.state.pc,
            image.instructions
        );
        Ok(())
    }

    pub fn save_state_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.save_state()?)?;
        Ok(())
    }

    pub fn load_state_from_file(&mut self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)?;
        self.load_state(&data)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.config.mode)
            .field("pc", &format_args!("0x{:08X}", self.state.pc))
            .field("ticks", &self.scheduler.ticks())
            .field("jit", &self.jit)
            .field("breakpoints", &self.breakpoints.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 0x8000_3100;

    fn session(mode: CoreMode) -> Session {
        let config = CoreConfig {
            mode,
            ram_size: 0x10000,
            ..CoreConfig::default()
        };
        Session::new(config).unwrap()
    }

    #[test]
    fn test_save_state_rejects_corruption() {
        let mut session = session(CoreMode::Jit);
        session.state_mut().gpr[5] = 0x1234;
        let mut image = session.save_state().unwrap();
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        assert!(matches!(
            session.load_state(&image),
            Err(CoreError::SaveState { .. })
        ));
        assert!(session.load_state(b"nope").is_err());
    }

    #[test]
    fn test_breakpoint_at_start_is_stepped_over() {
        let mut session = session(CoreMode::Jit);
        // li r3,1 ; li r4,2 ; b -8
        session
            .load_program(BASE, &[0x3860_0001, 0x3880_0002, 0x4BFF_FFF8])
            .unwrap();
        session.state_mut().set_pc(BASE);
        session.add_breakpoint(BASE);

        let summary = session.run(10).unwrap();
        assert_eq!(session.state().gpr[3], 1);
        assert_eq!(session.state().gpr[4], 2);
        assert_eq!(summary.stop, StopReason::Breakpoint(BASE));
        assert_eq!(summary.instructions, 3);
    }
}
