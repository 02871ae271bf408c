// CLI command handlers
use anyhow::{bail, Context, Result};
use gcemu_core::cpu::state::CpuState;
use gcemu_core::session::{RunSummary, StopReason};
use gcemu_core::{CoreConfig, CoreMode, Session};
use indicatif::ProgressBar;
use std::fs;
use std::path::{Path, PathBuf};

/// Instructions executed between progress updates.
const PROGRESS_SLICE: u64 = 100_000;

#[derive(clap::Args)]
pub struct ImageArgs {
    /// Raw big-endian program image
    #[arg(short, long)]
    pub image: PathBuf,

    /// Guest address the image is loaded at (just past the exception vectors)
    #[arg(long, default_value = "0x80003100", value_parser = parse_address)]
    pub base: u32,

    /// Entry point (defaults to the load address)
    #[arg(long, value_parser = parse_address)]
    pub entry: Option<u32>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum ModeArg {
    Interpreter,
    Jit,
}

impl From<ModeArg> for CoreMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Interpreter => CoreMode::Interpreter,
            ModeArg::Jit => CoreMode::Jit,
        }
    }
}

pub struct RunOptions {
    pub instructions: u64,
    pub mode: Option<ModeArg>,
    pub breakpoints: Vec<u32>,
    pub load_state: Option<PathBuf>,
    pub save_state: Option<PathBuf>,
    pub dump: bool,
}

/// Accepts `0x`-prefixed hex or decimal.
pub fn parse_address(value: &str) -> std::result::Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => value.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", value, e))
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("gcemu").join("config.json"))
}

fn load_config(path: Option<&Path>) -> Result<CoreConfig> {
    match path {
        Some(path) => CoreConfig::load(path)
            .with_context(|| format!("Failed to load configuration: {}", path.display())),
        None => Ok(CoreConfig::default()),
    }
}

fn create_session(config: CoreConfig, image: &ImageArgs) -> Result<Session> {
    let data = fs::read(&image.image)
        .with_context(|| format!("Failed to read program image: {}", image.image.display()))?;
    if data.len() % 4 != 0 {
        log::warn!(
            "image is {} bytes, not a whole number of instructions",
            data.len()
        );
    }

    let mut session = Session::new(config).context("Failed to create session")?;
    session
        .write_memory(image.base, &data)
        .with_context(|| format!("Image does not fit in guest RAM at 0x{:08X}", image.base))?;
    let entry = image.entry.unwrap_or(image.base);
    session.state_mut().set_pc(entry);
    log::info!(
        "loaded {} bytes at 0x{:08X}, entry 0x{:08X}",
        data.len(),
        image.base,
        entry
    );
    Ok(session)
}

pub fn run_image(
    config_path: Option<&Path>,
    image: &ImageArgs,
    options: RunOptions,
    pb: &ProgressBar,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(mode) = options.mode {
        config.mode = mode.into();
    }
    let mut session = create_session(config, image)?;
    if let Some(path) = &options.load_state {
        session
            .load_state_from_file(path)
            .with_context(|| format!("Failed to load save state: {}", path.display()))?;
    }
    for address in &options.breakpoints {
        session.add_breakpoint(*address);
    }

    let mut total = RunSummary {
        instructions: 0,
        cycles: 0,
        blocks: 0,
        exceptions: 0,
        stop: StopReason::BudgetExhausted,
    };
    while total.instructions < options.instructions {
        let slice = (options.instructions - total.instructions).min(PROGRESS_SLICE);
        let summary = session.run(slice).context("Execution failed")?;
        total.instructions += summary.instructions;
        total.cycles += summary.cycles;
        total.blocks += summary.blocks;
        total.exceptions += summary.exceptions;
        total.stop = summary.stop;
        pb.set_message(format!(
            "{} instructions, PC 0x{:08X}",
            total.instructions,
            session.state().pc
        ));
        if let StopReason::Breakpoint(_) = summary.stop {
            break;
        }
    }
    pb.finish_and_clear();

    match total.stop {
        StopReason::Breakpoint(address) => println!("Breakpoint hit at 0x{:08X}", address),
        StopReason::BudgetExhausted => println!("Instruction budget exhausted"),
    }
    println!("  Mode: {:?}", session.config().mode);
    println!("  Instructions: {}", total.instructions);
    println!("  Cycles: {}", total.cycles);
    println!("  Compiled blocks run: {}", total.blocks);
    println!("  Exceptions delivered: {}", total.exceptions);
    println!("  PC: 0x{:08X}", session.state().pc);
    if session.config().mode == CoreMode::Jit {
        let stats = session.jit_stats();
        println!(
            "  JIT: {} blocks compiled, {} hits, {} misses, {} fallbacks, {} invalidations",
            stats.blocks_compiled,
            stats.cache_hits,
            stats.cache_misses,
            stats.fallbacks_emitted,
            stats.invalidations
        );
    }

    if let Some(path) = &options.save_state {
        session
            .save_state_to_file(path)
            .with_context(|| format!("Failed to write save state: {}", path.display()))?;
        println!("Save state written to: {}", path.display());
    }
    if options.dump {
        let json = serde_json::to_string_pretty(&session.snapshot())
            .context("Failed to serialize snapshot")?;
        println!("{}", json);
    }
    Ok(())
}

/// First architected difference between two register files.
fn first_difference(expected: &CpuState, actual: &CpuState) -> Option<String> {
    if let Some(i) = (0..32).find(|&i| expected.gpr[i] != actual.gpr[i]) {
        return Some(format!(
            "r{}: interpreter 0x{:08X}, jit 0x{:08X}",
            i, expected.gpr[i], actual.gpr[i]
        ));
    }
    if let Some(i) = (0..8).find(|&i| expected.cr.fields[i] != actual.cr.fields[i]) {
        return Some(format!(
            "cr{}: interpreter 0x{:016X}, jit 0x{:016X}",
            i, expected.cr.fields[i], actual.cr.fields[i]
        ));
    }
    let pairs = [
        ("PC", expected.pc, actual.pc),
        ("NPC", expected.npc, actual.npc),
        ("MSR", expected.msr, actual.msr),
        ("XER", expected.xer(), actual.xer()),
        ("exceptions", expected.exceptions.bits(), actual.exceptions.bits()),
    ];
    if let Some((name, a, b)) = pairs.into_iter().find(|(_, a, b)| a != b) {
        return Some(format!("{}: interpreter 0x{:08X}, jit 0x{:08X}", name, a, b));
    }
    expected
        .spr
        .iter()
        .zip(&actual.spr)
        .position(|(a, b)| a != b)
        .map(|i| {
            format!(
                "SPR {}: interpreter 0x{:08X}, jit 0x{:08X}",
                i, expected.spr[i], actual.spr[i]
            )
        })
}

pub fn compare_engines(
    config_path: Option<&Path>,
    image: &ImageArgs,
    instructions: u64,
    slice: u64,
    pb: &ProgressBar,
) -> Result<()> {
    if slice == 0 {
        bail!("--slice must be at least 1");
    }
    let config = load_config(config_path)?;
    let mut jit = create_session(
        CoreConfig {
            mode: CoreMode::Jit,
            ..config.clone()
        },
        image,
    )?;
    let mut interpreter = create_session(
        CoreConfig {
            mode: CoreMode::Interpreter,
            ..config
        },
        image,
    )?;

    let mut executed = 0u64;
    while executed < instructions {
        let pc = jit.state().pc;
        // compiled blocks run to their exit; the interpreter follows exactly
        let summary = jit.run(slice).context("JIT execution failed")?;
        interpreter.run_interpreted(summary.instructions);
        executed += summary.instructions;

        if let Some(difference) = first_difference(interpreter.state(), jit.state()) {
            pb.finish_and_clear();
            bail!(
                "engines diverged within {} instructions starting at 0x{:08X} ({} executed): {}",
                summary.instructions,
                pc,
                executed,
                difference
            );
        }
        if interpreter.ticks() != jit.ticks() {
            pb.finish_and_clear();
            bail!(
                "tick counts diverged after {} instructions: interpreter {}, jit {}",
                executed,
                interpreter.ticks(),
                jit.ticks()
            );
        }
        pb.set_message(format!("{} instructions agree", executed));
    }
    pb.finish_and_clear();

    let stats = jit.jit_stats();
    println!("Engines agree after {} instructions", executed);
    println!(
        "  {} blocks compiled, {} fallbacks emitted",
        stats.blocks_compiled, stats.fallbacks_emitted
    );
    Ok(())
}

pub fn show_config(path: Option<&Path>, init: bool) -> Result<()> {
    let config = load_config(path)?;
    if init {
        let Some(path) = path else {
            bail!("No configuration directory available; pass --config");
        };
        config
            .save(path)
            .with_context(|| format!("Failed to write configuration: {}", path.display()))?;
        println!("Configuration written to: {}", path.display());
    }
    if let Some(path) = path {
        println!("# {}", path.display());
    }
    let json = serde_json::to_string_pretty(&config).context("Failed to serialize configuration")?;
    println!("{}", json);
    Ok(())
}
