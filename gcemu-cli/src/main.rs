// CLI application
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

mod commands;

use commands::{compare_engines, run_image, show_config, ImageArgs, ModeArg, RunOptions};

#[derive(Parser)]
#[command(name = "gcemu")]
#[command(about = "Gekko integer execution core runner")]
#[command(version)]
struct Cli {
    /// Configuration file (default: <config dir>/gcemu/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run a raw big-endian program image
    Run {
        #[command(flatten)]
        image: ImageArgs,

        /// Instructions to execute
        #[arg(short = 'n', long, default_value_t = 1_000_000)]
        instructions: u64,

        /// Engine override
        #[arg(short, long, value_enum)]
        mode: Option<ModeArg>,

        /// Stop before executing this address (repeatable)
        #[arg(short, long, value_parser = commands::parse_address)]
        breakpoint: Vec<u32>,

        /// Restore CPU state from a save state before running
        #[arg(long)]
        load_state: Option<PathBuf>,

        /// Write a save state after running
        #[arg(long)]
        save_state: Option<PathBuf>,

        /// Print the final register snapshot as JSON
        #[arg(long)]
        dump: bool,
    },
    /// Run the interpreter and the JIT in lockstep and report the first divergence
    Compare {
        #[command(flatten)]
        image: ImageArgs,

        /// Instructions to execute
        #[arg(short = 'n', long, default_value_t = 100_000)]
        instructions: u64,

        /// Instructions per lockstep slice
        #[arg(long, default_value_t = 64)]
        slice: u64,
    },
    /// Print the effective configuration
    Config {
        /// Write the defaults to the configuration file
        #[arg(long)]
        init: bool,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config_path = cli.config.or_else(commands::default_config_path);

    match cli.command {
        Commands::Run {
            image,
            instructions,
            mode,
            breakpoint,
            load_state,
            save_state,
            dump,
        } => {
            let pb = create_progress_bar("Running...");
            run_image(
                config_path.as_deref(),
                &image,
                RunOptions {
                    instructions,
                    mode,
                    breakpoints: breakpoint,
                    load_state,
                    save_state,
                    dump,
                },
                &pb,
            )?;
            pb.finish_and_clear();
        }
        Commands::Compare {
            image,
            instructions,
            slice,
        } => {
            let pb = create_progress_bar("Comparing engines...");
            compare_engines(config_path.as_deref(), &image, instructions, slice, &pb)?;
            pb.finish_and_clear();
        }
        Commands::Config { init } => {
            show_config(config_path.as_deref(), init)?;
        }
    }

    Ok(())
}

fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg} [{elapsed_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(message.to_string());
    pb
}
