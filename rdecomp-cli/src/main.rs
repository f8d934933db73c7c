// CLI application
use clap::Parser;
use commands::{decompile, disasm, list_passes};
use indicatif::{ProgressBar, ProgressStyle};
use rdecomp_core::decompiler::pipeline::{PassObserver, PassReport};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "rdecomp")]
#[command(about = "Decompiler backend: decoded instructions to C-like pseudocode")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Build control-flow graphs and print a summary
    Disasm {
        /// JSON array of decoded records
        records: PathBuf,
    },
    /// Run the pass pipeline and emit pseudocode
    Decompile {
        /// JSON array of decoded records
        records: PathBuf,

        /// Decompiler configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Worker threads for per-function passes
        #[arg(short, long)]
        threads: Option<usize>,

        /// Write region trees, variables and types as JSON
        #[arg(long)]
        json: Option<PathBuf>,

        /// Write pseudocode to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the available passes
    Passes,
}

/// Advances a progress bar once per finished pass.
struct ProgressObserver {
    bar: ProgressBar,
}

impl PassObserver for ProgressObserver {
    fn pass_started(&self, name: &str, _index: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_message(name.to_string());
    }

    fn pass_finished(&self, report: &PassReport) {
        log::debug!("{} finished in {:?}", report.name, report.duration);
        self.bar.inc(1);
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Disasm { records } => {
            disasm(&records)?;
        }
        Commands::Decompile {
            records,
            config,
            threads,
            json,
            output,
        } => {
            let observer = ProgressObserver {
                bar: create_progress_bar(),
            };
            decompile(
                &records,
                config.as_deref(),
                threads,
                json.as_deref(),
                output.as_deref(),
                Some(&observer),
            )?;
            observer.bar.finish_with_message("done");
        }
        Commands::Passes => {
            list_passes()?;
        }
    }

    Ok(())
}

fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb
}
