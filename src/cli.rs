use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Origin file of the L-system
    pub file: PathBuf,

    /// Generations to step (default: `#iterations` of the file, or 0)
    #[arg(short = 'n', long, value_name = "AMOUNT")]
    pub iterations: Option<u32>,

    /// Seed for stochastic rules (default: random)
    #[arg(short, long, value_name = "SEED")]
    pub seed: Option<u64>,

    /// Override a `#define`
    #[arg(short = 'D', long = "define", value_name = "NAME=VALUE")]
    pub defines: Vec<String>,

    /// Set a `#runtime` parameter
    #[arg(short, long = "global", value_name = "NAME=VALUE")]
    pub globals: Vec<String>,

    /// Print every generation, not just the last
    #[arg(short, long)]
    pub each: bool,

    /// Step on the calling thread only
    #[arg(long)]
    pub sequential: bool,
}
