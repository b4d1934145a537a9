use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ikafssn_index::builder::{build_volume, BuildConfig};
use ikafssn_index::filter::filter_volumes_cross_volume;
use ikafssn_index::source::TwoBitFileSource;
use std::path::PathBuf;

/// Build and filter inverted k-mer indices over packed nucleotide sequences.
#[derive(Parser)]
#[command(name = "ikafssn-idxbuild", author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build one volume's .kix/.kpx/.ksx from a 2bit source.
    Build {
        /// K-mer length, 5..=16.
        #[arg(long)]
        k: u8,

        /// Worker thread count for the rayon pool.
        #[arg(long, default_value_t = 1)]
        threads: usize,

        /// Number of k-mer-space partitions Phase 2 streams through (power of two).
        #[arg(long, default_value_t = 1)]
        partitions: u32,

        /// Per-partition posting buffer budget, in megabytes.
        #[arg(long, default_value_t = 256)]
        buffer_mb: usize,

        /// Reject ambiguous windows whose descriptor expansion exceeds this many k-mers.
        #[arg(long, default_value_t = 64)]
        max_expansion: u32,

        /// Zero out any k-mer whose in-volume count exceeds this (0 disables).
        #[arg(long, default_value_t = 0)]
        local_freq_cap: u32,

        /// This volume's index among --total-volumes.
        #[arg(long, default_value_t = 0)]
        volume_index: u16,

        /// Total number of volumes in the database.
        #[arg(long, default_value_t = 1)]
        total_volumes: u16,

        /// Database name recorded in the .kix header.
        #[arg(long)]
        db_name: String,

        /// Path to a .2bit source file.
        #[arg(long)]
        source: PathBuf,

        /// Output path prefix; writes <prefix>.kix/.kpx/.ksx.
        #[arg(long)]
        output: PathBuf,

        /// Print progress bars.
        #[arg(short, long)]
        verbose: bool,
    },

    /// Cross-volume frequency filter: exclude globally over-represented k-mers.
    Filter {
        /// K-mer length, must match every volume's build.
        #[arg(long)]
        k: u8,

        /// Exclude k-mers whose combined count across all volumes exceeds this.
        #[arg(long)]
        global_freq_cap: u64,

        /// Output path for the shared exclusion bitset.
        #[arg(long)]
        khx: PathBuf,

        /// Per-volume output prefixes (each must have a matching .kix.tmp/.kpx.tmp/.ksx.tmp).
        #[arg(required = true)]
        prefixes: Vec<PathBuf>,
    },
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Build {
            k,
            threads,
            partitions,
            buffer_mb,
            max_expansion,
            local_freq_cap,
            volume_index,
            total_volumes,
            db_name,
            source,
            output,
            verbose,
        } => {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()
                .context("building rayon thread pool")?;

            let src = TwoBitFileSource::open(&source)
                .with_context(|| format!("opening 2bit source {source:?}"))?;

            let config = BuildConfig {
                k,
                threads,
                partitions,
                buffer_bytes: buffer_mb * 1024 * 1024,
                max_expansion,
                local_freq_cap,
                volume_index,
                total_volumes,
                db_name,
                verbose,
            };

            build_volume(&src, &config, &output)
                .with_context(|| format!("building volume at {output:?}"))?;
            Ok(())
        }

        Command::Filter {
            k,
            global_freq_cap,
            khx,
            prefixes,
        } => {
            filter_volumes_cross_volume(&prefixes, &khx, k, global_freq_cap)
                .context("running cross-volume frequency filter")?;
            Ok(())
        }
    }
}
