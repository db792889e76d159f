//! nodestream - copy bytes through Node.js-style stream pipelines
//!
//! `nodestream cat <input>` reads a file (or stdin with `-`), optionally
//! compresses, decompresses or re-encodes it, and writes the result to a file
//! or stdout with backpressure end to end.

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use miette::{IntoDiagnostic, Result, WrapErr};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use nodestream::cli::{CatConfig, CliError, run_cat};
use nodestream::encoding::Encoding;
use nodestream::transport::ZlibMode;

#[derive(Parser)]
#[command(name = "nodestream")]
#[command(author, version, about = "Node.js-style streams: pipe bytes through transforms")]
struct Cli {
    /// Print a summary line to stderr when done
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy input to output through optional transforms
    Cat {
        /// Input file, `-` for stdin
        input: String,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        codec: CodecArgs,

        /// Compression level (0-9, -1 for the default)
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        level: i32,

        /// Render the bytes as text in this encoding (hex, base64, latin1, ...)
        #[arg(long)]
        encode: Option<Encoding>,

        /// Buffer size in bytes at which backpressure starts
        #[arg(long)]
        high_water_mark: Option<usize>,
    },
}

#[derive(Args)]
#[group(multiple = false)]
struct CodecArgs {
    /// Compress with gzip
    #[arg(long)]
    gzip: bool,
    /// Decompress gzip
    #[arg(long)]
    gunzip: bool,
    /// Compress with zlib deflate
    #[arg(long)]
    deflate: bool,
    /// Decompress zlib deflate
    #[arg(long)]
    inflate: bool,
    /// Decompress gzip or zlib, detected from the header
    #[arg(long)]
    unzip: bool,
}

impl CodecArgs {
    fn mode(&self) -> Option<ZlibMode> {
        [
            (self.gzip, ZlibMode::Gzip),
            (self.gunzip, ZlibMode::Gunzip),
            (self.deflate, ZlibMode::Deflate),
            (self.inflate, ZlibMode::Inflate),
            (self.unzip, ZlibMode::Unzip),
        ]
        .into_iter()
        .find_map(|(set, mode)| set.then_some(mode))
    }
}

fn main() -> Result<()> {
    // Logs go to stderr so they never mix with piped output
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Cat {
            input,
            output,
            codec,
            level,
            encode,
            high_water_mark,
        } => {
            let config = CatConfig {
                input: (input != "-").then(|| PathBuf::from(input)),
                output,
                codec: codec.mode(),
                level,
                encode,
                high_water_mark,
            };
            tracing::debug!(?config, "cat");

            match run_cat(&config) {
                Ok(summary) => {
                    if cli.verbose {
                        eprintln!("{}", summary.report());
                    }
                }
                Err(CliError::Open { path, source }) => {
                    return Err(source)
                        .into_diagnostic()
                        .wrap_err(format!("cannot open {}", path.display()));
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
