use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process;

/// Warden — runtime contract enforcement CLI
///
/// Validate and fingerprint contract documents.
#[derive(Parser)]
#[command(name = "warden", version, about, long_about = None)]
struct Cli {
    /// Log enforcement decisions to stderr
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a contract document (shape + predicate rules)
    Validate {
        /// Path to JSON contract document
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compute the SHA-256 fingerprint of a contract document
    Hash {
        /// Path to JSON contract document
        file: PathBuf,
    },

    /// Show version information
    Version,
}

// Exit codes: 0 = pass, 1 = contract invalid, 2 = I/O or JSON error

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
            .init();
    }

    let exit_code = match cli.command {
        Commands::Validate { file, json } => cmd_validate(&file, json),
        Commands::Hash { file } => cmd_hash(&file),
        Commands::Version => {
            println!(
                "warden {} (warden-core {})",
                env!("CARGO_PKG_VERSION"),
                warden_core::VERSION
            );
            0
        }
    };

    process::exit(exit_code);
}

fn load_document(file: &Path) -> Result<serde_json::Value, i32> {
    let contents = std::fs::read_to_string(file).map_err(|e| {
        eprintln!("{}: cannot read {}: {}", "error".red(), file.display(), e);
        2
    })?;
    serde_json::from_str(&contents).map_err(|e| {
        eprintln!("{}: invalid JSON in {}: {}", "error".red(), file.display(), e);
        2
    })
}

fn cmd_validate(file: &Path, json: bool) -> i32 {
    let doc = match load_document(file) {
        Ok(doc) => doc,
        Err(code) => return code,
    };

    match warden_core::validate_document(&doc) {
        Ok(()) => {
            if json {
                println!("{}", serde_json::json!({ "valid": true }));
            } else {
                println!("{} {}", "PASS".green().bold(), file.display());
            }
            0
        }
        Err(violation) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "valid": false, "error": violation.to_string() })
                );
            } else {
                println!("{} {}", "FAIL".red().bold(), file.display());
                println!("  {}", violation);
            }
            1
        }
    }
}

fn cmd_hash(file: &Path) -> i32 {
    match load_document(file) {
        Ok(doc) => {
            println!("{}", warden_core::fingerprint(&doc));
            0
        }
        Err(code) => code,
    }
}
