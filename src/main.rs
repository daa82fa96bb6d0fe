//! Rampart - declarative firewall policy compiler
//!
//! Thin CLI over the library: load a policy document, compile it, print
//! the result.
//!
//! # Usage
//!
//! ```bash
//! rampart translate policy.json   # Compile and print the rule dump
//! rampart check policy.json      # Validate only
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use rampart::{Compiled, Compiler, Policy, Result, StaticResolver};

#[derive(Parser)]
#[command(name = "rampart")]
#[command(about = "Declarative firewall policy compiler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a policy and print the resulting rule dump
    Translate {
        /// Path to the policy document (JSON)
        policy: PathBuf,
    },
    /// Compile a policy, reporting errors without printing rules
    Check {
        /// Path to the policy document (JSON)
        policy: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn compile(path: &Path) -> Result<Compiled> {
    let policy = Policy::load(path)?;
    let resolver = StaticResolver::new();
    Compiler::new(&policy, &resolver).compile()
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Translate { policy } => {
            let compiled = compile(&policy)?;
            print!("{}", compiled.to_restore_text());
            for ipset in &compiled.ipsets {
                match ipset.family {
                    Some(family) => eprintln!(
                        "# requires ipset: {} ({}, {family})",
                        ipset.name, ipset.set_type
                    ),
                    None => eprintln!("# requires ipset: {} ({})", ipset.name, ipset.set_type),
                }
            }
        }
        Commands::Check { policy } => {
            let compiled = compile(&policy)?;
            eprintln!("OK: {} rules", compiled.rules.len());
        }
    }
    Ok(())
}
