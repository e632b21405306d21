use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "shipflow")]
#[command(about = "Business process orchestration for shipping documents and bookings")]
#[command(long_about = "shipflow runs versioned state machines with guarded transitions, SLA escalation \
                       and saga workflows. Definitions are loaded from a JSON or TOML bundle; start with \
                       'shipflow validate <file>'.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to shipflow.toml / .shipflow-rc in the working directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that a definitions bundle parses and publishes cleanly
    Validate {
        /// Definitions bundle (.json or .toml)
        file: PathBuf,
    },
    /// Describe the state machines, SLA policies and workflows in a bundle
    Inspect {
        /// Definitions bundle (.json or .toml)
        file: PathBuf,
        /// Print the parsed bundle as JSON
        #[arg(long, help = "Emit the parsed bundle as JSON instead of a summary")]
        json: bool,
    },
    /// Run a line-delimited JSON session on stdin/stdout
    Run {
        /// Definitions bundle (.json or .toml)
        #[arg(long)]
        definitions: PathBuf,
        /// Answer every saga action by echoing its input
        #[arg(long, help = "Register an echo action for every saga action name")]
        dry_run_actions: bool,
        /// Start a manual clock at this RFC 3339 instant instead of using wall time
        #[arg(long, help = "Use a manual clock (advanced with the 'advance' op)")]
        manual_clock: Option<String>,
    },
}
