pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "crmgate",
    about = "crmgate operator CLI",
    long_about = "Apply store migrations, inspect effective configuration, check deployment readiness, and preview risk thresholds offline.",
    after_help = "Examples:\n  crmgate doctor --json\n  crmgate config\n  crmgate risk-preview --input opportunities.json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending SQLite migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, credential mode, and store connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Run risk analysis over exported opportunity records with the configured thresholds")]
    RiskPreview {
        #[arg(long, help = "JSON file holding an array of Opportunity records")]
        input: PathBuf,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::config::run(),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::RiskPreview { input } => commands::risk_preview::run(&input),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
