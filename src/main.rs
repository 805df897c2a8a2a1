mod cli;
mod commands;
mod providers;
mod render;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // MAESTRO_LOG overrides the -v mapping when set.
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(if cli.quiet {
        log::LevelFilter::Error
    } else {
        log_level
    });
    if let Ok(spec) = std::env::var("MAESTRO_LOG") {
        builder.parse_filters(&spec);
    }
    builder.format_timestamp(None).init();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let code = match cli.command {
        Command::Plan(args) => commands::plan::run(args)?,
        Command::Apply(args) => commands::apply::run(args)?,
        Command::Destroy(args) => commands::destroy::run(args)?,
        Command::Refresh(args) => commands::refresh::run(args)?,
        Command::Validate(args) => commands::validate::run(args)?,
        Command::Output(args) => commands::output::run(args)?,
        Command::State(cmd) => commands::state_cmd::run(cmd)?,
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "maestro", &mut io::stdout());
            0
        }
    };
    Ok(ExitCode::from(code))
}
