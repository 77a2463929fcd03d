mod app;
mod commands;
mod output;
mod programs;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })
    .expect("failed to set Ctrl+C handler");

    let cli = Cli::parse();

    // tickvm info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("tickvm", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp_millis()
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    match &cli.command {
        Command::Run {
            program,
            args,
            tick_ms,
            max_threads,
            stack_budget,
            stats,
        } => commands::run::run(
            program,
            args,
            &commands::run::RunOptions {
                tick_ms: *tick_ms,
                max_threads: *max_threads,
                stack_budget: *stack_budget,
                stats: *stats,
                global: &cli.global,
            },
        ),
        Command::List => commands::list::run(&cli.global),
    }
}
