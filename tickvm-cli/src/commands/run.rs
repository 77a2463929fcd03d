use anyhow::Context;
use serde::Serialize;
use tickvm::{RunReport, VmBuilder, VmConfig};

use crate::{
    app::GlobalOptions,
    output::{print_output, Align, TabWriter},
    programs,
};

/// Flags of the `run` subcommand.
pub struct RunOptions<'a> {
    pub tick_ms: u32,
    pub max_threads: Option<usize>,
    pub stack_budget: Option<usize>,
    pub stats: bool,
    pub global: &'a GlobalOptions,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub program: String,
    pub tick_ms: u32,
    pub elapsed_ms: u128,
    pub ticks: u64,
    pub context_switches: u64,
    pub preemptions: u64,
    pub threads_created: u64,
    pub io_completions: u64,
    pub mutex_timeouts: u64,
}

impl RunSummary {
    fn new(report: &RunReport, tick_ms: u32) -> Self {
        Self {
            program: report.program.clone(),
            tick_ms,
            elapsed_ms: report.elapsed.as_millis(),
            ticks: report.stats.ticks,
            context_switches: report.stats.context_switches,
            preemptions: report.stats.preemptions,
            threads_created: report.stats.threads_created,
            io_completions: report.stats.io_completions,
            mutex_timeouts: report.stats.mutex_timeouts,
        }
    }
}

fn build_config(opts: &RunOptions<'_>) -> VmConfig {
    let mut config = VmConfig::default().with_tick_ms(opts.tick_ms);
    if let Some(max) = opts.max_threads {
        config = config.with_max_threads(max);
    }
    if let Some(bytes) = opts.stack_budget {
        config = config.with_stack_budget(bytes);
    }
    config
}

pub fn run(program: &str, args: &[String], opts: &RunOptions<'_>) -> anyhow::Result<()> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(program.to_string());
    argv.extend_from_slice(args);

    let report = VmBuilder::new()
        .config(build_config(opts))
        .programs(programs::registry())
        .start(&argv)
        .with_context(|| format!("program '{program}' failed"))?;

    if !opts.stats && !opts.global.json {
        return Ok(());
    }

    let summary = RunSummary::new(&report, opts.tick_ms);
    print_output(&summary, opts.global, |s| {
        eprintln!();
        let mut table = TabWriter::new(vec![("STAT", Align::Left), ("VALUE", Align::Right)]);
        table.row(vec!["program".into(), s.program.clone()]);
        table.row(vec!["elapsed".into(), format!("{}ms", s.elapsed_ms)]);
        table.row(vec!["tick".into(), format!("{}ms", s.tick_ms)]);
        table.row(vec!["ticks".into(), s.ticks.to_string()]);
        table.row(vec!["context switches".into(), s.context_switches.to_string()]);
        table.row(vec!["preemptions".into(), s.preemptions.to_string()]);
        table.row(vec!["threads created".into(), s.threads_created.to_string()]);
        table.row(vec!["i/o completions".into(), s.io_completions.to_string()]);
        table.row(vec!["mutex timeouts".into(), s.mutex_timeouts.to_string()]);
        table.print();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(global: &GlobalOptions) -> RunOptions<'_> {
        RunOptions {
            tick_ms: 1,
            max_threads: Some(16),
            stack_budget: None,
            stats: false,
            global,
        }
    }

    #[test]
    fn test_build_config_applies_overrides() {
        let global = GlobalOptions {
            json: false,
            verbose: false,
        };
        let config = build_config(&options(&global));
        assert_eq!(config.tick_ms, 1);
        assert_eq!(config.max_threads, 16);
        assert_eq!(config.stack_budget, VmConfig::default().stack_budget);
    }

    #[test]
    fn test_unknown_program_is_an_error() {
        let global = GlobalOptions {
            json: false,
            verbose: false,
        };
        assert!(run("does-not-exist", &[], &options(&global)).is_err());
    }

    #[test]
    fn test_runs_builtin_program() {
        let global = GlobalOptions {
            json: false,
            verbose: false,
        };
        assert!(run("threads", &[], &options(&global)).is_ok());
    }
}
