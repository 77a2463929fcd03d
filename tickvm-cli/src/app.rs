use clap::{Parser, Subcommand};

/// tickvm - run programs on a cooperative, tick-preempted thread virtual machine
#[derive(Debug, Parser)]
#[command(name = "tickvm", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit the run summary as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging of scheduling decisions.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a built-in program as the main thread of a new virtual machine.
    Run {
        /// Name of the program (see `tickvm list`).
        #[arg(value_name = "PROGRAM")]
        program: String,

        /// Arguments passed to the program after its name.
        #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Interval between timer ticks in milliseconds.
        #[arg(short, long, default_value_t = 10)]
        tick_ms: u32,

        /// Maximum number of live threads, idle and main included.
        #[arg(long)]
        max_threads: Option<usize>,

        /// Total bytes of stack all threads may reserve.
        #[arg(long, value_name = "BYTES")]
        stack_budget: Option<usize>,

        /// Print scheduling statistics once the program finished.
        #[arg(long)]
        stats: bool,
    },

    /// List the built-in programs.
    List,
}
