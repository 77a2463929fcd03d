//! Builder and entry point of a virtual machine run.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{atomic::AtomicBool, Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    machine::{Alarm, ContextTable, FileBackend, Retired, ThreadedFileBackend},
    runtime::{
        program::{ProgramEntry, ProgramRegistry},
        vm::{idle, panic_message, trampoline, Exit, Shared},
        Vm,
    },
    vm::{SchedulerCore, ThreadEntry, ThreadId, VmConfig, VmStats},
    Error, Result,
};

/// Summary of a finished run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    /// Name of the program that ran on the main thread.
    pub program: String,
    /// Counters collected by the scheduler.
    pub stats: VmStats,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

/// Builder for virtual machine runs.
///
/// # Examples
///
/// ## Starting a Registered Program
///
/// ```rust,no_run
/// use tickvm::{Vm, VmBuilder, VmConfig};
///
/// fn greet(vm: &Vm, args: &[String]) -> tickvm::Result<()> {
///     tickvm::vm_print!(vm, "hello {}\n", args.get(1).map_or("world", String::as_str))
/// }
///
/// let report = VmBuilder::new()
///     .config(VmConfig::responsive())
///     .program("greet", "Prints a greeting", greet)
///     .start(&["greet".to_string(), "tickvm".to_string()])?;
/// println!("{} ticks", report.stats.ticks);
/// # Ok::<(), tickvm::Error>(())
/// ```
///
/// ## Running a Closure
///
/// ```rust,no_run
/// use tickvm::{Timeout, VmBuilder};
///
/// VmBuilder::new().tick_ms(1).run(|vm| vm.thread_sleep(Timeout::Ticks(3)))?;
/// # Ok::<(), tickvm::Error>(())
/// ```
pub struct VmBuilder {
    /// Configuration of the run.
    config: VmConfig,
    /// Programs [`VmBuilder::start`] can resolve.
    programs: ProgramRegistry,
    /// Custom file backend; a [`ThreadedFileBackend`] is spawned otherwise.
    backend: Option<Arc<dyn FileBackend>>,
}

impl Default for VmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VmBuilder {
    /// Creates a builder with [`VmConfig::default`] and no programs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: VmConfig::default(),
            programs: ProgramRegistry::new(),
            backend: None,
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the tick interval.
    #[must_use]
    pub fn tick_ms(mut self, tick_ms: u32) -> Self {
        self.config.tick_ms = tick_ms;
        self
    }

    /// Registers a program.
    #[must_use]
    pub fn program(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        entry: ProgramEntry,
    ) -> Self {
        self.programs.register(name, description, entry);
        self
    }

    /// Replaces the program registry.
    #[must_use]
    pub fn programs(mut self, programs: ProgramRegistry) -> Self {
        self.programs = programs;
        self
    }

    /// Uses `backend` for file operations.
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn FileBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// The registered programs.
    #[must_use]
    pub fn registry(&self) -> &ProgramRegistry {
        &self.programs
    }

    /// Starts the program named by `args[0]` and runs until its entry returns.
    ///
    /// The calling OS thread becomes the main thread of the virtual machine.
    /// The entry receives all of `args`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if `args` is empty
    /// - [`Error::Failure`] if no program of that name is registered
    /// - any error returned by the program entry
    pub fn start(self, args: &[String]) -> Result<RunReport> {
        let name = args.first().ok_or(Error::InvalidParameter)?;
        let Some(program) = self.programs.get(name).cloned() else {
            warn!("no program named '{name}'");
            return Err(Error::Failure);
        };

        let args = args.to_vec();
        let entry = program.entry;
        self.launch(program.name, Arc::new(move |vm: &Vm| entry(vm, &args)))
    }

    /// Runs `entry` as the main thread.
    ///
    /// # Errors
    ///
    /// Any error returned by `entry`, or by setting up the run.
    pub fn run<F>(self, entry: F) -> Result<RunReport>
    where
        F: Fn(&Vm) -> Result<()> + Send + Sync + 'static,
    {
        self.launch("main".to_string(), Arc::new(entry))
    }

    fn launch(self, program: String, main: ThreadEntry) -> Result<RunReport> {
        let config = self.config;
        let backend = match self.backend {
            Some(backend) => backend,
            None => Arc::new(ThreadedFileBackend::new(&format!(
                "{}-io",
                config.context_name
            ))?),
        };

        let idle: ThreadEntry = Arc::new(idle);
        let core = SchedulerCore::new(&config, idle.clone(), main.clone())?;
        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            wakeup: Condvar::new(),
            contexts: ContextTable::new(config.context_name.clone()),
            backend,
            config: config.clone(),
            shutdown: AtomicBool::new(false),
        });
        let vm = Vm::new(shared.clone());

        let mut alarm = match Self::boot(&vm, &shared, idle) {
            Ok(alarm) => alarm,
            Err(error) => {
                vm.shutdown();
                return Err(error);
            }
        };

        info!("running '{program}' with {}ms ticks", config.tick_ms);
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| main(&vm)));

        alarm.stop();
        vm.shutdown();
        let elapsed = started.elapsed();
        let stats = vm.final_stats();
        debug!("'{program}' finished after {elapsed:?}: {stats:?}");

        match outcome {
            Ok(result) => result?,
            Err(payload) if payload.is::<Retired>() || payload.is::<Exit>() => {
                debug!("main thread terminated");
            }
            Err(payload) => {
                return Err(failure!(
                    "main thread panicked: {}",
                    panic_message(payload.as_ref())
                ));
            }
        }

        Ok(RunReport {
            program,
            stats,
            elapsed,
        })
    }

    /// Registers the main context, parks the idle context and starts the tick source.
    fn boot(vm: &Vm, shared: &Arc<Shared>, idle: ThreadEntry) -> Result<Alarm> {
        let config = &shared.config;
        shared.contexts.adopt(ThreadId::MAIN)?;

        let idle_vm = vm.clone();
        shared
            .contexts
            .create(ThreadId::IDLE, config.idle_stack_size, move || {
                trampoline(&idle_vm, ThreadId::IDLE, &idle);
            })?;

        let bridge = Arc::downgrade(shared);
        Alarm::start(
            &format!("{}-alarm", config.context_name),
            Duration::from_millis(u64::from(config.tick_ms)),
            Box::new(move || {
                if let Some(shared) = bridge.upgrade() {
                    shared.tick();
                }
            }),
        )
    }
}
