//! The [`Vm`] handle: boundary operations invoked by virtual machine threads.
//!
//! Every operation follows the same shape:
//!
//! 1. Deliver a pending preemption (the caller may be switched out here).
//! 2. Enter the critical section and apply the operation to [`SchedulerCore`].
//! 3. Leave the critical section and carry out the resulting [`Switch`], if any.
//!
//! A blocking operation returns once the calling thread has been dispatched
//! again. Operations must only be called from virtual machine threads: the
//! program entry, or entries passed to [`Vm::thread_create`].

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
};

use log::{debug, error, warn};

use crate::{
    machine::{
        retire_current, ContextTable, FileBackend, FileOp, IoCompletion, IoOutcome, OpenFlags,
        Retired, Wake, Whence, IO_FAILURE,
    },
    vm::{
        AcquireOutcome, IoTicket, MutexId, SchedulerCore, Switch, ThreadEntry, ThreadId,
        ThreadPriority, ThreadState, Tick, Timeout, VmConfig, VmStats,
    },
    Error, Result,
};

/// Unwind payload of a thread that terminated itself.
#[derive(Debug)]
pub(crate) struct Exit;

/// State shared by every handle and context of one run.
pub(crate) struct Shared {
    pub(crate) core: Mutex<SchedulerCore>,
    /// Signalled whenever a bridge requests preemption; the idle thread waits on it.
    pub(crate) wakeup: Condvar,
    pub(crate) contexts: ContextTable,
    pub(crate) backend: Arc<dyn FileBackend>,
    pub(crate) config: VmConfig,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    /// Timer bridge, called by the alarm thread.
    pub(crate) fn tick(&self) {
        match self.core.lock() {
            Ok(mut core) => core.advance_tick(),
            Err(_) => return,
        }
        self.wakeup.notify_all();
    }

    /// I/O completion bridge, called by the file backend.
    pub(crate) fn complete_io(&self, ticket: IoTicket, result: i32) {
        match self.core.lock() {
            Ok(mut core) => {
                core.complete_io(ticket, result);
            }
            Err(_) => {
                warn!("completion for {} lost: scheduler lock poisoned", ticket.thread);
                return;
            }
        }
        self.wakeup.notify_all();
    }

    fn core_unchecked(&self) -> MutexGuard<'_, SchedulerCore> {
        match self.core.lock() {
            Ok(core) => core,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Handle to a running virtual machine.
///
/// Cheap to clone; every clone refers to the same machine. A handle is passed
/// to every thread entry.
///
/// # Examples
///
/// ```rust,no_run
/// use tickvm::{ThreadPriority, Timeout, VmBuilder};
///
/// let report = VmBuilder::new().run(|vm| {
///     let worker = vm.thread_create(
///         |vm| {
///             tickvm::vm_print!(vm, "worker {}\n", vm.thread_id()?)?;
///             Ok(())
///         },
///         64 * 1024,
///         ThreadPriority::High,
///     )?;
///     // The worker outranks main and runs to completion right here.
///     vm.thread_activate(worker)?;
///     vm.thread_sleep(Timeout::Ticks(2))?;
///     Ok(())
/// })?;
/// assert!(report.stats.context_switches >= 2);
/// # Ok::<(), tickvm::Error>(())
/// ```
#[derive(Clone)]
pub struct Vm {
    shared: Arc<Shared>,
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("config", &self.shared.config)
            .field("shutdown", &self.shared.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Vm {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Configuration of this run.
    #[must_use]
    pub fn config(&self) -> &VmConfig {
        &self.shared.config
    }

    /// Tick interval in milliseconds.
    #[must_use]
    pub fn tick_ms(&self) -> u32 {
        self.shared.config.tick_ms
    }

    /// Number of timer ticks since start.
    pub fn tick_count(&self) -> Result<Tick> {
        self.preemption_point()?;
        Ok(lock!(self.shared.core).ticks())
    }

    /// Snapshot of the run statistics.
    pub fn stats(&self) -> Result<VmStats> {
        Ok(lock!(self.shared.core).stats())
    }

    // --------------------------------------------------------------------------------------------
    // Threads
    // --------------------------------------------------------------------------------------------

    /// Creates a thread in the [`ThreadState::Dead`] state.
    ///
    /// The entry runs each time the thread is activated; the thread terminates
    /// when it returns. An error returned by the entry is logged.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] for a zero stack size or [`ThreadPriority::None`]
    /// - [`Error::InsufficientResources`] if the thread limit or stack budget is exhausted
    pub fn thread_create<F>(
        &self,
        entry: F,
        stack_size: usize,
        priority: ThreadPriority,
    ) -> Result<ThreadId>
    where
        F: Fn(&Vm) -> Result<()> + Send + Sync + 'static,
    {
        self.preemption_point()?;
        let entry: ThreadEntry = Arc::new(entry);
        lock!(self.shared.core).create(entry, stack_size, priority)
    }

    /// Deletes a dead thread.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] for unknown ids, [`Error::InvalidState`] unless dead.
    pub fn thread_delete(&self, id: ThreadId) -> Result<()> {
        self.preemption_point()?;
        let mut core = lock!(self.shared.core);
        core.delete(id)?;
        self.shared.contexts.remove(id)
    }

    /// Activates a dead thread with a fresh execution context.
    ///
    /// If the thread outranks the caller it runs before this call returns.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidId`] for unknown ids
    /// - [`Error::InvalidState`] unless the thread is dead; the main thread
    ///   ends the run when it terminates and can never be activated again
    /// - [`Error::InsufficientResources`] if the context cannot be created
    pub fn thread_activate(&self, id: ThreadId) -> Result<()> {
        self.preemption_point()?;
        let switch = {
            let mut core = lock!(self.shared.core);
            if self.shared.shutdown.load(Ordering::Acquire) {
                drop(core);
                retire_current();
            }

            let tcb = core.thread(id)?;
            if id == ThreadId::MAIN || !tcb.state().is_dead() {
                return Err(Error::InvalidState);
            }
            let entry = tcb.entry().clone();
            let vm = self.clone();
            self.shared
                .contexts
                .create(id, tcb.stack().size(), move || trampoline(&vm, id, &entry))?;

            match core.activate(id) {
                Ok(switch) => switch,
                Err(error) => {
                    self.shared.contexts.remove(id)?;
                    return Err(error);
                }
            }
        };
        self.perform(switch)
    }

    /// Terminates a thread.
    ///
    /// Terminating the calling thread does not return: its stack unwinds and
    /// the next thread is dispatched.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] for unknown ids, [`Error::InvalidState`] if the
    /// thread is already dead or is the idle thread.
    pub fn thread_terminate(&self, id: ThreadId) -> Result<()> {
        self.preemption_point()?;
        let switch = {
            let mut core = lock!(self.shared.core);
            if id == core.current() {
                drop(core);
                panic::resume_unwind(Box::new(Exit));
            }
            let switch = core.terminate(id)?;
            self.shared.contexts.retire(id)?;
            switch
        };
        self.perform(switch)
    }

    /// Identifier of the calling thread.
    pub fn thread_id(&self) -> Result<ThreadId> {
        self.preemption_point()?;
        Ok(lock!(self.shared.core).current())
    }

    /// State of a thread.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] for unknown ids.
    pub fn thread_state(&self, id: ThreadId) -> Result<ThreadState> {
        self.preemption_point()?;
        lock!(self.shared.core).thread_state(id)
    }

    /// Suspends the calling thread.
    ///
    /// [`Timeout::Immediate`] yields to the next ready thread of the same
    /// priority, if there is one. [`Timeout::Ticks`] blocks for that many ticks.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for [`Timeout::Infinite`].
    pub fn thread_sleep(&self, timeout: Timeout) -> Result<()> {
        self.preemption_point()?;
        let switch = lock!(self.shared.core).sleep(timeout)?;
        self.perform(switch)
    }

    /// Delivers a pending preemption to the calling thread.
    ///
    /// Every other operation does this implicitly. Long running computations
    /// call it to let the tick rotate threads of equal priority.
    pub fn preemption_point(&self) -> Result<()> {
        self.check_shutdown();
        let switch = lock!(self.shared.core).take_preemption();
        self.perform(switch)
    }

    // --------------------------------------------------------------------------------------------
    // Files
    // --------------------------------------------------------------------------------------------

    /// Opens a file; returns its descriptor.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for an empty path, [`Error::Failure`] if
    /// the backend reports an error.
    pub fn file_open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<i32> {
        if path.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let op = FileOp::Open {
            path: path.to_string(),
            flags,
            mode,
        };
        Ok(self.file_request(op)?.result)
    }

    /// Closes a descriptor.
    ///
    /// # Errors
    ///
    /// [`Error::Failure`] if the backend reports an error.
    pub fn file_close(&self, fd: i32) -> Result<()> {
        self.file_request(FileOp::Close { fd })?;
        Ok(())
    }

    /// Reads into `buffer`; returns the number of bytes read, `0` at end of file.
    ///
    /// # Errors
    ///
    /// [`Error::Failure`] if the backend reports an error.
    pub fn file_read(&self, fd: i32, buffer: &mut [u8]) -> Result<usize> {
        let outcome = self.file_request(FileOp::Read {
            fd,
            len: buffer.len(),
        })?;
        let count = outcome.data.len().min(buffer.len());
        buffer[..count].copy_from_slice(&outcome.data[..count]);
        Ok(count)
    }

    /// Writes `data`; returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// [`Error::Failure`] if the backend reports an error.
    pub fn file_write(&self, fd: i32, data: &[u8]) -> Result<usize> {
        let outcome = self.file_request(FileOp::Write {
            fd,
            data: data.to_vec(),
        })?;
        usize::try_from(outcome.result).map_err(|_| Error::Failure)
    }

    /// Moves the offset of a descriptor; returns the new offset.
    ///
    /// # Errors
    ///
    /// [`Error::Failure`] if the backend reports an error.
    pub fn file_seek(&self, fd: i32, offset: i32, whence: Whence) -> Result<i32> {
        Ok(self.file_request(FileOp::Seek { fd, offset, whence })?.result)
    }

    /// Writes formatted text to a descriptor.
    ///
    /// Usually invoked through [`crate::vm_print!`] and [`crate::vm_print_error!`].
    ///
    /// # Errors
    ///
    /// [`Error::Failure`] if the backend reports an error or a short write.
    pub fn file_print(&self, fd: i32, args: fmt::Arguments<'_>) -> Result<()> {
        let text = fmt::format(args);
        let written = self.file_write(fd, text.as_bytes())?;
        if written != text.len() {
            return Err(Error::Failure);
        }
        Ok(())
    }

    /// Blocks the calling thread on one backend operation.
    fn file_request(&self, op: FileOp) -> Result<IoOutcome> {
        self.preemption_point()?;

        let payload: Arc<Mutex<Vec<u8>>> = Arc::default();
        let request = lock!(self.shared.core).begin_io();

        let bridge = Arc::downgrade(&self.shared);
        let slot = payload.clone();
        let completion = IoCompletion::new(move |outcome: IoOutcome| {
            if let Ok(mut slot) = slot.lock() {
                *slot = outcome.data;
            }
            if let Some(shared) = bridge.upgrade() {
                shared.complete_io(request.ticket, outcome.result);
            }
        });
        self.shared.backend.submit(op, completion);
        self.perform(Some(request.switch))?;

        let result = lock!(self.shared.core)
            .take_io_result(request.ticket.thread)
            .unwrap_or(IO_FAILURE);
        if result < 0 {
            return Err(Error::Failure);
        }
        let data = std::mem::take(&mut *lock!(payload));
        Ok(IoOutcome { result, data })
    }

    // --------------------------------------------------------------------------------------------
    // Mutexes
    // --------------------------------------------------------------------------------------------

    /// Creates an unlocked mutex.
    pub fn mutex_create(&self) -> Result<MutexId> {
        self.preemption_point()?;
        Ok(lock!(self.shared.core).mutex_create())
    }

    /// Deletes an unlocked mutex.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] for unknown ids, [`Error::InvalidState`] if locked.
    pub fn mutex_delete(&self, id: MutexId) -> Result<()> {
        self.preemption_point()?;
        lock!(self.shared.core).mutex_delete(id)
    }

    /// Owner of a mutex, [`ThreadId::INVALID`] when unlocked.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] for unknown ids.
    pub fn mutex_query(&self, id: MutexId) -> Result<ThreadId> {
        self.preemption_point()?;
        lock!(self.shared.core).mutex_query(id)
    }

    /// Acquires a mutex, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidId`] for unknown ids
    /// - [`Error::InvalidState`] if the caller already owns the mutex and
    ///   `timeout` would make it wait
    /// - [`Error::Failure`] if the mutex is locked (by anyone, the caller
    ///   included) and `timeout` is [`Timeout::Immediate`], or the wait expired
    pub fn mutex_acquire(&self, id: MutexId, timeout: Timeout) -> Result<()> {
        self.preemption_point()?;
        let outcome = lock!(self.shared.core).mutex_acquire(id, timeout)?;
        match outcome {
            AcquireOutcome::Acquired => Ok(()),
            AcquireOutcome::Blocked(switch) => {
                self.perform(Some(switch))?;
                lock!(self.shared.core).mutex_acquire_result(id)
            }
        }
    }

    /// Releases a mutex held by the caller, handing it to the next waiter.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] for unknown ids, [`Error::InvalidState`] if the
    /// caller does not own the mutex.
    pub fn mutex_release(&self, id: MutexId) -> Result<()> {
        self.preemption_point()?;
        let switch = lock!(self.shared.core).mutex_release(id)?;
        self.perform(switch)
    }

    // --------------------------------------------------------------------------------------------
    // Context switching
    // --------------------------------------------------------------------------------------------

    /// Carries out a switch decided by the core. Returns once the caller runs again.
    fn perform(&self, switch: Option<Switch>) -> Result<()> {
        let Some(switch) = switch else {
            return Ok(());
        };
        match self.shared.contexts.switch(switch)? {
            Wake::Resumed => {
                self.check_shutdown();
                Ok(())
            }
            Wake::Retired => retire_current(),
        }
    }

    fn check_shutdown(&self) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            retire_current();
        }
    }

    /// Terminates the calling thread after its entry returned and passes the baton on.
    fn exit_current(&self, id: ThreadId) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let terminated = match self.shared.core.lock() {
            Ok(mut core) => core.terminate(id),
            Err(_) => {
                error!("scheduler lock poisoned, {id} cannot exit");
                return;
            }
        };
        match terminated {
            Ok(Some(switch)) => {
                debug!("{id} exited");
                if let Err(error) = self.shared.contexts.hand_off(switch.to) {
                    error!("{id} failed to hand off to {}: {error}", switch.to);
                }
            }
            Ok(None) => {}
            Err(error) => warn!("{id} could not terminate: {error}"),
        }
    }

    /// Stops the run: retires every context and joins their OS threads.
    pub(crate) fn shutdown(&self) {
        {
            let _core = self.shared.core_unchecked();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.wakeup.notify_all();

        if let Err(error) = self.shared.contexts.retire_all() {
            warn!("failed to retire contexts: {error}");
        }
        if let Err(error) = self.shared.contexts.join_all() {
            warn!("failed to join contexts: {error}");
        }
        self.shared.backend.shutdown();
    }

    pub(crate) fn final_stats(&self) -> VmStats {
        self.shared.core_unchecked().stats()
    }
}

/// Body of every context: runs the entry, then terminates the thread.
pub(crate) fn trampoline(vm: &Vm, id: ThreadId, entry: &ThreadEntry) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry(vm)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!("{id} returned an error: {error}"),
        Err(payload) if payload.is::<Retired>() => return,
        Err(payload) if payload.is::<Exit>() => {}
        Err(payload) => error!("{id} panicked: {}", panic_message(payload.as_ref())),
    }
    vm.exit_current(id);
}

/// Entry of the idle thread.
///
/// Sleeps on the wakeup condition until a bridge requests preemption, then
/// lets the scheduler pick the next thread.
pub(crate) fn idle(vm: &Vm) -> Result<()> {
    loop {
        let switch = {
            let mut core = lock!(vm.shared.core);
            while !core.preemption_pending() && !vm.shared.shutdown.load(Ordering::Acquire) {
                core = vm.shared.wakeup.wait(core)?;
            }
            core.take_preemption()
        };
        vm.perform(switch)?;
        vm.check_shutdown();
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
