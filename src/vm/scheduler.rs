//! Scheduler core: dispatcher, selection policy, timer and I/O bridges.
//!
//! [`SchedulerCore`] owns every piece of shared scheduler state (the thread
//! table, ready queues, sleeping set, mutex table and stack arena) and exposes
//! the virtual machine operations as plain state transitions. It never runs a
//! thread itself: operations that move the CPU to another thread return a
//! [`Switch`] record which the runtime carries out with the context primitive
//! after leaving the critical section.
//!
//! This split keeps the core deterministic. Tests drive it directly, ticking
//! the timer bridge and completing I/O by hand.
//!
//! # Scheduling Algorithm
//!
//! 1. Threads are held in one FIFO per [`ThreadPriority`] level.
//! 2. Full selection scans from [`ThreadPriority::High`] down to
//!    [`ThreadPriority::None`] and dispatches the head of the first non-empty
//!    level. A preempted running thread re-enters at the tail of its level
//!    first, so equal priorities round-robin across ticks.
//! 3. Yield-to-equal selection (sleep with the immediate timeout) only looks at
//!    the caller's own level and keeps the caller running if that level is empty.
//! 4. The idle thread at [`ThreadPriority::None`] is always runnable, so
//!    selection can never come up empty.
//!
//! # Reentry Points
//!
//! - [`SchedulerCore::advance_tick`] (timer bridge): wakes sleepers, expires
//!   mutex waits and requests preemption of the running thread.
//! - [`SchedulerCore::complete_io`] (I/O completion bridge): wakes the
//!   requesting thread and requests preemption if it outranks the running one.
//! - [`SchedulerCore::take_preemption`]: delivers a pending preemption at the
//!   running thread's next scheduler entry.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tickvm::vm::{SchedulerCore, ThreadEntry, ThreadPriority};
//! use tickvm::{ThreadId, Timeout, Vm, VmConfig};
//!
//! let noop: ThreadEntry = Arc::new(|_: &Vm| Ok(()));
//! let mut core = SchedulerCore::new(&VmConfig::default(), noop.clone(), noop.clone())?;
//!
//! let worker = core.create(noop, 64 * 1024, ThreadPriority::High)?;
//! let switch = core.activate(worker)?.expect("high priority preempts main");
//! assert_eq!((switch.from, switch.to), (ThreadId::MAIN, worker));
//!
//! // The worker sleeps for two ticks, main runs again.
//! core.sleep(Timeout::Ticks(2))?;
//! assert_eq!(core.current(), ThreadId::MAIN);
//! # Ok::<(), tickvm::Error>(())
//! ```

use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::{
    vm::{
        config::VmConfig,
        stats::VmStats,
        sync::MutexTable,
        thread::{
            ReadyQueues, StackArena, ThreadControlBlock, ThreadEntry, ThreadPriority,
            ThreadState, ThreadTable, WaitReason,
        },
        types::{MutexId, ThreadId, Tick, Timeout},
    },
    Error, Result,
};

/// A context switch decided inside the critical section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Switch {
    /// Thread that was running.
    pub from: ThreadId,
    /// Thread that runs next.
    pub to: ThreadId,
}

/// Selection policy used by [`SchedulerCore::schedule`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Highest non-empty level, FIFO within the level.
    Full,
    /// Only the running thread's own level; no-op if it is empty.
    YieldEqual,
}

/// Result of a mutex acquisition attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller owns the mutex.
    Acquired,
    /// The caller was queued and must switch away; on resume it checks
    /// [`SchedulerCore::mutex_acquire_result`].
    Blocked(Switch),
}

/// Identifies an outstanding file operation.
///
/// The ticket changes with every request, so a completion that arrives after
/// its thread was terminated (and possibly reactivated) is recognised as stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IoTicket {
    /// Thread blocked on the operation.
    pub thread: ThreadId,
    /// Per-request sequence number.
    pub ticket: u64,
}

/// A blocking file request registered with the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoRequest {
    /// Token the backend completes.
    pub ticket: IoTicket,
    /// Switch away from the requesting thread.
    pub switch: Switch,
}

/// Owned scheduler state of one virtual machine.
#[derive(Debug)]
pub struct SchedulerCore {
    threads: ThreadTable,
    ready: ReadyQueues,
    sleeping: Vec<ThreadId>,
    mutexes: MutexTable,
    stacks: StackArena,
    current: ThreadId,
    ticks: Tick,
    preempt_pending: bool,
    next_ticket: u64,
    max_threads: usize,
    stats: VmStats,
}

impl SchedulerCore {
    /// Creates the scheduler with its idle thread (ready, id 0) and main thread
    /// (running, id 1).
    ///
    /// # Errors
    ///
    /// [`Error::InsufficientResources`] if the configured budget cannot hold the
    /// two initial stacks, [`Error::InvalidParameter`] for zero stack sizes.
    pub fn new(config: &VmConfig, idle: ThreadEntry, main: ThreadEntry) -> Result<Self> {
        let mut core = Self {
            threads: ThreadTable::new(),
            ready: ReadyQueues::new(),
            sleeping: Vec::new(),
            mutexes: MutexTable::new(),
            stacks: StackArena::new(config.stack_budget),
            current: ThreadId::MAIN,
            ticks: 0,
            preempt_pending: false,
            next_ticket: 0,
            max_threads: config.max_threads,
            stats: VmStats::new(),
        };

        let idle = core.insert_thread(idle, config.idle_stack_size, ThreadPriority::None)?;
        let main = core.insert_thread(main, config.main_stack_size, ThreadPriority::Normal)?;
        debug_assert_eq!((idle, main), (ThreadId::IDLE, ThreadId::MAIN));

        let tcb = core.threads.get_mut(idle)?;
        tcb.record_activation();
        tcb.set_state(ThreadState::Ready);
        core.ready.push(idle, ThreadPriority::None);

        let tcb = core.threads.get_mut(main)?;
        tcb.record_activation();
        tcb.set_state(ThreadState::Running);
        core.current = main;

        Ok(core)
    }

    fn insert_thread(
        &mut self,
        entry: ThreadEntry,
        stack_size: usize,
        priority: ThreadPriority,
    ) -> Result<ThreadId> {
        if self.threads.len() >= self.max_threads {
            return Err(Error::InsufficientResources);
        }
        let id = self.threads.next_id();
        let stack = self.stacks.reserve(id, stack_size)?;
        self.threads
            .insert(ThreadControlBlock::new(id, entry, stack, priority));
        self.stats.threads_created += 1;
        Ok(id)
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    /// Returns the running thread.
    #[must_use]
    pub fn current(&self) -> ThreadId {
        self.current
    }

    /// Returns the global tick counter.
    #[must_use]
    pub fn ticks(&self) -> Tick {
        self.ticks
    }

    /// Returns the run statistics.
    #[must_use]
    pub fn stats(&self) -> VmStats {
        self.stats
    }

    /// Returns the state of a thread.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] if `id` does not name a live thread.
    pub fn thread_state(&self, id: ThreadId) -> Result<ThreadState> {
        Ok(self.threads.get(id)?.state())
    }

    /// Returns the control block of a thread.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] if `id` does not name a live thread.
    pub fn thread(&self, id: ThreadId) -> Result<&ThreadControlBlock> {
        self.threads.get(id)
    }

    /// Returns the ready queue set.
    #[must_use]
    pub fn ready_queues(&self) -> &ReadyQueues {
        &self.ready
    }

    /// Returns the threads currently in a timed sleep.
    #[must_use]
    pub fn sleeping(&self) -> &[ThreadId] {
        &self.sleeping
    }

    /// Returns the mutex table.
    #[must_use]
    pub fn mutexes(&self) -> &MutexTable {
        &self.mutexes
    }

    /// Returns the stack arena.
    #[must_use]
    pub fn stacks(&self) -> &StackArena {
        &self.stacks
    }

    /// Returns `true` if a preemption waits to be delivered.
    #[must_use]
    pub fn preemption_pending(&self) -> bool {
        self.preempt_pending
    }

    fn current_priority(&self) -> ThreadPriority {
        self.threads
            .get(self.current)
            .map_or(ThreadPriority::None, ThreadControlBlock::priority)
    }

    // --------------------------------------------------------------------------------------------
    // Thread lifecycle
    // --------------------------------------------------------------------------------------------

    /// Creates a thread in the [`ThreadState::Dead`] state.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] for a zero `stack_size` or the idle-only priority
    /// - [`Error::InsufficientResources`] if the thread limit or stack budget is exhausted
    pub fn create(
        &mut self,
        entry: ThreadEntry,
        stack_size: usize,
        priority: ThreadPriority,
    ) -> Result<ThreadId> {
        if priority == ThreadPriority::None {
            return Err(Error::InvalidParameter);
        }
        let id = self.insert_thread(entry, stack_size, priority)?;
        debug!("created {id} at priority {priority} with {stack_size} byte stack");
        Ok(id)
    }

    /// Deletes a dead thread and releases its stack.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidId`] if `id` does not name a live thread
    /// - [`Error::InvalidState`] unless the thread is dead, or for the idle thread
    pub fn delete(&mut self, id: ThreadId) -> Result<()> {
        let tcb = self.threads.get(id)?;
        if id == ThreadId::IDLE || !tcb.state().is_dead() {
            return Err(Error::InvalidState);
        }
        self.threads.remove(id)?;
        self.stacks.release(id);
        debug!("deleted {id}");
        Ok(())
    }

    /// Makes a dead thread ready.
    ///
    /// Preempts the running thread if the activated one has a higher priority.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidId`] if `id` does not name a live thread
    /// - [`Error::InvalidState`] unless the thread is dead
    pub fn activate(&mut self, id: ThreadId) -> Result<Option<Switch>> {
        let tcb = self.threads.get_mut(id)?;
        if !tcb.state().is_dead() {
            return Err(Error::InvalidState);
        }
        tcb.record_activation();
        tcb.set_state(ThreadState::Ready);
        let priority = tcb.priority();
        self.ready.push(id, priority);
        debug!("activated {id}");

        if priority > self.current_priority() {
            Ok(self.preempt_current())
        } else {
            Ok(None)
        }
    }

    /// Terminates a thread.
    ///
    /// The thread leaves whichever queue holds it. Mutexes it owns pass to their
    /// next waiter. Terminating the running thread always yields a switch.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidId`] if `id` does not name a live thread
    /// - [`Error::InvalidState`] if the thread is already dead, or for the idle thread
    pub fn terminate(&mut self, id: ThreadId) -> Result<Option<Switch>> {
        let state = self.threads.get(id)?.state();
        if id == ThreadId::IDLE || state.is_dead() {
            return Err(Error::InvalidState);
        }

        match state {
            ThreadState::Ready => {
                self.ready.remove(id);
            }
            ThreadState::Waiting(WaitReason::Sleep) => self.sleeping.retain(|t| *t != id),
            ThreadState::Waiting(WaitReason::Mutex(mutex)) => {
                if let Ok(mutex) = self.mutexes.get_mut(mutex) {
                    mutex.remove_waiter(id);
                }
            }
            ThreadState::Waiting(WaitReason::Io { .. })
            | ThreadState::Running
            | ThreadState::Dead => {}
        }

        let tcb = self.threads.get_mut(id)?;
        tcb.set_state(ThreadState::Dead);
        tcb.mutex_wait = None;
        tcb.io_result = None;
        debug!("terminated {id}");

        let mut outranked = false;
        for mutex in self.mutexes.owned_by(id) {
            let next = self.mutexes.get_mut(mutex)?.abandon();
            if let Some(next) = next {
                debug!("{mutex} abandoned by {id}, granted to {next}");
                outranked |= self.grant(next)?;
            }
        }

        if id == self.current {
            return Ok(Some(self.switch_away()));
        }
        if outranked {
            return Ok(self.preempt_current());
        }
        Ok(None)
    }

    /// Puts the running thread to sleep.
    ///
    /// - [`Timeout::Immediate`] yields to the next thread of equal priority, if any
    /// - [`Timeout::Ticks`] blocks for that many timer ticks
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for [`Timeout::Infinite`].
    pub fn sleep(&mut self, timeout: Timeout) -> Result<Option<Switch>> {
        match timeout {
            Timeout::Infinite => Err(Error::InvalidParameter),
            Timeout::Immediate => Ok(self.schedule(ScheduleMode::YieldEqual)),
            Timeout::Ticks(ticks) => {
                let current = self.current;
                self.threads.get_mut(current)?.sleep_countdown = ticks;
                self.sleeping.push(current);
                Ok(Some(self.block_current(WaitReason::Sleep)))
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Dispatcher and selection
    // --------------------------------------------------------------------------------------------

    /// Selects the next thread according to `mode` and dispatches it.
    ///
    /// A running thread is moved back to `Ready` before selection, so it is
    /// requeued behind its equal-priority peers and resumes only if selected
    /// again. A thread already moved out of `Running` is left where it is.
    pub fn schedule(&mut self, mode: ScheduleMode) -> Option<Switch> {
        match mode {
            ScheduleMode::Full => {
                self.mark_current_ready();
                self.requeue_current();
                let next = self.pop_next();
                self.dispatch(next)
            }
            ScheduleMode::YieldEqual => {
                let next = self.ready.pop_level(self.current_priority())?;
                self.mark_current_ready();
                self.requeue_current();
                self.dispatch(next)
            }
        }
    }

    /// Re-enqueues the running thread if it was marked ready.
    fn requeue_current(&mut self) {
        let current = self.current;
        if let Ok(tcb) = self.threads.get(current) {
            if tcb.state() == ThreadState::Ready {
                debug_assert!(!self.ready.contains(current));
                self.ready.push(current, tcb.priority());
            }
        }
    }

    fn mark_current_ready(&mut self) {
        if let Ok(tcb) = self.threads.get_mut(self.current) {
            if tcb.state() == ThreadState::Running {
                tcb.set_state(ThreadState::Ready);
            }
        }
    }

    fn pop_next(&mut self) -> ThreadId {
        match self.ready.pop_highest() {
            Some(next) => next,
            None => panic!("ready queue set is empty: the idle thread must always be runnable"),
        }
    }

    /// Marks `next` running and records the switch from the previous thread.
    fn dispatch(&mut self, next: ThreadId) -> Option<Switch> {
        let prev = self.current;
        if let Ok(tcb) = self.threads.get_mut(next) {
            tcb.set_state(ThreadState::Running);
        }
        self.current = next;
        if prev == next {
            return None;
        }
        self.stats.context_switches += 1;
        debug!("dispatch {prev} -> {next}");
        Some(Switch {
            from: prev,
            to: next,
        })
    }

    /// Dispatches the best ready thread; the running thread is not a candidate.
    fn switch_away(&mut self) -> Switch {
        let from = self.current;
        let next = self.pop_next();
        self.dispatch(next).unwrap_or(Switch { from, to: from })
    }

    fn block_current(&mut self, reason: WaitReason) -> Switch {
        if let Ok(tcb) = self.threads.get_mut(self.current) {
            tcb.set_state(ThreadState::Waiting(reason));
        }
        self.switch_away()
    }

    fn preempt_current(&mut self) -> Option<Switch> {
        self.schedule(ScheduleMode::Full)
    }

    /// Makes a woken mutex owner ready; returns `true` if it outranks the running thread.
    fn grant(&mut self, next: ThreadId) -> Result<bool> {
        let tcb = self.threads.get_mut(next)?;
        tcb.mutex_wait = None;
        tcb.set_state(ThreadState::Ready);
        let priority = tcb.priority();
        self.ready.push(next, priority);
        Ok(priority > self.current_priority())
    }

    // --------------------------------------------------------------------------------------------
    // Timer bridge
    // --------------------------------------------------------------------------------------------

    /// Processes one timer tick.
    ///
    /// Increments the tick counter, wakes sleepers whose countdown reaches zero,
    /// expires finite mutex waits and requests preemption of the running thread.
    /// The preemption itself is delivered by [`SchedulerCore::take_preemption`].
    pub fn advance_tick(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
        self.stats.ticks += 1;
        trace!("tick {}", self.ticks);

        for id in std::mem::take(&mut self.sleeping) {
            let Ok(tcb) = self.threads.get_mut(id) else {
                continue;
            };
            tcb.sleep_countdown = tcb.sleep_countdown.saturating_sub(1);
            if tcb.sleep_countdown == 0 {
                tcb.set_state(ThreadState::Ready);
                let priority = tcb.priority();
                self.ready.push(id, priority);
                trace!("{id} woke from sleep");
            } else {
                self.sleeping.push(id);
            }
        }

        let mut expired = Vec::new();
        for tcb in self.threads.iter_mut() {
            if let ThreadState::Waiting(WaitReason::Mutex(mutex)) = tcb.state() {
                if let Some(remaining) = tcb.mutex_wait.as_mut() {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        expired.push((tcb.id(), mutex));
                    }
                }
            }
        }
        for (id, mutex) in expired {
            if let Ok(state) = self.mutexes.get_mut(mutex) {
                state.remove_waiter(id);
            }
            if let Ok(tcb) = self.threads.get_mut(id) {
                tcb.mutex_wait = None;
                tcb.set_state(ThreadState::Ready);
                let priority = tcb.priority();
                self.ready.push(id, priority);
            }
            self.stats.mutex_timeouts += 1;
            debug!("{id} timed out waiting for {mutex}");
        }

        let running = self
            .threads
            .get(self.current)
            .is_ok_and(|tcb| !tcb.state().is_dead());
        if running {
            self.preempt_pending = true;
        }
    }

    /// Delivers a pending preemption to the running thread.
    ///
    /// The running thread re-enters the tail of its ready level and full
    /// selection runs. Returns `None` if nothing was pending or the running
    /// thread was selected again.
    pub fn take_preemption(&mut self) -> Option<Switch> {
        if !std::mem::take(&mut self.preempt_pending) {
            return None;
        }
        self.stats.preemptions += 1;
        self.preempt_current()
    }

    /// One complete timer bridge invocation: [`advance_tick`](Self::advance_tick)
    /// followed by [`take_preemption`](Self::take_preemption).
    pub fn timer_tick(&mut self) -> Option<Switch> {
        self.advance_tick();
        self.take_preemption()
    }

    // --------------------------------------------------------------------------------------------
    // I/O completion bridge
    // --------------------------------------------------------------------------------------------

    /// Blocks the running thread on a new file request.
    pub fn begin_io(&mut self) -> IoRequest {
        let ticket = IoTicket {
            thread: self.current,
            ticket: self.next_ticket,
        };
        self.next_ticket += 1;
        if let Ok(tcb) = self.threads.get_mut(ticket.thread) {
            tcb.io_result = None;
        }
        let switch = self.block_current(WaitReason::Io {
            ticket: ticket.ticket,
        });
        IoRequest { ticket, switch }
    }

    /// Completes a file request.
    ///
    /// Stores `result` in the thread's result slot and makes it ready. If it
    /// outranks the running thread a preemption is requested. Returns `false`
    /// for stale tickets, which are otherwise ignored.
    pub fn complete_io(&mut self, ticket: IoTicket, result: i32) -> bool {
        let Ok(tcb) = self.threads.get_mut(ticket.thread) else {
            warn!("completion for deleted {} dropped", ticket.thread);
            return false;
        };
        let expected = ThreadState::Waiting(WaitReason::Io {
            ticket: ticket.ticket,
        });
        if tcb.state() != expected {
            warn!(
                "stale completion #{} for {} dropped",
                ticket.ticket, ticket.thread
            );
            return false;
        }

        tcb.io_result = Some(result);
        tcb.set_state(ThreadState::Ready);
        let priority = tcb.priority();
        self.ready.push(ticket.thread, priority);
        self.stats.io_completions += 1;

        if priority > self.current_priority() {
            self.preempt_pending = true;
        }
        true
    }

    /// Takes the result of the last completed file request of `id`.
    pub fn take_io_result(&mut self, id: ThreadId) -> Option<i32> {
        self.threads.get_mut(id).ok()?.io_result.take()
    }

    // --------------------------------------------------------------------------------------------
    // Mutex subsystem
    // --------------------------------------------------------------------------------------------

    /// Creates an unlocked mutex.
    pub fn mutex_create(&mut self) -> MutexId {
        let id = self.mutexes.create();
        debug!("created {id}");
        id
    }

    /// Deletes an unlocked mutex.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] for unknown ids, [`Error::InvalidState`] if locked.
    pub fn mutex_delete(&mut self, id: MutexId) -> Result<()> {
        self.mutexes.delete(id)
    }

    /// Returns the owner of a mutex, [`ThreadId::INVALID`] when unlocked.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] for unknown ids.
    pub fn mutex_query(&self, id: MutexId) -> Result<ThreadId> {
        Ok(self.mutexes.get(id)?.owner())
    }

    /// Attempts to acquire a mutex for the running thread.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidId`] for unknown ids
    /// - [`Error::Failure`] for [`Timeout::Immediate`] when the mutex is locked,
    ///   including by the caller itself
    /// - [`Error::InvalidState`] if the caller already owns the mutex and
    ///   would otherwise wait on itself
    pub fn mutex_acquire(&mut self, id: MutexId, timeout: Timeout) -> Result<AcquireOutcome> {
        let current = self.current;
        let priority = self.current_priority();
        let mutex = self.mutexes.get_mut(id)?;

        if mutex.is_owner(current) {
            return match timeout {
                Timeout::Immediate => Err(Error::Failure),
                _ => Err(Error::InvalidState),
            };
        }
        if mutex.try_acquire(current) {
            return Ok(AcquireOutcome::Acquired);
        }

        let wait = match timeout {
            Timeout::Immediate => return Err(Error::Failure),
            Timeout::Infinite => None,
            Timeout::Ticks(ticks) => Some(ticks),
        };
        mutex.enqueue_waiter(current, priority);
        self.threads.get_mut(current)?.mutex_wait = wait;
        debug!("{current} waits for {id}");
        Ok(AcquireOutcome::Blocked(
            self.block_current(WaitReason::Mutex(id)),
        ))
    }

    /// Outcome of a blocked acquisition, checked by the caller once it runs again.
    ///
    /// # Errors
    ///
    /// [`Error::Failure`] if the wait expired without ownership being granted.
    pub fn mutex_acquire_result(&self, id: MutexId) -> Result<()> {
        if self.mutexes.get(id)?.is_owner(self.current) {
            Ok(())
        } else {
            Err(Error::Failure)
        }
    }

    /// Releases a mutex held by the running thread.
    ///
    /// Ownership passes atomically to the highest-priority, longest-waiting
    /// waiter, which becomes ready and preempts the caller if it outranks it.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] for unknown ids, [`Error::InvalidState`] if the
    /// caller does not own the mutex.
    pub fn mutex_release(&mut self, id: MutexId) -> Result<Option<Switch>> {
        let current = self.current;
        let next = self.mutexes.get_mut(id)?.release(current)?;
        if let Some(next) = next {
            debug!("{id} handed from {current} to {next}");
            if self.grant(next)? {
                return Ok(self.preempt_current());
            }
        }
        Ok(None)
    }

    // --------------------------------------------------------------------------------------------
    // Invariants
    // --------------------------------------------------------------------------------------------

    /// Checks the partition invariant.
    ///
    /// Every non-dead thread must be in exactly one of: a ready queue, the
    /// sleeping set, one mutex wait queue, the I/O waiting set, or running. At
    /// most one thread is running and it is the current thread.
    ///
    /// # Errors
    ///
    /// A descriptive [`Error::Error`] naming the first violation found.
    pub fn verify(&self) -> Result<()> {
        let mut seen: HashMap<ThreadId, &'static str> = HashMap::new();
        let mut place = |id: ThreadId, location: &'static str| -> Result<()> {
            match seen.insert(id, location) {
                Some(previous) => Err(failure!("{} is both {} and {}", id, previous, location)),
                None => Ok(()),
            }
        };

        let running: Vec<ThreadId> = self
            .threads
            .iter()
            .filter(|tcb| tcb.state() == ThreadState::Running)
            .map(ThreadControlBlock::id)
            .collect();
        if running != [self.current] {
            return Err(failure!(
                "running threads {:?} do not match current {}",
                running,
                self.current
            ));
        }
        place(self.current, "running")?;

        for id in self.ready.iter() {
            place(id, "ready")?;
            if self.threads.get(id)?.state() != ThreadState::Ready {
                return Err(failure!("{} is queued but not ready", id));
            }
        }
        for id in &self.sleeping {
            place(*id, "sleeping")?;
            if self.threads.get(*id)?.state() != ThreadState::Waiting(WaitReason::Sleep) {
                return Err(failure!("{} is in the sleeping set but not sleeping", id));
            }
        }
        for (mutex, state) in self.mutexes.iter() {
            for id in state.waiters() {
                place(id, "waiting for a mutex")?;
                if self.threads.get(id)?.state() != ThreadState::Waiting(WaitReason::Mutex(mutex)) {
                    return Err(failure!("{} is queued on {} but not waiting for it", id, mutex));
                }
            }
        }
        for tcb in self.threads.iter() {
            if let ThreadState::Waiting(WaitReason::Io { .. }) = tcb.state() {
                place(tcb.id(), "waiting for I/O")?;
            }
        }

        for tcb in self.threads.iter() {
            let placed = seen.contains_key(&tcb.id());
            if tcb.state().is_dead() == placed {
                return Err(failure!(
                    "{} in state {:?} is {}",
                    tcb.id(),
                    tcb.state(),
                    if placed { "still queued" } else { "lost" }
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::Vm;

    const STACK: usize = 64 * 1024;

    fn noop() -> ThreadEntry {
        Arc::new(|_: &Vm| Ok(()))
    }

    fn new_core() -> SchedulerCore {
        SchedulerCore::new(&VmConfig::default(), noop(), noop()).unwrap()
    }

    fn spawn(core: &mut SchedulerCore, priority: ThreadPriority) -> ThreadId {
        let id = core.create(noop(), STACK, priority).unwrap();
        core.activate(id).unwrap();
        id
    }

    #[test]
    fn test_initial_state() {
        let core = new_core();
        assert_eq!(core.current(), ThreadId::MAIN);
        assert_eq!(core.thread_state(ThreadId::MAIN).unwrap(), ThreadState::Running);
        assert_eq!(core.thread_state(ThreadId::IDLE).unwrap(), ThreadState::Ready);
        assert_eq!(core.ticks(), 0);
        assert_eq!(core.stats().threads_created, 2);
        core.verify().unwrap();
    }

    #[test]
    fn test_create_validation() {
        let mut core = new_core();
        assert!(matches!(
            core.create(noop(), STACK, ThreadPriority::None),
            Err(Error::InvalidParameter)
        ));
        assert!(matches!(
            core.create(noop(), 0, ThreadPriority::Low),
            Err(Error::InvalidParameter)
        ));

        let id = core.create(noop(), STACK, ThreadPriority::Low).unwrap();
        assert_eq!(id, ThreadId(2));
        assert_eq!(core.thread_state(id).unwrap(), ThreadState::Dead);
        core.verify().unwrap();
    }

    #[test]
    fn test_thread_limit() {
        let config = VmConfig::default().with_max_threads(3);
        let mut core = SchedulerCore::new(&config, noop(), noop()).unwrap();
        core.create(noop(), STACK, ThreadPriority::Low).unwrap();
        assert!(matches!(
            core.create(noop(), STACK, ThreadPriority::Low),
            Err(Error::InsufficientResources)
        ));
    }

    #[test]
    fn test_ids_never_reused() {
        let mut core = new_core();
        let a = core.create(noop(), STACK, ThreadPriority::Low).unwrap();
        core.delete(a).unwrap();
        let b = core.create(noop(), STACK, ThreadPriority::Low).unwrap();
        assert_ne!(a, b);
        assert!(matches!(core.thread_state(a), Err(Error::InvalidId)));
    }

    #[test]
    fn test_delete_rules() {
        let mut core = new_core();
        assert!(matches!(core.delete(ThreadId(42)), Err(Error::InvalidId)));
        assert!(matches!(core.delete(ThreadId::IDLE), Err(Error::InvalidState)));
        assert!(matches!(core.delete(ThreadId::MAIN), Err(Error::InvalidState)));

        let id = spawn(&mut core, ThreadPriority::Low);
        assert!(matches!(core.delete(id), Err(Error::InvalidState)));
        core.terminate(id).unwrap();
        core.delete(id).unwrap();
        assert_eq!(core.stacks().region(id), None);
    }

    #[test]
    fn test_activate_rules() {
        let mut core = new_core();
        assert!(matches!(core.activate(ThreadId(9)), Err(Error::InvalidId)));
        let id = spawn(&mut core, ThreadPriority::Low);
        assert!(matches!(core.activate(id), Err(Error::InvalidState)));
        assert!(matches!(core.activate(ThreadId::MAIN), Err(Error::InvalidState)));
        core.verify().unwrap();
    }

    #[test]
    fn test_lower_priority_activation_does_not_preempt() {
        let mut core = new_core();
        let id = core.create(noop(), STACK, ThreadPriority::Low).unwrap();
        assert_eq!(core.activate(id).unwrap(), None);
        assert_eq!(core.current(), ThreadId::MAIN);
        assert_eq!(core.thread_state(id).unwrap(), ThreadState::Ready);
    }

    #[test]
    fn test_higher_priority_activation_preempts() {
        let mut core = new_core();
        let id = core.create(noop(), STACK, ThreadPriority::High).unwrap();
        let switch = core.activate(id).unwrap().unwrap();
        assert_eq!(switch, Switch { from: ThreadId::MAIN, to: id });
        assert_eq!(core.thread_state(ThreadId::MAIN).unwrap(), ThreadState::Ready);
        core.verify().unwrap();
    }

    #[test]
    fn test_dispatch_order_by_priority() {
        let mut core = new_core();
        let low = spawn(&mut core, ThreadPriority::Low);
        let normal = spawn(&mut core, ThreadPriority::Normal);
        // Dispatched immediately, it outranks main.
        let high = core.create(noop(), STACK, ThreadPriority::High).unwrap();
        core.activate(high).unwrap();
        assert_eq!(core.current(), high);

        // Each thread in turn finishes; the remaining order is by priority,
        // main and the normal worker share a level in FIFO order.
        let mut order = vec![core.current()];
        while core.current() != ThreadId::IDLE {
            let current = core.current();
            core.terminate(current).unwrap();
            order.push(core.current());
            core.verify().unwrap();
        }
        assert_eq!(order, vec![high, normal, ThreadId::MAIN, low, ThreadId::IDLE]);
    }

    #[test]
    fn test_priority_scenario_high_normal_low_idle() {
        let mut core = new_core();
        let low = spawn(&mut core, ThreadPriority::Low);
        let normal = spawn(&mut core, ThreadPriority::Normal);
        let high = core.create(noop(), STACK, ThreadPriority::High).unwrap();
        core.activate(high).unwrap();
        core.terminate(high).unwrap();
        assert_eq!(core.current(), normal);
        core.sleep(Timeout::Ticks(100)).unwrap();
        assert_eq!(core.current(), ThreadId::MAIN);
        core.sleep(Timeout::Ticks(100)).unwrap();
        assert_eq!(core.current(), low);
        core.terminate(low).unwrap();
        assert_eq!(core.current(), ThreadId::IDLE);
        core.verify().unwrap();
    }

    #[test]
    fn test_terminate_running_switches_away() {
        let mut core = new_core();
        let switch = core.terminate(ThreadId::MAIN).unwrap().unwrap();
        assert_eq!(switch, Switch { from: ThreadId::MAIN, to: ThreadId::IDLE });
        assert_eq!(core.thread_state(ThreadId::MAIN).unwrap(), ThreadState::Dead);
        assert!(matches!(core.terminate(ThreadId::MAIN), Err(Error::InvalidState)));
        assert!(matches!(core.terminate(ThreadId::IDLE), Err(Error::InvalidState)));
        core.verify().unwrap();
    }

    #[test]
    fn test_activate_then_terminate_leaves_no_trace() {
        let mut core = new_core();
        let id = spawn(&mut core, ThreadPriority::Low);
        assert!(core.ready_queues().contains(id));
        assert_eq!(core.terminate(id).unwrap(), None);
        assert!(!core.ready_queues().contains(id));
        core.verify().unwrap();
    }

    #[test]
    fn test_reactivation_after_terminate() {
        let mut core = new_core();
        let id = spawn(&mut core, ThreadPriority::Low);
        core.terminate(id).unwrap();
        core.activate(id).unwrap();
        assert_eq!(core.thread(id).unwrap().activations(), 2);
        assert_eq!(core.ready_queues().len_at(ThreadPriority::Low), 1);
        core.verify().unwrap();
    }

    #[test]
    fn test_sleep_rejects_infinite() {
        let mut core = new_core();
        assert!(matches!(
            core.sleep(Timeout::Infinite),
            Err(Error::InvalidParameter)
        ));
    }

    #[test]
    fn test_sleep_accuracy() {
        let mut core = new_core();
        for _ in 0..10 {
            core.timer_tick();
        }
        assert_eq!(core.ticks(), 10);

        let switch = core.sleep(Timeout::Ticks(5)).unwrap().unwrap();
        assert_eq!(switch.to, ThreadId::IDLE);
        for _ in 0..4 {
            core.timer_tick();
        }
        assert_eq!(core.ticks(), 14);
        assert_eq!(
            core.thread_state(ThreadId::MAIN).unwrap(),
            ThreadState::Waiting(WaitReason::Sleep)
        );
        core.verify().unwrap();

        core.advance_tick();
        assert_eq!(core.ticks(), 15);
        assert_eq!(core.thread_state(ThreadId::MAIN).unwrap(), ThreadState::Ready);
        assert!(core.sleeping().is_empty());

        let switch = core.take_preemption().unwrap();
        assert_eq!(switch, Switch { from: ThreadId::IDLE, to: ThreadId::MAIN });
        core.verify().unwrap();
    }

    #[test]
    fn test_tick_round_robin_within_level() {
        let mut core = new_core();
        let a = spawn(&mut core, ThreadPriority::Normal);
        let b = spawn(&mut core, ThreadPriority::Normal);

        let mut order = Vec::new();
        for _ in 0..6 {
            core.timer_tick();
            order.push(core.current());
            core.verify().unwrap();
        }
        assert_eq!(order, vec![a, b, ThreadId::MAIN, a, b, ThreadId::MAIN]);
    }

    #[test]
    fn test_tick_keeps_highest_priority_running() {
        let mut core = new_core();
        let _low = spawn(&mut core, ThreadPriority::Low);
        for _ in 0..3 {
            assert_eq!(core.timer_tick(), None);
            assert_eq!(core.current(), ThreadId::MAIN);
        }
        assert_eq!(core.stats().preemptions, 3);
    }

    #[test]
    fn test_yield_to_equal_priority() {
        let mut core = new_core();
        // Nothing else at normal: main keeps running.
        let _low = spawn(&mut core, ThreadPriority::Low);
        assert_eq!(core.sleep(Timeout::Immediate).unwrap(), None);
        assert_eq!(core.thread_state(ThreadId::MAIN).unwrap(), ThreadState::Running);

        let peer = spawn(&mut core, ThreadPriority::Normal);
        let switch = core.sleep(Timeout::Immediate).unwrap().unwrap();
        assert_eq!(switch, Switch { from: ThreadId::MAIN, to: peer });
        assert_eq!(core.thread_state(ThreadId::MAIN).unwrap(), ThreadState::Ready);
        core.verify().unwrap();
    }

    #[test]
    fn test_io_completion_wakes_thread() {
        let mut core = new_core();
        let request = core.begin_io();
        assert_eq!(request.ticket.thread, ThreadId::MAIN);
        assert_eq!(request.switch.to, ThreadId::IDLE);
        core.verify().unwrap();

        assert!(core.complete_io(request.ticket, 12));
        assert_eq!(core.thread_state(ThreadId::MAIN).unwrap(), ThreadState::Ready);
        // Main outranks idle: a preemption is pending.
        assert!(core.preemption_pending());
        let switch = core.take_preemption().unwrap();
        assert_eq!(switch.to, ThreadId::MAIN);
        assert_eq!(core.take_io_result(ThreadId::MAIN), Some(12));
        assert_eq!(core.take_io_result(ThreadId::MAIN), None);
        assert_eq!(core.stats().io_completions, 1);
        core.verify().unwrap();
    }

    #[test]
    fn test_io_completion_lower_priority_waits() {
        let mut core = new_core();
        let low = core.create(noop(), STACK, ThreadPriority::Low).unwrap();
        core.activate(low).unwrap();
        // Main sleeps so the low thread runs and starts a request.
        core.sleep(Timeout::Ticks(50)).unwrap();
        assert_eq!(core.current(), low);
        let request = core.begin_io();
        assert_eq!(core.current(), ThreadId::IDLE);

        // A normal thread is running by the time the low thread's request completes.
        let main_switch = core.terminate(ThreadId::MAIN);
        assert!(main_switch.unwrap().is_none());
        let other = spawn(&mut core, ThreadPriority::Normal);
        assert_eq!(core.current(), other);

        assert!(core.complete_io(request.ticket, -1));
        assert!(!core.preemption_pending());
        assert_eq!(core.current(), other);
        core.verify().unwrap();
    }

    #[test]
    fn test_stale_io_completion_is_ignored() {
        let mut core = new_core();
        let worker = core.create(noop(), STACK, ThreadPriority::High).unwrap();
        core.activate(worker).unwrap();
        let request = core.begin_io();
        assert_eq!(core.current(), ThreadId::MAIN);

        core.terminate(worker).unwrap();
        assert!(!core.complete_io(request.ticket, 3));
        core.activate(worker).unwrap();
        assert!(!core.complete_io(request.ticket, 3));
        core.verify().unwrap();
    }

    #[test]
    fn test_mutex_immediate_contention() {
        let mut core = new_core();
        let mutex = core.mutex_create();
        assert_eq!(core.mutex_query(mutex).unwrap(), ThreadId::INVALID);

        assert_eq!(
            core.mutex_acquire(mutex, Timeout::Immediate).unwrap(),
            AcquireOutcome::Acquired
        );
        assert_eq!(core.mutex_query(mutex).unwrap(), ThreadId::MAIN);

        // A second thread contends while main holds it.
        let other = core.create(noop(), STACK, ThreadPriority::High).unwrap();
        core.activate(other).unwrap();
        assert_eq!(core.current(), other);
        assert!(matches!(
            core.mutex_acquire(mutex, Timeout::Immediate),
            Err(Error::Failure)
        ));
        core.verify().unwrap();
    }

    #[test]
    fn test_mutex_reacquire_by_owner_is_invalid() {
        let mut core = new_core();
        let mutex = core.mutex_create();
        core.mutex_acquire(mutex, Timeout::Infinite).unwrap();
        assert!(matches!(
            core.mutex_acquire(mutex, Timeout::Infinite),
            Err(Error::InvalidState)
        ));
        assert!(matches!(
            core.mutex_acquire(MutexId(7), Timeout::Infinite),
            Err(Error::InvalidId)
        ));
    }

    #[test]
    fn test_mutex_immediate_reacquire_by_owner_fails() {
        let mut core = new_core();
        let mutex = core.mutex_create();
        core.mutex_acquire(mutex, Timeout::Immediate).unwrap();
        assert!(matches!(
            core.mutex_acquire(mutex, Timeout::Immediate),
            Err(Error::Failure)
        ));
        assert!(matches!(
            core.mutex_acquire(mutex, Timeout::Ticks(3)),
            Err(Error::InvalidState)
        ));
        // Ownership is untouched by the rejected attempts.
        assert_eq!(core.mutex_query(mutex).unwrap(), ThreadId::MAIN);
        core.mutex_release(mutex).unwrap();
        assert_eq!(core.mutex_query(mutex).unwrap(), ThreadId::INVALID);
        core.verify().unwrap();
    }

    #[test]
    fn test_full_schedule_requeues_running_thread() {
        let mut core = new_core();
        let peer = spawn(&mut core, ThreadPriority::Normal);
        assert_eq!(core.thread_state(ThreadId::MAIN).unwrap(), ThreadState::Running);

        let switch = core.schedule(ScheduleMode::Full).unwrap();
        assert_eq!(switch, Switch { from: ThreadId::MAIN, to: peer });
        assert_eq!(core.thread_state(ThreadId::MAIN).unwrap(), ThreadState::Ready);
        assert_eq!(core.thread_state(peer).unwrap(), ThreadState::Running);
        core.verify().unwrap();

        // Alone at the top level, the running thread is selected again.
        let mut core = new_core();
        let _low = spawn(&mut core, ThreadPriority::Low);
        assert_eq!(core.schedule(ScheduleMode::Full), None);
        assert_eq!(core.thread_state(ThreadId::MAIN).unwrap(), ThreadState::Running);
        core.verify().unwrap();
    }

    #[test]
    fn test_mutex_release_grants_waiter() {
        let mut core = new_core();
        let mutex = core.mutex_create();
        core.mutex_acquire(mutex, Timeout::Infinite).unwrap();

        let waiter = core.create(noop(), STACK, ThreadPriority::High).unwrap();
        core.activate(waiter).unwrap();
        let outcome = core.mutex_acquire(mutex, Timeout::Infinite).unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::Blocked(Switch { from: waiter, to: ThreadId::MAIN })
        );
        core.verify().unwrap();

        // Release hands the mutex over and the higher priority waiter preempts main.
        let switch = core.mutex_release(mutex).unwrap().unwrap();
        assert_eq!(switch, Switch { from: ThreadId::MAIN, to: waiter });
        assert_eq!(core.mutex_query(mutex).unwrap(), waiter);
        core.mutex_acquire_result(mutex).unwrap();
        core.verify().unwrap();

        assert_eq!(core.mutex_release(mutex).unwrap(), None);
        assert_eq!(core.mutex_query(mutex).unwrap(), ThreadId::INVALID);
        assert!(matches!(core.mutex_release(mutex), Err(Error::InvalidState)));
    }

    #[test]
    fn test_mutex_release_prefers_higher_priority_waiter() {
        let mut core = new_core();
        let mutex = core.mutex_create();
        core.mutex_acquire(mutex, Timeout::Infinite).unwrap();

        let low = spawn(&mut core, ThreadPriority::Low);
        let normal = spawn(&mut core, ThreadPriority::Normal);
        // Main yields its level to the normal worker, which blocks.
        core.sleep(Timeout::Immediate).unwrap();
        assert_eq!(core.current(), normal);
        core.mutex_acquire(mutex, Timeout::Infinite).unwrap();
        assert_eq!(core.current(), ThreadId::MAIN);

        core.sleep(Timeout::Ticks(1)).unwrap();
        assert_eq!(core.current(), low);
        core.mutex_acquire(mutex, Timeout::Infinite).unwrap();
        assert_eq!(core.current(), ThreadId::IDLE);
        core.timer_tick();
        assert_eq!(core.current(), ThreadId::MAIN);

        assert_eq!(core.mutex_release(mutex).unwrap(), None);
        assert_eq!(core.mutex_query(mutex).unwrap(), normal);
        core.verify().unwrap();
    }

    #[test]
    fn test_mutex_wait_timeout() {
        let mut core = new_core();
        let mutex = core.mutex_create();
        let holder = core.create(noop(), STACK, ThreadPriority::Low).unwrap();
        core.activate(holder).unwrap();

        // The holder takes the mutex while main sleeps.
        core.sleep(Timeout::Ticks(1)).unwrap();
        core.mutex_acquire(mutex, Timeout::Infinite).unwrap();
        core.timer_tick();
        assert_eq!(core.current(), ThreadId::MAIN);

        let outcome = core.mutex_acquire(mutex, Timeout::Ticks(3)).unwrap();
        assert!(matches!(outcome, AcquireOutcome::Blocked(_)));
        core.timer_tick();
        core.timer_tick();
        assert!(core.thread_state(ThreadId::MAIN).unwrap().is_waiting());
        core.timer_tick();
        assert_eq!(core.current(), ThreadId::MAIN);
        assert!(matches!(core.mutex_acquire_result(mutex), Err(Error::Failure)));
        assert!(!core.mutexes().get(mutex).unwrap().has_waiter(ThreadId::MAIN));
        assert_eq!(core.stats().mutex_timeouts, 1);
        core.verify().unwrap();
    }

    #[test]
    fn test_terminate_owner_abandons_mutex() {
        let mut core = new_core();
        let mutex = core.mutex_create();
        let holder = core.create(noop(), STACK, ThreadPriority::High).unwrap();
        core.activate(holder).unwrap();
        core.mutex_acquire(mutex, Timeout::Infinite).unwrap();
        core.sleep(Timeout::Ticks(10)).unwrap();
        assert_eq!(core.current(), ThreadId::MAIN);

        core.mutex_acquire(mutex, Timeout::Infinite).unwrap();
        assert_eq!(core.current(), ThreadId::IDLE);
        core.terminate(holder).unwrap();
        assert_eq!(core.mutex_query(mutex).unwrap(), ThreadId::MAIN);
        assert_eq!(core.current(), ThreadId::MAIN);
        core.verify().unwrap();
    }

    #[test]
    fn test_terminate_waiting_threads() {
        let mut core = new_core();
        let mutex = core.mutex_create();
        core.mutex_acquire(mutex, Timeout::Infinite).unwrap();

        let sleeper = spawn(&mut core, ThreadPriority::Normal);
        let waiter = spawn(&mut core, ThreadPriority::Normal);
        core.sleep(Timeout::Immediate).unwrap();
        assert_eq!(core.current(), sleeper);
        core.sleep(Timeout::Ticks(5)).unwrap();
        assert_eq!(core.current(), waiter);
        core.mutex_acquire(mutex, Timeout::Infinite).unwrap();
        assert_eq!(core.current(), ThreadId::MAIN);

        core.terminate(sleeper).unwrap();
        core.terminate(waiter).unwrap();
        assert!(core.sleeping().is_empty());
        assert_eq!(core.mutexes().get(mutex).unwrap().waiters().count(), 0);
        core.verify().unwrap();
    }

    #[test]
    fn test_mutex_delete() {
        let mut core = new_core();
        let mutex = core.mutex_create();
        core.mutex_acquire(mutex, Timeout::Infinite).unwrap();
        assert!(matches!(core.mutex_delete(mutex), Err(Error::InvalidState)));
        core.mutex_release(mutex).unwrap();
        core.mutex_delete(mutex).unwrap();
        assert!(matches!(core.mutex_query(mutex), Err(Error::InvalidId)));
    }
}
