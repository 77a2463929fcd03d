//! Execution contexts backed by parked OS threads.
//!
//! Every virtual machine thread runs on its own OS thread, but only the thread
//! holding the baton executes. All others sleep on their [`Gate`]. A switch
//! opens the target's gate and closes the caller's, so exactly one context
//! makes progress at a time and the host scheduler never decides who runs.
//!
//! A [`Gate`] is a latch: opening it before its owner parks is not lost, the
//! owner simply does not block. This makes the hand-off race free without
//! holding the scheduler lock across the switch.
//!
//! Contexts that must never run again are *retired*. Their owner wakes up and
//! unwinds its stack with a [`Retired`] payload, which the thread trampoline
//! catches.

use std::{
    collections::HashMap,
    panic,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};

use log::{debug, warn};

use crate::{
    vm::{Switch, ThreadId, MIN_CONTEXT_STACK},
    Error, Result,
};

/// Unwind payload of a context that has been retired.
#[derive(Debug)]
pub struct Retired;

/// Unwinds the calling context.
///
/// Never returns. The payload is caught by the thread trampoline, or by the
/// host thread running the program entry.
pub fn retire_current() -> ! {
    panic::resume_unwind(Box::new(Retired))
}

/// How a parked context was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    /// The context holds the baton and continues.
    Resumed,
    /// The context is shut down and must unwind.
    Retired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Signal {
    Parked,
    Resumed,
    Retired,
}

/// Binary latch one context parks on.
#[derive(Debug)]
pub struct Gate {
    signal: Mutex<Signal>,
    condvar: Condvar,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    /// Creates a closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: Mutex::new(Signal::Parked),
            condvar: Condvar::new(),
        }
    }

    /// Lets the owner run. A retired gate stays retired.
    pub fn open(&self) -> Result<()> {
        let mut signal = lock!(self.signal);
        if *signal == Signal::Parked {
            *signal = Signal::Resumed;
        }
        self.condvar.notify_one();
        Ok(())
    }

    /// Retires the owner. Sticky: every later [`Gate::wait`] returns [`Wake::Retired`].
    pub fn retire(&self) -> Result<()> {
        *lock!(self.signal) = Signal::Retired;
        self.condvar.notify_one();
        Ok(())
    }

    /// Blocks until the gate is opened or retired, then closes it again.
    pub fn wait(&self) -> Result<Wake> {
        let mut signal = lock!(self.signal);
        while *signal == Signal::Parked {
            signal = self.condvar.wait(signal)?;
        }
        match *signal {
            Signal::Retired => Ok(Wake::Retired),
            _ => {
                *signal = Signal::Parked;
                Ok(Wake::Resumed)
            }
        }
    }
}

struct Context {
    gate: Arc<Gate>,
    handle: Option<JoinHandle<()>>,
}

/// Execution contexts indexed by thread id.
///
/// # Thread Safety
///
/// The table has its own lock, independent of the scheduler critical section.
/// It is safe to create or retire contexts while holding the scheduler lock,
/// but a context must never wait on its gate while holding it.
pub struct ContextTable {
    name: String,
    contexts: Mutex<HashMap<ThreadId, Context>>,
    /// Handles of replaced or deleted contexts still running. Exited ones are
    /// reaped whenever another context is discarded; the rest are joined at shutdown.
    finished: Mutex<Vec<JoinHandle<()>>>,
}

impl ContextTable {
    /// Creates an empty table; OS threads are named `{name}-{id}`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contexts: Mutex::new(HashMap::new()),
            finished: Mutex::new(Vec::new()),
        }
    }

    /// Registers the calling OS thread as the context of `id`.
    ///
    /// Used for the main thread, which runs on the host thread that started the
    /// virtual machine and therefore has no join handle.
    ///
    /// # Errors
    ///
    /// [`Error::LockError`] if the table lock is poisoned.
    pub fn adopt(&self, id: ThreadId) -> Result<()> {
        let context = Context {
            gate: Arc::new(Gate::new()),
            handle: None,
        };
        if let Some(old) = lock!(self.contexts).insert(id, context) {
            self.discard(old)?;
        }
        Ok(())
    }

    /// Creates a fresh context for `id` that runs `body` once first resumed.
    ///
    /// An existing context of `id` is retired and replaced. A context retired
    /// before it ever ran exits without calling `body`.
    ///
    /// # Errors
    ///
    /// [`Error::InsufficientResources`] if the OS refuses to spawn the thread.
    pub fn create<F>(&self, id: ThreadId, stack_size: usize, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let gate = Arc::new(Gate::new());
        let parked = gate.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, id.value()))
            .stack_size(stack_size.max(MIN_CONTEXT_STACK))
            .spawn(move || match parked.wait() {
                Ok(Wake::Resumed) => body(),
                Ok(Wake::Retired) => {}
                Err(error) => warn!("context of {id} lost its gate: {error}"),
            })
            .map_err(|error| {
                warn!("failed to spawn context for {id}: {error}");
                Error::InsufficientResources
            })?;

        let context = Context {
            gate,
            handle: Some(handle),
        };
        if let Some(old) = lock!(self.contexts).insert(id, context) {
            self.discard(old)?;
        }
        debug!("created context for {id}");
        Ok(())
    }

    /// Retires the context of `id`, if any.
    pub fn retire(&self, id: ThreadId) -> Result<()> {
        let gate = lock!(self.contexts).get(&id).map(|ctx| ctx.gate.clone());
        if let Some(gate) = gate {
            gate.retire()?;
        }
        Ok(())
    }

    /// Retires and forgets the context of `id`, keeping its handle for [`ContextTable::join_all`].
    pub fn remove(&self, id: ThreadId) -> Result<()> {
        let removed = lock!(self.contexts).remove(&id);
        if let Some(context) = removed {
            self.discard(context)?;
        }
        Ok(())
    }

    /// Performs `switch` from the calling context.
    ///
    /// The calling context must be `switch.from`. Returns once `switch.from`
    /// is resumed again, or retired.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] if either side has no context.
    pub fn switch(&self, switch: Switch) -> Result<Wake> {
        if switch.from == switch.to {
            return Ok(Wake::Resumed);
        }
        // Looked up before the hand-off: once the target runs it may replace our entry.
        let own = self.gate(switch.from)?;
        self.gate(switch.to)?.open()?;
        own.wait()
    }

    /// Passes the baton to `to` without parking; the caller is about to exit.
    pub fn hand_off(&self, to: ThreadId) -> Result<()> {
        self.gate(to)?.open()
    }

    /// Retires every context.
    pub fn retire_all(&self) -> Result<()> {
        let gates: Vec<Arc<Gate>> = lock!(self.contexts)
            .values()
            .map(|ctx| ctx.gate.clone())
            .collect();
        for gate in gates {
            gate.retire()?;
        }
        Ok(())
    }

    /// Joins every context thread that was ever created.
    ///
    /// Call after [`ContextTable::retire_all`]; the calling thread must not be
    /// one of them.
    pub fn join_all(&self) -> Result<()> {
        let mut handles: Vec<JoinHandle<()>> = lock!(self.contexts)
            .drain()
            .filter_map(|(_, ctx)| ctx.handle)
            .collect();
        handles.extend(lock!(self.finished).drain(..));

        for handle in handles {
            let name = handle.thread().name().unwrap_or("context").to_string();
            if handle.join().is_err() {
                warn!("{name} terminated abnormally");
            }
        }
        Ok(())
    }

    /// Number of registered contexts.
    pub fn len(&self) -> Result<usize> {
        Ok(lock!(self.contexts).len())
    }

    fn gate(&self, id: ThreadId) -> Result<Arc<Gate>> {
        lock!(self.contexts)
            .get(&id)
            .map(|ctx| ctx.gate.clone())
            .ok_or(Error::InvalidId)
    }

    fn discard(&self, context: Context) -> Result<()> {
        context.gate.retire()?;
        let mut finished = lock!(self.finished);
        let (exited, running): (Vec<_>, Vec<_>) =
            finished.drain(..).partition(JoinHandle::is_finished);
        *finished = running;
        if let Some(handle) = context.handle {
            finished.push(handle);
        }
        drop(finished);

        for handle in exited {
            if handle.join().is_err() {
                warn!("discarded context terminated abnormally");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::{Duration, Instant},
    };

    use super::*;

    #[test]
    fn test_gate_is_a_latch() {
        let gate = Gate::new();
        gate.open().unwrap();
        assert_eq!(gate.wait().unwrap(), Wake::Resumed);

        gate.retire().unwrap();
        gate.open().unwrap();
        assert_eq!(gate.wait().unwrap(), Wake::Retired);
        assert_eq!(gate.wait().unwrap(), Wake::Retired);
    }

    #[test]
    fn test_ping_pong() {
        let table = Arc::new(ContextTable::new("ctx-test"));
        let host = ThreadId(1);
        let worker = ThreadId(2);
        let counter = Arc::new(AtomicU32::new(0));

        table.adopt(host).unwrap();
        let (t, c) = (table.clone(), counter.clone());
        table
            .create(worker, 0, move || {
                for _ in 0..3 {
                    c.fetch_add(1, Ordering::SeqCst);
                    let back = Switch { from: worker, to: host };
                    if t.switch(back).unwrap() == Wake::Retired {
                        return;
                    }
                }
            })
            .unwrap();

        let to_worker = Switch { from: host, to: worker };
        for expected in 1..=3 {
            assert_eq!(table.switch(to_worker).unwrap(), Wake::Resumed);
            assert_eq!(counter.load(Ordering::SeqCst), expected);
        }

        table.retire_all().unwrap();
        table.join_all().unwrap();
        assert_eq!(table.len().unwrap(), 0);
    }

    #[test]
    fn test_retired_before_start_never_runs() {
        let table = ContextTable::new("ctx-test");
        let ran = Arc::new(AtomicU32::new(0));
        let flag = ran.clone();
        table
            .create(ThreadId(5), 4096, move || {
                flag.store(1, Ordering::SeqCst);
            })
            .unwrap();
        table.remove(ThreadId(5)).unwrap();
        table.join_all().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_exited_contexts_are_reaped() {
        let table = ContextTable::new("ctx-test");
        for index in 0..16 {
            let id = ThreadId(index + 2);
            table.create(id, 4096, || {}).unwrap();
            table.remove(id).unwrap();

            let deadline = Instant::now() + Duration::from_secs(5);
            while !table.finished.lock().unwrap().iter().all(JoinHandle::is_finished) {
                assert!(Instant::now() < deadline, "retired context did not exit");
                thread::sleep(Duration::from_millis(1));
            }
        }
        // Each removal joined the contexts that had already exited.
        assert_eq!(table.finished.lock().unwrap().len(), 1);
        table.join_all().unwrap();
        assert!(table.finished.lock().unwrap().is_empty());
    }

    #[test]
    fn test_switch_unknown_context() {
        let table = ContextTable::new("ctx-test");
        table.adopt(ThreadId(1)).unwrap();
        let switch = Switch {
            from: ThreadId(1),
            to: ThreadId(9),
        };
        assert!(matches!(table.switch(switch), Err(Error::InvalidId)));
    }
}
