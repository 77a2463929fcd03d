//! Periodic alarm source driving the timer bridge.
//!
//! [`Alarm`] runs a callback on a dedicated OS thread once per interval until
//! it is stopped or dropped. Deadlines advance by whole intervals from the
//! start time, so a slow callback does not skew later ticks; intervals missed
//! entirely are skipped rather than replayed in a burst.

use std::{
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{Error, Result};

/// Callback invoked once per tick.
pub type AlarmCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct StopFlag {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

/// A running periodic alarm.
pub struct Alarm {
    interval: Duration,
    stop: Arc<StopFlag>,
    handle: Option<JoinHandle<()>>,
}

impl Alarm {
    /// Starts invoking `callback` every `interval` on a thread named `name`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] for a zero interval
    /// - [`Error::InsufficientResources`] if the alarm thread cannot be spawned
    pub fn start(name: &str, interval: Duration, mut callback: AlarmCallback) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::InvalidParameter);
        }

        let stop = Arc::new(StopFlag::default());
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut deadline = Instant::now() + interval;
                let Ok(mut stopped) = flag.stopped.lock() else {
                    return;
                };
                loop {
                    let now = Instant::now();
                    if now < deadline {
                        match flag.condvar.wait_timeout(stopped, deadline - now) {
                            Ok((guard, _)) => stopped = guard,
                            Err(_) => return,
                        }
                        if *stopped {
                            return;
                        }
                        continue;
                    }
                    if *stopped {
                        return;
                    }

                    drop(stopped);
                    callback();
                    deadline += interval;
                    let late = Instant::now();
                    while deadline <= late {
                        deadline += interval;
                    }

                    stopped = match flag.stopped.lock() {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                }
            })
            .map_err(|error| {
                warn!("failed to spawn alarm thread: {error}");
                Error::InsufficientResources
            })?;

        debug!("alarm started with {}ms interval", interval.as_millis());
        Ok(Self {
            interval,
            stop,
            handle: Some(handle),
        })
    }

    /// Tick interval of this alarm.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stops the alarm and waits for an in-flight callback to return.
    ///
    /// Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match self.stop.stopped.lock() {
            Ok(mut stopped) => *stopped = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        self.stop.condvar.notify_all();
        if handle.join().is_err() {
            warn!("alarm callback panicked");
        }
        debug!("alarm stopped");
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.stop();
    }
}
