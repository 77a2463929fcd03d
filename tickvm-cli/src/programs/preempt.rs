use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use tickvm::{vm_print, Result, ThreadPriority, Timeout, Vm};

use super::arg_or;

pub fn main(vm: &Vm, args: &[String]) -> Result<()> {
    let run_ticks: u32 = arg_or(args, 1, 20)?;
    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();

    for name in ["A", "B"] {
        let stop = stop.clone();
        let spins = Arc::new(AtomicU64::new(0));
        let counter = spins.clone();
        let id = vm.thread_create(
            move |vm| {
                let mut last_tick = vm.tick_count()?;
                while !stop.load(Ordering::Relaxed) {
                    counter.fetch_add(1, Ordering::Relaxed);
                    let tick = vm.tick_count()?;
                    if tick != last_tick {
                        vm_print!(vm, "{name} running at tick {tick}\n")?;
                        last_tick = tick;
                    }
                }
                Ok(())
            },
            0x10000,
            ThreadPriority::Low,
        )?;
        vm.thread_activate(id)?;
        workers.push((name, spins));
    }

    vm.thread_sleep(Timeout::Ticks(run_ticks))?;
    stop.store(true, Ordering::Relaxed);
    for (name, spins) in workers {
        vm_print!(vm, "{name} spun {} times\n", spins.load(Ordering::Relaxed))?;
    }
    Ok(())
}
