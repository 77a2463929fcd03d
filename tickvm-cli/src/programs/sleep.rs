use tickvm::{vm_print, Result, Timeout, Vm};

use super::arg_or;

pub fn main(vm: &Vm, args: &[String]) -> Result<()> {
    let ticks: u32 = arg_or(args, 1, 10)?;
    let before = vm.tick_count()?;
    vm_print!(vm, "tick {before}: sleeping for {ticks} ticks of {}ms\n", vm.tick_ms())?;
    vm.thread_sleep(Timeout::Ticks(ticks))?;
    vm_print!(vm, "tick {}: awake\n", vm.tick_count()?)
}
