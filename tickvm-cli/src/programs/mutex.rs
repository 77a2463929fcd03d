use tickvm::{vm_print, MutexId, Result, ThreadPriority, Timeout, Vm};

use super::arg_or;

fn contender(mutex: MutexId, hold: u32) -> impl Fn(&Vm) -> Result<()> + Send + Sync + 'static {
    move |vm: &Vm| {
        let me = vm.thread_id()?;
        vm_print!(vm, "{me} waits for {mutex}\n")?;
        vm.mutex_acquire(mutex, Timeout::Infinite)?;
        vm_print!(vm, "{me} holds {mutex}\n")?;
        vm.thread_sleep(Timeout::Ticks(hold))?;
        vm_print!(vm, "{me} releases {mutex}\n")?;
        vm.mutex_release(mutex)
    }
}

pub fn main(vm: &Vm, args: &[String]) -> Result<()> {
    let hold: u32 = arg_or(args, 1, 3)?;
    let mutex = vm.mutex_create()?;
    vm.mutex_acquire(mutex, Timeout::Infinite)?;

    let mut threads = Vec::new();
    for priority in [ThreadPriority::Low, ThreadPriority::High, ThreadPriority::Normal] {
        let id = vm.thread_create(contender(mutex, hold), 0x10000, priority)?;
        vm.thread_activate(id)?;
        threads.push(id);
    }

    // Let everyone queue up before the mutex is handed on.
    vm.thread_sleep(Timeout::Ticks(1))?;
    vm_print!(vm, "main releases {mutex}\n")?;
    vm.mutex_release(mutex)?;

    let waiting = hold.saturating_mul(4).saturating_add(4);
    vm.thread_sleep(Timeout::Ticks(waiting))?;
    for id in threads {
        vm.thread_delete(id)?;
    }
    vm.mutex_delete(mutex)
}
