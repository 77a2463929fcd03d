use tickvm::{vm_print, Result, ThreadPriority, Timeout, Vm};

const STACK_SIZE: usize = 0x10000;

fn worker(priority: ThreadPriority) -> impl Fn(&Vm) -> Result<()> + Send + Sync + 'static {
    move |vm: &Vm| {
        vm_print!(vm, "{} ({priority}) running\n", vm.thread_id()?)?;
        vm.thread_sleep(Timeout::Ticks(2))?;
        vm_print!(vm, "{} ({priority}) done\n", vm.thread_id()?)
    }
}

pub fn main(vm: &Vm, _args: &[String]) -> Result<()> {
    let mut ids = Vec::new();
    for priority in [ThreadPriority::Low, ThreadPriority::Normal, ThreadPriority::High] {
        ids.push(vm.thread_create(worker(priority), STACK_SIZE, priority)?);
    }

    for id in &ids {
        vm_print!(vm, "main activates {id}\n")?;
        vm.thread_activate(*id)?;
    }

    vm_print!(vm, "main waits\n")?;
    vm.thread_sleep(Timeout::Ticks(10))?;

    for id in ids {
        vm_print!(vm, "{id} is {:?}\n", vm.thread_state(id)?)?;
        vm.thread_delete(id)?;
    }
    Ok(())
}
