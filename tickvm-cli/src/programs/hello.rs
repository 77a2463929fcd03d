use tickvm::{vm_print, Result, Vm};

pub fn main(vm: &Vm, args: &[String]) -> Result<()> {
    vm_print!(vm, "Hello from {} on the virtual machine\n", vm.thread_id()?)?;
    for (index, arg) in args.iter().enumerate().skip(1) {
        vm_print!(vm, "  arg[{index}] = {arg}\n")?;
    }
    Ok(())
}
