use tickvm::{vm_print_error, Error, OpenFlags, Result, Vm};

const CHUNK: usize = 512;
const STDOUT: i32 = 1;

pub fn main(vm: &Vm, args: &[String]) -> Result<()> {
    let Some(source) = args.get(1) else {
        vm_print_error!(vm, "usage: file FILE [DEST]\n")?;
        return Err(Error::InvalidParameter);
    };

    let input = vm.file_open(source, OpenFlags::READ, 0)?;
    let output = match args.get(2) {
        Some(dest) => vm.file_open(
            dest,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o644,
        )?,
        None => STDOUT,
    };

    let copied = copy(vm, input, output);
    vm.file_close(input)?;
    if output != STDOUT {
        vm.file_close(output)?;
    }
    let copied = copied?;

    if output != STDOUT {
        vm_print_error!(vm, "copied {copied} bytes\n")?;
    }
    Ok(())
}

fn copy(vm: &Vm, input: i32, output: i32) -> Result<usize> {
    let mut buffer = [0u8; CHUNK];
    let mut total = 0;
    loop {
        let count = vm.file_read(input, &mut buffer)?;
        if count == 0 {
            return Ok(total);
        }
        let mut offset = 0;
        while offset < count {
            match vm.file_write(output, &buffer[offset..count])? {
                0 => return Err(Error::Failure),
                written => offset += written,
            }
        }
        total += count;
    }
}
