mod elf;
mod syscall;

use clap::Parser;
use log::debug;
use syscall::SyscallIo;
use tinyrv_core::{Hart, Isa};

/// Instructions per step batch; the run loop re-enters until the guest
/// exits.
const BATCH_CYCLES: u32 = 100_000;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Execute through the plain interpreter instead of the block cache.
    #[arg(long)]
    interp: bool,
    /// Log block-translation statistics when the run finishes.
    #[arg(long)]
    report: bool,
    /// Grow the block map under load instead of clearing it.
    #[arg(long)]
    grow_map: bool,
    /// Statically linked RV32 ELF binary to run.
    binary: String,
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let buf = std::fs::read(&args.binary)?;

    let mut io = SyscallIo::new();
    let image = elf::load(&buf, io.memory_mut()).expect("failed to load ELF file");
    io.set_break_address(image.break_address);

    let mut hart = Hart::new(Isa::rv32imafc(), io);
    hart.set_pc(image.entry).expect("misaligned ELF entry point");
    hart.block_cache_mut().options_mut().report = args.report;
    hart.block_cache_mut().options_mut().grow_map = args.grow_map;

    while !hart.has_halted() {
        match args.interp {
            true => hart.step(BATCH_CYCLES),
            false => hart.step_blocks(BATCH_CYCLES),
        }
    }

    let exit_code = hart.io().exit_code().unwrap_or(0);
    debug!("guest exited with code {exit_code}");
    std::process::exit(exit_code as i32);
}
