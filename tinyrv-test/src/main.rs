use clap::Parser;
use goblin::elf::program_header::PT_LOAD;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use tinyrv_core::hart::HartState;
use tinyrv_core::memory::Memory;
use tinyrv_core::{Hart, Isa, SystemIo};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, short)]
    // Signature file to output signature to
    signature: Option<String>,
    // Elf file to run
    elf: String,
}

/// Architecture tests signal completion with an environment call; anything
/// else the host would do is irrelevant to the signature.
#[derive(Debug, Default)]
struct TestIo {
    memory: Memory,
}

impl SystemIo for TestIo {
    fn mem_ifetch(&mut self, address: u32) -> u32 {
        self.memory.fetch_instruction(address)
    }

    fn mem_read_w(&mut self, address: u32) -> u32 {
        self.memory.read_word(address)
    }

    fn mem_read_s(&mut self, address: u32) -> u16 {
        self.memory.read_halfword(address)
    }

    fn mem_read_b(&mut self, address: u32) -> u8 {
        self.memory.read_byte(address)
    }

    fn mem_write_w(&mut self, address: u32, value: u32) {
        self.memory.write_word(address, value);
    }

    fn mem_write_s(&mut self, address: u32, value: u16) {
        self.memory.write_halfword(address, value);
    }

    fn mem_write_b(&mut self, address: u32, value: u8) {
        self.memory.write_byte(address, value);
    }

    fn on_ecall(&mut self, hart: &mut HartState) {
        hart.set_halt();
    }

    fn on_ebreak(&mut self, hart: &mut HartState) {
        hart.set_halt();
    }
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();

    let mut buf = Vec::new();

    let mut file = File::open(args.elf)?;
    file.read_to_end(&mut buf)?;

    let elf_header = goblin::elf::Elf::parse(&buf).expect("failed to parse elf file");

    let mut io = TestIo::default();
    for h in elf_header
        .program_headers
        .iter()
        .filter(|h| h.p_type == PT_LOAD)
    {
        io.memory.write(h.p_vaddr as u32, &buf[h.file_range()]);
        if h.p_memsz > h.p_filesz {
            io.memory.fill(
                (h.p_vaddr + h.p_filesz) as u32,
                (h.p_memsz - h.p_filesz) as u32,
                0,
            );
        }
    }

    let mut hart = Hart::new(Isa::rv32imafc(), io);
    hart.set_pc(elf_header.entry as u32)
        .expect("misaligned entry point");

    // Run
    while !hart.has_halted() {
        hart.step(u32::MAX);
    }

    if let Some(path) = args.signature {
        let mut signature_start = None;
        let mut signature_end = None;
        for sym in elf_header.syms.iter() {
            let Some(name) = elf_header.strtab.get_at(sym.st_name) else {
                continue;
            };
            if name == "begin_signature" {
                signature_start = Some(sym.st_value as u32);
            } else if name == "end_signature" {
                signature_end = Some(sym.st_value as u32);
            }
        }
        let signature_start = signature_start.expect("missing symbol `begin_signature`");
        let signature_end = signature_end.expect("missing symbol `end_signature`");

        assert!(signature_start % 4 == 0);
        assert!(signature_end % 4 == 0);
        assert!(signature_start <= signature_end);

        let memory = &hart.io().memory;
        let mut file = File::create(path)?;
        for address in (signature_start..signature_end).step_by(4) {
            writeln!(file, "{:08x}", memory.read_word(address))?;
        }
    }

    Ok(())
}
