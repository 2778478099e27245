//! Static ELF loading into guest memory.

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use goblin::error::Error;
use log::{debug, info};
use tinyrv_core::memory::Memory;

/// The RISC-V machine type in the ELF header.
const EM_RISCV: u16 = 243;

/// What the loader hands back to the host: the entry point for `set_pc` and
/// the initial program break for the brk syscall.
pub struct Image {
    pub entry: u32,
    pub break_address: u32,
}

/// Copies every PT_LOAD segment of a statically linked RV32 ELF into guest
/// memory, zero-filling the segment tail past the file image, and resolves
/// the initial program break from the `_end` symbol.
pub fn load(buf: &[u8], memory: &mut Memory) -> Result<Image, Error> {
    let elf = Elf::parse(buf)?;
    if elf.is_64 || elf.header.e_machine != EM_RISCV {
        return Err(Error::Malformed(
            "expected a 32-bit RISC-V executable".to_string(),
        ));
    }

    for header in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        let vaddr = header.p_vaddr as u32;
        let file_size = header.p_filesz as u32;
        let mem_size = header.p_memsz as u32;
        debug!(
            "loading segment {vaddr:#010x} ({file_size:#x} file bytes, {mem_size:#x} in memory)"
        );
        memory.write(vaddr, &buf[header.file_range()]);
        if mem_size > file_size {
            memory.fill(vaddr.wrapping_add(file_size), mem_size - file_size, 0);
        }
    }

    // The data segment break starts at _end; without the symbol, fall back
    // to the highest loaded address.
    let mut break_address = elf
        .program_headers
        .iter()
        .filter(|h| h.p_type == PT_LOAD)
        .map(|h| (h.p_vaddr + h.p_memsz) as u32)
        .max()
        .unwrap_or(0);
    for sym in elf.syms.iter() {
        if elf.strtab.get_at(sym.st_name) == Some("_end") {
            break_address = sym.st_value as u32;
        }
    }

    let entry = elf.entry as u32;
    info!("loaded ELF: entry {entry:#010x}, break {break_address:#010x}");
    Ok(Image {
        entry,
        break_address,
    })
}
