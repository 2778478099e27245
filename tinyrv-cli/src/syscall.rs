//! Newlib-style syscall servicing on top of ECALL.
//!
//! The host object owns the guest memory, the file-descriptor table, and the
//! program break. By ABI convention the syscall number arrives in `a7` and
//! its arguments in `a0..=a2`; the result goes back in `a0`. Unknown syscall
//! numbers halt the hart after logging, so runaway guests stop instead of
//! spinning on a failed call.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{trace, warn};
use tinyrv_core::hart::HartState;
use tinyrv_core::memory::Memory;
use tinyrv_core::SystemIo;

// Linux/newlib syscall numbers used by the RV32 toolchains.
const SYS_CLOSE: u32 = 57;
const SYS_LSEEK: u32 = 62;
const SYS_READ: u32 = 63;
const SYS_WRITE: u32 = 64;
const SYS_FSTAT: u32 = 80;
const SYS_EXIT: u32 = 93;
const SYS_EXIT_GROUP: u32 = 94;
const SYS_GETTIMEOFDAY: u32 = 169;
const SYS_BRK: u32 = 214;
const SYS_OPEN: u32 = 1024;

const O_WRONLY: u32 = 1;
const O_RDWR: u32 = 2;
const O_ACCMODE: u32 = 3;

// Syscall argument/result registers.
const A0: u32 = 10;
const A1: u32 = 11;
const A2: u32 = 12;
const A7: u32 = 17;

#[derive(Debug)]
enum FileHandle {
    Stdin,
    Stdout,
    Stderr,
    File(File),
}

/// The CLI's host: guest memory plus the process-like state a newlib guest
/// expects.
#[derive(Debug)]
pub struct SyscallIo {
    memory: Memory,
    break_address: u32,
    files: HashMap<u32, FileHandle>,
    next_fd: u32,
    exit_code: Option<u32>,
}

impl Default for SyscallIo {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallIo {
    pub fn new() -> Self {
        let mut files = HashMap::new();
        files.insert(0, FileHandle::Stdin);
        files.insert(1, FileHandle::Stdout);
        files.insert(2, FileHandle::Stderr);
        Self {
            memory: Memory::new(),
            break_address: 0,
            files,
            next_fd: 3,
            exit_code: None,
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Installs the initial program break (from the loaded image's `_end`).
    pub fn set_break_address(&mut self, address: u32) {
        self.break_address = address;
    }

    /// The code passed to the exit syscall, once the guest has exited.
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    fn dispatch(&mut self, hart: &mut HartState) {
        let number = hart.reg(A7);
        trace!("servicing syscall {number}");
        match number {
            SYS_WRITE => self.sys_write(hart),
            SYS_READ => self.sys_read(hart),
            SYS_OPEN => self.sys_open(hart),
            SYS_CLOSE => self.sys_close(hart),
            SYS_LSEEK => self.sys_lseek(hart),
            SYS_FSTAT => hart.set_reg(A0, 0),
            SYS_BRK => self.sys_brk(hart),
            SYS_GETTIMEOFDAY => self.sys_gettimeofday(hart),
            SYS_EXIT | SYS_EXIT_GROUP => {
                self.exit_code = Some(hart.reg(A0));
                hart.set_halt();
            }
            _ => {
                warn!("unhandled syscall {number}, halting");
                hart.set_halt();
            }
        }
    }

    fn sys_write(&mut self, hart: &mut HartState) {
        let fd = hart.reg(A0);
        let buffer = hart.reg(A1);
        let count = hart.reg(A2);
        let mut data = vec![0u8; count as usize];
        self.memory.read_into(&mut data, buffer);
        let written = match self.files.get_mut(&fd) {
            Some(FileHandle::Stdout) => std::io::stdout().write(&data).ok(),
            Some(FileHandle::Stderr) => std::io::stderr().write(&data).ok(),
            Some(FileHandle::File(file)) => file.write(&data).ok(),
            Some(FileHandle::Stdin) | None => None,
        };
        hart.set_reg(A0, written.map(|n| n as u32).unwrap_or(!0));
    }

    fn sys_read(&mut self, hart: &mut HartState) {
        let fd = hart.reg(A0);
        let buffer = hart.reg(A1);
        let count = hart.reg(A2);
        let mut data = vec![0u8; count as usize];
        let read = match self.files.get_mut(&fd) {
            Some(FileHandle::Stdin) => std::io::stdin().read(&mut data).ok(),
            Some(FileHandle::File(file)) => file.read(&mut data).ok(),
            _ => None,
        };
        match read {
            Some(n) => {
                self.memory.write(buffer, &data[..n]);
                hart.set_reg(A0, n as u32);
            }
            None => hart.set_reg(A0, !0),
        }
    }

    fn sys_open(&mut self, hart: &mut HartState) {
        let path_address = hart.reg(A0);
        let flags = hart.reg(A1);
        let mut path = [0u8; 256];
        let len = self.memory.read_cstr(&mut path, path_address) as usize;
        let path = String::from_utf8_lossy(&path[..len.saturating_sub(1).min(path.len())]);
        let file = match flags & O_ACCMODE {
            O_WRONLY => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path.as_ref()),
            O_RDWR => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path.as_ref()),
            _ => File::open(path.as_ref()),
        };
        match file {
            Ok(file) => {
                let fd = self.next_fd;
                self.next_fd += 1;
                self.files.insert(fd, FileHandle::File(file));
                hart.set_reg(A0, fd);
            }
            Err(error) => {
                warn!("open of {path:?} failed: {error}");
                hart.set_reg(A0, !0);
            }
        }
    }

    fn sys_close(&mut self, hart: &mut HartState) {
        let fd = hart.reg(A0);
        // Leave the standard streams in place.
        if fd > 2 && self.files.remove(&fd).is_some() {
            hart.set_reg(A0, 0);
        } else {
            hart.set_reg(A0, if fd <= 2 { 0 } else { !0 });
        }
    }

    fn sys_lseek(&mut self, hart: &mut HartState) {
        let fd = hart.reg(A0);
        let offset = hart.reg(A1) as i32;
        let whence = hart.reg(A2);
        let seek = match whence {
            0 => SeekFrom::Start(offset as u32 as u64),
            1 => SeekFrom::Current(offset as i64),
            2 => SeekFrom::End(offset as i64),
            _ => {
                hart.set_reg(A0, !0);
                return;
            }
        };
        let position = match self.files.get_mut(&fd) {
            Some(FileHandle::File(file)) => file.seek(seek).ok(),
            _ => None,
        };
        hart.set_reg(A0, position.map(|p| p as u32).unwrap_or(!0));
    }

    /// brk(0) queries the break; a nonzero argument moves it. No memory
    /// bookkeeping is required on top of the demand-allocated guest memory.
    fn sys_brk(&mut self, hart: &mut HartState) {
        let address = hart.reg(A0);
        if address != 0 {
            self.break_address = address;
        }
        hart.set_reg(A0, self.break_address);
    }

    /// Writes a 32-bit `struct timeval` to the guest pointer in a0.
    fn sys_gettimeofday(&mut self, hart: &mut HartState) {
        let tv = hart.reg(A0);
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(now) => {
                if tv != 0 {
                    self.memory.write_word(tv, now.as_secs() as u32);
                    self.memory.write_word(tv.wrapping_add(4), now.subsec_micros());
                }
                hart.set_reg(A0, 0);
            }
            Err(_) => hart.set_reg(A0, !0),
        }
    }
}

impl SystemIo for SyscallIo {
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
        self.dispatch(hart);
    }

    fn on_ebreak(&mut self, hart: &mut HartState) {
        hart.set_halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinyrv_core::{Hart, Isa};

    #[test]
    fn test_exit_sets_code_and_halts() {
        let mut io = SyscallIo::new();
        // ecall with a7 = SYS_EXIT, a0 = 42
        io.memory_mut().write_word(0x1000, 0x0000_0073);
        let mut hart = Hart::new(Isa::rv32imafc(), io);
        hart.set_pc(0x1000).unwrap();
        hart.set_reg(A7, SYS_EXIT);
        hart.set_reg(A0, 42);
        hart.step(10);
        assert!(hart.has_halted());
        assert_eq!(Some(42), hart.io().exit_code());
    }

    #[test]
    fn test_brk_moves_break() {
        let mut io = SyscallIo::new();
        io.set_break_address(0x2_0000);
        io.memory_mut().write_word(0x1000, 0x0000_0073);
        io.memory_mut().write_word(0x1004, 0x0000_0073);
        let mut hart = Hart::new(Isa::rv32imafc(), io);
        hart.set_pc(0x1000).unwrap();
        hart.set_reg(A7, SYS_BRK);
        hart.set_reg(A0, 0);
        hart.step(1);
        assert_eq!(0x2_0000, hart.reg(A0));
        hart.set_reg(A7, SYS_BRK);
        hart.set_reg(A0, 0x3_0000);
        hart.step(1);
        assert_eq!(0x3_0000, hart.reg(A0));
    }

    #[test]
    fn test_unknown_syscall_halts() {
        let mut io = SyscallIo::new();
        io.memory_mut().write_word(0x1000, 0x0000_0073);
        let mut hart = Hart::new(Isa::rv32imafc(), io);
        hart.set_pc(0x1000).unwrap();
        hart.set_reg(A7, 9999);
        hart.step(10);
        assert!(hart.has_halted());
        assert_eq!(None, hart.io().exit_code());
    }
}
