//! The host I/O interface.
//!
//! Every guest memory access and environment call crosses the core boundary
//! through [`SystemIo`]; the interpreter never touches a [`Memory`] directly.
//! This lets a host back different address ranges with its own devices, and
//! service ECALL/EBREAK with its own syscall layer.

use crate::hart::HartState;
use crate::memory::Memory;

/// The nine operations by which a hart reaches its host.
///
/// The implementing value is owned by the hart and plays the role of the
/// classic opaque userdata pointer: the host recovers its per-hart context
/// through `&mut self`, and reaches the architectural state through the
/// [`HartState`] reference passed to the environment callbacks.
///
/// The callbacks are invoked synchronously from inside the step loop and must
/// complete before the next instruction is fetched; re-entering the core from
/// within a callback is not supported.
pub trait SystemIo {
    /// Reads a 32-bit instruction word. The core guarantees `address`
    /// satisfies the active pc alignment and that the covering memory is
    /// populated.
    fn mem_ifetch(&mut self, address: u32) -> u32;

    /// Reads a 32-bit data word.
    fn mem_read_w(&mut self, address: u32) -> u32;

    /// Reads a 16-bit data halfword.
    fn mem_read_s(&mut self, address: u32) -> u16;

    /// Reads a byte.
    fn mem_read_b(&mut self, address: u32) -> u8;

    /// Writes a 32-bit data word.
    fn mem_write_w(&mut self, address: u32, value: u32);

    /// Writes a 16-bit data halfword.
    fn mem_write_s(&mut self, address: u32, value: u16);

    /// Writes a byte.
    fn mem_write_b(&mut self, address: u32, value: u8);

    /// Invoked for the ECALL instruction, before pc advances past it.
    fn on_ecall(&mut self, hart: &mut HartState);

    /// Invoked for the EBREAK instruction (and on software breakpoint hits),
    /// before pc advances past it.
    fn on_ebreak(&mut self, hart: &mut HartState);
}

/// The plain host: a [`Memory`] wired straight through, with ECALL ignored
/// and EBREAK halting the hart.
///
/// Useful on its own for running bare instruction streams (and for tests);
/// richer hosts such as a syscall layer wrap their own [`Memory`] instead.
#[derive(Debug, Default)]
pub struct BasicIo {
    memory: Memory,
}

impl BasicIo {
    pub fn new() -> Self {
        Self {
            memory: Memory::new(),
        }
    }

    /// Builds the host around an already-populated memory.
    pub fn with_memory(memory: Memory) -> Self {
        Self { memory }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }
}

impl SystemIo for BasicIo {
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

    fn on_ecall(&mut self, _hart: &mut HartState) {}

    fn on_ebreak(&mut self, hart: &mut HartState) {
        hart.set_halt();
    }
}
