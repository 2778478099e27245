//! The interpreter: a single emulated hart.
//!
//! One [`Hart`] bundles the architectural state (integer and float register
//! files, CSRs, pc) with the host I/O implementation it was constructed
//! around. The step loop fetches through the host, decodes, and dispatches on
//! the decoded instruction tag; guest-visible faults take the minimal M-mode
//! trap path through `mtvec`, host API misuse is reported through `Result`
//! returns, and internal consistency violations panic.

pub mod csr;
mod execute;

use crate::registers::{FRegisters, Registers, Specifier};
use crate::{Isa, SystemIo};
use csr::CsrFile;
use log::{debug, trace};
use thiserror::Error;

pub use execute::Flow;
pub(crate) use execute::Executor;

/// The fixed address `sp` is initialised to on reset: the top of the 32-bit
/// address space, 4 KiB aligned.
pub const DEFAULT_STACK_POINTER: u32 = 0xFFFF_F000;

/// The architectural state of a hart, separate from its host I/O object so
/// that environment callbacks can be handed mutable access to it.
#[derive(Debug)]
pub struct HartState {
    isa: Isa,
    registers: Registers,
    fregisters: FRegisters,
    csrs: CsrFile,
    /// Width in bytes (2 or 4) of the most recently fetched instruction.
    insn_len: u32,
    halt: bool,
    /// The single armed software breakpoint, if any.
    breakpoint: Option<u32>,
    /// Placeholder reservation set recorded by LR.W. SC.W always succeeds
    /// regardless (single hart).
    reservation: Option<u32>,
}

impl HartState {
    fn new(isa: Isa) -> Self {
        Self {
            isa,
            registers: Registers::new(0),
            fregisters: FRegisters::new(),
            csrs: CsrFile::new(&isa),
            insn_len: 0,
            halt: false,
            breakpoint: None,
            reservation: None,
        }
    }

    /// The ISA profile this hart runs with.
    pub fn isa(&self) -> &Isa {
        &self.isa
    }

    /// Provides immutable access to the general purpose (x) registers and the
    /// pc register.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Provides mutable access to the general purpose (x) registers and the
    /// pc register.
    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    /// Provides immutable access to the floating-point registers.
    pub fn fregisters(&self) -> &FRegisters {
        &self.fregisters
    }

    /// Provides mutable access to the floating-point registers.
    pub fn fregisters_mut(&mut self) -> &mut FRegisters {
        &mut self.fregisters
    }

    /// Provides immutable access to the CSR file.
    pub fn csrs(&self) -> &CsrFile {
        &self.csrs
    }

    /// Provides mutable access to the CSR file.
    pub fn csrs_mut(&mut self) -> &mut CsrFile {
        &mut self.csrs
    }

    /// Reads register `x<index>` by plain index. Out-of-range reads return
    /// `!0`.
    pub fn reg(&self, index: u32) -> u32 {
        match Specifier::new(index) {
            Some(specifier) => self.registers.x(specifier),
            None => !0,
        }
    }

    /// Writes register `x<index>` by plain index. Writes to `x0` and to
    /// out-of-range indices are ignored.
    pub fn set_reg(&mut self, index: u32, value: u32) {
        if let Some(specifier) = Specifier::new(index) {
            self.registers.set_x(specifier, value);
        }
    }

    /// The width in bytes of the most recently fetched instruction.
    pub fn insn_len(&self) -> u32 {
        self.insn_len
    }

    /// Requests the step loop to stop before the next instruction.
    pub fn set_halt(&mut self) {
        self.halt = true;
    }

    /// Returns `true` once the hart has been halted.
    pub fn has_halted(&self) -> bool {
        self.halt
    }

    /// The armed software breakpoint, if any.
    pub fn breakpoint(&self) -> Option<u32> {
        self.breakpoint
    }

    /// The address of the reservation recorded by the most recent LR.W, if
    /// it has not been consumed by a store-conditional yet.
    pub fn reservation(&self) -> Option<u32> {
        self.reservation
    }

    /// Enters the trap path for a synchronous exception: records
    /// `mepc`/`mcause`/`mtval` and redirects pc through `mtvec`. The
    /// offending instruction is not retired.
    pub(crate) fn trap(&mut self, exception: Exception) {
        debug!("taking trap: {exception:?}");
        let pc = self.registers.pc();
        let (epc, tval) = match exception {
            // For a misaligned control-flow target, mepc holds the pc of the
            // instruction that issued the transfer and mtval the target.
            Exception::InstructionAddressMisaligned { branch_pc, target } => (branch_pc, target),
            Exception::IllegalInstruction(raw) => (pc, raw),
            Exception::LoadAddressMisaligned(address) => (pc, address),
            Exception::StoreAddressMisaligned(address) => (pc, address),
        };
        let handler = self.csrs.enter_trap(exception.code(), epc, tval);
        *self.registers.pc_mut() = handler;
    }
}

/// A single emulated hart bound to a host I/O implementation.
#[derive(Debug)]
pub struct Hart<S: SystemIo> {
    state: HartState,
    io: S,
    #[cfg(feature = "jit")]
    jit: crate::jit::BlockCache,
}

impl<S: SystemIo> Hart<S> {
    /// Constructs a hart bound to `io`, with all registers reset and `sp`
    /// installed at [`DEFAULT_STACK_POINTER`].
    pub fn new(isa: Isa, io: S) -> Self {
        let mut hart = Self {
            state: HartState::new(isa),
            io,
            #[cfg(feature = "jit")]
            jit: crate::jit::BlockCache::default(),
        };
        hart.reset(0);
        hart
    }

    /// Resets the hart: pc to `pc`, all registers and CSRs cleared, `sp`
    /// re-installed, halt cleared.
    pub fn reset(&mut self, pc: u32) {
        let isa = self.state.isa;
        self.state.registers = Registers::new(pc);
        self.state.fregisters = FRegisters::new();
        self.state.csrs = CsrFile::new(&isa);
        self.state.insn_len = 0;
        self.state.halt = false;
        self.state.reservation = None;
        self.state.registers.set_x(Specifier::SP, DEFAULT_STACK_POINTER);
        #[cfg(feature = "jit")]
        self.jit.clear();
    }

    /// Sets the pc. Fails without touching any state if `pc` violates the
    /// profile's instruction alignment.
    pub fn set_pc(&mut self, pc: u32) -> Result<(), SetPcError> {
        if !self.state.isa.pc_alignment().is_aligned(pc) {
            return Err(SetPcError::Misaligned(pc));
        }
        *self.state.registers.pc_mut() = pc;
        Ok(())
    }

    /// The current pc.
    pub fn pc(&self) -> u32 {
        self.state.registers.pc()
    }

    /// Reads register `x<index>`. Out-of-range reads return `!0`.
    pub fn reg(&self, index: u32) -> u32 {
        self.state.reg(index)
    }

    /// Writes register `x<index>`. Writes to `x0` and out-of-range indices
    /// are ignored.
    pub fn set_reg(&mut self, index: u32, value: u32) {
        self.state.set_reg(index, value);
    }

    /// Requests the step loop to stop before the next instruction.
    pub fn halt(&mut self) {
        self.state.halt = true;
    }

    /// Returns `true` once the hart has been halted.
    pub fn has_halted(&self) -> bool {
        self.state.halt
    }

    /// Arms the single software breakpoint at `pc`, replacing any previous
    /// one.
    pub fn set_breakpoint(&mut self, pc: u32) {
        self.state.breakpoint = Some(pc);
    }

    /// Disarms the software breakpoint.
    pub fn clear_breakpoint(&mut self) {
        self.state.breakpoint = None;
    }

    /// The armed software breakpoint, if any.
    pub fn breakpoint(&self) -> Option<u32> {
        self.state.breakpoint
    }

    /// The architectural state, as also handed to the environment callbacks.
    pub fn state(&self) -> &HartState {
        &self.state
    }

    /// Mutable access to the architectural state.
    pub fn state_mut(&mut self) -> &mut HartState {
        &mut self.state
    }

    /// The host I/O object this hart was constructed around.
    pub fn io(&self) -> &S {
        &self.io
    }

    /// Mutable access to the host I/O object.
    pub fn io_mut(&mut self) -> &mut S {
        &mut self.io
    }

    /// Executes up to `cycles` instructions.
    ///
    /// The loop stops early when `halt` is observed, when a breakpoint is
    /// hit, or after any control transfer (taken or not-taken branches,
    /// jumps, MRET) or trap; callers drive execution by invoking `step` in a
    /// loop. The cycle counter advances once per sequentially retired
    /// instruction; control transfers and trapped instructions do not
    /// advance it.
    pub fn step(&mut self, cycles: u32) {
        let Self { state, io, .. } = self;
        let cycles_target = state.csrs.cycle() + u64::from(cycles);
        while state.csrs.cycle() < cycles_target && !state.halt {
            let pc = state.registers.pc();
            if state.breakpoint == Some(pc) {
                trace!("hit breakpoint at {pc:#010x}");
                io.on_ebreak(state);
                return;
            }
            let raw_instruction = io.mem_ifetch(pc);
            let mut executor = Executor {
                state: &mut *state,
                io: &mut *io,
            };
            match executor.execute_raw(raw_instruction) {
                Ok(Flow::Next) => state.csrs.increment_cycle(),
                Ok(Flow::Branch) => return,
                Err(exception) => {
                    state.trap(exception);
                    return;
                }
            }
        }
    }

    /// Runs until the hart halts. A convenience wrapper around [`step`](Self::step).
    pub fn run(&mut self) {
        while !self.has_halted() {
            self.step(u32::MAX);
        }
    }
}

#[cfg(feature = "jit")]
impl<S: SystemIo> Hart<S> {
    /// The block cache.
    pub fn block_cache(&self) -> &crate::jit::BlockCache {
        &self.jit
    }

    /// Mutable access to the block cache (e.g. to set run options or clear
    /// it after rewriting guest code).
    pub fn block_cache_mut(&mut self) -> &mut crate::jit::BlockCache {
        &mut self.jit
    }

    pub(crate) fn split_for_jit(
        &mut self,
    ) -> (&mut HartState, &mut S, &mut crate::jit::BlockCache) {
        (&mut self.state, &mut self.io, &mut self.jit)
    }
}

/// Errors reported for host API misuse. The hart's state is left unchanged.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum SetPcError {
    #[error("pc {0:#010x} violates the instruction alignment")]
    Misaligned(u32),
}

/// Result of executing a single instruction. [`Ok`] carries how the step loop
/// should proceed, [`Err`] the exception to trap on.
pub type ExecutionResult<T = Flow> = Result<T, Exception>;

/// The synchronous exceptions recognised by the minimal trap path.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Exception {
    /// A control transfer targeted a pc violating the profile's instruction
    /// alignment. Carries the pc of the transferring instruction and the
    /// offending target.
    InstructionAddressMisaligned { branch_pc: u32, target: u32 },
    /// The inner value is the raw instruction word.
    IllegalInstruction(u32),
    /// The inner value is the misaligned effective address.
    LoadAddressMisaligned(u32),
    /// The inner value is the misaligned effective address.
    StoreAddressMisaligned(u32),
}

impl Exception {
    pub const INSTRUCTION_ADDRESS_MISALIGNED: u32 = 0;
    pub const ILLEGAL_INSTRUCTION: u32 = 2;
    pub const LOAD_ADDRESS_MISALIGNED: u32 = 4;
    pub const STORE_ADDRESS_MISALIGNED: u32 = 6;

    /// Returns the exception code (cause) for this exception.
    pub const fn code(&self) -> u32 {
        match self {
            Self::InstructionAddressMisaligned { .. } => Self::INSTRUCTION_ADDRESS_MISALIGNED,
            Self::IllegalInstruction(_) => Self::ILLEGAL_INSTRUCTION,
            Self::LoadAddressMisaligned(_) => Self::LOAD_ADDRESS_MISALIGNED,
            Self::StoreAddressMisaligned(_) => Self::STORE_ADDRESS_MISALIGNED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BasicIo;
    use crate::memory::Memory;

    fn hart_with_program(words: &[u32]) -> Hart<BasicIo> {
        let mut memory = Memory::new();
        for (i, &word) in words.iter().enumerate() {
            memory.write_word(0x1000 + 4 * i as u32, word);
        }
        let mut hart = Hart::new(Isa::rv32imafc(), BasicIo::with_memory(memory));
        hart.set_pc(0x1000).unwrap();
        hart
    }

    #[test]
    fn test_new_installs_stack_pointer() {
        let hart = Hart::new(Isa::rv32imafc(), BasicIo::new());
        assert_eq!(DEFAULT_STACK_POINTER, hart.reg(2));
        assert_eq!(0, hart.reg(0));
        assert!(!hart.has_halted());
    }

    #[test]
    fn test_reg_out_of_range() {
        let mut hart = Hart::new(Isa::rv32imafc(), BasicIo::new());
        assert_eq!(!0, hart.reg(32));
        hart.set_reg(32, 5); // ignored
        hart.set_reg(0, 5); // ignored
        assert_eq!(0, hart.reg(0));
    }

    #[test]
    fn test_set_pc_alignment() {
        let mut hart = Hart::new(Isa::rv32imafc(), BasicIo::new());
        assert_eq!(Err(SetPcError::Misaligned(0x1001)), hart.set_pc(0x1001));
        assert_eq!(Ok(()), hart.set_pc(0x1002));
        assert_eq!(0x1002, hart.pc());

        let mut hart = Hart::new(Isa::rv32i(), BasicIo::new());
        assert_eq!(Err(SetPcError::Misaligned(0x1002)), hart.set_pc(0x1002));
        // A failed set_pc leaves the pc unchanged.
        assert_eq!(0, hart.pc());
    }

    #[test]
    fn test_addi_chain() {
        // addi x1, x0, 5; addi x2, x1, -3; add x3, x1, x2
        let mut hart = hart_with_program(&[0x0050_0093, 0xFFD0_8113, 0x0020_81B3]);
        hart.step(3);
        assert_eq!(5, hart.reg(1));
        assert_eq!(2, hart.reg(2));
        assert_eq!(7, hart.reg(3));
        assert_eq!(0x100C, hart.pc());
        assert_eq!(3, hart.state().csrs().cycle());
    }

    #[test]
    fn test_step_returns_on_branch() {
        // jal x0, 0 (a jump to itself)
        let mut hart = hart_with_program(&[0x0000_006F]);
        hart.step(100);
        // The loop exits after the jump without retiring it.
        assert_eq!(0x1000, hart.pc());
        assert_eq!(0, hart.state().csrs().cycle());
    }

    #[test]
    fn test_breakpoint_halts_basic_io() {
        let mut hart = hart_with_program(&[0x0050_0093, 0x0050_0093]);
        hart.set_breakpoint(0x1004);
        hart.step(10);
        // BasicIo's on_ebreak halts; the instruction at the breakpoint did
        // not execute.
        assert!(hart.has_halted());
        assert_eq!(0x1004, hart.pc());
        assert_eq!(1, hart.state().csrs().cycle());
        hart.clear_breakpoint();
        assert_eq!(None, hart.breakpoint());
    }

    #[test]
    fn test_x0_stays_zero_after_every_step() {
        // addi x0, x0, 5; sub x0, x0, x1; lui x0, 0xFF
        let mut hart = hart_with_program(&[0x0050_0013, 0x4010_0033, 0x000F_F037]);
        for _ in 0..3 {
            hart.step(1);
            assert_eq!(0, hart.reg(0));
        }
    }

    #[test]
    fn test_signed_division_edge_cases() {
        // div x3, x1, x2; rem x4, x1, x2; divu x5, x1, x2
        let mut hart = hart_with_program(&[0x0220_C1B3, 0x0220_E233, 0x0220_D2B3]);
        hart.set_reg(1, 0x8000_0000);
        hart.set_reg(2, 0xFFFF_FFFF);
        hart.step(3);
        assert_eq!(0x8000_0000, hart.reg(3));
        assert_eq!(0, hart.reg(4));
        // Unsigned: 0x8000_0000 / 0xFFFF_FFFF truncates to zero.
        assert_eq!(0, hart.reg(5));
    }

    #[test]
    fn test_division_by_zero() {
        // div x3, x1, x2; rem x4, x1, x2; divu x5, x1, x2; remu x6, x1, x2
        let mut hart =
            hart_with_program(&[0x0220_C1B3, 0x0220_E233, 0x0220_D2B3, 0x0220_F333]);
        hart.set_reg(1, 42);
        hart.set_reg(2, 0);
        hart.step(4);
        assert_eq!(0xFFFF_FFFF, hart.reg(3));
        assert_eq!(42, hart.reg(4));
        assert_eq!(0xFFFF_FFFF, hart.reg(5));
        assert_eq!(42, hart.reg(6));
    }

    #[test]
    fn test_misaligned_word_load_traps() {
        let mut hart = hart_with_program(&[0x0001_2083]); // lw x1, 0(x2)
        hart.state_mut().csrs_mut().write(csr::MTVEC, 0x4000);
        hart.set_reg(1, 0x1234_5678);
        hart.set_reg(2, 0x2001);
        hart.step(1);
        let csrs = hart.state().csrs();
        assert_eq!(Exception::LOAD_ADDRESS_MISALIGNED, csrs.read(csr::MCAUSE));
        assert_eq!(0x2001, csrs.read(csr::MTVAL));
        assert_eq!(0x1000, csrs.read(csr::MEPC));
        assert_eq!(0x4000, hart.pc());
        // The destination register and cycle counter are untouched.
        assert_eq!(0x1234_5678, hart.reg(1));
        assert_eq!(0, csrs.cycle());
    }

    #[test]
    fn test_misaligned_store_traps() {
        let mut hart = hart_with_program(&[0x0011_1023]); // sh x1, 0(x2)
        hart.state_mut().csrs_mut().write(csr::MTVEC, 0x4000);
        hart.set_reg(2, 0x2001);
        hart.step(1);
        let csrs = hart.state().csrs();
        assert_eq!(Exception::STORE_ADDRESS_MISALIGNED, csrs.read(csr::MCAUSE));
        assert_eq!(0x2001, csrs.read(csr::MTVAL));
        // Nothing was written.
        assert_eq!(0, hart.io().memory().read_byte(0x2001));
    }

    #[test]
    fn test_lui_auipc() {
        // lui x5, 0xABCDE; auipc x6, 0x1
        let mut hart = hart_with_program(&[0xABCD_E2B7, 0x0000_1317]);
        hart.step(2);
        assert_eq!(0xABCD_E000, hart.reg(5));
        // auipc executed at 0x1004.
        assert_eq!(0x2004, hart.reg(6));
    }

    #[test]
    fn test_compressed_jal() {
        // c.jal +6 at 0x1000
        let mut memory = Memory::new();
        memory.write_halfword(0x1000, 0x2019);
        let mut hart = Hart::new(Isa::rv32imafc(), BasicIo::with_memory(memory));
        hart.set_pc(0x1000).unwrap();
        hart.step(1);
        assert_eq!(0x1002, hart.reg(1));
        assert_eq!(0x1006, hart.pc());
        assert_eq!(2, hart.state().insn_len());
    }

    #[test]
    fn test_misaligned_branch_target_traps() {
        // With the C extension disabled a taken branch to pc+2 is
        // misaligned: beq x0, x0, +2 is unencodable, so use jalr to an odd
        // base instead, and a branch target of +4 plus an odd register for
        // jal. Use jalr x1, 2(x2) with x2 = 0x1000: target (0x1002) & !1 =
        // 0x1002, misaligned for RV32I.
        let mut memory = Memory::new();
        memory.write_word(0x1000, 0x0021_00E7); // jalr x1, 2(x2)
        let mut hart = Hart::new(Isa::rv32i(), BasicIo::with_memory(memory));
        hart.set_pc(0x1000).unwrap();
        hart.state_mut().csrs_mut().write(csr::MTVEC, 0x4000);
        hart.set_reg(2, 0x1000);
        hart.step(1);
        let csrs = hart.state().csrs();
        assert_eq!(
            Exception::INSTRUCTION_ADDRESS_MISALIGNED,
            csrs.read(csr::MCAUSE)
        );
        // mepc is the pc of the jump itself, mtval the computed target.
        assert_eq!(0x1000, csrs.read(csr::MEPC));
        assert_eq!(0x1002, csrs.read(csr::MTVAL));
        assert_eq!(0x4000, hart.pc());
        // The link register was not written.
        assert_eq!(0, hart.reg(1));
        assert_eq!(0, csrs.cycle());
    }

    #[test]
    fn test_jalr_masks_low_bit() {
        // jalr x1, 5(x2) with x2 = 0x2000: target (0x2005) & !1 = 0x2004.
        let mut hart = hart_with_program(&[0x0051_00E7]);
        hart.io_mut().memory_mut().write_word(0x2004, 0x0000_0013);
        hart.set_reg(2, 0x2000);
        hart.step(1);
        assert_eq!(0x2004, hart.pc());
        assert_eq!(0x1004, hart.reg(1));
    }

    #[test]
    fn test_vectored_trap_dispatch() {
        let mut hart = hart_with_program(&[0x0001_2083]); // lw x1, 0(x2)
        hart.state_mut().csrs_mut().write(csr::MTVEC, 0x4001); // vectored
        hart.set_reg(2, 0x2002);
        hart.step(1);
        // Load-address-misaligned is cause 4: base + 4 * 4.
        assert_eq!(0x4010, hart.pc());
    }

    #[test]
    fn test_illegal_instruction_traps() {
        let mut hart = hart_with_program(&[0xFFFF_FFFF]);
        hart.state_mut().csrs_mut().write(csr::MTVEC, 0x4000);
        hart.step(1);
        let csrs = hart.state().csrs();
        assert_eq!(Exception::ILLEGAL_INSTRUCTION, csrs.read(csr::MCAUSE));
        assert_eq!(0xFFFF_FFFF, csrs.read(csr::MTVAL));
        assert_eq!(0x1000, csrs.read(csr::MEPC));
        assert_eq!(0x4000, hart.pc());
    }

    #[test]
    fn test_mret_returns_to_mepc() {
        let mut hart = hart_with_program(&[0x3020_0073]); // mret
        hart.io_mut().memory_mut().write_word(0x2000, 0x0000_0013);
        hart.state_mut().csrs_mut().write(csr::MEPC, 0x2000);
        hart.step(1);
        assert_eq!(0x2000, hart.pc());
        // mret is a control transfer: the cycle counter does not advance.
        assert_eq!(0, hart.state().csrs().cycle());
    }

    #[test]
    fn test_csr_read_only_range() {
        // csrrw x1, cycle, x2
        let mut hart = hart_with_program(&[0xC001_10F3, 0xC001_10F3]);
        hart.set_reg(2, 0xDEAD_BEEF);
        hart.step(1);
        // The read returns the old cycle value; the write is ignored.
        assert_eq!(0, hart.reg(1));
        hart.step(1);
        assert_eq!(1, hart.reg(1));
    }

    #[test]
    fn test_csrrs_x0_suppresses_write() {
        // csrrw x0, mscratch, x2 (writes); csrrs x1, mscratch, x0 (read only)
        let mut hart = hart_with_program(&[0x3401_1073, 0x3400_20F3]);
        hart.set_reg(2, 0x55AA);
        hart.step(2);
        assert_eq!(0x55AA, hart.reg(1));
        assert_eq!(0x55AA, hart.state().csrs().read(csr::MSCRATCH));
    }

    #[test]
    fn test_fflags_write_preserves_frm() {
        // csrrwi x0, frm, 0b011; csrrsi x0, fflags, 0x10
        let mut hart = hart_with_program(&[0x0021_D073, 0x0018_6073]);
        hart.step(2);
        let csrs = hart.state().csrs();
        assert_eq!(0b011, csrs.read(csr::FRM));
        assert_eq!(0x10, csrs.read(csr::FFLAGS));
        assert_eq!(0b011_10000, csrs.read(csr::FCSR));
    }

    #[test]
    fn test_fmin_nan_handling() {
        // fmin.s f3, f1, f2
        let mut hart = hart_with_program(&[0x2820_81D3]);
        hart.state_mut()
            .fregisters_mut()
            .set_bits(Specifier::from_u5(1), 0x7F80_0001); // signalling NaN
        hart.state_mut()
            .fregisters_mut()
            .set_f(Specifier::from_u5(2), 1.0);
        hart.step(1);
        assert_eq!(1.0, hart.state().fregisters().f(Specifier::from_u5(3)));
        // The signalling NaN raised invalid-operation.
        assert_eq!(0x10, hart.state().csrs().read(csr::FFLAGS));
    }

    #[test]
    fn test_fdiv_overflow_accrues_flags() {
        // fdiv.s f3, f1, f2
        let mut hart = hart_with_program(&[0x1820_F1D3]);
        hart.state_mut()
            .fregisters_mut()
            .set_f(Specifier::from_u5(1), 3.0e38);
        hart.state_mut()
            .fregisters_mut()
            .set_f(Specifier::from_u5(2), 1.0e-10);
        hart.step(1);
        // A finite quotient rounding to infinity sets overflow and inexact.
        assert_eq!(
            0x7F80_0000,
            hart.state().fregisters().bits(Specifier::from_u5(3))
        );
        assert_eq!(0b00101, hart.state().csrs().read(csr::FFLAGS));
    }

    #[test]
    fn test_fdiv_by_zero_flag_only() {
        // fdiv.s f3, f1, f2 with f2 = 0.0
        let mut hart = hart_with_program(&[0x1820_F1D3]);
        hart.state_mut()
            .fregisters_mut()
            .set_f(Specifier::from_u5(1), 1.0);
        hart.state_mut()
            .fregisters_mut()
            .set_f(Specifier::from_u5(2), 0.0);
        hart.step(1);
        // Division by zero is exact: DZ is set, overflow/inexact are not.
        assert_eq!(
            0x7F80_0000,
            hart.state().fregisters().bits(Specifier::from_u5(3))
        );
        assert_eq!(0b01000, hart.state().csrs().read(csr::FFLAGS));
    }

    #[test]
    fn test_fmadd_overflow_accrues_flags() {
        // fmadd.s f3, f1, f2, f4
        let mut hart = hart_with_program(&[0x2020_F1C3]);
        hart.state_mut()
            .fregisters_mut()
            .set_f(Specifier::from_u5(1), 2.0e38);
        hart.state_mut()
            .fregisters_mut()
            .set_f(Specifier::from_u5(2), 2.0);
        hart.state_mut()
            .fregisters_mut()
            .set_f(Specifier::from_u5(4), 1.0);
        hart.step(1);
        assert_eq!(
            0x7F80_0000,
            hart.state().fregisters().bits(Specifier::from_u5(3))
        );
        assert_eq!(0b00101, hart.state().csrs().read(csr::FFLAGS));
    }

    #[test]
    fn test_fmv_round_trips_nan_payload() {
        // fmv.w.x f1, x1; fmv.x.w x2, f1
        let mut hart = hart_with_program(&[0xF000_80D3, 0xE000_8153]);
        hart.set_reg(1, 0x7F80_0001);
        hart.step(2);
        assert_eq!(0x7F80_0001, hart.reg(2));
    }

    #[test]
    fn test_amo_uses_register_value_as_address() {
        // amoadd.w x3, x2, (x1)
        let mut hart = hart_with_program(&[0x0020_A1AF]);
        hart.io_mut().memory_mut().write_word(0x3000, 40);
        hart.set_reg(1, 0x3000);
        hart.set_reg(2, 2);
        hart.step(1);
        assert_eq!(40, hart.reg(3));
        assert_eq!(42, hart.io().memory().read_word(0x3000));
    }

    #[test]
    fn test_lr_sc_always_succeeds() {
        // lr.w x3, (x1); sc.w x4, x2, (x1)
        let mut hart = hart_with_program(&[0x1000_A1AF, 0x1820_A22F]);
        hart.io_mut().memory_mut().write_word(0x3000, 7);
        hart.set_reg(1, 0x3000);
        hart.set_reg(2, 9);
        hart.step(2);
        assert_eq!(7, hart.reg(3));
        // sc writes zero (success) and stores unconditionally.
        assert_eq!(0, hart.reg(4));
        assert_eq!(9, hart.io().memory().read_word(0x3000));
    }

    #[test]
    fn test_ecall_advances_pc() {
        // ecall; addi x1, x0, 5 — BasicIo ignores the call.
        let mut hart = hart_with_program(&[0x0000_0073, 0x0050_0093]);
        hart.step(2);
        assert_eq!(5, hart.reg(1));
        assert_eq!(0x1008, hart.pc());
    }

    #[test]
    fn test_halt_stops_step() {
        let mut hart = hart_with_program(&[0x0050_0093, 0x0050_0093]);
        hart.halt();
        hart.step(10);
        assert_eq!(0x1000, hart.pc());
        assert!(hart.has_halted());
    }
}
