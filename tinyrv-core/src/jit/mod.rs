//! The block-translation cache.
//!
//! Straight-line runs of guest instructions are collected into [`Block`]s
//! keyed by their start pc and stored in an open-addressed [`BlockMap`].
//! Blocks retain the raw instruction words in program order; executing a
//! block replays them through the interpreter without refetching, so the
//! cache can never change guest-observable behaviour. Each block carries a
//! non-owning predicted-successor hint used to chain hot blocks without a map
//! probe.

use log::{debug, info, trace};

use crate::hart::{Executor, Flow, Hart, HartState};
use crate::instruction::Instruction;
use crate::{Isa, SystemIo};

/// Maximum number of instructions collected into one block. A run longer
/// than this is split into consecutive, correctly closed blocks.
const BLOCK_CAPACITY: usize = 64;

/// Map capacity exponent at construction (`1 << bits` slots).
const DEFAULT_MAP_BITS: u32 = 10;

/// Upper bound on the map capacity exponent when growing is enabled. Beyond
/// this the cache falls back to clearing, keeping memory bounded.
const MAX_MAP_BITS: u32 = 20;

/// A translated basic block: a maximal straight-line instruction run ending
/// at a control-flow-affecting instruction or at the translator's buffer
/// limit.
#[derive(Debug)]
pub struct Block {
    /// Half-open virtual-address range `[pc_start, pc_end)` the block covers.
    pub pc_start: u32,
    pub pc_end: u32,
    /// Number of instructions included.
    pub instructions: u32,
    /// The raw instruction words in program order.
    code: Vec<u32>,
    /// Hint to the block most recently observed as the direct successor.
    /// Never followed without re-verifying `pc_start`, so staleness is
    /// harmless.
    predict: Option<Predict>,
}

impl Block {
    /// The raw instruction words in program order.
    pub fn code(&self) -> &[u32] {
        &self.code
    }
}

/// A non-owning reference to a predicted successor: a slot index valid only
/// for the generation of the map it was recorded against.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Predict {
    slot: usize,
    generation: u32,
}

/// Open-addressed hash table from block start pc to block.
///
/// The map owns its blocks; each block is owned exclusively by the slot it
/// sits in. Lookup mixes the key and probes linearly, stopping at the first
/// empty slot. The table is never rehashed in place: crossing the load
/// factor bound clears it wholesale, and [`enlarge`](Self::enlarge) builds a
/// doubled table. Both bump the generation, invalidating outstanding
/// predictor hints.
#[derive(Debug)]
pub struct BlockMap {
    bits: u32,
    size: u32,
    generation: u32,
    slots: Box<[Option<Box<Block>>]>,
}

impl BlockMap {
    /// Allocates an empty map with `1 << bits` slots.
    pub fn new(bits: u32) -> Self {
        let capacity = 1usize << bits;
        let mut slots = Vec::new();
        slots.resize_with(capacity, || None);
        Self {
            bits,
            size: 0,
            generation: 0,
            slots: slots.into_boxed_slice(),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> u32 {
        1 << self.bits
    }

    /// Number of blocks currently stored.
    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The current generation; bumped by [`clear`](Self::clear) and
    /// [`enlarge`](Self::enlarge).
    fn generation(&self) -> u32 {
        self.generation
    }

    fn block(&self, slot: usize) -> &Block {
        self.slots[slot].as_deref().expect("empty block map slot")
    }

    fn block_mut(&mut self, slot: usize) -> &mut Block {
        self.slots[slot].as_deref_mut().expect("empty block map slot")
    }

    /// Finds the slot holding the block starting at `pc_start`.
    pub fn lookup(&self, pc_start: u32) -> Option<usize> {
        let mask = self.capacity() as usize - 1;
        let mut index = hash(pc_start) as usize;
        loop {
            let slot = index & mask;
            match &self.slots[slot] {
                None => return None,
                Some(block) if block.pc_start == pc_start => return Some(slot),
                Some(_) => index += 1,
            }
        }
    }

    /// Places `block` in the first empty slot of its probe sequence and
    /// returns that slot.
    ///
    /// # Panics
    ///
    /// Panics if the map is full; callers maintain the load-factor bound.
    pub fn insert(&mut self, block: Box<Block>) -> usize {
        assert!(self.size < self.capacity(), "block map overfull");
        let mask = self.capacity() as usize - 1;
        let mut index = hash(block.pc_start) as usize;
        loop {
            let slot = index & mask;
            if self.slots[slot].is_none() {
                self.slots[slot] = Some(block);
                self.size += 1;
                return slot;
            }
            index += 1;
        }
    }

    /// Frees every block (and its code buffer) and empties all slots.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.size = 0;
        self.generation += 1;
    }

    /// Replaces the slot array by one of twice the capacity, reinserting all
    /// live blocks. The blocks themselves are reused, but their predictor
    /// hints die with the old generation.
    pub fn enlarge(&mut self) {
        let mut grown = Self::new(self.bits + 1);
        for slot in self.slots.iter_mut() {
            if let Some(block) = slot.take() {
                grown.insert(block);
            }
        }
        grown.generation = self.generation + 1;
        *self = grown;
    }
}

/// Multiplicative xor-shift mix of a block start pc.
fn hash(key: u32) -> u64 {
    let mut k = key as u64;
    k ^= k << 21;
    k ^= k >> 17;
    k ^= k >> 35;
    k ^= k >> 51;
    k
}

/// Per-run options for the block cache.
#[derive(Debug, Default, Clone)]
pub struct JitOptions {
    /// Log per-run translation statistics when the cache is dropped.
    pub report: bool,
    /// Double the block map (up to a fixed cap) when the load factor bound
    /// is crossed, instead of clearing it. Clearing is the default: a guest
    /// hot enough to fill the map usually also rewrites code, and dropping
    /// translations wholesale keeps the steady state small.
    pub grow_map: bool,
}

/// The per-hart block cache: the owning block map plus run options and
/// counters.
#[derive(Debug)]
pub struct BlockCache {
    map: BlockMap,
    options: JitOptions,
    translated: u64,
    hits: u64,
    evictions: u64,
    grows: u64,
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAP_BITS, JitOptions::default())
    }
}

impl BlockCache {
    pub fn new(bits: u32, options: JitOptions) -> Self {
        Self {
            map: BlockMap::new(bits),
            options,
            translated: 0,
            hits: 0,
            evictions: 0,
            grows: 0,
        }
    }

    pub fn options_mut(&mut self) -> &mut JitOptions {
        &mut self.options
    }

    pub fn map(&self) -> &BlockMap {
        &self.map
    }

    /// Drops every cached block, e.g. after the host rewrites guest code.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Looks up the block starting at `pc`, translating it on a miss.
    ///
    /// When the map crosses its load-factor bound (`size * 1.25 >
    /// capacity`), it is cleared wholesale rather than rehashed — or, with
    /// [`JitOptions::grow_map`], doubled until [`MAX_MAP_BITS`]. Either way
    /// the caller's chaining context dies with the old slot layout. If
    /// `prev` names the block executed just before, its predictor hint is
    /// pointed at the returned block.
    fn find_or_translate<S: SystemIo>(
        &mut self,
        io: &mut S,
        isa: &Isa,
        pc: u32,
        mut prev: Option<usize>,
    ) -> usize {
        let slot = match self.map.lookup(pc) {
            Some(slot) => {
                self.hits += 1;
                slot
            }
            None => {
                if self.map.len() as u64 * 5 > self.map.capacity() as u64 * 4 {
                    if self.options.grow_map && self.map.bits < MAX_MAP_BITS {
                        debug!(
                            "block map load factor exceeded ({} blocks), growing",
                            self.map.len()
                        );
                        self.map.enlarge();
                        self.grows += 1;
                    } else {
                        debug!(
                            "block map load factor exceeded ({} blocks), clearing",
                            self.map.len()
                        );
                        self.map.clear();
                        self.evictions += 1;
                    }
                    prev = None;
                }
                let block = translate(io, isa, pc);
                self.translated += 1;
                self.map.insert(block)
            }
        };
        if let Some(prev_slot) = prev {
            self.map.block_mut(prev_slot).predict = Some(Predict {
                slot,
                generation: self.map.generation(),
            });
        }
        slot
    }

    /// Follows `prev`'s predictor hint if it is current and actually starts
    /// at `pc`.
    fn predicted(&self, prev: Option<usize>, pc: u32) -> Option<usize> {
        let predict = self.map.block(prev?).predict?;
        if predict.generation != self.map.generation() {
            return None;
        }
        (self.map.block(predict.slot).pc_start == pc).then_some(predict.slot)
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if self.options.report {
            info!(
                translated = self.translated,
                hits = self.hits,
                evictions = self.evictions,
                grows = self.grows;
                "block cache statistics"
            );
        }
    }
}

/// Collects the straight-line run starting at `start_pc` into a new block.
///
/// Translation reads through the instruction-fetch path and stops after any
/// control-flow-affecting instruction (branches, jumps, ECALL/EBREAK/MRET)
/// or once the code buffer is full; a capacity-ended block is closed at the
/// last collected instruction, whose successor simply starts the next block.
/// An undecodable word is collected too and ends the block: executing it
/// raises the illegal-instruction trap exactly as the plain interpreter
/// would.
fn translate<S: SystemIo>(io: &mut S, isa: &Isa, start_pc: u32) -> Box<Block> {
    let mut code = Vec::with_capacity(BLOCK_CAPACITY);
    let mut pc_end = start_pc;
    loop {
        let raw = io.mem_ifetch(pc_end);
        match Instruction::decode(raw, isa) {
            Ok((instruction, length)) => {
                code.push(raw);
                pc_end = pc_end.wrapping_add(u32::from(length));
                if instruction.is_control_transfer() || code.len() >= BLOCK_CAPACITY {
                    break;
                }
            }
            Err(_) => {
                code.push(raw);
                pc_end = pc_end.wrapping_add(4);
                break;
            }
        }
    }
    trace!(
        "translated block {start_pc:#010x}..{pc_end:#010x} ({} instructions)",
        code.len()
    );
    Box::new(Block {
        pc_start: start_pc,
        pc_end,
        instructions: code.len() as u32,
        code,
        predict: None,
    })
}

impl<S: SystemIo> Hart<S> {
    /// Executes up to `cycles` instructions through the block cache.
    ///
    /// Semantically equivalent to driving [`step`](Self::step) in a loop:
    /// every completed block leaves the architectural state (registers,
    /// CSRs, memory, cycle counter) identical to running the same
    /// instructions one at a time. Unlike `step`, the loop continues across
    /// control transfers, chaining through verified predictor hints, until
    /// the cycle budget is exhausted or `halt` is observed.
    pub fn step_blocks(&mut self, cycles: u32) {
        let (state, io, jit) = self.split_for_jit();
        let isa = *state.isa();
        let cycles_target = state.csrs().cycle() + u64::from(cycles);
        let mut prev: Option<usize> = None;
        let mut prev_generation = jit.map.generation();
        while state.csrs().cycle() < cycles_target && !state.has_halted() {
            let pc = state.registers().pc();
            if state.breakpoint() == Some(pc) {
                io.on_ebreak(state);
                return;
            }
            if prev_generation != jit.map.generation() {
                prev = None;
            }
            let slot = match jit.predicted(prev, pc) {
                Some(slot) => slot,
                None => jit.find_or_translate(&mut *io, &isa, pc, prev),
            };
            execute_block(state, io, jit.map.block(slot));
            prev = Some(slot);
            prev_generation = jit.map.generation();
        }
    }
}

/// Replays a block's recorded instruction words through the interpreter.
/// Stops at the first control transfer, trap, or halt request.
fn execute_block<S: SystemIo>(state: &mut HartState, io: &mut S, block: &Block) {
    trace!(
        "executing block {:#010x}..{:#010x}",
        block.pc_start,
        block.pc_end
    );
    for &raw in &block.code {
        if state.has_halted() {
            return;
        }
        let mut executor = Executor {
            state: &mut *state,
            io: &mut *io,
        };
        match executor.execute_raw(raw) {
            Ok(Flow::Next) => state.csrs_mut().increment_cycle(),
            Ok(Flow::Branch) => return,
            Err(exception) => {
                state.trap(exception);
                return;
            }
        }
    }
}
