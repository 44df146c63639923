//! The machine-frame abstraction the allocator drives (spec.md §4.3).
//!
//! A `Frame` is a per-function container: the instruction list the
//! allocator rewrites in place, the virtual-register factory, the stack
//! slot map, the literal pool, and the lazy-sequence hooks
//! (`prologue`/`epilogue`/`make_call`) a frame-aware code generator uses to
//! wrap a function body. The allocator itself only ever touches
//! `instructions`, `new_virtual_register`'s bookkeeping, and
//! `live_regs_over`; everything else here is a pure codegen convenience the
//! allocator treats as an opaque sink (spec.md §4.3).

use crate::flowgraph::{FlowGraph, InstIndex};
use crate::interference::InterferenceGraph;
use crate::isa::registers::{PhysReg, RegClassIndex, RegInfo, VReg};
pub use crate::isa::registers::Register;
use std::collections::HashMap;
use std::rc::Rc;

/// Configuration for a [`Frame`]: the crate's entire configuration surface
/// (spec.md §6: "No CLI, no file format, no wire protocol").
#[derive(Clone, Copy, Debug)]
pub struct FrameConfig {
    /// Alignment, in bytes, the literal pool is padded to before and after
    /// emission (spec.md §4.3: "aligned to a natural boundary (typically 4
    /// bytes)").
    pub literal_pool_align: u32,
    /// Alignment, in bytes, stack slots are rounded up to.
    pub stack_align: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        FrameConfig {
            literal_pool_align: 4,
            stack_align: 4,
        }
    }
}

/// An opaque instruction operand list plus the control-flow and move
/// metadata the allocator needs; the opcode itself is never inspected by
/// this crate (spec.md §3: "opaque opcode data").
pub trait Instruction {
    /// Registers this instruction reads.
    fn used_registers(&self) -> &[Register];
    /// Registers this instruction writes.
    fn defined_registers(&self) -> &[Register];
    /// True iff this is a register-to-register move with exactly one use
    /// and one def (spec.md §3).
    fn is_move(&self) -> bool;
    /// Explicit control-flow successors, by index into the instruction
    /// list. `None` means "falls through to the next instruction in
    /// program order"; `Some(&[..])` means exactly those targets and
    /// nothing else — a conditional branch that also falls through must
    /// list the fall-through index itself (DESIGN.md's resolution of
    /// spec.md §4.1's Open Question).
    fn successors(&self) -> Option<&[usize]>;
    /// Rewrite every register this instruction mentions to the physical
    /// color `colors` assigns it. Called once per instruction, after
    /// coloring, with every register in the frame already present in
    /// `colors` (including pre-colored ones, mapped to themselves).
    fn rewrite_registers(&mut self, colors: &HashMap<Register, PhysReg>);
}

/// A literal pool value. Values compare structurally, so `add_constant`
/// dedups on content rather than identity (spec.md §4.3).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConstValue {
    /// An integer literal.
    Int(i64),
    /// A string literal.
    Str(String),
    /// A byte-sequence literal.
    Bytes(Vec<u8>),
}

/// One decision a `Frame`'s lazy sequences (`prologue`, `epilogue`,
/// `make_call`) yield. Per spec.md §9's design note ("the laziness is not
/// semantically required"), these are returned as a concrete `Vec` rather
/// than an actual lazy iterator; an out-of-scope encoder turns each event
/// into the concrete instruction(s) for its target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// Emit a label marking the function entry point.
    Label(String),
    /// Store `register` to the stack at `offset` bytes from the frame's
    /// save area, to preserve it across the function body or a call.
    SaveRegister {
        /// The register being preserved.
        register: Register,
        /// Offset, in bytes, from the save area's base.
        offset: i32,
    },
    /// Reload `register` from the stack at `offset`, undoing a prior
    /// `SaveRegister`.
    RestoreRegister {
        /// The register being restored.
        register: Register,
        /// Offset, in bytes, from the save area's base.
        offset: i32,
    },
    /// Adjust the stack pointer by `delta` bytes (negative reserves space,
    /// positive releases it, matching the usual "subtract to grow" stack
    /// convention).
    AdjustStack {
        /// Byte delta to apply to the stack pointer.
        delta: i32,
    },
    /// Set the frame pointer to the current stack pointer.
    SetupFramePointer,
    /// Emit the call itself, after caller-save stores and before
    /// caller-save reloads.
    Call {
        /// Callee name/label, opaque to this crate.
        target: String,
    },
    /// Pad the current position up to the configured literal pool
    /// alignment.
    LiteralPoolAlign,
    /// Emit one literal pool entry at `label`.
    ConstantLabel {
        /// The label `add_constant` returned for this value.
        label: String,
        /// The literal's value.
        value: ConstValue,
    },
}

/// Per-function container driving and driven by register allocation
/// (spec.md §4.3).
pub struct Frame<I: Instruction> {
    name: String,
    config: FrameConfig,
    reg_info: Rc<RegInfo>,
    /// The instruction list; the only field the allocator mutates.
    pub instructions: Vec<I>,
    vreg_classes: Vec<RegClassIndex>,
    stack_slots: HashMap<String, u32>,
    stack_size: u32,
    constants: Vec<(String, ConstValue)>,
    next_literal: u32,
    /// The control-flow graph built by the most recent `alloc_frame` call,
    /// kept for inspection (spec.md §6).
    pub cfg: Option<FlowGraph>,
    /// The interference graph built by the most recent `alloc_frame` call,
    /// kept for inspection (spec.md §6).
    pub ig: Option<InterferenceGraph>,
}

impl<I: Instruction> Frame<I> {
    /// Create an empty frame for function `name`, targeting the registers
    /// described by `reg_info`.
    pub fn new(name: impl Into<String>, reg_info: Rc<RegInfo>, config: FrameConfig) -> Self {
        Frame {
            name: name.into(),
            config,
            reg_info,
            instructions: Vec::new(),
            vreg_classes: Vec::new(),
            stack_slots: HashMap::new(),
            stack_size: 0,
            constants: Vec::new(),
            next_literal: 0,
            cfg: None,
            ig: None,
        }
    }

    /// This frame's function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The architecture descriptor this frame targets.
    pub fn reg_info(&self) -> &RegInfo {
        &self.reg_info
    }

    /// A clone of the shared architecture descriptor handle, for callers
    /// (e.g. [`crate::allocator::Allocator::new`]) that need their own
    /// reference-counted copy.
    pub fn reg_info_rc(&self) -> Rc<RegInfo> {
        Rc::clone(&self.reg_info)
    }

    /// Mint a fresh virtual register in `class` (spec.md §4.3).
    pub fn new_virtual_register(&mut self, class: RegClassIndex) -> Register {
        let v = VReg::new(self.vreg_classes.len());
        self.vreg_classes.push(class);
        Register::Virtual(v)
    }

    /// The class a virtual register was minted with.
    pub fn vreg_class(&self, v: VReg) -> RegClassIndex {
        self.vreg_classes[v.index()]
    }

    /// Deterministic stack-offset allocator: repeated calls with the same
    /// `key` return the same offset; `size` (in bytes) is accumulated into
    /// the frame's total stack size (spec.md §4.3).
    pub fn alloc_var(&mut self, key: impl Into<String>, size: u32) -> u32 {
        let key = key.into();
        if let Some(&offset) = self.stack_slots.get(&key) {
            return offset;
        }
        let align = self.config.stack_align.max(1);
        let offset = round_up(self.stack_size, align);
        self.stack_slots.insert(key, offset);
        self.stack_size = offset + size;
        offset
    }

    /// Total stack size accumulated by `alloc_var` so far.
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    /// Intern a literal in the pool, returning a stable label. Values
    /// compare structurally: interning the same value twice returns the
    /// same label (spec.md §4.3).
    pub fn add_constant(&mut self, value: ConstValue) -> String {
        for (label, existing) in &self.constants {
            if existing == &value {
                return label.clone();
            }
        }
        let label = format!("{}_literal_{}", self.name, self.next_literal);
        self.next_literal += 1;
        self.constants.push((label.clone(), value));
        label
    }

    /// Drain the literal pool into a sequence of events, padding first if
    /// there is anything to emit (spec.md §4.3; `ppci`'s `litpool`, which
    /// this is grounded on, is called at both `between_blocks` and the very
    /// end of `epilogue`, so the pool can legitimately be drained more than
    /// once per frame).
    pub fn literal_pool(&mut self) -> Vec<FrameEvent> {
        if self.constants.is_empty() {
            return Vec::new();
        }
        let mut events = vec![FrameEvent::LiteralPoolAlign];
        for (label, value) in self.constants.drain(..) {
            events.push(FrameEvent::ConstantLabel { label, value });
        }
        events
    }

    /// The lazy (here: eagerly materialized) prologue sequence: a function
    /// label, saves for every `callee_saved` register live across the body,
    /// stack reservation, and frame-pointer setup (spec.md §4.3, §9's Open
    /// Question — resolved in DESIGN.md by never hardcoding which registers
    /// are callee-saved; the caller supplies that set, typically by
    /// intersecting the architecture's callee-saved class with
    /// `live_regs_over` the function's entry/exit instructions).
    pub fn prologue(&self, callee_saved: &[Register]) -> Vec<FrameEvent> {
        let mut events = vec![FrameEvent::Label(self.name.clone())];
        let save_slot = self.config.stack_align.max(1) as i32;
        for (i, &reg) in callee_saved.iter().enumerate() {
            events.push(FrameEvent::SaveRegister {
                register: reg,
                offset: i as i32 * save_slot,
            });
        }
        if self.stack_size > 0 {
            events.push(FrameEvent::AdjustStack {
                delta: -(self.stack_size as i32),
            });
        }
        events.push(FrameEvent::SetupFramePointer);
        events
    }

    /// The lazy epilogue sequence: stack release, restores for every
    /// `callee_saved` register (in reverse save order), and the final
    /// literal pool (spec.md §4.3).
    pub fn epilogue(&mut self, callee_saved: &[Register]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        if self.stack_size > 0 {
            events.push(FrameEvent::AdjustStack {
                delta: self.stack_size as i32,
            });
        }
        let save_slot = self.config.stack_align.max(1) as i32;
        for (i, &reg) in callee_saved.iter().enumerate().rev() {
            events.push(FrameEvent::RestoreRegister {
                register: reg,
                offset: i as i32 * save_slot,
            });
        }
        events.extend(self.literal_pool());
        events
    }

    /// The lazy save/restore sequence wrapping a call at `call_site`,
    /// computed from `live_regs_over(call_site)` (spec.md §4.3): every
    /// live register is pushed before the call and popped in reverse order
    /// after, so that the callee is free to clobber it.
    pub fn make_call(&self, call_site: InstIndex, target: impl Into<String>) -> Vec<FrameEvent> {
        let live: Vec<Register> = self.live_regs_over(call_site).into_iter().collect();
        let slot = self.config.stack_align.max(1) as i32;
        let total = live.len() as i32 * slot;

        let mut events = Vec::new();
        if total > 0 {
            events.push(FrameEvent::AdjustStack { delta: -total });
        }
        for (i, &reg) in live.iter().enumerate() {
            events.push(FrameEvent::SaveRegister {
                register: reg,
                offset: i as i32 * slot,
            });
        }
        events.push(FrameEvent::Call {
            target: target.into(),
        });
        for (i, &reg) in live.iter().enumerate().rev() {
            events.push(FrameEvent::RestoreRegister {
                register: reg,
                offset: i as i32 * slot,
            });
        }
        if total > 0 {
            events.push(FrameEvent::AdjustStack { delta: total });
        }
        events
    }

    /// The registers live across `i` (spec.md §4.1): delegates to the
    /// `FlowGraph` computed by the most recent `alloc_frame` call.
    ///
    /// # Panics
    ///
    /// Panics if called before `alloc_frame` has computed a `FlowGraph` for
    /// this frame.
    pub fn live_regs_over(&self, i: InstIndex) -> std::collections::BTreeSet<Register> {
        self.cfg
            .as_ref()
            .expect("Frame::live_regs_over called before alloc_frame computed a FlowGraph")
            .live_regs_over(i)
    }
}

fn round_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}
