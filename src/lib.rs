//! Iterated register coalescing (IRC) register allocator core.
//!
//! This crate is the retargetable half of a compiler backend: given a
//! [`Frame`](frame::Frame) whose instruction list still references an
//! unbounded supply of virtual registers, [`Allocator::alloc_frame`]
//! produces an equivalent instruction list in which every register has been
//! replaced by a physical color, or fails with one of three fatal
//! [`AllocError`](error::AllocError) kinds.
//!
//! The pipeline is: an instruction list feeds [`flowgraph::FlowGraph`]
//! (control-flow + liveness), which feeds [`interference::InterferenceGraph`]
//! (interference edges + move relations), which the
//! [`allocator::Allocator`] drives through the Appel-George build / simplify
//! / coalesce / freeze / select loop, finally rewriting registers in place
//! via [`frame::Instruction::rewrite_registers`].
//!
//! Instruction selection, the assembler/encoder, and spilling are explicitly
//! out of scope; see each module's documentation for the contract it
//! expects from its neighbors.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use cranelift_entity as entity;

pub mod allocator;
pub mod error;
pub mod flowgraph;
pub mod frame;
pub mod interference;
pub mod isa;

pub use crate::allocator::Allocator;
pub use crate::error::{AllocError, AllocResult};
pub use crate::flowgraph::InstIndex;
pub use crate::frame::{ConstValue, Frame, FrameConfig, FrameEvent, Instruction, Register};
pub use crate::interference::NodeIndex;
pub use crate::isa::registers::{PhysReg, PhysRegDesc, RegClassDesc, RegClassIndex, RegInfo, VReg};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
