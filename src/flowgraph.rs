//! Control-flow graph construction and liveness analysis over a linear
//! instruction list (spec.md §4.1).
//!
//! Unlike a basic-block-granularity CFG, this one has a node per
//! *instruction*: the interference graph needs to walk the list maintaining
//! a running live set one instruction at a time (spec.md §4.2), and giving
//! every instruction its own live-in/live-out avoids recomputing that from
//! coarser block-level sets.

use crate::entity::{entity_impl, PrimaryMap};
use crate::error::{AllocError, AllocResult};
use crate::frame::Instruction;
use crate::isa::registers::Register;
use smallvec::SmallVec;
use std::collections::BTreeSet;

/// Dense index identifying one instruction within a [`FlowGraph`] (and,
/// doubling as a move identifier, within an
/// [`InterferenceGraph`](crate::interference::InterferenceGraph)).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct InstIndex(u32);
entity_impl!(InstIndex, "i");

#[derive(Clone, Default)]
struct Node {
    preds: SmallVec<[InstIndex; 2]>,
    succs: SmallVec<[InstIndex; 2]>,
    use_set: BTreeSet<Register>,
    def_set: BTreeSet<Register>,
    live_in: BTreeSet<Register>,
    live_out: BTreeSet<Register>,
}

/// Control-flow graph and live-in/live-out sets for one frame's instruction
/// list.
///
/// Built once per `alloc_frame` call and kept on the [`Frame`](crate::frame::Frame)
/// afterward purely for inspection (spec.md §6); the allocator itself never
/// mutates a `FlowGraph` once `compute` returns it.
#[derive(Clone, Default)]
pub struct FlowGraph {
    nodes: PrimaryMap<InstIndex, Node>,
}

impl FlowGraph {
    /// Build the control-flow graph and compute liveness for `instructions`.
    ///
    /// An instruction's [`Instruction::successors`] of `None` links it to
    /// the next instruction in program order (fall-through); `Some(&[..])`
    /// links it to exactly those instruction indices and nothing else (see
    /// DESIGN.md's resolution of the branch-successor Open Question).
    ///
    /// Fails with [`AllocError::MalformedCFG`] if a successor index is out
    /// of range.
    pub fn compute<I: Instruction>(instructions: &[I]) -> AllocResult<FlowGraph> {
        let len = instructions.len();
        let mut nodes: PrimaryMap<InstIndex, Node> = PrimaryMap::new();
        for inst in instructions {
            nodes.push(Node {
                use_set: inst.used_registers().iter().copied().collect(),
                def_set: inst.defined_registers().iter().copied().collect(),
                ..Node::default()
            });
        }

        for (i, inst) in instructions.iter().enumerate() {
            let idx = InstIndex::new(i);
            match inst.successors() {
                None => {
                    if i + 1 < len {
                        link(&mut nodes, idx, InstIndex::new(i + 1));
                    }
                }
                Some(targets) => {
                    for &t in targets {
                        if t >= len {
                            return Err(AllocError::MalformedCFG {
                                detail: format!(
                                    "instruction {} names unresolved successor {}",
                                    i, t
                                ),
                            });
                        }
                        link(&mut nodes, idx, InstIndex::new(t));
                    }
                }
            }
        }

        let mut graph = FlowGraph { nodes };
        graph.compute_liveness();
        Ok(graph)
    }

    /// Standard backward fixpoint (spec.md §4.1):
    /// `live_out(n) = U live_in(s)` over successors, `live_in(n) = use(n) U
    /// (live_out(n) \ def(n))`. Visiting in reverse instruction order tends
    /// to converge in the fewest passes for the common case of mostly
    /// forward control flow, but the iteration order has no bearing on
    /// correctness.
    fn compute_liveness(&mut self) {
        let len = self.nodes.len();
        loop {
            let mut changed = false;
            for i in (0..len).rev() {
                let idx = InstIndex::new(i);

                let mut live_out = BTreeSet::new();
                for &s in &self.nodes[idx].succs {
                    live_out.extend(self.nodes[s].live_in.iter().copied());
                }

                let mut live_in = self.nodes[idx].use_set.clone();
                live_in.extend(live_out.difference(&self.nodes[idx].def_set).copied());

                if live_in != self.nodes[idx].live_in || live_out != self.nodes[idx].live_out {
                    changed = true;
                }
                self.nodes[idx].live_in = live_in;
                self.nodes[idx].live_out = live_out;
            }
            if !changed {
                break;
            }
        }
    }

    /// The live-out set of instruction `i`.
    pub fn live_out(&self, i: InstIndex) -> &BTreeSet<Register> {
        &self.nodes[i].live_out
    }

    /// The live-in set of instruction `i`.
    pub fn live_in(&self, i: InstIndex) -> &BTreeSet<Register> {
        &self.nodes[i].live_in
    }

    /// The registers live across `i`: live both into and out of the
    /// instruction, minus whatever it defines (spec.md §4.1's
    /// `live_regs_over`, used by [`crate::frame::Frame::make_call`] to
    /// compute a call site's caller-save set). See DESIGN.md for why
    /// "live across" is resolved as this intersection rather than a union.
    pub fn live_regs_over(&self, i: InstIndex) -> BTreeSet<Register> {
        let node = &self.nodes[i];
        node.live_in
            .intersection(&node.live_out)
            .filter(|r| !node.def_set.contains(r))
            .copied()
            .collect()
    }

    /// Predecessors of instruction `i`.
    pub fn preds(&self, i: InstIndex) -> &[InstIndex] {
        &self.nodes[i].preds
    }

    /// Successors of instruction `i`.
    pub fn succs(&self, i: InstIndex) -> &[InstIndex] {
        &self.nodes[i].succs
    }

    /// Number of instructions (nodes) in this graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True iff this graph has no instructions.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn link(nodes: &mut PrimaryMap<InstIndex, Node>, from: InstIndex, to: InstIndex) {
    if !nodes[from].succs.contains(&to) {
        nodes[from].succs.push(to);
    }
    if !nodes[to].preds.contains(&from) {
        nodes[to].preds.push(from);
    }
}
