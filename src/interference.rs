//! The interference graph: nodes are equivalence classes of registers that
//! must share a physical assignment; edges mean "cannot share a color"
//! (spec.md §4.2).
//!
//! Like [`FlowGraph`](crate::flowgraph::FlowGraph), nodes live by stable
//! index into a flat arena (spec.md §9's design note on cyclic structures),
//! which is what makes masking and combining cheap: neither operation ever
//! moves or reallocates a `NodeData`, it only flips a flag or redirects
//! edges.

use crate::flowgraph::FlowGraph;
use crate::frame::{Frame, Instruction};
use crate::isa::registers::{PhysReg, RegClassIndex, RegInfo, Register};
use cranelift_entity::{entity_impl, PrimaryMap};
use smallvec::SmallVec;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::flowgraph::InstIndex;

/// Dense index identifying one node in an [`InterferenceGraph`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct NodeIndex(u32);
entity_impl!(NodeIndex, "ig");

#[derive(Clone)]
struct NodeData {
    temps: SmallVec<[Register; 2]>,
    color: Option<PhysReg>,
    reg_class: RegClassIndex,
    adjacent: HashSet<NodeIndex>,
    moves: BTreeSet<InstIndex>,
    is_colored: bool,
    masked: bool,
    retired: bool,
}

/// Interference graph for one frame's instruction list, built once per
/// [`crate::allocator::Allocator::alloc_frame`] call from a computed
/// [`FlowGraph`].
#[derive(Clone)]
pub struct InterferenceGraph {
    nodes: PrimaryMap<NodeIndex, NodeData>,
    reg_to_node: HashMap<Register, NodeIndex>,
}

impl InterferenceGraph {
    /// Build the interference graph for `frame`'s instruction list, given
    /// its already-computed [`FlowGraph`].
    ///
    /// One node is created per distinct register appearing anywhere in the
    /// instruction list (either as a use or a def); pre-colored registers
    /// become pre-colored nodes, already assigned their own color. For each
    /// instruction that defines `D` with live-out set `L` (spec.md §4.2
    /// resolves "the current live set" to exactly the already-computed
    /// `live_out`, since the backward recurrence that builds it is the same
    /// recurrence the spec describes maintaining by hand), an edge is added
    /// between every `d` in `D` and every `l` in `L \ {d}` — except for a
    /// move `d <- s`, where the edge `(d, s)` is skipped so the move remains
    /// coalescable.
    pub fn build<I: Instruction>(cfg: &FlowGraph, frame: &Frame<I>, reg_info: &RegInfo) -> Self {
        let mut nodes: PrimaryMap<NodeIndex, NodeData> = PrimaryMap::new();
        let mut reg_to_node: HashMap<Register, NodeIndex> = HashMap::new();

        let mut get_or_create = |reg: Register,
                                  nodes: &mut PrimaryMap<NodeIndex, NodeData>,
                                  reg_to_node: &mut HashMap<Register, NodeIndex>|
         -> NodeIndex {
            if let Some(&n) = reg_to_node.get(&reg) {
                return n;
            }
            let (is_colored, color, reg_class) = match reg {
                Register::Precolored(p) => (true, Some(p), reg_info.natural_class(p)),
                Register::Virtual(v) => (false, None, frame.vreg_class(v)),
            };
            let n = nodes.push(NodeData {
                temps: SmallVec::from_elem(reg, 1),
                color,
                reg_class,
                adjacent: HashSet::new(),
                moves: BTreeSet::new(),
                is_colored,
                masked: false,
                retired: false,
            });
            reg_to_node.insert(reg, n);
            n
        };

        for inst in &frame.instructions {
            for &r in inst.used_registers() {
                get_or_create(r, &mut nodes, &mut reg_to_node);
            }
            for &r in inst.defined_registers() {
                get_or_create(r, &mut nodes, &mut reg_to_node);
            }
        }

        let mut graph = InterferenceGraph { nodes, reg_to_node };

        for (i, inst) in frame.instructions.iter().enumerate() {
            let idx = InstIndex::new(i);
            let live = cfg.live_out(idx);
            let skip = if inst.is_move() {
                inst.used_registers().first().copied()
            } else {
                None
            };
            for &d in inst.defined_registers() {
                let dn = graph.get_node(d);
                for &l in live {
                    if Some(l) == skip || l == d {
                        continue;
                    }
                    let ln = graph.get_node(l);
                    graph.add_edge(dn, ln);
                }
            }
        }

        graph
    }

    fn add_edge(&mut self, a: NodeIndex, b: NodeIndex) {
        if a == b {
            return;
        }
        self.nodes[a].adjacent.insert(b);
        self.nodes[b].adjacent.insert(a);
    }

    /// The node currently representing `reg` (after any combines that
    /// subsumed it).
    pub fn get_node(&self, reg: Register) -> NodeIndex {
        self.reg_to_node[&reg]
    }

    /// Every node still live in the graph (not retired by a combine),
    /// in index order for deterministic iteration.
    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.nodes
            .keys()
            .filter(move |&n| !self.nodes[n].retired)
    }

    /// True iff `n` originated as a pre-colored (physical) register.
    pub fn is_colored(&self, n: NodeIndex) -> bool {
        self.nodes[n].is_colored
    }

    /// True iff `n` has been retired by a `combine` (merged into another
    /// node).
    pub fn is_retired(&self, n: NodeIndex) -> bool {
        self.nodes[n].retired
    }

    /// The current register class of `n`.
    pub fn reg_class(&self, n: NodeIndex) -> RegClassIndex {
        self.nodes[n].reg_class
    }

    /// Narrow `n`'s register class (spec.md §4.2: "u.reg_class is narrowed
    /// on combine").
    pub fn set_reg_class(&mut self, n: NodeIndex, class: RegClassIndex) {
        self.nodes[n].reg_class = class;
    }

    /// The color assigned to `n`, if any.
    pub fn color(&self, n: NodeIndex) -> Option<PhysReg> {
        self.nodes[n].color
    }

    /// Assign `n` a color (used by `assignColors`; never overwrites a
    /// pre-colored node's color since those already have one set at
    /// construction).
    pub fn set_color(&mut self, n: NodeIndex, color: PhysReg) {
        self.nodes[n].color = Some(color);
    }

    /// The set of original registers `n` represents (singleton until
    /// combined with others).
    pub fn temps(&self, n: NodeIndex) -> &[Register] {
        &self.nodes[n].temps
    }

    /// The move instructions touching `n`.
    pub fn moves(&self, n: NodeIndex) -> impl Iterator<Item = InstIndex> + '_ {
        self.nodes[n].moves.iter().copied()
    }

    /// Record that move instruction `m` touches node `n` (spec.md §4.4.1's
    /// build: "for every move instruction, attach it to both endpoints'
    /// moves set").
    pub fn attach_move(&mut self, n: NodeIndex, m: InstIndex) {
        self.nodes[n].moves.insert(m);
    }

    /// `n`'s neighbors, excluding any that are currently masked. Masking a
    /// node hides it from every other node's adjacency view without
    /// touching its own storage (spec.md §4.2).
    pub fn adjacent(&self, n: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.nodes[n]
            .adjacent
            .iter()
            .copied()
            .filter(move |&m| !self.nodes[m].masked)
    }

    /// Symmetric edge query; an edge to or from a masked node is invisible.
    pub fn has_edge(&self, a: NodeIndex, b: NodeIndex) -> bool {
        if self.nodes[a].masked || self.nodes[b].masked {
            return false;
        }
        self.nodes[a].adjacent.contains(&b)
    }

    /// Temporarily remove `n` from adjacency views (simplify).
    pub fn mask_node(&mut self, n: NodeIndex) {
        self.nodes[n].masked = true;
    }

    /// Restore `n` to adjacency views (assignColors).
    pub fn unmask_node(&mut self, n: NodeIndex) {
        self.nodes[n].masked = false;
    }

    /// Destructively merge `v` into `u`: `u`'s temps, moves and edges absorb
    /// `v`'s, and `v` is retired. No edge between `u` and `v` may pre-exist
    /// (spec.md §4.2's precondition on `combine`).
    ///
    /// Does not touch `reg_class`; the allocator narrows that separately via
    /// [`InterferenceGraph::set_reg_class`] once it has computed the common
    /// class (which can fail with `ClassMismatch`, a condition this method
    /// has no way to report).
    pub fn combine(&mut self, u: NodeIndex, v: NodeIndex) {
        debug_assert!(u != v, "combine called with the same node twice");
        debug_assert!(
            !self.nodes[u].adjacent.contains(&v),
            "combine called on interfering nodes"
        );

        for &reg in &self.nodes[v].temps.clone() {
            self.reg_to_node.insert(reg, u);
        }
        let v_temps = std::mem::take(&mut self.nodes[v].temps);
        self.nodes[u].temps.extend(v_temps);

        let v_moves = std::mem::take(&mut self.nodes[v].moves);
        self.nodes[u].moves.extend(v_moves);

        let v_adjacent: Vec<NodeIndex> = self.nodes[v].adjacent.drain().collect();
        for t in v_adjacent {
            if t == u {
                continue;
            }
            self.nodes[t].adjacent.remove(&v);
            self.nodes[t].adjacent.insert(u);
            self.nodes[u].adjacent.insert(t);
        }

        self.nodes[v].retired = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowgraph::FlowGraph;
    use crate::frame::{Frame, FrameConfig};
    use crate::isa::registers::{PhysRegDesc, RegClassDesc, VReg};
    use std::rc::Rc;

    fn gpr3() -> RegInfo {
        let regs: Vec<PhysRegDesc> = (0..3)
            .map(|i| PhysRegDesc {
                id: i,
                name: format!("r{}", i),
                aliases: vec![],
            })
            .collect();
        let classes = vec![RegClassDesc {
            name: "gpr".into(),
            parent: None,
            registers: vec![0, 1, 2],
        }];
        RegInfo::new(&regs, &classes)
    }

    fn gpr_class() -> RegClassIndex {
        RegClassIndex::new(0)
    }

    struct MockInst {
        uses: Vec<Register>,
        defs: Vec<Register>,
        is_move: bool,
    }

    impl Instruction for MockInst {
        fn used_registers(&self) -> &[Register] {
            &self.uses
        }
        fn defined_registers(&self) -> &[Register] {
            &self.defs
        }
        fn is_move(&self) -> bool {
            self.is_move
        }
        fn successors(&self) -> Option<&[usize]> {
            None
        }
        fn rewrite_registers(&mut self, _colors: &HashMap<Register, PhysReg>) {}
    }

    fn vreg(i: u32) -> Register {
        Register::Virtual(VReg::from_u32(i))
    }

    #[test]
    fn independent_defs_interfere_when_simultaneously_live() {
        let info = gpr3();
        let mut frame: Frame<MockInst> = Frame::new("f", Rc::new(info), FrameConfig::default());
        let class = gpr_class();
        let v0 = frame.new_virtual_register(class);
        let v1 = frame.new_virtual_register(class);
        assert_eq!(v0, vreg(0));
        frame.instructions.push(MockInst {
            uses: vec![],
            defs: vec![v0],
            is_move: false,
        });
        frame.instructions.push(MockInst {
            uses: vec![],
            defs: vec![v1],
            is_move: false,
        });
        frame.instructions.push(MockInst {
            uses: vec![v0, v1],
            defs: vec![],
            is_move: false,
        });
        let cfg = FlowGraph::compute(&frame.instructions).unwrap();
        let ig = InterferenceGraph::build(&cfg, &frame, frame.reg_info());
        let n0 = ig.get_node(v0);
        let n1 = ig.get_node(v1);
        assert!(ig.has_edge(n0, n1));
    }

    #[test]
    fn move_does_not_interfere_with_its_own_source() {
        let info = gpr3();
        let mut frame: Frame<MockInst> = Frame::new("f", Rc::new(info), FrameConfig::default());
        let class = gpr_class();
        let v0 = frame.new_virtual_register(class);
        let v1 = frame.new_virtual_register(class);
        frame.instructions.push(MockInst {
            uses: vec![],
            defs: vec![v0],
            is_move: false,
        });
        frame.instructions.push(MockInst {
            uses: vec![v0],
            defs: vec![v1],
            is_move: true,
        });
        frame.instructions.push(MockInst {
            uses: vec![v1],
            defs: vec![],
            is_move: false,
        });
        let cfg = FlowGraph::compute(&frame.instructions).unwrap();
        let ig = InterferenceGraph::build(&cfg, &frame, frame.reg_info());
        let n0 = ig.get_node(v0);
        let n1 = ig.get_node(v1);
        assert!(!ig.has_edge(n0, n1));
    }

    #[test]
    fn mask_hides_node_from_adjacency() {
        let info = gpr3();
        let mut frame: Frame<MockInst> = Frame::new("f", Rc::new(info), FrameConfig::default());
        let class = gpr_class();
        let v0 = frame.new_virtual_register(class);
        let v1 = frame.new_virtual_register(class);
        frame.instructions.push(MockInst {
            uses: vec![],
            defs: vec![v0],
            is_move: false,
        });
        frame.instructions.push(MockInst {
            uses: vec![],
            defs: vec![v1],
            is_move: false,
        });
        frame.instructions.push(MockInst {
            uses: vec![v0, v1],
            defs: vec![],
            is_move: false,
        });
        let cfg = FlowGraph::compute(&frame.instructions).unwrap();
        let mut ig = InterferenceGraph::build(&cfg, &frame, frame.reg_info());
        let n0 = ig.get_node(v0);
        let n1 = ig.get_node(v1);
        assert!(ig.adjacent(n1).any(|n| n == n0));
        ig.mask_node(n0);
        assert!(!ig.adjacent(n1).any(|n| n == n0));
        assert!(!ig.has_edge(n0, n1));
        ig.unmask_node(n0);
        assert!(ig.adjacent(n1).any(|n| n == n0));
    }

    #[test]
    fn combine_merges_temps_edges_and_moves() {
        let info = gpr3();
        let mut frame: Frame<MockInst> = Frame::new("f", Rc::new(info), FrameConfig::default());
        let class = gpr_class();
        let v0 = frame.new_virtual_register(class);
        let v1 = frame.new_virtual_register(class);
        let v2 = frame.new_virtual_register(class);
        frame.instructions.push(MockInst {
            uses: vec![],
            defs: vec![v0],
            is_move: false,
        });
        frame.instructions.push(MockInst {
            uses: vec![v0],
            defs: vec![v1],
            is_move: true,
        });
        frame.instructions.push(MockInst {
            uses: vec![],
            defs: vec![v2],
            is_move: false,
        });
        frame.instructions.push(MockInst {
            uses: vec![v1, v2],
            defs: vec![],
            is_move: false,
        });
        let cfg = FlowGraph::compute(&frame.instructions).unwrap();
        let mut ig = InterferenceGraph::build(&cfg, &frame, frame.reg_info());
        let n0 = ig.get_node(v0);
        let n1 = ig.get_node(v1);
        let n2 = ig.get_node(v2);
        assert!(ig.has_edge(n1, n2));
        assert!(!ig.has_edge(n0, n2));
        ig.combine(n0, n1);
        assert!(ig.is_retired(n1));
        assert_eq!(ig.get_node(v1), n0);
        assert!(ig.temps(n0).contains(&v0));
        assert!(ig.temps(n0).contains(&v1));
        assert!(ig.has_edge(n0, n2));
    }
}
