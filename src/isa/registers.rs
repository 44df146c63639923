//! Data structures describing the registers in an ISA.
//!
//! Unlike a concrete backend, this crate never hardcodes a register name or
//! count (see spec's Open Question on the frame's callee-saved set): every
//! [`RegInfo`] is constructed at runtime from a caller-supplied table of
//! classes and registers, built once per architecture and then treated as
//! read-only for the lifetime of every [`Frame`](crate::frame::Frame) it
//! serves.

use cranelift_entity::{entity_impl, PrimaryMap};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;

/// Dense index identifying one physical register within a [`RegInfo`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PhysReg(u32);
entity_impl!(PhysReg, "p");

/// Dense index identifying one register class within a [`RegInfo`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct RegClassIndex(u32);
entity_impl!(RegClassIndex, "rc");

/// Dense index identifying a virtual register minted by a
/// [`Frame`](crate::frame::Frame).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct VReg(u32);
entity_impl!(VReg, "v");

/// A register reference as it appears in an instruction operand: either a
/// virtual register awaiting a color, or one pinned to a physical register
/// from the start (e.g. an argument or return-value register, or a
/// hardware-fixed register clobbered by a call).
///
/// `Register` implements `Ord` so that sets of registers (live-in/live-out,
/// `live_regs_over`) can be iterated in a deterministic order, matching the
/// determinism testable property in spec.md §8.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Register {
    /// A virtual register minted by `Frame::new_virtual_register`.
    Virtual(VReg),
    /// A register pinned to a specific physical register.
    Precolored(PhysReg),
}

impl Register {
    /// True iff this register is pinned to a physical register from the
    /// start.
    pub fn is_precolored(self) -> bool {
        matches!(self, Register::Precolored(_))
    }

    /// The physical register this reference is pinned to, if any.
    pub fn precolored(self) -> Option<PhysReg> {
        match self {
            Register::Precolored(p) => Some(p),
            Register::Virtual(_) => None,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Register::Virtual(v) => write!(f, "%{}", v),
            Register::Precolored(p) => write!(f, "${}", p),
        }
    }
}

/// One physical register, as reported by the architecture descriptor.
#[derive(Clone, Debug)]
pub struct PhysRegDesc {
    /// Caller-chosen id, unique within the table passed to `RegInfo::new`.
    /// Becomes this register's [`PhysReg`] index (registers are renumbered
    /// densely in the order they appear in `registers`, not by this id).
    pub id: u16,
    /// Debug name, e.g. `"r0"`.
    pub name: String,
    /// Other physical registers (named by `id`) that overlap this one in
    /// storage. Does not need to include `id` itself or be symmetric;
    /// `RegInfo::new` makes the alias relation reflexive and symmetric.
    pub aliases: Vec<u16>,
}

/// One register class, as reported by the architecture descriptor.
pub struct RegClassDesc {
    /// Debug name, e.g. `"gpr"`.
    pub name: String,
    /// The class this is an (immediate) subclass of, if any. Subclass edges
    /// must form a forest: a class may have at most one parent, but two
    /// classes with no ancestor/descendant relationship are incomparable
    /// (spec.md §3: "either A⊆B, B⊆A, or they are incomparable").
    pub parent: Option<RegClassIndex>,
    /// Registers (named by `id` from the `registers` table) belonging to
    /// this class, in the order color assignment should try them.
    pub registers: Vec<u16>,
}

/// Immutable description of one register class, precomputed by
/// `RegInfo::new`.
#[derive(Clone, Debug)]
pub struct RegClassData {
    /// Debug name.
    pub name: String,
    /// `K`: the number of distinct colors available in this class.
    pub k: u32,
    /// Registers belonging to this class, densely indexed.
    pub regs: Vec<PhysReg>,
    /// Bitmask of subclasses of this class, including itself. Bit `i` is
    /// set iff the class with index `i` is a subclass of this one. Mirrors
    /// `cranelift_codegen`'s own `RegClassData::subclasses` trick: a
    /// precomputed bitmask turns `has_subclass`/`common_class` into O(1)
    /// bit tests instead of lattice walks.
    pub subclasses: u32,
}

impl RegClassData {
    /// True iff `other` names a subclass of `self` (a class is considered a
    /// subclass of itself).
    pub fn has_subclass(&self, other: RegClassIndex) -> bool {
        debug_assert!(
            other.index() < 32,
            "RegInfo supports at most 32 register classes"
        );
        self.subclasses & (1 << other.index()) != 0
    }
}

impl fmt::Display for RegClassData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Read-only, runtime-built description of an architecture's registers.
///
/// Built once per architecture (not per function/frame) from a caller
/// supplied table, exactly like `ppci`'s `GraphColoringRegisterAllocator`
/// precomputes `self.alias`/`self.K` in its constructor rather than per
/// `alloc_frame` call. Every query (`q`, `common_class`, `aliases`) is then
/// either an O(1) table lookup or a precomputed matrix read, so `RegInfo`
/// can be shared read-only (e.g. via `Arc`) across frames allocated in
/// parallel on different threads.
#[derive(Clone)]
pub struct RegInfo {
    classes: PrimaryMap<RegClassIndex, RegClassData>,
    reg_names: PrimaryMap<PhysReg, String>,
    aliases: PrimaryMap<PhysReg, SmallVec<[PhysReg; 4]>>,
    /// The most specific class each physical register naturally belongs to,
    /// used to classify pre-colored nodes (spec.md §4.4.3: a node's own
    /// class `B`; for a pre-colored register that class is whichever
    /// declared class has the fewest members, i.e. is most specific).
    natural_class: PrimaryMap<PhysReg, RegClassIndex>,
    /// `q(B, C) = max over r in regs(C) of |aliases(r) cap regs(B)|`,
    /// indexed `[B.index()][C.index()]`, precomputed once in `new`.
    q_table: Vec<Vec<u32>>,
    id_to_reg: HashMap<u16, PhysReg>,
}

impl RegInfo {
    /// Build a `RegInfo` from an architecture's class and register tables.
    ///
    /// `classes` must list parent classes before their subclasses (a
    /// `RegClassDesc::parent` must already have been pushed). Panics if a
    /// `registers` alias or a `classes` member names an unknown `id`, or if
    /// more than 32 classes are supplied (see `RegClassData::subclasses`).
    pub fn new(registers: &[PhysRegDesc], classes: &[RegClassDesc]) -> RegInfo {
        assert!(
            classes.len() <= 32,
            "RegInfo supports at most 32 register classes, got {}",
            classes.len()
        );

        let mut reg_names = PrimaryMap::new();
        let mut id_to_reg = HashMap::new();
        for desc in registers {
            let reg = reg_names.push(desc.name.clone());
            let prev = id_to_reg.insert(desc.id, reg);
            assert!(prev.is_none(), "duplicate register id {}", desc.id);
        }

        let mut aliases: PrimaryMap<PhysReg, SmallVec<[PhysReg; 4]>> = PrimaryMap::new();
        for _ in 0..reg_names.len() {
            aliases.push(SmallVec::new());
        }
        for desc in registers {
            let reg = id_to_reg[&desc.id];
            if !aliases[reg].contains(&reg) {
                aliases[reg].push(reg);
            }
            for &other_id in &desc.aliases {
                let other = *id_to_reg
                    .get(&other_id)
                    .unwrap_or_else(|| panic!("unknown aliased register id {}", other_id));
                if !aliases[reg].contains(&other) {
                    aliases[reg].push(other);
                }
                if !aliases[other].contains(&reg) {
                    aliases[other].push(reg);
                }
            }
        }

        let mut class_data: PrimaryMap<RegClassIndex, RegClassData> = PrimaryMap::new();
        for desc in classes {
            let regs: Vec<PhysReg> = desc
                .registers
                .iter()
                .map(|id| {
                    *id_to_reg
                        .get(id)
                        .unwrap_or_else(|| panic!("unknown register id {} in class", id))
                })
                .collect();
            let index = class_data.len();
            class_data.push(RegClassData {
                name: desc.name.clone(),
                k: regs.len() as u32,
                regs,
                subclasses: 1 << index,
            });
        }
        // Propagate each class's subclass bits up into every ancestor.
        // Classes only know their immediate parent, and parents are listed
        // before children, so visiting children before their own parents —
        // i.e. a single descending pass over indices — is enough: by the
        // time a class's bits are pushed up to its parent, that class has
        // already accumulated every bit from its own descendants.
        for (idx, desc) in classes.iter().enumerate().rev() {
            if let Some(parent) = desc.parent {
                let child_mask = class_data[RegClassIndex::new(idx)].subclasses;
                class_data[parent].subclasses |= child_mask;
            }
        }

        // Pick, for every physical register, the smallest (most specific)
        // class that contains it.
        let mut natural_class: PrimaryMap<PhysReg, RegClassIndex> =
            PrimaryMap::with_capacity(reg_names.len());
        for _ in 0..reg_names.len() {
            natural_class.push(RegClassIndex::new(0));
        }
        let mut seen: Vec<bool> = vec![false; reg_names.len()];
        for reg in reg_names.keys() {
            let mut best: Option<RegClassIndex> = None;
            for (ci, data) in class_data.iter() {
                if data.regs.contains(&reg) {
                    best = match best {
                        None => Some(ci),
                        Some(b) if data.regs.len() < class_data[b].regs.len() => Some(ci),
                        Some(b) => Some(b),
                    };
                }
            }
            if let Some(ci) = best {
                natural_class[reg] = ci;
                seen[reg.index()] = true;
            }
        }
        assert!(
            seen.iter().all(|&s| s),
            "every physical register must belong to at least one register class"
        );

        let n = class_data.len();
        let mut q_table = vec![vec![0u32; n]; n];
        for (bi, b) in class_data.iter() {
            for (ci, c) in class_data.iter() {
                let mut worst = 0u32;
                for &r in &c.regs {
                    let blocked = aliases[r].iter().filter(|a| b.regs.contains(a)).count() as u32;
                    worst = worst.max(blocked);
                }
                q_table[bi.index()][ci.index()] = worst;
            }
        }

        RegInfo {
            classes: class_data,
            reg_names,
            aliases,
            natural_class,
            q_table,
            id_to_reg,
        }
    }

    /// Look up a physical register by the caller-chosen id it was built
    /// with.
    pub fn reg_by_id(&self, id: u16) -> Option<PhysReg> {
        self.id_to_reg.get(&id).copied()
    }

    /// The class data for `idx`.
    pub fn class(&self, idx: RegClassIndex) -> &RegClassData {
        &self.classes[idx]
    }

    /// Number of register classes described by this `RegInfo`.
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// `K(class)`: the number of distinct colors available.
    pub fn k(&self, class: RegClassIndex) -> u32 {
        self.classes[class].k
    }

    /// The registers belonging to `class`.
    pub fn regs(&self, class: RegClassIndex) -> &[PhysReg] {
        &self.classes[class].regs
    }

    /// Debug name of a physical register.
    pub fn reg_name(&self, reg: PhysReg) -> &str {
        &self.reg_names[reg]
    }

    /// The full (reflexive, symmetric) alias set of `reg`, including `reg`
    /// itself.
    pub fn aliases(&self, reg: PhysReg) -> &[PhysReg] {
        &self.aliases[reg]
    }

    /// The most specific class `reg` naturally belongs to. Used to classify
    /// pre-colored nodes, whose `reg_class` is not supplied explicitly the
    /// way a virtual register's is.
    pub fn natural_class(&self, reg: PhysReg) -> RegClassIndex {
        self.natural_class[reg]
    }

    /// `q(b, c)`: the worst-case number of class-`b` physical registers any
    /// single class-`c` register can block (spec.md §4.4.3's pq-test).
    pub fn q(&self, b: RegClassIndex, c: RegClassIndex) -> u32 {
        self.q_table[b.index()][c.index()]
    }

    /// The smaller of two classes by the subclass lattice (spec.md §4.4.4's
    /// `common_class`): the one that is a subclass of the other. Returns
    /// `None` if the classes are incomparable, which callers should turn
    /// into `AllocError::ClassMismatch`.
    pub fn common_class(&self, a: RegClassIndex, b: RegClassIndex) -> Option<RegClassIndex> {
        if a == b {
            Some(a)
        } else if self.classes[b].has_subclass(a) {
            Some(a)
        } else if self.classes[a].has_subclass(b) {
            Some(b)
        } else {
            None
        }
    }

    /// True iff `sub` names a subclass of `sup` (or `sub == sup`).
    pub fn is_subclass(&self, sub: RegClassIndex, sup: RegClassIndex) -> bool {
        self.classes[sup].has_subclass(sub)
    }
}
