//! The instruction catalog and its operand-kind classification sets.
//!
//! The catalog is built once on first use and never mutated afterwards, so it
//! can be shared freely between builders.

use super::instruction::{Instruction, Opcode};
use rustc_hash::FxHashMap;
use std::sync::LazyLock;
use voodoo_core::{AssemblerError, AssemblerResult};

/// Instructions removed from the instruction set, with their replacements.
pub const RETIRED: &[(&str, &str)] = &[("STOP_CODE", "NOP"), ("STORE_MAP", "BUILD_MAP")];

/// Operand-kind classification of the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// Any operand at all (`hasarg`).
    Argument,
    /// Constant pool index (`hasconst`).
    Const,
    /// Name pool index (`hasname`).
    Name,
    /// Relative jump offset (`hasjrel`).
    RelativeJump,
    /// Absolute jump target (`hasjabs`).
    AbsoluteJump,
    /// Either jump kind (`hasjump`).
    Jump,
    /// Local slot (`haslocal`).
    Local,
    /// Cell or free variable slot (`hasfree`).
    Free,
    /// Comparison operator (`hascompare`).
    Compare,
}

impl OperandKind {
    /// Every classification.
    pub const ALL: [OperandKind; 9] = [
        OperandKind::Argument,
        OperandKind::Const,
        OperandKind::Name,
        OperandKind::RelativeJump,
        OperandKind::AbsoluteJump,
        OperandKind::Jump,
        OperandKind::Local,
        OperandKind::Free,
        OperandKind::Compare,
    ];

    /// Check whether an opcode falls into this classification.
    #[inline]
    pub const fn admits(self, opcode: Opcode) -> bool {
        match self {
            OperandKind::Argument => opcode.has_arg(),
            OperandKind::Const => opcode.has_const(),
            OperandKind::Name => opcode.has_name(),
            OperandKind::RelativeJump => opcode.has_jrel(),
            OperandKind::AbsoluteJump => opcode.has_jabs(),
            OperandKind::Jump => opcode.has_jump(),
            OperandKind::Local => opcode.has_local(),
            OperandKind::Free => opcode.has_free(),
            OperandKind::Compare => opcode.has_compare(),
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Read-only view of the full instruction set.
#[derive(Debug)]
pub struct InstructionCatalog {
    instructions: Vec<Instruction>,
    by_name: FxHashMap<&'static str, Instruction>,
    classes: [Vec<Instruction>; OperandKind::ALL.len()],
}

static CATALOG: LazyLock<InstructionCatalog> = LazyLock::new(InstructionCatalog::build);

/// The shared catalog.
#[inline]
pub fn catalog() -> &'static InstructionCatalog {
    &CATALOG
}

impl InstructionCatalog {
    fn build() -> Self {
        let instructions: Vec<Instruction> =
            Opcode::ALL.iter().copied().map(Instruction::new).collect();

        let by_name = instructions
            .iter()
            .map(|&inst| (inst.name(), inst))
            .collect();

        let classes = OperandKind::ALL.map(|kind| {
            instructions
                .iter()
                .copied()
                .filter(|inst| kind.admits(inst.opcode()))
                .collect()
        });

        Self {
            instructions,
            by_name,
            classes,
        }
    }

    /// All instructions, sorted by opcode.
    #[inline]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Number of instructions.
    #[inline]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// The catalog is never empty; present for API completeness.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Look up an instruction by name.
    pub fn opcode_for(&self, name: &str) -> AssemblerResult<Instruction> {
        self.get(name)
            .ok_or_else(|| AssemblerError::unknown_instruction(name))
    }

    /// Look up an instruction by name without raising.
    #[inline]
    pub fn get(&self, name: &str) -> Option<Instruction> {
        self.by_name.get(name).copied()
    }

    /// Reverse lookup.
    #[inline]
    pub fn name_for(&self, code: u8) -> Option<&'static str> {
        Opcode::from_u8(code).map(Opcode::name)
    }

    /// Instructions of one operand kind, sorted by opcode.
    #[inline]
    pub fn members(&self, kind: OperandKind) -> &[Instruction] {
        &self.classes[kind.index()]
    }

    /// Check membership of an opcode in a classification set.
    #[inline]
    pub fn contains(&self, kind: OperandKind, code: u8) -> bool {
        Opcode::from_u8(code).is_some_and(|op| kind.admits(op))
    }

    /// Replacement for a retired instruction name.
    pub fn retired(&self, name: &str) -> Option<&'static str> {
        RETIRED
            .iter()
            .find(|(retired, _)| *retired == name)
            .map(|&(_, replacement)| replacement)
    }
}

impl Opcode {
    /// Look up an opcode by symbolic name.
    #[inline]
    pub fn from_name(name: &str) -> Option<Self> {
        catalog().get(name).map(Instruction::opcode)
    }
}
