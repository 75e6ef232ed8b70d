//! Unit builder for stack-machine bytecode.
//!
//! [`Code`] exposes one generation method per instruction of the catalog.
//! Each call resolves its operand against the unit's pools, checks and applies
//! the instruction's stack effect, and appends the encoded bytes. The builder
//! is append-only: a failed call leaves the byte stream exactly as it was.

use super::catalog::catalog;
use super::instruction::{
    DecodedInstruction, EXTENDED_ARG, Instruction, MAX_SHORT_ARG, Opcode, decode, encode_arg, encode_op,
    for_each_instruction, instruction_width,
};
use super::operand::{CompareOp, Operand};
use super::stack_effect::{StackEffect, jump_target_depth, stack_effect};
use crate::persistor::Persistor;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};
use voodoo_core::{AssemblerError, AssemblerResult, CodeFlags, CodeObject, Constant};

/// A label for jump targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    /// Numeric identifier, unique within one builder.
    #[inline]
    pub const fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Current operand stack depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackDepth {
    /// Depth is tracked.
    Known(u32),
    /// Control cannot fall through to here; no depth is defined.
    Unknown,
}

impl StackDepth {
    /// The depth if known.
    #[inline]
    pub const fn known(self) -> Option<u32> {
        match self {
            StackDepth::Known(depth) => Some(depth),
            StackDepth::Unknown => None,
        }
    }
}

impl fmt::Display for StackDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackDepth::Known(depth) => write!(f, "{depth}"),
            StackDepth::Unknown => f.write_str("unknown"),
        }
    }
}

/// A control block opened by a `SETUP_*` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// The instruction that opened the block.
    pub setup: Opcode,
    /// Where control goes when the block is left abnormally.
    pub handler: Label,
    /// Stack depth when the block was entered.
    pub depth: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct LabelSlot {
    /// Byte offset, once bound.
    offset: Option<u32>,
    /// Depth expected at the target, recorded by forward jumps.
    depth: Option<u32>,
}

/// A jump to a label. Its operand is rewritten whenever the layout moves.
#[derive(Debug, Clone, Copy)]
struct JumpSite {
    label: Label,
    opcode: Opcode,
    /// Offset of the first byte (the `EXTENDED_ARG` prefix when wide).
    start: usize,
    /// Whether the jump carries an `EXTENDED_ARG` prefix.
    wide: bool,
}

impl JumpSite {
    fn end(&self) -> usize {
        self.start + if self.wide { 6 } else { 3 }
    }

    fn value(&self, target: u32) -> u32 {
        if self.opcode.has_jrel() {
            target.saturating_sub(self.end() as u32)
        } else {
            target
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LineState {
    offset: usize,
    line: u32,
}

/// Key type for constant deduplication.
///
/// Only scalar and string constants are keyed; everything else is matched by
/// scanning the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    /// Float bits; both zeroes share one key.
    Float(u64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
}

impl ConstantKey {
    fn from_constant(value: &Constant) -> Option<Self> {
        Some(match value {
            Constant::None => ConstantKey::None,
            Constant::Ellipsis => ConstantKey::Ellipsis,
            Constant::Bool(b) => ConstantKey::Bool(*b),
            Constant::Int(i) => ConstantKey::Int(*i),
            Constant::Float(f) if *f == 0.0 => ConstantKey::Float(0.0f64.to_bits()),
            Constant::Float(f) => ConstantKey::Float(f.to_bits()),
            Constant::Str(s) => ConstantKey::Str(Arc::clone(s)),
            Constant::Bytes(b) => ConstantKey::Bytes(Arc::clone(b)),
            Constant::Tuple(_) | Constant::List(_) | Constant::Code(_) => return None,
        })
    }
}

/// A pool entry that is committed only once its instruction is emitted.
enum PoolEntry {
    Const(Constant),
    Name(Arc<str>),
    Local(Arc<str>),
}

struct Resolved {
    arg: u32,
    pending: Option<PoolEntry>,
    /// Label the jump targets; recorded so the operand tracks layout changes.
    label: Option<Label>,
}

impl Resolved {
    fn raw(arg: u32) -> Self {
        Self {
            arg,
            pending: None,
            label: None,
        }
    }
}

struct Emitted {
    offset: usize,
    depth: u32,
    effect: StackEffect,
}

/// An instruction to search for: an opcode, a raw byte or a name.
#[derive(Debug, Clone, Copy)]
pub enum InstructionRef<'a> {
    /// A catalog opcode.
    Opcode(Opcode),
    /// A raw opcode byte.
    Code(u8),
    /// A symbolic name.
    Name(&'a str),
}

impl From<Opcode> for InstructionRef<'_> {
    fn from(opcode: Opcode) -> Self {
        InstructionRef::Opcode(opcode)
    }
}

impl From<Instruction> for InstructionRef<'_> {
    fn from(instruction: Instruction) -> Self {
        InstructionRef::Opcode(instruction.opcode())
    }
}

impl From<u8> for InstructionRef<'_> {
    fn from(code: u8) -> Self {
        InstructionRef::Code(code)
    }
}

impl<'a> From<&'a str> for InstructionRef<'a> {
    fn from(name: &'a str) -> Self {
        InstructionRef::Name(name)
    }
}

impl InstructionRef<'_> {
    fn resolve(self) -> AssemblerResult<(u8, String)> {
        match self {
            InstructionRef::Opcode(op) => Ok((op.code(), op.name().to_owned())),
            InstructionRef::Code(code) => Ok((
                code,
                catalog()
                    .name_for(code)
                    .map_or_else(|| format!("<{code}>"), str::to_owned),
            )),
            InstructionRef::Name(name) => {
                let inst = catalog().opcode_for(name)?;
                Ok((inst.code(), inst.name().to_owned()))
            }
        }
    }
}

/// Builder for a single executable unit.
///
/// # Example
/// ```
/// use voodoo_assembler::Code;
///
/// let mut code = Code::default();
/// code.load_const(42)?;
/// code.return_value()?;
///
/// assert_eq!(code.code(), &[100, 1, 0, 83]);
/// # Ok::<(), voodoo_core::AssemblerError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Code {
    name: Arc<str>,
    filename: Arc<str>,
    argcount: u32,
    firstlineno: u32,
    flags: CodeFlags,

    /// Constant pool; index 0 is always `None`.
    consts: Vec<Constant>,
    constant_map: FxHashMap<ConstantKey, u32>,

    names: Vec<Arc<str>>,
    name_map: FxHashMap<Arc<str>, u32>,

    varnames: Vec<Arc<str>>,
    local_map: FxHashMap<Arc<str>, u32>,

    code: Vec<u8>,
    /// Depth after the instruction each byte belongs to.
    stack_history: Vec<u32>,
    stacksize: u32,
    depth: StackDepth,
    blocks: Vec<Block>,

    labels: Vec<LabelSlot>,
    jumps: Vec<JumpSite>,

    lnotab: Vec<u8>,
    /// Line starts; the first entry is the `firstlineno` origin.
    lines: Vec<LineState>,
}

impl Default for Code {
    fn default() -> Self {
        Self::new("<module>")
    }
}

impl Code {
    /// Create an empty unit.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            filename: "<string>".into(),
            argcount: 0,
            firstlineno: 0,
            flags: CodeFlags::DEFAULT,
            consts: vec![Constant::None],
            constant_map: std::iter::once((ConstantKey::None, 0)).collect(),
            names: Vec::new(),
            name_map: FxHashMap::default(),
            varnames: Vec::new(),
            local_map: FxHashMap::default(),
            code: Vec::new(),
            stack_history: Vec::new(),
            stacksize: 0,
            depth: StackDepth::Known(0),
            blocks: Vec::new(),
            labels: Vec::new(),
            jumps: Vec::new(),
            lnotab: Vec::new(),
            lines: Vec::new(),
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Set the unit name.
    pub fn set_name(&mut self, name: impl Into<Arc<str>>) {
        self.name = name.into();
    }

    /// Set the source file name.
    pub fn set_filename(&mut self, filename: impl Into<Arc<str>>) {
        self.filename = filename.into();
    }

    /// Set the first source line.
    pub fn set_first_lineno(&mut self, line: u32) {
        self.firstlineno = line;
    }

    /// Set the number of positional arguments.
    pub fn set_arg_count(&mut self, count: u32) {
        self.argcount = count;
    }

    /// Replace the compiler flags.
    pub fn set_flags(&mut self, flags: CodeFlags) {
        self.flags = flags;
    }

    /// Add compiler flags.
    pub fn add_flags(&mut self, flags: CodeFlags) {
        self.flags |= flags;
    }

    /// Declare the positional arguments, in order, as the first locals.
    ///
    /// Arguments occupy slots `0..argcount`, so they must be declared before
    /// any other local and each name only once. On error nothing is declared.
    pub fn declare_arguments<I, S>(&mut self, names: I) -> AssemblerResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        if self.varnames.len() != self.argcount as usize {
            return Err(AssemblerError::invalid_operand(
                "declare_arguments",
                format!(
                    "{} local(s) already defined for argcount {}",
                    self.varnames.len(),
                    self.argcount
                ),
            ));
        }

        let names: Vec<Arc<str>> = names.into_iter().map(Into::into).collect();
        for (i, name) in names.iter().enumerate() {
            if self.local_map.contains_key(name) || names[..i].contains(name) {
                return Err(AssemblerError::invalid_operand(
                    "declare_arguments",
                    format!("duplicate argument '{name}'"),
                ));
            }
        }

        for name in names {
            self.define_local(name);
            self.argcount += 1;
        }
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Unit name.
    #[inline]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Source file name.
    #[inline]
    pub fn filename(&self) -> &Arc<str> {
        &self.filename
    }

    /// Number of positional arguments.
    #[inline]
    pub fn argcount(&self) -> u32 {
        self.argcount
    }

    /// First source line.
    #[inline]
    pub fn firstlineno(&self) -> u32 {
        self.firstlineno
    }

    /// Compiler flags.
    #[inline]
    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    /// Constant pool.
    #[inline]
    pub fn consts(&self) -> &[Constant] {
        &self.consts
    }

    /// Name pool.
    #[inline]
    pub fn names(&self) -> &[Arc<str>] {
        &self.names
    }

    /// Local variable pool; the index is the slot.
    #[inline]
    pub fn varnames(&self) -> &[Arc<str>] {
        &self.varnames
    }

    /// Encoded instruction stream.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Copy of the encoded instruction stream.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.code.clone()
    }

    /// Decoded view of the instruction stream.
    pub fn instructions(&self) -> impl Iterator<Item = DecodedInstruction> + '_ {
        decode(&self.code)
    }

    /// Maximum stack depth reached so far.
    #[inline]
    pub fn stacksize(&self) -> u32 {
        self.stacksize
    }

    /// Current stack depth.
    #[inline]
    pub fn stack_depth(&self) -> StackDepth {
        self.depth
    }

    /// For each byte of the stream, the depth after its instruction.
    #[inline]
    pub fn stack_history(&self) -> &[u32] {
        &self.stack_history
    }

    /// Open control blocks.
    #[inline]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Line number table.
    #[inline]
    pub fn lnotab(&self) -> &[u8] {
        &self.lnotab
    }

    /// Whether some forward jump still waits for its label.
    #[inline]
    pub fn has_pending_jumps(&self) -> bool {
        self.jumps.iter().any(|jump| !self.is_bound(jump.label))
    }

    /// Labels referenced by jumps that are still unbound.
    pub fn pending_labels(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self
            .jumps
            .iter()
            .map(|jump| jump.label)
            .filter(|&label| !self.is_bound(label))
            .collect();
        labels.sort_unstable_by_key(|label| label.0);
        labels.dedup();
        labels
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Index of the first constant slot the value may share.
    pub fn lookup_constant(&self, value: &Constant) -> Option<u32> {
        if let Some(key) = ConstantKey::from_constant(value) {
            return self.constant_map.get(&key).copied();
        }
        self.consts
            .iter()
            .position(|existing| existing.shares_slot_with(value))
            .and_then(|i| u32::try_from(i).ok())
    }

    /// Look up a local variable by name.
    #[inline]
    pub fn lookup_local(&self, name: &str) -> Option<u32> {
        self.local_map.get(name).copied()
    }

    /// Look up a name pool entry.
    #[inline]
    pub fn lookup_name(&self, name: &str) -> Option<u32> {
        self.name_map.get(name).copied()
    }

    /// Define a local variable and return its slot. Existing names keep their slot.
    pub fn define_local(&mut self, name: impl Into<Arc<str>>) -> u32 {
        let name = name.into();
        if let Some(&slot) = self.local_map.get(&name) {
            return slot;
        }
        let slot = self.varnames.len() as u32;
        self.local_map.insert(name.clone(), slot);
        self.varnames.push(name);
        slot
    }

    fn commit(&mut self, entry: PoolEntry) {
        match entry {
            PoolEntry::Const(value) => {
                if let Some(key) = ConstantKey::from_constant(&value) {
                    self.constant_map
                        .entry(key)
                        .or_insert(self.consts.len() as u32);
                }
                self.consts.push(value);
            }
            PoolEntry::Name(name) => {
                self.name_map.insert(name.clone(), self.names.len() as u32);
                self.names.push(name);
            }
            PoolEntry::Local(name) => {
                self.define_local(name);
            }
        }
    }

    fn next_index(len: usize, opcode: Opcode) -> AssemblerResult<u32> {
        u32::try_from(len).map_err(|_| AssemblerError::operand_overflow(opcode.name(), len as u64))
    }

    // =========================================================================
    // Generation
    // =========================================================================

    /// Generate an instruction by name.
    ///
    /// Accepts either the instruction name (`LOAD_CONST`) or the generation
    /// method name (`load_const`).
    pub fn generate(&mut self, name: &str, args: &[Operand]) -> AssemblerResult<()> {
        let upper = name.to_ascii_uppercase();
        if let Some(replacement) = catalog().retired(&upper) {
            return Err(AssemblerError::unsupported(upper, replacement));
        }
        let Some(opcode) = Opcode::from_name(&upper) else {
            return Err(AssemblerError::missing_operation(
                self.to_string(),
                name,
                args.iter().map(ToString::to_string).collect(),
            ));
        };
        match args {
            [] => self.generate_op(opcode, None),
            [operand] => self.generate_op(opcode, Some(operand.clone())),
            _ => Err(AssemblerError::invalid_operand(
                opcode.name(),
                args.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        }
    }

    /// `STOP_CODE` was removed from the instruction set; always fails.
    pub fn stop_code(&mut self) -> AssemblerResult<()> {
        self.generate("STOP_CODE", &[])
    }

    /// `STORE_MAP` was removed from the instruction set; always fails.
    pub fn store_map(&mut self) -> AssemblerResult<()> {
        self.generate("STORE_MAP", &[])
    }

    /// Generate an instruction with a symbolic operand.
    pub fn generate_op(&mut self, opcode: Opcode, operand: Option<Operand>) -> AssemblerResult<()> {
        self.known_depth(opcode)?;

        let operand = match (opcode.has_arg(), operand) {
            (false, None) => return self.emit_checked(opcode, None).map(|_| ()),
            (true, Some(operand)) => operand,
            (false, Some(operand)) => {
                return Err(AssemblerError::invalid_operand(
                    opcode.name(),
                    operand.to_string(),
                ));
            }
            (true, None) => {
                return Err(AssemblerError::invalid_operand(opcode.name(), "<missing>"));
            }
        };

        let resolved = self.resolve(opcode, operand)?;
        let emitted = self.emit_checked(opcode, Some(resolved.arg))?;

        if let Some(entry) = resolved.pending {
            self.commit(entry);
        }
        if let Some(label) = resolved.label {
            self.record_jump(opcode, label, &emitted);
        }
        Ok(())
    }

    /// Encode an instruction with an already-resolved operand.
    ///
    /// Stack tracking still applies; pools and labels are untouched.
    pub fn emit_raw(&mut self, opcode: Opcode, arg: Option<u32>) -> AssemblerResult<()> {
        if opcode.has_arg() != arg.is_some() {
            return Err(AssemblerError::invalid_operand(
                opcode.name(),
                arg.map_or_else(|| "<missing>".to_owned(), |a| a.to_string()),
            ));
        }
        self.emit_checked(opcode, arg).map(|_| ())
    }

    fn known_depth(&self, opcode: Opcode) -> AssemblerResult<u32> {
        self.depth
            .known()
            .ok_or_else(|| AssemblerError::unknown_stack_size(opcode.name()))
    }

    fn resolve(&mut self, opcode: Opcode, operand: Operand) -> AssemblerResult<Resolved> {
        if opcode.has_const() {
            let value = match operand {
                Operand::Int(i) => Constant::Int(i),
                Operand::Value(value) => value,
                Operand::Name(s) => Constant::Str(s),
                other => {
                    return Err(AssemblerError::invalid_operand(
                        opcode.name(),
                        other.to_string(),
                    ));
                }
            };
            return Ok(match self.lookup_constant(&value) {
                Some(index) => Resolved::raw(index),
                None => Resolved {
                    arg: Self::next_index(self.consts.len(), opcode)?,
                    pending: Some(PoolEntry::Const(value)),
                    label: None,
                },
            });
        }

        match operand {
            Operand::Int(value) => Self::raw_operand(opcode, value).map(Resolved::raw),
            Operand::Name(name) if opcode.has_local() || opcode.has_free() => {
                self.resolve_local(opcode, name)
            }
            Operand::Name(name) if opcode.has_name() => Ok(match self.lookup_name(&name) {
                Some(index) => Resolved::raw(index),
                None => Resolved {
                    arg: Self::next_index(self.names.len(), opcode)?,
                    pending: Some(PoolEntry::Name(name)),
                    label: None,
                },
            }),
            Operand::Name(symbol) if opcode.has_compare() => CompareOp::from_symbol(&symbol)
                .map(|op| Resolved::raw(op.index()))
                .ok_or_else(|| AssemblerError::invalid_operand(opcode.name(), format!("'{symbol}'"))),
            Operand::Compare(op) if opcode.has_compare() => Ok(Resolved::raw(op.index())),
            Operand::Label(label) if opcode.has_jump() => self.resolve_jump(opcode, label),
            other => Err(AssemblerError::invalid_operand(
                opcode.name(),
                other.to_string(),
            )),
        }
    }

    fn raw_operand(opcode: Opcode, value: i64) -> AssemblerResult<u32> {
        if value < 0 {
            return Err(AssemblerError::invalid_operand(
                opcode.name(),
                value.to_string(),
            ));
        }
        u32::try_from(value)
            .map_err(|_| AssemblerError::operand_overflow(opcode.name(), value.unsigned_abs()))
    }

    /// Loads of a name that was never stored get a synthesized `STORE_FAST`.
    fn resolve_local(&mut self, opcode: Opcode, name: Arc<str>) -> AssemblerResult<Resolved> {
        if let Some(slot) = self.lookup_local(&name) {
            return Ok(Resolved::raw(slot));
        }
        if matches!(opcode, Opcode::StoreFast | Opcode::DeleteFast) {
            return Ok(Resolved {
                arg: Self::next_index(self.varnames.len(), opcode)?,
                pending: Some(PoolEntry::Local(name)),
                label: None,
            });
        }

        trace!(name = %name, "synthesizing STORE_FAST before {}", opcode.name());
        self.generate_op(Opcode::StoreFast, Some(Operand::Name(name.clone())))?;
        self.lookup_local(&name)
            .map(Resolved::raw)
            .ok_or_else(|| AssemblerError::invalid_operand(opcode.name(), format!("'{name}'")))
    }

    fn resolve_jump(&self, opcode: Opcode, label: Label) -> AssemblerResult<Resolved> {
        let slot = self
            .labels
            .get(label.0 as usize)
            .ok_or(AssemblerError::UnboundLabel { label: label.0 })?;

        match slot.offset {
            Some(target) if opcode.has_jabs() => Ok(Resolved {
                arg: target,
                pending: None,
                label: Some(label),
            }),
            // Relative jumps only go forward.
            Some(_) => Err(AssemblerError::invalid_operand(
                opcode.name(),
                format!("{label} (bound before the jump)"),
            )),
            None => Ok(Resolved {
                arg: 0,
                pending: None,
                label: Some(label),
            }),
        }
    }

    fn emit_checked(&mut self, opcode: Opcode, arg: Option<u32>) -> AssemblerResult<Emitted> {
        let depth = self.known_depth(opcode)?;
        let effect = stack_effect(opcode, arg.unwrap_or(0))?;
        let after = effect
            .apply(depth)
            .ok_or_else(|| AssemblerError::stack_underflow(opcode.name(), depth, effect.pops))?;

        let bytes = match arg {
            Some(arg) => encode_arg(opcode, arg),
            None => encode_op(opcode),
        };
        let offset = self.code.len();
        self.code.extend_from_slice(&bytes);
        self.stack_history.resize(self.code.len(), after);

        self.stacksize = self.stacksize.max(after);
        self.depth = if opcode.is_unconditional_transfer() {
            StackDepth::Unknown
        } else {
            StackDepth::Known(after)
        };

        trace!(offset, opcode = opcode.name(), ?arg, depth = after, "emit");
        Ok(Emitted {
            offset,
            depth,
            effect,
        })
    }

    // =========================================================================
    // Labels
    // =========================================================================

    /// Create a new label for a jump target.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(LabelSlot::default());
        label
    }

    /// Mark the current position as the target of a label and patch every
    /// forward jump waiting for it.
    ///
    /// If control cannot fall through to here, the depth recorded by the
    /// jumps becomes the current depth. A jump whose operand no longer fits 16
    /// bits is widened with `EXTENDED_ARG`, shifting everything after it.
    pub fn bind_label(&mut self, label: Label) -> AssemblerResult<()> {
        let target = Self::next_index(self.code.len(), Opcode::JumpAbsolute)?;
        let slot = self
            .labels
            .get_mut(label.0 as usize)
            .ok_or(AssemblerError::UnboundLabel { label: label.0 })?;
        if slot.offset.is_some() {
            return Err(AssemblerError::invalid_operand(
                "bind_label",
                format!("{label} (already bound)"),
            ));
        }
        slot.offset = Some(target);
        let recorded = slot.depth;

        match (self.depth, recorded) {
            (StackDepth::Unknown, Some(depth)) => {
                self.depth = StackDepth::Known(depth);
                self.stacksize = self.stacksize.max(depth);
            }
            (StackDepth::Known(current), Some(depth)) if current != depth => {
                debug!(%label, current, recorded = depth, "stack depth mismatch at label");
            }
            _ => {}
        }

        let mut needs_relaxation = false;
        for i in 0..self.jumps.len() {
            let jump = self.jumps[i];
            if jump.label != label {
                continue;
            }
            let value = jump.value(target);
            if value > MAX_SHORT_ARG && !jump.wide {
                needs_relaxation = true;
                break;
            }
            self.write_jump(jump, value);
            debug!(%label, start = jump.start, value, "patched {}", jump.opcode.name());
        }

        if needs_relaxation {
            self.relax_jumps();
        }
        Ok(())
    }

    /// Widen every bound jump whose operand overflows, until none does, then
    /// rewrite all bound jump operands against the final layout.
    fn relax_jumps(&mut self) {
        loop {
            let overflowing = self.jumps.iter().position(|jump| {
                !jump.wide
                    && self
                        .label_offset(jump.label)
                        .is_some_and(|target| jump.value(target) > MAX_SHORT_ARG)
            });
            match overflowing {
                Some(i) => self.widen_jump(i),
                None => break,
            }
        }

        for i in 0..self.jumps.len() {
            let jump = self.jumps[i];
            if let Some(target) = self.label_offset(jump.label) {
                self.write_jump(jump, jump.value(target));
            }
        }
    }

    /// Insert an `EXTENDED_ARG` prefix in front of a jump.
    ///
    /// Bytes, stack history, label offsets, jump sites and line starts behind
    /// the jump move by three bytes. A label or line at the jump itself stays
    /// put and now points at the prefix.
    fn widen_jump(&mut self, index: usize) {
        let start = self.jumps[index].start;
        let depth = self.stack_history[start];
        debug!(
            start,
            opcode = self.jumps[index].opcode.name(),
            "widening jump with EXTENDED_ARG"
        );

        self.code.splice(start..start, [EXTENDED_ARG, 0, 0]);
        self.stack_history
            .splice(start..start, std::iter::repeat_n(depth, 3));

        self.jumps[index].wide = true;
        for jump in &mut self.jumps {
            if jump.start > start {
                jump.start += 3;
            }
        }
        for offset in self.labels.iter_mut().filter_map(|slot| slot.offset.as_mut()) {
            if *offset as usize > start {
                *offset += 3;
            }
        }
        for state in &mut self.lines {
            if state.offset > start {
                state.offset += 3;
            }
        }

        self.lnotab.clear();
        for pair in self.lines.windows(2) {
            encode_line_delta(&mut self.lnotab, pair[0], pair[1]);
        }
    }

    fn write_jump(&mut self, jump: JumpSite, value: u32) {
        let operand = if jump.wide {
            let [lo, hi] = ((value >> 16) as u16).to_le_bytes();
            self.code[jump.start + 1] = lo;
            self.code[jump.start + 2] = hi;
            jump.start + 4
        } else {
            jump.start + 1
        };
        let [lo, hi] = (value as u16).to_le_bytes();
        self.code[operand] = lo;
        self.code[operand + 1] = hi;
    }

    fn is_bound(&self, label: Label) -> bool {
        self.label_offset(label).is_some()
    }

    /// Byte offset of a bound label.
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.labels.get(label.0 as usize).and_then(|slot| slot.offset)
    }

    /// Force the current stack depth, e.g. at the start of a handler block.
    pub fn set_stack_depth(&mut self, depth: u32) {
        self.depth = StackDepth::Known(depth);
        self.stacksize = self.stacksize.max(depth);
    }

    fn record_jump(&mut self, opcode: Opcode, label: Label, emitted: &Emitted) {
        let wide = self.code.len() - emitted.offset > 3;
        if let (Some(slot), Some(depth)) = (
            self.labels.get_mut(label.0 as usize),
            jump_target_depth(opcode, emitted.depth, emitted.effect),
        ) {
            match slot.depth {
                None if slot.offset.is_none() => slot.depth = Some(depth),
                Some(previous) if previous != depth => {
                    debug!(%label, previous, depth, "conflicting depths recorded for label");
                }
                _ => {}
            }
        }
        self.jumps.push(JumpSite {
            label,
            opcode,
            start: emitted.offset,
            wide,
        });
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Record a control block opened by `setup` at the current depth.
    pub fn enter_block(&mut self, setup: Opcode, handler: Label) -> AssemblerResult<()> {
        if !setup.is_block_setup() {
            return Err(AssemblerError::invalid_operand("enter_block", setup.name()));
        }
        let depth = self.known_depth(setup)?;
        self.blocks.push(Block {
            setup,
            handler,
            depth,
        });
        Ok(())
    }

    /// Close the innermost control block.
    pub fn exit_block(&mut self) -> Option<Block> {
        self.blocks.pop()
    }

    // =========================================================================
    // Line Numbers
    // =========================================================================

    /// Start a new source line at the current offset.
    ///
    /// The first call seeds `firstlineno` when it is still unset. Lines that do
    /// not advance are not recorded.
    pub fn set_lineno(&mut self, line: u32) {
        if self.lines.is_empty() {
            if self.firstlineno == 0 {
                self.firstlineno = line;
            }
            self.lines.push(LineState {
                offset: 0,
                line: self.firstlineno,
            });
        }
        let last = self.lines[self.lines.len() - 1];
        if line <= last.line {
            return;
        }

        let next = LineState {
            offset: self.code.len(),
            line,
        };
        encode_line_delta(&mut self.lnotab, last, next);
        self.lines.push(next);
    }

    // =========================================================================
    // Searching
    // =========================================================================

    /// Byte offsets of every occurrence of an instruction, in stream order.
    pub fn find_opcode_index<'a>(
        &self,
        instruction: impl Into<InstructionRef<'a>>,
    ) -> AssemblerResult<Vec<usize>> {
        let (code, _) = instruction.into().resolve()?;
        Ok(self.scan(code).collect())
    }

    /// Byte offset of the first occurrence of an instruction.
    pub fn find_first_opcode_index<'a>(
        &self,
        instruction: impl Into<InstructionRef<'a>>,
    ) -> AssemblerResult<usize> {
        let (code, name) = instruction.into().resolve()?;
        self.scan(code)
            .next()
            .ok_or_else(|| AssemblerError::index_not_found(name))
    }

    fn scan(&self, target: u8) -> impl Iterator<Item = usize> + '_ {
        let mut offset = 0;
        std::iter::from_fn(move || {
            while let Some(&code) = self.code.get(offset) {
                let at = offset;
                offset += instruction_width(code);
                if code == target {
                    return Some(at);
                }
            }
            None
        })
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Materialize the unit.
    pub fn finish(self) -> AssemblerResult<CodeObject> {
        Persistor::to_code_type(&self)
    }
}

/// Append the `lnotab` pairs that advance from one line start to the next.
fn encode_line_delta(lnotab: &mut Vec<u8>, from: LineState, to: LineState) {
    let mut byte_incr = to.offset - from.offset;
    let mut line_incr = (to.line - from.line) as usize;

    if byte_incr > 255 {
        let ncodes = byte_incr / 255;
        for _ in 0..ncodes {
            lnotab.extend_from_slice(&[255, 0]);
        }
        byte_incr -= ncodes * 255;
    }
    if line_incr > 255 {
        let ncodes = line_incr / 255;
        lnotab.extend_from_slice(&[byte_pair_value(byte_incr), 255]);
        for _ in 1..ncodes {
            lnotab.extend_from_slice(&[0, 255]);
        }
        byte_incr = 0;
        line_incr -= ncodes * 255;
    }
    lnotab.extend_from_slice(&[byte_pair_value(byte_incr), byte_pair_value(line_incr)]);
}

#[allow(clippy::cast_possible_truncation)]
fn byte_pair_value(value: usize) -> u8 {
    debug_assert!(value <= 255);
    value as u8
}

macro_rules! generation_op {
    (noarg $variant:ident, $name:literal, $method:ident) => {
        #[doc = concat!("Generate `", $name, "`.")]
        #[inline]
        pub fn $method(&mut self) -> AssemblerResult<()> {
            self.generate_op(Opcode::$variant, None)
        }
    };
    (arg $variant:ident, $name:literal, $method:ident) => {
        #[doc = concat!("Generate `", $name, "` with a symbolic operand.")]
        #[inline]
        pub fn $method(&mut self, operand: impl Into<Operand>) -> AssemblerResult<()> {
            self.generate_op(Opcode::$variant, Some(operand.into()))
        }
    };
}

macro_rules! define_generation_ops {
    ($($shape:ident $variant:ident = $code:literal, $name:literal, $method:ident;)*) => {
        /// One generation method per instruction.
        impl Code {
            $(generation_op!($shape $variant, $name, $method);)*
        }
    };
}

for_each_instruction!(define_generation_ops);

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Code '{}' depth={} stacksize={} bytes={}>",
            self.name,
            self.depth,
            self.stacksize,
            self.code.len()
        )
    }
}
