//! Operand stack effects.
//!
//! Every instruction has an explicit entry in a 256-slot table indexed by
//! opcode. Entries are either fixed (pops, pushes) pairs or computed from the
//! operand. An opcode without an entry is an error rather than a no-op.

use super::instruction::Opcode;
use std::sync::LazyLock;
use voodoo_core::{AssemblerError, AssemblerResult};

/// Values popped and pushed by one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackEffect {
    /// Values removed from the stack.
    pub pops: u32,
    /// Values added to the stack.
    pub pushes: u32,
}

impl StackEffect {
    /// Create a stack effect.
    #[inline]
    pub const fn new(pops: u32, pushes: u32) -> Self {
        Self { pops, pushes }
    }

    /// Net change in depth.
    #[inline]
    pub const fn net(self) -> i64 {
        self.pushes as i64 - self.pops as i64
    }

    /// Apply the effect to a depth, or `None` on underflow.
    #[inline]
    pub const fn apply(self, depth: u32) -> Option<u32> {
        match depth.checked_sub(self.pops) {
            Some(d) => d.checked_add(self.pushes),
            None => None,
        }
    }
}

#[derive(Clone, Copy)]
enum EffectRule {
    Fixed(StackEffect),
    Computed(fn(u32) -> StackEffect),
}

const fn fixed(pops: u32, pushes: u32) -> EffectRule {
    EffectRule::Fixed(StackEffect::new(pops, pushes))
}

/// Positional plus twice the keyword count packed in a call-style operand.
#[inline]
const fn call_arguments(arg: u32) -> u32 {
    (arg & 0xFF) + 2 * ((arg >> 8) & 0xFF)
}

/// Callable, its arguments and `extra` star-argument values.
#[inline]
const fn call_effect(arg: u32, extra: u32) -> StackEffect {
    StackEffect::new(1 + call_arguments(arg) + extra, 1)
}

static EFFECTS: LazyLock<[Option<EffectRule>; 256]> = LazyLock::new(|| {
    use Opcode::*;

    let mut table = [None; 256];
    let mut set = |op: Opcode, rule: EffectRule| table[op.code() as usize] = Some(rule);

    // Stack manipulation
    set(PopTop, fixed(1, 0));
    set(RotTwo, fixed(2, 2));
    set(RotThree, fixed(3, 3));
    set(DupTop, fixed(1, 2));
    set(DupTopTwo, fixed(2, 4));
    set(Nop, fixed(0, 0));

    // Unary and binary operators
    for op in [UnaryPositive, UnaryNegative, UnaryNot, UnaryInvert] {
        set(op, fixed(1, 1));
    }
    for op in [
        BinaryMatrixMultiply,
        InplaceMatrixMultiply,
        BinaryPower,
        BinaryMultiply,
        BinaryModulo,
        BinaryAdd,
        BinarySubtract,
        BinarySubscr,
        BinaryFloorDivide,
        BinaryTrueDivide,
        InplaceFloorDivide,
        InplaceTrueDivide,
        InplaceAdd,
        InplaceSubtract,
        InplaceMultiply,
        InplaceModulo,
        BinaryLshift,
        BinaryRshift,
        BinaryAnd,
        BinaryXor,
        BinaryOr,
        InplacePower,
        InplaceLshift,
        InplaceRshift,
        InplaceAnd,
        InplaceXor,
        InplaceOr,
    ] {
        set(op, fixed(2, 1));
    }
    set(StoreSubscr, fixed(3, 0));
    set(DeleteSubscr, fixed(2, 0));

    // Iteration and coroutines
    set(GetIter, fixed(1, 1));
    set(GetYieldFromIter, fixed(1, 1));
    set(GetAwaitable, fixed(1, 1));
    set(GetAiter, fixed(1, 1));
    set(GetAnext, fixed(1, 2));
    set(BeforeAsyncWith, fixed(1, 2));
    set(YieldValue, fixed(1, 1));
    set(YieldFrom, fixed(2, 1));
    set(ForIter, fixed(1, 2));

    // Misc
    set(PrintExpr, fixed(1, 0));
    set(LoadBuildClass, fixed(0, 1));
    set(ImportStar, fixed(1, 0));
    set(ReturnValue, fixed(1, 0));

    // Blocks
    set(BreakLoop, fixed(0, 0));
    set(PopBlock, fixed(0, 0));
    set(PopExcept, fixed(0, 0));
    set(EndFinally, fixed(1, 0));
    set(WithCleanupStart, fixed(0, 1));
    set(WithCleanupFinish, fixed(1, 0));
    set(SetupLoop, fixed(0, 0));
    set(SetupExcept, fixed(0, 6));
    set(SetupFinally, fixed(0, 6));
    set(SetupAsyncWith, fixed(0, 6));
    set(SetupWith, fixed(1, 8));

    // Names
    set(StoreName, fixed(1, 0));
    set(DeleteName, fixed(0, 0));
    set(LoadName, fixed(0, 1));
    set(StoreAttr, fixed(2, 0));
    set(DeleteAttr, fixed(1, 0));
    set(LoadAttr, fixed(1, 1));
    set(StoreGlobal, fixed(1, 0));
    set(DeleteGlobal, fixed(0, 0));
    set(LoadGlobal, fixed(0, 1));
    set(ImportName, fixed(2, 1));
    set(ImportFrom, fixed(1, 2));

    // Constants, locals and cells
    set(LoadConst, fixed(0, 1));
    set(LoadFast, fixed(0, 1));
    set(StoreFast, fixed(1, 0));
    set(DeleteFast, fixed(0, 0));
    set(LoadClosure, fixed(0, 1));
    set(LoadDeref, fixed(0, 1));
    set(LoadClassderef, fixed(0, 1));
    set(StoreDeref, fixed(1, 0));
    set(DeleteDeref, fixed(0, 0));

    set(CompareOp, fixed(2, 1));

    // Jumps
    set(JumpForward, fixed(0, 0));
    set(JumpAbsolute, fixed(0, 0));
    set(ContinueLoop, fixed(0, 0));
    set(JumpIfFalseOrPop, fixed(1, 1));
    set(JumpIfTrueOrPop, fixed(1, 1));
    set(PopJumpIfFalse, fixed(1, 0));
    set(PopJumpIfTrue, fixed(1, 0));

    // Comprehension helpers
    set(ListAppend, fixed(1, 0));
    set(SetAdd, fixed(1, 0));
    set(MapAdd, fixed(2, 0));

    // Operand-dependent
    for op in [
        BuildTuple,
        BuildList,
        BuildSet,
        BuildListUnpack,
        BuildTupleUnpack,
        BuildSetUnpack,
        BuildMapUnpack,
        BuildSlice,
    ] {
        set(op, EffectRule::Computed(|n| StackEffect::new(n, 1)));
    }
    set(BuildMap, EffectRule::Computed(|n| StackEffect::new(n.saturating_mul(2), 1)));
    set(
        BuildMapUnpackWithCall,
        EffectRule::Computed(|arg| StackEffect::new(arg & 0xFF, 1)),
    );
    set(UnpackSequence, EffectRule::Computed(|n| StackEffect::new(1, n)));
    set(
        UnpackEx,
        EffectRule::Computed(|arg| StackEffect::new(1, (arg & 0xFF) + (arg >> 8) + 1)),
    );
    set(RaiseVarargs, EffectRule::Computed(|n| StackEffect::new(n, 0)));
    set(CallFunction, EffectRule::Computed(|arg| call_effect(arg, 0)));
    set(CallFunctionVar, EffectRule::Computed(|arg| call_effect(arg, 1)));
    set(CallFunctionKw, EffectRule::Computed(|arg| call_effect(arg, 1)));
    set(CallFunctionVarKw, EffectRule::Computed(|arg| call_effect(arg, 2)));
    set(
        MakeFunction,
        EffectRule::Computed(|arg| {
            StackEffect::new(2 + call_arguments(arg) + ((arg >> 16) & 0xFFFF), 1)
        }),
    );
    set(
        MakeClosure,
        EffectRule::Computed(|arg| {
            StackEffect::new(3 + call_arguments(arg) + ((arg >> 16) & 0xFFFF), 1)
        }),
    );

    table
});

/// Stack effect of `opcode` with operand `arg` (ignored for fixed entries).
pub fn stack_effect(opcode: Opcode, arg: u32) -> AssemblerResult<StackEffect> {
    match EFFECTS[opcode.code() as usize] {
        Some(EffectRule::Fixed(effect)) => Ok(effect),
        Some(EffectRule::Computed(compute)) => Ok(compute(arg)),
        None => Err(AssemblerError::no_stack_effect(opcode.name())),
    }
}

/// Depth at a jump target, given the depth before the jumping instruction and
/// its effect. `FOR_ITER` leaves the loop with the iterator already popped.
pub fn jump_target_depth(opcode: Opcode, depth: u32, effect: StackEffect) -> Option<u32> {
    let after = effect.apply(depth)?;
    match opcode {
        Opcode::ForIter => after.checked_sub(2),
        _ => Some(after),
    }
}
