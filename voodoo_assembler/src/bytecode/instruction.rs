//! Stack-machine instruction definitions for the CPython 3.5 instruction set.
//!
//! # Instruction Format
//!
//! ```text
//! argument-less        argument-bearing          extended argument
//! ┌────────┐           ┌────────┬────────┐       ┌─────────────┬────────┬────────┬────────┐
//! │ opcode │           │ opcode │ arg LE │       │ EXTENDED_ARG│ hi LE  │ opcode │ lo LE  │
//! │ 1 byte │           │ 1 byte │2 bytes │       │   1 byte    │2 bytes │ 1 byte │2 bytes │
//! └────────┘           └────────┴────────┘       └─────────────┴────────┴────────┴────────┘
//! ```
//!
//! Opcodes below [`HAVE_ARGUMENT`] take no operand. Operands wider than 16 bits
//! are split: `EXTENDED_ARG` carries the high 16 bits, the instruction itself
//! carries the low 16 bits.

use smallvec::SmallVec;
use std::fmt;

/// First opcode that carries an operand.
pub const HAVE_ARGUMENT: u8 = 90;

/// The operand-widening prefix. Not part of the catalog.
pub const EXTENDED_ARG: u8 = 144;

/// Largest operand that fits without an `EXTENDED_ARG` prefix.
pub const MAX_SHORT_ARG: u32 = 0xFFFF;

/// Expands `$callback!` with the full instruction table.
///
/// Each row is `shape Variant = opcode, "NAME", method;` where `shape` is
/// `noarg` or `arg`.
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            noarg PopTop = 1, "POP_TOP", pop_top;
            noarg RotTwo = 2, "ROT_TWO", rot_two;
            noarg RotThree = 3, "ROT_THREE", rot_three;
            noarg DupTop = 4, "DUP_TOP", dup_top;
            noarg DupTopTwo = 5, "DUP_TOP_TWO", dup_top_two;
            noarg Nop = 9, "NOP", nop;
            noarg UnaryPositive = 10, "UNARY_POSITIVE", unary_positive;
            noarg UnaryNegative = 11, "UNARY_NEGATIVE", unary_negative;
            noarg UnaryNot = 12, "UNARY_NOT", unary_not;
            noarg UnaryInvert = 15, "UNARY_INVERT", unary_invert;
            noarg BinaryMatrixMultiply = 16, "BINARY_MATRIX_MULTIPLY", binary_matrix_multiply;
            noarg InplaceMatrixMultiply = 17, "INPLACE_MATRIX_MULTIPLY", inplace_matrix_multiply;
            noarg BinaryPower = 19, "BINARY_POWER", binary_power;
            noarg BinaryMultiply = 20, "BINARY_MULTIPLY", binary_multiply;
            noarg BinaryModulo = 22, "BINARY_MODULO", binary_modulo;
            noarg BinaryAdd = 23, "BINARY_ADD", binary_add;
            noarg BinarySubtract = 24, "BINARY_SUBTRACT", binary_subtract;
            noarg BinarySubscr = 25, "BINARY_SUBSCR", binary_subscr;
            noarg BinaryFloorDivide = 26, "BINARY_FLOOR_DIVIDE", binary_floor_divide;
            noarg BinaryTrueDivide = 27, "BINARY_TRUE_DIVIDE", binary_true_divide;
            noarg InplaceFloorDivide = 28, "INPLACE_FLOOR_DIVIDE", inplace_floor_divide;
            noarg InplaceTrueDivide = 29, "INPLACE_TRUE_DIVIDE", inplace_true_divide;
            noarg GetAiter = 50, "GET_AITER", get_aiter;
            noarg GetAnext = 51, "GET_ANEXT", get_anext;
            noarg BeforeAsyncWith = 52, "BEFORE_ASYNC_WITH", before_async_with;
            noarg InplaceAdd = 55, "INPLACE_ADD", inplace_add;
            noarg InplaceSubtract = 56, "INPLACE_SUBTRACT", inplace_subtract;
            noarg InplaceMultiply = 57, "INPLACE_MULTIPLY", inplace_multiply;
            noarg InplaceModulo = 59, "INPLACE_MODULO", inplace_modulo;
            noarg StoreSubscr = 60, "STORE_SUBSCR", store_subscr;
            noarg DeleteSubscr = 61, "DELETE_SUBSCR", delete_subscr;
            noarg BinaryLshift = 62, "BINARY_LSHIFT", binary_lshift;
            noarg BinaryRshift = 63, "BINARY_RSHIFT", binary_rshift;
            noarg BinaryAnd = 64, "BINARY_AND", binary_and;
            noarg BinaryXor = 65, "BINARY_XOR", binary_xor;
            noarg BinaryOr = 66, "BINARY_OR", binary_or;
            noarg InplacePower = 67, "INPLACE_POWER", inplace_power;
            noarg GetIter = 68, "GET_ITER", get_iter;
            noarg GetYieldFromIter = 69, "GET_YIELD_FROM_ITER", get_yield_from_iter;
            noarg PrintExpr = 70, "PRINT_EXPR", print_expr;
            noarg LoadBuildClass = 71, "LOAD_BUILD_CLASS", load_build_class;
            noarg YieldFrom = 72, "YIELD_FROM", yield_from;
            noarg GetAwaitable = 73, "GET_AWAITABLE", get_awaitable;
            noarg InplaceLshift = 75, "INPLACE_LSHIFT", inplace_lshift;
            noarg InplaceRshift = 76, "INPLACE_RSHIFT", inplace_rshift;
            noarg InplaceAnd = 77, "INPLACE_AND", inplace_and;
            noarg InplaceXor = 78, "INPLACE_XOR", inplace_xor;
            noarg InplaceOr = 79, "INPLACE_OR", inplace_or;
            noarg BreakLoop = 80, "BREAK_LOOP", break_loop;
            noarg WithCleanupStart = 81, "WITH_CLEANUP_START", with_cleanup_start;
            noarg WithCleanupFinish = 82, "WITH_CLEANUP_FINISH", with_cleanup_finish;
            noarg ReturnValue = 83, "RETURN_VALUE", return_value;
            noarg ImportStar = 84, "IMPORT_STAR", import_star;
            noarg YieldValue = 86, "YIELD_VALUE", yield_value;
            noarg PopBlock = 87, "POP_BLOCK", pop_block;
            noarg EndFinally = 88, "END_FINALLY", end_finally;
            noarg PopExcept = 89, "POP_EXCEPT", pop_except;
            arg StoreName = 90, "STORE_NAME", store_name;
            arg DeleteName = 91, "DELETE_NAME", delete_name;
            arg UnpackSequence = 92, "UNPACK_SEQUENCE", unpack_sequence;
            arg ForIter = 93, "FOR_ITER", for_iter;
            arg UnpackEx = 94, "UNPACK_EX", unpack_ex;
            arg StoreAttr = 95, "STORE_ATTR", store_attr;
            arg DeleteAttr = 96, "DELETE_ATTR", delete_attr;
            arg StoreGlobal = 97, "STORE_GLOBAL", store_global;
            arg DeleteGlobal = 98, "DELETE_GLOBAL", delete_global;
            arg LoadConst = 100, "LOAD_CONST", load_const;
            arg LoadName = 101, "LOAD_NAME", load_name;
            arg BuildTuple = 102, "BUILD_TUPLE", build_tuple;
            arg BuildList = 103, "BUILD_LIST", build_list;
            arg BuildSet = 104, "BUILD_SET", build_set;
            arg BuildMap = 105, "BUILD_MAP", build_map;
            arg LoadAttr = 106, "LOAD_ATTR", load_attr;
            arg CompareOp = 107, "COMPARE_OP", compare_op;
            arg ImportName = 108, "IMPORT_NAME", import_name;
            arg ImportFrom = 109, "IMPORT_FROM", import_from;
            arg JumpForward = 110, "JUMP_FORWARD", jump_forward;
            arg JumpIfFalseOrPop = 111, "JUMP_IF_FALSE_OR_POP", jump_if_false_or_pop;
            arg JumpIfTrueOrPop = 112, "JUMP_IF_TRUE_OR_POP", jump_if_true_or_pop;
            arg JumpAbsolute = 113, "JUMP_ABSOLUTE", jump_absolute;
            arg PopJumpIfFalse = 114, "POP_JUMP_IF_FALSE", pop_jump_if_false;
            arg PopJumpIfTrue = 115, "POP_JUMP_IF_TRUE", pop_jump_if_true;
            arg LoadGlobal = 116, "LOAD_GLOBAL", load_global;
            arg ContinueLoop = 119, "CONTINUE_LOOP", continue_loop;
            arg SetupLoop = 120, "SETUP_LOOP", setup_loop;
            arg SetupExcept = 121, "SETUP_EXCEPT", setup_except;
            arg SetupFinally = 122, "SETUP_FINALLY", setup_finally;
            arg LoadFast = 124, "LOAD_FAST", load_fast;
            arg StoreFast = 125, "STORE_FAST", store_fast;
            arg DeleteFast = 126, "DELETE_FAST", delete_fast;
            arg RaiseVarargs = 130, "RAISE_VARARGS", raise_varargs;
            arg CallFunction = 131, "CALL_FUNCTION", call_function;
            arg MakeFunction = 132, "MAKE_FUNCTION", make_function;
            arg BuildSlice = 133, "BUILD_SLICE", build_slice;
            arg MakeClosure = 134, "MAKE_CLOSURE", make_closure;
            arg LoadClosure = 135, "LOAD_CLOSURE", load_closure;
            arg LoadDeref = 136, "LOAD_DEREF", load_deref;
            arg StoreDeref = 137, "STORE_DEREF", store_deref;
            arg DeleteDeref = 138, "DELETE_DEREF", delete_deref;
            arg CallFunctionVar = 140, "CALL_FUNCTION_VAR", call_function_var;
            arg CallFunctionKw = 141, "CALL_FUNCTION_KW", call_function_kw;
            arg CallFunctionVarKw = 142, "CALL_FUNCTION_VAR_KW", call_function_var_kw;
            arg SetupWith = 143, "SETUP_WITH", setup_with;
            arg ListAppend = 145, "LIST_APPEND", list_append;
            arg SetAdd = 146, "SET_ADD", set_add;
            arg MapAdd = 147, "MAP_ADD", map_add;
            arg LoadClassderef = 148, "LOAD_CLASSDEREF", load_classderef;
            arg BuildListUnpack = 149, "BUILD_LIST_UNPACK", build_list_unpack;
            arg BuildMapUnpack = 150, "BUILD_MAP_UNPACK", build_map_unpack;
            arg BuildMapUnpackWithCall = 151, "BUILD_MAP_UNPACK_WITH_CALL", build_map_unpack_with_call;
            arg BuildTupleUnpack = 152, "BUILD_TUPLE_UNPACK", build_tuple_unpack;
            arg BuildSetUnpack = 153, "BUILD_SET_UNPACK", build_set_unpack;
            arg SetupAsyncWith = 154, "SETUP_ASYNC_WITH", setup_async_with;
        }
    };
}

pub(crate) use for_each_instruction;

macro_rules! define_opcodes {
    ($($shape:ident $variant:ident = $code:literal, $name:literal, $method:ident;)*) => {
        /// Bytecode opcodes of the target instruction set.
        ///
        /// `EXTENDED_ARG` is deliberately absent: it is an encoding detail emitted
        /// by the assembler, never requested by callers.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Opcode {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant = $code,
            )*
        }

        impl Opcode {
            /// Every opcode, sorted by numeric value.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant),*];

            /// Convert from u8, returning None if invalid.
            #[inline]
            pub const fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($code => Some(Opcode::$variant),)*
                    _ => None,
                }
            }

            /// Symbolic name, e.g. `LOAD_CONST`.
            #[inline]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }

            /// Name of the generation method on the builder, e.g. `load_const`.
            #[inline]
            pub const fn method_name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => stringify!($method),)*
                }
            }
        }
    };
}

for_each_instruction!(define_opcodes);

impl Opcode {
    /// Numeric encoding.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Whether the instruction carries an operand.
    #[inline]
    pub const fn has_arg(self) -> bool {
        self.code() >= HAVE_ARGUMENT
    }

    /// Operand indexes the constant pool.
    #[inline]
    pub const fn has_const(self) -> bool {
        matches!(self, Opcode::LoadConst)
    }

    /// Operand indexes the name pool.
    #[inline]
    pub const fn has_name(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            StoreName
                | DeleteName
                | StoreAttr
                | DeleteAttr
                | StoreGlobal
                | DeleteGlobal
                | LoadName
                | LoadAttr
                | ImportName
                | ImportFrom
                | LoadGlobal
        )
    }

    /// Operand is a forward offset relative to the next instruction.
    #[inline]
    pub const fn has_jrel(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            ForIter
                | JumpForward
                | SetupLoop
                | SetupExcept
                | SetupFinally
                | SetupWith
                | SetupAsyncWith
        )
    }

    /// Operand is an absolute byte offset.
    #[inline]
    pub const fn has_jabs(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            JumpIfFalseOrPop
                | JumpIfTrueOrPop
                | JumpAbsolute
                | PopJumpIfFalse
                | PopJumpIfTrue
                | ContinueLoop
        )
    }

    /// Operand is a jump target of either kind.
    #[inline]
    pub const fn has_jump(self) -> bool {
        self.has_jrel() || self.has_jabs()
    }

    /// Operand indexes the local variable pool.
    #[inline]
    pub const fn has_local(self) -> bool {
        matches!(self, Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast)
    }

    /// Operand indexes the cell/free variable pool.
    #[inline]
    pub const fn has_free(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            LoadClosure | LoadDeref | StoreDeref | DeleteDeref | LoadClassderef
        )
    }

    /// Operand selects a comparison operator.
    #[inline]
    pub const fn has_compare(self) -> bool {
        matches!(self, Opcode::CompareOp)
    }

    /// Operand packs positional and keyword argument counts.
    #[inline]
    pub const fn is_call(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            CallFunction | CallFunctionVar | CallFunctionKw | CallFunctionVarKw
        )
    }

    /// After this instruction the fall-through stack depth is unknowable.
    #[inline]
    pub const fn is_unconditional_transfer(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            ReturnValue | JumpForward | JumpAbsolute | ContinueLoop | BreakLoop | RaiseVarargs
        )
    }

    /// Opens a block that a later `POP_BLOCK` closes.
    #[inline]
    pub const fn is_block_setup(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            SetupLoop | SetupExcept | SetupFinally | SetupWith | SetupAsyncWith
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A catalog entry: the symbolic name paired with its opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Instruction {
    opcode: Opcode,
    name: &'static str,
}

impl Instruction {
    /// Create the catalog entry for an opcode.
    #[inline]
    pub const fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            name: opcode.name(),
        }
    }

    /// Symbolic name.
    #[inline]
    pub const fn name(self) -> &'static str {
        self.name
    }

    /// Numeric encoding.
    #[inline]
    pub const fn code(self) -> u8 {
        self.opcode.code()
    }

    /// The opcode.
    #[inline]
    pub const fn opcode(self) -> Opcode {
        self.opcode
    }
}

impl From<Opcode> for Instruction {
    fn from(opcode: Opcode) -> Self {
        Self::new(opcode)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.code())
    }
}

/// Encoded bytes of a single instruction (at most one `EXTENDED_ARG` prefix).
pub type EncodedInstruction = SmallVec<[u8; 6]>;

/// Encode an argument-less instruction.
#[inline]
pub fn encode_op(opcode: Opcode) -> EncodedInstruction {
    let mut bytes = EncodedInstruction::new();
    bytes.push(opcode.code());
    bytes
}

/// Encode an argument-bearing instruction, prefixing `EXTENDED_ARG` when the
/// operand needs more than 16 bits.
pub fn encode_arg(opcode: Opcode, arg: u32) -> EncodedInstruction {
    let mut bytes = EncodedInstruction::new();
    if arg > MAX_SHORT_ARG {
        let [hi_lo, hi_hi] = ((arg >> 16) as u16).to_le_bytes();
        bytes.extend_from_slice(&[EXTENDED_ARG, hi_lo, hi_hi]);
    }
    let [lo, hi] = ((arg & MAX_SHORT_ARG) as u16).to_le_bytes();
    bytes.extend_from_slice(&[opcode.code(), lo, hi]);
    bytes
}

/// Width in bytes of the instruction starting with `code`.
#[inline]
pub const fn instruction_width(code: u8) -> usize {
    if code >= HAVE_ARGUMENT { 3 } else { 1 }
}

/// A decoded instruction with its full operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// Byte offset of the first byte (the `EXTENDED_ARG` prefix when present).
    pub offset: usize,
    /// The raw opcode byte.
    pub code: u8,
    /// The operand, combined with any `EXTENDED_ARG` prefix.
    pub arg: Option<u32>,
}

/// Iterate over the instructions of an encoded stream, folding `EXTENDED_ARG`
/// prefixes into the operand of the following instruction.
///
/// Decoding stops at a truncated trailing instruction.
pub fn decode(code: &[u8]) -> impl Iterator<Item = DecodedInstruction> + '_ {
    let mut offset = 0;
    std::iter::from_fn(move || {
        let start = offset;
        let mut extended: u32 = 0;
        loop {
            let &op = code.get(offset)?;
            if op < HAVE_ARGUMENT {
                offset += 1;
                return Some(DecodedInstruction {
                    offset: start,
                    code: op,
                    arg: None,
                });
            }
            let lo = *code.get(offset + 1)?;
            let hi = *code.get(offset + 2)?;
            offset += 3;
            let arg = (extended << 16) | u32::from(u16::from_le_bytes([lo, hi]));
            if op == EXTENDED_ARG {
                extended = arg;
                continue;
            }
            return Some(DecodedInstruction {
                offset: start,
                code: op,
                arg: Some(arg),
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values_are_stable() {
        assert_eq!(Opcode::PopTop as u8, 1);
        assert_eq!(Opcode::BinaryAdd as u8, 23);
        assert_eq!(Opcode::ReturnValue as u8, 83);
        assert_eq!(Opcode::StoreName as u8, 90);
        assert_eq!(Opcode::LoadConst as u8, 100);
        assert_eq!(Opcode::LoadFast as u8, 124);
        assert_eq!(Opcode::StoreFast as u8, 125);
        assert_eq!(Opcode::CallFunction as u8, 131);
        assert_eq!(Opcode::SetupAsyncWith as u8, 154);
    }

    #[test]
    fn test_opcode_from_u8() {
        assert_eq!(Opcode::from_u8(100), Some(Opcode::LoadConst));
        assert_eq!(Opcode::from_u8(0), None);
        assert_eq!(Opcode::from_u8(54), None);
        assert_eq!(Opcode::from_u8(EXTENDED_ARG), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn test_all_is_sorted_and_round_trips() {
        assert!(Opcode::ALL.windows(2).all(|w| w[0] < w[1]));
        for &op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(op.code()), Some(op));
        }
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Opcode::LoadConst.method_name(), "load_const");
        assert_eq!(Opcode::ReturnValue.method_name(), "return_value");
        assert_eq!(
            Opcode::LoadConst.method_name().to_uppercase(),
            Opcode::LoadConst.name()
        );
    }

    #[test]
    fn test_has_arg_boundary() {
        assert!(!Opcode::PopExcept.has_arg());
        assert!(Opcode::StoreName.has_arg());
    }

    #[test]
    fn test_instruction_display() {
        let inst = Instruction::new(Opcode::LoadConst);
        assert_eq!(inst.to_string(), "LOAD_CONST: 100");
        assert_eq!(inst.name(), "LOAD_CONST");
        assert_eq!(inst.code(), 100);
    }

    #[test]
    fn test_encode_short_arg() {
        assert_eq!(encode_arg(Opcode::LoadConst, 1).as_slice(), &[100, 1, 0]);
        assert_eq!(
            encode_arg(Opcode::LoadConst, 0x1234).as_slice(),
            &[100, 0x34, 0x12]
        );
        assert_eq!(encode_op(Opcode::ReturnValue).as_slice(), &[83]);
    }

    #[test]
    fn test_encode_extended_arg() {
        let bytes = encode_arg(Opcode::LoadFast, 0x0001_0002);
        assert_eq!(bytes.as_slice(), &[EXTENDED_ARG, 1, 0, 124, 2, 0]);
    }

    #[test]
    fn test_decode_folds_extended_arg() {
        let mut code = encode_arg(Opcode::LoadConst, 70_000).to_vec();
        code.push(Opcode::ReturnValue.code());
        let decoded: Vec<_> = decode(&code).collect();

        assert_eq!(
            decoded,
            vec![
                DecodedInstruction {
                    offset: 0,
                    code: 100,
                    arg: Some(70_000)
                },
                DecodedInstruction {
                    offset: 6,
                    code: 83,
                    arg: None
                },
            ]
        );
    }

    #[test]
    fn test_decode_stops_at_truncation() {
        let code = [100, 1];
        assert_eq!(decode(&code).count(), 0);
    }

    #[test]
    fn test_instruction_width() {
        assert_eq!(instruction_width(Opcode::ReturnValue.code()), 1);
        assert_eq!(instruction_width(Opcode::LoadConst.code()), 3);
        assert_eq!(instruction_width(EXTENDED_ARG), 3);
    }
}
