//! Symbolic operands accepted by generation operations.
//!
//! An operand is resolved according to the instruction's operand kind:
//!
//! | Kind | `Int` | `Value` | `Name` | `Label` | `Compare` |
//! |------|-------|---------|--------|---------|-----------|
//! | const | value | value | string value | - | - |
//! | local, free, name | raw index | - | pool lookup | - | - |
//! | jump | raw offset | - | - | target | - |
//! | compare | raw index | - | operator symbol | - | operator |
//! | other | raw value | - | - | - | - |

use super::builder::Label;
use std::fmt;
use std::sync::Arc;
use voodoo_core::Constant;

/// Comparison operators selected by `COMPARE_OP`, in operand order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompareOp {
    /// `<`
    Lt = 0,
    /// `<=`
    Le = 1,
    /// `==`
    Eq = 2,
    /// `!=`
    Ne = 3,
    /// `>`
    Gt = 4,
    /// `>=`
    Ge = 5,
    /// `in`
    In = 6,
    /// `not in`
    NotIn = 7,
    /// `is`
    Is = 8,
    /// `is not`
    IsNot = 9,
    /// `exception match`
    ExceptionMatch = 10,
    /// Sentinel for an invalid comparison.
    Bad = 11,
}

impl CompareOp {
    /// Every operator, in operand order.
    pub const ALL: [CompareOp; 12] = [
        CompareOp::Lt,
        CompareOp::Le,
        CompareOp::Eq,
        CompareOp::Ne,
        CompareOp::Gt,
        CompareOp::Ge,
        CompareOp::In,
        CompareOp::NotIn,
        CompareOp::Is,
        CompareOp::IsNot,
        CompareOp::ExceptionMatch,
        CompareOp::Bad,
    ];

    /// Operator text.
    pub const fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
            CompareOp::Is => "is",
            CompareOp::IsNot => "is not",
            CompareOp::ExceptionMatch => "exception match",
            CompareOp::Bad => "BAD",
        }
    }

    /// Parse operator text.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.symbol() == symbol)
    }

    /// Operand value.
    #[inline]
    pub const fn index(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// An unresolved operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// An integer: a constant value for `LOAD_CONST`, a raw operand otherwise.
    Int(i64),
    /// A constant value.
    Value(Constant),
    /// An identifier, or string constant for `LOAD_CONST`.
    Name(Arc<str>),
    /// A jump target.
    Label(Label),
    /// A comparison operator.
    Compare(CompareOp),
}

impl Operand {
    /// Pack a call-style operand: positional count in the low byte, keyword
    /// count in the high byte.
    #[inline]
    pub fn call(positional: u8, keyword: u8) -> Self {
        Self::Int(i64::from(positional) | (i64::from(keyword) << 8))
    }

    /// Pack a `MAKE_FUNCTION`/`MAKE_CLOSURE` operand.
    #[inline]
    pub fn function(positional_defaults: u8, keyword_defaults: u8, annotations: u16) -> Self {
        Self::Int(
            i64::from(positional_defaults)
                | (i64::from(keyword_defaults) << 8)
                | (i64::from(annotations) << 16),
        )
    }

    /// Pack an `UNPACK_EX` operand: targets before and after the starred one.
    #[inline]
    pub fn unpack_ex(before: u8, after: u32) -> Self {
        Self::Int(i64::from(before) | (i64::from(after) << 8))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Int(i) => write!(f, "{i}"),
            Operand::Value(value) => write!(f, "{value}"),
            Operand::Name(name) => write!(f, "'{name}'"),
            Operand::Label(label) => write!(f, "{label}"),
            Operand::Compare(op) => write!(f, "'{op}'"),
        }
    }
}

macro_rules! int_operand {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Operand {
                fn from(value: $ty) -> Self {
                    Operand::Int(i64::from(value))
                }
            }
        )*
    };
}

int_operand!(u8, u16, u32, i32, i64);

impl From<usize> for Operand {
    fn from(value: usize) -> Self {
        Operand::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for Operand {
    fn from(value: bool) -> Self {
        Operand::Value(Constant::Bool(value))
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand::Value(Constant::Float(value))
    }
}

impl From<&str> for Operand {
    fn from(name: &str) -> Self {
        Operand::Name(name.into())
    }
}

impl From<String> for Operand {
    fn from(name: String) -> Self {
        Operand::Name(name.into())
    }
}

impl From<Arc<str>> for Operand {
    fn from(name: Arc<str>) -> Self {
        Operand::Name(name)
    }
}

impl From<Constant> for Operand {
    fn from(value: Constant) -> Self {
        Operand::Value(value)
    }
}

impl From<Label> for Operand {
    fn from(label: Label) -> Self {
        Operand::Label(label)
    }
}

impl From<CompareOp> for Operand {
    fn from(op: CompareOp) -> Self {
        Operand::Compare(op)
    }
}
