//! Constant values carried in a code object's constant pool.
//!
//! The pool may hold any value the target platform can embed in a code object.
//! Deduplication in the assembler depends on three questions this module answers
//! the way the platform does:
//!
//! | Question | Rule |
//! |----------|------|
//! | same type? | identical variant (`True` is a `bool`, `1` is an `int`) |
//! | same object? | pointer identity for heap values, bit identity for floats |
//! | equal? | platform `==`, where `True == 1 == 1.0` and tuples compare element-wise |
//!
//! Only hashable values are ever compared by equality. A list, or a tuple
//! containing one, is matched by identity alone.

use crate::code::CodeObject;
use std::fmt;
use std::sync::Arc;

/// A value stored in the constant pool.
#[derive(Debug, Clone)]
pub enum Constant {
    /// The `None` singleton.
    None,
    /// The `Ellipsis` singleton.
    Ellipsis,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A double precision float.
    Float(f64),
    /// A text string.
    Str(Arc<str>),
    /// A byte string.
    Bytes(Arc<[u8]>),
    /// An immutable sequence.
    Tuple(Arc<[Constant]>),
    /// A mutable sequence; never hashable.
    List(Arc<[Constant]>),
    /// A nested code object (function bodies, class bodies, comprehensions).
    Code(Arc<CodeObject>),
}

impl Constant {
    /// Create a string constant.
    #[inline]
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Self::Str(s.into())
    }

    /// Create a tuple constant.
    pub fn tuple(items: impl IntoIterator<Item = Constant>) -> Self {
        Self::Tuple(items.into_iter().collect())
    }

    /// Create a list constant.
    pub fn list(items: impl IntoIterator<Item = Constant>) -> Self {
        Self::List(items.into_iter().collect())
    }

    /// Name of the platform type of this value.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Ellipsis => "ellipsis",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Code(_) => "code",
        }
    }

    /// Check whether two values have the same platform type.
    #[inline]
    #[must_use]
    pub fn same_type(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Check whether the value is hashable (and therefore comparable by equality).
    #[must_use]
    pub fn is_hashable(&self) -> bool {
        match self {
            Self::List(_) => false,
            Self::Tuple(items) => items.iter().all(Constant::is_hashable),
            _ => true,
        }
    }

    /// Check whether two values are the same object.
    ///
    /// Immediate values have no separate identity, so they are identical when
    /// they hold the same bits.
    #[must_use]
    pub fn is_identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::Ellipsis, Self::Ellipsis) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => Arc::ptr_eq(a, b),
            (Self::Bytes(a), Self::Bytes(b)) => Arc::ptr_eq(a, b),
            (Self::Tuple(a), Self::Tuple(b)) | (Self::List(a), Self::List(b)) => {
                Arc::ptr_eq(a, b)
            }
            (Self::Code(a), Self::Code(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The pool-sharing rule: same type, and either the same object or an equal
    /// hashable value.
    #[must_use]
    pub fn shares_slot_with(&self, other: &Self) -> bool {
        self.same_type(other)
            && (self.is_identical(other) || (other.is_hashable() && self == other))
    }

    fn as_number(&self) -> Option<Number> {
        match self {
            Self::Bool(b) => Some(Number::Int(i64::from(*b))),
            Self::Int(i) => Some(Number::Int(*i)),
            Self::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    #[allow(clippy::cast_possible_truncation)]
    fn numeric_eq(self, other: Self) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            (Number::Float(a), Number::Float(b)) => a == b,
            // Widened so a saturating cast cannot land on i64::MAX.
            (Number::Int(i), Number::Float(f)) | (Number::Float(f), Number::Int(i)) => {
                f.fract() == 0.0 && f as i128 == i128::from(i)
            }
        }
    }
}

/// Platform `==`: numbers compare across `bool`/`int`/`float`, sequences
/// compare element-wise and never equal a sequence of the other kind.
impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a.numeric_eq(b);
        }
        match (self, other) {
            (Self::None, Self::None) | (Self::Ellipsis, Self::Ellipsis) => true,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) | (Self::List(a), Self::List(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.is_identical(y) || x == y)
            }
            (Self::Code(a), Self::Code(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Ellipsis => f.write_str("Ellipsis"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) if x.is_finite() && x.fract() == 0.0 => write!(f, "{x:.1}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write_str_repr(f, s),
            Self::Bytes(b) => {
                f.write_str("b'")?;
                for &byte in b.iter() {
                    write!(f, "{}", std::ascii::escape_default(byte))?;
                }
                f.write_str("'")
            }
            Self::Tuple(items) => {
                f.write_str("(")?;
                write_items(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Self::List(items) => {
                f.write_str("[")?;
                write_items(f, items)?;
                f.write_str("]")
            }
            Self::Code(code) => write!(f, "<code object {}>", code.name),
        }
    }
}

/// Quote like the platform's `repr`: single quotes unless the text contains a
/// single quote and no double quote.
fn write_str_repr(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    write!(f, "{quote}")?;
    for c in s.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if c == quote => write!(f, "\\{c}")?,
            c if u32::from(c) < 0x20 || c == '\x7f' => write!(f, "\\x{:02x}", u32::from(c))?,
            c => write!(f, "{c}")?,
        }
    }
    write!(f, "{quote}")
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[Constant]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl From<bool> for Constant {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Constant {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<i64> for Constant {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u32> for Constant {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Constant {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Constant {
    fn from(s: &str) -> Self {
        Self::Str(s.into())
    }
}

impl From<String> for Constant {
    fn from(s: String) -> Self {
        Self::Str(s.into())
    }
}

impl From<Arc<str>> for Constant {
    fn from(s: Arc<str>) -> Self {
        Self::Str(s)
    }
}

impl From<&[u8]> for Constant {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.into())
    }
}

impl From<CodeObject> for Constant {
    fn from(code: CodeObject) -> Self {
        Self::Code(Arc::new(code))
    }
}

impl From<Arc<CodeObject>> for Constant {
    fn from(code: Arc<CodeObject>) -> Self {
        Self::Code(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_and_int_are_equal_but_different_types() {
        let t = Constant::Bool(true);
        let one = Constant::Int(1);

        assert_eq!(t, one);
        assert!(!t.same_type(&one));
        assert!(!t.shares_slot_with(&one));
    }

    #[test]
    fn test_int_and_float_equality() {
        assert_eq!(Constant::Int(2), Constant::Float(2.0));
        assert_ne!(Constant::Int(2), Constant::Float(2.5));
        assert!(!Constant::Int(2).shares_slot_with(&Constant::Float(2.0)));
    }

    #[test]
    fn test_int_float_equality_is_exact_at_the_i64_edge() {
        // 2**63 is one past i64::MAX.
        let edge = Constant::Float(2f64.powi(63));
        let max = Constant::Int(i64::MAX);

        assert_ne!(max, edge);
        assert_eq!(Constant::Int(i64::MIN), Constant::Float(-(2f64.powi(63))));
        assert_ne!(Constant::Int(0), Constant::Float(f64::INFINITY));

        let a = Constant::tuple([max]);
        let b = Constant::tuple([edge]);
        assert_ne!(a, b);
        assert!(!a.shares_slot_with(&b));
    }

    #[test]
    fn test_equal_strings_share_a_slot() {
        let a = Constant::str("hello");
        let b = Constant::str(String::from("hello"));

        assert!(!a.is_identical(&b));
        assert!(a.shares_slot_with(&b));
    }

    #[test]
    fn test_negative_zero_shares_slot_with_zero() {
        assert!(Constant::Float(0.0).shares_slot_with(&Constant::Float(-0.0)));
    }

    #[test]
    fn test_nan_only_shares_slot_with_itself() {
        let nan = Constant::Float(f64::NAN);

        assert_ne!(nan, nan.clone());
        assert!(nan.shares_slot_with(&nan.clone()));
        assert!(!nan.shares_slot_with(&Constant::Float(-f64::NAN)));
    }

    #[test]
    fn test_tuples_compare_elementwise_with_numeric_coercion() {
        let a = Constant::tuple([Constant::Int(1), Constant::str("x")]);
        let b = Constant::tuple([Constant::Bool(true), Constant::str("x")]);

        assert_eq!(a, b);
        assert!(a.shares_slot_with(&b));
    }

    #[test]
    fn test_lists_are_never_hashable() {
        let a = Constant::list([Constant::Int(1)]);
        let b = Constant::list([Constant::Int(1)]);

        assert!(!a.is_hashable());
        assert_eq!(a, b);
        assert!(!a.shares_slot_with(&b));
        assert!(a.shares_slot_with(&a.clone()));
    }

    #[test]
    fn test_tuple_containing_list_is_unhashable() {
        let t = Constant::tuple([Constant::list([])]);
        assert!(!t.is_hashable());
    }

    #[test]
    fn test_tuple_never_equals_list() {
        let t = Constant::tuple([Constant::Int(1)]);
        let l = Constant::list([Constant::Int(1)]);
        assert_ne!(t, l);
    }

    #[test]
    fn test_display_matches_platform_repr() {
        assert_eq!(Constant::None.to_string(), "None");
        assert_eq!(Constant::Bool(true).to_string(), "True");
        assert_eq!(Constant::Int(-7).to_string(), "-7");
        assert_eq!(Constant::Float(1.0).to_string(), "1.0");
        assert_eq!(Constant::Float(2.5).to_string(), "2.5");
        assert_eq!(Constant::str("a").to_string(), "'a'");
        assert_eq!(Constant::str("it's").to_string(), "\"it's\"");
        assert_eq!(Constant::str("'\"\n").to_string(), "'\\'\"\\n'");
        assert_eq!(Constant::str("a\\b\u{1}").to_string(), "'a\\\\b\\x01'");
        assert_eq!(Constant::from(&b"a\n"[..]).to_string(), "b'a\\n'");
        assert_eq!(Constant::tuple([Constant::Int(1)]).to_string(), "(1,)");
        assert_eq!(
            Constant::list([Constant::Int(1), Constant::None]).to_string(),
            "[1, None]"
        );
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Constant::None.type_name(), "NoneType");
        assert_eq!(Constant::from(3).type_name(), "int");
        assert_eq!(Constant::from(false).type_name(), "bool");
        assert_eq!(Constant::from("s").type_name(), "str");
    }
}
