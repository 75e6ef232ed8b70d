//! Native executable-unit layout.
//!
//! [`CodeObject`] mirrors the positional constructor of the target platform's
//! code type. Field order is significant: it is the order in which the
//! materializer projects a finished builder, and the order a loader expects.

use crate::value::Constant;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Compiler flags stored in `co_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CodeFlags: u32 {
        /// Locals are accessed with `LOAD_FAST`/`STORE_FAST`.
        const OPTIMIZED = 0x0001;
        /// A new locals dictionary is created for each call.
        const NEWLOCALS = 0x0002;
        /// The function takes `*args`.
        const VARARGS = 0x0004;
        /// The function takes `**kwargs`.
        const VARKEYWORDS = 0x0008;
        /// The function is nested inside another function.
        const NESTED = 0x0010;
        /// The function is a generator.
        const GENERATOR = 0x0020;
        /// The function has no free or cell variables.
        const NOFREE = 0x0040;
        /// The function is a native coroutine.
        const COROUTINE = 0x0080;
        /// A generator usable with `await`.
        const ITERABLE_COROUTINE = 0x0100;
        /// `from __future__ import division`.
        const FUTURE_DIVISION = 0x2000;
        /// `from __future__ import absolute_import`.
        const FUTURE_ABSOLUTE_IMPORT = 0x4000;
        /// `from __future__ import with_statement`.
        const FUTURE_WITH_STATEMENT = 0x8000;
    }
}

impl CodeFlags {
    /// Flags every new function body starts with.
    pub const DEFAULT: CodeFlags = CodeFlags::OPTIMIZED.union(CodeFlags::NEWLOCALS);

    /// Names of the set flags, lowest bit first.
    pub fn flag_names(self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

impl Default for CodeFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for CodeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("0x0000");
        }
        write!(f, "0x{:04x} ({})", self.bits(), self.flag_names().join(", "))
    }
}

/// A materialized code object.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    /// Number of positional arguments.
    pub argcount: u32,
    /// Number of local variables.
    pub nlocals: u32,
    /// Maximum operand stack depth.
    pub stacksize: u32,
    /// Compiler flags.
    pub flags: CodeFlags,
    /// Encoded instruction stream.
    pub code: Box<[u8]>,
    /// Constant pool.
    pub consts: Box<[Constant]>,
    /// Global and attribute names.
    pub names: Box<[Arc<str>]>,
    /// Local variable names; the index is the slot.
    pub varnames: Box<[Arc<str>]>,
    /// Source file name.
    pub filename: Arc<str>,
    /// Unit name.
    pub name: Arc<str>,
    /// First source line.
    pub firstlineno: u32,
    /// Line number table (`co_lnotab`).
    pub lnotab: Box<[u8]>,
}

impl CodeObject {
    /// Build a code object from its positional fields.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        argcount: u32,
        nlocals: u32,
        stacksize: u32,
        flags: CodeFlags,
        code: Box<[u8]>,
        consts: Box<[Constant]>,
        names: Box<[Arc<str>]>,
        varnames: Box<[Arc<str>]>,
        filename: Arc<str>,
        name: Arc<str>,
        firstlineno: u32,
        lnotab: Box<[u8]>,
    ) -> Self {
        Self {
            argcount,
            nlocals,
            stacksize,
            flags,
            code,
            consts,
            names,
            varnames,
            filename,
            name,
            firstlineno,
            lnotab,
        }
    }
}
