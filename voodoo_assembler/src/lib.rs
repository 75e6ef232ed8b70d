//! Stack-tracking bytecode assembler for the CPython 3.5 instruction set.
//!
//! This crate builds executable units one instruction at a time, tracking the
//! operand stack as it goes and resolving symbolic operands into pool indices.
//!
//! # Architecture
//!
//! ```text
//! Instruction Catalog ─┐
//!                      ├→ Code (builder) → Persistor → CodeObject
//! Stack-Effect Table ──┘
//! ```
//!
//! # Key Types
//!
//! - [`Code`] - Unit builder with one generation method per instruction
//! - [`Opcode`] - The instruction set
//! - [`InstructionCatalog`] - Name lookup and operand-kind classification
//! - [`Persistor`] - Projects a builder onto a [`CodeObject`]
//!
//! # Example
//!
//! ```
//! use voodoo_assembler::{Code, Persistor};
//!
//! let mut code = Code::new("answer");
//! code.load_const(42)?;
//! code.return_value()?;
//!
//! let object = Persistor::to_code_type(&code)?;
//! assert_eq!(&*object.code, &[100, 1, 0, 83]);
//! assert_eq!(object.stacksize, 1);
//! # Ok::<(), voodoo_core::AssemblerError>(())
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod bytecode;
pub mod persistor;

// Re-export main types
pub use bytecode::{
    Block, Code, CompareOp, Instruction, InstructionCatalog, InstructionRef, Label, Opcode,
    Operand, OperandKind, StackDepth, StackEffect, catalog, stack_effect,
};
pub use persistor::Persistor;
pub use voodoo_core::{AssemblerError, AssemblerResult, CodeFlags, CodeObject, Constant};
