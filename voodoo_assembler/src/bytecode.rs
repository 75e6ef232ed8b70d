//! Stack-machine bytecode assembly.
//!
//! This module provides the instruction set and the unit builder:
//!
//! - [`Opcode`] / [`Instruction`] - The target instruction set
//! - [`InstructionCatalog`] - Name lookup and operand-kind classification
//! - [`StackEffect`] - Per-instruction stack transitions
//! - [`Code`] - Incremental unit builder

mod builder;
mod catalog;
mod instruction;
mod operand;
mod stack_effect;

pub use builder::{Block, Code, InstructionRef, Label, StackDepth};
pub use catalog::{InstructionCatalog, OperandKind, RETIRED, catalog};
pub use instruction::{
    DecodedInstruction, EXTENDED_ARG, EncodedInstruction, HAVE_ARGUMENT, Instruction,
    MAX_SHORT_ARG, Opcode, decode, encode_arg, encode_op, instruction_width,
};
pub use operand::{CompareOp, Operand};
pub use stack_effect::{StackEffect, jump_target_depth, stack_effect};
