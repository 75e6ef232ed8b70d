//! # Voodoo Core
//!
//! Core types shared by the voodoo assembler and the collaborators built on top of
//! its output:
//!
//! - **Constants**: the pool value model with the platform's identity and equality rules
//! - **Code objects**: the positional layout of a materialized executable unit
//! - **Error Handling**: Result types and error definitions

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod code;
pub mod error;
pub mod value;

pub use code::{CodeFlags, CodeObject};
pub use error::{AssemblerError, AssemblerResult};
pub use value::Constant;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Python language version whose instruction set this assembler targets.
pub const PYTHON_VERSION: (u8, u8) = (3, 5);
