//! Error types and result definitions for the assembler.
//!
//! Every failure the assembler can report is a variant of [`AssemblerError`]:
//! - Catalog misses (unknown or retired instructions)
//! - Stack tracking failures (underflow, unknown depth, missing stack effect)
//! - Operand resolution failures (wrong operand shape, oversized operand)
//! - Materialization failures (invalid artifact, unresolved jumps)
//!
//! All errors are raised synchronously at the point of violation. They describe a
//! malformed assembly program, so none of them is worth retrying.

use thiserror::Error;

/// The unified result type used throughout the assembler.
pub type AssemblerResult<T> = Result<T, AssemblerError>;

/// Comprehensive error type covering all assembler error conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblerError {
    /// Symbolic instruction name not present in the catalog.
    #[error("UnknownInstruction: '{name}' is not an instruction of the target instruction set")]
    UnknownInstruction {
        /// The name that failed to resolve.
        name: String,
    },

    /// An instruction would pop more values than the stack holds.
    #[error(
        "StackUnderflow: {instruction} pops {pops} value(s) but the stack depth is {depth}"
    )]
    StackUnderflow {
        /// Name of the instruction being generated.
        instruction: String,
        /// Stack depth before the instruction.
        depth: u32,
        /// Number of values the instruction pops.
        pops: u32,
    },

    /// An instruction was generated after an unconditional control transfer.
    #[error(
        "UnknownStackSizeError: stack depth is unknown before {instruction}; bind a label or set the depth first"
    )]
    UnknownStackSize {
        /// Name of the instruction being generated.
        instruction: String,
    },

    /// A permanently retired instruction was invoked.
    #[error("UnsupportedInstruction: {name} was removed from the instruction set, use {replacement} instead")]
    UnsupportedInstruction {
        /// The retired instruction name.
        name: String,
        /// The instruction that replaces it.
        replacement: String,
    },

    /// A generation operation was requested that the dispatch table does not know.
    #[error(
        "AssemblerBytecodeException: {state} has no operation '{operation}' (arguments: [{}])",
        .arguments.join(", ")
    )]
    MissingOperation {
        /// Summary of the receiving builder.
        state: String,
        /// The operation name that was attempted.
        operation: String,
        /// Rendered arguments of the attempted call.
        arguments: Vec<String>,
    },

    /// An opcode has no known stack effect.
    #[error("AssemblerBytecodeException: no known stack effect for {instruction}")]
    NoStackEffect {
        /// Name of the instruction being generated.
        instruction: String,
    },

    /// An operand does not fit the instruction encoding.
    #[error("AssemblerBytecodeException: operand {value} of {instruction} does not fit the encoding")]
    OperandOverflow {
        /// Name of the instruction being generated.
        instruction: String,
        /// The offending operand value.
        value: u64,
    },

    /// An operand has the wrong shape for the instruction kind.
    #[error("AssemblerBytecodeException: {instruction} cannot take operand {operand}")]
    InvalidOperand {
        /// Name of the instruction being generated.
        instruction: String,
        /// Rendered operand.
        operand: String,
    },

    /// A jump references a label that was never bound.
    #[error("AssemblerBytecodeException: label {label} is referenced but never bound")]
    UnboundLabel {
        /// The label identifier.
        label: u32,
    },

    /// The materializer was handed something that is not a finished unit.
    #[error("InvalidArtifact: {reason}")]
    InvalidArtifact {
        /// Why the artifact was rejected.
        reason: String,
    },

    /// An index search found no occurrence of the instruction.
    #[error("IndexNotFound: {instruction} does not occur in the instruction stream")]
    IndexNotFound {
        /// Name of the searched instruction.
        instruction: String,
    },
}

impl AssemblerError {
    /// Create an unknown-instruction error.
    #[must_use]
    pub fn unknown_instruction(name: impl Into<String>) -> Self {
        Self::UnknownInstruction { name: name.into() }
    }

    /// Create a stack underflow error.
    #[must_use]
    pub fn stack_underflow(instruction: impl Into<String>, depth: u32, pops: u32) -> Self {
        Self::StackUnderflow {
            instruction: instruction.into(),
            depth,
            pops,
        }
    }

    /// Create an unknown-stack-size error.
    #[must_use]
    pub fn unknown_stack_size(instruction: impl Into<String>) -> Self {
        Self::UnknownStackSize {
            instruction: instruction.into(),
        }
    }

    /// Create a retired-instruction error.
    #[must_use]
    pub fn unsupported(name: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self::UnsupportedInstruction {
            name: name.into(),
            replacement: replacement.into(),
        }
    }

    /// Create a missing-operation error.
    #[must_use]
    pub fn missing_operation(
        state: impl Into<String>,
        operation: impl Into<String>,
        arguments: Vec<String>,
    ) -> Self {
        Self::MissingOperation {
            state: state.into(),
            operation: operation.into(),
            arguments,
        }
    }

    /// Create a missing stack effect error.
    #[must_use]
    pub fn no_stack_effect(instruction: impl Into<String>) -> Self {
        Self::NoStackEffect {
            instruction: instruction.into(),
        }
    }

    /// Create an operand overflow error.
    #[must_use]
    pub fn operand_overflow(instruction: impl Into<String>, value: u64) -> Self {
        Self::OperandOverflow {
            instruction: instruction.into(),
            value,
        }
    }

    /// Create an invalid operand error.
    #[must_use]
    pub fn invalid_operand(instruction: impl Into<String>, operand: impl Into<String>) -> Self {
        Self::InvalidOperand {
            instruction: instruction.into(),
            operand: operand.into(),
        }
    }

    /// Create an invalid artifact error.
    #[must_use]
    pub fn invalid_artifact(reason: impl Into<String>) -> Self {
        Self::InvalidArtifact {
            reason: reason.into(),
        }
    }

    /// Create an index-not-found error.
    #[must_use]
    pub fn index_not_found(instruction: impl Into<String>) -> Self {
        Self::IndexNotFound {
            instruction: instruction.into(),
        }
    }

    /// Get the exception class name this error reports as.
    #[must_use]
    pub fn exception_type(&self) -> &'static str {
        match self {
            Self::UnknownInstruction { .. } => "UnknownInstruction",
            Self::StackUnderflow { .. } => "StackUnderflow",
            Self::UnknownStackSize { .. } => "UnknownStackSizeError",
            Self::UnsupportedInstruction { .. } => "UnsupportedInstruction",
            Self::MissingOperation { .. }
            | Self::NoStackEffect { .. }
            | Self::OperandOverflow { .. }
            | Self::InvalidOperand { .. }
            | Self::UnboundLabel { .. } => "AssemblerBytecodeException",
            Self::InvalidArtifact { .. } => "InvalidArtifact",
            Self::IndexNotFound { .. } => "IndexNotFound",
        }
    }

    /// Whether this error belongs to the `AssemblerBytecodeException` family.
    ///
    /// Materialization and index-search failures are reported separately.
    #[must_use]
    pub fn is_bytecode_exception(&self) -> bool {
        !matches!(
            self,
            Self::InvalidArtifact { .. } | Self::IndexNotFound { .. }
        )
    }
}
