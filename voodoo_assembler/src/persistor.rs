//! Materialization of a finished [`Code`] builder into a [`CodeObject`].

use crate::bytecode::{Code, instruction_width};
use std::sync::Arc;
use tracing::debug;
use voodoo_core::{AssemblerError, AssemblerResult, CodeObject};

/// Converts builders into native code objects.
pub struct Persistor;

impl Persistor {
    /// Project a builder onto the positional code object layout.
    ///
    /// The builder is only borrowed and can keep being extended afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblerError::InvalidArtifact`] if the builder is not a
    /// finished unit: a forward jump still waits for its label, more arguments
    /// are declared than there are locals, or the stream ends inside an operand.
    pub fn to_code_type(code: &Code) -> AssemblerResult<CodeObject> {
        Self::validate(code)?;

        let object = CodeObject::new(
            code.argcount(),
            u32::try_from(code.varnames().len())
                .map_err(|_| AssemblerError::invalid_artifact("too many local variables"))?,
            code.stacksize(),
            code.flags(),
            code.code().into(),
            code.consts().into(),
            code.names().into(),
            code.varnames().into(),
            Arc::clone(code.filename()),
            Arc::clone(code.name()),
            code.firstlineno(),
            code.lnotab().into(),
        );

        debug!(
            name = %object.name,
            bytes = object.code.len(),
            consts = object.consts.len(),
            stacksize = object.stacksize,
            "materialized code object"
        );
        Ok(object)
    }

    fn validate(code: &Code) -> AssemblerResult<()> {
        if code.has_pending_jumps() {
            let labels: Vec<String> = code
                .pending_labels()
                .iter()
                .map(ToString::to_string)
                .collect();
            return Err(AssemblerError::invalid_artifact(format!(
                "unresolved jumps to {}",
                labels.join(", ")
            )));
        }

        let nlocals = code.varnames().len();
        if code.argcount() as usize > nlocals {
            return Err(AssemblerError::invalid_artifact(format!(
                "argcount {} exceeds the {nlocals} declared local(s)",
                code.argcount()
            )));
        }

        let stream = code.code();
        let mut offset = 0;
        while let Some(&op) = stream.get(offset) {
            offset += instruction_width(op);
        }
        if offset > stream.len() {
            return Err(AssemblerError::invalid_artifact(
                "instruction stream ends inside an operand",
            ));
        }

        Ok(())
    }
}
