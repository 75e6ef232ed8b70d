//! Integration tests for unit assembly.
//!
//! Expected byte streams are what CPython 3.5 produces for the equivalent
//! source, with the constant pool laid out by this builder (`None` first).

use std::sync::Arc;
use voodoo_assembler::bytecode::EXTENDED_ARG;
use voodoo_assembler::{
    AssemblerError, Code, CodeFlags, Constant, Opcode, Operand, Persistor, StackDepth,
};

// =============================================================================
// Test Helpers
// =============================================================================

fn names(items: &[&str]) -> Vec<Arc<str>> {
    items.iter().map(|&s| Arc::from(s)).collect()
}

/// Byte offsets of every occurrence of `opcode`.
fn find_opcodes(code: &Code, opcode: Opcode) -> Vec<usize> {
    code.find_opcode_index(opcode).expect("catalog opcode")
}

// =============================================================================
// Reference Fixtures
// =============================================================================

#[test]
fn test_code_return_function() {
    let mut code = Code::default();
    code.load_const(42).unwrap();
    code.return_value().unwrap();

    assert_eq!(code.consts(), &[Constant::None, Constant::Int(42)]);
    assert_eq!(code.code(), &[100, 1, 0, 83]);
    assert_eq!(code.firstlineno(), 0);
    assert!(code.blocks().is_empty());
    assert_eq!(code.argcount(), 0);
}

#[test]
fn test_semantic_equivalence_return_function() {
    // def test_function(): return 42
    let expected: &[u8] = b"d\x01\x00S";

    let mut code = Code::new("test_function");
    code.load_const(42).unwrap();
    code.return_value().unwrap();

    assert_eq!(code.to_bytes(), expected);
}

#[test]
fn test_code_load_return() {
    let mut code = Code::default();
    code.load_const(1).unwrap();
    code.store_fast(0).unwrap();
    code.load_fast(0).unwrap();
    code.return_value().unwrap();

    assert_eq!(code.consts(), &[Constant::None, Constant::Int(1)]);
    assert_eq!(code.code(), &[100, 1, 0, 125, 0, 0, 124, 0, 0, 83]);
    assert!(code.blocks().is_empty());
}

#[test]
fn test_semantic_equivalence_load_return() {
    // def load_and_return(): a = 1; return a
    let expected: &[u8] = b"d\x01\x00}\x00\x00|\x00\x00S";

    let mut code = Code::new("load_and_return");
    code.load_const(1).unwrap();
    code.store_fast("a").unwrap();
    code.load_fast("a").unwrap();
    code.return_value().unwrap();

    assert_eq!(code.to_bytes(), expected);
    assert_eq!(code.varnames(), names(&["a"]).as_slice());
}

#[test]
fn test_module_with_line_numbers() {
    // x = 1
    // y = 2
    // print(x + y)
    let mut code = Code::default();
    code.set_lineno(1);
    code.load_const(1).unwrap();
    code.store_name("x").unwrap();
    code.set_lineno(2);
    code.load_const(2).unwrap();
    code.store_name("y").unwrap();
    code.set_lineno(3);
    code.load_name("print").unwrap();
    code.load_name("x").unwrap();
    code.load_name("y").unwrap();
    code.binary_add().unwrap();
    code.call_function(Operand::call(1, 0)).unwrap();
    code.pop_top().unwrap();
    code.load_const(Constant::None).unwrap();
    code.return_value().unwrap();

    let object = Persistor::to_code_type(&code).unwrap();
    assert_eq!(
        &*object.code,
        &[
            100, 1, 0, 90, 0, 0, 100, 2, 0, 90, 1, 0, 101, 2, 0, 101, 0, 0, 101, 1, 0, 23, 131,
            1, 0, 1, 100, 0, 0, 83
        ]
    );
    assert_eq!(&*object.names, names(&["x", "y", "print"]).as_slice());
    assert_eq!(object.stacksize, 3);
    assert_eq!(object.firstlineno, 1);
    assert_eq!(&*object.lnotab, &[6, 1, 6, 1]);
}

#[test]
fn test_while_loop() {
    // i = 0
    // while i < 3:
    //     i += 1
    let mut code = Code::default();
    let loop_end = code.new_label();
    let loop_top = code.new_label();
    let loop_exit = code.new_label();

    code.load_const(0).unwrap();
    code.store_name("i").unwrap();
    code.setup_loop(loop_end).unwrap();
    code.bind_label(loop_top).unwrap();
    code.load_name("i").unwrap();
    code.load_const(3).unwrap();
    code.compare_op("<").unwrap();
    code.pop_jump_if_false(loop_exit).unwrap();
    code.load_name("i").unwrap();
    code.load_const(1).unwrap();
    code.inplace_add().unwrap();
    code.store_name("i").unwrap();
    code.jump_absolute(loop_top).unwrap();
    code.bind_label(loop_exit).unwrap();
    code.pop_block().unwrap();
    code.bind_label(loop_end).unwrap();
    code.load_const(Constant::None).unwrap();
    code.return_value().unwrap();

    assert_eq!(
        code.code(),
        &[
            100, 1, 0, 90, 0, 0, 120, 26, 0, 101, 0, 0, 100, 2, 0, 107, 0, 0, 114, 34, 0, 101, 0,
            0, 100, 3, 0, 55, 90, 0, 0, 113, 9, 0, 87, 100, 0, 0, 83
        ]
    );
    assert_eq!(code.stacksize(), 2);
    assert!(!code.has_pending_jumps());
}

#[test]
fn test_function_with_arguments() {
    // def add(a, b): return a + b
    let mut code = Code::new("add");
    code.set_filename("math.py");
    code.set_first_lineno(1);
    code.add_flags(CodeFlags::NOFREE);
    code.declare_arguments(["a", "b"]).unwrap();
    code.load_fast("a").unwrap();
    code.load_fast("b").unwrap();
    code.binary_add().unwrap();
    code.return_value().unwrap();

    let object = code.finish().unwrap();
    assert_eq!(object.argcount, 2);
    assert_eq!(object.nlocals, 2);
    assert_eq!(object.stacksize, 2);
    assert_eq!(object.flags.bits(), 0x43);
    assert_eq!(&*object.code, b"|\x00\x00|\x01\x00\x17S");
    assert_eq!(&*object.filename, "math.py");
}

#[test]
fn test_nested_code_object_constant() {
    let mut inner = Code::new("inner");
    inner.load_const(1).unwrap();
    inner.return_value().unwrap();
    let inner = Arc::new(inner.finish().unwrap());

    // def outer(): def inner(): return 1
    let mut outer = Code::new("outer");
    outer.load_const(Constant::Code(Arc::clone(&inner))).unwrap();
    outer.load_const("outer.<locals>.inner").unwrap();
    outer.make_function(0).unwrap();
    outer.store_fast("inner").unwrap();
    outer.load_const(Constant::Code(Arc::clone(&inner))).unwrap();

    assert_eq!(outer.consts().len(), 3);
    assert_eq!(outer.stacksize(), 2);
    assert_eq!(find_opcodes(&outer, Opcode::LoadConst), vec![0, 3, 12]);
    assert_eq!(&outer.code()[12..15], &[100, 1, 0]);
}

// =============================================================================
// Stack Tracking
// =============================================================================

#[test]
fn test_stack_depth_invariant() {
    let mut code = Code::default();
    code.load_const(1).unwrap();
    code.load_const(2).unwrap();
    code.load_const(3).unwrap();
    code.build_tuple(3).unwrap();
    code.unpack_sequence(3).unwrap();
    code.pop_top().unwrap();
    code.pop_top().unwrap();

    assert_eq!(code.stack_depth(), StackDepth::Known(1));
    assert_eq!(code.stacksize(), 3);
    assert_eq!(
        code.stacksize(),
        code.stack_history().iter().copied().max().unwrap()
    );
    assert_eq!(code.stack_history().len(), code.code().len());
}

#[test]
fn test_underflow_on_empty_builder() {
    for name in ["POP_TOP", "BINARY_ADD", "RETURN_VALUE", "STORE_SUBSCR"] {
        let mut code = Code::default();
        let err = code.generate(name, &[]).unwrap_err();
        assert_eq!(err.exception_type(), "StackUnderflow", "{name}");
        assert!(code.code().is_empty());
    }
}

#[test]
fn test_unknown_depth_after_unconditional_transfer() {
    for transfer in [
        Opcode::ReturnValue,
        Opcode::BreakLoop,
        Opcode::RaiseVarargs,
    ] {
        let mut code = Code::default();
        code.load_const(1).unwrap();
        let arg = transfer.has_arg().then_some(1);
        code.emit_raw(transfer, arg).unwrap();

        assert_eq!(code.stack_depth(), StackDepth::Unknown, "{transfer}");
        let err = code.nop().unwrap_err();
        assert_eq!(err, AssemblerError::unknown_stack_size("NOP"));
    }
}

// =============================================================================
// Pools
// =============================================================================

#[test]
fn test_constant_dedup_keeps_types_apart() {
    let mut code = Code::default();
    code.load_const(true).unwrap();
    code.load_const(1).unwrap();
    code.load_const(1.0).unwrap();
    code.load_const(true).unwrap();
    code.load_const(1).unwrap();

    assert_eq!(code.consts().len(), 4);
    assert!(matches!(code.consts()[1], Constant::Bool(true)));
    assert!(matches!(code.consts()[2], Constant::Int(1)));
    assert!(matches!(code.consts()[3], Constant::Float(_)));
    assert_eq!(
        &code.code()[9..],
        &[100, 1, 0, 100, 2, 0],
        "repeated loads reuse the first slot"
    );
}

#[test]
fn test_unhashable_constants_dedup_by_identity() {
    let list = Constant::list([Constant::Int(1)]);
    let mut code = Code::default();
    code.load_const(list.clone()).unwrap();
    code.load_const(list).unwrap();
    code.load_const(Constant::list([Constant::Int(1)])).unwrap();

    assert_eq!(code.consts().len(), 3);
}

#[test]
fn test_equal_tuples_share_a_slot() {
    let mut code = Code::default();
    code.load_const(Constant::tuple([Constant::Int(1), Constant::str("a")]))
        .unwrap();
    code.load_const(Constant::tuple([Constant::Int(1), Constant::str("a")]))
        .unwrap();

    assert_eq!(code.consts().len(), 2);
}

#[test]
fn test_load_before_store_synthesis() {
    let mut code = Code::new("f");
    code.load_const(5).unwrap();
    code.load_fast("n").unwrap();
    code.return_value().unwrap();

    assert_eq!(code.varnames(), names(&["n"]).as_slice());
    assert_eq!(find_opcodes(&code, Opcode::StoreFast), vec![3]);
    assert_eq!(find_opcodes(&code, Opcode::LoadFast), vec![6]);
}

#[test]
fn test_free_variable_operands_resolve_as_locals() {
    let mut code = Code::new("f");
    code.define_local("cell");
    code.load_closure("cell").unwrap();
    code.load_deref(0).unwrap();

    assert_eq!(code.code(), &[135, 0, 0, 136, 0, 0]);
}

// =============================================================================
// Guards And Dispatch
// =============================================================================

#[test]
fn test_retired_instructions_always_fail() {
    let mut code = Code::default();
    code.load_const(1).unwrap();

    for result in [
        code.stop_code(),
        code.store_map(),
        code.generate("STOP_CODE", &[]),
        code.generate("store_map", &[Operand::Int(3)]),
    ] {
        let err = result.unwrap_err();
        assert_eq!(err.exception_type(), "UnsupportedInstruction");
    }
    assert_eq!(code.code().len(), 3);
}

#[test]
fn test_missing_operation_is_a_bytecode_exception() {
    let mut code = Code::default();
    let err = code.generate("FROBNICATE", &[Operand::Int(1)]).unwrap_err();

    assert!(matches!(err, AssemblerError::MissingOperation { .. }));
    assert!(err.is_bytecode_exception());
    assert!(err.to_string().contains("FROBNICATE"));
    assert!(err.to_string().contains("<Code '<module>'"));
}

#[test]
fn test_every_catalog_instruction_has_a_generation_operation() {
    for &opcode in Opcode::ALL {
        let mut code = Code::default();
        code.set_stack_depth(16);
        let args = if opcode.has_jump() {
            let label = code.new_label();
            vec![Operand::Label(label)]
        } else if opcode.has_arg() {
            vec![Operand::Int(1)]
        } else {
            vec![]
        };
        code.generate(opcode.method_name(), &args)
            .unwrap_or_else(|e| panic!("{opcode}: {e}"));
        assert_eq!(code.code()[0], opcode.code());
    }
}

// =============================================================================
// Index Search
// =============================================================================

#[test]
fn test_find_indices() {
    let mut code = Code::default();
    code.load_const(42).unwrap();
    code.return_value().unwrap();

    assert_eq!(code.find_opcode_index(Opcode::LoadConst).unwrap(), vec![0]);
    assert_eq!(code.find_opcode_index(Opcode::ReturnValue).unwrap(), vec![3]);
    assert_eq!(code.find_first_opcode_index("RETURN_VALUE").unwrap(), 3);

    let err = code.find_first_opcode_index("POP_TOP").unwrap_err();
    assert_eq!(err.exception_type(), "IndexNotFound");
}

#[test]
fn test_find_skips_extended_arg_prefix() {
    let mut code = Code::default();
    code.load_fast(70_000).unwrap();
    code.return_value().unwrap();

    assert_eq!(code.find_opcode_index(EXTENDED_ARG).unwrap(), vec![0]);
    assert_eq!(code.find_opcode_index(Opcode::LoadFast).unwrap(), vec![3]);
    assert_eq!(code.find_opcode_index(Opcode::ReturnValue).unwrap(), vec![6]);
}

// =============================================================================
// Extended Arguments
// =============================================================================

#[test]
fn test_constant_index_beyond_16_bits() {
    let mut code = Code::default();
    for i in 1..70_000i64 {
        code.load_const(i).unwrap();
        code.pop_top().unwrap();
    }
    let mark = code.code().len();
    code.load_const(70_000).unwrap();

    assert_eq!(code.consts().len(), 70_001);
    // 70000 = 0x0001_1170
    assert_eq!(&code.code()[mark..], &[EXTENDED_ARG, 0x01, 0x00, 100, 0x70, 0x11]);
    assert_eq!(code.stack_depth(), StackDepth::Known(1));
}

#[test]
fn test_far_forward_jump_is_widened() {
    let mut code = Code::default();
    let far = code.new_label();
    let near = code.new_label();

    code.set_lineno(1);
    code.load_const(true).unwrap();
    code.pop_jump_if_true(far).unwrap();
    code.jump_forward(near).unwrap();
    code.bind_label(near).unwrap();
    code.set_lineno(2);
    for _ in 0..0x1_0000 {
        code.nop().unwrap();
    }
    code.jump_absolute(near).unwrap();
    assert_eq!(code.lnotab(), &[9, 1]);

    code.bind_label(far).unwrap();

    // POP_JUMP_IF_TRUE gained a prefix; everything behind it moved by 3.
    assert_eq!(&code.code()[..12], &[100, 1, 0, EXTENDED_ARG, 1, 0, 115, 0x0F, 0, 110, 0, 0]);
    assert_eq!(code.label_offset(near), Some(12));
    assert_eq!(code.label_offset(far), Some(0x1_000F));
    assert_eq!(&code.code()[0x1_000C..], &[113, 12, 0]);
    assert_eq!(code.lnotab(), &[12, 1]);
    assert_eq!(code.stack_history().len(), code.code().len());
    assert_eq!(code.stack_depth(), StackDepth::Known(0));
    assert!(!code.has_pending_jumps());

    let jump = code.instructions().nth(1).unwrap();
    assert_eq!(jump.offset, 3);
    assert_eq!(jump.arg, Some(0x1_000F));
    assert!(Persistor::to_code_type(&code).is_ok());
}
