use fang_core::compiler::{
    CompileOptions, Compiled, SourceFile, compile_module,
};
use fang_core::compiler::symbol_table::ScopeKind;
use fang_core::logger::init_logger_debug;
use fang_core::tac::Purity;
use fang_core::values::Value;
use log::info;

fn compile(source: &str) -> Result<Compiled, fang_core::compiler::error::CompilerError>
{
    compile_module(
        vec![SourceFile::new("main.fg", source)],
        CompileOptions::default(),
    )
}

fn compile_ok(source: &str) -> Compiled {
    match compile(source) {
        Ok(compiled) => compiled,
        Err(error) => panic!("compile failed: {error}\nsource: {source}"),
    }
}

#[test]
pub fn empty_program_exits_cleanly() {
    init_logger_debug();
    let compiled = compile_ok("");
    info!("assembly:\n{}", compiled.assembly);
    assert!(compiled.assembly.contains("_start:"));
    assert!(compiled.assembly.contains("BL _fang_main"));
    assert!(compiled.assembly.contains("MOV X16, #1"));
    assert!(compiled.assembly.contains("SVC 0"));
    // The synthetic exit returns zero through the entry flow.
    assert!(compiled.assembly.contains("_fang_main:"));
}

#[test]
pub fn constants_fold_into_the_pool() {
    init_logger_debug();
    let compiled = compile_ok("const x: u8 = 1 + 2 * 3;");
    let folded = compiled
        .session
        .pool
        .iter()
        .any(|(_, entry)| entry.value == Value::U8(7));
    assert!(folded, "constant pool should hold the folded u8(7)");
}

#[test]
pub fn folded_constants_emit_immediates() {
    init_logger_debug();
    let compiled =
        compile_ok("const x: u8 = 1 + 2 * 3; return x;");
    assert!(compiled.assembly.contains("MOV X8, #7"));
}

#[test]
pub fn array_locals_reserve_a_frame() {
    init_logger_debug();
    let compiled = compile_ok(
        "fn main(): u8 { var a: [4]u8; a[2] = 9; return a[2]; }",
    );
    let symbols = &compiled.session.symbols;
    let frame = (0..symbols.scope_count() as u32)
        .map(|id| symbols.scope(id))
        .filter(|scope| scope.kind == ScopeKind::Function)
        .map(|scope| scope.table_allocation_size)
        .max()
        .unwrap_or(0);
    assert!(frame >= 16, "frame was only {frame} bytes");
    assert!(compiled.assembly.contains("_fang_main:"));
    // The element store goes through the slot-held pointer.
    assert!(compiled.assembly.contains("SUB SP, SP,"));
}

#[test]
pub fn exit_code_flows_through_x0() {
    init_logger_debug();
    let compiled = compile_ok("fn main(): u8 { return 9; }");
    assert!(compiled.assembly.contains("MOV X8, #9"));
    assert!(compiled.assembly.contains("MOV X0, X8"));
    assert!(compiled.assembly.contains("B _fang_ep_main"));
}

#[test]
pub fn pointer_through_incomplete_type_sizes() {
    init_logger_debug();
    let compiled = compile_ok("type Node { next: ^Node; val: u8; }");
    let types = &compiled.session.types;
    let node = types
        .get_by_name(Some("main"), "Node")
        .expect("Node should be registered");
    assert_eq!(types.get(node).byte_size, 8 + 1);
}

#[test]
pub fn record_fields_lay_out_in_order() {
    init_logger_debug();
    let compiled = compile_ok(
        "type Point { x: u8; y: u8; }\n\
         fn main(): u8 { var p: Point; p.x = 3; p.y = 4; return p.x; }",
    );
    let types = &compiled.session.types;
    let point = types.get_by_name(Some("main"), "Point").unwrap();
    assert_eq!(types.get(point).byte_size, 2);
    let fields = &types.get(point).fields;
    assert_eq!(fields[0].name.as_deref(), Some("x"));
    assert_eq!(fields[1].name.as_deref(), Some("y"));
}

#[test]
pub fn control_flow_compares_against_zero() {
    init_logger_debug();
    let compiled = compile_ok(
        "var i: u8 = 0; while (i < 10) i = i + 1; return i;",
    );
    assert!(compiled.assembly.contains("CSET"));
    assert!(compiled.assembly.contains("BEQ L"));
    assert!(compiled.assembly.contains("AND X8, X8, #0xFF"));
}

#[test]
pub fn if_else_branches_join() {
    init_logger_debug();
    let compiled = compile_ok(
        "fn pick(flag: bool): u8 { if (flag) { return 1; } else { return 2; } }\n\
         fn main(): u8 { return pick(true); }",
    );
    assert!(compiled.assembly.contains("_fang_pick:"));
    assert!(compiled.assembly.contains("BEQ L"));
}

#[test]
pub fn short_circuit_skips_the_right_operand() {
    init_logger_debug();
    let compiled = compile_ok(
        "var a: bool = true;\n\
         var b: bool = a && false;\n\
         var c: bool = a || false;\n\
         return 0;",
    );
    assert!(compiled.assembly.contains("BEQ L"));
    assert!(compiled.assembly.contains("BNE L"));
}

#[test]
pub fn string_literals_intern_and_emit_once() {
    init_logger_debug();
    let compiled = compile_ok(
        "var a: string = \"shared\"; var b: string = \"shared\"; return 0;",
    );
    let occurrences = compiled
        .assembly
        .matches(".asciz \"shared\"")
        .count();
    assert_eq!(occurrences, 1);
    assert!(compiled.assembly.contains(".byte 6"));
}

#[test]
pub fn stack_arguments_read_back_from_the_frame() {
    init_logger_debug();
    let compiled = compile_ok(
        "fn add(a: u8, b: u8): u8 { return a + b; }\n\
         fn main(): u8 { return add(3, 4); }",
    );
    // Arguments are pushed right-to-left and read at [FP, #(n+1)*16].
    assert!(compiled.assembly.contains("PUSH1 X"));
    assert!(compiled.assembly.contains("[FP, #16]"));
    assert!(compiled.assembly.contains("[FP, #32]"));
    assert!(compiled.assembly.contains("BLR X"));
    assert!(compiled.assembly.contains("ADD SP, SP, #32"));
}

#[test]
pub fn purity_tracks_asm_and_call_edges() {
    init_logger_debug();
    let compiled = compile_ok(
        "fn pure_add(a: u8, b: u8): u8 { return a + b; }\n\
         fn tainted(): u8 { asm { \"NOP\" }; return 1; }\n\
         fn main(): u8 { return pure_add(1, 2) + tainted(); }",
    );
    let purity_of = |name: &str| {
        compiled
            .program
            .functions()
            .find(|f| f.name == name)
            .map(|f| f.purity)
    };
    assert_eq!(purity_of("pure_add"), Some(Purity::Pure));
    assert_eq!(purity_of("tainted"), Some(Purity::Impure));
    assert_eq!(purity_of("main"), Some(Purity::Impure));
}

#[test]
pub fn enums_define_incrementing_constants() {
    init_logger_debug();
    let compiled = compile_ok(
        "enum Color { Red, Green, Blue }\n\
         return Green;",
    );
    assert!(compiled.assembly.contains("MOV X8, #1"));
}

#[test]
pub fn externals_link_against_bare_symbols() {
    init_logger_debug();
    let compiled = compile_ok(
        "ext fn putchar(u16): u16;\n\
         fn main(): u8 { putchar(65 as u16); return 0; }",
    );
    assert!(compiled.assembly.contains("ADR X8, _putchar"));
    assert!(!compiled.assembly.contains("_fang_putchar"));
}

#[test]
pub fn banks_become_annotated_sections() {
    init_logger_debug();
    let compiled = compile_ok(
        "bank \"ROM1\" { fn helper(): u8 { return 1; } }\n\
         fn main(): u8 { return helper(); }",
    );
    assert!(compiled.assembly.contains("(ROM1)"));
    assert!(compiled.assembly.contains("_fang_helper:"));
    let section = compiled
        .program
        .sections
        .iter()
        .find(|s| s.annotation.as_deref() == Some("ROM1"))
        .expect("bank section");
    assert_eq!(section.functions.len(), 1);
}

#[test]
pub fn modules_resolve_qualified_names() {
    init_logger_debug();
    let compiled = compile_module(
        vec![
            SourceFile::new("main.fg", "import util; return util::answer();"),
            SourceFile::new(
                "util.fg",
                "fn answer(): u8 { return 42; }",
            ),
        ],
        CompileOptions::default(),
    )
    .expect("cross-module compile");
    assert!(compiled.assembly.contains("_fang_answer:"));
    assert!(compiled.assembly.contains("MOV X8, #42"));
}

#[test]
pub fn globals_get_storage_and_runtime_loads() {
    init_logger_debug();
    let compiled = compile_ok(
        "var counter: u16 = 5;\n\
         fn main(): u8 { counter = counter + 1; return 0; }",
    );
    assert!(compiled.assembly.contains("_fang_counter:"));
    assert!(compiled.assembly.contains(".quad 5"));
    assert!(compiled.assembly.contains(".data"));
}

#[test]
pub fn numeric_literal_boundaries() {
    init_logger_debug();
    assert!(compile("const a: u8 = 255;").is_ok());
    assert!(compile("const b: u8 = 256;").is_err());
    assert!(compile("const c: i8 = 0 - 128;").is_ok());
    assert!(compile("const d: i16 = 32767;").is_ok());
    assert!(compile("const e: i16 = 32768;").is_err());
}

#[test]
pub fn deeply_nested_blocks_resolve() {
    init_logger_debug();
    let mut source = String::from("fn main(): u8 {\n");
    for _ in 0..64 {
        source.push_str("{\n");
    }
    source.push_str("var innermost: u8 = 1;\n");
    for _ in 0..64 {
        source.push_str("}\n");
    }
    source.push_str("return 0; }\n");
    let compiled = compile_ok(&source);
    assert!(compiled.assembly.contains("_fang_main:"));
}

#[test]
pub fn do_not_emit_output_for_parse_errors() {
    init_logger_debug();
    let error = compile("var x: u8 = ;").unwrap_err();
    let rendered = error.to_string();
    assert!(rendered.contains("Error"));
    assert!(rendered.contains("[line 1;"));
}

#[test]
pub fn frame_sizes_round_to_sixteen() {
    init_logger_debug();
    let compiled = compile_ok(
        "fn two_locals(): u8 { var a: u8 = 1; var b: u8 = 2; return a; }\n\
         fn main(): u8 { return two_locals(); }",
    );
    // Two one-slot locals: 32 bytes of frame.
    assert!(compiled.assembly.contains("SUB SP, SP, #32"));
}

#[test]
pub fn tac_temporaries_increase_monotonically() {
    init_logger_debug();
    let compiled = compile_ok(
        "fn main(): u8 { var a: u8 = 1; var b: u8 = 2; \
         return a + b * 2; }",
    );
    let main = compiled
        .program
        .functions()
        .find(|f| f.name == "main")
        .expect("main function");
    let mut last = None;
    for block in &main.blocks {
        for instruction in &block.instructions {
            if let fang_core::tac::Instruction::Copy {
                dest: fang_core::tac::Operand::Temporary(t),
                ..
            } = instruction
            {
                if let Some(previous) = last {
                    assert!(*t > previous, "t{t} after t{previous}");
                }
                last = Some(*t);
            }
        }
    }
    assert!(last.is_some());
}

#[test]
pub fn loops_lower_to_branching_blocks() {
    init_logger_debug();
    let compiled = compile_ok(
        "fn main(): u8 { var i: u8 = 0; while (i < 3) i = i + 1; \
         return i; }",
    );
    let main = compiled
        .program
        .functions()
        .find(|f| f.name == "main")
        .expect("main function");
    assert!(main.blocks.len() >= 3);
    let has_if_false = main.blocks.iter().any(|b| {
        b.instructions.iter().any(|i| {
            matches!(i, fang_core::tac::Instruction::IfFalse { .. })
        })
    });
    let has_back_edge = main.blocks.iter().any(|b| {
        b.instructions.iter().any(|i| {
            matches!(i, fang_core::tac::Instruction::Goto { .. })
        })
    });
    assert!(has_if_false);
    assert!(has_back_edge);
}

#[test]
pub fn unknown_platform_is_rejected() {
    init_logger_debug();
    let result = compile_module(
        vec![SourceFile::new("main.fg", "")],
        CompileOptions {
            platform: "z80".into(),
            report: false,
        },
    );
    assert!(matches!(
        result,
        Err(fang_core::compiler::error::CompilerError::UnknownPlatform(_))
    ));
}
