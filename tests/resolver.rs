use fang_core::compiler::error::CompilerError;
use fang_core::compiler::{CompileOptions, SourceFile, compile_module};
use fang_core::logger::init_logger_debug;

fn compile_err(source: &str) -> CompilerError {
    match compile_module(
        vec![SourceFile::new("main.fg", source)],
        CompileOptions::default(),
    ) {
        Ok(_) => panic!("expected a compile error for: {source}"),
        Err(error) => error,
    }
}

fn resolve_message(source: &str) -> String {
    match compile_err(source) {
        CompilerError::Resolve(diagnostic) => diagnostic.to_string(),
        other => panic!("expected a resolve error, got: {other}"),
    }
}

#[test]
pub fn undeclared_identifiers_are_reported() {
    init_logger_debug();
    let message = resolve_message("return missing;");
    assert!(message.contains("Identifier was not found."));
    assert!(message.contains("[line 1;"));
}

#[test]
pub fn redeclaration_in_the_same_scope_fails() {
    init_logger_debug();
    let message = resolve_message("var x: u8 = 1; var x: u8 = 2;");
    assert!(message.contains("'x' is already declared in this scope."));
}

#[test]
pub fn shadowing_in_a_nested_scope_is_allowed() {
    init_logger_debug();
    let result = compile_module(
        vec![SourceFile::new(
            "main.fg",
            "fn main(): u8 { var x: u8 = 1; { var x: u8 = 2; } return x; }",
        )],
        CompileOptions::default(),
    );
    assert!(result.is_ok());
}

#[test]
pub fn cyclic_records_are_fatal() {
    init_logger_debug();
    let error = compile_err("type A { b: B; } type B { a: A; }");
    assert_eq!(error, CompilerError::RecursiveType);
    assert_eq!(
        error.to_string(),
        "Types cannot be recursively defined."
    );
}

#[test]
pub fn assignment_to_a_constant_fails() {
    init_logger_debug();
    let message =
        resolve_message("const c: u8 = 1; c = 2; return 0;");
    assert!(message.contains("Cannot assign to a constant."));
}

#[test]
pub fn call_arity_must_match() {
    init_logger_debug();
    let message = resolve_message(
        "fn f(a: u8): u8 { return a; }\n\
         fn main(): u8 { return f(); }",
    );
    assert!(message.contains("Expected 1 arguments but got 0."));
}

#[test]
pub fn only_functions_are_callable() {
    init_logger_debug();
    let message = resolve_message(
        "var x: u8 = 1;\n\
         fn main(): u8 { return x(); }",
    );
    assert!(message.contains("Can only call functions."));
}

#[test]
pub fn conditions_must_be_boolean() {
    init_logger_debug();
    // Numeric types sit above bool in the lattice and never narrow
    // back down, so a u8 condition needs an explicit comparison.
    let message = resolve_message(
        "fn main(): u8 { var n: u8 = 1; if (n) { return 1; } return 0; }",
    );
    assert!(message.contains("Condition must be a boolean."));

    let message = resolve_message(
        "fn main(): u8 { var s: string = \"no\"; while (s) { return 1; } \
         return 0; }",
    );
    assert!(message.contains("Condition must be a boolean."));
}

#[test]
pub fn bool_conditions_and_fitting_literals_are_accepted() {
    init_logger_debug();
    let result = compile_module(
        vec![SourceFile::new(
            "main.fg",
            "fn main(): u8 { var flag: bool = true; if (flag) { return 1; } \
             if (1) { return 2; } return 0; }",
        )],
        CompileOptions::default(),
    );
    assert!(result.is_ok());

    // A literal outside bool's range does not narrow.
    let message = resolve_message(
        "fn main(): u8 { if (2) { return 1; } return 0; }",
    );
    assert!(message.contains("Condition must be a boolean."));
}

#[test]
pub fn same_rank_sign_changes_need_a_cast() {
    init_logger_debug();
    let message = resolve_message(
        "fn main(): u8 { var a: u8 = 1; var b: i8 = 0 - 1; a = b; return a; }",
    );
    assert!(message.contains("Type mismatch in assignment."));
}

#[test]
pub fn explicit_casts_bridge_sign_changes() {
    init_logger_debug();
    let result = compile_module(
        vec![SourceFile::new(
            "main.fg",
            "fn main(): u8 { var a: u8 = 1; var b: i8 = 0 - 1; a = b as u8; \
             return a; }",
        )],
        CompileOptions::default(),
    );
    assert!(result.is_ok());
}

#[test]
pub fn void_functions_cannot_return_values() {
    init_logger_debug();
    let message = resolve_message(
        "fn nothing(): void { return 1; }\n\
         fn main(): u8 { nothing(); return 0; }",
    );
    assert!(message.contains("Cannot return a value from a void function."));
}

#[test]
pub fn dereferencing_non_pointers_fails() {
    init_logger_debug();
    let message = resolve_message(
        "fn main(): u8 { var x: u8 = 1; return @x; }",
    );
    assert!(message.contains("Cannot dereference a non-pointer value."));
}

#[test]
pub fn address_of_then_deref_round_trips() {
    init_logger_debug();
    let result = compile_module(
        vec![SourceFile::new(
            "main.fg",
            "fn main(): u8 { var x: u8 = 7; var p: ^u8 = ^x; return @p; }",
        )],
        CompileOptions::default(),
    );
    assert!(result.is_ok());
}

#[test]
pub fn unknown_fields_are_reported() {
    init_logger_debug();
    let message = resolve_message(
        "type Point { x: u8; y: u8; }\n\
         fn main(): u8 { var p: Point; return p.z; }",
    );
    assert!(message.contains("Unknown field 'z'."));
}

#[test]
pub fn unknown_types_are_reported_with_location() {
    init_logger_debug();
    let message = resolve_message("var x: Widget = 1;");
    assert!(message.contains("Unknown type 'Widget'."));
}

#[test]
pub fn division_by_zero_in_constants_is_fatal() {
    init_logger_debug();
    let error = compile_err("const x: u8 = 1 / 0;");
    assert!(matches!(error, CompilerError::ConstEval(_)));
    assert!(error.to_string().contains("Division by zero."));
}

#[test]
pub fn impure_constant_initialisers_are_fatal() {
    init_logger_debug();
    let error = compile_err(
        "fn f(): u8 { return 1; }\n\
         const x: u8 = f();",
    );
    assert!(matches!(error, CompilerError::ConstEval(_)));
    assert!(
        error
            .to_string()
            .contains("Impure operation in a constant context.")
    );
}

#[test]
pub fn array_sizes_must_be_constant() {
    init_logger_debug();
    let error = compile_err(
        "fn main(): u8 { var n: u8 = 4; var a: [n]u8; return 0; }",
    );
    assert!(matches!(
        error,
        CompilerError::ConstEval(_) | CompilerError::Resolve(_)
    ));
}

#[test]
pub fn array_sizes_may_be_named_constants() {
    init_logger_debug();
    let result = compile_module(
        vec![SourceFile::new(
            "main.fg",
            "const N: u8 = 4;\n\
             fn main(): u8 { var a: [N]u8; a[0] = 1; return a[0]; }",
        )],
        CompileOptions::default(),
    );
    assert!(result.is_ok());
}

#[test]
pub fn main_and_top_level_statements_cannot_mix() {
    init_logger_debug();
    let message = resolve_message(
        "fn main(): u8 { return 1; }\n\
         return 2;",
    );
    assert!(message.contains(
        "Top-level statements cannot be combined with an explicit 'main'"
    ));
}

#[test]
pub fn imports_must_name_known_modules() {
    init_logger_debug();
    let message = resolve_message("import nowhere; return 0;");
    assert!(message.contains("Unknown module 'nowhere'."));
}

#[test]
pub fn duplicate_modules_are_rejected() {
    init_logger_debug();
    let result = compile_module(
        vec![
            SourceFile::new("a/lib.fg", "return 0;"),
            SourceFile::new("b/lib.fg", "fn helper(): u8 { return 1; }"),
        ],
        CompileOptions::default(),
    );
    assert!(matches!(result, Err(CompilerError::DuplicateModule(_))));
}
