pub mod ast;
pub mod const_eval;
pub mod const_pool;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod resolver;
pub mod symbol_table;
pub mod type_table;

use log::{debug, info};

use crate::codegen;
use crate::compiler::ast::{AstKind, AstNode, NodeIdGen};
use crate::compiler::const_pool::{ConstPool, ZERO_U8_INDEX};
use crate::compiler::error::{CompilerError, Diagnostic};
use crate::compiler::lexer::{LineIndex, Loc};
use crate::compiler::symbol_table::SymbolTable;
use crate::compiler::type_table::TypeTable;
use crate::tac::{self, TacProgram};

/// One input buffer plus the name diagnostics should blame.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub source: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        SourceFile {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Owns the input buffers and renders located diagnostics against
/// them.
pub struct SourceMap {
    files: Vec<SourceFile>,
    indexes: Vec<LineIndex>,
}

impl SourceMap {
    pub fn new(files: Vec<SourceFile>) -> Self {
        let indexes =
            files.iter().map(|f| LineIndex::new(&f.source)).collect();
        SourceMap { files, indexes }
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    pub fn diagnostic(&self, loc: &Loc, message: &str) -> Diagnostic {
        let file = &self.files[loc.source];
        let (line, pos) = self.indexes[loc.source].line_col(loc.span.start);
        let at_end = loc.span.start >= file.source.len();
        let lexeme = if at_end {
            String::new()
        } else {
            file.source
                .get(loc.span.clone())
                .unwrap_or_default()
                .to_owned()
        };
        Diagnostic {
            message: message.to_owned(),
            lexeme,
            line,
            pos,
            at_end,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub platform: String,
    pub report: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            platform: "apple_arm64".to_owned(),
            report: false,
        }
    }
}

/// The three registries every stage shares. Owned per compilation so
/// independent compiles never observe each other.
#[derive(Debug)]
pub struct Session {
    pub pool: ConstPool,
    pub types: TypeTable,
    pub symbols: SymbolTable,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Session {
            pool: ConstPool::new(),
            types: TypeTable::new(),
            symbols: SymbolTable::new(),
        }
    }
}

#[derive(Debug)]
pub struct Compiled {
    pub assembly: String,
    pub program: TacProgram,
    pub session: Session,
}

/// Runs the whole pipeline over the given sources. The first file is
/// the root module; its top-level statements (or its `fn main`) become
/// the program entry. Errors never produce output.
pub fn compile_module(
    sources: Vec<SourceFile>,
    options: CompileOptions,
) -> Result<Compiled, CompilerError> {
    let mut platform = codegen::get_platform(&options.platform)
        .ok_or_else(|| {
            CompilerError::UnknownPlatform(options.platform.clone())
        })?;
    let mut session = Session::new();
    let mut ids = NodeIdGen::default();
    let source_map = SourceMap::new(sources);

    // Parse every file before giving up, so one bad module does not
    // hide diagnostics from the others.
    let mut parsed = Vec::new();
    let mut parse_errors = Vec::new();
    for (source_id, file) in source_map.files().iter().enumerate() {
        let module_name = module_stem(&file.name);
        debug!("parsing module '{module_name}' from {}", file.name);
        match parser::parse_module(
            &file.source,
            &module_name,
            source_id,
            &mut session.pool,
            &mut session.types,
            &mut ids,
        ) {
            Ok(result) => parsed.push(result),
            Err(errors) => parse_errors.extend(errors),
        }
    }
    if !parse_errors.is_empty() {
        return Err(parse_errors.into());
    }

    let mut modules = Vec::new();
    for (index, (mut module, exit_emitted)) in
        parsed.into_iter().enumerate()
    {
        let root = index == 0;
        let loc = module.loc.clone();
        if let AstKind::Module { decls, .. } = &mut module.kind {
            let has_main = decls.iter().any(|d| {
                matches!(&d.kind, AstKind::Fn { name, .. } if name == "main")
            });
            let has_statements =
                decls.iter().any(is_top_level_statement);
            if has_main && has_statements {
                return Err(CompilerError::Resolve(source_map.diagnostic(
                    &loc,
                    "Top-level statements cannot be combined with an \
                     explicit 'main' function.",
                )));
            }
            if !root && has_statements {
                return Err(CompilerError::Resolve(source_map.diagnostic(
                    &loc,
                    "Only the root module may contain top-level \
                     statements.",
                )));
            }
            if root && !has_main && !exit_emitted {
                let value = AstNode::new(
                    ids.next(),
                    loc.clone(),
                    AstKind::Literal {
                        index: ZERO_U8_INDEX,
                    },
                );
                decls.push(AstNode::new(
                    ids.next(),
                    loc.clone(),
                    AstKind::Exit {
                        value: Some(Box::new(value)),
                    },
                ));
            }
        }
        modules.push(module);
    }

    let root_loc = modules
        .first()
        .map(|m| m.loc.clone())
        .unwrap_or_else(|| Loc::new(0, 0..0));
    let mut main = AstNode::new(
        ids.next(),
        root_loc,
        AstKind::Main { modules },
    );

    resolver::resolve(
        &mut main,
        &mut session.symbols,
        &mut session.types,
        &mut session.pool,
        &source_map,
    )?;
    session
        .symbols
        .calculate_allocations(platform.as_ref(), &session.types);
    if options.report {
        session.symbols.report();
    }

    let mut program = tac::emit::emit_program(
        &main,
        &session.symbols,
        &session.types,
        &session.pool,
    )?;
    tac::resolve_purity(&mut program);
    tac::mark_used(&mut program, "main");
    for section in &mut program.sections {
        for function in &mut section.functions {
            tac::clean_blocks(function);
        }
    }

    let assembly = codegen::generate(
        &program,
        platform.as_mut(),
        &session.symbols,
        &session.types,
        &session.pool,
    )?;
    info!(
        "compiled {} module(s), {} bytes of assembly",
        source_map.files().len(),
        assembly.len()
    );
    Ok(Compiled {
        assembly,
        program,
        session,
    })
}

fn is_top_level_statement(node: &AstNode) -> bool {
    !matches!(
        node.kind,
        AstKind::Fn { .. }
            | AstKind::TypeDecl { .. }
            | AstKind::EnumDecl { .. }
            | AstKind::Ext { .. }
            | AstKind::Import { .. }
            | AstKind::Bank { .. }
            | AstKind::VarDecl { .. }
            | AstKind::VarInit { .. }
            | AstKind::ConstDecl { .. }
    )
}

fn module_stem(name: &str) -> String {
    let stem = std::path::Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "main".to_owned()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_names_come_from_file_stems() {
        assert_eq!(module_stem("examples/demo.fg"), "demo");
        assert_eq!(module_stem("weird-name.fg"), "weird_name");
        assert_eq!(module_stem(""), "main");
    }
}
