use itertools::Itertools;
use log::{debug, trace};

use crate::compiler::ast::{
    AstKind, AstNode, ExtKind, InitializerKind, UnaryOp,
};
use crate::compiler::const_eval::{self, ConstEvalError, Environment};
use crate::compiler::const_pool::ConstPool;
use crate::compiler::error::CompilerError;
use crate::compiler::lexer::Loc;
use crate::compiler::symbol_table::{
    ScopeKind, StorageKind, SymbolEntry, SymbolKind, SymbolStatus,
    SymbolTable,
};
use crate::compiler::type_table::{
    FieldEntry, Primitive, TypeId, TypeKind, TypeTable,
};
use crate::compiler::SourceMap;
use crate::values::{self, Value, ValueKind};

/// Walks the bundled module trees in two passes: first registering
/// every top-level name, then resolving and type-checking the full
/// tree. Nodes come out annotated with their scope and type ids.
pub struct Resolver<'a> {
    symbols: &'a mut SymbolTable,
    types: &'a mut TypeTable,
    pool: &'a mut ConstPool,
    sources: &'a SourceMap,
    module_names: Vec<String>,
    current_module: String,
    return_types: Vec<TypeId>,
}

pub fn resolve(
    main: &mut AstNode,
    symbols: &mut SymbolTable,
    types: &mut TypeTable,
    pool: &mut ConstPool,
    sources: &SourceMap,
) -> Result<(), CompilerError> {
    let module_names = match &main.kind {
        AstKind::Main { modules } => modules
            .iter()
            .filter_map(|m| match &m.kind {
                AstKind::Module { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    let mut resolver = Resolver {
        symbols,
        types,
        pool,
        sources,
        module_names,
        current_module: String::new(),
        return_types: Vec::new(),
    };
    resolver.run(main)
}

impl<'a> Resolver<'a> {
    fn run(&mut self, main: &mut AstNode) -> Result<(), CompilerError> {
        debug!("resolver pass 1: top-level registration");
        let AstKind::Main { modules } = &mut main.kind else {
            return Err(self.err(&main.loc, "Expected a program root."));
        };
        for module in modules.iter_mut() {
            self.register_module(module)?;
        }
        debug!("resolver pass 2: full tree walk");
        for module in modules.iter_mut() {
            self.resolve_module(module)?;
        }
        self.types.calculate_sizes()?;
        self.types.report();
        Ok(())
    }

    fn err(&self, loc: &Loc, message: &str) -> CompilerError {
        CompilerError::Resolve(self.sources.diagnostic(loc, message))
    }

    fn const_err(&self, loc: &Loc, error: &ConstEvalError) -> CompilerError {
        CompilerError::ConstEval(
            self.sources.diagnostic(loc, &error.to_string()),
        )
    }

    // ==< Pass 1 >==

    fn register_module(
        &mut self,
        node: &mut AstNode,
    ) -> Result<(), CompilerError> {
        let loc = node.loc.clone();
        let AstKind::Module { name, decls } = &mut node.kind else {
            return Err(self.err(&loc, "Expected a module."));
        };
        let name = name.clone();
        let scope = self.symbols.open_scope(ScopeKind::Module);
        if !self.symbols.name_scope(&name) {
            return Err(CompilerError::DuplicateModule(name));
        }
        node.scope = scope;
        self.current_module = name;
        for decl in decls.iter_mut() {
            self.register_decl(decl)?;
        }
        self.symbols.close_scope();
        Ok(())
    }

    fn register_decl(
        &mut self,
        node: &mut AstNode,
    ) -> Result<(), CompilerError> {
        let loc = node.loc.clone();
        match &mut node.kind {
            AstKind::Error => {
                Err(self.err(&loc, "An error occurred in the tree."))
            }
            AstKind::TypeDecl {
                name,
                fields,
                index,
            } => {
                let index = *index;
                let name = name.clone();
                let mut entries = Vec::with_capacity(fields.len());
                for field in fields.iter_mut() {
                    let AstKind::Param { name, value } = &mut field.kind
                    else {
                        continue;
                    };
                    let field_name = name.clone();
                    let type_id = self.resolve_type(value)?;
                    let mut entry = FieldEntry::named(&field_name, type_id);
                    if self.types.kind(type_id) == TypeKind::Array
                        && let Some(first) =
                            self.types.get(type_id).fields.first()
                    {
                        entry.element_count = first.element_count;
                    }
                    entries.push(entry);
                }
                self.types
                    .define(index, TypeKind::Record, entries)
                    .map_err(|_| {
                        self.err(
                            &loc,
                            &format!("Type '{name}' is already defined."),
                        )
                    })?;
                node.type_id = index;
                node.scope = self.symbols.current_scope();
                Ok(())
            }
            AstKind::Fn {
                name,
                params,
                return_type,
                type_index,
                ..
            } => {
                let name = name.clone();
                self.check_duplicate(&loc, &name)?;
                let mut fields = Vec::with_capacity(params.len() + 1);
                for param in params.iter_mut() {
                    let AstKind::Param { value, .. } = &mut param.kind else {
                        continue;
                    };
                    let type_id = self.resolve_type(value)?;
                    fields.push(FieldEntry::unnamed(type_id));
                }
                let ret = self.resolve_type(return_type)?;
                let signature = format!(
                    "fn ({}): {}",
                    fields
                        .iter()
                        .map(|f| self.types.name(f.type_id))
                        .join(", "),
                    self.types.name(ret)
                );
                fields.push(FieldEntry::unnamed(ret));
                let fn_type = self.types.register_structural(
                    &signature,
                    TypeKind::Function,
                    fields,
                );
                *type_index = fn_type;
                node.type_id = fn_type;
                self.symbols.define(
                    &name,
                    SymbolKind::Function,
                    fn_type,
                    StorageKind::Static,
                );
                trace!("registered fn {name}: {signature}");
                Ok(())
            }
            AstKind::VarDecl { name, .. } | AstKind::VarInit { name, .. } => {
                let name = name.clone();
                self.check_duplicate(&loc, &name)?;
                self.symbols.declare(
                    &name,
                    SymbolKind::Variable,
                    0,
                    StorageKind::Static,
                );
                Ok(())
            }
            AstKind::ConstDecl { name, .. } => {
                let name = name.clone();
                self.check_duplicate(&loc, &name)?;
                self.symbols.declare(
                    &name,
                    SymbolKind::Constant,
                    0,
                    StorageKind::Static,
                );
                Ok(())
            }
            AstKind::Ext {
                symbol_kind,
                name,
                ty,
            } => {
                let name = name.clone();
                let kind = match symbol_kind {
                    ExtKind::Function => SymbolKind::Function,
                    ExtKind::Variable => SymbolKind::Variable,
                };
                self.check_duplicate(&loc, &name)?;
                let type_id = self.resolve_type(ty)?;
                node.type_id = type_id;
                node.scope = self.symbols.current_scope();
                self.symbols.define(
                    &name,
                    kind,
                    type_id,
                    StorageKind::External,
                );
                Ok(())
            }
            AstKind::EnumDecl { name, members } => {
                let name = name.clone();
                let module = self.current_module.clone();
                self.types.alias(
                    Some(module.as_str()),
                    &name,
                    Primitive::U8.id(),
                );
                let mut next = 0i64;
                for (member, value) in members.iter_mut() {
                    let member = member.clone();
                    self.check_duplicate(&loc, &member)?;
                    if let Some(expr) = value {
                        let result = const_eval::evaluate(
                            expr,
                            &Environment::new(),
                            self.pool,
                            self.symbols,
                        )
                        .map_err(|e| self.const_err(&expr.loc, &e))?;
                        next = result.as_number().ok_or_else(|| {
                            self.err(
                                &expr.loc,
                                "Enum values must be numeric constants.",
                            )
                        })?;
                    }
                    let index = self
                        .pool
                        .store(values::typed_number(ValueKind::U8, next));
                    self.symbols.define(
                        &member,
                        SymbolKind::Constant,
                        Primitive::U8.id(),
                        StorageKind::Static,
                    );
                    self.symbols.set_constant_index(&member, index);
                    next += 1;
                }
                node.scope = self.symbols.current_scope();
                Ok(())
            }
            AstKind::Bank { decls, .. } => {
                let scope = self.symbols.open_scope(ScopeKind::Bank);
                node.scope = scope;
                for decl in decls.iter_mut() {
                    self.register_decl(decl)?;
                }
                self.symbols.close_scope();
                Ok(())
            }
            AstKind::Import { module } => {
                if self.module_names.iter().any(|m| m == module) {
                    Ok(())
                } else {
                    Err(self.err(
                        &loc,
                        &format!("Unknown module '{module}'."),
                    ))
                }
            }
            // Everything else is statement-level and waits for pass 2.
            _ => Ok(()),
        }
    }

    fn check_duplicate(
        &self,
        loc: &Loc,
        name: &str,
    ) -> Result<(), CompilerError> {
        if self.symbols.get_current_only(name).is_some() {
            return Err(self.err(
                loc,
                &format!("'{name}' is already declared in this scope."),
            ));
        }
        Ok(())
    }

    fn check_redefinition(
        &self,
        loc: &Loc,
        name: &str,
    ) -> Result<(), CompilerError> {
        if let Some(entry) = self.symbols.get_current_only(name)
            && entry.status == SymbolStatus::Defined
        {
            return Err(self.err(
                loc,
                &format!("'{name}' is already declared in this scope."),
            ));
        }
        Ok(())
    }

    // ==< Types >==

    fn resolve_type(
        &mut self,
        node: &mut AstNode,
    ) -> Result<TypeId, CompilerError> {
        let loc = node.loc.clone();
        if node.scope == 0 {
            node.scope = self.symbols.current_scope();
        }
        let id = match &mut node.kind {
            AstKind::TypeName { name, .. } => self
                .types
                .get_by_name(Some(self.current_module.as_str()), name)
                .ok_or_else(|| {
                    self.err(&loc, &format!("Unknown type '{name}'."))
                })?,
            AstKind::TypePtr { sub } => {
                let sub_id = self.resolve_type(sub)?;
                let name = format!("^{}", self.types.name(sub_id));
                self.types.register_structural(
                    &name,
                    TypeKind::Pointer,
                    vec![FieldEntry::unnamed(sub_id)],
                )
            }
            AstKind::TypeArray { length, sub } => {
                let sub_id = self.resolve_type(sub)?;
                let value = const_eval::evaluate(
                    length,
                    &Environment::new(),
                    self.pool,
                    self.symbols,
                )
                .map_err(|e| self.const_err(&length.loc, &e))?;
                let count = value
                    .as_number()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| {
                        self.err(
                            &loc,
                            "Array size must be a non-negative constant \
                             expression.",
                        )
                    })?;
                let name =
                    format!("[{}]{}", count, self.types.name(sub_id));
                let mut element = FieldEntry::unnamed(sub_id);
                element.element_count = count as u32;
                self.types.register_structural(
                    &name,
                    TypeKind::Array,
                    vec![element],
                )
            }
            AstKind::TypeFn { params, ret } => {
                let mut fields = Vec::with_capacity(params.len() + 1);
                for param in params.iter_mut() {
                    fields.push(FieldEntry::unnamed(
                        self.resolve_type(param)?,
                    ));
                }
                let ret_id = self.resolve_type(ret)?;
                let name = format!(
                    "fn ({}): {}",
                    fields
                        .iter()
                        .map(|f| self.types.name(f.type_id))
                        .join(", "),
                    self.types.name(ret_id)
                );
                fields.push(FieldEntry::unnamed(ret_id));
                self.types.register_structural(
                    &name,
                    TypeKind::Function,
                    fields,
                )
            }
            _ => {
                return Err(
                    self.err(&loc, "Expecting a type declaration.")
                );
            }
        };
        node.type_id = id;
        Ok(id)
    }

    // ==< Pass 2 >==

    fn resolve_module(
        &mut self,
        node: &mut AstNode,
    ) -> Result<(), CompilerError> {
        let scope = node.scope;
        let AstKind::Module { name, decls } = &mut node.kind else {
            return Ok(());
        };
        self.current_module = name.clone();
        self.symbols.push_scope(scope);
        for decl in decls.iter_mut() {
            self.visit(decl)?;
        }
        self.symbols.pop_scope();
        Ok(())
    }

    fn visit(&mut self, node: &mut AstNode) -> Result<TypeId, CompilerError> {
        let loc = node.loc.clone();
        if node.scope == 0 {
            node.scope = self.symbols.current_scope();
        }
        if matches!(
            node.kind,
            AstKind::TypeName { .. }
                | AstKind::TypePtr { .. }
                | AstKind::TypeArray { .. }
                | AstKind::TypeFn { .. }
        ) {
            return self.resolve_type(node);
        }
        let type_id = match &mut node.kind {
            AstKind::Error => {
                return Err(self.err(&loc, "An error occurred in the tree."));
            }
            AstKind::Literal { index } => self.pool.get(*index).type_id,
            AstKind::Identifier { module, name } => {
                let entry = self.lookup(&loc, module.as_deref(), name)?;
                node.scope = entry.scope;
                entry.type_id
            }
            AstKind::Lvalue { module, name } => {
                let entry = self.lookup(&loc, module.as_deref(), name)?;
                match entry.kind {
                    SymbolKind::Constant => {
                        return Err(
                            self.err(&loc, "Cannot assign to a constant.")
                        );
                    }
                    SymbolKind::Function => {
                        return Err(
                            self.err(&loc, "Cannot assign to a function.")
                        );
                    }
                    _ => {}
                }
                node.scope = entry.scope;
                node.lvalue = true;
                entry.type_id
            }
            AstKind::Assignment { lvalue, expr } => {
                if !matches!(
                    lvalue.kind,
                    AstKind::Lvalue { .. }
                        | AstKind::Subscript { .. }
                        | AstKind::Dot { .. }
                        | AstKind::Unary {
                            op: UnaryOp::Deref,
                            ..
                        }
                ) {
                    return Err(self.err(&loc, "Invalid assignment target."));
                }
                let target = self.visit(lvalue)?;
                lvalue.lvalue = true;
                let value = self.visit(expr)?;
                if !self.assignable(target, value, expr) {
                    return Err(
                        self.err(&loc, "Type mismatch in assignment.")
                    );
                }
                target
            }
            AstKind::Unary { op, expr } => {
                let operand = self.visit(expr)?;
                match op {
                    UnaryOp::Neg | UnaryOp::BitNot => {
                        if !is_numeric(operand) {
                            return Err(self.err(
                                &loc,
                                "Operand must be a numeric value.",
                            ));
                        }
                        operand
                    }
                    UnaryOp::Not => {
                        if !self.condition_coerces(operand, expr) {
                            return Err(self.err(
                                &loc,
                                "Operand must be a boolean value.",
                            ));
                        }
                        Primitive::Bool.id()
                    }
                    UnaryOp::Ref => {
                        let name =
                            format!("^{}", self.types.name(operand));
                        self.types.register_structural(
                            &name,
                            TypeKind::Pointer,
                            vec![FieldEntry::unnamed(operand)],
                        )
                    }
                    UnaryOp::Deref => {
                        if self.types.kind(operand) != TypeKind::Pointer {
                            return Err(self.err(
                                &loc,
                                "Cannot dereference a non-pointer value.",
                            ));
                        }
                        self.types.get_parent(operand).unwrap_or(0)
                    }
                }
            }
            AstKind::Binary { op, left, right } => {
                let op = *op;
                let lt = self.visit(left)?;
                let rt = self.visit(right)?;
                if op.is_logical() {
                    if !self.condition_coerces(lt, left)
                        || !self.condition_coerces(rt, right)
                    {
                        return Err(self.err(
                            &loc,
                            "Operands must be boolean values.",
                        ));
                    }
                    Primitive::Bool.id()
                } else if op.is_comparison() {
                    if !(is_numeric(lt) && is_numeric(rt)) && lt != rt {
                        return Err(self.err(
                            &loc,
                            "Operands cannot be compared.",
                        ));
                    }
                    Primitive::Bool.id()
                } else {
                    self.unify(&loc, lt, rt)?
                }
            }
            AstKind::Dot { left, field } => {
                let field = field.clone();
                let lt = self.visit(left)?;
                let record = match self.types.kind(lt) {
                    TypeKind::Record => lt,
                    TypeKind::Pointer => {
                        let parent = self.types.get_parent(lt).unwrap_or(0);
                        if self.types.kind(parent) != TypeKind::Record {
                            return Err(self.err(
                                &loc,
                                "Only records have fields.",
                            ));
                        }
                        parent
                    }
                    _ => {
                        return Err(
                            self.err(&loc, "Only records have fields.")
                        );
                    }
                };
                self.types
                    .get(record)
                    .fields
                    .iter()
                    .find(|f| f.name.as_deref() == Some(field.as_str()))
                    .map(|f| f.type_id)
                    .ok_or_else(|| {
                        self.err(
                            &loc,
                            &format!("Unknown field '{field}'."),
                        )
                    })?
            }
            AstKind::Subscript { left, index } => {
                let lt = self.visit(left)?;
                let element = match self.types.kind(lt) {
                    TypeKind::Array | TypeKind::Pointer => {
                        self.types.get_parent(lt).unwrap_or(0)
                    }
                    _ => {
                        return Err(self.err(
                            &loc,
                            "Only arrays and pointers can be subscripted.",
                        ));
                    }
                };
                let it = self.visit(index)?;
                if !is_numeric(it) {
                    return Err(
                        self.err(&loc, "Subscript index must be numeric.")
                    );
                }
                element
            }
            AstKind::Cast { expr, ty } => {
                let source = self.visit(expr)?;
                let target = self.resolve_type(ty)?;
                if !castable(self.types, source)
                    || !castable(self.types, target)
                {
                    return Err(self.err(
                        &loc,
                        "Cast requires numeric or pointer operands.",
                    ));
                }
                target
            }
            AstKind::Call { callee, args } => {
                let ct = self.visit(callee)?;
                if self.types.kind(ct) != TypeKind::Function {
                    return Err(
                        self.err(&loc, "Can only call functions.")
                    );
                }
                let fields = self.types.get(ct).fields.clone();
                let (ret, params) = match fields.split_last() {
                    Some((ret, params)) => (ret.type_id, params.to_vec()),
                    None => (Primitive::Void.id(), Vec::new()),
                };
                if args.len() != params.len() {
                    return Err(self.err(
                        &loc,
                        &format!(
                            "Expected {} arguments but got {}.",
                            params.len(),
                            args.len()
                        ),
                    ));
                }
                for (arg, param) in args.iter_mut().zip(params.iter()) {
                    let at = self.visit(arg)?;
                    if !self.assignable(param.type_id, at, arg) {
                        return Err(self.err(
                            &arg.loc.clone(),
                            "Argument type mismatch.",
                        ));
                    }
                }
                ret
            }
            AstKind::Return { value } => {
                let expected = self.return_types.last().copied();
                match (value, expected) {
                    (Some(expr), Some(ret)) => {
                        if ret == Primitive::Void.id() {
                            return Err(self.err(
                                &loc,
                                "Cannot return a value from a void \
                                 function.",
                            ));
                        }
                        let vt = self.visit(expr)?;
                        if !self.assignable(ret, vt, expr) {
                            return Err(self.err(
                                &loc,
                                "Return value type mismatch.",
                            ));
                        }
                        ret
                    }
                    (Some(expr), None) => self.visit(expr)?,
                    (None, Some(ret)) => ret,
                    (None, None) => Primitive::Void.id(),
                }
            }
            AstKind::Exit { value } => {
                if let Some(expr) = value {
                    let vt = self.visit(expr)?;
                    if !is_numeric(vt) {
                        return Err(self.err(
                            &loc,
                            "Exit value must be numeric.",
                        ));
                    }
                }
                Primitive::Void.id()
            }
            AstKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let ct = self.visit(condition)?;
                if !self.condition_coerces(ct, condition) {
                    return Err(
                        self.err(&loc, "Condition must be a boolean.")
                    );
                }
                self.visit(then_branch)?;
                if let Some(else_branch) = else_branch {
                    self.visit(else_branch)?;
                }
                Primitive::Void.id()
            }
            AstKind::While { condition, body }
            | AstKind::DoWhile { condition, body } => {
                let ct = self.visit(condition)?;
                if !self.condition_coerces(ct, condition) {
                    return Err(
                        self.err(&loc, "Condition must be a boolean.")
                    );
                }
                self.visit(body)?;
                Primitive::Void.id()
            }
            AstKind::For {
                initializer,
                condition,
                increment,
                body,
            } => {
                let scope = self.symbols.open_scope(ScopeKind::Block);
                node.scope = scope;
                if let Some(initializer) = initializer {
                    self.visit(initializer)?;
                }
                if let Some(condition) = condition {
                    let ct = self.visit(condition)?;
                    if !self.condition_coerces(ct, condition) {
                        self.symbols.close_scope();
                        return Err(self.err(
                            &loc,
                            "Condition must be a boolean.",
                        ));
                    }
                }
                if let Some(increment) = increment {
                    self.visit(increment)?;
                }
                self.visit(body)?;
                self.symbols.close_scope();
                Primitive::Void.id()
            }
            AstKind::Block { decls } => {
                let scope = self.symbols.open_scope(ScopeKind::Block);
                node.scope = scope;
                for decl in decls.iter_mut() {
                    self.visit(decl)?;
                }
                self.symbols.close_scope();
                Primitive::Void.id()
            }
            AstKind::VarDecl { name, ty } => {
                let name = name.clone();
                self.check_redefinition(&loc, &name)?;
                let type_id = self.resolve_type(ty)?;
                self.define_variable(&name, type_id);
                type_id
            }
            AstKind::VarInit { name, ty, expr } => {
                let name = name.clone();
                self.check_redefinition(&loc, &name)?;
                let type_id = self.resolve_type(ty)?;
                let value = self.visit(expr)?;
                if !self.initializer_matches(type_id, value, expr) {
                    return Err(self.err(
                        &loc,
                        "Type mismatch in initialisation.",
                    ));
                }
                self.define_variable(&name, type_id);
                type_id
            }
            AstKind::ConstDecl { name, ty, expr } => {
                let name = name.clone();
                self.check_redefinition(&loc, &name)?;
                let type_id = self.resolve_type(ty)?;
                self.visit(expr)?;
                let value = const_eval::evaluate(
                    expr,
                    &Environment::new(),
                    self.pool,
                    self.symbols,
                )
                .map_err(|e| self.const_err(&expr.loc, &e))?;
                let value = self.coerce_value(&loc, value, type_id)?;
                let index = self.pool.store(value);
                let storage = self.storage_here();
                self.symbols.define(
                    &name,
                    SymbolKind::Constant,
                    type_id,
                    storage,
                );
                self.symbols.set_constant_index(&name, index);
                type_id
            }
            AstKind::Fn {
                params,
                return_type,
                body,
                type_index,
                ..
            } => {
                let scope = self.symbols.open_scope(ScopeKind::Function);
                node.scope = scope;
                for param in params.iter_mut() {
                    let param_loc = param.loc.clone();
                    if param.scope == 0 {
                        param.scope = scope;
                    }
                    let AstKind::Param { name, value } = &mut param.kind
                    else {
                        continue;
                    };
                    let name = name.clone();
                    let type_id = self.resolve_type(value)?;
                    param.type_id = type_id;
                    if self.symbols.get_current_only(&name).is_some() {
                        self.symbols.close_scope();
                        return Err(self.err(
                            &param_loc,
                            &format!("Duplicate parameter '{name}'."),
                        ));
                    }
                    self.symbols.define(
                        &name,
                        SymbolKind::Parameter,
                        type_id,
                        StorageKind::Parameter,
                    );
                }
                let ret = self.resolve_type(return_type)?;
                self.return_types.push(ret);
                let result = self.visit(body);
                self.return_types.pop();
                self.symbols.close_scope();
                result?;
                *type_index
            }
            AstKind::Param { value, .. } => self.visit(value)?,
            AstKind::Initializer { assignments, kind } => {
                match kind {
                    InitializerKind::Array => {
                        for item in assignments.iter_mut() {
                            self.visit(item)?;
                        }
                    }
                    InitializerKind::Record => {
                        for assignment in assignments.iter_mut() {
                            self.visit(assignment)?;
                        }
                    }
                }
                Primitive::Initializer.id()
            }
            AstKind::TypeDecl { index, .. } => *index,
            AstKind::EnumDecl { .. }
            | AstKind::Ext { .. }
            | AstKind::Import { .. }
            | AstKind::Asm { .. } => Primitive::Void.id(),
            AstKind::Bank { decls, .. } => {
                let scope = node.scope;
                self.symbols.push_scope(scope);
                for decl in decls.iter_mut() {
                    self.visit(decl)?;
                }
                self.symbols.pop_scope();
                Primitive::Void.id()
            }
            AstKind::TypeName { .. }
            | AstKind::TypePtr { .. }
            | AstKind::TypeArray { .. }
            | AstKind::TypeFn { .. }
            | AstKind::Module { .. }
            | AstKind::Main { .. } => {
                return Err(
                    self.err(&loc, "Modules cannot nest inside modules.")
                );
            }
        };
        node.type_id = type_id;
        Ok(type_id)
    }

    fn define_variable(&mut self, name: &str, type_id: TypeId) {
        let storage = self.storage_here();
        self.symbols.define(
            name,
            SymbolKind::Variable,
            type_id,
            storage,
        );
        if self.types.kind(type_id) == TypeKind::Array
            && let Some(element) = self.types.get(type_id).fields.first()
            && element.element_count > 0
        {
            self.symbols
                .update_element_count(name, element.element_count);
        }
    }

    fn storage_here(&self) -> StorageKind {
        match self.symbols.scope(self.symbols.current_scope()).kind {
            ScopeKind::Module | ScopeKind::Bank => StorageKind::Static,
            _ => StorageKind::Auto,
        }
    }

    fn lookup(
        &self,
        loc: &Loc,
        module: Option<&str>,
        name: &str,
    ) -> Result<SymbolEntry, CompilerError> {
        let entry = match module {
            Some(module) => {
                let scope = self
                    .symbols
                    .scope_id_by_name(module)
                    .ok_or_else(|| {
                        self.err(
                            loc,
                            &format!("Unknown module '{module}'."),
                        )
                    })?;
                self.symbols.get(scope, name)
            }
            None => self
                .symbols
                .get_current(name)
                .or_else(|| self.symbols.check_banks(name)),
        };
        entry.ok_or_else(|| self.err(loc, "Identifier was not found."))
    }

    /// Conditions must coerce to `bool`. The lattice only widens
    /// upward, so nothing above bool narrows back down; only bool
    /// itself, or an unsized literal whose value fits it, qualifies.
    fn condition_coerces(&self, from: TypeId, from_node: &AstNode) -> bool {
        self.assignable(Primitive::Bool.id(), from, from_node)
    }

    /// Widening lattice: bool below u8/i8 below u16/i16 below number.
    /// Unsized literals narrow silently when the value fits; same-rank
    /// sign changes need an explicit cast.
    fn assignable(
        &self,
        to: TypeId,
        from: TypeId,
        from_node: &AstNode,
    ) -> bool {
        if to == from {
            return true;
        }
        if from == Primitive::Number.id() && is_numeric(to) {
            if let AstKind::Literal { index } = &from_node.kind {
                let value = &self.pool.get(*index).value;
                if let (Some(n), Some(kind)) =
                    (value.as_number(), value_kind_of(to))
                {
                    return values::fits(kind, n);
                }
            }
            return true;
        }
        match (rank(from), rank(to)) {
            (Some(from_rank), Some(to_rank)) => from_rank < to_rank,
            _ => false,
        }
    }

    fn initializer_matches(
        &self,
        to: TypeId,
        from: TypeId,
        from_node: &AstNode,
    ) -> bool {
        if from == Primitive::Initializer.id() {
            return match (&from_node.kind, self.types.kind(to)) {
                (
                    AstKind::Initializer {
                        kind: InitializerKind::Array,
                        ..
                    },
                    TypeKind::Array,
                ) => true,
                (
                    AstKind::Initializer {
                        kind: InitializerKind::Record,
                        ..
                    },
                    TypeKind::Record,
                ) => true,
                _ => false,
            };
        }
        self.assignable(to, from, from_node)
    }

    fn unify(
        &self,
        loc: &Loc,
        left: TypeId,
        right: TypeId,
    ) -> Result<TypeId, CompilerError> {
        if left == right {
            return Ok(left);
        }
        if left == Primitive::Number.id() && is_numeric(right) {
            return Ok(right);
        }
        if right == Primitive::Number.id() && is_numeric(left) {
            return Ok(left);
        }
        match (rank(left), rank(right)) {
            (Some(lr), Some(rr)) if lr < rr => Ok(right),
            (Some(lr), Some(rr)) if rr < lr => Ok(left),
            _ => Err(self.err(
                loc,
                "Operands of mismatched types; use an explicit cast.",
            )),
        }
    }

    fn coerce_value(
        &self,
        loc: &Loc,
        value: Value,
        to: TypeId,
    ) -> Result<Value, CompilerError> {
        if matches!(value, Value::Array(_) | Value::Record(_)) {
            return Ok(value);
        }
        if let Value::Str(_) = value {
            if to == Primitive::String.id() {
                return Ok(value);
            }
            return Err(
                self.err(loc, "Type mismatch in constant declaration.")
            );
        }
        let kind = value_kind_of(to).ok_or_else(|| {
            self.err(loc, "Type mismatch in constant declaration.")
        })?;
        let n = value.as_number().ok_or_else(|| {
            self.err(loc, "Type mismatch in constant declaration.")
        })?;
        if matches!(value, Value::LitNum(_)) && !values::fits(kind, n) {
            return Err(self.err(
                loc,
                &format!("Literal does not fit the declared type ({n})."),
            ));
        }
        Ok(values::typed_number(kind, n))
    }
}

fn is_numeric(type_id: TypeId) -> bool {
    (Primitive::Bool.id()..=Primitive::Number.id()).contains(&type_id)
}

fn castable(types: &TypeTable, type_id: TypeId) -> bool {
    is_numeric(type_id)
        || type_id == Primitive::Ptr.id()
        || type_id == Primitive::Char.id()
        || types.kind(type_id) == TypeKind::Pointer
}

fn rank(type_id: TypeId) -> Option<u8> {
    match Primitive::try_from(type_id).ok()? {
        Primitive::Bool => Some(0),
        Primitive::U8 | Primitive::I8 => Some(1),
        Primitive::U16 | Primitive::I16 => Some(2),
        Primitive::Number => Some(3),
        _ => None,
    }
}

fn value_kind_of(type_id: TypeId) -> Option<ValueKind> {
    match Primitive::try_from(type_id).ok()? {
        Primitive::Bool => Some(ValueKind::Bool),
        Primitive::U8 => Some(ValueKind::U8),
        Primitive::I8 => Some(ValueKind::I8),
        Primitive::U16 => Some(ValueKind::U16),
        Primitive::I16 => Some(ValueKind::I16),
        Primitive::Number => Some(ValueKind::LitNum),
        Primitive::Char => Some(ValueKind::Char),
        Primitive::Ptr => Some(ValueKind::Ptr),
        _ => None,
    }
}
