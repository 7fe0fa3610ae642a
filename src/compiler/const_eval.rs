use indexmap::IndexMap;
use thiserror::Error;

use crate::compiler::ast::{AstKind, AstNode, BinaryOp, UnaryOp};
use crate::compiler::const_pool::ConstPool;
use crate::compiler::symbol_table::{SymbolKind, SymbolTable};
use crate::values::{self, Value, ValueKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstEvalError {
    #[error("Division by zero.")]
    DivisionByZero,
    #[error("Impure operation in a constant context.")]
    Impure,
    #[error("Use of an undefined name '{0}' in a constant context.")]
    Undefined(String),
    #[error("'{0}' is not a constant.")]
    NonConstant(String),
    #[error("Expression cannot be evaluated at compile time.")]
    Invalid,
}

#[derive(Debug, Clone)]
pub struct EnvEntry {
    pub value: Value,
    pub constant: bool,
}

/// Shallow lexical environment for compile-time evaluation: a stack of
/// name maps, innermost last.
#[derive(Debug, Default)]
pub struct Environment {
    scopes: Vec<IndexMap<String, EnvEntry>>,
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            scopes: vec![IndexMap::new()],
        }
    }

    pub fn begin_scope(&mut self) {
        self.scopes.push(IndexMap::new());
    }

    pub fn end_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Introduces a binding in the innermost scope. Redefining an
    /// existing name in the same scope fails.
    pub fn define(&mut self, name: &str, value: Value, constant: bool) -> bool {
        let scope = match self.scopes.last_mut() {
            Some(scope) => scope,
            None => return false,
        };
        if scope.contains_key(name) {
            return false;
        }
        scope.insert(name.to_owned(), EnvEntry { value, constant });
        true
    }

    pub fn get(&self, name: &str) -> Option<&EnvEntry> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
    }
}

/// Interprets an expression subtree that must be known at compile
/// time. Only pure operations succeed; calls and asm blocks are
/// impure by definition.
pub fn evaluate(
    node: &AstNode,
    env: &Environment,
    pool: &ConstPool,
    symbols: &SymbolTable,
) -> Result<Value, ConstEvalError> {
    match &node.kind {
        AstKind::Literal { index } => Ok(pool.get(*index).value.clone()),
        AstKind::Identifier { name, .. } => {
            if let Some(entry) = env.get(name) {
                return Ok(entry.value.clone());
            }
            let scope = if node.scope != 0 {
                node.scope
            } else {
                symbols.current_scope()
            };
            match symbols.get(scope, name) {
                Some(symbol) if symbol.kind == SymbolKind::Constant => symbol
                    .constant_index
                    .map(|index| pool.get(index).value.clone())
                    .ok_or(ConstEvalError::NonConstant(name.clone())),
                Some(_) => Err(ConstEvalError::NonConstant(name.clone())),
                None => Err(ConstEvalError::Undefined(name.clone())),
            }
        }
        AstKind::Unary { op, expr } => {
            let value = evaluate(expr, env, pool, symbols)?;
            match op {
                UnaryOp::Neg => {
                    let n = value
                        .as_number()
                        .ok_or(ConstEvalError::Invalid)?;
                    Ok(values::typed_number(value.kind(), -n))
                }
                UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                UnaryOp::BitNot => {
                    let n = value
                        .as_number()
                        .ok_or(ConstEvalError::Invalid)?;
                    Ok(values::typed_number(value.kind(), !n))
                }
                UnaryOp::Ref | UnaryOp::Deref => Err(ConstEvalError::Impure),
            }
        }
        AstKind::Binary { op, left, right } => {
            let lhs = evaluate(left, env, pool, symbols)?;
            let rhs = evaluate(right, env, pool, symbols)?;
            binary(*op, &lhs, &rhs)
        }
        AstKind::Cast { expr, ty } => {
            let value = evaluate(expr, env, pool, symbols)?;
            let kind = cast_kind(ty).ok_or(ConstEvalError::Invalid)?;
            let n = value.as_number().ok_or(ConstEvalError::Invalid)?;
            Ok(values::typed_number(kind, n))
        }
        AstKind::Initializer { assignments, kind } => match kind {
            crate::compiler::ast::InitializerKind::Array => {
                let mut items = Vec::with_capacity(assignments.len());
                for item in assignments {
                    items.push(evaluate(item, env, pool, symbols)?);
                }
                Ok(Value::Array(items))
            }
            crate::compiler::ast::InitializerKind::Record => {
                let mut fields = Vec::with_capacity(assignments.len());
                for assignment in assignments {
                    match &assignment.kind {
                        AstKind::Param { name, value } => {
                            let field =
                                evaluate(value, env, pool, symbols)?;
                            fields.push((name.clone(), field));
                        }
                        _ => return Err(ConstEvalError::Invalid),
                    }
                }
                Ok(Value::Record(fields))
            }
        },
        AstKind::Param { value, .. } => evaluate(value, env, pool, symbols),
        AstKind::Call { .. } | AstKind::Asm { .. } => {
            Err(ConstEvalError::Impure)
        }
        AstKind::Error
        | AstKind::Lvalue { .. }
        | AstKind::TypeName { .. }
        | AstKind::TypePtr { .. }
        | AstKind::TypeArray { .. }
        | AstKind::TypeFn { .. }
        | AstKind::Dot { .. }
        | AstKind::Subscript { .. }
        | AstKind::Assignment { .. }
        | AstKind::VarDecl { .. }
        | AstKind::VarInit { .. }
        | AstKind::ConstDecl { .. }
        | AstKind::If { .. }
        | AstKind::While { .. }
        | AstKind::DoWhile { .. }
        | AstKind::For { .. }
        | AstKind::Block { .. }
        | AstKind::Return { .. }
        | AstKind::Exit { .. }
        | AstKind::Fn { .. }
        | AstKind::TypeDecl { .. }
        | AstKind::EnumDecl { .. }
        | AstKind::Bank { .. }
        | AstKind::Module { .. }
        | AstKind::Ext { .. }
        | AstKind::Import { .. }
        | AstKind::Main { .. } => Err(ConstEvalError::Invalid),
    }
}

fn binary(
    op: BinaryOp,
    lhs: &Value,
    rhs: &Value,
) -> Result<Value, ConstEvalError> {
    match op {
        BinaryOp::Equal => Ok(Value::Bool(values::is_equal(lhs, rhs))),
        BinaryOp::NotEqual => Ok(Value::Bool(!values::is_equal(lhs, rhs))),
        BinaryOp::And => Ok(Value::Bool(lhs.is_truthy() && rhs.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(lhs.is_truthy() || rhs.is_truthy())),
        _ => {
            let (l, r) = match (lhs.as_number(), rhs.as_number()) {
                (Some(l), Some(r)) => (l, r),
                _ => return Err(ConstEvalError::Invalid),
            };
            let kind = lhs.kind();
            let result = match op {
                BinaryOp::Add => {
                    values::typed_number(kind, l.wrapping_add(r))
                }
                BinaryOp::Sub => {
                    values::typed_number(kind, l.wrapping_sub(r))
                }
                BinaryOp::Mul => {
                    values::typed_number(kind, l.wrapping_mul(r))
                }
                BinaryOp::Div => {
                    if r == 0 {
                        return Err(ConstEvalError::DivisionByZero);
                    }
                    values::typed_number(kind, l.wrapping_div(r))
                }
                BinaryOp::Mod => {
                    if r == 0 {
                        return Err(ConstEvalError::DivisionByZero);
                    }
                    values::typed_number(kind, l.wrapping_rem(r))
                }
                BinaryOp::ShiftLeft => {
                    values::typed_number(kind, l.wrapping_shl(r as u32))
                }
                BinaryOp::ShiftRight => {
                    values::typed_number(kind, l.wrapping_shr(r as u32))
                }
                BinaryOp::BitAnd => values::typed_number(kind, l & r),
                BinaryOp::BitOr => values::typed_number(kind, l | r),
                BinaryOp::BitXor => values::typed_number(kind, l ^ r),
                BinaryOp::Greater => Value::Bool(l > r),
                BinaryOp::Less => Value::Bool(l < r),
                BinaryOp::GreaterEqual => Value::Bool(l >= r),
                BinaryOp::LessEqual => Value::Bool(l <= r),
                BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::And
                | BinaryOp::Or => return Err(ConstEvalError::Invalid),
            };
            Ok(result)
        }
    }
}

fn cast_kind(ty: &AstNode) -> Option<ValueKind> {
    match &ty.kind {
        AstKind::TypeName { name, .. } => match name.as_str() {
            "bool" => Some(ValueKind::Bool),
            "char" => Some(ValueKind::Char),
            "u8" | "uint8" => Some(ValueKind::U8),
            "i8" | "int8" => Some(ValueKind::I8),
            "u16" | "uint16" => Some(ValueKind::U16),
            "i16" | "int16" => Some(ValueKind::I16),
            "ptr" => Some(ValueKind::Ptr),
            "number" => Some(ValueKind::LitNum),
            _ => None,
        },
        AstKind::TypePtr { .. } => Some(ValueKind::Ptr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::NodeIdGen;
    use crate::compiler::parser::parse_module;
    use crate::compiler::type_table::TypeTable;

    fn eval_expr(source: &str) -> Result<Value, ConstEvalError> {
        let mut pool = ConstPool::new();
        let mut types = TypeTable::new();
        let mut ids = NodeIdGen::default();
        let full = format!("const x: u8 = {source};");
        let (module, _) =
            parse_module(&full, "main", 0, &mut pool, &mut types, &mut ids)
                .expect("parse");
        let AstKind::Module { decls, .. } = &module.kind else {
            unreachable!();
        };
        let AstKind::ConstDecl { expr, .. } = &decls[0].kind else {
            unreachable!();
        };
        let env = Environment::new();
        let symbols = SymbolTable::new();
        evaluate(expr, &env, &pool, &symbols)
    }

    #[test]
    fn folds_arithmetic() {
        assert_eq!(eval_expr("1 + 2 * 3"), Ok(Value::LitNum(7)));
        assert_eq!(eval_expr("(1 + 2) * 3"), Ok(Value::LitNum(9)));
        assert_eq!(eval_expr("10 % 4"), Ok(Value::LitNum(2)));
    }

    #[test]
    fn wraps_at_declared_width() {
        assert_eq!(
            eval_expr("255 as u8 + 1"),
            Ok(Value::U8(0)),
        );
    }

    #[test]
    fn division_by_zero_is_fatal() {
        assert_eq!(eval_expr("1 / 0"), Err(ConstEvalError::DivisionByZero));
        assert_eq!(eval_expr("1 % 0"), Err(ConstEvalError::DivisionByZero));
    }

    #[test]
    fn calls_are_impure() {
        assert_eq!(eval_expr("f()"), Err(ConstEvalError::Impure));
    }

    #[test]
    fn comparisons_produce_bools() {
        assert_eq!(eval_expr("2 < 3"), Ok(Value::Bool(true)));
        assert_eq!(eval_expr("2 == 3"), Ok(Value::Bool(false)));
        assert_eq!(eval_expr("true && false"), Ok(Value::Bool(false)));
    }

    #[test]
    fn undefined_names_error() {
        assert_eq!(
            eval_expr("missing"),
            Err(ConstEvalError::Undefined("missing".into()))
        );
    }
}
