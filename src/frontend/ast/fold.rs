//! Constant folding on the AST.
//!
//! Binary operations over two integer literals are folded with 32-bit
//! wrapping semantics before lowering. Division and modulo by a literal zero
//! are left untouched: that is undefined behavior in the source language and
//! must survive to runtime rather than disappear at compile time.

use crate::frontend::ast::*;

pub fn fold_constants(program: &mut Program) -> usize {
    let mut folded = 0;
    for procedure in &mut program.procedures {
        for statement in &mut procedure.statements {
            fold_statement(statement, &mut folded);
        }
        fold_expr(&mut procedure.return_expr, &mut folded);
    }
    folded
}

fn fold_statement(statement: &mut Statement, folded: &mut usize) {
    match statement {
        Statement::Assign { lhs, rhs } => {
            if let LValue::Dereference(pointer) = lhs {
                fold_expr(pointer, folded);
            }
            fold_expr(rhs, folded);
        }
        Statement::If { test, true_branch, false_branch } => {
            fold_expr(test, folded);
            for statement in true_branch.iter_mut().chain(false_branch) {
                fold_statement(statement, folded);
            }
        }
        Statement::While { test, body } => {
            fold_expr(test, folded);
            for statement in body {
                fold_statement(statement, folded);
            }
        }
        Statement::Println(expr) | Statement::Delete(expr) => fold_expr(expr, folded),
    }
}

fn fold_expr(expr: &mut Expr, folded: &mut usize) {
    match &mut expr.kind {
        ExprKind::Literal(_) | ExprKind::Variable(_) | ExprKind::AddressOf(_) => {}
        ExprKind::Binary { op, lhs, rhs } => {
            fold_expr(lhs, folded);
            fold_expr(rhs, folded);
            let (ExprKind::Literal(a), ExprKind::Literal(b)) = (&lhs.kind, &rhs.kind) else {
                return;
            };
            if lhs.ty != Type::Int || rhs.ty != Type::Int {
                return;
            }
            let (a, b) = (*a as i32, *b as i32);
            let value = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Div if b != 0 => a.wrapping_div(b),
                BinaryOp::Mod if b != 0 => a.wrapping_rem(b),
                // Division by a literal zero survives to runtime.
                BinaryOp::Div | BinaryOp::Mod => return,
            };
            expr.kind = ExprKind::Literal(value as i64);
            *folded += 1;
        }
        ExprKind::Comparison { lhs, rhs, .. } => {
            fold_expr(lhs, folded);
            fold_expr(rhs, folded);
        }
        ExprKind::Dereference(inner) | ExprKind::New(inner) => fold_expr(inner, folded),
        ExprKind::Call { arguments, .. } => {
            for argument in arguments {
                fold_expr(argument, folded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::build_ast;
    use crate::frontend::parser::{parse, ContextFreeGrammar};

    fn folded_return(source: &str) -> Expr {
        let grammar = ContextFreeGrammar::default_grammar();
        let mut program = build_ast(&parse(&grammar, source).unwrap()).unwrap();
        fold_constants(&mut program);
        program.procedures.pop().unwrap().return_expr
    }

    #[test]
    fn test_folds_literal_arithmetic() {
        let expr = folded_return("int wain(int a, int b) { return 2 + 3 * 4; }");
        assert!(matches!(expr.kind, ExprKind::Literal(14)));
    }

    #[test]
    fn test_division_by_zero_survives() {
        let expr = folded_return("int wain(int a, int b) { return 1 / 0; }");
        assert!(matches!(expr.kind, ExprKind::Binary { op: BinaryOp::Div, .. }));
    }

    #[test]
    fn test_wrapping_semantics() {
        let expr = folded_return("int wain(int a, int b) { return 2147483647 + 1; }");
        assert!(matches!(expr.kind, ExprKind::Literal(value) if value == i32::MIN as i64));
    }

    #[test]
    fn test_partial_folds_leave_variables() {
        let expr = folded_return("int wain(int a, int b) { return a + (2 + 3); }");
        match expr.kind {
            ExprKind::Binary { rhs, .. } => assert!(matches!(rhs.kind, ExprKind::Literal(5))),
            other => panic!("expected binary, got {other:?}"),
        }
    }
}
