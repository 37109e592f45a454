//! AST to three-address IR.
//!
//! The lowerer walks each procedure in evaluation order, appending to a flat
//! instruction list. Every expression lands in a fresh temporary drawn from a
//! monotonic counter whose `%` prefix cannot collide with source identifiers.
//! Control flow lowers to the label/branch skeletons that CFG construction
//! later slices into blocks.

use crate::common::fx_hash::FxHashMap;
use crate::frontend::ast;
use crate::ir::cfg::{ControlFlowGraph, Program};
use crate::ir::ir::{Function, Instruction, Type, Variable};

fn type_of(ty: ast::Type) -> Type {
    match ty {
        ast::Type::Int => Type::Int,
        ast::Type::IntStar => Type::IntStar,
    }
}

pub struct Lowerer {
    next_temp: usize,
    label_counters: FxHashMap<&'static str, usize>,
    instructions: Vec<Instruction>,
}

impl Lowerer {
    pub fn new() -> Self {
        Self { next_temp: 0, label_counters: FxHashMap::default(), instructions: Vec::new() }
    }

    pub fn lower(mut self, program: &ast::Program) -> Program {
        let mut result = Program::default();
        for procedure in &program.procedures {
            let function = self.lower_procedure(procedure);
            result.functions.insert(function.name.clone(), ControlFlowGraph::new(function));
        }
        result
    }

    fn temp(&mut self) -> String {
        let idx = self.next_temp;
        self.next_temp += 1;
        format!("%t{idx}")
    }

    fn generate_label(&mut self, prefix: &'static str) -> String {
        let counter = self.label_counters.entry(prefix).or_insert(0);
        let idx = *counter;
        *counter += 1;
        format!("{prefix}{idx}")
    }

    fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    fn lower_procedure(&mut self, procedure: &ast::Procedure) -> Function {
        let parameters = procedure
            .params
            .iter()
            .map(|param| Variable::new(param.name.clone(), type_of(param.ty)))
            .collect();
        let mut function =
            Function::new(procedure.name.clone(), parameters, type_of(procedure.return_type));

        debug_assert!(self.instructions.is_empty());
        for (variable, literal) in &procedure.decls {
            self.emit(Instruction::constant(
                variable.name.clone(),
                literal.value,
                type_of(literal.ty),
            ));
        }
        for statement in &procedure.statements {
            self.lower_statement(statement);
        }
        let (result, _) = self.lower_expr(&procedure.return_expr);
        self.emit(Instruction::ret(result));

        function.instructions = std::mem::take(&mut self.instructions);
        function
    }

    fn lower_statement(&mut self, statement: &ast::Statement) {
        match statement {
            ast::Statement::Assign { lhs, rhs } => {
                let (value, ty) = self.lower_expr(rhs);
                match lhs {
                    ast::LValue::Variable(variable) => {
                        self.emit(Instruction::id(variable.name.clone(), value, ty));
                    }
                    ast::LValue::Dereference(pointer) => {
                        let (pointer, _) = self.lower_expr(pointer);
                        self.emit(Instruction::store(pointer, value));
                    }
                }
            }
            ast::Statement::If { test, true_branch, false_branch } => {
                let true_label = self.generate_label("ifTrue");
                let false_label = self.generate_label("ifFalse");
                let endif_label = self.generate_label("ifEndif");

                let (condition, _) = self.lower_expr(test);
                self.emit(Instruction::br(condition, true_label.clone(), false_label.clone()));
                self.emit(Instruction::label(true_label));
                for statement in true_branch {
                    self.lower_statement(statement);
                }
                self.emit(Instruction::jmp(endif_label.clone()));
                self.emit(Instruction::label(false_label));
                for statement in false_branch {
                    self.lower_statement(statement);
                }
                self.emit(Instruction::jmp(endif_label.clone()));
                self.emit(Instruction::label(endif_label));
            }
            ast::Statement::While { test, body } => {
                let loop_label = self.generate_label("whileLoop");
                let body_label = self.generate_label("whileBody");
                let end_label = self.generate_label("whileEnd");

                self.emit(Instruction::label(loop_label.clone()));
                let (condition, _) = self.lower_expr(test);
                self.emit(Instruction::br(condition, body_label.clone(), end_label.clone()));
                self.emit(Instruction::label(body_label));
                for statement in body {
                    self.lower_statement(statement);
                }
                self.emit(Instruction::jmp(loop_label));
                self.emit(Instruction::label(end_label));
            }
            ast::Statement::Println(expr) => {
                let (value, _) = self.lower_expr(expr);
                self.emit(Instruction::print(value));
            }
            ast::Statement::Delete(expr) => {
                // The NULL-sentinel guard around the runtime call is emitted
                // at code generation, not here.
                let (pointer, _) = self.lower_expr(expr);
                self.emit(Instruction::free(pointer));
            }
        }
    }

    /// Lower an expression; returns the destination holding its value.
    fn lower_expr(&mut self, expr: &ast::Expr) -> (String, Type) {
        let ty = type_of(expr.ty);
        match &expr.kind {
            ast::ExprKind::Literal(value) => {
                let destination = self.temp();
                self.emit(Instruction::constant(destination.clone(), *value, ty));
                (destination, ty)
            }
            ast::ExprKind::Variable(name) => {
                let destination = self.temp();
                self.emit(Instruction::id(destination.clone(), name.clone(), ty));
                (destination, ty)
            }
            ast::ExprKind::Binary { op, lhs, rhs } => {
                let left_is_pointer = lhs.ty == ast::Type::IntStar;
                let right_is_pointer = rhs.ty == ast::Type::IntStar;
                let (lhs, _) = self.lower_expr(lhs);
                let (rhs, _) = self.lower_expr(rhs);
                let destination = self.temp();
                let instruction = match op {
                    ast::BinaryOp::Add if left_is_pointer => {
                        Instruction::ptradd(destination.clone(), lhs, rhs)
                    }
                    // int + pointer commutes into pointer + int.
                    ast::BinaryOp::Add if right_is_pointer => {
                        Instruction::ptradd(destination.clone(), rhs, lhs)
                    }
                    ast::BinaryOp::Add => Instruction::add(destination.clone(), lhs, rhs),
                    ast::BinaryOp::Sub if left_is_pointer && right_is_pointer => {
                        Instruction::ptrdiff(destination.clone(), lhs, rhs)
                    }
                    ast::BinaryOp::Sub if left_is_pointer => {
                        Instruction::ptrsub(destination.clone(), lhs, rhs)
                    }
                    ast::BinaryOp::Sub => Instruction::sub(destination.clone(), lhs, rhs),
                    ast::BinaryOp::Mul => Instruction::mul(destination.clone(), lhs, rhs),
                    ast::BinaryOp::Div => Instruction::div(destination.clone(), lhs, rhs),
                    ast::BinaryOp::Mod => Instruction::modulo(destination.clone(), lhs, rhs),
                };
                self.emit(instruction);
                (destination, ty)
            }
            ast::ExprKind::Comparison { op, lhs, rhs } => {
                let (lhs, _) = self.lower_expr(lhs);
                let (rhs, _) = self.lower_expr(rhs);
                let destination = self.temp();
                let instruction = match op {
                    ast::ComparisonOp::Lt => Instruction::lt(destination.clone(), lhs, rhs),
                    ast::ComparisonOp::Le => Instruction::le(destination.clone(), lhs, rhs),
                    ast::ComparisonOp::Gt => Instruction::gt(destination.clone(), lhs, rhs),
                    ast::ComparisonOp::Ge => Instruction::ge(destination.clone(), lhs, rhs),
                    ast::ComparisonOp::Eq => Instruction::eq(destination.clone(), lhs, rhs),
                    ast::ComparisonOp::Ne => Instruction::ne(destination.clone(), lhs, rhs),
                };
                self.emit(instruction);
                (destination, Type::Bool)
            }
            ast::ExprKind::AddressOf(variable) => {
                let destination = self.temp();
                self.emit(Instruction::addressof(destination.clone(), variable.clone()));
                (destination, ty)
            }
            ast::ExprKind::Dereference(pointer) => {
                let (pointer, _) = self.lower_expr(pointer);
                let destination = self.temp();
                self.emit(Instruction::load(destination.clone(), pointer));
                (destination, ty)
            }
            ast::ExprKind::New(size) => {
                let (size, _) = self.lower_expr(size);
                let destination = self.temp();
                self.emit(Instruction::alloc(destination.clone(), size));
                (destination, ty)
            }
            ast::ExprKind::Call { procedure, arguments } => {
                let argument_names =
                    arguments.iter().map(|argument| self.lower_expr(argument).0).collect();
                let destination = self.temp();
                self.emit(Instruction::call(
                    destination.clone(),
                    procedure.clone(),
                    argument_names,
                    ty,
                ));
                (destination, ty)
            }
        }
    }
}

impl Default for Lowerer {
    fn default() -> Self {
        Self::new()
    }
}
