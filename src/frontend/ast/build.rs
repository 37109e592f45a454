//! Parse tree to typed AST.
//!
//! Construction is two passes: the first collects every procedure's signature
//! so calls can be typed regardless of definition order, the second builds
//! each procedure body bottom-up, resolving variable references against the
//! procedure's symbol table and computing every expression's type as it is
//! assembled.

use crate::common::error::{CompileError, Result};
use crate::common::fx_hash::FxHashMap;
use crate::frontend::ast::*;
use crate::frontend::lexer::{parse_number, TokenKind};
use crate::frontend::parser::ParseNode;

struct Builder {
    signatures: FxHashMap<String, (Vec<Type>, Type)>,
}

struct Scope {
    variables: FxHashMap<String, Type>,
}

impl Scope {
    fn declare(&mut self, name: &str, ty: Type) -> Result<()> {
        if self.variables.insert(name.to_string(), ty).is_some() {
            return Err(CompileError::Type(format!("duplicate declaration of {name}")));
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Type> {
        self.variables
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::Type(format!("use of undeclared variable {name}")))
    }
}

pub fn build_ast(tree: &ParseNode) -> Result<Program> {
    // procedures -> procedure procedures | main
    let mut procedure_nodes = Vec::new();
    let mut node = tree;
    loop {
        match node.ingredients().as_slice() {
            ["procedure", "procedures"] => {
                procedure_nodes.push(&node.children()[0]);
                node = &node.children()[1];
            }
            ["main"] => {
                procedure_nodes.push(&node.children()[0]);
                break;
            }
            other => panic!("unexpected procedures production {other:?}"),
        }
    }

    let mut builder = Builder { signatures: FxHashMap::default() };
    for procedure in &procedure_nodes {
        let (name, params) = builder.signature_of(procedure)?;
        let param_types = params.iter().map(|p| p.ty).collect();
        if builder.signatures.insert(name.clone(), (param_types, Type::Int)).is_some() {
            return Err(CompileError::Type(format!("duplicate procedure {name}")));
        }
    }
    if !builder.signatures.contains_key("wain") {
        return Err(CompileError::Type("program has no wain procedure".to_string()));
    }

    let procedures = procedure_nodes
        .iter()
        .map(|node| builder.build_procedure(node))
        .collect::<Result<Vec<_>>>()?;
    Ok(Program { procedures })
}

impl Builder {
    fn signature_of(&self, node: &ParseNode) -> Result<(String, Vec<Variable>)> {
        match node.ingredients().as_slice() {
            // procedure -> INT ID LPAREN params RPAREN LBRACE ...
            ["INT", "ID", "LPAREN", "params", ..] => {
                let name = node.children()[1].token().lexeme.clone();
                let params = self.build_params(&node.children()[3])?;
                Ok((name, params))
            }
            // main -> INT WAIN LPAREN dcl COMMA dcl RPAREN LBRACE ...
            ["INT", "WAIN", ..] => {
                let first = build_dcl(&node.children()[3]);
                let second = build_dcl(&node.children()[5]);
                if second.ty != Type::Int {
                    return Err(CompileError::Type(
                        "the second parameter of wain must be int".to_string(),
                    ));
                }
                Ok(("wain".to_string(), vec![first, second]))
            }
            other => panic!("unexpected procedure production {other:?}"),
        }
    }

    fn build_params(&self, node: &ParseNode) -> Result<Vec<Variable>> {
        let mut params = Vec::new();
        match node.ingredients().as_slice() {
            [] => {}
            ["paramlist"] => {
                let mut list = &node.children()[0];
                loop {
                    match list.ingredients().as_slice() {
                        ["dcl"] => {
                            params.push(build_dcl(&list.children()[0]));
                            break;
                        }
                        ["dcl", "COMMA", "paramlist"] => {
                            params.push(build_dcl(&list.children()[0]));
                            list = &list.children()[2];
                        }
                        other => panic!("unexpected paramlist production {other:?}"),
                    }
                }
            }
            other => panic!("unexpected params production {other:?}"),
        }
        Ok(params)
    }

    fn build_procedure(&self, node: &ParseNode) -> Result<Procedure> {
        let (name, params) = self.signature_of(node)?;
        let children = node.children();
        // Both productions put dcls, statements, and the return expr at fixed
        // offsets from the end: ... LBRACE dcls statements RETURN expr SEMI RBRACE
        let n = children.len();
        let dcls_node = &children[n - 6];
        let statements_node = &children[n - 5];
        let return_node = &children[n - 3];

        let mut scope = Scope { variables: FxHashMap::default() };
        for param in &params {
            scope.declare(&param.name, param.ty)?;
        }

        let decls = self.build_decls(dcls_node, &mut scope)?;
        let statements = self.build_statements(statements_node, &scope)?;
        let return_expr = self.build_expr(return_node, &scope)?;
        if return_expr.ty != Type::Int {
            return Err(CompileError::Type(format!("procedure {name} must return int")));
        }

        Ok(Procedure { name, params, return_type: Type::Int, decls, statements, return_expr })
    }

    fn build_decls(&self, node: &ParseNode, scope: &mut Scope) -> Result<Vec<(Variable, Literal)>> {
        // dcls -> ε | dcls dcl BECOMES NUM SEMI | dcls dcl BECOMES NULL SEMI
        let mut decls = match node.ingredients().as_slice() {
            [] => Vec::new(),
            ["dcls", ..] => self.build_decls(&node.children()[0], scope)?,
            other => panic!("unexpected dcls production {other:?}"),
        };
        if node.children().len() == 5 {
            let variable = build_dcl(&node.children()[1]);
            let initializer = node.children()[3].token();
            let literal = match initializer.kind {
                TokenKind::Num => Literal::int(
                    parse_number(&initializer.lexeme).expect("range-checked by the lexer"),
                ),
                TokenKind::Null => Literal::null(),
                _ => panic!("unexpected initializer token {initializer}"),
            };
            if variable.ty != literal.ty {
                return Err(CompileError::Type(format!(
                    "initializer for {} has type {}, expected {}",
                    variable.name, literal.ty, variable.ty
                )));
            }
            scope.declare(&variable.name, variable.ty)?;
            decls.push((variable, literal));
        }
        Ok(decls)
    }

    fn build_statements(&self, node: &ParseNode, scope: &Scope) -> Result<Vec<Statement>> {
        // statements -> ε | statements statement
        match node.ingredients().as_slice() {
            [] => Ok(Vec::new()),
            ["statements", "statement"] => {
                let mut statements = self.build_statements(&node.children()[0], scope)?;
                statements.push(self.build_statement(&node.children()[1], scope)?);
                Ok(statements)
            }
            other => panic!("unexpected statements production {other:?}"),
        }
    }

    fn build_statement(&self, node: &ParseNode, scope: &Scope) -> Result<Statement> {
        let children = node.children();
        match node.ingredients().as_slice() {
            ["lvalue", "BECOMES", "expr", "SEMI"] => {
                let lhs = self.build_lvalue(&children[0], scope)?;
                let rhs = self.build_expr(&children[2], scope)?;
                let lhs_ty = match &lhs {
                    LValue::Variable(variable) => variable.ty,
                    LValue::Dereference(_) => Type::Int,
                };
                if lhs_ty != rhs.ty {
                    return Err(CompileError::Type(format!(
                        "cannot assign {} to {}",
                        rhs.ty, lhs_ty
                    )));
                }
                Ok(Statement::Assign { lhs, rhs })
            }
            ["IF", "LPAREN", "test", "RPAREN", "LBRACE", "statements", "RBRACE", "ELSE", "LBRACE", "statements", "RBRACE"] => {
                Ok(Statement::If {
                    test: self.build_test(&children[2], scope)?,
                    true_branch: self.build_statements(&children[5], scope)?,
                    false_branch: self.build_statements(&children[9], scope)?,
                })
            }
            ["IF", "LPAREN", "test", "RPAREN", "LBRACE", "statements", "RBRACE"] => {
                Ok(Statement::If {
                    test: self.build_test(&children[2], scope)?,
                    true_branch: self.build_statements(&children[5], scope)?,
                    false_branch: Vec::new(),
                })
            }
            ["WHILE", "LPAREN", "test", "RPAREN", "LBRACE", "statements", "RBRACE"] => {
                Ok(Statement::While {
                    test: self.build_test(&children[2], scope)?,
                    body: self.build_statements(&children[5], scope)?,
                })
            }
            ["PRINTLN", "LPAREN", "expr", "RPAREN", "SEMI"] => {
                let expr = self.build_expr(&children[2], scope)?;
                if expr.ty != Type::Int {
                    return Err(CompileError::Type(format!("println expected int, got {}", expr.ty)));
                }
                Ok(Statement::Println(expr))
            }
            ["DELETE", "LBRACK", "RBRACK", "expr", "SEMI"] => {
                let expr = self.build_expr(&children[3], scope)?;
                if expr.ty != Type::IntStar {
                    return Err(CompileError::Type(format!("delete expected int*, got {}", expr.ty)));
                }
                Ok(Statement::Delete(expr))
            }
            other => panic!("unexpected statement production {other:?}"),
        }
    }

    fn build_test(&self, node: &ParseNode, scope: &Scope) -> Result<Expr> {
        // test -> expr OP expr
        let lhs = self.build_expr(&node.children()[0], scope)?;
        let rhs = self.build_expr(&node.children()[2], scope)?;
        if lhs.ty != rhs.ty {
            return Err(CompileError::Type(format!(
                "cannot compare {} with {}",
                lhs.ty, rhs.ty
            )));
        }
        let op = match node.children()[1].token().kind {
            TokenKind::Lt => ComparisonOp::Lt,
            TokenKind::Le => ComparisonOp::Le,
            TokenKind::Gt => ComparisonOp::Gt,
            TokenKind::Ge => ComparisonOp::Ge,
            TokenKind::Eq => ComparisonOp::Eq,
            TokenKind::Ne => ComparisonOp::Ne,
            other => panic!("unexpected comparison operator {other:?}"),
        };
        Ok(Expr {
            ty: Type::Int,
            kind: ExprKind::Comparison { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
        })
    }

    fn build_lvalue(&self, node: &ParseNode, scope: &Scope) -> Result<LValue> {
        let children = node.children();
        match node.ingredients().as_slice() {
            ["ID"] => {
                let name = children[0].token().lexeme.clone();
                let ty = scope.lookup(&name)?;
                Ok(LValue::Variable(Variable { name, ty }))
            }
            ["STAR", "factor"] => {
                let expr = self.build_expr(&children[1], scope)?;
                if expr.ty != Type::IntStar {
                    return Err(CompileError::Type(format!(
                        "cannot dereference a value of type {}",
                        expr.ty
                    )));
                }
                Ok(LValue::Dereference(Box::new(expr)))
            }
            ["LPAREN", "lvalue", "RPAREN"] => self.build_lvalue(&children[1], scope),
            other => panic!("unexpected lvalue production {other:?}"),
        }
    }

    fn build_expr(&self, node: &ParseNode, scope: &Scope) -> Result<Expr> {
        let children = node.children();
        match node.ingredients().as_slice() {
            // expr / term chains
            ["term"] | ["factor"] => self.build_expr(&children[0], scope),
            ["expr", "PLUS", "term"] => self.build_binary(BinaryOp::Add, node, scope),
            ["expr", "MINUS", "term"] => self.build_binary(BinaryOp::Sub, node, scope),
            ["term", "STAR", "factor"] => self.build_binary(BinaryOp::Mul, node, scope),
            ["term", "SLASH", "factor"] => self.build_binary(BinaryOp::Div, node, scope),
            ["term", "PCT", "factor"] => self.build_binary(BinaryOp::Mod, node, scope),

            // factors
            ["ID"] => {
                let name = children[0].token().lexeme.clone();
                let ty = scope.lookup(&name)?;
                Ok(Expr { ty, kind: ExprKind::Variable(name) })
            }
            ["NUM"] => {
                let value = parse_number(&children[0].token().lexeme).expect("range-checked");
                Ok(Expr::literal(Literal::int(value)))
            }
            ["NULL"] => Ok(Expr::literal(Literal::null())),
            ["LPAREN", "expr", "RPAREN"] => self.build_expr(&children[1], scope),
            ["AMP", "lvalue"] => match self.build_lvalue(&children[1], scope)? {
                LValue::Variable(variable) => {
                    if variable.ty != Type::Int {
                        return Err(CompileError::Type(format!(
                            "cannot take the address of {} of type {}",
                            variable.name, variable.ty
                        )));
                    }
                    Ok(Expr { ty: Type::IntStar, kind: ExprKind::AddressOf(variable.name) })
                }
                // &*e is e: the address-of and the dereference cancel.
                LValue::Dereference(inner) => Ok(*inner),
            },
            ["STAR", "factor"] => {
                let inner = self.build_expr(&children[1], scope)?;
                if inner.ty != Type::IntStar {
                    return Err(CompileError::Type(format!(
                        "cannot dereference a value of type {}",
                        inner.ty
                    )));
                }
                Ok(Expr { ty: Type::Int, kind: ExprKind::Dereference(Box::new(inner)) })
            }
            ["NEW", "INT", "LBRACK", "expr", "RBRACK"] => {
                let size = self.build_expr(&children[3], scope)?;
                if size.ty != Type::Int {
                    return Err(CompileError::Type("the size of new int[] must be int".to_string()));
                }
                Ok(Expr { ty: Type::IntStar, kind: ExprKind::New(Box::new(size)) })
            }
            ["ID", "LPAREN", "RPAREN"] => self.build_call(&children[0].token().lexeme, vec![], scope),
            ["ID", "LPAREN", "arglist", "RPAREN"] => {
                let mut arguments = Vec::new();
                let mut list = &children[2];
                loop {
                    match list.ingredients().as_slice() {
                        ["expr"] => {
                            arguments.push(self.build_expr(&list.children()[0], scope)?);
                            break;
                        }
                        ["expr", "COMMA", "arglist"] => {
                            arguments.push(self.build_expr(&list.children()[0], scope)?);
                            list = &list.children()[2];
                        }
                        other => panic!("unexpected arglist production {other:?}"),
                    }
                }
                self.build_call(&children[0].token().lexeme, arguments, scope)
            }
            other => panic!("unexpected expression production {other:?}"),
        }
    }

    fn build_binary(&self, op: BinaryOp, node: &ParseNode, scope: &Scope) -> Result<Expr> {
        let lhs = self.build_expr(&node.children()[0], scope)?;
        let rhs = self.build_expr(&node.children()[2], scope)?;
        let ty = match (op, lhs.ty, rhs.ty) {
            (_, Type::Int, Type::Int) => Type::Int,
            (BinaryOp::Add, Type::IntStar, Type::Int) => Type::IntStar,
            (BinaryOp::Add, Type::Int, Type::IntStar) => Type::IntStar,
            (BinaryOp::Sub, Type::IntStar, Type::Int) => Type::IntStar,
            (BinaryOp::Sub, Type::IntStar, Type::IntStar) => Type::Int,
            (op, lhs_ty, rhs_ty) => {
                return Err(CompileError::Type(format!(
                    "invalid operand types {lhs_ty} and {rhs_ty} to {op:?}"
                )));
            }
        };
        Ok(Expr { ty, kind: ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) } })
    }

    fn build_call(&self, procedure: &str, arguments: Vec<Expr>, scope: &Scope) -> Result<Expr> {
        if scope.variables.contains_key(procedure) {
            return Err(CompileError::Type(format!("{procedure} is a variable, not a procedure")));
        }
        let (param_types, return_type) = self
            .signatures
            .get(procedure)
            .ok_or_else(|| CompileError::Type(format!("call to undefined procedure {procedure}")))?;
        if arguments.len() != param_types.len() {
            return Err(CompileError::Type(format!(
                "call to {procedure} passes {} arguments, expected {}",
                arguments.len(),
                param_types.len()
            )));
        }
        for (idx, (argument, expected)) in arguments.iter().zip(param_types).enumerate() {
            if argument.ty != *expected {
                return Err(CompileError::Type(format!(
                    "argument {idx} to {procedure} has type {}, expected {expected}",
                    argument.ty
                )));
            }
        }
        Ok(Expr {
            ty: *return_type,
            kind: ExprKind::Call { procedure: procedure.to_string(), arguments },
        })
    }
}

fn build_dcl(node: &ParseNode) -> Variable {
    // dcl -> type ID, type -> INT | INT STAR
    let ty = match node.children()[0].ingredients().as_slice() {
        ["INT"] => Type::Int,
        ["INT", "STAR"] => Type::IntStar,
        other => panic!("unexpected type production {other:?}"),
    };
    let name = node.children()[1].token().lexeme.clone();
    Variable { name, ty }
}
