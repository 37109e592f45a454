//! Earley parser over the embedded grammar.
//!
//! The parser builds the classic predict/scan/complete table, one column per
//! token boundary, then reconstructs a parse tree by walking completed items
//! backwards through the columns. Nullable symbols are precomputed so that
//! prediction can complete epsilon productions in the same column.

pub mod grammar;

use std::fmt::Write as _;

use crate::common::error::{CompileError, Result};
use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::frontend::lexer::Token;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Production {
    pub product: String,
    pub ingredients: Vec<String>,
}

#[derive(Debug)]
pub struct ContextFreeGrammar {
    pub start_symbol: String,
    pub productions: Vec<Production>,
    by_product: FxHashMap<String, Vec<usize>>,
    non_terminals: FxHashSet<String>,
    nullable: FxHashSet<String>,
}

impl ContextFreeGrammar {
    pub fn load(text: &str) -> Self {
        let mut productions = Vec::new();
        let mut by_product: FxHashMap<String, Vec<usize>> = FxHashMap::default();
        let mut start_symbol = String::new();
        for line in text.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() || tokens[0].starts_with('#') {
                continue;
            }
            assert!(tokens.len() >= 2 && tokens[1] == "->", "invalid production: {line}");
            let product = tokens[0].to_string();
            if start_symbol.is_empty() {
                start_symbol = product.clone();
            }
            by_product.entry(product.clone()).or_default().push(productions.len());
            productions.push(Production {
                product,
                ingredients: tokens[2..].iter().map(|s| s.to_string()).collect(),
            });
        }

        let non_terminals: FxHashSet<String> = by_product.keys().cloned().collect();

        // Fixpoint: a symbol is nullable when some production for it has only
        // nullable ingredients.
        let mut nullable: FxHashSet<String> = FxHashSet::default();
        loop {
            let mut changed = false;
            for production in &productions {
                if nullable.contains(&production.product) {
                    continue;
                }
                if production.ingredients.iter().all(|symbol| nullable.contains(symbol)) {
                    nullable.insert(production.product.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        Self { start_symbol, productions, by_product, non_terminals, nullable }
    }

    pub fn default_grammar() -> Self {
        Self::load(grammar::GRAMMAR)
    }

    fn find_productions(&self, symbol: &str) -> &[usize] {
        self.by_product.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    fn is_non_terminal(&self, symbol: &str) -> bool {
        self.non_terminals.contains(symbol)
    }

    fn is_nullable(&self, symbol: &str) -> bool {
        self.nullable.contains(symbol)
    }
}

/// A dotted production with its origin column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateItem {
    production: usize,
    origin: usize,
    dot: usize,
}

impl StateItem {
    fn new(production: usize, origin: usize) -> Self {
        Self { production, origin, dot: 0 }
    }

    fn step(self) -> Self {
        Self { dot: self.dot + 1, ..self }
    }
}

pub struct EarleyParser<'g> {
    grammar: &'g ContextFreeGrammar,
}

pub struct EarleyTable<'g> {
    grammar: &'g ContextFreeGrammar,
    tokens: Vec<Token>,
    columns: Vec<Vec<StateItem>>,
}

/// A parse tree: interior nodes carry the production they derive, leaves the
/// matched token.
#[derive(Debug, Clone)]
pub enum ParseNode {
    Terminal(Token),
    Derivation { production: Production, children: Vec<ParseNode> },
}

impl ParseNode {
    pub fn token(&self) -> &Token {
        match self {
            ParseNode::Terminal(token) => token,
            ParseNode::Derivation { production, .. } => {
                panic!("expected a terminal, found derivation of {}", production.product)
            }
        }
    }

    pub fn children(&self) -> &[ParseNode] {
        match self {
            ParseNode::Terminal(_) => &[],
            ParseNode::Derivation { children, .. } => children,
        }
    }

    pub fn production(&self) -> &Production {
        match self {
            ParseNode::Terminal(token) => panic!("expected a derivation, found token {token}"),
            ParseNode::Derivation { production, .. } => production,
        }
    }

    /// The right-hand-side symbols, for shape matching in the AST builder.
    pub fn ingredients(&self) -> Vec<&str> {
        match self {
            ParseNode::Terminal(_) => vec![],
            ParseNode::Derivation { production, .. } => {
                production.ingredients.iter().map(String::as_str).collect()
            }
        }
    }

    fn tokens(&self, out: &mut Vec<Token>) {
        match self {
            ParseNode::Terminal(token) => out.push(token.clone()),
            ParseNode::Derivation { children, .. } => {
                for child in children {
                    child.tokens(out);
                }
            }
        }
    }
}

impl<'g> EarleyParser<'g> {
    pub fn new(grammar: &'g ContextFreeGrammar) -> Self {
        Self { grammar }
    }

    pub fn construct_table(&self, tokens: Vec<Token>) -> Result<EarleyTable<'g>> {
        let mut table = EarleyTable {
            grammar: self.grammar,
            columns: vec![Vec::new(); tokens.len() + 1],
            tokens,
        };

        for &production in self.grammar.find_productions(&self.grammar.start_symbol) {
            table.insert_unique(0, StateItem::new(production, 0));
        }

        for i in 0..=table.tokens.len() {
            if table.columns[i].is_empty() {
                return Err(table.report_error(i));
            }
            let mut j = 0;
            while j < table.columns[i].len() {
                let item = table.columns[i][j];
                let production = &self.grammar.productions[item.production];
                match production.ingredients.get(item.dot) {
                    None => table.complete(i, item),
                    Some(symbol) if self.grammar.is_non_terminal(symbol) => {
                        table.predict(i, item, symbol)
                    }
                    Some(symbol) => table.scan(i, item, symbol),
                }
                j += 1;
            }
        }

        Ok(table)
    }
}

impl<'g> EarleyTable<'g> {
    fn insert_unique(&mut self, column: usize, item: StateItem) {
        if !self.columns[column].contains(&item) {
            self.columns[column].push(item);
        }
    }

    fn column_contains(&self, column: usize, item: &StateItem) -> bool {
        self.columns[column].contains(item)
    }

    fn complete(&mut self, column: usize, item: StateItem) {
        let product = &self.grammar.productions[item.production].product;
        let mut to_add = Vec::new();
        for old_item in &self.columns[item.origin] {
            let production = &self.grammar.productions[old_item.production];
            if production.ingredients.get(old_item.dot).map(String::as_str) == Some(product) {
                to_add.push(old_item.step());
            }
        }
        for new_item in to_add {
            self.insert_unique(column, new_item);
        }
    }

    fn predict(&mut self, column: usize, item: StateItem, symbol: &str) {
        let productions = self.grammar.find_productions(symbol).to_vec();
        for production in productions {
            self.insert_unique(column, StateItem::new(production, column));
        }
        if self.grammar.is_nullable(symbol) {
            self.insert_unique(column, item.step());
        }
    }

    fn scan(&mut self, column: usize, item: StateItem, symbol: &str) {
        if column >= self.tokens.len() {
            return;
        }
        if self.tokens[column].kind.grammar_symbol() == symbol {
            self.insert_unique(column + 1, item.step());
        }
    }

    fn report_error(&self, column: usize) -> CompileError {
        if column == 0 {
            return CompileError::Parse("unexpected start of input".to_string());
        }

        let offending = &self.tokens[column - 1];
        let mut expected: Vec<String> = self.columns[column - 1]
            .iter()
            .filter_map(|item| {
                let production = &self.grammar.productions[item.production];
                production.ingredients.get(item.dot).cloned()
            })
            .collect();
        expected.sort();
        expected.dedup();

        let mut message = format!(
            "unexpected {offending} at {}:{}; expected one of [{}]",
            offending.line,
            offending.column,
            expected.join(", ")
        );

        let begin = column.saturating_sub(8);
        let end = (column + 8).min(self.tokens.len());
        write!(message, "\ncontext:").unwrap();
        for idx in begin..end {
            if idx == column - 1 {
                write!(message, " •").unwrap();
            }
            write!(message, " {}", self.tokens[idx].lexeme).unwrap();
        }
        CompileError::Parse(message)
    }

    fn find_item(&self, start: usize, end: usize, target: &str) -> Option<StateItem> {
        self.columns[end]
            .iter()
            .find(|item| {
                let production = &self.grammar.productions[item.production];
                item.origin == start
                    && item.dot == production.ingredients.len()
                    && production.product == target
            })
            .copied()
    }

    fn construct_parse_tree(&self, start: usize, end: usize, target: &str) -> Option<ParseNode> {
        let item = self.find_item(start, end, target)?;
        let production = self.grammar.productions[item.production].clone();

        let mut children: Vec<ParseNode> = Vec::with_capacity(production.ingredients.len());
        let mut next_idx = end;
        for dot in (0..production.ingredients.len()).rev() {
            let last_idx = next_idx;
            let target_item = StateItem { production: item.production, origin: item.origin, dot };
            let ingredient = &production.ingredients[dot];
            let is_non_terminal = self.grammar.is_non_terminal(ingredient);

            let mut added = false;
            for idx in (start..=last_idx).rev() {
                if !self.column_contains(idx, &target_item) {
                    continue;
                }
                let child = if is_non_terminal {
                    match self.construct_parse_tree(idx, last_idx, ingredient) {
                        Some(child) => child,
                        None => continue,
                    }
                } else {
                    if idx >= self.tokens.len()
                        || self.tokens[idx].kind.grammar_symbol() != ingredient
                        || last_idx != idx + 1
                    {
                        continue;
                    }
                    ParseNode::Terminal(self.tokens[idx].clone())
                };
                children.push(child);
                next_idx = idx;
                added = true;
                break;
            }
            if !added {
                return None;
            }
        }

        if next_idx != start {
            return None;
        }
        children.reverse();
        Some(ParseNode::Derivation { production, children })
    }

    pub fn to_parse_tree(&self) -> Result<ParseNode> {
        let tree = self
            .construct_parse_tree(0, self.columns.len() - 1, &self.grammar.start_symbol)
            .ok_or_else(|| self.report_error(self.columns.len() - 1))?;
        let mut leaves = Vec::new();
        tree.tokens(&mut leaves);
        assert_eq!(leaves, self.tokens, "bad parse: some tokens were missing");
        Ok(tree)
    }
}

/// Lex and parse a whole source program.
pub fn parse(grammar: &ContextFreeGrammar, input: &str) -> Result<ParseNode> {
    let tokens = crate::frontend::lexer::Lexer::new(input).token_stream()?;
    let table = EarleyParser::new(grammar).construct_table(tokens)?;
    table.to_parse_tree()
}
