//! Maximal-munch lexer for the source language.
//!
//! Operators and punctuation are scanned greedily (so `<=` wins over `<`),
//! keywords are resolved from identifier lexemes afterwards, and whitespace
//! plus `//` and `/* */` comments are dropped. Decimal literals must fit in a
//! 32-bit signed integer; hexadecimal literals (`0x...`) are accepted and
//! truncated to 32 bits.

pub mod token;

pub use token::{Token, TokenKind};

use crate::common::error::{CompileError, Result};

pub struct Lexer<'a> {
    input: &'a [u8],
    position: usize,
    line: usize,
    column: usize,
}

fn keyword(lexeme: &str) -> Option<TokenKind> {
    match lexeme {
        "return" => Some(TokenKind::Return),
        "if" => Some(TokenKind::If),
        "else" => Some(TokenKind::Else),
        "for" => Some(TokenKind::For),
        "while" => Some(TokenKind::While),
        "println" => Some(TokenKind::Println),
        "wain" => Some(TokenKind::Wain),
        "int" => Some(TokenKind::Int),
        "new" => Some(TokenKind::New),
        "delete" => Some(TokenKind::Delete),
        "NULL" => Some(TokenKind::Null),
        "break" => Some(TokenKind::Break),
        "continue" => Some(TokenKind::Continue),
        _ => None,
    }
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input: input.as_bytes(), position: 0, line: 1, column: 1 }
    }

    pub fn token_stream(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.position).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.position + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.position += 1;
        if ch == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(ch) = self.peek() {
                        if ch == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    self.bump();
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some(b'*'), Some(b'/')) => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            (Some(_), _) => {
                                self.bump();
                            }
                            (None, _) => {
                                return Err(CompileError::Lex(format!(
                                    "unterminated block comment starting at {line}:{column}"
                                )));
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        self.skip_trivia()?;
        let (line, column) = (self.line, self.column);
        let Some(ch) = self.peek() else {
            return Ok(None);
        };

        let start = self.position;
        let kind = match ch {
            b'(' => self.single(TokenKind::LParen),
            b')' => self.single(TokenKind::RParen),
            b'{' => self.single(TokenKind::LBrace),
            b'}' => self.single(TokenKind::RBrace),
            b'[' => self.single(TokenKind::LBrack),
            b']' => self.single(TokenKind::RBrack),
            b'+' => self.single(TokenKind::Plus),
            b'-' => self.single(TokenKind::Minus),
            b'*' => self.single(TokenKind::Star),
            b'/' => self.single(TokenKind::Slash),
            b'%' => self.single(TokenKind::Pct),
            b',' => self.single(TokenKind::Comma),
            b';' => self.single(TokenKind::Semi),
            b'=' => self.one_or_two(TokenKind::Becomes, b'=', TokenKind::Eq),
            b'<' => self.one_or_two(TokenKind::Lt, b'=', TokenKind::Le),
            b'>' => self.one_or_two(TokenKind::Gt, b'=', TokenKind::Ge),
            b'&' => self.one_or_two(TokenKind::Amp, b'&', TokenKind::Booland),
            b'|' => {
                self.bump();
                if self.peek() == Some(b'|') {
                    self.bump();
                    TokenKind::Boolor
                } else {
                    return Err(CompileError::Lex(format!(
                        "unexpected character '|' at {line}:{column}"
                    )));
                }
            }
            b'!' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    TokenKind::Ne
                } else {
                    return Err(CompileError::Lex(format!(
                        "unexpected character '!' at {line}:{column}"
                    )));
                }
            }
            b'0'..=b'9' => {
                let hex = ch == b'0'
                    && matches!(self.peek_at(1), Some(b'x' | b'X'))
                    && self.peek_at(2).is_some_and(|c| c.is_ascii_hexdigit());
                if hex {
                    self.bump();
                    self.bump();
                    while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                        self.bump();
                    }
                } else {
                    while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                        self.bump();
                    }
                }
                TokenKind::Num
            }
            b'a'..=b'z' | b'A'..=b'Z' => {
                while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_') {
                    self.bump();
                }
                TokenKind::Id
            }
            _ => {
                return Err(CompileError::Lex(format!(
                    "unexpected character '{}' at {line}:{column}",
                    ch as char
                )));
            }
        };

        let lexeme = std::str::from_utf8(&self.input[start..self.position])
            .expect("lexemes are ascii")
            .to_string();

        let kind = match kind {
            TokenKind::Id => keyword(&lexeme).unwrap_or(TokenKind::Id),
            TokenKind::Num => {
                parse_number(&lexeme).ok_or_else(|| {
                    CompileError::Lex(format!("number literal out of range at {line}:{column}: {lexeme}"))
                })?;
                TokenKind::Num
            }
            other => other,
        };

        Ok(Some(Token::new(kind, lexeme, line, column)))
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.bump();
        kind
    }

    fn one_or_two(&mut self, single: TokenKind, second: u8, double: TokenKind) -> TokenKind {
        self.bump();
        if self.peek() == Some(second) {
            self.bump();
            double
        } else {
            single
        }
    }
}

/// Parse a NUM lexeme. Decimal literals must fit in an i32; hexadecimal
/// literals wrap to 32 bits.
pub fn parse_number(lexeme: &str) -> Option<i64> {
    if let Some(digits) = lexeme.strip_prefix("0x").or_else(|| lexeme.strip_prefix("0X")) {
        let value = u64::from_str_radix(digits, 16).ok()?;
        Some(value as u32 as i32 as i64)
    } else {
        let value: i64 = lexeme.parse().ok()?;
        (value <= i32::MAX as i64).then_some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        Lexer::new(input).token_stream().unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_maximal_munch() {
        assert_eq!(
            kinds("< <= == = != & &&"),
            vec![
                TokenKind::Lt,
                TokenKind::Le,
                TokenKind::Eq,
                TokenKind::Becomes,
                TokenKind::Ne,
                TokenKind::Amp,
                TokenKind::Booland,
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            kinds("int wain while whiler NULL null"),
            vec![
                TokenKind::Int,
                TokenKind::Wain,
                TokenKind::While,
                TokenKind::Id,
                TokenKind::Null,
                TokenKind::Id,
            ]
        );
    }

    #[test]
    fn test_comments_dropped() {
        assert_eq!(
            kinds("a // line comment\n/* block\n comment */ b"),
            vec![TokenKind::Id, TokenKind::Id]
        );
    }

    #[test]
    fn test_number_range() {
        assert!(Lexer::new("2147483647").token_stream().is_ok());
        assert!(Lexer::new("2147483648").token_stream().is_err());
        assert_eq!(parse_number("0xFF"), Some(255));
        assert_eq!(parse_number("0xFFFFFFFF"), Some(-1));
    }

    #[test]
    fn test_positions() {
        let tokens = Lexer::new("a\n  b").token_stream().unwrap();
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
    }

    #[test]
    fn test_unexpected_character() {
        assert!(Lexer::new("a $ b").token_stream().is_err());
    }
}
