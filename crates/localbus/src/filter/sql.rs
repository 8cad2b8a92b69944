//! Lexer and recursive-descent parser for the SQL filter dialect.
//!
//! Grammar (keywords are case-insensitive):
//!
//! ```text
//! filter     := or_expr EOF
//! or_expr    := and_expr ( OR and_expr )*
//! and_expr   := not_expr ( AND not_expr )*
//! not_expr   := NOT not_expr | predicate
//! predicate  := additive [ cmp additive
//!                         | IS [NOT] NULL
//!                         | [NOT] LIKE string [ESCAPE string]
//!                         | [NOT] IN '(' literal ( ',' literal )* ')' ]
//! additive   := term ( ('+' | '-') term )*
//! term       := unary ( ('*' | '/' | '%') unary )*
//! unary      := ('-' | '+') unary | primary
//! primary    := literal | EXISTS '(' property ')' | '(' or_expr ')' | property
//! property   := ident | (sys | user) '.' ident
//! actions    := statement ( ';' statement )* [';'] EOF
//! statement  := SET property '=' or_expr | REMOVE property
//! ```

use super::expr::{compile_like, BinaryOp, Expr, PropertyRef, SystemProperty, UnaryOp};
use crate::error::FilterError;
use crate::message::PropertyValue;

const RESERVED: &[&str] = &[
    "AND", "OR", "NOT", "IS", "NULL", "LIKE", "ESCAPE", "IN", "EXISTS", "TRUE", "FALSE", "SET",
    "REMOVE",
];

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    QuotedIdent(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    Comma,
    Dot,
    Semicolon,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn syntax(position: usize, message: impl Into<String>) -> FilterError {
    FilterError::Syntax {
        position,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, FilterError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (position, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let single = match c {
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            ',' => Some(TokenKind::Comma),
            '.' => Some(TokenKind::Dot),
            ';' => Some(TokenKind::Semicolon),
            '=' => Some(TokenKind::Eq),
            '+' => Some(TokenKind::Plus),
            '-' => Some(TokenKind::Minus),
            '*' => Some(TokenKind::Star),
            '/' => Some(TokenKind::Slash),
            '%' => Some(TokenKind::Percent),
            _ => None,
        };
        if let Some(kind) = single {
            tokens.push(Token { kind, position });
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            '<' => {
                let (kind, width) = match next {
                    Some('=') => (TokenKind::Le, 2),
                    Some('>') => (TokenKind::Ne, 2),
                    _ => (TokenKind::Lt, 1),
                };
                tokens.push(Token { kind, position });
                i += width;
            }
            '>' => {
                let (kind, width) = match next {
                    Some('=') => (TokenKind::Ge, 2),
                    _ => (TokenKind::Gt, 1),
                };
                tokens.push(Token { kind, position });
                i += width;
            }
            '!' => {
                if next != Some('=') {
                    return Err(syntax(position, "expected '=' after '!'"));
                }
                tokens.push(Token {
                    kind: TokenKind::Ne,
                    position,
                });
                i += 2;
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax(position, "unterminated string literal")),
                        Some((_, '\'')) => {
                            if chars.get(i + 1).map(|(_, c)| *c) == Some('\'') {
                                value.push('\'');
                                i += 2;
                            } else {
                                i += 1;
                                break;
                            }
                        }
                        Some((_, ch)) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Str(value),
                    position,
                });
            }
            '[' => {
                let mut name = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax(position, "unterminated bracketed identifier")),
                        Some((_, ']')) => {
                            i += 1;
                            break;
                        }
                        Some((_, ch)) => {
                            name.push(*ch);
                            i += 1;
                        }
                    }
                }
                if name.is_empty() {
                    return Err(syntax(position, "empty bracketed identifier"));
                }
                tokens.push(Token {
                    kind: TokenKind::QuotedIdent(name),
                    position,
                });
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while chars.get(i).is_some_and(|(_, c)| c.is_ascii_digit()) {
                    i += 1;
                }
                let mut is_float = false;
                if chars.get(i).map(|(_, c)| *c) == Some('.')
                    && chars.get(i + 1).is_some_and(|(_, c)| c.is_ascii_digit())
                {
                    is_float = true;
                    i += 1;
                    while chars.get(i).is_some_and(|(_, c)| c.is_ascii_digit()) {
                        i += 1;
                    }
                }
                if matches!(chars.get(i).map(|(_, c)| *c), Some('e') | Some('E')) {
                    let mut j = i + 1;
                    if matches!(chars.get(j).map(|(_, c)| *c), Some('+') | Some('-')) {
                        j += 1;
                    }
                    if chars.get(j).is_some_and(|(_, c)| c.is_ascii_digit()) {
                        is_float = true;
                        i = j;
                        while chars.get(i).is_some_and(|(_, c)| c.is_ascii_digit()) {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let kind = if is_float {
                    TokenKind::Float(
                        text.parse()
                            .map_err(|_| syntax(position, format!("invalid number '{}'", text)))?,
                    )
                } else {
                    TokenKind::Int(
                        text.parse()
                            .map_err(|_| syntax(position, format!("integer '{}' out of range", text)))?,
                    )
                };
                tokens.push(Token { kind, position });
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|(_, c)| c.is_alphanumeric() || *c == '_' || *c == '$')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                tokens.push(Token {
                    kind: TokenKind::Ident(text),
                    position,
                });
            }
            other => return Err(syntax(position, format!("unexpected character '{}'", other))),
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        position: source.len(),
    });
    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

/// A single rule-action statement
#[derive(Debug, Clone)]
pub(crate) enum Statement {
    Set { target: PropertyRef, value: Expr },
    Remove { target: PropertyRef },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Result<Self, FilterError> {
        Ok(Self {
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    fn peek(&self) -> &Token {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(word) if word.eq_ignore_ascii_case(keyword))
    }

    /// Keyword `offset` tokens ahead of the cursor
    fn keyword_ahead(&self, offset: usize, keyword: &str) -> bool {
        matches!(
            self.tokens.get(self.pos + offset).map(|t| &t.kind),
            Some(TokenKind::Ident(word)) if word.eq_ignore_ascii_case(keyword)
        )
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), FilterError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            let token = self.peek();
            Err(syntax(token.position, format!("expected {}", keyword)))
        }
    }

    fn expect(&mut self, kind: TokenKind, description: &str) -> Result<(), FilterError> {
        if self.peek().kind == kind {
            self.advance();
            Ok(())
        } else {
            Err(syntax(self.peek().position, format!("expected {}", description)))
        }
    }

    fn expect_eof(&self) -> Result<(), FilterError> {
        let token = self.peek();
        if token.kind == TokenKind::Eof {
            Ok(())
        } else {
            Err(syntax(token.position, "unexpected trailing input"))
        }
    }

    fn or_expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("OR") {
            let right = self.and_expr()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("AND") {
            let right = self.not_expr()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, FilterError> {
        if self.eat_keyword("NOT") {
            let operand = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Expr, FilterError> {
        let left = self.additive()?;

        let comparison = match self.peek().kind {
            TokenKind::Eq => Some(BinaryOp::Equal),
            TokenKind::Ne => Some(BinaryOp::NotEqual),
            TokenKind::Lt => Some(BinaryOp::Less),
            TokenKind::Gt => Some(BinaryOp::Greater),
            TokenKind::Le => Some(BinaryOp::LessOrEqual),
            TokenKind::Ge => Some(BinaryOp::GreaterOrEqual),
            _ => None,
        };
        if let Some(op) = comparison {
            self.advance();
            let right = self.additive()?;
            return Ok(binary(op, left, right));
        }

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Expr::IsNull {
                operand: Box::new(left),
                negated,
            });
        }

        let negated = if self.at_keyword("NOT")
            && (self.keyword_ahead(1, "LIKE") || self.keyword_ahead(1, "IN"))
        {
            self.advance();
            true
        } else {
            false
        };

        if self.eat_keyword("LIKE") {
            let pattern_position = self.peek().position;
            let pattern = self.string_literal("LIKE pattern")?;
            let escape = if self.eat_keyword("ESCAPE") {
                let escape_position = self.peek().position;
                let escape = self.string_literal("ESCAPE character")?;
                let mut chars = escape.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(c),
                    _ => {
                        return Err(syntax(
                            escape_position,
                            "ESCAPE must be a single character",
                        ))
                    }
                }
            } else {
                None
            };
            let pattern =
                compile_like(&pattern, escape).map_err(|message| syntax(pattern_position, message))?;
            return Ok(Expr::Like {
                operand: Box::new(left),
                pattern,
                negated,
            });
        }

        if self.eat_keyword("IN") {
            self.expect(TokenKind::LParen, "'(' after IN")?;
            let mut values = vec![self.literal_value()?];
            while self.peek().kind == TokenKind::Comma {
                self.advance();
                values.push(self.literal_value()?);
            }
            self.expect(TokenKind::RParen, "')' closing IN list")?;
            return Ok(Expr::In {
                operand: Box::new(left),
                values,
                negated,
            });
        }

        if negated {
            return Err(syntax(self.peek().position, "expected LIKE or IN after NOT"));
        }

        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Subtract,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Multiply,
                TokenKind::Slash => BinaryOp::Divide,
                TokenKind::Percent => BinaryOp::Modulo,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, FilterError> {
        match self.peek().kind {
            TokenKind::Minus => {
                self.advance();
                let operand = self.unary()?;
                Ok(match operand {
                    Expr::Literal(PropertyValue::Int(i)) => Expr::Literal(PropertyValue::Int(-i)),
                    Expr::Literal(PropertyValue::Float(f)) => Expr::Literal(PropertyValue::Float(-f)),
                    other => Expr::Unary {
                        op: UnaryOp::Negate,
                        operand: Box::new(other),
                    },
                })
            }
            TokenKind::Plus => {
                self.advance();
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, FilterError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Int(i) => {
                self.advance();
                Ok(Expr::Literal(PropertyValue::Int(i)))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(Expr::Literal(PropertyValue::Float(f)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Literal(PropertyValue::String(s)))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.or_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(ref word) if word.eq_ignore_ascii_case("TRUE") => {
                self.advance();
                Ok(Expr::Literal(PropertyValue::Bool(true)))
            }
            TokenKind::Ident(ref word) if word.eq_ignore_ascii_case("FALSE") => {
                self.advance();
                Ok(Expr::Literal(PropertyValue::Bool(false)))
            }
            TokenKind::Ident(ref word) if word.eq_ignore_ascii_case("NULL") => {
                self.advance();
                Ok(Expr::Literal(PropertyValue::Null))
            }
            TokenKind::Ident(ref word) if word.eq_ignore_ascii_case("EXISTS") => {
                self.advance();
                self.expect(TokenKind::LParen, "'(' after EXISTS")?;
                let property = self.property()?;
                self.expect(TokenKind::RParen, "')' closing EXISTS")?;
                Ok(Expr::Exists(property))
            }
            TokenKind::Ident(_) | TokenKind::QuotedIdent(_) => Ok(Expr::Property(self.property()?)),
            TokenKind::Eof => Err(syntax(token.position, "unexpected end of expression")),
            _ => Err(syntax(token.position, "expected a value or property")),
        }
    }

    fn property(&mut self) -> Result<PropertyRef, FilterError> {
        let token = self.advance();
        let (first, quoted) = match token.kind {
            TokenKind::Ident(name) => (name, false),
            TokenKind::QuotedIdent(name) => (name, true),
            _ => return Err(syntax(token.position, "expected a property name")),
        };

        if !quoted && RESERVED.iter().any(|kw| first.eq_ignore_ascii_case(kw)) {
            return Err(syntax(
                token.position,
                format!("reserved word '{}' cannot be used as a property name", first),
            ));
        }

        if self.peek().kind != TokenKind::Dot {
            return Ok(PropertyRef::User(first));
        }

        let qualifier = first.to_ascii_lowercase();
        if quoted || (qualifier != "sys" && qualifier != "user") {
            return Err(syntax(
                token.position,
                format!("unknown property scope '{}', expected sys or user", first),
            ));
        }
        self.advance();

        let name_token = self.advance();
        let name = match name_token.kind {
            TokenKind::Ident(name) | TokenKind::QuotedIdent(name) => name,
            _ => return Err(syntax(name_token.position, "expected a property name after '.'")),
        };

        if qualifier == "user" {
            return Ok(PropertyRef::User(name));
        }

        SystemProperty::from_name(&name)
            .map(PropertyRef::System)
            .ok_or_else(|| syntax(name_token.position, format!("unknown system property '{}'", name)))
    }

    fn string_literal(&mut self, description: &str) -> Result<String, FilterError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Str(s) => Ok(s),
            _ => Err(syntax(token.position, format!("expected string for {}", description))),
        }
    }

    fn literal_value(&mut self) -> Result<PropertyValue, FilterError> {
        let position = self.peek().position;
        match self.unary()? {
            Expr::Literal(value) => Ok(value),
            _ => Err(syntax(position, "IN list accepts literals only")),
        }
    }

    fn statement(&mut self) -> Result<Statement, FilterError> {
        if self.eat_keyword("SET") {
            let target_position = self.peek().position;
            let target = self.property()?;
            check_settable(&target, target_position)?;
            self.expect(TokenKind::Eq, "'=' in SET")?;
            let value = self.or_expr()?;
            return Ok(Statement::Set { target, value });
        }

        if self.eat_keyword("REMOVE") {
            let target_position = self.peek().position;
            let target = self.property()?;
            check_settable(&target, target_position)?;
            return Ok(Statement::Remove { target });
        }

        Err(syntax(self.peek().position, "expected SET or REMOVE"))
    }
}

fn check_settable(target: &PropertyRef, position: usize) -> Result<(), FilterError> {
    match target {
        PropertyRef::System(property) if !property.is_settable() => Err(syntax(
            position,
            format!("system property {:?} is read-only", property),
        )),
        _ => Ok(()),
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Parse a filter expression into an expression tree
pub(crate) fn parse_filter(source: &str) -> Result<Expr, FilterError> {
    if source.trim().is_empty() {
        return Err(syntax(0, "filter expression is empty"));
    }
    let mut parser = Parser::new(source)?;
    let expr = parser.or_expr()?;
    parser.expect_eof()?;
    Ok(expr)
}

/// Parse one or more `;`-separated action statements
pub(crate) fn parse_actions(source: &str) -> Result<Vec<Statement>, FilterError> {
    let mut parser = Parser::new(source)?;
    let mut statements = Vec::new();

    loop {
        if parser.peek().kind == TokenKind::Eof {
            break;
        }
        statements.push(parser.statement()?);
        if parser.peek().kind == TokenKind::Semicolon {
            parser.advance();
        } else {
            break;
        }
    }

    parser.expect_eof()?;
    if statements.is_empty() {
        return Err(syntax(0, "action contains no statements"));
    }
    Ok(statements)
}
