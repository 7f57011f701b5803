//! Recursive-descent parser producing an [`Expr`] tree.
//!
//! Precedence, loosest first: `?:`, `||`, `&&`, `== !=`, `< <= > >= in`,
//! `+ -`, unary `! -`, then member access, indexing and calls.

use serde_json::Value;

use super::lexer::{Token, TokenKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Identifier(String),
    List(Vec<Expr>),
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Ternary { condition: Box<Expr>, then: Box<Expr>, otherwise: Box<Expr> },
    Member { object: Box<Expr>, property: String },
    Index { object: Box<Expr>, index: Box<Expr> },
    Call { function: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("expected {expected} at {pos}, found '{found}'")]
pub struct ParseError {
    pub expected: &'static str,
    pub found: String,
    pub pos: usize,
}

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0 }
    }

    pub fn parse(mut self) -> Result<Expr, ParseError> {
        let expr = self.ternary()?;
        self.expect(TokenKind::Eof, "end of expression")?;
        Ok(expr)
    }

    fn ternary(&mut self) -> Result<Expr, ParseError> {
        let condition = self.or()?;
        if !self.eat(TokenKind::Question) {
            return Ok(condition);
        }
        let then = self.ternary()?;
        self.expect(TokenKind::Colon, "':'")?;
        let otherwise = self.ternary()?;
        Ok(Expr::Ternary {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.and()?;
        while self.eat(TokenKind::OrOr) {
            let right = self.and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.equality()?;
        while self.eat(TokenKind::AndAnd) {
            let right = self.equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.comparison()?;
            left = binary(op, left, right);
        }
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                TokenKind::In => BinaryOp::In,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.additive()?;
            left = binary(op, left, right);
        }
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek().kind {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Negate,
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.unary()?;
        Ok(Expr::Unary { op, operand: Box::new(operand) })
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(TokenKind::Dot) {
                let property = self.expect(TokenKind::Identifier, "member name")?.lexeme;
                if self.eat(TokenKind::LParen) {
                    // receiver-style call: `a.f(b)` is `f(a, b)`
                    let mut args = vec![expr];
                    args.extend(self.arguments(TokenKind::RParen, "')'")?);
                    expr = Expr::Call { function: property, args };
                } else {
                    expr = Expr::Member { object: Box::new(expr), property };
                }
            } else if self.eat(TokenKind::LBracket) {
                let index = self.ternary()?;
                self.expect(TokenKind::RBracket, "']'")?;
                expr = Expr::Index { object: Box::new(expr), index: Box::new(index) };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::String => Ok(Expr::Literal(Value::String(token.lexeme))),
            TokenKind::Number => number_literal(&token),
            TokenKind::Identifier => {
                if self.eat(TokenKind::LParen) {
                    let args = self.arguments(TokenKind::RParen, "')'")?;
                    Ok(Expr::Call { function: token.lexeme, args })
                } else {
                    Ok(Expr::Identifier(token.lexeme))
                }
            }
            TokenKind::LParen => {
                let expr = self.ternary()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            TokenKind::LBracket => Ok(Expr::List(self.arguments(TokenKind::RBracket, "']'")?)),
            _ => Err(ParseError { expected: "expression", found: token.lexeme, pos: token.pos }),
        }
    }

    fn arguments(&mut self, close: TokenKind, label: &'static str) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.ternary()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(TokenKind::Comma, label)?;
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.current += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<Token, ParseError> {
        let token = self.peek().clone();
        if token.kind == kind {
            self.advance();
            Ok(token)
        } else {
            Err(ParseError { expected, found: token.lexeme, pos: token.pos })
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
}

fn number_literal(token: &Token) -> Result<Expr, ParseError> {
    let invalid = || ParseError { expected: "number", found: token.lexeme.clone(), pos: token.pos };
    if let Ok(int) = token.lexeme.parse::<i64>() {
        return Ok(Expr::Literal(Value::from(int)));
    }
    let float: f64 = token.lexeme.parse().map_err(|_| invalid())?;
    serde_json::Number::from_f64(float)
        .map(|n| Expr::Literal(Value::Number(n)))
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::lexer::tokenize;

    fn parse(src: &str) -> Result<Expr, ParseError> {
        Parser::new(tokenize(src).unwrap()).parse()
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("a || b && c").unwrap();
        let Expr::Binary { op: BinaryOp::Or, right, .. } = expr else {
            panic!("expected top-level or");
        };
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::And, .. }));
    }

    #[test]
    fn parses_member_chains_and_calls() {
        let free = parse("startsWith(push.ref, 'refs/tags/')").unwrap();
        let receiver = parse("push.ref.startsWith('refs/tags/')").unwrap();
        assert_eq!(free, receiver);
        assert!(matches!(free, Expr::Call { ref function, ref args } if function == "startsWith" && args.len() == 2));

        let indexed = parse("commits[0].author").unwrap();
        assert!(matches!(indexed, Expr::Member { ref property, .. } if property == "author"));
    }

    #[test]
    fn reports_dangling_operators() {
        assert!(parse("a ==").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a ? b").is_err());
    }
}
