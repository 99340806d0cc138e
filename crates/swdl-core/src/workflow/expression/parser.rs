//! Recursive-descent parser producing an [`Expr`] tree.
//!
//! Precedence, lowest first: ternary, `||`, `&&`, equality, relational,
//! unary `!`, primary.

use serde_json::Value;

use super::ExpressionError;
use super::lexer::{Spanned, Token, tokenize};

/// Deepest tree the parser builds. Evaluation and drop recurse on the tree,
/// so this also bounds their stack use.
pub const MAX_DEPTH: usize = 128;

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(PropertyPath),
    Call { function: Function, args: Vec<Expr> },
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }
}

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Length,
    Contains,
    ToJson,
    FromJson,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "length" => Some(Function::Length),
            "contains" => Some(Function::Contains),
            "toJSON" => Some(Function::ToJson),
            "fromJSON" => Some(Function::FromJson),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Length => "length",
            Function::Contains => "contains",
            Function::ToJson => "toJSON",
            Function::FromJson => "fromJSON",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Function::Contains => 2,
            _ => 1,
        }
    }
}

/// `root.seg.seg[0]['key']`. The root is checked against the namespace set
/// at evaluation time.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyPath {
    pub root: String,
    pub segments: Vec<PathSegment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parse an expression body (the text between `${{` and `}}`).
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.chars().count(),
        depth: 0,
    };
    let expr = parser.parse_ternary()?;
    if let Some(extra) = parser.peek_spanned() {
        return Err(ExpressionError::Syntax {
            position: extra.pos,
            message: format!("unexpected {} after expression", extra.token.describe()),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_spanned(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn current_pos(&self) -> usize {
        self.peek_spanned().map(|s| s.pos).unwrap_or(self.end)
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            position: self.current_pos(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        if self.eat(&expected) {
            return Ok(());
        }
        let found = self
            .peek()
            .map(Token::describe)
            .unwrap_or_else(|| "end of expression".to_string());
        Err(self.error(format!("expected {}, found {found}", expected.describe())))
    }

    /// Count one more level of nesting. Callers restore `depth` when the
    /// subtree is done; on error the parse is abandoned anyway.
    fn deepen(&mut self) -> Result<(), ExpressionError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn nested(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<Expr, ExpressionError>,
    ) -> Result<Expr, ExpressionError> {
        self.deepen()?;
        let expr = parse(self)?;
        self.depth -= 1;
        Ok(expr)
    }

    fn parse_ternary(&mut self) -> Result<Expr, ExpressionError> {
        let condition = self.parse_or()?;
        if !self.eat(&Token::Question) {
            return Ok(condition);
        }
        let then_branch = self.nested(Self::parse_ternary)?;
        self.expect(Token::Colon)?;
        let else_branch = self.nested(Self::parse_ternary)?;
        Ok(Expr::Ternary {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        })
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.depth;
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            self.deepen()?;
            let rhs = self.parse_and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        self.depth = base;
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.depth;
        let mut lhs = self.parse_equality()?;
        while self.eat(&Token::And) {
            self.deepen()?;
            let rhs = self.parse_equality()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        self.depth = base;
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.depth;
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::Ne) => BinaryOp::Ne,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.deepen()?;
            let rhs = self.parse_relational()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_relational(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.depth;
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.deepen()?;
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Not) {
            let inner = self.nested(Self::parse_unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let Some(spanned) = self.advance() else {
            return Err(self.error("unexpected end of expression"));
        };

        match spanned.token {
            Token::LParen => {
                let inner = self.nested(Self::parse_ternary)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    self.parse_call(&name, spanned.pos)
                } else {
                    self.parse_path(name)
                }
            }
            other => Err(ExpressionError::Syntax {
                position: spanned.pos,
                message: format!("unexpected {}", other.describe()),
            }),
        }
    }

    fn parse_call(&mut self, name: &str, pos: usize) -> Result<Expr, ExpressionError> {
        let function =
            Function::from_name(name).ok_or_else(|| ExpressionError::UnknownFunction {
                name: name.to_string(),
                position: pos,
            })?;
        self.expect(Token::LParen)?;

        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.nested(Self::parse_ternary)?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen)?;
                break;
            }
        }

        if args.len() != function.arity() {
            return Err(ExpressionError::BadArguments {
                function: function.name().to_string(),
                message: format!("expected {} argument(s), got {}", function.arity(), args.len()),
            });
        }
        Ok(Expr::Call { function, args })
    }

    fn parse_path(&mut self, root: String) -> Result<Expr, ExpressionError> {
        let mut segments = Vec::new();
        loop {
            if self.eat(&Token::Dot) {
                // Keywords are legal keys after a dot (`outputs.null`).
                let key = match self.peek() {
                    Some(Token::Ident(key)) => key.clone(),
                    Some(Token::True) => "true".to_string(),
                    Some(Token::False) => "false".to_string(),
                    Some(Token::Null) => "null".to_string(),
                    Some(Token::Number(n)) if n.is_u64() => n.to_string(),
                    _ => return Err(self.error("expected property name after '.'")),
                };
                self.pos += 1;
                segments.push(PathSegment::Key(key));
            } else if self.eat(&Token::LBracket) {
                let segment = match self.advance().map(|s| s.token) {
                    Some(Token::Str(key)) => PathSegment::Key(key),
                    Some(Token::Number(n)) => match n.as_u64() {
                        Some(idx) => PathSegment::Index(idx as usize),
                        None => return Err(self.error("index must be a non-negative integer")),
                    },
                    _ => return Err(self.error("expected string or integer index")),
                };
                self.expect(Token::RBracket)?;
                segments.push(segment);
            } else {
                return Ok(Expr::Path(PropertyPath { root, segments }));
            }
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}
