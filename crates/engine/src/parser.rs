//! DSL tokenizer and parser — run this before executing a flow.
//!
//! Grammar, loosest binding first (all binary operators left-associative,
//! parentheses override everything):
//!
//! ```text
//! expr     := cond ( ">>" cond )*
//! cond     := par ( ( "?" | "|" ) par )*
//! par      := loop ( "&" loop )*
//! loop     := operand ( "<" DIGITS ">" operand )*
//! operand  := IDENT | "(" expr ")"
//! IDENT    := [A-Za-z_][A-Za-z0-9_]*
//! ```
//!
//! Rules enforced:
//! 1. Parentheses must balance.
//! 2. Loop counts must be positive integers that fit in a `u32`.
//! 3. Every identifier must name a registered node.
//! 4. The whole input must reduce to exactly one expression.
//! 5. Parentheses and chained loops may nest at most [`MAX_NESTING`] deep.

use std::fmt;
use std::num::NonZeroU32;

use nodes::Registry;

use crate::expr::{self, prec, Expr};
use crate::{EngineError, ParseError};

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    /// `>>`
    Seq,
    /// `&`
    Par,
    /// `?`
    OnSuccess,
    /// `|`
    OnFailure,
    /// `<N>`
    Loop(NonZeroU32),
    Open,
    Close,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(name) => f.write_str(name),
            Self::Seq => f.write_str(">>"),
            Self::Par => f.write_str("&"),
            Self::OnSuccess => f.write_str("?"),
            Self::OnFailure => f.write_str("|"),
            Self::Loop(n) => write!(f, "<{n}>"),
            Self::Open => f.write_str("("),
            Self::Close => f.write_str(")"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token's first character.
    pub position: usize,
}

/// Split `text` into tokens. Whitespace separates tokens and is otherwise
/// ignored.
pub fn tokenize(text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((position, ch)) = chars.next() {
        let kind = match ch {
            c if c.is_whitespace() => continue,
            '(' => TokenKind::Open,
            ')' => TokenKind::Close,
            '&' => TokenKind::Par,
            '?' => TokenKind::OnSuccess,
            '|' => TokenKind::OnFailure,
            '>' => match chars.next_if(|&(_, c)| c == '>') {
                Some(_) => TokenKind::Seq,
                None => return Err(ParseError::UnexpectedCharacter { ch, position }),
            },
            '<' => {
                let mut count = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '>' {
                        closed = true;
                        break;
                    }
                    count.push(c);
                }
                if !closed {
                    return Err(ParseError::InvalidLoopCount {
                        text: format!("<{count}"),
                        position,
                    });
                }
                TokenKind::Loop(parse_loop_count(&count).ok_or_else(|| {
                    ParseError::InvalidLoopCount {
                        text: format!("<{count}>"),
                        position,
                    }
                })?)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::from(c);
                while let Some((_, c)) = chars.next_if(|&(_, c)| c.is_ascii_alphanumeric() || c == '_') {
                    name.push(c);
                }
                TokenKind::Ident(name)
            }
            _ => return Err(ParseError::UnexpectedCharacter { ch, position }),
        };
        tokens.push(Token { kind, position });
    }

    Ok(tokens)
}

fn parse_loop_count(digits: &str) -> Option<NonZeroU32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u32>().ok().and_then(NonZeroU32::new)
}

/// Report the first unbalanced parenthesis, if any.
fn check_balance(tokens: &[Token]) -> Result<(), ParseError> {
    let mut open: Vec<usize> = Vec::new();
    for token in tokens {
        match token.kind {
            TokenKind::Open => open.push(token.position),
            TokenKind::Close => {
                if open.pop().is_none() {
                    return Err(ParseError::UnmatchedClose { position: token.position });
                }
            }
            _ => {}
        }
    }
    match open.first() {
        Some(&position) => Err(ParseError::UnmatchedOpen { position }),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Deepest nesting of parentheses plus chained `<N>` loops accepted by
/// [`Parser::parse`].
pub const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Seq,
    Par,
    OnSuccess,
    OnFailure,
    Loop(NonZeroU32),
}

impl BinOp {
    fn from_token(kind: &TokenKind) -> Option<Self> {
        match kind {
            TokenKind::Seq => Some(Self::Seq),
            TokenKind::Par => Some(Self::Par),
            TokenKind::OnSuccess => Some(Self::OnSuccess),
            TokenKind::OnFailure => Some(Self::OnFailure),
            TokenKind::Loop(n) => Some(Self::Loop(*n)),
            _ => None,
        }
    }

    fn precedence(self) -> u8 {
        match self {
            Self::Seq => prec::SEQ,
            Self::OnSuccess | Self::OnFailure => prec::COND,
            Self::Par => prec::PAR,
            Self::Loop(_) => prec::LOOP,
        }
    }

    fn combine(self, left: Expr, right: Expr) -> Expr {
        match self {
            Self::Seq => expr::sequence(left, right),
            Self::Par => expr::parallel(left, right),
            Self::OnSuccess => expr::on_success(left, right),
            Self::OnFailure => expr::on_failure(left, right),
            Self::Loop(n) => expr::loop_until(left, right, n),
        }
    }
}

/// Compiles DSL text against a registry, resolving every leaf up front.
pub struct Parser<'r> {
    registry: &'r Registry,
}

impl<'r> Parser<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    /// Parse `text` into an expression tree.
    ///
    /// Tokenizing and the parenthesis balance check cover the whole input
    /// first. After that, identifiers are resolved as the parser reaches
    /// them, so an unknown name is reported ahead of any structural error
    /// later in the text: `missing >> >> a` yields `UnknownNode`, not
    /// `ExpectedOperand`.
    ///
    /// # Errors
    /// - [`EngineError::Parse`] for malformed text, including
    ///   [`ParseError::TooDeep`] past [`MAX_NESTING`].
    /// - [`EngineError::UnknownNode`] if an identifier is not registered.
    pub fn parse(&self, text: &str) -> Result<Expr, EngineError> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(ParseError::Empty.into());
        }
        check_balance(&tokens)?;

        let mut cursor = Cursor { tokens: &tokens, next: 0, depth: 0 };
        let expr = self.parse_binary(&mut cursor, prec::SEQ)?;

        match cursor.peek() {
            None => Ok(expr),
            Some(token) if token.kind == TokenKind::Close => {
                Err(ParseError::UnmatchedClose { position: token.position }.into())
            }
            Some(token) => Err(ParseError::TrailingInput {
                found: token.kind.to_string(),
                position: token.position,
            }
            .into()),
        }
    }

    /// Precedence climbing: fold operators binding at least `min_prec`.
    ///
    /// Loops can only chain directly after the first operand, and each one
    /// nests the tree a level deeper; any other operator ends the run.
    fn parse_binary(&self, cursor: &mut Cursor<'_>, min_prec: u8) -> Result<Expr, EngineError> {
        let base = cursor.depth;
        let mut left = self.parse_operand(cursor)?;

        while let Some(token) = cursor.peek() {
            let Some(op) = BinOp::from_token(&token.kind) else {
                break;
            };
            if op.precedence() < min_prec {
                break;
            }
            cursor.advance();
            match op {
                BinOp::Loop(_) => cursor.descend(token.position)?,
                _ => cursor.depth = base,
            }
            let right = self.parse_binary(cursor, op.precedence() + 1)?;
            left = op.combine(left, right);
        }

        cursor.depth = base;
        Ok(left)
    }

    fn parse_operand(&self, cursor: &mut Cursor<'_>) -> Result<Expr, EngineError> {
        let Some(token) = cursor.advance() else {
            return Err(ParseError::UnexpectedEnd.into());
        };

        match &token.kind {
            TokenKind::Ident(name) => match self.registry.resolve(name) {
                Some(node) => Ok(Expr::Leaf(node)),
                None => Err(EngineError::UnknownNode {
                    name: name.clone(),
                    registered: self.registry.names(),
                }),
            },
            TokenKind::Open => {
                cursor.descend(token.position)?;
                let inner = self.parse_binary(cursor, prec::SEQ)?;
                cursor.depth -= 1;
                match cursor.advance() {
                    Some(close) if close.kind == TokenKind::Close => Ok(expr::group(inner)),
                    Some(other) => Err(ParseError::TrailingInput {
                        found: other.kind.to_string(),
                        position: other.position,
                    }
                    .into()),
                    None => Err(ParseError::UnmatchedOpen { position: token.position }.into()),
                }
            }
            other => Err(ParseError::ExpectedOperand {
                found: other.to_string(),
                position: token.position,
            }
            .into()),
        }
    }
}

struct Cursor<'t> {
    tokens: &'t [Token],
    next: usize,
    /// Open parentheses plus chained loops above the current position.
    depth: usize,
}

impl<'t> Cursor<'t> {
    fn descend(&mut self, position: usize) -> Result<(), ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(ParseError::TooDeep {
                limit: MAX_NESTING,
                position,
            });
        }
        self.depth += 1;
        Ok(())
    }

    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.next)
    }

    fn advance(&mut self) -> Option<&'t Token> {
        let token = self.tokens.get(self.next)?;
        self.next += 1;
        Some(token)
    }
}
