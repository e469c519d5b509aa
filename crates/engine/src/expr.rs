//! The expression tree a DSL string compiles to.
//!
//! Trees are immutable once built and hold resolved `Arc<Node>` leaves, so a
//! single cached tree can be evaluated by many runs at once. Trees can also
//! be built in code with the builder functions or the infix operators:
//!
//! | DSL       | Builder                 | Operator |
//! |-----------|-------------------------|----------|
//! | `a >> b`  | [`sequence`]            | `a >> b` |
//! | `a & b`   | [`parallel`]            | `a & b`  |
//! | `a ? b`   | [`on_success`]          | `a ^ b`  |
//! | `a \| b`  | [`on_failure`]          | `a \| b` |
//! | `a <n> b` | [`loop_until`]          | —        |
//! | `(a)`     | [`group`]               | —        |

use std::fmt;
use std::num::NonZeroU32;
use std::ops::{BitAnd, BitOr, BitXor, Shr};
use std::sync::Arc;

use nodes::Node;

#[derive(Debug, Clone)]
pub enum Expr {
    Leaf(Arc<Node>),
    /// Run left, then right; the result is the right's.
    Seq(Box<Expr>, Box<Expr>),
    /// Run both concurrently; the result is the AND of both.
    Par(Box<Expr>, Box<Expr>),
    /// Run right only if left returned `true`.
    CondSuccess(Box<Expr>, Box<Expr>),
    /// Run right only if left returned `false`.
    CondFail(Box<Expr>, Box<Expr>),
    /// Alternate left and right until right returns `true`, at most n rounds.
    Loop(Box<Expr>, Box<Expr>, NonZeroU32),
    Group(Box<Expr>),
}

// ---------------------------------------------------------------------------
// Precedence
// ---------------------------------------------------------------------------

/// Binding strength of the binary operators, loosest first.
pub(crate) mod prec {
    pub const SEQ: u8 = 1;
    pub const COND: u8 = 2;
    pub const PAR: u8 = 3;
    pub const LOOP: u8 = 4;
    pub const ATOM: u8 = u8::MAX;
}

impl Expr {
    pub fn leaf(node: Arc<Node>) -> Self {
        Self::Leaf(node)
    }

    fn precedence(&self) -> u8 {
        match self {
            Self::Seq(..) => prec::SEQ,
            Self::CondSuccess(..) | Self::CondFail(..) => prec::COND,
            Self::Par(..) => prec::PAR,
            Self::Loop(..) => prec::LOOP,
            Self::Leaf(_) | Self::Group(_) => prec::ATOM,
        }
    }

    /// Number of leaves, counting repeated references.
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Group(inner) => inner.leaf_count(),
            Self::Seq(l, r)
            | Self::Par(l, r)
            | Self::CondSuccess(l, r)
            | Self::CondFail(l, r)
            | Self::Loop(l, r, _) => l.leaf_count() + r.leaf_count(),
        }
    }

    /// Names of the referenced nodes, left to right.
    pub fn node_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Leaf(node) => out.push(node.name()),
            Self::Group(inner) => inner.collect_names(out),
            Self::Seq(l, r)
            | Self::Par(l, r)
            | Self::CondSuccess(l, r)
            | Self::CondFail(l, r)
            | Self::Loop(l, r, _) => {
                l.collect_names(out);
                r.collect_names(out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn sequence(left: Expr, right: Expr) -> Expr {
    Expr::Seq(Box::new(left), Box::new(right))
}

pub fn parallel(left: Expr, right: Expr) -> Expr {
    Expr::Par(Box::new(left), Box::new(right))
}

pub fn on_success(left: Expr, right: Expr) -> Expr {
    Expr::CondSuccess(Box::new(left), Box::new(right))
}

pub fn on_failure(left: Expr, right: Expr) -> Expr {
    Expr::CondFail(Box::new(left), Box::new(right))
}

pub fn loop_until(body: Expr, until: Expr, max_iterations: NonZeroU32) -> Expr {
    Expr::Loop(Box::new(body), Box::new(until), max_iterations)
}

pub fn group(inner: Expr) -> Expr {
    Expr::Group(Box::new(inner))
}

impl From<Arc<Node>> for Expr {
    fn from(node: Arc<Node>) -> Self {
        Self::Leaf(node)
    }
}

impl Shr for Expr {
    type Output = Expr;

    fn shr(self, rhs: Expr) -> Expr {
        sequence(self, rhs)
    }
}

impl BitAnd for Expr {
    type Output = Expr;

    fn bitand(self, rhs: Expr) -> Expr {
        parallel(self, rhs)
    }
}

impl BitXor for Expr {
    type Output = Expr;

    fn bitxor(self, rhs: Expr) -> Expr {
        on_success(self, rhs)
    }
}

impl BitOr for Expr {
    type Output = Expr;

    fn bitor(self, rhs: Expr) -> Expr {
        on_failure(self, rhs)
    }
}

// ---------------------------------------------------------------------------
// Structural equality
// ---------------------------------------------------------------------------

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Leaf(a), Self::Leaf(b)) => a.name() == b.name(),
            (Self::Seq(a1, a2), Self::Seq(b1, b2))
            | (Self::Par(a1, a2), Self::Par(b1, b2))
            | (Self::CondSuccess(a1, a2), Self::CondSuccess(b1, b2))
            | (Self::CondFail(a1, a2), Self::CondFail(b1, b2)) => a1 == b1 && a2 == b2,
            (Self::Loop(a1, a2, n), Self::Loop(b1, b2, m)) => n == m && a1 == b1 && a2 == b2,
            (Self::Group(a), Self::Group(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Expr {}

// ---------------------------------------------------------------------------
// DSL rendering
// ---------------------------------------------------------------------------

/// Renders DSL text that parses back to an equivalent tree. Parentheses are
/// added where a child binds looser than its parent (or equally, on the
/// right, since every operator is left-associative).
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (left, op, right) = match self {
            Self::Leaf(node) => return f.write_str(node.name()),
            Self::Group(inner) => return write!(f, "({inner})"),
            Self::Seq(l, r) => (l, ">>".to_string(), r),
            Self::Par(l, r) => (l, "&".to_string(), r),
            Self::CondSuccess(l, r) => (l, "?".to_string(), r),
            Self::CondFail(l, r) => (l, "|".to_string(), r),
            Self::Loop(l, r, n) => (l, format!("<{n}>"), r),
        };

        let own = self.precedence();
        write_operand(f, left, left.precedence() < own)?;
        write!(f, " {op} ")?;
        write_operand(f, right, right.precedence() <= own)
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr, parenthesize: bool) -> fmt::Result {
    if parenthesize {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}
