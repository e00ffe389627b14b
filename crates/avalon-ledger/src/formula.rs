//! Sandboxed arithmetic for dynamic resource caps.
//!
//! A cap formula is a single integer expression evaluated against two
//! read-only tables: completed-building counts (`buildings`, keyed by the
//! lower-cased building name) and current resource amounts (`resources`,
//! keyed by the exact resource name). Formulas are compiled once when the
//! catalog loads and evaluated every time building counts change.
//!
//! # Grammar
//!
//! ```text
//! formula := ["return"] expr
//! expr    := term (("+" | "-") term)*
//! term    := unary (("*" | "/" | "//" | "%") unary)*
//! unary   := "-" unary | primary
//! primary := INT | "(" expr ")" | lookup | call
//! lookup  := ("buildings" | "resources") ("." IDENT | "[" STRING "]")
//! call    := ("min" | "max" | "math.min" | "math.max") "(" expr ("," expr)* ")"
//! ```
//!
//! All arithmetic is checked `i64`; division is floor division. A key
//! missing from its table evaluates to zero. Formulas are limited to
//! [`MAX_TOKENS`] tokens and [`MAX_DEPTH`] levels of nesting.

use std::collections::BTreeMap;

/// Most tokens a formula may contain.
pub const MAX_TOKENS: usize = 1024;

/// Deepest nesting of parentheses, calls and negations.
pub const MAX_DEPTH: usize = 64;

/// Errors raised while compiling or evaluating a cap formula.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormulaError {
    /// A character that cannot start any token.
    #[error("unexpected character '{found}' at offset {offset}")]
    UnexpectedChar {
        /// The offending character.
        found: char,
        /// Byte offset in the source.
        offset: usize,
    },

    /// A token that does not fit the grammar at this position.
    #[error("unexpected token '{found}', expected {expected}")]
    UnexpectedToken {
        /// Rendering of the token found.
        found: String,
        /// What the parser was looking for.
        expected: &'static str,
    },

    /// The formula ended early.
    #[error("unexpected end of formula, expected {expected}")]
    UnexpectedEnd {
        /// What the parser was looking for.
        expected: &'static str,
    },

    /// A table other than `buildings` or `resources`.
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    /// A function other than `min` or `max`.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// Integer literal or input does not fit in `i64`.
    #[error("arithmetic overflow")]
    Overflow,

    /// Division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// More than [`MAX_TOKENS`] tokens.
    #[error("formula too long, at most {limit} tokens")]
    TooLong {
        /// The token limit.
        limit: usize,
    },

    /// Nested deeper than [`MAX_DEPTH`].
    #[error("formula nested too deeply, at most {limit} levels")]
    TooDeep {
        /// The nesting limit.
        limit: usize,
    },
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// The two tables a formula can read.
#[derive(Debug, Clone, Copy)]
pub struct FormulaInputs<'a> {
    /// Completed instances per lower-cased building name.
    pub buildings: &'a BTreeMap<String, u64>,
    /// Current amount per resource name.
    pub resources: &'a BTreeMap<String, u64>,
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Buildings,
    Resources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Literal(i64),
    Lookup { table: Table, key: String },
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call { func: Func, args: Vec<Expr> },
}

/// A compiled cap formula.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapFormula {
    source: String,
    root: Expr,
}

impl CapFormula {
    /// Compile a formula.
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        if matches!(parser.peek(), Some(Token::Ident(word)) if word == "return") {
            parser.pos = parser.pos.saturating_add(1);
        }
        let root = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(FormulaError::UnexpectedToken {
                found: token.to_string(),
                expected: "end of formula",
            });
        }
        Ok(Self {
            source: source.to_owned(),
            root,
        })
    }

    /// The original formula text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate the formula.
    pub fn evaluate(&self, inputs: FormulaInputs<'_>) -> Result<i64, FormulaError> {
        eval(&self.root, inputs)
    }
}

fn eval(expr: &Expr, inputs: FormulaInputs<'_>) -> Result<i64, FormulaError> {
    match expr {
        Expr::Literal(value) => Ok(*value),
        Expr::Lookup { table, key } => {
            let map = match table {
                Table::Buildings => inputs.buildings,
                Table::Resources => inputs.resources,
            };
            let raw = map.get(key).copied().unwrap_or(0);
            i64::try_from(raw).map_err(|_overflow| FormulaError::Overflow)
        }
        Expr::Neg(inner) => eval(inner, inputs)?
            .checked_neg()
            .ok_or(FormulaError::Overflow),
        Expr::Binary { op, lhs, rhs } => {
            let a = eval(lhs, inputs)?;
            let b = eval(rhs, inputs)?;
            match op {
                BinaryOp::Add => a.checked_add(b).ok_or(FormulaError::Overflow),
                BinaryOp::Sub => a.checked_sub(b).ok_or(FormulaError::Overflow),
                BinaryOp::Mul => a.checked_mul(b).ok_or(FormulaError::Overflow),
                BinaryOp::Div => {
                    if b == 0 {
                        return Err(FormulaError::DivisionByZero);
                    }
                    floor_div(a, b)
                }
                BinaryOp::Rem => {
                    if b == 0 {
                        return Err(FormulaError::DivisionByZero);
                    }
                    let q = floor_div(a, b)?;
                    q.checked_mul(b)
                        .and_then(|p| a.checked_sub(p))
                        .ok_or(FormulaError::Overflow)
                }
            }
        }
        Expr::Call { func, args } => {
            let mut best: Option<i64> = None;
            for arg in args {
                let value = eval(arg, inputs)?;
                best = Some(match (best, func) {
                    (None, _) => value,
                    (Some(current), Func::Min) => current.min(value),
                    (Some(current), Func::Max) => current.max(value),
                });
            }
            best.ok_or(FormulaError::UnexpectedEnd {
                expected: "function argument",
            })
        }
    }
}

fn floor_div(a: i64, b: i64) -> Result<i64, FormulaError> {
    let q = a.checked_div(b).ok_or(FormulaError::Overflow)?;
    let r = a.checked_rem(b).ok_or(FormulaError::Overflow)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        q.checked_sub(1).ok_or(FormulaError::Overflow)
    } else {
        Ok(q)
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Int(i64),
    Ident(String),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

impl core::fmt::Display for Token {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Ident(s) => f.write_str(s),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::Plus => f.write_str("+"),
            Self::Minus => f.write_str("-"),
            Self::Star => f.write_str("*"),
            Self::Slash => f.write_str("/"),
            Self::Percent => f.write_str("%"),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
            Self::LBracket => f.write_str("["),
            Self::RBracket => f.write_str("]"),
            Self::Comma => f.write_str(","),
            Self::Dot => f.write_str("."),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c.is_ascii_digit() {
            let mut value: i64 = 0;
            while let Some(&(_, d)) = chars.peek() {
                let Some(digit) = d.to_digit(10) else { break };
                value = value
                    .checked_mul(10)
                    .and_then(|v| v.checked_add(i64::from(digit)))
                    .ok_or(FormulaError::Overflow)?;
                chars.next();
            }
            push(&mut tokens, Token::Int(value))?;
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let mut word = String::new();
            while let Some(&(_, w)) = chars.peek() {
                if !(w.is_alphanumeric() || w == '_') {
                    break;
                }
                word.push(w);
                chars.next();
            }
            push(&mut tokens, Token::Ident(word))?;
            continue;
        }
        if c == '"' || c == '\'' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            for (_, s) in chars.by_ref() {
                if s == c {
                    closed = true;
                    break;
                }
                text.push(s);
            }
            if !closed {
                return Err(FormulaError::UnexpectedEnd {
                    expected: "closing quote",
                });
            }
            push(&mut tokens, Token::Str(text))?;
            continue;
        }
        let token = match c {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            '.' => Token::Dot,
            other => {
                return Err(FormulaError::UnexpectedChar {
                    found: other,
                    offset,
                });
            }
        };
        chars.next();
        // `//` is floor division, same as `/` on integers.
        if token == Token::Slash && matches!(chars.peek(), Some(&(_, '/'))) {
            chars.next();
        }
        push(&mut tokens, token)?;
    }

    Ok(tokens)
}

fn push(tokens: &mut Vec<Token>, token: Token) -> Result<(), FormulaError> {
    if tokens.len() >= MAX_TOKENS {
        return Err(FormulaError::TooLong { limit: MAX_TOKENS });
    }
    tokens.push(token);
    Ok(())
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos = self.pos.saturating_add(1);
        }
        token
    }

    fn expect(&mut self, want: &Token, expected: &'static str) -> Result<(), FormulaError> {
        match self.next() {
            Some(ref token) if token == want => Ok(()),
            Some(token) => Err(FormulaError::UnexpectedToken {
                found: token.to_string(),
                expected,
            }),
            None => Err(FormulaError::UnexpectedEnd { expected }),
        }
    }

    fn ident(&mut self, expected: &'static str) -> Result<String, FormulaError> {
        match self.next() {
            Some(Token::Ident(word)) => Ok(word),
            Some(token) => Err(FormulaError::UnexpectedToken {
                found: token.to_string(),
                expected,
            }),
            None => Err(FormulaError::UnexpectedEnd { expected }),
        }
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.next();
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.next();
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    /// Every nested sub-expression passes through here.
    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if self.depth >= MAX_DEPTH {
            return Err(FormulaError::TooDeep { limit: MAX_DEPTH });
        }
        self.depth = self.depth.saturating_add(1);
        let result = if self.peek() == Some(&Token::Minus) {
            self.next();
            self.unary().map(|inner| Expr::Neg(Box::new(inner)))
        } else {
            self.primary()
        };
        self.depth = self.depth.saturating_sub(1);
        result
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some(Token::Int(value)) => Ok(Expr::Literal(value)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(word)) => self.named(word),
            Some(token) => Err(FormulaError::UnexpectedToken {
                found: token.to_string(),
                expected: "number, lookup or call",
            }),
            None => Err(FormulaError::UnexpectedEnd {
                expected: "number, lookup or call",
            }),
        }
    }

    fn named(&mut self, word: String) -> Result<Expr, FormulaError> {
        let mut name = word;
        if name == "math" {
            self.expect(&Token::Dot, "'.'")?;
            let member = self.ident("function name")?;
            name = format!("math.{member}");
        }

        match name.as_str() {
            "buildings" | "resources" => {
                let table = if name == "buildings" {
                    Table::Buildings
                } else {
                    Table::Resources
                };
                let key = self.lookup_key()?;
                let key = match table {
                    Table::Buildings => key.to_lowercase(),
                    Table::Resources => key,
                };
                Ok(Expr::Lookup { table, key })
            }
            "min" | "math.min" | "max" | "math.max" => {
                let func = if name.ends_with("min") {
                    Func::Min
                } else {
                    Func::Max
                };
                self.expect(&Token::LParen, "'('")?;
                let mut args = vec![self.expr()?];
                while self.peek() == Some(&Token::Comma) {
                    self.next();
                    args.push(self.expr()?);
                }
                self.expect(&Token::RParen, "')'")?;
                Ok(Expr::Call { func, args })
            }
            _ => {
                if self.peek() == Some(&Token::LParen) {
                    Err(FormulaError::UnknownFunction(name))
                } else {
                    Err(FormulaError::UnknownTable(name))
                }
            }
        }
    }

    fn lookup_key(&mut self) -> Result<String, FormulaError> {
        match self.next() {
            Some(Token::Dot) => self.ident("table key"),
            Some(Token::LBracket) => {
                let key = match self.next() {
                    Some(Token::Str(key)) => key,
                    Some(token) => {
                        return Err(FormulaError::UnexpectedToken {
                            found: token.to_string(),
                            expected: "quoted table key",
                        });
                    }
                    None => {
                        return Err(FormulaError::UnexpectedEnd {
                            expected: "quoted table key",
                        });
                    }
                };
                self.expect(&Token::RBracket, "']'")?;
                Ok(key)
            }
            Some(token) => Err(FormulaError::UnexpectedToken {
                found: token.to_string(),
                expected: "'.' or '['",
            }),
            None => Err(FormulaError::UnexpectedEnd {
                expected: "'.' or '['",
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tables() -> (BTreeMap<String, u64>, BTreeMap<String, u64>) {
        let buildings = BTreeMap::from([("house".to_owned(), 3), ("warehouse".to_owned(), 2)]);
        let resources = BTreeMap::from([("Wood".to_owned(), 40), ("Stone".to_owned(), 7)]);
        (buildings, resources)
    }

    fn eval_str(source: &str) -> Result<i64, FormulaError> {
        let (buildings, resources) = tables();
        let formula = CapFormula::parse(source)?;
        formula.evaluate(FormulaInputs {
            buildings: &buildings,
            resources: &resources,
        })
    }

    #[test]
    fn evaluates_precedence_and_parentheses() {
        assert_eq!(eval_str("2 + 3 * 4").unwrap(), 14);
        assert_eq!(eval_str("(2 + 3) * 4").unwrap(), 20);
        assert_eq!(eval_str("-2 * -3").unwrap(), 6);
        assert_eq!(eval_str("10 - 4 - 3").unwrap(), 3);
    }

    #[test]
    fn reads_both_tables() {
        assert_eq!(eval_str("return buildings.house * 10 + 5").unwrap(), 35);
        assert_eq!(eval_str("buildings[\"Warehouse\"] * 100").unwrap(), 200);
        assert_eq!(eval_str("resources.Wood + resources['Stone']").unwrap(), 47);
    }

    #[test]
    fn missing_key_is_zero() {
        assert_eq!(eval_str("buildings.castle * 50 + 1").unwrap(), 1);
        assert_eq!(eval_str("resources.Gold").unwrap(), 0);
    }

    #[test]
    fn min_max_and_floor_division() {
        assert_eq!(eval_str("max(buildings.house, 10)").unwrap(), 10);
        assert_eq!(eval_str("math.min(5, resources.Stone, 9)").unwrap(), 5);
        assert_eq!(eval_str("7 / 2").unwrap(), 3);
        assert_eq!(eval_str("-7 // 2").unwrap(), -4);
        assert_eq!(eval_str("-7 % 3").unwrap(), 2);
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(eval_str("1 / 0"), Err(FormulaError::DivisionByZero));
        assert_eq!(
            eval_str("resources.Wood % buildings.castle"),
            Err(FormulaError::DivisionByZero)
        );
    }

    #[test]
    fn rejects_malformed_formulas() {
        assert!(matches!(
            CapFormula::parse("1 +"),
            Err(FormulaError::UnexpectedEnd { .. })
        ));
        assert!(matches!(
            CapFormula::parse("1 2"),
            Err(FormulaError::UnexpectedToken { .. })
        ));
        assert_eq!(
            CapFormula::parse("workers.house"),
            Err(FormulaError::UnknownTable("workers".to_owned()))
        );
        assert_eq!(
            CapFormula::parse("sqrt(4)"),
            Err(FormulaError::UnknownFunction("sqrt".to_owned()))
        );
        assert!(matches!(
            CapFormula::parse("1 ^ 2"),
            Err(FormulaError::UnexpectedChar { found: '^', .. })
        ));
    }

    #[test]
    fn overflow_is_detected() {
        assert_eq!(
            eval_str("9223372036854775807 + 1"),
            Err(FormulaError::Overflow)
        );
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let nested = format!("{}1{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert_eq!(
            CapFormula::parse(&nested),
            Err(FormulaError::TooDeep { limit: MAX_DEPTH })
        );
        assert_eq!(
            CapFormula::parse(&format!("{}1", "-".repeat(500))),
            Err(FormulaError::TooDeep { limit: MAX_DEPTH })
        );

        let shallow = format!("{}1{}", "(".repeat(10), ")".repeat(10));
        assert_eq!(eval_str(&shallow).unwrap(), 1);
        assert_eq!(eval_str("min(max(1, (2)), -(-3))").unwrap(), 1);
    }

    #[test]
    fn long_formulas_are_rejected() {
        let long = vec!["1"; MAX_TOKENS].join("+");
        assert_eq!(
            CapFormula::parse(&long),
            Err(FormulaError::TooLong { limit: MAX_TOKENS })
        );

        let fits = vec!["1"; 100].join("+");
        assert_eq!(eval_str(&fits).unwrap(), 100);
    }
}
