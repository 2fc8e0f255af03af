//! Placement-constraint expressions.
//!
//! Grammar:
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | primary
//! primary := "(" or ")" | operand ( cmp operand )?
//! cmp     := "==" | "!=" | "<" | "<=" | ">" | ">="
//! ```
//!
//! Operands are bare words or quoted strings. A bare word names a node
//! property (or one of the built-ins `NodeName`, `FaultDomain`,
//! `UpgradeDomain`) when the node defines it, and is a literal otherwise.
//! Comparisons are numeric when both sides parse as numbers.

use std::cmp::Ordering;

use thiserror::Error;

use plb_model::NodeView;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("unexpected token {token:?} at offset {offset}")]
    UnexpectedToken { token: String, offset: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Word(String),
    Quoted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// The empty expression; matches every node.
    True,
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CompareOp, Operand),
    /// A lone operand: true when it resolves to `true`.
    Truthy(Operand),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Cmp(CompareOp),
    Word(String),
    Quoted(String),
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let (token, width) = match (c, next) {
            (c, _) if c.is_whitespace() => {
                i += 1;
                continue;
            }
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('=', Some('=')) => (Token::Cmp(CompareOp::Eq), 2),
            ('!', Some('=')) => (Token::Cmp(CompareOp::Ne), 2),
            ('<', Some('=')) => (Token::Cmp(CompareOp::Le), 2),
            ('>', Some('=')) => (Token::Cmp(CompareOp::Ge), 2),
            ('<', _) => (Token::Cmp(CompareOp::Lt), 1),
            ('>', _) => (Token::Cmp(CompareOp::Gt), 1),
            ('!', _) => (Token::Not, 1),
            ('"' | '\'', _) => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|(_, ch)| *ch == c)
                    .ok_or(ExpressionError::UnterminatedString(offset))?;
                let text: String = chars[i + 1..i + 1 + end].iter().map(|(_, ch)| *ch).collect();
                tokens.push((Token::Quoted(text), offset));
                i += end + 2;
                continue;
            }
            _ => {
                let len = chars[i..]
                    .iter()
                    .take_while(|(_, ch)| !ch.is_whitespace() && !"()&|=!<>\"'".contains(*ch))
                    .count();
                if len == 0 {
                    return Err(ExpressionError::UnexpectedToken {
                        token: c.to_string(),
                        offset,
                    });
                }
                let word: String = chars[i..i + len].iter().map(|(_, ch)| *ch).collect();
                (Token::Word(word), len)
            }
        };
        tokens.push((token, offset));
        i += width;
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn bump(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn unexpected(&self) -> ExpressionError {
        match self.tokens.get(self.pos) {
            Some((token, offset)) => ExpressionError::UnexpectedToken {
                token: format!("{token:?}"),
                offset: *offset,
            },
            None => ExpressionError::UnexpectedEnd,
        }
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            lhs = Expr::And(Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or()?;
            if self.peek() != Some(&Token::RParen) {
                return Err(self.unexpected());
            }
            self.pos += 1;
            return Ok(inner);
        }
        let lhs = self.operand()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.operand()?;
            return Ok(Expr::Compare(lhs, op, rhs));
        }
        Ok(Expr::Truthy(lhs))
    }

    fn operand(&mut self) -> Result<Operand, ExpressionError> {
        match self.peek() {
            Some(Token::Word(_)) | Some(Token::Quoted(_)) => {}
            _ => return Err(self.unexpected()),
        }
        match self.bump() {
            Some((Token::Word(w), _)) => Ok(Operand::Word(w)),
            Some((Token::Quoted(q), _)) => Ok(Operand::Quoted(q)),
            _ => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

impl Expr {
    pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(Expr::True);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.unexpected());
        }
        Ok(expr)
    }

    pub fn matches(&self, node: &NodeView) -> bool {
        match self {
            Expr::True => true,
            Expr::Or(a, b) => a.matches(node) || b.matches(node),
            Expr::And(a, b) => a.matches(node) && b.matches(node),
            Expr::Not(inner) => !inner.matches(node),
            Expr::Truthy(operand) => resolve(operand, node).eq_ignore_ascii_case("true"),
            Expr::Compare(lhs, op, rhs) => {
                let l = resolve(lhs, node);
                let r = resolve(rhs, node);
                let ordering = match (l.parse::<f64>(), r.parse::<f64>()) {
                    (Ok(a), Ok(b)) => a.partial_cmp(&b),
                    _ => Some(l.cmp(r)),
                };
                let Some(ordering) = ordering else {
                    return false;
                };
                match op {
                    CompareOp::Eq => ordering == Ordering::Equal,
                    CompareOp::Ne => ordering != Ordering::Equal,
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::Le => ordering != Ordering::Greater,
                    CompareOp::Gt => ordering == Ordering::Greater,
                    CompareOp::Ge => ordering != Ordering::Less,
                }
            }
        }
    }
}

fn resolve<'n>(operand: &'n Operand, node: &'n NodeView) -> &'n str {
    match operand {
        Operand::Quoted(text) => text,
        Operand::Word(word) => match word.as_str() {
            "NodeName" => &node.id,
            "FaultDomain" => &node.fault_domain,
            "UpgradeDomain" => &node.upgrade_domain,
            _ => node.properties.get(word).map_or(word.as_str(), String::as_str),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;

    fn node(id: &str, props: &[(&str, &str)]) -> NodeView {
        NodeView {
            id: id.into(),
            fault_domain: "fd:/dc1/r1".into(),
            upgrade_domain: "UD1".into(),
            properties: props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            capacities: BTreeMap::new(),
            is_up: true,
            deactivation: None,
            images: BTreeSet::new(),
        }
    }

    #[test]
    fn empty_expression_matches_everything() {
        assert_eq!(Expr::parse("   ").unwrap(), Expr::True);
        assert!(Expr::True.matches(&node("N1", &[])));
    }

    #[test]
    fn property_comparison() {
        let n = node("N1", &[("NodeType", "FrontEnd"), ("Disk", "120")]);
        assert!(Expr::parse("NodeType == FrontEnd").unwrap().matches(&n));
        assert!(!Expr::parse("NodeType != FrontEnd").unwrap().matches(&n));
        assert!(Expr::parse("Disk >= 100 && Disk < 200").unwrap().matches(&n));
        // Numeric, not lexical: "120" > "9".
        assert!(Expr::parse("Disk > 9").unwrap().matches(&n));
    }

    #[test]
    fn builtins_and_precedence() {
        let n = node("N7", &[]);
        assert!(Expr::parse("NodeName == N7").unwrap().matches(&n));
        assert!(Expr::parse("FaultDomain == \"fd:/dc1/r1\"").unwrap().matches(&n));
        // && binds tighter than ||.
        let e = Expr::parse("NodeName == N1 || NodeName == N7 && UpgradeDomain == UD1").unwrap();
        assert!(e.matches(&n));
        let e = Expr::parse("!(NodeName == N7)").unwrap();
        assert!(!e.matches(&n));
    }

    #[test]
    fn truthy_operand() {
        let n = node("N1", &[("IsGpu", "True")]);
        assert!(Expr::parse("IsGpu").unwrap().matches(&n));
        assert!(!Expr::parse("HasSsd").unwrap().matches(&n));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!(Expr::parse("NodeType =="), Err(ExpressionError::UnexpectedEnd));
        assert!(matches!(
            Expr::parse("(A == B"),
            Err(ExpressionError::UnexpectedEnd)
        ));
        assert!(matches!(
            Expr::parse("A == B)"),
            Err(ExpressionError::UnexpectedToken { offset: 6, .. })
        ));
        assert_eq!(
            Expr::parse("A == \"open"),
            Err(ExpressionError::UnterminatedString(5))
        );
        assert!(Expr::parse("A & B").is_err());
    }
}
