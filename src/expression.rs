//! Expression Evaluator - Bracket-Tag Formulas
//!
//! A formula like `[Quantity] * [Price]` is resolved in three steps:
//! 1. Substitute: each `[Label]` becomes the row's numeric value for that column
//! 2. Sanitize: keep only digits, `+ - * / ( ) .` and whitespace
//! 3. Parse and evaluate the remaining arithmetic
//!
//! Grammar after sanitizing:
//!   expr    --> term ( ("+" | "-") term )*
//!   term    --> unary ( ("*" | "/") unary )*
//!   unary   --> ("+" | "-") unary | primary
//!   primary --> NUMBER | "(" expr ")"

use std::collections::HashMap;
use thiserror::Error;

use crate::templates::{CellValue, RowValues};

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ExpressionError {
    #[error("Empty expression")]
    Empty,

    #[error("Unexpected character '{0}' at {1}")]
    UnexpectedChar(char, usize),

    #[error("Malformed number at {0}")]
    MalformedNumber(usize),

    #[error("Unexpected token {0:?}")]
    UnexpectedToken(Token),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Arithmetic AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Negate(Box<Expr>),
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
}

impl Expr {
    /// IEEE semantics: division by zero yields an infinity or NaN, callers check finiteness.
    pub fn eval(&self) -> f64 {
        match self {
            Expr::Number(n) => *n,
            Expr::Negate(inner) => -inner.eval(),
            Expr::Binary { op, left, right } => {
                let (l, r) = (left.eval(), right.eval());
                match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => l / r,
                }
            }
        }
    }
}

/// Resolve a formula against a row. Never fails: any problem yields `CellValue::Empty`.
pub fn evaluate(formula: &str, row: &RowValues, label_to_key: &HashMap<String, String>) -> CellValue {
    let substituted = substitute(formula, row, label_to_key);
    let expression = sanitize(&substituted);
    if expression.trim().is_empty() {
        return CellValue::Empty;
    }

    match parse_arithmetic(&expression) {
        Ok(ast) => {
            let result = ast.eval();
            if result.is_finite() {
                CellValue::Number(round2(result))
            } else {
                log::debug!("formula {:?} produced a non-finite result", formula);
                CellValue::Empty
            }
        }
        Err(e) => {
            log::debug!("formula {:?} failed: {}", formula, e);
            CellValue::Empty
        }
    }
}

/// Replace every `[Label]` with the row's numeric value. Unknown labels become 0.
pub fn substitute(formula: &str, row: &RowValues, label_to_key: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(formula.len());
    let mut rest = formula;

    while let Some(open) = rest.find('[') {
        let Some(close) = rest[open..].find(']') else {
            break;
        };
        out.push_str(&rest[..open]);

        let label = rest[open + 1..open + close].trim();
        let value = label_to_key.get(label)
            .and_then(|key| row.get(key))
            .map_or(0.0, CellValue::as_number);
        out.push_str(&format_number(value));

        rest = &rest[open + close + 1..];
    }

    out.push_str(rest);
    out
}

/// Strip everything outside the arithmetic character set.
pub fn sanitize(expression: &str) -> String {
    expression.chars()
        .filter(|c| c.is_ascii_digit() || "+-*/().".contains(*c) || c.is_whitespace())
        .collect()
}

/// Distinct labels referenced by `[Label]` tags, in first-seen order.
pub fn referenced_labels(formula: &str) -> Vec<String> {
    let mut labels: Vec<String> = vec![];
    let mut rest = formula;

    while let Some(open) = rest.find('[') {
        let Some(close) = rest[open..].find(']') else {
            break;
        };
        let label = rest[open + 1..open + close].trim();
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
        rest = &rest[open + close + 1..];
    }

    labels
}

/// Point every tag that resolves to `old` at `new` instead. Tags are matched
/// the way [`substitute`] matches them, so `[ Old ]` is renamed too.
pub fn rename_label(formula: &str, old: &str, new: &str) -> String {
    let old = old.trim();
    let mut out = String::with_capacity(formula.len());
    let mut rest = formula;

    while let Some(open) = rest.find('[') {
        let Some(close) = rest[open..].find(']') else {
            break;
        };
        out.push_str(&rest[..open]);
        if rest[open + 1..open + close].trim() == old {
            out.push('[');
            out.push_str(new);
            out.push(']');
        } else {
            out.push_str(&rest[open..=open + close]);
        }
        rest = &rest[open + close + 1..];
    }

    out.push_str(rest);
    out
}

/// Round half up to 2 decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0 + 0.5).floor() / 100.0
}

/// Read the longest numeric prefix of `text`, like a lenient float parse.
/// `"12.5kg"` is 12.5, `"abc"` is `None`.
pub fn parse_lenient(text: &str) -> Option<f64> {
    let s = text.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;

    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }
    if digits == 0 {
        return None;
    }

    // Exponent only counts when digits follow it.
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && matches!(bytes[exp_end], b'+' | b'-') {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    s[..end].parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Plain decimal text for substitution. Never uses exponent notation.
fn format_number(value: f64) -> String {
    if value.is_finite() {
        format!("{}", value)
    } else {
        "0".to_string()
    }
}

/// Parse a sanitized arithmetic expression.
pub fn parse_arithmetic(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExpressionError::Empty);
    }

    let mut parser = Parser { tokens: &tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ExpressionError::UnexpectedToken(token)),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let bytes = input.as_bytes();
    let mut tokens = vec![];
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let token = match c {
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => Token::Star,
            b'/' => Token::Slash,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'0'..=b'9' | b'.' => {
                let start = i;
                let mut dots = 0;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    if bytes[i] == b'.' {
                        dots += 1;
                    }
                    i += 1;
                }
                let text = &input[start..i];
                if dots > 1 || text == "." {
                    return Err(ExpressionError::MalformedNumber(start));
                }
                let value = text.parse::<f64>()
                    .map_err(|_| ExpressionError::MalformedNumber(start))?;
                tokens.push(Token::Number(value));
                continue;
            }
            _ => {
                let ch = input[i..].chars().next().unwrap_or('?');
                if ch.is_whitespace() {
                    i += ch.len_utf8();
                    continue;
                }
                return Err(ExpressionError::UnexpectedChar(ch, i));
            }
        };
        tokens.push(token);
        i += 1;
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn parse_expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Negate(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ExpressionError::UnexpectedToken(other)),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some(other) => Err(ExpressionError::UnexpectedToken(other)),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (RowValues, HashMap<String, String>) {
        let mut row = RowValues::new();
        row.insert("qty".into(), CellValue::Number(3.0));
        row.insert("price".into(), CellValue::Text("12.5".into()));
        row.insert("rate".into(), CellValue::Number(0.0));
        row.insert("neg".into(), CellValue::Number(-4.0));

        let labels = [("Quantity", "qty"), ("Price", "price"), ("Rate", "rate"), ("Credit", "neg")]
            .into_iter()
            .map(|(l, k)| (l.to_string(), k.to_string()))
            .collect();
        (row, labels)
    }

    #[test]
    fn test_quantity_times_price() {
        let (row, labels) = fixture();
        assert_eq!(evaluate("[Quantity] * [Price]", &row, &labels), CellValue::Number(37.5));
    }

    #[test]
    fn test_precedence_and_parens() {
        let (row, labels) = fixture();
        assert_eq!(evaluate("[Quantity] + 2 * 3", &row, &labels), CellValue::Number(9.0));
        assert_eq!(evaluate("([Quantity] + 2) * 3", &row, &labels), CellValue::Number(15.0));
        assert_eq!(evaluate("10 - 4 - 3", &row, &labels), CellValue::Number(3.0));
        assert_eq!(evaluate("12 / 3 / 2", &row, &labels), CellValue::Number(2.0));
    }

    #[test]
    fn test_negative_substitution() {
        let (row, labels) = fixture();
        assert_eq!(evaluate("[Quantity] - [Credit]", &row, &labels), CellValue::Number(7.0));
        assert_eq!(evaluate("[Credit] * [Credit]", &row, &labels), CellValue::Number(16.0));
    }

    #[test]
    fn test_division_by_zero_is_empty() {
        let (row, labels) = fixture();
        assert_eq!(evaluate("[Quantity] / [Rate]", &row, &labels), CellValue::Empty);
        assert_eq!(evaluate("[Rate] / [Rate]", &row, &labels), CellValue::Empty);
    }

    #[test]
    fn test_unknown_label_is_zero() {
        let (row, labels) = fixture();
        assert_eq!(evaluate("[Missing] + 5", &row, &labels), CellValue::Number(5.0));
    }

    #[test]
    fn test_injection_is_stripped() {
        let (row, labels) = fixture();
        // Letters vanish, leaving plain arithmetic.
        assert_eq!(evaluate("alert(1) + [Quantity]", &row, &labels), CellValue::Number(4.0));
        assert_eq!(sanitize("process.exit(1); 2"), ".(1) 2");
    }

    #[test]
    fn test_empty_and_malformed() {
        let (row, labels) = fixture();
        assert_eq!(evaluate("", &row, &labels), CellValue::Empty);
        assert_eq!(evaluate("abc", &row, &labels), CellValue::Empty);
        assert_eq!(evaluate("[Quantity] *", &row, &labels), CellValue::Empty);
        assert_eq!(evaluate("(1 + 2", &row, &labels), CellValue::Empty);
        assert_eq!(evaluate("1.2.3", &row, &labels), CellValue::Empty);
        assert_eq!(evaluate("3 4", &row, &labels), CellValue::Empty);
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round2(0.125), 0.13);
        assert_eq!(round2(-0.125), -0.12);
        assert_eq!(round2(2.3456), 2.35);
        assert_eq!(round2(10.0 / 3.0), 3.33);
    }

    #[test]
    fn test_parse_lenient() {
        assert_eq!(parse_lenient("12.5kg"), Some(12.5));
        assert_eq!(parse_lenient("  -3"), Some(-3.0));
        assert_eq!(parse_lenient(".5"), Some(0.5));
        assert_eq!(parse_lenient("5."), Some(5.0));
        assert_eq!(parse_lenient("1e3x"), Some(1000.0));
        assert_eq!(parse_lenient("2e"), Some(2.0));
        assert_eq!(parse_lenient("abc"), None);
        assert_eq!(parse_lenient("-"), None);
        assert_eq!(parse_lenient(""), None);
    }

    #[test]
    fn test_rename_label_matches_trimmed_tags() {
        assert_eq!(
            rename_label("[ Qty ] * [Qty] + [Qtyx] - [Rate", "Qty", "Units"),
            "[Units] * [Units] + [Qtyx] - [Rate"
        );
        assert_eq!(rename_label("2 * 3", "Qty", "Units"), "2 * 3");
    }

    #[test]
    fn test_referenced_labels() {
        assert_eq!(
            referenced_labels("[Qty] * [ Price ] + [Qty]"),
            vec!["Qty".to_string(), "Price".to_string()]
        );
        assert!(referenced_labels("1 + 2").is_empty());
        assert_eq!(referenced_labels("[A] + [B"), vec!["A".to_string()]);
    }

    #[test]
    fn test_parse_arithmetic_ast() {
        let ast = parse_arithmetic("-(1 + 2) * 4").unwrap();
        assert_eq!(ast.eval(), -12.0);
        assert_eq!(parse_arithmetic("   "), Err(ExpressionError::Empty));
        assert_eq!(parse_arithmetic("1 +"), Err(ExpressionError::UnexpectedEnd));
        assert_eq!(parse_arithmetic("1 )"), Err(ExpressionError::UnexpectedToken(Token::RParen)));
    }
}
