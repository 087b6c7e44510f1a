//! Sandboxed expressions for row transforms.
//!
//! An expression is parsed into an AST once and evaluated against each source
//! row. The grammar only reaches named fields of that row and a fixed set of
//! pure functions; there is no way to call out of the interpreter.
//!
//! ```text
//! expr    := sum ( "||" sum )*
//! sum     := product ( ("+" | "-") product )*
//! product := unary ( ("*" | "/" | "%") unary )*
//! unary   := "-" unary | primary
//! primary := number | 'string' | true | false | null
//!          | ident | ident "(" [ expr ("," expr)* ] ")" | "(" expr ")"
//! ```

use crate::db::Row;
use crate::error::MigrationError;
use serde_json::{Number, Value};
use std::fmt;

/// Expression parse or evaluation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    /// Malformed expression text.
    #[error("syntax error at {position}: {message}")]
    Syntax {
        /// Character offset.
        position: usize,
        /// What went wrong.
        message: String,
    },
    /// The row has no such field.
    #[error("unknown field '{0}'")]
    UnknownField(String),
    /// Not one of the built-in functions.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    /// Wrong number of arguments.
    #[error("{function} expects {expected} argument(s), got {found}")]
    Arity {
        /// Function name.
        function: String,
        /// Accepted argument count.
        expected: String,
        /// Supplied argument count.
        found: usize,
    },
    /// Operand types do not fit the operator.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// Division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// Integer overflow.
    #[error("arithmetic overflow")]
    Overflow,
}

impl From<ExpressionError> for MigrationError {
    fn from(err: ExpressionError) -> Self {
        Self::Transform(err.to_string())
    }
}

type EvalResult = std::result::Result<Value, ExpressionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Concat,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Concat => "||",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Field(String),
    Negate(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Number),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Op(BinaryOp),
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Parse expression text.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if let Some((position, token)) = parser.tokens.get(parser.pos) {
            return Err(ExpressionError::Syntax {
                position: *position,
                message: format!("unexpected {token:?}"),
            });
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Evaluate against a row.
    pub fn evaluate(&self, row: &Row) -> EvalResult {
        eval(&self.root, row)
    }

    /// Original text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Field names the expression reads, in first-use order.
    #[must_use]
    pub fn fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_fields(&self.root, &mut out);
        out
    }
}

fn collect_fields(node: &Node, out: &mut Vec<String>) {
    match node {
        Node::Field(name) if !out.contains(name) => out.push(name.clone()),
        Node::Negate(inner) => collect_fields(inner, out),
        Node::Binary(_, lhs, rhs) => {
            collect_fields(lhs, out);
            collect_fields(rhs, out);
        }
        Node::Call(_, args) => args.iter().for_each(|a| collect_fields(a, out)),
        _ => {}
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '+' => Token::Op(BinaryOp::Add),
            '-' => Token::Op(BinaryOp::Sub),
            '*' => Token::Op(BinaryOp::Mul),
            '/' => Token::Op(BinaryOp::Div),
            '%' => Token::Op(BinaryOp::Rem),
            '|' if chars.get(i + 1) == Some(&'|') => {
                i += 1;
                Token::Op(BinaryOp::Concat)
            }
            '\'' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            text.push('\'');
                            i += 2;
                        }
                        Some('\'') => break,
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(ExpressionError::Syntax {
                                position: start,
                                message: "unterminated string".to_string(),
                            })
                        }
                    }
                }
                Token::Str(text)
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let mut end = i;
                while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
                    end += 1;
                }
                let text: String = chars[i..end].iter().collect();
                i = end - 1;
                Token::Number(parse_number(&text).ok_or_else(|| ExpressionError::Syntax {
                    position: start,
                    message: format!("invalid number '{text}'"),
                })?)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = i;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let text: String = chars[i..end].iter().collect();
                i = end - 1;
                Token::Ident(text)
            }
            other => {
                return Err(ExpressionError::Syntax {
                    position: start,
                    message: format!("unexpected character '{other}'"),
                })
            }
        };
        tokens.push((start, token));
        i += 1;
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Option<Number> {
    if text.contains('.') {
        text.parse::<f64>().ok().and_then(Number::from_f64)
    } else {
        text.parse::<i64>().ok().map(Number::from)
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or_else(|| self.tokens.last().map_or(0, |(p, _)| p + 1), |(p, _)| *p)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn syntax(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            position: self.position(),
            message: message.into(),
        }
    }

    fn binary_level(
        &mut self,
        ops: &[BinaryOp],
        operand: fn(&mut Self) -> Result<Node, ExpressionError>,
    ) -> Result<Node, ExpressionError> {
        let mut lhs = operand(self)?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            if !ops.contains(&op) {
                break;
            }
            self.pos += 1;
            let rhs = operand(self)?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn expr(&mut self) -> Result<Node, ExpressionError> {
        self.binary_level(&[BinaryOp::Concat], Self::sum)
    }

    fn sum(&mut self) -> Result<Node, ExpressionError> {
        self.binary_level(&[BinaryOp::Add, BinaryOp::Sub], Self::product)
    }

    fn product(&mut self) -> Result<Node, ExpressionError> {
        self.binary_level(&[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Rem], Self::unary)
    }

    fn unary(&mut self) -> Result<Node, ExpressionError> {
        if self.peek() == Some(&Token::Op(BinaryOp::Sub)) {
            self.pos += 1;
            return Ok(Node::Negate(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node, ExpressionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Node::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.syntax("expected ')'")),
                }
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    return self.call(name);
                }
                Ok(match name.to_ascii_lowercase().as_str() {
                    "true" => Node::Literal(Value::Bool(true)),
                    "false" => Node::Literal(Value::Bool(false)),
                    "null" => Node::Literal(Value::Null),
                    _ => Node::Field(name),
                })
            }
            Some(token) => Err(self.syntax(format!("unexpected {token:?}"))),
            None => Err(self.syntax("unexpected end of expression")),
        }
    }

    fn call(&mut self, name: String) -> Result<Node, ExpressionError> {
        let name = name.to_ascii_lowercase();
        if !FUNCTIONS.contains(&name.as_str()) {
            return Err(ExpressionError::UnknownFunction(name));
        }
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(Node::Call(name, args));
        }
        loop {
            args.push(self.expr()?);
            match self.next() {
                Some(Token::Comma) => {}
                Some(Token::RParen) => break,
                _ => return Err(self.syntax(format!("expected ',' or ')' in call to {name}"))),
            }
        }
        Ok(Node::Call(name, args))
    }
}

const FUNCTIONS: [&str; 8] = [
    "upper", "lower", "trim", "length", "concat", "coalesce", "abs", "round",
];

fn eval(node: &Node, row: &Row) -> EvalResult {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Field(name) => row
            .get(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownField(name.clone())),
        Node::Negate(inner) => match eval(inner, row)? {
            Value::Null => Ok(Value::Null),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i.checked_neg()
                        .map(Value::from)
                        .ok_or(ExpressionError::Overflow)
                } else {
                    Ok(float(-n.as_f64().unwrap_or_default()))
                }
            }
            other => Err(ExpressionError::TypeMismatch(format!(
                "cannot negate {}",
                type_name(&other)
            ))),
        },
        Node::Binary(op, lhs, rhs) => binary(*op, eval(lhs, row)?, eval(rhs, row)?),
        Node::Call(name, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, row))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, values)
        }
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> EvalResult {
    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }

    if op == BinaryOp::Concat {
        return Ok(Value::String(format!("{}{}", to_text(&lhs), to_text(&rhs))));
    }

    match (&lhs, &rhs) {
        (Value::String(a), Value::String(b)) if op == BinaryOp::Add => {
            Ok(Value::String(format!("{a}{b}")))
        }
        (Value::Number(a), Value::Number(b)) => arithmetic(op, a, b),
        _ => Err(ExpressionError::TypeMismatch(format!(
            "{} {op} {}",
            type_name(&lhs),
            type_name(&rhs)
        ))),
    }
}

fn arithmetic(op: BinaryOp, a: &Number, b: &Number) -> EvalResult {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div | BinaryOp::Rem if y == 0 => return Err(ExpressionError::DivisionByZero),
            BinaryOp::Div => match x.checked_rem(y) {
                Some(0) => x.checked_div(y),
                Some(_) => return Ok(float(x as f64 / y as f64)),
                None => None,
            },
            BinaryOp::Rem => x.checked_rem(y),
            BinaryOp::Concat => None,
        };
        return result.map(Value::from).ok_or(ExpressionError::Overflow);
    }

    let x = a.as_f64().unwrap_or_default();
    let y = b.as_f64().unwrap_or_default();
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div | BinaryOp::Rem if y == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => x / y,
        BinaryOp::Rem => x % y,
        BinaryOp::Concat => return Err(ExpressionError::TypeMismatch("number || number".into())),
    };
    Ok(float(result))
}

fn call(name: &str, args: Vec<Value>) -> EvalResult {
    let arity = |expected: &str, ok: bool| {
        if ok {
            Ok(())
        } else {
            Err(ExpressionError::Arity {
                function: name.to_string(),
                expected: expected.to_string(),
                found: args.len(),
            })
        }
    };

    match name {
        "upper" | "lower" | "trim" | "length" => {
            arity("1", args.len() == 1)?;
            let value = &args[0];
            let text = match value {
                Value::Null => return Ok(Value::Null),
                Value::String(s) => s,
                other => {
                    return Err(ExpressionError::TypeMismatch(format!(
                        "{name} expects text, got {}",
                        type_name(other)
                    )))
                }
            };
            Ok(match name {
                "upper" => Value::String(text.to_uppercase()),
                "lower" => Value::String(text.to_lowercase()),
                "trim" => Value::String(text.trim().to_string()),
                _ => Value::from(text.chars().count() as u64),
            })
        }
        "concat" => Ok(Value::String(
            args.iter().filter(|v| !v.is_null()).map(to_text).collect(),
        )),
        "coalesce" => {
            arity("at least 1", !args.is_empty())?;
            Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null))
        }
        "abs" => {
            arity("1", args.len() == 1)?;
            match &args[0] {
                Value::Null => Ok(Value::Null),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => i.checked_abs().map(Value::from).ok_or(ExpressionError::Overflow),
                    None => Ok(float(n.as_f64().unwrap_or_default().abs())),
                },
                other => Err(ExpressionError::TypeMismatch(format!(
                    "abs expects a number, got {}",
                    type_name(other)
                ))),
            }
        }
        "round" => {
            arity("1 or 2", matches!(args.len(), 1 | 2))?;
            let digits = match args.get(1) {
                None => 0,
                Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                    ExpressionError::TypeMismatch("round digits must be an integer".into())
                })?,
                Some(other) => {
                    return Err(ExpressionError::TypeMismatch(format!(
                        "round digits must be an integer, got {}",
                        type_name(other)
                    )))
                }
            };
            match &args[0] {
                Value::Null => Ok(Value::Null),
                Value::Number(n) if n.is_i64() && digits >= 0 => Ok(Value::Number(n.clone())),
                Value::Number(n) => {
                    let factor = 10f64.powi(i32::try_from(digits).unwrap_or(0));
                    let rounded = (n.as_f64().unwrap_or_default() * factor).round() / factor;
                    if digits <= 0 && rounded.fract() == 0.0 && rounded.abs() < i64::MAX as f64 {
                        Ok(Value::from(rounded as i64))
                    } else {
                        Ok(float(rounded))
                    }
                }
                other => Err(ExpressionError::TypeMismatch(format!(
                    "round expects a number, got {}",
                    type_name(other)
                ))),
            }
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> Row {
        json!({
            "first_name": "ada",
            "last_name": "Lovelace",
            "age": 36,
            "score": 2.5,
            "nickname": null
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn eval_str(src: &str) -> EvalResult {
        Expression::parse(src)?.evaluate(&row())
    }

    #[test]
    fn test_string_functions_and_concat() {
        assert_eq!(
            eval_str("upper(first_name) || ' ' || last_name").unwrap(),
            json!("ADA Lovelace")
        );
        assert_eq!(eval_str("first_name + last_name").unwrap(), json!("adaLovelace"));
        assert_eq!(eval_str("length(last_name)").unwrap(), json!(8));
        assert_eq!(eval_str("trim('  x  ')").unwrap(), json!("x"));
        assert_eq!(eval_str("concat(first_name, nickname, '!')").unwrap(), json!("ada!"));
        assert_eq!(eval_str("coalesce(nickname, first_name)").unwrap(), json!("ada"));
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval_str("age + 4 * 2").unwrap(), json!(44));
        assert_eq!(eval_str("(age + 4) * 2").unwrap(), json!(80));
        assert_eq!(eval_str("-age % 5").unwrap(), json!(-1));
        assert_eq!(eval_str("age / 4").unwrap(), json!(9));
        assert_eq!(eval_str("age / 8").unwrap(), json!(4.5));
        assert_eq!(eval_str("score * 2").unwrap(), json!(5.0));
        assert_eq!(eval_str("round(score * 3)").unwrap(), json!(8));
        assert_eq!(eval_str("round(1.2345, 2)").unwrap(), json!(1.23));
        assert_eq!(eval_str("abs(-3)").unwrap(), json!(3));
    }

    #[test]
    fn test_null_propagation() {
        assert_eq!(eval_str("nickname || 'x'").unwrap(), Value::Null);
        assert_eq!(eval_str("age + null").unwrap(), Value::Null);
        assert_eq!(eval_str("upper(nickname)").unwrap(), Value::Null);
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            eval_str("missing + 1"),
            Err(ExpressionError::UnknownField("missing".to_string()))
        );
        assert_eq!(
            Expression::parse("system('rm -rf /')"),
            Err(ExpressionError::UnknownFunction("system".to_string()))
        );
        assert_eq!(eval_str("age / 0"), Err(ExpressionError::DivisionByZero));
        assert!(matches!(eval_str("age + 'x'"), Err(ExpressionError::TypeMismatch(_))));
        assert!(matches!(eval_str("upper(age)"), Err(ExpressionError::TypeMismatch(_))));
        assert!(matches!(eval_str("upper()"), Err(ExpressionError::Arity { .. })));
        assert!(matches!(Expression::parse("age +"), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(Expression::parse("'open"), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(Expression::parse("a b"), Err(ExpressionError::Syntax { .. })));
    }

    #[test]
    fn test_integer_division_at_the_edge() {
        let min = "(-9223372036854775807 - 1)";
        assert_eq!(eval_str(&format!("{min} / -1")), Err(ExpressionError::Overflow));
        assert_eq!(eval_str(&format!("{min} % -1")), Err(ExpressionError::Overflow));
        assert_eq!(eval_str(&format!("{min} / 2")).unwrap(), json!(i64::MIN / 2));
        assert_eq!(eval_str("7 / 2").unwrap(), json!(3.5));
    }

    #[test]
    fn test_literals_and_fields() {
        assert_eq!(eval_str("TRUE").unwrap(), json!(true));
        assert_eq!(eval_str("'it''s'").unwrap(), json!("it's"));
        let expr = Expression::parse("concat(first_name, last_name, first_name)").unwrap();
        assert_eq!(expr.fields(), vec!["first_name", "last_name"]);
        assert_eq!(expr.source(), "concat(first_name, last_name, first_name)");
    }

    #[test]
    fn test_transform_error_conversion() {
        let err: MigrationError = ExpressionError::DivisionByZero.into();
        assert!(matches!(err, MigrationError::Transform(_)));
    }
}
