use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{error::StoreError, snapshot::Snapshot};

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Comparison { field: String, op: ComparisonOp },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComparisonOp {
    Equals(ConditionValue),
    NotEquals(ConditionValue),
    GreaterThan(ConditionValue),
    GreaterOrEqual(ConditionValue),
    LessThan(ConditionValue),
    LessOrEqual(ConditionValue),
    In(Vec<ConditionValue>),
    Like(LikePattern),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionValue {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

/// A `LIKE` pattern (`%`/`*` any run, `_`/`?` one character) compiled once
/// when the condition is parsed.
#[derive(Debug, Clone)]
pub struct LikePattern {
    source: String,
    regex: Regex,
}

impl LikePattern {
    pub fn new(source: &str) -> Result<Self, ConditionError> {
        let mut pattern = String::from("^");
        for ch in source.chars() {
            match ch {
                '%' | '*' => pattern.push_str(".*"),
                '_' | '?' => pattern.push('.'),
                other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        pattern.push('$');
        let regex = Regex::new(&pattern).map_err(|err| {
            ConditionError::Message(format!("invalid LIKE pattern '{source}': {err}"))
        })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("{0}")]
    Message(String),
}

impl From<ConditionError> for StoreError {
    fn from(err: ConditionError) -> Self {
        StoreError::InvalidRule(err.to_string())
    }
}

/// Structured threshold, the non-textual way to express a single comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub field: String,
    pub op: String,
    pub value: Value,
}

impl MetricThreshold {
    pub fn to_condition(&self) -> Result<Condition, ConditionError> {
        if self.field.trim().is_empty() {
            return Err(ConditionError::Message("metric field cannot be empty".into()));
        }
        let value = ConditionValue::from_json(&self.value)?;
        let op = match self.op.trim() {
            "=" | "==" | "eq" => ComparisonOp::Equals(value),
            "!=" | "ne" => ComparisonOp::NotEquals(value),
            ">" | "gt" => ComparisonOp::GreaterThan(value),
            ">=" | "gte" => ComparisonOp::GreaterOrEqual(value),
            "<" | "lt" => ComparisonOp::LessThan(value),
            "<=" | "lte" => ComparisonOp::LessOrEqual(value),
            other => {
                return Err(ConditionError::Message(format!(
                    "unsupported metric operator '{other}'"
                )));
            }
        };
        Ok(Condition::Comparison {
            field: self.field.trim().to_string(),
            op,
        })
    }
}

impl Condition {
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        match self {
            Condition::And(children) => children.iter().all(|child| child.matches(snapshot)),
            Condition::Or(children) => children.iter().any(|child| child.matches(snapshot)),
            Condition::Not(expr) => !expr.matches(snapshot),
            Condition::Comparison { field, op } => {
                let value = resolve_field_value(snapshot, field);
                evaluate_comparison(value, op)
            }
        }
    }
}

impl ConditionValue {
    fn from_json(value: &Value) -> Result<Self, ConditionError> {
        match value {
            Value::Null => Ok(ConditionValue::Null),
            Value::Bool(flag) => Ok(ConditionValue::Bool(*flag)),
            Value::Number(number) => number
                .as_f64()
                .map(ConditionValue::Number)
                .ok_or_else(|| ConditionError::Message(format!("unsupported number {number}"))),
            Value::String(text) => Ok(ConditionValue::String(text.clone())),
            other => Err(ConditionError::Message(format!(
                "threshold must be a scalar, got {other}"
            ))),
        }
    }

    /// Equality under the same rules as [`compare`]: numeric strings equal
    /// the numbers they spell.
    fn matches_value(&self, value: &ComparableValue) -> bool {
        let same_number =
            |lhs: f64, rhs: Option<f64>| rhs.is_some_and(|rhs| (lhs - rhs).abs() < f64::EPSILON);
        match (self, value) {
            (ConditionValue::Null, ComparableValue::Null) => true,
            (ConditionValue::Bool(lhs), ComparableValue::Bool(rhs)) => lhs == rhs,
            (
                ConditionValue::Number(lhs),
                ComparableValue::Number(_) | ComparableValue::String(_),
            ) => same_number(*lhs, value.as_number()),
            (ConditionValue::String(lhs), ComparableValue::String(rhs)) => {
                lhs == rhs
                    || lhs
                        .trim()
                        .parse::<f64>()
                        .is_ok_and(|lhs| same_number(lhs, value.as_number()))
            }
            (ConditionValue::String(lhs), ComparableValue::Number(rhs)) => {
                same_number(*rhs, lhs.trim().parse::<f64>().ok())
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
enum ComparableValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Unsupported,
}

impl ComparableValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            ComparableValue::Number(value) => Some(*value),
            ComparableValue::String(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        }
    }
}

fn resolve_field_value(snapshot: &Snapshot, field: &str) -> Option<ComparableValue> {
    match field {
        "id" => Some(ComparableValue::String(snapshot.key.id.clone())),
        "entity" | "entity_type" => Some(ComparableValue::String(
            snapshot.key.entity_type.as_str().to_string(),
        )),
        "env" => Some(ComparableValue::String(snapshot.key.env.as_str().to_string())),
        other => snapshot.field(other).map(|value| match value {
            Value::Null => ComparableValue::Null,
            Value::Bool(v) => ComparableValue::Bool(*v),
            Value::Number(num) => num
                .as_f64()
                .map(ComparableValue::Number)
                .unwrap_or(ComparableValue::Unsupported),
            Value::String(text) => ComparableValue::String(text.clone()),
            _ => ComparableValue::Unsupported,
        }),
    }
}

fn evaluate_comparison(value: Option<ComparableValue>, op: &ComparisonOp) -> bool {
    match value {
        Some(val) => match op {
            ComparisonOp::Equals(expected) => expected.matches_value(&val),
            ComparisonOp::NotEquals(expected) => !expected.matches_value(&val),
            ComparisonOp::GreaterThan(expected) => compare(&val, expected, |o| o.is_gt()),
            ComparisonOp::GreaterOrEqual(expected) => compare(&val, expected, |o| o.is_ge()),
            ComparisonOp::LessThan(expected) => compare(&val, expected, |o| o.is_lt()),
            ComparisonOp::LessOrEqual(expected) => compare(&val, expected, |o| o.is_le()),
            ComparisonOp::In(expected) => expected
                .iter()
                .any(|candidate| candidate.matches_value(&val)),
            ComparisonOp::Like(pattern) => match val {
                ComparableValue::String(text) => pattern.is_match(&text),
                _ => false,
            },
        },
        None => matches_missing(op),
    }
}

/// Numbers (and numeric strings) compare numerically; two non-numeric
/// strings compare lexicographically, which orders RFC 3339 timestamps.
fn compare(
    value: &ComparableValue,
    expected: &ConditionValue,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    match expected {
        ConditionValue::Number(rhs) => value
            .as_number()
            .and_then(|lhs| lhs.partial_cmp(rhs))
            .is_some_and(accept),
        ConditionValue::String(rhs) => match value {
            ComparableValue::String(lhs) => match (lhs.parse::<f64>(), rhs.parse::<f64>()) {
                (Ok(lhs), Ok(rhs)) => lhs.partial_cmp(&rhs).is_some_and(accept),
                _ => accept(lhs.as_str().cmp(rhs.as_str())),
            },
            ComparableValue::Number(lhs) => rhs
                .parse::<f64>()
                .ok()
                .and_then(|rhs| lhs.partial_cmp(&rhs))
                .is_some_and(accept),
            _ => false,
        },
        _ => false,
    }
}

fn matches_missing(op: &ComparisonOp) -> bool {
    matches!(op, ComparisonOp::NotEquals(ConditionValue::Null))
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::String(value) => write!(f, "{value}"),
            ConditionValue::Number(value) => write!(f, "{value}"),
            ConditionValue::Bool(value) => write!(f, "{value}"),
            ConditionValue::Null => write!(f, "null"),
        }
    }
}

// === Expression parser ===

pub fn parse_condition(input: &str) -> Result<Condition, ConditionError> {
    let lexer = Lexer::new(input);
    let tokens = lexer.collect::<Result<Vec<_>, _>>()?;
    if tokens.is_empty() {
        return Err(ConditionError::Message("condition cannot be empty".into()));
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expression()?;
    parser.expect_end()?;
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    String(String),
    Number(String),
    Boolean(bool),
    Null,
    And,
    Or,
    Not,
    Operator(Operator),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Like,
}

struct Lexer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token, ConditionError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.consume_whitespace();
        if self.is_eof() {
            return None;
        }
        let ch = self.peek_char()?;
        let token = if is_identifier_start(ch) {
            self.consume_identifier()
        } else if ch == '"' || ch == '\'' {
            self.consume_string()
        } else if ch.is_ascii_digit() || ch == '-' {
            self.consume_number()
        } else {
            self.advance();
            match ch {
                '(' => Ok(Token::LParen),
                ')' => Ok(Token::RParen),
                '[' => Ok(Token::LBracket),
                ']' => Ok(Token::RBracket),
                ',' => Ok(Token::Comma),
                '=' => {
                    self.eat('=');
                    Ok(Token::Operator(Operator::Eq))
                }
                '!' => {
                    if self.eat('=') {
                        Ok(Token::Operator(Operator::Neq))
                    } else {
                        Ok(Token::Not)
                    }
                }
                '>' => {
                    if self.eat('=') {
                        Ok(Token::Operator(Operator::Gte))
                    } else {
                        Ok(Token::Operator(Operator::Gt))
                    }
                }
                '<' => {
                    if self.eat('=') {
                        Ok(Token::Operator(Operator::Lte))
                    } else if self.eat('>') {
                        Ok(Token::Operator(Operator::Neq))
                    } else {
                        Ok(Token::Operator(Operator::Lt))
                    }
                }
                '&' if self.eat('&') => Ok(Token::And),
                '|' if self.eat('|') => Ok(Token::Or),
                _ => Err(ConditionError::Message(format!(
                    "unexpected character '{ch}'"
                ))),
            }
        };
        Some(token)
    }
}

impl Lexer<'_> {
    fn consume_whitespace(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn consume_identifier(&mut self) -> Result<Token, ConditionError> {
        let start = self.position;
        self.advance();
        while let Some(ch) = self.peek_char() {
            if is_identifier_part(ch) {
                self.advance();
            } else {
                break;
            }
        }
        let ident = &self.input[start..self.position];
        let upper = ident.to_ascii_uppercase();
        match upper.as_str() {
            "AND" => Ok(Token::And),
            "OR" => Ok(Token::Or),
            "NOT" => Ok(Token::Not),
            "IN" => Ok(Token::Operator(Operator::In)),
            "LIKE" => Ok(Token::Operator(Operator::Like)),
            "TRUE" => Ok(Token::Boolean(true)),
            "FALSE" => Ok(Token::Boolean(false)),
            "NULL" => Ok(Token::Null),
            _ => Ok(Token::Identifier(ident.to_string())),
        }
    }

    fn consume_string(&mut self) -> Result<Token, ConditionError> {
        let Some(quote) = self.next_char() else {
            return Err(ConditionError::Message("expected string literal".into()));
        };
        let mut value = String::new();
        while let Some(ch) = self.next_char() {
            if ch == quote {
                return Ok(Token::String(value));
            }
            if ch == '\\' {
                match self.next_char() {
                    Some(escaped) => value.push(escaped),
                    None => {
                        return Err(ConditionError::Message(
                            "unterminated escape sequence".into(),
                        ));
                    }
                }
            } else {
                value.push(ch);
            }
        }
        Err(ConditionError::Message("unterminated string literal".into()))
    }

    fn consume_number(&mut self) -> Result<Token, ConditionError> {
        let start = self.position;
        self.advance();
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }
        Ok(Token::Number(self.input[start..self.position].to_string()))
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn next_char(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.position += ch.len_utf8();
        Some(ch)
    }

    fn advance(&mut self) {
        self.next_char();
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn is_eof(&self) -> bool {
        self.position >= self.input.len()
    }
}

fn is_identifier_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == '$'
}

fn is_identifier_part(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '$'
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TokenKind {
    And,
    Or,
    Not,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

impl TokenKind {
    fn matches(self, token: &Token) -> bool {
        matches!(
            (self, token),
            (TokenKind::And, Token::And)
                | (TokenKind::Or, Token::Or)
                | (TokenKind::Not, Token::Not)
                | (TokenKind::LParen, Token::LParen)
                | (TokenKind::RParen, Token::RParen)
                | (TokenKind::LBracket, Token::LBracket)
                | (TokenKind::RBracket, Token::RBracket)
                | (TokenKind::Comma, Token::Comma)
        )
    }
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    fn parse_expression(&mut self) -> Result<Condition, ConditionError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Condition, ConditionError> {
        let mut expr = self.parse_and()?;
        while self.match_token(TokenKind::Or) {
            self.advance();
            let right = self.parse_and()?;
            expr = match expr {
                Condition::Or(mut nodes) => {
                    nodes.push(right);
                    Condition::Or(nodes)
                }
                _ => Condition::Or(vec![expr, right]),
            };
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Condition, ConditionError> {
        let mut expr = self.parse_not()?;
        while self.match_token(TokenKind::And) {
            self.advance();
            let right = self.parse_not()?;
            expr = match expr {
                Condition::And(mut nodes) => {
                    nodes.push(right);
                    Condition::And(nodes)
                }
                _ => Condition::And(vec![expr, right]),
            };
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Condition, ConditionError> {
        if self.match_token(TokenKind::Not) {
            self.advance();
            let expr = self.parse_not()?;
            Ok(Condition::Not(Box::new(expr)))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<Condition, ConditionError> {
        if self.match_token(TokenKind::LParen) {
            self.advance();
            let expr = self.parse_expression()?;
            self.expect(TokenKind::RParen, "')'")?;
            Ok(expr)
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Condition, ConditionError> {
        let field = match self.current_token() {
            Some(Token::Identifier(name)) => {
                let value = name.clone();
                self.advance();
                value
            }
            _ => {
                return Err(ConditionError::Message(
                    "expected field name in comparison".into(),
                ));
            }
        };

        let mut negate = false;
        if self.match_token(TokenKind::Not) {
            self.advance();
            negate = true;
        }

        let operator = match self.current_token() {
            Some(Token::Operator(operator)) => *operator,
            _ => {
                return Err(ConditionError::Message(format!(
                    "expected comparison operator after '{field}'"
                )));
            }
        };
        self.advance();

        let op = match operator {
            Operator::In => {
                self.expect(TokenKind::LBracket, "'['")?;
                let mut values = Vec::new();
                while !self.match_token(TokenKind::RBracket) {
                    values.push(self.parse_value()?);
                    if self.match_token(TokenKind::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket, "']'")?;
                ComparisonOp::In(values)
            }
            Operator::Like => match self.parse_value()? {
                ConditionValue::String(pattern) => ComparisonOp::Like(LikePattern::new(&pattern)?),
                other => {
                    return Err(ConditionError::Message(format!(
                        "LIKE needs a string pattern, got {other}"
                    )));
                }
            },
            Operator::Eq => ComparisonOp::Equals(self.parse_value()?),
            Operator::Neq => ComparisonOp::NotEquals(self.parse_value()?),
            Operator::Gt => ComparisonOp::GreaterThan(self.parse_value()?),
            Operator::Gte => ComparisonOp::GreaterOrEqual(self.parse_value()?),
            Operator::Lt => ComparisonOp::LessThan(self.parse_value()?),
            Operator::Lte => ComparisonOp::LessOrEqual(self.parse_value()?),
        };

        let expr = Condition::Comparison { field, op };
        if negate {
            Ok(Condition::Not(Box::new(expr)))
        } else {
            Ok(expr)
        }
    }

    fn parse_value(&mut self) -> Result<ConditionValue, ConditionError> {
        let token = self
            .current_token()
            .ok_or_else(|| ConditionError::Message("unexpected end of condition".into()))?
            .clone();
        self.advance();
        match token {
            Token::String(value) => Ok(ConditionValue::String(value)),
            Token::Number(value) => value
                .parse::<f64>()
                .map(ConditionValue::Number)
                .map_err(|err| ConditionError::Message(format!("invalid number: {err}"))),
            Token::Boolean(value) => Ok(ConditionValue::Bool(value)),
            Token::Null => Ok(ConditionValue::Null),
            Token::Identifier(value) => Ok(ConditionValue::String(value)),
            _ => Err(ConditionError::Message("invalid value literal".into())),
        }
    }

    fn expect(&mut self, kind: TokenKind, label: &str) -> Result<(), ConditionError> {
        if self.match_token(kind) {
            self.advance();
            Ok(())
        } else {
            Err(ConditionError::Message(format!("expected {label}")))
        }
    }

    fn expect_end(&self) -> Result<(), ConditionError> {
        match self.current_token() {
            None => Ok(()),
            Some(token) => Err(ConditionError::Message(format!(
                "unexpected trailing token {token:?}"
            ))),
        }
    }

    fn match_token(&self, kind: TokenKind) -> bool {
        self.current_token().is_some_and(|token| kind.matches(token))
    }

    fn current_token(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entity::{EntityKey, EntityType, Env};

    fn sample_snapshot() -> Snapshot {
        let key = EntityKey::new(Env::Dev, EntityType::Idea, "I1").unwrap();
        Snapshot::from_document(
            key,
            json!({
                "id": "I1",
                "status": "New",
                "score": 8.5,
                "budget": "1200",
                "archived": false,
                "owner": { "email": "ana@example.com" },
                "updated_at": "2025-01-02T00:00:00Z"
            }),
        )
        .unwrap()
    }

    #[test]
    fn parses_basic_comparison() {
        let expr = parse_condition(r#"status = "New""#).expect("parse succeeds");
        assert_eq!(
            expr,
            Condition::Comparison {
                field: "status".into(),
                op: ComparisonOp::Equals(ConditionValue::String("New".into())),
            }
        );
    }

    #[test]
    fn parses_nested_logic_with_symbolic_operators() {
        let expr = parse_condition(r#"(status == "New" || status == "Approved") && score >= 8"#)
            .expect("parse succeeds");
        let Condition::And(parts) = expr else {
            panic!("expected AND expression");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], Condition::Or(branches) if branches.len() == 2));
        assert_eq!(
            parts[1],
            Condition::Comparison {
                field: "score".into(),
                op: ComparisonOp::GreaterOrEqual(ConditionValue::Number(8.0)),
            }
        );
    }

    #[test]
    fn rejects_invalid_syntax() {
        assert!(parse_condition("").is_err());
        assert!(parse_condition(r#"status = "New" AND"#).is_err());
        assert!(parse_condition(r#"status @ "New""#).is_err());
        assert!(parse_condition(r#"status = "New"#).is_err());
        assert!(parse_condition(r#"status = "New" score"#).is_err());
    }

    #[test]
    fn evaluates_comparisons_against_snapshot_fields() {
        let snapshot = sample_snapshot();
        let cases = [
            (r#"status = "New" AND score >= 8"#, true),
            (r#"status = "Approved" OR score > 9"#, false),
            ("score <= 8.5 && score < 9", true),
            ("NOT archived = true", true),
            ("!(score > 8)", false),
            (r#"status IN ["New", "Approved"]"#, true),
            (r#"status NOT IN ["New"]"#, false),
            (r#"owner.email LIKE "%@example.com""#, true),
            ("budget > 1000", true),
            (r#"id = "I1""#, true),
            (r#"entity = "idea""#, true),
        ];
        for (source, expected) in cases {
            let expr = parse_condition(source).expect(source);
            assert_eq!(expr.matches(&snapshot), expected, "{source}");
        }
    }

    #[test]
    fn numeric_strings_compare_equal_to_numbers() {
        let key = EntityKey::new(Env::Dev, EntityType::Idea, "I2").unwrap();
        let snapshot = Snapshot::from_document(
            key,
            json!({ "score": "8", "rank": 3, "updated_at": "2025-01-02T00:00:00Z" }),
        )
        .unwrap();
        let cases = [
            ("score = 8", true),
            ("score == 8.0", true),
            ("score != 8", false),
            ("score >= 8 AND score <= 8", true),
            ("score IN [7, 8]", true),
            ("score NOT IN [8]", false),
            (r#"score = "8.0""#, true),
            (r#"rank = "3""#, true),
            (r#"rank != "3""#, false),
            (r#"rank IN ["1", "3"]"#, true),
            ("score = 9", false),
        ];
        for (source, expected) in cases {
            let expr = parse_condition(source).expect(source);
            assert_eq!(expr.matches(&snapshot), expected, "{source}");
        }
    }

    #[test]
    fn like_patterns_compile_once_at_parse_time() {
        let expr = parse_condition(r#"status LIKE "N_w (beta).*""#).unwrap();
        let Condition::Comparison {
            op: ComparisonOp::Like(pattern),
            ..
        } = &expr
        else {
            panic!("expected LIKE comparison");
        };
        assert_eq!(pattern.as_str(), "N_w (beta).*");
        assert!(pattern.is_match("New (beta).txt"));
        assert!(!pattern.is_match("New beta.txt"));

        let err = parse_condition("status LIKE 5").unwrap_err();
        assert!(matches!(StoreError::from(err), StoreError::InvalidRule(_)));
    }

    #[test]
    fn missing_fields_fail_every_comparison_but_not_null() {
        let snapshot = sample_snapshot();
        for source in ["stage = null", "stage > 1", r#"stage != "x""#, r#"stage LIKE "%""#] {
            let expr = parse_condition(source).unwrap();
            assert!(!expr.matches(&snapshot), "{source}");
        }
        assert!(parse_condition("stage != null").unwrap().matches(&snapshot));
    }

    #[test]
    fn metric_threshold_becomes_comparison() {
        let snapshot = sample_snapshot();
        let metric = MetricThreshold {
            field: "score".into(),
            op: ">=".into(),
            value: json!(8),
        };
        assert!(metric.to_condition().unwrap().matches(&snapshot));

        let unknown = MetricThreshold {
            field: "score".into(),
            op: "~".into(),
            value: json!(8),
        };
        assert!(unknown.to_condition().is_err());
        let object = MetricThreshold {
            field: "score".into(),
            op: ">".into(),
            value: json!({"x": 1}),
        };
        assert!(object.to_condition().is_err());
    }
}
