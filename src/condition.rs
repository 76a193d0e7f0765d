//! Condition expression language for stage gating.
//!
//! Stages may carry a `condition` evaluated against the accumulated pipeline
//! state, e.g. `stages.build.status == "success" && stages.build.outputs.deploy == "yes"`.
//! The language is a small boolean expression grammar over comparison and
//! logical operators — parsed with a hand-written tokenizer and recursive
//! descent, never by evaluating host-language strings.
//!
//! The evaluator is total: syntax errors surface at load time through
//! [`parse`], and runtime lookup misses evaluate to `false`.

use crate::state::{PipelineState, StageStatus};
use std::fmt;

/// A runtime value in the condition language.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Resolves dotted paths (`stages.build.status`) to values.
pub trait Lookup {
    fn lookup(&self, path: &[String]) -> Option<Value>;
}

impl Expr {
    /// Evaluate against a lookup context. Missing paths resolve to `false`.
    pub fn evaluate(&self, ctx: &dyn Lookup) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(path) => ctx.lookup(path).unwrap_or(Value::Bool(false)),
            Expr::Not(inner) => Value::Bool(!inner.evaluate(ctx).truthy()),
            Expr::And(lhs, rhs) => {
                Value::Bool(lhs.evaluate(ctx).truthy() && rhs.evaluate(ctx).truthy())
            }
            Expr::Or(lhs, rhs) => {
                Value::Bool(lhs.evaluate(ctx).truthy() || rhs.evaluate(ctx).truthy())
            }
            Expr::Cmp { op, lhs, rhs } => {
                Value::Bool(compare(*op, &lhs.evaluate(ctx), &rhs.evaluate(ctx)))
            }
        }
    }

    /// Evaluate to a boolean via truthiness.
    pub fn evaluate_bool(&self, ctx: &dyn Lookup) -> bool {
        self.evaluate(ctx).truthy()
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (lhs, rhs) {
        (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        // Mismatched types: only equality is defined.
        _ => {
            return match op {
                CmpOp::Eq => false,
                CmpOp::Ne => true,
                _ => false,
            };
        }
    };

    let Some(ordering) = ordering else {
        // NaN comparisons are never true except !=.
        return op == CmpOp::Ne;
    };

    match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Num(f64),
    Str(String),
    True,
    False,
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(format!("unexpected '&' at position {i}"));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(format!("unexpected '|' at position {i}"));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(format!("unexpected '=' at position {i} (use '==')"));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || chars[i] == '_'
                        || chars[i] == '-'
                        || chars[i] == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                match text.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    _ => tokens.push(Token::Ident(text)),
                }
            }
            other => return Err(format!("unexpected character '{other}' at position {i}")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    // or := and ("||" and)*
    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // and := unary ("&&" unary)*
    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // unary := "!" unary | comparison
    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Bang) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    // comparison := primary (cmp_op primary)?
    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let lhs = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => CmpOp::Eq,
            Some(Token::NotEq) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_primary()?;
        Ok(Expr::Cmp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    // primary := literal | path | "(" or ")"
    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Num(n)) => Ok(Expr::Literal(Value::Num(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Ident(path)) => Ok(Expr::Path(
                path.split('.').map(|s| s.to_string()).collect(),
            )),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

/// Parse a condition expression. Errors here are load-time validation errors.
pub fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("empty condition".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!(
            "trailing tokens after expression: {:?}",
            &parser.tokens[parser.pos..]
        ));
    }
    Ok(expr)
}

/// Lookup over the accumulated pipeline state.
///
/// Supported paths:
/// - `stages.<name>.status`
/// - `stages.<name>.outputs.<key>`
/// - `stages.<name>.tokenUsage.<field>`
/// - `pipeline.status`
pub struct StateLookup<'a> {
    pub state: &'a PipelineState,
}

impl Lookup for StateLookup<'_> {
    fn lookup(&self, path: &[String]) -> Option<Value> {
        match path.first().map(String::as_str) {
            Some("pipeline") => match path.get(1).map(String::as_str) {
                Some("status") => Some(Value::Str(self.state.status.as_str().to_string())),
                Some("name") => Some(Value::Str(self.state.pipeline_config.name.clone())),
                _ => None,
            },
            Some("stages") => {
                let name = path.get(1)?;
                let execution = self
                    .state
                    .stages
                    .iter()
                    .rev()
                    .find(|e| &e.stage_name == name)?;
                match path.get(2).map(String::as_str) {
                    Some("status") => Some(Value::Str(execution.status.as_str().to_string())),
                    Some("succeeded") => {
                        Some(Value::Bool(execution.status == StageStatus::Success))
                    }
                    Some("outputs") => {
                        let key = path.get(3)?;
                        let data = execution.extracted_data.as_ref()?;
                        json_to_value(data.get(key)?)
                    }
                    Some("tokenUsage") => {
                        let field = path.get(3)?;
                        let usage = execution.token_usage.as_ref()?;
                        usage.field(field).map(|n| Value::Num(n as f64))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

fn json_to_value(json: &serde_json::Value) -> Option<Value> {
    match json {
        serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
        serde_json::Value::Number(n) => n.as_f64().map(Value::Num),
        serde_json::Value::String(s) => Some(Value::Str(s.clone())),
        other => Some(Value::Str(other.to_string())),
    }
}

/// Parse and evaluate a condition against pipeline state in one step.
///
/// Returns `Err` only for syntax errors; lookup misses evaluate to `false`.
pub fn evaluate_condition(source: &str, state: &PipelineState) -> Result<bool, String> {
    let expr = parse(source)?;
    Ok(expr.evaluate_bool(&StateLookup { state }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapLookup(HashMap<String, Value>);

    impl Lookup for MapLookup {
        fn lookup(&self, path: &[String]) -> Option<Value> {
            self.0.get(&path.join(".")).cloned()
        }
    }

    fn ctx(pairs: &[(&str, Value)]) -> MapLookup {
        MapLookup(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn parses_literals() {
        assert_eq!(parse("true").unwrap(), Expr::Literal(Value::Bool(true)));
        assert_eq!(parse("42").unwrap(), Expr::Literal(Value::Num(42.0)));
        assert_eq!(
            parse("\"ok\"").unwrap(),
            Expr::Literal(Value::Str("ok".into()))
        );
    }

    #[test]
    fn parses_path_with_dashes() {
        let expr = parse("stages.code-review.status").unwrap();
        assert_eq!(
            expr,
            Expr::Path(vec!["stages".into(), "code-review".into(), "status".into()])
        );
    }

    #[test]
    fn rejects_syntax_errors() {
        assert!(parse("").is_err());
        assert!(parse("a &&").is_err());
        assert!(parse("a = b").is_err());
        assert!(parse("(a || b").is_err());
        assert!(parse("a b").is_err());
    }

    #[test]
    fn equality_on_strings() {
        let lookup = ctx(&[("stages.build.status", Value::Str("success".into()))]);
        let expr = parse("stages.build.status == \"success\"").unwrap();
        assert!(expr.evaluate_bool(&lookup));

        let expr = parse("stages.build.status != 'failed'").unwrap();
        assert!(expr.evaluate_bool(&lookup));
    }

    #[test]
    fn numeric_comparisons() {
        let lookup = ctx(&[("stages.a.tokenUsage.output", Value::Num(1500.0))]);
        assert!(parse("stages.a.tokenUsage.output > 1000")
            .unwrap()
            .evaluate_bool(&lookup));
        assert!(!parse("stages.a.tokenUsage.output <= 1000")
            .unwrap()
            .evaluate_bool(&lookup));
        assert!(parse("stages.a.tokenUsage.output >= 1500")
            .unwrap()
            .evaluate_bool(&lookup));
    }

    #[test]
    fn logical_operators_and_precedence() {
        let lookup = ctx(&[
            ("a", Value::Bool(true)),
            ("b", Value::Bool(false)),
            ("c", Value::Bool(true)),
        ]);
        // && binds tighter than ||
        assert!(parse("b && c || a").unwrap().evaluate_bool(&lookup));
        assert!(!parse("b && (c || a)").unwrap().evaluate_bool(&lookup));
        assert!(parse("!b").unwrap().evaluate_bool(&lookup));
        assert!(parse("a && !b && c").unwrap().evaluate_bool(&lookup));
    }

    #[test]
    fn missing_lookup_is_false() {
        let lookup = ctx(&[]);
        assert!(!parse("stages.ghost.status == \"success\"")
            .unwrap()
            .evaluate_bool(&lookup));
        // Negation of a missing path is true: lookup miss yields false.
        assert!(parse("!stages.ghost.outputs.flag")
            .unwrap()
            .evaluate_bool(&lookup));
    }

    #[test]
    fn mismatched_types_equality() {
        let lookup = ctx(&[("n", Value::Num(1.0))]);
        assert!(!parse("n == \"1\"").unwrap().evaluate_bool(&lookup));
        assert!(parse("n != \"1\"").unwrap().evaluate_bool(&lookup));
        assert!(!parse("n < \"2\"").unwrap().evaluate_bool(&lookup));
    }

    #[test]
    fn evaluator_is_stateless() {
        let lookup = ctx(&[("x", Value::Num(3.0))]);
        let expr = parse("x > 2").unwrap();
        assert!(expr.evaluate_bool(&lookup));
        assert!(expr.evaluate_bool(&lookup));
    }
}
