//! A small path-expression engine.
//!
//! Search parameter extraction and topic trigger criteria both need a
//! compiled `(node, context) -> sequence<node>` callable. The supported
//! subset is documented on [`PathExpression::compile`]; anything outside it
//! fails at compile time, never at evaluation time.

use crate::context::EvalContext;
use crate::error::{CoreError, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Var(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Dot,
    LParen,
    RParen,
    Op(CmpOp),
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone)]
enum Expr {
    Path(Path),
    Literal(Value),
    Compare {
        lhs: Box<Expr>,
        op: CmpOp,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
struct Path {
    root: Root,
    steps: Vec<Step>,
}

#[derive(Debug, Clone)]
enum Root {
    Context,
    Var(String),
}

#[derive(Debug, Clone)]
enum Step {
    Member(String),
    Where(Box<Expr>),
    Exists,
    Empty,
    First,
    Not,
}

/// A compiled path expression.
#[derive(Debug, Clone)]
pub struct PathExpression {
    expr: Expr,
    source: String,
}

impl PathExpression {
    /// Compile an expression. The supported grammar:
    ///
    /// - rooted variables `%current`, `%previous`, `%resource`;
    /// - an optional leading type name, matched against `resourceType`;
    /// - dotted member access, flattening arrays at every step;
    /// - `where(<expression>)` element filters;
    /// - terminal functions `exists()`, `empty()`, `first()`, `not()`;
    /// - comparisons `=` `!=` `>` `<` `>=` `<=` against literals;
    /// - `and` / `or` conjunction of boolean sub-expressions;
    /// - parenthesized grouping.
    pub fn compile(source: &str) -> Result<Self> {
        let tokens = tokenize(source)
            .map_err(|msg| CoreError::invalid_expression(source, msg))?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser
            .parse_expression()
            .map_err(|msg| CoreError::invalid_expression(source, msg))?;
        if parser.pos != parser.tokens.len() {
            return Err(CoreError::invalid_expression(source, "trailing input"));
        }
        Ok(Self {
            expr,
            source: source.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a node. Unmatched paths yield the empty sequence;
    /// evaluation itself never fails.
    pub fn evaluate(&self, node: &Value, ctx: &EvalContext) -> Vec<Value> {
        eval_expr(&self.expr, node, ctx)
    }

    /// The path gate of the trigger pipeline: non-empty result whose first
    /// element is the boolean `true`.
    pub fn evaluate_boolean(&self, node: &Value, ctx: &EvalContext) -> bool {
        matches!(
            self.evaluate(node, ctx).first(),
            Some(Value::Bool(true))
        )
    }
}

fn tokenize(source: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some('\\') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err("unterminated string literal".into()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '%' => {
                i += 1;
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if start == i {
                    return Err("empty variable name".into());
                }
                tokens.push(Token::Var(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // a dot followed by a non-digit is a member access
                    if chars[i] == '.'
                        && !chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false)
                    {
                        break;
                    }
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
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => return Err(format!("unexpected character '{other}'")),
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

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> std::result::Result<(), String> {
        match self.next() {
            Some(ref tok) if tok == expected => Ok(()),
            other => Err(format!("expected {expected:?}, found {other:?}")),
        }
    }

    fn parse_expression(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.parse_comparison()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let rhs = self.parse_comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> std::result::Result<Expr, String> {
        let lhs = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_primary()?;
            return Ok(Expr::Compare {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> std::result::Result<Expr, String> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.next();
                let inner = self.parse_expression()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Str(s)) => {
                self.next();
                Ok(Expr::Literal(Value::String(s)))
            }
            Some(Token::Num(n)) => {
                self.next();
                Ok(Expr::Literal(
                    serde_json::Number::from_f64(n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null),
                ))
            }
            Some(Token::Bool(b)) => {
                self.next();
                Ok(Expr::Literal(Value::Bool(b)))
            }
            Some(Token::Var(name)) => {
                self.next();
                let steps = self.parse_steps()?;
                Ok(Expr::Path(Path {
                    root: Root::Var(name),
                    steps,
                }))
            }
            Some(Token::Ident(_)) => {
                let steps = self.parse_steps()?;
                if steps.is_empty() {
                    return Err("expected a path".into());
                }
                Ok(Expr::Path(Path {
                    root: Root::Context,
                    steps,
                }))
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    /// Steps following a root; the leading dot is absent for the first
    /// identifier of a context-rooted path.
    fn parse_steps(&mut self) -> std::result::Result<Vec<Step>, String> {
        let mut steps = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Ident(_)) if steps.is_empty() => {}
                Some(Token::Dot) => {
                    self.next();
                }
                _ => break,
            }
            let Some(Token::Ident(name)) = self.next() else {
                return Err("expected identifier after '.'".into());
            };
            if matches!(self.peek(), Some(Token::LParen)) {
                self.next();
                let step = match name.as_str() {
                    "where" => {
                        let inner = self.parse_expression()?;
                        Step::Where(Box::new(inner))
                    }
                    "exists" => Step::Exists,
                    "empty" => Step::Empty,
                    "first" => Step::First,
                    "not" => Step::Not,
                    other => return Err(format!("unsupported function '{other}'")),
                };
                self.expect(&Token::RParen)?;
                steps.push(step);
            } else {
                steps.push(Step::Member(name));
            }
        }
        Ok(steps)
    }
}

fn eval_expr(expr: &Expr, node: &Value, ctx: &EvalContext) -> Vec<Value> {
    match expr {
        Expr::Literal(v) => vec![v.clone()],
        Expr::Path(path) => eval_path(path, node, ctx),
        Expr::Compare { lhs, op, rhs } => {
            let left = eval_expr(lhs, node, ctx);
            let right = eval_expr(rhs, node, ctx);
            let matched = left
                .iter()
                .any(|l| right.iter().any(|r| compare_values(l, r, *op)));
            vec![Value::Bool(matched)]
        }
        Expr::And(a, b) => {
            let result = truthy(&eval_expr(a, node, ctx)) && truthy(&eval_expr(b, node, ctx));
            vec![Value::Bool(result)]
        }
        Expr::Or(a, b) => {
            let result = truthy(&eval_expr(a, node, ctx)) || truthy(&eval_expr(b, node, ctx));
            vec![Value::Bool(result)]
        }
    }
}

fn eval_path(path: &Path, node: &Value, ctx: &EvalContext) -> Vec<Value> {
    let mut seq: Vec<Value> = match &path.root {
        Root::Context => vec![node.clone()],
        Root::Var(name) => match ctx.var(name) {
            Some(v) => vec![v.clone()],
            None => return Vec::new(),
        },
    };

    for (index, step) in path.steps.iter().enumerate() {
        match step {
            Step::Member(name) => {
                // A leading identifier that names the node's type keeps the
                // node itself: `Patient.name` rooted at a Patient.
                if index == 0
                    && matches!(path.root, Root::Context)
                    && seq.len() == 1
                    && seq[0].get("resourceType").and_then(Value::as_str) == Some(name.as_str())
                {
                    continue;
                }
                let mut next = Vec::new();
                for item in &seq {
                    if let Some(value) = item.get(name) {
                        match value {
                            Value::Array(items) => next.extend(items.iter().cloned()),
                            Value::Null => {}
                            other => next.push(other.clone()),
                        }
                    }
                }
                seq = next;
            }
            Step::Where(inner) => {
                seq.retain(|item| truthy(&eval_expr(inner, item, ctx)));
            }
            Step::Exists => {
                seq = vec![Value::Bool(!seq.is_empty())];
            }
            Step::Empty => {
                seq = vec![Value::Bool(seq.is_empty())];
            }
            Step::First => {
                seq.truncate(1);
            }
            Step::Not => {
                let value = match seq.first() {
                    Some(Value::Bool(b)) => !*b,
                    _ => seq.is_empty(),
                };
                seq = vec![Value::Bool(value)];
            }
        }
    }
    seq
}

fn truthy(seq: &[Value]) -> bool {
    match seq.first() {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => true,
    }
}

fn compare_values(left: &Value, right: &Value, op: CmpOp) -> bool {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => {
            // Numeric-looking strings compare numerically, which covers
            // version ids and quantity values.
            match (a.parse::<f64>(), b.parse::<f64>()) {
                (Ok(a), Ok(b)) => a.partial_cmp(&b),
                _ => Some(a.cmp(b)),
            }
        }
        (Value::Number(a), Value::String(b)) => a
            .as_f64()
            .zip(b.parse::<f64>().ok())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::Number(b)) => a
            .parse::<f64>()
            .ok()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match (ordering, op) {
        (Some(Ordering::Equal), CmpOp::Eq | CmpOp::Ge | CmpOp::Le) => true,
        (Some(Ordering::Less), CmpOp::Lt | CmpOp::Le | CmpOp::Ne) => true,
        (Some(Ordering::Greater), CmpOp::Gt | CmpOp::Ge | CmpOp::Ne) => true,
        (None, CmpOp::Ne) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patient() -> Value {
        json!({
            "resourceType": "Patient",
            "id": "p1",
            "active": true,
            "gender": "female",
            "name": [
                {"use": "official", "family": "Smith", "given": ["Anna", "Maria"]},
                {"use": "nickname", "given": ["Annie"]}
            ],
            "multipleBirthInteger": 2
        })
    }

    fn eval(expr: &str, node: &Value) -> Vec<Value> {
        PathExpression::compile(expr)
            .unwrap()
            .evaluate(node, &EvalContext::new())
    }

    #[test]
    fn member_access_flattens_arrays() {
        let values = eval("name.given", &patient());
        assert_eq!(values, vec![json!("Anna"), json!("Maria"), json!("Annie")]);
    }

    #[test]
    fn leading_type_name_is_skipped() {
        assert_eq!(eval("Patient.gender", &patient()), vec![json!("female")]);
        // Wrong type roots to nothing.
        assert!(eval("Observation.status", &patient()).is_empty());
    }

    #[test]
    fn where_filters_elements() {
        let values = eval("name.where(use = 'official').family", &patient());
        assert_eq!(values, vec![json!("Smith")]);
    }

    #[test]
    fn exists_and_empty() {
        assert_eq!(eval("name.exists()", &patient()), vec![json!(true)]);
        assert_eq!(eval("photo.exists()", &patient()), vec![json!(false)]);
        assert_eq!(eval("photo.empty()", &patient()), vec![json!(true)]);
    }

    #[test]
    fn first_truncates() {
        assert_eq!(eval("name.given.first()", &patient()), vec![json!("Anna")]);
    }

    #[test]
    fn comparisons_produce_booleans() {
        assert_eq!(eval("gender = 'female'", &patient()), vec![json!(true)]);
        assert_eq!(eval("gender = 'male'", &patient()), vec![json!(false)]);
        assert_eq!(eval("multipleBirthInteger >= 2", &patient()), vec![json!(true)]);
        assert_eq!(eval("multipleBirthInteger > 2", &patient()), vec![json!(false)]);
    }

    #[test]
    fn and_or_combine() {
        assert_eq!(
            eval("gender = 'female' and active = true", &patient()),
            vec![json!(true)]
        );
        assert_eq!(
            eval("gender = 'male' or active = true", &patient()),
            vec![json!(true)]
        );
        assert_eq!(
            eval("gender = 'male' and active = true", &patient()),
            vec![json!(false)]
        );
    }

    #[test]
    fn variables_root_the_path() {
        let ctx = EvalContext::new().with_var("current", patient());
        let expr = PathExpression::compile("%current.gender = 'female'").unwrap();
        assert!(expr.evaluate_boolean(&json!({}), &ctx));

        let expr = PathExpression::compile("%previous.gender = 'female'").unwrap();
        assert!(!expr.evaluate_boolean(&json!({}), &ctx));
    }

    #[test]
    fn boolean_gate_requires_leading_true() {
        let expr = PathExpression::compile("name.given").unwrap();
        // Non-empty but not a boolean: the gate stays closed.
        assert!(!expr.evaluate_boolean(&patient(), &EvalContext::new()));
        let expr = PathExpression::compile("active = true").unwrap();
        assert!(expr.evaluate_boolean(&patient(), &EvalContext::new()));
    }

    #[test]
    fn numeric_strings_compare_numerically() {
        let node = json!({"resourceType": "Basic", "count": "10"});
        assert_eq!(eval("count > 9", &node), vec![json!(true)]);
    }

    #[test]
    fn compile_errors() {
        assert!(PathExpression::compile("name.").is_err());
        assert!(PathExpression::compile("name.unknownFn()").is_err());
        assert!(PathExpression::compile("'unterminated").is_err());
        assert!(PathExpression::compile("a = 'x' garbage'").is_err());
    }

    #[test]
    fn unmatched_paths_are_empty_not_errors() {
        assert!(eval("contact.telecom.value", &patient()).is_empty());
    }
}
