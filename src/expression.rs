//! Boundary to the expression language.
//!
//! The engine only needs `evaluate(expression, scope) -> value`. Parsing is
//! delegated to an [`Evaluator`]; [`PathEvaluator`] is a minimal default that
//! understands literals and dotted paths.

use std::fmt;
use std::sync::Arc;

use crate::error::ScopeError;
use crate::scope::Scope;
use crate::value::Value;

/// Extra bindings consulted before scope data when evaluating an expression.
pub type Locals = ahash::AHashMap<String, Value>;

type EvalFn = dyn Fn(&Scope, Option<&Locals>) -> Value + Send + Sync;
type GetFn = dyn Fn(&Scope) -> Value + Send + Sync;

/// A parsed expression.
#[derive(Clone)]
pub struct Expression {
    source: Arc<str>,
    constant: bool,
    literal: bool,
    one_time: bool,
    eval: Arc<EvalFn>,
}

impl Expression {
    /// Wrap an evaluation function.
    pub fn new<F>(source: impl Into<Arc<str>>, eval: F) -> Self
    where
        F: Fn(&Scope, Option<&Locals>) -> Value + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            constant: false,
            literal: false,
            one_time: false,
            eval: Arc::new(eval),
        }
    }

    /// Mark the expression as constant: it never changes once evaluated.
    pub fn with_constant(mut self, constant: bool) -> Self {
        self.constant = constant;
        self
    }

    /// Mark the expression as a literal.
    pub fn with_literal(mut self, literal: bool) -> Self {
        self.literal = literal;
        self
    }

    /// Mark the expression as one-time bound.
    pub fn with_one_time(mut self, one_time: bool) -> Self {
        self.one_time = one_time;
        self
    }

    /// Source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True for expressions whose value never changes.
    pub fn is_constant(&self) -> bool {
        self.constant
    }

    /// True for literal expressions.
    pub fn is_literal(&self) -> bool {
        self.literal
    }

    /// True for `::`-prefixed expressions.
    pub fn is_one_time(&self) -> bool {
        self.one_time
    }

    /// Evaluate against a scope.
    pub fn evaluate(&self, scope: &Scope, locals: Option<&Locals>) -> Value {
        (self.eval)(scope, locals)
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("source", &self.source)
            .field("constant", &self.constant)
            .field("literal", &self.literal)
            .field("one_time", &self.one_time)
            .finish()
    }
}

/// Parses expression source into an [`Expression`].
pub trait Evaluator: Send + Sync + 'static {
    /// Parse `source`.
    fn parse(&self, source: &str) -> Result<Expression, ScopeError>;
}

/// Default evaluator: literals, dotted paths and the `::` one-time prefix.
///
/// - `42`, `-1.5`, `'text'`, `"text"`, `true`, `false`, `null`, `undefined`
/// - `user.name` reads `user` from locals, then from the scope, then walks map fields
/// - an empty source is a constant `undefined`
#[derive(Debug, Clone, Copy, Default)]
pub struct PathEvaluator;

impl PathEvaluator {
    fn parse_literal(body: &str) -> Option<Value> {
        match body {
            "true" => return Some(Value::Bool(true)),
            "false" => return Some(Value::Bool(false)),
            "null" => return Some(Value::Null),
            "undefined" => return Some(Value::Undefined),
            _ => {}
        }
        for quote in ['\'', '"'] {
            if body.len() >= 2 && body.starts_with(quote) && body.ends_with(quote) {
                let inner = &body[1..body.len() - 1];
                if !inner.contains(quote) {
                    return Some(Value::from(inner));
                }
            }
        }
        let digits = body.strip_prefix('-').unwrap_or(body);
        let looks_numeric = digits
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit() || c == '.')
            && digits
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
        if looks_numeric {
            return body.parse::<f64>().ok().map(Value::Number);
        }
        None
    }

    fn is_identifier(segment: &str) -> bool {
        let mut chars = segment.chars();
        chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    }
}

impl Evaluator for PathEvaluator {
    fn parse(&self, source: &str) -> Result<Expression, ScopeError> {
        let trimmed = source.trim();
        let (one_time, body) = match trimmed.strip_prefix("::") {
            Some(rest) => (true, rest.trim()),
            None => (false, trimmed),
        };

        if body.is_empty() {
            return Ok(Expression::new(source, |_, _| Value::Undefined)
                .with_constant(true)
                .with_one_time(one_time));
        }

        if let Some(value) = Self::parse_literal(body) {
            return Ok(Expression::new(source, move |_, _| value.clone())
                .with_constant(true)
                .with_literal(true)
                .with_one_time(one_time));
        }

        let mut segments: Vec<String> = body.split('.').map(|s| s.trim().to_string()).collect();
        if let Some(bad) = segments.iter().find(|s| !Self::is_identifier(s)) {
            return Err(ScopeError::Parse {
                expression: source.to_string(),
                message: format!("unexpected token `{}`", bad),
            });
        }
        let head = segments.remove(0);

        Ok(Expression::new(source, move |scope, locals| {
            let mut value = match locals.and_then(|l| l.get(&head)) {
                Some(local) => local.clone(),
                None => scope.get(&head),
            };
            for segment in &segments {
                value = value.field(segment);
            }
            value
        })
        .with_one_time(one_time))
    }
}

/// The value-producing half of a watch.
///
/// Built from a closure or from a parsed [`Expression`].
#[derive(Clone)]
pub struct Getter {
    description: Arc<str>,
    constant: bool,
    literal: bool,
    one_time: bool,
    get: Arc<GetFn>,
}

impl Getter {
    /// Wrap a closure.
    pub fn new<F>(get: F) -> Self
    where
        F: Fn(&Scope) -> Value + Send + Sync + 'static,
    {
        Self {
            description: Arc::from("fn"),
            constant: false,
            literal: false,
            one_time: false,
            get: Arc::new(get),
        }
    }

    /// Name shown in digest diagnostics.
    pub fn named(mut self, description: impl Into<Arc<str>>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare the value constant; the watch is dropped after its first evaluation.
    pub fn constant(mut self) -> Self {
        self.constant = true;
        self
    }

    /// Declare the watch one-time; it is dropped once its value settles defined.
    pub fn one_time(mut self) -> Self {
        self.one_time = true;
        self
    }

    /// Diagnostic name.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// True if declared constant.
    pub fn is_constant(&self) -> bool {
        self.constant
    }

    /// True if declared one-time.
    pub fn is_one_time(&self) -> bool {
        self.one_time
    }

    /// True if produced from a literal expression.
    pub fn is_literal(&self) -> bool {
        self.literal
    }

    /// Compute the current value.
    pub fn get(&self, scope: &Scope) -> Value {
        (self.get)(scope)
    }
}

impl fmt::Debug for Getter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Getter")
            .field("description", &self.description)
            .field("constant", &self.constant)
            .field("one_time", &self.one_time)
            .finish()
    }
}

impl From<Expression> for Getter {
    fn from(expression: Expression) -> Self {
        let description = expression.source.clone();
        let constant = expression.constant;
        let literal = expression.literal;
        let one_time = expression.one_time;
        Self {
            description,
            constant,
            literal,
            one_time,
            get: Arc::new(move |scope| expression.evaluate(scope, None)),
        }
    }
}

impl<F> From<F> for Getter
where
    F: Fn(&Scope) -> Value + Send + Sync + 'static,
{
    fn from(get: F) -> Self {
        Getter::new(get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literals_are_constant() {
        let root = Scope::new_root();
        for (source, expected) in [
            ("42", Value::from(42)),
            ("-1.5", Value::from(-1.5)),
            ("'hi'", Value::from("hi")),
            ("\"hi\"", Value::from("hi")),
            ("true", Value::from(true)),
            ("null", Value::Null),
        ] {
            let expr = PathEvaluator.parse(source).unwrap();
            assert!(expr.is_constant(), "{} should be constant", source);
            assert_eq!(expr.evaluate(&root, None), expected);
        }
    }

    #[test]
    fn test_path_reads_locals_first() {
        let root = Scope::new_root();
        root.set("user", Value::map([("name", "scope")])).unwrap();
        let expr = PathEvaluator.parse("user.name").unwrap();
        assert!(!expr.is_constant());
        assert_eq!(expr.evaluate(&root, None), Value::from("scope"));

        let mut locals = Locals::default();
        locals.insert("user".to_string(), Value::map([("name", "local")]));
        assert_eq!(expr.evaluate(&root, Some(&locals)), Value::from("local"));
    }

    #[test]
    fn test_one_time_prefix() {
        let expr = PathEvaluator.parse("::name").unwrap();
        assert!(expr.is_one_time());
        assert!(!expr.is_constant());
        assert_eq!(expr.source(), "::name");
    }

    #[test]
    fn test_rejects_garbage() {
        let err = PathEvaluator.parse("a + b").unwrap_err();
        assert!(matches!(err, ScopeError::Parse { .. }));
        assert!(PathEvaluator.parse("a..b").is_err());
    }

    #[test]
    fn test_nan_is_not_a_number_literal() {
        let expr = PathEvaluator.parse("NaN").unwrap();
        assert!(!expr.is_constant());
    }
}
