//! The small expression language used by connection filters, input
//! mappings and stage tags.
//!
//! ```text
//! ref == 'refs/heads/main' && !draft
//! startsWith(ref, 'refs/tags/') || labels[0] in ['hotfix', 'urgent']
//! headers['X-GitHub-Event'] == 'push'
//! ```
//!
//! Expressions are parsed once and evaluated against an [`Environment`]
//! of JSON values. Referencing an unknown top-level name is an error, a
//! missing member evaluates to `null`.

mod eval;
mod lexer;
mod parser;

use serde_json::Value;

pub use eval::Environment;
pub use lexer::LexError;
pub use parser::ParseError;

use parser::{Expr, Parser};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExprError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("undefined identifier '{0}'")]
    UndefinedIdentifier(String),

    #[error("operator '{op}' cannot be applied to {found}")]
    TypeMismatch { op: String, found: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function}() takes {expected} argument(s), got {found}")]
    Arity { function: String, expected: usize, found: usize },

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("expression must evaluate to a bool, got {0}")]
    NotBoolean(String),
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = lexer::tokenize(source)?;
        let ast = Parser::new(tokens).parse()?;
        Ok(Self { source: source.to_string(), ast })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, env: &Environment) -> Result<Value, ExprError> {
        eval::evaluate(&self.ast, env)
    }

    /// Evaluate and require a bool result.
    pub fn evaluate_bool(&self, env: &Environment) -> Result<bool, ExprError> {
        match self.evaluate(env)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::NotBoolean(other.to_string())),
        }
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, env: &Environment) -> Result<Value, ExprError> {
    Expression::parse(source)?.evaluate(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push_env() -> Environment {
        Environment::from_object(&json!({
            "ref": "refs/heads/main",
            "draft": false,
            "commits": [{ "id": "a1", "author": "ci" }],
            "repository": { "name": "superplane", "stars": 42 },
            "labels": ["hotfix"],
        }))
    }

    fn eval(src: &str) -> Result<Value, ExprError> {
        evaluate(src, &push_env())
    }

    #[test]
    fn evaluates_comparisons_and_logic() {
        assert_eq!(eval("ref == 'refs/heads/main' && !draft"), Ok(json!(true)));
        assert_eq!(eval("repository.stars >= 40 and repository.stars < 50"), Ok(json!(true)));
        assert_eq!(eval("repository.stars == 42.0"), Ok(json!(true)));
        assert_eq!(eval("'hotfix' in labels || draft"), Ok(json!(true)));
        assert_eq!(eval("ref != 'refs/heads/main' or draft"), Ok(json!(false)));
    }

    #[test]
    fn evaluates_functions_and_access() {
        assert_eq!(eval("startsWith(ref, 'refs/heads/')"), Ok(json!(true)));
        assert_eq!(eval("ref.endsWith('/main')"), Ok(json!(true)));
        assert_eq!(eval("commits[0].id"), Ok(json!("a1")));
        assert_eq!(eval("len(commits) + 1"), Ok(json!(2)));
        assert_eq!(eval("upper(repository.name)"), Ok(json!("SUPERPLANE")));
        assert_eq!(eval("draft ? 'skip' : 'ship'"), Ok(json!("ship")));
        assert_eq!(eval("repository.name + '-' + 'v1'"), Ok(json!("superplane-v1")));
    }

    #[test]
    fn missing_members_are_null_but_unknown_names_fail() {
        assert_eq!(eval("repository.owner"), Ok(Value::Null));
        assert_eq!(eval("repository.owner.login"), Ok(Value::Null));
        assert_eq!(eval("commits[5]"), Ok(Value::Null));
        assert_eq!(eval("branch == 'main'"), Err(ExprError::UndefinedIdentifier("branch".into())));
    }

    #[test]
    fn type_errors_are_reported() {
        assert!(matches!(eval("ref && true"), Err(ExprError::TypeMismatch { .. })));
        assert!(matches!(eval("ref < 3"), Err(ExprError::TypeMismatch { .. })));
        assert!(matches!(eval("nope(ref)"), Err(ExprError::UnknownFunction(_))));
        assert!(matches!(eval("lower(ref, ref)"), Err(ExprError::Arity { .. })));
    }

    #[test]
    fn short_circuit_skips_the_right_side() {
        assert_eq!(eval("draft && missing.field"), Ok(json!(false)));
        assert_eq!(eval("!draft || missing.field"), Ok(json!(true)));
    }

    #[test]
    fn header_lookups_ignore_case() {
        let env = Environment::new()
            .with("headers", json!({ "x-github-event": "push" }))
            .case_insensitive_members();
        assert_eq!(evaluate("headers['X-GitHub-Event'] == 'push'", &env), Ok(json!(true)));

        let expr = Expression::parse("headers['x-github-event']").unwrap();
        assert!(matches!(expr.evaluate_bool(&env), Err(ExprError::NotBoolean(_))));
    }
}
