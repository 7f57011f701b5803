//! Tree-walking evaluator over `serde_json::Value`.

use serde_json::{Map, Value};

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::ExprError;

/// Variables visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: Map<String, Value>,
    case_insensitive_members: bool,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose every top-level key of a JSON object as a variable.
    pub fn from_object(object: &Value) -> Self {
        let vars = object.as_object().cloned().unwrap_or_default();
        Self { vars, case_insensitive_members: false }
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    /// Member lookups fall back to the lowercased key. Used for headers,
    /// which are stored lowercased.
    pub fn case_insensitive_members(mut self) -> Self {
        self.case_insensitive_members = true;
        self
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

pub fn evaluate(expr: &Expr, env: &Environment) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Identifier(name) => env
            .lookup(name)
            .cloned()
            .ok_or_else(|| ExprError::UndefinedIdentifier(name.clone())),
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Unary { op, operand } => {
            let value = evaluate(operand, env)?;
            match (op, &value) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Negate, Value::Number(_)) => number(-as_f64(&value)),
                _ => Err(mismatch(if *op == UnaryOp::Not { "!" } else { "-" }, &value)),
            }
        }
        Expr::Binary { op: BinaryOp::And, left, right } => {
            if !truthy("&&", &evaluate(left, env)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy("&&", &evaluate(right, env)?)?))
        }
        Expr::Binary { op: BinaryOp::Or, left, right } => {
            if truthy("||", &evaluate(left, env)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy("||", &evaluate(right, env)?)?))
        }
        Expr::Binary { op, left, right } => {
            let left = evaluate(left, env)?;
            let right = evaluate(right, env)?;
            binary(*op, &left, &right)
        }
        Expr::Ternary { condition, then, otherwise } => {
            if truthy("?:", &evaluate(condition, env)?)? {
                evaluate(then, env)
            } else {
                evaluate(otherwise, env)
            }
        }
        Expr::Member { object, property } => {
            let object = evaluate(object, env)?;
            member(&object, property, env.case_insensitive_members)
        }
        Expr::Index { object, index } => {
            let object = evaluate(object, env)?;
            let index = evaluate(index, env)?;
            match (&object, &index) {
                (Value::Array(items), Value::Number(n)) => Ok(n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned()
                    .unwrap_or(Value::Null)),
                (_, Value::String(key)) => member(&object, key, env.case_insensitive_members),
                _ => Err(mismatch("[]", &object)),
            }
        }
        Expr::Call { function, args } => {
            let args = args
                .iter()
                .map(|arg| evaluate(arg, env))
                .collect::<Result<Vec<_>, _>>()?;
            call(function, &args)
        }
    }
}

fn member(object: &Value, property: &str, case_insensitive: bool) -> Result<Value, ExprError> {
    match object {
        Value::Object(map) => {
            let found = map.get(property).or_else(|| {
                case_insensitive
                    .then(|| map.get(&property.to_lowercase()))
                    .flatten()
            });
            Ok(found.cloned().unwrap_or(Value::Null))
        }
        Value::Null => Ok(Value::Null),
        other => Err(mismatch(".", other)),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equals(left, right))),
        BinaryOp::NotEq => Ok(Value::Bool(!equals(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(_), Value::Number(_)) => as_f64(left).partial_cmp(&as_f64(right)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| mismatch(op_symbol(op), left))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::In => match right {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|item| equals(left, item)))),
            Value::Object(map) => match left {
                Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
                _ => Err(mismatch("in", left)),
            },
            Value::String(haystack) => match left {
                Value::String(needle) => Ok(Value::Bool(haystack.contains(needle.as_str()))),
                _ => Err(mismatch("in", left)),
            },
            _ => Err(mismatch("in", right)),
        },
        BinaryOp::Add => match (left, right) {
            (Value::Number(_), Value::Number(_)) => add_numbers(left, right),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => Err(mismatch("+", left)),
        },
        BinaryOp::Sub => match (left, right) {
            (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => Ok(a.checked_sub(b).map(Value::from).unwrap_or(Value::Null)),
                _ => number(as_f64(left) - as_f64(right)),
            },
            _ => Err(mismatch("-", left)),
        },
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuited in evaluate"),
    }
}

fn call(function: &str, args: &[Value]) -> Result<Value, ExprError> {
    match (function, args) {
        ("startsWith", [Value::String(s), Value::String(prefix)]) => {
            Ok(Value::Bool(s.starts_with(prefix.as_str())))
        }
        ("endsWith", [Value::String(s), Value::String(suffix)]) => {
            Ok(Value::Bool(s.ends_with(suffix.as_str())))
        }
        ("contains", [Value::String(s), Value::String(part)]) => {
            Ok(Value::Bool(s.contains(part.as_str())))
        }
        ("contains", [Value::Array(items), needle]) => {
            Ok(Value::Bool(items.iter().any(|item| equals(item, needle))))
        }
        ("matches", [Value::String(s), Value::String(pattern)]) => {
            let re = regex::Regex::new(pattern)
                .map_err(|e| ExprError::InvalidPattern(e.to_string()))?;
            Ok(Value::Bool(re.is_match(s)))
        }
        ("len" | "size", [value]) => match value {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            other => Err(mismatch(function, other)),
        },
        ("lower", [Value::String(s)]) => Ok(Value::String(s.to_lowercase())),
        ("upper", [Value::String(s)]) => Ok(Value::String(s.to_uppercase())),
        ("trim", [Value::String(s)]) => Ok(Value::String(s.trim().to_string())),
        ("string", [value]) => Ok(Value::String(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        (
            "startsWith" | "endsWith" | "contains" | "matches" | "len" | "size" | "lower"
            | "upper" | "trim" | "string",
            _,
        ) => {
            let expected = match function {
                "len" | "size" | "lower" | "upper" | "trim" | "string" => 1,
                _ => 2,
            };
            if args.len() != expected {
                return Err(ExprError::Arity { function: function.to_string(), expected, found: args.len() });
            }
            Err(mismatch(function, &args[0]))
        }
        _ => Err(ExprError::UnknownFunction(function.to_string())),
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => as_f64(left) == as_f64(right),
        _ => left == right,
    }
}

fn truthy(op: &str, value: &Value) -> Result<bool, ExprError> {
    value.as_bool().ok_or_else(|| mismatch(op, value))
}

fn add_numbers(left: &Value, right: &Value) -> Result<Value, ExprError> {
    match (left.as_i64(), right.as_i64()) {
        (Some(a), Some(b)) => Ok(a.checked_add(b).map(Value::from).unwrap_or(Value::Null)),
        _ => number(as_f64(left) + as_f64(right)),
    }
}

fn as_f64(value: &Value) -> f64 {
    value.as_f64().unwrap_or(f64::NAN)
}

fn number(value: f64) -> Result<Value, ExprError> {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| ExprError::TypeMismatch { op: "arithmetic".into(), found: "NaN".into() })
}

fn mismatch(op: &str, value: &Value) -> ExprError {
    let found = match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    };
    ExprError::TypeMismatch { op: op.to_string(), found: found.to_string() }
}

fn op_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        _ => ">=",
    }
}
