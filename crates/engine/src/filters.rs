//! Connection filters.

use serde_json::{Map, Value};

use crate::expr::{Environment, Expression};
use crate::models::{Connection, Filter, FilterOperator};
use crate::EngineError;

/// The parts of a raw event filters and expressions look at.
#[derive(Debug, Clone, PartialEq)]
pub struct EventView {
    pub payload: Value,
    pub headers: Value,
}

impl EventView {
    /// A body that is not JSON is seen as `null`; data expressions
    /// against it fail while header filters still work.
    pub fn new(raw: &[u8], headers: &Value) -> Self {
        let headers = match headers {
            Value::Object(map) => Value::Object(
                map.iter().map(|(k, v)| (k.to_lowercase(), v.clone())).collect::<Map<_, _>>(),
            ),
            _ => Value::Object(Map::new()),
        };
        Self { payload: serde_json::from_slice(raw).unwrap_or(Value::Null), headers }
    }

    /// Payload keys as variables, plus `headers`.
    pub fn data_environment(&self) -> Environment {
        let env = Environment::from_object(&self.payload);
        if self.payload.get("headers").is_some() {
            env
        } else {
            env.with("headers", Value::Object(Map::new()))
        }
    }

    pub fn header_environment(&self) -> Environment {
        Environment::new().with("headers", self.headers.clone()).case_insensitive_members()
    }

    /// Evaluate a data expression and return it.
    pub fn evaluate(&self, expression: &str) -> Result<Value, EngineError> {
        Expression::parse(expression)
            .and_then(|expr| expr.evaluate(&self.data_environment()))
            .map_err(|source| EngineError::Expression { expression: expression.to_string(), source })
    }
}

impl Filter {
    pub fn expression(&self) -> &str {
        match self {
            Filter::Data { expression } | Filter::Header { expression } => expression,
        }
    }

    pub fn evaluate(&self, event: &EventView) -> Result<bool, EngineError> {
        let env = match self {
            Filter::Data { .. } => event.data_environment(),
            Filter::Header { .. } => event.header_environment(),
        };
        Expression::parse(self.expression())
            .and_then(|expr| expr.evaluate_bool(&env))
            .map_err(|source| EngineError::Expression {
                expression: self.expression().to_string(),
                source,
            })
    }
}

impl Connection {
    /// Whether the event passes this connection's filters. No filters
    /// means pass; an evaluation error is returned, not swallowed.
    pub fn accepts(&self, event: &EventView) -> Result<bool, EngineError> {
        if self.filters.is_empty() {
            return Ok(true);
        }
        match self.filter_operator {
            FilterOperator::And => {
                for filter in &self.filters {
                    if !filter.evaluate(event)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            FilterOperator::Or => {
                for filter in &self.filters {
                    if filter.evaluate(event)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::models::SourceType;
    use serde_json::json;
    use uuid::Uuid;

    fn connection(operator: FilterOperator, filters: Vec<Filter>) -> Connection {
        Connection {
            name: "gh".into(),
            source_id: Uuid::new_v4(),
            source_type: SourceType::EventSource,
            filter_operator: operator,
            filters,
        }
    }

    fn data(expression: &str) -> Filter {
        Filter::Data { expression: expression.into() }
    }

    fn push() -> EventView {
        EventView::new(
            br#"{"ref":"refs/heads/main","draft":false}"#,
            &json!({ "X-GitHub-Event": "push" }),
        )
    }

    #[test]
    fn no_filters_pass() {
        assert!(connection(FilterOperator::And, vec![]).accepts(&push()).unwrap());
    }

    #[test]
    fn operators_combine_filters() {
        let filters = vec![data("ref == 'refs/heads/main'"), data("draft")];
        assert!(!connection(FilterOperator::And, filters.clone()).accepts(&push()).unwrap());
        assert!(connection(FilterOperator::Or, filters).accepts(&push()).unwrap());
    }

    #[test]
    fn header_filters_see_lowercased_headers() {
        let filter = Filter::Header { expression: "headers['X-GitHub-Event'] == 'push'".into() };
        assert!(filter.evaluate(&push()).unwrap());
        let filter = Filter::Header { expression: "headers['x-github-event'] == 'push'".into() };
        assert!(filter.evaluate(&push()).unwrap());
    }

    #[test]
    fn evaluation_errors_surface() {
        let conn = connection(FilterOperator::And, vec![data("branch == 'main'")]);
        assert!(matches!(conn.accepts(&push()), Err(EngineError::Expression { .. })));

        let conn = connection(FilterOperator::And, vec![data("ref")]);
        assert!(conn.accepts(&push()).is_err());

        let not_json = EventView::new(b"plain text", &json!({}));
        assert!(connection(FilterOperator::And, vec![data("ref == 'x'")]).accepts(&not_json).is_err());
    }
}
