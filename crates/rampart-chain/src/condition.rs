//! Selector and rule conditions.

use crate::request::InboundRequest;
use serde::{Deserialize, Serialize};

/// How a list of conditions combines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    And,
    Or,
}

impl MatchMode {
    /// Evaluate `conditions` against a request. An empty list matches.
    pub fn evaluate(&self, conditions: &[Condition], request: &InboundRequest) -> bool {
        if conditions.is_empty() {
            return true;
        }
        match self {
            MatchMode::And => conditions.iter().all(|c| c.matches(request)),
            MatchMode::Or => conditions.iter().any(|c| c.matches(request)),
        }
    }
}

/// The part of the request a condition looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Path,
    Method,
    /// Header named by [`Condition::key`].
    Header,
    /// Query parameter named by [`Condition::key`].
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
    /// Segment glob: `*` matches one segment, `**` any number of them.
    PathPattern,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub field: Field,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub operator: Operator,
    pub value: String,
}

impl Condition {
    pub fn new(field: Field, operator: Operator, value: impl Into<String>) -> Self {
        Self {
            field,
            key: None,
            operator,
            value: value.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Whether the request satisfies this condition. A missing header or
    /// query parameter never matches.
    pub fn matches(&self, request: &InboundRequest) -> bool {
        let actual = match self.field {
            Field::Path => Some(request.path.as_str()),
            Field::Method => Some(request.method.as_str()),
            Field::Header => self.key.as_deref().and_then(|k| request.header(k)),
            Field::Query => self.key.as_deref().and_then(|k| request.query_param(k)),
        };
        let Some(actual) = actual else {
            return false;
        };

        if self.field == Field::Method {
            return self
                .operator
                .test(&actual.to_ascii_uppercase(), &self.value.to_ascii_uppercase());
        }
        self.operator.test(actual, &self.value)
    }
}

impl Operator {
    pub fn test(&self, actual: &str, expected: &str) -> bool {
        match self {
            Operator::Equals => actual == expected,
            Operator::StartsWith => actual.starts_with(expected),
            Operator::EndsWith => actual.ends_with(expected),
            Operator::Contains => actual.contains(expected),
            Operator::PathPattern => path_matches(expected, actual),
        }
    }
}

/// Match a `/`-separated path against a segment glob.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    glob(&pattern, &path)
}

fn glob(pattern: &[&str], segments: &[&str]) -> bool {
    match pattern.split_first() {
        None => segments.is_empty(),
        Some((&"**", rest)) => (0..=segments.len()).any(|i| glob(rest, &segments[i..])),
        Some((&"*", rest)) => !segments.is_empty() && glob(rest, &segments[1..]),
        Some((literal, rest)) => segments.first() == Some(literal) && glob(rest, &segments[1..]),
    }
}
