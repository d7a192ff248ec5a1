// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Query model shared by all store backends.
//!
//! A [`Criterion`] compares a dot-separated path into the entity's JSON form
//! with a literal. Criteria can be built in code or parsed from text such as
//! `state = 500` or `contract_agreement.asset_id like 'asset-%'`.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Comparison operator of a [`Criterion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Like,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "in",
            Operator::Like => "like",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "=" => Some(Operator::Eq),
            "!=" | "<>" => Some(Operator::NotEq),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Le),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Ge),
            "in" => Some(Operator::In),
            "like" => Some(Operator::Like),
            _ => None,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One filter condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub operand_left: String,
    pub operator: Operator,
    pub operand_right: Value,
}

impl Criterion {
    pub fn new(left: impl Into<String>, operator: Operator, right: impl Into<Value>) -> Self {
        Self {
            operand_left: left.into(),
            operator,
            operand_right: right.into(),
        }
    }

    /// Shorthand for an equality criterion.
    pub fn eq(left: impl Into<String>, right: impl Into<Value>) -> Self {
        Self::new(left, Operator::Eq, right)
    }

    /// Parse `<path> <operator> <literal>`.
    ///
    /// The literal is read as JSON when possible (`500`, `true`, `["a","b"]`),
    /// otherwise single or double quotes are stripped and it becomes a string.
    pub fn parse(expression: &str) -> StoreResult<Self> {
        let mut parts = expression.trim().splitn(3, char::is_whitespace);
        let (Some(left), Some(op), Some(right)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(StoreError::InvalidQuery(format!(
                "expected '<path> <operator> <value>', got '{}'",
                expression
            )));
        };
        let operator = Operator::parse(op).ok_or_else(|| {
            StoreError::InvalidQuery(format!("unknown operator '{}' in '{}'", op, expression))
        })?;
        let criterion = Self::new(left, operator, parse_literal(right.trim()));
        criterion.validate()?;
        Ok(criterion)
    }

    /// Reject malformed paths and operand shapes.
    pub fn validate(&self) -> StoreResult<()> {
        validate_path(&self.operand_left)?;
        match (self.operator, &self.operand_right) {
            (Operator::In, Value::Array(_)) => Ok(()),
            (Operator::In, other) => Err(StoreError::InvalidQuery(format!(
                "'in' expects a list, got {}",
                other
            ))),
            (Operator::Like, Value::String(_)) => Ok(()),
            (Operator::Like, other) => Err(StoreError::InvalidQuery(format!(
                "'like' expects a string pattern, got {}",
                other
            ))),
            (_, Value::Array(_) | Value::Object(_)) => Err(StoreError::InvalidQuery(format!(
                "'{}' expects a scalar operand",
                self.operator
            ))),
            _ => Ok(()),
        }
    }

    /// Evaluate against an entity's JSON form.
    pub fn matches(&self, document: &Value) -> StoreResult<bool> {
        self.validate()?;
        let left = lookup(document, &self.operand_left);
        let right = &self.operand_right;
        let result = match self.operator {
            Operator::Eq => json_eq(left, right),
            Operator::NotEq => !json_eq(left, right),
            Operator::Lt => compare(left, right) == Some(Ordering::Less),
            Operator::Le => matches!(
                compare(left, right),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Gt => compare(left, right) == Some(Ordering::Greater),
            Operator::Ge => matches!(
                compare(left, right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::In => right
                .as_array()
                .is_some_and(|values| values.iter().any(|v| json_eq(left, v))),
            Operator::Like => match (left, right) {
                (Value::String(text), Value::String(pattern)) => like(text, pattern),
                _ => false,
            },
        };
        Ok(result)
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.operand_left, self.operator, self.operand_right
        )
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Filter, sort and paging for [`find_all`](super::StateEntityStore::find_all).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(default)]
    pub filter: Vec<Criterion>,
    #[serde(default)]
    pub sort_field: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, criterion: Criterion) -> Self {
        self.filter.push(criterion);
        self
    }

    /// Parse and add a textual filter expression.
    pub fn filter_expr(mut self, expression: &str) -> StoreResult<Self> {
        self.filter.push(Criterion::parse(expression)?);
        Ok(self)
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = Some(field.into());
        self.sort_order = order;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        for criterion in &self.filter {
            criterion.validate()?;
        }
        if let Some(field) = &self.sort_field {
            validate_path(field)?;
        }
        Ok(())
    }

    /// Apply filter, sort and paging to JSON documents in memory.
    pub(crate) fn apply<T>(&self, mut rows: Vec<(Value, T)>) -> StoreResult<Vec<T>> {
        self.validate()?;
        let mut kept = Vec::with_capacity(rows.len());
        for (document, item) in rows.drain(..) {
            if matches_all(&self.filter, &document)? {
                kept.push((document, item));
            }
        }
        match &self.sort_field {
            Some(field) => kept.sort_by(|(a, _), (b, _)| {
                let ordering = sort_key_cmp(lookup(a, field), lookup(b, field));
                match self.sort_order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            }),
            None => kept.sort_by(|(a, _), (b, _)| {
                sort_key_cmp(lookup(a, "created_at"), lookup(b, "created_at"))
                    .then_with(|| sort_key_cmp(lookup(a, "id"), lookup(b, "id")))
            }),
        }
        let limit = self.limit.unwrap_or(usize::MAX);
        Ok(kept
            .into_iter()
            .skip(self.offset)
            .take(limit)
            .map(|(_, item)| item)
            .collect())
    }
}

pub(crate) fn matches_all(criteria: &[Criterion], document: &Value) -> StoreResult<bool> {
    for criterion in criteria {
        if !criterion.matches(document)? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub(crate) fn validate_path(path: &str) -> StoreResult<()> {
    let valid = !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidQuery(format!(
            "invalid field path '{}'",
            path
        )))
    }
}

fn parse_literal(raw: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return value;
    }
    let unquoted = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(raw);
    Value::String(unquoted.to_string())
}

fn lookup<'a>(document: &'a Value, path: &str) -> &'a Value {
    let mut current = document;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i))
                .unwrap_or(&Value::Null),
            _ => &Value::Null,
        };
    }
    current
}

fn json_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn sort_key_cmp(left: &Value, right: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    compare(left, right).unwrap_or_else(|| rank(left).cmp(&rank(right)))
}

/// SQL LIKE semantics: `%` matches any run, `_` one character, case-sensitive.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some('_') => {
                t += 1;
                p += 1;
            }
            Some(c) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match backtrack {
                Some((bp, bt)) => {
                    p = bp + 1;
                    t = bt + 1;
                    backtrack = Some((bp, bt + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_numeric_equality() {
        let criterion = Criterion::parse("state = 500").unwrap();
        assert_eq!(criterion, Criterion::eq("state", 500));
    }

    #[test]
    fn test_parse_quoted_and_list_literals() {
        let quoted = Criterion::parse("counter_party_id = 'provider a'").unwrap();
        assert_eq!(quoted.operand_right, json!("provider a"));

        let list = Criterion::parse("state in [100, 200]").unwrap();
        assert_eq!(list.operator, Operator::In);
        assert_eq!(list.operand_right, json!([100, 200]));
    }

    #[test]
    fn test_parse_rejects_malformed_expressions() {
        assert!(matches!(
            Criterion::parse("state"),
            Err(StoreError::InvalidQuery(_))
        ));
        assert!(matches!(
            Criterion::parse("state ~ 5"),
            Err(StoreError::InvalidQuery(_))
        ));
        assert!(matches!(
            Criterion::parse("state in 5"),
            Err(StoreError::InvalidQuery(_))
        ));
        assert!(matches!(
            Criterion::parse("a..b = 1"),
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_matches_nested_paths() {
        let doc = json!({
            "state": 800,
            "pending": false,
            "contract_agreement": { "asset_id": "asset-7" },
            "offers": [{ "id": "o-1" }]
        });
        assert!(Criterion::eq("state", 800).matches(&doc).unwrap());
        assert!(Criterion::eq("pending", false).matches(&doc).unwrap());
        assert!(
            Criterion::parse("contract_agreement.asset_id like 'asset-%'")
                .unwrap()
                .matches(&doc)
                .unwrap()
        );
        assert!(Criterion::eq("offers.0.id", "o-1").matches(&doc).unwrap());
        assert!(!Criterion::eq("missing.path", 1).matches(&doc).unwrap());
        assert!(
            Criterion::new("state", Operator::Ge, 800.0)
                .matches(&doc)
                .unwrap()
        );
    }

    #[test]
    fn test_like_wildcards() {
        assert!(like("asset-7", "asset-_"));
        assert!(like("abcabd", "%abd"));
        assert!(like("", "%"));
        assert!(!like("asset", "asset-%"));
    }

    #[test]
    fn test_apply_sorts_and_pages() {
        let rows = vec![
            (json!({"id": "a", "state": 3}), "a"),
            (json!({"id": "b", "state": 1}), "b"),
            (json!({"id": "c", "state": 2}), "c"),
        ];
        let spec = QuerySpec::new()
            .sort("state", SortOrder::Desc)
            .offset(1)
            .limit(1);
        assert_eq!(spec.apply(rows).unwrap(), vec!["c"]);
    }
}
