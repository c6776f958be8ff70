//! Result transformations
//!
//! Declarative post-processing applied to a step's raw executor output
//! before it is stored in the workflow results. Payloads stay opaque
//! JSON; transforms only inspect the fields they name.
//!
//! Supported kinds:
//! - **filter**: keep array elements whose field passes a comparison
//! - **map**: rename fields on an object, or on each element of an array
//! - **aggregate**: fold an array into a single number (sum/avg/min/max/count)
//! - **format**: render a template string with `{field}` placeholders

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A transformation failure. Carries enough context to tell which part
/// of the payload did not match the declared rule.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransformError {
    #[error("filter expects an array, got {0}")]
    FilterExpectsArray(&'static str),
    #[error("aggregate expects an array, got {0}")]
    AggregateExpectsArray(&'static str),
    #[error("aggregate field '{0}' is missing or not numeric")]
    NonNumericField(String),
    #[error("cannot aggregate an empty array with {0:?}")]
    EmptyAggregate(AggregateOp),
    #[error("format placeholder '{0}' not found in payload")]
    MissingPlaceholder(String),
}

/// Comparison operator used by [`Transform::Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
}

impl Comparator {
    fn matches(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            Comparator::Equals => actual == expected,
            Comparator::NotEquals => actual != expected,
            Comparator::GreaterThan | Comparator::LessThan => {
                match (actual.as_f64(), expected.as_f64()) {
                    (Some(a), Some(e)) => {
                        if matches!(self, Comparator::GreaterThan) {
                            a > e
                        } else {
                            a < e
                        }
                    }
                    _ => false,
                }
            }
        }
    }
}

/// Fold operation used by [`Transform::Aggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Sum,
    Average,
    Min,
    Max,
    Count,
}

/// One declarative transformation rule, applied in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    Filter {
        field: String,
        op: Comparator,
        value: Value,
    },
    Map {
        /// old field name -> new field name
        fields: HashMap<String, String>,
    },
    Aggregate {
        /// Field to read from each element; `None` only makes sense for
        /// `Count` or arrays of bare numbers.
        #[serde(default)]
        field: Option<String>,
        op: AggregateOp,
    },
    Format {
        /// Template with `{field}` placeholders resolved against the
        /// payload object.
        template: String,
    },
}

impl Transform {
    /// Applies this rule to a payload, producing a new payload.
    pub fn apply(&self, value: &Value) -> Result<Value, TransformError> {
        match self {
            Transform::Filter { field, op, value: expected } => {
                let items = value
                    .as_array()
                    .ok_or_else(|| TransformError::FilterExpectsArray(type_name(value)))?;
                let kept: Vec<Value> = items
                    .iter()
                    .filter(|item| {
                        item.get(field)
                            .map(|actual| op.matches(actual, expected))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                Ok(Value::Array(kept))
            }
            Transform::Map { fields } => match value {
                Value::Array(items) => {
                    let mapped: Vec<Value> =
                        items.iter().map(|item| rename_fields(item, fields)).collect();
                    Ok(Value::Array(mapped))
                }
                other => Ok(rename_fields(other, fields)),
            },
            Transform::Aggregate { field, op } => {
                let items = value
                    .as_array()
                    .ok_or_else(|| TransformError::AggregateExpectsArray(type_name(value)))?;
                aggregate(items, field.as_deref(), *op)
            }
            Transform::Format { template } => {
                let rendered = render_template(template, value)?;
                Ok(Value::String(rendered))
            }
        }
    }
}

/// Applies a chain of transforms in order, each consuming the previous
/// output.
pub fn apply_transforms(value: Value, transforms: &[Transform]) -> Result<Value, TransformError> {
    let mut current = value;
    for transform in transforms {
        current = transform.apply(&current)?;
    }
    Ok(current)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn rename_fields(value: &Value, fields: &HashMap<String, String>) -> Value {
    match value {
        Value::Object(map) => {
            let renamed = map
                .iter()
                .map(|(key, val)| {
                    let new_key = fields.get(key).cloned().unwrap_or_else(|| key.clone());
                    (new_key, val.clone())
                })
                .collect();
            Value::Object(renamed)
        }
        other => other.clone(),
    }
}

fn aggregate(
    items: &[Value],
    field: Option<&str>,
    op: AggregateOp,
) -> Result<Value, TransformError> {
    if op == AggregateOp::Count {
        return Ok(Value::from(items.len()));
    }
    if items.is_empty() {
        return Err(TransformError::EmptyAggregate(op));
    }

    let mut numbers = Vec::with_capacity(items.len());
    for item in items {
        let target = match field {
            Some(name) => item.get(name).unwrap_or(&Value::Null),
            None => item,
        };
        let n = target.as_f64().ok_or_else(|| {
            TransformError::NonNumericField(field.unwrap_or("<value>").to_string())
        })?;
        numbers.push(n);
    }

    let result = match op {
        AggregateOp::Sum => numbers.iter().sum(),
        AggregateOp::Average => numbers.iter().sum::<f64>() / numbers.len() as f64,
        AggregateOp::Min => numbers.iter().cloned().fold(f64::INFINITY, f64::min),
        AggregateOp::Max => numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        AggregateOp::Count => unreachable!(),
    };
    Ok(Value::from(result))
}

fn render_template(template: &str, payload: &Value) -> Result<String, TransformError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                let value = payload
                    .get(name)
                    .ok_or_else(|| TransformError::MissingPlaceholder(name.to_string()))?;
                match value {
                    Value::String(s) => rendered.push_str(s),
                    other => rendered.push_str(&other.to_string()),
                }
                rest = &after[close + 1..];
            }
            None => {
                rendered.push('{');
                rest = after;
            }
        }
    }
    rendered.push_str(rest);
    Ok(rendered)
}
