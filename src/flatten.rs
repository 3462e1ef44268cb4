//! Flatten arbitrary JSON into path-keyed, typed facts.
//!
//! Paths join object keys with `.` and append array indices as `[i]`:
//! `form.last_10[0].position`.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// One typed leaf. Exactly one storage column is populated per variant.
#[derive(Debug, Clone, PartialEq)]
pub enum FactValue {
    Numeric(f64),
    Text(String),
    /// Compact JSON for booleans, nulls and empty-list markers.
    Json(String),
}

impl FactValue {
    pub fn classify(value: &Value) -> Self {
        match value {
            Value::Number(n) => match n.as_f64() {
                Some(f) => FactValue::Numeric(f),
                None => FactValue::Json(n.to_string()),
            },
            Value::String(s) => FactValue::Text(s.clone()),
            other => FactValue::Json(other.to_string()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FactValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            FactValue::Numeric(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&str> {
        match self {
            FactValue::Json(s) => Some(s),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            FactValue::Numeric(f) => numeric_value(*f),
            FactValue::Text(s) => Value::String(s.clone()),
            FactValue::Json(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        }
    }
}

fn numeric_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

pub type Facts = BTreeMap<String, FactValue>;

pub fn flatten_json(value: &Value) -> Facts {
    let mut out = Facts::new();
    walk(value, String::new(), &mut out);
    out
}

fn walk(value: &Value, prefix: String, out: &mut Facts) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                walk(child, path, out);
            }
        }
        Value::Array(items) => {
            if items.is_empty() {
                if !prefix.is_empty() {
                    out.insert(prefix, FactValue::Json("[]".to_string()));
                }
                return;
            }
            for (i, child) in items.iter().enumerate() {
                walk(child, format!("{prefix}[{i}]"), out);
            }
        }
        leaf => {
            out.insert(prefix, FactValue::classify(leaf));
        }
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut key = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !key.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut key)));
                }
            }
            '[' => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    chars.next();
                    if d == ']' {
                        break;
                    }
                    digits.push(d);
                }
                match digits.parse() {
                    Ok(i) => {
                        if !key.is_empty() {
                            segments.push(Segment::Key(std::mem::take(&mut key)));
                        }
                        segments.push(Segment::Index(i));
                    }
                    Err(_) => {
                        key.push('[');
                        key.push_str(&digits);
                        key.push(']');
                    }
                }
            }
            other => key.push(other),
        }
    }
    if !key.is_empty() {
        segments.push(Segment::Key(key));
    }
    segments
}

fn insert_at(slot: &mut Value, segments: &[Segment], leaf: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *slot = leaf;
        return;
    };
    match head {
        Segment::Key(k) => {
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(map) = slot {
                let child = map.entry(k.clone()).or_insert(Value::Null);
                insert_at(child, rest, leaf);
            }
        }
        Segment::Index(i) => {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(items) = slot {
                if items.len() <= *i {
                    items.resize(*i + 1, Value::Null);
                }
                insert_at(&mut items[*i], rest, leaf);
            }
        }
    }
}

/// Rebuild a JSON value from flattened facts.
///
/// Inverse of [`flatten_json`] for keys that contain no `.` or `[`.
/// Integral numerics come back as integers.
pub fn unflatten(facts: &Facts) -> Value {
    let mut root = Value::Null;
    for (path, fact) in facts {
        insert_at(&mut root, &parse_path(path), fact.to_value());
    }
    root
}
