//! Stable multi-key ordering of message batches.
//!
//! An [`OrderSpec`] is a list of `[expression, type, descending]` entries.
//! Each expression is evaluated per message against the message payload plus
//! `_index_`, the message's zero-based position in the batch. Earlier entries
//! take precedence and the original position breaks every remaining tie.

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::error::ValidationErrors;
use crate::message::HasPayload;
use crate::template::Interpolator;

pub const ORDER_OPTION: &str = "messages_order";
pub const SORT_INFO_OPTION: &str = "include_sort_info";
pub const INDEX_VARIABLE: &str = "_index_";
pub const SORT_INFO_KEY: &str = "_sort_info_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    String,
    Number,
    Time,
}

impl FromStr for KeyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(KeyKind::String),
            "number" => Ok(KeyKind::Number),
            "time" => Ok(KeyKind::Time),
            other => Err(format!("unknown sort type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub expression: String,
    pub kind: KeyKind,
    pub descending: bool,
}

impl SortKey {
    pub fn new(expression: impl Into<String>, kind: KeyKind, descending: bool) -> Self {
        Self {
            expression: expression.into(),
            kind,
            descending,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderSpec {
    keys: Vec<SortKey>,
}

impl OrderSpec {
    pub fn new(keys: Vec<SortKey>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Parse the JSON form: `[["{{ price }}", "number", false], ...]`.
    /// Type defaults to `string` and descending to `false`.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let entries = value
            .as_array()
            .ok_or("must be an array of [expression, type, descending] arrays")?;

        let mut keys = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let parts = entry
                .as_array()
                .filter(|p| (1..=3).contains(&p.len()))
                .ok_or_else(|| format!("entry {i} must be an array of 1 to 3 elements"))?;

            let expression = parts[0]
                .as_str()
                .ok_or_else(|| format!("entry {i}: expression must be a string"))?;

            let kind = match parts.get(1) {
                None | Some(Value::Null) => KeyKind::String,
                Some(Value::String(s)) => s.parse::<KeyKind>().map_err(|e| format!("entry {i}: {e}"))?,
                Some(_) => return Err(format!("entry {i}: type must be a string")),
            };

            let descending = match parts.get(2) {
                None | Some(Value::Null) => false,
                Some(Value::Bool(b)) => *b,
                Some(Value::String(s)) if s == "true" => true,
                Some(Value::String(s)) if s == "false" => false,
                Some(_) => return Err(format!("entry {i}: descending must be a boolean")),
            };

            keys.push(SortKey::new(expression, kind, descending));
        }
        Ok(Self { keys })
    }

    /// The ordering configured in an agent's options, if any.
    pub fn from_options(options: &Map<String, Value>) -> Result<Option<Self>, String> {
        match options.get(ORDER_OPTION) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Self::from_value(value).map(Some),
        }
    }
}

/// Configuration-time checks for the ordering options.
pub fn validate_options(options: &Map<String, Value>, errors: &mut ValidationErrors) {
    if let Err(e) = OrderSpec::from_options(options) {
        errors.add(ORDER_OPTION, e);
    }
    match options.get(SORT_INFO_OPTION) {
        None | Some(Value::Null) | Some(Value::Bool(_)) => {}
        Some(_) => errors.add(SORT_INFO_OPTION, "must be a boolean"),
    }
}

/// A parsed sort key value. Values that failed to parse as their declared
/// type keep their raw string and sort after every parsed value.
#[derive(Debug, Clone, PartialEq)]
enum SortValue {
    Number(f64),
    Time(DateTime<Utc>),
    Raw(String),
}

impl SortValue {
    fn rank(&self) -> u8 {
        match self {
            SortValue::Number(_) | SortValue::Time(_) => 0,
            SortValue::Raw(_) => 1,
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortValue::Number(a), SortValue::Number(b)) => a.total_cmp(b),
            (SortValue::Time(a), SortValue::Time(b)) => a.cmp(b),
            (SortValue::Raw(a), SortValue::Raw(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_rfc2822(s) {
        return Some(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

fn parse_key(raw: String, kind: KeyKind) -> Result<SortValue, String> {
    match kind {
        KeyKind::String => Ok(SortValue::Raw(raw)),
        KeyKind::Number => match raw.trim().parse::<f64>() {
            Ok(n) => Ok(SortValue::Number(n)),
            Err(_) => Err(raw),
        },
        KeyKind::Time => match parse_time(&raw) {
            Some(t) => Ok(SortValue::Time(t)),
            None => Err(raw),
        },
    }
}

/// The sorted batch plus a warning for every key that fell back to its raw
/// string.
#[derive(Debug)]
pub struct Ordered<T> {
    pub items: Vec<T>,
    pub warnings: Vec<String>,
}

/// Reorder `items` per `spec`. Never fails: a key that cannot be evaluated or
/// parsed degrades to string comparison and produces a warning.
///
/// `scope` is merged under each payload, so expressions can also see
/// variables of the surrounding invocation.
pub fn sort<T: HasPayload>(
    items: Vec<T>,
    spec: &OrderSpec,
    interpolator: &dyn Interpolator,
    scope: &Map<String, Value>,
) -> Ordered<T> {
    let mut warnings = Vec::new();
    if spec.is_empty() || items.len() < 2 {
        return Ordered { items, warnings };
    }

    let mut rows: Vec<(Vec<SortValue>, usize, T)> = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let mut context = scope.clone();
        if let Value::Object(payload) = item.payload() {
            context.extend(payload.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        context.insert(INDEX_VARIABLE.into(), Value::from(index));

        let keys = spec
            .keys()
            .iter()
            .map(|key| {
                let raw = match interpolator.evaluate(&key.expression, &context) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warnings.push(format!("Error evaluating sort key {:?}: {e}", key.expression));
                        String::new()
                    }
                };
                parse_key(raw, key.kind).unwrap_or_else(|raw| {
                    warnings.push(format!(
                        "Cannot parse {raw:?} as {:?} for sort key {:?}; comparing as string",
                        key.kind, key.expression
                    ));
                    SortValue::Raw(raw)
                })
            })
            .collect();

        rows.push((keys, index, item));
    }

    rows.sort_by(|(a, ai, _), (b, bi, _)| {
        for ((x, y), key) in a.iter().zip(b.iter()).zip(spec.keys()) {
            let ord = if key.descending { y.compare(x) } else { x.compare(y) };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        ai.cmp(bi)
    });

    Ordered {
        items: rows.into_iter().map(|(_, _, item)| item).collect(),
        warnings,
    }
}
