//! Records reported by an instrumented target after each request.
//!
//! Every record type here is parsed from one line of a line-delimited
//! JSON report and is immutable afterwards.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-file line hit counts. `None` marks a line that is not runnable.
///
/// BTreeMap keeps iteration order stable across runs.
pub type CoverageMap = BTreeMap<String, Vec<Option<u64>>>;

/// Add every count in `src` into `dst`, extending files and lines as needed.
///
/// A `None` in `src` never overwrites a count already in `dst`.
pub fn merge_coverage_into(dst: &mut CoverageMap, src: &CoverageMap) {
    for (file, counts) in src {
        let lines = dst.entry(file.clone()).or_default();
        if lines.len() < counts.len() {
            lines.resize(counts.len(), None);
        }
        for (slot, count) in lines.iter_mut().zip(counts) {
            if let Some(hits) = count {
                *slot = Some(slot.unwrap_or(0) + hits);
            }
        }
    }
}

/// Kind of data access performed by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMethod {
    Create,
    Read,
    Update,
    Delete,
    #[serde(other)]
    Other,
}

/// A (table, column) reference inside a predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub table: String,
    #[serde(rename = "attribute_name")]
    pub column: String,
}

/// A bound literal value inside a predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueNode {
    pub value: Value,
}

/// Where-clause predicate tree.
///
/// Node kinds are closed: a report containing a kind not listed here fails
/// to parse instead of being silently skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Predicate {
    #[serde(rename = "equality")]
    Equality { left: Attribute, right: ValueNode },
    #[serde(rename = "not_equal")]
    NotEqual { left: Attribute, right: ValueNode },
    #[serde(rename = "in")]
    In {
        attribute: Attribute,
        values: Vec<ValueNode>,
    },
    #[serde(rename = "not in")]
    NotIn {
        attribute: Attribute,
        values: Vec<ValueNode>,
    },
    #[serde(rename = "literal")]
    Literal { literal: String },
    /// Raw SQL text the ORM parsed back into `left operator right`.
    #[serde(rename = "parsed_literal_expression")]
    ParsedLiteralExpression {
        left: String,
        operator: String,
        right: Value,
        literal: String,
    },
    #[serde(rename = "and")]
    And {
        left: Box<Predicate>,
        right: Box<Predicate>,
    },
    #[serde(rename = "or")]
    Or {
        left: Box<Predicate>,
        right: Box<Predicate>,
    },
}

/// Structured form of a query as dumped by the target ORM.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryAst {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub where_clause: Option<Predicate>,
}

/// One executed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub successful: bool,
    pub method: QueryMethod,
    pub model: String,
    #[serde(rename = "query", default)]
    pub ast: Option<QueryAst>,
    #[serde(rename = "results", default)]
    pub record: Option<Value>,
}

impl QueryRecord {
    /// The predicate tree, if the query had a non-empty where clause.
    pub fn where_clause(&self) -> Option<&Predicate> {
        self.ast.as_ref().and_then(|ast| ast.where_clause.as_ref())
    }
}

/// An exception raised inside the target, as reported (unfiltered).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawException {
    pub class: String,
    #[serde(default, alias = "message")]
    pub msg: String,
}

/// Render a JSON value the way it appears inside SQL text or a URL.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `{}` and `null` both mean "no predicate".
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<Predicate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    match raw {
        Value::Null => Ok(None),
        Value::Object(ref map) if map.is_empty() => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
