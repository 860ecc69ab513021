//! SQL injection candidates.
//!
//! The target reports raw SQL fragments it could parse as
//! `parsed_literal_expression` nodes. A request parameter whose value shows
//! up verbatim inside such a fragment was spliced into SQL text rather than
//! bound, which is flagged here.

use crate::catalog::Route;
use crate::query::literal_expression_nodes;
use log::warn;
use routefuzz_target::{value_text, Predicate, QueryRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

/// Findings file, relative to the results directory.
pub const FINDINGS_FILE: &str = "sql_inj.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub path: String,
    pub verb: String,
    pub param: String,
    pub value: Value,
    pub ast: Predicate,
}

fn detectable(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Every (parameter, literal node) pair where the parameter's current value
/// appears in the node's SQL text.
pub fn detect(route: &Route, queries: &[QueryRecord]) -> Vec<Finding> {
    let mut findings = Vec::new();
    for query in queries {
        let Some(ast) = query.where_clause() else {
            continue;
        };
        for node in literal_expression_nodes(ast) {
            let Predicate::ParsedLiteralExpression { literal, .. } = node else {
                continue;
            };
            let literal = literal.to_uppercase();
            for (name, value) in route.params_sent() {
                if !detectable(value) {
                    continue;
                }
                if literal.contains(&value_text(value).to_uppercase()) {
                    warn!(
                        "possible SQL injection on {} via {}={}: {}",
                        route.label(),
                        name,
                        value_text(value),
                        literal
                    );
                    findings.push(Finding {
                        path: route.path.clone(),
                        verb: route.verb.clone(),
                        param: name.to_string(),
                        value: value.clone(),
                        ast: node.clone(),
                    });
                }
            }
        }
    }
    findings
}

/// Append findings as JSON lines to `results_dir/sql_inj.json`.
pub fn append_findings(results_dir: &Path, findings: &[Finding]) -> io::Result<()> {
    if findings.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(results_dir.join(FINDINGS_FILE))?;
    for finding in findings {
        let line = serde_json::to_string(finding)?;
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{Param, ParamType};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn literal_query(sql: &str, right: &str) -> QueryRecord {
        serde_json::from_value(json!({
            "successful": true,
            "method": "read",
            "model": "User",
            "query": {"where_clause": {
                "type": "and",
                "left": {
                    "type": "equality",
                    "left": {"table": "users", "attribute_name": "active"},
                    "right": {"value": true}
                },
                "right": {
                    "type": "parsed_literal_expression",
                    "left": "name", "operator": "=", "right": right,
                    "literal": sql
                }
            }}
        }))
        .unwrap()
    }

    fn route_with(value: &str) -> Route {
        let mut route = Route::new("GET", "/users");
        route.query_params = vec![
            Param::new("name", vec![json!(value)], vec![ParamType::String]),
            Param::discovered("page"),
        ];
        route
    }

    #[test]
    fn test_flags_value_in_literal() {
        let queries = vec![literal_query("name = 'BIP_X'", "BIP_X")];
        let findings = detect(&route_with("bip_x"), &queries);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].param, "name");
        assert_eq!(findings[0].verb, "GET");
        assert!(matches!(
            findings[0].ast,
            Predicate::ParsedLiteralExpression { .. }
        ));
    }

    #[test]
    fn test_ignores_other_value() {
        let queries = vec![literal_query("name = 'BIP_X'", "BIP_X")];
        assert!(detect(&route_with("BIP_Y"), &queries).is_empty());
    }

    #[test]
    fn test_empty_value_never_flagged() {
        let mut route = route_with("x");
        route.query_params[0].set_next_val(Some(json!("")));
        let queries = vec![literal_query("name = ''", "")];
        assert!(detect(&route, &queries).is_empty());
    }

    #[test]
    fn test_append_findings() {
        let dir = TempDir::new().unwrap();
        let queries = vec![literal_query("name = 'BIP_X'", "BIP_X")];
        let findings = detect(&route_with("BIP_X"), &queries);
        append_findings(dir.path(), &findings).unwrap();
        append_findings(dir.path(), &findings).unwrap();
        append_findings(dir.path(), &[]).unwrap();

        let text = fs::read_to_string(dir.path().join(FINDINGS_FILE)).unwrap();
        let lines: Vec<Finding> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], findings[0]);
    }
}
