//! Mapping sent parameter values onto the queries they reached.
//!
//! When the value of a parameter shows up inside a where-clause, the
//! (table, column) it was compared against tells the mutator where to look
//! for a value the application will accept.

use crate::param::{Param, ParamType};
use log::info;
use routefuzz_target::{value_text, Attribute, Predicate, QueryRecord, ValueNode};
use serde_json::Value;

/// A (table, column) location a parameter flows into.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Column {
    pub table: String,
    pub column: String,
}

impl From<&Attribute> for Column {
    fn from(attr: &Attribute) -> Self {
        Self {
            table: attr.table.clone(),
            column: attr.column.clone(),
        }
    }
}

/// Extra restriction a matched parameter is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    NotEqual,
}

/// Result of searching a predicate tree for one parameter value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamMatch {
    pub location: Option<Column>,
    /// The tree with the matched comparisons pruned away.
    pub residual: Option<Predicate>,
    pub constraints: Vec<Constraint>,
}

impl ParamMatch {
    fn miss(ast: &Predicate) -> Self {
        Self {
            location: None,
            residual: Some(ast.clone()),
            constraints: Vec::new(),
        }
    }

    fn hit(location: Column) -> Self {
        Self {
            location: Some(location),
            residual: None,
            constraints: Vec::new(),
        }
    }
}

/// Where a parameter matched, kept per request on the parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMetadata {
    pub table: String,
    pub column: String,
    pub query: QueryRecord,
}

fn contains_value(needle: &Value, haystack: &Value) -> bool {
    value_text(haystack)
        .to_uppercase()
        .contains(&value_text(needle).to_uppercase())
}

fn any_contains(needle: &Value, values: &[ValueNode]) -> bool {
    values.iter().any(|v| contains_value(needle, &v.value))
}

/// Search `ast` for a comparison against `value`.
///
/// `query` supplies the model name for comparisons parsed out of raw SQL,
/// which carry a bare column name.
pub fn find_param_in_query(value: &Value, query: &QueryRecord, ast: &Predicate) -> ParamMatch {
    match ast {
        Predicate::In { attribute, values } => {
            if any_contains(value, values) {
                ParamMatch::hit(attribute.into())
            } else {
                ParamMatch::miss(ast)
            }
        }
        Predicate::Equality { left, right } | Predicate::NotEqual { left, right } => {
            if contains_value(value, &right.value) {
                ParamMatch::hit(left.into())
            } else {
                ParamMatch::miss(ast)
            }
        }
        Predicate::NotIn { attribute, values } => {
            if !any_contains(value, values) {
                return ParamMatch::miss(ast);
            }
            let remaining = values
                .iter()
                .filter(|v| !contains_value(value, &v.value))
                .cloned()
                .collect();
            ParamMatch {
                location: Some(attribute.into()),
                residual: Some(Predicate::NotIn {
                    attribute: attribute.clone(),
                    values: remaining,
                }),
                constraints: vec![Constraint::NotEqual],
            }
        }
        Predicate::Literal { .. } => ParamMatch::miss(ast),
        Predicate::ParsedLiteralExpression {
            left,
            operator,
            right,
            ..
        } => {
            if !contains_value(value, right) {
                ParamMatch::miss(ast)
            } else if operator == "=" {
                ParamMatch::hit(Column {
                    table: query.model.clone(),
                    column: left.clone(),
                })
            } else {
                ParamMatch {
                    location: None,
                    residual: None,
                    constraints: Vec::new(),
                }
            }
        }
        Predicate::And { left, right } | Predicate::Or { left, right } => {
            let l = find_param_in_query(value, query, left);
            let r = find_param_in_query(value, query, right);
            let residual = match (l.residual, r.residual) {
                (Some(left), Some(right)) => Some(rebuild(ast, left, right)),
                (one, other) => one.or(other),
            };
            let mut constraints = l.constraints;
            constraints.extend(r.constraints);
            ParamMatch {
                location: l.location.or(r.location),
                residual,
                constraints,
            }
        }
    }
}

/// Same conjunction as `node`, new children.
fn rebuild(node: &Predicate, left: Predicate, right: Predicate) -> Predicate {
    let (left, right) = (Box::new(left), Box::new(right));
    match node {
        Predicate::Or { .. } => Predicate::Or { left, right },
        _ => Predicate::And { left, right },
    }
}

/// Render a predicate tree. With `canonical`, bound values become `?`.
pub fn stringify_ast(ast: &Predicate, canonical: bool) -> String {
    match ast {
        Predicate::Equality { left, right } | Predicate::NotEqual { left, right } => {
            let op = if matches!(ast, Predicate::Equality { .. }) {
                "="
            } else {
                "<>"
            };
            let value = if canonical {
                "?".to_string()
            } else {
                value_text(&right.value)
            };
            format!("{}[{}] {} {}", left.table, left.column, op, value)
        }
        Predicate::In { attribute, values } | Predicate::NotIn { attribute, values } => {
            let op = if matches!(ast, Predicate::In { .. }) {
                "in"
            } else {
                "not in"
            };
            let values = if canonical {
                "(?)".to_string()
            } else {
                Value::Array(values.iter().map(|v| v.value.clone()).collect()).to_string()
            };
            format!("{}[{}] {} {}", attribute.table, attribute.column, op, values)
        }
        Predicate::Literal { literal } | Predicate::ParsedLiteralExpression { literal, .. } => {
            literal.clone()
        }
        Predicate::And { left, right } => format!(
            "{} and {}",
            stringify_ast(left, canonical),
            stringify_ast(right, canonical)
        ),
        Predicate::Or { left, right } => format!(
            "{} or {}",
            stringify_ast(left, canonical),
            stringify_ast(right, canonical)
        ),
    }
}

/// One-line description of a query for logs.
pub fn stringify_query(query: &QueryRecord, canonical: bool) -> String {
    let status = if query.successful { "successful" } else { "failed" };
    match query.where_clause() {
        Some(ast) => format!("{} {:?}: {}", status, query.method, stringify_ast(ast, canonical)),
        None => format!("{} {:?} for {} model", status, query.method, query.model),
    }
}

/// Identity of a query's shape, ignoring bound values.
pub fn canonical_key(query: &QueryRecord) -> String {
    format!("{}: {}", query.model, stringify_query(query, true))
}

fn same_query(a: &QueryRecord, b: &QueryRecord) -> bool {
    a.method == b.method
        && a.model == b.model
        && a.successful == b.successful
        && a.where_clause().map(|w| stringify_ast(w, false))
            == b.where_clause().map(|w| stringify_ast(w, false))
}

/// Keep queries that have a where clause, dropping repeats.
pub fn filter_queries(queries: Vec<QueryRecord>) -> Vec<QueryRecord> {
    let mut kept: Vec<QueryRecord> = Vec::new();
    for query in queries {
        if query.where_clause().is_none() {
            continue;
        }
        if !kept.iter().any(|k| same_query(k, &query)) {
            kept.push(query);
        }
    }
    kept
}

/// Every `parsed_literal_expression` node reachable through and/or.
pub fn literal_expression_nodes(ast: &Predicate) -> Vec<&Predicate> {
    match ast {
        Predicate::ParsedLiteralExpression { .. } => vec![ast],
        Predicate::And { left, right } | Predicate::Or { left, right } => {
            let mut nodes = literal_expression_nodes(left);
            nodes.extend(literal_expression_nodes(right));
            nodes
        }
        _ => Vec::new(),
    }
}

/// Parameters not worth searching for: unsent, boolean or empty.
pub fn skip_param(param: &Param) -> bool {
    match &param.next_val {
        None => true,
        Some(Value::String(s)) if s.is_empty() => true,
        Some(_) => param.types.contains(&ParamType::Bool),
    }
}

/// Record, on each parameter, the queries of the latest request its
/// current value reached. Every parameter gets a new (possibly empty)
/// front entry in its metadata history.
pub fn search_queries_for_params<'a>(
    params: impl Iterator<Item = &'a mut Param>,
    queries: &[QueryRecord],
) {
    for param in params {
        let mut found = Vec::new();
        if !skip_param(param) {
            if let Some(value) = &param.next_val {
                for query in queries {
                    let Some(ast) = query.where_clause() else {
                        continue;
                    };
                    let Some(location) = find_param_in_query(value, query, ast).location else {
                        continue;
                    };
                    info!(
                        "({}:{}) -> select {} from {}: {}",
                        param.name,
                        value_text(value),
                        location.column.to_uppercase(),
                        location.table.to_uppercase(),
                        stringify_query(query, false)
                    );
                    found.push(QueryMetadata {
                        table: location.table,
                        column: location.column,
                        query: query.clone(),
                    });
                }
            }
        }
        param.push_query_metadata(found);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routefuzz_target::QueryMethod;
    use serde_json::json;

    fn attr(table: &str, column: &str) -> Attribute {
        Attribute {
            table: table.into(),
            column: column.into(),
        }
    }

    fn eq(table: &str, column: &str, value: Value) -> Predicate {
        Predicate::Equality {
            left: attr(table, column),
            right: ValueNode { value },
        }
    }

    fn query(model: &str, successful: bool, ast: Predicate) -> QueryRecord {
        serde_json::from_value(json!({
            "successful": successful,
            "method": "read",
            "model": model,
            "query": {"where_clause": ast},
        }))
        .unwrap()
    }

    #[test]
    fn test_equality_match() {
        let ast = eq("users", "name", json!("BIP_ABC"));
        let q = query("User", false, ast.clone());
        let m = find_param_in_query(&json!("bip_abc"), &q, &ast);
        assert_eq!(
            m.location,
            Some(Column {
                table: "users".into(),
                column: "name".into()
            })
        );
        assert_eq!(m.residual, None);
        assert!(m.constraints.is_empty());
    }

    #[test]
    fn test_equality_no_match_keeps_tree() {
        let ast = eq("users", "name", json!("BIP_ABC"));
        let q = query("User", false, ast.clone());
        let m = find_param_in_query(&json!("BIP_XYZ"), &q, &ast);
        assert_eq!(m.location, None);
        assert_eq!(m.residual, Some(ast));
    }

    #[test]
    fn test_not_in_strips_value_and_adds_constraint() {
        let ast = Predicate::NotIn {
            attribute: attr("posts", "id"),
            values: vec![ValueNode { value: json!(7) }, ValueNode { value: json!(9) }],
        };
        let q = query("Post", true, ast.clone());
        let m = find_param_in_query(&json!(7), &q, &ast);
        assert_eq!(m.location.unwrap().column, "id");
        assert_eq!(m.constraints, vec![Constraint::NotEqual]);
        assert_eq!(
            m.residual,
            Some(Predicate::NotIn {
                attribute: attr("posts", "id"),
                values: vec![ValueNode { value: json!(9) }],
            })
        );
    }

    #[test]
    fn test_and_prunes_matched_side() {
        let literal = Predicate::Literal {
            literal: "deleted_at IS NULL".into(),
        };
        let ast = Predicate::And {
            left: Box::new(literal.clone()),
            right: Box::new(eq("topics", "slug", json!("BIP_Q"))),
        };
        let q = query("Topic", true, ast.clone());
        let m = find_param_in_query(&json!("BIP_Q"), &q, &ast);
        assert_eq!(m.location.unwrap().table, "topics");
        assert_eq!(m.residual, Some(literal));
        // The input tree is untouched.
        assert!(matches!(ast, Predicate::And { .. }));
    }

    #[test]
    fn test_parsed_literal_expression_uses_model() {
        let ast = Predicate::ParsedLiteralExpression {
            left: "name".into(),
            operator: "=".into(),
            right: json!("BIP_X"),
            literal: "name = 'BIP_X'".into(),
        };
        let q = query("User", true, ast.clone());
        let m = find_param_in_query(&json!("BIP_X"), &q, &ast);
        assert_eq!(
            m.location,
            Some(Column {
                table: "User".into(),
                column: "name".into()
            })
        );

        let lt = Predicate::ParsedLiteralExpression {
            left: "age".into(),
            operator: "<".into(),
            right: json!(5),
            literal: "age < 5".into(),
        };
        let m = find_param_in_query(&json!(5), &q, &lt);
        assert_eq!(m.location, None);
        assert_eq!(m.residual, None);
    }

    #[test]
    fn test_stringify_canonical() {
        let ast = Predicate::Or {
            left: Box::new(eq("users", "id", json!(3))),
            right: Box::new(Predicate::In {
                attribute: attr("users", "role"),
                values: vec![ValueNode { value: json!("admin") }],
            }),
        };
        assert_eq!(
            stringify_ast(&ast, false),
            "users[id] = 3 or users[role] in [\"admin\"]"
        );
        assert_eq!(stringify_ast(&ast, true), "users[id] = ? or users[role] in (?)");
    }

    #[test]
    fn test_filter_queries_dedups_and_drops_bare() {
        let a = query("User", true, eq("users", "id", json!(1)));
        let b = query("User", true, eq("users", "id", json!(2)));
        let bare: QueryRecord = serde_json::from_value(json!({
            "successful": true, "method": "create", "model": "Post"
        }))
        .unwrap();
        let kept = filter_queries(vec![a.clone(), bare, a.clone(), b.clone()]);
        assert_eq!(kept, vec![a.clone(), b.clone()]);
        assert_eq!(canonical_key(&a), canonical_key(&b));
        assert_eq!(a.method, QueryMethod::Read);
    }

    #[test]
    fn test_literal_expression_nodes_recurse() {
        let node = Predicate::ParsedLiteralExpression {
            left: "name".into(),
            operator: "=".into(),
            right: json!("x"),
            literal: "name = 'x'".into(),
        };
        let ast = Predicate::And {
            left: Box::new(eq("users", "id", json!(1))),
            right: Box::new(Predicate::Or {
                left: Box::new(node.clone()),
                right: Box::new(node.clone()),
            }),
        };
        assert_eq!(literal_expression_nodes(&ast).len(), 2);
        assert!(literal_expression_nodes(&eq("a", "b", json!(1))).is_empty());
    }

    #[test]
    fn test_search_queries_for_params() {
        let mut name = Param::new("user[name]", vec![json!("BIP_ABC")], vec![ParamType::String]);
        let mut flag = Param::new("remember", vec![json!("BIP_ABC")], vec![ParamType::Bool]);
        let queries = vec![query("User", false, eq("users", "name", json!("BIP_ABC")))];

        search_queries_for_params([&mut name, &mut flag].into_iter(), &queries);

        let latest = name.latest_query_metadata();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].table, "users");
        assert_eq!(latest[0].column, "name");
        assert!(!latest[0].query.successful);
        assert!(flag.latest_query_metadata().is_empty());
    }
}
