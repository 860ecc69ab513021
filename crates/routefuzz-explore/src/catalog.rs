//! Route catalog: every endpoint the engine may request.
//!
//! The catalog is built from two files produced offline:
//!
//! - the route listing (`routes.json`): verb, path template and dynamic
//!   segment names for every endpoint the application defines
//! - optional seed examples: requests recorded while a human used the
//!   application, with parameter values and inferred types
//!
//! Seeds replace the bare catalog entry with the same verb and path, so
//! whatever the replay phase learns about a route carries over to the
//! exhaustive phase.

use crate::param::{dedup_params, flatten_param, Param, ParamSpec, QUERY_HISTORY};
use crate::query::{canonical_key, filter_queries};
use log::{info, warn};
use routefuzz_target::{value_text, HttpRequest, QueryRecord};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Paths never requested: they wipe state or break the harness.
pub const DEFAULT_ROUTE_EXCLUDES: &[&str] = &[
    "/admin/backups/readonly",
    "/admin/site_settings/:id",
    "/rails/info/clear_all_connections",
];

/// Lower-case verb → headers sent on routes without a recorded example.
pub type DefaultHeaders = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed catalog file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed route {0:?}, expected VERB:/path")]
    Pattern(String),
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    path: String,
    verb: String,
    #[serde(default)]
    segments: Vec<String>,
}

/// One recorded request.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntry {
    pub path: String,
    pub verb: String,
    #[serde(default)]
    pub browser_status_code: Option<u16>,
    #[serde(default)]
    pub har_status_code: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: Vec<ParamSpec>,
    #[serde(default)]
    pub body_params: Vec<ParamSpec>,
    #[serde(default)]
    pub dynamic_segments: Vec<ParamSpec>,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub path: String,
    pub verb: String,
    pub headers: BTreeMap<String, String>,
    pub dynamic_segments: Vec<Param>,
    pub query_params: Vec<Param>,
    pub body_params: Vec<Param>,
    /// Status the seed request got when it was recorded.
    pub seed_status: Option<u16>,
    /// Status the browser saw for the seed request.
    pub browser_status: Option<u16>,
    /// Queries per request, newest first.
    queries: Vec<Vec<QueryRecord>>,
    /// Canonical shapes of every query seen on this route.
    unique_queries: BTreeSet<String>,
}

impl Route {
    pub fn new(verb: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            verb: verb.into().to_ascii_uppercase(),
            headers: BTreeMap::new(),
            dynamic_segments: Vec::new(),
            query_params: Vec::new(),
            body_params: Vec::new(),
            seed_status: None,
            browser_status: None,
            queries: Vec::new(),
            unique_queries: BTreeSet::new(),
        }
    }

    fn from_entry(entry: RouteEntry, default_headers: &DefaultHeaders) -> Self {
        let mut route = Route::new(entry.verb, entry.path);
        route.dynamic_segments = entry.segments.into_iter().map(Param::discovered).collect();
        if let Some(headers) = default_headers.get(&route.verb.to_ascii_lowercase()) {
            route.headers = headers.clone();
        }
        route
    }

    pub fn from_seed(seed: SeedEntry) -> Self {
        let mut route = Route::new(seed.verb, seed.path);
        route.headers = seed.headers;
        route.seed_status = seed.har_status_code;
        route.browser_status = seed.browser_status_code;
        route.query_params = seed.query_params.into_iter().map(Param::from).collect();
        route.body_params = seed.body_params.into_iter().map(Param::from).collect();
        route.dynamic_segments = seed.dynamic_segments.into_iter().map(Param::from).collect();
        route
    }

    /// `VERB path`, for logs.
    pub fn label(&self) -> String {
        format!("{} {}", self.verb, self.path)
    }

    pub fn same_endpoint(&self, verb: &str, path: &str) -> bool {
        self.verb.eq_ignore_ascii_case(verb) && self.path == path
    }

    /// Case-insensitive match against `VERB:/path`.
    pub fn matches(&self, pattern: &str) -> bool {
        match pattern.split_once(':') {
            Some((verb, path)) => {
                self.verb.eq_ignore_ascii_case(verb) && self.path.eq_ignore_ascii_case(path)
            }
            None => false,
        }
    }

    /// Verb and path with `/` replaced, usable as a file name.
    pub fn unique_id(&self) -> String {
        format!("{}{}", self.verb, self.path).replace('/', "_")
    }

    /// URL with every held dynamic segment substituted; segments without a
    /// value are left as `:name`.
    pub fn url(&self, hostname: &str, port: u16) -> String {
        let template = self.path.trim_end_matches("(.:format)");
        let path: Vec<String> = template
            .split('/')
            .map(|segment| {
                segment
                    .strip_prefix(':')
                    .and_then(|name| self.dynamic_segments.iter().find(|p| p.name == name))
                    .and_then(|p| p.next_val.as_ref())
                    .map(value_text)
                    .unwrap_or_else(|| segment.to_string())
            })
            .collect();
        format!("http://{}:{}{}", hostname, port, path.join("/"))
    }

    pub fn get_body_params(&self) -> BTreeMap<String, Value> {
        held_values(&self.body_params)
    }

    pub fn get_query_params(&self) -> BTreeMap<String, Value> {
        held_values(&self.query_params)
    }

    pub fn to_request(&self, hostname: &str, port: u16) -> HttpRequest {
        HttpRequest {
            url: self.url(hostname, port),
            verb: self.verb.clone(),
            body_params: self.get_body_params(),
            query_params: self.get_query_params(),
            headers: self.headers.clone(),
        }
    }

    pub fn params(&self) -> impl Iterator<Item = &Param> {
        self.body_params
            .iter()
            .chain(self.query_params.iter())
            .chain(self.dynamic_segments.iter())
    }

    pub fn params_mut(&mut self) -> impl Iterator<Item = &mut Param> {
        self.body_params
            .iter_mut()
            .chain(self.query_params.iter_mut())
            .chain(self.dynamic_segments.iter_mut())
    }

    /// (name, value) for every parameter the next request carries.
    pub fn params_sent(&self) -> Vec<(&str, &Value)> {
        self.params()
            .filter_map(|p| p.next_val.as_ref().map(|v| (p.name.as_str(), v)))
            .collect()
    }

    /// Store the queries of the latest request.
    ///
    /// Returns true when any of them has a shape never seen on this route.
    pub fn record_queries(&mut self, queries: Vec<QueryRecord>) -> bool {
        let kept = filter_queries(queries);
        let mut fresh = false;
        for query in &kept {
            fresh |= self.unique_queries.insert(canonical_key(query));
        }
        self.queries.insert(0, kept);
        self.queries.truncate(QUERY_HISTORY);
        fresh
    }

    /// Queries made by the latest request.
    pub fn latest_queries(&self) -> &[QueryRecord] {
        self.queries.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Add parameters the target read but the route did not carry.
    /// GET routes get them as query params, others as body params.
    pub fn discover_params(&mut self, paths: &[Vec<String>]) -> usize {
        let mut added = 0;
        for path in dedup_params(paths) {
            let name = flatten_param(&path);
            if self.params().any(|p| p.name == name) {
                continue;
            }
            info!("discovered param {} on {}", name, self.label());
            let param = Param::discovered(name);
            if self.verb == "GET" {
                self.query_params.push(param);
            } else {
                self.body_params.push(param);
            }
            added += 1;
        }
        added
    }

    /// Fold another recording of this endpoint into its seed values.
    fn absorb_seed(&mut self, other: Route) {
        let Route {
            query_params,
            body_params,
            dynamic_segments,
            ..
        } = other;
        absorb_params(&mut self.query_params, query_params);
        absorb_params(&mut self.body_params, body_params);
        absorb_params(&mut self.dynamic_segments, dynamic_segments);
    }
}

fn held_values(params: &[Param]) -> BTreeMap<String, Value> {
    params
        .iter()
        .filter_map(|p| p.next_val.clone().map(|v| (p.name.clone(), v)))
        .collect()
}

fn absorb_params(into: &mut Vec<Param>, from: Vec<Param>) {
    for param in from {
        match into.iter_mut().find(|p| p.name == param.name) {
            Some(existing) => {
                for value in param.seed_values {
                    if !existing.seed_values.contains(&value) {
                        existing.seed_values.push(value);
                    }
                }
            }
            None => into.push(param),
        }
    }
}

/// Split `VERB:/path`.
pub fn parse_route_pattern(pattern: &str) -> Result<(String, String), CatalogError> {
    match pattern.split_once(':') {
        Some((verb, path)) if !verb.is_empty() && path.starts_with('/') => {
            Ok((verb.to_ascii_uppercase(), path.to_string()))
        }
        _ => Err(CatalogError::Pattern(pattern.to_string())),
    }
}

/// All routes plus the replay order of the seeded ones.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub routes: Vec<Route>,
    /// Indices into `routes`, in recording order.
    pub seeds: Vec<usize>,
}

impl Catalog {
    /// Merge `seeds` into `routes` and drop excluded paths.
    pub fn new(routes: Vec<Route>, seeds: Vec<Route>, excludes: &[String]) -> Self {
        let excluded = |route: &Route| excludes.iter().any(|e| *e == route.path);
        let mut catalog = Catalog {
            routes: routes.into_iter().filter(|r| !excluded(r)).collect(),
            seeds: Vec::new(),
        };

        for seed in seeds {
            if excluded(&seed) {
                continue;
            }
            match catalog
                .routes
                .iter()
                .position(|r| r.same_endpoint(&seed.verb, &seed.path))
            {
                Some(idx) if catalog.seeds.contains(&idx) => catalog.routes[idx].absorb_seed(seed),
                Some(idx) => {
                    let defaults = std::mem::replace(&mut catalog.routes[idx], seed);
                    if catalog.routes[idx].headers.is_empty() {
                        catalog.routes[idx].headers = defaults.headers;
                    }
                    catalog.seeds.push(idx);
                }
                None => {
                    warn!("seed {} not in route listing, appending", seed.label());
                    catalog.routes.push(seed);
                    catalog.seeds.push(catalog.routes.len() - 1);
                }
            }
        }
        catalog
    }

    pub fn load(
        routes_path: &Path,
        seeds_path: Option<&Path>,
        default_headers: &DefaultHeaders,
        excludes: &[String],
    ) -> Result<Self, CatalogError> {
        let entries: Vec<RouteEntry> = read_json(routes_path)?;
        let routes = entries
            .into_iter()
            .map(|e| Route::from_entry(e, default_headers))
            .collect();
        let seeds = match seeds_path {
            Some(path) => read_json::<Vec<SeedEntry>>(path)?
                .into_iter()
                .map(Route::from_seed)
                .collect(),
            None => Vec::new(),
        };
        let catalog = Catalog::new(routes, seeds, excludes);
        info!(
            "loaded {} routes ({} seeded) from {}",
            catalog.routes.len(),
            catalog.seeds.len(),
            routes_path.display()
        );
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Index of the first route matching `VERB:/path`.
    pub fn find(&self, pattern: &str) -> Option<usize> {
        self.routes.iter().position(|r| r.matches(pattern))
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CatalogError> {
    let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CatalogError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ParamType;
    use serde_json::json;
    use tempfile::TempDir;

    fn seed_post() -> Route {
        let mut route = Route::new("post", "/posts");
        route.seed_status = Some(302);
        route.body_params = vec![
            Param::new("post[title]", vec![json!("hello")], vec![ParamType::String]),
            Param::discovered("post[draft]"),
        ];
        route
    }

    #[test]
    fn test_url_substitutes_segments() {
        let mut route = Route::new("GET", "/posts/:id/comments/:comment_id(.:format)");
        route.dynamic_segments = vec![
            Param::new("id", vec![json!(12)], vec![ParamType::Int]),
            Param::discovered("comment_id"),
        ];
        assert_eq!(
            route.url("localhost", 3000),
            "http://localhost:3000/posts/12/comments/:comment_id"
        );
    }

    #[test]
    fn test_segment_names_match_exactly() {
        let mut route = Route::new("GET", "/users/:id/:id2");
        route.dynamic_segments = vec![
            Param::new("id", vec![json!("a")], vec![]),
            Param::new("id2", vec![json!("b")], vec![]),
        ];
        assert_eq!(route.url("h", 1), "http://h:1/users/a/b");
    }

    #[test]
    fn test_matches_and_unique_id() {
        let route = Route::new("get", "/Posts/:id");
        assert!(route.matches("GET:/posts/:id"));
        assert!(!route.matches("POST:/posts/:id"));
        assert!(!route.matches("garbage"));
        assert_eq!(route.unique_id(), "GET_Posts_:id");
    }

    #[test]
    fn test_held_params_only() {
        let route = seed_post();
        let body = route.get_body_params();
        assert_eq!(body.len(), 1);
        assert_eq!(body["post[title]"], json!("hello"));
        assert!(route.get_query_params().is_empty());
        let req = route.to_request("localhost", 80);
        assert_eq!(req.verb, "POST");
        assert_eq!(req.body_params, body);
    }

    #[test]
    fn test_seed_replaces_catalog_route() {
        let mut listed = Route::new("POST", "/posts");
        listed.headers.insert("Accept".into(), "text/html".into());
        let catalog = Catalog::new(
            vec![Route::new("GET", "/posts"), listed],
            vec![seed_post()],
            &[],
        );
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.seeds, vec![1]);
        assert_eq!(catalog.routes[1].seed_status, Some(302));
        assert_eq!(catalog.routes[1].headers["Accept"], "text/html");
    }

    #[test]
    fn test_duplicate_seed_merges_values() {
        let mut second = seed_post();
        second.body_params[0] = Param::new("post[title]", vec![json!("again")], vec![]);
        let catalog = Catalog::new(vec![], vec![seed_post(), second], &[]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.seeds, vec![0]);
        assert_eq!(
            catalog.routes[0].body_params[0].seed_values,
            vec![json!("hello"), json!("again")]
        );
    }

    #[test]
    fn test_excludes_drop_routes() {
        let excludes: Vec<String> = DEFAULT_ROUTE_EXCLUDES.iter().map(|s| s.to_string()).collect();
        let catalog = Catalog::new(
            vec![
                Route::new("GET", "/rails/info/clear_all_connections"),
                Route::new("GET", "/posts"),
            ],
            vec![Route::new("PUT", "/admin/site_settings/:id")],
            &excludes,
        );
        assert_eq!(catalog.len(), 1);
        assert!(catalog.seeds.is_empty());
        assert_eq!(catalog.find("get:/posts"), Some(0));
    }

    #[test]
    fn test_discover_params() {
        let mut get = Route::new("GET", "/search");
        get.query_params.push(Param::new("q", vec![json!("x")], vec![]));
        let added = get.discover_params(&[
            vec!["q".into()],
            vec!["filter".into()],
            vec!["filter".into(), "tag".into()],
        ]);
        assert_eq!(added, 1);
        assert_eq!(get.query_params[1].name, "filter[tag]");
        assert_eq!(get.query_params[1].next_val, None);

        let mut post = seed_post();
        post.discover_params(&[vec!["post".into(), "raw".into()]]);
        assert_eq!(post.body_params.last().unwrap().name, "post[raw]");
    }

    #[test]
    fn test_record_queries_reports_new_shapes() {
        let q = |v: i64| -> QueryRecord {
            serde_json::from_value(json!({
                "successful": true, "method": "read", "model": "Post",
                "query": {"where_clause": {
                    "type": "equality",
                    "left": {"table": "posts", "attribute_name": "id"},
                    "right": {"value": v}
                }}
            }))
            .unwrap()
        };
        let mut route = Route::new("GET", "/posts/:id");
        assert!(route.record_queries(vec![q(1)]));
        assert!(!route.record_queries(vec![q(2)]));
        assert_eq!(route.latest_queries().len(), 1);
        assert!(!route.record_queries(vec![]));
        assert!(route.latest_queries().is_empty());
    }

    #[test]
    fn test_parse_route_pattern() {
        assert_eq!(
            parse_route_pattern("get:/posts").unwrap(),
            ("GET".to_string(), "/posts".to_string())
        );
        assert!(parse_route_pattern("/posts").is_err());
        assert!(parse_route_pattern(":/posts").is_err());
    }

    #[test]
    fn test_load_from_files() {
        let dir = TempDir::new().unwrap();
        let routes = dir.path().join("routes.json");
        let seeds = dir.path().join("seeds.json");
        fs::write(
            &routes,
            r#"[{"path": "/posts/:id", "verb": "GET", "segments": ["id"]},
                {"path": "/posts", "verb": "POST"}]"#,
        )
        .unwrap();
        fs::write(
            &seeds,
            r#"[{"path": "/posts", "verb": "POST", "har_status_code": 302,
                 "headers": {"Content-Type": "application/json"},
                 "body_params": [{"name": "post[title]", "values": ["", "hi"], "types": ["string"]}]}]"#,
        )
        .unwrap();
        let mut defaults = DefaultHeaders::new();
        defaults.insert(
            "get".into(),
            BTreeMap::from([("Accept".to_string(), "text/html".to_string())]),
        );

        let catalog = Catalog::load(&routes, Some(&seeds), &defaults, &[]).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.seeds, vec![1]);
        assert_eq!(catalog.routes[0].headers["Accept"], "text/html");
        assert_eq!(catalog.routes[0].dynamic_segments[0].name, "id");
        assert_eq!(
            catalog.routes[1].body_params[0].next_val,
            Some(json!("hi"))
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = Catalog::load(Path::new("/nonexistent/routes.json"), None, &DefaultHeaders::new(), &[])
            .unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
    }
}
