//! Request parameters and their value history.

use crate::query::QueryMetadata;
use crate::rng::FuzzRng;
use log::debug;
use rand::Rng;
use routefuzz_target::{value_text, Storage, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on random-offset lookups per live-value search.
pub const MAX_LOOKUPS: u64 = 25;

/// Requests of query metadata kept per parameter.
pub const QUERY_HISTORY: usize = 32;

const RANDOM_STR_PREFIX: &str = "BIP_";
const RANDOM_STR_LEN: usize = 10;
const RANDOM_STR_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Type tag inferred for a parameter from recorded traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    #[serde(rename = "int", alias = "integer")]
    Int,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "boolean", alias = "bool")]
    Bool,
    #[serde(rename = "ts", alias = "timestamp")]
    Timestamp,
    #[serde(rename = "unknown")]
    #[serde(other)]
    Unknown,
}

/// Parameter as described in a route catalog or seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub types: Vec<ParamType>,
}

impl From<ParamSpec> for Param {
    fn from(spec: ParamSpec) -> Self {
        Param::new(spec.name, spec.values, spec.types)
    }
}

/// One request parameter.
///
/// `prev_vals[0]` is always the value held in `next_val`.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub types: Vec<ParamType>,
    /// Values seen in recorded traffic, empty strings removed.
    pub seed_values: Vec<Value>,
    /// Value for the next request; `None` omits the parameter.
    pub next_val: Option<Value>,
    /// Every value held so far, newest first.
    pub prev_vals: Vec<Option<Value>>,
    /// Per request, newest first: where the value reached a query.
    query_metadata: Vec<Vec<QueryMetadata>>,
}

impl Param {
    /// A parameter starts out holding its first seed value, if any.
    pub fn new(name: impl Into<String>, values: Vec<Value>, types: Vec<ParamType>) -> Self {
        let seed_values: Vec<Value> = values
            .into_iter()
            .filter(|v| !matches!(v, Value::String(s) if s.is_empty()))
            .collect();
        let next_val = seed_values.first().cloned();
        Self {
            name: name.into(),
            types,
            seed_values,
            prev_vals: vec![next_val.clone()],
            next_val,
            query_metadata: Vec::new(),
        }
    }

    /// A parameter the target read but that no recorded request carried.
    pub fn discovered(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new(), Vec::new())
    }

    pub fn primary_type(&self) -> ParamType {
        self.types.first().copied().unwrap_or(ParamType::Unknown)
    }

    /// Whether `text` was ever held by this parameter.
    pub fn was_sent(&self, text: &str) -> bool {
        self.prev_vals
            .iter()
            .flatten()
            .any(|prev| value_text(prev) == text)
    }

    /// First seed value never sent, else the first seed value.
    pub fn seed_value(&self) -> Option<Value> {
        self.seed_values
            .iter()
            .find(|v| !self.prev_vals.iter().any(|p| p.as_ref() == Some(*v)))
            .or_else(|| self.seed_values.first())
            .cloned()
    }

    pub fn set_next_val(&mut self, value: Option<Value>) {
        self.prev_vals.insert(0, value.clone());
        self.next_val = value;
    }

    pub fn push_query_metadata(&mut self, found: Vec<QueryMetadata>) {
        self.query_metadata.insert(0, found);
        self.query_metadata.truncate(QUERY_HISTORY);
    }

    /// Query matches for the latest request.
    pub fn latest_query_metadata(&self) -> &[QueryMetadata] {
        self.query_metadata.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replace the value with an arbitrary one of the parameter's type.
    ///
    /// With `respect_seed`, a parameter that is currently omitted stays
    /// omitted.
    pub fn mutate_naive(&mut self, respect_seed: bool, rng: &mut FuzzRng) {
        if respect_seed && self.next_val.is_none() {
            return;
        }
        let value = match self.primary_type() {
            ParamType::Int => Value::from(random_int(rng)),
            ParamType::Float => Value::from(random_float(rng)),
            ParamType::Bool => Value::Bool(rng.gen()),
            ParamType::Timestamp => Value::String(random_timestamp(rng)),
            ParamType::String | ParamType::Unknown => Value::String(random_str(rng)),
        };
        self.set_next_val(Some(value));
    }

    /// Find a value stored in `table.column` that was never sent.
    ///
    /// An empty table falls back to the seed values, as does a search that
    /// only turns up values already sent.
    pub fn lookup_live_value(
        &self,
        table: &str,
        column: &str,
        storage: &mut dyn Storage,
        rng: &mut FuzzRng,
    ) -> Result<Option<Value>, StoreError> {
        let rows = storage.count_rows(table)?;
        if rows == 0 {
            debug!("{} is empty, using seed value for {}", table, self.name);
            return Ok(self.seed_value());
        }
        for _ in 0..rows.min(MAX_LOOKUPS) {
            let offset = rng.gen_range(0..rows);
            match storage.lookup(table, column, offset)? {
                Some(found) if !self.was_sent(&found) => return Ok(Some(Value::String(found))),
                _ => {}
            }
        }
        Ok(self.seed_value())
    }

    /// Move to a live value from `table.column`.
    pub fn update_from_store(
        &mut self,
        table: &str,
        column: &str,
        storage: &mut dyn Storage,
        rng: &mut FuzzRng,
    ) -> Result<Option<Value>, StoreError> {
        let value = self.lookup_live_value(table, column, storage, rng)?;
        self.set_next_val(value.clone());
        Ok(value)
    }
}

pub fn random_str(rng: &mut FuzzRng) -> String {
    let mut s = String::from(RANDOM_STR_PREFIX);
    for _ in 0..RANDOM_STR_LEN {
        let idx = rng.gen_range(0..RANDOM_STR_ALPHABET.len());
        s.push(RANDOM_STR_ALPHABET[idx] as char);
    }
    s
}

pub fn random_int(rng: &mut FuzzRng) -> u64 {
    rng.gen_range(1..=1_000_000)
}

/// Two-decimal float.
pub fn random_float(rng: &mut FuzzRng) -> f64 {
    rng.gen_range(0..100_000_000u64) as f64 / 100.0
}

/// `YYYY-MM-DD HH:MM:SS`.
pub fn random_timestamp(rng: &mut FuzzRng) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        rng.gen_range(2000..=2030),
        rng.gen_range(1..=12),
        rng.gen_range(1..=28),
        rng.gen_range(0..24),
        rng.gen_range(0..60),
        rng.gen_range(0..60)
    )
}

/// `["post", "raw"]` → `post[raw]`.
pub fn flatten_param(path: &[String]) -> String {
    let mut parts = path.iter();
    let mut flat = parts.next().cloned().unwrap_or_default();
    for key in parts {
        flat.push('[');
        flat.push_str(key);
        flat.push(']');
    }
    flat
}

#[derive(Default)]
struct KeyTrie {
    children: Vec<(String, KeyTrie)>,
}

impl KeyTrie {
    fn insert(&mut self, path: &[String]) {
        let Some((head, rest)) = path.split_first() else {
            return;
        };
        let pos = match self.children.iter().position(|(k, _)| k == head) {
            Some(pos) => pos,
            None => {
                self.children.push((head.clone(), KeyTrie::default()));
                self.children.len() - 1
            }
        };
        self.children[pos].1.insert(rest);
    }

    fn leaves(&self, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
        for (key, child) in &self.children {
            prefix.push(key.clone());
            if child.children.is_empty() {
                out.push(prefix.clone());
            } else {
                child.leaves(prefix, out);
            }
            prefix.pop();
        }
    }
}

/// Leaf key paths only: `[["post","raw"], ["post"]]` → `[["post","raw"]]`.
/// First-seen order is kept.
pub fn dedup_params(paths: &[Vec<String>]) -> Vec<Vec<String>> {
    let mut trie = KeyTrie::default();
    for path in paths {
        trie.insert(path);
    }
    let mut out = Vec::new();
    trie.leaves(&mut Vec::new(), &mut out);
    out
}
