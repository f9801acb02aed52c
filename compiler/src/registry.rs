// registry.rs — Signature catalog
//
// A read-only table from function id to its ordered list of generalized
// signatures, optional join policy, and reducer identity. The core catalog
// is embedded JSON; further catalogs can be layered on with `--catalog`.
// The registry is built once before compilation and only borrowed after.
//
// Preconditions: catalog JSON follows the `{"functions": [...]}` layout.
// Postconditions: every function has at least one parsed signature.
// Failure modes: I/O errors, malformed JSON, bad signature notation,
//   duplicate function ids.
// Side effects: reads catalog files from disk (`load_file` only).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::ast::Literal;

const CORE_CATALOG: &str = include_str!("../catalog/core.json");

// ── Signature notation ──────────────────────────────────────────────────────

/// How disjoint argument shapes combine when a function allows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinPolicy {
    Zip,
    Product,
}

impl fmt::Display for JoinPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinPolicy::Zip => f.write_str("zip"),
            JoinPolicy::Product => f.write_str("product"),
        }
    }
}

/// One dimension variable of a cell pattern: `i`, `i?` (may be absent),
/// or `i|1` (may be absent, broadcast from length one).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimVar {
    pub name: String,
    pub optional: bool,
    pub broadcastable: bool,
}

impl DimVar {
    /// True when the variable may match no axis.
    pub fn may_be_absent(&self) -> bool {
        self.optional || self.broadcastable
    }
}

impl fmt::Display for DimVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.optional {
            write!(f, "?")?;
        }
        if self.broadcastable {
            write!(f, "|1")?;
        }
        Ok(())
    }
}

/// A generalized signature such as `(i),(i)->(i) @zip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub inputs: Vec<Vec<DimVar>>,
    pub output: Vec<DimVar>,
    pub join: Option<JoinPolicy>,
}

impl Signature {
    pub fn arity(&self) -> usize {
        self.inputs.len()
    }
}

fn parse_dim(text: &str) -> Result<DimVar, String> {
    let text = text.trim();
    let (body, broadcastable) = match text.strip_suffix("|1") {
        Some(rest) => (rest, true),
        None => (text, false),
    };
    let (name, optional) = match body.strip_suffix('?') {
        Some(rest) => (rest, true),
        None => (body, false),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("invalid dimension '{}'", text));
    }
    Ok(DimVar {
        name: name.to_string(),
        optional,
        broadcastable,
    })
}

/// Parse `(a, b),(c)` into groups of dimension variables.
fn parse_groups(text: &str) -> Result<Vec<Vec<DimVar>>, String> {
    let mut groups = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let inner_start = rest
            .strip_prefix('(')
            .ok_or_else(|| format!("expected '(' at '{}'", rest))?;
        let close = inner_start
            .find(')')
            .ok_or_else(|| "unclosed '('".to_string())?;
        let inner = &inner_start[..close];
        let dims = if inner.trim().is_empty() {
            Vec::new()
        } else {
            inner.split(',').map(parse_dim).collect::<Result<Vec<_>, _>>()?
        };
        groups.push(dims);
        rest = inner_start[close + 1..].trim_start();
        if let Some(after) = rest.strip_prefix(',') {
            rest = after.trim_start();
            if rest.is_empty() {
                return Err("trailing ','".to_string());
            }
        } else if !rest.is_empty() {
            return Err(format!("expected ',' at '{}'", rest));
        }
    }
    Ok(groups)
}

impl FromStr for Signature {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (lhs, rhs) = text
            .split_once("->")
            .ok_or_else(|| "missing '->'".to_string())?;
        let (rhs, join) = match rhs.split_once('@') {
            Some((out, policy)) => {
                let policy = match policy.trim() {
                    "zip" => JoinPolicy::Zip,
                    "product" => JoinPolicy::Product,
                    other => return Err(format!("unknown join policy '@{}'", other)),
                };
                (out, Some(policy))
            }
            None => (rhs, None),
        };

        let inputs = parse_groups(lhs)?;
        if inputs.is_empty() {
            return Err("signature takes no arguments".to_string());
        }
        let mut outputs = parse_groups(rhs)?;
        if outputs.len() != 1 {
            return Err("expected exactly one output pattern".to_string());
        }
        let output = outputs.remove(0);

        for var in &output {
            if !inputs.iter().flatten().any(|v| v.name == var.name) {
                return Err(format!("output dimension '{}' is not bound by any input", var.name));
            }
        }

        Ok(Signature {
            inputs,
            output,
            join,
        })
    }
}

fn fmt_group(f: &mut fmt::Formatter<'_>, group: &[DimVar]) -> fmt::Result {
    write!(f, "(")?;
    for (i, dim) in group.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "{}", dim)?;
    }
    write!(f, ")")
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.inputs.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            fmt_group(f, group)?;
        }
        write!(f, "->")?;
        fmt_group(f, &self.output)?;
        if let Some(join) = self.join {
            write!(f, " @{}", join)?;
        }
        Ok(())
    }
}

// ── Catalog entries ─────────────────────────────────────────────────────────

/// Reduction metadata: the accumulator's starting value, if any. Without an
/// identity the accumulator starts empty and takes the first element.
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceSpec {
    pub identity: Option<Literal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionEntry {
    pub id: String,
    pub signatures: Vec<Signature>,
    pub reduce: Option<ReduceSpec>,
}

impl FunctionEntry {
    pub fn is_reducer(&self) -> bool {
        self.reduce.is_some()
    }

    /// Join policy of the first signature that declares one.
    pub fn join_policy(&self) -> Option<JoinPolicy> {
        self.signatures.iter().find_map(|s| s.join)
    }
}

// ── JSON layout ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CatalogFile {
    functions: Vec<FunctionDef>,
}

#[derive(Debug, Deserialize)]
struct FunctionDef {
    id: String,
    signatures: Vec<String>,
    #[serde(default)]
    reduce: Option<ReduceDef>,
}

#[derive(Debug, Deserialize)]
struct ReduceDef {
    #[serde(default)]
    identity: Option<serde_json::Value>,
}

// ── Errors ──────────────────────────────────────────────────────────────────

/// Errors that can occur during registry loading.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed catalog: {0}")]
    Json(#[from] serde_json::Error),

    #[error("function '{fn_id}': bad signature '{text}': {message}")]
    BadSignature {
        fn_id: String,
        text: String,
        message: String,
    },

    #[error("function '{fn_id}' declares no signatures")]
    NoSignatures { fn_id: String },

    #[error("function '{fn_id}': reducer identity must be a scalar")]
    BadIdentity { fn_id: String },

    #[error("function '{name}' is defined more than once")]
    DuplicateFunction { name: String },
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Function signature registry. Ordered by id for deterministic output.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    functions: BTreeMap<String, FunctionEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            functions: BTreeMap::new(),
        }
    }

    /// A registry holding the embedded core catalog.
    pub fn builtin() -> Result<Self, RegistryError> {
        let mut registry = Registry::new();
        registry.load_json_str(CORE_CATALOG)?;
        Ok(registry)
    }

    /// Load functions from catalog JSON text. Returns the number added.
    pub fn load_json_str(&mut self, json: &str) -> Result<usize, RegistryError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        let count = file.functions.len();
        for def in file.functions {
            let entry = build_entry(def)?;
            self.insert(entry)?;
        }
        Ok(count)
    }

    /// Load functions from a catalog JSON file. Returns the number added.
    pub fn load_file(&mut self, path: &Path) -> Result<usize, RegistryError> {
        let json = std::fs::read_to_string(path).map_err(|e| RegistryError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.load_json_str(&json)
    }

    pub fn insert(&mut self, entry: FunctionEntry) -> Result<(), RegistryError> {
        if self.functions.contains_key(&entry.id) {
            return Err(RegistryError::DuplicateFunction { name: entry.id });
        }
        self.functions.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&FunctionEntry> {
        self.functions.get(name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionEntry> {
        self.functions.values()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn join_policy(&self, name: &str) -> Option<JoinPolicy> {
        self.lookup(name).and_then(FunctionEntry::join_policy)
    }

    /// Compact JSON with functions sorted by id, independent of the order
    /// catalogs were loaded in. Used for the provenance fingerprint.
    pub fn canonical_json(&self) -> String {
        let functions: Vec<serde_json::Value> = self
            .functions
            .values()
            .map(|f| {
                let mut obj = serde_json::Map::new();
                obj.insert("id".into(), serde_json::Value::String(f.id.clone()));
                obj.insert(
                    "signatures".into(),
                    serde_json::Value::Array(
                        f.signatures
                            .iter()
                            .map(|s| serde_json::Value::String(s.to_string()))
                            .collect(),
                    ),
                );
                if let Some(reduce) = &f.reduce {
                    let identity = reduce
                        .identity
                        .as_ref()
                        .map(Literal::to_json)
                        .unwrap_or(serde_json::Value::Null);
                    obj.insert("reduce".into(), serde_json::json!({ "identity": identity }));
                }
                serde_json::Value::Object(obj)
            })
            .collect();
        serde_json::json!({ "functions": functions }).to_string()
    }
}

fn build_entry(def: FunctionDef) -> Result<FunctionEntry, RegistryError> {
    if def.signatures.is_empty() {
        return Err(RegistryError::NoSignatures { fn_id: def.id });
    }
    let mut signatures = Vec::with_capacity(def.signatures.len());
    for text in &def.signatures {
        let sig = text
            .parse::<Signature>()
            .map_err(|message| RegistryError::BadSignature {
                fn_id: def.id.clone(),
                text: text.clone(),
                message,
            })?;
        signatures.push(sig);
    }
    let reduce = match def.reduce {
        Some(ReduceDef { identity: None }) => Some(ReduceSpec { identity: None }),
        Some(ReduceDef {
            identity: Some(value),
        }) => {
            let literal = Literal::from_json(&value)
                .ok_or_else(|| RegistryError::BadIdentity { fn_id: def.id.clone() })?;
            Some(ReduceSpec {
                identity: Some(literal),
            })
        }
        None => None,
    };
    Ok(FunctionEntry {
        id: def.id,
        signatures,
        reduce,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────
