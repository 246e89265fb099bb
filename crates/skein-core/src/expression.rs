//! Expression resolution for executor specs.
//!
//! Specs embed `${{ inputs.X }}` / `${{ secrets.X }}` tokens anywhere in
//! their string leaves, including multiple tokens per string mixed with
//! literal text. Resolution walks the whole spec recursively (maps, lists,
//! string leaves; non-strings pass through).
//!
//! A string that is exactly one token resolves to the bound value's native
//! type unchanged; a string containing a token among other text stringifies
//! the resolved value into place. Resolution fails closed: any unresolvable
//! key aborts the entire build with an error naming the missing key and its
//! namespace -- no partial result is ever returned.
//!
//! **Security note:** secret values appear only in the transient resolved
//! document handed to the executor; the persisted configuration snapshot
//! keeps the raw tokens.

use std::collections::HashMap;

use serde_json::Value;

const TOKEN_OPEN: &str = "${{";
const TOKEN_CLOSE: &str = "}}";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during spec resolution.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolverError {
    /// The token references a namespace other than inputs/secrets.
    #[error("unknown namespace '{namespace}' in expression '{token}'")]
    UnknownNamespace { namespace: String, token: String },

    /// The referenced key has no bound value.
    #[error("no {namespace} value named '{key}'")]
    MissingKey { namespace: String, key: String },

    /// A `${{` with no matching `}}`.
    #[error("unterminated expression in '{0}'")]
    Unterminated(String),

    /// A token without a `namespace.key` shape.
    #[error("malformed expression token '{0}'")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// The per-execution values expressions resolve against.
///
/// Supplied already-resolved by the binding provider; how inputs were
/// computed or secrets decrypted is not this layer's concern.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    pub inputs: HashMap<String, Value>,
    pub secrets: HashMap<String, Value>,
}

impl Bindings {
    fn lookup(&self, namespace: &str, key: &str, token: &str) -> Result<&Value, ResolverError> {
        let map = match namespace {
            "inputs" => &self.inputs,
            "secrets" => &self.secrets,
            other => {
                return Err(ResolverError::UnknownNamespace {
                    namespace: other.to_string(),
                    token: token.to_string(),
                });
            }
        };
        map.get(key).ok_or_else(|| ResolverError::MissingKey {
            namespace: namespace.to_string(),
            key: key.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve every expression token in a spec document.
///
/// Walks maps and lists recursively; non-string leaves pass through
/// untouched. The first unresolvable token aborts the whole walk.
pub fn resolve_spec(spec: &Value, bindings: &Bindings) -> Result<Value, ResolverError> {
    match spec {
        Value::String(s) => resolve_string(s, bindings),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_spec(item, bindings)?);
            }
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), resolve_spec(value, bindings)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Resolve tokens within a single string leaf.
fn resolve_string(s: &str, bindings: &Bindings) -> Result<Value, ResolverError> {
    let Some(first) = s.find(TOKEN_OPEN) else {
        return Ok(Value::String(s.to_string()));
    };

    // Exactly-one-token case: the whole string is the token, so the bound
    // value keeps its native type.
    if first == 0 {
        if let Some(inner) = s
            .strip_prefix(TOKEN_OPEN)
            .and_then(|rest| rest.strip_suffix(TOKEN_CLOSE))
        {
            if !inner.contains(TOKEN_OPEN) {
                let (namespace, key) = parse_token(inner, s)?;
                return Ok(bindings.lookup(namespace, key, s)?.clone());
            }
        }
    }

    // Interpolation case: stringify each resolved value into place.
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find(TOKEN_OPEN) {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + TOKEN_OPEN.len()..];
        let Some(close) = after_open.find(TOKEN_CLOSE) else {
            return Err(ResolverError::Unterminated(s.to_string()));
        };
        let inner = &after_open[..close];
        let (namespace, key) = parse_token(inner, s)?;
        let value = bindings.lookup(namespace, key, s)?;
        out.push_str(&stringify(value));
        rest = &after_open[close + TOKEN_CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Split a token body into (namespace, key).
fn parse_token<'a>(inner: &'a str, whole: &str) -> Result<(&'a str, &'a str), ResolverError> {
    let trimmed = inner.trim();
    let Some((namespace, key)) = trimmed.split_once('.') else {
        return Err(ResolverError::Malformed(whole.to_string()));
    };
    if namespace.is_empty() || key.is_empty() {
        return Err(ResolverError::Malformed(whole.to_string()));
    }
    Ok((namespace, key))
}

/// Render a bound value into surrounding literal text.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
