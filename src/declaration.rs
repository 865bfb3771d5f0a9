//! JSON declaration documents.
//!
//! ```json
//! {
//!   "variables": { "azs": ["eu-west-1a", "eu-west-1b"] },
//!   "resources": [
//!     { "type": "network", "name": "main", "attributes": { "cidr": "10.0.0.0/16" } },
//!     { "type": "subnet", "name": "public", "count": "${length(var.azs)}",
//!       "attributes": { "network_id": "${network.main.id}", "az": "${var.azs[count.index]}" } }
//!   ]
//! }
//! ```

mod expr;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::resource::{InstanceKey, ResourceDecl, ResourceId, Value};
use expr::Scope;

#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid declaration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{resource}: invalid expression in '{attribute}': {message}")]
    Expression {
        resource: String,
        attribute: String,
        message: String,
    },

    #[error("{resource}: invalid count: {message}")]
    InvalidCount { resource: String, message: String },

    #[error("{resource}: invalid for_each: {message}")]
    InvalidForEach { resource: String, message: String },

    #[error("{0}: count and for_each cannot be used together")]
    CountAndForEach(String),

    #[error("{resource}: invalid depends_on entry '{entry}': {message}")]
    InvalidDependsOn {
        resource: String,
        entry: String,
        message: String,
    },

    #[error("invalid variable override '{0}' (expected NAME=VALUE)")]
    InvalidOverride(String),

    #[error("variable '{0}' is not declared")]
    UnknownVariable(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Document {
    #[serde(default)]
    variables: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    resources: Vec<RawResource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
    #[serde(rename = "type")]
    resource_type: String,
    name: String,
    count: Option<serde_json::Value>,
    for_each: Option<serde_json::Value>,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// Parses a `NAME=VALUE` override. VALUE is read as JSON when it parses, else as a string.
pub fn parse_override(input: &str) -> Result<(String, serde_json::Value), DeclarationError> {
    let (name, raw) = input
        .split_once('=')
        .filter(|(name, _)| !name.trim().is_empty())
        .ok_or_else(|| DeclarationError::InvalidOverride(input.to_string()))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((name.trim().to_string(), value))
}

pub fn load(
    path: &Path,
    overrides: &[(String, serde_json::Value)],
) -> Result<Vec<ResourceDecl>, DeclarationError> {
    let text = std::fs::read_to_string(path).map_err(|source| DeclarationError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let declarations = parse_str(&text, overrides)?;
    tracing::debug!(path = %path.display(), resources = declarations.len(), "declarations loaded");
    Ok(declarations)
}

pub fn parse_str(
    text: &str,
    overrides: &[(String, serde_json::Value)],
) -> Result<Vec<ResourceDecl>, DeclarationError> {
    let mut document: Document = serde_json::from_str(text)?;

    for (name, value) in overrides {
        match document.variables.get_mut(name) {
            Some(slot) => *slot = value.clone(),
            None => return Err(DeclarationError::UnknownVariable(name.clone())),
        }
    }

    let mut declarations = Vec::new();
    for raw in &document.resources {
        expand(raw, &document.variables, &mut declarations)?;
    }
    Ok(declarations)
}

fn expand(
    raw: &RawResource,
    variables: &BTreeMap<String, serde_json::Value>,
    out: &mut Vec<ResourceDecl>,
) -> Result<(), DeclarationError> {
    let base = ResourceId::new(&raw.resource_type, &raw.name);
    let label = base.to_string();
    let scope = Scope {
        variables: Some(variables),
        ..Scope::default()
    };

    match (&raw.count, &raw.for_each) {
        (Some(_), Some(_)) => Err(DeclarationError::CountAndForEach(label)),
        (Some(count), None) => {
            let n = count_value(count, &scope).map_err(|message| DeclarationError::InvalidCount {
                resource: label.clone(),
                message,
            })?;
            for index in 0..n {
                let scope = Scope {
                    count_index: Some(index),
                    ..scope.clone()
                };
                let id = base.clone().with_key(InstanceKey::Index(index));
                out.push(instance(raw, id, &scope)?);
            }
            Ok(())
        }
        (None, Some(for_each)) => {
            let entries = for_each_entries(for_each, &scope).map_err(|message| {
                DeclarationError::InvalidForEach {
                    resource: label.clone(),
                    message,
                }
            })?;
            for (key, value) in &entries {
                let scope = Scope {
                    each: Some((key.as_str(), value)),
                    ..scope.clone()
                };
                let id = base.clone().with_key(InstanceKey::Key(key.clone()));
                out.push(instance(raw, id, &scope)?);
            }
            Ok(())
        }
        (None, None) => {
            out.push(instance(raw, base, &scope)?);
            Ok(())
        }
    }
}

fn known_value(value: &serde_json::Value, scope: &Scope<'_>) -> Result<serde_json::Value, String> {
    match value {
        serde_json::Value::String(text) => match expr::interpolate(text, scope)? {
            Value::Literal(value) => Ok(value),
            _ => Err("must be known before apply (resource references are not allowed)".to_string()),
        },
        other => Ok(other.clone()),
    }
}

fn count_value(count: &serde_json::Value, scope: &Scope<'_>) -> Result<usize, String> {
    let value = known_value(count, scope)?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| format!("expected a non-negative integer, got {}", value))
}

fn for_each_entries(
    for_each: &serde_json::Value,
    scope: &Scope<'_>,
) -> Result<BTreeMap<String, serde_json::Value>, String> {
    match known_value(for_each, scope)? {
        serde_json::Value::Object(entries) => Ok(entries.into_iter().collect()),
        serde_json::Value::Array(items) => {
            let mut entries = BTreeMap::new();
            for item in items {
                let key = item
                    .as_str()
                    .ok_or_else(|| format!("list elements must be strings, got {}", item))?;
                if entries.insert(key.to_string(), item.clone()).is_some() {
                    return Err(format!("duplicate key '{}'", key));
                }
            }
            Ok(entries)
        }
        other => Err(format!("expected a map or a list of strings, got {}", other)),
    }
}

fn instance(raw: &RawResource, id: ResourceId, scope: &Scope<'_>) -> Result<ResourceDecl, DeclarationError> {
    let mut decl = ResourceDecl::new(id);

    for (name, value) in &raw.attributes {
        let converted = convert(value, scope).map_err(|message| DeclarationError::Expression {
            resource: decl.id.to_string(),
            attribute: name.clone(),
            message,
        })?;
        decl.attributes.insert(name.clone(), converted);
    }

    for entry in &raw.depends_on {
        let target = expr::parse_target(entry, scope).map_err(|message| DeclarationError::InvalidDependsOn {
            resource: decl.id.to_string(),
            entry: entry.clone(),
            message,
        })?;
        decl.depends_on.push(target);
    }
    Ok(decl)
}

/// Converts raw JSON into a [`Value`], collapsing fully literal containers.
fn convert(value: &serde_json::Value, scope: &Scope<'_>) -> Result<Value, String> {
    match value {
        serde_json::Value::String(text) => expr::interpolate(text, scope),
        serde_json::Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| convert(item, scope))
                .collect::<Result<Vec<_>, _>>()?;
            let literals: Option<Vec<serde_json::Value>> = items
                .iter()
                .map(|item| match item {
                    Value::Literal(value) => Some(value.clone()),
                    _ => None,
                })
                .collect();
            Ok(match literals {
                Some(values) => Value::Literal(serde_json::Value::Array(values)),
                None => Value::List(items),
            })
        }
        serde_json::Value::Object(entries) => {
            let entries = entries
                .iter()
                .map(|(key, item)| Ok((key.clone(), convert(item, scope)?)))
                .collect::<Result<BTreeMap<_, _>, String>>()?;
            let literals: Option<serde_json::Map<String, serde_json::Value>> = entries
                .iter()
                .map(|(key, item)| match item {
                    Value::Literal(value) => Some((key.clone(), value.clone())),
                    _ => None,
                })
                .collect();
            Ok(match literals {
                Some(map) => Value::Literal(serde_json::Value::Object(map)),
                None => Value::Map(entries),
            })
        }
        other => Ok(Value::Literal(other.clone())),
    }
}
