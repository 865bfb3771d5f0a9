use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Attribute values as sent to and returned from providers.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Position of an instance inside a repeated resource family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceKey {
    Index(usize),
    Key(String),
}

impl InstanceKey {
    pub fn is_index(&self) -> bool {
        matches!(self, Self::Index(_))
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "[{}]", index),
            Self::Key(key) => write!(f, "[{:?}]", key),
        }
    }
}

/// Logical identity of a resource, stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<InstanceKey>,
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: InstanceKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn indexed(resource_type: impl Into<String>, name: impl Into<String>, index: usize) -> Self {
        Self::new(resource_type, name).with_key(InstanceKey::Index(index))
    }

    pub fn keyed(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::new(resource_type, name).with_key(InstanceKey::Key(key.into()))
    }

    /// The `(type, name)` pair shared by every instance of a family.
    pub fn family(&self) -> (&str, &str) {
        (&self.resource_type, &self.name)
    }

    pub fn in_family(&self, resource_type: &str, name: &str) -> bool {
        self.resource_type == resource_type && self.name == name
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)?;
        if let Some(key) = &self.key {
            write!(f, "{}", key)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource address '{input}': {reason}")]
pub struct AddressParseError {
    pub input: String,
    pub reason: String,
}

impl FromStr for ResourceId {
    type Err = AddressParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| AddressParseError {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (head, key) = match input.find('[') {
            Some(open) => {
                let inner = input[open + 1..]
                    .strip_suffix(']')
                    .ok_or_else(|| fail("missing closing ']'"))?;
                (&input[..open], Some(parse_key(inner).ok_or_else(|| fail("bad instance key"))?))
            }
            None => (input, None),
        };

        let (resource_type, name) = head
            .split_once('.')
            .ok_or_else(|| fail("expected TYPE.NAME"))?;
        if resource_type.is_empty() || name.is_empty() || name.contains('.') {
            return Err(fail("expected TYPE.NAME"));
        }

        Ok(Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            key,
        })
    }
}

fn parse_key(inner: &str) -> Option<InstanceKey> {
    let inner = inner.trim();
    if let Some(quoted) = inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Some(InstanceKey::Key(quoted.to_string()));
    }
    inner.parse().ok().map(InstanceKey::Index)
}

/// Which instances of a family a reference or constraint points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    Single,
    Instance(InstanceKey),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub resource_type: String,
    pub name: String,
    pub selector: Selector,
}

impl Target {
    pub fn single(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            selector: Selector::Single,
        }
    }

    pub fn instance(resource_type: impl Into<String>, name: impl Into<String>, key: InstanceKey) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            selector: Selector::Instance(key),
        }
    }

    pub fn all(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            selector: Selector::All,
        }
    }
}

impl From<&ResourceId> for Target {
    fn from(id: &ResourceId) -> Self {
        Self {
            resource_type: id.resource_type.clone(),
            name: id.name.clone(),
            selector: match &id.key {
                Some(key) => Selector::Instance(key.clone()),
                None => Selector::Single,
            },
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)?;
        match &self.selector {
            Selector::Single => Ok(()),
            Selector::Instance(key) => write!(f, "{}", key),
            Selector::All => write!(f, "[*]"),
        }
    }
}

/// A dependency on another resource's attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub target: Target,
    pub attribute: String,
}

impl Reference {
    pub fn new(target: Target, attribute: impl Into<String>) -> Self {
        Self {
            target,
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Text(String),
    Reference(Reference),
}

/// A declared attribute value, possibly referring to other resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Literal(serde_json::Value),
    Reference(Reference),
    Template(Vec<Segment>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn reference(target: Target, attribute: impl Into<String>) -> Self {
        Self::Reference(Reference::new(target, attribute))
    }

    /// Every reference contained in this value, in source order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(reference) => out.push(reference),
            Self::Template(segments) => {
                for segment in segments {
                    if let Segment::Reference(reference) = segment {
                        out.push(reference);
                    }
                }
            }
            Self::List(items) => items.iter().for_each(|item| item.collect_references(out)),
            Self::Map(entries) => entries.values().for_each(|item| item.collect_references(out)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub id: ResourceId,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<Target>,
}

impl ResourceDecl {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn depends_on(mut self, target: Target) -> Self {
        self.depends_on.push(target);
        self
    }

    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.attributes.values().flat_map(Value::references)
    }
}
