//! Reference rendering: turns declared [`Value`]s into concrete JSON.

use std::collections::BTreeMap;

use crate::error::ConfigurationError;
use crate::resource::{Attributes, Reference, Segment, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Rendered {
    Known(serde_json::Value),
    /// Depends on a value a provider has not returned yet.
    Unknown,
}

impl Rendered {
    pub fn as_known(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Known(value) => Some(value),
            Self::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

pub type RenderedAttributes = BTreeMap<String, Rendered>;

pub trait Resolver {
    fn resolve(&self, reference: &Reference) -> Result<Rendered, ConfigurationError>;
}

pub fn render_value(value: &Value, resolver: &dyn Resolver) -> Result<Rendered, ConfigurationError> {
    match value {
        Value::Literal(literal) => Ok(Rendered::Known(literal.clone())),
        Value::Reference(reference) => resolver.resolve(reference),
        Value::Template(segments) => {
            let mut text = String::new();
            for segment in segments {
                match segment {
                    Segment::Text(part) => text.push_str(part),
                    Segment::Reference(reference) => match resolver.resolve(reference)? {
                        Rendered::Known(value) => text.push_str(&interpolate(&value)),
                        Rendered::Unknown => return Ok(Rendered::Unknown),
                    },
                }
            }
            Ok(Rendered::Known(serde_json::Value::String(text)))
        }
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match render_value(item, resolver)? {
                    Rendered::Known(value) => out.push(value),
                    Rendered::Unknown => return Ok(Rendered::Unknown),
                }
            }
            Ok(Rendered::Known(serde_json::Value::Array(out)))
        }
        Value::Map(entries) => {
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (key, item) in entries {
                match render_value(item, resolver)? {
                    Rendered::Known(value) => {
                        out.insert(key.clone(), value);
                    }
                    Rendered::Unknown => return Ok(Rendered::Unknown),
                }
            }
            Ok(Rendered::Known(serde_json::Value::Object(out)))
        }
    }
}

pub fn render_attributes(
    attributes: &BTreeMap<String, Value>,
    resolver: &dyn Resolver,
) -> Result<RenderedAttributes, ConfigurationError> {
    attributes
        .iter()
        .map(|(name, value)| Ok((name.clone(), render_value(value, resolver)?)))
        .collect()
}

/// The fully known attribute set, or `None` if anything is still unknown.
pub fn all_known(rendered: &RenderedAttributes) -> Option<Attributes> {
    rendered
        .iter()
        .map(|(name, value)| value.as_known().map(|v| (name.clone(), v.clone())))
        .collect()
}

pub fn unknown_names(rendered: &RenderedAttributes) -> Vec<String> {
    rendered
        .iter()
        .filter(|(_, value)| !value.is_known())
        .map(|(name, _)| name.clone())
        .collect()
}

fn interpolate(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Target;

    struct Fixed(Option<serde_json::Value>);

    impl Resolver for Fixed {
        fn resolve(&self, _reference: &Reference) -> Result<Rendered, ConfigurationError> {
            Ok(match &self.0 {
                Some(value) => Rendered::Known(value.clone()),
                None => Rendered::Unknown,
            })
        }
    }

    fn template() -> Value {
        Value::Template(vec![
            Segment::Text("https://".to_string()),
            Segment::Reference(Reference::new(Target::single("cluster", "main"), "endpoint")),
            Segment::Text(":".to_string()),
            Segment::Reference(Reference::new(Target::single("cluster", "main"), "port")),
        ])
    }

    #[test]
    fn test_template_interpolates_strings_and_numbers() {
        let rendered = render_value(&template(), &Fixed(Some(serde_json::json!("k8s")))).unwrap();
        assert_eq!(rendered, Rendered::Known(serde_json::json!("https://k8s:k8s")));

        let rendered = render_value(&template(), &Fixed(Some(serde_json::json!(443)))).unwrap();
        assert_eq!(rendered, Rendered::Known(serde_json::json!("https://443:443")));
    }

    #[test]
    fn test_unknown_propagates_through_containers() {
        let value = Value::List(vec![Value::literal("a"), template()]);
        assert_eq!(render_value(&value, &Fixed(None)).unwrap(), Rendered::Unknown);
    }

    #[test]
    fn test_all_known_and_unknown_names() {
        let rendered = RenderedAttributes::from([
            ("a".to_string(), Rendered::Known(serde_json::json!(1))),
            ("b".to_string(), Rendered::Unknown),
        ]);
        assert!(all_known(&rendered).is_none());
        assert_eq!(unknown_names(&rendered), vec!["b".to_string()]);

        let rendered = RenderedAttributes::from([("a".to_string(), Rendered::Known(serde_json::json!(1)))]);
        assert_eq!(all_known(&rendered).unwrap()["a"], 1);
    }
}
