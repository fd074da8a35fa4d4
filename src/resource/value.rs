//! Input values and references between resources.
//!
//! A value is either a literal (string, number, bool, list, map) or a
//! reference to another resource's output. References are written as
//! `${resource-id.outputName}` in the stack file. A reference embedded in a
//! longer string becomes a template, which is still a dependency edge.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// Inputs after every reference has been substituted with a literal.
pub type ResolvedInputs = BTreeMap<String, JsonValue>;

/// Outputs produced by a provisioned resource.
pub type Outputs = BTreeMap<String, JsonValue>;

/// A pointer to an output of another resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Reference {
    /// Id of the referenced resource.
    pub resource: String,
    /// Name of the referenced output.
    pub output: String,
}

/// A piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text.
    Text(String),
    /// A reference substituted at resolution time.
    Ref(Reference),
}

/// A declared input value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Numeric literal.
    Number(serde_json::Number),
    /// String literal.
    String(String),
    /// A whole-value reference.
    Reference(Reference),
    /// A string with one or more embedded references.
    Template(Vec<Segment>),
    /// A list of values.
    List(Vec<Value>),
    /// A map of values.
    Map(BTreeMap<String, Value>),
}

impl Reference {
    /// Creates a new reference.
    #[must_use]
    pub fn new(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            output: output.into(),
        }
    }

    /// Parses `id.output`, optionally wrapped in `${...}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a well-formed reference.
    pub fn parse(s: &str) -> Result<Self, String> {
        let trimmed = s.trim();
        let inner = trimmed
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(trimmed)
            .trim();

        let (resource, output) = inner
            .split_once('.')
            .ok_or_else(|| format!("Invalid reference '{s}'. Expected format: resource-id.outputName"))?;

        if resource.is_empty() || !resource.chars().all(is_id_char) {
            return Err(format!("Invalid resource id in reference '{s}'"));
        }
        if output.is_empty() || !output.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("Invalid output name in reference '{s}'"));
        }

        Ok(Self::new(resource, output))
    }
}

/// Characters allowed in a resource id.
const fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.output)
    }
}

impl TryFrom<String> for Reference {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> Self {
        format!("${{{reference}}}")
    }
}

impl Value {
    /// Creates a plain string literal without interpreting `${...}`.
    #[must_use]
    pub fn literal(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Creates a whole-value reference.
    #[must_use]
    pub fn reference(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Reference(Reference::new(resource, output))
    }

    /// Parses a string that may contain `${id.output}` placeholders.
    ///
    /// `$${` produces a literal `${`.
    ///
    /// # Errors
    ///
    /// Returns an error if a placeholder is unterminated or malformed.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut rest = raw;

        while let Some(pos) = rest.find('$') {
            text.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if let Some(after) = tail.strip_prefix("$${") {
                text.push_str("${");
                rest = after;
            } else if let Some(after) = tail.strip_prefix("${") {
                let end = after
                    .find('}')
                    .ok_or_else(|| format!("Unterminated reference in '{raw}'"))?;
                let reference = Reference::parse(&after[..end])?;
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Ref(reference));
                rest = &after[end + 1..];
            } else {
                text.push('$');
                rest = &tail[1..];
            }
        }
        text.push_str(rest);

        if segments.is_empty() {
            return Ok(Self::String(text));
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        match segments.as_slice() {
            [Segment::Ref(reference)] => Ok(Self::Reference(reference.clone())),
            _ => Ok(Self::Template(segments)),
        }
    }

    /// Returns every reference contained in this value, recursively.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a Reference>) {
        match self {
            Self::Reference(reference) => refs.push(reference),
            Self::Template(segments) => {
                for segment in segments {
                    if let Segment::Ref(reference) = segment {
                        refs.push(reference);
                    }
                }
            }
            Self::List(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(refs);
                }
            }
            Self::Null | Self::Bool(_) | Self::Number(_) | Self::String(_) => {}
        }
    }

    /// Substitutes every reference using `lookup`, producing a literal.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `lookup`.
    pub fn resolve<E, F>(&self, lookup: &F) -> Result<JsonValue, E>
    where
        F: Fn(&Reference) -> Result<JsonValue, E>,
    {
        Ok(match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Number(n) => JsonValue::Number(n.clone()),
            Self::String(s) => JsonValue::String(s.clone()),
            Self::Reference(reference) => lookup(reference)?,
            Self::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Ref(reference) => match lookup(reference)? {
                            JsonValue::String(s) => out.push_str(&s),
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                JsonValue::String(out)
            }
            Self::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|item| item.resolve(lookup))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.resolve(lookup)?);
                }
                JsonValue::Object(map)
            }
        })
    }

    /// Returns a short type name for error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Reference(_) => "reference",
            Self::Template(_) => "template",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Returns true if this value resolves to a string.
    #[must_use]
    pub const fn is_stringish(&self) -> bool {
        matches!(self, Self::String(_) | Self::Reference(_) | Self::Template(_))
    }
}

impl TryFrom<JsonValue> for Value {
    type Error = String;

    fn try_from(json: JsonValue) -> Result<Self, Self::Error> {
        Ok(match json {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => Self::Number(n),
            JsonValue::String(s) => Self::parse(&s)?,
            JsonValue::Array(items) => Self::List(
                items
                    .into_iter()
                    .map(Self::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            JsonValue::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Self::try_from(v).map(|v| (k, v)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

impl From<Value> for JsonValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s.replace("${", "$${")),
            Value::Reference(reference) => Self::String(reference.into()),
            Value::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(&text.replace("${", "$${")),
                        Segment::Ref(reference) => {
                            out.push_str(&String::from(reference));
                        }
                    }
                }
                Self::String(out)
            }
            Value::List(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Map(entries) => Self::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::literal(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Reference> for Value {
    fn from(reference: Reference) -> Self {
        Self::Reference(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_whole_string_is_reference() {
        let value = Value::parse("${site-bucket.arn}").unwrap();
        assert_eq!(value, Value::reference("site-bucket", "arn"));
    }

    #[test]
    fn test_embedded_reference_is_template() {
        let value = Value::parse("${site-bucket.arn}/*").unwrap();
        match &value {
            Value::Template(segments) => assert_eq!(segments.len(), 2),
            other => panic!("expected template, got {other:?}"),
        }
        assert_eq!(value.references().len(), 1);
    }

    #[test]
    fn test_escaped_placeholder_stays_literal() {
        let value = Value::parse("cost: $$${not.a_ref} and $5").unwrap();
        assert_eq!(value, Value::literal("cost: $${not.a_ref} and $5"));
        assert!(value.references().is_empty());
    }

    #[test]
    fn test_unterminated_reference_rejected() {
        assert!(Value::parse("${bucket.arn").is_err());
        assert!(Value::parse("${bucket}").is_err());
    }

    #[test]
    fn test_nested_references_are_collected() {
        let value = Value::try_from(json!({
            "origins": ["${a.domain}", {"id": "${b.id}"}],
            "static": "x"
        }))
        .unwrap();
        let mut refs: Vec<String> = value.references().iter().map(ToString::to_string).collect();
        refs.sort();
        assert_eq!(refs, vec!["a.domain", "b.id"]);
    }

    #[test]
    fn test_resolve_substitutes_literals() {
        let value = Value::parse("${bucket.arn}/*").unwrap();
        let resolved: Result<JsonValue, String> =
            value.resolve(&|r: &Reference| Ok(json!(format!("arn:aws:s3:::{}", r.resource))));
        assert_eq!(resolved.unwrap(), json!("arn:aws:s3:::bucket/*"));
    }

    #[test]
    fn test_reference_serializes_back_to_placeholder() {
        let json: JsonValue = Value::reference("fn-url", "url").into();
        assert_eq!(json, json!("${fn-url.url}"));
    }

    #[test]
    fn test_reference_parse_accepts_bare_and_wrapped() {
        assert_eq!(Reference::parse("a.b").unwrap(), Reference::new("a", "b"));
        assert_eq!(Reference::parse("${a.b}").unwrap(), Reference::new("a", "b"));
    }
}
