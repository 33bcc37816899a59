//! Cross-resource references.
//!
//! A reference is written as the whole attribute value `${resource.attribute}`,
//! optionally followed by further path segments that index into maps (by key)
//! or lists (by position): `${sg.rules.web}`, `${subnets.ids.0}`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opening token of a reference.
const REF_OPEN: &str = "${";

/// Closing token of a reference.
const REF_CLOSE: &str = "}";

/// A pointer from one resource's attribute to another resource's attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Reference {
    /// Name of the referenced resource.
    pub resource: String,
    /// Top-level attribute of the referenced resource.
    pub attribute: String,
    /// Further map keys or list indices below the attribute.
    pub path: Vec<String>,
}

impl Reference {
    /// Creates a reference to a top-level attribute.
    #[must_use]
    pub fn new(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            attribute: attribute.into(),
            path: Vec::new(),
        }
    }

    /// Appends a nested path segment.
    #[must_use]
    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.path.push(segment.into());
        self
    }

    /// Parses a reference token.
    ///
    /// Returns `None` when the string is not a reference token, so ordinary
    /// strings pass through untouched.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let inner = s.strip_prefix(REF_OPEN)?.strip_suffix(REF_CLOSE)?;
        if inner.contains(REF_OPEN) || inner.contains(REF_CLOSE) {
            return None;
        }

        let mut segments = inner.split('.').map(str::trim);
        let resource = segments.next().filter(|s| is_segment(s))?;
        let attribute = segments.next().filter(|s| is_segment(s))?;

        let mut path = Vec::new();
        for segment in segments {
            if !is_segment(segment) {
                return None;
            }
            path.push(segment.to_string());
        }

        Some(Self {
            resource: resource.to_string(),
            attribute: attribute.to_string(),
            path,
        })
    }

    /// Returns true if the string looks like a reference token.
    #[must_use]
    pub fn is_token(s: &str) -> bool {
        Self::parse(s).is_some()
    }
}

fn is_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REF_OPEN}{}.{}", self.resource, self.attribute)?;
        for segment in &self.path {
            write!(f, ".{segment}")?;
        }
        write!(f, "{REF_CLOSE}")
    }
}

impl TryFrom<String> for Reference {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).ok_or_else(|| format!("Invalid reference: {s}"))
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> Self {
        reference.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_reference() {
        let reference = Reference::parse("${main.id}").unwrap();
        assert_eq!(reference, Reference::new("main", "id"));
    }

    #[test]
    fn test_parse_nested_path() {
        let reference = Reference::parse("${groups.ids.web}").unwrap();
        assert_eq!(reference.resource, "groups");
        assert_eq!(reference.attribute, "ids");
        assert_eq!(reference.path, vec!["web".to_string()]);
        assert_eq!(reference.to_string(), "${groups.ids.web}");
    }

    #[test]
    fn test_plain_strings_are_not_references() {
        assert!(Reference::parse("10.0.0.0/16").is_none());
        assert!(Reference::parse("${main}").is_none());
        assert!(Reference::parse("prefix-${main.id}").is_none());
        assert!(Reference::parse("${main..id}").is_none());
        assert!(Reference::parse("${a.b}${c.d}").is_none());
    }
}
