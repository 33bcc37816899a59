//! Reference resolution.
//!
//! Resolution substitutes every [`Reference`] with the concrete value held by
//! the referenced resource. Strict resolution is used at apply time, once all
//! dependencies are materialized; partial resolution is used while planning
//! and yields [`Value::Unknown`] for data the provider has not produced yet.

use std::collections::HashMap;

use crate::error::ValueError;

use super::reference::Reference;
use super::types::{Attributes, Value};

/// Outcome of looking up a referenced attribute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<'a> {
    /// The attribute exists with this value.
    Known(&'a Value),
    /// The attribute will exist but its value is not known yet.
    Unknown,
    /// The referenced resource was never materialized.
    MissingResource,
    /// The resource exists but has no such attribute.
    MissingAttribute,
}

/// Source of materialized attribute values.
pub trait ResolveContext {
    /// Looks up the top-level attribute named by `reference`.
    fn lookup(&self, reference: &Reference) -> Lookup<'_>;
}

impl ResolveContext for HashMap<String, Attributes> {
    fn lookup(&self, reference: &Reference) -> Lookup<'_> {
        match self.get(&reference.resource) {
            None => Lookup::MissingResource,
            Some(attributes) => attributes
                .get(&reference.attribute)
                .map_or(Lookup::MissingAttribute, Lookup::Known),
        }
    }
}

impl Value {
    /// Resolves all references, failing if any dependency is not materialized.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::UnresolvedReference`] if a referenced resource or
    /// attribute does not exist or is not known yet.
    pub fn resolve<C: ResolveContext + ?Sized>(&self, ctx: &C) -> Result<Self, ValueError> {
        self.resolve_with(ctx, false)
    }

    /// Resolves references where possible, leaving [`Value::Unknown`] for data
    /// that will only exist after apply.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::UnresolvedReference`] if a referenced resource or
    /// attribute is not declared at all.
    pub fn resolve_partial<C: ResolveContext + ?Sized>(&self, ctx: &C) -> Result<Self, ValueError> {
        self.resolve_with(ctx, true)
    }

    fn resolve_with<C: ResolveContext + ?Sized>(
        &self,
        ctx: &C,
        allow_unknown: bool,
    ) -> Result<Self, ValueError> {
        match self {
            Self::Ref(reference) => resolve_reference(reference, ctx, allow_unknown),
            Self::Unknown if !allow_unknown => Err(ValueError::unresolved(
                "(unknown)",
                "value is not known before apply",
            )),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve_with(ctx, allow_unknown))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Self::Map(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.resolve_with(ctx, allow_unknown)?)))
                .collect::<Result<_, ValueError>>()
                .map(Self::Map),
            other => Ok(other.clone()),
        }
    }
}

fn resolve_reference<C: ResolveContext + ?Sized>(
    reference: &Reference,
    ctx: &C,
    allow_unknown: bool,
) -> Result<Value, ValueError> {
    let token = reference.to_string();
    let mut current = match ctx.lookup(reference) {
        Lookup::Known(value) => value,
        Lookup::Unknown if allow_unknown => return Ok(Value::Unknown),
        Lookup::Unknown => {
            return Err(ValueError::unresolved(token, "attribute is not known yet"));
        }
        Lookup::MissingResource => {
            return Err(ValueError::unresolved(
                token,
                format!("resource '{}' was never materialized", reference.resource),
            ));
        }
        Lookup::MissingAttribute => {
            return Err(ValueError::unresolved(
                token,
                format!(
                    "resource '{}' has no attribute '{}'",
                    reference.resource, reference.attribute
                ),
            ));
        }
    };

    for segment in &reference.path {
        if matches!(current, Value::Unknown) {
            break;
        }
        current = current.get_segment(segment).ok_or_else(|| {
            ValueError::unresolved(token.clone(), format!("no element '{segment}'"))
        })?;
    }

    if !allow_unknown && !current.is_known() {
        return Err(ValueError::unresolved(token, "attribute is not known yet"));
    }

    Ok(current.clone())
}

/// Resolves every attribute of a resource strictly.
///
/// # Errors
///
/// Returns the first unresolved reference encountered.
pub fn resolve_attributes<C: ResolveContext + ?Sized>(
    attributes: &Attributes,
    ctx: &C,
) -> Result<Attributes, ValueError> {
    attributes
        .iter()
        .map(|(k, v)| Ok((k.clone(), v.resolve(ctx)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> HashMap<String, Attributes> {
        let mut vpc = Attributes::new();
        vpc.insert("id".into(), Value::string("vpc-123"));
        vpc.insert(
            "subnets".into(),
            serde_json::json!({"public": ["subnet-a", "subnet-b"]}).into(),
        );
        let mut ctx = HashMap::new();
        ctx.insert("main".to_string(), vpc);
        ctx
    }

    #[test]
    fn test_resolve_substitutes_references() {
        let value: Value = serde_json::json!({"vpc_id": "${main.id}", "tags": ["${main.subnets.public.1}"]}).into();
        let resolved = value.resolve(&context()).unwrap();
        let expected: Value = serde_json::json!({"vpc_id": "vpc-123", "tags": ["subnet-b"]}).into();
        assert_eq!(resolved, expected);
        assert!(resolved.is_known());
    }

    #[test]
    fn test_unmaterialized_dependency_fails() {
        let value = Value::reference("gateway", "id");
        let err = value.resolve(&context()).unwrap_err();
        assert!(matches!(err, ValueError::UnresolvedReference { .. }));
        assert!(err.to_string().contains("gateway"));
    }

    #[test]
    fn test_missing_attribute_fails() {
        let value = Value::reference("main", "arn");
        assert!(value.resolve(&context()).is_err());
    }

    #[test]
    fn test_missing_map_key_fails() {
        let value = Value::Ref(Reference::new("main", "subnets").with_segment("private"));
        assert!(value.resolve(&context()).is_err());
    }

    #[test]
    fn test_partial_resolution_keeps_unknowns() {
        struct Pending;
        impl ResolveContext for Pending {
            fn lookup(&self, _reference: &Reference) -> Lookup<'_> {
                Lookup::Unknown
            }
        }

        let value: Value = serde_json::json!({"vpc_id": "${main.id}", "cidr": "10.0.1.0/24"}).into();
        let partial = value.resolve_partial(&Pending).unwrap();
        assert_eq!(partial.get_segment("vpc_id"), Some(&Value::Unknown));
        assert!(value.resolve(&Pending).is_err());
    }
}
