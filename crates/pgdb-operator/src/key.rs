//! Resource identity used for queue membership
//!
//! A Database is identified by `(namespace, name)`, carried through the work
//! queue as the single string `namespace/name`.

use crate::crd::Database;
use crate::error::{OperatorError, Result};
use kube::ResourceExt;
use std::fmt;
use std::str::FromStr;

/// `(namespace, name)` identity of a Database resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derive the key of an object; fails if it has no name
    pub fn for_object(db: &Database) -> Result<Self> {
        let name = db
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| OperatorError::InvalidKey("object has no name".to_string()))?;
        Ok(Self::new(db.namespace().unwrap_or_default(), name))
    }

    /// Parse a queue item back into its identity
    ///
    /// Accepts `name` (empty namespace) and `namespace/name`.
    pub fn parse(key: &str) -> Result<Self> {
        let mut parts = key.split('/');
        let parsed = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Self::new("", name),
            (Some(namespace), Some(name), None) => Self::new(namespace, name),
            _ => return Err(OperatorError::InvalidKey(key.to_string())),
        };
        if parsed.name.is_empty() {
            return Err(OperatorError::InvalidKey(key.to_string()));
        }
        Ok(parsed)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DatabaseSpec;

    #[test]
    fn test_key_format() {
        assert_eq!(ObjectKey::new("default", "app1").to_string(), "default/app1");
        assert_eq!(ObjectKey::new("", "app1").to_string(), "app1");
    }

    #[test]
    fn test_key_parse() {
        let key: ObjectKey = "default/app1".parse().unwrap();
        assert_eq!(key, ObjectKey::new("default", "app1"));

        let key = ObjectKey::parse("app1").unwrap();
        assert_eq!(key.namespace, "");
        assert_eq!(key.name, "app1");
    }

    #[test]
    fn test_malformed_keys() {
        for bad in ["a/b/c", "", "default/", "/"] {
            assert!(
                matches!(ObjectKey::parse(bad), Err(OperatorError::InvalidKey(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_key_for_object() {
        let mut db = Database::new(
            "app1",
            DatabaseSpec {
                username: "app1_owner".to_string(),
                password: "x".to_string(),
                database: "app1_db".to_string(),
            },
        );
        db.metadata.namespace = Some("default".to_string());
        assert_eq!(ObjectKey::for_object(&db).unwrap().to_string(), "default/app1");

        db.metadata.name = None;
        assert!(ObjectKey::for_object(&db).is_err());
    }
}
