//! Custom Resource Definition for the PostgreSQL database operator
//!
//! This module defines the `Database` CRD: a request for one role and one
//! database, owned by that role, on the operator's target PostgreSQL server.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{CustomResource, CustomResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Unquoted PostgreSQL identifier
static IDENTIFIER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// PostgreSQL truncates identifiers longer than NAMEDATALEN - 1 bytes
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that a value can be spliced into DDL as an unquoted identifier
pub fn is_valid_identifier(value: &str) -> bool {
    value.len() <= MAX_IDENTIFIER_LEN && IDENTIFIER_REGEX.is_match(value)
}

fn validate_identifier(value: &str) -> Result<(), ValidationError> {
    if is_valid_identifier(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_identifier").with_message(
            format!(
                "'{}' must start with a letter or underscore, contain only letters, digits and underscores, and be at most {} bytes",
                value, MAX_IDENTIFIER_LEN
            )
            .into(),
        ))
    }
}

/// Database is a request for a PostgreSQL role and a database owned by it
///
/// Example:
/// ```yaml
/// apiVersion: postgresql.org/v1
/// kind: Database
/// metadata:
///   name: app1
///   namespace: default
/// spec:
///   username: app1_owner
///   password: s3cret
///   database: app1_db
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "postgresql.org",
    version = "v1",
    kind = "Database",
    plural = "databases",
    shortname = "pgdb",
    namespaced,
    status = "DatabaseStatus",
    printcolumn = r#"{"name":"Database","type":"string","jsonPath":".spec.database"}"#,
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.username"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Role that is created and made owner of the database
    #[validate(custom(function = "validate_identifier"))]
    pub username: String,

    /// Password for the role
    #[validate(length(min = 1, message = "password must not be empty"))]
    pub password: String,

    /// Name of the database to create
    #[validate(custom(function = "validate_identifier"))]
    pub database: String,
}

/// Provisioning state of a Database
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseState {
    /// Role and database exist
    Provisioned,
    /// The last provisioning attempt failed
    Error,
    /// Nothing has been created yet; also covers empty or unknown values
    #[default]
    #[serde(other)]
    Unprovisioned,
}

impl fmt::Display for DatabaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseState::Unprovisioned => write!(f, "unprovisioned"),
            DatabaseState::Provisioned => write!(f, "provisioned"),
            DatabaseState::Error => write!(f, "error"),
        }
    }
}

/// Status of the Database resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    /// unprovisioned, provisioned or error
    #[serde(default)]
    pub state: DatabaseState,

    /// Human-readable outcome of the last attempt
    #[serde(default)]
    pub message: String,
}

impl DatabaseStatus {
    pub fn new(state: DatabaseState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }
}

/// CRD manifest for installation
///
/// Status is written back with the rest of the object, so the version must
/// not declare a status subresource: with one, the API server drops status
/// changes sent through a full-object update.
pub fn crd_definition() -> CustomResourceDefinition {
    let mut crd = Database::crd();
    for version in &mut crd.spec.versions {
        if let Some(subresources) = version.subresources.as_mut() {
            subresources.status = None;
            if subresources.scale.is_none() {
                version.subresources = None;
            }
        }
    }
    crd
}

impl Database {
    /// Current state; a missing status counts as unprovisioned
    pub fn state(&self) -> DatabaseState {
        self.status
            .as_ref()
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Message recorded by the last attempt, if any
    pub fn status_message(&self) -> &str {
        self.status.as_ref().map(|s| s.message.as_str()).unwrap_or("")
    }

    /// Copy of this resource with only the status replaced
    pub fn with_status(&self, status: DatabaseStatus) -> Self {
        let mut copy = self.clone();
        copy.status = Some(status);
        copy
    }

    /// Validate the spec, flattening field errors into one message
    pub fn validate_spec(&self) -> Result<(), String> {
        self.spec.validate().map_err(|errors| {
            let mut messages: Vec<String> = errors
                .field_errors()
                .iter()
                .flat_map(|(field, errs)| {
                    errs.iter().map(move |e| match &e.message {
                        Some(msg) => format!("{}: {}", field, msg),
                        None => format!("{}: {}", field, e.code),
                    })
                })
                .collect();
            messages.sort();
            messages.join("; ")
        })
    }
}
