//! Persisted entities: sandboxes, service instances, sessions, API clients.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Sandbox
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Pending,
    Running,
    Stopped,
    Failed,
    Expired,
}

impl SandboxStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(Error::Validation(format!("unknown sandbox status '{other}'"))),
        }
    }
}

/// A container-backed ephemeral workspace plus its auxiliary resources.
///
/// Observable from the moment the row is written, even before any container
/// exists. `container_id` is set at most once per sandbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub template_id: String,
    pub user_id: String,
    pub status: SandboxStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub services: HashMap<String, ServiceInstance>,
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Sandbox {
    /// The Docker container name backing this sandbox.
    pub fn container_name(&self) -> String {
        format!("sandbox-{}", self.id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service instances
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Ready,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Validation(format!("unknown service status '{other}'"))),
        }
    }
}

/// Connection details for a provisioned auxiliary resource.
///
/// Providers fill only the fields that apply; empty fields are omitted from
/// serialized output and from the environment injected into containers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceCredentials {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
}

/// An auxiliary resource provisioned for one sandbox, keyed by
/// `(sandbox_id, name)`. Existence of a row implies the external resource
/// was provisioned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub service_type: String,
    pub status: ServiceStatus,
    pub credentials: ServiceCredentials,
    pub created_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Ready,
    Provisioning,
    Active,
    Expired,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "ready" => Ok(Self::Ready),
            "provisioning" => Ok(Self::Provisioning),
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Validation(format!("unknown session status '{other}'"))),
        }
    }
}

/// A pre-allocated intent to run a sandbox, activated later through its
/// public token. The token is the sole authenticator for join endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub token: String,
    pub template_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_message: String,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// API clients
// ─────────────────────────────────────────────────────────────────────────────

/// An admin credential record. Permissions are strings, optionally
/// wildcarded as `domain:*` or the global `*`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiClient {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub is_active: bool,
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiClient {
    /// Wildcard-aware permission check: exact match, `prefix*` match, or
    /// the global `*`.
    pub fn has_permission(&self, required: &str) -> bool {
        self.permissions.iter().any(|perm| {
            perm == required
                || perm == "*"
                || perm
                    .strip_suffix('*')
                    .is_some_and(|prefix| required.starts_with(prefix))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(perms: &[&str]) -> ApiClient {
        ApiClient {
            id: Uuid::new_v4(),
            name: "test".into(),
            api_key: "key".into(),
            is_active: true,
            permissions: perms.iter().map(|p| p.to_string()).collect(),
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[test]
    fn exact_permission_matches_only_itself() {
        let c = client(&["sandboxes:read"]);
        assert!(c.has_permission("sandboxes:read"));
        assert!(!c.has_permission("sandboxes:write"));
        assert!(!c.has_permission("sessions:read"));
    }

    #[test]
    fn domain_wildcard_matches_domain_only() {
        let c = client(&["sandboxes:*"]);
        assert!(c.has_permission("sandboxes:read"));
        assert!(c.has_permission("sandboxes:write"));
        assert!(!c.has_permission("sessions:read"));
    }

    #[test]
    fn global_wildcard_matches_everything() {
        let c = client(&["*"]);
        assert!(c.has_permission("sandboxes:read"));
        assert!(c.has_permission("sessions:delete"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(SandboxStatus::Stopped.is_terminal());
        assert!(SandboxStatus::Failed.is_terminal());
        assert!(SandboxStatus::Expired.is_terminal());
        assert!(!SandboxStatus::Pending.is_terminal());
        assert!(!SandboxStatus::Running.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(!SessionStatus::Ready.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            SandboxStatus::Pending,
            SandboxStatus::Running,
            SandboxStatus::Stopped,
            SandboxStatus::Failed,
            SandboxStatus::Expired,
        ] {
            assert_eq!(s.as_str().parse::<SandboxStatus>().unwrap(), s);
        }
        for s in [
            SessionStatus::Ready,
            SessionStatus::Provisioning,
            SessionStatus::Active,
            SessionStatus::Expired,
            SessionStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<SessionStatus>().unwrap(), s);
        }
    }
}
