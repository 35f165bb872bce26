//! Custom types for common data structures and validation

use chrono::{DateTime as ChronoDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ServiceError;

/// Standard UTC DateTime type used across all Rollout crates
///
/// Serializes as ISO 8601 with 'Z' suffix: `2025-10-12T12:15:47.609192Z`
pub type UtcDateTime = ChronoDateTime<Utc>;

/// Generate a new random record identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Deployment target environment
///
/// Ordered from least to most protected, which is the order the approval
/// policy tables are keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub const ALL: [Environment; 3] = [
        Environment::Development,
        Environment::Staging,
        Environment::Production,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ServiceError::Validation {
                message: format!("Unknown environment '{}'", other),
            }),
        }
    }
}

/// Role tier supplied by the identity provider
///
/// Identity providers hand out role strings; anything that is not one of the
/// known tiers collapses to [`Role::Viewer`], the least privileged tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Lead,
    Developer,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Lead => "lead",
            Role::Developer => "developer",
            Role::Viewer => "viewer",
        }
    }

    /// Parse a role string from the identity provider
    pub fn from_provider(role: &str) -> Self {
        let normalized = role.trim().to_lowercase();
        let tier = normalized.strip_suffix("-tier").unwrap_or(&normalized);
        match tier {
            "admin" | "owner" => Role::Admin,
            "lead" | "maintainer" => Role::Lead,
            "developer" | "member" => Role::Developer,
            _ => Role::Viewer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The actor performing an action, as resolved by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// Build an actor from the raw role string handed out by the identity provider
    pub fn from_provider(id: impl Into<String>, role: &str) -> Self {
        Self::new(id, Role::from_provider(role))
    }

    /// Actor used for actions initiated by the system itself (alert feeds, schedules)
    pub fn system(id: impl Into<String>) -> Self {
        Self::new(id, Role::Viewer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert_eq!("Prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Development);
        assert!("moon".parse::<Environment>().is_err());
    }

    #[test]
    fn test_role_from_provider_tiers() {
        assert_eq!(Role::from_provider("admin"), Role::Admin);
        assert_eq!(Role::from_provider("lead-tier"), Role::Lead);
        assert_eq!(Role::from_provider("developer-tier"), Role::Developer);
        assert_eq!(Role::from_provider("viewer-tier"), Role::Viewer);
        assert_eq!(Role::from_provider("something-else"), Role::Viewer);
    }

    #[test]
    fn test_environment_serializes_lowercase() {
        let json = serde_json::to_string(&Environment::Staging).unwrap();
        assert_eq!(json, "\"staging\"");
    }
}
