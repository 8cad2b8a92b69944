//! Connection strings and shared access authorization rules.
//!
//! A namespace (and each queue or topic) carries named authorization rules,
//! each with two keys and a set of rights. Clients present a key name and key
//! taken from a connection string; the key is compared in constant time
//! against the rule's primary and secondary keys.
//!
//! Only the key check is modelled. Signed tokens are never issued.

use crate::error::ConfigurationError;
use crate::message::EntityName;
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;

/// Name of the all-rights rule every namespace starts with
pub const ROOT_KEY_NAME: &str = "RootManageSharedAccessKey";

/// Length in bytes of generated keys before base64 encoding
const KEY_LENGTH: usize = 32;

// ============================================================================
// Access rights
// ============================================================================

/// Claim granted by an authorization rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessRight {
    Send,
    Listen,
    Manage,
}

impl fmt::Display for AccessRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Send => "Send",
            Self::Listen => "Listen",
            Self::Manage => "Manage",
        };
        f.write_str(name)
    }
}

impl FromStr for AccessRight {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "send" => Ok(Self::Send),
            "listen" => Ok(Self::Listen),
            "manage" => Ok(Self::Manage),
            other => Err(ConfigurationError::Invalid {
                message: format!("unknown access right '{}'", other),
            }),
        }
    }
}

// ============================================================================
// Authorization rules
// ============================================================================

/// A named key pair with rights, at namespace or entity scope
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRule {
    pub key_name: String,
    pub primary_key: Zeroizing<String>,
    pub secondary_key: Zeroizing<String>,
    pub rights: Vec<AccessRight>,
}

impl AuthorizationRule {
    /// Create a rule with freshly generated keys
    pub fn new(key_name: impl Into<String>, rights: Vec<AccessRight>) -> Self {
        Self {
            key_name: key_name.into(),
            primary_key: Zeroizing::new(generate_key()),
            secondary_key: Zeroizing::new(generate_key()),
            rights,
        }
    }

    /// The namespace's all-rights rule
    pub fn root() -> Self {
        Self::new(ROOT_KEY_NAME, vec![AccessRight::Manage, AccessRight::Send, AccessRight::Listen])
    }

    /// Manage implies Send and Listen
    pub fn grants(&self, right: AccessRight) -> bool {
        self.rights.contains(&right) || self.rights.contains(&AccessRight::Manage)
    }

    /// Constant-time comparison against both keys
    pub fn matches_key(&self, key: &str) -> bool {
        let primary = self.primary_key.as_bytes().ct_eq(key.as_bytes());
        let secondary = self.secondary_key.as_bytes().ct_eq(key.as_bytes());
        (primary | secondary).into()
    }

    /// Connection string using the primary key
    pub fn connection_string(&self, endpoint: &str, entity: Option<&EntityName>) -> String {
        let mut value = format!(
            "Endpoint={};SharedAccessKeyName={};SharedAccessKey={}",
            endpoint,
            self.key_name,
            self.primary_key.as_str()
        );
        if let Some(entity) = entity {
            value.push_str(";EntityPath=");
            value.push_str(entity.as_str());
        }
        value
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.key_name.is_empty() || self.key_name.len() > 256 {
            return Err(ConfigurationError::Invalid {
                message: "authorization rule name must be 1-256 characters".to_string(),
            });
        }
        if self.primary_key.is_empty() || self.secondary_key.is_empty() {
            return Err(ConfigurationError::Missing {
                key: format!("{} keys", self.key_name),
            });
        }
        if self.rights.is_empty() {
            return Err(ConfigurationError::Invalid {
                message: format!("authorization rule '{}' grants no rights", self.key_name),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for AuthorizationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationRule")
            .field("key_name", &self.key_name)
            .field("primary_key", &"<REDACTED>")
            .field("secondary_key", &"<REDACTED>")
            .field("rights", &self.rights)
            .finish()
    }
}

/// Generate a random base64 key
pub fn generate_key() -> String {
    let mut bytes = Zeroizing::new([0u8; KEY_LENGTH]);
    rand::thread_rng().fill_bytes(&mut bytes[..]);
    general_purpose::STANDARD.encode(&bytes[..])
}

// ============================================================================
// Connection strings
// ============================================================================

/// Parsed `Endpoint=...;SharedAccessKeyName=...;SharedAccessKey=...` string
#[derive(Clone)]
pub struct ConnectionProperties {
    pub endpoint: String,
    pub namespace: String,
    pub shared_access_key_name: String,
    shared_access_key: Zeroizing<String>,
    pub entity_path: Option<EntityName>,
}

impl ConnectionProperties {
    pub fn shared_access_key(&self) -> &str {
        &self.shared_access_key
    }
}

impl FromStr for ConnectionProperties {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ConfigurationError::Invalid {
                message: "connection string cannot be empty".to_string(),
            });
        }

        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        for part in s.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            // Keys are base64 and may end in '=', so split on the first '=' only
            let Some((name, value)) = part.split_once('=') else {
                return Err(ConfigurationError::Parsing {
                    message: format!("malformed connection string segment '{}'", part),
                });
            };

            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.trim().to_string()),
                "sharedaccesskeyname" => key_name = Some(value.trim().to_string()),
                "sharedaccesskey" => key = Some(Zeroizing::new(value.trim().to_string())),
                "entitypath" => {
                    entity_path = Some(EntityName::new(value.trim()).map_err(|e| {
                        ConfigurationError::Invalid {
                            message: e.to_string(),
                        }
                    })?)
                }
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| ConfigurationError::Missing {
            key: "Endpoint".to_string(),
        })?;
        let shared_access_key_name = key_name.ok_or_else(|| ConfigurationError::Missing {
            key: "SharedAccessKeyName".to_string(),
        })?;
        let shared_access_key = key.ok_or_else(|| ConfigurationError::Missing {
            key: "SharedAccessKey".to_string(),
        })?;

        // sb://<namespace>.servicebus.windows.net/
        let namespace = endpoint
            .split_once("://")
            .map(|(_, host)| host)
            .and_then(|host| host.split(['.', '/']).next())
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| ConfigurationError::Invalid {
                message: format!("endpoint '{}' does not name a namespace", endpoint),
            })?
            .to_string();

        Ok(Self {
            endpoint,
            namespace,
            shared_access_key_name,
            shared_access_key,
            entity_path,
        })
    }
}

impl fmt::Debug for ConnectionProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProperties")
            .field("endpoint", &self.endpoint)
            .field("namespace", &self.namespace)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("shared_access_key", &"<REDACTED>")
            .field("entity_path", &self.entity_path)
            .finish()
    }
}
