//! Issuance roles.
//!
//! A role is a named, persisted constraint set: which names may be issued,
//! which key algorithm and size to use, which extended key usages to flag,
//! and how long issued certificates may live. Roles are stored as JSON
//! under `role/<name>` and validated on write; reads migrate the legacy
//! `lease`/`lease_max` field names forward and persist the converged form
//! back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::configs::{parse_ttl_string, BackendConfig};
use crate::errors::{PkiError, Result};
use crate::storage::{Storage, ROLE_PREFIX};

fn default_true() -> bool {
    true
}

fn default_key_type() -> String {
    "rsa".to_string()
}

fn default_key_bits() -> u32 {
    2048
}

/// A named issuance policy. Field defaults match the write-side schema:
/// absent fields on a write take these values, so a deserialized role is
/// always fully populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Legacy name for `max_ttl`; migrated forward on read.
    #[serde(default)]
    pub lease_max: String,
    /// Legacy name for `ttl`; migrated forward on read.
    #[serde(default)]
    pub lease: String,
    #[serde(default)]
    pub max_ttl: String,
    #[serde(default)]
    pub ttl: String,
    #[serde(default = "default_true")]
    pub allow_localhost: bool,
    #[serde(default)]
    pub allowed_base_domain: String,
    #[serde(default)]
    pub allow_base_domain: bool,
    #[serde(rename = "allow_token_displayname", default)]
    pub allow_token_display_name: bool,
    #[serde(default)]
    pub allow_subdomains: bool,
    #[serde(default)]
    pub allow_any_name: bool,
    #[serde(default)]
    pub enforce_hostnames: bool,
    #[serde(default = "default_true")]
    pub allow_ip_sans: bool,
    #[serde(default = "default_true")]
    pub server_flag: bool,
    #[serde(default = "default_true")]
    pub client_flag: bool,
    #[serde(default)]
    pub code_signing_flag: bool,
    #[serde(default)]
    pub email_protection_flag: bool,
    #[serde(default = "default_key_type")]
    pub key_type: String,
    #[serde(default = "default_key_bits")]
    pub key_bits: u32,
    /// When signing a CSR whose request carries no common name, allow the
    /// CSR subject's CN to be used instead.
    #[serde(default)]
    pub use_csr_common_name: bool,
    /// Path length override for sub-CA issuance. `None` inherits from the
    /// signing CA, `-1` is unconstrained, `0` restricts to leaves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_path_length: Option<i32>,
}

/// Validate a role against the key-type table and the TTL policy. Called
/// on write; stored roles are assumed to have passed.
pub fn validate_role(role: &Role, config: &BackendConfig) -> Result<()> {
    let max_system_ttl = config.max_lease_ttl;
    let max_ttl = if role.max_ttl.is_empty() {
        max_system_ttl
    } else {
        parse_ttl_string("max_ttl", &role.max_ttl)?
    };
    if max_ttl > max_system_ttl {
        return Err(PkiError::user(
            "Requested max TTL is higher than backend maximum",
        ));
    }

    let mut ttl = config.default_lease_ttl;
    if !role.ttl.is_empty() {
        ttl = parse_ttl_string("ttl", &role.ttl)?;
    }
    if ttl > max_ttl {
        // A system-default TTL silently caps to the role max; an explicit
        // one is the caller's mistake.
        if !role.ttl.is_empty() {
            return Err(PkiError::user(
                r#""ttl" value must be less than "max_ttl" and/or backend default max lease TTL value"#,
            ));
        }
    }

    match role.key_type.as_str() {
        "rsa" => match role.key_bits {
            1024 | 2048 | 4096 | 8192 => {}
            n => {
                return Err(PkiError::user(format!(
                    "unsupported bit length for RSA key: {}",
                    n
                )))
            }
        },
        "ec" => match role.key_bits {
            224 | 256 | 384 | 521 => {}
            n => {
                return Err(PkiError::user(format!(
                    "unsupported bit length for EC key: {}",
                    n
                )))
            }
        },
        other => {
            return Err(PkiError::user(format!("unknown key type {}", other)));
        }
    }

    if let Some(n) = role.max_path_length {
        if n < -1 {
            return Err(PkiError::user(
                r#""max_path_length" must be -1, 0, or a positive integer"#,
            ));
        }
    }

    Ok(())
}

/// Serialize and store a role under `role/<name>`.
pub fn store_role<S: Storage>(storage: &S, name: &str, role: &Role) -> Result<()> {
    let blob = serde_json::to_vec(role)?;
    storage.put(&format!("{}{}", ROLE_PREFIX, name), &blob)
}

/// Fetch a role, migrating the legacy `lease`/`lease_max` names to
/// `ttl`/`max_ttl` and persisting the converged form back. The migration
/// is idempotent: a second read observes the new names populated and the
/// legacy ones empty.
pub fn fetch_role<S: Storage>(storage: &S, name: &str) -> Result<Option<Role>> {
    let blob = match storage.get(&format!("{}{}", ROLE_PREFIX, name))? {
        Some(blob) => blob,
        None => return Ok(None),
    };

    let mut role: Role = serde_json::from_slice(&blob)
        .map_err(|e| PkiError::internal(format!("unable to decode role {}: {}", name, e)))?;

    let mut modified = false;
    if role.ttl.is_empty() && !role.lease.is_empty() {
        role.ttl = std::mem::take(&mut role.lease);
        modified = true;
    }
    if role.max_ttl.is_empty() && !role.lease_max.is_empty() {
        role.max_ttl = std::mem::take(&mut role.lease_max);
        modified = true;
    }
    if modified {
        store_role(storage, name, &role)?;
    }

    Ok(Some(role))
}

/// Remove a role. Absence is not an error.
pub fn delete_role<S: Storage>(storage: &S, name: &str) -> Result<()> {
    storage.delete(&format!("{}{}", ROLE_PREFIX, name))
}

/// Render a role for display, substituting placeholders for empty TTL
/// fields so callers can see which system default applies.
pub fn role_display(role: &Role) -> Result<Value> {
    let mut display = role.clone();
    let has_max = !display.max_ttl.is_empty();
    if !has_max {
        display.max_ttl = "(system default)".to_string();
    }
    if display.ttl.is_empty() {
        display.ttl = if has_max {
            "(system default, capped to role max)".to_string()
        } else {
            "(system default)".to_string()
        };
    }
    Ok(serde_json::to_value(&display)?)
}
