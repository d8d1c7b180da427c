//! Creation bundle assembly.
//!
//! Merges a role, the request fields, and (when signing) the CA context
//! into a single fully resolved issuance intent. Everything downstream of
//! this module works from a [`CreationBundle`] and never consults the role
//! or request again.

use std::net::IpAddr;
use std::ops::BitOr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::ca_bundle::CaSigningContext;
use crate::configs::{parse_ttl_string, BackendConfig, UrlEntries};
use crate::errors::{PkiError, Result};
use crate::name_policy::validate_names;
use crate::roles::Role;

/// Extended key usage selection, OR-ed together from the role flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CertUsage(u8);

impl CertUsage {
    pub const SERVER: CertUsage = CertUsage(1);
    pub const CLIENT: CertUsage = CertUsage(1 << 1);
    pub const CODE_SIGNING: CertUsage = CertUsage(1 << 2);
    pub const EMAIL_PROTECTION: CertUsage = CertUsage(1 << 3);

    pub fn contains(self, other: CertUsage) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for CertUsage {
    type Output = CertUsage;

    fn bitor(self, rhs: CertUsage) -> CertUsage {
        CertUsage(self.0 | rhs.0)
    }
}

/// Resolved maximum path length for a CA certificate. `Limit(0)` is the
/// explicit leaf-only encoding; `Unconstrained` omits the constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathLength {
    Unconstrained,
    Limit(u32),
}

/// Request fields common to the issuance-shaped operations. `alt_names`
/// and `ip_sans` are comma-delimited; `ttl` and `common_name` may be
/// empty. `display_name` is the caller's display name as supplied by the
/// host platform for this request.
#[derive(Debug, Clone, Default)]
pub struct CertRequestFields {
    pub common_name: String,
    pub alt_names: String,
    pub ip_sans: String,
    pub ttl: String,
    pub display_name: String,
}

/// A fully resolved issuance intent: the one structure handed to the key
/// factory and signer.
#[derive(Debug)]
pub struct CreationBundle<'a> {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub email_addresses: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub is_ca: bool,
    pub key_type: String,
    pub key_bits: u32,
    pub signing_context: Option<&'a CaSigningContext>,
    pub ttl: Duration,
    pub usage: CertUsage,
    /// Only honored when signing a CA certificate from a CSR.
    pub use_csr_values: bool,
    /// URL set to encode into the certificate.
    pub urls: UrlEntries,
    pub max_path_length: PathLength,
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Resolve a role, request, and optional signing context into a
/// [`CreationBundle`], enforcing the role's name and TTL policy.
///
/// `csr` is consulted only as a fallback source for the common name, and
/// only when the role opts in via `use_csr_common_name`.
pub fn generate_creation_bundle<'a>(
    role: &Role,
    signing_context: Option<&'a CaSigningContext>,
    csr: Option<&openssl::x509::X509Req>,
    config: &BackendConfig,
    fields: &CertRequestFields,
) -> Result<CreationBundle<'a>> {
    // Common name, falling back to the CSR subject when the role allows
    let mut common_name = fields.common_name.clone();
    if common_name.is_empty() {
        match csr {
            Some(csr) if role.use_csr_common_name => {
                common_name = csr
                    .subject_name()
                    .entries_by_nid(openssl::nid::Nid::COMMONNAME)
                    .next()
                    .and_then(|e| e.data().as_utf8().ok())
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                if common_name.is_empty() {
                    return Err(PkiError::user(
                        "the common_name field is required, or the CSR must carry a subject CN",
                    ));
                }
            }
            Some(_) => {
                return Err(PkiError::user(
                    r#"the common_name field must be supplied when "use_csr_common_name" is not specified in the role"#,
                ))
            }
            None => return Err(PkiError::user("the common_name field is required")),
        }
    }

    // Partition the CN and alt names into DNS and email lists
    let mut dns_names = Vec::new();
    let mut email_addresses = Vec::new();
    if common_name.contains('@') {
        email_addresses.push(common_name.clone());
    } else {
        dns_names.push(common_name.clone());
    }
    if !fields.alt_names.is_empty() {
        for entry in fields.alt_names.split(',') {
            if entry.contains('@') {
                email_addresses.push(entry.to_string());
            } else {
                dns_names.push(entry.to_string());
            }
        }
    }

    // IP SANs
    let mut ip_addresses = Vec::new();
    if !fields.ip_sans.is_empty() {
        if !role.allow_ip_sans {
            return Err(PkiError::user(format!(
                "IP Subject Alternative Names are not allowed in this role, but was provided {}",
                fields.ip_sans
            )));
        }
        for entry in fields.ip_sans.split(',') {
            let parsed: IpAddr = entry.parse().map_err(|_| {
                PkiError::user(format!("the value '{}' is not a valid IP address", entry))
            })?;
            ip_addresses.push(parsed);
        }
    }

    // TTL resolution: request, then role, then system default; capped at
    // the role max or system max
    let ttl_field = if fields.ttl.is_empty() {
        role.ttl.as_str()
    } else {
        fields.ttl.as_str()
    };
    let mut ttl = if ttl_field.is_empty() {
        config.default_lease_ttl
    } else {
        parse_ttl_string("requested ttl", ttl_field)?
    };

    let max_ttl = if role.max_ttl.is_empty() {
        config.max_lease_ttl
    } else {
        parse_ttl_string("ttl", &role.max_ttl)?
    };

    if ttl > max_ttl {
        // A derived TTL caps silently; an explicit one is an error
        if fields.ttl.is_empty() {
            ttl = max_ttl;
        } else {
            return Err(PkiError::user(format!(
                "ttl is larger than maximum allowed ({})",
                max_ttl.as_secs()
            )));
        }
    }

    if let Some(ctx) = signing_context {
        if unix_now() + ttl.as_secs() as i64 > ctx.not_after {
            return Err(PkiError::user(
                "cannot satisfy request, as TTL is beyond the expiration of the CA certificate",
            ));
        }
    }

    // Name admission
    if let Some(bad) = validate_names(&dns_names, role, &fields.display_name) {
        return Err(PkiError::user(format!(
            "name {} not allowed by this role",
            bad
        )));
    }
    if let Some(bad) = validate_names(&email_addresses, role, &fields.display_name) {
        return Err(PkiError::user(format!(
            "email {} not allowed by this role",
            bad
        )));
    }

    let mut usage = CertUsage::default();
    if role.server_flag {
        usage = usage | CertUsage::SERVER;
    }
    if role.client_flag {
        usage = usage | CertUsage::CLIENT;
    }
    if role.code_signing_flag {
        usage = usage | CertUsage::CODE_SIGNING;
    }
    if role.email_protection_flag {
        usage = usage | CertUsage::EMAIL_PROTECTION;
    }

    let mut bundle = CreationBundle {
        common_name,
        dns_names,
        email_addresses,
        ip_addresses,
        is_ca: false,
        key_type: role.key_type.clone(),
        key_bits: role.key_bits,
        signing_context,
        ttl,
        usage,
        use_csr_values: false,
        urls: UrlEntries::default(),
        max_path_length: PathLength::Unconstrained,
    };

    match signing_context {
        Some(ctx) => {
            if ctx.max_path_len == Some(0) {
                return Err(PkiError::user("signing CA has a max path length of zero"));
            }
            bundle.urls = ctx.urls.clone();
            bundle.max_path_length = match role.max_path_length {
                Some(-1) => PathLength::Unconstrained,
                Some(n) => PathLength::Limit(n as u32),
                // Inherit from the signer, one level consumed
                None => match ctx.max_path_len {
                    None => PathLength::Unconstrained,
                    Some(n) => PathLength::Limit(n - 1),
                },
            };
        }
        None => {
            bundle.urls = config.urls.clone();
            bundle.max_path_length = match role.max_path_length {
                None | Some(-1) => PathLength::Unconstrained,
                Some(n) => PathLength::Limit(n as u32),
            };
        }
    }

    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_role() -> Role {
        let mut role: Role = serde_json::from_str("{}").unwrap();
        role.allow_any_name = true;
        role
    }

    fn request(common_name: &str) -> CertRequestFields {
        CertRequestFields {
            common_name: common_name.to_string(),
            ..Default::default()
        }
    }

    fn thirty_day_config() -> BackendConfig {
        BackendConfig {
            default_lease_ttl: Duration::from_secs(30 * 86400),
            max_lease_ttl: Duration::from_secs(30 * 86400),
            ..Default::default()
        }
    }

    #[test]
    fn test_common_name_required() {
        let err = generate_creation_bundle(
            &open_role(),
            None,
            None,
            &BackendConfig::default(),
            &request(""),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "the common_name field is required");
    }

    #[test]
    fn test_name_partitioning() {
        let mut fields = request("www.example.com");
        fields.alt_names = "api.example.com,ops@example.com".to_string();
        let bundle = generate_creation_bundle(
            &open_role(),
            None,
            None,
            &BackendConfig::default(),
            &fields,
        )
        .unwrap();
        assert_eq!(bundle.dns_names, vec!["www.example.com", "api.example.com"]);
        assert_eq!(bundle.email_addresses, vec!["ops@example.com"]);
    }

    // An email-form alt name contributes its own value, not the CN
    #[test]
    fn test_alt_name_email_uses_entry_value() {
        let mut fields = request("www.example.com");
        fields.alt_names = "first@example.com,second@example.com".to_string();
        let bundle = generate_creation_bundle(
            &open_role(),
            None,
            None,
            &BackendConfig::default(),
            &fields,
        )
        .unwrap();
        assert_eq!(
            bundle.email_addresses,
            vec!["first@example.com", "second@example.com"]
        );
    }

    #[test]
    fn test_ip_sans() {
        let mut fields = request("host.example.com");
        fields.ip_sans = "10.0.0.1,::1".to_string();
        let bundle = generate_creation_bundle(
            &open_role(),
            None,
            None,
            &BackendConfig::default(),
            &fields,
        )
        .unwrap();
        assert_eq!(bundle.ip_addresses.len(), 2);

        fields.ip_sans = "not-an-ip".to_string();
        let err = generate_creation_bundle(
            &open_role(),
            None,
            None,
            &BackendConfig::default(),
            &fields,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "the value 'not-an-ip' is not a valid IP address"
        );

        let mut no_ip_role = open_role();
        no_ip_role.allow_ip_sans = false;
        fields.ip_sans = "10.0.0.1".to_string();
        let err =
            generate_creation_bundle(&no_ip_role, None, None, &BackendConfig::default(), &fields)
                .unwrap_err();
        assert!(err
            .to_string()
            .contains("IP Subject Alternative Names are not allowed"));
    }

    #[test]
    fn test_ttl_capping() {
        let config = thirty_day_config();
        let mut role = open_role();
        role.max_ttl = "7d".to_string();

        // No TTL anywhere: system default, capped to the role max
        let bundle =
            generate_creation_bundle(&role, None, None, &config, &request("a.example.com"))
                .unwrap();
        assert_eq!(bundle.ttl, Duration::from_secs(7 * 86400));

        // Explicit TTL above the role max is the caller's error
        let mut fields = request("a.example.com");
        fields.ttl = "14d".to_string();
        let err = generate_creation_bundle(&role, None, None, &config, &fields).unwrap_err();
        assert!(err.to_string().starts_with("ttl is larger than maximum allowed"));

        // Explicit TTL below the max passes through
        fields.ttl = "1h".to_string();
        let bundle = generate_creation_bundle(&role, None, None, &config, &fields).unwrap();
        assert_eq!(bundle.ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_role_ttl_used_when_request_silent() {
        let mut role = open_role();
        role.ttl = "12h".to_string();
        let bundle = generate_creation_bundle(
            &role,
            None,
            None,
            &BackendConfig::default(),
            &request("a.example.com"),
        )
        .unwrap();
        assert_eq!(bundle.ttl, Duration::from_secs(12 * 3600));
    }

    #[test]
    fn test_name_policy_rejection_message() {
        let mut role: Role = serde_json::from_str("{}").unwrap();
        role.allowed_base_domain = "example.com".to_string();
        role.allow_subdomains = true;
        role.enforce_hostnames = true;

        let err = generate_creation_bundle(
            &role,
            None,
            None,
            &BackendConfig::default(),
            &request("example.com"),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "name example.com not allowed by this role");
    }

    #[test]
    fn test_usage_bitmask() {
        let mut role = open_role();
        role.code_signing_flag = true;
        let bundle = generate_creation_bundle(
            &role,
            None,
            None,
            &BackendConfig::default(),
            &request("a.example.com"),
        )
        .unwrap();
        assert!(bundle.usage.contains(CertUsage::SERVER));
        assert!(bundle.usage.contains(CertUsage::CLIENT));
        assert!(bundle.usage.contains(CertUsage::CODE_SIGNING));
        assert!(!bundle.usage.contains(CertUsage::EMAIL_PROTECTION));
    }

    #[test]
    fn test_csr_common_name_fallback() {
        let csr_source = CreationBundle {
            common_name: "From CSR".to_string(),
            dns_names: vec![],
            email_addresses: vec![],
            ip_addresses: vec![],
            is_ca: false,
            key_type: "rsa".to_string(),
            key_bits: 2048,
            signing_context: None,
            ttl: Duration::from_secs(3600),
            usage: CertUsage::default(),
            use_csr_values: false,
            urls: UrlEntries::default(),
            max_path_length: PathLength::Unconstrained,
        };
        let csr_bundle = crate::pki_generator::create_csr(&csr_source).unwrap();

        let mut role = open_role();
        role.use_csr_common_name = true;
        let bundle = generate_creation_bundle(
            &role,
            None,
            Some(&csr_bundle.csr),
            &BackendConfig::default(),
            &request(""),
        )
        .unwrap();
        assert_eq!(bundle.common_name, "From CSR");

        // Without the role opt-in, the request must carry the CN itself
        let err = generate_creation_bundle(
            &open_role(),
            None,
            Some(&csr_bundle.csr),
            &BackendConfig::default(),
            &request(""),
        )
        .unwrap_err();
        assert!(err.to_string().contains("use_csr_common_name"));
    }

    #[test]
    fn test_self_signed_path_length_override() {
        let mut role = open_role();
        role.max_path_length = Some(0);
        let bundle = generate_creation_bundle(
            &role,
            None,
            None,
            &BackendConfig::default(),
            &request("root.example.com"),
        )
        .unwrap();
        assert_eq!(bundle.max_path_length, PathLength::Limit(0));

        role.max_path_length = Some(-1);
        let bundle = generate_creation_bundle(
            &role,
            None,
            None,
            &BackendConfig::default(),
            &request("root.example.com"),
        )
        .unwrap();
        assert_eq!(bundle.max_path_length, PathLength::Unconstrained);
    }
}
