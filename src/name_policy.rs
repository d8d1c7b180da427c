//! Name admission policy.
//!
//! Given the DNS and email names requested for a certificate, decide
//! whether each is allowed under a role. Clauses are checked in order and
//! the first match admits the name; a name matching no clause is rejected
//! and returned to the caller for message formatting.

use std::sync::LazyLock;

use regex::Regex;

use crate::roles::Role;

// RFC 1123 labels joined by dots. Never matches the empty string.
static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$",
    )
    .expect("hostname regex must compile")
});

/// Hostname form check: RFC 1123 label syntax with the 63-octet label
/// limit enforced explicitly (the regex alone does not bound length).
fn is_valid_hostname(name: &str) -> bool {
    name.split('.').all(|label| label.len() <= 63) && HOSTNAME_RE.is_match(name)
}

/// Check every requested name against the role's toggles. Returns the
/// first rejected name, or `None` when all pass.
///
/// `display_name` is the caller's display name as reported by the host
/// platform, consulted by the token-display-name and subdomain clauses.
pub fn validate_names(names: &[String], role: &Role, display_name: &str) -> Option<String> {
    for name in names {
        let mut sanitized = name.as_str();
        let mut email_domain = name.as_str();
        let mut is_email = false;
        let mut is_wildcard = false;

        if name.contains('@') {
            if !role.email_protection_flag && !role.allow_any_name {
                return Some(name.clone());
            }
            let split: Vec<&str> = name.split('@').collect();
            if split.len() != 2 {
                return Some(name.clone());
            }
            sanitized = split[1];
            email_domain = split[1];
            is_email = true;
        }

        if let Some(rest) = sanitized.strip_prefix("*.") {
            sanitized = rest;
            is_wildcard = true;
        }

        if role.enforce_hostnames && !is_valid_hostname(sanitized) {
            return Some(name.clone());
        }

        if role.allow_any_name {
            continue;
        }

        if role.allow_localhost {
            if name == "localhost" || (is_email && email_domain == "localhost") {
                continue;
            }

            if role.allow_subdomains {
                // The regex never matches the empty string, which protects
                // against a bare suffix slipping through as its own base.
                if let Some(trimmed) = sanitized.strip_suffix(&format!(".{}", display_name)) {
                    if is_valid_hostname(trimmed) {
                        continue;
                    }
                }

                // "*." is stripped before matching, so a wildcard of the
                // allowed base domain arrives here as the bare base.
                if is_wildcard && sanitized == role.allowed_base_domain {
                    continue;
                }
            }
        }

        if role.allow_token_display_name {
            // Exact match against the unsanitized name
            if name == display_name || (is_email && email_domain == display_name) {
                continue;
            }

            if role.allow_subdomains {
                if let Some(trimmed) = sanitized.strip_suffix(&format!(".{}", display_name)) {
                    if is_valid_hostname(trimmed) {
                        continue;
                    }
                }

                if is_wildcard && sanitized == role.allowed_base_domain {
                    continue;
                }
            }
        }

        if !role.allowed_base_domain.is_empty() {
            if role.allow_base_domain
                && (name == &role.allowed_base_domain
                    || (is_email && email_domain == role.allowed_base_domain))
            {
                continue;
            }

            if role.allow_subdomains {
                if let Some(trimmed) =
                    sanitized.strip_suffix(&format!(".{}", role.allowed_base_domain))
                {
                    if is_valid_hostname(trimmed) {
                        continue;
                    }
                }

                if is_wildcard && sanitized == role.allowed_base_domain {
                    continue;
                }
            }
        }

        return Some(name.clone());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict_web_role() -> Role {
        let mut role: Role = serde_json::from_str("{}").unwrap();
        role.allowed_base_domain = "example.com".to_string();
        role.allow_subdomains = true;
        role.allow_base_domain = false;
        role.allow_localhost = false;
        role.enforce_hostnames = true;
        role
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_strict_role_subdomains() {
        let role = strict_web_role();

        assert_eq!(validate_names(&names(&["foo.example.com"]), &role, ""), None);
        assert_eq!(validate_names(&names(&["*.example.com"]), &role, ""), None);
        // Base domain itself is not allowed without allow_base_domain
        assert_eq!(
            validate_names(&names(&["example.com"]), &role, ""),
            Some("example.com".to_string())
        );
        // Hostname enforcement rejects empty labels
        assert_eq!(
            validate_names(&names(&["foo..example.com"]), &role, ""),
            Some("foo..example.com".to_string())
        );
        // An empty subdomain label is not a subdomain
        assert_eq!(
            validate_names(&names(&[".example.com"]), &role, ""),
            Some(".example.com".to_string())
        );
    }

    #[test]
    fn test_base_domain_toggle() {
        let mut role = strict_web_role();
        role.allow_base_domain = true;
        assert_eq!(validate_names(&names(&["example.com"]), &role, ""), None);
    }

    #[test]
    fn test_first_rejection_wins() {
        let role = strict_web_role();
        assert_eq!(
            validate_names(
                &names(&["ok.example.com", "nope.other.com", "also.bad.org"]),
                &role,
                ""
            ),
            Some("nope.other.com".to_string())
        );
    }

    #[test]
    fn test_localhost() {
        let mut role: Role = serde_json::from_str("{}").unwrap();
        role.allowed_base_domain = "example.com".to_string();
        assert_eq!(validate_names(&names(&["localhost"]), &role, ""), None);

        role.allow_localhost = false;
        assert_eq!(
            validate_names(&names(&["localhost"]), &role, ""),
            Some("localhost".to_string())
        );
    }

    #[test]
    fn test_any_name_bypasses_policy() {
        let mut role: Role = serde_json::from_str("{}").unwrap();
        role.allow_any_name = true;
        assert_eq!(
            validate_names(&names(&["anything.at.all", "user@anywhere.net"]), &role, ""),
            None
        );
    }

    #[test]
    fn test_email_requires_protection_flag() {
        let mut role = strict_web_role();
        assert_eq!(
            validate_names(&names(&["user@example.com"]), &role, ""),
            Some("user@example.com".to_string())
        );

        role.email_protection_flag = true;
        role.allow_base_domain = true;
        assert_eq!(validate_names(&names(&["user@example.com"]), &role, ""), None);
        // Multiple @ separators are malformed
        assert_eq!(
            validate_names(&names(&["user@host@example.com"]), &role, ""),
            Some("user@host@example.com".to_string())
        );
    }

    #[test]
    fn test_token_display_name() {
        let mut role: Role = serde_json::from_str("{}").unwrap();
        role.allow_localhost = false;
        role.allow_token_display_name = true;
        assert_eq!(
            validate_names(&names(&["token-web"]), &role, "token-web"),
            None
        );
        assert_eq!(
            validate_names(&names(&["other"]), &role, "token-web"),
            Some("other".to_string())
        );

        role.allow_subdomains = true;
        assert_eq!(
            validate_names(&names(&["svc.token-web"]), &role, "token-web"),
            None
        );
    }

    #[test]
    fn test_bare_wildcard_rejected_under_enforcement() {
        let mut role = strict_web_role();
        role.enforce_hostnames = true;
        assert_eq!(
            validate_names(&names(&["*."]), &role, ""),
            Some("*.".to_string())
        );
    }

    #[test]
    fn test_oversized_label_rejected() {
        let role = strict_web_role();
        let long = format!("{}.example.com", "a".repeat(64));
        assert_eq!(
            validate_names(&[long.clone()], &role, ""),
            Some(long)
        );
    }

    // Flipping any allow_* flag from false to true must never shrink the
    // accepted set.
    #[test]
    fn test_monotonicity() {
        let candidates = names(&[
            "localhost",
            "example.com",
            "foo.example.com",
            "*.example.com",
            "token-web",
            "svc.token-web",
            "user@example.com",
            "unrelated.org",
        ]);

        let accepted = |role: &Role| -> Vec<String> {
            candidates
                .iter()
                .filter(|n| validate_names(&[(*n).clone()], role, "token-web").is_none())
                .cloned()
                .collect()
        };

        let mut base: Role = serde_json::from_str("{}").unwrap();
        base.allowed_base_domain = "example.com".to_string();
        base.allow_localhost = false;

        let flips: Vec<fn(&mut Role)> = vec![
            |r| r.allow_localhost = true,
            |r| r.allow_base_domain = true,
            |r| r.allow_token_display_name = true,
            |r| r.allow_subdomains = true,
            |r| r.allow_any_name = true,
            |r| r.email_protection_flag = true,
        ];

        for flip in flips {
            let before = accepted(&base);
            let mut flipped = base.clone();
            flip(&mut flipped);
            let after = accepted(&flipped);
            for name in &before {
                assert!(
                    after.contains(name),
                    "flipping a flag rejected previously accepted name {}",
                    name
                );
            }
        }
    }
}
