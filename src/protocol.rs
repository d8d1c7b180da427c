//! Protocol Module
//!
//! The backend's public operation surface: role management, CA lifecycle
//! (generate root, generate intermediate, upload signed certificate), and
//! certificate issuance. Each operation is synchronous and request-scoped;
//! the only shared state is the storage handed in at construction.
//!
//! Errors split into two kinds (see [`crate::errors`]): `User` errors
//! belong in the response payload, `Internal` errors on the transport.
//!
//! The CA write sequence is ordered `config/ca_bundle` -> `ca` -> `crl` so
//! that a crash after a partial write leaves the authoritative bundle
//! entry correct; re-running the write repairs the mirrors.

use openssl::x509::X509Req;
use serde::Serialize;
use tracing::{debug, info};

use crate::ca_bundle::{
    fetch_ca_info, parse_pem_bundle, pem_string, serial_from_cert, CaSigningContext, CertBundle,
};
use crate::configs::{BackendConfig, UrlEntries};
use crate::errors::{PkiError, Result};
use crate::issuance::{generate_creation_bundle, CertRequestFields};
use crate::pki_generator::{create_certificate, create_csr, sign_certificate, KeyType};
use crate::roles::{
    delete_role, fetch_role, role_display, store_role, validate_role, Role,
};
use crate::storage::{
    normalize_serial, Storage, CA_BUNDLE_KEY, CA_KEY, CERT_PREFIX, CRL_KEY, REVOKED_PREFIX,
};

/// Whether a generated private key is returned to the caller. `Exported`
/// is the only chance to retrieve it; `Internal` keys never leave the
/// backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPolicy {
    Internal,
    Exported,
}

impl ExportPolicy {
    /// Parse the path parameter form.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "internal" => Ok(ExportPolicy::Internal),
            "exported" => Ok(ExportPolicy::Exported),
            _ => Err(PkiError::user(
                r#"the "exported" path parameter must be "internal" or "exported""#,
            )),
        }
    }

    fn is_exported(self) -> bool {
        matches!(self, ExportPolicy::Exported)
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRootRequest {
    pub exported: ExportPolicy,
    pub common_name: String,
    pub alt_names: String,
    pub ip_sans: String,
    pub ttl: String,
    pub key_bits: u32,
}

impl Default for GenerateRootRequest {
    fn default() -> Self {
        Self {
            exported: ExportPolicy::Internal,
            common_name: String::new(),
            alt_names: String::new(),
            ip_sans: String::new(),
            ttl: String::new(),
            key_bits: 2048,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateIntermediateRequest {
    pub exported: ExportPolicy,
    pub common_name: String,
    pub alt_names: String,
    pub ip_sans: String,
    pub key_bits: u32,
}

impl Default for GenerateIntermediateRequest {
    fn default() -> Self {
        Self {
            exported: ExportPolicy::Internal,
            common_name: String::new(),
            alt_names: String::new(),
            ip_sans: String::new(),
            key_bits: 2048,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignIntermediateRequest {
    pub csr: String,
    pub common_name: String,
    pub alt_names: String,
    pub ip_sans: String,
    pub ttl: String,
}

#[derive(Debug, Clone, Default)]
pub struct IssueRequest {
    pub role: String,
    pub common_name: String,
    pub alt_names: String,
    pub ip_sans: String,
    pub ttl: String,
    /// The caller's display name as reported by the host platform.
    pub display_name: String,
}

/// A signed certificate as returned to the caller. The private key fields
/// are present only when a key was generated for this request and the
/// operation exports it.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCertificate {
    pub serial_number: String,
    pub certificate: String,
    pub issuing_ca: String,
    /// `NotAfter` as a Unix timestamp.
    pub expiration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_type: Option<String>,
}

/// A generated intermediate-CA signing request.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedCsr {
    pub csr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_type: Option<String>,
}

/// The PKI backend: roles, CA lifecycle, and issuance over a key-value
/// store.
pub struct Backend<S: Storage> {
    storage: S,
    config: BackendConfig,
}

impl<S: Storage> Backend<S> {
    pub fn new(storage: S, config: BackendConfig) -> Self {
        Self { storage, config }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    // ------------------------------------------------------------------
    // Roles
    // ------------------------------------------------------------------

    /// Validate and store a role.
    pub fn write_role(&self, name: &str, role: &Role) -> Result<()> {
        validate_role(role, &self.config)?;
        store_role(&self.storage, name, role)?;
        debug!(role = name, "stored role");
        Ok(())
    }

    /// Read a role for display. TTL fields left empty by the role show
    /// which system default applies.
    pub fn read_role(&self, name: &str) -> Result<Option<serde_json::Value>> {
        match fetch_role(&self.storage, name)? {
            Some(role) => Ok(Some(role_display(&role)?)),
            None => Ok(None),
        }
    }

    /// Delete a role. Absence is not an error.
    pub fn delete_role(&self, name: &str) -> Result<()> {
        delete_role(&self.storage, name)
    }

    // ------------------------------------------------------------------
    // CA lifecycle
    // ------------------------------------------------------------------

    /// Generate a self-signed root CA and persist the full bundle. The
    /// private key is returned only when `exported` was requested.
    pub fn generate_root(&self, req: &GenerateRootRequest) -> Result<IssuedCertificate> {
        check_ca_key_bits(req.key_bits)?;

        let role = Role {
            key_type: "rsa".to_string(),
            key_bits: req.key_bits,
            allow_localhost: true,
            allow_any_name: true,
            enforce_hostnames: false,
            ..Role::default()
        };
        let fields = CertRequestFields {
            common_name: req.common_name.clone(),
            alt_names: req.alt_names.clone(),
            ip_sans: req.ip_sans.clone(),
            ttl: req.ttl.clone(),
            display_name: String::new(),
        };

        let bundle = generate_creation_bundle(&role, None, None, &self.config, &fields)?;
        let parsed = create_certificate(&bundle)?;
        let cert_bundle = parsed.to_cert_bundle()?;

        self.storage
            .put(CA_BUNDLE_KEY, &serde_json::to_vec(&cert_bundle)?)?;
        self.storage.put(CA_KEY, &parsed.certificate_der)?;
        self.storage.put(CRL_KEY, &[])?;

        info!(
            common_name = %req.common_name,
            serial = %cert_bundle.serial_number,
            "generated self-signed root CA"
        );

        Ok(IssuedCertificate {
            serial_number: cert_bundle.serial_number.clone(),
            certificate: cert_bundle.certificate.clone(),
            issuing_ca: cert_bundle.issuing_ca.clone(),
            expiration: parsed.expiration()?,
            private_key: req
                .exported
                .is_exported()
                .then(|| cert_bundle.private_key.clone()),
            private_key_type: req
                .exported
                .is_exported()
                .then(|| cert_bundle.private_key_type.clone()),
        })
    }

    /// Generate a keypair and CSR for this backend to act as an
    /// intermediate CA. Only the private key is persisted; the CSR must be
    /// signed externally and uploaded via [`Backend::set_ca`].
    pub fn generate_intermediate(
        &self,
        req: &GenerateIntermediateRequest,
    ) -> Result<GeneratedCsr> {
        check_ca_key_bits(req.key_bits)?;

        let role = Role {
            key_type: "rsa".to_string(),
            key_bits: req.key_bits,
            allow_localhost: true,
            allow_any_name: true,
            enforce_hostnames: false,
            ..Role::default()
        };
        let fields = CertRequestFields {
            common_name: req.common_name.clone(),
            alt_names: req.alt_names.clone(),
            ip_sans: req.ip_sans.clone(),
            ttl: String::new(),
            display_name: String::new(),
        };

        let bundle = generate_creation_bundle(&role, None, None, &self.config, &fields)?;
        let csr_bundle = create_csr(&bundle)?;

        let private_key_pem = pem_string(csr_bundle.private_key.private_key_to_pem_pkcs8()?)?;
        let stored = CertBundle {
            private_key: private_key_pem.clone(),
            private_key_type: csr_bundle.private_key_type.as_str().to_string(),
            ..CertBundle::default()
        };
        self.storage
            .put(CA_BUNDLE_KEY, &serde_json::to_vec(&stored)?)?;

        info!(common_name = %req.common_name, "generated intermediate CA keypair and CSR");

        Ok(GeneratedCsr {
            csr: pem_string(csr_bundle.csr.to_pem()?)?,
            private_key: req.exported.is_exported().then_some(private_key_pem),
            private_key_type: req
                .exported
                .is_exported()
                .then(|| csr_bundle.private_key_type.as_str().to_string()),
        })
    }

    /// Sign an externally supplied CSR as a subordinate CA certificate.
    /// The CSR's subject and requested extensions are carried into the
    /// certificate; the result is indexed by serial.
    pub fn sign_intermediate(&self, req: &SignIntermediateRequest) -> Result<IssuedCertificate> {
        if req.csr.is_empty() {
            return Err(PkiError::user(r#""csr" is empty"#));
        }
        let csr = X509Req::from_pem(req.csr.as_bytes())
            .map_err(|_| PkiError::user("certificate request could not be parsed"))?;

        let signing = fetch_ca_info(&self.storage, &self.config)?;

        let role = Role {
            allow_localhost: true,
            allow_any_name: true,
            enforce_hostnames: false,
            ..Role::default()
        };
        let fields = CertRequestFields {
            common_name: req.common_name.clone(),
            alt_names: req.alt_names.clone(),
            ip_sans: req.ip_sans.clone(),
            ttl: req.ttl.clone(),
            display_name: String::new(),
        };

        let mut bundle =
            generate_creation_bundle(&role, Some(&signing), Some(&csr), &self.config, &fields)?;
        bundle.is_ca = true;
        bundle.use_csr_values = true;

        let parsed = sign_certificate(&bundle, &csr)?;
        let cert_bundle = parsed.to_cert_bundle()?;

        self.storage.put(
            &format!("{}{}", CERT_PREFIX, cert_bundle.serial_number),
            &parsed.certificate_der,
        )?;

        info!(serial = %cert_bundle.serial_number, "signed subordinate CA certificate");

        Ok(IssuedCertificate {
            serial_number: cert_bundle.serial_number.clone(),
            certificate: cert_bundle.certificate.clone(),
            issuing_ca: cert_bundle.issuing_ca.clone(),
            expiration: parsed.expiration()?,
            private_key: None,
            private_key_type: None,
        })
    }

    /// Upload a PEM bundle as the active CA. A bundle without a private
    /// key is accepted when a previously generated key is stored and its
    /// public half matches the uploaded certificate.
    pub fn set_ca(&self, pem_bundle: &str) -> Result<()> {
        let mut parsed = parse_pem_bundle(pem_bundle)?;

        // A lone self-signed certificate arrives classified as issuing CA;
        // it is its own leaf.
        if parsed.certificate.is_none() {
            parsed.certificate = parsed.issuing_ca.clone();
        }
        let certificate = parsed
            .certificate
            .ok_or_else(|| PkiError::user("no certificate found in the PEM bundle"))?;

        // Reconcile a missing private key with one stored earlier: the
        // intermediate flow stores the key at generation time and the
        // signed certificate arrives later without it.
        let mut key_material = parsed.private_key.zip(parsed.private_key_type);
        if key_material.is_none() {
            if let Some(blob) = self.storage.get(CA_BUNDLE_KEY)? {
                let stored: CertBundle = serde_json::from_slice(&blob)?;
                if let Some((stored_key, stored_type)) = stored.parse_private_key()? {
                    let cert_public = certificate.public_key()?;
                    if stored_key.public_eq(&cert_public) {
                        key_material = Some((stored_key, stored_type));
                    }
                }
            }
        }
        let (private_key, private_key_type) = key_material
            .ok_or_else(|| PkiError::user("No private key given and no matching key stored"))?;

        // CRL generation is limited to RSA keys for now
        if private_key_type != KeyType::Rsa {
            return Err(PkiError::user(
                "Currently, only RSA keys are supported for the CA certificate",
            ));
        }

        let context = CaSigningContext::new(certificate, private_key, UrlEntries::default())?;
        if !context.is_ca {
            return Err(PkiError::user(
                "The given certificate is not marked for CA use and cannot be used with this backend",
            ));
        }

        let cert_bundle = CertBundle {
            certificate: pem_string(context.certificate.to_pem()?)?,
            issuing_ca: match &parsed.issuing_ca {
                Some(ca) => pem_string(ca.to_pem()?)?,
                None => String::new(),
            },
            private_key: pem_string(context.private_key.private_key_to_pem_pkcs8()?)?,
            private_key_type: context.private_key_type.as_str().to_string(),
            serial_number: serial_from_cert(&context.certificate)?,
        };

        self.storage
            .put(CA_BUNDLE_KEY, &serde_json::to_vec(&cert_bundle)?)?;
        self.storage.put(CA_KEY, &context.certificate_der)?;
        self.storage.put(CRL_KEY, &[])?;

        info!(serial = %cert_bundle.serial_number, "CA certificate set");

        Ok(())
    }

    // ------------------------------------------------------------------
    // Issuance
    // ------------------------------------------------------------------

    /// Issue an end-entity certificate under a role. A keypair is
    /// generated for the request and returned with the certificate; it is
    /// never stored.
    pub fn issue(&self, req: &IssueRequest) -> Result<IssuedCertificate> {
        let role = fetch_role(&self.storage, &req.role)?
            .ok_or_else(|| PkiError::user(format!("unknown role: {}", req.role)))?;

        let signing = fetch_ca_info(&self.storage, &self.config)?;
        let fields = CertRequestFields {
            common_name: req.common_name.clone(),
            alt_names: req.alt_names.clone(),
            ip_sans: req.ip_sans.clone(),
            ttl: req.ttl.clone(),
            display_name: req.display_name.clone(),
        };

        let bundle =
            generate_creation_bundle(&role, Some(&signing), None, &self.config, &fields)?;
        let parsed = create_certificate(&bundle)?;
        let cert_bundle = parsed.to_cert_bundle()?;

        self.storage.put(
            &format!("{}{}", CERT_PREFIX, cert_bundle.serial_number),
            &parsed.certificate_der,
        )?;

        debug!(
            role = %req.role,
            serial = %cert_bundle.serial_number,
            "issued certificate"
        );

        Ok(IssuedCertificate {
            serial_number: cert_bundle.serial_number.clone(),
            certificate: cert_bundle.certificate.clone(),
            issuing_ca: cert_bundle.issuing_ca.clone(),
            expiration: parsed.expiration()?,
            private_key: Some(cert_bundle.private_key.clone()),
            private_key_type: Some(cert_bundle.private_key_type.clone()),
        })
    }

    // ------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------

    /// Fetch a stored certificate by serial. The special serials `"ca"`
    /// and `"crl"` read the mirror entries; anything else is normalized
    /// and looked up under `certs/`.
    pub fn fetch_certificate(&self, serial: &str) -> Result<Vec<u8>> {
        let key = match serial {
            "ca" => CA_KEY.to_string(),
            "crl" => CRL_KEY.to_string(),
            other => format!("{}{}", CERT_PREFIX, normalize_serial(other)),
        };
        let value = self.storage.get(&key)?.ok_or_else(|| {
            PkiError::internal(format!("certificate with serial number {} not found", serial))
        })?;
        // The CRL mirror is legitimately empty until the first revocation
        if value.is_empty() && serial != "crl" {
            return Err(PkiError::internal(format!(
                "returned certificate bytes for serial {} were empty",
                serial
            )));
        }
        Ok(value)
    }

    /// Fetch a certificate from the revoked prefix, as moved there by the
    /// external revocation path.
    pub fn fetch_revoked_certificate(&self, serial: &str) -> Result<Vec<u8>> {
        let key = format!("{}{}", REVOKED_PREFIX, normalize_serial(serial));
        let value = self.storage.get(&key)?.ok_or_else(|| {
            PkiError::internal(format!("certificate with serial number {} not found", serial))
        })?;
        if value.is_empty() {
            return Err(PkiError::internal(format!(
                "returned certificate bytes for serial {} were empty",
                serial
            )));
        }
        Ok(value)
    }
}

fn check_ca_key_bits(key_bits: u32) -> Result<()> {
    match key_bits {
        1024 | 2048 | 4096 => Ok(()),
        _ => Err(PkiError::user(r#""key_bits" must be 1024, 2048, or 4096"#)),
    }
}
