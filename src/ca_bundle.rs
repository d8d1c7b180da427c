//! CA bundle management.
//!
//! The CA material (certificate, issuing certificate, and private key)
//! is stored as one JSON entry of PEM strings at `config/ca_bundle`. This
//! module owns that shape, the parsing of uploaded PEM bundles, and the
//! construction of the signing context handed to the certificate pipeline.
//!
//! The private key is write-once-readable: it is returned to the caller at
//! generation time when `exported` is requested, and never again.

use openssl::pkey::{Id, PKey, Private};
use openssl::x509::{X509Ref, X509Req, X509VerifyResult, X509};
use serde::{Deserialize, Serialize};

use crate::configs::{BackendConfig, UrlEntries};
use crate::errors::{PkiError, Result};
use crate::pki_generator::KeyType;
use crate::storage::{Storage, CA_BUNDLE_KEY};

/// The stored form of the CA material: PEM strings, JSON-serialized at
/// `config/ca_bundle`. Empty strings mean "absent" (an intermediate whose
/// signed certificate has not been uploaded yet has only `private_key`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertBundle {
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub issuing_ca: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub private_key_type: String,
    #[serde(default)]
    pub serial_number: String,
}

impl CertBundle {
    pub fn parse_certificate(&self) -> Result<Option<X509>> {
        if self.certificate.is_empty() {
            return Ok(None);
        }
        X509::from_pem(self.certificate.as_bytes())
            .map(Some)
            .map_err(|e| PkiError::internal(format!("stored CA certificate unparseable: {}", e)))
    }

    pub fn parse_issuing_ca(&self) -> Result<Option<X509>> {
        if self.issuing_ca.is_empty() {
            return Ok(None);
        }
        X509::from_pem(self.issuing_ca.as_bytes())
            .map(Some)
            .map_err(|e| PkiError::internal(format!("stored issuing CA unparseable: {}", e)))
    }

    pub fn parse_private_key(&self) -> Result<Option<(PKey<Private>, KeyType)>> {
        if self.private_key.is_empty() {
            return Ok(None);
        }
        let key = PKey::private_key_from_pem(self.private_key.as_bytes())
            .map_err(|e| PkiError::internal(format!("stored CA private key unparseable: {}", e)))?;
        let key_type = key_type_of(&key)?;
        Ok(Some((key, key_type)))
    }
}

fn key_type_of(key: &PKey<Private>) -> Result<KeyType> {
    match key.id() {
        Id::RSA => Ok(KeyType::Rsa),
        Id::EC => Ok(KeyType::Ec),
        other => Err(PkiError::internal(format!(
            "unsupported private key type: {:?}",
            other
        ))),
    }
}

pub(crate) fn pem_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| PkiError::internal("PEM output was not valid UTF-8"))
}

/// A freshly created certificate plus its issuing chain and, when a key
/// was generated rather than taken from a CSR, the private key.
#[derive(Debug)]
pub struct ParsedCertBundle {
    pub certificate: X509,
    pub certificate_der: Vec<u8>,
    pub issuing_ca: X509,
    pub issuing_ca_der: Vec<u8>,
    pub private_key: Option<PKey<Private>>,
    pub private_key_type: Option<KeyType>,
}

impl ParsedCertBundle {
    /// Normalized serial of the issued certificate: lowercase hex pairs
    /// joined by colons.
    pub fn serial_number(&self) -> Result<String> {
        serial_from_cert(&self.certificate)
    }

    /// `NotAfter` of the issued certificate as a Unix timestamp.
    pub fn expiration(&self) -> Result<i64> {
        let (_, parsed) = x509_parser::parse_x509_certificate(&self.certificate_der)
            .map_err(|e| PkiError::internal(format!("unable to parse created certificate: {}", e)))?;
        Ok(parsed.validity().not_after.timestamp())
    }

    /// Convert to the storable PEM form.
    pub fn to_cert_bundle(&self) -> Result<CertBundle> {
        Ok(CertBundle {
            certificate: pem_string(self.certificate.to_pem()?)?,
            issuing_ca: pem_string(self.issuing_ca.to_pem()?)?,
            private_key: match &self.private_key {
                Some(key) => pem_string(key.private_key_to_pem_pkcs8()?)?,
                None => String::new(),
            },
            private_key_type: self
                .private_key_type
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            serial_number: self.serial_number()?,
        })
    }
}

/// A freshly created CSR and the keypair behind it.
pub struct ParsedCsrBundle {
    pub csr: X509Req,
    pub csr_der: Vec<u8>,
    pub private_key: PKey<Private>,
    pub private_key_type: KeyType,
}

/// The signing context: CA certificate, private key, and the URL set to
/// stamp into subordinate certificates, with the certificate metadata the
/// issuance pipeline needs pre-extracted.
#[derive(Debug)]
pub struct CaSigningContext {
    pub certificate: X509,
    pub certificate_der: Vec<u8>,
    pub private_key: PKey<Private>,
    pub private_key_type: KeyType,
    /// `NotAfter` of the CA certificate (Unix timestamp).
    pub not_after: i64,
    /// Basic-constraints path length: `None` when unconstrained.
    pub max_path_len: Option<u32>,
    pub is_ca: bool,
    pub urls: UrlEntries,
}

impl CaSigningContext {
    pub fn new(certificate: X509, private_key: PKey<Private>, urls: UrlEntries) -> Result<Self> {
        let certificate_der = certificate.to_der()?;
        let private_key_type = key_type_of(&private_key)?;

        let (not_after, is_ca, max_path_len) = {
            let (_, parsed) = x509_parser::parse_x509_certificate(&certificate_der)
                .map_err(|e| PkiError::internal(format!("unable to parse CA certificate: {}", e)))?;
            let (is_ca, max_path_len) = match parsed.basic_constraints() {
                Ok(Some(bc)) => (bc.value.ca, bc.value.path_len_constraint),
                _ => (false, None),
            };
            (parsed.validity().not_after.timestamp(), is_ca, max_path_len)
        };

        Ok(Self {
            certificate,
            certificate_der,
            private_key,
            private_key_type,
            not_after,
            max_path_len,
            is_ca,
            urls,
        })
    }
}

/// Load the signing context from storage. Absence of the bundle, or of
/// either half of it, is the caller's problem: the backend has not been
/// configured with a CA yet.
pub fn fetch_ca_info<S: Storage>(storage: &S, config: &BackendConfig) -> Result<CaSigningContext> {
    let blob = storage
        .get(CA_BUNDLE_KEY)?
        .ok_or_else(|| PkiError::user("backend must be configured with a CA certificate/key"))?;

    let bundle: CertBundle = serde_json::from_slice(&blob)
        .map_err(|e| PkiError::internal(format!("unable to decode local CA certificate/key: {}", e)))?;

    let certificate = bundle
        .parse_certificate()?
        .ok_or_else(|| PkiError::user("backend must be configured with a CA certificate/key"))?;
    let (private_key, _) = bundle
        .parse_private_key()?
        .ok_or_else(|| PkiError::user("backend must be configured with a CA certificate/key"))?;

    CaSigningContext::new(certificate, private_key, config.urls.clone())
}

/// An uploaded PEM bundle after parsing: at most one private key, a leaf
/// certificate, and an issuing CA certificate.
#[derive(Default, Debug)]
pub struct ParsedPemBundle {
    pub certificate: Option<X509>,
    pub issuing_ca: Option<X509>,
    pub private_key: Option<PKey<Private>>,
    pub private_key_type: Option<KeyType>,
}

/// Split a concatenated PEM bundle into its certificate and key parts.
///
/// Certificates are taken in order as (leaf, issuing CA). A lone
/// certificate that is self-signed is classified as the issuing CA with no
/// leaf; the upload path promotes it.
pub fn parse_pem_bundle(pem_bundle: &str) -> Result<ParsedPemBundle> {
    let blocks = pem_blocks(pem_bundle);
    if blocks.is_empty() {
        return Err(PkiError::user("no data found in the PEM bundle"));
    }

    let mut certificates: Vec<X509> = Vec::new();
    let mut private_key: Option<PKey<Private>> = None;

    for block in blocks {
        if block.contains("BEGIN CERTIFICATE") {
            let cert = X509::from_pem(block.as_bytes()).map_err(|_| {
                PkiError::user("unable to parse a certificate in the PEM bundle")
            })?;
            certificates.push(cert);
        } else if block.contains("PRIVATE KEY") {
            if private_key.is_some() {
                return Err(PkiError::user("more than one private key given"));
            }
            let key = PKey::private_key_from_pem(block.as_bytes()).map_err(|_| {
                PkiError::user("unable to parse the private key in the PEM bundle")
            })?;
            private_key = Some(key);
        }
        // Unrecognized block types are skipped
    }

    if certificates.len() > 2 {
        return Err(PkiError::user("more than two certificates given"));
    }

    let mut parsed = ParsedPemBundle::default();
    if let Some(key) = private_key {
        parsed.private_key_type = Some(key_type_of(&key)?);
        parsed.private_key = Some(key);
    }

    let mut certs = certificates.into_iter();
    match (certs.next(), certs.next()) {
        (Some(first), Some(second)) => {
            parsed.certificate = Some(first);
            parsed.issuing_ca = Some(second);
        }
        (Some(only), None) => {
            if only.issued(&only) == X509VerifyResult::OK {
                parsed.issuing_ca = Some(only);
            } else {
                parsed.certificate = Some(only);
            }
        }
        _ => {}
    }

    Ok(parsed)
}

fn pem_blocks(pem_bundle: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = pem_bundle;
    while let Some(start) = rest.find("-----BEGIN ") {
        let candidate = &rest[start..];
        let Some(end_marker) = candidate.find("-----END ") else {
            break;
        };
        let tail = &candidate[end_marker + "-----END ".len()..];
        let Some(close) = tail.find("-----") else {
            break;
        };
        let block_len = end_marker + "-----END ".len() + close + "-----".len();
        blocks.push(&candidate[..block_len]);
        rest = &candidate[block_len..];
    }
    blocks
}

/// Normalized serial of a certificate: lowercase hex pairs joined by
/// colons, matching the `certs/<serial>` storage layout.
pub fn serial_from_cert(cert: &X509Ref) -> Result<String> {
    let bn = cert.serial_number().to_bn()?;
    let hex = bn.to_hex_str()?.to_lowercase();
    let padded = if hex.len() % 2 == 1 {
        format!("0{}", hex)
    } else {
        hex
    };
    let chars: Vec<char> = padded.chars().collect();
    Ok(chars
        .chunks(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuance::{CertUsage, CreationBundle, PathLength};
    use crate::pki_generator::create_certificate;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    fn root_bundle(cn: &str) -> ParsedCertBundle {
        let bundle = CreationBundle {
            common_name: cn.to_string(),
            dns_names: vec![],
            email_addresses: vec![],
            ip_addresses: vec![],
            is_ca: true,
            key_type: "rsa".to_string(),
            key_bits: 2048,
            signing_context: None,
            ttl: Duration::from_secs(86400),
            usage: CertUsage::default(),
            use_csr_values: false,
            urls: UrlEntries::default(),
            max_path_length: PathLength::Unconstrained,
        };
        create_certificate(&bundle).unwrap()
    }

    #[test]
    fn test_cert_bundle_roundtrip() {
        let root = root_bundle("Roundtrip Root");
        let stored = root.to_cert_bundle().unwrap();
        assert!(stored.certificate.contains("BEGIN CERTIFICATE"));
        assert!(stored.private_key.contains("PRIVATE KEY"));
        assert_eq!(stored.private_key_type, "rsa");

        let cert = stored.parse_certificate().unwrap().unwrap();
        assert_eq!(cert.to_der().unwrap(), root.certificate_der);
        let (key, key_type) = stored.parse_private_key().unwrap().unwrap();
        assert_eq!(key_type, KeyType::Rsa);
        assert!(key.public_eq(&cert.public_key().unwrap()));
    }

    #[test]
    fn test_serial_format() {
        let root = root_bundle("Serial Root");
        let serial = root.serial_number().unwrap();
        assert!(!serial.is_empty());
        for pair in serial.split(':') {
            assert_eq!(pair.len(), 2);
            assert!(pair.chars().all(|c| c.is_ascii_hexdigit()));
            assert_eq!(pair.to_lowercase(), pair);
        }
    }

    #[test]
    fn test_parse_pem_bundle_lone_self_signed() {
        let root = root_bundle("Upload Root");
        let stored = root.to_cert_bundle().unwrap();
        let pem = format!("{}{}", stored.private_key, stored.certificate);

        let parsed = parse_pem_bundle(&pem).unwrap();
        assert!(parsed.certificate.is_none());
        assert!(parsed.issuing_ca.is_some());
        assert!(parsed.private_key.is_some());
        assert_eq!(parsed.private_key_type, Some(KeyType::Rsa));
    }

    #[test]
    fn test_parse_pem_bundle_two_certificates() {
        let root = root_bundle("Chain Root");
        let leaf = {
            let ctx = CaSigningContext::new(
                root.certificate.clone(),
                root.private_key.as_ref().unwrap().clone(),
                UrlEntries::default(),
            )
            .unwrap();
            let bundle = CreationBundle {
                common_name: "leaf.example.com".to_string(),
                dns_names: vec!["leaf.example.com".to_string()],
                email_addresses: vec![],
                ip_addresses: vec![],
                is_ca: false,
                key_type: "rsa".to_string(),
                key_bits: 2048,
                signing_context: Some(&ctx),
                ttl: Duration::from_secs(3600),
                usage: CertUsage::SERVER,
                use_csr_values: false,
                urls: UrlEntries::default(),
                max_path_length: PathLength::Unconstrained,
            };
            create_certificate(&bundle).unwrap()
        };

        let pem = format!(
            "{}{}",
            pem_string(leaf.certificate.to_pem().unwrap()).unwrap(),
            pem_string(root.certificate.to_pem().unwrap()).unwrap(),
        );
        let parsed = parse_pem_bundle(&pem).unwrap();
        let got_leaf = parsed.certificate.unwrap();
        let got_issuer = parsed.issuing_ca.unwrap();
        assert_eq!(got_leaf.to_der().unwrap(), leaf.certificate_der);
        assert_eq!(got_issuer.to_der().unwrap(), root.certificate_der);
    }

    #[test]
    fn test_parse_pem_bundle_rejects_garbage_and_double_keys() {
        assert!(parse_pem_bundle("not pem at all").unwrap_err().is_user_error());

        let root = root_bundle("Key Root");
        let stored = root.to_cert_bundle().unwrap();
        let doubled = format!("{}{}", stored.private_key, stored.private_key);
        let err = parse_pem_bundle(&doubled).unwrap_err();
        assert_eq!(err.to_string(), "more than one private key given");
    }

    #[test]
    fn test_fetch_ca_info() {
        let storage = MemoryStorage::new();
        let config = BackendConfig::default();

        let err = fetch_ca_info(&storage, &config).unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(
            err.to_string(),
            "backend must be configured with a CA certificate/key"
        );

        let root = root_bundle("Fetch Root");
        let stored = root.to_cert_bundle().unwrap();
        storage
            .put(CA_BUNDLE_KEY, &serde_json::to_vec(&stored).unwrap())
            .unwrap();

        let ctx = fetch_ca_info(&storage, &config).unwrap();
        assert!(ctx.is_ca);
        assert_eq!(ctx.max_path_len, None);
        assert_eq!(ctx.private_key_type, KeyType::Rsa);
        assert!(ctx.not_after > 0);
    }

    #[test]
    fn test_fetch_ca_info_requires_private_key() {
        let storage = MemoryStorage::new();
        let config = BackendConfig::default();

        let root = root_bundle("Keyless Root");
        let mut stored = root.to_cert_bundle().unwrap();
        stored.private_key = String::new();
        stored.private_key_type = String::new();
        storage
            .put(CA_BUNDLE_KEY, &serde_json::to_vec(&stored).unwrap())
            .unwrap();

        let err = fetch_ca_info(&storage, &config).unwrap_err();
        assert!(err.is_user_error());
    }
}
