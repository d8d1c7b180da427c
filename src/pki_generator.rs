//! Key and certificate generation.
//!
//! Turns a resolved [`CreationBundle`] into signed X.509 material. Three
//! signing modes share one template pipeline:
//!
//! - **Self-signed root**: the template is its own issuer, signed by the
//!   freshly generated key.
//! - **CA-signed**: the signing context's certificate is the issuer and its
//!   private key signs; the subject's key is freshly generated.
//! - **CSR-signed**: the public key (and, for CA issuance, the subject and
//!   requested extensions) come from a verified CSR; the signing context's
//!   key signs.
//!
//! The signature digest is always SHA-256; OpenSSL derives the signature
//! algorithm (RSA or ECDSA) from the signing key's type.

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509Extension, X509Name, X509Ref, X509Req, X509ReqRef, X509};

use crate::ca_bundle::{ParsedCertBundle, ParsedCsrBundle};
use crate::configs::UrlEntries;
use crate::errors::{PkiError, Result};
use crate::issuance::{unix_now, CertUsage, CreationBundle, PathLength};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const SERIAL_BITS: i32 = 159;

/// Private key algorithm of generated or stored key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Ec,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Rsa => "rsa",
            KeyType::Ec => "ec",
        }
    }
}

/// Generate a keypair for the requested type and bit width. EC bit widths
/// select the NIST curve of the same size.
pub fn generate_private_key(key_type: &str, key_bits: u32) -> Result<(PKey<Private>, KeyType)> {
    match key_type {
        "rsa" => {
            let rsa = Rsa::generate(key_bits)
                .map_err(|e| PkiError::internal(format!("error generating RSA private key: {}", e)))?;
            Ok((PKey::from_rsa(rsa)?, KeyType::Rsa))
        }
        "ec" => {
            let nid = match key_bits {
                224 => Nid::SECP224R1,
                256 => Nid::X9_62_PRIME256V1,
                384 => Nid::SECP384R1,
                521 => Nid::SECP521R1,
                n => {
                    return Err(PkiError::user(format!(
                        "unsupported bit length for EC key: {}",
                        n
                    )))
                }
            };
            let group = EcGroup::from_curve_name(nid)?;
            let ec = EcKey::generate(&group)
                .map_err(|e| PkiError::internal(format!("error generating EC private key: {}", e)))?;
            Ok((PKey::from_ec_key(ec)?, KeyType::Ec))
        }
        other => Err(PkiError::user(format!("unknown key type: {}", other))),
    }
}

/// A uniform random serial in `[0, 2^159)`.
fn random_serial() -> Result<Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

fn common_name_subject(common_name: &str) -> Result<X509Name> {
    let mut name_builder = X509Name::builder()?;
    name_builder.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    Ok(name_builder.build())
}

fn set_validity(builder: &mut X509Builder, ttl_secs: i64) -> Result<()> {
    let now = unix_now();
    let not_before = Asn1Time::from_unix(now)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::from_unix(now + ttl_secs)?;
    builder.set_not_after(&not_after)?;
    Ok(())
}

fn add_basic_constraints(
    builder: &mut X509Builder,
    is_ca: bool,
    max_path_length: PathLength,
) -> Result<()> {
    let mut bc = BasicConstraints::new();
    bc.critical();
    if is_ca {
        bc.ca();
        // Limit(0) produces the explicit pathlen:0 encoding for a
        // leaf-only CA; Unconstrained omits the field entirely.
        if let PathLength::Limit(n) = max_path_length {
            bc.pathlen(n);
        }
    }
    builder.append_extension(bc.build()?)?;
    Ok(())
}

fn add_key_usage(builder: &mut X509Builder, is_ca: bool) -> Result<()> {
    let mut ku = KeyUsage::new();
    ku.critical()
        .digital_signature()
        .key_encipherment()
        .key_agreement();
    if is_ca {
        ku.key_cert_sign().crl_sign();
    }
    builder.append_extension(ku.build()?)?;
    Ok(())
}

fn add_ext_key_usage(builder: &mut X509Builder, usage: CertUsage, is_ca: bool) -> Result<()> {
    if usage.is_empty() && !is_ca {
        return Ok(());
    }
    let mut eku = ExtendedKeyUsage::new();
    if usage.contains(CertUsage::SERVER) {
        eku.server_auth();
    }
    if usage.contains(CertUsage::CLIENT) {
        eku.client_auth();
    }
    if usage.contains(CertUsage::CODE_SIGNING) {
        eku.code_signing();
    }
    if usage.contains(CertUsage::EMAIL_PROTECTION) {
        eku.email_protection();
    }
    if is_ca {
        eku.other("OCSPSigning");
    }
    builder.append_extension(eku.build()?)?;
    Ok(())
}

fn add_san_extension(
    builder: &mut X509Builder,
    bundle: &CreationBundle,
    issuer: Option<&X509Ref>,
) -> Result<()> {
    if bundle.dns_names.is_empty()
        && bundle.email_addresses.is_empty()
        && bundle.ip_addresses.is_empty()
    {
        return Ok(());
    }
    let mut san = SubjectAlternativeName::new();
    for dns in &bundle.dns_names {
        san.dns(dns);
    }
    for email in &bundle.email_addresses {
        san.email(email);
    }
    for ip in &bundle.ip_addresses {
        san.ip(&ip.to_string());
    }
    let ext = san.build(&builder.x509v3_context(issuer, None))?;
    builder.append_extension(ext)?;
    Ok(())
}

fn add_subject_key_id(builder: &mut X509Builder, issuer: Option<&X509Ref>) -> Result<()> {
    // Derived from the public key already set on the template, so the CSR
    // path hashes the CSR's key and the generate path hashes the new one.
    let ext = SubjectKeyIdentifier::new().build(&builder.x509v3_context(issuer, None))?;
    builder.append_extension(ext)?;
    Ok(())
}

// The openssl crate has no typed builders for AIA or CRL distribution
// points; these two go through the conf-string constructor.
#[allow(deprecated)]
fn add_url_extensions(
    builder: &mut X509Builder,
    urls: &UrlEntries,
    issuer: Option<&X509Ref>,
) -> Result<()> {
    let mut access: Vec<String> = urls
        .issuing_certificates
        .iter()
        .map(|u| format!("caIssuers;URI:{}", u))
        .collect();
    access.extend(urls.ocsp_servers.iter().map(|u| format!("OCSP;URI:{}", u)));
    if !access.is_empty() {
        let ext = X509Extension::new_nid(
            None,
            Some(&builder.x509v3_context(issuer, None)),
            Nid::INFO_ACCESS,
            &access.join(","),
        )?;
        builder.append_extension(ext)?;
    }

    if !urls.crl_distribution_points.is_empty() {
        let points: Vec<String> = urls
            .crl_distribution_points
            .iter()
            .map(|u| format!("URI:{}", u))
            .collect();
        let ext = X509Extension::new_nid(
            None,
            Some(&builder.x509v3_context(issuer, None)),
            Nid::CRL_DISTRIBUTION_POINTS,
            &points.join(","),
        )?;
        builder.append_extension(ext)?;
    }
    Ok(())
}

/// Create a certificate with a freshly generated keypair: a self-signed
/// root when the bundle has no signing context, otherwise a CA-signed
/// end-entity certificate.
pub fn create_certificate(bundle: &CreationBundle) -> Result<ParsedCertBundle> {
    let (private_key, key_type) = generate_private_key(&bundle.key_type, bundle.key_bits)?;

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;

    let subject = common_name_subject(&bundle.common_name)?;
    builder.set_subject_name(&subject)?;
    set_validity(&mut builder, bundle.ttl.as_secs() as i64)?;
    builder.set_pubkey(&private_key)?;

    let certificate = match bundle.signing_context {
        Some(ctx) => {
            builder.set_issuer_name(ctx.certificate.subject_name())?;
            add_basic_constraints(&mut builder, false, bundle.max_path_length)?;
            add_key_usage(&mut builder, false)?;
            add_ext_key_usage(&mut builder, bundle.usage, false)?;
            add_san_extension(&mut builder, bundle, Some(&ctx.certificate))?;
            add_subject_key_id(&mut builder, Some(&ctx.certificate))?;
            add_url_extensions(&mut builder, &bundle.urls, Some(&ctx.certificate))?;
            builder.sign(&ctx.private_key, MessageDigest::sha256())?;
            builder.build()
        }
        None => {
            // Self-signed root: always a CA
            builder.set_issuer_name(&subject)?;
            add_basic_constraints(&mut builder, true, bundle.max_path_length)?;
            add_key_usage(&mut builder, true)?;
            add_ext_key_usage(&mut builder, bundle.usage, true)?;
            add_san_extension(&mut builder, bundle, None)?;
            add_subject_key_id(&mut builder, None)?;
            add_url_extensions(&mut builder, &bundle.urls, None)?;
            builder.sign(&private_key, MessageDigest::sha256())?;
            builder.build()
        }
    };

    let certificate_der = certificate.to_der()?;
    let (issuing_ca, issuing_ca_der) = match bundle.signing_context {
        Some(ctx) => (ctx.certificate.clone(), ctx.certificate_der.clone()),
        None => (certificate.clone(), certificate_der.clone()),
    };

    Ok(ParsedCertBundle {
        certificate,
        certificate_der,
        issuing_ca,
        issuing_ca_der,
        private_key: Some(private_key),
        private_key_type: Some(key_type),
    })
}

/// Sign a certificate from an externally supplied CSR. The CSR's signature
/// is verified first; its public key becomes the subject key. When the
/// bundle asks for CSR values on a CA issuance, the CSR's subject and
/// requested extensions are carried into the certificate.
pub fn sign_certificate(bundle: &CreationBundle, csr: &X509ReqRef) -> Result<ParsedCertBundle> {
    let ctx = bundle
        .signing_context
        .ok_or_else(|| PkiError::internal("no signing context given for CSR signing"))?;

    let csr_public_key = csr
        .public_key()
        .map_err(|_| PkiError::user("certificate request could not be parsed"))?;
    let verified = csr
        .verify(&csr_public_key)
        .map_err(|_| PkiError::user("request signature invalid"))?;
    if !verified {
        return Err(PkiError::user("request signature invalid"));
    }

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    set_validity(&mut builder, bundle.ttl.as_secs() as i64)?;
    builder.set_pubkey(&csr_public_key)?;
    builder.set_issuer_name(ctx.certificate.subject_name())?;

    let use_csr_values = bundle.use_csr_values && bundle.is_ca;
    if use_csr_values {
        builder.set_subject_name(csr.subject_name())?;
        // Carry the requested extension list across verbatim. A CSR with
        // no attribute block yields no stack.
        if let Ok(extensions) = csr.extensions() {
            for ext in extensions.iter() {
                builder.append_extension2(ext)?;
            }
        }
    } else {
        let subject = common_name_subject(&bundle.common_name)?;
        builder.set_subject_name(&subject)?;
        add_key_usage(&mut builder, bundle.is_ca)?;
        add_ext_key_usage(&mut builder, bundle.usage, bundle.is_ca)?;
        add_san_extension(&mut builder, bundle, Some(&ctx.certificate))?;
    }

    add_basic_constraints(&mut builder, bundle.is_ca, bundle.max_path_length)?;
    add_subject_key_id(&mut builder, Some(&ctx.certificate))?;
    add_url_extensions(&mut builder, &bundle.urls, Some(&ctx.certificate))?;

    builder.sign(&ctx.private_key, MessageDigest::sha256())?;
    let certificate = builder.build();
    let certificate_der = certificate.to_der()?;

    Ok(ParsedCertBundle {
        certificate,
        certificate_der,
        issuing_ca: ctx.certificate.clone(),
        issuing_ca_der: ctx.certificate_der.clone(),
        private_key: None,
        private_key_type: None,
    })
}

/// Create a CSR and its keypair. Used for the intermediate-CA path: the
/// request carries only the subject CN and any SANs; constraints are left
/// for the signing authority to impose.
pub fn create_csr(bundle: &CreationBundle) -> Result<ParsedCsrBundle> {
    let (private_key, key_type) = generate_private_key(&bundle.key_type, bundle.key_bits)?;

    let mut builder = X509Req::builder()?;
    builder.set_version(0)?;
    let subject = common_name_subject(&bundle.common_name)?;
    builder.set_subject_name(&subject)?;
    builder.set_pubkey(&private_key)?;

    if !bundle.dns_names.is_empty()
        || !bundle.email_addresses.is_empty()
        || !bundle.ip_addresses.is_empty()
    {
        let mut san = SubjectAlternativeName::new();
        for dns in &bundle.dns_names {
            san.dns(dns);
        }
        for email in &bundle.email_addresses {
            san.email(email);
        }
        for ip in &bundle.ip_addresses {
            san.ip(&ip.to_string());
        }
        let ext = san.build(&builder.x509v3_context(None))?;
        let mut extensions = Stack::new()?;
        extensions.push(ext)?;
        builder.add_extensions(&extensions)?;
    }

    builder.sign(&private_key, MessageDigest::sha256())?;
    let csr = builder.build();
    let csr_der = csr.to_der()?;

    Ok(ParsedCsrBundle {
        csr,
        csr_der,
        private_key,
        private_key_type: key_type,
    })
}
