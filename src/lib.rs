//! certmint - PKI Issuance Backend Library
//!
//! A secrets-engine style Certificate Authority core: it maintains a CA
//! bundle (certificate plus private key), persists named roles that
//! constrain what may be issued, and produces X.509 artifacts: self-signed
//! roots, CSRs for intermediates, end-entity certificates issued under a
//! role, and CA-signed certificates from externally supplied CSRs.
//!
//! # Architecture
//!
//! ```text
//! Backend (protocol)
//!   ├── roles        role CRUD, schema validation, legacy migration
//!   ├── name_policy  per-name admission under a role's toggles
//!   ├── issuance     request + role + CA context -> creation bundle
//!   ├── pki_generator keys, templates, self/CA/CSR signing, CSRs
//!   ├── ca_bundle    CA bundle persistence, PEM parsing, signing context
//!   └── storage      byte-blob KV abstraction (memory / file backed)
//! ```
//!
//! A request enters through the role store, the issuance module vets names
//! and resolves TTLs into a creation bundle, the generator materializes a
//! keypair and template, and the signer emits certificate bytes using the
//! signing context loaded from the CA bundle. Results are persisted by
//! serial and returned.
//!
//! # Storage layout
//!
//! | Key | Value |
//! |---|---|
//! | `role/<name>` | JSON-serialized role |
//! | `config/ca_bundle` | JSON of PEM strings (certificate, issuing CA, private key) |
//! | `ca` | DER of the active CA certificate |
//! | `crl` | DER of the current CRL (empty until first revocation) |
//! | `certs/<serial>` | DER of an issued certificate |
//! | `revoked/<serial>` | DER of a revoked certificate |
//!
//! # Error model
//!
//! Every operation returns [`errors::PkiError`], split into `User`
//! (malformed input, policy violations, missing prerequisites; surface in
//! the response payload) and `Internal` (primitive failures; surface on
//! the transport).
//!
//! # Example
//!
//! ```rust,no_run
//! use certmint::{Backend, BackendConfig, ExportPolicy, GenerateRootRequest, MemoryStorage};
//!
//! # fn main() -> Result<(), certmint::PkiError> {
//! let backend = Backend::new(MemoryStorage::new(), BackendConfig::default());
//! let root = backend.generate_root(&GenerateRootRequest {
//!     exported: ExportPolicy::Internal,
//!     common_name: "Example Root CA".to_string(),
//!     ttl: "87600h".to_string(),
//!     ..Default::default()
//! })?;
//! println!("root serial: {}", root.serial_number);
//! # Ok(())
//! # }
//! ```

pub mod ca_bundle;
pub mod configs;
pub mod errors;
pub mod issuance;
pub mod name_policy;
pub mod pki_generator;
pub mod protocol;
pub mod roles;
pub mod storage;

pub use ca_bundle::{CaSigningContext, CertBundle};
pub use configs::{BackendConfig, UrlEntries};
pub use errors::{PkiError, Result};
pub use protocol::{
    Backend, ExportPolicy, GenerateIntermediateRequest, GenerateRootRequest, GeneratedCsr,
    IssueRequest, IssuedCertificate, SignIntermediateRequest,
};
pub use roles::Role;
pub use storage::{FileStorage, MemoryStorage, Storage};
