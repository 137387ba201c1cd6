//! TLS certificates: sources, fingerprints, loading, and installation
//!
//! A certificate can be operator-provided paths, generated self-signed,
//! uploaded over the administration channel, or obtained via ACME. Whatever
//! the source, the served material is a [`PemBundle`] installed through the
//! [`CertStore`], which refuses to replace a working bundle with one that
//! does not load.

pub mod fingerprint;
pub mod info;
pub mod store;

pub use fingerprint::Fingerprint;
pub use info::{extract_extra, CertificateExtra, CertificateSource};
pub use store::{build_server_config, generate_self_signed, CertStore, PemBundle};
