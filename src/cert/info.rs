//! Certificate configuration variants and the derived sidecar

use crate::cert::fingerprint::Fingerprint;
use crate::error::{FtpdError, Result};
use std::path::PathBuf;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// Where a TLS certificate comes from
#[derive(Debug, Clone, PartialEq)]
pub enum CertificateSource {
    /// Paths on the server's disk supplied by the operator
    UserProvided {
        /// Private key file (may equal `certs_path` for a combined bundle)
        key_path: PathBuf,
        /// Certificate chain file
        certs_path: PathBuf,
        /// Password for an encrypted key, when needed
        password: Option<String>,
    },
    /// Generated by the server itself
    SelfSigned {
        /// Fingerprint of the leaf
        fingerprint: Fingerprint,
        /// PEM private key
        key_pem: String,
        /// PEM certificate
        certs_pem: String,
    },
    /// Uploaded over the administration channel
    Uploaded {
        /// Fingerprint of the leaf
        fingerprint: Fingerprint,
        /// PEM private key
        key_pem: String,
        /// PEM certificate chain
        certs_pem: String,
    },
    /// Obtained from an ACME directory
    Acme {
        /// ACME account URL
        account_id: String,
        /// Hostnames the order covered
        hostnames: Vec<String>,
        /// Fingerprint of the leaf
        fingerprint: Fingerprint,
        /// PEM private key
        key_pem: String,
        /// PEM certificate chain
        certs_pem: String,
    },
}

/// Derived certificate facts; never authoritative, recomputed from the
/// certificate itself whenever needed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateExtra {
    /// Start of validity, seconds since the Unix epoch
    pub not_before: i64,
    /// End of validity, seconds since the Unix epoch
    pub not_after: i64,
    /// Subject distinguished name
    pub distinguished_name: String,
    /// Hostnames from subjectAltName
    pub hostnames: Vec<String>,
    /// Leaf fingerprint
    pub fingerprint: Fingerprint,
}

/// Extract the sidecar facts from a DER-encoded leaf certificate
pub fn extract_extra(der: &[u8]) -> Result<CertificateExtra> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| FtpdError::Certificate(format!("cannot parse certificate: {e}")))?;

    let mut hostnames = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                hostnames.push((*dns).to_owned());
            }
        }
    }

    Ok(CertificateExtra {
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
        distinguished_name: cert.subject().to_string(),
        hostnames,
        fingerprint: Fingerprint::of_der(der),
    })
}
