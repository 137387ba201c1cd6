//! PEM bundle handling, rustls config building, and atomic installation

use crate::cert::info::{extract_extra, CertificateExtra};
use crate::error::{FtpdError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A private key and certificate chain in PEM form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemBundle {
    /// PEM private key
    pub key_pem: String,
    /// PEM certificate chain, leaf first
    pub certs_pem: String,
}

impl PemBundle {
    /// Load from a path pair; key and chain may live in one combined file
    pub async fn load(key_path: &Path, certs_path: &Path) -> Result<Self> {
        let key_pem = tokio::fs::read_to_string(key_path).await.map_err(|e| {
            FtpdError::Certificate(format!("cannot read key {}: {e}", key_path.display()))
        })?;
        let certs_pem = if certs_path == key_path {
            key_pem.clone()
        } else {
            tokio::fs::read_to_string(certs_path).await.map_err(|e| {
                FtpdError::Certificate(format!("cannot read certs {}: {e}", certs_path.display()))
            })?
        };
        Ok(Self { key_pem, certs_pem })
    }

    /// Parse into rustls types
    pub fn parse(&self) -> Result<(PrivateKeyDer<'static>, Vec<CertificateDer<'static>>)> {
        let key = rustls_pemfile::private_key(&mut BufReader::new(self.key_pem.as_bytes()))
            .map_err(|e| FtpdError::Certificate(format!("cannot parse private key: {e}")))?
            .ok_or_else(|| {
                FtpdError::Certificate(
                    "no private key found (encrypted keys are not supported)".to_owned(),
                )
            })?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(self.certs_pem.as_bytes()))
                .collect::<std::io::Result<_>>()
                .map_err(|e| FtpdError::Certificate(format!("cannot parse certificates: {e}")))?;
        if certs.is_empty() {
            return Err(FtpdError::Certificate("no certificates found".to_owned()));
        }
        Ok((key, certs))
    }

    /// The leaf certificate in DER form
    pub fn leaf_der(&self) -> Result<Vec<u8>> {
        let (_, certs) = self.parse()?;
        Ok(certs[0].to_vec())
    }

    /// Derived sidecar facts for the leaf
    pub fn extra(&self) -> Result<CertificateExtra> {
        extract_extra(&self.leaf_der()?)
    }
}

fn install_crypto_provider() {
    use rustls::crypto::{ring, CryptoProvider};
    let _ = CryptoProvider::install_default(ring::default_provider());
}

/// Build a server-side TLS config from a bundle
///
/// rustls' defaults already cap the floor at TLS 1.2, which is the minimum
/// both the FTPS and administration listeners require.
pub fn build_server_config(bundle: &PemBundle) -> Result<Arc<rustls::ServerConfig>> {
    install_crypto_provider();
    let (key, certs) = bundle.parse()?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| FtpdError::Certificate(format!("certificate/key mismatch: {e}")))?;
    Ok(Arc::new(config))
}

/// Generate a self-signed bundle for the given subject and hostnames
pub fn generate_self_signed(common_name: &str, hostnames: &[String]) -> Result<PemBundle> {
    let mut params = rcgen::CertificateParams::new(hostnames.to_vec());
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| FtpdError::Certificate(format!("cannot generate certificate: {e}")))?;
    Ok(PemBundle {
        key_pem: cert.serialize_private_key_pem(),
        certs_pem: cert
            .serialize_pem()
            .map_err(|e| FtpdError::Certificate(format!("cannot serialize certificate: {e}")))?,
    })
}

/// On-disk home of the active certificate bundle
#[derive(Debug, Clone)]
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    const KEY_FILE: &'static str = "server-key.pem";
    const CERTS_FILE: &'static str = "server-certs.pem";

    /// A store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the active key file
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(Self::KEY_FILE)
    }

    /// Path of the active chain file
    pub fn certs_path(&self) -> PathBuf {
        self.dir.join(Self::CERTS_FILE)
    }

    /// Load the active bundle, if one is installed
    pub async fn load_active(&self) -> Result<Option<PemBundle>> {
        let key_path = self.key_path();
        if tokio::fs::metadata(&key_path).await.is_err() {
            return Ok(None);
        }
        Ok(Some(PemBundle::load(&key_path, &self.certs_path()).await?))
    }

    /// Install a new bundle
    ///
    /// The bundle is proven loadable first; the previous files are only
    /// replaced afterwards (and kept as `.old` alongside), so a bad upload
    /// can never take down a working listener.
    pub async fn install(&self, bundle: &PemBundle) -> Result<CertificateExtra> {
        build_server_config(bundle)?;
        let extra = bundle.extra()?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let tmp_key = self.dir.join(format!(".{}.{suffix}", Self::KEY_FILE));
        let tmp_certs = self.dir.join(format!(".{}.{suffix}", Self::CERTS_FILE));
        tokio::fs::write(&tmp_key, &bundle.key_pem).await?;
        tokio::fs::write(&tmp_certs, &bundle.certs_pem).await?;

        for (active, tmp) in [
            (self.key_path(), tmp_key),
            (self.certs_path(), tmp_certs),
        ] {
            if tokio::fs::metadata(&active).await.is_ok() {
                let backup = active.with_extension("pem.old");
                let _ = tokio::fs::rename(&active, &backup).await;
                debug!(path = %backup.display(), "kept previous certificate file");
            }
            tokio::fs::rename(&tmp, &active).await?;
        }

        info!(fingerprint = %extra.fingerprint, "installed certificate bundle");
        Ok(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_parses_and_builds() {
        let bundle =
            generate_self_signed("ftpd test", &["localhost".to_owned()]).expect("generate");
        let (key, certs) = bundle.parse().expect("parse");
        assert!(!certs.is_empty());
        drop(key);
        build_server_config(&bundle).expect("tls config");

        let extra = bundle.extra().expect("extra");
        assert_eq!(extra.hostnames, vec!["localhost".to_owned()]);
    }

    #[test]
    fn test_mismatched_bundle_is_rejected() {
        let a = generate_self_signed("a", &["a.test".to_owned()]).expect("generate");
        let b = generate_self_signed("b", &["b.test".to_owned()]).expect("generate");
        let frankenstein = PemBundle {
            key_pem: a.key_pem,
            certs_pem: b.certs_pem,
        };
        assert!(build_server_config(&frankenstein).is_err());
    }

    #[tokio::test]
    async fn test_install_keeps_old_until_new_verified() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CertStore::new(dir.path());

        let first = generate_self_signed("first", &["one.test".to_owned()]).expect("generate");
        store.install(&first).await.expect("install first");
        let active = store.load_active().await.expect("load").expect("present");
        assert_eq!(active, first);

        // A broken bundle must not disturb the active files.
        let broken = PemBundle {
            key_pem: "garbage".to_owned(),
            certs_pem: "garbage".to_owned(),
        };
        assert!(store.install(&broken).await.is_err());
        let still_active = store.load_active().await.expect("load").expect("present");
        assert_eq!(still_active, first);

        // A good replacement lands, and the old files survive as backups.
        let second = generate_self_signed("second", &["two.test".to_owned()]).expect("generate");
        store.install(&second).await.expect("install second");
        let active = store.load_active().await.expect("load").expect("present");
        assert_eq!(active, second);
        assert!(
            tokio::fs::metadata(store.key_path().with_extension("pem.old"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_combined_file_bundle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let generated =
            generate_self_signed("combined", &["combo.test".to_owned()]).expect("generate");
        let combined = dir.path().join("combined.pem");
        tokio::fs::write(
            &combined,
            format!("{}{}", generated.key_pem, generated.certs_pem),
        )
        .await
        .expect("write");

        let bundle = PemBundle::load(&combined, &combined).await.expect("load");
        build_server_config(&bundle).expect("tls config");
    }
}
