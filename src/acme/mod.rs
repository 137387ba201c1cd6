//! ACME (RFC 8555) certificate provisioning over HTTP-01
//!
//! The provisioner drives the order state machine: account, order,
//! authorizations, challenge publication, validation polling with backoff,
//! finalization with a CSR, and download. The HTTP/JWS client itself is an
//! external collaborator behind [`AcmeTransport`]; this module owns the
//! protocol flow and the key-authorization computation.

pub mod http01;

pub use http01::{ChallengeServing, Challenger};

use crate::cert::PemBundle;
use crate::error::{FtpdError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One response from the ACME server
#[derive(Debug, Clone)]
pub struct AcmeResponse {
    /// HTTP status code
    pub status: u16,
    /// `Location` header, when present
    pub location: Option<String>,
    /// Raw response body
    pub body: Vec<u8>,
}

impl AcmeResponse {
    /// Parse the body as JSON
    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| FtpdError::Acme(format!("invalid JSON from ACME server: {e}")))
    }

    fn ok(&self) -> Result<&Self> {
        if (200..300).contains(&self.status) {
            Ok(self)
        } else {
            Err(FtpdError::Acme(format!(
                "ACME server returned {}: {}",
                self.status,
                String::from_utf8_lossy(&self.body)
            )))
        }
    }
}

/// Contract of the external HTTP/JWS client
///
/// The transport owns the account key, nonce handling, and request
/// signing; the provisioner only sees JSON in and out.
#[async_trait]
pub trait AcmeTransport: Send + Sync {
    /// Unsigned GET (directory discovery only)
    async fn get(&self, url: &str) -> Result<AcmeResponse>;

    /// JWS-signed POST; `payload` of `None` is a POST-as-GET
    async fn post(&self, url: &str, payload: Option<Value>) -> Result<AcmeResponse>;

    /// The account's public key as a JWK
    fn account_jwk(&self) -> Value;
}

/// Polling cadence for authorization and order status
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// First wait
    pub initial: Duration,
    /// Multiplier per attempt
    pub factor: f64,
    /// Upper bound per wait
    pub max_delay: Duration,
    /// Give up after this many polls
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            factor: 1.8,
            max_delay: Duration::from_secs(30),
            max_attempts: 12,
        }
    }
}

impl PollPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        // Jitter keeps a fleet of servers from polling in lockstep.
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// What to order and how to prove control
#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// RFC 8555 directory URL
    pub directory_url: String,
    /// Account contacts, e.g. `mailto:ops@example.com`
    pub contacts: Vec<String>,
    /// Hostnames to certify
    pub hostnames: Vec<String>,
    /// HTTP-01 serving mode
    pub serving: ChallengeServing,
    /// Polling cadence
    pub poll: PollPolicy,
}

/// A completed order
#[derive(Debug)]
pub struct IssuedCertificate {
    /// Key and chain ready for installation
    pub bundle: PemBundle,
    /// ACME account URL the order ran under
    pub account_id: String,
}

/// RFC 7638 JWK thumbprint, base64url-encoded
///
/// `serde_json` maps keep keys sorted, which is exactly the canonical
/// member ordering the thumbprint requires.
pub fn jwk_thumbprint(jwk: &Value) -> String {
    let canonical = jwk.to_string();
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

/// The HTTP-01 key authorization for a challenge token
pub fn key_authorization(token: &str, jwk: &Value) -> String {
    format!("{token}.{}", jwk_thumbprint(jwk))
}

/// Run a complete order and return the issued bundle
pub async fn provision(
    transport: &dyn AcmeTransport,
    request: &OrderRequest,
) -> Result<IssuedCertificate> {
    if request.hostnames.is_empty() {
        return Err(FtpdError::Acme("no hostnames requested".to_owned()));
    }

    // Directory discovery.
    let directory = transport.get(&request.directory_url).await?.ok()?.json()?;
    let new_account_url = directory_url(&directory, "newAccount")?;
    let new_order_url = directory_url(&directory, "newOrder")?;

    // Register or retrieve the account.
    let account = transport
        .post(
            &new_account_url,
            Some(json!({
                "termsOfServiceAgreed": true,
                "contact": request.contacts,
            })),
        )
        .await?;
    account.ok()?;
    let account_id = account
        .location
        .clone()
        .ok_or_else(|| FtpdError::Acme("account response lacks a Location".to_owned()))?;
    debug!(%account_id, "ACME account ready");

    // Fresh key and CSR for the requested hostnames.
    let params = rcgen::CertificateParams::new(request.hostnames.clone());
    let csr_cert = rcgen::Certificate::from_params(params)
        .map_err(|e| FtpdError::Acme(format!("cannot create CSR key: {e}")))?;
    let csr_der = csr_cert
        .serialize_request_der()
        .map_err(|e| FtpdError::Acme(format!("cannot serialize CSR: {e}")))?;
    let key_pem = csr_cert.serialize_private_key_pem();

    // Place the order.
    let identifiers: Vec<Value> = request
        .hostnames
        .iter()
        .map(|h| json!({"type": "dns", "value": h}))
        .collect();
    let order = transport
        .post(&new_order_url, Some(json!({"identifiers": identifiers})))
        .await?;
    order.ok()?;
    let order_url = order
        .location
        .clone()
        .ok_or_else(|| FtpdError::Acme("order response lacks a Location".to_owned()))?;
    let order_body = order.json()?;
    let finalize_url = string_field(&order_body, "finalize")?;
    let authorizations = order_body
        .get("authorizations")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| FtpdError::Acme("order lacks authorizations".to_owned()))?;

    // Prove control of every identifier.
    let jwk = transport.account_jwk();
    let mut challenger = Challenger::start(&request.serving).await?;
    let outcome = run_authorizations(transport, request, &jwk, &mut challenger, &authorizations)
        .await;
    challenger.cleanup().await;
    outcome?;

    // Finalize with the CSR and wait for issuance.
    let finalize = transport
        .post(
            &finalize_url,
            Some(json!({"csr": URL_SAFE_NO_PAD.encode(&csr_der)})),
        )
        .await?;
    finalize.ok()?;

    let certificate_url = poll_until(transport, &request.poll, &order_url, |body| {
        match body.get("status").and_then(Value::as_str) {
            Some("valid") => body
                .get("certificate")
                .and_then(Value::as_str)
                .map(|s| Poll::Done(s.to_owned())),
            Some("invalid") => Some(Poll::Failed("order became invalid".to_owned())),
            _ => None,
        }
        .unwrap_or(Poll::Again)
    })
    .await?;

    // Download the chain.
    let download = transport.post(&certificate_url, None).await?;
    download.ok()?;
    let certs_pem = String::from_utf8(download.body.clone())
        .map_err(|_| FtpdError::Acme("certificate download is not UTF-8 PEM".to_owned()))?;

    info!(hostnames = ?request.hostnames, "ACME order complete");
    Ok(IssuedCertificate {
        bundle: PemBundle { key_pem, certs_pem },
        account_id,
    })
}

async fn run_authorizations(
    transport: &dyn AcmeTransport,
    request: &OrderRequest,
    jwk: &Value,
    challenger: &mut Challenger,
    authorizations: &[Value],
) -> Result<()> {
    for authz in authorizations {
        let authz_url = authz
            .as_str()
            .ok_or_else(|| FtpdError::Acme("authorization URL is not a string".to_owned()))?;

        let body = transport.post(authz_url, None).await?.ok()?.json()?;
        if body.get("status").and_then(Value::as_str) == Some("valid") {
            continue; // cached from a previous order
        }

        let challenge = body
            .get("challenges")
            .and_then(Value::as_array)
            .and_then(|cs| {
                cs.iter()
                    .find(|c| c.get("type").and_then(Value::as_str) == Some("http-01"))
            })
            .ok_or_else(|| FtpdError::Acme("no http-01 challenge offered".to_owned()))?;
        let token = string_field(challenge, "token")?;
        let challenge_url = string_field(challenge, "url")?;

        challenger
            .serve(&token, &key_authorization(&token, jwk))
            .await?;

        // Tell the server to validate, then poll the authorization.
        transport.post(&challenge_url, Some(json!({}))).await?.ok()?;

        poll_until(transport, &request.poll, authz_url, |body| {
            match body.get("status").and_then(Value::as_str) {
                Some("valid") => Poll::Done(String::new()),
                Some("invalid") => Poll::Failed(format!(
                    "authorization failed: {}",
                    body.get("challenges").cloned().unwrap_or(Value::Null)
                )),
                _ => Poll::Again,
            }
        })
        .await?;
    }
    Ok(())
}

enum Poll {
    Again,
    Done(String),
    Failed(String),
}

async fn poll_until(
    transport: &dyn AcmeTransport,
    policy: &PollPolicy,
    url: &str,
    classify: impl Fn(&Value) -> Poll,
) -> Result<String> {
    for attempt in 0..policy.max_attempts {
        let body = transport.post(url, None).await?.ok()?.json()?;
        match classify(&body) {
            Poll::Done(value) => return Ok(value),
            Poll::Failed(reason) => return Err(FtpdError::Acme(reason)),
            Poll::Again => {
                let delay = policy.delay(attempt);
                debug!(%url, attempt, ?delay, "ACME resource pending");
                tokio::time::sleep(delay).await;
            }
        }
    }
    warn!(%url, "gave up polling ACME resource");
    Err(FtpdError::Acme(format!("timed out waiting on {url}")))
}

fn directory_url(directory: &Value, key: &str) -> Result<String> {
    string_field(directory, key)
        .map_err(|_| FtpdError::Acme(format!("directory lacks {key} endpoint")))
}

fn string_field(value: &Value, key: &str) -> Result<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| FtpdError::Acme(format!("missing field {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn test_thumbprint_is_canonical() {
        // Key order in the literal must not matter.
        let a = json!({"kty": "EC", "crv": "P-256", "x": "abc", "y": "def"});
        let b = json!({"y": "def", "x": "abc", "kty": "EC", "crv": "P-256"});
        assert_eq!(jwk_thumbprint(&a), jwk_thumbprint(&b));
    }

    #[test]
    fn test_key_authorization_shape() {
        let jwk = json!({"kty": "EC"});
        let ka = key_authorization("tok", &jwk);
        let (token, thumb) = ka.split_once('.').expect("dot separated");
        assert_eq!(token, "tok");
        assert!(!thumb.is_empty());
        assert!(!thumb.contains('='), "thumbprint must be unpadded base64url");
    }

    /// Scripted ACME server covering the happy path.
    struct ScriptedServer {
        state: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedServer {
        fn new() -> Self {
            Self {
                state: Mutex::new(HashMap::new()),
            }
        }

        fn respond(status: u16, location: Option<&str>, body: Value) -> AcmeResponse {
            AcmeResponse {
                status,
                location: location.map(str::to_owned),
                body: serde_json::to_vec(&body).expect("body"),
            }
        }
    }

    #[async_trait]
    impl AcmeTransport for ScriptedServer {
        async fn get(&self, url: &str) -> Result<AcmeResponse> {
            assert!(url.ends_with("/directory"));
            Ok(Self::respond(
                200,
                None,
                json!({
                    "newAccount": "https://acme.test/new-account",
                    "newOrder": "https://acme.test/new-order",
                }),
            ))
        }

        async fn post(&self, url: &str, _payload: Option<Value>) -> Result<AcmeResponse> {
            let mut state = self.state.lock().expect("state");
            let hits = state.entry(url.to_owned()).or_insert(0);
            *hits += 1;

            Ok(match url {
                "https://acme.test/new-account" => Self::respond(
                    201,
                    Some("https://acme.test/account/1"),
                    json!({"status": "valid"}),
                ),
                "https://acme.test/new-order" => Self::respond(
                    201,
                    Some("https://acme.test/order/1"),
                    json!({
                        "status": "pending",
                        "finalize": "https://acme.test/order/1/finalize",
                        "authorizations": ["https://acme.test/authz/1"],
                    }),
                ),
                "https://acme.test/authz/1" => {
                    // Pending on the first poll after triggering, then valid.
                    let status = if *hits >= 3 { "valid" } else { "pending" };
                    Self::respond(
                        200,
                        None,
                        json!({
                            "status": status,
                            "challenges": [{
                                "type": "http-01",
                                "token": "tok42",
                                "url": "https://acme.test/challenge/1",
                            }],
                        }),
                    )
                }
                "https://acme.test/challenge/1" => {
                    Self::respond(200, None, json!({"status": "processing"}))
                }
                "https://acme.test/order/1/finalize" => {
                    Self::respond(200, None, json!({"status": "processing"}))
                }
                "https://acme.test/order/1" => Self::respond(
                    200,
                    None,
                    json!({
                        "status": "valid",
                        "certificate": "https://acme.test/cert/1",
                    }),
                ),
                "https://acme.test/cert/1" => {
                    let bundle = crate::cert::generate_self_signed(
                        "acme test",
                        &["ftp.example.com".to_owned()],
                    )
                    .expect("bundle");
                    AcmeResponse {
                        status: 200,
                        location: None,
                        body: bundle.certs_pem.into_bytes(),
                    }
                }
                other => panic!("unexpected URL {other}"),
            })
        }

        fn account_jwk(&self) -> Value {
            json!({"kty": "EC", "crv": "P-256", "x": "abc", "y": "def"})
        }
    }

    #[tokio::test]
    async fn test_provision_happy_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = ScriptedServer::new();
        let request = OrderRequest {
            directory_url: "https://acme.test/directory".to_owned(),
            contacts: vec!["mailto:ops@example.com".to_owned()],
            hostnames: vec!["ftp.example.com".to_owned()],
            serving: ChallengeServing::WellKnownDir {
                dir: dir.path().join("well-known"),
                create: true,
            },
            poll: PollPolicy {
                initial: Duration::from_millis(5),
                factor: 1.0,
                max_delay: Duration::from_millis(10),
                max_attempts: 6,
            },
        };

        let issued = provision(&transport, &request).await.expect("provision");
        assert_eq!(issued.account_id, "https://acme.test/account/1");
        assert!(issued.bundle.key_pem.contains("PRIVATE KEY"));

        // The leaf really carries the requested hostname.
        let extra = issued.bundle.extra().expect("extra");
        assert_eq!(extra.hostnames, vec!["ftp.example.com".to_owned()]);

        // Token files were cleaned up after the order.
        let leftover = std::fs::read_dir(dir.path().join("well-known"))
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn test_provision_requires_hostnames() {
        let transport = ScriptedServer::new();
        let request = OrderRequest {
            directory_url: "https://acme.test/directory".to_owned(),
            contacts: vec![],
            hostnames: vec![],
            serving: ChallengeServing::WellKnownDir {
                dir: std::env::temp_dir(),
                create: false,
            },
            poll: PollPolicy::default(),
        };
        assert!(provision(&transport, &request).await.is_err());
    }
}
