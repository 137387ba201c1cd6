//! Serving HTTP-01 challenges
//!
//! Two ways to expose `/.well-known/acme-challenge/<token>`: a minimal
//! internal HTTP listener, or token files written under an externally
//! configured well-known directory (for setups where another web server
//! already owns port 80).

use crate::error::{FtpdError, Result};
use crate::http::{MessageConsumer, MessageFlow, MessageHandler, MessageKind};
use crate::pipeline::{Pipe, SocketAdapter};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

type TokenMap = Arc<Mutex<HashMap<String, String>>>;

/// How challenges should be made reachable by the ACME server
#[derive(Debug, Clone)]
pub enum ChallengeServing {
    /// Bind a minimal HTTP listener ourselves
    Internal {
        /// Address to listen on, typically port 80
        bind: SocketAddr,
    },
    /// Write token files under an existing web server's well-known path
    WellKnownDir {
        /// Directory mapped to `/.well-known/acme-challenge/`
        dir: PathBuf,
        /// Create the directory if missing
        create: bool,
    },
}

/// Publishes `token -> key-authorization` mappings for the order's lifetime
///
/// Dropping the challenger stops the internal listener; externally written
/// token files are removed explicitly via [`cleanup`](Self::cleanup).
pub struct Challenger {
    mode: Mode,
}

enum Mode {
    Internal {
        tokens: TokenMap,
        task: JoinHandle<()>,
    },
    External {
        dir: PathBuf,
        written: Vec<PathBuf>,
    },
}

impl Challenger {
    /// Start serving per the given mode
    pub async fn start(serving: &ChallengeServing) -> Result<Self> {
        match serving {
            ChallengeServing::Internal { bind } => {
                let tokens: TokenMap = Arc::new(Mutex::new(HashMap::new()));
                let listener = TcpListener::bind(bind).await.map_err(|e| {
                    FtpdError::Acme(format!("cannot bind challenge listener on {bind}: {e}"))
                })?;
                debug!(%bind, "internal challenge listener started");
                let task = tokio::spawn(serve_challenges(listener, Arc::clone(&tokens)));
                Ok(Self {
                    mode: Mode::Internal { tokens, task },
                })
            }
            ChallengeServing::WellKnownDir { dir, create } => {
                if *create {
                    tokio::fs::create_dir_all(dir).await.map_err(|e| {
                        FtpdError::Acme(format!(
                            "cannot create well-known path {}: {e}",
                            dir.display()
                        ))
                    })?;
                } else if tokio::fs::metadata(dir).await.is_err() {
                    return Err(FtpdError::Acme(format!(
                        "well-known path {} does not exist",
                        dir.display()
                    )));
                }
                Ok(Self {
                    mode: Mode::External {
                        dir: dir.clone(),
                        written: Vec::new(),
                    },
                })
            }
        }
    }

    /// Publish one token's key authorization
    pub async fn serve(&mut self, token: &str, key_authorization: &str) -> Result<()> {
        match &mut self.mode {
            Mode::Internal { tokens, .. } => {
                tokens
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(token.to_owned(), key_authorization.to_owned());
                Ok(())
            }
            Mode::External { dir, written } => {
                let path = dir.join(token);
                tokio::fs::write(&path, key_authorization)
                    .await
                    .map_err(|e| {
                        FtpdError::Acme(format!("cannot write token file {}: {e}", path.display()))
                    })?;
                written.push(path);
                Ok(())
            }
        }
    }

    /// Remove any published state
    pub async fn cleanup(&mut self) {
        if let Mode::External { written, .. } = &mut self.mode {
            for path in written.drain(..) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), "cannot remove token file: {e}");
                }
            }
        }
    }
}

impl Drop for Challenger {
    fn drop(&mut self) {
        if let Mode::Internal { task, .. } = &self.mode {
            task.abort();
        }
    }
}

struct RequestPath {
    path: Option<String>,
}

#[async_trait::async_trait]
impl MessageHandler for RequestPath {
    async fn on_start_line(&mut self, line: &str) -> io::Result<()> {
        // "GET /path HTTP/1.1"
        let mut parts = line.split_ascii_whitespace();
        let method = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("");
        if method == "GET" {
            self.path = Some(path.to_owned());
        }
        Ok(())
    }

    async fn on_end_of_message(&mut self) -> io::Result<MessageFlow> {
        Ok(MessageFlow::Stop)
    }
}

async fn serve_challenges(listener: TcpListener, tokens: TokenMap) {
    loop {
        let Ok((stream, peer)) = listener.accept().await else {
            return;
        };
        let tokens = Arc::clone(&tokens);
        tokio::spawn(async move {
            debug!(%peer, "challenge request");
            let (reader, writer) = SocketAdapter::split(stream);
            let mut consumer = MessageConsumer::new(
                RequestPath { path: None },
                MessageKind::Request,
                8 * 1024,
            );
            let outcome = Pipe::new(8).run(reader, &mut consumer).await;
            let mut wh = writer.into_inner();

            let body = outcome
                .is_ok()
                .then(|| consumer.handler().path.clone())
                .flatten()
                .and_then(|path| {
                    let token = path.strip_prefix(CHALLENGE_PREFIX)?;
                    tokens
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get(token)
                        .cloned()
                });

            let response = match body {
                Some(key_auth) => format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{key_auth}",
                    key_auth.len()
                ),
                None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    .to_owned(),
            };
            let _ = wh.write_all(response.as_bytes()).await;
            let _ = wh.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write");
        stream.shutdown().await.expect("half close");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        response
    }

    #[tokio::test]
    async fn test_internal_challenge_listener() {
        // Ephemeral port; drive the accept loop directly.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let tokens: TokenMap = Arc::new(Mutex::new(HashMap::new()));
        let _task = tokio::spawn(serve_challenges(listener, Arc::clone(&tokens)));

        tokens
            .lock()
            .expect("lock")
            .insert("tok123".to_owned(), "tok123.thumb".to_owned());

        let hit = http_get(addr, "/.well-known/acme-challenge/tok123").await;
        assert!(hit.starts_with("HTTP/1.1 200"), "{hit}");
        assert!(hit.ends_with("tok123.thumb"), "{hit}");

        let miss = http_get(addr, "/.well-known/acme-challenge/unknown").await;
        assert!(miss.starts_with("HTTP/1.1 404"), "{miss}");
    }

    #[tokio::test]
    async fn test_external_dir_writes_and_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let well_known = dir.path().join("acme");
        let serving = ChallengeServing::WellKnownDir {
            dir: well_known.clone(),
            create: true,
        };

        let mut challenger = Challenger::start(&serving).await.expect("start");
        challenger.serve("tok", "tok.thumb").await.expect("serve");

        let content = tokio::fs::read_to_string(well_known.join("tok"))
            .await
            .expect("token file");
        assert_eq!(content, "tok.thumb");

        challenger.cleanup().await;
        assert!(tokio::fs::metadata(well_known.join("tok")).await.is_err());
    }
}
