//! End-to-end control and data channel scenarios

use ftpd_rs::auth::{AuthMethod, Authenticator, RejectingImpersonator, User};
use ftpd_rs::config::{Config, ListenerConfig, TlsMode};
use ftpd_rs::ftp::session::{serve, NullEvents, SessionContext, SessionEvents};
use ftpd_rs::server::AutoBanner;
use ftpd_rs::tvfs::{MountAccess, MountPoint, MountTable, PathFormat, Recursion};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

struct Client {
    reader: BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
}

impl Client {
    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("send");
    }

    async fn expect_code(&mut self, code: u16) -> String {
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.expect("read reply");
            assert!(!line.is_empty(), "connection closed waiting for {code}");
            let trimmed = line.trim_end().to_owned();
            if trimmed.starts_with(&format!("{code} ")) {
                return trimmed;
            }
            let continuation = trimmed.starts_with(&format!("{code}-"))
                || trimmed.starts_with(' ')
                || !trimmed.chars().next().is_some_and(|c| c.is_ascii_digit());
            assert!(continuation, "expected {code}, got {trimmed:?}");
        }
    }
}

fn anon_config(root: &Path, access: MountAccess) -> (Arc<Config>, Arc<Authenticator>) {
    let mut anon = User::new("anon");
    anon.methods = vec![AuthMethod::None];
    anon.mount_table = MountTable::with_format(
        vec![MountPoint {
            virtual_path: "/".to_owned(),
            native_path: root.to_str().expect("utf8").to_owned(),
            access,
            recursion: Recursion::ApplyPermissions,
            autocreate: false,
        }],
        PathFormat::Unix,
    )
    .expect("mount table");

    let mut config = Config::default();
    config.settings.pasv_port_range = None;
    config.listeners = vec![ListenerConfig {
        address: "127.0.0.1".parse().expect("addr"),
        port: 0,
        tls: TlsMode::Plain,
    }];
    config.users = vec![anon.clone()];

    let authenticator = Authenticator::new(vec![anon], vec![], Arc::new(RejectingImpersonator));
    (Arc::new(config), Arc::new(authenticator))
}

fn spawn_session(
    root: &Path,
    access: MountAccess,
    peer: &str,
    tls_mode: TlsMode,
    events: Arc<dyn SessionEvents>,
) -> (Client, tokio::task::JoinHandle<ftpd_rs::Result<()>>) {
    let (config, authenticator) = anon_config(root, access);
    let mut config = (*config).clone();
    config.listeners[0].tls = tls_mode;
    let (client_stream, server_stream) = tokio::io::duplex(1 << 16);

    let ctx = SessionContext {
        id: 1,
        peer: peer.parse().expect("peer"),
        local_addr: "127.0.0.1:21".parse().expect("local"),
        tls_mode,
        tls_acceptor: None,
        authenticator,
        config: Arc::new(config),
        events,
    };
    let task = tokio::spawn(serve(server_stream, ctx));
    let (r, w) = tokio::io::split(client_stream);
    (
        Client {
            reader: BufReader::new(r),
            writer: w,
        },
        task,
    )
}

fn parse_pasv(reply: &str) -> SocketAddr {
    let open = reply.find('(').expect("paren");
    let close = reply.find(')').expect("paren");
    let parts: Vec<u16> = reply[open + 1..close]
        .split(',')
        .map(|p| p.parse().expect("number"))
        .collect();
    format!(
        "{}.{}.{}.{}:{}",
        parts[0],
        parts[1],
        parts[2],
        parts[3],
        (parts[4] << 8) | parts[5]
    )
    .parse()
    .expect("addr")
}

/// Anonymous LIST: login, passive listing whose entries match the native
/// directory, advertised host equal to the control-connection local
/// address.
#[tokio::test]
async fn test_anonymous_list() {
    let dir = tempfile::tempdir().expect("tempdir");
    tokio::fs::write(dir.path().join("a.txt"), b"a").await.expect("fixture");
    tokio::fs::write(dir.path().join("b.txt"), b"bb").await.expect("fixture");
    tokio::fs::create_dir(dir.path().join("subdir")).await.expect("fixture");

    let (mut client, task) = spawn_session(
        dir.path(),
        MountAccess::ReadOnly,
        "127.0.0.1:40001",
        TlsMode::Plain,
        Arc::new(NullEvents),
    );

    client.expect_code(220).await;
    client.send("USER anon").await;
    client.expect_code(331).await;
    client.send("PASS x").await;
    client.expect_code(230).await;

    client.send("PASV").await;
    let pasv = client.expect_code(227).await;
    let data_addr = parse_pasv(&pasv);
    assert_eq!(data_addr.ip(), "127.0.0.1".parse::<IpAddr>().expect("ip"));

    client.send("LIST").await;
    client.expect_code(150).await;
    let mut data = TcpStream::connect(data_addr).await.expect("data");
    let mut listing = String::new();
    data.read_to_string(&mut listing).await.expect("read listing");
    client.expect_code(226).await;

    for name in ["a.txt", "b.txt", "subdir"] {
        assert!(listing.contains(name), "missing {name} in {listing}");
    }

    client.send("QUIT").await;
    client.expect_code(221).await;
    task.await.expect("join").expect("session");
}

struct BanEvents {
    autoban: Arc<AutoBanner>,
}

impl SessionEvents for BanEvents {
    fn login_failed(&self, peer: IpAddr) {
        self.autoban.register_failure(peer);
    }
}

/// Autoban: three failures within the window ban the peer address; a
/// different address in the same window is unaffected.
#[tokio::test]
async fn test_autoban_threshold() {
    let dir = tempfile::tempdir().expect("tempdir");
    let autoban = Arc::new(AutoBanner::new(ftpd_rs::config::AutobanConfig {
        max_login_failures: 3,
        login_failures_time_window: std::time::Duration::from_secs(60),
        ban_duration: std::time::Duration::from_secs(300),
    }));

    let (mut client, task) = spawn_session(
        dir.path(),
        MountAccess::ReadOnly,
        "192.0.2.7:40002",
        TlsMode::Plain,
        Arc::new(BanEvents {
            autoban: Arc::clone(&autoban),
        }),
    );

    client.expect_code(220).await;
    for _ in 0..3 {
        client.send("USER bob").await;
        client.expect_code(331).await;
        client.send("PASS wrong").await;
        client.expect_code(530).await;
    }

    // The listener consults the banner before sending any banner bytes to
    // a new connection from this address.
    let banned: IpAddr = "192.0.2.7".parse().expect("ip");
    let innocent: IpAddr = "192.0.2.8".parse().expect("ip");
    assert!(autoban.is_banned(banned));
    assert!(!autoban.is_banned(innocent));

    client.send("QUIT").await;
    client.expect_code(221).await;
    task.await.expect("join").expect("session");
}

/// A require-tls listener refuses pre-AUTH commands with 534 and keeps the
/// connection open.
#[tokio::test]
async fn test_require_tls_gates_plaintext() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut client, task) = spawn_session(
        dir.path(),
        MountAccess::ReadOnly,
        "127.0.0.1:40003",
        TlsMode::Explicit { require_tls: true },
        Arc::new(NullEvents),
    );

    client.expect_code(220).await;
    client.send("USER x").await;
    client.expect_code(534).await;
    client.send("PASV").await;
    client.expect_code(534).await;

    // FEAT and HELP stay reachable for capability discovery.
    client.send("FEAT").await;
    client.expect_code(211).await;
    client.send("HELP").await;
    client.expect_code(214).await;

    client.send("QUIT").await;
    client.expect_code(221).await;
    task.await.expect("join").expect("session");
}

/// A read-only mount refuses uploads and structure changes.
#[tokio::test]
async fn test_read_only_mount_refuses_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    tokio::fs::write(dir.path().join("keep.txt"), b"x").await.expect("fixture");

    let (mut client, task) = spawn_session(
        dir.path(),
        MountAccess::ReadOnly,
        "127.0.0.1:40004",
        TlsMode::Plain,
        Arc::new(NullEvents),
    );

    client.expect_code(220).await;
    client.send("USER anon").await;
    client.expect_code(331).await;
    client.send("PASS x").await;
    client.expect_code(230).await;

    client.send("MKD newdir").await;
    client.expect_code(550).await;
    client.send("DELE keep.txt").await;
    client.expect_code(550).await;
    assert!(dir.path().join("keep.txt").exists());

    client.send("QUIT").await;
    client.expect_code(221).await;
    task.await.expect("join").expect("session");
}
