//! Data-connection establishment: PASV/EPSV listeners and PORT/EPRT targets

use crate::error::{FtpdError, Result};
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Bind a TCP listener with `SO_REUSEADDR`, so passive ports recycle
/// quickly between transfers instead of lingering in TIME_WAIT
pub(crate) fn bind_reusable(addr: SocketAddr) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    TcpListener::from_std(socket.into())
}

/// Accept deadline for a passive listener once a transfer command arrives
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// A pending data connection, at most one per session
///
/// A second PASV/PORT replaces the first; the replaced listener closes
/// with its socket.
#[derive(Debug)]
pub enum PendingData {
    /// Passive: we listen, the client connects
    Passive {
        /// The bound listener
        listener: TcpListener,
        /// Address the client was told to connect to
        advertised: SocketAddr,
    },
    /// Active: the client listens, we connect
    Active {
        /// Where to connect
        target: SocketAddr,
    },
}

impl PendingData {
    /// Establish the connection, enforcing the peer-address check for
    /// passive mode
    pub async fn establish(self, control_peer: IpAddr) -> Result<TcpStream> {
        match self {
            PendingData::Passive { listener, .. } => {
                let accept = tokio::time::timeout(ACCEPT_TIMEOUT, async {
                    loop {
                        let (stream, peer) = listener.accept().await?;
                        // Only the control-connection peer may pick the
                        // transfer up.
                        if peer.ip() == control_peer {
                            return Ok::<_, std::io::Error>(stream);
                        }
                        debug!(%peer, "rejecting data connection from foreign address");
                    }
                })
                .await
                .map_err(|_| FtpdError::Timeout)??;
                Ok(accept)
            }
            PendingData::Active { target } => {
                let stream = tokio::time::timeout(ACCEPT_TIMEOUT, TcpStream::connect(target))
                    .await
                    .map_err(|_| FtpdError::Timeout)??;
                Ok(stream)
            }
        }
    }
}

/// Bind a passive listener on `bind_ip`, preferring the configured range
///
/// Ports are probed in random order so parallel sessions spread out; with
/// no range the OS picks an ephemeral port.
pub async fn bind_passive(
    bind_ip: IpAddr,
    range: Option<(u16, u16)>,
) -> Result<(TcpListener, SocketAddr)> {
    match range {
        None => {
            let listener = bind_reusable(SocketAddr::new(bind_ip, 0))?;
            let addr = listener.local_addr()?;
            Ok((listener, addr))
        }
        Some((lo, hi)) => {
            let span = u32::from(hi.saturating_sub(lo)) + 1;
            let attempts = span.min(64);
            let mut rng = rand::thread_rng();
            for _ in 0..attempts {
                let port = lo + (rng.gen_range(0..span) as u16);
                match bind_reusable(SocketAddr::new(bind_ip, port)) {
                    Ok(listener) => {
                        let addr = listener.local_addr()?;
                        return Ok((listener, addr));
                    }
                    Err(_) => continue,
                }
            }
            Err(FtpdError::Other(format!(
                "no free passive port in {lo}-{hi}"
            )))
        }
    }
}

/// Render the 227 reply body for an advertised endpoint
pub fn pasv_reply_body(addr: SocketAddr) -> Option<String> {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let [a, b, c, d] = ip.octets();
            let port = addr.port();
            Some(format!(
                "Entering Passive Mode ({a},{b},{c},{d},{},{})",
                port >> 8,
                port & 0xff
            ))
        }
        IpAddr::V6(_) => None, // PASV is IPv4-only; clients use EPSV
    }
}

/// Render the 229 reply body
pub fn epsv_reply_body(port: u16) -> String {
    format!("Entering Extended Passive Mode (|||{port}|)")
}

/// Parse a PORT argument (`h1,h2,h3,h4,p1,p2`)
pub fn parse_port_arg(arg: &str) -> Option<SocketAddr> {
    let parts: Vec<u8> = arg
        .split(',')
        .map(|p| p.trim().parse::<u8>().ok())
        .collect::<Option<Vec<u8>>>()?;
    if parts.len() != 6 {
        return None;
    }
    let ip = IpAddr::from([parts[0], parts[1], parts[2], parts[3]]);
    let port = (u16::from(parts[4]) << 8) | u16::from(parts[5]);
    if port == 0 {
        return None;
    }
    Some(SocketAddr::new(ip, port))
}

/// Parse an EPRT argument (`|1|ip|port|` or `|2|ip6|port|`)
pub fn parse_eprt_arg(arg: &str) -> Option<SocketAddr> {
    let delim = arg.chars().next()?;
    let mut fields = arg.split(delim);
    fields.next()?; // leading empty field
    let proto = fields.next()?;
    let host = fields.next()?;
    let port: u16 = fields.next()?.parse().ok()?;
    if port == 0 {
        return None;
    }
    let ip: IpAddr = host.parse().ok()?;
    match (proto, ip) {
        ("1", IpAddr::V4(_)) | ("2", IpAddr::V6(_)) => Some(SocketAddr::new(ip, port)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pasv_reply_encoding() {
        let addr: SocketAddr = "192.0.2.7:50010".parse().expect("addr");
        assert_eq!(
            pasv_reply_body(addr).expect("v4"),
            "Entering Passive Mode (192,0,2,7,195,90)"
        );
        let v6: SocketAddr = "[2001:db8::1]:50010".parse().expect("addr");
        assert!(pasv_reply_body(v6).is_none());
    }

    #[test]
    fn test_parse_port_arg() {
        assert_eq!(
            parse_port_arg("192,0,2,7,195,90"),
            Some("192.0.2.7:50010".parse().expect("addr"))
        );
        assert_eq!(parse_port_arg("192,0,2,7,0,0"), None);
        assert_eq!(parse_port_arg("300,0,2,7,1,1"), None);
        assert_eq!(parse_port_arg("1,2,3,4,5"), None);
    }

    #[test]
    fn test_parse_eprt_arg() {
        assert_eq!(
            parse_eprt_arg("|1|192.0.2.7|50010|"),
            Some("192.0.2.7:50010".parse().expect("addr"))
        );
        assert_eq!(
            parse_eprt_arg("|2|2001:db8::1|50010|"),
            Some("[2001:db8::1]:50010".parse().expect("addr"))
        );
        // Family/proto mismatch.
        assert_eq!(parse_eprt_arg("|1|2001:db8::1|50010|"), None);
        assert_eq!(parse_eprt_arg("|2|192.0.2.7|50010|"), None);
        assert_eq!(parse_eprt_arg("|1|192.0.2.7|0|"), None);
    }

    #[tokio::test]
    async fn test_bind_passive_in_range() {
        let (listener, addr) = bind_passive("127.0.0.1".parse().expect("ip"), Some((40000, 40100)))
            .await
            .expect("bind");
        assert!((40000..=40100).contains(&addr.port()));
        drop(listener);
    }

    #[tokio::test]
    async fn test_passive_establish_rejects_foreign_peer() {
        let (listener, addr) = bind_passive("127.0.0.1".parse().expect("ip"), None)
            .await
            .expect("bind");
        let pending = PendingData::Passive {
            listener,
            advertised: addr,
        };

        // Local connection with a matching control peer succeeds.
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await });
        let stream = pending
            .establish("127.0.0.1".parse().expect("ip"))
            .await
            .expect("establish");
        drop(stream);
        connect.await.expect("join").expect("connect");
    }
}
