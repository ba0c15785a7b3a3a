//! Turn a chosen server plus a destination into a live upstream connection.

use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::network::async_stream::{AsyncStream, PrefixedStream};
use crate::network::socket::{new_tcp_socket, set_tcp_keepalive};
use crate::network::stream_reader::StreamReader;
use crate::resolver::CachingResolver;
use crate::shadowsocks;
use crate::socks::addr as socks_addr;
use crate::utils::address::NetLocation;

use super::server::{Server, ServerKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial `target` through `server`, producing a connection that carries
/// plaintext for the caller no matter what the wire looks like.
pub async fn dial(
    server: &Server,
    target: &NetLocation,
    resolver: &CachingResolver,
) -> Result<Box<dyn AsyncStream>> {
    match &server.kind {
        ServerKind::Reject => Err(Error::Rejected),
        ServerKind::Direct => {
            let stream = connect_tcp(target, resolver).await?;
            Ok(Box::new(stream))
        }
        ServerKind::HttpProxy { username, password } => {
            let location = proxy_location(server)?;
            let stream = connect_tcp(location, resolver).await?;
            let mut conn: Box<dyn AsyncStream> = Box::new(stream);
            let surplus =
                connect_handshake(&mut conn, &target.to_string(), username.as_deref(), password.as_deref())
                    .await?;
            if surplus.is_empty() {
                Ok(conn)
            } else {
                Ok(Box::new(PrefixedStream::new(surplus, conn)))
            }
        }
        ServerKind::Socks5 => {
            let location = proxy_location(server)?;
            let stream = connect_tcp(location, resolver).await?;
            let mut conn: Box<dyn AsyncStream> = Box::new(stream);
            let surplus = socks5_handshake(&mut conn, target).await?;
            match surplus {
                Some(data) => Ok(Box::new(PrefixedStream::new(data, conn))),
                None => Ok(conn),
            }
        }
        ServerKind::Shadowsocks { method, password } => {
            let location = proxy_location(server)?;
            let stream = connect_tcp(location, resolver).await?;
            let mut conn = shadowsocks::wrap(method, password, Box::new(stream))?;
            // The first encrypted payload is the SOCKS5-format destination.
            conn.write_all(&socks_addr::write_location(target)).await?;
            conn.flush().await?;
            Ok(conn)
        }
    }
}

fn proxy_location(server: &Server) -> Result<&NetLocation> {
    server.location.as_ref().ok_or_else(|| {
        Error::ConfigInvalid(format!("server {} has no address configured", server.name))
    })
}

async fn connect_tcp(
    target: &NetLocation,
    resolver: &CachingResolver,
) -> Result<tokio::net::TcpStream> {
    let addr = match target.to_socket_addr() {
        Some(addr) => addr,
        None => {
            let host = target.address.to_string();
            let ip = resolver
                .resolve_one(&host)
                .await
                .map_err(|_| Error::DnsFailure(host))?;
            SocketAddr::new(ip, target.port)
        }
    };

    let socket = new_tcp_socket(addr.is_ipv6())?;
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, socket.connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(Error::UpstreamUnreachable(format!("{addr}: {e}")));
        }
        Err(_) => return Err(Error::UpstreamTimeout),
    };

    if let Err(e) = set_tcp_keepalive(
        &stream,
        Duration::from_secs(120),
        Duration::from_secs(30),
    ) {
        debug!(error = %e, "failed to set tcp keepalive");
    }
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to set tcp nodelay");
    }

    debug!(endpoint = %addr, "upstream connected");
    Ok(stream)
}

/// HTTP CONNECT handshake against an upstream proxy. Returns any bytes the
/// proxy pipelined after its response headers.
async fn connect_handshake(
    conn: &mut Box<dyn AsyncStream>,
    dest: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<Vec<u8>> {
    let mut request = format!("CONNECT {dest} HTTP/1.1\r\nHost: {dest}\r\n");
    if let Some(user) = username {
        let credentials = BASE64.encode(format!("{user}:{}", password.unwrap_or_default()));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");

    conn.write_all(request.as_bytes()).await?;
    conn.flush().await?;

    let mut buf = [0u8; 8192];
    let mut pos = 0;
    loop {
        let n = conn.read(&mut buf[pos..]).await?;
        if n == 0 {
            return Err(Error::UpstreamUnreachable(
                "proxy closed during CONNECT handshake".to_string(),
            ));
        }
        pos += n;

        let received = &buf[..pos];
        if received.starts_with(b"HTTP/1.1 200") || received.starts_with(b"HTTP/1.0 200") {
            if let Some(end) = find_headers_end(received) {
                return Ok(received[end..].to_vec());
            }
            if pos == buf.len() {
                return Err(Error::ProtocolViolation(
                    "proxy CONNECT response headers too long".to_string(),
                ));
            }
            // keep reading headers
        } else if received.starts_with(b"HTTP/1.1 407") || received.starts_with(b"HTTP/1.0 407") {
            return Err(Error::UpstreamUnreachable(
                "proxy requires authentication".to_string(),
            ));
        } else if received.len() >= 12 {
            return Err(Error::UpstreamUnreachable(format!(
                "proxy refused CONNECT: {}",
                String::from_utf8_lossy(&received[..received.len().min(32)]).trim_end()
            )));
        }
    }
}

fn find_headers_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

/// SOCKS5 client-side handshake (no-auth CONNECT). Returns bytes pipelined
/// after the reply, if any.
async fn socks5_handshake(
    conn: &mut Box<dyn AsyncStream>,
    target: &NetLocation,
) -> Result<Option<Vec<u8>>> {
    conn.write_all(&[socks_addr::SOCKS5_VERSION, 0x01, socks_addr::auth::METHOD_NONE])
        .await?;

    let mut reader = StreamReader::new();
    let version = reader.read_u8(conn).await?;
    let method = reader.read_u8(conn).await?;
    if version != socks_addr::SOCKS5_VERSION || method != socks_addr::auth::METHOD_NONE {
        return Err(Error::ProtocolViolation(format!(
            "socks5 upstream negotiated method {method:#02x}"
        )));
    }

    let mut request = vec![
        socks_addr::SOCKS5_VERSION,
        socks_addr::command::CONNECT,
        0x00,
    ];
    request.extend_from_slice(&socks_addr::write_location(target));
    conn.write_all(&request).await?;
    conn.flush().await?;

    let version = reader.read_u8(conn).await?;
    let reply = reader.read_u8(conn).await?;
    let _reserved = reader.read_u8(conn).await?;
    if version != socks_addr::SOCKS5_VERSION {
        return Err(Error::ProtocolViolation(
            "bad socks5 reply version".to_string(),
        ));
    }
    // Bind address in the reply is unused but must be consumed.
    let _bound = socks_addr::read_location(conn, &mut reader).await?;
    if reply != socks_addr::reply::SUCCEEDED {
        return Err(Error::UpstreamUnreachable(format!(
            "socks5 upstream replied {reply:#02x}"
        )));
    }

    Ok(reader.unparsed_data_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::async_stream::AsyncStream;

    async fn run_connect_handshake(
        response: &'static [u8],
        auth: Option<(&'static str, &'static str)>,
    ) -> (Result<Vec<u8>>, Vec<u8>) {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn: Box<dyn AsyncStream> = Box::new(client);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let mut seen = Vec::new();
            loop {
                let n = server.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                if find_headers_end(&seen).is_some() {
                    break;
                }
            }
            server.write_all(response).await.unwrap();
            seen
        });

        let result = connect_handshake(
            &mut conn,
            "example.com:443",
            auth.map(|(u, _)| u),
            auth.map(|(_, p)| p),
        )
        .await;
        let seen = server_task.await.unwrap();
        (result, seen)
    }

    #[tokio::test]
    async fn connect_handshake_accepts_200() {
        let (result, seen) =
            run_connect_handshake(b"HTTP/1.1 200 Connection Established\r\n\r\n", None).await;
        assert!(result.unwrap().is_empty());
        let request = String::from_utf8(seen).unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(!request.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn connect_handshake_sends_basic_credentials() {
        let (result, seen) = run_connect_handshake(
            b"HTTP/1.1 200 OK\r\n\r\n",
            Some(("user", "secret")),
        )
        .await;
        assert!(result.is_ok());
        let request = String::from_utf8(seen).unwrap();
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n"));
    }

    #[tokio::test]
    async fn connect_handshake_rejects_failure_status() {
        let (result, _) = run_connect_handshake(b"HTTP/1.1 502 Bad Gateway\r\n\r\n", None).await;
        assert!(matches!(result, Err(Error::UpstreamUnreachable(_))));
    }

    #[tokio::test]
    async fn socks5_client_handshake_against_a_scripted_server() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn: Box<dyn AsyncStream> = Box::new(client);

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut header = [0u8; 4];
            server.read_exact(&mut header).await.unwrap();
            assert_eq!(&header[..3], &[0x05, 0x01, 0x00]);
            assert_eq!(header[3], 0x03);
            let mut len = [0u8; 1];
            server.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            server.read_exact(&mut rest).await.unwrap();

            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = NetLocation::from_host_port("example.com", 80);
        let surplus = socks5_handshake(&mut conn, &target).await.unwrap();
        assert!(surplus.is_none());
        server_task.await.unwrap();
    }
}
