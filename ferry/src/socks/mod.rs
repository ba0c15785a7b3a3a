//! SOCKS5 front-end: RFC 1928 CONNECT with no-auth negotiation.

pub mod addr;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::network::async_stream::{AsyncStream, PrefixedStream};
use crate::network::copy::{self, TrafficCounters};
use crate::network::stream_reader::StreamReader;
use crate::proxy::ProxyContext;
use crate::records::{Record, RecordStatus};
use crate::request::{Protocol, Request};
use crate::utils::address::NetLocation;

use addr::{SOCKS5_VERSION, auth, command, reply};

/// Negotiated handshake state: method selected, request parsed, or the
/// tunnel established. Drives `handle` through its phases.
enum Phase {
    MethodSelect,
    AwaitRequest,
    Connected(NetLocation),
}

pub async fn handle<S>(mut stream: S, ctx: Arc<ProxyContext>) -> Result<()>
where
    S: AsyncStream + 'static,
{
    let mut reader = StreamReader::new();
    let mut phase = Phase::MethodSelect;

    loop {
        match phase {
            Phase::MethodSelect => {
                negotiate_method(&mut stream, &mut reader).await?;
                phase = Phase::AwaitRequest;
            }
            Phase::AwaitRequest => {
                let location = read_connect_request(&mut stream, &mut reader).await?;
                phase = Phase::Connected(location);
            }
            Phase::Connected(location) => {
                return run_tunnel(stream, reader, location, ctx).await;
            }
        }
    }
}

async fn negotiate_method<S>(stream: &mut S, reader: &mut StreamReader) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = reader.read_u8(stream).await?;
    if version != SOCKS5_VERSION {
        return Err(Error::ProtocolViolation(format!(
            "unexpected socks version {version:#02x}"
        )));
    }
    let method_count = reader.read_u8(stream).await? as usize;
    let methods = reader.read_slice(stream, method_count).await?.to_vec();

    if !methods.contains(&auth::METHOD_NONE) {
        stream
            .write_all(&[SOCKS5_VERSION, auth::METHOD_NOT_ACCEPTABLE])
            .await?;
        stream.flush().await?;
        return Err(Error::ProtocolViolation(
            "client offered no acceptable auth method".to_string(),
        ));
    }

    stream.write_all(&[SOCKS5_VERSION, auth::METHOD_NONE]).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_connect_request<S>(stream: &mut S, reader: &mut StreamReader) -> Result<NetLocation>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = reader.read_u8(stream).await?;
    let cmd = reader.read_u8(stream).await?;
    let _reserved = reader.read_u8(stream).await?;

    if version != SOCKS5_VERSION {
        return Err(Error::ProtocolViolation(format!(
            "unexpected socks version {version:#02x}"
        )));
    }
    if cmd != command::CONNECT {
        write_reply(stream, reply::COMMAND_NOT_SUPPORTED).await?;
        return Err(Error::ProtocolViolation(format!(
            "unsupported socks command {cmd:#02x}"
        )));
    }

    match addr::read_location(stream, reader).await {
        Ok(location) => Ok(location),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            write_reply(stream, reply::ADDRESS_TYPE_NOT_SUPPORTED).await?;
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_tunnel<S>(
    mut stream: S,
    reader: StreamReader,
    location: NetLocation,
    ctx: Arc<ProxyContext>,
) -> Result<()>
where
    S: AsyncStream + 'static,
{
    let snapshot = ctx.snapshot.load();
    let mut request = Request::new(Protocol::Socks5, location.clone(), location.to_string());

    let established = ctx.establish(&snapshot, &mut request).await;
    let (mut upstream, server, rule) = match established {
        Ok(parts) => parts,
        Err(e) => {
            let code = reply_code_for(&e);
            write_reply(&mut stream, code).await?;
            let status = if e.is_rejection() {
                RecordStatus::Rejected
            } else {
                RecordStatus::Failed
            };
            let proxy_name = if e.is_rejection() { "REJECT" } else { "" };
            let id = ctx
                .records
                .append(Record::new(proxy_name, "", &request.target, false));
            ctx.records.finalize(id, status, 0, 0);
            debug!(target = %request.target, error = %e, "socks establish failed");
            return Err(e);
        }
    };

    write_reply(&mut stream, reply::SUCCEEDED).await?;

    let record_id = ctx
        .records
        .append(Record::new(&server.name, &rule, &request.target, false));

    // Bytes the client pipelined behind its CONNECT request.
    let mut client: Box<dyn crate::network::async_stream::AsyncStream> =
        match reader.unparsed_data_owned() {
            Some(surplus) => Box::new(PrefixedStream::new(surplus, Box::new(stream))),
            None => Box::new(stream),
        };

    let counters = Arc::new(TrafficCounters::default());
    let outcome = copy::copy_bidirectional(
        &mut client,
        &mut upstream,
        counters.clone(),
        ctx.idle_timeout,
    )
    .await;

    let (up, down) = counters.snapshot();
    match outcome {
        Ok(_) => {
            ctx.records
                .finalize(record_id, RecordStatus::Completed, up, down);
            Ok(())
        }
        Err(e) => {
            ctx.records
                .finalize(record_id, RecordStatus::Failed, up, down);
            Err(Error::from_connection(e))
        }
    }
}

fn reply_code_for(error: &Error) -> u8 {
    match error {
        Error::Rejected => reply::CONNECTION_NOT_ALLOWED,
        Error::DnsFailure(_) => reply::HOST_UNREACHABLE,
        Error::UpstreamTimeout => reply::HOST_UNREACHABLE,
        Error::UpstreamUnreachable(message) => {
            if message.contains("refused") {
                reply::CONNECTION_REFUSED
            } else {
                reply::NETWORK_UNREACHABLE
            }
        }
        _ => reply::GENERAL_FAILURE,
    }
}

async fn write_reply<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // Bind address is irrelevant for CONNECT replies; zeroed IPv4 as usual.
    stream
        .write_all(&[SOCKS5_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn no_auth_negotiation_succeeds() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let mut reader = StreamReader::new();
        negotiate_method(&mut server, &mut reader).await.unwrap();

        let mut response = [0u8; 2];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn unsupported_auth_is_refused_with_ff() {
        let (mut client, mut server) = tokio::io::duplex(256);
        // Username/password only.
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        let mut reader = StreamReader::new();
        let err = negotiate_method(&mut server, &mut reader).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));

        let mut response = [0u8; 2];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn connect_request_for_a_domain_parses() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reader = StreamReader::new();
        let location = read_connect_request(&mut server, &mut reader).await.unwrap();
        assert_eq!(location, NetLocation::from_host_port("example.com", 80));
    }

    #[tokio::test]
    async fn bind_command_gets_command_not_supported() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();

        let mut reader = StreamReader::new();
        let err = read_connect_request(&mut server, &mut reader).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));

        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], reply::COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn socks5_direct_end_to_end() {
        use std::collections::HashMap;

        // A local origin standing in for example.com:80.
        let origin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            conn.write_all(b"pong").await.unwrap();
        });

        let mut hosts = HashMap::new();
        hosts.insert("example.com".to_string(), origin_addr.ip());
        let ctx = crate::test_support::test_context("rules:\n  - FINAL,DIRECT\n", hosts);

        let (mut client, server_side) = tokio::io::duplex(4096);
        let handler = tokio::spawn(handle(server_side, ctx));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut negotiated = [0u8; 2];
        client.read_exact(&mut negotiated).await.unwrap();
        assert_eq!(negotiated, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&origin_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, &[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        client.write_all(b"ping").await.unwrap();
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");

        drop(client);
        let _ = handler.await;
    }

    #[tokio::test]
    async fn rejected_target_gets_not_allowed_reply() {
        let ctx = crate::test_support::test_context(
            "rules:\n  - DOMAIN,blocked.test,REJECT\n  - FINAL,DIRECT\n",
            std::collections::HashMap::new(),
        );

        let (mut client, server_side) = tokio::io::duplex(4096);
        let records = ctx.records.clone();
        let handler = tokio::spawn(handle(server_side, ctx));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut negotiated = [0u8; 2];
        client.read_exact(&mut negotiated).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x0C];
        request.extend_from_slice(b"blocked.test");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], reply::CONNECTION_NOT_ALLOWED);

        let _ = handler.await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let records = records.list();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, crate::records::RecordStatus::Rejected);
        assert_eq!(records[0].bytes_up, 0);
        assert_eq!(records[0].bytes_down, 0);
    }

    #[test]
    fn error_to_reply_code_mapping() {
        assert_eq!(reply_code_for(&Error::Rejected), 0x02);
        assert_eq!(
            reply_code_for(&Error::UpstreamUnreachable("10.0.0.1:80: connection refused".into())),
            0x05
        );
        assert_eq!(
            reply_code_for(&Error::UpstreamUnreachable("network is down".into())),
            0x03
        );
        assert_eq!(reply_code_for(&Error::UpstreamTimeout), 0x04);
        assert_eq!(reply_code_for(&Error::NoRule("x".into())), 0x01);
    }
}
