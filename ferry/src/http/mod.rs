//! HTTP/HTTPS front-end.
//!
//! One accepted connection serves two sub-modes: CONNECT tunneling (blind
//! copy, or TLS interception when the host is on the MITM list) and
//! absolute-form forward proxying. Client-side keep-alive is supported and
//! every logical request is classified independently, so one connection may
//! talk to several upstreams over its lifetime.

pub mod modify;

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode, Uri, header};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::network::async_stream::AsyncStream;
use crate::network::copy::{self, TrafficCounters};
use crate::proxy::ProxyContext;
use crate::records::{Record, RecordStatus};
use crate::request::{Protocol, Request};
use crate::tls;
use crate::utils::address::NetLocation;

use modify::{RequestOutcome, apply_request_policies, apply_response_policies, canonical_url};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Body = BoxBody<Bytes, BoxError>;

pub fn full_body<B: Into<Bytes>>(data: B) -> Body {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> Body {
    Empty::new().map_err(|never| match never {}).boxed()
}

fn incoming_body(body: Incoming) -> Body {
    body.map_err(|e| Box::new(e) as BoxError).boxed()
}

/// Entry point for an accepted HTTP listener connection.
pub async fn handle_connection(stream: TcpStream, ctx: Arc<ProxyContext>) -> Result<()> {
    serve_stream(stream, ctx, false, None).await
}

/// Serve HTTP/1.1 on any transport: the plain listener socket, or the
/// plaintext side of a terminated MITM session.
async fn serve_stream<S>(
    stream: S,
    ctx: Arc<ProxyContext>,
    https: bool,
    fallback: Option<NetLocation>,
) -> Result<()>
where
    S: AsyncStream + 'static,
{
    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        let fallback = fallback.clone();
        async move { Ok::<_, Infallible>(handle_request(req, ctx, https, fallback).await) }
    });

    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
        .map_err(|e| Error::ProtocolViolation(format!("http session failed: {e}")))?;
    Ok(())
}

async fn handle_request(
    req: http::Request<Incoming>,
    ctx: Arc<ProxyContext>,
    https: bool,
    fallback: Option<NetLocation>,
) -> http::Response<Body> {
    if req.method() == Method::CONNECT {
        if https {
            // CONNECT inside an intercepted session is nonsense.
            return status_response(StatusCode::BAD_REQUEST);
        }
        handle_connect(req, ctx).await
    } else {
        proxy_request(req, ctx, https, fallback).await
    }
}

async fn handle_connect(
    mut req: http::Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> http::Response<Body> {
    let Some(authority) = req.uri().authority().cloned() else {
        return status_response(StatusCode::BAD_REQUEST);
    };
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);
    let location = NetLocation::from_host_port(&host, port);

    let snapshot = ctx.snapshot.load();

    // MITM branch: finish TLS with a synthesized leaf and re-enter as
    // plaintext HTTP against the same service.
    if ctx.mitm_enabled() && snapshot.mitm_hosts.matches(&host) {
        let upgrade = hyper::upgrade::on(&mut req);
        let ctx_tunnel = ctx.clone();
        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => {
                    if let Err(e) = mitm_tunnel(upgraded, location, ctx_tunnel).await {
                        debug!(error = %e, "mitm session ended with error");
                    }
                }
                Err(e) => debug!(error = %e, "connect upgrade failed"),
            }
        });
        return status_response(StatusCode::OK);
    }

    // Blind tunnel: classify, dial, then splice the upgraded connection.
    let mut request = Request::new(Protocol::Https, location.clone(), location.to_string());
    let established = ctx.establish(&snapshot, &mut request).await;
    let (upstream, server, rule) = match established {
        Ok(parts) => parts,
        Err(e) => {
            record_early_failure(&ctx, &request.target, &e);
            return error_response(&e);
        }
    };

    let record_id = ctx
        .records
        .append(Record::new(&server.name, &rule, &request.target, false));

    let upgrade = hyper::upgrade::on(&mut req);
    let ctx_tunnel = ctx.clone();
    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!(error = %e, "connect upgrade failed");
                ctx_tunnel
                    .records
                    .finalize(record_id, RecordStatus::Failed, 0, 0);
                return;
            }
        };

        let mut client: Box<dyn AsyncStream> = Box::new(TokioIo::new(upgraded));
        let mut upstream = upstream;
        let counters = Arc::new(TrafficCounters::default());
        let outcome = copy::copy_bidirectional(
            &mut client,
            &mut upstream,
            counters.clone(),
            ctx_tunnel.idle_timeout,
        )
        .await;

        let (up, down) = counters.snapshot();
        let status = match outcome {
            Ok(_) => RecordStatus::Completed,
            Err(_) => RecordStatus::Failed,
        };
        ctx_tunnel.records.finalize(record_id, status, up, down);
    });

    status_response(StatusCode::OK)
}

// Returns a boxed future (rather than being an `async fn`) to break the
// recursive opaque-type cycle: this session re-enters the same service
// that spawned it via `serve_stream`.
fn mitm_tunnel(
    upgraded: hyper::upgrade::Upgraded,
    location: NetLocation,
    ctx: Arc<ProxyContext>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let issuer = ctx
            .issuer
            .as_ref()
            .ok_or_else(|| Error::ConfigInvalid("mitm without a CA".to_string()))?;
        let config = issuer.server_config(&location.address.to_string())?;

        let acceptor = TlsAcceptor::from(config);
        let tls_stream = acceptor
            .accept(TokioIo::new(upgraded))
            .await
            .map_err(|e| Error::ProtocolViolation(format!("mitm tls accept failed: {e}")))?;

        let stream: Box<dyn AsyncStream> = Box::new(tls_stream);
        serve_stream(stream, ctx, true, Some(location)).await
    })
}

async fn proxy_request(
    req: http::Request<Incoming>,
    ctx: Arc<ProxyContext>,
    https: bool,
    fallback: Option<NetLocation>,
) -> http::Response<Body> {
    let snapshot = ctx.snapshot.load();
    let dump = ctx.dump.is_some();

    // Buffer the request body when dumping; otherwise it streams through.
    let (parts, body) = req.into_parts();
    let (mut req, body_bytes): (http::Request<Body>, Option<Bytes>) = if dump {
        match body.collect().await {
            Ok(collected) => {
                let bytes = collected.to_bytes();
                (
                    http::Request::from_parts(parts, full_body(bytes.clone())),
                    Some(bytes),
                )
            }
            Err(e) => {
                debug!(error = %e, "request body read failed");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        }
    } else {
        (http::Request::from_parts(parts, incoming_body(body)), None)
    };

    // Request-direction policies: mock short-circuits, update mutates.
    match apply_request_policies(&snapshot.request_policies, &mut req, https, &ctx.resp_files_dir)
        .await
    {
        RequestOutcome::Mocked(response) => {
            let url = canonical_url(&req, https);
            let id = ctx.records.append(Record::new("MOCK", "", &url, dump));
            ctx.records.finalize(
                id,
                RecordStatus::Completed,
                body_bytes.as_ref().map(|b| b.len() as u64).unwrap_or(0),
                0,
            );
            if let Some(writer) = &ctx.dump {
                let request_dump =
                    serialize_request(&req, body_bytes.as_deref().unwrap_or_default());
                let (parts, body) = response.into_parts();
                let collected = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(_) => Bytes::new(),
                };
                let response_dump = serialize_response(&parts, &collected);
                writer.write(id, &request_dump, &response_dump).await;
                return http::Response::from_parts(parts, full_body(collected));
            }
            return response;
        }
        RequestOutcome::Updated | RequestOutcome::Untouched => {}
    }

    let url = canonical_url(&req, https);
    let Some(location) = target_location(&req, https, fallback) else {
        return status_response(StatusCode::BAD_REQUEST);
    };

    let protocol = if https { Protocol::Https } else { Protocol::Http };
    let mut request = Request::new(protocol, location.clone(), url.clone());

    let (server, rule) = match ctx.route(&snapshot, &mut request).await {
        Ok(routed) => routed,
        Err(e) => {
            record_early_failure(&ctx, &url, &e);
            return error_response(&e);
        }
    };

    let record_id = ctx
        .records
        .append(Record::new(&server.name, &rule, &url, dump));

    let response = forward_request(
        req,
        &location,
        &server,
        https,
        &ctx,
        &snapshot.response_policies,
        &url,
    )
    .await;

    match response {
        Ok((response, up, down)) => {
            let up = body_bytes.as_ref().map(|b| b.len() as u64).unwrap_or(up);
            let (response, down) = if let Some(writer) = &ctx.dump {
                let request_dump =
                    serialize_request(&response_request_echo(&url), body_bytes.as_deref().unwrap_or_default());
                let (parts, body) = response.into_parts();
                let collected = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(_) => Bytes::new(),
                };
                let response_dump = serialize_response(&parts, &collected);
                writer.write(record_id, &request_dump, &response_dump).await;
                let len = collected.len() as u64;
                (http::Response::from_parts(parts, full_body(collected)), len)
            } else {
                (response, down)
            };
            ctx.records
                .finalize(record_id, RecordStatus::Completed, up, down);
            response
        }
        Err(e) => {
            ctx.records.finalize(record_id, RecordStatus::Failed, 0, 0);
            debug!(url = %url, error = %e, "forward failed");
            error_response(&e)
        }
    }
}

/// Dial the chosen upstream and run one logical request over it.
async fn forward_request(
    mut req: http::Request<Body>,
    location: &NetLocation,
    server: &crate::servers::Server,
    https: bool,
    ctx: &Arc<ProxyContext>,
    response_policies: &[modify::ModifyPolicy],
    url: &str,
) -> Result<(http::Response<Body>, u64, u64)> {
    let upstream = crate::servers::dial(server, location, &ctx.resolver).await?;

    strip_hop_by_hop(req.headers_mut());
    to_origin_form(&mut req, location)?;

    let response = if https {
        let tls_stream = tls::connect_origin(&location.address.to_string(), upstream).await?;
        send_over(req, tls_stream).await?
    } else {
        send_over(req, upstream).await?
    };

    let down = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let mut response = response.map(incoming_body);
    strip_hop_by_hop(response.headers_mut());
    apply_response_policies(response_policies, url, &mut response);

    Ok((response, 0, down))
}

async fn send_over<S>(req: http::Request<Body>, stream: S) -> Result<http::Response<Incoming>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Error::UpstreamUnreachable(format!("upstream handshake failed: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "upstream connection closed with error");
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| Error::UpstreamUnreachable(format!("upstream request failed: {e}")))
}

/// Destination host and port for a logical request.
fn target_location<B>(
    req: &http::Request<B>,
    https: bool,
    fallback: Option<NetLocation>,
) -> Option<NetLocation> {
    let default_port = if https { 443 } else { 80 };
    if let Some(authority) = req.uri().authority() {
        return Some(NetLocation::from_host_port(
            authority.host(),
            authority.port_u16().unwrap_or(default_port),
        ));
    }
    if let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
    {
        if let Ok(location) = NetLocation::parse(host) {
            return Some(location);
        }
        if !host.is_empty() {
            return Some(NetLocation::from_host_port(host, default_port));
        }
    }
    fallback
}

/// Rewrite the request line to origin-form for the upstream hop and make
/// sure a Host header survives.
fn to_origin_form(req: &mut http::Request<Body>, location: &NetLocation) -> Result<()> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    *req.uri_mut() = path_and_query
        .parse::<Uri>()
        .map_err(|e| Error::ProtocolViolation(format!("bad request path: {e}")))?;

    if !req.headers().contains_key(header::HOST) {
        let host = match location.port {
            80 | 443 => location.address.to_string(),
            port => format!("{}:{port}", location.address),
        };
        if let Ok(value) = http::HeaderValue::from_str(&host) {
            req.headers_mut().insert(header::HOST, value);
        }
    }
    Ok(())
}

/// Hop-by-hop headers never travel to the next hop.
fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
    // Tokens listed in Connection are themselves hop-by-hop.
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .collect();
    for name in named {
        if !name.is_empty() {
            headers.remove(name.as_str());
        }
    }

    for name in [
        "connection",
        "proxy-connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
}

fn record_early_failure(ctx: &Arc<ProxyContext>, target: &str, error: &Error) {
    let (status, proxy) = if error.is_rejection() {
        (RecordStatus::Rejected, "REJECT")
    } else {
        (RecordStatus::Failed, "")
    };
    let id = ctx.records.append(Record::new(proxy, "", target, false));
    ctx.records.finalize(id, status, 0, 0);
}

fn error_response(error: &Error) -> http::Response<Body> {
    let status = match error {
        Error::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    if !error.is_rejection() {
        warn!(error = %error, "request failed");
    }
    status_response(status)
}

fn status_response(status: StatusCode) -> http::Response<Body> {
    http::Response::builder()
        .status(status)
        .body(empty_body())
        .expect("static response construction cannot fail")
}

fn serialize_request<B>(req: &http::Request<B>, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(
        format!(
            "{} {} HTTP/1.1\r\n",
            req.method(),
            req.uri()
        )
        .as_bytes(),
    );
    for (name, value) in req.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

// The forward path consumed the original request; echo enough of it for the
// dump file to be useful.
fn response_request_echo(url: &str) -> http::Request<()> {
    http::Request::builder()
        .method(Method::GET)
        .uri(url)
        .body(())
        .unwrap_or_default()
}

fn serialize_response(parts: &http::response::Parts, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            parts.status.as_u16(),
            parts.status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in &parts.headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn mock_policy_answers_without_an_upstream() {
        let body_name = format!("ferry-http-ping-{}.txt", std::process::id());
        tokio::fs::write(std::env::temp_dir().join(&body_name), b"pong")
            .await
            .unwrap();

        let yaml = format!(
            r#"
rules:
  - FINAL,DIRECT
http_map:
  req:
    - action: MOCK
      url_rex: '^https?://api\.test/v1/ping$'
      values:
        - type: STATUS
          value: "418"
        - type: HEADER
          key: X-Mock
          value: "1"
        - type: BODY
          value: {body_name}
"#
        );
        let ctx = crate::test_support::test_context(&yaml, HashMap::new());

        let (mut client, server_side) = tokio::io::duplex(16 * 1024);
        let session = tokio::spawn(serve_stream(server_side, ctx, false, None));

        client
            .write_all(
                b"GET http://api.test/v1/ping HTTP/1.1\r\nHost: api.test\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 418 "), "got: {text}");
        assert!(text.contains("x-mock: 1"));
        assert!(text.contains("content-length: 4"));
        assert!(text.ends_with("\r\n\r\npong"));

        let _ = session.await;
        let _ = tokio::fs::remove_file(std::env::temp_dir().join(&body_name)).await;
    }

    #[tokio::test]
    async fn absolute_form_request_is_forwarded_in_origin_form() {
        let origin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let (mut conn, _) = origin.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = conn.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            conn.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
                .await
                .unwrap();
            String::from_utf8(seen).unwrap()
        });

        let mut hosts = HashMap::new();
        hosts.insert("origin.test".to_string(), origin_addr.ip());
        let ctx = crate::test_support::test_context("rules:\n  - FINAL,DIRECT\n", hosts);
        let records = ctx.records.clone();

        let (mut client, server_side) = tokio::io::duplex(16 * 1024);
        let session = tokio::spawn(serve_stream(server_side, ctx, false, None));

        let request = format!(
            "GET http://origin.test:{}/hello HTTP/1.1\r\nHost: origin.test:{}\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n",
            origin_addr.port(),
            origin_addr.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
        assert!(text.ends_with("hello"));

        // The upstream hop got an origin-form request line, no proxy headers.
        let origin_saw = origin_task.await.unwrap();
        assert!(origin_saw.starts_with("GET /hello HTTP/1.1\r\n"), "origin saw: {origin_saw}");
        assert!(!origin_saw.to_ascii_lowercase().contains("proxy-connection"));

        let _ = session.await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let records = records.list();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Completed);
        assert_eq!(records[0].proxy, "DIRECT");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = http::HeaderMap::new();
        headers.insert("connection", "keep-alive, x-custom-hop".parse().unwrap());
        headers.insert("x-custom-hop", "1".parse().unwrap());
        headers.insert("proxy-connection", "keep-alive".parse().unwrap());
        headers.insert("proxy-authorization", "Basic xxx".parse().unwrap());
        headers.insert("te", "trailers".parse().unwrap());
        headers.insert("x-app", "stays".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-custom-hop").is_none());
        assert!(headers.get("proxy-connection").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert!(headers.get("te").is_none());
        assert_eq!(headers.get("x-app").unwrap(), "stays");
    }

    #[test]
    fn target_location_prefers_the_absolute_uri() {
        let req = http::Request::builder()
            .uri("http://a.test:8080/x")
            .header("host", "b.test")
            .body(())
            .unwrap();
        assert_eq!(
            target_location(&req, false, None),
            Some(NetLocation::from_host_port("a.test", 8080))
        );
    }

    #[test]
    fn target_location_falls_back_to_host_header() {
        let req = http::Request::builder()
            .uri("/x")
            .header("host", "b.test")
            .body(())
            .unwrap();
        assert_eq!(
            target_location(&req, true, None),
            Some(NetLocation::from_host_port("b.test", 443))
        );
    }

    #[test]
    fn origin_form_rewrite_keeps_path_and_sets_host() {
        let mut req = http::Request::builder()
            .uri("http://site.test/a/b?c=d")
            .body(empty_body())
            .unwrap();
        to_origin_form(&mut req, &NetLocation::from_host_port("site.test", 80)).unwrap();
        assert_eq!(req.uri().to_string(), "/a/b?c=d");
        assert_eq!(req.headers().get("host").unwrap(), "site.test");
    }

    #[test]
    fn non_default_ports_stay_in_the_host_header() {
        let mut req = http::Request::builder()
            .uri("http://site.test:8081/")
            .body(empty_body())
            .unwrap();
        to_origin_form(&mut req, &NetLocation::from_host_port("site.test", 8081)).unwrap();
        assert_eq!(req.headers().get("host").unwrap(), "site.test:8081");
    }

    #[test]
    fn request_serialization_is_wire_shaped() {
        let req = http::Request::builder()
            .method("POST")
            .uri("/v1/ping")
            .header("host", "api.test")
            .body(())
            .unwrap();
        let bytes = serialize_request(&req, b"data");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("POST /v1/ping HTTP/1.1\r\n"));
        assert!(text.contains("host: api.test\r\n"));
        assert!(text.ends_with("\r\n\r\ndata"));
    }

    #[test]
    fn timeouts_map_to_504_everything_else_502() {
        assert_eq!(
            error_response(&Error::UpstreamTimeout).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            error_response(&Error::Rejected).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_response(&Error::NoRule("x".into())).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
