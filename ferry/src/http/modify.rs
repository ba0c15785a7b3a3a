//! Regex-driven request rewriting and canned responses.
//!
//! Request direction: the first policy whose URL regex matches either
//! synthesizes a full response (MOCK) or mutates the request in place
//! (UPDATE). Response direction: every matching policy applies its header
//! and status fields to the live response. Policy failures never fail the
//! surrounding request; the original traffic proceeds unmodified.

use std::path::Path;

use http::{HeaderName, HeaderValue, StatusCode, Uri};
use regex::Regex;
use tracing::{debug, warn};

use crate::config::{ModifyAction, ModifyEntry, ModifyFieldKind, ModifyValueEntry};
use crate::error::{Error, Result};

use super::{Body, full_body};

#[derive(Debug, Clone)]
pub struct ModifyPolicy {
    pub action: ModifyAction,
    pub regex: Regex,
    pub values: Vec<ModifyValueEntry>,
}

impl ModifyPolicy {
    pub fn compile(entry: &ModifyEntry) -> Result<ModifyPolicy> {
        let regex = Regex::new(&entry.url_rex).map_err(|e| {
            Error::ConfigInvalid(format!("bad modify regex {}: {e}", entry.url_rex))
        })?;
        Ok(ModifyPolicy {
            action: entry.action,
            regex,
            values: entry.values.clone(),
        })
    }
}

/// Scheme + host + path + query, regardless of request form.
pub fn canonical_url<B>(req: &http::Request<B>, https: bool) -> String {
    if req.uri().authority().is_some() {
        return req.uri().to_string();
    }
    let scheme = if https { "https" } else { "http" };
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{scheme}://{host}{path_and_query}")
}

/// What the request-direction pass decided.
pub enum RequestOutcome {
    Untouched,
    Updated,
    Mocked(http::Response<Body>),
}

pub async fn apply_request_policies<B>(
    policies: &[ModifyPolicy],
    req: &mut http::Request<B>,
    https: bool,
    body_dir: &Path,
) -> RequestOutcome {
    if policies.is_empty() {
        return RequestOutcome::Untouched;
    }
    let url = canonical_url(req, https);
    for policy in policies {
        if !policy.regex.is_match(&url) {
            continue;
        }
        match policy.action {
            ModifyAction::Mock => match build_mock(policy, body_dir).await {
                Ok(response) => return RequestOutcome::Mocked(response),
                Err(e) => {
                    warn!(url = %url, error = %e, "mock synthesis failed; request proceeds");
                    return RequestOutcome::Untouched;
                }
            },
            ModifyAction::Update => {
                apply_update(policy, req, &url);
                return RequestOutcome::Updated;
            }
        }
    }
    RequestOutcome::Untouched
}

async fn build_mock(policy: &ModifyPolicy, body_dir: &Path) -> std::io::Result<http::Response<Body>> {
    let mut response = http::Response::builder().status(StatusCode::OK);
    let mut body: Option<Vec<u8>> = None;

    for value in &policy.values {
        match value.kind {
            ModifyFieldKind::Header => {
                debug!(key = %value.key, value = %value.value, "mock sets header");
                if let (Ok(name), Ok(val)) = (
                    value.key.parse::<HeaderName>(),
                    value.value.parse::<HeaderValue>(),
                ) {
                    response = response.header(name, val);
                }
            }
            ModifyFieldKind::Status => {
                // An unparseable status falls back to 200.
                let status = value
                    .value
                    .parse::<u16>()
                    .ok()
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(StatusCode::OK);
                debug!(status = %status, "mock sets status");
                response = response.status(status);
            }
            ModifyFieldKind::Body => {
                let path = body_dir.join(&value.value);
                let contents = tokio::fs::read(&path).await?;
                debug!(file = %path.display(), len = contents.len(), "mock sets body");
                body = Some(contents);
            }
            ModifyFieldKind::Url => {
                debug!("URL field ignored for MOCK policies");
            }
        }
    }

    let body_bytes = body.unwrap_or_default();
    let response = response
        .header(http::header::CONTENT_LENGTH, body_bytes.len())
        .body(full_body(body_bytes))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(response)
}

fn apply_update<B>(policy: &ModifyPolicy, req: &mut http::Request<B>, url: &str) {
    for value in &policy.values {
        match value.kind {
            ModifyFieldKind::Url => {
                let rewritten = policy.regex.replace_all(url, value.value.as_str());
                let new_uri: Uri = match rewritten.parse() {
                    Ok(uri) => uri,
                    Err(e) => {
                        warn!(target_url = %rewritten, error = %e, "rewritten url does not parse");
                        continue;
                    }
                };
                let old_scheme = scheme_of(req.uri(), url);
                let new_scheme = new_uri.scheme_str().unwrap_or(&old_scheme).to_string();
                if old_scheme != new_scheme {
                    warn!(from = %old_scheme, to = %new_scheme, "url rewrite may not change scheme");
                    continue;
                }
                debug!(from = %url, to = %rewritten, "request url rewritten");
                if let Some(authority) = new_uri.authority() {
                    let host = authority.as_str().to_string();
                    if let Ok(host_value) = HeaderValue::from_str(&host) {
                        req.headers_mut().insert(http::header::HOST, host_value);
                    }
                }
                *req.uri_mut() = new_uri;
            }
            ModifyFieldKind::Header => {
                debug!(key = %value.key, value = %value.value, "request header set");
                if let (Ok(name), Ok(val)) = (
                    value.key.parse::<HeaderName>(),
                    value.value.parse::<HeaderValue>(),
                ) {
                    req.headers_mut().insert(name, val);
                }
            }
            ModifyFieldKind::Status | ModifyFieldKind::Body => {
                debug!("status/body fields ignored for request UPDATE policies");
            }
        }
    }
}

fn scheme_of(uri: &Uri, canonical: &str) -> String {
    uri.scheme_str()
        .map(str::to_string)
        .unwrap_or_else(|| {
            if canonical.starts_with("https://") {
                "https".to_string()
            } else {
                "http".to_string()
            }
        })
}

/// Response-direction pass: headers and status on the live response.
pub fn apply_response_policies<B>(
    policies: &[ModifyPolicy],
    url: &str,
    response: &mut http::Response<B>,
) {
    for policy in policies {
        if !policy.regex.is_match(url) {
            continue;
        }
        for value in &policy.values {
            match value.kind {
                ModifyFieldKind::Header => {
                    debug!(key = %value.key, value = %value.value, "response header set");
                    if let (Ok(name), Ok(val)) = (
                        value.key.parse::<HeaderName>(),
                        value.value.parse::<HeaderValue>(),
                    ) {
                        response.headers_mut().insert(name, val);
                    }
                }
                ModifyFieldKind::Status => {
                    if let Some(status) = value
                        .value
                        .parse::<u16>()
                        .ok()
                        .and_then(|code| StatusCode::from_u16(code).ok())
                    {
                        debug!(status = %status, "response status set");
                        *response.status_mut() = status;
                    }
                }
                ModifyFieldKind::Url | ModifyFieldKind::Body => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn policy(action: ModifyAction, url_rex: &str, values: Vec<ModifyValueEntry>) -> ModifyPolicy {
        ModifyPolicy::compile(&ModifyEntry {
            action,
            url_rex: url_rex.to_string(),
            values,
        })
        .unwrap()
    }

    fn value(kind: ModifyFieldKind, key: &str, value: &str) -> ModifyValueEntry {
        ModifyValueEntry {
            kind,
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn mock_policy_synthesizes_the_configured_response() {
        let dir = std::env::temp_dir().join(format!("ferry-mock-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("ping.txt"), b"pong").await.unwrap();

        let policies = vec![policy(
            ModifyAction::Mock,
            r"^https?://api\.test/v1/ping$",
            vec![
                value(ModifyFieldKind::Status, "", "418"),
                value(ModifyFieldKind::Header, "X-Mock", "1"),
                value(ModifyFieldKind::Body, "", "ping.txt"),
            ],
        )];

        let mut req = http::Request::builder()
            .method("GET")
            .uri("http://api.test/v1/ping")
            .body(())
            .unwrap();

        let outcome = apply_request_policies(&policies, &mut req, false, &dir).await;
        let RequestOutcome::Mocked(response) = outcome else {
            panic!("expected mock");
        };
        assert_eq!(response.status(), 418);
        assert_eq!(response.headers().get("X-Mock").unwrap(), "1");
        assert_eq!(response.headers().get("content-length").unwrap(), "4");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"pong");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn bad_status_defaults_to_200() {
        let policies = vec![policy(
            ModifyAction::Mock,
            ".*",
            vec![value(ModifyFieldKind::Status, "", "teapot")],
        )];
        let mut req = http::Request::builder()
            .uri("http://x.test/")
            .body(())
            .unwrap();
        let outcome =
            apply_request_policies(&policies, &mut req, false, Path::new("/nonexistent")).await;
        let RequestOutcome::Mocked(response) = outcome else {
            panic!("expected mock");
        };
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn missing_body_file_leaves_request_untouched() {
        let policies = vec![policy(
            ModifyAction::Mock,
            ".*",
            vec![value(ModifyFieldKind::Body, "", "nope.bin")],
        )];
        let mut req = http::Request::builder()
            .uri("http://x.test/")
            .body(())
            .unwrap();
        let outcome =
            apply_request_policies(&policies, &mut req, false, Path::new("/nonexistent")).await;
        assert!(matches!(outcome, RequestOutcome::Untouched));
    }

    #[tokio::test]
    async fn update_rewrites_url_and_host() {
        let policies = vec![policy(
            ModifyAction::Update,
            r"^http://old\.test",
            vec![value(ModifyFieldKind::Url, "", "http://new.test")],
        )];
        let mut req = http::Request::builder()
            .uri("http://old.test/path?q=1")
            .body(())
            .unwrap();
        let outcome =
            apply_request_policies(&policies, &mut req, false, Path::new("/nonexistent")).await;
        assert!(matches!(outcome, RequestOutcome::Updated));
        assert_eq!(req.uri().to_string(), "http://new.test/path?q=1");
        assert_eq!(req.headers().get("host").unwrap(), "new.test");
    }

    #[tokio::test]
    async fn scheme_change_is_refused() {
        let policies = vec![policy(
            ModifyAction::Update,
            r"^http://",
            vec![value(ModifyFieldKind::Url, "", "https://")],
        )];
        let mut req = http::Request::builder()
            .uri("http://site.test/keep")
            .body(())
            .unwrap();
        apply_request_policies(&policies, &mut req, false, Path::new("/nonexistent")).await;
        assert_eq!(req.uri().to_string(), "http://site.test/keep");
    }

    #[tokio::test]
    async fn first_matching_request_policy_wins() {
        let policies = vec![
            policy(
                ModifyAction::Update,
                ".*",
                vec![value(ModifyFieldKind::Header, "X-First", "1")],
            ),
            policy(
                ModifyAction::Update,
                ".*",
                vec![value(ModifyFieldKind::Header, "X-Second", "2")],
            ),
        ];
        let mut req = http::Request::builder()
            .uri("http://x.test/")
            .body(())
            .unwrap();
        apply_request_policies(&policies, &mut req, false, Path::new("/nonexistent")).await;
        assert!(req.headers().contains_key("X-First"));
        assert!(!req.headers().contains_key("X-Second"));
    }

    #[test]
    fn every_matching_response_policy_applies() {
        let policies = vec![
            policy(
                ModifyAction::Update,
                ".*",
                vec![value(ModifyFieldKind::Header, "X-A", "a")],
            ),
            policy(
                ModifyAction::Update,
                ".*",
                vec![
                    value(ModifyFieldKind::Header, "X-B", "b"),
                    value(ModifyFieldKind::Status, "", "503"),
                ],
            ),
        ];
        let mut response = http::Response::builder().status(200).body(()).unwrap();
        apply_response_policies(&policies, "http://x.test/", &mut response);
        assert!(response.headers().contains_key("X-A"));
        assert!(response.headers().contains_key("X-B"));
        assert_eq!(response.status(), 503);
    }

    #[test]
    fn canonical_url_for_origin_form_requests() {
        let req = http::Request::builder()
            .uri("/v1/ping")
            .header("host", "api.test")
            .body(())
            .unwrap();
        assert_eq!(canonical_url(&req, false), "http://api.test/v1/ping");
        assert_eq!(canonical_url(&req, true), "https://api.test/v1/ping");
    }
}
