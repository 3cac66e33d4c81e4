//! Tests for request resolution and rewriting

use keyrelay::config::{CredentialRecord, StartPolicy};
use keyrelay::http::request::{Method, Request, RequestBuilder};
use keyrelay::proxy::registry::CredentialRegistry;
use keyrelay::proxy::resolver::{CredentialSource, ResolveError, Resolver};
use std::sync::Arc;

fn resolver(authority: &str, creds: &[&str]) -> Resolver {
    let registry = CredentialRegistry::build(
        vec![
            CredentialRecord {
                token: "TOK".to_string(),
                authority: authority.to_string(),
                credentials: creds.iter().map(|c| c.to_string()).collect(),
            },
            CredentialRecord {
                token: "EMPTY".to_string(),
                authority: authority.to_string(),
                credentials: vec![],
            },
        ],
        StartPolicy::Zero,
    );

    Resolver::new(Arc::new(registry))
}

fn get(path: &str) -> RequestBuilder {
    RequestBuilder::new().method(Method::GET).path(path)
}

#[test]
fn test_resolve_absolute_url_with_query_key() {
    let resolver = resolver("https://upstream.example/", &["r1", "r2"]);
    let mut req = get("https://client.example/v1/models?key=TOK").build().unwrap();

    let resolution = resolver.resolve(&mut req).unwrap();

    assert_eq!(resolution.authority, "https://upstream.example");
    assert_eq!(resolution.source, CredentialSource::Query);
    assert_eq!(req.path, "/v1/models?key=r1");
    assert_eq!(req.header("Host"), Some("upstream.example"));
}

#[test]
fn test_resolve_rotates_across_requests() {
    let resolver = resolver("https://upstream.example", &["r1", "r2"]);

    let paths: Vec<String> = (0..3)
        .map(|_| {
            let mut req = get("/v1/models?key=TOK").build().unwrap();
            resolver.resolve(&mut req).unwrap();
            req.path
        })
        .collect();

    assert_eq!(paths, vec!["/v1/models?key=r1", "/v1/models?key=r2", "/v1/models?key=r1"]);
}

#[test]
fn test_resolve_query_wins_over_authorization() {
    let resolver = resolver("https://upstream.example", &["r1"]);
    let mut req = get("/v1/chat?key=TOK")
        .header("Authorization", "Bearer OTHER")
        .build()
        .unwrap();

    let resolution = resolver.resolve(&mut req).unwrap();

    assert_eq!(resolution.source, CredentialSource::Query);
    assert_eq!(req.path, "/v1/chat?key=r1");
    // Header is left as the client sent it
    assert_eq!(req.header("Authorization"), Some("Bearer OTHER"));
}

#[test]
fn test_resolve_bearer_header() {
    let resolver = resolver("https://upstream.example", &["r1", "r2"]);
    let mut req = get("/v1/chat/completions")
        .header("authorization", "Bearer TOK")
        .build()
        .unwrap();

    let resolution = resolver.resolve(&mut req).unwrap();

    assert_eq!(resolution.source, CredentialSource::AuthorizationHeader);
    assert_eq!(req.header("Authorization"), Some("Bearer r1"));
    assert_eq!(req.headers.len(), 2); // Authorization + Host, no stale lowercase copy
    assert_eq!(req.path, "/v1/chat/completions");
}

#[test]
fn test_resolve_authorization_without_bearer_prefix() {
    let resolver = resolver("https://upstream.example", &["r1"]);
    let mut req = get("/").header("Authorization", "TOK").build().unwrap();

    let resolution = resolver.resolve(&mut req).unwrap();

    assert_eq!(resolution.source, CredentialSource::AuthorizationHeader);
    assert_eq!(req.header("Authorization"), Some("Bearer r1"));
}

#[test]
fn test_resolve_bearer_prefix_is_case_sensitive() {
    let resolver = resolver("https://upstream.example", &["r1"]);
    let mut req = get("/").header("Authorization", "bearer TOK").build().unwrap();

    assert_eq!(
        resolver.resolve(&mut req),
        Err(ResolveError::UnknownToken("bear***".to_string()))
    );
}

#[test]
fn test_resolve_vendor_header() {
    let resolver = resolver("https://upstream.example", &["r1"]);
    let mut req = get("/v1beta/models")
        .header("x-goog-api-key", "TOK")
        .build()
        .unwrap();

    let resolution = resolver.resolve(&mut req).unwrap();

    assert_eq!(resolution.source, CredentialSource::VendorHeader);
    assert_eq!(req.header("x-goog-api-key"), Some("r1"));
    assert_eq!(req.header("Authorization"), None);
}

#[test]
fn test_resolve_empty_query_key_falls_back_to_header() {
    let resolver = resolver("https://upstream.example", &["r1"]);
    let mut req = get("/v1/models?key=&alt=sse")
        .header("x-goog-api-key", "TOK")
        .build()
        .unwrap();

    let resolution = resolver.resolve(&mut req).unwrap();

    assert_eq!(resolution.source, CredentialSource::VendorHeader);
    assert_eq!(req.path, "/v1/models?alt=sse");
}

#[test]
fn test_resolve_keeps_other_query_params() {
    let resolver = resolver("https://upstream.example", &["r/1"]);
    let mut req = get("/v1/stream?alt=sse&key=TOK&x=%20y").build().unwrap();

    resolver.resolve(&mut req).unwrap();

    assert_eq!(req.path, "/v1/stream?alt=sse&x=%20y&key=r%2F1");
}

#[test]
fn test_resolve_host_from_authority_with_port_and_path() {
    let resolver = resolver("https://upstream.example:8443/base", &["r1"]);
    let mut req = get("/v1/models")
        .header("Host", "client.example")
        .header("x-goog-api-key", "TOK")
        .build()
        .unwrap();

    let resolution = resolver.resolve(&mut req).unwrap();

    assert_eq!(resolution.authority, "https://upstream.example:8443/base");
    assert_eq!(req.header("Host"), Some("upstream.example:8443"));
}

#[test]
fn test_resolve_absolute_url_without_path() {
    let resolver = resolver("https://upstream.example", &["r1"]);
    let mut req = get("http://client.example:3000?key=TOK").build().unwrap();

    resolver.resolve(&mut req).unwrap();

    assert_eq!(req.path, "/?key=r1");
}

#[test]
fn test_resolve_missing_credential() {
    let resolver = resolver("https://upstream.example", &["r1"]);
    let mut req = get("https://client.example/v1/models?alt=sse").build().unwrap();

    assert_eq!(resolver.resolve(&mut req), Err(ResolveError::MissingCredential));
    // Rejected requests are left untouched
    assert_eq!(req.path, "https://client.example/v1/models?alt=sse");
    assert_eq!(req.header("Host"), None);
}

#[test]
fn test_resolve_unknown_token() {
    let resolver = resolver("https://upstream.example", &["r1"]);
    let mut req = get("/").header("Authorization", "Bearer NOPE").build().unwrap();

    assert!(matches!(resolver.resolve(&mut req), Err(ResolveError::UnknownToken(_))));
    assert_eq!(req.header("Authorization"), Some("Bearer NOPE"));
}

#[test]
fn test_resolve_token_with_empty_credentials_is_unknown() {
    let resolver = resolver("https://upstream.example", &["r1"]);
    let mut req = get("/?key=EMPTY").build().unwrap();

    assert!(matches!(resolver.resolve(&mut req), Err(ResolveError::UnknownToken(_))));
}

#[test]
fn test_resolve_does_not_rotate_on_failure() {
    let resolver = resolver("https://upstream.example", &["r1", "r2"]);

    let mut bad = get("/").build().unwrap();
    assert!(resolver.resolve(&mut bad).is_err());

    let mut good: Request = get("/?key=TOK").build().unwrap();
    resolver.resolve(&mut good).unwrap();
    assert_eq!(good.path, "/?key=r1");
}
