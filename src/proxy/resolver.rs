//! Request resolution
//!
//! Turns an inbound request carrying a client token into an upstream-ready
//! request carrying a real credential. Each rewrite rule is a small function
//! of its own; [`Resolver::resolve`] runs them in a fixed order.

use crate::http::request::Request;
use crate::proxy::registry::{mask, CredentialRegistry};
use std::sync::Arc;
use thiserror::Error;
use url::form_urlencoded;

/// Query parameter that may carry the client token
pub const QUERY_PARAM: &str = "key";

/// Vendor header that may carry the client token
pub const VENDOR_HEADER: &str = "x-goog-api-key";

const BEARER_PREFIX: &str = "Bearer ";

/// Why a request could not be resolved.
///
/// Both kinds produce the same response for the caller; they differ only in
/// the logs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no credential in query, Authorization or x-goog-api-key")]
    MissingCredential,

    #[error("unknown token {0}")]
    UnknownToken(String),
}

/// Where the client token was found; the rotated credential goes back there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Query,
    AuthorizationHeader,
    VendorHeader,
}

/// Result of a successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Upstream origin to forward to
    pub authority: String,
    pub source: CredentialSource,
}

/// Resolves inbound requests against the credential registry
#[derive(Debug, Clone)]
pub struct Resolver {
    registry: Arc<CredentialRegistry>,
}

impl Resolver {
    pub fn new(registry: Arc<CredentialRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve `request` in place and return the authority to forward to.
    ///
    /// On error the request is left untouched.
    pub fn resolve(&self, request: &mut Request) -> Result<Resolution, ResolveError> {
        let target = strip_origin(&request.path);
        let (path, query) = split_query(target);
        let (query_token, query) = match query {
            Some(query) => take_query_param(query, QUERY_PARAM),
            None => (None, String::new()),
        };

        let (token, source) = extract_credential(query_token, request).ok_or_else(|| {
            tracing::warn!(path = %path, "Rejecting request without credential");
            ResolveError::MissingCredential
        })?;

        let entry = self.registry.lookup(&token).ok_or_else(|| {
            tracing::warn!(token = %mask(&token), path = %path, "Rejecting request with unknown token");
            ResolveError::UnknownToken(mask(&token))
        })?;

        let credential = entry.next_credential();

        tracing::debug!(
            token = %mask(&token),
            authority = entry.authority(),
            source = ?source,
            credentials = entry.len(),
            "Resolved request"
        );

        let query = match source {
            CredentialSource::Query => append_query_param(&query, QUERY_PARAM, credential),
            _ => query,
        };
        let path = assemble_target(path, &query);

        match source {
            CredentialSource::Query => {}
            CredentialSource::AuthorizationHeader => {
                request.set_header("Authorization", format!("{}{}", BEARER_PREFIX, credential));
            }
            CredentialSource::VendorHeader => {
                request.set_header(VENDOR_HEADER, credential);
            }
        }

        request.set_header("Host", host_from_authority(entry.authority()));
        request.path = path;

        Ok(Resolution {
            authority: entry.authority().to_string(),
            source,
        })
    }
}

/// Drop a leading `scheme://host[:port]` from an absolute-form target.
///
/// Origin-form targets are returned unchanged.
pub fn strip_origin(target: &str) -> &str {
    let Some((scheme, rest)) = target.split_once("://") else {
        return target;
    };

    let is_scheme = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !is_scheme {
        return target;
    }

    match rest.find(['/', '?']) {
        Some(i) => &rest[i..],
        None => "",
    }
}

/// Split a request target into path and raw query string.
pub fn split_query(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

/// Remove every `name` parameter from `query`.
///
/// Returns the first non-empty decoded value and the remaining query with
/// other pairs kept verbatim and in order.
pub fn take_query_param(query: &str, name: &str) -> (Option<String>, String) {
    let mut value = None;
    let mut kept = Vec::new();

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let key = pair.split_once('=').map(|(k, _)| k).unwrap_or(pair);
        if key != name {
            kept.push(pair);
            continue;
        }

        if value.is_none() {
            value = form_urlencoded::parse(pair.as_bytes())
                .next()
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty());
        }
    }

    (value, kept.join("&"))
}

/// Append `name=value` to a raw query string, encoding the value.
pub fn append_query_param(query: &str, name: &str, value: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(value.as_bytes()).collect();

    if query.is_empty() {
        format!("{}={}", name, encoded)
    } else {
        format!("{}&{}={}", query, name, encoded)
    }
}

/// Pick the client token: query value first, then `Authorization: Bearer`,
/// then the vendor header.
pub fn extract_credential(
    query_token: Option<String>,
    request: &Request,
) -> Option<(String, CredentialSource)> {
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Some((token, CredentialSource::Query));
    }

    if let Some(value) = request.header("Authorization") {
        let value = value.trim();
        let token = value.strip_prefix(BEARER_PREFIX).unwrap_or(value).trim();
        if !token.is_empty() {
            return Some((token.to_string(), CredentialSource::AuthorizationHeader));
        }
    }

    request
        .header(VENDOR_HEADER)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| (v.to_string(), CredentialSource::VendorHeader))
}

/// `host[:port]` of an authority; scheme and any path are dropped.
pub fn host_from_authority(authority: &str) -> &str {
    let rest = authority
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(authority);

    rest.split('/').next().unwrap_or(rest)
}

fn assemble_target(path: &str, query: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };

    if query.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, query)
    }
}
