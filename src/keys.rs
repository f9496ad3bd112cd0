// src/keys.rs

// Request key derivation for the HTTP middleware
use axum::extract::{ConnectInfo, Request};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::KeySource;

/// Derives a rate limit key from a request. An empty key means "don't limit".
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Composite keys longer than this many characters are replaced by a digest
pub const MAX_KEY_LEN: usize = 64;

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// peer address axum recorded via `ConnectInfo`.
pub fn ip_key() -> KeyFn {
    Arc::new(|req: &Request| client_ip(req).unwrap_or_default())
}

fn client_ip(req: &Request) -> Option<String> {
    let headers = req.headers();

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return Some(ip.to_string());
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Value of header `name`, empty if missing or not valid UTF-8
pub fn header_key(name: impl Into<String>) -> KeyFn {
    let name = name.into();
    Arc::new(move |req: &Request| {
        req.headers()
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    })
}

pub fn path_key() -> KeyFn {
    Arc::new(|req: &Request| req.uri().path().to_string())
}

pub fn method_key() -> KeyFn {
    Arc::new(|req: &Request| req.method().as_str().to_string())
}

/// Same key for every request, i.e. one global limit
pub fn static_key(value: impl Into<String>) -> KeyFn {
    let value = value.into();
    Arc::new(move |_: &Request| value.clone())
}

/// Joins the non-empty outputs of `parts` with `:`, hashing the result when it
/// grows past [`MAX_KEY_LEN`].
pub fn composite(parts: Vec<KeyFn>) -> KeyFn {
    Arc::new(move |req: &Request| {
        let values: Vec<String> = parts.iter().map(|part| part(req)).collect();
        composite_key(&values)
    })
}

/// The joining and hashing behind [`composite`], on already-extracted values.
///
/// Empty values are skipped. A joined key of at most [`MAX_KEY_LEN`]
/// characters is returned as is; a longer one becomes the hex encoding of the
/// first 16 bytes of its SHA-256 digest.
pub fn composite_key(values: &[String]) -> String {
    let joined = values
        .iter()
        .filter(|v| !v.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(":");

    if joined.chars().count() <= MAX_KEY_LEN {
        return joined;
    }

    let digest = Sha256::digest(joined.as_bytes());
    hex::encode(&digest[..16])
}

/// Builds the key function a [`KeySource`] describes
pub fn from_source(source: &KeySource) -> KeyFn {
    match source {
        KeySource::Ip => ip_key(),
        KeySource::Path => path_key(),
        KeySource::Method => method_key(),
        KeySource::Header { name } => header_key(name.clone()),
        KeySource::Static { value } => static_key(value.clone()),
        KeySource::Composite { parts } => composite(parts.iter().map(from_source).collect()),
    }
}
